//! Parsing and validation of the 64-byte module header.
//!
//! [`validate`] runs the checks in a fixed order and stops at the first
//! violation, so the error always names the earliest broken rule:
//! signature, ABI version, header checksum, size fields and table placement,
//! host CPU and features, and finally the body checksum.

use crate::{
    Error, Result,
    addr::para_to_bytes,
    error::{header_error, unsupported_error},
    host::{CpuClass, HostProfile},
    symbol::ExportTable,
};
use alloc::format;
use bitflags::bitflags;
use core::ops::Range;

/// Size of the module header in bytes.
pub const HEADER_SIZE: usize = 64;
/// Required signature at offset 0.
pub const SIGNATURE: [u8; 4] = *b"MD64";
/// Newest ABI version this runtime understands.
pub const ABI_VERSION: u8 = 1;
/// Oldest ABI version this runtime still accepts.
pub const MIN_ABI_VERSION: u8 = 1;
/// Largest module the 16-bit offsets of the format can address.
pub const MAX_TOTAL_PARA: u16 = 0x1000;

const HEADER_CHECKSUM_AT: usize = 0x34;
const IMAGE_CHECKSUM_AT: usize = 0x36;

/// Header fields named by [`Error::HeaderInvalid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderField {
    /// The buffer is shorter than a header, or the file length is inconsistent.
    Length,
    Signature,
    AbiVersion,
    HeaderChecksum,
    /// `total`, `resident`, `cold`, `bss` or `alignment` sizes.
    Sizes,
    EntryPoint,
    Flags,
    ExportTable,
    RelocationTable,
}

bitflags! {
    /// Module flag bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ModuleFlags: u16 {
        /// The cold region may be reclaimed once init succeeds.
        const DISCARD_COLD = 0x0001;
        /// The module provides an interrupt handler.
        const HAS_ISR = 0x0002;
        const NEEDS_DMA_SAFE = 0x0004;
        const XMS_OPTIONAL = 0x0008;
        /// The module patches its own code after load.
        const SMC_USED = 0x0010;
        const NEEDS_TIMER = 0x0020;
        const PCMCIA_AWARE = 0x0040;
        const PCI_AWARE = 0x0080;
    }
}

/// Module type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleType {
    Nic,
    Service,
    Feature,
    Diagnostic,
    Other(u8),
}

impl From<u8> for ModuleType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => ModuleType::Nic,
            0x02 => ModuleType::Service,
            0x03 => ModuleType::Feature,
            0x04 => ModuleType::Diagnostic,
            other => ModuleType::Other(other),
        }
    }
}

/// The parsed, immutable module header.
///
/// All offsets are relative to the module base; sizes ending in `_para` are
/// counted in 16-byte paragraphs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleHeader {
    pub abi_version: u8,
    pub module_type: ModuleType,
    pub flags: ModuleFlags,
    /// Flag bits as stored, including ones without a name.
    pub raw_flags: u16,
    pub total_size_para: u16,
    pub resident_size_para: u16,
    pub cold_size_para: u16,
    pub alignment_para: u16,
    pub init_offset: u16,
    pub api_offset: u16,
    pub isr_offset: u16,
    pub unload_offset: u16,
    pub export_table_offset: u16,
    pub export_count: u16,
    pub reloc_table_offset: u16,
    pub reloc_count: u16,
    pub bss_size_para: u16,
    pub required_cpu: CpuClass,
    pub required_features: u16,
    pub module_id: u16,
    pub name: [u8; 11],
    pub header_checksum: u16,
    pub image_checksum: u16,
    pub vendor_id: u32,
    pub build_timestamp: u32,
}

#[inline]
fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl ModuleHeader {
    /// Decodes the header fields without validating them.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(header_error(
                HeaderField::Length,
                format!("{} bytes is shorter than a module header", bytes.len()),
            ));
        }
        let mut name = [0u8; 11];
        name.copy_from_slice(&bytes[0x28..0x33]);
        let raw_flags = u16_at(bytes, 0x06);
        Ok(Self {
            abi_version: bytes[0x04],
            module_type: ModuleType::from(bytes[0x05]),
            flags: ModuleFlags::from_bits_truncate(raw_flags),
            raw_flags,
            total_size_para: u16_at(bytes, 0x08),
            resident_size_para: u16_at(bytes, 0x0A),
            cold_size_para: u16_at(bytes, 0x0C),
            alignment_para: u16_at(bytes, 0x0E),
            init_offset: u16_at(bytes, 0x10),
            api_offset: u16_at(bytes, 0x12),
            isr_offset: u16_at(bytes, 0x14),
            unload_offset: u16_at(bytes, 0x16),
            export_table_offset: u16_at(bytes, 0x18),
            export_count: u16_at(bytes, 0x1A),
            reloc_table_offset: u16_at(bytes, 0x1C),
            reloc_count: u16_at(bytes, 0x1E),
            bss_size_para: u16_at(bytes, 0x20),
            required_cpu: CpuClass(u16_at(bytes, 0x22)),
            required_features: u16_at(bytes, 0x24),
            module_id: u16_at(bytes, 0x26),
            name,
            header_checksum: u16_at(bytes, HEADER_CHECKSUM_AT),
            image_checksum: u16_at(bytes, IMAGE_CHECKSUM_AT),
            vendor_id: u32_at(bytes, 0x38),
            build_timestamp: u32_at(bytes, 0x3C),
        })
    }

    /// The module name with its NUL padding removed.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(11);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// Size of the whole reservation in bytes.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        para_to_bytes(self.total_size_para)
    }

    /// Byte range of the resident region.
    #[inline]
    pub fn resident_range(&self) -> Range<usize> {
        0..para_to_bytes(self.resident_size_para)
    }

    /// Byte range of the cold (discardable) region.
    #[inline]
    pub fn cold_range(&self) -> Range<usize> {
        let start = para_to_bytes(self.resident_size_para);
        start..start + para_to_bytes(self.cold_size_para)
    }

    /// Byte range of the zero-initialised region at the end of the reservation.
    #[inline]
    pub fn bss_range(&self) -> Range<usize> {
        let total = self.total_bytes();
        total - para_to_bytes(self.bss_size_para)..total
    }

    /// Required alignment of the base selector, in bytes.
    #[inline]
    pub fn alignment_bytes(&self) -> usize {
        para_to_bytes(self.alignment_para.max(1))
    }

    /// Whether the cold region is reclaimed after a successful init.
    #[inline]
    pub fn discards_cold(&self) -> bool {
        self.flags.contains(ModuleFlags::DISCARD_COLD) && self.cold_size_para > 0
    }

    #[inline]
    fn entry(offset: u16) -> Option<u16> {
        (offset != 0).then_some(offset)
    }

    pub fn init_entry(&self) -> Option<u16> {
        Self::entry(self.init_offset)
    }

    pub fn api_entry(&self) -> Option<u16> {
        Self::entry(self.api_offset)
    }

    pub fn isr_entry(&self) -> Option<u16> {
        Self::entry(self.isr_offset)
    }

    pub fn unload_entry(&self) -> Option<u16> {
        Self::entry(self.unload_offset)
    }
}

/// 16-bit two's complement of the byte sum.
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
        .wrapping_neg()
}

/// Checksum of the first 64 bytes with both checksum fields taken as zero.
pub fn header_checksum(bytes: &[u8]) -> u16 {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&bytes[..HEADER_SIZE]);
    header[HEADER_CHECKSUM_AT..IMAGE_CHECKSUM_AT + 2].fill(0);
    checksum16(&header)
}

/// Checksum of everything after the header.
#[inline]
pub fn image_checksum(image: &[u8]) -> u16 {
    checksum16(&image[HEADER_SIZE.min(image.len())..])
}

/// Validates `image` for `host` and returns its header and export table.
///
/// This has no side effects; nothing is allocated outside the returned values.
pub fn validate(image: &[u8], host: &HostProfile) -> Result<(ModuleHeader, ExportTable)> {
    let header = ModuleHeader::parse(image)?;

    if image[..4] != SIGNATURE {
        return Err(header_error(HeaderField::Signature, "bad signature"));
    }

    if !(MIN_ABI_VERSION..=ABI_VERSION).contains(&header.abi_version) {
        return Err(header_error(
            HeaderField::AbiVersion,
            format!(
                "ABI version {} is outside {}..={}",
                header.abi_version, MIN_ABI_VERSION, ABI_VERSION
            ),
        ));
    }

    let computed = header_checksum(image);
    if computed != header.header_checksum {
        return Err(header_error(
            HeaderField::HeaderChecksum,
            format!(
                "stored 0x{:04x}, computed 0x{:04x}",
                header.header_checksum, computed
            ),
        ));
    }

    check_layout(&header, image.len())?;
    let exports = check_tables(&header, image)?;

    if !host.supports_cpu(header.required_cpu) {
        return Err(unsupported_error(format!(
            "module requires a {} CPU, host is a {}",
            header.required_cpu, host.cpu
        )));
    }
    if !host.supports_features(header.required_features) {
        return Err(unsupported_error(format!(
            "module requires features 0x{:04x}, host has 0x{:04x}",
            header.required_features,
            host.features.bits()
        )));
    }

    let actual = image_checksum(image);
    if actual != header.image_checksum {
        return Err(Error::ImageCorrupt {
            expected: header.image_checksum,
            actual,
        });
    }

    Ok((header, exports))
}

fn check_layout(header: &ModuleHeader, file_len: usize) -> Result<()> {
    let total = header.total_size_para as u32;
    if total == 0 || header.resident_size_para == 0 {
        return Err(header_error(
            HeaderField::Sizes,
            "total and resident sizes must be non-zero",
        ));
    }
    if header.total_size_para > MAX_TOTAL_PARA {
        return Err(header_error(
            HeaderField::Sizes,
            format!("total size {} paragraphs exceeds 64 KiB", total),
        ));
    }
    if para_to_bytes(header.resident_size_para) < HEADER_SIZE {
        return Err(header_error(
            HeaderField::Sizes,
            "resident region cannot hold the header",
        ));
    }
    let used = header.resident_size_para as u32
        + header.cold_size_para as u32
        + header.bss_size_para as u32;
    if used > total {
        return Err(header_error(
            HeaderField::Sizes,
            format!(
                "resident {} + cold {} + bss {} exceeds total {}",
                header.resident_size_para, header.cold_size_para, header.bss_size_para, total
            ),
        ));
    }
    if !header.alignment_para.max(1).is_power_of_two() {
        return Err(header_error(
            HeaderField::Sizes,
            format!("alignment {} is not a power of two", header.alignment_para),
        ));
    }
    let loadable = para_to_bytes(header.total_size_para - header.bss_size_para);
    if file_len > loadable {
        return Err(header_error(
            HeaderField::Length,
            format!("file is {file_len} bytes but only {loadable} bytes precede the BSS"),
        ));
    }

    let limit = header.total_bytes();
    let cold = header.cold_range();
    let entries = [
        ("init", header.init_entry(), false),
        ("api", header.api_entry(), true),
        ("isr", header.isr_entry(), true),
        ("unload", header.unload_entry(), true),
    ];
    for (name, entry, resident) in entries {
        let Some(offset) = entry.map(|o| o as usize) else {
            continue;
        };
        if offset < HEADER_SIZE || offset >= limit {
            return Err(header_error(
                HeaderField::EntryPoint,
                format!("{name} entry 0x{offset:04x} is outside the module"),
            ));
        }
        // entry points used after init must survive the cold discard
        if resident && header.discards_cold() && cold.contains(&offset) {
            return Err(header_error(
                HeaderField::EntryPoint,
                format!("{name} entry 0x{offset:04x} lies in the discardable region"),
            ));
        }
    }
    if header.flags.contains(ModuleFlags::HAS_ISR) && header.isr_entry().is_none() {
        return Err(header_error(
            HeaderField::Flags,
            "HAS_ISR is set but no interrupt entry is given",
        ));
    }
    Ok(())
}

fn table_range(
    field: HeaderField,
    offset: u16,
    count: u16,
    entry_size: usize,
    file_len: usize,
) -> Result<Range<usize>> {
    let start = offset as usize;
    let end = start + count as usize * entry_size;
    if count > 0 && (start < HEADER_SIZE || end > file_len) {
        return Err(header_error(
            field,
            format!("table 0x{start:04x}..0x{end:04x} is outside the {file_len} file bytes"),
        ));
    }
    Ok(start..end)
}

fn check_tables(header: &ModuleHeader, image: &[u8]) -> Result<ExportTable> {
    table_range(
        HeaderField::RelocationTable,
        header.reloc_table_offset,
        header.reloc_count,
        crate::relocation::RELOC_ENTRY_SIZE,
        image.len(),
    )?;
    let range = table_range(
        HeaderField::ExportTable,
        header.export_table_offset,
        header.export_count,
        crate::symbol::EXPORT_ENTRY_SIZE,
        image.len(),
    )?;
    let exports = ExportTable::parse(&image[range]);
    if let Some(idx) = exports.first_unsorted() {
        return Err(header_error(
            HeaderField::ExportTable,
            format!(
                "export #{} ({}) is not ordered after {}",
                idx,
                exports.entries()[idx].name,
                exports.entries()[idx - 1].name
            ),
        ));
    }
    let limit = header.total_bytes();
    if let Some(entry) = exports
        .entries()
        .iter()
        .find(|entry| entry.offset as usize >= limit)
    {
        return Err(header_error(
            HeaderField::ExportTable,
            format!("export {} at 0x{:04x} is outside the module", entry.name, entry.offset),
        ));
    }
    Ok(exports)
}
