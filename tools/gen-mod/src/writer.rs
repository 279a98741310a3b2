use crate::common::{Entry, ExportDesc, Region, RelocDesc, Target, flags};
use anyhow::{Result, bail};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::path::Path;

const HEADER_SIZE: usize = 64;
const EXPORT_ENTRY_SIZE: usize = 12;
const RELOC_ENTRY_SIZE: usize = 6;
const NAME_LEN: usize = 8;
const HEADER_CHECKSUM_AT: usize = 0x34;
const IMAGE_CHECKSUM_AT: usize = 0x36;

/// 16-bit two's complement of the byte sum.
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
        .wrapping_neg()
}

/// Recomputes both checksums of an image in place.
///
/// Tests that tamper with header fields call this afterwards so only the
/// intended check fails.
pub fn seal(image: &mut [u8]) {
    let body = checksum16(&image[HEADER_SIZE..]);
    image[IMAGE_CHECKSUM_AT..IMAGE_CHECKSUM_AT + 2].copy_from_slice(&body.to_le_bytes());
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&image[..HEADER_SIZE]);
    header[HEADER_CHECKSUM_AT..IMAGE_CHECKSUM_AT + 2].fill(0);
    let head = checksum16(&header);
    image[HEADER_CHECKSUM_AT..HEADER_CHECKSUM_AT + 2].copy_from_slice(&head.to_le_bytes());
}

struct Blob {
    label: String,
    bytes: Vec<u8>,
    region: Region,
}

/// A generated image together with its layout.
#[derive(Clone, Debug)]
pub struct ModuleImage {
    pub bytes: Vec<u8>,
    pub labels: BTreeMap<String, u16>,
    pub total_para: u16,
    pub resident_para: u16,
    pub cold_para: u16,
    pub bss_para: u16,
}

impl ModuleImage {
    /// Image offset of a labelled blob. Exports are labelled by their name,
    /// entry points as `@init`, `@api`, `@isr` and `@unload`.
    pub fn offset(&self, label: &str) -> Option<u16> {
        self.labels.get(label).copied()
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}

/// Builder for module images.
///
/// Layout: header, export table, relocation table, import names, resident
/// blobs, then cold blobs starting at the resident boundary. The BSS takes no
/// file bytes.
pub struct ModuleWriter {
    name: String,
    module_type: u8,
    flags: u16,
    abi_version: u8,
    cpu: u16,
    features: u16,
    module_id: u16,
    vendor_id: u32,
    build_timestamp: u32,
    alignment_para: u16,
    total_para: Option<u16>,
    resident_para: Option<u16>,
    cold_para: Option<u16>,
    bss_para: u16,
    blobs: Vec<Blob>,
    entries: Vec<Entry>,
    exports: Vec<ExportDesc>,
    relocs: Vec<RelocDesc>,
    sort_exports: bool,
}

impl ModuleWriter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            module_type: 0x03,
            flags: 0,
            abi_version: 1,
            cpu: 0x0086,
            features: 0,
            module_id: 0,
            vendor_id: 0,
            build_timestamp: 0,
            alignment_para: 1,
            total_para: None,
            resident_para: None,
            cold_para: None,
            bss_para: 0,
            blobs: Vec::new(),
            entries: Vec::new(),
            exports: Vec::new(),
            relocs: Vec::new(),
            sort_exports: true,
        }
    }

    pub fn module_type(mut self, module_type: u8) -> Self {
        self.module_type = module_type;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn abi_version(mut self, abi_version: u8) -> Self {
        self.abi_version = abi_version;
        self
    }

    pub fn cpu(mut self, cpu: u16) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn features(mut self, features: u16) -> Self {
        self.features = features;
        self
    }

    pub fn module_id(mut self, module_id: u16) -> Self {
        self.module_id = module_id;
        self
    }

    pub fn vendor(mut self, vendor_id: u32, build_timestamp: u32) -> Self {
        self.vendor_id = vendor_id;
        self.build_timestamp = build_timestamp;
        self
    }

    pub fn alignment(mut self, alignment_para: u16) -> Self {
        self.alignment_para = alignment_para;
        self
    }

    /// Fixes the size fields instead of deriving them from the content.
    /// Each value must be at least what the content needs.
    pub fn sizes(mut self, total: u16, resident: u16, cold: u16) -> Self {
        self.total_para = Some(total);
        self.resident_para = Some(resident);
        self.cold_para = Some(cold);
        self
    }

    pub fn bss(mut self, bss_para: u16) -> Self {
        self.bss_para = bss_para;
        self
    }

    /// Writes exports in insertion order instead of sorting them by name.
    pub fn keep_export_order(mut self) -> Self {
        self.sort_exports = false;
        self
    }

    /// Adds a labelled blob.
    pub fn data(mut self, label: &str, bytes: &[u8], region: Region) -> Self {
        self.blobs.push(Blob {
            label: label.to_string(),
            bytes: bytes.to_vec(),
            region,
        });
        self
    }

    /// Places `code` and points an entry at it.
    pub fn entry(mut self, entry: Entry, code: &[u8], region: Region) -> Self {
        self.entries.push(entry);
        if entry == Entry::Isr {
            self.flags |= flags::HAS_ISR;
        }
        self.data(entry.label(), code, region)
    }

    /// Init code, placed in the cold region.
    pub fn init(self, code: &[u8]) -> Self {
        self.entry(Entry::Init, code, Region::Cold)
    }

    pub fn api(self, code: &[u8]) -> Self {
        self.entry(Entry::Api, code, Region::Resident)
    }

    pub fn unload(self, code: &[u8]) -> Self {
        self.entry(Entry::Unload, code, Region::Resident)
    }

    /// Exports a far function whose code lives in `region`.
    pub fn export_fn(self, name: &str, code: &[u8], region: Region) -> Self {
        self.data(name, code, region).export_label(
            name,
            name,
            flags::SYM_FUNCTION | flags::SYM_FAR_CALL,
        )
    }

    /// Exports a resident data blob.
    pub fn export_data(self, name: &str, bytes: &[u8]) -> Self {
        self.data(name, bytes, Region::Resident)
            .export_label(name, name, flags::SYM_DATA)
    }

    /// Exports an existing label under `name`.
    pub fn export_label(mut self, name: &str, label: &str, sym_flags: u16) -> Self {
        self.exports.push(ExportDesc {
            name: name.to_string(),
            target: Target::Label(label.to_string(), 0),
            flags: sym_flags,
        });
        self
    }

    /// Exports a raw offset, unchecked.
    pub fn export_raw(mut self, name: &str, offset: u16, sym_flags: u16) -> Self {
        self.exports.push(ExportDesc {
            name: name.to_string(),
            target: Target::Offset(offset),
            flags: sym_flags,
        });
        self
    }

    pub fn reloc(mut self, reloc: RelocDesc) -> Self {
        self.relocs.push(reloc);
        self
    }

    /// Lays the module out and returns the sealed image.
    pub fn build(&self) -> Result<ModuleImage> {
        let mut exports = self.exports.clone();
        if self.sort_exports {
            exports.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        }
        let mut imports: Vec<String> = Vec::new();
        for reloc in &self.relocs {
            if let Some(name) = &reloc.import {
                if !imports.contains(name) {
                    imports.push(name.clone());
                }
            }
        }

        let export_at = HEADER_SIZE;
        let reloc_at = export_at + exports.len() * EXPORT_ENTRY_SIZE;
        let names_at = reloc_at + self.relocs.len() * RELOC_ENTRY_SIZE;
        let mut labels = BTreeMap::new();
        for (idx, name) in imports.iter().enumerate() {
            labels.insert(format!("@import:{name}"), (names_at + idx * NAME_LEN) as u16);
        }

        let mut cursor = names_at + imports.len() * NAME_LEN;
        for blob in self.blobs.iter().filter(|b| b.region == Region::Resident) {
            labels.insert(blob.label.clone(), cursor as u16);
            cursor += blob.bytes.len();
        }
        let resident_end = cursor;
        let resident_need = cursor.div_ceil(16).max(4) as u16;
        let resident_para = self.resident_para.unwrap_or(resident_need);
        if resident_para < resident_need {
            bail!("resident content needs {resident_need} paragraphs, {resident_para} given");
        }

        let cold_start = resident_para as usize * 16;
        cursor = cold_start;
        for blob in self.blobs.iter().filter(|b| b.region == Region::Cold) {
            labels.insert(blob.label.clone(), cursor as u16);
            cursor += blob.bytes.len();
        }
        let cold_need = (cursor - cold_start).div_ceil(16) as u16;
        let cold_para = self.cold_para.unwrap_or(cold_need);
        if cold_para < cold_need {
            bail!("cold content needs {cold_need} paragraphs, {cold_para} given");
        }
        let file_len = if cursor > cold_start {
            cursor
        } else {
            resident_end
        };

        let total_need = resident_para + cold_para + self.bss_para;
        let total_para = self.total_para.unwrap_or(total_need);
        if total_para < total_need {
            bail!("regions need {total_need} paragraphs, {total_para} given");
        }

        let mut bytes = vec![0u8; file_len.max(HEADER_SIZE)];
        for blob in &self.blobs {
            let at = labels[&blob.label] as usize;
            bytes[at..at + blob.bytes.len()].copy_from_slice(&blob.bytes);
        }
        for (idx, name) in imports.iter().enumerate() {
            let at = names_at + idx * NAME_LEN;
            write_name(&mut bytes[at..at + NAME_LEN], name)?;
        }

        let mut table = Vec::new();
        for export in &exports {
            let mut name = [0u8; NAME_LEN];
            write_name(&mut name, &export.name)?;
            table.extend_from_slice(&name);
            table.write_u16::<LittleEndian>(resolve(&labels, &export.target)?)?;
            table.write_u16::<LittleEndian>(export.flags)?;
        }
        for reloc in &self.relocs {
            let aux = match &reloc.import {
                Some(name) => labels[&format!("@import:{name}")],
                None => reloc.aux,
            };
            table.write_u8(reloc.kind.tag())?;
            table.write_u8(0)?;
            table.write_u16::<LittleEndian>(resolve(&labels, &reloc.target)?)?;
            table.write_u16::<LittleEndian>(aux)?;
        }
        bytes[export_at..names_at].copy_from_slice(&table);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(b"MD64");
        header.write_u8(self.abi_version)?;
        header.write_u8(self.module_type)?;
        header.write_u16::<LittleEndian>(self.flags)?;
        header.write_u16::<LittleEndian>(total_para)?;
        header.write_u16::<LittleEndian>(resident_para)?;
        header.write_u16::<LittleEndian>(cold_para)?;
        header.write_u16::<LittleEndian>(self.alignment_para)?;
        for entry in [Entry::Init, Entry::Api, Entry::Isr, Entry::Unload] {
            let offset = if self.entries.contains(&entry) {
                labels[entry.label()]
            } else {
                0
            };
            debug_assert_eq!(header.len(), entry.header_offset());
            header.write_u16::<LittleEndian>(offset)?;
        }
        header.write_u16::<LittleEndian>(if exports.is_empty() { 0 } else { export_at as u16 })?;
        header.write_u16::<LittleEndian>(exports.len() as u16)?;
        header.write_u16::<LittleEndian>(if self.relocs.is_empty() { 0 } else { reloc_at as u16 })?;
        header.write_u16::<LittleEndian>(self.relocs.len() as u16)?;
        header.write_u16::<LittleEndian>(self.bss_para)?;
        header.write_u16::<LittleEndian>(self.cpu)?;
        header.write_u16::<LittleEndian>(self.features)?;
        header.write_u16::<LittleEndian>(self.module_id)?;
        let mut name = [0u8; 12];
        let raw = self.name.as_bytes();
        if raw.len() > 11 {
            bail!("module name {:?} is longer than 11 bytes", self.name);
        }
        name[..raw.len()].copy_from_slice(raw);
        header.extend_from_slice(&name);
        header.write_u16::<LittleEndian>(0)?;
        header.write_u16::<LittleEndian>(0)?;
        header.write_u32::<LittleEndian>(self.vendor_id)?;
        header.write_u32::<LittleEndian>(self.build_timestamp)?;
        debug_assert_eq!(header.len(), HEADER_SIZE);
        bytes[..HEADER_SIZE].copy_from_slice(&header);
        seal(&mut bytes);

        Ok(ModuleImage {
            bytes,
            labels,
            total_para,
            resident_para,
            cold_para,
            bss_para: self.bss_para,
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<ModuleImage> {
        let image = self.build()?;
        image.write_file(path)?;
        Ok(image)
    }
}

fn write_name(dst: &mut [u8], name: &str) -> Result<()> {
    let raw = name.as_bytes();
    if raw.is_empty() || raw.len() > NAME_LEN {
        bail!("symbol name {name:?} must be 1..=8 bytes");
    }
    dst.fill(0);
    dst[..raw.len()].copy_from_slice(raw);
    Ok(())
}

fn resolve(labels: &BTreeMap<String, u16>, target: &Target) -> Result<u16> {
    match target {
        Target::Offset(offset) => Ok(*offset),
        Target::Label(label, delta) => match labels.get(label) {
            Some(at) => Ok(at + delta),
            None => bail!("unknown label {label:?}"),
        },
    }
}
