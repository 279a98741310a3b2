mod common;

use common::*;
use gen_mod::{ModuleWriter, Region, flags, seal, stub};
use md64_loader::{
    Error,
    header::{HeaderField, validate},
    host::{CpuClass, CpuFeatures, HostProfile},
};
use rstest::rstest;

fn field_of(err: Error) -> HeaderField {
    match err {
        Error::HeaderInvalid { field, .. } => field,
        other => panic!("expected a header error, got {other:?}"),
    }
}

#[rstest]
fn accepts_reference_module() {
    let image = hello_module();
    let (header, exports) = validate(&image.bytes, &HostProfile::default()).unwrap();
    assert_eq!(header.name(), "HELLO");
    assert_eq!(header.total_size_para, 32);
    assert_eq!(header.resident_size_para, 24);
    assert_eq!(header.cold_size_para, 8);
    assert_eq!(header.cold_range(), 384..512);
    assert!(header.discards_cold());
    let names: Vec<_> = exports.entries().iter().map(|e| e.name.to_string()).collect();
    assert_eq!(names, ["cleanup", "hello", "version"]);
}

#[rstest]
fn every_header_bit_flip_is_rejected() {
    let image = hello_module();
    let host = HostProfile::default();
    for byte in (0..64).filter(|b| !(0x34..0x38).contains(b)) {
        for bit in 0..8 {
            let mut corrupt = image.bytes.clone();
            corrupt[byte] ^= 1 << bit;
            let err = validate(&corrupt, &host).unwrap_err();
            assert!(
                matches!(err, Error::HeaderInvalid { .. }),
                "byte 0x{byte:02x} bit {bit}: {err:?}"
            );
        }
    }
}

#[rstest]
fn body_flip_is_image_corrupt() {
    let image = hello_module();
    let mut corrupt = image.bytes.clone();
    let at = image.offset("hello").unwrap() as usize;
    corrupt[at] ^= 0x01;
    assert!(matches!(
        validate(&corrupt, &HostProfile::default()),
        Err(Error::ImageCorrupt { .. })
    ));
}

#[rstest]
#[case::signature(0x00, b'X', HeaderField::Signature)]
#[case::abi(0x04, 2, HeaderField::AbiVersion)]
fn identity_checks_run_before_checksum(
    #[case] at: usize,
    #[case] value: u8,
    #[case] field: HeaderField,
) {
    let mut bytes = hello_module().bytes;
    bytes[at] = value;
    seal(&mut bytes);
    assert_eq!(
        field_of(validate(&bytes, &HostProfile::default()).unwrap_err()),
        field
    );
}

#[rstest]
#[case::zero_total(0x08, 0)]
#[case::zero_resident(0x0A, 0)]
#[case::resident_below_header(0x0A, 3)]
#[case::cold_exceeds_total(0x0C, 1)]
#[case::over_64k(0x08, 0x1001)]
#[case::alignment_not_power_of_two(0x0E, 3)]
fn inconsistent_sizes(#[case] at: usize, #[case] value: u16) {
    let mut bytes = tiny_module("BAD").bytes;
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    seal(&mut bytes);
    assert_eq!(
        field_of(validate(&bytes, &HostProfile::default()).unwrap_err()),
        HeaderField::Sizes
    );
}

#[rstest]
fn unsorted_exports_are_rejected() {
    let image = ModuleWriter::new("UNSORTED")
        .keep_export_order()
        .export_fn("zeta", &stub::ok(), Region::Resident)
        .export_fn("alpha", &stub::ok(), Region::Resident)
        .build()
        .unwrap();
    assert_eq!(
        field_of(validate(&image.bytes, &HostProfile::default()).unwrap_err()),
        HeaderField::ExportTable
    );
}

#[rstest]
fn resident_entry_in_discardable_region() {
    let image = ModuleWriter::new("BADAPI")
        .flags(flags::DISCARD_COLD)
        .entry(gen_mod::Entry::Api, &stub::ok(), Region::Cold)
        .build()
        .unwrap();
    assert_eq!(
        field_of(validate(&image.bytes, &HostProfile::default()).unwrap_err()),
        HeaderField::EntryPoint
    );
}

#[rstest]
fn isr_flag_needs_an_entry() {
    let image = ModuleWriter::new("NOISR")
        .flags(flags::HAS_ISR)
        .build()
        .unwrap();
    assert_eq!(
        field_of(validate(&image.bytes, &HostProfile::default()).unwrap_err()),
        HeaderField::Flags
    );
}

#[rstest]
#[case::cpu(ModuleWriter::new("FAST").cpu(0x0486), HostProfile::default(), false)]
#[case::cpu_ok(
    ModuleWriter::new("FAST").cpu(0x0486),
    HostProfile::new(CpuClass::I80486, CpuFeatures::empty()),
    true
)]
#[case::feature(ModuleWriter::new("FPU").features(0x0001), HostProfile::default(), false)]
#[case::feature_ok(
    ModuleWriter::new("FPU").features(0x0001),
    HostProfile::new(CpuClass::I80386, CpuFeatures::FPU),
    true
)]
#[case::unknown_feature(
    ModuleWriter::new("ODD").features(0x4000),
    HostProfile::new(CpuClass::PENTIUM, CpuFeatures::all()),
    false
)]
fn host_capabilities(#[case] writer: ModuleWriter, #[case] host: HostProfile, #[case] ok: bool) {
    let image = writer.build().unwrap();
    match validate(&image.bytes, &host) {
        Ok(_) => assert!(ok),
        Err(err) => {
            assert!(!ok);
            assert!(matches!(err, Error::UnsupportedCpuOrFeature { .. }), "{err:?}");
        }
    }
}

#[rstest]
fn file_longer_than_loadable_region() {
    let mut bytes = hello_module().bytes;
    bytes.resize(32 * 16 + 16, 0);
    seal(&mut bytes);
    assert_eq!(
        field_of(validate(&bytes, &HostProfile::default()).unwrap_err()),
        HeaderField::Length
    );
}
