mod common;

use common::*;
use gen_mod::{ModuleWriter, Region, RelocDesc, RelocKind, flags, stub};
use md64_loader::{
    Error, ErrorClass, Loader,
    addr::FarPtr,
    arena::Arena,
    registry::SymbolRegistry,
};
use rstest::rstest;
use std::sync::Arc;

fn read_word(loader: &Loader, base: u16, offset: u16) -> u16 {
    loader.arena().read_u16(FarPtr::new(base, offset)).unwrap()
}

#[rstest]
#[case::same_segment(0)]
#[case::displaced(3)]
#[case::far_displacement(0x0100)]
fn segment_fixups_add_the_base(#[case] delta: u16) {
    let image = ModuleWriter::new("FIXUP")
        .data("far", &[0x34, 0x12, 0x00, 0x00], Region::Resident)
        .data("seg", &[0x00, 0x00], Region::Resident)
        .data("call", &[0x9A, 0x78, 0x56, 0x00, 0x00], Region::Resident)
        .reloc(RelocDesc::at(RelocKind::SegOfs, "far", 0, delta))
        .reloc(RelocDesc::at(RelocKind::Segment, "seg", 0, delta))
        .reloc(RelocDesc::at(RelocKind::RelFar, "call", 1, delta))
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let base = loader.instance(handle).unwrap().base();
    let expected = base.wrapping_add(delta);

    let far = image.offset("far").unwrap();
    assert_eq!(read_word(&loader, base, far), 0x1234);
    assert_eq!(read_word(&loader, base, far + 2), expected);
    assert_eq!(read_word(&loader, base, image.offset("seg").unwrap()), expected);
    let call = image.offset("call").unwrap();
    assert_eq!(read_word(&loader, base, call + 1), 0x5678);
    assert_eq!(read_word(&loader, base, call + 3), expected);
    assert_eq!(loader.instance(handle).unwrap().stats().relocations, 3);
}

#[rstest]
fn offset_relocations_are_checked_only() {
    let image = ModuleWriter::new("OFS")
        .data("word", &[0xCD, 0xAB], Region::Resident)
        .reloc(RelocDesc::at(RelocKind::Offset, "word", 0, 0))
        .reloc(RelocDesc::at(RelocKind::RelNear, "word", 0, 0))
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let base = loader.instance(handle).unwrap().base();
    assert_eq!(read_word(&loader, base, image.offset("word").unwrap()), 0xABCD);
}

#[rstest]
fn symbol_lookups() {
    let mut loader = Loader::new();
    let handle = load(&mut loader, &hello_module()).unwrap();
    let base = loader.instance(handle).unwrap().base();
    let image = hello_module();
    for name in ["cleanup", "hello", "version"] {
        let global = loader.resolve_symbol(name).unwrap();
        assert_eq!(global, FarPtr::new(base, image.offset(name).unwrap()));
        assert_eq!(loader.lookup_export(handle, name).unwrap(), global);
    }
    assert!(matches!(
        loader.resolve_symbol("nonexistent"),
        Err(Error::SymbolNotFound { .. })
    ));
    assert!(matches!(
        loader.lookup_export(handle, "nonexistent"),
        Err(Error::SymbolNotFound { .. })
    ));
    assert!(loader.resolve_symbol("averylongname").is_err());
}

#[rstest]
fn imports_bind_to_published_exports() {
    let mut loader = Loader::new();
    load(&mut loader, &hello_module()).unwrap();
    let client_image = client_module();
    let client = load(&mut loader, &client_image).unwrap();
    let base = loader.instance(client).unwrap().base();
    let hello = loader.resolve_symbol("hello").unwrap();

    let mut slot = [0u8; 4];
    loader
        .arena()
        .read(
            FarPtr::new(base, client_image.offset("hello_p").unwrap()),
            &mut slot,
        )
        .unwrap();
    assert_eq!(slot, hello.to_le_bytes());
    assert_eq!(loader.call_api(client, 0).unwrap().ax, 0);
}

#[rstest]
fn unresolved_import_fails_linkage() {
    let mut loader = Loader::new();
    let err = load(&mut loader, &client_module()).unwrap_err();
    assert!(matches!(err, Error::SymbolNotFound { ref name } if name == "hello"));
    assert_eq!(err.class(), ErrorClass::Linkage);
    assert_eq!(loader.arena().used_bytes(), 0);
}

#[rstest]
fn loaders_share_a_registry() {
    let registry = Arc::new(SymbolRegistry::new());
    let mut provider = Loader::new().with_registry(registry.clone());
    let mut consumer = Loader::new().with_registry(registry.clone());
    load(&mut provider, &hello_module()).unwrap();
    assert!(consumer.resolve_symbol("version").is_ok());
    assert_eq!(registry.len(), 3);
    let client = load(&mut consumer, &client_module()).unwrap();
    consumer.unload_module(client).unwrap();
    assert_eq!(registry.len(), 3);
}

#[rstest]
fn shared_registry_keeps_handles_apart() {
    let registry = Arc::new(SymbolRegistry::new());
    let mut provider = Loader::new().with_registry(registry.clone());
    let mut consumer = Loader::new().with_registry(registry.clone());
    let hello = load(&mut provider, &hello_module()).unwrap();
    let tiny = load(&mut consumer, &tiny_module("TINY")).unwrap();
    assert_ne!(hello, tiny);
    consumer.unload_module(tiny).unwrap();
    assert_eq!(registry.len(), 3);
    let addr = consumer.resolve_symbol("hello").unwrap();
    assert_eq!(provider.invoke(addr).unwrap().ax, HELLO_AX);
}

#[rstest]
fn full_symbol_table_rolls_back() {
    let registry = Arc::new(SymbolRegistry::with_capacity(4));
    let mut loader = Loader::new().with_registry(registry.clone());
    load(&mut loader, &hello_module()).unwrap();
    let err = load(&mut loader, &hello_module()).unwrap_err();
    assert!(matches!(err, Error::SymbolTableFull { capacity: 4 }));
    assert_eq!(registry.len(), 3);
    assert_eq!(loader.modules().len(), 1);
    assert_eq!(loader.arena().used_bytes(), 24 * 16);
}

#[rstest]
fn api_entry_receives_calls() {
    let image = ModuleWriter::new("API")
        .api(&stub::ret_dx_ax(0x0002, 0x0003))
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    assert_eq!(loader.call_api(handle, 1).unwrap().value(), 0x0002_0003);

    let plain = load(&mut loader, &tiny_module("PLAIN")).unwrap();
    assert!(matches!(
        loader.call_api(plain, 1),
        Err(Error::InvalidState { .. })
    ));
}

#[rstest]
fn isr_entry_is_reported_not_installed() {
    let image = ModuleWriter::new("IRQ")
        .entry(gen_mod::Entry::Isr, &[0xCF], Region::Resident)
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let instance = loader.instance(handle).unwrap();
    assert!(instance.header().flags.bits() & flags::HAS_ISR != 0);
    assert_eq!(
        instance.isr_entry(),
        Some(FarPtr::new(instance.base(), image.offset("@isr").unwrap()))
    );
}
