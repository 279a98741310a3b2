mod common;

use common::*;
use gen_mod::{ModuleWriter, Region, flags, stub};
use md64_loader::{
    Error, ErrorClass, Loader, ModuleState,
    arena::Arena,
    lifecycle::DISPATCH_FAULT,
};
use rstest::rstest;

#[rstest]
fn cold_region_is_reclaimed_exactly() {
    let mut loader = Loader::new().with_auto_discard(false);
    let image = hello_with_cold_export();
    let handle = load(&mut loader, &image).unwrap();
    assert_eq!(
        loader.instance(handle).unwrap().state(),
        ModuleState::Resident
    );
    assert_eq!(loader.arena().used_bytes(), 32 * 16);
    let setup = loader.resolve_symbol("setup").unwrap();
    assert!(loader.invoke(setup).is_ok());

    assert_eq!(loader.discard_cold(handle).unwrap(), 8 * 16);
    assert_eq!(loader.arena().used_bytes(), 24 * 16);
    assert_eq!(loader.stats().cold_bytes_reclaimed, 8 * 16);

    let instance = loader.instance(handle).unwrap();
    assert_eq!(instance.state(), ModuleState::ColdDiscarded);
    assert_eq!(instance.export_address("setup"), None);
    assert!(loader.resolve_symbol("setup").is_err());
    assert!(loader.lookup_export(handle, "setup").is_err());
    assert!(loader.invoke(setup).is_err());
    assert!(loader.resolve_symbol("hello").is_ok());

    assert!(matches!(
        loader.discard_cold(handle),
        Err(Error::InvalidState { .. })
    ));
    loader.unload_module(handle).unwrap();
    assert_eq!(loader.arena().used_bytes(), 0);
}

#[rstest]
fn auto_discard_follows_the_flag() {
    let mut loader = Loader::new();
    let keep = ModuleWriter::new("KEEP")
        .sizes(32, 24, 8)
        .export_fn("hello", &stub::ok(), Region::Resident)
        .init(&stub::ok())
        .build()
        .unwrap();
    let handle = load(&mut loader, &keep).unwrap();
    let instance = loader.instance(handle).unwrap();
    assert_eq!(instance.state(), ModuleState::Resident);
    assert!(!instance.is_cold_reclaimed());
    assert_eq!(loader.arena().used_bytes(), 32 * 16);

    let discard = load(&mut loader, &hello_with_cold_export()).unwrap();
    assert_eq!(
        loader.instance(discard).unwrap().state(),
        ModuleState::ColdDiscarded
    );
    assert!(loader.resolve_symbol("setup").is_err());
}

#[rstest]
fn failing_cleanup_still_releases() {
    let image = ModuleWriter::new("GRUMPY")
        .export_fn("hello", &stub::ok(), Region::Resident)
        .unload(&stub::fail(3))
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let err = loader.unload_module(handle).unwrap_err();
    assert!(matches!(err, Error::UnloadFailed { status: 3 }));
    assert!(err.is_non_fatal());
    assert_eq!(err.class(), ErrorClass::Behavioral);
    assert_eq!(loader.arena().used_bytes(), 0);
    assert!(loader.instance(handle).is_none());
    assert!(loader.resolve_symbol("hello").is_err());
    assert_eq!(loader.stats().unloads, 1);
}

#[rstest]
fn crashing_cleanup_reports_unload_failure() {
    // int 21h is outside the supported instruction set
    let image = ModuleWriter::new("CRASHY")
        .export_fn("hello", &stub::ok(), Region::Resident)
        .unload(&[0xCD, 0x21])
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let err = loader.unload_module(handle).unwrap_err();
    assert!(
        matches!(err, Error::UnloadFailed { status: DISPATCH_FAULT }),
        "{err:?}"
    );
    assert!(err.is_non_fatal());
    assert_eq!(loader.arena().used_bytes(), 0);
    assert!(loader.resolve_symbol("hello").is_err());
}

#[rstest]
fn unload_rejects_unknown_handles() {
    let mut loader = Loader::new();
    let handle = load(&mut loader, &hello_module()).unwrap();
    loader.unload_module(handle).unwrap();
    assert!(matches!(
        loader.unload_module(handle),
        Err(Error::InvalidState { .. })
    ));
}

#[rstest]
fn handles_are_not_reused() {
    let mut loader = Loader::new();
    let first = load(&mut loader, &hello_module()).unwrap();
    loader.unload_module(first).unwrap();
    let second = load(&mut loader, &hello_module()).unwrap();
    assert_ne!(first, second);
    assert!(loader.instance(first).is_none());
}

#[rstest]
fn shutdown_unloads_newest_first_and_reports_first_error() {
    let grumpy = ModuleWriter::new("GRUMPY")
        .unload(&stub::fail(9))
        .build()
        .unwrap();
    let mut loader = Loader::new();
    load(&mut loader, &grumpy).unwrap();
    load(&mut loader, &hello_module()).unwrap();
    load(&mut loader, &client_module()).unwrap();
    let err = loader.shutdown().unwrap_err();
    assert!(matches!(err, Error::UnloadFailed { status: 9 }));
    assert_eq!(loader.arena().used_bytes(), 0);
    assert_eq!(loader.stats().unloads, 3);
    assert!(loader.registry().is_empty());
}

#[rstest]
fn manual_discard_needs_the_flag() {
    let image = ModuleWriter::new("KEEP")
        .sizes(32, 24, 8)
        .init(&stub::ok())
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    assert!(matches!(
        loader.discard_cold(handle),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(
        loader.instance(handle).unwrap().state(),
        ModuleState::Resident
    );
    assert_eq!(loader.arena().used_bytes(), 32 * 16);
}

#[rstest]
fn discard_flag_without_cold_region() {
    let image = ModuleWriter::new("FLAT")
        .flags(flags::DISCARD_COLD)
        .export_fn("hello", &stub::ok(), Region::Resident)
        .build()
        .unwrap();
    let mut loader = Loader::new();
    let handle = load(&mut loader, &image).unwrap();
    let instance = loader.instance(handle).unwrap();
    assert_eq!(instance.state(), ModuleState::Resident);
    assert_eq!(instance.stats().cold_bytes_reclaimed, 0);
}
