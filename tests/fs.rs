#![cfg(feature = "fs")]

mod common;

use common::*;
use md64_loader::{Error, Loader, input::ModuleFile, load_module};
use rstest::rstest;
use std::path::PathBuf;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("md64-{}-{tag}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[rstest]
fn wrong_name_fails() {
    let err = load_module!("target/this_location_is_definitely_non existent:^~")
        .err()
        .unwrap();
    assert!(matches!(err, Error::Io { .. }));
}

#[rstest]
fn loads_from_disk() {
    let dir = scratch_dir("disk");
    let path = dir.join("HELLO.MOD");
    hello_module().write_file(&path).unwrap();
    let (mut loader, handle) = load_module!(path.to_str().unwrap()).unwrap();
    let version = loader.resolve_symbol("version").unwrap();
    assert_eq!(loader.invoke(version).unwrap().value(), VERSION);
    loader.unload_module(handle).unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}

#[rstest]
fn search_path_order() {
    let first = scratch_dir("first");
    let second = scratch_dir("second");
    client_module().write_file(&second.join("CLIENT.MOD")).unwrap();
    hello_module().write_file(&second.join("HELLO.MOD")).unwrap();
    tiny_module("SHADOW").write_file(&first.join("HELLO.MOD")).unwrap();

    let dirs = [first.clone(), second.clone()];
    let mut loader = Loader::new();
    let shadow = loader
        .load_module(ModuleFile::search("HELLO.MOD", &dirs).unwrap())
        .unwrap();
    assert_eq!(loader.instance(shadow).unwrap().name(), "SHADOW");
    assert!(ModuleFile::search("MISSING.MOD", &dirs).is_err());
    // CLIENT needs `hello`, which SHADOW does not export
    let client = ModuleFile::search("CLIENT.MOD", &dirs).unwrap();
    assert!(matches!(
        loader.load_module(client),
        Err(Error::SymbolNotFound { .. })
    ));

    std::fs::remove_dir_all(first).unwrap();
    std::fs::remove_dir_all(second).unwrap();
}
