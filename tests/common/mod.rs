#![allow(dead_code)]

use gen_mod::{ModuleImage, ModuleWriter, Region, RelocDesc, RelocKind, flags, stub};
use md64_loader::{
    Loader, ModuleHandle,
    arena::{ParagraphArena, PoolSpec},
    input::ModuleBinary,
};

pub const VERSION: u32 = 0x0001_0000;
pub const HELLO_AX: u16 = 0x4849;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The reference module: 32 paragraphs, 24 resident, 8 cold, init in the
/// cold region, three exports.
pub fn hello_writer() -> ModuleWriter {
    ModuleWriter::new("HELLO")
        .flags(flags::DISCARD_COLD)
        .sizes(32, 24, 8)
        .export_fn("cleanup", &stub::ok(), Region::Resident)
        .export_fn("hello", &stub::ret_ax(HELLO_AX), Region::Resident)
        .export_fn("version", &stub::ret_dx_ax(0x0001, 0x0000), Region::Resident)
        .data("self", &[0u8; 4], Region::Resident)
        .reloc(RelocDesc::at(RelocKind::SegOfs, "self", 0, 0))
        .unload(&stub::ok())
        .init(&stub::ok())
}

pub fn hello_module() -> ModuleImage {
    hello_writer().build().unwrap()
}

/// The reference module with an extra export living in the cold region.
pub fn hello_with_cold_export() -> ModuleImage {
    hello_writer()
        .export_fn("setup", &stub::ok(), Region::Cold)
        .build()
        .unwrap()
}

/// A module that binds `hello` through an import relocation.
pub fn client_module() -> ModuleImage {
    ModuleWriter::new("CLIENT")
        .data("hello_p", &[0u8; 4], Region::Resident)
        .reloc(RelocDesc::import("hello_p", 0, "hello"))
        .api(&stub::ret_ax(0))
        .build()
        .unwrap()
}

/// The smallest loadable module: four paragraphs, no entries, no exports.
pub fn tiny_module(name: &str) -> ModuleImage {
    ModuleWriter::new(name).build().unwrap()
}

pub fn load(loader: &mut Loader, image: &ModuleImage) -> md64_loader::Result<ModuleHandle> {
    loader.load_module(ModuleBinary::new("TEST.MOD", &image.bytes))
}

/// A loader whose conventional pool holds `paragraphs` paragraphs and which
/// has no upper memory.
pub fn small_loader(paragraphs: u32) -> Loader {
    Loader::with_arena(ParagraphArena::new(PoolSpec::new(0x1000, paragraphs), None))
}
