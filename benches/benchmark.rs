use criterion::{Criterion, criterion_group, criterion_main};
use gen_mod::{ModuleWriter, Region, RelocDesc, RelocKind, flags, stub};
use md64_loader::{Loader, header::validate, host::HostProfile, input::ModuleBinary};

fn hello_image() -> Vec<u8> {
    ModuleWriter::new("HELLO")
        .flags(flags::DISCARD_COLD)
        .sizes(32, 24, 8)
        .export_fn("cleanup", &stub::ok(), Region::Resident)
        .export_fn("hello", &stub::ret_ax(0x4849), Region::Resident)
        .export_fn("version", &stub::ret_dx_ax(0x0001, 0x0000), Region::Resident)
        .data("self", &[0u8; 4], Region::Resident)
        .reloc(RelocDesc::at(RelocKind::SegOfs, "self", 0, 0))
        .unload(&stub::ok())
        .init(&stub::ok())
        .build()
        .unwrap()
        .bytes
}

fn load_benchmark(c: &mut Criterion) {
    let image = hello_image();
    c.bench_function("md64_loader:validate", |b| {
        b.iter(|| validate(&image, &HostProfile::default()).unwrap())
    });
    let mut loader = Loader::new();
    c.bench_function("md64_loader:load+unload", |b| {
        b.iter(|| {
            let handle = loader
                .load_module(ModuleBinary::new("HELLO.MOD", &image))
                .unwrap();
            loader.unload_module(handle).unwrap();
        });
    });
}

fn get_symbol_benchmark(c: &mut Criterion) {
    let image = hello_image();
    let mut loader = Loader::new();
    let handle = loader
        .load_module(ModuleBinary::new("HELLO.MOD", &image))
        .unwrap();
    c.bench_function("md64_loader:resolve", |b| {
        b.iter(|| loader.resolve_symbol("version").unwrap())
    });
    c.bench_function("md64_loader:lookup_export", |b| {
        b.iter(|| loader.lookup_export(handle, "hello").unwrap())
    });
    let version = loader.resolve_symbol("version").unwrap();
    c.bench_function("md64_loader:invoke", |b| {
        b.iter(|| loader.invoke(version).unwrap())
    });
}

criterion_group!(benches, load_benchmark, get_symbol_benchmark);
criterion_main!(benches);
