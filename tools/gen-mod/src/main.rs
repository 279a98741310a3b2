use anyhow::Result;
use clap::Parser;
use gen_mod::{ModuleWriter, Region, RelocDesc, RelocKind, flags, stub};
use std::path::{Path, PathBuf};

/// The demo module: three exports, init in a discardable region.
fn gen_hello(dir: &Path, cpu: u16) -> Result<()> {
    let out = dir.join("HELLO.MOD");
    let image = ModuleWriter::new("HELLO")
        .cpu(cpu)
        .flags(flags::DISCARD_COLD)
        .sizes(32, 24, 8)
        .export_fn("cleanup", &stub::ok(), Region::Resident)
        .export_fn("hello", &stub::ret_ax(0x4849), Region::Resident)
        .export_fn("version", &stub::ret_dx_ax(0x0001, 0x0000), Region::Resident)
        .data("self", &[0u8; 4], Region::Resident)
        .reloc(RelocDesc::at(RelocKind::SegOfs, "self", 0, 0))
        .unload(&stub::ok())
        .init(&stub::ok())
        .write_file(&out)?;
    println!("Wrote {} ({} bytes)", out.display(), image.bytes.len());
    Ok(())
}

/// A client that binds to `hello` at load time.
fn gen_client(dir: &Path, cpu: u16) -> Result<()> {
    let out = dir.join("CLIENT.MOD");
    let image = ModuleWriter::new("CLIENT")
        .cpu(cpu)
        .data("hello_p", &[0u8; 4], Region::Resident)
        .reloc(RelocDesc::import("hello_p", 0, "hello"))
        .api(&stub::ret_ax(0))
        .write_file(&out)?;
    println!("Wrote {} ({} bytes)", out.display(), image.bytes.len());
    Ok(())
}

#[derive(Parser)]
#[command(name = "gen-mod")]
struct Args {
    /// Output directory for generated images
    #[arg(short)]
    output: Option<PathBuf>,
    /// Required CPU code written to the headers
    #[arg(long, default_value_t = 0x0086)]
    cpu: u16,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let output = match args.output {
        Some(p) => p,
        None => {
            let mut cwd = std::env::current_dir()?;
            cwd.push("out");
            cwd
        }
    };
    std::fs::create_dir_all(&output)?;
    println!("out: {}\ncpu: 0x{:04x}", output.display(), args.cpu);

    gen_hello(&output, args.cpu)?;
    gen_client(&output, args.cpu)?;
    Ok(())
}
