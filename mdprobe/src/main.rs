use anyhow::{Context, anyhow};
use clap::Parser;
use md64_loader::{
    Loader, ModuleHandle,
    arena::{Arena, MemoryClass, ParagraphArena, Placement},
    host::{CpuClass, CpuFeatures, HostProfile, StdClock},
    input::ModuleFile,
    thunk::ThunkDispatcher,
};
use std::{path::PathBuf, process::ExitCode};

type ProbeLoader = Loader<ParagraphArena, ThunkDispatcher, StdClock>;

#[derive(Parser)]
#[command(name = "mdprobe", about = "Load, inspect, probe and unload MD64 modules")]
struct Args {
    /// Module images to probe
    #[arg(required = true)]
    modules: Vec<String>,
    /// Host CPU class (8086, 286, 386, 486, pentium)
    #[arg(long, default_value = "386", value_parser = parse_cpu)]
    cpu: CpuClass,
    /// Host features, comma separated (fpu, mmx, cpuid)
    #[arg(long, value_delimiter = ',', value_parser = parse_feature)]
    features: Vec<CpuFeatures>,
    /// Place modules in upper memory when possible
    #[arg(long)]
    upper: bool,
    /// Keep cold regions after init
    #[arg(long)]
    no_discard: bool,
    /// Symbols to resolve after each load; defaults to the module's exports
    #[arg(long = "probe")]
    probes: Vec<String>,
    /// Directories searched for bare module names
    #[arg(long = "search", default_values = [".", "MODULES"])]
    search: Vec<PathBuf>,
    /// Keep every module loaded until the end, so later modules can import earlier ones
    #[arg(long)]
    keep: bool,
}

fn parse_cpu(name: &str) -> Result<CpuClass, String> {
    CpuClass::from_name(name).ok_or_else(|| format!("unknown CPU class {name:?}"))
}

fn parse_feature(name: &str) -> Result<CpuFeatures, String> {
    CpuFeatures::from_name(&name.to_ascii_uppercase()).ok_or_else(|| format!("unknown feature {name:?}"))
}

fn report(loader: &ProbeLoader, handle: ModuleHandle) -> anyhow::Result<()> {
    let instance = loader
        .instance(handle)
        .ok_or_else(|| anyhow!("module {handle} vanished"))?;
    let header = instance.header();
    let segments = instance.segments();
    println!("  name        : {}", header.name());
    println!("  type        : {:?}", header.module_type);
    println!("  abi         : {}", header.abi_version);
    println!("  flags       : {:?}", header.flags);
    println!("  cpu         : {}", header.required_cpu);
    println!("  module id   : 0x{:04x}", header.module_id);
    println!(
        "  paragraphs  : total {} resident {} cold {} bss {}",
        header.total_size_para,
        header.resident_size_para,
        header.cold_size_para,
        header.bss_size_para
    );
    println!("  base        : {:04X} ({:?})", segments.base(), segments.class());
    println!("  state       : {:?}", instance.state());
    let stats = instance.stats();
    println!(
        "  timing (us) : validate {} relocate {} init {} total {}",
        stats.validate_us, stats.relocate_us, stats.init_us, stats.total_us
    );
    println!(
        "  linked      : {} relocations, {} exports, {} cold bytes reclaimed",
        stats.relocations, stats.exports, stats.cold_bytes_reclaimed
    );
    if let Some(isr) = instance.isr_entry() {
        println!("  isr         : {isr}");
    }
    Ok(())
}

fn probe(loader: &mut ProbeLoader, handle: ModuleHandle, names: &[String]) -> anyhow::Result<()> {
    let exported: Vec<(String, bool)> = loader
        .instance(handle)
        .map(|instance| {
            instance
                .exports()
                .entries()
                .iter()
                .map(|entry| (entry.name.to_string(), entry.is_function()))
                .collect()
        })
        .unwrap_or_default();
    let targets: Vec<(String, bool)> = if names.is_empty() {
        exported
    } else {
        names
            .iter()
            .map(|name| {
                let callable = exported.iter().any(|(n, f)| n == name && *f);
                (name.clone(), callable)
            })
            .collect()
    };
    for (name, callable) in targets {
        match loader.resolve_symbol(&name) {
            Ok(addr) if callable => match loader.invoke(addr) {
                Ok(outcome) => println!(
                    "  {name:<8} -> {addr}  returns DX:AX {:08x}{}",
                    outcome.value(),
                    if outcome.carry { " (CF)" } else { "" }
                ),
                Err(err) => println!("  {name:<8} -> {addr}  call failed: {err}"),
            },
            Ok(addr) => println!("  {name:<8} -> {addr}"),
            Err(err) => println!("  {name:<8} -> {err}"),
        }
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let features = args
        .features
        .iter()
        .fold(CpuFeatures::empty(), |acc, f| acc | *f);
    let mut loader: ProbeLoader = Loader::new()
        .with_host(HostProfile::new(args.cpu, features))
        .with_placement(if args.upper {
            Placement::PreferUpper
        } else {
            Placement::Conventional
        })
        .with_auto_discard(!args.no_discard)
        .with_clock(StdClock::default());
    let baseline = loader.arena().used_bytes();
    let mut all_ok = true;
    let mut kept = Vec::new();

    for name in &args.modules {
        println!("{name}:");
        let file = match ModuleFile::search(name, &args.search) {
            Ok(file) => file,
            Err(err) => {
                log::error!("[mdprobe] cannot open {name}: {err}");
                println!("  open failed: {err}");
                all_ok = false;
                continue;
            }
        };
        let handle = match loader.load_module(file) {
            Ok(handle) => {
                log::info!("[mdprobe] {name} loaded as {handle}");
                handle
            }
            Err(err) => {
                log::error!("[mdprobe] {name} failed to load: {err}");
                println!("  load failed ({:?}): {err}", err.class());
                all_ok = false;
                continue;
            }
        };
        report(&loader, handle)?;
        probe(&mut loader, handle, &args.probes)?;
        if args.keep {
            kept.push(handle);
            continue;
        }
        match loader.unload_module(handle) {
            Ok(()) => {
                log::info!("[mdprobe] {name} unloaded");
                println!("  unloaded");
            }
            Err(err) if err.is_non_fatal() => {
                log::warn!("[mdprobe] {name} unloaded with warning: {err}");
                println!("  unloaded with warning: {err}");
            }
            Err(err) => return Err(err).context(format!("unloading {name}")),
        }
    }

    for handle in kept.into_iter().rev() {
        match loader.unload_module(handle) {
            Ok(()) => log::info!("[mdprobe] {handle} unloaded"),
            Err(err) => println!("{handle}: {err}"),
        }
    }
    let stats = loader.stats();
    println!(
        "loads {} unloads {} failures {} cold bytes reclaimed {}",
        stats.loads, stats.unloads, stats.failures, stats.cold_bytes_reclaimed
    );
    println!(
        "arena: {} bytes in use (baseline {}), conventional {} / upper {} bytes",
        loader.arena().used_bytes(),
        baseline,
        loader.arena().capacity(MemoryClass::Conventional),
        loader.arena().capacity(MemoryClass::Upper)
    );
    loader.shutdown()?;
    Ok(all_ok)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("mdprobe: {err:#}");
            ExitCode::from(2)
        }
    }
}
