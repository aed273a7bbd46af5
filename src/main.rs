//! Minimal driver for the recompiler core: mounts a boot ROM image and main
//! RAM, installs the exception interceptor, and runs the SH4 until the
//! process is interrupted or a cycle budget is exhausted.
//!
//! This binary exists to exercise the core end-to-end; the peripheral
//! register files, disc/flash parsing, and rendering a full Dreamcast needs
//! are out of scope for this crate and are left to whatever
//! host integrates it.

use dc_recomp::address_space::MemoryMap;
use dc_recomp::backend::interpreter::InterpreterBackend;
use dc_recomp::backend::x64::X64Backend;
use dc_recomp::backend::Backend;
use dc_recomp::{config::Config, exception, layout, Dreamcast};

const SLICE_NS: u64 = 1_000_000; // 1 ms per scheduler tick

fn usage(arg0: &str) -> ! {
    eprintln!("usage: {arg0} <boot-rom.bin> [--backend interpreter|x64] [--ms N]");
    std::process::exit(2);
}

struct Args {
    rom_path: String,
    backend: String,
    run_ms: u64,
}

fn parse_args() -> Args {
    let mut argv = std::env::args();
    let arg0 = argv.next().unwrap_or_else(|| "dcrun".into());
    let rom_path = argv.next().unwrap_or_else(|| usage(&arg0));
    let mut backend = "interpreter".to_string();
    let mut run_ms = 1000u64;
    while let Some(flag) = argv.next() {
        match flag.as_str() {
            "--backend" => backend = argv.next().unwrap_or_else(|| usage(&arg0)),
            "--ms" => {
                run_ms = argv.next().and_then(|v| v.parse().ok()).unwrap_or_else(|| usage(&arg0));
            }
            _ => usage(&arg0),
        }
    }
    Args { rom_path, backend, run_ms }
}

fn boot_memory_map(dc: &mut Dreamcast<impl Backend + 'static>, rom: &[u8]) -> dc_recomp::Result<()> {
    let rom_region = dc.memory_mut().create_region_static(layout::BOOT_ROM_BEGIN, layout::BOOT_ROM_END - layout::BOOT_ROM_BEGIN)?;
    let ram_region = dc.memory_mut().create_region_static(layout::MAIN_RAM_BEGIN, layout::MAIN_RAM_SIZE)?;

    let mut map = MemoryMap::new();
    map.mount(layout::BOOT_ROM_BEGIN, rom_region);
    map.mount(layout::MAIN_RAM_BEGIN, ram_region);
    for mirror_base in layout::MAIN_RAM_MIRRORS {
        map.mirror(layout::MAIN_RAM_BEGIN, mirror_base, layout::MAIN_RAM_SIZE);
    }
    dc.memory_mut().install_map(&map)?;
    dc.memory_mut().memcpy_to_guest(layout::BOOT_ROM_BEGIN, rom);
    Ok(())
}

fn run<B: Backend + 'static>(args: &Args, backend: B, rom: &[u8]) -> dc_recomp::Result<()> {
    let mut dc = Dreamcast::boxed(Config::default(), backend);
    boot_memory_map(&mut dc, rom)?;
    dc.context_mut().pc = layout::BOOT_ROM_BEGIN;

    log::info!("booting {} bytes at {:#010x}, running {} ms", rom.len(), layout::BOOT_ROM_BEGIN, args.run_ms);
    let slices = (args.run_ms * 1_000_000 / SLICE_NS).max(1);
    for _ in 0..slices {
        dc.tick(SLICE_NS);
    }
    log::info!("halted at pc={:#010x}", dc.context().pc);
    Ok(())
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let rom = std::fs::read(&args.rom_path).unwrap_or_else(|e| {
        eprintln!("failed to read {}: {e}", args.rom_path);
        std::process::exit(1);
    });

    if let Err(e) = exception::install() {
        eprintln!("failed to install exception interceptor: {e}");
        std::process::exit(1);
    }

    let result = match args.backend.as_str() {
        "interpreter" => run(&args, InterpreterBackend::new(), &rom),
        "x64" => match X64Backend::new() {
            Ok(backend) => run(&args, backend, &rom),
            Err(e) => Err(e),
        },
        other => {
            eprintln!("unknown backend {other:?}; expected interpreter or x64");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
