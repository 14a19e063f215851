mod config;
mod script;
mod slots;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use thiserror::Error;
use vibe_gba_core::cartridge::Cartridge;
use vibe_gba_core::cpu::registers::PC;
use vibe_gba_core::render::{SCREEN_HEIGHT, SCREEN_WIDTH};
use vibe_gba_core::{CpuError, IllegalInstructionPolicy, LoadError, Machine, StateError};

use config::CliConfig;
use script::ButtonPress;

#[derive(Parser)]
#[command(name = "vibe-gba", version, about = "Headless Game Boy Advance runner")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Path to a 16 KiB BIOS image
    #[arg(long)]
    bios: Option<PathBuf>,

    /// Start at the cartridge entry point even when a BIOS is given
    #[arg(long)]
    skip_bios: bool,

    /// Log and skip illegal instructions instead of stopping
    #[arg(long)]
    compatible: bool,

    /// Number of frames to run
    #[arg(long, default_value_t = 60)]
    frames: u64,

    /// Stop after this many seconds of wall-clock time
    #[arg(long)]
    seconds: Option<u64>,

    /// Hold a button, e.g. `start@30` or `a@10..20` (repeatable)
    #[arg(long = "press", value_name = "BUTTON@FRAMES")]
    presses: Vec<ButtonPress>,

    /// Write the last frame to a PNG file
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Restore this save-state slot before running
    #[arg(long)]
    load_slot: Option<u8>,

    /// Write this save-state slot after running
    #[arg(long)]
    save_slot: Option<u8>,

    /// Config file (defaults to the per-user location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the config file
    #[arg(long)]
    save_config: bool,

    /// Enable debug logging and print CPU state every 60 frames
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load {}: {source}", path.display())]
    Load { path: PathBuf, source: LoadError },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("save state: {0}")]
    State(#[from] StateError),
    #[error(transparent)]
    Cpu(#[from] CpuError),
    #[error("screenshot: {0}")]
    Png(#[from] png::EncodingError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CliError + '_ {
    move |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Command-line flags layered over the config file.
fn effective_config(args: &Args, file: CliConfig) -> CliConfig {
    let mut cfg = file;
    if let Some(bios) = &args.bios {
        cfg.bios_path = Some(bios.clone());
    }
    if args.skip_bios {
        cfg.skip_bios = true;
    }
    if args.compatible {
        cfg.illegal_instructions = config::IllegalInstructions::Compatible;
    }
    cfg
}

fn run(args: Args) -> Result<(), CliError> {
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let cfg = effective_config(&args, config::load_from_file(&config_path));
    if args.save_config {
        config::save_to_file(&config_path, &cfg).map_err(io_error(&config_path))?;
        info!("Saved settings to {}", config_path.display());
    }

    let mut gba = Machine::new(cfg.machine_config());
    if let Some(path) = &cfg.bios_path {
        let data = std::fs::read(path).map_err(io_error(path))?;
        gba.load_bios(&data).map_err(|source| CliError::Load {
            path: path.clone(),
            source,
        })?;
    }

    let cart = Cartridge::from_file(&args.rom).map_err(|source| CliError::Load {
        path: args.rom.clone(),
        source,
    })?;
    gba.insert_cartridge(cart);
    if gba.config().illegal_instruction == IllegalInstructionPolicy::Compatible {
        info!("Illegal instructions are skipped");
    }

    let state_dir = cfg.state_dir.as_deref();
    if let Some(slot) = args.load_slot {
        let path = slots::slot_path(&args.rom, state_dir, slot);
        let blob = slots::read_slot(&path).map_err(io_error(&path))?;
        gba.load_state(&blob)?;
        info!("Restored slot {slot} from {}", path.display());
    }

    let result = run_frames(&mut gba, &args);

    // Keep the battery save even when the program faulted.
    if let Err(e) = gba.save_backup() {
        warn!("Failed to write battery save: {e}");
    }
    let frames = result?;
    info!("Ran {frames} frames");

    if let Some(path) = &args.screenshot {
        write_png(path, gba.framebuffer())?;
        info!("Wrote {}", path.display());
    }

    if let Some(slot) = args.save_slot {
        let path = slots::slot_path(&args.rom, state_dir, slot);
        let blob = gba.save_state()?;
        slots::write_slot(&path, &blob).map_err(io_error(&path))?;
        info!("Saved slot {slot} to {}", path.display());
    }
    Ok(())
}

fn run_frames(gba: &mut Machine, args: &Args) -> Result<u64, CpuError> {
    let limit = args.seconds.map(Duration::from_secs);
    let start = Instant::now();
    let mut frame = 0;
    while frame < args.frames {
        let (pressed, released) = script::edges(&args.presses, frame);
        for button in released {
            gba.release_button(button);
        }
        for button in pressed {
            gba.press_button(button);
        }

        gba.run_frame()?;
        if args.debug && frame % 60 == 0 {
            println!("{}", debug_state(gba));
        }
        frame += 1;

        if let Some(limit) = limit
            && start.elapsed() >= limit
        {
            break;
        }
    }
    Ok(frame)
}

fn debug_state(gba: &Machine) -> String {
    let regs = &gba.cpu.regs;
    let mut line = format!(
        "frame {} PC={:08X} CPSR={:08X} {:?}{}",
        gba.ppu.frames(),
        regs.r[PC],
        regs.cpsr,
        regs.mode(),
        if regs.thumb() { " thumb" } else { "" },
    );
    for (i, r) in regs.r[..15].iter().enumerate() {
        line.push_str(&format!(" r{i}={r:08X}"));
    }
    line
}

fn frame_to_rgb(frame: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; frame.len() * 3];
    for (i, &px) in frame.iter().enumerate() {
        out[i * 3] = ((px >> 16) & 0xFF) as u8;
        out[i * 3 + 1] = ((px >> 8) & 0xFF) as u8;
        out[i * 3 + 2] = (px & 0xFF) as u8;
    }
    out
}

fn write_png(path: &Path, frame: &[u32]) -> Result<(), CliError> {
    let file = File::create(path).map_err(io_error(path))?;
    let w = BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&frame_to_rgb(frame))?;
    writer.finish()?;
    Ok(())
}
