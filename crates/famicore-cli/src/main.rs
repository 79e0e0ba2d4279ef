//! Headless command-line frame runner

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use famicore::cartridge::mapper_name;
use famicore::{FrameOutcome, Machine};

/// NES emulator core runner
#[derive(Parser, Debug)]
#[command(name = "famicore")]
#[command(about = "Run an iNES ROM headless for a number of frames", long_about = None)]
struct Args {
    /// Path to the iNES ROM file
    #[arg(short, long)]
    rom: PathBuf,

    /// Number of frames to run
    #[arg(short, long, default_value = "60")]
    frames: u64,

    /// Stretch CPU timing the way a PAL console does
    #[arg(long)]
    pal: bool,

    /// Dump CPU state after execution
    #[arg(short = 'c', long)]
    dump_cpu: bool,

    /// Write the battery save line here instead of stdout
    #[arg(long)]
    save_out: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let rom_data = match fs::read(&args.rom) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read ROM file: {}", e);
            std::process::exit(1);
        }
    };

    let mut machine = Machine::new();
    if let Err(e) = machine.load_rom(&rom_data) {
        eprintln!("Failed to load cartridge: {}", e);
        std::process::exit(1);
    }
    machine.set_pal(args.pal);

    let cart = machine.cartridge().expect("cartridge just loaded");
    println!("Loaded cartridge:");
    println!("  PRG ROM: {} KiB", cart.prg_bank_count() * 16);
    println!("  CHR:     {} KiB", cart.chr_bank_count() * 4);
    println!(
        "  Mapper:  {} ({})",
        cart.mapper_id(),
        mapper_name(cart.mapper_id())
    );
    println!("  SHA-256: {}", cart.hash());

    machine.reset();
    println!("\nRunning {} frames...", args.frames);
    match machine.run_frames(args.frames, None) {
        FrameOutcome::Complete => {
            println!("Completed {} frames.", machine.frame_count())
        }
        FrameOutcome::Crashed => {
            eprintln!(
                "Game crashed after {} frames (illegal opcode).",
                machine.frame_count()
            );
        }
        FrameOutcome::Stopped => println!("Stopped by host."),
    }

    if args.dump_cpu {
        dump_cpu_state(&machine);
    }

    flush_save(&mut machine, args.save_out.as_deref());
}

fn dump_cpu_state(machine: &Machine) {
    let regs = machine.cpu().registers();
    println!("\nCPU State:");
    println!("  A:    ${:02X}", regs.a);
    println!("  X:    ${:02X}", regs.x);
    println!("  Y:    ${:02X}", regs.y);
    println!("  PC:   ${:04X}", regs.pc);
    println!("  SP:   ${:02X}", regs.sp);
    println!("  P:    {}", machine.cpu().status());
    println!("  Cycles: {}", machine.cpu().total_cycles());
}

fn flush_save(machine: &mut Machine, path: Option<&std::path::Path>) {
    match path {
        Some(path) => {
            let mut file = match fs::File::create(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Failed to open save file: {}", e);
                    return;
                }
            };
            machine.flush_save(&mut file);
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            machine.flush_save(&mut lock);
            let _ = lock.flush();
        }
    }
}
