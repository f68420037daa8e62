//! Offline inspection of a translation-cache dump: prints the main/cold
//! arena sizes, the trampoline text index, and -- unless the dump was
//! produced with `jit-no-gdb` -- the per-translation and per-instruction
//! debug records.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracelet_jit::dump::{render, CacheDump};

#[derive(Parser, Debug)]
#[command(name = "tjdump", about = "Inspect a tracelet JIT translation-cache dump")]
struct Args {
    /// Path to a dump file written by `CacheDump::write_to`.
    dump: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let file = match File::open(&args.dump) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("tjdump: couldn't open {}: {e}", args.dump.display());
            return ExitCode::FAILURE;
        }
    };

    let dump = match CacheDump::read_from(&mut BufReader::new(file)) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("tjdump: {}: {e}", args.dump.display());
            return ExitCode::FAILURE;
        }
    };

    print!("{}", render(&dump));
    ExitCode::SUCCESS
}
