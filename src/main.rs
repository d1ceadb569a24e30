use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use blox::cache;
use blox::compiler;
use blox::config::VmConfig;
use blox::debug;
use blox::prelude::*;
use blox::vm::FsLoader;

/// The conventional exit code in BSD Unixes.
/// See: man 3 sysexits
mod ex {
    /// The conventional exit code for usage error.
    pub const USAGE: i32 = 64;
    /// When the input data is incorrect -- for example, a compile-time error.
    pub const DATAERR: i32 = 65;
    /// An internal software error occured.
    pub const SOFTWARE: i32 = 70;
    /// An error occured while doing I/O on a file.
    pub const IOERR: i32 = 74;
}

/// Runs blox scripts, or starts a REPL when no script is given.
#[derive(Parser, Debug)]
#[command(name = "blox", version, about, long_about = None)]
struct Cli {
    /// Script to run.
    script: Option<PathBuf>,

    /// Arguments passed to the script, available through `args()`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Maximum call depth.
    #[arg(long, default_value_t = blox::config::FRAMES_MAX)]
    frames_max: usize,

    /// Instructions executed between two collection passes.
    #[arg(long, default_value_t = blox::config::GC_INTERVAL)]
    gc_interval: usize,

    /// Neither read nor write the bytecode cache.
    #[arg(long)]
    no_cache: bool,

    /// Print the compiled bytecode instead of running it.
    #[arg(long)]
    disassemble: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { ex::USAGE } else { 0 });
        }
    };
    install_tracing();

    let config = VmConfig::default()
        .with_frames_max(cli.frames_max)
        .with_gc_interval(cli.gc_interval)
        .with_script_args(cli.args.clone());

    let outcome = match &cli.script {
        Some(script) => run_file(script, config, &cli),
        None => repl(config).map(|()| 0),
    };

    match outcome {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(ex::IOERR);
        }
    }
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Use blox interactively using the read-execute-print loop.
///
/// Globals persist from one line to the next; errors are reported and the loop carries on.
fn repl(config: VmConfig) -> Result<()> {
    let mut vm = VM::new(config, io::stdout());
    let mut line = String::with_capacity(1024);

    let stdin = io::stdin();

    loop {
        line.clear();

        print!("> ");
        io::stdout().flush().context("could not write the prompt")?;
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                break;
            }
            Ok(_) => {
                // Diagnostics were already printed.
                let _ = vm.interpret(&line);
            }
        }
    }

    Ok(())
}

/// Runs a script, going through the bytecode cache unless told otherwise. Returns the exit
/// status.
fn run_file(script: &Path, config: VmConfig, cli: &Cli) -> Result<i32> {
    let source = fs::read_to_string(script)
        .with_context(|| format!("Could not read file: {}", script.display()))?;

    let cache_path = cache::cache_path_for(script, &config.cache_extension);
    let function = match load_cached(&cache_path, script, cli.no_cache) {
        Some(function) => function,
        None => match compiler::compile(&source) {
            Ok(function) => {
                if !cli.no_cache {
                    if let Err(e) = cache::write_cache(&cache_path, &function) {
                        tracing::warn!(path = %cache_path.display(), error = %e, "could not write bytecode cache");
                    }
                }
                function
            }
            Err(_) => return Ok(ex::DATAERR),
        },
    };

    if cli.disassemble {
        print!("{}", debug::chunk_to_string(&function.chunk, "script"));
        return Ok(0);
    }

    let base = script.parent().unwrap_or_else(|| Path::new("."));
    let mut vm = VM::new(config, io::stdout());
    vm.set_loader(Box::new(FsLoader::new(base)));

    use InterpretationError::*;
    let status = match vm.run_function(Rc::new(function)) {
        Ok(_) => 0,
        Err(CompileError(_)) => ex::DATAERR,
        Err(RuntimeError(_)) => ex::SOFTWARE,
    };
    io::stdout().flush().context("could not flush output")?;

    Ok(status)
}

/// The cached bytecode for `script`, when there is a usable cache that is fresh.
fn load_cached(cache_path: &Path, script: &Path, no_cache: bool) -> Option<blox::value::Function> {
    if no_cache || !cache::is_fresh(cache_path, script) {
        return None;
    }
    match cache::read_cache(cache_path) {
        Ok(function) => Some(function),
        Err(e) => {
            tracing::warn!(path = %cache_path.display(), error = %e, "ignoring unreadable bytecode cache");
            None
        }
    }
}
