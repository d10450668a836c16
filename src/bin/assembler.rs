//! Assembly to module compiler CLI.
//!
//! Reads an assembly source file and compiles it to a loadable module.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.asm`: Assembly source file to compile
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-a, --args <file>`: Raw constructor arguments, used for the contract id
//! - `-d, --dry-run`: Deploy into an in-memory store and run the constructor
//! - `-t, --trace`: Log every executed instruction during a dry run
//!
//! # Examples
//! ```text
//! assembler vault.asm
//! assembler vault.asm -o vault.bin
//! assembler oracle.asm -a oracle_ctor.bin -d
//! ```

use bvm::storage::variable_mem::VariableMem;
use bvm::utils::log::{Level, set_level};
use bvm::virtual_machine::assembler::assemble_file;
use bvm::virtual_machine::contract::deploy;
use bvm::virtual_machine::program::{Module, contract_id};
use bvm::virtual_machine::vm::Processor;
use bvm::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut ctor_args_path: Option<String> = None;
    let mut dry_run = false;
    let mut trace = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o" | "--args" | "-a") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                if matches!(k, "--output" | "-o") {
                    output_path = Some(args[i].clone());
                } else {
                    ctor_args_path = Some(args[i].clone());
                }
                i += 1;
            }
            "--dry-run" | "-d" => {
                dry_run = true;
                i += 1;
            }
            "--trace" | "-t" => {
                trace = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    if !Path::new(input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let ctor_args = match &ctor_args_path {
        Some(path) => fs::read(path).unwrap_or_else(|e| {
            error!("Failed to read constructor arguments {}: {}", path, e);
            process::exit(1)
        }),
        None => Vec::new(),
    };

    // assemble_file already logged a diagnostic
    let module = assemble_file(input_path).unwrap_or_else(|_| process::exit(1));

    if let Err(e) = fs::write(&output_path, &module) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    let methods = Module::load(module.as_slice())
        .map(|m| m.method_count())
        .unwrap_or_default();
    info!(
        "Compiled {} -> {} ({} bytes, {} methods)",
        input_path,
        output_path,
        module.len(),
        methods
    );
    info!("Contract id: {}", contract_id(&module, &ctor_args));

    if dry_run {
        if trace {
            set_level(Level::Debug);
        }
        let mut processor = Processor::new().with_trace(trace);
        let mut store = VariableMem::new();
        match deploy(&mut processor, &mut store, &module, &ctor_args) {
            Ok(cid) => info!(
                "Constructor of {} completed, {} variables stored",
                cid,
                store.len()
            ),
            Err(e) => {
                error!("Constructor failed: {} ({:?})", e, e.kind());
                process::exit(1);
            }
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} <input.asm> [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o, --output <file>  Output file path (default: <input>.bin)");
    eprintln!("  -a, --args <file>    Raw constructor arguments");
    eprintln!("  -d, --dry-run        Run the constructor against an in-memory store");
    eprintln!("  -t, --trace          Trace executed instructions during a dry run");
    eprintln!("  -h, --help           Show this help message");
}
