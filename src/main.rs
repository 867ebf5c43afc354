//! txscope - command-line interface
//!
//! Runs statements against an in-memory link, either interactively or
//! from `-e` arguments.

use std::path::PathBuf;
use std::process::ExitCode;

use txscope::db::{render_rows, Output, Repl};
use txscope::link::MemoryLink;
use txscope::{Database, EngineConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut config_path: Option<PathBuf> = None;
    let mut group: Option<String> = None;
    let mut verbose = false;
    let mut execute: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "-g" | "--group" => {
                i += 1;
                if i < args.len() {
                    group = Some(args[i].clone());
                }
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-e" | "--execute" => {
                i += 1;
                if i < args.len() {
                    execute.push(args[i].clone());
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("txscope v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match config_path {
        Some(path) => match EngineConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(group) = group {
        config.group = group;
    }
    if verbose {
        config.debug = true;
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let db = Database::new(MemoryLink::new(), config);
    let mut repl = Repl::new(db);

    // Execute given statements in order, or run the REPL.
    if !execute.is_empty() {
        for sql in &execute {
            match repl.execute(sql) {
                Ok(output) => print_output(&output),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        ExitCode::SUCCESS
    } else {
        match repl.run() {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}

fn print_help() {
    println!("txscope - propagation-aware transactions over a SQL link");
    println!();
    println!("Usage: txscope [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config FILE      Load engine configuration from a JSON file");
    println!("  -g, --group NAME       Connection group (default: default)");
    println!("  -e, --execute SQL      Execute SQL and exit (may be repeated)");
    println!("  -v, --verbose          Log statements and transaction events");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Examples:");
    println!("  txscope                                   Start REPL");
    println!("  txscope -e 'CREATE TABLE t (id INTEGER)' -e 'SELECT * FROM t'");
}

fn print_output(output: &Output) {
    match output {
        Output::Message(message) => println!("{}", message),
        Output::Modified(result) => println!("{} row(s) modified", result.rows_affected),
        Output::Rows(rows) => print!("{}", render_rows(rows, usize::MAX)),
    }
}
