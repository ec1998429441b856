//! Top sites store inspector
//!
//! Prints the ordered listing of a store directory, or rebuilds it from
//! readable rows with `--salvage`.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use topsites::{salvage, Rank, StoreConfig, TopSitesStore};

struct Config {
    dir: PathBuf,
    salvage: bool,
}

fn print_help() {
    println!("topsites-inspect - inspect a top sites store");
    println!();
    println!("USAGE:");
    println!("    topsites-inspect <DIR> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -s, --salvage     Rebuild the store from readable rows and print the report");
    println!("    -h, --help        Print help information");
}

fn parse_args() -> Result<Config, String> {
    let mut dir = None;
    let mut salvage = false;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--salvage" | "-s" => salvage = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown argument: {flag}")),
            path => {
                if dir.is_some() {
                    return Err(format!("unexpected extra argument: {path}"));
                }
                dir = Some(PathBuf::from(path));
            }
        }
    }

    let dir = dir.ok_or_else(|| "missing store directory".to_string())?;
    Ok(Config { dir, salvage })
}

fn run(config: &Config) -> Result<(), String> {
    if config.salvage {
        let report = salvage(&config.dir, true).map_err(|e| e.to_string())?;
        println!("recovered: {}", report.recovered);
        println!("skipped:   {}", report.skipped);
        match report.source_version {
            Some(v) => println!("source schema version: {v}"),
            None => println!("source schema version: unknown (meta row lost)"),
        }
        println!("new generation: {}", report.generation);
        return Ok(());
    }

    let mut store =
        TopSitesStore::init_with_config(&config.dir, StoreConfig::default()).map_err(|e| e.to_string())?;
    let entries = store.get_entries().map_err(|e| e.to_string())?;
    if entries.is_empty() {
        println!("(empty)");
    }
    for (position, entry) in entries.iter().enumerate() {
        let kind = match entry.rank {
            Rank::Forced { since } => format!("pinned {}", since.to_rfc3339()),
            Rank::Organic(rank) => format!("organic {rank}"),
        };
        println!("{position:>3}  {kind:<36}  {}  {}", entry.url, entry.metadata.title);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("run with --help for usage");
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
