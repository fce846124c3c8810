//! CLI entrypoint for the memguard harness.

use std::io::Write;

use clap::{Parser, Subcommand};
use memguard_core::BackendKind;
use memguard_harness::{
    CorruptionKind, StressConfig, parse_seed, run_corruption, run_scenario, run_stress,
};

/// Exercise memguard backends from the command line.
#[derive(Debug, Parser)]
#[command(name = "memguard-harness")]
#[command(about = "Scenario, stress and corruption harness for memguard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Allocate A/B/C, print the statistics table and a JSON summary.
    Scenario {
        /// Backend to run (`light` or `secured`).
        #[arg(long, default_value = "secured")]
        backend: String,
    },
    /// Multi-threaded deterministic operation mix; prints a JSON report.
    Stress {
        /// Backend to run (`light` or `secured`).
        #[arg(long, default_value = "light")]
        backend: String,
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per worker.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
    },
    /// Demonstrate secured-mode detection; prints diagnostics as JSONL.
    Corrupt {
        #[arg(long, value_enum)]
        kind: CorruptionKind,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Command::Scenario { backend } => {
            let backend = BackendKind::from_str_loose(&backend);
            eprintln!("Running memstats scenario on the {backend} backend");
            let report = run_scenario(backend, &mut stdout)?;
            serde_json::to_writer_pretty(&mut stdout, &report)?;
            writeln!(stdout)?;
        }
        Command::Stress {
            backend,
            threads,
            ops,
            seed,
        } => {
            let config = StressConfig {
                backend: BackendKind::from_str_loose(&backend),
                threads,
                ops,
                seed: parse_seed(&seed)?,
            };
            eprintln!(
                "Stressing the {} backend: {threads} thread(s) x {ops} op(s), seed {:#x}",
                config.backend, config.seed
            );
            let report = run_stress(config)?;
            serde_json::to_writer_pretty(&mut stdout, &report)?;
            writeln!(stdout)?;
        }
        Command::Corrupt { kind } => {
            eprintln!("Triggering {kind:?} in secured mode");
            for record in run_corruption(kind)? {
                serde_json::to_writer(&mut stdout, &record)?;
                writeln!(stdout)?;
            }
        }
    }
    Ok(())
}
