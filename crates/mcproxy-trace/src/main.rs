//! mcproxy-trace — a minimal reader for the `.mcs` trace files `mcproxy`
//! writes during a session (spec.md §6). Lists the captured frames in
//! arrival order; does not attempt to decode any packet semantically,
//! matching the Non-goals' "interface level only" scope for trace tooling.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcproxy_common::packet::Direction;
use mcproxy_common::trace::TraceReader;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcproxy-trace")]
#[command(about = "Inspect mcproxy .mcs trace files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every record in a trace file.
    List {
        /// Path to the .mcs file.
        path: PathBuf,

        /// How many leading bytes of each frame to render as hex.
        #[arg(long, default_value_t = 16)]
        preview: usize,
    },
    /// Print summary counts (frames per direction, total bytes).
    Summary {
        /// Path to the .mcs file.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::List { path, preview } => list(&path, preview),
        Commands::Summary { path } => summary(&path),
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToServer => "C->S",
        Direction::ServerToClient => "S->C",
    }
}

fn list(path: &PathBuf, preview: usize) -> Result<()> {
    let reader = TraceReader::open(path)
        .with_context(|| format!("failed to open trace file {}", path.display()))?;

    for (index, record) in reader.enumerate() {
        let record = record.with_context(|| format!("malformed record #{index}"))?;
        let shown = record.frame.len().min(preview);
        println!(
            "#{index:<5} {:<5} t={}.{:06} len={:<6} {}{}",
            direction_label(record.direction),
            record.sec,
            record.usec,
            record.frame.len(),
            hex::encode(&record.frame[..shown]),
            if shown < record.frame.len() { "…" } else { "" }
        );
    }

    Ok(())
}

fn summary(path: &PathBuf) -> Result<()> {
    let reader = TraceReader::open(path)
        .with_context(|| format!("failed to open trace file {}", path.display()))?;

    let mut client_to_server = 0usize;
    let mut server_to_client = 0usize;
    let mut total_bytes = 0u64;

    for record in reader {
        let record = record?;
        match record.direction {
            Direction::ClientToServer => client_to_server += 1,
            Direction::ServerToClient => server_to_client += 1,
        }
        total_bytes += record.frame.len() as u64;
    }

    println!("{}", path.display());
    println!("  client -> server frames: {client_to_server}");
    println!("  server -> client frames: {server_to_client}");
    println!("  total frame bytes:       {total_bytes}");

    Ok(())
}
