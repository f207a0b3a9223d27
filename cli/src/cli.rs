use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(name = "streampool", version)]
pub struct Cli {
    /// Emit logs as one JSON object per line
    #[clap(long, global = true)]
    pub json_logs: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a JSON event log through the engine
    Replay(ReplayArgs),
    /// Print the persisted pool and participants
    Show(ShowArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// JSON array of `{ "at", "sender", "event" }` entries
    #[clap(long)]
    pub events: PathBuf,

    /// Persist every event result (e.g. `sqlite:streampool.db?mode=rwc`)
    #[clap(long)]
    pub database_url: Option<String>,

    /// Pool creation time; defaults to the first event's timestamp
    #[clap(long)]
    pub genesis: Option<u64>,

    /// Yield the stand-in source produces per second, in raw units
    #[clap(long, default_value_t = 0)]
    pub yield_rate: u128,

    /// Keep firing keeper tasks up to this time after the last event
    #[clap(long)]
    pub until: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[clap(long)]
    pub database_url: String,

    /// Snapshot in force at this time instead of the latest
    #[clap(long)]
    pub at: Option<u64>,

    /// Number of participants to list
    #[clap(long, default_value_t = 100)]
    pub limit: usize,
}
