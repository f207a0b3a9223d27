pub mod cli;
mod replay;

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{Instrument, info};

use common::logger::{TraceId, init_logger, init_tracing, root_span};
use ledger::time::now_secs;
use ledger::{Ledger, LedgerConfig, PoolSnapshot};
use store::{Db, LedgerRepository, SqlxLedgerRepository};

use cli::{Cli, Command, ReplayArgs, ShowArgs};
use replay::{Backend, ParticipantView, Replay, dispatcher, load_events};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_tracing("streampool", true);
    } else {
        init_logger("streampool");
    }

    let trace_id = TraceId::default();
    match cli.command {
        Command::Replay(args) => {
            let span = root_span("replay", &trace_id);
            run_replay(args).instrument(span).await
        }
        Command::Show(args) => {
            let span = root_span("show", &trace_id);
            run_show(args).instrument(span).await
        }
    }
}

async fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let events = load_events(&args.events)?;
    let genesis = args
        .genesis
        .or_else(|| events.first().map(|e| e.at))
        .unwrap_or_else(now_secs);

    let config = LedgerConfig::from_env();
    info!(?config, genesis, events = events.len(), "starting replay");

    let dispatcher = dispatcher(config, args.yield_rate);
    let backend = match &args.database_url {
        Some(url) => Backend::persistent(url, dispatcher, genesis).await?,
        None => Backend::memory(dispatcher, genesis),
    };

    let mut replay = Replay::new(backend);
    replay.run(&events, args.until).await?;

    let end = args
        .until
        .into_iter()
        .chain(events.last().map(|e| e.at))
        .max()
        .unwrap_or(genesis);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in replay.lines() {
        write_json(&mut out, line)?;
    }
    write_json(&mut out, &replay.summary(end).await)?;
    Ok(())
}

async fn run_show(args: ShowArgs) -> anyhow::Result<()> {
    let db = Db::connect(&args.database_url)
        .await
        .context("failed to connect to database")?;
    db.migrate().await?;
    let repo = SqlxLedgerRepository::new(db.pool.as_ref().clone());

    let participants = repo.scan_participants(args.limit, 0).await?;

    #[derive(Serialize)]
    struct Persisted {
        pool: Option<PoolSnapshot>,
        participants: Vec<ParticipantView>,
    }

    // Balances are projected only from the latest snapshot; older ones
    // predate the stored participant rows.
    let shown = match args.at {
        Some(ts) => Persisted {
            pool: repo.pool_at(ts).await?,
            participants: participants
                .into_iter()
                .map(|state| ParticipantView {
                    realtime_balance: state.balance().to_string(),
                    state,
                })
                .collect(),
        },
        None => {
            let pool = repo.latest_pool().await?;
            let now = now_secs();
            let ledger = pool
                .clone()
                .map(|p| Ledger::restore(p, participants.clone()));
            Persisted {
                pool,
                participants: participants
                    .into_iter()
                    .map(|state| ParticipantView {
                        realtime_balance: ledger
                            .as_ref()
                            .and_then(|l| l.realtime_balance(&state.address, now).ok())
                            .unwrap_or_else(|| state.balance())
                            .to_string(),
                        state,
                    })
                    .collect(),
            }
        }
    };

    let stdout = std::io::stdout();
    write_json(&mut stdout.lock(), &shown)?;
    Ok(())
}

fn write_json(out: &mut impl Write, value: &impl Serialize) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

