use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, instrument, warn};

use common::logger::child_span;

use ledger::collaborators::{
    InMemoryKeeper, InMemoryStreaming, InMemoryYieldSource, Keeper, TaskId,
};
use ledger::{
    Address, Dispatcher, Envelope, Event, Ledger, LedgerConfig, ParticipantState, PoolSnapshot,
    Receipt,
};
use store::{Db, LedgerService, SqlxLedgerRepository};

pub type ReplayDispatcher = Dispatcher<InMemoryYieldSource, InMemoryKeeper, InMemoryStreaming>;

/// One line of an event log.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggedEvent {
    pub at: u64,
    #[serde(default)]
    pub sender: Address,
    pub event: Event,
}

impl LoggedEvent {
    fn envelope(&self) -> Envelope {
        Envelope::new(self.sender, self.event.clone())
    }
}

pub fn load_events(path: &Path) -> Result<Vec<LoggedEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let events: Vec<LoggedEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    if let Some(pair) = events.windows(2).find(|w| w[1].at < w[0].at) {
        anyhow::bail!("event log goes back in time at t={}", pair[1].at);
    }
    Ok(events)
}

/// What the replay prints for each event or keeper step.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReplayLine {
    Receipt(Receipt),
    Rejected { at: u64, kind: &'static str, error: String },
}

#[derive(Debug, Serialize)]
pub struct ParticipantView {
    #[serde(flatten)]
    pub state: ParticipantState,
    pub realtime_balance: String,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub now: u64,
    pub pool: PoolSnapshot,
    pub participants: Vec<ParticipantView>,
}

/// The engine behind a replay: held directly, or behind the persisting
/// service when a database is configured.
pub enum Backend {
    Memory {
        ledger: Ledger,
        dispatcher: ReplayDispatcher,
    },
    Persistent(LedgerService<InMemoryYieldSource, InMemoryKeeper, InMemoryStreaming>),
}

impl Backend {
    pub fn memory(dispatcher: ReplayDispatcher, genesis: u64) -> Self {
        Self::Memory {
            ledger: Ledger::new(genesis),
            dispatcher,
        }
    }

    /// Connects, migrates and restores. The stand-in yield source resumes
    /// holding the restored principal, and tasks the restored ledger still
    /// expects are re-armed on the stand-in keeper.
    pub async fn persistent(
        database_url: &str,
        dispatcher: ReplayDispatcher,
        genesis: u64,
    ) -> Result<Self> {
        let db = Db::connect(database_url)
            .await
            .context("failed to connect to database")?;
        db.migrate().await.context("failed to migrate schema")?;

        let repo = Arc::new(SqlxLedgerRepository::new(db.pool.as_ref().clone()));
        let service = LedgerService::restore(repo, dispatcher, genesis).await?;

        let rearmed = service
            .inspect(|ledger, dispatcher| -> Result<usize> {
                dispatcher.yield_source_mut().principal = ledger.pool().yield_snapshot;

                let mut count = 0;
                for p in ledger.participants() {
                    if let Some(id) = p.out_stream.cancel_task_id {
                        dispatcher
                            .keeper_mut()
                            .schedule_task(id, p.out_stream.next_exec())?;
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await?;
        if rearmed > 0 {
            info!(rearmed, "restored keeper tasks");
        }

        Ok(Self::Persistent(service))
    }

    async fn with<R>(&mut self, f: impl FnOnce(&Ledger, &mut ReplayDispatcher) -> R) -> R {
        match self {
            Self::Memory { ledger, dispatcher } => f(ledger, dispatcher),
            Self::Persistent(service) => service.inspect(f).await,
        }
    }

    async fn submit(&mut self, now: u64, envelope: Envelope) -> Result<Receipt> {
        match self {
            Self::Memory { ledger, dispatcher } => Ok(dispatcher.apply(ledger, now, envelope)?),
            Self::Persistent(service) => service.submit(now, envelope).await,
        }
    }

    async fn execute_step(&mut self, now: u64, task_id: TaskId) -> Result<Receipt> {
        match self {
            Self::Memory { ledger, dispatcher } => {
                Ok(dispatcher.execute_step(ledger, now, task_id)?)
            }
            Self::Persistent(service) => service.execute_step(now, task_id).await,
        }
    }

    /// Removes the earliest task due by `now` from the keeper, with the time
    /// it should run at.
    async fn next_due(&mut self, now: u64) -> Option<(u64, TaskId)> {
        self.with(|ledger, dispatcher| {
            let (at, id) = dispatcher.keeper().due(now).into_iter().next()?;
            dispatcher.keeper_mut().take(&id);
            Some((at.max(ledger.pool().timestamp), id))
        })
        .await
    }

    pub async fn summary(&mut self, now: u64) -> Summary {
        self.with(|ledger, _| {
            let now = now.max(ledger.pool().timestamp);
            let participants = ledger
                .participants()
                .map(|p| ParticipantView {
                    realtime_balance: ledger
                        .realtime_balance(&p.address, now)
                        .map(|b| b.to_string())
                        .unwrap_or_else(|e| format!("error: {e}")),
                    state: p.clone(),
                })
                .collect();
            Summary {
                now,
                pool: ledger.pool().clone(),
                participants,
            }
        })
        .await
    }
}

pub struct Replay {
    backend: Backend,
    out: Vec<ReplayLine>,
}

impl Replay {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            out: Vec::new(),
        }
    }

    /// Applies every event in order, firing keeper tasks that fall due
    /// before each one. Rejected events are recorded and skipped.
    #[instrument(skip(self, events), target = "replay", fields(events = events.len()))]
    pub async fn run(&mut self, events: &[LoggedEvent], until: Option<u64>) -> Result<()> {
        for logged in events {
            self.fire_due(logged.at).await?;

            match self.backend.submit(logged.at, logged.envelope()).await {
                Ok(receipt) => self.out.push(ReplayLine::Receipt(receipt)),
                Err(e) => {
                    warn!(at = logged.at, kind = logged.event.kind(), error = %e, "event rejected");
                    self.out.push(ReplayLine::Rejected {
                        at: logged.at,
                        kind: logged.event.kind(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        if let Some(until) = until {
            self.fire_due(until).await?;
        }
        Ok(())
    }

    async fn fire_due(&mut self, now: u64) -> Result<()> {
        while let Some((at, task_id)) = self.backend.next_due(now).await {
            let receipt = self
                .backend
                .execute_step(at, task_id)
                .instrument(child_span("keeper_step"))
                .await
                .with_context(|| format!("keeper step {task_id} at t={at}"))?;
            self.out.push(ReplayLine::Receipt(receipt));
        }
        Ok(())
    }

    pub fn lines(&self) -> &[ReplayLine] {
        &self.out
    }

    pub async fn summary(&mut self, now: u64) -> Summary {
        self.backend.summary(now).await
    }
}

pub fn dispatcher(config: LedgerConfig, yield_rate: u128) -> ReplayDispatcher {
    Dispatcher::new(
        config,
        InMemoryYieldSource::with_rate(yield_rate),
        InMemoryKeeper::new(),
        InMemoryStreaming::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::{EventOutcome, PRECISION};

    fn parse(json: &str) -> Vec<LoggedEvent> {
        serde_json::from_str(json).unwrap()
    }

    fn short_window() -> LedgerConfig {
        LedgerConfig {
            buffer_window_secs: 10,
            ..LedgerConfig::default()
        }
    }

    #[tokio::test]
    async fn replay_records_receipts_and_rejections() {
        let events = parse(
            r#"[
                {"at": 0, "sender": "0x0101010101010101010101010101010101010101",
                 "event": {"DEPOSIT": {"amount": 40}}},
                {"at": 5, "sender": "0x0101010101010101010101010101010101010101",
                 "event": {"WITHDRAW": {"amount": 41}}},
                {"at": 6, "event": "PUSH_TO_STRATEGY"}
            ]"#,
        );

        let mut replay = Replay::new(Backend::memory(dispatcher(short_window(), 0), 0));
        replay.run(&events, None).await.unwrap();

        let lines = replay.lines();
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], ReplayLine::Receipt(r) if r.outcome == EventOutcome::Applied));
        assert!(matches!(&lines[1], ReplayLine::Rejected { kind: "WITHDRAW", .. }));

        let summary = replay.summary(6).await;
        assert_eq!(summary.pool.deposit, 40 * PRECISION);
        assert_eq!(summary.participants[0].realtime_balance, "40");
    }

    #[tokio::test]
    async fn keeper_steps_fire_between_events() {
        let events = parse(
            r#"[
                {"at": 0, "sender": "0x0101010101010101010101010101010101010101",
                 "event": {"DEPOSIT": {"amount": 40}}},
                {"at": 0, "sender": "0x0101010101010101010101010101010101010101",
                 "event": {"OUT_STREAM_START": {"rate": 2}}}
            ]"#,
        );

        let mut replay = Replay::new(Backend::memory(dispatcher(short_window(), 0), 0));
        replay.run(&events, Some(30)).await.unwrap();

        let lines = replay.lines();
        assert_eq!(lines.len(), 3);
        match &lines[2] {
            ReplayLine::Receipt(r) => {
                assert_eq!(r.timestamp, 10);
                assert!(matches!(r.outcome, EventOutcome::StreamClosed { .. }));
            }
            other => panic!("unexpected line {other:?}"),
        }

        let summary = replay.summary(30).await;
        assert_eq!(summary.pool.out_flow_rate, 0);
        assert_eq!(summary.participants[0].realtime_balance, "20");
    }

    #[test]
    fn out_of_order_log_is_refused() {
        let dir = std::env::temp_dir().join(format!("streampool-{}.json", std::process::id()));
        std::fs::write(
            &dir,
            r#"[{"at": 5, "event": "REBALANCE"}, {"at": 4, "event": "REBALANCE"}]"#,
        )
        .unwrap();

        let err = load_events(&dir).unwrap_err();
        std::fs::remove_file(&dir).ok();
        assert!(err.to_string().contains("back in time"));
    }
}
