use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use common::logger::warn_if_slow;
use ledger::collaborators::{Keeper, StreamingProtocol, TaskId, YieldSource};
use ledger::{Dispatcher, Envelope, FlowChange, Ledger, ParticipantState, PoolSnapshot, Receipt};

use crate::repository::LedgerRepository;

const RESTORE_PAGE_SIZE: usize = 500;

struct Inner<Y, K, S> {
    ledger: Ledger,
    dispatcher: Dispatcher<Y, K, S>,
    /// Participants whose last write failed; retried with the next event.
    unsaved: BTreeSet<Address>,
}

/// Single-writer front door: participant actions and keeper callbacks are
/// applied one at a time and each result is persisted before the next.
pub struct LedgerService<Y, K, S> {
    inner: Mutex<Inner<Y, K, S>>,
    repo: Arc<dyn LedgerRepository>,
}

impl<Y, K, S> LedgerService<Y, K, S>
where
    Y: YieldSource + Send,
    K: Keeper + Send,
    S: StreamingProtocol + Send,
{
    /// Rebuilds the ledger from the repository, or opens a fresh pool at
    /// `genesis` when nothing was persisted yet.
    #[instrument(skip(repo, dispatcher), target = "service")]
    pub async fn restore(
        repo: Arc<dyn LedgerRepository>,
        dispatcher: Dispatcher<Y, K, S>,
        genesis: u64,
    ) -> Result<Self> {
        let pool = warn_if_slow("db_latest_pool", Duration::from_millis(100), async {
            repo.latest_pool().await
        })
        .await
        .context("failed to load latest pool snapshot")?;

        let ledger = match pool {
            None => {
                info!(genesis, "no persisted pool; starting fresh");
                Ledger::new(genesis)
            }
            Some(pool) => {
                let mut participants = Vec::new();
                let mut offset = 0;
                loop {
                    let page = warn_if_slow(
                        "db_fetch_participants",
                        Duration::from_millis(200),
                        async { repo.fetch_participants(RESTORE_PAGE_SIZE, offset).await },
                    )
                    .await
                    .context("failed to fetch participant page")?;

                    let count = page.len();
                    participants.extend(page);
                    if count < RESTORE_PAGE_SIZE {
                        break;
                    }
                    offset += RESTORE_PAGE_SIZE;
                }

                info!(
                    pool_id = pool.id,
                    timestamp = pool.timestamp,
                    participants = participants.len(),
                    "ledger restored"
                );
                Ledger::restore(pool, participants)
            }
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                ledger,
                dispatcher,
                unsaved: BTreeSet::new(),
            }),
            repo,
        })
    }

    #[instrument(
        skip(self, envelope),
        target = "service",
        fields(sender = %envelope.sender, event = envelope.event.kind())
    )]
    pub async fn submit(&self, now: u64, envelope: Envelope) -> Result<Receipt> {
        let mut inner = self.inner.lock().await;
        let Inner {
            ledger, dispatcher, ..
        } = &mut *inner;

        let receipt = dispatcher
            .apply(ledger, now, envelope)
            .context("event rejected")?;

        self.persist(&mut inner, &receipt).await?;
        Ok(receipt)
    }

    /// Streaming protocol callback.
    #[instrument(
        skip(self, change),
        target = "service",
        fields(participant = %change.participant, direction = ?change.direction)
    )]
    pub async fn flow_changed(&self, now: u64, change: FlowChange) -> Result<Receipt> {
        let mut inner = self.inner.lock().await;
        let Inner {
            ledger, dispatcher, ..
        } = &mut *inner;

        let receipt = dispatcher
            .on_flow_changed(ledger, now, change)
            .context("flow change rejected")?;

        self.persist(&mut inner, &receipt).await?;
        Ok(receipt)
    }

    /// Keeper callback.
    #[instrument(skip(self), target = "service", fields(task = %task_id))]
    pub async fn execute_step(&self, now: u64, task_id: TaskId) -> Result<Receipt> {
        let mut inner = self.inner.lock().await;
        let Inner {
            ledger, dispatcher, ..
        } = &mut *inner;

        let receipt = dispatcher
            .execute_step(ledger, now, task_id)
            .context("step failed")?;

        self.persist(&mut inner, &receipt).await?;
        Ok(receipt)
    }

    pub async fn pool(&self) -> PoolSnapshot {
        self.inner.lock().await.ledger.pool().clone()
    }

    pub async fn participant(&self, address: &Address) -> Option<ParticipantState> {
        self.inner.lock().await.ledger.participant(address).cloned()
    }

    pub async fn realtime_balance(&self, address: &Address, now: u64) -> Result<u128> {
        let inner = self.inner.lock().await;
        Ok(inner.ledger.realtime_balance(address, now)?)
    }

    /// Runs `f` with exclusive access to the ledger and its dispatcher.
    pub async fn inspect<R>(&self, f: impl FnOnce(&Ledger, &mut Dispatcher<Y, K, S>) -> R) -> R {
        let mut inner = self.inner.lock().await;
        let Inner {
            ledger, dispatcher, ..
        } = &mut *inner;
        f(ledger, dispatcher)
    }

    /// Writes the receipt's snapshot and touched participants, plus any left
    /// over from an earlier failed write.
    async fn persist(&self, inner: &mut Inner<Y, K, S>, receipt: &Receipt) -> Result<()> {
        let mut addresses = std::mem::take(&mut inner.unsaved);
        addresses.extend(receipt.touched.iter().copied());

        let participants: Vec<ParticipantState> = addresses
            .iter()
            .filter_map(|a| inner.ledger.participant(a).cloned())
            .collect();
        let pool = inner.ledger.pool().clone();

        debug!(
            pool_id = pool.id,
            participants = participants.len(),
            "persisting event result"
        );

        let result = warn_if_slow("db_persist", Duration::from_millis(100), async {
            self.repo.persist(&pool, &participants).await
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, pending = addresses.len(), "persist failed; will retry");
            inner.unsaved = addresses;
            return Err(e).context("failed to persist event result");
        }
        Ok(())
    }
}
