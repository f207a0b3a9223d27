use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use alloy_primitives::Address;
use tracing::info;

use crate::collaborators::TaskId;
use crate::error::LedgerError;
use crate::participant::{self, ParticipantState, Settlement};
use crate::pool::PoolSnapshot;

/// Complete engine state: the pool, every participant, and the index of live
/// keeper tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pool: PoolSnapshot,
    participants: HashMap<Address, ParticipantState>,
    tasks: HashMap<TaskId, Address>,
}

impl Ledger {
    pub fn new(genesis: u64) -> Self {
        Self {
            pool: PoolSnapshot::genesis(genesis),
            ..Self::default()
        }
    }

    /// Rebuilds a ledger from persisted rows. The task index is derived from
    /// each participant's live task.
    pub fn restore(
        pool: PoolSnapshot,
        participants: impl IntoIterator<Item = ParticipantState>,
    ) -> Self {
        let participants: HashMap<_, _> = participants
            .into_iter()
            .map(|p| (p.address, p))
            .collect();

        let tasks = participants
            .values()
            .filter_map(|p| p.out_stream.cancel_task_id.map(|id| (id, p.address)))
            .collect();

        Self {
            pool,
            participants,
            tasks,
        }
    }

    pub fn pool(&self) -> &PoolSnapshot {
        &self.pool
    }

    pub fn participant(&self, address: &Address) -> Option<&ParticipantState> {
        self.participants.get(address)
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantState> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn task_owner(&self, id: &TaskId) -> Option<Address> {
        self.tasks.get(id).copied()
    }

    /// Projected balance of `address` at `now`, in raw units.
    pub fn realtime_balance(&self, address: &Address, now: u64) -> Result<u128, LedgerError> {
        let p = self
            .participants
            .get(address)
            .ok_or(LedgerError::UnknownParticipant(*address))?;
        participant::realtime_balance(p, &self.pool, now)
    }

    /// Settles the given participants against the current snapshot without
    /// advancing it. Unknown addresses are skipped. Callers page through large
    /// sets themselves; nothing on the event path calls this.
    pub fn settle_batch(&mut self, addresses: &[Address]) -> Result<usize, LedgerError> {
        let mut tx = self.stage();
        let mut settled = 0;

        for address in addresses {
            if tx.exists(address) {
                tx.settle(*address)?;
                settled += 1;
            }
        }

        let changes = tx.finish();
        self.commit(changes);
        Ok(settled)
    }

    pub(crate) fn stage(&self) -> Staged<'_> {
        Staged {
            base: self,
            pool: self.pool.clone(),
            touched: BTreeMap::new(),
            tasks: HashMap::new(),
        }
    }

    pub(crate) fn commit(&mut self, changes: Changes) {
        self.pool = changes.pool;

        for p in changes.participants {
            self.participants.insert(p.address, p);
        }

        for (id, owner) in changes.tasks {
            match owner {
                Some(owner) => {
                    self.tasks.insert(id, owner);
                }
                None => {
                    self.tasks.remove(&id);
                }
            }
        }
    }
}

/// Private working copy of the pool and of the participants an event touches.
/// Dropping it discards the event.
pub(crate) struct Staged<'l> {
    base: &'l Ledger,
    pub(crate) pool: PoolSnapshot,
    touched: BTreeMap<Address, ParticipantState>,
    /// `Some` arms a task for its owner, `None` forgets it.
    tasks: HashMap<TaskId, Option<Address>>,
}

impl Staged<'_> {
    pub(crate) fn get(&self, address: &Address) -> Option<&ParticipantState> {
        self.touched
            .get(address)
            .or_else(|| self.base.participants.get(address))
    }

    pub(crate) fn exists(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    pub(crate) fn load(&mut self, address: Address) -> Result<&mut ParticipantState, LedgerError> {
        match self.touched.entry(address) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let p = self
                    .base
                    .participants
                    .get(&address)
                    .cloned()
                    .ok_or(LedgerError::UnknownParticipant(address))?;
                Ok(v.insert(p))
            }
        }
    }

    pub(crate) fn load_or_create(&mut self, address: Address) -> &mut ParticipantState {
        match self.touched.entry(address) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => match self.base.participants.get(&address) {
                Some(p) => v.insert(p.clone()),
                None => {
                    self.pool.nr_suppliers = self.pool.nr_suppliers.saturating_add(1);
                    info!(participant = %address, "participant created");
                    v.insert(ParticipantState::new(address, &self.pool))
                }
            },
        }
    }

    pub(crate) fn settle(&mut self, address: Address) -> Result<Settlement, LedgerError> {
        self.load(address)?;
        let p = self
            .touched
            .get_mut(&address)
            .ok_or(LedgerError::UnknownParticipant(address))?;
        participant::settle(p, &mut self.pool)
    }

    pub(crate) fn task_owner(&self, id: &TaskId) -> Option<Address> {
        match self.tasks.get(id) {
            Some(owner) => *owner,
            None => self.base.task_owner(id),
        }
    }

    pub(crate) fn track_task(&mut self, id: TaskId, owner: Address) {
        self.tasks.insert(id, Some(owner));
    }

    pub(crate) fn untrack_task(&mut self, id: TaskId) {
        self.tasks.insert(id, None);
    }

    pub(crate) fn finish(self) -> Changes {
        let mut pool = self.pool;
        if pool != self.base.pool && pool.id == self.base.pool.id {
            pool.id += 1;
        }

        Changes {
            pool,
            participants: self.touched.into_values().collect(),
            tasks: self.tasks.into_iter().collect(),
        }
    }
}

/// Everything one event writes, applied by [`Ledger::commit`].
pub(crate) struct Changes {
    pub(crate) pool: PoolSnapshot,
    pub(crate) participants: Vec<ParticipantState>,
    pub(crate) tasks: Vec<(TaskId, Option<Address>)>,
}

impl Changes {
    pub(crate) fn addresses(&self) -> Vec<Address> {
        self.participants.iter().map(|p| p.address).collect()
    }
}
