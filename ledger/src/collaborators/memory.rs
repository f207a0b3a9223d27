use std::collections::{BTreeMap, HashMap};

use alloy_primitives::Address;
use tracing::debug;

use super::{
    CollaboratorError, Keeper, StreamingProtocol, TaskId, YieldReport, YieldSource,
};
use crate::math::{self, Fixed, SignedRate};

/// Yield source held in memory. Yield comes from a per-second rate applied to
/// the time since the last report plus anything queued with [`Self::accrue`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryYieldSource {
    pub principal: u128,
    pub yield_per_second: u128,
    pending: u128,
    last_report: Option<u64>,
    fail_with: Option<String>,
}

impl InMemoryYieldSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(yield_per_second: u128) -> Self {
        Self {
            yield_per_second,
            ..Self::default()
        }
    }

    /// Queues yield to be reported by the next `report_yield`.
    pub fn accrue(&mut self, amount: u128) {
        self.pending = self.pending.saturating_add(amount);
    }

    /// Every call fails with `reason` until cleared with `None`.
    pub fn set_failure(&mut self, reason: Option<&str>) {
        self.fail_with = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), CollaboratorError> {
        match &self.fail_with {
            Some(reason) => Err(CollaboratorError::YieldSource(reason.clone())),
            None => Ok(()),
        }
    }
}

fn overflow(what: &str) -> CollaboratorError {
    CollaboratorError::YieldSource(format!("{what} overflows"))
}

impl YieldSource for InMemoryYieldSource {
    fn report_yield(&mut self, now: u64) -> Result<YieldReport, CollaboratorError> {
        self.check()?;

        let elapsed = self.last_report.map_or(0, |t| now.saturating_sub(t));
        let accrued = self
            .yield_per_second
            .checked_mul(elapsed as u128)
            .and_then(|earned| earned.checked_add(self.pending))
            .ok_or_else(|| overflow("accrued yield"))?;
        let principal = self
            .principal
            .checked_add(accrued)
            .ok_or_else(|| overflow("held principal"))?;

        self.pending = 0;
        self.last_report = Some(now);
        self.principal = principal;

        debug!(accrued, total_held = self.principal, "yield reported");

        Ok(YieldReport {
            accrued,
            total_held: self.principal,
        })
    }

    fn deposit(&mut self, amount: u128) -> Result<(), CollaboratorError> {
        self.check()?;
        self.principal = self
            .principal
            .checked_add(amount)
            .ok_or_else(|| overflow("held principal"))?;
        Ok(())
    }

    fn withdraw(&mut self, amount: u128) -> Result<(), CollaboratorError> {
        self.check()?;
        self.principal = self.principal.checked_sub(amount).ok_or_else(|| {
            CollaboratorError::YieldSource(format!(
                "withdraw {amount} exceeds held {}",
                self.principal
            ))
        })?;
        Ok(())
    }
}

/// Keeper network stand-in: remembers what is armed and what was cancelled.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeeper {
    scheduled: HashMap<TaskId, u64>,
    pub cancelled: Vec<TaskId>,
    fail_with: Option<String>,
}

impl InMemoryKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&mut self, reason: Option<&str>) {
        self.fail_with = reason.map(str::to_string);
    }

    pub fn scheduled_at(&self, id: &TaskId) -> Option<u64> {
        self.scheduled.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Armed tasks with `exec_timestamp <= now`, earliest first.
    pub fn due(&self, now: u64) -> Vec<(u64, TaskId)> {
        let mut out: Vec<_> = self
            .scheduled
            .iter()
            .filter(|(_, ts)| **ts <= now)
            .map(|(id, ts)| (*ts, *id))
            .collect();
        out.sort();
        out
    }

    /// Removes a task the network has just executed.
    pub fn take(&mut self, id: &TaskId) -> Option<u64> {
        self.scheduled.remove(id)
    }
}

impl Keeper for InMemoryKeeper {
    fn schedule_task(&mut self, id: TaskId, exec_timestamp: u64) -> Result<(), CollaboratorError> {
        if let Some(reason) = &self.fail_with {
            return Err(CollaboratorError::Keeper(reason.clone()));
        }
        self.scheduled.insert(id, exec_timestamp);
        Ok(())
    }

    fn cancel_task(&mut self, id: TaskId) -> Result<(), CollaboratorError> {
        if let Some(reason) = &self.fail_with {
            return Err(CollaboratorError::Keeper(reason.clone()));
        }
        self.scheduled.remove(&id);
        self.cancelled.push(id);
        Ok(())
    }
}

/// Streaming protocol stand-in. Locks `rate · deposit_window_secs` per stream
/// and records the pool's outgoing flows.
#[derive(Debug, Clone)]
pub struct InMemoryStreaming {
    pub deposit_window_secs: u64,
    outflows: BTreeMap<Address, SignedRate>,
}

impl Default for InMemoryStreaming {
    fn default() -> Self {
        Self {
            deposit_window_secs: 4 * 60 * 60,
            outflows: BTreeMap::new(),
        }
    }
}

impl InMemoryStreaming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outflow(&self, receiver: &Address) -> SignedRate {
        self.outflows.get(receiver).copied().unwrap_or(0)
    }
}

impl StreamingProtocol for InMemoryStreaming {
    fn flow_deposit(&self, rate: SignedRate) -> Result<Fixed, CollaboratorError> {
        let rate = math::rate_magnitude(rate)
            .map_err(|e| CollaboratorError::Streaming(e.to_string()))?;

        rate.checked_mul(self.deposit_window_secs as u128)
            .and_then(|v| v.checked_mul(math::PRECISION))
            .ok_or_else(|| CollaboratorError::Streaming("flow deposit overflow".into()))
    }

    fn set_outflow(
        &mut self,
        receiver: Address,
        rate: SignedRate,
    ) -> Result<(), CollaboratorError> {
        if rate < 0 {
            return Err(CollaboratorError::Streaming(format!("negative rate {rate}")));
        }
        if rate == 0 {
            self.outflows.remove(&receiver);
        } else {
            self.outflows.insert(receiver, rate);
        }
        Ok(())
    }
}
