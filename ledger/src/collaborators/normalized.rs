use super::{CollaboratorError, YieldReport, YieldSource};
use crate::math;

/// Wraps a yield source that accounts in the 6-decimal underlying asset so the
/// engine can keep talking 18-decimal ledger units.
///
/// Amounts below one underlying unit are truncated on the way out, which is
/// why the engine only moves multiples of [`YieldSource::granularity`].
#[derive(Debug, Clone, Default)]
pub struct NormalizedYieldSource<S> {
    inner: S,
}

impl<S: YieldSource> NormalizedYieldSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

fn widen(amount: u128) -> Result<u128, CollaboratorError> {
    math::from_underlying(amount).map_err(|e| CollaboratorError::YieldSource(e.to_string()))
}

impl<S: YieldSource> YieldSource for NormalizedYieldSource<S> {
    fn report_yield(&mut self, now: u64) -> Result<YieldReport, CollaboratorError> {
        let raw = self.inner.report_yield(now)?;
        Ok(YieldReport {
            accrued: widen(raw.accrued)?,
            total_held: widen(raw.total_held)?,
        })
    }

    fn deposit(&mut self, amount: u128) -> Result<(), CollaboratorError> {
        self.inner.deposit(math::to_underlying(amount))
    }

    fn withdraw(&mut self, amount: u128) -> Result<(), CollaboratorError> {
        self.inner.withdraw(math::to_underlying(amount))
    }

    fn granularity(&self) -> u128 {
        math::UNDERLYING_NORMALIZER
    }
}
