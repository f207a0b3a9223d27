/// Current wall-clock time in whole seconds, the ledger's time unit.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
