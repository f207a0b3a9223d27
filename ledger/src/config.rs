use alloy_primitives::Address;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    // =========================
    // Outflow collateral
    // =========================
    /// Seconds of outflow reserved as buffer when a participant opens an
    /// outgoing stream (`buffer = rate · buffer_window_secs`).
    ///
    /// The buffer stays in the participant's deposit and absorbs keeper
    /// latency: the step is due when the balance reaches it, so a step up to
    /// this many seconds late is still paid for by the participant.
    pub buffer_window_secs: u64,

    /// Balance (raw units) that must remain on top of the buffer for an
    /// outgoing stream to be opened or kept alive.
    pub out_min_balance: u128,

    // =========================
    // Treasury
    // =========================
    /// Idle balance (raw units) kept in the pool on top of the outflow buffer
    /// instead of being pushed to the yield source.
    pub liquidity_reserve: u128,

    /// Share of each yield report kept as protocol yield, in basis points.
    pub protocol_fee_bps: u16,

    // =========================
    // Keeper task identity
    // =========================
    /// Account that registers step tasks with the keeper network.
    pub keeper_creator: Address,

    /// Contract the keeper calls when a step is due.
    pub step_target: Address,

    /// Selector of the step entry point on `step_target`.
    pub step_selector: [u8; 4],

    /// Token the keeper network is paid in.
    pub fee_token: Address,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            buffer_window_secs: 4 * 60 * 60,
            out_min_balance: 0,
            liquidity_reserve: 0,
            protocol_fee_bps: 0,
            keeper_creator: Address::ZERO,
            step_target: Address::ZERO,
            step_selector: [0; 4],
            fee_token: Address::ZERO,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by `STREAMPOOL_*` environment variables.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            buffer_window_secs: env_or("STREAMPOOL_BUFFER_WINDOW_SECS", d.buffer_window_secs),
            out_min_balance: env_or("STREAMPOOL_OUT_MIN_BALANCE", d.out_min_balance),
            liquidity_reserve: env_or("STREAMPOOL_LIQUIDITY_RESERVE", d.liquidity_reserve),
            protocol_fee_bps: env_or("STREAMPOOL_PROTOCOL_FEE_BPS", d.protocol_fee_bps).min(10_000),
            keeper_creator: env_or("STREAMPOOL_KEEPER_CREATOR", d.keeper_creator),
            step_target: env_or("STREAMPOOL_STEP_TARGET", d.step_target),
            step_selector: d.step_selector,
            fee_token: env_or("STREAMPOOL_FEE_TOKEN", d.fee_token),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
