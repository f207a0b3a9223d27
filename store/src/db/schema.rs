use sqlx::AnyPool;

/// 128-bit quantities are stored as decimal TEXT; seconds and counters fit
/// BIGINT.
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Pool snapshots, one row per mutation
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS pool_snapshots (
  id BIGINT PRIMARY KEY,
  timestamp BIGINT NOT NULL,
  deposit TEXT NOT NULL,
  deposit_from_in_flow_rate TEXT NOT NULL,
  deposit_from_out_flow_rate TEXT NOT NULL,
  in_flow_rate TEXT NOT NULL,
  out_flow_rate TEXT NOT NULL,
  out_flow_buffer TEXT NOT NULL,
  yield_token_index TEXT NOT NULL,
  yield_in_flow_rate_index TEXT NOT NULL,
  yield_out_flow_rate_index TEXT NOT NULL,
  yield_accrued TEXT NOT NULL,
  yield_snapshot TEXT NOT NULL,
  total_yield TEXT NOT NULL,
  protocol_yield TEXT NOT NULL,
  pool_total_balance TEXT NOT NULL,
  apy_span BIGINT NOT NULL,
  apy TEXT NOT NULL,
  nr_suppliers BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Participants
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS participants (
  address TEXT PRIMARY KEY,
  deposit TEXT NOT NULL,
  timestamp BIGINT NOT NULL,
  in_flow TEXT NOT NULL,
  in_flow_deposit TEXT NOT NULL,
  out_flow TEXT NOT NULL,
  stream_duration BIGINT NOT NULL,
  stream_init BIGINT NOT NULL,
  cancel_task_id TEXT NULL,
  out_stream_buffer TEXT NOT NULL,
  cumulated_yield TEXT NOT NULL,
  cp_yield_token_index TEXT NOT NULL,
  cp_yield_in_flow_rate_index TEXT NOT NULL,
  cp_yield_out_flow_rate_index TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_pool_snapshots_timestamp ON pool_snapshots(timestamp);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
