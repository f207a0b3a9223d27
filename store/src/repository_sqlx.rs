use std::str::FromStr;

use alloy_primitives::{Address, B256};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};

use ledger::participant::OutStream;
use ledger::pool::{Apy, IndexCheckpoint};
use ledger::{ParticipantState, PoolSnapshot};

use crate::repository::LedgerRepository;

/// SQLx-backed implementation of LedgerRepository.
/// Responsible only for persistence and row mapping.
pub struct SqlxLedgerRepository {
    pool: AnyPool,
}

impl SqlxLedgerRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Page of participants for display. Unlike
    /// [`LedgerRepository::fetch_participants`], rows that fail to decode are
    /// logged and left out instead of failing the page.
    pub async fn scan_participants(
        &self,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<ParticipantState>> {
        let rows = self.participant_rows(limit, offset).await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_participant(&r) {
                Ok(p) => out.push(p),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the page
                    tracing::warn!(error = %e, "skipping malformed participant row");
                }
            }
        }

        Ok(out)
    }

    async fn participant_rows(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<AnyRow>> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants ORDER BY address LIMIT ? OFFSET ?;"
        );
        Ok(sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }
}

const POOL_COLUMNS: &str = r#"
  id, timestamp,
  deposit, deposit_from_in_flow_rate, deposit_from_out_flow_rate,
  in_flow_rate, out_flow_rate, out_flow_buffer,
  yield_token_index, yield_in_flow_rate_index, yield_out_flow_rate_index,
  yield_accrued, yield_snapshot, total_yield, protocol_yield,
  pool_total_balance, apy_span, apy, nr_suppliers
"#;

const PARTICIPANT_COLUMNS: &str = r#"
  address, deposit, timestamp,
  in_flow, in_flow_deposit, out_flow,
  stream_duration, stream_init, cancel_task_id, out_stream_buffer,
  cumulated_yield,
  cp_yield_token_index, cp_yield_in_flow_rate_index, cp_yield_out_flow_rate_index
"#;

#[async_trait]
impl LedgerRepository for SqlxLedgerRepository {
    async fn latest_pool(&self) -> anyhow::Result<Option<PoolSnapshot>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pool_snapshots ORDER BY id DESC LIMIT 1;");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_pool).transpose()
    }

    async fn pool_at(&self, timestamp: u64) -> anyhow::Result<Option<PoolSnapshot>> {
        let sql = format!(
            "SELECT {POOL_COLUMNS} FROM pool_snapshots WHERE timestamp <= ? ORDER BY id DESC LIMIT 1;"
        );
        let row = sqlx::query(&sql)
            .bind(u64_to_i64(timestamp)?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_pool).transpose()
    }

    async fn fetch_participants(
        &self,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<ParticipantState>> {
        self.participant_rows(limit, offset)
            .await?
            .iter()
            .map(|r| {
                row_to_participant(r).with_context(|| {
                    let address = r.try_get::<String, _>("address").unwrap_or_default();
                    format!("malformed participant row {address}")
                })
            })
            .collect()
    }

    async fn fetch_participant(
        &self,
        address: &Address,
    ) -> anyhow::Result<Option<ParticipantState>> {
        let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE address = ?;");
        let row = sqlx::query(&sql)
            .bind(address_key(address))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_participant).transpose()
    }

    async fn persist(
        &self,
        pool: &PoolSnapshot,
        participants: &[ParticipantState],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        // Snapshot ids are bumped on every change, so an existing id already
        // holds this content.
        sqlx::query(
            r#"
INSERT INTO pool_snapshots (
  id, timestamp,
  deposit, deposit_from_in_flow_rate, deposit_from_out_flow_rate,
  in_flow_rate, out_flow_rate, out_flow_buffer,
  yield_token_index, yield_in_flow_rate_index, yield_out_flow_rate_index,
  yield_accrued, yield_snapshot, total_yield, protocol_yield,
  pool_total_balance, apy_span, apy, nr_suppliers
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO NOTHING;
"#,
        )
        .bind(u64_to_i64(pool.id)?)
        .bind(u64_to_i64(pool.timestamp)?)
        .bind(pool.deposit.to_string())
        .bind(pool.deposit_from_in_flow_rate.to_string())
        .bind(pool.deposit_from_out_flow_rate.to_string())
        .bind(pool.in_flow_rate.to_string())
        .bind(pool.out_flow_rate.to_string())
        .bind(pool.out_flow_buffer.to_string())
        .bind(pool.yield_token_index.to_string())
        .bind(pool.yield_in_flow_rate_index.to_string())
        .bind(pool.yield_out_flow_rate_index.to_string())
        .bind(pool.yield_accrued.to_string())
        .bind(pool.yield_snapshot.to_string())
        .bind(pool.total_yield.to_string())
        .bind(pool.protocol_yield.to_string())
        .bind(pool.pool_total_balance.to_string())
        .bind(u64_to_i64(pool.apy.span)?)
        .bind(pool.apy.apy.to_string())
        .bind(pool.nr_suppliers as i64)
        .execute(&mut *tx)
        .await
        .context("insert pool snapshot")?;

        for p in participants {
            sqlx::query(
                r#"
INSERT INTO participants (
  address, deposit, timestamp,
  in_flow, in_flow_deposit, out_flow,
  stream_duration, stream_init, cancel_task_id, out_stream_buffer,
  cumulated_yield,
  cp_yield_token_index, cp_yield_in_flow_rate_index, cp_yield_out_flow_rate_index
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(address) DO UPDATE SET
  deposit = excluded.deposit,
  timestamp = excluded.timestamp,
  in_flow = excluded.in_flow,
  in_flow_deposit = excluded.in_flow_deposit,
  out_flow = excluded.out_flow,
  stream_duration = excluded.stream_duration,
  stream_init = excluded.stream_init,
  cancel_task_id = excluded.cancel_task_id,
  out_stream_buffer = excluded.out_stream_buffer,
  cumulated_yield = excluded.cumulated_yield,
  cp_yield_token_index = excluded.cp_yield_token_index,
  cp_yield_in_flow_rate_index = excluded.cp_yield_in_flow_rate_index,
  cp_yield_out_flow_rate_index = excluded.cp_yield_out_flow_rate_index;
"#,
            )
            .bind(address_key(&p.address))
            .bind(p.deposit.to_string())
            .bind(u64_to_i64(p.timestamp)?)
            .bind(p.in_flow.to_string())
            .bind(p.in_flow_deposit.to_string())
            .bind(p.out_flow.to_string())
            .bind(u64_to_i64(p.out_stream.stream_duration)?)
            .bind(u64_to_i64(p.out_stream.stream_init)?)
            .bind(p.out_stream.cancel_task_id.map(|id| format!("{id:#x}")))
            .bind(p.out_stream.buffer.to_string())
            .bind(p.cumulated_yield.to_string())
            .bind(p.checkpoint.yield_token_index.to_string())
            .bind(p.checkpoint.yield_in_flow_rate_index.to_string())
            .bind(p.checkpoint.yield_out_flow_rate_index.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert participant {}", p.address))?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/* =========================
Row mapping + conversions
========================= */

fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}

fn row_to_pool(r: &AnyRow) -> anyhow::Result<PoolSnapshot> {
    Ok(PoolSnapshot {
        id: i64_to_u64(r.try_get("id")?)?,
        timestamp: i64_to_u64(r.try_get("timestamp")?)?,
        deposit: u128_col(r, "deposit")?,
        deposit_from_in_flow_rate: u128_col(r, "deposit_from_in_flow_rate")?,
        deposit_from_out_flow_rate: u128_col(r, "deposit_from_out_flow_rate")?,
        in_flow_rate: i128_col(r, "in_flow_rate")?,
        out_flow_rate: i128_col(r, "out_flow_rate")?,
        out_flow_buffer: u128_col(r, "out_flow_buffer")?,
        yield_token_index: u128_col(r, "yield_token_index")?,
        yield_in_flow_rate_index: u128_col(r, "yield_in_flow_rate_index")?,
        yield_out_flow_rate_index: u128_col(r, "yield_out_flow_rate_index")?,
        yield_accrued: u128_col(r, "yield_accrued")?,
        yield_snapshot: u128_col(r, "yield_snapshot")?,
        total_yield: u128_col(r, "total_yield")?,
        protocol_yield: u128_col(r, "protocol_yield")?,
        pool_total_balance: u128_col(r, "pool_total_balance")?,
        apy: Apy {
            span: i64_to_u64(r.try_get("apy_span")?)?,
            apy: u128_col(r, "apy")?,
        },
        nr_suppliers: i64_to_u32(r.try_get("nr_suppliers")?)?,
    })
}

fn row_to_participant(r: &AnyRow) -> anyhow::Result<ParticipantState> {
    let address_str: String = r.try_get("address")?;
    let address = Address::from_str(&address_str).context("invalid address")?;

    let cancel_task_id = r
        .try_get::<Option<String>, _>("cancel_task_id")?
        .map(|s| B256::from_str(&s).context("invalid cancel_task_id"))
        .transpose()?;

    let out_flow = i128_col(r, "out_flow")?;

    Ok(ParticipantState {
        address,
        deposit: u128_col(r, "deposit")?,
        timestamp: i64_to_u64(r.try_get("timestamp")?)?,
        in_flow: i128_col(r, "in_flow")?,
        in_flow_deposit: u128_col(r, "in_flow_deposit")?,
        out_flow,
        out_stream: OutStream {
            flow: out_flow,
            stream_duration: i64_to_u64(r.try_get("stream_duration")?)?,
            stream_init: i64_to_u64(r.try_get("stream_init")?)?,
            cancel_task_id,
            buffer: u128_col(r, "out_stream_buffer")?,
        },
        cumulated_yield: u128_col(r, "cumulated_yield")?,
        checkpoint: IndexCheckpoint {
            yield_token_index: u128_col(r, "cp_yield_token_index")?,
            yield_in_flow_rate_index: u128_col(r, "cp_yield_in_flow_rate_index")?,
            yield_out_flow_rate_index: u128_col(r, "cp_yield_out_flow_rate_index")?,
        },
    })
}

/* =========================
Numeric safety helpers
========================= */

fn u128_col(r: &AnyRow, column: &'static str) -> anyhow::Result<u128> {
    let text: String = r.try_get(column)?;
    text_to_u128(&text).with_context(|| format!("column {column}"))
}

fn i128_col(r: &AnyRow, column: &'static str) -> anyhow::Result<i128> {
    let text: String = r.try_get(column)?;
    text_to_i128(&text).with_context(|| format!("column {column}"))
}

fn text_to_u128(v: &str) -> anyhow::Result<u128> {
    v.parse::<u128>()
        .map_err(|e| anyhow!("not a u128: {v:?} ({e})"))
}

fn text_to_i128(v: &str) -> anyhow::Result<i128> {
    v.parse::<i128>()
        .map_err(|e| anyhow!("not an i128: {v:?} ({e})"))
}

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    u32::try_from(v).map_err(|_| anyhow!("out of range for u32: {v}"))
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
