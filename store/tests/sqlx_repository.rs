use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use ledger::collaborators::{InMemoryKeeper, InMemoryStreaming, InMemoryYieldSource};
use ledger::participant::OutStream;
use ledger::pool::{Apy, IndexCheckpoint};
use ledger::{
    Address, B256, Dispatcher, Envelope, Event, LedgerConfig, PRECISION, ParticipantState,
    PoolSnapshot,
};
use store::db::schema;
use store::{LedgerRepository, LedgerService, SqlxLedgerRepository};

/// Isolated in-memory SQLite database; the unique name keeps parallel tests
/// apart while the shared cache lets every pooled connection see it.
async fn setup_db() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn_str)
        .await
        .unwrap();

    schema::migrate(&pool).await.unwrap();
    pool
}

fn snapshot(id: u64, timestamp: u64) -> PoolSnapshot {
    PoolSnapshot {
        id,
        timestamp,
        deposit: 1_000 * PRECISION,
        deposit_from_in_flow_rate: 30 * PRECISION,
        deposit_from_out_flow_rate: 0,
        in_flow_rate: 10,
        out_flow_rate: 2,
        out_flow_buffer: 28_800 * PRECISION,
        // Past u64 on purpose.
        yield_token_index: u128::from(u64::MAX) * 3,
        yield_in_flow_rate_index: 15_789_473,
        yield_out_flow_rate_index: 0,
        yield_accrued: 200,
        yield_snapshot: 500,
        total_yield: 1_200,
        protocol_yield: 12,
        pool_total_balance: 9_000,
        apy: Apy {
            span: 86_400,
            apy: 52_000,
        },
        nr_suppliers: 3,
    }
}

fn participant(byte: u8) -> ParticipantState {
    ParticipantState {
        address: Address::repeat_byte(byte),
        deposit: 82 * PRECISION,
        timestamp: 20,
        in_flow: 0,
        in_flow_deposit: 0,
        out_flow: 2,
        out_stream: OutStream {
            flow: 2,
            stream_duration: 41,
            stream_init: 20,
            cancel_task_id: Some(B256::repeat_byte(0xab)),
            buffer: 28_800 * PRECISION,
        },
        cumulated_yield: 42_105_240,
        checkpoint: IndexCheckpoint {
            yield_token_index: 1_052_631,
            yield_in_flow_rate_index: 15_789_473,
            yield_out_flow_rate_index: 0,
        },
    }
}

#[tokio::test]
async fn persisted_state_reads_back_unchanged() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db);

    let pool = snapshot(7, 20);
    let alice = participant(1);
    let bob = ParticipantState {
        in_flow: 10,
        in_flow_deposit: 144_000 * PRECISION,
        out_flow: 0,
        out_stream: OutStream::default(),
        ..participant(2)
    };

    repo.persist(&pool, &[alice.clone(), bob.clone()])
        .await
        .unwrap();

    assert_eq!(repo.latest_pool().await.unwrap(), Some(pool));
    assert_eq!(repo.fetch_participant(&alice.address).await.unwrap(), Some(alice.clone()));
    assert_eq!(repo.fetch_participant(&bob.address).await.unwrap(), Some(bob.clone()));
    assert_eq!(
        repo.fetch_participant(&Address::repeat_byte(9)).await.unwrap(),
        None
    );

    let all = repo.fetch_participants(10, 0).await.unwrap();
    assert_eq!(all, vec![alice, bob]);
}

#[tokio::test]
async fn snapshots_are_queried_by_id_and_time() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db);

    assert!(repo.latest_pool().await.unwrap().is_none());

    for (id, ts) in [(1, 0), (2, 10), (3, 10), (4, 25)] {
        repo.persist(&snapshot(id, ts), &[]).await.unwrap();
    }

    assert_eq!(repo.latest_pool().await.unwrap().unwrap().id, 4);
    assert_eq!(repo.pool_at(10).await.unwrap().unwrap().id, 3);
    assert_eq!(repo.pool_at(24).await.unwrap().unwrap().id, 3);
    assert_eq!(repo.pool_at(0).await.unwrap().unwrap().id, 1);

    // Re-sending a stored id keeps the first write.
    let mut replay = snapshot(4, 25);
    replay.deposit = 1;
    repo.persist(&replay, &[]).await.unwrap();
    assert_eq!(
        repo.latest_pool().await.unwrap().unwrap().deposit,
        1_000 * PRECISION
    );
}

#[tokio::test]
async fn participant_rows_are_upserted() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db);

    let mut alice = participant(1);
    repo.persist(&snapshot(1, 20), &[alice.clone()]).await.unwrap();

    alice.deposit = 0;
    alice.timestamp = 61;
    alice.out_flow = 0;
    alice.out_stream = OutStream::default();
    repo.persist(&snapshot(2, 61), &[alice.clone()]).await.unwrap();

    let stored = repo.fetch_participant(&alice.address).await.unwrap().unwrap();
    assert_eq!(stored, alice);
    assert!(stored.out_stream.cancel_task_id.is_none());
    assert_eq!(repo.fetch_participants(10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn participants_are_paged_in_address_order() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db);

    let all: Vec<_> = (1..=5u8).rev().map(participant).collect();
    repo.persist(&snapshot(1, 20), &all).await.unwrap();

    let first = repo.fetch_participants(2, 0).await.unwrap();
    let rest = repo.fetch_participants(10, 2).await.unwrap();

    let addresses: Vec<_> = first.iter().chain(&rest).map(|p| p.address).collect();
    assert_eq!(
        addresses,
        (1..=5u8).map(Address::repeat_byte).collect::<Vec<_>>()
    );
}

async fn insert_malformed_participant(db: &AnyPool) {
    sqlx::query(
        r#"
INSERT INTO participants (
  address, deposit, timestamp, in_flow, in_flow_deposit, out_flow,
  stream_duration, stream_init, cancel_task_id, out_stream_buffer,
  cumulated_yield,
  cp_yield_token_index, cp_yield_in_flow_rate_index, cp_yield_out_flow_rate_index
) VALUES ('0x0202020202020202020202020202020202020202', 'not-a-number', 0, '0', '0', '0',
  0, 0, NULL, '0', '0', '0', '0', '0');
"#,
    )
    .execute(db)
    .await
    .unwrap();
}

#[tokio::test]
async fn malformed_participant_row_fails_the_page() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db.clone());

    repo.persist(&snapshot(1, 20), &[participant(1)])
        .await
        .unwrap();
    insert_malformed_participant(&db).await;

    let err = repo.fetch_participants(10, 0).await.unwrap_err();
    assert!(format!("{err:#}").contains("malformed participant row"));

    assert!(
        repo.fetch_participant(&Address::repeat_byte(2))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn scan_skips_malformed_participant_row() {
    let db = setup_db().await;
    let repo = SqlxLedgerRepository::new(db.clone());

    repo.persist(&snapshot(1, 20), &[participant(1), participant(3)])
        .await
        .unwrap();
    insert_malformed_participant(&db).await;

    let page = repo.scan_participants(10, 0).await.unwrap();
    assert_eq!(page, vec![participant(1), participant(3)]);
}

/// `count` participants with distinct, address-ordered keys.
fn many_participants(count: u16) -> Vec<ParticipantState> {
    (1..=count)
        .map(|i| {
            let mut bytes = [0u8; 20];
            bytes[18..].copy_from_slice(&i.to_be_bytes());
            ParticipantState {
                address: Address::new(bytes),
                ..participant(1)
            }
        })
        .collect()
}

fn restore_dispatcher() -> Dispatcher<InMemoryYieldSource, InMemoryKeeper, InMemoryStreaming> {
    Dispatcher::new(
        LedgerConfig::default(),
        InMemoryYieldSource::new(),
        InMemoryKeeper::new(),
        InMemoryStreaming::new(),
    )
}

#[tokio::test]
async fn restore_reads_every_page() {
    let db = setup_db().await;
    let repo = Arc::new(SqlxLedgerRepository::new(db));
    repo.persist(&snapshot(1, 20), &many_participants(1_200))
        .await
        .unwrap();

    let restored = LedgerService::restore(repo, restore_dispatcher(), 0)
        .await
        .unwrap();
    let count = restored
        .inspect(|ledger, _| ledger.participants().count())
        .await;
    assert_eq!(count, 1_200);
}

#[tokio::test]
async fn restore_refuses_a_corrupt_participant() {
    let db = setup_db().await;
    let repo = Arc::new(SqlxLedgerRepository::new(db.clone()));
    let participants = many_participants(600);
    repo.persist(&snapshot(1, 20), &participants)
        .await
        .unwrap();

    // Early in the first page, so a skipping reader would see a short page
    // and never ask for the second.
    sqlx::query("UPDATE participants SET deposit = 'not-a-number' WHERE address = ?;")
        .bind(format!("{:#x}", participants[42].address))
        .execute(&db)
        .await
        .unwrap();

    let result = LedgerService::restore(repo, restore_dispatcher(), 0).await;
    let err = match result {
        Ok(_) => panic!("restore accepted a corrupt participant"),
        Err(e) => e,
    };
    assert!(format!("{err:#}").contains("failed to fetch participant page"));
}

#[tokio::test]
async fn service_restores_from_sqlite() {
    let db = setup_db().await;
    let repo: Arc<dyn LedgerRepository> = Arc::new(SqlxLedgerRepository::new(db));
    let alice = Address::repeat_byte(1);
    let bob = Address::repeat_byte(2);

    let dispatcher = || {
        Dispatcher::new(
            LedgerConfig::default(),
            InMemoryYieldSource::new(),
            InMemoryKeeper::new(),
            InMemoryStreaming::new(),
        )
    };

    let (pool, bob_state) = {
        let svc = LedgerService::restore(repo.clone(), dispatcher(), 0)
            .await
            .unwrap();
        svc.submit(0, Envelope::new(alice, Event::Deposit { amount: 40 }))
            .await
            .unwrap();
        svc.submit(0, Envelope::new(bob, Event::StreamStart { rate: 10 }))
            .await
            .unwrap();
        svc.submit(10, Envelope::new(alice, Event::Withdraw { amount: 5 }))
            .await
            .unwrap();
        (svc.pool().await, svc.participant(&bob).await.unwrap())
    };

    let restored = LedgerService::restore(repo, dispatcher(), 0).await.unwrap();
    assert_eq!(restored.pool().await, pool);
    assert_eq!(restored.participant(&bob).await, Some(bob_state));
    assert_eq!(restored.realtime_balance(&bob, 20).await.unwrap(), 200);
    assert_eq!(restored.realtime_balance(&alice, 20).await.unwrap(), 35);
}
