use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinSet;

use ledger::collaborators::{InMemoryKeeper, InMemoryStreaming, InMemoryYieldSource};
use ledger::{
    Address, Dispatcher, Envelope, Event, EventOutcome, FlowChange, LedgerConfig, PRECISION,
};
use store::{LedgerRepository, LedgerService};

use mock_repository::InMemoryLedgerRepository;

type Service = LedgerService<InMemoryYieldSource, InMemoryKeeper, InMemoryStreaming>;

fn dispatcher() -> Dispatcher<InMemoryYieldSource, InMemoryKeeper, InMemoryStreaming> {
    Dispatcher::new(
        LedgerConfig {
            buffer_window_secs: 10,
            ..LedgerConfig::default()
        },
        InMemoryYieldSource::new(),
        InMemoryKeeper::new(),
        InMemoryStreaming::new(),
    )
}

async fn service(repo: Arc<InMemoryLedgerRepository>) -> Service {
    LedgerService::restore(repo, dispatcher(), 0).await.unwrap()
}

fn deposit(sender: Address, amount: u128) -> Envelope {
    Envelope::new(sender, Event::Deposit { amount })
}

#[tokio::test]
async fn submit_persists_snapshot_and_touched_participants() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = service(repo.clone()).await;
    let alice = Address::repeat_byte(1);
    let bob = Address::repeat_byte(2);

    svc.submit(0, deposit(alice, 50)).await.unwrap();
    let receipt = svc
        .submit(5, Envelope::new(alice, Event::Transfer { to: bob, amount: 20 }))
        .await
        .unwrap();

    let pool = repo.latest_pool().await.unwrap().unwrap();
    assert_eq!(pool.id, receipt.pool_id);
    assert_eq!(pool.timestamp, 5);
    assert_eq!(pool.nr_suppliers, 2);

    let stored_bob = repo.fetch_participant(&bob).await.unwrap().unwrap();
    assert_eq!(stored_bob.deposit, 20 * PRECISION);
    assert_eq!(svc.participant(&bob).await, Some(stored_bob));
}

#[tokio::test]
async fn rejected_event_is_not_persisted() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = service(repo.clone()).await;
    let alice = Address::repeat_byte(1);

    svc.submit(0, deposit(alice, 10)).await.unwrap();
    let stored = repo.latest_pool().await.unwrap();

    let err = svc
        .submit(3, Envelope::new(alice, Event::Withdraw { amount: 11 }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("event rejected"));

    assert_eq!(repo.latest_pool().await.unwrap(), stored);
    assert_eq!(svc.pool().await.timestamp, 0);
}

#[tokio::test]
async fn restore_resumes_from_repository() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let alice = Address::repeat_byte(1);

    let task = {
        let svc = service(repo.clone()).await;
        svc.submit(0, deposit(alice, 100)).await.unwrap();
        svc.submit(0, Envelope::new(alice, Event::OutStreamStart { rate: 1 }))
            .await
            .unwrap();
        svc.participant(&alice)
            .await
            .and_then(|p| p.out_stream.cancel_task_id)
            .unwrap()
    };

    let restored = service(repo.clone()).await;
    assert_eq!(restored.pool().await.out_flow_rate, 1);
    assert_eq!(restored.realtime_balance(&alice, 40).await.unwrap(), 60);

    // Due when 100 less the 10 buffer has streamed out.
    let receipt = restored.execute_step(90, task).await.unwrap();
    assert_eq!(
        receipt.outcome,
        EventOutcome::StreamClosed {
            participant: alice,
            buffer_consumed: 0,
            shortfall: 0,
        }
    );
    assert!(
        !repo
            .fetch_participant(&alice)
            .await
            .unwrap()
            .unwrap()
            .has_outflow()
    );
}

#[tokio::test]
async fn failed_write_is_retried_with_next_event() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = service(repo.clone()).await;
    let alice = Address::repeat_byte(1);
    let bob = Address::repeat_byte(2);

    repo.fail_persist.store(true, Ordering::SeqCst);
    let err = svc.submit(0, deposit(alice, 10)).await.unwrap_err();
    assert!(err.to_string().contains("failed to persist"));
    assert!(repo.fetch_participant(&alice).await.unwrap().is_none());

    repo.fail_persist.store(false, Ordering::SeqCst);
    svc.submit(1, deposit(bob, 5)).await.unwrap();

    let stored_alice = repo.fetch_participant(&alice).await.unwrap().unwrap();
    assert_eq!(stored_alice.deposit, 10 * PRECISION);
}

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = Arc::new(service(repo.clone()).await);

    let mut set = JoinSet::new();
    for i in 1..=16u8 {
        let svc = svc.clone();
        set.spawn(async move { svc.submit(0, deposit(Address::repeat_byte(i), 7)).await });
    }
    while let Some(res) = set.join_next().await {
        res.unwrap().unwrap();
    }

    let pool = svc.pool().await;
    assert_eq!(pool.nr_suppliers, 16);
    assert_eq!(pool.deposit, 16 * 7 * PRECISION);
    assert_eq!(repo.participants.lock().await.len(), 16);
}

#[tokio::test]
async fn keeper_tasks_are_visible_through_inspect() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = service(repo).await;
    let alice = Address::repeat_byte(1);

    svc.submit(0, deposit(alice, 30)).await.unwrap();
    svc.submit(0, Envelope::new(alice, Event::OutStreamStart { rate: 2 }))
        .await
        .unwrap();

    // 30 less the 20 buffer lasts 5 s at 2/s.
    let due = svc.inspect(|_, d| d.keeper().due(5)).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, 5);
}

#[tokio::test]
async fn flow_callbacks_are_applied_and_persisted() {
    let repo = Arc::new(InMemoryLedgerRepository::default());
    let svc = service(repo.clone()).await;
    let bob = Address::repeat_byte(2);

    svc.flow_changed(0, FlowChange::inbound(bob, 0, 10))
        .await
        .unwrap();
    svc.flow_changed(20, FlowChange::inbound(bob, 10, 0))
        .await
        .unwrap();

    let stored = repo.fetch_participant(&bob).await.unwrap().unwrap();
    assert_eq!(stored.in_flow, 0);
    assert_eq!(stored.deposit, 200 * PRECISION);
    assert_eq!(repo.latest_pool().await.unwrap().unwrap().in_flow_rate, 0);

    let err = svc
        .flow_changed(30, FlowChange::inbound(bob, 0, 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("flow change rejected"));
}
