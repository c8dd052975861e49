//! Concurrent claims against a backend without conditional writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use shuttle_core::app::{CoordinatorContext, LeaseManager, LeaseSettings, StaleSweeper};
use shuttle_core::domain::{
    AttemptToken, InstanceId, LeaseError, LeaseStatus, OwnerId, SharedLeaseState, TaskId,
};
use shuttle_core::impls::{
    InMemoryStateStore, JsonFileStateStore, MemoryEventSink, SimulatedLatencyStore,
};
use shuttle_core::ports::{Clock, Expectation, FixedClock, StateStore, UlidGenerator};
use ulid::Ulid;

fn manager(
    store: Arc<dyn StateStore>,
    clock: &FixedClock,
    events: &MemoryEventSink,
    verify_delay: Duration,
) -> LeaseManager {
    LeaseManager::new(
        store,
        Arc::new(clock.clone()),
        Arc::new(UlidGenerator::new(clock.clone())),
        Arc::new(events.clone()),
        LeaseSettings {
            verify_delay,
            ..LeaseSettings::default()
        },
    )
}

fn owner(instance: &str) -> OwnerId {
    OwnerId::new(InstanceId::new(instance), "agent")
}

#[tokio::test(start_paused = true)]
async fn later_write_wins_and_earlier_claimer_backs_off() {
    let inner = InMemoryStateStore::new();
    // first write issued is slow, second is fast: they land in reverse order
    let store: Arc<dyn StateStore> = Arc::new(
        SimulatedLatencyStore::new(inner.clone())
            .with_write_delays([Duration::from_millis(300), Duration::from_millis(100)]),
    );
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    let events = MemoryEventSink::new();
    let verify = Duration::from_millis(500);
    let a = manager(Arc::clone(&store), &clock, &events, verify);
    let b = manager(Arc::clone(&store), &clock, &events, verify);
    let task = TaskId::new("T-42");

    let (owner_a, owner_b) = (owner("a"), owner("b"));
    let (res_a, res_b) = tokio::join!(a.claim(&task, &owner_a), b.claim(&task, &owner_b));

    let winner = res_a.expect("a's write landed last and survives its re-read");
    match res_b {
        Err(LeaseError::AlreadyClaimed { owner_id, .. }) => assert_eq!(owner_id, owner("a")),
        other => panic!("expected b to lose, got {other:?}"),
    }

    let stored = inner.read(&task).await.unwrap().unwrap();
    assert_eq!(stored.attempt_token, winner.attempt_token);
    assert_eq!(events.named("claimed").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn without_a_verify_delay_both_claimers_can_believe_they_won() {
    let inner = InMemoryStateStore::new();
    let store: Arc<dyn StateStore> = Arc::new(
        SimulatedLatencyStore::new(inner.clone())
            .with_write_delays([Duration::from_millis(300), Duration::from_millis(100)]),
    );
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    let events = MemoryEventSink::new();
    let a = manager(Arc::clone(&store), &clock, &events, Duration::ZERO);
    let b = manager(Arc::clone(&store), &clock, &events, Duration::ZERO);
    let task = TaskId::new("T-42");

    let (owner_a, owner_b) = (owner("a"), owner("b"));
    let (res_a, res_b) = tokio::join!(a.claim(&task, &owner_a), b.claim(&task, &owner_b));
    let lease_a = res_a.unwrap();
    let lease_b = res_b.unwrap();

    // b verified before a's slow write landed; the first renewal settles it
    clock.advance(Duration::from_secs(30));
    let err = b
        .renew(&task, &owner("b"), &lease_b.attempt_token)
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::LostLease { .. }));
    a.renew(&task, &owner("a"), &lease_a.attempt_token)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn conditional_store_rejects_the_second_claim_outright() {
    let store = InMemoryStateStore::new();
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    let events = MemoryEventSink::new();
    let a = manager(Arc::new(store.clone()), &clock, &events, Duration::ZERO);
    let b = manager(Arc::new(store.clone()), &clock, &events, Duration::ZERO);
    let task = TaskId::new("T-1");

    let (owner_a, owner_b) = (owner("a"), owner("b"));
    let (res_a, res_b) = tokio::join!(a.claim(&task, &owner_a), b.claim(&task, &owner_b));

    assert_eq!(
        [res_a.is_ok(), res_b.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );
    assert_eq!(events.named("claimed").len(), 1);
}

/// A worker renews an overdue lease while another instance sweeps it.
///
/// Reads take 10ms. The renew write is issued first but lands at t=25ms; the
/// sweep's stale write lands at t=20ms and its re-read happens at t=30ms, so
/// the sweep sees the renewal and must back off.
async fn delayed_renew_beats_sweep<S: StateStore + Clone + 'static>(inner: S) {
    let store: Arc<dyn StateStore> = Arc::new(
        SimulatedLatencyStore::new(inner.clone())
            .with_read_delay(Duration::from_millis(10))
            .with_write_delays([Duration::from_millis(15), Duration::ZERO]),
    );
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    let events = MemoryEventSink::new();
    let worker = manager(Arc::clone(&store), &clock, &events, Duration::ZERO);
    let coordinator = Arc::new(manager(
        Arc::clone(&store),
        &clock,
        &events,
        Duration::ZERO,
    ));
    let sweeper = StaleSweeper::new(
        Arc::clone(&coordinator),
        Arc::new(UlidGenerator::new(clock.clone())),
    );

    let task = TaskId::new("T-42");
    let token = AttemptToken::from_ulid(Ulid::new());
    let held = SharedLeaseState::claimed(task.clone(), owner("w1"), token, clock.now(), 0);
    inner.write(&held, Expectation::Any).await.unwrap();
    clock.advance(Duration::from_secs(301));

    let ctx = CoordinatorContext::assume(InstanceId::new("c1"), coordinator.now());
    let owner_w1 = owner("w1");
    let (renewed, report) = tokio::join!(
        worker.renew(&task, &owner_w1, &token),
        sweeper.sweep(&ctx)
    );

    let renewed = renewed.expect("the renewal landed last and survives its re-read");
    let report = report.unwrap();
    assert!(report.reclaimed.is_empty());
    assert_eq!(report.failed, 0);
    assert!(events.named("reclaimed").is_empty());

    let stored = inner.read(&task).await.unwrap().unwrap();
    assert_eq!(stored.status, LeaseStatus::Working);
    assert_eq!(stored.attempt_token, token);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.heartbeat_at, renewed.heartbeat_at);
}

#[tokio::test(start_paused = true)]
async fn sweep_backs_off_when_a_delayed_renewal_lands_after_it() {
    delayed_renew_beats_sweep(InMemoryStateStore::new()).await;
}

#[tokio::test(start_paused = true)]
async fn sweep_backs_off_from_a_delayed_renewal_on_the_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStateStore::open(dir.path()).await.unwrap();
    delayed_renew_beats_sweep(store).await;
}
