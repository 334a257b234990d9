use cluster_reindexer::{
    Cluster, CompletionCode, DocumentType, InMemoryMetric, InMemoryReindexingStore,
    MaintainerHealth, ManualClock, Reindexer, ReindexingMaintainer, ReindexingStore,
    SessionHandle, State, VisitorParameters,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::watch;

fn setup(store: Arc<InMemoryReindexingStore>, visits: Arc<AtomicUsize>) -> Arc<Reindexer> {
    let music = DocumentType::new("music");
    let sessions = move |parameters: VisitorParameters| {
        visits.fetch_add(1, Ordering::SeqCst);
        parameters.control.on_done(CompletionCode::Success, "OK");
        SessionHandle::new(|| {})
    };
    let reindexer = Reindexer::new(
        Cluster::new(
            "cluster",
            "id",
            BTreeMap::from([(music.clone(), "default".to_string())]),
        ),
        BTreeMap::from([(music, UNIX_EPOCH)]),
        store,
        Arc::new(sessions),
        Arc::new(InMemoryMetric::new()),
        Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_millis(10))),
    )
    .unwrap()
    .with_lock_timeout(Duration::from_millis(1));
    Arc::new(reindexer)
}

async fn wait_for(
    health: &mut watch::Receiver<MaintainerHealth>,
    done: impl FnMut(&MaintainerHealth) -> bool,
) -> MaintainerHealth {
    tokio::time::timeout(Duration::from_secs(10), health.wait_for(done))
        .await
        .expect("maintainer health did not change in time")
        .expect("maintainer health channel closed")
        .clone()
}

#[tokio::test]
async fn runs_immediately_and_on_trigger() {
    let store = Arc::new(InMemoryReindexingStore::new("cluster"));
    let visits = Arc::new(AtomicUsize::new(0));
    let maintainer =
        ReindexingMaintainer::start(setup(store.clone(), visits.clone()), Duration::from_secs(3600))
            .unwrap();
    let mut health = maintainer.health_stream();

    let first = wait_for(&mut health, |h| h.runs >= 1 && !h.running).await;
    assert_eq!(first.consecutive_failures, 0);
    assert!(first.last_success_unix_ms.is_some());
    assert_eq!(visits.load(Ordering::SeqCst), 1);
    assert_eq!(
        store
            .read()
            .unwrap()
            .status(&DocumentType::new("music"))
            .map(|status| status.state()),
        Some(State::Successful)
    );

    maintainer.trigger().await.unwrap();
    wait_for(&mut health, |h| h.runs >= 2 && !h.running).await;
    // Already reindexed for this threshold.
    assert_eq!(visits.load(Ordering::SeqCst), 1);

    maintainer.shutdown();
}

#[tokio::test]
async fn lock_contention_is_not_a_failure() {
    let store = Arc::new(InMemoryReindexingStore::new("cluster"));
    let visits = Arc::new(AtomicUsize::new(0));
    let held = store.lock(Duration::ZERO).unwrap();

    let maintainer =
        ReindexingMaintainer::start(setup(store.clone(), visits.clone()), Duration::from_secs(3600))
            .unwrap();
    let mut health = maintainer.health_stream();

    let snapshot = wait_for(&mut health, |h| h.lock_contentions >= 1 && !h.running).await;
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(visits.load(Ordering::SeqCst), 0);

    store.unlock(held).unwrap();
    maintainer.trigger().await.unwrap();
    wait_for(&mut health, |h| h.last_success_unix_ms.is_some()).await;
    assert_eq!(visits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_stops_the_loop() {
    let store = Arc::new(InMemoryReindexingStore::new("cluster"));
    let reindexer = setup(store, Arc::new(AtomicUsize::new(0)));
    let maintainer =
        ReindexingMaintainer::start(reindexer.clone(), Duration::from_secs(3600)).unwrap();
    let mut health = maintainer.health_stream();
    wait_for(&mut health, |h| h.runs >= 1 && !h.running).await;

    maintainer.shutdown();
    assert!(reindexer.is_shut_down());

    let stopped = tokio::time::timeout(Duration::from_secs(10), async {
        while maintainer.trigger().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
    assert_eq!(maintainer.health_snapshot().runs, 1);
}

#[tokio::test]
async fn rejects_zero_interval() {
    let reindexer = setup(
        Arc::new(InMemoryReindexingStore::new("cluster")),
        Arc::new(AtomicUsize::new(0)),
    );
    assert!(ReindexingMaintainer::start(reindexer, Duration::ZERO).is_err());
}
