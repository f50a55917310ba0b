//! Optimistic-concurrency behavior of the lifecycle service.
//!
//! Two service instances sharing one store stand in for two daemon replicas:
//! the per-id lock of one instance does not serialize the other, so only the
//! store's version check keeps them consistent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lifeline_core::access::Requester;
use lifeline_core::clock::ManualClock;
use lifeline_core::emergency::{
    AssignmentStatus, Emergency, EmergencyDraft, EmergencyError, EmergencyStatus, GeoPoint,
    LocationInput,
};
use lifeline_core::geo::InMemoryGeoIndex;
use lifeline_core::notify::{NotificationEvent, NotificationSink, RecordingNotificationSink};
use lifeline_core::store::{
    DateRange, EmergencyFilter, EmergencyStatistics, EmergencyStore, InMemoryEmergencyStore,
    Page, StoreError,
};
use lifeline_daemon::metrics::MetricsRegistry;
use lifeline_daemon::service::{LifecycleService, ServiceConfig};

// =============================================================================
// Store wrapper
// =============================================================================

/// Delegates to an in-memory store, optionally rejecting every save with a
/// version conflict or stalling before each save.
struct ContendedStore {
    inner: InMemoryEmergencyStore,
    always_conflict: AtomicBool,
    save_delay: Option<StdDuration>,
    saves: AtomicU32,
}

impl ContendedStore {
    fn new() -> Self {
        Self {
            inner: InMemoryEmergencyStore::new(),
            always_conflict: AtomicBool::new(false),
            save_delay: None,
            saves: AtomicU32::new(0),
        }
    }

    fn with_save_delay(mut self, delay: StdDuration) -> Self {
        self.save_delay = Some(delay);
        self
    }
}

#[async_trait]
impl EmergencyStore for ContendedStore {
    async fn create(&self, emergency: Emergency) -> Result<Emergency, StoreError> {
        self.inner.create(emergency).await
    }

    async fn get(&self, id: &str) -> Result<Option<Emergency>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        filter: EmergencyFilter,
        page: Page,
    ) -> Result<Vec<Emergency>, StoreError> {
        self.inner.find_by_owner(owner_id, filter, page).await
    }

    async fn find_near(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        status: EmergencyStatus,
    ) -> Result<Vec<Emergency>, StoreError> {
        self.inner.find_near(point, radius_meters, status).await
    }

    async fn list_by_status(&self, status: EmergencyStatus) -> Result<Vec<Emergency>, StoreError> {
        self.inner.list_by_status(status).await
    }

    async fn save(&self, emergency: Emergency) -> Result<Emergency, StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.always_conflict.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict {
                id: emergency.id().to_string(),
                expected: emergency.version(),
                actual: emergency.version() + 1,
            });
        }
        if let Some(delay) = self.save_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.save(emergency).await
    }

    async fn aggregate_statistics(
        &self,
        range: Option<DateRange>,
    ) -> Result<EmergencyStatistics, StoreError> {
        self.inner.aggregate_statistics(range).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_expired(now).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

async fn helpers() -> Arc<InMemoryGeoIndex> {
    let index = InMemoryGeoIndex::new();
    for (id, lat) in [("h1", 0.001), ("h2", 0.002)] {
        index
            .upsert_helper(id, GeoPoint::new(0.0, lat), t0())
            .await
            .unwrap();
    }
    Arc::new(index)
}

fn service(
    store: Arc<ContendedStore>,
    geo: Arc<InMemoryGeoIndex>,
    clock: Arc<ManualClock>,
    metrics: &MetricsRegistry,
) -> LifecycleService {
    LifecycleService::new(
        store,
        geo,
        Arc::new(RecordingNotificationSink::new()),
        clock,
        ServiceConfig::default(),
    )
    .with_metrics(metrics.lifeline_metrics().clone())
}

fn draft() -> EmergencyDraft {
    EmergencyDraft {
        kind: "medical".into(),
        title: "Collapsed runner".into(),
        description: "Runner collapsed near the park entrance".into(),
        location: LocationInput::at(0.0, 0.0, "Park entrance"),
        ..EmergencyDraft::default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_persistent_conflict_gives_up_after_retries() {
    let store = Arc::new(ContendedStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let metrics = MetricsRegistry::new().unwrap();
    let svc = service(Arc::clone(&store), helpers().await, clock, &metrics);

    let e = svc
        .create_emergency(draft(), &Requester::user("owner-1"))
        .await
        .unwrap();
    svc.assign_nearby_helpers(e.id()).await.unwrap();

    store.always_conflict.store(true, Ordering::SeqCst);
    let before = store.saves.load(Ordering::SeqCst);
    let err = svc
        .accept_helper_request(e.id(), &Requester::helper("h1"))
        .await
        .unwrap_err();

    assert!(matches!(err, EmergencyError::Conflict { attempts: 4, .. }));
    assert_eq!(err.code(), "CONFLICT");
    assert_eq!(store.saves.load(Ordering::SeqCst) - before, 4);
    assert!((metrics.lifeline_metrics().conflict_count("accept") - 4.0).abs() < f64::EPSILON);

    // Nothing was committed.
    let stored = store.inner.get(e.id()).await.unwrap().unwrap();
    assert_eq!(
        stored.assignment("h1").map(|a| a.status),
        Some(AssignmentStatus::Requested)
    );
}

#[tokio::test]
async fn test_conflict_retry_budget_is_configurable() {
    let store = Arc::new(ContendedStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let config = ServiceConfig {
        max_conflict_retries: 0,
        ..ServiceConfig::default()
    };
    let svc = LifecycleService::new(
        Arc::clone(&store) as Arc<dyn EmergencyStore>,
        helpers().await,
        Arc::new(RecordingNotificationSink::new()),
        clock,
        config,
    );

    let e = svc
        .create_emergency(draft(), &Requester::user("owner-1"))
        .await
        .unwrap();
    store.always_conflict.store(true, Ordering::SeqCst);
    let err = svc
        .add_message(e.id(), &Requester::user("owner-1"), "still here")
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::Conflict { attempts: 1, .. }));
}

#[tokio::test]
async fn test_concurrent_accepts_across_instances_both_land() {
    let store = Arc::new(ContendedStore::new().with_save_delay(StdDuration::from_millis(50)));
    let geo = helpers().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let metrics_a = MetricsRegistry::new().unwrap();
    let metrics_b = MetricsRegistry::new().unwrap();
    let a = service(Arc::clone(&store), Arc::clone(&geo), Arc::clone(&clock), &metrics_a);
    let b = service(Arc::clone(&store), geo, clock, &metrics_b);

    let e = a
        .create_emergency(draft(), &Requester::user("owner-1"))
        .await
        .unwrap();
    let assigned = a.assign_nearby_helpers(e.id()).await.unwrap();
    assert_eq!(assigned.len(), 2);

    let h1 = Requester::helper("h1");
    let h2 = Requester::helper("h2");
    let (first, second) = tokio::join!(
        a.accept_helper_request(e.id(), &h1),
        b.accept_helper_request(e.id(), &h2),
    );
    assert_eq!(first.unwrap().status, AssignmentStatus::Accepted);
    assert_eq!(second.unwrap().status, AssignmentStatus::Accepted);

    let stored = a
        .get_emergency(e.id(), &Requester::user("owner-1"))
        .await
        .unwrap();
    assert_eq!(stored.response_metrics().total_helpers_accepted, 2);
    assert_eq!(stored.active_helpers_count(), 2);
    // create, dispatch, and one write per acceptance.
    assert_eq!(stored.version(), 4);

    let conflicts = metrics_a.lifeline_metrics().conflict_count("accept")
        + metrics_b.lifeline_metrics().conflict_count("accept");
    assert!(conflicts >= 1.0);
}

#[tokio::test]
async fn test_same_instance_serializes_without_conflicts() {
    let store = Arc::new(ContendedStore::new().with_save_delay(StdDuration::from_millis(20)));
    let clock = Arc::new(ManualClock::new(t0()));
    let metrics = MetricsRegistry::new().unwrap();
    let svc = service(Arc::clone(&store), helpers().await, clock, &metrics);

    let e = svc
        .create_emergency(draft(), &Requester::user("owner-1"))
        .await
        .unwrap();
    svc.assign_nearby_helpers(e.id()).await.unwrap();

    let owner = Requester::user("owner-1");
    let h1 = Requester::helper("h1");
    let h2 = Requester::helper("h2");
    let (a, b, c) = tokio::join!(
        svc.accept_helper_request(e.id(), &h1),
        svc.accept_helper_request(e.id(), &h2),
        svc.add_message(e.id(), &owner, "On my way out"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert!(metrics.lifeline_metrics().conflict_count("accept").abs() < f64::EPSILON);
    assert!(metrics.lifeline_metrics().conflict_count("message").abs() < f64::EPSILON);
    let stored = svc.get_emergency(e.id(), &owner).await.unwrap();
    assert_eq!(stored.response_metrics().total_helpers_accepted, 2);
}

#[tokio::test]
async fn test_slow_save_reports_the_committed_outcome() {
    let store = Arc::new(ContendedStore::new().with_save_delay(StdDuration::from_millis(150)));
    let sink = Arc::new(RecordingNotificationSink::new());
    let mut config = ServiceConfig::default();
    config.timeouts.store_ms = 20;
    let svc = LifecycleService::new(
        Arc::clone(&store) as Arc<dyn EmergencyStore>,
        helpers().await,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        Arc::new(ManualClock::new(t0())),
        config,
    );

    let e = svc
        .create_emergency(draft(), &Requester::user("owner-1"))
        .await
        .unwrap();
    svc.assign_nearby_helpers(e.id()).await.unwrap();

    // The save outlives the store budget but still commits; the caller sees
    // the committed transition, not a failure.
    let h1 = Requester::helper("h1");
    let accepted = svc.accept_helper_request(e.id(), &h1).await.unwrap();
    assert_eq!(accepted.status, AssignmentStatus::Accepted);

    let stored = store.inner.get(e.id()).await.unwrap().unwrap();
    assert_eq!(
        stored.assignment("h1").map(|a| a.status),
        Some(AssignmentStatus::Accepted)
    );
    assert_eq!(
        sink.events_for("owner-1"),
        vec![NotificationEvent::HelperAccepted]
    );

    let again = svc.accept_helper_request(e.id(), &h1).await.unwrap_err();
    assert!(matches!(again, EmergencyError::AssignmentNotRequested { .. }));
}
