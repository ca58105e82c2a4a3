#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_contracts::capability::{Action, OperatingMode};
use fleet_contracts::event::{EventDraft, EventPayload};
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::ids::{
    BatchId, DeviceId, DriverId, EventId, FacilityId, SessionId, VehicleId,
};
use fleet_contracts::position::PositionSample;
use fleet_contracts::registry::{
    BatchRecord, DriverRecord, Priority, RegistrySnapshot, Stop, VehicleRecord, VehicleType,
};
use fleet_contracts::status::EntityStatus;
use fleet_contracts::UnixMs;
use fleet_engines::capability::{CapabilityController, DenialReason};
use fleet_os::config::FleetSyncConfig;
use fleet_os::dispatch::{ActionDispatcher, ActionRequest, DispatchError};
use fleet_os::live_state::{lock_state, poll_events, spawn_push_listener, FleetState};
use fleet_os::sync_manager::{
    ConnectivityFlag, EventRequest, FixedGeolocation, GeolocationProvider, GeolocationUnavailable,
    NoGeolocation, RecordError, RetryPolicy, SyncError, SyncManager, SyncOutcome,
};
use fleet_storage::clock::{Clock, ManualClock};
use fleet_storage::event_store::{EventStore, SubscriptionFilter};
use fleet_storage::offline_queue::{
    FileQueueStore, MemoryQueueStore, OfflineQueue, OfflineQueueStore, QueueEntryState,
};
use fleet_storage::repo::IngestionBoundary;
use fleet_storage::{IngestError, MalformedEventPayload, TransientNetworkError};

const T0: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Transient,
    Malformed,
    /// Persists the event but reports a transport failure, as when the ack is lost.
    AckLost,
}

/// Event store front that can be told to fail the next submissions.
struct ScriptedBoundary {
    store: EventStore,
    script: Mutex<VecDeque<Scripted>>,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    calls: AtomicUsize,
}

impl ScriptedBoundary {
    fn new(store: EventStore) -> Self {
        Self {
            store,
            script: Mutex::new(VecDeque::new()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn gated(store: EventStore, gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(store)
        }
    }

    fn then(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IngestionBoundary for ScriptedBoundary {
    async fn insert_event(&self, draft: EventDraft) -> Result<EventId, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => self.store.insert(draft),
            Some(Scripted::Transient) => Err(TransientNetworkError::new("connection reset").into()),
            Some(Scripted::Malformed) => Err(MalformedEventPayload {
                reason: "unknown facility".to_string(),
            }
            .into()),
            Some(Scripted::AckLost) => {
                self.store.insert(draft)?;
                Err(TransientNetworkError::new("ack lost").into())
            }
        }
    }
}

struct SlowGeolocation;

impl GeolocationProvider for SlowGeolocation {
    async fn current_position(&self) -> Result<GeoPoint, GeolocationUnavailable> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(GeoPoint { lat: 1.0, lng: 1.0 })
    }
}

struct Harness<S: OfflineQueueStore, G: GeolocationProvider> {
    clock: Arc<ManualClock>,
    store: EventStore,
    boundary: Arc<ScriptedBoundary>,
    online: Arc<ConnectivityFlag>,
    sync: Arc<SyncManager<Arc<ScriptedBoundary>, S, G>>,
}

fn harness_with<S: OfflineQueueStore, G: GeolocationProvider>(
    queue_store: S,
    geolocation: G,
    retry: RetryPolicy,
    gate: Option<Arc<tokio::sync::Semaphore>>,
) -> Harness<S, G> {
    let clock = Arc::new(ManualClock::at(UnixMs(T0)));
    let store = EventStore::new_in_memory(clock.clone());
    let boundary = Arc::new(match gate {
        Some(g) => ScriptedBoundary::gated(store.clone(), g),
        None => ScriptedBoundary::new(store.clone()),
    });
    let online = Arc::new(ConnectivityFlag::new(true));
    let sync = Arc::new(SyncManager::new(
        boundary.clone(),
        OfflineQueue::open(queue_store).unwrap(),
        geolocation,
        online.clone(),
        clock.clone(),
        retry,
        Duration::from_secs(5),
    ));
    Harness {
        clock,
        store,
        boundary,
        online,
        sync,
    }
}

fn harness() -> Harness<MemoryQueueStore, FixedGeolocation> {
    harness_with(
        MemoryQueueStore::default(),
        FixedGeolocation(GeoPoint { lat: 4.65, lng: -74.05 }),
        RetryPolicy::mvp_v1(),
        None,
    )
}

fn request(payload: EventPayload, batch: Option<&str>, at: u64) -> EventRequest {
    EventRequest {
        payload,
        driver_id: DriverId::new("drv_1").unwrap(),
        session_id: SessionId::new("ses_1").unwrap(),
        device_id: DeviceId::new("dev_1").unwrap(),
        vehicle_id: None,
        batch_id: batch.map(|b| BatchId::new(b).unwrap()),
        trip_id: None,
        dispatch_id: None,
        position: Some(GeoPoint { lat: 4.6, lng: -74.1 }),
        captured_at: Some(UnixMs(at)),
    }
}

fn status_request(status: EntityStatus, at: u64) -> EventRequest {
    request(EventPayload::StatusChanged { status, note: None }, None, at)
}

#[tokio::test]
async fn at_fleet_sync_01_three_offline_events_drain_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(
        FileQueueStore::in_dir(dir.path()),
        FixedGeolocation(GeoPoint { lat: 4.65, lng: -74.05 }),
        RetryPolicy::mvp_v1(),
        None,
    );
    h.online.set_online(false);

    for (i, status) in [EntityStatus::Active, EntityStatus::EnRoute, EntityStatus::AtStop]
        .into_iter()
        .enumerate()
    {
        let id = h
            .sync
            .record_event(status_request(status, T0 + i as u64))
            .await
            .unwrap();
        assert!(id.is_local());
        assert!(id.as_str().starts_with("local_"));
    }
    assert_eq!(h.boundary.calls(), 0);
    assert_eq!(h.sync.queue_metrics().pending, 3);

    h.online.set_online(true);
    let outcome = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome {
            synced: 3,
            failed: 0,
            ..SyncOutcome::default()
        }
    );
    assert!(h.sync.queued_entries().is_empty());

    let ids: Vec<String> = h
        .store
        .recent(10)
        .unwrap()
        .into_iter()
        .rev()
        .map(|e| e.id.as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["evt_00000001", "evt_00000002", "evt_00000003"]);

    let reopened = OfflineQueue::open(FileQueueStore::in_dir(dir.path())).unwrap();
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn at_fleet_sync_02_reconciled_status_follows_latest_capture() {
    let h = harness();
    h.sync
        .record_event(request(
            EventPayload::SessionStarted {
                app_version: Some("2.4.1".to_string()),
                odometer_km: None,
            },
            None,
            T0,
        ))
        .await
        .unwrap();
    h.sync
        .record_event(request(
            EventPayload::TripStarted {
                planned_stops: Some(3),
            },
            None,
            T0 + 1_000,
        ))
        .await
        .unwrap();
    let last = h
        .sync
        .record_event(request(
            EventPayload::ArrivedAtStop {
                stop_index: 0,
                facility_id: None,
            },
            Some("bat_1"),
            T0 + 2_000,
        ))
        .await
        .unwrap();
    assert!(!last.is_local());

    let state = FleetState::shared(&FleetSyncConfig::mvp_v1());
    let fetched = poll_events(&state, &h.store, h.clock.as_ref()).await.unwrap();
    assert_eq!(fetched, 3);
    let guard = lock_state(&state);
    let driver = DriverId::new("drv_1").unwrap();
    assert_eq!(guard.reconciler().driver_status(&driver), EntityStatus::AtStop);
    assert_eq!(
        guard
            .reconciler()
            .batch_status(&BatchId::new("bat_1").unwrap()),
        Some(EntityStatus::AtStop)
    );
}

#[tokio::test]
async fn at_fleet_sync_03_forensics_edit_is_blocked_before_any_submission() {
    let h = harness();
    let dispatcher = ActionDispatcher::new(Arc::new(CapabilityController::default()), h.sync.clone());

    let err = dispatcher
        .dispatch(ActionRequest {
            mode: OperatingMode::Forensics,
            action: Action::EditAnyData,
            event: status_request(EntityStatus::Completed, T0),
        })
        .await
        .unwrap_err();
    match err {
        DispatchError::Capability(v) => assert_eq!(v.reason, DenialReason::Forbidden),
        other => panic!("expected capability violation, got {other:?}"),
    }
    assert_eq!(h.boundary.calls(), 0);
    assert!(h.store.is_empty());
    assert!(h.sync.queued_entries().is_empty());

    let ok = dispatcher
        .dispatch(ActionRequest {
            mode: OperatingMode::Operational,
            action: Action::ReportException,
            event: request(
                EventPayload::DelayReported {
                    reason: "road closed".to_string(),
                    estimated_delay_min: Some(20),
                },
                None,
                T0 + 10,
            ),
        })
        .await
        .unwrap();
    assert_eq!(ok.as_str(), "evt_00000001");
}

#[tokio::test]
async fn at_fleet_sync_04_transient_failures_back_off_then_dead_letter_and_rearm() {
    let h = harness_with(
        MemoryQueueStore::default(),
        FixedGeolocation(GeoPoint { lat: 4.65, lng: -74.05 }),
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        },
        None,
    );
    assert_eq!(h.sync.retry_policy().max_attempts, 2);
    h.online.set_online(false);
    h.sync
        .record_event(status_request(EntityStatus::Active, T0))
        .await
        .unwrap();
    h.online.set_online(true);
    h.boundary.then(Scripted::Transient);
    h.boundary.then(Scripted::Transient);

    let first = h.sync.sync_offline_events().await.unwrap();
    assert_eq!((first.synced, first.failed, first.dead_lettered), (0, 1, 0));
    let entry = &h.sync.queued_entries()[0];
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.next_attempt_at, UnixMs(T0 + 1_000));
    assert_eq!(entry.last_error.as_deref(), Some("connection reset"));

    let early = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(early.deferred, 1);
    assert_eq!(h.boundary.calls(), 1);

    h.clock.advance_ms(1_000);
    let second = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(h.sync.queued_entries()[0].state, QueueEntryState::DeadLetter);
    assert_eq!(h.sync.queue_metrics().dead_letter, 1);

    h.clock.advance_ms(600_000);
    let idle = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(idle, SyncOutcome::default());
    assert_eq!(h.sync.queued_entries().len(), 1);

    assert_eq!(h.sync.requeue_dead_letters().unwrap(), 1);
    let rearmed = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(rearmed.synced, 1);
    assert!(h.sync.queued_entries().is_empty());
}

#[tokio::test]
async fn at_fleet_sync_05_malformed_on_sync_is_rejected_and_kept() {
    let h = harness();
    h.online.set_online(false);
    h.sync
        .record_event(status_request(EntityStatus::Delayed, T0))
        .await
        .unwrap();
    h.online.set_online(true);
    h.boundary.then(Scripted::Malformed);

    let outcome = h.sync.sync_offline_events().await.unwrap();
    assert_eq!((outcome.failed, outcome.rejected), (1, 1));
    let again = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(again, SyncOutcome::default());
    assert_eq!(h.boundary.calls(), 1);

    let entries = h.sync.queued_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, QueueEntryState::Rejected);
    assert_eq!(h.sync.queue_metrics().rejected, 1);
}

#[tokio::test]
async fn at_fleet_sync_06_malformed_request_is_surfaced_not_queued() {
    let h = harness();
    h.online.set_online(false);
    // delivery events need a batch
    let err = h
        .sync
        .record_event(request(
            EventPayload::DeliveryFailed {
                stop_index: 1,
                reason: "closed".to_string(),
            },
            None,
            T0,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RecordError::Malformed(_)));
    assert!(h.sync.queued_entries().is_empty());
}

#[tokio::test]
async fn at_fleet_sync_07_transient_direct_submission_falls_back_to_queue() {
    let h = harness();
    h.boundary.then(Scripted::Transient);
    let id = h
        .sync
        .record_event(status_request(EntityStatus::EnRoute, T0))
        .await
        .unwrap();
    assert!(id.is_local());
    assert_eq!(h.sync.queued_entries().len(), 1);

    let outcome = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(outcome.synced, 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn at_fleet_sync_08_lost_ack_resubmission_does_not_duplicate() {
    let h = harness();
    h.online.set_online(false);
    h.sync
        .record_event(status_request(EntityStatus::Active, T0))
        .await
        .unwrap();
    h.online.set_online(true);
    h.boundary.then(Scripted::AckLost);

    let first = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(h.store.len(), 1);

    h.clock.advance_ms(5_000);
    let second = h.sync.sync_offline_events().await.unwrap();
    assert_eq!(second.synced, 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn at_fleet_sync_09_concurrent_sync_is_refused() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let h = harness_with(
        MemoryQueueStore::default(),
        FixedGeolocation(GeoPoint { lat: 4.65, lng: -74.05 }),
        RetryPolicy::mvp_v1(),
        Some(gate.clone()),
    );
    h.online.set_online(false);
    h.sync
        .record_event(status_request(EntityStatus::Active, T0))
        .await
        .unwrap();
    h.online.set_online(true);

    let sync = h.sync.clone();
    let first = tokio::spawn(async move { sync.sync_offline_events().await });
    for _ in 0..100 {
        if h.boundary.calls() > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.boundary.calls(), 1);
    assert_eq!(
        h.sync.sync_offline_events().await,
        Err(SyncError::SyncInFlight)
    );

    gate.add_permits(1);
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.synced, 1);
    assert!(h.sync.sync_offline_events().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn at_fleet_sync_10_slow_geolocation_records_fallback_coordinate() {
    let h = harness_with(
        MemoryQueueStore::default(),
        SlowGeolocation,
        RetryPolicy::mvp_v1(),
        None,
    );
    let mut req = status_request(EntityStatus::Active, T0);
    req.position = None;
    let id = h.sync.record_event(req).await.unwrap();
    assert!(!id.is_local());

    let events = h.store.recent(1).unwrap();
    assert_eq!(events[0].position, GeoPoint::FALLBACK);
}

#[tokio::test]
async fn at_fleet_sync_11_pushed_events_update_state_until_unsubscribed() {
    let h = harness();
    let state = FleetState::shared(&FleetSyncConfig::mvp_v1());
    let subscription = h.store.subscribe(SubscriptionFilter::all());
    let listener = spawn_push_listener(state.clone(), subscription);

    h.sync
        .record_event(status_request(EntityStatus::Suspended, T0))
        .await
        .unwrap();
    let driver = DriverId::new("drv_1").unwrap();
    for _ in 0..100 {
        if lock_state(&state).reconciler().window_len() > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        lock_state(&state).reconciler().driver_status(&driver),
        EntityStatus::Suspended
    );

    listener.abort();
    let _ = listener.await;
    assert_eq!(h.store.subscriber_count(), 0);
}

#[tokio::test]
async fn at_fleet_sync_12_live_snapshot_joins_registry_status_and_positions() {
    let h = harness();
    h.sync
        .record_event(request(
            EventPayload::BatchStarted { stop_count: 4 },
            Some("bat_1"),
            T0,
        ))
        .await
        .unwrap();

    let state = FleetState::shared(&FleetSyncConfig::mvp_v1());
    poll_events(&state, &h.store, h.clock.as_ref()).await.unwrap();

    let stops = (0..4)
        .map(|i| Stop {
            facility_id: FacilityId::new(format!("fac_{i}")).unwrap(),
            name: format!("Clinic {i}"),
            position: GeoPoint {
                lat: 4.6 + f64::from(i) / 100.0,
                lng: -74.1,
            },
        })
        .collect();
    let registry = RegistrySnapshot {
        drivers: vec![DriverRecord {
            driver_id: DriverId::new("drv_1").unwrap(),
            display_name: "Ana".to_string(),
            phone: None,
            last_known_position: None,
        }],
        vehicles: vec![VehicleRecord {
            vehicle_id: VehicleId::new("veh_1").unwrap(),
            plate_number: "XYZ987".to_string(),
            vehicle_type: VehicleType::Refrigerated,
            capacity_kg: None,
            assigned_driver_id: Some(DriverId::new("drv_1").unwrap()),
        }],
        batches: vec![BatchRecord {
            batch_id: BatchId::new("bat_1").unwrap(),
            name: "Cold chain".to_string(),
            driver_id: Some(DriverId::new("drv_1").unwrap()),
            vehicle_id: Some(VehicleId::new("veh_1").unwrap()),
            priority: Priority::Urgent,
            stops,
            current_stop_index: 0,
            depot: None,
            route_geometry: None,
            measured_utilization_pct: None,
            completed: false,
        }],
        fetched_at: UnixMs(T0),
    };

    let now = h.clock.now();
    let snapshot = {
        let mut s = lock_state(&state);
        s.apply_registry(registry, now);
        s.observe_position(
            PositionSample {
                driver_id: DriverId::new("drv_1").unwrap(),
                session_id: None,
                position: GeoPoint { lat: 4.61, lng: -74.09 },
                speed_kmh: Some(28.0),
                heading_deg: Some(90.0),
                accuracy_m: Some(8.0),
                battery_level: Some(0.55),
                captured_at: UnixMs(T0 - 60_000),
            },
            now,
        )
        .unwrap();
        s.snapshot(now)
    };

    assert_eq!(snapshot.drivers[0].status, EntityStatus::EnRoute);
    assert!(snapshot.drivers[0].is_online);
    let utilization = snapshot.vehicles[0].utilization.unwrap();
    assert_eq!(utilization.percent(), 60.0);
    assert!(utilization.is_estimated());
    assert_eq!(snapshot.deliveries[0].status, EntityStatus::EnRoute);
    assert_eq!(snapshot.deliveries[0].total_stops, 4);
}

#[tokio::test]
async fn at_fleet_sync_13_missing_geolocation_records_fallback_coordinate() {
    let h = harness_with(
        MemoryQueueStore::default(),
        NoGeolocation,
        RetryPolicy::mvp_v1(),
        None,
    );
    let mut online = status_request(EntityStatus::Active, T0);
    online.position = None;
    let id = h.sync.record_event(online).await.unwrap();
    assert!(!id.is_local());
    assert_eq!(h.store.recent(1).unwrap()[0].position, GeoPoint::FALLBACK);

    h.online.set_online(false);
    let mut offline = status_request(EntityStatus::EnRoute, T0 + 1_000);
    offline.position = None;
    assert!(h.sync.record_event(offline).await.unwrap().is_local());
    h.online.set_online(true);
    assert_eq!(h.sync.sync_offline_events().await.unwrap().synced, 1);

    let events = h.store.recent(2).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.position == GeoPoint::FALLBACK));
}
