#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_contracts::event::{EventDraft, EventPayload};
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::ids::{BatchId, DeviceId, DriverId, SessionId};
use fleet_contracts::UnixMs;
use fleet_storage::clock::ManualClock;
use fleet_storage::event_store::{EventStore, SubscriptionFilter};
use fleet_storage::repo::{EventQuery, IngestionBoundary};
use fleet_storage::IngestError;

fn driver(id: &str) -> DriverId {
    DriverId::new(id).unwrap()
}

fn session(id: &str) -> SessionId {
    SessionId::new(id).unwrap()
}

fn draft(driver_id: &str, session_id: &str, captured_at: u64, key: &str) -> EventDraft {
    EventDraft {
        payload: EventPayload::StatusChanged {
            status: fleet_contracts::status::EntityStatus::Active,
            note: None,
        },
        driver_id: driver(driver_id),
        session_id: session(session_id),
        device_id: DeviceId::new("dev_wiring").unwrap(),
        vehicle_id: None,
        batch_id: None,
        trip_id: None,
        dispatch_id: None,
        position: GeoPoint {
            lat: -1.2921,
            lng: 36.8219,
        },
        captured_at: UnixMs(captured_at),
        idempotency_key: key.to_string(),
    }
}

fn store() -> EventStore {
    EventStore::new_in_memory(Arc::new(ManualClock::at(UnixMs(1_000_000))))
}

#[tokio::test]
async fn at_event_store_wiring_01_timeline_is_newest_capture_first_and_scoped() {
    let s = store();
    s.insert_event(draft("drv_a", "ses_1", 300, "k3")).await.unwrap();
    s.insert_event(draft("drv_a", "ses_1", 100, "k1")).await.unwrap();
    s.insert_event(draft("drv_a", "ses_2", 200, "k2")).await.unwrap();
    s.insert_event(draft("drv_b", "ses_9", 400, "k4")).await.unwrap();

    let all = s.get_event_timeline(&driver("drv_a"), None, 10).await.unwrap();
    let captured: Vec<u64> = all.iter().map(|e| e.captured_at.0).collect();
    assert_eq!(captured, vec![300, 200, 100]);

    let scoped = s
        .get_event_timeline(&driver("drv_a"), Some(&session("ses_1")), 10)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 2);

    let limited = s.get_event_timeline(&driver("drv_a"), None, 1).await.unwrap();
    assert_eq!(limited[0].captured_at, UnixMs(300));
}

#[tokio::test]
async fn at_event_store_wiring_02_malformed_payload_is_rejected_not_stored() {
    let s = store();
    let mut bad = draft("drv_a", "ses_1", 100, "k1");
    bad.payload = EventPayload::BatchStarted { stop_count: 3 };
    let err = s.insert_event(bad).await.unwrap_err();
    assert!(matches!(err, IngestError::Malformed(_)));
    assert!(!err.is_retryable());
    assert!(s.is_empty());
}

#[tokio::test]
async fn at_event_store_wiring_03_push_honors_driver_and_batch_filter() {
    let s = store();
    let mut only_b = s.subscribe(SubscriptionFilter {
        driver_ids: BTreeSet::from([driver("drv_b")]),
        batch_ids: BTreeSet::new(),
    });
    let mut by_batch = s.subscribe(SubscriptionFilter {
        driver_ids: BTreeSet::new(),
        batch_ids: BTreeSet::from([BatchId::new("bat_7").unwrap()]),
    });

    s.insert_event(draft("drv_a", "ses_1", 100, "k1")).await.unwrap();
    let mut batched = draft("drv_c", "ses_3", 120, "k2");
    batched.batch_id = Some(BatchId::new("bat_7").unwrap());
    batched.payload = EventPayload::BatchStarted { stop_count: 2 };
    s.insert_event(batched).await.unwrap();
    s.insert_event(draft("drv_b", "ses_2", 150, "k3")).await.unwrap();

    let got = only_b.recv().await.unwrap();
    assert_eq!(got.driver_id, driver("drv_b"));
    assert!(only_b.try_recv().is_none());

    let got = by_batch.recv().await.unwrap();
    assert_eq!(got.driver_id, driver("drv_c"));
    assert!(by_batch.try_recv().is_none());
}

#[tokio::test]
async fn at_event_store_wiring_04_duplicate_submission_is_not_pushed_twice() {
    let s = store();
    let mut sub = s.subscribe(SubscriptionFilter::all());
    let first = s.insert_event(draft("drv_a", "ses_1", 100, "same")).await.unwrap();
    let second = s.insert_event(draft("drv_a", "ses_1", 100, "same")).await.unwrap();
    assert_eq!(first, second);
    assert!(sub.try_recv().is_some());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn at_event_store_wiring_05_recent_events_spans_all_drivers() {
    let s = store();
    for (i, d) in ["drv_a", "drv_b", "drv_c"].iter().enumerate() {
        s.insert_event(draft(d, "ses_1", 100 + i as u64, &format!("k{i}")))
            .await
            .unwrap();
    }
    let rows = s.recent_events(2).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].driver_id, driver("drv_c"));
    assert_eq!(rows[1].driver_id, driver("drv_b"));
}
