#![forbid(unsafe_code)]

use fleet_contracts::event::{EventDraft, EventPayload};
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::ids::{DeviceId, DriverId, LocalEventId, SessionId};
use fleet_contracts::UnixMs;
use fleet_storage::offline_queue::{
    FileQueueStore, OfflineQueue, OfflineQueueStore, QueueEntry, QueueEntryState,
};
use fleet_storage::StorageError;

fn entry(local: &str, captured_at: u64) -> QueueEntry {
    let draft = EventDraft {
        payload: EventPayload::PhotoCaptured {
            photo_ref: format!("photo_{local}"),
            stop_index: None,
        },
        driver_id: DriverId::new("drv_q").unwrap(),
        session_id: SessionId::new("ses_q").unwrap(),
        device_id: DeviceId::new("dev_q").unwrap(),
        vehicle_id: None,
        batch_id: None,
        trip_id: None,
        dispatch_id: None,
        position: GeoPoint::FALLBACK,
        captured_at: UnixMs(captured_at),
        idempotency_key: format!("idem_{local}"),
    };
    QueueEntry::v1(LocalEventId::new(local).unwrap(), draft, UnixMs(captured_at))
}

#[test]
fn at_offline_queue_wiring_01_entries_survive_reopen_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut q = OfflineQueue::open(FileQueueStore::in_dir(dir.path())).unwrap();
        q.append(entry("local_1", 10)).unwrap();
        q.append(entry("local_2", 20)).unwrap();
        q.append(entry("local_3", 30)).unwrap();
    }
    let q = OfflineQueue::open(FileQueueStore::in_dir(dir.path())).unwrap();
    let ids: Vec<&str> = q.entries().iter().map(|e| e.local_id.as_str()).collect();
    assert_eq!(ids, vec!["local_1", "local_2", "local_3"]);
}

#[test]
fn at_offline_queue_wiring_02_acked_removal_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileQueueStore::in_dir(dir.path());
    let mut q = OfflineQueue::open(store.clone()).unwrap();
    q.append(entry("local_1", 10)).unwrap();
    q.append(entry("local_2", 20)).unwrap();
    q.remove_acked(&LocalEventId::new("local_1").unwrap()).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].local_id.as_str(), "local_2");
}

#[test]
fn at_offline_queue_wiring_03_file_is_a_plain_json_array() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileQueueStore::in_dir(dir.path());
    let mut q = OfflineQueue::open(store.clone()).unwrap();
    q.append(entry("local_1", 10)).unwrap();
    let raw = std::fs::read_to_string(store.path()).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(v.is_array());
    assert_eq!(v[0]["state"], "pending");
    assert_eq!(v[0]["draft"]["type"], "photo_captured");
}

#[test]
fn at_offline_queue_wiring_04_duplicate_and_missing_ids_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut q = OfflineQueue::open(FileQueueStore::in_dir(dir.path())).unwrap();
    q.append(entry("local_1", 10)).unwrap();
    assert!(matches!(
        q.append(entry("local_1", 11)),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert!(matches!(
        q.remove_acked(&LocalEventId::new("local_9").unwrap()),
        Err(StorageError::NotFound { .. })
    ));
}

#[test]
fn at_offline_queue_wiring_05_corrupt_file_is_reported_not_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileQueueStore::in_dir(dir.path());
    std::fs::write(store.path(), b"{not json").unwrap();
    assert!(matches!(
        OfflineQueue::open(store.clone()),
        Err(StorageError::Corrupt { .. })
    ));
    assert_eq!(std::fs::read(store.path()).unwrap(), b"{not json");
}

#[test]
fn at_offline_queue_wiring_06_replace_updates_state_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileQueueStore::in_dir(dir.path());
    let mut q = OfflineQueue::open(store.clone()).unwrap();
    q.append(entry("local_1", 10)).unwrap();
    let mut e = q.entries()[0].clone();
    e.state = QueueEntryState::DeadLetter;
    e.attempt_count = 5;
    q.replace(e).unwrap();
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded[0].state, QueueEntryState::DeadLetter);
    assert_eq!(reloaded[0].attempt_count, 5);
}
