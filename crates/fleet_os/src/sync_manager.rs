#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleet_contracts::event::{EventDraft, EventPayload};
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::ids::{
    BatchId, DeviceId, DispatchId, DriverId, LocalEventId, RecordedEventId, SessionId, TripId,
    VehicleId, LOCAL_EVENT_ID_PREFIX,
};
use fleet_contracts::{ContractViolation, UnixMs, Validate};
use fleet_storage::clock::Clock;
use fleet_storage::offline_queue::{OfflineQueue, OfflineQueueStore, QueueEntry, QueueEntryState};
use fleet_storage::repo::IngestionBoundary;
use fleet_storage::{IngestError, MalformedEventPayload, StorageError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SYNC_MAX_ATTEMPTS_DEFAULT: u16 = 5;
pub const SYNC_BASE_DELAY_MS_DEFAULT: u64 = 1_000;
pub const SYNC_MAX_DELAY_MS_DEFAULT: u64 = 300_000;

/// Exponential backoff between failed submissions of one queued entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which an entry is dead-lettered.
    pub max_attempts: u16,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl RetryPolicy {
    pub fn mvp_v1() -> Self {
        Self {
            max_attempts: SYNC_MAX_ATTEMPTS_DEFAULT,
            base_delay_ms: SYNC_BASE_DELAY_MS_DEFAULT,
            max_delay_ms: SYNC_MAX_DELAY_MS_DEFAULT,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u16) -> u64 {
        let exp = i32::from(attempt.max(1) - 1);
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            return self.max_delay_ms;
        }
        raw as u64
    }
}

pub trait ConnectivitySource: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity state flipped by whoever observes the network.
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl ConnectivitySource for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("geolocation unavailable: {reason}")]
pub struct GeolocationUnavailable {
    pub reason: String,
}

pub trait GeolocationProvider: Send + Sync {
    fn current_position(
        &self,
    ) -> impl Future<Output = Result<GeoPoint, GeolocationUnavailable>> + Send;
}

/// Provider for hosts without a positioning source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeolocation;

impl GeolocationProvider for NoGeolocation {
    async fn current_position(&self) -> Result<GeoPoint, GeolocationUnavailable> {
        Err(GeolocationUnavailable {
            reason: "no positioning source".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedGeolocation(pub GeoPoint);

impl GeolocationProvider for FixedGeolocation {
    async fn current_position(&self) -> Result<GeoPoint, GeolocationUnavailable> {
        Ok(self.0)
    }
}

/// What a field client asks to record. Position and capture time are filled in by the
/// sync manager when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRequest {
    #[serde(flatten, deserialize_with = "fleet_contracts::event::deserialize_payload")]
    pub payload: EventPayload,
    pub driver_id: DriverId,
    pub session_id: SessionId,
    pub device_id: DeviceId,
    #[serde(default)]
    pub vehicle_id: Option<VehicleId>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub trip_id: Option<TripId>,
    #[serde(default)]
    pub dispatch_id: Option<DispatchId>,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    #[serde(default)]
    pub captured_at: Option<UnixMs>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Malformed(#[from] MalformedEventPayload),
    #[error("offline queue: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("a sync pass is already in flight")]
    SyncInFlight,
    #[error("offline queue: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncOutcome {
    pub synced: u32,
    /// Entries whose submission failed this pass, for any reason.
    pub failed: u32,
    /// Pending entries skipped because their backoff has not elapsed, or because
    /// connectivity was down.
    pub deferred: u32,
    pub dead_lettered: u32,
    pub rejected: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueMetrics {
    pub pending: u32,
    pub due: u32,
    pub dead_letter: u32,
    pub rejected: u32,
}

/// Deduplication key for one recorded event: SHA-256 over the identifying fields and a
/// per-record nonce, hex encoded.
pub fn idempotency_key(
    device_id: &DeviceId,
    session_id: &SessionId,
    captured_at: UnixMs,
    payload: &EventPayload,
    nonce: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(session_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(captured_at.0.to_be_bytes());
    hasher.update(payload.event_type().as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(nonce);
    hex(&hasher.finalize())
}

pub fn new_local_event_id() -> Result<LocalEventId, ContractViolation> {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    LocalEventId::new(format!("{LOCAL_EVENT_ID_PREFIX}{}", hex(&bytes)))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Records field events and drains the offline queue towards the ingestion boundary.
pub struct SyncManager<B, S, G>
where
    B: IngestionBoundary,
    S: OfflineQueueStore,
    G: GeolocationProvider,
{
    boundary: B,
    queue: Mutex<OfflineQueue<S>>,
    geolocation: G,
    connectivity: Arc<dyn ConnectivitySource>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    geolocation_timeout: Duration,
    in_flight: AtomicBool,
}

impl<B, S, G> SyncManager<B, S, G>
where
    B: IngestionBoundary,
    S: OfflineQueueStore,
    G: GeolocationProvider,
{
    pub fn new(
        boundary: B,
        queue: OfflineQueue<S>,
        geolocation: G,
        connectivity: Arc<dyn ConnectivitySource>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        geolocation_timeout: Duration,
    ) -> Self {
        Self {
            boundary,
            queue: Mutex::new(queue),
            geolocation,
            connectivity,
            clock,
            retry,
            geolocation_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, OfflineQueue<S>> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Device position, or the fallback coordinate when the provider fails or is too slow.
    pub async fn resolve_position(&self) -> GeoPoint {
        let outcome =
            tokio::time::timeout(self.geolocation_timeout, self.geolocation.current_position())
                .await;
        let err = match outcome {
            Ok(Ok(p)) => return p,
            Ok(Err(e)) => e,
            Err(_) => GeolocationUnavailable {
                reason: format!("no fix within {} ms", self.geolocation_timeout.as_millis()),
            },
        };
        tracing::warn!(error = %err, "recording event at fallback coordinate");
        GeoPoint::FALLBACK
    }

    async fn build_draft(&self, req: EventRequest) -> EventDraft {
        let position = match req.position {
            Some(p) => p,
            None => self.resolve_position().await,
        };
        let captured_at = req.captured_at.unwrap_or_else(|| self.clock.now());
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let idempotency_key = idempotency_key(
            &req.device_id,
            &req.session_id,
            captured_at,
            &req.payload,
            &nonce,
        );
        EventDraft {
            payload: req.payload,
            driver_id: req.driver_id,
            session_id: req.session_id,
            device_id: req.device_id,
            vehicle_id: req.vehicle_id,
            batch_id: req.batch_id,
            trip_id: req.trip_id,
            dispatch_id: req.dispatch_id,
            position,
            captured_at,
            idempotency_key,
        }
    }

    /// Submits directly when online, else queues and returns a local placeholder id.
    /// A transient failure on the direct path also queues; a malformed payload never does.
    pub async fn record_event(&self, req: EventRequest) -> Result<RecordedEventId, RecordError> {
        let draft = self.build_draft(req).await;
        draft.validate().map_err(MalformedEventPayload::from)?;

        if self.connectivity.is_online() {
            match self.boundary.insert_event(draft.clone()).await {
                Ok(id) => return Ok(RecordedEventId::Server(id)),
                Err(IngestError::Malformed(e)) => return Err(e.into()),
                Err(IngestError::Transient(e)) => {
                    tracing::warn!(error = %e, "direct submission failed; queueing event");
                }
            }
        }
        let local_id = self.enqueue(draft)?;
        Ok(RecordedEventId::Local(local_id))
    }

    fn enqueue(&self, draft: EventDraft) -> Result<LocalEventId, StorageError> {
        let local_id = new_local_event_id()?;
        let entry = QueueEntry::v1(local_id.clone(), draft, self.clock.now());
        let mut q = self.queue();
        q.append(entry)?;
        tracing::debug!(local_id = %local_id, queued = q.len(), "event queued offline");
        Ok(local_id)
    }

    /// Drains due entries in FIFO order. Failures stay queued and the pass continues.
    pub async fn sync_offline_events(&self) -> Result<SyncOutcome, SyncError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Err(SyncError::SyncInFlight);
        };
        let now = self.clock.now();
        let mut outcome = SyncOutcome::default();

        let due: Vec<QueueEntry> = {
            let q = self.queue();
            let online = self.connectivity.is_online();
            for e in q.entries() {
                if e.state == QueueEntryState::Pending && (!online || !e.is_due(now)) {
                    outcome.deferred += 1;
                }
            }
            if !online {
                Vec::new()
            } else {
                q.entries().iter().filter(|e| e.is_due(now)).cloned().collect()
            }
        };

        for entry in due {
            let result = match entry.draft.validate() {
                Err(v) => Err(IngestError::Malformed(v.into())),
                Ok(()) => self.boundary.insert_event(entry.draft.clone()).await,
            };
            let mut q = self.queue();
            match result {
                Ok(event_id) => {
                    q.remove_acked(&entry.local_id)?;
                    outcome.synced += 1;
                    tracing::debug!(local_id = %entry.local_id, event_id = %event_id, "queued event acknowledged");
                }
                Err(IngestError::Malformed(e)) => {
                    let mut entry = entry;
                    entry.attempt_count = entry.attempt_count.saturating_add(1);
                    entry.state = QueueEntryState::Rejected;
                    entry.last_error = Some(e.reason);
                    tracing::warn!(local_id = %entry.local_id, "queued event rejected as malformed");
                    q.replace(entry)?;
                    outcome.failed += 1;
                    outcome.rejected += 1;
                }
                Err(IngestError::Transient(e)) => {
                    let mut entry = entry;
                    entry.attempt_count = entry.attempt_count.saturating_add(1);
                    entry.last_error = Some(e.message.clone());
                    if entry.attempt_count >= self.retry.max_attempts.max(1) {
                        entry.state = QueueEntryState::DeadLetter;
                        outcome.dead_lettered += 1;
                        tracing::warn!(
                            local_id = %entry.local_id,
                            attempts = entry.attempt_count,
                            "queued event dead-lettered"
                        );
                    } else {
                        let delay = self
                            .retry
                            .backoff_ms(entry.attempt_count)
                            .max(u64::from(e.retry_after_ms.unwrap_or(0)));
                        entry.next_attempt_at = now.plus_ms(delay);
                    }
                    q.replace(entry)?;
                    outcome.failed += 1;
                }
            }
        }

        if outcome != SyncOutcome::default() {
            tracing::info!(
                synced = outcome.synced,
                failed = outcome.failed,
                deferred = outcome.deferred,
                dead_lettered = outcome.dead_lettered,
                rejected = outcome.rejected,
                "offline sync pass finished"
            );
        }
        Ok(outcome)
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        let now = self.clock.now();
        let q = self.queue();
        let mut m = QueueMetrics::default();
        for e in q.entries() {
            match e.state {
                QueueEntryState::Pending => {
                    m.pending += 1;
                    if e.is_due(now) {
                        m.due += 1;
                    }
                }
                QueueEntryState::DeadLetter => m.dead_letter += 1,
                QueueEntryState::Rejected => m.rejected += 1,
            }
        }
        m
    }

    pub fn queued_entries(&self) -> Vec<QueueEntry> {
        self.queue().entries().to_vec()
    }

    /// Re-arms dead-lettered entries for the next pass. Returns how many were re-armed.
    pub fn requeue_dead_letters(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let mut q = self.queue();
        let dead: Vec<QueueEntry> = q
            .entries()
            .iter()
            .filter(|e| e.state == QueueEntryState::DeadLetter)
            .cloned()
            .collect();
        let count = dead.len();
        for mut entry in dead {
            entry.state = QueueEntryState::Pending;
            entry.attempt_count = 0;
            entry.next_attempt_at = now;
            q.replace(entry)?;
        }
        if count > 0 {
            tracing::info!(count, "dead-lettered events re-armed");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_sync_manager_01_backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 3.0,
        };
        assert_eq!(p.backoff_ms(1), 1_000);
        assert_eq!(p.backoff_ms(2), 3_000);
        assert_eq!(p.backoff_ms(3), 9_000);
        assert_eq!(p.backoff_ms(4), 10_000);
        assert_eq!(p.backoff_ms(u16::MAX), 10_000);
    }

    #[test]
    fn at_sync_manager_02_local_ids_are_prefixed_and_unique() {
        let a = new_local_event_id().unwrap();
        let b = new_local_event_id().unwrap();
        assert!(a.as_str().starts_with(LOCAL_EVENT_ID_PREFIX));
        assert_eq!(a.as_str().len(), LOCAL_EVENT_ID_PREFIX.len() + 24);
        assert_ne!(a, b);
    }

    #[test]
    fn at_sync_manager_03_idempotency_key_depends_on_nonce() {
        let device = DeviceId::new("dev_1").unwrap();
        let session = SessionId::new("ses_1").unwrap();
        let payload = EventPayload::SessionStarted {
            app_version: None,
            odometer_km: None,
        };
        let k1 = idempotency_key(&device, &session, UnixMs(5), &payload, b"n1");
        let k1_again = idempotency_key(&device, &session, UnixMs(5), &payload, b"n1");
        let k2 = idempotency_key(&device, &session, UnixMs(5), &payload, b"n2");
        assert_eq!(k1, k1_again);
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn at_sync_manager_04_request_without_metadata_or_position_parses() {
        let v = serde_json::json!({
            "type": "session_started",
            "driver_id": "drv_1",
            "session_id": "ses_1",
            "device_id": "dev_1"
        });
        let req: EventRequest = serde_json::from_value(v).unwrap();
        assert_eq!(
            req.payload,
            EventPayload::SessionStarted {
                app_version: None,
                odometer_km: None,
            }
        );
        assert!(req.position.is_none());
        assert!(req.captured_at.is_none());
    }
}
