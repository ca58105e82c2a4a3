#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use fleet_contracts::capability::{CapabilityRules, OperatingMode};
use fleet_contracts::event::Event;
use fleet_contracts::ids::{DriverId, RecordedEventId, SessionId};
use fleet_contracts::position::PositionSample;
use fleet_contracts::registry::RegistrySnapshot;
use fleet_contracts::status::EntityStatus;
use fleet_contracts::{ContractViolation, UnixMs};
use fleet_engines::aggregator::{FleetSnapshot, LiveDelivery, LiveDriver, LiveVehicle};
use fleet_engines::capability::{CapabilityController, CapabilityViolation};
use fleet_engines::projection::{
    filter_deliveries, filter_drivers, filter_vehicles, project_features, DashboardFilter,
    FeatureCollection,
};
use fleet_os::config::FleetSyncConfig;
use fleet_os::dispatch::{ActionDispatcher, ActionRequest, DispatchError};
use fleet_os::http_ingest::{HttpIngestClient, HttpIngestConfig, IngestTarget};
use fleet_os::live_state::{lock_state, poll_events, poll_registry, FleetState, SharedFleetState};
use fleet_os::sync_manager::{
    ConnectivityFlag, EventRequest, NoGeolocation, QueueMetrics, RecordError, SyncError,
    SyncManager, SyncOutcome,
};
use fleet_storage::clock::{Clock, SystemClock};
use fleet_storage::event_store::{EventStore, TIMELINE_LIMIT_MAX};
use fleet_storage::offline_queue::{FileQueueStore, OfflineQueue};
use fleet_storage::registry::InMemoryRegistry;
use fleet_storage::{QueryError, StorageError};
use serde::{Deserialize, Serialize};

pub const TIMELINE_LIMIT_DEFAULT: usize = 50;

pub type AdapterSyncManager = SyncManager<IngestTarget, FileQueueStore, NoGeolocation>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Capability(#[from] CapabilityViolation),
    #[error(transparent)]
    Dispatch(DispatchError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ContractViolation> for AdapterError {
    fn from(v: ContractViolation) -> Self {
        AdapterError::InvalidRequest(v.to_string())
    }
}

impl From<DispatchError> for AdapterError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Capability(v) => AdapterError::Capability(v),
            DispatchError::Record(r) => AdapterError::Record(r),
            other => AdapterError::Dispatch(other),
        }
    }
}

impl AdapterError {
    pub fn http_status(&self) -> u16 {
        match self {
            AdapterError::Record(RecordError::Malformed(_)) => 422,
            AdapterError::Capability(_) => 403,
            AdapterError::Dispatch(_) => 400,
            AdapterError::Sync(SyncError::SyncInFlight) => 409,
            AdapterError::Query(QueryError::InvalidQuery(_)) => 400,
            AdapterError::Query(QueryError::Transient(_)) => 503,
            AdapterError::InvalidRequest(_) => 400,
            AdapterError::Record(RecordError::Storage(_))
            | AdapterError::Sync(SyncError::Storage(_))
            | AdapterError::Storage(_) => 500,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            AdapterError::Capability(_) => "DENIED",
            AdapterError::Sync(SyncError::SyncInFlight) => "BUSY",
            _ => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
}

impl From<&AdapterError> for ErrorResponse {
    fn from(e: &AdapterError) -> Self {
        Self {
            status: "error".to_string(),
            outcome: e.outcome().to_string(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordEventResponse {
    pub status: String,
    /// `ACCEPTED` when the store issued an id, `QUEUED` when parked offline.
    pub outcome: String,
    pub event_id: RecordedEventId,
}

impl RecordEventResponse {
    fn from_id(event_id: RecordedEventId) -> Self {
        Self {
            status: "ok".to_string(),
            outcome: if event_id.is_local() { "QUEUED" } else { "ACCEPTED" }.to_string(),
            event_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub stored_events: usize,
    pub queue: QueueMetrics,
    pub stale_drivers: usize,
    pub last_event_poll_at: Option<UnixMs>,
    pub last_registry_poll_at: Option<UnixMs>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimelineQuery {
    pub driver_id: DriverId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub online_only: Option<bool>,
    /// Comma-separated statuses, e.g. `EN_ROUTE,AT_STOP`; case-insensitive.
    #[serde(default)]
    pub status: Option<String>,
}

impl LiveQuery {
    fn filter(&self) -> Result<DashboardFilter, AdapterError> {
        let statuses: BTreeSet<EntityStatus> = self
            .status
            .iter()
            .flat_map(|list| list.split(','))
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                EntityStatus::parse(s)
                    .ok_or_else(|| AdapterError::InvalidRequest(format!("unknown status {}", s.trim())))
            })
            .collect::<Result<_, AdapterError>>()?;
        Ok(DashboardFilter {
            search_text: self.search.clone(),
            online_only: self.online_only.unwrap_or(false),
            statuses,
            ..DashboardFilter::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MapFeaturesRequest {
    pub mode: OperatingMode,
    #[serde(default)]
    pub filter: DashboardFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionAck {
    pub accepted: bool,
}

/// Everything the HTTP surface needs, safe to share across handler tasks.
pub struct AdapterRuntime {
    config: FleetSyncConfig,
    clock: Arc<dyn Clock>,
    store: EventStore,
    registry: InMemoryRegistry,
    state: SharedFleetState,
    capabilities: Arc<CapabilityController>,
    sync: Arc<AdapterSyncManager>,
    dispatcher: ActionDispatcher<IngestTarget, FileQueueStore, NoGeolocation>,
}

impl AdapterRuntime {
    pub fn new(
        config: FleetSyncConfig,
        clock: Arc<dyn Clock>,
        remote: Option<HttpIngestConfig>,
    ) -> Result<Self, AdapterError> {
        let store = EventStore::new_in_memory(clock.clone());
        let target = match remote {
            Some(c) => {
                tracing::info!(endpoint = c.endpoint.as_str(), "relaying events to remote ingestion");
                IngestTarget::Remote {
                    client: HttpIngestClient::new(c),
                    mirror: store.clone(),
                }
            }
            None => IngestTarget::Local(store.clone()),
        };
        let queue = OfflineQueue::open(FileQueueStore::in_dir(&config.offline_queue_dir))?;
        let sync = Arc::new(SyncManager::new(
            target,
            queue,
            NoGeolocation,
            Arc::new(ConnectivityFlag::new(true)),
            clock.clone(),
            config.retry,
            config.geolocation_timeout(),
        ));
        let capabilities = Arc::new(CapabilityController::default());
        let dispatcher = ActionDispatcher::new(capabilities.clone(), sync.clone());
        Ok(Self {
            state: FleetState::shared(&config),
            registry: InMemoryRegistry::new(clock.clone()),
            config,
            clock,
            store,
            capabilities,
            sync,
            dispatcher,
        })
    }

    /// Config from `FLEET_*`, optional remote relay, and an optional registry seed file
    /// named by `FLEET_REGISTRY_SEED`.
    pub fn default_from_env() -> Result<Self, AdapterError> {
        let config = FleetSyncConfig::from_env();
        fs::create_dir_all(&config.offline_queue_dir).map_err(|e| StorageError::Io {
            path: config.offline_queue_dir.display().to_string(),
            message: e.to_string(),
        })?;
        let runtime = Self::new(config, Arc::new(SystemClock), HttpIngestConfig::from_env())?;
        if let Some(path) = env::var("FLEET_REGISTRY_SEED")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            runtime.seed_registry_from_file(Path::new(&path))?;
        }
        Ok(runtime)
    }

    pub fn seed_registry_from_file(&self, path: &Path) -> Result<usize, AdapterError> {
        let raw = fs::read_to_string(path).map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let seed: RegistrySnapshot = serde_json::from_str(&raw).map_err(|e| {
            AdapterError::InvalidRequest(format!("registry seed {}: {e}", path.display()))
        })?;
        self.seed_registry(seed)
    }

    pub fn seed_registry(&self, seed: RegistrySnapshot) -> Result<usize, AdapterError> {
        let count = seed.drivers.len() + seed.vehicles.len() + seed.batches.len();
        for d in seed.drivers {
            self.registry.upsert_driver(d)?;
        }
        for v in seed.vehicles {
            self.registry.upsert_vehicle(v)?;
        }
        for b in seed.batches {
            self.registry.upsert_batch(b)?;
        }
        tracing::info!(records = count, "registry seeded");
        Ok(count)
    }

    pub fn config(&self) -> &FleetSyncConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn registry(&self) -> &InMemoryRegistry {
        &self.registry
    }

    pub fn state(&self) -> SharedFleetState {
        self.state.clone()
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        let now = self.clock.now();
        let s = lock_state(&self.state);
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            stored_events: self.store.len(),
            queue: self.sync.queue_metrics(),
            stale_drivers: s.stale_warnings(now).len(),
            last_event_poll_at: s.last_event_poll_at(),
            last_registry_poll_at: s.last_registry_poll_at(),
        }
    }

    pub async fn record_event(&self, req: EventRequest) -> Result<RecordEventResponse, AdapterError> {
        let id = self.sync.record_event(req).await?;
        Ok(RecordEventResponse::from_id(id))
    }

    pub fn timeline(&self, q: &TimelineQuery) -> Result<Vec<Event>, AdapterError> {
        let limit = q.limit.unwrap_or(TIMELINE_LIMIT_DEFAULT).min(TIMELINE_LIMIT_MAX);
        Ok(self
            .store
            .timeline(&q.driver_id, q.session_id.as_ref(), limit)?)
    }

    pub fn observe_position(&self, sample: PositionSample) -> Result<PositionAck, AdapterError> {
        let accepted = lock_state(&self.state).observe_position(sample, self.clock.now())?;
        Ok(PositionAck { accepted })
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        lock_state(&self.state).snapshot(self.clock.now())
    }

    pub fn live_drivers(&self, q: &LiveQuery) -> Result<Vec<LiveDriver>, AdapterError> {
        let filter = q.filter()?;
        Ok(filter_drivers(&self.snapshot().drivers, &filter))
    }

    pub fn live_vehicles(&self, q: &LiveQuery) -> Result<Vec<LiveVehicle>, AdapterError> {
        let filter = q.filter()?;
        Ok(filter_vehicles(&self.snapshot().vehicles, &filter))
    }

    pub fn live_deliveries(&self, q: &LiveQuery) -> Result<Vec<LiveDelivery>, AdapterError> {
        let filter = q.filter()?;
        Ok(filter_deliveries(&self.snapshot().deliveries, &filter))
    }

    pub fn map_features(&self, req: &MapFeaturesRequest) -> FeatureCollection {
        project_features(&self.snapshot(), &req.filter, req.mode, &self.capabilities)
    }

    pub fn capability_rules(&self, mode: &str) -> Result<CapabilityRules, AdapterError> {
        let mode = OperatingMode::parse(mode)
            .ok_or_else(|| AdapterError::InvalidRequest(format!("unknown operating mode {mode}")))?;
        self.capabilities
            .matrix()
            .rules(mode)
            .cloned()
            .ok_or_else(|| AdapterError::InvalidRequest(format!("no rules for {}", mode.as_str())))
    }

    pub async fn dispatch_action(
        &self,
        req: ActionRequest,
    ) -> Result<RecordEventResponse, AdapterError> {
        let id = self.dispatcher.dispatch(req).await?;
        Ok(RecordEventResponse::from_id(id))
    }

    pub async fn run_sync_pass(&self) -> Result<SyncOutcome, AdapterError> {
        Ok(self.sync.sync_offline_events().await?)
    }

    pub fn requeue_dead_letters(&self) -> Result<usize, AdapterError> {
        Ok(self.sync.requeue_dead_letters()?)
    }

    /// One poll of both sources; what the background loops do on each tick.
    pub async fn refresh(&self) -> Result<(), AdapterError> {
        poll_registry(&self.state, &self.registry, self.clock.as_ref()).await?;
        poll_events(&self.state, &self.store, self.clock.as_ref()).await?;
        Ok(())
    }
}
