#![forbid(unsafe_code)]

use std::sync::Arc;

use fleet_contracts::capability::{Action, OperatingMode};
use fleet_contracts::ids::RecordedEventId;
use fleet_engines::capability::{CapabilityController, CapabilityViolation};
use fleet_storage::offline_queue::OfflineQueueStore;
use fleet_storage::repo::IngestionBoundary;
use serde::{Deserialize, Serialize};

use crate::sync_manager::{EventRequest, GeolocationProvider, RecordError, SyncManager};

/// Actions whose effect is a recorded field event.
pub const EVENT_PRODUCING_ACTIONS: [Action; 5] = [
    Action::DispatchDriver,
    Action::ReassignWithConfirmation,
    Action::AcknowledgeAlert,
    Action::ReportException,
    Action::RecordFieldEvent,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub mode: OperatingMode,
    pub action: Action,
    pub event: EventRequest,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Capability(#[from] CapabilityViolation),
    #[error("{} does not record a field event", .0.as_str())]
    NotEventProducing(Action),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Gatekeeper for user-initiated actions: the capability check runs before anything
/// reaches the sync manager or the network.
pub struct ActionDispatcher<B, S, G>
where
    B: IngestionBoundary,
    S: OfflineQueueStore,
    G: GeolocationProvider,
{
    capabilities: Arc<CapabilityController>,
    sync: Arc<SyncManager<B, S, G>>,
}

impl<B, S, G> ActionDispatcher<B, S, G>
where
    B: IngestionBoundary,
    S: OfflineQueueStore,
    G: GeolocationProvider,
{
    pub fn new(capabilities: Arc<CapabilityController>, sync: Arc<SyncManager<B, S, G>>) -> Self {
        Self { capabilities, sync }
    }

    pub fn capabilities(&self) -> &CapabilityController {
        &self.capabilities
    }

    pub async fn dispatch(&self, req: ActionRequest) -> Result<RecordedEventId, DispatchError> {
        if let Err(violation) = self.capabilities.require_action(req.mode, req.action) {
            tracing::warn!(error = %violation, "action blocked before submission");
            return Err(violation.into());
        }
        if !EVENT_PRODUCING_ACTIONS.contains(&req.action) {
            return Err(DispatchError::NotEventProducing(req.action));
        }
        let id = self.sync.record_event(req.event).await?;
        tracing::info!(
            mode = req.mode.as_str(),
            action = req.action.as_str(),
            event_id = id.as_str(),
            "action dispatched"
        );
        Ok(id)
    }
}
