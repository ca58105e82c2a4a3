#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};

use crate::common::{validate_id, validate_text};
use crate::geo::GeoPoint;
use crate::ids::{BatchId, DeviceId, DispatchId, DriverId, EventId, FacilityId, SessionId, TripId, VehicleId};
use crate::status::{EntityKind, EntityStatus};
use crate::{ContractViolation, UnixMs, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    SessionEnded,
    SessionSuspended,
    TripStarted,
    BatchStarted,
    DeliveryStarted,
    ArrivedAtStop,
    DeliveryCompleted,
    DeliveryFailed,
    BatchCompleted,
    PhotoCaptured,
    DelayReported,
    StatusChanged,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SessionStarted => "session_started",
            EventType::SessionEnded => "session_ended",
            EventType::SessionSuspended => "session_suspended",
            EventType::TripStarted => "trip_started",
            EventType::BatchStarted => "batch_started",
            EventType::DeliveryStarted => "delivery_started",
            EventType::ArrivedAtStop => "arrived_at_stop",
            EventType::DeliveryCompleted => "delivery_completed",
            EventType::DeliveryFailed => "delivery_failed",
            EventType::BatchCompleted => "batch_completed",
            EventType::PhotoCaptured => "photo_captured",
            EventType::DelayReported => "delay_reported",
            EventType::StatusChanged => "status_changed",
        }
    }

    /// Event types that only make sense against a batch.
    pub fn requires_batch(self) -> bool {
        matches!(
            self,
            EventType::BatchStarted
                | EventType::BatchCompleted
                | EventType::DeliveryStarted
                | EventType::ArrivedAtStop
                | EventType::DeliveryCompleted
                | EventType::DeliveryFailed
        )
    }
}

/// Event type together with the metadata that type is allowed to carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        app_version: Option<String>,
        odometer_km: Option<f64>,
    },
    SessionEnded {
        reason: Option<String>,
    },
    SessionSuspended {
        reason: String,
    },
    TripStarted {
        planned_stops: Option<u32>,
    },
    BatchStarted {
        stop_count: u32,
    },
    DeliveryStarted {
        stop_index: u32,
        facility_id: Option<FacilityId>,
    },
    ArrivedAtStop {
        stop_index: u32,
        facility_id: Option<FacilityId>,
    },
    DeliveryCompleted {
        stop_index: u32,
        facility_id: Option<FacilityId>,
        recipient_name: Option<String>,
        items_delivered: Option<u32>,
    },
    DeliveryFailed {
        stop_index: u32,
        reason: String,
    },
    BatchCompleted {
        delivered_stops: u32,
        failed_stops: u32,
    },
    PhotoCaptured {
        photo_ref: String,
        stop_index: Option<u32>,
    },
    DelayReported {
        reason: String,
        estimated_delay_min: Option<u32>,
    },
    StatusChanged {
        status: EntityStatus,
        note: Option<String>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::SessionStarted { .. } => EventType::SessionStarted,
            EventPayload::SessionEnded { .. } => EventType::SessionEnded,
            EventPayload::SessionSuspended { .. } => EventType::SessionSuspended,
            EventPayload::TripStarted { .. } => EventType::TripStarted,
            EventPayload::BatchStarted { .. } => EventType::BatchStarted,
            EventPayload::DeliveryStarted { .. } => EventType::DeliveryStarted,
            EventPayload::ArrivedAtStop { .. } => EventType::ArrivedAtStop,
            EventPayload::DeliveryCompleted { .. } => EventType::DeliveryCompleted,
            EventPayload::DeliveryFailed { .. } => EventType::DeliveryFailed,
            EventPayload::BatchCompleted { .. } => EventType::BatchCompleted,
            EventPayload::PhotoCaptured { .. } => EventType::PhotoCaptured,
            EventPayload::DelayReported { .. } => EventType::DelayReported,
            EventPayload::StatusChanged { .. } => EventType::StatusChanged,
        }
    }

    /// Lifecycle status this event asserts for an entity of `kind`, if any.
    pub fn carried_status(&self, kind: EntityKind) -> Option<EntityStatus> {
        use EntityKind::{Batch, Driver};
        match (self, kind) {
            (EventPayload::StatusChanged { status, .. }, _) => Some(*status),
            (EventPayload::PhotoCaptured { .. }, _) => None,

            (EventPayload::SessionStarted { .. }, Driver) => Some(EntityStatus::Active),
            (EventPayload::SessionEnded { .. }, Driver) => Some(EntityStatus::Inactive),
            (EventPayload::SessionSuspended { .. }, Driver) => Some(EntityStatus::Suspended),
            (
                EventPayload::SessionStarted { .. }
                | EventPayload::SessionEnded { .. }
                | EventPayload::SessionSuspended { .. },
                Batch,
            ) => None,

            (
                EventPayload::TripStarted { .. }
                | EventPayload::BatchStarted { .. }
                | EventPayload::DeliveryStarted { .. },
                _,
            ) => Some(EntityStatus::EnRoute),
            (EventPayload::ArrivedAtStop { .. }, _) => Some(EntityStatus::AtStop),
            (EventPayload::DeliveryFailed { .. } | EventPayload::DelayReported { .. }, _) => {
                Some(EntityStatus::Delayed)
            }

            (EventPayload::DeliveryCompleted { .. }, Driver) => Some(EntityStatus::Active),
            (EventPayload::DeliveryCompleted { .. }, Batch) => Some(EntityStatus::EnRoute),
            (EventPayload::BatchCompleted { .. }, Driver) => Some(EntityStatus::Active),
            (EventPayload::BatchCompleted { .. }, Batch) => Some(EntityStatus::Completed),
        }
    }
}

impl Validate for EventPayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            EventPayload::SessionStarted {
                app_version,
                odometer_km,
            } => {
                if let Some(v) = app_version {
                    validate_text("session_started.app_version", v, 32)?;
                }
                if let Some(km) = odometer_km {
                    if !km.is_finite() || *km < 0.0 {
                        return Err(ContractViolation::InvalidValue {
                            field: "session_started.odometer_km",
                            reason: "must be finite and >= 0",
                        });
                    }
                }
            }
            EventPayload::SessionEnded { reason } => {
                if let Some(r) = reason {
                    validate_text("session_ended.reason", r, 256)?;
                }
            }
            EventPayload::SessionSuspended { reason } => {
                validate_text("session_suspended.reason", reason, 256)?;
            }
            EventPayload::TripStarted { .. } => {}
            EventPayload::BatchStarted { stop_count } => {
                if *stop_count == 0 {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_started.stop_count",
                        reason: "must be > 0",
                    });
                }
            }
            EventPayload::DeliveryStarted { facility_id, .. }
            | EventPayload::ArrivedAtStop { facility_id, .. } => {
                if let Some(f) = facility_id {
                    f.validate()?;
                }
            }
            EventPayload::DeliveryCompleted {
                facility_id,
                recipient_name,
                ..
            } => {
                if let Some(f) = facility_id {
                    f.validate()?;
                }
                if let Some(n) = recipient_name {
                    validate_text("delivery_completed.recipient_name", n, 128)?;
                }
            }
            EventPayload::DeliveryFailed { reason, .. } => {
                validate_text("delivery_failed.reason", reason, 256)?;
            }
            EventPayload::BatchCompleted { .. } => {}
            EventPayload::PhotoCaptured { photo_ref, .. } => {
                validate_id("photo_captured.photo_ref", photo_ref, 256)?;
            }
            EventPayload::DelayReported { reason, .. } => {
                validate_text("delay_reported.reason", reason, 256)?;
            }
            EventPayload::StatusChanged { note, .. } => {
                if let Some(n) = note {
                    validate_text("status_changed.note", n, 256)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct PayloadEnvelope {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Reads a flattened `type` + `metadata` pair. An absent or null `metadata` is read as
/// `{}`, so types whose metadata fields are all optional may omit it; required fields
/// are still enforced.
pub fn deserialize_payload<'de, D>(deserializer: D) -> Result<EventPayload, D::Error>
where
    D: Deserializer<'de>,
{
    let envelope = PayloadEnvelope::deserialize(deserializer)?;
    let metadata = envelope
        .metadata
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    let tagged = serde_json::json!({
        "type": envelope.event_type.as_str(),
        "metadata": metadata,
    });
    EventPayload::deserialize(tagged).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Persisted by the event store.
    Synced,
    /// Recorded while offline and still waiting in the local queue.
    Pending,
}

/// Everything a client supplies when submitting an event. The store adds id and receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    #[serde(flatten, deserialize_with = "deserialize_payload")]
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
    pub position: GeoPoint,
    pub captured_at: UnixMs,
    pub idempotency_key: String,
}

impl EventDraft {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

impl Validate for EventDraft {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.payload.validate()?;
        self.driver_id.validate()?;
        self.session_id.validate()?;
        self.device_id.validate()?;
        if let Some(v) = &self.vehicle_id {
            v.validate()?;
        }
        if let Some(v) = &self.batch_id {
            v.validate()?;
        }
        if let Some(v) = &self.trip_id {
            v.validate()?;
        }
        if let Some(v) = &self.dispatch_id {
            v.validate()?;
        }
        if self.event_type().requires_batch() && self.batch_id.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "event_draft.batch_id",
                reason: "must be present for batch and delivery events",
            });
        }
        self.position.validate()?;
        if self.captured_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "event_draft.captured_at",
                reason: "must be > 0",
            });
        }
        validate_id("event_draft.idempotency_key", &self.idempotency_key, 128)?;
        Ok(())
    }
}

/// Persisted, immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(flatten, deserialize_with = "deserialize_payload")]
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
    pub position: GeoPoint,
    pub captured_at: UnixMs,
    pub received_at: UnixMs,
    pub idempotency_key: String,
    pub sync_status: SyncStatus,
}

impl Event {
    pub fn from_draft(id: EventId, draft: EventDraft, received_at: UnixMs) -> Self {
        Self {
            id,
            payload: draft.payload,
            driver_id: draft.driver_id,
            session_id: draft.session_id,
            device_id: draft.device_id,
            vehicle_id: draft.vehicle_id,
            batch_id: draft.batch_id,
            trip_id: draft.trip_id,
            dispatch_id: draft.dispatch_id,
            position: draft.position,
            captured_at: draft.captured_at,
            received_at,
            idempotency_key: draft.idempotency_key,
            sync_status: SyncStatus::Synced,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn carried_status(&self, kind: EntityKind) -> Option<EntityStatus> {
        match kind {
            EntityKind::Driver => self.payload.carried_status(kind),
            EntityKind::Batch => self
                .batch_id
                .as_ref()
                .and_then(|_| self.payload.carried_status(kind)),
        }
    }
}
