#![forbid(unsafe_code)]

use std::future::Future;

use fleet_contracts::event::{Event, EventDraft};
use fleet_contracts::ids::{DriverId, EventId, SessionId};
use fleet_contracts::registry::RegistrySnapshot;

use crate::error::{IngestError, QueryError};

/// Where immutable events are submitted. Implementations must return the id already
/// issued when a draft repeats an idempotency key they have seen.
pub trait IngestionBoundary: Send + Sync {
    fn insert_event(
        &self,
        draft: EventDraft,
    ) -> impl Future<Output = Result<EventId, IngestError>> + Send;
}

pub trait EventQuery: Send + Sync {
    /// Events for one driver, newest `captured_at` first.
    fn get_event_timeline(
        &self,
        driver_id: &DriverId,
        session_id: Option<&SessionId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Event>, QueryError>> + Send;

    /// The most recent events across the fleet, newest `captured_at` first.
    fn recent_events(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Event>, QueryError>> + Send;
}

pub trait RegistrySource: Send + Sync {
    fn fetch_registry(&self) -> impl Future<Output = Result<RegistrySnapshot, QueryError>> + Send;
}

impl<T: IngestionBoundary> IngestionBoundary for std::sync::Arc<T> {
    fn insert_event(
        &self,
        draft: EventDraft,
    ) -> impl Future<Output = Result<EventId, IngestError>> + Send {
        (**self).insert_event(draft)
    }
}

impl<T: EventQuery> EventQuery for std::sync::Arc<T> {
    fn get_event_timeline(
        &self,
        driver_id: &DriverId,
        session_id: Option<&SessionId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Event>, QueryError>> + Send {
        (**self).get_event_timeline(driver_id, session_id, limit)
    }

    fn recent_events(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Event>, QueryError>> + Send {
        (**self).recent_events(limit)
    }
}

impl<T: RegistrySource> RegistrySource for std::sync::Arc<T> {
    fn fetch_registry(&self) -> impl Future<Output = Result<RegistrySnapshot, QueryError>> + Send {
        (**self).fetch_registry()
    }
}
