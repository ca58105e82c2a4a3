#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fleet_contracts::event::{Event, EventDraft};
use fleet_contracts::ids::{BatchId, DriverId, EventId, SessionId, SERVER_EVENT_ID_PREFIX};
use fleet_contracts::Validate;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::error::{IngestError, MalformedEventPayload, QueryError};
use crate::repo::{EventQuery, IngestionBoundary};

pub const TIMELINE_LIMIT_MAX: usize = 1_000;

/// Driver/batch predicate for push delivery. Empty sets on both sides match every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub driver_ids: BTreeSet<DriverId>,
    pub batch_ids: BTreeSet<BatchId>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.driver_ids.is_empty() && self.batch_ids.is_empty() {
            return true;
        }
        self.driver_ids.contains(&event.driver_id)
            || event
                .batch_id
                .as_ref()
                .is_some_and(|b| self.batch_ids.contains(b))
    }
}

struct SubscriberSlot {
    id: u64,
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct EventStoreInner {
    events: Vec<Event>,
    by_idempotency_key: BTreeMap<String, EventId>,
    next_seq: u64,
    next_subscriber_id: u64,
    subscribers: Vec<SubscriberSlot>,
}

/// Append-only event store behind the ingestion, query and push boundaries.
///
/// Rows are never updated or removed. A draft whose idempotency key was already
/// accepted resolves to the original id without appending or pushing again.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Mutex<EventStoreInner>>,
    clock: Arc<dyn Clock>,
}

impl EventStore {
    pub fn new_in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventStoreInner::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventStoreInner> {
        // A panic while holding the lock cannot leave a half-written row: every
        // mutation is a single push.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, draft: EventDraft) -> Result<EventId, IngestError> {
        self.append(draft, None)
    }

    /// Appends an event another ingestion service already accepted, keeping the id it
    /// issued. Pushes to subscribers like a local insert. Repeats of the key or the id
    /// resolve to the existing row.
    pub fn mirror_acknowledged(
        &self,
        id: EventId,
        draft: EventDraft,
    ) -> Result<EventId, IngestError> {
        self.append(draft, Some(id))
    }

    fn append(&self, draft: EventDraft, issued: Option<EventId>) -> Result<EventId, IngestError> {
        if let Err(violation) = draft.validate() {
            tracing::warn!(
                event_type = draft.event_type().as_str(),
                driver_id = %draft.driver_id,
                "rejecting malformed event: {violation}"
            );
            return Err(MalformedEventPayload::from(violation).into());
        }
        let received_at = self.clock.now();
        let mut inner = self.lock();
        if let Some(existing) = inner.by_idempotency_key.get(&draft.idempotency_key) {
            tracing::debug!(
                event_id = %existing,
                idempotency_key = draft.idempotency_key.as_str(),
                "duplicate submission resolved to existing event"
            );
            return Ok(existing.clone());
        }
        let id = match issued {
            Some(id) => {
                if inner.events.iter().any(|e| e.id == id) {
                    return Ok(id);
                }
                id
            }
            None => {
                inner.next_seq = inner.next_seq.saturating_add(1);
                EventId::new(format!("{}{:08}", SERVER_EVENT_ID_PREFIX, inner.next_seq))
                    .map_err(|v| IngestError::Malformed(v.into()))?
            }
        };
        let event = Event::from_draft(id.clone(), draft, received_at);
        inner
            .by_idempotency_key
            .insert(event.idempotency_key.clone(), id.clone());
        inner
            .subscribers
            .retain(|slot| !slot.filter.matches(&event) || slot.tx.send(event.clone()).is_ok());
        tracing::debug!(
            event_id = %id,
            event_type = event.event_type().as_str(),
            driver_id = %event.driver_id,
            "event appended"
        );
        inner.events.push(event);
        Ok(id)
    }

    pub fn timeline(
        &self,
        driver_id: &DriverId,
        session_id: Option<&SessionId>,
        limit: usize,
    ) -> Result<Vec<Event>, QueryError> {
        let limit = bounded_limit(limit)?;
        let inner = self.lock();
        let rows = inner
            .events
            .iter()
            .filter(|e| &e.driver_id == driver_id)
            .filter(|e| session_id.map_or(true, |s| &e.session_id == s));
        Ok(newest_first(rows, limit))
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<Event>, QueryError> {
        let limit = bounded_limit(limit)?;
        let inner = self.lock();
        Ok(newest_first(inner.events.iter(), limit))
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_subscriber_id = inner.next_subscriber_id.saturating_add(1);
        let id = inner.next_subscriber_id;
        inner.subscribers.push(SubscriberSlot { id, filter, tx });
        EventSubscription {
            id,
            rx,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Live push handle. Dropping it, or calling [`EventSubscription::unsubscribe`], removes
/// the slot so a re-subscribing consumer never receives the same event twice.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    store: Weak<Mutex<EventStoreInner>>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            let mut inner = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.subscribers.retain(|slot| slot.id != self.id);
        }
    }
}

impl IngestionBoundary for EventStore {
    async fn insert_event(&self, draft: EventDraft) -> Result<EventId, IngestError> {
        self.insert(draft)
    }
}

impl EventQuery for EventStore {
    async fn get_event_timeline(
        &self,
        driver_id: &DriverId,
        session_id: Option<&SessionId>,
        limit: usize,
    ) -> Result<Vec<Event>, QueryError> {
        self.timeline(driver_id, session_id, limit)
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<Event>, QueryError> {
        self.recent(limit)
    }
}

fn bounded_limit(limit: usize) -> Result<usize, QueryError> {
    if limit == 0 || limit > TIMELINE_LIMIT_MAX {
        return Err(QueryError::InvalidQuery(format!(
            "limit must be within 1..={TIMELINE_LIMIT_MAX}"
        )));
    }
    Ok(limit)
}

// Newest capture first; among equal capture times the later arrival wins.
fn newest_first<'a>(rows: impl Iterator<Item = &'a Event>, limit: usize) -> Vec<Event> {
    let mut out: Vec<(usize, &Event)> = rows.enumerate().collect();
    out.sort_by(|(ia, a), (ib, b)| b.captured_at.cmp(&a.captured_at).then(ib.cmp(ia)));
    out.into_iter().take(limit).map(|(_, e)| e.clone()).collect()
}
