#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use fleet_contracts::event::{Event, EventType};
use fleet_contracts::ids::{BatchId, DriverId, EventId};
use fleet_contracts::status::{EntityKind, EntityStatus};
use fleet_contracts::UnixMs;
use serde::Serialize;

pub const RECONCILER_WINDOW_DEFAULT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub window_size: usize,
}

impl ReconcilerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            window_size: RECONCILER_WINDOW_DEFAULT,
        }
    }
}

/// Status resolved for one entity, with the event that asserted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestStatus {
    pub status: EntityStatus,
    pub event_id: EventId,
    pub event_type: EventType,
    pub captured_at: UnixMs,
}

impl LatestStatus {
    fn from_event(event: &Event, status: EntityStatus) -> Self {
        Self {
            status,
            event_id: event.id.clone(),
            event_type: event.event_type(),
            captured_at: event.captured_at,
        }
    }
}

/// Latest-event-wins maps keyed by driver and batch.
///
/// `latest_*_event` holds the newest event referencing the key. `*_status` holds the
/// newest event that carries a lifecycle status, so an event such as a photo capture
/// refreshes the entity's activity without erasing its status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciledState {
    pub latest_driver_event: BTreeMap<DriverId, Event>,
    pub latest_batch_event: BTreeMap<BatchId, Event>,
    pub driver_status: BTreeMap<DriverId, LatestStatus>,
    pub batch_status: BTreeMap<BatchId, LatestStatus>,
}

impl ReconciledState {
    /// Single pass over `events`, which must be ordered newest capture first: the first
    /// occurrence per key wins.
    pub fn from_newest_first<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut out = Self::default();
        for event in events {
            if !out.latest_driver_event.contains_key(&event.driver_id) {
                out.latest_driver_event
                    .insert(event.driver_id.clone(), event.clone());
            }
            if !out.driver_status.contains_key(&event.driver_id) {
                if let Some(status) = event.carried_status(EntityKind::Driver) {
                    out.driver_status.insert(
                        event.driver_id.clone(),
                        LatestStatus::from_event(event, status),
                    );
                }
            }
            if let Some(batch_id) = &event.batch_id {
                if !out.latest_batch_event.contains_key(batch_id) {
                    out.latest_batch_event
                        .insert(batch_id.clone(), event.clone());
                }
                if !out.batch_status.contains_key(batch_id) {
                    if let Some(status) = event.carried_status(EntityKind::Batch) {
                        out.batch_status
                            .insert(batch_id.clone(), LatestStatus::from_event(event, status));
                    }
                }
            }
        }
        out
    }

    /// Overwrites every entry the event references. Callers use this for pushed events,
    /// which are taken to be newer than anything cached.
    pub fn overwrite_with(&mut self, event: &Event) {
        self.latest_driver_event
            .insert(event.driver_id.clone(), event.clone());
        if let Some(status) = event.carried_status(EntityKind::Driver) {
            self.driver_status.insert(
                event.driver_id.clone(),
                LatestStatus::from_event(event, status),
            );
        }
        if let Some(batch_id) = &event.batch_id {
            self.latest_batch_event
                .insert(batch_id.clone(), event.clone());
            if let Some(status) = event.carried_status(EntityKind::Batch) {
                self.batch_status
                    .insert(batch_id.clone(), LatestStatus::from_event(event, status));
            }
        }
    }

    /// Exactly one status per driver: the reconciled one, else `Inactive`.
    pub fn driver_status_or_inactive(&self, driver_id: &DriverId) -> EntityStatus {
        self.driver_status
            .get(driver_id)
            .map(|s| s.status)
            .unwrap_or(EntityStatus::Inactive)
    }

    pub fn batch_status(&self, batch_id: &BatchId) -> Option<EntityStatus> {
        self.batch_status.get(batch_id).map(|s| s.status)
    }
}

/// Projects the append-only event stream into current status per entity.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcilerConfig,
    window: VecDeque<Event>,
    state: ReconciledState,
    last_rebuild_at: Option<UnixMs>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::mvp_v1())
    }
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config: ReconcilerConfig {
                window_size: config.window_size.max(1),
            },
            window: VecDeque::new(),
            state: ReconciledState::default(),
            last_rebuild_at: None,
        }
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.config
    }

    /// Re-derives every map from a freshly fetched window, discarding cached state.
    pub fn rebuild(&mut self, mut events: Vec<Event>, now: UnixMs) {
        // Stable sort keeps the source's order among equal capture times.
        events.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        events.truncate(self.config.window_size);
        self.state = ReconciledState::from_newest_first(events.iter());
        self.window = events.into();
        self.last_rebuild_at = Some(now);
        tracing::debug!(
            window = self.window.len(),
            drivers = self.state.driver_status.len(),
            batches = self.state.batch_status.len(),
            "reconciler rebuilt from poll"
        );
    }

    /// Applies one pushed event. Returns false for a redelivery already in the window.
    ///
    /// Pushed events are assumed to arrive in non-decreasing capture order. One that
    /// arrives late still wins here until the next `rebuild` corrects it.
    pub fn apply_pushed(&mut self, event: Event) -> bool {
        if self.window.iter().any(|e| e.id == event.id) {
            return false;
        }
        if let Some(newest) = self.window.front() {
            if event.captured_at < newest.captured_at {
                tracing::debug!(
                    event_id = %event.id,
                    "pushed event is older than cached newest; accepted until next poll"
                );
            }
        }
        self.state.overwrite_with(&event);
        self.window.push_front(event);
        while self.window.len() > self.config.window_size {
            self.window.pop_back();
        }
        true
    }

    pub fn state(&self) -> &ReconciledState {
        &self.state
    }

    pub fn window(&self) -> impl Iterator<Item = &Event> {
        self.window.iter()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn last_rebuild_at(&self) -> Option<UnixMs> {
        self.last_rebuild_at
    }

    pub fn driver_status(&self, driver_id: &DriverId) -> EntityStatus {
        self.state.driver_status_or_inactive(driver_id)
    }

    pub fn batch_status(&self, batch_id: &BatchId) -> Option<EntityStatus> {
        self.state.batch_status(batch_id)
    }
}
