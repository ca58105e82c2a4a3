#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleet_contracts::event::Event;
use fleet_contracts::position::PositionSample;
use fleet_contracts::registry::RegistrySnapshot;
use fleet_contracts::{ContractViolation, UnixMs, Validate};
use fleet_engines::aggregator::{
    aggregate, stale_warnings, AggregatorConfig, FleetSnapshot, LivePositions, StaleWarning,
};
use fleet_engines::reconciler::Reconciler;
use fleet_storage::clock::Clock;
use fleet_storage::event_store::EventSubscription;
use fleet_storage::repo::{EventQuery, RegistrySource};
use fleet_storage::QueryError;
use tokio::task::JoinHandle;

use crate::config::FleetSyncConfig;

/// Every cache the dashboard reads: reconciled statuses, newest positions and the last
/// registry refresh. Shared as [`SharedFleetState`]; never locked across an await.
#[derive(Debug)]
pub struct FleetState {
    reconciler: Reconciler,
    positions: LivePositions,
    registry: RegistrySnapshot,
    aggregator: AggregatorConfig,
    last_event_poll_at: Option<UnixMs>,
    last_registry_poll_at: Option<UnixMs>,
}

pub type SharedFleetState = Arc<Mutex<FleetState>>;

impl FleetState {
    pub fn new(config: &FleetSyncConfig) -> Self {
        Self {
            reconciler: Reconciler::new(config.reconciler()),
            positions: LivePositions::new(),
            registry: RegistrySnapshot::default(),
            aggregator: config.aggregator(),
            last_event_poll_at: None,
            last_registry_poll_at: None,
        }
    }

    pub fn shared(config: &FleetSyncConfig) -> SharedFleetState {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn window_size(&self) -> usize {
        self.reconciler.config().window_size
    }

    pub fn apply_event_window(&mut self, events: Vec<Event>, now: UnixMs) {
        self.reconciler.rebuild(events, now);
        self.last_event_poll_at = Some(now);
    }

    pub fn apply_pushed(&mut self, event: Event) -> bool {
        self.reconciler.apply_pushed(event)
    }

    pub fn apply_registry(&mut self, snapshot: RegistrySnapshot, now: UnixMs) {
        self.registry = snapshot;
        self.last_registry_poll_at = Some(now);
    }

    /// Validates and keeps the sample if it is the driver's newest and not dated past `now`
    /// by more than the configured clock skew.
    pub fn observe_position(
        &mut self,
        sample: PositionSample,
        now: UnixMs,
    ) -> Result<bool, ContractViolation> {
        sample.validate()?;
        Ok(self
            .positions
            .observe(sample, now, self.aggregator.max_clock_skew_ms))
    }

    pub fn snapshot(&self, now: UnixMs) -> FleetSnapshot {
        aggregate(
            &self.registry,
            self.reconciler.state(),
            &self.positions,
            now,
            &self.aggregator,
        )
    }

    pub fn stale_warnings(&self, now: UnixMs) -> Vec<StaleWarning> {
        stale_warnings(&self.positions, now, &self.aggregator)
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn registry(&self) -> &RegistrySnapshot {
        &self.registry
    }

    pub fn last_event_poll_at(&self) -> Option<UnixMs> {
        self.last_event_poll_at
    }

    pub fn last_registry_poll_at(&self) -> Option<UnixMs> {
        self.last_registry_poll_at
    }
}

pub fn lock_state(state: &SharedFleetState) -> MutexGuard<'_, FleetState> {
    match state.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Re-fetches the recent window and rebuilds reconciled state from scratch.
pub async fn poll_events<Q: EventQuery>(
    state: &SharedFleetState,
    query: &Q,
    clock: &dyn Clock,
) -> Result<usize, QueryError> {
    let window = lock_state(state).window_size();
    let events = query.recent_events(window).await?;
    let fetched = events.len();
    lock_state(state).apply_event_window(events, clock.now());
    Ok(fetched)
}

pub async fn poll_registry<R: RegistrySource>(
    state: &SharedFleetState,
    source: &R,
    clock: &dyn Clock,
) -> Result<(), QueryError> {
    let snapshot = source.fetch_registry().await?;
    lock_state(state).apply_registry(snapshot, clock.now());
    Ok(())
}

/// Polls events on a fixed interval until the task is aborted. Failures are logged and
/// the previous state is kept until the next tick.
pub async fn run_event_poll_loop<Q: EventQuery>(
    state: SharedFleetState,
    query: Q,
    clock: Arc<dyn Clock>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(err) = poll_events(&state, &query, clock.as_ref()).await {
            tracing::warn!(error = %err, "event poll failed; keeping cached state");
        }
    }
}

pub async fn run_registry_poll_loop<R: RegistrySource>(
    state: SharedFleetState,
    source: R,
    clock: Arc<dyn Clock>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(err) = poll_registry(&state, &source, clock.as_ref()).await {
            tracing::warn!(error = %err, "registry poll failed; keeping cached registry");
        }
    }
}

/// Feeds pushed events into the shared state until the subscription closes.
pub fn spawn_push_listener(
    state: SharedFleetState,
    mut subscription: EventSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let applied = lock_state(&state).apply_pushed(event);
            if !applied {
                tracing::debug!("pushed event already in window");
            }
        }
        tracing::debug!(subscription = subscription.id(), "push subscription closed");
    })
}
