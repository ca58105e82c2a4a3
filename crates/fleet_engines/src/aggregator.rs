#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use fleet_contracts::event::EventType;
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::ids::{BatchId, DriverId, VehicleId};
use fleet_contracts::position::PositionSample;
use fleet_contracts::registry::{BatchRecord, Priority, RegistrySnapshot, Stop, VehicleType};
use fleet_contracts::status::EntityStatus;
use fleet_contracts::UnixMs;
use serde::Serialize;

use crate::reconciler::ReconciledState;

pub const STALENESS_WINDOW_MS_DEFAULT: u64 = 300_000;
pub const FALLBACK_UTILIZATION_PER_STOP_PCT: f64 = 15.0;
pub const MAX_CLOCK_SKEW_MS_DEFAULT: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorConfig {
    pub staleness_window_ms: u64,
    pub fallback_utilization_per_stop_pct: f64,
    /// Samples captured further than this past the observer's clock are ignored.
    pub max_clock_skew_ms: u64,
}

impl AggregatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            staleness_window_ms: STALENESS_WINDOW_MS_DEFAULT,
            fallback_utilization_per_stop_pct: FALLBACK_UTILIZATION_PER_STOP_PCT,
            max_clock_skew_ms: MAX_CLOCK_SKEW_MS_DEFAULT,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

/// Newest position sample per driver.
#[derive(Debug, Clone, Default)]
pub struct LivePositions {
    latest: BTreeMap<DriverId, PositionSample>,
}

impl LivePositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `sample` unless an equal-or-newer one is already held, or it is dated more
    /// than `max_clock_skew_ms` past `now`. Returns whether it was kept.
    pub fn observe(&mut self, sample: PositionSample, now: UnixMs, max_clock_skew_ms: u64) -> bool {
        if sample.captured_at.0 > now.0.saturating_add(max_clock_skew_ms) {
            tracing::debug!(
                driver_id = %sample.driver_id,
                captured_at = sample.captured_at.0,
                now = now.0,
                "future-dated position sample ignored"
            );
            return false;
        }
        match self.latest.get(&sample.driver_id) {
            Some(held) if held.captured_at >= sample.captured_at => false,
            _ => {
                self.latest.insert(sample.driver_id.clone(), sample);
                true
            }
        }
    }

    pub fn get(&self, driver_id: &DriverId) -> Option<&PositionSample> {
        self.latest.get(driver_id)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    Live,
    Stale { age_ms: u64 },
    NoSignal,
}

impl Freshness {
    pub fn of(sample: Option<&PositionSample>, now: UnixMs, staleness_window_ms: u64) -> Self {
        match sample {
            None => Freshness::NoSignal,
            Some(s) => {
                let age_ms = s.age_ms(now);
                if age_ms < staleness_window_ms {
                    Freshness::Live
                } else {
                    Freshness::Stale { age_ms }
                }
            }
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, Freshness::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    LiveSample,
    LastKnown,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveDriver {
    pub driver_id: DriverId,
    pub display_name: String,
    pub status: EntityStatus,
    pub position: Option<GeoPoint>,
    pub position_source: PositionSource,
    pub is_online: bool,
    pub freshness: Freshness,
    pub last_seen_at: Option<UnixMs>,
    pub speed_kmh: Option<f64>,
    pub battery_level: Option<f64>,
    pub last_event_type: Option<EventType>,
    pub batch_id: Option<BatchId>,
    pub vehicle_id: Option<VehicleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Utilization {
    Measured { percent: f64 },
    Estimated { percent: f64, stop_count: u32 },
}

impl Utilization {
    pub fn percent(&self) -> f64 {
        match self {
            Utilization::Measured { percent } | Utilization::Estimated { percent, .. } => *percent,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, Utilization::Estimated { .. })
    }

    /// Measured figure when the batch carries one, else `min(stops * per_stop, 100)`.
    pub fn for_batch(batch: &BatchRecord, per_stop_pct: f64) -> Self {
        match batch.measured_utilization_pct {
            Some(percent) => Utilization::Measured { percent },
            None => {
                let stop_count = batch.stops.len() as u32;
                Utilization::Estimated {
                    percent: (f64::from(stop_count) * per_stop_pct).min(100.0),
                    stop_count,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveVehicle {
    pub vehicle_id: VehicleId,
    pub plate_number: String,
    pub vehicle_type: VehicleType,
    pub driver_id: Option<DriverId>,
    pub status: EntityStatus,
    pub position: Option<GeoPoint>,
    pub is_online: bool,
    pub batch_id: Option<BatchId>,
    pub utilization: Option<Utilization>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    RoadNetwork,
    StraightLine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePath {
    pub source: RouteSource,
    pub points: Vec<GeoPoint>,
}

impl RoutePath {
    /// Road geometry when at least two points were computed, else depot followed by stops.
    pub fn for_batch(batch: &BatchRecord) -> Option<Self> {
        if let Some(geometry) = &batch.route_geometry {
            if geometry.len() >= 2 {
                return Some(RoutePath {
                    source: RouteSource::RoadNetwork,
                    points: geometry.clone(),
                });
            }
        }
        let points: Vec<GeoPoint> = batch
            .depot
            .into_iter()
            .chain(batch.stops.iter().map(|s| s.position))
            .collect();
        if points.is_empty() {
            return None;
        }
        Some(RoutePath {
            source: RouteSource::StraightLine,
            points,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveDelivery {
    pub batch_id: BatchId,
    pub name: String,
    pub priority: Priority,
    pub status: EntityStatus,
    pub driver_id: Option<DriverId>,
    pub vehicle_id: Option<VehicleId>,
    pub completed_stops: u32,
    pub total_stops: u32,
    pub progress_pct: f64,
    pub next_stop: Option<Stop>,
    pub route: Option<RoutePath>,
    pub driver_position: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub generated_at: UnixMs,
    pub drivers: Vec<LiveDriver>,
    pub vehicles: Vec<LiveVehicle>,
    pub deliveries: Vec<LiveDelivery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleWarning {
    pub driver_id: DriverId,
    pub age_ms: u64,
}

/// Joins registry, reconciled status and live positions into the composite views.
/// Pure: the same inputs always produce the same snapshot.
pub fn aggregate(
    registry: &RegistrySnapshot,
    reconciled: &ReconciledState,
    positions: &LivePositions,
    now: UnixMs,
    config: &AggregatorConfig,
) -> FleetSnapshot {
    let drivers: Vec<LiveDriver> = registry
        .drivers
        .iter()
        .map(|record| {
            let sample = positions.get(&record.driver_id);
            let freshness = Freshness::of(sample, now, config.staleness_window_ms);
            let (position, position_source) = match (sample, record.last_known_position) {
                (Some(s), _) => (Some(s.position), PositionSource::LiveSample),
                (None, Some(p)) => (Some(p), PositionSource::LastKnown),
                (None, None) => (None, PositionSource::Unknown),
            };
            LiveDriver {
                driver_id: record.driver_id.clone(),
                display_name: record.display_name.clone(),
                status: reconciled.driver_status_or_inactive(&record.driver_id),
                position,
                position_source,
                is_online: freshness.is_online(),
                freshness,
                last_seen_at: sample.map(|s| s.captured_at),
                speed_kmh: sample.and_then(|s| s.speed_kmh),
                battery_level: sample.and_then(|s| s.battery_level),
                last_event_type: reconciled
                    .latest_driver_event
                    .get(&record.driver_id)
                    .map(|e| e.event_type()),
                batch_id: registry
                    .active_batch_for_driver(&record.driver_id)
                    .map(|b| b.batch_id.clone()),
                vehicle_id: registry
                    .vehicle_for_driver(&record.driver_id)
                    .map(|v| v.vehicle_id.clone()),
            }
        })
        .collect();

    let driver_view = |id: &DriverId| drivers.iter().find(|d| &d.driver_id == id);

    let vehicles = registry
        .vehicles
        .iter()
        .map(|record| {
            let batch = registry.active_batch_for_vehicle(&record.vehicle_id);
            let driver_id = record
                .assigned_driver_id
                .clone()
                .or_else(|| batch.and_then(|b| b.driver_id.clone()));
            let driver = driver_id.as_ref().and_then(driver_view);
            LiveVehicle {
                vehicle_id: record.vehicle_id.clone(),
                plate_number: record.plate_number.clone(),
                vehicle_type: record.vehicle_type,
                status: driver.map(|d| d.status).unwrap_or(EntityStatus::Inactive),
                position: driver.and_then(|d| d.position),
                is_online: driver.map(|d| d.is_online).unwrap_or(false),
                driver_id,
                batch_id: batch.map(|b| b.batch_id.clone()),
                utilization: batch
                    .map(|b| Utilization::for_batch(b, config.fallback_utilization_per_stop_pct)),
            }
        })
        .collect();

    let deliveries = registry
        .batches
        .iter()
        .map(|batch| {
            let total_stops = batch.stops.len() as u32;
            let completed_stops = batch.current_stop_index.min(total_stops);
            let progress_pct = if total_stops == 0 {
                0.0
            } else {
                f64::from(completed_stops) * 100.0 / f64::from(total_stops)
            };
            let status = reconciled
                .batch_status(&batch.batch_id)
                .unwrap_or(if batch.completed {
                    EntityStatus::Completed
                } else {
                    EntityStatus::Inactive
                });
            LiveDelivery {
                batch_id: batch.batch_id.clone(),
                name: batch.name.clone(),
                priority: batch.priority,
                status,
                driver_id: batch.driver_id.clone(),
                vehicle_id: batch.vehicle_id.clone(),
                completed_stops,
                total_stops,
                progress_pct,
                next_stop: batch.stops.get(completed_stops as usize).cloned(),
                route: RoutePath::for_batch(batch),
                driver_position: batch
                    .driver_id
                    .as_ref()
                    .and_then(driver_view)
                    .and_then(|d| d.position),
            }
        })
        .collect();

    FleetSnapshot {
        generated_at: now,
        drivers,
        vehicles,
        deliveries,
    }
}

/// Drivers whose newest sample has passed the staleness window.
pub fn stale_warnings(
    positions: &LivePositions,
    now: UnixMs,
    config: &AggregatorConfig,
) -> Vec<StaleWarning> {
    positions
        .latest
        .values()
        .filter_map(|s| match Freshness::of(Some(s), now, config.staleness_window_ms) {
            Freshness::Stale { age_ms } => Some(StaleWarning {
                driver_id: s.driver_id.clone(),
                age_ms,
            }),
            _ => None,
        })
        .collect()
}
