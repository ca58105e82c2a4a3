#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use fleet_contracts::capability::{Layer, OperatingMode};
use fleet_contracts::geo::GeoPoint;
use fleet_contracts::registry::{Priority, VehicleType};
use fleet_contracts::status::EntityStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregator::{FleetSnapshot, LiveDelivery, LiveDriver, LiveVehicle};
use crate::capability::CapabilityController;

fn yes() -> bool {
    true
}

/// Dashboard view options. Empty sets mean "no restriction".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardFilter {
    #[serde(default = "yes")]
    pub show_drivers: bool,
    #[serde(default = "yes")]
    pub show_vehicles: bool,
    #[serde(default = "yes")]
    pub show_deliveries: bool,
    #[serde(default = "yes")]
    pub show_routes: bool,
    #[serde(default)]
    pub statuses: BTreeSet<EntityStatus>,
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub vehicle_types: BTreeSet<VehicleType>,
    #[serde(default)]
    pub priorities: BTreeSet<Priority>,
    #[serde(default)]
    pub online_only: bool,
}

impl Default for DashboardFilter {
    fn default() -> Self {
        Self {
            show_drivers: true,
            show_vehicles: true,
            show_deliveries: true,
            show_routes: true,
            statuses: BTreeSet::new(),
            search_text: None,
            vehicle_types: BTreeSet::new(),
            priorities: BTreeSet::new(),
            online_only: false,
        }
    }
}

impl DashboardFilter {
    fn status_ok(&self, status: EntityStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }

    fn search_ok(&self, haystacks: &[&str]) -> bool {
        let needle = match self.search_text.as_deref().map(str::trim) {
            None | Some("") => return true,
            Some(n) => n.to_lowercase(),
        };
        haystacks
            .iter()
            .any(|h| h.to_lowercase().contains(&needle))
    }

    pub fn accepts_driver(&self, d: &LiveDriver) -> bool {
        self.status_ok(d.status)
            && (!self.online_only || d.is_online)
            && self.search_ok(&[d.driver_id.as_str(), &d.display_name])
    }

    pub fn accepts_vehicle(&self, v: &LiveVehicle) -> bool {
        self.status_ok(v.status)
            && (!self.online_only || v.is_online)
            && (self.vehicle_types.is_empty() || self.vehicle_types.contains(&v.vehicle_type))
            && self.search_ok(&[v.vehicle_id.as_str(), &v.plate_number])
    }

    pub fn accepts_delivery(&self, d: &LiveDelivery) -> bool {
        self.status_ok(d.status)
            && (self.priorities.is_empty() || self.priorities.contains(&d.priority))
            && self.search_ok(&[d.batch_id.as_str(), &d.name])
    }
}

/// Filtered drivers in id order, independent of input order.
pub fn filter_drivers(drivers: &[LiveDriver], filter: &DashboardFilter) -> Vec<LiveDriver> {
    let mut out: Vec<LiveDriver> = drivers
        .iter()
        .filter(|d| filter.accepts_driver(d))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
    out
}

pub fn filter_vehicles(vehicles: &[LiveVehicle], filter: &DashboardFilter) -> Vec<LiveVehicle> {
    let mut out: Vec<LiveVehicle> = vehicles
        .iter()
        .filter(|v| filter.accepts_vehicle(v))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
    out
}

pub fn filter_deliveries(
    deliveries: &[LiveDelivery],
    filter: &DashboardFilter,
) -> Vec<LiveDelivery> {
    let mut out: Vec<LiveDelivery> = deliveries
        .iter()
        .filter(|d| filter.accepts_delivery(d))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: [f64; 2] },
    LineString { coordinates: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub geometry: Geometry,
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Point feature, or nothing when the coordinate is unresolved. Unresolved means either
/// coordinate is exactly zero, so a point lying on the equator or the prime meridian is
/// dropped as well.
pub fn point_feature(id: String, at: GeoPoint, properties: BTreeMap<String, Value>) -> Option<Feature> {
    if at.is_unresolved() {
        return None;
    }
    Some(Feature {
        kind: "Feature",
        id,
        geometry: Geometry::Point {
            coordinates: at.lng_lat(),
        },
        properties,
    })
}

/// Line feature over the resolved points, or nothing when fewer than two distinct remain.
pub fn line_feature(
    id: String,
    points: &[GeoPoint],
    properties: BTreeMap<String, Value>,
) -> Option<Feature> {
    let mut coordinates: Vec<[f64; 2]> = Vec::with_capacity(points.len());
    for p in points.iter().filter(|p| !p.is_unresolved()) {
        let c = p.lng_lat();
        if coordinates.last() != Some(&c) {
            coordinates.push(c);
        }
    }
    let first = *coordinates.first()?;
    if coordinates.iter().all(|c| *c == first) {
        return None;
    }
    Some(Feature {
        kind: "Feature",
        id,
        geometry: Geometry::LineString { coordinates },
        properties,
    })
}

fn props<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Map features for the snapshot. Layers the mode disallows are dropped before the
/// filter's own visibility flags apply. Output order is fixed: routes, stops,
/// vehicles, drivers, each sorted by id.
pub fn project_features(
    snapshot: &FleetSnapshot,
    filter: &DashboardFilter,
    mode: OperatingMode,
    capabilities: &CapabilityController,
) -> FeatureCollection {
    let visible = |layer: Layer, shown: bool| shown && capabilities.is_layer_allowed(mode, layer);
    let deliveries = filter_deliveries(&snapshot.deliveries, filter);
    let mut features = Vec::new();

    if visible(Layer::Routes, filter.show_routes) {
        for d in &deliveries {
            let Some(route) = &d.route else { continue };
            features.extend(line_feature(
                format!("route:{}", d.batch_id),
                &route.points,
                props([
                    ("kind", Value::from("route")),
                    ("batch_id", Value::from(d.batch_id.as_str())),
                    ("source", serde_json::to_value(route.source).unwrap_or(Value::Null)),
                    ("status", Value::from(d.status.as_str())),
                ]),
            ));
        }
    }

    if visible(Layer::Deliveries, filter.show_deliveries) {
        for d in &deliveries {
            let Some(stop) = &d.next_stop else { continue };
            features.extend(point_feature(
                format!("stop:{}:{}", d.batch_id, d.completed_stops),
                stop.position,
                props([
                    ("kind", Value::from("next_stop")),
                    ("batch_id", Value::from(d.batch_id.as_str())),
                    ("facility_id", Value::from(stop.facility_id.as_str())),
                    ("name", Value::from(stop.name.as_str())),
                    ("completed_stops", Value::from(d.completed_stops)),
                    ("total_stops", Value::from(d.total_stops)),
                    ("priority", serde_json::to_value(d.priority).unwrap_or(Value::Null)),
                ]),
            ));
        }
    }

    if visible(Layer::Vehicles, filter.show_vehicles) {
        for v in filter_vehicles(&snapshot.vehicles, filter) {
            let Some(at) = v.position else { continue };
            features.extend(point_feature(
                format!("vehicle:{}", v.vehicle_id),
                at,
                props([
                    ("kind", Value::from("vehicle")),
                    ("plate_number", Value::from(v.plate_number.as_str())),
                    ("vehicle_type", serde_json::to_value(v.vehicle_type).unwrap_or(Value::Null)),
                    ("status", Value::from(v.status.as_str())),
                    (
                        "utilization_pct",
                        v.utilization.map(|u| Value::from(u.percent())).unwrap_or(Value::Null),
                    ),
                ]),
            ));
        }
    }

    if visible(Layer::Drivers, filter.show_drivers) {
        for d in filter_drivers(&snapshot.drivers, filter) {
            let Some(at) = d.position else { continue };
            features.extend(point_feature(
                format!("driver:{}", d.driver_id),
                at,
                props([
                    ("kind", Value::from("driver")),
                    ("name", Value::from(d.display_name.as_str())),
                    ("status", Value::from(d.status.as_str())),
                    ("is_online", Value::from(d.is_online)),
                ]),
            ));
        }
    }

    FeatureCollection {
        kind: "FeatureCollection",
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Freshness, PositionSource, RoutePath, RouteSource};
    use fleet_contracts::ids::{BatchId, DriverId};
    use fleet_contracts::UnixMs;

    fn driver(id: &str, name: &str, status: EntityStatus, at: GeoPoint, online: bool) -> LiveDriver {
        LiveDriver {
            driver_id: DriverId::new(id).unwrap(),
            display_name: name.to_string(),
            status,
            position: Some(at),
            position_source: PositionSource::LiveSample,
            is_online: online,
            freshness: if online {
                Freshness::Live
            } else {
                Freshness::NoSignal
            },
            last_seen_at: None,
            speed_kmh: None,
            battery_level: None,
            last_event_type: None,
            batch_id: None,
            vehicle_id: None,
        }
    }

    fn delivery(id: &str, points: Vec<GeoPoint>) -> LiveDelivery {
        LiveDelivery {
            batch_id: BatchId::new(id).unwrap(),
            name: "North loop".to_string(),
            priority: Priority::High,
            status: EntityStatus::EnRoute,
            driver_id: None,
            vehicle_id: None,
            completed_stops: 0,
            total_stops: 0,
            progress_pct: 0.0,
            next_stop: None,
            route: Some(RoutePath {
                source: RouteSource::StraightLine,
                points,
            }),
            driver_position: None,
        }
    }

    fn snapshot(drivers: Vec<LiveDriver>, deliveries: Vec<LiveDelivery>) -> FleetSnapshot {
        FleetSnapshot {
            generated_at: UnixMs(1),
            drivers,
            vehicles: vec![],
            deliveries,
        }
    }

    const BOGOTA: GeoPoint = GeoPoint { lat: 4.6, lng: -74.1 };

    #[test]
    fn at_projection_01_identical_inputs_serialize_byte_identical() {
        let a = driver("drv_a", "Ana", EntityStatus::Active, BOGOTA, true);
        let b = driver("drv_b", "Bea", EntityStatus::AtStop, GeoPoint { lat: 4.7, lng: -74.0 }, true);
        let filter = DashboardFilter::default();
        let caps = CapabilityController::default();

        let first = project_features(
            &snapshot(vec![a.clone(), b.clone()], vec![]),
            &filter,
            OperatingMode::Operational,
            &caps,
        );
        let second = project_features(
            &snapshot(vec![b, a], vec![]),
            &filter,
            OperatingMode::Operational,
            &caps,
        );
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.features[0].id, "driver:drv_a");
    }

    #[test]
    fn at_projection_02_zero_coordinate_points_are_skipped() {
        let snap = snapshot(
            vec![
                driver("drv_a", "Ana", EntityStatus::Active, GeoPoint::FALLBACK, true),
                driver("drv_b", "Bea", EntityStatus::Active, GeoPoint { lat: 0.0, lng: -74.0 }, true),
                driver("drv_c", "Cam", EntityStatus::Active, BOGOTA, true),
            ],
            vec![],
        );
        let fc = project_features(
            &snap,
            &DashboardFilter::default(),
            OperatingMode::Operational,
            &CapabilityController::default(),
        );
        let ids: Vec<&str> = fc.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["driver:drv_c"]);
        assert_eq!(
            fc.features[0].geometry,
            Geometry::Point {
                coordinates: [-74.1, 4.6]
            }
        );
        let greenwich = GeoPoint { lat: 51.48, lng: 0.0 };
        assert!(point_feature("facility:fac_g".to_string(), greenwich, BTreeMap::new()).is_none());
    }

    #[test]
    fn at_projection_03_lines_need_two_distinct_points() {
        assert!(line_feature("r".into(), &[BOGOTA], BTreeMap::new()).is_none());
        assert!(line_feature("r".into(), &[BOGOTA, BOGOTA, BOGOTA], BTreeMap::new()).is_none());
        assert!(line_feature("r".into(), &[BOGOTA, GeoPoint::FALLBACK], BTreeMap::new()).is_none());
        let line = line_feature(
            "r".into(),
            &[BOGOTA, BOGOTA, GeoPoint { lat: 4.7, lng: -74.0 }],
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(
            line.geometry,
            Geometry::LineString {
                coordinates: vec![[-74.1, 4.6], [-74.0, 4.7]]
            }
        );
    }

    #[test]
    fn at_projection_04_mode_disallowed_layers_are_dropped() {
        let snap = snapshot(
            vec![driver("drv_a", "Ana", EntityStatus::Active, BOGOTA, true)],
            vec![delivery("bat_1", vec![BOGOTA, GeoPoint { lat: 4.7, lng: -74.0 }])],
        );
        let caps = CapabilityController::default();
        let operational = project_features(&snap, &DashboardFilter::default(), OperatingMode::Operational, &caps);
        assert_eq!(operational.len(), 2);

        // overview renders no route layer
        let overview = project_features(&snap, &DashboardFilter::default(), OperatingMode::Overview, &caps);
        let ids: Vec<&str> = overview.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["driver:drv_a"]);
    }

    #[test]
    fn at_projection_05_status_search_and_online_filters_combine() {
        let drivers = vec![
            driver("drv_a", "Ana Ruiz", EntityStatus::Active, BOGOTA, true),
            driver("drv_b", "Bea Lopez", EntityStatus::Delayed, BOGOTA, true),
            driver("drv_c", "Ana Mora", EntityStatus::Active, BOGOTA, false),
        ];
        let filter = DashboardFilter {
            statuses: [EntityStatus::Active].into_iter().collect(),
            search_text: Some("  ana ".to_string()),
            online_only: true,
            ..DashboardFilter::default()
        };
        let out = filter_drivers(&drivers, &filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].driver_id.as_str(), "drv_a");

        let parsed: DashboardFilter = serde_json::from_str(r#"{"online_only":true}"#).unwrap();
        assert!(parsed.show_drivers && parsed.online_only);
    }
}
