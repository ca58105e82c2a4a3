#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_range, validate_text};
use crate::geo::GeoPoint;
use crate::ids::{BatchId, DriverId, FacilityId, VehicleId};
use crate::{ContractViolation, UnixMs, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Motorcycle,
    Van,
    Truck,
    Refrigerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: DriverId,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Static coordinate used when no live sample exists.
    #[serde(default)]
    pub last_known_position: Option<GeoPoint>,
}

impl Validate for DriverRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.driver_id.validate()?;
        validate_text("driver_record.display_name", &self.display_name, 128)?;
        if let Some(p) = &self.last_known_position {
            p.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub vehicle_id: VehicleId,
    pub plate_number: String,
    pub vehicle_type: VehicleType,
    pub capacity_kg: Option<f64>,
    #[serde(default)]
    pub assigned_driver_id: Option<DriverId>,
}

impl Validate for VehicleRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.vehicle_id.validate()?;
        validate_text("vehicle_record.plate_number", &self.plate_number, 32)?;
        if let Some(c) = self.capacity_kg {
            validate_range("vehicle_record.capacity_kg", c, 0.0, 100_000.0)?;
        }
        if let Some(d) = &self.assigned_driver_id {
            d.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub facility_id: FacilityId,
    pub name: String,
    pub position: GeoPoint,
}

/// A planned delivery run: an ordered stop list bound to a driver and vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub name: String,
    #[serde(default)]
    pub driver_id: Option<DriverId>,
    #[serde(default)]
    pub vehicle_id: Option<VehicleId>,
    pub priority: Priority,
    pub stops: Vec<Stop>,
    /// Index of the stop the driver is working towards; equals the number of finished stops.
    pub current_stop_index: u32,
    #[serde(default)]
    pub depot: Option<GeoPoint>,
    /// Road-network geometry from the routing service, when one was computed.
    #[serde(default)]
    pub route_geometry: Option<Vec<GeoPoint>>,
    /// Load utilization measured at dispatch, in percent.
    #[serde(default)]
    pub measured_utilization_pct: Option<f64>,
    /// Set once the batch is closed out in the registry.
    #[serde(default)]
    pub completed: bool,
}

impl Validate for BatchRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.batch_id.validate()?;
        validate_text("batch_record.name", &self.name, 128)?;
        for stop in &self.stops {
            stop.facility_id.validate()?;
            stop.position.validate()?;
        }
        if self.current_stop_index as usize > self.stops.len() {
            return Err(ContractViolation::InvalidValue {
                field: "batch_record.current_stop_index",
                reason: "must be <= stops.len()",
            });
        }
        if let Some(u) = self.measured_utilization_pct {
            validate_range("batch_record.measured_utilization_pct", u, 0.0, 100.0)?;
        }
        Ok(())
    }
}

/// One registry refresh, as fetched from the registry boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub drivers: Vec<DriverRecord>,
    pub vehicles: Vec<VehicleRecord>,
    pub batches: Vec<BatchRecord>,
    pub fetched_at: UnixMs,
}

impl RegistrySnapshot {
    /// The open batch for a driver. Completed batches are skipped.
    pub fn active_batch_for_driver(&self, driver_id: &DriverId) -> Option<&BatchRecord> {
        self.batches
            .iter()
            .find(|b| !b.completed && b.driver_id.as_ref() == Some(driver_id))
    }

    pub fn active_batch_for_vehicle(&self, vehicle_id: &VehicleId) -> Option<&BatchRecord> {
        self.batches
            .iter()
            .find(|b| !b.completed && b.vehicle_id.as_ref() == Some(vehicle_id))
    }

    pub fn vehicle_for_driver(&self, driver_id: &DriverId) -> Option<&VehicleRecord> {
        self.vehicles
            .iter()
            .find(|v| v.assigned_driver_id.as_ref() == Some(driver_id))
    }
}

impl Validate for RegistrySnapshot {
    fn validate(&self) -> Result<(), ContractViolation> {
        for d in &self.drivers {
            d.validate()?;
        }
        for v in &self.vehicles {
            v.validate()?;
        }
        for b in &self.batches {
            b.validate()?;
        }
        Ok(())
    }
}
