#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_range;
use crate::geo::GeoPoint;
use crate::ids::{DriverId, SessionId};
use crate::{ContractViolation, UnixMs, Validate};

/// Raw GPS telemetry. Never persisted; only the newest sample per driver is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub driver_id: DriverId,
    pub session_id: Option<SessionId>,
    pub position: GeoPoint,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub battery_level: Option<f64>,
    pub captured_at: UnixMs,
}

impl PositionSample {
    /// Age relative to `now`; zero when the device clock runs ahead.
    pub fn age_ms(&self, now: UnixMs) -> u64 {
        now.saturating_sub(self.captured_at)
    }
}

impl Validate for PositionSample {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.driver_id.validate()?;
        if let Some(s) = &self.session_id {
            s.validate()?;
        }
        self.position.validate()?;
        if let Some(v) = self.speed_kmh {
            validate_range("position_sample.speed_kmh", v, 0.0, 400.0)?;
        }
        if let Some(v) = self.heading_deg {
            validate_range("position_sample.heading_deg", v, 0.0, 360.0)?;
        }
        if let Some(v) = self.accuracy_m {
            validate_range("position_sample.accuracy_m", v, 0.0, 100_000.0)?;
        }
        if let Some(v) = self.battery_level {
            validate_range("position_sample.battery_level", v, 0.0, 1.0)?;
        }
        Ok(())
    }
}
