#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_range;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Recorded when device geolocation does not resolve in time.
    pub const FALLBACK: GeoPoint = GeoPoint { lat: 0.0, lng: 0.0 };

    pub fn v1(lat: f64, lng: f64) -> Result<Self, ContractViolation> {
        let p = Self { lat, lng };
        p.validate()?;
        Ok(p)
    }

    /// True when either coordinate is zero, which is how unresolved positions surface.
    pub fn is_unresolved(&self) -> bool {
        self.lat == 0.0 || self.lng == 0.0
    }

    /// GeoJSON coordinate order.
    pub fn lng_lat(&self) -> [f64; 2] {
        [self.lng, self.lat]
    }
}

impl Validate for GeoPoint {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_range("geo_point.lat", self.lat, -90.0, 90.0)?;
        validate_range("geo_point.lng", self.lng, -180.0, 180.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_point_is_unresolved() {
        assert!(GeoPoint::FALLBACK.is_unresolved());
        assert!(GeoPoint { lat: 0.0, lng: 3.2 }.is_unresolved());
        assert!(!GeoPoint::v1(-1.29, 36.82).unwrap().is_unresolved());
    }

    #[test]
    fn out_of_range_and_nan_rejected() {
        assert!(GeoPoint::v1(91.0, 0.0).is_err());
        assert!(GeoPoint::v1(0.0, -180.5).is_err());
        assert!(matches!(
            GeoPoint::v1(f64::NAN, 1.0),
            Err(ContractViolation::NotFinite { .. })
        ));
    }
}
