#![forbid(unsafe_code)]

use std::fmt;

use crate::common::validate_id;
use crate::{ContractViolation, Validate};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
                let v = Self(id.into());
                v.validate()?;
                Ok(v)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                validate_id($field, &self.0, $max)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ContractViolation;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(DriverId, "driver_id", 64);
string_id!(SessionId, "session_id", 64);
string_id!(DeviceId, "device_id", 64);
string_id!(VehicleId, "vehicle_id", 64);
string_id!(BatchId, "batch_id", 64);
string_id!(TripId, "trip_id", 64);
string_id!(DispatchId, "dispatch_id", 64);
string_id!(FacilityId, "facility_id", 64);
string_id!(
    /// Server-issued event id. Only the ingestion boundary mints these.
    EventId,
    "event_id",
    64
);
string_id!(
    /// Placeholder id handed out for an event parked in the offline queue.
    LocalEventId,
    "local_event_id",
    64
);

pub const LOCAL_EVENT_ID_PREFIX: &str = "local_";
pub const SERVER_EVENT_ID_PREFIX: &str = "evt_";

/// Id returned to the caller of `record_event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RecordedEventId {
    Server(EventId),
    Local(LocalEventId),
}

impl RecordedEventId {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) => id.as_str(),
            Self::Local(id) => id.as_str(),
        }
    }
}
