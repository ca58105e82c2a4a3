#![forbid(unsafe_code)]

pub mod capability;
pub mod common;
pub mod event;
pub mod geo;
pub mod ids;
pub mod position;
pub mod registry;
pub mod status;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, UnixMs, Validate};
