#![forbid(unsafe_code)]

pub mod aggregator;
pub mod capability;
pub mod projection;
pub mod reconciler;
