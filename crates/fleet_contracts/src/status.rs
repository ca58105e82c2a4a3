#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Inactive,
    Active,
    EnRoute,
    AtStop,
    Delayed,
    Completed,
    Suspended,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 7] = [
        EntityStatus::Inactive,
        EntityStatus::Active,
        EntityStatus::EnRoute,
        EntityStatus::AtStop,
        EntityStatus::Delayed,
        EntityStatus::Completed,
        EntityStatus::Suspended,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Inactive => "INACTIVE",
            EntityStatus::Active => "ACTIVE",
            EntityStatus::EnRoute => "EN_ROUTE",
            EntityStatus::AtStop => "AT_STOP",
            EntityStatus::Delayed => "DELAYED",
            EntityStatus::Completed => "COMPLETED",
            EntityStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Entity kinds the reconciler keeps a latest-status map for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Driver,
    Batch,
}
