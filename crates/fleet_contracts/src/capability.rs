#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const CAPABILITY_MATRIX_VERSION: SchemaVersion = SchemaVersion(1);

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                let s = s.trim();
                Self::ALL.iter().copied().find(|v| v.as_str() == s)
            }
        }
    };
}

vocabulary!(
    /// Operating context that gates what a user may do against fleet state.
    OperatingMode {
        Operational => "operational",
        Planning => "planning",
        Forensics => "forensics",
        Overview => "overview",
        Simulation => "simulation",
    }
);

vocabulary!(Action {
    ViewLiveState => "view_live_state",
    DispatchDriver => "dispatch_driver",
    ReassignWithConfirmation => "reassign_with_confirmation",
    AutoReassignLoads => "auto_reassign_loads",
    AcknowledgeAlert => "acknowledge_alert",
    ContactDriver => "contact_driver",
    ReportException => "report_exception",
    RecordFieldEvent => "record_field_event",
    CreateSchedule => "create_schedule",
    EditSchedule => "edit_schedule",
    CreateBatch => "create_batch",
    AssignVehicle => "assign_vehicle",
    EditZone => "edit_zone",
    EditRoute => "edit_route",
    ViewHistory => "view_history",
    ReplayTimeline => "replay_timeline",
    AnnotateIncident => "annotate_incident",
    ExportReport => "export_report",
    ViewDashboard => "view_dashboard",
    RunScenario => "run_scenario",
    EditScenario => "edit_scenario",
    ResetSandbox => "reset_sandbox",
    PublishScenarioToLive => "publish_scenario_to_live",
    EditAnyData => "edit_any_data",
    DeleteEvents => "delete_events",
});

vocabulary!(Layer {
    Drivers => "drivers",
    Vehicles => "vehicles",
    Deliveries => "deliveries",
    Routes => "routes",
    Facilities => "facilities",
    Zones => "zones",
    Alerts => "alerts",
    EventTrail => "event_trail",
    Heatmap => "heatmap",
    Scenarios => "scenarios",
});

vocabulary!(Tool {
    Select => "select",
    Measure => "measure",
    Filter => "filter",
    Search => "search",
    DrawRoute => "draw_route",
    DrawZone => "draw_zone",
    TimelineScrub => "timeline_scrub",
    ScenarioBuilder => "scenario_builder",
    Export => "export",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAccess {
    Readonly,
    WriteExceptions,
    WriteConfig,
    WriteSandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Live,
    Today,
    Future,
    Past,
    Hypothetical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRules {
    pub mode: OperatingMode,
    pub allowed_layers: BTreeSet<Layer>,
    pub forbidden_layers: BTreeSet<Layer>,
    pub allowed_tools: BTreeSet<Tool>,
    pub forbidden_tools: BTreeSet<Tool>,
    pub allowed_actions: BTreeSet<Action>,
    pub forbidden_actions: BTreeSet<Action>,
    pub data_access: DataAccess,
    pub time_horizon: TimeHorizon,
}

impl Validate for CapabilityRules {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.allowed_layers.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "capability_rules.allowed_layers",
                reason: "must not be empty",
            });
        }
        if self.allowed_actions.is_empty() && self.data_access != DataAccess::Readonly {
            return Err(ContractViolation::InvalidValue {
                field: "capability_rules.allowed_actions",
                reason: "writable modes must allow at least one action",
            });
        }
        Ok(())
    }
}
