#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use fleet_contracts::capability::{
    Action, CapabilityRules, DataAccess, Layer, OperatingMode, TimeHorizon, Tool,
    CAPABILITY_MATRIX_VERSION,
};
use fleet_contracts::{ContractViolation, ReasonCodeId, SchemaVersion, Validate};
use serde::Serialize;

pub mod reason_codes {
    use fleet_contracts::ReasonCodeId;

    pub const CAP_ACTION_FORBIDDEN: ReasonCodeId = ReasonCodeId(0x4341_0001);
    pub const CAP_ACTION_NOT_ALLOWED: ReasonCodeId = ReasonCodeId(0x4341_0002);
    pub const CAP_LAYER_FORBIDDEN: ReasonCodeId = ReasonCodeId(0x4341_0003);
    pub const CAP_LAYER_NOT_ALLOWED: ReasonCodeId = ReasonCodeId(0x4341_0004);
    pub const CAP_TOOL_FORBIDDEN: ReasonCodeId = ReasonCodeId(0x4341_0005);
    pub const CAP_TOOL_NOT_ALLOWED: ReasonCodeId = ReasonCodeId(0x4341_0006);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Listed in the mode's forbidden set; wins over any allow-list entry.
    Forbidden,
    NotAllowed,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::Forbidden => "forbidden",
            DenialReason::NotAllowed => "not_allowed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Capability {
    Action(Action),
    Layer(Layer),
    Tool(Tool),
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::Action(a) => a.as_str(),
            Capability::Layer(l) => l.as_str(),
            Capability::Tool(t) => t.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{} denied in {} mode: {}", .capability.name(), .mode.as_str(), .reason.as_str())]
pub struct CapabilityViolation {
    pub mode: OperatingMode,
    pub capability: Capability,
    pub reason: DenialReason,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatrixError {
    #[error("capability matrix is missing mode {}", .0.as_str())]
    MissingMode(OperatingMode),
    #[error("capability matrix lists mode {} twice", .0.as_str())]
    DuplicateMode(OperatingMode),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

fn evaluate<T: Ord>(forbidden: &BTreeSet<T>, allowed: &BTreeSet<T>, item: &T) -> Option<DenialReason> {
    if forbidden.contains(item) {
        Some(DenialReason::Forbidden)
    } else if allowed.contains(item) {
        None
    } else {
        Some(DenialReason::NotAllowed)
    }
}

/// Static, versioned rule table: one `CapabilityRules` per operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityMatrix {
    pub version: SchemaVersion,
    modes: BTreeMap<OperatingMode, CapabilityRules>,
}

impl CapabilityMatrix {
    /// Builds a matrix from explicit rules. Every operating mode must appear exactly once.
    pub fn from_rules(rules: Vec<CapabilityRules>) -> Result<Self, MatrixError> {
        let mut modes = BTreeMap::new();
        for r in rules {
            r.validate()?;
            let mode = r.mode;
            if modes.insert(mode, r).is_some() {
                return Err(MatrixError::DuplicateMode(mode));
            }
        }
        let matrix = Self {
            version: CAPABILITY_MATRIX_VERSION,
            modes,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn validate(&self) -> Result<(), MatrixError> {
        for mode in OperatingMode::ALL {
            let rules = self.modes.get(mode).ok_or(MatrixError::MissingMode(*mode))?;
            rules.validate()?;
        }
        Ok(())
    }

    pub fn rules(&self, mode: OperatingMode) -> Option<&CapabilityRules> {
        self.modes.get(&mode)
    }

    pub fn modes(&self) -> impl Iterator<Item = &CapabilityRules> {
        self.modes.values()
    }

    pub fn v1() -> Self {
        use Action as A;
        use Layer as L;
        use Tool as T;

        // Destructive or cross-context actions are forbidden in every mode.
        let always_forbidden = [A::EditAnyData, A::DeleteEvents, A::PublishScenarioToLive];

        let rules = vec![
            rules(
                OperatingMode::Operational,
                &[
                    L::Drivers,
                    L::Vehicles,
                    L::Deliveries,
                    L::Routes,
                    L::Facilities,
                    L::Zones,
                    L::Alerts,
                ],
                &[L::Scenarios],
                &[T::Select, T::Measure, T::Filter, T::Search],
                &[T::DrawZone, T::ScenarioBuilder],
                &[
                    A::ViewLiveState,
                    A::DispatchDriver,
                    A::ReassignWithConfirmation,
                    A::AcknowledgeAlert,
                    A::ContactDriver,
                    A::ReportException,
                    A::RecordFieldEvent,
                    A::ViewDashboard,
                ],
                &[&always_forbidden[..], &[A::AutoReassignLoads, A::EditZone, A::ResetSandbox]].concat(),
                DataAccess::WriteExceptions,
                TimeHorizon::Live,
            ),
            rules(
                OperatingMode::Planning,
                &[
                    L::Vehicles,
                    L::Deliveries,
                    L::Routes,
                    L::Facilities,
                    L::Zones,
                ],
                &[L::EventTrail, L::Scenarios],
                &[
                    T::Select,
                    T::Measure,
                    T::Filter,
                    T::Search,
                    T::DrawRoute,
                    T::DrawZone,
                ],
                &[T::TimelineScrub, T::ScenarioBuilder],
                &[
                    A::CreateSchedule,
                    A::EditSchedule,
                    A::CreateBatch,
                    A::AssignVehicle,
                    A::EditZone,
                    A::EditRoute,
                    A::ViewDashboard,
                ],
                &[
                    &always_forbidden[..],
                    &[A::DispatchDriver, A::ContactDriver, A::AutoReassignLoads],
                ]
                .concat(),
                DataAccess::WriteConfig,
                TimeHorizon::Future,
            ),
            rules(
                OperatingMode::Forensics,
                &[
                    L::Drivers,
                    L::Vehicles,
                    L::Deliveries,
                    L::Routes,
                    L::Facilities,
                    L::Zones,
                    L::Alerts,
                    L::EventTrail,
                    L::Heatmap,
                ],
                &[L::Scenarios],
                &[
                    T::Select,
                    T::Measure,
                    T::Filter,
                    T::Search,
                    T::TimelineScrub,
                    T::Export,
                ],
                &[T::DrawRoute, T::DrawZone, T::ScenarioBuilder],
                &[
                    A::ViewHistory,
                    A::ReplayTimeline,
                    A::AnnotateIncident,
                    A::ExportReport,
                ],
                &[
                    &always_forbidden[..],
                    &[
                        A::DispatchDriver,
                        A::ReassignWithConfirmation,
                        A::AutoReassignLoads,
                        A::ContactDriver,
                    ],
                ]
                .concat(),
                DataAccess::Readonly,
                TimeHorizon::Past,
            ),
            rules(
                OperatingMode::Overview,
                &[L::Drivers, L::Vehicles, L::Deliveries, L::Alerts, L::Heatmap],
                &[L::EventTrail, L::Scenarios],
                &[T::Select, T::Filter, T::Search, T::Export],
                &[T::DrawRoute, T::DrawZone, T::ScenarioBuilder],
                &[A::ViewDashboard, A::ViewLiveState, A::ExportReport],
                &[
                    &always_forbidden[..],
                    &[
                        A::DispatchDriver,
                        A::ReassignWithConfirmation,
                        A::AutoReassignLoads,
                    ],
                ]
                .concat(),
                DataAccess::Readonly,
                TimeHorizon::Today,
            ),
            rules(
                OperatingMode::Simulation,
                &[
                    L::Drivers,
                    L::Vehicles,
                    L::Deliveries,
                    L::Routes,
                    L::Facilities,
                    L::Zones,
                    L::Scenarios,
                ],
                &[L::EventTrail],
                &[
                    T::Select,
                    T::Measure,
                    T::Filter,
                    T::Search,
                    T::DrawRoute,
                    T::DrawZone,
                    T::ScenarioBuilder,
                ],
                &[T::TimelineScrub],
                &[
                    A::RunScenario,
                    A::EditScenario,
                    A::ResetSandbox,
                    A::ViewDashboard,
                ],
                &[&always_forbidden[..], &[A::DispatchDriver, A::ContactDriver]].concat(),
                DataAccess::WriteSandbox,
                TimeHorizon::Hypothetical,
            ),
        ];
        Self {
            version: CAPABILITY_MATRIX_VERSION,
            modes: rules.into_iter().map(|r| (r.mode, r)).collect(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn rules(
    mode: OperatingMode,
    allowed_layers: &[Layer],
    forbidden_layers: &[Layer],
    allowed_tools: &[Tool],
    forbidden_tools: &[Tool],
    allowed_actions: &[Action],
    forbidden_actions: &[Action],
    data_access: DataAccess,
    time_horizon: TimeHorizon,
) -> CapabilityRules {
    CapabilityRules {
        mode,
        allowed_layers: allowed_layers.iter().copied().collect(),
        forbidden_layers: forbidden_layers.iter().copied().collect(),
        allowed_tools: allowed_tools.iter().copied().collect(),
        forbidden_tools: forbidden_tools.iter().copied().collect(),
        allowed_actions: allowed_actions.iter().copied().collect(),
        forbidden_actions: forbidden_actions.iter().copied().collect(),
        data_access,
        time_horizon,
    }
}

/// Answers "may this mode do X". Forbidden sets are consulted before allow-lists.
#[derive(Debug, Clone)]
pub struct CapabilityController {
    matrix: CapabilityMatrix,
}

impl Default for CapabilityController {
    fn default() -> Self {
        Self::new(CapabilityMatrix::v1())
    }
}

impl CapabilityController {
    pub fn new(matrix: CapabilityMatrix) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &CapabilityMatrix {
        &self.matrix
    }

    pub fn check_action(&self, mode: OperatingMode, action: Action) -> Option<DenialReason> {
        match self.matrix.rules(mode) {
            Some(r) => evaluate(&r.forbidden_actions, &r.allowed_actions, &action),
            None => Some(DenialReason::NotAllowed),
        }
    }

    pub fn check_layer(&self, mode: OperatingMode, layer: Layer) -> Option<DenialReason> {
        match self.matrix.rules(mode) {
            Some(r) => evaluate(&r.forbidden_layers, &r.allowed_layers, &layer),
            None => Some(DenialReason::NotAllowed),
        }
    }

    pub fn check_tool(&self, mode: OperatingMode, tool: Tool) -> Option<DenialReason> {
        match self.matrix.rules(mode) {
            Some(r) => evaluate(&r.forbidden_tools, &r.allowed_tools, &tool),
            None => Some(DenialReason::NotAllowed),
        }
    }

    pub fn is_action_allowed(&self, mode: OperatingMode, action: Action) -> bool {
        self.check_action(mode, action).is_none()
    }

    pub fn is_layer_allowed(&self, mode: OperatingMode, layer: Layer) -> bool {
        self.check_layer(mode, layer).is_none()
    }

    pub fn is_tool_allowed(&self, mode: OperatingMode, tool: Tool) -> bool {
        self.check_tool(mode, tool).is_none()
    }

    pub fn require_action(
        &self,
        mode: OperatingMode,
        action: Action,
    ) -> Result<(), CapabilityViolation> {
        match self.check_action(mode, action) {
            None => Ok(()),
            Some(reason) => Err(violation(
                mode,
                Capability::Action(action),
                reason,
                match reason {
                    DenialReason::Forbidden => reason_codes::CAP_ACTION_FORBIDDEN,
                    DenialReason::NotAllowed => reason_codes::CAP_ACTION_NOT_ALLOWED,
                },
            )),
        }
    }

    pub fn require_layer(&self, mode: OperatingMode, layer: Layer) -> Result<(), CapabilityViolation> {
        match self.check_layer(mode, layer) {
            None => Ok(()),
            Some(reason) => Err(violation(
                mode,
                Capability::Layer(layer),
                reason,
                match reason {
                    DenialReason::Forbidden => reason_codes::CAP_LAYER_FORBIDDEN,
                    DenialReason::NotAllowed => reason_codes::CAP_LAYER_NOT_ALLOWED,
                },
            )),
        }
    }

    pub fn require_tool(&self, mode: OperatingMode, tool: Tool) -> Result<(), CapabilityViolation> {
        match self.check_tool(mode, tool) {
            None => Ok(()),
            Some(reason) => Err(violation(
                mode,
                Capability::Tool(tool),
                reason,
                match reason {
                    DenialReason::Forbidden => reason_codes::CAP_TOOL_FORBIDDEN,
                    DenialReason::NotAllowed => reason_codes::CAP_TOOL_NOT_ALLOWED,
                },
            )),
        }
    }

    /// Layers the mode may render, in stable order.
    pub fn visible_layers(&self, mode: OperatingMode) -> Vec<Layer> {
        Layer::ALL
            .iter()
            .copied()
            .filter(|l| self.is_layer_allowed(mode, *l))
            .collect()
    }
}

fn violation(
    mode: OperatingMode,
    capability: Capability,
    reason: DenialReason,
    reason_code: ReasonCodeId,
) -> CapabilityViolation {
    tracing::info!(
        mode = mode.as_str(),
        capability = capability.name(),
        reason = reason.as_str(),
        "capability denied"
    );
    CapabilityViolation {
        mode,
        capability,
        reason,
        reason_code,
    }
}
