use crate::compensator::{CompensationMode, ThermalWindow};
use crate::network::{CableId, NodeId};
use crate::opt::Scenario;
use crate::phasor::PerPhase;
use crate::regulator::{RegState, RegulatorVariant};
use crate::traits::CurrentInjection;
use num_complex::Complex64;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ConvergenceStatus {
    Converged,
    NotConverged,
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceStatus::Converged => f.write_str("converged"),
            ConvergenceStatus::NotConverged => f.write_str("not_converged"),
        }
    }
}

/// What became of a configured device in one calculation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DeviceStatus {
    Active,
    /// Nothing to correct at the node.
    NotRequired,
    /// Invalid or unusable configuration.
    Skipped(String),
    /// Disabled in favour of another device.
    Suppressed(String),
}

impl DeviceStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DeviceStatus::Active)
    }
}

/// Non-fatal findings of a calculation.
#[derive(Debug, PartialEq, Clone)]
pub enum Diagnostic {
    MissingNode { device: String, node: NodeId },
    UnreachableNode { node: NodeId },
    InvalidConfig { device: String, reason: String },
    Conflict { node: NodeId, kept: String, suppressed: String },
    UnknownCable { cable: CableId },
    UnknownCableType { cable: CableId, cable_type: String },
    SolverNotConverged { iterations: usize },
    RegulatorNotSettled { device: String, iterations: usize },
    PowerLimited { device: String },
    CompensatorNotConverged { device: String, residual: f64 },
    ThermallyLimited { device: String, current: f64 },
    CouplingNotConverged { iterations: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingNode { device, node } => {
                write!(f, "{}: node \"{}\" does not exist, device skipped", device, node)
            }
            Diagnostic::UnreachableNode { node } => {
                write!(f, "node \"{}\" is not connected to the source", node)
            }
            Diagnostic::InvalidConfig { device, reason } => {
                write!(f, "{}: invalid configuration ({}), device skipped", device, reason)
            }
            Diagnostic::Conflict {
                node,
                kept,
                suppressed,
            } => write!(
                f,
                "node \"{}\": {} suppressed, {} takes priority",
                node, suppressed, kept
            ),
            Diagnostic::UnknownCable { cable } => {
                write!(f, "replacement for unknown cable \"{}\" ignored", cable)
            }
            Diagnostic::UnknownCableType { cable, cable_type } => write!(
                f,
                "cable \"{}\": unknown replacement type \"{}\" ignored",
                cable, cable_type
            ),
            Diagnostic::SolverNotConverged { iterations } => {
                write!(f, "power flow did not converge in {} iterations", iterations)
            }
            Diagnostic::RegulatorNotSettled { device, iterations } => write!(
                f,
                "{}: switch states still changing after {} evaluations",
                device, iterations
            ),
            Diagnostic::PowerLimited { device } => {
                write!(f, "{}: correction reduced by the power limit", device)
            }
            Diagnostic::CompensatorNotConverged { device, residual } => write!(
                f,
                "{}: calibration stopped {:.2} V away from the target spread",
                device, residual
            ),
            Diagnostic::ThermallyLimited { device, current } => {
                write!(f, "{}: injection held at the {:.1} A thermal ceiling", device, current)
            }
            Diagnostic::CouplingNotConverged { iterations } => write!(
                f,
                "device coupling did not settle in {} iterations",
                iterations
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    /// Phase-to-neutral voltage magnitudes (V).
    pub voltage: PerPhase<f64>,
    pub phasor: PerPhase<Complex64>,

    /// Neutral potential against the source earth (V).
    pub neutral_voltage: f64,

    /// Largest phase deviation from the mean voltage (%).
    pub imbalance_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CableResult {
    /// Phase current magnitudes (A).
    pub current: PerPhase<f64>,
    pub neutral_current: f64,
    pub drop: PerPhase<f64>,

    /// Highest phase current over the cable type rating (%).
    pub loading_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegulatorResult {
    pub id: String,
    pub node: NodeId,
    pub variant: RegulatorVariant,
    pub status: DeviceStatus,
    pub input_voltage: PerPhase<f64>,
    pub state: PerPhase<RegState>,

    /// Applied correction (%).
    pub coefficient: PerPhase<f64>,
    pub output_voltage: PerPhase<f64>,
    pub transitions: usize,

    /// Switching time implied by the transitions and the time delay (s).
    pub settle_time_s: f64,
    pub power_limited: bool,
    pub converged: bool,
}

impl RegulatorResult {
    pub(crate) fn inactive(
        id: &str,
        node: &str,
        variant: RegulatorVariant,
        status: DeviceStatus,
    ) -> Self {
        Self {
            id: id.to_string(),
            node: node.to_string(),
            variant,
            status,
            input_voltage: PerPhase::zero(),
            state: PerPhase::splat(RegState::Byp),
            coefficient: PerPhase::zero(),
            output_voltage: PerPhase::zero(),
            transitions: 0,
            settle_time_s: 0.0,
            power_limited: false,
            converged: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompensatorResult {
    pub id: String,
    pub node: NodeId,
    pub status: DeviceStatus,
    pub mode: CompensationMode,
    pub window: ThermalWindow,

    /// Current limit applied to the injection (A).
    pub ceiling: f64,

    /// Voltages at the node without this compensator (V).
    pub initial_voltage: PerPhase<f64>,
    pub natural_spread: f64,
    pub target_voltage: PerPhase<f64>,
    pub target_spread: f64,

    /// Neutral current taken over by the device (A).
    pub injected_current: f64,
    pub injection: CurrentInjection,

    pub achieved_voltage: PerPhase<f64>,
    pub achieved_spread: f64,

    /// Share of the natural spread removed (%).
    pub efficiency_percent: f64,

    pub iterations: usize,

    /// Achieved minus target spread at the last iterate (V).
    pub residual: f64,
    pub converged: bool,
    pub thermally_limited: bool,
}

/// Outcome of one top-level calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationResult {
    pub scenario: Scenario,
    pub nodes: BTreeMap<NodeId, NodeResult>,
    pub cables: BTreeMap<CableId, CableResult>,
    pub status: ConvergenceStatus,

    /// Outer evaluations: base solves without devices, automaton rounds or
    /// coupling rounds depending on the active devices.
    pub iterations: usize,
    pub regulators: Vec<RegulatorResult>,
    pub compensators: Vec<CompensatorResult>,
    pub diagnostics: Vec<Diagnostic>,

    /// Calibrated compensator injections, usable as a warm start.
    pub injections: BTreeMap<NodeId, CurrentInjection>,
}

impl CalculationResult {
    pub fn voltage(&self, node: &str) -> Option<PerPhase<f64>> {
        self.nodes.get(node).map(|n| n.voltage)
    }

    pub fn is_converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }

    pub fn regulator(&self, id: &str) -> Option<&RegulatorResult> {
        self.regulators.iter().find(|r| r.id == id)
    }

    pub fn compensator(&self, id: &str) -> Option<&CompensatorResult> {
        self.compensators.iter().find(|c| c.id == id)
    }
}
