use crate::phasor::PerPhase;
use derive_builder::Builder;

/// Named calculation scenario: which of loads and productions are active.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, clap::ValueEnum)]
pub enum Scenario {
    /// Loads only.
    #[default]
    Consumption,
    /// Productions only.
    Production,
    /// Loads and productions together.
    Mixed,
}

impl Scenario {
    pub fn has_loads(self) -> bool {
        matches!(self, Scenario::Consumption | Scenario::Mixed)
    }

    pub fn has_productions(self) -> bool {
        matches!(self, Scenario::Production | Scenario::Mixed)
    }
}

/// How node power is spread over the phases.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, clap::ValueEnum)]
pub enum LoadModel {
    /// Every load and production is split equally over the three phases.
    Balanced,
    /// Single-phase clients sit on their phase, polyphase clients follow the
    /// balancing vector and aggregated node power follows the node split.
    #[default]
    Unbalanced,
}

#[derive(Debug, Clone, Copy, Builder)]
#[builder(default)]
pub struct SolverOptions {
    /// Termination tolerance on the largest voltage update (V).
    /// Default value is 1e-4.
    pub tolerance: f64,

    /// Maximum number of sweep iterations. Default value is 100.
    pub max_iterations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Builder)]
#[builder(default)]
pub struct CalibrationOptions {
    /// Accepted residual between achieved and target voltage spread (V).
    /// Default value is 0.1.
    pub tolerance: f64,

    /// Maximum number of calibration steps. Default value is 20.
    pub max_iterations: usize,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            max_iterations: 20,
        }
    }
}

/// Options of one top-level calculation.
#[derive(Debug, Clone, Builder)]
#[builder(default)]
pub struct CalcOptions {
    pub scenario: Scenario,

    /// Demand/coincidence factor applied to contractual loads.
    pub load_factor: f64,

    /// Factor applied to contractual productions.
    pub production_factor: f64,

    pub load_model: LoadModel,

    /// Network-wide phase distribution of polyphase clients, in percent.
    pub balancing: PerPhase<f64>,

    /// Power factor of loads (lagging).
    pub load_power_factor: f64,

    /// Power factor of productions.
    pub production_power_factor: f64,

    pub solver: SolverOptions,

    pub calibration: CalibrationOptions,

    /// Bound on regulator-only evaluations.
    pub max_regulator_iterations: usize,

    /// Bound on the compensator/regulator coupling loop.
    pub max_coupling_iterations: usize,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self {
            scenario: Scenario::default(),
            load_factor: 1.0,
            production_factor: 1.0,
            load_model: LoadModel::default(),
            balancing: PerPhase::splat(100.0 / 3.0),
            load_power_factor: 0.95,
            production_power_factor: 1.0,
            solver: SolverOptions::default(),
            calibration: CalibrationOptions::default(),
            max_regulator_iterations: 10,
            max_coupling_iterations: 10,
        }
    }
}
