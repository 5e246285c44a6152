use crate::debug::format_per_phase;
use crate::network::NodeId;
use crate::phasor::{Phase, PerPhase};
use crate::result::{DeviceStatus, RegulatorResult};
use crate::traits::NodeFlow;
use derive_builder::Builder;
use std::fmt;

/// Switch position of one phase of a series regulator.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Default)]
pub enum RegState {
    /// Strong abatement.
    Lo2,
    /// Abatement.
    Lo1,
    #[default]
    Byp,
    /// Boost.
    Bo1,
    /// Strong boost.
    Bo2,
}

impl RegState {
    /// Signed step away from bypass: negative abates, positive boosts.
    pub fn level(self) -> i8 {
        match self {
            RegState::Lo2 => -2,
            RegState::Lo1 => -1,
            RegState::Byp => 0,
            RegState::Bo1 => 1,
            RegState::Bo2 => 2,
        }
    }

    /// One step closer to bypass.
    pub fn toward_bypass(self) -> Self {
        match self {
            RegState::Lo2 => RegState::Lo1,
            RegState::Bo2 => RegState::Bo1,
            _ => RegState::Byp,
        }
    }
}

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegState::Lo2 => "LO2",
            RegState::Lo1 => "LO1",
            RegState::Byp => "BYP",
            RegState::Bo1 => "BO1",
            RegState::Bo2 => "BO2",
        };
        f.write_str(s)
    }
}

/// Product variant of the regulator.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, clap::ValueEnum)]
pub enum RegulatorVariant {
    /// 400 V three-phase unit, phases switch independently.
    #[default]
    Srg2_400,
    /// 230 V unit. Boost and abatement never run on different phases at once.
    Srg2_230,
}

/// Switching thresholds on the input voltage (V), `lo2 > lo1 > bo1 > bo2`.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Thresholds {
    pub lo2: f64,
    pub lo1: f64,
    pub bo1: f64,
    pub bo2: f64,
}

/// Signed correction of each non-bypass state (%).
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Coefficients {
    pub lo2: f64,
    pub lo1: f64,
    pub bo1: f64,
    pub bo2: f64,
}

impl Coefficients {
    pub fn of(&self, state: RegState) -> f64 {
        match state {
            RegState::Lo2 => self.lo2,
            RegState::Lo1 => self.lo1,
            RegState::Byp => 0.0,
            RegState::Bo1 => self.bo1,
            RegState::Bo2 => self.bo2,
        }
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct RegulatorConfig {
    #[builder(setter(into))]
    pub id: String,

    /// Node the regulator is installed at. The regulator measures the
    /// voltage arriving at this node and corrects everything downstream.
    #[builder(setter(into))]
    pub node: NodeId,

    pub variant: RegulatorVariant,

    /// Phase-to-neutral voltage the thresholds are centred on (V).
    pub target_voltage: f64,

    pub thresholds: Thresholds,

    pub coefficients: Coefficients,

    /// Dead band added on both sides of the held state (V).
    pub hysteresis: f64,

    /// Delay before a switching decision is applied (s).
    pub time_delay_s: f64,

    /// Maximum boost power over the three phases (kVA).
    pub max_boost_kva: f64,

    /// Maximum abatement power over the three phases (kVA).
    pub max_buck_kva: f64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            node: NodeId::new(),
            variant: RegulatorVariant::Srg2_400,
            target_voltage: 230.0,
            thresholds: Thresholds {
                lo2: 246.0,
                lo1: 238.0,
                bo1: 222.0,
                bo2: 214.0,
            },
            coefficients: Coefficients {
                lo2: -7.0,
                lo1: -3.5,
                bo1: 3.5,
                bo2: 7.0,
            },
            hysteresis: 2.0,
            time_delay_s: 30.0,
            max_boost_kva: 85.0,
            max_buck_kva: 85.0,
        }
    }
}

impl RegulatorConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let default = RegulatorConfig::default();
        check(
            self.thresholds.as_ref().unwrap_or(&default.thresholds),
            self.coefficients.as_ref().unwrap_or(&default.coefficients),
            self.hysteresis.unwrap_or(default.hysteresis),
            self.target_voltage.unwrap_or(default.target_voltage),
        )
    }
}

fn check(t: &Thresholds, c: &Coefficients, hysteresis: f64, target: f64) -> Result<(), String> {
    let ordered = t.lo2 > t.lo1 && t.lo1 > t.bo1 && t.bo1 > t.bo2;
    if !ordered || ![t.lo2, t.lo1, t.bo1, t.bo2].iter().all(|v| v.is_finite()) {
        return Err(format!(
            "thresholds must satisfy LO2 > LO1 > BO1 > BO2 (got {} / {} / {} / {})",
            t.lo2, t.lo1, t.bo1, t.bo2
        ));
    }
    if !(hysteresis >= 0.0) || !hysteresis.is_finite() {
        return Err(format!("hysteresis must be non-negative (got {})", hysteresis));
    }
    if !(target > 0.0) || !target.is_finite() {
        return Err(format!("target voltage must be positive (got {})", target));
    }
    // a ratio 1 + c/100 must stay positive
    let coefficients = [c.lo2, c.lo1, c.bo1, c.bo2];
    if coefficients.iter().any(|v| !v.is_finite() || *v <= -100.0) {
        return Err(format!(
            "coefficients must be above -100 % (got {} / {} / {} / {})",
            c.lo2, c.lo1, c.bo1, c.bo2
        ));
    }
    Ok(())
}

impl RegulatorConfig {
    /// Three-phase 400 V unit.
    pub fn srg2_400(id: &str, node: &str) -> RegulatorConfigBuilder {
        RegulatorConfigBuilder {
            id: Some(id.to_string()),
            node: Some(node.to_string()),
            variant: Some(RegulatorVariant::Srg2_400),
            ..Default::default()
        }
    }

    /// Single-direction 230 V unit.
    pub fn srg2_230(id: &str, node: &str) -> RegulatorConfigBuilder {
        RegulatorConfigBuilder {
            id: Some(id.to_string()),
            node: Some(node.to_string()),
            variant: Some(RegulatorVariant::Srg2_230),
            coefficients: Some(Coefficients {
                lo2: -6.0,
                lo1: -3.0,
                bo1: 3.0,
                bo2: 6.0,
            }),
            max_boost_kva: Some(30.0),
            max_buck_kva: Some(30.0),
            ..Default::default()
        }
    }

    /// Rejects configurations built without the builder that it would
    /// have refused.
    pub fn validate(&self) -> Result<(), String> {
        check(
            &self.thresholds,
            &self.coefficients,
            self.hysteresis,
            self.target_voltage,
        )?;
        let limits = [self.max_boost_kva, self.max_buck_kva, self.time_delay_s];
        if limits.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err("power limits and time delay must be non-negative".to_string());
        }
        Ok(())
    }

    /// State selected by the thresholds alone.
    pub fn raw_state(&self, v: f64) -> RegState {
        let t = &self.thresholds;
        if v > t.lo2 {
            RegState::Lo2
        } else if v > t.lo1 {
            RegState::Lo1
        } else if v < t.bo2 {
            RegState::Bo2
        } else if v < t.bo1 {
            RegState::Bo1
        } else {
            RegState::Byp
        }
    }

    /// Input voltage range in which `state` is the raw state.
    fn band(&self, state: RegState) -> (f64, f64) {
        let t = &self.thresholds;
        match state {
            RegState::Lo2 => (t.lo2, f64::INFINITY),
            RegState::Lo1 => (t.lo1, t.lo2),
            RegState::Byp => (t.bo1, t.lo1),
            RegState::Bo1 => (t.bo2, t.bo1),
            RegState::Bo2 => (f64::NEG_INFINITY, t.bo2),
        }
    }

    /// State for input voltage `v` when `held` is the current state.
    ///
    /// `held` is kept while `v` stays inside its band widened by the
    /// hysteresis on both sides.
    pub fn select(&self, held: RegState, v: f64) -> RegState {
        let (low, high) = self.band(held);
        let h = self.hysteresis;
        if v >= low - h && v <= high + h {
            held
        } else {
            self.raw_state(v)
        }
    }

    /// Per-phase power limit for a state (VA).
    fn phase_limit(&self, state: RegState) -> f64 {
        let kva = if state.level() > 0 {
            self.max_boost_kva
        } else {
            self.max_buck_kva
        };
        kva * 1000.0 / 3.0
    }

    /// Series power exchanged on one phase (VA).
    fn series_power(&self, state: RegState, v_in: f64, current: f64) -> f64 {
        v_in * self.coefficients.of(state).abs() / 100.0 * current
    }

    /// Keeps the direction of the phase furthest from target and sends the
    /// phases asking for the opposite direction to bypass.
    fn one_direction(
        &self,
        states: PerPhase<RegState>,
        input: &PerPhase<f64>,
    ) -> PerPhase<RegState> {
        let boosting = states.0.iter().any(|s| s.level() > 0);
        let abating = states.0.iter().any(|s| s.level() < 0);
        if !(boosting && abating) {
            return states;
        }
        let mut lead: Option<Phase> = None;
        for (p, s) in states.iter() {
            if s == RegState::Byp {
                continue;
            }
            let dev = (input[p] - self.target_voltage).abs();
            match lead {
                Some(l) if (input[l] - self.target_voltage).abs() >= dev => {}
                _ => lead = Some(p),
            }
        }
        let dir = match lead {
            Some(l) => states[l].level().signum(),
            None => return states,
        };
        states.map(|s| if s.level().signum() == -dir { RegState::Byp } else { s })
    }
}

/// Runtime automaton of one installed regulator.
#[derive(Debug, Clone)]
pub struct Regulator {
    pub config: RegulatorConfig,
    pub state: PerPhase<RegState>,

    /// Phase switchings since the start of the calculation.
    pub transitions: usize,

    /// Whether the last update had to step back because of the power limit.
    pub power_limited: bool,
}

impl Regulator {
    pub fn new(config: RegulatorConfig) -> Self {
        Self {
            config,
            state: PerPhase::splat(RegState::Byp),
            transitions: 0,
            power_limited: false,
        }
    }

    /// Applied correction per phase (%).
    pub fn coefficients(&self) -> PerPhase<f64> {
        self.state.map(|s| self.config.coefficients.of(s))
    }

    /// Output over input voltage ratio per phase.
    pub fn ratios(&self) -> PerPhase<f64> {
        self.coefficients().map(|c| 1.0 + c / 100.0)
    }

    /// Decides the next state from the measured input voltages and the
    /// load-side currents (A). Returns whether any phase switched.
    pub fn update(&mut self, input: &PerPhase<f64>, current: &PerPhase<f64>) -> bool {
        let cfg = &self.config;
        let held = self.state;
        let mut next = PerPhase::from_fn(|p| cfg.select(held[p], input[p]));
        if cfg.variant == RegulatorVariant::Srg2_230 {
            next = cfg.one_direction(next, input);
        }

        let mut limited = false;
        for p in Phase::ALL {
            while next[p] != RegState::Byp
                && cfg.series_power(next[p], input[p], current[p]) > cfg.phase_limit(next[p])
            {
                next[p] = next[p].toward_bypass();
                limited = true;
            }
        }

        let changed = Phase::ALL.iter().filter(|&&p| next[p] != held[p]).count();
        log::debug!(
            "regulator {}: input {} -> [{}, {}, {}]{}",
            cfg.id,
            format_per_phase(input),
            next[Phase::A],
            next[Phase::B],
            next[Phase::C],
            if limited { " (power limited)" } else { "" }
        );
        self.transitions += changed;
        self.power_limited = limited;
        self.state = next;
        changed > 0
    }

    /// Reports the regulator against the flow its current state produced.
    pub fn result(&self, flow: &NodeFlow, converged: bool) -> RegulatorResult {
        RegulatorResult {
            id: self.config.id.clone(),
            node: self.config.node.clone(),
            variant: self.config.variant,
            status: DeviceStatus::Active,
            input_voltage: flow.input_voltage.norm(),
            state: self.state,
            coefficient: self.coefficients(),
            output_voltage: flow.voltage.norm(),
            transitions: self.transitions,
            settle_time_s: self.transitions as f64 * self.config.time_delay_s,
            power_limited: self.power_limited,
            converged,
        }
    }
}
