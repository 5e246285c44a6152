use crate::debug::{format_per_phase, format_rect_vec};
use crate::network::NodeId;
use crate::phasor::{unit, PerPhase};
use crate::result::{CompensatorResult, DeviceStatus};
use crate::traits::{BaseSolver, Case, CurrentInjection, Injections, PowerFlow};
use anyhow::Result;
use derive_builder::Builder;
use num_complex::Complex64;

/// Smallest impedance the device operates with (Ω).
pub const MIN_IMPEDANCE: f64 = 0.15;

/// Below this total phase current (A) the decomposition weights are
/// meaningless and the injection is split evenly.
const MIN_WEIGHT_CURRENT: f64 = 1e-3;

/// Rated duration class of the injection. Each class has its own current
/// ceiling.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, clap::ValueEnum)]
pub enum ThermalWindow {
    Minutes15,
    #[default]
    Hours3,
    Permanent,
}

impl ThermalWindow {
    /// Maximum neutral current for the window (A).
    pub fn ceiling(self) -> f64 {
        match self {
            ThermalWindow::Minutes15 => 80.0,
            ThermalWindow::Hours3 => 60.0,
            ThermalWindow::Permanent => 45.0,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, clap::ValueEnum)]
pub enum CompensationMode {
    /// Inject the closed-form current once.
    Estimate,
    /// Adjust the injection against the power flow until the target spread
    /// is reached.
    #[default]
    Calibrated,
}

#[derive(Debug, Clone, Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct CompensatorConfig {
    #[builder(setter(into))]
    pub id: String,

    #[builder(setter(into))]
    pub node: NodeId,

    /// Phase loop impedance seen from the node (Ω). Floored at 0.15.
    pub zph: f64,

    /// Neutral loop impedance seen from the node (Ω). Floored at 0.15.
    pub zn: f64,

    /// Natural neutral current below which the device stays idle (A).
    pub tolerance_current: f64,

    /// Maximum apparent power (kVA).
    pub max_power_kva: f64,

    pub window: ThermalWindow,

    pub mode: CompensationMode,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            node: NodeId::new(),
            zph: 0.25,
            zn: 0.25,
            tolerance_current: 1.0,
            max_power_kva: 20.0,
            window: ThermalWindow::default(),
            mode: CompensationMode::default(),
        }
    }
}

impl CompensatorConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let mut cfg = CompensatorConfig::default();
        cfg.zph = self.zph.unwrap_or(cfg.zph);
        cfg.zn = self.zn.unwrap_or(cfg.zn);
        cfg.tolerance_current = self.tolerance_current.unwrap_or(cfg.tolerance_current);
        cfg.max_power_kva = self.max_power_kva.unwrap_or(cfg.max_power_kva);
        cfg.validate()
    }
}

impl CompensatorConfig {
    pub fn new(id: &str, node: &str) -> CompensatorConfigBuilder {
        CompensatorConfigBuilder {
            id: Some(id.to_string()),
            node: Some(node.to_string()),
            ..Default::default()
        }
    }

    /// Impedances below the operating minimum are clamped up, not refused.
    pub fn validate(&self) -> Result<(), String> {
        if !self.zph.is_finite() || !self.zn.is_finite() {
            return Err(format!("impedances must be finite (Zph {}, Zn {})", self.zph, self.zn));
        }
        if !(self.max_power_kva.is_finite() && self.max_power_kva > 0.0) {
            return Err(format!("maximum power must be positive (got {} kVA)", self.max_power_kva));
        }
        if !(self.tolerance_current.is_finite() && self.tolerance_current >= 0.0) {
            return Err(format!(
                "tolerance current must be non-negative (got {} A)",
                self.tolerance_current
            ));
        }
        Ok(())
    }

    /// `(Zph, Zn)` floored at the operating minimum.
    pub fn impedances(&self) -> (f64, f64) {
        (self.zph.max(MIN_IMPEDANCE), self.zn.max(MIN_IMPEDANCE))
    }

    /// Current ceiling: the window limit or the power rating, whichever is
    /// lower (A).
    pub fn ceiling(&self, nominal_voltage: f64) -> f64 {
        let by_power = self.max_power_kva * 1000.0 / nominal_voltage;
        self.window.ceiling().min(by_power).max(0.0)
    }
}

/// Closed-form CME estimate for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct CmeEstimate {
    pub mean: f64,
    pub spread: f64,

    /// `(U - mean) / spread` per phase. Sums to zero.
    pub ratios: PerPhase<f64>,
    pub attenuation: f64,
    pub factor: f64,

    /// Spread left after compensation (V).
    pub reduced_spread: f64,

    /// Neutral current the device must take over (A).
    pub current: f64,
    pub targets: PerPhase<f64>,
}

pub fn cme_estimate(voltages: &PerPhase<f64>, zph: f64, zn: f64) -> CmeEstimate {
    let zph = zph.max(MIN_IMPEDANCE);
    let zn = zn.max(MIN_IMPEDANCE);
    let mean = voltages.mean();
    let spread = voltages.spread();
    let ratios = if spread > 0.0 {
        voltages.map(|u| (u - mean) / spread)
    } else {
        PerPhase::zero()
    };
    let attenuation = 1.0 / (0.9119 * zph.ln() + 3.8654);
    let factor = 2.0 * zph / (zph + zn);
    let reduced_spread = (spread * attenuation * factor).min(spread);
    let current = 0.392 * zph.powf(-0.8065) * spread * factor;
    let targets = ratios.map(|r| mean + r * reduced_spread);
    CmeEstimate {
        mean,
        spread,
        ratios,
        attenuation,
        factor,
        reduced_spread,
        current,
        targets,
    }
}

/// Splits a requested injection over the three phases.
///
/// Shares follow the magnitudes of `phase_currents`, so the parts add up to
/// `requested`. A phase over `max_per_phase` is clamped and its excess moved
/// to the phases that still have room. Degenerate weights give an even
/// split.
pub fn decompose(
    phase_currents: &PerPhase<Complex64>,
    requested: Complex64,
    max_per_phase: f64,
) -> PerPhase<Complex64> {
    let total = requested.norm();
    let dir = match unit(requested) {
        Some(d) => d,
        None => return PerPhase::zero(),
    };
    let limit = if max_per_phase.is_finite() && max_per_phase > 0.0 {
        max_per_phase
    } else {
        f64::INFINITY
    };

    let mags = phase_currents.norm();
    let sum = mags.sum();
    let weights = if mags.is_finite() && sum > MIN_WEIGHT_CURRENT {
        mags.map(|m| m / sum)
    } else {
        PerPhase::splat(1.0 / 3.0)
    };

    let mut share = weights.map(|w| w * total);
    for _ in 0..3 {
        let excess: f64 = share.0.iter().map(|s| (s - limit).max(0.0)).sum();
        if excess <= 0.0 {
            break;
        }
        share = share.map(|s| s.min(limit));
        let open = share.map(|s| if s < limit { 1.0 } else { 0.0 });
        let free_weight: f64 = weights.zip(&open, |w, o| w * o).sum();
        let basis = if free_weight > 0.0 {
            weights.zip(&open, |w, o| w * o / free_weight)
        } else {
            let room = share.map(|s| (limit - s).max(0.0));
            let r = room.sum();
            if r <= 0.0 {
                break;
            }
            room.map(|x| x / r)
        };
        share = share.zip(&basis, |s, b| s + excess * b);
    }
    share.map(|s| dir * s.min(limit))
}

/// Calibrated state of one compensator.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// `None` when the device stays idle.
    pub injection: Option<CurrentInjection>,

    /// Power flow with the final injection applied.
    pub flow: PowerFlow,
    pub result: CompensatorResult,
}

/// Runs the compensator at its node.
///
/// `others` are the contributions of every other device and `natural` the
/// power flow they produce without this compensator. `warm_start` is an
/// injection magnitude (A) from an earlier calculation; estimate mode ignores
/// it.
pub fn calibrate(
    config: &CompensatorConfig,
    solver: &dyn BaseSolver,
    case: &Case,
    others: &Injections,
    natural: PowerFlow,
    warm_start: Option<f64>,
) -> Result<Calibration> {
    let opt = &case.options.calibration;
    let ceiling = config.ceiling(case.network.nominal_voltage);
    let (zph, zn) = config.impedances();

    let (u0, phase_currents) = match natural.nodes.get(&config.node) {
        Some(n) => (n.voltage.norm(), n.current),
        None => {
            let status = DeviceStatus::Skipped("node is not energised".to_string());
            let result = idle(config, status, ceiling, &PerPhase::zero());
            return Ok(Calibration {
                injection: None,
                flow: natural,
                result,
            });
        }
    };
    let neutral0 = phase_currents.sum();
    let cme = cme_estimate(&u0, zph, zn);

    let dir = match unit(neutral0) {
        Some(d) if neutral0.norm() >= config.tolerance_current && cme.spread > opt.tolerance => d,
        _ => {
            log::debug!(
                "compensator {}: neutral current {:.2} A, spread {:.2} V, nothing to do",
                config.id,
                neutral0.norm(),
                cme.spread
            );
            let result = idle(config, DeviceStatus::NotRequired, ceiling, &u0);
            return Ok(Calibration {
                injection: None,
                flow: natural,
                result,
            });
        }
    };

    let inject =
        |current: f64| CurrentInjection::shunt(decompose(&phase_currents, dir * current, ceiling));
    let evaluate = |current: f64| -> Result<(PowerFlow, PerPhase<f64>)> {
        let mut injections = others.clone();
        injections.currents.insert(config.node.clone(), inject(current));
        let flow = solver.solve(case, &injections)?;
        let v = flow.voltage(&config.node).unwrap_or(u0);
        Ok((flow, v))
    };

    let target = cme.reduced_spread;
    // the estimate is recomputed for every network state
    let start = match config.mode {
        CompensationMode::Estimate => cme.current,
        CompensationMode::Calibrated => warm_start
            .filter(|w| w.is_finite() && *w > 0.0)
            .unwrap_or(cme.current),
    }
    .max(0.0)
    .min(ceiling);

    // f(I) = achieved spread - target, decreasing in I
    let (mut i_prev, mut f_prev) = (0.0, cme.spread - target);
    let mut i_cur = start;
    let (mut flow, mut v) = evaluate(i_cur)?;
    let mut f_cur = v.spread() - target;
    let mut iterations = 1;
    let mut converged = false;
    let mut limited = false;
    log::debug!(
        "compensator {}: I = {:.2} A, spread {:.2} V, target {:.2} V",
        config.id,
        i_cur,
        v.spread(),
        target
    );

    match config.mode {
        CompensationMode::Estimate => {
            converged = true;
            limited = i_cur < cme.current;
        }
        CompensationMode::Calibrated => loop {
            if f_cur.abs() <= opt.tolerance {
                converged = true;
                break;
            }
            if iterations >= opt.max_iterations {
                break;
            }
            let df = f_cur - f_prev;
            if df.abs() < f64::EPSILON {
                break;
            }
            let next = (i_cur - f_cur * (i_cur - i_prev) / df).max(0.0).min(ceiling);
            if next >= ceiling && i_cur >= ceiling {
                // wants more than the window allows
                limited = true;
                converged = true;
                break;
            }
            i_prev = i_cur;
            f_prev = f_cur;
            i_cur = next;
            (flow, v) = evaluate(i_cur)?;
            f_cur = v.spread() - target;
            iterations += 1;
            log::debug!(
                "compensator {}: step {:2}  I = {:.2} A, residual {:.3} V",
                config.id,
                iterations,
                i_cur,
                f_cur
            );
        },
    }

    if !converged {
        log::warn!(
            "compensator {}: calibration stopped after {} steps, residual {:.3} V",
            config.id,
            iterations,
            f_cur
        );
    }

    let injection = inject(i_cur);
    log::trace!(
        "compensator {}: phase injections {}",
        config.id,
        format_rect_vec(&injection.phases.0)
    );
    let achieved_spread = v.spread();
    let efficiency_percent = if cme.spread > 0.0 {
        (cme.spread - achieved_spread) / cme.spread * 100.0
    } else {
        0.0
    };
    log::debug!(
        "compensator {}: {} -> {} ({:.1} % removed)",
        config.id,
        format_per_phase(&u0),
        format_per_phase(&v),
        efficiency_percent
    );

    let result = CompensatorResult {
        id: config.id.clone(),
        node: config.node.clone(),
        status: DeviceStatus::Active,
        mode: config.mode,
        window: config.window,
        ceiling,
        initial_voltage: u0,
        natural_spread: cme.spread,
        target_voltage: cme.targets,
        target_spread: target,
        injected_current: injection.magnitude(),
        injection,
        achieved_voltage: v,
        achieved_spread,
        efficiency_percent,
        iterations,
        residual: f_cur,
        converged,
        thermally_limited: limited,
    };
    Ok(Calibration {
        injection: Some(injection),
        flow,
        result,
    })
}

/// Result of a compensator that injects nothing.
pub(crate) fn idle(
    config: &CompensatorConfig,
    status: DeviceStatus,
    ceiling: f64,
    voltage: &PerPhase<f64>,
) -> CompensatorResult {
    let spread = voltage.spread();
    CompensatorResult {
        id: config.id.clone(),
        node: config.node.clone(),
        status,
        mode: config.mode,
        window: config.window,
        ceiling,
        initial_voltage: *voltage,
        natural_spread: spread,
        target_voltage: *voltage,
        target_spread: spread,
        injected_current: 0.0,
        injection: CurrentInjection::default(),
        achieved_voltage: *voltage,
        achieved_spread: spread,
        efficiency_percent: 0.0,
        iterations: 0,
        residual: 0.0,
        converged: true,
        thermally_limited: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmplx;
    use crate::network::{Cable, CableType, Network, Node};
    use crate::opt::CalcOptions;
    use crate::phasor::Phase;
    use crate::sweep::RadialSweep;
    use anyhow::format_err;

    #[test]
    fn cme_fixture() -> Result<()> {
        let u = PerPhase::new(236.5, 205.0, 236.5);
        let cme = cme_estimate(&u, 0.25, 0.25);
        assert!((cme.mean - 226.0).abs() < 1e-9);
        assert!((cme.spread - 31.5).abs() < 1e-9);
        assert!(cme.ratios.sum().abs() < 1e-12);
        assert!((cme.factor - 1.0).abs() < 1e-12);
        if (cme.reduced_spread - 12.1).abs() > 0.2 {
            return Err(format_err!("reduced spread {}", cme.reduced_spread));
        }
        assert!((cme.targets[Phase::A] - 229.8).abs() < 2.0);
        assert!((cme.targets[Phase::B] - 217.8).abs() < 2.0);
        assert!((cme.targets[Phase::C] - 229.8).abs() < 2.0);
        // high phase moves down, low phase moves up, neither crosses the mean
        assert!(cme.targets[Phase::A] < 236.5 && cme.targets[Phase::A] > cme.mean);
        assert!(cme.targets[Phase::B] > 205.0 && cme.targets[Phase::B] < cme.mean);
        assert!(cme.current > 0.0);
        Ok(())
    }

    #[test]
    fn impedances_are_floored() -> Result<()> {
        let cfg = CompensatorConfig::new("c", "n1").zph(0.05).zn(-1.0).build()?;
        assert_eq!(cfg.impedances(), (MIN_IMPEDANCE, MIN_IMPEDANCE));
        let low = cme_estimate(&PerPhase::new(240.0, 200.0, 240.0), 0.01, 0.01);
        let floor = cme_estimate(&PerPhase::new(240.0, 200.0, 240.0), 0.15, 0.15);
        assert_eq!(low, floor);
        Ok(())
    }

    #[test]
    fn builder_rejects_non_finite() {
        assert!(CompensatorConfig::new("c", "n1").zph(f64::NAN).build().is_err());
        assert!(CompensatorConfig::new("c", "n1").max_power_kva(0.0).build().is_err());
    }

    #[test]
    fn ceiling_is_lowest_limit() -> Result<()> {
        let cfg = CompensatorConfig::new("c", "n1")
            .window(ThermalWindow::Minutes15)
            .build()?;
        // 20 kVA at 230 V is about 87 A
        assert_eq!(cfg.ceiling(230.0), 80.0);
        let cfg = CompensatorConfig::new("c", "n1")
            .window(ThermalWindow::Minutes15)
            .max_power_kva(10.0)
            .build()?;
        assert!((cfg.ceiling(230.0) - 10_000.0 / 230.0).abs() < 1e-9);
        assert_eq!(ThermalWindow::Permanent.ceiling(), 45.0);
        Ok(())
    }

    #[test]
    fn decomposition_conserves_sum() {
        let currents = PerPhase::new(cmplx!(40.0, -10.0), cmplx!(-20.0, -60.0), cmplx!(-5.0, 12.0));
        let requested = cmplx!(-12.0, -30.0);
        let parts = decompose(&currents, requested, 60.0);
        assert!((parts.sum() - requested).norm() / requested.norm() < 1e-9);
    }

    #[test]
    fn decomposition_clamps_and_redistributes() {
        let currents = PerPhase::new(cmplx!(100.0), cmplx!(1.0), cmplx!(1.0));
        let requested = cmplx!(0.0, 60.0);
        let parts = decompose(&currents, requested, 25.0);
        for (_, c) in parts.iter() {
            assert!(c.norm() <= 25.0 + 1e-9);
        }
        assert!((parts.sum() - requested).norm() < 1e-6);
    }

    #[test]
    fn decomposition_degenerate_inputs() {
        let requested = cmplx!(30.0);
        let parts = decompose(&PerPhase::zero(), requested, 50.0);
        for (_, c) in parts.iter() {
            assert!((c - cmplx!(10.0)).norm() < 1e-9);
        }
        let nan = PerPhase::splat(cmplx!(f64::NAN));
        assert!(decompose(&nan, requested, 50.0).is_finite());
        assert!(decompose(&PerPhase::zero(), cmplx!(f64::NAN), 50.0).is_finite());
    }

    fn unbalanced_case(kva: f64) -> Result<Case> {
        let net = Network {
            nodes: vec![
                Node::new_source("src", 230.0),
                Node::new("n1")
                    .with_load("agg", kva)
                    .with_phase_split(PerPhase::new(0.0, 100.0, 0.0)),
            ],
            cables: vec![Cable::new("c1", "src", "n1", "al95", 1000.0)],
            cable_types: vec![CableType {
                id: "al95".to_string(),
                r_phase: 0.32,
                x_phase: 0.08,
                r_neutral: 0.32,
                x_neutral: 0.08,
                max_current: 200.0,
            }],
            ..Default::default()
        };
        Case::new(net, CalcOptions::default())
    }

    fn run(cfg: &CompensatorConfig, case: &Case) -> Result<Calibration> {
        let natural = RadialSweep.solve(case, &Injections::default())?;
        calibrate(cfg, &RadialSweep, case, &Injections::default(), natural, None)
    }

    #[test]
    fn calibration_reaches_target() -> Result<()> {
        let case = unbalanced_case(10.0)?;
        let cfg = CompensatorConfig::new("comp", "n1")
            .window(ThermalWindow::Minutes15)
            .build()?;
        let cal = run(&cfg, &case)?;
        let r = &cal.result;
        assert_eq!(r.status, DeviceStatus::Active);
        assert!(r.converged && !r.thermally_limited);
        assert!(r.residual.abs() <= case.options.calibration.tolerance);
        assert!(r.achieved_spread < r.natural_spread);
        assert!(r.efficiency_percent > 50.0);
        for (_, c) in r.injection.phases.iter() {
            assert!(c.norm() <= r.ceiling + 1e-9);
        }
        assert!((r.injection.phases.sum() + r.injection.neutral).norm() < 1e-9);
        assert!(cal.injection.is_some());
        Ok(())
    }

    #[test]
    fn thermal_ceiling_stops_calibration() -> Result<()> {
        let case = unbalanced_case(10.0)?;
        let cfg = CompensatorConfig::new("comp", "n1")
            .max_power_kva(2.0)
            .build()?;
        let cal = run(&cfg, &case)?;
        let r = &cal.result;
        assert!(r.thermally_limited);
        assert!(r.converged);
        assert!((r.injected_current - r.ceiling).abs() < 1e-6);
        assert!(r.achieved_spread > r.target_spread);
        Ok(())
    }

    #[test]
    fn estimate_mode_injects_once() -> Result<()> {
        let case = unbalanced_case(10.0)?;
        let cfg = CompensatorConfig::new("comp", "n1")
            .window(ThermalWindow::Minutes15)
            .mode(CompensationMode::Estimate)
            .build()?;
        let cal = run(&cfg, &case)?;
        assert_eq!(cal.result.iterations, 1);
        assert!(cal.result.achieved_spread < cal.result.natural_spread);

        // an earlier injection does not replace the closed-form current
        let natural = RadialSweep.solve(&case, &Injections::default())?;
        let stale = cal.result.injected_current * 0.25;
        let others = Injections::default();
        let warm = calibrate(&cfg, &RadialSweep, &case, &others, natural, Some(stale))?;
        assert!((warm.result.injected_current - cal.result.injected_current).abs() < 1e-9);
        assert_eq!(warm.result.thermally_limited, cal.result.thermally_limited);
        Ok(())
    }

    #[test]
    fn balanced_node_needs_nothing() -> Result<()> {
        let mut case = unbalanced_case(10.0)?;
        case.phase_loads[1].load = PerPhase::splat(10.0 / 3.0);
        let cfg = CompensatorConfig::new("comp", "n1").build()?;
        let cal = run(&cfg, &case)?;
        assert_eq!(cal.result.status, DeviceStatus::NotRequired);
        assert!(cal.injection.is_none());
        assert_eq!(cal.result.injected_current, 0.0);
        Ok(())
    }
}
