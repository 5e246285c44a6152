use crate::distribution::{distribute, PhaseLoads};
use crate::network::{CableId, Network, NodeId};
use crate::opt::CalcOptions;
use crate::order::{radial_order, Order};
use crate::phasor::PerPhase;
use anyhow::{format_err, Result};
use num_complex::Complex64;
use std::collections::BTreeMap;

/// Base power-flow solver.
///
/// Derives per-node, per-phase voltages and per-cable currents from a
/// prepared case plus the device injections of the current evaluation.
pub trait BaseSolver {
    fn solve(&self, case: &Case, injections: &Injections) -> Result<PowerFlow>;
}

/// A network prepared for repeated evaluation within one calculation.
///
/// Owns its copy of the network so that per-call changes (cable
/// replacements) never reach the caller's description.
#[derive(Debug, Clone)]
pub struct Case {
    pub network: Network,
    pub options: CalcOptions,
    pub order: Order,

    /// Phase distribution of every node, indexed like `Network::nodes`.
    pub phase_loads: Vec<PhaseLoads>,
}

impl Case {
    pub fn new(network: Network, options: CalcOptions) -> Result<Self> {
        let order = radial_order(&network)?;
        for cable in &network.cables {
            if network.cable_type(&cable.cable_type).is_none() {
                return Err(format_err!(
                    "cable \"{}\": unknown cable type \"{}\"",
                    cable.id,
                    cable.cable_type
                ));
            }
        }
        let phase_loads = network
            .nodes
            .iter()
            .map(|node| {
                distribute(
                    node,
                    network.clients_of(&node.id),
                    options.load_model,
                    &options.balancing,
                )
            })
            .collect();
        Ok(Self {
            network,
            options,
            order,
            phase_loads,
        })
    }

    /// Complex power drawn per phase at node `i` (VA, consumption positive)
    /// after demand scaling.
    pub fn node_power(&self, i: usize) -> PerPhase<Complex64> {
        let opt = &self.options;
        let loads = &self.phase_loads[i];
        let load_pf = power_factor_phasor(opt.load_power_factor);
        let prod_pf = power_factor_phasor(opt.production_power_factor);
        PerPhase::from_fn(|p| {
            let mut s = Complex64::default();
            if opt.scenario.has_loads() {
                s += load_pf * (loads.load[p] * opt.load_factor * 1000.0);
            }
            if opt.scenario.has_productions() {
                // productions inject active power and absorb reactive power
                let g = prod_pf * (loads.production[p] * opt.production_factor * 1000.0);
                s += Complex64::new(-g.re, g.im);
            }
            s
        })
    }
}

/// `cos φ + j sin φ`, with the power factor clamped into `(0, 1]`.
fn power_factor_phasor(pf: f64) -> Complex64 {
    let pf = if pf.is_finite() && pf > 0.0 { pf.min(1.0) } else { 1.0 };
    Complex64::new(pf, (1.0 - pf * pf).sqrt())
}

/// Currents injected into the network conductors at one node.
///
/// For a shunt device `phases.sum() + neutral == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CurrentInjection {
    pub phases: PerPhase<Complex64>,
    pub neutral: Complex64,
}

impl CurrentInjection {
    /// Injection that returns `phases` into the phase conductors and takes
    /// the same total out of the neutral.
    pub fn shunt(phases: PerPhase<Complex64>) -> Self {
        Self {
            neutral: -phases.sum(),
            phases,
        }
    }

    /// Magnitude of the neutral current handled by the device (A).
    pub fn magnitude(&self) -> f64 {
        self.neutral.norm()
    }
}

/// Device contributions to one base evaluation, keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct Injections {
    /// Shunt current injections (compensators).
    pub currents: BTreeMap<NodeId, CurrentInjection>,

    /// Series voltage ratios `1 + c/100` (regulators).
    pub ratios: BTreeMap<NodeId, PerPhase<f64>>,
}

#[derive(Debug, Clone)]
pub struct NodeFlow {
    /// Phase conductor potentials.
    pub phase: PerPhase<Complex64>,

    /// Neutral conductor potential.
    pub neutral: Complex64,

    /// Phase-to-neutral voltages seen by the node's loads.
    pub voltage: PerPhase<Complex64>,

    /// Phase-to-neutral voltages ahead of any series regulation at the node.
    pub input_voltage: PerPhase<Complex64>,

    /// Current drawn by the node and everything downstream of it, measured
    /// on the load side of any series device.
    pub current: PerPhase<Complex64>,
}

#[derive(Debug, Clone)]
pub struct CableFlow {
    /// Node on the source side.
    pub upstream: NodeId,

    /// Phase currents flowing away from the source.
    pub current: PerPhase<Complex64>,

    /// Neutral current flowing back towards the source.
    pub neutral: Complex64,

    /// Phase-to-neutral voltage drop along the cable (V).
    pub drop: PerPhase<f64>,
}

/// Output of one base evaluation.
#[derive(Debug, Clone, Default)]
pub struct PowerFlow {
    pub nodes: BTreeMap<NodeId, NodeFlow>,
    pub cables: BTreeMap<CableId, CableFlow>,
    pub iterations: usize,
    pub converged: bool,
}

impl PowerFlow {
    /// Phase-to-neutral voltage magnitudes at a node.
    pub fn voltage(&self, node: &str) -> Option<PerPhase<f64>> {
        self.nodes.get(node).map(|n| n.voltage.norm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Cable, CableType, Client, Node};
    use crate::opt::Scenario;
    use crate::phasor::Phase;

    fn network() -> Network {
        Network {
            nodes: vec![
                Node::new_source("src", 230.0),
                Node::new("n1").with_load("agg", 3.0).with_production("pv", 6.0),
            ],
            cables: vec![Cable::new("c1", "src", "n1", "t", 100.0)],
            cable_types: vec![CableType {
                id: "t".to_string(),
                r_phase: 0.32,
                x_phase: 0.08,
                r_neutral: 0.32,
                x_neutral: 0.08,
                max_current: 200.0,
            }],
            clients: vec![Client::single_phase("c", "n1", Some(Phase::B), 3.0)],
            ..Default::default()
        }
    }

    #[test]
    fn node_power_follows_scenario() -> Result<()> {
        let mut options = CalcOptions::default();
        options.load_power_factor = 1.0;
        options.load_factor = 0.5;
        let case = Case::new(network(), options.clone())?;
        let s = case.node_power(1);
        assert!((s[Phase::A].re - 500.0).abs() < 1e-9);
        assert!((s[Phase::B].re - 2000.0).abs() < 1e-9);

        options.scenario = Scenario::Production;
        let case = Case::new(network(), options)?;
        let s = case.node_power(1);
        assert!((s[Phase::A].re + 2000.0).abs() < 1e-9);
        assert!(s[Phase::A].im.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn unknown_cable_type_is_an_error() {
        let mut net = network();
        net.cables[0].cable_type = "missing".to_string();
        assert!(Case::new(net, CalcOptions::default()).is_err());
    }

    #[test]
    fn shunt_injection_conserves_current() {
        let inj = CurrentInjection::shunt(PerPhase::splat(Complex64::new(3.0, -1.0)));
        assert!((inj.phases.sum() + inj.neutral).norm() < 1e-12);
        assert!((inj.magnitude() - 10f64.sqrt() * 3.0).abs() < 1e-12);
    }
}
