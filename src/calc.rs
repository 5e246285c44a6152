use crate::compensator::{calibrate, idle, CompensatorConfig};
use crate::distribution::imbalance_percent;
use crate::equipment::{prepare, EquipmentSet};
use crate::network::{Network, NodeId};
use crate::opt::CalcOptions;
use crate::regulator::Regulator;
use crate::result::{
    CableResult, CalculationResult, CompensatorResult, ConvergenceStatus, DeviceStatus,
    Diagnostic, NodeResult, RegulatorResult,
};
use crate::traits::{BaseSolver, Case, CurrentInjection, Injections, PowerFlow};
use anyhow::Result;
use std::collections::BTreeMap;

/// Compensator injections closer than this between two passes are settled (A).
const INJECTION_SETTLED: f64 = 0.5;

/// One demand level of a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandLevel {
    pub label: String,
    pub load_factor: f64,
    pub production_factor: f64,
}

impl DemandLevel {
    pub fn new(label: &str, load_factor: f64, production_factor: f64) -> Self {
        Self {
            label: label.to_string(),
            load_factor,
            production_factor,
        }
    }
}

/// Outcome of one round over every active compensator.
struct Balance {
    flow: PowerFlow,
    results: Vec<CompensatorResult>,
    passes: usize,
    settled: bool,
}

/// Evaluates a feeder with its regulators and compensators.
///
/// The returned result always describes the last evaluated network state.
/// Device problems and non-convergence are reported through diagnostics;
/// errors are returned only for a malformed network.
pub fn calculate(
    network: &Network,
    options: &CalcOptions,
    equipment: &EquipmentSet,
    solver: &dyn BaseSolver,
) -> Result<CalculationResult> {
    let prepared = prepare(network, equipment);
    let mut diagnostics = prepared.diagnostics.clone();
    let case = Case::new(prepared.network.clone(), options.clone())?;

    for &i in &case.order.unreachable {
        diagnostics.push(Diagnostic::UnreachableNode {
            node: case.order.i2e[i].clone(),
        });
    }
    let energised = |node: &str| {
        case.order
            .index(node)
            .map(|i| case.order.is_reachable(i))
            .unwrap_or(false)
    };

    let mut regulators: Vec<Regulator> = Vec::new();
    let mut reg_results: Vec<Option<RegulatorResult>> = Vec::new();
    for (cfg, status) in &prepared.regulators {
        let status = match status {
            DeviceStatus::Active if !energised(&cfg.node) => {
                DeviceStatus::Skipped("node is not energised".to_string())
            }
            s => s.clone(),
        };
        if status.is_active() {
            regulators.push(Regulator::new(cfg.clone()));
            reg_results.push(None);
        } else {
            reg_results.push(Some(RegulatorResult::inactive(
                &cfg.id, &cfg.node, cfg.variant, status,
            )));
        }
    }

    let mut compensators: Vec<&CompensatorConfig> = Vec::new();
    let mut comp_results: Vec<Option<CompensatorResult>> = Vec::new();
    let nominal = case.network.nominal_voltage;
    for (cfg, status) in &prepared.compensators {
        let status = match status {
            DeviceStatus::Active if !energised(&cfg.node) => {
                DeviceStatus::Skipped("node is not energised".to_string())
            }
            s => s.clone(),
        };
        if status.is_active() {
            compensators.push(cfg);
            comp_results.push(None);
        } else {
            let ceiling = cfg.ceiling(nominal);
            comp_results.push(Some(idle(cfg, status, ceiling, &Default::default())));
        }
    }

    let mut injections = Injections::default();
    for cfg in &compensators {
        if let Some(warm) = equipment.warm_start.get(&cfg.node) {
            injections.currents.insert(cfg.node.clone(), *warm);
        }
    }

    let mut loop_converged = true;
    let mut regs_settled = true;
    let mut active_comp_results = Vec::new();
    let (flow, iterations) = match (regulators.is_empty(), compensators.is_empty()) {
        (true, true) => {
            log::info!("no active device, single power flow");
            (solver.solve(&case, &injections)?, 1)
        }
        (false, true) => {
            log::info!("{} regulator(s), automaton iterations", regulators.len());
            let max_it = options.max_regulator_iterations.max(1);
            let mut it = 0;
            let flow = loop {
                it += 1;
                let flow = solver.solve(&case, &injections)?;
                if !update_regulators(&mut regulators, &flow, &mut injections) {
                    break flow;
                }
                if it >= max_it {
                    regs_settled = false;
                    break solver.solve(&case, &injections)?;
                }
            };
            (flow, it)
        }
        (true, false) => {
            log::info!("{} compensator(s), calibration", compensators.len());
            let balance = run_compensators(&case, solver, &compensators, &mut injections)?;
            loop_converged = balance.settled;
            active_comp_results = balance.results;
            (balance.flow, balance.passes)
        }
        (false, false) => {
            log::info!(
                "{} regulator(s) and {} compensator(s), coupling loop",
                regulators.len(),
                compensators.len()
            );
            let max_it = options.max_coupling_iterations.max(1);
            let mut it = 0;
            let balance = loop {
                it += 1;
                let balance = run_compensators(&case, solver, &compensators, &mut injections)?;
                // regulators decide on the network as balanced by the compensators
                if !update_regulators(&mut regulators, &balance.flow, &mut injections) {
                    break balance;
                }
                if it >= max_it {
                    regs_settled = false;
                    break run_compensators(&case, solver, &compensators, &mut injections)?;
                }
            };
            loop_converged = balance.settled && regs_settled;
            if !regs_settled {
                diagnostics.push(Diagnostic::CouplingNotConverged { iterations: it });
            }
            active_comp_results = balance.results;
            (balance.flow, it)
        }
    };

    // merge device results back into declaration order
    let mut active_regs = regulators.iter();
    let regulators: Vec<RegulatorResult> = reg_results
        .into_iter()
        .filter_map(|r| match r {
            Some(r) => Some(r),
            None => active_regs.next().and_then(|reg| {
                flow.nodes
                    .get(&reg.config.node)
                    .map(|nf| reg.result(nf, regs_settled))
            }),
        })
        .collect();
    let mut active_comps = active_comp_results.into_iter();
    let compensators: Vec<CompensatorResult> = comp_results
        .into_iter()
        .filter_map(|r| r.or_else(|| active_comps.next()))
        .collect();

    for r in &regulators {
        if r.status.is_active() && !r.converged {
            diagnostics.push(Diagnostic::RegulatorNotSettled {
                device: r.id.clone(),
                iterations,
            });
        }
        if r.power_limited {
            diagnostics.push(Diagnostic::PowerLimited {
                device: r.id.clone(),
            });
        }
    }
    for c in &compensators {
        if c.thermally_limited {
            diagnostics.push(Diagnostic::ThermallyLimited {
                device: c.id.clone(),
                current: c.ceiling,
            });
        } else if !c.converged {
            diagnostics.push(Diagnostic::CompensatorNotConverged {
                device: c.id.clone(),
                residual: c.residual,
            });
        }
    }
    if !flow.converged {
        diagnostics.push(Diagnostic::SolverNotConverged {
            iterations: flow.iterations,
        });
    }

    let devices_converged = regulators.iter().all(|r| r.converged)
        && compensators.iter().all(|c| c.converged);
    let status = if flow.converged && loop_converged && regs_settled && devices_converged {
        ConvergenceStatus::Converged
    } else {
        ConvergenceStatus::NotConverged
    };
    if status == ConvergenceStatus::Converged {
        log::info!("calculation converged after {} iteration(s)", iterations);
    } else {
        log::warn!("calculation not converged after {} iteration(s)", iterations);
    }

    let injections: BTreeMap<NodeId, CurrentInjection> = compensators
        .iter()
        .filter(|c| c.status.is_active())
        .map(|c| (c.node.clone(), c.injection))
        .collect();

    Ok(CalculationResult {
        scenario: options.scenario,
        nodes: node_table(&flow),
        cables: cable_table(&case, &flow),
        status,
        iterations,
        regulators,
        compensators,
        diagnostics,
        injections,
    })
}

/// Evaluates the demand levels in order. Each level starts its compensators
/// from the injections calibrated at the previous one.
pub fn run_profile(
    network: &Network,
    options: &CalcOptions,
    equipment: &EquipmentSet,
    levels: &[DemandLevel],
    solver: &dyn BaseSolver,
) -> Result<Vec<CalculationResult>> {
    let mut equipment = equipment.clone();
    let mut results = Vec::with_capacity(levels.len());
    for level in levels {
        let mut opt = options.clone();
        opt.load_factor = level.load_factor;
        opt.production_factor = level.production_factor;
        log::debug!(
            "profile level {}: load x{}, production x{}",
            level.label,
            level.load_factor,
            level.production_factor
        );
        let result = calculate(network, &opt, &equipment, solver)?;
        for (node, inj) in &result.injections {
            equipment.warm_start.insert(node.clone(), *inj);
        }
        results.push(result);
    }
    Ok(results)
}

/// Feeds the last flow to every automaton. Returns whether any state moved
/// and refreshes the series ratios.
fn update_regulators(
    regulators: &mut [Regulator],
    flow: &PowerFlow,
    injections: &mut Injections,
) -> bool {
    let mut changed = false;
    for reg in regulators.iter_mut() {
        let nf = match flow.nodes.get(&reg.config.node) {
            Some(nf) => nf,
            None => continue,
        };
        if reg.update(&nf.input_voltage.norm(), &nf.current.norm()) {
            changed = true;
        }
        injections
            .ratios
            .insert(reg.config.node.clone(), reg.ratios());
    }
    changed
}

/// Gauss-Seidel passes over the compensators until their injections stop
/// moving. A single compensator needs one pass.
fn run_compensators(
    case: &Case,
    solver: &dyn BaseSolver,
    compensators: &[&CompensatorConfig],
    injections: &mut Injections,
) -> Result<Balance> {
    let max_passes = if compensators.len() > 1 {
        case.options.max_coupling_iterations.max(1)
    } else {
        1
    };
    let mut passes = 0;
    loop {
        passes += 1;
        let mut moved: f64 = 0.0;
        let mut results = Vec::with_capacity(compensators.len());
        let mut last = None;
        for cfg in compensators {
            let mut others = injections.clone();
            let previous = others.currents.remove(&cfg.node).unwrap_or_default();
            // seeded from the equipment warm start on the first pass
            let warm = Some(previous.magnitude()).filter(|w| *w > 0.0);
            let natural = solver.solve(case, &others)?;
            let cal = calibrate(cfg, solver, case, &others, natural, warm)?;
            let current = cal.injection.unwrap_or_default();
            moved = moved.max((current.neutral - previous.neutral).norm());
            match cal.injection {
                Some(inj) => injections.currents.insert(cfg.node.clone(), inj),
                None => injections.currents.remove(&cfg.node),
            };
            results.push(cal.result);
            last = Some(cal.flow);
        }
        let settled = compensators.len() <= 1 || moved < INJECTION_SETTLED;
        log::debug!("compensator pass {}: largest move {:.3} A", passes, moved);
        if settled || passes >= max_passes {
            let flow = match last {
                Some(flow) => flow,
                None => solver.solve(case, injections)?,
            };
            return Ok(Balance {
                flow,
                results,
                passes,
                settled,
            });
        }
    }
}

fn node_table(flow: &PowerFlow) -> BTreeMap<NodeId, NodeResult> {
    flow.nodes
        .iter()
        .map(|(id, nf)| {
            let voltage = nf.voltage.norm();
            (
                id.clone(),
                NodeResult {
                    voltage,
                    phasor: nf.voltage,
                    neutral_voltage: nf.neutral.norm(),
                    imbalance_percent: imbalance_percent(&voltage),
                },
            )
        })
        .collect()
}

fn cable_table(case: &Case, flow: &PowerFlow) -> BTreeMap<String, CableResult> {
    flow.cables
        .iter()
        .map(|(id, cf)| {
            let current = cf.current.norm();
            let rating = case
                .network
                .cable(id)
                .and_then(|c| case.network.cable_type(&c.cable_type))
                .map(|t| t.max_current)
                .unwrap_or(0.0);
            let loading_percent = if rating > 0.0 {
                current.max() / rating * 100.0
            } else {
                0.0
            };
            (
                id.clone(),
                CableResult {
                    current,
                    neutral_current: cf.neutral.norm(),
                    drop: cf.drop,
                    loading_percent,
                },
            )
        })
        .collect()
}
