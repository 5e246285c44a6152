use crate::debug::format_polar_vec;
use crate::phasor::PerPhase;
use crate::traits::{BaseSolver, Case, CableFlow, Injections, NodeFlow, PowerFlow};
use anyhow::{format_err, Result};
use num_complex::Complex64;
use std::collections::BTreeMap;

/// Below this phase-to-neutral magnitude (V) a constant-power load is
/// evaluated at nominal voltage instead.
const MIN_LOAD_VOLTAGE: f64 = 1.0;

/// Backward/forward sweep for radial four-wire feeders.
///
/// Loads are constant power, connected phase-to-neutral. The neutral is
/// earthed at the source only. Regulator nodes apply an ideal per-phase
/// series ratio: the load side sees `r · V` and the source side carries
/// `r · I`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RadialSweep;

impl BaseSolver for RadialSweep {
    fn solve(&self, case: &Case, injections: &Injections) -> Result<PowerFlow> {
        let net = &case.network;
        let order = &case.order;
        let tol = case.options.solver.tolerance;
        let max_it = case.options.solver.max_iterations;
        let nb = net.nodes.len();

        let mut z_phase = Vec::with_capacity(net.cables.len());
        let mut z_neutral = Vec::with_capacity(net.cables.len());
        for cable in &net.cables {
            let ct = net.cable_type(&cable.cable_type).ok_or_else(|| {
                format_err!(
                    "cable \"{}\": unknown cable type \"{}\"",
                    cable.id,
                    cable.cable_type
                )
            })?;
            z_phase.push(ct.z_phase(cable.length_m));
            z_neutral.push(ct.z_neutral(cable.length_m));
        }

        let e_source = net.nodes[order.source].source.unwrap_or(net.nominal_voltage);
        let emf = PerPhase::balanced(e_source);
        let z_tr = net
            .transformer
            .map(|tr| tr.impedance(net.nominal_voltage))
            .unwrap_or_default();
        let nominal = PerPhase::balanced(net.nominal_voltage);

        let power: Vec<PerPhase<Complex64>> = (0..nb).map(|i| case.node_power(i)).collect();
        let shunt: Vec<PerPhase<Complex64>> = order
            .i2e
            .iter()
            .map(|id| {
                injections
                    .currents
                    .get(id)
                    .map(|inj| inj.phases)
                    .unwrap_or_else(PerPhase::zero)
            })
            .collect();
        let ratio: Vec<Option<PerPhase<f64>>> = order
            .i2e
            .iter()
            .map(|id| injections.ratios.get(id).copied())
            .collect();

        // flat start
        let mut v_pn = vec![emf; nb];
        let mut v_in = vec![emf; nb];
        let mut v_ph = vec![emf; nb];
        let mut v_n = vec![Complex64::default(); nb];
        let mut sub = vec![PerPhase::<Complex64>::zero(); nb];
        let mut up = vec![PerPhase::<Complex64>::zero(); nb];

        let mut converged = false;
        let mut it = 0;
        while !converged && it < max_it {
            it += 1;

            // backward sweep: currents from the leaves up to the source
            sub.iter_mut().for_each(|s| *s = PerPhase::zero());
            for &i in order.sweep.iter().rev() {
                let draw = PerPhase::from_fn(|p| {
                    let v = if v_pn[i][p].norm() < MIN_LOAD_VOLTAGE {
                        nominal[p]
                    } else {
                        v_pn[i][p]
                    };
                    (power[i][p] / v).conj()
                });
                sub[i] = PerPhase::from_fn(|p| sub[i][p] + draw[p] - shunt[i][p]);
                up[i] = match ratio[i] {
                    Some(r) => sub[i].zip(&r, |c, r| c * r),
                    None => sub[i],
                };
                if let Some((parent, _)) = order.parent[i] {
                    let upstream = up[i];
                    sub[parent] = sub[parent].zip(&upstream, |a, b| a + b);
                }
            }

            // forward sweep: voltages from the source down to the leaves
            let mut max_dv: f64 = 0.0;
            for &i in &order.sweep {
                let (raw, neutral) = match order.parent[i] {
                    None => (
                        PerPhase::from_fn(|p| emf[p] - z_tr * up[i][p]),
                        Complex64::default(),
                    ),
                    Some((parent, k)) => (
                        PerPhase::from_fn(|p| v_ph[parent][p] - z_phase[k] * up[i][p]),
                        v_n[parent] + z_neutral[k] * up[i].sum(),
                    ),
                };
                let input = raw.map(|v| v - neutral);
                let output = match ratio[i] {
                    Some(r) => input.zip(&r, |v, r| v * r),
                    None => input,
                };
                for (p, v) in output.iter() {
                    max_dv = max_dv.max((v - v_pn[i][p]).norm());
                }
                v_in[i] = input;
                v_pn[i] = output;
                v_n[i] = neutral;
                v_ph[i] = output.map(|v| v + neutral);
            }

            if !max_dv.is_finite() {
                return Err(format_err!("radial sweep diverged at iteration {}", it));
            }
            log::debug!("sweep {:3}  max dV = {:.3e} V", it, max_dv);
            if max_dv < tol {
                converged = true;
            }
        }

        if converged {
            log::debug!("radial sweep converged in {} iterations", it);
        } else {
            log::warn!("radial sweep did not converge in {} iterations", it);
        }
        if let Some(&last) = order.sweep.last() {
            log::trace!("V[{}]: {}", order.i2e[last], format_polar_vec(&v_pn[last].0));
        }

        let mut nodes = BTreeMap::new();
        let mut cables = BTreeMap::new();
        for &i in &order.sweep {
            nodes.insert(
                order.i2e[i].clone(),
                NodeFlow {
                    phase: v_ph[i],
                    neutral: v_n[i],
                    voltage: v_pn[i],
                    input_voltage: v_in[i],
                    current: sub[i],
                },
            );
            if let Some((parent, k)) = order.parent[i] {
                let drop = v_pn[parent].norm().zip(&v_in[i].norm(), |a, b| a - b);
                cables.insert(
                    net.cables[k].id.clone(),
                    CableFlow {
                        upstream: order.i2e[parent].clone(),
                        current: up[i],
                        neutral: up[i].sum(),
                        drop,
                    },
                );
            }
        }

        Ok(PowerFlow {
            nodes,
            cables,
            iterations: it,
            converged,
        })
    }
}
