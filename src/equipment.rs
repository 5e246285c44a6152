use crate::compensator::CompensatorConfig;
use crate::network::{CableId, Network, NodeId};
use crate::regulator::RegulatorConfig;
use crate::result::{DeviceStatus, Diagnostic};
use crate::traits::CurrentInjection;
use std::collections::{BTreeMap, BTreeSet};

/// Swaps the type of one cable for the duration of a calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct CableReplacement {
    pub cable: CableId,
    pub cable_type: String,
}

impl CableReplacement {
    pub fn new(cable: &str, cable_type: &str) -> Self {
        Self {
            cable: cable.to_string(),
            cable_type: cable_type.to_string(),
        }
    }
}

/// Devices and substitutions active for one calculation.
#[derive(Debug, Clone, Default)]
pub struct EquipmentSet {
    pub regulators: Vec<RegulatorConfig>,
    pub compensators: Vec<CompensatorConfig>,
    pub cable_replacements: Vec<CableReplacement>,

    /// Calibrated injections of an earlier calculation, keyed by node.
    pub warm_start: BTreeMap<NodeId, CurrentInjection>,
}

impl EquipmentSet {
    pub fn with_regulator(mut self, config: RegulatorConfig) -> Self {
        self.regulators.push(config);
        self
    }

    pub fn with_compensator(mut self, config: CompensatorConfig) -> Self {
        self.compensators.push(config);
        self
    }

    pub fn with_replacement(mut self, replacement: CableReplacement) -> Self {
        self.cable_replacements.push(replacement);
        self
    }
}

/// Per-call view of a network and its equipment, with every device either
/// retained or given the reason it was left out.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub network: Network,
    pub regulators: Vec<(RegulatorConfig, DeviceStatus)>,
    pub compensators: Vec<(CompensatorConfig, DeviceStatus)>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Copies the network with the cable replacements applied, validates the
/// devices and resolves node conflicts. Nothing here fails: problems end up
/// as diagnostics and device statuses.
pub fn prepare(network: &Network, equipment: &EquipmentSet) -> Prepared {
    let mut network = network.clone();
    let mut diagnostics = Vec::new();

    for rep in &equipment.cable_replacements {
        if network.cable_type(&rep.cable_type).is_none() {
            log::warn!(
                "cable \"{}\": replacement type \"{}\" is not in the catalog",
                rep.cable,
                rep.cable_type
            );
            diagnostics.push(Diagnostic::UnknownCableType {
                cable: rep.cable.clone(),
                cable_type: rep.cable_type.clone(),
            });
            continue;
        }
        match network.cables.iter_mut().find(|c| c.id == rep.cable) {
            Some(cable) => {
                log::debug!(
                    "cable \"{}\": {} replaced by {}",
                    cable.id,
                    cable.cable_type,
                    rep.cable_type
                );
                cable.cable_type = rep.cable_type.clone();
            }
            None => {
                log::warn!("replacement for unknown cable \"{}\"", rep.cable);
                diagnostics.push(Diagnostic::UnknownCable {
                    cable: rep.cable.clone(),
                });
            }
        }
    }

    let mut regulated: BTreeMap<NodeId, String> = BTreeMap::new();
    let mut regulators = Vec::with_capacity(equipment.regulators.len());
    for cfg in &equipment.regulators {
        let status = match check_device(&network, &cfg.id, &cfg.node, cfg.validate()) {
            Err((status, diag)) => {
                diagnostics.push(diag);
                status
            }
            Ok(()) => match regulated.get(&cfg.node) {
                Some(kept) => {
                    diagnostics.push(conflict(&cfg.node, kept, &cfg.id));
                    DeviceStatus::Suppressed(format!("node already regulated by {}", kept))
                }
                None => {
                    regulated.insert(cfg.node.clone(), cfg.id.clone());
                    DeviceStatus::Active
                }
            },
        };
        regulators.push((cfg.clone(), status));
    }

    let mut compensated: BTreeSet<&str> = BTreeSet::new();
    let mut compensators = Vec::with_capacity(equipment.compensators.len());
    for cfg in &equipment.compensators {
        let status = match check_device(&network, &cfg.id, &cfg.node, cfg.validate()) {
            Err((status, diag)) => {
                diagnostics.push(diag);
                status
            }
            Ok(()) => {
                if let Some(kept) = regulated.get(&cfg.node) {
                    diagnostics.push(conflict(&cfg.node, kept, &cfg.id));
                    DeviceStatus::Suppressed(format!("regulator {} at the same node", kept))
                } else if !compensated.insert(cfg.node.as_str()) {
                    diagnostics.push(Diagnostic::Conflict {
                        node: cfg.node.clone(),
                        kept: "an earlier compensator".to_string(),
                        suppressed: cfg.id.clone(),
                    });
                    DeviceStatus::Suppressed("node already compensated".to_string())
                } else {
                    DeviceStatus::Active
                }
            }
        };
        compensators.push((cfg.clone(), status));
    }

    Prepared {
        network,
        regulators,
        compensators,
        diagnostics,
    }
}

fn check_device(
    network: &Network,
    id: &str,
    node: &str,
    validation: Result<(), String>,
) -> Result<(), (DeviceStatus, Diagnostic)> {
    if network.node(node).is_none() {
        log::warn!("{}: node \"{}\" not found, skipped", id, node);
        return Err((
            DeviceStatus::Skipped(format!("node \"{}\" not found", node)),
            Diagnostic::MissingNode {
                device: id.to_string(),
                node: node.to_string(),
            },
        ));
    }
    if let Err(reason) = validation {
        log::warn!("{}: {}, skipped", id, reason);
        return Err((
            DeviceStatus::Skipped(reason.clone()),
            Diagnostic::InvalidConfig {
                device: id.to_string(),
                reason,
            },
        ));
    }
    Ok(())
}

fn conflict(node: &str, kept: &str, suppressed: &str) -> Diagnostic {
    log::warn!(
        "node \"{}\": {} suppressed, {} takes priority",
        node,
        suppressed,
        kept
    );
    Diagnostic::Conflict {
        node: node.to_string(),
        kept: kept.to_string(),
        suppressed: suppressed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Cable, CableType, Node};
    use anyhow::Result;

    fn network() -> Network {
        let ct = |id: &str, r: f64| CableType {
            id: id.to_string(),
            r_phase: r,
            x_phase: 0.08,
            r_neutral: r,
            x_neutral: 0.08,
            max_current: 200.0,
        };
        Network {
            nodes: vec![Node::new_source("src", 230.0), Node::new("n1"), Node::new("n2")],
            cables: vec![
                Cable::new("c1", "src", "n1", "al95", 100.0),
                Cable::new("c2", "n1", "n2", "al95", 100.0),
            ],
            cable_types: vec![ct("al95", 0.32), ct("al150", 0.206)],
            ..Default::default()
        }
    }

    #[test]
    fn replacements_apply_to_a_copy() {
        let net = network();
        let eq = EquipmentSet::default()
            .with_replacement(CableReplacement::new("c2", "al150"))
            .with_replacement(CableReplacement::new("c9", "al150"))
            .with_replacement(CableReplacement::new("c1", "cu240"));
        let prep = prepare(&net, &eq);
        assert_eq!(prep.network.cables[1].cable_type, "al150");
        assert_eq!(prep.network.cables[0].cable_type, "al95");
        assert_eq!(net.cables[1].cable_type, "al95");
        assert_eq!(prep.diagnostics.len(), 2);
    }

    #[test]
    fn regulator_wins_node_conflict() -> Result<()> {
        let eq = EquipmentSet::default()
            .with_compensator(CompensatorConfig::new("comp", "n2").build()?)
            .with_regulator(RegulatorConfig::srg2_400("reg", "n2").build()?);
        let prep = prepare(&network(), &eq);
        assert!(prep.regulators[0].1.is_active());
        assert!(matches!(prep.compensators[0].1, DeviceStatus::Suppressed(_)));
        assert!(prep
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::Conflict { suppressed, .. } if suppressed == "comp")));
        Ok(())
    }

    #[test]
    fn missing_node_and_invalid_config_are_skipped() -> Result<()> {
        let mut bad = CompensatorConfig::new("bad", "n1").build()?;
        bad.max_power_kva = -5.0;
        let eq = EquipmentSet::default()
            .with_regulator(RegulatorConfig::srg2_400("reg", "nowhere").build()?)
            .with_compensator(bad);
        let prep = prepare(&network(), &eq);
        assert!(matches!(prep.regulators[0].1, DeviceStatus::Skipped(_)));
        assert!(matches!(prep.compensators[0].1, DeviceStatus::Skipped(_)));
        assert!(matches!(prep.diagnostics[0], Diagnostic::MissingNode { .. }));
        assert!(matches!(prep.diagnostics[1], Diagnostic::InvalidConfig { .. }));
        Ok(())
    }

    #[test]
    fn second_device_on_a_node_is_suppressed() -> Result<()> {
        let eq = EquipmentSet::default()
            .with_compensator(CompensatorConfig::new("a", "n1").build()?)
            .with_compensator(CompensatorConfig::new("b", "n1").build()?)
            .with_regulator(RegulatorConfig::srg2_400("r1", "n2").build()?)
            .with_regulator(RegulatorConfig::srg2_230("r2", "n2").build()?);
        let prep = prepare(&network(), &eq);
        let active = |s: &[DeviceStatus]| s.iter().filter(|s| s.is_active()).count();
        let comp: Vec<_> = prep.compensators.iter().map(|(_, s)| s.clone()).collect();
        let regs: Vec<_> = prep.regulators.iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(active(&comp), 1);
        assert_eq!(active(&regs), 1);
        assert!(prep.regulators[0].1.is_active());
        assert!(matches!(prep.regulators[1].1, DeviceStatus::Suppressed(_)));
        Ok(())
    }
}
