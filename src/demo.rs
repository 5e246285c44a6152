use crate::compensator::{CompensatorConfig, ThermalWindow};
use crate::network::{Cable, CableType, Client, Network, Node, Transformer};
use crate::phasor::{Phase, PerPhase};
use crate::regulator::RegulatorConfig;
use anyhow::Result;

/// Four-node rural feeder whose far end sags on phase B.
///
/// ```text
/// src --10 m-- n1 --300 m-- n2 --200 m-- n3
/// ```
///
/// The heavy phase B load at `n2` and `n3` pulls that phase well under the
/// regulator's boost thresholds and shifts the neutral.
pub fn sample_feeder() -> Network {
    Network {
        nodes: vec![
            Node::new_source("src", 230.0),
            Node::new("n1"),
            Node::new("n2")
                .with_load("hamlet", 30.0)
                .with_phase_split(PerPhase::new(1.0, 3.0, 1.0)),
            Node::new("n3")
                .with_load("farm", 18.0)
                .with_phase_split(PerPhase::new(1.0, 4.0, 1.0)),
        ],
        cables: vec![
            Cable::new("c1", "src", "n1", "al95", 10.0),
            Cable::new("c2", "n1", "n2", "al95", 300.0),
            Cable::new("c3", "n2", "n3", "al95", 200.0),
        ],
        cable_types: vec![
            CableType {
                id: "al95".to_string(),
                r_phase: 0.32,
                x_phase: 0.08,
                r_neutral: 0.32,
                x_neutral: 0.08,
                max_current: 170.0,
            },
            CableType {
                id: "al150".to_string(),
                r_phase: 0.206,
                x_phase: 0.08,
                r_neutral: 0.206,
                x_neutral: 0.08,
                max_current: 230.0,
            },
        ],
        clients: vec![
            Client::polyphase("bakery", "n1", 6.0),
            Client::single_phase("pv-farm", "n3", Some(Phase::A), 0.0).with_production(3.0),
        ],
        transformer: Some(Transformer::new(400.0, 4.0)),
        ..Default::default()
    }
}

/// 400 V regulator at the middle of the sample feeder.
pub fn sample_regulator() -> Result<RegulatorConfig> {
    Ok(RegulatorConfig::srg2_400("srg2", "n2").build()?)
}

/// Compensator at the end of the sample feeder.
pub fn sample_compensator() -> Result<CompensatorConfig> {
    Ok(CompensatorConfig::new("cme", "n3")
        .window(ThermalWindow::Minutes15)
        .build()?)
}
