use crate::network::{Client, Connection, Node};
use crate::opt::LoadModel;
use crate::phasor::{Phase, PerPhase};

/// Per-phase power of one node, before demand scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseLoads {
    /// Load per phase (kVA).
    pub load: PerPhase<f64>,

    /// Production per phase (kVA).
    pub production: PerPhase<f64>,

    /// Largest deviation of a phase from the three-phase mean of combined
    /// load and production (%).
    pub imbalance_percent: f64,

    /// Phase of every single-phase client, in declaration order.
    pub assignments: Vec<(String, Phase)>,
}

impl PhaseLoads {
    fn empty() -> Self {
        Self {
            load: PerPhase::zero(),
            production: PerPhase::zero(),
            imbalance_percent: 0.0,
            assignments: Vec::new(),
        }
    }

    fn add(&mut self, shares: &PerPhase<f64>, load: f64, production: f64) {
        for p in Phase::ALL {
            self.load[p] += load * shares[p];
            self.production[p] += production * shares[p];
        }
    }

    fn combined(&self) -> PerPhase<f64> {
        self.load.zip(&self.production, |l, g| l + g)
    }
}

/// Turns a percentage vector into fractions summing to one.
///
/// Vectors that cannot be normalised fall back to an equal split.
pub fn shares(split: &PerPhase<f64>) -> PerPhase<f64> {
    let total = split.sum();
    let valid = split.is_finite() && split.0.iter().all(|&v| v >= 0.0) && total > 0.0;
    if !valid {
        log::warn!(
            "phase split [{}, {}, {}] is not usable, splitting equally",
            split[Phase::A],
            split[Phase::B],
            split[Phase::C]
        );
        return PerPhase::splat(1.0 / 3.0);
    }
    split.map(|v| v / total)
}

/// Measured imbalance: largest deviation from the mean, in percent of it.
pub fn imbalance_percent(per_phase: &PerPhase<f64>) -> f64 {
    let mean = per_phase.mean();
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    per_phase
        .0
        .iter()
        .map(|v| (v - mean).abs())
        .fold(0.0, f64::max)
        / mean.abs()
        * 100.0
}

/// Phase carrying least power. Ties go to the lowest phase.
fn least_loaded(per_phase: &PerPhase<f64>) -> Phase {
    let mut best = Phase::A;
    for p in [Phase::B, Phase::C] {
        if per_phase[p] < per_phase[best] {
            best = p;
        }
    }
    best
}

/// Decomposes the power of a node into per-phase contributions.
///
/// `balancing` is the network-wide distribution (percent) of polyphase
/// clients. Aggregated node power follows the node's own manual split, equal
/// when absent. Single-phase clients without a phase are put on the phase
/// currently carrying least combined power, in declaration order, after every
/// fixed contribution has been placed.
pub fn distribute<'a, I>(
    node: &Node,
    clients: I,
    load_model: LoadModel,
    balancing: &PerPhase<f64>,
) -> PhaseLoads
where
    I: IntoIterator<Item = &'a Client>,
{
    let equal = PerPhase::splat(1.0 / 3.0);
    let mut out = PhaseLoads::empty();
    let clients: Vec<&Client> = clients.into_iter().collect();

    if load_model == LoadModel::Balanced {
        out.add(&equal, node.total_load(), node.total_production());
        for c in &clients {
            out.add(&equal, c.load_kva, c.production_kva);
        }
        out.imbalance_percent = imbalance_percent(&out.combined());
        return out;
    }

    let node_shares = node.phase_split.as_ref().map(shares).unwrap_or(equal);
    out.add(&node_shares, node.total_load(), node.total_production());

    let poly_shares = shares(balancing);
    for c in clients.iter().filter(|c| c.connection == Connection::Polyphase) {
        out.add(&poly_shares, c.load_kva, c.production_kva);
    }

    // Fixed single-phase clients first so that automatic placement sees them.
    let mut placed: Vec<Option<Phase>> = vec![None; clients.len()];
    for (i, c) in clients.iter().enumerate() {
        if let Connection::SinglePhase(Some(p)) = c.connection {
            out.load[p] += c.load_kva;
            out.production[p] += c.production_kva;
            placed[i] = Some(p);
        }
    }
    for (i, c) in clients.iter().enumerate() {
        if let Connection::SinglePhase(None) = c.connection {
            let p = least_loaded(&out.combined());
            out.load[p] += c.load_kva;
            out.production[p] += c.production_kva;
            placed[i] = Some(p);
        }
    }
    out.assignments = clients
        .iter()
        .zip(placed)
        .filter_map(|(c, p)| p.map(|p| (c.id.clone(), p)))
        .collect();

    out.imbalance_percent = imbalance_percent(&out.combined());
    out
}
