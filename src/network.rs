use crate::phasor::{Phase, PerPhase};
use num_complex::Complex64;

pub type NodeId = String;
pub type CableId = String;

/// Nominal phase-to-neutral voltage of a European LV feeder (V).
pub const NOMINAL_VOLTAGE: f64 = 230.0;

/// Network models an LV feeder as a radial graph of nodes joined by cables.
///
/// Collections are plain vectors addressed by string ids. Nothing in this
/// crate mutates a `Network` that was handed to it.
#[derive(Debug, Clone)]
pub struct Network {
    /// Nominal phase-to-neutral voltage (V). Default value is 230.
    pub nominal_voltage: f64,

    pub nodes: Vec<Node>,

    pub cables: Vec<Cable>,

    /// Catalog of cable types referenced by `Cable::cable_type`.
    pub cable_types: Vec<CableType>,

    /// Clients linked to nodes.
    pub clients: Vec<Client>,

    /// MV/LV transformer feeding the source node.
    pub transformer: Option<Transformer>,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            nominal_voltage: NOMINAL_VOLTAGE,
            nodes: Vec::new(),
            cables: Vec::new(),
            cable_types: Vec::new(),
            clients: Vec::new(),
            transformer: None,
        }
    }
}

impl Network {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn cable(&self, id: &str) -> Option<&Cable> {
        self.cables.iter().find(|c| c.id == id)
    }

    pub fn cable_type(&self, id: &str) -> Option<&CableType> {
        self.cable_types.iter().find(|t| t.id == id)
    }

    /// Clients linked to the given node, in declaration order.
    pub fn clients_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Client> + 'a {
        self.clients.iter().filter(move |c| c.node == node)
    }

    /// Nodes flagged as sources.
    pub fn sources(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_source())
    }
}

/// Node is a connection point of the feeder. Aggregated loads and
/// productions are attached directly; clients reference the node by id.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub id: NodeId,

    /// Source target voltage, phase-to-neutral (V). `Some` on the single
    /// source node of the feeder.
    pub source: Option<f64>,

    /// Aggregated loads (kVA) not described as individual clients.
    pub loads: Vec<Attached>,

    /// Aggregated productions (kVA).
    pub productions: Vec<Attached>,

    /// Manual distribution of the aggregated loads and productions
    /// over the phases, in percent.
    pub phase_split: Option<PerPhase<f64>>,
}

impl Node {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn new_source(id: &str, voltage: f64) -> Self {
        Self {
            id: id.to_string(),
            source: Some(voltage),
            ..Default::default()
        }
    }

    pub fn with_load(mut self, label: &str, kva: f64) -> Self {
        self.loads.push(Attached::new(label, kva));
        self
    }

    pub fn with_production(mut self, label: &str, kva: f64) -> Self {
        self.productions.push(Attached::new(label, kva));
        self
    }

    pub fn with_phase_split(mut self, split: PerPhase<f64>) -> Self {
        self.phase_split = Some(split);
        self
    }

    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn total_load(&self) -> f64 {
        self.loads.iter().map(|l| l.kva).sum()
    }

    pub fn total_production(&self) -> f64 {
        self.productions.iter().map(|p| p.kva).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attached {
    pub label: String,

    /// Contractual apparent power (kVA).
    pub kva: f64,
}

impl Attached {
    pub fn new(label: &str, kva: f64) -> Self {
        Self {
            label: label.to_string(),
            kva,
        }
    }
}

/// CableType defines per-unit-length impedances of a conductor family.
#[derive(Debug, Clone, Default)]
pub struct CableType {
    pub id: String,

    /// Phase conductor resistance (Ω/km).
    pub r_phase: f64,

    /// Phase conductor reactance (Ω/km).
    pub x_phase: f64,

    /// Neutral conductor resistance (Ω/km).
    pub r_neutral: f64,

    /// Neutral conductor reactance (Ω/km).
    pub x_neutral: f64,

    /// Permissible current (A).
    pub max_current: f64,
}

impl CableType {
    pub fn z_phase(&self, length_m: f64) -> Complex64 {
        Complex64::new(self.r_phase, self.x_phase) * (length_m / 1000.0)
    }

    pub fn z_neutral(&self, length_m: f64) -> Complex64 {
        Complex64::new(self.r_neutral, self.x_neutral) * (length_m / 1000.0)
    }
}

/// Cable joins two nodes. `from` is expected on the source side but the
/// orientation is recovered from the topology either way.
#[derive(Debug, Clone, Default)]
pub struct Cable {
    pub id: CableId,
    pub from: NodeId,
    pub to: NodeId,
    pub cable_type: String,

    /// Length (m).
    pub length_m: f64,
}

impl Cable {
    pub fn new(id: &str, from: &str, to: &str, cable_type: &str, length_m: f64) -> Self {
        Self {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            cable_type: cable_type.to_string(),
            length_m,
        }
    }

    /// The node at the other end of the cable.
    pub fn other(&self, node: &str) -> Option<&str> {
        if self.from == node {
            Some(self.to.as_str())
        } else if self.to == node {
            Some(self.from.as_str())
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Connection {
    /// Phase-to-neutral connection. `None` lets the distribution pick
    /// the least loaded phase.
    SinglePhase(Option<Phase>),
    /// Three-phase connection.
    Polyphase,
}

/// Client is a delivery point with a contractual load and production.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub node: NodeId,
    pub connection: Connection,

    /// Contractual load (kVA).
    pub load_kva: f64,

    /// Contractual production (kVA).
    pub production_kva: f64,
}

impl Client {
    pub fn single_phase(id: &str, node: &str, phase: Option<Phase>, load_kva: f64) -> Self {
        Self {
            id: id.to_string(),
            node: node.to_string(),
            connection: Connection::SinglePhase(phase),
            load_kva,
            production_kva: 0.0,
        }
    }

    pub fn polyphase(id: &str, node: &str, load_kva: f64) -> Self {
        Self {
            id: id.to_string(),
            node: node.to_string(),
            connection: Connection::Polyphase,
            load_kva,
            production_kva: 0.0,
        }
    }

    pub fn with_production(mut self, kva: f64) -> Self {
        self.production_kva = kva;
        self
    }
}

/// Transformer is the MV/LV transformer behind the source node.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    /// Rated power (kVA).
    pub rated_kva: f64,

    /// Short-circuit voltage (%).
    pub ucc_percent: f64,

    /// Reactance to resistance ratio of the short-circuit impedance.
    pub x_over_r: f64,
}

impl Transformer {
    pub fn new(rated_kva: f64, ucc_percent: f64) -> Self {
        Self {
            rated_kva,
            ucc_percent,
            x_over_r: 2.0,
        }
    }

    /// Per-phase short-circuit impedance seen from the LV side (Ω).
    pub fn impedance(&self, nominal_voltage: f64) -> Complex64 {
        if self.rated_kva <= 0.0 {
            return Complex64::default();
        }
        let u_ll = nominal_voltage * 3f64.sqrt();
        let z = self.ucc_percent / 100.0 * u_ll * u_ll / (self.rated_kva * 1000.0);
        let r = z / (1.0 + self.x_over_r * self.x_over_r).sqrt();
        Complex64::new(r, r * self.x_over_r)
    }
}
