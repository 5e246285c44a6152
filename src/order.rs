use crate::network::Network;
use anyhow::{format_err, Result};
use std::collections::{HashMap, VecDeque};

/// Radial ordering of a feeder.
///
/// Maps external node ids to consecutive internal indices and records, for
/// every node reachable from the source, the node and cable feeding it.
#[derive(Debug, Clone)]
pub struct Order {
    pub e2i: HashMap<String, usize>,
    pub i2e: Vec<String>,

    /// Internal index of the source node.
    pub source: usize,

    /// `(parent node, cable)` feeding each node; `None` for the source and
    /// for unreachable nodes.
    pub parent: Vec<Option<(usize, usize)>>,

    /// Reachable nodes, source first, every node after its parent.
    pub sweep: Vec<usize>,

    pub unreachable: Vec<usize>,
}

impl Order {
    pub fn index(&self, id: &str) -> Option<usize> {
        self.e2i.get(id).copied()
    }

    pub fn is_reachable(&self, i: usize) -> bool {
        i == self.source || self.parent[i].is_some()
    }
}

/// Orders a feeder from its single source node.
///
/// Fails when the network has no source, several sources, cables pointing at
/// unknown nodes, or a loop. Nodes that cannot be reached are listed in
/// `Order::unreachable`.
pub fn radial_order(network: &Network) -> Result<Order> {
    let nb = network.nodes.len();
    let mut e2i = HashMap::with_capacity(nb);
    let mut i2e = Vec::with_capacity(nb);
    for (i, node) in network.nodes.iter().enumerate() {
        if e2i.insert(node.id.clone(), i).is_some() {
            return Err(format_err!("duplicate node id \"{}\"", node.id));
        }
        i2e.push(node.id.clone());
    }

    let sources: Vec<usize> = network
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_source())
        .map(|(i, _)| i)
        .collect();
    let source = match sources.as_slice() {
        [s] => *s,
        [] => return Err(format_err!("network has no source node")),
        _ => {
            return Err(format_err!(
                "network has {} source nodes, expected exactly one",
                sources.len()
            ))
        }
    };

    let mut adjacency: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nb];
    for (k, cable) in network.cables.iter().enumerate() {
        let f = *e2i
            .get(&cable.from)
            .ok_or_else(|| format_err!("cable \"{}\": unknown node \"{}\"", cable.id, cable.from))?;
        let t = *e2i
            .get(&cable.to)
            .ok_or_else(|| format_err!("cable \"{}\": unknown node \"{}\"", cable.id, cable.to))?;
        if f == t {
            return Err(format_err!(
                "cable \"{}\" connects node \"{}\" to itself",
                cable.id,
                cable.from
            ));
        }
        adjacency[f].push((t, k));
        adjacency[t].push((f, k));
    }

    let mut parent: Vec<Option<(usize, usize)>> = vec![None; nb];
    let mut visited = vec![false; nb];
    let mut sweep = Vec::with_capacity(nb);
    let mut queue = VecDeque::from([source]);
    visited[source] = true;

    while let Some(i) = queue.pop_front() {
        sweep.push(i);
        let feeding = parent[i].map(|(_, k)| k);
        for &(j, k) in &adjacency[i] {
            if Some(k) == feeding {
                continue;
            }
            if visited[j] {
                return Err(format_err!(
                    "network is not radial: cable \"{}\" closes a loop at node \"{}\"",
                    network.cables[k].id,
                    i2e[j]
                ));
            }
            visited[j] = true;
            parent[j] = Some((i, k));
            queue.push_back(j);
        }
    }

    let unreachable: Vec<usize> = (0..nb).filter(|&i| !visited[i]).collect();
    for &i in &unreachable {
        log::warn!("node \"{}\" is not connected to the source", i2e[i]);
    }

    Ok(Order {
        e2i,
        i2e,
        source,
        parent,
        sweep,
        unreachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Cable, Node};

    fn chain() -> Network {
        Network {
            nodes: vec![
                Node::new("n2"),
                Node::new_source("src", 230.0),
                Node::new("n1"),
                Node::new("n3"),
                Node::new("island"),
            ],
            cables: vec![
                Cable::new("c1", "src", "n1", "t", 10.0),
                // reversed orientation on purpose
                Cable::new("c2", "n2", "n1", "t", 10.0),
                Cable::new("c3", "n1", "n3", "t", 10.0),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn orders_from_source() -> Result<()> {
        let net = chain();
        let order = radial_order(&net)?;
        assert_eq!(order.i2e[order.source], "src");
        assert_eq!(order.sweep.first(), Some(&order.source));

        let n1 = order.index("n1").unwrap();
        let n2 = order.index("n2").unwrap();
        let n3 = order.index("n3").unwrap();
        assert_eq!(order.parent[n1], Some((order.source, 0)));
        assert_eq!(order.parent[n2], Some((n1, 1)));
        assert_eq!(order.parent[n3], Some((n1, 2)));

        let island = order.index("island").unwrap();
        assert_eq!(order.unreachable, vec![island]);
        assert!(!order.is_reachable(island));
        Ok(())
    }

    #[test]
    fn rejects_loops() {
        let mut net = chain();
        net.cables.push(Cable::new("c4", "n2", "n3", "t", 10.0));
        let err = radial_order(&net).unwrap_err();
        assert!(err.to_string().contains("not radial"));
    }

    #[test]
    fn rejects_missing_source() {
        let mut net = chain();
        net.nodes[1].source = None;
        assert!(radial_order(&net).is_err());
    }

    #[test]
    fn rejects_unknown_node() {
        let mut net = chain();
        net.cables.push(Cable::new("c5", "n3", "nowhere", "t", 10.0));
        assert!(radial_order(&net).is_err());
    }
}
