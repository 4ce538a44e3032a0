//! Undirected weighted interconnect graph.
//!
//! A [`Graph`] is filled in once by its builder (`add_node` / `add_edge`) and
//! then published behind an `Arc`. Structural edits after that point
//! (`delete_node`, `delete_nodes`, `select_nodes`) never touch the receiver;
//! they rebuild and return a new graph.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

/// Bridge value reported for subsets that contain no pair at all.
pub const SINGLE_NODE_BRIDGE_VALUE: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Neighbor {
    name: String,
    weight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<Neighbor>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node; adding an existing name is a no-op.
    pub fn add_node(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.nodes.push(name);
        }
    }

    /// Inserts the undirected edge `u - v` with `weight`.
    ///
    /// Returns `false` without touching the graph when the pair is already
    /// connected, when `u == v`, or when either endpoint is not a node.
    pub fn add_edge(&mut self, u: &str, v: &str, weight: u64) -> bool {
        if u == v || !self.contains(u) || !self.contains(v) || self.weight(u, v).is_some() {
            return false;
        }
        self.edges.entry(u.to_string()).or_default().push(Neighbor {
            name: v.to_string(),
            weight,
        });
        self.edges.entry(v.to_string()).or_default().push(Neighbor {
            name: u.to_string(),
            weight,
        });
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// Node names in insertion order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum::<usize>() / 2
    }

    pub fn weight(&self, u: &str, v: &str) -> Option<u64> {
        self.edges
            .get(u)?
            .iter()
            .find(|n| n.name == v)
            .map(|n| n.weight)
    }

    /// Returns a copy of the graph without `name` and its incident edges.
    pub fn delete_node(&self, name: &str) -> Graph {
        self.delete_nodes([name])
    }

    /// Returns a copy of the graph without `names` and their incident edges.
    pub fn delete_nodes<I, S>(&self, names: I) -> Graph
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: HashSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let nodes = self
            .nodes
            .iter()
            .filter(|n| !removed.contains(*n))
            .cloned()
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|(name, _)| !removed.contains(*name))
            .map(|(name, neighbors)| {
                let kept = neighbors
                    .iter()
                    .filter(|n| !removed.contains(&n.name))
                    .cloned()
                    .collect::<Vec<_>>();
                (name.clone(), kept)
            })
            .filter(|(_, neighbors)| !neighbors.is_empty())
            .collect();
        Graph { nodes, edges }
    }

    /// Induced subgraph over `names ∩ nodes`, built by deleting the complement.
    pub fn select_nodes<I, S>(&self, names: I) -> Graph
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: HashSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let complement = self.nodes.iter().filter(|n| !keep.contains(*n));
        self.delete_nodes(complement)
    }

    /// Sum of edge weights over all unordered member pairs.
    ///
    /// Pairs without an edge contribute nothing; subsets with fewer than two
    /// members have the fixed value [`SINGLE_NODE_BRIDGE_VALUE`].
    pub fn bridge_value<S: AsRef<str>>(&self, subset: &[S]) -> u64 {
        if subset.len() <= 1 {
            return SINGLE_NODE_BRIDGE_VALUE;
        }
        let mut value = 0;
        for (i, u) in subset.iter().enumerate() {
            for v in &subset[i + 1..] {
                value += self.weight(u.as_ref(), v.as_ref()).unwrap_or(0);
            }
        }
        value
    }
}

/// Trailing number of a node name (`card_12` -> 12), used to order output.
fn numeric_suffix(name: &str) -> Option<u64> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    name[name.len() - digits..].parse().ok()
}

/// Renders one line per node, neighbors ordered by numeric suffix and
/// annotated with their edge weight. Meant for logs only.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{node} ->")?;
            let mut neighbors: Vec<&Neighbor> =
                self.edges.get(node).map(|n| n.iter().collect()).unwrap_or_default();
            neighbors.sort_by(|a, b| {
                numeric_suffix(&a.name)
                    .cmp(&numeric_suffix(&b.name))
                    .then_with(|| a.name.cmp(&b.name))
            });
            for neighbor in neighbors {
                write!(f, " {}({})", neighbor.name, neighbor.weight)?;
            }
        }
        Ok(())
    }
}
