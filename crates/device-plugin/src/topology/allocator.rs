//! Preferred-allocation solvers over a [`Graph`].

use super::graph::Graph;

/// Picks which `size` devices out of a topology graph to prefer.
pub trait Allocator: Send + Sync {
    /// Returns the preferred device names, or an empty list for "no preference".
    fn preferred(&self, graph: &Graph, must_include: &[String], size: i32) -> Vec<String>;
}

/// Exhaustive max-weight subset search.
///
/// Enumerates every `size`-combination of the graph's nodes and keeps the one
/// with the strictly greatest bridge value; ties go to the combination that is
/// generated first (lexicographic over node insertion order). The cost grows
/// with `C(n, size)`, which stays small for the number of accelerators on a
/// single machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAllocator;

impl ExactAllocator {
    /// Best subset of `size` nodes and its bridge value.
    pub fn max_bridge_subset(graph: &Graph, size: usize) -> Option<(u64, Vec<String>)> {
        let nodes = graph.nodes();
        if size < 1 {
            return None;
        }
        if nodes.len() == 1 {
            return Some((graph.bridge_value(nodes), nodes.to_vec()));
        }
        if size > nodes.len() {
            return None;
        }

        let weights: Vec<Vec<u64>> = nodes
            .iter()
            .map(|u| {
                nodes
                    .iter()
                    .map(|v| graph.weight(u, v).unwrap_or(0))
                    .collect()
            })
            .collect();

        let mut best: Option<(u64, Vec<usize>)> = None;
        for combination in Combinations::new(nodes.len(), size) {
            let value = if size == 1 {
                graph.bridge_value(&[&nodes[combination[0]]])
            } else {
                pair_sum(&weights, &combination)
            };
            if best.as_ref().map_or(true, |(top, _)| value > *top) {
                best = Some((value, combination));
            }
        }

        best.map(|(value, indices)| {
            let names = indices.into_iter().map(|i| nodes[i].clone()).collect();
            (value, names)
        })
    }
}

fn pair_sum(weights: &[Vec<u64>], members: &[usize]) -> u64 {
    let mut sum = 0;
    for (i, &u) in members.iter().enumerate() {
        for &v in &members[i + 1..] {
            sum += weights[u][v];
        }
    }
    sum
}

impl Allocator for ExactAllocator {
    fn preferred(&self, graph: &Graph, must_include: &[String], size: i32) -> Vec<String> {
        if !must_include.is_empty() {
            tracing::warn!(
                ?must_include,
                "must-include devices are not honoured by the topology allocator"
            );
        }
        let size = usize::try_from(size).unwrap_or(0);
        let selected = Self::max_bridge_subset(graph, size)
            .map(|(_, names)| names)
            .unwrap_or_default();
        tracing::info!("Select devices: {:?} from topo:\n{}", selected, graph);
        selected
    }
}

/// Lexicographic `k`-combinations of `0..n`.
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            done: k == 0 || k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();

        let k = self.indices.len();
        // rightmost position that can still move forward
        match (0..k).rev().find(|&i| self.indices[i] < self.n - k + i) {
            Some(i) => {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
            }
            None => self.done = true,
        }
        Some(current)
    }
}
