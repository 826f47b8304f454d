//! Hierarchical Navigable Small World graph for approximate nearest neighbours.
//!
//! # Structure
//! Nodes live in a slab; slots freed by deletes are reused by later inserts,
//! so the slab never grows past the peak number of live nodes. A node of
//! level `ℓ` is present on every layer `0..=ℓ` and keeps one neighbour list
//! per layer. Lists are capped at `M` above layer 0 and `M₀` on layer 0.
//! The first insert pins the vector dimension.
//!
//! # Invariants after every insert
//! - Edges are symmetric: `b ∈ N_ℓ(a) ⇔ a ∈ N_ℓ(b)`.
//! - When a new link pushes a list over its cap, the list is pruned to the
//!   closest neighbours (distance, then slot) and the reverse
//!   edge of every dropped link is removed as well.
//!
//! Navigation uses Euclidean distance `d`; reported similarity is `1 − d`,
//! clamped to [0, 1]. For unit vectors `d ∈ [0, 2]`, so anything farther
//! than distance 1 reports 0.

use crate::vector::types::{
    Score, SharedVector, VectorDimension, VectorError, VectorMatch, euclidean_distance,
};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// HNSW construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    pub m: usize,
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layers: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            max_layers: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    vector: SharedVector,
    level: usize,
    neighbors: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Default)]
struct Graph {
    nodes: Vec<Option<Node>>,
    /// Empty slots, reused before the slab grows
    free: Vec<usize>,
    by_id: HashMap<String, usize>,
    entry: Option<usize>,
    dimension: Option<VectorDimension>,
}

impl Graph {
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling HNSW link to slot {idx}"))
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling HNSW link to slot {idx}"))
    }

    fn distance(&self, idx: usize, query: &[f32]) -> f32 {
        euclidean_distance(&self.node(idx).vector, query)
    }

    /// Move to the closest neighbour on `layer` until no improvement.
    fn greedy_closest(&self, mut current: usize, query: &[f32], layer: usize) -> usize {
        let mut current_dist = self.distance(current, query);
        loop {
            let mut improved = false;
            for &n in &self.node(current).neighbors[layer] {
                let d = self.distance(n, query);
                if d < current_dist {
                    current = n;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` candidates sorted by distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = Candidate {
                    dist: self.distance(ep, query),
                    idx: ep,
                };
                candidates.push(Reverse(c));
                best.push(c);
            }
        }

        while let Some(Reverse(nearest)) = candidates.pop() {
            let farthest = best.peek().map_or(f32::INFINITY, |c| c.dist);
            if nearest.dist > farthest && best.len() >= ef {
                break;
            }
            for &n in &self.node(nearest.idx).neighbors[layer] {
                if !visited.insert(n) {
                    continue;
                }
                let d = self.distance(n, query);
                let farthest = best.peek().map_or(f32::INFINITY, |c| c.dist);
                if best.len() < ef || d < farthest {
                    let c = Candidate { dist: d, idx: n };
                    candidates.push(Reverse(c));
                    best.push(c);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Keep the `cap` closest links of `idx` on `layer`; drop the rest both ways.
    fn prune(&mut self, idx: usize, layer: usize, cap: usize) {
        if self.node(idx).neighbors[layer].len() <= cap {
            return;
        }
        let base = self.node(idx).vector.clone();
        let mut ranked: Vec<Candidate> = self.node(idx).neighbors[layer]
            .iter()
            .map(|&n| Candidate {
                dist: self.distance(n, &base),
                idx: n,
            })
            .collect();
        ranked.sort();
        let dropped: Vec<usize> = ranked[cap..].iter().map(|c| c.idx).collect();
        self.node_mut(idx).neighbors[layer] = ranked[..cap].iter().map(|c| c.idx).collect();
        for n in dropped {
            self.node_mut(n).neighbors[layer].retain(|&x| x != idx);
        }
    }

    fn place(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove(&mut self, idx: usize) {
        let Some(node) = self.nodes[idx].take() else {
            return;
        };
        self.free.push(idx);
        self.by_id.remove(&node.id);
        for (layer, links) in node.neighbors.iter().enumerate() {
            for &n in links {
                if let Some(other) = self.nodes[n].as_mut() {
                    other.neighbors[layer].retain(|&x| x != idx);
                }
            }
        }
        if self.entry == Some(idx) {
            // Highest level wins; the lower slot breaks ties.
            self.entry = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i, n.level)))
                .fold(None, |best: Option<(usize, usize)>, (i, level)| match best {
                    Some((_, best_level)) if best_level >= level => best,
                    _ => Some((i, level)),
                })
                .map(|(i, _)| i);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist: f32,
    idx: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.idx.cmp(&other.idx))
    }
}

/// Per-layer graph statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStats {
    pub layer: usize,
    pub nodes: usize,
    pub avg_degree: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HnswStats {
    pub node_count: usize,
    pub max_level: usize,
    pub layers: Vec<LayerStats>,
}

/// Thread-safe HNSW index. Search takes the read lock, mutation the write lock.
#[derive(Debug)]
pub struct HnswIndex {
    params: HnswParams,
    graph: RwLock<Graph>,
    rng: Mutex<StdRng>,
}

impl Clone for HnswIndex {
    fn clone(&self) -> Self {
        Self {
            params: self.params,
            graph: RwLock::new(self.graph.read().clone()),
            rng: Mutex::new(self.rng.lock().clone()),
        }
    }
}

impl HnswIndex {
    #[must_use]
    pub fn new(params: HnswParams) -> Self {
        Self::with_rng(params, StdRng::from_os_rng())
    }

    /// Reproducible level assignment for tests and benchmarks.
    #[must_use]
    pub fn with_seed(params: HnswParams, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }

    fn with_rng(params: HnswParams, rng: StdRng) -> Self {
        Self {
            params,
            graph: RwLock::new(Graph::default()),
            rng: Mutex::new(rng),
        }
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    fn random_level(&self) -> usize {
        let threshold = 1.0 - 1.0 / (self.params.m.max(2) as f64).ln();
        let cap = self.params.max_layers.saturating_sub(1);
        let mut rng = self.rng.lock();
        let mut level = 0;
        while level < cap && rng.random::<f64>() < threshold {
            level += 1;
        }
        level
    }

    /// Insert a vector, replacing any node with the same id.
    pub fn insert(&self, id: &str, vector: SharedVector) -> Result<(), VectorError> {
        if vector.is_empty() {
            return Err(VectorError::EmptyVector(id.to_string()));
        }
        let level = self.random_level();
        let mut graph = self.graph.write();
        let dimension = match graph.dimension {
            Some(dimension) => dimension,
            None => VectorDimension::new(vector.len())?,
        };
        dimension.validate_vector(&vector)?;
        graph.dimension = Some(dimension);

        if let Some(&old) = graph.by_id.get(id) {
            graph.remove(old);
        }

        let idx = graph.place(Node {
            id: id.to_string(),
            vector: vector.clone(),
            level,
            neighbors: vec![Vec::new(); level + 1],
        });
        graph.by_id.insert(id.to_string(), idx);

        let Some(entry) = graph.entry else {
            graph.entry = Some(idx);
            return Ok(());
        };

        let entry_level = graph.node(entry).level;
        let mut ep = entry;
        for layer in (level + 1..=entry_level).rev() {
            ep = graph.greedy_closest(ep, &vector, layer);
        }

        for layer in (0..=level.min(entry_level)).rev() {
            let found = graph.search_layer(&vector, &[ep], self.params.ef_construction, layer);
            let cap = if layer == 0 { self.params.m0 } else { self.params.m };
            let selected: Vec<usize> = found
                .iter()
                .filter(|c| c.idx != idx)
                .take(cap)
                .map(|c| c.idx)
                .collect();

            graph.node_mut(idx).neighbors[layer] = selected.clone();
            for &n in &selected {
                graph.node_mut(n).neighbors[layer].push(idx);
                graph.prune(n, layer, cap);
            }
            if let Some(closest) = found.first() {
                ep = closest.idx;
            }
        }

        if level > entry_level {
            graph.entry = Some(idx);
        }
        Ok(())
    }

    /// Approximate top-k by Euclidean distance, reported as `1 − d`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorMatch>, VectorError> {
        self.search_with_ef(query, k, self.params.ef_search)
    }

    pub fn search_with_ef(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<VectorMatch>, VectorError> {
        if query.is_empty() {
            return Err(VectorError::EmptyQuery);
        }
        let graph = self.graph.read();
        if let Some(dimension) = graph.dimension {
            dimension.validate_vector(query)?;
        }
        let Some(entry) = graph.entry else {
            return Ok(Vec::new());
        };

        let mut ep = entry;
        for layer in (1..=graph.node(entry).level).rev() {
            ep = graph.greedy_closest(ep, query, layer);
        }
        let found = graph.search_layer(query, &[ep], ef.max(k), 0);

        Ok(found
            .into_iter()
            .take(k)
            .map(|c| VectorMatch {
                id: graph.node(c.idx).id.clone(),
                score: Score::saturating(1.0 - c.dist),
            })
            .collect())
    }

    /// Remove a node and every edge touching it.
    pub fn delete(&self, id: &str) -> Result<(), VectorError> {
        let mut graph = self.graph.write();
        let idx = *graph
            .by_id
            .get(id)
            .ok_or_else(|| VectorError::NodeNotFound(id.to_string()))?;
        graph.remove(idx);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.graph.read().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Neighbour ids of `id` on `layer`, or `None` if the node is not on that layer.
    pub fn neighbors(&self, id: &str, layer: usize) -> Option<Vec<String>> {
        let graph = self.graph.read();
        let node = graph.node(*graph.by_id.get(id)?);
        let links = node.neighbors.get(layer)?;
        Some(links.iter().map(|&n| graph.node(n).id.clone()).collect())
    }

    /// Level of a node.
    pub fn level(&self, id: &str) -> Option<usize> {
        let graph = self.graph.read();
        graph.by_id.get(id).map(|&idx| graph.node(idx).level)
    }

    pub fn entry_point(&self) -> Option<String> {
        let graph = self.graph.read();
        graph.entry.map(|idx| graph.node(idx).id.clone())
    }

    pub fn stats(&self) -> HnswStats {
        let graph = self.graph.read();
        let live: Vec<&Node> = graph.nodes.iter().flatten().collect();
        let max_level = live.iter().map(|n| n.level).max().unwrap_or(0);
        let layers = if live.is_empty() {
            Vec::new()
        } else {
            (0..=max_level)
                .map(|layer| {
                    let on_layer: Vec<&&Node> =
                        live.iter().filter(|n| n.level >= layer).collect();
                    let degree: usize = on_layer.iter().map(|n| n.neighbors[layer].len()).sum();
                    LayerStats {
                        layer,
                        nodes: on_layer.len(),
                        avg_degree: if on_layer.is_empty() {
                            0.0
                        } else {
                            degree as f32 / on_layer.len() as f32
                        },
                    }
                })
                .collect()
        };
        HnswStats {
            node_count: live.len(),
            max_level,
            layers,
        }
    }
}
