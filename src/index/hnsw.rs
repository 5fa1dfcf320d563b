//! Approximate nearest-neighbor vector index over fixed-dimensional float
//! vectors using cosine similarity: a hierarchical navigable
//! small-world graph.
//!
//! Nodes reference each other by integer index into a flat node array
//! rather than by owning references, so the whole graph serializes
//! directly with `serde`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{NexaError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    doc_id: String,
    vector: Vec<f32>,
    /// Per-layer neighbor lists; `neighbors[0]` is the base layer.
    neighbors: Vec<Vec<usize>>,
    tombstoned: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    entry_point: Option<usize>,
    nodes: Vec<Node>,
    /// Document count in the collection at the time this graph was built,
    /// used to detect staleness on load.
    built_doc_count: usize,
}

/// A single collection's vector index. `build`/`insert`/`delete`/`search`
/// all take `&self`; internal mutation is behind a single `RwLock`
/// because HNSW insertion touches neighbor lists across many nodes and
/// isn't easily sharded.
pub struct HnswIndex {
    dim: usize,
    params: RwLock<HnswParams>,
    state: RwLock<GraphState>,
}

struct GraphState {
    nodes: Vec<Node>,
    doc_to_node: std::collections::HashMap<String, usize>,
    entry_point: Option<usize>,
    built_doc_count: usize,
}

fn random_level(m: usize) -> usize {
    let level_mult = 1.0 / (m.max(2) as f64).ln();
    let mut rng = rand::thread_rng();
    let r: f64 = rng.gen_range(1e-12..1.0);
    (-r.ln() * level_mult).floor() as usize
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    node: usize,
    similarity: f32,
}
impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .partial_cmp(&other.similarity)
            .unwrap_or(Ordering::Equal)
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl HnswIndex {
    pub fn new(dim: usize, params: HnswParams) -> Self {
        Self {
            dim,
            params: RwLock::new(params),
            state: RwLock::new(GraphState {
                nodes: Vec::new(),
                doc_to_node: std::collections::HashMap::new(),
                entry_point: None,
                built_doc_count: 0,
            }),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rebuilds the entire graph from a fresh scan of the collection's
    /// documents, replacing any existing index atomically.
    pub fn build(&self, vectors: impl Iterator<Item = (String, Vec<f32>)>) -> Result<()> {
        let fresh = HnswIndex::new(self.dim, *self.params.read());
        let mut doc_count = 0;
        for (doc_id, vector) in vectors {
            if vector.len() != self.dim {
                return Err(NexaError::DimensionMismatch {
                    expected: self.dim,
                    got: vector.len(),
                });
            }
            fresh.insert_locked(doc_id, vector)?;
            doc_count += 1;
        }
        let mut fresh_state = fresh.state.write();
        fresh_state.built_doc_count = doc_count;
        let mut state = self.state.write();
        *state = std::mem::replace(
            &mut *fresh_state,
            GraphState {
                nodes: Vec::new(),
                doc_to_node: std::collections::HashMap::new(),
                entry_point: None,
                built_doc_count: 0,
            },
        );
        Ok(())
    }

    /// Inserts (or re-inserts) a single document's vector after an
    /// insert/update. No-op returning `DimensionMismatch` if
    /// `vector.len()` doesn't match the declared dimensionality.
    pub fn insert(&self, doc_id: String, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(NexaError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.insert_locked(doc_id, vector)
    }

    fn insert_locked(&self, doc_id: String, vector: Vec<f32>) -> Result<()> {
        let params = *self.params.read();
        let mut state = self.state.write();

        // Re-inserting an existing doc id tombstones the old node and
        // adds a fresh one; cheaper than in-place edge repair and keeps
        // insert/delete/insert sequences simple to reason about.
        if let Some(&old) = state.doc_to_node.get(&doc_id) {
            state.nodes[old].tombstoned = true;
        }

        let level = random_level(params.m);
        let new_id = state.nodes.len();
        state.nodes.push(Node {
            doc_id: doc_id.clone(),
            vector: vector.clone(),
            neighbors: vec![Vec::new(); level + 1],
            tombstoned: false,
        });
        state.doc_to_node.insert(doc_id, new_id);

        let Some(entry) = state.entry_point else {
            state.entry_point = Some(new_id);
            return Ok(());
        };

        let entry_level = state.nodes[entry].neighbors.len() - 1;
        let mut current = entry;

        // Descend from the entry point's top layer to `level + 1` with a
        // greedy single-step walk to find a good entry into our layers.
        for layer in (level + 1..=entry_level).rev() {
            current = greedy_descend(&state.nodes, &vector, current, layer);
        }

        for layer in (0..=level.min(entry_level)).rev() {
            let candidates = search_layer(&state.nodes, &vector, current, params.ef_construction, layer);
            let selected = select_neighbors(&state.nodes, &candidates, params.m);
            for &neighbor in &selected {
                state.nodes[new_id].neighbors[layer].push(neighbor);
                state.nodes[neighbor].neighbors[layer].push(new_id);
                prune_neighbors(&mut state.nodes, neighbor, layer, params.m);
            }
            if let Some(&best) = candidates.iter().map(|c| &c.node).next() {
                current = best;
            }
        }

        if level > entry_level {
            state.entry_point = Some(new_id);
        }
        Ok(())
    }

    /// Marks a node tombstoned; it is skipped during search but its
    /// edges stay in place until the next `build`.
    pub fn delete(&self, doc_id: &str) {
        let mut state = self.state.write();
        if let Some(&node) = state.doc_to_node.get(doc_id) {
            state.nodes[node].tombstoned = true;
        }
    }

    /// Top-k nearest neighbors by cosine similarity, descending, ties
    /// broken by doc id for determinism.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dim {
            return Err(NexaError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        let params = *self.params.read();
        let state = self.state.read();
        let Some(entry) = state.entry_point else {
            return Ok(Vec::new());
        };

        let top_layer = state.nodes[entry].neighbors.len() - 1;
        let mut current = entry;
        for layer in (1..=top_layer).rev() {
            current = greedy_descend(&state.nodes, query, current, layer);
        }

        let ef = params.ef_search.max(k);
        let mut candidates = search_layer(&state.nodes, query, current, ef, 0);
        candidates.retain(|c| !state.nodes[c.node].tombstoned);
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| state.nodes[a.node].doc_id.cmp(&state.nodes[b.node].doc_id))
        });
        Ok(candidates
            .into_iter()
            .take(k)
            .map(|c| (state.nodes[c.node].doc_id.clone(), c.similarity))
            .collect())
    }

    pub fn live_node_count(&self) -> usize {
        self.state.read().nodes.iter().filter(|n| !n.tombstoned).count()
    }

    pub fn tombstoned_ratio(&self) -> f64 {
        let state = self.state.read();
        if state.nodes.is_empty() {
            return 0.0;
        }
        let dead = state.nodes.iter().filter(|n| n.tombstoned).count();
        dead as f64 / state.nodes.len() as f64
    }

    /// Whether the graph was built against a document count that no
    /// longer matches `current_doc_count`.
    pub fn is_stale(&self, current_doc_count: usize) -> bool {
        self.state.read().built_doc_count != current_doc_count
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let params = *self.params.read();
        let state = self.state.read();
        let persisted = PersistedGraph {
            dim: self.dim,
            m: params.m,
            ef_construction: params.ef_construction,
            ef_search: params.ef_search,
            entry_point: state.entry_point,
            nodes: state.nodes.clone(),
            built_doc_count: state.built_doc_count,
        };
        let bytes = rmp_serde::to_vec(&persisted).map_err(|e| NexaError::Internal(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("graph.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let persisted: PersistedGraph =
            rmp_serde::from_slice(&bytes).map_err(|e| NexaError::Internal(e.to_string()))?;
        let mut doc_to_node = std::collections::HashMap::new();
        for (i, node) in persisted.nodes.iter().enumerate() {
            doc_to_node.insert(node.doc_id.clone(), i);
        }
        Ok(Self {
            dim: persisted.dim,
            params: RwLock::new(HnswParams {
                m: persisted.m,
                ef_construction: persisted.ef_construction,
                ef_search: persisted.ef_search,
            }),
            state: RwLock::new(GraphState {
                nodes: persisted.nodes,
                doc_to_node,
                entry_point: persisted.entry_point,
                built_doc_count: persisted.built_doc_count,
            }),
        })
    }
}

fn greedy_descend(nodes: &[Node], query: &[f32], start: usize, layer: usize) -> usize {
    let mut current = start;
    let mut current_sim = cosine_similarity(&nodes[current].vector, query);
    loop {
        let mut improved = false;
        if layer < nodes[current].neighbors.len() {
            for &neighbor in &nodes[current].neighbors[layer] {
                let sim = cosine_similarity(&nodes[neighbor].vector, query);
                if sim > current_sim {
                    current = neighbor;
                    current_sim = sim;
                    improved = true;
                }
            }
        }
        if !improved {
            return current;
        }
    }
}

/// Best-first search within one layer, expanding up to `ef` candidates.
fn search_layer(nodes: &[Node], query: &[f32], start: usize, ef: usize, layer: usize) -> Vec<Candidate> {
    let mut visited = HashSet::new();
    visited.insert(start);
    let start_sim = cosine_similarity(&nodes[start].vector, query);

    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
    candidates.push(Candidate {
        node: start,
        similarity: start_sim,
    });
    let mut results: Vec<Candidate> = vec![Candidate {
        node: start,
        similarity: start_sim,
    }];

    while let Some(top) = candidates.pop() {
        let worst_in_results = results
            .iter()
            .map(|c| c.similarity)
            .fold(f32::INFINITY, f32::min);
        if results.len() >= ef && top.similarity < worst_in_results {
            break;
        }
        if layer >= nodes[top.node].neighbors.len() {
            continue;
        }
        for &neighbor in &nodes[top.node].neighbors[layer] {
            if !visited.insert(neighbor) {
                continue;
            }
            let sim = cosine_similarity(&nodes[neighbor].vector, query);
            candidates.push(Candidate {
                node: neighbor,
                similarity: sim,
            });
            results.push(Candidate {
                node: neighbor,
                similarity: sim,
            });
        }
    }

    results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal));
    results.truncate(ef.max(1));
    results
}

fn select_neighbors(_nodes: &[Node], candidates: &[Candidate], m: usize) -> Vec<usize> {
    candidates.iter().take(m).map(|c| c.node).collect()
}

/// Keeps each node's per-layer neighbor list bounded to `m` by dropping
/// its least-similar edges once it grows past the budget.
fn prune_neighbors(nodes: &mut [Node], node: usize, layer: usize, m: usize) {
    if nodes[node].neighbors[layer].len() <= m {
        return;
    }
    let vector = nodes[node].vector.clone();
    let mut scored: Vec<(usize, f32)> = nodes[node].neighbors[layer]
        .iter()
        .map(|&n| (n, cosine_similarity(&nodes[n].vector, &vector)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(m);
    nodes[node].neighbors[layer] = scored.into_iter().map(|(n, _)| n).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> HnswParams {
        HnswParams {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }

    #[test]
    fn search_returns_exact_nearest_for_orthogonal_basis() {
        let index = HnswIndex::new(4, params());
        index.insert("a".to_string(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert("b".to_string(), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        index.insert("c".to_string(), vec![0.9, 0.1, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert!((results[0].1 - 1.0).abs() < 1e-4);
        assert_eq!(results[1].0, "c");
    }

    #[test]
    fn k_greater_than_n_returns_exactly_n() {
        let index = HnswIndex::new(2, params());
        for i in 0..5 {
            index
                .insert(format!("d{i}"), vec![i as f32, (5 - i) as f32])
                .unwrap();
        }
        let results = index.search(&[1.0, 1.0], 100).unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let index = HnswIndex::new(4, params());
        let err = index.insert("a".to_string(), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(err, NexaError::DimensionMismatch { expected: 4, got: 2 }));
    }

    #[test]
    fn deleted_node_is_excluded_from_search() {
        let index = HnswIndex::new(4, params());
        index.insert("a".to_string(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert("b".to_string(), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        index.delete("a");
        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert!(results.iter().all(|(id, _)| id != "a"));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movies.graph");
        let index = HnswIndex::new(4, params());
        index.insert("a".to_string(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        index.save(&path).unwrap();

        let reloaded = HnswIndex::load(&path).unwrap();
        let results = reloaded.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn staleness_detected_against_doc_count() {
        let index = HnswIndex::new(4, params());
        index.insert("a".to_string(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        // built_doc_count defaults to 0 since insert() alone (not build())
        // doesn't bump it; compared against 1 live doc, it reads stale.
        assert!(index.is_stale(1));
    }
}
