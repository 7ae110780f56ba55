use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use nalgebra::Matrix3;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::disjoint_set::DisjointSet;
use crate::graph::{Edge, ImageGraph};

/// Upper bound on the label propagation sweeps of [`community_partition`].
const MAX_LABEL_SWEEPS: usize = 100;

/// Relative rotation between two views.
pub type Rotation = Matrix3<f64>;

/// Relative rotations of image pairs, keyed by local node indices.
///
/// `R(i, j)` maps coordinates of view `i` to view `j`: `x_j = R(i, j) x_i`.
#[derive(Debug, Clone, Default)]
pub struct RelativeMotions {
    rotations: FxHashMap<(usize, usize), Rotation>,
}

impl RelativeMotions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, src: usize, dst: usize, rotation: Rotation) {
        self.rotations.insert((src, dst), rotation);
    }

    pub fn len(&self) -> usize {
        self.rotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    /// `R(src, dst)`, derived from `R(dst, src)` when only the reverse
    /// direction is known.
    pub fn get(&self, src: usize, dst: usize) -> Option<Rotation> {
        self.rotations
            .get(&(src, dst))
            .copied()
            .or_else(|| self.rotations.get(&(dst, src)).map(|rotation| rotation.transpose()))
    }

    /// Rotation from the first to the last view of `path`, i.e.
    /// `R(p[m-1], p[m]) ... R(p[0], p[1])`. `None` when a step is unknown.
    pub fn compose(&self, path: &[usize]) -> Option<Rotation> {
        path.windows(2)
            .try_fold(Rotation::identity(), |accumulated, step| {
                self.get(step[0], step[1]).map(|rotation| rotation * accumulated)
            })
    }
}

/// Angle, in radians, of a rotation. Zero for a perfectly closed loop.
pub fn discrepancy(rotation: &Rotation) -> f64 {
    ((rotation.trace() - 1.0) / 2.0).clamp(-1.0, 1.0).acos()
}

/// Communities of a graph by weighted label propagation.
///
/// Every node starts in its own community, then nodes are visited in index
/// order and join the label with the largest total edge score among their
/// neighbors (keeping their own label when it is among the largest, the
/// smallest label otherwise) until a sweep changes nothing. Community ids are
/// contiguous, numbered by first appearance.
pub fn community_partition(graph: &ImageGraph) -> Vec<usize> {
    let num_nodes = graph.node_count();
    let mut labels: Vec<usize> = (0..num_nodes).collect();

    for sweep in 0..MAX_LABEL_SWEEPS {
        let mut changed = false;
        for node in 0..num_nodes {
            let mut label_weights: BTreeMap<usize, f64> = BTreeMap::new();
            for edge in graph.neighbors(node) {
                *label_weights.entry(labels[edge.dst]).or_insert(0.0) += edge.score;
            }
            let Some(best_weight) = label_weights.values().copied().reduce(f64::max) else {
                continue;
            };
            if label_weights.get(&labels[node]).is_some_and(|&weight| weight >= best_weight) {
                continue;
            }
            if let Some((&label, _)) = label_weights.iter().find(|(_, &weight)| weight >= best_weight) {
                labels[node] = label;
                changed = true;
            }
        }
        if !changed {
            debug!(sweeps = sweep + 1, "label propagation converged");
            break;
        }
    }

    let mut contiguous: FxHashMap<usize, usize> = FxHashMap::default();
    labels
        .iter()
        .map(|&label| {
            let next = contiguous.len();
            *contiguous.entry(label).or_insert(next)
        })
        .collect()
}

/// Edges of `graph` linking two communities and missing from `verified`,
/// strongest first.
pub fn candidate_match_set(graph: &ImageGraph, verified: &ImageGraph, communities: &[usize]) -> BinaryHeap<Edge> {
    graph
        .undirected_edges()
        .filter(|edge| match (communities.get(edge.src), communities.get(edge.dst)) {
            (Some(src), Some(dst)) => src != dst,
            _ => false,
        })
        .filter(|edge| !verified.has_edge(edge.src, edge.dst))
        .copied()
        .collect()
}

/// Construction of a view graph whose edges agree with the relative rotations.
///
/// The verified graph starts as a maximum spanning tree of trusted matches,
/// grows through rotation-consistent triplets, and the merged graph then
/// reconnects its communities through loop-consistent edges.
#[derive(Debug, Clone, Default)]
pub struct ConsistentMatchGraph {
    verified: ImageGraph,
    merged: ImageGraph,
    motions: RelativeMotions,
}

impl ConsistentMatchGraph {
    pub fn new(motions: RelativeMotions) -> Self {
        Self {
            verified: ImageGraph::new(),
            merged: ImageGraph::new(),
            motions,
        }
    }

    pub fn verified(&self) -> &ImageGraph {
        &self.verified
    }

    pub fn merged(&self) -> &ImageGraph {
        &self.merged
    }

    pub fn motions(&self) -> &RelativeMotions {
        &self.motions
    }

    /// Online maximum spanning tree.
    ///
    /// Edges of `graph` are examined strongest first. An edge joining two
    /// components is accepted when its score exceeds `inlier_threshold`,
    /// otherwise both endpoints get a rejection, and nodes with
    /// `reject_threshold` rejections take no further edges. Stops once the tree
    /// spans the graph or the edges run out. Returns the number of accepted
    /// edges.
    pub fn online_spanning_tree(&mut self, graph: &ImageGraph, reject_threshold: usize, inlier_threshold: f64) -> usize {
        self.verified = ImageGraph::with_nodes(graph.nodes());
        self.merged = ImageGraph::with_nodes(graph.nodes());

        let num_nodes = graph.node_count();
        let mut components = DisjointSet::new(num_nodes);
        let mut rejections = vec![0usize; num_nodes];
        let mut queue: BinaryHeap<Edge> = graph.undirected_edges().copied().collect();
        let mut accepted = 0;

        while accepted + 1 < num_nodes {
            let Some(edge) = queue.pop() else {
                break;
            };
            if components.find(edge.src) == components.find(edge.dst)
                || rejections[edge.src] >= reject_threshold
                || rejections[edge.dst] >= reject_threshold {
                continue;
            }

            if edge.score > inlier_threshold {
                components.union(edge.src, edge.dst);
                self.verified.add_undirected(edge);
                accepted += 1;
            } else {
                rejections[edge.src] += 1;
                rejections[edge.dst] += 1;
            }
        }

        info!(accepted, nodes = num_nodes, components = components.set_count(), "spanning tree built");
        accepted
    }

    /// Strong triplet expansion.
    ///
    /// For every verified node `i` and every pair of its verified neighbors
    /// `(j, k)` that are matched in `graph` but not yet verified, the loop
    /// `i -> j -> k -> i` is composed; the edge `(j, k)` is verified when the
    /// loop closes within `discrepancy_threshold`. Passes repeat until one adds
    /// nothing. Returns the number of edges added.
    pub fn triplet_expansion(&mut self, graph: &ImageGraph, discrepancy_threshold: f64) -> usize {
        let mut total_added = 0;

        loop {
            let mut additions: BTreeSet<(usize, usize)> = BTreeSet::new();
            for node in 0..self.verified.node_count() {
                let neighbors: Vec<usize> = self.verified.neighbors(node).map(|edge| edge.dst).collect();
                if neighbors.len() < 2 {
                    continue;
                }

                for (position, &first) in neighbors.iter().enumerate() {
                    for &second in &neighbors[position + 1..] {
                        if self.verified.has_edge(first, second) || !graph.has_edge(first, second) {
                            continue;
                        }
                        let Some(loop_rotation) = self.motions.compose(&[node, first, second, node]) else {
                            continue;
                        };
                        if discrepancy(&loop_rotation) <= discrepancy_threshold {
                            additions.insert((first.min(second), first.max(second)));
                        }
                    }
                }
            }

            let mut added = 0;
            for (src, dst) in additions {
                if let Some(&edge) = graph.edge(src, dst) {
                    if self.verified.add_undirected(edge) {
                        added += 1;
                    }
                }
            }
            debug!(added, "triplet expansion pass");

            if added == 0 {
                break;
            }
            total_added += added;
        }

        info!(added = total_added, "triplet expansion done");
        total_added
    }

    /// Community merging.
    ///
    /// The merged graph is rebuilt from the verified graph. The verified graph
    /// is split into `m` communities and the candidate edges between them are
    /// examined strongest first, at most `community_scale * m * (m - 1) / 2` of
    /// them. A candidate is accepted when the loop made of its rotation and the
    /// verified path between its endpoints closes within
    /// `loop_discrepancy_threshold / sqrt(path length)`. Returns the number of
    /// accepted edges.
    pub fn merge_communities(&mut self, graph: &ImageGraph, community_scale: usize, loop_discrepancy_threshold: f64) -> usize {
        self.merged = self.verified.clone();

        let communities = community_partition(&self.verified);
        let num_communities = communities.iter().max().map_or(0, |&label| label + 1);
        let budget = community_scale * num_communities * num_communities.saturating_sub(1) / 2;
        let mut candidates = candidate_match_set(graph, &self.verified, &communities);
        debug!(communities = num_communities, candidates = candidates.len(), budget, "merging communities");

        let mut accepted = 0;
        for _ in 0..budget {
            let Some(edge) = candidates.pop() else {
                break;
            };
            let path = self.verified.shortest_path(edge.src, edge.dst);
            if path.len() < 2 {
                debug!(src = edge.src, dst = edge.dst, "no verified path between the endpoints");
                continue;
            }
            let (Some(along_path), Some(closing)) = (self.motions.compose(&path), self.motions.get(edge.dst, edge.src)) else {
                continue;
            };

            let loop_discrepancy = discrepancy(&(closing * along_path));
            if loop_discrepancy < loop_discrepancy_threshold / (path.len() as f64).sqrt()
                && self.merged.add_undirected(edge) {
                accepted += 1;
            }
        }

        info!(accepted, communities = num_communities, "communities merged");
        accepted
    }
}
