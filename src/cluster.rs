use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::path::Path;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};
use crate::algorithms::{validate_assignment, Error};
use crate::graph::{Edge, ImageGraph, Node};
use crate::io::{read_image_list, read_score_triples};
use crate::PartitionOracle;

// Ratios are compared with a small slack so that e.g. 1/2 <= 0.5 holds after rounding.
const RATIO_EPSILON: f64 = 1e-9;

fn ratio_within(shared: usize, size: usize, completeness_ratio: f64) -> bool {
    size == 0 || shared as f64 / size as f64 <= completeness_ratio + RATIO_EPSILON
}

/// Number of images two clusters have in common.
pub fn repeated_node_count(left: &ImageGraph, right: &ImageGraph) -> usize {
    let right_ids: FxHashSet<usize> = right.nodes().iter().map(|node| node.global_id).collect();
    left.nodes().iter().filter(|node| right_ids.contains(&node.global_id)).count()
}

/// Build a graph from an image list and `(src, dst, score)` triples. Node `i`
/// gets global id `i`. Self-loops and triples naming unknown images are skipped.
pub fn build_graph_from(images: &[String], triples: &[(usize, usize, f64)]) -> ImageGraph {
    let mut graph = ImageGraph::new();
    for (index, image) in images.iter().enumerate() {
        graph.add_node(Node::new(index, image.as_str()));
    }
    for &(src, dst, score) in triples {
        if src == dst {
            continue;
        }
        if !graph.add_undirected_edge(src, dst, score) {
            warn!(src, dst, nodes = graph.node_count(), "score triple names an unknown image");
        }
    }
    graph
}

/// Split `graph` into `num_parts` disjoint sub-graphs following `assignment`.
///
/// Sub-graph `p` holds, in their original order, the nodes assigned to `p` and
/// every edge between two of them, re-indexed locally. Nodes without a valid
/// part are left out.
pub fn build_subgraphs(graph: &ImageGraph, assignment: &[usize], num_parts: usize) -> Vec<ImageGraph> {
    let mut subgraphs = vec![ImageGraph::new(); num_parts];
    let mut local_in_part = vec![None; graph.node_count()];

    for (local, node) in graph.nodes().iter().enumerate() {
        if let Some(&part) = assignment.get(local).filter(|&&part| part < num_parts) {
            local_in_part[local] = Some(subgraphs[part].add_node(node.clone()));
        }
    }

    for edge in graph.edges() {
        if let (Some(src), Some(dst)) = (local_in_part[edge.src], local_in_part[edge.dst]) {
            let part = assignment[edge.src];
            if part == assignment[edge.dst] {
                subgraphs[part].add_edge(Edge { src, dst, ..*edge });
            }
        }
    }
    subgraphs
}

/// Split a graph in two through the partition oracle.
///
/// Fails when the oracle fails or when one of the halves is empty.
pub fn bi_partition<O: PartitionOracle + ?Sized>(graph: &ImageGraph, oracle: &mut O) -> Result<(ImageGraph, ImageGraph), Error> {
    let assignment = oracle
        .partition_graph(graph, 2)
        .and_then(|assignment| validate_assignment(&assignment, graph.node_count(), 2).map(|()| assignment))
        .map_err(|err| {
            error!(nodes = graph.node_count(), %err, "bi-partition failed");
            err
        })?;

    let mut halves = build_subgraphs(graph, &assignment, 2).into_iter();
    match (halves.next(), halves.next()) {
        (Some(left), Some(right)) if !left.is_empty() && !right.is_empty() => Ok((left, right)),
        (left, right) => {
            let left = left.map_or(0, |half| half.node_count());
            let right = right.map_or(0, |half| half.node_count());
            error!(left, right, "bi-partition left a side empty");
            Err(Error::DegenerateSplit { left, right })
        }
    }
}

/// Whether some graph holds both endpoints of `edge` (given as global ids) and
/// the edge between them.
pub fn has_edge(graphs: &[ImageGraph], edge: &Edge) -> bool {
    graphs.iter().any(|graph| {
        match (graph.map_to_local(edge.src), graph.map_to_local(edge.dst)) {
            (Some(src), Some(dst)) => graph.has_edge(src, dst),
            _ => false,
        }
    })
}

/// Edges of `original` that no accepted cluster holds, strongest first.
/// Endpoints of the returned edges are global ids.
pub fn discarded_edges(original: &ImageGraph, accepted: &[ImageGraph]) -> BinaryHeap<Edge> {
    let kept: FxHashSet<(usize, usize)> = accepted
        .iter()
        .flat_map(|cluster| {
            cluster.edges().filter_map(move |edge| {
                Some((cluster.node(edge.src)?.global_id, cluster.node(edge.dst)?.global_id))
            })
        })
        .collect();

    original
        .undirected_edges()
        .filter_map(|edge| {
            let src = original.node(edge.src)?.global_id;
            let dst = original.node(edge.dst)?.global_id;
            (!kept.contains(&(src, dst))).then_some(Edge { src, dst, ..*edge })
        })
        .collect()
}

// For each cluster, the sum of its repeated node counts against every other cluster.
struct OverlapTally {
    shared: Vec<usize>,
}

impl OverlapTally {
    fn new(clusters: &[ImageGraph]) -> Self {
        let mut occurrences: FxHashMap<usize, usize> = FxHashMap::default();
        for node in clusters.iter().flat_map(ImageGraph::nodes) {
            *occurrences.entry(node.global_id).or_insert(0) += 1;
        }
        let shared = clusters
            .iter()
            .map(|cluster| {
                cluster
                    .nodes()
                    .iter()
                    .map(|node| occurrences.get(&node.global_id).map_or(0, |count| count.saturating_sub(1)))
                    .sum()
            })
            .collect();
        Self { shared }
    }

    // Must be called before `global_id` is added to `target`.
    fn record_insertion(&mut self, clusters: &[ImageGraph], global_id: usize, target: usize) {
        for (index, cluster) in clusters.iter().enumerate() {
            if index != target && cluster.contains_id(global_id) {
                self.shared[index] += 1;
                self.shared[target] += 1;
            }
        }
    }
}

/// Size-bounded, overlap-controlled clustering of an image graph.
///
/// # Example
///
/// ```rust
/// use graph_cluster::algorithms::MultiLevelPartitioner;
/// use graph_cluster::cluster::{build_graph_from, GraphCluster};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
///
///     let images: Vec<String> = (0..4).map(|id| format!("{id}.jpg")).collect();
///     let graph = build_graph_from(&images, &[(0, 1, 0.9), (1, 2, 0.8), (2, 3, 0.7), (0, 3, 0.1)]);
///
///     let engine = GraphCluster { size_upper_bound: 2, completeness_ratio: 0.5, seed: Some(5), ..Default::default() };
///     let mut oracle = MultiLevelPartitioner { seed: Some(5), ..Default::default() };
///     let initial = engine.initial_clusters(&graph, &mut oracle)?;
///     let clusters = engine.expand_clusters(&graph, initial, &mut oracle)?;
///
///     assert!(clusters.iter().all(|cluster| cluster.node_count() <= 2));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct GraphCluster {
    /// Largest number of images a cluster may hold.
    pub size_upper_bound: usize,

    /// Largest fraction of a cluster's images that may also belong to other clusters.
    pub completeness_ratio: f64,

    /// Number of split and reinsertion rounds after which reinsertion stops.
    pub max_expansion_passes: usize,

    /// Seed of the random choices. A fresh seed is drawn when unset.
    pub seed: Option<u64>,
}

impl Default for GraphCluster {
    fn default() -> Self {
        GraphCluster {
            size_upper_bound: 100,
            completeness_ratio: 0.7,
            max_expansion_passes: 32,
            seed: None,
        }
    }
}

impl GraphCluster {

    pub fn validate(&self) -> Result<(), Error> {
        if self.size_upper_bound == 0 {
            return Err(Error::InvalidConfig("the cluster size bound must be positive".to_owned()));
        }
        if !(0.0..=1.0).contains(&self.completeness_ratio) {
            return Err(Error::InvalidConfig(format!(
                "the completeness ratio must lie in [0, 1], got {}",
                self.completeness_ratio
            )));
        }
        Ok(())
    }

    fn rng(&self) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        }
    }

    /// Build the image graph from an image list file and a score file.
    ///
    /// Unreadable files are reported and give an empty graph (image list) or a
    /// graph without edges (score file).
    pub fn build_graph(&self, image_list: &Path, score_file: &Path) -> ImageGraph {
        let images = match read_image_list(image_list) {
            Ok(images) => images,
            Err(err) => {
                error!(file = %image_list.display(), %err, "cannot read the image list");
                return ImageGraph::new();
            }
        };
        let triples = read_score_triples(score_file).unwrap_or_else(|err| {
            error!(file = %score_file.display(), %err, "cannot read the score file");
            Vec::new()
        });

        let graph = build_graph_from(&images, &triples);
        info!(nodes = graph.node_count(), edges = graph.undirected_edges().count(), "image graph built");
        graph
    }

    /// First clustering of the whole graph into `max(1, n / size_upper_bound)`
    /// parts. Parts may still exceed the size bound.
    pub fn initial_clusters<O: PartitionOracle + ?Sized>(&self, graph: &ImageGraph, oracle: &mut O) -> Result<Vec<ImageGraph>, Error> {
        self.validate()?;
        let num_parts = (graph.node_count() / self.size_upper_bound).max(1);
        if num_parts == 1 {
            return Ok(vec![graph.clone()]);
        }

        let assignment = oracle.partition_graph(graph, num_parts)?;
        validate_assignment(&assignment, graph.node_count(), num_parts)?;
        let clusters: Vec<ImageGraph> = build_subgraphs(graph, &assignment, num_parts)
            .into_iter()
            .filter(|cluster| !cluster.is_empty())
            .collect();
        info!(num_parts, clusters = clusters.len(), "initial clustering");
        Ok(clusters)
    }

    /// Clusters used as they are, without expansion. Empty clusters are dropped.
    pub fn naive_cluster(&self, initial: Vec<ImageGraph>) -> Vec<ImageGraph> {
        initial.into_iter().filter(|cluster| !cluster.is_empty()).collect()
    }

    /// Pick the cluster a discarded edge (endpoints as global ids) goes back into.
    ///
    /// One endpoint is fixed at random. The first cluster holding it whose
    /// overlap stays within the completeness ratio once the other endpoint is
    /// added receives that endpoint. Returns the node to add and the index of
    /// the receiving cluster.
    pub fn select_reinsertion_target<R: Rng + ?Sized>(
        &self,
        original: &ImageGraph,
        clusters: &[ImageGraph],
        edge: &Edge,
        rng: &mut R,
    ) -> Option<(Node, usize)> {
        let tally = OverlapTally::new(clusters);
        self.select_target(original, clusters, &tally, edge, rng)
    }

    fn select_target<R: Rng + ?Sized>(
        &self,
        original: &ImageGraph,
        clusters: &[ImageGraph],
        tally: &OverlapTally,
        edge: &Edge,
        rng: &mut R,
    ) -> Option<(Node, usize)> {
        let (fixed, moved) = if rng.gen_bool(0.5) {
            (edge.src, edge.dst)
        } else {
            (edge.dst, edge.src)
        };
        let moved_node = original
            .node(moved)
            .filter(|node| node.global_id == moved)
            .or_else(|| original.node_by_id(moved))?;

        self.reinsertion_target(clusters, tally, fixed, moved)
            .map(|index| (moved_node.clone(), index))
    }

    // First cluster holding `fixed` that can take `moved` without any overlap ratio
    // going over the completeness ratio.
    fn reinsertion_target(&self, clusters: &[ImageGraph], tally: &OverlapTally, fixed: usize, moved: usize) -> Option<usize> {
        // Every cluster already holding the moved node shares one more node afterwards.
        let homes: Vec<usize> = (0..clusters.len()).filter(|&index| clusters[index].contains_id(moved)).collect();
        let homes_fit = homes
            .iter()
            .all(|&home| ratio_within(tally.shared[home] + 1, clusters[home].node_count(), self.completeness_ratio));

        clusters
            .iter()
            .enumerate()
            .filter(|(_, cluster)| cluster.contains_id(fixed))
            .find(|&(index, cluster)| {
                if cluster.contains_id(moved) {
                    ratio_within(tally.shared[index], cluster.node_count(), self.completeness_ratio)
                } else {
                    homes_fit
                        && ratio_within(tally.shared[index] + homes.len(),
                                        cluster.node_count() + 1,
                                        self.completeness_ratio)
                }
            })
            .map(|(index, _)| index)
    }

    /// Cluster expansion.
    ///
    /// Oversized clusters are split in two until every cluster fits the size
    /// bound, then edges lost by the splits are put back, strongest first, by
    /// copying one endpoint into a cluster holding the other one. Clusters that
    /// outgrow the bound are split again and the rounds repeat until nothing is
    /// left to split, the same clusters come back, or `max_expansion_passes`
    /// is reached.
    ///
    /// On return every cluster fits the size bound, every node of `original`
    /// belongs to some cluster, and no cluster shares more than
    /// `completeness_ratio` of its nodes with another one.
    pub fn expand_clusters<O: PartitionOracle + ?Sized>(
        &self,
        original: &ImageGraph,
        initial: Vec<ImageGraph>,
        oracle: &mut O,
    ) -> Result<Vec<ImageGraph>, Error> {
        self.validate()?;
        let mut rng = self.rng();
        let mut candidates: VecDeque<ImageGraph> = initial.into_iter().filter(|cluster| !cluster.is_empty()).collect();
        let mut in_size: Vec<ImageGraph> = Vec::new();
        let mut signatures: FxHashSet<Vec<Vec<usize>>> = FxHashSet::default();
        let mut pass = 0;

        loop {
            self.drain_candidates(&mut candidates, &mut in_size, oracle, &mut rng);
            pass += 1;
            if pass > self.max_expansion_passes {
                warn!(passes = self.max_expansion_passes, "expansion pass limit reached");
                break;
            }

            let mut discarded = discarded_edges(original, &in_size);
            let mut tally = OverlapTally::new(&in_size);
            let num_discarded = discarded.len();
            let mut reinserted = 0;

            while let Some(edge) = discarded.pop() {
                let Some((node, target)) = self.select_target(original, &in_size, &tally, &edge, &mut rng) else {
                    continue;
                };
                if !in_size[target].contains_id(node.global_id) {
                    tally.record_insertion(&in_size, node.global_id, target);
                    in_size[target].add_node(node);
                }
                let cluster = &mut in_size[target];
                if let (Some(src), Some(dst)) = (cluster.map_to_local(edge.src), cluster.map_to_local(edge.dst)) {
                    if cluster.add_undirected(Edge { src, dst, ..edge }) {
                        reinserted += 1;
                    }
                }
            }

            let (oversized, fitting): (Vec<ImageGraph>, Vec<ImageGraph>) = in_size
                .into_iter()
                .partition(|cluster| cluster.node_count() > self.size_upper_bound);
            in_size = fitting;
            debug!(pass, discarded = num_discarded, reinserted, oversized = oversized.len(), "expansion pass");
            candidates.extend(oversized);

            if candidates.is_empty() {
                break;
            }
            if !signatures.insert(cluster_signature(&in_size, &candidates)) {
                warn!(pass, "expansion no longer makes progress");
                break;
            }
        }

        self.drain_candidates(&mut candidates, &mut in_size, oracle, &mut rng);
        self.enforce_completeness(&mut in_size);
        in_size.retain(|cluster| !cluster.is_empty());

        info!(clusters = in_size.len(),
              passes = pass.min(self.max_expansion_passes),
              images = in_size.iter().map(ImageGraph::node_count).sum::<usize>(),
              "cluster expansion done");
        Ok(in_size)
    }

    // Split candidates until each of them fits the size bound.
    fn drain_candidates<O: PartitionOracle + ?Sized, R: Rng + ?Sized>(
        &self,
        candidates: &mut VecDeque<ImageGraph>,
        in_size: &mut Vec<ImageGraph>,
        oracle: &mut O,
        rng: &mut R,
    ) {
        while let Some(cluster) = candidates.pop_front() {
            if cluster.node_count() <= self.size_upper_bound {
                in_size.push(cluster);
                continue;
            }
            let (left, right) = split(&cluster, oracle, rng);
            candidates.push_back(left);
            candidates.push_back(right);
        }
    }

    // Remove shared nodes from clusters that overlap another cluster too much.
    // A removed node always stays in the cluster it is shared with.
    fn enforce_completeness(&self, clusters: &mut [ImageGraph]) {
        for index in 0..clusters.len() {
            loop {
                let size = clusters[index].node_count();
                let worst = (0..clusters.len())
                    .filter(|&other| other != index)
                    .map(|other| (repeated_node_count(&clusters[index], &clusters[other]), other))
                    .max_by_key(|&(count, other)| (count, Reverse(other)));
                let Some((count, partner)) = worst else {
                    break;
                };
                if ratio_within(count, size, self.completeness_ratio) {
                    break;
                }

                let Some(victim) = clusters[index]
                    .nodes()
                    .iter()
                    .rev()
                    .find(|node| clusters[partner].contains_id(node.global_id))
                    .map(|node| node.global_id)
                else {
                    break;
                };
                debug!(cluster = index, partner, image = victim, "removing shared image");
                clusters[index] = clusters[index].retain_nodes(|node| node.global_id != victim);
            }
        }
    }
}

// Split a graph in two non-empty halves, falling back to a random minimum cut
// when the oracle cannot.
fn split<O: PartitionOracle + ?Sized, R: Rng + ?Sized>(graph: &ImageGraph, oracle: &mut O, rng: &mut R) -> (ImageGraph, ImageGraph) {
    match bi_partition(graph, oracle) {
        Ok(halves) => halves,
        Err(err) => {
            warn!(nodes = graph.node_count(), %err, "falling back to a random minimum cut");
            let (left, _right) = graph.randomized_min_cut(rng, None);
            let left_ids: FxHashSet<usize> = left
                .iter()
                .filter_map(|&local| graph.node(local).map(|node| node.global_id))
                .collect();
            (
                graph.retain_nodes(|node| left_ids.contains(&node.global_id)),
                graph.retain_nodes(|node| !left_ids.contains(&node.global_id)),
            )
        }
    }
}

// Sorted global ids of every cluster, in sorted order.
fn cluster_signature(in_size: &[ImageGraph], candidates: &VecDeque<ImageGraph>) -> Vec<Vec<usize>> {
    let mut signature: Vec<Vec<usize>> = in_size
        .iter()
        .chain(candidates.iter())
        .map(|cluster| {
            let mut ids: Vec<usize> = cluster.nodes().iter().map(|node| node.global_id).collect();
            ids.sort_unstable();
            ids
        })
        .collect();
    signature.sort();
    signature
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use tempfile::tempdir;
    use crate::algorithms::MultiLevelPartitioner;
    use crate::metrics::max_overlap_ratio;
    use super::*;

    struct FixedOracle(Vec<usize>);

    impl PartitionOracle for FixedOracle {
        fn partition_graph(&mut self, _graph: &ImageGraph, _num_parts: usize) -> Result<Vec<usize>, Error> {
            Ok(self.0.clone())
        }
    }

    // Puts every node in part 0, which never gives a usable bi-partition.
    struct SinglePartOracle;

    impl PartitionOracle for SinglePartOracle {
        fn partition_graph(&mut self, graph: &ImageGraph, _num_parts: usize) -> Result<Vec<usize>, Error> {
            Ok(vec![0; graph.node_count()])
        }
    }

    fn images(num_images: usize) -> Vec<String> {
        (0..num_images).map(|id| format!("{id}.jpg")).collect()
    }

    fn four_cycle() -> ImageGraph {
        build_graph_from(&images(4), &[(0, 1, 0.9), (1, 2, 0.8), (2, 3, 0.7), (0, 3, 0.1)])
    }

    fn ring(num_nodes: usize) -> ImageGraph {
        let triples: Vec<(usize, usize, f64)> = (0..num_nodes)
            .map(|id| (id, (id + 1) % num_nodes, 0.5 + 0.01 * id as f64))
            .collect();
        build_graph_from(&images(num_nodes), &triples)
    }

    fn cluster_of(original: &ImageGraph, ids: &[usize]) -> ImageGraph {
        original.retain_nodes(|node| ids.contains(&node.global_id))
    }

    fn covered_ids(clusters: &[ImageGraph]) -> FxHashSet<usize> {
        clusters.iter().flat_map(ImageGraph::nodes).map(|node| node.global_id).collect()
    }

    #[test]
    fn test_build_subgraphs_partitions_nodes_and_edges() {
        // Arrange
        let graph = four_cycle();

        // Act
        let subgraphs = build_subgraphs(&graph, &[0, 0, 1, 1], 2);

        // Assert
        assert_eq!(subgraphs.len(), 2);
        assert_eq!(subgraphs[0].node_count() + subgraphs[1].node_count(), 4);
        assert!(subgraphs[0].contains_id(0) && subgraphs[0].contains_id(1));
        assert!(subgraphs[1].contains_id(2) && subgraphs[1].contains_id(3));
        assert!(subgraphs[0].has_edge(0, 1) && subgraphs[0].has_edge(1, 0));
        assert!(subgraphs[1].has_edge(0, 1));
        assert_eq!(subgraphs[0].edge_count(), 2);
        assert_eq!(subgraphs[1].edge_count(), 2);
    }

    #[test]
    fn test_has_edge_uses_global_ids() {
        // Arrange
        let graph = four_cycle();
        let clusters = vec![cluster_of(&graph, &[2, 3])];

        // Act & Assert
        assert!(has_edge(&clusters, &Edge::new(2, 3, 0.7)));
        assert!(has_edge(&clusters, &Edge::new(3, 2, 0.7)));
        assert!(!has_edge(&clusters, &Edge::new(1, 2, 0.8)));
        assert!(!has_edge(&clusters, &Edge::new(0, 1, 0.9)));
        assert!(!has_edge(&[], &Edge::new(2, 3, 0.7)));
    }

    #[test]
    fn test_repeated_node_count_is_symmetric() {
        // Arrange
        let graph = ring(6);
        let left = cluster_of(&graph, &[0, 1, 2, 3]);
        let right = cluster_of(&graph, &[3, 4, 5, 0]);

        // Act & Assert
        assert_eq!(repeated_node_count(&left, &right), 2);
        assert_eq!(repeated_node_count(&right, &left), 2);
        assert_eq!(repeated_node_count(&left, &ImageGraph::new()), 0);
    }

    #[test]
    fn test_discarded_edges_are_strongest_first() {
        // Arrange
        let graph = four_cycle();
        let accepted = vec![cluster_of(&graph, &[0, 1]), cluster_of(&graph, &[2, 3])];

        // Act
        let discarded = discarded_edges(&graph, &accepted).into_sorted_vec();

        // Assert
        let endpoints: Vec<(usize, usize)> = discarded.iter().rev().map(|edge| (edge.src, edge.dst)).collect();
        assert_eq!(endpoints, vec![(1, 2), (0, 3)]);
    }

    #[test]
    fn test_select_reinsertion_target_within_ratio() {
        // Arrange
        let graph = four_cycle();
        let clusters = vec![cluster_of(&graph, &[0, 1]), cluster_of(&graph, &[2, 3])];
        let engine = GraphCluster { completeness_ratio: 1.0, ..Default::default() };
        let edge = Edge::new(1, 2, 0.8);
        let mut rng = SmallRng::seed_from_u64(3);

        // Act
        let (node, target) = engine.select_reinsertion_target(&graph, &clusters, &edge, &mut rng).unwrap();

        // Assert
        assert!(node.global_id == 1 || node.global_id == 2);
        assert!(!clusters[target].contains_id(node.global_id));
        let fixed = if node.global_id == 1 { 2 } else { 1 };
        assert!(clusters[target].contains_id(fixed));
    }

    #[test]
    fn test_select_reinsertion_target_rejects_overlap() {
        // Arrange
        let graph = four_cycle();
        let clusters = vec![cluster_of(&graph, &[0, 1]), cluster_of(&graph, &[2, 3])];
        let engine = GraphCluster { completeness_ratio: 0.0, ..Default::default() };
        let edge = Edge::new(1, 2, 0.8);
        let mut rng = SmallRng::seed_from_u64(3);

        // Act & Assert
        for _ in 0..8 {
            assert!(engine.select_reinsertion_target(&graph, &clusters, &edge, &mut rng).is_none());
        }
    }

    fn clusters_of(original: &ImageGraph, members: &[&[usize]]) -> Vec<ImageGraph> {
        members.iter().map(|ids| cluster_of(original, ids)).collect()
    }

    #[test]
    fn test_overlap_tally_tracks_insertions() {
        // Arrange
        let graph = ring(6);
        let mut clusters = clusters_of(&graph, &[&[0, 1, 2], &[2, 3], &[3, 4]]);
        let mut tally = OverlapTally::new(&clusters);
        assert_eq!(tally.shared, vec![1, 2, 1]);

        // Act
        tally.record_insertion(&clusters, 0, 2);
        let node = graph.node(0).unwrap().clone();
        clusters[2].add_node(node);

        // Assert
        assert_eq!(tally.shared, vec![2, 2, 2]);
        assert_eq!(tally.shared, OverlapTally::new(&clusters).shared);
    }

    #[test]
    fn test_reinsertion_target_skips_clusters_over_ratio() {
        // Arrange
        let graph = ring(6);
        let clusters = clusters_of(&graph, &[&[0, 1, 2], &[2, 3], &[3, 4]]);
        let tally = OverlapTally::new(&clusters);
        let engine = GraphCluster { completeness_ratio: 0.5, ..Default::default() };

        // Act & Assert
        // {0, 1, 2} would share 1 of 4 nodes.
        assert_eq!(engine.reinsertion_target(&clusters, &tally, 2, 5), Some(0));
        // {2, 3} would share 2 of 3 nodes, {3, 4} only 1 of 3.
        assert_eq!(engine.reinsertion_target(&clusters, &tally, 3, 5), Some(2));
    }

    #[test]
    fn test_reinsertion_target_rejects_overflowing_home() {
        // Arrange
        let graph = ring(9);
        let clusters = clusters_of(&graph, &[&[0, 1, 2], &[2, 3], &[3, 4], &[5, 6, 7, 8]]);
        let tally = OverlapTally::new(&clusters);
        let strict = GraphCluster { completeness_ratio: 0.5, ..Default::default() };
        let loose = GraphCluster { completeness_ratio: 0.7, ..Default::default() };

        // Act & Assert
        // {5, 6, 7, 8} would share 1 of 5 nodes, but {0, 1, 2}, the home of node 1,
        // would share 2 of 3.
        assert_eq!(strict.reinsertion_target(&clusters, &tally, 5, 1), None);
        assert_eq!(loose.reinsertion_target(&clusters, &tally, 5, 1), Some(3));
    }

    #[test]
    fn test_reinsertion_target_of_resident_node_uses_current_ratio() {
        // Arrange
        let graph = ring(7);
        let clusters = clusters_of(&graph, &[&[0, 1, 2, 3], &[3, 4, 5, 6]]);
        let tally = OverlapTally::new(&clusters);
        let engine = GraphCluster { completeness_ratio: 0.5, ..Default::default() };
        let strict = GraphCluster { completeness_ratio: 0.2, ..Default::default() };

        // Act & Assert
        // Node 3 already lives in {0, 1, 2, 3}, which shares 1 of 4 nodes.
        assert_eq!(engine.reinsertion_target(&clusters, &tally, 0, 3), Some(0));
        assert_eq!(strict.reinsertion_target(&clusters, &tally, 0, 3), None);
        // Node 0 moves: its home would share 2 of 4, the receiver 2 of 5.
        assert_eq!(engine.reinsertion_target(&clusters, &tally, 4, 0), Some(1));
    }

    #[test]
    fn test_bi_partition_follows_oracle() {
        // Arrange
        let graph = four_cycle();
        let mut oracle = FixedOracle(vec![0, 1, 0, 1]);

        // Act
        let (left, right) = bi_partition(&graph, &mut oracle).unwrap();

        // Assert
        assert_eq!(left.nodes().iter().map(|node| node.global_id).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(right.nodes().iter().map(|node| node.global_id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(left.edge_count(), 0);
    }

    #[test]
    fn test_bi_partition_rejects_degenerate_splits() {
        // Arrange
        let graph = four_cycle();

        // Act
        let single_part = bi_partition(&graph, &mut SinglePartOracle);
        let out_of_range = bi_partition(&graph, &mut FixedOracle(vec![0, 1, 2, 1]));

        // Assert
        assert!(matches!(single_part, Err(Error::DegenerateSplit { left: 4, right: 0 })));
        assert!(matches!(out_of_range, Err(Error::PartOutOfRange { vertex: 2, .. })));
    }

    #[test]
    fn test_initial_clusters_of_four_cycle() {
        // Arrange
        let graph = four_cycle();
        let engine = GraphCluster { size_upper_bound: 2, completeness_ratio: 0.5, seed: Some(5), ..Default::default() };
        let mut oracle = MultiLevelPartitioner { seed: Some(5), ..Default::default() };

        // Act
        let initial = engine.initial_clusters(&graph, &mut oracle).unwrap();

        // Assert
        assert_eq!(initial.len(), 2);
        assert!(initial.iter().all(|cluster| cluster.node_count() == 2));
        assert_eq!(covered_ids(&initial).len(), 4);
    }

    #[test]
    fn test_expand_clusters_of_four_cycle() {
        // Arrange
        let graph = four_cycle();
        let engine = GraphCluster { size_upper_bound: 2, completeness_ratio: 0.5, seed: Some(5), ..Default::default() };
        let mut oracle = MultiLevelPartitioner { seed: Some(5), ..Default::default() };
        let initial = engine.initial_clusters(&graph, &mut oracle).unwrap();

        // Act
        let clusters = engine.expand_clusters(&graph, initial, &mut oracle).unwrap();

        // Assert
        assert!(clusters.iter().all(|cluster| !cluster.is_empty() && cluster.node_count() <= 2));
        assert!(max_overlap_ratio(&clusters) <= 0.5 + 1e-9);
        assert_eq!(covered_ids(&clusters), (0..4).collect::<FxHashSet<usize>>());
    }

    #[test]
    fn test_expand_clusters_falls_back_to_min_cut() {
        // Arrange
        let graph = ring(6);
        let engine = GraphCluster { size_upper_bound: 2, completeness_ratio: 0.5, seed: Some(11), ..Default::default() };

        // Act
        let clusters = engine.expand_clusters(&graph, vec![graph.clone()], &mut SinglePartOracle).unwrap();

        // Assert
        assert!(clusters.iter().all(|cluster| cluster.node_count() <= 2));
        assert!(max_overlap_ratio(&clusters) <= 0.5 + 1e-9);
        assert_eq!(covered_ids(&clusters), (0..6).collect::<FxHashSet<usize>>());
    }

    #[test]
    fn test_expand_clusters_of_ring() {
        // Arrange
        let graph = ring(20);
        let engine = GraphCluster { size_upper_bound: 6, completeness_ratio: 0.3, seed: Some(7), ..Default::default() };
        let mut oracle = MultiLevelPartitioner { seed: Some(7), ..Default::default() };
        let initial = engine.initial_clusters(&graph, &mut oracle).unwrap();

        // Act
        let clusters = engine.expand_clusters(&graph, initial, &mut oracle).unwrap();

        // Assert
        assert!(clusters.iter().all(|cluster| cluster.node_count() <= 6));
        for (i, cluster) in clusters.iter().enumerate() {
            for (j, other) in clusters.iter().enumerate() {
                if i != j {
                    let ratio = repeated_node_count(cluster, other) as f64 / cluster.node_count() as f64;
                    assert!(ratio <= 0.3 + 1e-9);
                }
            }
        }
        assert_eq!(covered_ids(&clusters), (0..20).collect::<FxHashSet<usize>>());
    }

    #[test]
    fn test_naive_cluster_keeps_clusters() {
        // Arrange
        let graph = four_cycle();
        let engine = GraphCluster::default();
        let initial = vec![cluster_of(&graph, &[0, 1]), ImageGraph::new(), cluster_of(&graph, &[2, 3])];

        // Act
        let clusters = engine.naive_cluster(initial);

        // Assert
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].nodes()[0].global_id, 2);
    }

    #[test]
    fn test_invalid_configuration() {
        let graph = four_cycle();
        let engine = GraphCluster { completeness_ratio: 1.5, ..Default::default() };
        assert!(matches!(engine.validate(), Err(Error::InvalidConfig(_))));

        let engine = GraphCluster { size_upper_bound: 0, ..Default::default() };
        assert!(matches!(engine.expand_clusters(&graph, vec![], &mut SinglePartOracle), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_build_graph_from_files() -> Result<(), std::io::Error> {
        // Arrange
        let temp_dir = tempdir()?;
        let image_list = temp_dir.path().join("images.txt");
        File::create(&image_list)?.write_all(b"a.jpg b.jpg c.jpg\n")?;
        let score_file = temp_dir.path().join("scores.txt");
        File::create(&score_file)?.write_all(b"0 1 0.5\n1 1 0.9\n1 2 0.4\n2 7 0.3\n")?;
        let engine = GraphCluster::default();

        // Act
        let graph = engine.build_graph(&image_list, &score_file);
        let missing = engine.build_graph(&temp_dir.path().join("missing.txt"), &score_file);

        // Assert
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 4);
        assert!(graph.has_edge(1, 2));
        assert!(!graph.has_edge(1, 1));
        assert_eq!(graph.node(2).map(|node| node.image_path.as_str()), Some("c.jpg"));
        assert!(missing.is_empty());
        Ok(())
    }
}
