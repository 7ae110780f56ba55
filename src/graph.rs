use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use rand::Rng;
use rand::seq::SliceRandom;
use rustc_hash::FxHashSet;
use tracing::warn;
use crate::disjoint_set::DisjointSet;

/// Deepest transitive expansion supported by [`ImageGraph::transitive_expand`].
pub const MAX_EXPANSION_LEVEL: usize = 5;

/// An image of the collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// Index of the image in the graph that first created the node. Sub-graphs keep it so
    /// that clusters can be compared with each other and with the original graph.
    pub global_id: usize,
    pub image_path: String,
    pub feature_path: String,
}

impl Node {
    pub fn new(global_id: usize, image_path: impl Into<String>) -> Self {
        Self {
            global_id,
            image_path: image_path.into(),
            feature_path: String::new(),
        }
    }

    pub fn with_feature_path(mut self, feature_path: impl Into<String>) -> Self {
        self.feature_path = feature_path.into();
        self
    }
}

/// A directed adjacency entry between two local indices.
///
/// Edges are ordered by score so that a `BinaryHeap<Edge>` pops the strongest
/// edge first. Among equal scores the smaller `(src, dst)` pair wins.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub src: usize,
    pub dst: usize,
    pub score: f64,
    /// Number of putative feature matches.
    pub match_count: usize,
    /// Number of geometrically verified matches.
    pub inlier_count: usize,
}

impl Edge {
    pub fn new(src: usize, dst: usize, score: f64) -> Self {
        Self {
            src,
            dst,
            score,
            match_count: 0,
            inlier_count: 0,
        }
    }

    pub fn with_matches(mut self, match_count: usize, inlier_count: usize) -> Self {
        self.match_count = match_count;
        self.inlier_count = inlier_count;
        self
    }

    /// The same edge seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            ..*self
        }
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| (other.src, other.dst).cmp(&(self.src, self.dst)))
            .then_with(|| self.match_count.cmp(&other.match_count))
            .then_with(|| self.inlier_count.cmp(&other.inlier_count))
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Edge {}

/// Neighbors of one node, keyed by the neighbor's local index.
///
/// Ordered so that every walk over the graph, and therefore every seeded
/// random run, is reproducible.
pub type AdjacencyMap = BTreeMap<usize, Edge>;

/// Weighted similarity graph over images.
///
/// Nodes are addressed by their local index (their position in the graph).
/// Undirected edges are stored as two mirrored directed entries. The graph only
/// grows: there is no way to remove a node or an edge, a smaller graph is built
/// with [`ImageGraph::retain_nodes`] instead.
#[derive(Debug, Clone, Default)]
pub struct ImageGraph {
    nodes: Vec<Node>,
    adjacency: Vec<AdjacencyMap>,
}

impl ImageGraph {

    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an edge-less graph over a copy of the given nodes.
    pub fn with_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node.clone());
        }
        graph
    }

    /// The number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        debug_assert_eq!(self.nodes.len(), self.adjacency.len());
        self.nodes.len()
    }

    /// The number of directed adjacency entries (an undirected edge counts twice).
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(BTreeMap::len).sum()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, local: usize) -> Option<&Node> {
        self.nodes.get(local)
    }

    /// Look up a node by its global id.
    pub fn node_by_id(&self, global_id: usize) -> Option<&Node> {
        self.nodes.iter().find(|node| node.global_id == global_id)
    }

    /// Local index of the node with the given global id.
    pub fn map_to_local(&self, global_id: usize) -> Option<usize> {
        self.nodes.iter().position(|node| node.global_id == global_id)
    }

    pub fn contains_id(&self, global_id: usize) -> bool {
        self.map_to_local(global_id).is_some()
    }

    /// Append a node and return its local index.
    pub fn add_node(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.adjacency.push(AdjacencyMap::new());
        self.nodes.len() - 1
    }

    /// Insert a directed edge. Returns false when an endpoint is out of range or
    /// when the entry already exists, in which case the graph is unchanged.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if edge.src >= self.node_count() || edge.dst >= self.node_count() {
            return false;
        }
        match self.adjacency[edge.src].entry(edge.dst) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(edge);
                true
            }
        }
    }

    /// Insert an undirected edge with the given score.
    pub fn add_undirected_edge(&mut self, src: usize, dst: usize, score: f64) -> bool {
        self.add_undirected(Edge::new(src, dst, score))
    }

    /// Insert both directions of an edge, or neither when an endpoint is out of range.
    pub fn add_undirected(&mut self, edge: Edge) -> bool {
        if edge.src >= self.node_count() || edge.dst >= self.node_count() {
            return false;
        }
        let forward = self.add_edge(edge);
        let backward = self.add_edge(edge.reversed());
        forward || backward
    }

    pub fn has_edge(&self, src: usize, dst: usize) -> bool {
        self.edge(src, dst).is_some()
    }

    pub fn edge(&self, src: usize, dst: usize) -> Option<&Edge> {
        self.adjacency.get(src).and_then(|neighbors| neighbors.get(&dst))
    }

    /// Adjacency map of a node.
    pub fn adjacency(&self, local: usize) -> Option<&AdjacencyMap> {
        self.adjacency.get(local)
    }

    /// An iterator over the outgoing edges of the given node.
    pub fn neighbors(&self, local: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.adjacency.get(local).into_iter().flat_map(|neighbors| neighbors.values())
    }

    pub fn degree(&self, local: usize) -> usize {
        self.adjacency.get(local).map_or(0, BTreeMap::len)
    }

    /// Every directed entry of the graph.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.adjacency.iter().flat_map(|neighbors| neighbors.values())
    }

    /// Every undirected edge once, as its `src < dst` direction.
    pub fn undirected_edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges().filter(|edge| edge.src < edge.dst)
    }

    /// Build a new graph holding the nodes accepted by `keep` and the edges
    /// among them. Node order is preserved, local indices are recomputed.
    pub fn retain_nodes(&self, mut keep: impl FnMut(&Node) -> bool) -> ImageGraph {
        let mut remap = vec![None; self.node_count()];
        let mut graph = ImageGraph::new();
        for (old, node) in self.nodes.iter().enumerate() {
            if keep(node) {
                remap[old] = Some(graph.add_node(node.clone()));
            }
        }

        for edge in self.edges() {
            if let (Some(src), Some(dst)) = (remap[edge.src], remap[edge.dst]) {
                graph.add_edge(Edge { src, dst, ..*edge });
            }
        }
        graph
    }

    /// Number of connected components with at least `min_size` nodes.
    /// A `min_size` of zero counts every component.
    pub fn connected_component_count(&self, min_size: usize) -> usize {
        let mut visited = vec![false; self.node_count()];
        let mut count = 0;

        for start in 0..self.node_count() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut queue = VecDeque::from([start]);
            let mut component_size = 0;

            while let Some(current) = queue.pop_front() {
                component_size += 1;
                for edge in self.neighbors(current) {
                    if !visited[edge.dst] {
                        visited[edge.dst] = true;
                        queue.push_back(edge.dst);
                    }
                }
            }

            if min_size == 0 || component_size >= min_size {
                count += 1;
            }
        }
        count
    }

    /// Approximate the minimum cut by random contraction (Karger).
    ///
    /// Every trial shuffles the directed edge list and contracts edges in that
    /// order until two super-nodes remain. The partition with the fewest crossing
    /// entries over all trials is returned; the first list holds node 0.
    /// `trials` defaults to `ceil(n ln n)`.
    pub fn randomized_min_cut<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        trials: Option<usize>,
    ) -> (Vec<usize>, Vec<usize>) {
        let num_nodes = self.node_count();
        if num_nodes < 2 {
            return ((0..num_nodes).collect(), Vec::new());
        }

        let mut edges: Vec<(usize, usize)> = self.edges().map(|edge| (edge.src, edge.dst)).collect();
        let trials = trials.unwrap_or_else(|| default_min_cut_trials(num_nodes)).max(1);

        let mut best_cut = usize::MAX;
        let mut best_partition = (Vec::new(), Vec::new());

        for _ in 0..trials {
            edges.shuffle(rng);
            let mut super_nodes = DisjointSet::new(num_nodes);
            let mut contractions = 0;
            for &(src, dst) in &edges {
                if contractions >= num_nodes - 2 {
                    break;
                }
                if super_nodes.union(src, dst) {
                    contractions += 1;
                }
            }

            let roots: Vec<usize> = (0..num_nodes).map(|vertex| super_nodes.find(vertex)).collect();
            let cut = edges.iter().filter(|&&(src, dst)| roots[src] != roots[dst]).count();
            if cut < best_cut {
                let (left, right): (Vec<usize>, Vec<usize>) =
                    (0..num_nodes).partition(|&vertex| roots[vertex] == roots[0]);
                best_cut = cut;
                best_partition = (left, right);
            }
        }

        best_partition
    }

    /// Fewest-hop path from `src` to `dst`, both included.
    /// Empty when `dst` cannot be reached or an index is out of range.
    pub fn shortest_path(&self, src: usize, dst: usize) -> Vec<usize> {
        let num_nodes = self.node_count();
        if src >= num_nodes || dst >= num_nodes {
            return Vec::new();
        }

        let mut parent: Vec<Option<usize>> = vec![None; num_nodes];
        let mut visited = vec![false; num_nodes];
        visited[src] = true;
        let mut queue = VecDeque::from([src]);

        while let Some(current) = queue.pop_front() {
            if current == dst {
                let mut path = vec![dst];
                let mut vertex = dst;
                while let Some(previous) = parent[vertex] {
                    path.push(previous);
                    vertex = previous;
                }
                path.reverse();
                return path;
            }
            for edge in self.neighbors(current) {
                if !visited[edge.dst] {
                    visited[edge.dst] = true;
                    parent[edge.dst] = Some(current);
                    queue.push_back(edge.dst);
                }
            }
        }
        Vec::new()
    }

    /// Query expansion: list, for every node, the nodes reachable through up to
    /// `level` hops of edges carrying at least `inlier_threshold` verified
    /// matches, excluding the node itself and its direct neighbors.
    ///
    /// The score of an expanded edge is the product of the scores along the
    /// path that first reached it. `level` must lie in `1..=5`, otherwise an
    /// empty result is returned.
    pub fn transitive_expand(&self, level: usize, inlier_threshold: usize) -> Vec<Vec<Edge>> {
        if !(1..=MAX_EXPANSION_LEVEL).contains(&level) {
            warn!(level, max = MAX_EXPANSION_LEVEL, "transitive expansion level out of range");
            return Vec::new();
        }

        let mut expansion_lists = vec![Vec::new(); self.node_count()];
        for (origin, expansion) in expansion_lists.iter_mut().enumerate() {
            let mut visited: FxHashSet<usize> = self.adjacency[origin].keys().copied().collect();
            visited.insert(origin);

            for edge in self.adjacency[origin].values() {
                if edge.inlier_count >= inlier_threshold {
                    self.expand_from(origin, edge.dst, edge.score, level - 1, inlier_threshold, &mut visited, expansion);
                }
            }
        }
        expansion_lists
    }

    fn expand_from(
        &self,
        origin: usize,
        via: usize,
        score: f64,
        remaining: usize,
        inlier_threshold: usize,
        visited: &mut FxHashSet<usize>,
        expansion: &mut Vec<Edge>,
    ) {
        if remaining == 0 {
            return;
        }
        for edge in self.adjacency[via].values() {
            if edge.inlier_count < inlier_threshold || !visited.insert(edge.dst) {
                continue;
            }
            let composed_score = score * edge.score;
            expansion.push(Edge::new(origin, edge.dst, composed_score));
            self.expand_from(origin, edge.dst, composed_score, remaining - 1, inlier_threshold, visited, expansion);
        }
    }
}

fn default_min_cut_trials(num_nodes: usize) -> usize {
    let n = num_nodes as f64;
    (n * n.ln()).ceil() as usize
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use approx::assert_relative_eq;
    use itertools::assert_equal;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use super::*;

    fn graph_with_nodes(num_nodes: usize) -> ImageGraph {
        let mut graph = ImageGraph::new();
        for id in 0..num_nodes {
            graph.add_node(Node::new(id, format!("img_{id}.jpg")));
        }
        graph
    }

    #[test]
    fn test_add_undirected_edge_is_mirrored_and_idempotent() {
        // Arrange
        let mut graph = graph_with_nodes(3);

        // Act
        let first = graph.add_undirected_edge(0, 2, 0.5);
        let second = graph.add_undirected_edge(0, 2, 0.9);
        let reverse = graph.add_undirected_edge(2, 0, 0.9);

        // Assert
        assert!(first);
        assert!(!second);
        assert!(!reverse);
        assert!(graph.has_edge(0, 2));
        assert!(graph.has_edge(2, 0));
        assert_eq!(graph.edge_count(), 2);
        assert_relative_eq!(graph.edge(2, 0).unwrap().score, 0.5);
    }

    #[test]
    fn test_add_undirected_edge_out_of_range_inserts_nothing() {
        // Arrange
        let mut graph = graph_with_nodes(2);

        // Act
        let inserted = graph.add_undirected_edge(1, 5, 0.5);

        // Assert
        assert!(!inserted);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_map_to_local_uses_global_ids() {
        // Arrange
        let mut graph = ImageGraph::new();
        graph.add_node(Node::new(7, "a.jpg"));
        graph.add_node(Node::new(3, "b.jpg"));

        // Act & Assert
        assert_eq!(graph.map_to_local(3), Some(1));
        assert_eq!(graph.map_to_local(7), Some(0));
        assert_eq!(graph.map_to_local(0), None);
        assert_eq!(graph.node_by_id(3).unwrap().image_path, "b.jpg");
    }

    #[test]
    fn test_heap_pops_strongest_edge_and_breaks_ties_by_endpoints() {
        // Arrange
        let mut heap = BinaryHeap::new();
        heap.push(Edge::new(2, 3, 0.5));
        heap.push(Edge::new(0, 1, 0.9));
        heap.push(Edge::new(1, 2, 0.5));

        // Act
        let order: Vec<(usize, usize)> = std::iter::from_fn(|| heap.pop()).map(|edge| (edge.src, edge.dst)).collect();

        // Assert
        assert_eq!(order, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_connected_component_count() {
        // Arrange
        let mut graph = graph_with_nodes(6);
        graph.add_undirected_edge(0, 1, 1.0);
        graph.add_undirected_edge(1, 2, 1.0);
        graph.add_undirected_edge(3, 4, 1.0);

        // Act & Assert
        assert_eq!(graph.connected_component_count(0), 3);
        assert_eq!(graph.connected_component_count(2), 2);
        assert_eq!(graph.connected_component_count(3), 1);
        assert_eq!(graph.connected_component_count(4), 0);
    }

    #[test]
    fn test_shortest_path_on_path_graph() {
        // Arrange
        let mut graph = graph_with_nodes(4);
        graph.add_undirected_edge(0, 1, 1.0);
        graph.add_undirected_edge(1, 2, 1.0);
        graph.add_undirected_edge(2, 3, 1.0);

        // Act
        let path = graph.shortest_path(0, 3);

        // Assert
        assert_eq!(path, vec![0, 1, 2, 3]);
        assert_eq!(graph.shortest_path(2, 2), vec![2]);
    }

    #[test]
    fn test_shortest_path_terminates_on_cycles() {
        // Arrange
        let mut graph = graph_with_nodes(5);
        graph.add_undirected_edge(0, 1, 1.0);
        graph.add_undirected_edge(1, 2, 1.0);
        graph.add_undirected_edge(2, 0, 1.0);
        graph.add_undirected_edge(2, 3, 1.0);

        // Act & Assert
        assert_eq!(graph.shortest_path(1, 3), vec![1, 2, 3]);
        assert!(graph.shortest_path(0, 4).is_empty());
        assert!(graph.shortest_path(0, 9).is_empty());
    }

    #[test]
    fn test_randomized_min_cut_separates_bridged_cliques() {
        // Arrange
        let mut graph = graph_with_nodes(8);
        for clique in [[0, 1, 2, 3], [4, 5, 6, 7]] {
            for i in 0..4 {
                for j in (i + 1)..4 {
                    graph.add_undirected_edge(clique[i], clique[j], 1.0);
                }
            }
        }
        graph.add_undirected_edge(3, 4, 1.0);
        let mut rng = SmallRng::seed_from_u64(5);

        // Act
        let (left, right) = graph.randomized_min_cut(&mut rng, Some(200));

        // Assert
        assert_equal(left, [0, 1, 2, 3]);
        assert_equal(right, [4, 5, 6, 7]);
    }

    #[test]
    fn test_randomized_min_cut_small_graphs() {
        // Arrange
        let mut rng = SmallRng::seed_from_u64(1);
        let single = graph_with_nodes(1);
        let mut pair = graph_with_nodes(2);
        pair.add_undirected_edge(0, 1, 1.0);

        // Act
        let (single_left, single_right) = single.randomized_min_cut(&mut rng, None);
        let (pair_left, pair_right) = pair.randomized_min_cut(&mut rng, None);

        // Assert
        assert_eq!(single_left, vec![0]);
        assert!(single_right.is_empty());
        assert_eq!(pair_left, vec![0]);
        assert_eq!(pair_right, vec![1]);
    }

    #[test]
    fn test_transitive_expand_multiplies_scores() {
        // Arrange
        let mut graph = graph_with_nodes(4);
        graph.add_undirected(Edge::new(0, 1, 0.5).with_matches(100, 50));
        graph.add_undirected(Edge::new(1, 2, 0.5).with_matches(100, 50));
        graph.add_undirected(Edge::new(2, 3, 0.5).with_matches(100, 5));

        // Act
        let expansion = graph.transitive_expand(3, 10);

        // Assert
        assert_eq!(expansion.len(), 4);
        assert_eq!(expansion[0].len(), 1);
        assert_eq!(expansion[0][0].dst, 2);
        assert_relative_eq!(expansion[0][0].score, 0.25);
        assert_eq!(expansion[2].len(), 1);
        assert_eq!(expansion[2][0].dst, 0);
        assert!(expansion[1].is_empty());
        assert!(expansion[3].is_empty());
    }

    #[test]
    fn test_transitive_expand_records_each_target_once() {
        // Arrange
        let mut graph = graph_with_nodes(4);
        for (src, dst) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
            graph.add_undirected(Edge::new(src, dst, 0.8).with_matches(10, 10));
        }

        // Act
        let expansion = graph.transitive_expand(5, 1);

        // Assert
        let targets: Vec<usize> = expansion[0].iter().map(|edge| edge.dst).collect();
        assert_eq!(targets, vec![3]);
    }

    #[test]
    fn test_transitive_expand_rejects_bad_levels() {
        // Arrange
        let mut graph = graph_with_nodes(2);
        graph.add_undirected_edge(0, 1, 1.0);

        // Act & Assert
        assert!(graph.transitive_expand(0, 0).is_empty());
        assert!(graph.transitive_expand(6, 0).is_empty());
        assert_eq!(graph.transitive_expand(1, 0).len(), 2);
    }

    #[test]
    fn test_retain_nodes_reindexes_edges() {
        // Arrange
        let mut graph = graph_with_nodes(4);
        graph.add_undirected_edge(0, 1, 0.1);
        graph.add_undirected_edge(1, 3, 0.3);
        graph.add_undirected_edge(2, 3, 0.2);

        // Act
        let kept = graph.retain_nodes(|node| node.global_id != 2);

        // Assert
        assert_eq!(kept.node_count(), 3);
        assert_eq!(kept.map_to_local(3), Some(2));
        assert!(kept.has_edge(1, 2));
        assert!(kept.has_edge(2, 1));
        assert_eq!(kept.edge_count(), 4);
        assert_relative_eq!(kept.edge(1, 2).unwrap().score, 0.3);
    }
}
