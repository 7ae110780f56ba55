use std::cmp::Reverse;
use std::collections::VecDeque;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;
use rustc_hash::FxHashMap;
use sprs::TriMat;
use tracing::debug;
use crate::algorithms::{validate_assignment, BoundaryRefiner, CsrGraph, Error};
use crate::algorithms::refiner::max_partition_weight;
use crate::graph::ImageGraph;
use crate::{Partition, PartitionOracle};

fn multilevel_partitioner(
    partition: &mut [usize],
    weights: &[i64],
    graph: &CsrGraph,
    num_of_partitions: usize,
    seed: Option<u64>,
    refine_iterations: u32,
    balance_factor: f64,
    coarsening_threshold: usize,
) -> Result<(), Error> {

    let mut coarse_graphs = vec![graph.clone()];
    let mut fine_vertex_to_coarse_vertex_mappings = Vec::new();
    let mut weights_coarse_graphs = vec![weights.to_vec()];

    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy()
    };

    let max_vertex_weight = max_coarse_vertex_weight(weights, num_of_partitions, balance_factor, coarsening_threshold);

    // Keep coarsening the graph until it is small enough to be partitioned directly
    while let (Some(finest), Some(finest_weights)) = (coarse_graphs.last(), weights_coarse_graphs.last()) {
        if finest.len() <= num_of_partitions.max(coarsening_threshold) {
            break;
        }

        let (coarse_graph, fine_vertex_to_coarse_vertex_mapping, weights_of_coarse_graph) =
            heavy_edge_matching_coarse(finest, &mut rng, finest_weights, max_vertex_weight);

        // Coarsening has converged when a level barely shrinks, e.g. on a graph without
        // edges or on a star where only the center gets matched.
        if coarse_graph.len() * 100 > finest.len() * MIN_COARSENING_PERCENT {
            break;
        }
        debug!(level = coarse_graphs.len(), vertices = coarse_graph.len(), "coarsened graph");

        // Store the coarse graphs at every level
        coarse_graphs.push(coarse_graph);
        // Store the node weights of every coarse graph at each level
        weights_coarse_graphs.push(weights_of_coarse_graph);
        // Store the vertex mapping (fine node to coarse node) of the coarse graph at each level.
        fine_vertex_to_coarse_vertex_mappings.push(fine_vertex_to_coarse_vertex_mapping);
    }

    let coarsest_level = coarse_graphs.len() - 1;
    let mut coarse_graph_partition = greedy_growing_partition(&coarse_graphs[coarsest_level],
                                                              &weights_coarse_graphs[coarsest_level],
                                                              num_of_partitions,
                                                              &mut rng);

    for index in (0..coarse_graphs.len()).rev() {

        // Run the refiner to improve the partition.
        BoundaryRefiner { num_of_partitions,
                          iterations: refine_iterations,
                          balance_factor }.partition(&mut coarse_graph_partition,
                                                     (&coarse_graphs[index],
                                                      &weights_coarse_graphs[index][..]))?;

        // Uncoarsen the graph till we reach the initial graph.
        if index > 0 {
            coarse_graph_partition = partition_uncoarse(&coarse_graph_partition, &fine_vertex_to_coarse_vertex_mappings[index - 1]);
        }
    }

    // Copy over the final partition to the partition array which is passed as input.
    partition.copy_from_slice(&coarse_graph_partition);
    Ok(())
}

// A level keeping more than this percentage of the vertices of the finer level ends coarsening.
const MIN_COARSENING_PERCENT: usize = 95;

// Heaviest coarse vertex allowed: 1.5 times the average vertex weight of the coarsest
// graph, and never more than a partition may weigh.
fn max_coarse_vertex_weight(weights: &[i64], num_of_partitions: usize, balance_factor: f64, coarsening_threshold: usize) -> i64 {
    let total_weight: i64 = weights.iter().sum();
    let coarsest_size = num_of_partitions.max(coarsening_threshold).max(1) as f64;
    let average_bound = (1.5 * total_weight as f64 / coarsest_size).ceil() as i64;
    average_bound.min(max_partition_weight(weights, num_of_partitions, balance_factor))
}

// This function coarsens the graph using heavy edge matching algorithm.
// Two vertices are only merged when their combined weight stays within `max_vertex_weight`.
fn heavy_edge_matching_coarse<R: Rng>(graph: &CsrGraph, rng: &mut R, weights: &[i64], max_vertex_weight: i64) -> (CsrGraph, Vec<usize>, Vec<i64>) {

    let mut matched_nodes = vec![false; graph.len()];
    let mut fine_vertex_to_coarse_vertex = vec![0; graph.len()];

    let mut vertices: Vec<usize> = (0..graph.len()).collect();
    vertices.shuffle(rng);
    let mut super_vertex = 0usize;

    // Iterate over the vertices of the graph.
    for vertex in vertices {
        // If already matched, then ignore
        if matched_nodes[vertex] {
            continue;
        }

        // For each vertex, find its most connected unmatched neighbor, i.e the vertex that
        // is connected with the greatest edge weight (lowest index on ties).
        let heaviest_edge_connected_vertex = graph.neighbors(vertex)
            .filter(|&(neighbor_vertex, edge_weight)| {
                neighbor_vertex != vertex
                    && edge_weight > 0
                    && !matched_nodes[neighbor_vertex]
                    && weights[vertex] + weights[neighbor_vertex] <= max_vertex_weight
            })
            .max_by_key(|&(neighbor_vertex, edge_weight)| (edge_weight, Reverse(neighbor_vertex)));

        // Map the original vertex (and its partner, if any) to its vertex in the coarse graph.
        matched_nodes[vertex] = true;
        fine_vertex_to_coarse_vertex[vertex] = super_vertex;
        if let Some((partner, _edge_weight)) = heaviest_edge_connected_vertex {
            matched_nodes[partner] = true;
            fine_vertex_to_coarse_vertex[partner] = super_vertex;
        }
        super_vertex += 1;
    }

    // We combine the edges of a vertex whose neighbors are merged in the coarsed graph.
    // Eg. If vertex 0 is connected to vertex 2 and vertex 3 which is merged into vertex 1 in the
    // coarse graph, then in the coarse graph vertex 0 will be connected to vertex 1 with
    // an edge weight that is the sum of the weights of edges (0, 2) and (0, 3)
    let mut edge_to_weight_mapping: FxHashMap<(usize, usize), i64> = FxHashMap::default();

    for vertex in 0..graph.len() {
        for (neighbor, edge_weight) in graph.neighbors(vertex) {
            let key = (fine_vertex_to_coarse_vertex[vertex], fine_vertex_to_coarse_vertex[neighbor]);
            if key.0 != key.1 {
                *edge_to_weight_mapping.entry(key).or_insert(0) += edge_weight;
            }
        }
    }

    // Construction of the coarse graph. First construct a TriMat and then convert it to CSR format.
    let mut triplet_matrix = TriMat::with_capacity((super_vertex, super_vertex), edge_to_weight_mapping.len());
    for (&(vertex1, vertex2), &weight) in edge_to_weight_mapping.iter() {
        triplet_matrix.add_triplet(vertex1, vertex2, weight);
    }
    let new_coarse_graph = CsrGraph { graph_csr: triplet_matrix.to_csr() };

    // The weight of a coarse vertex is the total weight of the fine vertices it replaces.
    let mut weights_coarse_graph = vec![0; super_vertex];
    for (vertex, &coarse_vertex) in fine_vertex_to_coarse_vertex.iter().enumerate() {
        weights_coarse_graph[coarse_vertex] += weights[vertex];
    }

    (new_coarse_graph, fine_vertex_to_coarse_vertex, weights_coarse_graph)
}

// Projects the partition of a coarse graph back to the finer graph it was built from.
fn partition_uncoarse(partition: &[usize], fine_vertex_to_coarse_vertex_mapping: &[usize]) -> Vec<usize> {
    // If vertex 1 and 2 of the uncoarsed graph were merged into vertex 0 in the coarsed graph
    // and it belonged to partition 0, then vertex 1 and 2 would belong to partition 0 in the uncoarsed graph.
    fine_vertex_to_coarse_vertex_mapping
        .iter()
        .map(|&coarse_vertex| partition[coarse_vertex])
        .collect()
}

// Initial partition of the coarsest graph: vertices are visited in breadth-first order from a
// random start and handed out to the partitions in turn, each partition taking its share of
// the total weight. Breadth-first order keeps every partition mostly connected.
fn greedy_growing_partition<R: Rng>(graph: &CsrGraph, weights: &[i64], num_of_partitions: usize, rng: &mut R) -> Vec<usize> {
    let num_vertices = graph.len();
    let mut partition = vec![0; num_vertices];
    if num_vertices == 0 || num_of_partitions <= 1 {
        return partition;
    }

    let mut visited = vec![false; num_vertices];
    let mut order = Vec::with_capacity(num_vertices);
    let mut next_unvisited = 0;
    let mut start = rng.gen_range(0..num_vertices);

    loop {
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        while let Some(vertex) = queue.pop_front() {
            order.push(vertex);
            for (neighbor, _edge_weight) in graph.neighbors(vertex) {
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }

        // Continue with the next component, if any.
        while next_unvisited < num_vertices && visited[next_unvisited] {
            next_unvisited += 1;
        }
        if next_unvisited == num_vertices {
            break;
        }
        start = next_unvisited;
    }

    let total_weight: i128 = weights.iter().map(|&w| i128::from(w.max(0))).sum();
    let parts = num_of_partitions as i128;
    let mut accumulated_weight: i128 = 0;
    for (position, &vertex) in order.iter().enumerate() {
        let part = if total_weight > 0 {
            accumulated_weight * parts / total_weight
        } else {
            position as i128 * parts / num_vertices as i128
        };
        partition[vertex] = (part as usize).min(num_of_partitions - 1);
        accumulated_weight += i128::from(weights[vertex].max(0));
    }

    partition
}

/// Multilevel Partitioner
///
/// An implementation of the Multilevel (Heavy Edge Matching && Greedy Graph Growing && Boundary Refinement)
/// Partitioner algorithm for graph partition. This is the built-in partition oracle of the
/// clustering engine: image graphs are converted to integer-weighted CSR matrices and every image
/// weighs the same.
///
/// # Example
///
/// ```rust
/// use graph_cluster::algorithms::MultiLevelPartitioner;
/// use graph_cluster::graph::{ImageGraph, Node};
/// use graph_cluster::PartitionOracle;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
///
///     let mut graph = ImageGraph::new();
///     for id in 0..4 {
///         graph.add_node(Node::new(id, format!("{id}.jpg")));
///     }
///     graph.add_undirected_edge(0, 1, 0.9);
///     graph.add_undirected_edge(2, 3, 0.9);
///     graph.add_undirected_edge(1, 2, 0.1);
///
///     let mut partitioner = MultiLevelPartitioner { seed: Some(5), ..Default::default() };
///     let assignment = partitioner.partition_graph(&graph, 2)?;
///
///     assert_eq!(assignment.len(), 4);
///     Ok(())
/// }
/// ```

#[derive(Debug, Clone, Copy)]
pub struct MultiLevelPartitioner {
    /// Number of partitions
    pub num_of_partitions: usize,

    /// Seed for MultiLevel Graph Partitioner
    pub seed: Option<u64>,

    /// Upper bound on the number of refinement rounds at each level.
    pub refine_iterations: u32,

    /// A numerical factor ranging between 0.0 and 1.0 that determines the maximum allowable
    /// deviation for a partition. The maximum weight of a partition with a balance factor of lambda
    /// can be (1+lambda)*((total weight of graph)/(number of partitions)).
    pub balance_factor: f64,

    /// Graphs with at most this many vertices are partitioned without further coarsening.
    pub coarsening_threshold: usize,
}

impl Default for MultiLevelPartitioner {
    fn default() -> Self {
        MultiLevelPartitioner {
            num_of_partitions: 2,
            seed: None,
            refine_iterations: 12,
            balance_factor: 0.1,
            coarsening_threshold: 100,
        }
    }
}

impl<'a> Partition<(&'a CsrGraph, &'a [i64])> for MultiLevelPartitioner {
    type Metadata = ();
    type Error = Error;

    fn partition(
        &mut self,
        part_ids: &mut [usize],
        (adjacency, weights): (&'a CsrGraph, &'a [i64]),
    ) -> Result<Self::Metadata, Self::Error> {

        if self.num_of_partitions == 0 {
            return Err(Error::InvalidPartCount(0));
        }
        if part_ids.len() != weights.len() {
            return Err(Error::InputLenMismatch {
                expected: part_ids.len(),
                actual: weights.len(),
            });
        }
        if part_ids.len() != adjacency.len() {
            return Err(Error::InputLenMismatch {
                expected: part_ids.len(),
                actual: adjacency.len(),
            });
        }
        if weights.iter().any(|&weight| weight < 0) {
            return Err(Error::NegativeValues);
        }
        if part_ids.is_empty() {
            return Ok(());
        }
        multilevel_partitioner(
            part_ids,
            weights,
            adjacency,
            self.num_of_partitions,
            self.seed,
            self.refine_iterations,
            self.balance_factor,
            self.coarsening_threshold,
        )
    }
}

impl PartitionOracle for MultiLevelPartitioner {
    fn partition_graph(&mut self, graph: &ImageGraph, num_parts: usize) -> Result<Vec<usize>, Error> {
        let adjacency = CsrGraph::from_image_graph(graph);
        if adjacency.graph_csr.data().iter().any(|&weight| weight < 0) {
            return Err(Error::NegativeValues);
        }
        let weights = vec![1i64; graph.node_count()];
        let mut part_ids = vec![0; graph.node_count()];

        let mut partitioner = MultiLevelPartitioner { num_of_partitions: num_parts, ..*self };
        partitioner.partition(&mut part_ids, (&adjacency, &weights[..]))?;

        validate_assignment(&part_ids, graph.node_count(), num_parts)?;
        debug!(vertices = graph.node_count(),
               num_parts,
               edge_cut = adjacency.edge_cut(&part_ids),
               "multilevel partition");
        Ok(part_ids)
    }
}
