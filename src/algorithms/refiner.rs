// This file contains a boundary refiner used in the uncoarsening phase of the
// multilevel partitioner. Its move selection follows the label-propagation step
// of the Jet refiner.
// # Reference
//
// Gilbert, Michael S., et al. "Jet: Multilevel graph partitioning on graphics processing units."
// SIAM Journal on Scientific Computing 46.5 (2024): B700-B724.

use rustc_hash::FxHashSet;
use rayon::prelude::*;
use tracing::debug;
use crate::algorithms::{CsrGraph, Error};
use crate::metrics::{compute_parts_load, imbalance};

#[derive(Debug)]
struct Move {
    // Struct to store data about a move that lowers the edge cut.

    //The index of the vertex.
    vertex: usize,

    // The partition ID of the partition where the vertex should move to.
    partition_id: usize,

    // Decrease of the edge cut when the move is applied on its own.
    gain: i64,
}

fn boundary_refiner(
    partition: &mut [usize],
    weights: &[i64],
    adjacency: &CsrGraph,
    num_of_partitions: usize,
    iterations: u32,
    balance_factor: f64,
) {
    debug_assert_eq!(partition.len(), weights.len());
    debug_assert_eq!(partition.len(), adjacency.len());

    if partition.is_empty() || num_of_partitions < 2 {
        return;
    }

    let max_partition_weight = max_partition_weight(weights, num_of_partitions, balance_factor);
    let mut partition_weights = compute_parts_load(partition, num_of_partitions, weights);
    let mut partition_sizes = vec![0usize; num_of_partitions];
    for &part in partition.iter() {
        partition_sizes[part] += 1;
    }

    let mut vertex_connectivity_data_structure = init_vertex_connectivity_data_structure(adjacency,
                                                                                         partition,
                                                                                         num_of_partitions);
    let mut locked_vertices = vec![false; adjacency.len()];

    for iteration in 0..iterations {
        let mut moves = propose_moves(adjacency,
                                      partition,
                                      &vertex_connectivity_data_structure,
                                      &locked_vertices);

        // Strongest moves first, so that they win the weight budget of their destination.
        moves.sort_by(|a, b| b.gain.cmp(&a.gain).then(a.vertex.cmp(&b.vertex)));

        let mut applied = Vec::new();
        for single_move in moves {
            let vertex = single_move.vertex;
            let source = partition[vertex];
            let destination = single_move.partition_id;

            // Earlier moves of this iteration changed the connectivity, so the gain is
            // re-evaluated against the current state before moving.
            let current_gain = conn(vertex, destination, &vertex_connectivity_data_structure)
                - conn(vertex, source, &vertex_connectivity_data_structure);
            if current_gain <= 0
                || partition_sizes[source] <= 1
                || partition_weights[destination] + weights[vertex] > max_partition_weight {
                continue;
            }

            update_parts_and_vertex_connectivity(adjacency,
                                                 partition,
                                                 &mut vertex_connectivity_data_structure,
                                                 vertex,
                                                 destination);
            partition_weights[source] -= weights[vertex];
            partition_weights[destination] += weights[vertex];
            partition_sizes[source] -= 1;
            partition_sizes[destination] += 1;
            applied.push(vertex);
        }

        if applied.is_empty() {
            break;
        }

        // Vertices that just moved are not allowed to move back in the next iteration.
        // This prevents oscillation of vertices
        lock_vertices(&applied, &mut locked_vertices);

        debug!(iteration,
               moves = applied.len(),
               edge_cut = adjacency.edge_cut(partition),
               imbalance = imbalance(num_of_partitions, partition, weights),
               "refinement iteration");
    }
}

fn propose_moves(graph: &CsrGraph,
                 partition: &[usize],
                 vertex_connectivity_data_structure: &[Vec<i64>],
                 locked_vertices: &[bool]) -> Vec<Move> {
    // For every unlocked boundary vertex, find the adjacent partition it is most
    // connected to and keep the move if it lowers the edge cut.
    (0..graph.len()).into_par_iter().filter_map(|vertex| {
        if locked_vertices[vertex] {
            return None;
        }

        let neighbors_eligible_partitions: Vec<usize> = graph.neighbors(vertex)
            .map(|(neighbor_vertex, _edge_weight)| partition[neighbor_vertex])
            .filter(|&neighbor_partition| neighbor_partition != partition[vertex])
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();

        if neighbors_eligible_partitions.is_empty() {
            return None;
        }

        let dest_partition = get_most_connected_partition(vertex,
                                                          &neighbors_eligible_partitions,
                                                          vertex_connectivity_data_structure);
        let gain = conn(vertex, dest_partition, vertex_connectivity_data_structure)
            - conn(vertex, partition[vertex], vertex_connectivity_data_structure);

        (gain > 0).then_some(Move { vertex, partition_id: dest_partition, gain })
    }).collect()
}

pub(crate) fn max_partition_weight(weights: &[i64], num_of_partitions: usize, balance_factor: f64) -> i64 {
    // The heaviest a partition may get: (1 + balance factor) times the ideal weight,
    // but never below the ideal weight rounded up.
    let total_weight: i64 = weights.iter().sum();
    let ideal = total_weight as f64 / num_of_partitions as f64;
    let relaxed = ((1.0 + balance_factor) * ideal).floor() as i64;
    relaxed.max(ideal.ceil() as i64)
}

fn lock_vertices(moved_vertices: &[usize], locked_vertices: &mut [bool]) {
    locked_vertices.fill(false);

    for &vertex in moved_vertices {
        locked_vertices[vertex] = true;
    }
}

fn conn(vertex_id: usize,
        partition_id: usize,
        vertex_connectivity_data_structure: &[Vec<i64>]) -> i64 {
    // Gets how well a vertex is connected to a partition (adds all the edge weights connected to the partition).

    vertex_connectivity_data_structure[vertex_id][partition_id]
}

fn get_most_connected_partition(
    vertex_id: usize,
    partition_ids: &[usize],
    vertex_connectivity_data_structure: &[Vec<i64>]) -> usize {
    // Get the most connected partition to a particular vertex. Ties go to the lowest partition ID.

    let mut connections = i64::MIN;
    let mut most_connected_partition = partition_ids[0];

    for &partition_id in partition_ids {
        let connection = vertex_connectivity_data_structure[vertex_id][partition_id];
        if connection > connections || (connection == connections && partition_id < most_connected_partition) {
            connections = connection;
            most_connected_partition = partition_id;
        }
    }
    most_connected_partition
}

fn init_vertex_connectivity_data_structure(graph: &CsrGraph,
                                           partition: &[usize],
                                           num_partitions: usize) -> Vec<Vec<i64>> {
    let mut vertex_connectivity_data_structure = vec![vec![0; num_partitions]; partition.len()];

    for vertex in 0..graph.len() {
        for (neighbour_vertex, edge_weight) in graph.neighbors(vertex) {
            vertex_connectivity_data_structure[vertex][partition[neighbour_vertex]] += edge_weight;
        }
    }

    vertex_connectivity_data_structure
}

fn update_parts_and_vertex_connectivity(
    graph: &CsrGraph,
    partition: &mut [usize],
    vertex_connectivity_data_structure: &mut [Vec<i64>],
    vertex: usize,
    destination: usize) {
    let source = partition[vertex];

    for (neighbour_vertex, edge_weight) in graph.neighbors(vertex) {
        vertex_connectivity_data_structure[neighbour_vertex][source] -= edge_weight;
        vertex_connectivity_data_structure[neighbour_vertex][destination] += edge_weight;
    }

    partition[vertex] = destination;
}

/// Greedy boundary refinement of an existing partition.
///
/// Repeatedly moves boundary vertices to the adjacent partition they are most
/// connected to, as long as the move lowers the edge cut and keeps the
/// destination under `(1 + balance_factor)` times the ideal weight. Every
/// applied move strictly lowers the edge cut, so the refinement always ends.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryRefiner {
    /// Number of partitions. Part IDs of the input must be below it.
    pub num_of_partitions: usize,

    /// Upper bound on the number of move rounds.
    pub iterations: u32,

    /// A numerical factor ranging between 0.0 and 1.0 that determines the maximum allowable
    /// deviation for a partition. The maximum weight of a partition with a balance factor of lambda
    /// can be (1+lambda)*((total weight of graph)/(number of partitions)).
    pub balance_factor: f64,
}

impl<'a> crate::Partition<(&'a CsrGraph, &'a [i64])> for BoundaryRefiner {
    type Metadata = ();
    type Error = Error;

    fn partition(
        &mut self,
        part_ids: &mut [usize],
        (adjacency, weights): (&'a CsrGraph, &'a [i64]),
    ) -> Result<Self::Metadata, Self::Error> {

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
        if let Some(vertex) = part_ids.iter().position(|&part| part >= self.num_of_partitions) {
            return Err(Error::PartOutOfRange {
                vertex,
                part: part_ids[vertex],
                num_parts: self.num_of_partitions,
            });
        }
        boundary_refiner(
            part_ids,
            weights,
            adjacency,
            self.num_of_partitions,
            self.iterations,
            self.balance_factor,
        );
        Ok(())
    }
}
