// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe

use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator};
use rayon::iter::ParallelIterator as _;
use std::iter::{Cloned, Zip};
use std::slice::Iter;
use ::sprs::{CsMat, TriMat};
use crate::graph::ImageGraph;

/// Similarity scores are turned into integer edge weights by this factor.
pub const SCORE_SCALE: f64 = 1e4;

/// Integer edge weight of a similarity score.
pub fn scaled_score(score: f64) -> i64 {
    (score * SCORE_SCALE).round() as i64
}

/// Struct that represents a graph with integer edge weights, the input of the partitioners
#[derive(Debug, Clone)]
pub struct CsrGraph {
    /// The CsMat (from sprs) is used to store the graph as a sparse matrix in CSR format
    pub graph_csr: CsMat<i64>
}

impl Default for CsrGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrGraph {

    /// Create a new graph
    pub fn new() -> Self {
        Self {
            graph_csr: CsMat::empty(sprs::CSR, 0)
        }
    }

    /// Build a square matrix from `(row, column, weight)` triplets. Duplicated
    /// positions are summed.
    pub fn from_triplets(num_vertices: usize, triplets: impl IntoIterator<Item = (usize, usize, i64)>) -> Self {
        let mut triplet_matrix = TriMat::new((num_vertices, num_vertices));
        for (row, col, weight) in triplets {
            triplet_matrix.add_triplet(row, col, weight);
        }
        Self {
            graph_csr: triplet_matrix.to_csr()
        }
    }

    /// Convert an image graph, scaling every score by [`SCORE_SCALE`].
    pub fn from_image_graph(graph: &ImageGraph) -> Self {
        Self::from_triplets(
            graph.node_count(),
            graph.edges().map(|edge| (edge.src, edge.dst, scaled_score(edge.score))),
        )
    }

    /// The number of vertices in the graph.
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.graph_csr.rows(), self.graph_csr.cols());
        self.graph_csr.rows()
    }

    /// Whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An iterator over the neighbors of the given vertex.
    pub fn neighbors(&self, vertex: usize) -> Zip<Cloned<Iter<'_, usize>>, Cloned<Iter<'_, i64>>> {
        let (indices, data) = match self.graph_csr.outer_view(vertex) {
            Some(row) => row.into_raw_storage(),
            None => (&[][..], &[][..]),
        };
        indices.iter().cloned().zip(data.iter().cloned())
    }

    /// Insert an edge with two vertices on either ends.
    pub fn insert(&mut self, vertex1: usize, vertex2: usize, edge_weight: i64) {
        self.graph_csr.insert(vertex1, vertex2, edge_weight);
    }

    /// Get edge weight for a pair of vertices.
    pub fn get_edge_weight(&self, vertex1: usize, vertex2: usize) -> Option<i64> {
        self.graph_csr.get(vertex1, vertex2).cloned()
    }

    /// The edge cut of a partition.
    ///
    /// Given a partition and a weighted graph, the edge cut of a partition is
    /// defined as the total weight of the edges that link vertices of different
    /// parts. Each undirected edge is counted once.
    pub fn edge_cut(&self, partition: &[usize]) -> i64
    {
        debug_assert_eq!(self.len(), partition.len());

        let indptr = self.graph_csr.indptr().into_raw_storage();
        let indices = self.graph_csr.indices();
        let data = self.graph_csr.data();
        indptr
            .par_iter()
            .zip(&indptr[1..])
            .enumerate()
            .map(|(vertex, (start, end))| {
                let neighbors = &indices[*start..*end];
                let edge_weights = &data[*start..*end];
                let vertex_part = partition[vertex];
                neighbors
                    .iter()
                    .zip(edge_weights)
                    .filter(|(neighbor, _edge_weight)| **neighbor < vertex)
                    .filter(|(neighbor, _edge_weight)| vertex_part != partition[**neighbor])
                    .map(|(_neighbor, edge_weight)| *edge_weight)
                    .sum::<i64>()
            })
            .sum()
    }
}
