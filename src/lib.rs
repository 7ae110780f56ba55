// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe
pub mod graph;
pub mod disjoint_set;
pub mod metrics;
pub mod io;
pub mod algorithms;
pub mod cluster;
pub mod consistency;

use crate::algorithms::Error;
use crate::graph::ImageGraph;

// The `Partition` trait allows for partitioning data.
// Partitioning algorithms implement this trait.
// The generic argument `M` defines the input of the algorithms (e.g. a CSR
// adjacency matrix together with vertex weights).
// The input partition must be of the correct size and its contents may or may
// not be used by the algorithms.
pub trait Partition<M> {
    // Diagnostic data returned for a specific run of the algorithm.
    type Metadata;

    // Error details, should the algorithm fail to run.
    type Error;

    // Partition the given data and output the part ID of each element in
    // `part_ids`.
    //
    // Part IDs must be contiguous and start from zero, meaning the number of
    // parts is one plus the maximum of `part_ids`.  If a lower ID does not
    // appear in the array, the part is assumed to be empty.
    fn partition(&mut self, part_ids: &mut [usize], data: M)
                 -> Result<Self::Metadata, Self::Error>;
}

/// The graph-partitioning capability the clustering engine is built on.
///
/// Given a weighted image graph and a part count `k`, an oracle returns the
/// part ID (in `0..k`) of every node, in node order.
pub trait PartitionOracle {
    fn partition_graph(&mut self, graph: &ImageGraph, num_parts: usize) -> Result<Vec<usize>, Error>;
}
