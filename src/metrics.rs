// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe
use num_traits::ToPrimitive;
use crate::cluster::repeated_node_count;
use crate::graph::ImageGraph;

/// Calculates the total weight for each part of a given partition.
pub fn compute_parts_load(partition: &[usize], num_parts: usize, weights: &[i64]) -> Vec<i64> {
    let mut loads = vec![0; num_parts];

    for (&part, w) in partition.iter().zip(weights.iter()) {
        if part < num_parts {
            loads[part] += w;
        }
    }

    loads
}

/// Compute imbalance after passing part loads.
pub fn compute_imbalance_from_part_loads(num_parts: usize, part_loads: &[i64]) -> f64 {
    let total_weight: i64 = part_loads.iter().sum();

    let ideal_part_weight = total_weight.to_f64().unwrap_or(0.0) / num_parts.to_f64().unwrap_or(1.0);
    if ideal_part_weight == 0.0 {
        return 0.0;
    }

    part_loads
        .iter()
        .map(|part_weight| {
            let part_weight: f64 = part_weight.to_f64().unwrap_or(0.0);
            (part_weight - ideal_part_weight) / ideal_part_weight
        })
        .fold(0.0f64, |acc, dev| acc.max(dev))
}

/// Compute the imbalance of the given partition.
pub fn imbalance(num_parts: usize, partition: &[usize], weights: &[i64]) -> f64 {
    if num_parts == 0 {
        return 0.0;
    }

    let part_loads = compute_parts_load(partition, num_parts, weights);

    compute_imbalance_from_part_loads(num_parts, &part_loads)
}

/// Fraction of the nodes of `cluster` that also belong to `other`.
pub fn overlap_ratio(cluster: &ImageGraph, other: &ImageGraph) -> f64 {
    if cluster.is_empty() {
        return 0.0;
    }
    repeated_node_count(cluster, other).to_f64().unwrap_or(0.0) / cluster.node_count().to_f64().unwrap_or(1.0)
}

/// The largest pairwise overlap ratio of a set of clusters.
pub fn max_overlap_ratio(clusters: &[ImageGraph]) -> f64 {
    let mut max_ratio = 0.0f64;
    for (i, cluster) in clusters.iter().enumerate() {
        for (j, other) in clusters.iter().enumerate() {
            if i != j {
                max_ratio = max_ratio.max(overlap_ratio(cluster, other));
            }
        }
    }
    max_ratio
}
