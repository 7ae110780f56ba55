use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use crate::algorithms::{scaled_score, validate_assignment, Error};
use crate::graph::ImageGraph;

/// Read the image list: whitespace-separated image paths. The position of a
/// path in the list is the global id of its image.
pub fn read_image_list(file_path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(file_path)?;
    Ok(content.split_whitespace().map(str::to_owned).collect())
}

/// Read `src dst score` triples. Reading stops at the first incomplete or
/// unparsable triple.
pub fn read_score_triples(file_path: &Path) -> io::Result<Vec<(usize, usize, f64)>> {
    let content = fs::read_to_string(file_path)?;
    let mut tokens = content.split_whitespace();
    let mut triples = Vec::new();

    while let Some(src) = tokens.next() {
        let triple = (
            src.parse::<usize>().ok(),
            tokens.next().and_then(|dst| dst.parse::<usize>().ok()),
            tokens.next().and_then(|score| score.parse::<f64>().ok()),
        );
        match triple {
            (Some(src), Some(dst), Some(score)) => triples.push((src, dst, score)),
            _ => {
                warn!(file = %file_path.display(), read = triples.len(), "malformed score triple, ignoring the rest of the file");
                break;
            }
        }
    }
    Ok(triples)
}

/// Write the request of the external partitioner.
///
/// The first line holds `<node count> <undirected edge count> 1`, then line
/// `i + 1` lists the neighbors of node `i` as `<1-indexed neighbor> <weight>`
/// pairs, the weight being the score scaled to an integer.
pub fn write_oracle_request<W: Write>(graph: &ImageGraph, writer: W) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    writeln!(writer, "{} {} 1", graph.node_count(), graph.undirected_edges().count())?;
    for local in 0..graph.node_count() {
        let line = graph
            .neighbors(local)
            .map(|edge| format!("{} {}", edge.dst + 1, scaled_score(edge.score)))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "{line}")?;
    }
    writer.flush()
}

/// Read the response of the external partitioner: one part ID per line, in
/// node order. Blank lines are ignored.
pub fn read_oracle_response<R: BufRead>(reader: R, num_nodes: usize, num_parts: usize) -> Result<Vec<usize>, Error> {
    let mut part_ids = Vec::with_capacity(num_nodes);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        let part = content.parse::<usize>().map_err(|_| Error::MalformedResponse {
            line: index + 1,
            content: content.to_owned(),
        })?;
        part_ids.push(part);
    }
    validate_assignment(&part_ids, num_nodes, num_parts)?;
    Ok(part_ids)
}

/// Write the clusters under `output_dir`.
///
/// Cluster `i` gets an `image_part_<i>` folder holding a copy of its images.
/// `graph.txt` lists the global ids of every cluster, one cluster per line, and
/// `clusters.txt` lists the cluster folders. Images that cannot be copied are
/// reported and skipped.
pub fn materialize_clusters(clusters: &[ImageGraph], output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;
    let mut folders = Vec::with_capacity(clusters.len());
    let mut graph_file = BufWriter::new(File::create(output_dir.join("graph.txt"))?);

    for (index, cluster) in clusters.iter().enumerate() {
        let folder = output_dir.join(format!("image_part_{index}"));
        fs::create_dir_all(&folder)?;

        for node in cluster.nodes() {
            let source = Path::new(&node.image_path);
            let Some(file_name) = source.file_name() else {
                warn!(image = %node.image_path, "image path has no file name");
                continue;
            };
            if let Err(err) = fs::copy(source, folder.join(file_name)) {
                warn!(image = %node.image_path, %err, "cannot copy image");
            }
        }

        let ids = cluster
            .nodes()
            .iter()
            .map(|node| node.global_id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(graph_file, "{ids}")?;
        folders.push(folder);
    }
    graph_file.flush()?;

    let mut clusters_file = BufWriter::new(File::create(output_dir.join("clusters.txt"))?);
    for folder in &folders {
        writeln!(clusters_file, "{}", folder.display())?;
    }
    clusters_file.flush()?;

    info!(clusters = clusters.len(), output = %output_dir.display(), "clusters written");
    Ok(folders)
}
