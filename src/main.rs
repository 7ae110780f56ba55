use std::path::{Path, PathBuf};
use std::time::Instant;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use graph_cluster::algorithms::{ExternalPartitioner, MultiLevelPartitioner};
use graph_cluster::cluster::GraphCluster;
use graph_cluster::io::materialize_clusters;
use graph_cluster::metrics::max_overlap_ratio;
use graph_cluster::PartitionOracle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Keep the clusters of the first partition
    Naive,
    /// Split oversized clusters and reinsert the edges lost by the splits
    Expansion,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File listing the image paths
    image_list: PathBuf,

    /// File of `src dst score` similarity triples
    score_file: PathBuf,

    /// Clustering mode
    #[arg(value_enum)]
    mode: Mode,

    /// Largest number of images per cluster
    max_cluster_size: usize,

    /// Largest fraction of a cluster shared with another cluster
    completeness_ratio: f64,

    /// Seed of the random choices
    #[arg(short, long)]
    seed: Option<u64>,

    /// Directory where the clusters are written [default: directory of the score file]
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// External partitioning program, used instead of the built-in multilevel partitioner
    #[arg(short, long)]
    partitioner: Option<PathBuf>,

    /// Number of refinement rounds of the built-in partitioner
    #[arg(short, long, default_value_t = 12)]
    iterations: u32,

    /// Balance factor of the built-in partitioner
    #[arg(short, long, default_value_t = 0.1)]
    balance_factor: f64,
}

impl Args {
    fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            self.score_file
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let engine = GraphCluster {
        size_upper_bound: args.max_cluster_size,
        completeness_ratio: args.completeness_ratio,
        seed: args.seed,
        ..Default::default()
    };
    engine.validate()?;

    let graph = engine.build_graph(&args.image_list, &args.score_file);
    if graph.node_count() < engine.size_upper_bound {
        info!(images = graph.node_count(), bound = engine.size_upper_bound, "the images already fit in one cluster");
        return Ok(());
    }

    let output_dir = args.output_dir();
    std::fs::create_dir_all(&output_dir)?;
    let mut oracle: Box<dyn PartitionOracle> = match &args.partitioner {
        Some(program) => Box::new(ExternalPartitioner::new(program, &output_dir)),
        None => Box::new(MultiLevelPartitioner {
            seed: args.seed,
            refine_iterations: args.iterations,
            balance_factor: args.balance_factor,
            ..Default::default()
        }),
    };

    let start = Instant::now();
    let initial = engine.initial_clusters(&graph, oracle.as_mut())?;
    let clusters = match args.mode {
        Mode::Naive => engine.naive_cluster(initial),
        Mode::Expansion => engine.expand_clusters(&graph, initial, oracle.as_mut())?,
    };
    let elapsed_time = start.elapsed();

    materialize_clusters(&clusters, &output_dir)?;
    println!("Clusters {:?}", clusters.len());
    println!("Max overlap ratio {:?}", max_overlap_ratio(&clusters));
    println!("Execution time {:?}", elapsed_time);
    Ok(())
}
