use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error};
use crate::algorithms::Error;
use crate::graph::ImageGraph;
use crate::io::{read_oracle_response, write_oracle_request};
use crate::PartitionOracle;

/// Partition oracle backed by an external graph-partitioning program.
///
/// The graph is written to `normalized_cut_<i>.txt` in `work_dir` (the first
/// such file that does not exist yet), then the program is run as
/// `<program> [args..] <request> <k>` and must write one part ID per node to
/// `<request>.part.<k>`.
#[derive(Debug, Clone)]
pub struct ExternalPartitioner {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub work_dir: PathBuf,
}

impl ExternalPartitioner {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    /// Arguments passed before the request file.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn next_request_path(&self) -> PathBuf {
        (0..)
            .map(|index| self.work_dir.join(format!("normalized_cut_{index}.txt")))
            .find(|path| !path.exists())
            .unwrap_or_else(|| self.work_dir.join("normalized_cut.txt"))
    }
}

fn response_path(request: &Path, num_parts: usize) -> PathBuf {
    let mut name = request.as_os_str().to_owned();
    name.push(format!(".part.{num_parts}"));
    PathBuf::from(name)
}

impl PartitionOracle for ExternalPartitioner {
    fn partition_graph(&mut self, graph: &ImageGraph, num_parts: usize) -> Result<Vec<usize>, Error> {
        if num_parts == 0 {
            return Err(Error::InvalidPartCount(num_parts));
        }

        let request = self.next_request_path();
        write_oracle_request(graph, File::create(&request)?)?;
        debug!(request = %request.display(), nodes = graph.node_count(), num_parts, "running external partitioner");

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&request)
            .arg(num_parts.to_string())
            .status()?;
        if !status.success() {
            error!(program = %self.program.display(), ?status, "external partitioner failed");
            return Err(Error::OracleFailed {
                program: self.program.display().to_string(),
                status: status.code(),
            });
        }

        let response = File::open(response_path(&request, num_parts))?;
        read_oracle_response(BufReader::new(response), graph.node_count(), num_parts)
    }
}
