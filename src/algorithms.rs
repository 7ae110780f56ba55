// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe
use std::fmt;
use std::io;

mod csr_graph;
mod refiner;
mod multilevel_partitioner;
mod external;

pub use csr_graph::{scaled_score, CsrGraph, SCORE_SCALE};
pub use refiner::BoundaryRefiner;
pub use multilevel_partitioner::MultiLevelPartitioner;
pub use external::ExternalPartitioner;


/// Common errors thrown by algorithms.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Input sets don't have matching lengths.
    InputLenMismatch { expected: usize, actual: usize },

    /// Input contains negative values and such values are not supported.
    NegativeValues,

    /// A partition into zero parts was requested.
    InvalidPartCount(usize),

    /// A part ID outside of `0..num_parts` was produced.
    PartOutOfRange { vertex: usize, part: usize, num_parts: usize },

    /// A bi-partition left one side empty.
    DegenerateSplit { left: usize, right: usize },

    /// A configuration value is outside of its domain.
    InvalidConfig(String),

    /// The external partitioning program did not exit successfully.
    OracleFailed { program: String, status: Option<i32> },

    /// The external partitioning program wrote an unreadable line.
    MalformedResponse { line: usize, content: String },

    /// Reading or writing an exchange file failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InputLenMismatch { expected, actual } => write!(
                f,
                "input sets don't have the same length (expected {expected} items, got {actual})",
            ),
            Error::NegativeValues => write!(f, "input contains negative values"),
            Error::InvalidPartCount(count) => write!(f, "cannot partition into {count} parts"),
            Error::PartOutOfRange { vertex, part, num_parts } => write!(
                f,
                "vertex {vertex} was assigned to part {part}, expected a part below {num_parts}",
            ),
            Error::DegenerateSplit { left, right } => write!(
                f,
                "bi-partition produced an empty side ({left} and {right} nodes)",
            ),
            Error::InvalidConfig(message) => write!(f, "invalid configuration: {message}"),
            Error::OracleFailed { program, status: Some(code) } => {
                write!(f, "partitioner {program} exited with status {code}")
            }
            Error::OracleFailed { program, status: None } => {
                write!(f, "partitioner {program} was terminated by a signal")
            }
            Error::MalformedResponse { line, content } => {
                write!(f, "cannot read a part ID from line {line}: {content:?}")
            }
            Error::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Check that `part_ids` is a total assignment of `num_vertices` vertices into
/// `num_parts` parts.
pub fn validate_assignment(part_ids: &[usize], num_vertices: usize, num_parts: usize) -> Result<(), Error> {
    if num_parts == 0 {
        return Err(Error::InvalidPartCount(num_parts));
    }
    if part_ids.len() != num_vertices {
        return Err(Error::InputLenMismatch {
            expected: num_vertices,
            actual: part_ids.len(),
        });
    }
    match part_ids.iter().position(|&part| part >= num_parts) {
        Some(vertex) => Err(Error::PartOutOfRange {
            vertex,
            part: part_ids[vertex],
            num_parts,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_assignment() {
        assert!(validate_assignment(&[0, 1, 1, 0], 4, 2).is_ok());
        assert!(matches!(
            validate_assignment(&[0, 1], 3, 2),
            Err(Error::InputLenMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            validate_assignment(&[0, 2, 1], 3, 2),
            Err(Error::PartOutOfRange { vertex: 1, part: 2, num_parts: 2 })
        ));
        assert!(matches!(validate_assignment(&[], 0, 0), Err(Error::InvalidPartCount(0))));
    }
}
