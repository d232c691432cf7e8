//! Error taxonomy for scenario loading, pathfinding and run execution.

use std::path::PathBuf;

use thiserror::Error;

use crate::Cell;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Schema violation, out-of-range numeric or unknown enum string in a
    /// run configuration.
    #[error("bad config: {0}")]
    BadConfig(String),

    /// Missing map directory, undecodable image or inconsistent floor
    /// shapes.
    #[error("bad map: {0}")]
    BadMap(String),

    /// An agent schedule or spec references a mask name that is not present
    /// in the scenario.
    #[error("unknown zone '{0}'")]
    UnknownZone(String),

    /// Coordinate absent from the precomputed path tables.
    #[error("cell {0:?} is not covered by the path tables")]
    UnknownCell(Cell),

    /// The pathfinder cannot connect start and destination.
    #[error("no route from {from:?} to {to:?}")]
    NoRoute { from: Cell, to: Cell },

    /// Batch mode refused because target output files exist.
    #[error("output files already exist in {}", .0.display())]
    OutputConflict(PathBuf),

    /// A pipeline worker failed; the run is terminated.
    #[error("worker '{worker}' failed: {reason}")]
    WorkerFault { worker: String, reason: String },

    /// I/O failure while writing results. Fatal to the run.
    #[error("failed to write results: {0}")]
    WriteFault(String),

    /// Path cache or model snapshot (de)serialization failure.
    #[error("cache serialization: {0}")]
    Cache(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap any worker-side failure with the worker's name.
    pub fn worker(worker: &str, err: impl std::fmt::Display) -> Self {
        Error::WorkerFault {
            worker: worker.to_string(),
            reason: err.to_string(),
        }
    }
}
