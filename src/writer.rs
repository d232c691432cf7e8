//! Result artifact writing and reading.
//!
//! One artifact per run index: `<i>.npz` with the compressed `agents`,
//! `timesteps` and (when verbose) `virus` datasets, plus the
//! `<i>.agent_info.csv` metadata table. Readers must tolerate the absence
//! of `virus`. Any I/O failure here is fatal to the run.

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{Array1, Array2, Array3, Array4, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::publisher::{recv_frame, Payload};

/// One row of the `agent_info` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub age: i64,
    pub sex: String,
    pub long_covid: bool,
    pub prevention_index: f64,
    pub mask: String,
    pub vax: String,
    pub infected: bool,
    pub hospitalized: bool,
    pub deceased: bool,
    pub capacity: usize,
}

/// Accumulated per-iteration frames of one run.
#[derive(Debug, Default)]
pub struct RunData {
    pub timesteps: Vec<f64>,
    pub agents: Vec<Array2<i16>>,
    /// Empty unless `save_verbose`.
    pub virus: Vec<Array3<i16>>,
    pub agent_info: Vec<AgentSummary>,
}

/// Datasets of a finished artifact.
#[derive(Debug)]
pub struct Artifact {
    pub agents: Array3<i16>,
    pub timesteps: Array1<f64>,
    pub virus: Option<Array4<i16>>,
}

fn fault(err: impl std::fmt::Display) -> Error {
    Error::WriteFault(err.to_string())
}

/// Sidecar path of the metadata table: `<stem>.agent_info.csv`.
pub fn agent_info_path(outfile: &Path) -> PathBuf {
    outfile.with_extension("agent_info.csv")
}

/// Write the finalized datasets in a single pass.
pub fn write_artifact(outfile: &Path, data: &RunData) -> Result<()> {
    let file = File::create(outfile).map_err(fault)?;
    let mut npz = NpzWriter::new_compressed(file);

    let agents = stack_frames(&data.agents)?;
    npz.add_array("agents", &agents).map_err(fault)?;
    let timesteps = Array1::from_vec(data.timesteps.clone());
    npz.add_array("timesteps", &timesteps).map_err(fault)?;
    if !data.virus.is_empty() {
        let virus = stack_grids(&data.virus)?;
        npz.add_array("virus", &virus).map_err(fault)?;
    }
    npz.finish().map_err(fault)?;

    let table = agent_info_path(outfile);
    let mut csv = csv::Writer::from_path(&table).map_err(fault)?;
    for row in &data.agent_info {
        csv.serialize(row).map_err(fault)?;
    }
    csv.flush().map_err(fault)?;

    info!(artifact = %outfile.display(), iterations = data.timesteps.len(), "artifact written");
    Ok(())
}

/// Read an artifact back; `virus` may be absent.
pub fn read_artifact(path: &Path) -> Result<Artifact> {
    let file = File::open(path)?;
    let mut npz = NpzReader::new(file).map_err(fault)?;
    let names = npz.names().map_err(fault)?;

    let agents: Array3<i16> = npz
        .by_name(&entry(&names, "agents")?)
        .map_err(fault)?;
    let timesteps: Array1<f64> = npz
        .by_name(&entry(&names, "timesteps")?)
        .map_err(fault)?;
    let virus: Option<Array4<i16>> = match entry(&names, "virus") {
        Ok(name) => Some(npz.by_name(&name).map_err(fault)?),
        Err(_) => None,
    };

    Ok(Artifact {
        agents,
        timesteps,
        virus,
    })
}

/// Read the metadata table back.
pub fn read_agent_info(outfile: &Path) -> Result<Vec<AgentSummary>> {
    let mut reader = csv::Reader::from_path(agent_info_path(outfile)).map_err(fault)?;
    reader
        .deserialize()
        .map(|row| row.map_err(fault))
        .collect()
}

fn entry(names: &[String], base: &str) -> Result<String> {
    let with_ext = format!("{base}.npy");
    names
        .iter()
        .find(|n| **n == with_ext || **n == base)
        .cloned()
        .ok_or_else(|| fault(format!("dataset '{base}' missing from artifact")))
}

fn stack_frames(frames: &[Array2<i16>]) -> Result<Array3<i16>> {
    let views: Vec<_> = frames.iter().map(Array2::view).collect();
    ndarray::stack(Axis(0), &views).map_err(fault)
}

fn stack_grids(grids: &[Array3<i16>]) -> Result<Array4<i16>> {
    let views: Vec<_> = grids.iter().map(Array3::view).collect();
    ndarray::stack(Axis(0), &views).map_err(fault)
}

/// Writer worker of the threaded pipeline: consume the subscription stream
/// until the terminal `agent_info` frame, then write the artifact.
pub struct StreamWriter {
    outfile: PathBuf,
}

impl StreamWriter {
    #[must_use]
    pub fn new(outfile: impl Into<PathBuf>) -> Self {
        StreamWriter {
            outfile: outfile.into(),
        }
    }

    pub fn write(self, stream: TcpStream, terminate: &AtomicBool) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let mut data = RunData::default();
        loop {
            if terminate.load(Ordering::Relaxed) {
                return Err(Error::worker("writer", "terminated before agent_info frame"));
            }
            let payload = recv_frame(&mut reader)
                .map_err(|e| Error::WriteFault(format!("subscription stream: {e}")))?;
            match payload {
                Payload::Timestep(t) => data.timesteps.push(t),
                Payload::Agents(frame) => data.agents.push(frame),
                Payload::Virus(grid) => data.virus.push(grid),
                Payload::AgentInfo(info) => {
                    debug!("agent_info frame received, finalizing artifact");
                    data.agent_info = info;
                    break;
                }
            }
        }
        write_artifact(&self.outfile, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_data(with_virus: bool) -> RunData {
        RunData {
            timesteps: vec![1714546800.0, 1714546805.0],
            agents: vec![
                array![[0i16, 0, 0, 1], [2, 3, 0, 2]],
                array![[0i16, 1, 0, 1], [2, 2, 0, 2]],
            ],
            virus: if with_virus {
                vec![
                    Array3::from_elem((3, 4, 1), 0i16),
                    Array3::from_elem((3, 4, 1), 5i16),
                ]
            } else {
                Vec::new()
            },
            agent_info: vec![AgentSummary {
                age: 30,
                sex: "M".to_string(),
                long_covid: false,
                prevention_index: 0.0,
                mask: "nomask".to_string(),
                vax: "novax".to_string(),
                infected: false,
                hospitalized: false,
                deceased: false,
                capacity: 2,
            }],
        }
    }

    #[test]
    fn artifact_round_trips_with_virus() {
        let dir = tempfile::tempdir().unwrap();
        let outfile = dir.path().join("0.npz");
        write_artifact(&outfile, &sample_data(true)).unwrap();

        let artifact = read_artifact(&outfile).unwrap();
        assert_eq!(artifact.agents.dim(), (2, 2, 4));
        assert_eq!(artifact.timesteps.len(), 2);
        assert_eq!(artifact.virus.unwrap().dim(), (2, 3, 4, 1));

        let info = read_agent_info(&outfile).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].vax, "novax");
    }

    #[test]
    fn readers_tolerate_absent_virus() {
        let dir = tempfile::tempdir().unwrap();
        let outfile = dir.path().join("0.npz");
        write_artifact(&outfile, &sample_data(false)).unwrap();

        let artifact = read_artifact(&outfile).unwrap();
        assert!(artifact.virus.is_none());
        assert_eq!(artifact.agents.dim(), (2, 2, 4));
    }

    #[test]
    fn unwritable_target_is_a_write_fault() {
        let err = write_artifact(Path::new("/nonexistent/dir/0.npz"), &sample_data(false))
            .unwrap_err();
        assert!(matches!(err, Error::WriteFault(_)));
    }
}
