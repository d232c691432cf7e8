//! Run lifecycle and execution harness.
//!
//! A run directory holds the canonical `run.json` record, the `run.log`
//! file and the result artifacts. Single runs execute as a three-thread
//! pipeline (simulation, publisher, writer); batches serialize the model
//! once and fan independent runs out over a thread pool. Status transitions
//! CREATED -> RUNNING -> SUCCESS | FAILURE are the only communication owed
//! to external observers.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::publisher::{publish, subscribe, Payload};
use crate::writer::StreamWriter;

/// Bounded join timeout for pipeline workers after a fault.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Running,
    Success,
    Failure,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
        };
        write!(f, "{name}")
    }
}

/// Canonical run record, persisted as `run.json` in the run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    pub config: PathBuf,
    pub logfile: PathBuf,
    pub save_dir: PathBuf,
    pub runs: u32,
}

impl RunRecord {
    fn record_path(dir: &Path) -> PathBuf {
        dir.join("run.json")
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(Self::record_path(dir))?;
        serde_json::from_str(&text).map_err(|e| Error::BadConfig(e.to_string()))
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::WriteFault(e.to_string()))?;
        fs::write(Self::record_path(&self.save_dir), text)?;
        Ok(())
    }

    fn set_status(&mut self, status: RunStatus) -> Result<()> {
        info!(id = %self.id, %status, "run status transition");
        self.status = status;
        self.save()
    }

    /// Result artifacts present in the run directory, sorted by run index.
    pub fn artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.save_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "npz"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// Current status of a run directory.
pub fn query(dir: &Path) -> Result<RunStatus> {
    Ok(RunRecord::load(dir)?.status)
}

/// Artifact paths of a run directory.
pub fn fetch(dir: &Path) -> Result<Vec<PathBuf>> {
    RunRecord::load(dir)?.artifacts()
}

pub struct Launcher {
    pub record: RunRecord,
    config: Config,
    paths_dir: Option<PathBuf>,
    overwrite: bool,
}

impl Launcher {
    /// Register a run: validate the config, create the run directory and
    /// persist the CREATED record.
    pub fn submit(
        config_path: &Path,
        save_dir: &Path,
        runs: u32,
        overwrite: bool,
        paths_dir: Option<&Path>,
    ) -> Result<Self> {
        let config = Config::load(config_path)?;
        if runs == 0 {
            return Err(Error::BadConfig("runs must be >= 1".into()));
        }
        fs::create_dir_all(save_dir)?;

        let stored_config = save_dir.join("config.json");
        if config_path != stored_config {
            fs::copy(config_path, &stored_config)?;
        }

        let record = RunRecord {
            id: config.scenario.sim.name.clone(),
            name: config.scenario.sim.name.clone(),
            status: RunStatus::Created,
            config: stored_config,
            logfile: save_dir.join("run.log"),
            save_dir: save_dir.to_path_buf(),
            runs,
        };
        record.save()?;

        Ok(Launcher {
            record,
            config,
            paths_dir: paths_dir.map(Path::to_path_buf),
            overwrite,
        })
    }

    /// Execute the run and drive the status lifecycle. Construction faults
    /// surface before any iteration runs and leave no partial output.
    pub fn start(&mut self) -> Result<()> {
        self.record.set_status(RunStatus::Running)?;
        debug!(save_dir = %self.record.save_dir.display(), runs = self.record.runs, "run started");

        let result = if self.record.runs > 1 {
            self.run_parallel()
        } else {
            self.run_single()
        };

        match result {
            Ok(()) => {
                self.record.set_status(RunStatus::Success)?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "run failed");
                self.record.set_status(RunStatus::Failure)?;
                Err(e)
            }
        }
    }

    /// Single run: simulation, publisher and writer threads cooperating
    /// over a bounded queue and a loopback socket.
    fn run_single(&self) -> Result<()> {
        let mut model = Model::new(&self.config, self.paths_dir.as_deref())?;
        // single runs replay exactly as run 0 of a batch
        model.reseed(0);
        let outfile = self.record.save_dir.join("0.npz");

        let terminate = Arc::new(AtomicBool::new(false));
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        // capacity 1: the simulation only produces once the previous frame
        // has been drained, so subscribers cannot fall arbitrarily behind
        let (frames_tx, frames_rx) = bounded::<Payload>(1);

        debug!(port, "starting simulation|publisher|writer threads");
        let publisher = spawn_worker("publisher", &terminate, {
            let terminate = Arc::clone(&terminate);
            move || publish(frames_rx, listener, terminate)
        })?;
        let writer = spawn_worker("writer", &terminate, {
            let terminate = Arc::clone(&terminate);
            let outfile = outfile.clone();
            move || {
                let stream = subscribe(port)?;
                StreamWriter::new(outfile).write(stream, &terminate)
            }
        })?;
        let simulation = spawn_worker("simulation", &terminate, {
            let terminate = Arc::clone(&terminate);
            move || model.simulate(&frames_tx, &terminate)
        })?;

        let mut fault: Option<Error> = None;
        for (name, handle) in [
            ("simulation", simulation),
            ("publisher", publisher),
            ("writer", writer),
        ] {
            match join_worker(name, handle, fault.is_some()) {
                Ok(()) => {}
                Err(e) if fault.is_none() => fault = Some(e),
                Err(e) => debug!(worker = name, error = %e, "secondary worker error"),
            }
        }

        match fault {
            None => {
                info!(artifact = %outfile.display(), "simulation results saved");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Batch: serialize the model once, then fan `runs` independent tasks
    /// out over a worker pool, each writing its own artifact.
    fn run_parallel(&self) -> Result<()> {
        let runs = self.record.runs;
        let save_dir = &self.record.save_dir;
        let filenames: Vec<PathBuf> = (0..runs)
            .map(|i| save_dir.join(format!("{i}.npz")))
            .collect();
        if !self.overwrite && filenames.iter().any(|f| f.exists()) {
            return Err(Error::OutputConflict(save_dir.clone()));
        }

        let model = Model::new(&self.config, self.paths_dir.as_deref())?;
        let snapshot = tempfile::Builder::new()
            .prefix("model-")
            .suffix(".bin.gz")
            .tempfile_in(save_dir)?;
        let mut encoder = GzEncoder::new(BufWriter::new(snapshot.as_file()), Compression::fast());
        bincode::serialize_into(&mut encoder, &model)?;
        encoder.finish()?.flush()?;
        drop(model);

        let workers = num_cpus::get().min(runs as usize).max(1);
        info!(runs, workers, "scheduling batch runs");
        let pool = ThreadPool::new(workers);
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        for (index, outfile) in filenames.into_iter().enumerate() {
            let results_tx = results_tx.clone();
            let snapshot_path = snapshot.path().to_path_buf();
            pool.execute(move || {
                let result = run_batch_task(&snapshot_path, index as u64, &outfile);
                let _ = results_tx.send((index, result.map_err(|e| e.to_string())));
            });
        }
        drop(results_tx);
        pool.join();

        let results: Vec<(usize, std::result::Result<(), String>)> = results_rx.iter().collect();
        for (index, result) in &results {
            if let Err(reason) = result {
                return Err(Error::WorkerFault {
                    worker: format!("run-{index}"),
                    reason: reason.clone(),
                });
            }
        }
        if results.len() != runs as usize {
            return Err(Error::worker("batch", "a worker died without reporting"));
        }
        info!(runs, "all batch runs completed");
        Ok(())
    }
}

/// Deserialize the shared model snapshot, reseed for this run index and
/// simulate with direct writing.
fn run_batch_task(snapshot: &Path, run_index: u64, outfile: &Path) -> Result<()> {
    let file = File::open(snapshot)?;
    let mut model: Model = bincode::deserialize_from(GzDecoder::new(BufReader::new(file)))?;
    model.reseed(run_index);
    model.simulate_direct(outfile)
}

/// Spawn a named worker that raises the shared termination signal when it
/// fails, so the other workers unblock.
fn spawn_worker<F>(
    name: &str,
    terminate: &Arc<AtomicBool>,
    body: F,
) -> Result<thread::JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let terminate = Arc::clone(terminate);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = body();
            if result.is_err() {
                terminate.store(true, Ordering::Relaxed);
            }
            result
        })?;
    Ok(handle)
}

/// Join a worker. After a fault the join is bounded; a worker still alive
/// past the timeout is logged as leaked and abandoned.
fn join_worker(
    name: &str,
    handle: thread::JoinHandle<Result<()>>,
    bounded_join: bool,
) -> Result<()> {
    if bounded_join {
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = name, "still alive after the join timeout, leaking");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(Error::worker(name, "worker panicked")),
    }
}
