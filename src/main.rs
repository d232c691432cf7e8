use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use epidemic_abs::config::Config;
use epidemic_abs::launcher::{self, Launcher, RunStatus};
use epidemic_abs::pathing::{GridGraph, OptimizedPathfinder};
use epidemic_abs::stats;
use epidemic_abs::terrain::MapMasks;
use epidemic_abs::writer;

#[derive(Parser)]
#[command(name = "abs", about = "Localized agent-based epidemiological simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a simulation run (or a parallel batch) from a config file.
    Run {
        /// Run configuration JSON.
        config: PathBuf,
        /// Run directory for the record, log and artifacts.
        #[arg(long)]
        save_dir: PathBuf,
        /// Number of independent runs; more than one fans out over a
        /// worker pool.
        #[arg(long, default_value_t = 1)]
        runs: u32,
        /// Allow existing artifacts to be replaced.
        #[arg(long)]
        overwrite: bool,
        /// Directory holding precomputed path caches.
        #[arg(long)]
        paths_dir: Option<PathBuf>,
    },
    /// Report the status and artifacts of an existing run directory.
    Status {
        run_dir: PathBuf,
    },
    /// Precompute and cache the optimized path tables for a scenario map.
    BuildPaths {
        config: PathBuf,
        /// Cache directory; the file is named after the simulation.
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Tally statuses over a finished artifact.
    Stats {
        artifact: PathBuf,
        /// CSV destination, defaults to `<artifact>.stats.csv`.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also render an epicurve HTML plot.
        #[arg(long)]
        plot: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Run {
            config,
            save_dir,
            runs,
            overwrite,
            paths_dir,
        } => {
            std::fs::create_dir_all(&save_dir)?;
            let _guard = init_logging(Some(&save_dir))?;
            let mut launcher =
                Launcher::submit(&config, &save_dir, runs, overwrite, paths_dir.as_deref())?;
            match launcher.start() {
                Ok(()) => {
                    println!("SUCCESS");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("FAILURE: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Status { run_dir } => {
            let _guard = init_logging(None)?;
            let status = launcher::query(&run_dir)?;
            println!("{status}");
            for artifact in launcher::fetch(&run_dir)? {
                println!("{}", artifact.display());
            }
            Ok(if status == RunStatus::Success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::BuildPaths { config, out_dir } => {
            let _guard = init_logging(None)?;
            let config = Config::load(&config)?;
            let sim = &config.scenario.sim;
            let masks = MapMasks::load(&sim.mapfile, &sim.terrain)?;
            let graph = GridGraph::new(masks.valid().clone(), masks.stair_transit());
            let pathfinder = OptimizedPathfinder::build(&graph, &masks.transit_cells())?;
            pathfinder.save(&out_dir, &sim.name)?;
            println!(
                "{}",
                OptimizedPathfinder::cache_path(&out_dir, &sim.name).display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats {
            artifact,
            out,
            plot,
        } => {
            let _guard = init_logging(None)?;
            let data = writer::read_artifact(&artifact)?;
            let tallies = stats::tally(&data);
            let out = out.unwrap_or_else(|| artifact.with_extension("stats.csv"));
            stats::write_csv(&out, &data, &tallies)?;
            println!("{}", out.display());
            if let Some(plot) = plot {
                stats::write_epicurve(&plot, &tallies)?;
                println!("{}", plot.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Stderr logging, plus a `run.log` appender inside the run directory.
fn init_logging(run_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match run_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "run.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let logfile = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(logfile)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}
