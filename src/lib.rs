//! Localized agent-based epidemiological simulator.
//!
//! A scenario is described by a multi-floor building footprint rendered as
//! color-coded PNG layers, a population of agents with schedules and personal
//! protective attributes, and a virus with transmission parameters. The model
//! advances the population through discrete time while a viral concentration
//! field diffuses and decays over the walkable grid, and persists compact
//! per-iteration snapshots for downstream analysis.
//!
//! The crate is organized around the simulation kernel:
//!
//! - [`terrain`] classifies raster maps into named boolean masks,
//! - [`pathing`] builds the walkable grid graph and the transit-anchored
//!   pathfinder that makes per-agent pathing affordable,
//! - [`field`] evolves the airborne viral concentration,
//! - [`agent`] and [`model`] drive schedule-driven movement and SIR state
//!   progression,
//! - [`writer`], [`publisher`], and [`launcher`] persist results and manage
//!   the run lifecycle (single-run threaded pipeline or parallel batches).

pub mod agent;
pub mod config;
pub mod error;
pub mod field;
pub mod launcher;
pub mod model;
pub mod pathing;
pub mod publisher;
pub mod scenario;
pub mod stats;
pub mod terrain;
pub mod writer;

/// Grid cell coordinate `(x, y, z)` where `x` indexes rows, `y` columns and
/// `z` the floor.
pub type Cell = [usize; 3];

pub use error::{Error, Result};
pub use field::VIRUS_SCALE;
