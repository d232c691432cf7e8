//! Scenario state shared by every agent during a run.
//!
//! The scenario owns the terrain masks, the viral field, the prevention and
//! virus parameters, the simulation clock and the pathfinder. Agents hold no
//! reference back; the model passes the scenario into agent operations, and
//! viral deposition is the only mutation an agent performs on it.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Prevention, ScenarioSpec, SimSetup, VirusInfo};
use crate::error::{Error, Result};
use crate::field::{ViralField, VIRUS_SCALE};
use crate::pathing::{GridGraph, OptimizedPathfinder, Router};
use crate::terrain::MapMasks;
use crate::Cell;

/// Ventilation diffusion standard deviation, in cells.
pub const VENT_SIGMA: f32 = 0.459;

/// Fixed start of day so schedules behave reproducibly.
fn start_of_day() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .expect("valid date")
        .and_hms_opt(7, 0, 0)
        .expect("valid time")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub sim: SimSetup,
    pub virus: VirusInfo,
    pub prevention: Prevention,
    pub masks: MapMasks,
    pub field: ViralField,
    pub router: Router,
    /// Simulated wall clock.
    pub clock: NaiveDateTime,
    /// Current `HH:MM`, cached for schedule lookups.
    pub now: String,
    /// Set on sub-ticks where the minute advanced.
    pub check_schedule: bool,
}

impl Scenario {
    /// Build a scenario: load and classify the map, zero the viral field and
    /// pick the router. A path cache named after the simulation under
    /// `paths_dir` takes precedence; otherwise the classic graph is built in
    /// memory.
    pub fn new(spec: ScenarioSpec, paths_dir: Option<&Path>) -> Result<Self> {
        let ScenarioSpec {
            sim,
            virus,
            prevention,
        } = spec;

        let masks = MapMasks::load(&sim.mapfile, &sim.terrain)?;
        let field = ViralField::new(masks.shape(), sim.t_step);

        let cached = match paths_dir {
            Some(dir) => OptimizedPathfinder::try_load(dir, &sim.name)?,
            None => None,
        };
        let router = match cached {
            Some(pathfinder) => {
                debug!(name = %sim.name, "loaded optimized path tables");
                Router::Optimized(pathfinder)
            }
            None => {
                debug!(name = %sim.name, "no path cache, building the classic graph");
                Router::Classic(GridGraph::new(
                    masks.valid().clone(),
                    masks.stair_transit(),
                ))
            }
        };

        let clock = start_of_day();
        Ok(Scenario {
            sim,
            virus,
            prevention,
            masks,
            field,
            router,
            now: clock.format("%H:%M").to_string(),
            clock,
            check_schedule: true,
        })
    }

    /// Random cell inside a zone's mask.
    pub fn get_idx<R: Rng>(&self, zone: &str, rng: &mut R) -> Result<Cell> {
        let idxs = self.masks.idxs(zone)?;
        if idxs.is_empty() {
            return Err(Error::UnknownZone(zone.to_string()));
        }
        Ok(idxs[rng.gen_range(0..idxs.len())])
    }

    /// Viral concentration at a cell.
    pub fn virus_level(&self, cell: Cell) -> f32 {
        self.field.level(cell)
    }

    /// Deposit viral load at a cell. The single mutation agents perform.
    pub fn contaminate(&mut self, cell: Cell, concentration: f32) {
        self.field.contaminate(cell, concentration);
    }

    /// One ventilation step over the whole map.
    pub fn ventilate(&mut self) {
        let barrier = self.masks.barrier();
        self.field.ventilate(VENT_SIGMA, VIRUS_SCALE, barrier);
    }

    pub fn sanitize(&mut self) {
        self.field.sanitize();
    }

    /// Advance the clock by one sub-tick and flip the schedule flag when the
    /// HH:MM minute changed.
    pub fn advance_clock(&mut self) {
        self.clock = self.clock + TimeDelta::seconds(i64::from(self.sim.t_step));
        let now = self.clock.format("%H:%M").to_string();
        self.check_schedule = self.now != now;
        if self.check_schedule {
            self.now = now;
        }
    }

    /// Unix timestamp of the simulated clock.
    pub fn timestamp(&self) -> f64 {
        self.clock.and_utc().timestamp() as f64
    }
}
