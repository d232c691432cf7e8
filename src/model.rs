//! Simulation model: scenario plus population, and the tick loop.
//!
//! One recorded iteration is `save_resolution` sub-ticks; each sub-tick
//! moves every agent in population order, ventilates the map and advances
//! the simulated clock by `t_step` seconds. Snapshots are emitted once per
//! iteration, either onto the publisher queue (threaded pipeline) or into
//! memory for a single-pass write (batch workers).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::Agent;
use crate::config::{AgentSpec, AgentsConfig, Config, Zone};
use crate::error::{Error, Result};
use crate::publisher::Payload;
use crate::scenario::Scenario;
use crate::writer::{self, AgentSummary, RunData};

fn detached_rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub scenario: Scenario,
    pub population: Vec<Agent>,
    seed: u64,
    /// No agent has ever been contagious and the field is zero, so
    /// ventilation can be skipped.
    trivial: bool,
    /// Not part of the snapshot; batch workers reseed per run.
    #[serde(skip, default = "detached_rng")]
    rng: StdRng,
}

impl Model {
    /// Build the scenario and instantiate the population. Zone references
    /// are checked here so that config faults surface before any iteration
    /// runs.
    pub fn new(config: &Config, paths_dir: Option<&Path>) -> Result<Self> {
        let seed = config.scenario.sim.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);

        let scenario = Scenario::new(config.scenario.clone(), paths_dir)?;
        validate_zones(&scenario, &config.agents)?;

        let mut population = Vec::with_capacity(
            config.agents.random_agents + config.agents.custom.len(),
        );
        let urgency = Uniform::new(0.75, 0.99);
        for _ in 0..config.agents.random_agents {
            let mut spec = config.agents.default.clone();
            spec.info.urgency = rng.sample(urgency);
            population.push(Agent::new(&scenario, &spec, &mut rng)?);
        }
        for agent in population.iter_mut().take(config.agents.random_infected) {
            agent.infect(&mut rng);
        }
        for spec in &config.agents.custom {
            population.push(Agent::new(&scenario, spec, &mut rng)?);
        }

        let trivial = !population.iter().any(|a| a.status.contagious());
        debug!(
            agents = population.len(),
            seed,
            trivial,
            "population instantiated"
        );
        Ok(Model {
            scenario,
            population,
            seed,
            trivial,
            rng,
        })
    }

    /// Reseed the model RNG for an independent run. The multiplier keeps
    /// run streams apart from each other and from the construction stream.
    pub fn reseed(&mut self, run_index: u64) {
        let mixed = self
            .seed
            .wrapping_add(run_index)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        self.rng = StdRng::seed_from_u64(mixed);
    }

    /// One recorded iteration: `save_resolution` sub-ticks.
    pub fn model_step(&mut self) -> Result<()> {
        for _ in 0..self.scenario.sim.save_resolution {
            for agent in &mut self.population {
                agent.move_agent(&mut self.scenario, &mut self.rng)?;
            }
            if self.trivial && self.population.iter().any(|a| a.status.contagious()) {
                self.trivial = false;
            }
            if !self.trivial {
                self.scenario.ventilate();
            }
            self.scenario.advance_clock();
        }
        Ok(())
    }

    /// Position and status of all agents as an `N x 4` snapshot.
    pub fn get_agents(&self) -> Array2<i16> {
        let mut snapshot = Array2::zeros((self.population.len(), 4));
        for (i, agent) in self.population.iter().enumerate() {
            snapshot[[i, 0]] = agent.pos[0] as i16;
            snapshot[[i, 1]] = agent.pos[1] as i16;
            snapshot[[i, 2]] = agent.pos[2] as i16;
            snapshot[[i, 3]] = agent.status.value();
        }
        snapshot
    }

    fn virus_snapshot(&self) -> Array3<i16> {
        self.scenario.field.matrix().mapv(|v| v as i16)
    }

    /// Per-agent metadata for the end-of-run table.
    pub fn summarize_agent_info(&mut self) -> Vec<AgentSummary> {
        let capacity = self.population.len();
        let rng = &mut self.rng;
        self.population
            .iter()
            .map(|agent| AgentSummary {
                age: agent.age,
                sex: if rng.gen_bool(0.5) { "M" } else { "F" }.to_string(),
                long_covid: agent.long_covid,
                prevention_index: agent.prevention_index,
                mask: mask_label(&agent.info.mask_type),
                vax: vax_label(&agent.info.vax_type, agent.info.vax_doses),
                infected: agent.infected,
                hospitalized: agent.hospitalized,
                deceased: agent.deceased,
                capacity,
            })
            .collect()
    }

    /// Run the simulation, emitting one frame set per iteration onto the
    /// publisher queue and the terminal `agent_info` frame at completion.
    pub fn simulate(&mut self, sink: &Sender<Payload>, terminate: &AtomicBool) -> Result<()> {
        let max_iter = self.scenario.sim.max_iter;
        info!(iterations = max_iter, "simulation started");
        for _ in 0..max_iter {
            if terminate.load(Ordering::Relaxed) {
                return Err(Error::worker("simulation", "terminated before completion"));
            }
            self.model_step()?;
            send(sink, Payload::Timestep(self.scenario.timestamp()))?;
            send(sink, Payload::Agents(self.get_agents()))?;
            if self.scenario.sim.save_verbose {
                send(sink, Payload::Virus(self.virus_snapshot()))?;
            }
        }
        send(sink, Payload::AgentInfo(self.summarize_agent_info()))?;
        info!("simulation finished");
        Ok(())
    }

    /// Run the simulation retaining all frames in memory and write the
    /// artifact in a single pass at completion.
    pub fn simulate_direct(&mut self, outfile: &Path) -> Result<()> {
        let max_iter = self.scenario.sim.max_iter;
        let mut data = RunData::default();
        for _ in 0..max_iter {
            self.model_step()?;
            data.timesteps.push(self.scenario.timestamp());
            data.agents.push(self.get_agents());
            if self.scenario.sim.save_verbose {
                data.virus.push(self.virus_snapshot());
            }
        }
        data.agent_info = self.summarize_agent_info();
        debug!(outfile = %outfile.display(), "writing simulation data");
        writer::write_artifact(outfile, &data)
    }
}

fn send(sink: &Sender<Payload>, payload: Payload) -> Result<()> {
    sink.send(payload)
        .map_err(|_| Error::worker("simulation", "publisher queue disconnected"))
}

fn mask_label(mask_type: &str) -> String {
    if mask_type == "NONE" {
        "nomask".to_string()
    } else {
        mask_type.to_lowercase()
    }
}

fn vax_label(vax_type: &str, doses: usize) -> String {
    match doses {
        0 => "novax".to_string(),
        1 => "1dose".to_string(),
        _ => vax_type.to_lowercase(),
    }
}

/// Every zone an agent spec can reference must name a non-empty mask, and
/// the movement fallbacks need OPEN and EXIT to exist.
fn validate_zones(scenario: &Scenario, agents: &AgentsConfig) -> Result<()> {
    for zone in ["OPEN", "EXIT"] {
        if scenario.masks.idxs(zone)?.is_empty() {
            return Err(Error::UnknownZone(zone.to_string()));
        }
    }
    for spec in std::iter::once(&agents.default).chain(&agents.custom) {
        validate_spec_zones(scenario, spec)?;
    }
    Ok(())
}

fn validate_spec_zones(scenario: &Scenario, spec: &AgentSpec) -> Result<()> {
    let info = &spec.info;
    for zone in [&info.start_zone, &info.work_zone, &info.home_zone]
        .into_iter()
        .flatten()
    {
        if scenario.masks.idxs(zone)?.is_empty() {
            return Err(Error::UnknownZone(zone.clone()));
        }
    }
    for zone in info.schedule.values() {
        match zone {
            Zone::Work if info.work_zone.is_none() => {
                return Err(Error::UnknownZone("WORK".to_string()));
            }
            Zone::Home if info.home_zone.is_none() => {
                return Err(Error::UnknownZone("HOME".to_string()));
            }
            Zone::Named(name) => {
                if scenario.masks.idxs(name)?.is_empty() {
                    return Err(Error::UnknownZone(name.clone()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_labels_follow_doses_and_mask_type() {
        assert_eq!(mask_label("NONE"), "nomask");
        assert_eq!(mask_label("N95"), "n95");
        assert_eq!(vax_label("MRNA", 0), "novax");
        assert_eq!(vax_label("MRNA", 1), "1dose");
        assert_eq!(vax_label("MRNA", 2), "mrna");
    }
}
