//! SIR behavior: schedule-driven movement, droplet transmission and the
//! two-phase recovery progression.

use chrono::TimeDelta;
use rand::Rng;
use rand_distr::LogNormal;

use crate::agent::{Agent, Status};
use crate::config::Zone;
use crate::error::{Error, Result};
use crate::field::VIRUS_SCALE;
use crate::scenario::Scenario;
use crate::Cell;

/// `(mu, sigma)` of the log-normal day distributions.
const SEVERE: (f64, f64) = (2.624, 0.170);
const MILD: (f64, f64) = (2.049, 0.246);
const PRESYMPTOMATIC: (f64, f64) = (1.63, 0.50);

/// Probability of droplet infection for one sub-tick of exposure.
pub fn exposure_probability(
    attack_rate: f64,
    level: f32,
    t_step: u32,
    susceptibility: f64,
) -> f64 {
    let v_scale = level as f64 / VIRUS_SCALE as f64;
    let t_scale = t_step as f64 / 3600.0;
    attack_rate * v_scale * t_scale * susceptibility
}

fn days(n: f64) -> TimeDelta {
    TimeDelta::seconds((n * 86_400.0) as i64)
}

impl Agent {
    /// One sub-tick of agent behavior: progression, schedule, movement and
    /// droplet exchange.
    pub fn move_agent<R: Rng>(&mut self, scenario: &mut Scenario, rng: &mut R) -> Result<()> {
        if self.status.contagious() {
            self.recover(scenario, rng)?;
        }
        if !self.status.excluded() && scenario.check_schedule {
            self.check_schedule(scenario, rng)?;
        }

        if let Some(next) = self.path.pop_front() {
            self.pos = next;
        } else if self.in_zone(scenario, &Zone::Exit)? {
            // gone from the map, nothing left to do
            return Ok(());
        } else if self.in_zone(scenario, &Zone::Home)? {
            self.set_wait(300 / scenario.sim.t_step);
        } else if rng.gen_bool(0.5) {
            self.set_task(scenario, &Zone::Open, rng)?;
        } else {
            self.set_wait(300 / scenario.sim.t_step);
        }

        if self.is(Status::Susceptible) {
            let level = scenario.virus_level(self.pos);
            if level > 1.0 {
                self.droplet_expose(scenario, level, rng);
            }
        } else if self.status.contagious() {
            self.droplet_spread(scenario);
        }
        Ok(())
    }

    /// Fire the schedule entry for the current minute, at most once.
    fn check_schedule<R: Rng>(&mut self, scenario: &Scenario, rng: &mut R) -> Result<()> {
        let Some(zone) = self.info.schedule.get(scenario.now.as_str()).cloned() else {
            return Ok(());
        };
        if self.dt.last_action_time.as_deref() != Some(scenario.now.as_str()) {
            self.dt.last_action_time = Some(scenario.now.clone());
            self.set_task(scenario, &zone, rng)?;
        }
        Ok(())
    }

    /// Replace the path with `ticks` copies of the current position.
    pub fn set_wait(&mut self, ticks: u32) {
        self.path = std::iter::repeat(self.pos).take(ticks as usize).collect();
    }

    /// Path to a random cell of the zone, then dwell there: 5 minutes for
    /// OPEN, an hour otherwise, scaled by uniform(0.5, 1.0).
    pub fn set_task<R: Rng>(
        &mut self,
        scenario: &Scenario,
        zone: &Zone,
        rng: &mut R,
    ) -> Result<()> {
        let name = self
            .resolve(zone)
            .ok_or_else(|| Error::UnknownZone(zone.keyword().to_string()))?
            .to_string();
        let target = scenario.get_idx(&name, rng)?;
        self.pathfind(scenario, target)?;

        let base = if name == "OPEN" { 300 } else { 3600 } / scenario.sim.t_step;
        let dwell = (base as f64 * rng.gen_range(0.5..1.0)).ceil() as usize;
        let destination = *self.path.back().unwrap_or(&self.pos);
        for _ in 0..dwell {
            self.path.push_back(destination);
        }
        Ok(())
    }

    /// Shortest path from the current position.
    pub fn pathfind(&mut self, scenario: &Scenario, target: Cell) -> Result<()> {
        self.path = scenario.router.pathfind(self.pos, target)?;
        Ok(())
    }

    /// Roll infection against the prevention index.
    pub fn infect<R: Rng>(&mut self, rng: &mut R) {
        if rng.gen::<f64>() > self.prevention_index {
            self.status = Status::Infected;
            self.infected = true;
        }
    }

    /// Residual airborne disease at the current cell may infect.
    fn droplet_expose<R: Rng>(&mut self, scenario: &Scenario, level: f32, rng: &mut R) {
        let probability = exposure_probability(
            scenario.virus.attack_rate,
            level,
            scenario.sim.t_step,
            self.susceptibility,
        );
        if rng.gen::<f64>() < probability {
            self.infect(rng);
        }
    }

    /// Put the occupied cell at risk, attenuated by personal prevention.
    fn droplet_spread(&mut self, scenario: &mut Scenario) {
        let viral_load = VIRUS_SCALE * (1.0 - self.prevention_index) as f32;
        scenario.contaminate(self.pos, viral_load);
    }

    /// Two-phase recovery. The first contagious sub-tick rolls the outcome
    /// and assigns the recovery and quarantine clocks; later sub-ticks apply
    /// the transitions as the clocks pass.
    pub fn recover<R: Rng>(&mut self, scenario: &Scenario, rng: &mut R) -> Result<()> {
        if self.dt.recovery.is_none() {
            let now = scenario.clock;
            let presymptomatic = LogNormal::new(PRESYMPTOMATIC.0, PRESYMPTOMATIC.1).unwrap();

            // asymptomatic carriers never self-quarantine within the horizon
            let mut n_days_q = if rng.gen::<f64>() < 0.17 {
                100.0
            } else {
                rng.sample(presymptomatic)
            };
            let mut n_days_r;
            if rng.gen::<f64>() < 0.02 {
                n_days_r = -1.0;
                n_days_q = rng.sample(presymptomatic);
                self.deceased = true;
            } else if rng.gen::<f64>() < 0.30 * self.severity {
                n_days_r = rng.sample(LogNormal::new(SEVERE.0, SEVERE.1).unwrap());
                n_days_q = rng.sample(presymptomatic);
                self.hospitalized = true;
            } else {
                n_days_r = rng.sample(LogNormal::new(MILD.0, MILD.1).unwrap());
            }
            if rng.gen::<f64>() < 0.16 {
                n_days_r *= 3.0;
                self.long_covid = true;
            }
            self.dt.recovery = Some(now + days(n_days_r));
            self.dt.quarantine = Some(now + days(n_days_q));
        } else {
            if self.dt.quarantine.is_some_and(|q| scenario.clock >= q) {
                if self.hospitalized {
                    self.status = Status::Hospitalized;
                    self.set_task(scenario, &Zone::Exit, rng)?;
                } else if self.deceased {
                    self.status = Status::Deceased;
                    self.set_task(scenario, &Zone::Exit, rng)?;
                } else if !self.is(Status::Quarantined) {
                    self.status = Status::Quarantined;
                    self.set_task(scenario, &Zone::Home, rng)?;
                }
            }
            if self.dt.recovery.is_some_and(|r| scenario.clock >= r) && !self.deceased {
                self.status = Status::Recovered;
            }
        }
        Ok(())
    }
}
