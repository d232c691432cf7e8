//! Agent state and construction.
//!
//! The data core lives here: infection status, position, the FIFO path
//! queue, the progression timers and the fixed attributes rolled once at
//! construction. The SIR behavior set (movement, infection, recovery) is in
//! [`sir`].

pub mod sir;

use std::collections::VecDeque;

use chrono::NaiveDateTime;
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::config::{AgentInfo, AgentSpec, Zone};
use crate::error::Result;
use crate::scenario::Scenario;
use crate::Cell;

/// Infection status. The discriminants are the values recorded in snapshot
/// arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum Status {
    Susceptible = 1,
    Infected = 2,
    Recovered = 3,
    Quarantined = 4,
    Deceased = 5,
    Hospitalized = 6,
    Unknown = 7,
}

impl Status {
    /// Snapshot value.
    pub fn value(self) -> i16 {
        self as i16
    }

    /// Statuses that shed virus and progress through recovery.
    pub fn contagious(self) -> bool {
        matches!(self, Status::Infected | Status::Quarantined | Status::Hospitalized)
    }

    /// Statuses excluded from schedules and free movement.
    pub fn excluded(self) -> bool {
        matches!(self, Status::Quarantined | Status::Hospitalized | Status::Deceased)
    }
}

/// Progression timers and the schedule-idempotence stamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTime {
    pub recovery: Option<NaiveDateTime>,
    pub quarantine: Option<NaiveDateTime>,
    /// `HH:MM` of the last schedule action, so an entry fires at most once
    /// per minute.
    pub last_action_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub info: AgentInfo,
    pub status: Status,
    pub pos: Cell,
    pub path: VecDeque<Cell>,
    pub dt: AgentTime,
    pub age: i64,
    pub susceptibility: f64,
    pub severity: f64,
    pub prevention_index: f64,
    pub long_covid: bool,
    /// Ever infected during the run.
    pub infected: bool,
    pub hospitalized: bool,
    pub deceased: bool,
}

/// Age-bucket breaks for the susceptibility and severity tables.
const AGE_BINS: [i64; 6] = [19, 29, 39, 49, 59, 69];

/// `(mean, std)` of susceptibility per age bucket.
const SUSCEPTIBILITY: [(f64, f64); 7] = [
    (0.38, 0.06),
    (0.79, 0.09),
    (0.87, 0.08),
    (0.80, 0.09),
    (0.82, 0.09),
    (0.89, 0.09),
    (0.74, 0.09),
];

/// `(mean, std)` of the clinical fraction per age bucket.
const CLINICAL_FRACTION: [(f64, f64); 7] = [
    (0.20, 0.05),
    (0.26, 0.05),
    (0.33, 0.05),
    (0.40, 0.06),
    (0.49, 0.06),
    (0.63, 0.07),
    (0.69, 0.06),
];

impl Agent {
    /// Construct an agent from its spec. An `UNKNOWN` status is resolved
    /// probabilistically against the virus infection rate; the position is
    /// seeded to a random cell of the start zone when one is given.
    pub fn new<R: Rng>(scenario: &Scenario, spec: &AgentSpec, rng: &mut R) -> Result<Self> {
        let info = spec.info.clone();

        let mut status = spec.state.status;
        if status == Status::Unknown {
            status = if rng.gen::<f64>() < scenario.virus.infection_rate {
                Status::Infected
            } else {
                Status::Susceptible
            };
        }

        let pos = match info.start_zone.as_deref() {
            Some(zone) => scenario.get_idx(zone, rng)?,
            None => [spec.state.x, spec.state.y, spec.state.z],
        };

        let (age, susceptibility, severity) = age_effect(info.age, rng);
        let prevention_index =
            scenario
                .prevention
                .index(&info.mask_type, &info.vax_type, info.vax_doses)?;

        Ok(Agent {
            info,
            status,
            pos,
            path: VecDeque::new(),
            dt: AgentTime::default(),
            age,
            susceptibility,
            severity,
            prevention_index,
            long_covid: false,
            infected: false,
            hospitalized: false,
            deceased: false,
        })
    }

    pub fn is(&self, status: Status) -> bool {
        self.status == status
    }

    /// Resolve a zone keyword against this agent's info. `None` when the
    /// keyword points at an unset work or home zone.
    pub fn resolve<'a>(&'a self, zone: &'a Zone) -> Option<&'a str> {
        match zone {
            Zone::Work => self.info.work_zone.as_deref(),
            Zone::Home => self.info.home_zone.as_deref(),
            other => Some(other.keyword()),
        }
    }

    /// Whether the agent currently stands in the zone.
    pub fn in_zone(&self, scenario: &Scenario, zone: &Zone) -> Result<bool> {
        match self.resolve(zone) {
            Some(name) => Ok(scenario.masks.mask(name)?[self.pos]),
            None => Ok(false),
        }
    }
}

/// Roll age and its effect on susceptibility and severity. A configured age
/// skips the sampling but still drives the bucket lookup.
fn age_effect<R: Rng>(fixed_age: Option<f64>, rng: &mut R) -> (i64, f64, f64) {
    let age = match fixed_age {
        Some(age) => age,
        None => rng.sample(Normal::new(41.0, 15.0).unwrap()),
    };
    let age = (age as i64).clamp(18, 85);
    let bucket = AGE_BINS.partition_point(|&b| b < age);

    let (mean, std) = SUSCEPTIBILITY[bucket];
    let susceptibility = rng.sample(Normal::new(mean, std).unwrap()).clamp(0.0, 1.0);
    let (mean, std) = CLINICAL_FRACTION[bucket];
    let severity = rng.sample(Normal::new(mean, std).unwrap()).clamp(0.0, 1.0);

    (age, susceptibility, severity)
}
