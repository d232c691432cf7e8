//! Typed configuration records and JSON loading.
//!
//! A run configuration has two top-level keys, `scenario` and `agents`.
//! Unknown keys, out-of-range numerics and unknown enum strings are rejected
//! at load time with [`Error::BadConfig`]; nothing downstream of a loaded
//! [`Config`] re-validates.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Status;
use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_t_step() -> u32 {
    5
}

fn default_save_resolution() -> u32 {
    60
}

fn default_max_iter() -> u32 {
    2500
}

fn default_urgency() -> f64 {
    1.0
}

/// Named terrain category with its classification swatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerrainEntry {
    pub name: String,
    /// 7-character `#RRGGBB` swatch matched against map pixels.
    pub value: String,
    /// Display color, defaults to the swatch.
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default = "default_true")]
    pub walkable: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub access_level: i32,
}

/// Simulation setup: map source, time resolution and terrain list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimSetup {
    pub name: String,
    /// Single image file or a directory of per-floor images.
    pub mapfile: PathBuf,
    /// Pixels per meter.
    pub xy_scale: f64,
    /// Seconds per sub-tick.
    #[serde(default = "default_t_step")]
    pub t_step: u32,
    /// Sub-ticks per recorded iteration.
    #[serde(default = "default_save_resolution")]
    pub save_resolution: u32,
    /// Include the viral grid in outputs.
    #[serde(default)]
    pub save_verbose: bool,
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Seed for all stochastic state; absent means entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    pub terrain: Vec<TerrainEntry>,
}

/// Virus transmission parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirusInfo {
    pub name: String,
    pub attack_rate: f64,
    pub infection_rate: f64,
    pub fatality_rate: f64,
}

/// Mask and vaccine efficacy tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prevention {
    pub name: String,
    /// Mask type to efficacy in `[0, 1]`.
    pub mask: HashMap<String, f64>,
    /// Vaccine type to per-dose-count efficacies in `[0, 1]`.
    pub vax: HashMap<String, Vec<f64>>,
}

impl Prevention {
    /// Combined prevention index `v + (1 - v) * m` for an agent with the
    /// given mask and vaccination.
    pub fn index(&self, mask_type: &str, vax_type: &str, doses: usize) -> Result<f64> {
        let m = *self
            .mask
            .get(mask_type)
            .ok_or_else(|| Error::BadConfig(format!("unknown mask type '{mask_type}'")))?;
        let v = *self
            .vax
            .get(vax_type)
            .and_then(|efficacies| efficacies.get(doses))
            .ok_or_else(|| {
                Error::BadConfig(format!("unknown vax type '{vax_type}' with {doses} dose(s)"))
            })?;
        Ok(v + (1.0 - v) * m)
    }
}

/// Composition of simulation, virus and prevention records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    pub sim: SimSetup,
    pub virus: VirusInfo,
    pub prevention: Prevention,
}

/// Zone keyword used in schedules and tasks. `WORK` and `HOME` resolve
/// through the agent's info; anything else names a mask directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Zone {
    Work,
    Home,
    Open,
    Exit,
    Named(String),
}

impl From<String> for Zone {
    fn from(s: String) -> Self {
        match s.as_str() {
            "WORK" => Zone::Work,
            "HOME" => Zone::Home,
            "OPEN" => Zone::Open,
            "EXIT" => Zone::Exit,
            _ => Zone::Named(s),
        }
    }
}

impl From<Zone> for String {
    fn from(zone: Zone) -> Self {
        zone.keyword().to_string()
    }
}

impl Zone {
    pub fn keyword(&self) -> &str {
        match self {
            Zone::Work => "WORK",
            Zone::Home => "HOME",
            Zone::Open => "OPEN",
            Zone::Exit => "EXIT",
            Zone::Named(name) => name,
        }
    }
}

/// Per-agent fixed attributes and schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    pub mask_type: String,
    pub vax_type: String,
    pub vax_doses: usize,
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(default)]
    pub start_zone: Option<String>,
    #[serde(default)]
    pub work_zone: Option<String>,
    #[serde(default)]
    pub home_zone: Option<String>,
    /// `"HH:MM"` to zone keyword.
    #[serde(default)]
    pub schedule: BTreeMap<String, Zone>,
    #[serde(default)]
    pub access_level: i32,
    #[serde(default = "default_urgency")]
    pub urgency: f64,
}

/// Initial agent state from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentStateSpec {
    #[serde(default)]
    pub x: usize,
    #[serde(default)]
    pub y: usize,
    #[serde(default)]
    pub z: usize,
    #[serde(default = "AgentStateSpec::default_status")]
    pub status: Status,
}

impl AgentStateSpec {
    fn default_status() -> Status {
        Status::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub info: AgentInfo,
    pub state: AgentStateSpec,
}

/// Population specification: a default spec, counts of randomized agents and
/// fully resolved custom overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    pub name: String,
    pub default: AgentSpec,
    #[serde(default)]
    pub random_agents: usize,
    #[serde(default)]
    pub random_infected: usize,
    #[serde(default)]
    pub custom: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub scenario: ScenarioSpec,
    pub agents: AgentsConfig,
}

impl Config {
    /// Load and validate a run configuration. Custom agent entries are
    /// merged over `agents.default` one map level deep before typing, so
    /// they may be partial.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::BadConfig(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let mut value: Value =
            serde_json::from_str(text).map_err(|e| Error::BadConfig(e.to_string()))?;

        if let Some(agents) = value.get_mut("agents") {
            let default = agents.get("default").cloned().unwrap_or(Value::Null);
            if let Some(custom) = agents.get_mut("custom").and_then(Value::as_array_mut) {
                for entry in custom.iter_mut() {
                    *entry = merge_one_level(&default, entry);
                }
            }
        }

        let config: Config =
            serde_json::from_value(value).map_err(|e| Error::BadConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let sim = &self.scenario.sim;
        validate_slug("scenario.sim.name", &sim.name)?;
        if sim.xy_scale < 1.0 {
            return Err(Error::BadConfig("xy_scale must be >= 1".into()));
        }
        if sim.t_step == 0 || sim.save_resolution == 0 || sim.max_iter == 0 {
            return Err(Error::BadConfig(
                "t_step, save_resolution and max_iter must be >= 1".into(),
            ));
        }
        for terrain in &sim.terrain {
            validate_slug("terrain name", &terrain.name)?;
            crate::terrain::parse_hex(&terrain.value)?;
        }

        let virus = &self.scenario.virus;
        for (field, rate) in [
            ("attack_rate", virus.attack_rate),
            ("infection_rate", virus.infection_rate),
            ("fatality_rate", virus.fatality_rate),
        ] {
            validate_unit(field, rate)?;
        }

        let prevention = &self.scenario.prevention;
        for (mask, efficacy) in &prevention.mask {
            validate_unit(&format!("prevention.mask.{mask}"), *efficacy)?;
        }
        for (vax, efficacies) in &prevention.vax {
            if efficacies.is_empty() {
                return Err(Error::BadConfig(format!(
                    "prevention.vax.{vax} must list at least one dose efficacy"
                )));
            }
            for efficacy in efficacies {
                validate_unit(&format!("prevention.vax.{vax}"), *efficacy)?;
            }
        }

        if self.agents.random_infected > self.agents.random_agents {
            return Err(Error::BadConfig(
                "random_infected exceeds random_agents".into(),
            ));
        }
        for spec in std::iter::once(&self.agents.default).chain(&self.agents.custom) {
            self.validate_agent(spec)?;
        }
        Ok(())
    }

    fn validate_agent(&self, spec: &AgentSpec) -> Result<()> {
        let info = &spec.info;
        self.scenario
            .prevention
            .index(&info.mask_type, &info.vax_type, info.vax_doses)?;
        validate_unit("agent urgency", info.urgency)?;
        for key in info.schedule.keys() {
            parse_hhmm(key)?;
        }
        Ok(())
    }
}

/// One-level-deep dictionary merge: top-level keys of `overlay` update the
/// matching sub-map of `default`; non-object values replace wholesale.
fn merge_one_level(default: &Value, overlay: &Value) -> Value {
    let mut merged = default.clone();
    if let (Some(merged_map), Some(overlay_map)) = (merged.as_object_mut(), overlay.as_object()) {
        for (key, val) in overlay_map {
            match (merged_map.get_mut(key), val.as_object()) {
                (Some(Value::Object(dst)), Some(src)) => {
                    for (k, v) in src {
                        dst.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    merged_map.insert(key.clone(), val.clone());
                }
            }
        }
    }
    merged
}

fn validate_slug(field: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::BadConfig(format!("{field} '{name}' is not a slug")))
    }
}

fn validate_unit(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::BadConfig(format!(
            "{field} = {value} outside [0, 1]"
        )))
    }
}

fn parse_hhmm(key: &str) -> Result<()> {
    let ok = key.len() == 5
        && key.as_bytes()[2] == b':'
        && key[..2].parse::<u32>().map_or(false, |h| h < 24)
        && key[3..].parse::<u32>().map_or(false, |m| m < 60);
    if ok {
        Ok(())
    } else {
        Err(Error::BadConfig(format!(
            "schedule key '{key}' is not HH:MM"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(extra_agent_keys: &str) -> String {
        format!(
            r##"{{
              "scenario": {{
                "sim": {{
                  "name": "office", "mapfile": "maps/office", "xy_scale": 10.0,
                  "t_step": 5, "save_resolution": 60, "max_iter": 10,
                  "terrain": [
                    {{"name": "WALL", "value": "#000000", "walkable": false}},
                    {{"name": "OPEN", "value": "#ffffff"}}
                  ]
                }},
                "virus": {{"name": "cov", "attack_rate": 0.07, "infection_rate": 0.02, "fatality_rate": 0.01}},
                "prevention": {{"name": "standard", "mask": {{"NONE": 0.0, "N95": 0.9}}, "vax": {{"NONE": [0.0], "MRNA": [0.0, 0.5, 0.9]}}}}
              }},
              "agents": {{
                "name": "pop", "random_agents": 2, "random_infected": 1,
                "default": {{
                  "info": {{"mask_type": "NONE", "vax_type": "NONE", "vax_doses": 0,
                            "start_zone": "OPEN", "work_zone": "OPEN", "home_zone": "OPEN",
                            "schedule": {{"08:00": "WORK"}}}},
                  "state": {{"x": 0, "y": 0, "status": "SUSCEPTIBLE"}}
                }},
                "custom": [{{"info": {{"mask_type": "N95"}}{extra_agent_keys}}}]
              }}
            }}"##
        )
    }

    #[test]
    fn custom_agents_merge_over_default() {
        let config = Config::from_str(&minimal_config("")).unwrap();
        let custom = &config.agents.custom[0];
        // overridden key
        assert_eq!(custom.info.mask_type, "N95");
        // untouched keys flow in from the default
        assert_eq!(custom.info.start_zone.as_deref(), Some("OPEN"));
        assert_eq!(custom.state.status, Status::Susceptible);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = minimal_config("").replace("\"xy_scale\"", "\"xy_scales\"");
        assert!(matches!(Config::from_str(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        let text = minimal_config("").replace("\"attack_rate\": 0.07", "\"attack_rate\": 1.5");
        assert!(matches!(Config::from_str(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        let text = minimal_config("").replace("SUSCEPTIBLE", "IMMORTAL");
        assert!(matches!(Config::from_str(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn bad_schedule_key_is_rejected() {
        let text = minimal_config("").replace("08:00", "8 o'clock");
        assert!(matches!(Config::from_str(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn zone_keywords_round_trip() {
        assert_eq!(Zone::from("WORK".to_string()), Zone::Work);
        assert_eq!(Zone::from("CAFETERIA".to_string()).keyword(), "CAFETERIA");
    }

    #[test]
    fn prevention_index_combines_vax_and_mask() {
        let config = Config::from_str(&minimal_config("")).unwrap();
        let prevention = &config.scenario.prevention;
        let index = prevention.index("N95", "MRNA", 1).unwrap();
        assert!((index - (0.5 + 0.5 * 0.9)).abs() < 1e-12);
        assert!(prevention.index("N95", "MRNA", 7).is_err());
    }
}
