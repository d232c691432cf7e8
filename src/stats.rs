//! Aggregate statistics over finished artifacts.
//!
//! Tallies agent statuses per recorded iteration into a
//! struct-of-arrays time series, exportable as CSV or as an epicurve HTML
//! plot.

use std::path::Path;

use plotly::{Plot, Scatter};
use soa_derive::StructOfArray;

use crate::error::{Error, Result};
use crate::writer::Artifact;

/// Tally of the population states in one recorded iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq, StructOfArray)]
#[soa_derive(Debug, Clone)]
pub struct StatusTally {
    pub susceptible: u32,
    pub infected: u32,
    pub recovered: u32,
    pub quarantined: u32,
    pub deceased: u32,
    pub hospitalized: u32,
}

/// Per-iteration status tallies of an artifact's `agents` dataset.
pub fn tally(artifact: &Artifact) -> StatusTallyVec {
    let mut tallies = StatusTallyVec::new();
    for frame in artifact.agents.outer_iter() {
        let mut current = StatusTally::default();
        for agent in frame.outer_iter() {
            match agent[3] {
                1 => current.susceptible += 1,
                2 => current.infected += 1,
                3 => current.recovered += 1,
                4 => current.quarantined += 1,
                5 => current.deceased += 1,
                6 => current.hospitalized += 1,
                _ => {}
            }
        }
        tallies.push(current);
    }
    tallies
}

/// Write the tallies and timestamps as CSV.
pub fn write_csv(path: &Path, artifact: &Artifact, tallies: &StatusTallyVec) -> Result<()> {
    let fault = |e: csv::Error| Error::WriteFault(e.to_string());
    let mut writer = csv::Writer::from_path(path).map_err(fault)?;
    writer
        .write_record([
            "iteration",
            "timestamp",
            "susceptible",
            "infected",
            "recovered",
            "quarantined",
            "deceased",
            "hospitalized",
        ])
        .map_err(fault)?;
    for i in 0..tallies.len() {
        writer
            .write_record([
                i.to_string(),
                artifact.timesteps[i].to_string(),
                tallies.susceptible[i].to_string(),
                tallies.infected[i].to_string(),
                tallies.recovered[i].to_string(),
                tallies.quarantined[i].to_string(),
                tallies.deceased[i].to_string(),
                tallies.hospitalized[i].to_string(),
            ])
            .map_err(fault)?;
    }
    writer.flush().map_err(|e| Error::WriteFault(e.to_string()))?;
    Ok(())
}

/// Render the epicurves to a standalone HTML file.
pub fn write_epicurve(path: &Path, tallies: &StatusTallyVec) -> Result<()> {
    let iterations: Vec<usize> = (0..tallies.len()).collect();

    let mut plot = Plot::new();
    plot.add_trace(Scatter::new(iterations.clone(), tallies.susceptible.clone()).name("susceptible"));
    plot.add_trace(Scatter::new(iterations.clone(), tallies.infected.clone()).name("infected"));
    plot.add_trace(Scatter::new(iterations.clone(), tallies.recovered.clone()).name("recovered"));
    plot.add_trace(Scatter::new(iterations.clone(), tallies.quarantined.clone()).name("quarantined"));
    plot.add_trace(Scatter::new(iterations.clone(), tallies.deceased.clone()).name("deceased"));
    plot.add_trace(Scatter::new(iterations, tallies.hospitalized.clone()).name("hospitalized"));
    plot.write_html(path);
    Ok(())
}
