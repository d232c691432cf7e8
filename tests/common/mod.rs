//! Shared fixtures: character-grid maps rendered to PNG floors and run
//! configurations assembled over them.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use serde_json::json;

/// Render per-floor PNGs from character grids.
///
/// `W` wall, `.` open, `H` home, `K` work, `E` exit, `S` stairs. Cells in
/// `transit` additionally get a cyan marker on that floor's `.nodes.png`
/// overlay.
pub fn write_map(dir: &Path, floors: &[&[&str]], transit: &[[usize; 3]]) {
    std::fs::create_dir_all(dir).unwrap();
    for (z, rows) in floors.iter().enumerate() {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        let floor = RgbImage::from_fn(width, height, |x, y| {
            color(rows[y as usize].as_bytes()[x as usize] as char)
        });
        floor.save(dir.join(format!("{z}.png"))).unwrap();

        if !transit.is_empty() {
            let overlay = RgbImage::from_fn(width, height, |x, y| {
                if transit.contains(&[y as usize, x as usize, z]) {
                    Rgb([0, 255, 255])
                } else {
                    Rgb([0, 0, 0])
                }
            });
            overlay.save(dir.join(format!("{z}.nodes.png"))).unwrap();
        }
    }
}

fn color(c: char) -> Rgb<u8> {
    match c {
        'W' => Rgb([0, 0, 0]),
        '.' => Rgb([255, 255, 255]),
        'H' => Rgb([0, 255, 0]),
        'K' => Rgb([255, 0, 0]),
        'E' => Rgb([0, 0, 255]),
        'S' => Rgb([128, 128, 128]),
        other => panic!("unknown map glyph '{other}'"),
    }
}

/// Knobs for a generated run configuration.
pub struct Fixture {
    pub t_step: u32,
    pub save_resolution: u32,
    pub max_iter: u32,
    pub save_verbose: bool,
    pub seed: u64,
    pub attack_rate: f64,
    pub infection_rate: f64,
    pub random_agents: usize,
    pub random_infected: usize,
    pub default_status: &'static str,
    pub custom: Vec<serde_json::Value>,
}

impl Default for Fixture {
    fn default() -> Self {
        Fixture {
            t_step: 60,
            save_resolution: 2,
            max_iter: 10,
            save_verbose: false,
            seed: 42,
            attack_rate: 0.07,
            infection_rate: 0.0,
            random_agents: 10,
            random_infected: 0,
            default_status: "SUSCEPTIBLE",
            custom: Vec::new(),
        }
    }
}

/// Write the config JSON for a map directory and return its path.
pub fn write_config(dir: &Path, mapfile: &Path, fixture: &Fixture) -> PathBuf {
    let config = json!({
        "scenario": {
            "sim": {
                "name": "fixture",
                "mapfile": mapfile,
                "xy_scale": 10.0,
                "t_step": fixture.t_step,
                "save_resolution": fixture.save_resolution,
                "save_verbose": fixture.save_verbose,
                "max_iter": fixture.max_iter,
                "seed": fixture.seed,
                "terrain": [
                    {"name": "WALL", "value": "#000000", "walkable": false},
                    {"name": "OPEN", "value": "#ffffff"},
                    {"name": "HOME", "value": "#00ff00"},
                    {"name": "WORK", "value": "#ff0000"},
                    {"name": "EXIT", "value": "#0000ff"},
                    {"name": "STAIRS", "value": "#808080"}
                ]
            },
            "virus": {
                "name": "virus",
                "attack_rate": fixture.attack_rate,
                "infection_rate": fixture.infection_rate,
                "fatality_rate": 0.01
            },
            "prevention": {
                "name": "none",
                "mask": {"NONE": 0.0},
                "vax": {"NONE": [0.0]}
            }
        },
        "agents": {
            "name": "fixture-pop",
            "default": {
                "info": {
                    "mask_type": "NONE",
                    "vax_type": "NONE",
                    "vax_doses": 0,
                    "start_zone": "OPEN",
                    "work_zone": "OPEN",
                    "home_zone": "HOME"
                },
                "state": {"x": 1, "y": 1, "status": fixture.default_status}
            },
            "random_agents": fixture.random_agents,
            "random_infected": fixture.random_infected,
            "custom": fixture.custom
        }
    });

    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

/// Single-floor 8x8 room with HOME and EXIT corners.
pub fn room_map(dir: &Path) -> PathBuf {
    let map = dir.join("map");
    write_map(
        &map,
        &[&[
            "WWWWWWWW",
            "WH.....W",
            "W......W",
            "W......W",
            "W......W",
            "W......W",
            "W.....EW",
            "WWWWWWWW",
        ]],
        &[],
    );
    map
}
