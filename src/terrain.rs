//! Raster map loading and terrain classification.
//!
//! Every floor of a scenario map is a color-coded PNG; pixels are matched
//! byte-exact against the terrain swatches to produce named boolean masks
//! over the `(H, W, F)` cell grid, plus the derived `VALID` and `BARRIER`
//! masks that drive movement and ventilation.

use std::collections::HashMap;
use std::path::Path;

use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::config::TerrainEntry;
use crate::error::{Error, Result};
use crate::Cell;

pub const VALID: &str = "VALID";
pub const BARRIER: &str = "BARRIER";
pub const TRANSIT_NODES: &str = "TRANSIT_NODES";

/// Swatch marking transit nodes on `*.nodes.png` overlays.
pub const TRANSIT_COLOR: &str = "#00ffff";

/// Terrain names folded into the `BARRIER` mask.
const BARRIER_TERRAINS: [&str; 4] = ["WALL", "DOOR", "STAIRS", "EXIT"];

/// Parse a `#RRGGBB` swatch.
pub fn parse_hex(swatch: &str) -> Result<[u8; 3]> {
    let digits = swatch.strip_prefix('#').unwrap_or(swatch);
    if swatch.len() != 7 || digits.len() != 6 {
        return Err(Error::BadConfig(format!(
            "terrain swatch '{swatch}' is not #RRGGBB"
        )));
    }
    let mut rgb = [0u8; 3];
    for (i, channel) in rgb.iter_mut().enumerate() {
        *channel = u8::from_str_radix(&digits[2 * i..2 * i + 2], 16)
            .map_err(|_| Error::BadConfig(format!("terrain swatch '{swatch}' is not #RRGGBB")))?;
    }
    Ok(rgb)
}

/// Classified map: shape, named masks and their precomputed index lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMasks {
    shape: (usize, usize, usize),
    masks: HashMap<String, Array3<bool>>,
    idxs: HashMap<String, Vec<Cell>>,
}

impl MapMasks {
    /// Load a map from a single image file or a directory of per-floor
    /// images and classify it against the ordered terrain list.
    pub fn load(mapfile: &Path, terrain: &[TerrainEntry]) -> Result<Self> {
        let stack = FloorStack::load(mapfile)?;
        let (height, width, floors) = stack.shape();
        let shape = (height, width, floors);

        let mut masks: HashMap<String, Array3<bool>> = HashMap::new();
        if let Some(transit) = stack.transit_mask() {
            masks.insert(TRANSIT_NODES.to_string(), transit);
        }

        let mut valid = Array3::from_elem(shape, true);
        let mut barrier = Array3::from_elem(shape, false);

        for entry in terrain {
            let swatch = parse_hex(&entry.value)?;
            let mask = if let Some(floor) = floor_suffix(&entry.name)? {
                if floor >= floors {
                    return Err(Error::BadMap(format!(
                        "terrain '{}' names floor {floor} but the map has {floors}",
                        entry.name
                    )));
                }
                stack.classify_floor(swatch, floor)
            } else {
                stack.classify(swatch)
            };

            if entry.restricted || !entry.walkable {
                ndarray::Zip::from(&mut valid)
                    .and(&mask)
                    .for_each(|v, &m| *v &= !m);
            } else {
                ndarray::Zip::from(&mut valid)
                    .and(&mask)
                    .for_each(|v, &m| *v |= m);
            }
            if BARRIER_TERRAINS.contains(&entry.name.as_str()) {
                ndarray::Zip::from(&mut barrier)
                    .and(&mask)
                    .for_each(|b, &m| *b |= m);
            }
            masks.insert(entry.name.clone(), mask);
        }

        masks.insert(VALID.to_string(), valid);
        masks.insert(BARRIER.to_string(), barrier);

        let idxs = masks
            .iter()
            .map(|(name, mask)| (name.clone(), argwhere(mask)))
            .collect();

        Ok(MapMasks { shape, masks, idxs })
    }

    /// Assemble a classified map from prebuilt masks, deriving `VALID` and
    /// `BARRIER` exactly as image loading does. Masks are taken in the
    /// iteration order of walkability flags already applied; callers supply
    /// the walkable/restricted decisions through `blocked` names.
    pub fn from_masks(
        shape: (usize, usize, usize),
        named: HashMap<String, Array3<bool>>,
        blocked: &[&str],
    ) -> Self {
        let mut valid = Array3::from_elem(shape, true);
        let mut barrier = Array3::from_elem(shape, false);
        for (name, mask) in &named {
            if blocked.contains(&name.as_str()) {
                ndarray::Zip::from(&mut valid)
                    .and(mask)
                    .for_each(|v, &m| *v &= !m);
            }
            if BARRIER_TERRAINS.contains(&name.as_str()) {
                ndarray::Zip::from(&mut barrier)
                    .and(mask)
                    .for_each(|b, &m| *b |= m);
            }
        }
        let mut masks = named;
        masks.insert(VALID.to_string(), valid);
        masks.insert(BARRIER.to_string(), barrier);
        let idxs = masks
            .iter()
            .map(|(name, mask)| (name.clone(), argwhere(mask)))
            .collect();
        MapMasks { shape, masks, idxs }
    }

    /// `(H, W, F)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn contains(&self, zone: &str) -> bool {
        self.masks.contains_key(zone)
    }

    pub fn mask(&self, zone: &str) -> Result<&Array3<bool>> {
        self.masks
            .get(zone)
            .ok_or_else(|| Error::UnknownZone(zone.to_string()))
    }

    pub fn get(&self, zone: &str) -> Option<&Array3<bool>> {
        self.masks.get(zone)
    }

    /// Cell coordinates where the zone mask is true.
    pub fn idxs(&self, zone: &str) -> Result<&[Cell]> {
        self.idxs
            .get(zone)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownZone(zone.to_string()))
    }

    pub fn valid(&self) -> &Array3<bool> {
        &self.masks[VALID]
    }

    pub fn barrier(&self) -> &Array3<bool> {
        &self.masks[BARRIER]
    }

    /// `STAIRS & TRANSIT_NODES`: the cells eligible for vertical links.
    pub fn stair_transit(&self) -> Array3<bool> {
        match (self.get("STAIRS"), self.get(TRANSIT_NODES)) {
            (Some(stairs), Some(transit)) => {
                let mut linked = stairs.clone();
                ndarray::Zip::from(&mut linked)
                    .and(transit)
                    .for_each(|s, &t| *s &= t);
                linked
            }
            _ => Array3::from_elem(self.shape, false),
        }
    }

    /// Valid cells flagged as transit nodes, the anchor set for the
    /// optimized pathfinder.
    pub fn transit_cells(&self) -> Vec<Cell> {
        match self.get(TRANSIT_NODES) {
            Some(transit) => {
                let valid = self.valid();
                argwhere(transit)
                    .into_iter()
                    .filter(|&c| valid[c])
                    .collect()
            }
            None => Vec::new(),
        }
    }
}

fn argwhere(mask: &Array3<bool>) -> Vec<Cell> {
    mask.indexed_iter()
        .filter(|(_, &m)| m)
        .map(|((x, y, z), _)| [x, y, z])
        .collect()
}

/// Floor index encoded in a terrain name: when the name ends with a digit,
/// the third-from-last character is the floor.
fn floor_suffix(name: &str) -> Result<Option<usize>> {
    let bytes = name.as_bytes();
    match bytes.last() {
        Some(last) if last.is_ascii_digit() => {
            if bytes.len() < 3 || !bytes[bytes.len() - 3].is_ascii_digit() {
                return Err(Error::BadConfig(format!(
                    "terrain '{name}' ends with a digit but has no floor index"
                )));
            }
            Ok(Some((bytes[bytes.len() - 3] - b'0') as usize))
        }
        _ => Ok(None),
    }
}

/// Decoded per-floor images plus optional transit-node overlays.
struct FloorStack {
    floors: Vec<RgbImage>,
    /// Overlay image per floor, populated from `<base>.nodes.png` entries.
    overlays: Vec<Option<RgbImage>>,
}

impl FloorStack {
    fn load(mapfile: &Path) -> Result<Self> {
        if !mapfile.exists() {
            return Err(Error::BadMap(format!(
                "map path {} does not exist",
                mapfile.display()
            )));
        }

        if mapfile.is_file() {
            let floor = decode(mapfile)?;
            return Ok(FloorStack {
                floors: vec![floor],
                overlays: vec![None],
            });
        }

        let mut names: Vec<_> = mapfile
            .read_dir()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".png"))
            })
            .collect();
        names.sort();

        let mut floors = Vec::new();
        let mut floor_bases = Vec::new();
        let mut overlay_files = Vec::new();
        for path in names {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if let Some(base) = name.strip_suffix(".nodes.png") {
                overlay_files.push((base.to_string(), path.clone()));
            } else {
                let base = name.trim_end_matches(".png").to_string();
                floors.push(decode(&path)?);
                floor_bases.push(base);
            }
        }

        if floors.is_empty() {
            return Err(Error::BadMap(format!(
                "no image layers found in {}",
                mapfile.display()
            )));
        }
        let dims = floors[0].dimensions();
        if floors.iter().any(|f| f.dimensions() != dims) {
            return Err(Error::BadMap(format!(
                "inconsistent floor shapes in {}",
                mapfile.display()
            )));
        }

        let mut overlays: Vec<Option<RgbImage>> = vec![None; floors.len()];
        for (base, path) in overlay_files {
            let floor = floor_bases.iter().position(|b| *b == base).ok_or_else(|| {
                Error::BadMap(format!(
                    "transit overlay {} has no matching floor layer",
                    path.display()
                ))
            })?;
            let overlay = decode(&path)?;
            if overlay.dimensions() != dims {
                return Err(Error::BadMap(format!(
                    "transit overlay {} does not match the floor shape",
                    path.display()
                )));
            }
            overlays[floor] = Some(overlay);
        }

        Ok(FloorStack { floors, overlays })
    }

    fn shape(&self) -> (usize, usize, usize) {
        let (width, height) = self.floors[0].dimensions();
        (height as usize, width as usize, self.floors.len())
    }

    /// Mask of pixels matching the swatch across all floors.
    fn classify(&self, swatch: [u8; 3]) -> Array3<bool> {
        Array3::from_shape_fn(self.shape(), |(i, j, z)| {
            self.floors[z].get_pixel(j as u32, i as u32).0 == swatch
        })
    }

    /// Mask restricted to a single floor.
    fn classify_floor(&self, swatch: [u8; 3], floor: usize) -> Array3<bool> {
        Array3::from_shape_fn(self.shape(), |(i, j, z)| {
            z == floor && self.floors[z].get_pixel(j as u32, i as u32).0 == swatch
        })
    }

    /// TRANSIT_NODES mask from the overlays, or `None` when no overlay
    /// exists.
    fn transit_mask(&self) -> Option<Array3<bool>> {
        if self.overlays.iter().all(Option::is_none) {
            return None;
        }
        let transit = parse_hex(TRANSIT_COLOR).expect("const swatch");
        Some(Array3::from_shape_fn(self.shape(), |(i, j, z)| {
            self.overlays[z]
                .as_ref()
                .is_some_and(|overlay| overlay.get_pixel(j as u32, i as u32).0 == transit)
        }))
    }
}

fn decode(path: &Path) -> Result<RgbImage> {
    let img = image::open(path)
        .map_err(|e| Error::BadMap(format!("unreadable image {}: {e}", path.display())))?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerrainEntry;
    use image::Rgb;

    fn entry(name: &str, value: &str, walkable: bool) -> TerrainEntry {
        TerrainEntry {
            name: name.to_string(),
            value: value.to_string(),
            color: None,
            material: None,
            walkable,
            interactive: false,
            restricted: false,
            access_level: 0,
        }
    }

    /// 4x4 floor: wall border, open interior.
    fn write_floor(path: &Path) {
        let img = RgbImage::from_fn(4, 4, |x, y| {
            if x == 0 || y == 0 || x == 3 || y == 3 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        img.save(path).unwrap();
    }

    #[test]
    fn single_file_becomes_one_floor() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("map.png");
        write_floor(&file);

        let terrain = [entry("WALL", "#000000", false), entry("OPEN", "#ffffff", true)];
        let masks = MapMasks::load(&file, &terrain).unwrap();
        assert_eq!(masks.shape(), (4, 4, 1));
        assert_eq!(masks.idxs("OPEN").unwrap().len(), 4);
        assert_eq!(masks.idxs("WALL").unwrap().len(), 12);
    }

    #[test]
    fn valid_and_barrier_are_derived() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("map.png");
        write_floor(&file);

        let terrain = [entry("WALL", "#000000", false), entry("OPEN", "#ffffff", true)];
        let masks = MapMasks::load(&file, &terrain).unwrap();

        for &cell in masks.idxs(VALID).unwrap() {
            assert!(!masks.barrier()[cell]);
            assert!(masks.mask("OPEN").unwrap()[cell]);
        }
        for &cell in masks.idxs("WALL").unwrap() {
            assert!(!masks.valid()[cell]);
            assert!(masks.barrier()[cell]);
        }
    }

    #[test]
    fn directory_stacks_floors_and_overlays() {
        let dir = tempfile::tempdir().unwrap();
        write_floor(&dir.path().join("0.png"));
        write_floor(&dir.path().join("1.png"));
        let overlay = RgbImage::from_fn(4, 4, |x, y| {
            if x == 1 && y == 1 {
                Rgb([0, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        overlay.save(dir.path().join("0.nodes.png")).unwrap();
        overlay.save(dir.path().join("1.nodes.png")).unwrap();

        let terrain = [entry("WALL", "#000000", false), entry("OPEN", "#ffffff", true)];
        let masks = MapMasks::load(dir.path(), &terrain).unwrap();
        assert_eq!(masks.shape(), (4, 4, 2));
        assert_eq!(masks.transit_cells(), vec![[1, 1, 0], [1, 1, 1]]);
    }

    #[test]
    fn floor_suffix_restricts_terrain_to_one_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_floor(&dir.path().join("0.png"));
        write_floor(&dir.path().join("1.png"));

        let terrain = [
            entry("WALL", "#000000", false),
            entry("OPEN", "#ffffff", true),
            entry("DESK_0F0", "#ffffff", true),
        ];
        let masks = MapMasks::load(dir.path(), &terrain).unwrap();
        let desk = masks.mask("DESK_0F0").unwrap();
        assert!(desk.slice(ndarray::s![.., .., 1]).iter().all(|&m| !m));
        assert!(desk[[1, 1, 0]]);
    }

    #[test]
    fn missing_map_is_a_bad_map() {
        let terrain = [entry("OPEN", "#ffffff", true)];
        let err = MapMasks::load(Path::new("/nonexistent/map"), &terrain).unwrap_err();
        assert!(matches!(err, Error::BadMap(_)));
    }

    #[test]
    fn malformed_swatch_is_rejected() {
        assert!(parse_hex("#00ffff").is_ok());
        assert!(parse_hex("00ffff").is_err());
        assert!(parse_hex("#00fffz").is_err());
    }
}
