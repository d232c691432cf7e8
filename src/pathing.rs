//! Shortest paths over the walkable cell grid.
//!
//! [`GridGraph`] is the classic graph: every `VALID` cell is a vertex,
//! Manhattan-adjacent cells within a floor are connected at unit cost, and
//! stairwell cells flagged as transit nodes on both floors link vertically.
//!
//! [`OptimizedPathfinder`] trades an offline build for cheap queries: every
//! cell is assigned its nearest transit anchor, and paths are assembled by
//! concatenating the stored cell-to-anchor segment, the expanded chain of
//! anchor-to-anchor segments, and the final anchor-to-cell segment.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array3;
use pathfinding::prelude::{bfs, dijkstra};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::Cell;

/// Classic pathfinding graph over the valid cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridGraph {
    valid: Array3<bool>,
    /// `STAIRS & TRANSIT_NODES`: cells eligible for vertical links.
    stairs: Array3<bool>,
}

impl GridGraph {
    #[must_use]
    pub fn new(valid: Array3<bool>, stairs: Array3<bool>) -> Self {
        GridGraph { valid, stairs }
    }

    pub fn contains(&self, cell: Cell) -> bool {
        let (h, w, f) = self.valid.dim();
        cell[0] < h && cell[1] < w && cell[2] < f && self.valid[cell]
    }

    /// Manhattan neighbors within the floor, plus vertical stairwell links.
    pub fn successors(&self, cell: Cell) -> Vec<Cell> {
        let (h, w, f) = self.valid.dim();
        let [x, y, z] = cell;
        let mut next = Vec::with_capacity(6);

        if x > 0 && self.valid[[x - 1, y, z]] {
            next.push([x - 1, y, z]);
        }
        if x + 1 < h && self.valid[[x + 1, y, z]] {
            next.push([x + 1, y, z]);
        }
        if y > 0 && self.valid[[x, y - 1, z]] {
            next.push([x, y - 1, z]);
        }
        if y + 1 < w && self.valid[[x, y + 1, z]] {
            next.push([x, y + 1, z]);
        }
        if self.stairs[cell] {
            if z > 0 && self.stairs[[x, y, z - 1]] && self.valid[[x, y, z - 1]] {
                next.push([x, y, z - 1]);
            }
            if z + 1 < f && self.stairs[[x, y, z + 1]] && self.valid[[x, y, z + 1]] {
                next.push([x, y, z + 1]);
            }
        }
        next
    }

    /// Shortest path inclusive of both endpoints.
    pub fn pathfind(&self, start: Cell, end: Cell) -> Result<VecDeque<Cell>> {
        self.path_vec(start, end).map(VecDeque::from)
    }

    fn path_vec(&self, start: Cell, end: Cell) -> Result<Vec<Cell>> {
        if !self.contains(start) {
            return Err(Error::UnknownCell(start));
        }
        if !self.contains(end) {
            return Err(Error::UnknownCell(end));
        }
        bfs(&start, |&c| self.successors(c), |&c| c == end)
            .ok_or(Error::NoRoute { from: start, to: end })
    }
}

/// Precomputed lookup tables of the optimized pathfinder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTables {
    /// Nearest transit anchor per reachable cell.
    pub anchors: HashMap<Cell, Cell>,
    /// Cell-to-anchor and anchor-to-adjacent-anchor paths, stored in one
    /// direction and reversed on demand.
    pub segments: HashMap<(Cell, Cell), Vec<Cell>>,
    /// Anchor chains between anchor pairs.
    pub transit_chains: HashMap<(Cell, Cell), Vec<Cell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedPathfinder {
    tables: PathTables,
}

impl OptimizedPathfinder {
    /// Precompute the path tables for a graph and its transit node set.
    ///
    /// Anchors are assigned by multi-source BFS, so each cell's segment
    /// follows a shortest path to its nearest transit node. Anchor pairs
    /// whose regions touch get a direct cell-level segment; chains between
    /// arbitrary pairs are shortest paths over that anchor graph.
    pub fn build(graph: &GridGraph, transit: &[Cell]) -> Result<Self> {
        let sources: Vec<Cell> = transit
            .iter()
            .copied()
            .filter(|&c| graph.contains(c))
            .collect();
        if sources.is_empty() {
            return Err(Error::BadMap(
                "map has no transit nodes; cannot build the optimized pathfinder".into(),
            ));
        }

        let mut anchors: HashMap<Cell, Cell> = HashMap::new();
        let mut parent: HashMap<Cell, Cell> = HashMap::new();
        let mut adjacent: HashSet<(Cell, Cell)> = HashSet::new();
        let mut queue: VecDeque<Cell> = VecDeque::new();
        for &t in &sources {
            anchors.insert(t, t);
            queue.push_back(t);
        }
        while let Some(cell) = queue.pop_front() {
            let anchor = anchors[&cell];
            for next in graph.successors(cell) {
                match anchors.get(&next) {
                    None => {
                        anchors.insert(next, anchor);
                        parent.insert(next, cell);
                        queue.push_back(next);
                    }
                    Some(&other) if other != anchor => {
                        adjacent.insert(ordered(anchor, other));
                    }
                    _ => {}
                }
            }
        }

        let mut segments: HashMap<(Cell, Cell), Vec<Cell>> = HashMap::new();
        for (&cell, &anchor) in &anchors {
            if cell == anchor {
                continue;
            }
            let mut segment = vec![cell];
            let mut current = cell;
            while current != anchor {
                current = parent[&current];
                segment.push(current);
            }
            segments.insert((cell, anchor), segment);
        }

        for &(a, b) in &adjacent {
            let segment = graph.path_vec(a, b)?;
            segments.insert((a, b), segment);
        }

        let mut adjacency: HashMap<Cell, Vec<(Cell, usize)>> = HashMap::new();
        for &(a, b) in &adjacent {
            let cost = segments[&(a, b)].len() - 1;
            adjacency.entry(a).or_default().push((b, cost));
            adjacency.entry(b).or_default().push((a, cost));
        }
        let mut transit_chains: HashMap<(Cell, Cell), Vec<Cell>> = HashMap::new();
        for (i, &a) in sources.iter().enumerate() {
            for &b in sources.iter().skip(i + 1) {
                let chain = dijkstra(
                    &a,
                    |n| adjacency.get(n).cloned().unwrap_or_default(),
                    |&n| n == b,
                );
                if let Some((chain, _)) = chain {
                    transit_chains.insert((a, b), chain);
                }
            }
        }

        debug!(
            cells = anchors.len(),
            anchors = sources.len(),
            segments = segments.len(),
            "path tables built"
        );
        Ok(OptimizedPathfinder {
            tables: PathTables {
                anchors,
                segments,
                transit_chains,
            },
        })
    }

    pub fn tables(&self) -> &PathTables {
        &self.tables
    }

    /// Assemble the path from the stored tables. Both endpoints inclusive;
    /// legs whose endpoints coincide are skipped.
    pub fn pathfind(&self, start: Cell, end: Cell) -> Result<VecDeque<Cell>> {
        if start == end {
            return Ok(VecDeque::from(vec![start]));
        }

        let t1 = *self
            .tables
            .anchors
            .get(&start)
            .ok_or(Error::UnknownCell(start))?;
        let t2 = *self
            .tables
            .anchors
            .get(&end)
            .ok_or(Error::UnknownCell(end))?;

        let mut path: Vec<Cell> = Vec::new();
        if start != t1 {
            path.extend(self.segment(start, t1)?);
        }
        if t1 != t2 {
            let chain = self.chain(t1, t2)?;
            let mut segment = Vec::new();
            for (&a, &b) in chain.iter().zip(chain.iter().skip(1)) {
                segment = self.segment(a, b)?;
                path.extend_from_slice(&segment[..segment.len() - 1]);
            }
            path.extend_from_slice(&segment[segment.len() - 1..]);
        }
        if t2 != end {
            path.extend(self.segment(t2, end)?);
        }
        Ok(VecDeque::from(path))
    }

    /// Stored segment between two cells, reversing on the fly when only the
    /// opposite direction is stored.
    fn segment(&self, from: Cell, to: Cell) -> Result<Vec<Cell>> {
        if let Some(segment) = self.tables.segments.get(&(from, to)) {
            return Ok(segment.clone());
        }
        if let Some(segment) = self.tables.segments.get(&(to, from)) {
            return Ok(segment.iter().rev().copied().collect());
        }
        Err(Error::NoRoute { from, to })
    }

    fn chain(&self, from: Cell, to: Cell) -> Result<Vec<Cell>> {
        if let Some(chain) = self.tables.transit_chains.get(&(from, to)) {
            return Ok(chain.clone());
        }
        if let Some(chain) = self.tables.transit_chains.get(&(to, from)) {
            return Ok(chain.iter().rev().copied().collect());
        }
        Err(Error::NoRoute { from, to })
    }

    pub fn cache_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.paths.gz"))
    }

    /// Persist the tables as gzipped bincode under `<dir>/<name>.paths.gz`.
    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        fs::create_dir_all(dir)?;
        let file = File::create(Self::cache_path(dir, name))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
        bincode::serialize_into(&mut encoder, &self.tables)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let file = File::open(Self::cache_path(dir, name))?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let tables: PathTables = bincode::deserialize_from(decoder)?;
        Ok(OptimizedPathfinder { tables })
    }

    /// Load a named cache if present.
    pub fn try_load(dir: &Path, name: &str) -> Result<Option<Self>> {
        if Self::cache_path(dir, name).exists() {
            Self::load(dir, name).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Shortest-path query dispatch: the optimized tables when a cache was
/// found, otherwise the classic in-memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Router {
    Optimized(OptimizedPathfinder),
    Classic(GridGraph),
}

impl Router {
    pub fn pathfind(&self, start: Cell, end: Cell) -> Result<VecDeque<Cell>> {
        match self {
            Router::Optimized(pathfinder) => pathfinder.pathfind(start, end),
            Router::Classic(graph) => graph.pathfind(start, end),
        }
    }
}

fn ordered(a: Cell, b: Cell) -> (Cell, Cell) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Open 7x7 floor pair joined by a stairwell at (3,3), with transit
    /// anchors in two corners and on the stairs.
    fn two_floor_graph() -> (GridGraph, Vec<Cell>) {
        let valid = Array3::from_elem((7, 7, 2), true);
        let mut stairs = Array3::from_elem((7, 7, 2), false);
        stairs[[3, 3, 0]] = true;
        stairs[[3, 3, 1]] = true;
        let transit = vec![[1, 1, 0], [3, 3, 0], [3, 3, 1], [5, 5, 1]];
        (GridGraph::new(valid, stairs), transit)
    }

    fn assert_steps_adjacent(path: &VecDeque<Cell>) {
        for pair in path.iter().collect::<Vec<_>>().windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let dist: usize = (0..3).map(|i| a[i].abs_diff(b[i])).sum();
            assert!(dist <= 1, "non-adjacent step {a:?} -> {b:?}");
        }
    }

    #[test]
    fn classic_connects_floors_through_stairwell() {
        let (graph, _) = two_floor_graph();
        let path = graph.pathfind([0, 0, 0], [6, 6, 1]).unwrap();
        assert_eq!(path.front(), Some(&[0, 0, 0]));
        assert_eq!(path.back(), Some(&[6, 6, 1]));
        assert!(path.contains(&[3, 3, 0]) && path.contains(&[3, 3, 1]));
        assert_steps_adjacent(&path);
    }

    #[test]
    fn classic_rejects_invalid_cells() {
        let mut valid = Array3::from_elem((3, 3, 1), true);
        valid[[1, 1, 0]] = false;
        let graph = GridGraph::new(valid, Array3::from_elem((3, 3, 1), false));
        assert!(matches!(
            graph.pathfind([1, 1, 0], [0, 0, 0]),
            Err(Error::UnknownCell(_))
        ));
    }

    #[test]
    fn classic_reports_disconnected_routes() {
        let mut valid = Array3::from_elem((1, 3, 1), true);
        valid[[0, 1, 0]] = false;
        let graph = GridGraph::new(valid, Array3::from_elem((1, 3, 1), false));
        assert!(matches!(
            graph.pathfind([0, 0, 0], [0, 2, 0]),
            Err(Error::NoRoute { .. })
        ));
    }

    #[test]
    fn optimized_matches_classic_endpoints() {
        let (graph, transit) = two_floor_graph();
        let pathfinder = OptimizedPathfinder::build(&graph, &transit).unwrap();

        for (start, end) in [
            ([0, 0, 0], [6, 6, 1]),
            ([2, 5, 0], [5, 1, 1]),
            ([0, 6, 0], [0, 6, 0]),
            ([6, 0, 1], [1, 1, 0]),
        ] {
            let optimized = pathfinder.pathfind(start, end).unwrap();
            let classic = graph.pathfind(start, end).unwrap();
            assert_eq!(optimized.front(), classic.front());
            assert_eq!(optimized.back(), classic.back());
            assert_steps_adjacent(&optimized);
        }
    }

    #[test]
    fn optimized_detour_is_bounded_by_anchor_legs() {
        let (graph, transit) = two_floor_graph();
        let pathfinder = OptimizedPathfinder::build(&graph, &transit).unwrap();

        let start = [0, 2, 0];
        let end = [6, 4, 1];
        let optimized = pathfinder.pathfind(start, end).unwrap().len();
        let classic = graph.pathfind(start, end).unwrap().len();
        let t1 = pathfinder.tables().anchors[&start];
        let t2 = pathfinder.tables().anchors[&end];
        let detours = graph.pathfind(start, t1).unwrap().len()
            + graph.pathfind(end, t2).unwrap().len();
        assert!(optimized <= classic + 2 * detours);
    }

    #[test]
    fn unknown_cells_are_reported() {
        let (graph, transit) = two_floor_graph();
        let pathfinder = OptimizedPathfinder::build(&graph, &transit).unwrap();
        assert!(matches!(
            pathfinder.pathfind([20, 0, 0], [1, 1, 0]),
            Err(Error::UnknownCell(_))
        ));
    }

    #[test]
    fn tables_round_trip_through_the_cache() {
        let (graph, transit) = two_floor_graph();
        let pathfinder = OptimizedPathfinder::build(&graph, &transit).unwrap();

        let dir = tempfile::tempdir().unwrap();
        pathfinder.save(dir.path(), "fixture").unwrap();
        let reloaded = OptimizedPathfinder::load(dir.path(), "fixture").unwrap();
        assert_eq!(pathfinder.tables(), reloaded.tables());

        assert!(OptimizedPathfinder::try_load(dir.path(), "missing")
            .unwrap()
            .is_none());
    }
}
