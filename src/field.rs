//! Airborne viral concentration field.
//!
//! One f32 layer per floor. Contagious agents deposit into the field every
//! sub-tick; [`ViralField::ventilate`] then diffuses the concentration in
//! plane, zeroes it on barriers, decays it exponentially and clamps it to
//! the saturation ceiling.

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::Cell;

/// Canonical unit of per-cell viral deposit.
pub const VIRUS_SCALE: f32 = 16384.0;

/// Gaussian kernel truncation, in standard deviations.
const TRUNCATE: f32 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViralField {
    grid: Array3<f32>,
    /// Per-sub-tick decay, `0.15^(1/steps)` for the three-hour half-life
    /// window of `steps` sub-ticks.
    decay_factor: f32,
    #[serde(skip)]
    kernel: Vec<f32>,
    #[serde(skip)]
    kernel_sigma: f32,
    #[serde(skip)]
    scratch: Vec<f32>,
}

impl ViralField {
    #[must_use]
    pub fn new(shape: (usize, usize, usize), t_step: u32) -> Self {
        let steps = ((3 * 3600) / t_step).max(1);
        ViralField {
            grid: Array3::zeros(shape),
            decay_factor: 0.15f32.powf(1.0 / steps as f32),
            kernel: Vec::new(),
            kernel_sigma: 0.0,
            scratch: Vec::new(),
        }
    }

    pub fn matrix(&self) -> &Array3<f32> {
        &self.grid
    }

    pub fn decay_factor(&self) -> f32 {
        self.decay_factor
    }

    /// Viral concentration at a cell.
    pub fn level(&self, cell: Cell) -> f32 {
        self.grid[cell]
    }

    /// Deposit `concentration` at a cell.
    pub fn contaminate(&mut self, cell: Cell, concentration: f32) {
        self.grid[cell] += concentration;
    }

    /// Zero the entire grid.
    pub fn sanitize(&mut self) {
        self.grid.fill(0.0);
    }

    /// Total viral mass over all cells.
    pub fn total(&self) -> f64 {
        self.grid.iter().map(|&v| v as f64).sum()
    }

    /// One ventilation step: in-plane Gaussian diffusion with standard
    /// deviation `sigma` (constant-zero boundary, truncated at 2 sigma),
    /// barrier zeroing, exponential decay and clamping to `[0, max]`.
    ///
    /// Diffusion writes back into the grid through a preallocated scratch
    /// plane; no per-call allocation once the buffers are warm.
    pub fn ventilate(&mut self, sigma: f32, max: f32, barrier: &Array3<bool>) {
        if sigma > 0.0 {
            self.blur_in_plane(sigma);
        }
        let decay = self.decay_factor;
        Zip::from(&mut self.grid).and(barrier).for_each(|v, &b| {
            *v = if b { 0.0 } else { (*v * decay).clamp(0.0, max) };
        });
    }

    fn blur_in_plane(&mut self, sigma: f32) {
        if self.kernel.is_empty() || self.kernel_sigma != sigma {
            self.kernel = gaussian_kernel(sigma);
            self.kernel_sigma = sigma;
        }
        let (height, width, floors) = self.grid.dim();
        if self.scratch.len() != height * width {
            self.scratch.resize(height * width, 0.0);
        }
        let radius = self.kernel.len() / 2;

        for z in 0..floors {
            // rows first, into the scratch plane
            for i in 0..height {
                for j in 0..width {
                    let mut acc = 0.0;
                    for (k, &w) in self.kernel.iter().enumerate() {
                        let row = i + k;
                        if row >= radius && row - radius < height {
                            acc += w * self.grid[[row - radius, j, z]];
                        }
                    }
                    self.scratch[i * width + j] = acc;
                }
            }
            // then columns, back into the grid
            for i in 0..height {
                for j in 0..width {
                    let mut acc = 0.0;
                    for (k, &w) in self.kernel.iter().enumerate() {
                        let col = j + k;
                        if col >= radius && col - radius < width {
                            acc += w * self.scratch[i * width + (col - radius)];
                        }
                    }
                    self.grid[[i, j, z]] = acc;
                }
            }
        }
    }
}

/// Normalized 1D Gaussian weights with radius `truncate * sigma + 0.5`.
fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (TRUNCATE * sigma + 0.5) as usize;
    let mut weights: Vec<f32> = (0..=2 * radius)
        .map(|k| {
            let d = k as f32 - radius as f32;
            (-0.5 * (d / sigma).powi(2)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    weights
}
