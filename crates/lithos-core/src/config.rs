//! User-facing simulation and export configuration.

use serde::{Deserialize, Serialize};

use crate::error::{LithosError, Result};

/// Triangulation backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick the primary backend, falling back when unavailable.
    Auto,
    /// Stereographic projection + planar Delaunay (primary).
    Hull,
    /// Incremental 3-D convex hull (reference kernel).
    Wheel,
}

/// Colour mapping mode for the heightmap exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaletteMode {
    /// Absolute altitude bands (abyssal blue to mountain red).
    Hypsometric,
    /// Min/max-normalised range mapped across the same gradient.
    Normalized,
}

/// All recognised knobs, with defaults calibrated to the reference
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationConfig {
    /// RNG seed for sampling, triangulation shuffle, and rifting streams.
    pub seed: u64,
    /// N for Fibonacci sampling.
    pub sample_count: usize,
    /// Simulation mesh density tier.
    pub subdivision_level: u32,
    /// Render mesh density tier; gates Stage B via `min_amplification_lod`.
    pub render_subdivision_level: u32,
    pub backend: Backend,
    /// Deterministically permute triangulator input to defeat worst-case
    /// insertion orders.
    pub shuffle: bool,
    pub shuffle_seed: u64,
    /// Transform classification threshold (km/Ma).
    pub boundary_transform_epsilon: f64,
    /// Sediment accretion band around subduction fronts (km).
    pub trench_band_km: f64,
    pub enable_continental_erosion: bool,
    pub enable_oceanic_dampening: bool,
    pub enable_trench_accretion: bool,
    pub enable_oceanic_amplification: bool,
    pub enable_continental_amplification: bool,
    pub min_amplification_lod: u32,
    pub heightmap_palette: PaletteMode,
    /// Override the 512x256 export safety baseline.
    pub unsafe_heightmap_export: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            sample_count: 10_000,
            subdivision_level: 4,
            render_subdivision_level: 4,
            backend: Backend::Auto,
            shuffle: false,
            shuffle_seed: 0,
            boundary_transform_epsilon: 1e-3,
            trench_band_km: 150.0,
            enable_continental_erosion: true,
            enable_oceanic_dampening: true,
            enable_trench_accretion: true,
            enable_oceanic_amplification: false,
            enable_continental_amplification: false,
            min_amplification_lod: 5,
            heightmap_palette: PaletteMode::Hypsometric,
            unsafe_heightmap_export: false,
        }
    }
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_count < 4 {
            return Err(LithosError::Config(format!(
                "sample_count must be at least 4, got {}",
                self.sample_count
            )));
        }
        if !(self.boundary_transform_epsilon > 0.0) {
            return Err(LithosError::Config(format!(
                "boundary_transform_epsilon must be positive, got {}",
                self.boundary_transform_epsilon
            )));
        }
        if self.trench_band_km < 0.0 {
            return Err(LithosError::Config(format!(
                "trench_band_km must be non-negative, got {}",
                self.trench_band_km
            )));
        }
        if self.render_subdivision_level < self.subdivision_level {
            return Err(LithosError::Config(format!(
                "render_subdivision_level ({}) below subdivision_level ({})",
                self.render_subdivision_level, self.subdivision_level
            )));
        }
        Ok(())
    }

    /// Whether Stage B may run at the current render LOD.
    pub fn amplification_lod_ok(&self) -> bool {
        self.render_subdivision_level >= self.min_amplification_lod
    }
}
