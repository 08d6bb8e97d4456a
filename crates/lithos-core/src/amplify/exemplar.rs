//! Exemplar heightfield library for continental amplification.
//!
//! A JSON manifest lists 16-bit grayscale PNG patches with their region
//! tag and elevation statistics; patches are resampled to a common square
//! tile at load. The loaded library is an explicit owned resource: the
//! atlas wraps it in a mutex-guarded slot with a version counter so a
//! reload invalidates downstream caches.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Luma};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{LithosError, Result};

/// Common tile resolution every exemplar is resampled to at load.
pub const EXEMPLAR_TILE: usize = 512;

/// Region provenance of an exemplar patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionTag {
    Himalayan,
    Andean,
    Ancient,
}

impl RegionTag {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "Himalayan" => Ok(Self::Himalayan),
            "Andean" => Ok(Self::Andean),
            "Ancient" => Ok(Self::Ancient),
            other => Err(LithosError::DataUnavailable(format!(
                "unknown exemplar region tag '{other}'"
            ))),
        }
    }
}

/// Manifest schema: `{ "exemplars": [ ... ] }` with paths relative to the
/// content root.
#[derive(Debug, Deserialize)]
struct Manifest {
    exemplars: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    region: String,
    elevation_min_m: f32,
    elevation_max_m: f32,
    elevation_mean_m: f32,
    png16_path: String,
}

/// A resampled 16-bit heightfield patch plus its metadata.
#[derive(Debug, Clone)]
pub struct Exemplar {
    pub id: String,
    pub region: RegionTag,
    pub elevation_min_m: f32,
    pub elevation_max_m: f32,
    pub elevation_mean_m: f32,
    /// Slot in the loaded array; stable for the library's lifetime.
    pub array_index: usize,
    data: Vec<u16>,
}

impl Exemplar {
    /// Bilinear sample at wrapped UV, in metres.
    pub fn sample_m(&self, u: f32, v: f32) -> f32 {
        let size = EXEMPLAR_TILE as f32;
        let fu = (u.rem_euclid(1.0)) * size;
        let fv = (v.rem_euclid(1.0)) * size;
        let x0 = fu.floor() as usize % EXEMPLAR_TILE;
        let y0 = fv.floor() as usize % EXEMPLAR_TILE;
        let x1 = (x0 + 1) % EXEMPLAR_TILE;
        let y1 = (y0 + 1) % EXEMPLAR_TILE;
        let tx = fu.fract();
        let ty = fv.fract();

        let at = |x: usize, y: usize| self.data[y * EXEMPLAR_TILE + x] as f32 / 65535.0;
        let h = at(x0, y0) * (1.0 - tx) * (1.0 - ty)
            + at(x1, y0) * tx * (1.0 - ty)
            + at(x0, y1) * (1.0 - tx) * ty
            + at(x1, y1) * tx * ty;
        self.elevation_min_m + h * (self.elevation_max_m - self.elevation_min_m)
    }
}

/// The immutable exemplar set.
#[derive(Debug, Default)]
pub struct ExemplarLibrary {
    pub exemplars: Vec<Exemplar>,
}

impl ExemplarLibrary {
    /// Load from a manifest file; PNGs must decode as 16-bit grayscale.
    pub fn load(manifest_path: &Path, content_root: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&text)?;

        let mut exemplars = Vec::with_capacity(manifest.exemplars.len());
        for (array_index, entry) in manifest.exemplars.into_iter().enumerate() {
            let region = RegionTag::parse(&entry.region)?;
            let path = content_root.join(&entry.png16_path);
            let decoded = image::open(&path)?;
            let gray16: ImageBuffer<Luma<u16>, Vec<u16>> = match decoded {
                DynamicImage::ImageLuma16(img) => img,
                other => {
                    return Err(LithosError::DataUnavailable(format!(
                        "exemplar '{}' is not 16-bit grayscale (got {:?})",
                        entry.id,
                        other.color()
                    )))
                }
            };
            let resampled = image::imageops::resize(
                &gray16,
                EXEMPLAR_TILE as u32,
                EXEMPLAR_TILE as u32,
                FilterType::Triangle,
            );
            exemplars.push(Exemplar {
                id: entry.id,
                region,
                elevation_min_m: entry.elevation_min_m,
                elevation_max_m: entry.elevation_max_m,
                elevation_mean_m: entry.elevation_mean_m,
                array_index,
                data: resampled.into_raw(),
            });
        }

        info!(
            "exemplar library loaded: count={} tile={}",
            exemplars.len(),
            EXEMPLAR_TILE
        );
        Ok(Self { exemplars })
    }

    /// Build a synthetic library for tests: each entry is a smooth ramp
    /// plus a sinusoidal relief signature.
    pub fn synthetic(specs: &[(&str, RegionTag, f32, f32, f32)]) -> Self {
        let exemplars = specs
            .iter()
            .enumerate()
            .map(|(array_index, &(id, region, min_m, max_m, mean_m))| {
                let mut data = vec![0u16; EXEMPLAR_TILE * EXEMPLAR_TILE];
                for y in 0..EXEMPLAR_TILE {
                    for x in 0..EXEMPLAR_TILE {
                        let fx = x as f32 / EXEMPLAR_TILE as f32;
                        let fy = y as f32 / EXEMPLAR_TILE as f32;
                        let wave = ((fx * std::f32::consts::TAU * (array_index as f32 + 2.0)).sin()
                            * (fy * std::f32::consts::TAU).cos()
                            * 0.25)
                            + 0.5;
                        data[y * EXEMPLAR_TILE + x] = (wave.clamp(0.0, 1.0) * 65535.0) as u16;
                    }
                }
                Exemplar {
                    id: id.to_string(),
                    region,
                    elevation_min_m: min_m,
                    elevation_max_m: max_m,
                    elevation_mean_m: mean_m,
                    array_index,
                    data,
                }
            })
            .collect();
        Self { exemplars }
    }

    pub fn indices_for_region(&self, wanted: &[RegionTag]) -> Vec<usize> {
        self.exemplars
            .iter()
            .filter(|e| wanted.contains(&e.region))
            .map(|e| e.array_index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }
}

/// The owned atlas resource handed to Stage B: a mutex-guarded slot plus
/// a version counter bumped on every install, so reloads invalidate any
/// cache keyed on the version.
#[derive(Debug, Default)]
pub struct ExemplarAtlas {
    slot: Mutex<Option<Arc<ExemplarLibrary>>>,
    version: AtomicU64,
}

impl ExemplarAtlas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the library, bumping the version.
    pub fn install(&self, library: ExemplarLibrary) -> u64 {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(Arc::new(library));
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Option<Arc<ExemplarLibrary>> {
        self.slot.lock().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_specs() -> Vec<(&'static str, RegionTag, f32, f32, f32)> {
        vec![
            ("him-01", RegionTag::Himalayan, 2000.0, 8000.0, 5000.0),
            ("and-01", RegionTag::Andean, 1000.0, 6000.0, 3500.0),
            ("anc-01", RegionTag::Ancient, 100.0, 1200.0, 600.0),
        ]
    }

    #[test]
    fn manifest_parses_and_rejects_unknown_regions() {
        let good: Manifest = serde_json::from_str(
            r#"{"exemplars": [{"id": "x", "region": "Andean", "elevation_min_m": 0.0,
                "elevation_max_m": 100.0, "elevation_mean_m": 50.0, "png16_path": "x.png"}]}"#,
        )
        .unwrap();
        assert_eq!(good.exemplars.len(), 1);
        assert!(RegionTag::parse("Himalayan").is_ok());
        assert!(RegionTag::parse("Lunar").is_err());
    }

    #[test]
    fn synthetic_samples_stay_in_declared_range() {
        let lib = ExemplarLibrary::synthetic(&test_specs());
        let e = &lib.exemplars[0];
        for (u, v) in [(0.0, 0.0), (0.25, 0.75), (0.999, 0.5), (-0.3, 1.7)] {
            let m = e.sample_m(u, v);
            assert!(
                m >= e.elevation_min_m - 1e-3 && m <= e.elevation_max_m + 1e-3,
                "sample {m} outside [{}, {}]",
                e.elevation_min_m,
                e.elevation_max_m
            );
        }
    }

    #[test]
    fn sampling_wraps_seamlessly() {
        let lib = ExemplarLibrary::synthetic(&test_specs());
        let e = &lib.exemplars[1];
        let a = e.sample_m(0.0, 0.4);
        let b = e.sample_m(1.0, 0.4);
        assert!((a - b).abs() < 1e-3, "wrap mismatch: {a} vs {b}");
    }

    #[test]
    fn region_filter_returns_matching_indices() {
        let lib = ExemplarLibrary::synthetic(&test_specs());
        assert_eq!(lib.indices_for_region(&[RegionTag::Himalayan, RegionTag::Andean]), vec![0, 1]);
        assert_eq!(lib.indices_for_region(&[RegionTag::Ancient]), vec![2]);
    }

    #[test]
    fn atlas_version_bumps_on_install() {
        let atlas = ExemplarAtlas::new();
        assert!(atlas.current().is_none());
        assert_eq!(atlas.version(), 0);
        let v1 = atlas.install(ExemplarLibrary::synthetic(&test_specs()));
        assert_eq!(v1, 1);
        assert_eq!(atlas.current().unwrap().len(), 3);
        let v2 = atlas.install(ExemplarLibrary::synthetic(&test_specs()[..1]));
        assert_eq!(v2, 2);
        assert_eq!(atlas.current().unwrap().len(), 1);
    }
}
