//! Continental Stage B: terrain-type classification and weighted exemplar
//! patch blending.
//!
//! Selection happens once at snapshot time: each continental vertex is
//! classified from local relief, plate-boundary proximity and crust age,
//! up to four exemplars are chosen from the matching regions, and the
//! decision is packed into a 16-byte record both formulations consume.

use noise::{NoiseFn, Perlin};

use crate::amplify::exemplar::{ExemplarLibrary, RegionTag};
use crate::amplify::snapshot::ContinentalSnapshot;
use crate::constants::geodesic_radians_to_km;
use crate::mesh::adjacency::AdjacencyCsr;
use crate::mesh::fnv1a;
use crate::sphere::{angular_distance, Vec3};

/// Boundary proximity below which steep terrain reads as orogenic (km).
const OROGENIC_BOUNDARY_KM: f64 = 800.0;
/// Relief slope above which terrain reads as orogenic (m/km).
const OROGENIC_SLOPE_M_PER_KM: f64 = 1.5;
/// Crust age above which flat terrain reads as ancient (Ma).
const ANCIENT_AGE_MA: f64 = 350.0;
/// Relief slope below which old terrain reads as ancient (m/km).
const ANCIENT_SLOPE_M_PER_KM: f64 = 0.8;

/// Maximum exemplars blended per vertex.
pub const MAX_EXEMPLARS_PER_VERTEX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerrainType {
    Orogenic = 0,
    Plain = 1,
    Ancient = 2,
}

impl TerrainType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Orogenic,
            1 => Self::Plain,
            _ => Self::Ancient,
        }
    }

    /// Relief gain multiplier for the blended detail.
    pub fn relief_gain(self) -> f32 {
        match self {
            Self::Orogenic => 1.0,
            Self::Plain => 0.3,
            Self::Ancient => 0.15,
        }
    }

    fn wanted_regions(self) -> &'static [RegionTag] {
        match self {
            Self::Orogenic => &[RegionTag::Himalayan, RegionTag::Andean],
            Self::Plain => &[RegionTag::Ancient],
            Self::Ancient => &[RegionTag::Ancient],
        }
    }
}

/// Classify from the local slope proxy (m/km), the distance to the
/// nearest plate boundary (km), and the crust age (Ma).
pub fn classify_terrain(slope_m_per_km: f64, d_boundary_km: f64, age_ma: f64) -> TerrainType {
    if d_boundary_km < OROGENIC_BOUNDARY_KM && slope_m_per_km > OROGENIC_SLOPE_M_PER_KM {
        TerrainType::Orogenic
    } else if age_ma > ANCIENT_AGE_MA && slope_m_per_km < ANCIENT_SLOPE_M_PER_KM {
        TerrainType::Ancient
    } else {
        TerrainType::Plain
    }
}

/// Per-vertex exemplar decision packed into 16 bytes (4×u32):
///
/// * word 0: terrain type (bits 0–1), exemplar count (bits 2–4), exemplar
///   indices 0–2 (bits 8–15, 16–23, 24–31);
/// * words 1–2: four weights quantised to u16 (lo/hi pairs);
/// * word 3: exemplar index 3 (bits 0–7), remainder reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedTerrainInfo(pub [u32; 4]);

impl PackedTerrainInfo {
    pub fn pack(
        terrain: TerrainType,
        indices: &[usize],
        weights: &[f32],
    ) -> Self {
        debug_assert!(indices.len() == weights.len());
        let count = indices.len().min(MAX_EXEMPLARS_PER_VERTEX);
        let mut word0 = (terrain as u32) & 0x3;
        word0 |= ((count as u32) & 0x7) << 2;
        let mut word3 = 0u32;
        for (slot, &index) in indices.iter().take(count).enumerate() {
            let byte = (index.min(255)) as u32;
            match slot {
                0 => word0 |= byte << 8,
                1 => word0 |= byte << 16,
                2 => word0 |= byte << 24,
                _ => word3 |= byte,
            }
        }
        let quantise = |w: f32| (w.clamp(0.0, 1.0) * 65535.0).round() as u32;
        let mut q = [0u32; MAX_EXEMPLARS_PER_VERTEX];
        for (slot, &w) in weights.iter().take(count).enumerate() {
            q[slot] = quantise(w);
        }
        let word1 = q[0] | (q[1] << 16);
        let word2 = q[2] | (q[3] << 16);
        Self([word0, word1, word2, word3])
    }

    pub fn terrain(&self) -> TerrainType {
        TerrainType::from_bits(self.0[0])
    }

    pub fn count(&self) -> usize {
        ((self.0[0] >> 2) & 0x7) as usize
    }

    /// Unpack indices and renormalised weights.
    pub fn unpack(&self) -> (TerrainType, Vec<(usize, f32)>) {
        let count = self.count().min(MAX_EXEMPLARS_PER_VERTEX);
        let index_at = |slot: usize| -> usize {
            match slot {
                0 => ((self.0[0] >> 8) & 0xFF) as usize,
                1 => ((self.0[0] >> 16) & 0xFF) as usize,
                2 => ((self.0[0] >> 24) & 0xFF) as usize,
                _ => (self.0[3] & 0xFF) as usize,
            }
        };
        let weight_at = |slot: usize| -> f32 {
            let raw = match slot {
                0 => self.0[1] & 0xFFFF,
                1 => (self.0[1] >> 16) & 0xFFFF,
                2 => self.0[2] & 0xFFFF,
                _ => (self.0[2] >> 16) & 0xFFFF,
            };
            raw as f32 / 65535.0
        };

        let mut picks: Vec<(usize, f32)> = (0..count).map(|s| (index_at(s), weight_at(s))).collect();
        let total: f32 = picks.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            for (_, w) in &mut picks {
                *w /= total;
            }
        }
        (self.terrain(), picks)
    }
}

/// Local relief proxy per vertex: the maximum |Δz| to a ring-1 neighbour
/// divided by the edge length, in m/km.
pub fn relief_proxy(points: &[Vec3], csr: &AdjacencyCsr, elevation_m: &[f64]) -> Vec<f64> {
    (0..points.len())
        .map(|i| {
            let mut steepest: f64 = 0.0;
            for &nb in csr.neighbors_of(i) {
                let len_km = geodesic_radians_to_km(angular_distance(points[i], points[nb as usize]));
                if len_km > 1e-6 {
                    let slope = (elevation_m[i] - elevation_m[nb as usize]).abs() / len_km;
                    steepest = steepest.max(slope);
                }
            }
            steepest
        })
        .collect()
}

/// Deterministic wrapped UV per vertex from the position bits.
pub fn vertex_uv(p: Vec3) -> [f32; 2] {
    let mut h = 14_695_981_039_346_656_037u64;
    for v in [p.x, p.y, p.z] {
        h = fnv1a(h, &v.to_bits().to_le_bytes());
    }
    let u = (h & 0xFFFF_FFFF) as f32 / u32::MAX as f32;
    let v = (h >> 32) as f32 / u32::MAX as f32;
    [u.rem_euclid(1.0), v.rem_euclid(1.0)]
}

/// Select up to four exemplars for a vertex: candidates matching the
/// terrain's regions, weighted by inverse distance between the vertex's
/// baseline and the exemplar mean, weights normalised to sum to one.
pub fn select_exemplars(
    library: &ExemplarLibrary,
    terrain: TerrainType,
    baseline_m: f32,
) -> (Vec<usize>, Vec<f32>) {
    let candidates = library.indices_for_region(terrain.wanted_regions());
    if candidates.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut scored: Vec<(usize, f32)> = candidates
        .into_iter()
        .map(|index| {
            let mean = library.exemplars[index].elevation_mean_m;
            (index, 1.0 / (1.0 + (baseline_m - mean).abs() / 1000.0))
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(MAX_EXEMPLARS_PER_VERTEX);

    let total: f32 = scored.iter().map(|(_, w)| w).sum();
    let indices: Vec<usize> = scored.iter().map(|(i, _)| *i).collect();
    let weights: Vec<f32> = scored.iter().map(|(_, w)| w / total).collect();
    (indices, weights)
}

/// Resolve packed terrain decisions for every vertex. Continental
/// vertices without any matching exemplar get a zero-count record (they
/// copy the baseline).
#[allow(clippy::too_many_arguments)]
pub fn pack_terrain_decisions(
    points: &[Vec3],
    csr: &AdjacencyCsr,
    elevation_m: &[f64],
    crust_age_ma: &[f64],
    d_boundary_km: &[f64],
    continental_mask: &[u32],
    library: &ExemplarLibrary,
) -> (Vec<PackedTerrainInfo>, Vec<[f32; 2]>) {
    let slope = relief_proxy(points, csr, elevation_m);
    let mut packed = Vec::with_capacity(points.len());
    let mut uvs = Vec::with_capacity(points.len());
    for i in 0..points.len() {
        uvs.push(vertex_uv(points[i]));
        if continental_mask[i] == 0 {
            packed.push(PackedTerrainInfo::default());
            continue;
        }
        let terrain = classify_terrain(
            slope[i],
            d_boundary_km.get(i).copied().unwrap_or(f64::MAX),
            crust_age_ma.get(i).copied().unwrap_or(0.0),
        );
        let (indices, weights) = select_exemplars(library, terrain, elevation_m[i] as f32);
        packed.push(PackedTerrainInfo::pack(terrain, &indices, &weights));
    }
    (packed, uvs)
}

fn blended_detail_f32(
    snapshot: &ContinentalSnapshot,
    library: &ExemplarLibrary,
    perlin: &Perlin,
    i: usize,
) -> f32 {
    let (terrain, picks) = snapshot.packed_info[i].unpack();
    if picks.is_empty() {
        return 0.0;
    }
    let [u, v] = snapshot.uv[i];
    // A light deterministic jitter decorrelates neighbouring vertices
    // that hash near each other.
    let jitter = perlin.get([u as f64 * 5.0, v as f64 * 5.0, 0.5]) as f32 * 0.05;

    let mut detail = 0.0f32;
    for (index, weight) in picks {
        let Some(exemplar) = library.exemplars.get(index) else {
            continue;
        };
        let sample = exemplar.sample_m(u + jitter, v - jitter);
        detail += weight * (sample - exemplar.elevation_mean_m);
    }
    detail * terrain.relief_gain() * snapshot.params.continental_relief_gain
}

/// CPU formulation: f64 accumulation of the f32 blended detail.
pub fn amplify_continental_cpu(
    snapshot: &ContinentalSnapshot,
    library: &ExemplarLibrary,
) -> Vec<f64> {
    let perlin = Perlin::new(snapshot.params.noise_seed ^ 0x00C0_FFEE);
    (0..snapshot.vertex_count)
        .map(|i| {
            let baseline = snapshot.baseline_m[i] as f64;
            if snapshot.continental_mask[i] == 0 {
                baseline
            } else {
                baseline + blended_detail_f32(snapshot, library, &perlin, i) as f64
            }
        })
        .collect()
}

/// Dispatch formulation: all-f32, run by the dispatch-ring worker.
pub fn amplify_continental_f32(
    snapshot: &ContinentalSnapshot,
    library: &ExemplarLibrary,
) -> Vec<f32> {
    let perlin = Perlin::new(snapshot.params.noise_seed ^ 0x00C0_FFEE);
    (0..snapshot.vertex_count)
        .map(|i| {
            let baseline = snapshot.baseline_m[i];
            if snapshot.continental_mask[i] == 0 {
                baseline
            } else {
                baseline + blended_detail_f32(snapshot, library, &perlin, i)
            }
        })
        .collect()
}
