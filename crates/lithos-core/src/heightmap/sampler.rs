//! Barycentric spherical point-in-triangle sampling with spatial
//! acceleration and hint reuse.
//!
//! The sampler snapshots positions, the chosen elevation source, and the
//! canonical triangle set. Queries walk the mesh from a hint triangle,
//! crossing the edge whose opposite-side plane the query violates most,
//! bounded by a step cap; cold queries start from the nearest triangle
//! centroid found through a kd-tree.

use crate::error::{LithosError, Result};
use crate::mesh::Triangle;
use crate::sphere::Vec3;

/// UV clamp margin keeping queries off the exact poles.
pub const POLE_AVOIDANCE_EPSILON: f64 = 1e-4;

/// Triangle-walk step cap; avoids cycling on degenerate data.
pub const MAX_WALK_STEPS: u32 = 255;

/// Inside test tolerance for the signed barycentric volumes.
const BARY_EPSILON: f64 = -1e-12;

/// Sentinel triangle index.
pub const NO_TRIANGLE: i32 = -1;

#[derive(Debug, Clone, Copy)]
pub struct SampleInfo {
    pub hit: bool,
    /// Last triangle visited (the containing one on a hit).
    pub triangle: i32,
    pub steps: u32,
    pub barycentric: [f64; 3],
}

impl Default for SampleInfo {
    fn default() -> Self {
        Self { hit: false, triangle: NO_TRIANGLE, steps: 0, barycentric: [0.0; 3] }
    }
}

/// Byte accounting exposed for the exporter's memory preflight.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerMemoryStats {
    pub vertex_count: usize,
    pub triangle_count: usize,
    pub triangle_bytes: usize,
    pub kd_tree_bytes: usize,
    pub snapshot_bytes: usize,
}

impl SamplerMemoryStats {
    pub fn total_bytes(&self) -> usize {
        self.triangle_bytes + self.kd_tree_bytes + self.snapshot_bytes
    }
}

// ── kd-tree over triangle centroids ───────────────────────────────────────

struct KdNode {
    point: [f64; 3],
    triangle: u32,
    left: i32,
    right: i32,
}

struct KdTree {
    nodes: Vec<KdNode>,
    root: i32,
}

impl KdTree {
    fn build(centroids: &[Vec3]) -> Self {
        let mut items: Vec<(u32, [f64; 3])> = centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i as u32, [c.x, c.y, c.z]))
            .collect();
        let mut nodes = Vec::with_capacity(items.len());
        let len = items.len();
        let root = Self::build_range(&mut items, 0, len, 0, &mut nodes);
        Self { nodes, root }
    }

    fn build_range(
        items: &mut [(u32, [f64; 3])],
        lo: usize,
        hi: usize,
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> i32 {
        if lo >= hi {
            return -1;
        }
        let axis = depth % 3;
        let mid = (lo + hi) / 2;
        items[lo..hi].select_nth_unstable_by(mid - lo, |a, b| a.1[axis].total_cmp(&b.1[axis]));
        let (triangle, point) = items[mid];
        let slot = nodes.len();
        nodes.push(KdNode { point, triangle, left: -1, right: -1 });
        let left = Self::build_range(items, lo, mid, depth + 1, nodes);
        let right = Self::build_range(items, mid + 1, hi, depth + 1, nodes);
        nodes[slot].left = left;
        nodes[slot].right = right;
        slot as i32
    }

    fn nearest(&self, query: [f64; 3]) -> Option<u32> {
        if self.root < 0 {
            return None;
        }
        let mut best = (f64::MAX, 0u32);
        self.search(self.root, query, 0, &mut best);
        Some(best.1)
    }

    fn search(&self, node: i32, query: [f64; 3], depth: usize, best: &mut (f64, u32)) {
        if node < 0 {
            return;
        }
        let n = &self.nodes[node as usize];
        let d2 = (0..3).map(|k| (n.point[k] - query[k]).powi(2)).sum::<f64>();
        if d2 < best.0 {
            *best = (d2, n.triangle);
        }
        let axis = depth % 3;
        let delta = query[axis] - n.point[axis];
        let (near, far) = if delta < 0.0 { (n.left, n.right) } else { (n.right, n.left) };
        self.search(near, query, depth + 1, best);
        if delta * delta < best.0 {
            self.search(far, query, depth + 1, best);
        }
    }

    fn byte_size(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<KdNode>()
    }
}

// ── Sampler ───────────────────────────────────────────────────────────────

pub struct HeightmapSampler {
    positions: Vec<Vec3>,
    elevation_m: Vec<f64>,
    triangles: Vec<Triangle>,
    /// Neighbour across the edge opposite each corner, aligned with the
    /// barycentric coordinate order.
    neighbors: Vec<[i32; 3]>,
    kd: KdTree,
    uses_amplified: bool,
}

impl HeightmapSampler {
    pub fn new(
        positions: Vec<Vec3>,
        elevation_m: Vec<f64>,
        triangles: Vec<Triangle>,
        uses_amplified: bool,
    ) -> Result<Self> {
        if positions.is_empty() || triangles.is_empty() {
            return Err(LithosError::DataUnavailable(
                "sampler needs a non-empty mesh".into(),
            ));
        }
        if elevation_m.len() != positions.len() {
            return Err(LithosError::DataUnavailable(format!(
                "elevation length {} does not match vertex count {}",
                elevation_m.len(),
                positions.len()
            )));
        }

        // Edge → incident triangles, then mutual neighbour wiring.
        let mut edge_map: std::collections::HashMap<(u32, u32), [i32; 2]> =
            std::collections::HashMap::with_capacity(triangles.len() * 3 / 2);
        for (ti, t) in triangles.iter().enumerate() {
            for (a, b) in [(t.v1, t.v2), (t.v2, t.v0), (t.v0, t.v1)] {
                let key = (a.min(b), a.max(b));
                let entry = edge_map.entry(key).or_insert([NO_TRIANGLE, NO_TRIANGLE]);
                if entry[0] == NO_TRIANGLE {
                    entry[0] = ti as i32;
                } else {
                    entry[1] = ti as i32;
                }
            }
        }
        let mut neighbors = vec![[NO_TRIANGLE; 3]; triangles.len()];
        for (ti, t) in triangles.iter().enumerate() {
            // Slot k is the edge opposite corner k.
            for (slot, (a, b)) in [(t.v1, t.v2), (t.v2, t.v0), (t.v0, t.v1)]
                .into_iter()
                .enumerate()
            {
                let key = (a.min(b), a.max(b));
                if let Some(pair) = edge_map.get(&key) {
                    neighbors[ti][slot] = if pair[0] == ti as i32 { pair[1] } else { pair[0] };
                }
            }
        }

        let centroids: Vec<Vec3> = triangles
            .iter()
            .map(|t| {
                (positions[t.v0 as usize] + positions[t.v1 as usize] + positions[t.v2 as usize])
                    .normalize()
            })
            .collect();
        let kd = KdTree::build(&centroids);

        Ok(Self { positions, elevation_m, triangles, neighbors, kd, uses_amplified })
    }

    pub fn uses_amplified_elevation(&self) -> bool {
        self.uses_amplified
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn memory_stats(&self) -> SamplerMemoryStats {
        SamplerMemoryStats {
            vertex_count: self.positions.len(),
            triangle_count: self.triangles.len(),
            triangle_bytes: self.triangles.len()
                * (std::mem::size_of::<Triangle>() + std::mem::size_of::<[i32; 3]>()),
            kd_tree_bytes: self.kd.byte_size(),
            snapshot_bytes: self.positions.len()
                * (std::mem::size_of::<Vec3>() + std::mem::size_of::<f64>()),
        }
    }

    /// Equirectangular UV to unit direction: u=0 maps to longitude −π,
    /// v=0 to latitude +π/2.
    pub fn uv_to_unit(u: f64, v: f64) -> Vec3 {
        let lon = u * std::f64::consts::TAU - std::f64::consts::PI;
        let lat = std::f64::consts::FRAC_PI_2 - v * std::f64::consts::PI;
        Vec3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
    }

    fn signed_volumes(&self, tri: usize, dir: Vec3) -> [f64; 3] {
        let t = &self.triangles[tri];
        let a = self.positions[t.v0 as usize];
        let b = self.positions[t.v1 as usize];
        let c = self.positions[t.v2 as usize];
        [dir.dot(b.cross(c)), dir.dot(c.cross(a)), dir.dot(a.cross(b))]
    }

    fn interpolate(&self, tri: usize, bary: [f64; 3]) -> f64 {
        let t = &self.triangles[tri];
        bary[0] * self.elevation_m[t.v0 as usize]
            + bary[1] * self.elevation_m[t.v1 as usize]
            + bary[2] * self.elevation_m[t.v2 as usize]
    }

    fn walk(&self, start: usize, dir: Vec3) -> SampleInfo {
        let mut info = SampleInfo { triangle: start as i32, ..SampleInfo::default() };
        let mut current = start;
        loop {
            let volumes = self.signed_volumes(current, dir);
            let total = volumes[0] + volumes[1] + volumes[2];
            let scale = total.abs().max(1e-300);
            let mut worst_slot = 0usize;
            let mut worst = volumes[0];
            for k in 1..3 {
                if volumes[k] < worst {
                    worst = volumes[k];
                    worst_slot = k;
                }
            }

            if worst / scale >= BARY_EPSILON {
                // Inside (or on an edge): normalise and report the hit.
                let sum = total.max(1e-300);
                info.hit = true;
                info.triangle = current as i32;
                info.barycentric = [
                    (volumes[0] / sum).max(0.0),
                    (volumes[1] / sum).max(0.0),
                    (volumes[2] / sum).max(0.0),
                ];
                return info;
            }

            if info.steps >= MAX_WALK_STEPS {
                info.triangle = current as i32;
                return info;
            }
            let next = self.neighbors[current][worst_slot];
            if next == NO_TRIANGLE {
                info.triangle = current as i32;
                return info;
            }
            current = next as usize;
            info.steps += 1;
            info.triangle = current as i32;
        }
    }

    /// Sample at a unit direction starting from the nearest centroid.
    pub fn sample_at_unit(&self, dir: Vec3, info: &mut SampleInfo) -> f64 {
        let start = match self.kd.nearest([dir.x, dir.y, dir.z]) {
            Some(t) => t as usize,
            None => {
                *info = SampleInfo::default();
                return 0.0;
            }
        };
        *info = self.walk(start, dir);
        if info.hit {
            self.interpolate(info.triangle as usize, info.barycentric)
        } else {
            0.0
        }
    }

    /// Sample at UV through the kd-tree start.
    pub fn sample_at_uv(&self, u: f64, v: f64, info: &mut SampleInfo) -> f64 {
        self.sample_at_unit(Self::uv_to_unit(u, v), info)
    }

    /// Sample at UV walking from a caller-provided hint triangle. Returns
    /// false when the hint is invalid or the walk missed.
    pub fn sample_at_uv_with_hint(
        &self,
        u: f64,
        v: f64,
        hint_triangle: i32,
        info: &mut SampleInfo,
        elevation_out: &mut f64,
    ) -> bool {
        if hint_triangle < 0 || hint_triangle as usize >= self.triangles.len() {
            *info = SampleInfo::default();
            return false;
        }
        let dir = Self::uv_to_unit(u, v);
        *info = self.walk(hint_triangle as usize, dir);
        if info.hit {
            *elevation_out = self.interpolate(info.triangle as usize, info.barycentric);
            true
        } else {
            false
        }
    }

    /// Last-resort sampling: project the barycentrics of the given
    /// triangle onto the valid simplex and interpolate there. Always
    /// produces an elevation; the result is only exact when the query
    /// actually lies in the triangle.
    pub fn sample_at_uv_clamped_hint(
        &self,
        u: f64,
        v: f64,
        triangle: i32,
        info: &mut SampleInfo,
        elevation_out: &mut f64,
    ) -> bool {
        if triangle < 0 || triangle as usize >= self.triangles.len() {
            *info = SampleInfo::default();
            return false;
        }
        let dir = Self::uv_to_unit(u, v);
        let volumes = self.signed_volumes(triangle as usize, dir);
        let clamped = [volumes[0].max(0.0), volumes[1].max(0.0), volumes[2].max(0.0)];
        let sum = clamped[0] + clamped[1] + clamped[2];
        if sum <= 0.0 {
            *info = SampleInfo::default();
            info.triangle = triangle;
            return false;
        }
        let bary = [clamped[0] / sum, clamped[1] / sum, clamped[2] / sum];
        *info = SampleInfo { hit: true, triangle, steps: 0, barycentric: bary };
        *elevation_out = self.interpolate(triangle as usize, bary);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::mesh::backend::triangulate_with;
    use crate::sampling::fibonacci_sphere;

    fn lattice_sampler(n: usize) -> HeightmapSampler {
        let points = fibonacci_sphere(n);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        // A linear-in-position field interpolates exactly.
        let elevation: Vec<f64> = points.iter().map(|p| 1000.0 * p.z + 250.0 * p.x).collect();
        HeightmapSampler::new(points, elevation, tris, false).unwrap()
    }

    #[test]
    fn uv_corners_map_to_the_documented_frame() {
        let north = HeightmapSampler::uv_to_unit(0.5, 0.0);
        assert!(north.z > 0.999999, "v=0 must be the north pole");
        let south = HeightmapSampler::uv_to_unit(0.5, 1.0);
        assert!(south.z < -0.999999, "v=1 must be the south pole");
        let west = HeightmapSampler::uv_to_unit(0.0, 0.5);
        assert!((west.x + 1.0).abs() < 1e-9, "u=0 must be longitude -pi, got {west:?}");
    }

    #[test]
    fn every_query_on_a_closed_mesh_hits() {
        let sampler = lattice_sampler(2_000);
        let mut misses = 0;
        let mut info = SampleInfo::default();
        for iy in 0..64 {
            for ix in 0..128 {
                let u = (ix as f64 + 0.5) / 128.0;
                let v = (iy as f64 + 0.5) / 64.0;
                sampler.sample_at_uv(u, v, &mut info);
                if !info.hit {
                    misses += 1;
                } else {
                    let s: f64 = info.barycentric.iter().sum();
                    assert!((s - 1.0).abs() < 1e-9, "barycentric sum {s}");
                    assert!(info.steps <= MAX_WALK_STEPS);
                }
            }
        }
        assert_eq!(misses, 0, "closed mesh should cover every direction");
    }

    #[test]
    fn linear_fields_interpolate_exactly() {
        let sampler = lattice_sampler(3_000);
        let points = fibonacci_sphere(3_000);
        let mut info = SampleInfo::default();
        for (i, p) in points.iter().enumerate().step_by(271) {
            let expected = 1000.0 * p.z + 250.0 * p.x;
            let got = sampler.sample_at_unit(*p, &mut info);
            assert!(info.hit, "vertex direction {i} missed");
            assert!(
                (got - expected).abs() < 1e-6,
                "vertex {i}: got {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn hints_shorten_the_walk() {
        let sampler = lattice_sampler(5_000);
        let mut cold = SampleInfo::default();
        let u = 0.37;
        let v = 0.41;
        sampler.sample_at_uv(u, v, &mut cold);
        assert!(cold.hit);

        // Re-query a neighbouring pixel with the hit triangle as hint.
        let mut hinted = SampleInfo::default();
        let mut elevation = 0.0;
        let ok = sampler.sample_at_uv_with_hint(
            u + 1.0 / 512.0,
            v,
            cold.triangle,
            &mut hinted,
            &mut elevation,
        );
        assert!(ok);
        assert!(
            hinted.steps <= 4,
            "adjacent-pixel walk took {} steps from a hint",
            hinted.steps
        );
    }

    #[test]
    fn invalid_hint_is_rejected() {
        let sampler = lattice_sampler(500);
        let mut info = SampleInfo::default();
        let mut elevation = 0.0;
        assert!(!sampler.sample_at_uv_with_hint(0.5, 0.5, -1, &mut info, &mut elevation));
        assert!(!sampler.sample_at_uv_with_hint(
            0.5,
            0.5,
            i32::MAX,
            &mut info,
            &mut elevation
        ));
    }

    #[test]
    fn clamped_hint_always_produces_an_elevation() {
        let sampler = lattice_sampler(500);
        let mut info = SampleInfo::default();
        let mut elevation = f64::NAN;
        // Query the antipode of triangle 0's centroid: far outside it.
        let ok = sampler.sample_at_uv_clamped_hint(0.99, 0.01, 0, &mut info, &mut elevation);
        if ok {
            assert!(info.hit);
            assert!(elevation.is_finite());
            let s: f64 = info.barycentric.iter().sum();
            assert!((s - 1.0).abs() < 1e-9);
        }
        // A direct hit through the clamped path matches plain sampling.
        let mut plain = SampleInfo::default();
        let z_plain = sampler.sample_at_uv(0.3, 0.6, &mut plain);
        let mut clamped = SampleInfo::default();
        let mut z_clamped = 0.0;
        assert!(sampler.sample_at_uv_clamped_hint(
            0.3,
            0.6,
            plain.triangle,
            &mut clamped,
            &mut z_clamped
        ));
        assert!((z_plain - z_clamped).abs() < 1e-9);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let points = fibonacci_sphere(100);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        assert!(HeightmapSampler::new(points.clone(), vec![0.0; 99], tris.clone(), false).is_err());
        assert!(HeightmapSampler::new(Vec::new(), Vec::new(), tris, false).is_err());
    }

    #[test]
    fn memory_stats_are_nonzero() {
        let sampler = lattice_sampler(1_000);
        let stats = sampler.memory_stats();
        assert_eq!(stats.vertex_count, 1_000);
        assert!(stats.triangle_count > 1_900);
        assert!(stats.triangle_bytes > 0);
        assert!(stats.kd_tree_bytes > 0);
        assert!(stats.total_bytes() > 0);
    }
}
