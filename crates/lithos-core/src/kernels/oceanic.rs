//! Oceanic crust template: blends each oceanic vertex between its plate
//! baseline and an age-proxy ridge profile, and maintains the
//! ridge-direction cache used by Stage B.

use std::collections::BTreeSet;

use crate::boundary::{BoundaryClass, BoundaryField};
use crate::constants::{
    geodesic_radians_to_km, km_to_geodesic_radians, ABYSSAL_ELEVATION_M, RIDGE_DIRECTION_MAX_KM,
    RIDGE_ELEVATION_M,
};
use crate::mesh::adjacency::AdjacencyCsr;
use crate::plates::NO_PLATE;
use crate::sphere::{angular_distance, Vec3, ZERO};

const ALPHA_EPSILON: f64 = 1e-9;

/// Ridge template elevation for a given ridge distance: quadratic blend
/// from the crest (-1000 m) to the abyssal plain (-6000 m) over 1000 km.
pub fn ridge_template_elevation_m(d_ridge_km: f64) -> f64 {
    let t = (d_ridge_km / 1000.0).clamp(0.0, 1.0);
    let s = t * t;
    RIDGE_ELEVATION_M + (ABYSSAL_ELEVATION_M - RIDGE_ELEVATION_M) * s
}

/// Per-vertex ridge directions (unit tangent, zero when unset) with a
/// version counter so downstream caches can invalidate.
#[derive(Debug, Clone, Default)]
pub struct RidgeCache {
    pub directions: Vec<Vec3>,
    pub version: u64,
}

impl RidgeCache {
    fn set_direction(&mut self, index: usize, p: Vec3, nearest_ridge_q: Vec3) {
        let r = (p - nearest_ridge_q).cross(p).normalize_or_zero();
        if !r.is_nearly_zero() {
            self.directions[index] = r;
        }
    }

    /// Rebuild all directions from the current divergent edge set.
    pub fn rebuild(&mut self, points: &[Vec3], boundary: &BoundaryField) {
        self.directions = vec![ZERO; points.len()];
        self.version += 1;

        let midpoints = boundary.ridge_midpoints(points);
        if midpoints.is_empty() {
            return;
        }
        let max_angle = km_to_geodesic_radians(RIDGE_DIRECTION_MAX_KM);
        for i in 0..points.len() {
            let p = points[i];
            let mut best = f64::MAX;
            let mut best_q = ZERO;
            for &q in &midpoints {
                let ang = angular_distance(p, q);
                if ang < best {
                    best = ang;
                    best_q = q;
                }
            }
            if best <= max_angle {
                self.set_direction(i, p, best_q);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OceanicMetrics {
    pub vertices_updated: usize,
    pub mean_alpha: f64,
    pub min_alpha: f64,
    pub max_alpha: f64,
    pub ridge_length_km: f64,
    pub interpolated_baselines: usize,
    pub fallback_baselines: usize,
}

impl Default for OceanicMetrics {
    fn default() -> Self {
        Self {
            vertices_updated: 0,
            mean_alpha: 0.0,
            min_alpha: 1.0,
            max_alpha: 0.0,
            ridge_length_km: 0.0,
            interpolated_baselines: 0,
            fallback_baselines: 0,
        }
    }
}

/// Nearest vertex of `plate` within `max_ring` adjacency rings of
/// `center`, by geodesic distance to `origin`; ties break toward the lower
/// index. The frontier is expanded in sorted order for determinism.
fn nearest_on_plate(
    points: &[Vec3],
    csr: &AdjacencyCsr,
    plate_ids: &[i32],
    plate: i32,
    center: usize,
    origin: Vec3,
    max_ring: usize,
) -> Option<(usize, f64)> {
    let mut visited: BTreeSet<u32> = BTreeSet::new();
    visited.insert(center as u32);
    let mut frontier: Vec<u32> = vec![center as u32];
    let mut best: Option<(usize, f64)> = None;

    for _ in 0..max_ring {
        if frontier.is_empty() {
            break;
        }
        frontier.sort_unstable();
        let mut next = Vec::with_capacity(frontier.len() * 6);
        for &v in &frontier {
            for &nb in csr.neighbors_of(v as usize) {
                if !visited.insert(nb) {
                    continue;
                }
                next.push(nb);
                if plate_ids.get(nb as usize).copied().unwrap_or(NO_PLATE) == plate {
                    let d = geodesic_radians_to_km(angular_distance(points[nb as usize], origin));
                    let better = match best {
                        None => true,
                        Some((bi, bd)) => {
                            d < bd || ((d - bd).abs() < 1e-12 && (nb as usize) < bi)
                        }
                    };
                    if better {
                        best = Some((nb as usize, d));
                    }
                }
            }
        }
        frontier = next;
    }
    best
}

/// Apply the oceanic crust template in place.
///
/// `plate_is_oceanic` is indexed by plate id; `baseline_m` is the
/// per-vertex plate baseline elevation. When a vertex sits near a
/// divergent edge whose two sides are resolvable, the baseline is the
/// distance-weighted blend of the nearest baseline sample on each side.
#[allow(clippy::too_many_arguments)]
pub fn apply_oceanic_crust(
    points: &[Vec3],
    csr: &AdjacencyCsr,
    boundary: &BoundaryField,
    plate_ids: &[i32],
    plate_is_oceanic: &[bool],
    baseline_m: &[f64],
    elevation_m: &mut [f64],
    ridge_cache: Option<&mut RidgeCache>,
) -> OceanicMetrics {
    let n = points.len();
    let mut metrics = OceanicMetrics::default();
    if n == 0 || elevation_m.len() != n {
        return metrics;
    }

    // Ridge midpoints and total ridge length, in edge order.
    let mut ridge_midpoints = Vec::new();
    let mut divergent_edge_endpoints: Vec<(u32, u32)> = Vec::new();
    for e in &boundary.edges {
        if e.class == BoundaryClass::Divergent {
            let a = points[e.a as usize];
            let b = points[e.b as usize];
            ridge_midpoints.push((a + b).normalize());
            divergent_edge_endpoints.push((e.a, e.b));
            metrics.ridge_length_km += geodesic_radians_to_km(angular_distance(a, b));
        }
    }

    if let Some(cache) = &ridge_cache {
        debug_assert!(cache.directions.len() == n || cache.directions.is_empty());
    }
    let mut ridge_cache = ridge_cache;
    if let Some(cache) = ridge_cache.as_deref_mut() {
        if cache.directions.len() != n {
            cache.directions = vec![ZERO; n];
        }
        cache.version += 1;
    }

    let max_ridge_angle = km_to_geodesic_radians(RIDGE_DIRECTION_MAX_KM);
    let mut alpha_sum = 0.0;

    for i in 0..n {
        let p = points[i];
        let d_ridge = boundary.distance_to_ridge_km.get(i).copied().unwrap_or(1.0e9);
        let d_boundary = boundary
            .distance_to_boundary_km
            .get(i)
            .copied()
            .unwrap_or(1.0e9);

        let alpha = (d_ridge / (d_ridge + d_boundary).max(ALPHA_EPSILON)).clamp(0.0, 1.0);
        metrics.min_alpha = metrics.min_alpha.min(alpha);
        metrics.max_alpha = metrics.max_alpha.max(alpha);
        alpha_sum += alpha;

        let pid = plate_ids.get(i).copied().unwrap_or(NO_PLATE);
        let oceanic = pid != NO_PLATE
            && plate_is_oceanic.get(pid as usize).copied().unwrap_or(false);
        if oceanic {
            let z_gamma = ridge_template_elevation_m(d_ridge);
            let mut z_bar = baseline_m.get(i).copied().unwrap_or(elevation_m[i]);

            if alpha < 0.999 && !divergent_edge_endpoints.is_empty() {
                // Nearest divergent edge by midpoint angle.
                let mut best = f64::MAX;
                let mut best_edge = usize::MAX;
                for (k, q) in ridge_midpoints.iter().enumerate() {
                    let ang = angular_distance(p, *q);
                    if ang < best {
                        best = ang;
                        best_edge = k;
                    }
                }
                let (ea, eb) = divergent_edge_endpoints[best_edge];
                let pid_a = plate_ids.get(ea as usize).copied().unwrap_or(NO_PLATE);
                let pid_b = plate_ids.get(eb as usize).copied().unwrap_or(NO_PLATE);

                let mut blended = false;
                if pid_a != NO_PLATE && pid_b != NO_PLATE && pid_a != pid_b {
                    let side_a =
                        nearest_on_plate(points, csr, plate_ids, pid_a, i, p, 2);
                    let side_b =
                        nearest_on_plate(points, csr, plate_ids, pid_b, i, p, 2);
                    if let (Some((ai, ad)), Some((bi, bd))) = (side_a, side_b) {
                        let sum = (ad + bd).max(ALPHA_EPSILON);
                        let wa = bd / sum;
                        let wb = ad / sum;
                        z_bar = wa * baseline_m[ai] + wb * baseline_m[bi];
                        metrics.interpolated_baselines += 1;
                        blended = true;
                    }
                }
                if !blended {
                    metrics.fallback_baselines += 1;
                }
            }

            let z_new = alpha * z_bar + (1.0 - alpha) * z_gamma;
            if z_new != elevation_m[i] {
                elevation_m[i] = z_new;
                metrics.vertices_updated += 1;
            }
        }

        if let Some(cache) = ridge_cache.as_deref_mut() {
            if d_ridge <= RIDGE_DIRECTION_MAX_KM && !ridge_midpoints.is_empty() {
                let mut best = f64::MAX;
                let mut best_q = ZERO;
                for &q in &ridge_midpoints {
                    let ang = angular_distance(p, q);
                    if ang < best {
                        best = ang;
                        best_q = q;
                    }
                }
                if best <= max_ridge_angle {
                    cache.set_direction(i, p, best_q);
                }
            }
        }
    }

    metrics.mean_alpha = alpha_sum / n as f64;
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{compute_boundary_fields, DEFAULT_TRANSFORM_EPSILON};
    use crate::config::Backend;
    use crate::mesh::adjacency::{neighbors, AdjacencyCsr};
    use crate::mesh::backend::triangulate_with;
    use crate::sampling::fibonacci_sphere;

    #[test]
    fn template_interpolates_crest_to_abyss() {
        assert_eq!(ridge_template_elevation_m(0.0), RIDGE_ELEVATION_M);
        assert_eq!(ridge_template_elevation_m(1000.0), ABYSSAL_ELEVATION_M);
        assert_eq!(ridge_template_elevation_m(5000.0), ABYSSAL_ELEVATION_M);
        let mid = ridge_template_elevation_m(500.0);
        // Quadratic falloff: at t = 0.5 the blend factor is 0.25.
        let expected = RIDGE_ELEVATION_M + (ABYSSAL_ELEVATION_M - RIDGE_ELEVATION_M) * 0.25;
        assert!((mid - expected).abs() < 1e-9);
    }

    struct World {
        points: Vec<Vec3>,
        csr: AdjacencyCsr,
        plate_ids: Vec<i32>,
        boundary: crate::boundary::BoundaryField,
    }

    fn divergent_world(n: usize) -> World {
        let points = fibonacci_sphere(n);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        let nbs = neighbors(points.len(), &tris);
        let plate_ids: Vec<i32> =
            points.iter().map(|p| if p.z >= 0.0 { 0 } else { 1 }).collect();
        let w = 0.02;
        let boundary = compute_boundary_fields(
            &points,
            &nbs,
            &plate_ids,
            &[Vec3::new(w, 0.0, 0.0), Vec3::new(-w, 0.0, 0.0)],
            DEFAULT_TRANSFORM_EPSILON,
        );
        let csr = AdjacencyCsr::from_lists(&nbs);
        World { points, csr, plate_ids, boundary }
    }

    #[test]
    fn template_bounds_near_and_far_from_the_ridge() {
        let world = divergent_world(10_000);
        assert!(world.boundary.metrics.num_divergent > 0);

        let n = world.points.len();
        let baseline = vec![ABYSSAL_ELEVATION_M; n];
        let mut elevation = baseline.clone();
        let oceanic = vec![true, true];
        let metrics = apply_oceanic_crust(
            &world.points,
            &world.csr,
            &world.boundary,
            &world.plate_ids,
            &oceanic,
            &baseline,
            &mut elevation,
            None,
        );
        assert!(metrics.vertices_updated > 0);
        assert!(metrics.min_alpha >= 0.0 && metrics.max_alpha <= 1.0);

        let mut crest_checked = 0;
        for i in 0..n {
            let d_ridge = world.boundary.distance_to_ridge_km[i];
            let d_boundary = world.boundary.distance_to_boundary_km[i];
            if d_ridge >= 1200.0 {
                assert!(
                    (elevation[i] - baseline[i]).abs() <= 200.0,
                    "far-interior vertex {i} strayed from baseline: {} at d={d_ridge}",
                    elevation[i]
                );
            } else if d_ridge <= 100.0 {
                // The crest property holds where the ridge dominates the
                // blend; at ridge endpoints alpha is exactly zero.
                let alpha = d_ridge / (d_ridge + d_boundary).max(1e-9);
                if alpha <= 0.1 {
                    crest_checked += 1;
                    assert!(
                        (elevation[i] - RIDGE_ELEVATION_M).abs() <= 1000.0,
                        "near-ridge vertex {i} too far from crest: {} at d={d_ridge}",
                        elevation[i]
                    );
                }
            }
        }
        assert!(crest_checked > 0, "no ridge-dominated vertex was exercised");
    }

    #[test]
    fn continental_plates_are_untouched() {
        let world = divergent_world(2_000);
        let n = world.points.len();
        let baseline = vec![-4000.0; n];
        let mut elevation = vec![123.0; n];
        // Plate 1 continental.
        let oceanic = vec![true, false];
        apply_oceanic_crust(
            &world.points,
            &world.csr,
            &world.boundary,
            &world.plate_ids,
            &oceanic,
            &baseline,
            &mut elevation,
            None,
        );
        for (i, &pid) in world.plate_ids.iter().enumerate() {
            if pid == 1 {
                assert_eq!(elevation[i], 123.0, "continental vertex {i} modified");
            }
        }
    }

    #[test]
    fn ridge_cache_sets_unit_tangents_near_ridges_only() {
        let world = divergent_world(4_000);
        let n = world.points.len();
        let baseline = vec![ABYSSAL_ELEVATION_M; n];
        let mut elevation = baseline.clone();
        let mut cache = RidgeCache::default();
        apply_oceanic_crust(
            &world.points,
            &world.csr,
            &world.boundary,
            &world.plate_ids,
            &[true, true],
            &baseline,
            &mut elevation,
            Some(&mut cache),
        );
        assert_eq!(cache.version, 1);
        let mut set_count = 0;
        for i in 0..n {
            let r = cache.directions[i];
            let d = world.boundary.distance_to_ridge_km[i];
            if !r.is_nearly_zero() {
                set_count += 1;
                assert!((r.length() - 1.0).abs() < 1e-9, "ridge dir {i} not unit");
                assert!(r.dot(world.points[i]).abs() < 1e-9, "ridge dir {i} not tangent");
                assert!(d <= RIDGE_DIRECTION_MAX_KM * 1.5, "ridge dir set far away at {i}");
            }
        }
        assert!(set_count > 0, "no ridge directions set");
    }

    #[test]
    fn rebuild_matches_inline_update() {
        let world = divergent_world(1_000);
        let n = world.points.len();
        let baseline = vec![ABYSSAL_ELEVATION_M; n];
        let mut elevation = baseline.clone();
        let mut inline_cache = RidgeCache::default();
        apply_oceanic_crust(
            &world.points,
            &world.csr,
            &world.boundary,
            &world.plate_ids,
            &[true, true],
            &baseline,
            &mut elevation,
            Some(&mut inline_cache),
        );
        let mut rebuilt = RidgeCache::default();
        rebuilt.rebuild(&world.points, &world.boundary);
        // The inline pass additionally gates on the graph distance field,
        // so its set is a subset of the rebuilt one; where both are set
        // they must agree exactly.
        for i in 0..n {
            let a = inline_cache.directions[i];
            let b = rebuilt.directions[i];
            if !a.is_nearly_zero() {
                assert!(
                    (a - b).length() < 1e-12,
                    "cache divergence at {i}: {a:?} vs {b:?}"
                );
            }
        }
    }
}
