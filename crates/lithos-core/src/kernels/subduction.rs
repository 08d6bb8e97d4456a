//! Subduction uplift `û = u₀·f(d)·g(v)·h(z)`, fold-direction updates, and
//! the slab-pull reaction on plate angular velocities.

use crate::boundary::BoundaryField;
use crate::constants::{
    FOLD_DIRECTION_BETA, MAX_PLATE_SPEED_KM_PER_MA, PLANET_RADIUS_KM, SLAB_PULL_EPSILON,
    SUBDUCTION_CONTROL_DISTANCE_KM, SUBDUCTION_DISTANCE_KM, SUBDUCTION_UPLIFT_M_PER_MA,
    normalized_elevation_for_subduction,
};
use crate::mesh::adjacency::AdjacencyCsr;
use crate::plates::NO_PLATE;
use crate::sphere::{angular_distance, Vec3, ZERO};

/// Stress accumulated per metre of uplift (MPa/m).
const UPLIFT_STRESS_COUPLING: f64 = 0.05;

#[inline]
fn smoothstep01(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Distance kernel: a C¹ bump over [0, r_s] rising to 1 at r_c, zero at
/// both ends and outside.
pub fn f_distance_kernel(d_km: f64) -> f64 {
    let rs = SUBDUCTION_DISTANCE_KM;
    let rc = SUBDUCTION_CONTROL_DISTANCE_KM;
    if d_km <= 0.0 || d_km >= rs {
        return 0.0;
    }
    if d_km <= rc {
        smoothstep01(d_km / rc)
    } else {
        1.0 - smoothstep01((d_km - rc) / (rs - rc))
    }
}

/// Speed ratio v/v₀; clamped below at zero, no upper clamp.
pub fn g_speed_ratio(v_km_per_ma: f64) -> f64 {
    v_km_per_ma.max(0.0) / MAX_PLATE_SPEED_KM_PER_MA
}

/// Elevation factor z̃² with z̃ normalised over [trench, max continental].
pub fn h_elevation_factor(elevation_m: f64) -> f64 {
    let zt = normalized_elevation_for_subduction(elevation_m).clamp(0.0, 1.0);
    zt * zt
}

/// Magnitude of the relative surface velocity between two plates at a
/// unit-sphere point, in km/Ma.
pub fn relative_surface_speed(omega_i: Vec3, omega_j: Vec3, p: Vec3) -> f64 {
    let vi = omega_i.cross(p) * PLANET_RADIUS_KM;
    let vj = omega_j.cross(p) * PLANET_RADIUS_KM;
    (vi - vj).length().max(0.0)
}

#[derive(Debug, Clone, Default)]
pub struct SubductionMetrics {
    pub vertices_touched: usize,
    pub total_uplift_m: f64,
    pub max_uplift_m: f64,
}

/// First cross-plate neighbour in ring 1, then ring 2; the vertex's own
/// plate when nothing opposes (which zeroes the uplift's meaning upstream).
fn find_opposing_plate(csr: &AdjacencyCsr, plate_ids: &[i32], vertex: usize, own: i32) -> i32 {
    for &nb in csr.neighbors_of(vertex) {
        let pj = plate_ids.get(nb as usize).copied().unwrap_or(NO_PLATE);
        if pj != NO_PLATE && pj != own {
            return pj;
        }
    }
    for &nb in csr.neighbors_of(vertex) {
        for &nb2 in csr.neighbors_of(nb as usize) {
            let pj = plate_ids.get(nb2 as usize).copied().unwrap_or(NO_PLATE);
            if pj != NO_PLATE && pj != own {
                return pj;
            }
        }
    }
    own
}

/// Apply one step of subduction uplift in place. Stress accumulates in
/// proportion to the applied uplift.
#[allow(clippy::too_many_arguments)]
pub fn apply_uplift(
    points: &[Vec3],
    csr: &AdjacencyCsr,
    plate_ids: &[i32],
    omegas: &[Vec3],
    boundary: &BoundaryField,
    elevation_m: &mut [f64],
    stress_mpa: &mut [f64],
    dt_ma: f64,
) -> SubductionMetrics {
    let mut metrics = SubductionMetrics::default();
    for i in 0..points.len() {
        let d_km = boundary
            .distance_to_subduction_km
            .get(i)
            .copied()
            .unwrap_or(f64::MAX);
        let f = f_distance_kernel(d_km);
        if f <= 0.0 {
            continue;
        }

        let own = plate_ids.get(i).copied().unwrap_or(NO_PLATE);
        if own == NO_PLATE || own as usize >= omegas.len() {
            continue;
        }
        let opposing = find_opposing_plate(csr, plate_ids, i, own);
        let omega_i = omegas[own as usize];
        let omega_j = omegas.get(opposing as usize).copied().unwrap_or(ZERO);

        let g = g_speed_ratio(relative_surface_speed(omega_i, omega_j, points[i]));
        let h = h_elevation_factor(elevation_m[i]);
        let uplift_m = SUBDUCTION_UPLIFT_M_PER_MA * f * g * h * dt_ma;
        if uplift_m > 0.0 {
            elevation_m[i] += uplift_m;
            stress_mpa[i] += uplift_m * UPLIFT_STRESS_COUPLING;
            metrics.vertices_touched += 1;
            metrics.total_uplift_m += uplift_m;
            metrics.max_uplift_m = metrics.max_uplift_m.max(uplift_m);
        }
    }
    metrics
}

#[derive(Debug, Clone, Default)]
pub struct FoldMetrics {
    pub vertices_updated: usize,
    pub mean_delta: f64,
    pub max_delta: f64,
    /// Mean |dot(fold, relative direction)| over updated vertices.
    pub mean_coherence: f64,
}

/// Blend each in-band vertex's fold direction toward the projected
/// relative velocity between the subducting plate and the vertex's own
/// plate, keeping the vector unit and tangent.
pub fn update_fold_directions(
    points: &[Vec3],
    csr: &AdjacencyCsr,
    plate_ids: &[i32],
    omegas: &[Vec3],
    boundary: &BoundaryField,
    fold: &mut [Vec3],
    dt_ma: f64,
) -> FoldMetrics {
    let n = points.len();
    let mut metrics = FoldMetrics::default();

    // Incident convergent edges per vertex, indices into
    // `boundary.convergent_edges`, in stored order.
    let mut incident: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (ei, ce) in boundary.convergent_edges.iter().enumerate() {
        incident[ce.a as usize].push(ei as u32);
        incident[ce.b as usize].push(ei as u32);
    }

    let mut sum_delta = 0.0;
    let mut sum_coherence = 0.0;

    for i in 0..n {
        let own = plate_ids.get(i).copied().unwrap_or(NO_PLATE);
        if own == NO_PLATE || own as usize >= omegas.len() {
            continue;
        }
        let d_front = boundary
            .distance_to_subduction_km
            .get(i)
            .copied()
            .unwrap_or(f64::MAX);
        if d_front > SUBDUCTION_DISTANCE_KM {
            continue;
        }

        let p = points[i];
        let edge_index = if let Some(&first) = incident[i].first() {
            Some(first)
        } else {
            // Nearest convergent edge among the neighbours' incident sets,
            // by midpoint angle.
            let mut best: Option<(f64, u32)> = None;
            for &nb in csr.neighbors_of(i) {
                for &ei in &incident[nb as usize] {
                    let ce = &boundary.convergent_edges[ei as usize];
                    let q = (points[ce.a as usize] + points[ce.b as usize]).normalize();
                    let theta = angular_distance(q, p);
                    if best.map_or(true, |(bd, _)| theta < bd) {
                        best = Some((theta, ei));
                    }
                }
            }
            best.map(|(_, ei)| ei)
        };
        let Some(edge_index) = edge_index else { continue };
        let ce = &boundary.convergent_edges[edge_index as usize];
        if ce.subducting_plate as usize >= omegas.len() {
            continue;
        }

        let v_sub = omegas[ce.subducting_plate as usize].cross(p) * PLANET_RADIUS_KM;
        let v_own = omegas[own as usize].cross(p) * PLANET_RADIUS_KM;
        let rel = (v_sub - v_own).project_to_tangent(p);

        let delta = rel * (FOLD_DIRECTION_BETA * dt_ma);
        let mut f = fold[i].project_to_tangent(p);
        if f.is_nearly_zero() {
            f = delta;
        } else {
            f += delta;
        }

        let delta_len = delta.length();
        if delta_len > 0.0 {
            metrics.vertices_updated += 1;
            sum_delta += delta_len;
            metrics.max_delta = metrics.max_delta.max(delta_len);
        }

        fold[i] = f.normalize_or_zero();

        let rel_len = rel.length();
        if rel_len > 0.0 {
            sum_coherence += fold[i].dot(rel * (1.0 / rel_len)).abs();
        }
    }

    if metrics.vertices_updated > 0 {
        metrics.mean_delta = sum_delta / metrics.vertices_updated as f64;
        metrics.mean_coherence = sum_coherence / metrics.vertices_updated as f64;
    }
    metrics
}

#[derive(Debug, Clone, Default)]
pub struct SlabPullMetrics {
    pub plates_updated: usize,
    pub mean_delta_omega: f64,
    pub max_delta_omega: f64,
}

/// Slab pull: for each convergent edge midpoint q, accumulate
/// `normalise(c_sub × q)` into the subducting plate, then scale by
/// `ε·dt`. Edges are iterated in stored order so the reduction is
/// deterministic. Returns per-plate Ω deltas for the caller to apply.
pub fn slab_pull_deltas(
    plate_centroids: &[Vec3],
    boundary: &BoundaryField,
    points: &[Vec3],
    dt_ma: f64,
) -> (Vec<Vec3>, SlabPullMetrics) {
    let mut accel = vec![ZERO; plate_centroids.len()];
    for ce in &boundary.convergent_edges {
        let sub = ce.subducting_plate;
        if sub < 0 || sub as usize >= plate_centroids.len() {
            continue;
        }
        let q = (points[ce.a as usize] + points[ce.b as usize]).normalize_or_zero();
        if q.is_nearly_zero() {
            continue;
        }
        let pull = plate_centroids[sub as usize].cross(q).normalize_or_zero();
        accel[sub as usize] += pull;
    }

    let mut metrics = SlabPullMetrics::default();
    let mut sum = 0.0;
    let deltas: Vec<Vec3> = accel
        .into_iter()
        .map(|a| {
            let delta = a * (SLAB_PULL_EPSILON * dt_ma);
            let mag = delta.length();
            if mag > 0.0 {
                metrics.plates_updated += 1;
                sum += mag;
                metrics.max_delta_omega = metrics.max_delta_omega.max(mag);
            }
            delta
        })
        .collect();
    if metrics.plates_updated > 0 {
        metrics.mean_delta_omega = sum / metrics.plates_updated as f64;
    }
    (deltas, metrics)
}
