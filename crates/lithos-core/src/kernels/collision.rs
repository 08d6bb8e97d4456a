//! Continental collision: convergent edges between two continental plates
//! spawn terrane-accretion events that surge elevation with a quartic
//! falloff around the event centre.

use crate::boundary::BoundaryField;
use crate::constants::{COLLISION_COEFFICIENT_PER_KM, MAX_PLATE_SPEED_KM_PER_MA, PLANET_RADIUS_KM};
use crate::plates::NO_PLATE;
use crate::sphere::{angular_distance, Vec3};

/// Deterministic fallback terrane area when no provenance is tracked.
pub const DEFAULT_TERRANE_AREA_KM2: f64 = 1.0e6;

/// Near-duplicate merge threshold: same plate pair within half a degree.
const MERGE_THRESHOLD_RAD: f64 = 0.5 * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone)]
pub struct CollisionEvent {
    pub center: Vec3,
    pub terrane_area_km2: f64,
    /// Lower plate id of the colliding pair.
    pub carrier_plate: i32,
    /// Higher plate id of the colliding pair.
    pub target_plate: i32,
    /// Cap on the peak surge, in metres; 0 disables the cap.
    pub peak_guardrail_m: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CollisionMetrics {
    pub collision_count: usize,
    pub max_peak_m: f64,
    pub vertices_affected: usize,
}

/// Collect candidate events from convergent continental-continental edges
/// and merge near-duplicates (same ordered plate pair, centres within
/// 0.5°) by averaging centres and areas.
pub fn detect_collisions(
    points: &[Vec3],
    plate_ids: &[i32],
    plate_is_continental: &[bool],
    boundary: &BoundaryField,
    peak_guardrail_m: f64,
) -> Vec<CollisionEvent> {
    let mut events: Vec<CollisionEvent> = Vec::new();

    for ce in &boundary.convergent_edges {
        let pa = plate_ids.get(ce.a as usize).copied().unwrap_or(NO_PLATE);
        let pb = plate_ids.get(ce.b as usize).copied().unwrap_or(NO_PLATE);
        if pa == NO_PLATE || pb == NO_PLATE || pa == pb {
            continue;
        }
        let cont_a = plate_is_continental.get(pa as usize).copied().unwrap_or(false);
        let cont_b = plate_is_continental.get(pb as usize).copied().unwrap_or(false);
        if !(cont_a && cont_b) {
            continue;
        }

        let q = (points[ce.a as usize] + points[ce.b as usize]).normalize_or_zero();
        if q.is_nearly_zero() {
            continue;
        }
        let (lo, hi) = (pa.min(pb), pa.max(pb));

        let mut merged = false;
        for event in &mut events {
            if event.carrier_plate != lo || event.target_plate != hi {
                continue;
            }
            if angular_distance(event.center, q) <= MERGE_THRESHOLD_RAD {
                event.center = (event.center + q).normalize();
                event.terrane_area_km2 =
                    0.5 * (event.terrane_area_km2 + DEFAULT_TERRANE_AREA_KM2);
                merged = true;
                break;
            }
        }
        if !merged {
            events.push(CollisionEvent {
                center: q,
                terrane_area_km2: DEFAULT_TERRANE_AREA_KM2,
                carrier_plate: lo,
                target_plate: hi,
                peak_guardrail_m,
            });
        }
    }
    events
}

/// Angular influence radius for an event: grows with the terrane footprint
/// and the relative convergence speed, clamped to [2°, 15°].
pub fn event_radius_rad(event: &CollisionEvent, relative_speed_km_per_ma: f64) -> f64 {
    let footprint = (event.terrane_area_km2 / std::f64::consts::PI).sqrt() / PLANET_RADIUS_KM;
    let speed_scale = 0.5 + (relative_speed_km_per_ma / MAX_PLATE_SPEED_KM_PER_MA).min(1.5);
    (footprint * speed_scale).clamp(2.0_f64.to_radians(), 15.0_f64.to_radians())
}

/// Apply a surge: `Δz = Δz_peak · (1 − t²)²` with `t = ang(p, centre)/r`,
/// over the affected vertex set. Fold vectors, when supplied, become unit
/// tangents radial from the centre.
pub fn apply_collision_surge(
    points: &[Vec3],
    affected: &[u32],
    event: &CollisionEvent,
    radius_rad: f64,
    elevation_m: &mut [f64],
    mut fold: Option<&mut [Vec3]>,
) -> CollisionMetrics {
    let mut metrics = CollisionMetrics::default();
    if event.terrane_area_km2 <= 0.0 || affected.is_empty() || radius_rad <= 0.0 {
        return metrics;
    }

    let mut peak_m = COLLISION_COEFFICIENT_PER_KM * event.terrane_area_km2 * 1000.0;
    if event.peak_guardrail_m > 0.0 {
        peak_m = peak_m.min(event.peak_guardrail_m);
    }
    metrics.collision_count = 1;
    metrics.max_peak_m = peak_m;

    for &idx in affected {
        let i = idx as usize;
        if i >= points.len() || i >= elevation_m.len() {
            continue;
        }
        let p = points[i];
        let d = angular_distance(p, event.center);
        if d > radius_rad {
            continue;
        }
        let t = d / radius_rad;
        let w = (1.0 - t * t) * (1.0 - t * t);
        elevation_m[i] += peak_m * w;
        metrics.vertices_affected += 1;

        if let Some(fold) = fold.as_deref_mut() {
            let radial = (p - event.center).project_to_tangent(p).normalize_or_zero();
            if !radial.is_nearly_zero() {
                fold[i] = radial;
            }
        }
    }
    metrics
}

/// Vertices within the event radius, in index order.
pub fn affected_vertices(points: &[Vec3], center: Vec3, radius_rad: f64) -> Vec<u32> {
    points
        .iter()
        .enumerate()
        .filter(|(_, p)| angular_distance(**p, center) <= radius_rad)
        .map(|(i, _)| i as u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::fibonacci_sphere;

    fn event_at(center: Vec3) -> CollisionEvent {
        CollisionEvent {
            center,
            terrane_area_km2: 1.0e6,
            carrier_plate: 0,
            target_plate: 1,
            peak_guardrail_m: 6000.0,
        }
    }

    #[test]
    fn surge_respects_the_guardrail_and_quartic_falloff() {
        let points = fibonacci_sphere(10_000);
        let center = Vec3::new(0.0, 0.0, 1.0);
        let event = event_at(center);
        let radius = event_radius_rad(&event, 50.0);
        let affected = affected_vertices(&points, center, radius);
        assert!(!affected.is_empty());

        let mut elevation = vec![0.0f64; points.len()];
        let metrics = apply_collision_surge(
            &points,
            &affected,
            &event,
            radius,
            &mut elevation,
            None,
        );
        assert_eq!(metrics.collision_count, 1);
        assert!(metrics.max_peak_m <= 6000.0);

        // Every affected vertex follows the quartic exactly and stays
        // under the guardrail.
        for &idx in &affected {
            let i = idx as usize;
            let t = angular_distance(points[i], center) / radius;
            assert!(elevation[i] <= 6000.0 + 1e-9);
            let expected = metrics.max_peak_m * (1.0 - t * t).powi(2);
            assert!((elevation[i] - expected).abs() < 1e-9);
        }
        // At the rim the quartic weight vanishes: a point at exactly the
        // radius gains under a micrometre.
        let rim_gain = metrics.max_peak_m * (1.0 - 1.0_f64 * 1.0_f64).powi(2);
        assert!(rim_gain <= 1e-6);
        // Raw peak = 1.3e-5 * 1e6 * 1000 = 13000 m, capped to 6000.
        assert_eq!(metrics.max_peak_m, 6000.0);
    }

    #[test]
    fn fold_vectors_are_unit_radial_tangents() {
        let points = fibonacci_sphere(2_000);
        let center = Vec3::new(0.0, 0.0, 1.0);
        let event = event_at(center);
        let radius = event_radius_rad(&event, 50.0);
        let affected = affected_vertices(&points, center, radius);
        let mut elevation = vec![0.0f64; points.len()];
        let mut fold = vec![crate::sphere::ZERO; points.len()];
        apply_collision_surge(
            &points,
            &affected,
            &event,
            radius,
            &mut elevation,
            Some(&mut fold),
        );
        let mut set = 0;
        for (i, f) in fold.iter().enumerate() {
            if !f.is_nearly_zero() {
                set += 1;
                assert!((f.length() - 1.0).abs() < 1e-9, "fold {i} not unit");
                assert!(f.dot(points[i]).abs() < 1e-9, "fold {i} not orthogonal to position");
            }
        }
        assert!(set > 0);
    }

    #[test]
    fn near_duplicates_merge_by_plate_pair() {
        use crate::boundary::{compute_boundary_fields, DEFAULT_TRANSFORM_EPSILON};
        use crate::config::Backend;
        use crate::mesh::adjacency::neighbors;
        use crate::mesh::backend::triangulate_with;

        let points = fibonacci_sphere(5_000);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        let nbs = neighbors(points.len(), &tris);
        let plate_ids: Vec<i32> =
            points.iter().map(|p| if p.z >= 0.0 { 0 } else { 1 }).collect();
        let w = 0.02;
        let boundary = compute_boundary_fields(
            &points,
            &nbs,
            &plate_ids,
            &[Vec3::new(-w, 0.0, 0.0), Vec3::new(w, 0.0, 0.0)],
            DEFAULT_TRANSFORM_EPSILON,
        );
        assert!(boundary.metrics.num_convergent > 0);

        let events = detect_collisions(&points, &plate_ids, &[true, true], &boundary, 6000.0);
        assert!(!events.is_empty());
        // Dramatically fewer events than convergent edges, thanks to the
        // half-degree merge.
        assert!(events.len() < boundary.convergent_edges.len());
        for e in &events {
            assert_eq!((e.carrier_plate, e.target_plate), (0, 1));
            assert!((e.center.length() - 1.0).abs() < 1e-9);
        }
        // No continental pair, no events.
        let none = detect_collisions(&points, &plate_ids, &[true, false], &boundary, 6000.0);
        assert!(none.is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        use crate::boundary::{compute_boundary_fields, DEFAULT_TRANSFORM_EPSILON};
        use crate::config::Backend;
        use crate::mesh::adjacency::neighbors;
        use crate::mesh::backend::triangulate_with;

        let points = fibonacci_sphere(3_000);
        let tris = triangulate_with(Backend::Auto, &points).unwrap().triangles;
        let nbs = neighbors(points.len(), &tris);
        let plate_ids: Vec<i32> =
            points.iter().map(|p| if p.z >= 0.0 { 0 } else { 1 }).collect();
        let boundary = compute_boundary_fields(
            &points,
            &nbs,
            &plate_ids,
            &[Vec3::new(-0.02, 0.0, 0.0), Vec3::new(0.02, 0.0, 0.0)],
            DEFAULT_TRANSFORM_EPSILON,
        );
        let a = detect_collisions(&points, &plate_ids, &[true, true], &boundary, 6000.0);
        let b = detect_collisions(&points, &plate_ids, &[true, true], &boundary, 6000.0);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!((x.center.x, x.center.y, x.center.z), (y.center.x, y.center.y, y.center.z));
            assert_eq!(x.terrane_area_km2, y.terrane_area_km2);
        }
    }
}
