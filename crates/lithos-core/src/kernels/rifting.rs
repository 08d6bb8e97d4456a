//! Stochastic plate fragmentation with a fully deterministic seeded
//! stream: the rift decision, the fragment count, the fragment seeds, and
//! the drift directions all derive from one per-plate hash seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sphere::{angular_distance, any_tangent, Vec3, ZERO};

/// Salt mixed into every per-plate rifting seed.
const RIFT_SEED_SALT: u32 = 1_460_023;

/// A decided rift, ready to perform.
#[derive(Debug, Clone)]
pub struct RiftingEvent {
    pub plate_id: i32,
    /// 2..=4 fragments.
    pub fragment_count: usize,
    pub plate_area_km2: f64,
    pub continental_ratio: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RiftingMetrics {
    pub rifting_count: usize,
    pub mean_fragments: f64,
}

impl RiftingMetrics {
    pub fn record(&mut self, fragments: usize) {
        let prior = self.mean_fragments * self.rifting_count as f64;
        self.rifting_count += 1;
        self.mean_fragments = (prior + fragments as f64) / self.rifting_count as f64;
    }
}

#[inline]
fn xorshift32(mut a: u32) -> u32 {
    a ^= a << 13;
    a ^= a >> 17;
    a ^= a << 5;
    a
}

/// The deterministic per-plate seed: the plate id and the floored area
/// mixed through xorshift.
pub fn rift_seed(plate_id: i32, plate_area_km2: f64) -> u64 {
    let mixed = xorshift32(RIFT_SEED_SALT ^ plate_id as u32 ^ plate_area_km2.floor() as u32);
    mixed as u64
}

/// Evaluate whether a plate rifts this step.
///
/// `λ₀ = λ_base · clamp(ratio, 0.25, 1) · A/A₀`, `P = λ₀·e^(−λ₀)`; a
/// uniform draw from the plate's seeded stream decides, and the fragment
/// count `2 + uniform{0,1,2}` is drawn from the same stream.
pub fn evaluate_rifting(
    plate_id: i32,
    plate_area_km2: f64,
    continental_ratio: f64,
    lambda_base: f64,
    reference_area_km2: f64,
) -> Option<RiftingEvent> {
    let f = continental_ratio.clamp(0.25, 1.0);
    let area_scale = if reference_area_km2 > 0.0 {
        plate_area_km2 / reference_area_km2
    } else {
        0.0
    };
    let lambda0 = (lambda_base * f * area_scale).max(0.0);
    let probability = (lambda0 * (-lambda0).exp()).clamp(0.0, 1.0);

    let seed = rift_seed(plate_id, plate_area_km2);
    let mut rng = StdRng::seed_from_u64(seed);
    let u: f64 = rng.gen_range(0.0..1.0);
    if u >= probability {
        return None;
    }

    let fragment_count = 2 + rng.gen_range(0..=2usize);
    Some(RiftingEvent {
        plate_id,
        fragment_count,
        plate_area_km2,
        continental_ratio: continental_ratio.clamp(0.0, 1.0),
        seed,
    })
}

/// Outcome of performing a rift.
#[derive(Debug, Clone)]
pub struct RiftingOutcome {
    /// Updated per-vertex plate assignment.
    pub assignments: Vec<i32>,
    /// Plate id per fragment; entry 0 is the parent's id, the rest are
    /// freshly allocated above `max_plate_id`.
    pub fragment_plate_ids: Vec<i32>,
    /// Unit tangent drift direction per fragment.
    pub drift_directions: Vec<Vec3>,
    /// Continental ratio inherited by every fragment.
    pub continental_ratio: f64,
}

/// Split the event's plate into `fragment_count` geodesic-Voronoi
/// fragments around seed vertices drawn from the plate's vertex list.
/// Returns `None` when the plate is too small to split.
pub fn perform_rifting(
    event: &RiftingEvent,
    points: &[Vec3],
    assignments_in: &[i32],
    max_plate_id: i32,
) -> Option<RiftingOutcome> {
    let n = points.len();
    if event.plate_id < 0 || event.fragment_count < 2 || n == 0 {
        return None;
    }

    let plate_vertices: Vec<usize> = (0..n)
        .filter(|&i| assignments_in[i] == event.plate_id)
        .collect();
    if plate_vertices.len() < event.fragment_count {
        return None;
    }

    // The event seed was consumed for the decision and fragment count;
    // re-seed from it for the geometric draws so outcomes replay exactly.
    let mut rng = StdRng::seed_from_u64(event.seed ^ 0xA5A5_5A5A_D00D_F00D);
    let mut seed_vertices: Vec<usize> = Vec::with_capacity(event.fragment_count);
    while seed_vertices.len() < event.fragment_count {
        let candidate = plate_vertices[rng.gen_range(0..plate_vertices.len())];
        if !seed_vertices.contains(&candidate) {
            seed_vertices.push(candidate);
        }
    }

    // Nearest-seed assignment within the plate.
    let mut fragment_of = vec![usize::MAX; n];
    for &v in &plate_vertices {
        let mut best = 0;
        let mut best_angle = f64::MAX;
        for (k, &sv) in seed_vertices.iter().enumerate() {
            let ang = angular_distance(points[v], points[sv]);
            if ang < best_angle {
                best_angle = ang;
                best = k;
            }
        }
        fragment_of[v] = best;
    }

    // Fragment 0 keeps the parent id; the rest extend the id space.
    let mut fragment_plate_ids = Vec::with_capacity(event.fragment_count);
    fragment_plate_ids.push(event.plate_id);
    let mut next_id = max_plate_id;
    for _ in 1..event.fragment_count {
        next_id += 1;
        fragment_plate_ids.push(next_id);
    }

    let mut assignments = assignments_in.to_vec();
    for &v in &plate_vertices {
        assignments[v] = fragment_plate_ids[fragment_of[v]];
    }

    // Drift: the tangent at each fragment centroid, rotated by a bounded
    // hash-seeded angle (±45°).
    let mut drift_directions = Vec::with_capacity(event.fragment_count);
    for k in 0..event.fragment_count {
        let mut sum = ZERO;
        let mut count = 0usize;
        for &v in &plate_vertices {
            if fragment_of[v] == k {
                sum += points[v];
                count += 1;
            }
        }
        let centroid = if count > 0 {
            sum.normalize_or_zero()
        } else {
            points[seed_vertices[k]]
        };
        let centroid = if centroid.is_nearly_zero() {
            points[seed_vertices[k]]
        } else {
            centroid
        };
        let t = any_tangent(centroid);
        let b = centroid.cross(t).normalize_or_zero();
        let angle = (rng.gen_range(0.0..1.0) * 2.0 - 1.0) * 0.25 * std::f64::consts::PI;
        drift_directions.push((t * angle.cos() + b * angle.sin()).normalize());
    }

    Some(RiftingOutcome {
        assignments,
        fragment_plate_ids,
        drift_directions,
        continental_ratio: event.continental_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REFERENCE_PLATE_AREA_KM2;
    use crate::sampling::fibonacci_sphere;

    #[test]
    fn decision_is_deterministic() {
        let a = evaluate_rifting(3, 2.0e7, 0.8, 1.0, REFERENCE_PLATE_AREA_KM2);
        let b = evaluate_rifting(3, 2.0e7, 0.8, 1.0, REFERENCE_PLATE_AREA_KM2);
        match (a, b) {
            (None, None) => {}
            (Some(x), Some(y)) => {
                assert_eq!(x.fragment_count, y.fragment_count);
                assert_eq!(x.seed, y.seed);
            }
            _ => panic!("rift decision not deterministic"),
        }
    }

    #[test]
    fn zero_lambda_never_rifts() {
        for id in 0..50 {
            assert!(evaluate_rifting(id, 1.0e7, 0.8, 0.0, REFERENCE_PLATE_AREA_KM2).is_none());
        }
    }

    #[test]
    fn fragment_counts_cover_two_to_four() {
        // With lambda near 1 the probability e^{-1} ≈ 0.37 triggers often
        // across many plate ids; the count distribution must stay in
        // {2,3,4} and hit every value.
        let mut seen = [false; 5];
        let mut rifts = 0;
        for id in 0..4000 {
            if let Some(e) =
                evaluate_rifting(id, 1.0e7, 1.0, 1.0, REFERENCE_PLATE_AREA_KM2)
            {
                assert!((2..=4).contains(&e.fragment_count));
                seen[e.fragment_count] = true;
                rifts += 1;
            }
        }
        assert!(rifts > 100, "too few rifts triggered: {rifts}");
        assert!(seen[2] && seen[3] && seen[4], "fragment counts not uniform: {seen:?}");
    }

    #[test]
    fn performing_a_rift_keeps_parent_id_and_allocates_fresh_ones() {
        let points = fibonacci_sphere(2_000);
        let assignments: Vec<i32> =
            points.iter().map(|p| if p.z >= 0.0 { 0 } else { 1 }).collect();
        let event = RiftingEvent {
            plate_id: 0,
            fragment_count: 3,
            plate_area_km2: 2.5e8,
            continental_ratio: 0.7,
            seed: 12345,
        };
        let outcome = perform_rifting(&event, &points, &assignments, 1).unwrap();
        assert_eq!(outcome.fragment_plate_ids.len(), 3);
        assert_eq!(outcome.fragment_plate_ids[0], 0);
        assert_eq!(outcome.fragment_plate_ids[1], 2);
        assert_eq!(outcome.fragment_plate_ids[2], 3);
        assert_eq!(outcome.continental_ratio, 0.7);

        // Plate-1 vertices untouched; every old plate-0 vertex now maps to
        // one of the fragment ids, and each fragment is non-empty.
        let mut fragment_sizes = [0usize; 3];
        for (i, (&before, &after)) in
            assignments.iter().zip(&outcome.assignments).enumerate()
        {
            if before == 1 {
                assert_eq!(after, 1, "vertex {i} on another plate was moved");
            } else {
                let slot = outcome
                    .fragment_plate_ids
                    .iter()
                    .position(|&id| id == after)
                    .expect("vertex assigned outside the fragment set");
                fragment_sizes[slot] += 1;
            }
        }
        assert!(fragment_sizes.iter().all(|&s| s > 0), "empty fragment: {fragment_sizes:?}");

        // Drift directions are unit tangents at fragment centroids.
        for d in &outcome.drift_directions {
            assert!((d.length() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn performing_twice_replays_identically() {
        let points = fibonacci_sphere(1_000);
        let assignments = vec![0i32; points.len()];
        let event = RiftingEvent {
            plate_id: 0,
            fragment_count: 4,
            plate_area_km2: 5.1e8,
            continental_ratio: 0.4,
            seed: 777,
        };
        let a = perform_rifting(&event, &points, &assignments, 0).unwrap();
        let b = perform_rifting(&event, &points, &assignments, 0).unwrap();
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.fragment_plate_ids, b.fragment_plate_ids);
    }

    #[test]
    fn too_small_a_plate_refuses_to_rift() {
        let points = fibonacci_sphere(10);
        let mut assignments = vec![1i32; points.len()];
        assignments[0] = 0; // plate 0 has a single vertex
        let event = RiftingEvent {
            plate_id: 0,
            fragment_count: 2,
            plate_area_km2: 1.0e5,
            continental_ratio: 0.5,
            seed: 1,
        };
        assert!(perform_rifting(&event, &points, &assignments, 1).is_none());
    }
}
