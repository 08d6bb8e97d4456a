//! Erosion pass: continental erosion toward sea level, oceanic dampening
//! toward the trench reference, and sediment accretion in the trench band.
//! Each term can be toggled independently.

use crate::boundary::BoundaryField;
use crate::constants::{
    CONTINENTAL_EROSION_M_PER_MA, MAX_CONTINENTAL_ALTITUDE_M, OCEANIC_DAMPENING_M_PER_MA,
    SEDIMENT_ACCRETION_M_PER_MA, TRENCH_DEPTH_M,
};
use crate::plates::NO_PLATE;

/// Stress decays by this factor each erosion pass.
const STRESS_RELAXATION: f64 = 0.98;

#[derive(Debug, Clone, Copy)]
pub struct ErosionToggles {
    pub continental_erosion: bool,
    pub oceanic_dampening: bool,
    pub trench_accretion: bool,
}

impl Default for ErosionToggles {
    fn default() -> Self {
        Self {
            continental_erosion: true,
            oceanic_dampening: true,
            trench_accretion: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErosionMetrics {
    pub continental_verts_changed: usize,
    pub oceanic_verts_changed: usize,
    pub trench_verts_changed: usize,
    pub erosion_delta_m: f64,
    pub dampening_delta_m: f64,
    pub accretion_delta_m: f64,
}

/// Apply one erosion step in place. Continental erosion is gated on
/// `z > 0`: this term alone never drags land below sea level.
#[allow(clippy::too_many_arguments)]
pub fn apply_erosion(
    plate_ids: &[i32],
    plate_is_continental: &[bool],
    boundary: &BoundaryField,
    trench_band_km: f64,
    toggles: ErosionToggles,
    elevation_m: &mut [f64],
    stress_mpa: &mut [f64],
    dt_ma: f64,
) -> ErosionMetrics {
    let mut metrics = ErosionMetrics::default();
    let zc = MAX_CONTINENTAL_ALTITUDE_M;
    let zt = TRENCH_DEPTH_M;

    for i in 0..elevation_m.len() {
        let pid = plate_ids.get(i).copied().unwrap_or(NO_PLATE);
        let continental = pid != NO_PLATE
            && plate_is_continental.get(pid as usize).copied().unwrap_or(false);

        let mut z = elevation_m[i];

        if toggles.continental_erosion && continental && z > 0.0 {
            let delta = (z / zc) * CONTINENTAL_EROSION_M_PER_MA * dt_ma;
            z -= delta;
            elevation_m[i] = z;
            metrics.erosion_delta_m += delta;
            metrics.continental_verts_changed += 1;
        }

        if toggles.oceanic_dampening && !continental && pid != NO_PLATE {
            // z/zt is positive below sea level; the term pulls toward zt.
            let delta = (1.0 - z / zt) * OCEANIC_DAMPENING_M_PER_MA * dt_ma;
            z -= delta;
            elevation_m[i] = z;
            metrics.dampening_delta_m += delta;
            metrics.oceanic_verts_changed += 1;
        }

        if toggles.trench_accretion {
            let d_km = boundary
                .distance_to_subduction_km
                .get(i)
                .copied()
                .unwrap_or(f64::MAX);
            if d_km <= trench_band_km {
                let delta = SEDIMENT_ACCRETION_M_PER_MA * dt_ma;
                z += delta;
                elevation_m[i] = z;
                metrics.accretion_delta_m += delta;
                metrics.trench_verts_changed += 1;
            }
        }

        if let Some(s) = stress_mpa.get_mut(i) {
            *s *= STRESS_RELAXATION;
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{compute_boundary_fields, DEFAULT_TRANSFORM_EPSILON};
    use crate::config::Backend;
    use crate::constants::TIME_STEP_MA;
    use crate::mesh::adjacency::neighbors;
    use crate::mesh::backend::triangulate_with;
    use crate::sampling::fibonacci_sphere;
    use crate::sphere::Vec3;

    struct World {
        plate_ids: Vec<i32>,
        boundary: crate::boundary::BoundaryField,
        n: usize,
    }

    fn convergent_world(n: usize) -> World {
        let points = fibonacci_sphere(n);
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
        World { plate_ids, boundary, n }
    }

    #[test]
    fn continental_erosion_shrinks_land_without_submerging_it() {
        let world = convergent_world(2_000);
        let flags = vec![true, true];
        let mut elevation = vec![1000.0f64; world.n];
        let mut stress = vec![0.0f64; world.n];
        let toggles = ErosionToggles {
            continental_erosion: true,
            oceanic_dampening: false,
            trench_accretion: false,
        };
        let metrics = apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            0.0,
            toggles,
            &mut elevation,
            &mut stress,
            TIME_STEP_MA,
        );
        assert_eq!(metrics.continental_verts_changed, world.n);
        // z=1000: delta = (1000/10000)*30*2 = 6 m.
        for &z in &elevation {
            assert!((z - 994.0).abs() < 1e-9);
        }

        // Land at sea level is untouched: the z>0 gate holds.
        let mut flat = vec![0.0f64; world.n];
        let m2 = apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            0.0,
            toggles,
            &mut flat,
            &mut stress,
            TIME_STEP_MA,
        );
        assert_eq!(m2.continental_verts_changed, 0);
        assert!(flat.iter().all(|&z| z == 0.0));
    }

    #[test]
    fn oceanic_dampening_pulls_toward_the_trench_reference() {
        let world = convergent_world(2_000);
        let flags = vec![false, false];
        let mut elevation = vec![-6000.0f64; world.n];
        let mut stress = vec![0.0f64; world.n];
        let toggles = ErosionToggles {
            continental_erosion: false,
            oceanic_dampening: true,
            trench_accretion: false,
        };
        apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            0.0,
            toggles,
            &mut elevation,
            &mut stress,
            TIME_STEP_MA,
        );
        // z=-6000, zt=-10000: delta = (1 - 0.6)*40*2 = 32 m downward.
        for &z in &elevation {
            assert!((z - (-6032.0)).abs() < 1e-9);
        }
        // At the trench reference itself the term vanishes.
        let mut at_ref = vec![TRENCH_DEPTH_M; 4];
        let mut s = vec![0.0; 4];
        apply_erosion(
            &[0, 0, 0, 0],
            &[false],
            &world.boundary,
            0.0,
            toggles,
            &mut at_ref,
            &mut s,
            TIME_STEP_MA,
        );
        for &z in &at_ref {
            assert!((z - TRENCH_DEPTH_M).abs() < 1e-9);
        }
    }

    #[test]
    fn trench_accretion_fills_the_band() {
        let world = convergent_world(4_000);
        let flags = vec![false, false];
        let mut elevation = vec![-8000.0f64; world.n];
        let mut stress = vec![0.0f64; world.n];
        let toggles = ErosionToggles {
            continental_erosion: false,
            oceanic_dampening: false,
            trench_accretion: true,
        };
        let metrics = apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            150.0,
            toggles,
            &mut elevation,
            &mut stress,
            TIME_STEP_MA,
        );
        assert!(metrics.trench_verts_changed > 0);
        for (i, &z) in elevation.iter().enumerate() {
            let in_band = world.boundary.distance_to_subduction_km[i] <= 150.0;
            if in_band {
                assert!((z - (-8000.0 + 600.0)).abs() < 1e-9, "band vertex {i}");
            } else {
                assert_eq!(z, -8000.0, "vertex {i} outside the band moved");
            }
        }
    }

    #[test]
    fn identical_inputs_give_bitwise_identical_outputs() {
        let world = convergent_world(3_000);
        let flags = vec![true, false];
        let toggles = ErosionToggles::default();

        let base: Vec<f64> = (0..world.n).map(|i| (i as f64 * 7.3) % 9000.0 - 4000.0).collect();
        let mut run1 = base.clone();
        let mut run2 = base.clone();
        let mut s1 = vec![1.0f64; world.n];
        let mut s2 = vec![1.0f64; world.n];
        apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            150.0,
            toggles,
            &mut run1,
            &mut s1,
            TIME_STEP_MA,
        );
        apply_erosion(
            &world.plate_ids,
            &flags,
            &world.boundary,
            150.0,
            toggles,
            &mut run2,
            &mut s2,
            TIME_STEP_MA,
        );
        for i in 0..world.n {
            assert_eq!(run1[i].to_bits(), run2[i].to_bits(), "vertex {i} diverged");
            assert_eq!(s1[i].to_bits(), s2[i].to_bits());
        }
    }
}
