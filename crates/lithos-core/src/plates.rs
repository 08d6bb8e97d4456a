//! Plate records, Euler-pole kinematics, and vertex→plate assignment.
//!
//! Plates are stored in a flat table indexed by id; ids are assigned
//! monotonically and never reused (rifting appends fragments, merging is
//! not supported). Per-vertex assignment is a parallel `i32` array with
//! `NO_PLATE` as the missing sentinel.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::{MAX_PLATE_SPEED_KM_PER_MA, PLANET_RADIUS_KM};
use crate::sphere::{angular_distance, rotate_around_axis, Vec3, ZERO};

/// Sentinel for vertices without a plate.
pub const NO_PLATE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrustKind {
    Oceanic,
    Continental,
}

#[derive(Debug, Clone)]
pub struct Plate {
    pub id: i32,
    /// Euler pole, unit vector.
    pub euler_axis: Vec3,
    pub angular_speed_rad_per_ma: f64,
    pub centroid: Vec3,
    pub crust: CrustKind,
    /// Fraction of the plate carrying continental crust, in [0, 1].
    pub continental_ratio: f64,
}

impl Plate {
    /// Angular-velocity vector Ω = axis · ω (rad/Ma).
    pub fn omega(&self) -> Vec3 {
        self.euler_axis * self.angular_speed_rad_per_ma
    }
}

/// Surface velocity of a plate point: `v = (Ω × p)·R` in km/Ma.
pub fn surface_velocity(omega: Vec3, p: Vec3) -> Vec3 {
    omega.cross(p) * PLANET_RADIUS_KM
}

/// Voronoi-style area estimate: each of the N samples covers an equal
/// share of the sphere.
pub fn plate_area_km2(vertex_count: usize, total_vertices: usize) -> f64 {
    if total_vertices == 0 {
        return 0.0;
    }
    let sphere = 4.0 * std::f64::consts::PI * PLANET_RADIUS_KM * PLANET_RADIUS_KM;
    sphere * vertex_count as f64 / total_vertices as f64
}

/// The plate table plus per-vertex assignment.
#[derive(Debug, Clone)]
pub struct PlateSet {
    pub plates: Vec<Plate>,
    pub assignments: Vec<i32>,
}

impl PlateSet {
    /// Seed `plate_count` plates deterministically: seed vertices drawn
    /// from the RNG, assignment by geodesic Voronoi, axes and speeds
    /// bounded by the plate speed cap, crust kind drawn against
    /// `continental_fraction`.
    pub fn seed(
        points: &[Vec3],
        plate_count: usize,
        continental_fraction: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x1B87_3592_C4D6_7A0F);
        let plate_count = plate_count.max(1).min(points.len().max(1));

        let mut seed_vertices: Vec<usize> = Vec::with_capacity(plate_count);
        while seed_vertices.len() < plate_count {
            let candidate = rng.gen_range(0..points.len());
            if !seed_vertices.contains(&candidate) {
                seed_vertices.push(candidate);
            }
        }

        let max_angular = MAX_PLATE_SPEED_KM_PER_MA / PLANET_RADIUS_KM;
        let mut plates = Vec::with_capacity(plate_count);
        for (id, &sv) in seed_vertices.iter().enumerate() {
            let axis = random_unit(&mut rng);
            let speed = rng.gen_range(0.2..=1.0) * max_angular;
            let continental = rng.gen_range(0.0..1.0) < continental_fraction;
            let (crust, ratio) = if continental {
                (CrustKind::Continental, rng.gen_range(0.5..=1.0))
            } else {
                (CrustKind::Oceanic, rng.gen_range(0.0..=0.25))
            };
            plates.push(Plate {
                id: id as i32,
                euler_axis: axis,
                angular_speed_rad_per_ma: speed,
                centroid: points[sv],
                crust,
                continental_ratio: ratio,
            });
        }

        let seeds: Vec<Vec3> = seed_vertices.iter().map(|&i| points[i]).collect();
        let assignments = assign_by_nearest_seed(points, &seeds);

        let mut set = Self { plates, assignments };
        set.update_centroids(points);
        set
    }

    pub fn plate(&self, id: i32) -> Option<&Plate> {
        if id < 0 {
            return None;
        }
        self.plates.get(id as usize)
    }

    /// Per-plate Ω vectors in id order (for boundary classification).
    pub fn omegas(&self) -> Vec<Vec3> {
        self.plates.iter().map(Plate::omega).collect()
    }

    /// Per-plate crust flags in id order; `true` means continental.
    pub fn continental_flags(&self) -> Vec<bool> {
        self.plates
            .iter()
            .map(|p| p.crust == CrustKind::Continental)
            .collect()
    }

    pub fn vertex_count_of(&self, id: i32) -> usize {
        self.assignments.iter().filter(|&&a| a == id).count()
    }

    /// Advect every vertex with its plate's rotation over `dt`.
    pub fn rotate_points(&self, points: &mut [Vec3], dt_ma: f64) {
        for (p, &pid) in points.iter_mut().zip(&self.assignments) {
            if let Some(plate) = self.plate(pid) {
                *p = rotate_around_axis(
                    *p,
                    plate.euler_axis,
                    plate.angular_speed_rad_per_ma * dt_ma,
                )
                .normalize();
            }
        }
    }

    /// Renormalised mean of each plate's vertices. Plates that lost all
    /// vertices keep their previous centroid.
    pub fn update_centroids(&mut self, points: &[Vec3]) {
        let mut sums = vec![ZERO; self.plates.len()];
        let mut counts = vec![0usize; self.plates.len()];
        for (p, &pid) in points.iter().zip(&self.assignments) {
            if pid >= 0 && (pid as usize) < sums.len() {
                sums[pid as usize] += *p;
                counts[pid as usize] += 1;
            }
        }
        for (plate, (sum, count)) in self.plates.iter_mut().zip(sums.into_iter().zip(counts)) {
            if count > 0 {
                let c = sum.normalize_or_zero();
                if !c.is_nearly_zero() {
                    plate.centroid = c;
                }
            }
        }
    }

    /// Apply per-plate angular-velocity deltas (slab pull reaction). The
    /// axis/speed pair is refit from the combined Ω vector.
    pub fn apply_omega_deltas(&mut self, deltas: &[Vec3]) {
        for (plate, delta) in self.plates.iter_mut().zip(deltas) {
            if delta.is_nearly_zero() {
                continue;
            }
            let omega = plate.omega() + *delta;
            let speed = omega.length();
            if speed > 1e-15 {
                plate.euler_axis = omega * (1.0 / speed);
                plate.angular_speed_rad_per_ma = speed;
            }
        }
    }
}

/// Nearest-seed geodesic Voronoi assignment; ties resolve to the lower
/// seed index.
pub fn assign_by_nearest_seed(points: &[Vec3], seeds: &[Vec3]) -> Vec<i32> {
    points
        .iter()
        .map(|&p| {
            let mut best = NO_PLATE;
            let mut best_angle = f64::MAX;
            for (k, &s) in seeds.iter().enumerate() {
                let ang = angular_distance(p, s);
                if ang < best_angle {
                    best_angle = ang;
                    best = k as i32;
                }
            }
            best
        })
        .collect()
}

fn random_unit(rng: &mut StdRng) -> Vec3 {
    let z: f64 = rng.gen_range(-1.0..=1.0);
    let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * theta.cos(), r * theta.sin(), z)
}
