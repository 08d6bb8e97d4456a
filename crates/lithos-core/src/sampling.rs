//! Fibonacci-lattice point sampling on the unit sphere.
//!
//! The golden-angle spiral places N quasi-uniform points deterministically:
//! `x_k = 1 - (2k+1)/N`, `phi_k = k * pi * (3 - sqrt(5))`.

use crate::sphere::Vec3;

/// `pi * (3 - sqrt(5))`.
const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653_3;

/// Generate `n` unit points on the sphere. Returns an empty vector for
/// `n == 0`.
pub fn fibonacci_sphere(n: usize) -> Vec<Vec3> {
    let mut points = Vec::with_capacity(n);
    let count = n as f64;
    for k in 0..n {
        let kf = k as f64;
        let offset = (kf + 0.5) / count;
        let z = 1.0 - 2.0 * offset;
        let radius = (1.0 - z * z).max(0.0).sqrt();
        let phi = GOLDEN_ANGLE * kf;
        points.push(Vec3::new(phi.cos() * radius, phi.sin() * radius, z).normalize());
    }
    points
}

/// Fibonacci lattice scaled to a sphere of the given radius. A
/// non-positive radius collapses every sample to the origin.
pub fn fibonacci_sphere_scaled(n: usize, radius: f64) -> Vec<Vec3> {
    let mut points = fibonacci_sphere(n);
    if radius <= 0.0 {
        for p in &mut points {
            *p = crate::sphere::ZERO;
        }
    } else {
        for p in &mut points {
            *p = *p * radius;
        }
    }
    points
}

/// Sample count needed so that each sample covers roughly
/// `resolution_km × resolution_km` of surface: `N ≈ 4πR²/res²`.
pub fn sample_count_for_resolution(planet_radius_km: f64, resolution_km: f64) -> usize {
    if planet_radius_km <= 0.0 || resolution_km <= 0.0 {
        return 0;
    }
    let area = 4.0 * std::f64::consts::PI * planet_radius_km * planet_radius_km;
    (area / (resolution_km * resolution_km)).round().max(0.0) as usize
}

/// Inverse of [`sample_count_for_resolution`]: the per-sample resolution in
/// km for a given count.
pub fn resolution_for_sample_count(planet_radius_km: f64, sample_count: usize) -> f64 {
    if planet_radius_km <= 0.0 || sample_count == 0 {
        return 0.0;
    }
    let area = 4.0 * std::f64::consts::PI * planet_radius_km * planet_radius_km;
    (area / sample_count as f64).sqrt()
}
