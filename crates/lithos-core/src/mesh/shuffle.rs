//! Deterministic input permutation for the triangulation backends.
//!
//! Some incremental kernels degrade on sorted insertion orders (the
//! Fibonacci lattice is exactly that); a seeded Fisher-Yates shuffle
//! defeats the worst case while keeping results reproducible. Indices are
//! remapped back to the caller's order on the way out.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mesh::Triangle;
use crate::sphere::Vec3;

/// `permutation[j]` is the original index stored at shuffled slot `j`.
pub fn shuffled_permutation(n: usize, seed: u64) -> Vec<u32> {
    let mut permutation: Vec<u32> = (0..n as u32).collect();
    let mut rng = StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
    for i in (1..n).rev() {
        let j = rng.gen_range(0..=i);
        permutation.swap(i, j);
    }
    permutation
}

/// Apply a permutation: `out[j] = points[permutation[j]]`.
pub fn apply_permutation(points: &[Vec3], permutation: &[u32]) -> Vec<Vec3> {
    permutation.iter().map(|&i| points[i as usize]).collect()
}

/// Rewrite shuffled-space triangle indices back to original indices.
pub fn remap_triangles(triangles: &mut [Triangle], permutation: &[u32]) {
    for t in triangles {
        t.v0 = permutation[t.v0 as usize];
        t.v1 = permutation[t.v1 as usize];
        t.v2 = permutation[t.v2 as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::fibonacci_sphere;

    #[test]
    fn permutation_is_a_bijection() {
        let p = shuffled_permutation(1000, 5);
        let mut seen = vec![false; 1000];
        for &i in &p {
            assert!(!seen[i as usize], "index {i} repeated");
            seen[i as usize] = true;
        }
    }

    #[test]
    fn permutation_is_seed_deterministic() {
        assert_eq!(shuffled_permutation(100, 9), shuffled_permutation(100, 9));
        assert_ne!(shuffled_permutation(100, 9), shuffled_permutation(100, 10));
    }

    #[test]
    fn remap_inverts_apply() {
        let points = fibonacci_sphere(50);
        let perm = shuffled_permutation(50, 3);
        let shuffled = apply_permutation(&points, &perm);
        // A triangle over shuffled indices refers to the same geometry
        // after remapping to original indices.
        let mut tris = [Triangle::new(0, 1, 2)];
        let geo_before: Vec<Vec3> = [0usize, 1, 2].iter().map(|&i| shuffled[i]).collect();
        remap_triangles(&mut tris, &perm);
        let geo_after: Vec<Vec3> = [tris[0].v0, tris[0].v1, tris[0].v2]
            .iter()
            .map(|&i| points[i as usize])
            .collect();
        assert_eq!(geo_before, geo_after);
    }
}
