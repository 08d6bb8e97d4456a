//! Spherical Delaunay mesh: canonical triangle sets, backends, adjacency,
//! and triangulation caching.
//!
//! Points are unit vectors with 0-based indices. Every triangulation that
//! leaves this module is canonicalised: outward winding, indices rotated so
//! the minimum leads, the set deduplicated and sorted lexicographically.

pub mod adjacency;
pub mod backend;
pub mod cache;
pub mod shuffle;

use serde::{Deserialize, Serialize};

use crate::sphere::Vec3;

/// An index triple into a point set. Winding is meaningful: the face normal
/// `B × C` points along `A` for outward-facing triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triangle {
    pub v0: u32,
    pub v1: u32,
    pub v2: u32,
}

impl Triangle {
    pub fn new(v0: u32, v1: u32, v2: u32) -> Self {
        Self { v0, v1, v2 }
    }

    /// Sorted (min, mid, max) key identifying the unordered triple.
    pub fn key(&self) -> (u32, u32, u32) {
        let min = self.v0.min(self.v1).min(self.v2);
        let max = self.v0.max(self.v1).max(self.v2);
        let mid = self.v0 + self.v1 + self.v2 - min - max;
        (min, mid, max)
    }

    /// Rotate indices so the minimum leads, preserving the cyclic order
    /// (and therefore the winding).
    pub fn rotate_min_first(&mut self) {
        let values = [self.v0, self.v1, self.v2];
        let mut min_index = 0;
        for i in 1..3 {
            if values[i] < values[min_index] {
                min_index = i;
            }
        }
        self.v0 = values[min_index];
        self.v1 = values[(min_index + 1) % 3];
        self.v2 = values[(min_index + 2) % 3];
    }

    fn is_valid_for(&self, point_count: usize) -> bool {
        let n = point_count as u32;
        self.v0 < n
            && self.v1 < n
            && self.v2 < n
            && self.v0 != self.v1
            && self.v0 != self.v2
            && self.v1 != self.v2
    }
}

/// Swap V1/V2 when the triangle faces inward, so `(B × C)·A > 0`.
fn ensure_outward_winding(points: &[Vec3], tri: &mut Triangle) {
    let a = points[tri.v0 as usize];
    let b = points[tri.v1 as usize];
    let c = points[tri.v2 as usize];
    if b.cross(c).dot(a) < 0.0 {
        std::mem::swap(&mut tri.v1, &mut tri.v2);
    }
}

/// Canonicalise a raw triangle set: drop triangles with invalid or
/// duplicated indices, enforce outward winding, rotate the minimum index
/// first, sort lexicographically, and deduplicate by unordered key.
///
/// Idempotent: canonicalising a canonical set is the identity.
pub fn canonicalize(points: &[Vec3], triangles: Vec<Triangle>) -> Vec<Triangle> {
    let mut valid: Vec<Triangle> = triangles
        .into_iter()
        .filter(|t| t.is_valid_for(points.len()))
        .map(|mut t| {
            ensure_outward_winding(points, &mut t);
            t.rotate_min_first();
            t
        })
        .collect();

    valid.sort_by(|a, b| {
        a.key()
            .cmp(&b.key())
            .then(a.v0.cmp(&b.v0))
            .then(a.v1.cmp(&b.v1))
            .then(a.v2.cmp(&b.v2))
    });
    valid.dedup_by_key(|t| t.key());
    valid
}

/// Count unique undirected edges.
pub fn edge_count(triangles: &[Triangle]) -> usize {
    let mut edges: Vec<(u32, u32)> = Vec::with_capacity(triangles.len() * 3);
    for t in triangles {
        for (a, b) in [(t.v0, t.v1), (t.v1, t.v2), (t.v2, t.v0)] {
            edges.push((a.min(b), a.max(b)));
        }
    }
    edges.sort_unstable();
    edges.dedup();
    edges.len()
}

/// Euler characteristic `V - E + F`; 2 for a valid closed sphere mesh.
pub fn euler_characteristic(point_count: usize, triangles: &[Triangle]) -> i64 {
    point_count as i64 - edge_count(triangles) as i64 + triangles.len() as i64
}

// ── FNV-1a hashing ────────────────────────────────────────────────────────

const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

#[inline]
pub fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Content hash of a point set: the count followed by raw coordinate bits.
pub fn hash_points(points: &[Vec3]) -> u64 {
    let mut hash = fnv1a(FNV_OFFSET, &(points.len() as u32).to_le_bytes());
    for p in points {
        for v in [p.x, p.y, p.z] {
            hash = fnv1a(hash, &v.to_bits().to_le_bytes());
        }
    }
    hash
}

/// Order-independent signature of a triangle set: unordered keys, sorted,
/// then FNV-1a over the index bytes.
pub fn triangle_set_signature(triangles: &[Triangle]) -> u64 {
    let mut keys: Vec<(u32, u32, u32)> = triangles.iter().map(Triangle::key).collect();
    keys.sort_unstable();
    let mut hash = FNV_OFFSET;
    for (a, b, c) in keys {
        for v in [a, b, c] {
            hash = fnv1a(hash, &v.to_le_bytes());
        }
    }
    hash
}
