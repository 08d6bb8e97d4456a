//! Plate boundary field: deterministic edge classification plus
//! multi-source geodesic distance transforms.
//!
//! Edges are enumerated in canonical order (outer loop over the lower
//! vertex, inner loop over its adjacency list) so seed sets and tie-breaks
//! reproduce exactly. The three distance fields share one Dijkstra with
//! different seed sets; the heap orders `(distance, index)`
//! lexicographically to force a total order on ties.

use std::collections::BinaryHeap;

use crate::constants::geodesic_radians_to_km;
use crate::plates::{surface_velocity, NO_PLATE};
use crate::sphere::{angular_distance, Vec3};

/// Default transform classification threshold (km/Ma).
pub const DEFAULT_TRANSFORM_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryClass {
    Convergent,
    Divergent,
    Transform,
    Interior,
}

/// An undirected neighbour edge. Endpoints are oriented so `a` lies on the
/// lower-id ("left") plate for cross-plate edges; vertex ids themselves
/// still satisfy `min < max` at enumeration time.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryEdge {
    pub a: u32,
    pub b: u32,
    pub left_plate: i32,
    pub right_plate: i32,
    pub class: BoundaryClass,
}

/// A convergent edge with its subducting/overriding resolution: the side
/// whose midpoint velocity projects more negatively onto the boundary
/// normal subducts.
#[derive(Debug, Clone, Copy)]
pub struct ConvergentEdge {
    pub a: u32,
    pub b: u32,
    pub subducting_plate: i32,
    pub overriding_plate: i32,
}

#[derive(Debug, Clone, Default)]
pub struct BoundaryMetrics {
    pub num_edges: usize,
    pub num_interior: usize,
    pub num_divergent: usize,
    pub num_convergent: usize,
    pub num_transform: usize,
    pub length_interior_km: f64,
    pub length_divergent_km: f64,
    pub length_convergent_km: f64,
    pub length_transform_km: f64,
}

impl BoundaryMetrics {
    pub fn num_boundary_edges(&self) -> usize {
        self.num_divergent + self.num_convergent + self.num_transform
    }
}

#[derive(Debug, Clone)]
pub struct BoundaryField {
    pub edges: Vec<BoundaryEdge>,
    pub convergent_edges: Vec<ConvergentEdge>,
    /// Geodesic km to the nearest convergent-edge endpoint; `f64::MAX`
    /// when unreachable.
    pub distance_to_subduction_km: Vec<f64>,
    /// Geodesic km to the nearest divergent-edge endpoint.
    pub distance_to_ridge_km: Vec<f64>,
    /// Geodesic km to the nearest cross-plate edge endpoint of any class.
    pub distance_to_boundary_km: Vec<f64>,
    pub metrics: BoundaryMetrics,
}

impl BoundaryField {
    /// Midpoints of all divergent edges, in stored order.
    pub fn ridge_midpoints(&self, points: &[Vec3]) -> Vec<Vec3> {
        self.edges
            .iter()
            .filter(|e| e.class == BoundaryClass::Divergent)
            .map(|e| (points[e.a as usize] + points[e.b as usize]).normalize())
            .collect()
    }
}

fn edge_geometry(a: Vec3, b: Vec3) -> Option<(Vec3, Vec3, Vec3)> {
    let m = (a + b).normalize_or_zero();
    if m.is_nearly_zero() {
        return None;
    }
    let chord = b - a;
    let t = chord.project_to_tangent(m).normalize_or_zero();
    if t.is_nearly_zero() {
        return None;
    }
    let n = m.cross(t).normalize_or_zero();
    if n.is_nearly_zero() {
        return None;
    }
    Some((m, t, n))
}

/// Classify every unique neighbour edge and compute the three distance
/// fields. `omegas` is indexed by plate id; out-of-range plate ids are
/// treated as missing (edge becomes Interior).
pub fn compute_boundary_fields(
    points: &[Vec3],
    neighbors: &[Vec<u32>],
    plate_ids: &[i32],
    omegas: &[Vec3],
    transform_epsilon_km_per_ma: f64,
) -> BoundaryField {
    let n = points.len();
    let mut edges = Vec::new();
    let mut convergent_edges = Vec::new();
    let mut metrics = BoundaryMetrics::default();

    let plate_of = |v: usize| -> i32 {
        let pid = plate_ids.get(v).copied().unwrap_or(NO_PLATE);
        if pid >= 0 && (pid as usize) < omegas.len() {
            pid
        } else {
            NO_PLATE
        }
    };

    for a in 0..n {
        for &b in &neighbors[a] {
            let b = b as usize;
            if b <= a {
                continue;
            }

            let plate_a = plate_of(a);
            let plate_b = plate_of(b);

            // Pin the left side to the lower plate id.
            let (ia, ib, left, right) = if plate_a != NO_PLATE && plate_b != NO_PLATE && plate_a > plate_b
            {
                (b, a, plate_b, plate_a)
            } else {
                (a, b, plate_a, plate_b)
            };

            let pa = points[ia];
            let pb = points[ib];
            let (m, _t, nb) = match edge_geometry(pa, pb) {
                Some(g) => g,
                None => continue, // co-located endpoints, edge dropped
            };
            let len_km = geodesic_radians_to_km(angular_distance(pa, pb));

            let class = if left != NO_PLATE && right != NO_PLATE && left != right {
                let vi = surface_velocity(omegas[left as usize], m);
                let vj = surface_velocity(omegas[right as usize], m);
                let p = (vj - vi).dot(nb);
                if p.abs() <= transform_epsilon_km_per_ma {
                    metrics.num_transform += 1;
                    metrics.length_transform_km += len_km;
                    BoundaryClass::Transform
                } else if p > 0.0 {
                    metrics.num_divergent += 1;
                    metrics.length_divergent_km += len_km;
                    BoundaryClass::Divergent
                } else {
                    let pi = vi.dot(nb);
                    let pj = vj.dot(nb);
                    let (sub, over) = if pj < pi { (right, left) } else { (left, right) };
                    convergent_edges.push(ConvergentEdge {
                        a: ia as u32,
                        b: ib as u32,
                        subducting_plate: sub,
                        overriding_plate: over,
                    });
                    metrics.num_convergent += 1;
                    metrics.length_convergent_km += len_km;
                    BoundaryClass::Convergent
                }
            } else {
                metrics.num_interior += 1;
                metrics.length_interior_km += len_km;
                BoundaryClass::Interior
            };

            edges.push(BoundaryEdge {
                a: ia as u32,
                b: ib as u32,
                left_plate: left,
                right_plate: right,
                class,
            });
            metrics.num_edges += 1;
        }
    }

    // Seed sets, in edge order; Dijkstra tolerates duplicates.
    let mut convergent_seeds = Vec::new();
    let mut divergent_seeds = Vec::new();
    let mut any_boundary_seeds = Vec::new();
    for e in &edges {
        match e.class {
            BoundaryClass::Convergent => {
                convergent_seeds.extend([e.a, e.b]);
                any_boundary_seeds.extend([e.a, e.b]);
            }
            BoundaryClass::Divergent => {
                divergent_seeds.extend([e.a, e.b]);
                any_boundary_seeds.extend([e.a, e.b]);
            }
            BoundaryClass::Transform => {
                any_boundary_seeds.extend([e.a, e.b]);
            }
            BoundaryClass::Interior => {}
        }
    }

    BoundaryField {
        distance_to_subduction_km: multi_source_dijkstra(points, neighbors, &convergent_seeds),
        distance_to_ridge_km: multi_source_dijkstra(points, neighbors, &divergent_seeds),
        distance_to_boundary_km: multi_source_dijkstra(points, neighbors, &any_boundary_seeds),
        edges,
        convergent_edges,
        metrics,
    }
}

// ── Dijkstra ──────────────────────────────────────────────────────────────

struct HeapEntry {
    dist: f64,
    index: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.index == other.index
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the binary max-heap pops the lexicographic minimum
        // of (distance, index) first.
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.index.cmp(&self.index))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Multi-source shortest geodesic distance over the neighbour graph, in
/// km. Unreached vertices (empty seed set or disconnected component) stay
/// at `f64::MAX`.
pub fn multi_source_dijkstra(
    points: &[Vec3],
    neighbors: &[Vec<u32>],
    seeds: &[u32],
) -> Vec<f64> {
    let n = points.len();
    let mut dist = vec![f64::MAX; n];
    let mut heap = BinaryHeap::new();

    for &s in seeds {
        let s = s as usize;
        if s < n && dist[s] > 0.0 {
            dist[s] = 0.0;
            heap.push(HeapEntry { dist: 0.0, index: s as u32 });
        }
    }

    while let Some(entry) = heap.pop() {
        let a = entry.index as usize;
        if entry.dist > dist[a] {
            continue; // stale
        }
        for &b in &neighbors[a] {
            let b = b as usize;
            let w = geodesic_radians_to_km(angular_distance(points[a], points[b]));
            let nd = entry.dist + w;
            if nd < dist[b] {
                dist[b] = nd;
                heap.push(HeapEntry { dist: nd, index: b as u32 });
            }
        }
    }
    dist
}
