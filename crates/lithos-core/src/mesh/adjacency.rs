//! Voronoi-neighbour adjacency over a canonical triangulation.
//!
//! Two orderings are provided: index-sorted (the default for traversal)
//! and cyclic, where each vertex's neighbours run counter-clockwise around
//! its outward normal. The cyclic ordering is backend-agnostic and
//! deterministic for identical inputs.

use crate::mesh::Triangle;
use crate::sphere::{TangentFrame, Vec3};

const ANGLE_EPSILON: f64 = 1e-12;

/// Unique neighbour sets from triangle incidence, each list sorted by
/// index.
pub fn neighbors(point_count: usize, triangles: &[Triangle]) -> Vec<Vec<u32>> {
    let mut result = vec![Vec::new(); point_count];
    for t in triangles {
        let (a, b, c) = (t.v0 as usize, t.v1 as usize, t.v2 as usize);
        result[a].extend([t.v1, t.v2]);
        result[b].extend([t.v0, t.v2]);
        result[c].extend([t.v0, t.v1]);
    }
    for list in &mut result {
        list.sort_unstable();
        list.dedup();
    }
    result
}

/// Neighbour sets ordered counter-clockwise around each vertex's outward
/// normal. Ties (angles within 1e-12) break by neighbour index; a
/// degenerate tangent frame falls back to index order.
pub fn neighbors_cyclic(points: &[Vec3], triangles: &[Triangle]) -> Vec<Vec<u32>> {
    let mut result = neighbors(points.len(), triangles);
    let mut angles: Vec<(f64, u32)> = Vec::new();

    for (vertex, list) in result.iter_mut().enumerate() {
        if list.len() <= 1 {
            continue;
        }
        let frame = match TangentFrame::at(points[vertex]) {
            Some(f) => f,
            None => continue, // keep index order
        };
        angles.clear();
        angles.extend(
            list.iter()
                .map(|&nb| (frame.azimuth(points[nb as usize]), nb)),
        );
        angles.sort_by(|a, b| {
            if (a.0 - b.0).abs() <= ANGLE_EPSILON {
                a.1.cmp(&b.1)
            } else {
                a.0.total_cmp(&b.0)
            }
        });
        for (slot, &(_, nb)) in angles.iter().enumerate() {
            list[slot] = nb;
        }
    }
    result
}

/// Compressed sparse row view: `offsets` has `n + 1` entries, neighbour
/// indices of vertex `v` live in `adj[offsets[v]..offsets[v + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyCsr {
    pub offsets: Vec<u32>,
    pub adj: Vec<u32>,
}

impl AdjacencyCsr {
    pub fn from_lists(lists: &[Vec<u32>]) -> Self {
        let mut offsets = Vec::with_capacity(lists.len() + 1);
        let mut running = 0u32;
        for list in lists {
            offsets.push(running);
            running += list.len() as u32;
        }
        offsets.push(running);
        let mut adj = Vec::with_capacity(running as usize);
        for list in lists {
            adj.extend_from_slice(list);
        }
        Self { offsets, adj }
    }

    pub fn vertex_count(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn neighbors_of(&self, vertex: usize) -> &[u32] {
        let start = self.offsets[vertex] as usize;
        let end = self.offsets[vertex + 1] as usize;
        &self.adj[start..end]
    }

    pub fn degree(&self, vertex: usize) -> usize {
        (self.offsets[vertex + 1] - self.offsets[vertex]) as usize
    }
}
