//! Spherical triangulation backends.
//!
//! Two kernels produce the raw triangle soup:
//!
//! * `hull`: stereographic projection through sample 0 followed by a
//!   robust planar Delaunay (delaunator), plus a fan over the projected
//!   hull that closes the cap around the projection point. For points on
//!   the unit sphere this equals the 3-D convex hull, i.e. the spherical
//!   Delaunay triangulation.
//! * `wheel`: an incremental 3-D convex hull (insertion with horizon
//!   re-triangulation), kept as the reference kernel and fallback.
//!
//! Raw output is canonicalised and Euler-checked before anything
//! downstream sees it; a failed check triggers one attempt on the
//! alternate backend before the whole operation fails.

use delaunator::Point;
use log::warn;

use crate::config::Backend;
use crate::error::{LithosError, Result};
use crate::mesh::{canonicalize, euler_characteristic, Triangle};
use crate::sphere::{TangentFrame, Vec3};

pub trait SphericalTriangulator {
    fn name(&self) -> &'static str;
    /// Produce a raw (not yet canonical) triangle soup over the points.
    fn triangulate(&self, points: &[Vec3]) -> Result<Vec<Triangle>>;
}

/// Canonical, verified triangulation plus provenance.
#[derive(Debug, Clone)]
pub struct TriangulationResult {
    pub triangles: Vec<Triangle>,
    pub backend_name: &'static str,
    pub used_fallback: bool,
}

// ── hull: stereographic + planar Delaunay ─────────────────────────────────

pub struct HullBackend;

impl SphericalTriangulator for HullBackend {
    fn name(&self) -> &'static str {
        "hull"
    }

    fn triangulate(&self, points: &[Vec3]) -> Result<Vec<Triangle>> {
        if points.len() < 4 {
            return Err(LithosError::BackendFailure(format!(
                "hull needs at least 4 points, got {}",
                points.len()
            )));
        }

        let pivot = points[0];
        let frame = TangentFrame::at(pivot).ok_or_else(|| {
            LithosError::BackendFailure("degenerate projection pivot".into())
        })?;

        // Stereographic projection from the pivot onto its tangent plane:
        // q -> (x, y) / (1 - z) in the pivot frame. The pivot itself is the
        // projection centre and is excluded; it is stitched back below.
        let mut planar = Vec::with_capacity(points.len() - 1);
        let mut original_index = Vec::with_capacity(points.len() - 1);
        for (i, &p) in points.iter().enumerate().skip(1) {
            let z = p.dot(frame.n);
            let denom = 1.0 - z;
            if denom < 1e-15 {
                // Coincident with the pivot; a duplicate sample cannot be
                // part of a valid triangulation.
                return Err(LithosError::BackendFailure(format!(
                    "point {i} coincides with the projection pivot"
                )));
            }
            planar.push(Point {
                x: p.dot(frame.e1) / denom,
                y: p.dot(frame.e2) / denom,
            });
            original_index.push(i as u32);
        }

        let planar_tri = delaunator::triangulate(&planar);
        if planar_tri.triangles.is_empty() {
            return Err(LithosError::BackendFailure(
                "planar Delaunay produced no triangles".into(),
            ));
        }

        let mut triangles: Vec<Triangle> = planar_tri
            .triangles
            .chunks_exact(3)
            .map(|c| {
                Triangle::new(
                    original_index[c[0]],
                    original_index[c[1]],
                    original_index[c[2]],
                )
            })
            .collect();

        // The spherical cap around the pivot maps to the outside of the
        // planar hull; fanning the pivot across consecutive hull vertices
        // closes it. Winding is normalised during canonicalisation.
        let hull = &planar_tri.hull;
        for w in 0..hull.len() {
            let a = original_index[hull[w]];
            let b = original_index[hull[(w + 1) % hull.len()]];
            triangles.push(Triangle::new(0, a, b));
        }

        Ok(triangles)
    }
}

// ── wheel: incremental 3-D convex hull ────────────────────────────────────

pub struct WheelBackend;

#[derive(Clone, Copy)]
struct Face {
    a: u32,
    b: u32,
    c: u32,
    alive: bool,
}

const PLANE_EPSILON: f64 = 1e-12;

fn face_sees(points: &[Vec3], face: &Face, p: Vec3) -> bool {
    let a = points[face.a as usize];
    let b = points[face.b as usize];
    let c = points[face.c as usize];
    (b - a).cross(c - a).dot(p - a) > PLANE_EPSILON
}

impl SphericalTriangulator for WheelBackend {
    fn name(&self) -> &'static str {
        "wheel"
    }

    fn triangulate(&self, points: &[Vec3]) -> Result<Vec<Triangle>> {
        let n = points.len();
        if n < 4 {
            return Err(LithosError::BackendFailure(format!(
                "wheel needs at least 4 points, got {n}"
            )));
        }

        // Initial simplex: a point, the farthest from it, the farthest
        // from that line, the farthest from that plane.
        let i0 = 0usize;
        let mut i1 = 1;
        let mut best = -1.0;
        for i in 1..n {
            let d = (points[i] - points[i0]).length_squared();
            if d > best {
                best = d;
                i1 = i;
            }
        }
        let mut i2 = usize::MAX;
        best = PLANE_EPSILON;
        let edge = points[i1] - points[i0];
        for i in 1..n {
            if i == i1 {
                continue;
            }
            let d = edge.cross(points[i] - points[i0]).length_squared();
            if d > best {
                best = d;
                i2 = i;
            }
        }
        if i2 == usize::MAX {
            return Err(LithosError::BackendFailure("all points are collinear".into()));
        }
        let plane_n = edge.cross(points[i2] - points[i0]);
        let mut i3 = usize::MAX;
        best = PLANE_EPSILON;
        for i in 1..n {
            if i == i1 || i == i2 {
                continue;
            }
            let d = plane_n.dot(points[i] - points[i0]).abs();
            if d > best {
                best = d;
                i3 = i;
            }
        }
        if i3 == usize::MAX {
            return Err(LithosError::BackendFailure("all points are coplanar".into()));
        }

        let (i0, i1, i2, i3) = (i0 as u32, i1 as u32, i2 as u32, i3 as u32);
        let interior = (points[i0 as usize]
            + points[i1 as usize]
            + points[i2 as usize]
            + points[i3 as usize])
            * 0.25;

        let mut faces: Vec<Face> = [
            (i0, i1, i2),
            (i0, i1, i3),
            (i0, i2, i3),
            (i1, i2, i3),
        ]
        .iter()
        .map(|&(a, b, c)| {
            let mut f = Face { a, b, c, alive: true };
            // Orient outward relative to the simplex interior.
            if face_sees(points, &f, interior) {
                std::mem::swap(&mut f.b, &mut f.c);
            }
            f
        })
        .collect();

        let seeded = [i0, i1, i2, i3];
        for (idx, &p) in points.iter().enumerate() {
            let idx = idx as u32;
            if seeded.contains(&idx) {
                continue;
            }

            let visible: Vec<usize> = faces
                .iter()
                .enumerate()
                .filter(|(_, f)| f.alive && face_sees(points, f, p))
                .map(|(fi, _)| fi)
                .collect();
            if visible.is_empty() {
                // Inside the current hull; cannot happen for distinct
                // points on the sphere, tolerated for degenerate input.
                continue;
            }

            // Horizon: directed edges of visible faces whose reverse is
            // not an edge of any visible face.
            let mut directed: Vec<(u32, u32)> = Vec::with_capacity(visible.len() * 3);
            for &fi in &visible {
                let f = &faces[fi];
                directed.push((f.a, f.b));
                directed.push((f.b, f.c));
                directed.push((f.c, f.a));
            }
            let mut horizon: Vec<(u32, u32)> = Vec::new();
            for &(u, v) in &directed {
                if !directed.contains(&(v, u)) {
                    horizon.push((u, v));
                }
            }

            for &fi in &visible {
                faces[fi].alive = false;
            }
            for (u, v) in horizon {
                faces.push(Face { a: u, b: v, c: idx, alive: true });
            }
        }

        let triangles: Vec<Triangle> = faces
            .into_iter()
            .filter(|f| f.alive)
            .map(|f| Triangle::new(f.a, f.b, f.c))
            .collect();
        if triangles.is_empty() {
            return Err(LithosError::BackendFailure("hull collapsed to nothing".into()));
        }
        Ok(triangles)
    }
}

// ── Resolution and verification ───────────────────────────────────────────

fn backend_for(backend: Backend) -> &'static dyn SphericalTriangulator {
    match backend {
        Backend::Auto | Backend::Hull => &HullBackend,
        Backend::Wheel => &WheelBackend,
    }
}

fn alternate_for(backend: Backend) -> &'static dyn SphericalTriangulator {
    match backend {
        Backend::Auto | Backend::Hull => &WheelBackend,
        Backend::Wheel => &HullBackend,
    }
}

fn run_and_verify(
    kernel: &dyn SphericalTriangulator,
    points: &[Vec3],
) -> Result<Vec<Triangle>> {
    let raw = kernel.triangulate(points)?;
    let tris = canonicalize(points, raw);
    let euler = euler_characteristic(points.len(), &tris);
    if euler != 2 {
        return Err(LithosError::BackendFailure(format!(
            "{} topology failed the Euler check (V-E+F = {euler}, expected 2)",
            kernel.name()
        )));
    }
    Ok(tris)
}

/// Triangulate with the requested backend, falling back to the alternate
/// kernel (with a logged warning) when the first attempt fails its checks.
pub fn triangulate_with(backend: Backend, points: &[Vec3]) -> Result<TriangulationResult> {
    let primary = backend_for(backend);
    match run_and_verify(primary, points) {
        Ok(triangles) => Ok(TriangulationResult {
            triangles,
            backend_name: primary.name(),
            used_fallback: false,
        }),
        Err(primary_err) => {
            let fallback = alternate_for(backend);
            warn!(
                "triangulation backend fallback: requested={} using={} cause={}",
                primary.name(),
                fallback.name(),
                primary_err
            );
            let triangles = run_and_verify(fallback, points).map_err(|fallback_err| {
                LithosError::BackendFailure(format!(
                    "both backends failed: {} ({primary_err}), {} ({fallback_err})",
                    primary.name(),
                    fallback.name()
                ))
            })?;
            Ok(TriangulationResult {
                triangles,
                backend_name: fallback.name(),
                used_fallback: true,
            })
        }
    }
}
