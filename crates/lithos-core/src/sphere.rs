//! Spherical geometry utilities for the plate simulation.
//! All operations on the unit sphere use f64 precision.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// A point or direction in Cartesian coordinates. Simulation points are
/// unit vectors on the sphere; velocities and fold directions live in the
/// tangent plane of their base point.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_latlon(lat_deg: f64, lon_deg: f64) -> Self {
        let lat = lat_deg.to_radians();
        let lon = lon_deg.to_radians();
        Self {
            x: lat.cos() * lon.cos(),
            y: lat.cos() * lon.sin(),
            z: lat.sin(),
        }
    }

    pub fn to_latlon(self) -> (f64, f64) {
        let lat = self.z.clamp(-1.0, 1.0).asin().to_degrees();
        let lon = self.y.atan2(self.x).to_degrees();
        (lat, lon)
    }

    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn length_squared(self) -> f64 {
        self.dot(self)
    }

    pub fn length(self) -> f64 {
        self.length_squared().sqrt()
    }

    pub fn normalize(self) -> Self {
        let len = self.length();
        Self { x: self.x / len, y: self.y / len, z: self.z / len }
    }

    /// Normalize, or return the zero vector when the input is degenerate.
    pub fn normalize_or_zero(self) -> Self {
        let len = self.length();
        if len > 1e-12 {
            Self { x: self.x / len, y: self.y / len, z: self.z / len }
        } else {
            ZERO
        }
    }

    pub fn is_nearly_zero(self) -> bool {
        self.length_squared() < 1e-18
    }

    /// Remove the component along `normal` (a unit vector), leaving the
    /// tangent-plane part.
    pub fn project_to_tangent(self, normal: Self) -> Self {
        self - normal * self.dot(normal)
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Vec3) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// Great-circle (angular) distance between two unit vectors, in radians.
pub fn angular_distance(a: Vec3, b: Vec3) -> f64 {
    a.dot(b).clamp(-1.0, 1.0).acos()
}

/// Rotate `p` around the unit axis by `angle` radians.
///
/// Implemented as the quaternion sandwich q·p·q⁻¹ expanded into vector
/// form; the axis must be unit length.
pub fn rotate_around_axis(p: Vec3, axis: Vec3, angle: f64) -> Vec3 {
    let half = angle * 0.5;
    let (s, w) = (half.sin(), half.cos());
    let q = axis * s;
    // p' = p + 2w(q × p) + 2(q × (q × p))
    let qp = q.cross(p);
    p + qp * (2.0 * w) + q.cross(qp) * 2.0
}

/// A right-handed orthonormal frame in the tangent plane at a sphere point.
/// `e2 = n × e1`, so azimuth angles measured as `atan2(v·e2, v·e1)` advance
/// counter-clockwise around the outward normal.
#[derive(Debug, Clone, Copy)]
pub struct TangentFrame {
    pub n: Vec3,
    pub e1: Vec3,
    pub e2: Vec3,
}

impl TangentFrame {
    /// Build a frame at `p` (unit vector). The reference axis is +Z unless
    /// `p` is nearly polar, then +X. Returns `None` on degenerate input.
    pub fn at(p: Vec3) -> Option<Self> {
        let n = p.normalize_or_zero();
        if n.is_nearly_zero() {
            return None;
        }
        let reference = if n.z.abs() > 0.9 {
            Vec3::new(1.0, 0.0, 0.0)
        } else {
            Vec3::new(0.0, 0.0, 1.0)
        };
        let e1 = reference.cross(n);
        if e1.length_squared() < 1e-30 {
            return None;
        }
        let e1 = e1.normalize();
        let e2 = n.cross(e1);
        Some(Self { n, e1, e2 })
    }

    /// CCW azimuth of `v` around the outward normal, in (-pi, pi].
    pub fn azimuth(&self, v: Vec3) -> f64 {
        v.dot(self.e2).atan2(v.dot(self.e1))
    }
}

/// Any unit tangent at `p`; the choice is deterministic.
pub fn any_tangent(p: Vec3) -> Vec3 {
    let up = if p.z.abs() < 0.9 {
        Vec3::new(0.0, 0.0, 1.0)
    } else {
        Vec3::new(1.0, 0.0, 0.0)
    };
    let t = p.cross(up);
    if t.length_squared() > 1e-24 {
        t.normalize()
    } else {
        Vec3::new(0.0, 1.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latlon_roundtrip() {
        let pairs = [(0.0, 0.0), (45.0, 90.0), (-60.0, -120.0), (89.0, 179.0)];
        for (lat, lon) in pairs {
            let v = Vec3::from_latlon(lat, lon);
            let (lat2, lon2) = v.to_latlon();
            assert!((lat - lat2).abs() < 1e-9, "lat mismatch: {lat} vs {lat2}");
            assert!((lon - lon2).abs() < 1e-9, "lon mismatch: {lon} vs {lon2}");
        }
    }

    #[test]
    fn angular_distance_poles() {
        let n = Vec3::new(0.0, 0.0, 1.0);
        let s = Vec3::new(0.0, 0.0, -1.0);
        let d = angular_distance(n, s);
        assert!((d - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn rotate_quarter_turn_about_z() {
        let p = Vec3::new(1.0, 0.0, 0.0);
        let axis = Vec3::new(0.0, 0.0, 1.0);
        let q = rotate_around_axis(p, axis, std::f64::consts::FRAC_PI_2);
        assert!((q.x).abs() < 1e-12 && (q.y - 1.0).abs() < 1e-12, "got {q:?}");
    }

    #[test]
    fn rotate_preserves_length_and_axis_component() {
        let p = Vec3::from_latlon(37.0, -12.0);
        let axis = Vec3::from_latlon(-20.0, 55.0);
        let q = rotate_around_axis(p, axis, 0.31);
        assert!((q.length() - 1.0).abs() < 1e-12);
        assert!((q.dot(axis) - p.dot(axis)).abs() < 1e-12);
    }

    #[test]
    fn tangent_frame_is_orthonormal() {
        for p in [Vec3::from_latlon(10.0, 20.0), Vec3::from_latlon(88.0, 0.0)] {
            let f = TangentFrame::at(p).unwrap();
            assert!((f.e1.length() - 1.0).abs() < 1e-12);
            assert!((f.e2.length() - 1.0).abs() < 1e-12);
            assert!(f.e1.dot(f.n).abs() < 1e-12);
            assert!(f.e2.dot(f.n).abs() < 1e-12);
            assert!(f.e1.dot(f.e2).abs() < 1e-12);
        }
    }

    #[test]
    fn azimuth_advances_ccw() {
        let f = TangentFrame::at(Vec3::new(0.0, 0.0, 1.0)).unwrap();
        let a1 = f.azimuth(f.e1);
        let a2 = f.azimuth((f.e1 + f.e2).normalize());
        let a3 = f.azimuth(f.e2);
        assert!(a1 < a2 && a2 < a3, "azimuths not monotone: {a1} {a2} {a3}");
    }

    #[test]
    fn project_to_tangent_removes_normal_part() {
        let p = Vec3::from_latlon(33.0, 71.0);
        let v = Vec3::new(0.2, -0.7, 0.4);
        let t = v.project_to_tangent(p);
        assert!(t.dot(p).abs() < 1e-12);
    }

    #[test]
    fn any_tangent_is_unit_and_orthogonal() {
        for p in [Vec3::new(0.0, 0.0, 1.0), Vec3::from_latlon(12.0, -140.0)] {
            let t = any_tangent(p);
            assert!((t.length() - 1.0).abs() < 1e-12);
            assert!(t.dot(p).abs() < 1e-12);
        }
    }
}
