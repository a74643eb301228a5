use nalgebra::{Matrix3, Vector3, SVD};

use crate::cloud::{Normals, PointCloud};
use crate::error::{Error, Result};

/// A rigid transform `p' = R * p + t`.
///
/// The rotation block is kept orthonormal with determinant +1. Iterative
/// solvers call [`RigidTransform::orthonormalized`] after composing updates so
/// float drift never accumulates into a non-rigid matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0, 0.0, 0.0],
        }
    }

    pub fn from_translation(translation: [f32; 3]) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    pub fn is_identity(&self, eps: f32) -> bool {
        let id = Self::identity();
        for r in 0..3 {
            for c in 0..3 {
                if (self.rotation[r][c] - id.rotation[r][c]).abs() > eps {
                    return false;
                }
            }
        }
        self.translation.iter().all(|t| t.abs() <= eps)
    }

    /// Apply the rigid transform to a single point: R * p + t
    #[inline]
    pub fn apply_to_point(&self, p: &[f32; 3]) -> [f32; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + t[0],
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + t[1],
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2],
        ]
    }

    /// Rotate a direction (normals): R * v
    #[inline]
    pub fn rotate_vector(&self, v: &[f32; 3]) -> [f32; 3] {
        let r = &self.rotation;
        [
            r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
            r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
            r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
        ]
    }

    /// Compose two transforms: apply `self` first, then `other`.
    ///
    /// Result: R_new = other.R * self.R, t_new = other.R * self.t + other.t
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        let (r_self, t_self) = self.to_nalgebra();
        let (r_other, t_other) = other.to_nalgebra();
        Self::from_nalgebra(&(r_other * r_self), &(r_other * t_self + t_other))
    }

    /// Rotation and translation as `f64` nalgebra types.
    pub fn to_nalgebra(&self) -> (Matrix3<f64>, Vector3<f64>) {
        let r = &self.rotation;
        let m = Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        )
        .cast::<f64>();
        let t = Vector3::new(self.translation[0], self.translation[1], self.translation[2])
            .cast::<f64>();
        (m, t)
    }

    pub fn from_nalgebra(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let mut out = [[0.0f32; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = rotation[(r, c)] as f32;
            }
        }
        Self {
            rotation: out,
            translation: [
                translation[0] as f32,
                translation[1] as f32,
                translation[2] as f32,
            ],
        }
    }

    /// Build a transform from a twist `[rx, ry, rz, tx, ty, tz]`: the rotation
    /// is the axis-angle vector `(rx, ry, rz)` (Rodrigues), then the translation
    /// is applied.
    pub fn from_twist(xi: &[f64; 6]) -> Self {
        let (alpha, beta, gamma) = (xi[0], xi[1], xi[2]);
        let angle = (alpha * alpha + beta * beta + gamma * gamma).sqrt();

        let rotation = if angle < 1e-12 {
            Matrix3::new(1.0, -gamma, beta, gamma, 1.0, -alpha, -beta, alpha, 1.0)
        } else {
            let ax = alpha / angle;
            let ay = beta / angle;
            let az = gamma / angle;
            let c = angle.cos();
            let s = angle.sin();
            let t = 1.0 - c;
            Matrix3::new(
                t * ax * ax + c,
                t * ax * ay - s * az,
                t * ax * az + s * ay,
                t * ax * ay + s * az,
                t * ay * ay + c,
                t * ay * az - s * ax,
                t * ax * az - s * ay,
                t * ay * az + s * ax,
                t * az * az + c,
            )
        };

        Self::from_nalgebra(
            &project_to_rotation(&rotation),
            &Vector3::new(xi[3], xi[4], xi[5]),
        )
    }

    /// Re-project the rotation block onto SO(3).
    pub fn orthonormalized(&self) -> RigidTransform {
        let (r, t) = self.to_nalgebra();
        Self::from_nalgebra(&project_to_rotation(&r), &t)
    }

    /// True when `R * R^T ~ I` and `det(R) ~ 1` within `eps`.
    pub fn is_rigid(&self, eps: f32) -> bool {
        let (r, t) = self.to_nalgebra();
        if !r.iter().chain(t.iter()).all(|v| v.is_finite()) {
            return false;
        }
        let eps = eps as f64;
        let gram = r * r.transpose();
        let orthonormal = (gram - Matrix3::identity()).iter().all(|v| v.abs() <= eps);
        orthonormal && (r.determinant() - 1.0).abs() <= eps
    }

    /// Homogeneous 4x4 matrix, row-major.
    pub fn to_matrix4(&self) -> [[f32; 4]; 4] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            [r[0][0], r[0][1], r[0][2], t[0]],
            [r[1][0], r[1][1], r[1][2], t[1]],
            [r[2][0], r[2][1], r[2][2], t[2]],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Parse a row-major homogeneous matrix, rejecting anything that is not a
    /// rigid transform.
    pub fn from_matrix4(m: &[[f32; 4]; 4]) -> Result<Self> {
        let bottom = m[3];
        if bottom[0].abs() > 1e-6
            || bottom[1].abs() > 1e-6
            || bottom[2].abs() > 1e-6
            || (bottom[3] - 1.0).abs() > 1e-6
        {
            return Err(Error::invalid(
                "transformation",
                format!("bottom row must be [0, 0, 0, 1], got {bottom:?}"),
            ));
        }

        let transform = Self {
            rotation: [
                [m[0][0], m[0][1], m[0][2]],
                [m[1][0], m[1][1], m[1][2]],
                [m[2][0], m[2][1], m[2][2]],
            ],
            translation: [m[0][3], m[1][3], m[2][3]],
        };

        if !transform.is_rigid(1e-4) {
            return Err(Error::invalid(
                "transformation",
                "rotation block is not orthonormal with determinant +1",
            ));
        }
        Ok(transform)
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Closest rotation matrix (Frobenius norm) to `m`.
pub(crate) fn project_to_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = SVD::new(*m, true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.set_column(2, &(u.column(2) * -1.0));
        r = u_fixed * v_t;
    }
    r
}

/// Apply a rigid transform to all points in a cloud, returning a new cloud.
///
/// Normals are rotated; colors are carried over unchanged.
pub fn apply_transform(cloud: &PointCloud, transform: &RigidTransform) -> PointCloud {
    let n = cloud.len();
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);

    for p in cloud.iter_points() {
        let tp = transform.apply_to_point(&p);
        x.push(tp[0]);
        y.push(tp[1]);
        z.push(tp[2]);
    }

    let normals = cloud.normals.as_ref().map(|normals| {
        let mut out = Normals::with_capacity(normals.len());
        for i in 0..normals.len() {
            out.push(transform.rotate_vector(&normals.normal(i)));
        }
        out
    });

    PointCloud {
        x,
        y,
        z,
        normals,
        colors: cloud.colors.clone(),
    }
}
