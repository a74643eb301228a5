use crate::error::{Error, Result};
use crate::Aabb;

#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub normals: Option<Normals>,
    pub colors: Option<Colors>,
}

/// Per-point unit normals. A zero vector marks a point whose normal could not
/// be estimated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normals {
    pub nx: Vec<f32>,
    pub ny: Vec<f32>,
    pub nz: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Colors {
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
}

impl Normals {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            nx: Vec::with_capacity(n),
            ny: Vec::with_capacity(n),
            nz: Vec::with_capacity(n),
        }
    }

    pub fn from_vectors(normals: &[[f32; 3]]) -> Self {
        let mut out = Self::with_capacity(normals.len());
        for n in normals {
            out.push(*n);
        }
        out
    }

    pub fn push(&mut self, n: [f32; 3]) {
        self.nx.push(n[0]);
        self.ny.push(n[1]);
        self.nz.push(n[2]);
    }

    pub fn len(&self) -> usize {
        self.nx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nx.is_empty()
    }

    pub fn normal(&self, i: usize) -> [f32; 3] {
        [self.nx[i], self.ny[i], self.nz[i]]
    }

    pub fn set(&mut self, i: usize, n: [f32; 3]) {
        self.nx[i] = n[0];
        self.ny[i] = n[1];
        self.nz[i] = n[2];
    }

    pub fn flip(&mut self, i: usize) {
        self.nx[i] = -self.nx[i];
        self.ny[i] = -self.ny[i];
        self.nz[i] = -self.nz[i];
    }

    /// False for the zero normal of a degenerate point (or a non-finite one).
    pub fn is_valid(&self, i: usize) -> bool {
        let n = self.normal(i);
        let len_sq = n[0] * n[0] + n[1] * n[1] + n[2] * n[2];
        len_sq.is_finite() && len_sq > 0.25
    }

    pub fn to_vectors(&self) -> Vec<[f32; 3]> {
        (0..self.len()).map(|i| self.normal(i)).collect()
    }
}

impl Colors {
    pub fn color(&self, i: usize) -> [u8; 3] {
        [self.r[i], self.g[i], self.b[i]]
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }
}

impl PointCloud {
    pub fn new() -> Self {
        Self {
            x: Vec::new(),
            y: Vec::new(),
            z: Vec::new(),
            normals: None,
            colors: None,
        }
    }

    pub fn from_xyz(x: Vec<f32>, y: Vec<f32>, z: Vec<f32>) -> Self {
        assert_eq!(x.len(), y.len(), "x and y must have same length");
        assert_eq!(x.len(), z.len(), "x and z must have same length");

        Self {
            x,
            y,
            z,
            normals: None,
            colors: None,
        }
    }

    pub fn from_points(points: &[[f32; 3]]) -> Self {
        let mut x = Vec::with_capacity(points.len());
        let mut y = Vec::with_capacity(points.len());
        let mut z = Vec::with_capacity(points.len());
        for p in points {
            x.push(p[0]);
            y.push(p[1]);
            z.push(p[2]);
        }
        Self::from_xyz(x, y, z)
    }

    /// Attach normals, checking they line up with the points.
    pub fn with_normals(mut self, normals: Normals) -> Result<Self> {
        if normals.len() != self.len()
            || normals.ny.len() != self.len()
            || normals.nz.len() != self.len()
        {
            return Err(Error::NormalsMismatch {
                normals_len: normals.len(),
                cloud_len: self.len(),
            });
        }
        self.normals = Some(normals);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.x.len(), self.y.len());
        debug_assert_eq!(self.x.len(), self.z.len());
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_xyz(&self.x, &self.y, &self.z)
    }

    pub fn point(&self, i: usize) -> [f32; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    pub fn iter_points(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.z)
            .map(|((x, y), z)| [*x, *y, *z])
    }

    /// Points as a contiguous array-of-structs copy, for cache-friendly
    /// neighbourhood loops.
    pub fn points(&self) -> Vec<[f32; 3]> {
        self.iter_points().collect()
    }

    /// Normals checked against the point count.
    pub fn checked_normals(&self, role: &'static str) -> Result<&Normals> {
        let normals = self.normals.as_ref().ok_or(Error::MissingNormals(role))?;
        if normals.len() != self.len() {
            return Err(Error::NormalsMismatch {
                normals_len: normals.len(),
                cloud_len: self.len(),
            });
        }
        Ok(normals)
    }
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_is_empty() {
        let cloud = PointCloud::new();
        assert!(cloud.is_empty());
        assert_eq!(cloud.len(), 0);
    }

    #[test]
    fn from_xyz_builds_cloud() {
        let cloud = PointCloud::from_xyz(vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]);
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.point(0), [1.0, 3.0, 5.0]);
        assert_eq!(cloud.point(1), [2.0, 4.0, 6.0]);
    }

    #[test]
    fn from_points_matches_iter_points() {
        let pts = [[1.0, 2.0, 3.0], [-4.0, 5.0, -6.0]];
        let cloud = PointCloud::from_points(&pts);
        assert_eq!(cloud.points(), pts.to_vec());
    }

    #[test]
    fn with_normals_rejects_length_mismatch() {
        let cloud = PointCloud::from_xyz(vec![0.0, 1.0], vec![0.0; 2], vec![0.0; 2]);
        let err = cloud
            .with_normals(Normals {
                nx: vec![0.0],
                ny: vec![0.0],
                nz: vec![1.0],
            })
            .unwrap_err();
        assert_eq!(
            err,
            Error::NormalsMismatch {
                normals_len: 1,
                cloud_len: 2
            }
        );
    }

    #[test]
    fn checked_normals_reports_missing() {
        let cloud = PointCloud::from_xyz(vec![0.0], vec![0.0], vec![0.0]);
        assert_eq!(
            cloud.checked_normals("target").unwrap_err(),
            Error::MissingNormals("target")
        );
    }

    #[test]
    fn zero_normal_is_invalid() {
        let normals = Normals::from_vectors(&[[0.0, 0.0, 1.0], [0.0, 0.0, 0.0], [f32::NAN, 0.0, 0.0]]);
        assert!(normals.is_valid(0));
        assert!(!normals.is_valid(1));
        assert!(!normals.is_valid(2));
    }

    #[test]
    fn aabb_ignores_nan() {
        let cloud = PointCloud::from_xyz(
            vec![0.0, f32::NAN, 2.0],
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
        );
        let aabb = cloud.aabb();
        assert!(aabb.contains(&[0.0, 1.0, 4.0]));
        assert!(aabb.contains(&[2.0, 3.0, 6.0]));
        assert!(!aabb.contains(&[f32::NAN, 2.0, 5.0]));
    }

    #[test]
    #[should_panic]
    fn from_xyz_panics_on_mismatch() {
        let _ = PointCloud::from_xyz(vec![1.0], vec![2.0, 3.0], vec![4.0]);
    }

    proptest! {
        #[test]
        fn aabb_contains_all_finite_points(
            pts in prop::collection::vec((-1000.0f32..1000.0f32, -1000.0f32..1000.0f32, -1000.0f32..1000.0f32), 1..500)
        ) {
            let pts: Vec<[f32; 3]> = pts.into_iter().map(|(x, y, z)| [x, y, z]).collect();
            let cloud = PointCloud::from_points(&pts);
            let aabb = cloud.aabb();
            for p in cloud.iter_points() {
                prop_assert!(aabb.contains(&p));
            }
        }
    }
}
