use pcd_register_core::{Normals, PointCloud, Result};
use pcd_register_spatial::{KdTree, SearchParams};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Normals for every point of a cloud, plus how many points had no usable
/// neighbourhood. Those points carry the zero vector.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEstimate {
    pub normals: Normals,
    pub degenerate: usize,
}

/// Estimate surface normals for each point in the cloud using PCA.
///
/// For each point, the neighbours selected by `search` are found, a covariance
/// matrix is built from their positions, and the eigenvector of the smallest
/// eigenvalue is taken as the surface normal. Normals are oriented to face the
/// origin (viewpoint at `[0, 0, 0]`).
///
/// A point with fewer than 3 neighbours (itself included), a zero covariance
/// or collinear neighbours gets the zero normal and is counted as degenerate.
///
/// The computation is parallelized across points using rayon.
pub fn estimate_normals(cloud: &PointCloud, search: SearchParams) -> Result<NormalEstimate> {
    estimate_normals_with_viewpoint(cloud, search, [0.0, 0.0, 0.0])
}

/// Same as [`estimate_normals`] but orients normals toward the given viewpoint
/// instead of the origin.
pub fn estimate_normals_with_viewpoint(
    cloud: &PointCloud,
    search: SearchParams,
    viewpoint: [f32; 3],
) -> Result<NormalEstimate> {
    search.validate()?;

    if cloud.is_empty() {
        return Ok(NormalEstimate {
            normals: Normals::default(),
            degenerate: 0,
        });
    }

    let points = cloud.points();
    let tree = KdTree::from_points(points.clone());

    let normals_vec: Vec<Option<[f32; 3]>> = points
        .par_iter()
        .map(|point| {
            let (indices, _) = tree.search(point, &search);
            let normal = fit_plane_normal(&points, &indices)?;
            Some(orient_toward(normal, point, &viewpoint))
        })
        .collect();

    let mut normals = Normals::with_capacity(points.len());
    let mut degenerate = 0;
    for normal in normals_vec {
        match normal {
            Some(n) => normals.push(n),
            None => {
                degenerate += 1;
                normals.push([0.0; 3]);
            }
        }
    }

    if degenerate > 0 {
        warn!(
            degenerate,
            total = points.len(),
            "points without a usable neighbourhood got zero normals"
        );
    }
    debug!(points = points.len(), ?search, "estimated normals");

    Ok(NormalEstimate {
        normals,
        degenerate,
    })
}

/// Unit normal of the least-squares plane through `indices`, or `None` when
/// the neighbourhood does not define a plane.
fn fit_plane_normal(points: &[[f32; 3]], indices: &[usize]) -> Option<[f32; 3]> {
    if indices.len() < 3 {
        return None;
    }
    let count = indices.len() as f64;

    let mut c = [0.0f64; 3];
    for &idx in indices {
        for axis in 0..3 {
            c[axis] += points[idx][axis] as f64;
        }
    }
    for v in &mut c {
        *v /= count;
    }

    // Upper triangle of the symmetric covariance.
    let mut cov = [0.0f64; 6];
    for &idx in indices {
        let dx = points[idx][0] as f64 - c[0];
        let dy = points[idx][1] as f64 - c[1];
        let dz = points[idx][2] as f64 - c[2];
        cov[0] += dx * dx;
        cov[1] += dx * dy;
        cov[2] += dx * dz;
        cov[3] += dy * dy;
        cov[4] += dy * dz;
        cov[5] += dz * dz;
    }
    for v in &mut cov {
        *v /= count;
    }

    smallest_eigenvector_3x3(cov)
}

#[inline]
fn orient_toward(mut n: [f32; 3], point: &[f32; 3], viewpoint: &[f32; 3]) -> [f32; 3] {
    let dot = (0..3).map(|a| n[a] * (viewpoint[a] - point[a])).sum::<f32>();
    if dot < 0.0 {
        for v in &mut n {
            *v = -*v;
        }
    }
    n
}

/// Eigenvector of the smallest eigenvalue of the symmetric matrix
///
/// ```text
/// | a[0]  a[1]  a[2] |
/// | a[1]  a[3]  a[4] |
/// | a[2]  a[4]  a[5] |
/// ```
///
/// Eigenvalues come from Cardano's closed form; the eigenvector is the largest
/// cross product of two rows of `A - lambda I`, whose null space it spans.
/// Returns `None` for a (near) zero or isotropic matrix, and when the smallest
/// eigenvalue is repeated (collinear neighbours).
pub(crate) fn smallest_eigenvector_3x3(a: [f64; 6]) -> Option<[f32; 3]> {
    let [a00, a01, a02, a11, a12, a22] = a;
    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if !scale.is_finite() || scale < 1e-30 {
        return None;
    }

    let m = (a00 + a11 + a22) / 3.0;
    let b00 = a00 - m;
    let b11 = a11 - m;
    let b22 = a22 - m;

    let q = (b00 * (b11 * b22 - a12 * a12) - a01 * (a01 * b22 - a12 * a02)
        + a02 * (a01 * a12 - b11 * a02))
        / 2.0;
    let p = ((b00 * b00 + b11 * b11 + b22 * b22 + 2.0 * (a01 * a01 + a02 * a02 + a12 * a12))
        / 6.0)
        .max(0.0);

    if p < 1e-24 * scale * scale {
        return None;
    }

    let sqrt_p = p.sqrt();
    let phi = (q / (p * sqrt_p)).clamp(-1.0, 1.0).acos() / 3.0;
    let lambda = m + 2.0 * sqrt_p * (phi + 2.0 * std::f64::consts::FRAC_PI_3).cos();

    let r0 = [a00 - lambda, a01, a02];
    let r1 = [a01, a11 - lambda, a12];
    let r2 = [a02, a12, a22 - lambda];

    let best = [cross(&r0, &r1), cross(&r0, &r2), cross(&r1, &r2)]
        .into_iter()
        .map(|e| (e[0] * e[0] + e[1] * e[1] + e[2] * e[2], e))
        .max_by(|a, b| a.0.total_cmp(&b.0))?;

    // A repeated smallest eigenvalue leaves `A - lambda I` with rank 1 and
    // every cross product near zero.
    if best.0 < 1e-12 * scale.powi(4) {
        return None;
    }

    let inv = 1.0 / best.0.sqrt();
    let e = best.1;
    Some([(e[0] * inv) as f32, (e[1] * inv) as f32, (e[2] * inv) as f32])
}

#[inline]
fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
