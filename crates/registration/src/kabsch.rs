use nalgebra::{Matrix3, Vector3, SVD};
use pcd_register_core::{Error, Result, RigidTransform};

use crate::correspondence::Correspondence;

/// Ratio below which the second singular value of the cross-covariance counts
/// as zero, i.e. the points are (nearly) collinear.
const COLLINEAR_RATIO: f64 = 1e-8;

/// Least-squares rigid transform mapping `source[i]` onto `target[i]`.
///
/// Kabsch/Umeyama without scale: SVD of the cross-covariance in `f64`, with
/// the reflection case corrected so the rotation has determinant +1.
///
/// # Errors
///
/// - `InvalidParameter` if the slices differ in length.
/// - `InsufficientCorrespondences` for fewer than 3 pairs.
/// - `DegenerateGeometry` when the points coincide or are collinear.
pub fn estimate_rigid_transform(source: &[[f32; 3]], target: &[[f32; 3]]) -> Result<RigidTransform> {
    if source.len() != target.len() {
        return Err(Error::invalid(
            "target",
            format!("{} target points for {} source points", target.len(), source.len()),
        ));
    }
    if source.len() < 3 {
        return Err(Error::InsufficientCorrespondences {
            found: source.len(),
            required: 3,
        });
    }

    let n = source.len() as f64;
    let mut src_centroid = Vector3::<f64>::zeros();
    let mut tgt_centroid = Vector3::<f64>::zeros();
    for (s, t) in source.iter().zip(target) {
        src_centroid += to_vec(s);
        tgt_centroid += to_vec(t);
    }
    src_centroid /= n;
    tgt_centroid /= n;

    // H = sum (s - s_c)(t - t_c)^T
    let mut h = Matrix3::<f64>::zeros();
    for (s, t) in source.iter().zip(target) {
        h += (to_vec(s) - src_centroid) * (to_vec(t) - tgt_centroid).transpose();
    }

    let svd = SVD::new(h, true, true);
    let mut sigma: Vec<f64> = svd.singular_values.iter().copied().collect();
    sigma.sort_by(|a, b| b.total_cmp(a));
    if !(sigma[0] > 1e-18) {
        return Err(Error::DegenerateGeometry(
            "corresponding points coincide".to_string(),
        ));
    }
    if sigma[1] <= COLLINEAR_RATIO * sigma[0] {
        return Err(Error::DegenerateGeometry(
            "corresponding points are collinear".to_string(),
        ));
    }

    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(Error::DegenerateGeometry("SVD did not converge".to_string()));
    };

    // R = V diag(1, 1, d) U^T with d = sign(det(V U^T)).
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
    let rotation = v * correction * u.transpose();
    let translation = tgt_centroid - rotation * src_centroid;

    Ok(RigidTransform::from_nalgebra(&rotation, &translation))
}

/// [`estimate_rigid_transform`] over the point pairs named by
/// `correspondences`.
pub fn estimate_from_correspondences(
    source: &[[f32; 3]],
    target: &[[f32; 3]],
    correspondences: &[Correspondence],
) -> Result<RigidTransform> {
    let (src, tgt): (Vec<[f32; 3]>, Vec<[f32; 3]>) = correspondences
        .iter()
        .map(|c| (source[c.source_index], target[c.target_index]))
        .unzip();
    estimate_rigid_transform(&src, &tgt)
}

#[inline]
fn to_vec(p: &[f32; 3]) -> Vector3<f64> {
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}
