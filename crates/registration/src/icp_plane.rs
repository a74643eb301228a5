use nalgebra::{Matrix6, Vector6};
use pcd_register_core::{Error, Normals, Result, RigidTransform};

use crate::correspondence::Correspondence;

/// Solve the linearized point-to-plane minimization for one ICP step.
///
/// Minimizes `sum_i ((R s_i + t - t_i) . n_i)^2` under the small-angle
/// approximation `R ~ I + [a, b, g]x`, which gives the 6x6 system
/// `A^T A x = A^T b` with `x = [a, b, g, tx, ty, tz]`. Pairs whose target
/// normal is degenerate are skipped.
pub(crate) fn solve_point_to_plane(
    source: &[[f32; 3]],
    target: &[[f32; 3]],
    target_normals: &Normals,
    correspondences: &[Correspondence],
) -> Result<RigidTransform> {
    // For each pair (s, t, n):
    //   a = [s x n, n]
    //   b = (t - s) . n
    let mut ata = Matrix6::<f64>::zeros();
    let mut atb = Vector6::<f64>::zeros();
    let mut used = 0usize;

    for c in correspondences {
        if !target_normals.is_valid(c.target_index) {
            continue;
        }
        let [sx, sy, sz] = source[c.source_index].map(f64::from);
        let [tx, ty, tz] = target[c.target_index].map(f64::from);
        let [nx, ny, nz] = target_normals.normal(c.target_index).map(f64::from);

        let a = Vector6::new(
            sy * nz - sz * ny,
            sz * nx - sx * nz,
            sx * ny - sy * nx,
            nx,
            ny,
            nz,
        );
        let b = (tx - sx) * nx + (ty - sy) * ny + (tz - sz) * nz;

        ata += a * a.transpose();
        atb += a * b;
        used += 1;
    }

    if used < 3 {
        return Err(Error::InsufficientCorrespondences {
            found: used,
            required: 3,
        });
    }

    // Tikhonov damping keeps flat or symmetric scenes (unconstrained tangent
    // directions) solvable.
    let diag_max = (0..6).map(|i| ata[(i, i)].abs()).fold(0.0_f64, f64::max);
    let lambda = 1e-6 * diag_max.max(1e-12);
    for i in 0..6 {
        ata[(i, i)] += lambda;
    }

    let x = match ata.cholesky() {
        Some(chol) => chol.solve(&atb),
        None => ata.lu().solve(&atb).ok_or_else(|| {
            Error::DegenerateGeometry("point-to-plane system is singular".to_string())
        })?,
    };
    if !x.iter().all(|v| v.is_finite()) {
        return Err(Error::DegenerateGeometry(
            "point-to-plane step is not finite".to_string(),
        ));
    }

    Ok(RigidTransform::from_twist(&[x[0], x[1], x[2], x[3], x[4], x[5]]))
}
