use std::time::Instant;

use pcd_register_core::{ensure_positive, Error, PointCloud, Result, RigidTransform};
use pcd_register_spatial::KdTree;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::evaluate::{evaluate, Evaluation};
use crate::icp_plane::solve_point_to_plane;
use crate::kabsch::estimate_from_correspondences;
use crate::result::{expired, RegistrationResult, RegistrationStatus};

/// Which error ICP minimizes in each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EstimationMethod {
    /// Closed-form Kabsch step on point pairs.
    PointToPoint,
    /// Linearized distance to the target tangent planes; needs target normals.
    #[default]
    PointToPlane,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpParams {
    pub max_correspondence_distance: f32,
    pub max_iterations: usize,
    /// Converged once fitness changes by less than this between steps...
    pub relative_fitness: f32,
    /// ...and RMSE by less than this.
    pub relative_rmse: f32,
    /// Consecutive non-improving steps tolerated before giving up.
    pub patience: usize,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.02,
            max_iterations: 30,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            patience: 3,
            deadline: None,
        }
    }
}

impl IcpParams {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("max_correspondence_distance", self.max_correspondence_distance)?;
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations", "must be >= 1"));
        }
        for (name, value) in [
            ("relative_fitness", self.relative_fitness),
            ("relative_rmse", self.relative_rmse),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(Error::invalid(name, format!("must be >= 0, got {value}")));
            }
        }
        Ok(())
    }
}

/// Iterative closest point refinement of `init`.
///
/// Each iteration pairs every transformed source point with its nearest target
/// point within `max_correspondence_distance`, solves for an update with
/// `estimation`, composes it and re-scores. Stops when fitness and RMSE both
/// settle (`Converged`), after `max_iterations` (`MaxIterationsReached`),
/// after more than `patience` consecutive steps that made things worse
/// (`NonConvergence`), or at the deadline (`Cancelled`). Every exit other
/// than `Converged` returns the best estimate seen.
///
/// # Errors
///
/// Invalid parameters, a non-rigid `init`, or missing/mismatched target
/// normals for [`EstimationMethod::PointToPlane`].
pub fn registration_icp(
    source: &PointCloud,
    target: &PointCloud,
    init: &RigidTransform,
    estimation: EstimationMethod,
    params: &IcpParams,
) -> Result<RegistrationResult> {
    params.validate()?;
    let target_normals = match estimation {
        EstimationMethod::PointToPlane => Some(target.checked_normals("target")?),
        EstimationMethod::PointToPoint => None,
    };
    if !init.is_rigid(1e-3) {
        return Err(Error::invalid("init", "not a rigid transform"));
    }

    if source.is_empty() || target.is_empty() {
        return Ok(RegistrationResult::identity(
            RegistrationStatus::InsufficientCorrespondences {
                found: 0,
                required: 3,
            },
        ));
    }

    let src_pts = source.points();
    let tgt_pts = target.points();
    let tree = KdTree::build(target);
    let max_distance = params.max_correspondence_distance;

    let mut transform = *init;
    let mut current = evaluate(&src_pts, &transform, &tree, max_distance);
    let mut best = (transform, current.clone());
    let mut stale = 0usize;
    let mut iterations = 0usize;
    let mut status = RegistrationStatus::MaxIterationsReached;

    for i in 0..params.max_iterations {
        if expired(params.deadline) {
            status = RegistrationStatus::Cancelled;
            break;
        }
        if current.inliers.len() < 3 {
            warn!(found = current.inliers.len(), "ICP ran out of correspondences");
            status = RegistrationStatus::InsufficientCorrespondences {
                found: current.inliers.len(),
                required: 3,
            };
            break;
        }

        let moved: Vec<[f32; 3]> = src_pts.iter().map(|p| transform.apply_to_point(p)).collect();
        let step = match target_normals {
            Some(normals) => solve_point_to_plane(&moved, &tgt_pts, normals, &current.inliers),
            None => estimate_from_correspondences(&moved, &tgt_pts, &current.inliers),
        };
        let step = match step {
            Ok(step) => step,
            Err(Error::InsufficientCorrespondences { found, required }) => {
                status = RegistrationStatus::InsufficientCorrespondences { found, required };
                break;
            }
            Err(err) => {
                warn!(iteration = i, %err, "ICP step failed");
                status = RegistrationStatus::DegenerateGeometry;
                break;
            }
        };

        transform = transform.compose(&step).orthonormalized();
        let next = evaluate(&src_pts, &transform, &tree, max_distance);
        iterations = i + 1;
        debug!(
            iteration = iterations,
            fitness = next.fitness,
            rmse = next.rmse,
            "ICP step"
        );

        let settled = (next.fitness - current.fitness).abs() < params.relative_fitness
            && (next.rmse - current.rmse).abs() < params.relative_rmse;
        if is_worse(&next, &current) {
            stale += 1;
        } else {
            stale = 0;
        }
        if next.is_better_than(&best.1) {
            best = (transform, next.clone());
        }
        current = next;

        if settled {
            status = RegistrationStatus::Converged;
            break;
        }
        if stale > params.patience {
            warn!(
                iterations,
                best_rmse = best.1.rmse,
                "ICP stopped improving, returning best-seen estimate"
            );
            status = RegistrationStatus::NonConvergence;
            break;
        }
    }

    let (transform, evaluation) = match status {
        RegistrationStatus::Converged => (transform, current),
        _ => best,
    };
    Ok(evaluation.into_result(transform, iterations, status))
}

/// Lower fitness, or equal fitness with a higher RMSE.
fn is_worse(next: &Evaluation, previous: &Evaluation) -> bool {
    next.fitness < previous.fitness
        || (next.fitness == previous.fitness && next.rmse > previous.rmse)
}

/// Point-to-point ICP from the identity.
pub fn icp_point_to_point(
    source: &PointCloud,
    target: &PointCloud,
    params: &IcpParams,
) -> Result<RegistrationResult> {
    registration_icp(
        source,
        target,
        &RigidTransform::identity(),
        EstimationMethod::PointToPoint,
        params,
    )
}

/// Point-to-plane ICP from the identity. `target` must carry normals.
pub fn icp_point_to_plane(
    source: &PointCloud,
    target: &PointCloud,
    params: &IcpParams,
) -> Result<RegistrationResult> {
    registration_icp(
        source,
        target,
        &RigidTransform::identity(),
        EstimationMethod::PointToPlane,
        params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pcd_register_core::{apply_transform, Normals};
    use pcd_register_normals::{estimate_normals, orient_normals_consistent_tangent_plane};
    use pcd_register_spatial::SearchParams;
    use proptest::prelude::*;

    fn cube_cloud() -> PointCloud {
        PointCloud::from_xyz(
            vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0],
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
        )
    }

    /// Wavy height field: no symmetry, so every degree of freedom is
    /// observable.
    fn height_field() -> PointCloud {
        let mut pts = Vec::new();
        for i in 0..41 {
            for j in 0..41 {
                let x = -1.0 + i as f32 * 0.05;
                let y = -1.0 + j as f32 * 0.05;
                pts.push([x, y, 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * y]);
            }
        }
        PointCloud::from_points(&pts)
    }

    fn with_normals(cloud: PointCloud) -> PointCloud {
        let mut normals = estimate_normals(&cloud, SearchParams::knn(10)).unwrap().normals;
        orient_normals_consistent_tangent_plane(&cloud, &mut normals, 10).unwrap();
        cloud.with_normals(normals).unwrap()
    }

    fn loose(max_iterations: usize) -> IcpParams {
        IcpParams {
            max_correspondence_distance: 10.0,
            max_iterations,
            ..IcpParams::default()
        }
    }

    #[test]
    fn identity_alignment() {
        let cloud = cube_cloud();
        let result = icp_point_to_point(&cloud, &cloud, &loose(30)).unwrap();

        assert_eq!(result.status, RegistrationStatus::Converged);
        assert!(result.transform.is_identity(1e-4), "{:?}", result.transform);
        assert!(result.rmse < 1e-4, "RMSE = {}", result.rmse);
        assert_relative_eq!(result.fitness, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn exact_init_converges_in_one_iteration() {
        let source = height_field();
        let truth = RigidTransform::from_twist(&[0.3, -0.2, 0.8, 1.0, -0.5, 2.0]);
        let target = with_normals(apply_transform(&source, &truth));

        for estimation in [EstimationMethod::PointToPoint, EstimationMethod::PointToPlane] {
            let result = registration_icp(&source, &target, &truth, estimation, &IcpParams::default())
                .unwrap();
            assert_eq!(result.status, RegistrationStatus::Converged, "{estimation:?}");
            assert_eq!(result.num_iterations, 1, "{estimation:?}");
            assert_relative_eq!(result.fitness, 1.0);
            assert!(result.rmse < 1e-5, "{estimation:?}: RMSE = {}", result.rmse);
        }
    }

    #[test]
    fn known_translation() {
        let source = cube_cloud();
        let target = apply_transform(&source, &RigidTransform::from_translation([0.3, 0.0, 0.0]));
        let result = icp_point_to_point(&source, &target, &loose(100)).unwrap();

        assert_eq!(result.status, RegistrationStatus::Converged);
        assert!(result.rmse < 1e-4, "RMSE = {}", result.rmse);
        let t = result.transform.translation;
        assert_relative_eq!(t[0], 0.3, epsilon = 1e-3);
        assert_relative_eq!(t[1], 0.0, epsilon = 1e-3);
        assert_relative_eq!(t[2], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn point_to_plane_recovers_small_motion() {
        let target = with_normals(height_field());
        let rotation = RigidTransform::from_twist(&[0.0, 0.0, 0.05, 0.02, -0.01, 0.01]);
        let source = apply_transform(&target, &rotation);

        let params = IcpParams {
            max_correspondence_distance: 0.2,
            max_iterations: 100,
            ..IcpParams::default()
        };
        let result = icp_point_to_plane(&source, &target, &params).unwrap();
        assert!(result.rmse < 1e-3, "RMSE = {}", result.rmse);

        let aligned = apply_transform(&source, &result.transform);
        let max_err = (0..target.len())
            .map(|i| {
                let (a, b) = (aligned.point(i), target.point(i));
                ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
            })
            .fold(0.0f32, f32::max);
        assert!(max_err < 0.01, "max point error = {max_err}");
    }

    #[test]
    fn point_to_plane_needs_target_normals() {
        let cloud = cube_cloud();
        assert_eq!(
            icp_point_to_plane(&cloud, &cloud, &loose(10)).unwrap_err(),
            Error::MissingNormals("target")
        );

        let mut bad = cloud.clone();
        bad.normals = Some(Normals::from_vectors(&[[0.0, 0.0, 1.0]]));
        assert!(matches!(
            icp_point_to_plane(&cloud, &bad, &loose(10)),
            Err(Error::NormalsMismatch { .. })
        ));
    }

    #[test]
    fn empty_clouds() {
        let empty = PointCloud::new();
        let cube = cube_cloud();
        for (source, target) in [(&empty, &empty), (&empty, &cube), (&cube, &empty)] {
            let result = icp_point_to_point(source, target, &loose(10)).unwrap();
            assert!(result.transform.is_identity(1e-6));
            assert_eq!(result.num_iterations, 0);
            assert_eq!(result.fitness, 0.0);
            assert!(matches!(
                result.status,
                RegistrationStatus::InsufficientCorrespondences { .. }
            ));
        }
    }

    #[test]
    fn max_correspondence_distance_filters() {
        let source = PointCloud::from_xyz((0..10).map(|i| i as f32).collect(), vec![0.0; 10], vec![0.0; 10]);
        let target =
            PointCloud::from_xyz((0..10).map(|i| i as f32 + 0.1).collect(), vec![0.0; 10], vec![0.0; 10]);

        let tight = icp_point_to_point(
            &source,
            &target,
            &IcpParams {
                max_correspondence_distance: 0.01,
                ..loose(1)
            },
        )
        .unwrap();
        assert_eq!(tight.fitness, 0.0);
        assert!(matches!(
            tight.status,
            RegistrationStatus::InsufficientCorrespondences { found: 0, .. }
        ));

        let wide = icp_point_to_point(&source, &target, &loose(1)).unwrap();
        assert_relative_eq!(wide.fitness, 1.0);
    }

    #[test]
    fn expired_deadline_returns_init() {
        let cloud = cube_cloud();
        let init = RigidTransform::from_translation([0.05, 0.0, 0.0]);
        let params = IcpParams {
            deadline: Some(Instant::now()),
            ..loose(30)
        };
        let result =
            registration_icp(&cloud, &cloud, &init, EstimationMethod::PointToPoint, &params).unwrap();
        assert_eq!(result.status, RegistrationStatus::Cancelled);
        assert_eq!(result.num_iterations, 0);
        assert_eq!(result.transform, init);
    }

    #[test]
    fn rejects_invalid_input() {
        let cloud = cube_cloud();
        assert!(icp_point_to_point(&cloud, &cloud, &loose(0)).is_err());
        assert!(icp_point_to_point(
            &cloud,
            &cloud,
            &IcpParams {
                max_correspondence_distance: -1.0,
                ..IcpParams::default()
            }
        )
        .is_err());

        let mut skewed = RigidTransform::identity();
        skewed.rotation[0][0] = 2.0;
        assert!(matches!(
            registration_icp(&cloud, &cloud, &skewed, EstimationMethod::PointToPoint, &loose(5)),
            Err(Error::InvalidParameter { name: "init", .. })
        ));
    }

    /// A 3x3x3 grid shifted by 0.2 along x, plus one lone pair 0.45 apart
    /// whose residual points the other way. The first step pulls the lone
    /// source point out of the 0.5 threshold, so fitness drops.
    fn losing_pair() -> (PointCloud, PointCloud) {
        let mut target = Vec::new();
        for i in -1..=1 {
            for j in -1..=1 {
                for k in -1..=1 {
                    target.push([i as f32, j as f32, k as f32]);
                }
            }
        }
        let mut source: Vec<[f32; 3]> = target.iter().map(|p| [p[0] + 0.2, p[1], p[2]]).collect();
        target.push([3.0, 0.0, 0.0]);
        source.push([2.55, 0.0, 0.0]);
        (PointCloud::from_points(&source), PointCloud::from_points(&target))
    }

    #[test]
    fn worsening_step_ends_in_non_convergence_with_best_estimate() {
        let (source, target) = losing_pair();
        let params = IcpParams {
            max_correspondence_distance: 0.5,
            patience: 0,
            ..IcpParams::default()
        };
        let before = crate::evaluate_registration(&source, &target, 0.5, &RigidTransform::identity())
            .unwrap();
        assert_relative_eq!(before.fitness, 1.0);

        let result = icp_point_to_point(&source, &target, &params).unwrap();
        assert_eq!(result.status, RegistrationStatus::NonConvergence);
        assert_eq!(result.num_iterations, 1);
        assert!(result.transform.is_identity(1e-6), "{:?}", result.transform);
        assert_relative_eq!(result.fitness, before.fitness);
        assert_relative_eq!(result.rmse, before.rmse, epsilon = 1e-6);
        assert!(result.ensure_converged().is_err());
    }

    #[test]
    fn max_iterations_returns_best_estimate() {
        let (source, target) = losing_pair();
        let params = IcpParams {
            max_correspondence_distance: 0.5,
            max_iterations: 1,
            ..IcpParams::default()
        };
        let result = icp_point_to_point(&source, &target, &params).unwrap();
        assert_eq!(result.status, RegistrationStatus::MaxIterationsReached);
        assert!(result.transform.is_identity(1e-6), "{:?}", result.transform);
        assert_relative_eq!(result.fitness, 1.0);
    }

    #[test]
    fn worse_means_lower_fitness_or_higher_rmse() {
        let eval = |fitness, rmse| Evaluation {
            fitness,
            rmse,
            inliers: Vec::new(),
        };
        assert!(is_worse(&eval(0.8, 0.1), &eval(0.9, 0.5)));
        assert!(is_worse(&eval(0.9, 0.2), &eval(0.9, 0.1)));
        assert!(!is_worse(&eval(0.9, 0.1), &eval(0.9, 0.1)));
        assert!(!is_worse(&eval(1.0, 0.9), &eval(0.9, 0.1)));
    }

    proptest! {
        #[test]
        fn returned_transforms_are_rigid(
            pts in prop::collection::vec(prop::array::uniform3(-10.0f32..10.0), 4..50),
            twist in prop::array::uniform6(-0.1f64..0.1),
        ) {
            let source = PointCloud::from_points(&pts);
            let target = apply_transform(&source, &RigidTransform::from_twist(&twist));
            let result = icp_point_to_point(&source, &target, &loose(30)).unwrap();
            prop_assert!(result.transform.is_rigid(1e-4));
            prop_assert!(result.fitness <= 1.0);
        }
    }
}
