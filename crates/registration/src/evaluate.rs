use pcd_register_core::{ensure_positive, PointCloud, Result, RigidTransform};
use pcd_register_spatial::KdTree;

use crate::correspondence::{nearest_within, Correspondence};
use crate::result::{RegistrationResult, RegistrationStatus};

/// Geometric score of a transform: the inliers, their share of the source
/// points and their RMS distance.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub fitness: f32,
    pub rmse: f32,
    pub inliers: Vec<Correspondence>,
}

impl Evaluation {
    pub fn is_better_than(&self, other: &Evaluation) -> bool {
        self.fitness > other.fitness || (self.fitness == other.fitness && self.rmse < other.rmse)
    }

    pub fn into_result(
        self,
        transform: RigidTransform,
        num_iterations: usize,
        status: RegistrationStatus,
    ) -> RegistrationResult {
        RegistrationResult {
            transform,
            fitness: self.fitness,
            rmse: self.rmse,
            num_iterations,
            status,
        }
    }
}

/// Score `transform` applied to `source` against the target tree.
pub(crate) fn evaluate(
    source: &[[f32; 3]],
    transform: &RigidTransform,
    target_tree: &KdTree,
    max_distance: f32,
) -> Evaluation {
    if source.is_empty() {
        return Evaluation {
            fitness: 0.0,
            rmse: 0.0,
            inliers: Vec::new(),
        };
    }

    let moved: Vec<[f32; 3]> = source.iter().map(|p| transform.apply_to_point(p)).collect();
    let inliers = nearest_within(&moved, target_tree, max_distance);
    Evaluation {
        fitness: inliers.len() as f32 / source.len() as f32,
        rmse: compute_rmse(&inliers),
        inliers,
    }
}

/// Compute the root mean square error from correspondence distances.
pub(crate) fn compute_rmse(correspondences: &[Correspondence]) -> f32 {
    if correspondences.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = correspondences
        .iter()
        .map(|c| (c.distance as f64) * (c.distance as f64))
        .sum();
    (sum_sq / correspondences.len() as f64).sqrt() as f32
}

/// Fitness and inlier RMSE of `transform` without running any solver.
pub fn evaluate_registration(
    source: &PointCloud,
    target: &PointCloud,
    max_distance: f32,
    transform: &RigidTransform,
) -> Result<RegistrationResult> {
    ensure_positive("max_correspondence_distance", max_distance)?;
    let tree = KdTree::build(target);
    Ok(evaluate(&source.points(), transform, &tree, max_distance).into_result(
        *transform,
        0,
        RegistrationStatus::Converged,
    ))
}
