use std::time::Instant;

use nalgebra::{Matrix3, Matrix6, Rotation3, Vector3, Vector6};
use pcd_register_core::{ensure_positive, Error, PointCloud, Result, RigidTransform};
use pcd_register_features::Features;
use pcd_register_spatial::KdTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::correspondence::{match_features, Correspondence};
use crate::evaluate::evaluate;
use crate::result::{expired, RegistrationResult, RegistrationStatus};

/// Options of fast global registration (Zhou et al., 2016).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FgrParams {
    /// `mu` is divided by this every 4 iterations.
    pub division_factor: f64,
    /// Work in the clouds' own units instead of normalizing them to the unit
    /// ball.
    pub use_absolute_scale: bool,
    pub decrease_mu: bool,
    /// Inlier threshold; also the floor of the `mu` schedule.
    pub maximum_correspondence_distance: f32,
    pub iteration_number: usize,
    /// Edge-length ratio a tuple must stay within, as `[s, 1/s]`.
    pub tuple_scale: f32,
    pub maximum_tuple_count: usize,
    pub tuple_test: bool,
    pub seed: u64,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for FgrParams {
    fn default() -> Self {
        Self {
            division_factor: 1.4,
            use_absolute_scale: false,
            decrease_mu: true,
            maximum_correspondence_distance: 0.025,
            iteration_number: 64,
            tuple_scale: 0.95,
            maximum_tuple_count: 1000,
            tuple_test: true,
            seed: 42,
            deadline: None,
        }
    }
}

impl FgrParams {
    pub fn validate(&self) -> Result<()> {
        ensure_positive(
            "maximum_correspondence_distance",
            self.maximum_correspondence_distance,
        )?;
        if !(self.division_factor > 1.0 && self.division_factor.is_finite()) {
            return Err(Error::invalid(
                "division_factor",
                format!("must be > 1, got {}", self.division_factor),
            ));
        }
        if self.iteration_number == 0 {
            return Err(Error::invalid("iteration_number", "must be >= 1"));
        }
        if !(self.tuple_scale > 0.0 && self.tuple_scale <= 1.0) {
            return Err(Error::invalid(
                "tuple_scale",
                format!("must lie in (0, 1], got {}", self.tuple_scale),
            ));
        }
        if self.maximum_tuple_count == 0 {
            return Err(Error::invalid("maximum_tuple_count", "must be >= 1"));
        }
        Ok(())
    }
}

/// Fast global registration over FPFH matches.
///
/// Mutual descriptor matches (one-way if fewer than 3 survive) are filtered by
/// the tuple test, then handed to the robust optimization of
/// [`registration_fgr_based_on_correspondence`].
pub fn registration_fgr_based_on_feature_matching(
    source: &PointCloud,
    target: &PointCloud,
    source_features: &Features,
    target_features: &Features,
    params: &FgrParams,
) -> Result<RegistrationResult> {
    params.validate()?;
    source_features.ensure_matches(source)?;
    target_features.ensure_matches(target)?;

    let mut correspondences = match_features(source_features, target_features, true);
    if correspondences.len() < 3 {
        warn!(
            mutual = correspondences.len(),
            "too few mutual feature matches, falling back to one-way matches"
        );
        correspondences = match_features(source_features, target_features, false);
    }

    if params.tuple_test {
        let src = source.points();
        let tgt = target.points();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let before = correspondences.len();
        correspondences = tuple_test(&src, &tgt, &correspondences, params, &mut rng);
        debug!(before, after = correspondences.len(), "FGR tuple test");
    }

    registration_fgr_based_on_correspondence(source, target, &correspondences, params)
}

/// Robust alignment of given correspondences by graduated non-convexity over
/// the Geman-McClure kernel.
///
/// Each iteration weights every pair by its line process
/// `(mu / (mu + r^2))^2` and takes one Gauss-Newton step of the weighted
/// problem. `mu` starts at 1 (in normalized units) and is divided by
/// `division_factor` every 4 iterations down to the squared correspondence
/// distance.
pub fn registration_fgr_based_on_correspondence(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    params: &FgrParams,
) -> Result<RegistrationResult> {
    params.validate()?;
    if correspondences
        .iter()
        .any(|c| c.source_index >= source.len() || c.target_index >= target.len())
    {
        return Err(Error::invalid(
            "correspondences",
            "index out of range for the given clouds",
        ));
    }

    if correspondences.len() < 3 {
        warn!(found = correspondences.len(), "not enough correspondences for FGR");
        return Ok(RegistrationResult::identity(
            RegistrationStatus::InsufficientCorrespondences {
                found: correspondences.len(),
                required: 3,
            },
        ));
    }

    let src = source.points();
    let tgt = target.points();
    let frame = NormalizedFrame::new(&src, &tgt, params.use_absolute_scale);

    let q: Vec<Vector3<f64>> = correspondences
        .iter()
        .map(|c| frame.source(&src[c.source_index]))
        .collect();
    let p: Vec<Vector3<f64>> = correspondences
        .iter()
        .map(|c| frame.target(&tgt[c.target_index]))
        .collect();

    let mu_floor = (params.maximum_correspondence_distance as f64 / frame.scale).powi(2);
    let mut mu = 1.0f64;
    let mut rotation = Matrix3::<f64>::identity();
    let mut translation = Vector3::<f64>::zeros();
    let mut iterations = 0usize;
    let mut status = RegistrationStatus::Converged;

    for itr in 0..params.iteration_number {
        if expired(params.deadline) {
            status = RegistrationStatus::Cancelled;
            break;
        }
        if params.decrease_mu && itr % 4 == 0 && mu > mu_floor {
            mu /= params.division_factor;
            debug!(iteration = itr, mu, "FGR mu schedule");
        }

        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        for (pk, qk) in p.iter().zip(&q) {
            let moved = rotation * qk + translation;
            let r = pk - moved;
            let weight = (mu / (r.norm_squared() + mu)).powi(2);

            // Rows of d(p - (R q + t)) / d(omega, t): [q]x and -I.
            let rows = [
                Vector6::new(0.0, -moved.z, moved.y, -1.0, 0.0, 0.0),
                Vector6::new(moved.z, 0.0, -moved.x, 0.0, -1.0, 0.0),
                Vector6::new(-moved.y, moved.x, 0.0, 0.0, 0.0, -1.0),
            ];
            for (j, residual) in rows.iter().zip(r.iter()) {
                jtj += j * j.transpose() * weight;
                jtr += j * (*residual * weight);
            }
        }

        let Some(chol) = jtj.cholesky() else {
            warn!(iteration = itr, "FGR normal equations are singular");
            status = RegistrationStatus::DegenerateGeometry;
            break;
        };
        let step = -chol.solve(&jtr);

        let delta_r = Rotation3::new(Vector3::new(step[0], step[1], step[2])).into_inner();
        rotation = delta_r * rotation;
        translation = delta_r * translation + Vector3::new(step[3], step[4], step[5]);
        iterations = itr + 1;
    }

    let (rotation, translation) = frame.denormalize(&rotation, &translation);
    let transform = RigidTransform::from_nalgebra(&rotation, &translation).orthonormalized();

    let tree = KdTree::from_points(tgt);
    let result = evaluate(&src, &transform, &tree, params.maximum_correspondence_distance)
        .into_result(transform, iterations, status);
    debug!(
        iterations,
        fitness = result.fitness,
        rmse = result.rmse,
        "FGR finished"
    );
    Ok(result)
}

/// Keep random triples of correspondences whose three edges have nearly the
/// same length in both clouds.
fn tuple_test(
    src: &[[f32; 3]],
    tgt: &[[f32; 3]],
    correspondences: &[Correspondence],
    params: &FgrParams,
    rng: &mut StdRng,
) -> Vec<Correspondence> {
    let m = correspondences.len();
    if m < 3 {
        return correspondences.to_vec();
    }

    let scale = params.tuple_scale;
    let mut kept = Vec::new();
    let mut tuples = 0usize;

    for _ in 0..m * 100 {
        if tuples >= params.maximum_tuple_count {
            break;
        }
        let picked = [
            correspondences[rng.gen_range(0..m)],
            correspondences[rng.gen_range(0..m)],
            correspondences[rng.gen_range(0..m)],
        ];
        let consistent = [(0, 1), (1, 2), (2, 0)].iter().all(|&(a, b)| {
            let ls = distance(&src[picked[a].source_index], &src[picked[b].source_index]);
            let lt = distance(&tgt[picked[a].target_index], &tgt[picked[b].target_index]);
            ls * scale < lt && lt < ls / scale
        });
        if consistent {
            kept.extend_from_slice(&picked);
            tuples += 1;
        }
    }
    kept
}

#[inline]
fn distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// Both clouds centred on their own means and divided by one common scale.
struct NormalizedFrame {
    source_mean: Vector3<f64>,
    target_mean: Vector3<f64>,
    scale: f64,
}

impl NormalizedFrame {
    fn new(src: &[[f32; 3]], tgt: &[[f32; 3]], absolute: bool) -> Self {
        let source_mean = mean(src);
        let target_mean = mean(tgt);
        let scale = if absolute {
            1.0
        } else {
            let radius = |pts: &[[f32; 3]], m: &Vector3<f64>| {
                pts.iter()
                    .map(|p| (to_vec(p) - m).norm())
                    .filter(|d| d.is_finite())
                    .fold(0.0f64, f64::max)
            };
            let s = radius(src, &source_mean).max(radius(tgt, &target_mean));
            if s > 0.0 {
                s
            } else {
                1.0
            }
        };
        Self {
            source_mean,
            target_mean,
            scale,
        }
    }

    fn source(&self, p: &[f32; 3]) -> Vector3<f64> {
        (to_vec(p) - self.source_mean) / self.scale
    }

    fn target(&self, p: &[f32; 3]) -> Vector3<f64> {
        (to_vec(p) - self.target_mean) / self.scale
    }

    /// `p = R q + t` in normalized units, expressed in the original ones.
    fn denormalize(&self, r: &Matrix3<f64>, t: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
        let translation = self.target_mean + t * self.scale - r * self.source_mean;
        (*r, translation)
    }
}

fn mean(pts: &[[f32; 3]]) -> Vector3<f64> {
    let mut sum = Vector3::zeros();
    let mut n = 0usize;
    for p in pts.iter().filter(|p| p.iter().all(|v| v.is_finite())) {
        sum += to_vec(p);
        n += 1;
    }
    if n > 0 {
        sum / n as f64
    } else {
        sum
    }
}

#[inline]
fn to_vec(p: &[f32; 3]) -> Vector3<f64> {
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}
