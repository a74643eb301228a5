use std::time::Instant;

use pcd_register_core::{ensure_positive, Error, PointCloud, Result, RigidTransform};
use pcd_register_features::Features;
use pcd_register_spatial::KdTree;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::correspondence::{match_features, Correspondence};
use crate::evaluate::evaluate;
use crate::kabsch::estimate_from_correspondences;
use crate::result::{expired, RegistrationResult, RegistrationStatus};

/// Hypotheses drawn before each parallel evaluation round.
const BATCH_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Inlier threshold, in the clouds' units.
    pub max_correspondence_distance: f32,
    /// Correspondences per hypothesis.
    pub ransac_n: usize,
    pub max_iterations: usize,
    pub confidence: f64,
    /// Reject a sample unless every pair of its edges has length ratio at
    /// least this value. `None` disables the check.
    pub edge_length_similarity: Option<f32>,
    /// Reject a sample whose own pairs do not align within the threshold.
    pub check_distance: bool,
    pub mutual_filter: bool,
    pub seed: u64,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.075,
            ransac_n: 3,
            max_iterations: 100_000,
            confidence: 0.999,
            edge_length_similarity: Some(0.9),
            check_distance: true,
            mutual_filter: true,
            seed: 42,
            deadline: None,
        }
    }
}

impl RansacParams {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("max_correspondence_distance", self.max_correspondence_distance)?;
        if self.ransac_n < 3 {
            return Err(Error::invalid(
                "ransac_n",
                format!("must be >= 3, got {}", self.ransac_n),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations", "must be >= 1"));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(Error::invalid(
                "confidence",
                format!("must lie in (0, 1), got {}", self.confidence),
            ));
        }
        if let Some(similarity) = self.edge_length_similarity {
            if !(similarity > 0.0 && similarity <= 1.0) {
                return Err(Error::invalid(
                    "edge_length_similarity",
                    format!("must lie in (0, 1], got {similarity}"),
                ));
            }
        }
        Ok(())
    }
}

/// A scored model. Ordering: more inliers, then lower RMSE, then the earlier
/// iteration.
#[derive(Debug, Clone, Copy)]
struct Hypothesis {
    transform: RigidTransform,
    inliers: usize,
    rmse: f32,
    iteration: usize,
}

impl Hypothesis {
    fn beats(&self, other: &Hypothesis) -> bool {
        self.inliers
            .cmp(&other.inliers)
            .then(other.rmse.total_cmp(&self.rmse))
            .then(other.iteration.cmp(&self.iteration))
            .is_gt()
    }
}

fn better(a: Hypothesis, b: Hypothesis) -> Hypothesis {
    if b.beats(&a) {
        b
    } else {
        a
    }
}

/// Global registration by RANSAC over FPFH matches.
///
/// Matches descriptors (mutually if `mutual_filter` is set, falling back to
/// one-way matches when fewer than `3 * ransac_n` mutual pairs exist), then
/// runs [`registration_ransac_based_on_correspondence`].
pub fn registration_ransac_based_on_feature_matching(
    source: &PointCloud,
    target: &PointCloud,
    source_features: &Features,
    target_features: &Features,
    params: &RansacParams,
) -> Result<RegistrationResult> {
    params.validate()?;
    source_features.ensure_matches(source)?;
    target_features.ensure_matches(target)?;

    let mut correspondences = match_features(source_features, target_features, params.mutual_filter);
    if params.mutual_filter && correspondences.len() < 3 * params.ransac_n {
        warn!(
            mutual = correspondences.len(),
            required = 3 * params.ransac_n,
            "too few mutual feature matches, falling back to one-way matches"
        );
        correspondences = match_features(source_features, target_features, false);
    }
    debug!(correspondences = correspondences.len(), "feature matches");

    registration_ransac_based_on_correspondence(source, target, &correspondences, params)
}

/// Global registration by RANSAC over given correspondences.
///
/// # Algorithm
///
/// 1. Draw `ransac_n` distinct correspondences per hypothesis from a seeded
///    `StdRng`, a batch at a time, so the sequence of samples only depends on
///    the seed.
/// 2. Evaluate a batch in parallel: fit with Kabsch, apply the checkers,
///    count inliers over all correspondences.
/// 3. Keep the best hypothesis (pure reduction, deterministic tie-break).
/// 4. Shrink the iteration bound to `ln(1 - confidence) / ln(1 - w^n)`.
/// 5. Refit the winner on its inliers and score it on the clouds.
pub fn registration_ransac_based_on_correspondence(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    params: &RansacParams,
) -> Result<RegistrationResult> {
    params.validate()?;
    if let Some(bad) = correspondences
        .iter()
        .find(|c| c.source_index >= source.len() || c.target_index >= target.len())
    {
        return Err(Error::invalid(
            "correspondences",
            format!(
                "pair ({}, {}) is out of range for clouds of {} and {} points",
                bad.source_index,
                bad.target_index,
                source.len(),
                target.len()
            ),
        ));
    }

    let n = params.ransac_n;
    if correspondences.len() < n {
        warn!(found = correspondences.len(), required = n, "not enough correspondences for RANSAC");
        return Ok(RegistrationResult::identity(
            RegistrationStatus::InsufficientCorrespondences {
                found: correspondences.len(),
                required: n,
            },
        ));
    }

    let src_pts = source.points();
    let tgt_pts = target.points();
    let max_sq = params.max_correspondence_distance * params.max_correspondence_distance;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<Hypothesis> = None;
    let mut bound = params.max_iterations;
    let mut done = 0usize;
    let mut cancelled = false;

    while done < bound {
        if expired(params.deadline) {
            cancelled = true;
            break;
        }

        let batch = BATCH_SIZE.min(bound - done);
        let samples: Vec<(usize, Vec<usize>)> = (done..done + batch)
            .map(|iteration| (iteration, index::sample(&mut rng, correspondences.len(), n).into_vec()))
            .collect();

        let batch_best = samples
            .par_iter()
            .filter_map(|(iteration, sample)| {
                let picked: Vec<Correspondence> = sample.iter().map(|&k| correspondences[k]).collect();
                if let Some(similarity) = params.edge_length_similarity {
                    if !edge_lengths_agree(&src_pts, &tgt_pts, &picked, similarity) {
                        return None;
                    }
                }
                let transform = estimate_from_correspondences(&src_pts, &tgt_pts, &picked).ok()?;
                if params.check_distance
                    && !picked
                        .iter()
                        .all(|c| residual_sq(&src_pts, &tgt_pts, c, &transform) <= max_sq)
                {
                    return None;
                }
                let (inliers, rmse) = score(&src_pts, &tgt_pts, correspondences, &transform, max_sq);
                (inliers > 0).then_some(Hypothesis {
                    transform,
                    inliers,
                    rmse,
                    iteration: *iteration,
                })
            })
            .reduce_with(better);

        done += batch;

        if let Some(candidate) = batch_best {
            let improved = best.map_or(true, |b| candidate.beats(&b));
            let current = best.map_or(candidate, |b| better(b, candidate));
            best = Some(current);
            if improved {
                let w = current.inliers as f64 / correspondences.len() as f64;
                bound = params
                    .max_iterations
                    .min(dynamic_bound(w, n, params.confidence).max(done));
                debug!(
                    iteration = current.iteration,
                    inliers = current.inliers,
                    rmse = current.rmse,
                    bound,
                    "RANSAC best hypothesis updated"
                );
            }
        }
    }

    let Some(winner) = best else {
        let status = if cancelled {
            RegistrationStatus::Cancelled
        } else {
            RegistrationStatus::NonConvergence
        };
        warn!(iterations = done, "RANSAC found no consensus");
        return Ok(RegistrationResult {
            num_iterations: done,
            ..RegistrationResult::identity(status)
        });
    };

    let transform = refit(&src_pts, &tgt_pts, correspondences, winner, max_sq);
    let target_tree = KdTree::from_points(tgt_pts);
    let status = if cancelled {
        RegistrationStatus::Cancelled
    } else {
        RegistrationStatus::Converged
    };
    let result = evaluate(&src_pts, &transform, &target_tree, params.max_correspondence_distance)
        .into_result(transform, done, status);
    debug!(
        iterations = done,
        fitness = result.fitness,
        rmse = result.rmse,
        "RANSAC finished"
    );
    Ok(result)
}

/// Iterations needed to draw an all-inlier sample with probability
/// `confidence` given inlier ratio `w`.
fn dynamic_bound(w: f64, n: usize, confidence: f64) -> usize {
    if w <= 0.0 {
        return usize::MAX;
    }
    let all_inliers = w.powi(n as i32);
    if all_inliers >= 1.0 {
        return 1;
    }
    let k = (1.0 - confidence).ln() / (1.0 - all_inliers).ln();
    if k.is_finite() {
        k.ceil().max(1.0) as usize
    } else {
        usize::MAX
    }
}

/// Refit on all inliers of the winner; keep the refit only if it scores at
/// least as well.
fn refit(
    src: &[[f32; 3]],
    tgt: &[[f32; 3]],
    correspondences: &[Correspondence],
    winner: Hypothesis,
    max_sq: f32,
) -> RigidTransform {
    let inliers: Vec<Correspondence> = correspondences
        .iter()
        .copied()
        .filter(|c| residual_sq(src, tgt, c, &winner.transform) <= max_sq)
        .collect();
    let Ok(refined) = estimate_from_correspondences(src, tgt, &inliers) else {
        return winner.transform;
    };
    let (count, rmse) = score(src, tgt, correspondences, &refined, max_sq);
    if count > winner.inliers || (count == winner.inliers && rmse <= winner.rmse) {
        refined
    } else {
        winner.transform
    }
}

fn score(
    src: &[[f32; 3]],
    tgt: &[[f32; 3]],
    correspondences: &[Correspondence],
    transform: &RigidTransform,
    max_sq: f32,
) -> (usize, f32) {
    let mut count = 0usize;
    let mut sum_sq = 0.0f64;
    for c in correspondences {
        let r = residual_sq(src, tgt, c, transform);
        if r <= max_sq {
            count += 1;
            sum_sq += r as f64;
        }
    }
    let rmse = if count > 0 {
        (sum_sq / count as f64).sqrt() as f32
    } else {
        0.0
    };
    (count, rmse)
}

#[inline]
fn residual_sq(src: &[[f32; 3]], tgt: &[[f32; 3]], c: &Correspondence, transform: &RigidTransform) -> f32 {
    let p = transform.apply_to_point(&src[c.source_index]);
    let q = &tgt[c.target_index];
    (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2) + (p[2] - q[2]).powi(2)
}

/// Rigid motions preserve lengths: every source edge of the sample must be
/// within `similarity` of the matching target edge.
fn edge_lengths_agree(
    src: &[[f32; 3]],
    tgt: &[[f32; 3]],
    sample: &[Correspondence],
    similarity: f32,
) -> bool {
    for a in 0..sample.len() {
        for b in a + 1..sample.len() {
            let ls = distance(&src[sample[a].source_index], &src[sample[b].source_index]);
            let lt = distance(&tgt[sample[a].target_index], &tgt[sample[b].target_index]);
            if ls < similarity * lt || lt < similarity * ls {
                return false;
            }
        }
    }
    true
}

#[inline]
fn distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
