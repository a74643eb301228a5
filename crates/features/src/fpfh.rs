use std::f32::consts::PI;

use pcd_register_core::{Error, PointCloud, Result};
use pcd_register_spatial::{KdTree, SearchParams};
use rayon::prelude::*;
use tracing::debug;

/// Length of an FPFH descriptor: three angular features, 11 bins each.
pub const FPFH_DIM: usize = 33;
const BINS: usize = 11;

/// One FPFH descriptor per point, aligned by index with the cloud it was
/// computed from. An all-zero descriptor marks a point that takes no part in
/// matching.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Features {
    data: Vec<[f32; FPFH_DIM]>,
}

impl Features {
    pub fn new(data: Vec<[f32; FPFH_DIM]>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn descriptor(&self, i: usize) -> &[f32; FPFH_DIM] {
        &self.data[i]
    }

    pub fn is_valid(&self, i: usize) -> bool {
        let d = &self.data[i];
        d.iter().all(|v| v.is_finite()) && d.iter().any(|&v| v != 0.0)
    }

    pub fn valid_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_valid(i)).collect()
    }

    /// KdTree over the valid descriptors; indices refer to points.
    pub fn tree(&self) -> KdTree<FPFH_DIM> {
        KdTree::from_subset(self.data.clone(), self.valid_indices())
    }

    /// Fails with `FeatureMismatch` unless there is one descriptor per point.
    pub fn ensure_matches(&self, cloud: &PointCloud) -> Result<()> {
        if self.len() != cloud.len() {
            return Err(Error::FeatureMismatch {
                features_len: self.len(),
                cloud_len: cloud.len(),
            });
        }
        Ok(())
    }
}

/// Compute Fast Point Feature Histograms for every point of `cloud`.
///
/// The cloud must carry normals. For each point the neighbourhood selected by
/// `search` is gathered; the simplified histogram (SPFH) of the point against
/// its neighbours is computed first, then each FPFH is the point's SPFH plus
/// the inverse squared distance weighted SPFHs of its neighbours.
///
/// Points with a zero normal get a zero descriptor and are ignored as
/// neighbours.
pub fn compute_fpfh(cloud: &PointCloud, search: SearchParams) -> Result<Features> {
    search.validate()?;
    let normals = cloud.checked_normals("fpfh input")?;

    if cloud.is_empty() {
        return Ok(Features::default());
    }

    let points = cloud.points();
    let normal_vecs = normals.to_vectors();
    let valid: Vec<bool> = (0..cloud.len())
        .map(|i| normals.is_valid(i) && points[i].iter().all(|v| v.is_finite()))
        .collect();

    let tree = KdTree::from_subset(points.clone(), (0..points.len()).filter(|&i| valid[i]));

    // Neighbours other than the point itself, with squared distances.
    let neighbourhoods: Vec<Vec<(usize, f32)>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            if !valid[i] {
                return Vec::new();
            }
            let (indices, dists) = tree.search(&points[i], &search);
            indices
                .into_iter()
                .zip(dists)
                .filter(|&(j, _)| j != i)
                .collect()
        })
        .collect();

    let spfh: Vec<[f32; FPFH_DIM]> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            if !valid[i] {
                return [0.0; FPFH_DIM];
            }
            simplified_histogram(&points, &normal_vecs, i, &neighbourhoods[i])
        })
        .collect();

    let data: Vec<[f32; FPFH_DIM]> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            if !valid[i] {
                return [0.0; FPFH_DIM];
            }
            weighted_histogram(&spfh, i, &neighbourhoods[i])
        })
        .collect();

    let features = Features::new(data);
    debug!(
        points = features.len(),
        valid = features.valid_indices().len(),
        ?search,
        "computed FPFH features"
    );
    Ok(features)
}

/// Darboux-frame features `(f1, f2, f3)` of the pair `(p1, n1)`, `(p2, n2)`.
///
/// The frame is anchored at the endpoint whose normal makes the smaller angle
/// with the connecting line. Returns `None` for coincident points or when the
/// frame is undefined (normal parallel to the connecting line).
pub fn pair_features(p1: &[f32; 3], n1: &[f32; 3], p2: &[f32; 3], n2: &[f32; 3]) -> Option<[f32; 3]> {
    let mut d = sub(p2, p1);
    let len_sq = dot(&d, &d);
    if !(len_sq >= f32::MIN_POSITIVE) {
        return None;
    }
    let len = len_sq.sqrt();

    let angle1 = dot(n1, &d) / len;
    let angle2 = dot(n2, &d) / len;

    let (u, n_other, f3) = if angle1.abs().min(1.0).acos() > angle2.abs().min(1.0).acos() {
        d = [-d[0], -d[1], -d[2]];
        (n2, n1, -angle2)
    } else {
        (n1, n2, angle1)
    };

    let v = cross(&d, u);
    let v_len = norm(&v);
    if v_len == 0.0 {
        return None;
    }
    let v = [v[0] / v_len, v[1] / v_len, v[2] / v_len];
    let w = cross(u, &v);

    let f2 = dot(&v, n_other);
    let f1 = dot(&w, n_other).atan2(dot(u, n_other));
    Some([f1, f2, f3])
}

fn simplified_histogram(
    points: &[[f32; 3]],
    normals: &[[f32; 3]],
    i: usize,
    neighbours: &[(usize, f32)],
) -> [f32; FPFH_DIM] {
    let mut hist = [0.0f32; FPFH_DIM];
    for &(j, _) in neighbours {
        let Some([f1, f2, f3]) = pair_features(&points[i], &normals[i], &points[j], &normals[j])
        else {
            continue;
        };
        hist[bin(f1, -PI, PI)] += 1.0;
        hist[BINS + bin(f2, -1.0, 1.0)] += 1.0;
        hist[2 * BINS + bin(f3, -1.0, 1.0)] += 1.0;
    }
    normalize_channels(&mut hist);
    hist
}

fn weighted_histogram(spfh: &[[f32; FPFH_DIM]], i: usize, neighbours: &[(usize, f32)]) -> [f32; FPFH_DIM] {
    // f64 keeps 1 / dist_sq finite for neighbours just above the duplicate floor.
    let mut acc = [0.0f64; FPFH_DIM];
    for &(j, dist_sq) in neighbours {
        if !(dist_sq >= f32::MIN_POSITIVE) {
            continue;
        }
        let weight = 1.0 / f64::from(dist_sq);
        for (a, &s) in acc.iter_mut().zip(&spfh[j]) {
            *a += f64::from(s) * weight;
        }
    }

    let mut out = spfh[i];
    for (o, a) in out.chunks_exact_mut(BINS).zip(acc.chunks_exact(BINS)) {
        let sum: f64 = a.iter().sum();
        if !(sum > 0.0 && sum.is_finite()) {
            continue;
        }
        for (o, &a) in o.iter_mut().zip(a) {
            *o += (a / sum) as f32;
        }
    }

    let total: f32 = out.iter().sum();
    if total > 0.0 {
        for v in &mut out {
            *v /= total;
        }
    }
    out
}

/// Scale each 11-bin channel to sum 1; empty channels stay zero.
fn normalize_channels(hist: &mut [f32; FPFH_DIM]) {
    for channel in hist.chunks_exact_mut(BINS) {
        let sum: f32 = channel.iter().sum();
        if sum > 0.0 {
            for v in channel {
                *v /= sum;
            }
        }
    }
}

#[inline]
fn bin(value: f32, lo: f32, hi: f32) -> usize {
    let t = (value - lo) / (hi - lo) * BINS as f32;
    (t.floor().max(0.0) as usize).min(BINS - 1)
}

#[inline]
fn sub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn norm(a: &[f32; 3]) -> f32 {
    dot(a, a).sqrt()
}

#[inline]
fn cross(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
