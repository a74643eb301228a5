use pcd_register_core::PointCloud;
use pcd_register_features::Features;
use pcd_register_spatial::KdTree;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub source_index: usize,
    pub target_index: usize,
    /// Euclidean distance, in space or in descriptor space depending on how
    /// the pair was found.
    pub distance: f32,
}

/// Find correspondences between source points and the nearest points in the
/// target cloud (represented by its KdTree).
///
/// For each point in `source`, the nearest neighbor in `target_tree` is found.
/// Only correspondences with distance <= `max_distance` are returned, ordered
/// by source index.
pub fn find_correspondences(
    source: &PointCloud,
    target_tree: &KdTree,
    max_distance: f32,
) -> Vec<Correspondence> {
    nearest_within(&source.points(), target_tree, max_distance)
}

pub(crate) fn nearest_within(
    points: &[[f32; 3]],
    target_tree: &KdTree,
    max_distance: f32,
) -> Vec<Correspondence> {
    let max_sq = max_distance * max_distance;
    points
        .par_iter()
        .enumerate()
        .filter_map(|(i, query)| {
            let (target_index, dist_sq) = target_tree.nearest(query)?;
            (dist_sq <= max_sq).then(|| Correspondence {
                source_index: i,
                target_index,
                distance: dist_sq.sqrt(),
            })
        })
        .collect()
}

/// Pair every valid source descriptor with its nearest valid target
/// descriptor.
///
/// With `mutual`, a pair survives only if the source descriptor is in turn the
/// nearest to that target descriptor. Output is ordered by source index, one
/// entry per source point at most.
pub fn match_features(source: &Features, target: &Features, mutual: bool) -> Vec<Correspondence> {
    let target_tree = target.tree();
    let source_tree = mutual.then(|| source.tree());

    source
        .valid_indices()
        .into_par_iter()
        .filter_map(|i| {
            let (j, dist_sq) = target_tree.nearest(source.descriptor(i))?;
            if let Some(tree) = &source_tree {
                let (back, _) = tree.nearest(target.descriptor(j))?;
                if back != i {
                    return None;
                }
            }
            Some(Correspondence {
                source_index: i,
                target_index: j,
                distance: dist_sq.sqrt(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcd_register_features::FPFH_DIM;

    fn descriptor(hot: usize) -> [f32; FPFH_DIM] {
        let mut d = [0.0; FPFH_DIM];
        d[hot] = 1.0;
        d
    }

    #[test]
    fn find_correspondences_identical_clouds() {
        let cloud = PointCloud::from_xyz(vec![0.0, 1.0, 2.0], vec![0.0; 3], vec![0.0; 3]);
        let tree = KdTree::build(&cloud);

        let corrs = find_correspondences(&cloud, &tree, f32::INFINITY);

        assert_eq!(corrs.len(), 3);
        for c in &corrs {
            assert_eq!(c.source_index, c.target_index);
            assert!(c.distance.abs() < 1e-6, "expected ~0, got {}", c.distance);
        }
    }

    #[test]
    fn find_correspondences_with_max_distance() {
        let source = PointCloud::from_xyz(vec![0.0, 1.0, 10.0], vec![0.0; 3], vec![0.0; 3]);
        let target = PointCloud::from_xyz(vec![0.5, 1.0, 2.0], vec![0.0; 3], vec![0.0; 3]);
        let tree = KdTree::build(&target);

        // x = 10 is 8 away from its nearest target point.
        let corrs = find_correspondences(&source, &tree, 3.0);

        assert_eq!(corrs.len(), 2);
        assert_eq!(corrs[0].source_index, 0);
        assert!((corrs[0].distance - 0.5).abs() < 1e-6, "distances are not squared");
        assert_eq!(corrs[1].source_index, 1);
    }

    #[test]
    fn find_correspondences_empty_inputs() {
        let cloud = PointCloud::from_xyz(vec![1.0], vec![2.0], vec![3.0]);
        let tree = KdTree::build(&cloud);
        assert!(find_correspondences(&PointCloud::new(), &tree, f32::INFINITY).is_empty());

        let empty_tree = KdTree::build(&PointCloud::new());
        assert!(find_correspondences(&cloud, &empty_tree, f32::INFINITY).is_empty());
    }

    #[test]
    fn match_features_one_way_and_mutual() {
        // Source 0 and 1 both look most like target 0; only source 0 is
        // target 0's own best match.
        let mut near_zero = descriptor(0);
        near_zero[1] = 0.2;
        let source = Features::new(vec![descriptor(0), near_zero, descriptor(5)]);
        let target = Features::new(vec![descriptor(0), descriptor(5)]);

        let one_way = match_features(&source, &target, false);
        let pairs: Vec<(usize, usize)> = one_way
            .iter()
            .map(|c| (c.source_index, c.target_index))
            .collect();
        assert_eq!(pairs, vec![(0, 0), (1, 0), (2, 1)]);

        let mutual = match_features(&source, &target, true);
        let pairs: Vec<(usize, usize)> = mutual
            .iter()
            .map(|c| (c.source_index, c.target_index))
            .collect();
        assert_eq!(pairs, vec![(0, 0), (2, 1)]);
    }

    #[test]
    fn zero_descriptors_never_match() {
        let source = Features::new(vec![[0.0; FPFH_DIM], descriptor(3)]);
        let target = Features::new(vec![[0.0; FPFH_DIM], descriptor(3)]);

        let corrs = match_features(&source, &target, true);
        assert_eq!(corrs.len(), 1);
        assert_eq!((corrs[0].source_index, corrs[0].target_index), (1, 1));
    }
}
