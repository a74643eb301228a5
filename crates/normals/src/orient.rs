use std::cmp::Ordering;
use std::collections::BinaryHeap;

use pcd_register_core::{Error, Normals, PointCloud, Result};
use pcd_register_spatial::KdTree;
use rayon::prelude::*;
use tracing::debug;

/// Make normal signs consistent across the surface.
///
/// Builds a graph joining each point to its `k` nearest neighbours, weights an
/// edge by `1 - |n_i . n_j|` and walks a minimum spanning tree of every
/// connected component (Prim), flipping a child whose normal disagrees with
/// its parent. The walk of each component starts at its point with the
/// largest z (lowest index on ties), whose normal is turned to face +z.
///
/// Zero normals are left untouched and do not join the graph.
pub fn orient_normals_consistent_tangent_plane(
    cloud: &PointCloud,
    normals: &mut Normals,
    k: usize,
) -> Result<()> {
    if k == 0 {
        return Err(Error::invalid("k", "orientation needs at least one neighbour"));
    }
    if normals.len() != cloud.len() {
        return Err(Error::NormalsMismatch {
            normals_len: normals.len(),
            cloud_len: cloud.len(),
        });
    }

    let valid: Vec<usize> = (0..cloud.len()).filter(|&i| normals.is_valid(i)).collect();
    if valid.is_empty() {
        return Ok(());
    }

    let points = cloud.points();
    let tree = KdTree::from_subset(points.clone(), valid.iter().copied());
    let snapshot = normals.to_vectors();

    let neighbours: Vec<Vec<(usize, f32)>> = valid
        .par_iter()
        .map(|&i| {
            let (indices, _) = tree.knn(&points[i], k + 1);
            indices
                .into_iter()
                .filter(|&j| j != i)
                .take(k)
                .map(|j| (j, edge_weight(&snapshot[i], &snapshot[j])))
                .collect()
        })
        .collect();

    // The k-NN relation is not symmetric; the graph is.
    let mut adjacency: Vec<Vec<(usize, f32)>> = vec![Vec::new(); cloud.len()];
    for (&i, edges) in valid.iter().zip(&neighbours) {
        for &(j, w) in edges {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
        }
    }

    let mut seeds = valid.clone();
    seeds.sort_by(|&a, &b| points[b][2].total_cmp(&points[a][2]).then(a.cmp(&b)));

    let mut visited = vec![false; cloud.len()];
    let mut heap = BinaryHeap::new();
    let mut components = 0usize;
    let mut flipped = 0usize;

    for seed in seeds {
        if visited[seed] {
            continue;
        }
        components += 1;
        visited[seed] = true;
        if normals.nz[seed] < 0.0 {
            normals.flip(seed);
            flipped += 1;
        }
        push_edges(&adjacency, &visited, seed, &mut heap);

        while let Some(Edge { parent, child, .. }) = heap.pop() {
            if visited[child] {
                continue;
            }
            visited[child] = true;
            let np = normals.normal(parent);
            let nc = normals.normal(child);
            if dot(&np, &nc) < 0.0 {
                normals.flip(child);
                flipped += 1;
            }
            push_edges(&adjacency, &visited, child, &mut heap);
        }
    }

    debug!(components, flipped, k, "oriented normals along the spanning tree");
    Ok(())
}

#[inline]
fn dot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn edge_weight(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (1.0 - dot(a, b).abs()).max(0.0)
}

fn push_edges(
    adjacency: &[Vec<(usize, f32)>],
    visited: &[bool],
    from: usize,
    heap: &mut BinaryHeap<Edge>,
) {
    for &(to, weight) in &adjacency[from] {
        if !visited[to] {
            heap.push(Edge {
                weight,
                parent: from,
                child: to,
            });
        }
    }
}

/// Frontier edge; the heap pops the lightest first, ties by child then parent
/// so the walk is reproducible.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    weight: f32,
    parent: usize,
    child: usize,
}

impl Eq for Edge {}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight
            .total_cmp(&self.weight)
            .then(other.child.cmp(&self.child))
            .then(other.parent.cmp(&self.parent))
    }
}
