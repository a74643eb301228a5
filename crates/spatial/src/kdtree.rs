use std::cmp::Ordering;
use std::collections::BinaryHeap;

use pcd_register_core::PointCloud;

use crate::search::SearchParams;

/// Nodes holding this many points or fewer are not split further.
const LEAF_SIZE: usize = 16;

/// A k-d tree over `D`-dimensional points.
///
/// `D = 3` indexes point positions; the same structure indexes 33-dimensional
/// FPFH descriptors for feature matching. The tree is built once and never
/// modified. Each node is split at the median of the axis with the greatest
/// spread; a node whose points all coincide stays a leaf, so duplicated points
/// are fine.
///
/// Every query returns `(indices, squared_distances)` sorted ascending by
/// distance, ties broken by index, which makes results identical to a sorted
/// brute-force scan.
#[derive(Debug, Clone)]
pub struct KdTree<const D: usize = 3> {
    points: Vec<[f32; D]>,
    order: Vec<u32>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        axis: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

impl KdTree<3> {
    /// Build a KdTree over the positions of a PointCloud.
    pub fn build(cloud: &PointCloud) -> Self {
        Self::from_points(cloud.points())
    }
}

impl<const D: usize> KdTree<D> {
    /// Index every finite point. Returned indices refer to positions in
    /// `points`.
    pub fn from_points(points: Vec<[f32; D]>) -> Self {
        let all = 0..points.len();
        Self::from_subset(points, all)
    }

    /// Index only the points named by `subset`; returned indices still refer
    /// to positions in `points`. Out-of-range, duplicate and non-finite entries
    /// are skipped.
    pub fn from_subset(points: Vec<[f32; D]>, subset: impl IntoIterator<Item = usize>) -> Self {
        assert!(
            points.len() <= u32::MAX as usize,
            "KdTree supports at most u32::MAX points"
        );

        let mut order: Vec<u32> = subset
            .into_iter()
            .filter(|&i| i < points.len() && points[i].iter().all(|v| v.is_finite()))
            .map(|i| i as u32)
            .collect();
        order.sort_unstable();
        order.dedup();

        let mut nodes = Vec::new();
        let root = if order.is_empty() {
            None
        } else {
            Some(build_node(&points, &mut order, 0, &mut nodes))
        };

        Self {
            points,
            order,
            nodes,
            root,
        }
    }

    /// Returns the number of indexed points.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn point(&self, i: usize) -> &[f32; D] {
        &self.points[i]
    }

    /// Find the `k` nearest neighbours to `query`.
    ///
    /// Edge cases:
    /// - Returns empty if `k == 0`, the tree is empty, or query is non-finite.
    /// - If `k > len()`, returns all points.
    pub fn knn(&self, query: &[f32; D], k: usize) -> (Vec<usize>, Vec<f32>) {
        self.collect(query, k, f32::INFINITY)
    }

    /// The single nearest point and its squared distance.
    pub fn nearest(&self, query: &[f32; D]) -> Option<(usize, f32)> {
        let (idx, dist) = self.knn(query, 1);
        idx.first().copied().zip(dist.first().copied())
    }

    /// All points with `euclidean_dist <= radius`.
    ///
    /// Returns empty if radius <= 0, radius is non-finite, the tree is empty,
    /// or the query is non-finite.
    pub fn radius_search(&self, query: &[f32; D], radius: f32) -> (Vec<usize>, Vec<f32>) {
        if !(radius.is_finite() && radius > 0.0) {
            return (Vec::new(), Vec::new());
        }
        self.collect(query, self.len(), radius * radius)
    }

    /// At most `max_nn` nearest points within `radius`.
    pub fn hybrid_search(
        &self,
        query: &[f32; D],
        radius: f32,
        max_nn: usize,
    ) -> (Vec<usize>, Vec<f32>) {
        if !(radius.is_finite() && radius > 0.0) {
            return (Vec::new(), Vec::new());
        }
        self.collect(query, max_nn, radius * radius)
    }

    pub fn search(&self, query: &[f32; D], params: &SearchParams) -> (Vec<usize>, Vec<f32>) {
        match *params {
            SearchParams::Knn { k } => self.knn(query, k),
            SearchParams::Radius { radius } => self.radius_search(query, radius),
            SearchParams::Hybrid { radius, max_nn } => self.hybrid_search(query, radius, max_nn),
        }
    }

    fn collect(&self, query: &[f32; D], k: usize, max_dist_sq: f32) -> (Vec<usize>, Vec<f32>) {
        let Some(root) = self.root else {
            return (Vec::new(), Vec::new());
        };
        if k == 0 || !query.iter().all(|v| v.is_finite()) {
            return (Vec::new(), Vec::new());
        }

        let mut out = Collector::new(k.min(self.len()), max_dist_sq);
        self.search_node(root, query, &mut out);
        out.into_sorted()
    }

    fn search_node(&self, node: usize, query: &[f32; D], out: &mut Collector) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &idx in &self.order[start..end] {
                    out.offer(Candidate {
                        dist_sq: squared_distance(&self.points[idx as usize], query),
                        index: idx,
                    });
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (near, far) = if diff < 0.0 {
                    (left, right)
                } else {
                    (right, left)
                };
                self.search_node(near, query, out);
                // `<=` keeps equal-distance points on the far side reachable
                // for the index tie-break.
                if diff * diff <= out.bound() {
                    self.search_node(far, query, out);
                }
            }
        }
    }
}

/// Squared Euclidean distance; the single definition used by the tree and by
/// brute-force checks so both agree bit for bit.
#[inline]
pub fn squared_distance<const D: usize>(a: &[f32; D], b: &[f32; D]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..D {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

fn build_node<const D: usize>(
    points: &[[f32; D]],
    order: &mut [u32],
    offset: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let len = order.len();
    let id = nodes.len();

    let (axis, spread) = widest_axis(points, order);
    if len <= LEAF_SIZE || spread <= 0.0 {
        nodes.push(Node::Leaf {
            start: offset,
            end: offset + len,
        });
        return id;
    }

    let mid = len / 2;
    order.select_nth_unstable_by(mid, |&a, &b| compare_on_axis(points, axis, a, b));
    let value = points[order[mid] as usize][axis];

    // Reserve the slot, children are appended after it.
    nodes.push(Node::Leaf { start: 0, end: 0 });
    let (lo, hi) = order.split_at_mut(mid);
    let left = build_node(points, lo, offset, nodes);
    let right = build_node(points, hi, offset + mid, nodes);
    nodes[id] = Node::Split {
        axis,
        value,
        left,
        right,
    };
    id
}

fn widest_axis<const D: usize>(points: &[[f32; D]], order: &[u32]) -> (usize, f32) {
    let mut best = (0, 0.0f32);
    for axis in 0..D {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for &idx in order {
            let v = points[idx as usize][axis];
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let spread = hi - lo;
        if spread > best.1 {
            best = (axis, spread);
        }
    }
    best
}

#[inline]
fn compare_on_axis<const D: usize>(points: &[[f32; D]], axis: usize, a: u32, b: u32) -> Ordering {
    points[a as usize][axis]
        .total_cmp(&points[b as usize][axis])
        .then(a.cmp(&b))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist_sq: f32,
    index: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

/// Bounded max-heap of the best candidates seen so far.
struct Collector {
    k: usize,
    max_dist_sq: f32,
    heap: BinaryHeap<Candidate>,
}

impl Collector {
    fn new(k: usize, max_dist_sq: f32) -> Self {
        Self {
            k,
            max_dist_sq,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    /// Squared distance beyond which nothing can enter the result.
    #[inline]
    fn bound(&self) -> f32 {
        match self.heap.peek() {
            Some(worst) if self.heap.len() >= self.k => worst.dist_sq,
            _ => self.max_dist_sq,
        }
    }

    #[inline]
    fn offer(&mut self, candidate: Candidate) {
        if candidate.dist_sq > self.max_dist_sq {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    fn into_sorted(self) -> (Vec<usize>, Vec<f32>) {
        let sorted = self.heap.into_sorted_vec();
        let mut indices = Vec::with_capacity(sorted.len());
        let mut distances = Vec::with_capacity(sorted.len());
        for c in sorted {
            indices.push(c.index as usize);
            distances.push(c.dist_sq);
        }
        (indices, distances)
    }
}
