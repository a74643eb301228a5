use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pcd_register::{KdTree, PointCloud};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_cloud(n: usize, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..100.0)).collect();
    let y: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..100.0)).collect();
    let z: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..100.0)).collect();
    PointCloud::from_xyz(x, y, z)
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdtree_build");
    for size in [100_000, 1_000_000] {
        let cloud = random_cloud(size, 42);
        group.bench_with_input(BenchmarkId::new("pcd-register", size), &cloud, |b, cloud| {
            b.iter(|| KdTree::build(cloud))
        });
    }
    group.finish();
}

fn bench_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdtree_knn_10");
    for size in [100_000, 1_000_000] {
        let cloud = random_cloud(size, 42);
        let tree = KdTree::build(&cloud);
        let query = [50.0f32, 50.0, 50.0];
        group.bench_with_input(BenchmarkId::new("pcd-register", size), &size, |b, _| {
            b.iter(|| tree.knn(&query, 10))
        });
    }
    group.finish();
}

fn bench_hybrid_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdtree_hybrid_search");
    for size in [100_000, 1_000_000] {
        let cloud = random_cloud(size, 42);
        let tree = KdTree::build(&cloud);
        let query = [50.0f32, 50.0, 50.0];
        group.bench_with_input(BenchmarkId::new("pcd-register", size), &size, |b, _| {
            b.iter(|| tree.hybrid_search(&query, 5.0, 30))
        });
    }
    group.finish();
}

/// Nearest neighbour in FPFH space, as used by feature matching.
fn bench_knn_33d(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdtree_nearest_33d");
    let mut rng = StdRng::seed_from_u64(7);
    for size in [1_000, 10_000] {
        let points: Vec<[f32; 33]> = (0..size)
            .map(|_| std::array::from_fn(|_| rng.gen_range(0.0f32..1.0)))
            .collect();
        let query = points[0];
        let tree = KdTree::from_points(points);
        group.bench_with_input(BenchmarkId::new("pcd-register", size), &size, |b, _| {
            b.iter(|| tree.nearest(&query))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_knn, bench_hybrid_search, bench_knn_33d);
criterion_main!(benches);
