use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pcd_register::{compute_fpfh, estimate_normals, PointCloud, SearchParams};
use pcd_register_registration::match_features;

fn height_field(n: usize) -> PointCloud {
    let mut pts = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let x = i as f32 * 0.02;
            let y = j as f32 * 0.02;
            pts.push([x, y, 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * y]);
        }
    }
    PointCloud::from_points(&pts)
}

fn with_normals(cloud: PointCloud) -> PointCloud {
    let normals = estimate_normals(&cloud, SearchParams::hybrid(0.1, 30))
        .unwrap()
        .normals;
    cloud.with_normals(normals).unwrap()
}

fn bench_fpfh(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_fpfh_r0.25_nn100");
    group.sample_size(10);
    for side in [50, 100] {
        let cloud = with_normals(height_field(side));
        group.bench_with_input(
            BenchmarkId::new("pcd-register", side * side),
            &cloud,
            |b, cloud| b.iter(|| compute_fpfh(cloud, SearchParams::hybrid(0.25, 100))),
        );
    }
    group.finish();
}

fn bench_match_features(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_features_mutual");
    group.sample_size(10);
    for side in [30, 60] {
        let cloud = with_normals(height_field(side));
        let features = compute_fpfh(&cloud, SearchParams::hybrid(0.25, 100)).unwrap();
        group.bench_with_input(
            BenchmarkId::new("pcd-register", side * side),
            &features,
            |b, features| b.iter(|| match_features(features, features, true)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fpfh, bench_match_features);
criterion_main!(benches);
