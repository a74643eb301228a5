//! Global + local registration of a synthetic scan pair.
//!
//! Run with `RUST_LOG=debug` to follow the solver iterations.

use pcd_register::{apply_transform, register, PointCloud, RegistrationConfig, RigidTransform};
use tracing_subscriber::EnvFilter;

fn scan() -> PointCloud {
    let mut pts = Vec::new();
    for i in 0..100 {
        for j in 0..100 {
            let x = i as f32 * 0.02;
            let y = j as f32 * 0.02;
            pts.push([x, y, 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * y]);
        }
    }
    PointCloud::from_points(&pts)
}

fn main() -> pcd_register::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let method = std::env::args().nth(1).unwrap_or_else(|| "RANSAC".to_string());
    let mut config = RegistrationConfig::default();
    config.global.method = method.parse()?;

    let source = scan();
    let truth = RigidTransform::from_twist(&[0.05, -0.1, 0.4, 0.6, -0.3, 0.1]);
    let target = apply_transform(&source, &truth);

    let registration = register(&source, &target, &config)?;
    println!("global:  {:?}", registration.global);
    println!("refined: {:?}", registration.refined);
    println!("estimated: {:?}", registration.transform().to_matrix4());
    println!("expected:  {:?}", truth.to_matrix4());
    Ok(())
}
