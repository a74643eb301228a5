use pcd_register::{
    apply_transform, estimate_normals, orient_normals_consistent_tangent_plane, registration_icp,
    EstimationMethod, IcpParams, PointCloud, RigidTransform, SearchParams,
};

fn main() -> pcd_register::Result<()> {
    // A curved patch, so point-to-plane has every direction constrained.
    let mut pts = Vec::new();
    for i in 0..50 {
        for j in 0..50 {
            let x = i as f32 * 0.02;
            let y = j as f32 * 0.02;
            pts.push([x, y, 0.2 * (4.0 * x).sin() + 0.1 * (3.0 * y).cos()]);
        }
    }
    let source = PointCloud::from_points(&pts);
    println!("Source: {} points", source.len());

    let motion = RigidTransform::from_twist(&[0.0, 0.0, 0.05, 0.03, -0.02, 0.01]);
    let target = apply_transform(&source, &motion);
    let mut normals = estimate_normals(&target, SearchParams::hybrid(0.06, 30))?.normals;
    orient_normals_consistent_tangent_plane(&target, &mut normals, 10)?;
    let target = target.with_normals(normals)?;
    println!("Target: {} points (moved by {:?})", target.len(), motion.to_matrix4());

    let params = IcpParams {
        max_correspondence_distance: 0.1,
        ..IcpParams::default()
    };
    for estimation in [EstimationMethod::PointToPoint, EstimationMethod::PointToPlane] {
        let result = registration_icp(&source, &target, &RigidTransform::identity(), estimation, &params)?;
        println!("{estimation:?}:");
        println!("  status: {:?}", result.status);
        println!("  iterations: {}", result.num_iterations);
        println!("  fitness: {:.4}", result.fitness);
        println!("  inlier RMSE: {:.6}", result.rmse);
        println!(
            "  translation: [{:.4}, {:.4}, {:.4}]",
            result.transform.translation[0], result.transform.translation[1], result.transform.translation[2]
        );
    }
    Ok(())
}
