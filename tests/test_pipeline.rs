use approx::assert_relative_eq;
use pcd_register::{
    apply_transform, evaluate_registration, global_registration, prepare_dataset,
    refine_registration, register, EstimationMethod, Error, GlobalMethod, PointCloud,
    RegistrationConfig, RegistrationStatus, RigidTransform,
};
use proptest::prelude::*;

/// Wavy, asymmetric height field on a regular grid, shifted off the voxel
/// boundaries.
fn height_field(n: usize) -> PointCloud {
    let mut pts = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let x = 0.013 + i as f32 * 0.02;
            let y = 0.013 + j as f32 * 0.02;
            pts.push([x, y, 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * y]);
        }
    }
    PointCloud::from_points(&pts)
}

fn assert_translation(transform: &RigidTransform, expected: [f32; 3], eps: f32) {
    for axis in 0..3 {
        assert_relative_eq!(transform.translation[axis], expected[axis], epsilon = eps);
    }
    assert!(transform.is_rigid(1e-4), "{transform:?}");
}

/// Two identical clouds, one translated by (1, 0, 0).
#[test]
fn pipeline_recovers_unit_translation() {
    let source = height_field(60);
    let target = apply_transform(&source, &RigidTransform::from_translation([1.0, 0.0, 0.0]));
    let config = RegistrationConfig::default();

    let registration = register(&source, &target, &config).unwrap();

    assert_eq!(registration.global.status, RegistrationStatus::Converged);
    assert_translation(&registration.global.transform, [1.0, 0.0, 0.0], 0.05);

    let refined = registration.refined;
    assert!(
        matches!(
            refined.status,
            RegistrationStatus::Converged | RegistrationStatus::MaxIterationsReached
        ),
        "{:?}",
        refined.status
    );
    assert!(refined.fitness > 0.99, "fitness = {}", refined.fitness);
    assert_translation(&registration.transform(), [1.0, 0.0, 0.0], 1e-3);
}

#[test]
fn pipeline_with_fast_global_registration() {
    let source = height_field(60);
    let truth = RigidTransform::from_twist(&[0.0, 0.0, 0.2, 1.0, 0.5, 0.0]);
    let target = apply_transform(&source, &truth);
    let mut config = RegistrationConfig::default();
    config.global.method = "FAST".parse::<GlobalMethod>().unwrap();

    let (source_down, target_down) = prepare_dataset(&source, &target, &config).unwrap();
    assert_eq!(source_down.features.len(), source_down.cloud.len());
    assert_eq!(target_down.features.len(), target_down.cloud.len());

    let global = global_registration(&source_down, &target_down, &config).unwrap();
    let refined = refine_registration(&source, &target, &global.transform, &config).unwrap();

    assert!(refined.fitness > 0.99, "fitness = {}", refined.fitness);
    assert_translation(&refined.transform, truth.translation, 1e-2);
    for r in 0..3 {
        for c in 0..3 {
            assert_relative_eq!(refined.transform.rotation[r][c], truth.rotation[r][c], epsilon = 1e-2);
        }
    }
}

#[test]
fn evaluation_matches_refined_result() {
    let source = height_field(30);
    let shift = RigidTransform::from_translation([0.0, 0.0, 0.01]);
    let target = apply_transform(&source, &shift);
    let config = RegistrationConfig::default();

    let refined = refine_registration(&source, &target, &RigidTransform::identity(), &config).unwrap();
    let evaluation =
        evaluate_registration(&source, &target, config.refine_distance(), &refined.transform).unwrap();

    assert_relative_eq!(evaluation.fitness, refined.fitness);
    assert_relative_eq!(evaluation.rmse, refined.rmse, epsilon = 1e-6);
    assert!(refined.fitness > 0.99);
}

#[test]
fn zero_voxel_size_fails_before_any_work() {
    let cloud = height_field(10);
    let err = register(&cloud, &cloud, &RegistrationConfig::with_voxel_size(0.0)).unwrap_err();
    assert!(
        matches!(err, Error::InvalidParameter { name: "voxel_size", .. }),
        "{err}"
    );
}

#[test]
fn unknown_method_is_rejected() {
    assert!(matches!(
        "ICP".parse::<GlobalMethod>(),
        Err(Error::InvalidParameter { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn thresholds_follow_voxel_size(voxel_size in 1e-3f32..1.0) {
        let config = RegistrationConfig::with_voxel_size(voxel_size);
        prop_assert!(config.validate().is_ok());
        prop_assert!((config.global_distance() - 1.5 * voxel_size).abs() <= 1e-6 * voxel_size.max(1.0));
        prop_assert!((config.refine_distance() - 0.4 * voxel_size).abs() <= 1e-6 * voxel_size.max(1.0));
        prop_assert!(config.refine_distance() < config.global_distance());
    }

    #[test]
    fn refinement_stays_rigid_and_scored(
        pts in prop::collection::vec(prop::array::uniform3(-1.0f32..1.0), 4..60),
        twist in prop::array::uniform6(-0.05f64..0.05),
    ) {
        let source = PointCloud::from_points(&pts);
        let target = apply_transform(&source, &RigidTransform::from_twist(&twist));
        let mut config = RegistrationConfig::with_voxel_size(0.5);
        config.refine.estimation = EstimationMethod::PointToPoint;

        let refined = refine_registration(&source, &target, &RigidTransform::identity(), &config).unwrap();
        prop_assert!(refined.transform.is_rigid(1e-4));
        prop_assert!((0.0..=1.0).contains(&refined.fitness));
        prop_assert!(refined.rmse.is_finite());

        let evaluation =
            evaluate_registration(&source, &target, config.refine_distance(), &refined.transform).unwrap();
        prop_assert!((evaluation.fitness - refined.fitness).abs() < 1e-6);
    }
}
