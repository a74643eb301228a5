//! End-to-end registration: downsample, describe, align globally, refine.

use std::borrow::Cow;

use pcd_register_core::{PointCloud, Result, RigidTransform};
use pcd_register_features::{compute_fpfh, Features};
use pcd_register_filters::voxel_downsample;
use pcd_register_normals::{estimate_normals, orient_normals_consistent_tangent_plane};
use pcd_register_registration::{registration_icp, EstimationMethod, RegistrationResult};
use tracing::info;

use crate::config::RegistrationConfig;

/// A downsampled cloud with oriented normals and its FPFH descriptors.
#[derive(Debug, Clone)]
pub struct PreparedCloud {
    pub cloud: PointCloud,
    pub features: Features,
}

/// Outcome of [`register`]: the coarse estimate and its ICP refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Registration {
    pub global: RegistrationResult,
    pub refined: RegistrationResult,
}

impl Registration {
    pub fn transform(&self) -> RigidTransform {
        self.refined.transform
    }
}

/// Downsample `cloud`, estimate and orient normals on the result and compute
/// its FPFH features.
pub fn preprocess_point_cloud(
    cloud: &PointCloud,
    config: &RegistrationConfig,
) -> Result<PreparedCloud> {
    config.validate()?;

    info!(voxel_size = config.voxel_size, points = cloud.len(), "downsample");
    let down = voxel_downsample(cloud, config.voxel_size)?;

    let down = with_oriented_normals(down, config)?;

    let feature_search = config.feature_search();
    info!(
        radius = config.voxel_size * config.feature_radius_factor,
        max_nn = config.feature_max_nn,
        "compute FPFH features"
    );
    let features = compute_fpfh(&down, feature_search)?;

    Ok(PreparedCloud {
        cloud: down,
        features,
    })
}

/// [`preprocess_point_cloud`] for both clouds of a registration problem.
pub fn prepare_dataset(
    source: &PointCloud,
    target: &PointCloud,
    config: &RegistrationConfig,
) -> Result<(PreparedCloud, PreparedCloud)> {
    let source_down = preprocess_point_cloud(source, config)?;
    let target_down = preprocess_point_cloud(target, config)?;
    info!(
        source = source_down.cloud.len(),
        target = target_down.cloud.len(),
        "dataset prepared"
    );
    Ok((source_down, target_down))
}

/// Coarse alignment of two prepared clouds with the configured method.
pub fn global_registration(
    source: &PreparedCloud,
    target: &PreparedCloud,
    config: &RegistrationConfig,
) -> Result<RegistrationResult> {
    config.validate()?;
    info!(
        method = %config.global.method,
        threshold = config.global_distance(),
        "global registration"
    );
    let result = config.global_solver().register(
        &source.cloud,
        &target.cloud,
        &source.features,
        &target.features,
    )?;
    info!(
        fitness = result.fitness,
        rmse = result.rmse,
        status = ?result.status,
        "global registration done"
    );
    Ok(result)
}

/// ICP on the full-resolution clouds starting from `init`.
///
/// Point-to-plane needs target normals; when the target carries none they are
/// estimated and oriented here with the normal search settings.
pub fn refine_registration(
    source: &PointCloud,
    target: &PointCloud,
    init: &RigidTransform,
    config: &RegistrationConfig,
) -> Result<RegistrationResult> {
    config.validate()?;
    let estimation = config.refine.estimation;
    let target = match estimation {
        EstimationMethod::PointToPlane if !target.has_normals() => {
            Cow::Owned(with_oriented_normals(target.clone(), config)?)
        }
        _ => Cow::Borrowed(target),
    };

    info!(
        threshold = config.refine_distance(),
        ?estimation,
        "ICP refinement"
    );
    let result = registration_icp(source, &target, init, estimation, &config.icp_params())?;
    info!(
        fitness = result.fitness,
        rmse = result.rmse,
        iterations = result.num_iterations,
        status = ?result.status,
        "ICP refinement done"
    );
    Ok(result)
}

/// All stages: prepare both clouds, align them globally, then refine the
/// global estimate with ICP on the full clouds.
///
/// Solver failures show up in the statuses of the returned results; only
/// invalid input is an error.
pub fn register(
    source: &PointCloud,
    target: &PointCloud,
    config: &RegistrationConfig,
) -> Result<Registration> {
    let (source_down, target_down) = prepare_dataset(source, target, config)?;
    let global = global_registration(&source_down, &target_down, config)?;
    let refined = refine_registration(source, target, &global.transform, config)?;
    Ok(Registration { global, refined })
}

fn with_oriented_normals(cloud: PointCloud, config: &RegistrationConfig) -> Result<PointCloud> {
    info!(
        radius = config.voxel_size * config.normal_radius_factor,
        max_nn = config.normal_max_nn,
        "estimate normals"
    );
    let mut normals = estimate_normals(&cloud, config.normal_search())?.normals;
    orient_normals_consistent_tangent_plane(&cloud, &mut normals, config.orientation_k)?;
    cloud.with_normals(normals)
}
