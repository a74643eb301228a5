use pcd_register_core::{PointCloud, Result};
use pcd_register_features::Features;

use crate::fgr::{registration_fgr_based_on_feature_matching, FgrParams};
use crate::ransac::{registration_ransac_based_on_feature_matching, RansacParams};
use crate::result::RegistrationResult;

/// A global (initialization-free) registration driven by FPFH descriptors.
///
/// The parameter sets of the solvers implement this, so a caller can pick
/// RANSAC or FGR at runtime and hold either behind `&dyn FeatureRegistration`.
pub trait FeatureRegistration {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        source_features: &Features,
        target_features: &Features,
    ) -> Result<RegistrationResult>;
}

impl FeatureRegistration for RansacParams {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        source_features: &Features,
        target_features: &Features,
    ) -> Result<RegistrationResult> {
        registration_ransac_based_on_feature_matching(
            source,
            target,
            source_features,
            target_features,
            self,
        )
    }
}

impl FeatureRegistration for FgrParams {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        source_features: &Features,
        target_features: &Features,
    ) -> Result<RegistrationResult> {
        registration_fgr_based_on_feature_matching(
            source,
            target,
            source_features,
            target_features,
            self,
        )
    }
}
