#![forbid(unsafe_code)]

pub mod correspondence;
pub mod evaluate;
pub mod fgr;
pub mod global;
pub mod icp;
mod icp_plane;
pub mod kabsch;
pub mod ransac;
pub mod result;

pub use correspondence::{find_correspondences, match_features, Correspondence};
pub use evaluate::evaluate_registration;
pub use fgr::{
    registration_fgr_based_on_correspondence, registration_fgr_based_on_feature_matching,
    FgrParams,
};
pub use global::FeatureRegistration;
pub use icp::{icp_point_to_plane, icp_point_to_point, registration_icp, EstimationMethod, IcpParams};
pub use kabsch::{estimate_from_correspondences, estimate_rigid_transform};
pub use pcd_register_core::{apply_transform, RigidTransform};
pub use ransac::{
    registration_ransac_based_on_correspondence, registration_ransac_based_on_feature_matching,
    RansacParams,
};
pub use result::{RegistrationResult, RegistrationStatus};
