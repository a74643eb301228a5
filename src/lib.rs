//! Rigid point-cloud registration.
//!
//! Voxel downsampling, normals with consistent orientation, FPFH descriptors,
//! RANSAC or fast global registration on descriptor matches, and ICP
//! refinement, all on top of one k-d tree implementation.
//!
//! ```no_run
//! use pcd_register::{register, PointCloud, RegistrationConfig};
//!
//! # fn load() -> (PointCloud, PointCloud) { unimplemented!() }
//! let (source, target) = load();
//! let registration = register(&source, &target, &RegistrationConfig::default())?;
//! println!("{:?}", registration.transform().to_matrix4());
//! # Ok::<(), pcd_register::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod pipeline;

pub use config::{GlobalMethod, GlobalSection, RefineSection, RegistrationConfig};
pub use pipeline::{
    global_registration, prepare_dataset, preprocess_point_cloud, refine_registration, register,
    PreparedCloud, Registration,
};

pub use pcd_register_core::{apply_transform, Error, Normals, PointCloud, Result, RigidTransform};
pub use pcd_register_features::{compute_fpfh, Features};
pub use pcd_register_filters::voxel_downsample;
pub use pcd_register_normals::{estimate_normals, orient_normals_consistent_tangent_plane};
pub use pcd_register_registration::{
    evaluate_registration, registration_icp, EstimationMethod, FeatureRegistration, FgrParams,
    IcpParams, RansacParams, RegistrationResult, RegistrationStatus,
};
pub use pcd_register_spatial::{KdTree, SearchParams};
