#![forbid(unsafe_code)]

pub mod estimate;
pub mod orient;

pub use estimate::{estimate_normals, estimate_normals_with_viewpoint, NormalEstimate};
pub use orient::orient_normals_consistent_tangent_plane;
