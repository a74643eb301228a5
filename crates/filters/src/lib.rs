#![forbid(unsafe_code)]

pub mod voxel_downsample;

pub use voxel_downsample::voxel_downsample;
