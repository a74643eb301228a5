#![forbid(unsafe_code)]

pub mod fpfh;

pub use fpfh::{compute_fpfh, pair_features, Features, FPFH_DIM};
