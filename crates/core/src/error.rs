use thiserror::Error;

/// Errors shared by every stage of the registration engine.
///
/// Only invalid input is returned as `Err` from the public entry points, and
/// always before any computation starts. Degenerate geometry, insufficient
/// correspondences and non-convergence found *while solving* are reported
/// through the registration result status instead; the variants below exist so
/// callers can promote those statuses into hard errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("insufficient correspondences: found {found}, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },

    #[error("no convergence after {iterations} iterations (best rmse {best_rmse})")]
    NonConvergence { iterations: usize, best_rmse: f32 },

    #[error("normals length ({normals_len}) does not match cloud length ({cloud_len})")]
    NormalsMismatch { normals_len: usize, cloud_len: usize },

    #[error("feature count ({features_len}) does not match cloud length ({cloud_len})")]
    FeatureMismatch { features_len: usize, cloud_len: usize },

    #[error("{0} cloud has no normals")]
    MissingNormals(&'static str),
}

impl Error {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rejects values that are not strictly positive and finite.
pub fn ensure_positive(name: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid(
            name,
            format!("must be > 0 and finite, got {value}"),
        ))
    }
}
