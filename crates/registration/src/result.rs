use std::time::Instant;

use pcd_register_core::{Error, Result, RigidTransform};

/// How a registration call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Converged,
    MaxIterationsReached,
    /// Too many consecutive non-improving steps; the best-seen estimate is
    /// returned.
    NonConvergence,
    /// The deadline passed; the best-so-far estimate is returned.
    Cancelled,
    InsufficientCorrespondences { found: usize, required: usize },
    DegenerateGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationResult {
    pub transform: RigidTransform,
    /// Fraction of source points with a target point within the threshold.
    pub fitness: f32,
    /// RMS distance over those inliers.
    pub rmse: f32,
    pub num_iterations: usize,
    pub status: RegistrationStatus,
}

impl RegistrationResult {
    pub(crate) fn identity(status: RegistrationStatus) -> Self {
        Self {
            transform: RigidTransform::identity(),
            fitness: 0.0,
            rmse: 0.0,
            num_iterations: 0,
            status,
        }
    }

    /// Turn a status that signals failure into the matching error.
    ///
    /// `Converged`, `MaxIterationsReached` and `Cancelled` all carry a usable
    /// estimate and pass through.
    pub fn ensure_converged(self) -> Result<Self> {
        match self.status {
            RegistrationStatus::Converged
            | RegistrationStatus::MaxIterationsReached
            | RegistrationStatus::Cancelled => Ok(self),
            RegistrationStatus::NonConvergence => Err(Error::NonConvergence {
                iterations: self.num_iterations,
                best_rmse: self.rmse,
            }),
            RegistrationStatus::InsufficientCorrespondences { found, required } => {
                Err(Error::InsufficientCorrespondences { found, required })
            }
            RegistrationStatus::DegenerateGeometry => Err(Error::DegenerateGeometry(
                "solver could not estimate a transform".to_string(),
            )),
        }
    }
}

#[inline]
pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
