use pcd_register_core::{ensure_positive, Error, Result};

/// Neighbourhood definition shared by normal estimation and feature
/// computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchParams {
    /// The `k` nearest points.
    Knn { k: usize },
    /// Every point within `radius`.
    Radius { radius: f32 },
    /// At most `max_nn` nearest points, all within `radius`.
    Hybrid { radius: f32, max_nn: usize },
}

impl SearchParams {
    pub fn knn(k: usize) -> Self {
        SearchParams::Knn { k }
    }

    pub fn radius(radius: f32) -> Self {
        SearchParams::Radius { radius }
    }

    pub fn hybrid(radius: f32, max_nn: usize) -> Self {
        SearchParams::Hybrid { radius, max_nn }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            SearchParams::Knn { k } => ensure_nonzero("k", k),
            SearchParams::Radius { radius } => ensure_positive("radius", radius),
            SearchParams::Hybrid { radius, max_nn } => {
                ensure_positive("radius", radius)?;
                ensure_nonzero("max_nn", max_nn)
            }
        }
    }
}

fn ensure_nonzero(name: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        Err(Error::invalid(name, "at least one neighbour must be requested"))
    } else {
        Ok(())
    }
}
