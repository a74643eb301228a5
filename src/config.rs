//! Registration settings, all derived from one voxel size.

use std::fmt;
use std::str::FromStr;

use pcd_register_core::{ensure_positive, Error, Result};
use pcd_register_registration::{
    EstimationMethod, FeatureRegistration, FgrParams, IcpParams, RansacParams,
};
use pcd_register_spatial::SearchParams;
use serde::{Deserialize, Serialize};

/// Which global solver runs on the feature matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GlobalMethod {
    #[default]
    Ransac,
    /// Fast global registration.
    Fast,
}

impl FromStr for GlobalMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RANSAC" => Ok(GlobalMethod::Ransac),
            "FAST" => Ok(GlobalMethod::Fast),
            other => Err(Error::invalid(
                "method",
                format!("expected \"RANSAC\" or \"FAST\", got {other:?}"),
            )),
        }
    }
}

impl fmt::Display for GlobalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalMethod::Ransac => f.write_str("RANSAC"),
            GlobalMethod::Fast => f.write_str("FAST"),
        }
    }
}

/// Global registration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSection {
    pub method: GlobalMethod,
    /// Inlier threshold as a multiple of the voxel size.
    pub distance_factor: f32,
    /// Solver knobs. Their distance thresholds come from `distance_factor`
    /// and must be left at their defaults.
    pub ransac: RansacParams,
    pub fgr: FgrParams,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            method: GlobalMethod::Ransac,
            distance_factor: 1.5,
            ransac: RansacParams::default(),
            fgr: FgrParams::default(),
        }
    }
}

/// ICP refinement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineSection {
    /// ICP threshold as a multiple of the voxel size.
    pub distance_factor: f32,
    pub estimation: EstimationMethod,
    /// ICP knobs. The distance threshold comes from `distance_factor` and
    /// must be left at its default.
    pub icp: IcpParams,
}

impl Default for RefineSection {
    fn default() -> Self {
        Self {
            distance_factor: 0.4,
            estimation: EstimationMethod::PointToPlane,
            icp: IcpParams::default(),
        }
    }
}

/// Full pipeline configuration.
///
/// Every search radius and threshold scales with `voxel_size`: normals use a
/// radius of `2v`, FPFH `5v`, the global solver `1.5v` and ICP `0.4v` with the
/// default factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub voxel_size: f32,
    pub normal_radius_factor: f32,
    pub normal_max_nn: usize,
    pub feature_radius_factor: f32,
    pub feature_max_nn: usize,
    /// Neighbours per point in the normal orientation graph.
    pub orientation_k: usize,
    pub global: GlobalSection,
    pub refine: RefineSection,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.05,
            normal_radius_factor: 2.0,
            normal_max_nn: 30,
            feature_radius_factor: 5.0,
            feature_max_nn: 100,
            orientation_k: 10,
            global: GlobalSection::default(),
            refine: RefineSection::default(),
        }
    }
}

impl RegistrationConfig {
    /// Defaults with another voxel size.
    pub fn with_voxel_size(voxel_size: f32) -> Self {
        Self {
            voxel_size,
            ..Self::default()
        }
    }

    /// Parse from JSON and validate; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::invalid("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive("voxel_size", self.voxel_size)?;
        ensure_positive("normal_radius_factor", self.normal_radius_factor)?;
        ensure_positive("feature_radius_factor", self.feature_radius_factor)?;
        ensure_positive("global.distance_factor", self.global.distance_factor)?;
        ensure_positive("refine.distance_factor", self.refine.distance_factor)?;
        if self.orientation_k == 0 {
            return Err(Error::invalid("orientation_k", "must be >= 1"));
        }
        for (name, value, default, factor) in [
            (
                "global.ransac.max_correspondence_distance",
                self.global.ransac.max_correspondence_distance,
                RansacParams::default().max_correspondence_distance,
                "global.distance_factor",
            ),
            (
                "global.fgr.maximum_correspondence_distance",
                self.global.fgr.maximum_correspondence_distance,
                FgrParams::default().maximum_correspondence_distance,
                "global.distance_factor",
            ),
            (
                "refine.icp.max_correspondence_distance",
                self.refine.icp.max_correspondence_distance,
                IcpParams::default().max_correspondence_distance,
                "refine.distance_factor",
            ),
        ] {
            if value != default {
                return Err(Error::invalid(
                    name,
                    format!("derived from voxel_size * {factor}; set the factor instead"),
                ));
            }
        }
        self.normal_search().validate()?;
        self.feature_search().validate()?;
        self.ransac_params().validate()?;
        self.fgr_params().validate()?;
        self.icp_params().validate()
    }

    pub fn normal_search(&self) -> SearchParams {
        SearchParams::hybrid(self.voxel_size * self.normal_radius_factor, self.normal_max_nn)
    }

    pub fn feature_search(&self) -> SearchParams {
        SearchParams::hybrid(self.voxel_size * self.feature_radius_factor, self.feature_max_nn)
    }

    pub fn global_distance(&self) -> f32 {
        self.voxel_size * self.global.distance_factor
    }

    pub fn refine_distance(&self) -> f32 {
        self.voxel_size * self.refine.distance_factor
    }

    pub fn ransac_params(&self) -> RansacParams {
        RansacParams {
            max_correspondence_distance: self.global_distance(),
            ..self.global.ransac.clone()
        }
    }

    pub fn fgr_params(&self) -> FgrParams {
        FgrParams {
            maximum_correspondence_distance: self.global_distance(),
            ..self.global.fgr.clone()
        }
    }

    pub fn icp_params(&self) -> IcpParams {
        IcpParams {
            max_correspondence_distance: self.refine_distance(),
            ..self.refine.icp.clone()
        }
    }

    /// The configured global solver.
    pub fn global_solver(&self) -> Box<dyn FeatureRegistration> {
        match self.global.method {
            GlobalMethod::Ransac => Box::new(self.ransac_params()),
            GlobalMethod::Fast => Box::new(self.fgr_params()),
        }
    }
}
