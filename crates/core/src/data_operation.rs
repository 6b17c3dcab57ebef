//! The step-carried message describing the transformation a WorkItem performs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AveragingMethod {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Dimensions {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScaleExtent {
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DataOperation {
    pub collections: Vec<String>,
    #[serde(default)]
    pub granule_ids: Vec<String>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub scale_extent: Option<ScaleExtent>,
    #[serde(default)]
    pub scale_size: Option<Dimensions>,
    #[serde(default)]
    pub output_size: Option<Dimensions>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub averaging_method: Option<AveragingMethod>,
    #[serde(default)]
    pub extend_dimensions: Vec<String>,
    #[serde(default)]
    pub force_async: bool,
    #[serde(default)]
    pub concatenate: bool,
    #[serde(default)]
    pub skip_preview: bool,
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default)]
    pub pixel_subset: bool,
    /// Only field rewritten in place on resume/skip-preview to refresh
    /// credentials; every other field is immutable once a WorkflowStep is
    /// created.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl DataOperation {
    /// Returns a clone with a freshly issued access token; used when a job is
    /// resumed from PAUSED or skips its preview step.
    pub fn with_refreshed_token(&self, access_token: impl Into<String>) -> Self {
        let mut cloned = self.clone();
        cloned.access_token = Some(access_token.into());
        cloned
    }
}
