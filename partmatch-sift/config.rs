use serde::{Deserialize, Serialize};
use crate::error::{SiftError, SiftResult};

/// Images smaller than this on either side yield no keypoints
pub const MIN_IMAGE_DIM: usize = 16;

/// Width of the border ignored during extremum search
pub const IMAGE_BORDER: usize = 5;

/// Intensity normalisation applied before detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preprocessing {
    /// Global histogram equalisation
    pub equalize_histogram: bool,
    /// Gaussian smoothing applied after equalisation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur_sigma: Option<f32>,
    /// Contrast limited adaptive histogram equalisation
    pub clahe: bool,
    /// Tiles per axis
    pub clahe_grid: usize,
    pub clahe_clip_limit: f32,
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self {
            equalize_histogram: false,
            blur_sigma: None,
            clahe: false,
            clahe_grid: 8,
            clahe_clip_limit: 2.0,
        }
    }
}

impl Preprocessing {
    pub fn is_identity(&self) -> bool {
        !self.equalize_histogram && self.blur_sigma.is_none() && !self.clahe
    }
}

/// SIFT detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    /// Intervals per octave
    pub n_layers: usize,
    /// Blur of the base level
    pub sigma: f32,
    /// Blur already present in the input image
    pub assumed_blur: f32,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    pub max_octaves: usize,
    /// Keep only the strongest N keypoints, 0 keeps all
    pub max_features: usize,
    pub preprocessing: Preprocessing,
}

impl Default for SiftConfig {
    fn default() -> Self {
        Self {
            n_layers: 3,
            sigma: 1.6,
            assumed_blur: 0.5,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            max_octaves: 8,
            max_features: 0,
            preprocessing: Preprocessing::default(),
        }
    }
}

impl SiftConfig {
    /// Settings for building catalog features: lighting is normalised before
    /// detection so stored sets are robust to exposure differences
    pub fn indexing_preset() -> Self {
        Self {
            preprocessing: Preprocessing {
                equalize_histogram: true,
                blur_sigma: Some(0.8),
                clahe: true,
                ..Preprocessing::default()
            },
            ..Self::default()
        }
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = max_features;
        self
    }

    /// Number of octaves for an image of the given size
    pub fn octave_count(&self, width: usize, height: usize) -> usize {
        let min_dim = width.min(height);
        if min_dim < MIN_IMAGE_DIM {
            return 0;
        }
        let levels = (min_dim as f32).log2().floor() as usize;
        levels.saturating_sub(2).clamp(1, self.max_octaves)
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "SiftConfig: layers={}, sigma={}, contrast={}, edge={}, max_octaves={}, preprocessing=[EQ:{}, Blur:{:?}, CLAHE:{}]",
            self.n_layers, self.sigma, self.contrast_threshold, self.edge_threshold, self.max_octaves,
            self.preprocessing.equalize_histogram, self.preprocessing.blur_sigma, self.preprocessing.clahe
        )
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> SiftResult<()> {
        if self.n_layers == 0 {
            return Err(SiftError::InvalidConfig("n_layers must be at least 1".into()));
        }
        if !(self.sigma > 0.0) {
            return Err(SiftError::InvalidConfig(format!("sigma {} must be positive", self.sigma)));
        }
        if self.assumed_blur < 0.0 || self.assumed_blur >= self.sigma {
            return Err(SiftError::InvalidConfig(format!(
                "assumed_blur {} must be in [0, sigma)",
                self.assumed_blur
            )));
        }
        if !(self.contrast_threshold > 0.0) {
            return Err(SiftError::InvalidConfig(format!(
                "contrast_threshold {} must be positive",
                self.contrast_threshold
            )));
        }
        if !(self.edge_threshold > 1.0) {
            return Err(SiftError::InvalidConfig(format!(
                "edge_threshold {} must be greater than 1",
                self.edge_threshold
            )));
        }
        if self.max_octaves == 0 {
            return Err(SiftError::InvalidConfig("max_octaves must be at least 1".into()));
        }
        if let Some(sigma) = self.preprocessing.blur_sigma {
            if !(sigma > 0.0) {
                return Err(SiftError::InvalidConfig(format!("blur_sigma {} must be positive", sigma)));
            }
        }
        if self.preprocessing.clahe && self.preprocessing.clahe_grid == 0 {
            return Err(SiftError::InvalidConfig("clahe_grid must be at least 1".into()));
        }
        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialize from TOML string
    pub fn from_toml(toml_str: &str) -> SiftResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| SiftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> SiftResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SiftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
