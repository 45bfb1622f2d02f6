use partmatch_core::FeatureSetError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SiftError {
    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Insufficient features: found {found} keypoints, need at least {required}")]
    InsufficientFeatures { found: usize, required: usize },

    #[error("Invalid SIFT configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed feature set: {0}")]
    InvalidFeatures(#[from] FeatureSetError),
}

impl From<image::ImageError> for SiftError {
    fn from(err: image::ImageError) -> Self {
        SiftError::Decode(err.to_string())
    }
}

pub type SiftResult<T> = Result<T, SiftError>;
