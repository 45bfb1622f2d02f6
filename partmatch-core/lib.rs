use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a SIFT descriptor: 4x4 spatial cells x 8 orientation bins
pub const DESCRIPTOR_LEN: usize = 128;

/// Feature sets with fewer keypoints than this are never matched
pub const MIN_KEYPOINTS: usize = 10;

/// Lowe ratio: accept a correspondence when `d1 < ratio * d2`
pub const DEFAULT_RATIO_THRESHOLD: f32 = 0.8;
/// Items scoring below this are discarded by the selector
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;
/// A top item scoring above this is returned alone
pub const DEFAULT_SINGLE_MATCH_CONFIDENCE: f64 = 0.9;
pub const DEFAULT_SIGMOID_STEEPNESS: f64 = 8.0;
pub const DEFAULT_SIGMOID_MIDPOINT: f64 = 0.15;
/// Upper bound of items surfaced when no single item is near-certain
pub const DEFAULT_MAX_RESULTS: usize = 2;
pub const DEFAULT_FALLBACK_COUNT: usize = 3;

/// Scale-invariant keypoint. Coordinates are in full-resolution pixels,
/// `angle` is in degrees within `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 1.0,
            angle: 0.0,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }
}

/// 128-dimensional gradient histogram, values in `[0, 255]`
pub type Descriptor = Vec<f32>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureSetError {
    #[error("keypoint/descriptor count mismatch: {keypoints} keypoints, {descriptors} descriptors")]
    CountMismatch { keypoints: usize, descriptors: usize },

    #[error("descriptor {index} has length {actual}, expected {expected}")]
    DescriptorLength { index: usize, expected: usize, actual: usize },
}

/// Keypoints and their descriptors for one image, aligned by index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor>) -> Result<Self, FeatureSetError> {
        let set = Self { keypoints, descriptors };
        set.validate()?;
        Ok(set)
    }

    /// Checks the alignment invariant and descriptor dimensionality.
    /// Deserialized sets bypass `new`, so loaders call this explicitly.
    pub fn validate(&self) -> Result<(), FeatureSetError> {
        if self.keypoints.len() != self.descriptors.len() {
            return Err(FeatureSetError::CountMismatch {
                keypoints: self.keypoints.len(),
                descriptors: self.descriptors.len(),
            });
        }
        if let Some((index, d)) = self
            .descriptors
            .iter()
            .enumerate()
            .find(|(_, d)| d.len() != DESCRIPTOR_LEN)
        {
            return Err(FeatureSetError::DescriptorLength {
                index,
                expected: DESCRIPTOR_LEN,
                actual: d.len(),
            });
        }
        Ok(())
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// True when the set has enough keypoints to produce a meaningful match ratio
    pub fn is_matchable(&self) -> bool {
        self.len() >= MIN_KEYPOINTS
    }
}

/// Catalog record owned by the persistence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub material_number: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl CatalogItem {
    pub fn new(material_number: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            material_number: material_number.into(),
            description: description.into(),
            category: None,
            manufacturer: None,
            image_path: None,
        }
    }
}

/// One row of the feature store mapping file. `feature_index` is the
/// position of the item's feature set in the features file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub material_number: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub feature_index: usize,
}

impl From<&ItemRef> for CatalogItem {
    fn from(item: &ItemRef) -> Self {
        Self {
            material_number: item.material_number.clone(),
            description: item.description.clone(),
            category: item.category.clone(),
            manufacturer: None,
            image_path: item.image_path.clone(),
        }
    }
}

/// Ranked identification result. Serialized with the field names the
/// API layer expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(rename = "material_number")]
    pub item_id: String,
    pub confidence_score: f64,
    #[serde(rename = "match_reason")]
    pub explanation: String,
}

/// Empirical thresholds that turn match counts into a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    pub ratio_threshold: f32,
    pub min_confidence: f64,
    pub single_match_confidence: f64,
    pub sigmoid_steepness: f64,
    pub sigmoid_midpoint: f64,
    pub max_results: usize,
    pub fallback_count: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            ratio_threshold: DEFAULT_RATIO_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            single_match_confidence: DEFAULT_SINGLE_MATCH_CONFIDENCE,
            sigmoid_steepness: DEFAULT_SIGMOID_STEEPNESS,
            sigmoid_midpoint: DEFAULT_SIGMOID_MIDPOINT,
            max_results: DEFAULT_MAX_RESULTS,
            fallback_count: DEFAULT_FALLBACK_COUNT,
        }
    }
}

impl MatchPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold <= 1.0) {
            return Err(format!("ratio_threshold {} must be in (0, 1]", self.ratio_threshold));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("min_confidence {} must be in [0, 1]", self.min_confidence));
        }
        if self.single_match_confidence < self.min_confidence || self.single_match_confidence > 1.0 {
            return Err(format!(
                "single_match_confidence {} must be in [min_confidence, 1]",
                self.single_match_confidence
            ));
        }
        if self.sigmoid_steepness <= 0.0 {
            return Err(format!("sigmoid_steepness {} must be positive", self.sigmoid_steepness));
        }
        if self.max_results == 0 || self.max_results > DEFAULT_MAX_RESULTS {
            return Err(format!("max_results {} must be in [1, {}]", self.max_results, DEFAULT_MAX_RESULTS));
        }
        if self.fallback_count > 3 {
            return Err(format!("fallback_count {} exceeds 3 placeholder slots", self.fallback_count));
        }
        Ok(())
    }
}

/// Number of worker threads used when none is configured
pub fn default_threads() -> usize {
    num_cpus::get().max(1)
}

/// Initialize Rayon thread pool with the specified number of threads
pub fn init_thread_pool(n_threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build_global()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(n: usize) -> Vec<Descriptor> {
        (0..n).map(|i| vec![i as f32; DESCRIPTOR_LEN]).collect()
    }

    #[test]
    fn test_feature_set_alignment() {
        let kps = vec![Keypoint::new(1.0, 2.0); 3];
        let result = FeatureSet::new(kps, descriptors(2));
        assert!(matches!(result, Err(FeatureSetError::CountMismatch { keypoints: 3, descriptors: 2 })));
    }

    #[test]
    fn test_feature_set_descriptor_length() {
        let kps = vec![Keypoint::new(1.0, 2.0); 2];
        let mut descs = descriptors(2);
        descs[1].truncate(64);
        let result = FeatureSet::new(kps, descs);
        assert!(matches!(result, Err(FeatureSetError::DescriptorLength { index: 1, actual: 64, .. })));
    }

    #[test]
    fn test_matchable_threshold() {
        let small = FeatureSet::new(vec![Keypoint::new(0.0, 0.0); 9], descriptors(9)).unwrap();
        assert!(!small.is_matchable());

        let enough = FeatureSet::new(vec![Keypoint::new(0.0, 0.0); 10], descriptors(10)).unwrap();
        assert!(enough.is_matchable());
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = MatchPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.ratio_threshold, 0.8);
        assert_eq!(policy.min_confidence, 0.6);
        assert_eq!(policy.single_match_confidence, 0.9);
    }

    #[test]
    fn test_policy_rejects_inverted_thresholds() {
        let policy = MatchPolicy {
            single_match_confidence: 0.5,
            ..MatchPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_result_cap() {
        let one = MatchPolicy { max_results: 1, ..MatchPolicy::default() };
        assert!(one.validate().is_ok());

        let none = MatchPolicy { max_results: 0, ..MatchPolicy::default() };
        assert!(none.validate().is_err());

        let three = MatchPolicy { max_results: 3, ..MatchPolicy::default() };
        assert!(three.validate().is_err());
    }
}
