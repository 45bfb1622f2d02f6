//! SIFT feature extraction for part photographs.
//!
//! Raw image bytes are decoded, converted to a single intensity channel,
//! optionally normalised and run through a difference-of-Gaussians detector.
//! Each keypoint gets a 128-dimensional gradient histogram descriptor.

pub mod config;
pub mod descriptor;
pub mod detector;
pub mod error;
pub mod preprocessing;
pub mod pyramid;
pub mod types;

use image::{DynamicImage, GrayImage};
use partmatch_core::{Descriptor, FeatureSet, Keypoint, MIN_KEYPOINTS};
use tracing::debug;

pub use config::{Preprocessing, SiftConfig, IMAGE_BORDER, MIN_IMAGE_DIM};
pub use descriptor::DescriptorGenerator;
pub use detector::ExtremaDetector;
pub use error::{SiftError, SiftResult};
pub use preprocessing::{ImagePreprocessing, TileLayout};
pub use pyramid::ScaleSpace;
pub use types::Plane;

/// Decode raw bytes into an image
pub fn decode(image_bytes: &[u8]) -> SiftResult<DynamicImage> {
    Ok(image::load_from_memory(image_bytes)?)
}

/// High-level SIFT extractor combining detection and description
#[derive(Debug, Clone, Default)]
pub struct SiftExtractor {
    cfg: SiftConfig,
}

impl SiftExtractor {
    /// Create a new extractor with a validated configuration
    pub fn new(cfg: SiftConfig) -> SiftResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Decode `image_bytes` and extract a matchable feature set
    pub fn extract(&self, image_bytes: &[u8]) -> SiftResult<FeatureSet> {
        let img = decode(image_bytes)?;
        self.extract_image(&img)
    }

    /// Extract a matchable feature set from an already decoded image
    pub fn extract_image(&self, img: &DynamicImage) -> SiftResult<FeatureSet> {
        let (keypoints, descriptors) = self.detect_and_describe(&img.to_luma8());
        debug!(
            width = img.width(),
            height = img.height(),
            keypoints = keypoints.len(),
            "extracted SIFT features"
        );

        if descriptors.is_empty() || keypoints.len() < MIN_KEYPOINTS {
            return Err(SiftError::InsufficientFeatures {
                found: keypoints.len(),
                required: MIN_KEYPOINTS,
            });
        }

        Ok(FeatureSet::new(keypoints, descriptors)?)
    }

    /// Detect keypoints and generate descriptors in one step. Returns empty
    /// sequences for images below `MIN_IMAGE_DIM` on either side.
    pub fn detect_and_describe(&self, gray: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        if w < MIN_IMAGE_DIM || h < MIN_IMAGE_DIM {
            return (Vec::new(), Vec::new());
        }

        let prepared = if self.cfg.preprocessing.is_identity() {
            None
        } else {
            Some(ImagePreprocessing::apply(gray, &self.cfg.preprocessing))
        };
        let gray = prepared.as_ref().unwrap_or(gray);

        let base = Plane::new(w, h, gray.as_raw().iter().map(|&p| p as f32 / 255.0).collect());
        let space = ScaleSpace::build(&base, &self.cfg);

        let mut found = ExtremaDetector::new(&self.cfg, &space).detect();
        if self.cfg.max_features > 0 && found.len() > self.cfg.max_features {
            found.sort_by(|a, b| b.keypoint.response.total_cmp(&a.keypoint.response));
            found.truncate(self.cfg.max_features);
        }

        let descriptors = DescriptorGenerator::new(&space).generate_descriptors(&found);
        let keypoints = found.into_iter().map(|kp| kp.keypoint).collect();
        (keypoints, descriptors)
    }

    /// Get extractor configuration
    pub fn config(&self) -> &SiftConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    /// Dark field scattered with Gaussian blobs of varying size and
    /// brightness; a small LCG keeps the layout deterministic
    fn blob_image(width: u32, height: u32, seed: u32) -> GrayImage {
        let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32
        };

        let mut field = vec![20.0f32; (width * height) as usize];
        for _ in 0..40 {
            let cx = 12.0 + next() * (width as f32 - 24.0);
            let cy = 12.0 + next() * (height as f32 - 24.0);
            let sigma = 2.0 + next() * 3.0;
            let amplitude = 80.0 + next() * 150.0;
            for y in 0..height {
                for x in 0..width {
                    let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                    field[(y * width + x) as usize] += amplitude * (-d2 / (2.0 * sigma * sigma)).exp();
                }
            }
        }

        GrayImage::from_fn(width, height, |x, y| {
            Luma([field[(y * width + x) as usize].clamp(0.0, 255.0) as u8])
        })
    }

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_invalid_bytes_fail_to_decode() {
        let extractor = SiftExtractor::default();
        let result = extractor.extract(b"definitely not an image");
        assert!(matches!(result, Err(SiftError::Decode(_))));
    }

    #[test]
    fn test_single_pixel_image_has_insufficient_features() {
        let extractor = SiftExtractor::default();
        let bytes = png_bytes(&GrayImage::from_pixel(1, 1, Luma([200])));
        let result = extractor.extract(&bytes);
        assert!(matches!(result, Err(SiftError::InsufficientFeatures { found: 0, required: 10 })));
    }

    #[test]
    fn test_uniform_image_has_insufficient_features() {
        let extractor = SiftExtractor::default();
        let bytes = png_bytes(&GrayImage::from_pixel(96, 96, Luma([128])));
        assert!(matches!(extractor.extract(&bytes), Err(SiftError::InsufficientFeatures { .. })));
    }

    #[test]
    fn test_blob_image_yields_aligned_features() {
        let extractor = SiftExtractor::default();
        let bytes = png_bytes(&blob_image(160, 160, 7));
        let features = extractor.extract(&bytes).unwrap();

        assert!(features.len() >= MIN_KEYPOINTS);
        assert_eq!(features.keypoints().len(), features.descriptors().len());
        for (kp, desc) in features.keypoints().iter().zip(features.descriptors()) {
            assert!(kp.x >= 0.0 && kp.x < 160.0);
            assert!(kp.y >= 0.0 && kp.y < 160.0);
            assert_eq!(kp.class_id, -1);
            assert_eq!(desc.len(), partmatch_core::DESCRIPTOR_LEN);
        }
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = SiftExtractor::default();
        let bytes = png_bytes(&blob_image(128, 128, 3));
        let a = extractor.extract(&bytes).unwrap();
        let b = extractor.extract(&bytes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_features_keeps_strongest() {
        let img = blob_image(160, 160, 11);
        let all = SiftExtractor::default().detect_and_describe(&img).0;
        let limited = SiftExtractor::new(SiftConfig::default().with_max_features(10))
            .unwrap()
            .detect_and_describe(&img)
            .0;

        assert!(all.len() > 10);
        assert_eq!(limited.len(), 10);
        let weakest_kept = limited.iter().map(|k| k.response).fold(f32::MAX, f32::min);
        let stronger = all.iter().filter(|k| k.response > weakest_kept).count();
        assert!(stronger <= 10);
    }

    #[test]
    fn test_indexing_preset_extracts_features() {
        let extractor = SiftExtractor::new(SiftConfig::indexing_preset()).unwrap();
        let features = extractor.extract_image(&DynamicImage::ImageLuma8(blob_image(160, 160, 5)));
        assert!(features.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = SiftConfig { sigma: -1.0, ..SiftConfig::default() };
        assert!(matches!(SiftExtractor::new(cfg), Err(SiftError::InvalidConfig(_))));
    }

    #[test]
    fn test_default_extractor_uses_query_settings() {
        let extractor = SiftExtractor::default();
        assert_eq!(extractor.config(), &SiftConfig::default());
        assert!(extractor.config().preprocessing.is_identity());
    }
}
