//! Query analysis: extraction, catalog scan, selection and fallback.

use partmatch_core::{CatalogItem, FeatureSet, MatchPolicy, MatchResult, MIN_KEYPOINTS};
use partmatch_match::{fallback, score, select, ScoredItem};
use partmatch_sift::{SiftError, SiftExtractor};
use rayon::prelude::*;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig, StrategyConfig};
use crate::remote::RemoteAnalyzer;
use crate::store::{FeatureStore, StoreHandle};

/// Reasons an analysis produced no real ranking. `analyze` recovers from
/// all of them with the fallback ranking.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzeError {
    #[error("Query image could not be decoded: {0}")]
    Decode(String),

    #[error("Query image has {found} keypoints, need at least {required}")]
    InsufficientFeatures { found: usize, required: usize },

    #[error("Feature store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("No catalog item reached the confidence threshold")]
    NoConfidentMatch,

    #[error("Remote analysis failed: {0}")]
    Remote(String),

    #[error("Remote analysis timed out after {0:?}")]
    Timeout(Duration),
}

impl From<SiftError> for AnalyzeError {
    fn from(err: SiftError) -> Self {
        match err {
            SiftError::InsufficientFeatures { found, required } => AnalyzeError::InsufficientFeatures { found, required },
            SiftError::Decode(msg) => AnalyzeError::Decode(msg),
            other => AnalyzeError::Decode(other.to_string()),
        }
    }
}

/// Identifies which catalog item a photo shows
pub trait Analyzer {
    /// Ranked candidates for `image`. Never fails: when no real analysis
    /// is possible the fallback ranking over `catalog` is returned.
    fn analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Vec<MatchResult>;
}

/// Return the ranking, or log the failure and fall back
pub(crate) fn recover(
    outcome: Result<Vec<MatchResult>, AnalyzeError>,
    catalog: &[CatalogItem],
    policy: &MatchPolicy,
) -> Vec<MatchResult> {
    match outcome {
        Ok(results) => results,
        Err(e) => {
            warn!(error = %e, "using fallback analysis");
            fallback(catalog, policy)
        }
    }
}

/// SIFT matching against the local feature store
pub struct LocalAnalyzer {
    extractor: SiftExtractor,
    store: StoreHandle,
    policy: MatchPolicy,
}

impl LocalAnalyzer {
    pub fn new(extractor: SiftExtractor, store: StoreHandle, policy: MatchPolicy) -> Self {
        Self { extractor, store, policy }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Like `analyze`, but reports why no ranking was produced
    pub fn try_analyze(&self, image: &[u8]) -> Result<Vec<MatchResult>, AnalyzeError> {
        let store = match &self.store {
            StoreHandle::Ready(store) => store,
            StoreHandle::Unavailable { reason } => return Err(AnalyzeError::StoreUnavailable(reason.clone())),
        };

        let query = self.extractor.extract(image)?;
        info!(keypoints = query.len(), items = store.len(), "matching query against feature store");

        let scored = self.score_store(store, &query);
        let results = select(scored, &self.policy);
        if results.is_empty() {
            return Err(AnalyzeError::NoConfidentMatch);
        }
        Ok(results)
    }

    /// Score every matchable store entry. Results keep store order so the
    /// selector's stable sort breaks ties by ingestion order.
    fn score_store(&self, store: &FeatureStore, query: &FeatureSet) -> Vec<ScoredItem> {
        store
            .entries()
            .par_iter()
            .filter(|entry| entry.features().len() >= MIN_KEYPOINTS)
            .map(|entry| {
                let correspondences = entry
                    .index()
                    .match_query(query.descriptors(), self.policy.ratio_threshold)
                    .len();
                let stored_keypoints = entry.features().len();
                let confidence = score(correspondences, query.len(), stored_keypoints, &self.policy);
                debug!(
                    material_number = %entry.item().material_number,
                    correspondences,
                    confidence,
                    "scored store entry"
                );
                ScoredItem {
                    item_id: entry.item().material_number.clone(),
                    confidence,
                    query_keypoints: query.len(),
                    stored_keypoints,
                }
            })
            .collect()
    }
}

impl Analyzer for LocalAnalyzer {
    fn analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Vec<MatchResult> {
        recover(self.try_analyze(image), catalog, &self.policy)
    }
}

/// The analysis strategy selected by configuration
pub enum MatchingEngine {
    Local(LocalAnalyzer),
    Remote(RemoteAnalyzer),
}

impl MatchingEngine {
    /// Build the configured strategy. The local strategy opens the feature
    /// store here; an unreadable store is not an error.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        match &config.strategy {
            StrategyConfig::Local => {
                let extractor = SiftExtractor::new(config.sift.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
                let store = StoreHandle::open(&config.store, &config.matcher);
                Ok(MatchingEngine::Local(LocalAnalyzer::new(extractor, store, config.policy.clone())))
            }
            StrategyConfig::Remote(remote) => {
                let analyzer = RemoteAnalyzer::new(remote.clone(), config.policy.clone())?;
                Ok(MatchingEngine::Remote(analyzer))
            }
        }
    }

    /// Catalog implied by the feature store, used when no catalog is given
    pub fn store_catalog(&self) -> Vec<CatalogItem> {
        match self {
            MatchingEngine::Local(local) => local
                .store()
                .ready()
                .map(|store| store.entries().iter().map(|e| CatalogItem::from(e.item())).collect())
                .unwrap_or_default(),
            MatchingEngine::Remote(_) => Vec::new(),
        }
    }

    pub fn try_analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Result<Vec<MatchResult>, AnalyzeError> {
        match self {
            MatchingEngine::Local(local) => local.try_analyze(image),
            MatchingEngine::Remote(remote) => remote.try_analyze(image, catalog),
        }
    }
}

impl Analyzer for MatchingEngine {
    fn analyze(&self, image: &[u8], catalog: &[CatalogItem]) -> Vec<MatchResult> {
        match self {
            MatchingEngine::Local(local) => local.analyze(image, catalog),
            MatchingEngine::Remote(remote) => remote.analyze(image, catalog),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StorePaths;
    use image::{GrayImage, ImageFormat, Luma};
    use partmatch_core::ItemRef;
    use partmatch_match::{MatcherConfig, FALLBACK_REASON};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Dark field with Gaussian blobs placed by a small LCG
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

    fn catalog() -> Vec<CatalogItem> {
        vec![
            CatalogItem::new("BRG-6204", "Deep groove ball bearing"),
            CatalogItem::new("SEAL-35", "Shaft seal 35 mm"),
            CatalogItem::new("VB-A42", "V-belt A42"),
            CatalogItem::new("FLT-100", "Oil filter"),
        ]
    }

    fn local_analyzer(store: StoreHandle) -> LocalAnalyzer {
        LocalAnalyzer::new(SiftExtractor::default(), store, MatchPolicy::default())
    }

    /// Store with one entry per seed, each built from its own blob image
    fn store_from_seeds(seeds: &[(&str, u32)]) -> StoreHandle {
        let extractor = SiftExtractor::default();
        let mut items = Vec::new();
        let mut sets = Vec::new();
        for (i, (material_number, seed)) in seeds.iter().enumerate() {
            let features = extractor.extract(&png_bytes(&blob_image(160, 160, *seed))).unwrap();
            items.push(ItemRef {
                material_number: material_number.to_string(),
                description: format!("Part {}", material_number),
                category: None,
                image_path: None,
                feature_index: i,
            });
            sets.push(features);
        }
        FeatureStore::from_parts(items, sets, &MatcherConfig::default()).unwrap().into()
    }

    fn assert_fallback(results: &[MatchResult]) {
        let ids: Vec<&str> = results.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["BRG-6204", "SEAL-35", "VB-A42"]);
        let scores: Vec<f64> = results.iter().map(|r| r.confidence_score).collect();
        assert_eq!(scores, vec![0.3, 0.2, 0.1]);
        assert!(results.iter().all(|r| r.explanation == FALLBACK_REASON));
    }

    #[test]
    fn test_identical_image_is_single_confident_match() {
        let analyzer = local_analyzer(store_from_seeds(&[("BRG-6204", 7), ("SEAL-35", 21)]));
        let query = png_bytes(&blob_image(160, 160, 21));

        let results = analyzer.try_analyze(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item_id, "SEAL-35");
        assert!(results[0].confidence_score > 0.9);
        assert!(results[0].explanation.starts_with("SIFT feature matching: "));

        assert_eq!(analyzer.analyze(&query, &catalog()), results);
    }

    #[test]
    fn test_missing_store_always_falls_back() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path().join("none.bin"), dir.path().join("none.json"));
        let analyzer = local_analyzer(StoreHandle::open(&paths, &MatcherConfig::default()));

        let valid = png_bytes(&blob_image(160, 160, 3));
        assert!(matches!(analyzer.try_analyze(&valid), Err(AnalyzeError::StoreUnavailable(_))));
        assert_fallback(&analyzer.analyze(&valid, &catalog()));
        assert_fallback(&analyzer.analyze(b"garbage", &catalog()));
    }

    #[test]
    fn test_undecodable_query_falls_back() {
        let analyzer = local_analyzer(store_from_seeds(&[("BRG-6204", 7)]));
        assert!(matches!(analyzer.try_analyze(b"not an image"), Err(AnalyzeError::Decode(_))));
        assert_fallback(&analyzer.analyze(b"not an image", &catalog()));
    }

    #[test]
    fn test_single_pixel_query_falls_back() {
        let analyzer = local_analyzer(store_from_seeds(&[("BRG-6204", 7)]));
        let tiny = png_bytes(&GrayImage::from_pixel(1, 1, Luma([90])));

        assert_eq!(
            analyzer.try_analyze(&tiny),
            Err(AnalyzeError::InsufficientFeatures { found: 0, required: MIN_KEYPOINTS })
        );
        assert_fallback(&analyzer.analyze(&tiny, &catalog()));
    }

    #[test]
    fn test_fallback_on_empty_catalog_is_empty() {
        let analyzer = local_analyzer(StoreHandle::Unavailable { reason: "not loaded".to_string() });
        assert!(analyzer.analyze(b"anything", &[]).is_empty());
    }

    #[test]
    fn test_no_confident_match_falls_back() {
        // A near-perfect match still stays below a threshold of 1.0
        let policy = MatchPolicy {
            min_confidence: 1.0,
            single_match_confidence: 1.0,
            ..MatchPolicy::default()
        };
        let analyzer = LocalAnalyzer::new(SiftExtractor::default(), store_from_seeds(&[("BRG-6204", 7)]), policy);
        let query = png_bytes(&blob_image(160, 160, 7));

        assert_eq!(analyzer.try_analyze(&query), Err(AnalyzeError::NoConfidentMatch));
        assert_fallback(&analyzer.analyze(&query, &catalog()));
    }

    #[test]
    fn test_sparse_store_entry_is_never_scored() {
        let query_bytes = png_bytes(&blob_image(160, 160, 7));
        let query = SiftExtractor::default().extract(&query_bytes).unwrap();

        // Nine exact copies of query descriptors would otherwise score near 1.0
        let sparse = MIN_KEYPOINTS - 1;
        let features = FeatureSet::new(
            query.keypoints()[..sparse].to_vec(),
            query.descriptors()[..sparse].to_vec(),
        )
        .unwrap();
        let item = ItemRef {
            material_number: "SPARSE-9".to_string(),
            description: "Part SPARSE-9".to_string(),
            category: None,
            image_path: None,
            feature_index: 0,
        };
        let store = FeatureStore::from_parts(vec![item], vec![features], &MatcherConfig::default()).unwrap();
        let analyzer = local_analyzer(store.into());

        assert_eq!(analyzer.try_analyze(&query_bytes), Err(AnalyzeError::NoConfidentMatch));
        let results = analyzer.analyze(&query_bytes, &catalog());
        assert!(results.iter().all(|r| r.item_id != "SPARSE-9"));
        assert_fallback(&results);
    }

    #[test]
    fn test_engine_from_default_config_without_store() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.store = StorePaths::new(dir.path().join("f.bin"), dir.path().join("m.json"));

        let engine = MatchingEngine::from_config(&config).unwrap();
        assert!(matches!(engine, MatchingEngine::Local(_)));
        assert!(engine.store_catalog().is_empty());
        assert_fallback(&engine.analyze(b"bytes", &catalog()));
    }
}
