//! Offline construction of the feature store from a directory of reference
//! images. The file stem of each image is its material number.

use partmatch_core::{FeatureSet, ItemRef};
use partmatch_sift::SiftExtractor;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::IndexingConfig;
use crate::store::{FeatureStore, StoreError, StorePaths};

/// Outcome of an indexing run
#[derive(Debug, Default)]
pub struct IndexSummary {
    pub indexed: usize,
    /// Images left out of the store, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Image files below `dir`, sorted by path
pub fn collect_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, StoreError> {
    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| StoreError::Io { path: current.clone(), source })?;
        for entry in entries {
            let path = entry.map_err(|source| StoreError::Io { path: current.clone(), source })?.path();
            if path.is_dir() {
                pending.push(path);
            } else if has_extension(&path, extensions) {
                images.push(path);
            }
        }
    }

    images.sort();
    Ok(images)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// Extract features for every image and assemble aligned mapping rows and
/// feature sets. Images that cannot be read or yield too few keypoints are
/// skipped.
pub fn build_parts(images: &[PathBuf], extractor: &SiftExtractor) -> (Vec<ItemRef>, Vec<FeatureSet>, IndexSummary) {
    let extracted: Vec<_> = images
        .par_iter()
        .map(|path| {
            let features = fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| extractor.extract(&bytes).map_err(|e| e.to_string()));
            (path, features)
        })
        .collect();

    let mut items = Vec::new();
    let mut sets = Vec::new();
    let mut summary = IndexSummary::default();
    let mut seen = HashSet::new();

    for (path, features) in extracted {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            summary.skipped.push((path.clone(), "file name is not valid UTF-8".to_string()));
            continue;
        };
        if !seen.insert(stem.to_string()) {
            summary.skipped.push((path.clone(), format!("duplicate material number {}", stem)));
            continue;
        }

        match features {
            Ok(features) => {
                items.push(ItemRef {
                    material_number: stem.to_string(),
                    description: format!("Part {}", stem),
                    category: None,
                    image_path: Some(path.to_string_lossy().into_owned()),
                    feature_index: sets.len(),
                });
                sets.push(features);
            }
            Err(reason) => {
                seen.remove(stem);
                warn!(path = ?path, %reason, "skipping image");
                summary.skipped.push((path.clone(), reason));
            }
        }
    }

    summary.indexed = sets.len();
    (items, sets, summary)
}

/// Index every image below `dir` and write the store files
pub fn index_directory(dir: &Path, paths: &StorePaths, cfg: &IndexingConfig) -> Result<IndexSummary, StoreError> {
    let extractor = SiftExtractor::new(cfg.sift.clone()).map_err(|e| StoreError::Format(e.to_string()))?;
    let images = collect_images(dir, &cfg.extensions)?;
    info!(images = images.len(), dir = ?dir, "indexing reference images");

    let (items, sets, summary) = build_parts(&images, &extractor);
    FeatureStore::write(paths, &items, &sets)?;

    info!(indexed = summary.indexed, skipped = summary.skipped.len(), "feature store written");
    Ok(summary)
}
