//! On-disk feature store.
//!
//! Two coupled files describe the catalog's reference images: a bincode
//! features file holding one `FeatureSet` per item and a JSON mapping file
//! with one `ItemRef` per item. Position `i` in both files refers to the
//! same item. A store is loaded whole or not at all.

use partmatch_core::{FeatureSet, FeatureSetError, ItemRef, DESCRIPTOR_LEN};
use partmatch_match::{DescriptorIndex, MatcherConfig};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const FEATURES_MAGIC: [u8; 8] = *b"PMFEAT\0\0";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Features file encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Mapping file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unrecognized features file: {0}")]
    Format(String),

    #[error("Store shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid feature set at position {index}: {source}")]
    InvalidFeatureSet {
        index: usize,
        #[source]
        source: FeatureSetError,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io { path: path.to_path_buf(), source }
    }
}

/// Locations of the two store files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePaths {
    pub features: PathBuf,
    pub mapping: PathBuf,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            features: PathBuf::from("part_features.bin"),
            mapping: PathBuf::from("part_features_map.json"),
        }
    }
}

impl StorePaths {
    pub fn new(features: impl Into<PathBuf>, mapping: impl Into<PathBuf>) -> Self {
        Self { features: features.into(), mapping: mapping.into() }
    }
}

#[derive(Serialize)]
struct FeaturesFileRef<'a> {
    magic: [u8; 8],
    version: u32,
    descriptor_len: u32,
    sets: &'a [FeatureSet],
}

#[derive(Deserialize)]
struct FeaturesFile {
    magic: [u8; 8],
    version: u32,
    descriptor_len: u32,
    sets: Vec<FeatureSet>,
}

/// One catalog item with its reference features and search index
pub struct StoreEntry {
    item: ItemRef,
    features: FeatureSet,
    index: DescriptorIndex,
}

impl StoreEntry {
    pub fn item(&self) -> &ItemRef {
        &self.item
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn index(&self) -> &DescriptorIndex {
        &self.index
    }
}

/// Read-only collection of reference feature sets in catalog order
pub struct FeatureStore {
    entries: Vec<StoreEntry>,
}

impl FeatureStore {
    /// Load and validate both store files
    pub fn load(paths: &StorePaths, matcher: &MatcherConfig) -> Result<Self, StoreError> {
        let bytes = fs::read(&paths.features).map_err(|e| StoreError::io(&paths.features, e))?;
        let sets = decode_features(&bytes)?;

        let mapping = fs::read(&paths.mapping).map_err(|e| StoreError::io(&paths.mapping, e))?;
        let items: Vec<ItemRef> = serde_json::from_slice(&mapping)?;

        let store = Self::from_parts(items, sets, matcher)?;
        info!(items = store.len(), features = ?paths.features, "loaded feature store");
        Ok(store)
    }

    /// Validate mapping rows against feature sets and build search indices
    pub fn from_parts(items: Vec<ItemRef>, sets: Vec<FeatureSet>, matcher: &MatcherConfig) -> Result<Self, StoreError> {
        validate_parts(&items, &sets)?;

        let entries = items
            .into_par_iter()
            .zip(sets.into_par_iter())
            .map(|(item, features)| {
                let index = DescriptorIndex::build(features.descriptors(), matcher);
                StoreEntry { item, features, index }
            })
            .collect();

        Ok(Self { entries })
    }

    /// Write both store files for the given parts
    pub fn write(paths: &StorePaths, items: &[ItemRef], sets: &[FeatureSet]) -> Result<(), StoreError> {
        validate_parts(items, sets)?;

        let file = FeaturesFileRef {
            magic: FEATURES_MAGIC,
            version: FORMAT_VERSION,
            descriptor_len: DESCRIPTOR_LEN as u32,
            sets,
        };
        let mut writer = create(&paths.features)?;
        bincode::serialize_into(&mut writer, &file)?;
        writer.flush().map_err(|e| StoreError::io(&paths.features, e))?;

        let mut writer = create(&paths.mapping)?;
        serde_json::to_writer_pretty(&mut writer, items)?;
        writer.flush().map_err(|e| StoreError::io(&paths.mapping, e))?;

        Ok(())
    }

    pub fn entries(&self) -> &[StoreEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    File::create(path).map(BufWriter::new).map_err(|e| StoreError::io(path, e))
}

fn decode_features(bytes: &[u8]) -> Result<Vec<FeatureSet>, StoreError> {
    if bytes.len() < FEATURES_MAGIC.len() || bytes[..FEATURES_MAGIC.len()] != FEATURES_MAGIC {
        return Err(StoreError::Format("bad magic".to_string()));
    }

    let file: FeaturesFile = bincode::deserialize(bytes)?;
    if file.magic != FEATURES_MAGIC {
        return Err(StoreError::Format("bad magic".to_string()));
    }
    if file.version != FORMAT_VERSION {
        return Err(StoreError::Format(format!(
            "version {} is not supported, expected {}",
            file.version, FORMAT_VERSION
        )));
    }
    if file.descriptor_len as usize != DESCRIPTOR_LEN {
        return Err(StoreError::Format(format!(
            "descriptor length {} does not match {}",
            file.descriptor_len, DESCRIPTOR_LEN
        )));
    }
    Ok(file.sets)
}

fn validate_parts(items: &[ItemRef], sets: &[FeatureSet]) -> Result<(), StoreError> {
    if items.len() != sets.len() {
        return Err(StoreError::ShapeMismatch(format!(
            "{} mapping rows for {} feature sets",
            items.len(),
            sets.len()
        )));
    }
    for (position, item) in items.iter().enumerate() {
        if item.feature_index != position {
            return Err(StoreError::ShapeMismatch(format!(
                "{} has feature_index {} at position {}",
                item.material_number, item.feature_index, position
            )));
        }
    }
    for (index, set) in sets.iter().enumerate() {
        set.validate().map_err(|source| StoreError::InvalidFeatureSet { index, source })?;
    }
    Ok(())
}

/// Feature store as seen by the engine: either loaded or unavailable with
/// the reason it could not be loaded
#[derive(Clone)]
pub enum StoreHandle {
    Ready(Arc<FeatureStore>),
    Unavailable { reason: String },
}

impl StoreHandle {
    /// Load the store, recording any failure as `Unavailable`
    pub fn open(paths: &StorePaths, matcher: &MatcherConfig) -> Self {
        match FeatureStore::load(paths, matcher) {
            Ok(store) => StoreHandle::Ready(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "feature store unavailable");
                StoreHandle::Unavailable { reason: e.to_string() }
            }
        }
    }

    pub fn ready(&self) -> Option<&Arc<FeatureStore>> {
        match self {
            StoreHandle::Ready(store) => Some(store),
            StoreHandle::Unavailable { .. } => None,
        }
    }
}

impl From<FeatureStore> for StoreHandle {
    fn from(store: FeatureStore) -> Self {
        StoreHandle::Ready(Arc::new(store))
    }
}
