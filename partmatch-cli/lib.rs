//! Feature store, analysis engine and offline indexer for spare-part
//! identification.

pub mod config;
pub mod engine;
pub mod indexer;
pub mod remote;
pub mod store;

pub use config::{ConfigError, EngineConfig, IndexingConfig, RemoteConfig, StrategyConfig};
pub use engine::{AnalyzeError, Analyzer, LocalAnalyzer, MatchingEngine};
pub use indexer::{build_parts, collect_images, index_directory, IndexSummary};
pub use remote::RemoteAnalyzer;
pub use store::{FeatureStore, StoreEntry, StoreError, StoreHandle, StorePaths};

pub use partmatch_core::{CatalogItem, MatchPolicy, MatchResult};
pub use partmatch_sift::{SiftConfig, SiftExtractor};
