//! Turning descriptor sets into a ranked identification.
//!
//! `matcher` finds ratio-test correspondences, `scorer` maps their count to
//! a confidence, `selector` applies the acceptance policy and `fallback`
//! produces the placeholder ranking when nothing else is possible.

pub mod fallback;
pub mod matcher;
pub mod scorer;
pub mod selector;

pub use fallback::{fallback, FALLBACK_REASON, FALLBACK_SLOTS};
pub use matcher::{match_descriptors, Correspondence, DescriptorIndex, MatcherConfig, Neighbor, SearchStrategy};
pub use scorer::{match_ratio, score, sigmoid};
pub use selector::{select, ScoredItem};
