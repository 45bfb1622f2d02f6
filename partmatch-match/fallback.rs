use partmatch_core::{CatalogItem, MatchPolicy, MatchResult};

/// Placeholder slots; confidences count down from `FALLBACK_SLOTS / 10`
pub const FALLBACK_SLOTS: usize = 3;

pub const FALLBACK_REASON: &str = "Fallback analysis - please verify manually";

/// Low-confidence placeholder ranking used whenever no real analysis is
/// possible: the first catalog items in order, scored 0.3, 0.2, 0.1
pub fn fallback(catalog: &[CatalogItem], policy: &MatchPolicy) -> Vec<MatchResult> {
    catalog
        .iter()
        .take(policy.fallback_count.min(FALLBACK_SLOTS))
        .enumerate()
        .map(|(i, item)| MatchResult {
            item_id: item.material_number.clone(),
            confidence_score: (FALLBACK_SLOTS - i) as f64 / 10.0,
            explanation: FALLBACK_REASON.to_string(),
        })
        .collect()
}
