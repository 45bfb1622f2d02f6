use partmatch_core::{MatchPolicy, MatchResult};
use tracing::debug;

/// Confidence for one catalog item along with the keypoint counts it was
/// computed from
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item_id: String,
    pub confidence: f64,
    pub query_keypoints: usize,
    pub stored_keypoints: usize,
}

impl ScoredItem {
    pub fn explanation(&self) -> String {
        format!(
            "SIFT feature matching: {:.3} ({} vs {} keypoints)",
            self.confidence, self.query_keypoints, self.stored_keypoints
        )
    }

    fn into_result(self) -> MatchResult {
        MatchResult {
            explanation: self.explanation(),
            item_id: self.item_id,
            confidence_score: self.confidence,
        }
    }
}

/// Turn scored items into the final ranking.
///
/// Items below `min_confidence` are dropped. The rest are sorted by
/// confidence, highest first, keeping input order among equal scores. A top
/// score above `single_match_confidence` suppresses every alternative;
/// otherwise at most `max_results` items are returned.
pub fn select(mut scored: Vec<ScoredItem>, policy: &MatchPolicy) -> Vec<MatchResult> {
    let candidates = scored.len();
    scored.retain(|item| item.confidence >= policy.min_confidence);
    debug!(candidates, confident = scored.len(), "selecting matches");
    if scored.is_empty() {
        return Vec::new();
    }

    scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let keep = if scored[0].confidence > policy.single_match_confidence {
        1
    } else {
        policy.max_results
    };
    scored.truncate(keep);

    scored.into_iter().map(ScoredItem::into_result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, confidence: f64) -> ScoredItem {
        ScoredItem {
            item_id: id.to_string(),
            confidence,
            query_keypoints: 150,
            stored_keypoints: 140,
        }
    }

    fn ids(results: &[MatchResult]) -> Vec<&str> {
        results.iter().map(|r| r.item_id.as_str()).collect()
    }

    #[test]
    fn test_nothing_confident() {
        let policy = MatchPolicy::default();
        let results = select(vec![item("A", 0.59), item("B", 0.2)], &policy);
        assert!(results.is_empty());
        assert!(select(Vec::new(), &policy).is_empty());
    }

    #[test]
    fn test_single_high_confidence_suppresses_rest() {
        let results = select(
            vec![item("A", 0.7), item("B", 0.95), item("C", 0.8)],
            &MatchPolicy::default(),
        );
        assert_eq!(ids(&results), vec!["B"]);
    }

    #[test]
    fn test_top_two_when_no_standout() {
        let results = select(
            vec![item("A", 0.65), item("B", 0.85), item("C", 0.7), item("D", 0.3)],
            &MatchPolicy::default(),
        );
        assert_eq!(ids(&results), vec!["B", "C"]);
    }

    #[test]
    fn test_cutoffs_are_inclusive_and_strict() {
        let policy = MatchPolicy::default();
        // Exactly 0.6 is kept
        assert_eq!(ids(&select(vec![item("A", 0.6)], &policy)), vec!["A"]);
        // Exactly 0.9 does not short-circuit
        let results = select(vec![item("A", 0.9), item("B", 0.7)], &policy);
        assert_eq!(ids(&results), vec!["A", "B"]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let results = select(
            vec![item("first", 0.75), item("second", 0.75), item("third", 0.75)],
            &MatchPolicy::default(),
        );
        assert_eq!(ids(&results), vec!["first", "second"]);
    }

    #[test]
    fn test_explanation_format() {
        let results = select(vec![item("A", 0.90278)], &MatchPolicy::default());
        assert_eq!(results[0].explanation, "SIFT feature matching: 0.903 (150 vs 140 keypoints)");
        assert_eq!(results[0].confidence_score, 0.90278);
    }
}
