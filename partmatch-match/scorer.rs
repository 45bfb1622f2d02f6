use partmatch_core::MatchPolicy;

/// Correspondences relative to the smaller of the two keypoint counts.
/// 0.0 when either set is empty.
pub fn match_ratio(correspondences: usize, query_keypoints: usize, stored_keypoints: usize) -> f64 {
    let min_keypoints = query_keypoints.min(stored_keypoints);
    if min_keypoints == 0 {
        return 0.0;
    }
    correspondences as f64 / min_keypoints as f64
}

/// Logistic squashing of a match ratio into `[0, 1]`
pub fn sigmoid(match_ratio: f64, steepness: f64, midpoint: f64) -> f64 {
    1.0 / (1.0 + (-steepness * (match_ratio - midpoint)).exp())
}

/// Confidence that a stored item is the photographed one. Exactly 0.0 when
/// either side has no keypoints.
pub fn score(correspondences: usize, query_keypoints: usize, stored_keypoints: usize, policy: &MatchPolicy) -> f64 {
    if query_keypoints.min(stored_keypoints) == 0 {
        return 0.0;
    }
    let ratio = match_ratio(correspondences, query_keypoints, stored_keypoints);
    sigmoid(ratio, policy.sigmoid_steepness, policy.sigmoid_midpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_match_ratio_uses_smaller_count() {
        assert!((match_ratio(60, 150, 140) - 60.0 / 140.0).abs() < 1e-12);
        assert_eq!(match_ratio(10, 0, 140), 0.0);
        assert_eq!(match_ratio(10, 140, 0), 0.0);
    }

    #[test]
    fn test_strong_match_clears_single_match_cutoff() {
        let policy = MatchPolicy::default();
        let confidence = score(60, 150, 140, &policy);
        // sigmoid(8 * (0.4286 - 0.15))
        assert!((confidence - 0.9028).abs() < 1e-3);
        assert!(confidence > policy.single_match_confidence);
    }

    #[test]
    fn test_no_correspondences() {
        let policy = MatchPolicy::default();
        let confidence = score(0, 200, 200, &policy);
        // sigmoid(-1.2) stays well below the acceptance threshold
        assert!((confidence - 0.2315).abs() < 1e-3);
        assert!(confidence < policy.min_confidence);
    }

    #[test]
    fn test_empty_keypoint_set_scores_zero() {
        let policy = MatchPolicy::default();
        assert_eq!(score(0, 0, 140, &policy), 0.0);
        assert_eq!(score(0, 140, 0, &policy), 0.0);
        assert_eq!(score(5, 0, 0, &policy), 0.0);
    }

    #[test]
    fn test_midpoint_is_half() {
        assert!((sigmoid(0.15, 8.0, 0.15) - 0.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_score_bounded(c in 0usize..5000, q in 0usize..5000, s in 0usize..5000) {
            let confidence = score(c, q, s, &MatchPolicy::default());
            prop_assert!((0.0..=1.0).contains(&confidence));
        }

        #[test]
        fn prop_score_monotonic_in_correspondences(c in 0usize..1000, extra in 0usize..1000, q in 1usize..2000, s in 1usize..2000) {
            let policy = MatchPolicy::default();
            prop_assert!(score(c + extra, q, s, &policy) >= score(c, q, s, &policy));
        }
    }
}
