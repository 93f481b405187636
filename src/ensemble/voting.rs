//! Weighted voting over engine results.
//!
//! These functions only look at confidences, weights and priority order, so
//! the outcome doesn't depend on which engine happened to answer first.

use super::EngineResult;

/// Pick the best successful result.
///
/// `results` must be in priority order. The winner has the highest
/// `confidence * weight`; ties go to the higher-priority engine. Returns
/// `None` if nothing succeeded.
pub fn select_best(results: &[EngineResult]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, result) in results.iter().enumerate() {
        if !result.is_success() {
            continue;
        }
        let score = result.weighted_score();
        // Strictly greater, so earlier engines win ties.
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Combine successful results into one confidence.
///
/// One success: its confidence. Several: the weight-averaged confidence,
/// multiplied by `agreement_boost` when at least `agreement_min_engines`
/// succeeded. Always in `[0, 1]`. Returns the confidence and whether the
/// boost was applied.
pub fn ensemble_confidence(
    results: &[EngineResult],
    agreement_boost: f64,
    agreement_min_engines: usize,
) -> (f64, bool) {
    let successes = results.iter().filter(|r| r.is_success()).collect::<Vec<_>>();
    match successes.as_slice() {
        [] => (0.0, false),
        [only] => (only.confidence.clamp(0.0, 1.0), false),
        many => {
            let total_weight = many.iter().map(|r| r.weight).sum::<f64>();
            let weighted = many.iter().map(|r| r.weighted_score()).sum::<f64>();
            let mut confidence = if total_weight > 0.0 {
                weighted / total_weight
            } else {
                many.iter().map(|r| r.confidence).sum::<f64>() / many.len() as f64
            };
            let boosted = many.len() >= agreement_min_engines;
            if boosted {
                confidence *= agreement_boost;
            }
            (confidence.clamp(0.0, 1.0), boosted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::tests::{failed_result, result};

    #[test]
    fn two_engines_are_averaged_without_boost() {
        let results = [result("primary", 0.9, 0.5), result("secondary", 0.6, 0.3)];
        let (confidence, boosted) = ensemble_confidence(&results, 1.1, 3);
        assert!((confidence - 0.7875).abs() < 1e-9, "{confidence}");
        assert!(!boosted);
    }

    #[test]
    fn three_engines_get_agreement_boost() {
        let results = [
            result("primary", 0.8, 0.5),
            result("secondary", 0.8, 0.3),
            result("tertiary", 0.8, 0.2),
        ];
        let (confidence, boosted) = ensemble_confidence(&results, 1.1, 3);
        assert!((confidence - 0.88).abs() < 1e-9, "{confidence}");
        assert!(boosted);

        // The boost is capped.
        let results = [
            result("primary", 0.95, 0.5),
            result("secondary", 0.99, 0.3),
            result("tertiary", 0.97, 0.2),
        ];
        assert_eq!(ensemble_confidence(&results, 1.1, 3).0, 1.0);
    }

    #[test]
    fn failures_are_ignored() {
        let results = [
            result("primary", 0.92, 0.5),
            result("secondary", 0.81, 0.3),
            failed_result("tertiary", 0.2, "timeout"),
        ];
        let (confidence, boosted) = ensemble_confidence(&results, 1.1, 3);
        assert!((confidence - 0.87875).abs() < 1e-9, "{confidence}");
        assert!(!boosted);
        assert_eq!(select_best(&results), Some(0));
    }

    #[test]
    fn single_success_keeps_its_confidence() {
        let results = [failed_result("primary", 0.5, "boom"), result("secondary", 0.72, 0.3)];
        assert_eq!(ensemble_confidence(&results, 1.1, 3), (0.72, false));
        assert_eq!(select_best(&results), Some(1));
    }

    #[test]
    fn ties_go_to_earlier_engine() {
        // 0.6 * 0.5 == 0.3 * 1.0
        let results = [result("primary", 0.6, 0.5), result("secondary", 0.3, 1.0)];
        assert_eq!(select_best(&results), Some(0));
        let results = [result("primary", 0.5, 0.4), result("secondary", 0.5, 0.4)];
        assert_eq!(select_best(&results), Some(0));
    }

    #[test]
    fn weight_can_beat_raw_confidence() {
        let results = [result("primary", 0.6, 0.5), result("secondary", 0.9, 0.4)];
        assert_eq!(select_best(&results), Some(1));
    }

    #[test]
    fn zero_confidence_is_not_a_success() {
        let results = [result("primary", 0.0, 0.5), failed_result("secondary", 0.3, "x")];
        assert_eq!(select_best(&results), None);
        assert_eq!(ensemble_confidence(&results, 1.1, 3), (0.0, false));
    }
}
