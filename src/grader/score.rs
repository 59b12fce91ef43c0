//! Score aggregation arithmetic.
//!
//! Sibling weights are normalized to sum to 100 at aggregation time, never
//! at parse time, so declared configurations stay round-trippable.

/// Scales sibling weights so they sum to 100. Empty input stays empty;
/// an all-zero sum falls back to equal shares.
pub fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    if weights.is_empty() {
        return Vec::new();
    }
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        let share = 100.0 / weights.len() as f64;
        return vec![share; weights.len()];
    }
    weights.iter().map(|w| w / sum * 100.0).collect()
}

/// Weighted mean of `(score, weight)` pairs with normalization applied.
/// Returns `None` for an empty set, so empty subtrees are excluded rather
/// than counted as zero.
pub fn weighted_mean(scored: &[(f64, f64)]) -> Option<f64> {
    if scored.is_empty() {
        return None;
    }
    let weights: Vec<f64> = scored.iter().map(|(_, w)| *w).collect();
    let normalized = normalize_weights(&weights);
    Some(
        scored
            .iter()
            .zip(normalized.iter())
            .map(|((score, _), weight)| score * weight / 100.0)
            .sum(),
    )
}

/// Arithmetic mean, for leaf test sets. `None` when empty.
pub fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// The final-score formula.
///
/// `bonus` and `penalty` are `(category_score, category_weight)` pairs where
/// the weight is the absolute point cap declared at the category root. A
/// missing category contributes zero. Bonus only applies below 100; the
/// result is clamped to [0, 100].
pub fn final_score(
    base: Option<f64>,
    bonus: Option<(f64, f64)>,
    penalty: Option<(f64, f64)>,
) -> f64 {
    let mut total = base.unwrap_or(0.0);

    if total < 100.0 {
        if let Some((score, weight)) = bonus {
            total += score / 100.0 * weight;
        }
    }
    total = total.min(100.0);

    if let Some((score, weight)) = penalty {
        total -= score / 100.0 * weight;
    }

    total.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn normalize_scales_to_hundred() {
        let normalized = normalize_weights(&[30.0, 20.0, 50.0]);
        assert!(close(normalized.iter().sum::<f64>(), 100.0));
        assert!(close(normalized[0], 30.0));

        let scaled = normalize_weights(&[1.0, 1.0]);
        assert!(close(scaled[0], 50.0));
        assert!(close(scaled[1], 50.0));

        assert!(normalize_weights(&[]).is_empty());
    }

    #[test]
    fn weighted_mean_excludes_nothing_but_empty() {
        assert_eq!(weighted_mean(&[]), None);
        let score = weighted_mean(&[(50.0, 30.0), (90.0, 20.0), (100.0, 50.0)]).unwrap();
        // 50*0.3 + 90*0.2 + 100*0.5 = 83
        assert!(close(score, 83.0));
    }

    #[test]
    fn mean_of_leaf_scores() {
        assert_eq!(mean(&[]), None);
        assert!(close(mean(&[100.0, 0.0, 50.0]).unwrap(), 50.0));
    }

    #[test]
    fn bonus_caps_then_penalty_applies() {
        // base 80, bonus 100/40, penalty 50/50:
        // min(100, 80 + 40) - 25 = 75
        let score = final_score(Some(80.0), Some((100.0, 40.0)), Some((50.0, 50.0)));
        assert!(close(score, 75.0));
    }

    #[test]
    fn bonus_is_ignored_at_full_marks() {
        let score = final_score(Some(100.0), Some((100.0, 40.0)), None);
        assert!(close(score, 100.0));

        let with_penalty = final_score(Some(100.0), Some((100.0, 40.0)), Some((20.0, 50.0)));
        assert!(close(with_penalty, 90.0));
    }

    #[test]
    fn missing_categories_contribute_zero() {
        assert!(close(final_score(Some(70.0), None, None), 70.0));
        assert!(close(final_score(None, Some((100.0, 40.0)), None), 40.0));
        assert!(close(final_score(None, None, Some((100.0, 50.0))), 0.0));
    }

    #[test]
    fn result_is_clamped_to_valid_range() {
        let floor = final_score(Some(10.0), None, Some((100.0, 50.0)));
        assert!(close(floor, 0.0));

        let ceiling = final_score(Some(95.0), Some((100.0, 40.0)), None);
        assert!(close(ceiling, 100.0));
    }
}
