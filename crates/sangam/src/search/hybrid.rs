use std::collections::HashMap;

use crate::error::{Error, Result};

/// Fusion weights are kept inside this band so neither channel can be
/// silenced or fully dominate.
const WEIGHT_FLOOR: f32 = 0.2;
const WEIGHT_CEIL: f32 = 0.8;

/// Gini coefficient of a distribution of non-negative scores.
///
/// Returns 0.0 for empty, all-zero, or all-equal input and approaches 1.0
/// as the mass concentrates on a single element. Negative input is an
/// error.
pub fn gini(scores: &[f32]) -> Result<f32> {
    if scores.iter().any(|s| *s < 0.0) {
        return Err(Error::Validation("scores must be non-negative".into()));
    }
    if scores.is_empty() {
        return Ok(0.0);
    }

    let mut sorted: Vec<f64> = scores.iter().map(|s| *s as f64).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len() as f64;
    let mut cumulative = 0.0f64;
    let mut cumulative_sum = 0.0f64;
    for s in &sorted {
        cumulative += s;
        cumulative_sum += cumulative;
    }
    if cumulative == 0.0 {
        return Ok(0.0);
    }

    Ok(((n + 1.0 - 2.0 * cumulative_sum / cumulative) / n) as f32)
}

/// Blend two ranked lists into one, weighting each channel by how peaked
/// its score distribution is.
///
/// Both lists carry `(chunk_id, score)` pairs with non-negative scores.
/// Each channel is max-normalized, weighted by its gini coefficient scaled
/// by its share of raw score mass, and the channels are combined as
/// `w_d·exp(sd) + w_s·exp(ss) + sqrt(sd·ss)` — the square-root term rewards
/// ids both channels agree on. The output is sorted descending with scores
/// normalized into [0, 1].
pub fn adaptive_fusion(
    hits_dense: &[(i64, f32)],
    hits_sparse: &[(i64, f32)],
) -> Result<Vec<(i64, f32)>> {
    let mut ids: Vec<i64> = Vec::with_capacity(hits_dense.len() + hits_sparse.len());
    let mut positions: HashMap<i64, usize> = HashMap::new();
    for (id, _) in hits_dense.iter().chain(hits_sparse.iter()) {
        positions.entry(*id).or_insert_with(|| {
            ids.push(*id);
            ids.len() - 1
        });
    }

    let mut sd = vec![0.0f32; ids.len()];
    let mut ss = vec![0.0f32; ids.len()];
    for (id, score) in hits_dense {
        sd[positions[id]] = *score;
    }
    for (id, score) in hits_sparse {
        ss[positions[id]] = *score;
    }

    let max_d = sd.iter().fold(0.0f32, |m, s| m.max(*s));
    let max_s = ss.iter().fold(0.0f32, |m, s| m.max(*s));
    if max_d > 0.0 {
        for s in &mut sd {
            *s /= max_d;
        }
    }
    if max_s > 0.0 {
        for s in &mut ss {
            *s /= max_s;
        }
    }

    let g_d = gini(&sd)?;
    let g_s = gini(&ss)?;
    let total = g_d + g_s;

    let (mut w_d, mut w_s) = if total > 0.0 {
        let mass = max_d + max_s + 1e-6;
        (
            (g_d / total) * (max_d / mass),
            (g_s / total) * (max_s / mass),
        )
    } else {
        (0.5, 0.5)
    };

    w_d = w_d.clamp(WEIGHT_FLOOR, WEIGHT_CEIL);
    w_s = w_s.clamp(WEIGHT_FLOOR, WEIGHT_CEIL);
    let weight_sum = w_d + w_s;
    w_d /= weight_sum;
    w_s /= weight_sum;

    let max_fused = std::f32::consts::E + 1.0;
    let mut fused: Vec<(i64, f32)> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let f = w_d * sd[i].exp() + w_s * ss[i].exp() + (sd[i] * ss[i]).sqrt();
            (*id, (f / max_fused).clamp(0.0, 1.0))
        })
        .collect();

    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gini_empty_is_zero() {
        assert_eq!(gini(&[]).unwrap(), 0.0);
    }

    #[test]
    fn gini_all_zero_is_zero() {
        assert_eq!(gini(&[0.0, 0.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn gini_all_equal_is_zero() {
        assert!(gini(&[1.0, 1.0, 1.0, 1.0]).unwrap().abs() < 1e-6);
    }

    #[test]
    fn gini_single_spike() {
        let g = gini(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!((g - 0.75).abs() < 1e-6, "got {g}");
    }

    #[test]
    fn gini_rejects_negative() {
        assert!(gini(&[0.5, -0.1]).is_err());
    }

    #[test]
    fn agreement_wins_over_single_channel_top() {
        // id 2 appears in both lists; the agreement bonus should put it first
        // even though id 1 tops the dense list.
        let dense = vec![(1, 0.9), (2, 0.8)];
        let sparse = vec![(2, 0.95), (3, 0.6)];
        let fused = adaptive_fusion(&dense, &sparse).unwrap();
        assert_eq!(fused[0].0, 2);
        for (_, score) in &fused {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn empty_sparse_preserves_dense_order() {
        let dense = vec![(1, 0.5), (2, 0.4)];
        let fused = adaptive_fusion(&dense, &[]).unwrap();
        let ids: Vec<i64> = fused.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
        for (_, score) in &fused {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn both_empty_yields_empty() {
        assert!(adaptive_fusion(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn weights_stay_bounded() {
        // A hugely peaked dense channel against a flat sparse channel; the
        // clamp keeps the sparse contribution alive, so its top id must
        // still outrank an id absent from both channels' upper ranks.
        let dense = vec![(1, 1.0), (2, 0.01), (3, 0.01)];
        let sparse = vec![(4, 0.5), (5, 0.5), (6, 0.5)];
        let fused = adaptive_fusion(&dense, &sparse).unwrap();
        let score_of = |want: i64| {
            fused
                .iter()
                .find(|(id, _)| *id == want)
                .map(|(_, s)| *s)
                .unwrap()
        };
        // id 4 (sparse max) must beat id 2 (dense near-zero).
        assert!(score_of(4) > score_of(2));
    }

    #[test]
    fn fused_scores_sorted_descending() {
        let dense = vec![(1, 0.3), (2, 0.9), (3, 0.5)];
        let sparse = vec![(4, 0.2), (2, 0.8)];
        let fused = adaptive_fusion(&dense, &sparse).unwrap();
        for pair in fused.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }
}
