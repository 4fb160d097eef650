use std::cmp::Ordering;
use std::collections::HashMap;

use common::storage::vector::ScoredPassage;

/// RRF constant; rank contributions are `1 / (K_RRF + rank)`.
pub const K_RRF: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Dense,
    Lexical,
}

/// One ranked list produced by a single (variant, channel) search.
#[derive(Debug)]
pub struct ChannelRanking {
    pub channel: Channel,
    pub variant: usize,
    pub entries: Vec<ScoredPassage>,
}

/// A passage with its rank-fused score and the bookkeeping the tie-break
/// chain needs: earlier dense rank wins, then earlier variant, then id.
#[derive(Debug, Clone)]
pub struct FusedPassage {
    pub scored: ScoredPassage,
    pub fused: f32,
    best_dense_rank: usize,
    best_variant: usize,
}

/// Reciprocal rank fusion across every variant and both channels. Scores
/// from all lists sum per passage; ordering is fully deterministic for
/// identical inputs.
pub fn reciprocal_rank_fusion(rankings: Vec<ChannelRanking>) -> Vec<FusedPassage> {
    let mut fused: HashMap<String, FusedPassage> = HashMap::new();

    for ranking in rankings {
        for (position, entry) in ranking.entries.into_iter().enumerate() {
            let rank = position + 1;
            let contribution = 1.0 / (K_RRF + rank as f32);
            let dense_rank = if ranking.channel == Channel::Dense {
                rank
            } else {
                usize::MAX
            };

            fused
                .entry(entry.passage.id.clone())
                .and_modify(|existing| {
                    existing.fused += contribution;
                    existing.best_dense_rank = existing.best_dense_rank.min(dense_rank);
                    existing.best_variant = existing.best_variant.min(ranking.variant);
                })
                .or_insert(FusedPassage {
                    scored: ScoredPassage {
                        passage: entry.passage,
                        score: 0.0,
                    },
                    fused: contribution,
                    best_dense_rank: dense_rank,
                    best_variant: ranking.variant,
                });
        }
    }

    let mut results: Vec<FusedPassage> = fused
        .into_values()
        .map(|mut entry| {
            entry.scored.score = entry.fused;
            entry
        })
        .collect();

    results.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.best_dense_rank.cmp(&b.best_dense_rank))
            .then_with(|| a.best_variant.cmp(&b.best_variant))
            .then_with(|| a.scored.passage.id.cmp(&b.scored.passage.id))
    });
    results
}
