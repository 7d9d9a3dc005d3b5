//! Picking the next entry to admit from a queue.

use super::priority::{Candidate, ScoringConfig};

/// The entry chosen by [`select_next`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub index: usize,
    /// Chosen because it was starving, not because it scored highest.
    pub promoted: bool,
}

/// Choose the next candidate to admit.
///
/// Starving candidates go first, oldest first. Otherwise the highest score wins,
/// ties going to the earlier position (queue order is arrival order).
pub fn select_next(config: &ScoringConfig, candidates: &[Candidate], now_ms: u64) -> Option<Selection> {
    if candidates.is_empty() {
        return None;
    }

    let starving = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| config.is_starving(c, now_ms))
        .min_by_key(|(i, c)| (c.enqueued_at_ms, *i));
    if let Some((index, _)) = starving {
        return Some(Selection { index, promoted: true });
    }

    let scores = config.score_all(candidates);
    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = i;
        }
    }
    Some(Selection {
        index: best,
        promoted: false,
    })
}

/// Indices of candidates the selection overtook: everything queued ahead of it.
pub fn overtaken(selection: Selection) -> std::ops::Range<usize> {
    0..selection.index
}
