//! Per-round sync computations: filter accuracy scheduling and the
//! missing-commit selection against a peer's filter.

use crate::internal::commit::Commit;
use crate::internal::graph::CommitGraph;
use crate::sync::bloom::BloomFilter;

/// Map a cycle counter to the round's target false-positive rate.
///
/// A client that just wrote forces `cycles = 1` (tightest filter) so a
/// fresh leaf cannot hide behind a false positive at the tip; servers idle
/// at `cycles = 3`, trading accuracy for bandwidth and converging over a
/// few rounds.
pub fn fpr_for_cycles(cycles: u32) -> f64 {
    match cycles {
        0 | 1 => 0.001,
        2 => 0.01,
        _ => 0.03,
    }
}

/// Build the filter half of a sync message: every local commit id at the
/// accuracy this round calls for.
pub fn filter_of(graph: &CommitGraph, cycles: u32) -> BloomFilter {
    let mut filter = BloomFilter::new(graph.len().max(1), fpr_for_cycles(cycles), None);
    for id in graph.ids() {
        filter.add(id.as_bytes());
    }
    filter
}

/// Commits the peer's filter does not contain, oldest age first then id,
/// bounded by the serialized payload cap.
pub fn missing_for_peer(
    graph: &CommitGraph,
    peer_filter: &BloomFilter,
    payload_byte_cap: usize,
) -> Vec<Commit> {
    let mut missing: Vec<&Commit> = graph
        .commits_by_age()
        .into_iter()
        .filter(|c| !peer_filter.contains(c.id.as_bytes()))
        .collect();
    missing.sort_by_key(|c| (c.age.unwrap_or(0), c.id));

    let mut out = Vec::new();
    let mut total = 0usize;
    for commit in missing {
        let encoded = serde_json::to_vec(commit).map(|b| b.len()).unwrap_or(0);
        if total + encoded > payload_byte_cap && !out.is_empty() {
            tracing::debug!(
                "sync payload cap reached: sending {} of missing commits",
                out.len()
            );
            break;
        }
        total += encoded;
        out.push(commit.clone());
    }
    out
}
