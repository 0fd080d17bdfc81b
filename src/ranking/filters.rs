// Post-scoring filters and thread dedup.
//
// Filtering drops what must never serve (already-liked, worn-out, deeply
// negative); dedup caps how much of one conversation can colonize a page.

use std::collections::{HashMap, HashSet};

use crate::db::models::InteractionKind;
use crate::graph::UserGraph;
use crate::ranking::replies::ReplyClusters;
use crate::ranking::scoring::ScoredCandidate;

/// Zero-engagement posts seen at least this often are dropped outright.
const SEEN_DROP_COUNT: i64 = 3;

/// Originals below this score never serve.
const ORIGINAL_FLOOR: f64 = -5000.0;

/// Reply score floors by relationship tier.
fn reply_floor(author: &str, graph: &UserGraph) -> f64 {
    if graph.mutuals.contains(author) {
        -500.0
    } else if graph.l1.contains(author) {
        0.0
    } else if graph.interacted.contains(author) {
        100.0
    } else if graph.l2.contains(author) {
        200.0
    } else {
        500.0
    }
}

/// Hard filters: what must never serve, whatever the score says.
pub fn filter(
    candidates: Vec<ScoredCandidate>,
    graph: &UserGraph,
    interactions: &HashMap<String, HashSet<InteractionKind>>,
    seen_counts: &HashMap<String, i64>,
    clusters: &ReplyClusters,
) -> Vec<ScoredCandidate> {
    // In large multi-person conversations only the best reply survives
    let mut best_reply_per_large_root: HashMap<&str, (&str, f64)> = HashMap::new();
    for candidate in &candidates {
        let Some(root) = candidate.post.reply_root.as_deref() else {
            continue;
        };
        if clusters.thread(root).is_some_and(|t| t.is_large()) {
            let entry = best_reply_per_large_root
                .entry(root)
                .or_insert((candidate.post.uri.as_str(), candidate.score));
            if candidate.score > entry.1 {
                *entry = (candidate.post.uri.as_str(), candidate.score);
            }
        }
    }
    let winners: HashSet<String> = best_reply_per_large_root
        .values()
        .map(|(uri, _)| uri.to_string())
        .collect();

    candidates
        .into_iter()
        .filter(|candidate| {
            let uri = &candidate.post.uri;

            // Already-liked is an absolute drop, whatever the score says
            if interactions
                .get(uri)
                .is_some_and(|kinds| kinds.contains(&InteractionKind::Like))
            {
                return false;
            }

            // Worn out: repeatedly seen and still nobody engaged
            if candidate.post.engagement() == 0
                && seen_counts.get(uri).copied().unwrap_or(0) >= SEEN_DROP_COUNT
            {
                return false;
            }

            match candidate.post.reply_root.as_deref() {
                None => candidate.score > ORIGINAL_FLOOR,
                Some(root) => {
                    if clusters.thread(root).is_some_and(|t| t.is_large())
                        && !winners.contains(uri)
                    {
                        return false;
                    }
                    candidate.score > reply_floor(&candidate.post.author, graph)
                }
            }
        })
        .collect()
}

/// Per-conversation reply budget for thread dedup.
#[derive(Default)]
struct ThreadBudget {
    originals: usize,
    mutual_replies: usize,
    popular_l1_replies: usize,
    other_graph_replies: usize,
    unknown_replies: usize,
}

/// Thread/conversation dedup. Assumes candidates are sorted by
/// score descending so the budget favors the strongest entries.
pub fn dedup_threads(
    candidates: Vec<ScoredCandidate>,
    graph: &UserGraph,
) -> Vec<ScoredCandidate> {
    let mut budgets: HashMap<String, ThreadBudget> = HashMap::new();

    candidates
        .into_iter()
        .filter(|candidate| {
            let post = &candidate.post;
            let root = post
                .reply_root
                .clone()
                .unwrap_or_else(|| post.uri.clone());
            let budget = budgets.entry(root).or_default();

            if post.is_original() {
                budget.originals += 1;
                return budget.originals <= 2;
            }

            let author = post.author.as_str();
            if graph.mutuals.contains(author) {
                budget.mutual_replies += 1;
                budget.mutual_replies <= 3
            } else if graph.l1.contains(author) {
                if post.engagement() >= 2 {
                    budget.popular_l1_replies += 1;
                    budget.popular_l1_replies <= 2
                } else {
                    budget.other_graph_replies += 1;
                    budget.other_graph_replies <= 1 && candidate.score > 100.0
                }
            } else if graph.l2.contains(author) || graph.interacted.contains(author) {
                budget.other_graph_replies += 1;
                budget.other_graph_replies <= 1 && candidate.score > 100.0
            } else {
                budget.unknown_replies += 1;
                budget.unknown_replies <= 1 && candidate.score > 500.0
            }
        })
        .collect()
}
