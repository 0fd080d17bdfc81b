// Ranking core — recall, scoring, filtering, dedup, diversity, pagination.
//
// rank() is the single entry point. Serve mode returns one diversified,
// cursor-paged slice and nothing else; batch mode returns the entire
// post-dedup pool with full signals for the semantic pipeline to chew on.
// rank() itself has no write side-effects — served-log and fatigue writes
// belong to the serve layer, which knows what actually went out.

pub mod cursor;
pub mod diversity;
pub mod filters;
pub mod network;
pub mod recall;
pub mod replies;
pub mod scoring;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, SecondsFormat, Utc};
use tracing::debug;

use crate::db::models::Post;
use crate::db::Database;
use crate::graph::GraphService;
use cursor::Cursor;
use scoring::{ScoreContext, ScoredCandidate};

/// Hard ceiling on a page, whatever the request asks for.
pub const MAX_PAGE: usize = 100;

/// Window of interactions that define the "interacted" author tier.
const INTERACTED_WINDOW_DAYS: i64 = 14;

/// Seen-log window consulted during scoring.
const SEEN_WINDOW_DAYS: i64 = 7;

/// Media-ratio lookback for the mismatch penalty.
const MEDIA_WINDOW_DAYS: i64 = 14;

/// Taste twins consulted per rank call.
const TWIN_LIMIT: usize = 50;

/// Minimum reputation for a twin to influence ranking.
const TWIN_MIN_REPUTATION: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct RankParams {
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

/// One serve-mode page, plus the continuation cursor.
#[derive(Debug)]
pub struct RankPage {
    pub items: Vec<ScoredCandidate>,
    pub cursor: Option<String>,
}

pub struct RankingEngine {
    db: Arc<dyn Database>,
    graph: Arc<GraphService>,
}

impl RankingEngine {
    pub fn new(db: Arc<dyn Database>, graph: Arc<GraphService>) -> Self {
        Self { db, graph }
    }

    /// Serve-mode ranking: diversified, cursor-paged.
    pub async fn rank(&self, user: &str, params: &RankParams) -> Result<RankPage> {
        let pool = self.ranked_pool(user, false).await?;
        let diversified = diversity::diversify(pool);

        // The cursor pins a position in the diversified order; fall back to
        // strict key comparison if the pinned item vanished from this
        // snapshot.
        let start = match &params.cursor {
            None => 0,
            Some(cursor) => {
                match diversified.iter().position(|c| c.post.uri == cursor.uri) {
                    Some(index) => index + 1,
                    None => diversified
                        .iter()
                        .position(|c| {
                            cursor.sort_key_after(c.score, c.indexed_at_ms(), &c.post.uri)
                        })
                        .unwrap_or(diversified.len()),
                }
            }
        };

        let limit = params.limit.clamp(1, MAX_PAGE);
        let items: Vec<ScoredCandidate> = diversified
            .into_iter()
            .skip(start)
            .take(limit)
            .collect();

        let cursor = items.last().map(|last| {
            Cursor {
                score: last.score,
                indexed_at_ms: last.indexed_at_ms(),
                uri: last.post.uri.clone(),
            }
            .encode()
        });

        Ok(RankPage { items, cursor })
    }

    /// Batch-mode ranking: the whole scored pool, sorted, no diversity, no
    /// pagination, no seen multiplier.
    pub async fn rank_batch(&self, user: &str) -> Result<Vec<ScoredCandidate>> {
        self.ranked_pool(user, true).await
    }

    /// Shared pipeline through sort (steps A–F, H's sort).
    async fn ranked_pool(&self, user: &str, batch_mode: bool) -> Result<Vec<ScoredCandidate>> {
        let now = Utc::now();
        let interacted_since = (now - Duration::days(INTERACTED_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let seen_since =
            (now - Duration::days(SEEN_WINDOW_DAYS)).to_rfc3339_opts(SecondsFormat::Millis, true);
        let media_since =
            (now - Duration::days(MEDIA_WINDOW_DAYS)).to_rfc3339_opts(SecondsFormat::Millis, true);

        // Recall
        let graph = self.graph.load_user_graph(user, &interacted_since).await?;
        let twins = self
            .db
            .get_taste_twins(user, TWIN_MIN_REPUTATION, TWIN_LIMIT)
            .await?;
        let pool = recall::harvest(&self.db, user, &graph, &twins, batch_mode).await?;
        if pool.posts.is_empty() {
            return Ok(Vec::new());
        }

        let uris: Vec<String> = pool.posts.iter().map(|p| p.uri.clone()).collect();
        let authors: HashSet<String> = pool.posts.iter().map(|p| p.author.clone()).collect();

        // Network effort over L1 and the influential-L2 set
        let influential: HashSet<String> = self
            .graph
            .influential_l2(user, &graph)
            .await?
            .into_iter()
            .map(|row| row.l2_did)
            .collect();
        let efforts = network::collect(&self.db, &uris, &graph, &influential).await?;

        // Reply clusters
        let clusters = replies::analyze(&self.db, &pool.posts, &graph).await?;

        // Scoring inputs
        let fatigue = self.db.get_fatigue_for_authors(user, &authors).await?;
        let keywords = self.db.get_user_keywords(user).await?;
        let seen_counts = self.db.get_seen_counts(user, &seen_since).await?;
        let interactions = self.db.get_user_interactions(user).await?;
        let media_ratio = self.db.get_media_like_ratio(user, &media_since).await?;

        let parent_uris: Vec<String> = pool
            .posts
            .iter()
            .filter_map(|p| p.reply_parent.clone())
            .collect();
        let parents: HashMap<String, Post> = self
            .db
            .get_posts(&parent_uris)
            .await?
            .into_iter()
            .map(|p| (p.uri.clone(), p))
            .collect();

        let ctx = ScoreContext {
            user,
            now,
            graph: &graph,
            efforts: &efforts,
            fatigue: &fatigue,
            keywords: &keywords,
            taste_hits: &pool.taste_hits,
            seen_counts: &seen_counts,
            interactions: &interactions,
            clusters: &clusters,
            parents: &parents,
            media_ratio,
            batch_mode,
        };

        // Score
        let scored: Vec<ScoredCandidate> = pool
            .posts
            .iter()
            .map(|post| scoring::score_candidate(post, &ctx))
            .collect();

        // Hard filters
        let filtered = filters::filter(scored, &graph, &interactions, &seen_counts, &clusters);

        // Sort before dedup so the per-thread budget favors the strongest
        let mut sorted = filtered;
        sort_by_rank_key(&mut sorted);

        // Thread dedup
        let deduped = filters::dedup_threads(sorted, &graph);

        debug!(
            user,
            candidates = uris.len(),
            kept = deduped.len(),
            batch_mode,
            "Ranking pipeline complete"
        );
        Ok(deduped)
    }
}

/// The total ranking order: score desc, indexedAt desc, uri asc.
pub fn sort_by_rank_key(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.indexed_at_ms().cmp(&a.indexed_at_ms()))
            .then_with(|| a.post.uri.cmp(&b.post.uri))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn candidate(uri: &str, score: f64, ms: i64) -> ScoredCandidate {
        ScoredCandidate {
            post: Post {
                uri: uri.to_string(),
                cid: "cid".to_string(),
                author: "did:plc:a".to_string(),
                indexed_at: chrono::DateTime::from_timestamp_millis(ms)
                    .unwrap()
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                like_count: 0,
                reply_count: 0,
                repost_count: 0,
                reply_root: None,
                reply_parent: None,
                text: None,
                has_image: false,
                has_video: false,
                has_external: false,
            },
            score,
            signals: BTreeMap::new(),
            repost_uri: None,
        }
    }

    #[test]
    fn test_sort_key_is_total() {
        let mut pool = vec![
            candidate("at://b", 100.0, 1000),
            candidate("at://a", 100.0, 1000),
            candidate("at://c", 100.0, 2000),
            candidate("at://d", 200.0, 0),
        ];
        sort_by_rank_key(&mut pool);
        let uris: Vec<&str> = pool.iter().map(|c| c.post.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://d", "at://c", "at://a", "at://b"]);
    }
}
