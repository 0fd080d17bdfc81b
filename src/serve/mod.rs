// Serve-time fusion.
//
// A feed request blends the pre-computed semantic batch with live state:
// batch scores decay with batch age, interacted posts drop out, the seen
// log applies a steep multiplicative penalty, author fatigue subtracts,
// diversity reorders, and a thin pool gets backfilled by the live ranking
// pipeline. Served-log rows and fatigue-on-serve writes happen in a
// spawned task once the page is assembled; heavy batch consumption fires
// a priority regenerate trigger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::models::{CandidateBatchRow, Post};
use crate::db::Database;
use crate::ranking::cursor::Cursor;
use crate::ranking::scoring::ScoredCandidate;
use crate::ranking::{diversity, sort_by_rank_key, RankParams, RankingEngine, MAX_PAGE};
use crate::semantic::BATCH_TTL_HOURS;
use crate::taste::fatigue;

/// Below this many batch survivors the live pipeline is interspliced.
const THIN_POOL_THRESHOLD: usize = 20;

/// Seen-consumption ratio that fires the priority regenerate trigger.
const REGEN_CONSUMPTION_RATIO: f64 = 0.5;

/// Hard score assigned once a post has been seen this many times.
const SEEN_CUTOFF_COUNT: i64 = 3;
const SEEN_CUTOFF_SCORE: f64 = -501.0;

/// Seen-log lookback at serve time.
const SEEN_WINDOW_DAYS: i64 = 7;

/// Ask the scheduler for a batch rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTrigger {
    pub user_did: String,
    pub force_priority: bool,
}

/// One skeleton item: the post URI plus an optional repost attribution.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub post: String,
    pub repost_uri: Option<String>,
}

#[derive(Debug)]
pub struct FeedPage {
    pub feed: Vec<FeedItem>,
    pub cursor: Option<String>,
}

pub struct ServeEngine {
    db: Arc<dyn Database>,
    ranking: Arc<RankingEngine>,
    trigger: mpsc::Sender<BatchTrigger>,
}

impl ServeEngine {
    pub fn new(
        db: Arc<dyn Database>,
        ranking: Arc<RankingEngine>,
        trigger: mpsc::Sender<BatchTrigger>,
    ) -> Self {
        Self {
            db,
            ranking,
            trigger,
        }
    }

    pub async fn serve(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<FeedPage> {
        let now = Utc::now();
        let cursor = match cursor.as_deref() {
            Some(raw) => Some(Cursor::decode(raw)?),
            None => None,
        };
        let limit = limit.clamp(1, MAX_PAGE);

        // 1. Load and dedup the candidate batch
        let ttl_floor = (now - Duration::hours(BATCH_TTL_HOURS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let rows = self.db.load_candidate_batch(user, &ttl_floor).await?;
        let batch = dedup_newest(rows);

        if batch.is_empty() {
            debug!(user, "No candidate batch, serving live pipeline directly");
            return self.serve_live(user, limit, cursor).await;
        }

        let total_batch = batch.len();
        let uris: Vec<String> = batch.iter().map(|row| row.uri.clone()).collect();
        let posts: HashMap<String, Post> = self
            .db
            .get_posts(&uris)
            .await?
            .into_iter()
            .map(|p| (p.uri.clone(), p))
            .collect();

        // 4. Live exclusion state
        let interactions = self.db.get_user_interactions(user).await?;
        let seen_since = (now - Duration::days(SEEN_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let seen_counts = self.db.get_seen_counts(user, &seen_since).await?;
        let seen_in_batch = uris
            .iter()
            .filter(|uri| seen_counts.contains_key(*uri))
            .count();

        let authors: HashSet<String> = posts.values().map(|p| p.author.clone()).collect();
        let fatigue_map = self.db.get_fatigue_for_authors(user, &authors).await?;

        // 2–5. Score the surviving batch candidates
        let mut pool: Vec<ScoredCandidate> = Vec::new();
        for row in &batch {
            let Some(post) = posts.get(&row.uri) else {
                continue; // post deleted since the batch was built
            };
            if interactions.contains_key(&row.uri) {
                continue;
            }

            let batch_age_hours = age_hours(&row.generated_at, now);
            let impact = (1.0 - batch_age_hours / BATCH_TTL_HOURS as f64).max(0.0);
            let mut score = 0.3 * row.pipeline_score + 1800.0 * row.semantic_score * impact;

            let seen = seen_counts.get(&row.uri).copied().unwrap_or(0);
            if seen >= SEEN_CUTOFF_COUNT {
                score = SEEN_CUTOFF_SCORE;
            } else if seen > 0 {
                score *= 0.2f64.powi(seen as i32);
            }

            if let Some(f) = fatigue_map.get(&post.author) {
                score -= (f.fatigue_score / 100.0) * 1200.0;
            }

            let mut signals = BTreeMap::new();
            signals.insert("semantic", row.semantic_score);
            signals.insert("pipeline", row.pipeline_score);
            signals.insert("impact", impact);
            pool.push(ScoredCandidate {
                post: post.clone(),
                score,
                signals,
                repost_uri: None,
            });
        }

        // 7. Thin pool: intersplice the live pipeline
        if pool.len() < THIN_POOL_THRESHOLD {
            let batch_uris: HashSet<&str> = pool
                .iter()
                .filter(|c| c.score > 0.0)
                .map(|c| c.post.uri.as_str())
                .collect();
            let floor = pool
                .iter()
                .map(|c| c.score)
                .fold(f64::INFINITY, f64::min);
            let mut base = if floor.is_finite() {
                (floor - 1.0).min(1000.0)
            } else {
                1000.0
            };

            let batch_uris: HashSet<String> = batch_uris.iter().map(|s| s.to_string()).collect();
            match self
                .ranking
                .rank(
                    user,
                    &RankParams {
                        limit: MAX_PAGE,
                        cursor: None,
                    },
                )
                .await
            {
                Ok(live) => {
                    for mut item in live.items {
                        if batch_uris.contains(&item.post.uri) {
                            continue;
                        }
                        // A sunk batch copy of the same post yields its slot
                        pool.retain(|c| c.post.uri != item.post.uri);
                        item.score = base;
                        base -= 5.0;
                        pool.push(item);
                    }
                }
                Err(e) => warn!(user, error = %e, "Live intersplice failed"),
            }
        }

        // 6. Order and diversify
        sort_by_rank_key(&mut pool);
        let ordered = diversity::diversify(pool);

        // 8. Cursor and page
        let page = paginate(ordered, &cursor, limit);

        let l1: HashSet<String> = self.db.get_followees(user).await?.into_iter().collect();

        // 9. Serve side-effects run after the response is assembled
        self.spawn_record_serve(user, &page);

        // 10. Consumption trigger
        if total_batch > 0
            && seen_in_batch as f64 / total_batch as f64 >= REGEN_CONSUMPTION_RATIO
        {
            info!(
                user,
                seen = seen_in_batch,
                total = total_batch,
                "Batch consumption high, requesting priority regenerate"
            );
            let _ = self.trigger.try_send(BatchTrigger {
                user_did: user.to_string(),
                force_priority: true,
            });
        }

        Ok(build_page(page, &l1))
    }

    /// Fallback: no batch rows at all, serve the live pipeline.
    async fn serve_live(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<FeedPage> {
        let page = self
            .ranking
            .rank(user, &RankParams { limit, cursor })
            .await?;
        let l1: HashSet<String> = self.db.get_followees(user).await?.into_iter().collect();

        let paged = Paged {
            items: page.items,
            cursor: page.cursor,
        };
        self.spawn_record_serve(user, &paged);
        Ok(build_page(paged, &l1))
    }

    /// Served-log rows and author fatigue for everything on the page,
    /// written from a spawned task so the response doesn't wait on them.
    fn spawn_record_serve(&self, user: &str, page: &Paged) {
        if page.items.is_empty() {
            return;
        }
        let db = self.db.clone();
        let user = user.to_string();
        let uris: Vec<String> = page.items.iter().map(|c| c.post.uri.clone()).collect();
        let authors: HashSet<String> =
            page.items.iter().map(|c| c.post.author.clone()).collect();

        tokio::spawn(async move {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            if let Err(e) = db.record_served(&user, &uris, &now).await {
                warn!(user, error = %e, "Served-log write failed");
            }
            for author in authors {
                if let Err(e) = fatigue::record_serve(&db, &user, &author).await {
                    warn!(user, author, error = %e, "Fatigue-on-serve failed");
                }
            }
        });
    }
}

struct Paged {
    items: Vec<ScoredCandidate>,
    cursor: Option<String>,
}

/// Keep the newest generated_at per URI.
fn dedup_newest(rows: Vec<CandidateBatchRow>) -> Vec<CandidateBatchRow> {
    let mut newest: HashMap<String, CandidateBatchRow> = HashMap::new();
    for row in rows {
        match newest.get(&row.uri) {
            Some(existing) if existing.generated_at >= row.generated_at => {}
            _ => {
                newest.insert(row.uri.clone(), row);
            }
        }
    }
    newest.into_values().collect()
}

fn age_hours(ts: &str, now: DateTime<Utc>) -> f64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| ((now - t.with_timezone(&Utc)).num_seconds() as f64 / 3600.0).max(0.0))
        .unwrap_or(f64::MAX)
}

fn paginate(ordered: Vec<ScoredCandidate>, cursor: &Option<Cursor>, limit: usize) -> Paged {
    let start = match cursor {
        None => 0,
        Some(cursor) => match ordered.iter().position(|c| c.post.uri == cursor.uri) {
            Some(index) => index + 1,
            None => ordered
                .iter()
                .position(|c| cursor.sort_key_after(c.score, c.indexed_at_ms(), &c.post.uri))
                .unwrap_or(ordered.len()),
        },
    };

    let items: Vec<ScoredCandidate> = ordered.into_iter().skip(start).take(limit).collect();
    let cursor = items.last().map(|last| {
        Cursor {
            score: last.score,
            indexed_at_ms: last.indexed_at_ms(),
            uri: last.post.uri.clone(),
        }
        .encode()
    });
    Paged { items, cursor }
}

/// Attach repost attribution for posts surfaced by a non-L1 reposter.
fn build_page(page: Paged, l1: &HashSet<String>) -> FeedPage {
    let feed = page
        .items
        .into_iter()
        .map(|item| {
            let repost_uri = match &item.repost_uri {
                Some(uri) if !l1.contains(&item.post.author) => Some(uri.clone()),
                _ => None,
            };
            FeedItem {
                post: item.post.uri,
                repost_uri,
            }
        })
        .collect();
    FeedPage {
        feed,
        cursor: page.cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(uri: &str, semantic: f64, pipeline: f64, generated_at: &str) -> CandidateBatchRow {
        CandidateBatchRow {
            user_did: "did:plc:u".to_string(),
            uri: uri.to_string(),
            semantic_score: semantic,
            pipeline_score: pipeline,
            centroid_id: 0,
            batch_id: "aabbccdd".to_string(),
            generated_at: generated_at.to_string(),
        }
    }

    #[test]
    fn test_dedup_newest_keeps_latest_generation() {
        let rows = vec![
            row("at://a/p/1", 0.5, 100.0, "2026-01-01T00:00:00Z"),
            row("at://a/p/1", 0.7, 100.0, "2026-01-02T00:00:00Z"),
            row("at://a/p/2", 0.4, 50.0, "2026-01-01T00:00:00Z"),
        ];
        let deduped = dedup_newest(rows);
        assert_eq!(deduped.len(), 2);
        let p1 = deduped.iter().find(|r| r.uri == "at://a/p/1").unwrap();
        assert!((p1.semantic_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_effective_score_formula() {
        // Fresh batch: impact = 1. 0.3*1000 + 1800*0.5*1 = 1200
        let score: f64 = 0.3 * 1000.0 + 1800.0 * 0.5 * 1.0;
        assert!((score - 1200.0).abs() < 1e-9);
        // Half-aged batch: impact = 0.5
        let aged: f64 = 0.3 * 1000.0 + 1800.0 * 0.5 * 0.5;
        assert!((aged - 750.0).abs() < 1e-9);
    }
}
