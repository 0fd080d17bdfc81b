// Semantic batch pipeline.
//
// Per tracked user: run the ranking core in batch mode, embed whatever
// candidate and liked-post texts aren't in the vector index yet, rebuild
// the user's interest centroids, ANN-search each centroid within the
// user's own partition, and materialize the merged top-K as candidate
// batch rows the serve path reads.
//
// The job is single-flight per process with a cooldown; the serve path can
// force-run it early when batch consumption crosses its threshold.

pub mod clusterer;
pub mod embedder;
pub mod vectors;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use chrono::{Duration, SecondsFormat, Utc};
use rand::RngCore;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::appview::AppViewClient;
use crate::db::models::{CandidateBatchRow, InteractionKind, Post};
use crate::db::Database;
use crate::ranking::scoring::ScoredCandidate;
use crate::ranking::RankingEngine;
use clusterer::{ClusterInput, Clusterer, MIN_CLUSTER_INPUT};
use embedder::{EmbedInput, Embedder, EMBED_BATCH};
use vectors::{point_id, VectorIndex, VectorPoint, POST_COLLECTION, PROFILE_COLLECTION};

/// Candidate batches expire after this many hours.
pub const BATCH_TTL_HOURS: i64 = 12;

/// Minimum text length for a candidate to be worth embedding.
const MIN_EMBED_TEXT: usize = 10;

/// Image URLs (and alt texts) pulled per hydrated post.
const MAX_IMAGE_REFS: usize = 4;

/// Likes/reposts lookback feeding the profile.
const LIKE_WINDOW_DAYS: i64 = 3;

/// Explicit-feedback lookback feeding the profile.
const FEEDBACK_WINDOW_DAYS: i64 = 7;

/// Rows kept per materialized batch.
const BATCH_TOP_K: usize = 1500;

/// ANN score threshold.
const SEARCH_THRESHOLD: f64 = 0.25;

/// Seen-count at which a hit is dropped from the batch.
const SEEN_DROP: i64 = 3;

/// Authors below this reputation never enter a batch through search.
const MIN_AUTHOR_REPUTATION: f64 = 0.1;

/// Baseline pipeline score for hits outside the live pipeline map.
const DISCOVERY_BASELINE: f64 = -4000.0;

/// Minimum gap between unforced runs.
const COOLDOWN: StdDuration = StdDuration::from_secs(600);

pub struct SemanticPipeline {
    db: Arc<dyn Database>,
    ranking: Arc<RankingEngine>,
    appview: Arc<AppViewClient>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    clusterer: Arc<dyn Clusterer>,
    running: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

impl SemanticPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        ranking: Arc<RankingEngine>,
        appview: Arc<AppViewClient>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        clusterer: Arc<dyn Clusterer>,
    ) -> Self {
        Self {
            db,
            ranking,
            appview,
            index,
            embedder,
            clusterer,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// Run the pipeline for every user, respecting the single-flight guard
    /// and cooldown. Returns false when the run was skipped.
    pub async fn run_all(&self, users: &[String], force_priority: bool) -> Result<bool> {
        if !force_priority {
            let last = self.last_run.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < COOLDOWN {
                    info!("Semantic pipeline inside cooldown, skipping");
                    return Ok(false);
                }
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Semantic pipeline already running, skipping");
            return Ok(false);
        }

        let result = self.run_all_inner(users).await;
        self.running.store(false, Ordering::SeqCst);
        *self.last_run.lock().await = Some(Instant::now());
        result.map(|_| true)
    }

    async fn run_all_inner(&self, users: &[String]) -> Result<()> {
        self.index.ensure_collections().await?;
        for user in users {
            match self.run_for_user(user).await {
                Ok(rows) => info!(user, rows, "Candidate batch materialized"),
                Err(e) => warn!(user, error = %e, "Semantic batch failed for user"),
            }
        }
        // Shared GC after the per-user passes
        let horizon = (Utc::now() - Duration::hours(BATCH_TTL_HOURS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let removed = self.db.gc_candidate_batches(&horizon).await?;
        if removed > 0 {
            info!(removed, "Expired candidate batches removed");
        }
        Ok(())
    }

    /// The eight steps for one user. Returns the number of batch rows written.
    pub async fn run_for_user(&self, user: &str) -> Result<usize> {
        // 1. Live pipeline in batch mode
        let candidates = self.ranking.rank_batch(user).await?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let pipeline_scores: HashMap<String, f64> = candidates
            .iter()
            .map(|c| (c.post.uri.clone(), c.score))
            .collect();

        // 2. Embed candidates not yet in the user's partition
        let embedded = self.index.embedded_uris(user).await?;
        let to_embed: Vec<&ScoredCandidate> = candidates
            .iter()
            .filter(|c| !embedded.contains(&c.post.uri))
            .filter(|c| {
                c.post.text.as_deref().map_or(0, |t| t.len()) > MIN_EMBED_TEXT
                    || c.post.has_image
            })
            .collect();
        let posts: Vec<Post> = to_embed.iter().map(|c| c.post.clone()).collect();
        self.embed_posts(user, &posts).await?;

        // 3. Embed the user's recent like/repost/feedback subjects
        let like_since = (Utc::now() - Duration::days(LIKE_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let feedback_since = (Utc::now() - Duration::days(FEEDBACK_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut profile_sources: Vec<(String, String)> = self
            .db
            .get_recent_like_targets(user, &like_since)
            .await?
            .into_iter()
            .map(|(uri, kind)| {
                let interaction = match kind {
                    InteractionKind::Repost => "repost",
                    _ => "like",
                };
                (uri, interaction.to_string())
            })
            .collect();
        for (uri, action) in self.db.get_recent_feedback(user, &feedback_since).await? {
            let interaction = match action.as_str() {
                "more" => "requestMore",
                "less" => "requestLess",
                other => other,
            };
            profile_sources.push((uri, interaction.to_string()));
        }

        let embedded = self.index.embedded_uris(user).await?;
        let missing: Vec<String> = profile_sources
            .iter()
            .map(|(uri, _)| uri.clone())
            .filter(|uri| !embedded.contains(uri))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let missing_posts = self.db.get_posts(&missing).await?;
        self.embed_posts(user, &missing_posts).await?;

        // 4. Profile build
        let centroids = self.build_profile(user, &profile_sources).await?;

        // 5 & 6. Per-centroid search, dedup by max semantic score
        let interactions = self.db.get_user_interactions(user).await?;
        let seen_since = (Utc::now() - Duration::days(FEEDBACK_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let seen_counts = self.db.get_seen_counts(user, &seen_since).await?;

        let mut best: HashMap<String, (f64, i64)> = HashMap::new();
        let mut reputation_cache: HashMap<String, f64> = HashMap::new();
        for centroid in &centroids {
            let limit = (400.0 * centroid.weight).round() as usize + 200;
            let hits = self
                .index
                .search(
                    POST_COLLECTION,
                    &centroid.centroid,
                    limit,
                    SEARCH_THRESHOLD,
                    "discoveredBy",
                    user,
                )
                .await?;
            for hit in hits {
                let Some(uri) = hit.payload.get("uri").and_then(|u| u.as_str()) else {
                    continue;
                };
                if interactions
                    .get(uri)
                    .is_some_and(|k| k.contains(&InteractionKind::Like))
                {
                    continue;
                }
                if seen_counts.get(uri).copied().unwrap_or(0) >= SEEN_DROP {
                    continue;
                }
                if let Some(author) = hit.payload.get("author").and_then(|a| a.as_str()) {
                    let reputation = match reputation_cache.get(author) {
                        Some(&r) => r,
                        None => {
                            let r = self
                                .db
                                .get_taste_reputation(user, author)
                                .await?
                                .map(|rep| rep.reputation_score)
                                .unwrap_or(1.0);
                            reputation_cache.insert(author.to_string(), r);
                            r
                        }
                    };
                    if reputation < MIN_AUTHOR_REPUTATION {
                        continue;
                    }
                }

                let entry = best
                    .entry(uri.to_string())
                    .or_insert((hit.score, centroid.cluster_id));
                if hit.score > entry.0 {
                    *entry = (hit.score, centroid.cluster_id);
                }
            }
        }

        let mut merged: Vec<(String, f64, i64)> = best
            .into_iter()
            .map(|(uri, (score, cluster))| (uri, score, cluster))
            .collect();
        merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(BATCH_TOP_K);

        // 7. Persist
        let batch_id = new_batch_id();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rows: Vec<CandidateBatchRow> = merged
            .into_iter()
            .map(|(uri, semantic_score, centroid_id)| CandidateBatchRow {
                user_did: user.to_string(),
                uri: uri.clone(),
                semantic_score,
                pipeline_score: pipeline_scores
                    .get(&uri)
                    .copied()
                    .unwrap_or(DISCOVERY_BASELINE),
                centroid_id,
                batch_id: batch_id.clone(),
                generated_at: now.clone(),
            })
            .collect();
        self.db.insert_candidate_batch(&rows).await?;

        // 8. Orphan cleanup: points neither in the new batch nor among the
        // profile sources are dead weight. Skipped when no batch came out —
        // a profile-less run would otherwise churn-delete fresh embeddings.
        if !rows.is_empty() {
            let mut referenced: HashSet<String> = rows.iter().map(|r| r.uri.clone()).collect();
            referenced.extend(profile_sources.iter().map(|(uri, _)| uri.clone()));
            let all_embedded = self.index.embedded_uris(user).await?;
            let orphan_ids: Vec<u64> = all_embedded
                .difference(&referenced)
                .map(|uri| point_id(user, uri))
                .collect();
            if !orphan_ids.is_empty() {
                self.index
                    .delete_points(POST_COLLECTION, orphan_ids)
                    .await?;
            }
        }

        Ok(rows.len())
    }

    /// Embed and upsert a set of posts under the user's partition.
    /// Image posts get hydrated through the AppView for URLs and alt text.
    async fn embed_posts(&self, user: &str, posts: &[Post]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let image_uris: Vec<String> = posts
            .iter()
            .filter(|p| p.has_image)
            .map(|p| p.uri.clone())
            .collect();
        let views: HashMap<String, (Vec<String>, Vec<String>)> = if image_uris.is_empty() {
            HashMap::new()
        } else {
            self.appview
                .get_post_views(&image_uris)
                .await
                .into_iter()
                .map(|view| {
                    let refs = view.image_refs(MAX_IMAGE_REFS);
                    (view.uri, refs)
                })
                .collect()
        };

        let inputs: Vec<EmbedInput> = posts
            .iter()
            .map(|post| {
                let (image_urls, alt_text) =
                    views.get(&post.uri).cloned().unwrap_or_default();
                EmbedInput {
                    uri: post.uri.clone(),
                    text: post.text.clone().unwrap_or_default(),
                    image_urls,
                    alt_text,
                }
            })
            .collect();

        let by_uri: HashMap<&str, &Post> =
            posts.iter().map(|p| (p.uri.as_str(), p)).collect();

        for chunk in inputs.chunks(EMBED_BATCH) {
            let vectors = match self.embedder.embed(chunk).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(user, error = %e, "Embed batch failed, skipping");
                    continue;
                }
            };
            let points: Vec<VectorPoint> = vectors
                .into_iter()
                .filter_map(|(uri, vector)| {
                    let post = by_uri.get(uri.as_str())?;
                    Some(VectorPoint {
                        id: point_id(user, &uri),
                        vector,
                        payload: json!({
                            "uri": uri,
                            "author": post.author,
                            "indexedAt": post.indexed_at,
                            "likeCount": post.like_count,
                            "discoveredBy": user,
                        }),
                    })
                })
                .collect();
            self.index.upsert(POST_COLLECTION, points).await?;
        }
        Ok(())
    }

    /// Cluster the user's liked-post vectors into interest centroids and
    /// replace the stored profile points.
    async fn build_profile(
        &self,
        user: &str,
        sources: &[(String, String)],
    ) -> Result<Vec<clusterer::Centroid>> {
        let ids: Vec<u64> = sources
            .iter()
            .map(|(uri, _)| point_id(user, uri))
            .collect();
        let vectors = self.index.fetch_vectors(POST_COLLECTION, ids).await?;

        let inputs: Vec<ClusterInput> = sources
            .iter()
            .filter_map(|(uri, interaction)| {
                vectors
                    .get(&point_id(user, uri))
                    .map(|vector| ClusterInput {
                        vector: vector.clone(),
                        weight: None,
                        interaction_type: interaction.clone(),
                    })
            })
            .collect();

        if inputs.len() < MIN_CLUSTER_INPUT {
            info!(user, vectors = inputs.len(), "Too few liked vectors for a profile");
            // Keep whatever profile already exists
            return Ok(Vec::new());
        }

        let mut centroids = self.clusterer.cluster(&inputs).await?;
        if centroids.is_empty() {
            return Ok(Vec::new());
        }
        // The CLI contract promises unit-norm centroids; enforce it before
        // anything searches against or persists them
        for centroid in &mut centroids {
            clusterer::l2_normalize(&mut centroid.centroid);
        }

        self.index
            .delete_by_filter(PROFILE_COLLECTION, "userDid", user)
            .await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let points: Vec<VectorPoint> = centroids
            .iter()
            .map(|centroid| VectorPoint {
                id: point_id(user, &format!("profile::{}", centroid.cluster_id)),
                vector: centroid.centroid.clone(),
                payload: json!({
                    "userDid": user,
                    "clusterId": centroid.cluster_id,
                    "weight": centroid.weight,
                    "postCount": centroid.post_count,
                    "updatedAt": now,
                }),
            })
            .collect();
        self.index.upsert(PROFILE_COLLECTION, points).await?;

        Ok(centroids)
    }
}

/// Short hex batch id: two timestamp bytes and two random bytes.
pub fn new_batch_id() -> String {
    let ts = (Utc::now().timestamp() as u32).to_be_bytes();
    let mut random = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut random);
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        ts[2], ts[3], random[0], random[1]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_shape() {
        let id = new_batch_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_batch_ids_vary() {
        let ids: HashSet<String> = (0..32).map(|_| new_batch_id()).collect();
        assert!(ids.len() > 1);
    }
}
