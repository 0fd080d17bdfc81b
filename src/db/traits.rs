// Database trait — backend-agnostic async interface for all DB operations.
//
// All methods are async so a sync backend (rusqlite via Mutex) and any
// future native-async backend fit behind a single interface. The trait
// mirrors the queries.rs function signatures; SqliteDatabase delegates
// method-for-method.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use super::models::{
    AuthorFatigue, CandidateBatchRow, InfluentialL2, IngestBatch, InteractionEdge,
    InteractionKind, Post, TasteReputation, UserKeyword,
};
use super::queries::{NetworkInteractionRow, StoreStats};

#[async_trait]
pub trait Database: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> Result<i64>;

    // --- Meta state ---

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    // --- Ingest ---

    /// Apply one accumulated firehose batch in a single transaction,
    /// retrying on store contention (3 attempts, 1 s backoff).
    async fn flush_ingest(&self, batch: &IngestBatch) -> Result<()>;

    // --- Posts ---

    async fn get_post(&self, uri: &str) -> Result<Option<Post>>;
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<Post>>;
    async fn get_thread_posts(&self, roots: &[String]) -> Result<Vec<Post>>;

    // --- Recall ---

    async fn recall_by_authors_or_likes(
        &self,
        authors: &HashSet<String>,
        min_likes: i64,
        since: &str,
        until: Option<&str>,
        cap: usize,
    ) -> Result<Vec<Post>>;
    async fn recall_by_likes(&self, min_likes: i64, since: &str, cap: usize) -> Result<Vec<Post>>;
    async fn twin_liked_uris(
        &self,
        twins: &HashSet<String>,
        since: &str,
        cap: usize,
    ) -> Result<Vec<(String, String)>>;

    // --- Follow graph ---

    async fn insert_follows(&self, edges: &[(String, String)], now: &str) -> Result<()>;
    async fn get_followees(&self, follower: &str) -> Result<Vec<String>>;
    async fn get_mutuals(&self, user: &str) -> Result<Vec<String>>;
    async fn count_l1_followers(
        &self,
        user: &str,
        candidates: &HashSet<String>,
    ) -> Result<HashMap<String, i64>>;
    async fn replace_influential_l2(&self, user: &str, rows: &[InfluentialL2]) -> Result<()>;
    async fn get_influential_l2(&self, user: &str) -> Result<Vec<InfluentialL2>>;

    // --- Interaction edges ---

    async fn insert_interactions(&self, edges: &[InteractionEdge]) -> Result<()>;
    async fn get_local_likers(&self, target: &str) -> Result<Vec<String>>;
    async fn get_interacted_authors(&self, user: &str, since: &str) -> Result<Vec<String>>;
    async fn get_user_interactions(
        &self,
        user: &str,
    ) -> Result<HashMap<String, HashSet<InteractionKind>>>;
    async fn get_network_interactions(
        &self,
        uris: &[String],
        actors: &HashSet<String>,
    ) -> Result<Vec<NetworkInteractionRow>>;
    async fn get_recent_like_targets(
        &self,
        user: &str,
        since: &str,
    ) -> Result<Vec<(String, InteractionKind)>>;
    async fn get_media_like_ratio(&self, user: &str, since: &str) -> Result<(f64, f64)>;

    // --- Taste ---

    async fn bump_taste_similarity(&self, user: &str, other: &str, now: &str) -> Result<()>;
    async fn get_taste_reputation(
        &self,
        user: &str,
        other: &str,
    ) -> Result<Option<TasteReputation>>;
    async fn upsert_taste_reputation(&self, rep: &TasteReputation) -> Result<()>;
    async fn get_taste_twins(
        &self,
        user: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    // --- Author fatigue ---

    async fn get_author_fatigue(&self, user: &str, author: &str) -> Result<Option<AuthorFatigue>>;
    async fn upsert_author_fatigue(&self, fatigue: &AuthorFatigue) -> Result<()>;
    async fn get_fatigue_for_authors(
        &self,
        user: &str,
        authors: &HashSet<String>,
    ) -> Result<HashMap<String, AuthorFatigue>>;

    // --- Keywords ---

    async fn get_user_keywords(&self, user: &str) -> Result<Vec<UserKeyword>>;
    async fn upsert_user_keyword(
        &self,
        user: &str,
        keyword: &str,
        score: f64,
        now: &str,
    ) -> Result<()>;
    async fn prune_user_keywords(&self, user: &str, floor: f64) -> Result<usize>;

    // --- Corpora ---

    async fn get_liked_texts(&self, user: &str, since: &str, limit: usize) -> Result<Vec<String>>;
    async fn get_random_texts(&self, limit: usize) -> Result<Vec<String>>;

    // --- Served / seen ---

    async fn record_served(&self, user: &str, uris: &[String], now: &str) -> Result<()>;
    async fn get_served_uris(&self, user: &str, since: &str) -> Result<Vec<String>>;
    async fn record_seen(&self, user: &str, uri: &str, now: &str) -> Result<()>;
    async fn get_seen_counts(&self, user: &str, since: &str) -> Result<HashMap<String, i64>>;

    // --- Explicit feedback ---

    async fn record_feedback(
        &self,
        user: &str,
        uri: &str,
        action: &str,
        strength: &str,
        now: &str,
    ) -> Result<()>;
    async fn get_recent_feedback(&self, user: &str, since: &str)
        -> Result<Vec<(String, String)>>;

    // --- Candidate batches ---

    async fn insert_candidate_batch(&self, rows: &[CandidateBatchRow]) -> Result<()>;
    async fn load_candidate_batch(&self, user: &str, since: &str)
        -> Result<Vec<CandidateBatchRow>>;

    // --- Garbage collection ---

    async fn gc_served(&self, before: &str) -> Result<usize>;
    async fn gc_seen(&self, before: &str) -> Result<usize>;
    async fn gc_candidate_batches(&self, before: &str) -> Result<usize>;
    async fn gc_posts(&self, before: &str) -> Result<usize>;

    // --- Status ---

    async fn get_stats(&self) -> Result<StoreStats>;
}
