// SqliteDatabase — rusqlite backend implementing the Database trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// The lock is never held across .await points — Rust enforces this because
// MutexGuard is !Send.
//
// The free functions in queries.rs remain usable against a bare Connection,
// so query-level tests don't need the async wrapper.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::warn;

use super::models::{
    AuthorFatigue, CandidateBatchRow, InfluentialL2, IngestBatch, InteractionEdge,
    InteractionKind, Post, TasteReputation, UserKeyword,
};
use super::queries::{self, NetworkInteractionRow, StoreStats};
use super::traits::Database;

/// Attempts for a contended flush before surfacing the error.
const FLUSH_ATTEMPTS: u32 = 3;

/// Backoff between contended flush attempts.
const FLUSH_BACKOFF: Duration = Duration::from_secs(1);

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED style contention errors.
fn is_busy(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Apply one ingest batch inside a transaction. Counter deltas are applied
/// in URI-sorted order so two writers can't deadlock on row locks.
fn flush_ingest_once(conn: &mut Connection, batch: &IngestBatch) -> Result<()> {
    let tx = conn.transaction()?;

    for chunk in batch.posts.chunks(queries::INSERT_CHUNK) {
        queries::insert_posts(&tx, chunk)?;
    }
    for chunk in batch.deletes.chunks(queries::INSERT_CHUNK) {
        queries::delete_posts(&tx, chunk)?;
    }

    let mut counters = batch.counters.clone();
    counters.sort_by(|a, b| a.0.cmp(&b.0));
    for (uri, likes, reposts, replies) in &counters {
        queries::apply_counter_delta(&tx, uri, *likes, *reposts, *replies)?;
    }

    for chunk in batch.interactions.chunks(queries::INSERT_CHUNK) {
        queries::insert_interactions(&tx, chunk)?;
    }

    tx.commit()?;
    Ok(())
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        queries::get_meta(&conn, key)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::set_meta(&conn, key, value)
    }

    async fn flush_ingest(&self, batch: &IngestBatch) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let mut conn = self.conn.lock().await;
                flush_ingest_once(&mut conn, batch)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if is_busy(&err) && attempt + 1 < FLUSH_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, "Flush hit store contention, backing off");
                    tokio::time::sleep(FLUSH_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_post(&self, uri: &str) -> Result<Option<Post>> {
        let conn = self.conn.lock().await;
        queries::get_post(&conn, uri)
    }

    async fn get_posts(&self, uris: &[String]) -> Result<Vec<Post>> {
        let conn = self.conn.lock().await;
        queries::get_posts(&conn, uris)
    }

    async fn get_thread_posts(&self, roots: &[String]) -> Result<Vec<Post>> {
        let conn = self.conn.lock().await;
        queries::get_thread_posts(&conn, roots)
    }

    async fn recall_by_authors_or_likes(
        &self,
        authors: &HashSet<String>,
        min_likes: i64,
        since: &str,
        until: Option<&str>,
        cap: usize,
    ) -> Result<Vec<Post>> {
        let conn = self.conn.lock().await;
        queries::recall_by_authors_or_likes(&conn, authors, min_likes, since, until, cap)
    }

    async fn recall_by_likes(&self, min_likes: i64, since: &str, cap: usize) -> Result<Vec<Post>> {
        let conn = self.conn.lock().await;
        queries::recall_by_likes(&conn, min_likes, since, cap)
    }

    async fn twin_liked_uris(
        &self,
        twins: &HashSet<String>,
        since: &str,
        cap: usize,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        queries::twin_liked_uris(&conn, twins, since, cap)
    }

    async fn insert_follows(&self, edges: &[(String, String)], now: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::insert_follows(&conn, edges, now)
    }

    async fn get_followees(&self, follower: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_followees(&conn, follower)
    }

    async fn get_mutuals(&self, user: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_mutuals(&conn, user)
    }

    async fn count_l1_followers(
        &self,
        user: &str,
        candidates: &HashSet<String>,
    ) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().await;
        queries::count_l1_followers(&conn, user, candidates)
    }

    async fn replace_influential_l2(&self, user: &str, rows: &[InfluentialL2]) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::replace_influential_l2(&conn, user, rows)
    }

    async fn get_influential_l2(&self, user: &str) -> Result<Vec<InfluentialL2>> {
        let conn = self.conn.lock().await;
        queries::get_influential_l2(&conn, user)
    }

    async fn insert_interactions(&self, edges: &[InteractionEdge]) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::insert_interactions(&conn, edges)
    }

    async fn get_local_likers(&self, target: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_local_likers(&conn, target)
    }

    async fn get_interacted_authors(&self, user: &str, since: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_interacted_authors(&conn, user, since)
    }

    async fn get_user_interactions(
        &self,
        user: &str,
    ) -> Result<HashMap<String, HashSet<InteractionKind>>> {
        let conn = self.conn.lock().await;
        queries::get_user_interactions(&conn, user)
    }

    async fn get_network_interactions(
        &self,
        uris: &[String],
        actors: &HashSet<String>,
    ) -> Result<Vec<NetworkInteractionRow>> {
        let conn = self.conn.lock().await;
        queries::get_network_interactions(&conn, uris, actors)
    }

    async fn get_recent_like_targets(
        &self,
        user: &str,
        since: &str,
    ) -> Result<Vec<(String, InteractionKind)>> {
        let conn = self.conn.lock().await;
        queries::get_recent_like_targets(&conn, user, since)
    }

    async fn get_media_like_ratio(&self, user: &str, since: &str) -> Result<(f64, f64)> {
        let conn = self.conn.lock().await;
        queries::get_media_like_ratio(&conn, user, since)
    }

    async fn bump_taste_similarity(&self, user: &str, other: &str, now: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::bump_taste_similarity(&conn, user, other, now)
    }

    async fn get_taste_reputation(
        &self,
        user: &str,
        other: &str,
    ) -> Result<Option<TasteReputation>> {
        let conn = self.conn.lock().await;
        queries::get_taste_reputation(&conn, user, other)
    }

    async fn upsert_taste_reputation(&self, rep: &TasteReputation) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_taste_reputation(&conn, rep)
    }

    async fn get_taste_twins(
        &self,
        user: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock().await;
        queries::get_taste_twins(&conn, user, min_score, limit)
    }

    async fn get_author_fatigue(&self, user: &str, author: &str) -> Result<Option<AuthorFatigue>> {
        let conn = self.conn.lock().await;
        queries::get_author_fatigue(&conn, user, author)
    }

    async fn upsert_author_fatigue(&self, fatigue: &AuthorFatigue) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_author_fatigue(&conn, fatigue)
    }

    async fn get_fatigue_for_authors(
        &self,
        user: &str,
        authors: &HashSet<String>,
    ) -> Result<HashMap<String, AuthorFatigue>> {
        let conn = self.conn.lock().await;
        queries::get_fatigue_for_authors(&conn, user, authors)
    }

    async fn get_user_keywords(&self, user: &str) -> Result<Vec<UserKeyword>> {
        let conn = self.conn.lock().await;
        queries::get_user_keywords(&conn, user)
    }

    async fn upsert_user_keyword(
        &self,
        user: &str,
        keyword: &str,
        score: f64,
        now: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::upsert_user_keyword(&conn, user, keyword, score, now)
    }

    async fn prune_user_keywords(&self, user: &str, floor: f64) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::prune_user_keywords(&conn, user, floor)
    }

    async fn get_liked_texts(&self, user: &str, since: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_liked_texts(&conn, user, since, limit)
    }

    async fn get_random_texts(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_random_texts(&conn, limit)
    }

    async fn record_served(&self, user: &str, uris: &[String], now: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::record_served(&conn, user, uris, now)
    }

    async fn get_served_uris(&self, user: &str, since: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        queries::get_served_uris(&conn, user, since)
    }

    async fn record_seen(&self, user: &str, uri: &str, now: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::record_seen(&conn, user, uri, now)
    }

    async fn get_seen_counts(&self, user: &str, since: &str) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().await;
        queries::get_seen_counts(&conn, user, since)
    }

    async fn record_feedback(
        &self,
        user: &str,
        uri: &str,
        action: &str,
        strength: &str,
        now: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::record_feedback(&conn, user, uri, action, strength, now)
    }

    async fn get_recent_feedback(
        &self,
        user: &str,
        since: &str,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        queries::get_recent_feedback(&conn, user, since)
    }

    async fn insert_candidate_batch(&self, rows: &[CandidateBatchRow]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let conn = self.conn.lock().await;
                queries::insert_candidate_batch(&conn, rows)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if is_busy(&err) && attempt + 1 < FLUSH_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, "Candidate-batch insert contended, backing off");
                    tokio::time::sleep(FLUSH_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn load_candidate_batch(
        &self,
        user: &str,
        since: &str,
    ) -> Result<Vec<CandidateBatchRow>> {
        let conn = self.conn.lock().await;
        queries::load_candidate_batch(&conn, user, since)
    }

    async fn gc_served(&self, before: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::gc_served(&conn, before)
    }

    async fn gc_seen(&self, before: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::gc_seen(&conn, before)
    }

    async fn gc_candidate_batches(&self, before: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::gc_candidate_batches(&conn, before)
    }

    async fn gc_posts(&self, before: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        queries::gc_posts(&conn, before)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        queries::get_stats(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewPost;
    use crate::db::schema::create_tables;

    fn test_db() -> SqliteDatabase {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        SqliteDatabase::new(conn)
    }

    fn new_post(uri: &str) -> NewPost {
        NewPost {
            uri: uri.to_string(),
            cid: "cid".to_string(),
            author: "did:plc:author".to_string(),
            indexed_at: "2026-01-01T00:00:00Z".to_string(),
            reply_root: None,
            reply_parent: None,
            text: Some("post body".to_string()),
            has_image: false,
            has_video: false,
            has_external: false,
        }
    }

    #[tokio::test]
    async fn test_flush_ingest_applies_all_sections() {
        let db = test_db();
        let batch = IngestBatch {
            posts: vec![new_post("at://a/p/1"), new_post("at://a/p/2")],
            deletes: vec![],
            counters: vec![("at://a/p/1".to_string(), 2, 1, 0)],
            interactions: vec![InteractionEdge {
                actor: "did:plc:u".to_string(),
                target: "at://a/p/1".to_string(),
                kind: InteractionKind::Like,
                weight: 1,
                indexed_at: "2026-01-01T00:00:00Z".to_string(),
                interaction_uri: None,
            }],
        };
        db.flush_ingest(&batch).await.unwrap();

        let post = db.get_post("at://a/p/1").await.unwrap().unwrap();
        assert_eq!(post.like_count, 2);
        assert_eq!(post.repost_count, 1);
        let likers = db.get_local_likers("at://a/p/1").await.unwrap();
        assert_eq!(likers, vec!["did:plc:u".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_ingest_delete_has_no_cascade() {
        let db = test_db();
        db.flush_ingest(&IngestBatch {
            posts: vec![new_post("at://a/p/1"), new_post("at://a/p/2")],
            counters: vec![("at://a/p/2".to_string(), 3, 0, 0)],
            ..Default::default()
        })
        .await
        .unwrap();

        db.flush_ingest(&IngestBatch {
            deletes: vec!["at://a/p/1".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(db.get_post("at://a/p/1").await.unwrap().is_none());
        let survivor = db.get_post("at://a/p/2").await.unwrap().unwrap();
        assert_eq!(survivor.like_count, 3);
    }

    #[tokio::test]
    async fn test_flush_ingest_replay_is_absorbed() {
        let db = test_db();
        let batch = IngestBatch {
            posts: vec![new_post("at://a/p/1")],
            interactions: vec![InteractionEdge {
                actor: "did:plc:u".to_string(),
                target: "at://a/p/1".to_string(),
                kind: InteractionKind::Like,
                weight: 1,
                indexed_at: "2026-01-01T00:00:00Z".to_string(),
                interaction_uri: None,
            }],
            ..Default::default()
        };
        db.flush_ingest(&batch).await.unwrap();
        db.flush_ingest(&batch).await.unwrap();

        let likers = db.get_local_likers("at://a/p/1").await.unwrap();
        assert_eq!(likers.len(), 1);
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let db = test_db();
        db.set_meta("firehose_cursor", "1700000000000000")
            .await
            .unwrap();
        assert_eq!(
            db.get_meta("firehose_cursor").await.unwrap(),
            Some("1700000000000000".to_string())
        );
    }
}
