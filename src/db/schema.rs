// Database schema — table creation and migrations.
//
// We use a simple version-based migration approach: a `schema_version` table
// tracks which migrations have run, and each migration is a function that
// executes SQL statements. Migrations are forward-only and run on startup.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// This is idempotent — safe to call on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Tracks schema version for future migrations
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Indexed posts from the firehose. reply_root/reply_parent are weak
        -- keys: URIs that may or may not resolve to another row.
        CREATE TABLE IF NOT EXISTS post (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            author TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            like_count INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER NOT NULL DEFAULT 0,
            repost_count INTEGER NOT NULL DEFAULT 0,
            reply_root TEXT,
            reply_parent TEXT,
            text TEXT,
            has_image INTEGER NOT NULL DEFAULT 0,
            has_video INTEGER NOT NULL DEFAULT 0,
            has_external INTEGER NOT NULL DEFAULT 0
        );

        -- Follow edges discovered by the graph service
        CREATE TABLE IF NOT EXISTS graph_follow (
            follower TEXT NOT NULL,
            followee TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            PRIMARY KEY (follower, followee)
        );

        -- Interaction edges (like / repost / reply) by tracked actors
        CREATE TABLE IF NOT EXISTS graph_interaction (
            actor TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            indexed_at TEXT NOT NULL,
            interaction_uri TEXT,
            PRIMARY KEY (actor, target, kind)
        );

        -- Influential layer-2 accounts, refreshed at most once per TTL
        CREATE TABLE IF NOT EXISTS influential_l2 (
            user_did TEXT NOT NULL,
            l2_did TEXT NOT NULL,
            influence_score REAL NOT NULL,
            l1_follower_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, l2_did)
        );

        -- Posts placed in a feed response (GC after 6 h)
        CREATE TABLE IF NOT EXISTS user_served_post (
            user_did TEXT NOT NULL,
            uri TEXT NOT NULL,
            served_at TEXT NOT NULL,
            PRIMARY KEY (user_did, uri, served_at)
        );

        -- Posts the client reported as visible (GC after 8 h)
        CREATE TABLE IF NOT EXISTS user_seen_post (
            user_did TEXT NOT NULL,
            uri TEXT NOT NULL,
            seen_at TEXT NOT NULL,
            PRIMARY KEY (user_did, uri, seen_at)
        );

        -- Per-user keyword interest scores, pruned below |0.1|
        CREATE TABLE IF NOT EXISTS user_keyword (
            user_did TEXT NOT NULL,
            keyword TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, keyword)
        );

        -- Co-like counts between a user and other actors
        CREATE TABLE IF NOT EXISTS taste_similarity (
            user_did TEXT NOT NULL,
            similar_did TEXT NOT NULL,
            agreement_count INTEGER NOT NULL DEFAULT 0,
            total_co_liked INTEGER NOT NULL DEFAULT 0,
            last_agreement_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, similar_did)
        );

        -- Decaying reputation of taste-twins
        CREATE TABLE IF NOT EXISTS taste_reputation (
            user_did TEXT NOT NULL,
            similar_did TEXT NOT NULL,
            reputation_score REAL NOT NULL,
            agreement_history REAL NOT NULL DEFAULT 0,
            last_seen_at TEXT,
            decay_rate REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, similar_did)
        );

        -- Per-author serving fatigue and affinity
        CREATE TABLE IF NOT EXISTS user_author_fatigue (
            user_did TEXT NOT NULL,
            author_did TEXT NOT NULL,
            serve_count INTEGER NOT NULL DEFAULT 0,
            last_served_at TEXT,
            fatigue_score REAL NOT NULL DEFAULT 0,
            affinity_score REAL NOT NULL DEFAULT 1.0,
            interaction_weight REAL NOT NULL DEFAULT 0,
            last_interaction_at TEXT,
            interaction_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, author_did)
        );

        -- Materialized semantic candidate batches (TTL 12 h)
        CREATE TABLE IF NOT EXISTS user_candidate_batch (
            user_did TEXT NOT NULL,
            uri TEXT NOT NULL,
            semantic_score REAL NOT NULL,
            pipeline_score REAL NOT NULL,
            centroid_id INTEGER NOT NULL,
            batch_id TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            PRIMARY KEY (user_did, uri, batch_id)
        );

        -- Key/value state: firehose cursor, graph rebuild gates, job clocks
        CREATE TABLE IF NOT EXISTS meta_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_post_author ON post(author);
        CREATE INDEX IF NOT EXISTS idx_post_indexed_at ON post(indexed_at);
        CREATE INDEX IF NOT EXISTS idx_post_like_count ON post(like_count);
        CREATE INDEX IF NOT EXISTS idx_follow_follower ON graph_follow(follower);
        CREATE INDEX IF NOT EXISTS idx_interaction_target ON graph_interaction(target);
        CREATE INDEX IF NOT EXISTS idx_interaction_actor ON graph_interaction(actor);
        CREATE INDEX IF NOT EXISTS idx_served_user_uri ON user_served_post(user_did, uri);
        CREATE INDEX IF NOT EXISTS idx_seen_user_uri ON user_seen_post(user_did, uri);
        CREATE INDEX IF NOT EXISTS idx_fatigue_user_score ON user_author_fatigue(user_did, fatigue_score);
        CREATE INDEX IF NOT EXISTS idx_batch_user_generated ON user_candidate_batch(user_did, generated_at);
        CREATE INDEX IF NOT EXISTS idx_batch_user_semantic ON user_candidate_batch(user_did, semantic_score);
        ",
    )
    .context("Failed to create database tables")?;

    // Record initial schema version if not already set
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    // Migration v2: reply_root index for reply-cluster grouping.
    run_migration(conn, 2, |c| {
        c.execute_batch("CREATE INDEX IF NOT EXISTS idx_post_reply_root ON post(reply_root);")
    })?;

    // Migration v3: actor+kind+time index so the taste-similar recall bucket
    // and recency-bounded interaction scans don't walk the whole table.
    run_migration(conn, 3, |c| {
        c.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_interaction_actor_kind
                 ON graph_interaction(actor, kind, indexed_at);",
        )
    })?;

    // Migration v4: explicit feedback log. The semantic profile builder reads
    // a 7-day window of these alongside likes and reposts.
    run_migration(conn, 4, |c| {
        c.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_feedback (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_did TEXT NOT NULL,
                 uri TEXT NOT NULL,
                 action TEXT NOT NULL,
                 strength TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_feedback_user_created
                 ON user_feedback(user_did, created_at);",
        )
    })?;

    Ok(())
}

/// Run a migration if it hasn't been applied yet.
/// The migration function receives the connection and should execute its SQL.
fn run_migration<F>(conn: &Connection, version: i64, migrate: F) -> Result<()>
where
    F: FnOnce(&Connection) -> rusqlite::Result<()>,
{
    let already_applied: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM schema_version WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    if !already_applied {
        migrate(conn).with_context(|| format!("Migration v{version} failed"))?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_table_count() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let count = table_count(&conn).unwrap();
        // schema_version, post, graph_follow, graph_interaction,
        // influential_l2, user_served_post, user_seen_post, user_keyword,
        // taste_similarity, taste_reputation, user_author_fatigue,
        // user_candidate_batch, meta_state, user_feedback = 14 tables
        assert_eq!(count, 14i64);
    }

    #[test]
    fn test_migrations_recorded_once() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_counter_columns_default_to_zero() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn.execute(
            "INSERT INTO post (uri, cid, author, indexed_at)
             VALUES ('at://a/p/1', 'cid1', 'did:plc:a', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let (likes, replies, reposts): (i64, i64, i64) = conn
            .query_row(
                "SELECT like_count, reply_count, repost_count FROM post WHERE uri = 'at://a/p/1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((likes, replies, reposts), (0, 0, 0));
    }
}
