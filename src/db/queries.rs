// Database queries — CRUD operations for all tables.
//
// Every database interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.
//
// Large DID/URI sets are staged in temp tables rather than inlined as
// parameter lists — recall predicates routinely carry thousands of authors.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{
    AuthorFatigue, CandidateBatchRow, InfluentialL2, InteractionEdge, InteractionKind, NewPost,
    Post, TasteReputation, UserKeyword,
};

/// Maximum rows per bulk INSERT statement.
pub const INSERT_CHUNK: usize = 500;

// --- Meta state ---

/// Get a meta state value by key (e.g., "firehose_cursor").
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM meta_state WHERE key = ?1")?;
    let result = stmt.query_row(params![key], |row| row.get(0)).optional()?;
    Ok(result)
}

/// Set a meta state value (upsert).
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta_state (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

// --- Temp-table staging ---

/// Stage a set of strings into a temp table named `name` (single column `v`).
/// The table is recreated on every call; temp tables are connection-local.
fn stage_set<'a>(
    conn: &Connection,
    name: &str,
    values: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS temp.{name};
         CREATE TEMP TABLE {name} (v TEXT PRIMARY KEY);"
    ))?;
    let mut stmt = conn.prepare(&format!("INSERT OR IGNORE INTO temp.{name} (v) VALUES (?1)"))?;
    for value in values {
        stmt.execute(params![value])?;
    }
    Ok(())
}

// --- Posts ---

/// Insert post rows, ignoring URIs that already exist (firehose replays).
pub fn insert_posts(conn: &Connection, posts: &[NewPost]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO post (uri, cid, author, indexed_at, reply_root, reply_parent,
                           text, has_image, has_video, has_external)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(uri) DO NOTHING",
    )?;
    for post in posts {
        stmt.execute(params![
            post.uri,
            post.cid,
            post.author,
            post.indexed_at,
            post.reply_root,
            post.reply_parent,
            post.text,
            post.has_image,
            post.has_video,
            post.has_external,
        ])?;
    }
    Ok(())
}

/// Hard-delete posts by URI. No cascades: counters on other posts stand.
pub fn delete_posts(conn: &Connection, uris: &[String]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM post WHERE uri = ?1")?;
    for uri in uris {
        stmt.execute(params![uri])?;
    }
    Ok(())
}

/// Apply one post's counter deltas. Counters are clamped at zero so a
/// delete-then-unlike replay can never drive them negative.
pub fn apply_counter_delta(
    conn: &Connection,
    uri: &str,
    likes: i64,
    reposts: i64,
    replies: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE post SET
            like_count = MAX(0, like_count + ?2),
            repost_count = MAX(0, repost_count + ?3),
            reply_count = MAX(0, reply_count + ?4)
         WHERE uri = ?1",
        params![uri, likes, reposts, replies],
    )?;
    Ok(())
}

fn post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        uri: row.get(0)?,
        cid: row.get(1)?,
        author: row.get(2)?,
        indexed_at: row.get(3)?,
        like_count: row.get(4)?,
        reply_count: row.get(5)?,
        repost_count: row.get(6)?,
        reply_root: row.get(7)?,
        reply_parent: row.get(8)?,
        text: row.get(9)?,
        has_image: row.get(10)?,
        has_video: row.get(11)?,
        has_external: row.get(12)?,
    })
}

const POST_COLUMNS: &str = "uri, cid, author, indexed_at, like_count, reply_count, repost_count,
                            reply_root, reply_parent, text, has_image, has_video, has_external";

/// Fetch a single post by URI.
pub fn get_post(conn: &Connection, uri: &str) -> Result<Option<Post>> {
    let mut stmt = conn.prepare(&format!("SELECT {POST_COLUMNS} FROM post WHERE uri = ?1"))?;
    let result = stmt.query_row(params![uri], post_from_row).optional()?;
    Ok(result)
}

/// Fetch posts for a set of URIs. Missing URIs are silently absent.
pub fn get_posts(conn: &Connection, uris: &[String]) -> Result<Vec<Post>> {
    stage_set(conn, "q_uris", uris.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM post JOIN temp.q_uris ON post.uri = temp.q_uris.v"
    ))?;
    let rows = stmt.query_map([], post_from_row)?;
    let mut posts = Vec::new();
    for row in rows {
        posts.push(row?);
    }
    Ok(posts)
}

/// Fetch every post in the given threads (matched on reply_root or being the
/// root itself). Used by reply-cluster analysis.
pub fn get_thread_posts(conn: &Connection, roots: &[String]) -> Result<Vec<Post>> {
    stage_set(conn, "q_roots", roots.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM post
         WHERE reply_root IN (SELECT v FROM temp.q_roots)
            OR uri IN (SELECT v FROM temp.q_roots)"
    ))?;
    let rows = stmt.query_map([], post_from_row)?;
    let mut posts = Vec::new();
    for row in rows {
        posts.push(row?);
    }
    Ok(posts)
}

// --- Recall buckets ---

/// Recall posts newer than `since` that are either authored by someone in
/// `authors` or carry more than `min_likes` likes. `max_age` bounds the other
/// end of the window for the bridge bucket (pass None for open-ended).
pub fn recall_by_authors_or_likes(
    conn: &Connection,
    authors: &HashSet<String>,
    min_likes: i64,
    since: &str,
    until: Option<&str>,
    cap: usize,
) -> Result<Vec<Post>> {
    stage_set(conn, "q_authors", authors.iter().map(|s| s.as_str()))?;
    let upper = until.unwrap_or("9999-12-31T23:59:59Z");
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM post
         WHERE indexed_at > ?1 AND indexed_at <= ?2
           AND (author IN (SELECT v FROM temp.q_authors) OR like_count > ?3)
         ORDER BY indexed_at DESC
         LIMIT ?4"
    ))?;
    let rows = stmt.query_map(params![since, upper, min_likes, cap as i64], post_from_row)?;
    let mut posts = Vec::new();
    for row in rows {
        posts.push(row?);
    }
    Ok(posts)
}

/// Recall posts newer than `since` with more than `min_likes` likes,
/// regardless of author (the "global gems" bucket's first half).
pub fn recall_by_likes(
    conn: &Connection,
    min_likes: i64,
    since: &str,
    cap: usize,
) -> Result<Vec<Post>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM post
         WHERE indexed_at > ?1 AND like_count > ?2
         ORDER BY like_count DESC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![since, min_likes, cap as i64], post_from_row)?;
    let mut posts = Vec::new();
    for row in rows {
        posts.push(row?);
    }
    Ok(posts)
}

/// URIs recently liked by the given taste-twins, newest first, with the twin
/// who liked each. One row per (uri, twin).
pub fn twin_liked_uris(
    conn: &Connection,
    twins: &HashSet<String>,
    since: &str,
    cap: usize,
) -> Result<Vec<(String, String)>> {
    stage_set(conn, "q_twins", twins.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(
        "SELECT target, actor FROM graph_interaction
         WHERE kind = 'like' AND indexed_at > ?1
           AND actor IN (SELECT v FROM temp.q_twins)
         ORDER BY indexed_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![since, cap as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    let mut uris = Vec::new();
    for row in rows {
        uris.push(row?);
    }
    Ok(uris)
}

// --- Follow edges ---

/// Insert follow edges, ignoring duplicates.
pub fn insert_follows(conn: &Connection, edges: &[(String, String)], now: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO graph_follow (follower, followee, indexed_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(follower, followee) DO NOTHING",
    )?;
    for (follower, followee) in edges {
        stmt.execute(params![follower, followee, now])?;
    }
    Ok(())
}

/// Everyone the given account follows.
pub fn get_followees(conn: &Connection, follower: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT followee FROM graph_follow WHERE follower = ?1")?;
    let rows = stmt.query_map(params![follower], |row| row.get(0))?;
    let mut followees = Vec::new();
    for row in rows {
        followees.push(row?);
    }
    Ok(followees)
}

/// L1 accounts of `user` who also follow `user` back.
pub fn get_mutuals(conn: &Connection, user: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT a.followee FROM graph_follow a
         JOIN graph_follow b ON b.follower = a.followee AND b.followee = a.follower
         WHERE a.follower = ?1",
    )?;
    let rows = stmt.query_map(params![user], |row| row.get(0))?;
    let mut mutuals = Vec::new();
    for row in rows {
        mutuals.push(row?);
    }
    Ok(mutuals)
}

/// For each candidate DID, how many of the user's L1 follow it.
pub fn count_l1_followers(
    conn: &Connection,
    user: &str,
    candidates: &HashSet<String>,
) -> Result<HashMap<String, i64>> {
    stage_set(conn, "q_l2", candidates.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(
        "SELECT g.followee, COUNT(DISTINCT g.follower)
         FROM graph_follow g
         WHERE g.followee IN (SELECT v FROM temp.q_l2)
           AND g.follower IN (SELECT followee FROM graph_follow WHERE follower = ?1)
         GROUP BY g.followee",
    )?;
    let rows = stmt.query_map(params![user], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut counts = HashMap::new();
    for row in rows {
        let (did, count): (String, i64) = row?;
        counts.insert(did, count);
    }
    Ok(counts)
}

// --- Influential L2 cache ---

/// Replace the influential-L2 cache for one user.
pub fn replace_influential_l2(
    conn: &Connection,
    user: &str,
    rows: &[InfluentialL2],
) -> Result<()> {
    conn.execute("DELETE FROM influential_l2 WHERE user_did = ?1", params![user])?;
    let mut stmt = conn.prepare(
        "INSERT INTO influential_l2 (user_did, l2_did, influence_score, l1_follower_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.user_did,
            row.l2_did,
            row.influence_score,
            row.l1_follower_count,
            row.updated_at,
        ])?;
    }
    Ok(())
}

/// Load the influential-L2 cache for one user, strongest first.
pub fn get_influential_l2(conn: &Connection, user: &str) -> Result<Vec<InfluentialL2>> {
    let mut stmt = conn.prepare(
        "SELECT user_did, l2_did, influence_score, l1_follower_count, updated_at
         FROM influential_l2 WHERE user_did = ?1
         ORDER BY influence_score DESC",
    )?;
    let rows = stmt.query_map(params![user], |row| {
        Ok(InfluentialL2 {
            user_did: row.get(0)?,
            l2_did: row.get(1)?,
            influence_score: row.get(2)?,
            l1_follower_count: row.get(3)?,
            updated_at: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- Interaction edges ---

/// Insert interaction edges, ignoring duplicates on (actor, target, kind).
pub fn insert_interactions(conn: &Connection, edges: &[InteractionEdge]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO graph_interaction (actor, target, kind, weight, indexed_at, interaction_uri)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(actor, target, kind) DO NOTHING",
    )?;
    for edge in edges {
        stmt.execute(params![
            edge.actor,
            edge.target,
            edge.kind.as_str(),
            edge.weight,
            edge.indexed_at,
            edge.interaction_uri,
        ])?;
    }
    Ok(())
}

/// Actors holding a like edge on the given post.
pub fn get_local_likers(conn: &Connection, target: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT actor FROM graph_interaction WHERE target = ?1 AND kind = 'like'")?;
    let rows = stmt.query_map(params![target], |row| row.get(0))?;
    let mut actors = Vec::new();
    for row in rows {
        actors.push(row?);
    }
    Ok(actors)
}

/// Authors whose posts the user has recently liked/reposted/replied to.
pub fn get_interacted_authors(conn: &Connection, user: &str, since: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT p.author FROM graph_interaction gi
         JOIN post p ON p.uri = gi.target
         WHERE gi.actor = ?1 AND gi.indexed_at > ?2",
    )?;
    let rows = stmt.query_map(params![user, since], |row| row.get(0))?;
    let mut authors = Vec::new();
    for row in rows {
        authors.push(row?);
    }
    Ok(authors)
}

/// Every interaction the user holds, keyed by target URI.
pub fn get_user_interactions(
    conn: &Connection,
    user: &str,
) -> Result<HashMap<String, HashSet<InteractionKind>>> {
    let mut stmt =
        conn.prepare("SELECT target, kind FROM graph_interaction WHERE actor = ?1")?;
    let rows = stmt.query_map(params![user], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map: HashMap<String, HashSet<InteractionKind>> = HashMap::new();
    for row in rows {
        let (target, kind) = row?;
        if let Some(kind) = InteractionKind::from_str(&kind) {
            map.entry(target).or_default().insert(kind);
        }
    }
    Ok(map)
}

/// A single network-effort row: a graph actor interacted with a candidate.
#[derive(Debug, Clone)]
pub struct NetworkInteractionRow {
    pub target: String,
    pub kind: InteractionKind,
    pub actor: String,
    pub interaction_uri: Option<String>,
}

/// Interactions on the candidate URIs by actors in the given set
/// (L1 ∪ influential L2 at the call site).
pub fn get_network_interactions(
    conn: &Connection,
    uris: &[String],
    actors: &HashSet<String>,
) -> Result<Vec<NetworkInteractionRow>> {
    stage_set(conn, "q_net_uris", uris.iter().map(|s| s.as_str()))?;
    stage_set(conn, "q_net_actors", actors.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(
        "SELECT target, kind, actor, interaction_uri FROM graph_interaction
         WHERE target IN (SELECT v FROM temp.q_net_uris)
           AND actor IN (SELECT v FROM temp.q_net_actors)",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (target, kind, actor, interaction_uri) = row?;
        if let Some(kind) = InteractionKind::from_str(&kind) {
            out.push(NetworkInteractionRow {
                target,
                kind,
                actor,
                interaction_uri,
            });
        }
    }
    Ok(out)
}

/// The user's recent like/repost targets with the interaction kind,
/// for liked-post embedding.
pub fn get_recent_like_targets(
    conn: &Connection,
    user: &str,
    since: &str,
) -> Result<Vec<(String, InteractionKind)>> {
    let mut stmt = conn.prepare(
        "SELECT target, kind FROM graph_interaction
         WHERE actor = ?1 AND kind IN ('like', 'repost') AND indexed_at > ?2",
    )?;
    let rows = stmt.query_map(params![user, since], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (target, kind) = row?;
        if let Some(kind) = InteractionKind::from_str(&kind) {
            out.push((target, kind));
        }
    }
    Ok(out)
}

/// Share of the user's recently-liked posts that carry images / videos.
pub fn get_media_like_ratio(conn: &Connection, user: &str, since: &str) -> Result<(f64, f64)> {
    let (total, images, videos): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(p.has_image), 0), COALESCE(SUM(p.has_video), 0)
         FROM graph_interaction gi
         JOIN post p ON p.uri = gi.target
         WHERE gi.actor = ?1 AND gi.kind = 'like' AND gi.indexed_at > ?2",
        params![user, since],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    if total == 0 {
        // No signal — treat as media-neutral so the mismatch penalty stays off
        return Ok((1.0, 1.0));
    }
    Ok((images as f64 / total as f64, videos as f64 / total as f64))
}

// --- Taste similarity & reputation ---

/// Record one co-like agreement between a user and another actor.
pub fn bump_taste_similarity(conn: &Connection, user: &str, other: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO taste_similarity
            (user_did, similar_did, agreement_count, total_co_liked, last_agreement_at, updated_at)
         VALUES (?1, ?2, 1, 1, ?3, ?3)
         ON CONFLICT(user_did, similar_did) DO UPDATE SET
            agreement_count = agreement_count + 1,
            total_co_liked = total_co_liked + 1,
            last_agreement_at = ?3,
            updated_at = ?3",
        params![user, other, now],
    )?;
    Ok(())
}

/// Load one taste-reputation row.
pub fn get_taste_reputation(
    conn: &Connection,
    user: &str,
    other: &str,
) -> Result<Option<TasteReputation>> {
    let mut stmt = conn.prepare(
        "SELECT user_did, similar_did, reputation_score, agreement_history, last_seen_at,
                decay_rate, updated_at
         FROM taste_reputation WHERE user_did = ?1 AND similar_did = ?2",
    )?;
    let result = stmt
        .query_row(params![user, other], |row| {
            Ok(TasteReputation {
                user_did: row.get(0)?,
                similar_did: row.get(1)?,
                reputation_score: row.get(2)?,
                agreement_history: row.get(3)?,
                last_seen_at: row.get(4)?,
                decay_rate: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })
        .optional()?;
    Ok(result)
}

/// Write one taste-reputation row (upsert on the pair).
pub fn upsert_taste_reputation(conn: &Connection, rep: &TasteReputation) -> Result<()> {
    conn.execute(
        "INSERT INTO taste_reputation
            (user_did, similar_did, reputation_score, agreement_history, last_seen_at,
             decay_rate, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_did, similar_did) DO UPDATE SET
            reputation_score = ?3,
            agreement_history = ?4,
            last_seen_at = ?5,
            decay_rate = ?6,
            updated_at = ?7",
        params![
            rep.user_did,
            rep.similar_did,
            rep.reputation_score,
            rep.agreement_history,
            rep.last_seen_at,
            rep.decay_rate,
            rep.updated_at,
        ],
    )?;
    Ok(())
}

/// The user's strongest taste-twins at or above `min_score`.
pub fn get_taste_twins(
    conn: &Connection,
    user: &str,
    min_score: f64,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT similar_did, reputation_score FROM taste_reputation
         WHERE user_did = ?1 AND reputation_score >= ?2
         ORDER BY reputation_score DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![user, min_score, limit as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    let mut twins = Vec::new();
    for row in rows {
        twins.push(row?);
    }
    Ok(twins)
}

// --- Author fatigue ---

/// Load one author-fatigue row.
pub fn get_author_fatigue(
    conn: &Connection,
    user: &str,
    author: &str,
) -> Result<Option<AuthorFatigue>> {
    let mut stmt = conn.prepare(
        "SELECT user_did, author_did, serve_count, last_served_at, fatigue_score,
                affinity_score, interaction_weight, last_interaction_at, interaction_count,
                updated_at
         FROM user_author_fatigue WHERE user_did = ?1 AND author_did = ?2",
    )?;
    let result = stmt
        .query_row(params![user, author], fatigue_from_row)
        .optional()?;
    Ok(result)
}

fn fatigue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthorFatigue> {
    Ok(AuthorFatigue {
        user_did: row.get(0)?,
        author_did: row.get(1)?,
        serve_count: row.get(2)?,
        last_served_at: row.get(3)?,
        fatigue_score: row.get(4)?,
        affinity_score: row.get(5)?,
        interaction_weight: row.get(6)?,
        last_interaction_at: row.get(7)?,
        interaction_count: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Write one author-fatigue row (upsert on the pair).
pub fn upsert_author_fatigue(conn: &Connection, fatigue: &AuthorFatigue) -> Result<()> {
    conn.execute(
        "INSERT INTO user_author_fatigue
            (user_did, author_did, serve_count, last_served_at, fatigue_score, affinity_score,
             interaction_weight, last_interaction_at, interaction_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(user_did, author_did) DO UPDATE SET
            serve_count = ?3,
            last_served_at = ?4,
            fatigue_score = ?5,
            affinity_score = ?6,
            interaction_weight = ?7,
            last_interaction_at = ?8,
            interaction_count = ?9,
            updated_at = ?10",
        params![
            fatigue.user_did,
            fatigue.author_did,
            fatigue.serve_count,
            fatigue.last_served_at,
            fatigue.fatigue_score,
            fatigue.affinity_score,
            fatigue.interaction_weight,
            fatigue.last_interaction_at,
            fatigue.interaction_count,
            fatigue.updated_at,
        ],
    )?;
    Ok(())
}

/// Fatigue rows for a set of authors, keyed by author DID.
pub fn get_fatigue_for_authors(
    conn: &Connection,
    user: &str,
    authors: &HashSet<String>,
) -> Result<HashMap<String, AuthorFatigue>> {
    stage_set(conn, "q_fatigue_authors", authors.iter().map(|s| s.as_str()))?;
    let mut stmt = conn.prepare(
        "SELECT user_did, author_did, serve_count, last_served_at, fatigue_score,
                affinity_score, interaction_weight, last_interaction_at, interaction_count,
                updated_at
         FROM user_author_fatigue
         WHERE user_did = ?1 AND author_did IN (SELECT v FROM temp.q_fatigue_authors)",
    )?;
    let rows = stmt.query_map(params![user], fatigue_from_row)?;
    let mut map = HashMap::new();
    for row in rows {
        let fatigue = row?;
        map.insert(fatigue.author_did.clone(), fatigue);
    }
    Ok(map)
}

// --- Keywords ---

/// All keyword scores for one user.
pub fn get_user_keywords(conn: &Connection, user: &str) -> Result<Vec<UserKeyword>> {
    let mut stmt = conn.prepare(
        "SELECT user_did, keyword, score, updated_at FROM user_keyword WHERE user_did = ?1",
    )?;
    let rows = stmt.query_map(params![user], |row| {
        Ok(UserKeyword {
            user_did: row.get(0)?,
            keyword: row.get(1)?,
            score: row.get(2)?,
            updated_at: row.get(3)?,
        })
    })?;
    let mut keywords = Vec::new();
    for row in rows {
        keywords.push(row?);
    }
    Ok(keywords)
}

/// Upsert one keyword score.
pub fn upsert_user_keyword(
    conn: &Connection,
    user: &str,
    keyword: &str,
    score: f64,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO user_keyword (user_did, keyword, score, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_did, keyword) DO UPDATE SET score = ?3, updated_at = ?4",
        params![user, keyword, score, now],
    )?;
    Ok(())
}

/// Drop keywords whose magnitude has decayed below the floor.
pub fn prune_user_keywords(conn: &Connection, user: &str, floor: f64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM user_keyword WHERE user_did = ?1 AND ABS(score) < ?2",
        params![user, floor],
    )?;
    Ok(removed)
}

// --- Corpora ---

/// Texts of the user's recent like-subjects, newest first.
pub fn get_liked_texts(
    conn: &Connection,
    user: &str,
    since: &str,
    limit: usize,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT p.text FROM graph_interaction gi
         JOIN post p ON p.uri = gi.target
         WHERE gi.actor = ?1 AND gi.kind = 'like' AND gi.indexed_at > ?2
           AND p.text IS NOT NULL AND LENGTH(p.text) > 0
         ORDER BY gi.indexed_at DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![user, since, limit as i64], |row| row.get(0))?;
    let mut texts = Vec::new();
    for row in rows {
        texts.push(row?);
    }
    Ok(texts)
}

/// A random background corpus of post texts.
pub fn get_random_texts(conn: &Connection, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT text FROM post
         WHERE text IS NOT NULL AND LENGTH(text) > 0
         ORDER BY RANDOM()
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
    let mut texts = Vec::new();
    for row in rows {
        texts.push(row?);
    }
    Ok(texts)
}

// --- Served / seen logs ---

/// Record served URIs, one row per URI.
pub fn record_served(conn: &Connection, user: &str, uris: &[String], now: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO user_served_post (user_did, uri, served_at) VALUES (?1, ?2, ?3)",
    )?;
    for uri in uris {
        stmt.execute(params![user, uri, now])?;
    }
    Ok(())
}

/// URIs served to a user since the given time. Ops/debug surface; the
/// serve path itself only writes this log.
pub fn get_served_uris(conn: &Connection, user: &str, since: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT uri FROM user_served_post
         WHERE user_did = ?1 AND served_at > ?2",
    )?;
    let rows = stmt.query_map(params![user, since], |row| row.get(0))?;
    let mut uris = Vec::new();
    for row in rows {
        uris.push(row?);
    }
    Ok(uris)
}

/// Record one seen URI.
pub fn record_seen(conn: &Connection, user: &str, uri: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_seen_post (user_did, uri, seen_at) VALUES (?1, ?2, ?3)",
        params![user, uri, now],
    )?;
    Ok(())
}

/// Seen counts per URI for one user since the given time.
pub fn get_seen_counts(
    conn: &Connection,
    user: &str,
    since: &str,
) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT uri, COUNT(*) FROM user_seen_post
         WHERE user_did = ?1 AND seen_at > ?2
         GROUP BY uri",
    )?;
    let rows = stmt.query_map(params![user, since], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    let mut counts = HashMap::new();
    for row in rows {
        let (uri, count): (String, i64) = row?;
        counts.insert(uri, count);
    }
    Ok(counts)
}

// --- Explicit feedback ---

/// Record an explicit more/less feedback event.
pub fn record_feedback(
    conn: &Connection,
    user: &str,
    uri: &str,
    action: &str,
    strength: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO user_feedback (user_did, uri, action, strength, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user, uri, action, strength, now],
    )?;
    Ok(())
}

/// Recent feedback URIs with their action, for profile building.
pub fn get_recent_feedback(
    conn: &Connection,
    user: &str,
    since: &str,
) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT uri, action FROM user_feedback
         WHERE user_did = ?1 AND created_at > ?2
         ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![user, since], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- Candidate batches ---

/// Insert candidate-batch rows.
pub fn insert_candidate_batch(conn: &Connection, rows: &[CandidateBatchRow]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO user_candidate_batch
            (user_did, uri, semantic_score, pipeline_score, centroid_id, batch_id, generated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_did, uri, batch_id) DO UPDATE SET
            semantic_score = ?3,
            pipeline_score = ?4,
            centroid_id = ?5,
            generated_at = ?7",
    )?;
    for row in rows {
        stmt.execute(params![
            row.user_did,
            row.uri,
            row.semantic_score,
            row.pipeline_score,
            row.centroid_id,
            row.batch_id,
            row.generated_at,
        ])?;
    }
    Ok(())
}

/// Load candidate-batch rows for one user newer than `since`.
pub fn load_candidate_batch(
    conn: &Connection,
    user: &str,
    since: &str,
) -> Result<Vec<CandidateBatchRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_did, uri, semantic_score, pipeline_score, centroid_id, batch_id, generated_at
         FROM user_candidate_batch
         WHERE user_did = ?1 AND generated_at > ?2
         ORDER BY semantic_score DESC",
    )?;
    let rows = stmt.query_map(params![user, since], |row| {
        Ok(CandidateBatchRow {
            user_did: row.get(0)?,
            uri: row.get(1)?,
            semantic_score: row.get(2)?,
            pipeline_score: row.get(3)?,
            centroid_id: row.get(4)?,
            batch_id: row.get(5)?,
            generated_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- Garbage collection ---

/// Delete served-log rows older than `before`.
pub fn gc_served(conn: &Connection, before: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM user_served_post WHERE served_at < ?1",
        params![before],
    )?)
}

/// Delete seen-log rows older than `before`.
pub fn gc_seen(conn: &Connection, before: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM user_seen_post WHERE seen_at < ?1",
        params![before],
    )?)
}

/// Delete candidate-batch rows older than `before`.
pub fn gc_candidate_batches(conn: &Connection, before: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM user_candidate_batch WHERE generated_at < ?1",
        params![before],
    )?)
}

/// Retention GC: drop posts older than `before` with zero engagement whose
/// author is not followed by anyone we track.
pub fn gc_posts(conn: &Connection, before: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM post
         WHERE indexed_at < ?1
           AND like_count = 0 AND reply_count = 0 AND repost_count = 0
           AND author NOT IN (SELECT DISTINCT followee FROM graph_follow)",
        params![before],
    )?)
}

/// Row counts for the status display.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub posts: i64,
    pub follows: i64,
    pub interactions: i64,
    pub batch_rows: i64,
    pub keywords: i64,
    pub cursor: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<StoreStats> {
    let single = |sql: &str| -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0))
            .context("stats query failed")
    };
    Ok(StoreStats {
        posts: single("SELECT COUNT(*) FROM post")?,
        follows: single("SELECT COUNT(*) FROM graph_follow")?,
        interactions: single("SELECT COUNT(*) FROM graph_interaction")?,
        batch_rows: single("SELECT COUNT(*) FROM user_candidate_batch")?,
        keywords: single("SELECT COUNT(*) FROM user_keyword")?,
        cursor: get_meta(conn, "firehose_cursor")?,
    })
}
