// Data models — Rust structs that map to database rows.
//
// These are the types that flow through the application. They're separate
// from the database queries so other modules can use them without depending
// on rusqlite directly.

use serde::{Deserialize, Serialize};

/// An indexed post from the firehose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub indexed_at: String,
    pub like_count: i64,
    pub reply_count: i64,
    pub repost_count: i64,
    pub reply_root: Option<String>,
    pub reply_parent: Option<String>,
    pub text: Option<String>,
    pub has_image: bool,
    pub has_video: bool,
    pub has_external: bool,
}

impl Post {
    /// True for posts that start a thread (no reply parent).
    pub fn is_original(&self) -> bool {
        self.reply_parent.is_none()
    }

    /// Total engagement across all counter columns.
    pub fn engagement(&self) -> i64 {
        self.like_count + self.reply_count + self.repost_count
    }
}

/// A post row waiting in the ingest batch.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub indexed_at: String,
    pub reply_root: Option<String>,
    pub reply_parent: Option<String>,
    pub text: Option<String>,
    pub has_image: bool,
    pub has_video: bool,
    pub has_external: bool,
}

/// The kind of interaction edge between an actor and a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Like,
    Repost,
    Reply,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Repost => "repost",
            InteractionKind::Reply => "reply",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "like" => Some(InteractionKind::Like),
            "repost" => Some(InteractionKind::Repost),
            "reply" => Some(InteractionKind::Reply),
            _ => None,
        }
    }

    /// Edge weight recorded in the store (reposts count double).
    pub fn weight(&self) -> i64 {
        match self {
            InteractionKind::Like => 1,
            InteractionKind::Repost => 2,
            InteractionKind::Reply => 1,
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An interaction edge: a tracked actor liked/reposted/replied-to a post.
#[derive(Debug, Clone)]
pub struct InteractionEdge {
    pub actor: String,
    pub target: String,
    pub kind: InteractionKind,
    pub weight: i64,
    pub indexed_at: String,
    pub interaction_uri: Option<String>,
}

/// One flush of accumulated firehose mutations, applied in a single
/// transaction: post inserts, post deletes, counter deltas (URI-sorted),
/// then interaction edges.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub posts: Vec<NewPost>,
    pub deletes: Vec<String>,
    /// (uri, like delta, repost delta, reply delta), sorted by URI before apply.
    pub counters: Vec<(String, i64, i64, i64)>,
    pub interactions: Vec<InteractionEdge>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
            && self.deletes.is_empty()
            && self.counters.is_empty()
            && self.interactions.is_empty()
    }
}

/// Decaying reputation of a taste-twin relative to a user.
#[derive(Debug, Clone)]
pub struct TasteReputation {
    pub user_did: String,
    pub similar_did: String,
    pub reputation_score: f64,
    pub agreement_history: f64,
    pub last_seen_at: Option<String>,
    pub decay_rate: f64,
    pub updated_at: String,
}

/// Per-author serving fatigue and affinity for one user.
#[derive(Debug, Clone)]
pub struct AuthorFatigue {
    pub user_did: String,
    pub author_did: String,
    pub serve_count: i64,
    pub last_served_at: Option<String>,
    pub fatigue_score: f64,
    pub affinity_score: f64,
    pub interaction_weight: f64,
    pub last_interaction_at: Option<String>,
    pub interaction_count: i64,
    pub updated_at: String,
}

impl AuthorFatigue {
    /// A fresh row with neutral scores.
    pub fn new(user_did: &str, author_did: &str, now: &str) -> Self {
        Self {
            user_did: user_did.to_string(),
            author_did: author_did.to_string(),
            serve_count: 0,
            last_served_at: None,
            fatigue_score: 0.0,
            affinity_score: 1.0,
            interaction_weight: 0.0,
            last_interaction_at: None,
            interaction_count: 0,
            updated_at: now.to_string(),
        }
    }
}

/// A keyword interest score for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyword {
    pub user_did: String,
    pub keyword: String,
    pub score: f64,
    pub updated_at: String,
}

/// One row of a materialized semantic candidate batch.
#[derive(Debug, Clone)]
pub struct CandidateBatchRow {
    pub user_did: String,
    pub uri: String,
    pub semantic_score: f64,
    pub pipeline_score: f64,
    pub centroid_id: i64,
    pub batch_id: String,
    pub generated_at: String,
}

/// An influential layer-2 account cached for one user.
#[derive(Debug, Clone)]
pub struct InfluentialL2 {
    pub user_did: String,
    pub l2_did: String,
    pub influence_score: f64,
    pub l1_follower_count: i64,
    pub updated_at: String,
}
