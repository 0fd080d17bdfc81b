// Reply-cluster analysis.
//
// Candidates are grouped by thread root. A root with replies from at least
// two distinct social-graph users is a multi-person conversation and earns
// an originator boost; an author stacking consecutive replies under their
// own post is a self-reply chain and gets penalized downstream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::models::Post;
use crate::db::Database;
use crate::graph::UserGraph;

/// Graph repliers at or above which a conversation counts as "large" —
/// only its single best reply survives filtering.
pub const LARGE_CONVERSATION_REPLIERS: usize = 3;

/// What we know about one thread after analysis.
#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    /// Distinct social-graph users who replied in the thread.
    pub graph_repliers: HashSet<String>,
    /// Reply counts per author within the thread.
    pub author_reply_counts: HashMap<String, usize>,
    /// Originator boost earned by the root post.
    pub op_boost: f64,
    /// Longest run of consecutive replies by the root author.
    pub chain_depth: usize,
    /// Total replies by the root author in the thread.
    pub chain_reply_count: usize,
    /// Root author, when the root post is known.
    pub root_author: Option<String>,
}

impl ThreadInfo {
    pub fn is_multi_person(&self) -> bool {
        self.graph_repliers.len() >= 2
    }

    pub fn is_large(&self) -> bool {
        self.graph_repliers.len() >= LARGE_CONVERSATION_REPLIERS
    }
}

#[derive(Debug, Default)]
pub struct ReplyClusters {
    pub threads: HashMap<String, ThreadInfo>,
}

impl ReplyClusters {
    pub fn thread(&self, root: &str) -> Option<&ThreadInfo> {
        self.threads.get(root)
    }
}

/// Analyze the threads touching the candidate set.
///
/// Loads every post in each referenced thread (root plus replies), counts
/// graph participation, computes the originator boost, and walks the reply
/// timeline for self-reply chains.
pub async fn analyze(
    db: &Arc<dyn Database>,
    candidates: &[Post],
    graph: &UserGraph,
) -> Result<ReplyClusters> {
    let mut roots: HashSet<String> = HashSet::new();
    for post in candidates {
        if let Some(root) = &post.reply_root {
            roots.insert(root.clone());
        } else if post.reply_count > 0 {
            // An original with replies is itself a root worth analyzing
            roots.insert(post.uri.clone());
        }
    }
    if roots.is_empty() {
        return Ok(ReplyClusters::default());
    }

    let root_list: Vec<String> = roots.iter().cloned().collect();
    let thread_posts = db.get_thread_posts(&root_list).await?;

    let mut by_root: HashMap<String, Vec<&Post>> = HashMap::new();
    let mut root_authors: HashMap<String, String> = HashMap::new();
    for post in &thread_posts {
        match &post.reply_root {
            Some(root) => by_root.entry(root.clone()).or_default().push(post),
            None => {
                // This is a root post itself
                root_authors.insert(post.uri.clone(), post.author.clone());
                by_root.entry(post.uri.clone()).or_default();
            }
        }
    }

    let mut clusters = ReplyClusters::default();
    for (root, mut replies) in by_root {
        replies.sort_by(|a, b| a.indexed_at.cmp(&b.indexed_at));

        let mut info = ThreadInfo {
            root_author: root_authors.get(&root).cloned(),
            ..Default::default()
        };

        let mut l1_replies = 0usize;
        let mut interacted_replies = 0usize;
        let mut l2_replies = 0usize;
        let mut mutual_replies = 0usize;

        for reply in &replies {
            *info
                .author_reply_counts
                .entry(reply.author.clone())
                .or_insert(0) += 1;

            if graph.mutuals.contains(&reply.author) {
                mutual_replies += 1;
                info.graph_repliers.insert(reply.author.clone());
            } else if graph.l1.contains(&reply.author) {
                l1_replies += 1;
                info.graph_repliers.insert(reply.author.clone());
            } else if graph.interacted.contains(&reply.author) {
                interacted_replies += 1;
                info.graph_repliers.insert(reply.author.clone());
            } else if graph.l2.contains(&reply.author) {
                l2_replies += 1;
                info.graph_repliers.insert(reply.author.clone());
            }
        }

        let graph_reply_total = l1_replies + interacted_replies + l2_replies + mutual_replies;
        let volume_bonus = if graph_reply_total >= 5 {
            500.0
        } else if graph_reply_total >= 3 {
            300.0
        } else {
            0.0
        };
        // Interacted sits between L1 and L2, as in the reply tier weights
        info.op_boost = 150.0 * l1_replies as f64
            + 100.0 * interacted_replies as f64
            + 75.0 * l2_replies as f64
            + 200.0 * mutual_replies as f64
            + volume_bonus;

        // Self-reply chain: the root author's consecutive replies
        if let Some(root_author) = &info.root_author {
            let mut run = 0usize;
            for reply in &replies {
                if &reply.author == root_author {
                    run += 1;
                    info.chain_depth = info.chain_depth.max(run);
                    info.chain_reply_count += 1;
                } else {
                    run = 0;
                }
            }
        }

        clusters.threads.insert(root, info);
    }

    Ok(clusters)
}

/// Hours between a post and now, never negative.
pub fn age_hours(indexed_at: &str, now: DateTime<Utc>) -> f64 {
    DateTime::parse_from_rfc3339(indexed_at)
        .map(|t| ((now - t.with_timezone(&Utc)).num_seconds() as f64 / 3600.0).max(0.0))
        .unwrap_or(f64::MAX)
}
