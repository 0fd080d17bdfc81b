// Candidate harvesting — the four recall buckets.
//
// Each bucket pulls a time-and-predicate slice of the post table, attaches
// a light pre-score, and contributes its top K to the union. The pre-score
// coefficients are jittered per bucket each run so the recall edge doesn't
// fossilize; the heavyweight scoring later is what actually ranks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::db::models::Post;
use crate::db::Database;
use crate::graph::UserGraph;

/// A candidate's taste-twin provenance: which twins liked it and their
/// mean reputation.
#[derive(Debug, Clone, Default)]
pub struct TasteHit {
    pub twin_count: usize,
    pub mean_reputation: f64,
}

/// The union of all recall buckets plus the taste map built along the way.
#[derive(Debug, Default)]
pub struct RecallPool {
    pub posts: Vec<Post>,
    pub taste_hits: HashMap<String, TasteHit>,
}

/// Per-bucket caps, with the wider batch-mode variants.
struct BucketCaps {
    fresh: usize,
    bridge: usize,
    gems: usize,
    bubble: usize,
}

impl BucketCaps {
    fn for_mode(batch_mode: bool) -> Self {
        if batch_mode {
            Self {
                fresh: 3000,
                bridge: 600,
                gems: 3000,
                bubble: 800,
            }
        } else {
            Self {
                fresh: 1200,
                bridge: 600,
                gems: 1600,
                bubble: 800,
            }
        }
    }
}

/// Recent-twin-likes window feeding the taste-similar half of bucket B2.
const TWIN_LIKE_WINDOW_HOURS: i64 = 72;

/// Cap on twin-liked URIs pulled into B2.
const TWIN_LIKE_CAP: usize = 2000;

fn hours_ago(now: DateTime<Utc>, hours: i64) -> String {
    (now - Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Jittered pre-score: a·likes + b/(ageHours+1) + c·likes/ageHours.
fn pre_score(post: &Post, now: DateTime<Utc>, a: f64, b: f64, c: f64) -> f64 {
    let age_hours = DateTime::parse_from_rfc3339(&post.indexed_at)
        .map(|t| ((now - t.with_timezone(&Utc)).num_seconds() as f64 / 3600.0).max(0.01))
        .unwrap_or(1.0);
    a * post.like_count as f64 + b / (age_hours + 1.0) + c * post.like_count as f64 / age_hours
}

/// Rank a bucket by its jittered pre-score and keep the top `cap`.
fn take_top(posts: Vec<Post>, cap: usize, now: DateTime<Utc>, rng: &mut StdRng) -> Vec<Post> {
    // Jitter each coefficient ±50% around its base
    let a = 1.0 * rng.gen_range(0.5..1.5);
    let b = 24.0 * rng.gen_range(0.5..1.5);
    let c = 2.0 * rng.gen_range(0.5..1.5);

    let mut keyed: Vec<(f64, Post)> = posts
        .into_iter()
        .map(|post| (pre_score(&post, now, a, b, c), post))
        .collect();
    keyed.sort_by(|x, y| y.0.partial_cmp(&x.0).unwrap_or(std::cmp::Ordering::Equal));
    keyed.into_iter().take(cap).map(|(_, post)| post).collect()
}

/// Harvest all four buckets and union them by URI.
pub async fn harvest(
    db: &Arc<dyn Database>,
    user: &str,
    graph: &UserGraph,
    twins: &[(String, f64)],
    batch_mode: bool,
) -> Result<RecallPool> {
    let now = Utc::now();
    let caps = BucketCaps::for_mode(batch_mode);
    let mut rng = StdRng::seed_from_u64(now.timestamp_millis() as u64);

    // B1 fresh (≤ 72 h): social-graph authors or a like floor
    let mut fresh_authors: HashSet<String> = graph.wanted_dids();
    fresh_authors.extend(graph.interacted.iter().cloned());
    let b1_floor = if batch_mode { 0 } else { 2 };
    let b1 = db
        .recall_by_authors_or_likes(
            &fresh_authors,
            b1_floor,
            &hours_ago(now, 72),
            None,
            caps.fresh * 2,
        )
        .await?;
    let b1 = take_top(b1, caps.fresh, now, &mut rng);

    // B1.5 bridge (72 h – 7 d)
    let b15 = db
        .recall_by_authors_or_likes(
            &fresh_authors,
            1,
            &hours_ago(now, 24 * 7),
            Some(&hours_ago(now, 72)),
            caps.bridge * 2,
        )
        .await?;
    let b15 = take_top(b15, caps.bridge, now, &mut rng);

    // B2 global gems (≤ 30 d) plus the taste-similar union
    let gem_floor = if batch_mode { 0 } else { 1 };
    let b2 = db
        .recall_by_likes(gem_floor, &hours_ago(now, 24 * 30), caps.gems * 2)
        .await?;
    let mut b2 = take_top(b2, caps.gems, now, &mut rng);

    let twin_dids: HashSet<String> = twins.iter().map(|(did, _)| did.clone()).collect();
    let twin_reps: HashMap<&str, f64> = twins
        .iter()
        .map(|(did, rep)| (did.as_str(), *rep))
        .collect();
    let mut taste_hits: HashMap<String, TasteHit> = HashMap::new();
    if !twin_dids.is_empty() {
        let liked = db
            .twin_liked_uris(
                &twin_dids,
                &hours_ago(now, TWIN_LIKE_WINDOW_HOURS),
                TWIN_LIKE_CAP,
            )
            .await?;
        let mut sums: HashMap<String, (usize, f64)> = HashMap::new();
        for (uri, twin) in liked {
            let rep = twin_reps.get(twin.as_str()).copied().unwrap_or(1.0);
            let entry = sums.entry(uri).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += rep;
        }
        let uris: Vec<String> = sums.keys().cloned().collect();
        let twin_posts = db.get_posts(&uris).await?;
        b2.extend(twin_posts);
        for (uri, (count, total)) in sums {
            taste_hits.insert(
                uri,
                TasteHit {
                    twin_count: count,
                    mean_reputation: total / count as f64,
                },
            );
        }
    }

    // B3 bubble (≤ 30 d) from L1 ∪ interacted only
    let mut bubble_authors: HashSet<String> = graph.l1.clone();
    bubble_authors.extend(graph.interacted.iter().cloned());
    let b3 = db
        .recall_by_authors_or_likes(
            &bubble_authors,
            i64::MAX, // author predicate only
            &hours_ago(now, 24 * 30),
            None,
            caps.bubble * 2,
        )
        .await?;
    let b3 = take_top(b3, caps.bubble, now, &mut rng);

    // Union, de-duplicated by URI; the user's own posts never rank
    let mut seen = HashSet::new();
    let mut posts = Vec::new();
    for post in b1.into_iter().chain(b15).chain(b2).chain(b3) {
        if post.author == user {
            continue;
        }
        if seen.insert(post.uri.clone()) {
            posts.push(post);
        }
    }

    debug!(candidates = posts.len(), taste = taste_hits.len(), "Recall complete");
    Ok(RecallPool { posts, taste_hits })
}
