// Candidate scoring — the additive signal stack.
//
// Every candidate accumulates named signals into one score. The names are
// kept on the result so tests and the debug surface can see exactly which
// signal moved a post. Ordering matters in two places: op_boost reads the
// running sum, and the seen multiplier scales everything before jitter.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::db::models::{AuthorFatigue, InteractionKind, Post, UserKeyword};
use crate::graph::UserGraph;
use crate::ranking::network::NetworkEffort;
use crate::ranking::recall::TasteHit;
use crate::ranking::replies::{age_hours, ReplyClusters};

/// One scored candidate with its full signal breakdown.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub post: Post,
    pub score: f64,
    pub signals: BTreeMap<&'static str, f64>,
    pub repost_uri: Option<String>,
}

impl ScoredCandidate {
    pub fn indexed_at_ms(&self) -> i64 {
        DateTime::parse_from_rfc3339(&self.post.indexed_at)
            .map(|t| t.timestamp_millis())
            .unwrap_or(0)
    }
}

/// Everything scoring needs, assembled once per rank call.
pub struct ScoreContext<'a> {
    pub user: &'a str,
    pub now: DateTime<Utc>,
    pub graph: &'a UserGraph,
    pub efforts: &'a HashMap<String, NetworkEffort>,
    pub fatigue: &'a HashMap<String, AuthorFatigue>,
    pub keywords: &'a [UserKeyword],
    pub taste_hits: &'a HashMap<String, TasteHit>,
    pub seen_counts: &'a HashMap<String, i64>,
    pub interactions: &'a HashMap<String, HashSet<InteractionKind>>,
    pub clusters: &'a ReplyClusters,
    /// Parent posts of candidate replies, keyed by URI. Weak keys — misses
    /// are normal.
    pub parents: &'a HashMap<String, Post>,
    /// (image ratio, video ratio) of the user's recent likes.
    pub media_ratio: (f64, f64),
    pub batch_mode: bool,
}

/// Half-life scale for the tier signals, in hours (two weeks).
const TIER_HALF_LIFE_HOURS: f64 = 336.0;

/// The multiplicative seen fatigue outside batch mode.
pub fn seen_multiplier(seen_count: i64) -> f64 {
    0.5f64.powi(seen_count.max(0) as i32)
}

/// Deterministic jitter in [0, range) from the (uri, user) pair.
pub fn jitter_for(uri: &str, user: &str, range: u64) -> f64 {
    if range == 0 {
        return 0.0;
    }
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    hasher.update(user.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % range) as f64
}

/// Whole-word match: `keyword` appears in `text` with non-alphanumeric (or
/// edge) boundaries on both sides. Both inputs must already be lowercase.
pub fn has_whole_word(text: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = text[start..].find(keyword) {
        let begin = start + pos;
        let end = begin + keyword.len();
        let left_ok = begin == 0
            || !text[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let right_ok = end >= text.len()
            || !text[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if left_ok && right_ok {
            return true;
        }
        start = begin + keyword.len().max(1);
        if start >= text.len() {
            break;
        }
    }
    false
}

/// Record a non-zero signal and fold it into the running score.
fn add(signals: &mut BTreeMap<&'static str, f64>, score: &mut f64, name: &'static str, value: f64) {
    if value != 0.0 {
        signals.insert(name, value);
        *score += value;
    }
}

pub fn score_candidate(post: &Post, ctx: &ScoreContext<'_>) -> ScoredCandidate {
    let mut signals: BTreeMap<&'static str, f64> = BTreeMap::new();
    let mut score = 0.0f64;

    let age = age_hours(&post.indexed_at, ctx.now);
    let author = post.author.as_str();
    let graph = ctx.graph;
    let in_graph = graph.in_graph(author);
    let effort = ctx.efforts.get(&post.uri);
    let affinity = ctx
        .fatigue
        .get(author)
        .map(|f| f.affinity_score)
        .unwrap_or(1.0);

    // Recency
    add(
        &mut signals,
        &mut score,
        "recency",
        10.0 * 0.5f64.powf(age / 24.0),
    );

    // Graph tier
    let tier_decay = 0.5f64.powf(age / TIER_HALF_LIFE_HOURS);
    let tier = if graph.l1.contains(author) {
        let mutual_factor = if graph.mutuals.contains(author) { 2.5 } else { 1.0 };
        3000.0 * tier_decay * mutual_factor * (0.8 + 0.2 * affinity)
    } else if graph.interacted.contains(author) {
        1500.0 * tier_decay * (0.8 + 0.2 * affinity)
    } else if graph.l2.contains(author) {
        500.0 * tier_decay * (0.9 + 0.1 * affinity)
    } else {
        50.0 * tier_decay
    };
    add(&mut signals, &mut score, "tier", tier);

    // Network effort
    if let Some(effort) = effort {
        let total = effort.total() as f64;
        if total > 0.0 {
            add(
                &mut signals,
                &mut score,
                "network_effort",
                (total.powf(1.5) * 200.0).round(),
            );
        }
    }

    // Raw engagement
    add(
        &mut signals,
        &mut score,
        "engagement",
        15.0 * post.like_count as f64 + 30.0 * post.repost_count as f64,
    );

    // Keyword interest
    let mut keyword_signal = 0.0;
    if let Some(text) = &post.text {
        let text_lower = text.to_lowercase();
        let outside_multiplier = if ctx.batch_mode { 800.0 } else { 1200.0 };
        for keyword in ctx.keywords {
            if has_whole_word(&text_lower, &keyword.keyword) {
                let multiplier = if in_graph { 100.0 } else { outside_multiplier };
                keyword_signal += keyword.score * multiplier;
            }
        }
    }
    add(&mut signals, &mut score, "keyword", keyword_signal);

    // Taste-twin consensus
    let mut taste_signal = 0.0;
    if let Some(hit) = ctx.taste_hits.get(&post.uri) {
        let consensus = (1.0 + 0.8 * (hit.twin_count.saturating_sub(1)) as f64).min(4.0);
        taste_signal = hit.mean_reputation * 2500.0 * consensus;
        add(&mut signals, &mut score, "taste", taste_signal);
    }

    // Discovery sandbox for strangers
    if !in_graph {
        let sandbox = if ctx.batch_mode {
            -2000.0
        } else if post.like_count > 50 {
            -1500.0
        } else {
            -4000.0
        };
        add(&mut signals, &mut score, "sandbox_penalty", sandbox);

        // Media-shape mismatch only matters outside the graph
        let (image_ratio, video_ratio) = ctx.media_ratio;
        let mismatch = (post.has_image && image_ratio < 0.2)
            || (post.has_video && video_ratio < 0.2);
        if mismatch {
            add(&mut signals, &mut score, "media_mismatch", -1500.0);
        }
    }

    if post.is_original() {
        // Originator boost: a capped slice of the running score, plus the
        // conversation boost when the thread is active. A sandboxed post's
        // negative running score makes this a further penalty, not a boost.
        let mut op_boost = (0.10 * score).min(300.0);
        if let Some(info) = ctx.clusters.thread(&post.uri) {
            op_boost += info.op_boost;
        }
        add(&mut signals, &mut score, "op_boost", op_boost);
    } else {
        score_reply_signals(post, ctx, &mut signals, &mut score);
    }

    // Ghost: brand-new with zero traction
    if age < 1.0 && post.engagement() == 0 {
        add(&mut signals, &mut score, "ghost_penalty", -500.0);
    }

    // Stale stranger nobody vouched for
    if age > 24.0 && !in_graph && effort.map_or(true, |e| e.total() == 0 && e.actors.is_empty()) {
        add(&mut signals, &mut score, "cold_unknown_penalty", -1000.0);
    }

    // Prior interactions (the hard filter also drops likes later)
    if let Some(kinds) = ctx.interactions.get(&post.uri) {
        if kinds.contains(&InteractionKind::Like) {
            add(&mut signals, &mut score, "already_liked", -8000.0);
        }
        if kinds.contains(&InteractionKind::Repost) {
            add(&mut signals, &mut score, "already_reposted", -6000.0);
        }
        if kinds.contains(&InteractionKind::Reply) {
            add(&mut signals, &mut score, "already_replied", -5000.0);
        }
    }

    // Author fatigue
    if let Some(fatigue) = ctx.fatigue.get(author) {
        let signal = author_fatigue_signal(fatigue, post, ctx.now);
        add(&mut signals, &mut score, "author_fatigue", signal);
    }

    // Self-reply chains drag down the whole thread for that author
    let chain_root = post.reply_root.as_deref().unwrap_or(&post.uri);
    if let Some(info) = ctx.clusters.thread(chain_root) {
        if info.root_author.as_deref() == Some(author) {
            let mut chain = if info.chain_depth >= 3 {
                -2000.0
            } else if info.chain_depth >= 2 {
                -1000.0
            } else {
                0.0
            };
            if chain != 0.0 {
                if info.chain_reply_count >= 5 {
                    chain -= 1000.0;
                } else if info.chain_reply_count >= 3 {
                    chain -= 500.0;
                }
                // Engaged chains are usually storytelling, not spam
                if post.engagement() >= 2 {
                    chain /= 2.0;
                }
                add(&mut signals, &mut score, "self_reply_chain", chain);
            }
        }
    }

    // Seen fatigue, multiplicative (serve path only)
    if !ctx.batch_mode {
        if let Some(&count) = ctx.seen_counts.get(&post.uri) {
            if count > 0 {
                let multiplier = seen_multiplier(count);
                signals.insert("seen_multiplier", multiplier);
                score *= multiplier;
            }
        }
    }

    // Deterministic jitter; discovery matches get the wider band
    let discovery_match = keyword_signal > 0.0 || taste_signal > 0.0;
    let jitter_range = if !in_graph && !discovery_match { 300 } else { 1200 };
    let jitter = jitter_for(&post.uri, ctx.user, jitter_range);
    signals.insert("jitter", jitter);
    score += jitter;

    ScoredCandidate {
        post: post.clone(),
        score,
        signals,
        repost_uri: effort.and_then(|e| e.repost_uri.clone()),
    }
}

fn score_reply_signals(
    post: &Post,
    ctx: &ScoreContext<'_>,
    signals: &mut BTreeMap<&'static str, f64>,
    score: &mut f64,
) {
    let graph = ctx.graph;
    let author = post.author.as_str();

    add(signals, score, "reply_base", -800.0);

    if graph.mutuals.contains(author) {
        add(signals, score, "reply_mutual", 600.0);
    }

    let reply_engagement = post.engagement();
    if reply_engagement >= 5 {
        add(signals, score, "reply_popularity", 300.0);
    } else if reply_engagement >= 2 {
        add(signals, score, "reply_popularity", 100.0);
    }

    let tier = if graph.l1.contains(author) {
        400.0
    } else if graph.interacted.contains(author) {
        200.0
    } else if graph.l2.contains(author) {
        100.0
    } else {
        0.0
    };
    add(signals, score, "reply_graph_tier", tier);

    if let Some(root) = &post.reply_root {
        if let Some(info) = ctx.clusters.thread(root) {
            if info.is_multi_person()
                && info.author_reply_counts.get(author).copied().unwrap_or(0) >= 2
            {
                let graph_replies: usize = info
                    .graph_repliers
                    .iter()
                    .map(|r| info.author_reply_counts.get(r).copied().unwrap_or(0))
                    .sum();
                let pile = (100.0 * graph_replies as f64).min(500.0);
                add(signals, score, "reply_repetition_penalty", -400.0 - pile);
            }
        }
    }

    if let Some(parent_uri) = &post.reply_parent {
        if let Some(parent) = ctx.parents.get(parent_uri) {
            let parent_age = age_hours(&parent.indexed_at, ctx.now);
            if parent_age > 24.0 {
                add(
                    signals,
                    score,
                    "reply_old_parent",
                    -(5.0 * parent_age).min(300.0),
                );
            }
        }
    }

    if let Some(effort) = ctx.efforts.get(&post.uri) {
        if !effort.actors.is_empty() {
            add(
                signals,
                score,
                "reply_network",
                50.0 * effort.actors.len() as f64,
            );
        }
    }
}

/// Fatigue signal: negative fatigue is a bonus, hot fatigue a scaled penalty.
fn author_fatigue_signal(fatigue: &AuthorFatigue, post: &Post, now: DateTime<Utc>) -> f64 {
    if fatigue.fatigue_score < 0.0 {
        return 50.0 * fatigue.fatigue_score.abs();
    }
    if fatigue.fatigue_score <= 40.0 {
        return 0.0;
    }

    let mut penalty = 80.0 * (fatigue.fatigue_score - 30.0);

    // Recently-served authors sting more
    if let Some(served) = &fatigue.last_served_at {
        let hours = age_hours(served, now);
        if hours < 6.0 {
            penalty *= 1.5;
        } else if hours < 24.0 {
            penalty *= 1.2;
        }
    }

    // Genuinely popular posts push through some of the fatigue
    if post.like_count > 100 {
        penalty *= 0.3;
    } else if post.like_count > 30 {
        penalty *= 0.5;
    } else if post.like_count > 10 {
        penalty *= 0.7;
    }

    -penalty
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SecondsFormat};

    fn base_post(uri: &str, author: &str, hours_old: i64) -> Post {
        Post {
            uri: uri.to_string(),
            cid: "cid".to_string(),
            author: author.to_string(),
            indexed_at: (Utc::now() - Duration::hours(hours_old))
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
        }
    }

    struct Fixture {
        graph: UserGraph,
        efforts: HashMap<String, NetworkEffort>,
        fatigue: HashMap<String, AuthorFatigue>,
        keywords: Vec<UserKeyword>,
        taste_hits: HashMap<String, TasteHit>,
        seen: HashMap<String, i64>,
        interactions: HashMap<String, HashSet<InteractionKind>>,
        clusters: ReplyClusters,
        parents: HashMap<String, Post>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: UserGraph {
                    user: "did:plc:me".to_string(),
                    l1: ["did:plc:friend".to_string()].into_iter().collect(),
                    ..Default::default()
                },
                efforts: HashMap::new(),
                fatigue: HashMap::new(),
                keywords: Vec::new(),
                taste_hits: HashMap::new(),
                seen: HashMap::new(),
                interactions: HashMap::new(),
                clusters: ReplyClusters::default(),
                parents: HashMap::new(),
            }
        }

        fn ctx(&self, batch_mode: bool) -> ScoreContext<'_> {
            ScoreContext {
                user: "did:plc:me",
                now: Utc::now(),
                graph: &self.graph,
                efforts: &self.efforts,
                fatigue: &self.fatigue,
                keywords: &self.keywords,
                taste_hits: &self.taste_hits,
                seen_counts: &self.seen,
                interactions: &self.interactions,
                clusters: &self.clusters,
                parents: &self.parents,
                media_ratio: (1.0, 1.0),
                batch_mode,
            }
        }
    }

    #[test]
    fn test_seen_multiplier_values() {
        assert!((seen_multiplier(0) - 1.0).abs() < 1e-9);
        assert!((seen_multiplier(2) - 0.25).abs() < 1e-9);
        // 1000 pre-multiplier at seen=2 lands at exactly 250
        assert!((1000.0 * seen_multiplier(2) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_deterministic_and_bounded() {
        let a = jitter_for("at://a/p/1", "did:plc:me", 1200);
        let b = jitter_for("at://a/p/1", "did:plc:me", 1200);
        assert_eq!(a, b);
        assert!(a >= 0.0 && a < 1200.0);
        let c = jitter_for("at://a/p/2", "did:plc:me", 1200);
        // Different URIs should almost surely land elsewhere
        assert_ne!(a, c);
    }

    #[test]
    fn test_whole_word_matching() {
        assert!(has_whole_word("i love rust programming", "rust"));
        assert!(has_whole_word("rust!", "rust"));
        assert!(!has_whole_word("rustacean pride", "rust"));
        assert!(!has_whole_word("trust me", "rust"));
        assert!(has_whole_word("machine learning is fun", "machine learning"));
    }

    #[test]
    fn test_l1_outranks_stranger() {
        let fx = Fixture::new();
        let ctx = fx.ctx(false);
        let friend = score_candidate(&base_post("at://a/p/1", "did:plc:friend", 2), &ctx);
        let stranger = score_candidate(&base_post("at://a/p/2", "did:plc:nobody", 2), &ctx);
        assert!(friend.score > stranger.score);
        assert!(friend.signals["tier"] > 2500.0);
        assert_eq!(stranger.signals["sandbox_penalty"], -4000.0);
    }

    #[test]
    fn test_popular_stranger_sandbox_is_softer() {
        let fx = Fixture::new();
        let ctx = fx.ctx(false);
        let mut post = base_post("at://a/p/1", "did:plc:nobody", 2);
        post.like_count = 80;
        let scored = score_candidate(&post, &ctx);
        assert_eq!(scored.signals["sandbox_penalty"], -1500.0);
    }

    #[test]
    fn test_op_boost_goes_negative_for_sandboxed_original() {
        let fx = Fixture::new();
        let ctx = fx.ctx(false);
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:nobody", 2), &ctx);

        // Running score before op_boost: recency + tier + sandbox, deep in
        // the red — ten percent of that lands as a further penalty
        let pre = scored.signals["recency"]
            + scored.signals["tier"]
            + scored.signals["sandbox_penalty"];
        assert!(pre < -3000.0);
        let op_boost = scored.signals["op_boost"];
        assert!(op_boost < 0.0, "expected a negative op_boost, got {op_boost}");
        assert!((op_boost - 0.10 * pre).abs() < 1e-6);
    }

    #[test]
    fn test_batch_mode_sandbox() {
        let fx = Fixture::new();
        let ctx = fx.ctx(true);
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:nobody", 2), &ctx);
        assert_eq!(scored.signals["sandbox_penalty"], -2000.0);
    }

    #[test]
    fn test_keyword_signal_outside_graph() {
        let mut fx = Fixture::new();
        fx.keywords.push(UserKeyword {
            user_did: "did:plc:me".to_string(),
            keyword: "rust".to_string(),
            score: 0.5,
            updated_at: String::new(),
        });
        let ctx = fx.ctx(false);
        let mut post = base_post("at://a/p/1", "did:plc:nobody", 2);
        post.text = Some("Rust is great".to_string());
        let scored = score_candidate(&post, &ctx);
        // 0.5 * 1200 outside the graph
        assert!((scored.signals["keyword"] - 600.0).abs() < 1e-9);

        let ctx = fx.ctx(true);
        let scored = score_candidate(&post, &ctx);
        assert!((scored.signals["keyword"] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_taste_signal_consensus_scaling() {
        let mut fx = Fixture::new();
        fx.taste_hits.insert(
            "at://a/p/1".to_string(),
            TasteHit {
                twin_count: 3,
                mean_reputation: 1.0,
            },
        );
        let ctx = fx.ctx(false);
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:nobody", 2), &ctx);
        // 1.0 * 2500 * (1 + 0.8*2) = 6500
        assert!((scored.signals["taste"] - 6500.0).abs() < 1e-9);
    }

    #[test]
    fn test_already_liked_penalty() {
        let mut fx = Fixture::new();
        fx.interactions.insert(
            "at://a/p/1".to_string(),
            [InteractionKind::Like].into_iter().collect(),
        );
        let ctx = fx.ctx(false);
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:friend", 2), &ctx);
        assert_eq!(scored.signals["already_liked"], -8000.0);
    }

    #[test]
    fn test_seen_multiplier_applied_outside_batch_mode() {
        let mut fx = Fixture::new();
        fx.seen.insert("at://a/p/1".to_string(), 2);
        let post = base_post("at://a/p/1", "did:plc:friend", 2);

        let serve = score_candidate(&post, &fx.ctx(false));
        assert!((serve.signals["seen_multiplier"] - 0.25).abs() < 1e-9);

        let batch = score_candidate(&post, &fx.ctx(true));
        assert!(!batch.signals.contains_key("seen_multiplier"));
        assert!(batch.score > serve.score);
    }

    #[test]
    fn test_seen_score_strictly_decreasing() {
        let post = base_post("at://a/p/1", "did:plc:friend", 2);
        let mut last = f64::MAX;
        for count in 0..4 {
            let mut fx = Fixture::new();
            fx.seen.insert("at://a/p/1".to_string(), count);
            let scored = score_candidate(&post, &fx.ctx(false));
            assert!(scored.score < last, "seen={count} did not decrease");
            last = scored.score;
        }
    }

    #[test]
    fn test_ghost_penalty() {
        let fx = Fixture::new();
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:friend", 0), &fx.ctx(false));
        assert_eq!(scored.signals["ghost_penalty"], -500.0);
    }

    #[test]
    fn test_negative_fatigue_is_a_bonus() {
        let mut fx = Fixture::new();
        let mut fatigue = AuthorFatigue::new("did:plc:me", "did:plc:friend", "2026-01-01T00:00:00Z");
        fatigue.fatigue_score = -20.0;
        fx.fatigue.insert("did:plc:friend".to_string(), fatigue);
        let scored = score_candidate(&base_post("at://a/p/1", "did:plc:friend", 2), &fx.ctx(false));
        assert_eq!(scored.signals["author_fatigue"], 1000.0);
    }

    #[test]
    fn test_hot_fatigue_penalty_engagement_damping() {
        let now = Utc::now();
        let mut fatigue = AuthorFatigue::new("did:plc:me", "did:plc:a", "2026-01-01T00:00:00Z");
        fatigue.fatigue_score = 50.0;

        let mut post = base_post("at://a/p/1", "did:plc:a", 2);
        assert_eq!(author_fatigue_signal(&fatigue, &post, now), -1600.0);

        post.like_count = 150;
        assert!((author_fatigue_signal(&fatigue, &post, now) + 480.0).abs() < 1e-9);
    }

    #[test]
    fn test_reply_signals() {
        let mut fx = Fixture::new();
        fx.graph.mutuals.insert("did:plc:friend".to_string());
        let ctx = fx.ctx(false);
        let mut reply = base_post("at://a/p/r1", "did:plc:friend", 2);
        reply.reply_root = Some("at://a/p/root".to_string());
        reply.reply_parent = Some("at://a/p/root".to_string());
        reply.like_count = 6;

        let scored = score_candidate(&reply, &ctx);
        assert_eq!(scored.signals["reply_base"], -800.0);
        assert_eq!(scored.signals["reply_mutual"], 600.0);
        assert_eq!(scored.signals["reply_popularity"], 300.0);
        assert_eq!(scored.signals["reply_graph_tier"], 400.0);
    }

    #[test]
    fn test_reply_old_parent_penalty() {
        let mut fx = Fixture::new();
        fx.parents.insert(
            "at://a/p/old".to_string(),
            base_post("at://a/p/old", "did:plc:x", 48),
        );
        let ctx = fx.ctx(false);
        let mut reply = base_post("at://a/p/r1", "did:plc:friend", 2);
        reply.reply_root = Some("at://a/p/old".to_string());
        reply.reply_parent = Some("at://a/p/old".to_string());
        let scored = score_candidate(&reply, &ctx);
        // 5 * 48h = 240
        let penalty = scored.signals["reply_old_parent"];
        assert!(penalty <= -239.0 && penalty >= -241.0, "got {penalty}");
    }
}
