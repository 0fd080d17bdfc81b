// Explicit feedback — "show me more / less of this".
//
// One feedback event fans out four ways: the author's affinity and fatigue,
// the user's keyword scores (whole words of the post text), the reputation
// of the post's likers, and a feedback log row the semantic profile builder
// reads later.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use crate::db::Database;
use crate::taste::{fatigue, PostLikerSource, ReputationAction, TasteEngine};

/// Cap on external likers whose reputation one feedback event can touch.
const FEEDBACK_LIKER_CAP: usize = 50;

/// Words shorter than this never become keyword adjustments.
const MIN_KEYWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackAction {
    More,
    Less,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::More => "more",
            FeedbackAction::Less => "less",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStrength {
    Strong,
    Weak,
}

impl FeedbackStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStrength::Strong => "strong",
            FeedbackStrength::Weak => "weak",
        }
    }
}

/// Per-event adjustment magnitudes.
fn deltas(action: FeedbackAction, strength: FeedbackStrength) -> (f64, f64, f64) {
    let (affinity, fatigue, keyword) = match strength {
        FeedbackStrength::Strong => (5.0, 60.0, 0.4),
        FeedbackStrength::Weak => (1.0, 20.0, 0.15),
    };
    match action {
        FeedbackAction::More => (affinity, -fatigue, keyword),
        FeedbackAction::Less => (-affinity, fatigue, -keyword),
    }
}

/// Lowercased whole words of qualifying length, order-preserving, deduped.
pub fn feedback_keywords(text: &str, restricted: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() < MIN_KEYWORD_LEN {
            continue;
        }
        let word = word.to_lowercase();
        if restricted.contains(&word) {
            continue;
        }
        if seen.insert(word.clone()) {
            out.push(word);
        }
    }
    out
}

/// Apply one explicit feedback event end to end.
#[allow(clippy::too_many_arguments)]
pub async fn apply_feedback(
    db: &Arc<dyn Database>,
    likers: &Arc<dyn PostLikerSource>,
    restricted: &HashSet<String>,
    user: &str,
    post_uri: &str,
    action: FeedbackAction,
    strength: FeedbackStrength,
) -> Result<()> {
    let now = Utc::now();
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let (affinity_delta, fatigue_delta, keyword_delta) = deltas(action, strength);

    db.record_feedback(
        user,
        post_uri,
        action.as_str(),
        strength.as_str(),
        &stamp,
    )
    .await?;

    let post = match db.get_post(post_uri).await? {
        Some(p) => p,
        None => {
            // The post may have been GC'd or never indexed; the feedback
            // row above still informs the next profile build.
            warn!(uri = post_uri, "Feedback target not in store, skipping fan-out");
            return Ok(());
        }
    };

    // 1. Author affinity / fatigue
    let mut author_fatigue = db
        .get_author_fatigue(user, &post.author)
        .await?
        .unwrap_or_else(|| crate::db::models::AuthorFatigue::new(user, &post.author, &stamp));
    fatigue::apply_feedback(&mut author_fatigue, affinity_delta, fatigue_delta, now);
    db.upsert_author_fatigue(&author_fatigue).await?;

    // 2. Keyword scores from the post text
    if let Some(text) = &post.text {
        let existing: std::collections::HashMap<String, f64> = db
            .get_user_keywords(user)
            .await?
            .into_iter()
            .map(|k| (k.keyword, k.score))
            .collect();
        for word in feedback_keywords(text, restricted) {
            let score = existing.get(&word).copied().unwrap_or(0.0) + keyword_delta;
            db.upsert_user_keyword(user, &word, score.clamp(-1.0, 1.0), &stamp)
                .await?;
        }
    }

    // 3. Reputation of the post's likers
    let rep_action = match action {
        FeedbackAction::More => ReputationAction::ExplicitMore,
        FeedbackAction::Less => ReputationAction::ExplicitLess,
    };
    let engine = TasteEngine::new(db.clone(), likers.clone());
    for actor in likers.post_likers(post_uri, FEEDBACK_LIKER_CAP).await {
        if actor == user {
            continue;
        }
        engine.update_reputation(user, &actor, rep_action).await?;
    }

    info!(
        user,
        uri = post_uri,
        action = action.as_str(),
        strength = strength.as_str(),
        "Explicit feedback applied"
    );
    Ok(())
}
