// Author fatigue and affinity.
//
// Serving an author's posts heats up fatigue; the user interacting with that
// author cools it and builds affinity. Time passing recovers fatigue on the
// next touch. Fatigue is clamped to [-100, 100], affinity to [0.1, 10].

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::models::{AuthorFatigue, InteractionKind};
use crate::db::Database;

pub const FATIGUE_MIN: f64 = -100.0;
pub const FATIGUE_MAX: f64 = 100.0;
pub const AFFINITY_MIN: f64 = 0.1;
pub const AFFINITY_MAX: f64 = 10.0;

fn hours_since(ts: &Option<String>, now: DateTime<Utc>) -> Option<f64> {
    let ts = ts.as_deref()?;
    let parsed = DateTime::parse_from_rfc3339(ts).ok()?;
    Some((now - parsed.with_timezone(&Utc)).num_seconds() as f64 / 3600.0)
}

fn clamp(fatigue: &mut AuthorFatigue) {
    fatigue.fatigue_score = fatigue.fatigue_score.clamp(FATIGUE_MIN, FATIGUE_MAX);
    fatigue.affinity_score = fatigue.affinity_score.clamp(AFFINITY_MIN, AFFINITY_MAX);
}

/// Apply one serve to an author-fatigue row.
///
/// Recovery runs first (30% after 48 h idle, 15% after 24 h), then the
/// serve-count band adds fatigue and passively cools affinity.
pub fn apply_serve(fatigue: &mut AuthorFatigue, now: DateTime<Utc>) {
    match hours_since(&fatigue.last_served_at, now) {
        Some(h) if h >= 48.0 => fatigue.fatigue_score *= 0.7,
        Some(h) if h >= 24.0 => fatigue.fatigue_score *= 0.85,
        _ => {}
    }

    fatigue.serve_count += 1;
    fatigue.fatigue_score += match fatigue.serve_count {
        0..=3 => 3.0,
        4..=10 => 5.0,
        _ => 8.0,
    };
    fatigue.affinity_score -= 0.05;

    clamp(fatigue);
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    fatigue.last_served_at = Some(stamp.clone());
    fatigue.updated_at = stamp;
}

/// Apply one interaction (the user engaging with the author's content).
///
/// The first interaction after a 72 h gap lands 1.5x as hard.
pub fn apply_interaction(fatigue: &mut AuthorFatigue, kind: InteractionKind, now: DateTime<Utc>) {
    let (fatigue_delta, affinity_delta) = match kind {
        InteractionKind::Like => (-25.0, 0.8),
        InteractionKind::Repost => (-30.0, 1.2),
        InteractionKind::Reply => (-20.0, 0.5),
    };

    let fresh_contact = match hours_since(&fatigue.last_interaction_at, now) {
        Some(h) => h >= 72.0,
        None => true,
    };
    let factor = if fresh_contact { 1.5 } else { 1.0 };

    fatigue.fatigue_score += fatigue_delta * factor;
    fatigue.affinity_score += affinity_delta * factor;
    fatigue.interaction_weight += kind.weight() as f64;
    fatigue.interaction_count += 1;

    clamp(fatigue);
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    fatigue.last_interaction_at = Some(stamp.clone());
    fatigue.updated_at = stamp;
}

/// Apply one seen report — a small passive affinity decay.
pub fn apply_seen(fatigue: &mut AuthorFatigue, now: DateTime<Utc>) {
    fatigue.affinity_score -= 0.02;
    clamp(fatigue);
    fatigue.updated_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
}

/// Apply an explicit-feedback adjustment with raw deltas (signs included).
pub fn apply_feedback(
    fatigue: &mut AuthorFatigue,
    affinity_delta: f64,
    fatigue_delta: f64,
    now: DateTime<Utc>,
) {
    fatigue.affinity_score += affinity_delta;
    fatigue.fatigue_score += fatigue_delta;
    clamp(fatigue);
    fatigue.updated_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
}

async fn load_or_new(db: &Arc<dyn Database>, user: &str, author: &str) -> Result<AuthorFatigue> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    Ok(db
        .get_author_fatigue(user, author)
        .await?
        .unwrap_or_else(|| AuthorFatigue::new(user, author, &now)))
}

/// Record a serve against the store.
pub async fn record_serve(db: &Arc<dyn Database>, user: &str, author: &str) -> Result<()> {
    let mut fatigue = load_or_new(db, user, author).await?;
    apply_serve(&mut fatigue, Utc::now());
    db.upsert_author_fatigue(&fatigue).await
}

/// Record an interaction against the store.
pub async fn record_interaction(
    db: &Arc<dyn Database>,
    user: &str,
    author: &str,
    kind: InteractionKind,
) -> Result<()> {
    let mut fatigue = load_or_new(db, user, author).await?;
    apply_interaction(&mut fatigue, kind, Utc::now());
    db.upsert_author_fatigue(&fatigue).await
}

/// Record a seen report against the store.
pub async fn record_seen_decay(db: &Arc<dyn Database>, user: &str, author: &str) -> Result<()> {
    let mut fatigue = load_or_new(db, user, author).await?;
    apply_seen(&mut fatigue, Utc::now());
    db.upsert_author_fatigue(&fatigue).await
}
