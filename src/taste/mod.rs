// Taste-twin similarity and reputation.
//
// Every like by a whitelisted user updates two things: co-like similarity
// counts against other tracked actors, and a decaying reputation score per
// (user, other) pair. External likers of the same post are folded in too —
// that's how taste-twins outside the follow graph get discovered at all.
//
// Reputation math is pure and lives in apply_reputation_action so the
// clamps and decay behavior are testable without a database.

pub mod fatigue;
pub mod feedback;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::db::models::{InteractionKind, TasteReputation};
use crate::db::Database;

/// Cap on external likers folded in per engaged post.
const EXTERNAL_LIKER_CAP: usize = 100;

/// Reputation bounds — enforced after every action.
pub const REPUTATION_FLOOR: f64 = 0.001;
pub const REPUTATION_CEIL: f64 = 5.0;

/// Starting reputation for a pair first observed through an agreement.
const AGREEMENT_BOOTSTRAP: f64 = 1.2;

/// Default decay rate for new pairs; nudged per action within [0.5, 0.999].
const DEFAULT_DECAY_RATE: f64 = 0.95;

/// Source of a post's likers outside our own interaction table.
/// Implemented by the graph service; failures degrade to an empty list.
#[async_trait]
pub trait PostLikerSource: Send + Sync {
    async fn post_likers(&self, uri: &str, limit: usize) -> Vec<String>;
}

/// What happened between a user and a taste-twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationAction {
    Agreement,
    Disagreement,
    ExplicitMore,
    ExplicitLess,
    ServedLiked,
    ServedIgnored,
}

/// Decay a reputation score for the time elapsed, then apply the action's
/// multiplier and clamps. The decay itself is idempotent (anchored on
/// `updated_at`); the action multiplier is not — concurrent duplicates
/// compound, which we accept as approximately-once.
pub fn apply_reputation_action(
    rep: &mut TasteReputation,
    action: ReputationAction,
    now: DateTime<Utc>,
) {
    // Time decay first
    if let Ok(updated) = DateTime::parse_from_rfc3339(&rep.updated_at) {
        let hours = (now - updated.with_timezone(&Utc)).num_seconds() as f64 / 3600.0;
        if hours > 0.0 {
            rep.reputation_score *= rep.decay_rate.powf(hours / 24.0);
        }
    }

    match action {
        ReputationAction::Agreement => {
            rep.reputation_score = (rep.reputation_score * 1.15).min(3.0);
            rep.agreement_history += 1.0;
            rep.decay_rate = (rep.decay_rate + 0.005).min(0.999);
        }
        ReputationAction::Disagreement => {
            rep.reputation_score = (rep.reputation_score * 0.85).max(0.1);
            rep.decay_rate = (rep.decay_rate - 0.01).max(0.5);
        }
        ReputationAction::ExplicitMore => {
            rep.reputation_score = (rep.reputation_score * 1.6).min(5.0);
            rep.agreement_history += 2.0;
            rep.decay_rate = (rep.decay_rate + 0.005).min(0.999);
        }
        ReputationAction::ExplicitLess => {
            rep.reputation_score = (rep.reputation_score * 0.1).max(0.001);
            rep.decay_rate = (rep.decay_rate - 0.01).max(0.5);
        }
        ReputationAction::ServedLiked => {
            rep.reputation_score *= 1.05;
            rep.decay_rate = (rep.decay_rate + 0.002).min(0.999);
        }
        ReputationAction::ServedIgnored => {
            rep.reputation_score *= 0.95;
            rep.decay_rate = (rep.decay_rate - 0.002).max(0.5);
        }
    }

    rep.reputation_score = rep.reputation_score.clamp(REPUTATION_FLOOR, REPUTATION_CEIL);
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    rep.last_seen_at = Some(stamp.clone());
    rep.updated_at = stamp;
}

/// A fresh reputation row for a pair first observed via `action`.
pub fn bootstrap_reputation(
    user: &str,
    other: &str,
    action: ReputationAction,
    now: DateTime<Utc>,
) -> TasteReputation {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut rep = TasteReputation {
        user_did: user.to_string(),
        similar_did: other.to_string(),
        reputation_score: 1.0,
        agreement_history: 0.0,
        last_seen_at: Some(stamp.clone()),
        decay_rate: DEFAULT_DECAY_RATE,
        updated_at: stamp,
    };
    match action {
        ReputationAction::Agreement => {
            rep.reputation_score = AGREEMENT_BOOTSTRAP;
            rep.agreement_history = 1.0;
        }
        // Apply the action to the neutral starting score; no time has
        // passed, so no decay applies
        _ => apply_reputation_action(&mut rep, action, now),
    }
    rep
}

pub struct TasteEngine {
    db: Arc<dyn Database>,
    likers: Arc<dyn PostLikerSource>,
}

impl TasteEngine {
    pub fn new(db: Arc<dyn Database>, likers: Arc<dyn PostLikerSource>) -> Self {
        Self { db, likers }
    }

    /// Apply one reputation action to a pair, creating the row if needed.
    pub async fn update_reputation(
        &self,
        user: &str,
        other: &str,
        action: ReputationAction,
    ) -> Result<()> {
        let now = Utc::now();
        let rep = match self.db.get_taste_reputation(user, other).await? {
            Some(mut rep) => {
                apply_reputation_action(&mut rep, action, now);
                rep
            }
            None => bootstrap_reputation(user, other, action, now),
        };
        self.db.upsert_taste_reputation(&rep).await
    }

    /// Handle a like or repost by a whitelisted user.
    ///
    /// Co-likers from our own interaction table get similarity bumps and
    /// agreement updates; external likers (capped) get agreement updates
    /// only — that's the taste-twin discovery bootstrap.
    pub async fn on_engagement(
        &self,
        user: &str,
        post_uri: &str,
        kind: InteractionKind,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        for actor in self.db.get_local_likers(post_uri).await? {
            if actor == user {
                continue;
            }
            self.db.bump_taste_similarity(user, &actor, &now).await?;
            self.update_reputation(user, &actor, ReputationAction::Agreement)
                .await?;
        }

        let external = self.likers.post_likers(post_uri, EXTERNAL_LIKER_CAP).await;
        debug!(
            post = post_uri,
            external = external.len(),
            "Folding external likers into taste reputation"
        );
        for actor in external {
            if actor == user {
                continue;
            }
            self.update_reputation(user, &actor, ReputationAction::Agreement)
                .await?;
        }

        // Liking an author's post also cools any serving fatigue toward them
        if let Some(post) = self.db.get_post(post_uri).await? {
            if post.author != user {
                if let Err(e) =
                    fatigue::record_interaction(&self.db, user, &post.author, kind).await
                {
                    warn!(error = %e, "Author fatigue update failed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rep_at(score: f64, decay_rate: f64, updated_at: DateTime<Utc>) -> TasteReputation {
        TasteReputation {
            user_did: "did:plc:u".to_string(),
            similar_did: "did:plc:x".to_string(),
            reputation_score: score,
            agreement_history: 0.0,
            last_seen_at: None,
            decay_rate,
            updated_at: updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    #[test]
    fn test_agreement_bootstrap_score() {
        let rep = bootstrap_reputation(
            "did:plc:u",
            "did:plc:x",
            ReputationAction::Agreement,
            Utc::now(),
        );
        assert!((rep.reputation_score - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_agreement_multiplies_and_caps() {
        let now = Utc::now();
        let mut rep = rep_at(2.9, 0.95, now);
        apply_reputation_action(&mut rep, ReputationAction::Agreement, now);
        // 2.9 * 1.15 = 3.335, capped at 3.0
        assert!((rep.reputation_score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_less_floors() {
        let now = Utc::now();
        let mut rep = rep_at(0.005, 0.95, now);
        apply_reputation_action(&mut rep, ReputationAction::ExplicitLess, now);
        assert!((rep.reputation_score - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_decay_applied_before_action() {
        let now = Utc::now();
        let two_days_ago = now - Duration::hours(48);
        let mut rep = rep_at(2.0, 0.9, two_days_ago);
        apply_reputation_action(&mut rep, ReputationAction::Agreement, now);
        // 2.0 * 0.9^2 = 1.62, then * 1.15 = 1.863
        assert!(
            (rep.reputation_score - 1.863).abs() < 1e-6,
            "got {}",
            rep.reputation_score
        );
    }

    #[test]
    fn test_decay_rate_nudges_within_bounds() {
        let now = Utc::now();
        let mut rep = rep_at(1.0, 0.998, now);
        apply_reputation_action(&mut rep, ReputationAction::Agreement, now);
        assert!((rep.decay_rate - 0.999).abs() < 1e-9);

        let mut rep = rep_at(1.0, 0.502, now);
        apply_reputation_action(&mut rep, ReputationAction::Disagreement, now);
        apply_reputation_action(&mut rep, ReputationAction::Disagreement, now);
        assert!(rep.decay_rate >= 0.5);
    }

    #[test]
    fn test_reputation_stays_in_bounds() {
        let now = Utc::now();
        let mut rep = rep_at(4.9, 0.999, now);
        for _ in 0..10 {
            apply_reputation_action(&mut rep, ReputationAction::ExplicitMore, now);
        }
        assert!(rep.reputation_score <= REPUTATION_CEIL);
        for _ in 0..50 {
            apply_reputation_action(&mut rep, ReputationAction::ExplicitLess, now);
        }
        assert!(rep.reputation_score >= REPUTATION_FLOOR);
    }
}
