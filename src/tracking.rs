// Tracked DID sets.
//
// Two distinct sets drive ingest decisions:
//   - `own`: whitelisted users the system serves feeds for (small)
//   - `interaction`: whitelist ∪ their L1 follows ∪ high-reputation
//     taste-twins (much larger) — actors whose likes/reposts/replies
//     become interaction edges
//
// The sets are rebuilt every 15 minutes by the scheduler and read from the
// hot ingest path, so they sit behind an RwLock.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::info;

use crate::db::Database;

/// Reputation at or above which a taste-twin's interactions are tracked.
const TWIN_TRACK_THRESHOLD: f64 = 1.5;

/// Taste-twins tracked per whitelisted user.
const TWIN_TRACK_LIMIT: usize = 200;

#[derive(Debug, Default, Clone)]
pub struct TrackedSets {
    pub own: HashSet<String>,
    pub interaction: HashSet<String>,
}

pub struct Tracker {
    db: Arc<dyn Database>,
    whitelist: HashSet<String>,
    sets: RwLock<TrackedSets>,
}

impl Tracker {
    pub fn new(db: Arc<dyn Database>, whitelist: HashSet<String>) -> Self {
        let initial = TrackedSets {
            own: whitelist.clone(),
            interaction: whitelist.clone(),
        };
        Self {
            db,
            whitelist,
            sets: RwLock::new(initial),
        }
    }

    /// Rebuild both sets from the store.
    pub async fn refresh(&self) -> Result<()> {
        let mut interaction: HashSet<String> = self.whitelist.clone();
        for user in &self.whitelist {
            for followee in self.db.get_followees(user).await? {
                interaction.insert(followee);
            }
            for (twin, _score) in self
                .db
                .get_taste_twins(user, TWIN_TRACK_THRESHOLD, TWIN_TRACK_LIMIT)
                .await?
            {
                interaction.insert(twin);
            }
        }

        info!(
            own = self.whitelist.len(),
            interaction = interaction.len(),
            "Tracked DID sets refreshed"
        );

        let mut sets = self.sets.write().await;
        sets.own = self.whitelist.clone();
        sets.interaction = interaction;
        Ok(())
    }

    pub async fn is_own(&self, did: &str) -> bool {
        self.sets.read().await.own.contains(did)
    }

    pub async fn is_interaction(&self, did: &str) -> bool {
        self.sets.read().await.interaction.contains(did)
    }

    /// Snapshot of the interaction set, for the post-connect subscription
    /// options message.
    pub async fn interaction_dids(&self) -> Vec<String> {
        let sets = self.sets.read().await;
        sets.interaction.iter().cloned().collect()
    }

    /// The whitelisted users, for per-user jobs.
    pub fn whitelist(&self) -> &HashSet<String> {
        &self.whitelist
    }
}
