// Graph service — follow-graph construction and caching.
//
// Layer-1 is everything the user follows; Layer-2 is the first hundred
// follows of each L1 account. Rebuilds are gated to once per 24 hours via
// a meta key, individual L2 fetch failures are logged and skipped, and the
// influential-L2 ranking is cached with its own longer TTL.

pub mod rate_limit;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::appview::AppViewClient;
use crate::db::models::InfluentialL2;
use crate::db::Database;
use crate::taste::PostLikerSource;
use rate_limit::RateLimiter;

/// Minimum hours between full graph rebuilds per user.
const REBUILD_GATE_HOURS: i64 = 24;

/// L1 follow fetch ceiling.
const L1_CAP: usize = 2000;

/// Follows fetched per L1 account for the L2 layer.
const L2_PER_L1: usize = 100;

/// Influential-L2 cache TTL. 24 h staleness is tolerated below this.
const INFLUENTIAL_TTL_HOURS: i64 = 72;

/// Influential-L2 entries kept per user.
const INFLUENTIAL_KEEP: usize = 100;

/// L2 accounts need at least this many L1 followers to be influence-scored.
const INFLUENCE_MIN_L1: i64 = 2;

/// The user's social graph split by tier, plus interacted authors.
#[derive(Debug, Clone, Default)]
pub struct UserGraph {
    pub user: String,
    pub l1: HashSet<String>,
    pub l2: HashSet<String>,
    pub mutuals: HashSet<String>,
    pub interacted: HashSet<String>,
}

impl UserGraph {
    /// All DIDs whose posts the recall stage wants: self ∪ L1 ∪ L2.
    pub fn wanted_dids(&self) -> HashSet<String> {
        if self.l1.is_empty() {
            return [self.user.clone()].into_iter().collect();
        }
        let mut wanted = HashSet::with_capacity(1 + self.l1.len() + self.l2.len());
        wanted.insert(self.user.clone());
        wanted.extend(self.l1.iter().cloned());
        wanted.extend(self.l2.iter().cloned());
        wanted
    }

    pub fn in_graph(&self, did: &str) -> bool {
        did == self.user
            || self.l1.contains(did)
            || self.l2.contains(did)
            || self.interacted.contains(did)
    }
}

pub struct GraphService {
    db: Arc<dyn Database>,
    appview: Arc<AppViewClient>,
    limiter: RateLimiter,
}

impl GraphService {
    pub fn new(db: Arc<dyn Database>, appview: Arc<AppViewClient>) -> Self {
        Self {
            db,
            appview,
            limiter: RateLimiter::for_appview(),
        }
    }

    fn rebuild_key(user: &str) -> String {
        format!("graph_last_update_{user}")
    }

    /// Rebuild the user's follow graph from the external social graph.
    ///
    /// Idempotent and gated: at most one rebuild per 24 h per user. Returns
    /// true if a rebuild actually ran.
    pub async fn build_user_graph(&self, user: &str) -> Result<bool> {
        let key = Self::rebuild_key(user);
        if let Some(last) = self.db.get_meta(&key).await? {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(&last) {
                let age = Utc::now() - parsed.with_timezone(&Utc);
                if age < Duration::hours(REBUILD_GATE_HOURS) {
                    return Ok(false);
                }
            }
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let l1 = self.appview.get_follows(user, L1_CAP).await?;
        info!(user, l1 = l1.len(), "Layer-1 follows fetched");

        let edges: Vec<(String, String)> = l1
            .iter()
            .map(|followee| (user.to_string(), followee.clone()))
            .collect();
        self.db.insert_follows(&edges, &now).await?;

        for followee in &l1 {
            self.limiter.acquire().await;
            match self.appview.get_follows(followee, L2_PER_L1).await {
                Ok(their_follows) => {
                    let edges: Vec<(String, String)> = their_follows
                        .into_iter()
                        .map(|f| (followee.clone(), f))
                        .collect();
                    self.db.insert_follows(&edges, &now).await?;
                }
                Err(e) => {
                    warn!(followee, error = %e, "L2 fetch failed, skipping");
                }
            }
        }

        self.db.set_meta(&key, &now).await?;
        info!(user, "Graph rebuild complete");
        Ok(true)
    }

    /// Assemble the tiered graph view used by ranking.
    pub async fn load_user_graph(&self, user: &str, interacted_since: &str) -> Result<UserGraph> {
        let l1: HashSet<String> = self.db.get_followees(user).await?.into_iter().collect();
        let mutuals: HashSet<String> = self.db.get_mutuals(user).await?.into_iter().collect();

        let mut l2 = HashSet::new();
        for followee in &l1 {
            for second in self.db.get_followees(followee).await? {
                if second != user && !l1.contains(&second) {
                    l2.insert(second);
                }
            }
        }

        let interacted: HashSet<String> = self
            .db
            .get_interacted_authors(user, interacted_since)
            .await?
            .into_iter()
            .collect();

        Ok(UserGraph {
            user: user.to_string(),
            l1,
            l2,
            mutuals,
            interacted,
        })
    }

    /// The influential-L2 set for a user, refreshed when the cache passes
    /// its TTL. Influence favors accounts many of the user's L1 follow but
    /// few others do: (l1Count / √totalFollowers) · l1Count.
    pub async fn influential_l2(&self, user: &str, graph: &UserGraph) -> Result<Vec<InfluentialL2>> {
        let cached = self.db.get_influential_l2(user).await?;
        if let Some(first) = cached.first() {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(&first.updated_at) {
                let age = Utc::now() - parsed.with_timezone(&Utc);
                if age < Duration::hours(INFLUENTIAL_TTL_HOURS) {
                    return Ok(cached);
                }
            }
        }
        self.refresh_influential_l2(user, graph).await
    }

    async fn refresh_influential_l2(
        &self,
        user: &str,
        graph: &UserGraph,
    ) -> Result<Vec<InfluentialL2>> {
        let l1_counts = self.db.count_l1_followers(user, &graph.l2).await?;

        let mut candidates: Vec<(String, i64)> = l1_counts
            .into_iter()
            .filter(|(_, count)| *count >= INFLUENCE_MIN_L1)
            .collect();
        // Pre-rank by L1 coverage so the profile fetch stays bounded
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(INFLUENTIAL_KEEP * 4);

        let dids: Vec<String> = candidates.iter().map(|(did, _)| did.clone()).collect();
        let follower_counts: HashMap<String, i64> =
            self.appview.get_follower_counts(&dids).await;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut rows: Vec<InfluentialL2> = candidates
            .into_iter()
            .map(|(did, l1_count)| {
                let total = follower_counts.get(&did).copied().unwrap_or(0).max(1) as f64;
                let l1 = l1_count as f64;
                InfluentialL2 {
                    user_did: user.to_string(),
                    l2_did: did,
                    influence_score: (l1 / total.sqrt()) * l1,
                    l1_follower_count: l1_count,
                    updated_at: now.clone(),
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.influence_score
                .partial_cmp(&a.influence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(INFLUENTIAL_KEEP);

        self.db.replace_influential_l2(user, &rows).await?;
        info!(user, kept = rows.len(), "Influential-L2 cache refreshed");
        Ok(rows)
    }
}

#[async_trait]
impl PostLikerSource for GraphService {
    /// External liker lookup; failures degrade to an empty list.
    async fn post_likers(&self, uri: &str, limit: usize) -> Vec<String> {
        match self.appview.get_post_likers(uri, limit).await {
            Ok(likers) => likers,
            Err(e) => {
                warn!(uri, error = %e, "Post liker lookup failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanted_dids_falls_back_to_self() {
        let graph = UserGraph {
            user: "did:plc:me".to_string(),
            ..Default::default()
        };
        let wanted = graph.wanted_dids();
        assert_eq!(wanted.len(), 1);
        assert!(wanted.contains("did:plc:me"));
    }

    #[test]
    fn test_wanted_dids_unions_layers() {
        let graph = UserGraph {
            user: "did:plc:me".to_string(),
            l1: ["did:plc:a".to_string()].into_iter().collect(),
            l2: ["did:plc:b".to_string(), "did:plc:a".to_string()]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let wanted = graph.wanted_dids();
        assert_eq!(wanted.len(), 3);
    }

    #[test]
    fn test_in_graph_covers_interacted() {
        let graph = UserGraph {
            user: "did:plc:me".to_string(),
            l1: ["did:plc:a".to_string()].into_iter().collect(),
            interacted: ["did:plc:artist".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(graph.in_graph("did:plc:artist"));
        assert!(!graph.in_graph("did:plc:stranger"));
    }
}
