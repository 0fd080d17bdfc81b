// Network-effort aggregation.
//
// For every candidate URI, collect the interactions held by the user's L1
// accounts and influential-L2 accounts, and fold them into per-target
// totals. The first repost coming from an L1 follower also supplies the
// repost attribution URI for the feed's reason field.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::db::models::InteractionKind;
use crate::db::Database;
use crate::graph::UserGraph;

/// Aggregated graph attention on one candidate post.
#[derive(Debug, Clone, Default)]
pub struct NetworkEffort {
    pub likes: i64,
    pub reposts: i64,
    pub actors: HashSet<String>,
    /// Repost record URI from the first L1 reposter, for attribution.
    pub repost_uri: Option<String>,
}

impl NetworkEffort {
    pub fn total(&self) -> i64 {
        self.likes + self.reposts
    }
}

/// Fetch and aggregate network interactions on the candidate URIs.
pub async fn collect(
    db: &Arc<dyn Database>,
    uris: &[String],
    graph: &UserGraph,
    influential_l2: &HashSet<String>,
) -> Result<HashMap<String, NetworkEffort>> {
    let mut actors: HashSet<String> = graph.l1.clone();
    actors.extend(influential_l2.iter().cloned());
    if actors.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = db.get_network_interactions(uris, &actors).await?;

    let mut efforts: HashMap<String, NetworkEffort> = HashMap::new();
    for row in rows {
        let effort = efforts.entry(row.target.clone()).or_default();
        match row.kind {
            InteractionKind::Like => effort.likes += 1,
            InteractionKind::Repost => {
                effort.reposts += 1;
                if effort.repost_uri.is_none() && graph.l1.contains(&row.actor) {
                    effort.repost_uri = row.interaction_uri.clone();
                }
            }
            InteractionKind::Reply => {}
        }
        effort.actors.insert(row.actor);
    }

    Ok(efforts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::InteractionEdge;
    use crate::db::{self};

    #[tokio::test]
    async fn test_collect_aggregates_per_target() {
        let store = db::open_in_memory().unwrap();
        let now = "2026-01-01T00:00:00Z";
        store
            .insert_interactions(&[
                InteractionEdge {
                    actor: "did:plc:l1a".to_string(),
                    target: "at://x/p/1".to_string(),
                    kind: InteractionKind::Like,
                    weight: 1,
                    indexed_at: now.to_string(),
                    interaction_uri: None,
                },
                InteractionEdge {
                    actor: "did:plc:l1b".to_string(),
                    target: "at://x/p/1".to_string(),
                    kind: InteractionKind::Repost,
                    weight: 2,
                    indexed_at: now.to_string(),
                    interaction_uri: Some("at://did:plc:l1b/app.bsky.feed.repost/r1".to_string()),
                },
                InteractionEdge {
                    actor: "did:plc:stranger".to_string(),
                    target: "at://x/p/1".to_string(),
                    kind: InteractionKind::Like,
                    weight: 1,
                    indexed_at: now.to_string(),
                    interaction_uri: None,
                },
            ])
            .await
            .unwrap();

        let graph = UserGraph {
            user: "did:plc:me".to_string(),
            l1: ["did:plc:l1a".to_string(), "did:plc:l1b".to_string()]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let efforts = collect(
            &store,
            &["at://x/p/1".to_string()],
            &graph,
            &HashSet::new(),
        )
        .await
        .unwrap();

        let effort = efforts.get("at://x/p/1").unwrap();
        assert_eq!(effort.likes, 1);
        assert_eq!(effort.reposts, 1);
        assert_eq!(effort.actors.len(), 2);
        assert_eq!(
            effort.repost_uri.as_deref(),
            Some("at://did:plc:l1b/app.bsky.feed.repost/r1")
        );
    }
}
