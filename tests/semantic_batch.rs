// Semantic batch pipeline, end to end against the in-memory vector index
// with deterministic fake embedder and clusterer implementations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};

use tideline::appview::AppViewClient;
use tideline::db::models::{IngestBatch, InteractionEdge, InteractionKind, NewPost};
use tideline::db::{self, Database};
use tideline::graph::GraphService;
use tideline::ranking::RankingEngine;
use tideline::semantic::clusterer::{Centroid, ClusterInput, Clusterer};
use tideline::semantic::embedder::{EmbedInput, Embedder};
use tideline::semantic::vectors::{
    point_id, InMemoryIndex, VectorIndex, PROFILE_COLLECTION, VECTOR_DIM,
};
use tideline::semantic::SemanticPipeline;

const USER: &str = "did:plc:me";

/// Maps texts to fixed directions: "cats" -> axis 0, "dogs" -> axis 1,
/// everything else -> axis 2.
struct TopicEmbedder;

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; VECTOR_DIM];
    v[i] = 1.0;
    v
}

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed(&self, inputs: &[EmbedInput]) -> Result<HashMap<String, Vec<f32>>> {
        Ok(inputs
            .iter()
            .map(|input| {
                let vector = if input.text.contains("cats") {
                    axis(0)
                } else if input.text.contains("dogs") {
                    axis(1)
                } else {
                    axis(2)
                };
                (input.uri.clone(), vector)
            })
            .collect())
    }
}

/// Averages everything into a single L2-normalized centroid.
struct MeanClusterer;

#[async_trait]
impl Clusterer for MeanClusterer {
    async fn cluster(&self, inputs: &[ClusterInput]) -> Result<Vec<Centroid>> {
        let mut sum = vec![0.0f32; VECTOR_DIM];
        for input in inputs {
            for (s, v) in sum.iter_mut().zip(&input.vector) {
                *s += v;
            }
        }
        let norm: f32 = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in sum.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vec![Centroid {
            cluster_id: 0,
            centroid: sum,
            weight: 1.0,
            post_count: inputs.len(),
        }])
    }
}

/// A clusterer that forgets to normalize: the centroid comes back as the
/// raw sum of its inputs.
struct UnnormalizedClusterer;

#[async_trait]
impl Clusterer for UnnormalizedClusterer {
    async fn cluster(&self, inputs: &[ClusterInput]) -> Result<Vec<Centroid>> {
        let mut sum = vec![0.0f32; VECTOR_DIM];
        for input in inputs {
            for (s, v) in sum.iter_mut().zip(&input.vector) {
                *s += v;
            }
        }
        Ok(vec![Centroid {
            cluster_id: 0,
            centroid: sum,
            weight: 1.0,
            post_count: inputs.len(),
        }])
    }
}

fn ts(hours_ago: i64) -> String {
    (Utc::now() - Duration::hours(hours_ago)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn post(uri: &str, text: &str, hours_ago: i64) -> NewPost {
    NewPost {
        uri: uri.to_string(),
        cid: "cid".to_string(),
        author: "did:plc:friend".to_string(),
        indexed_at: ts(hours_ago),
        reply_root: None,
        reply_parent: None,
        text: Some(text.to_string()),
        has_image: false,
        has_video: false,
        has_external: false,
    }
}

struct Harness {
    store: Arc<dyn Database>,
    index: Arc<InMemoryIndex>,
    pipeline: SemanticPipeline,
}

impl Harness {
    fn new() -> Self {
        Self::with_clusterer(Arc::new(MeanClusterer))
    }

    fn with_clusterer(clusterer: Arc<dyn Clusterer>) -> Self {
        let store = db::open_in_memory().unwrap();
        let appview = Arc::new(AppViewClient::new("http://127.0.0.1:1").unwrap());
        let graph = Arc::new(GraphService::new(store.clone(), appview.clone()));
        let ranking = Arc::new(RankingEngine::new(store.clone(), graph));
        let index = Arc::new(InMemoryIndex::new());
        let pipeline = SemanticPipeline::new(
            store.clone(),
            ranking,
            appview,
            index.clone(),
            Arc::new(TopicEmbedder),
            clusterer,
        );
        Self {
            store,
            index,
            pipeline,
        }
    }

    async fn seed(&self) {
        self.store
            .insert_follows(
                &[(USER.to_string(), "did:plc:friend".to_string())],
                &ts(0),
            )
            .await
            .unwrap();

        let posts = vec![
            post("at://f/p/cat1", "my cats are sleeping on the keyboard", 30),
            post("at://f/p/cat2", "more cats doing cat things today", 28),
            post("at://f/p/cat3", "cats again, because of course cats", 26),
            post("at://f/p/cat4", "a fresh post about cats and naps", 3),
            post("at://f/p/cat5", "cats discovered a new sunbeam spot", 2),
            post("at://f/p/dog1", "the dogs went to the park today", 4),
        ];
        let likes: Vec<InteractionEdge> = ["at://f/p/cat1", "at://f/p/cat2", "at://f/p/cat3"]
            .iter()
            .map(|uri| InteractionEdge {
                actor: USER.to_string(),
                target: uri.to_string(),
                kind: InteractionKind::Like,
                weight: 1,
                indexed_at: ts(1),
                interaction_uri: None,
            })
            .collect();
        self.store
            .flush_ingest(&IngestBatch {
                posts,
                interactions: likes,
                ..Default::default()
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn builds_profile_and_materializes_cat_candidates() {
    let h = Harness::new();
    h.index.ensure_collections().await.unwrap();
    h.seed().await;

    let rows = h.pipeline.run_for_user(USER).await.unwrap();
    assert!(rows > 0, "expected candidate rows");

    let batch = h.store.load_candidate_batch(USER, &ts(1)).await.unwrap();
    let uris: Vec<&str> = batch.iter().map(|r| r.uri.as_str()).collect();

    // Unliked cat posts are semantically close to the profile
    assert!(uris.contains(&"at://f/p/cat4"), "cat4 missing from {uris:?}");
    assert!(uris.contains(&"at://f/p/cat5"));

    // Orthogonal content stays below the score threshold
    assert!(!uris.contains(&"at://f/p/dog1"));

    // Already-liked posts never re-enter through search
    assert!(!uris.contains(&"at://f/p/cat1"));

    // Pipeline scores came from the live ranking map, not the sandbox floor
    for row in &batch {
        assert!(
            row.pipeline_score > -4000.0,
            "{} fell back to the discovery baseline",
            row.uri
        );
        assert!(row.semantic_score >= 0.25);
    }

    // One centroid landed in the profile collection
    assert_eq!(h.index.point_count(PROFILE_COLLECTION), 1);
}

#[tokio::test]
async fn centroids_are_renormalized_before_persisting() {
    let h = Harness::with_clusterer(Arc::new(UnnormalizedClusterer));
    h.index.ensure_collections().await.unwrap();
    h.seed().await;

    h.pipeline.run_for_user(USER).await.unwrap();

    let profile_id = point_id(USER, "profile::0");
    let vectors = h
        .index
        .fetch_vectors(PROFILE_COLLECTION, vec![profile_id])
        .await
        .unwrap();
    let centroid = vectors
        .get(&profile_id)
        .expect("profile centroid should be stored");
    let norm: f32 = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!(
        (norm - 1.0).abs() < 1e-5,
        "stored centroid should be unit-norm, got {norm}"
    );
}

#[tokio::test]
async fn rerun_replaces_profile_instead_of_stacking() {
    let h = Harness::new();
    h.index.ensure_collections().await.unwrap();
    h.seed().await;

    h.pipeline.run_for_user(USER).await.unwrap();
    h.pipeline.run_for_user(USER).await.unwrap();

    assert_eq!(h.index.point_count(PROFILE_COLLECTION), 1);
}

#[tokio::test]
async fn too_few_liked_vectors_skips_profile() {
    let h = Harness::new();
    h.index.ensure_collections().await.unwrap();

    h.store
        .insert_follows(
            &[(USER.to_string(), "did:plc:friend".to_string())],
            &ts(0),
        )
        .await
        .unwrap();
    h.store
        .flush_ingest(&IngestBatch {
            posts: vec![post("at://f/p/solo", "one lonely post about cats", 2)],
            interactions: vec![InteractionEdge {
                actor: USER.to_string(),
                target: "at://f/p/solo".to_string(),
                kind: InteractionKind::Like,
                weight: 1,
                indexed_at: ts(1),
                interaction_uri: None,
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    let rows = h.pipeline.run_for_user(USER).await.unwrap();
    assert_eq!(h.index.point_count(PROFILE_COLLECTION), 0);
    assert_eq!(rows, 0, "no centroids means no semantic candidates");
}

#[tokio::test]
async fn cooldown_skips_back_to_back_runs() {
    let h = Harness::new();
    h.seed().await;

    let ran = h.pipeline.run_all(&[USER.to_string()], false).await.unwrap();
    assert!(ran);
    let ran_again = h.pipeline.run_all(&[USER.to_string()], false).await.unwrap();
    assert!(!ran_again, "cooldown should skip the immediate rerun");
    let forced = h.pipeline.run_all(&[USER.to_string()], true).await.unwrap();
    assert!(forced, "forced priority bypasses the cooldown");
}
