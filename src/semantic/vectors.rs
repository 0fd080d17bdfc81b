// Vector index client — Qdrant over its REST API.
//
// Two collections, both 512-dim cosine: post_embeddings holds per-user
// discovered posts (partitioned by the discoveredBy payload field so one
// user's vectors never leak into another's searches), and user_profiles
// holds the per-cluster interest centroids.
//
// The client is a thin reqwest wrapper in the same shape as the AppView
// client; the VectorIndex trait is the seam tests and local runs swap an
// in-memory implementation into.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

pub const POST_COLLECTION: &str = "post_embeddings";
pub const PROFILE_COLLECTION: &str = "user_profiles";
pub const VECTOR_DIM: usize = 512;

/// Deterministic 64-bit point id from (user, uri). Recomputable anywhere,
/// which is what makes orphan deletion by id possible.
pub fn point_id(user: &str, uri: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(uri.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub score: f64,
    pub payload: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create both collections and their payload indexes if missing.
    async fn ensure_collections(&self) -> Result<()>;

    /// Upsert points. Zero-vectors must be rejected by the caller.
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Cosine ANN search with an equality filter on one payload field.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f64,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<Vec<SearchHit>>;

    /// URIs already embedded under the given discoveredBy owner.
    async fn embedded_uris(&self, user: &str) -> Result<HashSet<String>>;

    /// Retrieve stored vectors by point id. Missing ids are absent.
    async fn fetch_vectors(
        &self,
        collection: &str,
        ids: Vec<u64>,
    ) -> Result<HashMap<u64, Vec<f32>>>;

    /// Delete all points matching an equality filter.
    async fn delete_by_filter(
        &self,
        collection: &str,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<()>;

    /// Delete specific points by id.
    async fn delete_points(&self, collection: &str, ids: Vec<u64>) -> Result<()>;
}

/// REST-backed Qdrant client.
pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct RawHit {
    id: u64,
    score: f64,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScrollPoint>,
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollPoint {
    #[serde(default)]
    payload: Value,
}

impl QdrantIndex {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("tideline/0.1 (feed-generator)")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Qdrant request failed: {method} {path}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant {method} {path} returned {status}: {body}");
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to deserialize Qdrant response for {path}"))
    }

    async fn ensure_collection(&self, name: &str, payload_indexes: &[(&str, &str)]) -> Result<()> {
        // PUT is idempotent enough for our purposes: 409s mean it exists
        let result: Result<Value> = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{name}"),
                Some(json!({
                    "vectors": { "size": VECTOR_DIM, "distance": "Cosine" }
                })),
            )
            .await;
        if let Err(e) = result {
            let text = format!("{e:#}");
            if !text.contains("already exists") && !text.contains("409") {
                return Err(e);
            }
        }

        for (field, schema) in payload_indexes {
            let result: Result<Value> = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{name}/index?wait=true"),
                    Some(json!({ "field_name": field, "field_schema": schema })),
                )
                .await;
            if let Err(e) = result {
                debug!(collection = name, field, error = %e, "Payload index creation skipped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collections(&self) -> Result<()> {
        self.ensure_collection(
            POST_COLLECTION,
            &[
                ("discoveredBy", "keyword"),
                ("author", "keyword"),
                ("uri", "keyword"),
                ("indexedAt", "keyword"),
                ("likeCount", "integer"),
            ],
        )
        .await?;
        self.ensure_collection(
            PROFILE_COLLECTION,
            &[
                ("userDid", "keyword"),
                ("clusterId", "integer"),
                ("updatedAt", "keyword"),
            ],
        )
        .await
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body: Vec<Value> = points
            .into_iter()
            .map(|p| json!({ "id": p.id, "vector": p.vector, "payload": p.payload }))
            .collect();
        let _: Value = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
                Some(json!({ "points": body })),
            )
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f64,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<Vec<SearchHit>> {
        let response: ApiResponse<Vec<RawHit>> = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
                Some(json!({
                    "vector": vector,
                    "limit": limit,
                    "score_threshold": score_threshold,
                    "with_payload": true,
                    "filter": {
                        "must": [{ "key": filter_field, "match": { "value": filter_value } }]
                    }
                })),
            )
            .await?;
        Ok(response
            .result
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.id,
                score: hit.score,
                payload: hit.payload,
            })
            .collect())
    }

    async fn embedded_uris(&self, user: &str) -> Result<HashSet<String>> {
        let mut uris = HashSet::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({
                "filter": {
                    "must": [{ "key": "discoveredBy", "match": { "value": user } }]
                },
                "limit": 1000,
                "with_payload": ["uri"],
                "with_vector": false,
            });
            if let Some(ref o) = offset {
                body["offset"] = o.clone();
            }

            let response: ApiResponse<ScrollResult> = self
                .request(
                    reqwest::Method::POST,
                    &format!("/collections/{POST_COLLECTION}/points/scroll"),
                    Some(body),
                )
                .await?;

            for point in response.result.points {
                if let Some(uri) = point.payload.get("uri").and_then(|u| u.as_str()) {
                    uris.insert(uri.to_string());
                }
            }

            match response.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(uris)
    }

    async fn fetch_vectors(
        &self,
        collection: &str,
        ids: Vec<u64>,
    ) -> Result<HashMap<u64, Vec<f32>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        #[derive(Deserialize)]
        struct Retrieved {
            id: u64,
            vector: Option<Vec<f32>>,
        }
        let response: ApiResponse<Vec<Retrieved>> = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points"),
                Some(json!({ "ids": ids, "with_vector": true, "with_payload": false })),
            )
            .await?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|p| p.vector.map(|v| (p.id, v)))
            .collect())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<()> {
        let _: Value = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
                Some(json!({
                    "filter": {
                        "must": [{ "key": filter_field, "match": { "value": filter_value } }]
                    }
                })),
            )
            .await?;
        Ok(())
    }

    async fn delete_points(&self, collection: &str, ids: Vec<u64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: Value = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
                Some(json!({ "points": ids })),
            )
            .await?;
        Ok(())
    }
}

/// In-memory index for tests and vector-less local runs. Cosine similarity
/// computed naively — fine for the sizes tests use.
#[derive(Default)]
pub struct InMemoryIndex {
    collections: Mutex<HashMap<String, HashMap<u64, VectorPoint>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)) as f64
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collections(&self) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections.entry(POST_COLLECTION.to_string()).or_default();
        collections.entry(PROFILE_COLLECTION.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let map = collections.entry(collection.to_string()).or_default();
        for point in points {
            map.insert(point.id, point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f64,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<Vec<SearchHit>> {
        let collections = self.collections.lock().unwrap();
        let Some(map) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<SearchHit> = map
            .values()
            .filter(|p| {
                p.payload.get(filter_field).and_then(|v| v.as_str()) == Some(filter_value)
            })
            .map(|p| SearchHit {
                id: p.id,
                score: cosine(&p.vector, vector),
                payload: p.payload.clone(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn embedded_uris(&self, user: &str) -> Result<HashSet<String>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(POST_COLLECTION)
            .map(|map| {
                map.values()
                    .filter(|p| {
                        p.payload.get("discoveredBy").and_then(|v| v.as_str()) == Some(user)
                    })
                    .filter_map(|p| {
                        p.payload
                            .get("uri")
                            .and_then(|u| u.as_str())
                            .map(|u| u.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_vectors(
        &self,
        collection: &str,
        ids: Vec<u64>,
    ) -> Result<HashMap<u64, Vec<f32>>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|map| {
                ids.iter()
                    .filter_map(|id| map.get(id).map(|p| (*id, p.vector.clone())))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(map) = collections.get_mut(collection) {
            map.retain(|_, p| {
                p.payload.get(filter_field).and_then(|v| v.as_str()) != Some(filter_value)
            });
        }
        Ok(())
    }

    async fn delete_points(&self, collection: &str, ids: Vec<u64>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(map) = collections.get_mut(collection) {
            for id in ids {
                map.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_deterministic_and_user_scoped() {
        let a = point_id("did:plc:u", "at://a/p/1");
        let b = point_id("did:plc:u", "at://a/p/1");
        let c = point_id("did:plc:v", "at://a/p/1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_in_memory_search_respects_filter_and_threshold() {
        let index = InMemoryIndex::new();
        index.ensure_collections().await.unwrap();

        let mut v1 = vec![0.0f32; VECTOR_DIM];
        v1[0] = 1.0;
        let mut v2 = vec![0.0f32; VECTOR_DIM];
        v2[1] = 1.0;

        index
            .upsert(
                POST_COLLECTION,
                vec![
                    VectorPoint {
                        id: 1,
                        vector: v1.clone(),
                        payload: json!({"uri": "at://a/p/1", "discoveredBy": "did:plc:u"}),
                    },
                    VectorPoint {
                        id: 2,
                        vector: v2,
                        payload: json!({"uri": "at://a/p/2", "discoveredBy": "did:plc:u"}),
                    },
                    VectorPoint {
                        id: 3,
                        vector: v1.clone(),
                        payload: json!({"uri": "at://a/p/3", "discoveredBy": "did:plc:other"}),
                    },
                ],
            )
            .await
            .unwrap();

        let hits = index
            .search(POST_COLLECTION, &v1, 10, 0.25, "discoveredBy", "did:plc:u")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].payload.get("uri").and_then(|u| u.as_str()),
            Some("at://a/p/1")
        );
    }

    #[tokio::test]
    async fn test_in_memory_embedded_uris() {
        let index = InMemoryIndex::new();
        index.ensure_collections().await.unwrap();
        index
            .upsert(
                POST_COLLECTION,
                vec![VectorPoint {
                    id: point_id("did:plc:u", "at://a/p/1"),
                    vector: vec![1.0; VECTOR_DIM],
                    payload: json!({"uri": "at://a/p/1", "discoveredBy": "did:plc:u"}),
                }],
            )
            .await
            .unwrap();
        let uris = index.embedded_uris("did:plc:u").await.unwrap();
        assert!(uris.contains("at://a/p/1"));
        assert!(index.embedded_uris("did:plc:v").await.unwrap().is_empty());
    }
}
