// XRPC surface tests: feed skeleton authorization, the unsupported-feed
// error, and interaction ingest, driven through the router with oneshot
// requests and a fixed-identity authenticator.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, SecondsFormat, Utc};
use tokio::sync::mpsc;
use tower::ServiceExt;

use tideline::appview::AppViewClient;
use tideline::config::Config;
use tideline::db::models::{IngestBatch, NewPost};
use tideline::db::{self, Database};
use tideline::graph::GraphService;
use tideline::ranking::RankingEngine;
use tideline::serve::ServeEngine;
use tideline::server::auth::StaticAuth;
use tideline::server::{build_router, AppState, FEED_RKEY};
use tideline::taste::PostLikerSource;

const USER: &str = "did:plc:me";
const OUTSIDER: &str = "did:plc:outsider";

struct NoLikers;

#[async_trait]
impl PostLikerSource for NoLikers {
    async fn post_likers(&self, _uri: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

fn test_config() -> Config {
    Config {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        jetstream_url: "wss://example.invalid/subscribe".to_string(),
        reconnect_delay_secs: 1,
        db_path: ":memory:".to_string(),
        publisher_did: "did:plc:publisher".to_string(),
        service_did: "did:web:feed.example.com".to_string(),
        service_hostname: "feed.example.com".to_string(),
        whitelist: [USER.to_string()].into_iter().collect(),
        qdrant_url: "http://127.0.0.1:1".to_string(),
        appview_url: "http://127.0.0.1:1".to_string(),
        embedder_command: String::new(),
        embedder_model_path: String::new(),
        clusterer_command: String::new(),
        extractor_command: String::new(),
        restricted_keywords: HashSet::new(),
    }
}

fn feed_uri() -> String {
    format!("at://did:plc:publisher/app.bsky.feed.generator/{FEED_RKEY}")
}

struct Harness {
    store: Arc<dyn Database>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: db::open_in_memory().unwrap(),
        }
    }

    fn router(&self, requester: &str) -> Router {
        let appview = Arc::new(AppViewClient::new("http://127.0.0.1:1").unwrap());
        let graph = Arc::new(GraphService::new(self.store.clone(), appview));
        let ranking = Arc::new(RankingEngine::new(self.store.clone(), graph));
        let (tx, _rx) = mpsc::channel(4);
        let serve = Arc::new(ServeEngine::new(self.store.clone(), ranking, tx));

        let state = AppState {
            db: self.store.clone(),
            config: Arc::new(test_config()),
            serve,
            likers: Arc::new(NoLikers),
            auth: Arc::new(StaticAuth(requester.to_string())),
        };
        build_router(state)
    }

    async fn seed_followed_posts(&self) {
        let now = Utc::now();
        self.store
            .insert_follows(
                &[(USER.to_string(), "did:plc:friend".to_string())],
                &now.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .await
            .unwrap();
        let posts = (0..3)
            .map(|i| NewPost {
                uri: format!("at://f/p/{i}"),
                cid: "cid".to_string(),
                author: "did:plc:friend".to_string(),
                indexed_at: (now - Duration::hours(2 + i))
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                reply_root: None,
                reply_parent: None,
                text: Some(format!("hello from post {i}")),
                has_image: false,
                has_video: false,
                has_external: false,
            })
            .collect();
        self.store
            .flush_ingest(&IngestBatch {
                posts,
                ..Default::default()
            })
            .await
            .unwrap();
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn skeleton_serves_whitelisted_requester() {
    let h = Harness::new();
    h.seed_followed_posts().await;
    let app = h.router(USER);

    let uri = format!(
        "/xrpc/app.bsky.feed.getFeedSkeleton?feed={}&limit=10",
        urlencode(&feed_uri())
    );
    let response = app
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let feed = body["feed"].as_array().unwrap();
    assert!(!feed.is_empty());
    assert!(feed[0]["post"].as_str().unwrap().starts_with("at://"));
}

#[tokio::test]
async fn skeleton_rejects_outsider() {
    let h = Harness::new();
    let app = h.router(OUTSIDER);

    let uri = format!(
        "/xrpc/app.bsky.feed.getFeedSkeleton?feed={}",
        urlencode(&feed_uri())
    );
    let response = app
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "AccountRestricted");
}

#[tokio::test]
async fn skeleton_rejects_unknown_feed() {
    let h = Harness::new();
    let app = h.router(USER);

    let other = "at://did:plc:publisher/app.bsky.feed.generator/other";
    let uri = format!(
        "/xrpc/app.bsky.feed.getFeedSkeleton?feed={}",
        urlencode(other)
    );
    let response = app
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "UnknownFeed");
}

#[tokio::test]
async fn interaction_seen_lands_in_seen_log() {
    let h = Harness::new();
    h.seed_followed_posts().await;
    let app = h.router(USER);

    let body = serde_json::json!({
        "interactions": [
            { "event": "app.bsky.feed.defs#interactionSeen", "item": "at://f/p/0" },
            { "event": "app.bsky.feed.defs#clickthroughItem", "item": "at://f/p/1" },
        ]
    });
    let response = app
        .oneshot(
            Request::post("/xrpc/app.bsky.feed.sendInteractions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let since = (Utc::now() - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Millis, true);
    let counts = h.store.get_seen_counts(USER, &since).await.unwrap();
    assert_eq!(counts.get("at://f/p/0"), Some(&1));
    // The clickthrough was logged and ignored
    assert_eq!(counts.get("at://f/p/1"), None);
}

#[tokio::test]
async fn request_less_adjusts_author_fatigue() {
    let h = Harness::new();
    h.seed_followed_posts().await;
    let app = h.router(USER);

    let body = serde_json::json!({
        "interactions": [
            { "event": "app.bsky.feed.defs#requestLess", "item": "at://f/p/0" },
        ]
    });
    let response = app
        .oneshot(
            Request::post("/xrpc/app.bsky.feed.sendInteractions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let fatigue = h
        .store
        .get_author_fatigue(USER, "did:plc:friend")
        .await
        .unwrap()
        .expect("feedback should create a fatigue row");
    assert!(fatigue.fatigue_score >= 60.0 - 1e-9);
}

#[tokio::test]
async fn health_and_identity_endpoints() {
    let h = Harness::new();
    let app = h.router(USER);

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::get("/.well-known/did.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["id"], "did:web:feed.example.com");

    let response = app
        .oneshot(
            Request::get("/xrpc/app.bsky.feed.describeFeedGenerator")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["feeds"][0]["uri"], feed_uri());
}

/// Percent-encode the few characters at:// URIs put in query strings.
fn urlencode(raw: &str) -> String {
    raw.replace(':', "%3A").replace('/', "%2F")
}
