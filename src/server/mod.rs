// Web server — Axum-based XRPC surface for the feed generator.
//
// Routes: the feed skeleton and interaction-ingest XRPC endpoints, the
// describeFeedGenerator listing, the DID document, and a health check.
// Everything hangs off a shared AppState; handlers never panic outward.

use std::sync::Arc;

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::serve::ServeEngine;
use crate::taste::PostLikerSource;

pub mod auth;
pub mod handlers;

use auth::RequesterAuth;

/// Record key of the published feed.
pub const FEED_RKEY: &str = "tideline";

/// Shared application state threaded through all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub config: Arc<Config>,
    pub serve: Arc<ServeEngine>,
    pub likers: Arc<dyn PostLikerSource>,
    pub auth: Arc<dyn RequesterAuth>,
}

impl AppState {
    /// The at:// URI of the published feed record.
    pub fn feed_uri(&self) -> String {
        format!(
            "at://{}/app.bsky.feed.generator/{}",
            self.config.publisher_did, FEED_RKEY
        )
    }
}

/// Start the Axum web server and block until it exits.
pub async fn run_server(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);

    let addr = format!("{bind}:{port}");
    info!("Feed generator listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/did.json", get(handlers::did_document))
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(handlers::describe_feed_generator),
        )
        .route(
            "/xrpc/app.bsky.feed.getFeedSkeleton",
            get(handlers::get_feed_skeleton),
        )
        .route(
            "/xrpc/app.bsky.feed.sendInteractions",
            post(handlers::send_interactions),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Deployment health check — always 200 OK.
async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok" })),
    )
}
