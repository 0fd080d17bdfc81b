// XRPC handlers — feed skeleton, interaction ingest, service identity.
//
// Error policy per the protocol: unknown feeds answer UnknownFeed, callers
// outside the whitelist answer AccountRestricted, and nothing in here ever
// leaks an internal error body to the client.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::server::AppState;
use crate::taste::fatigue;
use crate::taste::feedback::{self, FeedbackAction, FeedbackStrength};

/// XRPC error body with the protocol's error name.
fn xrpc_error(status: StatusCode, name: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": name, "message": message })),
    )
        .into_response()
}

// --- Service identity ---

/// GET /.well-known/did.json — the feed generator's DID document.
pub async fn did_document(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": state.config.service_did,
        "service": [{
            "id": "#bsky_fg",
            "type": "BskyFeedGenerator",
            "serviceEndpoint": format!("https://{}", state.config.service_hostname),
        }]
    }))
}

/// GET /xrpc/app.bsky.feed.describeFeedGenerator
pub async fn describe_feed_generator(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "did": state.config.service_did,
        "feeds": [{ "uri": state.feed_uri() }],
    }))
}

// --- Feed skeleton ---

#[derive(Debug, Deserialize)]
pub struct SkeletonParams {
    pub feed: String,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// GET /xrpc/app.bsky.feed.getFeedSkeleton
pub async fn get_feed_skeleton(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SkeletonParams>,
) -> Response {
    if params.feed != state.feed_uri() {
        return xrpc_error(
            StatusCode::BAD_REQUEST,
            "UnknownFeed",
            "Unsupported algorithm",
        );
    }

    let requester = match state.auth.requester_did(&headers) {
        Ok(did) => did,
        Err(e) => {
            warn!(error = %e, "Unauthenticated feed request");
            return xrpc_error(
                StatusCode::UNAUTHORIZED,
                "AuthMissing",
                "Request is not authenticated",
            );
        }
    };

    if !state.config.whitelist.contains(&requester) {
        return xrpc_error(
            StatusCode::FORBIDDEN,
            "AccountRestricted",
            "This feed is not available for your account",
        );
    }

    let limit = params.limit.unwrap_or(50);
    match state.serve.serve(&requester, limit, params.cursor).await {
        Ok(page) => {
            let feed: Vec<serde_json::Value> = page
                .feed
                .into_iter()
                .map(|item| match item.repost_uri {
                    Some(repost) => json!({
                        "post": item.post,
                        "reason": {
                            "$type": "app.bsky.feed.defs#skeletonReasonRepost",
                            "repost": repost,
                        }
                    }),
                    None => json!({ "post": item.post }),
                })
                .collect();
            let mut body = json!({ "feed": feed });
            if let Some(cursor) = page.cursor {
                body["cursor"] = json!(cursor);
            }
            Json(body).into_response()
        }
        Err(e) => {
            error!(requester, error = %e, "Feed request failed");
            xrpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                "Feed generation failed",
            )
        }
    }
}

// --- Interaction ingest ---

#[derive(Debug, Deserialize)]
pub struct InteractionsBody {
    #[serde(default)]
    pub interactions: Vec<InteractionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct InteractionEntry {
    pub event: String,
    pub item: String,
}

/// POST /xrpc/app.bsky.feed.sendInteractions
pub async fn send_interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InteractionsBody>,
) -> Response {
    let requester = match state.auth.requester_did(&headers) {
        Ok(did) => did,
        Err(e) => {
            warn!(error = %e, "Unauthenticated interaction ingest");
            return xrpc_error(
                StatusCode::UNAUTHORIZED,
                "AuthMissing",
                "Request is not authenticated",
            );
        }
    };
    if !state.config.whitelist.contains(&requester) {
        return xrpc_error(
            StatusCode::FORBIDDEN,
            "AccountRestricted",
            "This feed is not available for your account",
        );
    }

    for entry in &body.interactions {
        if let Err(e) = handle_interaction(&state, &requester, entry).await {
            warn!(
                requester,
                event = entry.event,
                error = %e,
                "Interaction entry failed"
            );
        }
    }

    Json(json!({})).into_response()
}

/// The lexicon-qualified event name's local part.
fn event_name(event: &str) -> &str {
    event.rsplit('#').next().unwrap_or(event)
}

async fn handle_interaction(
    state: &AppState,
    user: &str,
    entry: &InteractionEntry,
) -> anyhow::Result<()> {
    let uri = &entry.item;
    match event_name(&entry.event) {
        "interactionSeen" => {
            let now = chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            state.db.record_seen(user, uri, &now).await?;
            if let Some(post) = state.db.get_post(uri).await? {
                fatigue::record_seen_decay(&state.db, user, &post.author).await?;
            }
            Ok(())
        }
        "requestMore" => {
            feedback::apply_feedback(
                &state.db,
                &state.likers,
                &state.config.restricted_keywords,
                user,
                uri,
                FeedbackAction::More,
                FeedbackStrength::Strong,
            )
            .await
        }
        "interactionLike" => {
            feedback::apply_feedback(
                &state.db,
                &state.likers,
                &state.config.restricted_keywords,
                user,
                uri,
                FeedbackAction::More,
                FeedbackStrength::Weak,
            )
            .await
        }
        "requestLess" => {
            feedback::apply_feedback(
                &state.db,
                &state.likers,
                &state.config.restricted_keywords,
                user,
                uri,
                FeedbackAction::Less,
                FeedbackStrength::Strong,
            )
            .await
        }
        "interactionDislike" => {
            feedback::apply_feedback(
                &state.db,
                &state.likers,
                &state.config.restricted_keywords,
                user,
                uri,
                FeedbackAction::Less,
                FeedbackStrength::Weak,
            )
            .await
        }
        other => {
            // Shares, clickthroughs, and anything the lexicon grows later
            info!(user, event = other, "Interaction event logged and ignored");
            Ok(())
        }
    }
}
