// Public AT Protocol client — unauthenticated XRPC over HTTP.
//
// All AT Protocol read endpoints are public and don't require
// authentication. This client covers the external lookups the pipeline
// needs: follow lists, post likers, post hydration, and profile stats.
// Every call carries a timeout; callers degrade failures to empty results
// rather than surfacing them to a feed request.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Default public API endpoint for AT Protocol read operations.
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";

/// Per-call timeout for external lookups.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Page size for paginated list endpoints.
const PAGE_LIMIT: usize = 100;

/// Chunk size for the multi-URI / multi-actor hydration endpoints.
pub const HYDRATE_CHUNK: usize = 25;

/// Unauthenticated HTTP client for public AT Protocol XRPC endpoints.
pub struct AppViewClient {
    client: reqwest::Client,
    base_url: String,
}

impl AppViewClient {
    /// Create a new client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("tideline/0.1 (feed-generator)")
            .timeout(CALL_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Make a GET request to an XRPC endpoint and deserialize the response.
    ///
    /// `nsid` is the XRPC method name (e.g. "app.bsky.graph.getFollows").
    /// `params` are query string key-value pairs. Use repeated keys for
    /// array parameters.
    pub async fn xrpc_get<T: DeserializeOwned>(
        &self,
        nsid: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}/xrpc/{}", self.base_url, nsid);

        debug!(nsid = nsid, "XRPC GET request");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("XRPC request failed: {nsid}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("XRPC {nsid} returned {status}: {body}");
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to deserialize {nsid} response"))
    }

    /// Resolve a handle to its DID via the public API.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let resp: ResolveHandleResponse = self
            .xrpc_get(
                "com.atproto.identity.resolveHandle",
                &[("handle", handle)],
            )
            .await
            .with_context(|| format!("Failed to resolve handle @{handle}"))?;
        Ok(resp.did)
    }

    /// Fetch every account the given DID follows, paginating through
    /// `app.bsky.graph.getFollows` until the cursor runs dry or `max` is hit.
    pub async fn get_follows(&self, did: &str, max: usize) -> Result<Vec<String>> {
        let mut follows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let limit = PAGE_LIMIT.to_string();
            let mut params: Vec<(&str, &str)> =
                vec![("actor", did), ("limit", limit.as_str())];
            if let Some(ref c) = cursor {
                params.push(("cursor", c.as_str()));
            }

            let page: FollowsResponse = self.xrpc_get("app.bsky.graph.getFollows", &params).await?;
            for profile in page.follows {
                follows.push(profile.did);
                if follows.len() >= max {
                    return Ok(follows);
                }
            }

            match page.cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(follows)
    }

    /// Actors who liked the given post, up to `limit`.
    /// Failures are tolerated at the call site — this returns the error.
    pub async fn get_post_likers(&self, uri: &str, limit: usize) -> Result<Vec<String>> {
        let mut likers = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page_limit = PAGE_LIMIT.min(limit - likers.len()).to_string();
            let mut params: Vec<(&str, &str)> =
                vec![("uri", uri), ("limit", page_limit.as_str())];
            if let Some(ref c) = cursor {
                params.push(("cursor", c.as_str()));
            }

            let page: LikesResponse = self.xrpc_get("app.bsky.feed.getLikes", &params).await?;
            for like in page.likes {
                likers.push(like.actor.did);
                if likers.len() >= limit {
                    return Ok(likers);
                }
            }

            match page.cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(likers)
    }

    /// Hydrate full post views (for image URLs and alt text), chunked at 25.
    /// Chunks that fail are logged and skipped.
    pub async fn get_post_views(&self, uris: &[String]) -> Vec<PostView> {
        let mut views = Vec::new();
        for chunk in uris.chunks(HYDRATE_CHUNK) {
            let params: Vec<(&str, &str)> =
                chunk.iter().map(|u| ("uris", u.as_str())).collect();
            match self
                .xrpc_get::<PostsResponse>("app.bsky.feed.getPosts", &params)
                .await
            {
                Ok(page) => views.extend(page.posts),
                Err(e) => {
                    warn!(error = %e, chunk = chunk.len(), "Post hydration chunk failed");
                }
            }
        }
        views
    }

    /// Follower counts per DID, chunked at 25. Missing profiles are absent.
    pub async fn get_follower_counts(
        &self,
        dids: &[String],
    ) -> std::collections::HashMap<String, i64> {
        let mut counts = std::collections::HashMap::new();
        for chunk in dids.chunks(HYDRATE_CHUNK) {
            let params: Vec<(&str, &str)> =
                chunk.iter().map(|d| ("actors", d.as_str())).collect();
            match self
                .xrpc_get::<ProfilesResponse>("app.bsky.actor.getProfiles", &params)
                .await
            {
                Ok(page) => {
                    for profile in page.profiles {
                        counts.insert(profile.did, profile.followers_count.unwrap_or(0));
                    }
                }
                Err(e) => {
                    warn!(error = %e, chunk = chunk.len(), "Profile chunk failed");
                }
            }
        }
        counts
    }
}

// -- Serde types --

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Deserialize)]
struct FollowsResponse {
    follows: Vec<ProfileRef>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ProfileRef {
    did: String,
}

#[derive(Deserialize)]
struct LikesResponse {
    likes: Vec<LikeEntry>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct LikeEntry {
    actor: ProfileRef,
}

#[derive(Deserialize)]
struct PostsResponse {
    posts: Vec<PostView>,
}

/// A hydrated post view — just the fields the embedder cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct PostView {
    pub uri: String,
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
}

impl PostView {
    /// Image URLs and alt texts from the embed view, if any.
    pub fn image_refs(&self, max: usize) -> (Vec<String>, Vec<String>) {
        let mut urls = Vec::new();
        let mut alts = Vec::new();
        let Some(embed) = &self.embed else {
            return (urls, alts);
        };

        // embed#view images live either at .images or .media.images
        let images = embed
            .get("images")
            .or_else(|| embed.get("media").and_then(|m| m.get("images")))
            .and_then(|v| v.as_array());
        if let Some(images) = images {
            for image in images.iter().take(max) {
                if let Some(url) = image.get("fullsize").and_then(|u| u.as_str()) {
                    urls.push(url.to_string());
                }
                if let Some(alt) = image.get("alt").and_then(|a| a.as_str()) {
                    if !alt.is_empty() {
                        alts.push(alt.to_string());
                    }
                }
            }
        }
        (urls, alts)
    }
}

#[derive(Deserialize)]
struct ProfilesResponse {
    profiles: Vec<ProfileStats>,
}

#[derive(Deserialize)]
struct ProfileStats {
    did: String,
    #[serde(rename = "followersCount")]
    followers_count: Option<i64>,
}
