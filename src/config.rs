// Central configuration loaded from environment variables.
//
// All deployment-specific values come from env vars (never hardcoded).
// The .env file is loaded automatically at startup via dotenvy.

use std::collections::HashSet;
use std::env;

use anyhow::Result;

pub struct Config {
    /// Host the HTTP server binds to.
    pub listen_host: String,
    /// Port the HTTP server binds to.
    pub listen_port: u16,
    /// Jetstream WebSocket endpoint for the firehose subscription.
    pub jetstream_url: String,
    /// Seconds to wait before re-establishing a dropped subscription.
    pub reconnect_delay_secs: u64,
    /// SQLite database path.
    pub db_path: String,
    /// DID that publishes the feed records.
    pub publisher_did: String,
    /// DID of this feed generator service.
    pub service_did: String,
    /// Hostname used in the DID document's service endpoint.
    pub service_hostname: String,
    /// Users the system serves feeds for (comma-separated DIDs).
    pub whitelist: HashSet<String>,
    /// Qdrant REST endpoint for the vector index.
    pub qdrant_url: String,
    /// Public AppView endpoint for XRPC reads.
    pub appview_url: String,
    /// Command to run the embedding model CLI.
    pub embedder_command: String,
    /// Path to the embedding model weights, passed through to the CLI.
    pub embedder_model_path: String,
    /// Command to run the clustering CLI.
    pub clusterer_command: String,
    /// Command to run the keyword extractor CLI.
    pub extractor_command: String,
    /// Keywords excluded from explicit-feedback adjustment.
    pub restricted_keywords: HashSet<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Most values have workable defaults — the whitelist and publisher DID
    /// are required for anything beyond `init` and `status`.
    pub fn load() -> Result<Self> {
        let listen_port = env::var("TIDELINE_PORT")
            .unwrap_or_else(|_| "3020".to_string())
            .parse()
            .unwrap_or(3020);
        let reconnect_delay_secs = env::var("JETSTREAM_RECONNECT_DELAY_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Ok(Self {
            listen_host: env::var("TIDELINE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            listen_port,
            jetstream_url: env::var("JETSTREAM_URL")
                .unwrap_or_else(|_| "wss://jetstream2.us-east.bsky.network/subscribe".to_string()),
            reconnect_delay_secs,
            db_path: env::var("TIDELINE_DB_PATH").unwrap_or_else(|_| "./tideline.db".to_string()),
            publisher_did: env::var("PUBLISHER_DID").unwrap_or_default(),
            service_did: env::var("SERVICE_DID").unwrap_or_default(),
            service_hostname: env::var("SERVICE_HOSTNAME").unwrap_or_default(),
            whitelist: csv_set(&env::var("FEED_WHITELIST").unwrap_or_default()),
            qdrant_url: env::var("QDRANT_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            appview_url: env::var("APPVIEW_URL")
                .unwrap_or_else(|_| "https://public.api.bsky.app".to_string()),
            embedder_command: env::var("EMBEDDER_COMMAND").unwrap_or_default(),
            embedder_model_path: env::var("EMBEDDER_MODEL_PATH").unwrap_or_default(),
            clusterer_command: env::var("CLUSTERER_COMMAND").unwrap_or_default(),
            extractor_command: env::var("EXTRACTOR_COMMAND").unwrap_or_default(),
            restricted_keywords: csv_set(
                &env::var("RESTRICTED_KEYWORDS").unwrap_or_default(),
            ),
        })
    }

    /// Check that the serving identity is configured.
    /// Call this before starting the server or the ingester.
    pub fn require_identity(&self) -> Result<()> {
        if self.publisher_did.is_empty() {
            anyhow::bail!("PUBLISHER_DID not set. Add it to your .env file.");
        }
        if self.service_did.is_empty() {
            anyhow::bail!("SERVICE_DID not set. Add it to your .env file.");
        }
        if self.whitelist.is_empty() {
            anyhow::bail!(
                "FEED_WHITELIST not set. Add a comma-separated DID list to your .env file."
            );
        }
        Ok(())
    }

    /// Check that the external model CLIs are configured.
    /// Call this before running the semantic batch or keyword jobs.
    pub fn require_pipelines(&self) -> Result<()> {
        if self.embedder_command.is_empty() {
            anyhow::bail!("EMBEDDER_COMMAND not set. Add it to your .env file.");
        }
        if self.clusterer_command.is_empty() {
            anyhow::bail!("CLUSTERER_COMMAND not set. Add it to your .env file.");
        }
        Ok(())
    }
}

fn csv_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
