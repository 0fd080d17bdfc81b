// Firehose ingester — consumes the jetstream WebSocket and batches writes.
//
// Two tasks share one PendingBatch behind a mutex: the consumer reads the
// socket and classifies events; a timer drains and flushes every 5 seconds.
// Only the flush path writes to the store, one transaction per flush. The
// cursor (largest time_us seen) is persisted after the transaction commits,
// so a crash replays events and uniqueness constraints absorb the rows.
//
// On upstream close the connection is re-established after a configured
// delay, resuming from the stored cursor. Flush failures re-queue the
// drained batch instead of dropping it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::db::models::{InteractionEdge, InteractionKind, NewPost};
use crate::db::Database;
use crate::firehose::batch::PendingBatch;
use crate::firehose::event::{
    parse_message, StreamEvent, LIKE_COLLECTION, POST_COLLECTION, REPOST_COLLECTION,
};
use crate::taste::TasteEngine;
use crate::tracking::Tracker;

/// Meta-state key holding the microsecond cursor.
pub const CURSOR_KEY: &str = "firehose_cursor";

/// Interval between batch flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct Ingester {
    db: Arc<dyn Database>,
    tracker: Arc<Tracker>,
    taste: Arc<TasteEngine>,
    jetstream_url: String,
    reconnect_delay: Duration,
    pending: Arc<Mutex<PendingBatch>>,
}

impl Ingester {
    pub fn new(
        db: Arc<dyn Database>,
        tracker: Arc<Tracker>,
        taste: Arc<TasteEngine>,
        jetstream_url: &str,
        reconnect_delay_secs: u64,
    ) -> Self {
        Self {
            db,
            tracker,
            taste,
            jetstream_url: jetstream_url.to_string(),
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            pending: Arc::new(Mutex::new(PendingBatch::new())),
        }
    }

    /// Run until the shutdown signal flips. The final flush runs before
    /// returning so a graceful stop loses nothing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let flush_handle = {
            let db = self.db.clone();
            let pending = self.pending.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            flush_pending(&db, &pending).await;
                        }
                        _ = shutdown.changed() => {
                            // Final flush on graceful shutdown
                            flush_pending(&db, &pending).await;
                            break;
                        }
                    }
                }
            })
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume_once(&mut shutdown).await {
                Ok(true) => break, // shutdown requested
                Ok(false) => {
                    info!(
                        delay_secs = self.reconnect_delay.as_secs(),
                        "Upstream closed, reconnecting"
                    );
                }
                Err(e) => {
                    warn!(error = %e, delay_secs = self.reconnect_delay.as_secs(),
                          "Subscription error, reconnecting");
                }
            }

            // Flush whatever is in flight before the gap widens
            flush_pending(&self.db, &self.pending).await;

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        let _ = flush_handle.await;
        Ok(())
    }

    /// Build the subscription URL: collection filters plus the stored cursor.
    async fn subscribe_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.jetstream_url)
            .with_context(|| format!("Bad jetstream URL: {}", self.jetstream_url))?;
        let cursor = self.db.get_meta(CURSOR_KEY).await?;
        {
            let mut query = url.query_pairs_mut();
            for collection in [POST_COLLECTION, LIKE_COLLECTION, REPOST_COLLECTION] {
                query.append_pair("wantedCollections", collection);
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor);
            }
        }
        Ok(url.to_string())
    }

    /// One connection lifetime. Returns Ok(true) if shutdown was requested,
    /// Ok(false) if the upstream closed.
    async fn consume_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let url = self.subscribe_url().await?;
        info!(url = %self.jetstream_url, "Connecting to jetstream");

        let (stream, _) = connect_async(url.as_str())
            .await
            .context("Jetstream connection failed")?;
        let (mut write, mut read) = stream.split();

        // The tracked-DID list is too large for the URL — push it through
        // the post-connect options update instead.
        let wanted_dids = self.tracker.interaction_dids().await;
        let options = serde_json::json!({
            "type": "options_update",
            "payload": {
                "wantedCollections": [POST_COLLECTION, LIKE_COLLECTION, REPOST_COLLECTION],
                "wantedDids": wanted_dids,
                "maxMessageSizeBytes": 0,
            }
        });
        write
            .send(Message::Text(options.to_string()))
            .await
            .context("Failed to send options update")?;
        debug!(dids = options["payload"]["wantedDids"].as_array().map(|a| a.len()), "Options update sent");

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(true),
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_message(&text) {
                                self.handle_event(event).await;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(false),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(anyhow::anyhow!(e)).context("Jetstream read error");
                        }
                    }
                }
            }
        }
    }

    /// Classify one event into pending mutations and synchronous engine
    /// calls. Public so tests can drive the ingester without a socket.
    pub async fn handle_event(&self, event: StreamEvent) {
        let time_us = event.time_us();
        let indexed_at = micros_to_rfc3339(time_us);

        match event {
            StreamEvent::CreatePost {
                uri,
                cid,
                author,
                text,
                has_image,
                has_video,
                has_external,
                ..
            } => {
                let mut pending = self.pending.lock().await;
                pending.push_post(NewPost {
                    uri,
                    cid,
                    author,
                    indexed_at,
                    reply_root: None,
                    reply_parent: None,
                    text: non_empty(text),
                    has_image,
                    has_video,
                    has_external,
                });
                pending.observe_time(time_us);
            }

            StreamEvent::CreateReply {
                uri,
                cid,
                author,
                text,
                root,
                parent,
                has_image,
                has_video,
                has_external,
                ..
            } => {
                let tracked = self.tracker.is_interaction(&author).await;
                let mut pending = self.pending.lock().await;
                pending.push_post(NewPost {
                    uri: uri.clone(),
                    cid,
                    author: author.clone(),
                    indexed_at: indexed_at.clone(),
                    reply_root: Some(root),
                    reply_parent: Some(parent.clone()),
                    text: non_empty(text),
                    has_image,
                    has_video,
                    has_external,
                });
                pending.bump_replies(&parent, 1);
                if tracked {
                    pending.push_interaction(InteractionEdge {
                        actor: author,
                        target: parent,
                        kind: InteractionKind::Reply,
                        weight: InteractionKind::Reply.weight(),
                        indexed_at,
                        interaction_uri: Some(uri),
                    });
                }
                pending.observe_time(time_us);
            }

            StreamEvent::DeletePost { uri, .. } => {
                let mut pending = self.pending.lock().await;
                pending.push_delete(uri);
                pending.observe_time(time_us);
            }

            StreamEvent::CreateLike {
                uri,
                actor,
                subject,
                ..
            } => {
                self.handle_engagement(
                    time_us,
                    indexed_at,
                    uri,
                    actor,
                    subject,
                    InteractionKind::Like,
                )
                .await;
            }

            StreamEvent::CreateRepost {
                uri,
                actor,
                subject,
                ..
            } => {
                self.handle_engagement(
                    time_us,
                    indexed_at,
                    uri,
                    actor,
                    subject,
                    InteractionKind::Repost,
                )
                .await;
            }

            StreamEvent::Ignored { .. } => {
                let mut pending = self.pending.lock().await;
                pending.observe_time(time_us);
            }
        }
    }

    async fn handle_engagement(
        &self,
        time_us: u64,
        indexed_at: String,
        interaction_uri: String,
        actor: String,
        subject: String,
        kind: InteractionKind,
    ) {
        let tracked_interaction = self.tracker.is_interaction(&actor).await;
        let tracked_own = self.tracker.is_own(&actor).await;

        {
            let mut pending = self.pending.lock().await;
            match kind {
                InteractionKind::Like => pending.bump_likes(&subject, 1),
                InteractionKind::Repost => pending.bump_reposts(&subject, 1),
                InteractionKind::Reply => pending.bump_replies(&subject, 1),
            }
            if tracked_interaction {
                pending.push_interaction(InteractionEdge {
                    actor: actor.clone(),
                    target: subject.clone(),
                    kind,
                    weight: kind.weight(),
                    indexed_at,
                    interaction_uri: Some(interaction_uri),
                });
            }
            pending.observe_time(time_us);
        }

        // Taste and author-fatigue engines run inline, but only for the much
        // smaller whitelist of users we serve feeds for.
        if tracked_own {
            if let Err(e) = self.taste.on_engagement(&actor, &subject, kind).await {
                warn!(actor, error = %e, "Taste engine update failed");
            }
        }
    }

    /// Drain and flush immediately, as the timer task would.
    pub async fn flush_now(&self) {
        flush_pending(&self.db, &self.pending).await;
    }
}

/// Drain and flush the pending batch; restore it on failure.
async fn flush_pending(db: &Arc<dyn Database>, pending: &Arc<Mutex<PendingBatch>>) {
    let (batch, cursor) = {
        let mut guard = pending.lock().await;
        if guard.is_empty() && guard.max_time_us().is_none() {
            return;
        }
        guard.drain()
    };

    match db.flush_ingest(&batch).await {
        Ok(()) => {
            if let Some(cursor) = cursor {
                if let Err(e) = db.set_meta(CURSOR_KEY, &cursor.to_string()).await {
                    error!(error = %e, "Cursor persist failed");
                }
            }
            debug!(
                posts = batch.posts.len(),
                deletes = batch.deletes.len(),
                counters = batch.counters.len(),
                interactions = batch.interactions.len(),
                "Flush committed"
            );
        }
        Err(e) => {
            error!(error = %e, "Flush failed, re-queueing batch");
            let mut guard = pending.lock().await;
            guard.restore(batch, cursor);
        }
    }
}

/// Convert a jetstream microsecond timestamp to an RFC 3339 string.
pub fn micros_to_rfc3339(time_us: u64) -> String {
    Utc.timestamp_micros(time_us as i64)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
