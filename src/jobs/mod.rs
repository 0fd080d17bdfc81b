// Background jobs — timers, single-flight guards, and the batch trigger.
//
// One JobRunner owns every periodic task: tracked-set refresh, graph
// rebuilds, keyword refreshes, the semantic batch schedule, and garbage
// collection. Each loop is guarded so at most one instance runs per
// process; the semantic pipeline adds its own cooldown on top. The serve
// path's regenerate trigger arrives over a channel and runs with priority.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::Database;
use crate::graph::GraphService;
use crate::keywords::KeywordEngine;
use crate::semantic::SemanticPipeline;
use crate::serve::BatchTrigger;
use crate::tracking::Tracker;

/// Tracked-DID refresh period.
const TRACKED_REFRESH: StdDuration = StdDuration::from_secs(15 * 60);

/// How often the graph job re-checks its per-user 24 h gates.
const GRAPH_SWEEP: StdDuration = StdDuration::from_secs(60 * 60);

/// How often the keyword job re-checks its per-user daily gates.
const KEYWORD_SWEEP: StdDuration = StdDuration::from_secs(6 * 60 * 60);

/// Scheduled semantic batch period.
const SEMANTIC_PERIOD: StdDuration = StdDuration::from_secs(90 * 60);

/// GC period.
const GC_PERIOD: StdDuration = StdDuration::from_secs(60 * 60);

/// Served-log retention.
const SERVED_RETENTION_HOURS: i64 = 6;

/// Seen-log retention.
const SEEN_RETENTION_HOURS: i64 = 8;

/// Post retention for unengaged strangers.
const POST_RETENTION_DAYS: i64 = 7;

pub struct JobRunner {
    db: Arc<dyn Database>,
    tracker: Arc<Tracker>,
    graph: Arc<GraphService>,
    keywords: Arc<KeywordEngine>,
    semantic: Arc<SemanticPipeline>,
    graph_running: AtomicBool,
    keyword_running: AtomicBool,
    gc_running: AtomicBool,
}

impl JobRunner {
    pub fn new(
        db: Arc<dyn Database>,
        tracker: Arc<Tracker>,
        graph: Arc<GraphService>,
        keywords: Arc<KeywordEngine>,
        semantic: Arc<SemanticPipeline>,
    ) -> Self {
        Self {
            db,
            tracker,
            graph,
            keywords,
            semantic,
            graph_running: AtomicBool::new(false),
            keyword_running: AtomicBool::new(false),
            gc_running: AtomicBool::new(false),
        }
    }

    /// Spawn every background loop. The returned handles finish when the
    /// shutdown signal flips.
    pub fn spawn(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<BatchTrigger>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(spawn_loop(
            "tracked_refresh",
            TRACKED_REFRESH,
            shutdown.clone(),
            {
                let runner = self.clone();
                move || {
                    let runner = runner.clone();
                    async move { runner.tracker.refresh().await }
                }
            },
        ));

        handles.push(spawn_loop("graph_sweep", GRAPH_SWEEP, shutdown.clone(), {
            let runner = self.clone();
            move || {
                let runner = runner.clone();
                async move { runner.graph_sweep().await }
            }
        }));

        handles.push(spawn_loop(
            "keyword_sweep",
            KEYWORD_SWEEP,
            shutdown.clone(),
            {
                let runner = self.clone();
                move || {
                    let runner = runner.clone();
                    async move { runner.keyword_sweep().await }
                }
            },
        ));

        handles.push(spawn_loop(
            "semantic_batch",
            SEMANTIC_PERIOD,
            shutdown.clone(),
            {
                let runner = self.clone();
                move || {
                    let runner = runner.clone();
                    async move {
                        let users = runner.whitelist_vec();
                        runner.semantic.run_all(&users, false).await.map(|_| ())
                    }
                }
            },
        ));

        handles.push(spawn_loop("gc", GC_PERIOD, shutdown.clone(), {
            let runner = self.clone();
            move || {
                let runner = runner.clone();
                async move { runner.run_gc().await }
            }
        }));

        // Priority regenerate requests from the serve path
        handles.push(tokio::spawn({
            let runner = self.clone();
            let mut shutdown = shutdown;
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        trigger = trigger_rx.recv() => {
                            let Some(trigger) = trigger else { break };
                            info!(
                                user = trigger.user_did,
                                force_priority = trigger.force_priority,
                                "Batch regenerate trigger received"
                            );
                            let users = vec![trigger.user_did.clone()];
                            if let Err(e) = runner
                                .semantic
                                .run_all(&users, trigger.force_priority)
                                .await
                            {
                                warn!(user = trigger.user_did, error = %e, "Triggered batch failed");
                            }
                        }
                    }
                }
            }
        }));

        handles
    }

    fn whitelist_vec(&self) -> Vec<String> {
        self.tracker.whitelist().iter().cloned().collect()
    }

    /// Try a graph rebuild for each whitelisted user; the 24 h gate inside
    /// build_user_graph makes the frequent sweep cheap.
    async fn graph_sweep(&self) -> Result<()> {
        if self.graph_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = async {
            for user in self.whitelist_vec() {
                match self.graph.build_user_graph(&user).await {
                    Ok(true) => info!(user, "Graph rebuilt"),
                    Ok(false) => {}
                    Err(e) => warn!(user, error = %e, "Graph rebuild failed"),
                }
            }
            Ok(())
        }
        .await;
        self.graph_running.store(false, Ordering::SeqCst);
        result
    }

    /// Daily keyword refresh per user, gated through a meta key.
    async fn keyword_sweep(&self) -> Result<()> {
        if self.keyword_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = async {
            for user in self.whitelist_vec() {
                let key = format!("keywords_last_update_{user}");
                if let Some(last) = self.db.get_meta(&key).await? {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(&last) {
                        if Utc::now() - parsed.with_timezone(&Utc) < Duration::hours(24) {
                            continue;
                        }
                    }
                }
                match self.keywords.refresh_user(&user).await {
                    Ok(kept) => {
                        info!(user, kept, "Keywords refreshed");
                        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                        self.db.set_meta(&key, &now).await?;
                    }
                    Err(e) => warn!(user, error = %e, "Keyword refresh failed"),
                }
            }
            Ok(())
        }
        .await;
        self.keyword_running.store(false, Ordering::SeqCst);
        result
    }

    /// Expire served/seen logs, stale batches, and unengaged stranger posts.
    async fn run_gc(&self) -> Result<()> {
        if self.gc_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = async {
            let now = Utc::now();
            let stamp = |hours: i64| {
                (now - Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Millis, true)
            };

            let served = self.db.gc_served(&stamp(SERVED_RETENTION_HOURS)).await?;
            let seen = self.db.gc_seen(&stamp(SEEN_RETENTION_HOURS)).await?;
            let batches = self
                .db
                .gc_candidate_batches(&stamp(crate::semantic::BATCH_TTL_HOURS))
                .await?;
            let posts = self.db.gc_posts(&stamp(POST_RETENTION_DAYS * 24)).await?;

            info!(served, seen, batches, posts, "GC pass complete");
            Ok(())
        }
        .await;
        self.gc_running.store(false, Ordering::SeqCst);
        result
    }
}

/// A shutdown-aware interval loop around one fallible job.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: StdDuration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        warn!(job = name, error = %e, "Background job failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
