// In-memory write batching for the firehose.
//
// All mutations accumulate in a PendingBatch owned by the ingester and are
// flushed every few seconds inside a single transaction. Per-URI counter
// deltas are summed here before flush, so a thousand likes of one post
// become one UPDATE.

use std::collections::HashMap;

use crate::db::models::{IngestBatch, InteractionEdge, NewPost};

#[derive(Debug, Default)]
struct CounterDelta {
    likes: i64,
    reposts: i64,
    replies: i64,
}

/// Mutations accumulated between flushes.
#[derive(Debug, Default)]
pub struct PendingBatch {
    posts: Vec<NewPost>,
    deletes: Vec<String>,
    counters: HashMap<String, CounterDelta>,
    interactions: Vec<InteractionEdge>,
    /// Largest event timestamp seen since the last flush.
    max_time_us: Option<u64>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
            && self.deletes.is_empty()
            && self.counters.is_empty()
            && self.interactions.is_empty()
    }

    pub fn push_post(&mut self, post: NewPost) {
        self.posts.push(post);
    }

    pub fn push_delete(&mut self, uri: String) {
        self.deletes.push(uri);
    }

    pub fn bump_likes(&mut self, uri: &str, delta: i64) {
        self.counters.entry(uri.to_string()).or_default().likes += delta;
    }

    pub fn bump_reposts(&mut self, uri: &str, delta: i64) {
        self.counters.entry(uri.to_string()).or_default().reposts += delta;
    }

    pub fn bump_replies(&mut self, uri: &str, delta: i64) {
        self.counters.entry(uri.to_string()).or_default().replies += delta;
    }

    pub fn push_interaction(&mut self, edge: InteractionEdge) {
        self.interactions.push(edge);
    }

    pub fn observe_time(&mut self, time_us: u64) {
        self.max_time_us = Some(self.max_time_us.map_or(time_us, |t| t.max(time_us)));
    }

    pub fn max_time_us(&self) -> Option<u64> {
        self.max_time_us
    }

    /// Drain the accumulated mutations into a flushable batch, leaving this
    /// one empty. The cursor watermark is returned alongside so the caller
    /// can persist it only after the flush commits.
    pub fn drain(&mut self) -> (IngestBatch, Option<u64>) {
        let counters = std::mem::take(&mut self.counters)
            .into_iter()
            .map(|(uri, d)| (uri, d.likes, d.reposts, d.replies))
            .collect();
        let batch = IngestBatch {
            posts: std::mem::take(&mut self.posts),
            deletes: std::mem::take(&mut self.deletes),
            counters,
            interactions: std::mem::take(&mut self.interactions),
        };
        (batch, self.max_time_us.take())
    }

    /// Put a failed flush back so nothing is lost; newer mutations queued
    /// since the drain stay on top of the restored ones.
    pub fn restore(&mut self, batch: IngestBatch, cursor: Option<u64>) {
        let mut posts = batch.posts;
        posts.append(&mut self.posts);
        self.posts = posts;

        let mut deletes = batch.deletes;
        deletes.append(&mut self.deletes);
        self.deletes = deletes;

        for (uri, likes, reposts, replies) in batch.counters {
            let delta = self.counters.entry(uri).or_default();
            delta.likes += likes;
            delta.reposts += reposts;
            delta.replies += replies;
        }

        let mut interactions = batch.interactions;
        interactions.append(&mut self.interactions);
        self.interactions = interactions;

        if let Some(t) = cursor {
            self.observe_time(t);
        }
    }
}
