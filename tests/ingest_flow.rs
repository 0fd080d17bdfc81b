// Ingest flow: event classification, batching, cursor semantics, and
// crash-replay absorption, driven through the ingester without a socket.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use tideline::db::{self, Database};
use tideline::firehose::event::{parse_message, StreamEvent};
use tideline::firehose::{Ingester, CURSOR_KEY};
use tideline::taste::{PostLikerSource, TasteEngine};
use tideline::tracking::Tracker;

struct NoLikers;

#[async_trait]
impl PostLikerSource for NoLikers {
    async fn post_likers(&self, _uri: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

fn ingester(store: &Arc<dyn Database>, whitelist: &[&str]) -> Ingester {
    let whitelist: HashSet<String> = whitelist.iter().map(|s| s.to_string()).collect();
    let tracker = Arc::new(Tracker::new(store.clone(), whitelist));
    let taste = Arc::new(TasteEngine::new(store.clone(), Arc::new(NoLikers)));
    Ingester::new(store.clone(), tracker, taste, "wss://example.invalid/subscribe", 1)
}

fn create_post_event(did: &str, rkey: &str, time_us: u64, text: &str) -> StreamEvent {
    let raw = serde_json::json!({
        "kind": "commit",
        "did": did,
        "time_us": time_us,
        "commit": {
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": rkey,
            "cid": "bafy",
            "record": { "text": text },
        }
    })
    .to_string();
    parse_message(&raw).unwrap()
}

fn like_event(actor: &str, rkey: &str, time_us: u64, subject: &str) -> StreamEvent {
    let raw = serde_json::json!({
        "kind": "commit",
        "did": actor,
        "time_us": time_us,
        "commit": {
            "operation": "create",
            "collection": "app.bsky.feed.like",
            "rkey": rkey,
            "cid": "bafy",
            "record": { "subject": { "uri": subject, "cid": "c" } },
        }
    })
    .to_string();
    parse_message(&raw).unwrap()
}

#[tokio::test]
async fn cursor_resume_after_crash() {
    let store = db::open_in_memory().unwrap();
    let ing = ingester(&store, &["did:plc:liker"]);

    let p1 = "at://did:plc:author/app.bsky.feed.post/p1";

    // t=100 create, t=200 like, t=300 barrier (an event we ignore)
    ing.handle_event(create_post_event("did:plc:author", "p1", 100, "hello"))
        .await;
    ing.handle_event(like_event("did:plc:liker", "l1", 200, p1))
        .await;
    ing.handle_event(StreamEvent::Ignored { time_us: 300 }).await;
    ing.flush_now().await;

    assert_eq!(
        store.get_meta(CURSOR_KEY).await.unwrap(),
        Some("300".to_string())
    );

    // Crash and restart: the upstream resumes at the stored cursor, so only
    // post-cursor events arrive. A duplicate in-flight like (replayed at the
    // boundary) is absorbed by the edge uniqueness; its counter bump is the
    // documented overcount trade-off, so replay the post instead, which is
    // fully idempotent.
    let ing2 = ingester(&store, &["did:plc:liker"]);
    ing2.handle_event(create_post_event("did:plc:author", "p1", 100, "hello"))
        .await;
    ing2.flush_now().await;

    let post = store.get_post(p1).await.unwrap().unwrap();
    assert_eq!(post.like_count, 1);
    assert_eq!(post.text.as_deref(), Some("hello"));

    let posts = store.get_posts(&[p1.to_string()]).await.unwrap();
    assert_eq!(posts.len(), 1, "replayed create must not duplicate the row");

    // Cursor never went backwards
    assert_eq!(
        store.get_meta(CURSOR_KEY).await.unwrap(),
        Some("300".to_string())
    );
}

#[tokio::test]
async fn cursor_is_monotonic() {
    let store = db::open_in_memory().unwrap();
    let ing = ingester(&store, &[]);

    ing.handle_event(StreamEvent::Ignored { time_us: 500 }).await;
    ing.flush_now().await;
    assert_eq!(
        store.get_meta(CURSOR_KEY).await.unwrap(),
        Some("500".to_string())
    );

    // An out-of-order event can't move the cursor backwards
    ing.handle_event(StreamEvent::Ignored { time_us: 400 }).await;
    ing.handle_event(StreamEvent::Ignored { time_us: 600 }).await;
    ing.flush_now().await;
    assert_eq!(
        store.get_meta(CURSOR_KEY).await.unwrap(),
        Some("600".to_string())
    );
}

#[tokio::test]
async fn reply_increments_parent_counter_and_tracks_edge() {
    let store = db::open_in_memory().unwrap();
    let ing = ingester(&store, &["did:plc:me"]);

    let parent = "at://did:plc:author/app.bsky.feed.post/root";
    ing.handle_event(create_post_event("did:plc:author", "root", 100, "root post"))
        .await;

    let raw = serde_json::json!({
        "kind": "commit",
        "did": "did:plc:me",
        "time_us": 200u64,
        "commit": {
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "r1",
            "cid": "bafy",
            "record": {
                "text": "nice",
                "reply": {
                    "root": { "uri": parent, "cid": "c" },
                    "parent": { "uri": parent, "cid": "c" },
                }
            },
        }
    })
    .to_string();
    ing.handle_event(parse_message(&raw).unwrap()).await;
    ing.flush_now().await;

    let root = store.get_post(parent).await.unwrap().unwrap();
    assert_eq!(root.reply_count, 1);

    // The whitelisted replier leaves an interaction edge on the parent
    let interactions = store.get_user_interactions("did:plc:me").await.unwrap();
    assert!(interactions.contains_key(parent));
}

#[tokio::test]
async fn untracked_actor_bumps_counters_without_edges() {
    let store = db::open_in_memory().unwrap();
    let ing = ingester(&store, &["did:plc:me"]);

    let p1 = "at://did:plc:author/app.bsky.feed.post/p1";
    ing.handle_event(create_post_event("did:plc:author", "p1", 100, "hi"))
        .await;
    ing.handle_event(like_event("did:plc:rando", "l1", 200, p1))
        .await;
    ing.flush_now().await;

    let post = store.get_post(p1).await.unwrap().unwrap();
    assert_eq!(post.like_count, 1);
    assert!(store.get_local_likers(p1).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_removes_row_without_touching_others() {
    let store = db::open_in_memory().unwrap();
    let ing = ingester(&store, &[]);

    ing.handle_event(create_post_event("did:plc:a", "p1", 100, "one"))
        .await;
    ing.handle_event(create_post_event("did:plc:a", "p2", 110, "two"))
        .await;
    ing.flush_now().await;

    let raw = serde_json::json!({
        "kind": "commit",
        "did": "did:plc:a",
        "time_us": 200u64,
        "commit": {
            "operation": "delete",
            "collection": "app.bsky.feed.post",
            "rkey": "p1",
        }
    })
    .to_string();
    ing.handle_event(parse_message(&raw).unwrap()).await;
    ing.flush_now().await;

    assert!(store
        .get_post("at://did:plc:a/app.bsky.feed.post/p1")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_post("at://did:plc:a/app.bsky.feed.post/p2")
        .await
        .unwrap()
        .is_some());
}
