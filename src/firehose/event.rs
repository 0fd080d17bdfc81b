// Jetstream event parsing.
//
// The upstream payload is untyped JSON. We deserialize the envelope with
// serde, then narrow each commit into one tagged StreamEvent variant —
// parsing happens exactly once, at ingest. Anything that doesn't match a
// variant (identity events, unknown collections, malformed records) maps
// to StreamEvent::Ignored so the consumer loop can advance the cursor
// without special cases.

use serde::Deserialize;
use serde_json::Value;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

/// The raw jetstream envelope.
#[derive(Debug, Deserialize)]
pub struct JetstreamMessage {
    pub kind: String,
    pub did: String,
    pub time_us: u64,
    pub commit: Option<JetstreamCommit>,
}

#[derive(Debug, Deserialize)]
pub struct JetstreamCommit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    pub record: Option<Value>,
    pub cid: Option<String>,
}

/// A reference to another record (like/repost subjects, reply anchors).
#[derive(Debug, Clone, Deserialize)]
pub struct RecordRef {
    pub uri: String,
}

/// One parsed firehose event. `time_us` is carried on every variant so the
/// cursor can advance even for ignored messages.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    CreatePost {
        time_us: u64,
        uri: String,
        cid: String,
        author: String,
        text: String,
        has_image: bool,
        has_video: bool,
        has_external: bool,
    },
    CreateReply {
        time_us: u64,
        uri: String,
        cid: String,
        author: String,
        text: String,
        root: String,
        parent: String,
        has_image: bool,
        has_video: bool,
        has_external: bool,
    },
    DeletePost {
        time_us: u64,
        uri: String,
    },
    CreateLike {
        time_us: u64,
        uri: String,
        actor: String,
        subject: String,
    },
    CreateRepost {
        time_us: u64,
        uri: String,
        actor: String,
        subject: String,
    },
    Ignored {
        time_us: u64,
    },
}

impl StreamEvent {
    pub fn time_us(&self) -> u64 {
        match self {
            StreamEvent::CreatePost { time_us, .. }
            | StreamEvent::CreateReply { time_us, .. }
            | StreamEvent::DeletePost { time_us, .. }
            | StreamEvent::CreateLike { time_us, .. }
            | StreamEvent::CreateRepost { time_us, .. }
            | StreamEvent::Ignored { time_us } => *time_us,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
    reply: Option<ReplyRef>,
    embed: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReplyRef {
    root: Option<RecordRef>,
    parent: Option<RecordRef>,
}

#[derive(Debug, Deserialize)]
struct SubjectRecord {
    subject: RecordRef,
}

/// Parse one jetstream JSON message into a StreamEvent.
///
/// Returns None only when the JSON doesn't deserialize as an envelope at
/// all — in that case there is no time_us to advance the cursor with.
pub fn parse_message(raw: &str) -> Option<StreamEvent> {
    let msg: JetstreamMessage = serde_json::from_str(raw).ok()?;

    if msg.kind != "commit" {
        return Some(StreamEvent::Ignored {
            time_us: msg.time_us,
        });
    }
    let commit = match msg.commit {
        Some(c) => c,
        None => {
            return Some(StreamEvent::Ignored {
                time_us: msg.time_us,
            })
        }
    };

    let uri = format!("at://{}/{}/{}", msg.did, commit.collection, commit.rkey);

    let ignored = StreamEvent::Ignored {
        time_us: msg.time_us,
    };

    match (commit.operation.as_str(), commit.collection.as_str()) {
        ("create", POST_COLLECTION) => {
            let record: PostRecord = match commit.record.and_then(|r| serde_json::from_value(r).ok())
            {
                Some(r) => r,
                // Malformed record: drop the event, keep the cursor moving
                None => return Some(ignored),
            };
            let (has_image, has_video, has_external) = embed_flags(record.embed.as_ref());
            // Embedded NULs break SQLite text storage — strip at the door
            let text = sanitize_text(&record.text);
            let cid = commit.cid.unwrap_or_default();

            match record.reply {
                Some(reply) => {
                    let parent = match reply.parent {
                        Some(p) => p.uri,
                        None => return Some(ignored),
                    };
                    // A missing root anchors the thread at the parent
                    let root = reply.root.map(|r| r.uri).unwrap_or_else(|| parent.clone());
                    Some(StreamEvent::CreateReply {
                        time_us: msg.time_us,
                        uri,
                        cid,
                        author: msg.did,
                        text,
                        root,
                        parent,
                        has_image,
                        has_video,
                        has_external,
                    })
                }
                None => Some(StreamEvent::CreatePost {
                    time_us: msg.time_us,
                    uri,
                    cid,
                    author: msg.did,
                    text,
                    has_image,
                    has_video,
                    has_external,
                }),
            }
        }
        ("delete", POST_COLLECTION) => Some(StreamEvent::DeletePost {
            time_us: msg.time_us,
            uri,
        }),
        ("create", LIKE_COLLECTION) => {
            let record: SubjectRecord =
                match commit.record.and_then(|r| serde_json::from_value(r).ok()) {
                    Some(r) => r,
                    None => return Some(ignored),
                };
            Some(StreamEvent::CreateLike {
                time_us: msg.time_us,
                uri,
                actor: msg.did,
                subject: record.subject.uri,
            })
        }
        ("create", REPOST_COLLECTION) => {
            let record: SubjectRecord =
                match commit.record.and_then(|r| serde_json::from_value(r).ok()) {
                    Some(r) => r,
                    None => return Some(ignored),
                };
            Some(StreamEvent::CreateRepost {
                time_us: msg.time_us,
                uri,
                actor: msg.did,
                subject: record.subject.uri,
            })
        }
        _ => Some(StreamEvent::Ignored {
            time_us: msg.time_us,
        }),
    }
}

/// Strip embedded NUL characters (they corrupt TEXT columns).
pub fn sanitize_text(text: &str) -> String {
    if text.contains('\u{0000}') {
        text.replace('\u{0000}', "")
    } else {
        text.to_string()
    }
}

/// Inspect the embed union's $type for media markers. Quote posts with media
/// carry recordWithMedia, whose inner media union is checked the same way.
fn embed_flags(embed: Option<&Value>) -> (bool, bool, bool) {
    let Some(embed) = embed else {
        return (false, false, false);
    };
    let type_of = |v: &Value| -> String {
        v.get("$type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let mut ty = type_of(embed);
    if ty.starts_with("app.bsky.embed.recordWithMedia") {
        if let Some(media) = embed.get("media") {
            ty = type_of(media);
        }
    }
    (
        ty.starts_with("app.bsky.embed.images"),
        ty.starts_with("app.bsky.embed.video"),
        ty.starts_with("app.bsky.embed.external"),
    )
}
