//! Classification of inbound live-update payloads.
//!
//! A payload is a JSON object mapping a type tag to an entity or a list of
//! entities. The recognized tags are the rows of [`MESSAGE_TAGS`]; anything
//! else is ignored so that new server-side kinds don't break older agents.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, trace, warn};

use crate::logging::sanitize;
use crate::models::{Post, Repository, Review, Stream};

/// Reserved correlation field; never an entity payload
const REQUEST_ID: &str = "requestId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Posts,
    Repositories,
    Streams,
    Reviews,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Posts => "posts",
            MessageType::Repositories => "repos",
            MessageType::Streams => "streams",
            MessageType::Reviews => "reviews",
        }
    }
}

/// How a tag maps onto a message type
#[derive(Debug, Clone, Copy)]
pub struct TagRule {
    pub tag: &'static str,
    pub kind: MessageType,
    /// Value is a single object that must be wrapped into a list
    pub singular: bool,
}

pub const MESSAGE_TAGS: &[TagRule] = &[
    TagRule { tag: "post", kind: MessageType::Posts, singular: true },
    TagRule { tag: "posts", kind: MessageType::Posts, singular: false },
    TagRule { tag: "repo", kind: MessageType::Repositories, singular: true },
    TagRule { tag: "repos", kind: MessageType::Repositories, singular: false },
    TagRule { tag: "stream", kind: MessageType::Streams, singular: true },
    TagRule { tag: "streams", kind: MessageType::Streams, singular: false },
    TagRule { tag: "review", kind: MessageType::Reviews, singular: true },
    TagRule { tag: "reviews", kind: MessageType::Reviews, singular: false },
];

pub fn classify(tag: &str) -> Option<&'static TagRule> {
    MESSAGE_TAGS.iter().find(|rule| rule.tag == tag)
}

/// Changed or created entities of one kind
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Posts(Vec<Post>),
    Repositories(Vec<Repository>),
    Streams(Vec<Stream>),
    Reviews(Vec<Review>),
}

impl ChangeEvent {
    pub fn kind(&self) -> MessageType {
        match self {
            ChangeEvent::Posts(_) => MessageType::Posts,
            ChangeEvent::Repositories(_) => MessageType::Repositories,
            ChangeEvent::Streams(_) => MessageType::Streams,
            ChangeEvent::Reviews(_) => MessageType::Reviews,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChangeEvent::Posts(v) => v.len(),
            ChangeEvent::Repositories(v) => v.len(),
            ChangeEvent::Streams(v) => v.len(),
            ChangeEvent::Reviews(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode one payload into change events, one per recognized tag, in key order
pub fn process_message(message: Value) -> Vec<ChangeEvent> {
    let Value::Object(entries) = message else {
        warn!("Ignoring live update that is not a JSON object");
        return Vec::new();
    };

    let mut events = Vec::new();
    for (key, value) in entries {
        if key == REQUEST_ID {
            continue;
        }

        info!(tag = %key, payload = %sanitize(&value), "Live update message received");

        let Some(rule) = classify(&key) else {
            trace!(tag = %key, "Ignoring unrecognized message tag");
            continue;
        };

        let value = if rule.singular {
            Value::Array(vec![value])
        } else {
            value
        };

        match decode(rule.kind, value) {
            Ok(event) => events.push(event),
            Err(e) => warn!(tag = %key, error = %e, "Dropping undecodable live update"),
        }
    }

    events
}

fn decode(kind: MessageType, value: Value) -> serde_json::Result<ChangeEvent> {
    fn list<T: DeserializeOwned>(value: Value) -> serde_json::Result<Vec<T>> {
        serde_json::from_value(value)
    }

    Ok(match kind {
        MessageType::Posts => ChangeEvent::Posts(list(value)?),
        MessageType::Repositories => ChangeEvent::Repositories(list(value)?),
        MessageType::Streams => ChangeEvent::Streams(list(value)?),
        MessageType::Reviews => ChangeEvent::Reviews(list(value)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_singular_post_is_normalized() {
        let events = process_message(json!({ "requestId": "x", "post": { "id": "p1" } }));

        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangeEvent::Posts(posts) => {
                assert_eq!(posts.len(), 1);
                assert_eq!(posts[0].id, "p1");
            }
            other => panic!("expected posts event, got {:?}", other),
        }
    }

    #[test]
    fn test_events_follow_key_order() {
        let events = process_message(json!({
            "streams": [{ "id": "s1" }, { "id": "s2" }],
            "repo": { "id": "repo1" },
            "posts": [{ "id": "p1" }]
        }));

        let kinds: Vec<MessageType> = events.iter().map(ChangeEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::Streams,
                MessageType::Repositories,
                MessageType::Posts
            ]
        );
        assert_eq!(events[0].len(), 2);
    }

    #[test]
    fn test_unknown_tags_are_ignored() {
        let events = process_message(json!({
            "marker": { "id": "m1" },
            "review": { "id": "r1" }
        }));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), MessageType::Reviews);
    }

    #[test]
    fn test_undecodable_payload_is_skipped() {
        let events = process_message(json!({
            "posts": "not a list",
            "stream": { "id": "s1" }
        }));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), MessageType::Streams);
    }

    #[test]
    fn test_non_object_message() {
        assert!(process_message(json!(["post"])).is_empty());
        assert!(process_message(json!({ "requestId": "only" })).is_empty());
    }

    #[test]
    fn test_tag_table_covers_both_forms() {
        for kind in [
            MessageType::Posts,
            MessageType::Repositories,
            MessageType::Streams,
            MessageType::Reviews,
        ] {
            let plural = classify(kind.as_str()).unwrap();
            assert_eq!(plural.kind, kind);
            assert!(!plural.singular);
            assert!(MESSAGE_TAGS.iter().any(|r| r.kind == kind && r.singular));
        }
    }

    #[test]
    fn test_inbound_payload_logged_at_verbose_level() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::EnvFilter;

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl Write for Captured {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(
                crate::config::TraceLevel::Verbose.filter_directive(),
            ))
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            process_message(json!({ "post": { "id": "p1", "token": "s3cret" } }));
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Live update message received"));
        assert!(output.contains("<token>"));
        assert!(!output.contains("s3cret"));
    }
}
