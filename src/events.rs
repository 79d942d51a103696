//! Text generation stream event types.
//!
//! The text service streams server-sent events named after the object they
//! carry. Only message deltas whose first content part is text produce
//! story text; every other event is skipped.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::sse::SseEvent;

pub const MESSAGE_DELTA: &str = "thread.message.delta";
pub const RUN_FAILED: &str = "thread.run.failed";
pub const ERROR: &str = "error";
pub const DONE: &str = "done";

/// Payload of a `thread.message.delta` event.
#[derive(Debug, Deserialize)]
pub struct MessageDeltaEvent {
    pub delta: MessageDelta,
}

#[derive(Debug, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// Content part types inside a message delta.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: Option<TextValue>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct TextValue {
    #[serde(default)]
    pub value: Option<String>,
}

/// Payload of a failed run.
#[derive(Debug, Deserialize)]
pub struct RunFailedEvent {
    #[serde(default)]
    pub last_error: Option<ErrorInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub message: Option<String>,
}

/// What a single server-sent event means for the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    Done,
    Error(String),
    Ignored,
}

/// Interpret one server-sent event.
pub fn classify(sse: &SseEvent) -> StreamEvent {
    if sse.data.trim() == "[DONE]" {
        return StreamEvent::Done;
    }

    match sse.event.as_deref() {
        Some(MESSAGE_DELTA) => match serde_json::from_str::<MessageDeltaEvent>(&sse.data) {
            Ok(event) => match event.delta.content.into_iter().next() {
                Some(ContentPart::Text {
                    text: Some(TextValue { value: Some(value) }),
                }) => StreamEvent::TextDelta(value),
                _ => StreamEvent::Ignored,
            },
            Err(e) => {
                warn!(?e, "Malformed message delta, skipping");
                StreamEvent::Ignored
            }
        },
        Some(RUN_FAILED) => {
            let message = serde_json::from_str::<RunFailedEvent>(&sse.data)
                .ok()
                .and_then(|e| e.last_error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| "run failed".to_string());
            StreamEvent::Error(message)
        }
        Some(ERROR) => {
            let message = serde_json::from_str::<ErrorInfo>(&sse.data)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| sse.data.clone());
            StreamEvent::Error(message)
        }
        Some(DONE) => StreamEvent::Done,
        other => {
            debug!(event = ?other, "stream_event_ignored");
            StreamEvent::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_text_delta() {
        let data = r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[{"index":0,"type":"text","text":{"value":"Once"}}]}}"#;
        assert_eq!(
            classify(&sse(MESSAGE_DELTA, data)),
            StreamEvent::TextDelta("Once".into())
        );
    }

    #[test]
    fn test_non_text_content_ignored() {
        let data = r#"{"delta":{"content":[{"index":0,"type":"image_file","image_file":{"file_id":"f"}}]}}"#;
        assert_eq!(classify(&sse(MESSAGE_DELTA, data)), StreamEvent::Ignored);
    }

    #[test]
    fn test_only_first_content_part_counts() {
        let data = r#"{"delta":{"content":[{"type":"image_file"},{"type":"text","text":{"value":"x"}}]}}"#;
        assert_eq!(classify(&sse(MESSAGE_DELTA, data)), StreamEvent::Ignored);
    }

    #[test]
    fn test_other_events_ignored() {
        assert_eq!(
            classify(&sse("thread.run.created", r#"{"id":"run_1"}"#)),
            StreamEvent::Ignored
        );
        assert_eq!(
            classify(&sse(MESSAGE_DELTA, "not json")),
            StreamEvent::Ignored
        );
    }

    #[test]
    fn test_done_and_errors() {
        assert_eq!(classify(&sse(DONE, "[DONE]")), StreamEvent::Done);
        assert_eq!(
            classify(&sse(RUN_FAILED, r#"{"last_error":{"code":"server_error","message":"overloaded"}}"#)),
            StreamEvent::Error("overloaded".into())
        );
        assert_eq!(
            classify(&sse(ERROR, r#"{"message":"bad key"}"#)),
            StreamEvent::Error("bad key".into())
        );
    }
}
