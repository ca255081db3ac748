//! The client-facing event schema.
//!
//! A worker's lifetime is narrated to exactly one subscriber as an ordered
//! sequence of these events.  The terminal event is exactly one of `Done`,
//! `Error`, or `Cancelled`, after which the stream closes.  Transports (HTTP
//! SSE, WebSocket, an in-process queue) are external concerns; this module
//! defines the schema and the SSE framing used by the reference transport.
//!
//! # Example
//!
//! ```rust
//! use loomllm::event::Event;
//!
//! let event = Event::Chunk { text: "Hel".to_string() };
//! assert_eq!(event.to_sse(), "data: {\"event\":\"chunk\",\"text\":\"Hel\"}\n\n");
//! ```

use serde::{Deserialize, Serialize};

use crate::loomllm::conversation::HistoryEntry;
use crate::loomllm::driver::TokenUsage;

/// Events delivered to a worker's subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The worker accepted the intent and is about to call the provider.
    Started {
        conversation_id: String,
        worker_id: String,
        model: String,
    },
    /// Incremental text delta (streaming only), in provider order.
    Chunk { text: String },
    /// Token accounting; may precede the terminal event.
    Usage {
        #[serde(flatten)]
        usage: TokenUsage,
    },
    /// Intermediate step from reasoning models that expose them.
    ThinkingStep { name: String, content: String },
    /// Terminal success: the reply was appended to the graph and persisted.
    Done {
        full_text: String,
        message_id: String,
        parent_id: Option<String>,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    /// Terminal failure.  `kind` is the stable error-kind tag.
    Error { kind: String, message: String },
    /// Terminal cancellation.
    Cancelled {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A navigation intent changed the active chain; no provider call was
    /// made.
    NavChanged {
        active_leaf: String,
        active_branch: String,
        history_snapshot: Vec<HistoryEntry>,
    },
}

impl Event {
    /// Whether this event closes the subscriber's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Done { .. } | Event::Error { .. } | Event::Cancelled { .. }
        )
    }

    /// Encode as one SSE frame: `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_themselves_for_the_wire() {
        let event = Event::Error {
            kind: "RateLimited".to_string(),
            message: "quota".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"error\""));
        assert!(json.contains("\"kind\":\"RateLimited\""));
    }

    #[test]
    fn usage_flattens_into_the_payload() {
        let event = Event::Usage {
            usage: TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
                reasoning_tokens: None,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"prompt_tokens\":5"));
        assert!(!json.contains("\"usage\""));
    }

    #[test]
    fn terminal_classification() {
        assert!(Event::Cancelled { reason: None }.is_terminal());
        assert!(!Event::Chunk { text: "x".into() }.is_terminal());
    }
}
