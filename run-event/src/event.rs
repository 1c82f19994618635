//! Session-level event types (type + payload).
//!
//! One scheduler session emits a sequence of these events; `StreamComplete`
//! is always last. Sub-agent events are re-entered as `SubStreamEvent`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage for one model call (prompt + completion).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt (input).
    pub prompt_tokens: u32,
    /// Tokens in the completion (output).
    pub completion_tokens: u32,
    /// Total tokens (prompt + completion).
    pub total_tokens: u32,
}

/// Failure classification for an invocation, as surfaced in
/// `EmittedEvent::InvocationFailed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed invocation block; diagnostic echoes the raw parameter text.
    Parse,
    /// No gadget registered under the invoked name.
    Unknown,
    /// Parameters rejected by the gadget's declared schema.
    Validation,
    /// Gadget returned an error (or panicked) during the run.
    Execution,
    /// Per-invocation deadline exceeded.
    Timeout,
    /// A dependency failed or was skipped and the skip controller chose skip.
    DependencyFailed,
    /// Node was part of a dependency cycle detected at stream close.
    Cycle,
    /// Node referenced an id that never appeared in the stream.
    DanglingReference,
    /// Node or stream was cancelled.
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case label, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Cycle => "cycle",
            ErrorKind::DanglingReference => "dangling_reference",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an invocation was skipped instead of executed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipCause {
    /// The invocation listed itself as a dependency.
    SelfDependency,
    /// A dependency terminated Failed or Skipped; `cause` names it.
    Dependency { cause: String },
    /// The invocation sat on a dependency cycle at stream close.
    Cycle,
    /// A dependency id never appeared in the stream.
    DanglingReference { dependency: String },
    /// The session was cancelled before the invocation could run.
    Cancelled,
}

/// One event in a session's output sequence (type + payload).
///
/// Envelope fields (session_id, invocation_id, event_id) are applied
/// separately via [`crate::Envelope`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmittedEvent {
    /// Plain text outside any invocation block, post interception.
    Text { content: String },
    /// An invocation block was parsed; emitted before any execution event.
    InvocationAnnounced {
        id: String,
        gadget: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dependencies: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parse_error: Option<String>,
    },
    /// Terminal: the gadget ran (or a controller synthesized a result).
    InvocationSucceeded {
        id: String,
        gadget: String,
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default)]
        breaks_loop: bool,
    },
    /// Terminal: the invocation failed; `kind` classifies the failure.
    InvocationFailed {
        id: String,
        gadget: String,
        kind: ErrorKind,
        message: String,
    },
    /// Terminal: the invocation never ran.
    InvocationSkipped {
        id: String,
        gadget: String,
        cause: SkipCause,
    },
    /// An event from a nested session run by a gadget, re-entered in
    /// real time under the outer invocation's id.
    SubStreamEvent { id: String, event: Box<EmittedEvent> },
    /// Final event of every session; nothing follows it.
    StreamComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        raw_text: String,
        final_message: String,
        #[serde(default)]
        loop_break: bool,
    },
}

impl EmittedEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Invocation id this event concerns, when it concerns one.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            EmittedEvent::InvocationAnnounced { id, .. }
            | EmittedEvent::InvocationSucceeded { id, .. }
            | EmittedEvent::InvocationFailed { id, .. }
            | EmittedEvent::InvocationSkipped { id, .. }
            | EmittedEvent::SubStreamEvent { id, .. } => Some(id),
            EmittedEvent::Text { .. } | EmittedEvent::StreamComplete { .. } => None,
        }
    }

    /// True for the three terminal invocation outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmittedEvent::InvocationSucceeded { .. }
                | EmittedEvent::InvocationFailed { .. }
                | EmittedEvent::InvocationSkipped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_event_wire_shape() {
        let ev = EmittedEvent::Text {
            content: "hello".to_string(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["content"], "hello");
    }

    #[test]
    fn announced_skips_empty_collections() {
        let ev = EmittedEvent::InvocationAnnounced {
            id: "a".to_string(),
            gadget: "echo".to_string(),
            dependencies: vec![],
            parameters: BTreeMap::new(),
            parse_error: None,
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "invocation_announced");
        assert_eq!(v["id"], "a");
        assert_eq!(v["gadget"], "echo");
        assert!(v.get("dependencies").is_none());
        assert!(v.get("parameters").is_none());
        assert!(v.get("parse_error").is_none());
    }

    #[test]
    fn failed_event_carries_kind_label() {
        let ev = EmittedEvent::InvocationFailed {
            id: "x".to_string(),
            gadget: "fetch".to_string(),
            kind: ErrorKind::Timeout,
            message: "deadline exceeded".to_string(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["kind"], "timeout");
        assert_eq!(v["message"], "deadline exceeded");
    }

    #[test]
    fn skip_cause_tagged_by_reason() {
        let ev = EmittedEvent::InvocationSkipped {
            id: "y".to_string(),
            gadget: "ok".to_string(),
            cause: SkipCause::Dependency {
                cause: "x".to_string(),
            },
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["cause"]["reason"], "dependency");
        assert_eq!(v["cause"]["cause"], "x");
    }

    #[test]
    fn sub_stream_event_nests() {
        let inner = EmittedEvent::Text {
            content: "inner".to_string(),
        };
        let ev = EmittedEvent::SubStreamEvent {
            id: "outer".to_string(),
            event: Box::new(inner),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "sub_stream_event");
        assert_eq!(v["event"]["type"], "text");
        assert_eq!(v["event"]["content"], "inner");
    }

    #[test]
    fn stream_complete_roundtrip() {
        let ev = EmittedEvent::StreamComplete {
            finish_reason: Some("stop".to_string()),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            raw_text: "Hello world".to_string(),
            final_message: "Hello world".to_string(),
            loop_break: false,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"stream_complete\""));
        assert!(json.contains("\"finish_reason\":\"stop\""));
        let parsed: EmittedEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            EmittedEvent::StreamComplete {
                finish_reason,
                usage,
                raw_text,
                ..
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(usage.unwrap().total_tokens, 15);
                assert_eq!(raw_text, "Hello world");
            }
            _ => panic!("expected StreamComplete"),
        }
    }

    #[test]
    fn invocation_id_and_terminal_helpers() {
        let announced = EmittedEvent::InvocationAnnounced {
            id: "a".to_string(),
            gadget: "echo".to_string(),
            dependencies: vec![],
            parameters: BTreeMap::new(),
            parse_error: None,
        };
        assert_eq!(announced.invocation_id(), Some("a"));
        assert!(!announced.is_terminal());

        let skipped = EmittedEvent::InvocationSkipped {
            id: "b".to_string(),
            gadget: "echo".to_string(),
            cause: SkipCause::Cancelled,
        };
        assert!(skipped.is_terminal());

        let text = EmittedEvent::Text {
            content: String::new(),
        };
        assert_eq!(text.invocation_id(), None);
    }

    #[test]
    fn error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::Parse,
            ErrorKind::Unknown,
            ErrorKind::Validation,
            ErrorKind::Execution,
            ErrorKind::Timeout,
            ErrorKind::DependencyFailed,
            ErrorKind::Cycle,
            ErrorKind::DanglingReference,
            ErrorKind::Cancelled,
        ] {
            let via_serde = serde_json::to_value(kind).unwrap();
            assert_eq!(via_serde, kind.as_str());
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }
}
