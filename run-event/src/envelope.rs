//! Envelope (session_id, invocation_id, event_id) for emitted events.
//! EnvelopeState tracks the current invocation and stamps each event.

use crate::event::EmittedEvent;
use serde_json::Value;

/// Envelope fields recommended for each serialized event.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Session ID; constant within a session.
    pub session_id: Option<String>,
    /// Invocation the event belongs to, when it belongs to one.
    pub invocation_id: Option<String>,
    /// Per-event sequence number; monotonically increasing within a stream.
    pub event_id: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = Some(id.into());
        self
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.session_id {
            obj.entry("session_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(ref id) = self.invocation_id {
            obj.entry("invocation_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(id) = self.event_id {
            obj.entry("event_id")
                .or_insert_with(|| Value::Number(serde_json::Number::from(id)));
        }
    }
}

/// Envelope state for one session: session_id and next event_id.
pub struct EnvelopeState {
    pub session_id: String,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_event_id: 1,
        }
    }

    /// Injects envelope into the event value and advances the sequence.
    /// The `invocation_id` field is taken from the event's own `id` when
    /// present (`Text` and `StreamComplete` carry none).
    pub fn inject_into(&mut self, value: &mut Value) {
        let invocation_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let mut env = Envelope::new()
            .with_session_id(&self.session_id)
            .with_event_id(self.next_event_id);
        if let Some(id) = invocation_id {
            env = env.with_invocation_id(id);
        }
        self.next_event_id += 1;
        env.inject_into(value);
    }
}

/// Converts an event to JSON and injects envelope using the given state.
/// Returns the final value (type + payload + session_id, invocation_id, event_id).
pub fn to_json(
    event: &EmittedEvent,
    state: &mut EnvelopeState,
) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}
