//! Run event protocol: type + payload + envelope.
//!
//! This crate defines the wire shape of a single session event and envelope
//! injection. It does not depend on heddle. Heddle emits `EmittedEvent`
//! values directly and calls `to_json` when a consumer wants JSON lines.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::{EmittedEvent, ErrorKind, SkipCause, Usage};
