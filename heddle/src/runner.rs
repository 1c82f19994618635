//! Run a session to completion: stream → callback → final snapshot.
//!
//! For callers that want state-in/state-out instead of consuming the event
//! stream themselves (one agent-loop turn, tests, piped CLIs).

use std::collections::HashMap;

use tokio_stream::StreamExt;

use run_event::{EmittedEvent, Usage};

use crate::error::SessionError;
use crate::llm::ChunkStream;
use crate::scheduler::StreamProcessor;

/// Snapshot of one finished session.
#[derive(Clone, Debug, Default)]
pub struct SessionSummary {
    /// Accumulated text after `intercept_final_message`.
    pub final_message: String,
    /// Accumulated text before final interception.
    pub raw_text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// True when any gadget raised the break-loop signal.
    pub loop_break: bool,
    /// Terminal event per invocation id.
    pub outcomes: HashMap<String, EmittedEvent>,
}

/// Consumes the session's event stream, invoking `on_event` per event, and
/// returns the final summary.
pub async fn run_to_completion<F>(
    processor: StreamProcessor,
    chunks: ChunkStream,
    mut on_event: Option<F>,
) -> Result<SessionSummary, SessionError>
where
    F: FnMut(&EmittedEvent),
{
    let mut stream = processor.run(chunks);
    let mut summary = SessionSummary::default();
    let mut complete = false;

    while let Some(item) = stream.next().await {
        let event = item?;
        if let Some(ref mut callback) = on_event {
            callback(&event);
        }
        if let Some(id) = event.invocation_id() {
            if event.is_terminal() {
                summary.outcomes.insert(id.to_string(), event.clone());
            }
        }
        if let EmittedEvent::StreamComplete {
            finish_reason,
            usage,
            raw_text,
            final_message,
            loop_break,
        } = event
        {
            summary.finish_reason = finish_reason;
            summary.usage = usage;
            summary.raw_text = raw_text;
            summary.final_message = final_message;
            summary.loop_break = loop_break;
            complete = true;
        }
    }

    if !complete {
        return Err(SessionError::StreamEndedWithoutComplete);
    }
    Ok(summary)
}
