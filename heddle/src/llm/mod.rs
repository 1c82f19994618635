//! Chunk producer contract for the scheduler.
//!
//! The scheduler consumes an async stream of [`Chunk`] values from an LLM
//! adapter. It never retries the producer; retry belongs to a higher layer.
//! Mock streams for tests and examples are built with [`chunks`] /
//! [`text_chunks`].

use std::pin::Pin;

use futures::Stream;
use thiserror::Error;

pub use run_event::Usage;

/// One fragment of a streaming model response.
///
/// Chunks are finite and ordered; the text may split any syntactic boundary,
/// including the middle of an invocation delimiter.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    /// Text payload; `None` for metadata-only chunks.
    pub text: Option<String>,
    /// Provider finish reason (e.g. "stop"), usually on the last chunk.
    pub finish_reason: Option<String>,
    /// Token usage, when the provider reports it.
    pub usage: Option<Usage>,
}

impl Chunk {
    /// Text-only chunk.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            ..Self::default()
        }
    }

    /// Metadata-only final chunk with a finish reason.
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Final chunk with finish reason and usage.
    pub fn finish_with_usage(reason: impl Into<String>, usage: Usage) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            usage: Some(usage),
            ..Self::default()
        }
    }
}

/// Error from the chunk producer (the LLM adapter).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmStreamError {
    /// The provider stream failed mid-response.
    #[error("provider stream failed: {0}")]
    Provider(String),
}

/// The producer contract: an async stream of chunks, fallible per item.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, LlmStreamError>> + Send>>;

/// Builds a finite chunk stream from parts. Test and example helper.
pub fn chunks<I>(parts: I) -> ChunkStream
where
    I: IntoIterator<Item = Chunk>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(parts.into_iter().map(Ok)))
}

/// Builds a chunk stream where each string is one text chunk, followed by a
/// final `finish_reason = "stop"` chunk.
pub fn text_chunks(parts: &[&str]) -> ChunkStream {
    let items: Vec<Chunk> = parts
        .iter()
        .map(|s| Chunk::text(*s))
        .chain(std::iter::once(Chunk::finish("stop")))
        .collect();
    chunks(items)
}

/// Builds a chunk stream that yields the given chunks and then an error.
pub fn failing_chunks<I>(parts: I, error: LlmStreamError) -> ChunkStream
where
    I: IntoIterator<Item = Chunk>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(
        parts
            .into_iter()
            .map(Ok)
            .chain(std::iter::once(Err(error))),
    ))
}
