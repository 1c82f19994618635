//! Interceptors: synchronous, total transforms applied in declared order.
//!
//! Suppression is a distinguished value, not an error: returning
//! [`Intercepted::Suppress`] drops the value and short-circuits the rest of
//! the chain for that slot.

use std::collections::BTreeMap;

/// Result of a chunk-level interception.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intercepted {
    /// Keep (possibly transformed) value.
    Value(String),
    /// Drop the value entirely.
    Suppress,
}

impl Intercepted {
    pub fn into_option(self) -> Option<String> {
        match self {
            Intercepted::Value(v) => Some(v),
            Intercepted::Suppress => None,
        }
    }
}

/// Synchronous transform family. Defaults are identity, so implementors
/// override only the slots they care about.
pub trait Interceptor: Send + Sync {
    /// Raw model output before accumulation and parsing.
    fn intercept_raw_chunk(&self, chunk: String) -> Intercepted {
        Intercepted::Value(chunk)
    }

    /// Parsed plain-text segments, before they are emitted as events.
    fn intercept_text_chunk(&self, chunk: String) -> Intercepted {
        Intercepted::Value(chunk)
    }

    /// Parameters of an invocation, before validation and execution.
    fn intercept_parameters(&self, params: BTreeMap<String, String>) -> BTreeMap<String, String> {
        params
    }

    /// Successful result text, before it is emitted.
    fn intercept_result(&self, result: String) -> String {
        result
    }

    /// The accumulated message at stream end, before `StreamComplete`.
    fn intercept_final_message(&self, accumulated: String) -> String {
        accumulated
    }
}
