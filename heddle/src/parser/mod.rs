//! Incremental invocation parser: chunk text in, `Text` / `InvocationCall` out.
//!
//! The surface grammar frames gadget invocations inside the model's text:
//!
//! ```text
//! <gadget>name[:id[:dep1,dep2,...]]
//! <arg>param_name
//! value-line-1
//! value-line-2
//! </gadget>
//! ```
//!
//! Everything outside a block is plain text. Chunks may split any boundary,
//! including the middle of a delimiter; outside a block the parser carries at
//! most `start.len() - 1` bytes (the longest buffer suffix that is a prefix
//! of the start marker) and emits everything provably outside a block.
//! Inside a block it buffers until the end marker.
//!
//! Malformed blocks are still emitted as calls with `parse_error` set, so the
//! scheduler can surface the failure and the model sees diagnostic feedback.

mod escape;

pub use escape::{call, escape_value, format_invocation, unescape_value};

use std::collections::BTreeMap;

/// The three delimiter strings framing an invocation block.
///
/// All three must be distinct, non-empty ASCII markers, and neither `start`
/// nor `end` may be a prefix of the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pub start: String,
    pub arg: String,
    pub end: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self::new("<gadget>", "<arg>", "</gadget>")
    }
}

impl Delimiters {
    pub fn new(
        start: impl Into<String>,
        arg: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            start: start.into(),
            arg: arg.into(),
            end: end.into(),
        }
    }
}

/// One parsed invocation block.
///
/// `parse_error` is set when the block was malformed or truncated; the call
/// is still emitted and the scheduler records it as Failed.
#[derive(Clone, Debug, PartialEq)]
pub struct InvocationCall {
    /// Gadget name from the block header.
    pub gadget: String,
    /// Author-assigned id, or a minted `call-{n}` when absent.
    pub invocation_id: String,
    /// Ids this invocation waits on; forward references are legal.
    pub dependencies: Vec<String>,
    /// Parameter name → value, with `%XX` sequences decoded; on duplicates
    /// the last value wins.
    pub parameters: BTreeMap<String, String>,
    /// Diagnostics accumulated while parsing the block, when any.
    pub parse_error: Option<String>,
    /// The literal parameter region, preserved for diagnostics.
    pub raw_parameter_text: String,
}

/// Output of one `feed` / `finalize` step.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedEvent {
    Text(String),
    Call(InvocationCall),
}

/// Incremental parser over a chunked text stream.
///
/// `feed` yields a finite sequence of events per chunk; `finalize` flushes
/// the carry as text or, if a block is open, emits a single truncated call.
/// The parser is restartable: after `finalize` it can be fed again.
pub struct InvocationParser {
    delimiters: Delimiters,
    buffer: String,
    in_block: bool,
    next_auto_id: u64,
}

impl InvocationParser {
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            delimiters,
            buffer: String::new(),
            in_block: false,
            next_auto_id: 0,
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    /// Feeds one chunk of text; returns the events it completes.
    pub fn feed(&mut self, input: &str) -> Vec<ParsedEvent> {
        self.buffer.push_str(input);
        let mut out = Vec::new();
        let mut text = String::new();

        loop {
            if self.in_block {
                match self.buffer.find(&self.delimiters.end) {
                    Some(pos) => {
                        let body: String = self.buffer[..pos].to_string();
                        self.buffer
                            .replace_range(..pos + self.delimiters.end.len(), "");
                        self.in_block = false;
                        flush_text(&mut out, &mut text);
                        let call = self.parse_block(&body, false);
                        out.push(ParsedEvent::Call(call));
                    }
                    // End marker not yet seen; keep buffering the block.
                    None => break,
                }
            } else {
                match self.buffer.find(&self.delimiters.start) {
                    Some(pos) => {
                        text.push_str(&self.buffer[..pos]);
                        self.buffer
                            .replace_range(..pos + self.delimiters.start.len(), "");
                        self.in_block = true;
                        flush_text(&mut out, &mut text);
                    }
                    None => {
                        // Emit all but the longest suffix that could still
                        // grow into the start marker.
                        let keep = partial_marker_len(&self.buffer, &self.delimiters.start);
                        let emit_to = self.buffer.len() - keep;
                        if emit_to > 0 {
                            text.push_str(&self.buffer[..emit_to]);
                            self.buffer.replace_range(..emit_to, "");
                        }
                        break;
                    }
                }
            }
        }

        flush_text(&mut out, &mut text);
        out
    }

    /// Flushes terminal state: remaining carry as text, or a truncated call
    /// when a block is still open.
    pub fn finalize(&mut self) -> Vec<ParsedEvent> {
        let mut out = Vec::new();
        if self.in_block {
            let body = std::mem::take(&mut self.buffer);
            self.in_block = false;
            let call = self.parse_block(&body, true);
            out.push(ParsedEvent::Call(call));
        } else if !self.buffer.is_empty() {
            out.push(ParsedEvent::Text(std::mem::take(&mut self.buffer)));
        }
        out
    }

    /// Parses the interior of one block (between start and end markers).
    fn parse_block(&mut self, body: &str, truncated: bool) -> InvocationCall {
        let mut errors: Vec<String> = Vec::new();

        // The header line ends at the first newline or the first parameter
        // marker, whichever comes first; both forms appear in the wild.
        let newline = body.find('\n');
        let arg_at = body.find(&self.delimiters.arg);
        let (header, params_text) = match (newline, arg_at) {
            (Some(n), Some(a)) if n < a => (&body[..n], &body[n + 1..]),
            (_, Some(a)) => (&body[..a], &body[a..]),
            (Some(n), None) => (&body[..n], &body[n + 1..]),
            (None, None) => (body, ""),
        };

        let header = header.trim_end_matches('\r');
        let mut segments = header.split(':');
        let gadget = segments.next().unwrap_or("").trim().to_string();
        let id_segment = segments.next();
        let deps_segment = segments.next();
        if segments.next().is_some() {
            errors.push(format!("unrecognized header attribute in {header:?}"));
        }
        if gadget.is_empty() {
            errors.push("missing gadget name in block header".to_string());
        }

        let invocation_id = match id_segment.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                self.next_auto_id += 1;
                format!("call-{}", self.next_auto_id)
            }
        };

        let dependencies: Vec<String> = deps_segment
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let raw_parameter_text = params_text.to_string();
        let mut parameters = BTreeMap::new();
        if !params_text.is_empty() {
            let mut parts = params_text.split(&self.delimiters.arg);
            // Anything before the first parameter marker must be blank.
            if let Some(preamble) = parts.next() {
                if !preamble.trim().is_empty() {
                    errors.push(format!(
                        "unexpected content before first parameter: {:?}",
                        preamble.trim()
                    ));
                }
            }
            for part in parts {
                let (name, value) = match part.find('\n') {
                    Some(i) => (part[..i].trim(), &part[i + 1..]),
                    None => (part.trim(), ""),
                };
                // Values keep interior newlines; only the trailing one is
                // part of the framing. Percent-escapes are decoded here, so
                // gadgets see the intended literal bytes.
                let value = unescape_value(value.strip_suffix('\n').unwrap_or(value));
                if name.is_empty() {
                    errors.push("parameter with empty name".to_string());
                    continue;
                }
                if parameters.insert(name.to_string(), value).is_some() {
                    errors.push(format!("duplicate parameter {name:?}; last value wins"));
                }
            }
        }

        if truncated {
            errors.push("invocation block truncated at end of stream".to_string());
        }

        InvocationCall {
            gadget,
            invocation_id,
            dependencies,
            parameters,
            parse_error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
            raw_parameter_text,
        }
    }
}

fn flush_text(out: &mut Vec<ParsedEvent>, text: &mut String) {
    if !text.is_empty() {
        out.push(ParsedEvent::Text(std::mem::take(text)));
    }
}

/// Length of the longest proper suffix of `buffer` that is a prefix of
/// `marker`. Bounds the carry to `marker.len() - 1` bytes.
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buffer.len());
    for k in (1..=max).rev() {
        if buffer.ends_with(&marker[..k]) {
            return k;
        }
    }
    0
}
