//! Percent-encoding for parameter values and the inverse formatter.
//!
//! A value containing a delimiter or a framing newline must be quoted by
//! whoever renders the block. The convention is `%` hex-encoding: `%`,
//! `\n`, and the first byte of any delimiter occurrence are escaped by
//! [`escape_value`]; the parser decodes `%XX` sequences with
//! [`unescape_value`] while building `InvocationCall.parameters`, so
//! gadgets always see the intended literal bytes.

use std::collections::BTreeMap;

use super::{Delimiters, InvocationCall};

/// Escapes a parameter value so it cannot collide with the framing.
pub fn escape_value(value: &str, delimiters: &Delimiters) -> String {
    let markers = [
        delimiters.start.as_str(),
        delimiters.arg.as_str(),
        delimiters.end.as_str(),
    ];
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    'outer: while !rest.is_empty() {
        for marker in markers {
            if !marker.is_empty() && rest.starts_with(marker) {
                // Escaping the first byte breaks the marker; the remainder
                // is then ordinary text.
                let first = marker.as_bytes()[0];
                out.push_str(&format!("%{first:02X}"));
                rest = &rest[1..];
                continue 'outer;
            }
        }
        let ch = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };
        match ch {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Decodes `%XX` sequences produced by [`escape_value`]. Sequences that are
/// not two hex digits are kept literal.
pub fn unescape_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(s) = std::str::from_utf8(hex) {
                    if let Ok(b) = u8::from_str_radix(s, 16) {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Renders a call back to the wire grammar, escaping parameter values.
///
/// Useful for prompt builders that show the model worked examples, and for
/// tests that feed synthesized streams back through the parser.
pub fn format_invocation(call: &InvocationCall, delimiters: &Delimiters) -> String {
    let mut s = String::new();
    s.push_str(&delimiters.start);
    s.push_str(&call.gadget);
    s.push(':');
    s.push_str(&call.invocation_id);
    if !call.dependencies.is_empty() {
        s.push(':');
        s.push_str(&call.dependencies.join(","));
    }
    s.push('\n');
    for (name, value) in &call.parameters {
        s.push_str(&delimiters.arg);
        s.push_str(name);
        s.push('\n');
        s.push_str(&escape_value(value, delimiters));
        s.push('\n');
    }
    s.push_str(&delimiters.end);
    s
}

/// Convenience for building a call by hand (tests, prompt examples).
pub fn call(
    gadget: &str,
    id: &str,
    dependencies: &[&str],
    parameters: &[(&str, &str)],
) -> InvocationCall {
    InvocationCall {
        gadget: gadget.to_string(),
        invocation_id: id.to_string(),
        dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
        parameters: parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        parse_error: None,
        raw_parameter_text: String::new(),
    }
}
