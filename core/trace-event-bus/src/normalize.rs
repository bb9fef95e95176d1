//! Hop, direction and transport inference plus A2A payload shaping
//!
//! Everything here is pure and total: unexpected input falls back to a
//! default value, never an error.

use crate::events::{A2aPart, A2aSchema, Direction, Source, Transport};
use serde_json::{Map, Value};

/// Hop label for any `(source, type, direction)` outside the table
pub const UNKNOWN_HOP: &str = "unknown";

/// Longest A2A part text kept before truncation (in characters)
pub const MAX_PART_TEXT_CHARS: usize = 200;

pub const TRUNCATION_MARKER: &str = "...";

/// Response types that arrive *from* an upstream dependency rather than
/// being sent back to a caller.
const UPSTREAM_RESPONSE_TYPES: &[&str] = &["openai_response"];

/// Logical edges of the traced topology
const HOP_TABLE: &[(Source, &str, Direction, &str)] = &[
    (Source::Writer, "rpc_request", Direction::In, "researcher→writer"),
    (Source::Writer, "rpc_response", Direction::Out, "writer→researcher"),
    (Source::Writer, "openai_call", Direction::Out, "writer→openai"),
    (Source::Writer, "openai_response", Direction::In, "openai→writer"),
    (Source::Researcher, "rpc_request", Direction::In, "mcp→researcher"),
    (Source::Researcher, "rpc_response", Direction::Out, "researcher→mcp"),
    (Source::Researcher, "openai_call", Direction::Out, "researcher→openai"),
    (Source::Researcher, "openai_response", Direction::In, "openai→researcher"),
    (Source::Researcher, "a2a_outgoing", Direction::Out, "researcher→writer"),
    (Source::Researcher, "a2a_incoming", Direction::In, "writer→researcher"),
    (Source::Mcp, "mcp_tool_call", Direction::In, "client→mcp"),
    (Source::Mcp, "a2a_outgoing_from_mcp", Direction::Out, "mcp→researcher"),
    (Source::Mcp, "a2a_incoming_at_mcp", Direction::In, "researcher→mcp"),
    (Source::Mcp, "mcp_tool_result", Direction::Out, "mcp→client"),
];

pub fn infer_hop(source: Source, event_type: &str, direction: Direction) -> &'static str {
    HOP_TABLE
        .iter()
        .find(|(s, t, d, _)| *s == source && *t == event_type && *d == direction)
        .map(|(_, _, _, hop)| *hop)
        .unwrap_or(UNKNOWN_HOP)
}

/// Direction by naming convention.
///
/// `request`/`incoming` are inbound. A `response` is inbound only when it
/// comes back from an upstream dependency (the LLM); a response the
/// producer sends to its own caller is outbound. Everything else is outbound.
pub fn infer_direction(event_type: &str) -> Direction {
    if event_type.contains("request") || event_type.contains("incoming") {
        Direction::In
    } else if event_type.contains("response") {
        if UPSTREAM_RESPONSE_TYPES.contains(&event_type) {
            Direction::In
        } else {
            Direction::Out
        }
    } else {
        Direction::Out
    }
}

pub fn infer_transport(source: Source, event_type: &str) -> Transport {
    if event_type.starts_with("openai_") {
        Transport::Http
    } else if event_type.starts_with("mcp_tool_") {
        Transport::Stdio
    } else if event_type.starts_with("a2a_") || event_type.starts_with("rpc_") {
        Transport::Http
    } else {
        source.default_transport()
    }
}

/// Cap `text` at [`MAX_PART_TEXT_CHARS`] characters, marking the cut.
pub fn truncate_text(text: &str) -> String {
    match text.char_indices().nth(MAX_PART_TEXT_CHARS) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Project a raw A2A message to `{message_id, role, parts[]}`.
///
/// Returns `None` for null, non-object or empty messages.
pub fn normalize_a2a_message(message: &Value) -> Option<A2aSchema> {
    let message = message.as_object().filter(|m| !m.is_empty())?;

    let parts = message
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().map(normalize_part).collect())
        .unwrap_or_default();

    Some(A2aSchema {
        message_id: string_field(message, &["messageId", "message_id"]),
        role: string_field(message, &["role"]),
        parts,
    })
}

fn normalize_part(part: &Value) -> A2aPart {
    A2aPart {
        kind: part.get("kind").and_then(Value::as_str).map(str::to_string),
        text: part
            .get("text")
            .and_then(Value::as_str)
            .map(truncate_text)
            .unwrap_or_default(),
    }
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
