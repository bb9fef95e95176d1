//! Trace event envelope and producer-side builder

use crate::normalize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

// ============================================================================
// Envelope fields
// ============================================================================

/// Producer roles in the traced topology
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Mcp,
    Researcher,
    Writer,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Mcp => "MCP",
            Source::Researcher => "RESEARCHER",
            Source::Writer => "WRITER",
        }
    }

    /// Transport used when the event type says nothing more specific.
    ///
    /// The agents talk A2A over HTTP; the gateway's own bookkeeping is internal.
    pub fn default_transport(&self) -> Transport {
        match self {
            Source::Mcp => Transport::Internal,
            Source::Researcher | Source::Writer => Transport::Http,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MCP" => Ok(Source::Mcp),
            "RESEARCHER" => Ok(Source::Researcher),
            "WRITER" => Ok(Source::Writer),
            other => Err(format!("unknown event source '{other}'")),
        }
    }
}

/// Direction relative to the producing component
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Medium of the underlying interaction (rendering hint only)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Stdio,
    Websocket,
    Internal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Success,
    Error,
}

/// Where a producer-reported failure happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorOrigin {
    pub component: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorOrigin {
    pub fn new(component: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            phase: phase.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build an origin from an error, rendering its source chain as the trace text.
    pub fn from_error(
        component: impl Into<String>,
        phase: impl Into<String>,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut lines = vec![err.to_string()];
        let mut cause = err.source();
        while let Some(inner) = cause {
            lines.push(format!("caused by: {inner}"));
            cause = inner.source();
        }
        Self::new(component, phase).with_stack(lines.join("\n"))
    }

    /// Lenient projection of a loosely-typed origin object.
    ///
    /// Missing or non-string fields become empty strings (or no stack).
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_str);
        Self {
            component: field("component").unwrap_or_default().to_string(),
            phase: field("phase").unwrap_or_default().to_string(),
            stack: field("stack").map(str::to_string),
        }
    }
}

/// Display-bounded projection of a nested A2A message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct A2aSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<A2aPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct A2aPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub text: String,
}

// ============================================================================
// Envelope
// ============================================================================

/// One observed activity in the agent network.
///
/// Fully populated by [`EventBuilder::build`] and never mutated afterwards;
/// fields are only readable through accessors.
///
/// `Deserialize` is for consumers reading the `/events` stream back. It
/// trusts the wire values as sent and does not re-run inference, so
/// producers should always go through the builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    id: Uuid,
    timestamp: DateTime<Utc>,
    source: Source,
    #[serde(rename = "type")]
    event_type: String,
    hop: String,
    direction: Direction,
    transport: Transport,
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_origin: Option<ErrorOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    a2a_schema: Option<A2aSchema>,
}

impl TraceEvent {
    /// Start describing an event; see [`EventBuilder`] for the optional extras.
    pub fn builder(source: Source, event_type: impl Into<String>, data: Value) -> EventBuilder {
        EventBuilder::new(source, event_type, data)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn hop(&self) -> &str {
        &self.hop
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn error_origin(&self) -> Option<&ErrorOrigin> {
        self.error_origin.as_ref()
    }

    pub fn a2a_schema(&self) -> Option<&A2aSchema> {
        self.a2a_schema.as_ref()
    }

    /// Wire representation sent to observers
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Producer-facing description of an activity.
///
/// Everything beyond source, type and data is optional; hop, direction and
/// transport are inferred unless overridden.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    source: Source,
    event_type: String,
    data: Value,
    direction: Option<Direction>,
    transport: Option<Transport>,
    latency_ms: Option<u64>,
    status: Option<Status>,
    error_origin: Option<ErrorOrigin>,
    a2a_message: Option<Value>,
}

impl EventBuilder {
    pub fn new(source: Source, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            source,
            event_type: event_type.into(),
            data,
            direction: None,
            transport: None,
            latency_ms: None,
            status: None,
            error_origin: None,
            a2a_message: None,
        }
    }

    /// Override the direction inferred from the event type
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Override the transport inferred from the event type
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Only kept when the status is [`Status::Error`]
    pub fn error_origin(mut self, origin: ErrorOrigin) -> Self {
        self.error_origin = Some(origin);
        self
    }

    /// Raw A2A message, projected through [`normalize::normalize_a2a_message`]
    pub fn a2a_message(mut self, message: Value) -> Self {
        self.a2a_message = Some(message);
        self
    }

    pub fn build(self) -> TraceEvent {
        let direction = self
            .direction
            .unwrap_or_else(|| normalize::infer_direction(&self.event_type));
        let hop = normalize::infer_hop(self.source, &self.event_type, direction);
        let transport = self
            .transport
            .unwrap_or_else(|| normalize::infer_transport(self.source, &self.event_type));
        let a2a_schema = self
            .a2a_message
            .as_ref()
            .and_then(normalize::normalize_a2a_message);

        let error_origin = match (self.status, self.error_origin) {
            (Some(Status::Error), origin) => origin,
            (_, Some(_)) => {
                tracing::debug!(
                    event_type = %self.event_type,
                    "dropping error_origin on event without error status"
                );
                None
            }
            (_, None) => None,
        };

        let data = match self.data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        TraceEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: self.source,
            event_type: self.event_type,
            hop: hop.to_string(),
            direction,
            transport,
            data,
            latency_ms: self.latency_ms,
            status: self.status,
            error_origin,
            a2a_schema,
        }
    }
}

/// Wall-clock timer for a round trip, feeding `latency_ms` on completion events
#[derive(Debug, Clone, Copy)]
pub struct RoundTrip {
    started: Instant,
}

impl RoundTrip {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
