//! Error types for the trace event bus

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced while configuring or starting the bus.
///
/// Nothing reachable from normal publishing or fan-out produces one of
/// these; those paths degrade and log instead.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to bind event endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("broadcast service is not running")]
    ServiceStopped,

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to hand an event to a single subscriber.
///
/// Always isolated to that subscriber: the registry unregisters it and
/// carries on with the rest of the fan-out pass.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,

    #[error("subscriber queue full ({capacity} pending)")]
    Lagging { capacity: usize },

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
