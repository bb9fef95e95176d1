//! Bus configuration: TOML file, then environment overrides

use crate::error::{BusError, Result};
use crate::replay::DEFAULT_REPLAY_CAPACITY;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

pub const ENV_BIND: &str = "TRACE_BUS_BIND";
pub const ENV_REPLAY_CAPACITY: &str = "TRACE_BUS_REPLAY_CAPACITY";
pub const ENV_QUEUE_CAPACITY: &str = "TRACE_BUS_QUEUE_CAPACITY";
pub const ENV_SUBSCRIBER_QUEUE_CAPACITY: &str = "TRACE_BUS_SUBSCRIBER_QUEUE_CAPACITY";

/// Publish queue capacity (events waiting for the pump)
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Per-subscriber queue capacity (serialized events waiting for the socket)
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1_024;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Address of the `/events` WebSocket endpoint
    pub bind_addr: String,
    pub replay_capacity: usize,
    pub queue_capacity: usize,
    pub subscriber_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BusError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults (or `path` when given) with `TRACE_BUS_*` overrides applied
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind_addr = bind;
        }
        if let Some(value) = lookup(ENV_REPLAY_CAPACITY) {
            self.replay_capacity = parse_count(ENV_REPLAY_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = parse_count(ENV_QUEUE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_SUBSCRIBER_QUEUE_CAPACITY) {
            self.subscriber_queue_capacity = parse_count(ENV_SUBSCRIBER_QUEUE_CAPACITY, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|_| BusError::InvalidAddress(self.bind_addr.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.replay_capacity == 0 {
            return Err(BusError::InvalidConfig("replay_capacity must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::InvalidConfig("queue_capacity must be at least 1".into()));
        }
        // A new subscriber receives the whole replay buffer in one go.
        if self.subscriber_queue_capacity < self.replay_capacity {
            return Err(BusError::InvalidConfig(format!(
                "subscriber_queue_capacity ({}) must be >= replay_capacity ({})",
                self.subscriber_queue_capacity, self.replay_capacity
            )));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| BusError::InvalidConfig(format!("{key} must be a positive integer, got '{value}'")))
}
