//! # Trace Event Bus
//!
//! Live, replayable trace stream of the traffic between cooperating agents
//! (MCP gateway, researcher, writer), served to visualization clients.
//!
//! ## Features
//!
//! - **Canonical envelope**: producers describe an activity, the bus infers
//!   hop, direction and transport and shapes nested A2A messages for display
//! - **Cross-context publishing**: [`Publisher`] works from plain threads and
//!   async tasks alike and never blocks
//! - **Replay**: the last N events are sent to every observer on connect
//! - **Isolated fan-out**: a slow or broken observer is dropped without
//!   affecting the others
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trace_event_bus::{BroadcastService, BusConfig, Source, Status, TraceEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = BroadcastService::new(BusConfig::default());
//!     let publisher = service.publisher();
//!     let running = service.start().await?;
//!
//!     publisher.emit(
//!         TraceEvent::builder(Source::Researcher, "openai_call", json!({"model": "gpt-4o-mini"}))
//!             .status(Status::Pending),
//!     );
//!
//!     running.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod normalize;
pub mod publisher;
pub mod replay;
pub mod server;
pub mod subscriber;

// Re-exports
pub use bus::{BackgroundService, BroadcastService, BusHandle, BusStats, RunningService, ServiceState};
pub use config::BusConfig;
pub use error::{BusError, DeliveryError};
pub use events::{
    A2aPart, A2aSchema, Direction, ErrorOrigin, EventBuilder, RoundTrip, Source, Status, TraceEvent,
    Transport,
};
pub use publisher::Publisher;
pub use replay::ReplayBuffer;
pub use server::EVENTS_PATH;
pub use subscriber::{channel_sink, ChannelSink, EventSink, SubscriberId, SubscriberRegistry};
