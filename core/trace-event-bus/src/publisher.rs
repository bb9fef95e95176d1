//! Producer-side entry point into the bus

use crate::bus::{Command, ServiceState, Shared};
use crate::events::{EventBuilder, TraceEvent};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands events to the broadcast service from any thread or task.
///
/// Never blocks and never fails: when the service queue is full or the
/// service is gone the event is dropped and logged.
#[derive(Clone)]
pub struct Publisher {
    tx: flume::Sender<Command>,
    shared: Arc<Shared>,
}

impl Publisher {
    pub(crate) fn new(tx: flume::Sender<Command>, shared: Arc<Shared>) -> Self {
        Self { tx, shared }
    }

    /// A publisher not attached to any service; every event is discarded.
    ///
    /// Lets producers run with tracing switched off without branching.
    pub fn disconnected() -> Self {
        let (tx, _) = flume::bounded(1);
        Self::new(tx, Arc::new(Shared::default()))
    }

    pub(crate) fn sender(&self) -> &flume::Sender<Command> {
        &self.tx
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    /// Queue an event for delivery
    pub fn publish(&self, event: TraceEvent) {
        let event_id = event.id();
        match self.tx.try_send(Command::Publish(event)) {
            Ok(()) => {
                if self.state() != ServiceState::Running {
                    debug!(%event_id, "event queued before service is running");
                }
            }
            Err(flume::TrySendError::Full(_)) => {
                self.shared.record_drop();
                warn!(%event_id, capacity = ?self.tx.capacity(), "event queue full, dropping event");
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                self.shared.record_drop();
                debug!(%event_id, "no broadcast service, dropping event");
            }
        }
    }

    /// Build an event from a producer description and publish it.
    ///
    /// Returns the id assigned to the event.
    pub fn emit(&self, builder: EventBuilder) -> Uuid {
        let event = builder.build();
        let id = event.id();
        self.publish(event);
        id
    }
}
