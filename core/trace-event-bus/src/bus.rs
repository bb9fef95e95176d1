//! Broadcast service: delivery pump, replay buffer and subscriber registry

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::events::TraceEvent;
use crate::publisher::Publisher;
use crate::replay::ReplayBuffer;
use crate::server;
use crate::subscriber::{EventSink, SubscriberId, SubscriberRegistry};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task;
use tracing::{debug, info, warn};

/// Lifecycle of a [`BroadcastService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            _ => ServiceState::Stopped,
        }
    }
}

/// Counters reported by [`BusHandle::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Events taken off the queue by the pump
    pub published: u64,
    /// Successful per-subscriber deliveries
    pub delivered: u64,
    /// Events dropped at publish time (queue full or service gone)
    pub dropped: u64,
    /// Subscribers removed after a failed delivery or backfill
    pub failed_subscribers: u64,
    pub subscribers: usize,
    pub buffered: usize,
}

/// Requests routed into the pump; the only way to touch buffer or registry
pub(crate) enum Command {
    Publish(TraceEvent),
    Subscribe {
        id: SubscriberId,
        sink: Box<dyn EventSink>,
    },
    Unsubscribe(SubscriberId),
    Snapshot(oneshot::Sender<Vec<TraceEvent>>),
    Stats(oneshot::Sender<BusStats>),
}

/// State visible from every context holding a handle
#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: AtomicU8,
    dropped: AtomicU64,
}

impl Shared {
    pub(crate) fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable access to a broadcast service from any context
#[derive(Clone)]
pub struct BusHandle {
    publisher: Publisher,
}

impl BusHandle {
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Shorthand for `publisher().publish(event)`
    pub fn publish(&self, event: TraceEvent) {
        self.publisher.publish(event);
    }

    pub fn state(&self) -> ServiceState {
        self.publisher.state()
    }

    /// Register an in-process observer; it is backfilled from the replay buffer first
    pub async fn attach(&self, sink: Box<dyn EventSink>) -> Result<SubscriberId> {
        let id = SubscriberId::next();
        self.attach_with_id(id, sink).await?;
        Ok(id)
    }

    pub(crate) async fn attach_with_id(&self, id: SubscriberId, sink: Box<dyn EventSink>) -> Result<()> {
        self.publisher
            .sender()
            .send_async(Command::Subscribe { id, sink })
            .await
            .map_err(|_| BusError::ServiceStopped)
    }

    /// Remove an observer; a no-op if it is already gone
    pub fn detach(&self, id: SubscriberId) {
        if self.publisher.sender().try_send(Command::Unsubscribe(id)).is_err() {
            // A sink left behind fails on its next delivery and is removed then.
            debug!(subscriber = %id, "detach not queued");
        }
    }

    /// Replay buffer contents, oldest first.
    ///
    /// Answered by the pump, so it resolves only once the service is running.
    pub async fn snapshot(&self) -> Result<Vec<TraceEvent>> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Snapshot(reply)).await?;
        response.await.map_err(|_| BusError::ServiceStopped)
    }

    pub async fn stats(&self) -> Result<BusStats> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Stats(reply)).await?;
        response.await.map_err(|_| BusError::ServiceStopped)
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.publisher
            .sender()
            .send_async(command)
            .await
            .map_err(|_| BusError::ServiceStopped)
    }
}

/// Single consumer of the command queue; owns buffer and registry
struct Pump {
    buffer: ReplayBuffer,
    registry: SubscriberRegistry,
    stats: BusStats,
    shared: Arc<Shared>,
}

impl Pump {
    fn new(replay_capacity: usize, shared: Arc<Shared>) -> Self {
        Self {
            buffer: ReplayBuffer::new(replay_capacity),
            registry: SubscriberRegistry::new(),
            stats: BusStats::default(),
            shared,
        }
    }

    async fn run(mut self, commands: flume::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        debug!(pending = commands.len(), "delivery pump started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                command = commands.recv_async() => match command {
                    Ok(command) => self.handle(command),
                    Err(_) => break,
                },
            }
        }

        // Queued commands outlive the receiver while any publisher exists,
        // so pending subscribe requests must be dropped here to close their sinks.
        let undelivered = commands.drain().count();
        info!(
            subscribers = self.registry.len(),
            undelivered,
            "delivery pump stopped"
        );
        // Dropping the registry closes every subscriber's queue.
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Publish(event) => {
                self.stats.published += 1;
                let report = self.registry.deliver(&event);
                self.stats.delivered += report.delivered as u64;
                self.stats.failed_subscribers += report.failed.len() as u64;
                debug!(
                    event_id = %event.id(),
                    event_type = event.event_type(),
                    hop = event.hop(),
                    delivered = report.delivered,
                    "event fanned out"
                );
                self.buffer.append(event);
            }
            Command::Subscribe { id, sink } => {
                match self.registry.register(id, sink, self.buffer.iter()) {
                    Ok(()) => info!(
                        subscriber = %id,
                        replayed = self.buffer.len(),
                        total = self.registry.len(),
                        "subscriber attached"
                    ),
                    Err(err) => {
                        self.stats.failed_subscribers += 1;
                        warn!(subscriber = %id, error = %err, "replay to new subscriber failed");
                    }
                }
            }
            Command::Unsubscribe(id) => {
                if self.registry.unregister(id) {
                    info!(subscriber = %id, remaining = self.registry.len(), "subscriber detached");
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.buffer.snapshot());
            }
            Command::Stats(reply) => {
                let stats = BusStats {
                    dropped: self.shared.dropped_count(),
                    subscribers: self.registry.len(),
                    buffered: self.buffer.len(),
                    ..self.stats.clone()
                };
                let _ = reply.send(stats);
            }
        }
    }
}

/// Owner of the live `/events` endpoint and the delivery pump.
///
/// Construct once per process, hand [`Publisher`]s to producers, then
/// [`start`](Self::start) it. Events published before that are queued and
/// land in the replay buffer once the pump runs.
pub struct BroadcastService {
    config: BusConfig,
    commands: flume::Receiver<Command>,
    handle: BusHandle,
    shared: Arc<Shared>,
}

impl BroadcastService {
    pub fn new(config: BusConfig) -> Self {
        let (tx, commands) = flume::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let handle = BusHandle {
            publisher: Publisher::new(tx, shared.clone()),
        };

        Self {
            config,
            commands,
            handle,
            shared,
        }
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn publisher(&self) -> Publisher {
        self.handle.publisher()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    /// Bind the endpoint and spawn pump and listener on the current runtime
    pub async fn start(self) -> Result<RunningService> {
        self.config.validate()?;
        self.shared.set_state(ServiceState::Starting);

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.set_state(ServiceState::Stopped);
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pump = Pump::new(self.config.replay_capacity, self.shared.clone());
        let pump_task = task::spawn(pump.run(self.commands, shutdown_rx.clone()));
        let server_task = task::spawn(server::serve(
            listener,
            self.handle.clone(),
            self.config.subscriber_queue_capacity,
            shutdown_rx,
        ));

        self.shared.set_state(ServiceState::Running);
        info!(%local_addr, path = server::EVENTS_PATH, "trace event bus running");

        Ok(RunningService {
            local_addr,
            handle: self.handle,
            shared: self.shared,
            shutdown_tx,
            pump_task,
            server_task,
        })
    }

    /// Run on a dedicated thread with its own single-threaded runtime.
    ///
    /// Blocks until the endpoint is bound (or failed to bind).
    pub fn spawn_background(self) -> Result<BackgroundService> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BusError::Runtime)?;
        let handle = self.handle();
        let (ready_tx, ready_rx) = flume::bounded::<Result<SocketAddr>>(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("trace-event-bus".into())
            .spawn(move || {
                runtime.block_on(async move {
                    match self.start().await {
                        Ok(running) => {
                            let _ = ready_tx.send(Ok(running.local_addr()));
                            let _ = stop_rx.await;
                            running.shutdown().await;
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                        }
                    }
                });
            })?;

        let local_addr = ready_rx.recv().map_err(|_| {
            BusError::Runtime(std::io::Error::other("event bus thread exited during startup"))
        })??;
        info!(%local_addr, "trace event bus running in background thread");

        Ok(BackgroundService {
            local_addr,
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.socket_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| BusError::Bind { addr, source })
    }
}

/// A started service on the caller's runtime
pub struct RunningService {
    local_addr: SocketAddr,
    handle: BusHandle,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    pump_task: task::JoinHandle<()>,
    server_task: task::JoinHandle<()>,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn publisher(&self) -> Publisher {
        self.handle.publisher()
    }

    /// Stop accepting observers and tear down the pump.
    ///
    /// Queued events are not drained; open connections are closed.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.server_task.await {
            warn!(error = %err, "event endpoint task failed");
        }
        if let Err(err) = self.pump_task.await {
            warn!(error = %err, "delivery pump task failed");
        }
        self.shared.set_state(ServiceState::Stopped);
        info!("trace event bus stopped");
    }
}

/// A service running on its own thread, see [`BroadcastService::spawn_background`]
pub struct BackgroundService {
    local_addr: SocketAddr,
    handle: BusHandle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn publisher(&self) -> Publisher {
        self.handle.publisher()
    }

    /// Stop the service and wait for its thread to exit
    pub fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("event bus thread panicked");
            }
        }
    }
}

impl Drop for BackgroundService {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Source;
    use crate::subscriber::channel_sink;
    use crate::subscriber::testing::RecordingSink;
    use serde_json::json;

    fn test_config() -> BusConfig {
        BusConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..BusConfig::default()
        }
    }

    fn numbered(n: u64) -> TraceEvent {
        TraceEvent::builder(Source::Researcher, "openai_call", json!({ "n": n })).build()
    }

    fn ns(events: &[TraceEvent]) -> Vec<u64> {
        events.iter().map(|e| e.data()["n"].as_u64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let service = BroadcastService::new(test_config());
        let publisher = service.publisher();
        assert_eq!(service.state(), ServiceState::Stopped);

        let running = service.start().await.unwrap();
        assert_eq!(publisher.state(), ServiceState::Running);

        running.shutdown().await;
        assert_eq!(publisher.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_publish_before_start_is_retained() {
        let service = BroadcastService::new(test_config());
        let publisher = service.publisher();
        for n in 1..=3 {
            publisher.publish(numbered(n));
        }

        let running = service.start().await.unwrap();
        let snapshot = running.handle().snapshot().await.unwrap();
        assert_eq!(ns(&snapshot), vec![1, 2, 3]);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_holds_last_100_of_150() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let publisher = running.publisher();
        for n in 1..=150 {
            publisher.publish(numbered(n));
        }

        let snapshot = running.handle().snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(ns(&snapshot), (51..=150).collect::<Vec<_>>());

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscriber_gets_snapshot_then_live_events() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let handle = running.handle();
        handle.publish(numbered(1));
        handle.publish(numbered(2));

        let sink = RecordingSink::default();
        handle.attach(Box::new(sink.clone())).await.unwrap();
        handle.publish(numbered(3));
        handle.publish(numbered(4));

        // Round trip through the pump so everything before it is processed.
        handle.snapshot().await.unwrap();
        assert_eq!(ns(&sink.received()), vec![1, 2, 3, 4]);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_subscriber_removed_healthy_one_still_served() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let handle = running.handle();

        let first = RecordingSink::default();
        handle.attach(Box::new(first.clone())).await.unwrap();
        handle.publish(numbered(1));

        first.break_connection();
        let second = RecordingSink::default();
        handle.attach(Box::new(second.clone())).await.unwrap();
        handle.publish(numbered(2));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.failed_subscribers, 1);
        assert_eq!(ns(&first.received()), vec![1]);
        assert_eq!(ns(&second.received()), vec![1, 2]);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let handle = running.handle();

        let sink = RecordingSink::default();
        let id = handle.attach(Box::new(sink.clone())).await.unwrap();
        handle.publish(numbered(1));
        handle.detach(id);
        handle.publish(numbered(2));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.failed_subscribers, 0);
        assert_eq!(ns(&sink.received()), vec![1]);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_their_own_order() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();

        let producers: Vec<_> = (0..4u64)
            .map(|producer| {
                let publisher = running.publisher();
                std::thread::spawn(move || {
                    for seq in 0..25u64 {
                        publisher.publish(numbered(producer * 100 + seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let snapshot = running.handle().snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 100);
        for producer in 0..4u64 {
            let seen: Vec<u64> = ns(&snapshot)
                .into_iter()
                .filter(|n| n / 100 == producer)
                .collect();
            assert_eq!(seen, (0..25).map(|seq| producer * 100 + seq).collect::<Vec<_>>());
        }

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let config = BusConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let service = BroadcastService::new(config);
        let publisher = service.publisher();
        for n in 1..=5 {
            publisher.publish(numbered(n));
        }

        let running = service.start().await.unwrap();
        let stats = running.handle().stats().await.unwrap();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.buffered, 2);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_harmless() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let handle = running.handle();
        running.shutdown().await;

        handle.publish(numbered(1));
        assert!(matches!(handle.stats().await, Err(BusError::ServiceStopped)));
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let first = BroadcastService::new(test_config()).start().await.unwrap();
        let taken = BusConfig {
            bind_addr: first.local_addr().to_string(),
            ..BusConfig::default()
        };

        let service = BroadcastService::new(taken);
        let handle = service.handle();
        assert!(matches!(service.start().await, Err(BusError::Bind { .. })));
        assert_eq!(handle.state(), ServiceState::Stopped);

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_replay_larger_than_subscriber_queue() {
        let config = BusConfig {
            replay_capacity: 2_000,
            subscriber_queue_capacity: 1_024,
            ..test_config()
        };

        let service = BroadcastService::new(config);
        let handle = service.handle();
        assert!(matches!(service.start().await, Err(BusError::InvalidConfig(_))));
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriber_attached_just_before() {
        let running = BroadcastService::new(test_config()).start().await.unwrap();
        let handle = running.handle();
        let (sink, rx) = channel_sink(1_024);
        handle.attach(Box::new(sink)).await.unwrap();

        running.shutdown().await;

        let closed = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv_async()).await;
        assert!(
            matches!(closed, Ok(Err(flume::RecvError::Disconnected))),
            "subscriber queue stayed open after shutdown"
        );
        drop(handle);
    }

    #[test]
    fn test_background_service_accepts_publishes_from_plain_threads() {
        let service = BroadcastService::new(test_config());
        let publisher = service.publisher();
        publisher.publish(numbered(1));

        let background = service.spawn_background().unwrap();
        assert_eq!(publisher.state(), ServiceState::Running);
        publisher.publish(numbered(2));

        let handle = background.handle();
        let snapshot = tokio_test::block_on(handle.snapshot()).unwrap();
        assert_eq!(ns(&snapshot), vec![1, 2]);

        background.shutdown();
        assert_eq!(publisher.state(), ServiceState::Stopped);
    }
}
