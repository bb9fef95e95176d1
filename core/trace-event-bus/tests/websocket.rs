//! End-to-end tests of the `/events` endpoint

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use trace_event_bus::{
    BroadcastService, BusConfig, Direction, RunningService, Source, Status, TraceEvent, Transport,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start(replay_capacity: usize) -> RunningService {
    let config = BusConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        replay_capacity,
        ..BusConfig::default()
    };
    BroadcastService::new(config).start().await.unwrap()
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/events")).await.unwrap();
    client
}

async fn next_event(client: &mut Client) -> TraceEvent {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn numbered(n: u64) -> TraceEvent {
    TraceEvent::builder(Source::Writer, "openai_call", json!({ "n": n })).build()
}

fn n(event: &TraceEvent) -> u64 {
    event.data()["n"].as_u64().unwrap()
}

#[tokio::test]
async fn test_new_observer_gets_replay_then_live_events() {
    let running = start(100).await;
    let publisher = running.publisher();
    for i in 1..=3 {
        publisher.publish(numbered(i));
    }

    let mut client = connect(running.local_addr()).await;
    for expected in 1..=3 {
        assert_eq!(n(&next_event(&mut client).await), expected);
    }

    publisher.publish(numbered(4));
    assert_eq!(n(&next_event(&mut client).await), 4);

    running.shutdown().await;
}

#[tokio::test]
async fn test_replay_is_bounded() {
    let running = start(5).await;
    let publisher = running.publisher();
    for i in 1..=8 {
        publisher.publish(numbered(i));
    }
    // Wait until the pump has consumed everything.
    running.handle().snapshot().await.unwrap();

    let mut client = connect(running.local_addr()).await;
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(n(&next_event(&mut client).await));
    }
    assert_eq!(seen, vec![4, 5, 6, 7, 8]);

    publisher.publish(numbered(9));
    assert_eq!(n(&next_event(&mut client).await), 9);

    running.shutdown().await;
}

#[tokio::test]
async fn test_wire_format_round_trips() {
    let running = start(100).await;
    let mut client = connect(running.local_addr()).await;

    let sent = TraceEvent::builder(Source::Researcher, "openai_response", json!({"tokens": 42}))
        .latency_ms(1200)
        .status(Status::Success)
        .build();
    running.publisher().publish(sent.clone());

    let received = next_event(&mut client).await;
    assert_eq!(received, sent);
    assert_eq!(received.direction(), Direction::In);
    assert_eq!(received.hop(), "openai→researcher");
    assert_eq!(received.transport(), Transport::Http);

    running.shutdown().await;
}

#[tokio::test]
async fn test_dropped_observer_does_not_affect_others() {
    let running = start(100).await;
    let handle = running.handle();

    let gone = connect(running.local_addr()).await;
    let mut healthy = connect(running.local_addr()).await;
    drop(gone);

    handle.publish(numbered(1));
    assert_eq!(n(&next_event(&mut healthy).await), 1);

    timeout(WAIT, async {
        loop {
            if handle.stats().await.unwrap().subscribers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("disconnected observer was never removed");

    handle.publish(numbered(2));
    assert_eq!(n(&next_event(&mut healthy).await), 2);

    running.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_rejected() {
    let running = start(100).await;

    let result = connect_async(format!("ws://{}/ws", running.local_addr())).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        Err(other) => panic!("expected HTTP 404, got {other}"),
        Ok(_) => panic!("handshake on an unknown path succeeded"),
    }

    running.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_observers() {
    let running = start(100).await;
    let mut client = connect(running.local_addr()).await;
    running.publisher().publish(numbered(1));
    assert_eq!(n(&next_event(&mut client).await), 1);

    running.shutdown().await;

    let closed = timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "observer connection stayed open after shutdown");
}
