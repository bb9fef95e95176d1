//! Live subscription endpoint (`/events` over WebSocket)

use crate::bus::BusHandle;
use crate::subscriber::{channel_sink, SubscriberId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const EVENTS_PATH: &str = "/events";

/// Accept observers until shutdown is signalled
pub(crate) async fn serve(
    listener: TcpListener,
    handle: BusHandle,
    queue_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) {
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
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, handle.clone(), queue_capacity));
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            },
        }
    }
    info!("event endpoint no longer accepting observers");
}

/// Handshake callback: only `/events` is served
fn require_events_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path == EVENTS_PATH {
        return Ok(response);
    }
    let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {path}")));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handle: BusHandle, queue_capacity: usize) {
    let socket = match tokio_tungstenite::accept_hdr_async(stream, require_events_path).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%peer, error = %err, "websocket handshake rejected");
            return;
        }
    };

    let id = SubscriberId::next();
    let (sink, outgoing) = channel_sink(queue_capacity);
    if handle.attach_with_id(id, Box::new(sink)).await.is_err() {
        debug!(%peer, "service stopped before observer could attach");
        return;
    }
    info!(%peer, subscriber = %id, "observer connected");

    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            next = outgoing.recv_async() => match next {
                Ok(payload) => {
                    if let Err(err) = write.send(Message::Text(payload)).await {
                        debug!(subscriber = %id, error = %err, "send to observer failed");
                        break;
                    }
                }
                Err(_) => {
                    // Unregistered by the pump (lagging, or the service shut down).
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                // Keepalives and client chatter are not interpreted.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(subscriber = %id, error = %err, "observer connection error");
                    break;
                }
            },
        }
    }

    handle.detach(id);
    info!(%peer, subscriber = %id, "observer disconnected");
}
