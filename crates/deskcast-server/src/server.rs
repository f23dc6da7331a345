//! WebSocket transport.
//!
//! Both listeners serve the same router: `GET /` answers a plain-text
//! health line, `GET /ws` upgrades to the session socket. Control traffic
//! is text, media is binary. Each session gets an inbound reader (this
//! module) and a socket writer task fed through the session's submit
//! queue; a write stalled past the send budget marks the session closed
//! and the reader's eventual failure removes it from the registry.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::control::ControlPlane;
use crate::fanout::SEND_TIMEOUT;
use crate::registry::{ClientRegistry, ClientSession, Outbound};

/// Messages a session's writer queue holds before fan-out sends start
/// eating the timeout budget (about one second of video).
const SESSION_QUEUE_DEPTH: usize = 64;

/// Shared state behind both listeners.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub control: Arc<ControlPlane>,
    pub encoder_name: watch::Receiver<String>,
}

/// Build the router served on both ports.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Plain-text health line.
async fn health(State(state): State<AppState>) -> String {
    health_line(&state.encoder_name.borrow(), state.registry.len())
}

fn health_line(encoder: &str, clients: usize) -> String {
    format!("deskcast-server ok encoder={encoder} clients={clients}")
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// One connected viewer: register, spawn the writer, pump inbound control
/// messages until the socket dies.
async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (submit, outbound) = mpsc::channel(SESSION_QUEUE_DEPTH);
    let session = match state.registry.register(submit) {
        Ok(session) => session,
        Err(e) => {
            tracing::info!(%e, "refusing viewer");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: Cow::from(e.to_string()),
                })))
                .await;
            return;
        }
    };

    let writer = tokio::spawn(writer_task(sink, outbound, Arc::clone(&session)));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => state.control.handle(&session, &text),
            // Media is strictly server -> client.
            Ok(Message::Binary(_)) => {
                tracing::trace!(session = session.id, "unexpected binary from viewer");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                tracing::debug!(session = session.id, error = %e, "socket read failed");
                break;
            }
        }
    }

    state.registry.remove(session.id);
    let _ = session.submit_timed(Outbound::Close, SEND_TIMEOUT).await;
    let _ = writer.await;
}

/// Drain the session's queue onto the socket, enforcing the per-send
/// budget so one stuck viewer cannot pin the connection task.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    session: Arc<ClientSession>,
) {
    while let Some(message) = outbound.recv().await {
        let message = match message {
            Outbound::Media(bytes) => Message::Binary(bytes.to_vec()),
            Outbound::Control(text) => Message::Text(text),
            Outbound::Close => break,
        };

        match tokio::time::timeout(SEND_TIMEOUT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session = session.id, error = %e, "socket write failed");
                session.mark_closed();
                return;
            }
            Err(_) => {
                tracing::warn!(session = session.id, "socket write stalled, closing");
                session.mark_closed();
                return;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
