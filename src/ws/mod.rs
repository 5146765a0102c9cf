pub mod handlers;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Extension,
};
use futures::{
    sink::{Sink, SinkExt},
    stream::{Stream, StreamExt},
};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

use crate::abuse::ConnectionSlot;
use crate::error::DeliveryError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{DeliverySink, Relay};
use crate::types::{ConnectionId, Signal};

/// Delivery sink backed by a connection's bounded outbound queue
pub struct OutboundSink {
    tx: mpsc::Sender<Arc<Signal>>,
}

impl OutboundSink {
    pub fn new(tx: mpsc::Sender<Arc<Signal>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl DeliverySink for OutboundSink {
    async fn deliver(&self, signal: Arc<Signal>) -> Result<(), DeliveryError> {
        self.tx.send(signal).await.map_err(|_| DeliveryError::Closed)
    }
}

/// WebSocket upgrade handler. The slot reserved by the connection limit
/// middleware is held until the socket closes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
    Extension(slot): Extension<ConnectionSlot>,
) -> impl IntoResponse {
    tracing::debug!("WebSocket connection request");
    ws.max_message_size(relay.config.max_frame_bytes())
        .on_upgrade(move |socket| handle_socket(socket, relay, slot))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, _slot: ConnectionSlot) {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, relay).await;
}

/// Drive one client transport: inbound frames in order, outbound signals as
/// they arrive. Returns once the client closes, errors or leaves; by then the
/// connection is gone from the registry and its channel.
pub async fn serve_connection<S, R, E>(mut sender: S, mut receiver: R, relay: Arc<Relay>)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let (tx, mut outbound_rx) = mpsc::channel(relay.config.outbound_buffer);
    let conn = relay.sessions.open(Arc::new(OutboundSink::new(tx))).await;

    if !send_frame(&mut sender, &ServerMessage::welcome(conn)).await {
        tracing::error!("Failed to send welcome message to {}", conn);
        close_connection(&relay, conn).await;
        return;
    }

    loop {
        tokio::select! {
            Some(signal) = outbound_rx.recv() => {
                if !send_frame(&mut sender, &ServerMessage::from(signal.as_ref())).await {
                    break;
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("Received message from {}: {}", conn, text.as_str());

                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                let leaving = matches!(client_msg, ClientMessage::Leave);
                                if let Some(response) =
                                    handlers::handle_message(client_msg, conn, &relay).await
                                {
                                    if !send_frame(&mut sender, &response).await {
                                        tracing::error!("Failed to send response to {}", conn);
                                        break;
                                    }
                                }
                                if leaving {
                                    let _ = sender.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to parse message from {}: {}", conn, e);
                                let error = ServerMessage::Error {
                                    code: "MALFORMED_EVENT".to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                };
                                send_frame(&mut sender, &error).await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let error = ServerMessage::Error {
                            code: "MALFORMED_EVENT".to_string(),
                            msg: "Binary frames are not supported".to_string(),
                        };
                        send_frame(&mut sender, &error).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!("WebSocket {} closed by client", conn);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error on {}: {}", conn, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Anything still queued for this socket is dropped
    outbound_rx.close();
    close_connection(&relay, conn).await;
}

/// Serialize and send one JSON text frame. False once the transport is gone.
async fn send_frame<S>(sender: &mut S, msg: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize outbound frame: {}", e);
            true
        }
    }
}

async fn close_connection(relay: &Relay, conn: ConnectionId) {
    relay.sessions.disconnect(conn).await;
    if let Some(limiter) = &relay.signal_limiter {
        limiter.forget(conn).await;
    }
}
