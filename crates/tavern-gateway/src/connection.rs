use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, error, info, warn};

use tavern_types::TavernError;
use tavern_types::events::{ClientEvent, ServerEvent, Stamped};

use crate::Gateway;
use crate::gatekeeper::ConnectionBinding;
use crate::handlers;
use crate::hub::{Outbound, SocketId};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive an admitted connection until it closes, then remove it from its room.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, binding: ConnectionBinding) {
    let (socket_id, mut outbound) = match gateway.attach(binding.clone()).await {
        Ok(attached) => attached,
        Err(e) => {
            refuse(socket, e).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    info!(
        "{} ({}) connected to session {} as socket {}",
        binding.user.name, binding.user.id, binding.session_id, socket_id
    );

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Hub messages -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                next = outbound.recv() => {
                    match next {
                        Some(Outbound::Text(text)) => {
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame { code, reason: Utf8Bytes::from_static(reason) };
                            let _ = sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping socket {}", missed_heartbeats, socket_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client events -> handlers
    let recv_gateway = gateway.clone();
    let recv_binding = binding.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    dispatch(&recv_gateway, socket_id, &recv_binding, text.as_str()).await;
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.detach(socket_id).await;
    info!(
        "{} ({}) disconnected from session {}",
        binding.user.name, binding.user.id, binding.session_id
    );
}

/// Parse and apply one text frame, reporting any failure back to the sender.
async fn dispatch(gateway: &Gateway, socket_id: SocketId, binding: &ConnectionBinding, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                "{} ({}) bad event: {} -- raw: {}",
                binding.user.name,
                binding.user.id,
                e,
                truncate(text, 200)
            );
            let err = TavernError::validation_with("Malformed event", json!({ "reason": e.to_string() }));
            report(gateway, socket_id, binding, err).await;
            return;
        }
    };

    if let Err(err) = handlers::handle(gateway, socket_id, binding, event).await {
        report(gateway, socket_id, binding, err).await;
    }
}

async fn report(gateway: &Gateway, socket_id: SocketId, binding: &ConnectionBinding, err: TavernError) {
    if err.is_intern() {
        error!(
            "Internal error for {} ({}) in session {}: {}",
            binding.user.name, binding.user.id, binding.session_id, err
        );
    } else {
        debug!("Event rejected for {} ({}): {}", binding.user.name, binding.user.id, err);
    }

    let event = ServerEvent::Error(Stamped::now(err.to_payload()));
    gateway.hub.emit_to(socket_id, &event).await;
}

/// Tell a client why its connection was refused, then close. The socket never
/// joins a room.
pub async fn refuse(mut socket: WebSocket, err: TavernError) {
    if err.is_intern() {
        error!("Connection refused with internal error: {}", err);
    } else {
        warn!("Connection refused ({}): {}", err.status(), err);
    }

    let event = ServerEvent::ConnectError(Stamped::now(err.to_payload()));
    match serde_json::to_string(&event) {
        Ok(json) => {
            if socket.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => error!("Failed to serialize connect_error: {}", e),
    }

    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("Connection refused"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
