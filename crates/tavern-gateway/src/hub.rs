use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{CloseCode, Utf8Bytes};
use tokio::sync::{RwLock, mpsc};
use tracing::{error, trace};
use uuid::Uuid;

use tavern_types::events::ServerEvent;

use crate::gatekeeper::ConnectionBinding;

pub type SocketId = Uuid;

/// Close code sent to a socket replaced by a newer connection of the same user.
pub const CLOSE_REPLACED: CloseCode = 4001;
/// Close code sent to every socket of a user who logged out.
pub const CLOSE_LOGGED_OUT: CloseCode = 4002;

/// What the hub hands to a connection's send task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Utf8Bytes),
    Close { code: CloseCode, reason: &'static str },
}

/// A socket removed from the hub, with what its room looks like afterwards.
#[derive(Debug, Clone)]
pub struct Departure {
    pub binding: ConnectionBinding,
    pub remaining: usize,
}

/// Live sockets grouped into rooms, one room per session.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubState>>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<SocketId, Peer>,
    /// session_id -> sockets in join order
    rooms: HashMap<i64, Vec<SocketId>>,
}

struct Peer {
    binding: ConnectionBinding,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl HubState {
    fn remove(&mut self, socket_id: SocketId) -> Option<Departure> {
        let peer = self.peers.remove(&socket_id)?;
        let session_id = peer.binding.session_id;

        let remaining = match self.rooms.get_mut(&session_id) {
            Some(room) => {
                room.retain(|id| *id != socket_id);
                room.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.rooms.remove(&session_id);
        }

        Some(Departure {
            binding: peer.binding,
            remaining,
        })
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket in its session's room. Returns its id and the receiver
    /// its send task drains.
    pub async fn join(&self, binding: ConnectionBinding) -> (SocketId, mpsc::UnboundedReceiver<Outbound>) {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.inner.write().await;
        state.rooms.entry(binding.session_id).or_default().push(socket_id);
        state.peers.insert(socket_id, Peer { binding, tx });
        (socket_id, rx)
    }

    /// Remove a socket. `None` if it was already gone (evicted earlier).
    pub async fn leave(&self, socket_id: SocketId) -> Option<Departure> {
        self.inner.write().await.remove(socket_id)
    }

    /// Remove every socket of `user_id` except `keep`, server-wide, and tell each
    /// one to close.
    pub async fn evict_user(
        &self,
        user_id: i64,
        keep: Option<SocketId>,
        code: CloseCode,
        reason: &'static str,
    ) -> Vec<(SocketId, Departure)> {
        self.close_where(
            |id, binding| binding.user.id == user_id && Some(id) != keep,
            code,
            reason,
        )
        .await
    }

    /// Remove every socket and tell each one to close.
    pub async fn close_all(&self, code: CloseCode, reason: &'static str) -> Vec<(SocketId, Departure)> {
        self.close_where(|_, _| true, code, reason).await
    }

    async fn close_where<P>(&self, pred: P, code: CloseCode, reason: &'static str) -> Vec<(SocketId, Departure)>
    where
        P: Fn(SocketId, &ConnectionBinding) -> bool,
    {
        let mut state = self.inner.write().await;
        let targets: Vec<SocketId> = state
            .peers
            .iter()
            .filter(|(id, peer)| pred(**id, &peer.binding))
            .map(|(id, _)| *id)
            .collect();

        let mut closed = Vec::with_capacity(targets.len());
        for socket_id in targets {
            if let Some(peer) = state.peers.get(&socket_id) {
                let _ = peer.tx.send(Outbound::Close { code, reason });
            }
            if let Some(departure) = state.remove(socket_id) {
                closed.push((socket_id, departure));
            }
        }
        closed
    }

    /// Sockets of a room, in join order.
    pub async fn members(&self, session_id: i64) -> Vec<(SocketId, ConnectionBinding)> {
        let state = self.inner.read().await;
        state
            .rooms
            .get(&session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.peers.get(id).map(|peer| (*id, peer.binding.clone())))
            .collect()
    }

    /// First socket of a room matching `pred`.
    pub async fn find_in_room<P>(&self, session_id: i64, pred: P) -> Option<SocketId>
    where
        P: Fn(&ConnectionBinding) -> bool,
    {
        let state = self.inner.read().await;
        state
            .rooms
            .get(&session_id)?
            .iter()
            .find(|id| state.peers.get(id).is_some_and(|peer| pred(&peer.binding)))
            .copied()
    }

    /// Whether any socket, in any room, matches `pred`.
    pub async fn any<P>(&self, pred: P) -> bool
    where
        P: Fn(&ConnectionBinding) -> bool,
    {
        self.inner.read().await.peers.values().any(|peer| pred(&peer.binding))
    }

    /// Send to every socket in the room except `except`. Returns how many were reached.
    pub async fn emit_to_room(&self, session_id: i64, event: &ServerEvent, except: Option<SocketId>) -> usize {
        let Some(text) = encode(event) else {
            return 0;
        };

        let state = self.inner.read().await;
        let Some(room) = state.rooms.get(&session_id) else {
            return 0;
        };

        let mut sent = 0;
        for id in room.iter().filter(|id| Some(**id) != except) {
            if let Some(peer) = state.peers.get(id) {
                if peer.tx.send(Outbound::Text(text.clone())).is_ok() {
                    sent += 1;
                }
            }
        }
        trace!("{} -> room {} ({} sockets)", event.name(), session_id, sent);
        sent
    }

    /// Send to one socket. Returns false if it is no longer connected.
    pub async fn emit_to(&self, socket_id: SocketId, event: &ServerEvent) -> bool {
        let Some(text) = encode(event) else {
            return false;
        };
        let state = self.inner.read().await;
        state
            .peers
            .get(&socket_id)
            .is_some_and(|peer| peer.tx.send(Outbound::Text(text)).is_ok())
    }

    /// Run `f` only while the room is empty, holding the hub locked so no socket
    /// can join in between. Returns whether `f` ran.
    pub async fn if_room_empty<F, Fut>(&self, session_id: i64, f: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let state = self.inner.write().await;
        if state.rooms.contains_key(&session_id) {
            return false;
        }
        f().await;
        drop(state);
        true
    }

    pub async fn room_size(&self, session_id: i64) -> usize {
        self.inner.read().await.rooms.get(&session_id).map_or(0, Vec::len)
    }

    pub async fn socket_count(&self) -> usize {
        self.inner.read().await.peers.len()
    }
}

fn encode(event: &ServerEvent) -> Option<Utf8Bytes> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json.into()),
        Err(e) => {
            error!("Failed to serialize {} event: {}", event.name(), e);
            None
        }
    }
}
