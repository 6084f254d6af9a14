use axum::extract::ws::close_code;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tavern_types::TavernError;
use tavern_types::events::{Presence, ServerEvent, SessionUser, Stamped};
use tavern_types::models::Character;

use crate::Gateway;
use crate::cache::keys;
use crate::gatekeeper::ConnectionBinding;
use crate::hub::{CLOSE_LOGGED_OUT, CLOSE_REPLACED, Departure, Outbound, SocketId};

impl Gateway {
    /// The binding's character as presence should show it: the cached copy when
    /// present, since `characterUpdate` refreshes only the cache.
    pub async fn character_of(&self, binding: &ConnectionBinding) -> Option<Character> {
        let character = binding.character()?;
        match self.cache.get_json(&keys::character(character.id)).await {
            Ok(Some(cached)) => Some(cached),
            Ok(None) => Some(character.clone()),
            Err(e) => {
                warn!("Unreadable cached character {}: {}", character.id, e);
                Some(character.clone())
            }
        }
    }

    async fn session_user(&self, socket_id: SocketId, binding: &ConnectionBinding) -> SessionUser {
        SessionUser {
            user: binding.user.clone(),
            socket_id,
            is_master: binding.is_master(),
            character: self.character_of(binding).await,
        }
    }

    /// Everyone currently in the session's room, in join order.
    pub async fn session_users(&self, session_id: i64) -> Vec<SessionUser> {
        let members = self.hub.members(session_id).await;
        let mut users = Vec::with_capacity(members.len());
        for (socket_id, binding) in &members {
            users.push(self.session_user(*socket_id, binding).await);
        }
        users
    }

    /// Put an admitted connection in its room. Older sockets of the same user are
    /// closed and announced as leaving before the room hears about the join.
    pub async fn attach(
        &self,
        binding: ConnectionBinding,
    ) -> Result<(SocketId, mpsc::UnboundedReceiver<Outbound>), TavernError> {
        let session_id = binding.session_id;
        let user_id = binding.user.id;
        let (socket_id, rx) = self.hub.join(binding.clone()).await;

        // Seeded here rather than at admission: a handshake that never upgrades
        // must not leave a sketch behind that no room will release.
        if let Err(e) = self.sketches.ensure_warm(session_id).await {
            self.hub.leave(socket_id).await;
            return Err(e);
        }

        let copycats = self
            .hub
            .evict_user(user_id, Some(socket_id), CLOSE_REPLACED, "Replaced by a newer connection")
            .await;
        for (old_socket, departure) in copycats {
            info!(
                "{} ({}) socket {} replaced by {}",
                departure.binding.user.name, user_id, old_socket, socket_id
            );
            self.announce_departure(old_socket, departure).await;
        }

        let joined = self.session_user(socket_id, &binding).await;
        let users = self.session_users(session_id).await;
        let event = ServerEvent::Join(Stamped::now(Presence { user: joined, users }));
        self.hub.emit_to_room(session_id, &event, None).await;

        Ok((socket_id, rx))
    }

    /// Remove a closed connection. No-op if the socket was already evicted.
    pub async fn detach(&self, socket_id: SocketId) {
        if let Some(departure) = self.hub.leave(socket_id).await {
            self.announce_departure(socket_id, departure).await;
        }
    }

    /// Close every socket of a user, e.g. on logout.
    pub async fn disconnect_user(&self, user_id: i64) -> usize {
        let evicted = self
            .hub
            .evict_user(user_id, None, CLOSE_LOGGED_OUT, "Logged out")
            .await;
        let count = evicted.len();
        for (socket_id, departure) in evicted {
            self.announce_departure(socket_id, departure).await;
        }
        count
    }

    /// Close every socket, release every room's sketch, then write out whatever
    /// is still pending. Edits reaching a released room fail instead of being
    /// dropped.
    pub async fn shutdown(&self) {
        let closed = self
            .hub
            .close_all(close_code::AWAY, "Server shutting down")
            .await;
        if !closed.is_empty() {
            info!("Closing {} sockets for shutdown", closed.len());
        }
        for (socket_id, departure) in closed {
            self.announce_departure(socket_id, departure).await;
        }
        self.sketches.flush().await;
    }

    async fn announce_departure(&self, socket_id: SocketId, departure: Departure) {
        let Departure { binding, remaining } = departure;
        let session_id = binding.session_id;

        if remaining > 0 {
            let left = self.session_user(socket_id, &binding).await;
            let users = self.session_users(session_id).await;
            let event = ServerEvent::Leave(Stamped::now(Presence { user: left, users }));
            self.hub.emit_to_room(session_id, &event, None).await;
        } else {
            // Last one out: persist the sketch and drop the working copy. The hub
            // stays locked until the write lands, so a joiner warms from it.
            let sketches = &self.sketches;
            let released = self
                .hub
                .if_room_empty(session_id, || async move {
                    sketches.release(session_id).await;
                })
                .await;
            if released {
                debug!("Session {} is empty, sketch released from cache", session_id);
            }
        }

        if let Some(character_id) = binding.character_id() {
            let seated = self
                .hub
                .any(|other| other.character_id() == Some(character_id))
                .await;
            if !seated {
                self.cache.delete(&keys::character(character_id)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatekeeper::tests::{Table, handshake, table};
    use crate::gatekeeper::admit;
    use serde_json::Value;
    use tavern_types::models::Sketch;

    fn displayed() -> Sketch {
        Sketch {
            displayed: true,
            ..Default::default()
        }
    }

    fn stored_sketch(t: &Table) -> Sketch {
        let row = t.gateway.db.get_session(t.session_id).unwrap().unwrap();
        row.into_session().unwrap().sketch
    }

    fn decode(out: Outbound) -> Value {
        match out {
            Outbound::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            Outbound::Close { code, .. } => serde_json::json!({ "event": "<close>", "code": code }),
        }
    }

    #[tokio::test]
    async fn join_lists_everyone_and_leave_updates_the_room() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let pc = admit(
            &t.gateway,
            handshake(&t.player_cookie, t.session_id, Some(t.character_id)),
        )
        .await
        .unwrap();

        let (_gm_socket, mut gm_rx) = t.gateway.attach(gm).await.unwrap();
        let first = decode(gm_rx.recv().await.unwrap());
        assert_eq!(first["event"], "join");
        assert_eq!(first["data"]["users"].as_array().unwrap().len(), 1);

        let (pc_socket, _pc_rx) = t.gateway.attach(pc).await.unwrap();
        let joined = decode(gm_rx.recv().await.unwrap());
        assert_eq!(joined["data"]["user"]["id"], t.player.id);
        assert_eq!(joined["data"]["user"]["isMaster"], false);
        assert_eq!(joined["data"]["user"]["character"]["data"]["name"], "Brakka");
        assert_eq!(joined["data"]["users"].as_array().unwrap().len(), 2);
        assert!(joined["data"]["dateTime"].is_string());

        t.gateway.detach(pc_socket).await;
        let left = decode(gm_rx.recv().await.unwrap());
        assert_eq!(left["event"], "leave");
        assert_eq!(left["data"]["user"]["socketId"], pc_socket.to_string());
        assert_eq!(left["data"]["users"].as_array().unwrap().len(), 1);

        // Detaching twice is harmless.
        t.gateway.detach(pc_socket).await;
        assert!(gm_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_connection_evicts_the_first_before_join() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (_gm_socket, mut gm_rx) = t.gateway.attach(gm).await.unwrap();
        decode(gm_rx.recv().await.unwrap());

        let pc = || handshake(&t.player_cookie, t.session_id, Some(t.character_id));
        let first = admit(&t.gateway, pc()).await.unwrap();
        let (first_socket, mut first_rx) = t.gateway.attach(first).await.unwrap();
        decode(gm_rx.recv().await.unwrap());

        let second = admit(&t.gateway, pc()).await.unwrap();
        let (second_socket, _second_rx) = t.gateway.attach(second).await.unwrap();

        assert_eq!(decode(first_rx.recv().await.unwrap())["event"], "join");
        let closed = decode(first_rx.recv().await.unwrap());
        assert_eq!(closed["event"], "<close>");
        assert_eq!(closed["code"], CLOSE_REPLACED);

        let leave = decode(gm_rx.recv().await.unwrap());
        assert_eq!(leave["event"], "leave");
        assert_eq!(leave["data"]["user"]["socketId"], first_socket.to_string());
        let join = decode(gm_rx.recv().await.unwrap());
        assert_eq!(join["event"], "join");
        assert_eq!(join["data"]["user"]["socketId"], second_socket.to_string());

        assert_eq!(t.gateway.hub.room_size(t.session_id).await, 2);
    }

    #[tokio::test]
    async fn last_leave_persists_and_releases_the_sketch() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (socket, _rx) = t.gateway.attach(gm.clone()).await.unwrap();
        t.gateway.sketches.replace(&gm, displayed()).await.unwrap();

        t.gateway.detach(socket).await;

        assert!(!t.gateway.cache.contains(&keys::sketch(t.session_id)).await);
        assert_eq!(t.gateway.sketches.pending_writes(), 0);
        let stored = t.gateway.db.get_session(t.session_id).unwrap().unwrap();
        assert!(stored.into_session().unwrap().sketch.displayed);
    }

    #[tokio::test]
    async fn last_leave_waits_for_a_write_already_running() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (socket, _rx) = t.gateway.attach(gm.clone()).await.unwrap();
        t.gateway.sketches.replace(&gm, displayed()).await.unwrap();

        // Hold the database while the 50ms timer fires, so its write is stuck.
        let db = std::sync::Arc::clone(&t.gateway.db);
        let stall = std::thread::spawn(move || {
            db.with_conn(|_| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(t.gateway.sketches.pending_writes(), 0);

        t.gateway.detach(socket).await;
        assert!(stored_sketch(&t).displayed);
        assert!(!t.gateway.cache.contains(&keys::sketch(t.session_id)).await);
        stall.join().unwrap();

        // A later table starts from what was written.
        let again = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        t.gateway.attach(again).await.unwrap();
        assert!(t.gateway.sketches.current(t.session_id).await.unwrap().displayed);
    }

    #[tokio::test]
    async fn admission_alone_leaves_the_cache_cold() {
        let t = table().await;
        admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        assert!(!t.gateway.cache.contains(&keys::sketch(t.session_id)).await);
    }

    #[tokio::test]
    async fn character_entry_is_dropped_when_its_player_leaves() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (_gm_socket, _gm_rx) = t.gateway.attach(gm).await.unwrap();

        let pc = || handshake(&t.player_cookie, t.session_id, Some(t.character_id));
        let first = admit(&t.gateway, pc()).await.unwrap();
        let (_first_socket, _first_rx) = t.gateway.attach(first).await.unwrap();
        let second = admit(&t.gateway, pc()).await.unwrap();
        let (second_socket, _second_rx) = t.gateway.attach(second).await.unwrap();

        // The replaced socket left, but the same character is still seated.
        let key = keys::character(t.character_id);
        assert!(t.gateway.cache.contains(&key).await);

        t.gateway.detach(second_socket).await;
        assert!(!t.gateway.cache.contains(&key).await);
    }

    #[tokio::test]
    async fn shutdown_closes_sockets_and_persists_every_sketch() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (_socket, mut rx) = t.gateway.attach(gm.clone()).await.unwrap();
        decode(rx.recv().await.unwrap());
        t.gateway.sketches.replace(&gm, displayed()).await.unwrap();

        t.gateway.shutdown().await;

        assert_eq!(decode(rx.recv().await.unwrap())["code"], close_code::AWAY);
        assert_eq!(t.gateway.hub.socket_count().await, 0);
        assert_eq!(t.gateway.sketches.pending_writes(), 0);
        assert!(stored_sketch(&t).displayed);

        // A socket task still draining its input cannot edit a released room.
        let err = t.gateway.sketches.replace(&gm, Default::default()).await.unwrap_err();
        assert!(err.is_intern());
    }

    #[tokio::test]
    async fn disconnect_user_closes_all_their_sockets() {
        let t = table().await;
        let gm = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        let (_socket, mut rx) = t.gateway.attach(gm).await.unwrap();
        decode(rx.recv().await.unwrap());

        assert_eq!(t.gateway.disconnect_user(t.master.id).await, 1);
        assert_eq!(decode(rx.recv().await.unwrap())["code"], CLOSE_LOGGED_OUT);
        assert_eq!(t.gateway.hub.socket_count().await, 0);
    }
}
