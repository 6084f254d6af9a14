//! Write-back cache for session sketches. Edits land in the cache right away and
//! reach the database once a session has been quiet for the debounce delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use tavern_db::Database;
use tavern_types::TavernError;
use tavern_types::models::{Sketch, Token};

use crate::blocking;
use crate::cache::{Cache, keys};
use crate::debounce::Debouncer;
use crate::gatekeeper::ConnectionBinding;

pub struct SketchSync {
    cache: Cache,
    db: Arc<Database>,
    debouncer: Debouncer<i64>,
    /// Held for the whole read-cache-then-write of every sketch write, so an
    /// older snapshot can never land after a newer one.
    writes: Arc<Mutex<()>>,
}

impl SketchSync {
    pub fn new(cache: Cache, db: Arc<Database>, delay: Duration) -> Self {
        Self {
            cache,
            db,
            debouncer: Debouncer::new(delay),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Seed the cache with the persisted sketch unless a working copy exists.
    pub async fn warm(&self, session_id: i64, persisted: &Sketch) -> Result<bool, TavernError> {
        Ok(self.cache.set_json_if_absent(&keys::sketch(session_id), persisted).await?)
    }

    /// Like `warm`, loading the persisted sketch only when the cache is cold.
    pub async fn ensure_warm(&self, session_id: i64) -> Result<(), TavernError> {
        if self.cache.contains(&keys::sketch(session_id)).await {
            return Ok(());
        }
        let session = blocking(&self.db, move |db| {
            db.get_session(session_id)?.map(|row| row.into_session()).transpose()
        })
        .await?
        .ok_or_else(|| TavernError::NotFound(format!("Session {session_id} not found")))?;
        if self.warm(session_id, &session.sketch).await? {
            debug!("Warmed sketch cache for session {}", session_id);
        }
        Ok(())
    }

    pub async fn current(&self, session_id: i64) -> Result<Sketch, TavernError> {
        self.cache
            .get_json(&keys::sketch(session_id))
            .await?
            .ok_or_else(|| never_warmed(session_id))
    }

    /// Master-only full replace.
    pub async fn replace(&self, binding: &ConnectionBinding, sketch: Sketch) -> Result<Sketch, TavernError> {
        binding.require_master("update the sketch")?;

        let session_id = binding.session_id;
        let updated = self
            .cache
            .update_json(&keys::sketch(session_id), |current: &mut Sketch| {
                *current = sketch;
                current.clone()
            })
            .await?
            .ok_or_else(|| never_warmed(session_id))?;

        self.schedule_persist(session_id);
        Ok(updated)
    }

    /// Replace one token by id. `None` when no token has that id: nothing changes
    /// and nothing is persisted.
    pub async fn merge_token(&self, binding: &ConnectionBinding, token: Token) -> Result<Option<Sketch>, TavernError> {
        let session_id = binding.session_id;
        let token_id = token.id.clone();
        let merged = self
            .cache
            .update_json(&keys::sketch(session_id), |current: &mut Sketch| {
                current.replace_token(token).then(|| current.clone())
            })
            .await?
            .ok_or_else(|| never_warmed(session_id))?;

        match merged {
            Some(sketch) => {
                self.schedule_persist(session_id);
                Ok(Some(sketch))
            }
            None => {
                debug!("Session {}: ignoring update for unknown token {}", session_id, token_id);
                Ok(None)
            }
        }
    }

    /// Arm or re-arm the session's write-back timer. The write reads the cache
    /// when it fires, so it always persists the latest state.
    fn schedule_persist(&self, session_id: i64) {
        let cache = self.cache.clone();
        let db = Arc::clone(&self.db);
        let writes = Arc::clone(&self.writes);
        self.debouncer.schedule(session_id, async move {
            let _writing = writes.lock().await;
            let Some(json) = cache.get_raw(&keys::sketch(session_id)).await else {
                debug!("Session {}: sketch left the cache before write-back", session_id);
                return;
            };
            persist(&db, session_id, json).await;
        });
    }

    /// Write out every pending sketch now and wait for writes already running.
    /// Used at shutdown.
    pub async fn flush(&self) {
        let pending = self.debouncer.pending();
        if pending > 0 {
            debug!("Flushing {} pending sketch writes", pending);
        }
        self.debouncer.flush().await;
        drop(self.writes.lock().await);
    }

    /// Persist the working copy and drop it from the cache. Returns once the
    /// database holds it. Later edits fail as never warmed until the next
    /// `ensure_warm`.
    pub async fn release(&self, session_id: i64) -> bool {
        let _writing = self.writes.lock().await;
        self.debouncer.cancel(&session_id);
        let Some(json) = self.cache.take_raw(&keys::sketch(session_id)).await else {
            return false;
        };
        persist(&self.db, session_id, json).await;
        true
    }

    pub fn pending_writes(&self) -> usize {
        self.debouncer.pending()
    }
}

async fn persist(db: &Arc<Database>, session_id: i64, json: String) {
    match blocking(db, move |db| db.update_session_sketch(session_id, &json)).await {
        Ok(true) => debug!("Session {}: sketch persisted", session_id),
        Ok(false) => warn!("Session {}: sketch not persisted, session no longer exists", session_id),
        Err(e) => error!("Session {}: sketch write-back failed: {}", session_id, e),
    }
}

fn never_warmed(session_id: i64) -> TavernError {
    TavernError::Intern(format!("Sketch cache for session {session_id} was never warmed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatekeeper::Seat;
    use serde_json::{Map, json};
    use tavern_types::models::{Character, SafeUser, SketchItem};

    struct Board {
        sync: SketchSync,
        db: Arc<Database>,
        master: ConnectionBinding,
        player: ConnectionBinding,
    }

    fn user(id: i64) -> SafeUser {
        SafeUser {
            id,
            name: format!("u{id}"),
            is_admin: false,
            locale: "en".into(),
            theme: "light".into(),
        }
    }

    fn item(id: &str, x: i64) -> SketchItem {
        let mut attributes = Map::new();
        attributes.insert("x".into(), json!(x));
        SketchItem {
            id: id.into(),
            attributes,
        }
    }

    fn persisted(db: &Database, session_id: i64) -> Sketch {
        db.get_session(session_id).unwrap().unwrap().into_session().unwrap().sketch
    }

    async fn board(delay: Duration) -> Board {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let master_id = db.create_user("gm", "x", false).unwrap();
        let player_id = db.create_user("pc", "x", false).unwrap();
        let session_id = db.create_session(master_id, "dnd5e", "table").unwrap();

        let sync = SketchSync::new(Cache::new(), Arc::clone(&db), delay);
        let initial = Sketch {
            tokens: vec![item("t1", 0)],
            ..Sketch::default()
        };
        assert!(sync.warm(session_id, &initial).await.unwrap());

        Board {
            sync,
            db,
            master: ConnectionBinding {
                user: user(master_id),
                session_id,
                seat: Seat::Master,
            },
            player: ConnectionBinding {
                user: user(player_id),
                session_id,
                seat: Seat::Player {
                    character: Character {
                        id: 1,
                        user_id: player_id,
                        game: "dnd5e".into(),
                        data: json!({}),
                    },
                },
            },
        }
    }

    #[tokio::test]
    async fn non_master_replace_is_forbidden_and_changes_nothing() {
        let b = board(Duration::from_millis(20)).await;
        let before = b.sync.current(b.master.session_id).await.unwrap();

        let attempt = Sketch {
            displayed: true,
            ..Sketch::default()
        };
        let err = b.sync.replace(&b.player, attempt).await.unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(b.sync.pending_writes(), 0);

        assert_eq!(b.sync.current(b.master.session_id).await.unwrap(), before);
        b.sync.flush().await;
        assert_eq!(persisted(&b.db, b.master.session_id), Sketch::default());
    }

    #[tokio::test]
    async fn unknown_token_is_a_silent_no_op() {
        let b = board(Duration::from_millis(20)).await;

        let merged = b.sync.merge_token(&b.player, item("ghost", 5)).await.unwrap();
        assert!(merged.is_none());
        assert_eq!(b.sync.pending_writes(), 0);

        let sketch = b.sync.current(b.player.session_id).await.unwrap();
        assert_eq!(sketch.tokens, vec![item("t1", 0)]);
    }

    #[tokio::test]
    async fn known_token_is_replaced_by_anyone() {
        let b = board(Duration::from_secs(3600)).await;

        let merged = b.sync.merge_token(&b.player, item("t1", 9)).await.unwrap().unwrap();
        assert_eq!(merged.tokens, vec![item("t1", 9)]);
        assert_eq!(b.sync.pending_writes(), 1);

        b.sync.flush().await;
        assert_eq!(persisted(&b.db, b.player.session_id).tokens, vec![item("t1", 9)]);
    }

    #[tokio::test]
    async fn interleaved_edits_collapse_into_one_write_of_the_last_state() {
        let b = board(Duration::from_millis(50)).await;
        let session_id = b.master.session_id;

        let replacement = Sketch {
            displayed: true,
            tokens: vec![item("t1", 1), item("t2", 1)],
            ..Sketch::default()
        };
        b.sync.replace(&b.master, replacement).await.unwrap();
        b.sync.merge_token(&b.player, item("t2", 2)).await.unwrap();
        b.sync.merge_token(&b.player, item("t1", 3)).await.unwrap();
        assert_eq!(b.sync.pending_writes(), 1);
        assert_eq!(persisted(&b.db, session_id), Sketch::default());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(b.sync.pending_writes(), 0);

        let stored = persisted(&b.db, session_id);
        assert!(stored.displayed);
        assert_eq!(stored.tokens, vec![item("t1", 3), item("t2", 2)]);
    }

    #[tokio::test]
    async fn cold_cache_is_an_internal_error() {
        let b = board(Duration::from_millis(20)).await;
        assert!(b.sync.release(b.master.session_id).await);
        assert!(!b.sync.release(b.master.session_id).await);

        let err = b.sync.replace(&b.master, Sketch::default()).await.unwrap_err();
        assert!(err.is_intern());
        assert!(b.sync.merge_token(&b.player, item("t1", 1)).await.unwrap_err().is_intern());

        // Release wrote the working copy, so warming again restores it.
        b.sync.ensure_warm(b.master.session_id).await.unwrap();
        let restored = b.sync.current(b.master.session_id).await.unwrap();
        assert_eq!(restored.tokens, vec![item("t1", 0)]);
    }

    #[tokio::test]
    async fn release_waits_for_a_write_already_in_flight() {
        let b = board(Duration::from_millis(20)).await;
        let session_id = b.master.session_id;

        let first = Sketch {
            displayed: true,
            tokens: vec![item("t1", 0)],
            ..Sketch::default()
        };
        b.sync.replace(&b.master, first).await.unwrap();

        // Stall the database so the timer fires and its write blocks.
        let db = Arc::clone(&b.db);
        let stall = std::thread::spawn(move || {
            db.with_conn(|_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.sync.pending_writes(), 0);

        b.sync.merge_token(&b.player, item("t1", 7)).await.unwrap();
        assert!(b.sync.release(session_id).await);

        let stored = persisted(&b.db, session_id);
        assert!(stored.displayed);
        assert_eq!(stored.tokens, vec![item("t1", 7)]);
        assert!(b.sync.current(session_id).await.unwrap_err().is_intern());
        stall.join().unwrap();
    }
}
