pub mod cache;
pub mod connection;
pub mod debounce;
pub mod dice;
pub mod gatekeeper;
pub mod handlers;
pub mod hub;
pub mod notes;
pub mod presence;
pub mod sketch;

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use tavern_db::Database;
use tavern_types::TavernError;

use crate::cache::Cache;
use crate::gatekeeper::AuthKeys;
use crate::hub::Hub;
use crate::sketch::SketchSync;

/// Everything a connection or an HTTP handler needs to reach the live session state.
#[derive(Clone)]
pub struct Gateway {
    pub hub: Hub,
    pub cache: Cache,
    pub db: Arc<Database>,
    pub sketches: Arc<SketchSync>,
    pub keys: Arc<AuthKeys>,
}

impl Gateway {
    pub fn new(db: Arc<Database>, keys: AuthKeys, sketch_debounce: Duration) -> Self {
        let cache = Cache::new();
        let sketches = SketchSync::new(cache.clone(), Arc::clone(&db), sketch_debounce);
        Self {
            hub: Hub::new(),
            cache,
            db,
            sketches: Arc::new(sketches),
            keys: Arc::new(keys),
        }
    }
}

/// Run a blocking database call off the async runtime.
pub async fn blocking<T, F>(db: &Arc<Database>, f: F) -> Result<T, TavernError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            TavernError::Intern(format!("database task failed: {e}"))
        })?
        .map_err(TavernError::from)
}
