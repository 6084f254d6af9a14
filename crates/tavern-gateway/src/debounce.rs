use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// Per-key cancelable timers. Scheduling a key that already has a pending timer
/// aborts that timer and replaces it, so an action runs once the key has been
/// quiet for `delay`.
pub struct Debouncer<K> {
    delay: Duration,
    timers: Arc<Mutex<HashMap<K, Pending>>>,
    next_id: AtomicU64,
}

struct Pending {
    id: u64,
    handle: JoinHandle<()>,
    fire_now: oneshot::Sender<()>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the timer for `key`.
    pub fn schedule<F>(&self, key: K, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across the spawn: the task must not look itself up before it is
        // in the map, however short the delay.
        let mut armed = match self.timers.lock() {
            Ok(timers) => timers,
            Err(e) => {
                warn!("Debounce timer map poisoned: {}", e);
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (fire_now, fire_rx) = oneshot::channel();
        let timers = Arc::clone(&self.timers);
        let delay = self.delay;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                signal = fire_rx => {
                    // Sender dropped without firing: the timer was replaced.
                    if signal.is_err() {
                        return;
                    }
                }
            }

            // Detach before running, so a newer schedule for the same key does not
            // abort an action that is already writing.
            if let Ok(mut timers) = timers.lock() {
                if timers.get(&task_key).is_some_and(|p| p.id == id) {
                    timers.remove(&task_key);
                }
            }

            action.await;
        });

        if let Some(previous) = armed.insert(key, Pending { id, handle, fire_now }) {
            previous.handle.abort();
        }
    }

    /// Drop the pending timer for `key` without running it.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.timers.lock().ok().and_then(|mut timers| timers.remove(key));
        match removed {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().map(|timers| timers.len()).unwrap_or(0)
    }

    /// Fire every pending timer immediately and wait for all actions.
    pub async fn flush(&self) {
        let drained: Vec<Pending> = match self.timers.lock() {
            Ok(mut timers) => timers.drain().map(|(_, pending)| pending).collect(),
            Err(_) => Vec::new(),
        };

        let handles: Vec<JoinHandle<()>> = drained
            .into_iter()
            .map(|pending| {
                let _ = pending.fire_now.send(());
                pending.handle
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Debounced action failed during flush: {}", e);
            }
        }
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, pending) in timers.drain() {
                pending.handle.abort();
            }
        }
    }
}
