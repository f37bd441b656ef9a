/*!
 * Per-request cancellation tokens.
 *
 * A token is registered before a job starts cancellable work and removed
 * when the job ends, whatever the outcome. Cancelling or unregistering an
 * id that is not (or no longer) registered is a no-op.
 */

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// Process-local map from request id to cancellation token
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<i64, Entry>>,
    next_generation: AtomicU64,
}

impl CancellationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `request_id`
    ///
    /// A previous registration for the same id is replaced; its token is
    /// left untouched.
    pub fn register(&self, request_id: i64) -> CancellationToken {
        self.register_entry(request_id).1
    }

    fn register_entry(&self, request_id: i64) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.entries.lock().insert(
            request_id,
            Entry { generation, token: token.clone() },
        );
        if previous.is_some() {
            debug!("Replaced cancellation registration for request {}", request_id);
        }

        (generation, token)
    }

    /// Register and get a guard that unregisters when dropped
    pub fn register_guarded(self: &Arc<Self>, request_id: i64) -> Registration {
        let (generation, token) = self.register_entry(request_id);
        Registration {
            registry: Arc::clone(self),
            request_id,
            generation,
            token,
        }
    }

    /// Signal cancellation; returns whether a live registration existed
    pub fn cancel(&self, request_id: i64) -> bool {
        match self.entries.lock().get(&request_id) {
            Some(entry) => {
                entry.token.cancel();
                debug!("Cancellation requested for request {}", request_id);
                true
            }
            None => false,
        }
    }

    /// Remove the registration, if any
    pub fn unregister(&self, request_id: i64) {
        self.entries.lock().remove(&request_id);
    }

    /// Remove the registration only if it is still the given generation
    fn unregister_generation(&self, request_id: i64, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(&request_id).is_some_and(|e| e.generation == generation) {
            entries.remove(&request_id);
        }
    }

    /// Whether `request_id` has a live registration
    pub fn is_registered(&self, request_id: i64) -> bool {
        self.entries.lock().contains_key(&request_id)
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no registration is live
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Live registration; unregisters on drop
#[derive(Debug)]
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    request_id: i64,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    /// The registered token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister_generation(self.request_id, self.generation);
    }
}
