use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// In-process cancellation tokens of executing runs, keyed by run id.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| {
            warn!("cancel registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register a fresh token for `run_id`, replacing any stale one.
    pub fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(run_id.to_string(), token.clone());
        token
    }

    /// Fire the token of an executing run. Returns false if none is registered.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }
}
