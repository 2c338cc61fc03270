//! Per-conversation mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Serializes history mutations per conversation id while letting different
/// conversations proceed in parallel.
///
/// Entries are created on first use and removed once nobody holds or waits on
/// them.
#[derive(Debug, Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Exclusive access to one conversation, released on drop.
#[derive(Debug)]
pub struct ConversationGuard {
    conversation_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        // Clones happen under the map lock so the prune check in Drop sees every holder.
        let lock = lock_map(&self.locks)
            .entry(conversation_id.to_string())
            .or_default()
            .clone();

        let guard = lock.clone().lock_owned().await;
        tracing::trace!(%conversation_id, "conversation lock acquired");

        ConversationGuard {
            conversation_id: conversation_id.to_string(),
            guard: Some(guard),
            lock,
            locks: self.locks.clone(),
        }
    }

    /// Number of conversations with a live lock entry.
    pub fn active(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        self.guard.take();

        // The map and this guard are the only references left: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
        tracing::trace!(conversation_id = %self.conversation_id, "conversation lock released");
    }
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}
