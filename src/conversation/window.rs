//! Bounded most-recent-N message window per conversation (in-process only).

use crate::conversation::Message;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Retention depth used by the durable chat path.
pub const PERSISTENT_WINDOW_SIZE: usize = 20;

/// Retention depth used by the window-only chat path.
pub const EPHEMERAL_WINDOW_SIZE: usize = 10;

/// Conversations kept in memory before the least recently used is dropped.
pub const DEFAULT_MAX_CONVERSATIONS: usize = 1024;

/// Per-conversation FIFO windows sharing one capacity.
///
/// Process-local and lost on restart; the repository is the durable record.
/// At most `max_conversations` windows are held; touching a new conversation
/// past that limit drops the least recently used one, which a repository
/// can re-seed later. Callers serialize mutations of a single conversation
/// through [`ConversationLocks`](crate::conversation::ConversationLocks); the
/// inner mutex only protects the map itself.
#[derive(Debug)]
pub struct MemoryWindow {
    capacity: usize,
    max_conversations: usize,
    inner: Mutex<Windows>,
}

#[derive(Debug, Default)]
struct Windows {
    entries: HashMap<String, Entry>,
    clock: u64,
}

#[derive(Debug)]
struct Entry {
    messages: VecDeque<Message>,
    last_used: u64,
}

impl Windows {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, conversation_id: &str) -> Option<&mut Entry> {
        let now = self.tick();
        let entry = self.entries.get_mut(conversation_id)?;
        entry.last_used = now;
        Some(entry)
    }

    fn insert(&mut self, conversation_id: &str, messages: VecDeque<Message>, limit: usize) {
        let now = self.tick();
        self.entries.insert(
            conversation_id.to_string(),
            Entry {
                messages,
                last_used: now,
            },
        );

        while self.entries.len() > limit {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::debug!(conversation_id = %oldest, "window dropped from cache");
        }
    }
}

impl MemoryWindow {
    /// Build an empty window set retaining at most `capacity` messages per conversation.
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            inner: Mutex::new(Windows::default()),
        }
    }

    /// Limit how many conversations are cached at once. Zero is raised to one.
    pub fn with_max_conversations(mut self, max_conversations: usize) -> Self {
        self.max_conversations = max_conversations.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_conversations(&self) -> usize {
        self.max_conversations
    }

    /// Add a message at the tail, evicting from the head once over capacity.
    pub fn append(&self, conversation_id: &str, message: Message) {
        let mut inner = self.lock();
        match inner.touch(conversation_id) {
            Some(entry) => {
                entry.messages.push_back(message);
                while entry.messages.len() > self.capacity {
                    entry.messages.pop_front();
                }
            }
            None => {
                let mut messages = VecDeque::with_capacity(self.capacity);
                messages.push_back(message);
                inner.insert(conversation_id, messages, self.max_conversations);
            }
        }
    }

    /// Replace a conversation's window with the tail of `messages`.
    pub fn seed(&self, conversation_id: &str, messages: &[Message]) {
        let start = messages.len().saturating_sub(self.capacity);
        let window: VecDeque<Message> = messages[start..].iter().cloned().collect();
        self.lock()
            .insert(conversation_id, window, self.max_conversations);
    }

    /// Retained messages, oldest first. Unknown conversations yield an empty list.
    pub fn get(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .touch(conversation_id)
            .map(|entry| entry.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether this conversation has a window (possibly empty) in memory.
    pub fn contains(&self, conversation_id: &str) -> bool {
        self.lock().entries.contains_key(conversation_id)
    }

    pub fn size(&self, conversation_id: &str) -> usize {
        self.lock()
            .entries
            .get(conversation_id)
            .map_or(0, |entry| entry.messages.len())
    }

    /// Drop a conversation's window.
    pub fn evict(&self, conversation_id: &str) {
        self.lock().entries.remove(conversation_id);
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        // Every mutation completes under the lock, so poisoning is ignored.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryWindow {
    fn default() -> Self {
        Self::with_capacity(PERSISTENT_WINDOW_SIZE)
    }
}
