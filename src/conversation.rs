//! Conversation history: messages, the recent-turn window, and durable storage.

pub mod history;
pub mod locks;
pub mod memory;
pub mod message;
pub mod window;

pub use history::{MemoryRepository, QueryDialect};
pub use locks::{ConversationGuard, ConversationLocks};
pub use memory::ConversationMemory;
pub use message::{Message, Role};
pub use window::MemoryWindow;
