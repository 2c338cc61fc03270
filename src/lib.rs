//! Convo: streaming chat with advisors, a recent-turn window, and durable history.

pub mod advisor;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod llm;
pub mod prompts;
pub mod telemetry;

pub use error::{Error, Result};

pub use chat::{ChatStream, ConversationService};
pub use conversation::{Message, Role};
