//! Chat exchanges: streaming replies and committing them once complete.

pub mod aggregator;
pub mod service;

pub use aggregator::{OnComplete, StreamAggregator};
pub use service::{ChatStream, ConversationService};
