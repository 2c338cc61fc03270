//! Language model capability: prompt in, ordered text fragments out.

pub mod openai;

pub use openai::OpenAiCompatibleModel;

use crate::conversation::Message;
use crate::error::Result;

use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Ordered, finite-or-abortable fragments of one generation.
///
/// Dropping the stream tells the provider to stop.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    /// Rendered system-role context, sent first and never persisted.
    pub system: Option<String>,
    /// Conversation turns, oldest first, ending with the new user message.
    pub messages: Vec<Message>,
}

impl Prompt {
    pub fn new(system: Option<String>, messages: Vec<Message>) -> Self {
        Self { system, messages }
    }
}

/// Static trait for model backends.
pub trait LanguageModel: Send + Sync + 'static {
    /// Model identifier, for logging.
    fn name(&self) -> &str;

    /// Start a generation. Errors here mean nothing was streamed.
    fn generate(&self, prompt: Prompt) -> impl Future<Output = Result<FragmentStream>> + Send;
}

/// Dynamic companion of [`LanguageModel`] for `Arc<dyn LanguageModelDyn>` storage.
pub trait LanguageModelDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate<'a>(
        &'a self,
        prompt: Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<FragmentStream>> + Send + 'a>>;
}

impl<T: LanguageModel> LanguageModelDyn for T {
    fn name(&self) -> &str {
        LanguageModel::name(self)
    }

    fn generate<'a>(
        &'a self,
        prompt: Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<FragmentStream>> + Send + 'a>> {
        Box::pin(LanguageModel::generate(self, prompt))
    }
}
