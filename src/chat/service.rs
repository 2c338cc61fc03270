//! ConversationService: the entry point tying advisors, model, and memory together.

use crate::advisor::{AdvisedRequest, AdvisedResponse, AdvisorChain, ResponseOrigin, Terminal};
use crate::chat::aggregator::{OnComplete, StreamAggregator};
use crate::conversation::{ConversationGuard, ConversationLocks, ConversationMemory, Message};
use crate::error::{MemoryError, Result};
use crate::llm::{FragmentStream, LanguageModelDyn, Prompt};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt as _};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Accepts user turns and streams replies, one exchange per conversation at a time.
#[derive(Clone)]
pub struct ConversationService {
    memory: Arc<ConversationMemory>,
    chain: AdvisorChain,
    model: Arc<dyn LanguageModelDyn>,
    locks: ConversationLocks,
    system_prompt: Option<String>,
    fragment_timeout: Option<Duration>,
}

/// Reply fragments for one `submit` call.
///
/// Ends with `None` once the exchange is durable, or with a single error.
/// Dropping it before the end cancels generation.
pub struct ChatStream {
    inner: FragmentStream,
    origin: ResponseOrigin,
    cancellation: CancellationToken,
}

impl ConversationService {
    pub fn new(
        memory: Arc<ConversationMemory>,
        chain: AdvisorChain,
        model: Arc<dyn LanguageModelDyn>,
    ) -> Self {
        Self {
            memory,
            chain,
            model,
            locks: ConversationLocks::new(),
            system_prompt: None,
            fragment_timeout: None,
        }
    }

    /// System-role context sent with every prompt. Never stored.
    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_fragment_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fragment_timeout = timeout;
        self
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Start an exchange.
    ///
    /// The conversation stays locked until the returned stream finishes or is
    /// dropped, so concurrent submits to one conversation run back to back.
    pub async fn submit(&self, conversation_id: &str, user_text: &str) -> Result<ChatStream> {
        if conversation_id.trim().is_empty() {
            return Err(MemoryError::InvalidConversationId.into());
        }
        if user_text.trim().is_empty() {
            return Err(MemoryError::EmptyMessage.into());
        }

        let guard = Arc::new(self.locks.acquire(conversation_id).await);
        let history = self.memory.recent(&guard).await?;

        let stage = Arc::new(GenerateStage {
            guard: guard.clone(),
            memory: self.memory.clone(),
            model: self.model.clone(),
            recorded: Mutex::new(None),
        });

        let request = AdvisedRequest {
            conversation_id: conversation_id.to_string(),
            user_text: user_text.to_string(),
            history,
            system: self.system_prompt.clone(),
        };
        let response = self.chain.call(request, stage.clone()).await?;
        let AdvisedResponse { stream, origin } = response;

        let cancellation = CancellationToken::new();
        let inner = match stage.take_recorded() {
            Some(snapshot) => {
                let memory = self.memory.clone();
                let on_complete: OnComplete = Box::new(move |text| {
                    Box::pin(async move {
                        memory
                            .commit_assistant(&guard, snapshot, Message::assistant(text))
                            .await
                    })
                });

                StreamAggregator::new(conversation_id)
                    .with_idle_timeout(self.fragment_timeout)
                    .with_cancellation(cancellation.clone())
                    .aggregate(stream, on_complete)
            }
            // Answered by an advisor: nothing was recorded and nothing will be.
            None => {
                tracing::debug!(%conversation_id, %origin, "exchange answered without the model");
                stream
            }
        };

        Ok(ChatStream {
            inner,
            origin,
            cancellation,
        })
    }

    /// Full stored history, oldest first. Unknown ids yield an empty list.
    pub async fn list_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        if conversation_id.trim().is_empty() {
            return Err(MemoryError::InvalidConversationId.into());
        }
        self.memory.history(conversation_id).await
    }

    /// Waits for any exchange in flight on the conversation, then removes it.
    pub async fn delete_history(&self, conversation_id: &str) -> Result<()> {
        if conversation_id.trim().is_empty() {
            return Err(MemoryError::InvalidConversationId.into());
        }
        let guard = self.locks.acquire(conversation_id).await;
        self.memory.forget(&guard).await?;
        tracing::info!(%conversation_id, "conversation deleted");
        Ok(())
    }

    pub async fn list_conversation_ids(&self) -> Result<Vec<String>> {
        self.memory.conversation_ids().await
    }
}

impl std::fmt::Debug for ConversationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationService")
            .field("chain", &self.chain)
            .field("model", &self.model.name())
            .field("persistent", &self.memory.is_persistent())
            .finish_non_exhaustive()
    }
}

/// Terminal stage: records the user turn, then calls the model.
struct GenerateStage {
    guard: Arc<ConversationGuard>,
    memory: Arc<ConversationMemory>,
    model: Arc<dyn LanguageModelDyn>,
    recorded: Mutex<Option<Vec<Message>>>,
}

impl GenerateStage {
    /// History snapshot ending in the user turn, if the request reached this stage.
    fn take_recorded(&self) -> Option<Vec<Message>> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Terminal for GenerateStage {
    fn call(&self, request: AdvisedRequest) -> BoxFuture<'_, Result<AdvisedResponse>> {
        Box::pin(async move {
            let AdvisedRequest {
                conversation_id,
                user_text,
                mut history,
                system,
            } = request;

            let message = Message::user(user_text);
            let snapshot = self.memory.record_user(&self.guard, message.clone()).await?;
            *self.recorded.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);

            history.push(message);
            tracing::debug!(
                %conversation_id,
                model = self.model.name(),
                turns = history.len(),
                "calling model"
            );
            let stream = self.model.generate(Prompt::new(system, history)).await?;
            Ok(AdvisedResponse::from_model(stream))
        })
    }
}

impl ChatStream {
    pub fn origin(&self) -> &ResponseOrigin {
        &self.origin
    }

    /// True when an advisor answered in place of the model.
    pub fn is_refusal(&self) -> bool {
        matches!(self.origin, ResponseOrigin::Advisor { .. })
    }

    /// Token that stops generation when cancelled. The stream then ends with
    /// `LlmError::Cancelled` and no reply is stored.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Drain the stream into the complete reply text.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
