//! ConversationMemory: the window cache reconciled with durable history.

use crate::conversation::{ConversationGuard, MemoryRepository, MemoryWindow, Message};
use crate::error::Result;

/// Window plus optional repository.
///
/// Every mutation takes a [`ConversationGuard`], so callers prove they hold the
/// conversation's lock. The repository is written before the window so the
/// window never holds a turn the repository rejected.
#[derive(Debug)]
pub struct ConversationMemory {
    window: MemoryWindow,
    repository: Option<MemoryRepository>,
}

impl ConversationMemory {
    /// Window backed by durable history.
    pub fn persistent(window_size: usize, repository: MemoryRepository) -> Self {
        Self {
            window: MemoryWindow::with_capacity(window_size),
            repository: Some(repository),
        }
    }

    /// Window only. Everything is lost on restart.
    pub fn ephemeral(window_size: usize) -> Self {
        Self {
            window: MemoryWindow::with_capacity(window_size),
            repository: None,
        }
    }

    /// Cap the number of conversations whose windows stay cached.
    pub fn with_max_cached_conversations(mut self, max_conversations: usize) -> Self {
        self.window = MemoryWindow::with_capacity(self.window.capacity())
            .with_max_conversations(max_conversations);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.repository.is_some()
    }

    pub fn window(&self) -> &MemoryWindow {
        &self.window
    }

    /// Recent turns for prompting, seeding the window from storage on first use.
    pub async fn recent(&self, guard: &ConversationGuard) -> Result<Vec<Message>> {
        let conversation_id = guard.conversation_id();

        if let Some(repository) = &self.repository
            && !self.window.contains(conversation_id)
        {
            let stored = repository.load(conversation_id).await?;
            if !stored.is_empty() {
                tracing::debug!(
                    %conversation_id,
                    stored = stored.len(),
                    "seeding window from history"
                );
                self.window.seed(conversation_id, &stored);
            }
        }

        Ok(self.window.get(conversation_id))
    }

    /// Full history: durable when a repository is configured, else the window.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        match &self.repository {
            Some(repository) => repository.load(conversation_id).await,
            None => Ok(self.window.get(conversation_id)),
        }
    }

    /// Persist the user turn and return the full history it now ends.
    pub async fn record_user(
        &self,
        guard: &ConversationGuard,
        message: Message,
    ) -> Result<Vec<Message>> {
        let conversation_id = guard.conversation_id();

        let snapshot = match &self.repository {
            Some(repository) => {
                let mut history = repository.load(conversation_id).await?;
                history.push(message);
                repository.replace_all(conversation_id, &history).await?;
                // Re-seed in case the window was dropped from the cache.
                self.window.seed(conversation_id, &history);
                history
            }
            None => {
                let mut history = self.window.get(conversation_id);
                history.push(message.clone());
                self.window.append(conversation_id, message);
                history
            }
        };

        Ok(snapshot)
    }

    /// Persist the assistant turn completing the exchange begun by `record_user`.
    pub async fn commit_assistant(
        &self,
        guard: &ConversationGuard,
        mut snapshot: Vec<Message>,
        message: Message,
    ) -> Result<()> {
        let conversation_id = guard.conversation_id();

        match &self.repository {
            Some(repository) => {
                snapshot.push(message);
                repository.replace_all(conversation_id, &snapshot).await?;
                self.window.seed(conversation_id, &snapshot);
            }
            None => self.window.append(conversation_id, message),
        }
        tracing::debug!(%conversation_id, "exchange committed");
        Ok(())
    }

    /// Drop a conversation from storage and the window.
    pub async fn forget(&self, guard: &ConversationGuard) -> Result<()> {
        let conversation_id = guard.conversation_id();
        if let Some(repository) = &self.repository {
            repository.delete(conversation_id).await?;
        }
        self.window.evict(conversation_id);
        Ok(())
    }

    pub async fn conversation_ids(&self) -> Result<Vec<String>> {
        match &self.repository {
            Some(repository) => repository.list_conversation_ids().await,
            None => Ok(self.window.conversation_ids()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationLocks, QueryDialect, Role};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repository() -> MemoryRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = MemoryRepository::new(pool, QueryDialect::sqlite("chat_memory").unwrap());
        repository.initialize().await.unwrap();
        repository
    }

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(Message::role).collect()
    }

    #[tokio::test]
    async fn exchange_lands_in_repository_and_window() {
        let memory = ConversationMemory::persistent(20, repository().await);
        let locks = ConversationLocks::new();
        let guard = locks.acquire("c1").await;

        let snapshot = memory.record_user(&guard, Message::user("hello")).await.unwrap();
        memory
            .commit_assistant(&guard, snapshot, Message::assistant("Hi there"))
            .await
            .unwrap();

        let history = memory.history("c1").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
        assert_eq!(history[1].text(), "Hi there");
        assert_eq!(memory.window().size("c1"), 2);
    }

    #[tokio::test]
    async fn user_turn_survives_without_assistant_commit() {
        let memory = ConversationMemory::persistent(20, repository().await);
        let locks = ConversationLocks::new();
        let guard = locks.acquire("c1").await;

        memory.record_user(&guard, Message::user("hello")).await.unwrap();

        let history = memory.history("c1").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User]);
    }

    #[tokio::test]
    async fn recent_seeds_window_from_repository() {
        let repository = repository().await;
        let messages: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        repository.replace_all("c1", &messages).await.unwrap();

        let memory = ConversationMemory::persistent(3, repository);
        let locks = ConversationLocks::new();
        let guard = locks.acquire("c1").await;

        let recent = memory.recent(&guard).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn forget_clears_both_tiers() {
        let memory = ConversationMemory::persistent(20, repository().await);
        let locks = ConversationLocks::new();
        let guard = locks.acquire("c1").await;

        memory.record_user(&guard, Message::user("hello")).await.unwrap();
        memory.forget(&guard).await.unwrap();

        assert!(memory.history("c1").await.unwrap().is_empty());
        assert!(!memory.window().contains("c1"));
        assert!(memory.conversation_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn window_dropped_mid_exchange_is_rebuilt_from_storage() {
        let memory =
            ConversationMemory::persistent(20, repository().await).with_max_cached_conversations(1);
        let locks = ConversationLocks::new();
        let first = locks.acquire("c1").await;
        let other = locks.acquire("c2").await;

        memory.recent(&first).await.unwrap();
        let snapshot = memory.record_user(&first, Message::user("hello")).await.unwrap();

        // Another conversation pushes c1 out of the cache before the reply lands.
        memory.record_user(&other, Message::user("elsewhere")).await.unwrap();
        assert!(!memory.window().contains("c1"));

        memory
            .commit_assistant(&first, snapshot, Message::assistant("Hi there"))
            .await
            .unwrap();

        let recent = memory.recent(&first).await.unwrap();
        assert_eq!(roles(&recent), vec![Role::User, Role::Assistant]);
        assert_eq!(recent[0].text(), "hello");
    }

    #[tokio::test]
    async fn ephemeral_memory_uses_window_only() {
        let memory = ConversationMemory::ephemeral(2);
        assert!(!memory.is_persistent());
        let locks = ConversationLocks::new();
        let guard = locks.acquire("c1").await;

        for text in ["a", "b", "c"] {
            let snapshot = memory.record_user(&guard, Message::user(text)).await.unwrap();
            memory
                .commit_assistant(&guard, snapshot, Message::assistant(text))
                .await
                .unwrap();
        }

        let history = memory.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(memory.conversation_ids().await.unwrap(), vec!["c1".to_string()]);
    }
}
