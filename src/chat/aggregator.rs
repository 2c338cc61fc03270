//! StreamAggregator: forwards fragments while accumulating the final reply.

use crate::error::{Error, LlmError, Result};
use crate::llm::FragmentStream;

use futures::StreamExt as _;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives the full reply text once the upstream stream completes naturally.
pub type OnComplete = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<()>> + Send>;

/// Turns a fragment stream into exactly one commit of the complete reply.
///
/// Fragments are forwarded unchanged and in order. When the upstream finishes,
/// `on_complete` runs once on a spawned task, so dropping the stream after the
/// last fragment does not abandon a commit already under way. An upstream
/// error, a cancellation, an idle timeout, or dropping the stream early
/// discards the partial text and `on_complete` never runs.
#[derive(Debug, Clone)]
pub struct StreamAggregator {
    conversation_id: String,
    idle_timeout: Option<Duration>,
    cancellation: CancellationToken,
}

/// What ended the wait for the next fragment.
enum Step {
    Item(Option<Result<String>>),
    Cancelled,
    TimedOut(Duration),
}

/// Accumulated reply; logs discarded partial text when dropped unfinished.
struct Accumulator {
    conversation_id: String,
    text: String,
    fragments: usize,
    finished: bool,
}

impl Accumulator {
    fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    fn finish(&mut self) -> String {
        self.finished = true;
        std::mem::take(&mut self.text)
    }
}

impl Drop for Accumulator {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(
                conversation_id = %self.conversation_id,
                fragments = self.fragments,
                discarded_chars = self.text.chars().count(),
                "response ended before completion, partial reply discarded"
            );
        }
    }
}

impl StreamAggregator {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            idle_timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Give up when no fragment arrives within `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Stop when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn aggregate(self, mut inner: FragmentStream, on_complete: OnComplete) -> FragmentStream {
        let Self {
            conversation_id,
            idle_timeout,
            cancellation,
        } = self;

        Box::pin(async_stream::stream! {
            let mut accumulator = Accumulator {
                conversation_id: conversation_id.clone(),
                text: String::new(),
                fragments: 0,
                finished: false,
            };

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => Step::Cancelled,
                    step = next_fragment(&mut inner, idle_timeout) => step,
                };

                match step {
                    Step::Item(Some(Ok(fragment))) => {
                        accumulator.push(&fragment);
                        yield Ok(fragment);
                    }
                    Step::Item(Some(Err(error))) => {
                        tracing::warn!(%conversation_id, %error, "upstream generation failed");
                        yield Err(error);
                        return;
                    }
                    Step::Item(None) => break,
                    Step::Cancelled => {
                        yield Err(LlmError::Cancelled {
                            reason: "cancelled by caller".into(),
                        }
                        .into());
                        return;
                    }
                    Step::TimedOut(after) => {
                        tracing::warn!(%conversation_id, ?after, "no fragment before idle timeout");
                        yield Err(LlmError::TimedOut { after }.into());
                        return;
                    }
                }
            }

            // Tell the provider to stop before the commit runs.
            drop(inner);

            let text = accumulator.finish();
            let commit = tokio::spawn(on_complete(text));
            match commit.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(%conversation_id, %error, "reply generated but not persisted");
                    yield Err(error);
                }
                Err(join_error) => {
                    yield Err(Error::Other(anyhow::anyhow!("commit task failed: {join_error}")));
                }
            }
        })
    }
}

async fn next_fragment(inner: &mut FragmentStream, idle_timeout: Option<Duration>) -> Step {
    match idle_timeout {
        Some(after) => match tokio::time::timeout(after, inner.next()).await {
            Ok(item) => Step::Item(item),
            Err(_) => Step::TimedOut(after),
        },
        None => Step::Item(inner.next().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    type Commits = Arc<Mutex<Vec<String>>>;

    fn recording(commits: &Commits) -> OnComplete {
        let commits = commits.clone();
        Box::new(move |text| {
            Box::pin(async move {
                commits.lock().unwrap().push(text);
                Ok(())
            })
        })
    }

    fn fragments(items: Vec<Result<String>>) -> FragmentStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn forwards_in_order_and_commits_once() {
        let commits = Commits::default();
        let stream = StreamAggregator::new("c1").aggregate(
            fragments(vec![Ok("Hi".into()), Ok(" there".into())]),
            recording(&commits),
        );

        let items: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec!["Hi", " there"]);
        assert_eq!(*commits.lock().unwrap(), vec!["Hi there".to_string()]);
    }

    #[tokio::test]
    async fn polling_after_completion_stays_finished() {
        let commits = Commits::default();
        let mut stream = StreamAggregator::new("c1")
            .aggregate(fragments(vec![Ok("x".into())]), recording(&commits));

        while stream.next().await.is_some() {}
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_error_discards_partial_reply() {
        let commits = Commits::default();
        let stream = StreamAggregator::new("c1").aggregate(
            fragments(vec![
                Ok("Hi".into()),
                Err(LlmError::GenerationFailed("boom".into()).into()),
                Ok("late".into()),
            ]),
            recording(&commits),
        );

        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(Error::Llm(LlmError::GenerationFailed(_)))));
        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_mid_stream_never_commits() {
        let commits = Commits::default();
        let upstream: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, Error>("Hi".to_string())])
                .chain(futures::stream::pending()),
        );
        let mut stream = StreamAggregator::new("c1").aggregate(upstream, recording(&commits));

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        drop(stream);

        tokio::task::yield_now().await;
        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_yields_single_error() {
        let commits = Commits::default();
        let token = CancellationToken::new();
        let upstream: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, Error>("Hi".to_string())])
                .chain(futures::stream::pending()),
        );
        let mut stream = StreamAggregator::new("c1")
            .with_cancellation(token.clone())
            .aggregate(upstream, recording(&commits));

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        token.cancel();
        assert!(matches!(
            stream.next().await,
            Some(Err(Error::Llm(LlmError::Cancelled { .. })))
        ));
        assert!(stream.next().await.is_none());
        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_stops_a_stalled_stream() {
        let commits = Commits::default();
        let upstream: FragmentStream = Box::pin(futures::stream::pending::<Result<String>>());
        let mut stream = StreamAggregator::new("c1")
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .aggregate(upstream, recording(&commits));

        assert!(matches!(
            stream.next().await,
            Some(Err(Error::Llm(LlmError::TimedOut { .. })))
        ));
        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_failure_is_the_terminal_item() {
        let on_complete: OnComplete = Box::new(|_text| {
            Box::pin(async {
                Err(MemoryError::PersistenceFailed {
                    conversation_id: "c1".into(),
                    reason: "disk full".into(),
                }
                .into())
            })
        });
        let stream = StreamAggregator::new("c1")
            .aggregate(fragments(vec![Ok("Hi".into())]), on_complete);

        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
        assert!(items[1].as_ref().unwrap_err().is_persistence_failure());
    }

    #[tokio::test]
    async fn commit_finishes_even_if_stream_dropped_while_waiting() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<String>();
        let on_complete: OnComplete = Box::new(move |text| {
            Box::pin(async move {
                let _ = release_rx.await;
                let _ = done_tx.send(text);
                Ok(())
            })
        });
        let mut stream = StreamAggregator::new("c1")
            .aggregate(fragments(vec![Ok("Hi".into())]), on_complete);

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        tokio_test::assert_pending!(futures::poll!(stream.next()));
        drop(stream);

        release_tx.send(()).unwrap();
        let committed = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("commit should still run")
            .expect("commit should report");
        assert_eq!(committed, "Hi");
    }
}
