//! LoggerAdvisor: traces each request and its completed response.

use crate::advisor::{AdvisedRequest, AdvisedResponse, Advisor, Next};
use crate::error::Result;
use crate::telemetry::truncate_for_log;

use futures::StreamExt as _;

/// Observes requests and, once a stream finishes naturally, the aggregated reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerAdvisor;

impl LoggerAdvisor {
    pub const NAME: &'static str = "logger";
    pub const PRIORITY: i32 = 0;

    pub fn new() -> Self {
        Self
    }
}

impl Advisor for LoggerAdvisor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn around_stream(&self, request: AdvisedRequest, next: Next) -> Result<AdvisedResponse> {
        let conversation_id = request.conversation_id.clone();
        let (text, _) = truncate_for_log(&request.user_text, 200);
        tracing::info!(
            %conversation_id,
            history = request.history.len(),
            %text,
            "chat request"
        );

        let response = next.run(request).await?;
        let origin = response.origin.clone();

        Ok(response.map_stream(|mut inner| {
            Box::pin(async_stream::stream! {
                let mut aggregated = String::new();
                let mut fragments = 0usize;

                while let Some(item) = inner.next().await {
                    match item {
                        Ok(fragment) => {
                            aggregated.push_str(&fragment);
                            fragments += 1;
                            yield Ok(fragment);
                        }
                        Err(error) => {
                            tracing::warn!(%conversation_id, %error, "chat response failed");
                            yield Err(error);
                            return;
                        }
                    }
                }

                // Unreached when the consumer drops the stream early or it fails.
                let (text, _) = truncate_for_log(&aggregated, 500);
                tracing::info!(
                    %conversation_id,
                    %origin,
                    fragments,
                    %text,
                    "chat response complete"
                );
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorChain, Terminal};
    use crate::error::LlmError;
    use crate::telemetry::CapturedLogs;
    use futures::future::BoxFuture;
    use std::sync::Arc;

    struct Scripted(Vec<Result<String>>);

    impl Terminal for Scripted {
        fn call(&self, _request: AdvisedRequest) -> BoxFuture<'_, Result<AdvisedResponse>> {
            let items: Vec<Result<String>> = self
                .0
                .iter()
                .map(|item| match item {
                    Ok(text) => Ok(text.clone()),
                    Err(_) => Err(LlmError::GenerationFailed("scripted".into()).into()),
                })
                .collect();
            Box::pin(async move {
                Ok(AdvisedResponse::from_model(Box::pin(futures::stream::iter(
                    items,
                ))))
            })
        }
    }

    fn request() -> AdvisedRequest {
        AdvisedRequest {
            conversation_id: "c1".into(),
            user_text: "hello".into(),
            history: Vec::new(),
            system: None,
        }
    }

    const COMPLETED: &str = "chat response complete";

    #[tokio::test]
    async fn natural_end_logs_the_reply_once() {
        let logs = CapturedLogs::start();
        let chain = AdvisorChain::builder().advisor(LoggerAdvisor::new()).build();
        let terminal = Arc::new(Scripted(vec![Ok("Hi".into()), Ok(" there".into())]));

        let mut stream = chain.call(request(), terminal).await.unwrap().stream;
        while stream.next().await.is_some() {}
        assert!(stream.next().await.is_none());

        assert_eq!(logs.count(COMPLETED), 1);
        assert_eq!(logs.count("text=Hi there"), 1);
    }

    #[tokio::test]
    async fn failed_stream_logs_no_completion() {
        let logs = CapturedLogs::start();
        let chain = AdvisorChain::builder().advisor(LoggerAdvisor::new()).build();
        let terminal = Arc::new(Scripted(vec![
            Ok("Hi".into()),
            Err(LlmError::GenerationFailed("x".into()).into()),
        ]));

        let response = chain.call(request(), terminal).await.unwrap();
        let _items: Vec<Result<String>> = response.stream.collect().await;

        assert_eq!(logs.count(COMPLETED), 0);
        assert_eq!(logs.count("chat response failed"), 1);
    }

    #[tokio::test]
    async fn dropped_stream_logs_no_completion() {
        let logs = CapturedLogs::start();
        let chain = AdvisorChain::builder().advisor(LoggerAdvisor::new()).build();
        let terminal = Arc::new(Scripted(vec![Ok("Hi".into()), Ok(" there".into())]));

        let mut stream = chain.call(request(), terminal).await.unwrap().stream;
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        drop(stream);

        assert_eq!(logs.count(COMPLETED), 0);
    }

    #[tokio::test]
    async fn forwards_fragments_unchanged() {
        let chain = AdvisorChain::builder().advisor(LoggerAdvisor::new()).build();
        let terminal = Arc::new(Scripted(vec![Ok("Hi".into()), Ok(" there".into())]));

        let response = chain.call(request(), terminal).await.unwrap();
        let fragments: Vec<String> = response
            .stream
            .map(|fragment| fragment.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn forwards_errors_and_stops() {
        let chain = AdvisorChain::builder().advisor(LoggerAdvisor::new()).build();
        let terminal = Arc::new(Scripted(vec![
            Ok("Hi".into()),
            Err(LlmError::GenerationFailed("x".into()).into()),
            Ok("never".into()),
        ]));

        let response = chain.call(request(), terminal).await.unwrap();
        let items: Vec<Result<String>> = response.stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
