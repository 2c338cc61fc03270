//! ContentFilterAdvisor: refuses requests that mention a blocked term.

use crate::advisor::{AdvisedRequest, AdvisedResponse, Advisor, Next};
use crate::error::Result;

/// Built-in blocked terms.
pub const DEFAULT_BLOCKED_TERMS: &[&str] = &[
    "暴力", "色情", "赌博", "毒品", "政治", "恐怖", "骚扰", "歧视", "侮辱", "威胁", "仇恨", "谁侮辱",
];

/// Returned as the whole response when a request is refused.
pub const DEFAULT_REFUSAL: &str =
    "很抱歉，您的请求包含敏感内容，无法提供相关回答。请调整您的提问，避免包含不适当的内容。";

/// Case-insensitive substring filter over the user-authored text.
#[derive(Debug, Clone)]
pub struct ContentFilterAdvisor {
    blocked_terms: Vec<String>,
    refusal: String,
}

impl ContentFilterAdvisor {
    pub const NAME: &'static str = "content_filter";
    pub const PRIORITY: i32 = 5;

    /// Empty terms are dropped; they would match every input.
    pub fn new<I, S>(blocked_terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocked_terms = blocked_terms
            .into_iter()
            .map(|term| term.as_ref().trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();

        Self {
            blocked_terms,
            refusal: DEFAULT_REFUSAL.to_string(),
        }
    }

    pub fn with_refusal(mut self, refusal: impl Into<String>) -> Self {
        self.refusal = refusal.into();
        self
    }

    pub fn refusal(&self) -> &str {
        &self.refusal
    }

    /// First configured term contained in `text`, if any.
    pub fn find_blocked_term(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.blocked_terms
            .iter()
            .find(|term| lowered.contains(term.as_str()))
            .map(String::as_str)
    }
}

impl Default for ContentFilterAdvisor {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_TERMS)
    }
}

impl Advisor for ContentFilterAdvisor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn around_stream(&self, request: AdvisedRequest, next: Next) -> Result<AdvisedResponse> {
        if let Some(term) = self.find_blocked_term(&request.user_text) {
            tracing::info!(
                conversation_id = %request.conversation_id,
                %term,
                "request refused by content filter"
            );
            return Ok(AdvisedResponse::substitute(Self::NAME, self.refusal.clone()));
        }

        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorChain, ResponseOrigin, Terminal};
    use futures::StreamExt as _;
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Terminal for Counting {
        fn call(&self, _request: AdvisedRequest) -> BoxFuture<'_, Result<AdvisedResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(AdvisedResponse::from_model(Box::pin(futures::stream::iter(
                    vec![Ok::<_, crate::Error>("model".to_string())],
                ))))
            })
        }
    }

    fn request(text: &str) -> AdvisedRequest {
        AdvisedRequest {
            conversation_id: "c1".into(),
            user_text: text.into(),
            history: Vec::new(),
            system: None,
        }
    }

    #[test]
    fn matches_inside_longer_text() {
        let filter = ContentFilterAdvisor::default();
        assert_eq!(filter.find_blocked_term("请不要骚扰我"), Some("骚扰"));
        assert_eq!(filter.find_blocked_term("今天天气怎么样"), None);
    }

    #[test]
    fn matching_ignores_case() {
        let filter = ContentFilterAdvisor::new(["Casino"]);
        assert_eq!(filter.find_blocked_term("where is the CASINO?"), Some("casino"));
        assert_eq!(filter.find_blocked_term("occasional"), None);
    }

    #[test]
    fn short_terms_match_inside_words() {
        let filter = ContentFilterAdvisor::new(["ass"]);
        assert!(filter.find_blocked_term("classic").is_some());
    }

    #[test]
    fn empty_terms_are_ignored() {
        let filter = ContentFilterAdvisor::new(["", "   "]);
        assert_eq!(filter.find_blocked_term("anything"), None);
    }

    #[tokio::test]
    async fn blocked_request_gets_single_refusal() {
        let chain = AdvisorChain::builder()
            .advisor(ContentFilterAdvisor::default())
            .build();
        let terminal = Arc::new(Counting::default());

        let response = chain
            .call(request("我想骚扰别人"), terminal.clone())
            .await
            .unwrap();
        assert_eq!(
            response.origin,
            ResponseOrigin::Advisor {
                name: ContentFilterAdvisor::NAME.into()
            }
        );
        let fragments: Vec<String> = response
            .stream
            .map(|fragment| fragment.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec![DEFAULT_REFUSAL.to_string()]);
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clean_request_calls_through() {
        let chain = AdvisorChain::builder()
            .advisor(ContentFilterAdvisor::default().with_refusal("nope"))
            .build();
        let terminal = Arc::new(Counting::default());

        let response = chain.call(request("hello"), terminal.clone()).await.unwrap();
        assert_eq!(response.origin, ResponseOrigin::Model);
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_refusal_is_the_chinese_notice() {
        assert_eq!(
            ContentFilterAdvisor::default().refusal(),
            "很抱歉，您的请求包含敏感内容，无法提供相关回答。请调整您的提问，避免包含不适当的内容。"
        );
    }
}
