//! Advisors: ordered interceptors around every model request.

pub mod chain;
pub mod content_filter;
pub mod logger;

pub use chain::{AdvisorChain, AdvisorChainBuilder, Next, Terminal};
pub use content_filter::ContentFilterAdvisor;
pub use logger::LoggerAdvisor;

use crate::conversation::Message;
use crate::error::Result;
use crate::llm::FragmentStream;

use std::future::Future;
use std::pin::Pin;

/// The pending request an advisor inspects.
#[derive(Debug, Clone)]
pub struct AdvisedRequest {
    pub conversation_id: String,
    /// The new user-authored text.
    pub user_text: String,
    /// Prior turns from the conversation window, oldest first.
    pub history: Vec<Message>,
    /// Rendered system-role context, if any.
    pub system: Option<String>,
}

/// Where a response stream came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// The request reached the model.
    Model,
    /// An advisor answered without calling through.
    Advisor { name: String },
}

impl std::fmt::Display for ResponseOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseOrigin::Model => write!(f, "model"),
            ResponseOrigin::Advisor { name } => write!(f, "advisor:{}", name),
        }
    }
}

/// A response stream plus its provenance.
pub struct AdvisedResponse {
    pub stream: FragmentStream,
    pub origin: ResponseOrigin,
}

impl AdvisedResponse {
    pub fn from_model(stream: FragmentStream) -> Self {
        Self {
            stream,
            origin: ResponseOrigin::Model,
        }
    }

    /// A complete single-fragment answer produced by an advisor.
    pub fn substitute(advisor: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            stream: Box::pin(futures::stream::once(async move { Ok::<_, crate::Error>(text) })),
            origin: ResponseOrigin::Advisor {
                name: advisor.to_string(),
            },
        }
    }

    /// Replace the stream, keeping the provenance.
    pub fn map_stream(self, map: impl FnOnce(FragmentStream) -> FragmentStream) -> Self {
        Self {
            stream: map(self.stream),
            origin: self.origin,
        }
    }
}

impl std::fmt::Debug for AdvisedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisedResponse")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Static trait for advisors.
///
/// An advisor either calls `next.run(request)` and optionally wraps the
/// returned stream, or returns its own response without calling through.
/// Returning `Err` aborts the whole chain before anything is streamed.
pub trait Advisor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Lower values run first (outermost).
    fn priority(&self) -> i32;

    fn around_stream(
        &self,
        request: AdvisedRequest,
        next: Next,
    ) -> impl Future<Output = Result<AdvisedResponse>> + Send;
}

/// Dynamic companion of [`Advisor`] so the chain can hold heterogeneous advisors.
pub trait AdvisorDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn around_stream<'a>(
        &'a self,
        request: AdvisedRequest,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<AdvisedResponse>> + Send + 'a>>;
}

impl<T: Advisor> AdvisorDyn for T {
    fn name(&self) -> &str {
        Advisor::name(self)
    }

    fn priority(&self) -> i32 {
        Advisor::priority(self)
    }

    fn around_stream<'a>(
        &'a self,
        request: AdvisedRequest,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<AdvisedResponse>> + Send + 'a>> {
        Box::pin(Advisor::around_stream(self, request, next))
    }
}
