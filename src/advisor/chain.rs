//! Priority-ordered advisor chain.

use crate::advisor::{
    AdvisedRequest, AdvisedResponse, AdvisorDyn, ContentFilterAdvisor, LoggerAdvisor,
};
use crate::config::AdvisorConfig;
use crate::error::Result;

use futures::future::BoxFuture;
use std::sync::Arc;

/// The stage after the last advisor: the call into the model.
pub trait Terminal: Send + Sync + 'static {
    fn call(&self, request: AdvisedRequest) -> BoxFuture<'_, Result<AdvisedResponse>>;
}

/// Handle to the remainder of the chain, given to each advisor.
#[derive(Clone)]
pub struct Next {
    advisors: Arc<[Arc<dyn AdvisorDyn>]>,
    position: usize,
    terminal: Arc<dyn Terminal>,
}

impl Next {
    /// Invoke the next advisor, or the terminal stage once every advisor has run.
    pub fn run(self, request: AdvisedRequest) -> BoxFuture<'static, Result<AdvisedResponse>> {
        Box::pin(async move {
            match self.advisors.get(self.position).cloned() {
                Some(advisor) => {
                    let next = Next {
                        advisors: self.advisors.clone(),
                        position: self.position + 1,
                        terminal: self.terminal.clone(),
                    };
                    tracing::trace!(advisor = advisor.name(), "entering advisor");
                    advisor.around_stream(request, next).await
                }
                None => self.terminal.call(request).await,
            }
        })
    }
}

/// Immutable ordered list of advisors. Ascending priority; lowest is outermost.
#[derive(Clone)]
pub struct AdvisorChain {
    advisors: Arc<[Arc<dyn AdvisorDyn>]>,
}

impl AdvisorChain {
    /// Build a chain. Advisors with equal priority keep their given order.
    pub fn new(mut advisors: Vec<Arc<dyn AdvisorDyn>>) -> Self {
        advisors.sort_by_key(|advisor| advisor.priority());
        Self {
            advisors: advisors.into(),
        }
    }

    pub fn builder() -> AdvisorChainBuilder {
        AdvisorChainBuilder::default()
    }

    /// The logger and content filter, configured from `[advisors]`.
    pub fn from_config(config: &AdvisorConfig) -> Self {
        let mut builder = Self::builder();
        if config.log_requests {
            builder = builder.advisor(LoggerAdvisor::new());
        }
        let filter = ContentFilterAdvisor::new(config.blocked_terms.iter().cloned())
            .with_refusal(config.refusal.clone());
        builder.advisor(filter).build()
    }

    /// Advisor names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.advisors.iter().map(|advisor| advisor.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.advisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advisors.is_empty()
    }

    /// Run `request` through every advisor and then `terminal`.
    pub async fn call(
        &self,
        request: AdvisedRequest,
        terminal: Arc<dyn Terminal>,
    ) -> Result<AdvisedResponse> {
        Next {
            advisors: self.advisors.clone(),
            position: 0,
            terminal,
        }
        .run(request)
        .await
    }
}

impl std::fmt::Debug for AdvisorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorChain")
            .field("advisors", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct AdvisorChainBuilder {
    advisors: Vec<Arc<dyn AdvisorDyn>>,
}

impl AdvisorChainBuilder {
    pub fn advisor(mut self, advisor: impl AdvisorDyn) -> Self {
        self.advisors.push(Arc::new(advisor));
        self
    }

    pub fn build(self) -> AdvisorChain {
        AdvisorChain::new(self.advisors)
    }
}
