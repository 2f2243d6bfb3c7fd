mod cloud_api;
mod local_engine;
mod server;

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{AnalysisBackendKind, AnalysisRequest, FinalResult, PartialResult},
    config::AdvisorConfig,
    engine::EngineLifecycleManager,
    error::AnalysisError,
};
pub use cloud_api::CloudApiBackend;
pub use local_engine::LocalEngineBackend;
pub use server::ServerBackend;

const HTTP_USER_AGENT: &str = "rusty-move-advisor/0.1";

/// One way of getting a best move for a position.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn kind(&self) -> AnalysisBackendKind;

    /// Analyses `request.position`, reporting progress through `ctx` and resolving
    /// to exactly one final result or an error.
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<FinalResult, AnalysisError>;
}

/// Per-call plumbing handed to a backend: progress callback, advisory cancel
/// token and the soft deadline.
#[derive(Clone)]
pub struct CallContext {
    progress: Arc<dyn Fn(PartialResult) + Send + Sync>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub budget: Duration,
}

impl CallContext {
    pub fn new<F>(budget: Duration, cancel: CancellationToken, progress: F) -> CallContext
    where
        F: Fn(PartialResult) + Send + Sync + 'static,
    {
        CallContext {
            progress: Arc::new(progress),
            cancel,
            deadline: Instant::now() + budget,
            budget,
        }
    }

    /// A context nobody listens to.
    pub fn detached(budget: Duration) -> CallContext {
        CallContext::new(budget, CancellationToken::new(), |_| {})
    }

    pub fn report_progress(&self, partial: PartialResult) {
        (self.progress)(partial)
    }

    /// Runs `fut` until the soft deadline.
    pub async fn within_deadline<T, F>(&self, fut: F) -> Result<T, AnalysisError>
    where
        F: Future<Output = Result<T, AnalysisError>>,
    {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .unwrap_or(Err(AnalysisError::Timeout(self.budget)))
    }
}

/// The ordered list of backends tried for one logical request. Each kind appears
/// at most once, so no backend is retried within a request.
#[derive(Clone, Default)]
pub struct FallbackChain {
    backends: Vec<Arc<dyn AnalysisBackend>>,
}

impl FallbackChain {
    pub fn new(backends: Vec<Arc<dyn AnalysisBackend>>) -> FallbackChain {
        let mut chain = FallbackChain::default();
        for backend in backends {
            if !chain.kinds().contains(&backend.kind()) {
                chain.backends.push(backend);
            }
        }
        chain
    }

    /// Builds the configured chain. With book moves enabled the cloud API is
    /// consulted first.
    pub fn from_config(config: &AdvisorConfig, engine: Arc<EngineLifecycleManager>) -> Result<Self> {
        let client = http_client(config.backend_timeout())?;

        let mut order = config.fallback_chain_order.clone();
        if config.use_book_moves {
            order.retain(|kind| *kind != AnalysisBackendKind::CloudApi);
            order.insert(0, AnalysisBackendKind::CloudApi);
        }

        let backends = order
            .into_iter()
            .map(|kind| -> Arc<dyn AnalysisBackend> {
                match kind {
                    AnalysisBackendKind::LocalEngine => {
                        Arc::new(LocalEngineBackend::from_config(config, engine.clone()))
                    }
                    AnalysisBackendKind::CloudApi => {
                        Arc::new(CloudApiBackend::from_config(config, client.clone()))
                    }
                    AnalysisBackendKind::Server => {
                        Arc::new(ServerBackend::from_config(config, client.clone()))
                    }
                }
            })
            .collect();

        Ok(FallbackChain::new(backends))
    }

    pub fn kinds(&self) -> Vec<AnalysisBackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    pub fn backends(&self) -> &[Arc<dyn AnalysisBackend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Moves `kind` to the front; false if the chain has no such backend.
    pub fn promote(&mut self, kind: AnalysisBackendKind) -> bool {
        match self.backends.iter().position(|b| b.kind() == kind) {
            Some(index) => {
                let backend = self.backends.remove(index);
                self.backends.insert(0, backend);
                true
            }
            None => false,
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(HTTP_USER_AGENT)
        .timeout(timeout)
        .build()?;
    Ok(client)
}
