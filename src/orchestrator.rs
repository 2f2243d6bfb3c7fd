//! The move-suggestion orchestrator.
//!
//! Issues one "get best move" operation per position change, gives it a strictly
//! increasing [`RequestId`], walks the fallback chain with that same id and
//! decides, for every result that comes back, whether it is still authoritative.
//! A result is accepted only if it belongs to the newest request, that request has
//! not been answered yet, and the live board still shows the analysed position.
//! Everything else is stale and dropped silently.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{AnalysisBackendKind, AnalysisRequest, FinalResult, PartialResult, RequestId},
    backend::{CallContext, FallbackChain},
    config::AdvisorConfig,
    engine::EngineLifecycleManager,
    error::{AnalysisError, ErrorKind},
    position::Position,
    throttle::ThrottleWindow,
};

/// Extra time past the soft deadline before a backend call is abandoned outright.
const HARD_DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Supplies the live board.
pub trait PositionSource: Send + Sync {
    /// `None` when no board can be read right now
    fn current_position(&self) -> Option<Position>;
}

/// Consumes accepted analysis (highlighting, score keeping, logging).
pub trait ResultSink: Send + Sync {
    fn on_progress(&self, partial: &PartialResult);

    fn on_accepted(&self, result: &FinalResult);

    fn on_terminal_error(&self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub min_interval: Duration,
    /// soft deadline of one backend call
    pub backend_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AdvisorConfig) -> OrchestratorSettings {
        OrchestratorSettings {
            min_interval: config.min_interval(),
            backend_timeout: config.backend_timeout(),
        }
    }
}

struct OrchestratorState {
    request_counter: RequestId,
    latest_issued: Option<RequestId>,
    latest_accepted: Option<RequestId>,
    last_observed_position: Option<Position>,
    /// the latest request while it is still waiting for an answer
    open_request: Option<(RequestId, Position)>,
    throttle: ThrottleWindow,
    current_cancel: Option<CancellationToken>,
}

impl OrchestratorState {
    fn close(&mut self, id: RequestId) {
        if self.open_request.as_ref().is_some_and(|(open, _)| *open == id) {
            self.open_request = None;
        }
    }

    fn is_latest(&self, id: RequestId) -> bool {
        self.latest_issued == Some(id)
    }

    /// Whether a result for (`id`, `position`) may still be shown while the board
    /// shows `live`.
    fn admits(&self, id: RequestId, position: &Position, live: Option<&Position>) -> bool {
        if !self.is_latest(id) {
            debug!("[{id}] Ignoring stale response (request ID mismatch)");
            return false;
        }
        if self.latest_accepted == Some(id) {
            debug!("[{id}] already answered, ignoring");
            return false;
        }
        if live != Some(position) {
            debug!("[{id}] Position changed, discarding analysis");
            return false;
        }
        true
    }
}

struct Inner {
    source: Arc<dyn PositionSource>,
    sink: Arc<dyn ResultSink>,
    chain: RwLock<FallbackChain>,
    engine: Option<Arc<EngineLifecycleManager>>,
    backend_timeout: Duration,
    state: Mutex<OrchestratorState>,
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    pub fn new(
        source: Arc<dyn PositionSource>,
        sink: Arc<dyn ResultSink>,
        chain: FallbackChain,
        engine: Option<Arc<EngineLifecycleManager>>,
        settings: OrchestratorSettings,
    ) -> RequestOrchestrator {
        RequestOrchestrator {
            inner: Arc::new(Inner {
                source,
                sink,
                chain: RwLock::new(chain),
                engine,
                backend_timeout: settings.backend_timeout,
                state: Mutex::new(OrchestratorState {
                    request_counter: RequestId::new(0),
                    latest_issued: None,
                    latest_accepted: None,
                    last_observed_position: None,
                    open_request: None,
                    throttle: ThrottleWindow::new(settings.min_interval),
                    current_cancel: None,
                }),
            }),
        }
    }

    /// Reads the live board and requests analysis for it.
    pub fn on_position_changed(&self) -> Option<RequestId> {
        match self.inner.source.current_position() {
            Some(position) => self.request_analysis(position),
            None => {
                debug!("no readable board, nothing to analyse");
                None
            }
        }
    }

    /// Fire-and-forget: results arrive through the [`ResultSink`]. Returns the id
    /// assigned to the request, or `None` if it was deduplicated or throttled.
    pub fn request_analysis(&self, position: Position) -> Option<RequestId> {
        self.issue(position, false)
    }

    /// Re-analyses `position` even if it has already been answered. Still throttled.
    pub fn request_analysis_forced(&self, position: Position) -> Option<RequestId> {
        self.issue(position, true)
    }

    fn issue(&self, position: Position, forced: bool) -> Option<RequestId> {
        let now = Instant::now();
        let cancel = CancellationToken::new();

        // dedup, throttle and id assignment happen before anything can suspend
        let request = {
            let mut state = self.inner.state.lock();

            if !forced {
                let answered = state.last_observed_position.as_ref() == Some(&position);
                let pending = state
                    .open_request
                    .as_ref()
                    .is_some_and(|(_, open)| *open == position);
                if answered || pending {
                    debug!("position unchanged, no new request");
                    return None;
                }
            }

            if !state.throttle.try_admit(now) {
                debug!("Request throttled - too soon since last request");
                return None;
            }

            let id = state.request_counter.next();
            state.request_counter = id;
            state.latest_issued = Some(id);
            state.open_request = Some((id, position.clone()));
            if let Some(previous) = state.current_cancel.replace(cancel.clone()) {
                previous.cancel();
            }

            AnalysisRequest {
                id,
                position,
                issued_at: now,
            }
        };

        let id = request.id;
        info!("[{id}] Requesting analysis{}", if forced { " (forced)" } else { "" });
        tokio::spawn(dispatch(self.inner.clone(), request, cancel));
        Some(id)
    }

    /// Puts `kind` at the front of the chain; switching to the local engine
    /// reloads it.
    pub async fn switch_backend(&self, kind: AnalysisBackendKind) -> Result<()> {
        if !self.inner.chain.write().promote(kind) {
            bail!("backend {kind} is not part of the fallback chain");
        }
        info!("switched primary analysis backend to {kind}");

        if kind == AnalysisBackendKind::LocalEngine {
            if let Some(engine) = &self.inner.engine {
                engine.force_reload().await?;
            }
        }
        Ok(())
    }

    pub fn chain_order(&self) -> Vec<AnalysisBackendKind> {
        self.inner.chain.read().kinds()
    }

    pub fn latest_issued(&self) -> Option<RequestId> {
        self.inner.state.lock().latest_issued
    }

    pub fn latest_accepted(&self) -> Option<RequestId> {
        self.inner.state.lock().latest_accepted
    }

    /// Cancels the running request and tears the local engine down.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.inner.state.lock().current_cancel.take() {
            cancel.cancel();
        }
        if let Some(engine) = &self.inner.engine {
            engine.shutdown().await;
        }
    }
}

async fn dispatch(inner: Arc<Inner>, request: AnalysisRequest, cancel: CancellationToken) {
    let backends = inner.chain.read().backends().to_vec();
    let mut failures: Vec<(AnalysisBackendKind, AnalysisError)> = Vec::new();

    for backend in backends {
        if !inner.state.lock().is_latest(request.id) {
            debug!("[{}] superseded, abandoning the fallback chain", request.id);
            inner.state.lock().close(request.id);
            return;
        }

        let kind = backend.kind();
        let ctx = inner.call_context(&request, &cancel);
        debug!("[{}] asking {kind}", request.id);

        let outcome = match tokio::time::timeout(
            ctx.budget + HARD_DEADLINE_GRACE,
            backend.analyze(&request, &ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AnalysisError::Timeout(ctx.budget)),
        };

        match outcome {
            Ok(result) => {
                inner.deliver_final(&request, result);
                return;
            }
            Err(e) if e.is_stale() => {
                let superseded =
                    cancel.is_cancelled() || !inner.state.lock().is_latest(request.id);
                if superseded {
                    debug!("[{}] {kind}: {e}", request.id);
                    inner.state.lock().close(request.id);
                    return;
                }
                // only this orchestrator decides what is stale
                warn!("[{}] {kind} dropped a request that is still current", request.id);
                failures.push((
                    kind,
                    AnalysisError::NoData(format!("{kind} reported the request as superseded")),
                ));
            }
            Err(e) => {
                warn!("[{}] {kind} failed: {e}", request.id);
                failures.push((kind, e));
            }
        }
    }

    inner.surface_exhaustion(&request, failures);
}

impl Inner {
    fn call_context(self: &Arc<Self>, request: &AnalysisRequest, cancel: &CancellationToken) -> CallContext {
        let inner = Arc::clone(self);
        let id = request.id;
        let position = request.position.clone();
        CallContext::new(self.backend_timeout, cancel.clone(), move |partial| {
            inner.deliver_progress(id, &position, partial)
        })
    }

    fn deliver_progress(&self, id: RequestId, position: &Position, partial: PartialResult) {
        if partial.request_id != id {
            return;
        }
        let live = self.source.current_position();
        let admitted = self.state.lock().admits(id, position, live.as_ref());
        if admitted {
            self.sink.on_progress(&partial);
        }
    }

    fn deliver_final(&self, request: &AnalysisRequest, result: FinalResult) {
        let id = request.id;
        // the source may call back into the orchestrator, so it is read unlocked
        let live = self.source.current_position();
        let accepted = {
            let mut state = self.state.lock();
            let accepted =
                result.request_id == id && state.admits(id, &request.position, live.as_ref());
            if accepted {
                state.latest_accepted = Some(id);
                state.last_observed_position = Some(request.position.clone());
            }
            state.close(id);
            accepted
        };
        if !accepted {
            return;
        }

        if result.source == AnalysisBackendKind::LocalEngine {
            if let Some(engine) = &self.engine {
                engine.record_accepted();
            }
        }

        info!(
            "[{id}] bestmove {} via {} (depth {}, {}) after {:?}",
            result.best_move,
            result.source,
            result
                .depth
                .map_or_else(|| "?".to_string(), |d| d.to_string()),
            result
                .score
                .map_or_else(|| "no score".to_string(), |s| s.to_string()),
            request.issued_at.elapsed(),
        );
        self.sink.on_accepted(&result);
    }

    fn surface_exhaustion(
        &self,
        request: &AnalysisRequest,
        failures: Vec<(AnalysisBackendKind, AnalysisError)>,
    ) {
        let id = request.id;
        let surface = {
            let mut state = self.state.lock();
            let surface = state.is_latest(id) && state.latest_accepted != Some(id);
            state.close(id);
            surface
        };
        if !surface {
            debug!("[{id}] every backend failed, but the request is stale anyway");
            return;
        }

        let (kind, message) = match failures.last() {
            Some((_, last)) => (
                last.surfaced_kind(),
                failures
                    .iter()
                    .map(|(kind, e)| format!("{kind}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            None => (
                ErrorKind::EngineUnavailable,
                "no analysis backend configured".to_string(),
            ),
        };

        error!("[{id}] every analysis backend failed: {message}");
        self.sink.on_terminal_error(kind, &message);
    }
}
