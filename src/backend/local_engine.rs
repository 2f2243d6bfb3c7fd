use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};

use super::{AnalysisBackend, CallContext};
use crate::{
    analysis::{AnalysisBackendKind, AnalysisRequest, AnalysisResult, FinalResult, SearchLimits},
    config::AdvisorConfig,
    engine::{
        EngineLifecycleManager,
        protocol::{EngineLine, MultiPvTable, parse_line},
    },
    error::AnalysisError,
    util::normalize_alternates,
};

/// How long the engine gets to answer `stop` before it is killed.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

/// Drives a leased local engine over its line protocol.
pub struct LocalEngineBackend {
    engine: Arc<EngineLifecycleManager>,
    limits: SearchLimits,
    max_alternates: usize,
}

enum Wake {
    Killed,
    StopIgnored,
    SoftDeadline,
    Cancelled,
    Line(Result<String, AnalysisError>),
}

impl LocalEngineBackend {
    pub fn new(
        engine: Arc<EngineLifecycleManager>,
        limits: SearchLimits,
        max_alternates: usize,
    ) -> LocalEngineBackend {
        LocalEngineBackend {
            engine,
            limits,
            max_alternates,
        }
    }

    pub fn from_config(config: &AdvisorConfig, engine: Arc<EngineLifecycleManager>) -> Self {
        Self::new(engine, config.search_limits(), config.max_alternate_moves)
    }

    fn snapshot(&self, request: &AnalysisRequest, table: &MultiPvTable) -> Option<AnalysisResult> {
        let leader = table.leader()?;
        let best_move = *leader.pv.first()?;
        Some(AnalysisResult {
            request_id: request.id,
            source: AnalysisBackendKind::LocalEngine,
            best_move,
            ponder: leader.pv.get(1).copied(),
            alternates: normalize_alternates(&best_move, table.alternates(), self.max_alternates),
            depth: leader.depth,
            elapsed: leader.time,
            score: leader.score,
        })
    }
}

#[async_trait]
impl AnalysisBackend for LocalEngineBackend {
    fn kind(&self) -> AnalysisBackendKind {
        AnalysisBackendKind::LocalEngine
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<FinalResult, AnalysisError> {
        let Some(mut lease) = self.engine.acquire(&ctx.cancel).await else {
            return Err(AnalysisError::Stale(request.id));
        };
        let kill = lease.kill_switch();
        let engine = lease.engine()?;

        engine.resync().await?;
        engine
            .send(&format!("position fen {}", request.position))
            .await?;
        engine.send(&self.limits.go_command()).await?;
        engine.mark_searching();

        let mut table = MultiPvTable::new(self.max_alternates + 1);
        let mut stop_sent = false;
        let mut timed_out = false;
        let hard_deadline = ctx.deadline + STOP_GRACE;

        loop {
            let wake = tokio::select! {
                biased;
                _ = kill.cancelled() => Wake::Killed,
                _ = tokio::time::sleep_until(hard_deadline), if stop_sent => Wake::StopIgnored,
                _ = tokio::time::sleep_until(ctx.deadline), if !stop_sent => Wake::SoftDeadline,
                _ = ctx.cancel.cancelled(), if !stop_sent => Wake::Cancelled,
                line = engine.next_line() => Wake::Line(line),
            };

            let line = match wake {
                Wake::Killed => {
                    debug!("[{}] engine lease invalidated mid-search", request.id);
                    engine.terminate().await;
                    return Err(AnalysisError::EngineTerminated);
                }
                Wake::StopIgnored => {
                    warn!("[{}] engine ignored stop, killing it", request.id);
                    engine.terminate().await;
                    return Err(AnalysisError::Timeout(ctx.budget));
                }
                Wake::SoftDeadline => {
                    timed_out = true;
                    stop_sent = true;
                    engine.send("stop").await?;
                    continue;
                }
                Wake::Cancelled => {
                    debug!("[{}] superseded, asking the engine to stop", request.id);
                    stop_sent = true;
                    engine.send("stop").await?;
                    continue;
                }
                Wake::Line(line) => line?,
            };

            match parse_line(&line) {
                EngineLine::Info(info) => {
                    if table.update(info) && !stop_sent {
                        if let Some(partial) = self.snapshot(request, &table) {
                            ctx.report_progress(partial);
                        }
                    }
                }
                EngineLine::BestMove { best, ponder } => {
                    engine.mark_idle();
                    if timed_out {
                        return Err(AnalysisError::Timeout(ctx.budget));
                    }
                    if ctx.cancel.is_cancelled() {
                        return Err(AnalysisError::Stale(request.id));
                    }
                    let best_move = best.ok_or_else(|| {
                        AnalysisError::NoData("engine reported no legal move".into())
                    })?;
                    let leader = table.leader();
                    return Ok(AnalysisResult {
                        request_id: request.id,
                        source: AnalysisBackendKind::LocalEngine,
                        best_move,
                        ponder,
                        alternates: normalize_alternates(
                            &best_move,
                            table.alternates(),
                            self.max_alternates,
                        ),
                        depth: leader.and_then(|l| l.depth),
                        elapsed: leader.and_then(|l| l.time),
                        score: leader.and_then(|l| l.score),
                    });
                }
                EngineLine::Other => {}
            }
        }
    }
}
