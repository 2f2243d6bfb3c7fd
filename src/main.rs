use std::{io, sync::Arc};

use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rusty_move_advisor::{
    AdvisorConfig, ErrorKind, FinalResult, OrchestratorSettings, PartialResult, Position,
    PositionSource, RequestOrchestrator, ResultSink,
    analysis::AnalysisBackendKind,
    backend::{FallbackChain, ServerBackend, http_client},
    engine::{EngineLifecycleManager, EngineOptions, process::ProcessLauncher},
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Below this depth an accepted move is flagged as shallow.
const MIN_DEPTH_THRESHOLD: u32 = 10;

/// The board as last typed on stdin.
#[derive(Default)]
struct StdinBoard {
    current: Mutex<Option<Position>>,
}

impl StdinBoard {
    fn show(&self, position: Position) {
        *self.current.lock() = Some(position);
    }
}

impl PositionSource for StdinBoard {
    fn current_position(&self) -> Option<Position> {
        self.current.lock().clone()
    }
}

/// Prints suggestions and keeps the evaluation of the last accepted move.
#[derive(Default)]
struct LogSink {
    last_power: Mutex<Option<i32>>,
}

impl ResultSink for LogSink {
    fn on_progress(&self, partial: &PartialResult) {
        debug!(
            "[{}] {} considers {} at depth {:?}",
            partial.request_id, partial.source, partial.best_move, partial.depth
        );
    }

    fn on_accepted(&self, result: &FinalResult) {
        let alternates = result
            .alternates
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "bestmove {}{}{}",
            result.best_move,
            result
                .ponder
                .map_or_else(String::new, |p| format!(" ponder {p}")),
            if alternates.is_empty() {
                String::new()
            } else {
                format!(" alternates {alternates}")
            }
        );

        if let Some(depth) = result.depth {
            if depth < MIN_DEPTH_THRESHOLD {
                warn!(
                    "[{}] depth {depth} is below {MIN_DEPTH_THRESHOLD}, the suggestion may be weak",
                    result.request_id
                );
            }
        }
        if let Some(score) = result.score {
            let power = score.as_power();
            let previous = self.last_power.lock().replace(power);
            info!(
                "[{}] evaluation {score} ({:+} since last move)",
                result.request_id,
                power - previous.unwrap_or(0)
            );
        }
    }

    fn on_terminal_error(&self, kind: ErrorKind, message: &str) {
        println!("error {kind}: {message}");
    }
}

fn setup_logging() -> Result<()> {
    let level = std::env::var("ADVISOR_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(log::LevelFilter::Info);

    // stdout carries the suggestions, so the log goes to stderr
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let config = AdvisorConfig::load()?;
    info!(
        "backends: {:?}, {:?}",
        config.fallback_chain_order,
        config.search_limits()
    );

    let engine = Arc::new(EngineLifecycleManager::new(
        Arc::new(ProcessLauncher::new(
            &config.engine_path,
            config.engine_args.clone(),
        )),
        EngineOptions::from_config(&config),
    ));
    let chain = FallbackChain::from_config(&config, engine.clone())?;

    if chain.kinds().contains(&AnalysisBackendKind::Server) {
        let server = ServerBackend::from_config(&config, http_client(config.backend_timeout())?);
        match server.ping().await {
            Ok(()) => info!("analysis server at {} is up", config.server_url),
            Err(e) => warn!("analysis server at {} unreachable: {e}", config.server_url),
        }
    }

    let board = Arc::new(StdinBoard::default());
    let orchestrator = RequestOrchestrator::new(
        board.clone(),
        Arc::new(LogSink::default()),
        chain,
        Some(engine),
        OrchestratorSettings::from_config(&config),
    );

    info!("ready: one FEN per line, or 'force', 'switch <backend>', 'quit'");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("quit", _) => break,
            ("force", _) => match board.current_position() {
                Some(position) => {
                    orchestrator.request_analysis_forced(position);
                }
                None => warn!("no position to re-analyse yet"),
            },
            ("switch", kind) => match kind.parse::<AnalysisBackendKind>() {
                Ok(kind) => {
                    if let Err(e) = orchestrator.switch_backend(kind).await {
                        error!("cannot switch to {kind}: {e}");
                    }
                }
                Err(e) => error!("{e}"),
            },
            _ => match line.parse::<Position>() {
                Ok(position) => {
                    board.show(position);
                    orchestrator.on_position_changed();
                }
                Err(e) => error!("invalid FEN '{line}': {e}"),
            },
        }
    }

    info!("shutting down");
    orchestrator.shutdown().await;
    Ok(())
}
