use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusty_move_advisor::{
    AnalysisError, ErrorKind, PartialResult, Position, RequestId,
    analysis::{AnalysisBackendKind, AnalysisRequest, Score, SearchLimits, SearchMode},
    backend::{AnalysisBackend, CallContext, LocalEngineBackend},
    engine::{
        EngineLifecycleManager, EngineOptions, EngineState,
        process::{EngineLauncher, EngineTransport},
    },
    position::START_FEN,
    util::parse_uci_move,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    /// answers `go` right away
    #[default]
    Responsive,
    /// searches until told to stop
    Slow,
    /// never finishes the handshake
    Mute,
    /// searches forever, even after `stop`
    Stubborn,
}

const SEARCH_OUTPUT: [&str; 4] = [
    "info depth 10 seldepth 14 multipv 1 score cp 30 nodes 52000 time 48 pv e2e4 e7e5 g1f3",
    "info depth 10 seldepth 13 multipv 2 score cp 22 nodes 52000 time 48 pv d2d4 d7d5",
    "info depth 10 seldepth 12 multipv 3 score cp 15 nodes 52000 time 48 pv g1f3 g8f6",
    "info string NNUE evaluation enabled",
];

struct FakeEngine {
    mode: Arc<Mutex<Mode>>,
    sent: Arc<Mutex<Vec<String>>>,
    pending: VecDeque<String>,
    searching: bool,
    closed: bool,
}

#[async_trait]
impl EngineTransport for FakeEngine {
    async fn send_line(&mut self, line: &str) -> Result<(), AnalysisError> {
        if self.closed {
            return Err(AnalysisError::EngineUnavailable("pipe closed".into()));
        }
        self.sent.lock().push(line.to_string());
        let mode = *self.mode.lock();

        match line {
            "uci" if mode != Mode::Mute => {
                self.pending.push_back("id name FakeFish".into());
                self.pending.push_back("uciok".into());
            }
            "isready" if mode != Mode::Mute => self.pending.push_back("readyok".into()),
            "stop" if self.searching && mode != Mode::Stubborn => {
                self.searching = false;
                self.pending.push_back("bestmove e2e4 ponder e7e5".into());
            }
            "quit" => self.closed = true,
            go if go.starts_with("go") => {
                self.pending
                    .extend(SEARCH_OUTPUT.iter().map(|l| l.to_string()));
                if mode == Mode::Responsive {
                    self.pending.push_back("bestmove e2e4 ponder e7e5".into());
                } else {
                    self.searching = true;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>, AnalysisError> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        if self.closed {
            return Ok(None);
        }
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn terminate(&mut self) {
        self.sent.lock().push("quit".into());
        self.closed = true;
    }
}

#[derive(Default)]
struct FakeLauncher {
    mode: Arc<Mutex<Mode>>,
    sent: Arc<Mutex<Vec<String>>>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    fn new(mode: Mode) -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher {
            mode: Arc::new(Mutex::new(mode)),
            ..FakeLauncher::default()
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineTransport>, AnalysisError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            mode: self.mode.clone(),
            sent: self.sent.clone(),
            pending: VecDeque::new(),
            searching: false,
            closed: false,
        }))
    }
}

fn manager(launcher: &Arc<FakeLauncher>, reload_every: Option<u32>) -> Arc<EngineLifecycleManager> {
    Arc::new(EngineLifecycleManager::new(
        launcher.clone(),
        EngineOptions {
            load_timeout: Duration::from_secs(5),
            reload_every,
            multipv: 3,
        },
    ))
}

fn backend(engine: &Arc<EngineLifecycleManager>) -> Arc<LocalEngineBackend> {
    Arc::new(LocalEngineBackend::new(
        engine.clone(),
        SearchLimits {
            mode: SearchMode::Depth,
            depth: 10,
            movetime: Duration::from_millis(667),
            bullet: false,
        },
        2,
    ))
}

fn request(id: u64) -> AnalysisRequest {
    AnalysisRequest {
        id: RequestId::new(id),
        position: START_FEN.parse::<Position>().unwrap(),
        issued_at: Instant::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn first_lease_loads_the_engine_with_a_handshake() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, None);
    assert_eq!(engine.state(), EngineState::Unloaded);

    let lease = engine
        .acquire(&CancellationToken::new())
        .await
        .unwrap();
    assert!(lease.is_live());
    assert_eq!(engine.state(), EngineState::Busy);
    drop(lease);
    assert_eq!(engine.state(), EngineState::Ready);

    assert_eq!(launcher.launches(), 1);
    assert_eq!(
        launcher.sent(),
        vec!["uci", "setoption name MultiPV value 3", "ucinewgame", "isready"]
    );
}

#[tokio::test(start_paused = true)]
async fn engine_that_never_loads_yields_a_dead_lease() {
    let launcher = FakeLauncher::new(Mode::Mute);
    let engine = manager(&launcher, None);

    let mut lease = engine
        .acquire(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!lease.is_live());
    assert!(lease.kill_switch().is_cancelled());
    let err = lease.engine().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
    assert_eq!(engine.state(), EngineState::Unloaded);
}

#[tokio::test(start_paused = true)]
async fn local_search_reports_progress_and_alternates() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, None);
    let local = backend(&engine);

    let progress: Arc<Mutex<Vec<PartialResult>>> = Arc::default();
    let seen = progress.clone();
    let ctx = CallContext::new(
        Duration::from_secs(2),
        CancellationToken::new(),
        move |partial: PartialResult| seen.lock().push(partial),
    );

    let result = local.analyze(&request(1), &ctx).await.unwrap();

    assert_eq!(result.request_id, RequestId::new(1));
    assert_eq!(result.source, AnalysisBackendKind::LocalEngine);
    assert_eq!(result.best_move, parse_uci_move("e2e4").unwrap());
    assert_eq!(result.ponder, Some(parse_uci_move("e7e5").unwrap()));
    assert_eq!(
        result.alternates,
        vec![
            parse_uci_move("d2d4").unwrap(),
            parse_uci_move("g1f3").unwrap()
        ]
    );
    assert_eq!(result.depth, Some(10));
    assert_eq!(result.score, Some(Score::Centipawns(30)));

    let progress = progress.lock();
    assert_eq!(progress.len(), 3);
    assert!(progress.iter().all(|p| p.request_id == RequestId::new(1)));

    let sent = launcher.sent();
    assert!(sent.contains(&format!("position fen {START_FEN}")));
    assert!(sent.contains(&"go depth 10".to_string()));
    assert_eq!(engine.state(), EngineState::Ready);
}

#[tokio::test(start_paused = true)]
async fn periodic_reload_after_enough_accepted_analyses() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, Some(2));
    let cancel = CancellationToken::new();

    drop(engine.acquire(&cancel).await.unwrap());
    engine.record_accepted();
    drop(engine.acquire(&cancel).await.unwrap());
    assert_eq!(launcher.launches(), 1);

    engine.record_accepted();
    assert_eq!(engine.analyses_since_reload(), 2);

    let lease = engine.acquire(&cancel).await.unwrap();
    assert!(lease.is_live());
    assert_eq!(launcher.launches(), 2);
    assert_eq!(engine.analyses_since_reload(), 0);
    assert!(launcher.sent().contains(&"quit".to_string()));
}

#[tokio::test(start_paused = true)]
async fn accepted_analyses_are_not_counted_without_periodic_reload() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, None);

    for _ in 0..20 {
        engine.record_accepted();
    }
    assert_eq!(engine.analyses_since_reload(), 0);
}

#[tokio::test(start_paused = true)]
async fn forced_reload_mid_search_terminates_the_lease() {
    let launcher = FakeLauncher::new(Mode::Slow);
    let engine = manager(&launcher, None);
    let local = backend(&engine);

    let search = tokio::spawn(async move {
        local
            .analyze(&request(1), &CallContext::detached(Duration::from_secs(10)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.state(), EngineState::Busy);

    engine.force_reload().await.unwrap();

    let err = search.await.unwrap().unwrap_err();
    assert!(matches!(err, AnalysisError::EngineTerminated));
    assert_eq!(err.surfaced_kind(), ErrorKind::EngineUnavailable);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(engine.state(), EngineState::Ready);
}

#[tokio::test(start_paused = true)]
async fn soft_deadline_stops_the_search() {
    let launcher = FakeLauncher::new(Mode::Slow);
    let engine = manager(&launcher, None);
    let local = backend(&engine);

    let err = local
        .analyze(
            &request(1),
            &CallContext::detached(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(launcher.sent().contains(&"stop".to_string()));

    // the engine answered stop, so it is still usable
    assert_eq!(engine.state(), EngineState::Ready);
    launcher.set_mode(Mode::Responsive);
    let result = local
        .analyze(&request(2), &CallContext::detached(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result.request_id, RequestId::new(2));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn engine_ignoring_stop_is_killed_and_reloaded_next_time() {
    let launcher = FakeLauncher::new(Mode::Stubborn);
    let engine = manager(&launcher, None);
    let local = backend(&engine);

    let err = local
        .analyze(
            &request(1),
            &CallContext::detached(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(engine.state(), EngineState::Unloaded);

    launcher.set_mode(Mode::Responsive);
    local
        .analyze(&request(2), &CallContext::detached(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test(start_paused = true)]
async fn superseded_search_is_stopped_and_reported_stale() {
    let launcher = FakeLauncher::new(Mode::Slow);
    let engine = manager(&launcher, None);
    let local = backend(&engine);
    let cancel = CancellationToken::new();

    let ctx = CallContext::new(Duration::from_secs(10), cancel.clone(), |_| {});
    let search = tokio::spawn(async move { local.analyze(&request(5), &ctx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = search.await.unwrap().unwrap_err();
    assert!(err.is_stale());
    assert_eq!(engine.state(), EngineState::Ready);
}

#[tokio::test(start_paused = true)]
async fn abandoned_search_is_resynchronised_before_the_next_one() {
    let launcher = FakeLauncher::new(Mode::Slow);
    let engine = manager(&launcher, None);
    let local = backend(&engine);

    let abandoned = {
        let local = local.clone();
        tokio::spawn(async move {
            local
                .analyze(&request(1), &CallContext::detached(Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    let _ = abandoned.await;

    launcher.set_mode(Mode::Responsive);
    let result = local
        .analyze(&request(2), &CallContext::detached(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result.best_move, parse_uci_move("e2e4").unwrap());
    assert_eq!(launcher.launches(), 1);

    let sent = launcher.sent();
    let first_go = sent.iter().position(|l| l.starts_with("go")).unwrap();
    assert_eq!(sent[first_go + 1], "stop");
    assert_eq!(sent[first_go + 2], "isready");
    assert!(sent[first_go + 3].starts_with("position fen"));
}

#[tokio::test(start_paused = true)]
async fn waiting_for_a_busy_engine_gives_up_when_superseded() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, None);

    let _held = engine.acquire(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.acquire(&cancel).await.is_none() })
    };
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!waiter.is_finished());

    cancel.cancel();
    assert!(waiter.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn shutdown_terminates_the_engine_for_good() {
    let launcher = FakeLauncher::new(Mode::Responsive);
    let engine = manager(&launcher, None);
    let cancel = CancellationToken::new();

    drop(engine.acquire(&cancel).await.unwrap());
    engine.shutdown().await;
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Terminated);
    assert!(launcher.sent().contains(&"quit".to_string()));

    let mut lease = engine.acquire(&cancel).await.unwrap();
    assert!(!lease.is_live());
    assert!(matches!(
        lease.engine().err(),
        Some(AnalysisError::EngineTerminated)
    ));
    assert!(engine.force_reload().await.is_err());
    assert_eq!(launcher.launches(), 1);
}
