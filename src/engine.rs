//! Lifecycle of the local engine process: load, exclusive leases, periodic or
//! forced reload, teardown.
//!
//! The engine is a single-threaded resource. It lives in an [`EngineSlot`] behind
//! a FIFO-fair async mutex; an [`EngineLease`] is the owned guard of that mutex,
//! so there is never more than one search running against a process. Forced
//! reloads and shutdown invalidate outstanding leases through a kill switch the
//! lease holder races against while it waits for engine output.

pub mod process;
pub mod protocol;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::{config::AdvisorConfig, error::AnalysisError};
use process::{EngineLauncher, EngineTransport};

/// Bound on getting a wedged engine back to a known idle state.
pub const ENGINE_RESYNC_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Busy,
    Reloading,
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub load_timeout: Duration,
    /// `None` disables periodic reloads
    pub reload_every: Option<u32>,
    /// MultiPV lines requested from the engine
    pub multipv: usize,
}

impl EngineOptions {
    pub fn from_config(config: &AdvisorConfig) -> EngineOptions {
        EngineOptions {
            load_timeout: config.engine_load_timeout(),
            reload_every: config.reload_every(),
            multipv: config.max_alternate_moves + 1,
        }
    }
}

/// The loaded engine, or nothing if it was never loaded, crashed or got torn down.
pub struct EngineSlot {
    transport: Option<Box<dyn EngineTransport>>,
    /// a search was started and its `bestmove` has not been read yet
    dirty: bool,
}

impl EngineSlot {
    pub fn is_loaded(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn send(&mut self, line: &str) -> Result<(), AnalysisError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AnalysisError::EngineUnavailable("engine is not loaded".into()))?;
        if let Err(e) = transport.send_line(line).await {
            self.transport = None;
            return Err(e);
        }
        Ok(())
    }

    /// Next engine line. A closed pipe means the process died; the slot is emptied
    /// so the next lease reloads it.
    pub async fn next_line(&mut self) -> Result<String, AnalysisError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AnalysisError::EngineUnavailable("engine is not loaded".into()))?;
        match transport.next_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => {
                self.transport = None;
                Err(AnalysisError::EngineUnavailable(
                    "engine process exited".into(),
                ))
            }
            Err(e) => {
                self.transport = None;
                Err(e)
            }
        }
    }

    pub fn mark_searching(&mut self) {
        self.dirty = true;
    }

    pub fn mark_idle(&mut self) {
        self.dirty = false;
    }

    /// Brings the engine back to idle after a search whose `bestmove` was never
    /// consumed (the caller was dropped mid-search).
    pub async fn resync(&mut self) -> Result<(), AnalysisError> {
        if !self.dirty {
            return Ok(());
        }
        debug!("resynchronising engine after an abandoned search");
        self.send("stop").await?;
        self.send("isready").await?;
        let drained = tokio::time::timeout(ENGINE_RESYNC_TIMEOUT, async {
            loop {
                if self.next_line().await? == "readyok" {
                    return Ok::<(), AnalysisError>(());
                }
            }
        })
        .await;
        match drained {
            Ok(Ok(())) => {
                self.dirty = false;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.terminate().await;
                Err(AnalysisError::EngineUnavailable(
                    "engine did not answer isready".into(),
                ))
            }
        }
    }

    pub async fn terminate(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.terminate().await;
        }
        self.dirty = false;
    }
}

enum LeaseInner {
    Live {
        slot: OwnedMutexGuard<EngineSlot>,
        kill: CancellationToken,
        state: Arc<parking_lot::Mutex<EngineState>>,
    },
    Dead(Option<AnalysisError>),
}

/// Exclusive use of the engine for one search. A dead lease is handed out when
/// the engine could not be loaded in time, so callers surface a clean error
/// instead of hanging.
pub struct EngineLease(LeaseInner);

impl EngineLease {
    fn dead(reason: AnalysisError) -> EngineLease {
        EngineLease(LeaseInner::Dead(Some(reason)))
    }

    pub fn is_live(&self) -> bool {
        matches!(self.0, LeaseInner::Live { .. })
    }

    /// Cancelled when the lease is invalidated by a forced reload or shutdown.
    pub fn kill_switch(&self) -> CancellationToken {
        match &self.0 {
            LeaseInner::Live { kill, .. } => kill.clone(),
            LeaseInner::Dead(_) => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn engine(&mut self) -> Result<&mut EngineSlot, AnalysisError> {
        match &mut self.0 {
            LeaseInner::Live { slot, .. } => Ok(&mut **slot),
            LeaseInner::Dead(reason) => Err(reason.take().unwrap_or(AnalysisError::EngineTerminated)),
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let LeaseInner::Live { slot, state, .. } = &self.0 {
            let mut state = state.lock();
            // reload/shutdown own the state while they run
            if *state == EngineState::Busy {
                *state = if slot.is_loaded() {
                    EngineState::Ready
                } else {
                    EngineState::Unloaded
                };
            }
        }
    }
}

pub struct EngineLifecycleManager {
    launcher: Arc<dyn EngineLauncher>,
    options: EngineOptions,
    slot: Arc<Mutex<EngineSlot>>,
    state: Arc<parking_lot::Mutex<EngineState>>,
    kill_switch: parking_lot::Mutex<CancellationToken>,
    accepted_since_reload: AtomicU32,
    shut_down: AtomicBool,
}

impl EngineLifecycleManager {
    pub fn new(launcher: Arc<dyn EngineLauncher>, options: EngineOptions) -> EngineLifecycleManager {
        EngineLifecycleManager {
            launcher,
            options,
            slot: Arc::new(Mutex::new(EngineSlot {
                transport: None,
                dirty: false,
            })),
            state: Arc::new(parking_lot::Mutex::new(EngineState::Unloaded)),
            kill_switch: parking_lot::Mutex::new(CancellationToken::new()),
            accepted_since_reload: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("engine state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Waits for exclusive use of the engine, loading or periodically reloading it
    /// first when needed. Returns `None` if `cancel` fires while waiting: the
    /// caller's request has been superseded and should not queue any longer.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<EngineLease> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Some(EngineLease::dead(AnalysisError::EngineTerminated));
        }

        // only the wait on an in-flight load is bounded, a busy engine is waited out
        let loading = matches!(
            self.state(),
            EngineState::Loading | EngineState::Reloading
        );
        let load_timeout = self.options.load_timeout;

        let mut slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(load_timeout), if loading => {
                warn!("engine still loading after {load_timeout:?}");
                return Some(EngineLease::dead(AnalysisError::EngineUnavailable(format!(
                    "engine did not load within {load_timeout:?}"
                ))));
            }
            slot = self.slot.clone().lock_owned() => slot,
        };

        if self.shut_down.load(Ordering::SeqCst) {
            return Some(EngineLease::dead(AnalysisError::EngineTerminated));
        }

        let kill = self.kill_switch.lock().clone();
        if kill.is_cancelled() {
            // a forced reload is queued behind us
            return Some(EngineLease::dead(AnalysisError::EngineTerminated));
        }

        if self.reload_due() {
            info!(
                "Reloading the chess engine after {} analyses",
                self.accepted_since_reload.load(Ordering::SeqCst)
            );
            self.set_state(EngineState::Reloading);
            slot.terminate().await;
            self.accepted_since_reload.store(0, Ordering::SeqCst);
        }

        if !slot.is_loaded() {
            self.set_state(EngineState::Loading);
            if let Err(e) = self.load_into(&mut slot).await {
                warn!("engine failed to load: {e}");
                self.set_state(EngineState::Unloaded);
                return Some(EngineLease::dead(e));
            }
        }

        self.set_state(EngineState::Busy);
        Some(EngineLease(LeaseInner::Live {
            slot,
            kill,
            state: self.state.clone(),
        }))
    }

    /// Counts an accepted analysis towards the periodic reload.
    pub fn record_accepted(&self) {
        if self.options.reload_every.is_some() {
            self.accepted_since_reload.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn analyses_since_reload(&self) -> u32 {
        self.accepted_since_reload.load(Ordering::SeqCst)
    }

    fn reload_due(&self) -> bool {
        self.options
            .reload_every
            .is_some_and(|every| self.accepted_since_reload.load(Ordering::SeqCst) >= every)
    }

    /// Terminates the current process right away, even mid-search, and loads a
    /// fresh one. Any outstanding lease reports `EngineTerminated`.
    pub async fn force_reload(&self) -> Result<(), AnalysisError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::EngineTerminated);
        }
        info!("Reloading the chess engine!");

        self.kill_switch.lock().cancel();
        self.set_state(EngineState::Reloading);

        let mut slot = self.slot.lock().await;
        *self.kill_switch.lock() = CancellationToken::new();
        slot.terminate().await;
        self.set_state(EngineState::Terminated);
        self.accepted_since_reload.store(0, Ordering::SeqCst);

        self.set_state(EngineState::Loading);
        match self.load_into(&mut slot).await {
            Ok(()) => {
                self.set_state(EngineState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!("engine failed to reload: {e}");
                self.set_state(EngineState::Unloaded);
                Err(e)
            }
        }
    }

    /// Tears the engine down for good; later leases are dead.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kill_switch.lock().cancel();
        let mut slot = self.slot.lock().await;
        slot.terminate().await;
        self.set_state(EngineState::Terminated);
        info!("chess engine terminated");
    }

    async fn load_into(&self, slot: &mut EngineSlot) -> Result<(), AnalysisError> {
        let timeout = self.options.load_timeout;
        let multipv = self.options.multipv;
        let loaded = tokio::time::timeout(timeout, async {
            let mut transport = self.launcher.launch().await?;
            handshake(transport.as_mut(), multipv).await?;
            Ok::<_, AnalysisError>(transport)
        })
        .await;

        match loaded {
            Ok(Ok(transport)) => {
                slot.transport = Some(transport);
                slot.dirty = false;
                info!("chess engine loaded");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AnalysisError::EngineUnavailable(format!(
                "engine did not load within {timeout:?}"
            ))),
        }
    }
}

async fn handshake(
    transport: &mut dyn EngineTransport,
    multipv: usize,
) -> Result<(), AnalysisError> {
    transport.send_line("uci").await?;
    wait_for(transport, "uciok").await?;
    transport
        .send_line(&format!("setoption name MultiPV value {multipv}"))
        .await?;
    transport.send_line("ucinewgame").await?;
    transport.send_line("isready").await?;
    wait_for(transport, "readyok").await
}

async fn wait_for(transport: &mut dyn EngineTransport, expected: &str) -> Result<(), AnalysisError> {
    loop {
        match transport.next_line().await? {
            Some(line) if line.trim() == expected => return Ok(()),
            Some(_) => continue,
            None => {
                return Err(AnalysisError::EngineUnavailable(format!(
                    "engine exited before '{expected}'"
                )));
            }
        }
    }
}
