//! Engine process transport: how lines get to and from the engine

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use log::debug;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};

use crate::error::AnalysisError;

pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);

/// A bidirectional line channel to one running engine.
#[async_trait]
pub trait EngineTransport: Send {
    async fn send_line(&mut self, line: &str) -> Result<(), AnalysisError>;

    /// Next output line, `None` once the engine has exited. Must be cancel safe:
    /// it is raced against stop/kill signals.
    async fn next_line(&mut self) -> Result<Option<String>, AnalysisError>;

    /// Releases every OS resource held by the engine.
    async fn terminate(&mut self);
}

/// Starts fresh engine instances for the lifecycle manager.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn EngineTransport>, AnalysisError>;
}

/// Launches a UCI engine binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    path: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> ProcessLauncher {
        ProcessLauncher {
            path: path.into(),
            args,
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineTransport>, AnalysisError> {
        let mut process = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AnalysisError::EngineUnavailable(format!(
                    "failed to spawn {}: {e}",
                    self.path.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            return Err(AnalysisError::EngineUnavailable(
                "engine process has no stdio pipes".to_string(),
            ));
        };

        debug!("spawned engine {} (pid {:?})", self.path.display(), process.id());

        Ok(Box::new(ProcessTransport {
            process,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

pub struct ProcessTransport {
    process: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl EngineTransport for ProcessTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), AnalysisError> {
        debug!("engine < {line}");
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>, AnalysisError> {
        let line = self.stdout.next_line().await?;
        if let Some(line) = &line {
            debug!("engine > {line}");
        }
        Ok(line)
    }

    async fn terminate(&mut self) {
        let _ = self.send_line("quit").await;
        if tokio::time::timeout(ENGINE_QUIT_TIMEOUT, self.process.wait())
            .await
            .is_err()
        {
            // kill() also reaps the child
            let _ = self.process.kill().await;
        }
    }
}
