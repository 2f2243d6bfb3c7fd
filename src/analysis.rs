//! Request and result types passed between the orchestrator and the backends

use std::{fmt, str::FromStr, time::Duration};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{position::Position, util::SuggestedMove};

/// Score used for "mate in N" when a numeric power is needed.
pub const MATE_SCORE: i32 = 10_000;

/// Identity of one logical analysis attempt. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> RequestId {
        RequestId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> RequestId {
        RequestId(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned by the orchestrator; backends only ever see `&AnalysisRequest`.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: RequestId,
    pub position: Position,
    pub issued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    /// mate in N, positive when the side to move mates
    Mate(i32),
}

impl Score {
    pub fn as_power(&self) -> i32 {
        match *self {
            Score::Centipawns(cp) => cp,
            Score::Mate(n) if n > 0 => MATE_SCORE,
            Score::Mate(_) => -MATE_SCORE,
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Centipawns(cp) => write!(f, "cp {cp:+}"),
            Score::Mate(n) => write!(f, "mate {n}"),
        }
    }
}

/// A progress report or the final answer of one backend call. Both have the
/// same shape; only the callback they arrive through differs.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub request_id: RequestId,
    pub source: AnalysisBackendKind,
    pub best_move: SuggestedMove,
    pub ponder: Option<SuggestedMove>,
    pub alternates: Vec<SuggestedMove>,
    pub depth: Option<u32>,
    pub elapsed: Option<Duration>,
    pub score: Option<Score>,
}

pub type PartialResult = AnalysisResult;
pub type FinalResult = AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisBackendKind {
    LocalEngine,
    CloudApi,
    Server,
}

impl fmt::Display for AnalysisBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisBackendKind::LocalEngine => "local_engine",
            AnalysisBackendKind::CloudApi => "cloud_api",
            AnalysisBackendKind::Server => "server",
        };
        f.write_str(name)
    }
}

impl FromStr for AnalysisBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local_engine" | "local" | "engine" => Ok(AnalysisBackendKind::LocalEngine),
            "cloud_api" | "cloud" => Ok(AnalysisBackendKind::CloudApi),
            "server" | "node" => Ok(AnalysisBackendKind::Server),
            other => bail!("unknown analysis backend '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Depth,
    MoveTime,
}

impl SearchMode {
    /// numeric mode understood by the analysis server
    pub fn server_code(self) -> u8 {
        match self {
            SearchMode::Depth => 0,
            SearchMode::MoveTime => 1,
        }
    }
}

/// How long or how deep a backend should search, bullet mode already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub mode: SearchMode,
    pub depth: u32,
    pub movetime: Duration,
    pub bullet: bool,
}

impl SearchLimits {
    /// the `go` command sent to a local engine
    pub fn go_command(&self) -> String {
        if self.bullet || self.mode == SearchMode::MoveTime {
            format!("go movetime {}", self.movetime.as_millis())
        } else {
            format!("go depth {}", self.depth)
        }
    }
}
