//! Error taxonomy shared by every analysis backend

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::analysis::RequestId;

/// What the result sink gets told when the whole fallback chain gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EngineUnavailable,
    NoData,
    Timeout,
    Stale,
    EngineTerminated,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::EngineUnavailable => "engine unavailable",
            ErrorKind::NoData => "no data",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Stale => "stale",
            ErrorKind::EngineTerminated => "engine terminated",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("No usable analysis: {0}")]
    NoData(String),

    #[error("Soft deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Engine lease was terminated")]
    EngineTerminated,

    #[error("Request {0} was superseded")]
    Stale(RequestId),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::EngineUnavailable(_) | AnalysisError::Transport(_) => {
                ErrorKind::EngineUnavailable
            }
            AnalysisError::NoData(_) => ErrorKind::NoData,
            AnalysisError::Timeout(_) => ErrorKind::Timeout,
            AnalysisError::EngineTerminated => ErrorKind::EngineTerminated,
            AnalysisError::Stale(_) => ErrorKind::Stale,
        }
    }

    /// The kind reported to the result sink; a terminated lease looks like an
    /// engine that went away.
    pub fn surfaced_kind(&self) -> ErrorKind {
        match self.kind() {
            ErrorKind::EngineTerminated => ErrorKind::EngineUnavailable,
            kind => kind,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, AnalysisError::Stale(_))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AnalysisError::NoData(format!("undecodable response: {e}"))
        } else {
            AnalysisError::Transport(e.to_string())
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(e: std::io::Error) -> Self {
        AnalysisError::EngineUnavailable(format!("engine I/O failed: {e}"))
    }
}
