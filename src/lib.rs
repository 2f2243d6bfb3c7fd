//! Move-suggestion advisor: one authoritative best move per board position,
//! fetched from a local UCI engine, a cloud evaluation API or a remote analysis
//! server, whichever answers first down the fallback chain.

pub mod analysis;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod position;
pub mod throttle;
pub mod util;

pub use analysis::{AnalysisBackendKind, AnalysisResult, FinalResult, PartialResult, RequestId, Score};
pub use config::AdvisorConfig;
pub use error::{AnalysisError, ErrorKind};
pub use orchestrator::{OrchestratorSettings, PositionSource, RequestOrchestrator, ResultSink};
pub use position::Position;
pub use util::SuggestedMove;
