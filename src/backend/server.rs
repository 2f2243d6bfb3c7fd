use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{AnalysisBackend, CallContext};
use crate::{
    analysis::{AnalysisBackendKind, AnalysisRequest, AnalysisResult, FinalResult, Score, SearchLimits},
    config::AdvisorConfig,
    error::AnalysisError,
    position::Position,
    util::parse_uci_move,
};

/// `success` comes back either as a JSON bool or as the string "true"/"false".
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SuccessFlag {
    Bool(bool),
    Text(String),
}

impl SuccessFlag {
    fn is_success(&self) -> bool {
        match self {
            SuccessFlag::Bool(b) => *b,
            SuccessFlag::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerReply {
    success: SuccessFlag,
    /// analysis on success, an error message otherwise
    #[serde(default)]
    data: Value,
    #[serde(default)]
    stale: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerAnalysis {
    fen: String,
    best_move: String,
    ponder: Option<String>,
    /// some engines report "mate" or a string here; anything but a number is no score
    #[serde(default)]
    score: Option<Value>,
    depth: Option<u32>,
    movetime: Option<u64>,
}

/// Remote HTTP analysis server (`GET /getBestMove`). The server echoes the FEN it
/// analysed; a reply for any other position is rejected.
pub struct ServerBackend {
    client: Client,
    base_url: String,
    engine_name: String,
    limits: SearchLimits,
}

impl ServerBackend {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        engine_name: impl Into<String>,
        limits: SearchLimits,
    ) -> ServerBackend {
        ServerBackend {
            client,
            base_url: base_url.into(),
            engine_name: engine_name.into(),
            limits,
        }
    }

    pub fn from_config(config: &AdvisorConfig, client: Client) -> Self {
        Self::new(
            client,
            config.server_url.clone(),
            config.server_engine_name.clone(),
            config.search_limits(),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Connection check against `GET /ping`.
    pub async fn ping(&self) -> Result<(), AnalysisError> {
        let resp = self.client.get(self.endpoint("ping")).send().await?;
        let reply = resp.json::<ServerReply>().await?;
        if reply.success.is_success() {
            Ok(())
        } else {
            Err(AnalysisError::EngineUnavailable(
                "analysis server did not answer ping".into(),
            ))
        }
    }

    async fn fetch(&self, request: &AnalysisRequest) -> Result<ServerReply, AnalysisError> {
        let mut params = vec![
            ("fen", request.position.to_string()),
            ("engine_mode", self.limits.mode.server_code().to_string()),
            ("depth", self.limits.depth.to_string()),
            ("movetime", self.limits.movetime.as_millis().to_string()),
            ("turn", request.position.side_to_move().char().to_string()),
            ("engine_name", self.engine_name.clone()),
        ];
        if self.limits.bullet {
            params.push(("bullet_mode", "true".to_string()));
        }
        debug!("[{}] analysis server request {}", request.id, self.base_url);

        let resp = self
            .client
            .get(self.endpoint("getBestMove"))
            .query(&params)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AnalysisError::Transport(format!(
                "analysis server answered HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.json::<ServerReply>().await?)
    }
}

#[async_trait]
impl AnalysisBackend for ServerBackend {
    fn kind(&self) -> AnalysisBackendKind {
        AnalysisBackendKind::Server
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<FinalResult, AnalysisError> {
        let reply = ctx.within_deadline(self.fetch(request)).await?;

        if !reply.success.is_success() {
            if reply.stale {
                return Err(AnalysisError::Stale(request.id));
            }
            let message = reply.data.as_str().unwrap_or("unspecified error").to_string();
            return Err(AnalysisError::NoData(format!("analysis server: {message}")));
        }

        let analysis: ServerAnalysis = serde_json::from_value(reply.data)
            .map_err(|e| AnalysisError::NoData(format!("malformed server analysis: {e}")))?;

        let analysed: Position = analysis
            .fen
            .parse()
            .map_err(|e| AnalysisError::NoData(format!("server echoed an invalid FEN: {e}")))?;
        if analysed != request.position {
            return Err(AnalysisError::NoData(format!(
                "server analysed {analysed} instead of {}",
                request.position
            )));
        }

        let best_move = parse_uci_move(&analysis.best_move).map_err(|e| {
            AnalysisError::NoData(format!("unusable server move '{}': {e}", analysis.best_move))
        })?;

        Ok(AnalysisResult {
            request_id: request.id,
            source: AnalysisBackendKind::Server,
            best_move,
            ponder: analysis
                .ponder
                .as_deref()
                .and_then(|m| parse_uci_move(m).ok()),
            alternates: Vec::new(),
            depth: analysis.depth,
            elapsed: analysis.movetime.map(Duration::from_millis),
            score: analysis
                .score
                .as_ref()
                .and_then(Value::as_f64)
                .map(|s| Score::Centipawns(s.round() as i32)),
        })
    }
}
