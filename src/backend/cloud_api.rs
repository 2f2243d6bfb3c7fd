use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;

use super::{AnalysisBackend, CallContext};
use crate::{
    analysis::{AnalysisBackendKind, AnalysisRequest, AnalysisResult, FinalResult, Score},
    config::AdvisorConfig,
    error::AnalysisError,
    util::{SuggestedMove, normalize_alternates, parse_uci_moves},
};

/// The cloud API never returns more lines than this.
const MAX_CLOUD_PVS: usize = 5;

#[derive(Debug, Deserialize)]
struct CloudEval {
    #[serde(default)]
    pvs: Vec<CloudPv>,
    depth: Option<u32>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudPv {
    moves: String,
    cp: Option<i32>,
    mate: Option<i32>,
}

impl CloudPv {
    /// an unparsable line counts as empty
    fn line(&self) -> Vec<SuggestedMove> {
        parse_uci_moves(&self.moves).unwrap_or_default()
    }

    fn first_move(&self) -> Option<SuggestedMove> {
        self.line().first().copied()
    }

    fn score(&self) -> Option<Score> {
        match (self.cp, self.mate) {
            (Some(cp), _) => Some(Score::Centipawns(cp)),
            (None, Some(mate)) => Some(Score::Mate(mate)),
            (None, None) => None,
        }
    }
}

/// Stateless query against a cached cloud evaluation service (lichess cloud-eval).
/// An empty answer is not fatal; it reports `NoData` so the chain moves on.
pub struct CloudApiBackend {
    client: Client,
    url: String,
    max_alternates: usize,
}

impl CloudApiBackend {
    pub fn new(client: Client, url: impl Into<String>, max_alternates: usize) -> CloudApiBackend {
        CloudApiBackend {
            client,
            url: url.into(),
            max_alternates,
        }
    }

    pub fn from_config(config: &AdvisorConfig, client: Client) -> Self {
        Self::new(client, config.cloud_api_url.clone(), config.max_alternate_moves)
    }

    fn multi_pv(&self) -> usize {
        (self.max_alternates + 1).min(MAX_CLOUD_PVS)
    }

    async fn fetch(&self, request: &AnalysisRequest) -> Result<CloudEval, AnalysisError> {
        let params = [
            ("fen", request.position.to_string()),
            ("multiPv", self.multi_pv().to_string()),
            ("variant", "fromPosition".to_string()),
        ];
        debug!("[{}] cloud API request {}", request.id, self.url);

        let resp = self.client.get(&self.url).query(&params).send().await?;
        if !resp.status().is_success() {
            return Err(AnalysisError::NoData(format!(
                "cloud API answered HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.json::<CloudEval>().await?)
    }
}

#[async_trait]
impl AnalysisBackend for CloudApiBackend {
    fn kind(&self) -> AnalysisBackendKind {
        AnalysisBackendKind::CloudApi
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<FinalResult, AnalysisError> {
        let eval = ctx.within_deadline(self.fetch(request)).await?;

        if let Some(error) = eval.error {
            return Err(AnalysisError::NoData(format!("cloud API: {error}")));
        }
        let Some(best_pv) = eval.pvs.first() else {
            return Err(AnalysisError::NoData(
                "no cloud analysis for this position".into(),
            ));
        };
        let best_move = best_pv.first_move().ok_or_else(|| {
            AnalysisError::NoData(format!("unusable cloud line '{}'", best_pv.moves))
        })?;

        let alternates = normalize_alternates(
            &best_move,
            eval.pvs.iter().skip(1).filter_map(CloudPv::first_move),
            self.max_alternates,
        );

        Ok(AnalysisResult {
            request_id: request.id,
            source: AnalysisBackendKind::CloudApi,
            best_move,
            ponder: best_pv.line().get(1).copied(),
            alternates,
            depth: eval.depth,
            elapsed: None,
            score: best_pv.score(),
        })
    }
}
