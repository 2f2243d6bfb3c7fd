//! Advisor configuration: defaults, optional JSON settings file, environment overrides

use std::{env, fs, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisBackendKind, SearchLimits, SearchMode};

pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 20;
pub const MIN_MOVETIME_MS: u64 = 50;
pub const MAX_MOVETIME_MS: u64 = 2000;

const DEFAULT_DEPTH: u32 = MAX_DEPTH / 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Requests closer together than this are dropped
    pub min_interval_ms: u64,

    /// Periodically restart the local engine
    pub reload_engine: bool,

    /// Accepted local analyses between two periodic reloads
    pub reload_every_n_analyses: u32,

    /// Bounded wait for the local engine to come up
    pub engine_load_timeout_ms: u64,

    pub max_alternate_moves: usize,

    /// Backends tried in order for every request
    pub fallback_chain_order: Vec<AnalysisBackendKind>,

    /// Soft deadline of a single backend call
    pub backend_timeout_ms: u64,

    /// Probe the cloud API for a book move before the chain
    pub use_book_moves: bool,

    pub search_mode: SearchMode,
    pub depth: u32,
    pub movetime_ms: u64,

    pub bullet_mode: bool,
    pub bullet_depth: u32,
    pub bullet_movetime_ms: u64,

    pub engine_path: String,
    pub engine_args: Vec<String>,

    pub cloud_api_url: String,

    pub server_url: String,
    pub server_engine_name: String,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 200,
            reload_engine: false,
            reload_every_n_analyses: 10,
            engine_load_timeout_ms: 5000,
            max_alternate_moves: (DEFAULT_DEPTH / 2) as usize,
            fallback_chain_order: vec![
                AnalysisBackendKind::LocalEngine,
                AnalysisBackendKind::CloudApi,
                AnalysisBackendKind::Server,
            ],
            backend_timeout_ms: 10_000,
            use_book_moves: false,
            search_mode: SearchMode::Depth,
            depth: DEFAULT_DEPTH,
            movetime_ms: MAX_MOVETIME_MS / 3,
            bullet_mode: false,
            bullet_depth: 4,
            bullet_movetime_ms: 100,
            engine_path: "stockfish".to_string(),
            engine_args: Vec::new(),
            cloud_api_url: "https://lichess.org/api/cloud-eval".to_string(),
            server_url: "http://localhost:5000".to_string(),
            server_engine_name: "stockfish-15".to_string(),
        }
    }
}

impl AdvisorConfig {
    /// Load configuration: defaults, then the JSON file named by `ADVISOR_CONFIG`
    /// (if set), then `ADVISOR_*` environment overrides.
    pub fn load() -> Result<Self> {
        let base = match env::var("ADVISOR_CONFIG") {
            Ok(path) => {
                info!("Loading settings from {path}");
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read settings file {path}"))?;
                Self::from_json_str(&raw)?
            }
            Err(_) => Self::default(),
        };

        base.with_overrides(|key| env::var(key).ok())?.validate()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config = serde_json::from_str(raw).context("invalid settings JSON")?;
        Ok(config)
    }

    /// Applies overrides looked up by `ADVISOR_*` key.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        override_parsed(&get, "ADVISOR_MIN_INTERVAL_MS", &mut self.min_interval_ms)?;
        override_parsed(&get, "ADVISOR_RELOAD_ENGINE", &mut self.reload_engine)?;
        override_parsed(&get, "ADVISOR_RELOAD_EVERY", &mut self.reload_every_n_analyses)?;
        override_parsed(
            &get,
            "ADVISOR_ENGINE_LOAD_TIMEOUT_MS",
            &mut self.engine_load_timeout_ms,
        )?;
        override_parsed(&get, "ADVISOR_MAX_ALTERNATES", &mut self.max_alternate_moves)?;
        override_parsed(&get, "ADVISOR_BACKEND_TIMEOUT_MS", &mut self.backend_timeout_ms)?;
        override_parsed(&get, "ADVISOR_USE_BOOK_MOVES", &mut self.use_book_moves)?;
        override_parsed(&get, "ADVISOR_DEPTH", &mut self.depth)?;
        override_parsed(&get, "ADVISOR_MOVETIME_MS", &mut self.movetime_ms)?;
        override_parsed(&get, "ADVISOR_BULLET_MODE", &mut self.bullet_mode)?;
        override_parsed(&get, "ADVISOR_BULLET_DEPTH", &mut self.bullet_depth)?;
        override_parsed(&get, "ADVISOR_BULLET_MOVETIME_MS", &mut self.bullet_movetime_ms)?;

        if let Some(chain) = get("ADVISOR_FALLBACK_CHAIN") {
            self.fallback_chain_order = chain
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(AnalysisBackendKind::from_str)
                .collect::<Result<Vec<_>>>()
                .context("ADVISOR_FALLBACK_CHAIN")?;
        }
        if let Some(mode) = get("ADVISOR_SEARCH_MODE") {
            self.search_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "depth" => SearchMode::Depth,
                "movetime" | "move_time" => SearchMode::MoveTime,
                other => bail!("ADVISOR_SEARCH_MODE: unknown search mode '{other}'"),
            };
        }
        if let Some(path) = get("ADVISOR_ENGINE_PATH") {
            self.engine_path = path;
        }
        if let Some(args) = get("ADVISOR_ENGINE_ARGS") {
            self.engine_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(url) = get("ADVISOR_CLOUD_API_URL") {
            self.cloud_api_url = url;
        }
        if let Some(url) = get("ADVISOR_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(name) = get("ADVISOR_SERVER_ENGINE") {
            self.server_engine_name = name;
        }

        Ok(self)
    }

    /// Clamps search limits into their supported ranges and normalises the chain.
    pub fn validate(mut self) -> Result<Self> {
        self.depth = self.depth.clamp(MIN_DEPTH, MAX_DEPTH);
        self.bullet_depth = self.bullet_depth.clamp(MIN_DEPTH, MAX_DEPTH);
        self.movetime_ms = self.movetime_ms.clamp(MIN_MOVETIME_MS, MAX_MOVETIME_MS);
        self.bullet_movetime_ms = self
            .bullet_movetime_ms
            .clamp(MIN_MOVETIME_MS, MAX_MOVETIME_MS);

        let mut chain = Vec::with_capacity(self.fallback_chain_order.len());
        for kind in self.fallback_chain_order.drain(..) {
            if !chain.contains(&kind) {
                chain.push(kind);
            }
        }
        if chain.is_empty() {
            bail!("the fallback chain must name at least one analysis backend");
        }
        self.fallback_chain_order = chain;

        Ok(self)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn engine_load_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_load_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// `None` when periodic reloads are disabled
    pub fn reload_every(&self) -> Option<u32> {
        (self.reload_engine && self.reload_every_n_analyses > 0)
            .then_some(self.reload_every_n_analyses)
    }

    pub fn search_limits(&self) -> SearchLimits {
        let (depth, movetime_ms) = if self.bullet_mode {
            (self.depth.min(self.bullet_depth), self.bullet_movetime_ms)
        } else {
            (self.depth, self.movetime_ms)
        };

        SearchLimits {
            mode: self.search_mode,
            depth,
            movetime: Duration::from_millis(movetime_ms),
            bullet: self.bullet_mode,
        }
    }
}

fn override_parsed<T, G>(get: &G, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_constants() {
        let config = AdvisorConfig::default().validate().unwrap();
        assert_eq!(config.min_interval(), Duration::from_millis(200));
        assert_eq!(config.engine_load_timeout(), Duration::from_millis(5000));
        assert_eq!(config.depth, 10);
        assert_eq!(config.max_alternate_moves, 5);
        assert_eq!(config.reload_every(), None);
    }

    #[test]
    fn env_overrides_apply() {
        let config = AdvisorConfig::default()
            .with_overrides(lookup(&[
                ("ADVISOR_MIN_INTERVAL_MS", "50"),
                ("ADVISOR_FALLBACK_CHAIN", "cloud_api, server"),
                ("ADVISOR_RELOAD_ENGINE", "true"),
                ("ADVISOR_RELOAD_EVERY", "3"),
                ("ADVISOR_SEARCH_MODE", "movetime"),
                ("ADVISOR_ENGINE_ARGS", "--threads 2"),
            ]))
            .unwrap()
            .validate()
            .unwrap();

        assert_eq!(config.min_interval_ms, 50);
        assert_eq!(
            config.fallback_chain_order,
            vec![AnalysisBackendKind::CloudApi, AnalysisBackendKind::Server]
        );
        assert_eq!(config.reload_every(), Some(3));
        assert_eq!(config.search_mode, SearchMode::MoveTime);
        assert_eq!(config.engine_args, vec!["--threads", "2"]);
    }

    #[test]
    fn invalid_override_is_an_error() {
        let result =
            AdvisorConfig::default().with_overrides(lookup(&[("ADVISOR_DEPTH", "deep")]));
        assert!(result.is_err());
    }

    #[test]
    fn validate_clamps_and_dedups() {
        let config = AdvisorConfig {
            depth: 99,
            movetime_ms: 1,
            fallback_chain_order: vec![
                AnalysisBackendKind::Server,
                AnalysisBackendKind::Server,
                AnalysisBackendKind::CloudApi,
            ],
            ..AdvisorConfig::default()
        }
        .validate()
        .unwrap();

        assert_eq!(config.depth, MAX_DEPTH);
        assert_eq!(config.movetime_ms, MIN_MOVETIME_MS);
        assert_eq!(
            config.fallback_chain_order,
            vec![AnalysisBackendKind::Server, AnalysisBackendKind::CloudApi]
        );
    }

    #[test]
    fn empty_chain_is_rejected() {
        let config = AdvisorConfig {
            fallback_chain_order: Vec::new(),
            ..AdvisorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bullet_mode_caps_search() {
        let config = AdvisorConfig {
            bullet_mode: true,
            ..AdvisorConfig::default()
        };
        let limits = config.search_limits();
        assert_eq!(limits.depth, 4);
        assert_eq!(limits.movetime, Duration::from_millis(100));
        assert_eq!(limits.go_command(), "go movetime 100");
    }

    #[test]
    fn json_settings_fill_missing_fields_with_defaults() {
        let config = AdvisorConfig::from_json_str(
            r#"{ "min_interval_ms": 300, "fallback_chain_order": ["server"] }"#,
        )
        .unwrap();
        assert_eq!(config.min_interval_ms, 300);
        assert_eq!(config.fallback_chain_order, vec![AnalysisBackendKind::Server]);
        assert_eq!(config.depth, 10);
    }
}
