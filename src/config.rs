use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::tools::{BudgetLimit, Capability, CostClass, LatencyClass, RetryPolicy};
use crate::core::types::{MediaKind, SourceMode};

pub const CONFIG_FILE: &str = "clipforge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker pool size for cross-segment generation.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Soft-failure retries per tool call, after the first attempt.
    #[serde(default = "default_max_gen_retries")]
    pub max_gen_retries: u32,
    /// Generation attempts per ordinal per plan revision.
    #[serde(default = "default_max_verify_retries")]
    pub max_verify_retries: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub deadlines: DeadlineConfig,
    #[serde(default = "default_planner_tool")]
    pub planner_tool: String,
    #[serde(default = "default_render_tool")]
    pub render_tool: String,
    #[serde(default)]
    pub verifiers: Vec<String>,
    /// Pinned generation tool per `source_mode:media_kind`, e.g. `"generate:video"`.
    #[serde(default)]
    pub generators: HashMap<String, String>,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub http_tools: Vec<HttpToolConfig>,
    #[serde(default)]
    pub budgets: HashMap<String, BudgetLimit>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    #[serde(default = "default_planning_secs")]
    pub planning_secs: u64,
    #[serde(default = "default_generation_secs")]
    pub generation_secs: u64,
    #[serde(default = "default_verification_secs")]
    pub verification_secs: u64,
    #[serde(default = "default_render_secs")]
    pub render_secs: u64,
}

/// Target format of the final render and of every accepted clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_tolerance")]
    pub duration_tolerance_secs: f64,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
}

/// A tool reached over HTTP, declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    pub url: String,
    pub capability: Capability,
    #[serde(default)]
    pub media_kinds: Vec<MediaKind>,
    #[serde(default)]
    pub source_modes: Vec<SourceMode>,
    #[serde(default)]
    pub cost_class: CostClass,
    #[serde(default)]
    pub latency_class: LatencyClass,
    #[serde(default = "default_cost_units")]
    pub cost_units: u64,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Status polling interval for `long_running` tools; defaults to `backoff.initial_ms`.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub input_schema: Value,
}

fn default_concurrency() -> usize {
    2
}
fn default_max_gen_retries() -> u32 {
    3
}
fn default_max_verify_retries() -> u32 {
    3
}
fn default_max_replans() -> u32 {
    2
}
fn default_planner_tool() -> String {
    "script_generator".to_string()
}
fn default_render_tool() -> String {
    "video_editor".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_initial_ms() -> u64 {
    500
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_planning_secs() -> u64 {
    300
}
fn default_generation_secs() -> u64 {
    600
}
fn default_verification_secs() -> u64 {
    300
}
fn default_render_secs() -> u64 {
    1200
}
fn default_width() -> u32 {
    720
}
fn default_height() -> u32 {
    1280
}
fn default_fps() -> u32 {
    30
}
fn default_tolerance() -> f64 {
    1.0
}
fn default_formats() -> Vec<String> {
    vec!["mp4".to_string()]
}
fn default_cost_units() -> u64 {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_gen_retries: default_max_gen_retries(),
            max_verify_retries: default_max_verify_retries(),
            max_replans: default_max_replans(),
            backoff: BackoffConfig::default(),
            deadlines: DeadlineConfig::default(),
            planner_tool: default_planner_tool(),
            render_tool: default_render_tool(),
            verifiers: Vec::new(),
            generators: HashMap::new(),
            output: OutputSettings::default(),
            http_tools: Vec::new(),
            budgets: HashMap::new(),
            log_level: default_log_level(),
            db_path: None,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            planning_secs: default_planning_secs(),
            generation_secs: default_generation_secs(),
            verification_secs: default_verification_secs(),
            render_secs: default_render_secs(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            duration_tolerance_secs: default_tolerance(),
            formats: default_formats(),
        }
    }
}

impl DeadlineConfig {
    pub fn planning(&self) -> Duration {
        Duration::from_secs(self.planning_secs)
    }
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }
    pub fn verification(&self) -> Duration {
        Duration::from_secs(self.verification_secs)
    }
    pub fn render(&self) -> Duration {
        Duration::from_secs(self.render_secs)
    }
}

impl PipelineConfig {
    /// Load `path`, or `clipforge.toml` in the working directory when `path` is
    /// `None`. A missing default file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        if !config_path.exists() {
            if path.is_some() {
                anyhow::bail!("config file {} not found", config_path.display());
            }
            info!("No {} found, using default pipeline settings.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        info!(
            "Loaded pipeline config: concurrency={}, planner={}, render={}, verifiers={:?}, http_tools={}",
            config.concurrency,
            config.planner_tool,
            config.render_tool,
            config.verifiers,
            config.http_tools.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(content)?;
        if config.concurrency == 0 {
            info!("concurrency = 0 is not usable, running with 1 worker");
            config.concurrency = 1;
        }
        if config.max_verify_retries == 0 {
            info!("max_verify_retries = 0 would never generate, using 1");
            config.max_verify_retries = 1;
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_gen_retries,
            initial_backoff: Duration::from_millis(self.backoff.initial_ms),
            max_backoff: Duration::from_millis(self.backoff.max_ms.max(self.backoff.initial_ms)),
            multiplier: self.backoff.multiplier,
            jitter: self.backoff.jitter,
        }
    }

    /// Journal location: `db_path` or `<data dir>/clipforge/journal.db`.
    pub fn journal_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let base = dirs::data_dir().context("could not determine a data directory")?;
        Ok(base.join("clipforge").join("journal.db"))
    }
}
