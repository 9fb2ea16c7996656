use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::ProcessingType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            dispatch: DispatchConfig::default(),
            polling: PollingConfig::default(),
            chunking: ChunkingConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `~/.arkflow/data/arkflow.db`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub in_memory: bool,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match &self.path {
            Some(path) if path == "~" || path.starts_with("~/") => dirs::home_dir()
                .map(|home| home.join(path.trim_start_matches('~').trim_start_matches('/'))),
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// How jobs of one processing type reach their worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RouteConfig {
    Queue { topic: String },
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    #[serde(default = "default_text_extraction_route")]
    pub text_extraction: RouteConfig,
    #[serde(default = "default_direct_route")]
    pub transcription: RouteConfig,
    #[serde(default = "default_direct_route")]
    pub embedding_ingest: RouteConfig,
}

fn default_text_extraction_route() -> RouteConfig {
    RouteConfig::Queue {
        topic: "ocr.jobs".to_string(),
    }
}

fn default_direct_route() -> RouteConfig {
    RouteConfig::Direct
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            text_extraction: default_text_extraction_route(),
            transcription: RouteConfig::Direct,
            embedding_ingest: RouteConfig::Direct,
        }
    }
}

impl RoutesConfig {
    pub fn route_for(&self, processing_type: ProcessingType) -> &RouteConfig {
        match processing_type {
            ProcessingType::TextExtraction => &self.text_extraction,
            ProcessingType::Transcription => &self.transcription,
            ProcessingType::EmbeddingIngest => &self.embedding_ingest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub routes: RoutesConfig,
    /// Lifetime of presigned download locators.
    #[serde(default = "default_locator_ttl")]
    pub locator_ttl_secs: u64,
    #[serde(default = "default_short_timeout")]
    pub presign_timeout_secs: u64,
    #[serde(default = "default_short_timeout")]
    pub publish_timeout_secs: u64,
}

fn default_locator_ttl() -> u64 {
    15 * 60
}

fn default_short_timeout() -> u64 {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            routes: RoutesConfig::default(),
            locator_ttl_secs: default_locator_ttl(),
            presign_timeout_secs: default_short_timeout(),
            publish_timeout_secs: default_short_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn locator_ttl(&self) -> Duration {
        Duration::from_secs(self.locator_ttl_secs)
    }

    pub fn presign_timeout(&self) -> Duration {
        Duration::from_secs(self.presign_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_deadline")]
    pub deadline_secs: u64,
    /// Timeout of a single status call.
    #[serde(default = "default_short_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_deadline() -> u64 {
    10 * 60
}

fn default_submit_timeout() -> u64 {
    30
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            deadline_secs: default_poll_deadline(),
            call_timeout_secs: default_short_timeout(),
            submit_timeout_secs: default_submit_timeout(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_submit_timeout")]
    pub ingest_timeout_secs: u64,
}

fn default_max_chars() -> usize {
    500
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            ingest_timeout_secs: default_submit_timeout(),
        }
    }
}

impl ChunkingConfig {
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Topic for extracted-text notifications; `null` disables them.
    #[serde(default = "default_text_extracted_topic")]
    pub text_extracted_topic: Option<String>,
    #[serde(default = "default_consumer_concurrency")]
    pub consumer_concurrency: usize,
    /// Must exceed `chunking.ingest_timeout_secs`; a report includes the
    /// chunk handoff.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
}

fn default_text_extracted_topic() -> Option<String> {
    Some("text.extracted".to_string())
}

fn default_callback_timeout() -> u64 {
    60
}

fn default_consumer_concurrency() -> usize {
    num_cpus::get()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            text_extracted_topic: default_text_extracted_topic(),
            consumer_concurrency: default_consumer_concurrency(),
            callback_timeout_secs: default_callback_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub recognition: Option<WorkerEndpoint>,
    #[serde(default)]
    pub transcription: Option<WorkerEndpoint>,
    #[serde(default)]
    pub embedding: Option<WorkerEndpoint>,
}

impl WorkersConfig {
    /// Configured endpoints with their names.
    pub fn endpoints(&self) -> impl Iterator<Item = (&'static str, &WorkerEndpoint)> {
        [
            ("recognition", self.recognition.as_ref()),
            ("transcription", self.transcription.as_ref()),
            ("embedding", self.embedding.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, endpoint)| endpoint.map(|e| (name, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_submit_timeout")]
    pub timeout_secs: u64,
    /// How long submissions are remembered for re-entrant submit.
    #[serde(default = "default_submission_ttl")]
    pub submission_ttl_secs: u64,
}

fn default_submission_ttl() -> u64 {
    60 * 60
}

impl WorkerEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            token: None,
            token_file: None,
            token_env: None,
            timeout_secs: default_submit_timeout(),
            submission_ttl_secs: default_submission_ttl(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn submission_ttl(&self) -> Duration {
        Duration::from_secs(self.submission_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    /// Active tasks untouched for this long are failed.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    30 * 60
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}
