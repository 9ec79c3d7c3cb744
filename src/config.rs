use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arbiter::{ArbiterConfig, PendingPolicy};
use crate::detect::{DETECTOR_NAMES, EMBEDDER_NAMES};
use crate::ingest::{ReconnectPolicy, SourceSettings};
use crate::pipeline::PipelineConfig;

const DEFAULT_DB_PATH: &str = "doorman.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_SOURCE_URL: &str = "stub://front_door";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_DETECTOR: &str = "cpu";
const DEFAULT_EMBEDDER: &str = "histogram";
const DEFAULT_EMBEDDING_DIMENSION: usize = 512;
const DEFAULT_MQTT_CLIENT_ID: &str = "doormand";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "doorman";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DoormanConfigFile {
    db_path: Option<String>,
    source: Option<SourceConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    decision: Option<DecisionConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    api: Option<ApiConfigFile>,
    alerts: Option<AlertsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecognitionConfigFile {
    threshold: Option<f32>,
    min_detection_confidence: Option<f32>,
    detector: Option<String>,
    embedder: Option<String>,
    embedding_dimension: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DecisionConfigFile {
    timeout_secs: Option<u64>,
    pending_policy: Option<PendingPolicy>,
    coalesce_window_secs: Option<u64>,
    max_backlog: Option<usize>,
    default_display_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    queue_capacity: Option<usize>,
    alert_cooldown_secs: Option<u64>,
    reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertsConfigFile {
    mqtt_broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DoormanConfig {
    pub db_path: String,
    pub source: SourceSettings,
    pub recognition: RecognitionSettings,
    pub arbiter: ArbiterConfig,
    pub pipeline: PipelineConfig,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub detector: String,
    pub embedder: String,
    pub embedding_dimension: usize,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// No broker means alerts go to the log.
    pub mqtt_broker: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
}

impl DoormanConfig {
    /// Defaults, then the TOML file named by `DOORMAN_CONFIG`, then `DOORMAN_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DOORMAN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a config document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: DoormanConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DoormanConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let decision = file.decision.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();

        let arbiter_defaults = ArbiterConfig::default();
        let pipeline_defaults = PipelineConfig::default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            source: SourceSettings {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            },
            recognition: RecognitionSettings {
                detector: recognition
                    .detector
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                embedder: recognition
                    .embedder
                    .unwrap_or_else(|| DEFAULT_EMBEDDER.to_string()),
                embedding_dimension: recognition
                    .embedding_dimension
                    .unwrap_or(DEFAULT_EMBEDDING_DIMENSION),
            },
            arbiter: ArbiterConfig {
                decision_timeout: decision
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(arbiter_defaults.decision_timeout),
                pending_policy: decision
                    .pending_policy
                    .unwrap_or(arbiter_defaults.pending_policy),
                coalesce_window: decision
                    .coalesce_window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(arbiter_defaults.coalesce_window),
                max_backlog: decision.max_backlog.unwrap_or(arbiter_defaults.max_backlog),
                default_display_name: decision
                    .default_display_name
                    .unwrap_or(arbiter_defaults.default_display_name),
                ..arbiter_defaults
            },
            pipeline: PipelineConfig {
                queue_capacity: pipeline
                    .queue_capacity
                    .unwrap_or(pipeline_defaults.queue_capacity),
                recognition_threshold: recognition
                    .threshold
                    .unwrap_or(pipeline_defaults.recognition_threshold),
                min_detection_confidence: recognition
                    .min_detection_confidence
                    .unwrap_or(pipeline_defaults.min_detection_confidence),
                alert_cooldown: pipeline
                    .alert_cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(pipeline_defaults.alert_cooldown),
                reconnect: ReconnectPolicy {
                    max_attempts: pipeline
                        .reconnect_attempts
                        .unwrap_or(pipeline_defaults.reconnect.max_attempts),
                    ..pipeline_defaults.reconnect
                },
                ..PipelineConfig::default()
            },
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token_path: api.token_path,
            alerts: AlertSettings {
                mqtt_broker: alerts.mqtt_broker.filter(|b| !b.trim().is_empty()),
                client_id: alerts
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_prefix: alerts
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("DOORMAN_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = env_value("DOORMAN_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(threshold) = env_value("DOORMAN_RECOGNITION_THRESHOLD") {
            self.pipeline.recognition_threshold = threshold.parse().map_err(|_| {
                anyhow!("DOORMAN_RECOGNITION_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Some(timeout) = env_value("DOORMAN_DECISION_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("DOORMAN_DECISION_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.arbiter.decision_timeout = Duration::from_secs(seconds);
        }
        if let Some(capacity) = env_value("DOORMAN_QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("DOORMAN_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Some(policy) = env_value("DOORMAN_PENDING_POLICY") {
            self.arbiter.pending_policy = policy.parse()?;
        }
        if let Some(addr) = env_value("DOORMAN_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_value("DOORMAN_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(broker) = env_value("DOORMAN_MQTT_BROKER") {
            self.alerts.mqtt_broker = Some(broker);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.pipeline.recognition_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "recognition threshold must be within [0, 1] (got {})",
                threshold
            ));
        }
        if self.arbiter.decision_timeout.is_zero() {
            return Err(anyhow!("decision timeout must be greater than zero"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.recognition.embedding_dimension == 0 {
            return Err(anyhow!("embedding dimension must be at least 1"));
        }
        if !DETECTOR_NAMES.contains(&self.recognition.detector.as_str()) {
            return Err(anyhow!(
                "unknown detector '{}' (available: {})",
                self.recognition.detector,
                DETECTOR_NAMES.join(", ")
            ));
        }
        if !EMBEDDER_NAMES.contains(&self.recognition.embedder.as_str()) {
            return Err(anyhow!(
                "unknown embedder '{}' (available: {})",
                self.recognition.embedder,
                EMBEDDER_NAMES.join(", ")
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be non-zero"));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<DoormanConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
