use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classes::DEFAULT_SIGNS;
use crate::error::ConfigError;
use crate::model_download::ModelKind;
use crate::recovery::RetryPolicy;
use crate::smoothing::SmootherConfig;

pub const DEFAULT_CONFIG_FILE: &str = "asl.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub tracker: TrackerConfig,
    pub model: ModelConfig,
    pub smoothing: SmoothingConfig,
    pub server: ServerConfig,
    pub tts: TtsConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads `path`, or `asl.toml` in the working directory when present.
    /// Without either the built-in defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.indices.is_empty() {
            return Err(invalid("camera.indices", "at least one camera index is required"));
        }
        if self.server.workers == 0 {
            return Err(invalid("server.workers", "must be at least 1"));
        }
        for (field, value) in [
            ("smoothing.display_threshold", self.smoothing.display_threshold),
            ("server.default_confidence_threshold", self.server.default_confidence_threshold),
            ("smoothing.absent_decay", self.smoothing.absent_decay),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside [0, 1]")));
            }
        }
        if !(0.0..1.0).contains(&self.dataset.test_fraction) {
            return Err(invalid("dataset.test_fraction", "must be in [0, 1)"));
        }
        if self.dataset.signs.is_empty() {
            return Err(invalid("dataset.signs", "at least one sign is required"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraConfig {
    pub indices: Vec<u32>,
    pub attempts_per_index: usize,
    pub retry_delay_ms: u64,
    pub max_consecutive_errors: u32,
    pub frame_timeout_ms: u64,
    pub reconnect_pause_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            indices: vec![0, 1, 2, 3],
            attempts_per_index: 5,
            retry_delay_ms: 1000,
            max_consecutive_errors: 10,
            frame_timeout_ms: 5000,
            reconnect_pause_ms: 500,
        }
    }
}

impl CameraConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.attempts_per_index, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub palm_model: PathBuf,
    pub handpose_model: PathBuf,
    pub max_hands: usize,
    pub min_detection_confidence: f32,
    pub min_tracking_confidence: f32,
    pub init_attempts: usize,
    pub init_retry_delay_ms: u64,
    pub auto_download: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            palm_model: ModelKind::PalmDetector.default_path(),
            handpose_model: ModelKind::HandposeEstimator.default_path(),
            max_hands: 2,
            min_detection_confidence: 0.5,
            min_tracking_confidence: 0.5,
            init_attempts: 3,
            init_retry_delay_ms: 1000,
            auto_download: true,
        }
    }
}

impl TrackerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.init_attempts, Duration::from_millis(self.init_retry_delay_ms))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
    pub patterns: Vec<String>,
    pub class_mapping: Option<PathBuf>,
    pub load_rounds: usize,
    pub backoff_base_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            search_dirs: vec![PathBuf::from("models"), PathBuf::from("../models")],
            patterns: [
                "final_asl_model_*.onnx",
                "best_asl_model_*.onnx",
                "asl_model_*.onnx",
                "model_*.onnx",
                "*.onnx",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            class_mapping: None,
            load_rounds: 5,
            backoff_base_ms: 1000,
        }
    }
}

impl ModelConfig {
    pub fn reload_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.load_rounds, Duration::from_millis(self.backoff_base_ms))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub capacity: usize,
    pub window: usize,
    pub min_history: usize,
    pub max_age_ms: u64,
    pub absent_decay: f32,
    pub display_threshold: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        let desktop = SmootherConfig::desktop();
        Self {
            capacity: desktop.capacity,
            window: desktop.window,
            min_history: desktop.min_history,
            max_age_ms: desktop.max_age.as_millis() as u64,
            absent_decay: desktop.absent_decay,
            display_threshold: 0.7,
        }
    }
}

impl SmoothingConfig {
    pub fn desktop(&self) -> SmootherConfig {
        SmootherConfig {
            capacity: self.capacity.max(1),
            window: self.window.max(1),
            min_history: self.min_history,
            max_age: Duration::from_millis(self.max_age_ms),
            absent_decay: self.absent_decay,
        }
    }

    pub fn web(&self, frames: usize) -> SmootherConfig {
        SmootherConfig {
            min_history: self.min_history,
            max_age: Duration::from_millis(self.max_age_ms),
            absent_decay: self.absent_decay,
            ..SmootherConfig::web(frames)
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_body_bytes: usize,
    pub default_confidence_threshold: f32,
    pub default_smoothing_frames: usize,
    pub history_limit: usize,
    pub history_page: usize,
    pub degraded_error_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            workers: 4,
            max_body_bytes: 16 * 1024 * 1024,
            default_confidence_threshold: 0.7,
            default_smoothing_frames: 3,
            history_limit: 50,
            history_page: 20,
            degraded_error_threshold: 10,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TtsConfig {
    pub language: String,
    pub endpoint: String,
    pub audio_dir: Option<PathBuf>,
    pub dedupe_window_ms: u64,
    pub request_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub synthesis_attempts: usize,
    pub playback_attempts: usize,
    pub playback_timeout_ms: u64,
    pub stale_audio_secs: u64,
    pub janitor_interval_secs: u64,
    /// Player command lines; the audio path is appended as the last argument.
    pub players: Vec<Vec<String>>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let players = [
            vec!["mpg123", "-q"],
            vec!["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"],
            vec!["afplay"],
        ];
        Self {
            language: "en".to_string(),
            endpoint: "https://translate.google.com/translate_tts".to_string(),
            audio_dir: None,
            dedupe_window_ms: 2000,
            request_ttl_ms: 30_000,
            cleanup_interval_ms: 30_000,
            synthesis_attempts: 2,
            playback_attempts: 2,
            playback_timeout_ms: 10_000,
            stale_audio_secs: 300,
            janitor_interval_secs: 60,
            players: players
                .iter()
                .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }
}

impl TtsConfig {
    pub fn audio_dir(&self) -> PathBuf {
        self.audio_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub signs: Vec<String>,
    pub target_per_sign: usize,
    pub crop_size: u32,
    pub max_per_class: usize,
    pub test_fraction: f32,
    pub quick_samples_per_class: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("dataset"),
            signs: DEFAULT_SIGNS.iter().map(|s| s.to_string()).collect(),
            target_per_sign: 1500,
            crop_size: 300,
            max_per_class: 1000,
            test_fraction: 0.15,
            quick_samples_per_class: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: Some(PathBuf::from("asl_translator.log")),
        }
    }
}
