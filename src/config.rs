//! Pipeline configuration.
//!
//! # Configuration File Location
//!
//! [`PetConfig::load`] searches, in order of priority:
//! 1. `PET_COMMENTARY_CONFIG` environment variable
//! 2. `./settings.toml` (current working directory)
//! 3. `<config dir>/pet-commentary/settings.toml` (e.g. `~/.config` on Linux)
//! 4. Built-in defaults
//!
//! # Example Configuration
//!
//! ```toml
//! api_key_env = "MOONSHOT_API_KEY"
//! base_url = "https://api.moonshot.cn/v1"
//! model = "moonshot-v1-8k"
//! vision_model = "moonshot-v1-8k-vision-preview"
//! max_attempts = 5
//! cooldown_window_seconds = 120
//! trip_threshold = 5
//!
//! [backoff]
//! base_delay_ms = 800
//! connection_base_delay_ms = 1500
//! max_delay_ms = 18000
//!
//! [local_vision]
//! enabled = true
//! model_path = "models/excel_ui.pt"
//! conf_threshold = 0.25
//! max_det = 20
//! predict_imgsz = 640
//! ```
//!
//! Reloading means calling [`PetConfig::load`] again and rebuilding the
//! pipeline through [`PipelineFactory`](crate::factory::PipelineFactory)
//! with the existing gate registry.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PET_COMMENTARY_CONFIG";

/// File name searched in the working and user config directories.
pub const CONFIG_FILE_NAME: &str = "settings.toml";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseError(String),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// ============================================================================
// Sections
// ============================================================================

/// `[local_vision]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalVisionConfig {
    pub enabled: bool,
    pub model_path: String,
    pub conf_threshold: f32,
    pub max_det: usize,
    pub predict_imgsz: u32,
}

impl Default for LocalVisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: String::new(),
            conf_threshold: 0.25,
            max_det: 20,
            predict_imgsz: 640,
        }
    }
}

/// `[backoff]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub connection_base_delay_ms: u64,
    pub multiplier: f64,
    pub connection_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 800,
            connection_base_delay_ms: 1500,
            multiplier: 2.0,
            connection_multiplier: 2.5,
            max_delay_ms: 18_000,
            jitter_ms: 0,
        }
    }
}

impl BackoffConfig {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            transport_base_delay: Duration::from_millis(self.connection_base_delay_ms),
            transport_multiplier: self.connection_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

// ============================================================================
// PetConfig
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetConfig {
    /// API key; when empty, `api_key_env` is consulted.
    pub api_key: String,
    pub api_key_env: String,
    pub base_url: String,
    #[serde(alias = "model")]
    pub text_model: String,
    /// Empty means "same as `text_model`".
    pub vision_model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub cooldown_window_seconds: u64,
    pub trip_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_seconds: Option<u64>,
    pub backoff: BackoffConfig,
    pub local_vision: LocalVisionConfig,
}

impl Default for PetConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_key_env: "PET_COMMENTARY_API_KEY".to_string(),
            base_url: "https://api.moonshot.cn/v1".to_string(),
            text_model: "moonshot-v1-8k".to_string(),
            vision_model: String::new(),
            temperature: 0.7,
            timeout_seconds: 60,
            max_attempts: 5,
            cooldown_window_seconds: 120,
            trip_threshold: 5,
            attempt_timeout_seconds: None,
            backoff: BackoffConfig::default(),
            local_vision: LocalVisionConfig::default(),
        }
    }
}

impl PetConfig {
    /// Load configuration from the default location and validate it.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&path).exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = Path::new(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("pet-commentary").join(CONFIG_FILE_NAME);
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::default())
    }

    /// Load and validate configuration from a specific file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_str = self.to_toml()?;
        std::fs::write(path.as_ref(), toml_str)?;
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".to_string());
        }
        if self.trip_threshold == 0 {
            return invalid("trip_threshold must be at least 1".to_string());
        }
        if self.cooldown_window_seconds == 0 {
            return invalid("cooldown_window_seconds must be positive".to_string());
        }
        if self.attempt_timeout_seconds == Some(0) {
            return invalid("attempt_timeout_seconds must be positive when set".to_string());
        }
        if !(0.0..=1.0).contains(&self.local_vision.conf_threshold) {
            return invalid(format!(
                "local_vision.conf_threshold must be within [0, 1], got {}",
                self.local_vision.conf_threshold
            ));
        }
        if self.local_vision.max_det == 0 {
            return invalid("local_vision.max_det must be at least 1".to_string());
        }
        let backoff = &self.backoff;
        // NaN fails both comparisons
        if !(backoff.multiplier >= 1.0) {
            return invalid(format!(
                "backoff.multiplier must be at least 1.0, got {}",
                backoff.multiplier
            ));
        }
        if !(backoff.connection_multiplier >= backoff.multiplier) {
            return invalid(format!(
                "backoff.connection_multiplier ({}) is below backoff.multiplier ({})",
                backoff.connection_multiplier, backoff.multiplier
            ));
        }
        if backoff.connection_base_delay_ms < backoff.base_delay_ms {
            return invalid(format!(
                "backoff.connection_base_delay_ms ({}) is below backoff.base_delay_ms ({})",
                backoff.connection_base_delay_ms, backoff.base_delay_ms
            ));
        }
        if backoff.jitter_ms > backoff.max_delay_ms {
            return invalid(format!(
                "backoff.jitter_ms ({}) exceeds backoff.max_delay_ms ({})",
                backoff.jitter_ms, backoff.max_delay_ms
            ));
        }
        Ok(())
    }

    /// API key from `api_key`, else from the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let direct = self.api_key.trim();
        if !direct.is_empty() {
            return Some(direct.to_string());
        }
        if self.api_key_env.trim().is_empty() {
            return None;
        }
        std::env::var(self.api_key_env.trim())
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// Vision model, defaulting to the text model.
    pub fn vision_model(&self) -> &str {
        let configured = self.vision_model.trim();
        if configured.is_empty() {
            &self.text_model
        } else {
            configured
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_window_seconds)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_seconds.map(Duration::from_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.to_policy()
    }
}
