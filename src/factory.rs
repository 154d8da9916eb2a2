//! Pipeline assembly from [`PetConfig`].
//!
//! # Wiring
//!
//! ```text
//!  PetConfig ──► PipelineFactory
//!                 ├── CooldownGate (shared, survives reload)
//!                 ├── CancellationToken (shared)
//!                 ├── RetryExecutor (policy, max_attempts, attempt timeout)
//!                 ├── OpenAICompatibleProvider x2 (vision, text), None without a key
//!                 ├── LocalVision (via DetectorLoader)
//!                 └── CommentOrchestrator
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pet_commentary::{PetConfig, PipelineFactory};
//!
//! let factory = PipelineFactory::new(PetConfig::load()?)?;
//! let orchestrator = factory.build()?;
//! let comment = orchestrator.generate_comment(&image).await;
//!
//! // Settings changed: rebuild, keeping gate state.
//! let factory = factory.reload(PetConfig::load()?)?;
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PetConfig;
use crate::error::{CommentaryError, Result};
use crate::gate::CooldownGate;
use crate::orchestrator::{CommentOrchestrator, CommentStyle};
use crate::providers::OpenAICompatibleProvider;
use crate::retry::RetryExecutor;
use crate::traits::LLMProvider;
use crate::vision::{
    build_vision_candidates, DetectorLoader, LocalDetector, LocalVision, VisionTierSelector,
};

/// Builds the comment pipeline from configuration.
#[derive(Clone)]
pub struct PipelineFactory {
    config: PetConfig,
    gate: Arc<CooldownGate>,
    cancel: CancellationToken,
    loader: Option<Arc<dyn DetectorLoader>>,
}

impl fmt::Debug for PipelineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineFactory")
            .field("base_url", &self.config.base_url)
            .field("text_model", &self.config.text_model)
            .field("vision_model", &self.config.vision_model())
            .field("gate", &self.gate)
            .field("has_loader", &self.loader.is_some())
            .finish()
    }
}

impl PipelineFactory {
    /// Validate `config` and create a fresh gate registry.
    pub fn new(config: PetConfig) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(CooldownGate::new(
            config.trip_threshold,
            config.cooldown_window(),
        ));
        Ok(Self {
            config,
            gate,
            cancel: CancellationToken::new(),
            loader: None,
        })
    }

    /// Share an existing gate registry.
    pub fn with_gate(mut self, gate: Arc<CooldownGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Backend used to load `local_vision.model_path`.
    pub fn with_detector_loader(mut self, loader: Arc<dyn DetectorLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn config(&self) -> &PetConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<CooldownGate> {
        &self.gate
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Factory for a new configuration. Gate state, cancellation token and
    /// detector loader carry over.
    pub fn reload(&self, config: PetConfig) -> Result<Self> {
        config.validate()?;
        if config.trip_threshold != self.gate.trip_threshold()
            || config.cooldown_window() != self.gate.cooldown_window()
        {
            warn!(
                trip_threshold = config.trip_threshold,
                cooldown_window_seconds = config.cooldown_window_seconds,
                "Gate settings changed; they apply after restart"
            );
        }
        info!(
            base_url = %config.base_url,
            text_model = %config.text_model,
            vision_model = %config.vision_model(),
            "Reloading pipeline configuration"
        );
        Ok(Self {
            config,
            gate: self.gate.clone(),
            cancel: self.cancel.clone(),
            loader: self.loader.clone(),
        })
    }

    /// Retry executor bound to the shared gate and token.
    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.gate.clone())
            .with_policy(self.config.backoff_policy())
            .with_max_attempts(self.config.max_attempts)
            .with_attempt_timeout(self.config.attempt_timeout())
            .with_cancellation(self.cancel.clone())
    }

    /// Remote provider for `model`, or `None` when no API key is available.
    fn create_remote(&self, model: &str) -> Result<Option<Arc<dyn LLMProvider>>> {
        let Some(api_key) = self.config.resolve_api_key() else {
            debug!(
                api_key_env = %self.config.api_key_env,
                "No API key configured; remote calls disabled"
            );
            return Ok(None);
        };
        let provider = OpenAICompatibleProvider::new(
            provider_name(&self.config.base_url),
            &self.config.base_url,
            api_key,
            model,
            self.config.request_timeout(),
        )?;
        Ok(Some(Arc::new(provider)))
    }

    pub fn create_text_provider(&self) -> Result<Option<Arc<dyn LLMProvider>>> {
        self.create_remote(&self.config.text_model)
    }

    pub fn create_vision_provider(&self) -> Result<Option<Arc<dyn LLMProvider>>> {
        self.create_remote(self.config.vision_model())
    }

    /// Load the local tier. Without a loader an enabled tier reports that
    /// no backend is available.
    pub fn create_local_vision(&self) -> LocalVision {
        match &self.loader {
            Some(loader) => LocalVision::load(&self.config.local_vision, loader.as_ref()),
            None => LocalVision::load(&self.config.local_vision, &no_backend),
        }
    }

    pub fn vision_candidates(&self) -> Vec<String> {
        build_vision_candidates(
            self.config.vision_model(),
            &self.config.text_model,
            Some(&self.config.base_url),
        )
    }

    /// Build the full pipeline.
    pub fn build(&self) -> Result<CommentOrchestrator> {
        let retry = self.retry_executor();
        let local = self.create_local_vision();
        let selector = VisionTierSelector::new(
            local,
            self.create_vision_provider()?,
            retry.clone(),
            self.vision_candidates(),
        );
        let text = self.create_text_provider()?;

        info!(
            remote = text.is_some(),
            local_vision = selector.local().is_ready(),
            max_attempts = self.config.max_attempts,
            "Comment pipeline ready"
        );

        let style = CommentStyle::default().with_temperature(self.config.temperature);
        Ok(CommentOrchestrator::new(selector, text, retry).with_style(style))
    }
}

fn no_backend(_path: &Path) -> Result<Arc<dyn LocalDetector>> {
    Err(CommentaryError::NotSupported(
        "no local detector backend registered".to_string(),
    ))
}

/// Short provider name from the host of `base_url`, for logs.
fn provider_name(base_url: &str) -> String {
    let host = base_url
        .split("://")
        .nth(1)
        .unwrap_or(base_url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => "remote".to_string(),
        1 => labels[0].to_string(),
        n => labels[n - 2].to_string(),
    }
}
