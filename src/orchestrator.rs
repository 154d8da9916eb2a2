//! Top-level comment pipeline.
//!
//! ```text
//!  generate_comment(image, instruction)
//!      │
//!      ├─► cancelled? ──yes──► Degraded(Cancelled)
//!      ├─► column question naming no column? ──yes──► Comment{Local} asking which
//!      │
//!      ├─► text gate open (or no text provider)?
//!      │       yes ─► VisionTierSelector::analyze        (local, then remote)
//!      │       no  ─► VisionTierSelector::analyze_local  (no network)
//!      │
//!      ├─► data-presence question with a verdict? ──yes──► Comment{Local}
//!      ├─► text provider configured? ──no──► Degraded(NotConfigured)
//!      ├─► text gate was cooling?    ──yes─► Degraded(GateCooling)
//!      │
//!      ├─► RetryExecutor(Endpoint::Text) ──ok──► Comment{Remote}
//!      │                                 └─err─► Degraded(reason of failure)
//!      ▼
//!  Comment (always, never an error)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::degraded::{normalize_line, DegradeReason, DegradedCommenter};
use crate::gate::{CooldownGate, Endpoint};
use crate::presence::{presence_reply, PresenceQuestion, CLARIFY_COLUMN};
use crate::retry::RetryExecutor;
use crate::traits::{ChatMessage, CompletionOptions, LLMProvider};
use crate::vision::{SceneDescription, ScreenImage, VisionTierSelector};

/// Where a comment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentSource {
    Remote,
    /// Answered on-device without the text model.
    Local,
    Degraded,
}

/// Final output of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Non-empty, single line.
    pub text: String,
    pub source: CommentSource,
    /// Set when `source` is `Degraded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DegradeReason>,
}

impl Comment {
    pub fn is_degraded(&self) -> bool {
        self.source == CommentSource::Degraded
    }
}

/// Persona and sampling for the text model.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentStyle {
    pub system_prompt: String,
    /// Upper bound on comment length requested from the model.
    pub max_chars: usize,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for CommentStyle {
    fn default() -> Self {
        Self {
            system_prompt: "You are a cute desktop pet cat sitting on the user's spreadsheet. \
                Give one short, friendly and helpful remark about what you see."
                .to_string(),
            max_chars: 60,
            temperature: 0.7,
            max_tokens: 64,
        }
    }
}

impl CommentStyle {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn options(&self, model: &str) -> CompletionOptions {
        CompletionOptions::with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .for_model(model)
    }

    fn user_prompt(&self, scene: &SceneDescription, instruction: Option<&str>) -> String {
        let instruction = instruction
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("none");
        format!(
            "Screen observations:\n{}\n\nExtra request from the user: {}\n\n\
             Reply with one remark of at most {} characters, on a single line, without explanation.",
            scene.to_prompt_context(),
            instruction,
            self.max_chars
        )
    }
}

/// Drives vision then text generation, degrading instead of failing.
pub struct CommentOrchestrator {
    vision: VisionTierSelector,
    text: Option<Arc<dyn LLMProvider>>,
    retry: RetryExecutor,
    degraded: DegradedCommenter,
    style: CommentStyle,
}

impl fmt::Debug for CommentOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommentOrchestrator")
            .field("vision", &self.vision)
            .field("text", &self.text.as_ref().map(|p| p.model().to_string()))
            .field("style", &self.style)
            .finish()
    }
}

impl CommentOrchestrator {
    /// `retry` protects the text endpoint; the vision selector carries its own.
    pub fn new(
        vision: VisionTierSelector,
        text: Option<Arc<dyn LLMProvider>>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            vision,
            text,
            retry,
            degraded: DegradedCommenter::new(),
            style: CommentStyle::default(),
        }
    }

    pub fn with_style(mut self, style: CommentStyle) -> Self {
        self.style = style;
        self
    }

    pub fn gate(&self) -> &Arc<CooldownGate> {
        self.retry.gate()
    }

    pub fn vision(&self) -> &VisionTierSelector {
        &self.vision
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.retry.cancellation_token()
    }

    /// Abandon in-flight calls. Later requests degrade immediately.
    pub fn shutdown(&self) {
        info!("Comment pipeline shutting down");
        self.retry.cancellation_token().cancel();
        self.vision.retry().cancellation_token().cancel();
    }

    /// Upper bound on retry sleeps for one request (vision + text), plus
    /// the model-discovery bound while discovery is pending.
    pub fn worst_case_budget(&self) -> Duration {
        let text = if self.text.is_some() {
            self.retry.worst_case_budget()
        } else {
            Duration::ZERO
        };
        self.vision.worst_case_budget() + text
    }

    /// Comment on `image`.
    pub async fn generate_comment(&self, image: &ScreenImage) -> Comment {
        self.generate_comment_with(image, None).await
    }

    /// Comment on `image`, honouring an optional user instruction.
    pub async fn generate_comment_with(
        &self,
        image: &ScreenImage,
        instruction: Option<&str>,
    ) -> Comment {
        if self.retry.cancellation_token().is_cancelled() {
            return self.degrade(DegradeReason::Cancelled, &SceneDescription::empty());
        }

        let question = instruction.and_then(PresenceQuestion::parse);
        if question == Some(PresenceQuestion::AmbiguousColumn) {
            return Self::local(CLARIFY_COLUMN.to_string());
        }

        let text_open = self.text.is_some() && self.gate().may_attempt(Endpoint::Text).await;
        let report = if text_open || self.text.is_none() {
            self.vision.analyze(image, instruction).await
        } else {
            debug!("Text gate is cooling, local vision only");
            self.vision.analyze_local(image).await
        };
        let scene = report.scene;
        debug!(
            source = ?scene.source,
            detections = scene.detections.len(),
            "Scene ready"
        );

        if let Some(question) = question {
            let estimate = self
                .vision
                .local()
                .estimate_presence(image, question.column())
                .await;
            if let Some(reply) = presence_reply(question, estimate.as_ref(), &scene) {
                info!(question = ?question, "Answered data-presence question locally");
                return Self::local(reply);
            }
        }

        let Some(provider) = &self.text else {
            return self.degrade(DegradeReason::NotConfigured, &scene);
        };

        if !text_open {
            return self.degrade(DegradeReason::GateCooling, &scene);
        }

        let messages = vec![
            ChatMessage::system(self.style.system_prompt.clone()),
            ChatMessage::user(self.style.user_prompt(&scene, instruction)),
        ];
        let options = self.style.options(provider.model());

        let outcome = self
            .retry
            .execute(Endpoint::Text, || provider.chat(&messages, Some(&options)))
            .await;

        match outcome {
            Ok(response) => {
                debug!(
                    model = %response.model,
                    tokens = response.total_tokens(),
                    "Text model replied"
                );
                let text = normalize_line(&response.content);
                if text.is_empty() {
                    return self.degrade(DegradeReason::RemoteFailed, &scene);
                }
                Comment {
                    text,
                    source: CommentSource::Remote,
                    reason: None,
                }
            }
            Err(failure) => self.degrade(DegradeReason::from_failure(&failure), &scene),
        }
    }

    fn local(text: String) -> Comment {
        Comment {
            text: normalize_line(&text),
            source: CommentSource::Local,
            reason: None,
        }
    }

    fn degrade(&self, reason: DegradeReason, scene: &SceneDescription) -> Comment {
        info!(reason = %reason, "Using degraded comment");
        Comment {
            text: self.degraded.comment(reason, scene),
            source: CommentSource::Degraded,
            reason: Some(reason),
        }
    }
}
