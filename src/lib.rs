//! Pet Commentary - resilient vision + text pipeline for desktop-pet remarks
//!
//! Turns a screenshot into one short, in-character comment. Every request
//! yields a comment: remote failures end in an offline template, never in
//! an error surfaced to the host.
//!
//! # Tiers
//!
//! | Stage | Primary | Fallback | Last resort |
//! |-------|---------|----------|-------------|
//! | Vision | local detector | remote vision model candidates | empty scene |
//! | Text | remote text model | | degraded template |
//!
//! Data-presence questions ("is column B empty?") are answered on-device
//! when the local detector or the scene carries a verdict; see
//! [`crate::presence`].
//!
//! # Resilience
//!
//! ```text
//!   remote call ──► RetryExecutor ──► classify (classifier)
//!                        │                 │
//!                        │          BackoffPolicy delay
//!                        ▼
//!                  CooldownGate (per endpoint: trip after N failures,
//!                                skip the network while cooling)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pet_commentary::{PetConfig, PipelineFactory, ScreenImage};
//!
//! let orchestrator = PipelineFactory::new(PetConfig::load()?)?.build()?;
//! let comment = orchestrator
//!     .generate_comment(&ScreenImage::from_png(png_bytes))
//!     .await;
//! println!("{}", comment.text);
//! ```
//!
//! # See Also
//!
//! - [`crate::retry`] for the attempt loop
//! - [`crate::gate`] for the cooldown gate
//! - [`crate::vision`] for tier selection

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod degraded;
pub mod error;
pub mod factory;
pub mod gate;
pub mod orchestrator;
pub mod presence;
pub mod providers;
pub mod retry;
pub mod traits;
pub mod vision;

pub use backoff::BackoffPolicy;
pub use classifier::{classify, classify_error, classify_message, ErrorCategory};
pub use config::{BackoffConfig, ConfigError, LocalVisionConfig, PetConfig};
pub use degraded::{DegradeReason, DegradedCommenter};
pub use error::{CommentaryError, Result};
pub use factory::PipelineFactory;
pub use gate::{CooldownGate, Endpoint, GateState, GateTransition};
pub use orchestrator::{Comment, CommentOrchestrator, CommentSource, CommentStyle};
pub use presence::{ColumnPresence, ColumnRef, DataPresence, PresenceEstimate, PresenceQuestion};
pub use providers::{MockDetector, MockProvider, OpenAICompatibleProvider};
pub use retry::{
    AttemptRecord, AttemptStatus, CallFailure, CallOutcome, FailureOrigin, RetryExecutor,
};
pub use traits::{ChatMessage, ChatRole, CompletionOptions, ImageData, LLMProvider, LLMResponse};
pub use vision::{
    BoundingBox, DetectOptions, Detection, DetectorLoader, LocalDetector, LocalVision,
    SceneDescription, SceneReport, SceneSource, ScreenImage, VisionTierSelector,
};
