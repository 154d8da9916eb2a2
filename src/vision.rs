//! Vision tier: local detector first, remote vision model second.
//!
//! ```text
//!  ScreenImage
//!      │
//!      ▼
//!  LocalVision ready? ──yes──► detect (blocking pool) ──≥1 hit──► Scene{Local}
//!      │ no                          │ none / error
//!      ▼                             ▼
//!  remote provider? ──no──► Scene{empty, Remote}
//!      │ yes
//!      ▼
//!  list_models once: one attempt through RetryExecutor(Endpoint::Vision),
//!      bounded by DISCOVERY_TIMEOUT; vision-looking ids go first
//!      │
//!      ▼
//!  for model in candidates:
//!      RetryExecutor(Endpoint::Vision) ──ok──► parse reply ──► Scene{Remote}
//!      │ failure says "no images here" → next model
//!      │ any other failure             → stop
//!      ▼
//!  Scene{empty, Remote}
//! ```
//!
//! The selector never returns an error: an empty scene is the degraded
//! result and the orchestrator copes with it. [`VisionTierSelector::analyze_local`]
//! runs the first box only.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::LocalVisionConfig;
use crate::error::{CommentaryError, Result};
use crate::gate::Endpoint;
use crate::presence::{ColumnRef, PresenceEstimate};
use crate::retry::{CallFailure, FailureOrigin, RetryExecutor};
use crate::traits::{ChatMessage, CompletionOptions, ImageData, LLMProvider};

/// Known vision variants served by Moonshot endpoints.
pub const MOONSHOT_VISION_MODELS: [&str; 3] = [
    "moonshot-v1-vision-preview",
    "moonshot-v1-128k-vision-preview",
    "moonshot-v1-32k-vision-preview",
];

/// Upper bound on one model-listing request.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const DISCOVERY_KEYWORDS: [&str; 4] = ["vision", "vl", "multimodal", "image"];

const UNSUPPORTED_IMAGE_SIGNALS: [&str; 5] = [
    "image input not supported",
    "vision",
    "unsupported",
    "input_image",
    "image_url",
];

const VISION_SYSTEM_PROMPT: &str = "You are a screen analysis agent. Identify the application, \
the current view and the visible UI elements in the screenshot.";

const VISION_USER_PROMPT: &str = "List the notable elements of this screenshot as JSON: \
{\"detections\": [{\"label\": string, \"bbox\": [x, y, w, h], \"confidence\": 0..1}]}. \
If you cannot produce boxes, describe the screen in one short paragraph instead.";

// ============================================================================
// Scene types
// ============================================================================

/// A PNG screenshot.
#[derive(Clone, PartialEq, Eq)]
pub struct ScreenImage {
    png: Arc<[u8]>,
}

impl ScreenImage {
    pub fn from_png(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            png: Arc::from(bytes.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.png
    }

    pub fn is_empty(&self) -> bool {
        self.png.is_empty()
    }

    /// Base64 payload for a vision request, `detail = "auto"`.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(STANDARD.encode(&self.png), "image/png").with_detail("auto")
    }
}

impl fmt::Debug for ScreenImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenImage")
            .field("bytes", &self.png.len())
            .finish()
    }
}

/// Axis-aligned box in screenshot pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// One labelled region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    /// In `0.0..=1.0`.
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Free-text annotation from a description-only vision model.
    pub fn annotation(text: impl Into<String>) -> Self {
        Self::new(text, BoundingBox::default(), 1.0)
    }
}

/// Which tier produced a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneSource {
    Local,
    Remote,
}

/// Normalized output of the vision step. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub detections: Vec<Detection>,
    pub source: SceneSource,
}

impl SceneDescription {
    pub fn new(detections: Vec<Detection>, source: SceneSource) -> Self {
        Self { detections, source }
    }

    /// The degraded scene: nothing detected, tagged `Remote`.
    pub fn empty() -> Self {
        Self::new(Vec::new(), SceneSource::Remote)
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Most confident detection; the first one wins ties.
    pub fn top(&self) -> Option<&Detection> {
        self.detections.iter().fold(None, |best: Option<&Detection>, d| match best {
            Some(b) if b.confidence >= d.confidence => Some(b),
            _ => Some(d),
        })
    }

    /// Prompt context for the text model, one detection per line.
    pub fn to_prompt_context(&self) -> String {
        if self.detections.is_empty() {
            return "(nothing notable detected)".to_string();
        }
        self.detections
            .iter()
            .map(|d| {
                if d.bbox.is_zero() {
                    d.label.clone()
                } else {
                    format!(
                        "{} (confidence {:.2}) at [{:.0}, {:.0}, {:.0}, {:.0}]",
                        d.label, d.confidence, d.bbox.x, d.bbox.y, d.bbox.w, d.bbox.h
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Local detector
// ============================================================================

/// Options handed to a local detector on every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub conf_threshold: f32,
    pub max_det: usize,
    pub imgsz: u32,
}

impl From<&LocalVisionConfig> for DetectOptions {
    fn from(config: &LocalVisionConfig) -> Self {
        Self {
            conf_threshold: config.conf_threshold,
            max_det: config.max_det,
            imgsz: config.predict_imgsz,
        }
    }
}

/// An object-detection model running in-process.
///
/// `detect` is synchronous and may be slow; it is always called from the
/// blocking pool.
pub trait LocalDetector: Send + Sync + 'static {
    fn detect(&self, image: &ScreenImage, options: &DetectOptions) -> Result<Vec<Detection>>;

    /// How much data the sheet shows and, when asked, one column of it.
    /// Detectors that cannot tell return `None`.
    fn estimate_presence(
        &self,
        _image: &ScreenImage,
        _column: Option<ColumnRef>,
    ) -> Option<PresenceEstimate> {
        None
    }
}

/// Loads a [`LocalDetector`] from a model file.
pub trait DetectorLoader: Send + Sync {
    fn load(&self, model_path: &Path) -> Result<Arc<dyn LocalDetector>>;
}

impl<F> DetectorLoader for F
where
    F: Fn(&Path) -> Result<Arc<dyn LocalDetector>> + Send + Sync,
{
    fn load(&self, model_path: &Path) -> Result<Arc<dyn LocalDetector>> {
        self(model_path)
    }
}

/// The local vision tier and why it is (not) usable.
#[derive(Clone)]
pub struct LocalVision {
    config: LocalVisionConfig,
    detector: Option<Arc<dyn LocalDetector>>,
    status: String,
}

impl fmt::Debug for LocalVision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalVision")
            .field("config", &self.config)
            .field("loaded", &self.detector.is_some())
            .field("status", &self.status)
            .finish()
    }
}

impl LocalVision {
    /// Local vision turned off.
    pub fn disabled() -> Self {
        Self {
            config: LocalVisionConfig::default(),
            detector: None,
            status: "local vision disabled".to_string(),
        }
    }

    /// Load the detector described by `config`.
    ///
    /// Never fails: problems are reported through [`status_message`](Self::status_message)
    /// and leave the tier not ready.
    pub fn load(config: &LocalVisionConfig, loader: &dyn DetectorLoader) -> Self {
        let mut vision = Self {
            config: config.clone(),
            detector: None,
            status: String::new(),
        };

        if !config.enabled {
            vision.status = "local vision disabled".to_string();
            return vision;
        }

        let model_path = config.model_path.trim();
        if model_path.is_empty() {
            vision.status = "local_vision.model_path is not configured".to_string();
            warn!("{}", vision.status);
            return vision;
        }

        let path = Path::new(model_path);
        if !path.exists() {
            vision.status = format!("local vision model not found: {}", path.display());
            warn!("{}", vision.status);
            return vision;
        }

        match loader.load(path) {
            Ok(detector) => {
                info!(model_path = %path.display(), "Local vision model loaded");
                vision.detector = Some(detector);
                vision.status = format!("ready: {}", path.display());
            }
            Err(e) => {
                vision.status = format!("failed to load local vision model: {}", e);
                warn!("{}", vision.status);
            }
        }
        vision
    }

    /// Use an already constructed detector.
    pub fn with_detector(config: &LocalVisionConfig, detector: Arc<dyn LocalDetector>) -> Self {
        let status = if config.enabled {
            "ready".to_string()
        } else {
            "local vision disabled".to_string()
        };
        Self {
            config: config.clone(),
            detector: Some(detector),
            status,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.config.enabled && self.detector.is_some()
    }

    pub fn status_message(&self) -> &str {
        &self.status
    }

    pub fn config(&self) -> &LocalVisionConfig {
        &self.config
    }

    /// Run the detector on the blocking pool.
    ///
    /// Returns detections at or above `conf_threshold`, most confident
    /// first, at most `max_det` of them.
    pub async fn detect(&self, image: &ScreenImage) -> Result<Vec<Detection>> {
        let detector = match (&self.detector, self.config.enabled) {
            (Some(detector), true) => Arc::clone(detector),
            _ => return Err(CommentaryError::LocalVision(self.status.clone())),
        };

        let options = DetectOptions::from(&self.config);
        let image = image.clone();
        let raw = tokio::task::spawn_blocking(move || detector.detect(&image, &options))
            .await
            .map_err(|e| CommentaryError::LocalVision(format!("detector task failed: {}", e)))??;

        Ok(Self::filter(raw, &options))
    }

    /// Data-presence verdict from the detector, on the blocking pool.
    pub async fn estimate_presence(
        &self,
        image: &ScreenImage,
        column: Option<ColumnRef>,
    ) -> Option<PresenceEstimate> {
        let detector = match (&self.detector, self.config.enabled) {
            (Some(detector), true) => Arc::clone(detector),
            _ => return None,
        };
        let image = image.clone();
        match tokio::task::spawn_blocking(move || detector.estimate_presence(&image, column)).await
        {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!(error = %e, "Data-presence task failed");
                None
            }
        }
    }

    fn filter(raw: Vec<Detection>, options: &DetectOptions) -> Vec<Detection> {
        let mut kept: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= options.conf_threshold)
            .collect();
        kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        kept.truncate(options.max_det);
        kept
    }
}

// ============================================================================
// Remote reply parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    label: String,
    #[serde(default)]
    bbox: Option<[f32; 4]>,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteScene {
    Wrapped { detections: Vec<RemoteDetection> },
    Bare(Vec<RemoteDetection>),
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Turn a remote vision reply into detections.
///
/// Structured JSON is used as-is; anything else becomes one annotation.
pub fn parse_remote_detections(reply: &str) -> Vec<Detection> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<RemoteScene>(body) {
        Ok(scene) => {
            let raw = match scene {
                RemoteScene::Wrapped { detections } | RemoteScene::Bare(detections) => detections,
            };
            let mut detections: Vec<Detection> = raw
                .into_iter()
                .filter(|d| !d.label.trim().is_empty())
                .map(|d| {
                    let [x, y, w, h] = d.bbox.unwrap_or_default();
                    Detection::new(d.label.trim(), BoundingBox::new(x, y, w, h), d.confidence)
                })
                .collect();
            detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            detections
        }
        Err(_) => vec![Detection::annotation(reply.trim())],
    }
}

// ============================================================================
// Model candidates
// ============================================================================

/// Ordered, de-duplicated vision model candidates.
pub fn build_vision_candidates(
    vision_model: &str,
    text_model: &str,
    base_url: Option<&str>,
) -> Vec<String> {
    let mut candidates = vec![vision_model.to_string()];
    if base_url.is_some_and(|url| url.to_lowercase().contains("moonshot")) {
        candidates.extend(MOONSHOT_VISION_MODELS.iter().map(|m| m.to_string()));
    }
    candidates.push(vision_model.to_string());
    candidates.push(text_model.to_string());
    dedup_models(candidates)
}

fn dedup_models(models: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for model in models {
        let model = model.trim();
        if !model.is_empty() && !unique.iter().any(|m| m == model) {
            unique.push(model.to_string());
        }
    }
    unique
}

fn looks_like_vision_model(id: &str) -> bool {
    let lowered = id.to_lowercase();
    DISCOVERY_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Whether a failure means "this model does not take images".
pub fn is_vision_unsupported(message: &str) -> bool {
    let lowered = message.to_lowercase();
    UNSUPPORTED_IMAGE_SIGNALS.iter().any(|s| lowered.contains(s))
}

// ============================================================================
// Selector
// ============================================================================

/// Result of one vision step, with the failure that degraded it (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct SceneReport {
    pub scene: SceneDescription,
    pub model: Option<String>,
    pub failure: Option<CallFailure>,
}

impl SceneReport {
    fn local(scene: SceneDescription) -> Self {
        Self {
            scene,
            model: None,
            failure: None,
        }
    }

    fn degraded(failure: Option<CallFailure>) -> Self {
        Self {
            scene: SceneDescription::empty(),
            model: None,
            failure,
        }
    }
}

/// Chooses between the local detector and the remote vision model.
pub struct VisionTierSelector {
    local: LocalVision,
    remote: Option<Arc<dyn LLMProvider>>,
    retry: RetryExecutor,
    candidates: Vec<String>,
    discovered: OnceCell<Vec<String>>,
    options: CompletionOptions,
}

impl fmt::Debug for VisionTierSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionTierSelector")
            .field("local", &self.local)
            .field("remote", &self.remote.as_ref().map(|p| p.name().to_string()))
            .field("candidates", &self.candidates)
            .finish()
    }
}

impl VisionTierSelector {
    /// Build a selector. `candidates` defaults to the remote provider's
    /// model when empty.
    pub fn new(
        local: LocalVision,
        remote: Option<Arc<dyn LLMProvider>>,
        retry: RetryExecutor,
        candidates: Vec<String>,
    ) -> Self {
        let candidates = if candidates.is_empty() {
            remote
                .as_ref()
                .map(|p| vec![p.model().to_string()])
                .unwrap_or_default()
        } else {
            dedup_models(candidates)
        };
        Self {
            local,
            remote,
            retry,
            candidates,
            discovered: OnceCell::new(),
            options: CompletionOptions::with_temperature(0.2).with_max_tokens(400),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn local(&self) -> &LocalVision {
        &self.local
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Upper bound on retry sleeps during one [`analyze`](Self::analyze),
    /// plus the discovery bound while model discovery is still pending.
    ///
    /// Falling through candidates multiplies the per-call bound, but every
    /// sleep follows a counted failure, so the gate's trip threshold caps
    /// the total.
    pub fn worst_case_budget(&self) -> Duration {
        if self.remote.is_none() {
            return Duration::ZERO;
        }
        let per_call = self.retry.max_attempts().saturating_sub(1);
        let candidates = self.candidates().len().max(1) as u32;
        let gate_bound = self.retry.gate().trip_threshold().saturating_sub(1);
        let sleeps = per_call.saturating_mul(candidates).min(gate_bound);
        let discovery = if self.discovered.initialized() {
            Duration::ZERO
        } else {
            self.discovery_timeout()
        };
        self.retry.policy().max_delay.saturating_mul(sleeps) + discovery
    }

    /// Current candidate order, including discovered models.
    pub fn candidates(&self) -> Vec<String> {
        match self.discovered.get() {
            Some(found) => dedup_models(found.iter().chain(self.candidates.iter()).cloned()),
            None => self.candidates.clone(),
        }
    }

    fn discovery_timeout(&self) -> Duration {
        self.retry
            .attempt_timeout()
            .map_or(DISCOVERY_TIMEOUT, |limit| limit.min(DISCOVERY_TIMEOUT))
    }

    /// Ask the provider for vision-capable models, once per selector.
    ///
    /// A single attempt through the retry executor, so the vision gate
    /// sees its outcome. Only a listing or a non-transport failure settles
    /// discovery; otherwise the next analysis tries again.
    async fn discover(&self, provider: &Arc<dyn LLMProvider>) {
        if self.discovered.initialized() {
            return;
        }
        let executor = self
            .retry
            .clone()
            .with_max_attempts(1)
            .with_attempt_timeout(Some(self.discovery_timeout()));
        let outcome = executor
            .execute(Endpoint::Vision, || async move {
                match provider.list_models().await {
                    Err(CommentaryError::NotSupported(_)) => Ok(Vec::new()),
                    other => other,
                }
            })
            .await;

        let found = match outcome {
            Ok(ids) => {
                let found: Vec<String> =
                    ids.into_iter().filter(|id| looks_like_vision_model(id)).collect();
                debug!(count = found.len(), "Discovered vision models");
                found
            }
            Err(failure)
                if failure.origin == FailureOrigin::Call && !failure.category.is_transport() =>
            {
                debug!(category = %failure.category, "Vision model discovery unavailable: {}", failure.message);
                Vec::new()
            }
            Err(failure) => {
                debug!(category = %failure.category, "Vision model discovery deferred: {}", failure.message);
                return;
            }
        };
        // A concurrent analysis may have filled it first.
        let _ = self.discovered.set(found);
    }

    async fn local_scene(&self, image: &ScreenImage) -> Option<SceneDescription> {
        if !self.local.is_ready() {
            return None;
        }
        match self.local.detect(image).await {
            Ok(detections) if !detections.is_empty() => {
                debug!(count = detections.len(), "Local vision tier produced the scene");
                Some(SceneDescription::new(detections, SceneSource::Local))
            }
            Ok(_) => {
                debug!("Local vision found nothing above threshold");
                None
            }
            Err(e) => {
                warn!(error = %e, "Local vision failed");
                None
            }
        }
    }

    /// Local tier only. Never touches the network; an empty scene when
    /// the detector is unavailable or finds nothing.
    pub async fn analyze_local(&self, image: &ScreenImage) -> SceneReport {
        match self.local_scene(image).await {
            Some(scene) => SceneReport::local(scene),
            None => SceneReport::degraded(None),
        }
    }

    /// Scene for `image`; never fails.
    pub async fn get_scene(&self, image: &ScreenImage) -> SceneDescription {
        self.analyze(image, None).await.scene
    }

    /// Like [`get_scene`](Self::get_scene), with an optional user
    /// instruction and the failure that degraded the scene.
    pub async fn analyze(&self, image: &ScreenImage, instruction: Option<&str>) -> SceneReport {
        if let Some(scene) = self.local_scene(image).await {
            return SceneReport::local(scene);
        }

        let Some(provider) = &self.remote else {
            debug!("No remote vision provider, using empty scene");
            return SceneReport::degraded(None);
        };

        self.discover(provider).await;

        let mut prompt = VISION_USER_PROMPT.to_string();
        if let Some(instruction) = instruction.map(str::trim).filter(|s| !s.is_empty()) {
            prompt.push_str("\nThe user asked: ");
            prompt.push_str(instruction);
        }
        let messages = vec![
            ChatMessage::system(VISION_SYSTEM_PROMPT),
            ChatMessage::user_with_images(prompt, vec![image.to_image_data()]),
        ];

        let mut last_failure = None;
        for model in self.candidates() {
            let options = self.options.clone().for_model(model.clone());
            let outcome = self
                .retry
                .execute(Endpoint::Vision, || provider.chat(&messages, Some(&options)))
                .await;

            match outcome {
                Ok(response) => {
                    debug!(model = %model, "Remote vision tier produced the scene");
                    return SceneReport {
                        scene: SceneDescription::new(
                            parse_remote_detections(&response.content),
                            SceneSource::Remote,
                        ),
                        model: Some(model),
                        failure: None,
                    };
                }
                Err(failure) => {
                    let try_next = failure.origin == FailureOrigin::Call
                        && !failure.category.is_transport()
                        && is_vision_unsupported(&failure.message);
                    warn!(
                        model = %model,
                        category = %failure.category,
                        try_next,
                        "Remote vision failed: {}",
                        failure.message
                    );
                    last_failure = Some(failure);
                    if !try_next {
                        break;
                    }
                }
            }
        }

        SceneReport::degraded(last_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::CooldownGate;
    use crate::providers::{MockDetector, MockProvider};

    fn local_config() -> LocalVisionConfig {
        LocalVisionConfig {
            enabled: true,
            model_path: "unused.pt".to_string(),
            conf_threshold: 0.25,
            max_det: 2,
            predict_imgsz: 640,
        }
    }

    fn image() -> ScreenImage {
        ScreenImage::from_png(vec![0x89, b'P', b'N', b'G'])
    }

    fn selector(
        local: LocalVision,
        remote: Option<Arc<MockProvider>>,
        candidates: Vec<String>,
    ) -> (VisionTierSelector, Arc<CooldownGate>) {
        let gate = Arc::new(CooldownGate::default());
        let retry = RetryExecutor::new(gate.clone()).silent();
        let remote = remote.map(|p| p as Arc<dyn LLMProvider>);
        (VisionTierSelector::new(local, remote, retry, candidates), gate)
    }

    #[test]
    fn test_image_data_is_base64_png() {
        let data = image().to_image_data();
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(data.data, "iVBORw==");
        assert_eq!(data.detail.as_deref(), Some("auto"));
    }

    #[test]
    fn test_scene_top_and_context() {
        let scene = SceneDescription::new(
            vec![
                Detection::new("cell", BoundingBox::new(1.0, 2.0, 3.0, 4.0), 0.4),
                Detection::new("chart", BoundingBox::new(10.0, 20.0, 30.0, 40.0), 0.9),
            ],
            SceneSource::Local,
        );
        assert_eq!(scene.top().unwrap().label, "chart");
        assert!(scene.to_prompt_context().contains("chart (confidence 0.90)"));
        assert!(SceneDescription::empty().top().is_none());
        assert_eq!(SceneDescription::empty().source, SceneSource::Remote);
    }

    #[test]
    fn test_parse_remote_wrapped_json() {
        let reply = r#"```json
{"detections": [{"label": "toolbar", "bbox": [0, 0, 800, 40], "confidence": 0.6},
                {"label": "chart", "bbox": [100, 100, 300, 200], "confidence": 0.95}]}
```"#;
        let detections = parse_remote_detections(reply);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "chart");
        assert_eq!(detections[0].bbox, BoundingBox::new(100.0, 100.0, 300.0, 200.0));
    }

    #[test]
    fn test_parse_remote_bare_array() {
        let detections = parse_remote_detections(r#"[{"label": "formula bar"}]"#);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 1.0);
        assert!(detections[0].bbox.is_zero());
    }

    #[test]
    fn test_parse_remote_free_text() {
        let detections = parse_remote_detections("  Excel with a pivot table open.\n");
        assert_eq!(
            detections,
            vec![Detection::annotation("Excel with a pivot table open.")]
        );
        assert!(parse_remote_detections("   ").is_empty());
    }

    #[test]
    fn test_build_candidates_moonshot() {
        let candidates = build_vision_candidates(
            "moonshot-v1-8k",
            "moonshot-v1-8k",
            Some("https://api.moonshot.cn/v1"),
        );
        assert_eq!(
            candidates,
            vec![
                "moonshot-v1-8k",
                "moonshot-v1-vision-preview",
                "moonshot-v1-128k-vision-preview",
                "moonshot-v1-32k-vision-preview",
            ]
        );
    }

    #[test]
    fn test_build_candidates_other_endpoint() {
        let candidates =
            build_vision_candidates("qwen-vl-max", "qwen-plus", Some("https://dashscope.aliyuncs.com"));
        assert_eq!(candidates, vec!["qwen-vl-max", "qwen-plus"]);
    }

    #[test]
    fn test_vision_unsupported_signals() {
        assert!(is_vision_unsupported("Invalid request: image input not supported"));
        assert!(is_vision_unsupported("unknown field image_url"));
        assert!(!is_vision_unsupported("Rate limit exceeded"));
    }

    #[test]
    fn test_load_reports_status() {
        let loader = |_: &Path| -> Result<Arc<dyn LocalDetector>> {
            Ok(Arc::new(MockDetector::new(Vec::new())))
        };

        let disabled = LocalVision::load(&LocalVisionConfig::default(), &loader);
        assert!(!disabled.is_ready());
        assert!(disabled.status_message().contains("disabled"));

        let mut config = local_config();
        config.model_path = String::new();
        let no_path = LocalVision::load(&config, &loader);
        assert!(no_path.status_message().contains("model_path"));

        config.model_path = "/definitely/not/here/excel.pt".to_string();
        let missing = LocalVision::load(&config, &loader);
        assert!(!missing.is_ready());
        assert!(missing.status_message().contains("not found"));
    }

    #[test]
    fn test_load_from_existing_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut config = local_config();
        config.model_path = file.path().display().to_string();

        let ok_loader = |_: &Path| -> Result<Arc<dyn LocalDetector>> {
            Ok(Arc::new(MockDetector::new(Vec::new())))
        };
        let vision = LocalVision::load(&config, &ok_loader);
        assert!(vision.is_ready());
        assert!(vision.status_message().starts_with("ready"));

        let bad_loader = |_: &Path| -> Result<Arc<dyn LocalDetector>> {
            Err(CommentaryError::LocalVision("corrupt weights".to_string()))
        };
        let vision = LocalVision::load(&config, &bad_loader);
        assert!(!vision.is_ready());
        assert!(vision.status_message().contains("corrupt weights"));
    }

    #[tokio::test]
    async fn test_local_detect_filters_sorts_truncates() {
        let detector = MockDetector::new(vec![
            Detection::new("a", BoundingBox::default(), 0.3),
            Detection::new("b", BoundingBox::default(), 0.1),
            Detection::new("c", BoundingBox::default(), 0.8),
            Detection::new("d", BoundingBox::default(), 0.5),
        ]);
        let vision = LocalVision::with_detector(&local_config(), Arc::new(detector));
        let labels: Vec<_> = vision
            .detect(&image())
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.label)
            .collect();
        assert_eq!(labels, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_local_hit_skips_network() {
        let detector = Arc::new(MockDetector::new(vec![Detection::new(
            "chart",
            BoundingBox::new(5.0, 5.0, 50.0, 50.0),
            0.9,
        )]));
        let remote = Arc::new(MockProvider::new());
        let (selector, _) = selector(
            LocalVision::with_detector(&local_config(), detector.clone()),
            Some(remote.clone()),
            vec!["vision-model".to_string()],
        );

        let scene = selector.get_scene(&image()).await;
        assert_eq!(scene.source, SceneSource::Local);
        assert_eq!(detector.call_count(), 1);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_local_miss_falls_back_to_remote() {
        let detector = Arc::new(MockDetector::new(vec![Detection::new(
            "noise",
            BoundingBox::default(),
            0.05,
        )]));
        let remote = Arc::new(MockProvider::new());
        remote.add_response("A spreadsheet with totals.").await;
        let (selector, _) = selector(
            LocalVision::with_detector(&local_config(), detector),
            Some(remote.clone()),
            vec!["vision-model".to_string()],
        );

        let scene = selector.get_scene(&image()).await;
        assert_eq!(scene.source, SceneSource::Remote);
        assert_eq!(scene.detections[0].label, "A spreadsheet with totals.");
        assert_eq!(remote.call_count(), 1);
        assert!(remote.last_messages().await.iter().any(|m| m.has_images()));
    }

    #[tokio::test]
    async fn test_no_remote_gives_empty_scene() {
        let (selector, _) = selector(LocalVision::disabled(), None, Vec::new());
        let report = selector.analyze(&image(), None).await;
        assert_eq!(report.scene, SceneDescription::empty());
        assert!(report.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_model_moves_to_next_candidate() {
        let remote = Arc::new(MockProvider::new());
        remote
            .add_error(CommentaryError::InvalidRequest(
                "image input not supported".to_string(),
            ))
            .await;
        remote.add_response(r#"[{"label": "grid", "confidence": 0.7}]"#).await;
        let (selector, _) = selector(
            LocalVision::disabled(),
            Some(remote.clone()),
            vec!["text-only".to_string(), "vision-model".to_string()],
        );

        let report = selector.analyze(&image(), Some("what is this?")).await;
        assert_eq!(report.model.as_deref(), Some("vision-model"));
        assert_eq!(report.scene.detections[0].label, "grid");
        assert_eq!(
            remote.requested_models().await,
            vec!["text-only".to_string(), "vision-model".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_stops_candidates() {
        let remote = Arc::new(MockProvider::new());
        remote
            .add_error(CommentaryError::AuthError("bad key".to_string()))
            .await;
        let (selector, gate) = selector(
            LocalVision::disabled(),
            Some(remote.clone()),
            vec!["a".to_string(), "b".to_string()],
        );

        let report = selector.analyze(&image(), None).await;
        assert!(report.scene.is_empty());
        assert_eq!(report.failure.unwrap().category, crate::classifier::ErrorCategory::Auth);
        assert_eq!(remote.call_count(), 1);
        assert_eq!(gate.snapshot(Endpoint::Vision).await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_runs_once_and_prepends() {
        let remote = Arc::new(
            MockProvider::new().with_models(vec![
                "moonshot-v1-8k".to_string(),
                "qwen-vl-plus".to_string(),
            ]),
        );
        remote.add_response("first").await;
        remote.add_response("second").await;
        let (selector, _) = selector(
            LocalVision::disabled(),
            Some(remote.clone()),
            vec!["moonshot-v1-8k".to_string()],
        );

        selector.get_scene(&image()).await;
        selector.get_scene(&image()).await;

        assert_eq!(remote.list_models_calls(), 1);
        assert_eq!(
            selector.candidates(),
            vec!["qwen-vl-plus".to_string(), "moonshot-v1-8k".to_string()]
        );
        assert_eq!(
            remote.requested_models().await,
            vec!["qwen-vl-plus".to_string(), "qwen-vl-plus".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_discovery_counts_on_vision_gate() {
        let remote = Arc::new(MockProvider::new().with_unreachable_models());
        remote
            .add_error(CommentaryError::AuthError("bad key".to_string()))
            .await;
        let (selector, gate) = selector(
            LocalVision::disabled(),
            Some(remote.clone()),
            vec!["vision-model".to_string()],
        );

        let report = selector.analyze(&image(), None).await;
        assert!(report.scene.is_empty());
        assert_eq!(remote.list_models_calls(), 1);
        assert_eq!(remote.call_count(), 1);
        let state = gate.snapshot(Endpoint::Vision).await;
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_category, Some(crate::classifier::ErrorCategory::Auth));

        // Still pending: the next analysis lists models again.
        let report = selector.analyze(&image(), None).await;
        assert_eq!(report.model.as_deref(), Some("vision-model"));
        assert_eq!(remote.list_models_calls(), 2);
        assert_eq!(gate.snapshot(Endpoint::Vision).await.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_discovery_is_bounded() {
        let remote = Arc::new(
            MockProvider::new()
                .with_models(vec!["qwen-vl-plus".to_string()])
                .with_latency(Duration::from_secs(300)),
        );
        let gate = Arc::new(CooldownGate::default());
        let retry = RetryExecutor::new(gate.clone())
            .silent()
            .with_max_attempts(1)
            .with_attempt_timeout(Some(Duration::from_secs(2)));
        let selector = VisionTierSelector::new(
            LocalVision::disabled(),
            Some(remote.clone() as Arc<dyn LLMProvider>),
            retry,
            vec!["vision-model".to_string()],
        );
        assert_eq!(selector.worst_case_budget(), Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let report = selector.analyze(&image(), None).await;

        // Two bounded attempts: discovery, then the one chat call.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(remote.list_models_calls(), 1);
        assert_eq!(remote.call_count(), 1);
        assert_eq!(
            report.failure.map(|f| f.category),
            Some(crate::classifier::ErrorCategory::Timeout)
        );
        assert_eq!(gate.snapshot(Endpoint::Vision).await.consecutive_failures, 2);
        assert_eq!(selector.candidates(), vec!["vision-model".to_string()]);
    }

    #[tokio::test]
    async fn test_analyze_local_never_calls_remote() {
        let remote = Arc::new(MockProvider::new());
        let detector = Arc::new(MockDetector::new(vec![Detection::new(
            "chart",
            BoundingBox::default(),
            0.9,
        )]));
        let (with_local, _) = selector(
            LocalVision::with_detector(&local_config(), detector),
            Some(remote.clone()),
            vec!["vision-model".to_string()],
        );
        let report = with_local.analyze_local(&image()).await;
        assert_eq!(report.scene.source, SceneSource::Local);

        let (remote_only, _) = selector(
            LocalVision::disabled(),
            Some(remote.clone()),
            vec!["vision-model".to_string()],
        );
        let report = remote_only.analyze_local(&image()).await;
        assert_eq!(report.scene, SceneDescription::empty());
        assert!(report.failure.is_none());

        assert_eq!(remote.call_count(), 0);
        assert_eq!(remote.list_models_calls(), 0);
    }
}
