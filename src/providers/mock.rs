//! Scripted providers for tests.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Mock components                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MockProvider (remote endpoint)   MockDetector (local tier) │
//! │  ├── add_response()               ├── new(detections)       │
//! │  ├── add_error() / add_errors()   ├── failing(message)      │
//! │  ├── with_models()                ├── with_presence()       │
//! │  ├── with_latency()               └── call_count()          │
//! │  └── call_count() / requested_models()                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are consumed in order; once the script is empty the provider
//! keeps answering with its default reply.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{CommentaryError, Result};
use crate::traits::{ChatMessage, CompletionOptions, LLMProvider, LLMResponse};
use crate::presence::{ColumnRef, PresenceEstimate};
use crate::vision::{DetectOptions, Detection, LocalDetector, ScreenImage};

/// Mock remote endpoint with a scripted queue of replies and failures.
#[derive(Debug, Clone)]
pub struct MockProvider {
    model: String,
    script: Arc<Mutex<VecDeque<Result<String>>>>,
    default_reply: Option<String>,
    latency: Option<Duration>,
    models: Option<Vec<String>>,
    models_unreachable: bool,
    call_count: Arc<AtomicUsize>,
    list_models_calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, Vec<ChatMessage>)>>>,
}

impl MockProvider {
    /// Create a mock that answers "Mock response" once its script runs out.
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_reply: Some("Mock response".to_string()),
            latency: None,
            models: None,
            models_unreachable: false,
            call_count: Arc::new(AtomicUsize::new(0)),
            list_models_calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock whose every unscripted call fails with a connection error.
    pub fn unreachable() -> Self {
        Self {
            default_reply: None,
            ..Self::new()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sleep this long (tokio time) before answering each call,
    /// `list_models` included.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Model ids returned by `list_models`.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = Some(models);
        self
    }

    /// Make `list_models` fail with a connection error.
    pub fn with_unreachable_models(mut self) -> Self {
        self.models_unreachable = true;
        self
    }

    /// Queue a successful reply.
    pub async fn add_response(&self, response: impl Into<String>) {
        self.script.lock().await.push_back(Ok(response.into()));
    }

    /// Queue a failure.
    pub async fn add_error(&self, error: CommentaryError) {
        self.script.lock().await.push_back(Err(error));
    }

    /// Queue `count` failures built by `make`.
    pub async fn add_errors(&self, count: usize, make: impl Fn() -> CommentaryError) {
        let mut script = self.script.lock().await;
        for _ in 0..count {
            script.push_back(Err(make()));
        }
    }

    /// Number of `chat` calls that reached the mock.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn list_models_calls(&self) -> usize {
        self.list_models_calls.load(Ordering::SeqCst)
    }

    /// Model requested by each `chat` call, in order.
    pub async fn requested_models(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Messages of the most recent `chat` call.
    pub async fn last_messages(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .await
            .last()
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: Option<&CompletionOptions>,
    ) -> Result<LLMResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let model = options
            .and_then(|o| o.model.clone())
            .unwrap_or_else(|| self.model.clone());
        self.requests
            .lock()
            .await
            .push((model.clone(), messages.to_vec()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self.script.lock().await.pop_front();
        match next {
            Some(Ok(content)) => Ok(LLMResponse::new(content, model)),
            Some(Err(error)) => Err(error),
            None => match &self.default_reply {
                Some(content) => Ok(LLMResponse::new(content.clone(), model)),
                None => Err(CommentaryError::NetworkError(
                    "Connection failed: connection refused".to_string(),
                )),
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.list_models_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.models_unreachable {
            return Err(CommentaryError::NetworkError(
                "Connection failed: connection refused".to_string(),
            ));
        }
        self.models
            .clone()
            .ok_or_else(|| CommentaryError::NotSupported("model listing on mock".to_string()))
    }
}

// ============================================================================
// MockDetector
// ============================================================================

/// Local detector returning a fixed set of detections.
#[derive(Debug, Default)]
pub struct MockDetector {
    detections: Vec<Detection>,
    failure: Option<String>,
    presence: Option<PresenceEstimate>,
    calls: AtomicUsize,
}

impl MockDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            failure: None,
            presence: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A detector whose every call fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            detections: Vec::new(),
            failure: Some(message.into()),
            presence: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Data-presence verdict returned for every question.
    pub fn with_presence(mut self, estimate: PresenceEstimate) -> Self {
        self.presence = Some(estimate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LocalDetector for MockDetector {
    fn detect(&self, _image: &ScreenImage, _options: &DetectOptions) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(CommentaryError::LocalVision(message.clone())),
            None => Ok(self.detections.clone()),
        }
    }

    fn estimate_presence(
        &self,
        _image: &ScreenImage,
        _column: Option<ColumnRef>,
    ) -> Option<PresenceEstimate> {
        self.presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::BoundingBox;

    #[tokio::test]
    async fn test_mock_provider_script_order() {
        let provider = MockProvider::new();
        provider.add_response("first").await;
        provider.add_error(CommentaryError::Timeout).await;

        let r1 = provider.chat(&[ChatMessage::user("hi")], None).await.unwrap();
        assert_eq!(r1.content, "first");
        assert!(matches!(
            provider.chat(&[], None).await,
            Err(CommentaryError::Timeout)
        ));
        let r3 = provider.chat(&[], None).await.unwrap();
        assert_eq!(r3.content, "Mock response");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_provider_records_requests() {
        let provider = MockProvider::new().with_model("text-model");
        let options = CompletionOptions::default().for_model("vision-model");
        provider
            .chat(&[ChatMessage::user("look")], Some(&options))
            .await
            .unwrap();
        provider.chat(&[ChatMessage::user("talk")], None).await.unwrap();

        assert_eq!(
            provider.requested_models().await,
            vec!["vision-model".to_string(), "text-model".to_string()]
        );
        assert_eq!(provider.last_messages().await[0].content, "talk");
    }

    #[tokio::test]
    async fn test_unreachable_mock() {
        let provider = MockProvider::unreachable();
        provider.add_errors(2, || CommentaryError::Timeout).await;
        assert!(matches!(
            provider.chat(&[], None).await,
            Err(CommentaryError::Timeout)
        ));
        assert!(matches!(
            provider.chat(&[], None).await,
            Err(CommentaryError::Timeout)
        ));
        assert!(matches!(
            provider.chat(&[], None).await,
            Err(CommentaryError::NetworkError(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_list_models() {
        let provider = MockProvider::new();
        assert!(provider.list_models().await.is_err());

        let provider = MockProvider::new().with_models(vec!["a".to_string()]);
        assert_eq!(provider.list_models().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(provider.list_models_calls(), 1);

        let provider = MockProvider::new().with_unreachable_models();
        assert!(matches!(
            provider.list_models().await,
            Err(CommentaryError::NetworkError(_))
        ));
    }

    #[test]
    fn test_mock_detector() {
        let options = DetectOptions {
            conf_threshold: 0.25,
            max_det: 20,
            imgsz: 640,
        };
        let image = ScreenImage::from_png(vec![1, 2, 3]);
        let detector = MockDetector::new(vec![Detection::new("cell", BoundingBox::default(), 0.5)]);
        assert_eq!(detector.detect(&image, &options).unwrap().len(), 1);
        assert_eq!(detector.call_count(), 1);

        let failing = MockDetector::failing("no gpu");
        assert!(failing.detect(&image, &options).is_err());
    }
}
