//! OpenAI-compatible chat completions client.
//!
//! Works with any endpoint that follows the OpenAI chat completions format
//! (Moonshot, DashScope compatible mode, DeepSeek, local servers).
//!
//! # Status mapping
//!
//! | HTTP status | Error |
//! |-------------|-------|
//! | 401 / 403 | `AuthError` |
//! | 408 | `Timeout` |
//! | 429 | `RateLimited` (with `Retry-After` seconds when sent) |
//! | 404 mentioning a model | `ModelNotFound` |
//! | other 4xx | `InvalidRequest` |
//! | 5xx | `ApiError` |
//!
//! Transport failures go through `From<reqwest::Error>`, so a refused
//! connection surfaces as `NetworkError` and a client timeout as `Timeout`.

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CommentaryError, Result};
use crate::traits::{ChatMessage, CompletionOptions, LLMProvider, LLMResponse};

// ============================================================================
// Request/Response Types (OpenAI-compatible format)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessageRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    stream: bool,
}

/// Either a plain string or multipart text + images.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlContent },
}

#[derive(Debug, Serialize)]
struct ImageUrlContent {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    role: &'static str,
    content: RequestContent,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<MessageContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    /// String, or an array of `{type, text}` parts on some endpoints.
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAICompatibleProvider {
    /// Create a provider.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `base_url` is empty or the HTTP client cannot
    /// be built.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CommentaryError::ConfigError(format!(
                "Provider '{}' requires a base_url",
                name
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                CommentaryError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        let model = model.into();
        debug!(
            provider = %name,
            model = %model,
            base_url = %base_url,
            "Created OpenAI-compatible provider"
        );

        Ok(Self {
            client,
            name,
            api_key: api_key.into(),
            model,
            base_url,
        })
    }

    /// Set the default model for this provider.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn masked_key(&self) -> String {
        let visible: String = self.api_key.chars().take(4).collect();
        format!("{}***", visible)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            warn!(provider = %self.name, "No API key set");
            builder
        } else {
            debug!(provider = %self.name, api_key = %self.masked_key(), "Using API key");
            builder.bearer_auth(&self.api_key)
        }
    }

    /// Images become `image_url` parts next to the text part.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<MessageRequest> {
        messages
            .iter()
            .map(|msg| {
                let content = match &msg.images {
                    Some(images) if !images.is_empty() => {
                        let mut parts = Vec::with_capacity(images.len() + 1);
                        if !msg.content.is_empty() {
                            parts.push(ContentPart::Text {
                                text: msg.content.clone(),
                            });
                        }
                        parts.extend(images.iter().map(|img| ContentPart::ImageUrl {
                            image_url: ImageUrlContent {
                                url: img.to_data_uri(),
                                detail: img.detail.clone(),
                            },
                        }));
                        RequestContent::Parts(parts)
                    }
                    _ => RequestContent::Text(msg.content.clone()),
                };

                MessageRequest {
                    role: msg.role.as_str(),
                    content,
                }
            })
            .collect()
    }

    /// Flatten a `content` value into trimmed text.
    fn extract_text(content: Option<&serde_json::Value>) -> String {
        match content {
            Some(serde_json::Value::String(text)) => text.trim().to_string(),
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    serde_json::Value::String(text) => Some(text.as_str()),
                    serde_json::Value::Object(map) => map
                        .get("text")
                        .or_else(|| map.get("content"))
                        .and_then(|v| v.as_str()),
                    _ => None,
                })
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }

    fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && (0.0..=86_400.0).contains(secs))
            .map(Duration::from_secs_f64)
    }

    fn map_status(
        status: StatusCode,
        body: &str,
        retry_after: Option<Duration>,
        model: &str,
    ) -> CommentaryError {
        let message = match serde_json::from_str::<ErrorResponse>(body) {
            Ok(parsed) => match parsed.error.error_type {
                Some(kind) => format!("{}: {}", kind, parsed.error.message),
                None => parsed.error.message,
            },
            Err(_) => body.trim().to_string(),
        };

        match status.as_u16() {
            401 | 403 => CommentaryError::AuthError(message),
            408 => CommentaryError::Timeout,
            429 => CommentaryError::RateLimited {
                message,
                retry_after,
            },
            404 if message.to_lowercase().contains("model") => {
                CommentaryError::ModelNotFound(format!("{} ({})", model, message))
            }
            400..=499 => CommentaryError::InvalidRequest(message),
            code => CommentaryError::ApiError {
                status: code,
                message,
            },
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> Option<&str> {
        Some(&self.base_url)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: Option<&CompletionOptions>,
    ) -> Result<LLMResponse> {
        let options = options.cloned().unwrap_or_default();
        let model = options.model.as_deref().unwrap_or(&self.model);
        let request = ChatRequest {
            model,
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: false,
        };

        let url = self.chat_completions_url();
        debug!(provider = %self.name, model = %model, url = %url, "Chat request");

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.name, error = %e, "Request failed");
                CommentaryError::from(e)
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            let preview: String = body.chars().take(500).collect();
            warn!(
                provider = %self.name,
                status = status.as_u16(),
                "API error: {}",
                preview
            );
            return Err(Self::map_status(status, &body, retry_after, model));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let choice = parsed
            .choices
            .first()
            .ok_or(CommentaryError::EmptyResponse)?;
        let text = Self::extract_text(choice.message.as_ref().and_then(|m| m.content.as_ref()));
        if text.is_empty() {
            return Err(CommentaryError::EmptyResponse);
        }

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(
            LLMResponse::new(text, parsed.model.as_deref().unwrap_or(model))
                .with_usage(prompt_tokens, completion_tokens)
                .with_finish_reason(
                    choice
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                ),
        )
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = self.models_url();
        debug!(provider = %self.name, url = %url, "Listing models");

        let response = self.authorized(self.client.get(&url)).send().await?;
        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Self::map_status(status, &body, retry_after, &self.model));
        }

        let parsed: ModelsResponse = serde_json::from_str(&body)?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}
