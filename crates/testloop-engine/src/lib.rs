mod normalize;

pub use normalize::normalize_code;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use testloop_config::{ApiKey, RunConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// One completion call: a role instruction and a unit-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation request failed: {0}")]
    RequestFailed(String),
    #[error("backend returned no usable choice")]
    EmptyResponse,
}

/// A text-generation backend that turns a request into normalized code.
pub trait Generator {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerateError>;
}

/// Chat-completions backend reached over HTTP with a bearer credential.
pub struct HttpGenerator {
    client: reqwest::blocking::Client,
    url: String,
    api_key: ApiKey,
}

impl HttpGenerator {
    /// `timeout` of `None` leaves calls without a deadline.
    pub fn new(
        url: impl Into<String>,
        api_key: ApiKey,
        timeout: Option<Duration>,
    ) -> Result<Self, GenerateError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerateError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    pub fn from_config(config: &RunConfig) -> anyhow::Result<Self> {
        let api_key = config.require_api_key()?.clone();
        let timeout = if config.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.request_timeout_secs))
        };
        Ok(Self::new(config.api_url.clone(), api_key, timeout)?)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl Generator for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerateError> {
        let body = ChatRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
        };

        debug!(
            model = %request.model,
            url = %self.url,
            bytes = request.user.len(),
            "sending generation request"
        );
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .map_err(|e| GenerateError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .map_err(|e| GenerateError::RequestFailed(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = raw.chars().take(200).collect();
            warn!(status = %status, "generation backend rejected request");
            return Err(GenerateError::RequestFailed(format!(
                "backend returned {status}: {snippet}"
            )));
        }

        parse_completion(&raw)
    }
}

/// Extracts the first choice's content from a chat-completions body.
pub fn parse_completion(raw: &str) -> Result<String, GenerateError> {
    let parsed: ChatResponse = serde_json::from_str(raw)
        .map_err(|e| GenerateError::RequestFailed(format!("invalid response body: {e}")))?;
    let first = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(GenerateError::EmptyResponse)?;
    let code = normalize_code(first.message.content.as_deref().unwrap_or_default());
    if code.is_empty() {
        return Err(GenerateError::EmptyResponse);
    }
    Ok(code)
}
