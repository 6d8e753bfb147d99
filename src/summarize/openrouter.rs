//! OpenAI-compatible chat-completions backend (OpenRouter by default).

use super::{BackendError, SummaryBackend};
use crate::action::ActionName;
use crate::config::SummarizerConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

pub struct ChatCompletionsBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl ChatCompletionsBackend {
    /// Build from configuration. The key is resolved once here; a missing key
    /// is not an error until the first call, which then reports the incident
    /// as unavailable and falls back.
    pub fn from_config(cfg: &SummarizerConfig) -> Result<Self, BackendError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .map(|raw| normalize_key(&raw))
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(var = %cfg.api_key_env, "no summarizer API key set, every incident will use the fallback rules");
        }
        Self::new(&cfg.endpoint, &cfg.model, api_key, &cfg.api_key_env, cfg.timeout())
    }

    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        api_key_env: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
            api_key_env: api_key_env.to_string(),
        })
    }
}

/// Strip whitespace and stray CR/LF so the key is sent exactly.
pub fn normalize_key(raw: &str) -> String {
    raw.replace(['\r', '\n'], "").trim().to_string()
}

pub fn system_prompt() -> String {
    let actions: Vec<&str> = ActionName::ALL.iter().map(|a| a.as_str()).collect();
    format!(
        "You are a concise, world-class DevOps SRE. Analyze the provided log trace. \
         Your response MUST be a single JSON object with exactly two string fields, \
         \"summary\" and \"action\". Choose \"action\" ONLY from the list: [{}]. \
         DO NOT include any text outside the JSON object.",
        actions.join(", ")
    )
}

pub fn user_prompt(context: &str) -> String {
    format!(
        "Analyze the following critical system log trace. This log shows an anomaly:\n\
         --- LOG TRACE START ---\n{context}\n--- LOG TRACE END ---\n\n\
         1. SUMMARY: Provide a single sentence, high-level summary of the root cause.\n\
         2. ACTION: Select the best action for immediate remediation."
    )
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Pull `choices[0].message.content` out of a chat-completions body.
pub fn extract_content(body: &str) -> Result<String, BackendError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| BackendError::Envelope(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Envelope("no message content in choices".to_string()))
}

#[async_trait::async_trait]
impl SummaryBackend for ChatCompletionsBackend {
    async fn complete(&self, context: &str) -> Result<String, BackendError> {
        let Some(key) = &self.api_key else {
            return Err(BackendError::MissingCredentials {
                var: self.api_key_env.clone(),
            });
        };

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt()},
                {"role": "user", "content": user_prompt(context)},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.0,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| "no detail provided".to_string());
            return Err(BackendError::Status {
                code: status.as_u16(),
                detail,
            });
        }

        extract_content(&body)
    }
}
