use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Extraction calls hit a third-party endpoint; bound them so a stalled
/// call can't pin a background task forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures of the extraction port. Callers log these and fall back to a
/// no-op; nothing here is surfaced to the end user.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extraction endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed extraction response: {0}")]
    Malformed(String),
}

/// Chat-completion extraction port. Turns a raw text sample into a
/// completion that is expected (but not guaranteed) to contain JSON.
#[async_trait]
pub trait CompletionPort: Send + Sync {
    /// Send one system+user exchange and return the completion text.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, ExtractError>;
}

/// reqwest-backed port speaking the `{model, messages, temperature,
/// max_tokens}` chat-completion wire format with bearer auth.
pub struct HttpCompletion {
    client: Client,
    url: String,
    model: String,
    api_key: String,
}

impl HttpCompletion {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CompletionPort for HttpCompletion {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, ExtractError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.3,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExtractError::Status(response.status()));
        }

        let data: Value = response.json().await?;
        let content = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ExtractError::Malformed("missing choices[0].message.content".into()))?;

        Ok(content.trim().to_string())
    }
}

/// Find the first `[...]` span in a completion. Models routinely wrap the
/// requested JSON in prose, so parsing works on the salvaged span.
pub fn salvage_json_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

/// Parse a completion into a JSON array, salvaging the `[...]` span first.
pub fn parse_array(content: &str) -> Result<Vec<Value>, ExtractError> {
    let raw = salvage_json_array(content).unwrap_or(content);
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ExtractError::Malformed(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(ExtractError::Malformed("expected a JSON array".into())),
    }
}
