//! LLM chat client
//!
//! A single OpenAI-compatible `/chat/completions` caller that covers
//! DeepSeek, Qwen (DashScope compatible mode) and any custom endpoint. The
//! model answers with a chain-of-thought prefix followed by a JSON decision
//! array; this layer only transports text.
//!
//! Calls run under a long timeout (models chew through large prompts) and
//! retry up to three times, but only on network-class failures; a venue
//! rejection or auth error surfaces immediately.

use crate::logger::{self, LogTag};
use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 3;
const TEMPERATURE: f64 = 0.5;
const MAX_TOKENS: u32 = 4000;

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    DeepSeek,
    Qwen,
    Custom,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::DeepSeek => "deepseek",
            Provider::Qwen => "qwen",
            Provider::Custom => "custom",
        }
    }
}

/// Chat transport configuration for one trader
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    base_url: String,
    model: String,
    /// When true the base URL is the full endpoint (no /chat/completions)
    use_full_url: bool,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn deepseek(api_key: &str) -> Result<Self> {
        Self::build(
            Provider::DeepSeek,
            api_key,
            "https://api.deepseek.com/v1",
            "deepseek-chat",
            false,
        )
    }

    pub fn qwen(api_key: &str) -> Result<Self> {
        Self::build(
            Provider::Qwen,
            api_key,
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "qwen-plus",
            false,
        )
    }

    /// Custom OpenAI-compatible endpoint. A trailing `#` on the URL means
    /// "use as-is, do not append /chat/completions".
    pub fn custom(api_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let (url, use_full_url) = match api_url.strip_suffix('#') {
            Some(stripped) => (stripped, true),
            None => (api_url, false),
        };
        Self::build(Provider::Custom, api_key, url, model, use_full_url)
    }

    fn build(
        provider: Provider,
        api_key: &str,
        base_url: &str,
        model: &str,
        use_full_url: bool,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            bail!("{} API key must not be empty", provider.as_str());
        }

        Ok(Self {
            provider,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            use_full_url,
            http: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .map_err(|e| anyhow!("failed to build llm http client: {}", e))?,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Call the model with a system + user prompt pair, returning raw text.
    ///
    /// Retries on network-class failures with a linear backoff; anything
    /// else is returned to the caller on the first attempt.
    pub async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let mut last_err = anyhow!("no attempts made");

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                logger::warning(
                    LogTag::Ai,
                    &format!("LLM call failed, retrying ({}/{})", attempt, MAX_ATTEMPTS),
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64 * 2)).await;
            }

            match self.call_once(system_prompt, user_prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if !is_retryable_error(&e.to_string()) {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }

        Err(anyhow!(
            "LLM call failed after {} attempts: {}",
            MAX_ATTEMPTS,
            last_err
        ))
    }

    async fn call_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_prompt}));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let url = if self.use_full_url {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        };

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("LLM request timeout after {:?}: {}", started.elapsed(), e)
                } else {
                    anyhow!("LLM request failed: {}", e)
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow!("failed to read LLM response body: {}", e))?;
        if text.is_empty() {
            bail!("empty body from LLM API (status {})", status);
        }

        parse_chat_response(&text, status.as_u16())
    }
}

/// Extract the assistant message from an OpenAI-style response payload
fn parse_chat_response(body: &str, status: u16) -> Result<String> {
    #[derive(Deserialize, Default)]
    struct ApiError {
        #[serde(default)]
        message: String,
        #[serde(default, rename = "type")]
        kind: String,
    }

    #[derive(Deserialize)]
    struct Message {
        #[serde(default)]
        content: String,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
        #[serde(default)]
        finish_reason: Option<String>,
    }

    #[derive(Deserialize, Default)]
    struct Usage {
        #[serde(default)]
        prompt_tokens: u32,
        #[serde(default)]
        completion_tokens: u32,
    }

    #[derive(Deserialize)]
    struct ChatResponse {
        #[serde(default)]
        choices: Vec<Choice>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        error: Option<ApiError>,
    }

    if status != 200 {
        let parsed: std::result::Result<ChatResponse, _> = serde_json::from_str(body);
        if let Ok(response) = parsed {
            if let Some(error) = response.error {
                bail!(
                    "LLM API error (status {}): {} (type: {})",
                    status,
                    error.message,
                    error.kind
                );
            }
        }
        bail!("LLM API error (status {}): {:.300}", status, body);
    }

    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| anyhow!("LLM response parse failed: {} (body: {:.300})", e, body))?;

    if let Some(error) = response.error {
        if !error.message.is_empty() {
            bail!("LLM API error: {} (type: {})", error.message, error.kind);
        }
    }

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("LLM returned no choices (body: {:.300})", body))?;

    if choice.finish_reason.as_deref() == Some("length") {
        logger::warning(
            LogTag::Ai,
            "LLM response may be truncated (finish_reason: length)",
        );
    }
    if let Some(usage) = response.usage {
        logger::debug(
            LogTag::Ai,
            &format!(
                "token usage: prompt={}, completion={}",
                usage.prompt_tokens, usage.completion_tokens
            ),
        );
    }

    if choice.message.content.is_empty() {
        bail!("empty body from LLM API (no content)");
    }
    Ok(choice.message.content)
}

/// Network-class errors are worth a retry; everything else is not
fn is_retryable_error(message: &str) -> bool {
    const RETRYABLE: [&str; 7] = [
        "EOF",
        "timeout",
        "deadline",
        "reset",
        "refused",
        "empty body",
        "request failed",
    ];
    RETRYABLE.iter().any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_error("LLM request timeout after 300s"));
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("connection refused"));
        assert!(is_retryable_error("empty body from LLM API (status 200)"));
        assert!(!is_retryable_error("LLM API error: invalid api key (type: auth)"));
    }

    #[test]
    fn test_custom_url_full_marker() {
        let client = LlmClient::custom("https://example.com/v1/custom#", "key", "m").unwrap();
        assert!(client.use_full_url);
        assert_eq!(client.base_url, "https://example.com/v1/custom");

        let client = LlmClient::custom("https://example.com/v1", "key", "m").unwrap();
        assert!(!client.use_full_url);
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(LlmClient::deepseek("").is_err());
        assert!(LlmClient::qwen("  ").is_err());
    }

    #[test]
    fn test_parse_chat_response_content() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "analysis...\n[]"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
        .to_string();
        assert_eq!(parse_chat_response(&body, 200).unwrap(), "analysis...\n[]");
    }

    #[test]
    fn test_parse_chat_response_api_error() {
        let body = serde_json::json!({
            "error": {"message": "invalid api key", "type": "auth"}
        })
        .to_string();
        let err = parse_chat_response(&body, 401).unwrap_err().to_string();
        assert!(err.contains("invalid api key"));
    }

    #[test]
    fn test_parse_chat_response_no_choices() {
        let body = serde_json::json!({"choices": []}).to_string();
        assert!(parse_chat_response(&body, 200).is_err());
    }
}
