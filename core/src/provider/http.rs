//! HTTP provider transport
//!
//! Talks to an OpenAI-compatible chat-completions endpoint. Status codes map
//! onto the typed taxonomy: 429 becomes Throttled with the Retry-After value,
//! 5xx a retryable Provider error, other 4xx a non-retryable Provider error.

use super::{ProviderRequest, ProviderResponse, ProviderTransport, ProviderUsage};
use crate::error::{VigilError, VigilResult};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client as HttpClient, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Transport configuration for one HTTP provider
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token; None for unauthenticated local endpoints
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

pub struct HttpProviderTransport {
    config: HttpProviderConfig,
    client: HttpClient,
}

impl HttpProviderTransport {
    pub fn new(config: HttpProviderConfig) -> VigilResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VigilError::Transport {
                message: format!("failed to build http client: {}", e),
            })?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ProviderTransport for HttpProviderTransport {
    async fn invoke(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> VigilResult<(ProviderResponse, Option<ProviderUsage>)> {
        let mut body = request.body.clone();
        if let Some(map) = body.as_object_mut() {
            map.entry("model")
                .or_insert(serde_json::Value::String(self.config.model.clone()));
        }

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = tokio::select! {
            res = req.send() => res.map_err(map_reqwest_error)?,
            _ = cancel.cancelled() => return Err(VigilError::Cancelled),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(VigilError::Throttled {
                key: self.config.base_url.clone(),
                retry_after,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VigilError::Provider {
                status: status.as_u16(),
                message: truncate(&message, 500),
            });
        }

        let body: serde_json::Value = tokio::select! {
            res = response.json() => res.map_err(map_reqwest_error)?,
            _ = cancel.cancelled() => return Err(VigilError::Cancelled),
        };
        let usage = parse_usage(&body);
        Ok((ProviderResponse { body }, usage))
    }
}

/// Pulls OpenAI-style usage counters out of a response body if present.
pub fn parse_usage(body: &serde_json::Value) -> Option<ProviderUsage> {
    let usage = body.get("usage")?;
    Some(ProviderUsage {
        tokens_in: usage.get("prompt_tokens").and_then(|v| v.as_u64())?,
        tokens_out: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        latency_ms: 0,
        cost_micros: 0,
    })
}

fn map_reqwest_error(err: reqwest::Error) -> VigilError {
    if err.is_timeout() {
        VigilError::Timeout {
            operation: "provider http call".into(),
            elapsed: Duration::ZERO,
        }
    } else {
        VigilError::Transport {
            message: err.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_parses_openai_shape() {
        let body = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 120, "completion_tokens": 48}
        });
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.tokens_in, 120);
        assert_eq!(usage.tokens_out, 48);
    }

    #[test]
    fn missing_usage_is_none() {
        assert!(parse_usage(&serde_json::json!({"choices": []})).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.starts_with('h'));
        assert!(t.ends_with("..."));
    }
}
