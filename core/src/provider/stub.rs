//! Stub provider transport
//!
//! Returns a canned response body for every invocation. Used for local
//! development and demos where no model credentials exist, and as the
//! backing for smoke configurations: the pipeline runs end to end with a
//! fixed confidence instead of a real model call.

use super::{ProviderRequest, ProviderResponse, ProviderTransport, ProviderUsage};
use crate::error::VigilResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub struct StubProviderTransport {
    body: serde_json::Value,
}

impl StubProviderTransport {
    pub fn new(body: serde_json::Value) -> Self {
        Self { body }
    }

    /// A reasonable default for smoke configs: mid-confidence, no action.
    pub fn default_body() -> serde_json::Value {
        serde_json::json!({
            "confidence": 0.9,
            "proposal": {
                "summary": "stubbed analysis",
                "action": {"kind": "noop"}
            }
        })
    }
}

impl Default for StubProviderTransport {
    fn default() -> Self {
        Self::new(Self::default_body())
    }
}

#[async_trait]
impl ProviderTransport for StubProviderTransport {
    async fn invoke(
        &self,
        request: &ProviderRequest,
        _cancel: &CancellationToken,
    ) -> VigilResult<(ProviderResponse, Option<ProviderUsage>)> {
        // Rough token accounting so metrics stay non-trivial in demos
        let tokens_in = (serde_json::to_string(&request.body)
            .map(|s| s.len())
            .unwrap_or(0)
            / 4) as u64;
        Ok((
            ProviderResponse {
                body: self.body.clone(),
            },
            Some(ProviderUsage {
                tokens_in,
                tokens_out: 32,
                ..ProviderUsage::default()
            }),
        ))
    }
}
