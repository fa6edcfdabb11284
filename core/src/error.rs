//! Structured error types for Vigil
//!
//! Every failure the kernel can surface is a typed variant with a stable
//! numeric code so callers can dispatch programmatically. Retryability is a
//! property of the variant, not of the call site.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for Vigil operations
#[derive(Error, Debug)]
pub enum VigilError {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Malformed input; never retried
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Unknown incident id, subscriber id or sequence
    #[error("not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// Optimistic concurrency clash in the event store
    #[error("sequence conflict for incident {incident_id}: expected {expected}, store at {actual}")]
    Conflict {
        incident_id: String,
        expected: u64,
        actual: u64,
    },

    /// Dependency fenced by its circuit breaker
    #[error("circuit open for dependency: {dependency}")]
    CircuitOpen { dependency: String },

    /// Provider rate limit or local limiter rejection
    #[error("throttled: {key}")]
    Throttled {
        key: String,
        retry_after: Option<Duration>,
    },

    /// Local deadline expired
    #[error("timeout: {operation} after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Policy / Budget Errors
    // =========================================================================
    /// Guardrail refused the output; never retried
    #[error("guardrail block: {reason}")]
    GuardrailBlock { reason: String },

    /// Provider monthly spend cap hit
    #[error("budget exceeded for provider {provider}: spent {spent_micros} of {cap_micros} microdollars")]
    BudgetExceeded {
        provider: String,
        spent_micros: u64,
        cap_micros: u64,
    },

    // =========================================================================
    // Provider / Transport Errors
    // =========================================================================
    /// Provider returned an error status
    #[error("provider error: {status} - {message}")]
    Provider { status: u16, message: String },

    /// Network-level failure talking to a provider or peer
    #[error("transport error: {message}")]
    Transport { message: String },

    // =========================================================================
    // Integrity / Internal Errors
    // =========================================================================
    /// Stored event hash mismatch; the incident is halted for human attention
    #[error("event corruption for incident {incident_id} at sequence {sequence}")]
    Corruption { incident_id: String, sequence: u64 },

    /// Bug; logged with full context, surfaced as a generic failure
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VigilError {
    /// Stable numeric code for programmatic dispatch across the wire.
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 100,
            Self::NotFound { .. } => 101,
            Self::Conflict { .. } => 200,
            Self::CircuitOpen { .. } => 201,
            Self::Throttled { .. } => 202,
            Self::Timeout { .. } => 203,
            Self::Cancelled => 204,
            Self::GuardrailBlock { .. } => 300,
            Self::BudgetExceeded { .. } => 301,
            Self::Provider { .. } => 400,
            Self::Transport { .. } => 401,
            Self::Corruption { .. } => 500,
            Self::Internal { .. } => 501,
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Provider 5xx and 429 are retryable; 4xx other than 429 are not.
    /// Guardrail blocks, budget caps, validation and corruption never retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Throttled { .. } | Self::Timeout { .. } => true,
            Self::Transport { .. } => true,
            Self::Provider { status, .. } => *status == 429 || *status >= 500,
            Self::CircuitOpen { .. } => false,
            Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::Cancelled
            | Self::GuardrailBlock { .. }
            | Self::BudgetExceeded { .. }
            | Self::Corruption { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Short stable name for the category, used in logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Throttled { .. } => "throttled",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::GuardrailBlock { .. } => "guardrail_block",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Provider { .. } => "provider",
            Self::Transport { .. } => "transport",
            Self::Corruption { .. } => "corruption",
            Self::Internal { .. } => "internal",
        }
    }

    /// Convenience constructor for internal invariant breaks.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            message: format!("malformed json: {}", err),
        }
    }
}

/// Result alias used throughout the kernel
pub type VigilResult<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(VigilError::validation("x").code(), 100);
        assert_eq!(
            VigilError::Conflict {
                incident_id: "inc-1".into(),
                expected: 3,
                actual: 4
            }
            .code(),
            200
        );
        assert_eq!(
            VigilError::Corruption {
                incident_id: "inc-1".into(),
                sequence: 0
            }
            .code(),
            500
        );
    }

    #[test]
    fn provider_retryability_follows_status() {
        let throttled = VigilError::Provider {
            status: 429,
            message: "slow down".into(),
        };
        let server = VigilError::Provider {
            status: 503,
            message: "unavailable".into(),
        };
        let bad_request = VigilError::Provider {
            status: 400,
            message: "bad body".into(),
        };
        assert!(throttled.is_retryable());
        assert!(server.is_retryable());
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn policy_errors_never_retry() {
        assert!(!VigilError::GuardrailBlock {
            reason: "region".into()
        }
        .is_retryable());
        assert!(!VigilError::BudgetExceeded {
            provider: "p".into(),
            spent_micros: 10,
            cap_micros: 5
        }
        .is_retryable());
        assert!(!VigilError::Cancelled.is_retryable());
    }
}
