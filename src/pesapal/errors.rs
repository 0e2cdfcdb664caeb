// Pesapal-specific error types and mappings

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Pesapal error envelope: { error: { error_type, code, message }, status }
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PesapalErrorBody {
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PesapalErrorBody {
    /// Pesapal sends `"error": {}` or all-null fields on success; only a code or
    /// message counts as an error.
    pub fn is_present(&self) -> bool {
        self.code.as_deref().is_some_and(|c| !c.is_empty())
            || self.message.as_deref().is_some_and(|m| !m.is_empty())
    }

    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown pesapal error".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: &'static str },
    #[error("http error calling {endpoint}: {message}")]
    Http {
        endpoint: &'static str,
        message: String,
    },
    #[error("pesapal error: {message} status={status:?}")]
    Api {
        message: String,
        raw_response: String,
        status: Option<u16>,
    },
    #[error("unexpected gateway response: {0}")]
    SchemaMismatch(String),
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
}

impl GatewayError {
    /// Whether repeating the same request may succeed. Only timeouts,
    /// transport failures and 5xx answers qualify; an error body without an
    /// HTTP status is a definite rejection.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout { .. } | GatewayError::Http { .. } => true,
            GatewayError::Api { status, .. } => status.map_or(false, |s| (500..600).contains(&s)),
            GatewayError::SchemaMismatch(_) | GatewayError::Precondition(_) => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, GatewayError::Api { status: Some(401), .. })
    }
}
