//! Request client errors.
//!
//! Transport failures and backend-reported failures are kept apart so callers
//! can tell "could not reach the service" from "the service said no". Neither
//! is ever folded into task state.

use std::fmt;

use thiserror::Error;

/// `error_code` the backend uses when its upstream login cookie is no longer valid.
pub const COOKIE_EXPIRED: &str = "COOKIE_EXPIRED";

/// What kind of transport failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connect => write!(f, "connection failed"),
            Self::Other => write!(f, "request failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{endpoint}: {kind}: {message}")]
    Transport {
        endpoint: String,
        kind: TransportKind,
        message: String,
    },

    #[error("{endpoint} failed ({status}): {message}")]
    Backend {
        endpoint: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Credentials expired, re-login required: {message}")]
    CredentialsExpired { message: String },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Setup(String),
}

impl ApiError {
    pub(crate) fn transport(endpoint: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportKind::Timeout
        } else if err.is_connect() {
            TransportKind::Connect
        } else {
            TransportKind::Other
        };
        Self::Transport {
            endpoint: endpoint.to_string(),
            kind,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// True when the backend could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_credentials_expired(&self) -> bool {
        matches!(self, Self::CredentialsExpired { .. })
    }

    /// Backend `error_code`, if the backend sent one.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } => code.as_deref(),
            Self::CredentialsExpired { .. } => Some(COOKIE_EXPIRED),
            _ => None,
        }
    }

    /// HTTP status of a backend rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Receives the credentials-expired signal so the UI layer can start a
/// re-login flow.
pub trait ReauthHook: Send + Sync {
    fn credentials_expired(&self, message: &str);
}

impl<F> ReauthHook for F
where
    F: Fn(&str) + Send + Sync,
{
    fn credentials_expired(&self, message: &str) {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_accessors() {
        let err = ApiError::Backend {
            endpoint: "/tasks/x".to_string(),
            status: 404,
            code: None,
            message: "not found".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert!(err.error_code().is_none());
        assert!(!err.is_transport());

        let expired = ApiError::CredentialsExpired {
            message: "cookie".to_string(),
        };
        assert_eq!(expired.error_code(), Some(COOKIE_EXPIRED));
        assert!(expired.is_credentials_expired());
    }

    #[test]
    fn test_display() {
        let err = ApiError::Transport {
            endpoint: "/health".to_string(),
            kind: TransportKind::Timeout,
            message: "30s elapsed".to_string(),
        };
        assert_eq!(err.to_string(), "/health: timeout: 30s elapsed");
    }
}
