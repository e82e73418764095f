use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("two-factor authentication required")]
    TwoFactorRequired,
    #[error("conversation error: {0}")]
    Conversation(String),
    #[error("message fetch failed: {0}")]
    MessageFetch(String),
    #[error("media validation failed: {0}")]
    MediaValidation(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("export error: {0}")]
    Export(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a failure reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Payload did not match the typed schema (broken clip metadata, overflowing timestamps).
    SchemaIncompatible,
    TwoFactorRequired,
    /// Session rejected by the server; a fresh login is needed.
    LoginRequired,
    Transient,
    Fatal,
    /// The collaborator could not tell; callers fall back to message keyword matching.
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Unclassified, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::SchemaIncompatible, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Transient, message)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UpstreamError {}
