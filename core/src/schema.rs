//! Decides whether an upstream failure is a media-schema problem worth
//! degrading around, or something to propagate.
//!
//! Structured [`UpstreamErrorKind`] values win. The keyword lists only apply
//! to `Unclassified` errors from collaborators that cannot report a kind.

use crate::error::{UpstreamError, UpstreamErrorKind};

const CONVERSATION_MARKERS: &[&str] = &[
    "clips_metadata",
    "original_sound_info",
    "validationerror",
    "model_type",
    "input should be a valid dictionary",
];

const MESSAGE_ONLY_MARKERS: &[&str] = &[
    "validation errors",
    "replymessage",
    "timestamp_us",
    "unexpected keyword argument",
];

const TWO_FACTOR_MARKERS: &[&str] = &["two-factor authentication", "2fa"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    Conversations,
    Messages,
}

impl FetchScope {
    fn matches(&self, lowered: &str) -> bool {
        let base = CONVERSATION_MARKERS.iter().any(|k| lowered.contains(k));
        match self {
            FetchScope::Conversations => base,
            FetchScope::Messages => base || MESSAGE_ONLY_MARKERS.iter().any(|k| lowered.contains(k)),
        }
    }
}

pub fn is_schema_error(err: &UpstreamError, scope: FetchScope) -> bool {
    match err.kind {
        UpstreamErrorKind::SchemaIncompatible => true,
        UpstreamErrorKind::Unclassified => scope.matches(&err.message.to_lowercase()),
        _ => false,
    }
}

pub fn is_two_factor(err: &UpstreamError) -> bool {
    match err.kind {
        UpstreamErrorKind::TwoFactorRequired => true,
        UpstreamErrorKind::Unclassified => {
            let lowered = err.message.to_lowercase();
            TWO_FACTOR_MARKERS.iter().any(|k| lowered.contains(k))
        }
        _ => false,
    }
}
