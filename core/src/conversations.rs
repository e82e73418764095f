//! Thread listing with tiered fallback.
//!
//! Tiers: typed call with a 5-message preview, then 1, then 0, then the raw
//! inbox endpoint run through the sanitizer. Only media-schema failures move
//! to the next tier.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, UpstreamError};
use crate::extract::extract_thread;
use crate::models::Thread;
use crate::rate_limiter::RateLimiter;
use crate::sanitizer::sanitize_thread;
use crate::schema::{is_schema_error, FetchScope};
use crate::upstream::{InstagramApi, INBOX_ENDPOINT};

pub const DEFAULT_PREVIEW_LIMIT: usize = 5;
const DEGRADED_PREVIEW_LIMITS: [usize; 2] = [1, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationTier {
    Preview(usize),
    RawInbox,
}

#[derive(Debug, Clone)]
pub struct ConversationListing {
    pub threads: Vec<Thread>,
    pub tier: ConversationTier,
    /// Raw threads dropped because they failed to parse after repair.
    pub skipped: usize,
}

pub struct ConversationRetriever<'a, A: InstagramApi + ?Sized> {
    api: &'a A,
    limiter: Arc<RateLimiter>,
    preview_limit: usize,
}

impl<'a, A: InstagramApi + ?Sized> ConversationRetriever<'a, A> {
    pub fn new(api: &'a A, limiter: Arc<RateLimiter>) -> Self {
        Self {
            api,
            limiter,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }

    pub fn with_preview_limit(mut self, preview_limit: usize) -> Self {
        self.preview_limit = preview_limit;
        self
    }

    pub fn list_conversations(&self) -> Result<Vec<Thread>, CoreError> {
        self.list_conversations_with_report().map(|listing| listing.threads)
    }

    pub fn list_conversations_with_report(&self) -> Result<ConversationListing, CoreError> {
        let first = match self.typed(self.preview_limit) {
            Ok(threads) => {
                info!(count = threads.len(), "fetched conversations");
                return Ok(listing(threads, ConversationTier::Preview(self.preview_limit), 0));
            }
            Err(err) => err,
        };
        if !is_schema_error(&first, FetchScope::Conversations) {
            error!(error = %first, "failed to fetch conversations");
            return Err(CoreError::Conversation(format!("failed to fetch conversations: {first}")));
        }
        warn!(error = %first, "problematic media in conversations, degrading preview");

        for limit in DEGRADED_PREVIEW_LIMITS {
            match self.typed(limit) {
                Ok(threads) => {
                    info!(count = threads.len(), preview = limit, "fetched conversations with reduced preview");
                    return Ok(listing(threads, ConversationTier::Preview(limit), 0));
                }
                Err(err) if is_schema_error(&err, FetchScope::Conversations) => {
                    debug!(preview = limit, error = %err, "reduced preview still failing");
                }
                Err(err) => {
                    error!(preview = limit, error = %err, "unexpected failure while degrading");
                    return Err(CoreError::Conversation(format!("failed to fetch conversations: {err}")));
                }
            }
        }

        self.raw_inbox().map_err(|err| {
            error!(error = %err, "all conversation fetching methods failed");
            err
        })
    }

    fn typed(&self, limit: usize) -> Result<Vec<Thread>, UpstreamError> {
        self.limiter.call(|| self.api.direct_threads(limit))
    }

    fn raw_inbox(&self) -> Result<ConversationListing, CoreError> {
        let params = [("visual_message_return_type", "unseen".to_string())];
        let response = self
            .limiter
            .call(|| self.api.private_request(INBOX_ENDPOINT, &params))
            .map_err(|err| CoreError::Conversation(format!("raw inbox request failed: {err}")))?;
        let inbox = response
            .get("inbox")
            .ok_or_else(|| CoreError::Conversation("invalid inbox response".to_string()))?;
        let raw_threads: &[Value] = inbox
            .get("threads")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        info!(count = raw_threads.len(), "processing raw inbox threads");

        let mut threads = Vec::with_capacity(raw_threads.len());
        let mut skipped = 0usize;
        for (idx, raw) in raw_threads.iter().enumerate() {
            let parsed = sanitize_thread(raw)
                .map_err(|e| e.to_string())
                .and_then(|cleaned| extract_thread(&cleaned).map_err(|e| e.to_string()));
            match parsed {
                Ok(thread) => threads.push(thread),
                Err(reason) => {
                    skipped += 1;
                    debug!(index = idx, %reason, "skipped thread");
                }
            }
        }
        if threads.is_empty() {
            return Err(CoreError::Conversation("no conversations could be processed".to_string()));
        }
        // Stable: threads without an activity marker keep their inbox position at the end.
        threads.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        info!(parsed = threads.len(), skipped, "processed raw inbox");
        Ok(listing(threads, ConversationTier::RawInbox, skipped))
    }
}

fn listing(threads: Vec<Thread>, tier: ConversationTier, skipped: usize) -> ConversationListing {
    ConversationListing {
        threads,
        tier,
        skipped,
    }
}

/// Threads with a participant whose username contains `query`, case-insensitively.
pub fn find_conversations<'t>(threads: &'t [Thread], query: &str) -> Vec<&'t Thread> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    threads
        .iter()
        .filter(|thread| {
            thread
                .users
                .iter()
                .any(|user| user.username.to_lowercase().contains(&needle))
        })
        .collect()
}
