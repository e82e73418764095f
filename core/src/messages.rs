//! Message retrieval for one thread.
//!
//! The typed API is tried first. When it chokes on media it cannot model,
//! the thread is walked page by page through the raw endpoint, repairing
//! and parsing each item on its own so one bad record costs one message.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, UpstreamError};
use crate::extract::extract_message;
use crate::models::{Message, Thread};
use crate::rate_limiter::RateLimiter;
use crate::sanitizer::clean_item;
use crate::schema::{is_schema_error, FetchScope};
use crate::upstream::{thread_endpoint, InstagramApi};

pub const DEFAULT_BATCH_SIZE: usize = 20;
const MIN_BATCH_SIZE: usize = 5;
const PROBE_SIZE: usize = 10;
/// Consecutive empty or failed batches tolerated before the walk gives up.
pub const DEFAULT_MAX_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTier {
    Typed,
    SafeBatch,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub messages: Vec<Message>,
    pub tier: MessageTier,
    /// Raw items dropped by the safe batch walk.
    pub skipped: usize,
}

pub struct MessageRetriever<'a, A: InstagramApi + ?Sized> {
    api: &'a A,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    max_failures: usize,
}

impl<'a, A: InstagramApi + ?Sized> MessageRetriever<'a, A> {
    pub fn new(api: &'a A, limiter: Arc<RateLimiter>) -> Self {
        Self {
            api,
            limiter,
            batch_size: DEFAULT_BATCH_SIZE,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Up to `count` messages of `thread`, in no particular order.
    pub fn fetch_messages(&self, thread: &Thread, count: usize) -> Result<Vec<Message>, CoreError> {
        self.fetch_messages_with_report(&thread.id, count)
            .map(|report| report.messages)
    }

    pub fn fetch_messages_with_report(&self, thread_id: &str, count: usize) -> Result<FetchReport, CoreError> {
        if count == 0 {
            return Ok(typed_report(Vec::new()));
        }
        match self.typed_fetch(thread_id, count) {
            Ok(None) => {
                warn!(thread_id, "test fetch returned nothing");
                Err(CoreError::MessageFetch("no messages returned from test fetch".to_string()))
            }
            Ok(Some(messages)) => {
                info!(thread_id, count = messages.len(), "fetched messages");
                Ok(typed_report(messages))
            }
            Err(err) if is_schema_error(&err, FetchScope::Messages) => {
                warn!(thread_id, error = %err, "problematic media, switching to safe batches");
                let (messages, skipped) = self.safe_batch(thread_id, count);
                if messages.is_empty() {
                    warn!(thread_id, "no messages could be retrieved");
                } else {
                    info!(thread_id, count = messages.len(), skipped, "fetched messages using safe batches");
                }
                Ok(FetchReport {
                    messages,
                    tier: MessageTier::SafeBatch,
                    skipped,
                })
            }
            Err(err) => {
                error!(thread_id, error = %err, "failed to fetch messages");
                Err(CoreError::MessageFetch(format!("failed to fetch messages: {err}")))
            }
        }
    }

    /// `None` when the small test call comes back empty.
    fn typed_fetch(&self, thread_id: &str, count: usize) -> Result<Option<Vec<Message>>, UpstreamError> {
        let probe = self
            .limiter
            .call(|| self.api.direct_messages(thread_id, count.min(PROBE_SIZE)))?;
        if probe.is_empty() {
            return Ok(None);
        }
        if count <= PROBE_SIZE {
            return Ok(Some(probe));
        }
        self.limiter
            .call(|| self.api.direct_messages(thread_id, count))
            .map(Some)
    }

    /// Walks the raw thread endpoint. Never fails; returns at most `count` messages and the
    /// number of raw items that had to be dropped.
    pub fn safe_batch(&self, thread_id: &str, count: usize) -> (Vec<Message>, usize) {
        let endpoint = thread_endpoint(thread_id);
        let mut messages: Vec<Message> = Vec::with_capacity(count.min(1000));
        let mut skipped = 0usize;
        let mut cursor: Option<String> = None;
        let mut batch_size = self.batch_size;
        let mut consecutive_failures = 0usize;

        while messages.len() < count && consecutive_failures < self.max_failures {
            let remaining = count - messages.len();
            let mut params = vec![("limit", batch_size.min(remaining).to_string())];
            if let Some(cursor) = &cursor {
                params.push(("cursor", cursor.clone()));
            }

            let response = match self.limiter.call(|| self.api.private_request(&endpoint, &params)) {
                Ok(response) => response,
                Err(err) => {
                    consecutive_failures += 1;
                    batch_size = shrink(batch_size);
                    debug!(thread_id, error = %err, consecutive_failures, "batch request failed");
                    continue;
                }
            };
            let Some(thread) = response.get("thread") else {
                break;
            };
            let items = match thread.get("items").and_then(Value::as_array) {
                Some(items) if !items.is_empty() => items,
                _ => break,
            };

            let exhausted = thread.get("has_older").and_then(Value::as_bool) == Some(false);

            let mut batch = Vec::with_capacity(items.len());
            for item in items {
                match clean_item(item).map(|cleaned| extract_message(&cleaned)) {
                    Some(Ok(message)) => batch.push(message),
                    Some(Err(err)) => {
                        skipped += 1;
                        debug!(thread_id, error = %err, "skipped problematic message");
                    }
                    None => skipped += 1,
                }
            }

            if batch.is_empty() {
                if exhausted {
                    debug!(thread_id, "last page held no usable messages");
                    break;
                }
                consecutive_failures += 1;
                batch_size = shrink(batch_size);
                debug!(thread_id, batch_size, consecutive_failures, "batch yielded no usable messages");
                continue;
            }

            debug!(thread_id, count = batch.len(), "fetched batch");
            batch.truncate(remaining);
            messages.extend(batch);
            cursor = items.last().and_then(item_id);
            consecutive_failures = 0;

            if exhausted {
                break;
            }
        }

        info!(thread_id, count = messages.len(), skipped, "safe batch walk finished");
        (messages, skipped)
    }
}

fn typed_report(messages: Vec<Message>) -> FetchReport {
    FetchReport {
        messages,
        tier: MessageTier::Typed,
        skipped: 0,
    }
}

fn shrink(batch_size: usize) -> usize {
    if batch_size > MIN_BATCH_SIZE {
        (batch_size / 2).max(MIN_BATCH_SIZE)
    } else {
        batch_size
    }
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("item_id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Oldest first. Retrievers make no ordering promise, so callers sort before display or export.
pub fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.timestamp);
}
