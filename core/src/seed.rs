//! Offline demo data: raw inbox payloads shaped like the private API and an
//! in-memory [`InstagramApi`] that serves them.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{UpstreamError, UpstreamErrorKind};
use crate::extract::{extract_message, extract_thread};
use crate::models::{Message, Session, Thread};
use crate::upstream::{InstagramApi, INBOX_ENDPOINT};

pub const DEMO_BASE_TS: i64 = 1_700_000_000;
pub const DEMO_VIEWER_PK: u64 = 1;
pub const DEMO_PARTNER_PK: u64 = 2;
const MICROS: i64 = 1_000_000;
const THREAD_PREFIX: &str = "direct_v2/threads/";

pub fn text_item(item_id: &str, user_id: u64, ts: i64, text: &str) -> Value {
    json!({
        "item_id": item_id,
        "user_id": user_id,
        "timestamp": ts,
        "item_type": "text",
        "text": text,
    })
}

/// A Reels share the strict parser rejects until repaired: microsecond
/// timestamp, half-filled sound info, null music info.
pub fn broken_clip_item(item_id: &str, user_id: u64, ts: i64) -> Value {
    json!({
        "item_id": item_id,
        "user_id": user_id,
        "timestamp": (ts * MICROS).to_string(),
        "item_type": "clip",
        "clip": {
            "clip": {
                "pk": format!("{item_id}0"),
                "taken_at": ts,
                "video_versions": [{ "url": format!("https://cdn.example/clips/{item_id}.mp4") }],
                "clips_metadata": {
                    "original_sound_info": {
                        "audio_id": format!("{item_id}9"),
                        "ig_artist": { "username": "artist" }
                    },
                    "music_info": null
                }
            }
        }
    })
}

/// No sender: unusable even after repair.
pub fn corrupt_item(item_id: &str, ts: i64) -> Value {
    json!({
        "item_id": item_id,
        "timestamp": ts,
        "item_type": "text",
        "text": "lost sender",
    })
}

pub fn image_item(item_id: &str, user_id: u64, ts: i64) -> Value {
    json!({
        "item_id": item_id,
        "user_id": user_id,
        "timestamp": ts,
        "item_type": "media",
        "media": {
            "media_type": 1,
            "image_versions2": { "candidates": [{ "url": format!("https://cdn.example/img/{item_id}.jpg") }] }
        }
    })
}

#[derive(Debug, Clone)]
pub struct DemoThread {
    pub id: String,
    users: Vec<(u64, String)>,
    /// Oldest first; rendered newest first like the inbox.
    items: Vec<Value>,
}

impl DemoThread {
    pub fn new(id: impl Into<String>, users: &[(u64, &str)]) -> Self {
        Self {
            id: id.into(),
            users: users.iter().map(|(pk, name)| (*pk, name.to_string())).collect(),
            items: Vec::new(),
        }
    }

    /// Alternating "Demo message N" from the viewer and "Reply N" from the partner, one minute apart.
    pub fn conversation(id: impl Into<String>, partner: &str, count: usize) -> Self {
        let id = id.into();
        let mut thread = Self::new(id.clone(), &[(DEMO_PARTNER_PK, partner)]);
        for idx in 0..count {
            let item_id = format!("{id}:m{}", idx + 1);
            let ts = DEMO_BASE_TS + idx as i64 * 60;
            let item = if idx % 2 == 0 {
                text_item(&item_id, DEMO_VIEWER_PK, ts, &format!("Demo message {}", idx + 1))
            } else {
                text_item(&item_id, DEMO_PARTNER_PK, ts, &format!("Reply {}", idx + 1))
            };
            thread.items.push(item);
        }
        thread
    }

    /// Appends a newer item.
    pub fn push(mut self, item: Value) -> Self {
        self.items.push(item);
        self
    }

    /// Replaces every `n`th item (1-based, oldest first) with a repairable clip.
    pub fn broken_clip_every(self, n: usize) -> Self {
        self.replace_every(n, |item_id, user_id, ts| broken_clip_item(item_id, user_id, ts))
    }

    /// Replaces every `n`th item (1-based, oldest first) with an unusable one.
    pub fn corrupt_every(self, n: usize) -> Self {
        self.replace_every(n, |item_id, _, ts| corrupt_item(item_id, ts))
    }

    fn replace_every<F>(mut self, n: usize, make: F) -> Self
    where
        F: Fn(&str, u64, i64) -> Value,
    {
        if n == 0 {
            return self;
        }
        for (idx, item) in self.items.iter_mut().enumerate() {
            if (idx + 1) % n != 0 {
                continue;
            }
            let item_id = item["item_id"].as_str().unwrap_or_default().to_string();
            let user_id = item["user_id"].as_u64().unwrap_or(DEMO_PARTNER_PK);
            let ts = item["timestamp"].as_i64().unwrap_or(DEMO_BASE_TS);
            *item = make(&item_id, user_id, ts);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn newest_first(&self) -> impl Iterator<Item = &Value> {
        self.items.iter().rev()
    }

    fn last_activity_micros(&self) -> i64 {
        let newest = self
            .items
            .last()
            .and_then(|item| crate::sanitizer::epoch_value(&item["timestamp"]))
            .map(crate::sanitizer::normalize_epoch)
            .unwrap_or(DEMO_BASE_TS);
        newest * MICROS
    }

    /// Raw thread as the inbox delivers it, with at most `preview` items.
    pub fn to_value(&self, preview: usize) -> Value {
        let users: Vec<Value> = self
            .users
            .iter()
            .map(|(pk, name)| json!({ "pk": pk, "username": name, "full_name": name.to_uppercase() }))
            .collect();
        let items: Vec<Value> = self.newest_first().take(preview).cloned().collect();
        json!({
            "thread_id": self.id,
            "thread_title": self.users.first().map(|(_, n)| n.clone()).unwrap_or_default(),
            "users": users,
            "items": items,
            "last_activity_at": self.last_activity_micros(),
            "has_older": self.items.len() > preview,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DemoInbox {
    threads: Vec<DemoThread>,
}

impl DemoInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(mut self, thread: DemoThread) -> Self {
        self.threads.push(thread);
        self
    }

    pub fn threads(&self) -> &[DemoThread] {
        &self.threads
    }

    pub fn thread(&self, id: &str) -> Option<&DemoThread> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Raw `direct_v2/inbox/` response.
    pub fn inbox_response(&self) -> Value {
        let threads: Vec<Value> = self.threads.iter().map(|t| t.to_value(t.len())).collect();
        json!({
            "inbox": { "threads": threads, "has_older": false },
            "status": "ok",
        })
    }

    /// Raw `direct_v2/threads/{id}/` page of up to `limit` items older than `cursor`.
    pub fn thread_page(&self, id: &str, limit: usize, cursor: Option<&str>) -> Option<Value> {
        let thread = self.thread(id)?;
        let older: Vec<&Value> = match cursor {
            Some(cursor) => thread
                .newest_first()
                .skip_while(|item| item["item_id"].as_str() != Some(cursor))
                .skip(1)
                .collect(),
            None => thread.newest_first().collect(),
        };
        let page: Vec<Value> = older.iter().take(limit).map(|v| (*v).clone()).collect();
        let has_older = older.len() > page.len();
        let oldest_cursor = page.last().map(|item| item["item_id"].clone()).unwrap_or(Value::Null);
        Some(json!({
            "thread": {
                "thread_id": id,
                "items": page,
                "has_older": has_older,
                "oldest_cursor": oldest_cursor,
            },
            "status": "ok",
        }))
    }
}

/// Inbox with one long primary conversation and a few one-message threads.
pub fn demo_inbox(primary_count: usize, secondary_threads: usize) -> DemoInbox {
    let mut inbox = DemoInbox::new().with_thread(DemoThread::conversation("t1", "partner", primary_count));
    for idx in 0..secondary_threads {
        let id = format!("t{}", idx + 2);
        let pk = DEMO_PARTNER_PK + 1 + idx as u64;
        let ts = DEMO_BASE_TS + idx as i64 * 120;
        let name = format!("friend{}", idx + 1);
        let thread = DemoThread::new(id.clone(), &[(pk, name.as_str())])
            .push(text_item(&format!("{id}:s1"), pk, ts, &format!("Short thread {}", idx + 1)));
        inbox = inbox.with_thread(thread);
    }
    inbox
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoSettings {
    user_id: u64,
    username: String,
    token: String,
}

/// In-memory [`InstagramApi`]. Typed calls parse strictly and fail on
/// unrepaired payloads, the raw calls serve the payloads as-is.
pub struct DemoApi {
    inbox: DemoInbox,
    account: Session,
    password: String,
    two_factor_code: Option<String>,
    schema_error_kind: UpstreamErrorKind,
    token: String,
    restored: Option<DemoSettings>,
    logged_in: bool,
    thread_errors: Mutex<VecDeque<UpstreamError>>,
    message_errors: Mutex<VecDeque<UpstreamError>>,
    request_errors: Mutex<VecDeque<UpstreamError>>,
    calls: Mutex<Vec<String>>,
}

impl DemoApi {
    pub fn new(inbox: DemoInbox) -> Self {
        Self {
            inbox,
            account: Session {
                user_id: DEMO_VIEWER_PK,
                username: "demo_user".to_string(),
            },
            password: "demo-pass".to_string(),
            two_factor_code: None,
            schema_error_kind: UpstreamErrorKind::SchemaIncompatible,
            token: "token-1".to_string(),
            restored: None,
            logged_in: false,
            thread_errors: Mutex::new(VecDeque::new()),
            message_errors: Mutex::new(VecDeque::new()),
            request_errors: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_account(mut self, username: &str, password: &str) -> Self {
        self.account.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_two_factor(mut self, code: &str) -> Self {
        self.two_factor_code = Some(code.to_string());
        self
    }

    /// Report parse failures without a kind, as a client that only has message text would.
    pub fn with_unclassified_errors(mut self) -> Self {
        self.schema_error_kind = UpstreamErrorKind::Unclassified;
        self
    }

    /// Invalidates every previously dumped session blob.
    pub fn rotate_token(&mut self) {
        self.token = format!("{}+", self.token);
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Queues an error for the next typed thread listing.
    pub fn fail_threads(&self, err: UpstreamError) {
        push(&self.thread_errors, err);
    }

    pub fn fail_messages(&self, err: UpstreamError) {
        push(&self.message_errors, err);
    }

    /// Queues an error for the next raw request.
    pub fn fail_requests(&self, err: UpstreamError) {
        push(&self.request_errors, err);
    }

    /// Names of every upstream call made so far, e.g. `direct_threads(5)`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn schema_error(&self, detail: impl std::fmt::Display) -> UpstreamError {
        UpstreamError::new(self.schema_error_kind, format!("1 ValidationError for DirectMessage: {detail}"))
    }

    fn authenticated(&self) -> Result<(), UpstreamError> {
        if self.logged_in || self.restored.as_ref().is_some_and(|s| s.token == self.token) {
            Ok(())
        } else {
            Err(UpstreamError::new(UpstreamErrorKind::LoginRequired, "login_required"))
        }
    }
}

fn push(queue: &Mutex<VecDeque<UpstreamError>>, err: UpstreamError) {
    if let Ok(mut queue) = queue.lock() {
        queue.push_back(err);
    }
}

fn param<'p>(params: &'p [(&str, String)], name: &str) -> Option<&'p str> {
    params.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
}

fn pop(queue: &Mutex<VecDeque<UpstreamError>>) -> Option<UpstreamError> {
    queue.lock().ok().and_then(|mut q| q.pop_front())
}

impl InstagramApi for DemoApi {
    fn login(
        &mut self,
        username: &str,
        password: &str,
        verification_code: Option<&str>,
    ) -> Result<Session, UpstreamError> {
        self.record(format!("login({username})"));
        if username != self.account.username || password != self.password {
            return Err(UpstreamError::new(UpstreamErrorKind::Fatal, "bad_password"));
        }
        if let Some(expected) = &self.two_factor_code {
            match verification_code {
                None => {
                    return Err(UpstreamError::new(
                        UpstreamErrorKind::TwoFactorRequired,
                        "Two-factor authentication required",
                    ))
                }
                Some(code) if code != expected => {
                    return Err(UpstreamError::new(UpstreamErrorKind::Fatal, "invalid verification code"))
                }
                Some(_) => {}
            }
        }
        self.logged_in = true;
        Ok(self.account.clone())
    }

    fn load_settings(&mut self, blob: &[u8]) -> Result<(), UpstreamError> {
        self.record("load_settings".to_string());
        let settings: DemoSettings = serde_json::from_slice(blob)
            .map_err(|e| UpstreamError::new(UpstreamErrorKind::Fatal, format!("corrupt settings: {e}")))?;
        self.restored = Some(settings);
        Ok(())
    }

    fn dump_settings(&self) -> Result<Vec<u8>, UpstreamError> {
        self.authenticated()?;
        let settings = DemoSettings {
            user_id: self.account.user_id,
            username: self.account.username.clone(),
            token: self.token.clone(),
        };
        serde_json::to_vec(&settings).map_err(|e| UpstreamError::new(UpstreamErrorKind::Fatal, e.to_string()))
    }

    fn probe(&self) -> Result<Session, UpstreamError> {
        self.record("probe".to_string());
        self.authenticated()?;
        Ok(self.account.clone())
    }

    fn direct_threads(&self, thread_message_limit: usize) -> Result<Vec<Thread>, UpstreamError> {
        self.record(format!("direct_threads({thread_message_limit})"));
        self.authenticated()?;
        if let Some(err) = pop(&self.thread_errors) {
            return Err(err);
        }
        self.inbox
            .threads()
            .iter()
            .map(|t| extract_thread(&t.to_value(thread_message_limit)).map_err(|e| self.schema_error(e)))
            .collect()
    }

    fn direct_messages(&self, thread_id: &str, amount: usize) -> Result<Vec<Message>, UpstreamError> {
        self.record(format!("direct_messages({thread_id}, {amount})"));
        self.authenticated()?;
        if let Some(err) = pop(&self.message_errors) {
            return Err(err);
        }
        let thread = self
            .inbox
            .thread(thread_id)
            .ok_or_else(|| UpstreamError::new(UpstreamErrorKind::Fatal, format!("thread {thread_id} not found")))?;
        thread
            .newest_first()
            .take(amount)
            .map(|item| extract_message(item).map_err(|e| self.schema_error(e)))
            .collect()
    }

    fn private_request(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, UpstreamError> {
        self.record(format!("private_request({endpoint})"));
        self.authenticated()?;
        if let Some(err) = pop(&self.request_errors) {
            return Err(err);
        }
        if endpoint == INBOX_ENDPOINT {
            return Ok(self.inbox.inbox_response());
        }
        let thread_id = endpoint
            .strip_prefix(THREAD_PREFIX)
            .map(|rest| rest.trim_end_matches('/'))
            .ok_or_else(|| UpstreamError::new(UpstreamErrorKind::Fatal, format!("unknown endpoint {endpoint}")))?;
        let limit = param(params, "limit").and_then(|v| v.parse().ok()).unwrap_or(20);
        self.inbox
            .thread_page(thread_id, limit, param(params, "cursor"))
            .ok_or_else(|| UpstreamError::new(UpstreamErrorKind::Fatal, format!("thread {thread_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::sanitize_item;

    #[test]
    fn demo_inbox_matches_fixture_conventions() {
        let inbox = demo_inbox(4, 2);
        assert_eq!(inbox.threads().len(), 3);
        let raw = inbox.thread("t1").expect("t1").to_value(10);
        assert_eq!(raw["items"][0]["text"], "Reply 4");
        assert_eq!(raw["items"][3]["text"], "Demo message 1");
        assert_eq!(raw["items"][3]["timestamp"], DEMO_BASE_TS);
        assert_eq!(raw["last_activity_at"], (DEMO_BASE_TS + 180) * MICROS);
    }

    #[test]
    fn broken_clip_needs_repair() {
        let item = broken_clip_item("c1", 2, DEMO_BASE_TS);
        assert!(extract_message(&item).is_err());
        let repaired = sanitize_item(&item).expect("repair");
        let message = extract_message(&repaired).expect("parse");
        assert_eq!(message.timestamp.timestamp(), DEMO_BASE_TS);
        assert!(message.media.is_some());
    }

    #[test]
    fn thread_pages_walk_back_by_cursor() {
        let inbox = DemoInbox::new().with_thread(DemoThread::conversation("x", "p", 5));
        let first = inbox.thread_page("x", 2, None).expect("page");
        assert_eq!(first["thread"]["items"].as_array().expect("items").len(), 2);
        assert_eq!(first["thread"]["has_older"], true);
        let cursor = first["thread"]["oldest_cursor"].as_str().expect("cursor").to_string();
        assert_eq!(cursor, "x:m4");
        let second = inbox.thread_page("x", 10, Some(&cursor)).expect("page");
        let items = second["thread"]["items"].as_array().expect("items");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["item_id"], "x:m3");
        assert_eq!(second["thread"]["has_older"], false);
    }

    #[test]
    fn typed_calls_require_auth() {
        let api = DemoApi::new(demo_inbox(2, 0));
        let err = api.direct_threads(5).expect_err("not logged in");
        assert_eq!(err.kind, UpstreamErrorKind::LoginRequired);
    }
}
