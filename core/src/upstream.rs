//! Boundary to the private Instagram API.
//!
//! The HTTP client itself lives outside this crate. It exposes a typed
//! surface that fails on schema mismatch and a raw JSON surface used by the
//! fallback tiers.

use serde_json::Value;

use crate::error::UpstreamError;
use crate::models::{Message, Session, Thread};

pub const INBOX_ENDPOINT: &str = "direct_v2/inbox/";

pub fn thread_endpoint(thread_id: &str) -> String {
    format!("direct_v2/threads/{}/", thread_id)
}

pub trait InstagramApi {
    /// Full credential login. A pending challenge is reported with
    /// [`crate::error::UpstreamErrorKind::TwoFactorRequired`].
    fn login(
        &mut self,
        username: &str,
        password: &str,
        verification_code: Option<&str>,
    ) -> Result<Session, UpstreamError>;

    /// Restore client state from a blob previously produced by [`InstagramApi::dump_settings`].
    fn load_settings(&mut self, blob: &[u8]) -> Result<(), UpstreamError>;

    fn dump_settings(&self) -> Result<Vec<u8>, UpstreamError>;

    /// Cheap authenticated call used to check that a restored session still works.
    fn probe(&self) -> Result<Session, UpstreamError>;

    fn direct_threads(&self, thread_message_limit: usize) -> Result<Vec<Thread>, UpstreamError>;

    fn direct_messages(&self, thread_id: &str, amount: usize) -> Result<Vec<Message>, UpstreamError>;

    fn private_request(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value, UpstreamError>;
}
