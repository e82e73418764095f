//! Login, session restore and logout.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::conversations::ConversationRetriever;
use crate::credentials::{CredentialManager, Credentials};
use crate::error::{CoreError, UpstreamError, UpstreamErrorKind};
use crate::messages::{MessageRetriever, DEFAULT_BATCH_SIZE, DEFAULT_MAX_FAILURES};
use crate::models::Session;
use crate::rate_limiter::RateLimiter;
use crate::schema::is_two_factor;
use crate::session_store::SessionStore;
use crate::upstream::InstagramApi;

pub struct AuthGateway<A: InstagramApi> {
    api: A,
    limiter: Arc<RateLimiter>,
    sessions: Box<dyn SessionStore + Send + Sync>,
    credentials: CredentialManager,
    save_credentials: bool,
    batch_size: usize,
    max_retries: usize,
    session: Option<Session>,
}

impl<A: InstagramApi> AuthGateway<A> {
    pub fn new(
        api: A,
        limiter: Arc<RateLimiter>,
        sessions: Box<dyn SessionStore + Send + Sync>,
        credentials: CredentialManager,
    ) -> Self {
        Self {
            api,
            limiter,
            sessions,
            credentials,
            save_credentials: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_FAILURES,
            session: None,
        }
    }

    /// Persist caller-supplied credentials after a successful fresh login.
    pub fn with_save_credentials(mut self, save: bool) -> Self {
        self.save_credentials = save;
        self
    }

    /// Initial page size for the safe batch walk.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Consecutive unusable batches tolerated before a message walk stops.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Takes the batch size and retry budget from `config`.
    pub fn with_fetch_config(self, config: &AppConfig) -> Self {
        self.with_batch_size(config.batch_size)
            .with_max_retries(config.max_retries as usize)
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn conversations(&self) -> ConversationRetriever<'_, A> {
        ConversationRetriever::new(&self.api, self.limiter.clone())
    }

    pub fn messages(&self) -> MessageRetriever<'_, A> {
        MessageRetriever::new(&self.api, self.limiter.clone())
            .with_batch_size(self.batch_size)
            .with_max_failures(self.max_retries)
    }

    /// Restores the persisted session when it still works, otherwise logs in
    /// with the given or stored credentials.
    ///
    /// A two-factor challenge surfaces as [`CoreError::TwoFactorRequired`] and
    /// leaves the session store untouched; call again with the code.
    pub fn login(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
        verification_code: Option<&str>,
    ) -> Result<Session, CoreError> {
        if let Some(session) = self.try_restore(username, password) {
            self.session = Some(session.clone());
            return Ok(session);
        }

        let (creds, supplied) = match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (Credentials::new(u, p), true),
            _ => (self.stored_credentials(username)?, false),
        };

        let outcome = {
            let api = &mut self.api;
            self.limiter
                .call(|| api.login(&creds.username, &creds.password, verification_code))
        };
        let session = match outcome {
            Ok(session) => session,
            Err(err) if is_two_factor(&err) => {
                warn!(username = %creds.username, "two-factor authentication required");
                return Err(CoreError::TwoFactorRequired);
            }
            Err(err) => {
                warn!(username = %creds.username, error = %err, "login failed");
                return Err(CoreError::Authentication(format!("login failed: {err}")));
            }
        };
        info!(username = %session.username, "logged in");

        self.persist_session();
        if self.save_credentials && supplied {
            if let Err(err) = self.credentials.save(&creds.username, &creds.password) {
                warn!(error = %err, "could not save credentials");
            }
        }
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Plain login, asking `code_provider` for a verification code and retrying
    /// once if a two-factor challenge comes back.
    pub fn login_with_2fa<F>(&mut self, username: &str, password: &str, code_provider: F) -> Result<Session, CoreError>
    where
        F: FnOnce() -> Option<String>,
    {
        match self.login(Some(username), Some(password), None) {
            Err(CoreError::TwoFactorRequired) => {
                let code = code_provider()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .ok_or(CoreError::TwoFactorRequired)?;
                self.login(Some(username), Some(password), Some(&code))
            }
            other => other,
        }
    }

    /// Drops the in-memory session and optionally the persisted state.
    /// Failures are logged, never returned.
    pub fn logout(&mut self, delete_session: bool, delete_credentials: bool) {
        if delete_session {
            match self.sessions.delete() {
                Ok(()) => info!("session deleted"),
                Err(err) => warn!(error = %err, "could not delete session"),
            }
        }
        if delete_credentials {
            match self.session.as_ref().map(|s| s.username.clone()) {
                Some(username) => {
                    if let Err(err) = self.credentials.delete(Some(&username)) {
                        warn!(error = %err, "could not delete credentials");
                    }
                }
                None => warn!("could not delete credentials without an active session"),
            }
        }
        self.session = None;
        info!("logged out");
    }

    fn try_restore(&mut self, username: Option<&str>, password: Option<&str>) -> Option<Session> {
        let blob = self.sessions.load()?;
        info!("attempting to restore saved session");
        match self.restore(&blob, username, password) {
            Ok(session) => {
                info!(username = %session.username, "restored saved session");
                Some(session)
            }
            Err(err) => {
                warn!(error = %err, "failed to restore saved session");
                None
            }
        }
    }

    fn restore(
        &mut self,
        blob: &[u8],
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Session, UpstreamError> {
        self.api.load_settings(blob)?;
        let known = match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials::new(u, p)),
            _ => match self.credentials.load() {
                Some(stored) if username.is_some_and(|u| !u.is_empty() && u != stored.username) => {
                    return Err(UpstreamError::new(
                        UpstreamErrorKind::Fatal,
                        format!("saved credentials belong to {}", stored.username),
                    ));
                }
                stored => stored,
            },
        };
        match known {
            Some(creds) => {
                let api = &mut self.api;
                self.limiter
                    .call(|| api.login(&creds.username, &creds.password, None))
            }
            None => {
                let api = &self.api;
                self.limiter.call(|| api.probe())
            }
        }
    }

    fn stored_credentials(&self, username: Option<&str>) -> Result<Credentials, CoreError> {
        let stored = self
            .credentials
            .load()
            .ok_or_else(|| CoreError::Authentication("no credentials available".to_string()))?;
        match username {
            Some(u) if !u.is_empty() && u != stored.username => Err(CoreError::Authentication(format!(
                "no stored password for {u}"
            ))),
            _ => {
                info!(username = %stored.username, "using saved credentials");
                Ok(stored)
            }
        }
    }

    fn persist_session(&self) {
        let blob = match self.api.dump_settings() {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "could not serialise session");
                return;
            }
        };
        match self.sessions.save(&blob) {
            Ok(()) => info!("session saved"),
            Err(err) => warn!(error = %err, "could not save session"),
        }
    }
}
