//! Authenticated HTTP request gateway.
//!
//! Wraps every REST call so it carries the current access token and survives
//! exactly one failure class (credential expiry) without the caller
//! noticing. On a 401 the first request to observe it performs the token
//! refresh; any request that hits a 401 while that refresh is in flight
//! parks on a FIFO queue and is woken with the outcome. A request is
//! replayed at most once, so a credential the server keeps rejecting
//! surfaces as a plain 401 instead of a refresh loop.
//!
//! The refresh call itself goes straight through the underlying client,
//! never through the gateway, so it cannot recurse.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Request, RequestBuilder, Response, StatusCode};
use tokio::sync::oneshot;

use crate::credentials::{CredentialStore, TokenPair};
use crate::error::Error;

/// Outcome delivered to parked requests when the in-flight refresh settles:
/// the fresh access token, or the reason the session ended.
type RefreshOutcome = Result<String, String>;

/// Hook invoked when the session becomes unrecoverable (refresh rejected or
/// no refresh token stored). Lets independent surfaces react (e.g. switch
/// to a sign-in screen) without inspecting every response.
pub type SessionEndedHook = Box<dyn Fn() + Send + Sync>;

/// A request plus its retry accounting. Replayed at most once.
struct Attempt {
    request: Request,
    attempt: u8,
}

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

pub struct Gateway {
    http: reqwest::Client,
    refresh_url: String,
    store: Arc<CredentialStore>,
    refresh: Mutex<RefreshState>,
    session_ended: RwLock<Option<SessionEndedHook>>,
}

impl Gateway {
    /// `auth_base_url` is the root of the auth service; the refresh endpoint
    /// lives at `{auth_base_url}/auth/refresh`.
    pub fn new(auth_base_url: &str, store: Arc<CredentialStore>) -> Self {
        Self::with_client(reqwest::Client::new(), auth_base_url, store)
    }

    pub fn with_client(
        http: reqwest::Client,
        auth_base_url: &str,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            http,
            refresh_url: format!("{}/auth/refresh", auth_base_url.trim_end_matches('/')),
            store,
            refresh: Mutex::new(RefreshState::default()),
            session_ended: RwLock::new(None),
        }
    }

    /// The underlying client, for building requests to pass to [`send`].
    ///
    /// [`send`]: Gateway::send
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Register the hook fired when the session ends unrecoverably.
    pub fn on_session_ended(&self, hook: SessionEndedHook) {
        *self.session_ended.write() = Some(hook);
    }

    /// Send a request through the gateway: attach the bearer token, and on a
    /// 401 refresh the credential and replay once.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, Error> {
        let request = builder.build()?;
        self.dispatch(Attempt { request, attempt: 0 }).await
    }

    async fn dispatch(&self, mut attempt: Attempt) -> Result<Response, Error> {
        loop {
            let mut request = match attempt.request.try_clone() {
                Some(clone) => clone,
                None => {
                    // One-shot body: send as-is; a 401 cannot be replayed.
                    let mut request = attempt.request;
                    self.attach_credential(&mut request);
                    return Ok(self.http.execute(request).await?);
                }
            };
            self.attach_credential(&mut request);

            let response = self.http.execute(request).await?;
            if response.status() != StatusCode::UNAUTHORIZED || attempt.attempt > 0 {
                return Ok(response);
            }

            // First 401 for this request: recover the credential, then loop
            // to reissue with the token now in the store.
            self.refresh_access_token().await?;
            attempt.attempt += 1;
            tracing::debug!(url = %attempt.request.url(), "access token refreshed, replaying request");
        }
    }

    /// Set the `Authorization` header from the store. A missing token is a
    /// valid anonymous call, not an error.
    fn attach_credential(&self, request: &mut Request) {
        let Some(token) = self.store.access_token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(value) => {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => {
                tracing::warn!("stored access token is not a valid header value, sending anonymously");
            }
        }
    }

    /// Collapse concurrent refresh demand into a single network call.
    ///
    /// The first caller becomes the leader and performs the refresh; everyone
    /// else parks on the queue and receives the leader's outcome in FIFO
    /// order. On failure the credentials are cleared and the session-ended
    /// hook fires before anyone is woken.
    async fn refresh_access_token(&self) -> Result<String, Error> {
        let parked = {
            let mut st = self.refresh.lock();
            if st.in_flight {
                let (tx, rx) = oneshot::channel();
                st.waiters.push(tx);
                Some(rx)
            } else {
                st.in_flight = true;
                None
            }
        };

        if let Some(rx) = parked {
            return match rx.await {
                Ok(Ok(token)) => Ok(token),
                Ok(Err(reason)) => Err(Error::SessionExpired(reason)),
                Err(_) => Err(Error::SessionExpired("refresh interrupted".to_string())),
            };
        }

        // Leader path. The guard releases the flag and fails parked requests
        // if this future is dropped before the refresh settles.
        let mut guard = RefreshGuard {
            gateway: self,
            settled: false,
        };

        let outcome: RefreshOutcome = match self.store.refresh_token() {
            None => Err("no refresh token stored".to_string()),
            Some(refresh_token) => match self.perform_refresh(&refresh_token).await {
                Ok(pair) => {
                    let token = pair.access_token.clone();
                    self.store.set(pair);
                    Ok(token)
                }
                Err(reason) => Err(reason),
            },
        };

        if let Err(reason) = &outcome {
            tracing::warn!(reason = %reason, "session unrecoverable, clearing credentials");
            self.store.clear();
            self.notify_session_ended();
        }

        guard.settle(&outcome);
        outcome.map_err(Error::SessionExpired)
    }

    async fn perform_refresh(&self, refresh_token: &str) -> Result<TokenPair, String> {
        tracing::debug!("access token rejected, refreshing");
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| format!("refresh request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "refresh rejected with status {}",
                response.status().as_u16()
            ));
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|e| format!("malformed refresh response: {e}"))
    }

    fn notify_session_ended(&self) {
        if let Some(hook) = self.session_ended.read().as_ref() {
            hook();
        }
    }
}

/// Releases the refresh-in-flight flag exactly once, no matter how the
/// leader exits. An unsettled drop (the leader future was cancelled) rejects
/// every parked request rather than leaving the flag stuck.
struct RefreshGuard<'a> {
    gateway: &'a Gateway,
    settled: bool,
}

impl RefreshGuard<'_> {
    fn settle(&mut self, outcome: &RefreshOutcome) {
        self.settled = true;
        for tx in self.drain() {
            let _ = tx.send(outcome.clone());
        }
    }

    fn drain(&self) -> Vec<oneshot::Sender<RefreshOutcome>> {
        let mut st = self.gateway.refresh.lock();
        st.in_flight = false;
        std::mem::take(&mut st.waiters)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        for tx in self.drain() {
            let _ = tx.send(Err("refresh interrupted".to_string()));
        }
    }
}
