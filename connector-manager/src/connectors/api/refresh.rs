//! Single-flight OAuth token renewal.
//!
//! ```text
//!   401 with token T ──► T stale? ── no ──► return current token (already renewed)
//!                          │
//!                         yes
//!                          │
//!        Idle ─────────────┴──────────── Refreshing
//!    become the leader                  enqueue a waiter
//!    POST token endpoint                await leader's outcome
//!    store outcome, back to Idle
//!    release every waiter
//! ```
//!
//! A failed refresh is remembered against the stale token, so later
//! rejections of that same token get the same failure without another call.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use conduit::{ConnectorError, Result};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::connectors::with_timeout;

/// Token endpoints of well-known providers, matched by base-URL substring.
pub const PROVIDER_TOKEN_URLS: &[(&str, &str)] = &[
    ("googleapis.com", "https://oauth2.googleapis.com/token"),
    ("google.com", "https://oauth2.googleapis.com/token"),
    (
        "graph.microsoft.com",
        "https://login.microsoftonline.com/common/oauth2/v2.0/token",
    ),
    ("api.github.com", "https://github.com/login/oauth/access_token"),
    ("salesforce.com", "https://login.salesforce.com/services/oauth2/token"),
    ("hubapi.com", "https://api.hubapi.com/oauth/v1/token"),
    ("hubspot.com", "https://api.hubapi.com/oauth/v1/token"),
    ("slack.com", "https://slack.com/api/oauth.v2.access"),
    ("atlassian.com", "https://auth.atlassian.com/oauth/token"),
    ("atlassian.net", "https://auth.atlassian.com/oauth/token"),
];

/// Explicit `tokenUrl`, else a known provider, else `<baseUrl>/oauth/token`.
pub fn token_endpoint(explicit: Option<&str>, base_url: &str) -> String {
    if let Some(url) = explicit.filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if base.contains("myshopify.com") {
        // Shopify token endpoints are per shop
        let origin = reqwest::Url::parse(base)
            .ok()
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|| base.to_string());
        return format!("{}/admin/oauth/access_token", origin);
    }
    PROVIDER_TOKEN_URLS
        .iter()
        .find(|(domain, _)| base.contains(domain))
        .map(|(_, url)| url.to_string())
        .unwrap_or_else(|| format!("{}/oauth/token", base))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type Waiter = oneshot::Sender<Result<String>>;

enum Phase {
    Idle,
    Refreshing(Vec<Waiter>),
}

struct State {
    access_token: String,
    refresh_token: String,
    phase: Phase,
    /// Stale token whose refresh failed, with the failure.
    failed_for: Option<(String, ConnectorError)>,
}

/// Client settings for the token endpoint.
pub struct TokenClient {
    pub http: reqwest::Client,
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub timeout: Duration,
}

pub struct RefreshCoordinator {
    client: TokenClient,
    state: Mutex<State>,
}

enum Role {
    Leader(String),
    Waiter(oneshot::Receiver<Result<String>>),
}

impl RefreshCoordinator {
    pub fn new(client: TokenClient, access_token: String, refresh_token: String) -> Self {
        Self {
            client,
            state: Mutex::new(State {
                access_token,
                refresh_token,
                phase: Phase::Idle,
                failed_for: None,
            }),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.client.token_url
    }

    pub fn access_token(&self) -> String {
        self.lock().access_token.clone()
    }

    /// Returns a token to replay with after the backend rejected `stale`.
    ///
    /// Exactly one token-endpoint call happens per refresh cycle however many
    /// callers report the same stale token.
    pub async fn renew(&self, stale: &str) -> Result<String> {
        let role = {
            let mut state = self.lock();
            if state.access_token != stale {
                return Ok(state.access_token.clone());
            }
            if let Some((failed, err)) = &state.failed_for {
                if failed == stale {
                    return Err(err.clone());
                }
            }
            match &mut state.phase {
                Phase::Refreshing(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Role::Waiter(rx)
                }
                Phase::Idle => {
                    state.phase = Phase::Refreshing(Vec::new());
                    Role::Leader(state.refresh_token.clone())
                }
            }
        };

        match role {
            Role::Waiter(rx) => rx.await.unwrap_or_else(|_| {
                Err(ConnectorError::ConnectionFailed("token refresh was abandoned".into()))
            }),
            Role::Leader(refresh_token) => {
                let mut cycle = Cycle {
                    coordinator: self,
                    stale: stale.to_string(),
                    finished: false,
                };
                let outcome = self.request_token(&refresh_token).await;
                cycle.finish(outcome)
            }
        }
    }

    async fn request_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(id) = &self.client.client_id {
            form.push(("client_id", id.as_str()));
        }
        if let Some(secret) = &self.client.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        info!(token_url = %self.client.token_url, "Refreshing OAuth token");

        let request = self
            .client
            .http
            .post(&self.client.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send();

        let response = with_timeout(self.client.timeout, async {
            request
                .await
                .map_err(|e| ConnectorError::ConnectionFailed(format!("token endpoint unreachable: {}", e)))
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("token refresh failed with status {}", status.as_u16());
            return Err(if status.is_client_error() {
                ConnectorError::InvalidCredentials(message)
            } else {
                ConnectorError::QueryFailed {
                    message,
                    status: Some(status.as_u16()),
                }
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|_| ConnectorError::query_failed("token endpoint returned an unreadable response"))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One leader's refresh cycle. Dropping it unfinished (cancellation) still
/// returns the coordinator to Idle and releases the waiters.
struct Cycle<'a> {
    coordinator: &'a RefreshCoordinator,
    stale: String,
    finished: bool,
}

impl Cycle<'_> {
    fn finish(&mut self, outcome: Result<TokenResponse>) -> Result<String> {
        self.finished = true;
        let mut state = self.coordinator.lock();
        let result = match outcome {
            Ok(token) => {
                state.access_token = token.access_token;
                // Providers that do not rotate keep the old refresh token valid
                if let Some(rotated) = token.refresh_token {
                    state.refresh_token = rotated;
                }
                state.failed_for = None;
                info!(token_url = %self.coordinator.client.token_url, "OAuth token refreshed");
                Ok(state.access_token.clone())
            }
            Err(e) => {
                warn!(
                    token_url = %self.coordinator.client.token_url,
                    error = %e,
                    "OAuth token refresh failed"
                );
                state.failed_for = Some((self.stale.clone(), e.clone()));
                Err(e)
            }
        };
        release(&mut state, &result);
        result
    }
}

impl Drop for Cycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.coordinator.lock();
        release(
            &mut state,
            &Err(ConnectorError::ConnectionFailed("token refresh was cancelled".into())),
        );
    }
}

fn release(state: &mut State, result: &Result<String>) {
    if let Phase::Refreshing(waiters) = std::mem::replace(&mut state.phase, Phase::Idle) {
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
