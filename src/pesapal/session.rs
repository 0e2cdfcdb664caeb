// Process-wide Pesapal session: bearer token and registered IPN id.
//
// The lock is held only around reads and writes of the cached values, never
// across a network call. Two requests may both refresh an expired token; the
// last write wins.

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::pesapal::types::AccessToken;

#[derive(Default)]
struct SessionState {
    token: Option<AccessToken>,
    ipn_id: Option<String>,
}

pub struct SessionCache {
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
    state: RwLock<SessionState>,
}

impl SessionCache {
    pub fn new(clock: Arc<dyn Clock>, refresh_margin: std::time::Duration) -> Self {
        Self {
            clock,
            refresh_margin: Duration::from_std(refresh_margin).unwrap_or(Duration::minutes(5)),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// The cached token, unless it is missing or inside the refresh margin.
    pub async fn token(&self) -> Option<SecretString> {
        let state = self.state.read().await;
        match &state.token {
            Some(token) if !self.token_expired(token) => {
                Some(SecretString::from(token.token.expose_secret().to_string()))
            }
            _ => None,
        }
    }

    pub async fn set_token(&self, token: AccessToken) {
        self.state.write().await.token = Some(token);
    }

    pub async fn is_expired(&self) -> bool {
        let state = self.state.read().await;
        state
            .token
            .as_ref()
            .map_or(true, |token| self.token_expired(token))
    }

    /// Drops the token after the gateway rejected it. The IPN id stays.
    pub async fn invalidate_token(&self) {
        self.state.write().await.token = None;
    }

    pub async fn ipn_id(&self) -> Option<String> {
        self.state.read().await.ipn_id.clone()
    }

    pub async fn set_ipn_id(&self, ipn_id: String) {
        self.state.write().await.ipn_id = Some(ipn_id);
    }

    pub async fn clear(&self) {
        *self.state.write().await = SessionState::default();
    }

    fn token_expired(&self, token: &AccessToken) -> bool {
        self.clock.now() >= token.expires_at - self.refresh_margin
    }
}
