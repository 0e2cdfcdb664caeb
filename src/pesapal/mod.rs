// Pesapal provider module

pub mod errors;
pub mod metrics;
pub mod rest;
pub mod session;
pub mod types;
pub mod webhook;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use self::errors::GatewayError;
use self::rest::PesapalRestClient;
use self::session::SessionCache;
use self::types::{OrderRequest, OrderSubmission, ParsedStatus, SubmitOrderBody};
use crate::clock::Clock;
use crate::settings::PesapalSettings;

/// Payment gateway as seen by the orchestrator.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderSubmission, GatewayError>;

    async fn get_transaction_status(&self, tracking_id: &str) -> Result<ParsedStatus, GatewayError>;
}

#[derive(Clone)]
pub struct PesapalProvider {
    pub(crate) rest: PesapalRestClient,
    pub(crate) session: Arc<SessionCache>,
    consumer_key: Arc<SecretString>,
    consumer_secret: Arc<SecretString>,
    ipn_url: String,
}

impl PesapalProvider {
    // Build reqwest client with rustls and timeout from cfg.
    pub fn new(
        cfg: &PesapalSettings,
        ipn_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        let timeout = Duration::from_millis(if cfg.timeout_ms > 0 { cfg.timeout_ms } else { 15_000 });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http {
                endpoint: "client",
                message: e.to_string(),
            })?;

        if cfg.consumer_key.trim().is_empty() {
            return Err(GatewayError::Precondition("PESAPAL_CONSUMER_KEY is required"));
        }
        if cfg.consumer_secret.trim().is_empty() {
            return Err(GatewayError::Precondition("PESAPAL_CONSUMER_SECRET is required"));
        }

        Ok(Self {
            rest: PesapalRestClient::new(http, cfg.resolved_base_url()),
            session: Arc::new(SessionCache::new(clock, cfg.token_refresh_margin)),
            consumer_key: Arc::new(SecretString::from(cfg.consumer_key.clone())),
            consumer_secret: Arc::new(SecretString::from(cfg.consumer_secret.clone())),
            ipn_url: ipn_url.into(),
        })
    }

    /// A valid bearer token, requesting a new one when the cached token is
    /// missing or about to expire.
    pub async fn access_token(&self) -> Result<SecretString, GatewayError> {
        if let Some(token) = self.session.token().await {
            return Ok(token);
        }
        let fresh = self
            .rest
            .request_token(&self.consumer_key, &self.consumer_secret)
            .await?;
        info!(target: "pesapal", expires_at = %fresh.expires_at, "obtained pesapal access token");
        let token = SecretString::from(fresh.token.expose_secret().to_string());
        self.session.set_token(fresh).await;
        Ok(token)
    }

    /// Registers `url` as the IPN endpoint and caches the returned id.
    pub async fn register_callback_channel(&self, url: &str) -> Result<String, GatewayError> {
        let ipn_id = self
            .with_token(|token| async move { self.rest.register_ipn(&token, url).await })
            .await?;
        info!(target: "pesapal", ipn_id = %ipn_id, ipn_url = %url, "registered pesapal IPN");
        self.session.set_ipn_id(ipn_id.clone()).await;
        Ok(ipn_id)
    }

    async fn ipn_id(&self) -> Result<String, GatewayError> {
        match self.session.ipn_id().await {
            Some(id) => Ok(id),
            None => self.register_callback_channel(&self.ipn_url).await,
        }
    }

    /// Runs `call` with the current token. A 401 drops the cached token and
    /// retries once with a fresh one.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Fn(SecretString) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let token = self.access_token().await?;
        match call(token).await {
            Err(e) if e.is_unauthorized() => {
                warn!(target: "pesapal", "pesapal rejected the access token, re-authenticating");
                self.session.invalidate_token().await;
                let token = self.access_token().await?;
                call(token).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl PaymentGateway for PesapalProvider {
    fn name(&self) -> &'static str {
        "pesapal"
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderSubmission, GatewayError> {
        let notification_id = self.ipn_id().await?;
        let body = SubmitOrderBody::new(order, &notification_id);
        let body = &body;
        self.with_token(|token| async move { self.rest.submit_order(&token, body).await })
            .await
    }

    async fn get_transaction_status(&self, tracking_id: &str) -> Result<ParsedStatus, GatewayError> {
        self.with_token(|token| async move {
            self.rest.get_transaction_status(&token, tracking_id).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::pesapal::rest::{REGISTER_IPN_PATH, SUBMIT_ORDER_PATH, TOKEN_PATH, TRANSACTION_STATUS_PATH};
    use crate::pesapal::types::PaymentStatus;
    use crate::settings::PesapalEnvironment;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> PesapalSettings {
        PesapalSettings {
            consumer_key: "key".into(),
            consumer_secret: "secret".into(),
            environment: PesapalEnvironment::Sandbox,
            base_url: server.uri(),
            timeout_ms: 2_000,
            token_refresh_margin: Duration::from_secs(300),
            max_initiation_retries: 2,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()))
    }

    fn order() -> OrderRequest {
        OrderRequest {
            merchant_reference: "VW-1".into(),
            amount: 5000,
            currency: "UGX".into(),
            description: "Bronze Wave voucher".into(),
            callback_url: "https://shop.example/payment-callback".into(),
            phone_number: "+256712345678".into(),
            country_code: "UG".into(),
        }
    }

    async fn mount_token(server: &MockServer, token: &str, expiry: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token": token,
                "expiryDate": expiry,
                "status": "200"
            })))
            .up_to_n_times(times)
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_token_and_ipn_are_cached() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", "2025-03-10T13:00:00Z", 1).await;
        Mock::given(method("POST"))
            .and(path(REGISTER_IPN_PATH))
            .and(body_partial_json(json!({
                "url": "https://shop.example/payment-notifications",
                "ipn_notification_type": "POST"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ipn_id": "ipn-1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SUBMIT_ORDER_PATH))
            .and(header("authorization", "Bearer tok-1"))
            .and(body_partial_json(json!({ "notification_id": "ipn-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_tracking_id": "T-1",
                "merchant_reference": "VW-1",
                "redirect_url": "https://pay.example/T-1"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let provider = PesapalProvider::new(
            &settings(&server),
            "https://shop.example/payment-notifications",
            clock(),
        )
        .unwrap();

        for _ in 0..2 {
            let submission = provider.submit_order(&order()).await.unwrap();
            assert_eq!(submission.tracking_id, "T-1");
        }
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", "2025-03-10T12:10:00Z", 1).await;
        mount_token(&server, "tok-2", "2025-03-10T13:10:00Z", 1).await;
        Mock::given(method("GET"))
            .and(path(TRANSACTION_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_status_description": "Pending"
            })))
            .mount(&server)
            .await;

        let clock = clock();
        let provider = PesapalProvider::new(&settings(&server), "https://shop.example/ipn", clock.clone())
            .unwrap();

        provider.get_transaction_status("T-1").await.unwrap();
        // still outside the 5 minute refresh margin
        provider.get_transaction_status("T-1").await.unwrap();

        clock.advance(chrono::Duration::minutes(6));
        let status = provider.get_transaction_status("T-1").await.unwrap();
        assert_eq!(status.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_single_reauth() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1", "2025-03-10T13:00:00Z", 1).await;
        mount_token(&server, "tok-2", "2025-03-10T13:00:00Z", 1).await;
        Mock::given(method("GET"))
            .and(path(TRANSACTION_STATUS_PATH))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "code": "invalid_api_token", "message": "Token expired" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(TRANSACTION_STATUS_PATH))
            .and(header("authorization", "Bearer tok-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_status_description": "Completed",
                "status_code": 1,
                "merchant_reference": "VW-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = PesapalProvider::new(&settings(&server), "https://shop.example/ipn", clock())
            .unwrap();
        let status = provider.get_transaction_status("T-1").await.unwrap();
        assert_eq!(status.status, PaymentStatus::Completed);
        assert_eq!(status.merchant_reference.as_deref(), Some("VW-1"));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut cfg = PesapalSettings::default();
        cfg.consumer_key = "key".into();
        let err = PesapalProvider::new(&cfg, "https://shop.example/ipn", clock())
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Precondition(_)));
    }
}
