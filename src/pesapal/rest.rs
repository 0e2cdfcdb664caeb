// Pesapal v3 REST client
// One method per endpoint. No retries here; callers decide.

use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use crate::pesapal::errors::{GatewayError, PesapalErrorBody};
use crate::pesapal::types::{
    parse_timestamp, AccessToken, OrderSubmission, ParsedStatus, RegisterIpnRequest,
    RegisterIpnResponse, SubmitOrderBody, SubmitOrderResponse, TokenRequest, TokenResponse,
    TransactionStatusResponse,
};

pub const TOKEN_PATH: &str = "/api/Auth/RequestToken";
pub const REGISTER_IPN_PATH: &str = "/api/URLSetup/RegisterIPN";
pub const SUBMIT_ORDER_PATH: &str = "/api/Transactions/SubmitOrderRequest";
pub const TRANSACTION_STATUS_PATH: &str = "/api/Transactions/GetTransactionStatus";

#[derive(serde::Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<PesapalErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct PesapalRestClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
}

impl PesapalRestClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_transport(endpoint: &'static str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout { endpoint }
        } else {
            GatewayError::Http {
                endpoint,
                message: e.to_string(),
            }
        }
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayError {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|env| {
                env.error
                    .filter(PesapalErrorBody::is_present)
                    .map(|e| e.describe())
                    .or(env.message)
            })
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string()
            });
        GatewayError::Api {
            message,
            raw_response: body.to_string(),
            status: Some(status.as_u16()),
        }
    }

    /// Sends the request and returns the body of a 2xx answer.
    async fn send(&self, endpoint: &'static str, req: RequestBuilder) -> Result<String, GatewayError> {
        let resp = req
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Self::map_transport(endpoint, e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Self::map_transport(endpoint, e))?;
        if status.is_success() {
            Ok(text)
        } else {
            warn!(target: "pesapal", endpoint, http_status = status.as_u16(), "pesapal request failed");
            Err(Self::map_error(status, &text))
        }
    }

    fn decode<T: DeserializeOwned>(endpoint: &'static str, body: &str) -> Result<T, GatewayError> {
        serde_json::from_str(body)
            .map_err(|e| GatewayError::SchemaMismatch(format!("{endpoint}: {e}")))
    }

    // POST /api/Auth/RequestToken
    #[instrument(skip_all, fields(method = "POST", path = TOKEN_PATH))]
    pub async fn request_token(
        &self,
        consumer_key: &SecretString,
        consumer_secret: &SecretString,
    ) -> Result<AccessToken, GatewayError> {
        info!(target: "pesapal", method = "POST", path = TOKEN_PATH, "pesapal request");

        let body = TokenRequest {
            consumer_key: consumer_key.expose_secret(),
            consumer_secret: consumer_secret.expose_secret(),
        };
        let req = self.http.post(self.url(TOKEN_PATH)).json(&body);
        let text = self.send(TOKEN_PATH, req).await?;

        // The success body carries the token, so decode errors never echo it.
        let parsed: TokenResponse = serde_json::from_str(&text).map_err(|_| {
            GatewayError::SchemaMismatch(format!("{TOKEN_PATH}: body is not a token response"))
        })?;
        if let Some(error) = parsed.error.as_ref().filter(|e| e.is_present()) {
            return Err(GatewayError::Api {
                message: error.describe(),
                raw_response: text.clone(),
                status: None,
            });
        }

        let token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::SchemaMismatch(format!("{TOKEN_PATH}: missing token")))?;
        let expiry = parsed
            .expiry_date
            .ok_or_else(|| GatewayError::SchemaMismatch(format!("{TOKEN_PATH}: missing expiryDate")))?;

        Ok(AccessToken {
            token: SecretString::from(token),
            expires_at: parse_timestamp(&expiry)?,
        })
    }

    // POST /api/URLSetup/RegisterIPN
    #[instrument(skip(self, token), fields(method = "POST", path = REGISTER_IPN_PATH))]
    pub async fn register_ipn(&self, token: &SecretString, url: &str) -> Result<String, GatewayError> {
        info!(target: "pesapal", method = "POST", path = REGISTER_IPN_PATH, ipn_url = %url, "pesapal request");

        let body = RegisterIpnRequest {
            url,
            ipn_notification_type: "POST",
        };
        let req = self
            .http
            .post(self.url(REGISTER_IPN_PATH))
            .bearer_auth(token.expose_secret())
            .json(&body);
        let text = self.send(REGISTER_IPN_PATH, req).await?;

        let parsed: RegisterIpnResponse = Self::decode(REGISTER_IPN_PATH, &text)?;
        if let Some(error) = parsed.error.as_ref().filter(|e| e.is_present()) {
            return Err(GatewayError::Api {
                message: error.describe(),
                raw_response: text,
                status: None,
            });
        }
        parsed
            .ipn_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::SchemaMismatch(format!("{REGISTER_IPN_PATH}: missing ipn_id")))
    }

    // POST /api/Transactions/SubmitOrderRequest
    #[instrument(skip_all, fields(method = "POST", path = SUBMIT_ORDER_PATH, merchant_reference = %body.id))]
    pub async fn submit_order(
        &self,
        token: &SecretString,
        body: &SubmitOrderBody<'_>,
    ) -> Result<OrderSubmission, GatewayError> {
        info!(
            target: "pesapal",
            method = "POST",
            path = SUBMIT_ORDER_PATH,
            merchant_reference = %body.id,
            amount = body.amount,
            currency = %body.currency,
            "pesapal request"
        );

        let req = self
            .http
            .post(self.url(SUBMIT_ORDER_PATH))
            .bearer_auth(token.expose_secret())
            .json(body);
        let text = self.send(SUBMIT_ORDER_PATH, req).await?;

        let parsed: SubmitOrderResponse = Self::decode(SUBMIT_ORDER_PATH, &text)?;
        if let Some(error) = parsed.error.as_ref().filter(|e| e.is_present()) {
            return Err(GatewayError::Api {
                message: error.describe(),
                raw_response: text,
                status: None,
            });
        }

        let tracking_id = parsed.order_tracking_id.filter(|t| !t.is_empty()).ok_or_else(|| {
            GatewayError::SchemaMismatch(format!("{SUBMIT_ORDER_PATH}: missing order_tracking_id"))
        })?;
        let redirect_url = parsed.redirect_url.filter(|u| !u.is_empty()).ok_or_else(|| {
            GatewayError::SchemaMismatch(format!("{SUBMIT_ORDER_PATH}: missing redirect_url"))
        })?;

        Ok(OrderSubmission {
            tracking_id,
            merchant_reference: parsed
                .merchant_reference
                .unwrap_or_else(|| body.id.to_string()),
            redirect_url,
        })
    }

    // GET /api/Transactions/GetTransactionStatus?orderTrackingId={id}
    #[instrument(skip(self, token), fields(method = "GET", path = TRANSACTION_STATUS_PATH))]
    pub async fn get_transaction_status(
        &self,
        token: &SecretString,
        tracking_id: &str,
    ) -> Result<ParsedStatus, GatewayError> {
        info!(
            target: "pesapal",
            method = "GET",
            path = TRANSACTION_STATUS_PATH,
            payment_tracking_id = %tracking_id,
            "pesapal request"
        );

        let req = self
            .http
            .get(self.url(TRANSACTION_STATUS_PATH))
            .query(&[("orderTrackingId", tracking_id)])
            .bearer_auth(token.expose_secret());
        let text = self.send(TRANSACTION_STATUS_PATH, req).await?;

        let parsed: TransactionStatusResponse = Self::decode(TRANSACTION_STATUS_PATH, &text)?;
        ParsedStatus::from_response(parsed, &text)
    }
}
