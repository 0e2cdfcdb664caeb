// Pesapal v3 DTOs and the validated status boundary
use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pesapal::errors::{GatewayError, PesapalErrorBody};

#[derive(Serialize)]
pub struct TokenRequest<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "expiryDate")]
    pub expiry_date: Option<String>,
    #[serde(default)]
    pub error: Option<PesapalErrorBody>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Bearer token with its absolute expiry.
#[derive(Debug)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RegisterIpnRequest<'a> {
    pub url: &'a str,
    pub ipn_notification_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RegisterIpnResponse {
    #[serde(default)]
    pub ipn_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<PesapalErrorBody>,
}

/// Order to be charged, as the orchestrator describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub merchant_reference: String,
    pub amount: u64,
    pub currency: String,
    pub description: String,
    pub callback_url: String,
    pub phone_number: String,
    pub country_code: String,
}

#[derive(Debug, Serialize)]
pub struct BillingAddress<'a> {
    pub phone_number: &'a str,
    pub country_code: &'a str,
    pub first_name: &'static str,
    pub last_name: &'static str,
}

// Body of POST /api/Transactions/SubmitOrderRequest
#[derive(Debug, Serialize)]
pub struct SubmitOrderBody<'a> {
    pub id: &'a str,
    pub currency: &'a str,
    pub amount: u64,
    pub description: &'a str,
    pub callback_url: &'a str,
    pub notification_id: &'a str,
    pub billing_address: BillingAddress<'a>,
}

impl<'a> SubmitOrderBody<'a> {
    pub fn new(order: &'a OrderRequest, notification_id: &'a str) -> Self {
        Self {
            id: &order.merchant_reference,
            currency: &order.currency,
            amount: order.amount,
            description: &order.description,
            callback_url: &order.callback_url,
            notification_id,
            billing_address: BillingAddress {
                phone_number: &order.phone_number,
                country_code: &order.country_code,
                first_name: "VoucherWave",
                last_name: "Customer",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitOrderResponse {
    #[serde(default)]
    pub order_tracking_id: Option<String>,
    #[serde(default)]
    pub merchant_reference: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub error: Option<PesapalErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmission {
    pub tracking_id: String,
    pub merchant_reference: String,
    pub redirect_url: String,
}

// Body of GET /api/Transactions/GetTransactionStatus
#[derive(Debug, Deserialize)]
pub struct TransactionStatusResponse {
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub confirmation_code: Option<String>,
    #[serde(default)]
    pub payment_status_description: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payment_account: Option<String>,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub merchant_reference: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub error: Option<PesapalErrorBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
    Reversed,
    Invalid,
}

impl PaymentStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(PaymentStatus::Completed),
            "pending" => Some(PaymentStatus::Pending),
            "failed" => Some(PaymentStatus::Failed),
            "reversed" => Some(PaymentStatus::Reversed),
            "invalid" => Some(PaymentStatus::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "Completed",
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Reversed => "Reversed",
            PaymentStatus::Invalid => "Invalid",
        }
    }

    /// Numeric code Pesapal pairs with each description. Pending has none.
    pub fn expected_code(&self) -> Option<i64> {
        match self {
            PaymentStatus::Invalid => Some(0),
            PaymentStatus::Completed => Some(1),
            PaymentStatus::Failed => Some(2),
            PaymentStatus::Reversed => Some(3),
            PaymentStatus::Pending => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedStatus {
    #[serde(rename = "paymentStatusDescription")]
    pub status: PaymentStatus,
    pub status_code: Option<i64>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub merchant_reference: Option<String>,
    pub confirmation_code: Option<String>,
    pub payment_method: Option<String>,
    pub payment_account: Option<String>,
    pub description: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
}

impl ParsedStatus {
    pub fn from_response(
        response: TransactionStatusResponse,
        raw: &str,
    ) -> Result<Self, GatewayError> {
        let error = response.error.filter(PesapalErrorBody::is_present);

        // Pesapal attaches an error object to non-completed payments, so a
        // recognised description wins over it.
        let description = match response.payment_status_description.as_deref() {
            Some(d) if !d.trim().is_empty() => d,
            _ => {
                return Err(match error {
                    Some(error) => GatewayError::Api {
                        message: error.describe(),
                        raw_response: raw.to_string(),
                        status: None,
                    },
                    None => GatewayError::SchemaMismatch(
                        "missing payment_status_description".to_string(),
                    ),
                })
            }
        };

        let status = PaymentStatus::parse(description).ok_or_else(|| {
            GatewayError::SchemaMismatch(format!("unknown payment status {description:?}"))
        })?;

        if let (Some(expected), Some(actual)) = (status.expected_code(), response.status_code) {
            if expected != actual {
                return Err(GatewayError::SchemaMismatch(format!(
                    "status_code {actual} does not match {status}"
                )));
            }
        }

        let created_date = match response.created_date.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_timestamp(raw)?),
            _ => None,
        };

        Ok(Self {
            status,
            status_code: response.status_code,
            amount: response.amount,
            currency: response.currency.filter(|c| !c.is_empty()),
            merchant_reference: response.merchant_reference.filter(|r| !r.is_empty()),
            confirmation_code: response.confirmation_code.filter(|c| !c.is_empty()),
            payment_method: response.payment_method.filter(|m| !m.is_empty()),
            payment_account: response.payment_account.filter(|a| !a.is_empty()),
            description: response.description.filter(|d| !d.is_empty()),
            created_date,
        })
    }
}

/// Pesapal timestamps are RFC 3339, or naive local-less times read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, GatewayError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| GatewayError::SchemaMismatch(format!("invalid timestamp {raw:?}")))
}
