// Customer notification of freshly claimed voucher codes.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::settings::SmsSettings;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("sms request failed: {0}")]
    Http(String),
    #[error("sms provider rejected message: status={status} body={body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, phone_number: &str, message: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    message: &'a str,
    recipients: Vec<String>,
}

#[derive(Deserialize)]
struct SmsResponse {
    #[serde(default)]
    status: Option<String>,
}

/// Sends messages through the SMS HTTP API.
pub struct SmsNotifier {
    http: Client,
    api_url: String,
    api_key: SecretString,
    default_country_prefix: String,
}

impl SmsNotifier {
    pub fn new(cfg: &SmsSettings, timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_url: cfg.api_url.clone(),
            api_key: SecretString::from(cfg.api_key.clone()),
            default_country_prefix: cfg.default_country_prefix.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    #[instrument(skip_all)]
    async fn send(&self, phone_number: &str, message: &str) -> Result<(), NotifyError> {
        let recipient = format_recipient(phone_number, &self.default_country_prefix);
        let body = SmsRequest {
            message,
            recipients: vec![recipient.clone()],
        };

        let resp = self
            .http
            .post(&self.api_url)
            .header("Accept", "application/json")
            .header("X-API-Key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        if let Ok(SmsResponse { status: Some(s) }) = serde_json::from_str::<SmsResponse>(&text) {
            if !s.eq_ignore_ascii_case("success") {
                return Err(NotifyError::Rejected {
                    status: status.as_u16(),
                    body: text,
                });
            }
        }

        info!(recipient = %recipient, "SMS sent");
        Ok(())
    }
}

/// Used when no SMS API is configured: the message only goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, phone_number: &str, message: &str) -> Result<(), NotifyError> {
        info!(recipient = %phone_number, message = %message, "SMS delivery not configured, message logged");
        Ok(())
    }
}

pub fn build_notifier(cfg: &SmsSettings, timeout: Duration) -> Result<Arc<dyn Notifier>, NotifyError> {
    if cfg.is_configured() {
        Ok(Arc::new(SmsNotifier::new(cfg, timeout)?))
    } else {
        warn!("SMS_API_URL or SMS_API_KEY unset, voucher codes will only be logged");
        Ok(Arc::new(LogNotifier))
    }
}

/// Normalizes a phone number to `+<country><number>` for the SMS API.
pub fn format_recipient(phone_number: &str, default_country_prefix: &str) -> String {
    let cleaned: String = phone_number
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if let Some(local) = cleaned.strip_prefix('0') {
        return format!("+{default_country_prefix}{local}");
    }
    if cleaned.starts_with('+') {
        return cleaned;
    }
    if cleaned.starts_with(default_country_prefix) {
        return format!("+{cleaned}");
    }
    format!("+{default_country_prefix}{cleaned}")
}

pub fn voucher_message(code: &str, package_name: &str, duration_hours: u32) -> String {
    let validity = if duration_hours % 24 == 0 {
        match duration_hours / 24 {
            1 => "1 day".to_string(),
            days => format!("{days} days"),
        }
    } else if duration_hours == 1 {
        "1 hour".to_string()
    } else {
        format!("{duration_hours} hours")
    };
    format!(
        "Thank you for buying {package_name} from VoucherWave. Your WIFI voucher code is {code}. It is valid for {validity} from first use."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> SmsSettings {
        SmsSettings {
            api_url: format!("{}/api/v1/client/send-sms", server.uri()),
            api_key: "sms-key".to_string(),
            default_country_prefix: "256".to_string(),
        }
    }

    #[test]
    fn test_format_recipient() {
        assert_eq!(format_recipient("+256712345678", "256"), "+256712345678");
        assert_eq!(format_recipient("0712 345 678", "256"), "+256712345678");
        assert_eq!(format_recipient("256712345678", "256"), "+256712345678");
        assert_eq!(format_recipient("712345678", "256"), "+256712345678");
    }

    #[test]
    fn test_voucher_message() {
        let msg = voucher_message("BW-001", "Bronze Wave", 168);
        assert!(msg.contains("BW-001"));
        assert!(msg.contains("7 days"));
        assert!(voucher_message("X", "Hourly", 1).contains("1 hour"));
        assert!(voucher_message("X", "Half day", 12).contains("12 hours"));
    }

    #[tokio::test]
    async fn test_sms_notifier_sends_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/client/send-sms"))
            .and(header("X-API-Key", "sms-key"))
            .and(body_json(json!({
                "message": "hello",
                "recipients": ["+256712345678"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = SmsNotifier::new(&settings(&server), Duration::from_secs(5)).unwrap();
        notifier.send("0712345678", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_sms_notifier_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "message": "insufficient balance"
            })))
            .mount(&server)
            .await;

        let notifier = SmsNotifier::new(&settings(&server), Duration::from_secs(5)).unwrap();
        let err = notifier.send("+256712345678", "hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 200, .. }));
    }
}
