// Pesapal IPN handling: audit, verify against the gateway, then claim.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::gateway_counter_inc;
use crate::orchestrator::{ConfirmationOutcome, PaymentOrchestrator};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("malformed notification payload: {0}")]
    MalformedPayload(String),
    #[error("notification carries no OrderTrackingId")]
    MissingTrackingId,
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/// IPN fields as Pesapal sends them, in a JSON body or query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpnNotification {
    #[serde(default, rename = "OrderTrackingId", alias = "orderTrackingId", alias = "trackingId")]
    pub tracking_id: Option<String>,
    #[serde(
        default,
        rename = "OrderMerchantReference",
        alias = "orderMerchantReference",
        alias = "merchantReference"
    )]
    pub merchant_reference: Option<String>,
    #[serde(
        default,
        rename = "OrderNotificationType",
        alias = "orderNotificationType",
        alias = "notificationType"
    )]
    pub notification_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpnAck {
    pub status: &'static str,
    pub tracking_id: String,
    pub notification_type: String,
    pub merchant_reference: String,
}

/// Processes one IPN delivery. Anything past payload validation is
/// acknowledged so Pesapal stops redelivering; failures end up in the logs
/// and the notification audit log.
#[instrument(skip(payload, orchestrator))]
pub async fn handle_notification(
    payload: &Value,
    source: &str,
    orchestrator: &PaymentOrchestrator,
) -> Result<IpnAck, WebhookError> {
    if !payload.is_object() {
        return Err(WebhookError::MalformedPayload(
            "expected a JSON object".to_string(),
        ));
    }
    let ipn: IpnNotification = serde_json::from_value(payload.clone())
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let tracking_id = ipn
        .tracking_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(WebhookError::MissingTrackingId)?
        .to_string();
    let merchant_reference = ipn
        .merchant_reference
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    let notification_type = ipn
        .notification_type
        .clone()
        .unwrap_or_else(|| "IPNCHANGE".to_string());

    gateway_counter_inc!("pesapal.ipn.received", "notification_type" => notification_type);

    let store = orchestrator.store();
    if let Err(e) = store.append_notification(source, payload.clone(), orchestrator.clock().now()) {
        error!(payment_tracking_id = %tracking_id, error = %e, "Failed to record notification");
    }

    let mut ack = IpnAck {
        status: "OK",
        tracking_id: tracking_id.clone(),
        notification_type,
        merchant_reference: merchant_reference.unwrap_or_default().to_string(),
    };

    match orchestrator.confirm_payment(&tracking_id, merchant_reference).await {
        Ok(confirmation) => {
            if ack.merchant_reference.is_empty() {
                if let Some(reference) = confirmation.merchant_reference.as_deref() {
                    ack.merchant_reference = reference.to_string();
                }
            }
            match &confirmation.outcome {
                ConfirmationOutcome::Claimed(voucher) => info!(
                    payment_tracking_id = %tracking_id,
                    voucher_id = %voucher.voucher_id,
                    package_slug = %voucher.package_slug,
                    "Voucher claimed from IPN"
                ),
                ConfirmationOutcome::AlreadyClaimed(voucher) => info!(
                    payment_tracking_id = %tracking_id,
                    voucher_id = %voucher.voucher_id,
                    "IPN replay for fulfilled order"
                ),
                ConfirmationOutcome::OutOfStock { package_slug } => error!(
                    payment_tracking_id = %tracking_id,
                    package_slug = %package_slug,
                    "Paid order could not be fulfilled, package out of stock"
                ),
                ConfirmationOutcome::NotCompleted(status) => info!(
                    payment_tracking_id = %tracking_id,
                    payment_status = %status,
                    "IPN for payment that is not completed"
                ),
                ConfirmationOutcome::UnknownOrder => warn!(
                    payment_tracking_id = %tracking_id,
                    "IPN for unknown order"
                ),
            }
            gateway_counter_inc!(
                "pesapal.ipn.processed",
                "outcome" => confirmation.outcome.label()
            );
        }
        Err(e) => {
            error!(
                payment_tracking_id = %tracking_id,
                error = %e,
                "Failed to verify payment for IPN"
            );
            gateway_counter_inc!("pesapal.ipn.processed", "outcome" => "verification_failed");
        }
    }

    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::harness;
    use crate::orchestrator::PurchaseOutcome;
    use crate::pesapal::types::PaymentStatus;
    use serde_json::json;

    async fn purchase(h: &crate::orchestrator::testing::Harness) -> (String, String) {
        match h
            .orchestrator
            .purchase("+256712345678", "bronze-wave", false)
            .await
            .unwrap()
        {
            PurchaseOutcome::Redirect {
                merchant_reference,
                tracking_id,
                ..
            } => (merchant_reference, tracking_id),
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replayed_ipn_claims_once() {
        let h = harness(3);
        let (reference, tracking_id) = purchase(&h).await;
        h.gateway.set_status(&tracking_id, PaymentStatus::Completed);

        let payload = json!({
            "OrderTrackingId": tracking_id,
            "OrderMerchantReference": reference,
            "OrderNotificationType": "IPNCHANGE"
        });
        for _ in 0..3 {
            let ack = handle_notification(&payload, "POST", &h.orchestrator)
                .await
                .unwrap();
            assert_eq!(
                ack,
                IpnAck {
                    status: "OK",
                    tracking_id: tracking_id.clone(),
                    notification_type: "IPNCHANGE".to_string(),
                    merchant_reference: reference.clone(),
                }
            );
        }

        assert_eq!(h.store.list_packages().unwrap()[0].available_vouchers, 2);
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(h.store.list_notifications().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_payload_status_is_not_trusted() {
        let h = harness(3);
        let (_, tracking_id) = purchase(&h).await;

        let payload = json!({
            "OrderTrackingId": tracking_id,
            "payment_status_description": "Completed"
        });
        let ack = handle_notification(&payload, "POST", &h.orchestrator)
            .await
            .unwrap();
        assert!(ack.merchant_reference.starts_with("VW-"));
        assert_eq!(h.store.list_packages().unwrap()[0].available_vouchers, 3);
    }

    #[tokio::test]
    async fn test_missing_tracking_id_and_malformed_payload() {
        let h = harness(1);
        let err = handle_notification(
            &json!({ "OrderMerchantReference": "VW-1" }),
            "POST",
            &h.orchestrator,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WebhookError::MissingTrackingId));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = handle_notification(&json!(["T-1"]), "POST", &h.orchestrator)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MalformedPayload(_)));

        let err = handle_notification(&json!({ "OrderTrackingId": 42 }), "POST", &h.orchestrator)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MalformedPayload(_)));

        assert!(h.store.list_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_is_acknowledged() {
        let h = harness(1);
        let (_, tracking_id) = purchase(&h).await;
        *h.gateway.status_unavailable.lock().unwrap() = true;

        let ack = handle_notification(
            &json!({ "orderTrackingId": tracking_id, "orderNotificationType": "IPNCHANGE" }),
            "GET",
            &h.orchestrator,
        )
        .await
        .unwrap();
        assert_eq!(ack.status, "OK");
        assert_eq!(ack.merchant_reference, "");
        assert_eq!(h.store.list_notifications().unwrap()[0].source, "GET");
    }
}
