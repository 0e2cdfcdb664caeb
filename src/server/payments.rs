// Customer-facing and gateway-facing routes.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{info, warn};
use url::Url;

use super::AppState;
use crate::clock::Clock;
use crate::orchestrator::{ConfirmationOutcome, PurchaseOutcome};
use crate::pesapal::types::{ParsedStatus, PaymentStatus};
use crate::pesapal::webhook::{handle_notification, IpnAck, IpnNotification, WebhookError};
use crate::vouchers::{Membership, MembershipSignup, VoucherError};

pub(super) async fn notification_post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IpnAck>, WebhookError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let ack = handle_notification(&payload, "POST", &state.orchestrator).await?;
    Ok(Json(ack))
}

pub(super) async fn notification_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<IpnAck>, WebhookError> {
    let payload: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let ack = handle_notification(&Value::Object(payload), "GET", &state.orchestrator).await?;
    Ok(Json(ack))
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusQuery {
    #[serde(
        default,
        rename = "trackingId",
        alias = "OrderTrackingId",
        alias = "orderTrackingId"
    )]
    tracking_id: Option<String>,
}

pub(super) async fn payment_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ParsedStatus>, VoucherError> {
    let tracking_id = query
        .tracking_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| VoucherError::invalid("trackingId is required"))?;

    let status = state.orchestrator.check_status(tracking_id).await?;
    // Pesapal answers unknown tracking ids with an Invalid status and no order.
    if status.status == PaymentStatus::Invalid && status.merchant_reference.is_none() {
        return Err(VoucherError::not_found("transaction", tracking_id));
    }
    Ok(Json(status))
}

/// Where Pesapal sends the customer back. Confirms the payment the same way
/// the IPN does and forwards to the storefront result page.
pub(super) async fn payment_callback(
    State(state): State<AppState>,
    Query(query): Query<IpnNotification>,
) -> Redirect {
    let hint = query
        .merchant_reference
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    let Some(tracking_id) = query
        .tracking_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return redirect_to(
            &state.failure_url,
            "Unknown",
            hint,
            Some("Payment session incomplete. Order Tracking ID is missing."),
        );
    };

    match state.orchestrator.confirm_payment(tracking_id, hint).await {
        Ok(confirmation) => {
            let status = confirmation.status.status.as_str();
            let reference = confirmation.merchant_reference.as_deref().or(hint);
            match confirmation.outcome {
                ConfirmationOutcome::Claimed(_) | ConfirmationOutcome::AlreadyClaimed(_) => {
                    info!(payment_tracking_id = %tracking_id, "Customer returned from completed payment");
                    redirect_to(&state.success_url, status, reference, None)
                }
                ConfirmationOutcome::OutOfStock { package_slug } => {
                    let err = VoucherError::NoVouchersAvailable { package_slug };
                    redirect_to(
                        &state.failure_url,
                        status,
                        reference,
                        Some(&err.user_message()),
                    )
                }
                ConfirmationOutcome::NotCompleted(_) => {
                    redirect_to(&state.failure_url, status, reference, None)
                }
                ConfirmationOutcome::UnknownOrder => redirect_to(
                    &state.failure_url,
                    status,
                    reference,
                    Some("We could not match this payment to an order."),
                ),
            }
        }
        Err(e) => {
            warn!(payment_tracking_id = %tracking_id, error = %e, "Payment verification failed on callback");
            redirect_to(&state.failure_url, "Unknown", hint, Some(&e.user_message()))
        }
    }
}

fn redirect_to(base: &Url, status: &str, reference: Option<&str>, error: Option<&str>) -> Redirect {
    let mut url = base.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("status", status);
        if let Some(reference) = reference {
            query.append_pair("ref", reference);
        }
        if let Some(error) = error {
            query.append_pair("error", error);
        }
    }
    Redirect::to(url.as_str())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PurchaseRequest {
    phone_number: String,
    package_slug: String,
    #[serde(default)]
    force_purchase: bool,
}

pub(super) async fn purchase(
    State(state): State<AppState>,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<PurchaseOutcome>, VoucherError> {
    let outcome = state
        .orchestrator
        .purchase(&req.phone_number, &req.package_slug, req.force_purchase)
        .await?;
    Ok(Json(outcome))
}

pub(super) async fn membership_signup(
    State(state): State<AppState>,
    Json(signup): Json<MembershipSignup>,
) -> Result<(StatusCode, Json<Membership>), VoucherError> {
    let membership = state.store.create_membership(signup, state.clock.now())?;
    Ok((StatusCode::CREATED, Json(membership)))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{app, empty_request, json_body, json_request, send};
    use crate::pesapal::types::PaymentStatus;
    use axum::http::{header, StatusCode};
    use serde_json::json;

    const PHONE: &str = "+256712345678";

    fn location(response: &axum::http::Response<axum::body::Body>) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_purchase_then_callback_and_ipn() {
        let (h, app) = app(3);

        let response = send(
            &app,
            json_request(
                "POST",
                "/purchase",
                json!({ "phoneNumber": PHONE, "packageSlug": "bronze-wave" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "redirect");
        assert_eq!(body["trackingId"], "T-1");
        let reference = body["merchantReference"].as_str().unwrap().to_string();

        h.gateway.set_status("T-1", PaymentStatus::Completed);

        let response = send(
            &app,
            empty_request(
                "GET",
                &format!("/payment-callback?OrderTrackingId=T-1&OrderMerchantReference={reference}"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            location(&response),
            format!("https://wifi.example.com/payment-success?status=Completed&ref={reference}")
        );

        let response = send(
            &app,
            json_request(
                "POST",
                "/payment-notifications",
                json!({
                    "OrderTrackingId": "T-1",
                    "OrderMerchantReference": reference,
                    "OrderNotificationType": "IPNCHANGE"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let ack = json_body(response).await;
        assert_eq!(
            ack,
            json!({
                "status": "OK",
                "trackingId": "T-1",
                "notificationType": "IPNCHANGE",
                "merchantReference": reference
            })
        );

        assert_eq!(h.store.list_packages().unwrap()[0].available_vouchers, 2);
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purchase_rejects_short_phone() {
        let (h, app) = app(3);
        let response = send(
            &app,
            json_request(
                "POST",
                "/purchase",
                json!({ "phoneNumber": "123", "packageSlug": "bronze-wave" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "error": "Phone number seems too short." })
        );
        assert_eq!(h.gateway.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_ipn_get_and_bad_payloads() {
        let (_h, app) = app(1);

        let response = send(
            &app,
            empty_request(
                "GET",
                "/payment-notifications?OrderTrackingId=T-9&OrderNotificationType=IPNCHANGE",
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["trackingId"], "T-9");

        let response = send(
            &app,
            json_request("POST", "/payment-notifications", json!({ "foo": "bar" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            axum::http::Request::builder()
                .method("POST")
                .uri("/payment-notifications")
                .body(axum::body::Body::from("{not json"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_payment_status_endpoint() {
        let (h, app) = app(1);

        let response = send(&app, empty_request("GET", "/payment-status")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        h.gateway.set_status("T-5", PaymentStatus::Invalid);
        let response = send(&app, empty_request("GET", "/payment-status?trackingId=T-5")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        h.gateway.set_status("T-6", PaymentStatus::Completed);
        h.gateway.set_reference("T-6", "VW-6");
        let response = send(&app, empty_request("GET", "/payment-status?trackingId=T-6")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["paymentStatusDescription"], "Completed");
        assert_eq!(body["statusCode"], 1);
        assert_eq!(body["merchantReference"], "VW-6");

        *h.gateway.status_unavailable.lock().unwrap() = true;
        let response = send(&app, empty_request("GET", "/payment-status?trackingId=T-6")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_callback_failure_paths() {
        let (h, app) = app(0);

        let response = send(&app, empty_request("GET", "/payment-callback")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(location(&response)
            .starts_with("https://wifi.example.com/payment-failure?status=Unknown&error="));

        let body = json_body(
            send(
                &app,
                json_request(
                    "POST",
                    "/purchase",
                    json!({ "phoneNumber": PHONE, "packageSlug": "bronze-wave" }),
                ),
            )
            .await,
        )
        .await;
        let reference = body["merchantReference"].as_str().unwrap().to_string();

        let response = send(&app, empty_request("GET", "/payment-callback?trackingId=T-1")).await;
        assert_eq!(
            location(&response),
            format!("https://wifi.example.com/payment-failure?status=Pending&ref={reference}")
        );

        h.gateway.set_status("T-1", PaymentStatus::Completed);
        let response = send(&app, empty_request("GET", "/payment-callback?trackingId=T-1")).await;
        let target = location(&response);
        assert!(target.starts_with(&format!(
            "https://wifi.example.com/payment-failure?status=Completed&ref={reference}&error="
        )));
    }

    #[tokio::test]
    async fn test_membership_signup() {
        let (h, app) = app(0);
        let response = send(
            &app,
            json_request(
                "POST",
                "/memberships",
                json!({
                    "name": "Amina",
                    "phoneNumber": PHONE,
                    "username": "amina",
                    "password": "s3cret",
                    "documentReference": "ID-123"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "pending");
        assert!(body.get("password").is_none());
        assert_eq!(h.store.list_memberships().unwrap().len(), 1);
    }
}
