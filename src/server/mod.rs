// HTTP surface: storefront, Pesapal callbacks and the admin JSON API.

mod admin;
mod payments;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::clock::Clock;
use crate::orchestrator::PaymentOrchestrator;
use crate::vouchers::VoucherStore;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PaymentOrchestrator,
    pub store: VoucherStore,
    pub clock: Arc<dyn Clock>,
    pub(crate) success_url: Url,
    pub(crate) failure_url: Url,
}

impl AppState {
    pub fn new(
        orchestrator: PaymentOrchestrator,
        clock: Arc<dyn Clock>,
        public_base_url: &str,
    ) -> anyhow::Result<Self> {
        let base = public_base_url.trim_end_matches('/');
        Ok(Self {
            store: orchestrator.store().clone(),
            orchestrator,
            clock,
            success_url: Url::parse(&format!("{base}/payment-success"))?,
            failure_url: Url::parse(&format!("{base}/payment-failure"))?,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/payment-notifications",
            post(payments::notification_post).get(payments::notification_get),
        )
        .route("/payment-status", get(payments::payment_status))
        .route("/payment-callback", get(payments::payment_callback))
        .route("/purchase", post(payments::purchase))
        .route("/memberships", post(payments::membership_signup))
        .route(
            "/admin/packages",
            get(admin::list_packages).post(admin::create_package),
        )
        .route(
            "/admin/packages/:slug",
            get(admin::get_package)
                .put(admin::update_package)
                .delete(admin::delete_package),
        )
        .route(
            "/admin/packages/:slug/vouchers",
            get(admin::list_vouchers).post(admin::add_voucher),
        )
        .route(
            "/admin/packages/:slug/vouchers/upload",
            post(admin::upload_vouchers),
        )
        .route(
            "/admin/packages/:slug/vouchers/:id",
            put(admin::update_voucher).delete(admin::delete_voucher),
        )
        .route("/admin/vouchers", get(admin::list_all_vouchers))
        .route("/admin/vouchers/active", get(admin::list_active_vouchers))
        .route("/admin/memberships", get(admin::list_memberships))
        .route(
            "/admin/memberships/:id/approve",
            post(admin::approve_membership),
        )
        .route("/admin/memberships/:id/reject", post(admin::reject_membership))
        .route(
            "/admin/promotions",
            get(admin::list_promotions).post(admin::add_promotion),
        )
        .route("/admin/promotions/:id", delete(admin::delete_promotion))
        .route(
            "/admin/notifications",
            get(admin::list_notifications).delete(admin::clear_notifications),
        )
        .with_state(state)
}

pub async fn run_server(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::orchestrator::testing::{harness, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, Response};
    use tower::ServiceExt;

    pub fn app(vouchers: usize) -> (Harness, Router) {
        let h = harness(vouchers);
        let state = AppState::new(
            h.orchestrator.clone(),
            h.clock.clone(),
            "https://wifi.example.com/",
        )
        .unwrap();
        (h, router(state))
    }

    pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
        app.clone().oneshot(request).await.unwrap()
    }

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{app, empty_request, send};
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let (_h, app) = app(0);
        let response = send(&app, empty_request("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_state_rejects_bad_base_url() {
        let h = crate::orchestrator::testing::harness(0);
        assert!(AppState::new(h.orchestrator.clone(), h.clock.clone(), "not a url").is_err());
    }
}
