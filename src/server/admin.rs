// Admin JSON API. Unauthenticated; expected to sit behind the operator's proxy.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::clock::Clock;
use crate::vouchers::{
    Membership, MembershipStatus, NewPromotion, NotificationLogEntry, Package, PackageSummary,
    Promotion, Voucher, VoucherError, VoucherUpdate, VoucherView, VoucherWithPackage,
};

type ApiResult<T> = Result<Json<T>, VoucherError>;

pub(super) async fn list_packages(State(state): State<AppState>) -> ApiResult<Vec<PackageSummary>> {
    Ok(Json(state.store.list_packages()?))
}

pub(super) async fn create_package(
    State(state): State<AppState>,
    Json(package): Json<Package>,
) -> Result<(StatusCode, Json<Package>), VoucherError> {
    let package = state.store.create_package(package)?;
    Ok((StatusCode::CREATED, Json(package)))
}

pub(super) async fn get_package(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Package> {
    Ok(Json(state.store.get_package(&slug)?))
}

pub(super) async fn update_package(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(package): Json<Package>,
) -> ApiResult<Package> {
    Ok(Json(state.store.update_package(&slug, package)?))
}

pub(super) async fn delete_package(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<StatusCode, VoucherError> {
    state.store.delete_package(&slug)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_vouchers(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Vec<VoucherView>> {
    Ok(Json(state.store.list_vouchers(&slug, state.clock.now())?))
}

#[derive(Debug, Deserialize)]
pub(super) struct NewVoucher {
    code: String,
}

pub(super) async fn add_voucher(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<NewVoucher>,
) -> Result<(StatusCode, Json<Voucher>), VoucherError> {
    let voucher = state.store.add_voucher(&slug, &req.code, state.clock.now())?;
    Ok((StatusCode::CREATED, Json(voucher)))
}

#[derive(Debug, Serialize)]
pub(super) struct UploadSummary {
    added: usize,
    message: String,
}

/// Bulk upload from a CSV export: one header row, then one voucher per row.
pub(super) async fn upload_vouchers(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<UploadSummary>), VoucherError> {
    let codes = parse_voucher_csv(&body)?;
    let added = state
        .store
        .add_vouchers_bulk(&slug, &codes, state.clock.now())?
        .len();
    Ok((
        StatusCode::CREATED,
        Json(UploadSummary {
            added,
            message: format!("Successfully uploaded {added} vouchers."),
        }),
    ))
}

/// Codes from the `code` column, or the first column when there is none.
fn parse_voucher_csv(text: &str) -> Result<Vec<String>, VoucherError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let column = rdr
        .headers()
        .map_err(invalid_csv)?
        .iter()
        .position(|h| {
            let h = h.to_ascii_lowercase();
            h == "code" || h == "voucher" || h == "voucher code"
        })
        .unwrap_or(0);

    let mut codes = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(invalid_csv)?;
        if let Some(code) = record.get(column).filter(|c| !c.is_empty()) {
            codes.push(code.to_string());
        }
    }
    Ok(codes)
}

fn invalid_csv(e: csv::Error) -> VoucherError {
    VoucherError::invalid(format!("Could not read the voucher CSV: {e}"))
}

pub(super) async fn update_voucher(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, String)>,
    Json(update): Json<VoucherUpdate>,
) -> ApiResult<Voucher> {
    Ok(Json(state.store.update_voucher(&slug, &id, update)?))
}

pub(super) async fn delete_voucher(
    State(state): State<AppState>,
    Path((slug, id)): Path<(String, String)>,
) -> Result<StatusCode, VoucherError> {
    state.store.delete_voucher(&slug, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_all_vouchers(
    State(state): State<AppState>,
) -> ApiResult<Vec<VoucherWithPackage>> {
    Ok(Json(state.store.list_all_vouchers(state.clock.now())?))
}

pub(super) async fn list_active_vouchers(
    State(state): State<AppState>,
) -> ApiResult<Vec<VoucherWithPackage>> {
    Ok(Json(state.store.list_active_vouchers(state.clock.now())?))
}

pub(super) async fn list_memberships(State(state): State<AppState>) -> ApiResult<Vec<Membership>> {
    Ok(Json(state.store.list_memberships()?))
}

pub(super) async fn approve_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Membership> {
    Ok(Json(
        state
            .store
            .set_membership_status(&id, MembershipStatus::Approved)?,
    ))
}

pub(super) async fn reject_membership(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Membership> {
    Ok(Json(
        state
            .store
            .set_membership_status(&id, MembershipStatus::Rejected)?,
    ))
}

pub(super) async fn list_promotions(State(state): State<AppState>) -> ApiResult<Vec<Promotion>> {
    Ok(Json(state.store.list_promotions()?))
}

pub(super) async fn add_promotion(
    State(state): State<AppState>,
    Json(promotion): Json<NewPromotion>,
) -> Result<(StatusCode, Json<Promotion>), VoucherError> {
    let promotion = state.store.add_promotion(promotion)?;
    Ok((StatusCode::CREATED, Json(promotion)))
}

pub(super) async fn delete_promotion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, VoucherError> {
    state.store.delete_promotion(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_notifications(
    State(state): State<AppState>,
) -> ApiResult<Vec<NotificationLogEntry>> {
    Ok(Json(state.store.list_notifications()?))
}

pub(super) async fn clear_notifications(
    State(state): State<AppState>,
) -> ApiResult<serde_json::Value> {
    let removed = state.store.clear_notifications()?;
    Ok(Json(json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{app, empty_request, json_body, json_request, send};
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    #[test]
    fn test_parse_voucher_csv() {
        assert_eq!(
            parse_voucher_csv("Code,Profile\r\nBW-010,bronze\r\n\r\n BW-011 ,bronze\n").unwrap(),
            vec!["BW-010", "BW-011"]
        );
        assert_eq!(
            parse_voucher_csv("name,voucher\nx,\"GW-1\"\ny,GW-2").unwrap(),
            vec!["GW-1", "GW-2"]
        );
        assert!(parse_voucher_csv("code\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_voucher_csv_keeps_quoted_commas() {
        assert_eq!(
            parse_voucher_csv("code,profile\n\"BW,001\",bronze\nBW-002\n").unwrap(),
            vec!["BW,001", "BW-002"]
        );
        assert_eq!(
            parse_voucher_csv("profile\n\"bronze, weekly\"\n").unwrap(),
            vec!["bronze, weekly"]
        );
    }

    #[tokio::test]
    async fn test_package_crud() {
        let (_h, app) = app(2);

        let response = send(
            &app,
            json_request(
                "POST",
                "/admin/packages",
                json!({
                    "slug": "gold-wave",
                    "name": "Gold Wave",
                    "price": 20000,
                    "durationHours": 720,
                    "details": ["30 days", "Unlimited"]
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&app, empty_request("GET", "/admin/packages")).await;
        let packages = json_body(response).await;
        let packages = packages.as_array().unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0]["slug"], "bronze-wave");
        assert_eq!(packages[0]["availableVouchers"], 2);
        assert_eq!(packages[1]["availableVouchers"], 0);

        let response = send(
            &app,
            json_request(
                "PUT",
                "/admin/packages/gold-wave",
                json!({
                    "slug": "ignored",
                    "name": "Gold Wave+",
                    "price": 25000,
                    "durationHours": 720
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["slug"], "gold-wave");

        let response = send(&app, empty_request("DELETE", "/admin/packages/gold-wave")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&app, empty_request("GET", "/admin/packages/gold-wave")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_voucher_admin_flow() {
        let (h, app) = app(1);

        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/admin/packages/bronze-wave/vouchers/upload")
                .header("content-type", "text/csv")
                .body(Body::from("code\nBW-100\nBW-101\n"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["added"], 2);

        let response = send(
            &app,
            json_request(
                "POST",
                "/admin/packages/bronze-wave/vouchers",
                json!({ "code": "BW-102" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = json_body(response).await["id"].as_str().unwrap().to_string();

        let response = send(
            &app,
            json_request(
                "PUT",
                &format!("/admin/packages/bronze-wave/vouchers/{id}"),
                json!({ "code": "BW-102", "usedAt": h.clock.now() }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, empty_request("GET", "/admin/vouchers/active")).await;
        let active = json_body(response).await;
        assert_eq!(active.as_array().unwrap().len(), 1);
        assert_eq!(active[0]["code"], "BW-102");
        assert_eq!(active[0]["status"], "Active");
        assert_eq!(active[0]["expiry"], "in 7 days");

        let response = send(&app, empty_request("GET", "/admin/packages/bronze-wave/vouchers")).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 4);

        let response = send(
            &app,
            empty_request("DELETE", &format!("/admin/packages/bronze-wave/vouchers/{id}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(
            &app,
            empty_request("DELETE", &format!("/admin/packages/bronze-wave/vouchers/{id}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/admin/packages/missing/vouchers/upload")
                .body(Body::from("code\nX-1\n"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_memberships_promotions_and_notifications() {
        let (h, app) = app(0);
        let membership = h
            .store
            .create_membership(
                crate::vouchers::MembershipSignup {
                    name: "Amina".into(),
                    phone_number: "+256712345678".into(),
                    username: "amina".into(),
                    password: secrecy::SecretString::from("s3cret".to_string()),
                    document_reference: "ID-1".into(),
                },
                h.clock.now(),
            )
            .unwrap();

        let response = send(
            &app,
            empty_request("POST", &format!("/admin/memberships/{}/approve", membership.id)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "approved");

        let response = send(&app, empty_request("POST", "/admin/memberships/nope/reject")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            json_request(
                "POST",
                "/admin/promotions",
                json!({ "code": "WAVE10", "packageSlug": "bronze-wave" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let promo = json_body(response).await;
        assert_eq!(promo["packageName"], "bronze-wave package");

        let response = send(
            &app,
            empty_request("DELETE", &format!("/admin/promotions/{}", promo["id"].as_str().unwrap())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        send(
            &app,
            empty_request("GET", "/payment-notifications?OrderTrackingId=T-1"),
        )
        .await;
        let response = send(&app, empty_request("GET", "/admin/notifications")).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
        let response = send(&app, empty_request("DELETE", "/admin/notifications")).await;
        assert_eq!(json_body(response).await, json!({ "removed": 1 }));
    }
}
