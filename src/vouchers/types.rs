// Records persisted in the voucher store and the views derived from them.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use super::status::VoucherStatus;

/// A product offering that owns a pool of vouchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub slug: String,
    pub name: String,
    pub price: u64,
    pub duration_hours: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    #[serde(flatten)]
    pub package: Package,
    pub available_vouchers: usize,
}

/// Value stored under `vouchers/{package_slug}/{voucher_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VoucherRecord {
    pub code: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchased_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub purchased_by: Option<String>,
}

impl Voucher {
    pub(crate) fn from_record(id: String, record: VoucherRecord) -> Self {
        Self {
            id,
            code: record.code,
            created_at: record.created_at,
            used_at: record.used_at,
            purchased_by: record.purchased_by,
        }
    }
}

/// A voucher together with its derived status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherView {
    #[serde(flatten)]
    pub voucher: Voucher,
    pub status: VoucherStatus,
    pub expiry: Option<String>,
}

/// Cross-package reporting row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherWithPackage {
    #[serde(flatten)]
    pub voucher: Voucher,
    pub package_slug: String,
    pub package_name: String,
    pub package_duration_hours: u32,
    pub status: VoucherStatus,
    pub expiry: Option<String>,
}

/// Admin edit of a voucher. Clearing `used_at` returns the voucher to Available.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherUpdate {
    pub code: String,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
}

/// Result of a successful claim, also kept on the fulfilled order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedVoucher {
    pub package_slug: String,
    pub voucher_id: String,
    pub code: String,
    pub phone_number: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call stamped the voucher.
    Claimed(ClaimedVoucher),
    /// The order was fulfilled by an earlier confirmation.
    AlreadyClaimed(ClaimedVoucher),
}

impl ClaimOutcome {
    pub fn voucher(&self) -> &ClaimedVoucher {
        match self {
            ClaimOutcome::Claimed(v) | ClaimOutcome::AlreadyClaimed(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "state",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum OrderState {
    Pending,
    Fulfilled { voucher: ClaimedVoucher },
    OutOfStock,
    InitiationFailed { reason: String },
    PaymentFailed { status: String },
}

/// Correlates a merchant reference with the package and purchaser, written
/// before the order is submitted to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub merchant_reference: String,
    pub package_slug: String,
    pub phone_number: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tracking_id: Option<String>,
    #[serde(flatten)]
    pub state: OrderState,
}

impl PendingOrder {
    pub fn fulfilled_voucher(&self) -> Option<&ClaimedVoucher> {
        match &self.state {
            OrderState::Fulfilled { voucher } => Some(voucher),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSignup {
    pub name: String,
    pub phone_number: String,
    pub username: String,
    pub password: SecretString,
    pub document_reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MembershipRecord {
    pub name: String,
    pub phone_number: String,
    pub username: String,
    #[serde(serialize_with = "serialize_secret")]
    pub password: SecretString,
    pub document_reference: String,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

fn serialize_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Membership as returned to callers; the password never leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub username: String,
    pub document_reference: String,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub(crate) fn from_record(id: String, record: MembershipRecord) -> Self {
        Self {
            id,
            name: record.name,
            phone_number: record.phone_number,
            username: record.username,
            document_reference: record.document_reference,
            status: record.status,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPromotion {
    pub code: String,
    pub package_slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub id: String,
    pub code: String,
    pub package_slug: String,
    pub package_name: String,
}

/// Raw inbound notification kept for operator troubleshooting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationLogEntry {
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
}
