// Purchase initiation and payment confirmation.
//
// Both the redirect callback and the IPN webhook go through `confirm_payment`;
// whichever arrives first claims the voucher and the other observes the claim.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::gateway_counter_inc;
use crate::notify::{voucher_message, Notifier};
use crate::pesapal::errors::GatewayError;
use crate::pesapal::types::{OrderRequest, OrderSubmission, ParsedStatus, PaymentStatus};
use crate::pesapal::PaymentGateway;
use crate::settings::Config;
use crate::vouchers::{
    validate_phone_number, ClaimOutcome, ClaimedVoucher, OrderState, PendingOrder, VoucherError,
    VoucherStore, VoucherWithPackage,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub currency: String,
    pub country_code: String,
    /// Where the gateway sends the customer after payment.
    pub callback_url: String,
    pub max_initiation_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            currency: cfg.currency.clone(),
            country_code: cfg.country_code.clone(),
            callback_url: format!("{}/payment-callback", cfg.public_base_url()),
            max_initiation_retries: cfg.pesapal.max_initiation_retries,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PurchaseOutcome {
    /// The phone already holds vouchers; nothing was charged.
    ExistingVouchersFound { vouchers: Vec<VoucherWithPackage> },
    Redirect {
        redirect_url: String,
        merchant_reference: String,
        tracking_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome {
    Claimed(ClaimedVoucher),
    AlreadyClaimed(ClaimedVoucher),
    OutOfStock { package_slug: String },
    NotCompleted(PaymentStatus),
    UnknownOrder,
}

impl ConfirmationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmationOutcome::Claimed(_) => "claimed",
            ConfirmationOutcome::AlreadyClaimed(_) => "already_claimed",
            ConfirmationOutcome::OutOfStock { .. } => "out_of_stock",
            ConfirmationOutcome::NotCompleted(_) => "not_completed",
            ConfirmationOutcome::UnknownOrder => "unknown_order",
        }
    }
}

/// Verified payment status together with what it did to the order.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub status: ParsedStatus,
    pub merchant_reference: Option<String>,
    pub outcome: ConfirmationOutcome,
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: VoucherStore,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: Arc<OrchestratorSettings>,
}

impl PaymentOrchestrator {
    pub fn new(
        store: VoucherStore,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            clock,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &VoucherStore {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Starts a purchase of `package_slug` for `phone_number`.
    ///
    /// Without `force_purchase`, a phone that already holds vouchers gets them
    /// back instead of being charged. Otherwise the pending order is stored
    /// before the gateway sees it.
    #[instrument(skip(self, phone_number), fields(package_slug = %package_slug))]
    pub async fn purchase(
        &self,
        phone_number: &str,
        package_slug: &str,
        force_purchase: bool,
    ) -> Result<PurchaseOutcome, VoucherError> {
        let phone_number = validate_phone_number(phone_number)?;
        let package = self.store.get_package(package_slug)?;
        let now = self.clock.now();

        if !force_purchase {
            let vouchers = self.store.find_active_vouchers_for(&phone_number, now)?;
            if !vouchers.is_empty() {
                info!(count = vouchers.len(), "Phone already holds vouchers, asking before charging");
                return Ok(PurchaseOutcome::ExistingVouchersFound { vouchers });
            }
        }

        let merchant_reference = format!("VW-{}", Uuid::new_v4());
        self.store.insert_pending_order(&PendingOrder {
            merchant_reference: merchant_reference.clone(),
            package_slug: package.slug.clone(),
            phone_number: phone_number.clone(),
            amount: package.price,
            created_at: now,
            tracking_id: None,
            state: OrderState::Pending,
        })?;

        let request = OrderRequest {
            merchant_reference: merchant_reference.clone(),
            amount: package.price,
            currency: self.settings.currency.clone(),
            description: format!("{} WIFI voucher", package.name),
            callback_url: self.settings.callback_url.clone(),
            phone_number,
            country_code: self.settings.country_code.clone(),
        };

        match self.submit_with_retries(&request).await {
            Ok(submission) => {
                self.store
                    .attach_tracking_id(&merchant_reference, &submission.tracking_id)?;
                gateway_counter_inc!("payments.initiated", "package" => package.slug);
                info!(
                    merchant_reference = %merchant_reference,
                    payment_tracking_id = %submission.tracking_id,
                    "Payment initiated"
                );
                Ok(PurchaseOutcome::Redirect {
                    redirect_url: submission.redirect_url,
                    merchant_reference,
                    tracking_id: submission.tracking_id,
                })
            }
            Err(e) => {
                error!(
                    target: "pesapal",
                    merchant_reference = %merchant_reference,
                    gateway = self.gateway.name(),
                    error = %e,
                    "Payment initiation failed"
                );
                gateway_counter_inc!("payments.initiation_failed", "package" => package.slug);
                self.store.mark_order_state(
                    &merchant_reference,
                    OrderState::InitiationFailed {
                        reason: e.to_string(),
                    },
                )?;
                Err(VoucherError::PaymentInitiationFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Single status read from the gateway. Never retried.
    pub async fn check_status(&self, tracking_id: &str) -> Result<ParsedStatus, VoucherError> {
        self.gateway
            .get_transaction_status(tracking_id)
            .await
            .map_err(|e| {
                warn!(
                    target: "pesapal",
                    payment_tracking_id = %tracking_id,
                    error = %e,
                    "Transaction status query failed"
                );
                VoucherError::from(e)
            })
    }

    /// Verifies the payment with the gateway and, when completed, claims a
    /// voucher for the order. Safe to call any number of times.
    #[instrument(skip(self), fields(payment_tracking_id = %tracking_id))]
    pub async fn confirm_payment(
        &self,
        tracking_id: &str,
        merchant_reference_hint: Option<&str>,
    ) -> Result<Confirmation, VoucherError> {
        let status = self.check_status(tracking_id).await?;

        let Some(order) = self.resolve_order(tracking_id, merchant_reference_hint, &status)? else {
            warn!(
                merchant_reference = ?merchant_reference_hint,
                payment_status = %status.status,
                "No pending order matches this payment"
            );
            let merchant_reference = status
                .merchant_reference
                .clone()
                .or_else(|| merchant_reference_hint.map(str::to_string));
            return Ok(Confirmation {
                status,
                merchant_reference,
                outcome: ConfirmationOutcome::UnknownOrder,
            });
        };

        let outcome = match status.status {
            PaymentStatus::Completed => {
                match self.store.claim_for_order(
                    &order.merchant_reference,
                    tracking_id,
                    self.clock.now(),
                ) {
                    Ok(ClaimOutcome::Claimed(voucher)) => {
                        self.notify_customer(&voucher).await;
                        ConfirmationOutcome::Claimed(voucher)
                    }
                    Ok(ClaimOutcome::AlreadyClaimed(voucher)) => {
                        ConfirmationOutcome::AlreadyClaimed(voucher)
                    }
                    Err(VoucherError::NoVouchersAvailable { package_slug }) => {
                        ConfirmationOutcome::OutOfStock { package_slug }
                    }
                    Err(e) => return Err(e),
                }
            }
            status if !status.is_terminal() => ConfirmationOutcome::NotCompleted(status),
            other => {
                info!(payment_status = %other, "Payment did not complete");
                self.store.mark_order_state(
                    &order.merchant_reference,
                    OrderState::PaymentFailed {
                        status: other.to_string(),
                    },
                )?;
                ConfirmationOutcome::NotCompleted(other)
            }
        };

        gateway_counter_inc!("payments.confirmations", "outcome" => outcome.label());
        Ok(Confirmation {
            status,
            merchant_reference: Some(order.merchant_reference),
            outcome,
        })
    }

    /// Finds the order for a tracking id, falling back to the merchant
    /// reference. A reference whose order carries another tracking id, or
    /// that disagrees with the gateway, matches nothing.
    fn resolve_order(
        &self,
        tracking_id: &str,
        merchant_reference_hint: Option<&str>,
        status: &ParsedStatus,
    ) -> Result<Option<PendingOrder>, VoucherError> {
        let order = match self.store.find_order_by_tracking_id(tracking_id)? {
            Some(order) => order,
            None => {
                let reference = merchant_reference_hint
                    .filter(|r| !r.is_empty())
                    .or(status.merchant_reference.as_deref());
                let Some(reference) = reference else {
                    return Ok(None);
                };
                match self.store.get_pending_order(reference) {
                    Ok(order) => order,
                    Err(VoucherError::NotFound { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
        };

        if let Some(stored) = order.tracking_id.as_deref() {
            if stored != tracking_id {
                warn!(
                    merchant_reference = %order.merchant_reference,
                    stored_tracking_id = %stored,
                    "Merchant reference belongs to another transaction"
                );
                return Ok(None);
            }
        }
        if let Some(gateway_reference) = status.merchant_reference.as_deref() {
            if gateway_reference != order.merchant_reference {
                warn!(
                    merchant_reference = %order.merchant_reference,
                    gateway_reference = %gateway_reference,
                    "Gateway reports a different merchant reference"
                );
                return Ok(None);
            }
        }
        Ok(Some(order))
    }

    async fn notify_customer(&self, voucher: &ClaimedVoucher) {
        let (name, duration_hours) = match self.store.get_package(&voucher.package_slug) {
            Ok(package) => (package.name, package.duration_hours),
            Err(_) => (voucher.package_slug.clone(), 0),
        };
        let message = voucher_message(&voucher.code, &name, duration_hours);
        if let Err(e) = self.notifier.send(&voucher.phone_number, &message).await {
            warn!(
                voucher_id = %voucher.voucher_id,
                error = %e,
                "Failed to deliver voucher code to customer"
            );
        }
    }

    async fn submit_with_retries(
        &self,
        order: &OrderRequest,
    ) -> Result<OrderSubmission, GatewayError> {
        let max_retries = self.settings.max_initiation_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.gateway.submit_order(order).await {
                Ok(submission) => return Ok(submission),
                Err(e) => {
                    if !e.is_retryable() || attempt >= max_retries {
                        return Err(e);
                    }

                    let delay = backoff_delay(
                        attempt,
                        self.settings.retry_base_delay,
                        self.settings.retry_max_delay,
                    );
                    warn!(
                        target: "pesapal",
                        merchant_reference = %order.merchant_reference,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %e,
                        next_delay_ms = delay.as_millis() as u64,
                        "retrying order submission"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff with full jitter, bounded by `max`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let max_ms = (max.as_millis() as u64).max(base_ms);
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let cap = exp.min(max_ms);
    let mut rng = SmallRng::from_entropy();
    let delay_ms = if cap > base_ms {
        rng.gen_range(base_ms..=cap)
    } else {
        base_ms
    };
    Duration::from_millis(delay_ms)
}
