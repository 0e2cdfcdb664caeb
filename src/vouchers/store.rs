// Package and voucher inventory, including the compare-and-set claim.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::errors::VoucherError;
use super::status::{compute_status, VoucherStatus};
use super::types::{
    ClaimOutcome, ClaimedVoucher, OrderState, Package, PackageSummary, PendingOrder, Voucher,
    VoucherRecord, VoucherUpdate, VoucherView, VoucherWithPackage,
};
use crate::database::{
    all_json, decode, encode, get_json, Database, StoreError, ORDERS_BY_TRACKING_ID, PACKAGES,
    PENDING_ORDERS, VOUCHERS,
};

/// Store for packages, vouchers, orders and operator records.
#[derive(Clone)]
pub struct VoucherStore {
    pub(super) db: Database,
}

/// Result of a single conditional write.
enum Claim {
    Stamped(Voucher),
    OrderAlreadyFulfilled(ClaimedVoucher),
}

impl VoucherStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_package(&self, package: Package) -> Result<Package, VoucherError> {
        validate_package(&package)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PACKAGES)?;
            if table.get(package.slug.as_str())?.is_some() {
                return Err(VoucherError::invalid(format!(
                    "Package {} already exists.",
                    package.slug
                )));
            }
            table.insert(package.slug.as_str(), encode(&package)?.as_slice())?;
        }
        txn.commit()?;

        info!(package_slug = %package.slug, "Created package");
        Ok(package)
    }

    pub fn get_package(&self, slug: &str) -> Result<Package, VoucherError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PACKAGES)?;
        get_json(&table, slug)?.ok_or_else(|| VoucherError::not_found("package", slug))
    }

    /// All packages with their count of Available vouchers, cheapest first.
    pub fn list_packages(&self) -> Result<Vec<PackageSummary>, VoucherError> {
        let txn = self.db.begin_read()?;
        let packages: Vec<(String, Package)> = all_json(&txn.open_table(PACKAGES)?)?;

        let mut available: HashMap<String, usize> = HashMap::new();
        let vouchers = txn.open_table(VOUCHERS)?;
        for entry in vouchers.iter()? {
            let (key, value) = entry?;
            let record: VoucherRecord = decode(value.value())?;
            if record.used_at.is_none() {
                *available.entry(key.value().0.to_string()).or_default() += 1;
            }
        }

        let mut summaries: Vec<PackageSummary> = packages
            .into_iter()
            .map(|(slug, package)| PackageSummary {
                available_vouchers: available.get(&slug).copied().unwrap_or(0),
                package,
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.package
                .price
                .cmp(&b.package.price)
                .then_with(|| a.package.slug.cmp(&b.package.slug))
        });
        Ok(summaries)
    }

    /// Replaces the package stored under `slug`. The slug itself cannot change.
    pub fn update_package(&self, slug: &str, mut package: Package) -> Result<Package, VoucherError> {
        package.slug = slug.to_string();
        validate_package(&package)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PACKAGES)?;
            if table.get(slug)?.is_none() {
                return Err(VoucherError::not_found("package", slug));
            }
            table.insert(slug, encode(&package)?.as_slice())?;
        }
        txn.commit()?;

        info!(package_slug = %slug, "Updated package");
        Ok(package)
    }

    /// Deletes the package and every voucher it owns.
    pub fn delete_package(&self, slug: &str) -> Result<(), VoucherError> {
        let txn = self.db.begin_write()?;
        let removed_vouchers = {
            let mut packages = txn.open_table(PACKAGES)?;
            if packages.remove(slug)?.is_none() {
                return Err(VoucherError::not_found("package", slug));
            }

            let mut vouchers = txn.open_table(VOUCHERS)?;
            let ids: Vec<String> = package_vouchers(&vouchers, slug)?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            for id in &ids {
                vouchers.remove((slug, id.as_str()))?;
            }
            ids.len()
        };
        txn.commit()?;

        info!(package_slug = %slug, removed_vouchers, "Deleted package");
        Ok(())
    }

    /// Vouchers of one package, oldest first, each with its derived status.
    pub fn list_vouchers(
        &self,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<VoucherView>, VoucherError> {
        let txn = self.db.begin_read()?;
        let package: Package = get_json(&txn.open_table(PACKAGES)?, slug)?
            .ok_or_else(|| VoucherError::not_found("package", slug))?;

        let mut records = package_vouchers(&txn.open_table(VOUCHERS)?, slug)?;
        records.sort_by(|(a_id, a), (b_id, b)| {
            a.created_at.cmp(&b.created_at).then_with(|| a_id.cmp(b_id))
        });

        Ok(records
            .into_iter()
            .map(|(id, record)| {
                let view = compute_status(record.used_at, package.duration_hours, now);
                VoucherView {
                    voucher: Voucher::from_record(id, record),
                    status: view.status,
                    expiry: view.expiry_display,
                }
            })
            .collect())
    }

    /// Every voucher joined with its package. Vouchers whose package is gone are skipped.
    pub fn list_all_vouchers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<VoucherWithPackage>, VoucherError> {
        let txn = self.db.begin_read()?;
        let packages: HashMap<String, Package> =
            all_json(&txn.open_table(PACKAGES)?)?.into_iter().collect();

        let mut out = Vec::new();
        let vouchers = txn.open_table(VOUCHERS)?;
        for entry in vouchers.iter()? {
            let (key, value) = entry?;
            let (slug, id) = key.value();
            let Some(package) = packages.get(slug) else {
                continue;
            };
            let record: VoucherRecord = decode(value.value())?;
            let view = compute_status(record.used_at, package.duration_hours, now);
            out.push(VoucherWithPackage {
                voucher: Voucher::from_record(id.to_string(), record),
                package_slug: package.slug.clone(),
                package_name: package.name.clone(),
                package_duration_hours: package.duration_hours,
                status: view.status,
                expiry: view.expiry_display,
            });
        }
        Ok(out)
    }

    pub fn list_active_vouchers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<VoucherWithPackage>, VoucherError> {
        let mut vouchers = self.list_all_vouchers(now)?;
        vouchers.retain(|v| v.status == VoucherStatus::Active);
        Ok(vouchers)
    }

    /// Vouchers purchased by `phone`, whether still Active or already Expired.
    pub fn find_active_vouchers_for(
        &self,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<VoucherWithPackage>, VoucherError> {
        let mut vouchers = self.list_all_vouchers(now)?;
        vouchers.retain(|v| v.voucher.purchased_by.as_deref() == Some(phone));
        vouchers.sort_by(|a, b| b.voucher.used_at.cmp(&a.voucher.used_at));
        Ok(vouchers)
    }

    pub fn add_voucher(
        &self,
        slug: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Voucher, VoucherError> {
        let mut added = self.insert_vouchers(slug, [code.trim()], now)?;
        added
            .pop()
            .ok_or_else(|| VoucherError::invalid("Voucher code is required."))
    }

    /// Adds one voucher per non-blank code. Codes are trimmed.
    pub fn add_vouchers_bulk<I, S>(
        &self,
        slug: &str,
        codes: I,
        now: DateTime<Utc>,
    ) -> Result<Vec<Voucher>, VoucherError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes: Vec<String> = codes
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if codes.is_empty() {
            return Err(VoucherError::invalid("No voucher codes provided."));
        }
        self.insert_vouchers(slug, codes.iter().map(String::as_str), now)
    }

    fn insert_vouchers<'a>(
        &self,
        slug: &str,
        codes: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Voucher>, VoucherError> {
        let txn = self.db.begin_write()?;
        let added = {
            if txn.open_table(PACKAGES)?.get(slug)?.is_none() {
                return Err(VoucherError::not_found("package", slug));
            }

            let mut vouchers = txn.open_table(VOUCHERS)?;
            let mut added = Vec::new();
            for code in codes {
                if code.is_empty() {
                    return Err(VoucherError::invalid("Voucher code is required."));
                }
                let id = Uuid::new_v4().to_string();
                let record = VoucherRecord {
                    code: code.to_string(),
                    created_at: now,
                    used_at: None,
                    purchased_by: None,
                };
                vouchers.insert((slug, id.as_str()), encode(&record)?.as_slice())?;
                added.push(Voucher::from_record(id, record));
            }
            added
        };
        txn.commit()?;

        info!(package_slug = %slug, count = added.len(), "Added vouchers");
        Ok(added)
    }

    /// Admin edit. Setting `used_at` restarts the timer; clearing it also clears the purchaser.
    pub fn update_voucher(
        &self,
        slug: &str,
        id: &str,
        update: VoucherUpdate,
    ) -> Result<Voucher, VoucherError> {
        let code = update.code.trim();
        if code.is_empty() {
            return Err(VoucherError::invalid("Voucher code is required."));
        }

        let txn = self.db.begin_write()?;
        let record = {
            let mut vouchers = txn.open_table(VOUCHERS)?;
            let existing: Option<VoucherRecord> = match vouchers.get((slug, id))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut record = existing.ok_or_else(|| VoucherError::not_found("voucher", id))?;

            record.code = code.to_string();
            record.used_at = update.used_at;
            if record.used_at.is_none() {
                record.purchased_by = None;
            }
            vouchers.insert((slug, id), encode(&record)?.as_slice())?;
            record
        };
        txn.commit()?;

        debug!(package_slug = %slug, voucher_id = %id, "Updated voucher");
        Ok(Voucher::from_record(id.to_string(), record))
    }

    pub fn delete_voucher(&self, slug: &str, id: &str) -> Result<(), VoucherError> {
        let txn = self.db.begin_write()?;
        {
            let mut vouchers = txn.open_table(VOUCHERS)?;
            if vouchers.remove((slug, id))?.is_none() {
                return Err(VoucherError::not_found("voucher", id));
            }
        }
        txn.commit()?;

        debug!(package_slug = %slug, voucher_id = %id, "Deleted voucher");
        Ok(())
    }

    /// Stamps one Available voucher of `slug` as used by `phone`.
    ///
    /// Concurrent callers never receive the same voucher.
    #[instrument(skip_all, fields(package_slug = %slug))]
    pub fn claim_one_available(
        &self,
        slug: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Voucher, VoucherError> {
        self.get_package(slug)?;

        match self.claim_first_candidate(slug, phone, now, None)? {
            Some(Claim::Stamped(voucher)) => {
                info!(voucher_id = %voucher.id, "Claimed voucher");
                Ok(voucher)
            }
            Some(Claim::OrderAlreadyFulfilled(_)) | None => Err(VoucherError::NoVouchersAvailable {
                package_slug: slug.to_string(),
            }),
        }
    }

    /// Claims a voucher for a pending order, flipping the order to Fulfilled in the
    /// same write. Replays return the voucher claimed the first time.
    #[instrument(skip_all, fields(merchant_reference = %merchant_reference))]
    pub fn claim_for_order(
        &self,
        merchant_reference: &str,
        tracking_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, VoucherError> {
        let order = self.get_pending_order(merchant_reference)?;
        if let Some(existing) = order.fulfilled_voucher() {
            return Ok(ClaimOutcome::AlreadyClaimed(existing.clone()));
        }
        if let Some(stored) = order.tracking_id.as_deref() {
            if stored != tracking_id {
                return Err(VoucherError::invalid(format!(
                    "Tracking id {tracking_id} does not belong to order {merchant_reference}."
                )));
            }
        }
        self.get_package(&order.package_slug)?;

        let target = OrderTarget {
            merchant_reference,
            tracking_id,
        };
        match self.claim_first_candidate(
            &order.package_slug,
            &order.phone_number,
            now,
            Some(&target),
        )? {
            Some(Claim::Stamped(voucher)) => {
                info!(
                    payment_tracking_id = %tracking_id,
                    voucher_id = %voucher.id,
                    "Claimed voucher for order"
                );
                Ok(ClaimOutcome::Claimed(ClaimedVoucher {
                    package_slug: order.package_slug,
                    voucher_id: voucher.id,
                    code: voucher.code,
                    phone_number: order.phone_number,
                    claimed_at: now,
                }))
            }
            Some(Claim::OrderAlreadyFulfilled(existing)) => {
                Ok(ClaimOutcome::AlreadyClaimed(existing))
            }
            None => {
                let order = self.mark_order_state(merchant_reference, OrderState::OutOfStock)?;
                if let Some(existing) = order.fulfilled_voucher() {
                    return Ok(ClaimOutcome::AlreadyClaimed(existing.clone()));
                }
                error!(
                    payment_tracking_id = %tracking_id,
                    package_slug = %order.package_slug,
                    phone_number = %order.phone_number,
                    "Payment completed but no vouchers are available"
                );
                Err(VoucherError::NoVouchersAvailable {
                    package_slug: order.package_slug,
                })
            }
        }
    }

    fn claim_first_candidate(
        &self,
        slug: &str,
        phone: &str,
        now: DateTime<Utc>,
        order: Option<&OrderTarget<'_>>,
    ) -> Result<Option<Claim>, VoucherError> {
        for voucher_id in self.available_candidates(slug)? {
            match self.try_claim(slug, &voucher_id, phone, now, order) {
                Ok(claim) => return Ok(Some(claim)),
                Err(VoucherError::ConcurrencyConflict { .. }) => {
                    debug!(voucher_id = %voucher_id, "Voucher taken concurrently, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Available voucher ids of `slug` from a read snapshot, oldest first.
    fn available_candidates(&self, slug: &str) -> Result<Vec<String>, VoucherError> {
        let txn = self.db.begin_read()?;
        let mut records = package_vouchers(&txn.open_table(VOUCHERS)?, slug)?;
        records.retain(|(_, record)| record.used_at.is_none());
        records.sort_by(|(a_id, a), (b_id, b)| {
            a.created_at.cmp(&b.created_at).then_with(|| a_id.cmp(b_id))
        });
        Ok(records.into_iter().map(|(id, _)| id).collect())
    }

    /// Conditional write of one voucher: stamps it only if still unused and, for an
    /// order claim, only if the order is not yet fulfilled.
    fn try_claim(
        &self,
        slug: &str,
        voucher_id: &str,
        phone: &str,
        now: DateTime<Utc>,
        order: Option<&OrderTarget<'_>>,
    ) -> Result<Claim, VoucherError> {
        let txn = self.db.begin_write()?;
        let claim = {
            let mut vouchers = txn.open_table(VOUCHERS)?;
            let mut orders = txn.open_table(PENDING_ORDERS)?;
            let mut index = txn.open_table(ORDERS_BY_TRACKING_ID)?;

            let pending = match order {
                Some(target) => {
                    let pending: PendingOrder = get_json(&orders, target.merchant_reference)?
                        .ok_or_else(|| {
                            VoucherError::not_found("order", target.merchant_reference)
                        })?;
                    if let Some(existing) = pending.fulfilled_voucher() {
                        return Ok(Claim::OrderAlreadyFulfilled(existing.clone()));
                    }
                    Some((target, pending))
                }
                None => None,
            };

            let current: Option<VoucherRecord> = match vouchers.get((slug, voucher_id))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut record = match current {
                Some(record) if record.used_at.is_none() => record,
                _ => {
                    return Err(VoucherError::ConcurrencyConflict {
                        package_slug: slug.to_string(),
                        voucher_id: voucher_id.to_string(),
                    })
                }
            };

            record.used_at = Some(now);
            record.purchased_by = Some(phone.to_string());
            vouchers.insert((slug, voucher_id), encode(&record)?.as_slice())?;

            if let Some((target, mut pending)) = pending {
                if pending.tracking_id.is_none() {
                    pending.tracking_id = Some(target.tracking_id.to_string());
                    index.insert(target.tracking_id, target.merchant_reference)?;
                }
                pending.state = OrderState::Fulfilled {
                    voucher: ClaimedVoucher {
                        package_slug: slug.to_string(),
                        voucher_id: voucher_id.to_string(),
                        code: record.code.clone(),
                        phone_number: phone.to_string(),
                        claimed_at: now,
                    },
                };
                orders.insert(target.merchant_reference, encode(&pending)?.as_slice())?;
            }

            Claim::Stamped(Voucher::from_record(voucher_id.to_string(), record))
        };
        txn.commit()?;
        Ok(claim)
    }
}

struct OrderTarget<'a> {
    merchant_reference: &'a str,
    tracking_id: &'a str,
}

/// Vouchers stored under `slug`, in key order.
fn package_vouchers<R>(table: &R, slug: &str) -> Result<Vec<(String, VoucherRecord)>, StoreError>
where
    R: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.range((slug, "")..)? {
        let (key, value) = entry?;
        let (package_slug, id) = key.value();
        if package_slug != slug {
            break;
        }
        out.push((id.to_string(), decode(value.value())?));
    }
    Ok(out)
}

fn validate_package(package: &Package) -> Result<(), VoucherError> {
    let slug_ok = !package.slug.is_empty()
        && package
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !slug_ok {
        return Err(VoucherError::invalid(
            "Package slug must use lowercase letters, digits and dashes.",
        ));
    }
    if package.name.trim().is_empty() {
        return Err(VoucherError::invalid("Package name is required."));
    }
    if package.duration_hours == 0 {
        return Err(VoucherError::invalid(
            "Package duration must be at least one hour.",
        ));
    }
    Ok(())
}
