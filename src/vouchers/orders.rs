// Pending orders correlated by merchant reference and gateway tracking id,
// plus the inbound notification audit log.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use tracing::{debug, info, warn};

use super::errors::VoucherError;
use super::store::VoucherStore;
use super::types::{NotificationLogEntry, OrderState, PendingOrder};
use crate::database::{decode, encode, get_json, NOTIFICATION_LOG, ORDERS_BY_TRACKING_ID, PENDING_ORDERS};

impl VoucherStore {
    /// Persists a new order. Merchant references are never reused.
    pub fn insert_pending_order(&self, order: &PendingOrder) -> Result<(), VoucherError> {
        let txn = self.db.begin_write()?;
        {
            let mut orders = txn.open_table(PENDING_ORDERS)?;
            if orders.get(order.merchant_reference.as_str())?.is_some() {
                return Err(VoucherError::invalid(format!(
                    "Duplicate merchant reference {}.",
                    order.merchant_reference
                )));
            }
            orders.insert(order.merchant_reference.as_str(), encode(order)?.as_slice())?;

            if let Some(tracking_id) = order.tracking_id.as_deref() {
                let mut index = txn.open_table(ORDERS_BY_TRACKING_ID)?;
                index.insert(tracking_id, order.merchant_reference.as_str())?;
            }
        }
        txn.commit()?;

        debug!(
            merchant_reference = %order.merchant_reference,
            package_slug = %order.package_slug,
            "Stored pending order"
        );
        Ok(())
    }

    /// Records the gateway tracking id for an order and indexes it.
    pub fn attach_tracking_id(
        &self,
        merchant_reference: &str,
        tracking_id: &str,
    ) -> Result<PendingOrder, VoucherError> {
        let txn = self.db.begin_write()?;
        let order = {
            let mut orders = txn.open_table(PENDING_ORDERS)?;
            let mut order: PendingOrder = get_json(&orders, merchant_reference)?
                .ok_or_else(|| VoucherError::not_found("order", merchant_reference))?;

            if let Some(existing) = order.tracking_id.clone() {
                if existing == tracking_id {
                    return Ok(order);
                }
                return Err(VoucherError::invalid(format!(
                    "Order {merchant_reference} already has tracking id {existing}."
                )));
            }

            order.tracking_id = Some(tracking_id.to_string());
            orders.insert(merchant_reference, encode(&order)?.as_slice())?;

            let mut index = txn.open_table(ORDERS_BY_TRACKING_ID)?;
            index.insert(tracking_id, merchant_reference)?;
            order
        };
        txn.commit()?;

        info!(
            merchant_reference = %merchant_reference,
            payment_tracking_id = %tracking_id,
            "Attached tracking id to order"
        );
        Ok(order)
    }

    pub fn get_pending_order(&self, merchant_reference: &str) -> Result<PendingOrder, VoucherError> {
        let txn = self.db.begin_read()?;
        let orders = txn.open_table(PENDING_ORDERS)?;
        get_json(&orders, merchant_reference)?
            .ok_or_else(|| VoucherError::not_found("order", merchant_reference))
    }

    pub fn find_order_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<PendingOrder>, VoucherError> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(ORDERS_BY_TRACKING_ID)?;
        let reference = match index.get(tracking_id)? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };
        let orders = txn.open_table(PENDING_ORDERS)?;
        Ok(get_json(&orders, &reference)?)
    }

    /// Moves an order to `state`. A fulfilled order keeps its voucher and is
    /// returned unchanged.
    pub fn mark_order_state(
        &self,
        merchant_reference: &str,
        state: OrderState,
    ) -> Result<PendingOrder, VoucherError> {
        let txn = self.db.begin_write()?;
        let order = {
            let mut orders = txn.open_table(PENDING_ORDERS)?;
            let mut order: PendingOrder = get_json(&orders, merchant_reference)?
                .ok_or_else(|| VoucherError::not_found("order", merchant_reference))?;

            if order.fulfilled_voucher().is_some() {
                if order.state != state {
                    warn!(
                        merchant_reference = %merchant_reference,
                        requested = ?state,
                        "Order already fulfilled, keeping its voucher"
                    );
                }
                return Ok(order);
            }

            order.state = state;
            orders.insert(merchant_reference, encode(&order)?.as_slice())?;
            order
        };
        txn.commit()?;

        debug!(merchant_reference = %merchant_reference, state = ?order.state, "Order state updated");
        Ok(order)
    }

    pub fn append_notification(
        &self,
        source: &str,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<NotificationLogEntry, VoucherError> {
        let txn = self.db.begin_write()?;
        let entry = {
            let mut log = txn.open_table(NOTIFICATION_LOG)?;
            let seq = log.last()?.map(|(key, _)| key.value() + 1).unwrap_or(1);
            let entry = NotificationLogEntry {
                seq,
                received_at,
                source: source.to_string(),
                payload,
            };
            log.insert(seq, encode(&entry)?.as_slice())?;
            entry
        };
        txn.commit()?;
        Ok(entry)
    }

    /// Audit log entries, newest first.
    pub fn list_notifications(&self) -> Result<Vec<NotificationLogEntry>, VoucherError> {
        let txn = self.db.begin_read()?;
        let log = txn.open_table(NOTIFICATION_LOG)?;
        let mut entries = Vec::new();
        for entry in log.iter()?.rev() {
            let (_, value) = entry?;
            entries.push(decode(value.value())?);
        }
        Ok(entries)
    }

    /// Empties the audit log and returns how many entries were removed.
    pub fn clear_notifications(&self) -> Result<usize, VoucherError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut log = txn.open_table(NOTIFICATION_LOG)?;
            let mut seqs = Vec::new();
            for entry in log.iter()? {
                let (key, _) = entry?;
                seqs.push(key.value());
            }
            for seq in &seqs {
                log.remove(*seq)?;
            }
            seqs.len()
        };
        txn.commit()?;

        info!(removed, "Cleared notification log");
        Ok(removed)
    }
}
