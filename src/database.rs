//! Key-value persistence for packages, vouchers, orders and operator data.
//!
//! Uses redb. Logical layout:
//! - `packages`: slug → Package JSON
//! - `vouchers`: (package slug, voucher id) → VoucherRecord JSON
//! - `pending_orders`: merchant reference → PendingOrder JSON
//! - `orders_by_tracking_id`: gateway tracking id → merchant reference
//! - `memberships`, `promotions`: id → record JSON
//! - `notification_log`: sequence number → NotificationLogEntry JSON

use redb::{ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub(crate) const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");
pub(crate) const VOUCHERS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("vouchers");
pub(crate) const PENDING_ORDERS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_orders");
pub(crate) const ORDERS_BY_TRACKING_ID: TableDefinition<&str, &str> =
    TableDefinition::new("orders_by_tracking_id");
pub(crate) const MEMBERSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("memberships");
pub(crate) const PROMOTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("promotions");
pub(crate) const NOTIFICATION_LOG: TableDefinition<u64, &[u8]> =
    TableDefinition::new("notification_log");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Redb(#[from] redb::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

macro_rules! store_error_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Redb(redb::Error::from(e))
                }
            }
        )*
    };
}

store_error_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Database wrapper shared by every store component
#[derive(Clone)]
pub struct Database {
    db: Arc<redb::Database>,
}

impl Database {
    /// Create a new database instance or open an existing one
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = redb::Database::create(path)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(PACKAGES)?;
            write_txn.open_table(VOUCHERS)?;
            write_txn.open_table(PENDING_ORDERS)?;
            write_txn.open_table(ORDERS_BY_TRACKING_ID)?;
            write_txn.open_table(MEMBERSHIPS)?;
            write_txn.open_table(PROMOTIONS)?;
            write_txn.open_table(NOTIFICATION_LOG)?;
        }
        write_txn.commit()?;

        tracing::info!("Database initialized");

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn begin_read(&self) -> Result<redb::ReadTransaction, StoreError> {
        Ok(self.db.begin_read()?)
    }

    /// Write transactions are serialized by redb; a second caller blocks until
    /// the first commits or aborts.
    pub(crate) fn begin_write(&self) -> Result<redb::WriteTransaction, StoreError> {
        Ok(self.db.begin_write()?)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Fetch and decode a JSON value from a string-keyed table.
pub(crate) fn get_json<T, R>(table: &R, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every value of a string-keyed table, paired with its key.
pub(crate) fn all_json<T, R>(table: &R) -> Result<Vec<(String, T)>, StoreError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        out.push((key.value().to_string(), decode(value.value())?));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Database;
    use tempfile::TempDir;

    /// Open a database in a fresh temporary directory. Keep the `TempDir`
    /// alive for as long as the database is used.
    pub fn temp_database() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Database::open(dir.path().join("voucherwave.redb")).expect("open database");
        (dir, db)
    }
}
