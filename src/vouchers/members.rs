// Membership applications and promotions

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use super::errors::VoucherError;
use super::store::VoucherStore;
use super::types::{
    Membership, MembershipRecord, MembershipSignup, MembershipStatus, NewPromotion, Package,
    Promotion,
};
use super::validate_phone_number;
use crate::database::{all_json, encode, get_json, MEMBERSHIPS, PACKAGES, PROMOTIONS};

const UNKNOWN_PACKAGE: &str = "Unknown Package";

impl VoucherStore {
    pub fn create_membership(
        &self,
        signup: MembershipSignup,
        now: DateTime<Utc>,
    ) -> Result<Membership, VoucherError> {
        let name = signup.name.trim();
        if name.chars().count() < 2 {
            return Err(VoucherError::invalid("Name must be at least 2 characters."));
        }
        let phone_number = validate_phone_number(&signup.phone_number)?;
        let username = signup.username.trim();
        if username.is_empty() {
            return Err(VoucherError::invalid("Username is required."));
        }
        if signup.password.expose_secret().is_empty() {
            return Err(VoucherError::invalid("Password is required."));
        }
        if signup.document_reference.trim().is_empty() {
            return Err(VoucherError::invalid("An identity document is required."));
        }

        let id = Uuid::new_v4().to_string();
        let record = MembershipRecord {
            name: name.to_string(),
            phone_number,
            username: username.to_string(),
            password: signup.password,
            document_reference: signup.document_reference.trim().to_string(),
            status: MembershipStatus::Pending,
            created_at: now,
        };

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(MEMBERSHIPS)?;
            table.insert(id.as_str(), encode(&record)?.as_slice())?;
        }
        txn.commit()?;

        info!(membership_id = %id, "Membership application received");
        Ok(Membership::from_record(id, record))
    }

    /// Applications, newest first.
    pub fn list_memberships(&self) -> Result<Vec<Membership>, VoucherError> {
        let txn = self.db.begin_read()?;
        let records: Vec<(String, MembershipRecord)> = all_json(&txn.open_table(MEMBERSHIPS)?)?;
        let mut memberships: Vec<Membership> = records
            .into_iter()
            .map(|(id, record)| Membership::from_record(id, record))
            .collect();
        memberships.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(memberships)
    }

    /// Admin decision on an application. Memberships never move back to pending.
    pub fn set_membership_status(
        &self,
        id: &str,
        status: MembershipStatus,
    ) -> Result<Membership, VoucherError> {
        if status == MembershipStatus::Pending {
            return Err(VoucherError::invalid(
                "A membership can only be approved or rejected.",
            ));
        }

        let txn = self.db.begin_write()?;
        let record = {
            let mut table = txn.open_table(MEMBERSHIPS)?;
            let mut record: MembershipRecord =
                get_json(&table, id)?.ok_or_else(|| VoucherError::not_found("membership", id))?;
            record.status = status;
            table.insert(id, encode(&record)?.as_slice())?;
            record
        };
        txn.commit()?;

        info!(membership_id = %id, status = ?status, "Membership status changed");
        Ok(Membership::from_record(id.to_string(), record))
    }

    pub fn add_promotion(&self, promotion: NewPromotion) -> Result<Promotion, VoucherError> {
        let code = promotion.code.trim();
        if code.is_empty() {
            return Err(VoucherError::invalid("Promotion code is required."));
        }
        let package = self.get_package(&promotion.package_slug)?;

        let id = Uuid::new_v4().to_string();
        let record = NewPromotion {
            code: code.to_string(),
            package_slug: package.slug.clone(),
        };

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PROMOTIONS)?;
            table.insert(id.as_str(), encode(&record)?.as_slice())?;
        }
        txn.commit()?;

        info!(promotion_id = %id, package_slug = %package.slug, "Promotion added");
        Ok(Promotion {
            id,
            code: record.code,
            package_slug: record.package_slug,
            package_name: package.name,
        })
    }

    /// Promotions with the package name resolved at read time.
    pub fn list_promotions(&self) -> Result<Vec<Promotion>, VoucherError> {
        let txn = self.db.begin_read()?;
        let packages: HashMap<String, Package> =
            all_json(&txn.open_table(PACKAGES)?)?.into_iter().collect();
        let records: Vec<(String, NewPromotion)> = all_json(&txn.open_table(PROMOTIONS)?)?;

        Ok(records
            .into_iter()
            .map(|(id, record)| Promotion {
                package_name: packages
                    .get(&record.package_slug)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| UNKNOWN_PACKAGE.to_string()),
                id,
                code: record.code,
                package_slug: record.package_slug,
            })
            .collect())
    }

    pub fn delete_promotion(&self, id: &str) -> Result<(), VoucherError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PROMOTIONS)?;
            if table.remove(id)?.is_none() {
                return Err(VoucherError::not_found("promotion", id));
            }
        }
        txn.commit()?;
        Ok(())
    }
}
