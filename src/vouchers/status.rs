// Voucher lifecycle status, derived on every read and never stored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const NO_EXPIRY: &str = "does not expire";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoucherStatus {
    Available,
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub status: VoucherStatus,
    /// Absolute date for expired vouchers, relative phrase for active ones.
    pub expiry_display: Option<String>,
}

/// Computes the status of a voucher activated at `used_at` for a package
/// lasting `duration_hours`, as seen at `now`.
pub fn compute_status(
    used_at: Option<DateTime<Utc>>,
    duration_hours: u32,
    now: DateTime<Utc>,
) -> StatusView {
    let Some(used_at) = used_at else {
        return StatusView {
            status: VoucherStatus::Available,
            expiry_display: None,
        };
    };

    // An expiry past the representable range never arrives.
    let Some(expiry) = Duration::try_hours(i64::from(duration_hours))
        .and_then(|d| used_at.checked_add_signed(d))
    else {
        return StatusView {
            status: VoucherStatus::Active,
            expiry_display: Some(NO_EXPIRY.to_string()),
        };
    };
    if now >= expiry {
        StatusView {
            status: VoucherStatus::Expired,
            expiry_display: Some(expiry.format("%d %b %Y, %H:%M").to_string()),
        }
    } else {
        StatusView {
            status: VoucherStatus::Active,
            expiry_display: Some(format!("in {}", humanize(expiry - now))),
        }
    }
}

fn humanize(remaining: Duration) -> String {
    let seconds = remaining.num_seconds();
    let minutes = (seconds as f64 / 60.0).round() as i64;

    if seconds < 30 {
        return "less than a minute".to_string();
    }
    if minutes < 45 {
        return plural(minutes.max(1), "minute");
    }
    if minutes < 90 {
        return "about 1 hour".to_string();
    }
    let hours = (minutes as f64 / 60.0).round() as i64;
    if hours < 24 {
        return plural(hours, "hour");
    }
    let days = (hours as f64 / 24.0).round() as i64;
    if days < 30 {
        return plural(days, "day");
    }
    let months = (days as f64 / 30.0).round() as i64;
    if months <= 1 {
        return "about 1 month".to_string();
    }
    plural(months, "month")
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}
