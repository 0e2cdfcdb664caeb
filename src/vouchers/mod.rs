pub mod errors;
mod members;
mod orders;
pub mod status;
pub(crate) mod store;
pub mod types;

pub use errors::VoucherError;
pub use status::{compute_status, StatusView, VoucherStatus};
pub use store::VoucherStore;
pub use types::*;

const MIN_PHONE_LEN: usize = 10;
const MAX_PHONE_LEN: usize = 16;

/// Validates an E.164 phone number and returns it trimmed.
pub fn validate_phone_number(raw: &str) -> Result<String, VoucherError> {
    let phone = raw.trim();
    if phone.len() < MIN_PHONE_LEN {
        return Err(VoucherError::invalid("Phone number seems too short."));
    }

    let valid = phone.len() <= MAX_PHONE_LEN
        && phone
            .strip_prefix('+')
            .map(|digits| {
                digits.chars().all(|c| c.is_ascii_digit()) && !digits.starts_with('0')
            })
            .unwrap_or(false);
    if !valid {
        return Err(VoucherError::invalid(
            "Please provide a valid phone number with country code.",
        ));
    }

    Ok(phone.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_phone_number() {
        assert_eq!(
            validate_phone_number(" +256712345678 ").unwrap(),
            "+256712345678"
        );

        let short = validate_phone_number("123").unwrap_err();
        assert_eq!(short.user_message(), "Phone number seems too short.");

        for bad in ["256712345678", "+056712345678", "+2567123x5678", "+25671234567890123"] {
            let err = validate_phone_number(bad).unwrap_err();
            assert_eq!(
                err.user_message(),
                "Please provide a valid phone number with country code.",
                "input={bad}"
            );
        }
    }
}
