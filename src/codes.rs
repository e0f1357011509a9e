use crate::error::{ReferralError, Result};

fn prefix(name: &str) -> String {
    name.trim().chars().take(2).flat_map(char::to_uppercase).collect()
}

/// Builds a referral code such as `ADUS0001` from name initials and the owner id.
///
/// Ids longer than four digits are kept whole.
pub fn generate_code(first_name: &str, last_name: &str, id: i64) -> Result<String> {
    let letters = format!("{}{}", prefix(first_name), prefix(last_name));
    if letters.is_empty() {
        return Err(ReferralError::InvalidName);
    }
    Ok(format!("{letters}{id:04}"))
}

pub fn generate_link(base_url: &str, code: &str) -> String {
    format!("{}/signup?ref={}", base_url.trim_end_matches('/'), code)
}
