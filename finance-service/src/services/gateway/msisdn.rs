//! Kenyan mobile number normalisation.

use super::Provider;
use crate::error::GatewayError;

/// Normalise a Kenyan mobile number to `2547XXXXXXXX` / `2541XXXXXXXX`.
///
/// Accepts `07..`, `01..`, `7..`, `1..`, `2547..`, `2541..` and `+254..`
/// with optional spaces or dashes.
pub fn normalize_msisdn(provider: Provider, raw: &str) -> Result<String, GatewayError> {
    let invalid = || GatewayError::InvalidPhone {
        provider: provider.as_str(),
        phone: raw.to_string(),
    };

    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let subscriber = match digits.len() {
        12 if digits.starts_with("254") => &digits[3..],
        10 if digits.starts_with('0') => &digits[1..],
        9 => digits,
        _ => return Err(invalid()),
    };

    if subscriber.starts_with('7') || subscriber.starts_with('1') {
        Ok(format!("254{}", subscriber))
    } else {
        Err(invalid())
    }
}
