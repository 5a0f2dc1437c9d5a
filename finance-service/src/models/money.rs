//! Money helpers. Amounts are `Decimal` shillings held at cent precision.

use rust_decimal::{Decimal, RoundingStrategy};

pub const CURRENCY: &str = "KES";

/// Round to cents, half away from zero.
pub fn to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Render an amount for display, e.g. `KES 20,000` or `-KES 1,500`.
pub fn format_kes(amount: Decimal) -> String {
    let whole = amount
        .abs()
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .trunc()
        .to_string();

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if amount.is_sign_negative() && !amount.is_zero() {
        format!("-{} {}", CURRENCY, grouped)
    } else {
        format!("{} {}", CURRENCY, grouped)
    }
}
