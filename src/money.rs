use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds a currency amount to cents, half away from zero.
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// True when `amount` carries nothing below the cent.
pub fn is_whole_cents(amount: Decimal) -> bool {
    round2(amount) == amount
}

/// `part / whole` as a percentage capped at 100. A zero `whole` counts as complete.
pub fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole <= Decimal::ZERO {
        return Decimal::ONE_HUNDRED;
    }
    round2(part.max(Decimal::ZERO) / whole * Decimal::ONE_HUNDRED).min(Decimal::ONE_HUNDRED)
}
