use rust_decimal::Decimal;

use crate::error::{ReferralError, Result};
use crate::money::round2;
use crate::types::Tier;

/// Commission earned on a referred purchase, frozen at accrual time.
pub fn compute_accrual(subtotal: Decimal, tier: &Tier) -> Result<Decimal> {
    if subtotal < Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(format!(
            "subtotal must be >= 0, got {subtotal}"
        )));
    }
    Ok(round2(subtotal * tier.commission_rate))
}

/// Share of `original_commission` to take back for a refund of `refund_amount`.
///
/// The refund is capped at the original subtotal so the reversal can never
/// exceed the commission that was paid out.
pub fn compute_reversal(
    original_subtotal: Decimal,
    original_commission: Decimal,
    refund_amount: Decimal,
) -> Result<Decimal> {
    if original_subtotal < Decimal::ZERO
        || original_commission < Decimal::ZERO
        || refund_amount < Decimal::ZERO
    {
        return Err(ReferralError::InvalidAmount(
            "refund inputs must be >= 0".into(),
        ));
    }
    if original_subtotal.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let refunded = refund_amount.min(original_subtotal);
    let reversal = round2(refunded / original_subtotal * original_commission);
    Ok(reversal.min(original_commission))
}

/// A void takes back the whole commission.
pub fn compute_void(original_commission: Decimal) -> Result<Decimal> {
    if original_commission < Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(
            "commission must be >= 0".into(),
        ));
    }
    Ok(original_commission)
}
