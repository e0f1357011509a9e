//! Balance bookkeeping on a locked ambassador.
//!
//! `total_earnings` tracks accruals net of reversals. `available_balance` also
//! nets out redemptions and never drops below zero: a reversal larger than
//! what is left is floored at zero and the remainder is booked as
//! `unrecovered_shortfall` for reconciliation.
//!
//! Entries also carry the referred sales they book, and
//! `lifetime_referred_sales` moves with them.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{ReferralError, Result};
use crate::store::AmbassadorUnit;
use crate::types::{LedgerEntry, LedgerEntryType, NewLedgerEntry};

fn non_negative(what: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(format!(
            "{what} must be >= 0, got {value}"
        )));
    }
    Ok(())
}

/// Books `amount` of commission earned on a sale of `sale`.
pub async fn apply_accrual(
    unit: &mut dyn AmbassadorUnit,
    amount: Decimal,
    sale: Decimal,
    transaction_id: &str,
) -> Result<LedgerEntry> {
    non_negative("accrual", amount)?;
    non_negative("sale", sale)?;
    let ambassador_id = unit.ambassador().id;
    let entry = unit
        .append_entry(NewLedgerEntry {
            ambassador_id,
            entry_type: LedgerEntryType::Accrual,
            amount,
            sale_amount: sale,
            related_transaction_id: Some(transaction_id.to_string()),
            payout_id: None,
        })
        .await?;

    let a = unit.ambassador_mut();
    a.total_earnings += amount;
    a.available_balance += amount;
    a.lifetime_referred_sales += sale;
    debug!(ambassador_id, transaction_id, %amount, %sale, "commission accrued");
    Ok(entry)
}

/// Books a reversal of `amount` (a magnitude) that takes back `sale` of
/// referred sales. Returns the entry and any shortfall.
pub async fn apply_reversal(
    unit: &mut dyn AmbassadorUnit,
    amount: Decimal,
    sale: Decimal,
    transaction_id: &str,
) -> Result<(LedgerEntry, Decimal)> {
    non_negative("reversal", amount)?;
    non_negative("refunded sale", sale)?;
    let ambassador_id = unit.ambassador().id;
    let entry = unit
        .append_entry(NewLedgerEntry {
            ambassador_id,
            entry_type: LedgerEntryType::Reversal,
            amount: -amount,
            sale_amount: -sale,
            related_transaction_id: Some(transaction_id.to_string()),
            payout_id: None,
        })
        .await?;

    let a = unit.ambassador_mut();
    let shortfall = (amount - a.available_balance).max(Decimal::ZERO);
    a.total_earnings -= amount;
    a.available_balance = (a.available_balance - amount).max(Decimal::ZERO);
    a.unrecovered_shortfall += shortfall;
    a.lifetime_referred_sales -= sale;

    if shortfall > Decimal::ZERO {
        warn!(
            ambassador_id,
            transaction_id,
            %amount,
            %shortfall,
            "reversal exceeds available balance; clamped at zero, needs reconciliation"
        );
    } else {
        debug!(ambassador_id, transaction_id, %amount, %sale, "commission reversed");
    }
    Ok((entry, shortfall))
}

pub async fn apply_redemption(
    unit: &mut dyn AmbassadorUnit,
    amount: Decimal,
    payout_id: Option<i64>,
) -> Result<LedgerEntry> {
    if amount <= Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(format!(
            "redemption must be > 0, got {amount}"
        )));
    }
    let available = unit.ambassador().available_balance;
    if amount > available {
        return Err(ReferralError::InsufficientBalance {
            requested: amount,
            available,
        });
    }
    let ambassador_id = unit.ambassador().id;
    let entry = unit
        .append_entry(NewLedgerEntry {
            ambassador_id,
            entry_type: LedgerEntryType::Redemption,
            amount: -amount,
            sale_amount: Decimal::ZERO,
            related_transaction_id: None,
            payout_id,
        })
        .await?;

    unit.ambassador_mut().available_balance -= amount;
    debug!(ambassador_id, ?payout_id, %amount, "balance redeemed");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommissionStore, MemoryStore};
    use crate::tiers::default_tiers;
    use crate::types::Ambassador;
    use proptest::prelude::*;

    fn dollars(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new(default_tiers());
        store
            .insert_ambassador(&Ambassador::new(1, "Admin", "User", "ADUS0001".into()))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn accrual_then_reversal_nets_to_zero() {
        let store = store().await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        apply_accrual(unit.as_mut(), dollars(500), dollars(10_000), "t1").await.unwrap();
        apply_reversal(unit.as_mut(), dollars(500), dollars(10_000), "t1").await.unwrap();
        unit.commit().await.unwrap();

        let a = store.get_ambassador(1).await.unwrap();
        assert_eq!(a.total_earnings, Decimal::ZERO);
        assert_eq!(a.available_balance, Decimal::ZERO);
        assert_eq!(a.lifetime_referred_sales, Decimal::ZERO);
        let amounts: Vec<_> = store
            .ledger_entries(1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.amount)
            .collect();
        assert_eq!(amounts, [dollars(500), dollars(-500)]);
    }

    #[tokio::test]
    async fn redemption_leaves_earnings_untouched() {
        let store = store().await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        apply_accrual(unit.as_mut(), dollars(1_000), dollars(10_000), "t1").await.unwrap();
        let entry = apply_redemption(unit.as_mut(), dollars(400), Some(3)).await.unwrap();
        assert_eq!(entry.amount, dollars(-400));
        assert_eq!(entry.entry_type, LedgerEntryType::Redemption);
        assert_eq!(unit.ambassador().total_earnings, dollars(1_000));
        assert_eq!(unit.ambassador().available_balance, dollars(600));
    }

    #[tokio::test]
    async fn over_redemption_fails_without_changes() {
        let store = store().await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        apply_accrual(unit.as_mut(), dollars(100), dollars(2_000), "t1").await.unwrap();
        let err = apply_redemption(unit.as_mut(), dollars(101), None).await.unwrap_err();
        assert!(matches!(err, ReferralError::InsufficientBalance { .. }));
        assert_eq!(unit.ambassador().available_balance, dollars(100));
        assert!(matches!(
            apply_redemption(unit.as_mut(), Decimal::ZERO, None).await,
            Err(ReferralError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn reversal_after_redemption_clamps_and_records_shortfall() {
        let store = store().await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        apply_accrual(unit.as_mut(), dollars(1_000), dollars(10_000), "t1").await.unwrap();
        apply_redemption(unit.as_mut(), dollars(800), None).await.unwrap();
        let (_, shortfall) = apply_reversal(unit.as_mut(), dollars(1_000), dollars(10_000), "t1")
            .await
            .unwrap();

        assert_eq!(shortfall, dollars(800));
        let a = unit.ambassador();
        assert_eq!(a.available_balance, Decimal::ZERO);
        assert_eq!(a.total_earnings, Decimal::ZERO);
        assert_eq!(a.unrecovered_shortfall, dollars(800));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Accrue(i64),
        Reverse(i64),
        Redeem(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..100_000).prop_map(Op::Accrue),
            (0i64..100_000).prop_map(Op::Reverse),
            (1i64..100_000).prop_map(Op::Redeem),
        ]
    }

    proptest! {
        #[test]
        fn balance_never_negative_and_ledger_reconciles(ops in prop::collection::vec(op(), 1..40)) {
            tokio_test::block_on(async {
                let store = store().await;
                for (i, op) in ops.iter().enumerate() {
                    let tx = format!("t{i}");
                    let mut unit = store.lock_ambassador(1).await.unwrap();
                    let before = unit.ambassador().available_balance;
                    let res = match op {
                        Op::Accrue(c) => apply_accrual(unit.as_mut(), dollars(*c), dollars(*c * 20), &tx).await.map(|_| ()),
                        Op::Reverse(c) => apply_reversal(unit.as_mut(), dollars(*c), Decimal::ZERO, &tx).await.map(|_| ()),
                        Op::Redeem(c) => apply_redemption(unit.as_mut(), dollars(*c), None).await.map(|_| ()),
                    };
                    match res {
                        Ok(()) => unit.commit().await.unwrap(),
                        Err(ReferralError::InsufficientBalance { .. }) => {
                            assert_eq!(unit.ambassador().available_balance, before);
                        }
                        Err(e) => panic!("unexpected error {e}"),
                    }
                    let a = store.get_ambassador(1).await.unwrap();
                    assert!(a.available_balance >= Decimal::ZERO);
                }

                let a = store.get_ambassador(1).await.unwrap();
                let entries = store.ledger_entries(1).await.unwrap();
                let earned: Decimal = entries
                    .iter()
                    .filter(|e| e.entry_type != LedgerEntryType::Redemption)
                    .map(|e| e.amount)
                    .sum();
                let net: Decimal = entries.iter().map(|e| e.amount).sum();
                let sales: Decimal = entries.iter().map(|e| e.sale_amount).sum();
                assert_eq!(a.total_earnings, earned);
                assert_eq!(a.lifetime_referred_sales, sales);
                assert_eq!(a.available_balance, net + a.unrecovered_shortfall);
            });
        }
    }
}
