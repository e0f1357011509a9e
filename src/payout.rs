//! Payout request workflow: `pending -> approved -> paid`, or `pending -> cancelled`.
//!
//! Funds leave `available_balance` only when a request is marked paid. Both
//! approval and payment re-check the balance under the ambassador lock.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{ReferralError, Result};
use crate::ledger::apply_redemption;
use crate::money::is_whole_cents;
use crate::store::AmbassadorUnit;
use crate::types::{LedgerEntry, NewPayoutRequest, PayoutRequest, PayoutStatus, PayoutType};

impl PayoutStatus {
    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Pending, PayoutStatus::Approved)
                | (PayoutStatus::Approved, PayoutStatus::Paid)
                | (PayoutStatus::Pending, PayoutStatus::Cancelled)
        )
    }

    pub fn transition_to(self, next: PayoutStatus) -> Result<PayoutStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ReferralError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PayoutStatus::Paid | PayoutStatus::Cancelled)
    }
}

fn ensure_covered(unit: &dyn AmbassadorUnit, amount: Decimal) -> Result<()> {
    let available = unit.ambassador().available_balance;
    if amount > available {
        return Err(ReferralError::InsufficientBalance {
            requested: amount,
            available,
        });
    }
    Ok(())
}

pub async fn request_payout(
    unit: &mut dyn AmbassadorUnit,
    amount: Decimal,
    payout_type: PayoutType,
) -> Result<PayoutRequest> {
    if amount <= Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(format!(
            "payout must be > 0, got {amount}"
        )));
    }
    if !is_whole_cents(amount) {
        return Err(ReferralError::InvalidAmount(format!(
            "payout {amount} has fractional cents"
        )));
    }
    ensure_covered(unit, amount)?;

    let ambassador_id = unit.ambassador().id;
    let payout = unit
        .insert_payout(NewPayoutRequest {
            ambassador_id,
            amount,
            payout_type,
        })
        .await?;
    info!(ambassador_id, payout_id = payout.id, %amount, "payout requested");
    Ok(payout)
}

pub async fn approve(
    unit: &mut dyn AmbassadorUnit,
    payout_id: i64,
    approved_by: i64,
) -> Result<PayoutRequest> {
    let mut payout = unit.load_payout(payout_id).await?;
    payout.status = payout.status.transition_to(PayoutStatus::Approved)?;
    ensure_covered(unit, payout.amount)?;

    let now = Utc::now();
    payout.approved_by = Some(approved_by);
    payout.approved_at = Some(now);
    payout.updated_at = now;
    unit.save_payout(&payout).await?;
    info!(payout_id, approved_by, "payout approved");
    Ok(payout)
}

pub async fn mark_paid(
    unit: &mut dyn AmbassadorUnit,
    payout_id: i64,
) -> Result<(PayoutRequest, LedgerEntry)> {
    let mut payout = unit.load_payout(payout_id).await?;
    payout.status = payout.status.transition_to(PayoutStatus::Paid)?;
    let entry = apply_redemption(unit, payout.amount, Some(payout.id)).await?;

    let now = Utc::now();
    payout.paid_at = Some(now);
    payout.updated_at = now;
    unit.save_payout(&payout).await?;
    info!(payout_id, amount = %payout.amount, "payout paid");
    Ok((payout, entry))
}

pub async fn cancel(unit: &mut dyn AmbassadorUnit, payout_id: i64) -> Result<PayoutRequest> {
    let mut payout = unit.load_payout(payout_id).await?;
    payout.status = payout.status.transition_to(PayoutStatus::Cancelled)?;

    let now = Utc::now();
    payout.cancelled_at = Some(now);
    payout.updated_at = now;
    unit.save_payout(&payout).await?;
    info!(payout_id, "payout cancelled");
    Ok(payout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::apply_accrual;
    use crate::store::{CommissionStore, MemoryStore};
    use crate::tiers::default_tiers;
    use crate::types::Ambassador;

    const ALL: [PayoutStatus; 4] = [
        PayoutStatus::Pending,
        PayoutStatus::Approved,
        PayoutStatus::Paid,
        PayoutStatus::Cancelled,
    ];

    fn dollars(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    async fn funded_store(cents: i64) -> MemoryStore {
        let store = MemoryStore::new(default_tiers());
        store
            .insert_ambassador(&Ambassador::new(1, "Admin", "User", "ADUS0001".into()))
            .await
            .unwrap();
        let mut unit = store.lock_ambassador(1).await.unwrap();
        apply_accrual(unit.as_mut(), dollars(cents), dollars(cents * 20), "seed").await.unwrap();
        unit.commit().await.unwrap();
        store
    }

    #[test]
    fn only_three_transitions_are_allowed() {
        let allowed: Vec<_> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            [
                (PayoutStatus::Pending, PayoutStatus::Approved),
                (PayoutStatus::Pending, PayoutStatus::Cancelled),
                (PayoutStatus::Approved, PayoutStatus::Paid),
            ]
        );
        assert!(PayoutStatus::Paid.is_terminal());
        assert!(PayoutStatus::Cancelled.is_terminal());
        assert!(matches!(
            PayoutStatus::Approved.transition_to(PayoutStatus::Cancelled),
            Err(ReferralError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn full_lifecycle_deducts_only_when_paid() {
        let store = funded_store(5_000).await;
        let mut unit = store.lock_ambassador(1).await.unwrap();

        let payout = request_payout(unit.as_mut(), dollars(2_000), PayoutType::StoreCredit)
            .await
            .unwrap();
        assert_eq!(payout.status, PayoutStatus::Pending);

        let approved = approve(unit.as_mut(), payout.id, 99).await.unwrap();
        assert_eq!(approved.status, PayoutStatus::Approved);
        assert_eq!(approved.approved_by, Some(99));
        assert_eq!(unit.ambassador().available_balance, dollars(5_000));

        let (paid, entry) = mark_paid(unit.as_mut(), payout.id).await.unwrap();
        assert_eq!(paid.status, PayoutStatus::Paid);
        assert_eq!(entry.payout_id, Some(payout.id));
        assert_eq!(unit.ambassador().available_balance, dollars(3_000));
        assert_eq!(unit.ambassador().total_earnings, dollars(5_000));
    }

    #[tokio::test]
    async fn request_validates_amount() {
        let store = funded_store(1_000).await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        assert!(matches!(
            request_payout(unit.as_mut(), Decimal::ZERO, PayoutType::Cash).await,
            Err(ReferralError::InvalidAmount(_))
        ));
        assert!(matches!(
            request_payout(unit.as_mut(), dollars(1_001), PayoutType::Cash).await,
            Err(ReferralError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            request_payout(unit.as_mut(), Decimal::new(1001, 3), PayoutType::Cash).await,
            Err(ReferralError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn approval_rechecks_shrunken_balance() {
        let store = funded_store(1_000).await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        let payout = request_payout(unit.as_mut(), dollars(800), PayoutType::StoreCredit)
            .await
            .unwrap();
        unit.ambassador_mut().available_balance = dollars(500);

        assert!(matches!(
            approve(unit.as_mut(), payout.id, 1).await,
            Err(ReferralError::InsufficientBalance { .. })
        ));
        assert_eq!(unit.load_payout(payout.id).await.unwrap().status, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let store = funded_store(1_000).await;
        let mut unit = store.lock_ambassador(1).await.unwrap();
        let first = request_payout(unit.as_mut(), dollars(100), PayoutType::Cash)
            .await
            .unwrap();
        let cancelled = cancel(unit.as_mut(), first.id).await.unwrap();
        assert_eq!(cancelled.status, PayoutStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(matches!(
            approve(unit.as_mut(), first.id, 1).await,
            Err(ReferralError::InvalidTransition { .. })
        ));

        let second = request_payout(unit.as_mut(), dollars(100), PayoutType::Cash)
            .await
            .unwrap();
        approve(unit.as_mut(), second.id, 1).await.unwrap();
        assert!(matches!(
            cancel(unit.as_mut(), second.id).await,
            Err(ReferralError::InvalidTransition { .. })
        ));
        assert_eq!(unit.ambassador().available_balance, dollars(1_000));
    }
}
