//! Entry points the POS calls on referral signups, sales, refunds and payouts.
//!
//! Each mutating call runs inside one ambassador unit of work, so the check
//! and the write of a balance happen under the same lock. Tiers are reloaded
//! and resolved per call from the current counters.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::codes::{generate_code, generate_link};
use crate::commission::{compute_accrual, compute_reversal, compute_void};
use crate::error::{ReferralError, Result};
use crate::ledger::{apply_accrual, apply_reversal};
use crate::money::is_whole_cents;
use crate::payout;
use crate::store::{AmbassadorUnit, CommissionStore};
use crate::tiers::TierCatalog;
use crate::types::{
    AccrualOutcome, Ambassador, CompletedPurchase, Dashboard, DashboardStats, LedgerEntry,
    LedgerEntryType, PayoutRequest, PayoutStatus, PayoutType, RefundEvent, ReversalOutcome,
    SignupOutcome, Tier, TierUpdate,
};

#[derive(Clone)]
pub struct CommissionEngine {
    store: Arc<dyn CommissionStore>,
    /// Storefront URL referral links point at.
    base_url: String,
}

impl CommissionEngine {
    pub fn new(store: Arc<dyn CommissionStore>, base_url: impl Into<String>) -> Self {
        Self {
            store,
            base_url: base_url.into(),
        }
    }

    async fn catalog(&self) -> Result<TierCatalog> {
        TierCatalog::new(self.store.list_tiers().await?)
    }

    /// Issues a referral code and opens the ambassador's balance.
    #[instrument(skip(self))]
    pub async fn enroll_ambassador(
        &self,
        id: i64,
        first_name: &str,
        last_name: &str,
    ) -> Result<Ambassador> {
        let code = generate_code(first_name, last_name, id)?;
        let ambassador = Ambassador::new(id, first_name, last_name, code);
        self.store.insert_ambassador(&ambassador).await?;
        info!(ambassador_id = id, code = %ambassador.referral_code, "ambassador enrolled");
        Ok(ambassador)
    }

    #[instrument(skip(self))]
    pub async fn on_referral_signup(
        &self,
        ambassador_id: i64,
        new_customer_id: i64,
    ) -> Result<SignupOutcome> {
        if ambassador_id == new_customer_id {
            return Err(ReferralError::Conflict(
                "an ambassador cannot refer themself".into(),
            ));
        }
        let catalog = self.catalog().await?;
        let mut unit = self.store.lock_ambassador(ambassador_id).await?;
        let before = current_tier(&catalog, unit.as_ref()).name.clone();

        unit.insert_referral(new_customer_id).await?;
        unit.ambassador_mut().lifetime_referral_count += 1;

        let count = unit.ambassador().lifetime_referral_count;
        let after = current_tier(&catalog, unit.as_ref()).clone();
        unit.commit().await?;

        let tier_changed = log_tier_change(ambassador_id, &before, &after.name);
        Ok(SignupOutcome {
            ambassador_id,
            customer_id: new_customer_id,
            lifetime_referral_count: count,
            tier: after.name,
            tier_changed,
            signup_bonus_points: after.signup_bonus_points,
        })
    }

    /// Accrues commission on a referred sale at the tier held before the sale.
    #[instrument(skip(self, purchase), fields(ambassador_id = purchase.ambassador_id, transaction_id = %purchase.transaction_id))]
    pub async fn on_purchase_completed(&self, purchase: CompletedPurchase) -> Result<AccrualOutcome> {
        ensure_cents("subtotal", purchase.subtotal)?;
        let catalog = self.catalog().await?;
        let mut unit = self.store.lock_ambassador(purchase.ambassador_id).await?;

        let prior = unit.entries_for_transaction(&purchase.transaction_id).await?;
        if prior.iter().any(|e| e.entry_type == LedgerEntryType::Accrual) {
            return Err(ReferralError::Conflict(format!(
                "transaction {} already accrued",
                purchase.transaction_id
            )));
        }

        let tier = current_tier(&catalog, unit.as_ref()).clone();
        let commission = compute_accrual(purchase.subtotal, &tier)?;
        let entry = apply_accrual(
            unit.as_mut(),
            commission,
            purchase.subtotal,
            &purchase.transaction_id,
        )
        .await?;
        if let Some(customer_id) = purchase.customer_id {
            if unit.mark_first_purchase(customer_id).await? {
                info!(customer_id, "referral became active");
            }
        }

        let after = current_tier(&catalog, unit.as_ref()).name.clone();
        let available_balance = unit.ambassador().available_balance;
        unit.commit().await?;

        let tier_changed = log_tier_change(purchase.ambassador_id, &tier.name, &after);
        Ok(AccrualOutcome {
            entry,
            commission,
            tier: tier.name,
            commission_rate: tier.commission_rate,
            tier_after: after,
            tier_changed,
            available_balance,
        })
    }

    /// Takes back commission for a refund, in proportion to the refunded share.
    #[instrument(skip(self, refund), fields(ambassador_id = refund.ambassador_id, transaction_id = %refund.original_transaction_id))]
    pub async fn on_purchase_voided_or_refunded(&self, refund: RefundEvent) -> Result<ReversalOutcome> {
        ensure_cents("refund", refund.refund_amount)?;
        let reversal = compute_reversal(
            refund.original_subtotal,
            refund.original_commission,
            refund.refund_amount,
        )?;
        let sales_delta = refund.refund_amount.min(refund.original_subtotal);
        self.reverse(refund, reversal, sales_delta).await
    }

    /// Full void of a commissioned sale.
    pub async fn on_purchase_voided(
        &self,
        ambassador_id: i64,
        transaction_id: &str,
        original_subtotal: Decimal,
        original_commission: Decimal,
    ) -> Result<ReversalOutcome> {
        let reversal = compute_void(original_commission)?;
        if original_subtotal < Decimal::ZERO {
            return Err(ReferralError::InvalidAmount(
                "subtotal must be >= 0".into(),
            ));
        }
        let refund = RefundEvent {
            ambassador_id,
            original_transaction_id: transaction_id.to_string(),
            original_subtotal,
            original_commission,
            refund_amount: original_subtotal,
        };
        self.reverse(refund, reversal, original_subtotal).await
    }

    async fn reverse(
        &self,
        refund: RefundEvent,
        reversal: Decimal,
        sales_delta: Decimal,
    ) -> Result<ReversalOutcome> {
        let catalog = self.catalog().await?;
        let mut unit = self.store.lock_ambassador(refund.ambassador_id).await?;
        let tx_id = refund.original_transaction_id.as_str();

        let prior = unit.entries_for_transaction(tx_id).await?;
        if !prior.iter().any(|e| e.entry_type == LedgerEntryType::Accrual) {
            return Err(ReferralError::NotFound(format!(
                "commission for transaction {tx_id}"
            )));
        }
        // accruals book positive amounts and reversals negative ones, so the
        // sums are what is still reversible
        let open_commission: Decimal = prior.iter().map(|e| e.amount).sum();
        let open_sales: Decimal = prior.iter().map(|e| e.sale_amount).sum();
        let reversed_before = prior
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Reversal);
        if reversed_before && open_commission <= Decimal::ZERO && open_sales <= Decimal::ZERO {
            return Err(ReferralError::Conflict(format!(
                "commission for transaction {tx_id} is already fully reversed"
            )));
        }
        let reversal = reversal.min(open_commission.max(Decimal::ZERO));
        let sales_delta = sales_delta.min(open_sales.max(Decimal::ZERO));

        let before = current_tier(&catalog, unit.as_ref()).name.clone();
        let (entry, shortfall) =
            apply_reversal(unit.as_mut(), reversal, sales_delta, tx_id).await?;

        let after = current_tier(&catalog, unit.as_ref()).name.clone();
        let available_balance = unit.ambassador().available_balance;
        unit.commit().await?;

        let tier_changed = log_tier_change(refund.ambassador_id, &before, &after);
        Ok(ReversalOutcome {
            entry,
            reversed: reversal,
            sales_reversed: sales_delta,
            shortfall,
            available_balance,
            tier_after: after,
            tier_changed,
        })
    }

    pub async fn get_dashboard(&self, ambassador_id: i64) -> Result<Dashboard> {
        let ambassador = self.store.get_ambassador(ambassador_id).await?;
        let catalog = self.catalog().await?;
        let active_referrals = self.store.count_active_referrals(ambassador_id).await?;

        let current = catalog.resolve(
            ambassador.lifetime_referral_count,
            ambassador.lifetime_referred_sales,
        );
        Ok(Dashboard {
            referral_link: generate_link(&self.base_url, &ambassador.referral_code),
            next_tier: catalog.next_tier(current).cloned(),
            tier_progress: catalog.progress(
                current,
                ambassador.lifetime_referral_count,
                ambassador.lifetime_referred_sales,
            ),
            current_tier: current.clone(),
            stats: DashboardStats {
                total_referrals: ambassador.lifetime_referral_count,
                active_referrals,
                total_earnings: ambassador.total_earnings,
                available_balance: ambassador.available_balance,
            },
            referral_code: ambassador.referral_code,
        })
    }

    pub async fn ledger(&self, ambassador_id: i64) -> Result<Vec<LedgerEntry>> {
        self.store.get_ambassador(ambassador_id).await?;
        self.store.ledger_entries(ambassador_id).await
    }

    #[instrument(skip(self))]
    pub async fn request_payout(
        &self,
        ambassador_id: i64,
        amount: Decimal,
        payout_type: PayoutType,
    ) -> Result<PayoutRequest> {
        let mut unit = self.store.lock_ambassador(ambassador_id).await?;
        let payout = payout::request_payout(unit.as_mut(), amount, payout_type).await?;
        unit.commit().await?;
        Ok(payout)
    }

    async fn lock_payout_owner(&self, payout_id: i64) -> Result<Box<dyn AmbassadorUnit>> {
        let owner = self.store.get_payout(payout_id).await?.ambassador_id;
        self.store.lock_ambassador(owner).await
    }

    #[instrument(skip(self))]
    pub async fn approve_payout(&self, payout_id: i64, approved_by: i64) -> Result<PayoutRequest> {
        let mut unit = self.lock_payout_owner(payout_id).await?;
        let payout = payout::approve(unit.as_mut(), payout_id, approved_by).await?;
        unit.commit().await?;
        Ok(payout)
    }

    #[instrument(skip(self))]
    pub async fn mark_payout_paid(&self, payout_id: i64) -> Result<PayoutRequest> {
        let mut unit = self.lock_payout_owner(payout_id).await?;
        let (payout, _) = payout::mark_paid(unit.as_mut(), payout_id).await?;
        unit.commit().await?;
        Ok(payout)
    }

    #[instrument(skip(self))]
    pub async fn cancel_payout(&self, payout_id: i64) -> Result<PayoutRequest> {
        let mut unit = self.lock_payout_owner(payout_id).await?;
        let payout = payout::cancel(unit.as_mut(), payout_id).await?;
        unit.commit().await?;
        Ok(payout)
    }

    pub async fn list_payouts(&self, status: Option<PayoutStatus>) -> Result<Vec<PayoutRequest>> {
        self.store.list_payouts(status).await
    }

    pub async fn list_tiers(&self) -> Result<Vec<Tier>> {
        Ok(self.catalog().await?.all_tiers().to_vec())
    }

    /// Edits one tier after checking the resulting ladder is still valid.
    /// Past ledger amounts are unaffected.
    #[instrument(skip(self))]
    pub async fn update_tier(&self, tier_id: i64, update: TierUpdate) -> Result<Tier> {
        let mut unit = self.store.lock_tiers().await?;
        let mut tiers = unit.tiers().to_vec();
        let tier = tiers
            .iter_mut()
            .find(|t| t.id == tier_id)
            .ok_or_else(|| ReferralError::NotFound(format!("tier {tier_id}")))?;
        tier.apply_update(update);
        let updated = tier.clone();

        TierCatalog::new(tiers)?;
        unit.save_tier(&updated).await?;
        unit.commit().await?;
        info!(tier = %updated.name, rate = %updated.commission_rate, "tier updated");
        Ok(updated)
    }
}

fn ensure_cents(what: &str, amount: Decimal) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(ReferralError::InvalidAmount(format!(
            "{what} must be >= 0, got {amount}"
        )));
    }
    if !is_whole_cents(amount) {
        return Err(ReferralError::InvalidAmount(format!(
            "{what} {amount} has fractional cents"
        )));
    }
    Ok(())
}

fn current_tier<'a>(catalog: &'a TierCatalog, unit: &dyn AmbassadorUnit) -> &'a Tier {
    let a = unit.ambassador();
    catalog.resolve(a.lifetime_referral_count, a.lifetime_referred_sales)
}

fn log_tier_change(ambassador_id: i64, before: &str, after: &str) -> bool {
    if before == after {
        return false;
    }
    info!(ambassador_id, from = before, to = after, "tier changed");
    true
}
