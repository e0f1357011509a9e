//! Persistence seam for the commission engine.
//!
//! Every balance change happens inside an [`AmbassadorUnit`]: a unit of work
//! holding the ambassador's exclusive lock from the first read to `commit`.
//! Dropping a unit without committing discards everything it staged.
//! Tier edits go through a [`TierUnit`] the same way.

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Ambassador, LedgerEntry, NewLedgerEntry, NewPayoutRequest, PayoutRequest, PayoutStatus,
    Referral, Tier,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait CommissionStore: Send + Sync {
    async fn list_tiers(&self) -> Result<Vec<Tier>>;

    /// Opens a unit of work on the whole tier ladder, waiting for any other editor.
    async fn lock_tiers(&self) -> Result<Box<dyn TierUnit>>;

    /// Fails with `Conflict` when the id or referral code is taken.
    async fn insert_ambassador(&self, ambassador: &Ambassador) -> Result<()>;

    async fn get_ambassador(&self, id: i64) -> Result<Ambassador>;

    /// Referred customers of `ambassador_id` who completed at least one purchase.
    async fn count_active_referrals(&self, ambassador_id: i64) -> Result<i64>;

    async fn ledger_entries(&self, ambassador_id: i64) -> Result<Vec<LedgerEntry>>;

    async fn get_payout(&self, id: i64) -> Result<PayoutRequest>;

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> Result<Vec<PayoutRequest>>;

    /// Opens a unit of work on one ambassador, waiting for any other holder.
    async fn lock_ambassador(&self, id: i64) -> Result<Box<dyn AmbassadorUnit>>;
}

#[async_trait]
pub trait AmbassadorUnit: Send {
    fn ambassador(&self) -> &Ambassador;

    fn ambassador_mut(&mut self) -> &mut Ambassador;

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry>;

    /// Ledger entries of this ambassador tied to `transaction_id`.
    async fn entries_for_transaction(&mut self, transaction_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Records `customer_id` as referred by this ambassador. A customer is referred at most once.
    async fn insert_referral(&mut self, customer_id: i64) -> Result<Referral>;

    /// Stamps the first purchase of a customer referred by this ambassador.
    /// Returns `true` only when the referral just became active.
    async fn mark_first_purchase(&mut self, customer_id: i64) -> Result<bool>;

    /// Loads a payout owned by this ambassador.
    async fn load_payout(&mut self, payout_id: i64) -> Result<PayoutRequest>;

    async fn insert_payout(&mut self, payout: NewPayoutRequest) -> Result<PayoutRequest>;

    async fn save_payout(&mut self, payout: &PayoutRequest) -> Result<()>;

    /// Persists the ambassador snapshot and everything staged, then releases the lock.
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TierUnit: Send {
    /// The ladder as read under the lock, with staged edits applied.
    fn tiers(&self) -> &[Tier];

    /// Overwrites an existing tier.
    async fn save_tier(&mut self, tier: &Tier) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
