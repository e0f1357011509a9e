use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;

/// A commission bracket. Tiers are ordered by `rank`, lowest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tier {
    pub id: i64,
    pub name: String,
    pub rank: i32,
    /// Lifetime referred accounts required.
    pub min_referrals: i64,
    /// Lifetime referred-customer subtotal required.
    pub min_sales: Decimal,
    /// Fraction of a referred subtotal paid as commission, in `[0, 1]`.
    pub commission_rate: Decimal,
    pub signup_bonus_points: i64,
    /// Inactive tiers never resolve but stay around for audit.
    pub is_active: bool,
}

/// Admin edit of a tier. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierUpdate {
    pub name: Option<String>,
    pub commission_rate: Option<Decimal>,
    pub min_referrals: Option<i64>,
    pub min_sales: Option<Decimal>,
    pub signup_bonus_points: Option<i64>,
    pub is_active: Option<bool>,
}

impl Tier {
    pub fn apply_update(&mut self, update: TierUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(rate) = update.commission_rate {
            self.commission_rate = rate;
        }
        if let Some(min_referrals) = update.min_referrals {
            self.min_referrals = min_referrals;
        }
        if let Some(min_sales) = update.min_sales {
            self.min_sales = min_sales;
        }
        if let Some(points) = update.signup_bonus_points {
            self.signup_bonus_points = points;
        }
        if let Some(active) = update.is_active {
            self.is_active = active;
        }
    }
}

/// A user enrolled in the referral program.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Ambassador {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub referral_code: String,
    pub lifetime_referral_count: i64,
    pub lifetime_referred_sales: Decimal,
    pub total_earnings: Decimal,
    pub available_balance: Decimal,
    /// Reversed commission that could not be taken back from an already spent balance.
    pub unrecovered_shortfall: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ambassador {
    pub fn new(id: i64, first_name: &str, last_name: &str, referral_code: String) -> Self {
        let now = Utc::now();
        Ambassador {
            id,
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            referral_code,
            lifetime_referral_count: 0,
            lifetime_referred_sales: Decimal::ZERO,
            total_earnings: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            unrecovered_shortfall: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The link between a referred customer and the ambassador who brought them in.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Referral {
    pub customer_id: i64,
    pub ambassador_id: i64,
    pub created_at: DateTime<Utc>,
    pub first_purchase_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Accrual,
    Reversal,
    Redemption,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Accrual => "accrual",
            LedgerEntryType::Reversal => "reversal",
            LedgerEntryType::Redemption => "redemption",
        }
    }
}

impl fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryType {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accrual" => Ok(LedgerEntryType::Accrual),
            "reversal" => Ok(LedgerEntryType::Reversal),
            "redemption" => Ok(LedgerEntryType::Redemption),
            other => Err(ReferralError::Storage(anyhow::anyhow!(
                "unknown ledger entry type {other:?}"
            ))),
        }
    }
}

/// An append-only balance movement. Reversals and redemptions carry negative amounts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub ambassador_id: i64,
    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    /// Referred sales booked by this entry: the subtotal on accruals, minus the
    /// refunded part on reversals, zero on redemptions.
    pub sale_amount: Decimal,
    pub related_transaction_id: Option<String>,
    pub payout_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub ambassador_id: i64,
    pub entry_type: LedgerEntryType,
    pub amount: Decimal,
    pub sale_amount: Decimal,
    pub related_transaction_id: Option<String>,
    pub payout_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Paid,
    Cancelled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "approved" => Ok(PayoutStatus::Approved),
            "paid" => Ok(PayoutStatus::Paid),
            "cancelled" => Ok(PayoutStatus::Cancelled),
            other => Err(ReferralError::Storage(anyhow::anyhow!(
                "unknown payout status {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    #[default]
    StoreCredit,
    Cash,
}

impl PayoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutType::StoreCredit => "store_credit",
            PayoutType::Cash => "cash",
        }
    }
}

impl FromStr for PayoutType {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "store_credit" => Ok(PayoutType::StoreCredit),
            "cash" => Ok(PayoutType::Cash),
            other => Err(ReferralError::Storage(anyhow::anyhow!(
                "unknown payout type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutRequest {
    pub id: i64,
    pub ambassador_id: i64,
    pub amount: Decimal,
    pub payout_type: PayoutType,
    pub status: PayoutStatus,
    pub approved_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayoutRequest {
    pub ambassador_id: i64,
    pub amount: Decimal,
    pub payout_type: PayoutType,
}

/// A completed sale whose buyer was referred by `ambassador_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletedPurchase {
    pub ambassador_id: i64,
    pub transaction_id: String,
    pub customer_id: Option<i64>,
    /// Pre-tax, pre-loyalty-discount amount.
    pub subtotal: Decimal,
}

/// A void or (partial) refund of a previously commissioned sale.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundEvent {
    pub ambassador_id: i64,
    pub original_transaction_id: String,
    pub original_subtotal: Decimal,
    pub original_commission: Decimal,
    pub refund_amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignupOutcome {
    pub ambassador_id: i64,
    pub customer_id: i64,
    pub lifetime_referral_count: i64,
    pub tier: String,
    pub tier_changed: bool,
    /// Points the POS should credit to the new customer.
    pub signup_bonus_points: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccrualOutcome {
    pub entry: LedgerEntry,
    pub commission: Decimal,
    pub tier: String,
    pub commission_rate: Decimal,
    pub tier_after: String,
    pub tier_changed: bool,
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReversalOutcome {
    pub entry: LedgerEntry,
    pub reversed: Decimal,
    /// Referred sales taken back by this reversal.
    pub sales_reversed: Decimal,
    /// Portion that could not be deducted because the balance was already redeemed.
    pub shortfall: Decimal,
    pub available_balance: Decimal,
    pub tier_after: String,
    pub tier_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisProgress {
    pub current: Decimal,
    pub required: Decimal,
    pub remaining: Decimal,
    pub percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierProgress {
    pub next_tier: String,
    pub referrals: AxisProgress,
    pub sales: AxisProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_referrals: i64,
    pub active_referrals: i64,
    pub total_earnings: Decimal,
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub referral_code: String,
    pub referral_link: String,
    pub current_tier: Tier,
    pub next_tier: Option<Tier>,
    pub tier_progress: Option<TierProgress>,
    pub stats: DashboardStats,
}
