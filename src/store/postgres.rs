use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use super::{AmbassadorUnit, CommissionStore, TierUnit};
use crate::error::{ReferralError, Result};
use crate::types::{
    Ambassador, LedgerEntry, NewLedgerEntry, NewPayoutRequest, PayoutRequest, PayoutStatus,
    Referral, Tier,
};

const AMBASSADOR_COLUMNS: &str = "id, first_name, last_name, referral_code, lifetime_referral_count, \
     lifetime_referred_sales, total_earnings, available_balance, unrecovered_shortfall, \
     created_at, updated_at";

const LEDGER_COLUMNS: &str = "id, ambassador_id, entry_type, amount, sale_amount, \
     related_transaction_id, payout_id, created_at";

const TIER_COLUMNS: &str =
    "id, name, rank, min_referrals, min_sales, commission_rate, signup_bonus_points, is_active";

const PAYOUT_COLUMNS: &str = "id, ambassador_id, amount, payout_type, status, approved_by, \
     created_at, updated_at, approved_at, paid_at, cancelled_at";

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    ambassador_id: i64,
    entry_type: String,
    amount: Decimal,
    sale_amount: Decimal,
    related_transaction_id: Option<String>,
    payout_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = ReferralError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: row.id,
            ambassador_id: row.ambassador_id,
            entry_type: row.entry_type.parse()?,
            amount: row.amount,
            sale_amount: row.sale_amount,
            related_transaction_id: row.related_transaction_id,
            payout_id: row.payout_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: i64,
    ambassador_id: i64,
    amount: Decimal,
    payout_type: String,
    status: String,
    approved_by: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PayoutRow> for PayoutRequest {
    type Error = ReferralError;

    fn try_from(row: PayoutRow) -> Result<Self> {
        Ok(PayoutRequest {
            id: row.id,
            ambassador_id: row.ambassador_id,
            amount: row.amount,
            payout_type: row.payout_type.parse()?,
            status: row.status.parse()?,
            approved_by: row.approved_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            approved_at: row.approved_at,
            paid_at: row.paid_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = ReferralError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Postgres-backed store. Units lock the ambassador row with `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommissionStore for PgStore {
    async fn list_tiers(&self) -> Result<Vec<Tier>> {
        let tiers = sqlx::query_as::<_, Tier>(&format!(
            "SELECT {TIER_COLUMNS} FROM commission_tiers ORDER BY rank"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }

    async fn lock_tiers(&self) -> Result<Box<dyn TierUnit>> {
        let mut tx = self.pool.begin().await?;
        let tiers = sqlx::query_as::<_, Tier>(&format!(
            "SELECT {TIER_COLUMNS} FROM commission_tiers ORDER BY rank FOR UPDATE"
        ))
        .fetch_all(tx.as_mut())
        .await?;
        Ok(Box::new(PgTierUnit { tx, tiers }))
    }

    async fn insert_ambassador(&self, a: &Ambassador) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO ambassadors ({AMBASSADOR_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(a.id)
        .bind(&a.first_name)
        .bind(&a.last_name)
        .bind(&a.referral_code)
        .bind(a.lifetime_referral_count)
        .bind(a.lifetime_referred_sales)
        .bind(a.total_earnings)
        .bind(a.available_balance)
        .bind(a.unrecovered_shortfall)
        .bind(a.created_at)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ambassador(&self, id: i64) -> Result<Ambassador> {
        sqlx::query_as::<_, Ambassador>(&format!(
            "SELECT {AMBASSADOR_COLUMNS} FROM ambassadors WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ReferralError::NotFound(format!("ambassador {id}")))
    }

    async fn count_active_referrals(&self, ambassador_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM referrals
               WHERE ambassador_id = $1 AND first_purchase_at IS NOT NULL"#,
        )
        .bind(ambassador_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn ledger_entries(&self, ambassador_id: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM commission_ledger WHERE ambassador_id = $1 ORDER BY id"
        ))
        .bind(ambassador_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_payout(&self, id: i64) -> Result<PayoutRequest> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ReferralError::NotFound(format!("payout {id}")))?
        .try_into()
    }

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> Result<Vec<PayoutRequest>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests \
             WHERE $1::TEXT IS NULL OR status = $1 ORDER BY id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn lock_ambassador(&self, id: i64) -> Result<Box<dyn AmbassadorUnit>> {
        let mut tx = self.pool.begin().await?;
        let ambassador = sqlx::query_as::<_, Ambassador>(&format!(
            "SELECT {AMBASSADOR_COLUMNS} FROM ambassadors WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| ReferralError::NotFound(format!("ambassador {id}")))?;

        Ok(Box::new(PgUnit { tx, ambassador }))
    }
}

struct PgUnit {
    tx: Transaction<'static, Postgres>,
    ambassador: Ambassador,
}

#[async_trait]
impl AmbassadorUnit for PgUnit {
    fn ambassador(&self) -> &Ambassador {
        &self.ambassador
    }

    fn ambassador_mut(&mut self) -> &mut Ambassador {
        &mut self.ambassador
    }

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "INSERT INTO commission_ledger \
             (ambassador_id, entry_type, amount, sale_amount, related_transaction_id, payout_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {LEDGER_COLUMNS}"
        ))
        .bind(entry.ambassador_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.sale_amount)
        .bind(entry.related_transaction_id)
        .bind(entry.payout_id)
        .fetch_one(self.tx.as_mut())
        .await?;
        row.try_into()
    }

    async fn entries_for_transaction(&mut self, transaction_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM commission_ledger \
             WHERE ambassador_id = $1 AND related_transaction_id = $2 ORDER BY id"
        ))
        .bind(self.ambassador.id)
        .bind(transaction_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        convert_all(rows)
    }

    async fn insert_referral(&mut self, customer_id: i64) -> Result<Referral> {
        let referral = sqlx::query_as::<_, Referral>(
            r#"INSERT INTO referrals (customer_id, ambassador_id) VALUES ($1, $2)
               RETURNING customer_id, ambassador_id, created_at, first_purchase_at"#,
        )
        .bind(customer_id)
        .bind(self.ambassador.id)
        .fetch_one(self.tx.as_mut())
        .await
        .map_err(|e| match ReferralError::from(e) {
            ReferralError::Conflict(_) => {
                ReferralError::Conflict(format!("customer {customer_id} was already referred"))
            }
            other => other,
        })?;
        Ok(referral)
    }

    async fn mark_first_purchase(&mut self, customer_id: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE referrals SET first_purchase_at = NOW()
               WHERE customer_id = $1 AND ambassador_id = $2 AND first_purchase_at IS NULL"#,
        )
        .bind(customer_id)
        .bind(self.ambassador.id)
        .execute(self.tx.as_mut())
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn load_payout(&mut self, payout_id: i64) -> Result<PayoutRequest> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests \
             WHERE id = $1 AND ambassador_id = $2 FOR UPDATE"
        ))
        .bind(payout_id)
        .bind(self.ambassador.id)
        .fetch_optional(self.tx.as_mut())
        .await?
        .ok_or_else(|| ReferralError::NotFound(format!("payout {payout_id}")))?
        .try_into()
    }

    async fn insert_payout(&mut self, payout: NewPayoutRequest) -> Result<PayoutRequest> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "INSERT INTO payout_requests (ambassador_id, amount, payout_type, status) \
             VALUES ($1, $2, $3, $4) RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(payout.ambassador_id)
        .bind(payout.amount)
        .bind(payout.payout_type.as_str())
        .bind(PayoutStatus::Pending.as_str())
        .fetch_one(self.tx.as_mut())
        .await?
        .try_into()
    }

    async fn save_payout(&mut self, p: &PayoutRequest) -> Result<()> {
        sqlx::query(
            r#"UPDATE payout_requests
               SET status = $2, approved_by = $3, updated_at = $4,
                   approved_at = $5, paid_at = $6, cancelled_at = $7
               WHERE id = $1"#,
        )
        .bind(p.id)
        .bind(p.status.as_str())
        .bind(p.approved_by)
        .bind(p.updated_at)
        .bind(p.approved_at)
        .bind(p.paid_at)
        .bind(p.cancelled_at)
        .execute(self.tx.as_mut())
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgUnit { mut tx, ambassador } = *self;
        sqlx::query(
            r#"UPDATE ambassadors
               SET lifetime_referral_count = $2, lifetime_referred_sales = $3,
                   total_earnings = $4, available_balance = $5,
                   unrecovered_shortfall = $6, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(ambassador.id)
        .bind(ambassador.lifetime_referral_count)
        .bind(ambassador.lifetime_referred_sales)
        .bind(ambassador.total_earnings)
        .bind(ambassador.available_balance)
        .bind(ambassador.unrecovered_shortfall)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Holds row locks on every tier until commit.
struct PgTierUnit {
    tx: Transaction<'static, Postgres>,
    tiers: Vec<Tier>,
}

#[async_trait]
impl TierUnit for PgTierUnit {
    fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    async fn save_tier(&mut self, tier: &Tier) -> Result<()> {
        let res = sqlx::query(
            r#"UPDATE commission_tiers
               SET name = $2, rank = $3, min_referrals = $4, min_sales = $5,
                   commission_rate = $6, signup_bonus_points = $7, is_active = $8
               WHERE id = $1"#,
        )
        .bind(tier.id)
        .bind(&tier.name)
        .bind(tier.rank)
        .bind(tier.min_referrals)
        .bind(tier.min_sales)
        .bind(tier.commission_rate)
        .bind(tier.signup_bonus_points)
        .bind(tier.is_active)
        .execute(self.tx.as_mut())
        .await?;

        if res.rows_affected() == 0 {
            return Err(ReferralError::NotFound(format!("tier {}", tier.id)));
        }
        if let Some(slot) = self.tiers.iter_mut().find(|t| t.id == tier.id) {
            *slot = tier.clone();
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgTierUnit { tx, .. } = *self;
        tx.commit().await?;
        Ok(())
    }
}
