use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{AmbassadorUnit, CommissionStore, TierUnit};
use crate::error::{ReferralError, Result};
use crate::types::{
    Ambassador, LedgerEntry, NewLedgerEntry, NewPayoutRequest, PayoutRequest, PayoutStatus,
    Referral, Tier,
};

#[derive(Default)]
struct State {
    tiers: Vec<Tier>,
    ambassadors: HashMap<i64, Ambassador>,
    /// Keyed by referred customer id.
    referrals: HashMap<i64, Referral>,
    ledger: Vec<LedgerEntry>,
    payouts: BTreeMap<i64, PayoutRequest>,
    next_entry_id: i64,
    next_payout_id: i64,
}

impl State {
    fn referral_taken(&self, customer_id: i64) -> Result<()> {
        if self.referrals.contains_key(&customer_id) {
            return Err(ReferralError::Conflict(format!(
                "customer {customer_id} was already referred"
            )));
        }
        Ok(())
    }
}

/// Process-local store. Balances are serialized per ambassador with async locks.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
    tier_lock: Arc<AsyncMutex<()>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new(tiers: Vec<Tier>) -> Self {
        let store = MemoryStore::default();
        guard(&store.state).tiers = tiers;
        store
    }

    fn ambassador_lock(&self, id: i64) -> Arc<AsyncMutex<()>> {
        guard(&self.locks).entry(id).or_default().clone()
    }
}

#[async_trait]
impl CommissionStore for MemoryStore {
    async fn list_tiers(&self) -> Result<Vec<Tier>> {
        Ok(guard(&self.state).tiers.clone())
    }

    async fn lock_tiers(&self) -> Result<Box<dyn TierUnit>> {
        let lock = self.tier_lock.clone().lock_owned().await;
        let tiers = guard(&self.state).tiers.clone();
        Ok(Box::new(MemoryTierUnit {
            _lock: lock,
            state: self.state.clone(),
            tiers,
        }))
    }

    async fn insert_ambassador(&self, ambassador: &Ambassador) -> Result<()> {
        let mut state = guard(&self.state);
        if state.ambassadors.contains_key(&ambassador.id) {
            return Err(ReferralError::Conflict(format!(
                "ambassador {} already enrolled",
                ambassador.id
            )));
        }
        if state
            .ambassadors
            .values()
            .any(|a| a.referral_code == ambassador.referral_code)
        {
            return Err(ReferralError::Conflict(format!(
                "referral code {} is taken",
                ambassador.referral_code
            )));
        }
        state.ambassadors.insert(ambassador.id, ambassador.clone());
        Ok(())
    }

    async fn get_ambassador(&self, id: i64) -> Result<Ambassador> {
        guard(&self.state)
            .ambassadors
            .get(&id)
            .cloned()
            .ok_or_else(|| ReferralError::NotFound(format!("ambassador {id}")))
    }

    async fn count_active_referrals(&self, ambassador_id: i64) -> Result<i64> {
        let state = guard(&self.state);
        let active = state
            .referrals
            .values()
            .filter(|r| r.ambassador_id == ambassador_id && r.first_purchase_at.is_some())
            .count();
        Ok(active as i64)
    }

    async fn ledger_entries(&self, ambassador_id: i64) -> Result<Vec<LedgerEntry>> {
        let state = guard(&self.state);
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.ambassador_id == ambassador_id)
            .cloned()
            .collect())
    }

    async fn get_payout(&self, id: i64) -> Result<PayoutRequest> {
        guard(&self.state)
            .payouts
            .get(&id)
            .cloned()
            .ok_or_else(|| ReferralError::NotFound(format!("payout {id}")))
    }

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> Result<Vec<PayoutRequest>> {
        let state = guard(&self.state);
        Ok(state
            .payouts
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .cloned()
            .collect())
    }

    async fn lock_ambassador(&self, id: i64) -> Result<Box<dyn AmbassadorUnit>> {
        // fail fast on unknown ids before creating a lock for them
        self.get_ambassador(id).await?;
        let lock = self.ambassador_lock(id).lock_owned().await;
        let ambassador = self.get_ambassador(id).await?;
        Ok(Box::new(MemoryUnit {
            _lock: lock,
            state: self.state.clone(),
            ambassador,
            entries: Vec::new(),
            referrals: HashMap::new(),
            payouts: BTreeMap::new(),
        }))
    }
}

struct MemoryUnit {
    _lock: OwnedMutexGuard<()>,
    state: Arc<Mutex<State>>,
    ambassador: Ambassador,
    entries: Vec<LedgerEntry>,
    referrals: HashMap<i64, Referral>,
    payouts: BTreeMap<i64, PayoutRequest>,
}

impl MemoryUnit {
    fn find_referral(&self, customer_id: i64) -> Option<Referral> {
        self.referrals
            .get(&customer_id)
            .cloned()
            .or_else(|| guard(&self.state).referrals.get(&customer_id).cloned())
    }
}

#[async_trait]
impl AmbassadorUnit for MemoryUnit {
    fn ambassador(&self) -> &Ambassador {
        &self.ambassador
    }

    fn ambassador_mut(&mut self) -> &mut Ambassador {
        &mut self.ambassador
    }

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let id = {
            let mut state = guard(&self.state);
            state.next_entry_id += 1;
            state.next_entry_id
        };
        let entry = LedgerEntry {
            id,
            ambassador_id: entry.ambassador_id,
            entry_type: entry.entry_type,
            amount: entry.amount,
            sale_amount: entry.sale_amount,
            related_transaction_id: entry.related_transaction_id,
            payout_id: entry.payout_id,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries_for_transaction(&mut self, transaction_id: &str) -> Result<Vec<LedgerEntry>> {
        let ambassador_id = self.ambassador.id;
        let matches = |e: &&LedgerEntry| {
            e.ambassador_id == ambassador_id
                && e.related_transaction_id.as_deref() == Some(transaction_id)
        };
        let mut found: Vec<LedgerEntry> = guard(&self.state)
            .ledger
            .iter()
            .filter(matches)
            .cloned()
            .collect();
        found.extend(self.entries.iter().filter(matches).cloned());
        Ok(found)
    }

    async fn insert_referral(&mut self, customer_id: i64) -> Result<Referral> {
        if self.find_referral(customer_id).is_some() {
            return Err(ReferralError::Conflict(format!(
                "customer {customer_id} was already referred"
            )));
        }
        let referral = Referral {
            customer_id,
            ambassador_id: self.ambassador.id,
            created_at: Utc::now(),
            first_purchase_at: None,
        };
        self.referrals.insert(customer_id, referral.clone());
        Ok(referral)
    }

    async fn mark_first_purchase(&mut self, customer_id: i64) -> Result<bool> {
        match self.find_referral(customer_id) {
            Some(mut referral)
                if referral.ambassador_id == self.ambassador.id
                    && referral.first_purchase_at.is_none() =>
            {
                referral.first_purchase_at = Some(Utc::now());
                self.referrals.insert(customer_id, referral);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_payout(&mut self, payout_id: i64) -> Result<PayoutRequest> {
        let payout = match self.payouts.get(&payout_id) {
            Some(p) => Some(p.clone()),
            None => guard(&self.state).payouts.get(&payout_id).cloned(),
        };
        payout
            .filter(|p| p.ambassador_id == self.ambassador.id)
            .ok_or_else(|| ReferralError::NotFound(format!("payout {payout_id}")))
    }

    async fn insert_payout(&mut self, payout: NewPayoutRequest) -> Result<PayoutRequest> {
        let id = {
            let mut state = guard(&self.state);
            state.next_payout_id += 1;
            state.next_payout_id
        };
        let now = Utc::now();
        let payout = PayoutRequest {
            id,
            ambassador_id: payout.ambassador_id,
            amount: payout.amount,
            payout_type: payout.payout_type,
            status: PayoutStatus::Pending,
            approved_by: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            paid_at: None,
            cancelled_at: None,
        };
        self.payouts.insert(id, payout.clone());
        Ok(payout)
    }

    async fn save_payout(&mut self, payout: &PayoutRequest) -> Result<()> {
        self.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnit {
            _lock,
            state,
            mut ambassador,
            entries,
            referrals,
            payouts,
        } = *self;

        let mut state = guard(&state);
        for (customer_id, referral) in &referrals {
            let owned_here = state
                .referrals
                .get(customer_id)
                .is_some_and(|r| r.ambassador_id == referral.ambassador_id);
            if !owned_here {
                state.referral_taken(*customer_id)?;
            }
        }

        ambassador.updated_at = Utc::now();
        state.ambassadors.insert(ambassador.id, ambassador);
        state.ledger.extend(entries);
        state.referrals.extend(referrals);
        state.payouts.extend(payouts);
        Ok(())
    }
}

struct MemoryTierUnit {
    _lock: OwnedMutexGuard<()>,
    state: Arc<Mutex<State>>,
    tiers: Vec<Tier>,
}

#[async_trait]
impl TierUnit for MemoryTierUnit {
    fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    async fn save_tier(&mut self, tier: &Tier) -> Result<()> {
        let slot = self
            .tiers
            .iter_mut()
            .find(|t| t.id == tier.id)
            .ok_or_else(|| ReferralError::NotFound(format!("tier {}", tier.id)))?;
        *slot = tier.clone();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTierUnit { _lock, state, tiers } = *self;
        guard(&state).tiers = tiers;
        Ok(())
    }
}
