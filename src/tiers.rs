//! Tier ladder and resolution.
//!
//! A [`TierCatalog`] is validated when built: active tiers must form a ladder
//! whose requirements never decrease and strictly grow on at least one axis
//! from one rank to the next. Resolution always reads the current counters,
//! nothing is cached.

use std::collections::HashSet;

use rust_decimal::Decimal;

use crate::error::{ReferralError, Result};
use crate::money::percent_of;
use crate::types::{AxisProgress, Tier, TierProgress};

#[derive(Debug, Clone)]
pub struct TierCatalog {
    /// Every tier, ordered by rank.
    tiers: Vec<Tier>,
}

impl TierCatalog {
    pub fn new(mut tiers: Vec<Tier>) -> Result<Self> {
        tiers.sort_by_key(|t| t.rank);

        let mut names = HashSet::new();
        let mut ranks = HashSet::new();
        for tier in &tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(ReferralError::InvalidTier(format!(
                    "duplicate tier name {}",
                    tier.name
                )));
            }
            if !ranks.insert(tier.rank) {
                return Err(ReferralError::InvalidTier(format!(
                    "duplicate rank {}",
                    tier.rank
                )));
            }
            if tier.commission_rate < Decimal::ZERO || tier.commission_rate > Decimal::ONE {
                return Err(ReferralError::InvalidTier(format!(
                    "{}: commission rate must be within [0, 1]",
                    tier.name
                )));
            }
            if tier.min_referrals < 0 || tier.min_sales < Decimal::ZERO || tier.signup_bonus_points < 0 {
                return Err(ReferralError::InvalidTier(format!(
                    "{}: thresholds must not be negative",
                    tier.name
                )));
            }
        }

        let active: Vec<&Tier> = tiers.iter().filter(|t| t.is_active).collect();
        if active.is_empty() {
            return Err(ReferralError::InvalidTier("no active tier".into()));
        }
        for pair in active.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            let never_lower =
                upper.min_referrals >= lower.min_referrals && upper.min_sales >= lower.min_sales;
            let strictly_higher =
                upper.min_referrals > lower.min_referrals || upper.min_sales > lower.min_sales;
            if !(never_lower && strictly_higher) {
                return Err(ReferralError::InvalidTier(format!(
                    "{} must require more than {}",
                    upper.name, lower.name
                )));
            }
        }

        Ok(TierCatalog { tiers })
    }

    /// Active tiers, least demanding first.
    pub fn list_active_tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter().filter(|t| t.is_active)
    }

    pub fn all_tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn get_tier(&self, name: &str) -> Result<&Tier> {
        self.tiers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ReferralError::NotFound(format!("tier {name}")))
    }

    fn lowest(&self) -> &Tier {
        // `new` guarantees at least one active tier.
        self.list_active_tiers()
            .next()
            .unwrap_or(&self.tiers[0])
    }

    /// Highest active tier whose referral AND sales thresholds are both met.
    pub fn resolve(&self, referral_count: i64, referred_sales: Decimal) -> &Tier {
        self.list_active_tiers()
            .filter(|t| referral_count >= t.min_referrals && referred_sales >= t.min_sales)
            .last()
            .unwrap_or_else(|| self.lowest())
    }

    pub fn next_tier(&self, tier: &Tier) -> Option<&Tier> {
        self.list_active_tiers().find(|t| t.rank > tier.rank)
    }

    /// Progress toward the tier above `current`, or `None` at the top.
    pub fn progress(
        &self,
        current: &Tier,
        referral_count: i64,
        referred_sales: Decimal,
    ) -> Option<TierProgress> {
        let next = self.next_tier(current)?;
        Some(TierProgress {
            next_tier: next.name.clone(),
            referrals: axis(Decimal::from(referral_count), Decimal::from(next.min_referrals)),
            sales: axis(referred_sales, next.min_sales),
        })
    }
}

fn axis(current: Decimal, required: Decimal) -> AxisProgress {
    AxisProgress {
        current,
        required,
        remaining: (required - current).max(Decimal::ZERO),
        percent: percent_of(current, required),
    }
}

/// The stock Member / Promoter / Ambassador / Elite ladder.
pub fn default_tiers() -> Vec<Tier> {
    let tier = |id: i64, name: &str, min_referrals: i64, min_sales: i64, rate: Decimal, points: i64| Tier {
        id,
        name: name.to_string(),
        rank: id as i32,
        min_referrals,
        min_sales: Decimal::from(min_sales),
        commission_rate: rate,
        signup_bonus_points: points,
        is_active: true,
    };
    vec![
        tier(1, "Member", 0, 0, Decimal::new(5, 2), 0),
        tier(2, "Promoter", 5, 500, Decimal::new(75, 3), 50),
        tier(3, "Ambassador", 15, 2000, Decimal::new(10, 2), 100),
        tier(4, "Elite", 50, 10000, Decimal::new(15, 2), 250),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn catalog() -> TierCatalog {
        TierCatalog::new(default_tiers()).unwrap()
    }

    #[test]
    fn resolves_promoter_when_both_thresholds_met() {
        let c = catalog();
        assert_eq!(c.resolve(5, Decimal::from(500)).name, "Promoter");
    }

    #[test]
    fn referral_count_alone_does_not_upgrade() {
        let c = catalog();
        assert_eq!(c.resolve(10, Decimal::from(200)).name, "Member");
        assert_eq!(c.resolve(0, Decimal::from(50_000)).name, "Member");
    }

    #[test]
    fn resolves_top_tier() {
        let c = catalog();
        assert_eq!(c.resolve(50, Decimal::from(10_000)).name, "Elite");
        assert_eq!(c.resolve(500, Decimal::from(1_000_000)).name, "Elite");
    }

    #[test]
    fn inactive_tiers_are_skipped() {
        let mut tiers = default_tiers();
        tiers[1].is_active = false;
        let c = TierCatalog::new(tiers).unwrap();
        assert_eq!(c.resolve(5, Decimal::from(500)).name, "Member");
        assert_eq!(c.resolve(15, Decimal::from(2000)).name, "Ambassador");
        assert_eq!(c.list_active_tiers().count(), 3);
        assert_eq!(c.all_tiers().len(), 4);
        // still available for audit lookups
        assert!(c.get_tier("Promoter").is_ok());
    }

    #[test]
    fn unsorted_input_is_ordered_by_rank() {
        let mut tiers = default_tiers();
        tiers.reverse();
        let c = TierCatalog::new(tiers).unwrap();
        let names: Vec<_> = c.list_active_tiers().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Member", "Promoter", "Ambassador", "Elite"]);
    }

    #[test]
    fn rejects_non_increasing_ladder() {
        let mut tiers = default_tiers();
        tiers[2].min_sales = Decimal::from(100);
        assert!(matches!(
            TierCatalog::new(tiers),
            Err(ReferralError::InvalidTier(_))
        ));

        let mut tiers = default_tiers();
        tiers[1].min_referrals = 0;
        tiers[1].min_sales = Decimal::ZERO;
        assert!(TierCatalog::new(tiers).is_err());
    }

    #[test]
    fn rejects_bad_rates_and_duplicates() {
        let mut tiers = default_tiers();
        tiers[3].commission_rate = Decimal::new(15, 1);
        assert!(TierCatalog::new(tiers).is_err());

        let mut tiers = default_tiers();
        tiers[3].name = "Member".into();
        assert!(TierCatalog::new(tiers).is_err());

        let mut tiers = default_tiers();
        for t in &mut tiers {
            t.is_active = false;
        }
        assert!(TierCatalog::new(tiers).is_err());
    }

    #[test]
    fn unknown_tier_is_not_found() {
        assert!(matches!(
            catalog().get_tier("Diamond"),
            Err(ReferralError::NotFound(_))
        ));
    }

    #[test]
    fn progress_toward_next_tier() {
        let c = catalog();
        let current = c.resolve(3, Decimal::from(250));
        let progress = c.progress(current, 3, Decimal::from(250)).unwrap();
        assert_eq!(progress.next_tier, "Promoter");
        assert_eq!(progress.referrals.remaining, Decimal::from(2));
        assert_eq!(progress.referrals.percent, Decimal::from(60));
        assert_eq!(progress.sales.remaining, Decimal::from(250));
        assert_eq!(progress.sales.percent, Decimal::from(50));

        let elite = c.get_tier("Elite").unwrap();
        assert!(c.progress(elite, 80, Decimal::from(20_000)).is_none());
    }

    proptest! {
        #[test]
        fn resolution_is_monotonic(
            refs in 0i64..200,
            extra_refs in 0i64..200,
            sales in 0i64..50_000,
            extra_sales in 0i64..50_000,
        ) {
            let c = catalog();
            let before = c.resolve(refs, Decimal::from(sales)).rank;
            let more_refs = c.resolve(refs + extra_refs, Decimal::from(sales)).rank;
            let more_sales = c.resolve(refs, Decimal::from(sales + extra_sales)).rank;
            prop_assert!(more_refs >= before);
            prop_assert!(more_sales >= before);
        }
    }
}
