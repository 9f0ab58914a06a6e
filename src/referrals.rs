//! Referral rewards
//!
//! An account may name one referrer, once. Every confirmed deposit accrues a
//! bonus up the referrer chain: the direct referrer earns `reward_bps` of the
//! deposit, the next level `reward_bps` of that bonus, and so on until a bonus
//! falls below `min_bonus` or `max_depth` levels have been paid.
//!
//! Bonuses collect in a per-account counter. `earned_total` only ever grows;
//! claiming moves the pending part onto the balance in one batch.

use crate::common::traits::Clock;
use crate::common::types::{apply_bps, AccountId, Amount};
use crate::config::ReferralConfig;
use crate::errors::{EngineError, EngineResult};
use crate::ledger::{Account, Deposit, EntryKind, Ledger};
use crate::locks::{account_lock_key, referral_lock_key};
use crate::state_store;
use crate::storage::Txn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Registration rewires the referral graph; one at a time keeps it acyclic
const REFERRAL_GRAPH_LOCK: &str = "referral-graph";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralLink {
    pub referred_id: AccountId,
    pub referrer_id: AccountId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralRewards {
    pub account_id: AccountId,
    /// Accounts that named this one as referrer
    pub referrals: u64,
    /// Accrued and not yet claimed
    pub pending: Amount,
    pub claimed_total: Amount,
}

impl ReferralRewards {
    fn empty(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            ..Self::default()
        }
    }

    /// Monotonic progress counter shown to the player
    pub fn earned_total(&self) -> Amount {
        self.pending.saturating_add(self.claimed_total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralClaim {
    pub claimed: Amount,
    pub account: Account,
}

pub struct ReferralBook {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    config: ReferralConfig,
}

impl ReferralBook {
    pub fn new(ledger: Arc<Ledger>, clock: Arc<dyn Clock>, config: ReferralConfig) -> Self {
        Self { ledger, clock, config }
    }

    pub fn referrer_of(&self, account_id: &str) -> EngineResult<Option<ReferralLink>> {
        state_store::load(self.ledger.store(), &state_store::referral_link_key(account_id))
    }

    pub fn rewards(&self, account_id: &str) -> EngineResult<ReferralRewards> {
        self.ledger.account(account_id)?;
        Ok(
            state_store::load(self.ledger.store(), &state_store::referral_reward_key(account_id))?
                .unwrap_or_else(|| ReferralRewards::empty(account_id)),
        )
    }

    /// Referrers above `account_id`, nearest first, at most `depth` of them
    fn chain(&self, account_id: &str, depth: usize) -> EngineResult<Vec<AccountId>> {
        let mut chain = Vec::new();
        let mut current = account_id.to_string();
        while chain.len() < depth {
            let Some(link) = self.referrer_of(&current)? else {
                break;
            };
            if link.referrer_id == account_id || chain.contains(&link.referrer_id) {
                break;
            }
            current = link.referrer_id.clone();
            chain.push(link.referrer_id);
        }
        Ok(chain)
    }

    /// Record who brought `referred_id` in; an account names a referrer once
    pub async fn register(&self, referred_id: &str, referrer_id: &str) -> EngineResult<ReferralLink> {
        if referred_id == referrer_id {
            return Err(EngineError::invalid("an account cannot refer itself"));
        }

        let locks = self.ledger.locks().clone();
        let _graph_guard = locks.lock(REFERRAL_GRAPH_LOCK).await;
        let _reward_guard = locks.lock(&referral_lock_key(referrer_id)).await;

        self.ledger.account(referred_id)?;
        self.ledger.account(referrer_id)?;

        let mut txn = Txn::new(self.ledger.store());
        let link_key = state_store::referral_link_key(referred_id);
        if txn.contains(&link_key)? {
            return Err(EngineError::InvalidState(format!(
                "account {} already has a referrer",
                referred_id
            )));
        }
        // Walk the whole chain above the referrer; the graph is kept acyclic
        if self.chain(referrer_id, usize::MAX)?.iter().any(|id| id == referred_id) {
            return Err(EngineError::invalid(format!(
                "{} is already upstream of {}",
                referred_id, referrer_id
            )));
        }

        let link = ReferralLink {
            referred_id: referred_id.to_string(),
            referrer_id: referrer_id.to_string(),
            created_at: self.clock.now(),
        };
        let reward_key = state_store::referral_reward_key(referrer_id);
        let mut rewards = txn
            .get_json::<ReferralRewards>(&reward_key)?
            .unwrap_or_else(|| ReferralRewards::empty(referrer_id));
        rewards.referrals += 1;

        txn.put_json(link_key, &link)?;
        txn.put(
            state_store::referral_by_referrer_key(referrer_id, referred_id),
            referred_id.as_bytes().to_vec(),
        );
        txn.put_json(reward_key, &rewards)?;
        txn.commit()?;

        info!(referred_id = %referred_id, referrer_id = %referrer_id, "Referral registered");
        Ok(link)
    }

    /// Stage the bonus for every paid level above `account_id`
    fn accrue_in(&self, txn: &mut Txn<'_>, chain: &[AccountId], amount: Amount) -> EngineResult<Vec<(AccountId, Amount)>> {
        let mut paid = Vec::new();
        let mut base = amount;
        for referrer_id in chain {
            let bonus = apply_bps(base, self.config.reward_bps)?;
            if bonus < self.config.min_bonus.max(1) {
                break;
            }

            let key = state_store::referral_reward_key(referrer_id);
            let mut rewards = txn
                .get_json::<ReferralRewards>(&key)?
                .unwrap_or_else(|| ReferralRewards::empty(referrer_id));
            rewards.pending = rewards
                .pending
                .checked_add(bonus)
                .ok_or_else(|| EngineError::invalid("referral reward overflows the amount range"))?;
            txn.put_json(key, &rewards)?;

            paid.push((referrer_id.clone(), bonus));
            base = bonus;
        }
        Ok(paid)
    }

    /// Credit a pending deposit and accrue referral bonuses in the same batch
    pub async fn confirm_deposit(&self, deposit_id: &str) -> EngineResult<Deposit> {
        let deposit = self.ledger.deposit(deposit_id)?;
        let chain = self.chain(&deposit.account_id, self.config.max_depth)?;

        let mut keys = vec![account_lock_key(&deposit.account_id)];
        keys.extend(chain.iter().map(|id| referral_lock_key(id)));
        let _guards = self.ledger.locks().lock_many(keys).await;

        let mut txn = Txn::new(self.ledger.store());
        let deposit = self.ledger.confirm_deposit_in(&mut txn, deposit_id)?;
        let paid = self.accrue_in(&mut txn, &chain, deposit.amount)?;
        txn.commit()?;

        for (referrer_id, bonus) in &paid {
            debug!(referrer_id = %referrer_id, bonus, deposit_id = %deposit_id, "Referral bonus accrued");
        }
        info!(
            deposit_id = %deposit_id,
            account_id = %deposit.account_id,
            amount = deposit.amount,
            referral_levels = paid.len(),
            "Deposit confirmed"
        );
        Ok(deposit)
    }

    /// Move everything pending onto the balance; nothing pending is a no-op
    pub async fn claim(&self, account_id: &str) -> EngineResult<ReferralClaim> {
        let _guards = self
            .ledger
            .locks()
            .lock_many([account_lock_key(account_id), referral_lock_key(account_id)])
            .await;

        let mut txn = Txn::new(self.ledger.store());
        let account = self.ledger.load_account_in(&txn, account_id)?;
        let key = state_store::referral_reward_key(account_id);
        let Some(mut rewards) = txn.get_json::<ReferralRewards>(&key)? else {
            return Ok(ReferralClaim { claimed: 0, account });
        };
        if rewards.pending == 0 {
            return Ok(ReferralClaim { claimed: 0, account });
        }

        let claimed = rewards.pending;
        let account = self
            .ledger
            .credit_in(&mut txn, account_id, claimed, EntryKind::ReferralReward, "referral")?;
        rewards.pending = 0;
        rewards.claimed_total = rewards.claimed_total.saturating_add(claimed);
        txn.put_json(key, &rewards)?;
        txn.commit()?;

        info!(account_id = %account_id, claimed, "Referral reward claimed");
        Ok(ReferralClaim { claimed, account })
    }
}
