//! Prediction wagers
//!
//! `check` is an advisory balance preview. `place` re-validates everything under
//! the account lock, reserves and commits the stake, and writes the wager and
//! its indexes in the same batch. `settle` and `void` are terminal and apply
//! exactly once per wager id.

use crate::common::traits::{Clock, PriceFeed};
use crate::common::types::{
    apply_bps, normalize_coin, AccountId, Amount, Direction, Horizon, Price, ReservationId, WagerId,
};
use crate::config::WagerConfig;
use crate::errors::{EngineError, EngineResult, EntityKind};
use crate::ledger::{EntryKind, Ledger, ReservationOwner};
use crate::locks::{account_lock_key, wager_lock_key};
use crate::state_store::{self, Page};
use crate::storage::Txn;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WagerStatus {
    /// Built but not yet backed by a committed stake; never persisted
    Pending,
    Placed,
    Won,
    Lost,
    Voided,
}

impl WagerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WagerStatus::Won | WagerStatus::Lost | WagerStatus::Voided)
    }
}

/// Price window a wager is evaluated on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WagerSubject {
    pub coin: String,
    pub horizon: Horizon,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wager {
    pub id: WagerId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub subject: WagerSubject,
    pub direction: Direction,
    pub entry_price: Price,
    pub status: WagerStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub reservation_id: ReservationId,
    pub outcome_price: Option<Price>,
    pub payout: Amount,
    pub settled_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
}

/// Prediction bet request
#[derive(Debug, Clone)]
pub struct PlaceWager {
    pub account_id: AccountId,
    pub amount: Amount,
    pub coin: String,
    pub horizon: Horizon,
    pub direction: Direction,
    /// Defaults to now + horizon
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeCheck {
    pub ok: bool,
    pub available: Amount,
}

enum Closing {
    Outcome(Price),
    Void(String),
}

pub struct WagerBook {
    ledger: Arc<Ledger>,
    feed: Arc<dyn PriceFeed>,
    clock: Arc<dyn Clock>,
    config: WagerConfig,
}

impl WagerBook {
    pub fn new(ledger: Arc<Ledger>, feed: Arc<dyn PriceFeed>, clock: Arc<dyn Clock>, config: WagerConfig) -> Self {
        Self {
            ledger,
            feed,
            clock,
            config,
        }
    }

    /// Advisory preview; reserves nothing
    pub fn check(&self, account_id: &str, amount: Amount) -> EngineResult<StakeCheck> {
        let available = self.ledger.account(account_id)?.available();
        Ok(StakeCheck {
            ok: amount > 0 && amount <= available,
            available,
        })
    }

    pub fn get(&self, wager_id: &str) -> EngineResult<Wager> {
        state_store::load(self.ledger.store(), &state_store::wager_key(wager_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Wager, wager_id))
    }

    /// An account's wagers, newest first
    pub fn list_for(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Wager>> {
        let store = self.ledger.store();
        let ids = state_store::scan_ids(store, &state_store::wager_by_account_prefix(account_id), cursor, limit)?;
        state_store::load_page(store, ids, state_store::wager_key)
    }

    fn validate(&self, req: &PlaceWager, now: DateTime<Utc>) -> EngineResult<(String, DateTime<Utc>)> {
        if req.amount < self.config.min_stake {
            return Err(EngineError::invalid(format!(
                "stake must be at least {}",
                self.config.min_stake
            )));
        }
        if let Some(max) = self.config.max_stake {
            if req.amount > max {
                return Err(EngineError::invalid(format!("stake must not exceed {}", max)));
            }
        }
        if !self.config.horizons_hours.contains(&req.horizon.hours) {
            return Err(EngineError::invalid(format!("unsupported horizon {}", req.horizon)));
        }
        let coin = normalize_coin(&req.coin)?;

        let deadline = req.deadline.unwrap_or(now + req.horizon.duration());
        let deadline = DateTime::from_timestamp(deadline.timestamp(), 0)
            .ok_or_else(|| EngineError::invalid("deadline out of range"))?;
        self.validate_deadline(deadline, now)?;

        Ok((coin, deadline))
    }

    fn validate_deadline(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> EngineResult<()> {
        if deadline <= now {
            return Err(EngineError::invalid("deadline must be in the future"));
        }
        let latest = now + Duration::hours(i64::from(self.config.max_horizon_hours()));
        if deadline > latest {
            return Err(EngineError::invalid("deadline exceeds the maximum horizon"));
        }
        Ok(())
    }

    pub async fn place(&self, req: &PlaceWager) -> EngineResult<Wager> {
        let (coin, deadline) = self.validate(req, self.clock.now())?;

        let entry_price = self
            .feed
            .spot(&coin, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::invalid(format!("no price quoted for {} yet", coin)))?;

        let _guard = self.ledger.locks().lock(&account_lock_key(&req.account_id)).await;

        // The price lookup may have crossed the deadline
        let now = self.clock.now();
        self.validate_deadline(deadline, now)?;

        let mut txn = Txn::new(self.ledger.store());
        // Keyed on the window rather than the exact deadline, which moves with the clock
        let open_key = state_store::wager_open_key(&req.account_id, &coin, req.horizon.hours);
        if let Some(open_id) = txn.get(&open_key)? {
            return Err(EngineError::DuplicateWager(format!(
                "{} {} already covered by wager {}",
                coin,
                req.horizon,
                String::from_utf8_lossy(&open_id)
            )));
        }

        let wager_id = Uuid::new_v4().to_string();
        let reservation = self.ledger.reserve_in(
            &mut txn,
            &req.account_id,
            req.amount,
            ReservationOwner::Wager(wager_id.clone()),
        )?;

        let mut wager = Wager {
            id: wager_id.clone(),
            account_id: req.account_id.clone(),
            amount: req.amount,
            subject: WagerSubject {
                coin,
                horizon: req.horizon,
            },
            direction: req.direction,
            entry_price,
            status: WagerStatus::Pending,
            created_at: now,
            deadline,
            reservation_id: reservation.reservation_id.clone(),
            outcome_price: None,
            payout: 0,
            settled_at: None,
            void_reason: None,
        };

        self.ledger.commit_in(&mut txn, &reservation.reservation_id)?;
        wager.status = WagerStatus::Placed;

        txn.put_json(state_store::wager_key(&wager_id), &wager)?;
        txn.put(open_key, wager_id.clone().into_bytes());
        txn.put(
            state_store::wager_due_key(deadline, &wager_id),
            wager_id.clone().into_bytes(),
        );
        txn.put(
            state_store::wager_by_account_key(&req.account_id, now, &wager_id),
            wager_id.clone().into_bytes(),
        );
        txn.commit()?;

        info!(
            wager_id = %wager_id,
            account_id = %wager.account_id,
            amount = wager.amount,
            coin = %wager.subject.coin,
            horizon = %wager.subject.horizon,
            direction = %wager.direction,
            entry_price,
            "Wager placed"
        );
        Ok(wager)
    }

    /// Resolve against the outcome price; only once the window has closed
    pub async fn settle(&self, wager_id: &str, outcome_price: Price) -> EngineResult<Wager> {
        self.close(wager_id, Closing::Outcome(outcome_price)).await
    }

    /// Refund the stake and mark the wager Voided
    pub async fn void(&self, wager_id: &str, reason: &str) -> EngineResult<Wager> {
        self.close(wager_id, Closing::Void(reason.to_string())).await
    }

    async fn close(&self, wager_id: &str, closing: Closing) -> EngineResult<Wager> {
        let locks = self.ledger.locks().clone();
        let _wager_guard = locks.lock(&wager_lock_key(wager_id)).await;

        let mut wager = self.get(wager_id)?;
        if wager.status.is_terminal() {
            return Err(EngineError::AlreadySettled(format!("wager {}", wager_id)));
        }
        if wager.status != WagerStatus::Placed {
            return Err(EngineError::InvalidState(format!(
                "wager {} is {:?}",
                wager_id, wager.status
            )));
        }

        let now = self.clock.now();
        if matches!(closing, Closing::Outcome(_)) && now < wager.deadline {
            return Err(EngineError::InvalidState(format!(
                "wager {} window closes at {}",
                wager_id,
                wager.deadline.to_rfc3339()
            )));
        }

        let _account_guard = locks.lock(&account_lock_key(&wager.account_id)).await;
        let mut txn = Txn::new(self.ledger.store());

        match closing {
            Closing::Outcome(outcome_price) => {
                wager.outcome_price = Some(outcome_price);
                if wager.direction.wins(wager.entry_price, outcome_price) {
                    wager.payout = apply_bps(wager.amount, self.config.payout_multiplier_bps)?;
                    self.ledger
                        .credit_in(&mut txn, &wager.account_id, wager.payout, EntryKind::Payout, wager_id)?;
                    wager.status = WagerStatus::Won;
                } else {
                    wager.status = WagerStatus::Lost;
                }
            }
            Closing::Void(reason) => {
                self.ledger
                    .credit_in(&mut txn, &wager.account_id, wager.amount, EntryKind::Refund, wager_id)?;
                wager.payout = wager.amount;
                wager.void_reason = Some(reason);
                wager.status = WagerStatus::Voided;
            }
        }
        wager.settled_at = Some(now);

        txn.put_json(state_store::wager_key(wager_id), &wager)?;
        txn.delete(state_store::wager_due_key(wager.deadline, wager_id));
        txn.delete(state_store::wager_open_key(
            &wager.account_id,
            &wager.subject.coin,
            wager.subject.horizon.hours,
        ));
        txn.commit()?;

        debug!(wager_id = %wager_id, status = ?wager.status, payout = wager.payout, "Wager closed");
        info!(
            wager_id = %wager_id,
            account_id = %wager.account_id,
            status = ?wager.status,
            entry_price = wager.entry_price,
            outcome_price = ?wager.outcome_price,
            payout = wager.payout,
            "Wager settled"
        );
        Ok(wager)
    }
}
