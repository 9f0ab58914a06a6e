//! Session coordinator
//!
//! The single entry point for requests. Each call carries explicit account and
//! entity ids; nothing is remembered between calls beyond persisted records.
//! Ledger, wager and room operations already serialize per entity and land as
//! one batch, so the coordinator adds the request-level concerns: bounded retry
//! of transient storage failures, idempotent treatment of repeated
//! settlements, wake-ups for the settlement engine and metrics.

use crate::common::traits::{Clock, PriceFeed};
use crate::common::types::{Amount, Direction, Horizon, Price, RoomKind};
use chrono::{DateTime, Utc};
use crate::config::{RetryConfig, StakeroomConfig};
use crate::errors::{EngineError, EngineResult};
use crate::ledger::{Account, Deposit, JournalEntry, Ledger};
use crate::locks::EntityLocks;
use crate::lottery::{LotteryBook, LotteryClose, LotteryEntry, LotteryRound};
use crate::metrics::EngineMetrics;
use crate::referrals::{ReferralBook, ReferralClaim, ReferralLink, ReferralRewards};
use crate::rooms::{CreateRoom, Room, RoomBook, RoomOutcome};
use crate::settlement::SettlementEvent;
use crate::state_store::Page;
use crate::storage::KvStore;
use crate::wagers::{PlaceWager, StakeCheck, Wager, WagerBook, WagerStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct SessionCoordinator {
    ledger: Arc<Ledger>,
    wagers: Arc<WagerBook>,
    rooms: Arc<RoomBook>,
    referrals: Arc<ReferralBook>,
    lottery: Arc<LotteryBook>,
    retry: RetryConfig,
    metrics: Arc<EngineMetrics>,
    events: Option<mpsc::UnboundedSender<SettlementEvent>>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn KvStore>,
        feed: Arc<dyn PriceFeed>,
        clock: Arc<dyn Clock>,
        config: &StakeroomConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let locks = Arc::new(EntityLocks::new());
        let ledger = Arc::new(Ledger::new(store, locks, clock.clone()));
        let wagers = Arc::new(WagerBook::new(
            ledger.clone(),
            feed,
            clock.clone(),
            config.wagers.clone(),
        ));
        let rooms = Arc::new(RoomBook::new(ledger.clone(), clock.clone(), config.rooms.clone()));
        let referrals = Arc::new(ReferralBook::new(
            ledger.clone(),
            clock.clone(),
            config.referrals.clone(),
        ));
        let lottery = Arc::new(LotteryBook::new(ledger.clone(), clock, config.lottery.clone()));

        Self {
            ledger,
            wagers,
            rooms,
            referrals,
            lottery,
            retry: config.retry.clone(),
            metrics,
            events: None,
        }
    }

    /// Notify the settlement engine when a room result arrives
    pub fn with_settlement_events(mut self, events: mpsc::UnboundedSender<SettlementEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn wagers(&self) -> &Arc<WagerBook> {
        &self.wagers
    }

    pub fn rooms(&self) -> &Arc<RoomBook> {
        &self.rooms
    }

    pub fn referrals(&self) -> &Arc<ReferralBook> {
        &self.referrals
    }

    pub fn lottery(&self) -> &Arc<LotteryBook> {
        &self.lottery
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run out
    async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut tries = 1u32;
        loop {
            match attempt().await {
                Ok(value) => {
                    self.metrics.record_operation(op, "ok");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && tries < self.retry.max_attempts => {
                    let delay = self.retry.backoff(tries);
                    warn!(
                        op,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    self.metrics.retries_total.with_label_values(&[op]).inc();
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(e) => {
                    self.metrics.record_operation(op, e.code());
                    if e.is_rejection() {
                        debug!(op, error = %e, "Request rejected");
                    } else if !matches!(e, EngineError::AlreadySettled(_)) {
                        warn!(op, attempts = tries, error = %e, "Operation failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn open_account(&self, account_id: &str, initial_balance: Amount) -> EngineResult<Account> {
        self.run("open_account", move || self.ledger.open_account(account_id, initial_balance))
            .await
    }

    /// Record incoming funds as pending; nothing is credited yet
    pub async fn request_deposit(&self, account_id: &str, amount: Amount) -> EngineResult<Deposit> {
        self.run("request_deposit", move || async move { self.ledger.request_deposit(account_id, amount) })
            .await
    }

    /// Operator confirmation; a deposit confirmed earlier is returned as-is
    pub async fn confirm_deposit(&self, deposit_id: &str) -> EngineResult<Deposit> {
        let result = self
            .run("confirm_deposit", move || self.referrals.confirm_deposit(deposit_id))
            .await;
        match result {
            Err(EngineError::AlreadySettled(_)) => self.ledger.deposit(deposit_id),
            other => other,
        }
    }

    pub async fn deposits_for(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Deposit>> {
        self.run("list_deposits", move || async move { self.ledger.deposits_for(account_id, cursor, limit) })
            .await
    }

    pub async fn withdraw(&self, account_id: &str, amount: Amount) -> EngineResult<Account> {
        self.run("withdraw", move || self.ledger.withdraw(account_id, amount)).await
    }

    pub async fn balance(&self, account_id: &str) -> EngineResult<Account> {
        self.run("balance", move || async move { self.ledger.account(account_id) })
            .await
    }

    pub async fn history(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<JournalEntry>> {
        self.run("history", move || async move { self.ledger.history(account_id, cursor, limit) })
            .await
    }

    /// Stake pre-check; advisory only, `place_wager` re-validates
    pub async fn check(&self, account_id: &str, amount: Amount) -> EngineResult<StakeCheck> {
        self.run("check", move || async move { self.wagers.check(account_id, amount) })
            .await
    }

    pub async fn place_wager(&self, req: &PlaceWager) -> EngineResult<Wager> {
        self.run("place_wager", move || self.wagers.place(req)).await
    }

    /// Prediction bet on a configured horizon starting now
    pub async fn place_prediction(
        &self,
        account_id: &str,
        amount: Amount,
        coin: &str,
        horizon_hours: u32,
        direction: Direction,
    ) -> EngineResult<Wager> {
        let req = PlaceWager {
            account_id: account_id.to_string(),
            amount,
            coin: coin.to_string(),
            horizon: Horizon::hours(horizon_hours),
            direction,
            deadline: None,
        };
        self.place_wager(&req).await
    }

    pub async fn wager(&self, wager_id: &str) -> EngineResult<Wager> {
        self.run("get_wager", move || async move { self.wagers.get(wager_id) })
            .await
    }

    pub async fn wagers_for(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Wager>> {
        self.run("list_wagers", move || async move { self.wagers.list_for(account_id, cursor, limit) })
            .await
    }

    /// Settle at the outcome price; a wager that is already terminal is returned as-is
    pub async fn settle_wager(&self, wager_id: &str, outcome_price: Price) -> EngineResult<Wager> {
        let result = self
            .run("settle_wager", move || self.wagers.settle(wager_id, outcome_price))
            .await;
        match result {
            Ok(wager) => {
                self.metrics
                    .wagers_settled_total
                    .with_label_values(&[status_label(&wager)])
                    .inc();
                Ok(wager)
            }
            Err(EngineError::AlreadySettled(_)) => self.wagers.get(wager_id),
            Err(e) => Err(e),
        }
    }

    pub async fn void_wager(&self, wager_id: &str, reason: &str) -> EngineResult<Wager> {
        let result = self.run("void_wager", move || self.wagers.void(wager_id, reason)).await;
        match result {
            Ok(wager) => {
                self.metrics.wagers_settled_total.with_label_values(&["voided"]).inc();
                Ok(wager)
            }
            Err(EngineError::AlreadySettled(_)) => self.wagers.get(wager_id),
            Err(e) => Err(e),
        }
    }

    pub async fn create_room(&self, req: &CreateRoom) -> EngineResult<Room> {
        self.run("create_room", move || self.rooms.create(req)).await
    }

    pub async fn join_room(&self, room_id: &str, account_id: &str) -> EngineResult<Room> {
        self.run("join_room", move || self.rooms.join(room_id, account_id)).await
    }

    pub async fn leave_room(&self, room_id: &str, account_id: &str) -> EngineResult<Room> {
        self.run("leave_room", move || self.rooms.leave(room_id, account_id)).await
    }

    pub async fn cancel_room(&self, room_id: &str, requested_by: Option<&str>) -> EngineResult<Room> {
        self.run("cancel_room", move || self.rooms.cancel(room_id, requested_by))
            .await
    }

    pub async fn room(&self, room_id: &str) -> EngineResult<Room> {
        self.run("get_room", move || async move { self.rooms.get(room_id) }).await
    }

    pub async fn list_rooms(&self, kind: Option<RoomKind>, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Room>> {
        self.run("list_rooms", move || async move { self.rooms.list_open(kind, cursor, limit) })
            .await
    }

    /// Accept a finished game and wake the settlement engine
    pub async fn record_room_result(&self, room_id: &str, outcome: RoomOutcome) -> EngineResult<Room> {
        let outcome = &outcome;
        let room = self
            .run("record_room_result", move || self.rooms.record_result(room_id, outcome.clone()))
            .await?;

        if let Some(events) = &self.events {
            if events.send(SettlementEvent::RoomResolved(room_id.to_string())).is_err() {
                debug!(room_id = %room_id, "Settlement engine not listening; sweep will pick the result up");
            }
        }
        Ok(room)
    }

    /// Apply a room outcome; a room that is already settled is returned as-is
    pub async fn settle_room(&self, room_id: &str, outcome: RoomOutcome) -> EngineResult<Room> {
        let outcome = &outcome;
        let result = self
            .run("settle_room", move || self.rooms.settle(room_id, outcome.clone()))
            .await;
        match result {
            Ok(room) => {
                let label = match room.outcome {
                    Some(RoomOutcome::Draw) => "draw",
                    _ => "winner",
                };
                self.metrics.rooms_settled_total.with_label_values(&[label]).inc();
                Ok(room)
            }
            Err(EngineError::AlreadySettled(_)) => self.rooms.get(room_id),
            Err(e) => Err(e),
        }
    }

    pub async fn register_referral(&self, referred_id: &str, referrer_id: &str) -> EngineResult<ReferralLink> {
        self.run("register_referral", move || self.referrals.register(referred_id, referrer_id))
            .await
    }

    pub async fn referral_rewards(&self, account_id: &str) -> EngineResult<(ReferralRewards, Option<ReferralLink>)> {
        self.run("referral_rewards", move || async move {
            let rewards = self.referrals.rewards(account_id)?;
            Ok((rewards, self.referrals.referrer_of(account_id)?))
        })
        .await
    }

    pub async fn claim_referral_reward(&self, account_id: &str) -> EngineResult<ReferralClaim> {
        self.run("claim_referral", move || self.referrals.claim(account_id)).await
    }

    pub async fn lottery_round(&self) -> EngineResult<LotteryRound> {
        self.run("lottery_round", move || async move { self.lottery.current() })
            .await
    }

    pub async fn lottery_top(&self, limit: Option<usize>) -> EngineResult<(LotteryRound, Vec<LotteryEntry>)> {
        self.run("lottery_top", move || async move {
            let round = self.lottery.current()?;
            let top = self.lottery.top_entries(&round.id, limit)?;
            Ok((round, top))
        })
        .await
    }

    pub async fn open_lottery(&self, ends_at: DateTime<Utc>) -> EngineResult<LotteryRound> {
        self.run("open_lottery", move || self.lottery.open_round(ends_at)).await
    }

    pub async fn change_lottery_end(&self, ends_at: DateTime<Utc>) -> EngineResult<LotteryRound> {
        self.run("change_lottery_end", move || self.lottery.change_end(ends_at))
            .await
    }

    pub async fn enter_lottery(&self, account_id: &str, amount: Amount) -> EngineResult<(LotteryEntry, LotteryRound)> {
        self.run("enter_lottery", move || self.lottery.enter(account_id, amount))
            .await
    }

    /// End the current round; a round that is already closed is returned as-is
    pub async fn close_lottery(&self, how: LotteryClose) -> EngineResult<LotteryRound> {
        let how = &how;
        let result = self
            .run("close_lottery", move || self.lottery.close(how.clone()))
            .await;
        match result {
            Err(EngineError::AlreadySettled(_)) => self.lottery.current(),
            other => other,
        }
    }
}

fn status_label(wager: &Wager) -> &'static str {
    match wager.status {
        WagerStatus::Won => "won",
        WagerStatus::Lost => "lost",
        WagerStatus::Voided => "voided",
        WagerStatus::Pending | WagerStatus::Placed => "open",
    }
}
