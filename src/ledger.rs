//! Account ledger
//!
//! Balances, reservations and the per-account journal. Every mutation of an
//! account happens under that account's lock, bumps its `version` and appends
//! a journal entry whose sequence number is the new version.
//!
//! Public methods lock, stage and commit on their own. The `*_in` variants stage
//! into a caller-owned [`Txn`] and assume the caller already holds the account
//! locks; wagers and rooms use them to land ledger effects in the same batch as
//! their own records.

use crate::common::traits::Clock;
use crate::common::types::{validate_account_id, AccountId, Amount, ReservationId, RoomId, WagerId};
use crate::errors::{EngineError, EngineResult, EntityKind};
use crate::locks::{account_lock_key, EntityLocks};
use crate::state_store::{self, Page};
use crate::storage::{KvStore, Txn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_id: AccountId,
    /// Ledger balance; committed stakes are already deducted
    pub balance: Amount,
    /// Sum of Held reservations
    pub held: Amount,
    /// Optimistic-concurrency token, +1 per mutation
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn available(&self) -> Amount {
        self.balance.saturating_sub(self.held)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
}

/// What a reservation backs; one outstanding reservation per (account, owner)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ReservationOwner {
    Wager(WagerId),
    Seat(RoomId),
    Withdrawal(String),
    /// Lottery entry, `<round>:<seq>`
    Ticket(String),
}

impl ReservationOwner {
    fn tag(&self) -> String {
        match self {
            ReservationOwner::Wager(id) => format!("wager:{}", id),
            ReservationOwner::Seat(id) => format!("seat:{}", id),
            ReservationOwner::Withdrawal(id) => format!("withdrawal:{}", id),
            ReservationOwner::Ticket(id) => format!("ticket:{}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub owner: ReservationOwner,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic reservation id: `<account>|<owner tag>`
pub fn reservation_id_for(account_id: &str, owner: &ReservationOwner) -> ReservationId {
    format!("{}|{}", account_id, owner.tag())
}

fn account_of(reservation_id: &str) -> EngineResult<&str> {
    reservation_id
        .split_once('|')
        .map(|(account, _)| account)
        .filter(|account| !account.is_empty())
        .ok_or_else(|| EngineError::unknown(EntityKind::Reservation, reservation_id))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Open,
    Deposit,
    Withdrawal,
    Reserve,
    Release,
    Commit,
    Payout,
    Refund,
    ReferralReward,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub kind: EntryKind,
    pub amount: Amount,
    /// Reservation, wager or room the entry belongs to
    pub reference: String,
    pub balance_after: Amount,
    pub available_after: Amount,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

/// Incoming funds; the balance only moves once an operator confirms
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deposit {
    pub id: String,
    pub account_id: AccountId,
    pub amount: Amount,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

pub struct Ledger {
    store: Arc<dyn KvStore>,
    locks: Arc<EntityLocks>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(store: Arc<dyn KvStore>, locks: Arc<EntityLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    pub fn locks(&self) -> &Arc<EntityLocks> {
        &self.locks
    }

    /// Create an account; opening an existing account returns it unchanged
    pub async fn open_account(&self, account_id: &str, initial_balance: Amount) -> EngineResult<Account> {
        validate_account_id(account_id)?;
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;

        let mut txn = Txn::new(self.store.as_ref());
        if let Some(existing) = txn.get_json::<Account>(&state_store::account_key(account_id))? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut account = Account {
            account_id: account_id.to_string(),
            balance: initial_balance,
            held: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.record(&mut txn, &mut account, EntryKind::Open, initial_balance, account_id)?;
        txn.commit()?;

        info!(account_id = %account_id, balance = initial_balance, "Account opened");
        Ok(account)
    }

    pub fn account(&self, account_id: &str) -> EngineResult<Account> {
        state_store::load(self.store.as_ref(), &state_store::account_key(account_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Account, account_id))
    }

    pub fn reservation(&self, reservation_id: &str) -> EngineResult<Reservation> {
        state_store::load(self.store.as_ref(), &state_store::reservation_key(reservation_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Reservation, reservation_id))
    }

    /// Journal entries, newest first
    pub fn history(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<JournalEntry>> {
        self.account(account_id)?;
        state_store::scan_records(
            self.store.as_ref(),
            &state_store::journal_prefix(account_id),
            cursor,
            limit,
        )
    }

    pub async fn reserve(&self, account_id: &str, amount: Amount, owner: ReservationOwner) -> EngineResult<Reservation> {
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;
        let mut txn = Txn::new(self.store.as_ref());
        let reservation = self.reserve_in(&mut txn, account_id, amount, owner)?;
        txn.commit()?;
        Ok(reservation)
    }

    pub async fn commit(&self, reservation_id: &str) -> EngineResult<Reservation> {
        let account_id = account_of(reservation_id)?;
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;
        let mut txn = Txn::new(self.store.as_ref());
        let reservation = self.commit_in(&mut txn, reservation_id)?;
        txn.commit()?;
        Ok(reservation)
    }

    pub async fn release(&self, reservation_id: &str) -> EngineResult<Reservation> {
        let account_id = account_of(reservation_id)?;
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;
        let mut txn = Txn::new(self.store.as_ref());
        let reservation = self.release_in(&mut txn, reservation_id)?;
        txn.commit()?;
        Ok(reservation)
    }

    /// Pay out to an account
    pub async fn credit(&self, account_id: &str, amount: Amount, reference: &str) -> EngineResult<Account> {
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;
        let mut txn = Txn::new(self.store.as_ref());
        let account = self.credit_in(&mut txn, account_id, amount, EntryKind::Payout, reference)?;
        txn.commit()?;
        Ok(account)
    }

    /// Record incoming funds as Pending; nothing is credited yet
    pub fn request_deposit(&self, account_id: &str, amount: Amount) -> EngineResult<Deposit> {
        if amount == 0 {
            return Err(EngineError::invalid("deposit amount must be positive"));
        }
        self.account(account_id)?;

        let now = self.clock.now();
        let deposit = Deposit {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            amount,
            status: DepositStatus::Pending,
            created_at: now,
            confirmed_at: None,
        };

        let mut txn = Txn::new(self.store.as_ref());
        txn.put_json(state_store::deposit_key(&deposit.id), &deposit)?;
        txn.put(
            state_store::deposit_by_account_key(account_id, now, &deposit.id),
            deposit.id.clone().into_bytes(),
        );
        txn.commit()?;

        info!(account_id = %account_id, deposit_id = %deposit.id, amount, "Deposit requested");
        Ok(deposit)
    }

    pub fn deposit(&self, deposit_id: &str) -> EngineResult<Deposit> {
        state_store::load(self.store.as_ref(), &state_store::deposit_key(deposit_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Deposit, deposit_id))
    }

    /// An account's deposits, newest first
    pub fn deposits_for(&self, account_id: &str, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Deposit>> {
        let store = self.store.as_ref();
        let ids = state_store::scan_ids(store, &state_store::deposit_by_account_prefix(account_id), cursor, limit)?;
        state_store::load_page(store, ids, state_store::deposit_key)
    }

    /// Pending -> Confirmed, crediting the amount; applies once per deposit
    pub fn confirm_deposit_in(&self, txn: &mut Txn<'_>, deposit_id: &str) -> EngineResult<Deposit> {
        let mut deposit: Deposit = txn
            .get_json(&state_store::deposit_key(deposit_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Deposit, deposit_id))?;
        if deposit.status == DepositStatus::Confirmed {
            return Err(EngineError::AlreadySettled(format!("deposit {}", deposit_id)));
        }

        self.credit_in(txn, &deposit.account_id, deposit.amount, EntryKind::Deposit, deposit_id)?;
        deposit.status = DepositStatus::Confirmed;
        deposit.confirmed_at = Some(self.clock.now());
        txn.put_json(state_store::deposit_key(deposit_id), &deposit)?;
        Ok(deposit)
    }

    /// Reserve and commit in one batch so a withdrawal never sits half-applied
    pub async fn withdraw(&self, account_id: &str, amount: Amount) -> EngineResult<Account> {
        let _guard = self.locks.lock(&account_lock_key(account_id)).await;
        let mut txn = Txn::new(self.store.as_ref());
        let owner = ReservationOwner::Withdrawal(uuid::Uuid::new_v4().to_string());
        let reservation = self.reserve_in(&mut txn, account_id, amount, owner)?;
        self.commit_in(&mut txn, &reservation.reservation_id)?;
        let account = self.load_account_in(&txn, account_id)?;
        txn.commit()?;
        info!(account_id = %account_id, amount, "Withdrawal recorded");
        Ok(account)
    }

    pub fn load_account_in(&self, txn: &Txn<'_>, account_id: &str) -> EngineResult<Account> {
        txn.get_json(&state_store::account_key(account_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Account, account_id))
    }

    fn load_reservation_in(&self, txn: &Txn<'_>, reservation_id: &str) -> EngineResult<Reservation> {
        txn.get_json(&state_store::reservation_key(reservation_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Reservation, reservation_id))
    }

    /// Hold `amount` against the account's available balance
    pub fn reserve_in(
        &self,
        txn: &mut Txn<'_>,
        account_id: &str,
        amount: Amount,
        owner: ReservationOwner,
    ) -> EngineResult<Reservation> {
        if amount == 0 {
            return Err(EngineError::invalid("reservation amount must be positive"));
        }

        let mut account = self.load_account_in(txn, account_id)?;
        let reservation_id = reservation_id_for(account_id, &owner);

        if let Some(existing) = txn.get_json::<Reservation>(&state_store::reservation_key(&reservation_id))? {
            if existing.status != ReservationStatus::Released {
                return Err(EngineError::InvalidState(format!(
                    "reservation {} is already outstanding",
                    reservation_id
                )));
            }
        }

        let available = account.available();
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        account.held += amount;
        self.record(txn, &mut account, EntryKind::Reserve, amount, &reservation_id)?;

        let now = self.clock.now();
        let reservation = Reservation {
            reservation_id: reservation_id.clone(),
            account_id: account_id.to_string(),
            amount,
            owner,
            status: ReservationStatus::Held,
            created_at: now,
            updated_at: now,
        };
        txn.put_json(state_store::reservation_key(&reservation_id), &reservation)?;

        debug!(account_id = %account_id, reservation_id = %reservation_id, amount, "Reserved");
        Ok(reservation)
    }

    /// Held -> Committed, debiting the balance; a repeated commit is a no-op
    pub fn commit_in(&self, txn: &mut Txn<'_>, reservation_id: &str) -> EngineResult<Reservation> {
        let mut reservation = self.load_reservation_in(txn, reservation_id)?;
        match reservation.status {
            ReservationStatus::Committed => return Ok(reservation),
            ReservationStatus::Released => {
                return Err(EngineError::InvalidState(format!(
                    "reservation {} was released",
                    reservation_id
                )))
            }
            ReservationStatus::Held => {}
        }

        let mut account = self.load_account_in(txn, &reservation.account_id)?;
        if account.held < reservation.amount || account.balance < reservation.amount {
            return Err(EngineError::InvalidState(format!(
                "account {} cannot cover reservation {}",
                account.account_id, reservation_id
            )));
        }
        account.held -= reservation.amount;
        account.balance -= reservation.amount;

        let kind = match reservation.owner {
            ReservationOwner::Withdrawal(_) => EntryKind::Withdrawal,
            _ => EntryKind::Commit,
        };
        self.record(txn, &mut account, kind, reservation.amount, reservation_id)?;

        reservation.status = ReservationStatus::Committed;
        reservation.updated_at = self.clock.now();
        txn.put_json(state_store::reservation_key(reservation_id), &reservation)?;

        debug!(reservation_id = %reservation_id, amount = reservation.amount, "Committed");
        Ok(reservation)
    }

    /// Held -> Released without touching the balance; a repeated release is a no-op
    pub fn release_in(&self, txn: &mut Txn<'_>, reservation_id: &str) -> EngineResult<Reservation> {
        let mut reservation = self.load_reservation_in(txn, reservation_id)?;
        match reservation.status {
            ReservationStatus::Released => return Ok(reservation),
            ReservationStatus::Committed => {
                return Err(EngineError::InvalidState(format!(
                    "reservation {} is already committed",
                    reservation_id
                )))
            }
            ReservationStatus::Held => {}
        }

        let mut account = self.load_account_in(txn, &reservation.account_id)?;
        account.held = account.held.saturating_sub(reservation.amount);
        self.record(txn, &mut account, EntryKind::Release, reservation.amount, reservation_id)?;

        reservation.status = ReservationStatus::Released;
        reservation.updated_at = self.clock.now();
        txn.put_json(state_store::reservation_key(reservation_id), &reservation)?;

        debug!(reservation_id = %reservation_id, amount = reservation.amount, "Released");
        Ok(reservation)
    }

    /// Increase the balance; crediting zero leaves the account untouched
    pub fn credit_in(
        &self,
        txn: &mut Txn<'_>,
        account_id: &str,
        amount: Amount,
        kind: EntryKind,
        reference: &str,
    ) -> EngineResult<Account> {
        let mut account = self.load_account_in(txn, account_id)?;
        if amount == 0 {
            return Ok(account);
        }

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::invalid("credit overflows the account balance"))?;
        self.record(txn, &mut account, kind, amount, reference)?;
        Ok(account)
    }

    /// Bump the version, stage the account and its journal entry
    fn record(
        &self,
        txn: &mut Txn<'_>,
        account: &mut Account,
        kind: EntryKind,
        amount: Amount,
        reference: &str,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        account.version += 1;
        account.updated_at = now;

        let entry = JournalEntry {
            seq: account.version,
            kind,
            amount,
            reference: reference.to_string(),
            balance_after: account.balance,
            available_after: account.available(),
            at: now,
        };

        txn.put_json(state_store::account_key(&account.account_id), account)?;
        txn.put_json(state_store::journal_key(&account.account_id, account.version), &entry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::SystemClock;
    use crate::storage::MemoryStore;

    fn ledger() -> Ledger {
        Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EntityLocks::new()),
            Arc::new(SystemClock),
        )
    }

    fn wager(id: &str) -> ReservationOwner {
        ReservationOwner::Wager(id.to_string())
    }

    #[tokio::test]
    async fn test_reserve_release_round_trip() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();

        let r = ledger.reserve("alice", 30, wager("w1")).await.unwrap();
        let account = ledger.account("alice").unwrap();
        assert_eq!(account.balance, 100);
        assert_eq!(account.available(), 70);

        ledger.release(&r.reservation_id).await.unwrap();
        let account = ledger.account("alice").unwrap();
        assert_eq!(account.balance, 100);
        assert_eq!(account.available(), 100);
    }

    #[tokio::test]
    async fn test_commit_debits_once() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();

        let r = ledger.reserve("alice", 40, wager("w1")).await.unwrap();
        ledger.commit(&r.reservation_id).await.unwrap();
        ledger.commit(&r.reservation_id).await.unwrap();

        let account = ledger.account("alice").unwrap();
        assert_eq!(account.balance, 60);
        assert_eq!(account.held, 0);
    }

    #[tokio::test]
    async fn test_commit_after_release_is_invalid_state() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        let r = ledger.reserve("alice", 40, wager("w1")).await.unwrap();
        ledger.release(&r.reservation_id).await.unwrap();
        ledger.release(&r.reservation_id).await.unwrap();

        let err = ledger.commit(&r.reservation_id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(ledger.account("alice").unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_unknown_reservation() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        let err = ledger.commit("alice|wager:nope").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownEntity {
                kind: EntityKind::Reservation,
                ..
            }
        ));
        assert!(ledger.release("garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_funds_counts_held() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        ledger.reserve("alice", 80, wager("w1")).await.unwrap();

        let err = ledger.reserve("alice", 30, wager("w2")).await.unwrap_err();
        match err {
            EngineError::InsufficientFunds { requested, available } => {
                assert_eq!(requested, 30);
                assert_eq!(available, 20);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_one_outstanding_reservation_per_owner() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        ledger.reserve("alice", 10, wager("w1")).await.unwrap();
        let err = ledger.reserve("alice", 10, wager("w1")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_overdraw() {
        let ledger = Arc::new(ledger());
        ledger.open_account("alice", 100).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve("alice", 25, wager(&format!("w{}", i))).await })
            })
            .collect();

        let ok = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert_eq!(ok, 4);
        let account = ledger.account("alice").unwrap();
        assert_eq!(account.held, 100);
        assert_eq!(account.available(), 0);
    }

    async fn confirm(ledger: &Ledger, deposit_id: &str) -> EngineResult<Deposit> {
        let account_id = ledger.deposit(deposit_id)?.account_id;
        let _guard = ledger.locks().lock(&account_lock_key(&account_id)).await;
        let mut txn = Txn::new(ledger.store());
        let deposit = ledger.confirm_deposit_in(&mut txn, deposit_id)?;
        txn.commit()?;
        Ok(deposit)
    }

    #[tokio::test]
    async fn test_deposit_credits_only_on_confirmation() {
        let ledger = ledger();
        ledger.open_account("alice", 0).await.unwrap();

        let pending = ledger.request_deposit("alice", 50).unwrap();
        assert_eq!(pending.status, DepositStatus::Pending);
        assert_eq!(ledger.account("alice").unwrap().balance, 0);

        let confirmed = confirm(&ledger, &pending.id).await.unwrap();
        assert_eq!(confirmed.status, DepositStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(ledger.account("alice").unwrap().balance, 50);

        let again = confirm(&ledger, &pending.id).await.unwrap_err();
        assert!(matches!(again, EngineError::AlreadySettled(_)));
        assert_eq!(ledger.account("alice").unwrap().balance, 50);

        let listed = ledger.deposits_for("alice", None, 10).unwrap();
        assert_eq!(listed.items, vec![confirmed]);

        assert!(ledger.request_deposit("alice", 0).is_err());
        assert!(ledger.request_deposit("nobody", 5).is_err());
    }

    #[tokio::test]
    async fn test_journal_tracks_every_mutation() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        let deposit = ledger.request_deposit("alice", 50).unwrap();
        confirm(&ledger, &deposit.id).await.unwrap();
        ledger.withdraw("alice", 20).await.unwrap();

        let account = ledger.account("alice").unwrap();
        assert_eq!(account.balance, 130);
        assert_eq!(account.version, 4);

        let page = ledger.history("alice", None, 10).unwrap();
        let kinds: Vec<_> = page.items.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Withdrawal, EntryKind::Reserve, EntryKind::Deposit, EntryKind::Open]
        );
        assert_eq!(page.items[0].seq, 4);
        assert_eq!(page.items[0].balance_after, 130);
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let ledger = ledger();
        ledger.open_account("alice", 100).await.unwrap();
        let again = ledger.open_account("alice", 999).await.unwrap();
        assert_eq!(again.balance, 100);
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_withdraw_beyond_available_has_no_effect() {
        let ledger = ledger();
        ledger.open_account("alice", 10).await.unwrap();
        let err = ledger.withdraw("alice", 11).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        let account = ledger.account("alice").unwrap();
        assert_eq!(account.balance, 10);
        assert_eq!(account.version, 1);
    }
}
