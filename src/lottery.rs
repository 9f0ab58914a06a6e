//! Lottery pot
//!
//! One round runs at a time. An entry holds its stake as a reservation while
//! the round is open, exactly like a room seat, so the pot is always backed by
//! held funds. Closing the round is a single batch: either every stake is
//! committed and the whole pot goes to one entrant, or every stake is released.
//!
//! Winners come from the operator, either named outright or drawn from a
//! published seed with each entrant weighted by stake.

use crate::common::traits::Clock;
use crate::common::types::{AccountId, Amount, ReservationId};
use crate::config::LotteryConfig;
use crate::errors::{EngineError, EngineResult, EntityKind};
use crate::ledger::{EntryKind, Ledger, ReservationOwner};
use crate::locks::{account_lock_key, lottery_lock_key};
use crate::state_store;
use crate::storage::Txn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Rounds are only ever touched through the current-round pointer
const CURRENT_ROUND: &str = "current";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LotteryStatus {
    Open,
    Drawn,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryRound {
    pub id: String,
    pub status: LotteryStatus,
    pub ends_at: DateTime<Utc>,
    /// Sum of entry stakes
    pub pot: Amount,
    pub entries: u64,
    pub winner: Option<AccountId>,
    pub settlement_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl LotteryRound {
    pub fn accepts_entries(&self, now: DateTime<Utc>) -> bool {
        self.status == LotteryStatus::Open && now < self.ends_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryEntry {
    pub id: String,
    pub round_id: String,
    /// Arrival order within the round
    pub seq: u64,
    pub account_id: AccountId,
    pub amount: Amount,
    pub reservation_id: ReservationId,
    pub created_at: DateTime<Utc>,
}

/// How the operator ends a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LotteryClose {
    Winner { account_id: AccountId },
    /// Stake-weighted pick from sha256(round id, seed)
    Draw { seed: String },
    Refund,
}

pub struct LotteryBook {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    config: LotteryConfig,
}

impl LotteryBook {
    pub fn new(ledger: Arc<Ledger>, clock: Arc<dyn Clock>, config: LotteryConfig) -> Self {
        Self { ledger, clock, config }
    }

    fn current_id(&self, txn: &Txn<'_>) -> EngineResult<String> {
        txn.get(state_store::LOTTERY_CURRENT_KEY.as_bytes())?
            .map(|id| String::from_utf8_lossy(&id).into_owned())
            .ok_or_else(|| EngineError::unknown(EntityKind::Lottery, CURRENT_ROUND))
    }

    fn load_round_in(&self, txn: &Txn<'_>, round_id: &str) -> EngineResult<LotteryRound> {
        txn.get_json(&state_store::lottery_round_key(round_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Lottery, round_id))
    }

    /// The open round, or the most recently closed one
    pub fn current(&self) -> EngineResult<LotteryRound> {
        let txn = Txn::new(self.ledger.store());
        let round_id = self.current_id(&txn)?;
        self.load_round_in(&txn, &round_id)
    }

    pub fn round(&self, round_id: &str) -> EngineResult<LotteryRound> {
        self.load_round_in(&Txn::new(self.ledger.store()), round_id)
    }

    /// Largest stakes first
    pub fn top_entries(&self, round_id: &str, limit: Option<usize>) -> EngineResult<Vec<LotteryEntry>> {
        let limit = limit.unwrap_or(self.config.top_limit).max(1);
        let page = state_store::scan_records(
            self.ledger.store(),
            &state_store::lottery_top_prefix(round_id),
            None,
            limit,
        )?;
        Ok(page.items)
    }

    /// Every entry in arrival order
    pub fn entries(&self, round_id: &str) -> EngineResult<Vec<LotteryEntry>> {
        let prefix = state_store::lottery_entry_prefix(round_id);
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = state_store::scan_records::<LotteryEntry>(self.ledger.store(), &prefix, cursor.as_deref(), 256)?;
            entries.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    fn validate_end(&self, ends_at: DateTime<Utc>) -> EngineResult<()> {
        if ends_at <= self.clock.now() {
            return Err(EngineError::invalid("lottery end must be in the future"));
        }
        Ok(())
    }

    /// Start a new round; only one may be open
    pub async fn open_round(&self, ends_at: DateTime<Utc>) -> EngineResult<LotteryRound> {
        self.validate_end(ends_at)?;
        let _guard = self.ledger.locks().lock(&lottery_lock_key(CURRENT_ROUND)).await;

        let mut txn = Txn::new(self.ledger.store());
        if let Ok(current_id) = self.current_id(&txn) {
            let current = self.load_round_in(&txn, &current_id)?;
            if current.status == LotteryStatus::Open {
                return Err(EngineError::InvalidState(format!(
                    "lottery round {} is still open",
                    current.id
                )));
            }
        }

        let round = LotteryRound {
            id: Uuid::new_v4().to_string(),
            status: LotteryStatus::Open,
            ends_at,
            pot: 0,
            entries: 0,
            winner: None,
            settlement_hash: None,
            created_at: self.clock.now(),
            closed_at: None,
        };
        txn.put_json(state_store::lottery_round_key(&round.id), &round)?;
        txn.put(
            state_store::LOTTERY_CURRENT_KEY.as_bytes().to_vec(),
            round.id.clone().into_bytes(),
        );
        txn.commit()?;

        info!(round_id = %round.id, ends_at = %round.ends_at, "Lottery round opened");
        Ok(round)
    }

    /// Move the end of the open round
    pub async fn change_end(&self, ends_at: DateTime<Utc>) -> EngineResult<LotteryRound> {
        self.validate_end(ends_at)?;
        let _guard = self.ledger.locks().lock(&lottery_lock_key(CURRENT_ROUND)).await;

        let mut txn = Txn::new(self.ledger.store());
        let mut round = self.load_round_in(&txn, &self.current_id(&txn)?)?;
        if round.status != LotteryStatus::Open {
            return Err(EngineError::InvalidState(format!("lottery round {} is closed", round.id)));
        }
        round.ends_at = ends_at;
        txn.put_json(state_store::lottery_round_key(&round.id), &round)?;
        txn.commit()?;

        info!(round_id = %round.id, ends_at = %ends_at, "Lottery end moved");
        Ok(round)
    }

    /// Hold `amount` from the account and add it to the pot
    pub async fn enter(&self, account_id: &str, amount: Amount) -> EngineResult<(LotteryEntry, LotteryRound)> {
        if amount < self.config.min_stake.max(1) {
            return Err(EngineError::invalid(format!(
                "lottery stake must be at least {}",
                self.config.min_stake.max(1)
            )));
        }

        let locks = self.ledger.locks().clone();
        let _round_guard = locks.lock(&lottery_lock_key(CURRENT_ROUND)).await;
        let _account_guard = locks.lock(&account_lock_key(account_id)).await;

        let mut txn = Txn::new(self.ledger.store());
        let mut round = self.load_round_in(&txn, &self.current_id(&txn)?)?;
        let now = self.clock.now();
        if !round.accepts_entries(now) {
            return Err(EngineError::InvalidState(format!(
                "lottery round {} is not taking entries",
                round.id
            )));
        }

        let seq = round.entries + 1;
        let reservation = self.ledger.reserve_in(
            &mut txn,
            account_id,
            amount,
            ReservationOwner::Ticket(format!("{}:{}", round.id, seq)),
        )?;

        let entry = LotteryEntry {
            id: Uuid::new_v4().to_string(),
            round_id: round.id.clone(),
            seq,
            account_id: account_id.to_string(),
            amount,
            reservation_id: reservation.reservation_id,
            created_at: now,
        };
        round.entries = seq;
        round.pot = round
            .pot
            .checked_add(amount)
            .ok_or_else(|| EngineError::invalid("lottery pot overflows the amount range"))?;

        txn.put_json(state_store::lottery_round_key(&round.id), &round)?;
        txn.put_json(state_store::lottery_entry_key(&round.id, seq), &entry)?;
        txn.put_json(state_store::lottery_top_key(&round.id, amount, seq), &entry)?;
        txn.commit()?;

        info!(round_id = %round.id, account_id = %account_id, amount, pot = round.pot, "Lottery entry");
        Ok((entry, round))
    }

    /// End the open round: pay one entrant or refund everyone
    pub async fn close(&self, how: LotteryClose) -> EngineResult<LotteryRound> {
        let locks = self.ledger.locks().clone();
        let _round_guard = locks.lock(&lottery_lock_key(CURRENT_ROUND)).await;

        let mut round = self.current()?;
        if round.status != LotteryStatus::Open {
            return Err(EngineError::AlreadySettled(format!("lottery round {}", round.id)));
        }

        let entries = self.entries(&round.id)?;
        let winner = match &how {
            LotteryClose::Winner { account_id } => {
                if !entries.iter().any(|e| &e.account_id == account_id) {
                    return Err(EngineError::invalid(format!(
                        "{} has no entry in round {}",
                        account_id, round.id
                    )));
                }
                Some(account_id.clone())
            }
            LotteryClose::Draw { seed } => {
                let winner = draw_winner(&round.id, seed, &entries)
                    .ok_or_else(|| EngineError::InvalidState(format!("lottery round {} has no entries", round.id)))?;
                Some(winner)
            }
            LotteryClose::Refund => None,
        };

        let account_ids: Vec<&str> = entries.iter().map(|e| e.account_id.as_str()).collect();
        let _account_guards = locks.lock_accounts(account_ids).await;
        let mut txn = Txn::new(self.ledger.store());

        match &winner {
            Some(winner) => {
                for entry in &entries {
                    self.ledger.commit_in(&mut txn, &entry.reservation_id)?;
                }
                self.ledger
                    .credit_in(&mut txn, winner, round.pot, EntryKind::Payout, &round.id)?;
                round.status = LotteryStatus::Drawn;
                round.settlement_hash = Some(settlement_hash(&round, winner, &entries));
            }
            None => {
                for entry in &entries {
                    self.ledger.release_in(&mut txn, &entry.reservation_id)?;
                }
                round.status = LotteryStatus::Refunded;
            }
        }
        round.winner = winner;
        round.closed_at = Some(self.clock.now());

        txn.put_json(state_store::lottery_round_key(&round.id), &round)?;
        txn.commit()?;

        info!(
            round_id = %round.id,
            status = ?round.status,
            winner = ?round.winner,
            pot = round.pot,
            entries = round.entries,
            "Lottery round closed"
        );
        Ok(round)
    }
}

/// Stake-weighted pick: each entry owns a slice of [0, pot) in arrival order
fn draw_winner(round_id: &str, seed: &str, entries: &[LotteryEntry]) -> Option<AccountId> {
    let pot: u128 = entries.iter().map(|e| u128::from(e.amount)).sum();
    if pot == 0 {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(round_id.as_bytes());
    hasher.update(b"|");
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    let mut ticket = u128::from_be_bytes(head) % pot;

    for entry in entries {
        let weight = u128::from(entry.amount);
        if ticket < weight {
            return Some(entry.account_id.clone());
        }
        ticket -= weight;
    }
    None
}

fn settlement_hash(round: &LotteryRound, winner: &str, entries: &[LotteryEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(round.id.as_bytes());
    for entry in entries {
        hasher.update(b"|");
        hasher.update(entry.account_id.as_bytes());
        hasher.update(entry.amount.to_be_bytes());
    }
    hasher.update(b"|winner|");
    hasher.update(winner.as_bytes());
    hasher.update(round.pot.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::ManualClock;
    use crate::locks::EntityLocks;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn fixture() -> (Arc<ManualClock>, Arc<Ledger>, LotteryBook) {
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EntityLocks::new()),
            clock.clone(),
        ));
        for id in ["alice", "bob", "carol"] {
            ledger.open_account(id, 100).await.unwrap();
        }
        let book = LotteryBook::new(ledger.clone(), clock.clone(), LotteryConfig::default());
        (clock, ledger, book)
    }

    #[tokio::test]
    async fn test_entries_hold_stake_until_draw() {
        let (_, ledger, book) = fixture().await;
        book.open_round(t0() + Duration::days(1)).await.unwrap();

        book.enter("alice", 30).await.unwrap();
        let (_, round) = book.enter("bob", 50).await.unwrap();
        assert_eq!(round.pot, 80);
        assert_eq!(round.entries, 2);

        let alice = ledger.account("alice").unwrap();
        assert_eq!((alice.balance, alice.held), (100, 30));

        let closed = book
            .close(LotteryClose::Winner {
                account_id: "alice".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(closed.status, LotteryStatus::Drawn);
        assert!(closed.settlement_hash.is_some());

        let alice = ledger.account("alice").unwrap();
        assert_eq!((alice.balance, alice.held), (150, 0));
        let bob = ledger.account("bob").unwrap();
        assert_eq!((bob.balance, bob.held), (50, 0));

        let again = book.close(LotteryClose::Refund).await.unwrap_err();
        assert!(matches!(again, EngineError::AlreadySettled(_)));
        assert_eq!(ledger.account("alice").unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_refund_releases_every_stake() {
        let (_, ledger, book) = fixture().await;
        book.open_round(t0() + Duration::hours(2)).await.unwrap();
        book.enter("alice", 10).await.unwrap();
        book.enter("alice", 15).await.unwrap();
        book.enter("carol", 40).await.unwrap();

        let closed = book.close(LotteryClose::Refund).await.unwrap();
        assert_eq!(closed.status, LotteryStatus::Refunded);
        assert!(closed.winner.is_none());
        for id in ["alice", "carol"] {
            let account = ledger.account(id).unwrap();
            assert_eq!((account.balance, account.held), (100, 0));
        }
    }

    #[tokio::test]
    async fn test_entry_rules() {
        let (clock, _, book) = fixture().await;
        assert!(matches!(book.enter("alice", 10).await, Err(EngineError::UnknownEntity { .. })));
        assert!(book.open_round(t0()).await.is_err());

        book.open_round(t0() + Duration::hours(1)).await.unwrap();
        assert!(matches!(
            book.open_round(t0() + Duration::hours(2)).await,
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(book.enter("alice", 0).await, Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            book.enter("alice", 101).await,
            Err(EngineError::InsufficientFunds { .. })
        ));

        clock.advance(Duration::minutes(30));
        book.change_end(t0() + Duration::hours(3)).await.unwrap();
        clock.advance(Duration::hours(3));
        assert!(matches!(book.enter("alice", 5).await, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_seeded_draw_is_reproducible_and_weighted() {
        let (_, _, book) = fixture().await;
        let round = book.open_round(t0() + Duration::hours(1)).await.unwrap();
        book.enter("alice", 1).await.unwrap();
        book.enter("bob", 99).await.unwrap();
        let entries = book.entries(&round.id).unwrap();

        let first = draw_winner(&round.id, "block-812", &entries);
        assert_eq!(first, draw_winner(&round.id, "block-812", &entries));

        let bob_wins = (0..200)
            .filter(|i| draw_winner(&round.id, &format!("seed-{}", i), &entries).as_deref() == Some("bob"))
            .count();
        assert!(bob_wins > 150, "bob holds 99% of the pot but won {} of 200", bob_wins);

        let closed = book
            .close(LotteryClose::Draw {
                seed: "block-812".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(closed.winner, first);
    }

    #[tokio::test]
    async fn test_top_entries_by_stake() {
        let (_, _, book) = fixture().await;
        let round = book.open_round(t0() + Duration::hours(1)).await.unwrap();
        book.enter("alice", 20).await.unwrap();
        book.enter("bob", 70).await.unwrap();
        book.enter("carol", 45).await.unwrap();

        let top = book.top_entries(&round.id, Some(2)).unwrap();
        let names: Vec<_> = top.iter().map(|e| e.account_id.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol"]);
        assert_eq!(book.current().unwrap().pot, 135);
    }

    #[tokio::test]
    async fn test_named_winner_must_have_entered() {
        let (_, ledger, book) = fixture().await;
        book.open_round(t0() + Duration::hours(1)).await.unwrap();
        book.enter("alice", 20).await.unwrap();

        let err = book
            .close(LotteryClose::Winner {
                account_id: "carol".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(ledger.account("alice").unwrap().held, 20);
        assert_eq!(book.current().unwrap().status, LotteryStatus::Open);
    }
}
