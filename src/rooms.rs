//! Multiplayer rooms
//!
//! `Open -> Full -> InProgress -> Settled`, with `Open -> Cancelled` as the only
//! other terminal path. The join that fills the last seat walks the room
//! through Full into InProgress inside one batch, so no reader ever sees a
//! Full room.

use crate::common::traits::Clock;
use crate::common::types::{AccountId, Amount, ReservationId, RoomId, RoomKind};
use crate::config::RoomConfig;
use crate::errors::{EngineError, EngineResult, EntityKind};
use crate::ledger::{EntryKind, Ledger, ReservationOwner};
use crate::locks::room_lock_key;
use crate::state_store::{self, Page};
use crate::storage::Txn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomStatus {
    Open,
    Full,
    InProgress,
    Settled,
    Cancelled,
}

impl RoomStatus {
    /// Legal single-step transitions
    pub fn can_advance_to(self, next: RoomStatus) -> bool {
        matches!(
            (self, next),
            (RoomStatus::Open, RoomStatus::Full)
                | (RoomStatus::Full, RoomStatus::InProgress)
                | (RoomStatus::InProgress, RoomStatus::Settled)
                | (RoomStatus::Open, RoomStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoomStatus::Settled | RoomStatus::Cancelled)
    }
}

/// Resolved result of a room's game
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "account_id", rename_all = "lowercase")]
pub enum RoomOutcome {
    Winner(AccountId),
    Draw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seat {
    pub account_id: AccountId,
    pub reservation_id: ReservationId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    /// Stake every participant puts in
    pub reward: Amount,
    pub capacity: usize,
    pub host_id: AccountId,
    /// Join order; seat number is the index
    pub participants: Vec<Seat>,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub outcome: Option<RoomOutcome>,
    pub settlement_hash: Option<String>,
}

impl Room {
    pub fn seats_taken(&self) -> usize {
        self.participants.len()
    }

    pub fn pool(&self) -> Amount {
        self.reward.saturating_mul(self.participants.len() as Amount)
    }

    pub fn is_participant(&self, account_id: &str) -> bool {
        self.participants.iter().any(|s| s.account_id == account_id)
    }

    pub fn participant_ids(&self) -> Vec<&str> {
        self.participants.iter().map(|s| s.account_id.as_str()).collect()
    }

    fn advance(&mut self, next: RoomStatus) -> EngineResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(EngineError::InvalidState(format!(
                "room {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub host_id: AccountId,
    pub name: String,
    pub reward: Amount,
    pub kind: RoomKind,
    /// Defaults to the configured capacity
    pub capacity: Option<usize>,
}

pub struct RoomBook {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    config: RoomConfig,
}

impl RoomBook {
    pub fn new(ledger: Arc<Ledger>, clock: Arc<dyn Clock>, config: RoomConfig) -> Self {
        Self { ledger, clock, config }
    }

    pub fn get(&self, room_id: &str) -> EngineResult<Room> {
        state_store::load(self.ledger.store(), &state_store::room_key(room_id))?
            .ok_or_else(|| EngineError::unknown(EntityKind::Room, room_id))
    }

    /// Joinable rooms, oldest first
    pub fn list_open(&self, kind: Option<RoomKind>, cursor: Option<&str>, limit: usize) -> EngineResult<Page<Room>> {
        let store = self.ledger.store();
        let ids = state_store::scan_ids(store, state_store::ROOM_OPEN_PREFIX.as_bytes(), cursor, limit)?;
        let mut page: Page<Room> = state_store::load_page(store, ids, state_store::room_key)?;
        page.items.retain(|room| room.status == RoomStatus::Open && kind.map_or(true, |k| room.kind == k));
        Ok(page)
    }

    /// Outcome recorded for a room but not yet applied
    pub fn pending_result(&self, room_id: &str) -> EngineResult<Option<RoomOutcome>> {
        state_store::load(self.ledger.store(), &state_store::room_result_key(room_id))
    }

    fn validate(&self, req: &CreateRoom) -> EngineResult<(String, usize)> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("room name must not be empty"));
        }
        if name.chars().count() > self.config.name_max_chars {
            return Err(EngineError::invalid(format!(
                "room name longer than {} characters",
                self.config.name_max_chars
            )));
        }
        if req.reward == 0 || req.reward < self.config.min_reward {
            return Err(EngineError::invalid(format!(
                "reward must be at least {}",
                self.config.min_reward.max(1)
            )));
        }
        let capacity = req.capacity.unwrap_or(self.config.default_capacity);
        if capacity < 2 || capacity > self.config.max_capacity {
            return Err(EngineError::invalid(format!(
                "capacity must be between 2 and {}",
                self.config.max_capacity
            )));
        }
        Ok((name.to_string(), capacity))
    }

    /// Open a room and stake the host's seat
    pub async fn create(&self, req: &CreateRoom) -> EngineResult<Room> {
        let (name, capacity) = self.validate(req)?;
        let room_id = Uuid::new_v4().to_string();

        let _guards = self.ledger.locks().lock_accounts([req.host_id.as_str()]).await;
        let mut txn = Txn::new(self.ledger.store());

        let reservation = self.ledger.reserve_in(
            &mut txn,
            &req.host_id,
            req.reward,
            ReservationOwner::Seat(room_id.clone()),
        )?;

        let now = self.clock.now();
        let room = Room {
            id: room_id.clone(),
            name,
            kind: req.kind,
            reward: req.reward,
            capacity,
            host_id: req.host_id.clone(),
            participants: vec![Seat {
                account_id: req.host_id.clone(),
                reservation_id: reservation.reservation_id,
                joined_at: now,
            }],
            status: RoomStatus::Open,
            created_at: now,
            started_at: None,
            settled_at: None,
            outcome: None,
            settlement_hash: None,
        };

        txn.put_json(state_store::room_key(&room_id), &room)?;
        txn.put(state_store::room_open_key(now, &room_id), room_id.clone().into_bytes());
        txn.commit()?;

        info!(
            room_id = %room_id,
            host_id = %room.host_id,
            kind = %room.kind,
            reward = room.reward,
            capacity,
            "Room created"
        );
        Ok(room)
    }

    /// Take a seat; the last seat starts the game
    pub async fn join(&self, room_id: &str, account_id: &str) -> EngineResult<Room> {
        let locks = self.ledger.locks().clone();
        let _room_guard = locks.lock(&room_lock_key(room_id)).await;

        let mut room = self.get(room_id)?;
        match room.status {
            RoomStatus::Open => {}
            RoomStatus::Full | RoomStatus::InProgress => return Err(EngineError::RoomFull(room_id.to_string())),
            RoomStatus::Settled | RoomStatus::Cancelled => {
                return Err(EngineError::RoomNotOpen(room_id.to_string()))
            }
        }
        if room.seats_taken() >= room.capacity {
            return Err(EngineError::RoomFull(room_id.to_string()));
        }
        if room.is_participant(account_id) {
            return Err(EngineError::InvalidState(format!(
                "{} already holds a seat in room {}",
                account_id, room_id
            )));
        }

        let fills = room.seats_taken() + 1 == room.capacity;
        let mut to_lock = vec![account_id];
        if fills {
            to_lock.extend(room.participant_ids());
        }
        let _account_guards = locks.lock_accounts(to_lock).await;

        let mut txn = Txn::new(self.ledger.store());
        let reservation =
            self.ledger
                .reserve_in(&mut txn, account_id, room.reward, ReservationOwner::Seat(room_id.to_string()))?;

        let now = self.clock.now();
        room.participants.push(Seat {
            account_id: account_id.to_string(),
            reservation_id: reservation.reservation_id,
            joined_at: now,
        });

        if fills {
            room.advance(RoomStatus::Full)?;
            room.advance(RoomStatus::InProgress)?;
            room.started_at = Some(now);
            for seat in &room.participants {
                self.ledger.commit_in(&mut txn, &seat.reservation_id)?;
            }
            txn.delete(state_store::room_open_key(room.created_at, room_id));
            txn.put(state_store::room_live_key(room_id), room_id.as_bytes().to_vec());
        }

        txn.put_json(state_store::room_key(room_id), &room)?;
        txn.commit()?;

        info!(
            room_id = %room_id,
            account_id = %account_id,
            seat = room.seats_taken() - 1,
            status = ?room.status,
            "Joined room"
        );
        Ok(room)
    }

    /// Give up a seat while the room is still Open; the last one out cancels it
    pub async fn leave(&self, room_id: &str, account_id: &str) -> EngineResult<Room> {
        let locks = self.ledger.locks().clone();
        let _room_guard = locks.lock(&room_lock_key(room_id)).await;

        let mut room = self.get(room_id)?;
        if room.status != RoomStatus::Open {
            return Err(EngineError::RoomNotOpen(room_id.to_string()));
        }
        let Some(index) = room.participants.iter().position(|s| s.account_id == account_id) else {
            return Err(EngineError::InvalidState(format!(
                "{} holds no seat in room {}",
                account_id, room_id
            )));
        };

        let _account_guards = locks.lock_accounts([account_id]).await;
        let mut txn = Txn::new(self.ledger.store());

        let seat = room.participants.remove(index);
        self.ledger.release_in(&mut txn, &seat.reservation_id)?;

        if room.participants.is_empty() {
            room.advance(RoomStatus::Cancelled)?;
            room.settled_at = Some(self.clock.now());
            txn.delete(state_store::room_open_key(room.created_at, room_id));
        } else if room.host_id == account_id {
            room.host_id = room.participants[0].account_id.clone();
        }

        txn.put_json(state_store::room_key(room_id), &room)?;
        txn.commit()?;

        info!(room_id = %room_id, account_id = %account_id, status = ?room.status, "Left room");
        Ok(room)
    }

    /// Cancel an Open room and release every stake
    ///
    /// With `requested_by` set, only the current host may cancel.
    pub async fn cancel(&self, room_id: &str, requested_by: Option<&str>) -> EngineResult<Room> {
        let locks = self.ledger.locks().clone();
        let _room_guard = locks.lock(&room_lock_key(room_id)).await;

        let mut room = self.get(room_id)?;
        if room.status != RoomStatus::Open {
            return Err(EngineError::RoomNotOpen(room_id.to_string()));
        }
        if let Some(requester) = requested_by {
            if requester != room.host_id {
                return Err(EngineError::InvalidState(format!(
                    "only the host of room {} may cancel it",
                    room_id
                )));
            }
        }

        let _account_guards = locks.lock_accounts(room.participant_ids()).await;
        let mut txn = Txn::new(self.ledger.store());
        for seat in &room.participants {
            self.ledger.release_in(&mut txn, &seat.reservation_id)?;
        }

        room.advance(RoomStatus::Cancelled)?;
        room.settled_at = Some(self.clock.now());
        txn.delete(state_store::room_open_key(room.created_at, room_id));
        txn.put_json(state_store::room_key(room_id), &room)?;
        txn.commit()?;

        info!(room_id = %room_id, released = room.seats_taken(), "Room cancelled");
        Ok(room)
    }

    fn check_outcome(room: &Room, outcome: &RoomOutcome) -> EngineResult<()> {
        if let RoomOutcome::Winner(winner) = outcome {
            if !room.is_participant(winner) {
                return Err(EngineError::invalid(format!(
                    "{} is not a participant of room {}",
                    winner, room.id
                )));
            }
        }
        Ok(())
    }

    /// Durably record a finished game for the settlement engine to apply
    pub async fn record_result(&self, room_id: &str, outcome: RoomOutcome) -> EngineResult<Room> {
        let _room_guard = self.ledger.locks().lock(&room_lock_key(room_id)).await;

        let room = self.get(room_id)?;
        match room.status {
            RoomStatus::InProgress => {}
            RoomStatus::Settled => return Err(EngineError::AlreadySettled(format!("room {}", room_id))),
            other => {
                return Err(EngineError::InvalidState(format!(
                    "room {} is {:?}, results are only accepted in progress",
                    room_id, other
                )))
            }
        }
        Self::check_outcome(&room, &outcome)?;

        let mut txn = Txn::new(self.ledger.store());
        let key = state_store::room_result_key(room_id);
        if let Some(existing) = txn.get_json::<RoomOutcome>(&key)? {
            if existing != outcome {
                return Err(EngineError::InvalidState(format!(
                    "room {} already has a different result recorded",
                    room_id
                )));
            }
            return Ok(room);
        }
        txn.put_json(key, &outcome)?;
        txn.commit()?;

        debug!(room_id = %room_id, outcome = ?outcome, "Room result recorded");
        Ok(room)
    }

    /// Commit every stake and pay out; applies once per room
    pub async fn settle(&self, room_id: &str, outcome: RoomOutcome) -> EngineResult<Room> {
        let locks = self.ledger.locks().clone();
        let _room_guard = locks.lock(&room_lock_key(room_id)).await;

        let mut room = self.get(room_id)?;
        match room.status {
            RoomStatus::InProgress => {}
            RoomStatus::Settled => return Err(EngineError::AlreadySettled(format!("room {}", room_id))),
            other => {
                return Err(EngineError::InvalidState(format!(
                    "room {} is {:?}, only rooms in progress settle",
                    room_id, other
                )))
            }
        }
        Self::check_outcome(&room, &outcome)?;

        let _account_guards = locks.lock_accounts(room.participant_ids()).await;
        let mut txn = Txn::new(self.ledger.store());

        for seat in &room.participants {
            self.ledger.commit_in(&mut txn, &seat.reservation_id)?;
        }

        let pool = room
            .reward
            .checked_mul(room.participants.len() as Amount)
            .ok_or_else(|| EngineError::invalid("room pool overflows the amount range"))?;

        match &outcome {
            RoomOutcome::Winner(winner) => {
                self.ledger.credit_in(&mut txn, winner, pool, EntryKind::Payout, room_id)?;
            }
            RoomOutcome::Draw => {
                for seat in &room.participants {
                    self.ledger
                        .credit_in(&mut txn, &seat.account_id, room.reward, EntryKind::Refund, room_id)?;
                }
            }
        }

        room.advance(RoomStatus::Settled)?;
        room.settlement_hash = Some(settlement_hash(&room, &outcome, pool));
        room.outcome = Some(outcome);
        room.settled_at = Some(self.clock.now());

        txn.put_json(state_store::room_key(room_id), &room)?;
        txn.delete(state_store::room_live_key(room_id));
        txn.delete(state_store::room_result_key(room_id));
        txn.commit()?;

        info!(
            room_id = %room_id,
            outcome = ?room.outcome,
            pool,
            participants = room.seats_taken(),
            "Room settled"
        );
        Ok(room)
    }
}

/// Digest of what was paid to whom, kept on the room for audits
fn settlement_hash(room: &Room, outcome: &RoomOutcome, pool: Amount) -> String {
    let mut hasher = Sha256::new();
    hasher.update(room.id.as_bytes());
    for seat in &room.participants {
        hasher.update(b"|");
        hasher.update(seat.account_id.as_bytes());
    }
    match outcome {
        RoomOutcome::Winner(winner) => {
            hasher.update(b"|winner|");
            hasher.update(winner.as_bytes());
        }
        RoomOutcome::Draw => hasher.update(b"|draw"),
    }
    hasher.update(pool.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::SystemClock;
    use crate::locks::EntityLocks;
    use crate::storage::MemoryStore;

    async fn book() -> (Arc<Ledger>, RoomBook) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EntityLocks::new()),
            clock.clone(),
        ));
        for id in ["host", "guest", "third"] {
            ledger.open_account(id, 100).await.unwrap();
        }
        let rooms = RoomBook::new(ledger.clone(), clock, RoomConfig::default());
        (ledger, rooms)
    }

    fn create(name: &str, reward: Amount) -> CreateRoom {
        CreateRoom {
            host_id: "host".to_string(),
            name: name.to_string(),
            reward,
            kind: RoomKind::Blackjack,
            capacity: None,
        }
    }

    #[test]
    fn test_state_machine_never_skips() {
        use RoomStatus::*;
        assert!(Open.can_advance_to(Full));
        assert!(Full.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Settled));
        assert!(Open.can_advance_to(Cancelled));
        assert!(!Open.can_advance_to(InProgress));
        assert!(!InProgress.can_advance_to(Cancelled));
        assert!(!Settled.can_advance_to(Open));
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (_, rooms) = book().await;
        assert!(matches!(rooms.create(&create("", 10)).await, Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            rooms.create(&create("a room name that is far too long", 10)).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(rooms.create(&create("table", 0)).await, Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            rooms.create(&create("table", 101)).await,
            Err(EngineError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_room_starts_and_commits() {
        let (ledger, rooms) = book().await;
        let room = rooms.create(&create("table", 50)).await.unwrap();
        assert_eq!(ledger.account("host").unwrap().available(), 50);
        assert_eq!(rooms.list_open(None, None, 10).unwrap().items.len(), 1);

        let room = rooms.join(&room.id, "guest").await.unwrap();
        assert_eq!(room.status, RoomStatus::InProgress);
        assert_eq!(ledger.account("host").unwrap().balance, 50);
        assert_eq!(ledger.account("guest").unwrap().balance, 50);
        assert!(rooms.list_open(None, None, 10).unwrap().items.is_empty());

        let err = rooms.join(&room.id, "third").await.unwrap_err();
        assert!(matches!(err, EngineError::RoomFull(_)));
        let third = ledger.account("third").unwrap();
        assert_eq!((third.balance, third.held), (100, 0));
    }

    #[tokio::test]
    async fn test_settle_winner_once() {
        let (ledger, rooms) = book().await;
        let room = rooms.create(&create("table", 50)).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();

        let settled = rooms
            .settle(&room.id, RoomOutcome::Winner("guest".to_string()))
            .await
            .unwrap();
        assert_eq!(settled.status, RoomStatus::Settled);
        assert!(settled.settlement_hash.is_some());
        assert_eq!(ledger.account("guest").unwrap().balance, 150);
        assert_eq!(ledger.account("host").unwrap().balance, 50);

        let again = rooms
            .settle(&room.id, RoomOutcome::Winner("guest".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::AlreadySettled(_)));
        assert_eq!(ledger.account("guest").unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_draw_returns_stakes() {
        let (ledger, rooms) = book().await;
        let room = rooms.create(&create("dice", 30)).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();
        rooms.settle(&room.id, RoomOutcome::Draw).await.unwrap();
        assert_eq!(ledger.account("host").unwrap().balance, 100);
        assert_eq!(ledger.account("guest").unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_settle_rejects_outsider_and_open_room() {
        let (_, rooms) = book().await;
        let room = rooms.create(&create("table", 10)).await.unwrap();
        let err = rooms.settle(&room.id, RoomOutcome::Draw).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        rooms.join(&room.id, "guest").await.unwrap();
        let err = rooms
            .settle(&room.id, RoomOutcome::Winner("third".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_everyone() {
        let (ledger, rooms) = book().await;
        let mut req = create("table", 20);
        req.capacity = Some(3);
        let room = rooms.create(&req).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();

        let err = rooms.cancel(&room.id, Some("guest")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let cancelled = rooms.cancel(&room.id, Some("host")).await.unwrap();
        assert_eq!(cancelled.status, RoomStatus::Cancelled);
        for id in ["host", "guest"] {
            let account = ledger.account(id).unwrap();
            assert_eq!((account.balance, account.held), (100, 0));
        }
        assert!(matches!(rooms.cancel(&room.id, None).await, Err(EngineError::RoomNotOpen(_))));
        assert!(matches!(rooms.join(&room.id, "third").await, Err(EngineError::RoomNotOpen(_))));
    }

    #[tokio::test]
    async fn test_leave_hands_over_host_and_last_out_cancels() {
        let (ledger, rooms) = book().await;
        let mut req = create("table", 20);
        req.capacity = Some(3);
        let room = rooms.create(&req).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();

        let room = rooms.leave(&room.id, "host").await.unwrap();
        assert_eq!(room.host_id, "guest");
        assert_eq!(room.status, RoomStatus::Open);
        assert_eq!(ledger.account("host").unwrap().available(), 100);

        let room = rooms.leave(&room.id, "guest").await.unwrap();
        assert_eq!(room.status, RoomStatus::Cancelled);
        assert!(rooms.list_open(None, None, 10).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_after_leave() {
        let (_, rooms) = book().await;
        let mut req = create("table", 20);
        req.capacity = Some(3);
        let room = rooms.create(&req).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();
        rooms.leave(&room.id, "guest").await.unwrap();
        let room = rooms.join(&room.id, "guest").await.unwrap();
        assert_eq!(room.seats_taken(), 2);
    }

    #[tokio::test]
    async fn test_list_filters_by_kind() {
        let (_, rooms) = book().await;
        rooms.create(&create("bj", 5)).await.unwrap();
        let mut dice = create("dice", 5);
        dice.kind = RoomKind::Dice;
        rooms.create(&dice).await.unwrap();

        let page = rooms.list_open(Some(RoomKind::Dice), None, 10).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "dice");
    }

    #[tokio::test]
    async fn test_record_result_is_idempotent() {
        let (_, rooms) = book().await;
        let room = rooms.create(&create("table", 10)).await.unwrap();
        rooms.join(&room.id, "guest").await.unwrap();

        let winner = RoomOutcome::Winner("host".to_string());
        rooms.record_result(&room.id, winner.clone()).await.unwrap();
        rooms.record_result(&room.id, winner.clone()).await.unwrap();
        assert_eq!(rooms.pending_result(&room.id).unwrap(), Some(winner));

        let err = rooms.record_result(&room.id, RoomOutcome::Draw).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }
}
