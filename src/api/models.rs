//! API Request and Response Models

use crate::common::types::{Amount, Direction, Price, RoomKind};
use crate::ledger::{Account, Deposit, JournalEntry};
use crate::lottery::{LotteryEntry, LotteryRound};
use crate::referrals::{ReferralLink, ReferralRewards};
use crate::rooms::{Room, RoomOutcome, RoomStatus};
use crate::wagers::Wager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Accounts always open empty; funds arrive through confirmed deposits
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAccountRequest {
    pub account_id: String,
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmountRequest {
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub ok: bool,
    pub account_id: String,
    pub balance: Amount,
    pub available: Amount,
    pub held: Amount,
}

impl From<Account> for BalanceResponse {
    fn from(account: Account) -> Self {
        Self {
            ok: true,
            available: account.available(),
            account_id: account.account_id,
            balance: account.balance,
            held: account.held,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub ok: bool,
    pub deposit: Deposit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositListResponse {
    pub ok: bool,
    pub deposits: Vec<Deposit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Cursor pagination shared by every listing
#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub const MAX_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub ok: bool,
    pub entries: Vec<JournalEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub ok: bool,
    pub available: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceWagerRequest {
    pub amount: Amount,
    pub coin: String,
    pub horizon_hours: u32,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceWagerResponse {
    pub ok: bool,
    pub wager_id: String,
    pub entry_price: Price,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerResponse {
    pub ok: bool,
    pub wager: Wager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerListResponse {
    pub ok: bool,
    pub wagers: Vec<Wager>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub reward: Amount,
    #[serde(default)]
    pub kind: RoomKind,
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Returned by create and join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomTicket {
    pub ok: bool,
    pub room_id: String,
    pub reward: Amount,
    pub status: RoomStatus,
}

impl From<&Room> for RoomTicket {
    fn from(room: &Room) -> Self {
        Self {
            ok: true,
            room_id: room.id.clone(),
            reward: room.reward,
            status: room.status,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomListQuery {
    #[serde(default)]
    pub kind: Option<RoomKind>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub name: String,
    pub reward: Amount,
    pub kind: RoomKind,
    pub seats_taken: usize,
    pub capacity: usize,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id.clone(),
            name: room.name.clone(),
            reward: room.reward,
            kind: room.kind,
            seats_taken: room.seats_taken(),
            capacity: room.capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomListResponse {
    pub ok: bool,
    pub rooms: Vec<RoomSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Room detail with the derived pool and seat counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDetailResponse {
    pub ok: bool,
    pub pool: Amount,
    pub seats_taken: usize,
    pub room: Room,
}

impl From<Room> for RoomDetailResponse {
    fn from(room: Room) -> Self {
        Self {
            ok: true,
            pool: room.pool(),
            seats_taken: room.seats_taken(),
            room,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomResultRequest {
    pub outcome: RoomOutcome,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricePushRequest {
    pub coin: String,
    pub price: Price,
    /// Defaults to the server clock
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePushResponse {
    pub ok: bool,
    pub coin: String,
    pub price: Price,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferralRequest {
    pub referrer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralSummaryResponse {
    pub ok: bool,
    pub account_id: String,
    pub referrer: Option<String>,
    pub referrals: u64,
    pub pending: Amount,
    pub claimed_total: Amount,
    /// Never decreases
    pub earned_total: Amount,
}

impl ReferralSummaryResponse {
    pub fn new(rewards: ReferralRewards, link: Option<ReferralLink>) -> Self {
        Self {
            ok: true,
            referrer: link.map(|l| l.referrer_id),
            referrals: rewards.referrals,
            pending: rewards.pending,
            claimed_total: rewards.claimed_total,
            earned_total: rewards.earned_total(),
            account_id: rewards.account_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralClaimResponse {
    pub ok: bool,
    pub claimed: Amount,
    pub balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotteryResponse {
    pub ok: bool,
    pub round: LotteryRound,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LotteryTopQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotteryTopResponse {
    pub ok: bool,
    pub round_id: String,
    pub pot: Amount,
    pub entries: Vec<LotteryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotteryEntryResponse {
    pub ok: bool,
    pub entry: LotteryEntry,
    pub pot: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LotteryScheduleRequest {
    pub ends_at: DateTime<Utc>,
}
