//! Stakeroom - Wager, Room and Ledger Engine
//!
//! Server-side engine for prediction bets on coin prices and multiplayer
//! reward rooms, with referral rewards and a lottery pot alongside. Every stake
//! moves through one ledger of reservations, every multi-entity change commits
//! as a single storage batch, and a background settlement engine applies
//! outcomes exactly once.

pub mod api;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod ledger;
pub mod locks;
pub mod lottery;
pub mod metrics;
pub mod price_feed;
pub mod referrals;
pub mod rooms;
pub mod settlement;
pub mod state_store;
pub mod storage;
pub mod wagers;

pub use common::traits::{Clock, GameResultSource, ManualClock, PriceFeed, SystemClock};
pub use common::types::{AccountId, Amount, Direction, Horizon, Price, RoomId, RoomKind, WagerId};
pub use config::StakeroomConfig;
pub use coordinator::SessionCoordinator;
pub use errors::{EngineError, EngineResult};
pub use ledger::{Account, Deposit, DepositStatus, Ledger};
pub use lottery::{LotteryBook, LotteryClose, LotteryEntry, LotteryRound, LotteryStatus};
pub use price_feed::PriceBook;
pub use referrals::{ReferralBook, ReferralClaim, ReferralLink, ReferralRewards};
pub use rooms::{CreateRoom, Room, RoomOutcome, RoomStatus};
pub use settlement::{SettlementEngine, SettlementEvent, StoredResults};
pub use storage::{open_store, KvStore, MemoryStore, RocksStore};
pub use wagers::{PlaceWager, Wager, WagerStatus};
