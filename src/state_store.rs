//! Persistent record layout
//!
//! Records are JSON under `<kind>:rec:<id>`-style keys. Secondary indexes hold
//! the entity id as value and sort by a zero-padded numeric component so plain
//! prefix scans come back in a useful order:
//!
//! - `wager:due:<deadline_secs>|<id>`: placed wagers by deadline (settlement sweep)
//! - `wager:open:<account>|<coin>|<horizon>`: one open wager per price window
//! - `wager:acct:<account>|<inverted_created_ms>|<id>`: newest-first listing
//! - `room:open:<created_ms>|<id>`: joinable rooms, oldest first
//! - `room:live:<id>`: rooms in progress awaiting a result
//! - `room:result:<id>`: durably recorded game outcome not yet applied
//! - `journal:<account>|<inverted_seq>`: newest-first ledger journal
//! - `deposit:acct:<account>|<inverted_created_ms>|<id>`: newest-first deposits
//! - `referral:by:<referrer>|<referred>`: accounts a referrer brought in
//! - `lottery:entry:<round>|<seq>`: entries in arrival order (draw order)
//! - `lottery:top:<round>|<inverted_amount>|<seq>`: entries, largest stake first

use crate::errors::{EngineError, EngineResult, StorageError};
use crate::storage::KvStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

pub const ACCOUNT_PREFIX: &str = "acct:";
pub const RESERVATION_PREFIX: &str = "resv:";
pub const JOURNAL_PREFIX: &str = "journal:";
pub const WAGER_PREFIX: &str = "wager:rec:";
pub const WAGER_OPEN_PREFIX: &str = "wager:open:";
pub const WAGER_DUE_PREFIX: &str = "wager:due:";
pub const WAGER_BY_ACCOUNT_PREFIX: &str = "wager:acct:";
pub const ROOM_PREFIX: &str = "room:rec:";
pub const ROOM_OPEN_PREFIX: &str = "room:open:";
pub const ROOM_LIVE_PREFIX: &str = "room:live:";
pub const ROOM_RESULT_PREFIX: &str = "room:result:";
pub const PRICE_PREFIX: &str = "price:";
pub const DEPOSIT_PREFIX: &str = "deposit:rec:";
pub const DEPOSIT_BY_ACCOUNT_PREFIX: &str = "deposit:acct:";
pub const REFERRAL_LINK_PREFIX: &str = "referral:link:";
pub const REFERRAL_BY_REFERRER_PREFIX: &str = "referral:by:";
pub const REFERRAL_REWARD_PREFIX: &str = "referral:reward:";
pub const LOTTERY_ROUND_PREFIX: &str = "lottery:round:";
pub const LOTTERY_CURRENT_KEY: &str = "lottery:current";
pub const LOTTERY_ENTRY_PREFIX: &str = "lottery:entry:";
pub const LOTTERY_TOP_PREFIX: &str = "lottery:top:";

pub fn account_key(account_id: &str) -> Vec<u8> {
    format!("{}{}", ACCOUNT_PREFIX, account_id).into_bytes()
}

pub fn reservation_key(reservation_id: &str) -> Vec<u8> {
    format!("{}{}", RESERVATION_PREFIX, reservation_id).into_bytes()
}

pub fn journal_prefix(account_id: &str) -> Vec<u8> {
    format!("{}{}|", JOURNAL_PREFIX, account_id).into_bytes()
}

pub fn journal_key(account_id: &str, seq: u64) -> Vec<u8> {
    format!("{}{}|{:020}", JOURNAL_PREFIX, account_id, u64::MAX - seq).into_bytes()
}

pub fn wager_key(wager_id: &str) -> Vec<u8> {
    format!("{}{}", WAGER_PREFIX, wager_id).into_bytes()
}

pub fn wager_open_key(account_id: &str, coin: &str, horizon_hours: u32) -> Vec<u8> {
    format!("{}{}|{}|{}", WAGER_OPEN_PREFIX, account_id, coin, horizon_hours).into_bytes()
}

pub fn wager_due_key(deadline: DateTime<Utc>, wager_id: &str) -> Vec<u8> {
    format!("{}{:020}|{}", WAGER_DUE_PREFIX, epoch_secs(deadline), wager_id).into_bytes()
}

pub fn wager_by_account_prefix(account_id: &str) -> Vec<u8> {
    format!("{}{}|", WAGER_BY_ACCOUNT_PREFIX, account_id).into_bytes()
}

pub fn wager_by_account_key(account_id: &str, created_at: DateTime<Utc>, wager_id: &str) -> Vec<u8> {
    format!(
        "{}{}|{:020}|{}",
        WAGER_BY_ACCOUNT_PREFIX,
        account_id,
        u64::MAX - epoch_millis(created_at),
        wager_id
    )
    .into_bytes()
}

pub fn room_key(room_id: &str) -> Vec<u8> {
    format!("{}{}", ROOM_PREFIX, room_id).into_bytes()
}

pub fn room_open_key(created_at: DateTime<Utc>, room_id: &str) -> Vec<u8> {
    format!("{}{:020}|{}", ROOM_OPEN_PREFIX, epoch_millis(created_at), room_id).into_bytes()
}

pub fn room_live_key(room_id: &str) -> Vec<u8> {
    format!("{}{}", ROOM_LIVE_PREFIX, room_id).into_bytes()
}

pub fn room_result_key(room_id: &str) -> Vec<u8> {
    format!("{}{}", ROOM_RESULT_PREFIX, room_id).into_bytes()
}

pub fn price_key(coin: &str, at: DateTime<Utc>) -> Vec<u8> {
    format!("{}{}|{:020}", PRICE_PREFIX, coin, epoch_millis(at)).into_bytes()
}

pub fn deposit_key(deposit_id: &str) -> Vec<u8> {
    format!("{}{}", DEPOSIT_PREFIX, deposit_id).into_bytes()
}

pub fn deposit_by_account_prefix(account_id: &str) -> Vec<u8> {
    format!("{}{}|", DEPOSIT_BY_ACCOUNT_PREFIX, account_id).into_bytes()
}

pub fn deposit_by_account_key(account_id: &str, created_at: DateTime<Utc>, deposit_id: &str) -> Vec<u8> {
    format!(
        "{}{}|{:020}|{}",
        DEPOSIT_BY_ACCOUNT_PREFIX,
        account_id,
        u64::MAX - epoch_millis(created_at),
        deposit_id
    )
    .into_bytes()
}

/// Who referred `referred_id`
pub fn referral_link_key(referred_id: &str) -> Vec<u8> {
    format!("{}{}", REFERRAL_LINK_PREFIX, referred_id).into_bytes()
}

pub fn referral_by_referrer_key(referrer_id: &str, referred_id: &str) -> Vec<u8> {
    format!("{}{}|{}", REFERRAL_BY_REFERRER_PREFIX, referrer_id, referred_id).into_bytes()
}

pub fn referral_reward_key(account_id: &str) -> Vec<u8> {
    format!("{}{}", REFERRAL_REWARD_PREFIX, account_id).into_bytes()
}

pub fn lottery_round_key(round_id: &str) -> Vec<u8> {
    format!("{}{}", LOTTERY_ROUND_PREFIX, round_id).into_bytes()
}

pub fn lottery_entry_prefix(round_id: &str) -> Vec<u8> {
    format!("{}{}|", LOTTERY_ENTRY_PREFIX, round_id).into_bytes()
}

pub fn lottery_entry_key(round_id: &str, seq: u64) -> Vec<u8> {
    format!("{}{}|{:020}", LOTTERY_ENTRY_PREFIX, round_id, seq).into_bytes()
}

pub fn lottery_top_prefix(round_id: &str) -> Vec<u8> {
    format!("{}{}|", LOTTERY_TOP_PREFIX, round_id).into_bytes()
}

pub fn lottery_top_key(round_id: &str, amount: u64, seq: u64) -> Vec<u8> {
    format!("{}{}|{:020}|{:020}", LOTTERY_TOP_PREFIX, round_id, u64::MAX - amount, seq).into_bytes()
}

fn epoch_secs(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or(0)
}

fn epoch_millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

/// One page of an index scan
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Hex-encoded last key, present when more rows may follow
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

/// Decode a single JSON record
pub fn load<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> EngineResult<Option<T>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };

    let value = serde_json::from_slice(&bytes).map_err(|e| {
        StorageError::Corrupted(format!(
            "Failed to decode {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
    })?;
    Ok(Some(value))
}

fn scan_raw(
    store: &dyn KvStore,
    prefix: &[u8],
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<Page<Vec<u8>>> {
    let cursor = match cursor_hex {
        Some(c) => {
            let bytes = hex::decode(c).map_err(|e| EngineError::invalid(format!("Invalid cursor: {}", e)))?;
            if !bytes.starts_with(prefix) {
                return Err(EngineError::invalid("Cursor does not belong to this listing"));
            }
            Some(bytes)
        }
        None => None,
    };

    let limit = limit.max(1);
    let rows = store.scan_prefix(prefix, cursor.as_deref(), limit)?;

    let next_cursor = if rows.len() == limit {
        rows.last().map(|(key, _)| hex::encode(key))
    } else {
        None
    };

    Ok(Page {
        items: rows.into_iter().map(|(_, value)| value).collect(),
        next_cursor,
    })
}

/// Scan an index whose values are entity ids
pub fn scan_ids(
    store: &dyn KvStore,
    prefix: &[u8],
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<Page<String>> {
    Ok(scan_raw(store, prefix, cursor_hex, limit)?.map(|value| String::from_utf8_lossy(&value).into_owned()))
}

/// Scan a range whose values are JSON records
pub fn scan_records<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &[u8],
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<Page<T>> {
    let raw = scan_raw(store, prefix, cursor_hex, limit)?;
    let mut items = Vec::with_capacity(raw.items.len());
    for value in raw.items {
        let record = serde_json::from_slice(&value)
            .map_err(|e| StorageError::Corrupted(format!("Failed to decode record: {}", e)))?;
        items.push(record);
    }
    Ok(Page {
        items,
        next_cursor: raw.next_cursor,
    })
}

/// Resolve an id index page into records, skipping ids whose record vanished
pub fn load_page<T: DeserializeOwned>(
    store: &dyn KvStore,
    ids: Page<String>,
    record_key: impl Fn(&str) -> Vec<u8>,
) -> EngineResult<Page<T>> {
    let mut items = Vec::with_capacity(ids.items.len());
    for id in &ids.items {
        match load::<T>(store, &record_key(id))? {
            Some(record) => items.push(record),
            None => tracing::warn!(id = %id, "Index entry without record"),
        }
    }
    Ok(Page {
        items,
        next_cursor: ids.next_cursor,
    })
}

/// Wager ids whose deadline is at or before `now`, oldest deadline first
///
/// Returns the last scanned key so a sweep can continue past entries it
/// decided to skip.
pub fn due_wager_ids(
    store: &dyn KvStore,
    now: DateTime<Utc>,
    start_after: Option<&[u8]>,
    limit: usize,
) -> EngineResult<(Vec<String>, Option<Vec<u8>>)> {
    let bound = wager_due_key(now, "\u{10FFFF}");
    let rows = store.scan_prefix(WAGER_DUE_PREFIX.as_bytes(), start_after, limit.max(1))?;

    let mut ids = Vec::with_capacity(rows.len());
    let mut last_key = None;
    for (key, value) in rows {
        if key > bound {
            break;
        }
        ids.push(String::from_utf8_lossy(&value).into_owned());
        last_key = Some(key);
    }
    Ok((ids, last_key))
}

/// Rooms currently in progress
pub fn live_room_ids(store: &dyn KvStore, start_after: Option<&[u8]>, limit: usize) -> EngineResult<Vec<(Vec<u8>, String)>> {
    let rows = store.scan_prefix(ROOM_LIVE_PREFIX.as_bytes(), start_after, limit.max(1))?;
    Ok(rows
        .into_iter()
        .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
        .collect())
}
