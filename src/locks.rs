//! Per-entity async locks
//!
//! One logical writer per account, room or wager. Unrelated entities never
//! contend. Lock order everywhere: the room, wager or lottery round first, then
//! accounts and referral counters in ascending key order.
//!
//! Slots live only while someone holds or waits on them; the last guard to
//! drop removes its slot, so the table is bounded by concurrent work rather
//! than by the number of entities ever touched.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

pub fn account_lock_key(account_id: &str) -> String {
    format!("acct:{}", account_id)
}

pub fn room_lock_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

pub fn wager_lock_key(wager_id: &str) -> String {
    format!("wager:{}", wager_id)
}

pub fn referral_lock_key(account_id: &str) -> String {
    format!("referral:{}", account_id)
}

pub fn lottery_lock_key(round_id: &str) -> String {
    format!("lottery:{}", round_id)
}

/// Held lock; dropping it frees the slot when nobody else wants it
pub struct EntityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<DashMap<String, Slot>>,
    key: String,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters and holders keep their own Arc, so a count of one means only
        // the table still refers to the slot
        self.table.remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Lock table keyed by entity
#[derive(Default)]
pub struct EntityLocks {
    table: Arc<DashMap<String, Slot>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Slot {
        self.table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> EntityGuard {
        let guard = self.slot(key).lock_owned().await;
        EntityGuard {
            guard: Some(guard),
            table: self.table.clone(),
            key: key.to_string(),
        }
    }

    /// Acquire several locks in sorted order; duplicates are taken once
    pub async fn lock_many<I, S>(&self, keys: I) -> Vec<EntityGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        guards
    }

    /// Lock every listed account
    pub async fn lock_accounts<'a, I>(&self, account_ids: I) -> Vec<EntityGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.lock_many(account_ids.into_iter().map(account_lock_key)).await
    }

    /// Slots currently held or awaited
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
