//! Oracle price book
//!
//! Prices are pushed in by an operator or oracle relay and kept per coin in
//! time order. A window is only considered closed once a sample at or after
//! its deadline has arrived, so settlement never runs on a stale quote.

use crate::common::traits::{FeedError, PriceFeed};
use crate::common::types::{normalize_coin, Price, PriceSample};
use crate::errors::{EngineError, EngineResult};
use crate::state_store;
use crate::storage::{BatchOp, KvStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const LOAD_PAGE: usize = 1024;

#[derive(Default)]
pub struct PriceBook {
    series: DashMap<String, BTreeMap<DateTime<Utc>, Price>>,
    store: Option<Arc<dyn KvStore>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Price book that persists every sample and reloads them on start
    pub fn persistent(store: Arc<dyn KvStore>) -> EngineResult<Self> {
        let book = Self {
            series: DashMap::new(),
            store: Some(store.clone()),
        };

        let prefix = state_store::PRICE_PREFIX.as_bytes();
        let mut start_after: Option<Vec<u8>> = None;
        let mut loaded = 0usize;
        loop {
            let rows = store.scan_prefix(prefix, start_after.as_deref(), LOAD_PAGE)?;
            let done = rows.len() < LOAD_PAGE;
            for (key, value) in rows {
                let sample: PriceSample = serde_json::from_slice(&value)
                    .map_err(|e| crate::errors::StorageError::Corrupted(format!("price sample: {}", e)))?;
                book.insert(sample);
                loaded += 1;
                start_after = Some(key);
            }
            if done {
                break;
            }
        }

        info!(samples = loaded, coins = book.series.len(), "Price book loaded");
        Ok(book)
    }

    fn insert(&self, sample: PriceSample) {
        self.series.entry(sample.coin).or_default().insert(sample.at, sample.price);
    }

    pub fn push(&self, coin: &str, price: Price, at: DateTime<Utc>) -> EngineResult<PriceSample> {
        if price == 0 {
            return Err(EngineError::invalid("price must be positive"));
        }
        let sample = PriceSample {
            coin: normalize_coin(coin)?,
            price,
            at,
        };

        if let Some(store) = &self.store {
            let bytes = serde_json::to_vec(&sample)
                .map_err(|e| crate::errors::StorageError::Corrupted(format!("price sample: {}", e)))?;
            store.write(vec![BatchOp::Put(state_store::price_key(&sample.coin, at), bytes)])?;
        }

        debug!(coin = %sample.coin, price, at = %at, "Price sample recorded");
        self.insert(sample.clone());
        Ok(sample)
    }

    pub fn latest(&self, coin: &str) -> Option<PriceSample> {
        let coin = normalize_coin(coin).ok()?;
        let series = self.series.get(&coin)?;
        series.iter().next_back().map(|(at, price)| PriceSample {
            coin: coin.clone(),
            price: *price,
            at: *at,
        })
    }

    pub fn coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        coins.sort();
        coins
    }

    fn lookup(&self, coin: &str, at: DateTime<Utc>, require_closed: bool) -> Result<Option<Price>, FeedError> {
        let key = normalize_coin(coin).map_err(|_| FeedError::UnknownCoin(coin.to_string()))?;
        let series = self
            .series
            .get(&key)
            .ok_or_else(|| FeedError::UnknownCoin(key.clone()))?;

        if require_closed && series.range(at..).next().is_none() {
            return Ok(None);
        }

        let in_effect = series.range(..=at).next_back().map(|(_, price)| *price);
        match in_effect {
            Some(price) => Ok(Some(price)),
            // First quote came after `at`; the earliest known price is the best reference
            None if require_closed => Ok(series.range(at..).next().map(|(_, price)| *price)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PriceFeed for PriceBook {
    async fn spot(&self, coin: &str, at: DateTime<Utc>) -> Result<Option<Price>, FeedError> {
        self.lookup(coin, at, false)
    }

    async fn price_at(&self, coin: &str, at: DateTime<Utc>) -> Result<Option<Price>, FeedError> {
        self.lookup(coin, at, true)
    }
}
