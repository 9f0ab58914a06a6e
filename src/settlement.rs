//! Settlement engine
//!
//! Background worker that applies outcomes once they are known:
//! - placed wagers past their deadline, priced from the feed
//! - rooms in progress whose game result has been recorded
//!
//! Storage is the source of truth. Events only shorten the wait; the periodic
//! sweep re-scans every non-terminal wager and room, so outcomes missed during
//! a restart are applied on the first sweep after start. Every settlement is
//! idempotent by entity id, so a crash between sweeps never double-pays.

use crate::common::traits::{Clock, FeedError, GameResultSource, PriceFeed};
use crate::common::types::RoomId;
use crate::config::SettlementConfig;
use crate::coordinator::SessionCoordinator;
use crate::errors::EngineResult;
use crate::rooms::{RoomBook, RoomOutcome};
use crate::state_store;
use crate::storage::KvStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wake-ups for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    /// A game result was recorded for this room
    RoomResolved(RoomId),
    /// Run a full sweep now
    Sweep,
}

/// Game results recorded through the coordinator
pub struct StoredResults {
    rooms: Arc<RoomBook>,
}

impl StoredResults {
    pub fn new(rooms: Arc<RoomBook>) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl GameResultSource for StoredResults {
    async fn resolved(&self, room_id: &RoomId) -> Result<Option<RoomOutcome>, FeedError> {
        self.rooms
            .pending_result(room_id)
            .map_err(|e| FeedError::Unavailable(e.to_string()))
    }
}

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub wagers_settled: usize,
    pub wagers_voided: usize,
    /// Due but the outcome price is not in yet
    pub wagers_waiting: usize,
    pub rooms_settled: usize,
    pub rooms_waiting: usize,
    pub failures: usize,
}

pub struct SettlementEngine {
    coordinator: Arc<SessionCoordinator>,
    feed: Arc<dyn PriceFeed>,
    results: Arc<dyn GameResultSource>,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl SettlementEngine {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        feed: Arc<dyn PriceFeed>,
        results: Arc<dyn GameResultSource>,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            coordinator,
            feed,
            results,
            clock,
            config,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn store(&self) -> &dyn KvStore {
        self.coordinator.ledger().store()
    }

    /// Start the worker: a recovery sweep first, then ticks and events
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SettlementEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let recovered = self.sweep_once().await;
            info!(
                wagers_settled = recovered.wagers_settled,
                wagers_voided = recovered.wagers_voided,
                rooms_settled = recovered.rooms_settled,
                "🔁 Settlement recovery sweep complete"
            );

            let mut tick = tokio::time::interval(Duration::from_millis(self.config.scan_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut events_open = true;

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.shutdown.notified() => break,
                    _ = tick.tick() => {
                        let report = self.sweep_once().await;
                        if report != SweepReport::default() {
                            debug!(?report, "Settlement sweep");
                        }
                    }
                    event = events.recv(), if events_open => {
                        match event {
                            Some(SettlementEvent::RoomResolved(room_id)) => {
                                let mut report = SweepReport::default();
                                self.settle_room_if_resolved(&room_id, &mut report).await;
                            }
                            Some(SettlementEvent::Sweep) => {
                                self.sweep_once().await;
                            }
                            // Senders gone; keep sweeping on the timer
                            None => events_open = false,
                        }
                    }
                }
            }

            info!("🛑 Settlement engine stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Settle everything that is due right now
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        if let Err(e) = self.sweep_wagers(now, &mut report).await {
            warn!("Wager sweep aborted: {}", e);
            report.failures += 1;
        }
        if let Err(e) = self.sweep_rooms(&mut report).await {
            warn!("Room sweep aborted: {}", e);
            report.failures += 1;
        }

        let metrics = self.coordinator.metrics();
        metrics.sweeps_total.inc();
        metrics.wagers_waiting.set(report.wagers_waiting as i64);
        metrics
            .rooms_in_progress
            .set((report.rooms_waiting + report.rooms_settled) as i64);
        report
    }

    async fn sweep_wagers(&self, now: DateTime<Utc>, report: &mut SweepReport) -> EngineResult<()> {
        let limit = self.config.batch_limit.max(1);
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let (ids, last_key) = state_store::due_wager_ids(self.store(), now, cursor.as_deref(), limit)?;
            let exhausted = ids.len() < limit;
            for wager_id in ids {
                self.settle_due_wager(&wager_id, now, report).await;
            }
            match last_key {
                Some(key) if !exhausted => cursor = Some(key),
                _ => break,
            }
        }
        Ok(())
    }

    async fn settle_due_wager(&self, wager_id: &str, now: DateTime<Utc>, report: &mut SweepReport) {
        let wager = match self.coordinator.wagers().get(wager_id) {
            Ok(wager) => wager,
            Err(e) => {
                warn!(wager_id = %wager_id, "Due wager could not be loaded: {}", e);
                report.failures += 1;
                return;
            }
        };
        if wager.status.is_terminal() {
            return;
        }

        let overdue = now - wager.deadline >= ChronoDuration::seconds(self.config.void_after_secs);
        let void_reason = match self.feed.price_at(&wager.subject.coin, wager.deadline).await {
            Ok(Some(price)) => {
                match self.coordinator.settle_wager(wager_id, price).await {
                    Ok(_) => report.wagers_settled += 1,
                    Err(e) => {
                        warn!(wager_id = %wager_id, "Wager settlement failed: {}", e);
                        report.failures += 1;
                    }
                }
                return;
            }
            Ok(None) if overdue => format!("no {} price for the window after {}s", wager.subject.coin, self.config.void_after_secs),
            Ok(None) => {
                report.wagers_waiting += 1;
                return;
            }
            Err(FeedError::UnknownCoin(coin)) => format!("{} is not quoted by the price feed", coin),
            Err(FeedError::Unavailable(msg)) if overdue => format!("price feed unavailable: {}", msg),
            Err(FeedError::Unavailable(msg)) => {
                debug!(wager_id = %wager_id, "Price feed unavailable: {}", msg);
                report.wagers_waiting += 1;
                return;
            }
        };

        match self.coordinator.void_wager(wager_id, &void_reason).await {
            Ok(_) => {
                warn!(wager_id = %wager_id, reason = %void_reason, "Wager voided");
                report.wagers_voided += 1;
            }
            Err(e) => {
                warn!(wager_id = %wager_id, "Wager void failed: {}", e);
                report.failures += 1;
            }
        }
    }

    async fn sweep_rooms(&self, report: &mut SweepReport) -> EngineResult<()> {
        let limit = self.config.batch_limit.max(1);
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let rows = state_store::live_room_ids(self.store(), cursor.as_deref(), limit)?;
            let exhausted = rows.len() < limit;
            let mut last_key = None;
            for (key, room_id) in rows {
                self.settle_room_if_resolved(&room_id, report).await;
                last_key = Some(key);
            }
            match last_key {
                Some(key) if !exhausted => cursor = Some(key),
                _ => break,
            }
        }
        Ok(())
    }

    async fn settle_room_if_resolved(&self, room_id: &RoomId, report: &mut SweepReport) {
        match self.results.resolved(room_id).await {
            Ok(Some(outcome)) => match self.coordinator.settle_room(room_id, outcome).await {
                Ok(_) => report.rooms_settled += 1,
                Err(e) => {
                    warn!(room_id = %room_id, "Room settlement failed: {}", e);
                    report.failures += 1;
                }
            },
            Ok(None) => report.rooms_waiting += 1,
            Err(e) => {
                debug!(room_id = %room_id, "Game result source unavailable: {}", e);
                report.rooms_waiting += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::ManualClock;
    use crate::common::types::Direction;
    use crate::config::StakeroomConfig;
    use crate::metrics::EngineMetrics;
    use crate::price_feed::PriceBook;
    use crate::rooms::{CreateRoom, RoomStatus};
    use crate::storage::MemoryStore;
    use crate::wagers::WagerStatus;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        feed: Arc<PriceBook>,
        coordinator: Arc<SessionCoordinator>,
        engine: Arc<SettlementEngine>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture(tx: Option<mpsc::UnboundedSender<SettlementEvent>>) -> Fixture {
        let config = StakeroomConfig::in_memory();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = Arc::new(PriceBook::new());
        let mut coordinator = SessionCoordinator::new(
            store,
            feed.clone(),
            clock.clone(),
            &config,
            Arc::new(EngineMetrics::new().unwrap()),
        );
        if let Some(tx) = tx {
            coordinator = coordinator.with_settlement_events(tx);
        }
        let coordinator = Arc::new(coordinator);
        let engine = Arc::new(SettlementEngine::new(
            coordinator.clone(),
            feed.clone(),
            Arc::new(StoredResults::new(coordinator.rooms().clone())),
            clock.clone(),
            config.settlement,
        ));
        Fixture {
            clock,
            feed,
            coordinator,
            engine,
        }
    }

    #[tokio::test]
    async fn test_waits_for_window_then_settles() {
        let f = fixture(None);
        f.feed.push("BTC", 100, t0()).unwrap();
        f.coordinator.open_account("alice", 100).await.unwrap();
        let wager = f
            .coordinator
            .place_prediction("alice", 40, "BTC", 6, Direction::Up)
            .await
            .unwrap();

        assert_eq!(f.engine.sweep_once().await, SweepReport::default());

        f.clock.advance(ChronoDuration::hours(6));
        let report = f.engine.sweep_once().await;
        assert_eq!(report.wagers_waiting, 1);

        f.feed.push("BTC", 110, t0() + ChronoDuration::hours(6)).unwrap();
        let report = f.engine.sweep_once().await;
        assert_eq!(report.wagers_settled, 1);

        let wager = f.coordinator.wager(&wager.id).await.unwrap();
        assert_eq!(wager.status, WagerStatus::Won);
        assert_eq!(f.coordinator.balance("alice").await.unwrap().balance, 140);

        // Index entry is gone, so a second sweep finds nothing
        assert_eq!(f.engine.sweep_once().await.wagers_settled, 0);
    }

    #[tokio::test]
    async fn test_starved_wager_is_voided() {
        let f = fixture(None);
        f.feed.push("ETH", 100, t0()).unwrap();
        f.coordinator.open_account("alice", 100).await.unwrap();
        let wager = f
            .coordinator
            .place_prediction("alice", 30, "ETH", 6, Direction::Down)
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::hours(6) + ChronoDuration::days(1));
        let report = f.engine.sweep_once().await;
        assert_eq!(report.wagers_voided, 1);

        let wager = f.coordinator.wager(&wager.id).await.unwrap();
        assert_eq!(wager.status, WagerStatus::Voided);
        assert_eq!(f.coordinator.balance("alice").await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_recorded_room_result_is_applied_by_worker() {
        let (tx, rx) = mpsc::unbounded_channel();
        let f = fixture(Some(tx));
        f.coordinator.open_account("host", 100).await.unwrap();
        f.coordinator.open_account("guest", 100).await.unwrap();

        let room = f
            .coordinator
            .create_room(&CreateRoom {
                host_id: "host".to_string(),
                name: "table".to_string(),
                reward: 50,
                kind: Default::default(),
                capacity: None,
            })
            .await
            .unwrap();
        f.coordinator.join_room(&room.id, "guest").await.unwrap();

        let handle = f.engine.clone().spawn(rx);
        f.coordinator
            .record_room_result(&room.id, RoomOutcome::Winner("host".to_string()))
            .await
            .unwrap();

        let mut settled = false;
        for _ in 0..100 {
            if f.coordinator.room(&room.id).await.unwrap().status == RoomStatus::Settled {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);
        assert_eq!(f.coordinator.balance("host").await.unwrap().balance, 150);
        assert_eq!(f.coordinator.balance("guest").await.unwrap().balance, 50);

        f.engine.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
