//! Prometheus metrics
//!
//! One registry per engine instance so tests never collide on the global
//! default registry.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    /// Coordinator operations by name and result code
    pub operations_total: IntCounterVec,
    pub retries_total: IntCounterVec,
    /// Settled wagers by final status
    pub wagers_settled_total: IntCounterVec,
    /// Settled rooms by outcome kind
    pub rooms_settled_total: IntCounterVec,
    pub sweeps_total: IntCounter,
    /// Due wagers the last sweep had to skip (window still open)
    pub wagers_waiting: IntGauge,
    pub rooms_in_progress: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("stakeroom".to_string()), None)?;

        let operations_total = IntCounterVec::new(
            Opts::new("operations_total", "Coordinator operations by result"),
            &["op", "result"],
        )?;
        let retries_total = IntCounterVec::new(
            Opts::new("retries_total", "Retries after transient storage failures"),
            &["op"],
        )?;
        let wagers_settled_total = IntCounterVec::new(
            Opts::new("wagers_settled_total", "Wagers moved to a terminal state"),
            &["status"],
        )?;
        let rooms_settled_total = IntCounterVec::new(
            Opts::new("rooms_settled_total", "Rooms settled"),
            &["outcome"],
        )?;
        let sweeps_total = IntCounter::new("settlement_sweeps_total", "Settlement sweeps run")?;
        let wagers_waiting = IntGauge::new("wagers_waiting", "Due wagers still waiting for an outcome price")?;
        let rooms_in_progress = IntGauge::new("rooms_in_progress", "Rooms in progress at the last sweep")?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(wagers_settled_total.clone()))?;
        registry.register(Box::new(rooms_settled_total.clone()))?;
        registry.register(Box::new(sweeps_total.clone()))?;
        registry.register(Box::new(wagers_waiting.clone()))?;
        registry.register(Box::new(rooms_in_progress.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            retries_total,
            wagers_settled_total,
            rooms_settled_total,
            sweeps_total,
            wagers_waiting,
            rooms_in_progress,
        })
    }

    pub fn record_operation(&self, op: &str, result: &str) {
        self.operations_total.with_label_values(&[op, result]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_namespace() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_operation("place_wager", "ok");
        metrics.sweeps_total.inc();

        let text = metrics.render();
        assert!(text.contains("stakeroom_operations_total{op=\"place_wager\",result=\"ok\"} 1"));
        assert!(text.contains("stakeroom_settlement_sweeps_total 1"));
    }
}
