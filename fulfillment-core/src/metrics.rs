//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the fulfillment ledger. Every
//! [`Metrics`] owns its registry, so several ledgers can live in one
//! process.
//!
//! # Metrics
//!
//! - `fulfillment_requisitions_total` - Requisitions created
//! - `fulfillment_deliveries_total` - Delivery writes (create, update, delete)
//! - `fulfillment_reconciliations_total` - Reconciliation passes committed
//! - `fulfillment_status_transitions_total` - Automatic status events appended
//! - `fulfillment_conflicts_total` - Reconciliations refused by a manual hold
//! - `fulfillment_incomplete_records_total` - Deliveries with broken ownership chains
//! - `fulfillment_statistics_duration_seconds` - Histogram of aggregation latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Requisitions created
    pub requisitions_total: IntCounter,

    /// Delivery writes
    pub deliveries_total: IntCounter,

    /// Reconciliations committed
    pub reconciliations_total: IntCounter,

    /// Automatic status transitions
    pub status_transitions_total: IntCounter,

    /// Hold conflicts
    pub conflicts_total: IntCounter,

    /// Incomplete records seen by the aggregator
    pub incomplete_records_total: IntCounter,

    /// Aggregation duration histogram
    pub statistics_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requisitions_total =
            counter("fulfillment_requisitions_total", "Requisitions created")?;
        let deliveries_total = counter(
            "fulfillment_deliveries_total",
            "Delivery writes (create, update, delete)",
        )?;
        let reconciliations_total = counter(
            "fulfillment_reconciliations_total",
            "Reconciliation passes committed",
        )?;
        let status_transitions_total = counter(
            "fulfillment_status_transitions_total",
            "Automatic status events appended",
        )?;
        let conflicts_total = counter(
            "fulfillment_conflicts_total",
            "Reconciliations refused by a manual hold",
        )?;
        let incomplete_records_total = counter(
            "fulfillment_incomplete_records_total",
            "Deliveries with broken ownership chains",
        )?;

        let statistics_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fulfillment_statistics_duration_seconds",
                "Histogram of aggregation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(statistics_duration.clone()))?;

        Ok(Self {
            requisitions_total,
            deliveries_total,
            reconciliations_total,
            status_transitions_total,
            conflicts_total,
            incomplete_records_total,
            statistics_duration,
            registry,
        })
    }

    /// Record requisition creation
    pub fn record_requisition(&self) {
        self.requisitions_total.inc();
    }

    /// Record delivery write
    pub fn record_delivery(&self) {
        self.deliveries_total.inc();
    }

    /// Record committed reconciliation
    pub fn record_reconciliation(&self, transitioned: bool) {
        self.reconciliations_total.inc();
        if transitioned {
            self.status_transitions_total.inc();
        }
    }

    /// Record hold conflict
    pub fn record_conflict(&self) {
        self.conflicts_total.inc();
    }

    /// Record aggregation run
    pub fn record_statistics(&self, duration_seconds: f64, incomplete: usize) {
        self.statistics_duration.observe(duration_seconds);
        self.incomplete_records_total.inc_by(incomplete as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.requisitions_total.get(), 0);
        assert_eq!(metrics.registry().gather().len(), 7);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_requisition();
        assert_eq!(first.requisitions_total.get(), 1);
        assert_eq!(second.requisitions_total.get(), 0);
    }

    #[test]
    fn test_record_reconciliation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconciliation(false);
        metrics.record_reconciliation(true);
        assert_eq!(metrics.reconciliations_total.get(), 2);
        assert_eq!(metrics.status_transitions_total.get(), 1);
    }

    #[test]
    fn test_record_statistics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_statistics(0.002, 3);
        assert_eq!(metrics.incomplete_records_total.get(), 3);
        assert_eq!(metrics.statistics_duration.get_sample_count(), 1);
    }
}
