//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `credit_ledger_entries_total{type}` - Ledger entries committed
//! - `credit_ledger_rejections_total{reason}` - Mutations rejected
//! - `credit_ledger_unlocks_total` - Episodes unlocked
//! - `credit_ledger_votes_total{tier}` - Votes cast
//! - `credit_ledger_reconcile_discrepancies_total` - Reconciliations that found drift
//! - `credit_ledger_commit_duration_seconds` - Transaction commit latency

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Committed entries by type
    pub entries_total: IntCounterVec,

    /// Rejected mutations by error kind
    pub rejections_total: IntCounterVec,

    /// Episodes unlocked
    pub unlocks_total: IntCounter,

    /// Votes cast by tier
    pub votes_total: IntCounterVec,

    /// Reconciliations reporting a discrepancy
    pub discrepancies_total: IntCounter,

    /// Commit latency
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounterVec::new(
            Opts::new("credit_ledger_entries_total", "Ledger entries committed"),
            &["type"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("credit_ledger_rejections_total", "Mutations rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let unlocks_total =
            IntCounter::new("credit_ledger_unlocks_total", "Episodes unlocked")?;
        registry.register(Box::new(unlocks_total.clone()))?;

        let votes_total = IntCounterVec::new(
            Opts::new("credit_ledger_votes_total", "Votes cast"),
            &["tier"],
        )?;
        registry.register(Box::new(votes_total.clone()))?;

        let discrepancies_total = IntCounter::new(
            "credit_ledger_reconcile_discrepancies_total",
            "Reconciliations that found drift",
        )?;
        registry.register(Box::new(discrepancies_total.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "credit_ledger_commit_duration_seconds",
                "Transaction commit latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            entries_total,
            rejections_total,
            unlocks_total,
            votes_total,
            discrepancies_total,
            commit_duration,
            registry,
        })
    }

    /// Record a committed entry
    pub fn record_entry(&self, entry_type: &str) {
        self.entries_total.with_label_values(&[entry_type]).inc();
    }

    /// Record a rejected mutation
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    /// Record an unlock
    pub fn record_unlock(&self) {
        self.unlocks_total.inc();
    }

    /// Record a vote
    pub fn record_vote(&self, tier: &str) {
        self.votes_total.with_label_values(&[tier]).inc();
    }

    /// Record a reconciliation discrepancy
    pub fn record_discrepancy(&self) {
        self.discrepancies_total.inc();
    }

    /// Record commit latency
    pub fn record_commit_duration(&self, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
