//! Gateway counters.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::DenialKind;

#[derive(Default)]
pub struct McpMetrics {
    calls_received: AtomicU64,
    calls_completed: AtomicU64,
    execution_failures: AtomicU64,
    denials_abort: AtomicU64,
    denials_continue: AtomicU64,
    turn_rejections: AtomicU64,

    approvals_requested: AtomicU64,
    approvals_approved: AtomicU64,
    approvals_denied: AtomicU64,
    approvals_timed_out: AtomicU64,

    mounts_attached: AtomicU64,
    mounts_detached: AtomicU64,
    attach_failures: AtomicU64,

    notifications_forwarded: AtomicU64,

    // Keyed by routed tool name.
    tool_latencies: DashMap<String, LatencyStats>,
}

impl McpMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call_received(&self) {
        self.calls_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A call that reached the downstream server, successful or not.
    pub fn record_execution(&self, tool: &str, success: bool, duration_ms: u64) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.execution_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.tool_latencies
            .entry(tool.to_string())
            .or_default()
            .record(duration_ms);
    }

    pub fn record_denial(&self, kind: DenialKind) {
        match kind {
            DenialKind::Abort => self.denials_abort.fetch_add(1, Ordering::Relaxed),
            DenialKind::Continue => self.denials_continue.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A call refused because its turn had already been aborted.
    pub fn record_turn_rejection(&self) {
        self.turn_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_requested(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_approved(&self) {
        self.approvals_approved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_denied(&self) {
        self.approvals_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_timed_out(&self) {
        self.approvals_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mount_attached(&self) {
        self.mounts_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mount_detached(&self) {
        self.mounts_detached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach_failure(&self) {
        self.attach_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_forwarded(&self) {
        self.notifications_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let attached = load(&self.mounts_attached);
        let detached = load(&self.mounts_detached);
        MetricsSnapshot {
            calls_received: load(&self.calls_received),
            calls_completed: load(&self.calls_completed),
            execution_failures: load(&self.execution_failures),
            denials_abort: load(&self.denials_abort),
            denials_continue: load(&self.denials_continue),
            turn_rejections: load(&self.turn_rejections),
            approvals_requested: load(&self.approvals_requested),
            approvals_approved: load(&self.approvals_approved),
            approvals_denied: load(&self.approvals_denied),
            approvals_timed_out: load(&self.approvals_timed_out),
            mounts_attached: attached,
            mounts_detached: detached,
            mounts_active: attached.saturating_sub(detached),
            attach_failures: load(&self.attach_failures),
            notifications_forwarded: load(&self.notifications_forwarded),
            notifications_delivered: 0,
            notifications_failed: 0,
        }
    }

    pub fn tool_latency(&self, tool: &str) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool).map(|stats| stats.snapshot())
    }

    /// Sorted by tool name.
    pub fn all_tool_latencies(&self) -> Vec<(String, LatencySnapshot)> {
        let mut all: Vec<_> = self
            .tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }
}

impl LatencyStats {
    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            avg_ms: self
                .total_ms
                .load(Ordering::Relaxed)
                .checked_div(count)
                .unwrap_or(0),
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
///
/// Notification delivery counts live in the subscription registry and are
/// filled in by the gateway.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub calls_received: u64,
    pub calls_completed: u64,
    pub execution_failures: u64,
    pub denials_abort: u64,
    pub denials_continue: u64,
    pub turn_rejections: u64,
    pub approvals_requested: u64,
    pub approvals_approved: u64,
    pub approvals_denied: u64,
    pub approvals_timed_out: u64,
    pub mounts_attached: u64,
    pub mounts_detached: u64,
    pub mounts_active: u64,
    pub attach_failures: u64,
    pub notifications_forwarded: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
}

impl MetricsSnapshot {
    /// Percentage of executed calls that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.calls_completed == 0 {
            100.0
        } else {
            let ok = self.calls_completed - self.execution_failures;
            (ok as f64 / self.calls_completed as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}
