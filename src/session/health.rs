//! Connection health tracking
//!
//! Each live session carries a tracker fed by the heartbeat monitor's
//! probes. The derived status and metrics are read-only observables for
//! the UI layer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Probes answered with good response times
    Healthy,
    /// High latency or probe loss
    Degraded,
    /// No probe response for too long
    Unresponsive,
    /// Session is not live
    Disconnected,
    /// Not enough data
    #[default]
    Unknown,
}

/// Health metrics for a live session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub status: HealthStatus,
    /// Latest probe latency (ms)
    pub latency_ms: Option<u64>,
    /// Average over recent samples (ms)
    pub avg_latency_ms: Option<u64>,
    /// Probe loss percentage (0-100)
    pub probe_loss_percent: u8,
    /// Time since last successful probe response (ms)
    pub last_response_ago_ms: Option<u64>,
    pub probes_sent: u64,
    pub probes_received: u64,
    pub uptime_secs: u64,
}

/// Thresholds for health evaluation
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub degraded_latency_ms: u64,
    pub unresponsive_latency_ms: u64,
    pub degraded_loss_percent: u8,
    pub unresponsive_timeout_ms: u64,
    pub latency_sample_count: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_latency_ms: 200,
            unresponsive_latency_ms: 2000,
            degraded_loss_percent: 5,
            unresponsive_timeout_ms: 60_000,
            latency_sample_count: 10,
        }
    }
}

/// Tracks probe traffic for one session
pub struct HealthTracker {
    connected_at: Instant,
    last_response: RwLock<Option<Instant>>,
    latency_samples: RwLock<Vec<u64>>,
    probes_sent: AtomicU64,
    probes_received: AtomicU64,
    thresholds: HealthThresholds,
    active: AtomicBool,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            connected_at: Instant::now(),
            last_response: RwLock::new(Some(Instant::now())),
            latency_samples: RwLock::new(Vec::new()),
            probes_sent: AtomicU64::new(0),
            probes_received: AtomicU64::new(0),
            thresholds,
            active: AtomicBool::new(true),
        }
    }

    pub fn record_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_probe_response(&self, latency_ms: u64) {
        self.probes_received.fetch_add(1, Ordering::SeqCst);
        *self.last_response.write() = Some(Instant::now());

        let mut samples = self.latency_samples.write();
        if samples.len() >= self.thresholds.latency_sample_count {
            samples.remove(0);
        }
        samples.push(latency_ms);
    }

    /// Mark tracker inactive (session left Connected/Ready)
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> HealthMetrics {
        let last_response = *self.last_response.read();
        let samples = self.latency_samples.read();

        let probes_sent = self.probes_sent.load(Ordering::SeqCst);
        let probes_received = self.probes_received.load(Ordering::SeqCst);

        let probe_loss_percent = if probes_sent > 0 {
            ((probes_sent - probes_received) * 100 / probes_sent) as u8
        } else {
            0
        };

        let avg_latency_ms = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<u64>() / samples.len() as u64)
        };
        let latency_ms = samples.last().copied();
        let last_response_ago_ms = last_response.map(|t| t.elapsed().as_millis() as u64);

        let status = self.evaluate(latency_ms, probe_loss_percent, last_response_ago_ms);

        HealthMetrics {
            status,
            latency_ms,
            avg_latency_ms,
            probe_loss_percent,
            last_response_ago_ms,
            probes_sent,
            probes_received,
            uptime_secs: self.connected_at.elapsed().as_secs(),
        }
    }

    fn evaluate(
        &self,
        latency_ms: Option<u64>,
        probe_loss_percent: u8,
        last_response_ago_ms: Option<u64>,
    ) -> HealthStatus {
        if !self.is_active() {
            return HealthStatus::Disconnected;
        }

        if let Some(ago) = last_response_ago_ms {
            if ago > self.thresholds.unresponsive_timeout_ms {
                return HealthStatus::Unresponsive;
            }
        }

        if let Some(latency) = latency_ms {
            if latency > self.thresholds.unresponsive_latency_ms {
                return HealthStatus::Unresponsive;
            }
            if latency > self.thresholds.degraded_latency_ms {
                return HealthStatus::Degraded;
            }
        }

        if probe_loss_percent > self.thresholds.degraded_loss_percent {
            return HealthStatus::Degraded;
        }

        if latency_ms.is_some() {
            return HealthStatus::Healthy;
        }

        HealthStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_after_fast_probe() {
        let tracker = HealthTracker::default();
        tracker.record_probe_sent();
        tracker.record_probe_response(50);

        let metrics = tracker.metrics();
        assert_eq!(metrics.probes_sent, 1);
        assert_eq!(metrics.probes_received, 1);
        assert_eq!(metrics.latency_ms, Some(50));
        assert_eq!(metrics.status, HealthStatus::Healthy);
    }

    #[test]
    fn high_latency_degrades() {
        let tracker = HealthTracker::default();
        tracker.record_probe_sent();
        tracker.record_probe_response(500);

        assert_eq!(tracker.metrics().status, HealthStatus::Degraded);
    }

    #[test]
    fn probe_loss_degrades() {
        let tracker = HealthTracker::default();
        for _ in 0..10 {
            tracker.record_probe_sent();
        }
        for _ in 0..8 {
            tracker.record_probe_response(50);
        }

        let metrics = tracker.metrics();
        assert_eq!(metrics.probe_loss_percent, 20);
        assert_eq!(metrics.status, HealthStatus::Degraded);
    }

    #[test]
    fn deactivated_tracker_reports_disconnected() {
        let tracker = HealthTracker::default();
        tracker.record_probe_sent();
        tracker.record_probe_response(10);
        tracker.deactivate();

        assert_eq!(tracker.metrics().status, HealthStatus::Disconnected);
    }
}
