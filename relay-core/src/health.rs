//! Derived health state and operator alerts

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Channel health classification derived from the 0-100 score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Failed,
}

/// Snapshot of channel health, recomputed every health-check tick
///
/// Never persisted; always derived from the live connection plus counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connection_id: Option<String>,
    /// 0-100, deduction-based (latency, error rate, failovers, uptime)
    pub score: u8,
    pub status: HealthStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub failover_count: u64,
    pub uptime_pct: f64,
}

/// What tripped an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LatencyHigh,
    ConnectionLost,
    FailoverActivated,
    ErrorRateHigh,
    EndpointsExhausted,
    BackupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Operator alert raised by the health monitor
///
/// Read-only to consumers; resolved only by explicit acknowledgement so
/// flapping thresholds cannot mask a real outage.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
}

impl Alert {
    pub fn new(id: u64, kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            severity,
            message: message.into(),
            raised_at: Utc::now(),
            resolved: false,
        }
    }
}
