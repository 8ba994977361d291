//! Health monitoring for the active connection
//!
//! Turns raw transport events into a single 0-100 health score and
//! operator alerts, independent of which transport kind is active.
//! Counters are atomics so snapshots never block the io path; all
//! time-dependent methods take an explicit `now_ms` so the scoring and
//! failover logic is testable without a clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use relay_core::{Alert, AlertKind, AlertSeverity, HealthSnapshot, HealthStatus};

/// Score deduction thresholds
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub warn_latency_ms: u64,
    pub critical_latency_ms: u64,
    pub warn_error_rate: f64,
    pub critical_error_rate: f64,
    pub warn_uptime: f64,
    pub critical_uptime: f64,
    /// Consecutive stable time after which failover deductions decay
    pub stability_window_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warn_latency_ms: 1_000,
            critical_latency_ms: 5_000,
            warn_error_rate: 0.05,
            critical_error_rate: 0.15,
            warn_uptime: 0.95,
            critical_uptime: 0.90,
            stability_window_ms: 120_000,
        }
    }
}

/// Inputs to the pure score computation
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub latency_ms: u64,
    pub error_rate: f64,
    pub recent_failovers: u64,
    pub uptime_pct: f64,
}

/// Score starts at 100 and only deducts, floored at 0
pub fn compute_score(inputs: &ScoreInputs, thresholds: &HealthThresholds) -> u8 {
    let mut score: i64 = 100;

    if inputs.latency_ms > thresholds.critical_latency_ms {
        score -= 30;
    } else if inputs.latency_ms > thresholds.warn_latency_ms {
        score -= 15;
    }

    if inputs.error_rate > thresholds.critical_error_rate {
        score -= 25;
    } else if inputs.error_rate > thresholds.warn_error_rate {
        score -= 10;
    }

    score -= 5 * inputs.recent_failovers as i64;

    if inputs.uptime_pct < thresholds.critical_uptime {
        score -= 20;
    } else if inputs.uptime_pct < thresholds.warn_uptime {
        score -= 10;
    }

    score.clamp(0, 100) as u8
}

/// Health-check tick outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// No pong within the failover threshold; the coordinator must switch
    FailoverNeeded,
}

/// Health monitor for the logical channel
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    failover_threshold_ms: u64,

    connected: AtomicBool,
    channel_failed: AtomicBool,
    endpoint: RwLock<Option<String>>,

    latency_ms: AtomicU64,
    message_count: AtomicU64,
    error_count: AtomicU64,
    failover_count: AtomicU64,
    recent_failovers: AtomicU64,

    last_ping_ms: AtomicI64,
    awaiting_pong: AtomicBool,
    failover_pending: AtomicBool,
    stable_since_ms: AtomicI64,

    observed: AtomicBool,
    window_start_ms: i64,
    connected_since_ms: AtomicI64,
    /// Closed connected spans inside the rolling uptime window
    sessions: Mutex<VecDeque<(i64, i64)>>,

    alerts: Mutex<Vec<Alert>>,
    latched: Mutex<HashMap<AlertKind, u64>>,
    alert_seq: AtomicU64,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, failover_threshold_ms: u64, now_ms: i64) -> Self {
        Self {
            thresholds,
            failover_threshold_ms,
            connected: AtomicBool::new(false),
            channel_failed: AtomicBool::new(false),
            endpoint: RwLock::new(None),
            latency_ms: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            failover_count: AtomicU64::new(0),
            recent_failovers: AtomicU64::new(0),
            last_ping_ms: AtomicI64::new(0),
            awaiting_pong: AtomicBool::new(false),
            failover_pending: AtomicBool::new(false),
            stable_since_ms: AtomicI64::new(0),
            observed: AtomicBool::new(false),
            window_start_ms: now_ms,
            connected_since_ms: AtomicI64::new(0),
            sessions: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(Vec::new()),
            latched: Mutex::new(HashMap::new()),
            alert_seq: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------
    // Event intake
    // ------------------------------------------------------------------

    /// A connection scan has begun; snapshots are meaningful from here on
    pub fn record_attempt(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    pub fn observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn record_connected(&self, now_ms: i64, endpoint_id: &str) {
        // Re-connect without an intervening disconnect: bank the elapsed
        // uptime before restarting the session clock
        if self.connected.load(Ordering::SeqCst) {
            let since = self.connected_since_ms.load(Ordering::SeqCst);
            if since > 0 && now_ms > since {
                self.bank_session(since, now_ms);
            }
        }
        self.observed.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.channel_failed.store(false, Ordering::SeqCst);
        *self.endpoint.write() = Some(endpoint_id.to_string());
        self.connected_since_ms.store(now_ms, Ordering::SeqCst);
        self.stable_since_ms.store(now_ms, Ordering::SeqCst);
        self.awaiting_pong.store(false, Ordering::SeqCst);
        self.failover_pending.store(false, Ordering::SeqCst);
    }

    pub fn record_disconnected(&self, now_ms: i64) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let since = self.connected_since_ms.swap(0, Ordering::SeqCst);
            if since > 0 && now_ms > since {
                self.bank_session(since, now_ms);
            }
        }
        *self.endpoint.write() = None;
        self.stable_since_ms.store(0, Ordering::SeqCst);
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }

    /// A heartbeat ping went out; only the first unanswered ping arms the
    /// timeout clock
    pub fn record_ping(&self, now_ms: i64) {
        if !self.awaiting_pong.swap(true, Ordering::SeqCst) {
            self.last_ping_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    pub fn record_pong(&self, _now_ms: i64, latency_ms: u64) {
        self.awaiting_pong.store(false, Ordering::SeqCst);
        self.failover_pending.store(false, Ordering::SeqCst);
        self.latency_ms.store(latency_ms, Ordering::SeqCst);
    }

    pub fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self, now_ms: i64) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        // An error interrupts the stability window
        self.stable_since_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn record_failover(&self, _now_ms: i64) {
        self.failover_count.fetch_add(1, Ordering::SeqCst);
        self.recent_failovers.fetch_add(1, Ordering::SeqCst);
        self.failover_pending.store(false, Ordering::SeqCst);
        self.stable_since_ms.store(0, Ordering::SeqCst);
    }

    /// Terminal state: every primary and backup path is gone
    pub fn set_channel_failed(&self, failed: bool) {
        self.channel_failed.store(failed, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Health-check tick: decays failover deductions, checks the
    /// heartbeat deadline, and raises threshold alerts.
    ///
    /// The failover verdict fires at most once per unanswered ping: it
    /// requires a live connected link with a ping actually outstanding,
    /// which keeps transient no-link states (mid-failover reads) from
    /// producing false positives.
    pub fn evaluate(&self, now_ms: i64) -> (Verdict, Vec<Alert>) {
        let mut raised = Vec::new();

        // Decay failover deductions once the channel has been stable long
        // enough
        let stable_since = self.stable_since_ms.load(Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst)
            && stable_since > 0
            && now_ms - stable_since >= self.thresholds.stability_window_ms as i64
        {
            self.recent_failovers.store(0, Ordering::SeqCst);
        }

        // Threshold alerts (latched until explicitly resolved)
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > self.thresholds.critical_latency_ms {
            raised.extend(self.raise_alert(
                AlertKind::LatencyHigh,
                AlertSeverity::Critical,
                format!("round-trip latency {latency}ms"),
            ));
        } else if latency > self.thresholds.warn_latency_ms {
            raised.extend(self.raise_alert(
                AlertKind::LatencyHigh,
                AlertSeverity::Warning,
                format!("round-trip latency {latency}ms"),
            ));
        }

        let error_rate = self.error_rate();
        if error_rate > self.thresholds.critical_error_rate {
            raised.extend(self.raise_alert(
                AlertKind::ErrorRateHigh,
                AlertSeverity::Critical,
                format!("error rate {:.1}%", error_rate * 100.0),
            ));
        } else if error_rate > self.thresholds.warn_error_rate {
            raised.extend(self.raise_alert(
                AlertKind::ErrorRateHigh,
                AlertSeverity::Warning,
                format!("error rate {:.1}%", error_rate * 100.0),
            ));
        }

        // Heartbeat deadline
        let verdict = if self.connected.load(Ordering::SeqCst)
            && self.awaiting_pong.load(Ordering::SeqCst)
            && !self.failover_pending.load(Ordering::SeqCst)
        {
            let last_ping = self.last_ping_ms.load(Ordering::SeqCst);
            if last_ping > 0 && now_ms - last_ping > self.failover_threshold_ms as i64 {
                self.failover_pending.store(true, Ordering::SeqCst);
                Verdict::FailoverNeeded
            } else {
                Verdict::Ok
            }
        } else {
            Verdict::Ok
        };

        (verdict, raised)
    }

    /// Derived snapshot; never persisted
    pub fn snapshot(&self, now_ms: i64) -> HealthSnapshot {
        let connected = self.connected.load(Ordering::SeqCst);
        let inputs = ScoreInputs {
            latency_ms: self.latency_ms.load(Ordering::SeqCst),
            error_rate: self.error_rate(),
            recent_failovers: self.recent_failovers.load(Ordering::SeqCst),
            uptime_pct: self.uptime_pct(now_ms),
        };
        let score = compute_score(&inputs, &self.thresholds);
        let status = if self.channel_failed.load(Ordering::SeqCst) || score == 0 {
            HealthStatus::Failed
        } else if !connected {
            HealthStatus::Critical
        } else if score >= 80 {
            HealthStatus::Healthy
        } else if score >= 50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        HealthSnapshot {
            connection_id: self.endpoint.read().clone(),
            score,
            status,
            message_count: self.message_count.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
            failover_count: self.failover_count.load(Ordering::SeqCst),
            uptime_pct: inputs.uptime_pct,
        }
    }

    pub fn error_rate(&self) -> f64 {
        let errors = self.error_count.load(Ordering::SeqCst) as f64;
        let messages = self.message_count.load(Ordering::SeqCst) as f64;
        let total = errors + messages;
        if total == 0.0 {
            0.0
        } else {
            errors / total
        }
    }

    /// Close out a connected span and drop spans that have aged out
    fn bank_session(&self, start_ms: i64, end_ms: i64) {
        let horizon = end_ms - self.thresholds.stability_window_ms as i64;
        let mut sessions = self.sessions.lock();
        sessions.push_back((start_ms, end_ms));
        while sessions.front().is_some_and(|&(_, end)| end < horizon) {
            sessions.pop_front();
        }
    }

    /// Rolling uptime over the trailing stability window. An outage that
    /// has aged out of the window no longer drags the score down, so a
    /// recovered channel scores 100 again after sustained uptime.
    pub fn uptime_pct(&self, now_ms: i64) -> f64 {
        let lo = (now_ms - self.thresholds.stability_window_ms as i64).max(self.window_start_ms);
        let span = now_ms - lo;
        if span <= 0 {
            return 1.0;
        }
        let mut up: i64 = self
            .sessions
            .lock()
            .iter()
            .map(|&(start, end)| (end.min(now_ms) - start.max(lo)).max(0))
            .sum();
        let since = self.connected_since_ms.load(Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst) && since > 0 {
            up += (now_ms - since.max(lo)).max(0);
        }
        (up as f64 / span as f64).clamp(0.0, 1.0)
    }

    pub fn failover_count(&self) -> u64 {
        self.failover_count.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Raise an alert unless one of this kind is already latched.
    /// Latching persists until the alert is explicitly resolved, so a
    /// flapping threshold cannot mask a real outage.
    pub fn raise_alert(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Option<Alert> {
        let mut latched = self.latched.lock();
        if latched.contains_key(&kind) {
            return None;
        }
        let id = self.alert_seq.fetch_add(1, Ordering::SeqCst);
        let alert = Alert::new(id, kind, severity, message);
        latched.insert(kind, id);
        self.alerts.lock().push(alert.clone());
        Some(alert)
    }

    /// Explicit acknowledgement; returns `false` for unknown ids
    pub fn resolve_alert(&self, id: u64) -> bool {
        let mut alerts = self.alerts.lock();
        let Some(alert) = alerts.iter_mut().find(|a| a.id == id && !a.resolved) else {
            return false;
        };
        alert.resolved = true;
        let kind = alert.kind;
        self.latched.lock().remove(&kind);
        true
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthThresholds::default(), 30_000, 0)
    }

    #[test]
    fn score_deductions_follow_latency_thresholds() {
        let t = HealthThresholds::default();
        let base = ScoreInputs {
            latency_ms: 100,
            error_rate: 0.0,
            recent_failovers: 0,
            uptime_pct: 1.0,
        };
        let healthy = compute_score(&base, &t);
        let warn = compute_score(&ScoreInputs { latency_ms: 1_500, ..base }, &t);
        let critical = compute_score(&ScoreInputs { latency_ms: 6_000, ..base }, &t);

        assert_eq!(healthy, 100);
        assert_eq!(warn, 85);
        assert_eq!(critical, 70);
        // Monotonically non-increasing across the thresholds
        assert!(healthy >= warn && warn >= critical);
    }

    #[test]
    fn score_floors_at_zero() {
        let t = HealthThresholds::default();
        let inputs = ScoreInputs {
            latency_ms: 10_000,
            error_rate: 0.5,
            recent_failovers: 20,
            uptime_pct: 0.1,
        };
        assert_eq!(compute_score(&inputs, &t), 0);
    }

    #[test]
    fn score_recovers_after_stability_window() {
        let m = monitor();
        m.record_connected(0, "a");
        m.record_pong(10, 6_000);
        m.record_failover(20);
        m.record_connected(30, "b");
        m.record_pong(40, 6_000);

        assert!(m.snapshot(50).score < 100);

        // Latency back in bounds, then 120s of stability
        m.record_pong(60, 100);
        let (verdict, _) = m.evaluate(130_000);
        assert_eq!(verdict, Verdict::Ok);
        assert_eq!(m.snapshot(130_000).score, 100);
        assert_eq!(m.snapshot(130_000).status, HealthStatus::Healthy);
    }

    #[test]
    fn missing_pong_triggers_exactly_one_failover_verdict() {
        let m = monitor();
        m.record_connected(0, "a");
        m.record_ping(1_000);

        let (before, _) = m.evaluate(20_000);
        assert_eq!(before, Verdict::Ok);

        let (first, _) = m.evaluate(31_001);
        assert_eq!(first, Verdict::FailoverNeeded);

        // No repeat verdicts until the pending failover is acted on
        let (second, _) = m.evaluate(40_000);
        assert_eq!(second, Verdict::Ok);

        // After the failover completes and a pong arrives the clock re-arms
        m.record_failover(40_001);
        m.record_connected(40_002, "b");
        m.record_ping(41_000);
        let (rearmed, _) = m.evaluate(80_000);
        assert_eq!(rearmed, Verdict::FailoverNeeded);
    }

    #[test]
    fn no_failover_verdict_without_an_outstanding_ping() {
        let m = monitor();
        m.record_connected(0, "a");
        // Never pinged: transient zero-state must not look like a timeout
        let (verdict, _) = m.evaluate(100_000);
        assert_eq!(verdict, Verdict::Ok);

        // Disconnected links are the coordinator's problem, not a timeout
        m.record_ping(100_001);
        m.record_disconnected(100_002);
        let (verdict, _) = m.evaluate(200_000);
        assert_eq!(verdict, Verdict::Ok);
    }

    #[test]
    fn alerts_latch_until_explicitly_resolved() {
        let m = monitor();
        m.record_connected(0, "a");
        m.record_pong(10, 6_000);

        let (_, raised) = m.evaluate(1_000);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::LatencyHigh);

        // Still latched: same threshold crossing raises nothing new
        let (_, raised) = m.evaluate(2_000);
        assert!(raised.is_empty());
        assert_eq!(m.active_alerts().len(), 1);

        let id = m.active_alerts()[0].id;
        assert!(m.resolve_alert(id));
        assert!(!m.resolve_alert(id));
        assert!(m.active_alerts().is_empty());

        // After acknowledgement a fresh crossing raises again
        let (_, raised) = m.evaluate(3_000);
        assert_eq!(raised.len(), 1);
    }

    #[test]
    fn error_rate_crossings_raise_alerts() {
        let m = monitor();
        m.record_connected(0, "a");
        for _ in 0..9 {
            m.record_message();
        }
        m.record_error(10);

        // 10% error rate: warning band
        let (_, raised) = m.evaluate(1_000);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn uptime_rolls_over_the_stability_window() {
        let m = monitor();
        m.record_connected(0, "a");
        m.record_disconnected(60_000);
        // Mid-outage the gap dominates the window
        assert!(m.uptime_pct(120_000) < 0.90);

        m.record_connected(600_000, "a");
        // 130s of renewed uptime pushes the outage out of the window
        assert!((m.uptime_pct(730_000) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_returns_to_100_after_an_outage_ages_out() {
        let m = monitor();
        m.record_connected(0, "a");
        m.record_disconnected(60_000);
        m.record_failover(60_000);
        assert!(m.snapshot(120_000).score < 100);

        // Reconnected and healthy well past the stability window
        m.record_connected(600_000, "a");
        m.record_pong(600_500, 100);
        let (verdict, _) = m.evaluate(730_000);
        assert_eq!(verdict, Verdict::Ok);

        let snap = m.snapshot(730_000);
        assert_eq!(snap.score, 100);
        assert_eq!(snap.status, HealthStatus::Healthy);
    }

    #[test]
    fn snapshots_are_not_observed_before_the_first_attempt() {
        let m = monitor();
        assert!(!m.observed());
        m.record_attempt();
        assert!(m.observed());
    }
}
