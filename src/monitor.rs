//! Engine health tracking.
//!
//! An engine which fails several times in a row is probably down, and calling
//! it for every document just burns its timeout. The monitor benches it for a
//! cooldown period and raises an alert, at most once per cooldown.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{config::MonitorConfig, prelude::*};

/// Health counters for one engine.
#[derive(Clone, Debug, Default)]
pub struct EngineHealth {
    pub consecutive_failures: usize,
    pub total_successes: usize,
    pub total_failures: usize,
    pub unhealthy_since: Option<Instant>,
    pub last_alert: Option<Instant>,
}

/// Tracks success and failure streaks per engine.
///
/// Shared between concurrent document pipelines. Locks are held only for a
/// counter update.
#[derive(Debug)]
pub struct EngineMonitor {
    failure_threshold: usize,
    cooldown: Duration,
    health: Mutex<HashMap<String, EngineHealth>>,
}

impl EngineMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful call. Clears any failure streak.
    pub fn record_success(&self, engine: &str) {
        let mut health = self.health.lock().expect("lock poisoned");
        let entry = health.entry(engine.to_owned()).or_default();
        if entry.unhealthy_since.take().is_some() {
            info!(engine, "Engine recovered");
        }
        entry.consecutive_failures = 0;
        entry.total_successes += 1;
    }

    /// Record a failed call.
    pub fn record_failure(&self, engine: &str, error: &str) {
        self.record_failure_at(engine, error, Instant::now());
    }

    fn record_failure_at(&self, engine: &str, error: &str, now: Instant) {
        let mut health = self.health.lock().expect("lock poisoned");
        let entry = health.entry(engine.to_owned()).or_default();
        entry.consecutive_failures += 1;
        entry.total_failures += 1;
        if entry.consecutive_failures < self.failure_threshold {
            return;
        }
        if entry.unhealthy_since.is_none() {
            entry.unhealthy_since = Some(now);
        }
        let alert_due = entry
            .last_alert
            .is_none_or(|last| now.duration_since(last) >= self.cooldown);
        if alert_due {
            entry.last_alert = Some(now);
            error!(
                engine,
                consecutive_failures = entry.consecutive_failures,
                total_failures = entry.total_failures,
                last_error = error,
                cooldown_secs = self.cooldown.as_secs(),
                "Engine is failing repeatedly; benching it"
            );
        }
    }

    /// Should callers skip this engine right now?
    pub fn is_healthy(&self, engine: &str) -> bool {
        self.is_healthy_at(engine, Instant::now())
    }

    fn is_healthy_at(&self, engine: &str, now: Instant) -> bool {
        let mut health = self.health.lock().expect("lock poisoned");
        let Some(entry) = health.get_mut(engine) else {
            return true;
        };
        match entry.unhealthy_since {
            None => true,
            Some(since) if now.duration_since(since) >= self.cooldown => {
                // Give it another chance. One more failure benches it again.
                debug!(engine, "Engine cooldown expired; trying it again");
                entry.unhealthy_since = None;
                entry.consecutive_failures = self.failure_threshold.saturating_sub(1);
                true
            }
            Some(_) => false,
        }
    }

    /// A snapshot of one engine's counters.
    pub fn health(&self, engine: &str) -> EngineHealth {
        self.health
            .lock()
            .expect("lock poisoned")
            .get(engine)
            .cloned()
            .unwrap_or_default()
    }
}
