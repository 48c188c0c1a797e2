//! Per-provider circuit breaker.
//!
//! The [`HealthMonitor`] tracks consecutive failures per provider. When
//! failures reach a configurable threshold the circuit *opens* and the
//! provider is skipped by the router. After a cooldown the circuit enters
//! *half-open* state and exactly one trial call is let through: success
//! closes the circuit, failure reopens it with a fresh cooldown.
//!
//! [`HealthMonitor::is_available`] only looks; routing uses it to build
//! chains. The trial permit is taken by [`HealthMonitor::try_acquire`]
//! right before a call is made, so a provider that was routed but never
//! called keeps its permit.
//!
//! Each provider's state sits behind its own mutex. The map itself is
//! built once and never resized, so no lock spans two providers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::registry::{ProviderDescriptor, ProviderRegistry};

/// Circuit breaker state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests blocked until cooldown expires.
    Open,
    /// Cooldown expired, one probe request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time spent Open before a trial call is allowed.
    pub cooldown: Duration,
    /// Length of the rolling success/failure window.
    pub window: Duration,
}

impl BreakerSettings {
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            window: Duration::from_secs(config.window_secs),
        }
    }

    /// Apply a provider's own overrides on top of the global settings.
    pub fn for_provider(self, provider: &ProviderDescriptor) -> Self {
        Self {
            failure_threshold: provider
                .failure_threshold
                .unwrap_or(self.failure_threshold)
                .max(1),
            cooldown: provider.cooldown.unwrap_or(self.cooldown),
            window: self.window,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from_config(&BreakerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Mutable health record for one provider.
#[derive(Debug)]
struct ProviderHealthState {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    /// When the half-open trial permit was handed out.
    trial_issued_at: Option<Instant>,
    window: VecDeque<(Instant, Outcome)>,
    total_successes: u64,
    total_failures: u64,
}

impl ProviderHealthState {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            opened_at: None,
            trial_issued_at: None,
            window: VecDeque::new(),
            total_successes: 0,
            total_failures: 0,
        }
    }

    /// Open → HalfOpen once the cooldown has elapsed.
    fn refresh(&mut self, now: Instant) {
        if self.state == CircuitState::Open {
            let opened = self.opened_at.unwrap_or(now);
            if now.saturating_duration_since(opened) >= self.settings.cooldown {
                self.state = CircuitState::HalfOpen;
                self.trial_issued_at = None;
            }
        }
    }

    fn push_outcome(&mut self, now: Instant, outcome: Outcome) {
        self.window.push_back((now, outcome));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) > self.settings.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_success(&mut self, now: Instant) -> Option<CircuitState> {
        self.push_outcome(now, Outcome::Success);
        self.total_successes += 1;
        self.consecutive_failures = 0;
        self.trial_issued_at = None;
        self.opened_at = None;
        let previous = std::mem::replace(&mut self.state, CircuitState::Closed);
        (previous != CircuitState::Closed).then_some(previous)
    }

    fn record_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.push_outcome(now, Outcome::Failure);
        self.total_failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());

        let previous = self.state;
        let trips = match self.state {
            CircuitState::Closed => self.consecutive_failures >= self.settings.failure_threshold,
            // A failed probe, or a last-resort call while open, restarts the cooldown.
            CircuitState::HalfOpen | CircuitState::Open => true,
        };
        if trips {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.trial_issued_at = None;
        }
        (previous != CircuitState::Open && trips).then_some(previous)
    }

    /// Whether the half-open trial permit can be handed out. A permit whose
    /// trial never reported back is reissued after another cooldown.
    fn permit_free(&self, now: Instant) -> bool {
        self.trial_issued_at
            .map(|at| now.saturating_duration_since(at) >= self.settings.cooldown)
            .unwrap_or(true)
    }

    fn peek(&mut self, now: Instant) -> bool {
        self.refresh(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.permit_free(now),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let granted = self.peek(now);
        if granted && self.state == CircuitState::HalfOpen {
            self.trial_issued_at = Some(now);
        }
        granted
    }

    fn snapshot(&mut self, provider: &str, now: Instant) -> HealthSnapshot {
        self.refresh(now);
        self.prune(now);
        let window_failures = self
            .window
            .iter()
            .filter(|(_, o)| *o == Outcome::Failure)
            .count() as u64;
        HealthSnapshot {
            provider: provider.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            window_successes: self.window.len() as u64 - window_failures,
            window_failures,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_failure_at: self.last_failure_at,
        }
    }
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_successes: u64,
    pub window_failures: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl HealthSnapshot {
    /// Success rate over the rolling window (1.0 when idle).
    pub fn window_success_rate(&self) -> f64 {
        let total = self.window_successes + self.window_failures;
        if total == 0 {
            1.0
        } else {
            self.window_successes as f64 / total as f64
        }
    }
}

/// Health Monitor: one circuit breaker per configured provider.
#[derive(Debug)]
pub struct HealthMonitor {
    order: Vec<String>,
    entries: HashMap<String, Mutex<ProviderHealthState>>,
}

impl HealthMonitor {
    /// One Closed breaker per registry entry.
    pub fn new(registry: &ProviderRegistry, config: &BreakerConfig) -> Self {
        let global = BreakerSettings::from_config(config);
        Self::with_settings(
            registry
                .list_providers()
                .iter()
                .map(|p| (p.id.clone(), global.for_provider(p))),
        )
    }

    /// Build from explicit `(provider, settings)` pairs.
    pub fn with_settings<I>(providers: I) -> Self
    where
        I: IntoIterator<Item = (String, BreakerSettings)>,
    {
        let mut order = Vec::new();
        let mut entries = HashMap::new();
        for (id, settings) in providers {
            if entries
                .insert(id.clone(), Mutex::new(ProviderHealthState::new(settings)))
                .is_none()
            {
                order.push(id);
            }
        }
        Self { order, entries }
    }

    fn lock(&self, provider: &str) -> Option<MutexGuard<'_, ProviderHealthState>> {
        self.entries
            .get(provider)
            .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Record a successful call and close the circuit.
    pub fn record_success(&self, provider: &str) {
        let Some(mut entry) = self.lock(provider) else {
            warn!(provider, "success recorded for unknown provider");
            return;
        };
        if let Some(previous) = entry.record_success(Instant::now()) {
            info!(provider, from = %previous, "circuit closed");
        }
    }

    /// Record a failed call, which may trip the circuit open.
    pub fn record_failure(&self, provider: &str) {
        let Some(mut entry) = self.lock(provider) else {
            warn!(provider, "failure recorded for unknown provider");
            return;
        };
        let failures = entry.consecutive_failures + 1;
        if let Some(previous) = entry.record_failure(Instant::now()) {
            warn!(provider, from = %previous, failures, "circuit opened");
        }
    }

    /// Whether `provider` could be called now, without claiming anything.
    ///
    /// Closed: always. Open: never. HalfOpen: while the trial permit is
    /// still free.
    pub fn is_available(&self, provider: &str) -> bool {
        self.lock(provider)
            .map(|mut entry| entry.peek(Instant::now()))
            .unwrap_or(false)
    }

    /// Claim the right to call `provider` now.
    ///
    /// Same answer as [`is_available`](Self::is_available), except that a
    /// HalfOpen grant hands out the single trial permit; later callers get
    /// `false` until the trial reports back.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.lock(provider)
            .map(|mut entry| entry.try_acquire(Instant::now()))
            .unwrap_or(false)
    }

    /// Current circuit state, applying the Open → HalfOpen transition if due.
    pub fn state(&self, provider: &str) -> Option<CircuitState> {
        self.lock(provider).map(|mut entry| {
            entry.refresh(Instant::now());
            entry.state
        })
    }

    /// Consecutive failures recorded for `provider`.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.lock(provider)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    /// Among `candidates`, the provider whose last failure is oldest.
    /// Providers that never failed rank first; ties keep input order.
    pub fn least_recently_failed<'a, I>(&self, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .filter_map(|id| self.lock(id).map(|entry| (id, entry.last_failure)))
            .min_by_key(|(_, last)| *last)
            .map(|(id, _)| id.to_string())
    }

    pub fn snapshot_of(&self, provider: &str) -> Option<HealthSnapshot> {
        let now = Instant::now();
        self.lock(provider)
            .map(|mut entry| entry.snapshot(provider, now))
    }

    /// Snapshot of every provider in registration order.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.snapshot_of(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold: u32, cooldown_secs: u64) -> HealthMonitor {
        let settings = BreakerSettings {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            window: Duration::from_secs(300),
        };
        HealthMonitor::with_settings(
            ["a", "b", "c"]
                .into_iter()
                .map(|id| (id.to_string(), settings)),
        )
    }

    #[test]
    fn test_circuit_starts_closed() {
        let hm = monitor(3, 60);
        assert_eq!(hm.state("a"), Some(CircuitState::Closed));
        assert!(hm.is_available("a"));
        assert!(hm.is_available("a"));
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let hm = monitor(2, 9999);
        hm.record_failure("a");
        assert_eq!(hm.state("a"), Some(CircuitState::Closed));
        hm.record_failure("a");
        assert_eq!(hm.state("a"), Some(CircuitState::Open));
        assert!(!hm.is_available("a"));
    }

    #[test]
    fn test_success_resets_circuit() {
        let hm = monitor(2, 9999);
        hm.record_failure("a");
        hm.record_failure("a");
        hm.record_success("a");
        assert_eq!(hm.state("a"), Some(CircuitState::Closed));
        assert_eq!(hm.failure_count("a"), 0);
    }

    #[test]
    fn test_success_interrupts_consecutive_count() {
        let hm = monitor(3, 9999);
        hm.record_failure("a");
        hm.record_failure("a");
        hm.record_success("a");
        hm.record_failure("a");
        hm.record_failure("a");
        assert!(hm.is_available("a"));
    }

    #[test]
    fn test_providers_are_independent() {
        let hm = monitor(1, 9999);
        hm.record_failure("a");
        assert!(!hm.is_available("a"));
        assert!(hm.is_available("b"));
        assert_eq!(hm.state("b"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_permits_single_trial() {
        let hm = monitor(3, 60);
        for _ in 0..3 {
            hm.record_failure("a");
        }
        assert!(!hm.is_available("a"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(hm.state("a"), Some(CircuitState::HalfOpen));
        // Looking does not take the permit.
        assert!(hm.is_available("a"));
        assert!(hm.is_available("a"));
        assert!(hm.try_acquire("a"));
        assert!(!hm.is_available("a"));
        assert!(!hm.try_acquire("a"));
        assert_eq!(hm.state("a"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn test_closed_acquire_is_unlimited() {
        let hm = monitor(3, 60);
        for _ in 0..5 {
            assert!(hm.try_acquire("a"));
        }
        assert!(!hm.try_acquire("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let hm = monitor(1, 10);
        hm.record_failure("a");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(hm.try_acquire("a"));
        hm.record_success("a");
        assert_eq!(hm.state("a"), Some(CircuitState::Closed));
        assert!(hm.is_available("a"));
        assert!(hm.is_available("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let hm = monitor(1, 10);
        hm.record_failure("a");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(hm.try_acquire("a"));
        hm.record_failure("a");
        assert_eq!(hm.state("a"), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(hm.state("a"), Some(CircuitState::Open));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(hm.state("a"), Some(CircuitState::HalfOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_trial_permit_is_reissued() {
        let hm = monitor(1, 10);
        hm.record_failure("a");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(hm.try_acquire("a"));
        assert!(!hm.try_acquire("a"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(hm.try_acquire("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_recently_failed() {
        let hm = monitor(1, 9999);
        hm.record_failure("b");
        tokio::time::advance(Duration::from_secs(1)).await;
        hm.record_failure("a");
        assert_eq!(
            hm.least_recently_failed(["a", "b"]),
            Some("b".to_string())
        );
        // never-failed ranks first
        assert_eq!(
            hm.least_recently_failed(["a", "b", "c"]),
            Some("c".to_string())
        );
        assert_eq!(hm.least_recently_failed(["ghost"]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_old_outcomes() {
        let hm = monitor(5, 60);
        hm.record_failure("a");
        hm.record_success("a");
        let snap = hm.snapshot_of("a").unwrap();
        assert_eq!((snap.window_successes, snap.window_failures), (1, 1));
        assert!((snap.window_success_rate() - 0.5).abs() < f64::EPSILON);

        tokio::time::advance(Duration::from_secs(301)).await;
        let snap = hm.snapshot_of("a").unwrap();
        assert_eq!((snap.window_successes, snap.window_failures), (0, 0));
        assert_eq!((snap.total_successes, snap.total_failures), (1, 1));
    }

    #[test]
    fn test_unknown_provider_is_unavailable() {
        let hm = monitor(3, 60);
        hm.record_failure("ghost");
        assert!(!hm.is_available("ghost"));
        assert_eq!(hm.state("ghost"), None);
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let hm = monitor(3, 60);
        let ids: Vec<String> = hm.snapshot().into_iter().map(|s| s.provider).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
