//! Per-service circuit breaker with a sliding failure window

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::dynamic::{CircuitSection, DynamicConfigHolder};
use crate::metrics;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass
    Closed,
    /// Requests fast-fail
    Open,
    /// One probe is allowed through
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

struct ServiceCircuit {
    state: CircuitState,
    failures: u32,
    total: u32,
    opened_at: Instant,
    window_start: Instant,
}

impl ServiceCircuit {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: CircuitState::Closed,
            failures: 0,
            total: 0,
            opened_at: now,
            window_start: now,
        }
    }

    fn reset_window(&mut self) {
        self.failures = 0;
        self.total = 0;
        self.window_start = Instant::now();
    }

    /// Counters only count within the configured window
    fn roll_window(&mut self, window: Duration) {
        if self.window_start.elapsed() > window {
            self.reset_window();
        }
    }
}

/// Manages one breaker per service name, reading thresholds from the
/// dynamic configuration on every decision.
pub struct CircuitBreakerManager {
    holder: Arc<DynamicConfigHolder>,
    circuits: RwLock<HashMap<String, Arc<Mutex<ServiceCircuit>>>>,
}

impl CircuitBreakerManager {
    pub fn new(holder: Arc<DynamicConfigHolder>) -> Self {
        Self {
            holder,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    fn cfg(&self) -> CircuitSection {
        self.holder.load().circuit.clone()
    }

    pub fn enabled(&self) -> bool {
        self.cfg().enabled
    }

    fn circuit(&self, service: &str) -> Arc<Mutex<ServiceCircuit>> {
        if let Some(circuit) = self.circuits.read().expect("circuit map poisoned").get(service) {
            return circuit.clone();
        }

        let mut circuits = self.circuits.write().expect("circuit map poisoned");
        circuits
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServiceCircuit::new())))
            .clone()
    }

    /// Whether a request for `service` may proceed. In the open state the
    /// first call after the cooldown transitions to half-open and passes
    /// as the probe.
    pub fn allow(&self, service: &str) -> bool {
        let cfg = self.cfg();
        let circuit = self.circuit(service);
        let mut circuit = circuit.lock().expect("circuit poisoned");

        let allowed = match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooldown = Duration::from_secs(cfg.cooldown_sec);
                if circuit.opened_at.elapsed() >= cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.reset_window();
                    info!("circuit half-open: {}", service);
                    true
                } else {
                    false
                }
            }
        };

        metrics::CIRCUIT_BREAKER_STATE
            .with_label_values(&[service])
            .set(circuit.state.as_gauge());
        allowed
    }

    pub fn record_success(&self, service: &str) {
        let cfg = self.cfg();
        let circuit = self.circuit(service);
        let mut circuit = circuit.lock().expect("circuit poisoned");

        circuit.roll_window(Duration::from_secs(cfg.window_sec));
        circuit.total += 1;

        if circuit.state == CircuitState::HalfOpen {
            circuit.state = CircuitState::Closed;
            circuit.reset_window();
            info!("circuit closed: {}", service);
        }
    }

    pub fn record_failure(&self, service: &str) {
        let cfg = self.cfg();
        let circuit = self.circuit(service);
        let mut circuit = circuit.lock().expect("circuit poisoned");

        circuit.roll_window(Duration::from_secs(cfg.window_sec));
        circuit.failures += 1;
        circuit.total += 1;

        if circuit.state == CircuitState::HalfOpen {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Instant::now();
            info!("circuit re-opened: {}", service);
            return;
        }

        if circuit.state == CircuitState::Closed && circuit.total >= cfg.min_requests {
            let ratio = circuit.failures as f64 / circuit.total as f64;
            if ratio >= cfg.error_threshold {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Instant::now();
                info!(
                    "circuit opened: {} ({}/{} failures)",
                    service, circuit.failures, circuit.total
                );
            }
        }
    }

    /// Current state, for tests and metrics
    pub fn state(&self, service: &str) -> CircuitState {
        let circuit = self.circuit(service);
        let circuit = circuit.lock().expect("circuit poisoned");
        circuit.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::DynamicConfig;

    fn manager(min_requests: u32, threshold: f64, window: u64, cooldown: u64) -> CircuitBreakerManager {
        let holder = Arc::new(DynamicConfigHolder::new());
        let mut cfg = DynamicConfig::default();
        cfg.circuit.enabled = true;
        cfg.circuit.min_requests = min_requests;
        cfg.circuit.error_threshold = threshold;
        cfg.circuit.window_sec = window;
        cfg.circuit.cooldown_sec = cooldown;
        holder.store(cfg);
        CircuitBreakerManager::new(holder)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold() {
        let breaker = manager(20, 0.5, 30, 15);

        for _ in 0..10 {
            breaker.record_success("svc");
        }
        for _ in 0..9 {
            breaker.record_failure("svc");
        }
        // 9 failures in 19 requests: below min_requests, still closed
        assert_eq!(breaker.state("svc"), CircuitState::Closed);

        breaker.record_failure("svc");
        // 10/20 reaches the 0.5 threshold
        assert_eq!(breaker.state("svc"), CircuitState::Open);
        assert!(!breaker.allow("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_stays_closed() {
        let breaker = manager(20, 0.5, 30, 15);

        for _ in 0..11 {
            breaker.record_success("svc");
        }
        for _ in 0..9 {
            breaker.record_failure("svc");
        }
        // 9 failures in 20 requests is under the threshold
        assert_eq!(breaker.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let breaker = manager(2, 0.5, 30, 15);
        breaker.record_failure("svc");
        breaker.record_failure("svc");
        assert_eq!(breaker.state("svc"), CircuitState::Open);

        // no request passes before the cooldown
        assert!(!breaker.allow("svc"));
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(!breaker.allow("svc"));

        // first allow after the cooldown is the probe
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(breaker.allow("svc"));
        assert_eq!(breaker.state("svc"), CircuitState::HalfOpen);

        breaker.record_success("svc");
        assert_eq!(breaker.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_resets_cooldown() {
        let breaker = manager(2, 0.5, 30, 15);
        breaker.record_failure("svc");
        breaker.record_failure("svc");

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(breaker.allow("svc"));
        breaker.record_failure("svc");
        assert_eq!(breaker.state("svc"), CircuitState::Open);

        // the cooldown restarts from the failed probe
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!breaker.allow("svc"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(breaker.allow("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_counters() {
        let breaker = manager(4, 0.5, 30, 15);
        breaker.record_failure("svc");
        breaker.record_failure("svc");
        breaker.record_failure("svc");

        // the window lapses; old failures no longer count
        tokio::time::sleep(Duration::from_secs(31)).await;
        breaker.record_failure("svc");
        assert_eq!(breaker.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn services_are_independent() {
        let breaker = manager(2, 0.5, 30, 15);
        breaker.record_failure("bad-svc");
        breaker.record_failure("bad-svc");

        assert_eq!(breaker.state("bad-svc"), CircuitState::Open);
        assert!(breaker.allow("healthy-svc"));
        assert_eq!(breaker.state("healthy-svc"), CircuitState::Closed);
    }
}