//! Runtime gateway policy and its atomic holder
//!
//! [`DynamicConfig`] is an immutable value object delivered by the config
//! center (YAML or JSON). The holder swaps the whole object atomically;
//! per-request readers never lock.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Runtime policy for the gateway request pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub jwt: JwtSection,

    #[serde(default)]
    pub ip_filter: IpFilterSection,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub circuit: CircuitSection,

    #[serde(default)]
    pub cors: CorsSection,

    #[serde(default)]
    pub balancer: BalancerSection,
}

/// JWT verification settings with multi-key (kid) support
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwtSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub keys: Vec<JwkItem>,

    #[serde(default)]
    pub skip_paths: Vec<String>,
}

/// One public key entry; `kid` matches the JWT header field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwkItem {
    pub kid: String,
    /// RS256 / EdDSA
    pub algorithm: String,
    /// PEM-encoded public key
    pub public_key: String,
}

/// IP allow/deny list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpFilterSection {
    #[serde(default)]
    pub enabled: bool,

    /// whitelist / blacklist
    #[serde(default)]
    pub mode: String,

    /// Single addresses or CIDR blocks
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Global token bucket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default)]
    pub enabled: bool,

    /// Tokens added per second
    #[serde(default)]
    pub rate: f64,

    /// Bucket capacity
    #[serde(default)]
    pub burst: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 0.0,
            burst: 0,
        }
    }
}

/// Per-service circuit breaker settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitSection {
    #[serde(default)]
    pub enabled: bool,

    /// Failure ratio opening the circuit, 0.0 - 1.0
    #[serde(default)]
    pub error_threshold: f64,

    /// Minimum samples before the threshold applies
    #[serde(default)]
    pub min_requests: u32,

    /// Sliding window length in seconds
    #[serde(default)]
    pub window_sec: u64,

    /// Time spent open before probing, in seconds
    #[serde(default)]
    pub cooldown_sec: u64,
}

/// CORS policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub allow_origins: Vec<String>,

    #[serde(default)]
    pub allow_methods: Vec<String>,

    #[serde(default)]
    pub allow_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    #[serde(default)]
    pub max_age_sec: u64,
}

/// Load balancer selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancerSection {
    /// round_robin / random / weighted_round_robin
    #[serde(default)]
    pub strategy: String,
}

/// Fill defaults so partial payloads never leave zeroed policy behind
pub fn apply_dynamic_defaults(cfg: &mut DynamicConfig) {
    if cfg.rate_limit.rate <= 0.0 {
        cfg.rate_limit.rate = 1000.0;
    }
    if cfg.rate_limit.burst == 0 {
        cfg.rate_limit.burst = 2000;
    }

    if cfg.circuit.error_threshold <= 0.0 {
        cfg.circuit.error_threshold = 0.5;
    }
    if cfg.circuit.min_requests == 0 {
        cfg.circuit.min_requests = 20;
    }
    if cfg.circuit.window_sec == 0 {
        cfg.circuit.window_sec = 30;
    }
    if cfg.circuit.cooldown_sec == 0 {
        cfg.circuit.cooldown_sec = 15;
    }

    if cfg.cors.allow_origins.is_empty() {
        cfg.cors.allow_origins = vec!["*".to_string()];
    }
    if cfg.cors.allow_methods.is_empty() {
        cfg.cors.allow_methods = ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
            .map(String::from)
            .to_vec();
    }
    if cfg.cors.allow_headers.is_empty() {
        cfg.cors.allow_headers = ["Content-Type", "Authorization", "X-Request-Id"]
            .map(String::from)
            .to_vec();
    }
    if cfg.cors.max_age_sec == 0 {
        cfg.cors.max_age_sec = 3600;
    }

    if cfg.balancer.strategy.is_empty() {
        cfg.balancer.strategy = "round_robin".to_string();
    }
}

type Callback = Box<dyn Fn(&Arc<DynamicConfig>) + Send + Sync>;

/// Atomic slot holding the current [`DynamicConfig`].
///
/// `load` is one atomic pointer read; `store` swaps the slot and invokes
/// every registered callback in order, each isolated against panics.
pub struct DynamicConfigHolder {
    current: ArcSwap<DynamicConfig>,
    callbacks: Mutex<Vec<Callback>>,
}

impl Default for DynamicConfigHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicConfigHolder {
    /// Create a holder seeded with defaults so readers never observe an
    /// empty slot
    pub fn new() -> Self {
        let mut initial = DynamicConfig::default();
        apply_dynamic_defaults(&mut initial);
        Self {
            current: ArcSwap::from_pointee(initial),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Current configuration; cheap enough for per-request use
    pub fn load(&self) -> Arc<DynamicConfig> {
        self.current.load_full()
    }

    /// Replace the configuration and fan out to callbacks
    pub fn store(&self, mut cfg: DynamicConfig) {
        apply_dynamic_defaults(&mut cfg);
        let cfg = Arc::new(cfg);
        self.current.store(cfg.clone());

        let callbacks = self.callbacks.lock().expect("callback list poisoned");
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&cfg))).is_err() {
                error!("dynamic config callback panicked");
            }
        }
    }

    /// Register a callback invoked on every store, in registration order
    pub fn on_change(&self, callback: impl Fn(&Arc<DynamicConfig>) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callback list poisoned")
            .push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_are_materialised_at_construction() {
        let holder = DynamicConfigHolder::new();
        let cfg = holder.load();
        assert_eq!(cfg.rate_limit.rate, 1000.0);
        assert_eq!(cfg.circuit.min_requests, 20);
        assert_eq!(cfg.cors.allow_origins, vec!["*"]);
        assert_eq!(cfg.balancer.strategy, "round_robin");
    }

    #[test]
    fn store_applies_defaults_and_runs_callbacks_in_order() {
        let holder = DynamicConfigHolder::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            holder.on_change(move |_| order.lock().unwrap().push(tag));
        }

        holder.store(DynamicConfig::default());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(holder.load().rate_limit.burst, 2000);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let holder = DynamicConfigHolder::new();
        let invoked = Arc::new(AtomicUsize::new(0));

        holder.on_change(|_| panic!("boom"));
        {
            let invoked = invoked.clone();
            holder.on_change(move |_| {
                invoked.fetch_add(1, Ordering::SeqCst);
            });
        }

        holder.store(DynamicConfig::default());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_readers_see_whole_configs() {
        let holder = Arc::new(DynamicConfigHolder::new());
        let mut writers = Vec::new();

        for round in 0..4u64 {
            let holder = holder.clone();
            writers.push(std::thread::spawn(move || {
                for i in 0..250 {
                    let mut cfg = DynamicConfig::default();
                    let rate = (round * 1000 + i) as f64 + 1.0;
                    cfg.rate_limit.rate = rate;
                    cfg.rate_limit.burst = rate as u32;
                    holder.store(cfg);
                }
            }));
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let holder = holder.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let cfg = holder.load();
                        // rate and burst are written together; a torn read
                        // would break this pairing
                        assert_eq!(cfg.rate_limit.rate as u32, cfg.rate_limit.burst);
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
    }

    #[test]
    fn yaml_payload_parses() {
        let yaml = r#"
jwt:
  enabled: true
  skip_paths: ["/health"]
  keys:
    - kid: k1
      algorithm: RS256
      public_key: "-----BEGIN PUBLIC KEY-----"
rate_limit:
  enabled: true
  rate: 50
  burst: 100
balancer:
  strategy: weighted_round_robin
"#;
        let cfg: DynamicConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.jwt.enabled);
        assert_eq!(cfg.jwt.keys.len(), 1);
        assert_eq!(cfg.jwt.keys[0].kid, "k1");
        assert_eq!(cfg.rate_limit.rate, 50.0);
        assert_eq!(cfg.balancer.strategy, "weighted_round_robin");
    }
}
