//! Private Network Access preflight prober
//!
//! Before blocking plaintext HTTP to a LAN host, ask the host whether it
//! opts in to being reached from a private network: send
//! `OPTIONS http://host:port/` with `Access-Control-Request-Private-Network:
//! true` and trust the host only if it answers 200 with
//! `Access-Control-Allow-Private-Network: true`.
//!
//! Results are cached per `host:port` in two tables with different TTLs
//! (trusted: short, untrusted: long). A network failure of any kind is an
//! UNTRUSTED answer, never an error for the caller.
//!
//! The probe is synchronous and runs on the packet thread. It is bounded by
//! the connect/read timeout; moving it off the hot path is a known
//! limitation, not handled here.

use super::{FirewallError, FirewallResult};
use crate::notification::NotificationSink;
use crate::settings::PreflightConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const REQUEST_HEADER: &str = "Access-Control-Request-Private-Network";
pub const ALLOW_HEADER: &str = "Access-Control-Allow-Private-Network";

/// Cache size that triggers pruning of expired keys
const PRUNE_THRESHOLD: usize = 4096;

/// Result of a preflight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    Trusted,
    Untrusted,
}

/// What [`PreflightProber::probe`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub trust: Trust,
    /// Answered from cache, no network I/O
    pub cached: bool,
}

impl ProbeOutcome {
    pub fn is_trusted(&self) -> bool {
        self.trust == Trust::Trusted
    }
}

/// The bits of a preflight response the prober looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightResponse {
    pub status: u16,
    pub allow_private_network: Option<String>,
}

impl PreflightResponse {
    pub fn grants_access(&self) -> bool {
        self.status == 200
            && self
                .allow_private_network
                .as_deref()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }
}

/// Sends the preflight request
pub trait PreflightTransport: Send + Sync {
    fn send_preflight(&self, destination: SocketAddr) -> FirewallResult<PreflightResponse>;
}

/// [`PreflightTransport`] over a blocking reqwest client
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Must not be called from inside an async runtime (reqwest's blocking
    /// client owns one).
    pub fn new(timeout: Duration) -> FirewallResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("appwall/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .connect_timeout(timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FirewallError::Preflight(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl PreflightTransport for ReqwestTransport {
    fn send_preflight(&self, destination: SocketAddr) -> FirewallResult<PreflightResponse> {
        let url = format!("http://{}/", destination);
        let response = self
            .client
            .request(reqwest::Method::OPTIONS, &url)
            .header(REQUEST_HEADER, "true")
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .map_err(|e| FirewallError::Preflight(e.to_string()))?;

        let allow_private_network = response
            .headers()
            .get(ALLOW_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(PreflightResponse {
            status: response.status().as_u16(),
            allow_private_network,
        })
    }
}

type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

pub struct PreflightProber {
    transport: Arc<dyn PreflightTransport>,
    notifier: Option<Arc<dyn NotificationSink>>,
    trusted_ttl: Duration,
    untrusted_ttl: Duration,
    ports: Vec<u16>,
    /// host:port → time of the last TRUSTED answer
    trusted: Mutex<HashMap<String, Instant>>,
    /// host:port → time of the last UNTRUSTED answer
    untrusted: Mutex<HashMap<String, Instant>>,
    clock: Clock,
}

impl PreflightProber {
    pub fn new(transport: Arc<dyn PreflightTransport>, config: &PreflightConfig) -> Self {
        Self {
            transport,
            notifier: None,
            trusted_ttl: Duration::from_secs(config.trusted_ttl_secs),
            untrusted_ttl: Duration::from_secs(config.untrusted_ttl_secs),
            ports: config.ports.clone(),
            trusted: Mutex::new(HashMap::new()),
            untrusted: Mutex::new(HashMap::new()),
            clock: Arc::new(Instant::now),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the time source (tests)
    pub fn with_clock(mut self, clock: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Plaintext HTTP port eligible for a preflight
    pub fn is_probe_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Answer from cache if fresh, otherwise send the preflight.
    pub fn probe(&self, destination: SocketAddr) -> ProbeOutcome {
        let key = destination.to_string();

        if let Some(trust) = self.cached(&key) {
            debug!("Preflight cache hit for {}: {:?}", key, trust);
            return ProbeOutcome { trust, cached: true };
        }

        let trust = match self.transport.send_preflight(destination) {
            Ok(response) if response.grants_access() => Trust::Trusted,
            Ok(response) => {
                debug!(
                    "Preflight to {} refused: status {}, {}: {:?}",
                    key, response.status, ALLOW_HEADER, response.allow_private_network
                );
                Trust::Untrusted
            }
            Err(e) => {
                warn!("Preflight to {} failed: {}", key, e);
                Trust::Untrusted
            }
        };

        self.record(&key, trust);
        self.notify(&key, trust);
        ProbeOutcome {
            trust,
            cached: false,
        }
    }

    fn cached(&self, key: &str) -> Option<Trust> {
        let now = (self.clock)();

        if let Some(at) = self.trusted.lock().get(key) {
            if now.saturating_duration_since(*at) < self.trusted_ttl {
                return Some(Trust::Trusted);
            }
        }
        if let Some(at) = self.untrusted.lock().get(key) {
            if now.saturating_duration_since(*at) < self.untrusted_ttl {
                return Some(Trust::Untrusted);
            }
        }
        None
    }

    fn record(&self, key: &str, trust: Trust) {
        let now = (self.clock)();
        let (write, evict, ttl) = match trust {
            Trust::Trusted => (&self.trusted, &self.untrusted, self.trusted_ttl),
            Trust::Untrusted => (&self.untrusted, &self.trusted, self.untrusted_ttl),
        };

        evict.lock().remove(key);

        let mut table = write.lock();
        if table.len() >= PRUNE_THRESHOLD {
            table.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        }
        table.insert(key.to_string(), now);
    }

    fn notify(&self, key: &str, trust: Trust) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match trust {
            Trust::Trusted => {
                info!("Preflight to {} succeeded, allowing", key);
                notifier.post_preflight_notification(
                    key,
                    "Local device allowed",
                    &format!("{} accepts requests from the local network", key),
                );
            }
            Trust::Untrusted => notifier.post_preflight_notification(
                key,
                "Preflight failed",
                &format!("{} did not opt in to local network access; traffic blocked", key),
            ),
        }
    }

    /// Drop both caches
    pub fn clear(&self) {
        self.trusted.lock().clear();
        self.untrusted.lock().clear();
    }

    /// (trusted, untrusted) entry counts
    pub fn cache_sizes(&self) -> (usize, usize) {
        (self.trusted.lock().len(), self.untrusted.lock().len())
    }
}
