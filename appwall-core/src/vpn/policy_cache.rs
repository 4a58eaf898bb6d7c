//! Lock-free Policy Cache
//!
//! Per-app policies live in one immutable `HashMap` behind an `ArcSwap`. An
//! update builds a complete new map and swaps the pointer, so the packet
//! loop either sees the old map or the new one, never a mix. Old maps are
//! freed once the last reader drops its `Arc`.
//!
//! The scalar settings (global default, system-apps policy, multicast/DNS
//! switches) are independent atomics, each updated on its own event.

use super::policy_store::{AccessPolicyEntry, PolicyEvent};
use super::Policy;
use crate::settings::FirewallSettings;
use crate::utils::join_with_timeout;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the observer thread checks its stop flag
const OBSERVER_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct PolicyCache {
    /// packageName → explicit policy (atomically swapped via arc-swap)
    policies: ArcSwap<HashMap<String, Policy>>,
    /// Bumped on every map swap
    version: AtomicU64,
    default_policy: AtomicU8,
    system_apps_policy: AtomicU8,
    allow_multicast: AtomicBool,
    allow_dns: AtomicBool,
    hide_multicast_notification: AtomicBool,
    hide_dns_notification: AtomicBool,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCache {
    /// Empty map, default policy ALLOW, every switch off
    pub fn new() -> Self {
        Self::from_settings(&FirewallSettings::default(), &[])
    }

    pub fn from_settings(firewall: &FirewallSettings, entries: &[AccessPolicyEntry]) -> Self {
        let cache = Self {
            policies: ArcSwap::from_pointee(HashMap::new()),
            version: AtomicU64::new(0),
            default_policy: AtomicU8::new(Policy::Allow.as_u8()),
            system_apps_policy: AtomicU8::new(Policy::Allow.as_u8()),
            allow_multicast: AtomicBool::new(false),
            allow_dns: AtomicBool::new(false),
            hide_multicast_notification: AtomicBool::new(false),
            hide_dns_notification: AtomicBool::new(false),
        };
        cache.replace_entries(entries);
        cache.set_default_policy(firewall.default_policy);
        cache.set_system_apps_policy(firewall.system_apps_policy);
        cache.set_allow_multicast(firewall.allow_multicast);
        cache.set_allow_dns(firewall.allow_dns);
        cache.set_hide_multicast_notification(firewall.hide_multicast_notification);
        cache.set_hide_dns_notification(firewall.hide_dns_notification);
        cache
    }

    /// Explicit policy for `package_name`, `Default` if it has none.
    ///
    /// This is the hot path: one atomic load, no locks.
    #[inline]
    pub fn effective_policy(&self, package_name: &str) -> Policy {
        self.policies
            .load()
            .get(package_name)
            .copied()
            .unwrap_or(Policy::Default)
    }

    /// Swap in a complete new mapping.
    pub fn replace_all(&self, mapping: HashMap<String, Policy>) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Policy map v{}: {} app(s)", version, mapping.len());
        self.policies.store(Arc::new(mapping));
    }

    /// Build a mapping from persisted entries and swap it in. `Default`
    /// entries are dropped since absence already means `Default`.
    pub fn replace_entries(&self, entries: &[AccessPolicyEntry]) {
        let mapping = entries
            .iter()
            .filter(|e| e.policy.is_explicit())
            .map(|e| (e.package_name.clone(), e.policy))
            .collect();
        self.replace_all(mapping);
    }

    /// Current map (for diagnostics)
    pub fn snapshot(&self) -> Arc<HashMap<String, Policy>> {
        self.policies.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Global default. Never `Default`.
    pub fn default_policy(&self) -> Policy {
        Policy::from_u8(self.default_policy.load(Ordering::Acquire))
    }

    /// A `Default` global default has nothing to defer to; it is stored as ALLOW.
    pub fn set_default_policy(&self, policy: Policy) {
        let policy = if policy.is_explicit() {
            policy
        } else {
            warn!("Global default policy cannot be DEFAULT, using ALLOW");
            Policy::Allow
        };
        self.default_policy.store(policy.as_u8(), Ordering::Release);
    }

    pub fn system_apps_policy(&self) -> Policy {
        Policy::from_u8(self.system_apps_policy.load(Ordering::Acquire))
    }

    pub fn set_system_apps_policy(&self, policy: Policy) {
        self.system_apps_policy.store(policy.as_u8(), Ordering::Release);
    }

    pub fn allow_multicast(&self) -> bool {
        self.allow_multicast.load(Ordering::Acquire)
    }

    pub fn set_allow_multicast(&self, value: bool) {
        self.allow_multicast.store(value, Ordering::Release);
    }

    pub fn allow_dns(&self) -> bool {
        self.allow_dns.load(Ordering::Acquire)
    }

    pub fn set_allow_dns(&self, value: bool) {
        self.allow_dns.store(value, Ordering::Release);
    }

    pub fn hide_multicast_notification(&self) -> bool {
        self.hide_multicast_notification.load(Ordering::Acquire)
    }

    pub fn set_hide_multicast_notification(&self, value: bool) {
        self.hide_multicast_notification.store(value, Ordering::Release);
    }

    pub fn hide_dns_notification(&self) -> bool {
        self.hide_dns_notification.load(Ordering::Acquire)
    }

    pub fn set_hide_dns_notification(&self, value: bool) {
        self.hide_dns_notification.store(value, Ordering::Release);
    }

    /// Apply one change notification
    pub fn apply(&self, event: PolicyEvent) {
        match event {
            PolicyEvent::AccessPolicies(entries) => self.replace_entries(&entries),
            PolicyEvent::DefaultPolicy(p) => {
                info!("Default policy is now {}", p);
                self.set_default_policy(p);
            }
            PolicyEvent::SystemAppsPolicy(p) => {
                info!("System apps policy is now {}", p);
                self.set_system_apps_policy(p);
            }
            PolicyEvent::AllowMulticast(v) => self.set_allow_multicast(v),
            PolicyEvent::AllowDns(v) => self.set_allow_dns(v),
            PolicyEvent::HideMulticastNotification(v) => self.set_hide_multicast_notification(v),
            PolicyEvent::HideDnsNotification(v) => self.set_hide_dns_notification(v),
        }
    }
}

/// Background thread feeding [`PolicyEvent`]s into a [`PolicyCache`]
pub struct PolicyObserver {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PolicyObserver {
    /// Spawn the observer. It runs until `stop()` or until the store closes
    /// the channel.
    pub fn start(cache: Arc<PolicyCache>, events: Receiver<PolicyEvent>) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_flag);

        let handle = thread::Builder::new()
            .name("appwall-policy-observer".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    match events.recv_timeout(OBSERVER_POLL_INTERVAL) {
                        Ok(event) => cache.apply(event),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("Policy stream closed");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            join_with_timeout(handle, "Policy observer");
        }
    }
}

impl Drop for PolicyObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn entry(name: &str, policy: Policy) -> AccessPolicyEntry {
        AccessPolicyEntry {
            package_name: name.to_string(),
            policy,
        }
    }

    #[test]
    fn test_absent_app_is_default() {
        let cache = PolicyCache::new();
        assert_eq!(cache.effective_policy("nobody"), Policy::Default);
        assert_eq!(cache.default_policy(), Policy::Allow);
        assert_eq!(cache.system_apps_policy(), Policy::Allow);
    }

    #[test]
    fn test_replace_all_is_wholesale() {
        let cache = PolicyCache::new();
        cache.replace_entries(&[entry("a", Policy::Block), entry("b", Policy::Allow)]);
        assert_eq!(cache.effective_policy("a"), Policy::Block);

        cache.replace_entries(&[entry("b", Policy::Block)]);
        assert_eq!(cache.effective_policy("a"), Policy::Default);
        assert_eq!(cache.effective_policy("b"), Policy::Block);
        assert_eq!(cache.version(), 3);
    }

    #[test]
    fn test_default_entries_are_not_stored() {
        let cache = PolicyCache::new();
        cache.replace_entries(&[entry("a", Policy::Default)]);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_reader_snapshot_survives_swap() {
        let cache = PolicyCache::new();
        cache.replace_entries(&[entry("a", Policy::Block)]);
        let old = cache.snapshot();
        cache.replace_entries(&[]);
        assert_eq!(old.get("a"), Some(&Policy::Block));
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_default_global_policy_is_stored_as_allow() {
        let cache = PolicyCache::new();
        cache.set_default_policy(Policy::Block);
        assert_eq!(cache.default_policy(), Policy::Block);
        cache.set_default_policy(Policy::Default);
        assert_eq!(cache.default_policy(), Policy::Allow);
    }

    #[test]
    fn test_apply_scalar_events() {
        let cache = PolicyCache::new();
        cache.apply(PolicyEvent::DefaultPolicy(Policy::Block));
        cache.apply(PolicyEvent::SystemAppsPolicy(Policy::Block));
        cache.apply(PolicyEvent::AllowMulticast(true));
        cache.apply(PolicyEvent::AllowDns(true));
        cache.apply(PolicyEvent::HideMulticastNotification(true));
        cache.apply(PolicyEvent::HideDnsNotification(true));

        assert_eq!(cache.default_policy(), Policy::Block);
        assert_eq!(cache.system_apps_policy(), Policy::Block);
        assert!(cache.allow_multicast());
        assert!(cache.allow_dns());
        assert!(cache.hide_multicast_notification());
        assert!(cache.hide_dns_notification());
    }

    #[test]
    fn test_from_settings() {
        let mut fw = FirewallSettings::default();
        fw.default_policy = Policy::Block;
        fw.allow_dns = true;
        let cache = PolicyCache::from_settings(&fw, &[entry("p", Policy::Allow)]);
        assert_eq!(cache.default_policy(), Policy::Block);
        assert!(cache.allow_dns());
        assert_eq!(cache.effective_policy("p"), Policy::Allow);
    }

    #[test]
    fn test_observer_applies_events_until_channel_closes() {
        let cache = Arc::new(PolicyCache::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut observer = PolicyObserver::start(Arc::clone(&cache), rx).unwrap();

        tx.send(PolicyEvent::AccessPolicies(vec![entry("x", Policy::Block)]))
            .unwrap();
        tx.send(PolicyEvent::DefaultPolicy(Policy::Block)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.default_policy() != Policy::Block && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.effective_policy("x"), Policy::Block);
        assert_eq!(cache.default_policy(), Policy::Block);

        drop(tx);
        observer.stop();
    }
}
