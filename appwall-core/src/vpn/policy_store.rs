//! Policy Store - live view of the persisted policy
//!
//! The engine never writes policy; it subscribes to a [`PolicyStore`] and
//! receives [`PolicyEvent`]s. A new subscriber first gets the full current
//! state, then only what changed (distinct-until-changed per value).
//!
//! [`FilePolicyStore`] polls the settings file on a background thread.

use crate::settings::{read_settings, AppSettings, FirewallSettings};
use crate::utils::join_with_timeout;
use crate::vpn::Policy;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Stop-flag check granularity while sleeping between polls
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// One persisted per-app override
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPolicyEntry {
    pub package_name: String,
    pub policy: Policy,
}

/// A change in the persisted policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// The full per-app list (always complete, never a patch)
    AccessPolicies(Vec<AccessPolicyEntry>),
    DefaultPolicy(Policy),
    SystemAppsPolicy(Policy),
    AllowMulticast(bool),
    AllowDns(bool),
    HideMulticastNotification(bool),
    HideDnsNotification(bool),
}

/// Source of policy events
pub trait PolicyStore: Send + Sync {
    /// Subscribe to the live view. The channel closes when the store stops.
    fn subscribe(&self) -> Receiver<PolicyEvent>;
}

/// The slice of settings the engine listens to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyState {
    pub firewall: FirewallSettings,
    pub access_policies: Vec<AccessPolicyEntry>,
}

impl From<&AppSettings> for PolicyState {
    fn from(settings: &AppSettings) -> Self {
        Self {
            firewall: settings.firewall.clone(),
            access_policies: settings.access_policies.clone(),
        }
    }
}

/// Events turning `prev` into `next`. With no `prev`, the full state.
pub fn diff_states(prev: Option<&PolicyState>, next: &PolicyState) -> Vec<PolicyEvent> {
    let mut events = Vec::new();
    let next_fw = &next.firewall;

    if prev.map_or(true, |p| p.access_policies != next.access_policies) {
        events.push(PolicyEvent::AccessPolicies(next.access_policies.clone()));
    }

    let prev_fw = prev.map(|p| &p.firewall);
    let changed = |f: fn(&FirewallSettings) -> Policy| prev_fw.map_or(true, |p| f(p) != f(next_fw));
    if changed(|fw| fw.default_policy) {
        events.push(PolicyEvent::DefaultPolicy(next_fw.default_policy));
    }
    if changed(|fw| fw.system_apps_policy) {
        events.push(PolicyEvent::SystemAppsPolicy(next_fw.system_apps_policy));
    }

    let flag_changed = |f: fn(&FirewallSettings) -> bool| prev_fw.map_or(true, |p| f(p) != f(next_fw));
    if flag_changed(|fw| fw.allow_multicast) {
        events.push(PolicyEvent::AllowMulticast(next_fw.allow_multicast));
    }
    if flag_changed(|fw| fw.allow_dns) {
        events.push(PolicyEvent::AllowDns(next_fw.allow_dns));
    }
    if flag_changed(|fw| fw.hide_multicast_notification) {
        events.push(PolicyEvent::HideMulticastNotification(
            next_fw.hide_multicast_notification,
        ));
    }
    if flag_changed(|fw| fw.hide_dns_notification) {
        events.push(PolicyEvent::HideDnsNotification(next_fw.hide_dns_notification));
    }

    events
}

struct StoreShared {
    subscribers: Mutex<Vec<Sender<PolicyEvent>>>,
    last: Mutex<Option<PolicyState>>,
}

impl StoreShared {
    fn publish(&self, next: PolicyState) {
        let events = {
            let mut last = self.last.lock();
            let events = diff_states(last.as_ref(), &next);
            *last = Some(next);
            events
        };
        if events.is_empty() {
            return;
        }

        debug!("Policy store publishing {} change(s)", events.len());
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }
}

/// [`PolicyStore`] over the JSON settings file
pub struct FilePolicyStore {
    path: PathBuf,
    poll_interval: Duration,
    shared: Arc<StoreShared>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            shared: Arc::new(StoreShared {
                subscribers: Mutex::new(Vec::new()),
                last: Mutex::new(None),
            }),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Read the file once and publish what changed.
    pub fn poll_once(&self) {
        poll_file(&self.path, &self.shared);
    }

    /// Start polling on a background thread
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("Policy store already running");
            return Ok(());
        }

        self.poll_once();
        self.stop_flag.store(false, Ordering::SeqCst);

        let path = self.path.clone();
        let shared = Arc::clone(&self.shared);
        let stop_flag = Arc::clone(&self.stop_flag);
        let interval = self.poll_interval;

        *handle = Some(
            thread::Builder::new()
                .name("appwall-policy-store".to_string())
                .spawn(move || {
                    while !stop_flag.load(Ordering::Relaxed) {
                        let mut slept = Duration::ZERO;
                        while slept < interval && !stop_flag.load(Ordering::Relaxed) {
                            thread::sleep(STOP_CHECK_INTERVAL);
                            slept += STOP_CHECK_INTERVAL;
                        }
                        if !stop_flag.load(Ordering::Relaxed) {
                            poll_file(&path, &shared);
                        }
                    }
                })?,
        );

        info!("Watching {:?} for policy changes", self.path);
        Ok(())
    }

    /// Stop polling and close every subscriber channel
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, "Policy store");
        }
        self.shared.subscribers.lock().clear();
    }
}

impl Drop for FilePolicyStore {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PolicyStore for FilePolicyStore {
    fn subscribe(&self) -> Receiver<PolicyEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();

        // Replay the current state so the subscriber starts complete
        let mut subscribers = self.shared.subscribers.lock();
        if let Some(state) = self.shared.last.lock().as_ref() {
            for event in diff_states(None, state) {
                let _ = tx.send(event);
            }
        }
        subscribers.push(tx);
        rx
    }
}

fn poll_file(path: &Path, shared: &StoreShared) {
    let state = if path.exists() {
        match read_settings(path) {
            Ok(settings) => PolicyState::from(&settings),
            Err(e) => {
                // Probably caught mid-write; keep the last good state
                warn!("Ignoring unreadable policy file {:?}: {}", path, e);
                return;
            }
        }
    } else {
        PolicyState::default()
    };
    shared.publish(state);
}
