//! User-facing notifications
//!
//! The engine reports allowed/blocked traffic and preflight outcomes through
//! a [`NotificationSink`]. Presentation is up to the host; the daemon uses
//! [`LogNotificationSink`], which writes them to the log.

use crate::apps::ApplicationIdentity;
use crate::vpn::Policy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Repeat notifications for the same key inside this window are dropped
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Throttle table size that triggers pruning of expired keys
const PRUNE_THRESHOLD: usize = 1024;

pub trait NotificationSink: Send + Sync {
    /// Traffic of `app` to `destination` was handled with `policy`
    fn post_policy_notification(&self, app: &ApplicationIdentity, policy: Policy, destination: SocketAddr);

    /// Outcome of a private-network preflight probe. `key` is `host:port`.
    fn post_preflight_notification(&self, key: &str, title: &str, body: &str);
}

/// Show a notification in the log
///
/// # Arguments
/// * `title` - The notification title (e.g., "printer-app blocked")
/// * `message` - The notification body (e.g., "192.168.1.50:631")
pub fn show_notification(title: &str, message: &str) {
    log::info!("[notification] {} - {}", title, message);
}

/// Log-backed sink with per-key throttling
pub struct LogNotificationSink {
    window: Duration,
    last_shown: Mutex<HashMap<String, Instant>>,
}

impl Default for LogNotificationSink {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_WINDOW)
    }
}

impl LogNotificationSink {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_shown: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` and report whether it may be shown now
    fn should_show(&self, key: String) -> bool {
        let now = Instant::now();
        let mut last_shown = self.last_shown.lock();

        if last_shown.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            last_shown.retain(|_, shown| now.duration_since(*shown) < window);
        }

        match last_shown.get(&key) {
            Some(shown) if now.duration_since(*shown) < self.window => false,
            _ => {
                last_shown.insert(key, now);
                true
            }
        }
    }
}

impl NotificationSink for LogNotificationSink {
    fn post_policy_notification(&self, app: &ApplicationIdentity, policy: Policy, destination: SocketAddr) {
        if !self.should_show(format!("policy:{}:{}", app.package_name, policy)) {
            return;
        }
        let verb = match policy {
            Policy::Block => "blocked",
            _ => "allowed",
        };
        show_notification(
            &format!("{} {} on the local network", app.display_label, verb),
            &format!("{} ({})", destination, app.package_name),
        );
    }

    fn post_preflight_notification(&self, key: &str, title: &str, body: &str) {
        if self.should_show(format!("preflight:{}", key)) {
            show_notification(title, body);
        }
    }
}
