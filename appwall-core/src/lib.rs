//! appwall Core Library
//!
//! Per-application LAN firewall engine: reads raw IP packets from a virtual
//! interface, works out which application owns each flow, decides whether to
//! forward or drop it, and records blocked traffic as flow records.
//! Used by the Linux daemon.

pub mod apps;
pub mod notification;
pub mod settings;
pub mod utils;
pub mod vpn;

// Re-export commonly used items
pub use apps::{AppDirectory, AppIdentityCache, ApplicationIdentity, PasswdDirectory};
pub use notification::{LogNotificationSink, NotificationSink};
pub use settings::{
    AppSettings, EngineConfig, FirewallSettings, PreflightConfig, load_settings, save_settings,
};
pub use utils::hidden_command;
pub use vpn::{FirewallError, FirewallResult, Policy};
