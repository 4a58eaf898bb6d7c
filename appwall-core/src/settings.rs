//! Settings persistence module
//!
//! Saves and loads firewall settings to/from disk. The same file is the
//! daemon's policy store: it is re-read while the firewall runs and every
//! change is pushed into the caches (see `vpn::policy_store`).

use crate::vpn::owner_resolver::CandidateKind;
use crate::vpn::policy_store::AccessPolicyEntry;
use crate::vpn::Policy;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";
const APP_NAME: &str = "appwall";
const FLOW_LOG_FILE: &str = "flows.jsonl";

/// Global firewall switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSettings {
    /// Policy for apps without an explicit entry
    #[serde(default = "default_allow")]
    pub default_policy: Policy,
    /// Policy for system apps when the default policy is not ALLOW
    #[serde(default = "default_allow")]
    pub system_apps_policy: Policy,
    /// Let multicast/broadcast through even when the default is BLOCK
    #[serde(default)]
    pub allow_multicast: bool,
    /// Let DNS (port 53) through even when the default is BLOCK
    #[serde(default)]
    pub allow_dns: bool,
    #[serde(default)]
    pub hide_multicast_notification: bool,
    #[serde(default)]
    pub hide_dns_notification: bool,
}

fn default_allow() -> Policy {
    Policy::Allow
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            default_policy: Policy::Allow,
            system_apps_policy: Policy::Allow,
            allow_multicast: false,
            allow_dns: false,
            hide_multicast_notification: false,
            hide_dns_notification: false,
        }
    }
}

/// Preflight prober tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "default_trusted_ttl")]
    pub trusted_ttl_secs: u64,
    #[serde(default = "default_untrusted_ttl")]
    pub untrusted_ttl_secs: u64,
    /// Connect and read timeout for the probe request
    #[serde(default = "default_preflight_timeout")]
    pub timeout_secs: u64,
    /// Plaintext HTTP ports eligible for probing
    #[serde(default = "default_preflight_ports")]
    pub ports: Vec<u16>,
}

fn default_trusted_ttl() -> u64 {
    5 * 60
}

fn default_untrusted_ttl() -> u64 {
    30 * 60
}

fn default_preflight_timeout() -> u64 {
    5
}

fn default_preflight_ports() -> Vec<u16> {
    vec![80, 8080, 8081]
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            trusted_ttl_secs: default_trusted_ttl(),
            untrusted_ttl_secs: default_untrusted_ttl(),
            timeout_secs: default_preflight_timeout(),
            ports: default_preflight_ports(),
        }
    }
}

/// Packet engine configuration. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    /// Address/prefix for the tun device (link-local so it never collides
    /// with the real LAN)
    #[serde(default = "default_interface_ipv4")]
    pub interface_ipv4: String,
    #[serde(default = "default_interface_ipv6")]
    pub interface_ipv6: String,
    /// Route the LAN ranges into the tun device on start
    #[serde(default = "default_true")]
    pub install_routes: bool,
    /// Policy-routing table holding the LAN routes
    #[serde(default = "default_route_table")]
    pub route_table: u32,
    /// Firewall mark of forwarded packets; marked traffic skips `route_table`
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    #[serde(default)]
    pub preflight: PreflightConfig,
    /// Ordered owner-lookup candidates
    #[serde(default = "CandidateKind::default_order")]
    pub owner_candidates: Vec<CandidateKind>,
    #[serde(default = "default_queue_capacity")]
    pub writer_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub flow_queue_capacity: usize,
    /// Where flow records are appended (JSON lines)
    #[serde(default = "default_flow_log_path")]
    pub flow_log_path: PathBuf,
    /// An allowed flow with no packets for this long is written out
    #[serde(default = "default_flow_idle_timeout")]
    pub flow_idle_timeout_secs: u64,
    /// How often the settings file is re-read for policy changes
    #[serde(default = "default_policy_poll_interval")]
    pub policy_poll_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_mtu() -> u16 {
    1500
}

fn default_interface_name() -> String {
    "appwall0".to_string()
}

fn default_interface_ipv4() -> String {
    "169.254.61.43/24".to_string()
}

fn default_interface_ipv6() -> String {
    "fe80::2b/64".to_string()
}

fn default_true() -> bool {
    true
}

fn default_route_table() -> u32 {
    0x6177
}

fn default_fwmark() -> u32 {
    0x6177
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_flow_log_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join(FLOW_LOG_FILE)
}

fn default_flow_idle_timeout() -> u64 {
    60
}

fn default_policy_poll_interval() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            interface_name: default_interface_name(),
            interface_ipv4: default_interface_ipv4(),
            interface_ipv6: default_interface_ipv6(),
            install_routes: true,
            route_table: default_route_table(),
            fwmark: default_fwmark(),
            preflight: PreflightConfig::default(),
            owner_candidates: CandidateKind::default_order(),
            writer_queue_capacity: default_queue_capacity(),
            flow_queue_capacity: default_queue_capacity(),
            flow_log_path: default_flow_log_path(),
            flow_idle_timeout_secs: default_flow_idle_timeout(),
            policy_poll_interval_ms: default_policy_poll_interval(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.mtu < 576 {
            return Err(format!("mtu {} is below the IPv4 minimum of 576", self.mtu));
        }
        if self.writer_queue_capacity == 0 || self.flow_queue_capacity == 0 {
            return Err("queue capacities must be greater than zero".to_string());
        }
        if self.owner_candidates.is_empty() {
            return Err("owner_candidates must name at least one candidate".to_string());
        }
        // 253-255 are the kernel's default, main and local tables
        if self.install_routes && (self.route_table == 0 || (253..=255).contains(&self.route_table)) {
            return Err(format!("route_table {} is reserved", self.route_table));
        }
        if self.fwmark == 0 {
            return Err("fwmark must be non-zero".to_string());
        }
        if self.flow_idle_timeout_secs == 0 {
            return Err("flow_idle_timeout_secs must be greater than zero".to_string());
        }
        if self.preflight.timeout_secs == 0 {
            return Err("preflight.timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Everything persisted in settings.json
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub firewall: FirewallSettings,
    /// Per-app overrides
    #[serde(default)]
    pub access_policies: Vec<AccessPolicyEntry>,
    /// Package names never treated as system apps
    #[serde(default)]
    pub no_system_override: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Get the settings directory path
/// Linux: ~/.config/appwall/
fn get_settings_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME))
}

/// Get the full path to the settings file
pub fn settings_path() -> Option<PathBuf> {
    get_settings_dir().map(|p| p.join(SETTINGS_FILE))
}

/// Load settings from the default location
pub fn load_settings() -> AppSettings {
    match settings_path() {
        Some(path) => load_settings_from(&path),
        None => {
            debug!("Could not determine settings path, using defaults");
            AppSettings::default()
        }
    }
}

/// Load settings from `path`, falling back to defaults if it is missing or
/// unreadable.
pub fn load_settings_from(path: &Path) -> AppSettings {
    if !path.exists() {
        debug!("Settings file {:?} does not exist, using defaults", path);
        return AppSettings::default();
    }

    match read_settings(path) {
        Ok(settings) => {
            info!("Loaded settings from {:?}", path);
            settings
        }
        Err(e) => {
            error!("{}", e);
            AppSettings::default()
        }
    }
}

/// Strict read used by the policy store: a half-written or corrupt file is an
/// error, not a reset to defaults.
pub fn read_settings(path: &Path) -> Result<AppSettings, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read settings file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings file: {}", e))
}

/// Save settings to the default location
pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    let path = settings_path().ok_or_else(|| "Could not determine settings directory".to_string())?;
    save_settings_to(settings, &path)
}

/// Save settings to `path`, creating its directory if needed
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }
    }

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    fs::write(path, json).map_err(|e| format!("Failed to write settings file: {}", e))?;
    info!("Saved settings to {:?}", path);
    Ok(())
}
