//! User-Friendly Error Messages
//!
//! Converts firewall errors into short, actionable text for the daemon's
//! fatal-error output instead of raw errno values.

use super::FirewallError;

/// Convert a firewall error into a user-friendly message
pub fn user_friendly_error(error: &FirewallError) -> String {
    match error {
        FirewallError::Adapter(msg) => {
            let lc = msg.to_lowercase();
            if lc.contains("root privileges") || lc.contains("permission denied") || lc.contains("operation not permitted") {
                "Root privileges required.\n\nPlease run appwall as root or grant it CAP_NET_ADMIN.".to_string()
            } else if lc.contains("/dev/net/tun") || lc.contains("no such file") {
                "TUN device not available.\n\nPlease load the tun kernel module (modprobe tun) and try again.".to_string()
            } else if lc.contains("busy") || lc.contains("exists") {
                "Interface name already in use.\n\nPlease stop the other instance or choose a different interface_name.".to_string()
            } else {
                format!("Failed to create the virtual interface.\n\n{}", simplify_message(msg))
            }
        }

        FirewallError::Route(msg) => {
            let lc = msg.to_lowercase();
            if lc.contains("failed to run ip") {
                "Network configuration failed.\n\nPlease ensure the iproute2 `ip` tool is installed.".to_string()
            } else if lc.contains("operation not permitted") {
                "Root privileges required to add routes.\n\nPlease run appwall as root.".to_string()
            } else {
                format!("Failed to configure LAN routes.\n\n{}", simplify_message(msg))
            }
        }

        FirewallError::InterfaceClosed => {
            "The virtual interface was closed.\n\nPlease restart appwall.".to_string()
        }

        FirewallError::Forwarding(e) => {
            format!("Forwarding failed.\n\n{}", simplify_message(&e.to_string()))
        }

        FirewallError::Persistence(msg) => {
            format!("Cannot write the flow log.\n\n{}", simplify_message(msg))
        }

        FirewallError::InvalidConfig(msg) => {
            format!("Invalid configuration.\n\n{}", simplify_message(msg))
        }

        FirewallError::Parse(e) => format!("Malformed packet.\n\n{}", e),

        FirewallError::OwnerLookup(msg) => {
            format!("Cannot read the socket tables.\n\n{}", simplify_message(msg))
        }

        FirewallError::Preflight(msg) => {
            if msg.contains("timed out") || msg.contains("timeout") {
                "Local device did not answer in time.".to_string()
            } else {
                format!("Local device check failed.\n\n{}", simplify_message(msg))
            }
        }

        FirewallError::Dpi(msg) => format!("Traffic classification failed.\n\n{}", simplify_message(msg)),

        FirewallError::Io(e) => {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                "Permission denied.\n\nPlease run appwall as root.".to_string()
            } else {
                format!("System error.\n\n{}", e)
            }
        }
    }
}

/// Replace errno suffixes and long hex values, and cap the length
fn simplify_message(msg: &str) -> String {
    use std::sync::OnceLock;
    static RE_OS_ERROR: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    static RE_HEX: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();

    let mut result = msg.to_string();
    if let Some(re) = RE_OS_ERROR.get_or_init(|| regex_lite::Regex::new(r"\s*\(os error \d+\)").ok()) {
        result = re.replace_all(&result, "").to_string();
    }
    if let Some(re) = RE_HEX.get_or_init(|| regex_lite::Regex::new(r"0x[0-9a-fA-F]{8,}").ok()) {
        result = re.replace_all(&result, "[error]").to_string();
    }

    if result.chars().count() > 200 {
        let truncated: String = result.chars().take(197).collect();
        format!("{}...", truncated)
    } else {
        result
    }
}

/// Convert an error to a short status message (for status lines)
pub fn short_error(error: &FirewallError) -> &'static str {
    match error {
        FirewallError::Parse(_) => "Malformed packet",
        FirewallError::OwnerLookup(_) => "Owner lookup failed",
        FirewallError::Preflight(_) => "Preflight failed",
        FirewallError::Dpi(_) => "Classification failed",
        FirewallError::Forwarding(_) => "Forwarding failed",
        FirewallError::InterfaceClosed => "Interface closed",
        FirewallError::Adapter(_) => "Adapter setup failed",
        FirewallError::Route(_) => "Route setup failed",
        FirewallError::Persistence(_) => "Flow log failed",
        FirewallError::InvalidConfig(_) => "Invalid config",
        FirewallError::Io(_) => "System error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::ForwardError;

    #[test]
    fn test_user_friendly_root_required() {
        let error = FirewallError::Adapter("Root privileges required".to_string());
        assert!(user_friendly_error(&error).contains("Root privileges required"));
    }

    #[test]
    fn test_user_friendly_missing_tun() {
        let error = FirewallError::Adapter("open /dev/net/tun: No such file or directory".to_string());
        assert!(user_friendly_error(&error).contains("modprobe tun"));
    }

    #[test]
    fn test_user_friendly_missing_ip_tool() {
        let error = FirewallError::Route("failed to run ip: No such file or directory (os error 2)".to_string());
        assert!(user_friendly_error(&error).contains("iproute2"));
    }

    #[test]
    fn test_user_friendly_route_failure_is_simplified() {
        let error = FirewallError::Route("ip -4 route add 10.0.0.0/8 exited with 2: Invalid argument (os error 22)".to_string());
        let msg = user_friendly_error(&error);
        assert!(msg.starts_with("Failed to configure LAN routes."));
        assert!(!msg.contains("os error"));
    }

    #[test]
    fn test_simplify_message() {
        let msg = simplify_message("ioctl failed 0xC00000BB (os error 19)");
        assert_eq!(msg, "ioctl failed [error]");
    }

    #[test]
    fn test_simplify_message_truncates() {
        let msg = simplify_message(&"x".repeat(500));
        assert_eq!(msg.chars().count(), 200);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_forwarding_error_message() {
        let error = FirewallError::Forwarding(ForwardError::Unexpected("session table corrupt".to_string()));
        assert!(user_friendly_error(&error).contains("session table corrupt"));
    }

    #[test]
    fn test_short_error() {
        assert_eq!(short_error(&FirewallError::InterfaceClosed), "Interface closed");
        assert_eq!(short_error(&FirewallError::Route(String::new())), "Route setup failed");
    }
}
