//! Packet path for appwall
//!
//! This module holds everything between the virtual interface and the
//! forward/drop outcome for a single packet.
//!
//! ## Architecture
//!
//! - ip_header.rs: Raw IPv4/IPv6 header parsing
//! - owner_resolver.rs: Maps a packet's socket pair to the owning uid (candidate retries)
//! - proc_net.rs: Linux /proc/net socket tables as the owner lookup facility
//! - policy_cache.rs: Lock-free per-app policy map and scalar settings
//! - policy_store.rs: Live policy stream (settings file) feeding the caches
//! - preflight.rs: Private-network preflight probe with trusted/untrusted caches
//! - dpi.rs: Serialized bridge to the payload classifier
//! - decision.rs: Layered per-packet policy decision
//! - flow.rs: Traffic flow records and fire-and-forget persistence
//! - packet_writer.rs: Outbound writer thread back into the interface
//! - packet_loop.rs: Reader thread, dispatch and lifecycle
//! - adapter.rs: tun device backing the virtual interface
//! - routes.rs: LAN destinations routed into the interface

pub mod adapter;
pub mod decision;
pub mod dpi;
pub mod error_messages;
pub mod flow;
pub mod flow_table;
pub mod ip_header;
pub mod owner_resolver;
pub mod packet_loop;
pub mod packet_writer;
pub mod policy_cache;
pub mod policy_store;
pub mod preflight;
pub mod proc_net;
pub mod routes;

pub use adapter::TunAdapter;
pub use decision::{Decision, DecisionEngine, Verdict};
pub use dpi::{Classification, Classifier, DpiBridge, SignatureClassifier};
pub use error_messages::{short_error, user_friendly_error};
pub use flow::{FlowRecorder, FlowStore, JsonLinesFlowStore, ProtectionSession, TrafficFlow};
pub use flow_table::{FlowKey, FlowTable};
pub use ip_header::{IpPacketHeader, IpVersion, PacketParseError, TransportProtocol};
pub use owner_resolver::{CandidateKind, OwnerLookup, OwnerResolver};
pub use packet_loop::{
    reader_stop_timeout, ForwardError, InterfaceRead, LoopComponents, LoopState, LoopStats, PacketLoop,
    SessionForwarder, VirtualInterface,
};
pub use packet_writer::{PacketSink, PacketWriter, PacketWriterHandle};
pub use policy_cache::{PolicyCache, PolicyObserver};
pub use policy_store::{AccessPolicyEntry, FilePolicyStore, PolicyEvent, PolicyStore};
pub use preflight::{PreflightProber, PreflightTransport, ProbeOutcome, ReqwestTransport, Trust};
pub use proc_net::ProcNetLookup;
pub use routes::{Cidr, RouteManager};

use serde::{Deserialize, Serialize};

/// Access policy at one scope. `Default` defers to the next broader scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    #[default]
    Default = 0,
    Allow = 1,
    Block = 2,
}

impl Policy {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Allow,
            2 => Self::Block,
            _ => Self::Default,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for `Allow` and `Block`.
    pub fn is_explicit(self) -> bool {
        self != Self::Default
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firewall errors
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("Malformed packet: {0}")]
    Parse(#[from] PacketParseError),

    #[error("Owner lookup failed: {0}")]
    OwnerLookup(String),

    #[error("Preflight probe failed: {0}")]
    Preflight(String),

    #[error("DPI classification failed: {0}")]
    Dpi(String),

    #[error("Forwarding failed: {0}")]
    Forwarding(#[from] ForwardError),

    #[error("Virtual interface closed")]
    InterfaceClosed,

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FirewallResult<T> = Result<T, FirewallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_u8_roundtrip_and_fallback() {
        for policy in [Policy::Default, Policy::Allow, Policy::Block] {
            assert_eq!(Policy::from_u8(policy.as_u8()), policy);
        }
        assert_eq!(Policy::from_u8(42), Policy::Default);
    }

    #[test]
    fn test_policy_serde_uses_uppercase_names() {
        assert_eq!(serde_json::to_string(&Policy::Block).unwrap(), "\"BLOCK\"");
        let parsed: Policy = serde_json::from_str("\"ALLOW\"").unwrap();
        assert_eq!(parsed, Policy::Allow);
    }

    #[test]
    fn test_firewall_error_display_interface_closed() {
        assert_eq!(FirewallError::InterfaceClosed.to_string(), "Virtual interface closed");
    }

    #[test]
    fn test_firewall_error_display_route() {
        let err = FirewallError::Route("ip route add failed".to_string());
        assert_eq!(err.to_string(), "Route error: ip route add failed");
    }

    #[test]
    fn test_firewall_error_from_parse_error() {
        let err: FirewallError = PacketParseError::Empty.into();
        assert!(matches!(err, FirewallError::Parse(PacketParseError::Empty)));
    }

    #[test]
    fn test_firewall_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: FirewallError = io_err.into();
        match err {
            FirewallError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("Expected FirewallError::Io, got {:?}", other),
        }
    }
}
