//! Connection Owner Resolver
//!
//! Maps a packet's socket pair to the uid that owns the socket. The OS
//! lookup behind [`OwnerLookup`] is unreliable for UDP and for mixed
//! IPv4/IPv6 socket representations: a UDP socket bound to a wildcard
//! address, or a dual-stack socket that stores its peer as `::ffff:a.b.c.d`,
//! will not match the literal addresses seen in the packet.
//!
//! The resolver therefore walks an ordered list of candidate (local, remote)
//! pairs and tries each in both argument orders, returning the first uid that
//! is not a sentinel. The list is configurable since which candidates help is
//! empirically tuned per kernel.

use super::ip_header::{IpPacketHeader, TransportProtocol};
use super::FirewallResult;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// uid values returned by the lookup that mean "no owner"
const INVALID_UID: i32 = -1;
const KERNEL_UID: i32 = 0;

/// OS facility mapping a socket pair to its owning uid.
///
/// Implementations return `Ok(-1)` (or an error) when nothing matches.
pub trait OwnerLookup: Send + Sync {
    fn lookup_owner_uid(
        &self,
        protocol: TransportProtocol,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> FirewallResult<i32>;
}

/// One way of rewriting the packet's (local, remote) pair before lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    /// Addresses exactly as seen in the packet
    Exact,
    /// IPv4 addresses rewritten as `::ffff:a.b.c.d` (dual-stack sockets)
    Ipv4Mapped,
    /// Local endpoint with an unspecified remote (unconnected UDP sockets)
    WildcardRemote,
    /// Local port on the unspecified address (sockets bound to INADDR_ANY)
    WildcardLocalAddress,
    /// IPv4-mapped local endpoint with an unspecified IPv6 remote
    MappedWildcardRemote,
}

impl CandidateKind {
    /// Default order: cheapest and most specific first.
    pub fn default_order() -> Vec<Self> {
        vec![
            Self::Exact,
            Self::Ipv4Mapped,
            Self::WildcardRemote,
            Self::WildcardLocalAddress,
            Self::MappedWildcardRemote,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Ipv4Mapped => "ipv4_mapped",
            Self::WildcardRemote => "wildcard_remote",
            Self::WildcardLocalAddress => "wildcard_local_address",
            Self::MappedWildcardRemote => "mapped_wildcard_remote",
        }
    }

    /// Build the (local, remote) pair for this candidate, or `None` when the
    /// rewrite does not apply to the address family.
    pub fn pair(self, local: SocketAddr, remote: SocketAddr) -> Option<(SocketAddr, SocketAddr)> {
        match self {
            Self::Exact => Some((local, remote)),
            Self::Ipv4Mapped => Some((to_mapped(local)?, to_mapped(remote)?)),
            Self::WildcardRemote => Some((local, SocketAddr::new(unspecified_like(local.ip()), 0))),
            Self::WildcardLocalAddress => {
                Some((SocketAddr::new(unspecified_like(local.ip()), local.port()), remote))
            }
            Self::MappedWildcardRemote => Some((
                to_mapped(local)?,
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            )),
        }
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn to_mapped(addr: SocketAddr) -> Option<SocketAddr> {
    match addr.ip() {
        IpAddr::V4(v4) => Some(SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port())),
        IpAddr::V6(_) => None,
    }
}

fn is_sentinel(uid: i32) -> bool {
    uid == INVALID_UID || uid == KERNEL_UID
}

/// Candidate-walking resolver over an [`OwnerLookup`]
pub struct OwnerResolver {
    lookup: Arc<dyn OwnerLookup>,
    candidates: Vec<CandidateKind>,
}

impl OwnerResolver {
    pub fn new(lookup: Arc<dyn OwnerLookup>, candidates: Vec<CandidateKind>) -> Self {
        Self { lookup, candidates }
    }

    pub fn with_default_candidates(lookup: Arc<dyn OwnerLookup>) -> Self {
        Self::new(lookup, CandidateKind::default_order())
    }

    pub fn candidates(&self) -> &[CandidateKind] {
        &self.candidates
    }

    /// Resolve the uid owning the packet's socket. `None` when every
    /// candidate fails or the protocol has no sockets to look up.
    pub fn resolve_owner_uid(&self, header: &IpPacketHeader) -> Option<u32> {
        if !header.protocol.is_tcp_or_udp() {
            return None;
        }
        self.resolve(header.protocol, header.source, header.destination)
    }

    /// Resolve for an explicit (local, remote) pair.
    pub fn resolve(
        &self,
        protocol: TransportProtocol,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<u32> {
        for kind in &self.candidates {
            let Some((a, b)) = kind.pair(local, remote) else {
                continue;
            };

            for (first, second, reversed) in [(a, b, false), (b, a, true)] {
                if let Some(uid) = self.try_lookup(protocol, first, second) {
                    debug!(
                        "Owner of {} {} -> {} is uid {} (candidate {}{})",
                        protocol,
                        local,
                        remote,
                        uid,
                        kind.as_str(),
                        if reversed { ", reversed" } else { "" }
                    );
                    return Some(uid);
                }
            }
        }

        trace!("No owner for {} {} -> {}", protocol, local, remote);
        None
    }

    fn try_lookup(
        &self,
        protocol: TransportProtocol,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<u32> {
        match self.lookup.lookup_owner_uid(protocol, local, remote) {
            Ok(uid) if !is_sentinel(uid) => u32::try_from(uid).ok(),
            Ok(_) => None,
            Err(e) => {
                trace!("Owner lookup {} -> {} failed: {}", local, remote, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::ip_header::test_packets::ipv4_udp;
    use crate::vpn::FirewallError;
    use parking_lot::Mutex;

    /// Succeeds only for one exact (local, remote) argument pair and records
    /// every call.
    struct StubLookup {
        expected: Option<(SocketAddr, SocketAddr)>,
        uid: i32,
        calls: Mutex<Vec<(SocketAddr, SocketAddr)>>,
        fail_with_error: bool,
    }

    impl StubLookup {
        fn matching(local: &str, remote: &str, uid: i32) -> Self {
            Self {
                expected: Some((local.parse().unwrap(), remote.parse().unwrap())),
                uid,
                calls: Mutex::new(Vec::new()),
                fail_with_error: false,
            }
        }

        fn never() -> Self {
            Self {
                expected: None,
                uid: -1,
                calls: Mutex::new(Vec::new()),
                fail_with_error: false,
            }
        }
    }

    impl OwnerLookup for StubLookup {
        fn lookup_owner_uid(
            &self,
            _protocol: TransportProtocol,
            local: SocketAddr,
            remote: SocketAddr,
        ) -> FirewallResult<i32> {
            self.calls.lock().push((local, remote));
            if self.fail_with_error {
                return Err(FirewallError::OwnerLookup("netlink unavailable".to_string()));
            }
            if self.expected == Some((local, remote)) {
                Ok(self.uid)
            } else {
                Ok(-1)
            }
        }
    }

    fn resolver(stub: &Arc<StubLookup>) -> OwnerResolver {
        OwnerResolver::with_default_candidates(stub.clone())
    }

    const SRC: &str = "192.168.1.20:40000";
    const DST: &str = "192.168.1.50:631";

    fn resolve(stub: &Arc<StubLookup>) -> Option<u32> {
        resolver(stub).resolve(TransportProtocol::Udp, SRC.parse().unwrap(), DST.parse().unwrap())
    }

    #[test]
    fn test_exact_match_first_try() {
        let stub = Arc::new(StubLookup::matching(SRC, DST, 10123));
        assert_eq!(resolve(&stub), Some(10123));
        assert_eq!(stub.calls.lock().len(), 1);
    }

    #[test]
    fn test_reversed_argument_success() {
        let stub = Arc::new(StubLookup::matching(DST, SRC, 10123));
        assert_eq!(resolve(&stub), Some(10123));
        assert_eq!(stub.calls.lock().len(), 2);
    }

    #[test]
    fn test_ipv4_mapped_success() {
        let stub = Arc::new(StubLookup::matching(
            "[::ffff:192.168.1.20]:40000",
            "[::ffff:192.168.1.50]:631",
            10200,
        ));
        assert_eq!(resolve(&stub), Some(10200));
    }

    #[test]
    fn test_wildcard_remote_success() {
        let stub = Arc::new(StubLookup::matching(SRC, "0.0.0.0:0", 10300));
        assert_eq!(resolve(&stub), Some(10300));
    }

    #[test]
    fn test_reversed_wildcard_address_success() {
        // Only the reversed argument order of the wildcard-local candidate matches
        let stub = Arc::new(StubLookup::matching(DST, "0.0.0.0:40000", 10400));
        assert_eq!(resolve(&stub), Some(10400));

        let calls = stub.calls.lock();
        let last = calls.last().unwrap();
        assert_eq!(last.0, DST.parse::<SocketAddr>().unwrap());
        assert_eq!(last.1, "0.0.0.0:40000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let stub = Arc::new(StubLookup::never());
        assert_eq!(resolve(&stub), None);
        // Every candidate applies to IPv4, each tried in two orders
        assert_eq!(stub.calls.lock().len(), CandidateKind::default_order().len() * 2);
    }

    #[test]
    fn test_sentinel_uids_are_not_owners() {
        let root = Arc::new(StubLookup::matching(SRC, DST, 0));
        assert_eq!(resolve(&root), None);

        let invalid = Arc::new(StubLookup::matching(SRC, DST, -1));
        assert_eq!(resolve(&invalid), None);
    }

    #[test]
    fn test_lookup_errors_are_treated_as_no_data() {
        let mut stub = StubLookup::matching(SRC, DST, 10123);
        stub.fail_with_error = true;
        let stub = Arc::new(stub);
        assert_eq!(resolve(&stub), None);
    }

    #[test]
    fn test_ipv6_skips_mapped_candidates() {
        let stub = Arc::new(StubLookup::never());
        let resolved = resolver(&stub).resolve(
            TransportProtocol::Tcp,
            "[fd00::1]:5000".parse().unwrap(),
            "[fd00::2]:80".parse().unwrap(),
        );
        assert_eq!(resolved, None);
        // exact, wildcard remote, wildcard local address
        assert_eq!(stub.calls.lock().len(), 6);
    }

    #[test]
    fn test_custom_candidate_list_is_honoured() {
        let stub = Arc::new(StubLookup::matching(SRC, "0.0.0.0:0", 10300));
        let resolver = OwnerResolver::new(stub.clone(), vec![CandidateKind::Exact]);
        assert_eq!(
            resolver.resolve(TransportProtocol::Udp, SRC.parse().unwrap(), DST.parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_resolve_from_header_ignores_non_transport_protocols() {
        let stub = Arc::new(StubLookup::matching(SRC, DST, 10123));
        let packet = ipv4_udp(
            ("192.168.1.20".parse().unwrap(), 40000),
            ("192.168.1.50".parse().unwrap(), 631),
            b"x",
        );
        let header = IpPacketHeader::parse(&packet).unwrap();
        assert_eq!(resolver(&stub).resolve_owner_uid(&header), Some(10123));

        let mut icmp = header.clone();
        icmp.protocol = TransportProtocol::Icmp;
        assert_eq!(resolver(&stub).resolve_owner_uid(&icmp), None);
    }

    #[test]
    fn test_candidate_kind_serde_names() {
        let json = serde_json::to_string(&CandidateKind::WildcardLocalAddress).unwrap();
        assert_eq!(json, "\"wildcard_local_address\"");
    }
}
