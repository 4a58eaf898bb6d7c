//! Allowed-flow accounting
//!
//! Allowed packets leave through the forwarder and their replies go straight
//! to the application, so only the egress side of a connection is seen here.
//! Each local/remote socket pair gets one [`TrafficFlow`], classified on its
//! first inspectable packet. A flow is handed back for recording when the
//! connection resets, when it lingers past a FIN, when it goes idle, or when
//! the table is drained on stop.
//!
//! Owned by the reader thread, so there is no locking.

use super::dpi::DpiBridge;
use super::flow::TrafficFlow;
use super::ip_header::{IpPacketHeader, TransportProtocol, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
use super::Policy;
use crate::apps::ApplicationIdentity;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on concurrently tracked flows
pub const MAX_TRACKED_FLOWS: usize = 4096;

/// Time a flow stays open after the local FIN, for the closing ACKs
const FIN_LINGER: Duration = Duration::from_secs(5);

/// Minimum spacing between expiry sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Local/remote socket pair over one transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: TransportProtocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn of(header: &IpPacketHeader) -> Self {
        Self {
            protocol: header.protocol,
            local: header.source,
            remote: header.destination,
        }
    }
}

struct TrackedFlow {
    flow: TrafficFlow,
    last_seen: Instant,
    inspected: bool,
    closing: bool,
}

pub struct FlowTable {
    flows: HashMap<FlowKey, TrackedFlow>,
    idle_timeout: Duration,
    capacity: usize,
    last_sweep: Option<Instant>,
}

impl FlowTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_capacity(idle_timeout, MAX_TRACKED_FLOWS)
    }

    pub fn with_capacity(idle_timeout: Duration, capacity: usize) -> Self {
        Self {
            flows: HashMap::with_capacity(capacity.min(256)),
            idle_timeout,
            capacity,
            last_sweep: None,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Account one allowed outbound packet. Returns a finished flow when the
    /// packet resets the connection, or when the table is full and the
    /// packet has to be recorded on its own.
    pub fn observe(
        &mut self,
        packet: &[u8],
        header: &IpPacketHeader,
        app: Arc<ApplicationIdentity>,
        dpi: &DpiBridge,
        now: Instant,
    ) -> Option<TrafficFlow> {
        let key = FlowKey::of(header);

        if !self.flows.contains_key(&key) && self.flows.len() >= self.capacity {
            let mut flow = allowed_flow(header, app);
            flow.increase_egress(1, header.size as u64);
            if let Some(classification) = dpi.inspect(packet, header) {
                flow.apply_classification(classification);
            }
            return Some(flow);
        }

        let tracked = self.flows.entry(key).or_insert_with(|| TrackedFlow {
            flow: allowed_flow(header, app),
            last_seen: now,
            inspected: false,
            closing: false,
        });
        tracked.last_seen = now;
        tracked.flow.increase_egress(1, header.size as u64);

        if !tracked.inspected && header.should_inspect() {
            tracked.inspected = true;
            if let Some(classification) = dpi.inspect(packet, header) {
                tracked.flow.apply_classification(classification);
            }
        }

        let flags = header.tcp_flags(packet).unwrap_or(0);
        // The local ACK of the peer's SYN-ACK completes the handshake
        if flags & TCP_ACK != 0 && flags & TCP_SYN == 0 {
            tracked.flow.tcp_established_reached = true;
        }
        if flags & TCP_FIN != 0 {
            tracked.closing = true;
        }
        if flags & TCP_RST != 0 {
            return self.flows.remove(&key).map(|tracked| tracked.flow);
        }
        None
    }

    /// Remove flows that went idle, or that lingered long enough after a
    /// FIN. Sweeps at most once per [`SWEEP_INTERVAL`].
    pub fn expire(&mut self, now: Instant) -> Vec<TrafficFlow> {
        if self
            .last_sweep
            .is_some_and(|last| now.saturating_duration_since(last) < SWEEP_INTERVAL)
        {
            return Vec::new();
        }
        self.last_sweep = Some(now);

        let idle_timeout = self.idle_timeout;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, tracked)| {
                let limit = if tracked.closing {
                    FIN_LINGER.min(idle_timeout)
                } else {
                    idle_timeout
                };
                now.saturating_duration_since(tracked.last_seen) >= limit
            })
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.flows.remove(&key))
            .map(|tracked| tracked.flow)
            .collect()
    }

    /// Everything still tracked
    pub fn drain(&mut self) -> Vec<TrafficFlow> {
        self.flows.drain().map(|(_, tracked)| tracked.flow).collect()
    }
}

fn allowed_flow(header: &IpPacketHeader, app: Arc<ApplicationIdentity>) -> TrafficFlow {
    let app = (!app.is_unknown()).then_some(app);
    TrafficFlow::new(
        app,
        header.destination,
        header.source,
        header.protocol,
        Policy::Allow,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::dpi::SignatureClassifier;
    use crate::vpn::ip_header::test_packets::*;
    use std::net::Ipv4Addr;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
    const PRINTER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    fn printer() -> Arc<ApplicationIdentity> {
        Arc::new(ApplicationIdentity::new("printer-app", "Printer", false))
    }

    fn dpi() -> DpiBridge {
        DpiBridge::new(Box::new(SignatureClassifier::new()))
    }

    fn observe(table: &mut FlowTable, packet: &[u8], now: Instant) -> Option<TrafficFlow> {
        let header = IpPacketHeader::parse(packet).unwrap();
        table.observe(packet, &header, printer(), &dpi(), now)
    }

    fn dns_query() -> Vec<u8> {
        let mut query = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(b"\x07printer\x05local\x00\x00\x01\x00\x01");
        ipv4_udp((LOCAL, 40001), (Ipv4Addr::new(192, 168, 1, 1), 53), &query)
    }

    #[test]
    fn test_packets_of_one_socket_pair_share_a_flow() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let now = Instant::now();
        let packet = ipv4_udp((LOCAL, 40000), (PRINTER, 631), b"print job");

        assert!(observe(&mut table, &packet, now).is_none());
        assert!(observe(&mut table, &packet, now).is_none());
        assert_eq!(table.len(), 1);

        let other = ipv4_udp((LOCAL, 40002), (PRINTER, 631), b"print job");
        assert!(observe(&mut table, &other, now).is_none());
        assert_eq!(table.len(), 2);

        let mut flows = table.drain();
        flows.sort_by_key(|flow| flow.local.port());
        assert_eq!(flows[0].packet_count_egress, 2);
        assert_eq!(flows[0].data_egress, 2 * packet.len() as u64);
        assert_eq!(flows[0].applied_policy, Policy::Allow);
        assert_eq!(flows[0].app_id(), "printer-app");
        assert_eq!(flows[1].packet_count_egress, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_first_inspectable_packet_is_classified() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        observe(&mut table, &dns_query(), Instant::now());

        let flows = table.drain();
        assert_eq!(flows[0].dpi_protocol.as_deref(), Some("DNS"));
        assert_eq!(flows[0].detected_protocols, vec!["DNS".to_string()]);
    }

    #[test]
    fn test_tcp_handshake_and_reset() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let now = Instant::now();
        let syn = ipv4_tcp_flags((LOCAL, 50000), (PRINTER, 80), TCP_SYN, &[]);
        let ack = ipv4_tcp_flags((LOCAL, 50000), (PRINTER, 80), TCP_ACK, &[]);
        let rst = ipv4_tcp_flags((LOCAL, 50000), (PRINTER, 80), TCP_RST, &[]);

        assert!(observe(&mut table, &syn, now).is_none());
        assert!(observe(&mut table, &ack, now).is_none());
        let flow = observe(&mut table, &rst, now).unwrap();

        assert!(flow.tcp_established_reached);
        assert_eq!(flow.packet_count_egress, 3);
        assert!(table.is_empty());
        assert_eq!(flow.to_export_json()["tcp_established_reached"], true);
    }

    #[test]
    fn test_syn_only_flow_never_established() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let syn = ipv4_tcp_flags((LOCAL, 50000), (PRINTER, 80), TCP_SYN, &[]);
        observe(&mut table, &syn, Instant::now());
        assert!(!table.drain()[0].tcp_established_reached);
    }

    #[test]
    fn test_fin_lingers_then_expires() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let start = Instant::now();
        let fin = ipv4_tcp_flags((LOCAL, 50000), (PRINTER, 80), TCP_FIN | TCP_ACK, &[]);
        observe(&mut table, &fin, start);

        assert!(table.expire(start + Duration::from_secs(2)).is_empty());
        let expired = table.expire(start + FIN_LINGER);
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_idle_flow_expires_after_timeout() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let start = Instant::now();
        observe(&mut table, &ipv4_udp((LOCAL, 40000), (PRINTER, 631), b"job"), start);

        assert!(table.expire(start + Duration::from_secs(59)).is_empty());
        // Too soon after the previous sweep
        assert!(table.expire(start + Duration::from_millis(59_500)).is_empty());
        assert_eq!(table.len(), 1);

        let expired = table.expire(start + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].packet_count_egress, 1);
    }

    #[test]
    fn test_full_table_records_packet_on_its_own() {
        let mut table = FlowTable::with_capacity(Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(observe(&mut table, &ipv4_udp((LOCAL, 40000), (PRINTER, 631), b"a"), now).is_none());

        let overflow = observe(&mut table, &ipv4_udp((LOCAL, 40001), (PRINTER, 631), b"b"), now).unwrap();
        assert_eq!(overflow.packet_count_egress, 1);
        assert_eq!(overflow.local.port(), 40001);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_owner_flow_has_no_app() {
        let mut table = FlowTable::new(Duration::from_secs(60));
        let packet = ipv4_udp((LOCAL, 40000), (PRINTER, 631), b"job");
        let header = IpPacketHeader::parse(&packet).unwrap();
        table.observe(
            &packet,
            &header,
            Arc::new(ApplicationIdentity::unknown()),
            &dpi(),
            Instant::now(),
        );
        assert!(table.drain()[0].app.is_none());
    }
}
