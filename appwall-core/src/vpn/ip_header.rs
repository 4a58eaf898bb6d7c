//! IP Header Parser
//!
//! Parses the raw bytes read from the virtual interface into an
//! [`IpPacketHeader`]: version, transport protocol, both socket endpoints and
//! the packet size. Packets arrive without any link-layer framing.
//!
//! IPv6 extension headers (hop-by-hop, routing, destination options,
//! fragment, AH) are skipped to find the transport header. Non-initial
//! fragments carry no transport header, so their ports are reported as 0.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Upper bound on chained IPv6 extension headers we are willing to walk
const MAX_EXTENSION_HEADERS: usize = 8;

const DNS_PORT: u16 = 53;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

/// IP version of a parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }
}

/// Transport protocol carried by the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    IcmpV6,
    Other(u8),
}

impl TransportProtocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            58 => Self::IcmpV6,
            other => Self::Other(other),
        }
    }

    /// IANA protocol number
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::IcmpV6 => 58,
            Self::Other(n) => n,
        }
    }

    /// Only TCP and UDP sockets can be mapped back to an owner.
    pub fn is_tcp_or_udp(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::IcmpV6 => "ICMPV6",
            Self::Other(_) => "OTHER",
        }
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(n) => write!(f, "OTHER({})", n),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Why a packet could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketParseError {
    #[error("empty packet")]
    Empty,

    #[error("IP version should be 4 or 6 but was {0}")]
    UnsupportedVersion(u8),

    #[error("truncated IP header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid IPv4 header length field {0}")]
    BadHeaderLength(u8),

    #[error("IPv4 total length {total} is smaller than its header ({header})")]
    BadTotalLength { total: usize, header: usize },

    #[error("truncated {protocol} header: need {needed} bytes, have {available}")]
    TruncatedTransport {
        protocol: &'static str,
        needed: usize,
        available: usize,
    },
}

/// Parsed view of one packet's network and transport headers.
///
/// Only lives for one iteration of the packet loop; the raw bytes stay with
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacketHeader {
    pub version: IpVersion,
    pub protocol: TransportProtocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    /// Length of the IP header including options / extension headers,
    /// i.e. the offset of the transport header
    pub header_len: usize,
    /// Total packet size in bytes (IP header + payload)
    pub size: usize,
    /// Offset of the transport payload, when the transport header was parsed
    pub payload_offset: Option<usize>,
    /// Non-initial fragment (no transport header present)
    pub is_fragment: bool,
}

impl IpPacketHeader {
    /// Parse a raw IP packet. `packet` must hold exactly the bytes read.
    pub fn parse(packet: &[u8]) -> Result<Self, PacketParseError> {
        let first = *packet.first().ok_or(PacketParseError::Empty)?;
        match first >> 4 {
            4 => Self::parse_ipv4(packet),
            6 => Self::parse_ipv6(packet),
            other => Err(PacketParseError::UnsupportedVersion(other)),
        }
    }

    fn parse_ipv4(packet: &[u8]) -> Result<Self, PacketParseError> {
        ensure_len(packet, IPV4_MIN_HEADER_LEN)?;

        let ihl_field = packet[0] & 0x0F;
        let header_len = ihl_field as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(PacketParseError::BadHeaderLength(ihl_field));
        }
        ensure_len(packet, header_len)?;

        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if total_len < header_len {
            return Err(PacketParseError::BadTotalLength {
                total: total_len,
                header: header_len,
            });
        }
        ensure_len(packet, total_len)?;

        let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF;
        let protocol = TransportProtocol::from_number(packet[9]);
        let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

        Self::with_transport(
            IpVersion::V4,
            protocol,
            IpAddr::V4(src_ip),
            IpAddr::V4(dst_ip),
            &packet[..total_len],
            header_len,
            fragment_offset != 0,
        )
    }

    fn parse_ipv6(packet: &[u8]) -> Result<Self, PacketParseError> {
        ensure_len(packet, IPV6_HEADER_LEN)?;

        let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        let total_len = IPV6_HEADER_LEN + payload_len;
        ensure_len(packet, total_len)?;
        let packet = &packet[..total_len];

        let mut src = [0u8; 16];
        src.copy_from_slice(&packet[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&packet[24..40]);

        let mut next_header = packet[6];
        let mut offset = IPV6_HEADER_LEN;
        let mut is_fragment = false;

        for _ in 0..MAX_EXTENSION_HEADERS {
            match next_header {
                // Hop-by-hop, routing, destination options
                0 | 43 | 60 => {
                    ensure_len(packet, offset + 2)?;
                    let ext_len = (packet[offset + 1] as usize + 1) * 8;
                    ensure_len(packet, offset + ext_len)?;
                    next_header = packet[offset];
                    offset += ext_len;
                }
                // Fragment
                44 => {
                    ensure_len(packet, offset + 8)?;
                    let frag = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) >> 3;
                    is_fragment = frag != 0;
                    next_header = packet[offset];
                    offset += 8;
                }
                // Authentication header
                51 => {
                    ensure_len(packet, offset + 2)?;
                    let ext_len = (packet[offset + 1] as usize + 2) * 4;
                    ensure_len(packet, offset + ext_len)?;
                    next_header = packet[offset];
                    offset += ext_len;
                }
                _ => break,
            }
        }

        Self::with_transport(
            IpVersion::V6,
            TransportProtocol::from_number(next_header),
            IpAddr::V6(Ipv6Addr::from(src)),
            IpAddr::V6(Ipv6Addr::from(dst)),
            packet,
            offset,
            is_fragment,
        )
    }

    fn with_transport(
        version: IpVersion,
        protocol: TransportProtocol,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        packet: &[u8],
        header_len: usize,
        is_fragment: bool,
    ) -> Result<Self, PacketParseError> {
        let mut src_port = 0;
        let mut dst_port = 0;
        let mut payload_offset = None;

        if !is_fragment {
            let transport_min = match protocol {
                TransportProtocol::Tcp => Some(TCP_MIN_HEADER_LEN),
                TransportProtocol::Udp => Some(UDP_HEADER_LEN),
                _ => None,
            };

            if let Some(min_len) = transport_min {
                let available = packet.len().saturating_sub(header_len);
                if available < min_len {
                    return Err(PacketParseError::TruncatedTransport {
                        protocol: protocol.as_str(),
                        needed: min_len,
                        available,
                    });
                }

                let transport = &packet[header_len..];
                src_port = u16::from_be_bytes([transport[0], transport[1]]);
                dst_port = u16::from_be_bytes([transport[2], transport[3]]);

                let transport_header_len = if protocol == TransportProtocol::Tcp {
                    // Data offset counts 32-bit words and includes TCP options
                    ((transport[12] >> 4) as usize * 4).max(TCP_MIN_HEADER_LEN)
                } else {
                    UDP_HEADER_LEN
                };
                payload_offset = Some(header_len + transport_header_len);
            }
        }

        Ok(Self {
            version,
            protocol,
            source: SocketAddr::new(src_ip, src_port),
            destination: SocketAddr::new(dst_ip, dst_port),
            header_len,
            size: packet.len(),
            payload_offset,
            is_fragment,
        })
    }

    /// Bytes of transport payload (0 when the transport header was not parsed)
    pub fn payload_size(&self) -> usize {
        self.payload_offset
            .map(|offset| self.size.saturating_sub(offset))
            .unwrap_or(0)
    }

    /// True when the transport payload begins before the end of the packet,
    /// i.e. there is something for DPI to look at.
    pub fn has_inspectable_payload(&self) -> bool {
        self.payload_size() > 0
    }

    /// DPI runs for every UDP packet and for TCP packets that carry payload.
    pub fn should_inspect(&self) -> bool {
        match self.protocol {
            TransportProtocol::Udp => !self.is_fragment,
            TransportProtocol::Tcp => self.has_inspectable_payload(),
            _ => false,
        }
    }

    /// TCP flag byte of `packet`, which must be the packet this header was
    /// parsed from. `None` for other protocols and non-initial fragments.
    pub fn tcp_flags(&self, packet: &[u8]) -> Option<u8> {
        if self.protocol != TransportProtocol::Tcp || self.payload_offset.is_none() {
            return None;
        }
        packet.get(self.header_len + 13).copied()
    }

    pub fn destination_port(&self) -> u16 {
        self.destination.port()
    }

    pub fn is_dns(&self) -> bool {
        self.protocol.is_tcp_or_udp() && self.destination.port() == DNS_PORT
    }

    /// Multicast or limited broadcast destination.
    ///
    /// Global-scope IPv6 multicast (ff0e::/16) is routed to us by the ff00::/8
    /// route but is not LAN traffic, so it does not count.
    pub fn is_multicast_or_broadcast(&self) -> bool {
        is_lan_multicast_or_broadcast(self.destination.ip())
    }
}

/// See [`IpPacketHeader::is_multicast_or_broadcast`].
pub fn is_lan_multicast_or_broadcast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        IpAddr::V6(v6) => v6.is_multicast() && (v6.octets()[1] & 0x0F) != 0x0E,
    }
}

fn ensure_len(packet: &[u8], needed: usize) -> Result<(), PacketParseError> {
    if packet.len() < needed {
        return Err(PacketParseError::Truncated {
            needed,
            available: packet.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_packets {
    //! Packet builders shared by the packet-path tests.

    use std::net::{Ipv4Addr, Ipv6Addr};

    pub fn ipv4(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, transport: &[u8]) -> Vec<u8> {
        let total_len = 20 + transport.len();
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = protocol;
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());
        packet.extend_from_slice(transport);
        packet
    }

    pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 8];
        header[0..2].copy_from_slice(&src_port.to_be_bytes());
        header[2..4].copy_from_slice(&dst_port.to_be_bytes());
        header[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        header.extend_from_slice(payload);
        header
    }

    pub fn tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        tcp_with_flags(src_port, dst_port, 0x02, payload)
    }

    pub fn tcp_with_flags(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0..2].copy_from_slice(&src_port.to_be_bytes());
        header[2..4].copy_from_slice(&dst_port.to_be_bytes());
        header[12] = 5 << 4;
        header[13] = flags;
        header.extend_from_slice(payload);
        header
    }

    pub fn ipv4_udp(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        ipv4(17, src.0, dst.0, &udp(src.1, dst.1, payload))
    }

    pub fn ipv4_tcp(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
        ipv4(6, src.0, dst.0, &tcp(src.1, dst.1, payload))
    }

    pub fn ipv4_tcp_flags(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), flags: u8, payload: &[u8]) -> Vec<u8> {
        ipv4(6, src.0, dst.0, &tcp_with_flags(src.1, dst.1, flags, payload))
    }

    pub fn ipv6(next_header: u8, src: Ipv6Addr, dst: Ipv6Addr, rest: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(rest.len() as u16).to_be_bytes());
        packet[6] = next_header;
        packet[7] = 64;
        packet[8..24].copy_from_slice(&src.octets());
        packet[24..40].copy_from_slice(&dst.octets());
        packet.extend_from_slice(rest);
        packet
    }
}
