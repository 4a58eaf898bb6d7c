//! DPI bridge
//!
//! Hands blocked packets to a payload [`Classifier`] and returns a protocol
//! label plus a JSON report. Classifiers keep hidden per-call state and are
//! not reentrant, so every call goes through one global lock. A classifier
//! that errors or panics yields no classification; it never takes the packet
//! loop down.

use super::ip_header::{IpPacketHeader, TransportProtocol};
use super::{FirewallError, FirewallResult};
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Best-effort classification of one packet
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Protocol label, e.g. "DNS", "HTTP"
    pub protocol: String,
    /// Classifier report, stored verbatim on the flow
    pub report: Value,
}

impl Classification {
    pub fn report_json(&self) -> String {
        self.report.to_string()
    }
}

/// Payload classifier. `packet[offset..]` is the IP packet.
pub trait Classifier: Send {
    fn classify(&mut self, packet: &[u8], offset: usize) -> FirewallResult<Option<Classification>>;
}

/// Serialized access to a [`Classifier`]
pub struct DpiBridge {
    classifier: Mutex<Box<dyn Classifier>>,
    failures: AtomicU64,
}

impl DpiBridge {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        Self {
            classifier: Mutex::new(classifier),
            failures: AtomicU64::new(0),
        }
    }

    /// Classify `packet` if the header says it is worth inspecting
    /// (UDP, or TCP with payload).
    pub fn inspect(&self, packet: &[u8], header: &IpPacketHeader) -> Option<Classification> {
        if !header.should_inspect() {
            return None;
        }
        self.classify(packet, 0)
    }

    /// Run the classifier under the global lock. Errors and panics are
    /// swallowed and counted.
    pub fn classify(&self, packet: &[u8], offset: usize) -> Option<Classification> {
        if offset >= packet.len() {
            return None;
        }

        let mut classifier = self.classifier.lock();
        let result = catch_unwind(AssertUnwindSafe(|| classifier.classify(packet, offset)));

        match result {
            Ok(Ok(classification)) => classification,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!("DPI classification failed: {}", e);
                None
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("DPI classifier panicked; packet left unclassified");
                None
            }
        }
    }

    /// Errors and panics swallowed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// How a protocol was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confidence {
    Payload,
    Port,
}

impl Confidence {
    fn as_str(self) -> &'static str {
        match self {
            Self::Payload => "DPI",
            Self::Port => "Match by port",
        }
    }
}

/// Built-in classifier for common LAN protocols.
///
/// Matches payload signatures first and falls back to well-known ports. Its
/// per-protocol hit counters are the hidden state the bridge lock protects.
#[derive(Default)]
pub struct SignatureClassifier {
    hits: HashMap<&'static str, u64>,
}

impl SignatureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self, protocol: &str) -> u64 {
        self.hits.get(protocol).copied().unwrap_or(0)
    }

    fn detect(header: &IpPacketHeader, payload: &[u8]) -> Option<(&'static str, &'static str, Confidence)> {
        let src = header.source.port();
        let dst = header.destination.port();
        let either = |port: u16| src == port || dst == port;

        match header.protocol {
            TransportProtocol::Tcp => {
                if is_http_request(payload) || payload.starts_with(b"HTTP/1.") {
                    return Some(("HTTP", "Web", Confidence::Payload));
                }
                if payload.len() >= 3 && payload[0] == 0x16 && payload[1] == 0x03 {
                    return Some(("TLS", "Web", Confidence::Payload));
                }
                if payload.starts_with(b"SSH-") {
                    return Some(("SSH", "RemoteAccess", Confidence::Payload));
                }
                if payload.len() >= 8 && matches!(&payload[4..8], b"\xFFSMB" | b"\xFESMB") {
                    return Some(("SMB", "System", Confidence::Payload));
                }
                if either(631) {
                    return Some(("IPP", "System", Confidence::Port));
                }
                if either(53) {
                    return Some(("DNS", "Network", Confidence::Port));
                }
                None
            }
            TransportProtocol::Udp => {
                if either(5353) {
                    return Some(("MDNS", "Network", confidence_if(looks_like_dns(payload))));
                }
                if either(5355) {
                    return Some(("LLMNR", "Network", confidence_if(looks_like_dns(payload))));
                }
                if either(53) {
                    return Some(("DNS", "Network", confidence_if(looks_like_dns(payload))));
                }
                if payload.starts_with(b"M-SEARCH * HTTP/1.1")
                    || payload.starts_with(b"NOTIFY * HTTP/1.1")
                {
                    return Some(("SSDP", "System", Confidence::Payload));
                }
                if either(1900) {
                    return Some(("SSDP", "System", Confidence::Port));
                }
                if either(67) || either(68) {
                    return Some(("DHCP", "Network", confidence_if(looks_like_dhcp(payload))));
                }
                if either(547) || either(546) {
                    return Some(("DHCPV6", "Network", Confidence::Port));
                }
                if either(137) || either(138) {
                    return Some(("NetBIOS", "System", Confidence::Port));
                }
                if either(123) {
                    return Some(("NTP", "System", Confidence::Port));
                }
                if either(161) || either(162) {
                    return Some(("SNMP", "Network", Confidence::Port));
                }
                if either(3702) {
                    return Some(("WSD", "System", Confidence::Port));
                }
                if payload.len() >= 4 && payload[0] == 0x16 && payload[1] == 0xFE {
                    return Some(("DTLS", "Web", Confidence::Payload));
                }
                None
            }
            _ => None,
        }
    }
}

fn confidence_if(payload_match: bool) -> Confidence {
    if payload_match {
        Confidence::Payload
    } else {
        Confidence::Port
    }
}

fn is_http_request(payload: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
        b"TRACE ",
    ];
    METHODS.iter().any(|m| payload.starts_with(m))
}

/// 12-byte header with at most a handful of questions
fn looks_like_dns(payload: &[u8]) -> bool {
    if payload.len() < 12 {
        return false;
    }
    let questions = u16::from_be_bytes([payload[4], payload[5]]);
    let opcode = (payload[2] >> 3) & 0x0F;
    questions <= 16 && opcode <= 5
}

/// BOOTP op code 1/2 and the DHCP magic cookie at offset 236
fn looks_like_dhcp(payload: &[u8]) -> bool {
    payload.len() >= 240
        && matches!(payload[0], 1 | 2)
        && payload[236..240] == [0x63, 0x82, 0x53, 0x63]
}

impl Classifier for SignatureClassifier {
    fn classify(&mut self, packet: &[u8], offset: usize) -> FirewallResult<Option<Classification>> {
        let ip_packet = packet
            .get(offset..)
            .ok_or_else(|| FirewallError::Dpi(format!("offset {} past end of packet", offset)))?;
        let header = IpPacketHeader::parse(ip_packet)?;
        let payload = header
            .payload_offset
            .and_then(|start| ip_packet.get(start..header.size))
            .unwrap_or(&[]);

        let Some((protocol, category, confidence)) = Self::detect(&header, payload) else {
            return Ok(None);
        };

        let seen = self.hits.entry(protocol).or_insert(0);
        *seen += 1;

        Ok(Some(Classification {
            protocol: protocol.to_string(),
            report: json!({
                "ndpi": {
                    "proto": protocol,
                    "category": category,
                    "confidence": confidence.as_str(),
                },
                "payload_len": payload.len(),
                "seen": *seen,
            }),
        }))
    }
}
