//! Socket Owner Tables - Maps sockets to owning uids on Linux
//!
//! Reads `/proc/net/{tcp,tcp6,udp,udp6}` and answers exact
//! (protocol, local, remote) lookups for the [`OwnerResolver`]. The resolver
//! supplies the wildcard and IPv4-mapped rewrites, so this table only ever
//! does exact matches, the same as the kernel's own lookup.
//!
//! Key features:
//! - O(1) lookup via HashMap snapshot
//! - Snapshot refreshed when older than a short interval, plus one forced
//!   refresh on a miss (new sockets show up between refreshes)
//! - Sockets that disappeared are kept for a few seconds, since the last
//!   packets of a flow often arrive after the socket is closed
//!
//! [`OwnerResolver`]: super::owner_resolver::OwnerResolver

use super::ip_header::TransportProtocol;
use super::{FirewallError, FirewallResult, OwnerLookup};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PROC_NET_ROOT: &str = "/proc/net";

/// Snapshot age after which any lookup refreshes first
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);
/// Minimum gap between forced refreshes triggered by misses
const MISS_REFRESH_INTERVAL: Duration = Duration::from_millis(20);
/// How long a vanished socket still answers lookups
const STALE_TIMEOUT: Duration = Duration::from_secs(5);

/// Column of the uid in /proc/net/{tcp,udp}* rows
const UID_COLUMN: usize = 7;

/// Table lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub protocol: TransportProtocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

#[derive(Default)]
struct SocketTables {
    current: HashMap<SocketKey, u32>,
    stale: HashMap<SocketKey, (u32, Instant)>,
    refreshed_at: Option<Instant>,
}

/// [`OwnerLookup`] backed by the procfs socket tables
pub struct ProcNetLookup {
    root: PathBuf,
    tables: Mutex<SocketTables>,
}

impl Default for ProcNetLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcNetLookup {
    pub fn new() -> Self {
        Self::with_root(PROC_NET_ROOT)
    }

    /// Read tables from another directory (tests, containers with a
    /// relocated procfs)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tables: Mutex::new(SocketTables::default()),
        }
    }

    /// Re-read every table. Sockets that vanished move to the stale table.
    pub fn refresh(&self) -> FirewallResult<()> {
        let mut fresh = HashMap::with_capacity(256);
        let mut read_any = false;

        for (file, protocol) in [
            ("tcp", TransportProtocol::Tcp),
            ("tcp6", TransportProtocol::Tcp),
            ("udp", TransportProtocol::Udp),
            ("udp6", TransportProtocol::Udp),
        ] {
            let path = self.root.join(file);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    read_any = true;
                    parse_table(&content, protocol, &mut fresh);
                }
                // tcp6/udp6 are missing when IPv6 is disabled
                Err(e) => debug!("Skipping {:?}: {}", path, e),
            }
        }

        if !read_any {
            return Err(FirewallError::OwnerLookup(format!(
                "no socket tables readable under {}",
                self.root.display()
            )));
        }

        let now = Instant::now();
        let mut tables = self.tables.lock();
        tables
            .stale
            .retain(|_, (_, seen)| now.duration_since(*seen) < STALE_TIMEOUT);

        let old = std::mem::replace(&mut tables.current, fresh);
        for (key, uid) in old {
            if !tables.current.contains_key(&key) {
                tables.stale.insert(key, (uid, now));
            }
        }
        tables.refreshed_at = Some(now);
        Ok(())
    }

    fn snapshot_age(&self) -> Option<Duration> {
        self.tables.lock().refreshed_at.map(|t| t.elapsed())
    }

    fn find(&self, key: &SocketKey) -> Option<u32> {
        let tables = self.tables.lock();
        tables
            .current
            .get(key)
            .copied()
            .or_else(|| tables.stale.get(key).map(|(uid, _)| *uid))
    }

    /// Number of live sockets in the current snapshot
    pub fn socket_count(&self) -> usize {
        self.tables.lock().current.len()
    }
}

impl OwnerLookup for ProcNetLookup {
    fn lookup_owner_uid(
        &self,
        protocol: TransportProtocol,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> FirewallResult<i32> {
        let key = SocketKey {
            protocol,
            local,
            remote,
        };

        let needs_refresh = self
            .snapshot_age()
            .map_or(true, |age| age >= REFRESH_INTERVAL);
        if needs_refresh {
            self.refresh()?;
        }

        if let Some(uid) = self.find(&key) {
            return Ok(uid as i32);
        }

        // The socket may be newer than the snapshot
        let may_retry = self
            .snapshot_age()
            .map_or(true, |age| age >= MISS_REFRESH_INTERVAL);
        if may_retry {
            if let Err(e) = self.refresh() {
                warn!("Socket table refresh failed: {}", e);
            }
            if let Some(uid) = self.find(&key) {
                return Ok(uid as i32);
            }
        }

        Ok(-1)
    }
}

fn parse_table(content: &str, protocol: TransportProtocol, out: &mut HashMap<SocketKey, u32>) {
    // First line is the column header
    for line in content.lines().skip(1) {
        if let Some((key, uid)) = parse_row(line, protocol) {
            out.insert(key, uid);
        }
    }
}

/// Parse one row, e.g.
/// `0: 0100007F:0035 00000000:0000 0A 00000000:00000000 00:00000000 00000000   101 0 1234 ...`
fn parse_row(line: &str, protocol: TransportProtocol) -> Option<(SocketKey, u32)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() <= UID_COLUMN {
        return None;
    }
    let local = parse_endpoint(fields[1])?;
    let remote = parse_endpoint(fields[2])?;
    let uid = fields[UID_COLUMN].parse().ok()?;
    Some((
        SocketKey {
            protocol,
            local,
            remote,
        },
        uid,
    ))
}

/// `ADDR:PORT` where ADDR is the kernel's in-memory address printed as
/// host-order 32-bit words and PORT is plain big-endian hex.
fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match addr_hex.len() {
        8 => {
            let word = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr_hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// True if `path` looks like a procfs net directory
pub fn tables_present(path: &Path) -> bool {
    path.join("tcp").exists() || path.join("udp").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

    /// Encode an IPv4 address the way the kernel prints it on this host
    fn v4_hex(ip: Ipv4Addr) -> String {
        format!("{:08X}", u32::from_ne_bytes(ip.octets()))
    }

    fn v6_hex(ip: Ipv6Addr) -> String {
        ip.octets()
            .chunks(4)
            .map(|c| format!("{:08X}", u32::from_ne_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }

    fn row(local: &str, remote: &str, uid: u32) -> String {
        format!(
            "   0: {} {} 01 00000000:00000000 00:00000000 00000000 {:>5}        0 12345 1 0000000000000000 20 4 30 10 -1\n",
            local, remote, uid
        )
    }

    #[test]
    fn test_parse_ipv4_endpoint() {
        let hex = format!("{}:0277", v4_hex(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(
            parse_endpoint(&hex),
            Some("192.168.1.20:631".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_ipv6_endpoint() {
        let ip: Ipv6Addr = "::ffff:192.168.1.20".parse().unwrap();
        let hex = format!("{}:1F90", v6_hex(ip));
        assert_eq!(
            parse_endpoint(&hex),
            Some(SocketAddr::new(IpAddr::V6(ip), 8080))
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert_eq!(parse_endpoint("nothex:0035"), None);
        assert_eq!(parse_endpoint("0100007F"), None);
        assert_eq!(parse_endpoint("0100:0035"), None);
    }

    #[test]
    fn test_parse_row_reads_uid_column() {
        let local = format!("{}:9C40", v4_hex(Ipv4Addr::new(192, 168, 1, 20)));
        let remote = format!("{}:0050", v4_hex(Ipv4Addr::new(192, 168, 1, 50)));
        let (key, uid) = parse_row(row(&local, &remote, 10123).trim_end(), TransportProtocol::Tcp).unwrap();

        assert_eq!(uid, 10123);
        assert_eq!(key.local, "192.168.1.20:40000".parse().unwrap());
        assert_eq!(key.remote, "192.168.1.50:80".parse().unwrap());
    }

    #[test]
    fn test_lookup_from_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let udp_local = format!("{}:14E9", v4_hex(Ipv4Addr::UNSPECIFIED));
        let udp_remote = format!("{}:0000", v4_hex(Ipv4Addr::UNSPECIFIED));
        fs::write(
            dir.path().join("udp"),
            format!("{}{}", HEADER, row(&udp_local, &udp_remote, 1001)),
        )
        .unwrap();
        fs::write(dir.path().join("tcp"), HEADER).unwrap();

        let lookup = ProcNetLookup::with_root(dir.path());
        assert!(tables_present(dir.path()));

        let uid = lookup
            .lookup_owner_uid(
                TransportProtocol::Udp,
                "0.0.0.0:5353".parse().unwrap(),
                "0.0.0.0:0".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(uid, 1001);
        assert_eq!(lookup.socket_count(), 1);

        // Protocol is part of the key
        let tcp = lookup
            .lookup_owner_uid(
                TransportProtocol::Tcp,
                "0.0.0.0:5353".parse().unwrap(),
                "0.0.0.0:0".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(tcp, -1);
    }

    #[test]
    fn test_vanished_socket_is_kept_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let local = format!("{}:9C40", v4_hex(Ipv4Addr::new(10, 0, 0, 2)));
        let remote = format!("{}:0050", v4_hex(Ipv4Addr::new(10, 0, 0, 3)));
        fs::write(
            dir.path().join("tcp"),
            format!("{}{}", HEADER, row(&local, &remote, 1002)),
        )
        .unwrap();

        let lookup = ProcNetLookup::with_root(dir.path());
        lookup.refresh().unwrap();

        fs::write(dir.path().join("tcp"), HEADER).unwrap();
        lookup.refresh().unwrap();

        assert_eq!(lookup.socket_count(), 0);
        let uid = lookup
            .lookup_owner_uid(
                TransportProtocol::Tcp,
                "10.0.0.2:40000".parse().unwrap(),
                "10.0.0.3:80".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(uid, 1002);
    }

    #[test]
    fn test_missing_tables_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = ProcNetLookup::with_root(dir.path().join("nope"));
        assert!(lookup.refresh().is_err());
    }
}
