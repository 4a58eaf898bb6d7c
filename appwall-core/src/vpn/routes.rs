//! Route Management for the virtual interface
//!
//! Only LAN and special-use destinations are routed into the interface;
//! everything else keeps using the normal default route and is never seen
//! by the firewall.
//!
//! ## Linux Routing
//!
//! Routes are added with `ip route add <cidr> dev <tun> table <t>` plus an
//! `ip rule` pointing unmarked traffic at that table, and removed again
//! when the manager is dropped.

use super::{FirewallError, FirewallResult};
use crate::utils::run_checked;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::str::FromStr;

/// An address with a prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    pub const fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
        }
    }

    pub const fn v6(segments: [u16; 8], prefix: u8) -> Self {
        let [a, b, c, d, e, f, g, h] = segments;
        Self {
            addr: IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)),
            prefix,
        }
    }

    /// Parse `addr/prefix`. Host bits may be set (interface addresses).
    pub fn parse_address(s: &str) -> Result<Self, String> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in addr/prefix form", s))?;
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid address in '{}': {}", s, e))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|e| format!("invalid prefix in '{}': {}", s, e))?;

        let cidr = Self { addr, prefix };
        if prefix > cidr.max_prefix() {
            return Err(format!("prefix /{} too long for {}", prefix, addr));
        }
        Ok(cidr)
    }

    pub const fn max_prefix(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Prefix in range and no host bits set
    pub const fn is_canonical(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                if self.prefix > 32 {
                    return false;
                }
                let bits = u32::from_be_bytes(v4.octets());
                self.prefix == 32 || bits & (u32::MAX >> self.prefix) == 0
            }
            IpAddr::V6(v6) => {
                if self.prefix > 128 {
                    return false;
                }
                let bits = u128::from_be_bytes(v6.octets());
                self.prefix == 128 || bits & (u128::MAX >> self.prefix) == 0
            }
        }
    }

    /// Network of this address (host bits cleared)
    pub fn network(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(v4) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Self {
            addr,
            prefix: self.prefix,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                Self { addr: ip, prefix: self.prefix }.network() == self.network()
            }
            _ => false,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    /// Parse a network; host bits must be clear
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cidr = Self::parse_address(s)?;
        if !cidr.is_canonical() {
            return Err(format!("'{}' has host bits set (network is {})", s, cidr.network()));
        }
        Ok(cidr)
    }
}

/// Private, link-local, documentation, multicast and other special-use IPv4 ranges
pub const IPV4_LAN_ROUTES: [Cidr; 15] = [
    Cidr::v4(10, 0, 0, 0, 8),
    Cidr::v4(172, 16, 0, 0, 12),
    Cidr::v4(192, 168, 0, 0, 16),
    Cidr::v4(0, 0, 0, 0, 8),
    Cidr::v4(169, 254, 0, 0, 16),
    Cidr::v4(192, 0, 0, 0, 24),
    Cidr::v4(192, 0, 2, 0, 24),
    Cidr::v4(192, 88, 99, 0, 24),
    Cidr::v4(198, 18, 0, 0, 15),
    Cidr::v4(198, 51, 100, 0, 24),
    Cidr::v4(203, 0, 113, 0, 24),
    Cidr::v4(224, 0, 0, 0, 4),
    Cidr::v4(255, 255, 255, 255, 32),
    Cidr::v4(100, 64, 0, 0, 10),
    Cidr::v4(240, 0, 0, 0, 4),
];

pub const IPV6_LAN_ROUTES: [Cidr; 8] = [
    // Discard-only
    Cidr::v6([0x100, 0, 0, 0, 0, 0, 0, 0], 64),
    // Benchmarking
    Cidr::v6([0x2001, 0x2, 0, 0, 0, 0, 0, 0], 32),
    // Documentation
    Cidr::v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 0], 32),
    // Segment routing SIDs
    Cidr::v6([0x5f00, 0, 0, 0, 0, 0, 0, 0], 16),
    // Unique local
    Cidr::v6([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7),
    // Link-local
    Cidr::v6([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10),
    // Site-local (deprecated, still seen)
    Cidr::v6([0xfec0, 0, 0, 0, 0, 0, 0, 0], 10),
    // Multicast, global scope included; filtered later
    Cidr::v6([0xff00, 0, 0, 0, 0, 0, 0, 0], 8),
];

const _: () = {
    let mut i = 0;
    while i < IPV4_LAN_ROUTES.len() {
        assert!(IPV4_LAN_ROUTES[i].is_canonical());
        i += 1;
    }
    let mut j = 0;
    while j < IPV6_LAN_ROUTES.len() {
        assert!(IPV6_LAN_ROUTES[j].is_canonical());
        j += 1;
    }
};

/// Every route sent into the interface
pub fn lan_routes() -> Vec<Cidr> {
    IPV4_LAN_ROUTES.iter().chain(IPV6_LAN_ROUTES.iter()).copied().collect()
}

/// Whether traffic to `ip` is routed into the interface
pub fn is_intercepted(ip: IpAddr) -> bool {
    IPV4_LAN_ROUTES
        .iter()
        .chain(IPV6_LAN_ROUTES.iter())
        .any(|route| route.contains(ip))
}

/// Priority of the `ip rule` sending unmarked traffic to the LAN table.
/// Below `main` (32766) so the LAN table wins over connected routes.
pub const RULE_PRIORITY: u32 = 5210;

/// Installs routes into the virtual interface and removes them again
///
/// Routes live in their own table, consulted for every packet that does not
/// carry `fwmark`. The forwarder marks its sockets, so re-injected packets
/// take the normal routes instead of looping back into the interface.
pub struct RouteManager {
    interface: String,
    routes: Vec<Cidr>,
    table: u32,
    fwmark: u32,
    source_v4: Option<Ipv4Addr>,
    applied: Vec<Cidr>,
    rules_applied: bool,
}

impl RouteManager {
    pub fn new(interface: impl Into<String>, routes: Vec<Cidr>, table: u32, fwmark: u32) -> Self {
        Self {
            interface: interface.into(),
            routes,
            table,
            fwmark,
            source_v4: None,
            applied: Vec::new(),
            rules_applied: false,
        }
    }

    /// All LAN ranges
    pub fn for_lan(interface: impl Into<String>, table: u32, fwmark: u32) -> Self {
        Self::new(interface, lan_routes(), table, fwmark)
    }

    /// Preferred source for IPv4 routes, so sockets bind the host's real
    /// address instead of the interface's link-local one.
    pub fn with_source(mut self, source: Option<Ipv4Addr>) -> Self {
        self.source_v4 = source;
        self
    }

    pub fn routes(&self) -> &[Cidr] {
        &self.routes
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_applied(&self) -> bool {
        self.rules_applied || !self.applied.is_empty()
    }

    /// `ip route add` arguments for one route
    pub fn route_args(&self, route: &Cidr) -> Vec<String> {
        let mut args: Vec<String> = vec![
            family(route).to_string(),
            "route".to_string(),
            "add".to_string(),
            route.to_string(),
            "dev".to_string(),
            self.interface.clone(),
            "table".to_string(),
            self.table.to_string(),
        ];
        if let (true, Some(source)) = (route.is_ipv4(), self.source_v4) {
            args.push("src".to_string());
            args.push(source.to_string());
        }
        args
    }

    /// `ip rule add` arguments for one address family
    pub fn rule_args(&self, family: &str) -> Vec<String> {
        vec![
            family.to_string(),
            "rule".to_string(),
            "add".to_string(),
            "not".to_string(),
            "fwmark".to_string(),
            format!("{:#x}", self.fwmark),
            "table".to_string(),
            self.table.to_string(),
            "priority".to_string(),
            RULE_PRIORITY.to_string(),
        ]
    }

    /// Add every route and the two rules. An existing identical route is not
    /// an error; any other failure rolls back what was added.
    pub fn apply_routes(&mut self) -> FirewallResult<()> {
        if self.is_applied() {
            log::warn!("Routes already applied, skipping");
            return Ok(());
        }

        log::info!(
            "Adding {} routes to {} (table {}, fwmark {:#x})",
            self.routes.len(),
            self.interface,
            self.table,
            self.fwmark
        );

        for route in self.routes.clone() {
            let args = self.route_args(&route);
            match run_ip(&args) {
                Ok(()) => self.applied.push(route),
                Err(e) if e.contains("File exists") => {
                    log::warn!("Route {} may already exist: {}", route, e);
                }
                Err(e) => {
                    self.remove_routes();
                    return Err(FirewallError::Route(e));
                }
            }
        }

        for family in ["-4", "-6"] {
            if let Err(e) = run_ip(&self.rule_args(family)) {
                self.remove_routes();
                return Err(FirewallError::Route(e));
            }
            self.rules_applied = true;
        }

        log::info!("Routes applied ({} added)", self.applied.len());
        Ok(())
    }

    /// Best effort; failures are logged
    pub fn remove_routes(&mut self) {
        if !self.is_applied() {
            log::debug!("No routes to remove");
            return;
        }

        log::info!("Removing routes from {}", self.interface);
        if self.rules_applied {
            for family in ["-4", "-6"] {
                let mut args = self.rule_args(family);
                args[2] = "del".to_string();
                if let Err(e) = run_ip(&args) {
                    log::debug!("Failed to remove {} rule: {}", family, e);
                }
            }
            self.rules_applied = false;
        }

        for route in std::mem::take(&mut self.applied) {
            let mut args = self.route_args(&route);
            args[2] = "del".to_string();
            if let Err(e) = run_ip(&args) {
                log::debug!("Failed to remove route {} (interface may be gone): {}", route, e);
            }
        }
    }
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        self.remove_routes();
    }
}

fn family(route: &Cidr) -> &'static str {
    if route.is_ipv4() {
        "-4"
    } else {
        "-6"
    }
}

fn run_ip(args: &[String]) -> Result<(), String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_checked("ip", &args)
}

/// Source address the kernel picks for the default route. Connecting a UDP
/// socket sends nothing.
pub fn default_source_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(1, 1, 1, 1), 53)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}
