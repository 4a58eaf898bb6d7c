//! Linux TUN Adapter
//!
//! Creates the tun interface that LAN traffic is routed into, using the
//! tun-rs crate for the device and `ip route`/`ip rule` for the LAN routes.
//!
//! REQUIREMENTS:
//! - Root (or CAP_NET_ADMIN) to create the interface and add routes
//! - The tun kernel module (/dev/net/tun)

use super::packet_loop::{InterfaceRead, VirtualInterface};
use super::packet_writer::PacketSink;
use super::routes::{default_source_ipv4, Cidr, RouteManager};
use super::{FirewallError, FirewallResult};
use crate::settings::EngineConfig;
use crate::utils::is_root;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tun_rs::{DeviceBuilder, SyncDevice};

/// Upper bound on one read so the reader sees stop() promptly
pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// tun interface backing the packet loop
pub struct TunAdapter {
    device: ArcSwapOption<SyncDevice>,
    interface_name: String,
    mtu: usize,
    routes: Mutex<Option<RouteManager>>,
}

impl TunAdapter {
    /// Create and configure the interface described by `config`
    ///
    /// # Errors
    /// Returns an error if:
    /// - the process is not running as root
    /// - the interface addresses in the config are invalid
    /// - tun creation fails
    /// - route installation fails
    pub fn create(config: &EngineConfig) -> FirewallResult<Self> {
        log::info!("Creating tun adapter '{}'", config.interface_name);

        if !is_root() {
            log::error!("Root privileges required for the tun adapter");
            return Err(FirewallError::Adapter(
                "Root privileges required. Please run appwall with sudo.".to_string(),
            ));
        }

        let ipv4 = Cidr::parse_address(&config.interface_ipv4).map_err(FirewallError::InvalidConfig)?;
        let ipv6 = Cidr::parse_address(&config.interface_ipv6).map_err(FirewallError::InvalidConfig)?;
        let (IpAddr::V4(v4), IpAddr::V6(v6)) = (ipv4.addr, ipv6.addr) else {
            return Err(FirewallError::InvalidConfig(format!(
                "interface addresses must be IPv4 and IPv6, got {} and {}",
                ipv4, ipv6
            )));
        };

        let device = DeviceBuilder::new()
            .name(&config.interface_name)
            .mtu(config.mtu)
            .ipv4(v4, ipv4.prefix, None)
            .ipv6(v6, ipv6.prefix)
            .build_sync()
            .map_err(|e| {
                log::error!("Failed to create tun device: {}", e);
                FirewallError::Adapter(format!("Failed to create tun device: {}", e))
            })?;

        let interface_name = device
            .name()
            .map_err(|e| FirewallError::Adapter(format!("Failed to get interface name: {}", e)))?;
        log::info!("tun adapter created: {} (MTU {})", interface_name, config.mtu);

        let routes = if config.install_routes {
            let source = default_source_ipv4();
            if source.is_none() {
                log::warn!("No default IPv4 source address; LAN sockets may bind {}", v4);
            }
            let mut manager = RouteManager::for_lan(interface_name.clone(), config.route_table, config.fwmark)
                .with_source(source);
            manager.apply_routes()?;
            Some(manager)
        } else {
            log::info!("Route installation disabled, expecting routes to be managed externally");
            None
        };

        Ok(Self {
            device: ArcSwapOption::from_pointee(device),
            interface_name,
            mtu: usize::from(config.mtu),
            routes: Mutex::new(routes),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn is_open(&self) -> bool {
        self.device.load().is_some()
    }
}

impl VirtualInterface for TunAdapter {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<InterfaceRead> {
        let Some(device) = self.device.load_full() else {
            return Ok(InterfaceRead::Closed);
        };

        if !poll_readable(device.as_raw_fd(), READ_POLL_TIMEOUT)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no packet within poll timeout"));
        }

        match device.recv(buf)? {
            0 => Ok(InterfaceRead::Empty),
            n => Ok(InterfaceRead::Packet(n)),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn close(&self) {
        if let Some(mut routes) = self.routes.lock().take() {
            routes.remove_routes();
        }
        if self.device.swap(None).is_some() {
            log::info!("Closed tun adapter: {}", self.interface_name);
        }
    }
}

/// Replies queued by a [`SessionForwarder`](super::SessionForwarder) that
/// terminates sessions itself. The daemon's raw-socket forwarder re-injects
/// through marked sockets instead, so its replies reach applications over the
/// normal stack and never pass through here.
impl PacketSink for TunAdapter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let Some(device) = self.device.load_full() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tun adapter closed"));
        };
        device.send(packet)?;
        Ok(())
    }
}

impl Drop for TunAdapter {
    fn drop(&mut self) {
        log::info!("Dropping tun adapter: {}", self.interface_name);
        self.close();
    }
}

/// Wait until `fd` is readable. Ok(false) on timeout; EINTR counts as a
/// timeout. POLLHUP/POLLERR report readable so the read sees the error.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_times_out_without_data() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(!poll_readable(a.as_raw_fd(), Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_poll_reports_pending_data() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(&[0x45, 0x00]).unwrap();
        assert!(poll_readable(a.as_raw_fd(), Duration::from_millis(200)).unwrap());
    }

    #[test]
    fn test_poll_reports_hangup_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(poll_readable(a.as_raw_fd(), Duration::from_millis(200)).unwrap());
    }

    #[test]
    fn test_create_requires_root() {
        if is_root() {
            return;
        }
        match TunAdapter::create(&EngineConfig::default()) {
            Err(FirewallError::Adapter(msg)) => assert!(msg.contains("Root privileges")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("tun adapter created without root"),
        }
    }
}
