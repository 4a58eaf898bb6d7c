//! Raw-socket session forwarder
//!
//! Allowed packets are re-injected unchanged through raw IP sockets that
//! carry the route bypass mark, so they leave through the normal routes
//! instead of looping back into the tun device. Replies go straight to the
//! application's socket and never pass through the engine.

use appwall_core::vpn::{ForwardError, PacketWriterHandle, SessionForwarder};
use appwall_core::ApplicationIdentity;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct RawSocketForwarder {
    v4: OwnedFd,
    v6: Option<OwnedFd>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl RawSocketForwarder {
    /// Open the raw sockets, marked with `fwmark`. IPv6 is optional.
    pub fn new(fwmark: u32) -> io::Result<Self> {
        let v4 = raw_socket(libc::AF_INET, fwmark)?;
        let v6 = match raw_socket(libc::AF_INET6, fwmark) {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::warn!("IPv6 raw socket unavailable, IPv6 LAN traffic will be dropped: {}", e);
                None
            }
        };
        log::info!("Raw-socket forwarder ready (fwmark {:#x})", fwmark);
        Ok(Self {
            v4,
            v6,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn send(&self, packet: &[u8], destination: IpAddr) -> io::Result<()> {
        let sent = match destination {
            IpAddr::V4(ip) => {
                let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
                addr.sin_family = libc::AF_INET as libc::sa_family_t;
                addr.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(ip.octets()),
                };
                unsafe {
                    libc::sendto(
                        self.v4.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            IpAddr::V6(ip) => {
                let Some(v6) = &self.v6 else {
                    return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
                };
                let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                addr.sin6_addr = libc::in6_addr { s6_addr: ip.octets() };
                unsafe {
                    libc::sendto(
                        v6.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl SessionForwarder for RawSocketForwarder {
    // Replies reach the socket directly, so `_writer` stays unused
    fn handle(
        &self,
        packet: &[u8],
        app: Arc<ApplicationIdentity>,
        _writer: &PacketWriterHandle,
    ) -> Result<(), ForwardError> {
        let Some(destination) = destination(packet) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        match self.send(packet, destination) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                log::trace!("Forwarded {} bytes to {} for {}", packet.len(), destination, app.package_name);
                Ok(())
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOTSOCK)) => {
                Err(ForwardError::Unexpected(format!("raw socket unusable: {}", e)))
            }
            Err(e) => {
                let err = ForwardError::Io(e);
                if err.is_recoverable() {
                    return Err(err);
                }
                // EINVAL, EMSGSIZE, EAFNOSUPPORT and friends only affect this packet
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping packet to {}: {}", destination, err);
                Ok(())
            }
        }
    }

    fn shutdown(&self) {
        log::info!(
            "Forwarder shut down - {} sent, {} dropped",
            self.sent.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed)
        );
    }
}

fn raw_socket(domain: libc::c_int, fwmark: u32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(domain, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::IPPROTO_RAW) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mark: libc::c_uint = fwmark;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const libc::c_uint as *const libc::c_void,
            mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Destination address of a raw IP packet
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let bytes: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(bytes)))
        }
        6 => {
            let bytes: [u8; 16] = packet.get(24..40)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}
