//! Packet Loop
//!
//! One reader thread owns the virtual interface: it reads one packet at a
//! time, asks the [`DecisionEngine`] for a verdict and then either hands the
//! packet to the [`SessionForwarder`] and accounts it in the reader's
//! [`FlowTable`] (ALLOW), or records it as a blocked flow (BLOCK). Replies
//! from the forwarder go back through the [`PacketWriter`] thread.
//!
//! Lifecycle: STOPPED -> start() -> RUNNING -> stop() -> STOPPED. The loop
//! also returns to STOPPED on its own when the interface closes or the
//! forwarder fails with an unrecoverable error; resources are released
//! exactly once either way. `stop()` waits for the packet in flight, so every
//! flow of a run is recorded before its session is closed.

use super::adapter::READ_POLL_TIMEOUT;
use super::decision::{DecisionEngine, Verdict};
use super::dpi::DpiBridge;
use super::flow::{FlowRecorder, ProtectionSession, TrafficFlow};
use super::flow_table::FlowTable;
use super::ip_header::IpPacketHeader;
use super::packet_writer::{PacketSink, PacketWriter, PacketWriterHandle};
use super::{FirewallError, FirewallResult};
use crate::apps::ApplicationIdentity;
use crate::settings::PreflightConfig;
use crate::utils::{join_with_deadline, join_with_timeout, THREAD_JOIN_TIMEOUT};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleep after a zero-length read before reading again
const SPURIOUS_WAKEUP_BACKOFF: Duration = Duration::from_millis(10);

/// Outcome of one read from the virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRead {
    /// `n` bytes of one IP packet were read into the buffer
    Packet(usize),
    /// Read returned zero bytes
    Empty,
    /// End of stream
    Closed,
}

/// Read side of the virtual interface
///
/// `read_packet` should return within a bounded time so the reader can
/// observe `stop()`; an `io::ErrorKind::TimedOut` or `Interrupted` error
/// means "nothing yet" and the reader simply tries again.
pub trait VirtualInterface: Send + Sync {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<InterfaceRead>;

    /// Maximum packet size
    fn mtu(&self) -> usize;

    /// Release the interface. Later reads report `Closed`.
    fn close(&self);
}

/// Errors from the session forwarder
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Unexpected(String),
}

impl ForwardError {
    /// Conditions that affect one connection, not the loop
    pub fn is_recoverable(&self) -> bool {
        let Self::Io(e) = self else {
            return false;
        };
        if matches!(
            e.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::ConnectionRefused
        ) {
            return true;
        }
        matches!(
            e.raw_os_error(),
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) | Some(libc::EMFILE) | Some(libc::ENFILE)
        )
    }
}

/// Consumer of allowed packets
pub trait SessionForwarder: Send + Sync {
    /// Forward one allowed packet owned by `app`. Replies for the interface
    /// are queued on `writer`.
    fn handle(
        &self,
        packet: &[u8],
        app: Arc<ApplicationIdentity>,
        writer: &PacketWriterHandle,
    ) -> Result<(), ForwardError>;

    /// Tear down any sessions; called once per stop
    fn shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Stopped = 0,
    Running = 1,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Loop statistics
#[derive(Default)]
pub struct LoopStats {
    pub packets_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub forwarded: AtomicU64,
    pub blocked: AtomicU64,
    pub parse_errors: AtomicU64,
    pub spurious_wakeups: AtomicU64,
    pub forward_errors: AtomicU64,
}

/// Everything the reader thread needs
pub struct LoopComponents {
    pub interface: Arc<dyn VirtualInterface>,
    pub sink: Arc<dyn PacketSink>,
    pub engine: Arc<DecisionEngine>,
    pub dpi: Arc<DpiBridge>,
    pub forwarder: Arc<dyn SessionForwarder>,
    pub recorder: FlowRecorder,
    pub writer_queue_capacity: usize,
    /// Allowed flows with no packets for this long are recorded
    pub flow_idle_timeout: Duration,
    /// How long `stop()` waits for the reader; see [`reader_stop_timeout`]
    pub stop_timeout: Duration,
}

/// Longest time one packet can keep the reader busy: a full preflight plus
/// one interface poll, with the usual join slack on top.
pub fn reader_stop_timeout(preflight: &PreflightConfig) -> Duration {
    Duration::from_secs(preflight.timeout_secs) + READ_POLL_TIMEOUT + THREAD_JOIN_TIMEOUT
}

/// Resources that exist only while RUNNING
struct RunningParts {
    /// Which start() these belong to
    generation: u64,
    writer: PacketWriter,
    session: ProtectionSession,
    /// Private to this run's reader
    stop_flag: Arc<AtomicBool>,
}

struct LoopInner {
    components: LoopComponents,
    state: AtomicU8,
    generation: AtomicU64,
    stats: LoopStats,
    running: Mutex<Option<RunningParts>>,
}

pub struct PacketLoop {
    inner: Arc<LoopInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PacketLoop {
    pub fn new(components: LoopComponents) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                components,
                state: AtomicU8::new(LoopState::Stopped as u8),
                generation: AtomicU64::new(0),
                stats: LoopStats::default(),
                running: Mutex::new(None),
            }),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn stats(&self) -> &LoopStats {
        &self.inner.stats
    }

    /// Id of the current protection session, if RUNNING
    pub fn session_id(&self) -> Option<uuid::Uuid> {
        self.inner.running.lock().as_ref().map(|parts| parts.session.id)
    }

    /// Start the reader and writer threads. A no-op (with a warning) if
    /// already RUNNING.
    pub fn start(&self) -> FirewallResult<()> {
        if self
            .inner
            .state
            .compare_exchange(
                LoopState::Stopped as u8,
                LoopState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            log::warn!("Packet loop already running, ignoring start()");
            return Ok(());
        }

        // A reader that exited on its own is finished; reap it
        if let Some(previous) = self.reader.lock().take() {
            join_with_timeout(previous, "Reader");
        }

        let components = &self.inner.components;
        let writer = match PacketWriter::start(
            Arc::clone(&components.sink),
            components.writer_queue_capacity,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.inner.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
                return Err(FirewallError::Io(e));
            }
        };
        let writer_handle = writer.handle();

        let session = ProtectionSession::open();
        components.recorder.record_session(session.clone());
        log::info!("Protection session {} started", session.id);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop_flag = Arc::new(AtomicBool::new(false));
        *self.inner.running.lock() = Some(RunningParts {
            generation,
            writer,
            session,
            stop_flag: Arc::clone(&stop_flag),
        });

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("appwall-reader".to_string())
            .spawn(move || {
                run_packet_reader(&inner, &stop_flag, &writer_handle);
                inner.release(Some(generation));
            });

        match spawned {
            Ok(handle) => {
                *self.reader.lock() = Some(handle);
                log::info!("Packet loop started");
                Ok(())
            }
            Err(e) => {
                self.inner.release(Some(generation));
                Err(FirewallError::Io(e))
            }
        }
    }

    /// Stop the loop and release the interface. A no-op (with a warning) if
    /// already STOPPED.
    pub fn stop(&self) {
        let reader = self.reader.lock().take();
        if !self.is_running() && reader.is_none() {
            log::warn!("Packet loop is not running, ignoring stop()");
            return;
        }

        log::info!("Stopping packet loop...");
        if let Some(parts) = self.inner.running.lock().as_ref() {
            parts.stop_flag.store(true, Ordering::SeqCst);
        }

        if let Some(handle) = reader {
            join_with_deadline(handle, "Reader", self.inner.components.stop_timeout);
        }
        // Normally done by the reader on exit; covers a detached reader
        self.inner.release(None);

        let stats = self.stats();
        log::info!(
            "Packet loop stopped - {} read, {} forwarded, {} blocked, {} parse errors, {} spurious wakeups",
            stats.packets_read.load(Ordering::Relaxed),
            stats.forwarded.load(Ordering::Relaxed),
            stats.blocked.load(Ordering::Relaxed),
            stats.parse_errors.load(Ordering::Relaxed),
            stats.spurious_wakeups.load(Ordering::Relaxed)
        );
    }
}

impl Drop for PacketLoop {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

impl LoopInner {
    /// RUNNING -> STOPPED. Shuts the forwarder down, stops the writer,
    /// releases the interface and closes the session. Runs once per start;
    /// a reader from an earlier run (`generation` mismatch) releases nothing.
    fn release(&self, generation: Option<u64>) {
        let parts = {
            let mut running = self.running.lock();
            match running.as_ref() {
                Some(parts) if generation.map_or(true, |g| g == parts.generation) => running.take(),
                _ => None,
            }
        };
        let Some(mut parts) = parts else {
            return;
        };
        parts.stop_flag.store(true, Ordering::SeqCst);
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);

        self.components.forwarder.shutdown();
        parts.writer.stop();
        self.components.interface.close();

        parts.session.close();
        log::info!("Protection session {} ended", parts.session.id);
        self.components.recorder.record_session(parts.session);
    }

    /// Handle one packet. Only an unrecoverable forwarding error is returned.
    fn process_packet(
        &self,
        packet: &[u8],
        writer: &PacketWriterHandle,
        flows: &mut FlowTable,
    ) -> Result<(), ForwardError> {
        self.stats.packets_read.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(packet.len() as u64, Ordering::Relaxed);

        let header = match IpPacketHeader::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping malformed packet ({} bytes): {}", packet.len(), e);
                return Ok(());
            }
        };

        let (decision, verdict) = self.components.engine.verdict(&header);
        match verdict {
            Verdict::Allow => {
                log::trace!(
                    "ALLOW {} {} -> {} ({})",
                    header.protocol,
                    header.source,
                    header.destination,
                    decision.app.package_name
                );
                match self
                    .components
                    .forwarder
                    .handle(packet, Arc::clone(&decision.app), writer)
                {
                    Ok(()) => {
                        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        let dpi = &self.components.dpi;
                        if let Some(done) = flows.observe(packet, &header, decision.app, dpi, Instant::now()) {
                            self.components.recorder.record(done);
                        }
                        Ok(())
                    }
                    Err(e) if e.is_recoverable() => {
                        let errors = self.stats.forward_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        if errors <= 5 || errors.is_power_of_two() {
                            log::warn!(
                                "Forwarding to {} failed: {} (event #{})",
                                header.destination,
                                e,
                                errors
                            );
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Verdict::Block => {
                log::debug!(
                    "BLOCK {} {} -> {} ({})",
                    header.protocol,
                    header.source,
                    header.destination,
                    decision.app.package_name
                );
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                let classification = self.components.dpi.inspect(packet, &header);
                let flow = TrafficFlow::from_blocked_packet(&header, decision.app, classification);
                self.components.recorder.record(flow);
                Ok(())
            }
        }
    }
}

fn run_packet_reader(inner: &LoopInner, stop_flag: &AtomicBool, writer: &PacketWriterHandle) {
    let interface = &inner.components.interface;
    let recorder = &inner.components.recorder;
    let mut buffer = vec![0u8; interface.mtu()];
    let mut flows = FlowTable::new(inner.components.flow_idle_timeout);

    log::info!("Packet reader started (MTU {})", buffer.len());

    while !stop_flag.load(Ordering::Relaxed) {
        for flow in flows.expire(Instant::now()) {
            recorder.record(flow);
        }

        match interface.read_packet(&mut buffer) {
            Ok(InterfaceRead::Packet(len)) => {
                let len = len.min(buffer.len());
                if let Err(e) = inner.process_packet(&buffer[..len], writer, &mut flows) {
                    inner.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                    log::error!("Unrecoverable forwarding error, stopping: {}", e);
                    break;
                }
            }
            Ok(InterfaceRead::Empty) => {
                let count = inner.stats.spurious_wakeups.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Zero-length read from interface (#{}); is it in non-blocking mode?",
                    count
                );
                thread::sleep(SPURIOUS_WAKEUP_BACKOFF);
            }
            Ok(InterfaceRead::Closed) => {
                log::info!("Virtual interface closed");
                break;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                log::error!("Interface read failed, stopping: {}", e);
                break;
            }
        }
    }

    let open_flows = flows.drain();
    log::info!("Packet reader exiting, recording {} open flows", open_flows.len());
    for flow in open_flows {
        recorder.record(flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{AppDirectory, AppIdentityCache};
    use crate::notification::NotificationSink;
    use crate::settings::FirewallSettings;
    use crate::vpn::dpi::SignatureClassifier;
    use crate::vpn::flow::tests::{wait_for, MemoryFlowStore};
    use crate::vpn::ip_header::test_packets::*;
    use crate::vpn::ip_header::{TransportProtocol, TCP_SYN};
    use crate::vpn::owner_resolver::{OwnerLookup, OwnerResolver};
    use crate::vpn::packet_writer::tests::CollectingSink;
    use crate::vpn::policy_cache::PolicyCache;
    use crate::vpn::policy_store::AccessPolicyEntry;
    use crate::vpn::preflight::{PreflightProber, PreflightResponse, PreflightTransport};
    use crate::vpn::Policy;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;

    const PRINTER_UID: u32 = 10123;

    enum Step {
        Packet(Vec<u8>),
        Empty,
        Closed,
        Fail(io::ErrorKind),
    }

    /// Replays a script of reads, then times out until closed
    struct ScriptedInterface {
        steps: Mutex<VecDeque<Step>>,
        closed: AtomicBool,
    }

    impl ScriptedInterface {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl VirtualInterface for ScriptedInterface {
        fn read_packet(&self, buf: &mut [u8]) -> io::Result<InterfaceRead> {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(InterfaceRead::Closed);
            }
            match self.steps.lock().pop_front() {
                Some(Step::Packet(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(InterfaceRead::Packet(bytes.len()))
                }
                Some(Step::Empty) => Ok(InterfaceRead::Empty),
                Some(Step::Closed) => Ok(InterfaceRead::Closed),
                Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "poll timeout"))
                }
            }
        }

        fn mtu(&self) -> usize {
            1500
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FixedOwner(Option<u32>);

    impl OwnerLookup for FixedOwner {
        fn lookup_owner_uid(&self, _: TransportProtocol, _: SocketAddr, _: SocketAddr) -> FirewallResult<i32> {
            Ok(self.0.map_or(-1, |uid| uid as i32))
        }
    }

    struct Directory;

    impl AppDirectory for Directory {
        fn lookup(&self, uid: u32) -> Option<ApplicationIdentity> {
            (uid == PRINTER_UID).then(|| ApplicationIdentity::new("printer-app", "Printer", false))
        }
    }

    struct QuietSink;

    impl NotificationSink for QuietSink {
        fn post_policy_notification(&self, _: &ApplicationIdentity, _: Policy, _: SocketAddr) {}
        fn post_preflight_notification(&self, _: &str, _: &str, _: &str) {}
    }

    /// Echoes every packet back through the writer, or fails as told
    #[derive(Default)]
    struct EchoForwarder {
        handled: Mutex<Vec<String>>,
        fail_with: Mutex<Option<fn() -> ForwardError>>,
        shutdowns: AtomicU64,
    }

    impl SessionForwarder for EchoForwarder {
        fn handle(
            &self,
            packet: &[u8],
            app: Arc<ApplicationIdentity>,
            writer: &PacketWriterHandle,
        ) -> Result<(), ForwardError> {
            self.handled.lock().push(app.package_name.clone());
            if let Some(make_error) = *self.fail_with.lock() {
                return Err(make_error());
            }
            writer.write(packet.to_vec());
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Preflight transport that takes its time, then refuses
    struct SlowTransport {
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl PreflightTransport for SlowTransport {
        fn send_preflight(&self, _destination: SocketAddr) -> FirewallResult<PreflightResponse> {
            self.started.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(PreflightResponse {
                status: 404,
                allow_private_network: None,
            })
        }
    }

    struct Harness {
        interface: Arc<ScriptedInterface>,
        sink: Arc<CollectingSink>,
        forwarder: Arc<EchoForwarder>,
        store: MemoryFlowStore,
        recorder: FlowRecorder,
        packet_loop: PacketLoop,
    }

    fn harness(steps: Vec<Step>, global: Policy, entries: &[AccessPolicyEntry]) -> Harness {
        harness_with_preflight(steps, global, entries, None)
    }

    fn harness_with_preflight(
        steps: Vec<Step>,
        global: Policy,
        entries: &[AccessPolicyEntry],
        transport: Option<Arc<dyn PreflightTransport>>,
    ) -> Harness {
        let firewall = FirewallSettings {
            default_policy: global,
            ..FirewallSettings::default()
        };
        let preflight = PreflightConfig::default();
        let policies = Arc::new(PolicyCache::from_settings(&firewall, entries));
        let mut engine = DecisionEngine::new(
            policies,
            OwnerResolver::with_default_candidates(Arc::new(FixedOwner(Some(PRINTER_UID)))),
            Arc::new(AppIdentityCache::new(Arc::new(Directory))),
            Arc::new(QuietSink),
        );
        if let Some(transport) = transport {
            engine = engine.with_prober(Arc::new(PreflightProber::new(transport, &preflight)));
        }

        let interface = ScriptedInterface::new(steps);
        let sink = Arc::new(CollectingSink::default());
        let forwarder = Arc::new(EchoForwarder::default());
        let store = MemoryFlowStore::default();
        let recorder = FlowRecorder::start(Box::new(store.clone()), 64).unwrap();

        let packet_loop = PacketLoop::new(LoopComponents {
            interface: interface.clone(),
            sink: sink.clone(),
            engine: Arc::new(engine),
            dpi: Arc::new(DpiBridge::new(Box::new(SignatureClassifier::new()))),
            forwarder: forwarder.clone(),
            recorder: recorder.clone(),
            writer_queue_capacity: 16,
            flow_idle_timeout: Duration::from_secs(60),
            stop_timeout: reader_stop_timeout(&preflight),
        });

        Harness {
            interface,
            sink,
            forwarder,
            store,
            recorder,
            packet_loop,
        }
    }

    fn printer_packet() -> Vec<u8> {
        ipv4_udp(
            (Ipv4Addr::new(192, 168, 1, 20), 40000),
            (Ipv4Addr::new(192, 168, 1, 50), 631),
            b"print job",
        )
    }

    fn dns_query_packet() -> Vec<u8> {
        let mut query = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(b"\x07printer\x05local\x00\x00\x01\x00\x01");
        ipv4_udp(
            (Ipv4Addr::new(192, 168, 1, 20), 40001),
            (Ipv4Addr::new(192, 168, 1, 1), 53),
            &query,
        )
    }

    fn block(package: &str) -> AccessPolicyEntry {
        AccessPolicyEntry {
            package_name: package.to_string(),
            policy: Policy::Block,
        }
    }

    #[test]
    fn test_spurious_wakeups_do_not_stop_the_loop() {
        let h = harness(
            vec![Step::Empty, Step::Empty, Step::Packet(printer_packet()), Step::Closed],
            Policy::Allow,
            &[],
        );
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| !h.packet_loop.is_running()));
        let stats = h.packet_loop.stats();
        assert_eq!(stats.spurious_wakeups.load(Ordering::Relaxed), 2);
        assert_eq!(stats.packets_read.load(Ordering::Relaxed), 1);
        assert_eq!(stats.forwarded.load(Ordering::Relaxed), 1);
        assert_eq!(*h.forwarder.handled.lock(), vec!["printer-app".to_string()]);

        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_allowed_packet_reply_reaches_the_interface() {
        let packet = printer_packet();
        let h = harness(vec![Step::Packet(packet.clone())], Policy::Allow, &[]);
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| h.sink.packets.lock().len() == 1));
        assert_eq!(h.sink.packets.lock()[0], packet);

        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_blocked_packet_is_recorded_not_forwarded() {
        let packet = dns_query_packet();
        let size = packet.len() as u64;
        let h = harness(vec![Step::Packet(packet)], Policy::Allow, &[block("printer-app")]);
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| h.store.flows.lock().len() == 1));
        {
            let flows = h.store.flows.lock();
            let flow = &flows[0];
            assert_eq!(flow.applied_policy, Policy::Block);
            assert_eq!(flow.packet_count_egress, 1);
            assert_eq!(flow.data_egress, size);
            assert_eq!(flow.app_id(), "printer-app");
            assert_eq!(flow.dpi_protocol.as_deref(), Some("DNS"));
        }
        assert!(h.forwarder.handled.lock().is_empty());
        assert_eq!(h.packet_loop.stats().blocked.load(Ordering::Relaxed), 1);

        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_malformed_packet_is_dropped_and_loop_continues() {
        let h = harness(
            vec![Step::Packet(vec![0x45, 0x00]), Step::Packet(printer_packet())],
            Policy::Allow,
            &[],
        );
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| h.packet_loop.stats().forwarded.load(Ordering::Relaxed) == 1));
        assert_eq!(h.packet_loop.stats().parse_errors.load(Ordering::Relaxed), 1);
        assert!(h.packet_loop.is_running());

        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_recoverable_forward_error_keeps_running() {
        let h = harness(
            vec![Step::Packet(printer_packet()), Step::Packet(printer_packet())],
            Policy::Allow,
            &[],
        );
        *h.forwarder.fail_with.lock() = Some(|| {
            ForwardError::Io(io::Error::from_raw_os_error(libc::ENETUNREACH))
        });
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| h.packet_loop.stats().forward_errors.load(Ordering::Relaxed) == 2));
        assert!(h.packet_loop.is_running());
        assert_eq!(h.packet_loop.stats().forwarded.load(Ordering::Relaxed), 0);

        h.packet_loop.stop();
        h.recorder.stop();
        // Nothing left the host, so there is no allowed flow to record
        assert!(h.store.flows.lock().is_empty());
    }

    #[test]
    fn test_unexpected_forward_error_stops_the_loop() {
        let h = harness(
            vec![Step::Packet(printer_packet()), Step::Packet(printer_packet())],
            Policy::Allow,
            &[],
        );
        *h.forwarder.fail_with.lock() = Some(|| ForwardError::Unexpected("session table corrupt".to_string()));
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| !h.packet_loop.is_running()));
        assert_eq!(h.forwarder.handled.lock().len(), 1);
        assert_eq!(h.forwarder.shutdowns.load(Ordering::SeqCst), 1);
        assert!(h.interface.closed.load(Ordering::SeqCst));

        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_read_error_stops_the_loop() {
        let h = harness(vec![Step::Fail(io::ErrorKind::BrokenPipe)], Policy::Allow, &[]);
        h.packet_loop.start().unwrap();
        assert!(wait_for(|| !h.packet_loop.is_running()));
        h.packet_loop.stop();
        h.recorder.stop();
    }

    #[test]
    fn test_start_twice_and_stop_twice_are_no_ops() {
        let h = harness(vec![], Policy::Allow, &[]);
        h.packet_loop.start().unwrap();
        let session = h.packet_loop.session_id();
        assert!(session.is_some());

        h.packet_loop.start().unwrap();
        assert_eq!(h.packet_loop.session_id(), session);

        h.packet_loop.stop();
        assert_eq!(h.packet_loop.state(), LoopState::Stopped);
        h.packet_loop.stop();
        assert_eq!(h.forwarder.shutdowns.load(Ordering::SeqCst), 1);
        h.recorder.stop();
    }

    #[test]
    fn test_stop_releases_resources_and_closes_session() {
        let h = harness(vec![], Policy::Allow, &[]);
        h.packet_loop.start().unwrap();
        h.packet_loop.stop();

        assert!(h.interface.closed.load(Ordering::SeqCst));
        assert_eq!(h.forwarder.shutdowns.load(Ordering::SeqCst), 1);
        assert!(h.packet_loop.session_id().is_none());

        assert!(wait_for(|| h.store.sessions.lock().len() == 2));
        let sessions = h.store.sessions.lock();
        assert!(sessions[0].is_open());
        assert!(!sessions[1].is_open());
        assert_eq!(sessions[0].id, sessions[1].id);
        drop(sessions);
        h.recorder.stop();
    }

    #[test]
    fn test_allowed_flow_recorded_before_session_close() {
        let packet = printer_packet();
        let h = harness(
            vec![Step::Packet(packet.clone()), Step::Packet(packet.clone())],
            Policy::Allow,
            &[],
        );
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| h.packet_loop.stats().forwarded.load(Ordering::Relaxed) == 2));
        h.packet_loop.stop();
        h.recorder.stop();

        let flows = h.store.flows.lock();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].applied_policy, Policy::Allow);
        assert_eq!(flows[0].app_id(), "printer-app");
        assert_eq!(flows[0].packet_count_egress, 2);
        assert_eq!(flows[0].data_egress, 2 * packet.len() as u64);
        assert_eq!(*h.store.order.lock(), vec!["session", "flow", "session"]);
    }

    #[test]
    fn test_stop_waits_for_preflight_in_flight() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(500),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let syn = ipv4_tcp_flags(
            (Ipv4Addr::new(192, 168, 1, 20), 50000),
            (Ipv4Addr::new(192, 168, 1, 50), 80),
            TCP_SYN,
            &[],
        );
        let h = harness_with_preflight(vec![Step::Packet(syn)], Policy::Block, &[], Some(transport.clone()));
        h.packet_loop.start().unwrap();

        assert!(wait_for(|| transport.started.load(Ordering::SeqCst) == 1));
        h.packet_loop.stop();

        assert_eq!(transport.finished.load(Ordering::SeqCst), 1);
        assert_eq!(h.packet_loop.stats().blocked.load(Ordering::Relaxed), 1);
        assert_eq!(h.packet_loop.state(), LoopState::Stopped);

        h.recorder.stop();
        let flows = h.store.flows.lock();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].applied_policy, Policy::Block);
        assert_eq!(flows[0].remote.port(), 80);
        assert_eq!(*h.store.order.lock(), vec!["session", "flow", "session"]);
    }

    #[test]
    fn test_release_from_an_earlier_run_is_ignored() {
        let h = harness(vec![], Policy::Allow, &[]);
        h.packet_loop.start().unwrap();
        let session = h.packet_loop.session_id();

        // Generation 0 never ran; the current run is generation 1
        h.packet_loop.inner.release(Some(0));
        assert!(h.packet_loop.is_running());
        assert_eq!(h.packet_loop.session_id(), session);
        assert_eq!(h.forwarder.shutdowns.load(Ordering::SeqCst), 0);

        h.packet_loop.stop();
        assert_eq!(h.forwarder.shutdowns.load(Ordering::SeqCst), 1);
        h.recorder.stop();
    }

    #[test]
    fn test_stop_timeout_covers_a_full_preflight() {
        let config = PreflightConfig {
            timeout_secs: 5,
            ..PreflightConfig::default()
        };
        let timeout = reader_stop_timeout(&config);
        assert!(timeout >= Duration::from_secs(5) + READ_POLL_TIMEOUT);
        assert!(timeout > THREAD_JOIN_TIMEOUT);
    }

    #[test]
    fn test_forward_error_classification() {
        let recoverable = [
            ForwardError::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
            ForwardError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
            ForwardError::Io(io::Error::from_raw_os_error(libc::ENETUNREACH)),
            ForwardError::Io(io::Error::from_raw_os_error(libc::EMFILE)),
            ForwardError::Io(io::Error::from_raw_os_error(libc::ENFILE)),
        ];
        assert!(recoverable.iter().all(ForwardError::is_recoverable));

        assert!(!ForwardError::Io(io::Error::from(io::ErrorKind::InvalidData)).is_recoverable());
        assert!(!ForwardError::Unexpected("boom".to_string()).is_recoverable());
    }
}
