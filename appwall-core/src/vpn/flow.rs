//! Traffic flows and their persistence
//!
//! A [`TrafficFlow`] is one local/remote socket pair over one transport
//! protocol, with per-direction packet and byte counters. The packet loop
//! creates a single-packet flow for every blocked packet, and accumulates
//! allowed packets per socket pair in a [`FlowTable`](super::flow_table::FlowTable).
//! Both end up in the [`FlowRecorder`], which writes them to a [`FlowStore`]
//! on its own thread. The loop never waits for a write; a full queue drops
//! the record.

use super::dpi::Classification;
use super::ip_header::{IpPacketHeader, TransportProtocol};
use super::{FirewallError, FirewallResult, Policy};
use crate::apps::{ApplicationIdentity, UNKNOWN_PACKAGE};
use crate::utils::join_with_timeout;
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// How often the writer thread checks its stop flag
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficFlow {
    pub uuid: Uuid,
    /// `None` when the owner is unknown
    pub app: Option<Arc<ApplicationIdentity>>,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub protocol: TransportProtocol,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub packet_count_egress: u64,
    pub data_egress: u64,
    pub packet_count_ingress: u64,
    pub data_ingress: u64,
    pub tcp_established_reached: bool,
    pub applied_policy: Policy,
    pub detected_protocols: Vec<String>,
    /// Milliseconds since the epoch of `time_end` at the last upload, 0 if never
    pub time_end_at_last_sync: i64,
    pub dpi_report: Option<String>,
    pub dpi_protocol: Option<String>,
}

impl TrafficFlow {
    /// Fresh flow with zeroed counters
    pub fn new(
        app: Option<Arc<ApplicationIdentity>>,
        remote: SocketAddr,
        local: SocketAddr,
        protocol: TransportProtocol,
        applied_policy: Policy,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            app,
            remote,
            local,
            protocol,
            time_start: now,
            time_end: now,
            packet_count_egress: 0,
            data_egress: 0,
            packet_count_ingress: 0,
            data_ingress: 0,
            tcp_established_reached: false,
            applied_policy,
            detected_protocols: Vec::new(),
            time_end_at_last_sync: 0,
            dpi_report: None,
            dpi_protocol: None,
        }
    }

    /// Record of one blocked outbound packet: one egress packet of
    /// `header.size` bytes, policy BLOCK.
    pub fn from_blocked_packet(
        header: &IpPacketHeader,
        app: Arc<ApplicationIdentity>,
        classification: Option<Classification>,
    ) -> Self {
        let app = (!app.is_unknown()).then_some(app);
        let mut flow = Self::new(
            app,
            header.destination,
            header.source,
            header.protocol,
            Policy::Block,
        );
        flow.increase_egress(1, header.size as u64);
        if let Some(classification) = classification {
            flow.apply_classification(classification);
        }
        flow
    }

    pub fn apply_classification(&mut self, classification: Classification) {
        if !self.detected_protocols.contains(&classification.protocol) {
            self.detected_protocols.push(classification.protocol.clone());
        }
        self.dpi_report = Some(classification.report_json());
        self.dpi_protocol = Some(classification.protocol);
    }

    pub fn increase_egress(&mut self, packets: u64, bytes: u64) {
        self.packet_count_egress += packets;
        self.data_egress += bytes;
        self.time_end = Utc::now();
    }

    pub fn app_id(&self) -> &str {
        self.app
            .as_ref()
            .map_or(UNKNOWN_PACKAGE, |app| app.package_name.as_str())
    }

    pub fn export(&self) -> FlowExport<'_> {
        FlowExport {
            flow_uuid: self.uuid,
            app_id: self.app_id(),
            time_start: rfc3339(&self.time_start),
            time_end: rfc3339(&self.time_end),
            remote_ip: self.remote.ip().to_string(),
            remote_port: self.remote.port(),
            local_ip: self.local.ip().to_string(),
            local_port: self.local.port(),
            transport_layer_protocol: self.protocol.as_str(),
            packet_count_egress: self.packet_count_egress,
            data_egress: self.data_egress,
            packet_count_ingress: self.packet_count_ingress,
            data_ingress: self.data_ingress,
            detected_protocols: self.detected_protocols.join(","),
            time_end_at_last_sync: self.time_end_at_last_sync,
            dpi_report: self.dpi_report.as_deref().unwrap_or("{}"),
            dpi_protocol: self.dpi_protocol.as_deref().unwrap_or(""),
            tcp_established_reached: (self.protocol == TransportProtocol::Tcp)
                .then_some(self.tcp_established_reached),
        }
    }

    /// Upload-format JSON object
    pub fn to_export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.export()).unwrap_or(serde_json::Value::Null)
    }
}

fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Flat record in the backend's upload format
#[derive(Debug, Serialize)]
pub struct FlowExport<'a> {
    pub flow_uuid: Uuid,
    pub app_id: &'a str,
    pub time_start: String,
    pub time_end: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub transport_layer_protocol: &'static str,
    pub packet_count_egress: u64,
    pub data_egress: u64,
    pub packet_count_ingress: u64,
    pub data_ingress: u64,
    pub detected_protocols: String,
    pub time_end_at_last_sync: i64,
    pub dpi_report: &'a str,
    pub dpi_protocol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_established_reached: Option<bool>,
}

/// One RUNNING period of the packet loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectionSession {
    #[serde(rename = "session_uuid")]
    pub id: Uuid,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub time_start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_rfc3339_opt")]
    pub time_end: Option<DateTime<Utc>>,
}

impl ProtectionSession {
    pub fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            time_start: Utc::now(),
            time_end: None,
        }
    }

    pub fn close(&mut self) {
        self.time_end = Some(Utc::now());
    }

    pub fn is_open(&self) -> bool {
        self.time_end.is_none()
    }
}

fn serialize_rfc3339<S: serde::Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&rfc3339(time))
}

fn serialize_rfc3339_opt<S: serde::Serializer>(
    time: &Option<DateTime<Utc>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match time {
        Some(t) => s.serialize_str(&rfc3339(t)),
        None => s.serialize_none(),
    }
}

/// Where flow records end up. Write-only from the engine's side.
pub trait FlowStore: Send {
    fn insert(&mut self, flow: &TrafficFlow) -> FirewallResult<()>;

    fn insert_session(&mut self, session: &ProtectionSession) -> FirewallResult<()>;
}

/// [`FlowStore`] appending one JSON object per line
pub struct JsonLinesFlowStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesFlowStore {
    pub fn open(path: impl Into<PathBuf>) -> FirewallResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                FirewallError::Persistence(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FirewallError::Persistence(format!("cannot open {}: {}", path.display(), e)))?;

        info!("Recording flows to {:?}", path);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line<T: Serialize>(&mut self, record: &T) -> FirewallResult<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| FirewallError::Persistence(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl FlowStore for JsonLinesFlowStore {
    fn insert(&mut self, flow: &TrafficFlow) -> FirewallResult<()> {
        self.write_line(&flow.export())
    }

    fn insert_session(&mut self, session: &ProtectionSession) -> FirewallResult<()> {
        self.write_line(session)
    }
}

enum FlowRecord {
    Flow(Box<TrafficFlow>),
    Session(ProtectionSession),
}

/// Recorder statistics
#[derive(Default)]
pub struct RecorderStats {
    pub persisted: AtomicU64,
    /// Queue full
    pub dropped: AtomicU64,
    /// Store returned an error
    pub failed: AtomicU64,
}

/// Fire-and-forget front of a [`FlowStore`]. Cheap to clone.
#[derive(Clone)]
pub struct FlowRecorder {
    sender: Sender<FlowRecord>,
    stats: Arc<RecorderStats>,
    stop_flag: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FlowRecorder {
    /// Spawn the writer thread with a queue of `capacity` records
    pub fn start(store: Box<dyn FlowStore>, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let stats = Arc::new(RecorderStats::default());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker_stats = Arc::clone(&stats);
        let worker_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("appwall-flow-writer".to_string())
            .spawn(move || run_flow_writer(store, receiver, worker_stats, worker_stop))?;

        Ok(Self {
            sender,
            stats,
            stop_flag,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Queue a flow. Never blocks; returns false if it was dropped.
    pub fn record(&self, flow: TrafficFlow) -> bool {
        self.enqueue(FlowRecord::Flow(Box::new(flow)))
    }

    pub fn record_session(&self, session: ProtectionSession) -> bool {
        self.enqueue(FlowRecord::Session(session))
    }

    fn enqueue(&self, record: FlowRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Flow queue full, {} record(s) dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Flow writer stopped, record dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    /// Write what is queued, then stop the writer thread
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            join_with_timeout(handle, "Flow writer");
        }
    }
}

fn run_flow_writer(
    mut store: Box<dyn FlowStore>,
    receiver: Receiver<FlowRecord>,
    stats: Arc<RecorderStats>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut write = |record: FlowRecord| {
        let result = match &record {
            FlowRecord::Flow(flow) => store.insert(flow),
            FlowRecord::Session(session) => store.insert_session(session),
        };
        match result {
            Ok(()) => {
                stats.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to persist flow record: {}", e);
            }
        }
    };

    loop {
        match receiver.recv_timeout(WRITER_POLL_INTERVAL) {
            Ok(record) => write(record),
            Err(RecvTimeoutError::Timeout) => {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
    }

    // Drain whatever was queued before stop
    for record in receiver.try_iter() {
        write(record);
    }
    debug!("Flow writer exiting");
}
