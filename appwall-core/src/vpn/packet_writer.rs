//! Outbound packet writer
//!
//! Packets headed back into the virtual interface (replies produced by the
//! session forwarder) are queued here and written on a dedicated thread, so
//! the reader never waits on interface write latency.

use crate::utils::join_with_timeout;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Write side of the virtual interface
pub trait PacketSink: Send + Sync {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

#[derive(Default)]
pub struct WriterStats {
    pub written: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Queue full or writer stopped
    pub dropped: AtomicU64,
    pub failed: AtomicU64,
}

/// Cheap, cloneable producer side of a [`PacketWriter`]
#[derive(Clone)]
pub struct PacketWriterHandle {
    sender: Sender<Vec<u8>>,
    stats: Arc<WriterStats>,
}

impl PacketWriterHandle {
    /// Queue a packet for writing. Never blocks; returns false if dropped.
    pub fn write(&self, packet: Vec<u8>) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped <= 5 || dropped.is_power_of_two() {
                    log::warn!("Writer queue full, dropping outbound packet (event #{})", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Handle whose packets land in the returned receiver. For forwarder tests.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let handle = Self {
            sender,
            stats: Arc::new(WriterStats::default()),
        };
        (handle, receiver)
    }
}

pub struct PacketWriter {
    handle: PacketWriterHandle,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PacketWriter {
    pub fn start(sink: Arc<dyn PacketSink>, capacity: usize) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let stats = Arc::new(WriterStats::default());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker_stats = Arc::clone(&stats);
        let worker_stop = Arc::clone(&stop_flag);
        let worker = thread::Builder::new()
            .name("appwall-writer".to_string())
            .spawn(move || run_packet_writer(sink, receiver, worker_stats, worker_stop))?;

        Ok(Self {
            handle: PacketWriterHandle { sender, stats },
            stop_flag,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> PacketWriterHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.handle.stats
    }

    /// Stop the writer thread. Queued packets that were not written yet are
    /// discarded.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            join_with_timeout(worker, "Writer");
            log::info!(
                "Packet writer stopped - {} written, {} dropped, {} failed",
                self.stats().written.load(Ordering::Relaxed),
                self.stats().dropped.load(Ordering::Relaxed),
                self.stats().failed.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for PacketWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_packet_writer(
    sink: Arc<dyn PacketSink>,
    receiver: Receiver<Vec<u8>>,
    stats: Arc<WriterStats>,
    stop_flag: Arc<AtomicBool>,
) {
    while !stop_flag.load(Ordering::Relaxed) {
        let packet = match receiver.recv_timeout(WRITER_POLL_INTERVAL) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match sink.write_packet(&packet) {
            Ok(()) => {
                stats.written.fetch_add(1, Ordering::Relaxed);
                stats.bytes_written.fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let failed = stats.failed.fetch_add(1, Ordering::Relaxed) + 1;
                if failed <= 5 || failed.is_power_of_two() {
                    log::warn!("Failed to write packet to interface: {} (event #{})", e, failed);
                }
            }
        }
    }
    log::debug!("Packet writer exiting");
}
