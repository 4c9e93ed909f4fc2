//! Event handler: the cooperative acquisition loop.
//!
//! An [`EventHandler`] provides the source-facing virtual points (read one
//! packet, decode it, process it), while the [`EventLoop`] owns exactly one
//! buffer and one statistics record and runs the loop: read, enqueue, flush
//! when due, dispatch to the per-packet user hook. The loop can be run inline
//! or spawned into a named background thread, in which case cancellation is
//! cooperative: `stop()` clears a shared flag that is polled between source
//! reads, so the termination latency is bounded by the source read timeout.

use std::error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::buf::{BufferError, PacketBuffer, Projection, WriteMode};
use crate::pkt::{Packet, PacketError, PacketStatistics};

/// Error that may occur in the acquisition loop.
#[derive(Debug)]
pub enum EventError {
    /// The source failed while reading a packet; this terminates the run.
    Source(io::Error),
    /// The buffer could not be flushed.
    Buffer(BufferError),
    /// The end-of-run marker did not show up where expected while draining
    /// the pending packets.
    RunEndMarkerMismatch {
        /// The expected marker byte.
        expected: u8,
        /// The byte actually found, if any.
        actual: Option<u8>,
    },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Source(err) => write!(f, "source error while reading a packet: {err}"),
            EventError::Buffer(err) => write!(f, "{err}"),
            EventError::RunEndMarkerMismatch { expected, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "run end marker mismatch (expected {expected:#x}, found {actual:#x})"
                ),
                None => write!(
                    f,
                    "run end marker (expected {expected:#x}) not found in the residual input"
                ),
            },
        }
    }
}

impl error::Error for EventError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            EventError::Source(err) => Some(err),
            EventError::Buffer(err) => Some(err),
            EventError::RunEndMarkerMismatch { .. } => None,
        }
    }
}

impl From<BufferError> for EventError {
    fn from(err: BufferError) -> Self {
        EventError::Buffer(err)
    }
}

/// The user-supplied virtual points of the acquisition loop.
pub trait EventHandler: Send {
    /// The packet type this handler produces.
    type Packet: Packet + Send + 'static;

    /// Read the raw bytes of a single packet from the source.
    ///
    /// This is the only blocking call in the acquisition loop; a failure
    /// terminates the run.
    fn read_packet(&mut self) -> io::Result<Vec<u8>>;

    /// Decode the raw bytes into a packet. Defaults to the packet `unpack`.
    fn decode_packet(&self, data: &[u8]) -> Result<Self::Packet, PacketError> {
        Self::Packet::unpack(data)
    }

    /// Process a single packet (histograms, strip charts and the like).
    /// Called once per packet; must not block.
    fn process_packet(&mut self, _packet: &Self::Packet) {}

    /// Read whatever bytes are still pending on the source after a stop
    /// command. Sources with no pipeline latency can keep the default.
    fn read_pending(&mut self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// The acquisition worker: one buffer, one statistics record, one handler.
pub struct EventLoop<H: EventHandler> {
    handler: H,
    buffer: Arc<dyn PacketBuffer<H::Packet>>,
    statistics: Arc<PacketStatistics>,
    running: Arc<AtomicBool>,
}

impl<H: EventHandler> EventLoop<H> {
    /// Create a new event loop around a handler, a buffer and a (typically
    /// shared) statistics record.
    pub fn new(
        handler: H,
        buffer: Arc<dyn PacketBuffer<H::Packet>>,
        statistics: Arc<PacketStatistics>,
    ) -> Self {
        Self {
            handler,
            buffer,
            statistics,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A handle to the underlying buffer.
    pub fn buffer(&self) -> Arc<dyn PacketBuffer<H::Packet>> {
        Arc::clone(&self.buffer)
    }

    /// A handle to the underlying statistics record.
    pub fn statistics(&self) -> Arc<PacketStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Wire the canonical binary sink to the given output file.
    pub fn set_output_file(&self, path: &Path) -> Result<(), BufferError> {
        self.buffer.add_sink(path, WriteMode::Binary, None, None)
    }

    /// Wire a custom projection sink.
    pub fn add_custom_sink(
        &self,
        path: &Path,
        mode: WriteMode,
        projection: Option<Projection<H::Packet>>,
        header: Option<&[u8]>,
    ) -> Result<(), BufferError> {
        self.buffer.add_sink(path, mode, projection, header)
    }

    /// Write all the buffered packets to the attached sinks, updating the
    /// statistics.
    pub fn flush_buffer(&self) -> Result<(), BufferError> {
        let (packets_written, bytes_written) = self.buffer.flush()?;
        self.statistics.update(0, packets_written, bytes_written);
        Ok(())
    }

    /// Request a cooperative stop. The in-progress source read is not
    /// interrupted.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Read one packet from the source, enqueue it, flush if due and hand it
    /// to the per-packet hook. Packets that fail to decode are dropped from
    /// the stream (the processed counter still moves on).
    fn acquire_packet(&mut self) -> Result<(), EventError> {
        let data = self.handler.read_packet().map_err(EventError::Source)?;
        let packet = match self.handler.decode_packet(&data) {
            Ok(packet) => packet,
            Err(err) => {
                self.statistics.update(1, 0, 0);
                warn!("Dropping packet that failed to decode ({err})");
                return Ok(());
            }
        };
        self.buffer.put(packet.clone());
        self.statistics.update(1, 0, 0);
        if self.buffer.flush_needed() {
            self.flush_buffer()?;
        }
        self.handler.process_packet(&packet);
        Ok(())
    }

    /// Run the acquisition loop until a stop is requested or the source
    /// fails, then perform a final flush.
    pub fn run(&mut self) -> Result<(), EventError> {
        // The buffer should be empty at this point, as the previous run ended
        // with a flush.
        if self.buffer.size() > 0 {
            warn!("Event buffer is not empty at the start of the run, clearing it...");
            self.buffer.clear();
        }
        let mut result = Ok(());
        while self.running.load(Ordering::Acquire) {
            if let Err(err) = self.acquire_packet() {
                result = Err(err);
                break;
            }
        }
        let flush_result = self.flush_buffer();
        result.and(flush_result.map_err(EventError::from))
    }

    /// Drain the packets a source emits after a stop command, then consume
    /// the end-of-run marker.
    ///
    /// Sleep for one sampling interval so that the source pipeline has
    /// settled, read the residual bytes, enqueue and flush every whole
    /// packet, and finally demand the end-of-run marker byte. Returns the
    /// number of trailing packets drained.
    pub fn wait_pending_packets(
        &mut self,
        sampling_interval: Duration,
        end_marker: u8,
    ) -> Result<usize, EventError> {
        info!("Waiting for pending packet(s)...");
        thread::sleep(sampling_interval);
        let data = self.handler.read_pending().map_err(EventError::Source)?;
        let packet_size = <H::Packet as Packet>::SIZE;
        let num_packets = data.len() / packet_size;
        if data.len() % packet_size != 1 {
            warn!(
                "{} byte(s) pending on the source, expected a whole number of \
                 {packet_size}-byte packet(s) plus the end-of-run marker...",
                data.len()
            );
        }
        if num_packets > 0 {
            info!("Reading the last {num_packets} packet(s) from the source...");
            for chunk in data.chunks_exact(packet_size).take(num_packets) {
                match self.handler.decode_packet(chunk) {
                    Ok(packet) => {
                        self.buffer.put(packet.clone());
                        self.statistics.update(1, 0, 0);
                        self.handler.process_packet(&packet);
                    }
                    Err(err) => {
                        self.statistics.update(1, 0, 0);
                        warn!("Dropping pending packet that failed to decode ({err})");
                    }
                }
            }
            self.flush_buffer()?;
        }
        match data.get(num_packets * packet_size) {
            Some(&marker) if marker == end_marker => {
                info!("Run end marker correctly read.");
                Ok(num_packets)
            }
            actual => Err(EventError::RunEndMarkerMismatch {
                expected: end_marker,
                actual: actual.copied(),
            }),
        }
    }
}

impl<H: EventHandler> fmt::Debug for EventLoop<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("buffered", &self.buffer.size())
            .finish()
    }
}

impl<H: EventHandler + 'static> EventLoop<H> {
    /// Run the acquisition loop in a named background thread.
    pub fn spawn(self) -> io::Result<BackgroundEventLoop> {
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);
        let mut event_loop = self;
        let guard = thread::Builder::new()
            .name("daq-worker".into())
            .spawn(move || event_loop.run())?;
        Ok(BackgroundEventLoop { guard, running })
    }
}

/// Guard over an acquisition loop running in a background thread.
pub struct BackgroundEventLoop {
    guard: JoinHandle<Result<(), EventError>>,
    running: Arc<AtomicBool>,
}

impl BackgroundEventLoop {
    /// Request a cooperative stop; the worker notices at the next iteration
    /// of the loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Join the worker, waiting up to `timeout`. Returns `None` if the
    /// worker is still stuck in a source read when the timeout expires, in
    /// which case the thread is abandoned.
    pub fn join(self, timeout: Duration) -> Option<Result<(), EventError>> {
        let start = Instant::now();
        while !self.guard.is_finished() {
            if start.elapsed() > timeout {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
        match self.guard.join() {
            Ok(result) => Some(result),
            Err(_) => {
                warn!("Acquisition thread panicked");
                Some(Ok(()))
            }
        }
    }
}

impl fmt::Debug for BackgroundEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackgroundEventLoop {{ running: {} }}",
            self.running.load(Ordering::Relaxed)
        )
    }
}
