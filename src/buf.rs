//! Data buffering and file sinks.
//!
//! A buffer is a bounded concurrent queue of packets with a flush policy and
//! an ordered list of attached [`Sink`]s. The first sink attached to a buffer
//! is always the canonical binary sink, writing each packet payload verbatim;
//! later sinks may carry a projection rendering each packet into some other
//! encoding (text rows, hex dumps and the like). Two queue disciplines are
//! provided behind the [`PacketBuffer`] trait: a bounded FIFO whose `put`
//! blocks while the queue is full, and a circular buffer whose `put`
//! overwrites the oldest pending packet.

use std::collections::VecDeque;
use std::error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::pkt::Packet;

/// The mode in which a sink file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Raw binary records.
    Binary,
    /// UTF-8 encoded text rows.
    Text,
}

/// Error that may occur while sizing, wiring or flushing a buffer.
#[derive(Debug)]
pub enum BufferError {
    /// The physical queue capacity does not exceed the flush watermark, which
    /// would make the buffer drop packets instead of flushing.
    Sizing {
        /// The physical capacity.
        max_size: usize,
        /// The flush watermark.
        flush_size: usize,
    },
    /// A flush was requested with no sinks attached.
    NoSinks,
    /// A sink was pointed at a path that already exists; sinks never
    /// overwrite.
    FileExists(PathBuf),
    /// The first sink attached to a buffer must be the canonical binary sink,
    /// with no projection.
    FirstSinkMustBeCanonical,
    /// Underlying I/O failure.
    Io(io::Error),
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Sizing {
                max_size,
                flush_size,
            } => write!(
                f,
                "buffer physical size ({max_size}) <= flush size ({flush_size})"
            ),
            BufferError::NoSinks => write!(f, "no sinks attached to the buffer, cannot flush"),
            BufferError::FileExists(path) => {
                write!(f, "output file {} already exists", path.display())
            }
            BufferError::FirstSinkMustBeCanonical => {
                write!(f, "the first sink of a buffer cannot carry a projection")
            }
            BufferError::Io(err) => write!(f, "sink I/O error: {err}"),
        }
    }
}

impl error::Error for BufferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            BufferError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BufferError {
    fn from(err: io::Error) -> Self {
        BufferError::Io(err)
    }
}

/// A user function rendering a packet into the bytes written by a projection
/// sink (one text row, a hex dump and the like).
pub type Projection<P> = Box<dyn Fn(&P) -> Vec<u8> + Send>;

/// One named output destination: a file path, a write mode and an optional
/// projection. The canonical sink has no projection and writes each packet
/// payload verbatim.
///
/// The sink file is created (and the optional header written and flushed) at
/// construction, then closed; every flush reopens the file in append mode. A
/// single short-lived append per flush is fine at laboratory rates and avoids
/// holding descriptors across long pauses.
pub struct Sink<P> {
    path: PathBuf,
    mode: WriteMode,
    projection: Option<Projection<P>>,
}

impl<P: Packet> Sink<P> {
    /// Create a sink, refusing to overwrite an existing file. If a header is
    /// supplied it is written and flushed immediately; the file handle is
    /// then closed and every subsequent write reopens the file on demand.
    pub fn new(
        path: &Path,
        mode: WriteMode,
        projection: Option<Projection<P>>,
        header: Option<&[u8]>,
    ) -> Result<Self, BufferError> {
        if path.exists() {
            return Err(BufferError::FileExists(path.to_path_buf()));
        }
        info!("Creating output sink {}...", path.display());
        let mut file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)?;
        if let Some(header) = header {
            file.write_all(header)?;
            file.flush()?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            projection,
        })
    }

    fn reopen(&self) -> io::Result<File> {
        OpenOptions::new().append(true).open(&self.path)
    }

    /// Write a single packet to the given file handle and return the number
    /// of bytes written.
    fn write_packet(&self, file: &mut File, packet: &P) -> io::Result<usize> {
        match &self.projection {
            None => {
                file.write_all(packet.payload())?;
                Ok(packet.payload().len())
            }
            Some(projection) => {
                let data = projection(packet);
                file.write_all(&data)?;
                Ok(data.len())
            }
        }
    }

    /// The path this sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The write mode of this sink.
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// True for the canonical binary sink.
    pub fn is_canonical(&self) -> bool {
        self.projection.is_none()
    }
}

impl<P> fmt::Debug for Sink<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("canonical", &self.projection.is_none())
            .finish()
    }
}

/// The buffer public contract, shared by the two queue disciplines.
///
/// All the methods take `&self`: the implementations lock internally so that
/// `put` from the acquisition thread and `flush` from whoever drives the
/// flushing interleave safely.
pub trait PacketBuffer<P: Packet>: Send + Sync {
    /// Put a packet into the buffer. Whether this blocks or drops when the
    /// buffer is full is the discipline's choice.
    fn put(&self, packet: P);

    /// Pop the oldest packet, if any.
    fn pop(&self) -> Option<P>;

    /// The number of packets currently buffered.
    fn size(&self) -> usize;

    /// Empty the queue.
    fn clear(&self);

    /// Attach a sink. The first sink must be canonical (no projection).
    fn add_sink(
        &self,
        path: &Path,
        mode: WriteMode,
        projection: Option<Projection<P>>,
        header: Option<&[u8]>,
    ) -> Result<(), BufferError>;

    /// Detach all the sinks.
    fn disconnect(&self);

    /// The number of sinks currently attached.
    fn num_sinks(&self) -> usize;

    /// True if the queue length has reached the flush watermark.
    fn almost_full(&self) -> bool;

    /// Time elapsed since the last flush (or since the buffer creation, in
    /// case it has never been flushed).
    fn time_since_last_flush(&self) -> Duration;

    /// True if the buffer needs to be flushed, either because it is almost
    /// full or because the flush interval has expired.
    fn flush_needed(&self) -> bool;

    /// Write the buffer content to all the attached sinks and return the
    /// number of packets drained along with the total number of bytes
    /// written.
    ///
    /// The packet count is snapshotted at call time: packets put while the
    /// flush is in progress wait for the next call. Each snapshotted packet
    /// is popped once and written to every sink, payload first, before the
    /// next packet is touched, so that the output files grow in lockstep.
    fn flush(&self) -> Result<(usize, u64), BufferError>;
}

/// The machinery shared by the two disciplines: the locked queue, the sink
/// list and the flush bookkeeping.
struct BufferCore<P: Packet> {
    max_size: usize,
    flush_size: usize,
    flush_interval: Duration,
    queue: Mutex<VecDeque<P>>,
    space_available: Condvar,
    sinks: Mutex<Vec<Sink<P>>>,
    last_flush: Mutex<Instant>,
    // Serializes flush() with itself; put() only ever contends on the queue.
    flush_lock: Mutex<()>,
}

impl<P: Packet> BufferCore<P> {
    fn new(
        max_size: usize,
        flush_size: usize,
        flush_interval: Duration,
    ) -> Result<Self, BufferError> {
        if max_size <= flush_size {
            return Err(BufferError::Sizing {
                max_size,
                flush_size,
            });
        }
        Ok(Self {
            max_size,
            flush_size,
            flush_interval,
            queue: Mutex::new(VecDeque::with_capacity(max_size)),
            space_available: Condvar::new(),
            sinks: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            flush_lock: Mutex::new(()),
        })
    }

    fn pop(&self) -> Option<P> {
        let packet = self.queue.lock().pop_front();
        if packet.is_some() {
            self.space_available.notify_one();
        }
        packet
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn clear(&self) {
        self.queue.lock().clear();
        self.space_available.notify_all();
    }

    fn add_sink(
        &self,
        path: &Path,
        mode: WriteMode,
        projection: Option<Projection<P>>,
        header: Option<&[u8]>,
    ) -> Result<(), BufferError> {
        let mut sinks = self.sinks.lock();
        if sinks.is_empty() && projection.is_some() {
            return Err(BufferError::FirstSinkMustBeCanonical);
        }
        sinks.push(Sink::new(path, mode, projection, header)?);
        Ok(())
    }

    fn disconnect(&self) {
        let mut sinks = self.sinks.lock();
        if !sinks.is_empty() {
            info!("Disconnecting {} sink(s) from the buffer...", sinks.len());
            sinks.clear();
        }
    }

    fn num_sinks(&self) -> usize {
        self.sinks.lock().len()
    }

    fn almost_full(&self) -> bool {
        self.size() >= self.flush_size
    }

    fn time_since_last_flush(&self) -> Duration {
        self.last_flush.lock().elapsed()
    }

    fn flush_needed(&self) -> bool {
        self.almost_full() || self.time_since_last_flush() > self.flush_interval
    }

    fn flush(&self) -> Result<(usize, u64), BufferError> {
        let _guard = self.flush_lock.lock();
        let sinks = self.sinks.lock();
        if sinks.is_empty() {
            return Err(BufferError::NoSinks);
        }
        // Cache the number of packets to be drained: packets put while we are
        // writing wait for the next flush.
        let num_packets = self.size();
        *self.last_flush.lock() = Instant::now();
        if num_packets == 0 {
            return Ok((0, 0));
        }
        debug!(
            "Writing {} packet(s) to {} sink(s)...",
            num_packets,
            sinks.len()
        );
        let mut files = Vec::with_capacity(sinks.len());
        for sink in sinks.iter() {
            files.push(sink.reopen()?);
        }
        let mut num_bytes = 0;
        for _ in 0..num_packets {
            // clear() may race us and empty the queue mid-flush.
            let Some(packet) = self.pop() else { break };
            for (sink, file) in sinks.iter().zip(files.iter_mut()) {
                num_bytes += sink.write_packet(file, &packet)? as u64;
            }
        }
        debug!("Done, {num_bytes} byte(s) written to disk.");
        Ok((num_packets, num_bytes))
    }
}

macro_rules! delegate_buffer_impl {
    () => {
        fn pop(&self) -> Option<P> {
            self.core.pop()
        }

        fn size(&self) -> usize {
            self.core.size()
        }

        fn clear(&self) {
            self.core.clear()
        }

        fn add_sink(
            &self,
            path: &Path,
            mode: WriteMode,
            projection: Option<Projection<P>>,
            header: Option<&[u8]>,
        ) -> Result<(), BufferError> {
            self.core.add_sink(path, mode, projection, header)
        }

        fn disconnect(&self) {
            self.core.disconnect()
        }

        fn num_sinks(&self) -> usize {
            self.core.num_sinks()
        }

        fn almost_full(&self) -> bool {
            self.core.almost_full()
        }

        fn time_since_last_flush(&self) -> Duration {
            self.core.time_since_last_flush()
        }

        fn flush_needed(&self) -> bool {
            self.core.flush_needed()
        }

        fn flush(&self) -> Result<(usize, u64), BufferError> {
            self.core.flush()
        }
    };
}

/// Strict first-in-first-out buffer: `put` blocks the calling thread while
/// the queue is at capacity, so no packet is ever dropped.
pub struct FifoBuffer<P: Packet> {
    core: BufferCore<P>,
}

impl<P: Packet> FifoBuffer<P> {
    /// Create a FIFO buffer with the given capacity, flush watermark and
    /// flush interval.
    pub fn new(
        max_size: usize,
        flush_size: usize,
        flush_interval: Duration,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            core: BufferCore::new(max_size, flush_size, flush_interval)?,
        })
    }
}

impl<P: Packet + Send> PacketBuffer<P> for FifoBuffer<P> {
    fn put(&self, packet: P) {
        let mut queue = self.core.queue.lock();
        while queue.len() >= self.core.max_size {
            self.core.space_available.wait(&mut queue);
        }
        queue.push_back(packet);
    }

    delegate_buffer_impl!();
}

impl<P: Packet> fmt::Debug for FifoBuffer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoBuffer")
            .field("max_size", &self.core.max_size)
            .field("flush_size", &self.core.flush_size)
            .field("flush_interval", &self.core.flush_interval)
            .field("size", &self.core.size())
            .finish()
    }
}

/// Fixed-capacity circular buffer: `put` never blocks and overwrites the
/// oldest pending packet when the queue is at capacity.
pub struct CircularBuffer<P: Packet> {
    core: BufferCore<P>,
}

impl<P: Packet> CircularBuffer<P> {
    /// Create a circular buffer with the given capacity, flush watermark and
    /// flush interval.
    pub fn new(
        max_size: usize,
        flush_size: usize,
        flush_interval: Duration,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            core: BufferCore::new(max_size, flush_size, flush_interval)?,
        })
    }
}

impl<P: Packet + Send> PacketBuffer<P> for CircularBuffer<P> {
    fn put(&self, packet: P) {
        let mut queue = self.core.queue.lock();
        if queue.len() >= self.core.max_size {
            debug!("Buffer full, overwriting the oldest pending packet...");
            queue.pop_front();
        }
        queue.push_back(packet);
    }

    delegate_buffer_impl!();
}

impl<P: Packet> fmt::Debug for CircularBuffer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("max_size", &self.core.max_size)
            .field("flush_size", &self.core.flush_size)
            .field("flush_interval", &self.core.flush_interval)
            .field("size", &self.core.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::pkt::{Layout, Packet};

    crate::packetclass! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Readout {
            layout: Layout::BigEndian;
            header: u8 = 0xAA,
            milliseconds: u32,
            adc_value: u16,
        }
    }

    fn readout(milliseconds: u32, adc_value: u16) -> Readout {
        Readout::new(0xAA, milliseconds, adc_value).unwrap()
    }

    const ONE_MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn sizing_invariant() {
        assert!(matches!(
            FifoBuffer::<Readout>::new(5, 5, ONE_MINUTE).unwrap_err(),
            BufferError::Sizing {
                max_size: 5,
                flush_size: 5,
            }
        ));
    }

    #[test]
    fn watermark_trigger() {
        let buffer = FifoBuffer::new(10, 5, ONE_MINUTE).unwrap();
        for index in 0..4 {
            buffer.put(readout(index, 0));
        }
        assert!(!buffer.flush_needed());
        buffer.put(readout(4, 0));
        assert!(buffer.almost_full());
        assert!(buffer.flush_needed());
    }

    #[test]
    fn time_trigger() {
        let buffer = FifoBuffer::<Readout>::new(10, 5, Duration::from_millis(1)).unwrap();
        assert!(!buffer.almost_full());
        std::thread::sleep(Duration::from_millis(5));
        assert!(buffer.flush_needed());
    }

    #[test]
    fn circular_overwrites_oldest() {
        let buffer = CircularBuffer::new(3, 2, ONE_MINUTE).unwrap();
        for index in 0..4 {
            buffer.put(readout(index, 0));
        }
        assert_eq!(buffer.size(), 3);
        // The oldest packet is gone.
        assert_eq!(buffer.pop().unwrap().milliseconds, 1);
    }

    #[test]
    fn first_sink_must_be_canonical() {
        let folder = tempfile::tempdir().unwrap();
        let buffer = FifoBuffer::<Readout>::new(10, 5, ONE_MINUTE).unwrap();
        let projection: Projection<Readout> =
            Box::new(|packet| format!("{}\n", packet.adc_value).into_bytes());
        assert!(matches!(
            buffer
                .add_sink(
                    &folder.path().join("data.txt"),
                    WriteMode::Text,
                    Some(projection),
                    None,
                )
                .unwrap_err(),
            BufferError::FirstSinkMustBeCanonical
        ));
        // With the canonical sink in place a projection sink is welcome.
        buffer
            .add_sink(&folder.path().join("data.dat"), WriteMode::Binary, None, None)
            .unwrap();
        let projection: Projection<Readout> =
            Box::new(|packet| format!("{}\n", packet.adc_value).into_bytes());
        buffer
            .add_sink(
                &folder.path().join("data.txt"),
                WriteMode::Text,
                Some(projection),
                None,
            )
            .unwrap();
        assert_eq!(buffer.num_sinks(), 2);
    }

    #[test]
    fn sinks_never_overwrite() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("data.dat");
        fs::write(&path, b"precious").unwrap();
        let buffer = FifoBuffer::<Readout>::new(10, 5, ONE_MINUTE).unwrap();
        assert!(matches!(
            buffer
                .add_sink(&path, WriteMode::Binary, None, None)
                .unwrap_err(),
            BufferError::FileExists(_)
        ));
        // The original file is untouched.
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn flush_with_no_sinks() {
        let buffer = FifoBuffer::<Readout>::new(10, 5, ONE_MINUTE).unwrap();
        assert!(matches!(buffer.flush().unwrap_err(), BufferError::NoSinks));
    }

    #[test]
    fn empty_flush_touches_nothing() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("data.dat");
        let buffer = FifoBuffer::<Readout>::new(10, 5, ONE_MINUTE).unwrap();
        buffer
            .add_sink(&path, WriteMode::Binary, None, None)
            .unwrap();
        assert_eq!(buffer.flush().unwrap(), (0, 0));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn fan_out_flush() {
        let folder = tempfile::tempdir().unwrap();
        let binary_path = folder.path().join("data.dat");
        let text_path = folder.path().join("data.txt");
        let buffer = FifoBuffer::new(10, 5, ONE_MINUTE).unwrap();
        buffer
            .add_sink(&binary_path, WriteMode::Binary, None, None)
            .unwrap();
        let projection: Projection<Readout> = Box::new(|packet| {
            format!("{},{}\n", packet.milliseconds, packet.adc_value).into_bytes()
        });
        buffer
            .add_sink(
                &text_path,
                WriteMode::Text,
                Some(projection),
                Some(b"# ms,adc\n"),
            )
            .unwrap();
        buffer.put(readout(100, 1));
        buffer.put(readout(200, 2));
        buffer.put(readout(300, 3));
        let (num_packets, num_bytes) = buffer.flush().unwrap();
        assert_eq!(num_packets, 3);
        assert!(num_bytes > 0);
        assert_eq!(buffer.size(), 0);
        assert_eq!(fs::metadata(&binary_path).unwrap().len(), 21);
        let text = fs::read_to_string(&text_path).unwrap();
        assert_eq!(text, "# ms,adc\n100,1\n200,2\n300,3\n");
    }

    #[test]
    fn flush_appends_across_calls() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("data.dat");
        let buffer = FifoBuffer::new(10, 5, ONE_MINUTE).unwrap();
        buffer
            .add_sink(&path, WriteMode::Binary, None, None)
            .unwrap();
        buffer.put(readout(1, 1));
        buffer.flush().unwrap();
        buffer.put(readout(2, 2));
        buffer.flush().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * Readout::SIZE as u64);
    }

    #[test]
    fn concurrent_put_and_flush() {
        use std::sync::Arc;

        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("data.dat");
        let buffer = Arc::new(FifoBuffer::new(100, 50, ONE_MINUTE).unwrap());
        buffer
            .add_sink(&path, WriteMode::Binary, None, None)
            .unwrap();
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for index in 0..500 {
                    buffer.put(readout(index, 0));
                }
            })
        };
        let flusher = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut total = 0;
                while total < 500 {
                    let (num_packets, _) = buffer.flush().unwrap();
                    total += num_packets;
                }
                total
            })
        };
        writer.join().unwrap();
        assert_eq!(flusher.join().unwrap(), 500);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            500 * Readout::SIZE as u64
        );
    }
}
