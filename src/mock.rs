//! Mock data structures for tests and demos.
//!
//! The mock source serves packets with exponential inter-arrival times and
//! gaussian pulse heights, so that the whole acquisition chain can be
//! exercised end-to-end with no hardware attached.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp, Normal};

use crate::app::{HookError, UserApplication};
use crate::buf::{CircularBuffer, PacketBuffer, WriteMode};
use crate::config::{
    Configuration, ConfigurationSection, FloatConstraints, Parameter, ParameterValue,
};
use crate::event::{BackgroundEventLoop, EventHandler, EventLoop};
use crate::pkt::{Layout, Packet, PacketFile, PacketStatistics};
use crate::runctrl::RunContext;

crate::packetclass! {
    /// A mock event: a native-packed record with a trigger identifier, a
    /// split-second timestamp and a pulse-height value.
    #[derive(Debug, Clone, PartialEq)]
    pub struct MockPacket {
        layout: Layout::NativePacked;
        trigger_id: i32,
        seconds: i32,
        microseconds: i32,
        pha: i32,
    }
}

/// A mock source serving packets Poisson-distributed in time, with a
/// constant underlying rate. The timing is achieved with plain sleeps, so
/// the time distribution is only approximate at high rates.
#[derive(Debug)]
pub struct MockPacketServer {
    rate: f64,
    pha_mu: f64,
    pha_sigma: f64,
    trigger_id: i32,
    start: Instant,
    rng: StdRng,
}

impl MockPacketServer {
    /// Create a server with the given average rate (in Hz) and pulse-height
    /// distribution.
    pub fn new(rate: f64, pha_mu: f64, pha_sigma: f64) -> Self {
        Self {
            rate,
            pha_mu,
            pha_sigma,
            trigger_id: -1,
            start: Instant::now(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Wait for the next event and return it.
    pub fn next_packet(&mut self) -> MockPacket {
        if let Ok(exp) = Exp::new(self.rate) {
            std::thread::sleep(std::time::Duration::from_secs_f64(exp.sample(&mut self.rng)));
        }
        let elapsed = self.start.elapsed();
        let pha = match Normal::new(self.pha_mu, self.pha_sigma) {
            Ok(normal) => normal.sample(&mut self.rng).round() as i32,
            Err(_) => self.pha_mu.round() as i32,
        };
        self.trigger_id += 1;
        MockPacket {
            trigger_id: self.trigger_id,
            seconds: elapsed.as_secs() as i32,
            microseconds: elapsed.subsec_micros() as i32,
            pha,
            payload: Vec::new(),
        }
        .refreshed()
    }
}

impl MockPacket {
    // The struct expression above bypasses new(); re-pack the payload.
    fn refreshed(mut self) -> Self {
        self.payload = self.pack();
        self
    }
}

/// The event handler wrapping a [`MockPacketServer`].
#[derive(Debug)]
pub struct MockEventHandler {
    server: MockPacketServer,
}

impl MockEventHandler {
    /// Create a handler around the given server.
    pub fn new(server: MockPacketServer) -> Self {
        Self { server }
    }
}

impl EventHandler for MockEventHandler {
    type Packet = MockPacket;

    fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.server.next_packet().pack())
    }
}

/// Default physical size of the mock buffer.
const BUFFER_MAX_SIZE: usize = 1000;
/// Default flush watermark of the mock buffer.
const BUFFER_FLUSH_SIZE: usize = 100;
/// Default flush interval of the mock buffer.
const BUFFER_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// The simplest possible user application, reading mock packets into the
/// canonical sink.
#[derive(Debug)]
pub struct MockUserApplication {
    configuration: Configuration,
    statistics: Arc<PacketStatistics>,
    // The buffer outlives the worker, so that a paused run can resume on the
    // same sinks.
    buffer: Option<Arc<CircularBuffer<MockPacket>>>,
    background: Option<BackgroundEventLoop>,
}

impl MockUserApplication {
    /// Create the application with its default configuration.
    pub fn new() -> Self {
        let configuration = Configuration::new("Mock application configuration").add_section(
            ConfigurationSection::new("source")
                .add_parameter(
                    Parameter::float("rate", 100., "Target event rate")
                        .with_units("Hz")
                        .with_format(".1f")
                        .with_float_constraints(FloatConstraints {
                            min: Some(0.),
                            max: None,
                        }),
                )
                .add_parameter(
                    Parameter::float("pha_mu", 1000., "Average pulse height")
                        .with_units("ADC counts")
                        .with_format(".1f")
                        .with_float_constraints(FloatConstraints {
                            min: Some(100.),
                            max: None,
                        }),
                )
                .add_parameter(
                    Parameter::float("pha_sigma", 50., "Pulse height rms")
                        .with_units("ADC counts")
                        .with_format(".1f")
                        .with_float_constraints(FloatConstraints {
                            min: Some(10.),
                            max: None,
                        }),
                ),
        );
        Self {
            configuration,
            statistics: Arc::new(PacketStatistics::new()),
            buffer: None,
            background: None,
        }
    }

    fn float_value(&self, name: &str, default: f64) -> f64 {
        match self.configuration.value("source", name) {
            Some(ParameterValue::Float(value)) => *value,
            _ => default,
        }
    }

    fn server(&self) -> MockPacketServer {
        MockPacketServer::new(
            self.float_value("rate", 100.),
            self.float_value("pha_mu", 1000.),
            self.float_value("pha_sigma", 50.),
        )
    }

    /// Spawn a fresh worker on the buffer of the current run.
    fn spawn_worker(&mut self) -> Result<(), HookError> {
        let Some(buffer) = &self.buffer else {
            return Err(HookError::Io(io::Error::other("no buffer wired")));
        };
        let event_loop = EventLoop::new(
            MockEventHandler::new(self.server()),
            Arc::clone(buffer) as Arc<dyn PacketBuffer<MockPacket>>,
            Arc::clone(&self.statistics),
        );
        self.background = Some(event_loop.spawn()?);
        Ok(())
    }

    fn halt(&mut self) -> Result<(), HookError> {
        if let Some(background) = self.background.take() {
            background.stop();
            match background.join(std::time::Duration::from_secs(5)) {
                Some(result) => result?,
                None => return Err(HookError::WorkerJoinTimeout),
            }
        }
        Ok(())
    }
}

impl Default for MockUserApplication {
    fn default() -> Self {
        Self::new()
    }
}

impl UserApplication for MockUserApplication {
    fn name(&self) -> &str {
        "mock"
    }

    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn configuration_mut(&mut self) -> &mut Configuration {
        &mut self.configuration
    }

    fn statistics(&self) -> Arc<PacketStatistics> {
        Arc::clone(&self.statistics)
    }

    fn start_run(&mut self, context: &RunContext) -> Result<(), HookError> {
        let buffer = Arc::new(CircularBuffer::new(
            BUFFER_MAX_SIZE,
            BUFFER_FLUSH_SIZE,
            BUFFER_FLUSH_INTERVAL,
        )?);
        buffer.add_sink(&context.data_file_path(), WriteMode::Binary, None, None)?;
        self.buffer = Some(buffer);
        self.spawn_worker()
    }

    fn stop_run(&mut self) -> Result<(), HookError> {
        let result = self.halt();
        if let Some(buffer) = self.buffer.take() {
            buffer.disconnect();
        }
        result
    }

    fn pause(&mut self) -> Result<(), HookError> {
        // The buffer keeps its sinks, so the run can resume where it left
        // off.
        self.halt()
    }

    fn resume(&mut self, _context: &RunContext) -> Result<(), HookError> {
        self.spawn_worker()
    }

    fn post_stop(&mut self, context: &RunContext) -> Result<(), HookError> {
        let path = context.data_file_path();
        if path.exists() {
            let packets = PacketFile::<MockPacket>::open(&path)?
                .read_all()
                .map_err(|err| {
                    HookError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
                })?;
            info!(
                "Post-processing {}: {} packet(s) on disk",
                path.display(),
                packets.len()
            );
        }
        Ok(())
    }
}
