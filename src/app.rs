//! User application framework.
//!
//! A user application binds a packet source to the run control: it owns the
//! configuration schema, creates the event handler and the buffer at the
//! start of every run, and implements the lifecycle hooks the finite state
//! machine calls across transitions. The trait is object-safe on purpose, so
//! that the run control can drive any application without knowing its packet
//! type.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

use log::info;

use crate::buf::BufferError;
use crate::config::Configuration;
use crate::event::EventError;
use crate::pkt::PacketStatistics;
use crate::runctrl::RunContext;

/// Error that may occur in a user application lifecycle hook.
#[derive(Debug)]
pub enum HookError {
    /// Underlying I/O failure (serial port, file system and the like).
    Io(io::Error),
    /// A sink or buffer operation failed.
    Buffer(BufferError),
    /// The acquisition loop failed.
    Event(EventError),
    /// The acquisition thread did not join within the allotted timeout.
    WorkerJoinTimeout,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Io(err) => write!(f, "{err}"),
            HookError::Buffer(err) => write!(f, "{err}"),
            HookError::Event(err) => write!(f, "{err}"),
            HookError::WorkerJoinTimeout => {
                write!(f, "the acquisition thread did not join in time")
            }
        }
    }
}

impl error::Error for HookError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            HookError::Io(err) => Some(err),
            HookError::Buffer(err) => Some(err),
            HookError::Event(err) => Some(err),
            HookError::WorkerJoinTimeout => None,
        }
    }
}

impl From<io::Error> for HookError {
    fn from(err: io::Error) -> Self {
        HookError::Io(err)
    }
}

impl From<BufferError> for HookError {
    fn from(err: BufferError) -> Self {
        HookError::Buffer(err)
    }
}

impl From<EventError> for HookError {
    fn from(err: EventError) -> Self {
        HookError::Event(err)
    }
}

/// Base trait for user applications.
///
/// The hooks are called by the run control in a fixed sequence: `setup()` on
/// the first start after a reset, `configure()` and `pre_start()` before the
/// acquisition thread starts, `start_run()` to launch it, `stop_run()` to
/// stop and join it, `post_stop()` after the run is closed out, and
/// `teardown()` on the way back to reset. `pause()`/`resume()` bracket a
/// suspension that keeps the sinks open.
pub trait UserApplication: Send {
    /// The human-readable application name, also used to locate the
    /// application configuration file.
    fn name(&self) -> &str;

    /// The configuration schema with the current values.
    fn configuration(&self) -> &Configuration;

    /// Mutable access to the configuration.
    fn configuration_mut(&mut self) -> &mut Configuration;

    /// The statistics record shared with the acquisition worker.
    fn statistics(&self) -> Arc<PacketStatistics>;

    /// Called on the RESET -> STOPPED transition.
    fn setup(&mut self) -> Result<(), HookError> {
        info!("{}.setup(): nothing to do...", self.name());
        Ok(())
    }

    /// Called on the STOPPED -> RESET transition.
    fn teardown(&mut self) -> Result<(), HookError> {
        info!("{}.teardown(): nothing to do...", self.name());
        Ok(())
    }

    /// Apply the current configuration to the worker and the source. Called
    /// right before every run.
    fn configure(&mut self) {}

    /// Called before the acquisition thread starts; the typical place to add
    /// projection sinks for the upcoming run.
    fn pre_start(&mut self, _context: &RunContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Wire the canonical sink to the run data file and launch the
    /// acquisition thread.
    fn start_run(&mut self, context: &RunContext) -> Result<(), HookError>;

    /// Stop the acquisition thread, join it and perform the final flush.
    fn stop_run(&mut self) -> Result<(), HookError>;

    /// Called on the RUNNING -> PAUSED transition; stops the worker and
    /// flushes, keeping the sinks open.
    fn pause(&mut self) -> Result<(), HookError>;

    /// Called on the PAUSED -> RUNNING transition; restarts the worker on
    /// the same sinks.
    fn resume(&mut self, context: &RunContext) -> Result<(), HookError>;

    /// Called after the acquisition thread has joined and the run is closed
    /// out; the typical place to post-process the freshly written file.
    fn post_stop(&mut self, _context: &RunContext) -> Result<(), HookError> {
        Ok(())
    }
}
