//! Run control: the finite state machine coordinating a data acquisition run.
//!
//! The run control owns the user application and sequences its lifecycle
//! hooks across the `RESET <-> STOPPED <-> RUNNING <-> PAUSED` state graph.
//! On the way into RUNNING it increments and persists the run number,
//! creates the per-run output folder, opens the run log and starts the
//! statistics timer; on the way out it joins the worker, freezes the
//! timestamps and fires a final statistics tick. UI-independent observers
//! can subscribe to the state, run-number, uptime and throughput events.

use std::error;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use parking_lot::Mutex;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::app::{HookError, UserApplication};
use crate::pkt::{PacketStatistics, PacketStatisticsSnapshot};
use crate::timeline::{Timeline, Timestamp};

/// Default test stand identifier, written to the test stand configuration
/// file on first use.
pub const DEFAULT_TEST_STAND_ID: u32 = 101;

/// Default period of the statistics timer.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(750);

/// The possible states of the run control finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FsmState {
    /// Pristine state: no application set up.
    Reset,
    /// Application set up, no acquisition in progress.
    Stopped,
    /// Acquisition in progress.
    Running,
    /// Acquisition suspended, sinks still wired.
    Paused,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmState::Reset => write!(f, "RESET"),
            FsmState::Stopped => write!(f, "STOPPED"),
            FsmState::Running => write!(f, "RUNNING"),
            FsmState::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Error that may occur while driving the run control.
#[derive(Debug)]
pub enum RunControlError {
    /// The requested transition is not part of the FSM graph. The state is
    /// left unchanged.
    InvalidTransition {
        /// The state the FSM is in.
        from: FsmState,
        /// The state that was requested.
        to: FsmState,
    },
    /// No user application loaded.
    AppNotLoaded,
    /// A user application can only be loaded in the RESET state.
    AppLoadForbidden(FsmState),
    /// The acquisition thread did not join within the allotted timeout; the
    /// partial data file is kept and the FSM still reaches STOPPED.
    WorkerJoinTimeout,
    /// A user application hook failed, aborting the transition.
    Hook(HookError),
    /// Underlying I/O failure (configuration files, output folders).
    Io(io::Error),
}

impl fmt::Display for RunControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunControlError::InvalidTransition { from, to } => {
                write!(f, "invalid FSM transition {from} -> {to}")
            }
            RunControlError::AppNotLoaded => write!(f, "user application not loaded"),
            RunControlError::AppLoadForbidden(state) => {
                write!(f, "cannot load a user application in the {state} state")
            }
            RunControlError::WorkerJoinTimeout => {
                write!(f, "the acquisition thread did not join in time")
            }
            RunControlError::Hook(err) => write!(f, "user application hook failed: {err}"),
            RunControlError::Io(err) => write!(f, "run control I/O error: {err}"),
        }
    }
}

impl error::Error for RunControlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            RunControlError::Hook(err) => Some(err),
            RunControlError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RunControlError {
    fn from(err: io::Error) -> Self {
        RunControlError::Io(err)
    }
}

impl From<HookError> for RunControlError {
    fn from(err: HookError) -> Self {
        match err {
            HookError::WorkerJoinTimeout => RunControlError::WorkerJoinTimeout,
            err => RunControlError::Hook(err),
        }
    }
}

/// UI-independent run control events. All the hooks default to no-ops, so an
/// observer only implements what it cares about.
pub trait RunControlObserver: Send + Sync {
    /// The FSM entered a new state.
    fn state_changed(&self, _state: FsmState) {}

    /// The run number changed.
    fn run_id_changed(&self, _run_id: u32) {}

    /// A user application was loaded.
    fn user_application_loaded(&self, _name: &str) {}

    /// Periodic uptime report, in seconds.
    fn uptime_updated(&self, _seconds: f64) {}

    /// Periodic statistics report, along with the average rate in Hz.
    fn event_handler_stats_updated(&self, _statistics: PacketStatisticsSnapshot, _rate: f64) {}

    /// The canonical output file for the current run.
    fn output_file_set(&self, _path: &Path) {}
}

/// The identity and filesystem layout of a single run, handed to the user
/// application hooks.
#[derive(Debug, Clone)]
pub struct RunContext {
    test_stand_id: u32,
    run_id: u32,
    data_folder: PathBuf,
}

impl RunContext {
    /// The test stand identifier.
    pub fn test_stand_id(&self) -> u32 {
        self.test_stand_id
    }

    /// The run number.
    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    /// The per-run output folder.
    pub fn data_folder_path(&self) -> &Path {
        &self.data_folder
    }

    /// Generic file name factory, given a text label and an extension.
    pub fn file_path(&self, label: &str, extension: &str) -> PathBuf {
        self.data_folder.join(format!(
            "{:04}_{:05}_{}.{}",
            self.test_stand_id, self.run_id, label, extension
        ))
    }

    /// The path to the canonical binary data file.
    pub fn data_file_path(&self) -> PathBuf {
        self.file_path("data", "dat")
    }

    /// The path to the run log file.
    pub fn log_file_path(&self) -> PathBuf {
        self.file_path("run", "log")
    }
}

/// The run-scoped log file, opened on the way into RUNNING and closed on the
/// way into STOPPED.
struct RunLog {
    file: File,
}

impl RunLog {
    fn open(path: &Path, timeline: &Timeline) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create_new(true).open(path)?;
        let mut log = Self { file };
        log.record(timeline, "Run log opened");
        Ok(log)
    }

    fn record(&mut self, timeline: &Timeline, message: &str) {
        let line = format!("{} {}\n", timeline.latch().utc_datetime_string(), message);
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            warn!("Could not write to the run log ({err})");
        }
    }
}

struct StatsTimer {
    stop: Arc<AtomicBool>,
    guard: JoinHandle<()>,
}

type ObserverList = Arc<Mutex<Vec<Arc<dyn RunControlObserver>>>>;

/// The run control.
pub struct RunControl {
    project_name: String,
    config_folder: PathBuf,
    data_folder: PathBuf,
    state: FsmState,
    test_stand_id: u32,
    run_id: u32,
    timeline: Timeline,
    start_timestamp: Option<Timestamp>,
    stop_timestamp: Option<Timestamp>,
    start_instant: Option<Instant>,
    stop_elapsed: Option<f64>,
    user_application: Option<Box<dyn UserApplication>>,
    observers: ObserverList,
    stats_timer: Option<StatsTimer>,
    run_log: Option<RunLog>,
    tick_interval: Duration,
}

impl RunControl {
    /// Create a run control rooted at the default project folders (see
    /// [`setup_project`](crate::setup_project)).
    pub fn new(project_name: &str) -> io::Result<Self> {
        let (config_folder, data_folder) = crate::setup_project(project_name)?;
        Self::with_folders(project_name, &config_folder, &data_folder)
    }

    /// Create a run control rooted at explicit configuration and data
    /// folders. Mostly useful for tests and embedded deployments.
    pub fn with_folders(
        project_name: &str,
        config_folder: &Path,
        data_folder: &Path,
    ) -> io::Result<Self> {
        fs::create_dir_all(config_folder.join("apps"))?;
        fs::create_dir_all(data_folder)?;
        let test_stand_id = read_config_file(
            &config_folder.join("test_stand.cfg"),
            DEFAULT_TEST_STAND_ID,
        )?;
        let run_id = read_config_file(&config_folder.join("run.cfg"), 0)?;
        Ok(Self {
            project_name: project_name.to_string(),
            config_folder: config_folder.to_path_buf(),
            data_folder: data_folder.to_path_buf(),
            state: FsmState::Reset,
            test_stand_id,
            run_id,
            timeline: Timeline::new(),
            start_timestamp: None,
            stop_timestamp: None,
            start_instant: None,
            stop_elapsed: None,
            user_application: None,
            observers: Arc::new(Mutex::new(Vec::new())),
            stats_timer: None,
            run_log: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
        })
    }

    /// Override the statistics timer period.
    pub fn set_tick_interval(&mut self, tick_interval: Duration) {
        self.tick_interval = tick_interval;
    }

    /// The project name.
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// The current FSM state.
    pub fn state(&self) -> FsmState {
        self.state
    }

    /// True if the run control is reset.
    pub fn is_reset(&self) -> bool {
        self.state == FsmState::Reset
    }

    /// True if the run control is stopped.
    pub fn is_stopped(&self) -> bool {
        self.state == FsmState::Stopped
    }

    /// True if the run control is running.
    pub fn is_running(&self) -> bool {
        self.state == FsmState::Running
    }

    /// True if the run control is paused.
    pub fn is_paused(&self) -> bool {
        self.state == FsmState::Paused
    }

    /// The test stand identifier.
    pub fn test_stand_id(&self) -> u32 {
        self.test_stand_id
    }

    /// The current run number.
    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    /// The timestamp latched on the way into RUNNING, if any.
    pub fn start_timestamp(&self) -> Option<&Timestamp> {
        self.start_timestamp.as_ref()
    }

    /// The timestamp latched on the way out of RUNNING, if any.
    pub fn stop_timestamp(&self) -> Option<&Timestamp> {
        self.stop_timestamp.as_ref()
    }

    /// Seconds elapsed since the start of the current (or last) run, frozen
    /// at the stop timestamp once the run is over.
    pub fn elapsed_time(&self) -> Option<f64> {
        let start = self.start_instant?;
        Some(
            self.stop_elapsed
                .unwrap_or_else(|| start.elapsed().as_secs_f64()),
        )
    }

    /// The identity and filesystem layout of the current run.
    pub fn run_context(&self) -> RunContext {
        RunContext {
            test_stand_id: self.test_stand_id,
            run_id: self.run_id,
            data_folder: self.data_folder.join(format!(
                "{:04}_{:06}",
                self.test_stand_id, self.run_id
            )),
        }
    }

    /// The path to the configuration file for a given user application.
    pub fn app_config_file_path(&self, name: &str) -> PathBuf {
        self.config_folder.join("apps").join(format!("{name}.cfg"))
    }

    /// Subscribe an observer to the run control events.
    pub fn add_observer(&self, observer: Arc<dyn RunControlObserver>) {
        self.observers.lock().push(observer);
    }

    /// Load the user application to be run. Only valid in the RESET state.
    pub fn load_user_application(
        &mut self,
        app: Box<dyn UserApplication>,
    ) -> Result<(), RunControlError> {
        if !self.is_reset() {
            let err = RunControlError::AppLoadForbidden(self.state);
            error!("{err}");
            return Err(err);
        }
        info!("Loading user application {}...", app.name());
        self.emit(|observer| observer.user_application_loaded(app.name()));
        self.user_application = Some(app);
        Ok(())
    }

    /// A shared handle to the loaded application, if any.
    pub fn user_application(&self) -> Option<&dyn UserApplication> {
        self.user_application.as_deref()
    }

    /// Set the FSM in the RESET state.
    pub fn set_reset(&mut self) -> Result<(), RunControlError> {
        match self.state {
            FsmState::Stopped => self.teardown()?,
            from => return Err(self.reject(from, FsmState::Reset)),
        }
        self.enter_state(FsmState::Reset);
        Ok(())
    }

    /// Set the FSM in the STOPPED state.
    pub fn set_stopped(&mut self) -> Result<(), RunControlError> {
        match self.state {
            FsmState::Reset => self.setup()?,
            FsmState::Running | FsmState::Paused => self.stop_run()?,
            from => return Err(self.reject(from, FsmState::Stopped)),
        }
        self.enter_state(FsmState::Stopped);
        Ok(())
    }

    /// Set the FSM in the RUNNING state.
    pub fn set_running(&mut self) -> Result<(), RunControlError> {
        match self.state {
            FsmState::Stopped => self.start_run()?,
            FsmState::Paused => self.resume()?,
            from => return Err(self.reject(from, FsmState::Running)),
        }
        self.enter_state(FsmState::Running);
        Ok(())
    }

    /// Set the FSM in the PAUSED state.
    pub fn set_paused(&mut self) -> Result<(), RunControlError> {
        match self.state {
            FsmState::Running => self.pause()?,
            from => return Err(self.reject(from, FsmState::Paused)),
        }
        self.enter_state(FsmState::Paused);
        Ok(())
    }

    fn reject(&self, from: FsmState, to: FsmState) -> RunControlError {
        let err = RunControlError::InvalidTransition { from, to };
        error!("{err}");
        err
    }

    fn enter_state(&mut self, state: FsmState) {
        self.state = state;
        info!("Run control entering the {state} state");
        self.emit(|observer| observer.state_changed(state));
    }

    fn emit<F: Fn(&dyn RunControlObserver)>(&self, event: F) {
        for observer in self.observers.lock().iter() {
            event(observer.as_ref());
        }
    }

    /// RESET -> STOPPED: set the application up and reconcile its
    /// configuration with the on-disk file.
    fn setup(&mut self) -> Result<(), RunControlError> {
        let name = match self.user_application.as_ref() {
            Some(app) => app.name().to_string(),
            None => return Err(RunControlError::AppNotLoaded),
        };
        let config_path = self.app_config_file_path(&name);
        let Some(app) = self.user_application.as_mut() else {
            return Err(RunControlError::AppNotLoaded);
        };
        app.setup()?;
        if config_path.exists() {
            if let Err(err) = app.configuration_mut().update_from_file(&config_path) {
                warn!("Could not read {} ({err})", config_path.display());
            }
        } else if let Err(err) = app.configuration().write(&config_path) {
            warn!("Could not write {} ({err})", config_path.display());
        }
        Ok(())
    }

    /// STOPPED -> RESET.
    fn teardown(&mut self) -> Result<(), RunControlError> {
        let Some(app) = self.user_application.as_mut() else {
            return Err(RunControlError::AppNotLoaded);
        };
        app.teardown()?;
        Ok(())
    }

    /// STOPPED -> RUNNING: bump and persist the run number, lay the output
    /// folder out, and launch the application.
    fn start_run(&mut self) -> Result<(), RunControlError> {
        if self.user_application.is_none() {
            return Err(RunControlError::AppNotLoaded);
        }
        self.increment_run_id()?;
        let context = self.run_context();
        info!(
            "Creating output data folder {}",
            context.data_folder_path().display()
        );
        fs::create_dir_all(context.data_folder_path())?;
        self.run_log = Some(RunLog::open(&context.log_file_path(), &self.timeline)?);
        let start_timestamp = self.timeline.latch();
        info!("Run Control started on {start_timestamp}");
        if let Some(run_log) = &mut self.run_log {
            run_log.record(
                &self.timeline,
                &format!(
                    "Test stand {}, run {} started",
                    self.test_stand_id, self.run_id
                ),
            );
        }
        let start_instant = Instant::now();
        self.start_timestamp = Some(start_timestamp);
        self.stop_timestamp = None;
        self.start_instant = Some(start_instant);
        self.stop_elapsed = None;
        let statistics = match self.launch_application(&context) {
            Ok(statistics) => statistics,
            Err(err) => {
                // Abort the transition: close the run log and surface the
                // error, leaving the FSM in STOPPED.
                error!("{err}");
                self.run_log = None;
                return Err(err);
            }
        };
        self.emit(|observer| observer.output_file_set(&context.data_file_path()));
        self.start_stats_timer(statistics, start_instant)?;
        Ok(())
    }

    fn launch_application(
        &mut self,
        context: &RunContext,
    ) -> Result<Arc<PacketStatistics>, RunControlError> {
        let Some(app) = self.user_application.as_mut() else {
            return Err(RunControlError::AppNotLoaded);
        };
        app.statistics().reset();
        app.configure();
        app.pre_start(context)?;
        app.start_run(context)?;
        Ok(app.statistics())
    }

    /// RUNNING/PAUSED -> STOPPED: stop the worker, freeze the timestamps,
    /// fire the final statistics tick and close the run out.
    fn stop_run(&mut self) -> Result<(), RunControlError> {
        self.stop_stats_timer();
        {
            let Some(app) = self.user_application.as_mut() else {
                return Err(RunControlError::AppNotLoaded);
            };
            match app.stop_run() {
                Ok(()) => {}
                Err(HookError::WorkerJoinTimeout) => {
                    // Hard stop: the partial data file is kept and the run is
                    // closed out anyway.
                    error!("{}", RunControlError::WorkerJoinTimeout);
                    warn!("Forcing a hard stop, the data file may be incomplete");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let stop_timestamp = self.timeline.latch();
        info!("Run Control stopped on {stop_timestamp}");
        self.stop_timestamp = Some(stop_timestamp);
        let elapsed = self
            .start_instant
            .map(|start| start.elapsed().as_secs_f64());
        self.stop_elapsed = elapsed;
        // Final single-shot statistics tick, using the frozen stop timestamp
        // so that a late packet burst is captured.
        let snapshot = self
            .user_application
            .as_ref()
            .map(|app| app.statistics().snapshot());
        if let (Some(snapshot), Some(elapsed)) = (snapshot, elapsed) {
            let rate = average_rate(&snapshot, elapsed);
            self.emit(|observer| {
                observer.uptime_updated(elapsed);
                observer.event_handler_stats_updated(snapshot, rate);
            });
            if let Some(run_log) = &mut self.run_log {
                run_log.record(
                    &self.timeline,
                    &format!("Run {} stopped: {snapshot}", self.run_id),
                );
            }
        }
        self.run_log = None;
        let context = self.run_context();
        let Some(app) = self.user_application.as_mut() else {
            return Err(RunControlError::AppNotLoaded);
        };
        app.post_stop(&context)?;
        Ok(())
    }

    /// RUNNING -> PAUSED.
    fn pause(&mut self) -> Result<(), RunControlError> {
        let Some(app) = self.user_application.as_mut() else {
            return Err(RunControlError::AppNotLoaded);
        };
        app.pause()?;
        self.stop_stats_timer();
        Ok(())
    }

    /// PAUSED -> RUNNING.
    fn resume(&mut self) -> Result<(), RunControlError> {
        let context = self.run_context();
        let statistics = {
            let Some(app) = self.user_application.as_mut() else {
                return Err(RunControlError::AppNotLoaded);
            };
            app.resume(&context)?;
            app.statistics()
        };
        let start_instant = self.start_instant.unwrap_or_else(Instant::now);
        self.start_stats_timer(statistics, start_instant)?;
        Ok(())
    }

    fn start_stats_timer(
        &mut self,
        statistics: Arc<PacketStatistics>,
        start_instant: Instant,
    ) -> Result<(), RunControlError> {
        let stop = Arc::new(AtomicBool::new(false));
        let timer_stop = Arc::clone(&stop);
        let observers = Arc::clone(&self.observers);
        let tick_interval = self.tick_interval;
        let guard = thread::Builder::new()
            .name("daq-stats".into())
            .spawn(move || {
                loop {
                    thread::sleep(tick_interval);
                    if timer_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let elapsed = start_instant.elapsed().as_secs_f64();
                    let snapshot = statistics.snapshot();
                    let rate = average_rate(&snapshot, elapsed);
                    for observer in observers.lock().iter() {
                        observer.uptime_updated(elapsed);
                        observer.event_handler_stats_updated(snapshot, rate);
                    }
                }
            })?;
        self.stats_timer = Some(StatsTimer { stop, guard });
        Ok(())
    }

    fn stop_stats_timer(&mut self) {
        if let Some(timer) = self.stats_timer.take() {
            timer.stop.store(true, Ordering::Release);
            if timer.guard.join().is_err() {
                warn!("Statistics timer thread panicked");
            }
        }
    }

    fn increment_run_id(&mut self) -> io::Result<()> {
        self.run_id += 1;
        write_config_file(&self.config_folder.join("run.cfg"), self.run_id)?;
        let run_id = self.run_id;
        self.emit(|observer| observer.run_id_changed(run_id));
        Ok(())
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("project_name", &self.project_name)
            .field("state", &self.state)
            .field("test_stand_id", &self.test_stand_id)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Drop for RunControl {
    fn drop(&mut self) {
        self.stop_stats_timer();
    }
}

fn average_rate(snapshot: &PacketStatisticsSnapshot, elapsed: f64) -> f64 {
    if elapsed > 0. {
        snapshot.packets_processed as f64 / elapsed
    } else {
        0.
    }
}

/// Read a single integer value from a configuration file, creating the file
/// with the default value if it does not exist.
fn read_config_file(path: &Path, default: u32) -> io::Result<u32> {
    if !path.exists() {
        warn!(
            "Configuration file {} not found, creating one...",
            path.display()
        );
        write_config_file(path, default)?;
        return Ok(default);
    }
    info!("Reading configuration file {}...", path.display());
    let text = fs::read_to_string(path)?;
    let value = text
        .trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    info!("Done, {value} found.");
    Ok(value)
}

/// Write a single integer value to a configuration file.
fn write_config_file(path: &Path, value: u32) -> io::Result<()> {
    info!("Writing {value} to config file {}...", path.display());
    fs::write(path, value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    struct NoOpApplication {
        configuration: Configuration,
        statistics: Arc<PacketStatistics>,
    }

    impl NoOpApplication {
        fn new() -> Self {
            Self {
                configuration: Configuration::new("No-op application configuration"),
                statistics: Arc::default(),
            }
        }
    }

    impl UserApplication for NoOpApplication {
        fn name(&self) -> &str {
            "noop"
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

        fn start_run(&mut self, _context: &RunContext) -> Result<(), HookError> {
            Ok(())
        }

        fn stop_run(&mut self) -> Result<(), HookError> {
            Ok(())
        }

        fn pause(&mut self) -> Result<(), HookError> {
            Ok(())
        }

        fn resume(&mut self, _context: &RunContext) -> Result<(), HookError> {
            Ok(())
        }
    }

    fn run_control(folder: &tempfile::TempDir) -> RunControl {
        let mut run_control = RunControl::with_folders(
            "test",
            &folder.path().join("config"),
            &folder.path().join("data"),
        )
        .unwrap();
        run_control.set_tick_interval(Duration::from_millis(10));
        run_control
    }

    #[test]
    fn config_files_created_with_defaults() {
        let folder = tempfile::tempdir().unwrap();
        let run_control = run_control(&folder);
        assert_eq!(run_control.test_stand_id(), DEFAULT_TEST_STAND_ID);
        assert_eq!(run_control.run_id(), 0);
        assert_eq!(
            fs::read_to_string(folder.path().join("config/test_stand.cfg")).unwrap(),
            "101"
        );
        assert_eq!(
            fs::read_to_string(folder.path().join("config/run.cfg")).unwrap(),
            "0"
        );
    }

    #[test]
    fn ids_survive_reconstruction() {
        let folder = tempfile::tempdir().unwrap();
        {
            let mut run_control = run_control(&folder);
            run_control
                .load_user_application(Box::new(NoOpApplication::new()))
                .unwrap();
            run_control.set_stopped().unwrap();
            run_control.set_running().unwrap();
            run_control.set_stopped().unwrap();
            assert_eq!(run_control.run_id(), 1);
        }
        let run_control = run_control(&folder);
        assert_eq!(run_control.run_id(), 1);
    }

    #[test]
    fn invalid_transition_from_reset() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        let err = run_control.set_running().unwrap_err();
        assert!(matches!(
            err,
            RunControlError::InvalidTransition {
                from: FsmState::Reset,
                to: FsmState::Running,
            }
        ));
        assert!(run_control.is_reset());
        assert!(matches!(
            run_control.set_paused().unwrap_err(),
            RunControlError::InvalidTransition { .. }
        ));
        assert!(matches!(
            run_control.set_reset().unwrap_err(),
            RunControlError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn transition_totality() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        // RESET: only STOPPED is reachable.
        assert!(run_control.set_stopped().is_ok());
        // STOPPED: PAUSED is not reachable.
        assert!(run_control.set_paused().is_err());
        assert!(run_control.is_stopped());
        // STOPPED -> RUNNING -> PAUSED -> RUNNING -> STOPPED -> RESET.
        assert!(run_control.set_running().is_ok());
        assert!(run_control.set_reset().is_err());
        assert!(run_control.is_running());
        assert!(run_control.set_paused().is_ok());
        assert!(run_control.set_reset().is_err());
        assert!(run_control.is_paused());
        assert!(run_control.set_running().is_ok());
        assert!(run_control.set_stopped().is_ok());
        assert!(run_control.set_reset().is_ok());
        assert!(run_control.is_reset());
    }

    #[test]
    fn paused_to_stopped() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        run_control.set_stopped().unwrap();
        run_control.set_running().unwrap();
        run_control.set_paused().unwrap();
        run_control.set_stopped().unwrap();
        assert!(run_control.is_stopped());
    }

    #[test]
    fn setup_requires_application() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        assert!(matches!(
            run_control.set_stopped().unwrap_err(),
            RunControlError::AppNotLoaded
        ));
        assert!(run_control.is_reset());
    }

    #[test]
    fn app_load_forbidden_outside_reset() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        run_control.set_stopped().unwrap();
        assert!(matches!(
            run_control
                .load_user_application(Box::new(NoOpApplication::new()))
                .unwrap_err(),
            RunControlError::AppLoadForbidden(FsmState::Stopped)
        ));
    }

    #[test]
    fn run_folder_and_log_layout() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        run_control.set_stopped().unwrap();
        run_control.set_running().unwrap();
        let run_folder = folder.path().join("data/0101_000001");
        assert!(run_folder.is_dir());
        assert!(run_folder.join("0101_00001_run.log").is_file());
        run_control.set_stopped().unwrap();
        assert_eq!(
            fs::read_to_string(folder.path().join("config/run.cfg")).unwrap(),
            "1"
        );
    }

    #[test]
    fn app_config_written_on_setup() {
        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        run_control.set_stopped().unwrap();
        assert!(folder.path().join("config/apps/noop.cfg").is_file());
    }

    #[test]
    fn observer_events() {
        #[derive(Default)]
        struct Recorder {
            events: Mutex<Vec<String>>,
        }

        impl RunControlObserver for Recorder {
            fn state_changed(&self, state: FsmState) {
                self.events.lock().push(format!("state:{state}"));
            }

            fn run_id_changed(&self, run_id: u32) {
                self.events.lock().push(format!("run_id:{run_id}"));
            }

            fn user_application_loaded(&self, name: &str) {
                self.events.lock().push(format!("app:{name}"));
            }
        }

        let folder = tempfile::tempdir().unwrap();
        let mut run_control = run_control(&folder);
        let recorder = Arc::new(Recorder::default());
        run_control.add_observer(recorder.clone());
        run_control
            .load_user_application(Box::new(NoOpApplication::new()))
            .unwrap();
        run_control.set_stopped().unwrap();
        run_control.set_running().unwrap();
        run_control.set_stopped().unwrap();
        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                "app:noop",
                "state:STOPPED",
                "run_id:1",
                "state:RUNNING",
                "state:STOPPED",
            ]
        );
    }
}
