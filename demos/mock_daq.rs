//! Run a complete mock acquisition from the command line: load the mock
//! application, take one run of the requested length and print the
//! statistics along the way.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use baldaquin::mock::MockUserApplication;
use baldaquin::pkt::PacketStatisticsSnapshot;
use baldaquin::runctrl::{FsmState, RunControl, RunControlObserver};
use baldaquin::{ParameterValue, UserApplication};

#[derive(Parser, Debug)]
#[command(about = "Take a mock data acquisition run")]
struct Args {
    /// Average event rate, in Hz.
    #[arg(long, default_value_t = 100.)]
    rate: f64,

    /// Run length, in seconds.
    #[arg(long, default_value_t = 5.)]
    duration: f64,

    /// Project root folder (defaults to the standard project layout).
    #[arg(long)]
    root: Option<PathBuf>,
}

struct Console;

impl RunControlObserver for Console {
    fn state_changed(&self, state: FsmState) {
        println!("run control -> {state}");
    }

    fn run_id_changed(&self, run_id: u32) {
        println!("run number {run_id}");
    }

    fn event_handler_stats_updated(&self, statistics: PacketStatisticsSnapshot, rate: f64) {
        println!("{statistics} ({rate:.1} Hz)");
    }

    fn output_file_set(&self, path: &std::path::Path) {
        println!("writing to {}", path.display());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let mut run_control = match &args.root {
        Some(root) => {
            RunControl::with_folders("mock", &root.join("config"), &root.join("data"))?
        }
        None => RunControl::new("mock")?,
    };
    run_control.add_observer(Arc::new(Console));
    let mut app = MockUserApplication::new();
    app.configuration_mut()
        .update_value("source", "rate", ParameterValue::Float(args.rate))?;
    run_control.load_user_application(Box::new(app))?;
    run_control.set_stopped()?;
    run_control.set_running()?;
    thread::sleep(Duration::from_secs_f64(args.duration));
    run_control.set_stopped()?;
    run_control.set_reset()?;
    Ok(())
}
