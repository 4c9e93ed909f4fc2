//! Baldaquin: a data-acquisition framework for laboratory instruments.
//!
//! The framework runs a single acquisition run: on operator command, a worker
//! ingests packets from a source as fast as they arrive, buffers them, fans
//! them out to one or more on-disk sinks (the canonical binary file plus
//! optional text projections) and reports liveness and throughput statistics.
//! The three load-bearing pieces are the packet framework ([`pkt`]), the
//! buffered acquisition pipeline ([`buf`] and [`event`]) and the run-control
//! finite state machine ([`runctrl`]).

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::env;
use std::io;
use std::path::PathBuf;

use log::info;

pub mod app;
pub mod buf;
pub mod config;
pub mod event;
pub mod mock;
pub mod pkt;
pub mod protocol;
pub mod runctrl;
pub mod timeline;

pub use crate::app::HookError;
pub use crate::app::UserApplication;
pub use crate::buf::BufferError;
pub use crate::buf::CircularBuffer;
pub use crate::buf::FifoBuffer;
pub use crate::buf::PacketBuffer;
pub use crate::buf::Projection;
pub use crate::buf::Sink;
pub use crate::buf::WriteMode;
pub use crate::config::Configuration;
pub use crate::config::ConfigurationSection;
pub use crate::config::Parameter;
pub use crate::config::ParameterError;
pub use crate::config::ParameterValue;
pub use crate::event::BackgroundEventLoop;
pub use crate::event::EventError;
pub use crate::event::EventHandler;
pub use crate::event::EventLoop;
pub use crate::pkt::FieldValue;
pub use crate::pkt::Format;
pub use crate::pkt::Layout;
pub use crate::pkt::Packet;
pub use crate::pkt::PacketError;
pub use crate::pkt::PacketFile;
pub use crate::pkt::PacketFileError;
pub use crate::pkt::PacketStatistics;
pub use crate::pkt::PacketStatisticsSnapshot;
pub use crate::runctrl::FsmState;
pub use crate::runctrl::RunContext;
pub use crate::runctrl::RunControl;
pub use crate::runctrl::RunControlError;
pub use crate::runctrl::RunControlObserver;
pub use crate::timeline::Timeline;
pub use crate::timeline::Timestamp;

/// Name of the environment variable overriding the data root.
pub const DATA_ROOT_ENV: &str = "BALDAQUIN_DATA";

fn home_folder() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The base folder for the output data, defaulting to `~/baldaquindata` and
/// overridable through the `BALDAQUIN_DATA` environment variable.
pub fn data_root() -> PathBuf {
    match env::var_os(DATA_ROOT_ENV) {
        Some(path) => PathBuf::from(path),
        None => home_folder().join("baldaquindata"),
    }
}

/// The base folder for the configuration files, `~/.baldaquin`.
pub fn config_root() -> PathBuf {
    home_folder().join(".baldaquin")
}

/// The configuration folder for a given project.
pub fn config_folder_path(project_name: &str) -> PathBuf {
    config_root().join(project_name)
}

/// The data folder for a given project.
pub fn data_folder_path(project_name: &str) -> PathBuf {
    data_root().join(project_name)
}

/// Set up the folder structure for a given project: the configuration folder
/// (with its `apps` subfolder) and the data folder, created if they do not
/// exist already. Returns the two folder paths, configuration first.
pub fn setup_project(project_name: &str) -> io::Result<(PathBuf, PathBuf)> {
    let config_folder = config_folder_path(project_name);
    let data_folder = data_folder_path(project_name);
    for folder in [&config_folder.join("apps"), &data_folder] {
        if !folder.exists() {
            info!("Creating folder {}...", folder.display());
            std::fs::create_dir_all(folder)?;
        }
    }
    Ok((config_folder, data_folder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_folders() {
        assert_eq!(
            config_folder_path("plasduino"),
            config_root().join("plasduino")
        );
        assert!(
            data_folder_path("plasduino")
                .to_string_lossy()
                .contains("plasduino")
        );
    }
}
