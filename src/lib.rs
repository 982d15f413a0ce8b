//! # lightsweep - lighthouse optical tracking pipeline
//!
//! Turns raw photodiode sweep hits, sync pulses and IMU samples from tracked
//! devices into calibrated 6-DOF poses:
//! - Sweep aggregation and lighthouse/axis disambiguation
//! - OOTX calibration decoding from sync-pulse modulation
//! - Automatic lighthouse calibration against a watchman device
//! - Pluggable pose solvers (orthographic, EPnP, bundle adjustment, least squares)
//! - IMU fusion (complementary or Kalman)
//! - Recorded-log playback and recording
//!
//! ## Quick Start
//! ```no_run
//! use lightsweep::{ChannelReporter, ReportFilter, TrackerConfig, TrackerSession};
//! use std::time::Duration;
//!
//! let (reporter, stream) = ChannelReporter::new(1024);
//! let config = TrackerConfig::from_args(&["--playback", "session.log"]).unwrap();
//! let mut session = TrackerSession::builder(config)
//!     .reporter(Box::new(reporter), ReportFilter::POSE)
//!     .build()
//!     .unwrap();
//! session.start().unwrap();
//! while let Ok(event) = stream.recv_timeout(Duration::from_secs(1)) {
//!     println!("{:?}", event);
//! }
//! session.shutdown();
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod math;
pub mod queue;
pub mod device;
pub mod reorder;
pub mod aggregator;
pub mod ootx;
pub mod disambiguator;
pub mod poser;
pub mod fusion;
pub mod calibration;
pub mod report;
pub mod config;
pub mod playback;
pub mod capture;
pub mod pipeline;
pub mod context;

pub use calibration::CalibrationStatus;
pub use capture::{CaptureSource, PollStatus};
pub use config::{CalibrationStore, PoserKind, Toggle, TrackerConfig};
pub use context::{SessionBuilder, TrackerSession};
pub use device::{DevicePreset, RigidBody};
pub use error::{Diagnostic, TrackerError};
pub use pipeline::{BodyState, Snapshot};
pub use playback::{PlaybackSource, Recorder};
pub use queue::EventSink;
pub use report::{ChannelReporter, EventStream, ReportEvent, ReportFilter, Reporter};
pub use types::*;

/// Result type alias for lightsweep operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
