use crate::calibration::CalibrationStatus;
use crate::poser::{SolveFailure, SolverKind};
use crate::queue::Lane;
use crate::types::{LighthouseId, ObjectId, SweepAxis};

/// Errors that stop a session from starting or reject a call outright.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Context initialization failed: {0}")]
    ContextInitFailure(String),

    #[error("Session already started")]
    DoubleStart,

    #[error("Session is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid device config for {object}: {message}")]
    DeviceConfig { object: String, message: String },

    #[error("Playback parse error at line {line}: {message}")]
    PlaybackParse { line: usize, message: String },

    #[error("Queue overflow on {0} lane")]
    QueueOverflow(Lane),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event stream stopped")]
    StreamStopped,

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Channel disconnected")]
    ChannelDisconnected,
}

/// What arrived too late to be used where it was headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateKind {
    /// A light hit for a sweep epoch that had already closed.
    Hit,
    /// A pose older than the last one emitted for its body.
    Pose,
}

impl std::fmt::Display for LateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LateKind::Hit => f.write_str("light hit"),
            LateKind::Pose => f.write_str("pose"),
        }
    }
}

/// Recoverable per-event problems.
///
/// These never stop the pipeline. They are logged where they are detected and
/// forwarded to reporters inside a [`Message`](crate::types::Message).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Diagnostic {
    #[error("queue overflow on {lane} lane ({count} events affected)")]
    QueueOverflow { lane: Lane, count: u64 },

    #[error("late {kind} for {object} at timecode {timecode}")]
    LateArrival {
        kind: LateKind,
        object: ObjectId,
        timecode: u64,
    },

    #[error("ambiguous assignment on lighthouse {lighthouse} {axis} (confidence {confidence:.2} < {threshold:.2})")]
    AmbiguousAssignment {
        lighthouse: LighthouseId,
        axis: SweepAxis,
        confidence: f64,
        threshold: f64,
    },

    #[error("OOTX sync error on lighthouse {lighthouse}: {detail}")]
    SyncError {
        lighthouse: LighthouseId,
        detail: String,
    },

    #[error("{solver} solver needs a seed pose for {object}")]
    MissingSeed { object: ObjectId, solver: SolverKind },

    #[error("{solver} solve failed for {object}: {failure}")]
    SolveFailure {
        object: ObjectId,
        solver: SolverKind,
        failure: SolveFailure,
    },

    #[error("calibration timed out in {state}")]
    CalibrationTimeout { state: CalibrationStatus },
}

impl Diagnostic {
    /// Diagnostics that mean data was lost rather than deferred.
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            Diagnostic::QueueOverflow { .. }
                | Diagnostic::AmbiguousAssignment { .. }
                | Diagnostic::LateArrival {
                    kind: LateKind::Pose,
                    ..
                }
        )
    }
}
