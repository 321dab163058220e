//! Error taxonomy for capture passes and bearing estimation
//!
//! Session-fatal failures surface as [`SessionError`]; per-frame decode
//! problems and interpolation fallbacks are counted on the estimator report
//! instead of being raised.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::TaskKind;

/// Rejected session parameter (raised on assignment, before a session starts)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("Invalid duration: {0}; should be a number of seconds > 0")]
    Duration(f64),

    #[error("Invalid degrees: {0}; should be a finite number")]
    Degrees(f64),

    #[error("Invalid bearing: {0}; should be a finite number")]
    Bearing(f64),

    #[error("Invalid hop interval: {0}; should be a number of seconds > 0")]
    HopInterval(f64),

    #[error("Invalid hop distance: {0}; should be an integer > 0")]
    HopDistance(i64),

    #[error("Invalid channel: {0}; should be an integer > 0")]
    Channel(i64),

    #[error("Invalid mac address: {0:?}")]
    Mac(String),

    #[error("Invalid focused sweep: width {width}, duration {duration}; width should be in (0, 360] and duration > 0")]
    Focused { width: f64, duration: f64 },

    #[error("Invalid interface: {0:?}")]
    Interface(String),

    #[error("Sweep of {degrees} degrees does not fit the travel window [{min}, {max}]")]
    SweepExceedsWindow { degrees: f64, min: f64, max: f64 },

    #[error("Missing parameter: {0}")]
    Missing(&'static str),
}

/// Stepper motion failure
#[derive(Debug, Error)]
pub enum MotionError {
    /// Rejected before any pulse was emitted
    #[error("motion precondition violated: {0}")]
    Precondition(String),

    /// Hardware output failed mid-rotation; the rotation was aborted
    #[error("pulse output failed after {emitted} pulses: {source}")]
    Output {
        emitted: u64,
        #[source]
        source: io::Error,
    },
}

/// Packet capture process failure
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("required packet capture tool {0:?} is not installed")]
    ToolMissing(PathBuf),

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} did not report a started capture within {timeout:?}")]
    NoStartMarker { tool: String, timeout: Duration },

    #[error("{tool} exited ({status}) without parseable captured/dropped counts")]
    Counts { tool: String, status: String },

    #[error("capture process i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// GPS collaborator failure
#[derive(Debug, Error)]
pub enum GpsError {
    #[error("gpsd connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed gpsd report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("gpsd did not answer the poll with a TPV report")]
    NoReport,

    #[error("no GPS fix samples were collected")]
    NoFix,

    #[error("failed to launch {tool}: {source}")]
    Recorder {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("gave up waiting for a GPS fix")]
    Cancelled,
}

/// Network interface control failure
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    Status {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("no wireless interface named {0:?}")]
    Unknown(String),

    #[error("interface {iface} is in {actual} mode after requesting {requested}")]
    ModeNotApplied {
        iface: String,
        requested: String,
        actual: String,
    },
}

/// Frame decoding collaborator failure (the whole file, not one frame)
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
}

/// Bearing estimation failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    #[error("degenerate rotation window: start {start} is not before end {end}")]
    DegenerateWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Session-fatal failure of a capture pass
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    ParameterValidation(#[from] ParamError),

    #[error("tasks did not report ready within {timeout:?}: {pending:?}")]
    HardwareTimeout {
        pending: Vec<TaskKind>,
        timeout: Duration,
    },

    #[error("capture failed: {0}")]
    CaptureFailure(String),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    Gps(GpsError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error("session cancelled before the start signal")]
    Cancelled,

    #[error("{task} task failed: {reason}")]
    TaskFailed { task: TaskKind, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::CaptureFailure(err.to_string())
    }
}

impl From<GpsError> for SessionError {
    fn from(err: GpsError) -> Self {
        match err {
            GpsError::Cancelled => SessionError::Cancelled,
            other => SessionError::Gps(other),
        }
    }
}
