//! Unified error types for the turret control core.
//!
//! A single `Error` enum that every subsystem converts into, so the frame
//! loop and the simulation binary handle failures uniformly.  All variants
//! are `Copy`: they are handed to observers and stored in reports without
//! allocation.

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the core funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Servo axis or hardware failure.
    Servo(ServoError),
    /// Pixel/angle mapping or calibration persistence failed.
    Coord(CoordError),
    /// A frame could not be processed by the motion detector.
    Motion(MotionError),
    /// The laser controller refused a command.
    Laser(LaserError),
    /// A safety interlock blocked the operation.
    Safety(SafetyError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
    /// A telemetry snapshot could not be encoded or decoded.
    Telemetry(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Servo(e) => write!(f, "servo: {e}"),
            Self::Coord(e) => write!(f, "coordinate mapper: {e}"),
            Self::Motion(e) => write!(f, "motion detector: {e}"),
            Self::Laser(e) => write!(f, "laser: {e}"),
            Self::Safety(e) => write!(f, "safety: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Telemetry(msg) => write!(f, "telemetry: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Servo errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoError {
    /// Axis identifier does not name a servo axis.
    InvalidAxis(u8),
    /// PWM write to the servo hardware failed.
    Hardware,
    /// Moves kept overrunning and the controller latched as failed.
    Stalled,
}

impl fmt::Display for ServoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAxis(id) => write!(f, "invalid axis id {id}"),
            Self::Hardware => write!(f, "PWM write failed"),
            Self::Stalled => write!(f, "servo movement stalled"),
        }
    }
}

impl From<ServoError> for Error {
    fn from(e: ServoError) -> Self {
        Self::Servo(e)
    }
}

// ---------------------------------------------------------------------------
// Coordinate mapper errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordError {
    /// A parameter was rejected at the call boundary.
    InvalidParam(&'static str),
    /// Pixel lies outside the configured frame.
    OutOfBounds,
    /// The calibration point list is full.
    PointCapReached,
    /// Calibration needs at least one point.
    NotEnoughPoints,
    /// Calibration file does not exist.
    FileNotFound,
    /// Calibration file exists but could not be parsed.
    FileInvalid,
    /// Any other filesystem failure.
    Io,
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParam(what) => write!(f, "invalid parameter: {what}"),
            Self::OutOfBounds => write!(f, "pixel out of frame bounds"),
            Self::PointCapReached => write!(f, "calibration point cap reached"),
            Self::NotEnoughPoints => write!(f, "no calibration points"),
            Self::FileNotFound => write!(f, "calibration file not found"),
            Self::FileInvalid => write!(f, "calibration file malformed"),
            Self::Io => write!(f, "calibration file I/O error"),
        }
    }
}

impl From<CoordError> for Error {
    fn from(e: CoordError) -> Self {
        Self::Coord(e)
    }
}

// ---------------------------------------------------------------------------
// Motion detector errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionError {
    /// Frame geometry differs from the detector's configured geometry.
    FrameSizeMismatch { width: u32, height: u32 },
    /// Frame buffer is shorter than its declared geometry requires.
    BufferTooShort { expected: usize, actual: usize },
}

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameSizeMismatch { width, height } => {
                write!(f, "unexpected frame size {width}x{height}")
            }
            Self::BufferTooShort { expected, actual } => {
                write!(f, "frame buffer {actual} bytes, need {expected}")
            }
        }
    }
}

impl From<MotionError> for Error {
    fn from(e: MotionError) -> Self {
        Self::Motion(e)
    }
}

// ---------------------------------------------------------------------------
// Laser errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaserError {
    /// Laser is not armed.
    NotArmed,
    /// Kill switch is engaged.
    KillSwitch,
    /// Laser is cooling down after its last activation.
    Cooldown { remaining_ms: u64 },
    /// GPIO write to the laser driver failed.
    Hardware,
}

impl fmt::Display for LaserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotArmed => write!(f, "not armed"),
            Self::KillSwitch => write!(f, "kill switch engaged"),
            Self::Cooldown { remaining_ms } => write!(f, "cooldown ({remaining_ms} ms left)"),
            Self::Hardware => write!(f, "GPIO write failed"),
        }
    }
}

impl From<LaserError> for Error {
    fn from(e: LaserError) -> Self {
        Self::Laser(e)
    }
}

// ---------------------------------------------------------------------------
// Safety errors
// ---------------------------------------------------------------------------

/// Precondition failures reported by the safety layer.  Each failed check
/// has its own variant; simultaneous failures collapse into `Multiple`
/// while the per-check breakdown stays in the `SafetyResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyError {
    NotArmed,
    NoDetection,
    TiltUpward,
    TimeExceeded,
    KillSwitch,
    Watchdog,
    Brownout,
    SafeMode,
    Multiple,
    /// All checks passed but the laser controller itself refused.
    Laser(LaserError),
}

impl fmt::Display for SafetyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotArmed => write!(f, "not armed"),
            Self::NoDetection => write!(f, "no detection"),
            Self::TiltUpward => write!(f, "tilt upward"),
            Self::TimeExceeded => write!(f, "continuous on-time exceeded"),
            Self::KillSwitch => write!(f, "kill switch engaged"),
            Self::Watchdog => write!(f, "watchdog expired"),
            Self::Brownout => write!(f, "brownout"),
            Self::SafeMode => write!(f, "safe mode"),
            Self::Multiple => write!(f, "multiple checks failed"),
            Self::Laser(e) => write!(f, "laser refused: {e}"),
        }
    }
}

impl From<SafetyError> for Error {
    fn from(e: SafetyError) -> Self {
        Self::Safety(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
