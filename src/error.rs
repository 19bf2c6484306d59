//! Error taxonomy for the GPU resource core.
//!
//! A single enum rather than `thiserror`, matching the reference graphics
//! backend's hand-written `PlatformError`/`UnsupportedFeatureError` style.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone)]
pub enum CoreError {
    /// No WebGPU-class surface is present in the environment.
    DeviceUnavailable,
    /// An adapter was found but device creation failed, even with no optional features.
    DeviceInitFailed { reason: String },
    /// The device reported loss asynchronously. Carries the reason given by the driver.
    DeviceLost { reason: String },
    /// A capability or device query was made before `init`/`set_device`.
    NotInitialized,
    /// The computed bucket for a buffer request exceeds the device maximum.
    BufferTooLarge { requested: u64, max: u64 },
    /// A Command Recorder mutation was attempted after it left the Open state.
    AfterSubmit,
    /// `submit`/`submit_and_wait` was called on a recorder that already left Open.
    AlreadySubmitted,
    /// `resolve_profile_timings` was called on a recorder that was not constructed with profiling.
    MissingTimestampResources,
    /// Perf Guards denied a readback while `strict-mode` is enabled.
    ReadbackBlocked,
    /// A tensor's dtype did not match what an operation required.
    TypeMismatch {
        op: &'static str,
        expected: String,
        found: String,
    },
    /// A tensor's shape did not match what an operation required.
    ShapeMismatch {
        op: &'static str,
        expected: Vec<i64>,
        found: Vec<u32>,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUnavailable => write!(f, "no WebGPU-class device surface is available"),
            Self::DeviceInitFailed { reason } => write!(f, "device initialization failed: {reason}"),
            Self::DeviceLost { reason } => write!(f, "device was lost: {reason}"),
            Self::NotInitialized => write!(f, "device context is not initialized"),
            Self::BufferTooLarge { requested, max } => write!(
                f,
                "requested buffer bucket of {requested} bytes exceeds device maximum of {max} bytes"
            ),
            Self::AfterSubmit => write!(f, "command recorder mutated after leaving the Open state"),
            Self::AlreadySubmitted => write!(f, "command recorder was already submitted"),
            Self::MissingTimestampResources => {
                write!(f, "resolve_profile_timings called on a recorder without timestamp resources")
            }
            Self::ReadbackBlocked => write!(f, "readback blocked by perf guards (strict mode)"),
            Self::TypeMismatch { op, expected, found } => {
                write!(f, "{op}: expected dtype {expected}, found {found}")
            }
            Self::ShapeMismatch { op, expected, found } => {
                write!(f, "{op}: expected shape {expected:?}, found {found:?}")
            }
        }
    }
}

impl std::error::Error for CoreError {}
