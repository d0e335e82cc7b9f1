//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `AcquisitionError`, for every
//! stage of a line-scan acquisition. Using the `thiserror` crate, it provides a
//! single, consistent error value per failed request, from request validation
//! through illumination settling, stage motion, frame triggering and bundle
//! assembly.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidRequest`** / **`ProfileInfeasible`**: the request was rejected
//!   before any device command was issued.
//! - **`IlluminationTimeout`**: the light path did not settle in time. No motion
//!   took place, so the caller may simply retry.
//! - **`DeviceFault`**: a device self-reported a hardware fault. Always fatal to
//!   the current acquisition and carries the device identity verbatim.
//! - **`FrameSequenceError`** / **`FrameTimeout`**: detected while triggering;
//!   both abort the scan.
//! - **`DuplicateFrame`** and the other assembly variants: logic
//!   inconsistencies detected while folding frames into bundles.
//!
//! [`AcquisitionError::stage`] tells the caller which stage failed.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::acquisition::request::ChannelId;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcquisitionError>;

/// A hardware fault reported by a device proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device '{device}' reported fault: {reason}")]
pub struct DeviceFault {
    /// Identifier of the faulting device
    pub device: String,
    /// Fault description as reported by the device
    pub reason: String,
}

impl DeviceFault {
    /// Create a fault for `device` with the given reason.
    pub fn new(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

/// The stage of an acquisition in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionStage {
    /// Request validation, before any device I/O
    Validation,
    /// Motion profile planning
    Planning,
    /// Laser power, filter and focus settling
    Illumination,
    /// Stage positioning, acceleration and deceleration
    Motion,
    /// Triggered frame capture
    Triggering,
    /// Folding frames into image bundles
    Assembly,
}

impl AcquisitionStage {
    /// Lowercase stage name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionStage::Validation => "validation",
            AcquisitionStage::Planning => "planning",
            AcquisitionStage::Illumination => "illumination",
            AcquisitionStage::Motion => "motion",
            AcquisitionStage::Triggering => "triggering",
            AcquisitionStage::Assembly => "assembly",
        }
    }
}

impl fmt::Display for AcquisitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("Invalid acquisition request: {0}")]
    InvalidRequest(String),

    #[error("Scan profile infeasible: {0}")]
    ProfileInfeasible(String),

    #[error("Illumination did not settle within {timeout:?} (unsettled: {})", unsettled.join(", "))]
    IlluminationTimeout {
        timeout: Duration,
        unsettled: Vec<String>,
    },

    #[error("Scan requested without a settled light path")]
    NotSettled,

    #[error("Device fault during {stage}: {fault}")]
    DeviceFault {
        stage: AcquisitionStage,
        fault: DeviceFault,
    },

    #[error("Timed out after {timeout:?} waiting for {condition}")]
    MotionTimeout {
        condition: String,
        timeout: Duration,
    },

    #[error("Frame sequence error: expected index {expected}, received {received}")]
    FrameSequenceError { expected: u64, received: u64 },

    #[error("No frame arrived within {timeout:?} after {received} frames")]
    FrameTimeout { timeout: Duration, received: u64 },

    #[error("Duplicate frame {sequence} for channel {channel} (row {row} already written)")]
    DuplicateFrame {
        channel: ChannelId,
        sequence: u64,
        row: usize,
    },

    #[error("Frame {sequence} carries channel {channel} which is not part of this acquisition")]
    UnexpectedChannel { channel: ChannelId, sequence: u64 },

    #[error("Frame {sequence} has {actual} samples, expected {expected}")]
    LineWidthMismatch {
        sequence: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Frame {sequence} maps to row {row} outside bundle height {height}")]
    RowOutOfRange {
        sequence: u64,
        row: usize,
        height: usize,
    },

    #[error("Bundle for channel {channel} is missing {missing} rows")]
    IncompleteBundle { channel: ChannelId, missing: usize },

    #[error("Acquisition aborted by caller during {stage}")]
    Aborted { stage: AcquisitionStage },

    #[error("Acquisition exceeded its wall-clock budget of {budget:?} during {stage}")]
    BudgetExceeded {
        budget: Duration,
        stage: AcquisitionStage,
    },

    #[error("Another acquisition is already in progress")]
    Busy,
}

impl AcquisitionError {
    /// Wrap a device fault raised during `stage`.
    pub fn device(stage: AcquisitionStage, fault: DeviceFault) -> Self {
        AcquisitionError::DeviceFault { stage, fault }
    }

    /// The stage in which this error was raised.
    pub fn stage(&self) -> AcquisitionStage {
        match self {
            AcquisitionError::InvalidRequest(_) | AcquisitionError::Busy => {
                AcquisitionStage::Validation
            }
            AcquisitionError::ProfileInfeasible(_) => AcquisitionStage::Planning,
            AcquisitionError::IlluminationTimeout { .. } | AcquisitionError::NotSettled => {
                AcquisitionStage::Illumination
            }
            AcquisitionError::DeviceFault { stage, .. }
            | AcquisitionError::Aborted { stage }
            | AcquisitionError::BudgetExceeded { stage, .. } => *stage,
            AcquisitionError::MotionTimeout { .. } => AcquisitionStage::Motion,
            AcquisitionError::FrameSequenceError { .. }
            | AcquisitionError::FrameTimeout { .. } => AcquisitionStage::Triggering,
            AcquisitionError::DuplicateFrame { .. }
            | AcquisitionError::UnexpectedChannel { .. }
            | AcquisitionError::LineWidthMismatch { .. }
            | AcquisitionError::RowOutOfRange { .. }
            | AcquisitionError::IncompleteBundle { .. } => AcquisitionStage::Assembly,
        }
    }

    /// True if no stage motion happened before the failure, so a plain retry
    /// of the same request is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::IlluminationTimeout { .. } | AcquisitionError::Busy
        )
    }
}
