//! Motion-synchronized line-scan acquisition.
//!
//! Data flow for one request:
//!
//! ```text
//! AcquisitionController
//!   -> AcquisitionRequest::validate
//!   -> MotionPlanner::plan           (pure, per channel group)
//!   -> IlluminationCoordinator::settle
//!   -> ScanSynchronizer::run         (stage motion + frame capture)
//!   -> BundleAssembler::finish       (one ImageBundle per channel)
//! ```

pub mod assembler;
pub mod controller;
pub mod illumination;
pub mod planner;
pub mod request;
pub mod synchronizer;
pub mod wait;

pub use assembler::{BundleAssembler, ImageBundle};
pub use controller::{AcquisitionController, Instrument, ZPlane, ZStack};
pub use illumination::{IlluminationCoordinator, IlluminationState, LightPath};
pub use planner::{MotionPlanner, ScanProfile};
pub use request::{AcquisitionRequest, ChannelId, RowIndexing, ScanRegion};
pub use synchronizer::{ScanReport, ScanState, ScanSynchronizer};
pub use wait::{poll_until, AbortHandle, Checkpoint, WaitPolicy};
