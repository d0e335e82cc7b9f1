//! Acquisition request value objects and their validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::config::{ChannelSchedule, ScanConfig};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::capabilities::AxisLimits;

/// Fluorescence channel identifier (e.g. emission band "558")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Region to image along the scan axis, in stage units.
///
/// `end` may be smaller than `start` for scans that run towards the axis
/// minimum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRegion {
    /// Position of the first imaged row
    pub start: f64,
    /// Position just past the last imaged row
    pub end: f64,
}

impl ScanRegion {
    /// Unsigned region length.
    pub fn length(&self) -> f64 {
        (self.end - self.start).abs()
    }

    /// +1.0 for scans towards increasing positions, -1.0 otherwise.
    pub fn direction(&self) -> f64 {
        if self.end >= self.start {
            1.0
        } else {
            -1.0
        }
    }
}

/// How a frame's sequence index maps onto a bundle row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowIndexing {
    /// Row = sequence index; the scan covers exactly one bundle height
    Direct,
    /// Row = sequence index mod bundle height; consecutive passes of
    /// bundle-height lines belong to successive channels
    Modulo,
}

/// Input to [`AcquisitionController::acquire`](crate::acquisition::AcquisitionController::acquire)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Region along the scan axis
    pub region: ScanRegion,
    /// Channels to image, in capture order
    pub channels: Vec<ChannelId>,
    /// Rows per image bundle
    pub bundle_height: u32,
    /// Triggers per scan
    pub frame_count: u32,
    /// Sequence-to-row mapping
    pub indexing: RowIndexing,
    /// Objective focus position to settle before scanning
    #[serde(default)]
    pub focus: Option<f64>,
    /// Wall-clock budget for the whole request
    #[serde(default)]
    pub budget: Option<Duration>,
}

impl AcquisitionRequest {
    /// Single-pass request: one bundle of `frame_count` rows per channel.
    pub fn single_pass(region: ScanRegion, channels: Vec<ChannelId>, frame_count: u32) -> Self {
        Self {
            region,
            channels,
            bundle_height: frame_count,
            frame_count,
            indexing: RowIndexing::Direct,
            focus: None,
            budget: None,
        }
    }

    /// Set the objective focus position.
    pub fn with_focus(mut self, focus: f64) -> Self {
        self.focus = Some(focus);
        self
    }

    /// Set the wall-clock budget.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Number of channels captured by one scan under `schedule`.
    pub fn channels_per_scan(&self, schedule: ChannelSchedule) -> usize {
        match schedule {
            ChannelSchedule::Interleaved => self.channels.len(),
            ChannelSchedule::Sequential => 1,
        }
    }

    /// Check the request before any device command is issued.
    ///
    /// Verifies that the region lies within the stage travel, the bundle
    /// height and frame count are positive and mutually consistent with the
    /// indexing mode, and every channel is known and listed once.
    pub fn validate(&self, limits: &AxisLimits, config: &ScanConfig) -> AcqResult<()> {
        let invalid = |msg: String| Err(AcquisitionError::InvalidRequest(msg));

        if !self.region.start.is_finite() || !self.region.end.is_finite() {
            return invalid("region bounds must be finite".to_string());
        }
        if !limits.contains(self.region.start) || !limits.contains(self.region.end) {
            return invalid(format!(
                "region [{}, {}] outside stage travel [{}, {}]",
                self.region.start, self.region.end, limits.min_position, limits.max_position
            ));
        }
        if self.region.length() == 0.0 {
            return invalid("region has zero length".to_string());
        }
        if self.bundle_height == 0 {
            return invalid("bundle_height must be > 0".to_string());
        }
        if self.frame_count == 0 {
            return invalid("frame_count must be > 0".to_string());
        }
        if self.channels.is_empty() {
            return invalid("channel set is empty".to_string());
        }

        let mut seen = BTreeSet::new();
        for channel in &self.channels {
            if !seen.insert(channel) {
                return invalid(format!("channel {} requested twice", channel));
            }
            if config.channel(channel).is_none() {
                return invalid(format!("channel {} is not configured", channel));
            }
        }

        let passes = self.channels_per_scan(config.triggering.channel_schedule) as u32;
        match self.indexing {
            RowIndexing::Direct => {
                if passes > 1 {
                    return invalid(
                        "interleaved multi-channel scans require modulo row indexing".to_string(),
                    );
                }
                if self.frame_count != self.bundle_height {
                    return invalid(format!(
                        "direct indexing needs frame_count ({}) == bundle_height ({})",
                        self.frame_count, self.bundle_height
                    ));
                }
            }
            RowIndexing::Modulo => {
                let expected = u64::from(self.bundle_height) * u64::from(passes);
                if u64::from(self.frame_count) != expected {
                    return invalid(format!(
                        "modulo indexing needs frame_count ({}) == bundle_height ({}) \
                         x channels per scan ({})",
                        self.frame_count, self.bundle_height, passes
                    ));
                }
            }
        }

        if let Some(focus) = self.focus {
            if !focus.is_finite() {
                return invalid("focus position must be finite".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    fn limits() -> AxisLimits {
        AxisLimits {
            min_position: -10.0,
            max_position: 100.0,
            max_velocity: 5.0,
        }
    }

    fn region() -> ScanRegion {
        ScanRegion {
            start: 0.0,
            end: 1.0,
        }
    }

    #[test]
    fn test_single_pass_request_is_valid() {
        let config = test_config(ChannelSchedule::Sequential);
        let request = AcquisitionRequest::single_pass(region(), vec!["558".into()], 1000);
        assert!(request.validate(&limits(), &config).is_ok());
    }

    #[test]
    fn test_region_outside_travel() {
        let config = test_config(ChannelSchedule::Sequential);
        let request = AcquisitionRequest::single_pass(
            ScanRegion {
                start: 50.0,
                end: 150.0,
            },
            vec!["558".into()],
            10,
        );
        let err = request.validate(&limits(), &config).unwrap_err();
        assert!(err.to_string().contains("outside stage travel"));
    }

    #[test]
    fn test_rejects_zero_height_and_empty_channels() {
        let config = test_config(ChannelSchedule::Sequential);
        let mut request = AcquisitionRequest::single_pass(region(), vec!["558".into()], 10);
        request.bundle_height = 0;
        assert!(matches!(
            request.validate(&limits(), &config),
            Err(AcquisitionError::InvalidRequest(_))
        ));

        let request = AcquisitionRequest::single_pass(region(), vec![], 10);
        let err = request.validate(&limits(), &config).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_rejects_unknown_and_repeated_channels() {
        let config = test_config(ChannelSchedule::Sequential);
        let request = AcquisitionRequest::single_pass(region(), vec!["999".into()], 10);
        assert!(request
            .validate(&limits(), &config)
            .unwrap_err()
            .to_string()
            .contains("not configured"));

        let request =
            AcquisitionRequest::single_pass(region(), vec!["558".into(), "558".into()], 10);
        assert!(request
            .validate(&limits(), &config)
            .unwrap_err()
            .to_string()
            .contains("twice"));
    }

    #[test]
    fn test_interleaved_needs_modulo_indexing() {
        let config = test_config(ChannelSchedule::Interleaved);
        let mut request =
            AcquisitionRequest::single_pass(region(), vec!["558".into(), "610".into()], 100);
        assert!(request.validate(&limits(), &config).is_err());

        request.indexing = RowIndexing::Modulo;
        request.bundle_height = 50;
        assert!(request.validate(&limits(), &config).is_ok());

        request.bundle_height = 40;
        assert!(request.validate(&limits(), &config).is_err());
    }
}
