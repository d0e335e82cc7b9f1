//! Folding captured lines into per-channel image bundles.
//!
//! Each channel owns a row-major `width x height` buffer plus a per-row fill
//! map. A bundle is released only after every one of its rows was written
//! exactly once; anything else is an assembly error.

use arrow::array::{ListArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema, UInt16Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::request::{ChannelId, RowIndexing};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::capabilities::FrameRecord;

/// Completed 2-D image for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBundle {
    /// Channel the image was captured on
    pub channel: ChannelId,
    /// Samples per row
    pub width: usize,
    /// Rows (one per trigger)
    pub height: usize,
    /// Row-major pixel buffer, `width * height` samples
    pub pixels: Vec<u16>,
    /// Acquisition this bundle belongs to
    pub acquisition_id: Uuid,
    /// When the bundle was released
    pub completed_at: DateTime<Utc>,
}

impl ImageBundle {
    /// Borrow row `index`, or `None` past the last row.
    pub fn row(&self, index: usize) -> Option<&[u16]> {
        if index >= self.height {
            return None;
        }
        let start = index * self.width;
        self.pixels.get(start..start + self.width)
    }

    /// Export the bundle as an Arrow RecordBatch, one record per row.
    ///
    /// # Output Schema
    /// ```text
    /// row (u32)
    /// line (list<u16>, samples of that row)
    /// ```
    ///
    /// Channel, acquisition id and completion time are attached as schema
    /// metadata by the storage layer.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        static SCHEMA: Lazy<Arc<Schema>> = Lazy::new(|| {
            Arc::new(Schema::new(vec![
                Field::new("row", DataType::UInt32, false),
                Field::new(
                    "line",
                    DataType::List(Arc::new(Field::new("item", DataType::UInt16, true))),
                    false,
                ),
            ]))
        });

        let rows: Vec<u32> = (0..self.height as u32).collect();
        let width = self.width.max(1);
        let lines = ListArray::from_iter_primitive::<UInt16Type, _, _>(
            self.pixels
                .chunks(width)
                .take(self.height)
                .map(|line| Some(line.iter().copied().map(Some))),
        );

        RecordBatch::try_new(
            SCHEMA.clone(),
            vec![Arc::new(UInt32Array::from(rows)), Arc::new(lines)],
        )
    }
}

#[derive(Debug)]
struct ChannelBuffer {
    pixels: Vec<u16>,
    filled: Vec<bool>,
    rows_written: usize,
}

impl ChannelBuffer {
    fn new(width: usize, height: usize) -> Self {
        Self {
            pixels: vec![0; width * height],
            filled: vec![false; height],
            rows_written: 0,
        }
    }
}

/// Collects frames for the channels of one acquisition.
#[derive(Debug)]
pub struct BundleAssembler {
    width: usize,
    height: usize,
    indexing: RowIndexing,
    buffers: BTreeMap<ChannelId, ChannelBuffer>,
}

impl BundleAssembler {
    /// Allocate empty `width x height` buffers for each channel.
    pub fn new(channels: &[ChannelId], width: usize, height: usize, indexing: RowIndexing) -> Self {
        let buffers = channels
            .iter()
            .map(|channel| (channel.clone(), ChannelBuffer::new(width, height)))
            .collect();
        Self {
            width,
            height,
            indexing,
            buffers,
        }
    }

    /// Row a frame sequence index maps to.
    pub fn row_for(&self, sequence: u64) -> usize {
        match self.indexing {
            RowIndexing::Direct => sequence as usize,
            RowIndexing::Modulo => (sequence % self.height.max(1) as u64) as usize,
        }
    }

    /// Write one captured line into its channel's buffer.
    ///
    /// # Errors
    /// `UnexpectedChannel`, `LineWidthMismatch`, `RowOutOfRange`, or
    /// `DuplicateFrame` when the target row already holds a line.
    pub fn insert(&mut self, frame: &FrameRecord) -> AcqResult<()> {
        let row = self.row_for(frame.sequence);
        let (width, height) = (self.width, self.height);

        let buffer = self.buffers.get_mut(&frame.channel).ok_or_else(|| {
            AcquisitionError::UnexpectedChannel {
                channel: frame.channel.clone(),
                sequence: frame.sequence,
            }
        })?;

        if frame.line.len() != width {
            return Err(AcquisitionError::LineWidthMismatch {
                sequence: frame.sequence,
                expected: width,
                actual: frame.line.len(),
            });
        }
        if row >= height {
            return Err(AcquisitionError::RowOutOfRange {
                sequence: frame.sequence,
                row,
                height,
            });
        }
        if buffer.filled[row] {
            return Err(AcquisitionError::DuplicateFrame {
                channel: frame.channel.clone(),
                sequence: frame.sequence,
                row,
            });
        }

        buffer.pixels[row * width..(row + 1) * width].copy_from_slice(&frame.line);
        buffer.filled[row] = true;
        buffer.rows_written += 1;
        Ok(())
    }

    /// Rows written so far for `channel`.
    pub fn rows_written(&self, channel: &ChannelId) -> usize {
        self.buffers
            .get(channel)
            .map_or(0, |buffer| buffer.rows_written)
    }

    /// True once every row of every channel has been written.
    pub fn is_complete(&self) -> bool {
        self.buffers
            .values()
            .all(|buffer| buffer.rows_written == self.height)
    }

    /// Release one bundle per channel.
    ///
    /// # Errors
    /// `IncompleteBundle` naming the first channel with missing rows; no
    /// bundle is released in that case.
    pub fn finish(self, acquisition_id: Uuid) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        if let Some((channel, buffer)) = self
            .buffers
            .iter()
            .find(|(_, buffer)| buffer.rows_written != self.height)
        {
            return Err(AcquisitionError::IncompleteBundle {
                channel: channel.clone(),
                missing: self.height - buffer.rows_written,
            });
        }

        let completed_at = Utc::now();
        let (width, height) = (self.width, self.height);
        let bundles: BTreeMap<_, _> = self
            .buffers
            .into_iter()
            .map(|(channel, buffer)| {
                let bundle = ImageBundle {
                    channel: channel.clone(),
                    width,
                    height,
                    pixels: buffer.pixels,
                    acquisition_id,
                    completed_at,
                };
                (channel, bundle)
            })
            .collect();

        debug!(
            %acquisition_id,
            channels = bundles.len(),
            width,
            height,
            "Bundles released"
        );
        Ok(bundles)
    }

    /// Drop all partially filled buffers.
    pub fn discard(self) {
        let written: usize = self.buffers.values().map(|buffer| buffer.rows_written).sum();
        debug!(rows_written = written, "Discarding partial bundles");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, UInt16Array};

    fn frame(sequence: u64, channel: &str, width: usize) -> FrameRecord {
        FrameRecord {
            sequence,
            timestamp: Utc::now(),
            channel: channel.into(),
            line: vec![sequence as u16; width],
        }
    }

    #[test]
    fn test_direct_assembly() {
        let mut assembler = BundleAssembler::new(&["558".into()], 3, 4, RowIndexing::Direct);
        for sequence in 0..4 {
            assembler.insert(&frame(sequence, "558", 3)).unwrap();
        }
        assert!(assembler.is_complete());

        let id = Uuid::new_v4();
        let bundles = assembler.finish(id).unwrap();
        let bundle = &bundles[&ChannelId::from("558")];
        assert_eq!(bundle.pixels.len(), 12);
        assert_eq!(bundle.row(2), Some(&[2u16, 2, 2][..]));
        assert_eq!(bundle.row(4), None);
        assert_eq!(bundle.acquisition_id, id);
    }

    #[test]
    fn test_modulo_assembly_across_passes() {
        let channels = ["558".into(), "687".into()];
        let mut assembler = BundleAssembler::new(&channels, 2, 3, RowIndexing::Modulo);
        for sequence in 0..3 {
            assembler.insert(&frame(sequence, "558", 2)).unwrap();
        }
        assert!(!assembler.is_complete());
        for sequence in 3..6 {
            assembler.insert(&frame(sequence, "687", 2)).unwrap();
        }

        let bundles = assembler.finish(Uuid::new_v4()).unwrap();
        assert_eq!(bundles[&ChannelId::from("687")].row(0), Some(&[3u16, 3][..]));
        assert_eq!(bundles[&ChannelId::from("558")].row(2), Some(&[2u16, 2][..]));
    }

    #[test]
    fn test_duplicate_row_rejected() {
        let mut assembler = BundleAssembler::new(&["558".into()], 1, 10, RowIndexing::Direct);
        assembler.insert(&frame(7, "558", 1)).unwrap();
        let err = assembler.insert(&frame(7, "558", 1)).unwrap_err();
        assert_eq!(
            err,
            AcquisitionError::DuplicateFrame {
                channel: "558".into(),
                sequence: 7,
                row: 7,
            }
        );
    }

    #[test]
    fn test_assembly_errors() {
        let mut assembler = BundleAssembler::new(&["558".into()], 2, 2, RowIndexing::Direct);
        assert!(matches!(
            assembler.insert(&frame(0, "740", 2)),
            Err(AcquisitionError::UnexpectedChannel { .. })
        ));
        assert!(matches!(
            assembler.insert(&frame(0, "558", 3)),
            Err(AcquisitionError::LineWidthMismatch { expected: 2, actual: 3, .. })
        ));
        assert!(matches!(
            assembler.insert(&frame(2, "558", 2)),
            Err(AcquisitionError::RowOutOfRange { row: 2, height: 2, .. })
        ));
        assert_eq!(assembler.rows_written(&"558".into()), 0);
    }

    #[test]
    fn test_incomplete_bundle_not_released() {
        let mut assembler = BundleAssembler::new(&["558".into()], 1, 5, RowIndexing::Direct);
        assembler.insert(&frame(0, "558", 1)).unwrap();
        let err = assembler.finish(Uuid::new_v4()).unwrap_err();
        assert_eq!(
            err,
            AcquisitionError::IncompleteBundle {
                channel: "558".into(),
                missing: 4,
            }
        );
    }

    #[test]
    fn test_record_batch_export() {
        let mut assembler = BundleAssembler::new(&["558".into()], 4, 3, RowIndexing::Direct);
        for sequence in 0..3 {
            assembler.insert(&frame(sequence, "558", 4)).unwrap();
        }
        let bundles = assembler.finish(Uuid::new_v4()).unwrap();
        let batch = bundles[&ChannelId::from("558")].to_record_batch().unwrap();

        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema().field(0).name(), "row");
        assert_eq!(batch.schema().field(1).name(), "line");

        let lines = batch
            .column(1)
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        let last = lines.value(2);
        let samples = last.as_any().downcast_ref::<UInt16Array>().unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.value(0), 2);
    }
}
