//! Boundary with the format-specific parsers.
//!
//! A `TrackAdapter` turns container metadata into `SampleRecord`s for one
//! track. A `StreamSource` owns the backing store shared by all tracks of a
//! container. The cache never looks at payload bytes or box layout.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::sample::SampleRecord;

/// Half-open range handed to an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRange {
    Index { start: i64, end: i64 },
    Time { start: u64, end: u64 },
}

impl FillRange {
    pub fn is_empty(&self) -> bool {
        match *self {
            FillRange::Index { start, end } => end <= start,
            FillRange::Time { start, end } => end <= start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: u32,
    pub kind: TrackKind,
    /// Sample entry fourcc (`avc1`, `mp4a`, ...).
    pub codec: String,
    pub timescale: u32,
    /// Total sample count when the container declares it up front.
    pub sample_count: Option<u64>,
    /// Live streams only grow; they get the flashback index.
    pub append_only: bool,
}

impl TrackInfo {
    /// Append-only video track whose times are already in ticks.
    pub fn live(id: u32) -> Self {
        Self {
            id,
            kind: TrackKind::Video,
            codec: "live".to_string(),
            timescale: crate::sample::TICKS_PER_SECOND as u32,
            sample_count: None,
            append_only: true,
        }
    }
}

/// Result of handing a finished write batch to the adapter.
#[derive(Debug, Clone)]
pub struct Materialized {
    /// The batch with its final stream offsets assigned.
    pub records: Vec<SampleRecord>,
    /// Where the next batch will be written.
    pub write_offset: u64,
}

/// Format-specific sample source for one track.
///
/// `fill_*` must return records in ascending index order with no gaps. An
/// empty result means nothing is available at or after the start of the
/// range yet; it is never an error.
pub trait TrackAdapter: Send {
    fn info(&self) -> &TrackInfo;

    /// Records with `start <= index < end`.
    fn fill_by_index(&mut self, start: i64, end: i64) -> Result<Vec<SampleRecord>>;

    /// Records covering `start <= time < end`, beginning with the record
    /// that contains `start`.
    fn fill_by_time(&mut self, start: u64, end: u64) -> Result<Vec<SampleRecord>>;

    fn fill(&mut self, range: FillRange) -> Result<Vec<SampleRecord>> {
        match range {
            FillRange::Index { start, end } => self.fill_by_index(start, end),
            FillRange::Time { start, end } => self.fill_by_time(start, end),
        }
    }

    /// Pull more container metadata so that at least `count` records from
    /// `hint_index` on can be filled. Returns how many became available.
    fn notify_need_more_data(&mut self, count: u32, hint_index: i64) -> Result<usize>;

    /// Lay out a batch produced on the write path.
    fn materialize(&mut self, batch: Vec<SampleRecord>, write_offset: u64) -> Result<Materialized> {
        let _ = (batch, write_offset);
        Err(CacheError::ReadOnly)
    }
}

/// Backing store shared by every track of one container.
pub trait StreamSource: Send {
    /// Current read cursor in the backing store.
    fn position(&self) -> u64;

    /// Parse up to `budget` more sample headers without reading payloads.
    fn request_more_container_metadata(&mut self, budget: i32) -> Result<usize>;

    /// Reposition the store and restart parsing at `file_position`, whose
    /// first sample starts at `timestamp`. Resident metadata is dropped.
    fn resynchronize(&mut self, file_position: u64, timestamp: u64) -> Result<()>;

    /// Reposition the read cursor only.
    fn seek(&mut self, file_position: u64) -> Result<()>;
}

/// Container formats with a built-in adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerFormat {
    Mp4,
}

impl ContainerFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "mp4" | "m4v" | "m4a" | "mov" => Ok(ContainerFormat::Mp4),
            other => Err(CacheError::UnsupportedContainer(other.to_string())),
        }
    }
}
