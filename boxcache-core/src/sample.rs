//! Sample descriptors shared by every container adapter.
//!
//! All times are expressed in 100 ns ticks after the adapter has scaled them
//! from the container's own timescale.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 100 ns ticks per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Convert a `Duration` into 100 ns ticks.
pub fn ticks_from_duration(duration: Duration) -> u64 {
    (duration.as_nanos() / 100) as u64
}

/// Rescale `value` from a container timescale (units per second) into ticks.
pub fn scale_to_ticks(value: u64, timescale: u32) -> u64 {
    if timescale == 0 {
        return 0;
    }
    ((value as u128 * TICKS_PER_SECOND as u128) / timescale as u128) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioKind {
    Aac,
    Mp3,
    Ac3,
    Pcm,
    Other,
}

impl AudioKind {
    /// AAC streams report half the real per-frame duration when the first
    /// window holds exactly eight records.
    pub fn halves_inference_duration(&self) -> bool {
        matches!(self, AudioKind::Aac)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Independently decodable frame.
    IFrame,
    /// Forward-dependent frame (P).
    DFrame,
    /// Bidirectionally dependent frame.
    BFrame,
    Audio(AudioKind),
    Unknown,
}

impl FrameKind {
    /// Whether a container block may begin with this frame.
    pub fn is_independent(&self) -> bool {
        !matches!(self, FrameKind::DFrame | FrameKind::BFrame)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, FrameKind::Audio(_))
    }
}

/// Location and timing of one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Zero-based sequence number within the track.
    pub index: i64,
    /// Byte offset of the payload in the backing store.
    pub stream_offset: u64,
    pub size: i32,
    /// Duration in ticks.
    pub duration: u32,
    /// Decode-order time in ticks, `None` until the running total is known.
    pub timestamp: Option<u64>,
    /// Added to `timestamp` to obtain presentation order.
    pub composition_offset: u64,
    pub kind: FrameKind,
}

impl SampleRecord {
    pub fn new(index: i64, stream_offset: u64, size: i32, duration: u32, kind: FrameKind) -> Self {
        Self {
            index,
            stream_offset,
            size,
            duration,
            timestamp: None,
            composition_offset: 0,
            kind,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_composition_offset(mut self, offset: u64) -> Self {
        self.composition_offset = offset;
        self
    }

    pub fn presentation_time(&self) -> Option<u64> {
        self.timestamp.map(|ts| ts + self.composition_offset)
    }

    /// Time at which the following record is expected to start.
    pub fn end_time(&self) -> Option<u64> {
        self.timestamp.map(|ts| ts + self.duration as u64)
    }
}

/// Address of a sample: by sequence index or by time in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKey {
    Index(i64),
    Time(u64),
}

impl SampleKey {
    pub fn index(&self) -> Option<i64> {
        match self {
            SampleKey::Index(i) => Some(*i),
            SampleKey::Time(_) => None,
        }
    }

    pub fn time(&self) -> Option<u64> {
        match self {
            SampleKey::Time(t) => Some(*t),
            SampleKey::Index(_) => None,
        }
    }
}

impl From<i64> for SampleKey {
    fn from(index: i64) -> Self {
        SampleKey::Index(index)
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKey::Index(i) => write!(f, "index {}", i),
            SampleKey::Time(t) => write!(f, "time {}", t),
        }
    }
}
