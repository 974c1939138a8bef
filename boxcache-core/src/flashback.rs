//! Random access into append-only streams.
//!
//! Every window the cache ever fills leaves a checkpoint behind: the index of
//! its first record together with the file position and timestamp needed to
//! restart parsing there. A lookup far from anything cached can then jump to
//! the nearest checkpoint instead of rescanning the stream from the start.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::manager::{TrackCacheManager, PROVISIONAL_BLOCK};
use crate::sample::{SampleKey, SampleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub index: i64,
    pub file_position: u64,
    pub timestamp: u64,
    pub composition_offset: u64,
}

impl Checkpoint {
    /// Checkpoint for a window starting at `record`. Records without a known
    /// timestamp cannot be restarted from.
    pub fn from_record(record: &SampleRecord) -> Option<Self> {
        Some(Self {
            index: record.index,
            file_position: record.stream_offset,
            timestamp: record.timestamp?,
            composition_offset: record.composition_offset,
        })
    }
}

/// Append-only map of restart points, ordered by index.
#[derive(Debug, Clone, Default)]
pub struct FlashbackIndex {
    checkpoints: BTreeMap<i64, Checkpoint>,
}

impl FlashbackIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Record a checkpoint. Returns `false` when the index is already known.
    pub fn register(&mut self, checkpoint: Checkpoint) -> Result<bool> {
        if self.checkpoints.contains_key(&checkpoint.index) {
            return Ok(false);
        }

        let before = self.checkpoints.range(..checkpoint.index).next_back();
        let after = self.checkpoints.range(checkpoint.index + 1..).next();
        let out_of_order = |a: &Checkpoint, b: &Checkpoint| {
            a.file_position >= b.file_position || a.timestamp > b.timestamp
        };
        if let Some((_, prev)) = before {
            if out_of_order(prev, &checkpoint) {
                return Err(CacheError::InconsistentState(format!(
                    "checkpoint {} at {} does not follow checkpoint {} at {}",
                    checkpoint.index, checkpoint.file_position, prev.index, prev.file_position
                )));
            }
        }
        if let Some((_, next)) = after {
            if out_of_order(&checkpoint, next) {
                return Err(CacheError::InconsistentState(format!(
                    "checkpoint {} at {} does not precede checkpoint {} at {}",
                    checkpoint.index, checkpoint.file_position, next.index, next.file_position
                )));
            }
        }

        self.checkpoints.insert(checkpoint.index, checkpoint);
        Ok(true)
    }

    pub fn get(&self, index: i64) -> Option<&Checkpoint> {
        self.checkpoints.get(&index)
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    /// Latest checkpoint at or before `key`.
    pub fn floor(&self, key: SampleKey) -> Option<&Checkpoint> {
        match key {
            SampleKey::Index(index) => self.checkpoints.range(..=index).next_back().map(|(_, c)| c),
            // timestamps ascend with index, so the last one not after `time` wins
            SampleKey::Time(time) => self
                .checkpoints
                .values()
                .take_while(|c| c.timestamp <= time)
                .last(),
        }
    }

    /// First checkpoint after index `index`.
    pub fn successor(&self, index: i64) -> Option<&Checkpoint> {
        self.checkpoints.range(index + 1..).next().map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }
}

/// How a lookup reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashbackPath {
    /// Already in a window.
    Cached,
    /// No usable checkpoint; the plain miss path applies.
    Base,
    /// Past everything ever indexed: walk forward from the live boundary.
    MoveForwardBeyondLast,
    /// Within one block of a checkpoint: refill from it, seeking the backing
    /// store first when its cursor is elsewhere.
    JumpToStreamPosition { checkpoint: Checkpoint, reposition: bool },
    /// Resynchronize the container at a checkpoint.
    Warp { checkpoint: Checkpoint },
}

/// Cache manager plus the checkpoint index for one track.
#[derive(Debug)]
pub struct FlashbackCache {
    base: TrackCacheManager,
    index: FlashbackIndex,
    frontier_index: Option<i64>,
    frontier_time: Option<u64>,
}

impl FlashbackCache {
    pub fn new(mut base: TrackCacheManager) -> Self {
        base.set_track_installs(true);
        Self {
            base,
            index: FlashbackIndex::new(),
            frontier_index: None,
            frontier_time: None,
        }
    }

    pub fn base(&self) -> &TrackCacheManager {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut TrackCacheManager {
        &mut self.base
    }

    pub fn index(&self) -> &FlashbackIndex {
        &self.index
    }

    /// Highest index any window has ever reached.
    pub fn frontier(&self) -> Option<i64> {
        self.frontier_index
    }

    pub fn register(&mut self, record: &SampleRecord) -> Result<bool> {
        match Checkpoint::from_record(record) {
            Some(checkpoint) => self.index.register(checkpoint),
            None => Ok(false),
        }
    }

    /// Turn the windows filled since the last call into checkpoints.
    pub fn absorb(&mut self) -> Result<()> {
        for installed in self.base.drain_installed() {
            if self.register(&installed.first)? {
                tracing::trace!(index = installed.first.index, "checkpoint registered");
            }
            self.frontier_index = Some(
                self.frontier_index
                    .map_or(installed.end_index, |f| f.max(installed.end_index)),
            );
            if let Some(end_time) = installed.end_time {
                self.frontier_time = Some(self.frontier_time.map_or(end_time, |f| f.max(end_time)));
            }
        }
        Ok(())
    }

    fn beyond_frontier(&self, key: SampleKey) -> bool {
        match key {
            SampleKey::Index(index) => self.frontier_index.map_or(false, |f| index > f),
            SampleKey::Time(time) => self.frontier_time.map_or(false, |f| time > f),
        }
    }

    /// Choose how to reach `key` given where the backing store's read
    /// cursor currently is.
    pub fn plan(&self, key: SampleKey, stream_position: u64) -> FlashbackPath {
        if self.base.contains(key) {
            return FlashbackPath::Cached;
        }
        let Some(floor) = self.index.floor(key).copied() else {
            return FlashbackPath::Base;
        };

        let is_last = self.index.last().map(|c| c.index) == Some(floor.index);
        if is_last && self.beyond_frontier(key) {
            tracing::debug!(%key, floor = floor.index, "moving forward beyond last checkpoint");
            return FlashbackPath::MoveForwardBeyondLast;
        }

        let near = match key {
            SampleKey::Index(index) => {
                let block = self.base.current_block_size().unwrap_or(PROVISIONAL_BLOCK) as i64;
                index - floor.index < block
            }
            SampleKey::Time(time) => time - floor.timestamp < self.base.read_ahead_extent(),
        };
        if near {
            let next = self.index.successor(floor.index);
            let in_place = stream_position >= floor.file_position
                && next.map_or(true, |n| stream_position < n.file_position);
            tracing::debug!(%key, floor = floor.index, reposition = !in_place, "jump to checkpoint");
            return FlashbackPath::JumpToStreamPosition {
                checkpoint: floor,
                reposition: !in_place,
            };
        }

        tracing::debug!(%key, floor = floor.index, "warp to checkpoint");
        FlashbackPath::Warp { checkpoint: floor }
    }
}
