//! One contiguous run of sample records plus its eviction score.

use crate::error::{CacheError, Result};
use crate::sample::{SampleKey, SampleRecord};

/// Relevancy assigned to a freshly filled window.
pub const DEFAULT_RELEVANCY: i32 = 1200;
/// Relevancy of a window that just became empty or hit the end of the track.
pub const EMPTY_RELEVANCY: i32 = -1200;

#[derive(Debug, Clone)]
pub struct CacheWindow {
    records: Vec<SampleRecord>,
    relevancy: i32,
}

impl Default for CacheWindow {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            relevancy: DEFAULT_RELEVANCY,
        }
    }
}

impl CacheWindow {
    /// Build a window, checking that the records are contiguous and ascending.
    pub fn from_records(records: Vec<SampleRecord>) -> Result<Self> {
        check_contiguous(&records)?;
        Ok(Self {
            records,
            relevancy: DEFAULT_RELEVANCY,
        })
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn relevancy(&self) -> i32 {
        self.relevancy
    }

    pub(crate) fn bump(&mut self, delta: i32) {
        self.relevancy = self.relevancy.saturating_add(delta);
    }

    /// Drop the records and mark the window as the prime eviction candidate.
    pub(crate) fn clear(&mut self) -> Vec<SampleRecord> {
        self.relevancy = EMPTY_RELEVANCY;
        std::mem::take(&mut self.records)
    }

    pub fn start_index(&self) -> Option<i64> {
        self.records.first().map(|r| r.index)
    }

    pub fn end_index(&self) -> Option<i64> {
        self.records.last().map(|r| r.index)
    }

    pub fn start_time(&self) -> Option<u64> {
        self.records.first().and_then(|r| r.timestamp)
    }

    /// Last timestamp extended by half the last duration, so a time that
    /// lands past the middle of the final frame still belongs here.
    pub fn end_time(&self) -> Option<u64> {
        let last = self.records.last()?;
        last.timestamp.map(|ts| ts + last.duration as u64 / 2)
    }

    pub fn contains_index(&self, index: i64) -> bool {
        match (self.start_index(), self.end_index()) {
            (Some(start), Some(end)) => index >= start && index <= end,
            _ => false,
        }
    }

    pub fn contains_time(&self, time: u64) -> bool {
        match (self.start_time(), self.end_time()) {
            (Some(start), Some(end)) => time >= start && time <= end,
            _ => false,
        }
    }

    pub fn contains(&self, key: SampleKey) -> bool {
        match key {
            SampleKey::Index(index) => self.contains_index(index),
            SampleKey::Time(time) => self.contains_time(time),
        }
    }

    /// Position of the record addressed by `key` inside this window.
    pub fn position_of(&self, key: SampleKey) -> Option<usize> {
        match key {
            SampleKey::Index(index) => {
                let start = self.start_index()?;
                if !self.contains_index(index) {
                    return None;
                }
                Some((index - start) as usize)
            }
            SampleKey::Time(time) => {
                if !self.contains_time(time) {
                    return None;
                }
                let after = self
                    .records
                    .partition_point(|r| r.timestamp.map_or(false, |ts| ts <= time));
                Some(after.saturating_sub(1))
            }
        }
    }

    pub fn get(&self, key: SampleKey) -> Option<&SampleRecord> {
        self.position_of(key).and_then(|pos| self.records.get(pos))
    }

    /// Whether the index ranges of two windows intersect.
    pub fn overlaps(&self, other: &CacheWindow) -> bool {
        match (
            self.start_index(),
            self.end_index(),
            other.start_index(),
            other.end_index(),
        ) {
            (Some(a0), Some(a1), Some(b0), Some(b1)) => a0 <= b1 && b0 <= a1,
            _ => false,
        }
    }

    /// Extend the window with records that continue it.
    pub(crate) fn append(&mut self, records: Vec<SampleRecord>) -> Result<()> {
        if let (Some(last), Some(first)) = (self.records.last(), records.first()) {
            check_contiguous(&[last.clone(), first.clone()])?;
        }
        check_contiguous(&records)?;
        self.records.extend(records);
        Ok(())
    }

    pub(crate) fn replace(&mut self, records: Vec<SampleRecord>) -> Result<()> {
        check_contiguous(&records)?;
        self.records = records;
        self.relevancy = if self.records.is_empty() {
            EMPTY_RELEVANCY
        } else {
            DEFAULT_RELEVANCY
        };
        Ok(())
    }
}

/// Records must be ascending by index with no gaps, and timestamps that are
/// known must never go backwards.
pub(crate) fn check_contiguous(records: &[SampleRecord]) -> Result<()> {
    for pair in records.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.index != prev.index + 1 {
            return Err(CacheError::AdapterContract(format!(
                "record {} follows {}, expected {}",
                next.index,
                prev.index,
                prev.index + 1
            )));
        }
        if let (Some(a), Some(b)) = (prev.timestamp, next.timestamp) {
            if b < a {
                return Err(CacheError::AdapterContract(format!(
                    "timestamp of record {} goes backwards ({} < {})",
                    next.index, b, a
                )));
            }
        }
    }
    Ok(())
}
