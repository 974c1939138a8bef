//! In-memory live stream.
//!
//! Models a growing, interleaved backing store such as a capture file that is
//! still being written. Every record ever appended is kept in the "file", but
//! an adapter only sees records whose headers have been parsed, and a
//! per-track residency bound drops the oldest parsed headers the way a real
//! demuxer forgets history it has already streamed past.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::adapter::{Materialized, StreamSource, TrackAdapter, TrackInfo};
use crate::error::{CacheError, Result};
use crate::sample::SampleRecord;

#[derive(Debug)]
struct TrackState {
    info: TrackInfo,
    records: Vec<SampleRecord>,
    /// Parsed headers the adapter can hand out.
    resident: Range<i64>,
    /// Next record the parser will read.
    next: i64,
    fill_calls: u64,
    need_more_calls: u64,
}

impl TrackState {
    fn len(&self) -> i64 {
        self.records.len() as i64
    }

    fn first_at_or_after(&self, file_position: u64) -> i64 {
        self.records
            .partition_point(|r| r.stream_offset < file_position) as i64
    }

    fn parse_next(&mut self, max_resident: Option<usize>) -> Option<&SampleRecord> {
        let index = self.next;
        if index >= self.len() {
            return None;
        }
        if index == self.resident.end {
            self.resident.end += 1;
        } else if !self.resident.contains(&index) {
            self.resident = index..index + 1;
        }
        if let Some(max) = max_resident {
            let excess = (self.resident.end - self.resident.start) - max as i64;
            if excess > 0 {
                self.resident.start += excess;
            }
        }
        self.next += 1;
        self.records.get(index as usize)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    tracks: Vec<TrackState>,
    position: u64,
    max_resident: Option<usize>,
    resync_calls: u64,
    seek_calls: u64,
}

impl StreamState {
    fn track(&mut self, track: usize) -> Result<&mut TrackState> {
        self.tracks
            .get_mut(track)
            .ok_or_else(|| CacheError::InconsistentState(format!("no memory track {}", track)))
    }

    /// Parse the header with the lowest stream offset across all tracks.
    fn parse_one(&mut self) -> bool {
        let next_track = self
            .tracks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.records.get(t.next as usize).map(|r| (i, r.stream_offset)))
            .min_by_key(|&(_, offset)| offset)
            .map(|(i, _)| i);

        let Some(track) = next_track else {
            return false;
        };
        let max = self.max_resident;
        match self.tracks[track].parse_next(max) {
            Some(record) => {
                self.position = record.stream_offset + record.size.max(0) as u64;
                true
            }
            None => false,
        }
    }
}

/// Shared handle to an in-memory stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<StreamState>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max` parsed headers per track.
    pub fn with_max_resident(max: usize) -> Self {
        let stream = Self::new();
        stream.inner.lock().max_resident = Some(max.max(1));
        stream
    }

    pub fn add_track(&self, info: TrackInfo) -> usize {
        let mut state = self.inner.lock();
        state.tracks.push(TrackState {
            info,
            records: Vec::new(),
            resident: 0..0,
            next: 0,
            fill_calls: 0,
            need_more_calls: 0,
        });
        state.tracks.len() - 1
    }

    /// Append a record to the end of a track without parsing it.
    pub fn append(&self, track: usize, record: SampleRecord) -> Result<()> {
        let mut state = self.inner.lock();
        let track = state.track(track)?;
        if record.index != track.len() {
            return Err(CacheError::AdapterContract(format!(
                "appended record {} to a track of {}",
                record.index,
                track.len()
            )));
        }
        track.records.push(record);
        Ok(())
    }

    /// Append a run of records, skipping any that do not continue the track.
    pub fn append_all(&self, track: usize, records: impl IntoIterator<Item = SampleRecord>) {
        for record in records {
            if let Err(e) = self.append(track, record) {
                tracing::warn!("dropping record: {}", e);
            }
        }
    }

    /// Parse headers of one track until `end` is resident or the track runs out.
    pub fn parse_up_to_index(&self, track: usize, end: i64) -> usize {
        let mut state = self.inner.lock();
        let max = state.max_resident;
        let mut parsed = 0;
        let mut position = None;
        if let Ok(t) = state.track(track) {
            while t.next < end {
                match t.parse_next(max) {
                    Some(r) => position = Some(r.stream_offset + r.size.max(0) as u64),
                    None => break,
                }
                parsed += 1;
            }
        }
        if let Some(position) = position {
            state.position = state.position.max(position);
        }
        parsed
    }

    /// Parse up to `budget` headers in stream order.
    pub fn load_more(&self, budget: usize) -> usize {
        let mut state = self.inner.lock();
        let mut parsed = 0;
        while parsed < budget && state.parse_one() {
            parsed += 1;
        }
        parsed
    }

    pub fn resident_range(&self, track: usize) -> Range<i64> {
        let mut state = self.inner.lock();
        state.track(track).map(|t| t.resident.clone()).unwrap_or(0..0)
    }

    pub fn len(&self, track: usize) -> usize {
        let mut state = self.inner.lock();
        state.track(track).map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn position(&self) -> u64 {
        self.inner.lock().position
    }

    pub fn resync_calls(&self) -> u64 {
        self.inner.lock().resync_calls
    }

    pub fn seek_calls(&self) -> u64 {
        self.inner.lock().seek_calls
    }

    pub fn adapter(&self, track: usize) -> MemoryTrackAdapter {
        let info = {
            let mut state = self.inner.lock();
            state
                .track(track)
                .map(|t| t.info.clone())
                .unwrap_or_else(|_| TrackInfo::live(track as u32))
        };
        MemoryTrackAdapter {
            stream: self.clone(),
            track,
            info,
        }
    }

    pub fn source(&self) -> MemorySource {
        MemorySource {
            stream: self.clone(),
        }
    }
}

/// `StreamSource` view of a [`MemoryStream`].
#[derive(Debug, Clone)]
pub struct MemorySource {
    stream: MemoryStream,
}

impl StreamSource for MemorySource {
    fn position(&self) -> u64 {
        self.stream.position()
    }

    fn request_more_container_metadata(&mut self, budget: i32) -> Result<usize> {
        Ok(self.stream.load_more(budget.max(0) as usize))
    }

    fn resynchronize(&mut self, file_position: u64, timestamp: u64) -> Result<()> {
        let mut state = self.stream.inner.lock();
        state.resync_calls += 1;
        state.position = file_position;
        for track in &mut state.tracks {
            let next = track.first_at_or_after(file_position);
            track.next = next;
            track.resident = next..next;
        }
        tracing::debug!(file_position, timestamp, "memory stream resynchronized");
        Ok(())
    }

    fn seek(&mut self, file_position: u64) -> Result<()> {
        let mut state = self.stream.inner.lock();
        state.seek_calls += 1;
        state.position = file_position;
        for track in &mut state.tracks {
            track.next = track.first_at_or_after(file_position);
        }
        Ok(())
    }
}

/// `TrackAdapter` over one track of a [`MemoryStream`].
#[derive(Debug, Clone)]
pub struct MemoryTrackAdapter {
    stream: MemoryStream,
    track: usize,
    info: TrackInfo,
}

impl MemoryTrackAdapter {
    pub fn fill_calls(&self) -> u64 {
        let mut state = self.stream.inner.lock();
        state.track(self.track).map(|t| t.fill_calls).unwrap_or(0)
    }

    pub fn need_more_calls(&self) -> u64 {
        let mut state = self.stream.inner.lock();
        state.track(self.track).map(|t| t.need_more_calls).unwrap_or(0)
    }
}

impl TrackAdapter for MemoryTrackAdapter {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn fill_by_index(&mut self, start: i64, end: i64) -> Result<Vec<SampleRecord>> {
        let mut state = self.stream.inner.lock();
        let track = state.track(self.track)?;
        track.fill_calls += 1;

        if !track.resident.contains(&start) {
            return Ok(Vec::new());
        }
        let end = end.min(track.resident.end);
        Ok(track.records[start as usize..end as usize].to_vec())
    }

    fn fill_by_time(&mut self, start: u64, end: u64) -> Result<Vec<SampleRecord>> {
        let mut state = self.stream.inner.lock();
        let track = state.track(self.track)?;
        track.fill_calls += 1;

        let resident = &track.records[track.resident.start as usize..track.resident.end as usize];
        let covers = |r: &SampleRecord| match r.timestamp {
            Some(ts) => start >= ts && start < ts + r.duration as u64,
            None => false,
        };
        let Some(first) = resident.iter().position(covers) else {
            return Ok(Vec::new());
        };
        Ok(resident[first..]
            .iter()
            .take_while(|r| r.timestamp.map_or(false, |ts| ts < end))
            .cloned()
            .collect())
    }

    fn notify_need_more_data(&mut self, count: u32, hint_index: i64) -> Result<usize> {
        let mut state = self.stream.inner.lock();
        let max = state.max_resident;
        let track = state.track(self.track)?;
        track.need_more_calls += 1;

        // headers behind the residency window have to be parsed again
        if hint_index < track.resident.start {
            track.next = hint_index.max(0);
        }
        let target = hint_index.saturating_add(count as i64);
        let mut parsed = 0;
        let mut position = None;
        while track.next < target {
            match track.parse_next(max) {
                Some(r) => position = Some(r.stream_offset + r.size.max(0) as u64),
                None => break,
            }
            parsed += 1;
        }
        if let Some(position) = position {
            state.position = state.position.max(position);
        }
        tracing::trace!(track = self.track, hint_index, count, parsed, "parsed on demand");
        Ok(parsed)
    }

    fn materialize(&mut self, batch: Vec<SampleRecord>, write_offset: u64) -> Result<Materialized> {
        let mut state = self.stream.inner.lock();
        let max = state.max_resident;
        let track = state.track(self.track)?;

        let mut offset = write_offset;
        let mut records = Vec::with_capacity(batch.len());
        for mut record in batch {
            if record.index != track.len() {
                return Err(CacheError::AdapterContract(format!(
                    "materialized record {} onto a track of {}",
                    record.index,
                    track.len()
                )));
            }
            record.stream_offset = offset;
            offset += record.size.max(0) as u64;
            track.records.push(record.clone());
            records.push(record);
        }
        // written headers are known without parsing
        track.next = track.next.max(track.resident.end);
        while track.next < track.len() {
            if track.parse_next(max).is_none() {
                break;
            }
        }

        Ok(Materialized {
            records,
            write_offset: offset,
        })
    }
}
