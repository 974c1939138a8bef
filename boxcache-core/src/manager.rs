//! # Track Cache Manager
//!
//! Four rotating lookahead windows per track.
//!
//! ```text
//!  resolve(key) ──► begin ──► hit? ──────────────────────► Ready
//!                     │
//!                     └─ miss ─► evict stalest ─► Fill ──► complete ─► Ready
//!                                                   ▲          │
//!                                                   └── NeedMoreData (once)
//! ```
//!
//! The manager itself never performs I/O. `begin` and `complete` return a
//! [`Step`] telling the caller what to ask the adapter for next, so a
//! `Track` can release its lock while the adapter reads from disk or network.
//! [`TrackCacheManager::resolve`] drives the same steps for callers that own
//! the adapter directly.

use serde::Serialize;

use crate::adapter::{FillRange, Materialized, TrackAdapter};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::sample::{SampleKey, SampleRecord};
use crate::window::CacheWindow;

/// Windows per track.
pub const WINDOW_COUNT: usize = 4;
/// Batch length assumed on the write path until a block size is known.
pub const PROVISIONAL_BLOCK: u32 = 8;

/// Infer how many records make up one read unit.
///
/// Audio of a kind that reports half durations in an eight record inference
/// window has its count halved before averaging. A result of exactly 8 becomes 9, and a
/// result of 0 is a broken adapter.
pub fn infer_block_size(records: &[SampleRecord], read_ahead_extent: u64) -> Result<u32> {
    let Some(first) = records.first() else {
        return Err(CacheError::InconsistentState(
            "block size inferred from an empty window".into(),
        ));
    };

    let total: u64 = records.iter().map(|r| r.duration as u64).sum();
    let mut count = records.len() as u64;
    if count == 8 {
        if let crate::sample::FrameKind::Audio(kind) = first.kind {
            if kind.halves_inference_duration() {
                count /= 2;
            }
        }
    }

    let average = total / count;
    if average == 0 {
        tracing::warn!(
            start = first.index,
            count = records.len(),
            "records carry no time progress"
        );
        return Err(CacheError::AdapterContract(format!(
            "{} records from index {} carry no time progress",
            records.len(),
            first.index
        )));
    }

    let block = read_ahead_extent / average;
    if block == 0 {
        tracing::warn!(start = first.index, average, read_ahead_extent, "records longer than a window");
        return Err(CacheError::AdapterContract(format!(
            "records from index {} average {} ticks, longer than the {} tick window",
            first.index, average, read_ahead_extent
        )));
    }
    let block = block.min(u32::MAX as u64) as u32;
    if block == 8 {
        tracing::debug!("block size 8 bumped to 9");
        return Ok(9);
    }
    Ok(block)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refills: u64,
    pub evictions: u64,
    pub need_more_data: u64,
    pub not_found: u64,
}

/// A resolved sample and where it lives in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleHandle {
    pub record: SampleRecord,
    pub window: usize,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillMode {
    ReadAhead,
    Miss,
}

/// Ask the adapter for `range` and hand the result to
/// [`TrackCacheManager::complete`].
#[derive(Debug, Clone)]
pub struct FillRequest {
    pub slot: usize,
    pub range: FillRange,
    key: SampleKey,
    mode: FillMode,
    top_up: bool,
    more_requested: bool,
    generation: u64,
}

/// Ask the adapter for more metadata, then retry the fill.
#[derive(Debug, Clone)]
pub struct MoreDataRequest {
    pub count: u32,
    pub hint_index: i64,
    retry: FillRequest,
}

impl MoreDataRequest {
    pub fn into_retry(self) -> Step {
        Step::Fill(self.retry)
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Ready(SampleHandle),
    Fill(FillRequest),
    NeedMoreData(MoreDataRequest),
}

/// A finished write batch waiting to be materialized.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub records: Vec<SampleRecord>,
    pub write_offset: u64,
}

/// First and last record of a window the moment it was filled.
#[derive(Debug, Clone)]
pub struct InstalledWindow {
    pub first: SampleRecord,
    pub end_index: i64,
    pub end_time: Option<u64>,
}

#[derive(Debug)]
pub struct TrackCacheManager {
    windows: [CacheWindow; WINDOW_COUNT],
    read_cursor: usize,
    write_cursor: usize,
    block_size: Option<u32>,
    read_ahead_extent: u64,
    inference_len: u32,
    last_request: Option<i64>,
    started: bool,
    end_index: Option<i64>,
    end_time: Option<u64>,
    refilling: Option<usize>,
    generation: u64,
    stats: CacheStats,
    track_installs: bool,
    installed: Vec<InstalledWindow>,
    pending: Vec<SampleRecord>,
    next_write_index: Option<i64>,
    write_offset: u64,
}

impl TrackCacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            windows: Default::default(),
            read_cursor: 0,
            write_cursor: 0,
            block_size: None,
            read_ahead_extent: config.read_ahead_extent(),
            inference_len: config.inference_len.max(2),
            last_request: None,
            started: false,
            end_index: None,
            end_time: None,
            refilling: None,
            generation: 0,
            stats: CacheStats::default(),
            track_installs: false,
            installed: Vec::new(),
            pending: Vec::new(),
            next_write_index: None,
            write_offset: 0,
        }
    }

    pub fn current_block_size(&self) -> Option<u32> {
        self.block_size
    }

    pub fn read_ahead_extent(&self) -> u64 {
        self.read_ahead_extent
    }

    pub fn windows(&self) -> &[CacheWindow] {
        &self.windows
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn end_of_track(&self) -> Option<i64> {
        self.end_index
    }

    /// Whether some window already holds `key`.
    pub fn contains(&self, key: SampleKey) -> bool {
        self.windows.iter().any(|w| w.contains(key))
    }

    /// Highest index currently held by any window.
    pub fn highest_cached_index(&self) -> Option<i64> {
        self.windows.iter().filter_map(|w| w.end_index()).max()
    }

    pub(crate) fn set_track_installs(&mut self, on: bool) {
        self.track_installs = on;
    }

    /// Windows filled since the last call, oldest first.
    pub(crate) fn drain_installed(&mut self) -> Vec<InstalledWindow> {
        std::mem::take(&mut self.installed)
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Start resolving `key`.
    pub fn begin(&mut self, key: SampleKey) -> Result<Step> {
        if self.past_end(key) {
            self.stats.not_found += 1;
            return Err(CacheError::not_found(key));
        }

        if !self.started {
            self.started = true;
            if self.windows.iter().all(|w| w.is_empty()) {
                self.stats.misses += 1;
                tracing::trace!(%key, "first request, reading ahead");
                return Ok(Step::Fill(self.plan_fill(0, key, key, FillMode::ReadAhead)));
            }
        }

        if let Some(handle) = self.lookup(key) {
            self.stats.hits += 1;
            return Ok(Step::Ready(handle));
        }

        self.stats.misses += 1;
        let slot = self.pick_victim();
        tracing::trace!(%key, slot, "miss");
        Ok(Step::Fill(self.plan_fill(slot, key, key, FillMode::Miss)))
    }

    /// Install the records an adapter returned for `request`.
    pub fn complete(&mut self, request: FillRequest, records: Vec<SampleRecord>) -> Result<Step> {
        if request.generation != self.generation {
            tracing::debug!(key = %request.key, "dropping fill from before invalidation");
            return self.begin(request.key);
        }
        self.refilling = None;

        check_fill(&request.range, &records)?;
        let requested = match request.range {
            FillRange::Index { start, end } => Some((end - start) as usize),
            FillRange::Time { .. } => None,
        };
        let fetched = records.len();
        let records = self.trim_overlaps(request.slot, records);

        let slot = request.slot;
        if request.top_up {
            self.windows[slot].append(records)?;
        } else {
            self.windows[slot].replace(records)?;
            if let (Some(first), Some(end_index)) = (
                self.windows[slot].records().first(),
                self.windows[slot].end_index(),
            ) {
                if self.track_installs {
                    self.installed.push(InstalledWindow {
                        first: first.clone(),
                        end_index,
                        end_time: self.windows[slot].end_time(),
                    });
                }
            }
        }
        self.check_disjoint()?;

        if self.block_size.is_none() && self.windows[slot].len() >= 2 {
            let block = infer_block_size(self.windows[slot].records(), self.read_ahead_extent)?;
            tracing::debug!(block, slot, "inferred block size");
            self.block_size = Some(block);

            if !request.top_up && requested == Some(fetched) && block as usize > fetched {
                if let Some(top_up) = self.plan_top_up(&request, block) {
                    return Ok(Step::Fill(top_up));
                }
            }
        }

        if request.mode == FillMode::ReadAhead && slot + 1 < WINDOW_COUNT {
            if let Some(end) = self.windows[slot].end_index() {
                let next = SampleKey::Index(end + 1);
                return Ok(Step::Fill(self.plan_fill(
                    slot + 1,
                    next,
                    request.key,
                    FillMode::ReadAhead,
                )));
            }
        }

        self.finish_lookup(request)
    }

    /// Forget an in-flight fill after the adapter failed.
    pub fn abort(&mut self, request: &FillRequest) {
        if self.refilling == Some(request.slot) {
            self.refilling = None;
        }
    }

    /// Resolve `key`, calling the adapter synchronously.
    pub fn resolve(&mut self, key: SampleKey, adapter: &mut dyn TrackAdapter) -> Result<SampleHandle> {
        let mut step = self.begin(key)?;
        loop {
            step = match step {
                Step::Ready(handle) => return Ok(handle),
                Step::Fill(request) => match adapter.fill(request.range) {
                    Ok(records) => self.complete(request, records)?,
                    Err(e) => {
                        self.abort(&request);
                        return Err(e);
                    }
                },
                Step::NeedMoreData(request) => {
                    adapter.notify_need_more_data(request.count, request.hint_index)?;
                    request.into_retry()
                }
            };
        }
    }

    /// Drop every window and the end-of-track boundary. Block size and
    /// statistics survive; the next request reads ahead again.
    pub fn invalidate(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
        self.generation += 1;
        self.started = false;
        self.refilling = None;
        self.read_cursor = 0;
        self.last_request = None;
        self.end_index = None;
        self.end_time = None;
    }

    fn past_end(&self, key: SampleKey) -> bool {
        match key {
            SampleKey::Index(index) => index < 0 || self.end_index.map_or(false, |end| index >= end),
            SampleKey::Time(time) => self.end_time.map_or(false, |end| time >= end),
        }
    }

    fn lookup(&mut self, key: SampleKey) -> Option<SampleHandle> {
        let slot = (0..WINDOW_COUNT)
            .map(|offset| (self.read_cursor + offset) % WINDOW_COUNT)
            .find(|&slot| self.windows[slot].contains(key))?;

        let position = self.windows[slot].position_of(key)?;
        let record = self.windows[slot].records()[position].clone();
        self.read_cursor = slot;
        self.update_relevancy(slot, record.index);

        Some(SampleHandle {
            record,
            window: slot,
            position,
        })
    }

    fn update_relevancy(&mut self, slot: usize, index: i64) {
        let sequential = self.last_request.map_or(false, |last| index == last + 1);
        self.last_request = Some(index);

        if sequential {
            let current_start = self.windows[slot].start_index();
            for (i, window) in self.windows.iter_mut().enumerate() {
                if window.is_empty() {
                    continue;
                }
                if i == slot {
                    window.bump(-1);
                } else if window.start_index() > current_start {
                    window.bump(1);
                } else {
                    window.bump(-1);
                }
            }
        } else {
            let populated = self.windows.iter().filter(|w| !w.is_empty()).count();
            for window in self.windows.iter_mut().filter(|w| !w.is_empty()) {
                window.bump(if populated == 1 { 1 } else { -1 });
            }
        }

        tracing::trace!(
            index,
            sequential,
            relevancy = ?self.windows.iter().map(|w| w.relevancy()).collect::<Vec<_>>(),
            "relevancy updated"
        );
    }

    /// Empty windows first, then lowest relevancy, then lowest start index.
    fn pick_victim(&self) -> usize {
        (0..WINDOW_COUNT)
            .filter(|&slot| Some(slot) != self.refilling)
            .min_by_key(|&slot| {
                let window = &self.windows[slot];
                (
                    !window.is_empty(),
                    window.relevancy(),
                    window.start_index().unwrap_or(i64::MIN),
                )
            })
            .unwrap_or(0)
    }

    fn plan_fill(&mut self, slot: usize, from: SampleKey, key: SampleKey, mode: FillMode) -> FillRequest {
        if !self.windows[slot].is_empty() {
            self.stats.evictions += 1;
            tracing::debug!(
                slot,
                start = ?self.windows[slot].start_index(),
                relevancy = self.windows[slot].relevancy(),
                "evicting window"
            );
        }
        self.windows[slot].clear();
        self.refilling = Some(slot);
        self.stats.refills += 1;

        let len = self.block_size.unwrap_or(self.inference_len) as i64;
        let range = match from {
            SampleKey::Index(start) => FillRange::Index {
                start,
                end: self.clip_end(slot, start, start + len),
            },
            SampleKey::Time(start) => FillRange::Time {
                start,
                end: start + self.read_ahead_extent,
            },
        };

        FillRequest {
            slot,
            range,
            key,
            mode,
            top_up: false,
            more_requested: false,
            generation: self.generation,
        }
    }

    fn plan_top_up(&mut self, request: &FillRequest, block: u32) -> Option<FillRequest> {
        let window = &self.windows[request.slot];
        let start = window.end_index()? + 1;
        let end = self.clip_end(request.slot, start, window.start_index()? + block as i64);
        if end <= start {
            return None;
        }
        self.refilling = Some(request.slot);
        Some(FillRequest {
            range: FillRange::Index { start, end },
            top_up: true,
            ..request.clone()
        })
    }

    /// Stop a fill before it runs into the next window.
    fn clip_end(&self, slot: usize, start: i64, end: i64) -> i64 {
        self.windows
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != slot)
            .filter_map(|(_, w)| w.start_index())
            .filter(|&s| s > start)
            .fold(end, i64::min)
    }

    fn trim_overlaps(&self, slot: usize, records: Vec<SampleRecord>) -> Vec<SampleRecord> {
        let held_elsewhere = |index: i64| {
            self.windows
                .iter()
                .enumerate()
                .any(|(i, w)| i != slot && w.contains_index(index))
        };
        records
            .into_iter()
            .skip_while(|r| held_elsewhere(r.index))
            .take_while(|r| !held_elsewhere(r.index))
            .collect()
    }

    fn finish_lookup(&mut self, request: FillRequest) -> Result<Step> {
        if let Some(handle) = self.lookup(request.key) {
            return Ok(Step::Ready(handle));
        }

        if !request.more_requested {
            self.stats.need_more_data += 1;
            let slot = if self.windows[request.slot].is_empty() {
                request.slot
            } else {
                self.pick_victim()
            };
            let hint_index = match request.key {
                SampleKey::Index(index) => index,
                SampleKey::Time(_) => self.highest_cached_index().map_or(0, |i| i + 1),
            };
            let mut retry = self.plan_fill(slot, request.key, request.key, FillMode::Miss);
            retry.more_requested = true;
            tracing::debug!(key = %request.key, hint_index, "need more container data");
            return Ok(Step::NeedMoreData(MoreDataRequest {
                count: self.block_size.unwrap_or(self.inference_len),
                hint_index,
                retry,
            }));
        }

        self.mark_end(request.key);
        self.stats.not_found += 1;
        Err(CacheError::not_found(request.key))
    }

    /// Remember the end of the track, unless the key falls in a hole
    /// before data that is already cached.
    fn mark_end(&mut self, key: SampleKey) {
        match key {
            SampleKey::Index(index) => {
                if self.highest_cached_index().map_or(true, |high| index > high) {
                    self.end_index = Some(self.end_index.map_or(index, |end| end.min(index)));
                    tracing::debug!(index, "end of track");
                }
            }
            SampleKey::Time(time) => {
                let highest = self.windows.iter().filter_map(|w| w.end_time()).max();
                if highest.map_or(true, |high| time > high) {
                    self.end_time = Some(self.end_time.map_or(time, |end| end.min(time)));
                    tracing::debug!(time, "end of track");
                }
            }
        }
    }

    fn check_disjoint(&self) -> Result<()> {
        for a in 0..WINDOW_COUNT {
            for b in (a + 1)..WINDOW_COUNT {
                if self.windows[a].overlaps(&self.windows[b]) {
                    return Err(CacheError::InconsistentState(format!(
                        "windows {} and {} overlap",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Add a freshly produced record to the pending batch. Returns the
    /// previous batch when this record, an independent frame arriving at or
    /// past the block boundary, starts a new one.
    pub fn push_record(&mut self, record: SampleRecord) -> Result<Option<WriteBatch>> {
        let expected = self
            .pending
            .last()
            .map(|r| r.index + 1)
            .or(self.next_write_index);
        if let Some(expected) = expected {
            if record.index != expected {
                return Err(CacheError::AdapterContract(format!(
                    "write path got record {}, expected {}",
                    record.index, expected
                )));
            }
        }
        if self.pending.is_empty() && !record.kind.is_independent() {
            return Err(CacheError::AdapterContract(format!(
                "record {} is a dependent frame and cannot start a block",
                record.index
            )));
        }

        self.next_write_index = Some(record.index + 1);
        let limit = self.block_size.unwrap_or(PROVISIONAL_BLOCK) as usize;
        if self.pending.len() >= limit && record.kind.is_independent() {
            let records = std::mem::replace(&mut self.pending, vec![record]);
            return Ok(Some(WriteBatch {
                records,
                write_offset: self.write_offset,
            }));
        }

        self.pending.push(record);
        Ok(None)
    }

    /// Take whatever is pending, for end of stream.
    pub fn finish_batch(&mut self) -> Option<WriteBatch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(WriteBatch {
            records: std::mem::take(&mut self.pending),
            write_offset: self.write_offset,
        })
    }

    /// Put a batch the adapter failed to materialize back in front of the
    /// pending records, so a later flush retries it.
    pub fn restore_batch(&mut self, batch: WriteBatch) {
        let mut records = batch.records;
        records.append(&mut self.pending);
        self.pending = records;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Install a batch after the adapter has laid it out.
    pub fn complete_batch(&mut self, batch: WriteBatch, materialized: Materialized) -> Result<()> {
        let (Some(expected), Some(first)) = (batch.records.first(), materialized.records.first())
        else {
            return Ok(());
        };
        if first.index != expected.index || materialized.records.len() != batch.records.len() {
            return Err(CacheError::AdapterContract(format!(
                "materialized {} records from {}, batch had {} from {}",
                materialized.records.len(),
                first.index,
                batch.records.len(),
                expected.index
            )));
        }
        check_progress(&materialized.records)?;
        self.write_offset = self.write_offset.max(materialized.write_offset);

        if self.block_size.is_none() && materialized.records.len() >= 2 {
            let block = infer_block_size(&materialized.records, self.read_ahead_extent)?;
            tracing::debug!(block, "inferred block size from write batch");
            self.block_size = Some(block);
        }

        let window = CacheWindow::from_records(materialized.records)?;
        if self.windows.iter().any(|w| w.overlaps(&window)) {
            tracing::trace!(start = ?window.start_index(), "batch already cached by reader");
            return Ok(());
        }

        let mut slot = self.write_cursor;
        if Some(slot) == self.refilling {
            slot = (slot + 1) % WINDOW_COUNT;
        }
        if let (Some(first), Some(end_index)) = (window.records().first(), window.end_index()) {
            if self.track_installs {
                self.installed.push(InstalledWindow {
                    first: first.clone(),
                    end_index,
                    end_time: window.end_time(),
                });
            }
            if self.end_index.map_or(false, |end| end_index >= end) {
                self.end_index = None;
            }
        }
        self.end_time = None;
        self.windows[slot] = window;
        self.write_cursor = (slot + 1) % WINDOW_COUNT;
        Ok(())
    }

    /// Push a record and materialize the batch it closes, if any.
    pub fn write(&mut self, record: SampleRecord, adapter: &mut dyn TrackAdapter) -> Result<()> {
        match self.push_record(record)? {
            Some(batch) => self.materialize_with(batch, adapter),
            None => Ok(()),
        }
    }

    /// Flush the pending batch through the adapter.
    pub fn flush(&mut self, adapter: &mut dyn TrackAdapter) -> Result<()> {
        match self.finish_batch() {
            Some(batch) => self.materialize_with(batch, adapter),
            None => Ok(()),
        }
    }

    fn materialize_with(&mut self, batch: WriteBatch, adapter: &mut dyn TrackAdapter) -> Result<()> {
        match adapter.materialize(batch.records.clone(), batch.write_offset) {
            Ok(materialized) => self.complete_batch(batch, materialized),
            Err(e) => {
                self.restore_batch(batch);
                Err(e)
            }
        }
    }
}

/// Every record must move time forward.
fn check_progress(records: &[SampleRecord]) -> Result<()> {
    match records.iter().find(|r| r.duration == 0) {
        Some(r) => Err(CacheError::AdapterContract(format!(
            "record {} has zero duration",
            r.index
        ))),
        None => Ok(()),
    }
}

/// Index fills must start where asked and stay inside the range.
fn check_fill(range: &FillRange, records: &[SampleRecord]) -> Result<()> {
    crate::window::check_contiguous(records)?;
    check_progress(records)?;
    if let (FillRange::Index { start, end }, Some(first), Some(last)) =
        (range, records.first(), records.last())
    {
        if first.index != *start || last.index >= *end {
            return Err(CacheError::AdapterContract(format!(
                "asked for [{}, {}), got [{}, {}]",
                start, end, first.index, last.index
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TrackInfo;
    use crate::memory::{MemoryStream, MemoryTrackAdapter};
    use crate::sample::{AudioKind, FrameKind};

    fn config(read_ahead_ms: u64) -> CacheConfig {
        CacheConfig {
            read_ahead_ms,
            ..Default::default()
        }
    }

    fn video(start: i64, count: i64, duration: u32) -> Vec<SampleRecord> {
        (start..start + count)
            .map(|i| {
                let kind = if i % 10 == 0 { FrameKind::IFrame } else { FrameKind::DFrame };
                SampleRecord::new(i, 1000 * i as u64, 1000, duration, kind)
                    .with_timestamp(i as u64 * duration as u64)
            })
            .collect()
    }

    /// 200_000 tick records, 2_000_000 tick windows: block size 10.
    fn stream_with(resident: i64, total: i64) -> (MemoryStream, MemoryTrackAdapter) {
        let stream = MemoryStream::new();
        let track = stream.add_track(TrackInfo::live(0));
        stream.append_all(track, video(0, total, 200_000));
        stream.parse_up_to_index(track, resident);
        let adapter = stream.adapter(track);
        (stream, adapter)
    }

    #[test]
    fn test_block_size_inference() {
        assert_eq!(infer_block_size(&video(0, 20, 200_000), 2_000_000).unwrap(), 10);
        assert_eq!(infer_block_size(&video(0, 3, 400_000), 20_000_000).unwrap(), 50);
        // naive 8 bumps to 9
        assert_eq!(infer_block_size(&video(0, 4, 250_000), 2_000_000).unwrap(), 9);
    }

    #[test]
    fn test_zero_block_is_a_contract_breach() {
        // frames longer than the window leave no room for even one
        let err = infer_block_size(&video(0, 2, 3_000_000), 2_000_000).unwrap_err();
        assert!(matches!(err, CacheError::AdapterContract(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zero_duration_record_is_rejected() {
        let mut records = video(0, 3, 200_000);
        records[1].duration = 0;
        let stream = MemoryStream::new();
        let track = stream.add_track(TrackInfo::live(0));
        stream.append_all(track, records);
        stream.parse_up_to_index(track, 3);
        let mut adapter = stream.adapter(track);

        let mut cache = TrackCacheManager::new(&config(200));
        let err = cache.resolve(SampleKey::Index(0), &mut adapter).unwrap_err();
        assert!(matches!(err, CacheError::AdapterContract(_)));
        assert!(cache.windows().iter().all(|w| w.is_empty()));
        assert_eq!(cache.current_block_size(), None);
    }

    #[test]
    fn test_half_duration_audio_inference() {
        let aac: Vec<_> = (0..8)
            .map(|i| {
                SampleRecord::new(i, 0, 10, 100_000, FrameKind::Audio(AudioKind::Aac))
                    .with_timestamp(i as u64 * 100_000)
            })
            .collect();
        // average doubles to 200_000
        assert_eq!(infer_block_size(&aac, 2_000_000).unwrap(), 10);
        assert_eq!(infer_block_size(&aac[..7], 2_000_000).unwrap(), 20);

        let mp3: Vec<_> = aac
            .iter()
            .cloned()
            .map(|mut r| {
                r.kind = FrameKind::Audio(AudioKind::Mp3);
                r
            })
            .collect();
        assert_eq!(infer_block_size(&mp3, 2_000_000).unwrap(), 20);
    }

    #[test]
    fn test_zero_progress_is_a_contract_breach() {
        let err = infer_block_size(&video(0, 5, 0), 2_000_000).unwrap_err();
        assert!(matches!(err, CacheError::AdapterContract(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_ahead_fills_windows_in_sequence() {
        let (_stream, mut adapter) = stream_with(40, 40);
        let mut cache = TrackCacheManager::new(&config(200));

        let handle = cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        assert_eq!(handle.record.index, 0);
        assert_eq!(handle.window, 0);
        assert_eq!(cache.current_block_size(), Some(10));

        let ranges: Vec<_> = cache
            .windows()
            .iter()
            .map(|w| (w.start_index(), w.end_index()))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (Some(0), Some(9)),
                (Some(10), Some(19)),
                (Some(20), Some(29)),
                (Some(30), Some(39)),
            ]
        );
        // inference window of 8, top-up of 2, then three full windows
        assert_eq!(adapter.fill_calls(), 5);
    }

    #[test]
    fn test_need_more_data_scenario() {
        let (stream, mut adapter) = stream_with(20, 100);
        let mut cache = TrackCacheManager::new(&config(200));

        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        assert_eq!(cache.current_block_size(), Some(10));
        assert_eq!(adapter.need_more_calls(), 0);

        let handle = cache.resolve(SampleKey::Index(25), &mut adapter).unwrap();
        assert_eq!(handle.record.index, 25);
        assert_eq!(adapter.need_more_calls(), 1);
        assert_eq!(cache.stats().need_more_data, 1);
        assert!(stream.resident_range(0).end > 25);
    }

    #[test]
    fn test_cache_hits_do_no_io() {
        let (_stream, mut adapter) = stream_with(40, 40);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        let calls = adapter.fill_calls();

        for index in [35, 3, 17, 22, 39, 10] {
            let handle = cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
            assert_eq!(handle.record.index, index);
            assert_eq!(cache.read_cursor(), handle.window);
        }
        assert_eq!(adapter.fill_calls(), calls);
        assert_eq!(cache.stats().hits, 6);
    }

    #[test]
    fn test_sequential_reads_refill_once_per_block() {
        let (_stream, mut adapter) = stream_with(200, 200);
        let mut cache = TrackCacheManager::new(&config(200));

        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        let after_read_ahead = cache.stats().refills;

        for index in 1..200 {
            let handle = cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
            assert_eq!(handle.record.index, index);
        }
        // 40 more indices than the read-ahead covered, 10 per block
        let refills = cache.stats().refills - after_read_ahead;
        assert_eq!(refills, 16);
    }

    #[test]
    fn test_sequential_relevancy() {
        let (_stream, mut adapter) = stream_with(40, 40);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(10), &mut adapter).unwrap();
        // read ahead from 10 fills 10..19, 20..29, 30..39, then nothing
        let before: Vec<_> = cache.windows().iter().map(|w| w.relevancy()).collect();

        cache.resolve(SampleKey::Index(11), &mut adapter).unwrap();
        let after: Vec<_> = cache.windows().iter().map(|w| w.relevancy()).collect();

        assert_eq!(after[0], before[0] - 1);
        assert_eq!(after[1], before[1] + 1);
        assert_eq!(after[2], before[2] + 1);
        assert_eq!(after[3], before[3]);
    }

    #[test]
    fn test_random_relevancy_single_window_gains() {
        let (_stream, mut adapter) = stream_with(10, 10);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        assert_eq!(cache.windows().iter().filter(|w| !w.is_empty()).count(), 1);
        let before = cache.windows()[0].relevancy();

        cache.resolve(SampleKey::Index(7), &mut adapter).unwrap();
        assert_eq!(cache.windows()[0].relevancy(), before + 1);
    }

    #[test]
    fn test_random_access_fairness() {
        let (_stream, mut adapter) = stream_with(40, 40);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();

        let mut seed: u64 = 0x2545F4914F6CDD1D;
        for _ in 0..5_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let index = ((seed >> 33) % 40) as i64;
            cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
        }

        let scores: Vec<_> = cache.windows().iter().map(|w| w.relevancy()).collect();
        let spread = scores.iter().max().unwrap() - scores.iter().min().unwrap();
        // only accidental i, i+1 pairs move windows apart
        assert!(spread < 400, "relevancy drifted: {:?}", scores);
        assert_eq!(cache.stats().refills, 4);
    }

    #[test]
    fn test_eviction_picks_stalest_window() {
        let (_stream, mut adapter) = stream_with(100, 100);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();

        // read 30..39 forward: window 3 stays hot, earlier windows cool down
        for index in 30..40 {
            cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
        }
        let stalest = (0..WINDOW_COUNT)
            .min_by_key(|&i| (cache.windows()[i].relevancy(), cache.windows()[i].start_index()))
            .unwrap();

        let handle = cache.resolve(SampleKey::Index(70), &mut adapter).unwrap();
        assert_eq!(handle.window, stalest);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.windows()[stalest].start_index(), Some(70));
        assert_eq!(cache.windows()[stalest].end_index(), Some(79));
    }

    #[test]
    fn test_refill_does_not_overlap_next_window() {
        let (_stream, mut adapter) = stream_with(100, 100);
        let mut cache = TrackCacheManager::new(&config(200));
        for index in 0..30 {
            cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
        }
        // 0..9 is stalest and makes room for 60..69
        let handle = cache.resolve(SampleKey::Index(60), &mut adapter).unwrap();
        assert_eq!(handle.window, 0);

        // 10..19 goes next; the refill stops where 60..69 begins
        let handle = cache.resolve(SampleKey::Index(55), &mut adapter).unwrap();
        assert_eq!(handle.window, 1);
        let window = &cache.windows()[1];
        assert_eq!(window.start_index(), Some(55));
        assert_eq!(window.end_index(), Some(59));
    }

    #[test]
    fn test_end_of_track_sentinel() {
        let (_stream, mut adapter) = stream_with(30, 30);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();

        let err = cache.resolve(SampleKey::Index(30), &mut adapter).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cache.end_of_track(), Some(30));

        let fills = adapter.fill_calls();
        let more = adapter.need_more_calls();
        for index in [30, 31, 500] {
            assert!(cache.resolve(SampleKey::Index(index), &mut adapter).unwrap_err().is_not_found());
        }
        assert_eq!(adapter.fill_calls(), fills);
        assert_eq!(adapter.need_more_calls(), more);

        // earlier samples still resolve
        assert_eq!(cache.resolve(SampleKey::Index(29), &mut adapter).unwrap().record.index, 29);

        cache.invalidate();
        assert_eq!(cache.end_of_track(), None);
    }

    #[test]
    fn test_negative_index_is_not_found() {
        let (_stream, mut adapter) = stream_with(10, 10);
        let mut cache = TrackCacheManager::new(&config(200));
        assert!(cache.resolve(SampleKey::Index(-1), &mut adapter).unwrap_err().is_not_found());
        assert_eq!(adapter.fill_calls(), 0);
        assert_eq!(cache.end_of_track(), None);
    }

    #[test]
    fn test_resolve_by_time() {
        let (_stream, mut adapter) = stream_with(100, 100);
        let mut cache = TrackCacheManager::new(&config(200));

        let handle = cache.resolve(SampleKey::Time(4_150_000), &mut adapter).unwrap();
        assert_eq!(handle.record.index, 20);
        assert_eq!(cache.current_block_size(), Some(10));

        let handle = cache.resolve(SampleKey::Time(15_000_000), &mut adapter).unwrap();
        assert_eq!(handle.record.index, 75);
    }

    #[test]
    fn test_block_size_is_stable() {
        let (_stream, mut adapter) = stream_with(100, 100);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        let block = cache.current_block_size();
        for index in [90, 5, 60, 33, 99] {
            cache.resolve(SampleKey::Index(index), &mut adapter).unwrap();
            assert_eq!(cache.current_block_size(), block);
        }
    }

    #[test]
    fn test_invalidation_drops_stale_fill() {
        let (_stream, mut adapter) = stream_with(40, 40);
        let mut cache = TrackCacheManager::new(&config(200));
        cache.resolve(SampleKey::Index(0), &mut adapter).unwrap();
        cache.invalidate();
        assert!(!cache.contains(SampleKey::Index(0)));

        let Step::Fill(request) = cache.begin(SampleKey::Index(5)).unwrap() else {
            panic!("expected a fill after invalidation");
        };
        let records = adapter.fill(request.range).unwrap();
        cache.invalidate();

        // the late records are dropped and the lookup starts over
        let step = cache.complete(request, records).unwrap();
        assert!(matches!(step, Step::Fill(_)));
        assert!(cache.windows().iter().all(|w| w.is_empty()));
        assert_eq!(cache.current_block_size(), Some(10));
    }

    #[test]
    fn test_write_path_batches_on_keyframes() {
        let stream = MemoryStream::new();
        let track = stream.add_track(TrackInfo::live(0));
        let mut adapter = stream.adapter(track);
        let mut cache = TrackCacheManager::new(&config(200));

        // keyframe every 10, block hypothesized at 8
        for record in video(0, 25, 200_000) {
            cache.write(record, &mut adapter).unwrap();
        }
        // first batch ran past the boundary up to the keyframe at 10
        let first = &cache.windows()[0];
        assert_eq!(first.start_index(), Some(0));
        assert_eq!(first.end_index(), Some(9));
        assert_eq!(cache.current_block_size(), Some(10));

        let second = &cache.windows()[1];
        assert_eq!(second.start_index(), Some(10));
        assert_eq!(second.end_index(), Some(19));
        assert_eq!(cache.pending_len(), 5);

        cache.flush(&mut adapter).unwrap();
        assert_eq!(cache.windows()[2].start_index(), Some(20));
        assert_eq!(cache.windows()[2].end_index(), Some(24));
        assert_eq!(cache.pending_len(), 0);

        // materialized offsets are contiguous in the stream
        let offsets: Vec<_> = cache.windows()[..3]
            .iter()
            .flat_map(|w| w.records().iter().map(|r| r.stream_offset))
            .collect();
        assert!(offsets.windows(2).all(|p| p[1] == p[0] + 1000));
    }

    #[test]
    fn test_write_path_all_independent() {
        let stream = MemoryStream::new();
        let track = stream.add_track(TrackInfo::live(0));
        let mut adapter = stream.adapter(track);
        let mut cache = TrackCacheManager::new(&config(200));

        let audio: Vec<_> = (0..17)
            .map(|i| {
                SampleRecord::new(i, 0, 100, 250_000, FrameKind::Audio(AudioKind::Mp3))
                    .with_timestamp(i as u64 * 250_000)
            })
            .collect();
        for record in audio {
            cache.write(record, &mut adapter).unwrap();
        }
        // 8 records at 250_000 give a naive block of 8, stored as 9
        assert_eq!(cache.windows()[0].len(), 8);
        assert_eq!(cache.current_block_size(), Some(9));
        assert_eq!(cache.pending_len(), 9);
    }

    #[test]
    fn test_write_batch_cannot_start_on_dependent_frame() {
        let mut cache = TrackCacheManager::new(&config(200));
        let record = SampleRecord::new(0, 0, 10, 1000, FrameKind::BFrame);
        assert!(matches!(
            cache.push_record(record),
            Err(CacheError::AdapterContract(_))
        ));
    }

    #[test]
    fn test_write_path_rejects_gaps() {
        let mut cache = TrackCacheManager::new(&config(200));
        cache
            .push_record(SampleRecord::new(0, 0, 10, 1000, FrameKind::IFrame))
            .unwrap();
        let err = cache
            .push_record(SampleRecord::new(2, 0, 10, 1000, FrameKind::DFrame))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_only_adapter_refuses_batches() {
        struct Fixed(TrackInfo);
        impl TrackAdapter for Fixed {
            fn info(&self) -> &TrackInfo {
                &self.0
            }
            fn fill_by_index(&mut self, _: i64, _: i64) -> Result<Vec<SampleRecord>> {
                Ok(Vec::new())
            }
            fn fill_by_time(&mut self, _: u64, _: u64) -> Result<Vec<SampleRecord>> {
                Ok(Vec::new())
            }
            fn notify_need_more_data(&mut self, _: u32, _: i64) -> Result<usize> {
                Ok(0)
            }
        }

        let mut adapter = Fixed(TrackInfo::live(0));
        let mut cache = TrackCacheManager::new(&config(200));
        for record in video(0, 8, 200_000) {
            cache.write(record, &mut adapter).unwrap();
        }
        let err = cache
            .write(video(10, 1, 200_000).remove(0), &mut adapter)
            .unwrap_err();
        assert!(matches!(err, CacheError::AdapterContract(_)));

        assert!(matches!(cache.flush(&mut adapter), Err(CacheError::ReadOnly)));
    }
}
