//! # Track
//!
//! Thread-safe front for one track's cache.
//!
//! ```text
//! ┌──────────┐  push_record   ┌─────────────────┐   resolve   ┌──────────┐
//! │ Producer │───────────────►│ Track           │◄────────────│ Consumer │
//! │ Thread   │                │  cache   (lock) │             │ Thread   │
//! └──────────┘                │  adapter (lock) │             └──────────┘
//!                             └─────────────────┘
//! ```
//!
//! The cache lock only guards window bookkeeping and is never held while the
//! adapter runs, so a slow fill on one thread never stalls the other thread's
//! bookkeeping.

use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::adapter::{TrackAdapter, TrackInfo};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::flashback::{Checkpoint, FlashbackCache, FlashbackPath};
use crate::manager::{CacheStats, Step, TrackCacheManager, WriteBatch};
use crate::sample::{SampleKey, SampleRecord};

#[derive(Debug)]
enum TrackCache {
    Plain(TrackCacheManager),
    Flashback(FlashbackCache),
}

impl TrackCache {
    fn base(&self) -> &TrackCacheManager {
        match self {
            TrackCache::Plain(manager) => manager,
            TrackCache::Flashback(cache) => cache.base(),
        }
    }

    fn base_mut(&mut self) -> &mut TrackCacheManager {
        match self {
            TrackCache::Plain(manager) => manager,
            TrackCache::Flashback(cache) => cache.base_mut(),
        }
    }

    fn absorb(&mut self) -> Result<()> {
        match self {
            TrackCache::Plain(manager) => {
                manager.drain_installed();
                Ok(())
            }
            TrackCache::Flashback(cache) => cache.absorb(),
        }
    }
}

pub struct Track {
    info: TrackInfo,
    /// `None` when caching is disabled.
    cache: Option<Mutex<TrackCache>>,
    adapter: Mutex<Box<dyn TrackAdapter>>,
    /// Write offset for the uncached write path.
    bypass_offset: Mutex<u64>,
}

impl Track {
    pub fn new(adapter: Box<dyn TrackAdapter>, config: &CacheConfig) -> Self {
        let info = adapter.info().clone();
        let cache = config.enabled.then(|| {
            let manager = TrackCacheManager::new(config);
            if config.random_access && info.append_only {
                Mutex::new(TrackCache::Flashback(FlashbackCache::new(manager)))
            } else {
                Mutex::new(TrackCache::Plain(manager))
            }
        });
        tracing::debug!(
            id = info.id,
            codec = %info.codec,
            cached = cache.is_some(),
            append_only = info.append_only,
            "track opened"
        );

        Self {
            info,
            cache,
            adapter: Mutex::new(adapter),
            bypass_offset: Mutex::new(0),
        }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Whether `key` is in a window right now.
    pub fn contains(&self, key: SampleKey) -> bool {
        self.cache
            .as_ref()
            .map_or(false, |c| c.lock().base().contains(key))
    }

    pub fn current_block_size(&self) -> Option<u32> {
        self.cache.as_ref()?.lock().base().current_block_size()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|c| c.lock().base().stats())
            .unwrap_or_default()
    }

    /// Index range of every populated window, in slot order.
    pub fn window_ranges(&self) -> Vec<RangeInclusive<i64>> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        cache
            .lock()
            .base()
            .windows()
            .iter()
            .filter_map(|w| Some(w.start_index()?..=w.end_index()?))
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        match self.cache.as_ref().map(|c| c.lock()) {
            Some(cache) => match &*cache {
                TrackCache::Flashback(f) => f.index().iter().copied().collect(),
                TrackCache::Plain(_) => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Seed a restart point known from outside the cache, such as an index
    /// box at the end of a recording.
    pub fn register_checkpoint(&self, record: &SampleRecord) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        match &mut *cache.lock() {
            TrackCache::Flashback(f) => f.register(record),
            TrackCache::Plain(_) => Ok(false),
        }
    }

    /// Resolve `key` through the cache only, without flashback.
    pub fn resolve(&self, key: SampleKey) -> Result<SampleRecord> {
        let Some(cache) = &self.cache else {
            return self.resolve_uncached(key);
        };

        let mut step = cache.lock().base_mut().begin(key)?;
        loop {
            step = match step {
                Step::Ready(handle) => return Ok(handle.record),
                Step::Fill(request) => {
                    let filled = self.adapter.lock().fill(request.range);
                    let mut cache = cache.lock();
                    match filled {
                        Ok(records) => {
                            let next = cache.base_mut().complete(request, records);
                            cache.absorb()?;
                            next?
                        }
                        Err(e) => {
                            cache.base_mut().abort(&request);
                            return Err(e);
                        }
                    }
                }
                Step::NeedMoreData(request) => {
                    self.adapter
                        .lock()
                        .notify_need_more_data(request.count, request.hint_index)?;
                    request.into_retry()
                }
            };
        }
    }

    fn resolve_uncached(&self, key: SampleKey) -> Result<SampleRecord> {
        let mut adapter = self.adapter.lock();
        for attempt in 0..2 {
            let records = match key {
                SampleKey::Index(index) if index < 0 => break,
                SampleKey::Index(index) => adapter.fill_by_index(index, index + 1)?,
                SampleKey::Time(time) => adapter.fill_by_time(time, time + 1)?,
            };
            if let Some(record) = records.into_iter().next() {
                return Ok(record);
            }
            if attempt == 0 {
                adapter.notify_need_more_data(1, key.index().unwrap_or(0))?;
            }
        }
        Err(CacheError::not_found(key))
    }

    /// How flashback would reach `key`, if this track keeps checkpoints.
    pub fn plan(&self, key: SampleKey, stream_position: u64) -> Option<FlashbackPath> {
        match &*self.cache.as_ref()?.lock() {
            TrackCache::Flashback(f) => Some(f.plan(key, stream_position)),
            TrackCache::Plain(_) => None,
        }
    }

    /// Refill from a checkpoint, then look up `key`. Fails with `NotFound`
    /// if nothing can be filled at the checkpoint.
    pub(crate) fn resolve_from(&self, checkpoint: &Checkpoint, key: SampleKey) -> Result<SampleRecord> {
        self.resolve(SampleKey::Index(checkpoint.index))
            .map_err(|e| if e.is_fatal() { e } else { CacheError::not_found(key) })?;
        self.resolve(key)
    }

    /// Walk forward one window at a time from the highest index ever cached
    /// until `key` is covered.
    pub(crate) fn move_forward(&self, key: SampleKey) -> Result<SampleRecord> {
        loop {
            let (frontier, covered) = match self.cache.as_ref().map(|c| c.lock()) {
                Some(cache) => match &*cache {
                    TrackCache::Flashback(f) => (f.frontier(), f.base().contains(key)),
                    TrackCache::Plain(_) => (None, false),
                },
                None => (None, false),
            };
            let Some(frontier) = frontier else {
                return self.resolve(key);
            };
            if covered || key.index().map_or(false, |index| index <= frontier + 1) {
                return self.resolve(key);
            }
            let reached = self
                .resolve(SampleKey::Index(frontier + 1))
                .map_err(|e| if e.is_fatal() { e } else { CacheError::not_found(key) })?;
            if let Some(time) = key.time() {
                if reached.end_time().map_or(true, |end| end > time) {
                    return self.resolve(key);
                }
            }
            let advanced = self.frontier().map_or(false, |f| f > frontier);
            if !advanced {
                return Err(CacheError::not_found(key));
            }
        }
    }

    fn frontier(&self) -> Option<i64> {
        match &*self.cache.as_ref()?.lock() {
            TrackCache::Flashback(f) => f.frontier(),
            TrackCache::Plain(_) => None,
        }
    }

    /// Drop every cached window. Checkpoints are kept.
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().base_mut().invalidate();
        }
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Append a freshly produced record.
    pub fn push_record(&self, record: SampleRecord) -> Result<()> {
        let Some(cache) = &self.cache else {
            let mut offset = self.bypass_offset.lock();
            let materialized = self.adapter.lock().materialize(vec![record], *offset)?;
            *offset = materialized.write_offset;
            return Ok(());
        };

        let batch = cache.lock().base_mut().push_record(record)?;
        match batch {
            Some(batch) => self.materialize(cache, batch),
            None => Ok(()),
        }
    }

    /// Flush whatever is pending at end of stream.
    pub fn finish_writing(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let batch = cache.lock().base_mut().finish_batch();
        match batch {
            Some(batch) => self.materialize(cache, batch),
            None => Ok(()),
        }
    }

    fn materialize(&self, cache: &Mutex<TrackCache>, batch: WriteBatch) -> Result<()> {
        let materialized = self
            .adapter
            .lock()
            .materialize(batch.records.clone(), batch.write_offset);
        let materialized = match materialized {
            Ok(materialized) => materialized,
            Err(e) => {
                cache.lock().base_mut().restore_batch(batch);
                return Err(e);
            }
        };
        let mut cache = cache.lock();
        cache.base_mut().complete_batch(batch, materialized)?;
        cache.absorb()
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("info", &self.info)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStream;
    use crate::sample::FrameKind;
    use std::sync::Arc;
    use std::thread;

    fn record(index: i64) -> SampleRecord {
        let kind = if index % 10 == 0 { FrameKind::IFrame } else { FrameKind::DFrame };
        SampleRecord::new(index, index as u64 * 1000, 1000, 200_000, kind)
            .with_timestamp(index as u64 * 200_000)
    }

    fn config() -> CacheConfig {
        CacheConfig {
            read_ahead_ms: 200,
            ..Default::default()
        }
    }

    fn live_track(config: &CacheConfig, total: i64) -> (MemoryStream, Track) {
        let stream = MemoryStream::new();
        let id = stream.add_track(TrackInfo::live(0));
        stream.append_all(id, (0..total).map(record));
        stream.parse_up_to_index(id, total);
        let track = Track::new(Box::new(stream.adapter(id)), config);
        (stream, track)
    }

    #[test]
    fn test_resolve_registers_checkpoints() {
        let (_stream, track) = live_track(&config(), 50);
        assert_eq!(track.resolve(SampleKey::Index(3)).unwrap().index, 3);
        assert_eq!(track.current_block_size(), Some(10));

        let starts: Vec<_> = track.checkpoints().iter().map(|c| c.index).collect();
        assert_eq!(starts, vec![3, 13, 23, 33]);
    }

    #[test]
    fn test_disabled_cache_goes_to_adapter() {
        let config = CacheConfig {
            enabled: false,
            ..config()
        };
        let (_stream, track) = live_track(&config, 20);
        assert!(!track.is_cached());
        assert_eq!(track.resolve(SampleKey::Index(7)).unwrap().index, 7);
        assert_eq!(track.resolve(SampleKey::Time(1_000_000)).unwrap().index, 5);
        assert!(track.resolve(SampleKey::Index(20)).unwrap_err().is_not_found());
        assert_eq!(track.current_block_size(), None);
        assert_eq!(track.stats(), CacheStats::default());
    }

    #[test]
    fn test_non_live_tracks_keep_no_checkpoints() {
        let stream = MemoryStream::new();
        let mut info = TrackInfo::live(0);
        info.append_only = false;
        let id = stream.add_track(info);
        stream.append_all(id, (0..20).map(record));
        stream.parse_up_to_index(id, 20);

        let track = Track::new(Box::new(stream.adapter(id)), &config());
        track.resolve(SampleKey::Index(0)).unwrap();
        assert!(track.checkpoints().is_empty());
        assert_eq!(track.plan(SampleKey::Index(0), 0), None);
    }

    #[test]
    fn test_move_forward_checkpoints_every_window() {
        let (_stream, track) = live_track(&config(), 100);
        track.resolve(SampleKey::Index(0)).unwrap();

        assert_eq!(track.move_forward(SampleKey::Index(72)).unwrap().index, 72);
        let starts: Vec<_> = track.checkpoints().iter().map(|c| c.index).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn test_move_forward_stops_at_end() {
        let (_stream, track) = live_track(&config(), 45);
        track.resolve(SampleKey::Index(0)).unwrap();
        let err = track.move_forward(SampleKey::Index(80)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_move_forward_reports_requested_key() {
        let (_stream, track) = live_track(&config(), 45);
        track.resolve(SampleKey::Index(0)).unwrap();
        match track.move_forward(SampleKey::Index(80)) {
            Err(CacheError::NotFound { key }) => assert_eq!(key, SampleKey::Index(80)),
            other => panic!("expected not found for 80, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_materialize_keeps_batch() {
        let stream = MemoryStream::new();
        let id = stream.add_track(TrackInfo::live(0));
        let track = Track::new(Box::new(stream.adapter(id)), &config());

        for i in 0..5 {
            track.push_record(record(i)).unwrap();
        }
        // the sink already holds index 0, so laying out the batch fails
        stream.append(id, record(0)).unwrap();
        assert!(track.finish_writing().unwrap_err().is_fatal());

        // once the sink is back in step the same batch goes through
        let sink = MemoryStream::new();
        let sink_id = sink.add_track(TrackInfo::live(0));
        *track.adapter.lock() = Box::new(sink.adapter(sink_id));
        track.finish_writing().unwrap();
        assert_eq!(sink.len(sink_id), 5);
        assert_eq!(track.resolve(SampleKey::Index(4)).unwrap().index, 4);
    }

    #[test]
    fn test_finish_writing_flushes_short_batch() {
        let stream = MemoryStream::new();
        let id = stream.add_track(TrackInfo::live(0));
        let track = Track::new(Box::new(stream.adapter(id)), &config());

        for i in 0..5 {
            track.push_record(record(i)).unwrap();
        }
        assert_eq!(stream.len(id), 0);
        track.finish_writing().unwrap();
        assert_eq!(stream.len(id), 5);
        assert_eq!(track.resolve(SampleKey::Index(4)).unwrap().index, 4);
        assert_eq!(track.checkpoints().first().map(|c| c.index), Some(0));
    }

    #[test]
    fn test_concurrent_producer_and_consumer() {
        let stream = MemoryStream::new();
        let id = stream.add_track(TrackInfo::live(0));
        let track = Arc::new(Track::new(Box::new(stream.adapter(id)), &config()));

        let producer = {
            let track = Arc::clone(&track);
            thread::spawn(move || {
                for i in 0..200 {
                    track.push_record(record(i)).unwrap();
                }
                track.finish_writing().unwrap();
            })
        };

        let consumer = {
            let track = Arc::clone(&track);
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut index = 0;
                while index < 200 {
                    match track.resolve(SampleKey::Index(index)) {
                        Ok(record) => {
                            seen.push(record.index);
                            index += 1;
                        }
                        Err(e) if e.is_not_found() => {
                            // let the producer catch up and forget the boundary
                            thread::yield_now();
                            track.invalidate();
                        }
                        Err(e) => panic!("fatal error while reading: {}", e),
                    }
                }
                seen
            })
        };

        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
        assert_eq!(stream.len(id), 200);
    }
}
