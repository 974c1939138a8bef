//! # Container
//!
//! Tracks plus the backing store they share. Lookups go through the
//! flashback planner first; warps resynchronize every track at once.

use std::path::Path;

use parking_lot::Mutex;

use crate::adapter::{ContainerFormat, StreamSource, TrackAdapter};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::flashback::FlashbackPath;
use crate::mp4;
use crate::sample::{SampleKey, SampleRecord};
use crate::track::Track;

pub struct Container {
    format: Option<ContainerFormat>,
    source: Mutex<Box<dyn StreamSource>>,
    tracks: Vec<Track>,
    config: CacheConfig,
}

impl Container {
    /// Open a container file, picking the adapter by extension.
    pub fn open(path: &Path, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let format = ContainerFormat::from_path(path)?;
        let (source, adapters) = match format {
            ContainerFormat::Mp4 => mp4::open(path)?,
        };
        tracing::info!(path = %path.display(), ?format, tracks = adapters.len(), "container opened");

        let mut container = Self::from_parts(source, adapters, config);
        container.format = Some(format);
        Ok(container)
    }

    /// Build a container from an arbitrary backing store and its adapters.
    pub fn from_parts(
        source: Box<dyn StreamSource>,
        adapters: Vec<Box<dyn TrackAdapter>>,
        config: &CacheConfig,
    ) -> Self {
        let tracks = adapters
            .into_iter()
            .map(|adapter| Track::new(adapter, config))
            .collect();
        Self {
            format: None,
            source: Mutex::new(source),
            tracks,
            config: config.clone(),
        }
    }

    pub fn format(&self) -> Option<ContainerFormat> {
        self.format
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, track: usize) -> Result<&Track> {
        self.tracks.get(track).ok_or(CacheError::UnknownTrack(track))
    }

    pub fn position(&self) -> u64 {
        self.source.lock().position()
    }

    /// Resolve a sample of `track` by index or time.
    pub fn resolve(&self, track: usize, key: SampleKey) -> Result<SampleRecord> {
        let t = self.track(track)?;
        let position = self.position();

        match t.plan(key, position) {
            None | Some(FlashbackPath::Cached) | Some(FlashbackPath::Base) => t.resolve(key),
            Some(FlashbackPath::MoveForwardBeyondLast) => t.move_forward(key),
            Some(FlashbackPath::JumpToStreamPosition {
                checkpoint,
                reposition,
            }) => {
                if reposition {
                    self.source.lock().seek(checkpoint.file_position)?;
                }
                t.resolve_from(&checkpoint, key)
            }
            Some(FlashbackPath::Warp { checkpoint }) => {
                self.resynchronize(checkpoint.file_position, checkpoint.timestamp)?;
                t.resolve(key)
            }
        }
    }

    pub fn resolve_index(&self, track: usize, index: i64) -> Result<SampleRecord> {
        self.resolve(track, SampleKey::Index(index))
    }

    pub fn resolve_time(&self, track: usize, time: u64) -> Result<SampleRecord> {
        self.resolve(track, SampleKey::Time(time))
    }

    /// Parse more sample headers using the configured budget.
    pub fn request_more_container_metadata(&self) -> Result<usize> {
        self.source
            .lock()
            .request_more_container_metadata(self.config.need_more_budget)
    }

    /// Restart the backing store at `file_position` and drop every track's
    /// windows. Checkpoints and block sizes survive.
    pub fn resynchronize(&self, file_position: u64, timestamp: u64) -> Result<()> {
        tracing::debug!(file_position, timestamp, "resynchronizing container");
        self.source.lock().resynchronize(file_position, timestamp)?;
        for track in &self.tracks {
            track.invalidate();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("format", &self.format)
            .field("tracks", &self.tracks)
            .finish()
    }
}
