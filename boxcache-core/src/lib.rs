//! # Boxcache Core
//!
//! Adaptive sample-lookup cache for media containers. Container adapters
//! parse sample headers; the cache keeps a few windows of them close to the
//! reader and sizes those windows from the stream's own frame rate.

// ============================================================================
// Sample Model
// ============================================================================
pub mod error;
pub mod sample;
pub mod config;

// ============================================================================
// Cache Engine
// ============================================================================
pub mod window;
pub mod manager;
pub mod flashback;
pub mod track;
pub mod container;

// ============================================================================
// Adapters
// ============================================================================
pub mod adapter;
pub mod memory;
pub mod mp4;

pub use adapter::{ContainerFormat, FillRange, StreamSource, TrackAdapter, TrackInfo, TrackKind};
pub use config::CacheConfig;
pub use container::Container;
pub use error::{CacheError, Result};
pub use flashback::{Checkpoint, FlashbackCache, FlashbackIndex, FlashbackPath};
pub use manager::{CacheStats, Step, TrackCacheManager};
pub use memory::MemoryStream;
pub use sample::{AudioKind, FrameKind, SampleKey, SampleRecord};
pub use track::Track;
pub use window::CacheWindow;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
