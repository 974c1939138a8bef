//! # Boxcache CLI
//!
//! Opens a container file and resolves samples through the track caches.
//!
//! ```text
//! boxcache movie.mp4 --index 0 --index 120 --time-ms 4000
//! boxcache movie.mp4 --track 1 --json
//! ```

use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use boxcache_core::{CacheConfig, CacheStats, Checkpoint, Container, SampleKey, SampleRecord, TrackInfo};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Default)]
struct CliOptions {
    path: PathBuf,
    keys: Vec<SampleKey>,
    track: Option<usize>,
    config: Option<PathBuf>,
    json: bool,
}

impl CliOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut path = None;
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--index" => {
                    let value = iter.next().context("--index needs a sample number")?;
                    let index: i64 = value
                        .parse()
                        .with_context(|| format!("bad sample index '{value}'"))?;
                    options.keys.push(SampleKey::Index(index));
                }
                "--time-ms" => {
                    let value = iter.next().context("--time-ms needs milliseconds")?;
                    let ms: u64 = value
                        .parse()
                        .with_context(|| format!("bad time '{value}'"))?;
                    options.keys.push(SampleKey::Time(ms * 10_000));
                }
                "--track" => {
                    let value = iter.next().context("--track needs a track number")?;
                    options.track = Some(
                        value
                            .parse()
                            .with_context(|| format!("bad track '{value}'"))?,
                    );
                }
                "--config" => {
                    let value = iter.next().context("--config needs a file")?;
                    options.config = Some(PathBuf::from(value));
                }
                "--json" => options.json = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => bail!("unknown option {flag}"),
                file => {
                    if path.replace(PathBuf::from(file)).is_some() {
                        bail!("only one container file may be given");
                    }
                }
            }
        }

        options.path = match path {
            Some(path) => path,
            None => {
                print_usage();
                bail!("no container file given");
            }
        };
        if options.keys.is_empty() {
            options.keys.push(SampleKey::Index(0));
        }
        Ok(options)
    }
}

fn print_usage() {
    eprintln!(
        "usage: boxcache <file> [--index N]... [--time-ms T]... [--track K] [--config F] [--json]"
    );
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Serialize)]
struct Lookup {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<SampleRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TrackReport {
    track: usize,
    info: TrackInfo,
    lookups: Vec<Lookup>,
    block_size: Option<u32>,
    windows: Vec<RangeInclusive<i64>>,
    stats: CacheStats,
    checkpoints: Vec<Checkpoint>,
}

fn report_track(container: &Container, track: usize, keys: &[SampleKey]) -> Result<TrackReport> {
    let lookups = keys
        .iter()
        .map(|&key| match container.resolve(track, key) {
            Ok(record) => Ok(Lookup {
                key: key.to_string(),
                record: Some(record),
                error: None,
            }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Lookup {
                key: key.to_string(),
                record: None,
                error: Some(e.to_string()),
            }),
        })
        .collect::<boxcache_core::Result<Vec<_>>>()
        .with_context(|| format!("track {track}"))?;

    let t = container.track(track)?;
    Ok(TrackReport {
        track,
        info: t.info().clone(),
        lookups,
        block_size: t.current_block_size(),
        windows: t.window_ranges(),
        stats: t.stats(),
        checkpoints: t.checkpoints(),
    })
}

fn print_text(report: &TrackReport) {
    let info = &report.info;
    println!(
        "track {} id={} {:?} codec={} timescale={} samples={}",
        report.track,
        info.id,
        info.kind,
        info.codec,
        info.timescale,
        info.sample_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".into()),
    );
    for lookup in &report.lookups {
        match (&lookup.record, &lookup.error) {
            (Some(r), _) => println!(
                "  {:>12} -> #{} offset={} size={} dur={} ts={:?} {:?}",
                lookup.key, r.index, r.stream_offset, r.size, r.duration, r.timestamp, r.kind
            ),
            (None, Some(e)) => println!("  {:>12} -> {}", lookup.key, e),
            (None, None) => {}
        }
    }
    let s = &report.stats;
    println!(
        "  block={:?} hits={} misses={} refills={} evictions={} need_more={}",
        report.block_size, s.hits, s.misses, s.refills, s.evictions, s.need_more_data
    );
    if !report.windows.is_empty() {
        println!("  windows={:?}", report.windows);
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "boxcache=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = CliOptions::from_args(&args)?;

    let config = match &options.config {
        Some(path) => CacheConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    tracing::info!("boxcache v{}", boxcache_core::VERSION);

    let container = Container::open(&options.path, &config)
        .with_context(|| format!("opening {}", options.path.display()))?;

    let tracks: Vec<usize> = match options.track {
        Some(track) => {
            container.track(track)?;
            vec![track]
        }
        None => (0..container.tracks().len()).collect(),
    };

    let reports = tracks
        .into_iter()
        .map(|track| report_track(&container, track, &options.keys))
        .collect::<Result<Vec<_>>>()?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_text(report);
        }
    }
    Ok(())
}
