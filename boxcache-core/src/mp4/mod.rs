//! MP4 / MOV sample-table adapter.
//!
//! Only the `moov` box is read. Sample records are computed from the sample
//! tables on demand for each fill, so the cache never holds more of the index
//! than its four windows.

pub mod parser;
pub mod sample_table;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::adapter::{StreamSource, TrackAdapter, TrackInfo, TrackKind};
use crate::error::{CacheError, Result};
use crate::sample::{scale_to_ticks, AudioKind, FrameKind, SampleRecord, TICKS_PER_SECOND};

use parser::{find_box, fourcc, next_box, read_box_header, BodyReader};
use sample_table::SampleTable;

#[derive(Debug, Clone)]
pub struct Mp4Track {
    pub info: TrackInfo,
    pub table: SampleTable,
}

#[derive(Debug)]
pub struct Mp4File {
    pub file_len: u64,
    pub tracks: Vec<Mp4Track>,
}

impl Mp4File {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut pos = 0u64;
        while pos < file_len {
            let header = read_box_header(&mut reader)?;
            let remaining = file_len - pos;
            // size 0 runs to the end of the file
            let size = if header.size == 0 { remaining } else { header.size };
            if size > remaining || size < header.header_size {
                return Err(CacheError::Malformed(format!(
                    "'{}' box at {} claims {} bytes, {} left in file",
                    fourcc(&header.box_type),
                    pos,
                    size,
                    remaining
                )));
            }
            let body_len = size - header.header_size;

            if &header.box_type == b"moov" {
                let len = usize::try_from(body_len)
                    .map_err(|_| CacheError::Malformed("moov larger than memory".into()))?;
                let mut body = vec![0u8; len];
                reader.read_exact(&mut body)?;
                let tracks = parse_moov(&body)?;
                tracing::debug!(path = %path.display(), tracks = tracks.len(), "parsed moov");
                return Ok(Self { file_len, tracks });
            }
            let skip = i64::try_from(body_len)
                .map_err(|_| CacheError::Malformed("box too large to skip".into()))?;
            reader.seek(SeekFrom::Current(skip))?;
            pos = pos
                .checked_add(size)
                .ok_or_else(|| CacheError::Malformed("box offsets overflow".into()))?;
        }

        Err(CacheError::Malformed("no moov box".into()))
    }
}

fn parse_moov(mut moov: &[u8]) -> Result<Vec<Mp4Track>> {
    let mut tracks = Vec::new();
    while let Some((box_type, body)) = next_box(&mut moov)? {
        if &box_type == b"trak" {
            if let Some(track) = parse_trak(body, tracks.len() as u32)? {
                tracks.push(track);
            }
        }
    }
    Ok(tracks)
}

fn parse_trak(trak: &[u8], fallback_id: u32) -> Result<Option<Mp4Track>> {
    let id = match find_box(trak, b"tkhd")? {
        Some(tkhd) => {
            let mut r = BodyReader::new(tkhd, "tkhd");
            let version = r.full_box()?;
            r.skip(if version == 1 { 16 } else { 8 })?;
            r.u32()?
        }
        None => fallback_id,
    };

    let Some(mdia) = find_box(trak, b"mdia")? else {
        return Ok(None);
    };

    let timescale = match find_box(mdia, b"mdhd")? {
        Some(mdhd) => {
            let mut r = BodyReader::new(mdhd, "mdhd");
            let version = r.full_box()?;
            r.skip(if version == 1 { 16 } else { 8 })?;
            r.u32()?
        }
        None => return Err(CacheError::Malformed(format!("track {} has no mdhd", id))),
    };

    let kind = match find_box(mdia, b"hdlr")? {
        Some(hdlr) => {
            let mut r = BodyReader::new(hdlr, "hdlr");
            r.full_box()?;
            r.skip(4)?; // pre_defined
            match &r.fourcc()? {
                b"vide" => TrackKind::Video,
                b"soun" => TrackKind::Audio,
                _ => TrackKind::Other,
            }
        }
        None => TrackKind::Other,
    };

    let stbl = match find_box(mdia, b"minf")? {
        Some(minf) => find_box(minf, b"stbl")?,
        None => None,
    };
    let Some(mut stbl) = stbl else {
        return Ok(None);
    };

    let mut table = SampleTable::default();
    let mut codec = String::from("unknown");
    while let Some((box_type, body)) = next_box(&mut stbl)? {
        match &box_type {
            b"stsd" => {
                let mut entries = body.get(8..).unwrap_or_default();
                if let Some((entry, _)) = next_box(&mut entries)? {
                    codec = fourcc(&entry);
                }
            }
            b"stts" => table.parse_stts(body)?,
            b"stsc" => table.parse_stsc(body)?,
            b"stsz" => table.parse_stsz(body)?,
            b"stco" => table.parse_stco(body)?,
            b"co64" => table.parse_co64(body)?,
            b"stss" => table.parse_stss(body)?,
            b"ctts" => table.parse_ctts(body)?,
            _ => {}
        }
    }

    Ok(Some(Mp4Track {
        info: TrackInfo {
            id,
            kind,
            codec,
            timescale,
            sample_count: Some(table.sample_count() as u64),
            append_only: false,
        },
        table,
    }))
}

fn audio_kind(codec: &str) -> AudioKind {
    match codec {
        "mp4a" => AudioKind::Aac,
        ".mp3" => AudioKind::Mp3,
        "ac-3" | "ec-3" => AudioKind::Ac3,
        "lpcm" | "sowt" | "twos" | "ipcm" => AudioKind::Pcm,
        _ => AudioKind::Other,
    }
}

/// `TrackAdapter` over one parsed MP4 track.
#[derive(Debug, Clone)]
pub struct Mp4Adapter {
    info: TrackInfo,
    table: SampleTable,
}

impl Mp4Adapter {
    pub fn new(track: Mp4Track) -> Self {
        Self {
            info: track.info,
            table: track.table,
        }
    }

    fn ticks(&self, value: u64) -> u64 {
        scale_to_ticks(value, self.info.timescale)
    }

    /// Ticks back to track units, rounding down.
    fn track_units(&self, ticks: u64) -> u64 {
        ((ticks as u128 * self.info.timescale as u128) / TICKS_PER_SECOND as u128) as u64
    }

    fn frame_kind(&self, keyframe: bool) -> FrameKind {
        match self.info.kind {
            TrackKind::Video if keyframe => FrameKind::IFrame,
            TrackKind::Video => FrameKind::DFrame,
            TrackKind::Audio => FrameKind::Audio(audio_kind(&self.info.codec)),
            TrackKind::Other => FrameKind::Unknown,
        }
    }
}

impl TrackAdapter for Mp4Adapter {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn fill_by_index(&mut self, start: i64, end: i64) -> Result<Vec<SampleRecord>> {
        if start < 0 || end <= start {
            return Ok(Vec::new());
        }
        let entries = self.table.entries(start as usize, end as usize)?;
        Ok(entries
            .into_iter()
            .zip(start..)
            .map(|(entry, index)| {
                let start_ticks = self.ticks(entry.decode_time);
                let duration = self.ticks(entry.decode_time + entry.duration as u64) - start_ticks;
                SampleRecord::new(
                    index,
                    entry.offset,
                    entry.size as i32,
                    duration.min(u32::MAX as u64) as u32,
                    self.frame_kind(entry.keyframe),
                )
                .with_timestamp(start_ticks)
                .with_composition_offset(self.ticks(entry.composition_offset.max(0) as u64))
            })
            .collect())
    }

    fn fill_by_time(&mut self, start: u64, end: u64) -> Result<Vec<SampleRecord>> {
        let Some(first) = self.table.sample_for_time(self.track_units(start)) else {
            return Ok(Vec::new());
        };
        let last = self.table.first_sample_from(self.track_units(end)).max(first + 1);
        self.fill_by_index(first as i64, last as i64)
    }

    fn notify_need_more_data(&mut self, _count: u32, _hint_index: i64) -> Result<usize> {
        // the whole moov is parsed up front
        Ok(0)
    }
}

/// A finished MP4 file never grows.
#[derive(Debug, Clone)]
pub struct Mp4Source {
    file_len: u64,
    position: u64,
}

impl StreamSource for Mp4Source {
    fn position(&self) -> u64 {
        self.position
    }

    fn request_more_container_metadata(&mut self, _budget: i32) -> Result<usize> {
        Ok(0)
    }

    fn resynchronize(&mut self, file_position: u64, _timestamp: u64) -> Result<()> {
        self.seek(file_position)
    }

    fn seek(&mut self, file_position: u64) -> Result<()> {
        if file_position > self.file_len {
            return Err(CacheError::Malformed(format!(
                "seek to {} past end of {} byte file",
                file_position, self.file_len
            )));
        }
        self.position = file_position;
        Ok(())
    }
}

/// Open `path` and split it into a stream source plus one adapter per track.
pub fn open(path: &Path) -> Result<(Box<dyn StreamSource>, Vec<Box<dyn TrackAdapter>>)> {
    let file = Mp4File::open(path)?;
    let source = Mp4Source {
        file_len: file.file_len,
        position: 0,
    };
    let adapters = file
        .tracks
        .into_iter()
        .map(|t| Box::new(Mp4Adapter::new(t)) as Box<dyn TrackAdapter>)
        .collect();
    Ok((Box::new(source), adapters))
}
