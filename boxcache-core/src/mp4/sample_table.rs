//! MP4 sample tables and the arithmetic that locates a sample from them.
//!
//! Sample numbers here are zero-based; the one-based numbers stored in `stss`
//! and `stsc` are translated on the way in and out.

use crate::error::{CacheError, Result};

use super::parser::BodyReader;

/// Upper bound on a constant-size `stsz`, whose count has no entries behind it.
pub const MAX_FIXED_SIZE_SAMPLES: usize = 1 << 24;

#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    pub sample_sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    pub sample_to_chunk: Vec<(u32, u32, u32)>, // first_chunk, samples_per_chunk, sample_desc_index
    pub time_to_sample: Vec<(u32, u32)>,       // sample_count, sample_delta
    pub keyframes: Vec<u32>,                   // one-based sample numbers
    pub composition_offsets: Vec<(u32, i32)>,  // sample_count, offset
}

/// One sample as the tables describe it, in track timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    pub offset: u64,
    pub size: u32,
    pub decode_time: u64,
    pub duration: u32,
    pub composition_offset: i32,
    pub keyframe: bool,
}

impl SampleTable {
    pub fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    pub fn parse_stts(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "stts");
        r.full_box()?;
        for _ in 0..r.count(8)? {
            self.time_to_sample.push((r.u32()?, r.u32()?));
        }
        Ok(())
    }

    pub fn parse_stsc(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "stsc");
        r.full_box()?;
        for _ in 0..r.count(12)? {
            let entry = (r.u32()?, r.u32()?, r.u32()?);
            if entry.0 == 0 {
                return Err(CacheError::Malformed("stsc chunk numbers start at 1".into()));
            }
            self.sample_to_chunk.push(entry);
        }
        Ok(())
    }

    pub fn parse_stsz(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "stsz");
        r.full_box()?;
        let sample_size = r.u32()?;
        if sample_size == 0 {
            for _ in 0..r.count(4)? {
                self.sample_sizes.push(r.u32()?);
            }
        } else {
            let count = r.u32()? as usize;
            let timed: u64 = self.time_to_sample.iter().map(|&(n, _)| n as u64).sum();
            if count > MAX_FIXED_SIZE_SAMPLES
                || (!self.time_to_sample.is_empty() && timed != count as u64)
            {
                return Err(CacheError::Malformed(format!(
                    "stsz lists {} samples of {} bytes, stts times {}",
                    count, sample_size, timed
                )));
            }
            self.sample_sizes = vec![sample_size; count];
        }
        Ok(())
    }

    pub fn parse_stco(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "stco");
        r.full_box()?;
        for _ in 0..r.count(4)? {
            self.chunk_offsets.push(r.u32()? as u64);
        }
        Ok(())
    }

    pub fn parse_co64(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "co64");
        r.full_box()?;
        for _ in 0..r.count(8)? {
            self.chunk_offsets.push(r.u64()?);
        }
        Ok(())
    }

    pub fn parse_stss(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "stss");
        r.full_box()?;
        for _ in 0..r.count(4)? {
            self.keyframes.push(r.u32()?);
        }
        self.keyframes.sort_unstable();
        Ok(())
    }

    pub fn parse_ctts(&mut self, body: &[u8]) -> Result<()> {
        let mut r = BodyReader::new(body, "ctts");
        // version 1 offsets are signed, version 0 are unsigned but in practice
        // written the same way
        r.full_box()?;
        for _ in 0..r.count(8)? {
            self.composition_offsets.push((r.u32()?, r.i32()?));
        }
        Ok(())
    }

    pub fn is_keyframe(&self, sample: usize) -> bool {
        // no stss means every sample is a sync sample
        self.keyframes.is_empty() || self.keyframes.binary_search(&(sample as u32 + 1)).is_ok()
    }

    /// Sample whose decode interval contains `time`.
    pub fn sample_for_time(&self, time: u64) -> Option<usize> {
        let mut start = 0u64;
        let mut sample = 0usize;
        for &(count, delta) in &self.time_to_sample {
            let span = count as u64 * delta as u64;
            if time < start + span {
                let within = if delta == 0 { 0 } else { (time - start) / delta as u64 };
                return Some(sample + within as usize).filter(|&s| s < self.sample_count());
            }
            start += span;
            sample += count as usize;
        }
        None
    }

    /// First sample that starts at or after `time`.
    pub fn first_sample_from(&self, time: u64) -> usize {
        let mut start = 0u64;
        let mut sample = 0usize;
        for &(count, delta) in &self.time_to_sample {
            let span = count as u64 * delta as u64;
            if time <= start + span && delta > 0 {
                let within = (time - start).div_ceil(delta as u64);
                return (sample + within as usize).min(self.sample_count());
            }
            start += span;
            sample += count as usize;
        }
        self.sample_count()
    }

    /// Entries for samples `start..end`, computed in one sweep over the tables.
    pub fn entries(&self, start: usize, end: usize) -> Result<Vec<SampleEntry>> {
        let end = end.min(self.sample_count());
        if start >= end {
            return Ok(Vec::new());
        }

        let mut times = TimeCursor::new(&self.time_to_sample, start)?;
        let mut ctts = CompositionCursor::new(&self.composition_offsets, start);
        let mut chunks = ChunkCursor::new(self, start)?;

        let mut out = Vec::with_capacity(end - start);
        for sample in start..end {
            let size = self.sample_sizes[sample];
            let offset = chunks.offset;
            let (decode_time, duration) = times.next()?;
            out.push(SampleEntry {
                offset,
                size,
                decode_time,
                duration,
                composition_offset: ctts.next(),
                keyframe: self.is_keyframe(sample),
            });
            chunks.advance(self, size)?;
        }
        Ok(out)
    }
}

struct TimeCursor<'a> {
    runs: &'a [(u32, u32)],
    run: usize,
    left: u32,
    time: u64,
}

impl<'a> TimeCursor<'a> {
    fn new(runs: &'a [(u32, u32)], start: usize) -> Result<Self> {
        let mut cursor = Self { runs, run: 0, left: runs.first().map_or(0, |r| r.0), time: 0 };
        let mut skip = start as u64;
        while skip > 0 {
            let (_, delta) = cursor.current()?;
            let step = skip.min(cursor.left as u64);
            cursor.time += step * delta as u64;
            cursor.left -= step as u32;
            skip -= step;
            cursor.roll();
        }
        Ok(cursor)
    }

    fn roll(&mut self) {
        while self.left == 0 && self.run < self.runs.len() {
            self.run += 1;
            self.left = self.runs.get(self.run).map_or(0, |r| r.0);
        }
    }

    fn current(&mut self) -> Result<(u32, u32)> {
        self.roll();
        self.runs
            .get(self.run)
            .copied()
            .ok_or_else(|| CacheError::Malformed("stts covers fewer samples than stsz".into()))
    }

    fn next(&mut self) -> Result<(u64, u32)> {
        let (_, delta) = self.current()?;
        let time = self.time;
        self.time += delta as u64;
        self.left -= 1;
        Ok((time, delta))
    }
}

struct CompositionCursor<'a> {
    runs: &'a [(u32, i32)],
    run: usize,
    left: u32,
}

impl<'a> CompositionCursor<'a> {
    fn new(runs: &'a [(u32, i32)], start: usize) -> Self {
        let mut cursor = Self { runs, run: 0, left: runs.first().map_or(0, |r| r.0) };
        for _ in 0..start {
            cursor.next();
        }
        cursor
    }

    fn next(&mut self) -> i32 {
        while self.left == 0 && self.run < self.runs.len() {
            self.run += 1;
            self.left = self.runs.get(self.run).map_or(0, |r| r.0);
        }
        match self.runs.get(self.run) {
            Some(&(_, offset)) => {
                self.left -= 1;
                offset
            }
            None => 0,
        }
    }
}

struct ChunkCursor {
    /// Index into `sample_to_chunk`.
    run: usize,
    /// Zero-based chunk.
    chunk: usize,
    in_chunk: u32,
    offset: u64,
}

impl ChunkCursor {
    fn new(table: &SampleTable, start: usize) -> Result<Self> {
        let stsc = &table.sample_to_chunk;
        let chunk_count = table.chunk_offsets.len();
        let mut first_sample = 0usize;

        for (run, &(first_chunk, per_chunk, _)) in stsc.iter().enumerate() {
            let first = first_chunk as usize - 1;
            let next_first = stsc
                .get(run + 1)
                .map_or(chunk_count, |next| next.0 as usize - 1);
            let chunks = next_first.saturating_sub(first);
            let per_chunk = per_chunk as usize;
            let samples = chunks * per_chunk;

            if per_chunk > 0 && start < first_sample + samples {
                let chunk = first + (start - first_sample) / per_chunk;
                let in_chunk = (start - first_sample) % per_chunk;
                let chunk_start = first_sample + (chunk - first) * per_chunk;
                let base = *table.chunk_offsets.get(chunk).ok_or_else(missing_chunk)?;
                let before: u64 = table.sample_sizes[chunk_start..start]
                    .iter()
                    .map(|&s| s as u64)
                    .sum();
                return Ok(Self {
                    run,
                    chunk,
                    in_chunk: in_chunk as u32,
                    offset: base + before,
                });
            }
            first_sample += samples;
        }
        Err(missing_chunk())
    }

    fn advance(&mut self, table: &SampleTable, size: u32) -> Result<()> {
        self.offset += size as u64;
        self.in_chunk += 1;
        let per_chunk = table.sample_to_chunk[self.run].1;
        if self.in_chunk < per_chunk {
            return Ok(());
        }

        self.chunk += 1;
        self.in_chunk = 0;
        if let Some(next) = table.sample_to_chunk.get(self.run + 1) {
            if self.chunk + 1 >= next.0 as usize {
                self.run += 1;
            }
        }
        // the sweep may end exactly past the last chunk
        self.offset = table.chunk_offsets.get(self.chunk).copied().unwrap_or(self.offset);
        Ok(())
    }
}

fn missing_chunk() -> CacheError {
    CacheError::Malformed("stsc/stco do not cover every sample".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SampleTable {
        SampleTable {
            sample_sizes: vec![10, 20, 30, 40, 50, 60, 70],
            // two chunks of 3, then one chunk of 1
            chunk_offsets: vec![1000, 2000, 3000],
            sample_to_chunk: vec![(1, 3, 1), (3, 1, 1)],
            time_to_sample: vec![(4, 100), (3, 50)],
            keyframes: vec![1, 5],
            composition_offsets: vec![(2, 0), (5, 200)],
        }
    }

    #[test]
    fn test_sample_offsets() {
        let entries = table().entries(0, 7).unwrap();
        let offsets: Vec<_> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1000, 1010, 1030, 2000, 2040, 2090, 3000]);

        // mid-chunk start agrees with the full sweep
        let tail = table().entries(4, 7).unwrap();
        assert_eq!(tail, entries[4..]);
    }

    #[test]
    fn test_sample_times() {
        let entries = table().entries(0, 7).unwrap();
        let times: Vec<_> = entries.iter().map(|e| (e.decode_time, e.duration)).collect();
        assert_eq!(
            times,
            vec![(0, 100), (100, 100), (200, 100), (300, 100), (400, 50), (450, 50), (500, 50)]
        );
        let ctts: Vec<_> = entries.iter().map(|e| e.composition_offset).collect();
        assert_eq!(ctts, vec![0, 0, 200, 200, 200, 200, 200]);
    }

    #[test]
    fn test_keyframes_are_one_based() {
        let t = table();
        assert!(t.is_keyframe(0));
        assert!(!t.is_keyframe(1));
        assert!(t.is_keyframe(4));
        assert!(SampleTable::default().is_keyframe(3));
    }

    #[test]
    fn test_time_lookup() {
        let t = table();
        assert_eq!(t.sample_for_time(0), Some(0));
        assert_eq!(t.sample_for_time(399), Some(3));
        assert_eq!(t.sample_for_time(460), Some(5));
        assert_eq!(t.sample_for_time(550), None);
        assert_eq!(t.first_sample_from(150), 2);
        assert_eq!(t.first_sample_from(400), 4);
        assert_eq!(t.first_sample_from(10_000), 7);
    }

    fn stsz_body(sample_size: u32, count: u32) -> Vec<u8> {
        let mut body = vec![0u8; 4];
        body.extend_from_slice(&sample_size.to_be_bytes());
        body.extend_from_slice(&count.to_be_bytes());
        body
    }

    #[test]
    fn test_fixed_size_stsz_is_bounded() {
        let mut t = SampleTable::default();
        t.parse_stsz(&stsz_body(100, 12)).unwrap();
        assert_eq!(t.sample_count(), 12);

        let mut t = SampleTable::default();
        assert!(matches!(
            t.parse_stsz(&stsz_body(100, u32::MAX)),
            Err(CacheError::Malformed(_))
        ));
        assert_eq!(t.sample_count(), 0);

        // disagrees with the time table
        let mut t = SampleTable {
            time_to_sample: vec![(10, 40)],
            ..Default::default()
        };
        assert!(t.parse_stsz(&stsz_body(100, 11)).is_err());
        t.parse_stsz(&stsz_body(100, 10)).unwrap();
    }

    #[test]
    fn test_clips_ranges_to_sample_count() {
        assert_eq!(table().entries(5, 50).unwrap().len(), 2);
        assert!(table().entries(9, 12).unwrap().is_empty());
    }

    #[test]
    fn test_reports_short_tables() {
        let mut t = table();
        t.time_to_sample = vec![(2, 100)];
        assert!(matches!(t.entries(0, 7), Err(CacheError::Malformed(_))));

        let mut t = table();
        t.chunk_offsets.pop();
        assert!(t.entries(6, 7).is_err());
    }
}
