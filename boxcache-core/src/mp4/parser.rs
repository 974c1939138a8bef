//! MP4 box reading.

use std::io::Read;

use bytes::Buf;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Whole box including the header; 0 means "to the end of the file".
    pub size: u64,
    pub box_type: [u8; 4],
    pub header_size: u64,
}

impl BoxHeader {
    /// Body length, or `None` for a box that runs to the end of the file.
    pub fn body_len(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_size)
    }
}

fn read_err(e: std::io::Error) -> CacheError {
    CacheError::Malformed(format!("read error: {e}"))
}

pub fn read_box_header<R: Read>(reader: &mut R) -> Result<BoxHeader> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).map_err(read_err)?;
    let mut cursor = &header[..];
    let size = cursor.get_u32() as u64;
    let mut box_type = [0u8; 4];
    cursor.copy_to_slice(&mut box_type);

    let (size, header_size) = match size {
        1 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).map_err(read_err)?;
            let ext_size = (&ext[..]).get_u64();
            if ext_size < 16 {
                return Err(CacheError::Malformed("invalid extended box size".into()));
            }
            (ext_size, 16)
        }
        0 => (0, 8),
        n if n < 8 => return Err(CacheError::Malformed("invalid box size".into())),
        n => (n, 8),
    };

    Ok(BoxHeader {
        size,
        box_type,
        header_size,
    })
}

/// Split the next child box off the front of `data`.
pub fn next_box<'a>(data: &mut &'a [u8]) -> Result<Option<([u8; 4], &'a [u8])>> {
    if data.is_empty() {
        return Ok(None);
    }
    let header = read_box_header(data)?;
    let len = match header.body_len() {
        Some(len) => usize::try_from(len)
            .map_err(|_| CacheError::Malformed("box larger than memory".into()))?,
        None => data.len(),
    };
    if len > data.len() {
        return Err(CacheError::Malformed(format!(
            "'{}' box claims {} bytes, {} left",
            fourcc(&header.box_type),
            len,
            data.len()
        )));
    }
    let (body, rest) = data.split_at(len);
    *data = rest;
    Ok(Some((header.box_type, body)))
}

/// First child of the given type.
pub fn find_box<'a>(mut data: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    while let Some((box_type, body)) = next_box(&mut data)? {
        if &box_type == kind {
            return Ok(Some(body));
        }
    }
    Ok(None)
}

pub fn fourcc(box_type: &[u8; 4]) -> String {
    String::from_utf8_lossy(box_type).into_owned()
}

/// Bounds-checked big-endian reads over a box body.
pub struct BodyReader<'a> {
    data: &'a [u8],
    box_type: &'static str,
}

impl<'a> BodyReader<'a> {
    pub fn new(data: &'a [u8], box_type: &'static str) -> Self {
        Self { data, box_type }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.data.remaining() < n {
            return Err(CacheError::Malformed(format!("truncated '{}' box", self.box_type)));
        }
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.data.advance(n);
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.data.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.data.get_i32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.data.get_u64())
    }

    pub fn fourcc(&mut self) -> Result<[u8; 4]> {
        self.need(4)?;
        let mut out = [0u8; 4];
        self.data.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Version byte of a full box, skipping the flags.
    pub fn full_box(&mut self) -> Result<u8> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }

    /// Entry count, refusing counts the remaining body cannot hold.
    pub fn count(&mut self, entry_len: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(entry_len) > self.data.remaining() {
            return Err(CacheError::Malformed(format!(
                "'{}' box lists {} entries past its end",
                self.box_type, count
            )));
        }
        Ok(count)
    }
}
