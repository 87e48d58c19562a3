//! Chunked staging buffer for open file bodies.
//!
//! The archive backend is write-once per entry, so every open regular
//! file stages its content here: reads and writes are random-access over
//! fixed-size chunks, and at save time the buffer turns into a pull
//! source that streams the chunks back into the archive.

use std::io::Read;

use zipfs_format::{EntrySource, ZipBackend};

use crate::error::{FsError, Result};

/// Chunk size in bytes.
pub const CHUNK_SIZE: usize = 4 * 1024;

type Chunk = Box<[u8; CHUNK_SIZE]>;

fn new_chunk() -> Chunk {
    Box::new([0u8; CHUNK_SIZE])
}

/// Number of chunks needed to hold `len` bytes.
fn chunks_for(len: u64) -> usize {
    len.div_ceil(CHUNK_SIZE as u64) as usize
}

/// Chunk holding the `offset`-th byte.
fn chunk_index(offset: u64) -> usize {
    (offset / CHUNK_SIZE as u64) as usize
}

/// Offset of the `offset`-th byte inside its chunk.
fn chunk_offset(offset: u64) -> usize {
    (offset % CHUNK_SIZE as u64) as usize
}

/// In-memory content of one open file.
pub struct ChunkedBuffer {
    chunks: Vec<Chunk>,
    len: u64,
}

impl ChunkedBuffer {
    /// Empty buffer: length 0, no chunks.
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }

    /// Populate a buffer from an archive entry, splitting the
    /// decompressed stream across chunks.
    pub fn from_archive(backend: &mut ZipBackend, index: usize, len: u64) -> Result<Self> {
        let mut buffer = Self::new();
        buffer.grow_chunks(chunks_for(len))?;
        buffer.len = len;

        backend.with_entry_reader(index, |reader| {
            let mut remaining = len;
            for chunk in buffer.chunks.iter_mut() {
                let wanted = remaining.min(CHUNK_SIZE as u64) as usize;
                reader.read_exact(&mut chunk[..wanted])?;
                remaining -= wanted as u64;
            }
            Ok(())
        })?;
        Ok(buffer)
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`,
    /// clamped to the buffer length. Never fails.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> usize {
        if offset >= self.len {
            return 0;
        }
        let count = (dst.len() as u64).min(self.len - offset) as usize;
        let mut copied = 0;
        let mut pos = offset;
        while copied < count {
            let chunk = &self.chunks[chunk_index(pos)];
            let start = chunk_offset(pos);
            let take = (count - copied).min(CHUNK_SIZE - start);
            dst[copied..copied + take].copy_from_slice(&chunk[start..start + take]);
            copied += take;
            pos += take as u64;
        }
        count
    }

    /// Write `src` at `offset`, growing the buffer as needed. A gap
    /// between the old length and `offset` reads back as zeroes.
    pub fn write(&mut self, src: &[u8], offset: u64) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset + src.len() as u64;
        if offset > self.len {
            self.zero_tail();
        }
        if end > self.len {
            self.grow_chunks(chunks_for(end))?;
        }

        let mut copied = 0;
        let mut pos = offset;
        while copied < src.len() {
            let chunk = &mut self.chunks[chunk_index(pos)];
            let start = chunk_offset(pos);
            let take = (src.len() - copied).min(CHUNK_SIZE - start);
            chunk[start..start + take].copy_from_slice(&src[copied..copied + take]);
            copied += take;
            pos += take as u64;
        }
        self.len = self.len.max(end);
        Ok(src.len())
    }

    /// Resize to `new_len`. Shrinking frees surplus chunks and clears
    /// the cut-off tail of the surviving last chunk; growing exposes
    /// zero-filled bytes.
    pub fn truncate(&mut self, new_len: u64) -> Result<()> {
        if new_len < self.len {
            self.chunks.truncate(chunks_for(new_len));
            self.len = new_len;
            self.zero_tail();
        } else if new_len > self.len {
            self.zero_tail();
            self.grow_chunks(chunks_for(new_len))?;
            self.len = new_len;
        }
        Ok(())
    }

    /// Convert into the pull source handed to the archive backend. The
    /// chunks move with it and stay allocated until the archive commits.
    pub fn into_source(self, mtime: i64) -> BufferSource {
        BufferSource {
            buffer: self,
            mtime,
        }
    }

    /// Clear the bytes of the last chunk that lie at or past `len`.
    fn zero_tail(&mut self) {
        let start = chunk_offset(self.len);
        if start == 0 {
            return;
        }
        if let Some(chunk) = self.chunks.get_mut(chunk_index(self.len)) {
            chunk[start..].fill(0);
        }
    }

    fn grow_chunks(&mut self, total: usize) -> Result<()> {
        let current = self.chunks.len();
        if total <= current {
            return Ok(());
        }
        self.chunks
            .try_reserve(total - current)
            .map_err(|_| FsError::OutOfMemory)?;
        self.chunks.resize_with(total, new_chunk);
        Ok(())
    }

    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for ChunkedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned pull source over a staged buffer.
pub struct BufferSource {
    buffer: ChunkedBuffer,
    mtime: i64,
}

impl EntrySource for BufferSource {
    fn len(&self) -> u64 {
        self.buffer.len()
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }

    fn open(&self) -> Box<dyn Read + '_> {
        Box::new(ChunkReader {
            buffer: &self.buffer,
            pos: 0,
        })
    }
}

/// Streams a buffer out chunk by chunk.
struct ChunkReader<'a> {
    buffer: &'a ChunkedBuffer,
    pos: u64,
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        let n = self.buffer.read(dst, self.pos);
        self.pos += n as u64;
        Ok(n)
    }
}
