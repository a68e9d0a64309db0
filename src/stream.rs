//! Typed record streams over backing files.
//!
//! A [`Stream`] is a finite, restartable sequence of fixed-size records
//! persisted to a single file. Records are written in host-native
//! representation behind a fixed 512-byte header; only trivially copyable
//! record types (`bytemuck::Pod`) are supported so that block I/O never
//! needs a serialization step.
//!
//! Streams are single-owner: they are not thread-safe for concurrent
//! mutation, and writes are totally ordered by the owning thread.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::tempname;

/// Size of the fixed stream file header in bytes.
pub const HEADER_SIZE: u64 = 512;

/// Magic value opening every stream file.
pub const STREAM_MAGIC: &[u8; 8] = b"TPIE\0STR";

/// Stream file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Default in-core block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 21;

/// Default number of resident blocks per stream.
pub const DEFAULT_BLOCK_COUNT: usize = 2;

/// Stream access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Existing file, reading only.
    Read,
    /// Fresh file, writing only; an existing file is truncated.
    Write,
    /// Reading and writing in place; the file is created when absent.
    ReadWrite,
    /// Writing at the end only; the file is created when absent.
    Append,
}

impl AccessMode {
    fn can_read(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    fn can_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite | AccessMode::Append)
    }
}

/// Stream configuration. Provides methods for [`Stream`] initialization.
#[derive(Clone)]
pub struct StreamOptions {
    block_size: usize,
    block_count: usize,
    /// Fraction of a block that must be consumed before the next block is
    /// prefetched on sequential reads.
    prefetch_watermark: f64,
    memory: Arc<MemoryManager>,
    tmp_dir: Option<PathBuf>,
}

impl StreamOptions {
    pub fn new() -> Self {
        StreamOptions::default()
    }

    /// Sets the block size in bytes; rounded up to a power of two.
    pub fn with_block_size(mut self, size: usize) -> StreamOptions {
        self.block_size = size.next_power_of_two();
        return self;
    }

    /// Sets the number of resident blocks; at least two are kept.
    pub fn with_block_count(mut self, count: usize) -> StreamOptions {
        self.block_count = count.max(2);
        return self;
    }

    /// Sets the prefetch watermark as a fraction of the block size.
    pub fn with_prefetch_watermark(mut self, fraction: f64) -> StreamOptions {
        self.prefetch_watermark = fraction.clamp(0.0, 1.0);
        return self;
    }

    /// Sets the memory manager charged for resident blocks.
    pub fn with_memory_manager(mut self, memory: Arc<MemoryManager>) -> StreamOptions {
        self.memory = memory;
        return self;
    }

    /// Sets the directory used for temporary backing files.
    pub fn with_tmp_dir(mut self, path: &Path) -> StreamOptions {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Creates a temporary stream; the backing file is removed on drop.
    pub fn create<T: bytemuck::Pod>(self) -> Result<Stream<T>> {
        let path = tempname::tempnam("stream", self.tmp_dir.as_deref(), None);
        Stream::open_with(self, path, AccessMode::ReadWrite, true)
    }

    /// Opens a named stream; the backing file is retained on drop.
    pub fn open<T: bytemuck::Pod>(self, path: impl Into<PathBuf>, mode: AccessMode) -> Result<Stream<T>> {
        Stream::open_with(self, path.into(), mode, false)
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            prefetch_watermark: 0.75,
            memory: MemoryManager::global().clone(),
            tmp_dir: None,
        }
    }
}

/// A typed, seekable record file with a prefetching block buffer.
///
/// The offset invariant `offset <= len` holds between all public calls.
/// After an I/O failure the stream enters a sticky error state and every
/// subsequent operation fails fast until the stream is dropped.
pub struct Stream<T: bytemuck::Pod> {
    file: fs::File,
    path: PathBuf,
    mode: AccessMode,
    temp: bool,
    item_size: u64,
    /// Logical length in records.
    len: u64,
    /// Current read/write offset in records.
    offset: u64,
    failed: bool,
    memory: Arc<MemoryManager>,
    blocks: Vec<Option<Block>>,
    cursor: usize,
    block_size: usize,
    watermark: usize,

    item_type: PhantomData<T>,
}

impl<T: bytemuck::Pod> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("failed", &self.failed)
            .finish()
    }
}

fn encode_header(item_size: u32, len: u64) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[0..8].copy_from_slice(STREAM_MAGIC);
    buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&item_size.to_le_bytes());
    buf[16..24].copy_from_slice(&len.to_le_bytes());
    return buf;
}

fn decode_header(buf: &[u8; HEADER_SIZE as usize], expected_item_size: u32) -> Result<u64> {
    if &buf[0..8] != STREAM_MAGIC {
        return Err(Error::FormatMismatch(String::from("bad magic")));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::FormatMismatch(format!("unsupported format version {}", version)));
    }
    let item_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    if item_size != expected_item_size {
        return Err(Error::FormatMismatch(format!(
            "record size is {} bytes, opener expects {}",
            item_size, expected_item_size
        )));
    }
    let len = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    return Ok(len);
}

impl<T: bytemuck::Pod> Stream<T> {
    /// Creates a temporary stream with default options.
    pub fn create() -> Result<Self> {
        StreamOptions::new().create()
    }

    /// Opens a named stream with default options.
    pub fn open(path: impl Into<PathBuf>, mode: AccessMode) -> Result<Self> {
        StreamOptions::new().open(path, mode)
    }

    fn open_with(options: StreamOptions, path: PathBuf, mode: AccessMode, temp: bool) -> Result<Self> {
        let item_size = mem::size_of::<T>() as u64;
        assert!(item_size > 0, "zero-sized record types are not supported");

        let exists = path.exists();
        let (mut file, len) = match mode {
            AccessMode::Read => {
                let mut file = fs::OpenOptions::new().read(true).open(&path).map_err(|err| {
                    if err.kind() == io::ErrorKind::NotFound {
                        Error::NotFound(path.display().to_string())
                    } else {
                        Error::Io(err)
                    }
                })?;
                let len = Self::read_header(&mut file, item_size as u32)?;
                (file, len)
            }
            AccessMode::Write => {
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                (file, 0)
            }
            AccessMode::ReadWrite | AccessMode::Append => {
                let mut opts = fs::OpenOptions::new();
                opts.read(true).write(true);
                // a temporary stream must land on a fresh file
                if temp {
                    opts.create_new(true);
                } else {
                    opts.create(true);
                }
                let mut file = opts.open(&path).map_err(|err| {
                    if err.kind() == io::ErrorKind::AlreadyExists {
                        Error::AlreadyExists(path.display().to_string())
                    } else {
                        Error::Io(err)
                    }
                })?;
                let len = if exists {
                    Self::read_header(&mut file, item_size as u32)?
                } else {
                    0
                };
                (file, len)
            }
        };

        // A fresh writable file gets its header materialized immediately so
        // a crash-free close always leaves a well-formed stream behind.
        if mode.can_write() && (!exists || mode == AccessMode::Write) {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_header(item_size as u32, 0))?;
        }

        let block_size = options.block_size.max((item_size as usize).next_power_of_two());
        let watermark = (block_size as f64 * options.prefetch_watermark) as usize;

        log::debug!(
            "opened stream {} (mode {:?}, {} records of {} bytes)",
            path.display(),
            mode,
            len,
            item_size
        );

        let offset = if mode == AccessMode::Append { len } else { 0 };
        return Ok(Stream {
            file,
            path,
            mode,
            temp,
            item_size,
            len,
            offset,
            failed: false,
            memory: options.memory,
            blocks: (0..options.block_count).map(|_| None).collect(),
            cursor: 0,
            block_size,
            watermark,
            item_type: PhantomData,
        });
    }

    fn read_header(file: &mut fs::File, expected_item_size: u32) -> Result<u64> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::FormatMismatch(String::from("truncated header"))
            } else {
                Error::Io(err)
            }
        })?;
        decode_header(&buf, expected_item_size)
    }

    /// Logical length in records.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current read/write offset in records.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn check_state(&self) -> Result<()> {
        if self.failed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "stream is in a sticky error state",
            )));
        }
        return Ok(());
    }

    /// Records an I/O failure so subsequent operations fail fast.
    fn guard<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(Error::Io(_)) = &result {
            self.failed = true;
        }
        result
    }

    /// Reads the record at the current offset and advances by one.
    ///
    /// Reading past the last record yields [`Error::EndOfStream`], which is
    /// not fatal and does not mark the stream failed.
    pub fn read_item(&mut self) -> Result<T> {
        self.check_state()?;
        if !self.mode.can_read() {
            return Err(Error::PermissionDenied("read"));
        }
        if self.offset >= self.len {
            return Err(Error::EndOfStream);
        }

        let mut item = T::zeroed();
        let pos = self.offset * self.item_size;
        let result = self.copy_from_blocks(pos, bytemuck::bytes_of_mut(&mut item));
        self.guard(result)?;
        self.offset += 1;
        self.maybe_prefetch();
        return Ok(item);
    }

    /// Writes a record at the current offset (at the end in append mode) and
    /// advances by one, extending the stream when writing at the end.
    pub fn write_item(&mut self, item: T) -> Result<()> {
        self.check_state()?;
        if !self.mode.can_write() {
            return Err(Error::PermissionDenied("write"));
        }
        if self.mode == AccessMode::Append {
            self.offset = self.len;
        }

        // Extend the length before copying: a record may straddle two
        // blocks, and an eviction between the two chunks clips its
        // writeback to the logical length.
        let pos = self.offset * self.item_size;
        let old_len = self.len;
        self.len = self.len.max(self.offset + 1);
        let result = self.copy_to_blocks(pos, bytemuck::bytes_of(&item));
        if result.is_err() {
            self.len = old_len;
        }
        self.guard(result)?;
        self.offset += 1;
        return Ok(());
    }

    /// Moves the offset to an absolute record position.
    ///
    /// Seeking is supported on read-write streams only and the target must
    /// not exceed the current length.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.check_state()?;
        if self.mode != AccessMode::ReadWrite {
            return Err(Error::PermissionDenied("seek"));
        }
        if offset > self.len {
            return Err(Error::OutOfRange { offset, length: self.len });
        }
        self.offset = offset;
        return Ok(());
    }

    /// Moves the offset to `delta` records before the end.
    pub fn seek_from_end(&mut self, delta: u64) -> Result<()> {
        if delta > self.len {
            return Err(Error::OutOfRange { offset: delta, length: self.len });
        }
        self.seek(self.len - delta)
    }

    /// Sets the logical length to `n` records.
    ///
    /// Shrinking releases the tail blocks; growing zero-fills the hole.
    pub fn truncate(&mut self, n: u64) -> Result<()> {
        self.check_state()?;
        if !self.mode.can_write() {
            return Err(Error::PermissionDenied("truncate"));
        }

        if n < self.len {
            let end = n * self.item_size;
            let block_size = self.block_size as u64;
            for slot in self.blocks.iter_mut() {
                if let Some(block) = slot {
                    let start = block.index() * block_size;
                    if start >= end {
                        block.mark_clean();
                        *slot = None;
                    } else if start + block_size > end {
                        // zero the in-core tail so a later re-extension
                        // observes the hole as zeros
                        block.data_mut()[(end - start) as usize..].fill(0);
                    }
                }
            }
        }
        let result = self
            .file
            .set_len(HEADER_SIZE + n * self.item_size)
            .map_err(Error::from);
        self.guard(result)?;
        self.len = n;
        self.offset = self.offset.min(n);
        return Ok(());
    }

    /// Iterates all records from the start, invoking the visitor on each.
    pub fn scan<F>(&mut self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&T),
    {
        self.check_state()?;
        if !self.mode.can_read() {
            return Err(Error::PermissionDenied("scan"));
        }
        self.offset = 0;
        loop {
            match self.read_item() {
                Ok(item) => visitor(&item),
                Err(Error::EndOfStream) => break,
                Err(err) => return Err(err),
            }
        }
        return Ok(());
    }

    /// Writes back every dirty block and the header.
    pub fn flush(&mut self) -> Result<()> {
        self.check_state()?;
        if !self.mode.can_write() {
            return Ok(());
        }
        for slot in 0..self.blocks.len() {
            let result = self.flush_slot(slot);
            self.guard(result)?;
        }
        let header = encode_header(self.item_size as u32, self.len);
        let result = (|| -> Result<()> {
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&header)?;
            return Ok(());
        })();
        self.guard(result)?;
        return Ok(());
    }

    // -- block buffer ------------------------------------------------------

    fn find_block(&self, index: u64) -> Option<usize> {
        self.blocks
            .iter()
            .position(|slot| slot.as_ref().map(Block::index) == Some(index))
    }

    /// Copies `buf.len()` bytes starting at data-region position `pos` out
    /// of the resident blocks, faulting blocks in as needed. A record may
    /// straddle a block boundary, hence the chunked loop.
    fn copy_from_blocks(&mut self, mut pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let index = pos / self.block_size as u64;
            let within = (pos % self.block_size as u64) as usize;
            let n = (buf.len() - done).min(self.block_size - within);
            let slot = self.load_block(index)?;
            let block = self.blocks[slot].as_ref().unwrap();
            buf[done..done + n].copy_from_slice(&block.data()[within..within + n]);
            done += n;
            pos += n as u64;
        }
        return Ok(());
    }

    fn copy_to_blocks(&mut self, mut pos: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let index = pos / self.block_size as u64;
            let within = (pos % self.block_size as u64) as usize;
            let n = (buf.len() - done).min(self.block_size - within);
            let slot = self.load_block(index)?;
            let block = self.blocks[slot].as_mut().unwrap();
            block.data_mut()[within..within + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            pos += n as u64;
        }
        return Ok(());
    }

    /// Ensures the block is resident and returns its slot.
    fn load_block(&mut self, index: u64) -> Result<usize> {
        if let Some(slot) = self.find_block(index) {
            return Ok(slot);
        }

        let slot = self.pick_victim();
        self.flush_slot(slot)?;
        match self.blocks[slot].as_mut() {
            Some(block) => block.reset(index),
            None => {
                self.blocks[slot] = Some(Block::new(&self.memory, index, self.block_size)?);
            }
        }
        self.fault_in(slot)?;
        return Ok(slot);
    }

    /// Cyclic replacement over the slots, skipping pinned blocks.
    fn pick_victim(&mut self) -> usize {
        loop {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % self.blocks.len();
            match &self.blocks[slot] {
                Some(block) if block.is_pinned() => continue,
                _ => return slot,
            }
        }
    }

    /// Reads a resident block's contents from disk; bytes past the physical
    /// end of file stay zero, which is what materializes holes.
    fn fault_in(&mut self, slot: usize) -> Result<()> {
        let block = self.blocks[slot].as_mut().unwrap();
        let start = HEADER_SIZE + block.index() * self.block_size as u64;
        self.file.seek(SeekFrom::Start(start))?;

        let data = block.fill_from_disk();
        let mut filled = 0;
        while filled < data.len() {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        return Ok(());
    }

    /// Writes a dirty block back to disk, clipped to the logical length.
    fn flush_slot(&mut self, slot: usize) -> Result<()> {
        let len_bytes = self.len * self.item_size;
        let block = match self.blocks[slot].as_mut() {
            Some(block) if block.is_dirty() => block,
            _ => return Ok(()),
        };
        let start = block.index() * self.block_size as u64;
        let n = (self.block_size as u64).min(len_bytes.saturating_sub(start));
        if n > 0 {
            self.file.seek(SeekFrom::Start(HEADER_SIZE + start))?;
            self.file.write_all(&block.data()[..n as usize])?;
        }
        block.mark_clean();
        return Ok(());
    }

    /// Prefetches the next block once the read position crosses the
    /// watermark within the current one. Best-effort; failures surface on
    /// the demand fetch instead.
    fn maybe_prefetch(&mut self) {
        let pos = self.offset * self.item_size;
        let index = pos / self.block_size as u64;
        let within = (pos % self.block_size as u64) as usize;
        if within < self.watermark {
            return;
        }
        let next = index + 1;
        if next * self.block_size as u64 >= self.len * self.item_size {
            return;
        }
        if self.find_block(next).is_some() {
            return;
        }

        let current = self.find_block(index);
        if let Some(slot) = current {
            self.blocks[slot].as_mut().unwrap().pin();
        }
        if let Err(err) = self.load_block(next) {
            log::debug!("prefetch of block {} failed: {}", next, err);
        }
        if let Some(slot) = current {
            self.blocks[slot].as_mut().unwrap().unpin();
        }
    }
}

impl<T: bytemuck::Pod> Drop for Stream<T> {
    fn drop(&mut self) {
        if !self.failed {
            if let Err(err) = self.flush() {
                log::error!("stream {} not flushed cleanly: {}", self.path.display(), err);
            }
        }
        if self.temp {
            if let Err(err) = fs::remove_file(&self.path) {
                log::warn!("temporary stream {} not removed: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{AccessMode, Stream, StreamOptions};
    use crate::error::{Error, ErrorKind};
    use crate::memory::MemoryManager;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_write_close_reopen_scan(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("doubles.stream");

        {
            let mut stream: Stream<f64> = Stream::open(&path, AccessMode::Write).unwrap();
            for item in [1.0, 2.0, 3.0, 4.0] {
                stream.write_item(item).unwrap();
            }
            assert_eq!(stream.len(), 4);
        }

        let mut stream: Stream<f64> = Stream::open(&path, AccessMode::Read).unwrap();
        assert_eq!(stream.len(), 4);

        let mut seen = Vec::new();
        stream.scan(|item| seen.push(*item)).unwrap();
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);

        assert_eq!(stream.read_item().unwrap_err().kind(), ErrorKind::EndOfStream);
    }

    #[rstest]
    fn test_empty_stream(tmp_dir: tempfile::TempDir) {
        let mut stream: Stream<u64> = StreamOptions::new()
            .with_tmp_dir(tmp_dir.path())
            .create()
            .unwrap();

        assert_eq!(stream.len(), 0);
        assert_eq!(stream.read_item().unwrap_err().kind(), ErrorKind::EndOfStream);
        stream.seek(0).unwrap();
    }

    #[rstest]
    fn test_seek_bounds(tmp_dir: tempfile::TempDir) {
        let mut stream: Stream<u32> = StreamOptions::new()
            .with_tmp_dir(tmp_dir.path())
            .create()
            .unwrap();

        for item in 0u32..10 {
            stream.write_item(item).unwrap();
        }

        stream.seek(10).unwrap();
        match stream.seek(11).unwrap_err() {
            Error::OutOfRange { offset, length } => {
                assert_eq!((offset, length), (11, 10));
            }
            other => panic!("unexpected error: {}", other),
        }

        stream.seek_from_end(3).unwrap();
        assert_eq!(stream.tell(), 7);
        assert_eq!(stream.read_item().unwrap(), 7);
    }

    #[rstest]
    fn test_mode_enforcement(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("modes.stream");

        let mut stream: Stream<u32> = Stream::open(&path, AccessMode::Write).unwrap();
        stream.write_item(7).unwrap();
        assert_eq!(stream.read_item().unwrap_err().kind(), ErrorKind::PermissionDenied);
        drop(stream);

        let mut stream: Stream<u32> = Stream::open(&path, AccessMode::Read).unwrap();
        assert_eq!(stream.write_item(8).unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(stream.seek(0).unwrap_err().kind(), ErrorKind::PermissionDenied);
    }

    #[rstest]
    fn test_append_mode(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("append.stream");

        {
            let mut stream: Stream<u64> = Stream::open(&path, AccessMode::Write).unwrap();
            stream.write_item(1).unwrap();
            stream.write_item(2).unwrap();
        }
        {
            let mut stream: Stream<u64> = Stream::open(&path, AccessMode::Append).unwrap();
            assert_eq!(stream.tell(), 2);
            stream.write_item(3).unwrap();
        }

        let mut stream: Stream<u64> = Stream::open(&path, AccessMode::Read).unwrap();
        let mut seen = Vec::new();
        stream.scan(|item| seen.push(*item)).unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[rstest]
    fn test_truncate(tmp_dir: tempfile::TempDir) {
        let mut stream: Stream<u64> = StreamOptions::new()
            .with_tmp_dir(tmp_dir.path())
            .create()
            .unwrap();

        for item in 0u64..10 {
            stream.write_item(item).unwrap();
        }
        stream.truncate(5).unwrap();
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.tell(), 5);

        let mut seen = Vec::new();
        stream.scan(|item| seen.push(*item)).unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // growing zero-fills the hole
        stream.truncate(7).unwrap();
        stream.seek(5).unwrap();
        assert_eq!(stream.read_item().unwrap(), 0);
        assert_eq!(stream.read_item().unwrap(), 0);
    }

    #[rstest]
    fn test_many_records_across_small_blocks(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("blocks.stream");

        {
            let mut stream: Stream<u64> = StreamOptions::new()
                .with_block_size(64)
                .with_block_count(2)
                .open(&path, AccessMode::Write)
                .unwrap();
            for item in 0u64..1000 {
                stream.write_item(item * 3).unwrap();
            }
        }

        let mut stream: Stream<u64> = StreamOptions::new()
            .with_block_size(64)
            .with_block_count(2)
            .open(&path, AccessMode::Read)
            .unwrap();
        assert_eq!(stream.len(), 1000);

        let mut expected = 0u64;
        stream
            .scan(|item| {
                assert_eq!(*item, expected * 3);
                expected += 1;
            })
            .unwrap();
        assert_eq!(expected, 1000);
    }

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Triple {
        key: u32,
        lo: u32,
        hi: u32,
    }

    #[rstest]
    fn test_records_straddling_block_boundaries(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("triples.stream");

        // 12-byte records over 64-byte blocks: every fifth record either
        // straddles a block boundary or ends flush against one
        {
            let mut stream: Stream<Triple> = StreamOptions::new()
                .with_block_size(64)
                .with_block_count(2)
                .open(&path, AccessMode::Write)
                .unwrap();
            for i in 0u32..200 {
                stream.write_item(Triple { key: i, lo: i * 2, hi: i * 3 }).unwrap();
            }
        }

        let mut stream: Stream<Triple> = StreamOptions::new()
            .with_block_size(64)
            .with_block_count(2)
            .open(&path, AccessMode::Read)
            .unwrap();

        let mut i = 0u32;
        stream
            .scan(|item| {
                assert_eq!(*item, Triple { key: i, lo: i * 2, hi: i * 3 });
                i += 1;
            })
            .unwrap();
        assert_eq!(i, 200);
    }

    #[rstest]
    fn test_overwrite_in_place(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("rw.stream");

        {
            let mut stream: Stream<u32> = Stream::open(&path, AccessMode::Write).unwrap();
            for item in 0u32..8 {
                stream.write_item(item).unwrap();
            }
        }

        let mut stream: Stream<u32> = Stream::open(&path, AccessMode::ReadWrite).unwrap();
        stream.seek(3).unwrap();
        stream.write_item(99).unwrap();
        assert_eq!(stream.len(), 8);

        let mut seen = Vec::new();
        stream.scan(|item| seen.push(*item)).unwrap();
        assert_eq!(seen, vec![0, 1, 2, 99, 4, 5, 6, 7]);
    }

    #[rstest]
    fn test_format_mismatch_rejected(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("typed.stream");

        {
            let mut stream: Stream<u64> = Stream::open(&path, AccessMode::Write).unwrap();
            stream.write_item(42).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();

        let err = Stream::<u32>::open(&path, AccessMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatMismatch);
        let err = Stream::<u32>::open(&path, AccessMode::ReadWrite).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatMismatch);

        // the rejected opens must not have mutated the file
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
        let mut stream: Stream<u64> = Stream::open(&path, AccessMode::Read).unwrap();
        assert_eq!(stream.read_item().unwrap(), 42);
    }

    #[rstest]
    fn test_open_missing_file(tmp_dir: tempfile::TempDir) {
        let err = Stream::<u32>::open(tmp_dir.path().join("absent"), AccessMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[rstest]
    fn test_temp_stream_removed_on_drop(tmp_dir: tempfile::TempDir) {
        let path = {
            let mut stream: Stream<u32> = StreamOptions::new()
                .with_tmp_dir(tmp_dir.path())
                .create()
                .unwrap();
            stream.write_item(1).unwrap();
            stream.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[rstest]
    fn test_blocks_charge_memory_manager(tmp_dir: tempfile::TempDir) {
        let manager = MemoryManager::new(1 << 20);

        let mut stream: Stream<u64> = StreamOptions::new()
            .with_block_size(4096)
            .with_block_count(2)
            .with_memory_manager(manager.clone())
            .with_tmp_dir(tmp_dir.path())
            .create()
            .unwrap();

        for item in 0u64..1024 {
            stream.write_item(item).unwrap();
        }
        assert_eq!(manager.used(), 2 * 4096);

        drop(stream);
        assert_eq!(manager.used(), 0);
    }
}
