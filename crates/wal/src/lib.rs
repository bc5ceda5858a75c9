//! Write-ahead log for durable commits, crash recovery, and checkpoints.
//!
//! Every change to the database is appended here as a page-sized frame
//! before it counts as committed. Frames are chained by a running checksum
//! seeded from the header, and carry a copy of the header's salts; a torn
//! or stale tail therefore fails validation and is silently discarded by
//! the next open. A frame whose `db_size_after_commit` field is non-zero
//! is a commit frame: writing one fsyncs the log, and recovery replays
//! frames only up to the newest one.
//!
//! Frame page numbers are **1-based**: frame page N covers file bytes
//! `[(N-1) * page_size, N * page_size)`. The pager, which numbers pages
//! from 0, converts at this boundary.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use wal::Wal;
//! use storage::MemStorage;
//!
//! let wal = Wal::open(Path::new("data/main.tusk-wal"), 4096).unwrap();
//! let page = vec![0u8; 4096];
//! wal.write_frame(2, &page, 0).unwrap();     // ordinary frame
//! wal.write_frame(3, &page, 3).unwrap();     // commit frame, fsyncs
//!
//! let mut main = MemStorage::new(3 * 4096);
//! wal.checkpoint(&mut main).unwrap();        // apply + reset
//! assert_eq!(wal.frame_count(), 0);
//! ```

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use common::{DbError, DbResult, FrameNo, PageNo};
use rand::Rng;
use storage::StorageBackend;

/// Magic at byte 0 of the log, little-endian.
pub const WAL_MAGIC: u32 = 0x5455_534b;

/// On-disk format version of the log.
pub const WAL_FORMAT_VERSION: u32 = 1;

/// The log header occupies the first 32 bytes of the file.
pub const WAL_HEADER_SIZE: usize = 32;

/// Each frame starts with a 24-byte header, followed by one page.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Fibonacci-weighted running checksum over little-endian u32 pairs.
///
/// Input shorter than a multiple of eight bytes is zero-padded. The pair
/// `(0, 0)` seeds the header; each frame is seeded with its predecessor's
/// result, which is what chains the log together.
pub fn checksum(seed: (u32, u32), data: &[u8]) -> (u32, u32) {
    let (mut s0, mut s1) = seed;
    let mut step = |x0: u32, x1: u32| {
        s0 = s0.wrapping_add(x0).wrapping_add(s1);
        s1 = s1.wrapping_add(x1).wrapping_add(s0);
    };

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        step(
            u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
            u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
        );
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 8];
        last[..rem.len()].copy_from_slice(rem);
        step(
            u32::from_le_bytes(last[0..4].try_into().unwrap()),
            u32::from_le_bytes(last[4..8].try_into().unwrap()),
        );
    }
    (s0, s1)
}

/// Header fields and the valid frame prefix of a log file, as read by
/// [`inspect`].
#[derive(Clone, Debug)]
pub struct WalSummary {
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub frames: Vec<FrameSummary>,
}

/// One frame's header fields, without its page bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSummary {
    /// 1-based page number in the main file.
    pub page_no: u32,
    /// Non-zero on commit frames.
    pub db_size_after_commit: u32,
}

impl FrameSummary {
    pub fn is_commit(&self) -> bool {
        self.db_size_after_commit > 0
    }
}

/// Reads a log file without ever writing to it, for tooling. Unlike
/// [`Wal::open`], a foreign or damaged header is an error here rather
/// than a cue to recreate the log.
pub fn inspect(path: &Path) -> DbResult<WalSummary> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < WAL_HEADER_SIZE {
        return Err(DbError::Wal(format!(
            "{} bytes is shorter than a log header",
            bytes.len()
        )));
    }
    let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    if u32_at(0) != WAL_MAGIC {
        return Err(DbError::Wal("not a tusk log (bad magic)".into()));
    }
    if u32_at(4) != WAL_FORMAT_VERSION {
        return Err(DbError::Wal(format!("unsupported log version {}", u32_at(4))));
    }
    let stored = (u32_at(24), u32_at(28));
    if checksum((0, 0), &bytes[0..24]) != stored {
        return Err(DbError::Wal("log header checksum mismatch".into()));
    }

    let page_size = u32_at(8);
    let (salt1, salt2) = (u32_at(16), u32_at(20));
    let frame_size = FRAME_HEADER_SIZE + page_size as usize;
    let mut frames = Vec::new();
    let mut chain = stored;
    let mut pos = WAL_HEADER_SIZE;
    while pos + frame_size <= bytes.len() {
        let head = &bytes[pos..pos + FRAME_HEADER_SIZE];
        let head_at = |off: usize| u32::from_le_bytes(head[off..off + 4].try_into().unwrap());
        if head_at(0) == 0 || head_at(8) != salt1 || head_at(12) != salt2 {
            break;
        }
        let data = &bytes[pos + FRAME_HEADER_SIZE..pos + frame_size];
        let computed = checksum(checksum(chain, &head[0..8]), data);
        if computed != (head_at(16), head_at(20)) {
            break;
        }
        chain = computed;
        frames.push(FrameSummary {
            page_no: head_at(0),
            db_size_after_commit: head_at(4),
        });
        pos += frame_size;
    }

    Ok(WalSummary {
        page_size,
        checkpoint_seq: u32_at(12),
        salt1,
        salt2,
        frames,
    })
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalFrame {
    /// 1-based page number in the main file.
    pub page_no: u32,
    /// Database size in pages after this commit; zero for ordinary frames.
    pub db_size_after_commit: u32,
    pub data: Vec<u8>,
}

impl WalFrame {
    pub fn is_commit(&self) -> bool {
        self.db_size_after_commit > 0
    }
}

struct WalInner {
    file: File,
    path: PathBuf,
    page_size: u32,
    checkpoint_seq: u32,
    salt1: u32,
    salt2: u32,
    frame_count: u32,
    /// Cumulative checksum after each frame; index 0 is the header's.
    cksums: Vec<(u32, u32)>,
}

/// The write-ahead log companion to one database file.
pub struct Wal {
    inner: RwLock<WalInner>,
}

impl Wal {
    /// Opens the log at `path`, scanning and counting the valid frame
    /// prefix. A missing, foreign, or corrupt header (including a page
    /// size that differs from the database's) makes this a fresh log with
    /// new random salts and checkpoint sequence 1.
    pub fn open(path: &Path, page_size: u32) -> DbResult<Wal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DbError::Wal(format!("open {}: {e}", path.display())))?;

        let mut inner = WalInner {
            file,
            path: path.to_path_buf(),
            page_size,
            checkpoint_seq: 1,
            salt1: 0,
            salt2: 0,
            frame_count: 0,
            cksums: Vec::new(),
        };

        match inner.read_valid_header()? {
            Some((seq, salt1, salt2, header_cksum)) => {
                inner.checkpoint_seq = seq;
                inner.salt1 = salt1;
                inner.salt2 = salt2;
                inner.cksums.push(header_cksum);
                inner.scan_frames()?;
                if inner.frame_count > 0 {
                    log::info!(
                        "wal {} holds {} valid frames",
                        path.display(),
                        inner.frame_count
                    );
                }
            }
            None => {
                let mut rng = rand::rng();
                inner.salt1 = rng.random();
                inner.salt2 = rng.random();
                inner.write_header()?;
            }
        }

        Ok(Wal {
            inner: RwLock::new(inner),
        })
    }

    /// Appends one frame. `data` must be exactly one page. A non-zero
    /// `db_size_after_commit` makes this a commit frame, which is synced
    /// to disk before returning. Returns the new frame's 1-based index.
    pub fn write_frame(
        &self,
        page_no: u32,
        data: &[u8],
        db_size_after_commit: u32,
    ) -> DbResult<FrameNo> {
        let mut inner = self.inner.write().unwrap();
        if data.len() != inner.page_size as usize {
            return Err(DbError::Wal(format!(
                "frame data is {} bytes, page size is {}",
                data.len(),
                inner.page_size
            )));
        }
        if page_no == 0 {
            return Err(DbError::Wal("frame page numbers are 1-based".into()));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&page_no.to_le_bytes());
        header[4..8].copy_from_slice(&db_size_after_commit.to_le_bytes());
        header[8..12].copy_from_slice(&inner.salt1.to_le_bytes());
        header[12..16].copy_from_slice(&inner.salt2.to_le_bytes());
        let seed = *inner.cksums.last().unwrap();
        let cksum = checksum(checksum(seed, &header[0..8]), data);
        header[16..20].copy_from_slice(&cksum.0.to_le_bytes());
        header[20..24].copy_from_slice(&cksum.1.to_le_bytes());

        let offset = inner.frame_offset(inner.frame_count);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&header)?;
        inner.file.write_all(data)?;
        if db_size_after_commit > 0 {
            inner.file.sync_all()?;
        }

        inner.cksums.push(cksum);
        inner.frame_count += 1;
        Ok(inner.frame_count)
    }

    /// Reads frame `frame_no` (1-based). Salt or checksum damage is a
    /// hard [`DbError::ChecksumFailed`] here, unlike at open time.
    pub fn read_frame(&self, frame_no: FrameNo) -> DbResult<WalFrame> {
        let mut inner = self.inner.write().unwrap();
        if frame_no == 0 || frame_no > inner.frame_count {
            return Err(DbError::FrameNotFound(frame_no));
        }
        let (header, data) = inner.read_frame_raw(frame_no)?;

        let salt1 = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let salt2 = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let stored = (
            u32::from_le_bytes(header[16..20].try_into().unwrap()),
            u32::from_le_bytes(header[20..24].try_into().unwrap()),
        );
        let seed = inner.cksums[frame_no as usize - 1];
        let computed = checksum(checksum(seed, &header[0..8]), &data);
        if salt1 != inner.salt1 || salt2 != inner.salt2 || stored != computed {
            return Err(DbError::ChecksumFailed(frame_no));
        }

        Ok(WalFrame {
            page_no: u32::from_le_bytes(header[0..4].try_into().unwrap()),
            db_size_after_commit: u32::from_le_bytes(header[4..8].try_into().unwrap()),
            data,
        })
    }

    /// Newest frame index holding `page_no`, scanning backwards.
    pub fn find_page(&self, page_no: u32) -> DbResult<FrameNo> {
        let mut inner = self.inner.write().unwrap();
        for frame_no in (1..=inner.frame_count).rev() {
            let (header, _) = inner.read_frame_raw(frame_no)?;
            if u32::from_le_bytes(header[0..4].try_into().unwrap()) == page_no {
                return Ok(frame_no);
            }
        }
        Err(DbError::PageNotFound(PageNo(page_no)))
    }

    /// Applies the final image of every logged page to the main file,
    /// syncs it, and resets the log. Returns the number of distinct pages
    /// written back.
    pub fn checkpoint(&self, backend: &mut dyn StorageBackend) -> DbResult<usize> {
        let mut inner = self.inner.write().unwrap();
        let limit = inner.frame_count;
        let applied = inner.apply_frames(backend, limit)?;
        inner.reset()?;
        log::info!("wal checkpoint applied {applied} pages");
        Ok(applied)
    }

    /// Replays committed frames into the main file after a crash: applies
    /// frames 1..=N where N is the last commit frame, syncs, resets the
    /// log, and returns that frame's recorded database size in pages.
    /// Uncommitted trailing frames are discarded. Returns 0 (and leaves
    /// the log alone) when nothing was committed.
    pub fn recover(&self, backend: &mut dyn StorageBackend) -> DbResult<u32> {
        let mut inner = self.inner.write().unwrap();

        let mut last_commit = 0;
        let mut db_size = 0;
        for frame_no in (1..=inner.frame_count).rev() {
            let (header, _) = inner.read_frame_raw(frame_no)?;
            let size = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if size > 0 {
                last_commit = frame_no;
                db_size = size;
                break;
            }
        }
        if last_commit == 0 {
            return Ok(0);
        }

        let dropped = inner.frame_count - last_commit;
        let applied = inner.apply_frames(backend, last_commit)?;
        inner.reset()?;
        log::info!(
            "wal recovery applied {applied} pages up to frame {last_commit} ({dropped} uncommitted frames discarded)"
        );
        Ok(db_size)
    }

    /// Flushes the log file without writing anything.
    pub fn sync(&self) -> DbResult<()> {
        let inner = self.inner.write().unwrap();
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.read().unwrap().frame_count
    }

    pub fn checkpoint_seq(&self) -> u32 {
        self.inner.read().unwrap().checkpoint_seq
    }

    pub fn page_size(&self) -> u32 {
        self.inner.read().unwrap().page_size
    }
}

impl WalInner {
    fn frame_size(&self) -> u64 {
        (FRAME_HEADER_SIZE as u64) + self.page_size as u64
    }

    fn frame_offset(&self, index: u32) -> u64 {
        WAL_HEADER_SIZE as u64 + index as u64 * self.frame_size()
    }

    /// Reads and verifies the 32-byte header. `Ok(None)` means the log
    /// must be recreated.
    #[allow(clippy::type_complexity)]
    fn read_valid_header(&mut self) -> DbResult<Option<(u32, u32, u32, (u32, u32))>> {
        let len = self.file.metadata()?.len();
        if len < WAL_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;

        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if u32_at(0) != WAL_MAGIC || u32_at(4) != WAL_FORMAT_VERSION {
            return Ok(None);
        }
        if u32_at(8) != self.page_size {
            log::warn!(
                "wal page size {} does not match database page size {}; starting fresh",
                u32_at(8),
                self.page_size
            );
            return Ok(None);
        }
        let stored = (u32_at(24), u32_at(28));
        if checksum((0, 0), &buf[0..24]) != stored {
            return Ok(None);
        }
        Ok(Some((u32_at(12), u32_at(16), u32_at(20), stored)))
    }

    /// Counts the valid frame prefix, extending `cksums` as it goes.
    /// Stops at the first frame with foreign salts or a broken chain.
    fn scan_frames(&mut self) -> DbResult<()> {
        let len = self.file.metadata()?.len();
        loop {
            let offset = self.frame_offset(self.frame_count);
            if offset + self.frame_size() > len {
                break;
            }
            let (header, data) = self.read_frame_raw(self.frame_count + 1)?;

            let page_no = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let salt1 = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let salt2 = u32::from_le_bytes(header[12..16].try_into().unwrap());
            let stored = (
                u32::from_le_bytes(header[16..20].try_into().unwrap()),
                u32::from_le_bytes(header[20..24].try_into().unwrap()),
            );
            if page_no == 0 || salt1 != self.salt1 || salt2 != self.salt2 {
                break;
            }
            let seed = *self.cksums.last().unwrap();
            let computed = checksum(checksum(seed, &header[0..8]), &data);
            if computed != stored {
                break;
            }
            self.cksums.push(computed);
            self.frame_count += 1;
        }
        Ok(())
    }

    /// Reads frame bytes without validation. `frame_no` is 1-based and
    /// must already be known to sit inside the file.
    fn read_frame_raw(&mut self, frame_no: FrameNo) -> DbResult<([u8; FRAME_HEADER_SIZE], Vec<u8>)> {
        let offset = self.frame_offset(frame_no - 1);
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut data = vec![0u8; self.page_size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut header)?;
        self.file.read_exact(&mut data)?;
        Ok((header, data))
    }

    /// Writes the final image of every page in frames 1..=limit to the
    /// main file and syncs it.
    fn apply_frames(&mut self, backend: &mut dyn StorageBackend, limit: u32) -> DbResult<usize> {
        let mut latest = std::collections::BTreeMap::new();
        for frame_no in 1..=limit {
            let (header, data) = self.read_frame_raw(frame_no)?;
            let page_no = u32::from_le_bytes(header[0..4].try_into().unwrap());
            latest.insert(page_no, data);
        }

        let page_size = self.page_size as u64;
        let applied = latest.len();
        for (page_no, data) in latest {
            let offset = (page_no as u64 - 1) * page_size;
            if offset + page_size > backend.len() {
                backend.grow(offset + page_size)?;
            }
            backend
                .slice_mut(offset, data.len())
                .ok_or_else(|| {
                    DbError::Wal(format!("frame page {page_no} lies outside the main file"))
                })?
                .copy_from_slice(&data);
        }
        backend.sync()?;
        Ok(applied)
    }

    /// Empties the log: bumps the checkpoint sequence, advances salt1,
    /// re-randomizes salt2 (which invalidates every existing frame),
    /// rewrites the header, and truncates to the header.
    fn reset(&mut self) -> DbResult<()> {
        self.checkpoint_seq += 1;
        self.salt1 = self.salt1.wrapping_add(1);
        self.salt2 = rand::rng().random();
        self.frame_count = 0;
        self.write_header()
    }

    /// Rewrites the 32-byte header, truncates the file to it, and syncs.
    fn write_header(&mut self) -> DbResult<()> {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checkpoint_seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.salt1.to_le_bytes());
        buf[20..24].copy_from_slice(&self.salt2.to_le_bytes());
        let cksum = checksum((0, 0), &buf[0..24]);
        buf[24..28].copy_from_slice(&cksum.0.to_le_bytes());
        buf[28..32].copy_from_slice(&cksum.1.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.sync_all()?;

        self.cksums.clear();
        self.cksums.push(cksum);
        Ok(())
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("Wal")
            .field("path", &inner.path)
            .field("page_size", &inner.page_size)
            .field("checkpoint_seq", &inner.checkpoint_seq)
            .field("frame_count", &inner.frame_count)
            .finish()
    }
}
