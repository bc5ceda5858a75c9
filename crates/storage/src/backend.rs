use std::fs::{File, OpenOptions};
use std::path::Path;

use common::{DbError, DbResult};
use memmap2::MmapMut;

/// A byte-addressable, growable region backing one database file.
///
/// Slices borrow from the backend and are invalidated by [`grow`]; the
/// pager drains its page cache before growing, which is what makes the
/// raw views it hands out sound.
///
/// [`grow`]: StorageBackend::grow
pub trait StorageBackend: Send + Sync {
    /// Current length of the region in bytes.
    fn len(&self) -> u64;

    /// Borrow `len` bytes starting at `offset`. `None` signals a caller
    /// bounds violation, not an error.
    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]>;

    /// Mutable variant of [`slice`](StorageBackend::slice).
    fn slice_mut(&mut self, offset: u64, len: usize) -> Option<&mut [u8]>;

    /// Flush the region to durable storage.
    fn sync(&mut self) -> DbResult<()>;

    /// Extend the region to `new_len` bytes. Every slice previously
    /// returned is invalid afterwards.
    fn grow(&mut self, new_len: u64) -> DbResult<()>;

    /// Flush and release the region. Further calls are no-ops.
    fn close(&mut self) -> DbResult<()>;
}

/// File-backed storage that maps the whole file into the address space.
#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    map: Option<MmapMut>,
}

impl MmapStorage {
    /// Opens (or creates) `path` and maps it. A freshly created file is
    /// extended to `min_len` bytes so a new database maps one full page;
    /// an existing file keeps its length.
    pub fn open(path: &Path, min_len: u64) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DbError::StorageOpen(format!("{}: {e}", path.display())))?;

        let file_len = file
            .metadata()
            .map_err(|e| DbError::StorageOpen(e.to_string()))?
            .len();
        let len = if file_len == 0 { min_len } else { file_len };
        if len == 0 {
            return Err(DbError::StorageOpen(
                "refusing to map a zero-length file".into(),
            ));
        }
        if len != file_len {
            file.set_len(len)?;
        }

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| DbError::StorageOpen(format!("mmap {}: {e}", path.display())))?;
        Ok(Self {
            file,
            map: Some(map),
        })
    }
}

impl StorageBackend for MmapStorage {
    fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let map = self.map.as_ref()?;
        let start = usize::try_from(offset).ok()?;
        map.get(start..start.checked_add(len)?)
    }

    fn slice_mut(&mut self, offset: u64, len: usize) -> Option<&mut [u8]> {
        let map = self.map.as_mut()?;
        let start = usize::try_from(offset).ok()?;
        map.get_mut(start..start.checked_add(len)?)
    }

    fn sync(&mut self) -> DbResult<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn grow(&mut self, new_len: u64) -> DbResult<()> {
        // The old mapping must be flushed and dropped before the file
        // changes length; remapping moves the region.
        if let Some(map) = self.map.take() {
            map.flush()?;
            drop(map);
        }
        self.file.set_len(new_len)?;
        self.file.sync_all()?;
        let map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| DbError::Storage(format!("remap to {new_len} bytes: {e}")))?;
        self.map = Some(map);
        log::debug!("storage grown to {new_len} bytes");
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory storage over a contiguous buffer; `sync` is a no-op.
pub struct MemStorage {
    buf: Vec<u8>,
}

impl MemStorage {
    pub fn new(len: u64) -> Self {
        Self {
            buf: vec![0; len as usize],
        }
    }
}

impl StorageBackend for MemStorage {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.buf.get(start..start.checked_add(len)?)
    }

    fn slice_mut(&mut self, offset: u64, len: usize) -> Option<&mut [u8]> {
        let start = usize::try_from(offset).ok()?;
        self.buf.get_mut(start..start.checked_add(len)?)
    }

    fn sync(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn grow(&mut self, new_len: u64) -> DbResult<()> {
        let mut next = vec![0u8; new_len as usize];
        next[..self.buf.len()].copy_from_slice(&self.buf);
        self.buf = next;
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}
