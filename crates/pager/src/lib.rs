//! Buffered page access with transactions, built on a storage backend and
//! a write-ahead log.
//!
//! The pager owns the main database file. It serves pages as views into
//! the backend's mapping through an LRU cache, allocates and frees page
//! numbers through the on-disk freelist, and provides one-at-a-time write
//! transactions: dirty pages are captured before mutation, written to the
//! WAL on commit, and restored byte-for-byte on rollback. Opening a
//! database replays any committed WAL frames left by a crash before the
//! first page is served.
//!
//! # Example
//!
//! ```no_run
//! use common::PagerOptions;
//! use pager::Pager;
//!
//! let pager = Pager::open("data/main.tusk", PagerOptions::default(), None).unwrap();
//! let tx = pager.begin_write().unwrap();
//! let page = pager.allocate().unwrap();
//! pager.mark_dirty(&page).unwrap();
//! page.bytes_mut()[0] = 42;
//! pager.release(&page);
//! pager.commit(tx).unwrap();
//! pager.close().unwrap();
//! ```
//!
//! # Pins and growth
//!
//! A pinned page is never evicted. Growing the backend, however, remaps
//! it and invalidates every outstanding page view, so the cache is
//! drained first; callers must not hold a page across an
//! [`allocate`](Pager::allocate) call that can grow the file. This is
//! part of the pager's public contract.


mod freelist;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use budget::{MemoryBudget, Priority};
use common::{DbError, DbResult, PageNo, PagerOptions};
use freelist::Freelist;
use lru::LruCache;
use storage::{
    DbHeader, HEADER_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, MemStorage, MmapStorage, Page, PageRef,
    StorageBackend,
};
use wal::Wal;

/// Budget component name the pager registers and accounts under.
const BUDGET_COMPONENT: &str = "page_cache";

/// Cache hit/miss/eviction counters, monotone over the pager's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
}

/// Token for the single active write transaction.
///
/// Obtained from [`Pager::begin_write`] and consumed by [`Pager::commit`]
/// or [`Pager::rollback`]. Dropping it without either leaves the
/// transaction open; [`Pager::close`] aborts such a transaction by
/// restoring its pre-images.
#[must_use = "a write transaction must be committed or rolled back"]
#[derive(Debug)]
pub struct WriteTransaction {
    _private: (),
}

#[derive(Default)]
struct TxState {
    /// Pre-images of pages captured by `mark_dirty`, keyed in page order
    /// so commit emits frames deterministically.
    original_pages: BTreeMap<u32, Vec<u8>>,
}

struct PagerInner {
    backend: Box<dyn StorageBackend>,
    wal: Option<Wal>,
    header: DbHeader,
    page_size: usize,
    cache: LruCache<u32, PageRef>,
    cache_capacity: usize,
    freelist: Freelist,
    tx: Option<TxState>,
    budget: Option<MemoryBudget>,
    read_only: bool,
    closed: bool,
    stats: PagerStats,
}

/// The central page store over one database file.
///
/// All state sits behind a single readers-writer lock; observers take the
/// read side, everything that touches the cache, the freelist, or the
/// files takes the write side.
pub struct Pager {
    inner: RwLock<PagerInner>,
}

impl Pager {
    /// Opens (or creates) the database at `path` together with its
    /// companion WAL at `path + "-wal"`. Committed WAL frames left over
    /// from a crash are replayed before this returns. If a `budget` is
    /// given, the pager registers the `"page_cache"` component with it
    /// and lets it drive eviction.
    pub fn open(
        path: impl AsRef<Path>,
        opts: PagerOptions,
        budget: Option<MemoryBudget>,
    ) -> DbResult<Pager> {
        let path = path.as_ref();
        validate_page_size(opts.page_size)?;
        if opts.read_only && !path.exists() {
            return Err(DbError::StorageOpen(format!(
                "{}: no such database",
                path.display()
            )));
        }
        let backend = MmapStorage::open(path, opts.page_size as u64)?;

        let mut wal_os = path.as_os_str().to_os_string();
        wal_os.push("-wal");
        let wal_path = PathBuf::from(wal_os);

        Self::setup(Box::new(backend), Some(wal_path), opts, budget)
    }

    /// An in-memory database: no backing file and no WAL. Commit still
    /// clears dirty state, but durability ends with the process.
    pub fn open_memory(opts: PagerOptions, budget: Option<MemoryBudget>) -> DbResult<Pager> {
        validate_page_size(opts.page_size)?;
        let backend = MemStorage::new(opts.page_size as u64);
        Self::setup(Box::new(backend), None, opts, budget)
    }

    fn setup(
        mut backend: Box<dyn StorageBackend>,
        wal_path: Option<PathBuf>,
        opts: PagerOptions,
        budget: Option<MemoryBudget>,
    ) -> DbResult<Pager> {
        assert!(opts.cache_size > 0, "cache_size must be > 0");

        let header_bytes = backend
            .slice(0, HEADER_SIZE)
            .ok_or(DbError::HeaderTooShort(backend.len() as usize))?;

        let mut header = if header_bytes.iter().all(|b| *b == 0) {
            // Fresh file: stamp a new single-page database.
            if opts.read_only {
                return Err(DbError::ReadOnly);
            }
            let header = DbHeader::new(opts.page_size);
            backend
                .slice_mut(0, HEADER_SIZE)
                .unwrap()
                .copy_from_slice(&header.encode());
            backend.sync()?;
            log::info!("created database with page size {}", opts.page_size);
            header
        } else {
            let header = DbHeader::decode(header_bytes)?;
            header.validate()?;
            header
        };

        // The header's page size wins over the options once the file
        // exists; it is immutable after create.
        let page_size = header.page_size as usize;

        let wal = match (&wal_path, opts.read_only) {
            (Some(path), false) => Some(Wal::open(path, header.page_size)?),
            (Some(path), true) => {
                if std::fs::metadata(path).map_or(0, |m| m.len()) > wal::WAL_HEADER_SIZE as u64 {
                    log::warn!(
                        "read-only open leaves wal frames in {} unrecovered",
                        path.display()
                    );
                }
                None
            }
            (None, _) => None,
        };

        if let Some(wal) = &wal {
            if wal.frame_count() > 0 {
                let db_size = wal.recover(&mut *backend)?;
                if db_size > 0 {
                    // The replay may have rewritten page 0; re-read the
                    // header and adopt the recovered page count, which can
                    // be newer than the header's if the crash lost the
                    // header write.
                    let bytes = backend.slice(0, HEADER_SIZE).unwrap();
                    header = DbHeader::decode(bytes)?;
                    header.validate()?;
                    if db_size > header.page_count {
                        header.page_count = db_size;
                    }
                    backend
                        .slice_mut(0, HEADER_SIZE)
                        .unwrap()
                        .copy_from_slice(&header.encode());
                    backend.sync()?;
                }
            }
        }

        let freelist = Freelist::load(&*backend, &header)?;

        if let Some(budget) = &budget {
            budget.register_component(BUDGET_COMPONENT);
        }

        Ok(Pager {
            inner: RwLock::new(PagerInner {
                backend,
                wal,
                header,
                page_size,
                cache: LruCache::unbounded(),
                cache_capacity: opts.cache_size,
                freelist,
                tx: None,
                budget,
                read_only: opts.read_only,
                closed: false,
                stats: PagerStats::default(),
            }),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.inner.read().unwrap().header.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.inner.read().unwrap().header.page_count
    }

    pub fn free_page_count(&self) -> u32 {
        self.inner.read().unwrap().freelist.count()
    }

    pub fn stats(&self) -> PagerStats {
        self.inner.read().unwrap().stats
    }

    /// Number of frames currently in the WAL; 0 for in-memory databases.
    pub fn wal_frame_count(&self) -> u32 {
        self.inner
            .read()
            .unwrap()
            .wal
            .as_ref()
            .map_or(0, |w| w.frame_count())
    }

    /// Returns a pinned, zeroed page: a recycled freelist page if one is
    /// available (LIFO), otherwise a page grown from the file tail.
    ///
    /// Growth remaps the backend and drains the page cache, so callers
    /// must not hold any other page across this call.
    pub fn allocate(&self) -> DbResult<PageRef> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        inner.ensure_writable()?;

        let page_no = match inner.take_from_freelist()? {
            Some(page_no) => page_no,
            None => inner.grow_by_one_page()?,
        };

        let offset = page_no.0 as u64 * inner.page_size as u64;
        let page_size = inner.page_size;
        inner
            .backend
            .slice_mut(offset, page_size)
            .ok_or(DbError::PageNotFound(page_no))?
            .fill(0);

        inner.write_header_bytes();
        inner.install_page(page_no)
    }

    /// Fetches a page, pinning it. Cache hits move the page to the MRU
    /// position; misses read through the backend and may evict.
    pub fn get(&self, page_no: PageNo) -> DbResult<PageRef> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        if page_no.0 >= inner.header.page_count {
            return Err(DbError::PageNotFound(page_no));
        }

        if let Some(page) = inner.cache.get(&page_no.0).cloned() {
            inner.stats.cache_hits += 1;
            if let Some(budget) = &inner.budget {
                budget.record_access(BUDGET_COMPONENT, page_no.0 as u64);
            }
            page.pin();
            return Ok(page);
        }

        inner.stats.cache_misses += 1;
        inner.install_page(page_no)
    }

    /// Unpins a page previously returned by [`get`](Self::get) or
    /// [`allocate`](Self::allocate). The page stays cached.
    pub fn release(&self, page: &Page) {
        page.unpin();
    }

    /// Returns `page_no` to the freelist, dropping it from the cache
    /// first. Page 0 and pages beyond the end of the file are rejected.
    pub fn free(&self, page_no: PageNo) -> DbResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        inner.ensure_writable()?;
        if page_no.0 == 0 {
            return Err(DbError::Storage(
                "page 0 holds the database header and cannot be freed".into(),
            ));
        }
        if page_no.0 >= inner.header.page_count {
            return Err(DbError::PageNotFound(page_no));
        }

        if inner.cache.pop(&page_no.0).is_some() {
            if let Some(budget) = &inner.budget {
                budget.release_item(BUDGET_COMPONENT, page_no.0 as u64);
            }
        }

        let PagerInner {
            backend,
            header,
            freelist,
            ..
        } = &mut *inner;
        freelist.free(&mut **backend, header, page_no)?;
        inner.write_header_bytes();
        Ok(())
    }

    /// Inside an active write transaction, captures the page's pre-image
    /// (once) and marks it dirty. Outside a transaction this is a no-op.
    pub fn mark_dirty(&self, page: &Page) -> DbResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        if let Some(tx) = &mut inner.tx {
            tx.original_pages
                .entry(page.page_no().0)
                .or_insert_with(|| page.bytes().to_vec());
            page.set_dirty(true);
        }
        Ok(())
    }

    /// Starts the single write transaction.
    pub fn begin_write(&self) -> DbResult<WriteTransaction> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        inner.ensure_writable()?;
        if inner.tx.is_some() {
            return Err(DbError::TxAlreadyActive);
        }
        inner.tx = Some(TxState::default());
        Ok(WriteTransaction { _private: () })
    }

    /// Commits: every still-dirty captured page is appended to the WAL in
    /// page order, the last frame carrying the post-commit page count and
    /// forcing the sync that makes the batch durable.
    pub fn commit(&self, tx: WriteTransaction) -> DbResult<()> {
        drop(tx);
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        let Some(tx) = inner.tx.take() else {
            return Err(DbError::NoTransaction);
        };

        let mut dirty: Vec<PageRef> = Vec::new();
        for &page_no in tx.original_pages.keys() {
            if let Some(page) = inner.cache.peek(&page_no) {
                if page.is_dirty() {
                    dirty.push(page.clone());
                }
            }
        }

        if let Some(wal) = &inner.wal {
            let db_size = inner.header.page_count;
            for (i, page) in dirty.iter().enumerate() {
                let commit_size = if i + 1 == dirty.len() { db_size } else { 0 };
                // WAL frames address pages 1-based.
                wal.write_frame(page.page_no().0 + 1, page.bytes(), commit_size)?;
            }
        }
        for page in &dirty {
            page.set_dirty(false);
        }

        inner.header.change_counter = inner.header.change_counter.wrapping_add(1);
        inner.write_header_bytes();
        log::debug!("committed {} pages", dirty.len());
        Ok(())
    }

    /// Rolls back: every captured page is restored byte-for-byte and its
    /// dirty flag cleared. The WAL is never touched. A no-op on a closed
    /// pager.
    pub fn rollback(&self, tx: WriteTransaction) -> DbResult<()> {
        drop(tx);
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Ok(());
        }
        if inner.tx.is_none() {
            return Err(DbError::NoTransaction);
        }
        inner.abort_tx();
        Ok(())
    }

    /// Applies all WAL frames to the main file and resets the WAL.
    /// Returns the number of distinct pages written back.
    pub fn checkpoint(&self) -> DbResult<usize> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        inner.ensure_writable()?;
        let PagerInner { backend, wal, .. } = &mut *inner;
        match wal {
            Some(wal) => wal.checkpoint(&mut **backend),
            None => Ok(0),
        }
    }

    /// Writes the header and flushes the backend.
    pub fn sync(&self) -> DbResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.ensure_open()?;
        inner.write_header_bytes();
        inner.backend.sync()
    }

    /// Closes the WAL, writes the header, syncs and closes the backend.
    /// An abandoned write transaction is aborted first. Closing twice is
    /// a no-op.
    pub fn close(&self) -> DbResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Ok(());
        }
        if inner.tx.is_some() {
            log::warn!("closing with an abandoned write transaction; rolling it back");
            inner.abort_tx();
        }
        if let Some(wal) = inner.wal.take() {
            wal.sync()?;
        }
        inner.write_header_bytes();
        inner.drain_cache();
        inner.backend.sync()?;
        inner.backend.close()?;
        inner.closed = true;
        Ok(())
    }
}

impl PagerInner {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            Err(DbError::Storage("pager is closed".into()))
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> DbResult<()> {
        if self.read_only {
            Err(DbError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Copies the in-memory header into page 0 of the mapping. Durability
    /// comes from the next sync.
    fn write_header_bytes(&mut self) {
        if self.read_only {
            return;
        }
        if let Some(slice) = self.backend.slice_mut(0, HEADER_SIZE) {
            slice.copy_from_slice(&self.header.encode());
        }
    }

    fn take_from_freelist(&mut self) -> DbResult<Option<PageNo>> {
        let PagerInner {
            backend,
            header,
            freelist,
            ..
        } = self;
        freelist.allocate(&mut **backend, header)
    }

    /// Appends a page to the file, growing the backend when the required
    /// byte size exceeds it (by at least 10%, rounded up to whole pages).
    /// Growth invalidates every view into the mapping, so the cache is
    /// drained first.
    fn grow_by_one_page(&mut self) -> DbResult<PageNo> {
        let page_no = PageNo(self.header.page_count);
        self.header.page_count += 1;

        let page_size = self.page_size as u64;
        let required = self.header.page_count as u64 * page_size;
        let current = self.backend.len();
        if required > current {
            let target = required.max(current + current / 10);
            let target = target.div_ceil(page_size) * page_size;
            self.drain_cache();
            self.backend.grow(target)?;
        }
        Ok(page_no)
    }

    /// Builds a page over the backend mapping, caches it pinned, accounts
    /// it with the budget, and runs the eviction sweep.
    fn install_page(&mut self, page_no: PageNo) -> DbResult<PageRef> {
        let offset = page_no.0 as u64 * self.page_size as u64;
        let slice = self
            .backend
            .slice_mut(offset, self.page_size)
            .ok_or(DbError::PageNotFound(page_no))?;
        // SAFETY: the pointer stays valid because the cache (which owns
        // every mapped page) is drained before the backend grows or
        // closes, and all page access is serialized by the pager's lock.
        let page: PageRef =
            Arc::new(unsafe { Page::from_raw(page_no, slice.as_mut_ptr(), self.page_size) });

        page.pin();
        self.cache.push(page_no.0, page.clone());
        if let Some(budget) = &self.budget {
            budget.track_with_priority(
                BUDGET_COMPONENT,
                page_no.0 as u64,
                self.page_size as u64,
                Priority::Cold,
            );
        }
        self.evict_if_needed();
        Ok(page)
    }

    /// Trims the LRU tail while the cache is over capacity or the budget
    /// reports exceeded. A pinned tail is rotated to the MRU position and
    /// stops the sweep.
    fn evict_if_needed(&mut self) {
        loop {
            let over_capacity = self.cache.len() > self.cache_capacity;
            let over_budget = self.budget.as_ref().is_some_and(|b| b.is_exceeded());
            if !over_capacity && !over_budget {
                break;
            }

            let Some((tail_no, pinned)) = self.cache.peek_lru().map(|(no, page)| (*no, page.is_pinned()))
            else {
                break;
            };
            if pinned {
                self.cache.promote(&tail_no);
                break;
            }

            self.cache.pop(&tail_no);
            if let Some(budget) = &self.budget {
                budget.release_item(BUDGET_COMPONENT, tail_no as u64);
            }
            self.stats.evictions += 1;
        }
    }

    /// Drops every cache entry and its budget item.
    fn drain_cache(&mut self) {
        if let Some(budget) = &self.budget {
            for (page_no, _) in self.cache.iter() {
                budget.release_item(BUDGET_COMPONENT, *page_no as u64);
            }
        }
        self.cache.clear();
    }

    /// Restores the active transaction's pre-images and clears it.
    fn abort_tx(&mut self) {
        let Some(tx) = self.tx.take() else { return };
        for (page_no, original) in tx.original_pages {
            let cached = self.cache.peek(&page_no).cloned();
            match cached {
                Some(page) => {
                    page.bytes_mut().copy_from_slice(&original);
                    page.set_dirty(false);
                }
                None => {
                    // Evicted since capture: restore straight through the
                    // backend, where the mutated bytes live.
                    let offset = page_no as u64 * self.page_size as u64;
                    if let Some(slice) = self.backend.slice_mut(offset, original.len()) {
                        slice.copy_from_slice(&original);
                    }
                }
            }
        }
    }
}

fn validate_page_size(page_size: u32) -> DbResult<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(DbError::InvalidPageSize(page_size));
    }
    Ok(())
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("Pager")
            .field("page_size", &inner.header.page_size)
            .field("page_count", &inner.header.page_count)
            .field("cached_pages", &inner.cache.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
