
use std::{fmt, io};
use thiserror::Error;

/// Zero-based page number in the main database file.
///
/// Page 0 always holds the file header and is never handed out by the
/// allocator or returned to the freelist.
/// Examples:
/// - `let header_page = PageNo(0);`
/// - `let first_data_page = PageNo(1);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNo(pub u32);

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-based frame index in the write-ahead log.
pub type FrameNo = u32;

/// Canonical error type shared across the storage subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("not a tusk database (bad magic)")]
    InvalidMagic,
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),
    #[error("invalid page size {0}")]
    InvalidPageSize(u32),
    #[error("invalid format version {0}")]
    InvalidFormatVersion(u8),
    #[error("unsupported format version {0} (newest supported is {1})")]
    UnsupportedVersion(u8, u8),
    #[error("invalid page count {0}")]
    InvalidPageCount(u32),
    #[error("page {0} not found")]
    PageNotFound(PageNo),
    #[error("write transaction already active")]
    TxAlreadyActive,
    #[error("no active write transaction")]
    NoTransaction,
    #[error("checksum mismatch in wal frame {0}")]
    ChecksumFailed(FrameNo),
    #[error("wal frame {0} not found")]
    FrameNotFound(FrameNo),
    #[error("failed to open storage: {0}")]
    StorageOpen(String),
    #[error("database is read-only")]
    ReadOnly,
    #[error("storage: {0}")]
    Storage(String),
    #[error("wal: {0}")]
    Wal(String),
    #[error("record: {0}")]
    Record(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Options recognized by the pager.
///
/// # Example
/// ```
/// use common::PagerOptions;
///
/// let opts = PagerOptions::builder()
///     .page_size(8192)
///     .cache_size(64)
///     .build();
/// assert!(!opts.read_only);
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct PagerOptions {
    /// Page size in bytes; a power of two in 512..=65536.
    #[builder(default = 4096)]
    pub page_size: u32,
    /// Number of pages the cache keeps resident before the eviction
    /// sweep starts trimming the LRU tail.
    #[builder(default = 1000)]
    pub cache_size: usize,
    /// Opens the database without write access; mutators fail with
    /// `DbError::ReadOnly`.
    #[builder(default = false)]
    pub read_only: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_size: 1000,
            read_only: false,
        }
    }
}

/// Options recognized by the memory budget.
#[derive(Clone, Debug, bon::Builder)]
pub struct BudgetOptions {
    /// Total byte limit shared by all registered components.
    #[builder(default = 256 * 1024 * 1024)]
    pub limit: u64,
    /// Fraction of the limit at which the budget reports pressure.
    #[builder(default = 0.8)]
    pub pressure_threshold: f64,
}

impl Default for BudgetOptions {
    fn default() -> Self {
        Self {
            limit: 256 * 1024 * 1024,
            pressure_threshold: 0.8,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{BudgetOptions, DbError, DbResult, FrameNo, PageNo, PagerOptions};
}
