use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use common::PageNo;

/// Shared handle to a cached page.
pub type PageRef = Arc<Page>;

/// Page content tag, stored as the first byte of the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Unknown = 0,
    BtreeInterior = 1,
    BtreeLeaf = 2,
    HnswNode = 3,
    HnswMeta = 4,
    Overflow = 5,
    Freelist = 6,
}

impl PageKind {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => PageKind::BtreeInterior,
            2 => PageKind::BtreeLeaf,
            3 => PageKind::HnswNode,
            4 => PageKind::HnswMeta,
            5 => PageKind::Overflow,
            6 => PageKind::Freelist,
            _ => PageKind::Unknown,
        }
    }
}

enum PageBuf {
    /// A view into the storage backend's mapping. Valid only until the
    /// backend grows; the pager drains its cache before that happens.
    Mapped { ptr: *mut u8, len: usize },
    /// An owned buffer, used by fixtures that have no backend.
    Owned(UnsafeCell<Box<[u8]>>),
}

/// A fixed-size page with pin and dirty state.
///
/// The buffer either borrows the backend mapping (pager-owned pages) or
/// owns its bytes (test fixtures). Pin count and dirty flag are atomics so
/// a [`PageRef`] can cross the pager's lock boundary.
///
/// Byte access hands out overlapping views on purpose: the pager
/// serializes all mutation behind its write lock, which is the same
/// discipline the mapping itself requires.
pub struct Page {
    page_no: PageNo,
    buf: PageBuf,
    dirty: AtomicBool,
    pins: AtomicU32,
}

// The raw pointer variant is as sendable as the backend mapping it points
// into; coordination is the pager's job.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Wraps `len` bytes of backend mapping starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for `len` bytes for the lifetime of the page,
    /// and all access must be serialized by the caller. The pager upholds
    /// both: pages live in its cache, which it drains before any remap.
    pub unsafe fn from_raw(page_no: PageNo, ptr: *mut u8, len: usize) -> Self {
        Self {
            page_no,
            buf: PageBuf::Mapped { ptr, len },
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    /// A standalone zeroed page that owns its buffer.
    pub fn fixture(page_no: PageNo, size: usize) -> Self {
        Self {
            page_no,
            buf: PageBuf::Owned(UnsafeCell::new(vec![0u8; size].into_boxed_slice())),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            PageBuf::Mapped { len, .. } => *len,
            PageBuf::Owned(buf) => unsafe { (&*buf.get()).len() },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.buf {
            PageBuf::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            PageBuf::Owned(buf) => unsafe { &*buf.get() },
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self) -> &mut [u8] {
        match &self.buf {
            PageBuf::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
            PageBuf::Owned(buf) => unsafe { &mut *buf.get() },
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn kind(&self) -> PageKind {
        PageKind::from_byte(self.bytes()[0])
    }

    pub fn set_kind(&self, kind: PageKind) {
        self.bytes_mut()[0] = kind as u8;
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the pin count; a no-op at zero.
    pub fn unpin(&self) {
        let _ = self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| {
                pins.checked_sub(1)
            });
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("page_no", &self.page_no)
            .field("len", &self.len())
            .field("dirty", &self.is_dirty())
            .field("pins", &self.pin_count())
            .finish()
    }
}
