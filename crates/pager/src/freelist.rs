//! On-disk free page allocator.
//!
//! Freed page numbers are kept inside the file itself, in a chain of
//! trunk pages. A trunk stores, big-endian: the next trunk's page number
//! (0 terminates the chain), a leaf count, and that many leaf page
//! numbers. The trunk page is itself a free page, so the header's free
//! page count is leaves plus trunks.
//!
//! Frees push onto the head trunk until it is full, at which point the
//! freed page becomes the new head. Allocation pops leaves LIFO and, once
//! a trunk runs dry, hands the trunk page itself to the caller and
//! advances the head.

use common::{DbError, DbResult, PageNo};
use storage::{DbHeader, StorageBackend};

/// In-memory mirror of one trunk page.
struct Trunk {
    page_no: u32,
    next: u32,
    leaves: Vec<u32>,
}

impl Trunk {
    fn decode(page_no: u32, bytes: &[u8]) -> DbResult<Self> {
        let next = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let leaf_count = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if 8 + leaf_count * 4 > bytes.len() {
            return Err(DbError::Storage(format!(
                "freelist trunk {page_no} claims {leaf_count} leaves"
            )));
        }
        let leaves = (0..leaf_count)
            .map(|i| {
                let at = 8 + i * 4;
                u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
            })
            .collect();
        Ok(Self {
            page_no,
            next,
            leaves,
        })
    }

    /// Writes this trunk's chain pointer, leaf count, and leaves back to
    /// its page.
    fn write(&self, backend: &mut dyn StorageBackend, page_size: usize) -> DbResult<()> {
        let offset = self.page_no as u64 * page_size as u64;
        let bytes = backend.slice_mut(offset, page_size).ok_or_else(|| {
            DbError::Storage(format!("freelist trunk {} outside the file", self.page_no))
        })?;
        bytes[0..4].copy_from_slice(&self.next.to_be_bytes());
        bytes[4..8].copy_from_slice(&(self.leaves.len() as u32).to_be_bytes());
        for (i, leaf) in self.leaves.iter().enumerate() {
            let at = 8 + i * 4;
            bytes[at..at + 4].copy_from_slice(&leaf.to_be_bytes());
        }
        Ok(())
    }
}

/// The freelist chain, mirrored in memory with the head trunk first.
pub(crate) struct Freelist {
    trunks: Vec<Trunk>,
    count: u32,
    page_size: usize,
}

impl Freelist {
    /// Walks the chain starting at the header's freelist head.
    pub fn load(backend: &dyn StorageBackend, header: &DbHeader) -> DbResult<Self> {
        let page_size = header.page_size as usize;
        let mut trunks = Vec::new();
        let mut next = header.freelist_head;
        while next != 0 {
            // A corrupt chain could cycle; the recorded count bounds it.
            if trunks.len() as u32 >= header.freelist_count.max(1) {
                return Err(DbError::Storage(
                    "freelist chain is longer than the recorded free page count".into(),
                ));
            }
            let bytes = backend
                .slice(next as u64 * page_size as u64, page_size)
                .ok_or_else(|| {
                    DbError::Storage(format!("freelist trunk {next} outside the file"))
                })?;
            let trunk = Trunk::decode(next, bytes)?;
            let following = trunk.next;
            trunks.push(trunk);
            next = following;
        }
        Ok(Self {
            trunks,
            count: header.freelist_count,
            page_size,
        })
    }

    pub fn new_empty(page_size: usize) -> Self {
        Self {
            trunks: Vec::new(),
            count: 0,
            page_size,
        }
    }

    /// Total free pages: leaves plus the trunk pages carrying them.
    pub fn count(&self) -> u32 {
        self.count
    }

    fn max_leaves(&self) -> usize {
        (self.page_size - 8) / 4
    }

    /// Returns `page_no` to the chain and updates the header fields.
    pub fn free(
        &mut self,
        backend: &mut dyn StorageBackend,
        header: &mut DbHeader,
        page_no: PageNo,
    ) -> DbResult<()> {
        let head_has_room = self
            .trunks
            .first()
            .is_some_and(|t| t.leaves.len() < self.max_leaves());

        if head_has_room {
            let trunk = &mut self.trunks[0];
            trunk.leaves.push(page_no.0);
            trunk.write(backend, self.page_size)?;
        } else {
            // Empty chain, or the head trunk is full: the freed page
            // becomes the new head trunk.
            let trunk = Trunk {
                page_no: page_no.0,
                next: self.trunks.first().map_or(0, |t| t.page_no),
                leaves: Vec::new(),
            };
            trunk.write(backend, self.page_size)?;
            self.trunks.insert(0, trunk);
        }

        self.count += 1;
        header.freelist_head = self.trunks[0].page_no;
        header.freelist_count = self.count;
        Ok(())
    }

    /// Pops a free page LIFO: the head trunk's newest leaf, or the trunk
    /// page itself once its leaves are gone. `None` when the chain is
    /// empty.
    pub fn allocate(
        &mut self,
        backend: &mut dyn StorageBackend,
        header: &mut DbHeader,
    ) -> DbResult<Option<PageNo>> {
        let Some(head) = self.trunks.first_mut() else {
            return Ok(None);
        };

        let page_no = match head.leaves.pop() {
            Some(leaf) => {
                head.write(backend, self.page_size)?;
                leaf
            }
            None => {
                let trunk = self.trunks.remove(0);
                trunk.page_no
            }
        };

        self.count -= 1;
        header.freelist_head = self.trunks.first().map_or(0, |t| t.page_no);
        header.freelist_count = self.count;
        Ok(Some(PageNo(page_no)))
    }
}
