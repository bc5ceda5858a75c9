//! Embedded single-file page store: the public face of the workspace.
//!
//! A [`Database`] wires a shared [`MemoryBudget`] to a [`Pager`] over one
//! database file and its companion write-ahead log. Page-level access,
//! transactions, and checkpointing are all reached through the pager;
//! the record codec for what clients put *inside* pages lives in
//! [`codec`].
//!
//! # Example
//!
//! ```no_run
//! use tusk::{Database, DatabaseOptions};
//!
//! let db = Database::open("data/main.tusk", DatabaseOptions::default()).unwrap();
//! let tx = db.pager().begin_write().unwrap();
//! let page = db.pager().allocate().unwrap();
//! db.pager().mark_dirty(&page).unwrap();
//! page.bytes_mut()[16] = 1;
//! db.pager().release(&page);
//! db.pager().commit(tx).unwrap();
//! db.close().unwrap();
//! ```


use std::path::Path;

use budget::MemoryBudget;
use common::{BudgetOptions, DbResult, PagerOptions};
use pager::Pager;

pub use budget::Priority;
pub use common::prelude::*;
pub use pager::{PagerStats, WriteTransaction};
pub use storage::{Page, PageKind, PageRef};

/// Record codec, re-exported for clients assembling page payloads.
pub mod codec {
    pub use record::{Value, decode, encode, read_varint, varint_len, write_varint};
}

/// Combined configuration for a database handle.
#[derive(Clone, Debug, Default)]
pub struct DatabaseOptions {
    pub pager: PagerOptions,
    pub budget: BudgetOptions,
}

/// One open database: a pager plus the memory budget it shares with any
/// other caches the process runs.
pub struct Database {
    pager: Pager,
    budget: MemoryBudget,
}

impl Database {
    /// Opens (or creates) the database at `path`, recovering any
    /// committed WAL frames first.
    pub fn open(path: impl AsRef<Path>, opts: DatabaseOptions) -> DbResult<Database> {
        let budget = MemoryBudget::new(opts.budget);
        let pager = Pager::open(path, opts.pager, Some(budget.clone()))?;
        Ok(Database { pager, budget })
    }

    /// An in-memory database with no backing file.
    pub fn open_memory(opts: DatabaseOptions) -> DbResult<Database> {
        let budget = MemoryBudget::new(opts.budget);
        let pager = Pager::open_memory(opts.pager, Some(budget.clone()))?;
        Ok(Database { pager, budget })
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// The budget shared by the page cache; other components (a query
    /// cache, for instance) can register themselves here too.
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Applies the WAL to the main file and resets it.
    pub fn checkpoint(&self) -> DbResult<usize> {
        self.pager.checkpoint()
    }

    pub fn close(&self) -> DbResult<()> {
        self.pager.close()
    }
}
