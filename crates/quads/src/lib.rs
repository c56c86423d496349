//! An embedded, crash-safe, bitemporal RDF quad store.
//!
//! Quads are (graph, subject, predicate, object) tuples of interned
//! [`atoms::Atom`]s carrying a half-open validity interval
//! `[valid_from, valid_to)` and a transaction timestamp. The primary
//! index is a B+Tree over a 56-byte GSPO-ordered composite key, cached
//! through a bounded page cache and made durable by a write-ahead log
//! with batch commit and redo-on-open recovery.

mod key;
pub use key::{Instant, Quad, QuadKey, FOREVER, KEY_LEN};

mod page;
pub use page::{PageId, Superblock, PAGE_SIZE};

mod cache;
pub use cache::{PageCache, PageRef};

mod btree;
pub use btree::{BTree, Cursor};

mod wal;
pub use wal::{Wal, WalRecord, WalRecordKind, WAL_RECORD_LEN};

mod lock;
pub use lock::StoreLock;

mod store;
pub use store::{
    Batch, CancelToken, GraphIter, QuadIter, QuadPattern, QuadStore, ScanMode, Statistics,
    StoreOptions,
};

mod pool;
pub use pool::StorePool;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Atom(#[from] atoms::Error),
    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupted store: {0}")]
    Corrupt(String),
    #[error("store is poisoned by a prior storage error")]
    Poisoned,
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("recursive acquisition of the store lock")]
    RecursiveLock,
    #[error("store lock is not held by this thread")]
    LockNotHeld,
    #[error("store pool: {0}")]
    Pool(String),
}

/// Microseconds since the Unix epoch, as used for both valid time and
/// transaction time.
pub fn now() -> Instant {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as Instant,
        Err(_) => 0,
    }
}
