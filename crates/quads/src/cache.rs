use crate::page::{NIL_PAGE, PAGE_SIZE};
use crate::{Error, PageId, Superblock};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// A bounded cache of fixed-size pages from the index file, with
/// reference-counted pinning and clock eviction.
///
/// Dirty pages are written back only by [`PageCache::flush_all`] (the
/// checkpoint path), never by eviction; the on-disk tree therefore
/// always reflects exactly the last checkpoint, which is what WAL
/// replay assumes. Under pin or dirty pressure the capacity is
/// advisory: the cache over-commits rather than evict a page it must
/// not.
pub struct PageCache {
    file: File,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    table: FxHashMap<PageId, usize>,
    slots: Vec<Arc<Slot>>,
    hand: usize,
}

struct Slot {
    page: AtomicU64,
    pin: AtomicU32,
    referenced: AtomicBool,
    dirty: AtomicBool,
    buf: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Slot {
            page: AtomicU64::new(NIL_PAGE),
            pin: AtomicU32::new(0),
            referenced: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            buf: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        })
    }
}

/// A pinned reference to a resident page. The page cannot be evicted
/// while any `PageRef` to it is live; dropping the last one unpins it.
pub struct PageRef {
    slot: Arc<Slot>,
}

impl PageRef {
    #[inline]
    pub fn id(&self) -> PageId {
        self.slot.page.load(Ordering::Relaxed)
    }

    /// Shared view of the page bytes.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.slot.buf.read()
    }

    /// Exclusive view of the page bytes. Marks the page dirty.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.slot.dirty.store(true, Ordering::Release);
        self.slot.buf.write()
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.slot.dirty.store(true, Ordering::Release);
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        self.slot.pin.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.slot.pin.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PageCache {
    pub fn new(file: File, capacity: usize) -> Self {
        Self {
            file,
            capacity: capacity.max(8),
            inner: Mutex::new(Inner {
                table: FxHashMap::default(),
                slots: Vec::new(),
                hand: 0,
            }),
        }
    }

    /// Return a pinned reference to `page`, loading it if not resident.
    pub fn get(&self, page: PageId) -> Result<PageRef, Error> {
        debug_assert_ne!(page, NIL_PAGE, "page 0 is the superblock");
        let mut inner = self.inner.lock();

        if let Some(&index) = inner.table.get(&page) {
            let slot = inner.slots[index].clone();
            slot.pin.fetch_add(1, Ordering::AcqRel);
            slot.referenced.store(true, Ordering::Relaxed);
            return Ok(PageRef { slot });
        }

        let index = self.claim_slot(&mut inner)?;
        let slot = inner.slots[index].clone();

        {
            let mut buf = slot.buf.write();
            read_page(&self.file, page, buf.as_mut())?;
        }
        let old = slot.page.swap(page, Ordering::Relaxed);
        if old != NIL_PAGE {
            inner.table.remove(&old);
        }
        slot.pin.store(1, Ordering::Release);
        slot.referenced.store(true, Ordering::Relaxed);
        slot.dirty.store(false, Ordering::Release);
        inner.table.insert(page, index);

        Ok(PageRef { slot })
    }

    /// Pick a slot for a new page: an existing victim by clock sweep,
    /// or a fresh (possibly over-capacity) slot.
    fn claim_slot(&self, inner: &mut Inner) -> Result<usize, Error> {
        if inner.slots.len() >= self.capacity {
            let len = inner.slots.len();
            // Two full sweeps: the first may only clear referenced bits.
            for _ in 0..len * 2 {
                let at = inner.hand;
                inner.hand = (inner.hand + 1) % len;
                let slot = &inner.slots[at];

                if slot.pin.load(Ordering::Acquire) != 0 || slot.dirty.load(Ordering::Acquire) {
                    continue;
                }
                if slot.referenced.swap(false, Ordering::Relaxed) {
                    continue;
                }
                return Ok(at);
            }
            tracing::debug!(
                capacity = self.capacity,
                resident = len,
                "page cache over-committing: all pages pinned or dirty"
            );
        }
        inner.slots.push(Slot::new());
        Ok(inner.slots.len() - 1)
    }

    /// Write back every dirty page and fsync the index file.
    pub fn flush_all(&self) -> Result<(), Error> {
        let inner = self.inner.lock();
        let mut flushed = 0usize;
        for slot in &inner.slots {
            if !slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            let page = slot.page.load(Ordering::Relaxed);
            let buf = slot.buf.read();
            self.file.write_all_at(&buf[..], page * PAGE_SIZE as u64)?;
            slot.dirty.store(false, Ordering::Release);
            flushed += 1;
        }
        drop(inner);
        self.file.sync_data()?;
        tracing::debug!(pages = flushed, "flushed dirty pages");
        Ok(())
    }

    /// Allocate a page from the free list, or grow the file. The file
    /// extension doubles as the out-of-disk pre-write check: it fails
    /// before any tree page has been touched.
    pub fn allocate(&self, superblock: &mut Superblock) -> Result<PageId, Error> {
        if superblock.free_head != NIL_PAGE {
            let id = superblock.free_head;
            let page = self.get(id)?;
            let next = {
                let buf = page.read();
                crate::page::header_link(&buf[..])
            };
            superblock.free_head = next;
            return Ok(id);
        }
        let id = superblock.next_page;
        self.file.set_len((id + 1) * PAGE_SIZE as u64)?;
        superblock.next_page = id + 1;
        Ok(id)
    }

    pub fn read_superblock(&self) -> Result<Superblock, Error> {
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_exact_at(&mut buf, 0)?;
        Superblock::decode(&buf)
    }

    /// Rewrite page 0. Called only from the checkpoint path.
    pub fn write_superblock(&self, superblock: &Superblock) -> Result<(), Error> {
        self.file.write_all_at(&superblock.encode(), 0)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn file_len(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn resident(&self) -> usize {
        self.inner.lock().table.len()
    }
}

fn read_page(file: &File, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), Error> {
    let offset = page * PAGE_SIZE as u64;
    let len = file.metadata()?.len();
    if offset >= len {
        return Err(Error::Corrupt(format!(
            "page {page} is past the end of the index file"
        )));
    }
    file.read_exact_at(buf.as_mut_slice(), offset)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::{init_page, PageKind};

    fn cache_over(pages: u64, capacity: usize) -> (tempfile::TempDir, PageCache) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("pages.tdb"))
            .unwrap();
        file.set_len((pages + 1) * PAGE_SIZE as u64).unwrap();
        // Stamp each page with a recognizable first byte.
        for p in 1..=pages {
            let mut buf = [0u8; PAGE_SIZE];
            buf[0] = p as u8;
            file.write_all_at(&buf, p * PAGE_SIZE as u64).unwrap();
        }
        (dir, PageCache::new(file, capacity))
    }

    #[test]
    fn test_get_loads_and_caches() {
        let (_dir, cache) = cache_over(4, 8);
        let one = cache.get(1).unwrap();
        assert_eq!(one.read()[0], 1);
        let again = cache.get(1).unwrap();
        assert_eq!(again.read()[0], 1);
        assert_eq!(cache.resident(), 1);
    }

    #[test]
    fn test_clock_evicts_unpinned_clean_pages() {
        let (_dir, cache) = cache_over(32, 8);
        for p in 1..=32 {
            let page = cache.get(p).unwrap();
            assert_eq!(page.read()[0], p as u8);
            drop(page);
        }
        assert!(cache.resident() <= 8);
    }

    #[test]
    fn test_pinned_pages_survive_pressure() {
        let (_dir, cache) = cache_over(32, 8);
        let pinned: Vec<PageRef> = (1..=8).map(|p| cache.get(p).unwrap()).collect();
        for p in 9..=32 {
            drop(cache.get(p).unwrap());
        }
        for (i, page) in pinned.iter().enumerate() {
            assert_eq!(page.read()[0], (i + 1) as u8);
        }
    }

    #[test]
    fn test_dirty_pages_only_written_by_flush() {
        let (_dir, cache) = cache_over(32, 8);
        {
            let page = cache.get(1).unwrap();
            page.write()[100] = 0xee;
        }
        // Evict pressure: dirty page must not be written back or dropped.
        for p in 2..=32 {
            drop(cache.get(p).unwrap());
        }
        let mut raw = [0u8; PAGE_SIZE];
        cache.file.read_exact_at(&mut raw, PAGE_SIZE as u64).unwrap();
        assert_eq!(raw[100], 0, "dirty page reached disk before flush_all");

        cache.flush_all().unwrap();
        cache.file.read_exact_at(&mut raw, PAGE_SIZE as u64).unwrap();
        assert_eq!(raw[100], 0xee);
    }

    #[test]
    fn test_allocate_grows_and_reuses_free_list() {
        let (_dir, cache) = cache_over(2, 8);
        let mut sb = Superblock {
            root: 1,
            free_head: NIL_PAGE,
            next_page: 3,
            checkpoint_wal_offset: 0,
        };
        let fresh = cache.allocate(&mut sb).unwrap();
        assert_eq!(fresh, 3);
        assert_eq!(sb.next_page, 4);

        // Thread page 2 onto the free list and allocate it back.
        {
            let page = cache.get(2).unwrap();
            init_page(page.write().as_mut_slice(), PageKind::Free, NIL_PAGE);
        }
        cache.flush_all().unwrap();
        sb.free_head = 2;
        assert_eq!(cache.allocate(&mut sb).unwrap(), 2);
        assert_eq!(sb.free_head, NIL_PAGE);
    }
}
