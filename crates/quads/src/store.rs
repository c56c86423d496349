use crate::btree::{BTree, Cursor};
use crate::page::NIL_PAGE;
use crate::wal::{Wal, WalRecord, WalRecordKind};
use crate::{now, Error, Instant, PageCache, PageId, Quad, QuadKey, Superblock};
use crate::{StoreLock, FOREVER, PAGE_SIZE, WAL_RECORD_LEN};
use atoms::{Atom, AtomStore};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INDEX_FILE: &str = "gspo.tdb";
const WAL_FILE: &str = "gspo.wal";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Page cache capacity, in 4 KiB pages. Advisory under pin or
    /// dirty pressure.
    pub cache_pages: usize,
    /// Checkpoint once the WAL exceeds this many bytes.
    pub wal_checkpoint_bytes: u64,
    /// Checkpoint once this much time has passed since the last one.
    pub wal_checkpoint_interval: Duration,
    pub atoms: atoms::Options,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_pages: 1024,
            wal_checkpoint_bytes: 16 * 1024 * 1024,
            wal_checkpoint_interval: Duration::from_secs(60),
            atoms: atoms::Options::default(),
        }
    }
}

/// A (graph, subject, predicate, object) match pattern; `None` is a
/// wildcard. The longest bound GSPO prefix drives the index seek, and
/// any bound components past it are filtered per entry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QuadPattern {
    pub graph: Option<Atom>,
    pub subject: Option<Atom>,
    pub predicate: Option<Atom>,
    pub object: Option<Atom>,
}

impl QuadPattern {
    pub fn any() -> Self {
        Self::default()
    }

    /// The contiguous bound prefix, as seek bytes.
    fn seek_prefix(&self) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(32);
        for component in [self.graph, self.subject, self.predicate, self.object] {
            match component {
                Some(atom) => prefix.extend_from_slice(&atom.0.to_be_bytes()),
                None => break,
            }
        }
        prefix
    }

    fn matches(&self, quad: &Quad) -> bool {
        self.graph.map_or(true, |g| quad.graph == g)
            && self.subject.map_or(true, |s| quad.subject == s)
            && self.predicate.map_or(true, |p| quad.predicate == p)
            && self.object.map_or(true, |o| quad.object == o)
    }
}

/// Temporal variant of a scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanMode {
    /// Latest version per chain, live at the given instant.
    AsOf(Instant),
    /// Latest version per chain, validity overlapping `[from, to)`.
    Range(Instant, Instant),
    /// Every version, tombstones included.
    History,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Live (non-tombstone) versions in the index.
    pub quad_count: u64,
    /// Tombstone versions in the index.
    pub tombstone_count: u64,
    pub atom_count: u64,
    pub approximate_bytes: u64,
    pub wal_durable_bytes: u64,
    pub wal_checkpoint_offset: u64,
    /// Bumped on every committed batch; plan caches compare against it.
    pub version: u64,
}

struct Stats {
    quads: u64,
    tombstones: u64,
    predicates: FxHashMap<Atom, u64>,
    version: u64,
}

struct Inner {
    superblock: Superblock,
    wal: Wal,
    stats: Stats,
    last_checkpoint: std::time::Instant,
    tx_clock: Instant,
}

impl Inner {
    /// Monotonic microsecond clock for tx times: wall time, bumped by
    /// one tick whenever two stamps would otherwise collide.
    fn next_tx_time(&mut self) -> Instant {
        let t = now().max(self.tx_clock + 1);
        self.tx_clock = t;
        t
    }
}

/// The quad store façade: one B+Tree over bitemporal composite keys,
/// shared atom interning, WAL durability, and temporal query variants.
///
/// Locking contract: callers bracket reads with [`QuadStore::acquire_read`]
/// and [`QuadStore::release_read`]; iterators never touch the lock
/// themselves. Writers take the exclusive side through
/// [`QuadStore::begin_batch`].
pub struct QuadStore {
    dir: PathBuf,
    atoms: Arc<AtomStore>,
    tree: BTree,
    lock: StoreLock,
    inner: Mutex<Inner>,
    poisoned: AtomicBool,
    options: StoreOptions,
}

impl QuadStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(dir, StoreOptions::default())
    }

    pub fn open_with(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)?;

        let atoms = Arc::new(AtomStore::open_with(&dir, options.atoms.clone())?);

        let index_path = dir.join(INDEX_FILE);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index_path)?;
        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(PAGE_SIZE as u64)?;
        }
        let cache = Arc::new(PageCache::new(file, options.cache_pages));
        let tree = BTree::new(cache.clone());

        let mut superblock = if fresh {
            let mut sb = Superblock {
                root: NIL_PAGE,
                free_head: NIL_PAGE,
                next_page: 1,
                checkpoint_wal_offset: 0,
            };
            tree.create_empty(&mut sb)?;
            cache.flush_all()?;
            cache.write_superblock(&sb)?;
            cache.sync()?;
            sb
        } else {
            cache.read_superblock()?
        };

        let mut wal = Wal::open(dir.join(WAL_FILE))?;
        let replayed = wal.replay_from(superblock.checkpoint_wal_offset, |record| {
            let tombstone = record.kind == WalRecordKind::Tombstone;
            tree.insert(&mut superblock, &record.key, tombstone)?;
            Ok(())
        })?;
        if replayed > 0 {
            tracing::info!(records = replayed, dir = %dir.display(), "replayed WAL");
        }

        let stats = rebuild_stats(&tree, superblock.root)?;
        tracing::debug!(
            dir = %dir.display(),
            quads = stats.quads,
            tombstones = stats.tombstones,
            "opened quad store"
        );

        Ok(Self {
            dir,
            atoms,
            tree,
            lock: StoreLock::new(),
            inner: Mutex::new(Inner {
                superblock,
                wal,
                stats,
                last_checkpoint: std::time::Instant::now(),
                tx_clock: now(),
            }),
            poisoned: AtomicBool::new(false),
            options,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn atoms(&self) -> &AtomStore {
        &self.atoms
    }

    pub fn atoms_arc(&self) -> Arc<AtomStore> {
        self.atoms.clone()
    }

    #[inline]
    fn check_poisoned(&self) -> Result<(), Error> {
        if self.poisoned.load(Ordering::Acquire) {
            Err(Error::Poisoned)
        } else {
            Ok(())
        }
    }

    fn poison(&self, err: Error) -> Error {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(error = %err, "quad store poisoned");
        err
    }

    // ---- locking ----

    pub fn acquire_read(&self) -> Result<(), Error> {
        self.lock.acquire_read()
    }

    pub fn release_read(&self) -> Result<(), Error> {
        self.lock.release_read()
    }

    // ---- writes ----

    /// Open a write batch, taking the exclusive lock. The batch must be
    /// finished with [`Batch::commit`] or [`Batch::rollback`]; dropping
    /// it rolls back.
    pub fn begin_batch(&self) -> Result<Batch<'_>, Error> {
        self.check_poisoned()?;
        self.lock.acquire_write()?;
        let tx_id = {
            let mut inner = self.inner.lock();
            inner.next_tx_time() as u64
        };
        Ok(Batch {
            store: self,
            tx_id,
            records: Vec::new(),
            finished: false,
        })
    }

    /// Insert one quad valid from now on, in its own batch.
    pub fn add_current(&self, g: Atom, s: Atom, p: Atom, o: Atom) -> Result<(), Error> {
        let mut batch = self.begin_batch()?;
        batch.add_current(g, s, p, o)?;
        batch.commit()
    }

    /// Insert one historical quad, in its own batch.
    pub fn add(
        &self,
        g: Atom,
        s: Atom,
        p: Atom,
        o: Atom,
        valid_from: Instant,
        valid_to: Instant,
    ) -> Result<(), Error> {
        let mut batch = self.begin_batch()?;
        batch.add(g, s, p, o, valid_from, valid_to)?;
        batch.commit()
    }

    /// Tombstone every currently-live version of (g, s, p, o), in its
    /// own batch.
    pub fn delete_current(&self, g: Atom, s: Atom, p: Atom, o: Atom) -> Result<(), Error> {
        let mut batch = self.begin_batch()?;
        batch.delete_current(g, s, p, o)?;
        batch.commit()
    }

    // ---- reads ----

    fn root(&self) -> PageId {
        self.inner.lock().superblock.root
    }

    pub fn query_current(&self, pattern: QuadPattern) -> QuadIter {
        self.scan(pattern, ScanMode::AsOf(now()))
    }

    pub fn query_as_of(&self, pattern: QuadPattern, at: Instant) -> QuadIter {
        self.scan(pattern, ScanMode::AsOf(at))
    }

    pub fn query_range(&self, pattern: QuadPattern, from: Instant, to: Instant) -> QuadIter {
        self.scan(pattern, ScanMode::Range(from, to))
    }

    pub fn query_history(&self, pattern: QuadPattern) -> QuadIter {
        self.scan(pattern, ScanMode::History)
    }

    pub fn scan(&self, pattern: QuadPattern, mode: ScanMode) -> QuadIter {
        QuadIter {
            tree: self.tree.clone(),
            root: self.root(),
            prefix: pattern.seek_prefix(),
            pattern,
            mode,
            state: IterState::NotStarted,
            current: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            error: None,
        }
    }

    /// Distinct graph atoms in the store, the default-graph sentinel
    /// excluded.
    pub fn named_graphs(&self) -> GraphIter {
        GraphIter {
            tree: self.tree.clone(),
            root: self.root(),
            after: None,
            started: false,
            error: None,
        }
    }

    pub fn get_statistics(&self) -> Statistics {
        let inner = self.inner.lock();
        Statistics {
            quad_count: inner.stats.quads,
            tombstone_count: inner.stats.tombstones,
            atom_count: self.atoms.len(),
            approximate_bytes: self.tree.cache().file_len()
                + inner.wal.durable_len()
                + self.atoms.approximate_bytes(),
            wal_durable_bytes: inner.wal.durable_len(),
            wal_checkpoint_offset: inner.superblock.checkpoint_wal_offset,
            version: inner.stats.version,
        }
    }

    /// Approximate live quad count for one predicate, for join-order
    /// estimation.
    pub fn predicate_cardinality(&self, predicate: Atom) -> u64 {
        self.inner
            .lock()
            .stats
            .predicates
            .get(&predicate)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats_version(&self) -> u64 {
        self.inner.lock().stats.version
    }

    /// Force a checkpoint now, regardless of thresholds.
    pub fn checkpoint(&self) -> Result<(), Error> {
        self.check_poisoned()?;
        self.lock.acquire_write()?;
        let result = {
            let mut inner = self.inner.lock();
            self.checkpoint_locked(&mut inner)
        };
        self.lock.release_write()?;
        result
    }

    /// Flush dirty pages and the superblock, fsync, then reset the WAL
    /// to a lone marker. The superblock is rewritten only here.
    fn checkpoint_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        let cache = self.tree.cache();
        cache.flush_all()?;
        inner.superblock.checkpoint_wal_offset = WAL_RECORD_LEN as u64;
        cache.write_superblock(&inner.superblock)?;
        cache.sync()?;
        let tx = inner.next_tx_time() as u64;
        inner.wal.reset_for_checkpoint(tx)?;
        inner.last_checkpoint = std::time::Instant::now();
        tracing::debug!("checkpoint complete");
        Ok(())
    }

    fn maybe_checkpoint(&self, inner: &mut Inner) -> Result<(), Error> {
        let by_size = inner.wal.durable_len() >= self.options.wal_checkpoint_bytes;
        let by_time = inner.last_checkpoint.elapsed() >= self.options.wal_checkpoint_interval;
        if by_size || by_time {
            self.checkpoint_locked(inner)?;
        }
        Ok(())
    }
}

/// A write batch. All records share one WAL flush and fsync at commit;
/// rollback (or drop) discards them without touching the store.
pub struct Batch<'s> {
    store: &'s QuadStore,
    tx_id: u64,
    records: Vec<WalRecord>,
    finished: bool,
}

impl<'s> Batch<'s> {
    pub fn add_current(&mut self, g: Atom, s: Atom, p: Atom, o: Atom) -> Result<(), Error> {
        let at = now();
        self.add(g, s, p, o, at, FOREVER)
    }

    pub fn add(
        &mut self,
        g: Atom,
        s: Atom,
        p: Atom,
        o: Atom,
        valid_from: Instant,
        valid_to: Instant,
    ) -> Result<(), Error> {
        let tx = self.store.inner.lock().next_tx_time();
        self.records.push(WalRecord {
            kind: WalRecordKind::Insert,
            tx_id: self.tx_id,
            key: QuadKey::pack(g, s, p, o, valid_from, valid_to, tx),
        });
        Ok(())
    }

    /// Tombstone every version of (g, s, p, o) that is live now —
    /// committed versions and ones pending in this batch alike.
    pub fn delete_current(&mut self, g: Atom, s: Atom, p: Atom, o: Atom) -> Result<(), Error> {
        let at = now();
        let pattern = QuadPattern {
            graph: Some(g),
            subject: Some(s),
            predicate: Some(p),
            object: Some(o),
        };

        // Live chains already committed to the index. The range scan
        // over [at, at+1) yields every live chain, where an as-of scan
        // would collapse re-assertions to one.
        let mut chains: Vec<(Instant, Instant)> = Vec::new();
        let mut iter = self.store.query_range(pattern, at, at + 1);
        while iter.advance() {
            let quad = iter.current().expect("advance returned true");
            chains.push((quad.valid_from, quad.valid_to));
        }
        if let Some(err) = iter.take_error() {
            return Err(err);
        }

        // Chains introduced by this batch and still undeleted.
        for record in &self.records {
            let quad = record.key.quad(record.kind == WalRecordKind::Tombstone);
            if quad.graph == g
                && quad.subject == s
                && quad.predicate == p
                && quad.object == o
                && quad.valid_at(at)
            {
                let chain = (quad.valid_from, quad.valid_to);
                match record.kind {
                    WalRecordKind::Insert => {
                        if !chains.contains(&chain) {
                            chains.push(chain);
                        }
                    }
                    WalRecordKind::Tombstone => chains.retain(|c| *c != chain),
                    WalRecordKind::Checkpoint => {}
                }
            }
        }

        for (valid_from, valid_to) in chains {
            let tx = self.store.inner.lock().next_tx_time();
            self.records.push(WalRecord {
                kind: WalRecordKind::Tombstone,
                tx_id: self.tx_id,
                key: QuadKey::pack(g, s, p, o, valid_from, valid_to, tx),
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Make the batch durable: sync the atom store (no WAL record may
    /// name an atom the store could lose), flush and fsync the WAL,
    /// then apply records to the index.
    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        let result = self.commit_inner();
        let _ = self.store.lock.release_write();
        result
    }

    fn commit_inner(&mut self) -> Result<(), Error> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.store.atoms.sync()?;

        let mut inner = self.store.inner.lock();
        for record in &self.records {
            inner.wal.append(record);
        }
        // A WAL write failure aborts the batch but preserves the store:
        // the wal truncates itself back to the last commit boundary.
        inner.wal.commit()?;

        // Apply to the index. Failure here poisons the store: the WAL
        // already holds the batch, and partial application cannot be
        // undone in place.
        for record in &self.records {
            let tombstone = record.kind == WalRecordKind::Tombstone;
            let inserted = {
                let inner = &mut *inner;
                self.store
                    .tree
                    .insert(&mut inner.superblock, &record.key, tombstone)
            }
            .map_err(|err| self.store.poison(err))?;

            if inserted {
                let predicate = record.key.predicate();
                if tombstone {
                    inner.stats.tombstones += 1;
                    let count = inner.stats.predicates.entry(predicate).or_insert(0);
                    *count = count.saturating_sub(1);
                } else {
                    inner.stats.quads += 1;
                    *inner.stats.predicates.entry(predicate).or_insert(0) += 1;
                }
            }
        }
        inner.stats.version += 1;

        self.store.maybe_checkpoint(&mut inner)?;
        Ok(())
    }

    /// Discard the batch. No WAL or index state was touched.
    pub fn rollback(mut self) {
        self.finished = true;
        self.records.clear();
        let _ = self.store.lock.release_write();
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.records.clear();
            let _ = self.store.lock.release_write();
        }
    }
}

/// Cancellation handle for a [`QuadIter`], pollable from any thread.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum IterState {
    NotStarted,
    Streaming {
        cursor: Cursor,
        /// Entry already read from the cursor that begins the next
        /// chain group.
        pending: Option<(QuadKey, bool)>,
    },
    Done,
}

/// Pull-based scan over quad versions. Does not touch the store lock;
/// callers hold the shared lock for the iterator's lifetime.
pub struct QuadIter {
    tree: BTree,
    root: PageId,
    pattern: QuadPattern,
    prefix: Vec<u8>,
    mode: ScanMode,
    state: IterState,
    current: Option<Quad>,
    cancelled: Arc<AtomicBool>,
    error: Option<Error>,
}

impl QuadIter {
    /// Step to the next matching quad. Returns false when exhausted,
    /// cancelled, or on error; [`QuadIter::last_error`] distinguishes.
    pub fn advance(&mut self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            self.state = IterState::Done;
            self.current = None;
            self.error = Some(Error::Cancelled);
            return false;
        }
        match self.step() {
            Ok(quad) => {
                self.current = quad;
                quad.is_some()
            }
            Err(err) => {
                self.state = IterState::Done;
                self.current = None;
                self.error = Some(err);
                false
            }
        }
    }

    /// The quad at the current position. Valid until the next
    /// `advance`.
    pub fn current(&self) -> Option<Quad> {
        self.current
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancelled.clone())
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Yield the next raw index entry within the bound prefix, in key
    /// order. Drives the lazy first seek.
    fn next_entry(&mut self) -> Result<Option<(QuadKey, bool)>, Error> {
        let entry = loop {
            match &mut self.state {
                IterState::NotStarted => match self.tree.seek(self.root, &self.prefix)? {
                    None => {
                        self.state = IterState::Done;
                        return Ok(None);
                    }
                    Some(cursor) => {
                        let entry = (cursor.key(), cursor.tombstone());
                        self.state = IterState::Streaming {
                            cursor,
                            pending: None,
                        };
                        break entry;
                    }
                },
                IterState::Streaming { cursor, pending } => {
                    if let Some(entry) = pending.take() {
                        break entry;
                    }
                    if !cursor.advance(&self.tree)? {
                        self.state = IterState::Done;
                        return Ok(None);
                    }
                    break (cursor.key(), cursor.tombstone());
                }
                IterState::Done => return Ok(None),
            }
        };

        // Past the bound prefix: every further key is greater still.
        if !self.prefix.is_empty() && entry.0 .0[..self.prefix.len()] != self.prefix[..] {
            self.state = IterState::Done;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn push_back(&mut self, entry: (QuadKey, bool)) {
        if let IterState::Streaming { pending, .. } = &mut self.state {
            *pending = Some(entry);
        }
    }

    fn step(&mut self) -> Result<Option<Quad>, Error> {
        loop {
            let Some(first) = self.next_entry()? else {
                return Ok(None);
            };

            match self.mode {
                ScanMode::History => {
                    let quad = first.0.quad(first.1);
                    if self.pattern.matches(&quad) {
                        return Ok(Some(quad));
                    }
                }

                // Entries of one version chain sort by ascending
                // tx_time; the last one is the chain's winner.
                ScanMode::Range(from, to) => {
                    let mut winner = first;
                    loop {
                        match self.next_entry()? {
                            Some(next) if next.0.chain() == winner.0.chain() => winner = next,
                            Some(next) => {
                                self.push_back(next);
                                break;
                            }
                            None => break,
                        }
                    }
                    let quad = winner.0.quad(winner.1);
                    if !winner.1 && quad.valid_overlaps(from, to) && self.pattern.matches(&quad) {
                        return Ok(Some(quad));
                    }
                }

                // Collapse a whole (g, s, p, o) group: a fact may have
                // been re-asserted under several validity chains; the
                // latest-asserted live chain speaks for it.
                ScanMode::AsOf(at) => {
                    let gspo = first.0 .0[..32].to_owned();
                    let mut chain_last = first;
                    let mut best: Option<Quad> = None;
                    loop {
                        match self.next_entry()? {
                            Some(next) if next.0 .0[..32] == gspo[..] => {
                                if next.0.chain() == chain_last.0.chain() {
                                    chain_last = next;
                                } else {
                                    consider_live(&mut best, chain_last, at);
                                    chain_last = next;
                                }
                            }
                            other => {
                                if let Some(next) = other {
                                    self.push_back(next);
                                }
                                break;
                            }
                        }
                    }
                    consider_live(&mut best, chain_last, at);
                    if let Some(quad) = best {
                        if self.pattern.matches(&quad) {
                            return Ok(Some(quad));
                        }
                    }
                }
            }
        }
    }
}

/// Fold a chain winner into the per-(g, s, p, o) best candidate: live
/// at `at`, latest transaction time wins.
fn consider_live(best: &mut Option<Quad>, (key, tombstone): (QuadKey, bool), at: Instant) {
    if tombstone {
        return;
    }
    let quad = key.quad(false);
    if !quad.valid_at(at) {
        return;
    }
    match best {
        Some(prev) if prev.tx_time >= quad.tx_time => {}
        _ => *best = Some(quad),
    }
}

impl Iterator for QuadIter {
    type Item = Quad;

    fn next(&mut self) -> Option<Quad> {
        if self.advance() {
            self.current
        } else {
            None
        }
    }
}

/// Lazy enumeration of distinct named graphs, by seek-skipping over
/// graph prefixes.
pub struct GraphIter {
    tree: BTree,
    root: PageId,
    after: Option<Atom>,
    started: bool,
    error: Option<Error>,
}

impl GraphIter {
    pub fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn step(&mut self) -> Result<Option<Atom>, Error> {
        loop {
            let prefix: Vec<u8> = match (self.started, self.after) {
                (false, _) => Vec::new(),
                (true, Some(prev)) => match prev.0.checked_add(1) {
                    Some(next) => next.to_be_bytes().to_vec(),
                    None => return Ok(None),
                },
                (true, None) => return Ok(None),
            };
            self.started = true;

            let Some(cursor) = self.tree.seek(self.root, &prefix)? else {
                self.after = None;
                return Ok(None);
            };
            let graph = cursor.key().graph();
            self.after = Some(graph);
            if graph == Atom::DEFAULT_GRAPH {
                continue;
            }
            return Ok(Some(graph));
        }
    }
}

impl Iterator for GraphIter {
    type Item = Atom;

    fn next(&mut self) -> Option<Atom> {
        match self.step() {
            Ok(graph) => graph,
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }
}

fn rebuild_stats(tree: &BTree, root: PageId) -> Result<Stats, Error> {
    let mut stats = Stats {
        quads: 0,
        tombstones: 0,
        predicates: FxHashMap::default(),
        version: 0,
    };
    let Some(mut cursor) = tree.seek(root, &[])? else {
        return Ok(stats);
    };
    loop {
        let key = cursor.key();
        let predicate = key.predicate();
        if cursor.tombstone() {
            stats.tombstones += 1;
            let count = stats.predicates.entry(predicate).or_insert(0);
            *count = count.saturating_sub(1);
        } else {
            stats.quads += 1;
            *stats.predicates.entry(predicate).or_insert(0) += 1;
        }
        if !cursor.advance(tree)? {
            return Ok(stats);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_store() -> (tempfile::TempDir, QuadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn atoms_of(store: &QuadStore, terms: &[&str]) -> Vec<Atom> {
        terms.iter().map(|t| store.atoms().intern(t).unwrap()).collect()
    }

    fn collect(mut iter: QuadIter) -> Vec<Quad> {
        let mut out = Vec::new();
        while iter.advance() {
            out.push(iter.current().unwrap());
        }
        assert!(iter.last_error().is_none(), "{:?}", iter.last_error());
        out
    }

    #[test]
    fn test_add_and_query_current() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<http://ex/a>", "<http://ex/p>", "\"hello\""]);

        store
            .add_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[2])
            .unwrap();

        let quads = collect(store.query_current(QuadPattern::any()));
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].subject, t[0]);
        assert_eq!(quads[0].predicate, t[1]);
        assert_eq!(quads[0].object, t[2]);
        assert_eq!(quads[0].valid_to, FOREVER);
    }

    #[test]
    fn test_delete_hides_from_current() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>", "<o>"]);

        store.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[2]).unwrap();
        store
            .delete_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[2])
            .unwrap();

        assert!(collect(store.query_current(QuadPattern::any())).is_empty());
        // History still shows both versions.
        let history = collect(store.query_history(QuadPattern::any()));
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|q| q.tombstone));
    }

    #[test]
    fn test_re_add_after_delete() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>", "<o>"]);
        let g = Atom::DEFAULT_GRAPH;

        store.add_current(g, t[0], t[1], t[2]).unwrap();
        store.delete_current(g, t[0], t[1], t[2]).unwrap();
        store.add_current(g, t[0], t[1], t[2]).unwrap();

        assert_eq!(collect(store.query_current(QuadPattern::any())).len(), 1);
    }

    #[test]
    fn test_abstract_model_equivalence() {
        // Random add/delete interleavings agree with a model set.
        let (_dir, store) = open_store();
        let subjects = atoms_of(&store, &["<s0>", "<s1>", "<s2>", "<s3>"]);
        let p = store.atoms().intern("<p>").unwrap();
        let o = store.atoms().intern("<o>").unwrap();
        let g = Atom::DEFAULT_GRAPH;

        let mut model: std::collections::HashSet<Atom> = Default::default();
        let mut rng = 0x2545_f491_4f6c_dd1du64;
        for step in 0..200 {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            let s = subjects[(rng % 4) as usize];
            if rng % 3 == 0 && model.contains(&s) {
                store.delete_current(g, s, p, o).unwrap();
                model.remove(&s);
            } else {
                store.add_current(g, s, p, o).unwrap();
                model.insert(s);
            }
            if step % 50 == 0 {
                let live: std::collections::HashSet<Atom> = store
                    .query_current(QuadPattern::any())
                    .map(|q| q.subject)
                    .collect();
                assert_eq!(live, model);
            }
        }
        let live: std::collections::HashSet<Atom> = store
            .query_current(QuadPattern::any())
            .map(|q| q.subject)
            .collect();
        assert_eq!(live, model);
    }

    #[test]
    fn test_temporal_point_in_time() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<ex:a>", "<ex:v>", "\"1\"", "\"2\"", "\"3\""]);
        let g = Atom::DEFAULT_GRAPH;

        store.add(g, t[0], t[1], t[2], 1000, 2000).unwrap();
        store.add(g, t[0], t[1], t[3], 2000, 3000).unwrap();
        store.add(g, t[0], t[1], t[4], 3000, FOREVER).unwrap();

        let pattern = QuadPattern {
            graph: Some(g),
            subject: Some(t[0]),
            predicate: Some(t[1]),
            object: None,
        };
        let at_2500 = collect(store.query_as_of(pattern, 2500));
        assert_eq!(at_2500.len(), 1);
        assert_eq!(at_2500[0].object, t[3]);

        let range = collect(store.query_range(pattern, 1500, 2500));
        assert_eq!(range.len(), 2);
    }

    #[test]
    fn test_valid_from_equals_valid_to_is_never_live() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>", "<o>"]);
        store
            .add(Atom::DEFAULT_GRAPH, t[0], t[1], t[2], 1000, 1000)
            .unwrap();
        let pattern = QuadPattern::any();
        assert!(collect(store.query_as_of(pattern, 1000)).is_empty());
        assert!(collect(store.query_as_of(pattern, 999)).is_empty());
    }

    #[test]
    fn test_batch_commit_and_rollback() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>", "<o1>", "<o2>", "<o3>"]);
        let g = Atom::DEFAULT_GRAPH;

        let mut batch = store.begin_batch().unwrap();
        batch.add_current(g, t[0], t[1], t[2]).unwrap();
        batch.add_current(g, t[0], t[1], t[3]).unwrap();
        batch.commit().unwrap();
        assert_eq!(collect(store.query_current(QuadPattern::any())).len(), 2);

        let mut batch = store.begin_batch().unwrap();
        batch.add_current(g, t[0], t[1], t[4]).unwrap();
        batch.rollback();
        assert_eq!(collect(store.query_current(QuadPattern::any())).len(), 2);
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (s, p, o);
        {
            let store = QuadStore::open(dir.path()).unwrap();
            s = store.atoms().intern("<http://ex/s>").unwrap();
            p = store.atoms().intern("<http://ex/p>").unwrap();
            o = store.atoms().intern("<http://ex/o>").unwrap();
            store.add_current(Atom::DEFAULT_GRAPH, s, p, o).unwrap();
        }
        let store = QuadStore::open(dir.path()).unwrap();
        let quads = collect(store.query_current(QuadPattern::any()));
        assert_eq!(quads.len(), 1);
        assert_eq!((quads[0].subject, quads[0].predicate, quads[0].object), (s, p, o));
    }

    #[test]
    fn test_rolled_back_batch_invisible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = QuadStore::open(dir.path()).unwrap();
            let t = atoms_of(&store, &["<s>", "<p>", "<o1>", "<o2>", "<o3>"]);
            let mut batch = store.begin_batch().unwrap();
            batch.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[2]).unwrap();
            batch.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[3]).unwrap();
            batch.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], t[4]).unwrap();
            batch.rollback();
        }
        let store = QuadStore::open(dir.path()).unwrap();
        assert!(collect(store.query_current(QuadPattern::any())).is_empty());
        assert_eq!(store.get_statistics().quad_count, 0);
    }

    #[test]
    fn test_reopen_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = QuadStore::open(dir.path()).unwrap();
            let t = atoms_of(&store, &["<s>", "<p>"]);
            for i in 0..100 {
                let o = store.atoms().intern(&format!("\"{i}\"")).unwrap();
                store.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], o).unwrap();
            }
            store.checkpoint().unwrap();
            // More writes after the checkpoint land in the WAL only.
            for i in 100..150 {
                let o = store.atoms().intern(&format!("\"{i}\"")).unwrap();
                store.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], o).unwrap();
            }
        }
        let store = QuadStore::open(dir.path()).unwrap();
        assert_eq!(collect(store.query_current(QuadPattern::any())).len(), 150);
    }

    #[test]
    fn test_named_graph_enumeration() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<g1>", "<g2>", "<s>", "<p>", "<o>"]);

        store.add_current(t[0], t[2], t[3], t[4]).unwrap();
        store.add_current(t[1], t[2], t[3], t[4]).unwrap();
        store.add_current(Atom::DEFAULT_GRAPH, t[2], t[3], t[4]).unwrap();

        let mut graphs: Vec<Atom> = store.named_graphs().collect();
        graphs.sort();
        assert_eq!(graphs, vec![t[0], t[1]]);
    }

    #[test]
    fn test_graph_scoped_wildcard() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<g1>", "<g2>", "<s>", "<p>", "<o1>", "<o2>"]);

        store.add_current(t[0], t[2], t[3], t[4]).unwrap();
        store.add_current(t[1], t[2], t[3], t[5]).unwrap();

        let in_g1 = collect(store.query_current(QuadPattern {
            graph: Some(t[0]),
            ..Default::default()
        }));
        assert_eq!(in_g1.len(), 1);
        assert_eq!(in_g1[0].object, t[4]);
    }

    #[test]
    fn test_fully_bound_pattern_yields_at_most_one() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>", "<o>", "<o2>"]);
        let g = Atom::DEFAULT_GRAPH;
        store.add_current(g, t[0], t[1], t[2]).unwrap();
        store.add_current(g, t[0], t[1], t[3]).unwrap();

        let hits = collect(store.query_current(QuadPattern {
            graph: Some(g),
            subject: Some(t[0]),
            predicate: Some(t[1]),
            object: Some(t[2]),
        }));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_cancelled_iterator_stops() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p>"]);
        for i in 0..10 {
            let o = store.atoms().intern(&format!("\"{i}\"")).unwrap();
            store.add_current(Atom::DEFAULT_GRAPH, t[0], t[1], o).unwrap();
        }
        let mut iter = store.query_current(QuadPattern::any());
        assert!(iter.advance());
        iter.cancel_token().cancel();
        assert!(!iter.advance());
        assert!(matches!(iter.last_error(), Some(Error::Cancelled)));
    }

    #[test]
    fn test_statistics_track_predicates() {
        let (_dir, store) = open_store();
        let t = atoms_of(&store, &["<s>", "<p1>", "<p2>", "<o>"]);
        let g = Atom::DEFAULT_GRAPH;
        store.add_current(g, t[0], t[1], t[3]).unwrap();
        store.add_current(g, t[0], t[2], t[3]).unwrap();
        store.add_current(g, t[3], t[1], t[0]).unwrap();

        assert_eq!(store.predicate_cardinality(t[1]), 2);
        assert_eq!(store.predicate_cardinality(t[2]), 1);
        let stats = store.get_statistics();
        assert_eq!(stats.quad_count, 3);
        assert_eq!(stats.atom_count, 4);
        assert!(stats.approximate_bytes > 0);
    }

    #[test]
    fn test_recursive_read_lock_is_refused() {
        let (_dir, store) = open_store();
        store.acquire_read().unwrap();
        assert!(matches!(store.acquire_read(), Err(Error::RecursiveLock)));
        store.release_read().unwrap();
    }
}
