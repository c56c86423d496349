use crate::{fnv1a, Atom, Error};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DAT_FILE: &str = "atoms.dat";
const OFF_FILE: &str = "atoms.off";
const IDX_FILE: &str = "atoms.idx";

const IDX_MAGIC: u64 = 0x7374_726e_6461_7478; // "strndatx"
const IDX_VERSION: u32 = 1;
const IDX_HEADER_LEN: u64 = 32;
const IDX_MIN_CAPACITY: usize = 1024;

// Hash table load factor is capped at 0.7, expressed as a ratio
// to keep the check in integer arithmetic.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

/// Options for opening an [`AtomStore`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Largest term accepted by `intern`, in bytes.
    pub max_atom_len: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_atom_len: 16 * 1024 * 1024,
        }
    }
}

/// AtomStore maps RDF term strings to stable 64-bit [`Atom`] identifiers
/// and back, persistently. It is backed by three append-only files:
///
/// * `atoms.dat` — raw UTF-8 term bytes, each record prefixed by a
///   little-endian u32 length.
/// * `atoms.off` — one little-endian u64 `atoms.dat` offset per atom,
///   indexed by `id - Atom::FIRST_INTERNED`.
/// * `atoms.idx` — an open-addressed hash table slotted by
///   `fnv1a(term) % capacity`, rebuilt from `atoms.dat` when absent
///   or inconsistent.
///
/// Interning is serialized by an internal mutex. Lookups by id read
/// through a memory map of `atoms.dat`; returned [`AtomText`] guards
/// hold their mapping epoch alive, so a text obtained before the file
/// grew remains valid after it.
pub struct AtomStore {
    dir: PathBuf,
    max_atom_len: usize,
    shared: RwLock<Shared>,
    writer: Mutex<Writer>,
    poisoned: AtomicBool,
}

struct Shared {
    /// `atoms.dat` offset of each interned atom's record.
    offsets: Vec<u64>,
    /// Current read mapping of `atoms.dat`, absent while the file is empty.
    map: Option<Arc<Mmap>>,
    /// Bytes of `atoms.dat` covered by published records.
    dat_len: u64,
    /// Read handle used to refresh `map`.
    dat_reader: File,
}

struct Writer {
    dat: File,
    off: File,
    idx: File,
    dat_len: u64,
    table: Table,
}

/// The in-memory mirror of `atoms.idx`: open addressing with linear
/// probing, power-of-two capacity, slot value 0 meaning empty. Atom ids
/// start at 2, so 0 is unambiguous as the empty marker.
struct Table {
    slots: Vec<u64>,
    count: u64,
}

impl Table {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        Self {
            slots: vec![0; capacity],
            count: 0,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn needs_grow(&self) -> bool {
        (self.count as usize + 1) * LOAD_DEN > self.slots.len() * LOAD_NUM
    }

    /// Walk the probe chain for `hash`, yielding each occupied slot's
    /// (slot index, atom id) until the first empty slot.
    fn probe(&self, hash: u64) -> Probe<'_> {
        Probe {
            table: self,
            at: hash as usize & self.mask(),
        }
    }

    fn insert(&mut self, hash: u64, id: u64) -> usize {
        let mask = self.mask();
        let mut at = hash as usize & mask;
        while self.slots[at] != 0 {
            at = (at + 1) & mask;
        }
        self.slots[at] = id;
        self.count += 1;
        at
    }
}

struct Probe<'t> {
    table: &'t Table,
    at: usize,
}

impl<'t> Iterator for Probe<'t> {
    type Item = (usize, u64);

    fn next(&mut self) -> Option<(usize, u64)> {
        let id = self.table.slots[self.at];
        if id == 0 {
            return None;
        }
        let item = (self.at, id);
        self.at = (self.at + 1) & self.table.mask();
        Some(item)
    }
}

/// A borrowed view of an atom's term text. The guard pins the mapping
/// epoch it was read from, so it stays valid across later interning.
pub struct AtomText {
    map: Arc<Mmap>,
    start: usize,
    len: usize,
}

impl AtomText {
    #[inline]
    pub fn as_str(&self) -> &str {
        // UTF-8 was validated when this guard was constructed.
        unsafe { std::str::from_utf8_unchecked(&self.map[self.start..self.start + self.len]) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.map[self.start..self.start + self.len]
    }
}

impl std::ops::Deref for AtomText {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for AtomText {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for AtomText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for AtomText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl AtomStore {
    /// Open (creating if needed) the atom store within `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(dir, Options::default())
    }

    pub fn open_with(dir: impl AsRef<Path>, options: Options) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)?;

        let mut dat = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(DAT_FILE))?;
        let mut off = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(OFF_FILE))?;

        let (offsets, dat_len) = recover(&mut dat, &mut off)?;
        let table = load_or_rebuild_index(&dir, &dat, &offsets)?;
        let idx = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(IDX_FILE))?;

        dat.seek(SeekFrom::Start(dat_len))?;
        off.seek(SeekFrom::Start(offsets.len() as u64 * 8))?;

        let dat_reader = File::open(dir.join(DAT_FILE))?;
        let map = if dat_len > 0 {
            // Safety: the file is append-only; mapped bytes are never rewritten.
            Some(Arc::new(unsafe { Mmap::map(&dat_reader)? }))
        } else {
            None
        };

        tracing::debug!(
            dir = %dir.display(),
            atoms = offsets.len(),
            dat_bytes = dat_len,
            "opened atom store"
        );

        Ok(Self {
            dir,
            max_atom_len: options.max_atom_len,
            shared: RwLock::new(Shared {
                offsets,
                map,
                dat_len,
                dat_reader,
            }),
            writer: Mutex::new(Writer {
                dat,
                off,
                idx,
                dat_len,
                table,
            }),
            poisoned: AtomicBool::new(false),
        })
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
        tracing::error!(error = %err, "atom store poisoned");
        err
    }

    /// Number of interned atoms (sentinels excluded).
    pub fn len(&self) -> u64 {
        self.shared.read().offsets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of interned term text, length prefixes included.
    pub fn approximate_bytes(&self) -> u64 {
        self.shared.read().dat_len
    }

    /// Intern `term`, returning its stable atom. Byte-equal terms map to
    /// the same atom for the life of the store.
    pub fn intern(&self, term: &str) -> Result<Atom, Error> {
        self.check_poisoned()?;
        if term.len() > self.max_atom_len {
            return Err(Error::Oversized {
                len: term.len(),
                max: self.max_atom_len,
            });
        }

        let hash = fnv1a(term.as_bytes());
        let mut writer = self.writer.lock();

        if let Some(atom) = self.probe_locked(&writer, hash, term)? {
            return Ok(atom);
        }

        match self.append_locked(&mut writer, hash, term) {
            Ok(atom) => Ok(atom),
            Err(err @ Error::Io(_)) => Err(self.poison(err)),
            Err(err) => Err(err),
        }
    }

    /// Probe for `term` without interning it.
    pub fn lookup(&self, term: &str) -> Result<Option<Atom>, Error> {
        self.check_poisoned()?;
        let hash = fnv1a(term.as_bytes());
        let writer = self.writer.lock();
        self.probe_locked(&writer, hash, term)
    }

    fn probe_locked(&self, writer: &Writer, hash: u64, term: &str) -> Result<Option<Atom>, Error> {
        for (_, id) in writer.table.probe(hash) {
            if self.record_matches(writer, id, term.as_bytes())? {
                return Ok(Some(Atom(id)));
            }
        }
        Ok(None)
    }

    /// Collision check: compare the stored record of `id` against `bytes`.
    fn record_matches(&self, writer: &Writer, id: u64, bytes: &[u8]) -> Result<bool, Error> {
        let index = (id - Atom::FIRST_INTERNED) as usize;
        let shared = self.shared.read();
        let offset = *shared
            .offsets
            .get(index)
            .ok_or_else(|| Error::Corrupt(format!("hash slot names unknown atom id {id}")))?;
        drop(shared);

        let mut len_buf = [0u8; 4];
        writer.dat.read_exact_at(&mut len_buf, offset)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len != bytes.len() {
            return Ok(false);
        }
        let mut rec = vec![0u8; len];
        writer.dat.read_exact_at(&mut rec, offset + 4)?;
        Ok(rec == bytes)
    }

    /// Append a new record. Publication order is bytes, then offset, then
    /// the hash slot, so a crash can lose the tail but never publish an
    /// id whose backing bytes are incomplete.
    fn append_locked(&self, writer: &mut Writer, hash: u64, term: &str) -> Result<Atom, Error> {
        let offset = writer.dat_len;
        let id = Atom::FIRST_INTERNED + writer.table.count;

        writer
            .dat
            .write_all(&(term.len() as u32).to_le_bytes())?;
        writer.dat.write_all(term.as_bytes())?;
        writer.dat_len = offset + 4 + term.len() as u64;

        writer.off.write_all(&offset.to_le_bytes())?;

        {
            let mut shared = self.shared.write();
            shared.offsets.push(offset);
            shared.dat_len = writer.dat_len;
        }

        if writer.table.needs_grow() {
            self.grow_index(writer)?;
        }
        let slot = writer.table.insert(hash, id);
        writer
            .idx
            .write_all_at(&id.to_le_bytes(), IDX_HEADER_LEN + slot as u64 * 8)?;

        Ok(Atom(id))
    }

    fn grow_index(&self, writer: &mut Writer) -> Result<(), Error> {
        let new_capacity = writer.table.slots.len() * 2;
        tracing::debug!(capacity = new_capacity, "growing atom hash index");

        let mut grown = Table::with_capacity(new_capacity);
        let shared = self.shared.read();
        for (index, &offset) in shared.offsets.iter().enumerate() {
            let id = Atom::FIRST_INTERNED + index as u64;
            let mut len_buf = [0u8; 4];
            writer.dat.read_exact_at(&mut len_buf, offset)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut rec = vec![0u8; len];
            writer.dat.read_exact_at(&mut rec, offset + 4)?;
            grown.insert(fnv1a(&rec), id);
        }
        drop(shared);

        writer.table = grown;
        write_index_file(&self.dir, &writer.table)?;
        Ok(())
    }

    /// Resolve an atom id back to its term text.
    pub fn get(&self, atom: Atom) -> Result<AtomText, Error> {
        if atom.is_sentinel() {
            return Err(Error::UnknownAtom(atom.0));
        }
        let index = (atom.0 - Atom::FIRST_INTERNED) as usize;

        let shared = self.shared.read();
        let offset = *shared
            .offsets
            .get(index)
            .ok_or(Error::UnknownAtom(atom.0))? as usize;

        let map = match &shared.map {
            Some(map) if map.len() >= offset + 4 => map.clone(),
            _ => {
                drop(shared);
                self.remap()?
            }
        };

        let len =
            u32::from_le_bytes(map[offset..offset + 4].try_into().expect("4 bytes")) as usize;
        let start = offset + 4;
        if map.len() < start + len {
            return Err(Error::Corrupt(format!(
                "record of atom id {} extends past atoms.dat",
                atom.0
            )));
        }
        std::str::from_utf8(&map[start..start + len]).map_err(|_| Error::NotUtf8(atom.0))?;

        Ok(AtomText { map, start, len })
    }

    /// Refresh the read mapping to cover everything published so far.
    fn remap(&self) -> Result<Arc<Mmap>, Error> {
        let mut shared = self.shared.write();
        // Safety: append-only file; see `open_with`.
        let map = Arc::new(unsafe { Mmap::map(&shared.dat_reader)? });
        shared.map = Some(map.clone());
        Ok(map)
    }

    /// Flush and fsync `atoms.dat` and `atoms.off`. Callers that persist
    /// atom ids elsewhere (the quad WAL) must sync the atom store first,
    /// so no durable record can name an atom the store lost.
    pub fn sync(&self) -> Result<(), Error> {
        self.check_poisoned()?;
        let writer = self.writer.lock();
        let result = writer
            .dat
            .sync_data()
            .and_then(|()| writer.off.sync_data());
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.poison(Error::Io(err))),
        }
    }
}

impl Drop for AtomStore {
    fn drop(&mut self) {
        // Persist the final hash table so the next open can trust it.
        let writer = self.writer.get_mut();
        if let Err(err) = write_index_file(&self.dir, &writer.table) {
            tracing::warn!(error = %err, "failed to persist atom hash index on close");
        }
    }
}

/// Validate `atoms.off` against `atoms.dat`, truncating both to the last
/// complete record if a torn tail is found. Returns the offsets and the
/// validated length of `atoms.dat`.
fn recover(dat: &mut File, off: &mut File) -> Result<(Vec<u64>, u64), Error> {
    let dat_len = dat.metadata()?.len();
    let off_len = off.metadata()?.len();

    let mut off_bytes = Vec::with_capacity(off_len as usize);
    off.seek(SeekFrom::Start(0))?;
    off.read_to_end(&mut off_bytes)?;

    let mut offsets = Vec::with_capacity(off_bytes.len() / 8);
    let mut pos: u64 = 0;

    for entry in off_bytes.chunks_exact(8) {
        let offset = u64::from_le_bytes(entry.try_into().expect("8 bytes"));
        if offset != pos || pos + 4 > dat_len {
            break;
        }
        let mut len_buf = [0u8; 4];
        dat.read_exact_at(&mut len_buf, pos)?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if pos + 4 + len > dat_len {
            break;
        }
        offsets.push(offset);
        pos += 4 + len;
    }

    if offsets.len() as u64 * 8 != off_len || pos != dat_len {
        tracing::warn!(
            records = offsets.len(),
            dat_tail = dat_len - pos,
            "truncating torn atom store tail"
        );
        off.set_len(offsets.len() as u64 * 8)?;
        dat.set_len(pos)?;
    }

    Ok((offsets, pos))
}

fn load_or_rebuild_index(dir: &Path, dat: &File, offsets: &[u64]) -> Result<Table, Error> {
    match try_load_index(dir, offsets.len() as u64) {
        Ok(table) => return Ok(table),
        Err(err) => {
            tracing::debug!(error = %err, "rebuilding atom hash index");
        }
    }

    let mut capacity = IDX_MIN_CAPACITY;
    while offsets.len() * LOAD_DEN >= capacity * LOAD_NUM {
        capacity *= 2;
    }

    let mut table = Table::with_capacity(capacity);
    for (index, &offset) in offsets.iter().enumerate() {
        let mut len_buf = [0u8; 4];
        dat.read_exact_at(&mut len_buf, offset)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut rec = vec![0u8; len];
        dat.read_exact_at(&mut rec, offset + 4)?;
        table.insert(fnv1a(&rec), Atom::FIRST_INTERNED + index as u64);
    }

    write_index_file(dir, &table)?;
    Ok(table)
}

fn try_load_index(dir: &Path, expect_count: u64) -> Result<Table, Error> {
    let mut file = File::open(dir.join(IDX_FILE))?;
    let mut header = [0u8; IDX_HEADER_LEN as usize];
    file.read_exact(&mut header)?;

    let magic = u64::from_le_bytes(header[0..8].try_into().expect("8 bytes"));
    let version = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
    let capacity = u64::from_le_bytes(header[16..24].try_into().expect("8 bytes")) as usize;
    let count = u64::from_le_bytes(header[24..32].try_into().expect("8 bytes"));

    if magic != IDX_MAGIC || version != IDX_VERSION {
        return Err(Error::Corrupt("atoms.idx has a bad header".to_string()));
    }
    if !capacity.is_power_of_two() || count != expect_count {
        return Err(Error::Corrupt(format!(
            "atoms.idx is stale: capacity {capacity}, count {count} vs {expect_count} atoms"
        )));
    }
    if file.metadata()?.len() != IDX_HEADER_LEN + capacity as u64 * 8 {
        return Err(Error::Corrupt("atoms.idx is truncated".to_string()));
    }

    let mut slots = vec![0u64; capacity];
    let mut buf = vec![0u8; capacity * 8];
    file.read_exact(&mut buf)?;
    let max_id = Atom::FIRST_INTERNED + expect_count;
    for (slot, chunk) in slots.iter_mut().zip(buf.chunks_exact(8)) {
        let id = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
        if id != 0 && (id < Atom::FIRST_INTERNED || id >= max_id) {
            return Err(Error::Corrupt(format!("atoms.idx slot names bad id {id}")));
        }
        *slot = id;
    }

    Ok(Table { slots, count })
}

fn write_index_file(dir: &Path, table: &Table) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.join(IDX_FILE))?;

    let mut header = [0u8; IDX_HEADER_LEN as usize];
    header[0..8].copy_from_slice(&IDX_MAGIC.to_le_bytes());
    header[8..12].copy_from_slice(&IDX_VERSION.to_le_bytes());
    header[16..24].copy_from_slice(&(table.slots.len() as u64).to_le_bytes());
    header[24..32].copy_from_slice(&table.count.to_le_bytes());
    file.write_all(&header)?;

    let mut buf = Vec::with_capacity(table.slots.len() * 8);
    for &slot in &table.slots {
        buf.extend_from_slice(&slot.to_le_bytes());
    }
    file.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn temp_store() -> (tempfile::TempDir, AtomStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_intern_is_stable() {
        let (_dir, store) = temp_store();

        let a = store.intern("<http://example.com/a>").unwrap();
        let b = store.intern("<http://example.com/b>").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, store.intern("<http://example.com/a>").unwrap());
        assert_eq!(b, store.intern("<http://example.com/b>").unwrap());

        assert_eq!(store.get(a).unwrap().as_str(), "<http://example.com/a>");
        assert_eq!(store.get(b).unwrap().as_str(), "<http://example.com/b>");
    }

    #[test]
    fn test_first_id_is_past_sentinels() {
        let (_dir, store) = temp_store();
        let a = store.intern("x").unwrap();
        assert_eq!(a.0, Atom::FIRST_INTERNED);
        assert!(store.get(Atom::DEFAULT_GRAPH).is_err());
        assert!(store.get(Atom::UNBOUND).is_err());
    }

    #[test]
    fn test_lookup_does_not_intern() {
        let (_dir, store) = temp_store();
        assert_eq!(store.lookup("absent").unwrap(), None);
        assert_eq!(store.len(), 0);

        let a = store.intern("present").unwrap();
        assert_eq!(store.lookup("present").unwrap(), Some(a));
    }

    #[test]
    fn test_text_survives_growth() {
        let (_dir, store) = temp_store();
        let a = store.intern("first").unwrap();
        let text = store.get(a).unwrap();

        // Force the dat file (and mapping epoch) to grow.
        for i in 0..1000 {
            store.intern(&format!("<http://example.com/{i}>")).unwrap();
        }
        assert_eq!(text.as_str(), "first");
        assert_eq!(store.get(a).unwrap().as_str(), "first");
    }

    #[test]
    fn test_oversized_atom() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomStore::open_with(dir.path(), Options { max_atom_len: 8 }).unwrap();
        assert!(matches!(
            store.intern("123456789"),
            Err(Error::Oversized { len: 9, max: 8 })
        ));
    }

    #[test]
    fn test_reopen_preserves_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<Atom> = {
            let store = AtomStore::open(dir.path()).unwrap();
            (0..100)
                .map(|i| store.intern(&format!("term-{i}")).unwrap())
                .collect()
        };

        let store = AtomStore::open(dir.path()).unwrap();
        for (i, &id) in ids.iter().enumerate() {
            assert_eq!(store.get(id).unwrap().as_str(), format!("term-{i}"));
            assert_eq!(store.intern(&format!("term-{i}")).unwrap(), id);
        }
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_rebuild_after_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        let a = {
            let store = AtomStore::open(dir.path()).unwrap();
            store.intern("keep-me").unwrap()
        };
        std::fs::remove_file(dir.path().join(IDX_FILE)).unwrap();

        let store = AtomStore::open(dir.path()).unwrap();
        assert_eq!(store.intern("keep-me").unwrap(), a);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AtomStore::open(dir.path()).unwrap();
            store.intern("alpha").unwrap();
            store.intern("beta").unwrap();
        }
        // Tear the dat tail mid-record: the length prefix promises more
        // bytes than the file holds.
        let dat = OpenOptions::new()
            .append(true)
            .open(dir.path().join(DAT_FILE))
            .unwrap();
        dat.write_all_at(&100u32.to_le_bytes(), dat.metadata().unwrap().len())
            .unwrap();

        let store = AtomStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        let gamma = store.intern("gamma").unwrap();
        assert_eq!(store.get(gamma).unwrap().as_str(), "gamma");
    }

    #[quickcheck]
    fn prop_intern_get_round_trip(terms: Vec<String>) -> bool {
        let (_dir, store) = temp_store();
        terms.iter().all(|term| {
            let id = store.intern(term).unwrap();
            store.get(id).unwrap().as_str() == term
        })
    }
}
