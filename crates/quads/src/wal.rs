use crate::{Error, QuadKey, KEY_LEN};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Fixed record length: magic (4) | kind (4) | tx id (8) | composite
/// key (56) | CRC32 over the preceding 72 bytes, stored in a trailing
/// 8-byte field to keep records 8-byte aligned.
pub const WAL_RECORD_LEN: usize = 80;

const WAL_MAGIC: u32 = 0x7374_7277; // "strw"
const CRC_OFFSET: usize = 72;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalRecordKind {
    Insert,
    Tombstone,
    Checkpoint,
}

impl WalRecordKind {
    fn from_u32(v: u32) -> Result<Self, Error> {
        match v {
            1 => Ok(WalRecordKind::Insert),
            2 => Ok(WalRecordKind::Tombstone),
            3 => Ok(WalRecordKind::Checkpoint),
            other => Err(Error::Corrupt(format!("bad WAL record kind {other}"))),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            WalRecordKind::Insert => 1,
            WalRecordKind::Tombstone => 2,
            WalRecordKind::Checkpoint => 3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub tx_id: u64,
    pub key: QuadKey,
}

impl WalRecord {
    pub fn checkpoint(tx_id: u64) -> Self {
        Self {
            kind: WalRecordKind::Checkpoint,
            tx_id,
            key: QuadKey([0u8; KEY_LEN]),
        }
    }

    pub fn encode(&self) -> [u8; WAL_RECORD_LEN] {
        let mut buf = [0u8; WAL_RECORD_LEN];
        LittleEndian::write_u32(&mut buf[0..4], WAL_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.kind.to_u32());
        LittleEndian::write_u64(&mut buf[8..16], self.tx_id);
        buf[16..16 + KEY_LEN].copy_from_slice(&self.key.0);
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut buf[CRC_OFFSET..CRC_OFFSET + 4], crc);
        buf
    }

    /// Decode and verify one record. A record that fails the magic or
    /// CRC check is indistinguishable from a torn tail; callers stop
    /// replay there.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < WAL_RECORD_LEN {
            return Err(Error::Corrupt("short WAL record".to_string()));
        }
        if LittleEndian::read_u32(&buf[0..4]) != WAL_MAGIC {
            return Err(Error::Corrupt("bad WAL record magic".to_string()));
        }
        let crc = LittleEndian::read_u32(&buf[CRC_OFFSET..CRC_OFFSET + 4]);
        if crc != crc32fast::hash(&buf[..CRC_OFFSET]) {
            return Err(Error::Corrupt("WAL record CRC mismatch".to_string()));
        }
        let kind = WalRecordKind::from_u32(LittleEndian::read_u32(&buf[4..8]))?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[16..16 + KEY_LEN]);
        Ok(Self {
            kind,
            tx_id: LittleEndian::read_u64(&buf[8..16]),
            key: QuadKey(key),
        })
    }
}

/// Append-with-fsync write-ahead log. Batch records accumulate in an
/// in-memory buffer; `commit` writes them with a single fsync, so one
/// fsync amortizes across the whole batch.
pub struct Wal {
    file: File,
    /// Bytes of the file holding committed records.
    durable_len: u64,
    pending: Vec<u8>,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            durable_len,
            pending: Vec::new(),
        })
    }

    pub fn durable_len(&self) -> u64 {
        self.durable_len
    }

    pub fn pending_records(&self) -> usize {
        self.pending.len() / WAL_RECORD_LEN
    }

    /// Buffer a record for the current batch.
    pub fn append(&mut self, record: &WalRecord) {
        self.pending.extend_from_slice(&record.encode());
    }

    /// Flush the buffered batch and fsync. On a write failure the file
    /// is truncated back to the last committed boundary so the failed
    /// batch leaves no trace; if even that fails, the error is surfaced
    /// for the store to poison itself.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = (|| -> std::io::Result<()> {
            self.file.seek(SeekFrom::Start(self.durable_len))?;
            self.file.write_all(&self.pending)?;
            self.file.sync_data()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.pending.clear();
                Ok(())
            }
            Err(err) => {
                self.pending.clear();
                self.file.set_len(self.durable_len)?;
                Err(err.into())
            }
        }
    }

    /// Drop the buffered batch without touching the file.
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Scan committed records from `offset`, invoking `apply` for each
    /// well-formed insert/tombstone record. A torn or corrupt record
    /// terminates the scan and the file is truncated to the last valid
    /// boundary. Returns the number of records replayed.
    pub fn replay_from(
        &mut self,
        offset: u64,
        mut apply: impl FnMut(&WalRecord) -> Result<(), Error>,
    ) -> Result<usize, Error> {
        use std::io::Read;

        if offset >= self.durable_len {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut tail = Vec::with_capacity((self.durable_len - offset) as usize);
        self.file.read_to_end(&mut tail)?;

        let mut replayed = 0usize;
        let mut good = 0usize;
        for chunk in tail.chunks(WAL_RECORD_LEN) {
            let record = match WalRecord::decode(chunk) {
                Ok(record) => record,
                Err(_) => break,
            };
            if record.kind != WalRecordKind::Checkpoint {
                apply(&record)?;
                replayed += 1;
            }
            good += WAL_RECORD_LEN;
        }

        if (good as u64) < self.durable_len - offset {
            let boundary = offset + good as u64;
            tracing::warn!(
                torn_bytes = self.durable_len - boundary,
                "truncating torn WAL tail"
            );
            self.file.set_len(boundary)?;
            self.durable_len = boundary;
        }
        Ok(replayed)
    }

    /// Checkpoint epilogue: discard the applied log and leave a single
    /// checkpoint marker. Returns the offset replay should start from.
    pub fn reset_for_checkpoint(&mut self, tx_id: u64) -> Result<u64, Error> {
        self.pending.clear();
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&WalRecord::checkpoint(tx_id).encode())?;
        self.file.sync_data()?;
        self.durable_len = WAL_RECORD_LEN as u64;
        Ok(self.durable_len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use atoms::Atom;
    use std::os::unix::fs::FileExt;

    fn record(n: u64) -> WalRecord {
        WalRecord {
            kind: WalRecordKind::Insert,
            tx_id: n,
            key: QuadKey::pack(Atom(2), Atom(n), Atom(3), Atom(4), 0, i64::MAX, n as i64),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let r = record(7);
        assert_eq!(WalRecord::decode(&r.encode()).unwrap(), r);
    }

    #[test]
    fn test_decode_rejects_bit_flips() {
        let mut buf = record(7).encode();
        buf[20] ^= 0x01;
        assert!(WalRecord::decode(&buf).is_err());
    }

    #[test]
    fn test_commit_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gspo.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for n in 0..10 {
                wal.append(&record(n));
            }
            wal.commit().unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay_from(0, |r| {
            seen.push(r.tx_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_rollback_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gspo.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(1));
        wal.rollback();
        wal.append(&record(2));
        wal.commit().unwrap();

        let mut seen = Vec::new();
        wal.replay_from(0, |r| {
            seen.push(r.tx_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gspo.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record(1));
            wal.append(&record(2));
            wal.commit().unwrap();
        }
        // Append half a record: a crash mid-write.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.write_all_at(&record(3).encode()[..40], len).unwrap();

        let mut wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay_from(0, |r| {
            seen.push(r.tx_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(wal.durable_len(), 2 * WAL_RECORD_LEN as u64);
    }

    #[test]
    fn test_checkpoint_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("gspo.wal")).unwrap();
        for n in 0..100 {
            wal.append(&record(n));
        }
        wal.commit().unwrap();

        let offset = wal.reset_for_checkpoint(99).unwrap();
        assert_eq!(offset, WAL_RECORD_LEN as u64);
        let mut replayed = 0;
        wal.replay_from(offset, |_| {
            replayed += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed, 0);
    }
}
