use atoms::Atom;
use byteorder::{BigEndian, ByteOrder};

/// Microseconds since the Unix epoch. Signed: instants before the epoch
/// are legal valid-time bounds.
pub type Instant = i64;

/// The open-ended `valid_to` bound, encoding "current / forever".
pub const FOREVER: Instant = i64::MAX;

/// Length of the composite key:
/// `graph(8) | subject(8) | predicate(8) | object(8) | valid_from(8) | valid_to(8) | tx_time(8)`.
pub const KEY_LEN: usize = 56;

const GRAPH_OFF: usize = 0;
const SUBJECT_OFF: usize = 8;
const PREDICATE_OFF: usize = 16;
const OBJECT_OFF: usize = 24;
const VALID_FROM_OFF: usize = 32;
const VALID_TO_OFF: usize = 40;
const TX_TIME_OFF: usize = 48;

/// Bias a signed instant so that unsigned big-endian byte comparison
/// of the encoding matches signed comparison of the instant.
#[inline]
pub fn encode_instant(instant: Instant) -> u64 {
    (instant as u64) ^ (1 << 63)
}

#[inline]
pub fn decode_instant(encoded: u64) -> Instant {
    (encoded ^ (1 << 63)) as Instant
}

/// The fixed-width composite key of the primary index. Keys compare as
/// unsigned big-endian byte strings, which by construction equals the
/// tuple order (graph, subject, predicate, object, valid_from, valid_to,
/// tx_time): atoms are stored big-endian and instants are sign-biased.
///
/// Graph-first (GSPO) ordering keeps each graph's quads contiguous, so
/// range scans within one graph never leave its key range.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuadKey(pub [u8; KEY_LEN]);

impl QuadKey {
    pub fn pack(
        graph: Atom,
        subject: Atom,
        predicate: Atom,
        object: Atom,
        valid_from: Instant,
        valid_to: Instant,
        tx_time: Instant,
    ) -> Self {
        let mut k = [0u8; KEY_LEN];
        BigEndian::write_u64(&mut k[GRAPH_OFF..], graph.0);
        BigEndian::write_u64(&mut k[SUBJECT_OFF..], subject.0);
        BigEndian::write_u64(&mut k[PREDICATE_OFF..], predicate.0);
        BigEndian::write_u64(&mut k[OBJECT_OFF..], object.0);
        BigEndian::write_u64(&mut k[VALID_FROM_OFF..], encode_instant(valid_from));
        BigEndian::write_u64(&mut k[VALID_TO_OFF..], encode_instant(valid_to));
        BigEndian::write_u64(&mut k[TX_TIME_OFF..], encode_instant(tx_time));
        Self(k)
    }

    #[inline]
    pub fn graph(&self) -> Atom {
        Atom(BigEndian::read_u64(&self.0[GRAPH_OFF..]))
    }
    #[inline]
    pub fn subject(&self) -> Atom {
        Atom(BigEndian::read_u64(&self.0[SUBJECT_OFF..]))
    }
    #[inline]
    pub fn predicate(&self) -> Atom {
        Atom(BigEndian::read_u64(&self.0[PREDICATE_OFF..]))
    }
    #[inline]
    pub fn object(&self) -> Atom {
        Atom(BigEndian::read_u64(&self.0[OBJECT_OFF..]))
    }
    #[inline]
    pub fn valid_from(&self) -> Instant {
        decode_instant(BigEndian::read_u64(&self.0[VALID_FROM_OFF..]))
    }
    #[inline]
    pub fn valid_to(&self) -> Instant {
        decode_instant(BigEndian::read_u64(&self.0[VALID_TO_OFF..]))
    }
    #[inline]
    pub fn tx_time(&self) -> Instant {
        decode_instant(BigEndian::read_u64(&self.0[TX_TIME_OFF..]))
    }

    /// The (g, s, p, o, valid_from, valid_to) prefix identifying a
    /// version chain: entries differing only in tx_time supersede one
    /// another within it.
    #[inline]
    pub fn chain(&self) -> &[u8] {
        &self.0[..TX_TIME_OFF]
    }

    pub fn quad(&self, tombstone: bool) -> Quad {
        Quad {
            graph: self.graph(),
            subject: self.subject(),
            predicate: self.predicate(),
            object: self.object(),
            valid_from: self.valid_from(),
            valid_to: self.valid_to(),
            tx_time: self.tx_time(),
            tombstone,
        }
    }
}

impl std::fmt::Debug for QuadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "QuadKey(g={} s={} p={} o={} [{}, {}) @{})",
            self.graph().0,
            self.subject().0,
            self.predicate().0,
            self.object().0,
            self.valid_from(),
            self.valid_to(),
            self.tx_time(),
        )
    }
}

/// One stored quad version, fully decoded. All components are plain
/// copyable ids and instants; term text is resolved separately through
/// the atom store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Quad {
    pub graph: Atom,
    pub subject: Atom,
    pub predicate: Atom,
    pub object: Atom,
    pub valid_from: Instant,
    pub valid_to: Instant,
    pub tx_time: Instant,
    pub tombstone: bool,
}

impl Quad {
    pub fn key(&self) -> QuadKey {
        QuadKey::pack(
            self.graph,
            self.subject,
            self.predicate,
            self.object,
            self.valid_from,
            self.valid_to,
            self.tx_time,
        )
    }

    /// Whether this version's validity interval covers `at`.
    #[inline]
    pub fn valid_at(&self, at: Instant) -> bool {
        self.valid_from <= at && at < self.valid_to
    }

    /// Whether this version's validity interval overlaps `[from, to)`.
    #[inline]
    pub fn valid_overlaps(&self, from: Instant, to: Instant) -> bool {
        self.valid_from < to && from < self.valid_to
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_pack_round_trip() {
        let key = QuadKey::pack(Atom(3), Atom(4), Atom(5), Atom(6), 1000, FOREVER, 7000);
        assert_eq!(key.graph(), Atom(3));
        assert_eq!(key.subject(), Atom(4));
        assert_eq!(key.predicate(), Atom(5));
        assert_eq!(key.object(), Atom(6));
        assert_eq!(key.valid_from(), 1000);
        assert_eq!(key.valid_to(), FOREVER);
        assert_eq!(key.tx_time(), 7000);
    }

    #[test]
    fn test_half_open_interval() {
        let quad = QuadKey::pack(Atom(2), Atom(2), Atom(2), Atom(2), 1000, 1000, 0).quad(false);
        // valid_from == valid_to is never live.
        assert!(!quad.valid_at(1000));
        assert!(!quad.valid_at(999));

        let quad = QuadKey::pack(Atom(2), Atom(2), Atom(2), Atom(2), 1000, 2000, 0).quad(false);
        assert!(quad.valid_at(1000));
        assert!(quad.valid_at(1999));
        assert!(!quad.valid_at(2000));
    }

    #[test]
    fn test_negative_instants_sort_before_positive() {
        let older = QuadKey::pack(Atom(2), Atom(2), Atom(2), Atom(2), -5, FOREVER, 0);
        let newer = QuadKey::pack(Atom(2), Atom(2), Atom(2), Atom(2), 5, FOREVER, 0);
        assert!(older.0 < newer.0);
    }

    #[quickcheck]
    fn prop_byte_order_matches_tuple_order(
        a: (u64, u64, u64, u64, i64, i64, i64),
        b: (u64, u64, u64, u64, i64, i64, i64),
    ) -> bool {
        let ka = QuadKey::pack(Atom(a.0), Atom(a.1), Atom(a.2), Atom(a.3), a.4, a.5, a.6);
        let kb = QuadKey::pack(Atom(b.0), Atom(b.1), Atom(b.2), Atom(b.3), b.4, b.5, b.6);
        ka.0.cmp(&kb.0) == a.cmp(&b)
    }
}
