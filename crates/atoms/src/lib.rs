/// An Atom is a stable 64-bit identifier for a syntactic RDF term string:
/// an IRI in angle brackets, a blank node label `_:x`, or a literal with
/// its quoting, datatype, and language tag intact. Atoms are append-only:
/// once assigned, an id maps to the same bytes for the life of the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Atom(pub u64);

impl Atom {
    /// Reserved id naming the default graph. It has no interned text.
    pub const DEFAULT_GRAPH: Atom = Atom(0);
    /// Reserved id that is never bound to a term.
    pub const UNBOUND: Atom = Atom(1);
    /// The first id handed out by interning.
    pub const FIRST_INTERNED: u64 = 2;

    /// Whether this atom is one of the two reserved sentinels.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.0 < Self::FIRST_INTERNED
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// FNV-1a over `bytes`. This is part of the `atoms.idx` file format
/// (slot placement is `fnv1a(term) % capacity`), so it is pinned here
/// rather than delegated to a general-purpose hasher.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("term of {len} bytes exceeds the maximum atom size of {max}")]
    Oversized { len: usize, max: usize },
    #[error("unknown atom id {0}")]
    UnknownAtom(u64),
    #[error("atom store is poisoned by a prior storage error")]
    Poisoned,
    #[error("atom store corruption: {0}")]
    Corrupt(String),
    #[error("interned bytes of atom id {0} are not valid UTF-8")]
    NotUtf8(u64),
    #[error("atom store I/O: {0}")]
    Io(#[from] std::io::Error),
}

mod store;
pub use store::{AtomStore, AtomText, Options};

#[cfg(test)]
mod test {
    use super::fnv1a;

    #[test]
    fn test_fnv1a_vectors() {
        // Reference vectors for 64-bit FNV-1a.
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }
}
