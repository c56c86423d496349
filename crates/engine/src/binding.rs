use crate::Value;
use atoms::Atom;

/// One variable binding: the FNV-1a hash of the variable name, spans of
/// the name and bound term text in the row's character arena, and the
/// term's atom id when it is interned in the store.
#[derive(Debug, Copy, Clone)]
pub struct Binding {
    pub hash: u64,
    name: (u32, u32),
    term: (u32, u32),
    pub atom: Option<Atom>,
}

/// Truncation point for backtracking: the active prefix length of the
/// descriptor array plus the arena watermark.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RowMark {
    bindings: usize,
    arena: usize,
}

/// A variable-binding row. Bindings share one descriptor array and one
/// character arena; extending appends to both, and backtracking is a
/// truncation to a recorded mark. String views returned from the row
/// are valid until the next truncation below them.
#[derive(Debug, Default, Clone)]
pub struct Row {
    bindings: Vec<Binding>,
    arena: String,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) -> RowMark {
        RowMark {
            bindings: self.bindings.len(),
            arena: self.arena.len(),
        }
    }

    /// Truncate back to `mark`, dropping every binding made after it.
    pub fn truncate(&mut self, mark: RowMark) {
        self.bindings.truncate(mark.bindings);
        self.arena.truncate(mark.arena);
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    fn push_arena(&mut self, text: &str) -> (u32, u32) {
        let start = self.arena.len() as u32;
        self.arena.push_str(text);
        (start, text.len() as u32)
    }

    /// Bind `name` to a term. The caller ensures the variable is not
    /// already bound (SPARQL never rebinds within one solution).
    pub fn bind(&mut self, name: &str, term_text: &str, atom: Option<Atom>) {
        let hash = atoms::fnv1a(name.as_bytes());
        debug_assert!(self.get(hash, name).is_none(), "rebinding ?{name}");
        let name_span = self.push_arena(name);
        let term_span = self.push_arena(term_text);
        self.bindings.push(Binding {
            hash,
            name: name_span,
            term: term_span,
            atom,
        });
    }

    fn span(&self, (start, len): (u32, u32)) -> &str {
        &self.arena[start as usize..(start + len) as usize]
    }

    pub fn name_of(&self, binding: &Binding) -> &str {
        self.span(binding.name)
    }

    pub fn term_text_of(&self, binding: &Binding) -> &str {
        self.span(binding.term)
    }

    /// Look up a binding by variable hash (and name, to disambiguate
    /// the unlikely hash collision).
    pub fn get(&self, hash: u64, name: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|b| b.hash == hash && self.span(b.name) == name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Binding> {
        self.get(atoms::fnv1a(name.as_bytes()), name)
    }

    pub fn value_of(&self, binding: &Binding) -> Value {
        Value::from_term_text(self.term_text_of(binding))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bind_and_get() {
        let mut row = Row::new();
        row.bind("s", "<http://e/a>", Some(Atom(2)));
        row.bind("o", "\"v\"", None);

        let s = row.get_by_name("s").copied().unwrap();
        assert_eq!(row.term_text_of(&s), "<http://e/a>");
        assert_eq!(s.atom, Some(Atom(2)));
        assert!(row.get_by_name("missing").is_none());
    }

    #[test]
    fn test_truncate_backtracks() {
        let mut row = Row::new();
        row.bind("a", "<http://e/1>", None);
        let mark = row.mark();
        row.bind("b", "<http://e/2>", None);
        row.bind("c", "<http://e/3>", None);
        assert_eq!(row.len(), 3);

        row.truncate(mark);
        assert_eq!(row.len(), 1);
        assert!(row.get_by_name("b").is_none());
        assert!(row.get_by_name("a").is_some());

        // Rebinding after truncation reuses the arena cleanly.
        row.bind("b", "<http://e/4>", None);
        let b = row.get_by_name("b").copied().unwrap();
        assert_eq!(row.term_text_of(&b), "<http://e/4>");
    }

    #[test]
    fn test_value_decoding() {
        let mut row = Row::new();
        row.bind(
            "n",
            "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>",
            None,
        );
        let n = row.get_by_name("n").copied().unwrap();
        assert_eq!(row.value_of(&n), Value::Integer(42));
    }
}
