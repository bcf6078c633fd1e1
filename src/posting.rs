//! Postings: the (term, document) occurrence pairs the index is built from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a vocabulary entry.
pub type Term = u64;

/// Identifier of a document.
pub type DocId = u64;

/// A single (term, document) occurrence.
///
/// Postings order by term first and document second; the derived `Ord`
/// relies on the field declaration order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Posting {
    /// Term identifier (primary sort key).
    pub term: Term,
    /// Document identifier (secondary sort key).
    pub doc: DocId,
}

impl Posting {
    /// Create a new posting.
    pub const fn new(term: Term, doc: DocId) -> Self {
        Posting { term, doc }
    }
}

impl From<(Term, DocId)> for Posting {
    fn from((term, doc): (Term, DocId)) -> Self {
        Posting { term, doc }
    }
}

impl fmt::Display for Posting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.doc)
    }
}
