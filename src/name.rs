//! Interned two-part metric names.
//!
//! A cache covering thousands of archives holds millions of near-identical
//! dot-separated names that share long prefixes.  Storing each as an owned
//! `String` wastes memory; storing every dot-component separately wastes it
//! again on vector overhead.  A [`MetricName`] therefore keeps exactly two
//! interned pieces, a head and an optional tail, and trades computation for
//! storage: the joined form and the component list are rebuilt on demand.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Synthetic leaf name representing an archive's own time coverage.
pub const COVERAGE_METRIC: &str = "_";

lazy_static! {
    static ref INTERNER: RwLock<HashSet<Arc<str>>> = RwLock::new(HashSet::new());
}

/// Return a process-wide shared allocation for `s`.
fn intern(s: &str) -> Arc<str> {
    {
        let set = INTERNER.read();
        if let Some(found) = set.get(s) {
            return Arc::clone(found);
        }
    }
    let mut set = INTERNER.write();
    if let Some(found) = set.get(s) {
        return Arc::clone(found);
    }
    let entry: Arc<str> = Arc::from(s);
    set.insert(Arc::clone(&entry));
    entry
}

/// One dot-separated metric-name segment pair.
///
/// `head` may itself contain dots (e.g. a full metric path); `tail` is empty
/// when there is no further component.  Ordering and equality are by
/// `(head, tail)`, component-wise.
#[derive(Clone)]
pub struct MetricName {
    head: Arc<str>,
    tail: Arc<str>,
}

impl MetricName {
    /// A name with no tail component.
    pub fn leaf(head: &str) -> Self {
        debug_assert!(!head.is_empty(), "metric names must be non-empty");
        Self {
            head: intern(head),
            tail: intern(""),
        }
    }

    /// A name with an explicit tail component.
    pub fn with_tail(head: &str, tail: &str) -> Self {
        debug_assert!(!head.is_empty(), "metric names must be non-empty");
        Self {
            head: intern(head),
            tail: intern(tail),
        }
    }

    /// Prepend `head` to an existing name, e.g. an archive prefix to a
    /// cached metric name.
    pub fn prefixed(head: &str, rest: &MetricName) -> Self {
        Self::with_tail(head, &rest.unsplit())
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// The joined dot-separated form.
    pub fn unsplit(&self) -> String {
        if self.tail.is_empty() {
            self.head.to_string()
        } else {
            format!("{}.{}", self.head, self.tail)
        }
    }

    /// The full dot-tokenized component sequence.
    pub fn split(&self) -> Vec<String> {
        self.unsplit().split('.').map(str::to_string).collect()
    }

    /// Number of dot-separated components.
    pub fn split_size(&self) -> usize {
        let joined = self.unsplit();
        joined.chars().filter(|&c| c == '.').count() + 1
    }
}

impl PartialEq for MetricName {
    fn eq(&self, other: &Self) -> bool {
        // interned pieces compare by pointer first
        (Arc::ptr_eq(&self.head, &other.head) || *self.head == *other.head)
            && (Arc::ptr_eq(&self.tail, &other.tail) || *self.tail == *other.tail)
    }
}

impl Eq for MetricName {}

impl PartialOrd for MetricName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.head
            .cmp(&other.head)
            .then_with(|| self.tail.cmp(&other.tail))
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tail.is_empty() {
            write!(f, "{}", self.head)
        } else {
            write!(f, "{}.{}", self.head, self.tail)
        }
    }
}

impl fmt::Debug for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetricName({})", self)
    }
}
