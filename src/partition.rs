//! Which systems are active on this process, and pathname ancestry.

use std::collections::BTreeSet;

use crate::SEPARATOR;

/// Decides whether a system participates in computation locally.
///
/// Inactive components get no vector storage and are skipped by every sweep.
pub trait Partition {
    /// Whether the system with this pathname runs here. The root is `""`.
    fn is_active(&self, pathname: &str) -> bool;
}

/// Single-process partition: everything is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct Serial;

impl Partition for Serial {
    fn is_active(&self, _pathname: &str) -> bool {
        true
    }
}

/// Marks the listed systems, and everything below them, inactive.
#[derive(Debug, Clone, Default)]
pub struct InactiveSet {
    inactive: BTreeSet<String>,
}

impl InactiveSet {
    pub fn new<I, S>(pathnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InactiveSet { inactive: pathnames.into_iter().map(Into::into).collect() }
    }
}

impl Partition for InactiveSet {
    fn is_active(&self, pathname: &str) -> bool {
        !self.inactive.iter().any(|p| is_ancestor_or_self(p, pathname))
    }
}

/// Whether `ancestor` is `pathname` or one of its enclosing systems.
pub fn is_ancestor_or_self(ancestor: &str, pathname: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    pathname == ancestor
        || (pathname.starts_with(ancestor) && pathname[ancestor.len()..].starts_with(SEPARATOR))
}

/// Lowest common system of two variable pathnames.
///
/// The last part of each name is the variable itself and never counts; the
/// root is `""`.
///
/// ```
/// use plexus::partition::common_ancestor;
///
/// assert_eq!(common_ancestor("g1:c1:y", "g1:c2:x"), "g1");
/// assert_eq!(common_ancestor("a:y", "b:x"), "");
/// ```
pub fn common_ancestor(a: &str, b: &str) -> String {
    let system = |name: &str| -> Vec<String> {
        let mut parts: Vec<String> = name.split(SEPARATOR).map(str::to_string).collect();
        parts.pop();
        parts
    };
    let (a, b) = (system(a), system(b));
    let common: Vec<String> =
        a.iter().zip(b.iter()).take_while(|(x, y)| x == y).map(|(x, _)| x.clone()).collect();
    common.join(&SEPARATOR.to_string())
}
