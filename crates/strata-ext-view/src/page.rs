//! Pages and page descriptors.
//!
//! A page is a bounded ordered run of row ids, persisted as one blob. Its
//! descriptor ([`PageMeta`]) carries the group label, the persisted link to
//! the previous page and the row count; the forward link is derived when the
//! group index is rebuilt and never hits disk.

use serde::{Deserialize, Serialize};
use strata_types::{PageId, RowId};

/// Mint a fresh page identifier.
///
/// UUID v4 from the process RNG. Uniqueness is assumed for the lifetime of
/// the database; a collision would be fatal corruption.
pub(crate) fn new_page_id() -> PageId {
    PageId::from_string(uuid::Uuid::new_v4().to_string())
}

/// An ordered run of row ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Page {
    rows: Vec<RowId>,
}

impl Page {
    /// A page holding a single row.
    pub fn with_row(row: RowId) -> Self {
        Self { rows: vec![row] }
    }

    /// A page holding an already-ordered run of rows.
    pub fn from_rows(rows: Vec<RowId>) -> Self {
        Self { rows }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn rows(&self) -> &[RowId] {
        &self.rows
    }

    pub fn get(&self, local: usize) -> Option<&RowId> {
        self.rows.get(local)
    }

    /// Position of a row within this page.
    pub fn index_of(&self, row: &RowId) -> Option<usize> {
        self.rows.iter().position(|r| r == row)
    }

    pub fn insert(&mut self, local: usize, row: RowId) {
        self.rows.insert(local, row);
    }

    pub fn remove(&mut self, local: usize) -> RowId {
        self.rows.remove(local)
    }

    /// Detach the first `n` rows, preserving their order.
    pub fn take_head(&mut self, n: usize) -> Vec<RowId> {
        let n = n.min(self.rows.len());
        self.rows.drain(..n).collect()
    }

    /// Detach the last `n` rows, preserving their order.
    pub fn take_tail(&mut self, n: usize) -> Vec<RowId> {
        let n = n.min(self.rows.len());
        let split = self.rows.len() - n;
        self.rows.split_off(split)
    }

    /// Append a run of rows at the tail.
    pub fn append(&mut self, rows: Vec<RowId>) {
        self.rows.extend(rows);
    }

    /// Insert a run of rows before the head.
    pub fn prepend(&mut self, rows: Vec<RowId>) {
        self.rows.splice(0..0, rows);
    }
}

/// Descriptor of one page: identity, group, chain links and row count.
///
/// `prev` is persisted; `next` is transient and rebuilt from the `prev`
/// links when the group index is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageMeta {
    pub id: PageId,
    pub group: String,
    pub prev: Option<PageId>,
    pub next: Option<PageId>,
    pub count: usize,
}

impl PageMeta {
    /// Descriptor for a fresh sole page of a group.
    pub fn sole(id: PageId, group: impl Into<String>, count: usize) -> Self {
        Self {
            id,
            group: group.into(),
            prev: None,
            next: None,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str) -> RowId {
        RowId::new("c", key)
    }

    fn page_of(keys: &[&str]) -> Page {
        Page::from_rows(keys.iter().map(|k| row(k)).collect())
    }

    #[test]
    fn test_new_page_id_is_uuid_shaped() {
        let id = new_page_id();
        let s = id.as_str();
        assert_eq!(s.len(), 36);
        assert_eq!(s.chars().filter(|c| *c == '-').count(), 4);
        assert_ne!(new_page_id(), id);
    }

    #[test]
    fn test_insert_remove_index_of() {
        let mut page = page_of(&["a", "c"]);
        page.insert(1, row("b"));
        assert_eq!(page.rows(), &[row("a"), row("b"), row("c")]);
        assert_eq!(page.index_of(&row("b")), Some(1));
        assert_eq!(page.remove(0), row("a"));
        assert_eq!(page.index_of(&row("a")), None);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_take_head_preserves_order() {
        let mut page = page_of(&["a", "b", "c", "d"]);
        let head = page.take_head(2);
        assert_eq!(head, vec![row("a"), row("b")]);
        assert_eq!(page.rows(), &[row("c"), row("d")]);
    }

    #[test]
    fn test_take_tail_preserves_order() {
        let mut page = page_of(&["a", "b", "c", "d"]);
        let tail = page.take_tail(2);
        assert_eq!(tail, vec![row("c"), row("d")]);
        assert_eq!(page.rows(), &[row("a"), row("b")]);
    }

    #[test]
    fn test_take_more_than_len_is_clamped() {
        let mut page = page_of(&["a"]);
        assert_eq!(page.take_tail(5), vec![row("a")]);
        assert!(page.is_empty());
    }

    #[test]
    fn test_prepend_keeps_run_order() {
        let mut page = page_of(&["c", "d"]);
        page.prepend(vec![row("a"), row("b")]);
        assert_eq!(page.rows(), &[row("a"), row("b"), row("c"), row("d")]);
    }
}
