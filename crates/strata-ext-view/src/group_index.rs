//! In-memory picture of every group's page chain.
//!
//! Pages are never linked by owning references; each group holds its
//! descriptors in walk order in a plain vector and a reverse map resolves a
//! page id to its group. All operations are O(pages-in-group), and with
//! 50-row pages that number stays small.
//!
//! Rebuilding from disk works off the persisted `prev` links alone: a
//! head map (`prev -> page`) is walked from the head page forward, cycles
//! and missing links fail the load, and the transient `next` links are
//! written back once the walk covered every page of the group.

use std::collections::{BTreeMap, HashMap};

use strata_error::{Result, StrataError};
use strata_types::{MAX_PAGE_SIZE, PageId};

use crate::page::PageMeta;

#[derive(Debug, Clone, Default)]
pub(crate) struct GroupIndex {
    groups: BTreeMap<String, Vec<PageMeta>>,
    page_groups: HashMap<PageId, String>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted descriptors of every page.
    ///
    /// Fails with [`StrataError::InvalidPageChain`] on a duplicate `prev`
    /// link, a missing head, a cycle or an unreachable page; the caller is
    /// expected to discard the index and force a repopulation.
    pub fn from_disk(metas: Vec<PageMeta>) -> Result<Self> {
        let mut raw: BTreeMap<String, Vec<PageMeta>> = BTreeMap::new();
        for meta in metas {
            raw.entry(meta.group.clone()).or_default().push(meta);
        }

        let mut index = Self::new();
        for (group, members) in raw {
            let total = members.len();
            let mut by_id: HashMap<PageId, PageMeta> = HashMap::with_capacity(total);
            let mut by_prev: HashMap<Option<PageId>, PageId> = HashMap::with_capacity(total);
            for meta in members {
                if let Some(clash) = by_prev.insert(meta.prev.clone(), meta.id.clone()) {
                    return Err(StrataError::invalid_chain(
                        group,
                        format!("pages {clash} and {} share a previous-page link", meta.id),
                    ));
                }
                by_id.insert(meta.id.clone(), meta);
            }

            let Some(head) = by_prev.get(&None).cloned() else {
                return Err(StrataError::invalid_chain(group, "no head page"));
            };

            let mut ordered = Vec::with_capacity(total);
            let mut current = head;
            loop {
                let Some(meta) = by_id.remove(&current) else {
                    return Err(StrataError::invalid_chain(
                        group,
                        format!("link cycle or foreign link at page {current}"),
                    ));
                };
                ordered.push(meta);
                match by_prev.get(&Some(current)) {
                    Some(next) => current = next.clone(),
                    None => break,
                }
            }
            if !by_id.is_empty() {
                return Err(StrataError::invalid_chain(
                    group,
                    format!("{} pages unreachable from the head", by_id.len()),
                ));
            }

            relink(&mut ordered);
            for meta in &ordered {
                index.page_groups.insert(meta.id.clone(), meta.group.clone());
            }
            index.groups.insert(group, ordered);
        }
        Ok(index)
    }

    // --- Queries ---

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn pages(&self, group: &str) -> Option<&[PageMeta]> {
        self.groups.get(group).map(Vec::as_slice)
    }

    pub fn group_of(&self, id: &PageId) -> Option<&str> {
        self.page_groups.get(id).map(String::as_str)
    }

    pub fn meta(&self, id: &PageId) -> Option<&PageMeta> {
        let group = self.page_groups.get(id)?;
        self.groups.get(group)?.iter().find(|m| &m.id == id)
    }

    pub fn meta_mut(&mut self, id: &PageId) -> Option<&mut PageMeta> {
        let group = self.page_groups.get(id)?.clone();
        self.groups
            .get_mut(&group)?
            .iter_mut()
            .find(|m| &m.id == id)
    }

    /// Total row count of one group.
    pub fn group_total(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map_or(0, |pages| pages.iter().map(|m| m.count).sum())
    }

    /// Total row count across every group.
    pub fn total(&self) -> usize {
        self.groups
            .values()
            .flat_map(|pages| pages.iter())
            .map(|m| m.count)
            .sum()
    }

    /// Absolute index of the first row of a page within its group.
    pub fn page_offset(&self, id: &PageId) -> Option<usize> {
        let group = self.page_groups.get(id)?;
        let mut offset = 0;
        for meta in self.groups.get(group)? {
            if &meta.id == id {
                return Some(offset);
            }
            offset += meta.count;
        }
        None
    }

    /// Resolve an absolute group index to the page holding that slot.
    ///
    /// Read path: the first page whose running total exceeds the index.
    pub fn page_containing(&self, group: &str, index: usize) -> Option<(PageId, usize)> {
        let mut offset = 0;
        for meta in self.groups.get(group)? {
            let end = offset + meta.count;
            if index < end {
                return Some((meta.id.clone(), index - offset));
            }
            offset = end;
        }
        None
    }

    /// Resolve an absolute insertion index to a (page, local slot) target.
    ///
    /// At an exact page boundary the slot goes to the head of the following
    /// page unless that page is already full, in which case it stays at the
    /// tail of the current one. Past the last page it lands at the tail.
    pub fn page_for_insert(&self, group: &str, index: usize) -> Option<(PageId, usize)> {
        let pages = self.groups.get(group)?;
        let mut offset = 0;
        for (i, meta) in pages.iter().enumerate() {
            let end = offset + meta.count;
            if index < end {
                return Some((meta.id.clone(), index - offset));
            }
            if index == end {
                if let Some(next) = pages.get(i + 1) {
                    if next.count < MAX_PAGE_SIZE {
                        return Some((next.id.clone(), 0));
                    }
                }
                return Some((meta.id.clone(), meta.count));
            }
            offset = end;
        }
        None
    }

    // --- Mutation ---

    /// Install the sole page of a brand-new group.
    pub fn insert_sole(&mut self, meta: PageMeta) {
        self.page_groups.insert(meta.id.clone(), meta.group.clone());
        self.groups.insert(meta.group.clone(), vec![meta]);
    }

    /// Splice a fresh page directly after an existing one.
    ///
    /// Fixes the chain links of both neighbours. Returns `None` when `after`
    /// is unknown; otherwise the id of the displaced successor (whose
    /// persisted `prev` link changed), if there was one.
    pub fn insert_after(
        &mut self,
        after: &PageId,
        mut meta: PageMeta,
    ) -> Option<Option<PageId>> {
        let group = self.page_groups.get(after)?.clone();
        let pages = self.groups.get_mut(&group)?;
        let pos = pages.iter().position(|m| &m.id == after)?;

        meta.group.clone_from(&group);
        meta.prev = Some(after.clone());
        meta.next = pages.get(pos + 1).map(|m| m.id.clone());
        let displaced = meta.next.clone();
        let new_id = meta.id.clone();

        pages[pos].next = Some(new_id.clone());
        if let Some(successor) = pages.get_mut(pos + 1) {
            successor.prev = Some(new_id.clone());
        }
        pages.insert(pos + 1, meta);
        self.page_groups.insert(new_id, group);
        Some(displaced)
    }

    /// Unlink and remove a page from its group.
    ///
    /// Returns the removed descriptor and the id of the following page
    /// (whose persisted `prev` link changed), if any. The group entry stays
    /// even when it becomes empty; callers decide when to drop it.
    pub fn remove_page(&mut self, id: &PageId) -> Option<(PageMeta, Option<PageId>)> {
        let group = self.page_groups.remove(id)?;
        let pages = self.groups.get_mut(&group)?;
        let pos = pages.iter().position(|m| &m.id == id)?;
        let removed = pages.remove(pos);

        if pos > 0 {
            pages[pos - 1].next = removed.next.clone();
        }
        let relinked = if let Some(successor) = pages.get_mut(pos) {
            successor.prev = removed.prev.clone();
            Some(successor.id.clone())
        } else {
            None
        };
        Some((removed, relinked))
    }

    /// Drop a group whose page list emptied. Returns true when dropped.
    pub fn remove_group_if_empty(&mut self, group: &str) -> bool {
        match self.groups.get(group) {
            Some(pages) if pages.is_empty() => {
                self.groups.remove(group);
                true
            }
            _ => false,
        }
    }

    /// Wipe everything (view clear).
    pub fn clear(&mut self) {
        self.groups.clear();
        self.page_groups.clear();
    }
}

/// Rewrite the prev/next links of an ordered chain in place.
fn relink(pages: &mut [PageMeta]) {
    let ids: Vec<PageId> = pages.iter().map(|m| m.id.clone()).collect();
    for (i, meta) in pages.iter_mut().enumerate() {
        meta.prev = if i > 0 { Some(ids[i - 1].clone()) } else { None };
        meta.next = ids.get(i + 1).cloned();
    }
}
