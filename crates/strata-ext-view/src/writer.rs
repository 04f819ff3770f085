//! The write-side of the view: per-transaction overlay and mutator paths.
//!
//! A write transaction never touches shared state. It works on a
//! [`WriterState`]: a private clone of the group index plus dirty sets for
//! page bodies, page descriptors and keymap entries, the change log, and the
//! bookkeeping the insert fast paths need. The overlay is flushed into the
//! enclosing SQL transaction at commit and merged into the shared snapshot
//! only after the commit succeeds; dropping it is a complete rollback.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use strata_error::{Result, StrataError};
use strata_types::{CallbackShape, ColumnFlags, MAX_PAGE_SIZE, PageId, RowId};
use tracing::{debug, warn};

use crate::cache::{BoundedCache, SharedCaches};
use crate::changelog::ChangeLog;
use crate::compare::{Candidate, Fetcher, GroupingFn, SortingFn, compare_rows, evaluate_group};
use crate::group_index::GroupIndex;
use crate::page::{Page, PageMeta, new_page_id};
use crate::store::PageStore;

// ---------------------------------------------------------------------------
// WriterState
// ---------------------------------------------------------------------------

/// The dirty overlay of one write transaction.
pub(crate) struct WriterState {
    /// Private copy of the group index, mutated freely.
    pub index: GroupIndex,
    /// Page bodies loaded (and possibly modified) by this transaction.
    pub pages: HashMap<PageId, Page>,
    /// Pages whose body changed.
    pub dirty_pages: HashSet<PageId>,
    /// Pages whose descriptor changed (count or prev link).
    pub dirty_metas: HashSet<PageId>,
    /// Keymap changes; `None` tombstones a mapping.
    pub dirty_mappings: HashMap<RowId, Option<PageId>>,
    /// Pages dropped by the rebalancer.
    pub deleted_pages: HashSet<PageId>,
    /// Change records in program order.
    pub log: ChangeLog,
    /// Groups structurally mutated since the last enumeration started.
    pub mutated_groups: HashSet<String>,
    /// The whole view was cleared in this transaction.
    pub cleared: bool,
    /// The previous insert landed at index 0 of its group.
    pub last_insert_at_head: bool,
    /// The previous insert landed at the end of its group.
    pub last_insert_at_tail: bool,
    /// Lazy-fetch caches for counterpart rows during comparisons.
    pub objects: BoundedCache<RowId, Arc<Vec<u8>>>,
    pub metadatas: BoundedCache<RowId, Option<Arc<Vec<u8>>>>,
}

impl WriterState {
    pub fn new(index: GroupIndex, object_cache_limit: usize, metadata_cache_limit: usize) -> Self {
        Self {
            index,
            pages: HashMap::new(),
            dirty_pages: HashSet::new(),
            dirty_metas: HashSet::new(),
            dirty_mappings: HashMap::new(),
            deleted_pages: HashSet::new(),
            log: ChangeLog::default(),
            mutated_groups: HashSet::new(),
            cleared: false,
            last_insert_at_head: false,
            last_insert_at_tail: false,
            objects: BoundedCache::new(object_cache_limit),
            metadatas: BoundedCache::new(metadata_cache_limit),
        }
    }
}

impl std::fmt::Debug for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterState")
            .field("dirty_pages", &self.dirty_pages.len())
            .field("dirty_metas", &self.dirty_metas.len())
            .field("dirty_mappings", &self.dirty_mappings.len())
            .field("log", &self.log.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WriteCtx
// ---------------------------------------------------------------------------

/// Everything a mutator path needs, bundled for one call.
pub(crate) struct WriteCtx<'a> {
    pub sql: &'a Connection,
    pub store: &'a PageStore,
    pub grouping: &'a GroupingFn,
    pub sorting: &'a SortingFn,
    pub caches: &'a Mutex<SharedCaches>,
    pub state: &'a mut WriterState,
}

impl WriteCtx<'_> {
    // --- Overlay-aware primitives ---

    /// Resolve a row to its page through overlay, shared cache, then disk.
    pub fn lookup_mapping(&mut self, row: &RowId) -> Result<Option<PageId>> {
        if let Some(entry) = self.state.dirty_mappings.get(row) {
            return Ok(entry.clone());
        }
        if let Some(hit) = self.caches.lock().mappings.get(row) {
            return Ok(hit.clone());
        }
        let mapping = self.store.lookup_key_map(self.sql, row)?;
        self.caches
            .lock()
            .mappings
            .insert(row.clone(), mapping.clone());
        Ok(mapping)
    }

    /// Make sure a page body is resident in the overlay and return it.
    pub fn page_mut(&mut self, id: &PageId) -> Result<&mut Page> {
        if self.state.deleted_pages.contains(id) {
            return Err(StrataError::internal(format!(
                "access to deleted page {id}"
            )));
        }
        if !self.state.pages.contains_key(id) {
            let cached = self.caches.lock().pages.get(id).cloned();
            let page = match cached {
                Some(page) => page,
                None => self.store.read_page(self.sql, id)?,
            };
            if let Some(meta) = self.state.index.meta(id) {
                if meta.count != page.len() {
                    return Err(StrataError::corrupt(format!(
                        "page {id} holds {} rows but its descriptor says {}",
                        page.len(),
                        meta.count
                    )));
                }
            }
            self.state.pages.insert(id.clone(), page);
        }
        self.state
            .pages
            .get_mut(id)
            .ok_or_else(|| StrataError::internal(format!("page {id} vanished from overlay")))
    }

    /// The row at an absolute index of a group.
    pub fn row_at(&mut self, group: &str, index: usize) -> Result<RowId> {
        let (pid, local) = self
            .state
            .index
            .page_containing(group, index)
            .ok_or_else(|| {
                StrataError::internal(format!("index {index} out of bounds in group '{group}'"))
            })?;
        let page = self.page_mut(&pid)?;
        page.get(local).cloned().ok_or_else(|| {
            StrataError::internal(format!("slot {local} missing in page {pid}"))
        })
    }

    /// Absolute index of a row known to live in the given page.
    fn absolute_index_of(&mut self, pid: &PageId, row: &RowId) -> Result<usize> {
        let offset = self.state.index.page_offset(pid).ok_or_else(|| {
            StrataError::internal(format!("page {pid} is not in the group index"))
        })?;
        let page = self.page_mut(pid)?;
        let local = page.index_of(row).ok_or_else(|| {
            StrataError::internal(format!("row {row} is not in its mapped page {pid}"))
        })?;
        Ok(offset + local)
    }

    fn compare(&mut self, candidate: Candidate<'_>, other: &RowId) -> Result<Ordering> {
        let state = &mut *self.state;
        let mut fetcher = Fetcher::new(self.sql, &mut state.objects, &mut state.metadatas);
        compare_rows(&mut fetcher, self.sorting, candidate, other)
    }

    fn group_of(&mut self, candidate: Candidate<'_>) -> Result<Option<String>> {
        let state = &mut *self.state;
        let mut fetcher = Fetcher::new(self.sql, &mut state.objects, &mut state.metadatas);
        evaluate_group(&mut fetcher, self.grouping, candidate)
    }

    fn invalidate_fetch_caches(&mut self, row: &RowId, columns: ColumnFlags) {
        if columns.contains(ColumnFlags::OBJECT) {
            self.state.objects.remove(row);
        }
        if columns.contains(ColumnFlags::METADATA) {
            self.state.metadatas.remove(row);
        }
    }

    /// Current (group, absolute index) of a row, if it is in the view.
    pub fn locate(&mut self, row: &RowId) -> Result<Option<(String, usize)>> {
        let Some(pid) = self.lookup_mapping(row)? else {
            return Ok(None);
        };
        let Some(group) = self.state.index.group_of(&pid).map(str::to_owned) else {
            return Ok(None);
        };
        let index = self.absolute_index_of(&pid, row)?;
        Ok(Some((group, index)))
    }

    // --- Hook entry points ---

    /// Full write of a row: both columns replaced.
    pub fn apply_set(
        &mut self,
        row: RowId,
        object: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.invalidate_fetch_caches(&row, ColumnFlags::all());
        let candidate = Candidate {
            row: &row,
            object: Some(object),
            metadata: Some(metadata),
        };
        match self.group_of(candidate)? {
            Some(group) => self.insert_row(
                row,
                Some(object),
                Some(metadata),
                &group,
                ColumnFlags::all(),
                false,
            ),
            None => self.remove_row(&row),
        }
    }

    /// Metadata-only write of a row.
    pub fn apply_set_metadata(&mut self, row: RowId, metadata: Option<&[u8]>) -> Result<()> {
        self.invalidate_fetch_caches(&row, ColumnFlags::METADATA);

        let reads_metadata = self.grouping.shape().reads_metadata()
            || self.sorting.shape().reads_metadata();
        if !reads_metadata {
            // Neither callback looks at metadata: the group and the position
            // cannot have changed, so a present row gets a plain update.
            if let Some((group, index)) = self.locate(&row)? {
                self.state
                    .log
                    .update_row(row, &group, index, ColumnFlags::METADATA);
            }
            return Ok(());
        }

        let candidate = Candidate {
            row: &row,
            object: None,
            metadata: Some(metadata),
        };
        match self.group_of(candidate)? {
            Some(group) => self.insert_row(
                row,
                None,
                Some(metadata),
                &group,
                ColumnFlags::METADATA,
                false,
            ),
            None => self.remove_row(&row),
        }
    }

    /// Row deletion.
    pub fn apply_remove(&mut self, row: &RowId) -> Result<()> {
        self.invalidate_fetch_caches(row, ColumnFlags::all());
        self.remove_row(row)
    }

    /// Bulk deletion of specific keys in one collection.
    pub fn apply_remove_many(&mut self, collection: &str, keys: &[String]) -> Result<()> {
        let disk = self.store.scan_key_map_keys(self.sql, collection, keys)?;
        let mut victims: HashMap<RowId, PageId> = disk
            .into_iter()
            .map(|(key, pid)| (RowId::new(collection, key), pid))
            .collect();
        // The mapping table lags the overlay by design; fold in the
        // transaction's own keymap changes.
        for key in keys {
            let row = RowId::new(collection, key.as_str());
            match self.state.dirty_mappings.get(&row) {
                Some(Some(pid)) => {
                    victims.insert(row, pid.clone());
                }
                Some(None) => {
                    victims.remove(&row);
                }
                None => {}
            }
        }
        if victims.len() < keys.len() {
            warn!(
                collection,
                asked = keys.len(),
                found = victims.len(),
                "bulk remove: some rows were not in the view"
            );
        }
        self.remove_mapped_rows(victims)
    }

    /// Bulk deletion of a whole collection.
    pub fn apply_remove_collection(&mut self, collection: &str) -> Result<()> {
        let disk = self.store.scan_key_map_collection(self.sql, collection)?;
        let mut victims: HashMap<RowId, PageId> = disk
            .into_iter()
            .map(|(key, pid)| (RowId::new(collection, key), pid))
            .collect();
        let overlay: Vec<(RowId, Option<PageId>)> = self
            .state
            .dirty_mappings
            .iter()
            .filter(|(row, _)| row.collection == collection)
            .map(|(row, mapping)| (row.clone(), mapping.clone()))
            .collect();
        for (row, mapping) in overlay {
            match mapping {
                Some(pid) => {
                    victims.insert(row, pid);
                }
                None => {
                    victims.remove(&row);
                }
            }
        }
        self.remove_mapped_rows(victims)
    }

    /// Wipe the view: truncate both tables and reset the overlay.
    pub fn apply_clear(&mut self) -> Result<()> {
        let groups: Vec<String> = self.state.index.group_names().map(str::to_owned).collect();
        debug!(groups = groups.len(), "clearing view");
        for group in &groups {
            self.state.log.reset_group(group);
            self.state.mutated_groups.insert(group.clone());
        }
        self.store.clear_all(self.sql)?;
        let state = &mut *self.state;
        state.index.clear();
        state.pages.clear();
        state.dirty_pages.clear();
        state.dirty_metas.clear();
        state.dirty_mappings.clear();
        state.deleted_pages.clear();
        state.objects.clear();
        state.metadatas.clear();
        state.cleared = true;
        state.last_insert_at_head = false;
        state.last_insert_at_tail = false;
        Ok(())
    }

    /// Force an update record for a row without moving it.
    ///
    /// Gated by the callback shapes: touching columns no callback reads is a
    /// silent no-op, so observers never see updates that cannot matter.
    pub fn touch(&mut self, row: &RowId, columns: ColumnFlags) -> Result<()> {
        let read = self.grouping.shape().columns() | self.sorting.shape().columns();
        if (columns & read).is_empty() {
            return Ok(());
        }
        if let Some((group, index)) = self.locate(row)? {
            self.state.log.update_row(row.clone(), &group, index, columns);
        }
        Ok(())
    }

    // --- Insert path ---

    /// Place a row into its group, per the ordered-insert algorithm:
    /// stable-position check, head/tail fast paths, then upper-bound binary
    /// search.
    pub fn insert_row(
        &mut self,
        row: RowId,
        object: Option<&[u8]>,
        metadata: Option<Option<&[u8]>>,
        group: &str,
        flags: ColumnFlags,
        is_new: bool,
    ) -> Result<()> {
        let candidate = Candidate {
            row: &row,
            object,
            metadata,
        };

        let mut existing: Option<PageId> = None;
        if !is_new {
            if let Some(pid) = self.lookup_mapping(&row)? {
                match self.state.index.group_of(&pid).map(str::to_owned) {
                    Some(current) if current == group => {
                        if self.sorting.shape() == CallbackShape::Key {
                            // The comparator reads nothing that can change:
                            // the row cannot move.
                            let index = self.absolute_index_of(&pid, &row)?;
                            self.state.log.update_row(row, group, index, flags);
                            return Ok(());
                        }
                        existing = Some(pid);
                    }
                    Some(_) => {
                        self.remove_row(&row)?;
                    }
                    None => {
                        warn!(row = %row, page = %pid, "stale mapping; treating as new");
                        self.state.dirty_mappings.insert(row.clone(), None);
                    }
                }
            }
        }

        // Stable-position check: an updated row that still orders between
        // its neighbours stays put and costs one update record.
        if let Some(pid) = existing {
            let count = self.state.index.group_total(group);
            let index = self.absolute_index_of(&pid, &row)?;
            let fits_left = index == 0 || {
                let prev = self.row_at(group, index - 1)?;
                self.compare(candidate, &prev)? != Ordering::Less
            };
            let fits_right = index + 1 >= count || {
                let next = self.row_at(group, index + 1)?;
                self.compare(candidate, &next)? != Ordering::Greater
            };
            if fits_left && fits_right {
                self.state.log.update_row(row, group, index, flags);
                return Ok(());
            }
            self.remove_row(&row)?;
        }

        if !self.state.index.contains_group(group) {
            // First row of a brand-new group: allocate its sole page.
            let pid = new_page_id();
            let page = Page::with_row(row.clone());
            self.state
                .index
                .insert_sole(PageMeta::sole(pid.clone(), group, 1));
            self.state.pages.insert(pid.clone(), page);
            self.state.dirty_pages.insert(pid.clone());
            self.state.dirty_metas.insert(pid.clone());
            self.state.dirty_mappings.insert(row.clone(), Some(pid));
            self.state.log.insert_group(group);
            self.state.log.insert_row(row, group, 0);
            self.state.mutated_groups.insert(group.to_owned());
            self.state.last_insert_at_head = true;
            self.state.last_insert_at_tail = true;
            return Ok(());
        }

        let count = self.state.index.group_total(group);
        let index = self.resolve_insert_index(group, candidate, count)?;
        let (pid, local) = self.state.index.page_for_insert(group, index).ok_or_else(|| {
            StrataError::internal(format!("no insert slot for index {index} in '{group}'"))
        })?;

        let previous_mapping = if is_new {
            None
        } else {
            self.lookup_mapping(&row)?
        };
        let page = self.page_mut(&pid)?;
        page.insert(local, row.clone());
        let meta = self.state.index.meta_mut(&pid).ok_or_else(|| {
            StrataError::internal(format!("page {pid} lost its descriptor"))
        })?;
        meta.count += 1;
        self.state.dirty_pages.insert(pid.clone());
        self.state.dirty_metas.insert(pid.clone());
        if previous_mapping.as_ref() != Some(&pid) {
            self.state.dirty_mappings.insert(row.clone(), Some(pid));
        }
        self.state.log.insert_row(row, group, index);
        self.state.mutated_groups.insert(group.to_owned());
        self.state.last_insert_at_head = index == 0;
        self.state.last_insert_at_tail = index == count;
        Ok(())
    }

    /// Pick the absolute insertion index within a non-empty group.
    fn resolve_insert_index(
        &mut self,
        group: &str,
        candidate: Candidate<'_>,
        count: usize,
    ) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }

        // Consecutive inserts at either edge are common (sorted feeds);
        // one comparison settles them without a search.
        if self.state.last_insert_at_head {
            let first = self.row_at(group, 0)?;
            if self.compare(candidate, &first)? == Ordering::Less {
                return Ok(0);
            }
        }
        if self.state.last_insert_at_tail {
            let last = self.row_at(group, count - 1)?;
            if self.compare(candidate, &last)? != Ordering::Less {
                return Ok(count);
            }
        }

        // Binary search; ties land after the last equal row.
        let mut min = 0;
        let mut max = count;
        while min < max {
            let mid = min + (max - min) / 2;
            let probe = self.row_at(group, mid)?;
            if self.compare(candidate, &probe)? == Ordering::Less {
                max = mid;
            } else {
                min = mid + 1;
            }
        }
        Ok(min)
    }

    // --- Delete paths ---

    /// Remove one row. A row that is not in the view is a successful no-op.
    pub fn remove_row(&mut self, row: &RowId) -> Result<()> {
        let Some(pid) = self.lookup_mapping(row)? else {
            return Ok(());
        };
        let Some(group) = self.state.index.group_of(&pid).map(str::to_owned) else {
            warn!(row = %row, page = %pid, "mapping points at an unknown page");
            self.state.dirty_mappings.insert(row.clone(), None);
            return Ok(());
        };
        let offset = self.state.index.page_offset(&pid).ok_or_else(|| {
            StrataError::internal(format!("page {pid} has no offset in '{group}'"))
        })?;
        let page = self.page_mut(&pid)?;
        let Some(local) = page.index_of(row) else {
            warn!(row = %row, page = %pid, "row missing from its mapped page");
            self.state.dirty_mappings.insert(row.clone(), None);
            return Ok(());
        };
        page.remove(local);
        let meta = self.state.index.meta_mut(&pid).ok_or_else(|| {
            StrataError::internal(format!("page {pid} lost its descriptor"))
        })?;
        meta.count -= 1;
        self.state.dirty_pages.insert(pid.clone());
        self.state.dirty_metas.insert(pid.clone());
        self.state.dirty_mappings.insert(row.clone(), None);
        self.state.log.delete_row(row.clone(), &group, offset + local);
        self.state.mutated_groups.insert(group);
        Ok(())
    }

    /// Remove a batch of rows already resolved to their pages, page by page,
    /// emitting per-row deletes in descending index order within each page.
    fn remove_mapped_rows(&mut self, victims: HashMap<RowId, PageId>) -> Result<()> {
        let mut by_page: HashMap<PageId, Vec<RowId>> = HashMap::new();
        for (row, pid) in victims {
            self.invalidate_fetch_caches(&row, ColumnFlags::all());
            by_page.entry(pid).or_default().push(row);
        }

        // Deterministic page order: by group then position in the chain.
        let mut page_order: Vec<PageId> = by_page.keys().cloned().collect();
        page_order.sort_by_key(|pid| {
            (
                self.state.index.group_of(pid).map(str::to_owned),
                self.state.index.page_offset(pid),
            )
        });

        for pid in page_order {
            let Some(rows) = by_page.remove(&pid) else {
                continue;
            };
            let Some(group) = self.state.index.group_of(&pid).map(str::to_owned) else {
                warn!(page = %pid, "bulk remove hit an unknown page");
                for row in rows {
                    self.state.dirty_mappings.insert(row, None);
                }
                continue;
            };
            let offset = self.state.index.page_offset(&pid).ok_or_else(|| {
                StrataError::internal(format!("page {pid} has no offset in '{group}'"))
            })?;
            self.page_mut(&pid)?;

            let state = &mut *self.state;
            let page = state.pages.get_mut(&pid).ok_or_else(|| {
                StrataError::internal(format!("page {pid} vanished from overlay"))
            })?;
            let victim_set: HashSet<&RowId> = rows.iter().collect();
            let locals: Vec<usize> = page
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, row)| victim_set.contains(row))
                .map(|(local, _)| local)
                .collect();
            for &local in locals.iter().rev() {
                let removed = page.remove(local);
                state.log.delete_row(removed.clone(), &group, offset + local);
                state.dirty_mappings.insert(removed, None);
            }
            if locals.is_empty() {
                continue;
            }
            let meta = state.index.meta_mut(&pid).ok_or_else(|| {
                StrataError::internal(format!("page {pid} lost its descriptor"))
            })?;
            meta.count -= locals.len();
            state.dirty_pages.insert(pid.clone());
            state.dirty_metas.insert(pid);
            state.mutated_groups.insert(group);
        }
        Ok(())
    }

    // --- Commit flush ---

    /// Write every dirty page, descriptor and keymap entry into the
    /// enclosing SQL transaction. Deleted pages were already removed
    /// write-through by the rebalancer.
    pub fn flush_dirty(&mut self) -> Result<()> {
        let state = &*self.state;
        for pid in &state.dirty_pages {
            if state.deleted_pages.contains(pid) {
                continue;
            }
            let page = state.pages.get(pid).ok_or_else(|| {
                StrataError::internal(format!("dirty page {pid} has no body"))
            })?;
            let meta = state.index.meta(pid).ok_or_else(|| {
                StrataError::internal(format!("dirty page {pid} has no descriptor"))
            })?;
            self.store.write_page(self.sql, page, meta)?;
        }
        for pid in &state.dirty_metas {
            if state.deleted_pages.contains(pid) || state.dirty_pages.contains(pid) {
                continue;
            }
            let meta = state.index.meta(pid).ok_or_else(|| {
                StrataError::internal(format!("dirty descriptor {pid} is gone"))
            })?;
            self.store.write_meta(self.sql, meta)?;
        }
        for (row, mapping) in &state.dirty_mappings {
            match mapping {
                Some(pid) => self.store.put_key_map(self.sql, row, pid)?,
                None => self.store.delete_key_map(self.sql, row)?,
            }
        }
        debug!(
            pages = state.dirty_pages.len(),
            metas = state.dirty_metas.len(),
            mappings = state.dirty_mappings.len(),
            "view overlay flushed"
        );
        Ok(())
    }

    /// Check the page-size bound; used by the rebalancer and tests.
    pub fn oversize_pages(&self) -> Vec<PageId> {
        let mut over: Vec<PageId> = self
            .state
            .dirty_metas
            .iter()
            .filter(|pid| !self.state.deleted_pages.contains(*pid))
            .filter(|pid| {
                self.state
                    .index
                    .meta(pid)
                    .is_some_and(|meta| meta.count > MAX_PAGE_SIZE)
            })
            .cloned()
            .collect();
        over.sort_by_key(|pid| {
            (
                self.state.index.group_of(pid).map(str::to_owned),
                self.state.index.page_offset(pid),
            )
        });
        over
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        Harness, key_sorted_config, object_grouped_config, object_sorted_config,
    };
    use strata_types::ChangeRecord;

    fn rid(key: &str) -> RowId {
        RowId::new("c", key)
    }

    #[test]
    fn test_first_insert_creates_group_and_page() {
        let mut h = Harness::new(key_sorted_config());
        h.set(rid("b"), b"o", None).unwrap();

        let records = h.drain_log();
        assert_eq!(
            records,
            vec![
                ChangeRecord::InsertGroup { group: "g".into() },
                ChangeRecord::InsertRow {
                    row: rid("b"),
                    group: "g".into(),
                    index: 0
                },
            ]
        );
        h.with_ctx(|ctx| {
            assert_eq!(ctx.state.index.group_total("g"), 1);
            assert_eq!(ctx.locate(&rid("b"))?, Some(("g".into(), 0)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_inserts_binary_search_into_object_order() {
        let mut h = Harness::new(object_sorted_config());
        for key in ["d", "a", "c", "b", "e"] {
            h.set(rid(key), key.as_bytes(), None).unwrap();
        }
        assert_eq!(
            h.group_rows("g"),
            vec![rid("a"), rid("b"), rid("c"), rid("d"), rid("e")]
        );
    }

    #[test]
    fn test_update_in_place_emits_single_update() {
        let mut h = Harness::new(object_sorted_config());
        for key in ["a", "b", "c"] {
            h.set(rid(key), key.as_bytes(), None).unwrap();
        }
        h.drain_log();
        // Same sort key: the row stays at index 1.
        h.set(rid("b"), b"b", Some(b"changed")).unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![ChangeRecord::UpdateRow {
                row: rid("b"),
                group: "g".into(),
                index: 1,
                columns: ColumnFlags::all(),
            }]
        );
    }

    #[test]
    fn test_reposition_emits_delete_then_insert() {
        let mut h = Harness::new(object_sorted_config());
        for (key, sort) in [("a", b"1"), ("b", b"2"), ("c", b"3")] {
            h.set(rid(key), sort, None).unwrap();
        }
        h.drain_log();
        // Move "a" from index 0 to the end by bumping its sort key.
        h.set(rid("a"), b"9", None).unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![
                ChangeRecord::DeleteRow {
                    row: rid("a"),
                    group: "g".into(),
                    index: 0
                },
                ChangeRecord::InsertRow {
                    row: rid("a"),
                    group: "g".into(),
                    index: 2
                },
            ]
        );
        assert_eq!(h.group_rows("g"), vec![rid("b"), rid("c"), rid("a")]);
    }

    #[test]
    fn test_key_only_sorting_shortcuts_to_update() {
        let mut h = Harness::new(key_sorted_config());
        h.set(rid("a"), b"1", None).unwrap();
        h.drain_log();
        h.set(rid("a"), b"2", None).unwrap();
        let records = h.drain_log();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ChangeRecord::UpdateRow { index: 0, .. }));
    }

    #[test]
    fn test_group_change_moves_row() {
        let mut h = Harness::new(object_grouped_config());
        h.set(rid("x"), b"g1:1", None).unwrap();
        h.set(rid("y"), b"g1:2", None).unwrap();
        h.drain_log();
        h.set(rid("x"), b"g2:1", None).unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![
                ChangeRecord::DeleteRow {
                    row: rid("x"),
                    group: "g1".into(),
                    index: 0
                },
                ChangeRecord::InsertGroup { group: "g2".into() },
                ChangeRecord::InsertRow {
                    row: rid("x"),
                    group: "g2".into(),
                    index: 0
                },
            ]
        );
        h.with_ctx(|ctx| {
            assert_eq!(ctx.locate(&rid("x"))?, Some(("g2".into(), 0)));
            assert_eq!(ctx.state.index.group_total("g1"), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_excluded_row_is_removed() {
        let mut h = Harness::new(object_grouped_config());
        h.set(rid("x"), b"g1:1", None).unwrap();
        h.drain_log();
        // The grouping function excludes objects without a prefix.
        h.set(rid("x"), b"nogroup", None).unwrap();
        let records = h.drain_log();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ChangeRecord::DeleteRow { .. }));
    }

    #[test]
    fn test_remove_missing_row_is_noop() {
        let mut h = Harness::new(key_sorted_config());
        h.remove(&rid("ghost")).unwrap();
        assert!(h.drain_log().is_empty());
    }

    #[test]
    fn test_bulk_remove_emits_descending_indices() {
        let mut h = Harness::new(object_sorted_config());
        let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
        for key in &keys {
            h.set(rid(key), key.as_bytes(), None).unwrap();
        }
        h.drain_log();
        // Flush the mapping overlay so the bulk path exercises its SQL scan.
        h.flush().unwrap();
        let victims: Vec<String> = keys[2..7].to_vec();
        h.remove_many("c", &victims).unwrap();
        let records = h.drain_log();
        let indices: Vec<usize> = records
            .iter()
            .map(|r| match r {
                ChangeRecord::DeleteRow { index, .. } => *index,
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(indices, vec![6, 5, 4, 3, 2]);
        assert_eq!(
            h.with_ctx(|ctx| Ok(ctx.state.index.group_total("g"))).unwrap(),
            5
        );
    }

    #[test]
    fn test_bulk_remove_sees_unflushed_rows() {
        let mut h = Harness::new(object_sorted_config());
        h.set(rid("a"), b"a", None).unwrap();
        h.set(rid("b"), b"b", None).unwrap();
        h.drain_log();
        // Nothing flushed: the scan must fold in the dirty keymap overlay.
        h.remove_many("c", &["a".to_owned(), "b".to_owned()]).unwrap();
        let records = h.drain_log();
        assert_eq!(records.len(), 2);
        assert_eq!(
            h.with_ctx(|ctx| Ok(ctx.state.index.group_total("g"))).unwrap(),
            0
        );
    }

    #[test]
    fn test_clear_resets_groups() {
        let mut h = Harness::new(object_grouped_config());
        h.set(rid("x"), b"g1:1", None).unwrap();
        h.set(rid("y"), b"g2:1", None).unwrap();
        h.drain_log();
        h.clear().unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![
                ChangeRecord::ResetGroup { group: "g1".into() },
                ChangeRecord::ResetGroup { group: "g2".into() },
            ]
        );
        h.with_ctx(|ctx| {
            assert!(ctx.state.index.is_empty());
            assert_eq!(ctx.lookup_mapping(&rid("x"))?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_touch_respects_shape_gating() {
        // Key-only callbacks read neither column: every touch is a no-op.
        let mut h = Harness::new(key_sorted_config());
        h.set(rid("a"), b"1", None).unwrap();
        h.drain_log();
        h.touch(&rid("a"), ColumnFlags::OBJECT).unwrap();
        assert!(h.drain_log().is_empty());

        // Object-reading comparator: an object touch produces one update.
        let mut h = Harness::new(object_sorted_config());
        h.set(rid("a"), b"1", None).unwrap();
        h.drain_log();
        h.touch(&rid("a"), ColumnFlags::OBJECT).unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![ChangeRecord::UpdateRow {
                row: rid("a"),
                group: "g".into(),
                index: 0,
                columns: ColumnFlags::OBJECT,
            }]
        );
        // A metadata touch against object-only callbacks stays silent.
        h.touch(&rid("a"), ColumnFlags::METADATA).unwrap();
        assert!(h.drain_log().is_empty());
    }

    #[test]
    fn test_metadata_set_with_blind_shapes_updates_in_place() {
        let mut h = Harness::new(object_sorted_config());
        h.set(rid("a"), b"1", None).unwrap();
        h.drain_log();
        h.set_metadata(rid("a"), Some(b"m")).unwrap();
        let records = h.drain_log();
        assert_eq!(
            records,
            vec![ChangeRecord::UpdateRow {
                row: rid("a"),
                group: "g".into(),
                index: 0,
                columns: ColumnFlags::METADATA,
            }]
        );
    }

    #[test]
    fn test_tail_fast_path_keeps_appends_cheap() {
        let mut h = Harness::new(object_sorted_config());
        for i in 0..20 {
            let key = format!("k{i:02}");
            h.set(rid(&key), key.as_bytes(), None)
                .unwrap();
        }
        let rows = h.group_rows("g");
        assert_eq!(rows.len(), 20);
        assert!(rows.windows(2).all(|w| w[0].key < w[1].key));
        h.with_ctx(|ctx| {
            assert!(ctx.state.last_insert_at_tail);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_equal_sort_keys_append_after_equal_run() {
        let mut h = Harness::new(object_sorted_config());
        for key in ["a", "b", "c"] {
            h.set(rid(key), b"same", None).unwrap();
        }
        // Ties resolve to the upper bound: arrival order is preserved.
        assert_eq!(h.group_rows("g"), vec![rid("a"), rid("b"), rid("c")]);
        let records = h.drain_log();
        let inserts: Vec<usize> = records
            .iter()
            .filter_map(|r| match r {
                ChangeRecord::InsertRow { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(inserts, vec![0, 1, 2]);
    }

    #[test]
    fn test_mid_transaction_pages_may_exceed_bound() {
        let mut h = Harness::new(object_sorted_config());
        for i in 0..(MAX_PAGE_SIZE + 5) {
            let key = format!("k{i:03}");
            h.set(rid(&key), key.as_bytes(), None)
                .unwrap();
        }
        // The bound is only enforced at pre-commit; the sole page is fat.
        h.with_ctx(|ctx| {
            let pages = ctx.state.index.pages("g").unwrap();
            assert_eq!(pages.len(), 1);
            assert_eq!(pages[0].count, MAX_PAGE_SIZE + 5);
            assert_eq!(ctx.oversize_pages().len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
