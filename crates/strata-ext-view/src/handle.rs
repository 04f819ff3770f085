//! The view handle: registration, hook dispatch and the public read API.
//!
//! A [`ViewHandle`] is the long-lived object registered on a database. It
//! owns the user callbacks, the page store, the shared snapshot readers see,
//! the shared caches, and (while a write transaction is open) the writer's
//! dirty overlay. Readers bind to a frozen `Arc` of the snapshot; the writer
//! rebuilds the snapshot at `post_commit`, so nothing mid-transaction ever
//! leaks to a reader.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use strata_core::{Extension, ReadAccess, ReadTxn, WriteTxn};
use strata_error::{Result, StrataError};
use strata_types::{ColumnFlags, PageId, RowId, ViewChangeSet};
use tracing::{debug, info, warn};

use crate::BaseSql;
use crate::cache::SharedCaches;
use crate::compare::{GroupingFn, SortingFn};
use crate::group_index::GroupIndex;
use crate::page::Page;
use crate::populate;
use crate::rebalance;
use crate::store::PageStore;
use crate::writer::{WriteCtx, WriterState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Cache bounds for one view. 0 means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct ViewOptions {
    /// Bound on lazily fetched objects held for comparator calls.
    pub object_cache_limit: usize,
    /// Bound on lazily fetched metadata held for comparator calls.
    pub metadata_cache_limit: usize,
    /// Bound on decoded pages in the shared cache.
    pub page_cache_limit: usize,
    /// Bound on row-to-page lookups in the shared cache.
    pub mapping_cache_limit: usize,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            object_cache_limit: 250,
            metadata_cache_limit: 250,
            page_cache_limit: 100,
            mapping_cache_limit: 500,
        }
    }
}

/// Everything a view needs at registration.
#[derive(Debug)]
pub struct ViewConfig {
    /// Registered name; prefixes the view's tables.
    pub name: String,
    /// Bump to force a rebuild at the next registration.
    pub version: i64,
    pub grouping: GroupingFn,
    pub sorting: SortingFn,
    pub options: ViewOptions,
}

impl ViewConfig {
    pub fn new(name: impl Into<String>, grouping: GroupingFn, sorting: SortingFn) -> Self {
        Self {
            name: name.into(),
            version: 0,
            grouping,
            sorting,
            options: ViewOptions::default(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ViewOptions) -> Self {
        self.options = options;
        self
    }
}

/// Enumeration window and direction.
#[derive(Debug, Clone, Default)]
pub struct EnumerateOptions {
    /// Absolute index window within the group; `None` walks everything.
    pub range: Option<Range<usize>>,
    /// Walk from the highest index down.
    pub reverse: bool,
}

// ---------------------------------------------------------------------------
// ViewHandle
// ---------------------------------------------------------------------------

pub(crate) struct ViewSnapshot {
    pub index: GroupIndex,
}

/// A registered (or registrable) ordered view.
pub struct ViewHandle {
    name: String,
    version: i64,
    grouping: GroupingFn,
    sorting: SortingFn,
    options: ViewOptions,
    store: PageStore,
    snapshot: RwLock<Arc<ViewSnapshot>>,
    caches: Mutex<SharedCaches>,
    writer_state: Mutex<Option<WriterState>>,
    registered: AtomicBool,
}

impl ViewHandle {
    /// Build a handle from its configuration. Register it with
    /// [`Database::register`](strata_core::Database::register) before use.
    pub fn new(config: ViewConfig) -> Arc<Self> {
        let store = PageStore::new(&config.name);
        Arc::new(Self {
            name: config.name,
            version: config.version,
            grouping: config.grouping,
            sorting: config.sorting,
            options: config.options,
            store,
            snapshot: RwLock::new(Arc::new(ViewSnapshot {
                index: GroupIndex::new(),
            })),
            caches: Mutex::new(SharedCaches::new(
                config.options.page_cache_limit,
                config.options.mapping_cache_limit,
            )),
            writer_state: Mutex::new(None),
            registered: AtomicBool::new(false),
        })
    }

    pub fn view_name(&self) -> &str {
        &self.name
    }

    /// Bind the view to a read transaction.
    pub fn reader<'a>(&'a self, txn: &'a ReadTxn<'_>) -> Result<ViewReadTxn<'a>> {
        self.check_registered()?;
        Ok(ViewReadTxn {
            handle: self,
            sql: txn.sql(),
            snapshot: Arc::clone(&self.snapshot.read()),
        })
    }

    /// Bind the view to a write transaction.
    pub fn writer<'a>(&'a self, txn: &'a WriteTxn<'_>) -> Result<ViewWriteTxn<'a>> {
        self.check_registered()?;
        Ok(ViewWriteTxn {
            handle: self,
            sql: txn.sql(),
        })
    }

    fn check_registered(&self) -> Result<()> {
        if self.registered.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StrataError::NotRegistered {
                name: self.name.clone(),
            })
        }
    }

    pub(crate) fn with_writer<T>(
        &self,
        sql: &Connection,
        f: impl FnOnce(&mut WriteCtx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.writer_state.lock();
        if guard.is_none() {
            let index = self.snapshot.read().index.clone();
            *guard = Some(WriterState::new(
                index,
                self.options.object_cache_limit,
                self.options.metadata_cache_limit,
            ));
        }
        let state = guard
            .as_mut()
            .ok_or_else(|| StrataError::internal("writer state missing"))?;
        let mut ctx = WriteCtx {
            sql,
            store: &self.store,
            grouping: &self.grouping,
            sorting: &self.sorting,
            caches: &self.caches,
            state,
        };
        f(&mut ctx)
    }
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("registered", &self.registered.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Extension for ViewHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn init(&self, sql: &Connection) -> Result<()> {
        self.store.create_tables(sql)?;
        let persisted = BaseSql(sql)
            .registry_get(&self.name, "version")?
            .and_then(|v| v.parse::<i64>().ok());

        if persisted == Some(self.version) {
            match self
                .store
                .load_all_page_metas(sql)
                .and_then(GroupIndex::from_disk)
            {
                Ok(index) => {
                    debug!(view = %self.name, groups = index.group_count(), "view state loaded");
                    self.caches.lock().clear();
                    *self.snapshot.write() = Arc::new(ViewSnapshot { index });
                    *self.writer_state.lock() = None;
                    return Ok(());
                }
                Err(err) => {
                    warn!(view = %self.name, error = %err, "stored view state unusable; rebuilding");
                }
            }
        } else if persisted.is_some() {
            info!(
                view = %self.name,
                persisted = persisted.unwrap_or_default(),
                requested = self.version,
                "view version changed; rebuilding"
            );
        }

        self.store.clear_all(sql)?;
        self.caches.lock().clear();
        *self.snapshot.write() = Arc::new(ViewSnapshot {
            index: GroupIndex::new(),
        });
        *self.writer_state.lock() = Some(WriterState::new(
            GroupIndex::new(),
            self.options.object_cache_limit,
            self.options.metadata_cache_limit,
        ));
        self.with_writer(sql, populate::run)?;
        self.with_writer(sql, |ctx| rebalance::run(ctx))?;
        self.with_writer(sql, |ctx| ctx.flush_dirty())?;
        strata_core::registry_put(sql, &self.name, "version", &self.version.to_string())?;
        Ok(())
    }

    fn after_set(
        &self,
        sql: &Connection,
        collection: &str,
        key: &str,
        object: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.with_writer(sql, |ctx| {
            ctx.apply_set(RowId::new(collection, key), object, metadata)
        })
    }

    fn after_set_metadata(
        &self,
        sql: &Connection,
        collection: &str,
        key: &str,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.with_writer(sql, |ctx| {
            ctx.apply_set_metadata(RowId::new(collection, key), metadata)
        })
    }

    fn after_remove(&self, sql: &Connection, collection: &str, key: &str) -> Result<()> {
        self.with_writer(sql, |ctx| ctx.apply_remove(&RowId::new(collection, key)))
    }

    fn after_remove_many(&self, sql: &Connection, collection: &str, keys: &[String]) -> Result<()> {
        self.with_writer(sql, |ctx| ctx.apply_remove_many(collection, keys))
    }

    fn after_remove_all_in_collection(&self, sql: &Connection, collection: &str) -> Result<()> {
        self.with_writer(sql, |ctx| ctx.apply_remove_collection(collection))
    }

    fn after_remove_all(&self, sql: &Connection) -> Result<()> {
        self.with_writer(sql, |ctx| ctx.apply_clear())
    }

    fn pre_commit(&self, sql: &Connection) -> Result<()> {
        if self.writer_state.lock().is_none() {
            return Ok(());
        }
        self.with_writer(sql, |ctx| rebalance::run(ctx))
    }

    fn flush(&self, sql: &Connection) -> Result<()> {
        if self.writer_state.lock().is_none() {
            return Ok(());
        }
        self.with_writer(sql, |ctx| ctx.flush_dirty())
    }

    fn post_commit(&self) -> Option<ViewChangeSet> {
        self.registered.store(true, Ordering::Release);
        let state = self.writer_state.lock().take()?;
        let WriterState {
            index,
            pages,
            dirty_pages,
            dirty_mappings,
            deleted_pages,
            log,
            cleared,
            ..
        } = state;

        {
            let mut caches = self.caches.lock();
            if cleared {
                caches.clear();
            }
            for pid in &deleted_pages {
                caches.pages.remove(pid);
            }
            for pid in &dirty_pages {
                if deleted_pages.contains(pid) {
                    continue;
                }
                if let Some(page) = pages.get(pid) {
                    caches.pages.insert(pid.clone(), page.clone());
                }
            }
            for (row, mapping) in &dirty_mappings {
                caches.mappings.insert(row.clone(), mapping.clone());
            }
        }
        *self.snapshot.write() = Arc::new(ViewSnapshot { index });

        let records = log.into_records();
        if records.is_empty() {
            None
        } else {
            Some(ViewChangeSet::new(self.name.clone(), records))
        }
    }

    fn abort(&self) {
        *self.writer_state.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Read API over a read transaction
// ---------------------------------------------------------------------------

enum Fill {
    Always,
    IfRoom,
}

/// The view bound to a read transaction: a frozen snapshot.
pub struct ViewReadTxn<'a> {
    handle: &'a ViewHandle,
    sql: &'a Connection,
    snapshot: Arc<ViewSnapshot>,
}

impl ViewReadTxn<'_> {
    pub fn group_count(&self) -> usize {
        self.snapshot.index.group_count()
    }

    pub fn groups(&self) -> Vec<String> {
        self.snapshot.index.group_names().map(str::to_owned).collect()
    }

    pub fn row_count(&self, group: &str) -> usize {
        self.snapshot.index.group_total(group)
    }

    pub fn total_row_count(&self) -> usize {
        self.snapshot.index.total()
    }

    /// The row at an absolute index of a group.
    pub fn get(&self, group: &str, index: usize) -> Result<Option<RowId>> {
        let Some((pid, local)) = self.snapshot.index.page_containing(group, index) else {
            return Ok(None);
        };
        let page = self.load_page(&pid, &Fill::Always)?;
        Ok(page.get(local).cloned())
    }

    pub fn first(&self, group: &str) -> Result<Option<RowId>> {
        self.get(group, 0)
    }

    pub fn last(&self, group: &str) -> Result<Option<RowId>> {
        match self.row_count(group) {
            0 => Ok(None),
            n => self.get(group, n - 1),
        }
    }

    /// The (group, index) position of a row, if it is in the view.
    pub fn locate(&self, row: &RowId) -> Result<Option<(String, usize)>> {
        let Some(pid) = self.lookup_mapping(row)? else {
            return Ok(None);
        };
        let Some(group) = self.snapshot.index.group_of(&pid).map(str::to_owned) else {
            warn!(row = %row, page = %pid, "mapping points outside the snapshot");
            return Ok(None);
        };
        let Some(offset) = self.snapshot.index.page_offset(&pid) else {
            return Ok(None);
        };
        let page = self.load_page(&pid, &Fill::Always)?;
        match page.index_of(row) {
            Some(local) => Ok(Some((group, offset + local))),
            None => {
                warn!(row = %row, page = %pid, "row missing from its mapped page");
                Ok(None)
            }
        }
    }

    /// Walk a group in index order, optionally windowed and reversed. The
    /// callback receives each row, its absolute index, and a stop flag.
    pub fn enumerate(
        &self,
        group: &str,
        options: &EnumerateOptions,
        mut f: impl FnMut(&RowId, usize, &mut bool) -> Result<()>,
    ) -> Result<()> {
        let spans = page_spans(&self.snapshot.index, group);
        let total = spans.last().map_or(0, |(_, offset, count)| offset + count);
        let (start, end) = clamp_range(total, options.range.as_ref());
        let mut stop = false;

        let ordered: Vec<&(PageId, usize, usize)> = if options.reverse {
            spans.iter().rev().collect()
        } else {
            spans.iter().collect()
        };
        for (pid, offset, count) in ordered {
            let page_start = *offset;
            let page_end = offset + count;
            if page_end <= start || page_start >= end {
                continue;
            }
            // Enumeration fills only spare cache capacity so a long walk
            // does not evict hot entries.
            let page = self.load_page(pid, &Fill::IfRoom)?;
            let lo = start.max(page_start) - page_start;
            let hi = end.min(page_end) - page_start;
            let locals: Vec<usize> = if options.reverse {
                (lo..hi).rev().collect()
            } else {
                (lo..hi).collect()
            };
            for local in locals {
                let row = page.get(local).ok_or_else(|| {
                    StrataError::internal(format!("slot {local} missing in page {pid}"))
                })?;
                f(row, page_start + local, &mut stop)?;
                if stop {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn lookup_mapping(&self, row: &RowId) -> Result<Option<PageId>> {
        if let Some(hit) = self.handle.caches.lock().mappings.get(row) {
            return Ok(hit.clone());
        }
        let mapping = self.handle.store.lookup_key_map(self.sql, row)?;
        self.handle
            .caches
            .lock()
            .mappings
            .insert(row.clone(), mapping.clone());
        Ok(mapping)
    }

    fn load_page(&self, id: &PageId, fill: &Fill) -> Result<Page> {
        if let Some(page) = self.handle.caches.lock().pages.get(id).cloned() {
            return Ok(page);
        }
        let page = self.handle.store.read_page(self.sql, id)?;
        let mut caches = self.handle.caches.lock();
        match fill {
            Fill::Always => caches.pages.insert(id.clone(), page.clone()),
            Fill::IfRoom => caches.pages.insert_if_room(id.clone(), page.clone()),
        }
        Ok(page)
    }
}

impl std::fmt::Debug for ViewReadTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewReadTxn")
            .field("view", &self.handle.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Read/touch API over a write transaction
// ---------------------------------------------------------------------------

/// The view bound to a write transaction: reads see the dirty overlay, and
/// enumeration detects structural mutation of the group being walked.
pub struct ViewWriteTxn<'a> {
    handle: &'a ViewHandle,
    sql: &'a Connection,
}

impl ViewWriteTxn<'_> {
    pub fn group_count(&self) -> Result<usize> {
        self.handle
            .with_writer(self.sql, |ctx| Ok(ctx.state.index.group_count()))
    }

    pub fn groups(&self) -> Result<Vec<String>> {
        self.handle.with_writer(self.sql, |ctx| {
            Ok(ctx.state.index.group_names().map(str::to_owned).collect())
        })
    }

    pub fn row_count(&self, group: &str) -> Result<usize> {
        self.handle
            .with_writer(self.sql, |ctx| Ok(ctx.state.index.group_total(group)))
    }

    pub fn total_row_count(&self) -> Result<usize> {
        self.handle
            .with_writer(self.sql, |ctx| Ok(ctx.state.index.total()))
    }

    /// The row at an absolute index, as this transaction currently sees it.
    pub fn get(&self, group: &str, index: usize) -> Result<Option<RowId>> {
        self.handle.with_writer(self.sql, |ctx| {
            if index >= ctx.state.index.group_total(group) {
                return Ok(None);
            }
            ctx.row_at(group, index).map(Some)
        })
    }

    pub fn first(&self, group: &str) -> Result<Option<RowId>> {
        self.get(group, 0)
    }

    pub fn last(&self, group: &str) -> Result<Option<RowId>> {
        match self.row_count(group)? {
            0 => Ok(None),
            n => self.get(group, n - 1),
        }
    }

    pub fn locate(&self, row: &RowId) -> Result<Option<(String, usize)>> {
        self.handle.with_writer(self.sql, |ctx| ctx.locate(row))
    }

    /// Append an update record for a row without moving it. Touching columns
    /// neither callback reads is a silent no-op.
    pub fn touch(&self, row: &RowId, columns: ColumnFlags) -> Result<()> {
        self.handle.with_writer(self.sql, |ctx| ctx.touch(row, columns))
    }

    /// Walk a group in index order. Any structural mutation of the group
    /// during the walk fails the enumeration with
    /// [`StrataError::MutationDuringIteration`] unless the callback set the
    /// stop flag in the same step.
    pub fn enumerate(
        &self,
        group: &str,
        options: &EnumerateOptions,
        mut f: impl FnMut(&RowId, usize, &mut bool) -> Result<()>,
    ) -> Result<()> {
        let total = self.handle.with_writer(self.sql, |ctx| {
            ctx.state.mutated_groups.clear();
            Ok(ctx.state.index.group_total(group))
        })?;
        let (start, end) = clamp_range(total, options.range.as_ref());
        let indices: Vec<usize> = if options.reverse {
            (start..end).rev().collect()
        } else {
            (start..end).collect()
        };

        let mut stop = false;
        for (step, index) in indices.into_iter().enumerate() {
            // The lock is released while the callback runs so it can issue
            // further base-store mutations without deadlocking.
            let row = self.handle.with_writer(self.sql, |ctx| {
                if step > 0 && ctx.state.mutated_groups.contains(group) {
                    return Err(StrataError::MutationDuringIteration {
                        group: group.to_owned(),
                    });
                }
                ctx.row_at(group, index)
            })?;
            f(&row, index, &mut stop)?;
            if stop {
                return Ok(());
            }
        }
        if end > start {
            self.handle.with_writer(self.sql, |ctx| {
                if ctx.state.mutated_groups.contains(group) {
                    return Err(StrataError::MutationDuringIteration {
                        group: group.to_owned(),
                    });
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ViewWriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewWriteTxn")
            .field("view", &self.handle.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn clamp_range(total: usize, range: Option<&Range<usize>>) -> (usize, usize) {
    match range {
        Some(range) => (range.start.min(total), range.end.min(total)),
        None => (0, total),
    }
}

/// (page, offset, count) spans of one group in chain order.
fn page_spans(index: &GroupIndex, group: &str) -> Vec<(PageId, usize, usize)> {
    let mut spans = Vec::new();
    let mut offset = 0;
    if let Some(pages) = index.pages(group) {
        for meta in pages {
            spans.push((meta.id.clone(), offset, meta.count));
            offset += meta.count;
        }
    }
    spans
}
