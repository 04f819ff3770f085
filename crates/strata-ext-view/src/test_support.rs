//! Shared fixtures for the unit tests in this crate.
//!
//! The harness wires a writer overlay to an in-memory SQL connection that
//! carries both the base `kv` table and the view's shadow tables, so mutator
//! paths see exactly what they would inside a real write transaction. The
//! base row is written before the view hook runs, mirroring the dispatch
//! order of the host store.

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use strata_error::Result;
use strata_types::{ChangeRecord, ColumnFlags, RowId};

use crate::cache::SharedCaches;
use crate::compare::{GroupingFn, SortingFn};
use crate::group_index::GroupIndex;
use crate::store::PageStore;
use crate::writer::{WriteCtx, WriterState};

pub(crate) struct TestConfig {
    pub grouping: GroupingFn,
    pub sorting: SortingFn,
}

/// Everything in one group "g", ordered by key, reading nothing else.
pub(crate) fn key_sorted_config() -> TestConfig {
    TestConfig {
        grouping: GroupingFn::by_key(|_| Some("g".to_owned())),
        sorting: SortingFn::by_key(|a, b| a.key.cmp(&b.key)),
    }
}

/// Everything in one group "g", ordered by the raw object bytes.
pub(crate) fn object_sorted_config() -> TestConfig {
    TestConfig {
        grouping: GroupingFn::by_key(|_| Some("g".to_owned())),
        sorting: SortingFn::by_object(|_, a, _, b| a.cmp(b)),
    }
}

/// Group taken from the object's "group:rest" prefix; no prefix excludes
/// the row. Ordered by the raw object bytes.
pub(crate) fn object_grouped_config() -> TestConfig {
    TestConfig {
        grouping: GroupingFn::by_object(|_, object| {
            let text = std::str::from_utf8(object).ok()?;
            let (group, _) = text.split_once(':')?;
            Some(group.to_owned())
        }),
        sorting: SortingFn::by_object(|_, a, _, b| a.cmp(b)),
    }
}

pub(crate) struct Harness {
    pub conn: Connection,
    pub store: PageStore,
    pub grouping: GroupingFn,
    pub sorting: SortingFn,
    pub caches: Mutex<SharedCaches>,
    pub state: WriterState,
}

impl Harness {
    pub fn new(config: TestConfig) -> Self {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(
            "CREATE TABLE kv (collection TEXT NOT NULL, key TEXT NOT NULL, \
             object BLOB NOT NULL, metadata BLOB, PRIMARY KEY(collection, key));",
        )
        .expect("kv schema");
        let store = PageStore::new("v");
        store.create_tables(&conn).expect("view tables");
        Self {
            conn,
            store,
            grouping: config.grouping,
            sorting: config.sorting,
            caches: Mutex::new(SharedCaches::new(0, 0)),
            state: WriterState::new(GroupIndex::new(), 0, 0),
        }
    }

    pub fn with_ctx<T>(&mut self, f: impl FnOnce(&mut WriteCtx<'_>) -> Result<T>) -> Result<T> {
        let mut ctx = WriteCtx {
            sql: &self.conn,
            store: &self.store,
            grouping: &self.grouping,
            sorting: &self.sorting,
            caches: &self.caches,
            state: &mut self.state,
        };
        f(&mut ctx)
    }

    pub fn set(&mut self, row: RowId, object: &[u8], metadata: Option<&[u8]>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv(collection, key, object, metadata) VALUES(?1, ?2, ?3, ?4) \
             ON CONFLICT(collection, key) \
             DO UPDATE SET object = excluded.object, metadata = excluded.metadata",
            params![row.collection, row.key, object, metadata],
        )?;
        self.with_ctx(|ctx| ctx.apply_set(row, object, metadata))
    }

    pub fn set_metadata(&mut self, row: RowId, metadata: Option<&[u8]>) -> Result<()> {
        self.conn.execute(
            "UPDATE kv SET metadata = ?3 WHERE collection = ?1 AND key = ?2",
            params![row.collection, row.key, metadata],
        )?;
        self.with_ctx(|ctx| ctx.apply_set_metadata(row, metadata))
    }

    pub fn remove(&mut self, row: &RowId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM kv WHERE collection = ?1 AND key = ?2",
            params![row.collection, row.key],
        )?;
        self.with_ctx(|ctx| ctx.apply_remove(row))
    }

    pub fn remove_many(&mut self, collection: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.conn.execute(
                "DELETE FROM kv WHERE collection = ?1 AND key = ?2",
                params![collection, key],
            )?;
        }
        self.with_ctx(|ctx| ctx.apply_remove_many(collection, keys))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        self.with_ctx(|ctx| ctx.apply_clear())
    }

    pub fn touch(&mut self, row: &RowId, columns: ColumnFlags) -> Result<()> {
        self.with_ctx(|ctx| ctx.touch(row, columns))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.with_ctx(|ctx| ctx.flush_dirty())
    }

    pub fn drain_log(&mut self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.state.log).into_records()
    }

    /// Concatenation of the group's pages in chain order.
    pub fn group_rows(&mut self, group: &str) -> Vec<RowId> {
        self.with_ctx(|ctx| {
            let ids: Vec<_> = ctx
                .state
                .index
                .pages(group)
                .map(|pages| pages.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default();
            let mut rows = Vec::new();
            for id in ids {
                rows.extend(ctx.page_mut(&id)?.rows().iter().cloned());
            }
            Ok(rows)
        })
        .expect("group walk")
    }
}
