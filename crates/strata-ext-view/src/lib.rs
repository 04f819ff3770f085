//! Ordered-view extension for StrataKV.
//!
//! A view is a secondary index over the base store: every row is assigned to
//! a *group* by a user grouping function (or excluded), and rows within a
//! group are kept in the order of a user comparator. The materialisation is
//! a linked list of fixed-capacity pages per group, persisted in two shadow
//! tables next to the base data and cached in memory, with a precise change
//! log emitted to observers after every commit for UI-style diffing.
//!
//! Registration wires a [`ViewHandle`] into the base store's hook dispatch;
//! from then on every `set`/`remove` keeps the view current incrementally.
//! Position lookups are O(log n) on insert (binary search over the group)
//! and O(pages) on read; page shapes are repaired at commit time, so
//! mid-transaction pages may run oversize or empty without anyone noticing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_core::Database;
//! use strata_ext_view::{GroupingFn, SortingFn, ViewConfig, ViewHandle};
//!
//! # fn demo() -> strata_error::Result<()> {
//! let db = Database::open("library.db")?;
//! let by_title = ViewHandle::new(ViewConfig::new(
//!     "by_title",
//!     GroupingFn::by_key(|row| Some(row.collection.clone())),
//!     SortingFn::by_object(|_, a, _, b| a.cmp(b)),
//! ));
//! db.register(Arc::<ViewHandle>::clone(&by_title))?;
//!
//! db.write(|txn| txn.set("books", "b-1", b"A Canticle", None))?;
//! db.read(|txn| {
//!     let view = by_title.reader(txn)?;
//!     assert_eq!(view.row_count("books"), 1);
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod changelog;
mod codec;
mod compare;
mod group_index;
mod handle;
mod page;
mod populate;
mod rebalance;
mod store;
#[cfg(test)]
mod test_support;
mod writer;

pub use compare::{GroupingFn, SortingFn};
pub use handle::{EnumerateOptions, ViewConfig, ViewHandle, ViewOptions, ViewReadTxn, ViewWriteTxn};

use rusqlite::Connection;
use strata_core::ReadAccess;

/// Adapter giving this crate the base store's read helpers on a raw
/// connection (hooks and registration receive the connection, not a
/// transaction wrapper).
pub(crate) struct BaseSql<'a>(pub &'a Connection);

impl ReadAccess for BaseSql<'_> {
    fn sql(&self) -> &Connection {
        self.0
    }
}
