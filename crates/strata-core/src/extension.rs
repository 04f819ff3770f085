//! The pluggable extension seam.
//!
//! An extension is a secondary structure maintained alongside the base
//! store: it owns its own tables, is told about every mutation through the
//! `after_*` hooks, gets a pre-commit pass for deferred maintenance, flushes
//! its dirty state inside the same SQL transaction as the base writes, and
//! publishes its in-memory state only after the SQL commit succeeds.
//!
//! All hooks take the live SQL connection of the enclosing transaction; an
//! extension never opens its own connection, so its writes share the fate of
//! the outer transaction.

use rusqlite::Connection;
use strata_error::Result;
use strata_types::ViewChangeSet;

/// A secondary structure registered on a [`Database`](crate::Database).
///
/// Hook methods default to no-ops so an extension only implements the
/// events it cares about. Hooks run strictly sequentially on the writer
/// thread, in registration order, after the base row has been written.
pub trait Extension: Send + Sync {
    /// Registered name; doubles as the prefix of the extension's tables.
    fn name(&self) -> &str;

    /// Configuration version. Bumping it forces a rebuild at registration.
    fn version(&self) -> i64 {
        0
    }

    /// Called once at registration, inside a write transaction. Creates the
    /// extension's tables and builds its initial state (including any full
    /// population), leaving storage consistent with memory when it returns.
    fn init(&self, sql: &Connection) -> Result<()>;

    /// A row was written (object and metadata both replaced).
    fn after_set(
        &self,
        sql: &Connection,
        collection: &str,
        key: &str,
        object: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let _ = (sql, collection, key, object, metadata);
        Ok(())
    }

    /// A row's metadata was replaced; the object is untouched.
    fn after_set_metadata(
        &self,
        sql: &Connection,
        collection: &str,
        key: &str,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let _ = (sql, collection, key, metadata);
        Ok(())
    }

    /// A single row was deleted.
    fn after_remove(&self, sql: &Connection, collection: &str, key: &str) -> Result<()> {
        let _ = (sql, collection, key);
        Ok(())
    }

    /// Several rows of one collection were deleted in one call.
    fn after_remove_many(&self, sql: &Connection, collection: &str, keys: &[String]) -> Result<()> {
        let _ = (sql, collection, keys);
        Ok(())
    }

    /// Every row of one collection was deleted.
    fn after_remove_all_in_collection(&self, sql: &Connection, collection: &str) -> Result<()> {
        let _ = (sql, collection);
        Ok(())
    }

    /// Every row of the store was deleted.
    fn after_remove_all(&self, sql: &Connection) -> Result<()> {
        let _ = sql;
        Ok(())
    }

    /// Deferred maintenance point, invoked once per write transaction after
    /// the user closure returns and before anything is flushed.
    fn pre_commit(&self, sql: &Connection) -> Result<()> {
        let _ = sql;
        Ok(())
    }

    /// Write the extension's dirty state into the enclosing transaction.
    fn flush(&self, sql: &Connection) -> Result<()> {
        let _ = sql;
        Ok(())
    }

    /// The SQL commit succeeded: merge the transaction's overlay into shared
    /// state and hand back the change log for observer dispatch.
    fn post_commit(&self) -> Option<ViewChangeSet> {
        None
    }

    /// The transaction failed or was abandoned: discard the overlay without
    /// touching shared state.
    fn abort(&self) {}
}
