//! Read and write transactions over the base store.
//!
//! Both transaction kinds borrow the single serialised connection owned by
//! [`Database`](crate::Database). Reads shared by both kinds live in the
//! [`ReadAccess`] trait; mutations live on [`WriteTxn`] and dispatch the
//! registered extension hooks after the base row has been written.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use strata_error::Result;
use strata_types::SQL_VARIABLE_LIMIT;
use tracing::debug;

use crate::extension::Extension;

// ---------------------------------------------------------------------------
// ReadAccess
// ---------------------------------------------------------------------------

/// Read operations available in every transaction kind.
pub trait ReadAccess {
    /// The live SQL connection of this transaction.
    fn sql(&self) -> &Connection;

    /// Load a row's object column.
    fn get_object(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT object FROM kv WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt
            .query_row(params![collection, key], |row| row.get(0))
            .optional()?)
    }

    /// Load a row's metadata column. The outer `Option` distinguishes a
    /// missing row from a present row whose metadata is NULL.
    fn get_metadata(&self, collection: &str, key: &str) -> Result<Option<Option<Vec<u8>>>> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT metadata FROM kv WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt
            .query_row(params![collection, key], |row| row.get(0))
            .optional()?)
    }

    /// Load a row's object and metadata together.
    fn get_row(&self, collection: &str, key: &str) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT object, metadata FROM kv WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt
            .query_row(params![collection, key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?)
    }

    /// True when the row exists.
    fn contains(&self, collection: &str, key: &str) -> Result<bool> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT 1 FROM kv WHERE collection = ?1 AND key = ?2")?;
        Ok(stmt
            .query_row(params![collection, key], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Number of rows in one collection.
    fn key_count(&self, collection: &str) -> Result<usize> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT count(*) FROM kv WHERE collection = ?1")?;
        let n: i64 = stmt.query_row(params![collection], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Read an extension's persisted configuration value.
    fn registry_get(&self, extension: &str, name: &str) -> Result<Option<String>> {
        let mut stmt = self.sql().prepare_cached(
            "SELECT value FROM strata_registry WHERE extension = ?1 AND name = ?2",
        )?;
        Ok(stmt
            .query_row(params![extension, name], |row| row.get(0))
            .optional()?)
    }

    // --- Enumerators ---
    //
    // Four column footprints so a caller (typically an extension populator)
    // pays only for the columns its callbacks actually read.

    /// Walk every (collection, key) pair in store order.
    fn enumerate_keys(&self, mut f: impl FnMut(&str, &str) -> Result<()>) -> Result<()> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT collection, key FROM kv ORDER BY collection, key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let key: String = row.get(1)?;
            f(&collection, &key)?;
        }
        Ok(())
    }

    /// Walk every row with its metadata column.
    fn enumerate_keys_metadata(
        &self,
        mut f: impl FnMut(&str, &str, Option<&[u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT collection, key, metadata FROM kv ORDER BY collection, key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let key: String = row.get(1)?;
            let metadata: Option<Vec<u8>> = row.get(2)?;
            f(&collection, &key, metadata.as_deref())?;
        }
        Ok(())
    }

    /// Walk every row with its object column.
    fn enumerate_keys_objects(
        &self,
        mut f: impl FnMut(&str, &str, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self
            .sql()
            .prepare_cached("SELECT collection, key, object FROM kv ORDER BY collection, key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let key: String = row.get(1)?;
            let object: Vec<u8> = row.get(2)?;
            f(&collection, &key, &object)?;
        }
        Ok(())
    }

    /// Walk every row with both stored columns.
    fn enumerate_rows(
        &self,
        mut f: impl FnMut(&str, &str, &[u8], Option<&[u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.sql().prepare_cached(
            "SELECT collection, key, object, metadata FROM kv ORDER BY collection, key",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let key: String = row.get(1)?;
            let object: Vec<u8> = row.get(2)?;
            let metadata: Option<Vec<u8>> = row.get(3)?;
            f(&collection, &key, &object, metadata.as_deref())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReadTxn
// ---------------------------------------------------------------------------

/// A read-only transaction. Sees the last committed state.
pub struct ReadTxn<'a> {
    pub(crate) sql: &'a Connection,
}

impl ReadAccess for ReadTxn<'_> {
    fn sql(&self) -> &Connection {
        self.sql
    }
}

impl std::fmt::Debug for ReadTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTxn").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WriteTxn
// ---------------------------------------------------------------------------

/// The single write transaction. Every mutation writes the base row first,
/// then hands the event to each registered extension in registration order.
pub struct WriteTxn<'a> {
    pub(crate) sql: rusqlite::Transaction<'a>,
    pub(crate) extensions: Vec<Arc<dyn Extension>>,
}

impl ReadAccess for WriteTxn<'_> {
    fn sql(&self) -> &Connection {
        &self.sql
    }
}

impl WriteTxn<'_> {
    /// Write a row, replacing object and metadata.
    pub fn set(
        &self,
        collection: &str,
        key: &str,
        object: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let mut stmt = self.sql.prepare_cached(
            "INSERT INTO kv(collection, key, object, metadata) VALUES(?1, ?2, ?3, ?4) \
             ON CONFLICT(collection, key) \
             DO UPDATE SET object = excluded.object, metadata = excluded.metadata",
        )?;
        stmt.execute(params![collection, key, object, metadata])?;
        for ext in &self.extensions {
            ext.after_set(&self.sql, collection, key, object, metadata)?;
        }
        Ok(())
    }

    /// Replace a row's metadata, leaving the object untouched.
    ///
    /// A missing row is a no-op: metadata cannot exist without its row.
    pub fn set_metadata(&self, collection: &str, key: &str, metadata: Option<&[u8]>) -> Result<()> {
        let mut stmt = self
            .sql
            .prepare_cached("UPDATE kv SET metadata = ?3 WHERE collection = ?1 AND key = ?2")?;
        let affected = stmt.execute(params![collection, key, metadata])?;
        if affected == 0 {
            debug!(collection, key, "set_metadata on missing row ignored");
            return Ok(());
        }
        for ext in &self.extensions {
            ext.after_set_metadata(&self.sql, collection, key, metadata)?;
        }
        Ok(())
    }

    /// Delete one row. Deleting a missing row is a no-op.
    pub fn remove(&self, collection: &str, key: &str) -> Result<()> {
        let mut stmt = self
            .sql
            .prepare_cached("DELETE FROM kv WHERE collection = ?1 AND key = ?2")?;
        let affected = stmt.execute(params![collection, key])?;
        if affected == 0 {
            return Ok(());
        }
        for ext in &self.extensions {
            ext.after_remove(&self.sql, collection, key)?;
        }
        Ok(())
    }

    /// Delete several rows of one collection in one call.
    pub fn remove_many(&self, collection: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        // One host parameter is taken by the collection.
        for chunk in keys.chunks(SQL_VARIABLE_LIMIT - 1) {
            let placeholders = placeholder_list(2, chunk.len());
            let sql = format!("DELETE FROM kv WHERE collection = ?1 AND key IN ({placeholders})");
            let mut stmt = self.sql.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            values.push(&collection);
            for key in chunk {
                values.push(key);
            }
            stmt.execute(values.as_slice())?;
        }
        for ext in &self.extensions {
            ext.after_remove_many(&self.sql, collection, keys)?;
        }
        Ok(())
    }

    /// Delete every row of one collection.
    pub fn remove_all_in_collection(&self, collection: &str) -> Result<()> {
        let mut stmt = self
            .sql
            .prepare_cached("DELETE FROM kv WHERE collection = ?1")?;
        stmt.execute(params![collection])?;
        for ext in &self.extensions {
            ext.after_remove_all_in_collection(&self.sql, collection)?;
        }
        Ok(())
    }

    /// Delete every row of the store.
    pub fn remove_all(&self) -> Result<()> {
        self.sql.execute("DELETE FROM kv", [])?;
        for ext in &self.extensions {
            ext.after_remove_all(&self.sql)?;
        }
        Ok(())
    }

    /// Persist an extension's configuration value.
    pub fn registry_put(&self, extension: &str, name: &str, value: &str) -> Result<()> {
        registry_put(&self.sql, extension, name, value)
    }
}

/// Persist an extension's configuration value on a raw connection.
///
/// Extensions call this from `init`, where no [`WriteTxn`] wrapper exists
/// yet; everything still runs inside the registration transaction.
pub fn registry_put(sql: &Connection, extension: &str, name: &str, value: &str) -> Result<()> {
    let mut stmt = sql.prepare_cached(
        "INSERT INTO strata_registry(extension, name, value) VALUES(?1, ?2, ?3) \
         ON CONFLICT(extension, name) DO UPDATE SET value = excluded.value",
    )?;
    stmt.execute(params![extension, name, value])?;
    Ok(())
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

/// Build `?start, ?start+1, ...` for an `IN` list of `count` parameters.
fn placeholder_list(start: usize, count: usize) -> String {
    let mut out = String::with_capacity(count * 4);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
        out.push_str(&(start + i).to_string());
    }
    out
}
