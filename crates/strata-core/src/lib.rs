//! StrataKV base store: a transactional key/value store layered over an
//! embedded SQL engine, with a pluggable extension mechanism.
//!
//! Rows live in one `kv` table keyed by (collection, key), holding an opaque
//! object blob and an optional opaque metadata blob. The serialisation of
//! those blobs is the caller's business.
//!
//! Concurrency model: single-writer, many-reader. One SQL connection guarded
//! by a mutex serialises everything; [`Database::write`] runs the caller's
//! closure inside a SQL transaction, gives every registered [`Extension`]
//! its pre-commit and flush turns, commits, and only then lets extensions
//! publish their in-memory state and hands their change logs to observers.
//! A failed closure rolls the SQL transaction back and tells every extension
//! to discard its overlay.

mod extension;
mod transaction;

pub use extension::Extension;
pub use transaction::{ReadAccess, ReadTxn, WriteTxn, registry_put};

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use strata_error::{Result, StrataError};
use strata_types::ViewChangeSet;
use tracing::{debug, info};

type Observer = Arc<dyn Fn(&ViewChangeSet) + Send + Sync>;

/// Schema for the base table and the extension configuration registry.
const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS kv (
    collection TEXT NOT NULL,
    key        TEXT NOT NULL,
    object     BLOB NOT NULL,
    metadata   BLOB,
    PRIMARY KEY(collection, key)
);
CREATE TABLE IF NOT EXISTS strata_registry (
    extension TEXT NOT NULL,
    name      TEXT NOT NULL,
    value     TEXT NOT NULL,
    PRIMARY KEY(extension, name)
);";

/// A StrataKV database: one serialised connection plus the registered
/// extensions and change-set observers.
pub struct Database {
    conn: Mutex<Connection>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    observers: Mutex<Vec<Observer>>,
}

impl Database {
    /// Open (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // WAL keeps readers cheap; failure (e.g. on special filesystems) is
        // tolerated and we stay on the default journal.
        let _: std::result::Result<String, _> =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0));
        Self::with_connection(conn)
    }

    /// Open an in-memory database (tests, scratch work).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            extensions: RwLock::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Register an extension.
    ///
    /// Runs the extension's `init` inside a write transaction; once the
    /// transaction commits the extension starts receiving hooks. Registering
    /// the same name again with the same version is a no-op; a different
    /// version is a [`StrataError::VersionMismatch`].
    pub fn register(&self, ext: Arc<dyn Extension>) -> Result<()> {
        {
            let live = self.extensions.read();
            if let Some(existing) = live.iter().find(|e| e.name() == ext.name()) {
                if existing.version() == ext.version() {
                    return Ok(());
                }
                return Err(StrataError::VersionMismatch {
                    name: ext.name().to_owned(),
                    registered: existing.version(),
                    requested: ext.version(),
                });
            }
        }

        let change_set = {
            let mut conn = self.conn.lock();
            let sql = conn.transaction()?;
            if let Err(err) = ext.init(&sql) {
                ext.abort();
                return Err(err);
            }
            if let Err(err) = sql.commit() {
                ext.abort();
                return Err(err.into());
            }
            let change_set = ext.post_commit();
            self.extensions.write().push(Arc::clone(&ext));
            change_set
        };

        info!(name = ext.name(), version = ext.version(), "extension registered");
        if let Some(set) = change_set {
            if !set.is_empty() {
                self.notify(std::slice::from_ref(&set));
            }
        }
        Ok(())
    }

    /// Subscribe to committed change sets. Observers run on the committing
    /// thread, after the commit, outside every internal lock.
    pub fn add_observer(&self, observer: impl Fn(&ViewChangeSet) + Send + Sync + 'static) {
        self.observers.lock().push(Arc::new(observer));
    }

    /// Run a read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTxn<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        let txn = ReadTxn { sql: &conn };
        f(&txn)
    }

    /// Run a write transaction.
    ///
    /// Commit sequence: closure → per-extension `pre_commit` → per-extension
    /// `flush` → SQL COMMIT → per-extension `post_commit` → observer
    /// dispatch. Any error before COMMIT rolls everything back and calls
    /// `abort` on every extension.
    pub fn write<T>(&self, f: impl FnOnce(&WriteTxn<'_>) -> Result<T>) -> Result<T> {
        // `conn` (and the transaction borrowing it) are confined to this
        // block so the lock is released before `notify` runs below.
        let committed = {
            let mut conn = self.conn.lock();
            let extensions = self.extensions.read().clone();
            let sql = conn.transaction()?;
            let txn = WriteTxn { sql, extensions };

            let outcome = f(&txn).and_then(|value| {
                for ext in &txn.extensions {
                    ext.pre_commit(&txn.sql)?;
                }
                for ext in &txn.extensions {
                    ext.flush(&txn.sql)?;
                }
                Ok(value)
            });

            let WriteTxn { sql, extensions } = txn;
            match outcome {
                Ok(value) => {
                    if let Err(err) = sql.commit() {
                        for ext in &extensions {
                            ext.abort();
                        }
                        return Err(err.into());
                    }
                    let mut sets = Vec::new();
                    for ext in &extensions {
                        if let Some(set) = ext.post_commit() {
                            if !set.is_empty() {
                                sets.push(set);
                            }
                        }
                    }
                    Ok((value, sets))
                }
                Err(err) => {
                    debug!(error = %err, "write transaction rolled back");
                    for ext in &extensions {
                        ext.abort();
                    }
                    // Dropping the transaction rolls it back.
                    drop(sql);
                    Err(err)
                }
            }
        };

        match committed {
            Ok((value, sets)) => {
                self.notify(&sets);
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    fn notify(&self, sets: &[ViewChangeSet]) {
        if sets.is_empty() {
            return;
        }
        let observers = self.observers.lock().clone();
        for set in sets {
            for observer in &observers {
                observer(set);
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("extensions", &self.extensions.read().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
