//! Shared vocabulary types for StrataKV.
//!
//! Everything in this crate is plain data: row identity, page identity,
//! column flags, callback shapes and the change records handed to observers
//! after a commit. The base store (`strata-core`) and every extension crate
//! speak these types; none of them carry behaviour beyond construction,
//! display and (de)serialisation.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum number of rows a view page may hold after a commit.
///
/// Mid-transaction a page may temporarily exceed this bound; the pre-commit
/// rebalancer restores it before anything becomes visible to readers.
pub const MAX_PAGE_SIZE: usize = 50;

/// Maximum number of SQL host parameters bound by a single statement.
///
/// Matches SQLite's default `SQLITE_LIMIT_VARIABLE_NUMBER`. Bulk keymap
/// scans chunk their `IN (...)` lists at this size.
pub const SQL_VARIABLE_LIMIT: usize = 999;

// ---------------------------------------------------------------------------
// RowId
// ---------------------------------------------------------------------------

/// Identity of a row in the base store: a (collection, key) pair.
///
/// Collections and keys are arbitrary non-empty-constrained strings; the
/// pair is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub collection: String,
    pub key: String,
}

impl RowId {
    /// Build a row id from anything string-like.
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

// ---------------------------------------------------------------------------
// PageId
// ---------------------------------------------------------------------------

/// Opaque identifier of a view page, unique for the lifetime of a database.
///
/// Page ids are UUID-v4-shaped strings minted from the process RNG. A
/// collision is treated as fatal corruption; it is never expected to occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct PageId(String);

impl PageId {
    /// Wrap an existing identifier read back from storage.
    #[must_use]
    pub fn from_string(raw: String) -> Self {
        Self(raw)
    }

    /// The identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PageId> for String {
    fn from(id: PageId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ColumnFlags
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Which stored columns of a row an event or callback touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColumnFlags: u8 {
        /// The serialised object column.
        const OBJECT = 1;
        /// The serialised metadata column.
        const METADATA = 2;
    }
}

impl Serialize for ColumnFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ColumnFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid column flags: {bits:#x}")))
    }
}

// ---------------------------------------------------------------------------
// CallbackShape
// ---------------------------------------------------------------------------

/// Which base-store columns a user grouping or sorting callback reads.
///
/// The shape drives lazy fetching: a key-only callback never costs a row
/// read, a key+object callback loads the object column on demand, and so
/// on. It also gates touch events: touching a column no shape reads is a
/// silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackShape {
    /// Reads only (collection, key).
    Key,
    /// Reads (collection, key, object).
    KeyObject,
    /// Reads (collection, key, metadata).
    KeyMetadata,
    /// Reads (collection, key, object, metadata).
    KeyObjectMetadata,
}

impl CallbackShape {
    /// True when the callback reads the object column.
    #[inline]
    #[must_use]
    pub const fn reads_object(self) -> bool {
        matches!(self, Self::KeyObject | Self::KeyObjectMetadata)
    }

    /// True when the callback reads the metadata column.
    #[inline]
    #[must_use]
    pub const fn reads_metadata(self) -> bool {
        matches!(self, Self::KeyMetadata | Self::KeyObjectMetadata)
    }

    /// The columns this shape reads, as flags.
    #[must_use]
    pub const fn columns(self) -> ColumnFlags {
        match self {
            Self::Key => ColumnFlags::empty(),
            Self::KeyObject => ColumnFlags::OBJECT,
            Self::KeyMetadata => ColumnFlags::METADATA,
            Self::KeyObjectMetadata => ColumnFlags::OBJECT.union(ColumnFlags::METADATA),
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeRecord
// ---------------------------------------------------------------------------

/// One entry in a committed transaction's change log.
///
/// Section-level records (`InsertGroup`, `DeleteGroup`, `ResetGroup`)
/// bracket row-level records (`InsertRow`, `DeleteRow`, `UpdateRow`). The
/// log is appended in program order with no coalescing; observers that want
/// folded updates fold them on their side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRecord {
    /// A row entered the view (or moved to a new position).
    InsertRow {
        row: RowId,
        group: String,
        index: usize,
    },
    /// A row left the view (or moved away from a position).
    DeleteRow {
        row: RowId,
        group: String,
        index: usize,
    },
    /// A row changed in place without moving.
    UpdateRow {
        row: RowId,
        group: String,
        index: usize,
        columns: ColumnFlags,
    },
    /// A group gained its first row.
    InsertGroup { group: String },
    /// A group lost its last row.
    DeleteGroup { group: String },
    /// A group was wiped wholesale (view clear).
    ResetGroup { group: String },
}

impl ChangeRecord {
    /// True for section-level records.
    #[must_use]
    pub const fn is_section(&self) -> bool {
        matches!(
            self,
            Self::InsertGroup { .. } | Self::DeleteGroup { .. } | Self::ResetGroup { .. }
        )
    }

    /// The group this record concerns.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::InsertRow { group, .. }
            | Self::DeleteRow { group, .. }
            | Self::UpdateRow { group, .. }
            | Self::InsertGroup { group }
            | Self::DeleteGroup { group }
            | Self::ResetGroup { group } => group,
        }
    }
}

/// The change log of one committed transaction for one named extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeSet {
    /// Registered name of the extension that produced the records.
    pub view: String,
    /// Records in program order.
    pub records: Vec<ChangeRecord>,
}

impl ViewChangeSet {
    #[must_use]
    pub fn new(view: impl Into<String>, records: Vec<ChangeRecord>) -> Self {
        Self {
            view: view.into(),
            records,
        }
    }

    /// True when the transaction left the view untouched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
