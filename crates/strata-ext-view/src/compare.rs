//! User grouping and sorting callbacks, and the harness that feeds them.
//!
//! Both callback families come in four shapes, one per combination of
//! base-store columns the closure reads. Each family is a single enum with
//! one boxed closure per shape so dispatch is one `match` per call; the
//! shape also tells the harness which columns to fetch lazily for the
//! counterpart row of a comparison.
//!
//! The row being inserted usually has its columns in hand (they arrived
//! with the mutation); the rows it is compared against are loaded from the
//! base transaction on demand, through small bounded caches.

use std::cmp::Ordering;

use rusqlite::Connection;
use strata_core::ReadAccess;
use strata_error::{Result, StrataError};
use strata_types::{CallbackShape, RowId};

use crate::cache::BoundedCache;

// ---------------------------------------------------------------------------
// Callback enums
// ---------------------------------------------------------------------------

type KeyGrouper = dyn Fn(&RowId) -> Option<String> + Send + Sync;
type ObjectGrouper = dyn Fn(&RowId, &[u8]) -> Option<String> + Send + Sync;
type MetadataGrouper = dyn Fn(&RowId, Option<&[u8]>) -> Option<String> + Send + Sync;
type RowGrouper = dyn Fn(&RowId, &[u8], Option<&[u8]>) -> Option<String> + Send + Sync;

/// Assigns every base row to a group, or excludes it from the view.
pub enum GroupingFn {
    /// Reads only the row id.
    Key(Box<KeyGrouper>),
    /// Reads the row id and the object column.
    KeyObject(Box<ObjectGrouper>),
    /// Reads the row id and the metadata column.
    KeyMetadata(Box<MetadataGrouper>),
    /// Reads everything.
    KeyObjectMetadata(Box<RowGrouper>),
}

impl GroupingFn {
    pub fn by_key(f: impl Fn(&RowId) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Key(Box::new(f))
    }

    pub fn by_object(
        f: impl Fn(&RowId, &[u8]) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::KeyObject(Box::new(f))
    }

    pub fn by_metadata(
        f: impl Fn(&RowId, Option<&[u8]>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::KeyMetadata(Box::new(f))
    }

    pub fn by_row(
        f: impl Fn(&RowId, &[u8], Option<&[u8]>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::KeyObjectMetadata(Box::new(f))
    }

    #[must_use]
    pub fn shape(&self) -> CallbackShape {
        match self {
            Self::Key(_) => CallbackShape::Key,
            Self::KeyObject(_) => CallbackShape::KeyObject,
            Self::KeyMetadata(_) => CallbackShape::KeyMetadata,
            Self::KeyObjectMetadata(_) => CallbackShape::KeyObjectMetadata,
        }
    }
}

impl std::fmt::Debug for GroupingFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GroupingFn").field(&self.shape()).finish()
    }
}

type KeySorter = dyn Fn(&RowId, &RowId) -> Ordering + Send + Sync;
type ObjectSorter = dyn Fn(&RowId, &[u8], &RowId, &[u8]) -> Ordering + Send + Sync;
type MetadataSorter =
    dyn Fn(&RowId, Option<&[u8]>, &RowId, Option<&[u8]>) -> Ordering + Send + Sync;
type RowSorter = dyn Fn(&RowId, &[u8], Option<&[u8]>, &RowId, &[u8], Option<&[u8]>) -> Ordering
    + Send
    + Sync;

/// Orders two rows of the same group.
pub enum SortingFn {
    /// Reads only the row ids.
    Key(Box<KeySorter>),
    /// Reads the object columns.
    KeyObject(Box<ObjectSorter>),
    /// Reads the metadata columns.
    KeyMetadata(Box<MetadataSorter>),
    /// Reads everything.
    KeyObjectMetadata(Box<RowSorter>),
}

impl SortingFn {
    pub fn by_key(f: impl Fn(&RowId, &RowId) -> Ordering + Send + Sync + 'static) -> Self {
        Self::Key(Box::new(f))
    }

    pub fn by_object(
        f: impl Fn(&RowId, &[u8], &RowId, &[u8]) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self::KeyObject(Box::new(f))
    }

    pub fn by_metadata(
        f: impl Fn(&RowId, Option<&[u8]>, &RowId, Option<&[u8]>) -> Ordering
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::KeyMetadata(Box::new(f))
    }

    pub fn by_row(
        f: impl Fn(&RowId, &[u8], Option<&[u8]>, &RowId, &[u8], Option<&[u8]>) -> Ordering
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::KeyObjectMetadata(Box::new(f))
    }

    #[must_use]
    pub fn shape(&self) -> CallbackShape {
        match self {
            Self::Key(_) => CallbackShape::Key,
            Self::KeyObject(_) => CallbackShape::KeyObject,
            Self::KeyMetadata(_) => CallbackShape::KeyMetadata,
            Self::KeyObjectMetadata(_) => CallbackShape::KeyObjectMetadata,
        }
    }
}

impl std::fmt::Debug for SortingFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SortingFn").field(&self.shape()).finish()
    }
}

// ---------------------------------------------------------------------------
// Candidate rows and lazy fetching
// ---------------------------------------------------------------------------

/// The row a mutation concerns, with whatever columns arrived in hand.
///
/// `object: None` / `metadata: None` mean "not in hand", not "NULL"; the
/// inner option of `metadata` carries nullability.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate<'a> {
    pub row: &'a RowId,
    pub object: Option<&'a [u8]>,
    pub metadata: Option<Option<&'a [u8]>>,
}

/// Column loader for counterpart rows, with per-transaction caches.
pub(crate) struct Fetcher<'a> {
    sql: &'a Connection,
    objects: &'a mut BoundedCache<RowId, std::sync::Arc<Vec<u8>>>,
    metadatas: &'a mut BoundedCache<RowId, Option<std::sync::Arc<Vec<u8>>>>,
}

impl<'a> Fetcher<'a> {
    pub fn new(
        sql: &'a Connection,
        objects: &'a mut BoundedCache<RowId, std::sync::Arc<Vec<u8>>>,
        metadatas: &'a mut BoundedCache<RowId, Option<std::sync::Arc<Vec<u8>>>>,
    ) -> Self {
        Self {
            sql,
            objects,
            metadatas,
        }
    }

    /// Drop any cached columns for a row whose stored value changed.
    pub fn invalidate(&mut self, row: &RowId) {
        self.objects.remove(row);
        self.metadatas.remove(row);
    }

    fn object(&mut self, row: &RowId) -> Result<std::sync::Arc<Vec<u8>>> {
        if let Some(hit) = self.objects.get(row) {
            return Ok(std::sync::Arc::clone(hit));
        }
        let object = crate::BaseSql(self.sql)
            .get_object(&row.collection, &row.key)?
            .ok_or_else(|| {
                StrataError::internal(format!("view row {row} has no base object"))
            })?;
        let object = std::sync::Arc::new(object);
        self.objects.insert(row.clone(), std::sync::Arc::clone(&object));
        Ok(object)
    }

    fn metadata(&mut self, row: &RowId) -> Result<Option<std::sync::Arc<Vec<u8>>>> {
        if let Some(hit) = self.metadatas.get(row) {
            return Ok(hit.clone());
        }
        let metadata = crate::BaseSql(self.sql)
            .get_metadata(&row.collection, &row.key)?
            .ok_or_else(|| {
                StrataError::internal(format!("view row {row} has no base row"))
            })?;
        let metadata = metadata.map(std::sync::Arc::new);
        self.metadatas.insert(row.clone(), metadata.clone());
        Ok(metadata)
    }
}

// ---------------------------------------------------------------------------
// Harness entry points
// ---------------------------------------------------------------------------

/// Evaluate the grouping function for a candidate row, fetching whichever
/// columns the shape reads and the caller did not pass in hand.
pub(crate) fn evaluate_group(
    fetcher: &mut Fetcher<'_>,
    grouping: &GroupingFn,
    candidate: Candidate<'_>,
) -> Result<Option<String>> {
    match grouping {
        GroupingFn::Key(f) => Ok(f(candidate.row)),
        GroupingFn::KeyObject(f) => {
            let object = resolve_object(fetcher, candidate)?;
            Ok(f(candidate.row, &object))
        }
        GroupingFn::KeyMetadata(f) => {
            let metadata = resolve_metadata(fetcher, candidate)?;
            Ok(f(candidate.row, metadata.as_deref()))
        }
        GroupingFn::KeyObjectMetadata(f) => {
            let object = resolve_object(fetcher, candidate)?;
            let metadata = resolve_metadata(fetcher, candidate)?;
            Ok(f(candidate.row, &object, metadata.as_deref()))
        }
    }
}

/// Order a candidate row against a row already in the view.
///
/// Returns the ordering of `candidate` relative to `other`.
pub(crate) fn compare_rows(
    fetcher: &mut Fetcher<'_>,
    sorting: &SortingFn,
    candidate: Candidate<'_>,
    other: &RowId,
) -> Result<Ordering> {
    match sorting {
        SortingFn::Key(f) => Ok(f(candidate.row, other)),
        SortingFn::KeyObject(f) => {
            let other_object = fetcher.object(other)?;
            let object = resolve_object(fetcher, candidate)?;
            Ok(f(candidate.row, &object, other, &other_object))
        }
        SortingFn::KeyMetadata(f) => {
            let other_metadata = fetcher.metadata(other)?;
            let metadata = resolve_metadata(fetcher, candidate)?;
            Ok(f(
                candidate.row,
                metadata.as_deref(),
                other,
                other_metadata.as_deref().map(Vec::as_slice),
            ))
        }
        SortingFn::KeyObjectMetadata(f) => {
            let other_object = fetcher.object(other)?;
            let other_metadata = fetcher.metadata(other)?;
            let object = resolve_object(fetcher, candidate)?;
            let metadata = resolve_metadata(fetcher, candidate)?;
            Ok(f(
                candidate.row,
                &object,
                metadata.as_deref(),
                other,
                &other_object,
                other_metadata.as_deref().map(Vec::as_slice),
            ))
        }
    }
}

enum Resolved<'a> {
    InHand(&'a [u8]),
    Fetched(std::sync::Arc<Vec<u8>>),
}

impl std::ops::Deref for Resolved<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::InHand(bytes) => bytes,
            Self::Fetched(arc) => arc,
        }
    }
}

fn resolve_object<'a>(
    fetcher: &mut Fetcher<'_>,
    candidate: Candidate<'a>,
) -> Result<Resolved<'a>> {
    match candidate.object {
        Some(bytes) => Ok(Resolved::InHand(bytes)),
        None => Ok(Resolved::Fetched(fetcher.object(candidate.row)?)),
    }
}

enum ResolvedOpt<'a> {
    InHand(Option<&'a [u8]>),
    Fetched(Option<std::sync::Arc<Vec<u8>>>),
}

impl ResolvedOpt<'_> {
    fn as_deref(&self) -> Option<&[u8]> {
        match self {
            Self::InHand(bytes) => *bytes,
            Self::Fetched(arc) => arc.as_deref().map(Vec::as_slice),
        }
    }
}

fn resolve_metadata<'a>(
    fetcher: &mut Fetcher<'_>,
    candidate: Candidate<'a>,
) -> Result<ResolvedOpt<'a>> {
    match candidate.metadata {
        Some(bytes) => Ok(ResolvedOpt::InHand(bytes)),
        None => Ok(ResolvedOpt::Fetched(fetcher.metadata(candidate.row)?)),
    }
}
