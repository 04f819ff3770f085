//! Blob codec for persisted view state.
//!
//! Page bodies are the ordered row-id list; meta blobs are the
//! `{group, prev, count}` record. The forward link is never persisted.
//! The encoding is an implementation detail of this module; everything else
//! treats the blobs as opaque.

use serde::{Deserialize, Serialize};
use strata_error::{Result, StrataError};
use strata_types::PageId;

use crate::page::{Page, PageMeta};

/// Persisted shape of a page descriptor.
#[derive(Debug, Serialize, Deserialize)]
struct MetaRecord {
    group: String,
    prev: Option<String>,
    count: usize,
}

pub(crate) fn encode_page(page: &Page) -> Result<Vec<u8>> {
    serde_json::to_vec(page).map_err(|e| StrataError::corrupt(format!("page encode: {e}")))
}

pub(crate) fn decode_page(blob: &[u8]) -> Result<Page> {
    serde_json::from_slice(blob).map_err(|e| StrataError::corrupt(format!("page decode: {e}")))
}

pub(crate) fn encode_meta(meta: &PageMeta) -> Result<Vec<u8>> {
    let record = MetaRecord {
        group: meta.group.clone(),
        prev: meta.prev.clone().map(String::from),
        count: meta.count,
    };
    serde_json::to_vec(&record).map_err(|e| StrataError::corrupt(format!("meta encode: {e}")))
}

pub(crate) fn decode_meta(id: PageId, blob: &[u8]) -> Result<PageMeta> {
    let record: MetaRecord = serde_json::from_slice(blob)
        .map_err(|e| StrataError::corrupt(format!("meta decode for page {id}: {e}")))?;
    Ok(PageMeta {
        id,
        group: record.group,
        prev: record.prev.map(PageId::from_string),
        next: None,
        count: record.count,
    })
}
