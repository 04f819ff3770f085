//! Durable storage for one view: the mapping table and the page table.
//!
//! Both tables are shadow tables prefixed with the registered view name:
//!
//! - `<view>_key(collection, key, pageKey)` maps a row id to the page that
//!   holds it;
//! - `<view>_page(pageKey, data, metadata)` stores each page body and its
//!   descriptor blob.
//!
//! Everything here runs inside the enclosing write transaction; a failed
//! write aborts the whole transaction. No caching happens at this layer.
//! Statements go through the connection's prepared-statement cache and are
//! re-bound per call.

use rusqlite::{Connection, OptionalExtension, params};
use strata_error::{Result, StrataError};
use strata_types::{PageId, RowId, SQL_VARIABLE_LIMIT};

use crate::codec;
use crate::page::{Page, PageMeta};

#[derive(Debug)]
pub(crate) struct PageStore {
    key_table: String,
    page_table: String,
}

impl PageStore {
    pub fn new(view_name: &str) -> Self {
        Self {
            key_table: format!("{view_name}_key"),
            page_table: format!("{view_name}_page"),
        }
    }

    pub fn create_tables(&self, sql: &Connection) -> Result<()> {
        sql.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{key}\" (
                 collection TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 pageKey    TEXT NOT NULL,
                 PRIMARY KEY(collection, key)
             );
             CREATE TABLE IF NOT EXISTS \"{page}\" (
                 pageKey  TEXT PRIMARY KEY,
                 data     BLOB,
                 metadata BLOB
             );",
            key = self.key_table,
            page = self.page_table,
        ))?;
        Ok(())
    }

    /// Truncate both tables.
    pub fn clear_all(&self, sql: &Connection) -> Result<()> {
        sql.execute(&format!("DELETE FROM \"{}\"", self.key_table), [])?;
        sql.execute(&format!("DELETE FROM \"{}\"", self.page_table), [])?;
        Ok(())
    }

    // --- Page table ---

    /// Load and decode every page descriptor. Used once per load to rebuild
    /// the group index.
    pub fn load_all_page_metas(&self, sql: &Connection) -> Result<Vec<PageMeta>> {
        let mut stmt = sql.prepare_cached(&format!(
            "SELECT pageKey, metadata FROM \"{}\"",
            self.page_table
        ))?;
        let mut rows = stmt.query([])?;
        let mut metas = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            metas.push(codec::decode_meta(PageId::from_string(id), &blob)?);
        }
        Ok(metas)
    }

    pub fn read_page(&self, sql: &Connection, id: &PageId) -> Result<Page> {
        let mut stmt = sql.prepare_cached(&format!(
            "SELECT data FROM \"{}\" WHERE pageKey = ?1",
            self.page_table
        ))?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![id.as_str()], |row| row.get(0))
            .optional()?;
        match blob {
            Some(blob) => codec::decode_page(&blob),
            None => Err(StrataError::corrupt(format!("page {id} is missing"))),
        }
    }

    pub fn write_page(&self, sql: &Connection, page: &Page, meta: &PageMeta) -> Result<()> {
        let data = codec::encode_page(page)?;
        let meta_blob = codec::encode_meta(meta)?;
        let mut stmt = sql.prepare_cached(&format!(
            "INSERT INTO \"{}\" (pageKey, data, metadata) VALUES(?1, ?2, ?3) \
             ON CONFLICT(pageKey) DO UPDATE SET data = excluded.data, \
             metadata = excluded.metadata",
            self.page_table
        ))?;
        stmt.execute(params![meta.id.as_str(), data, meta_blob])?;
        Ok(())
    }

    /// Rewrite only the descriptor of a page whose body is unchanged.
    pub fn write_meta(&self, sql: &Connection, meta: &PageMeta) -> Result<()> {
        let meta_blob = codec::encode_meta(meta)?;
        let mut stmt = sql.prepare_cached(&format!(
            "UPDATE \"{}\" SET metadata = ?2 WHERE pageKey = ?1",
            self.page_table
        ))?;
        let affected = stmt.execute(params![meta.id.as_str(), meta_blob])?;
        if affected == 0 {
            return Err(StrataError::internal(format!(
                "meta write for page {} found no stored page",
                meta.id
            )));
        }
        Ok(())
    }

    pub fn delete_page(&self, sql: &Connection, id: &PageId) -> Result<()> {
        let mut stmt = sql.prepare_cached(&format!(
            "DELETE FROM \"{}\" WHERE pageKey = ?1",
            self.page_table
        ))?;
        stmt.execute(params![id.as_str()])?;
        Ok(())
    }

    // --- Mapping table ---

    pub fn put_key_map(&self, sql: &Connection, row: &RowId, id: &PageId) -> Result<()> {
        let mut stmt = sql.prepare_cached(&format!(
            "INSERT INTO \"{}\" (collection, key, pageKey) VALUES(?1, ?2, ?3) \
             ON CONFLICT(collection, key) DO UPDATE SET pageKey = excluded.pageKey",
            self.key_table
        ))?;
        stmt.execute(params![row.collection, row.key, id.as_str()])?;
        Ok(())
    }

    pub fn delete_key_map(&self, sql: &Connection, row: &RowId) -> Result<()> {
        let mut stmt = sql.prepare_cached(&format!(
            "DELETE FROM \"{}\" WHERE collection = ?1 AND key = ?2",
            self.key_table
        ))?;
        stmt.execute(params![row.collection, row.key])?;
        Ok(())
    }

    pub fn lookup_key_map(&self, sql: &Connection, row: &RowId) -> Result<Option<PageId>> {
        let mut stmt = sql.prepare_cached(&format!(
            "SELECT pageKey FROM \"{}\" WHERE collection = ?1 AND key = ?2",
            self.key_table
        ))?;
        let id: Option<String> = stmt
            .query_row(params![row.collection, row.key], |r| r.get(0))
            .optional()?;
        Ok(id.map(PageId::from_string))
    }

    /// Range-scan the mapping table for specific keys of one collection,
    /// chunked to stay under the host-parameter limit.
    pub fn scan_key_map_keys(
        &self,
        sql: &Connection,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<(String, PageId)>> {
        let mut found = Vec::new();
        for chunk in keys.chunks(SQL_VARIABLE_LIMIT - 1) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let text = format!(
                "SELECT key, pageKey FROM \"{}\" WHERE collection = ?1 AND key IN ({placeholders})",
                self.key_table
            );
            let mut stmt = sql.prepare(&text)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            values.push(&collection);
            for key in chunk {
                values.push(key);
            }
            let mut rows = stmt.query(values.as_slice())?;
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let id: String = row.get(1)?;
                found.push((key, PageId::from_string(id)));
            }
        }
        Ok(found)
    }

    /// Range-scan the mapping table for every key of one collection.
    pub fn scan_key_map_collection(
        &self,
        sql: &Connection,
        collection: &str,
    ) -> Result<Vec<(String, PageId)>> {
        let mut stmt = sql.prepare_cached(&format!(
            "SELECT key, pageKey FROM \"{}\" WHERE collection = ?1",
            self.key_table
        ))?;
        let mut rows = stmt.query(params![collection])?;
        let mut found = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let id: String = row.get(1)?;
            found.push((key, PageId::from_string(id)));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Connection, PageStore) {
        let conn = Connection::open_in_memory().unwrap();
        let store = PageStore::new("byauthor");
        store.create_tables(&conn).unwrap();
        (conn, store)
    }

    fn pid(s: &str) -> PageId {
        PageId::from_string(s.to_owned())
    }

    fn sample_meta(id: &str, count: usize) -> PageMeta {
        PageMeta {
            id: pid(id),
            group: "g".to_owned(),
            prev: None,
            next: None,
            count,
        }
    }

    #[test]
    fn test_page_write_read_roundtrip() {
        let (conn, store) = fixture();
        let page = Page::from_rows(vec![RowId::new("c", "a"), RowId::new("c", "b")]);
        store.write_page(&conn, &page, &sample_meta("p0", 2)).unwrap();
        assert_eq!(store.read_page(&conn, &pid("p0")).unwrap(), page);
    }

    #[test]
    fn test_read_missing_page_is_corrupt() {
        let (conn, store) = fixture();
        let err = store.read_page(&conn, &pid("ghost")).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_write_meta_requires_existing_page() {
        let (conn, store) = fixture();
        let err = store.write_meta(&conn, &sample_meta("p0", 1)).unwrap_err();
        assert!(matches!(err, StrataError::Internal(_)));

        store
            .write_page(&conn, &Page::with_row(RowId::new("c", "a")), &sample_meta("p0", 1))
            .unwrap();
        let mut meta = sample_meta("p0", 1);
        meta.prev = Some(pid("p9"));
        store.write_meta(&conn, &meta).unwrap();
        let metas = store.load_all_page_metas(&conn).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].prev.as_ref().map(PageId::as_str), Some("p9"));
    }

    #[test]
    fn test_key_map_lookup_and_delete() {
        let (conn, store) = fixture();
        let row = RowId::new("books", "b1");
        store.put_key_map(&conn, &row, &pid("p0")).unwrap();
        assert_eq!(store.lookup_key_map(&conn, &row).unwrap(), Some(pid("p0")));

        store.put_key_map(&conn, &row, &pid("p1")).unwrap();
        assert_eq!(store.lookup_key_map(&conn, &row).unwrap(), Some(pid("p1")));

        store.delete_key_map(&conn, &row).unwrap();
        assert_eq!(store.lookup_key_map(&conn, &row).unwrap(), None);
    }

    #[test]
    fn test_scan_key_map_keys_chunks_large_lists() {
        let (conn, store) = fixture();
        let keys: Vec<String> = (0..1500).map(|i| format!("k{i:04}")).collect();
        for key in &keys {
            store
                .put_key_map(&conn, &RowId::new("c", key), &pid("p0"))
                .unwrap();
        }
        let mut asked = keys.clone();
        asked.push("absent".to_owned());
        let found = store.scan_key_map_keys(&conn, "c", &asked).unwrap();
        assert_eq!(found.len(), 1500);
    }

    #[test]
    fn test_scan_key_map_collection_filters() {
        let (conn, store) = fixture();
        store
            .put_key_map(&conn, &RowId::new("a", "k1"), &pid("p0"))
            .unwrap();
        store
            .put_key_map(&conn, &RowId::new("b", "k2"), &pid("p0"))
            .unwrap();
        let found = store.scan_key_map_collection(&conn, "a").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "k1");
    }

    #[test]
    fn test_clear_all_truncates_both_tables() {
        let (conn, store) = fixture();
        store
            .write_page(&conn, &Page::with_row(RowId::new("c", "a")), &sample_meta("p0", 1))
            .unwrap();
        store
            .put_key_map(&conn, &RowId::new("c", "a"), &pid("p0"))
            .unwrap();
        store.clear_all(&conn).unwrap();
        assert!(store.load_all_page_metas(&conn).unwrap().is_empty());
        assert_eq!(
            store.lookup_key_map(&conn, &RowId::new("c", "a")).unwrap(),
            None
        );
    }
}
