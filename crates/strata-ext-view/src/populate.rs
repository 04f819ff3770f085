//! Full rebuild of a view from the base store.
//!
//! Runs at first registration and whenever the registered version changes.
//! The base store offers four enumerators with different column footprints;
//! the union of the grouping and sorting shapes picks the cheapest one that
//! still hands the callbacks their columns without per-row fetches. Rows the
//! grouping function excludes are skipped before any further work.

use strata_core::ReadAccess;
use strata_error::Result;
use strata_types::{ColumnFlags, RowId};
use tracing::info;

use crate::writer::WriteCtx;

/// Walk the whole base store and insert every qualifying row.
pub(crate) fn run(ctx: &mut WriteCtx<'_>) -> Result<()> {
    let needs_object =
        ctx.grouping.shape().reads_object() || ctx.sorting.shape().reads_object();
    let needs_metadata =
        ctx.grouping.shape().reads_metadata() || ctx.sorting.shape().reads_metadata();
    info!(needs_object, needs_metadata, "populating view");

    let sql = ctx.sql;
    let mut inserted = 0usize;
    match (needs_object, needs_metadata) {
        (false, false) => crate::BaseSql(sql).enumerate_keys(|collection, key| {
            inserted += insert_one(ctx, RowId::new(collection, key), None, None)?;
            Ok(())
        })?,
        (false, true) => crate::BaseSql(sql).enumerate_keys_metadata(|collection, key, metadata| {
            inserted +=
                insert_one(ctx, RowId::new(collection, key), None, Some(metadata))?;
            Ok(())
        })?,
        (true, false) => crate::BaseSql(sql).enumerate_keys_objects(|collection, key, object| {
            inserted += insert_one(ctx, RowId::new(collection, key), Some(object), None)?;
            Ok(())
        })?,
        (true, true) => crate::BaseSql(sql).enumerate_rows(|collection, key, object, metadata| {
            inserted += insert_one(
                ctx,
                RowId::new(collection, key),
                Some(object),
                Some(metadata),
            )?;
            Ok(())
        })?,
    }
    info!(inserted, "view population finished");
    Ok(())
}

fn insert_one(
    ctx: &mut WriteCtx<'_>,
    row: RowId,
    object: Option<&[u8]>,
    metadata: Option<Option<&[u8]>>,
) -> Result<usize> {
    let candidate = crate::compare::Candidate {
        row: &row,
        object,
        metadata,
    };
    let state = &mut *ctx.state;
    let mut fetcher = crate::compare::Fetcher::new(
        ctx.sql,
        &mut state.objects,
        &mut state.metadatas,
    );
    let Some(group) = crate::compare::evaluate_group(&mut fetcher, ctx.grouping, candidate)?
    else {
        return Ok(0);
    };
    ctx.insert_row(row, object, metadata, &group, ColumnFlags::all(), true)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, object_grouped_config, key_sorted_config};

    fn seed(h: &Harness) {
        h.conn
            .execute_batch(
                "INSERT INTO kv(collection, key, object, metadata) VALUES
                 ('c', 'k1', x'67313a31', NULL),
                 ('c', 'k2', x'67323a31', NULL),
                 ('c', 'k3', x'6e6f7065', NULL),
                 ('d', 'k4', x'67313a30', x'01');",
            )
            .unwrap();
    }

    #[test]
    fn test_populate_skips_excluded_rows() {
        // Objects are "g1:1", "g2:1", "nope", "g1:0"; the grouping function
        // only admits prefixed ones.
        let mut h = Harness::new(object_grouped_config());
        seed(&h);
        h.with_ctx(run).unwrap();
        h.with_ctx(|ctx| {
            assert_eq!(ctx.state.index.group_count(), 2);
            assert_eq!(ctx.state.index.group_total("g1"), 2);
            assert_eq!(ctx.state.index.group_total("g2"), 1);
            assert_eq!(ctx.lookup_mapping(&RowId::new("c", "k3"))?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_populate_orders_within_group() {
        let mut h = Harness::new(object_grouped_config());
        seed(&h);
        h.with_ctx(run).unwrap();
        // "g1:0" (d/k4) sorts before "g1:1" (c/k1).
        assert_eq!(
            h.group_rows("g1"),
            vec![RowId::new("d", "k4"), RowId::new("c", "k1")]
        );
    }

    #[test]
    fn test_populate_key_shape_reads_no_columns() {
        let mut h = Harness::new(key_sorted_config());
        seed(&h);
        h.with_ctx(run).unwrap();
        h.with_ctx(|ctx| {
            assert_eq!(ctx.state.index.group_total("g"), 4);
            // Nothing was fetched: the lazy caches never filled.
            assert_eq!(ctx.state.objects.len(), 0);
            assert_eq!(ctx.state.metadatas.len(), 0);
            Ok(())
        })
        .unwrap();
    }
}
