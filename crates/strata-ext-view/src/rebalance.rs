//! Pre-commit page maintenance.
//!
//! Mid-transaction the mutator lets pages grow past the size bound and
//! shrink to zero; nothing visible depends on page shapes until commit. This
//! module restores the bounds in two passes right before the flush:
//!
//! - **Pass A** splits oversize pages, preferring to shift rows into an
//!   undersized neighbour (previous page's tail, then next page's head)
//!   before allocating a new page spliced in after the oversize one.
//! - **Pass B** drops empty pages, unlinking them from their chain and
//!   deleting them write-through; a group whose last page goes away is
//!   dropped and logged.
//!
//! Split runs first so rows land in neighbours where possible; drop runs
//! second and never sees pages that a split could still have filled.

use strata_error::{Result, StrataError};
use strata_types::{MAX_PAGE_SIZE, PageId};
use tracing::debug;

use crate::page::{Page, PageMeta, new_page_id};
use crate::writer::WriteCtx;

/// Run both passes over the transaction's dirty descriptors.
pub(crate) fn run(ctx: &mut WriteCtx<'_>) -> Result<()> {
    split_oversize(ctx)?;
    drop_empty(ctx)
}

// ---------------------------------------------------------------------------
// Pass A: split oversize pages
// ---------------------------------------------------------------------------

fn split_oversize(ctx: &mut WriteCtx<'_>) -> Result<()> {
    for pid in ctx.oversize_pages() {
        loop {
            let Some(meta) = ctx.state.index.meta(&pid) else {
                break;
            };
            let count = meta.count;
            if count <= MAX_PAGE_SIZE {
                break;
            }
            let overflow = count - MAX_PAGE_SIZE;
            let group = meta.group.clone();

            let (prev, next) = neighbours(ctx, &group, &pid)?;
            if let Some((prev_id, prev_count)) = prev {
                if prev_count < MAX_PAGE_SIZE {
                    let n = overflow.min(MAX_PAGE_SIZE - prev_count);
                    shift_head_to_prev(ctx, &pid, &prev_id, n)?;
                    continue;
                }
            }
            if let Some((next_id, next_count)) = next {
                if next_count < MAX_PAGE_SIZE {
                    let n = overflow.min(MAX_PAGE_SIZE - next_count);
                    shift_tail_to_next(ctx, &pid, &next_id, n)?;
                    continue;
                }
            }
            let n = overflow.min(MAX_PAGE_SIZE);
            split_into_new_page(ctx, &pid, n)?;
        }
    }
    Ok(())
}

type Neighbour = Option<(PageId, usize)>;

fn neighbours(ctx: &WriteCtx<'_>, group: &str, pid: &PageId) -> Result<(Neighbour, Neighbour)> {
    let pages = ctx.state.index.pages(group).ok_or_else(|| {
        StrataError::internal(format!("group '{group}' vanished during rebalance"))
    })?;
    let pos = pages.iter().position(|m| &m.id == pid).ok_or_else(|| {
        StrataError::internal(format!("page {pid} vanished during rebalance"))
    })?;
    let prev = pos
        .checked_sub(1)
        .and_then(|i| pages.get(i))
        .map(|m| (m.id.clone(), m.count));
    let next = pages.get(pos + 1).map(|m| (m.id.clone(), m.count));
    Ok((prev, next))
}

fn shift_head_to_prev(
    ctx: &mut WriteCtx<'_>,
    from: &PageId,
    prev: &PageId,
    n: usize,
) -> Result<()> {
    debug!(from = %from, to = %prev, rows = n, "rebalance: head into previous page");
    ctx.page_mut(from)?;
    ctx.page_mut(prev)?;
    let state = &mut *ctx.state;
    let rows = page_of(state, from)?.take_head(n);
    for row in &rows {
        state.dirty_mappings.insert(row.clone(), Some(prev.clone()));
    }
    page_of(state, prev)?.append(rows);
    adjust_count(state, from, -(isize::try_from(n).unwrap_or(isize::MAX)))?;
    adjust_count(state, prev, isize::try_from(n).unwrap_or(isize::MAX))?;
    mark_dirty(state, from);
    mark_dirty(state, prev);
    Ok(())
}

fn shift_tail_to_next(
    ctx: &mut WriteCtx<'_>,
    from: &PageId,
    next: &PageId,
    n: usize,
) -> Result<()> {
    debug!(from = %from, to = %next, rows = n, "rebalance: tail into next page");
    ctx.page_mut(from)?;
    ctx.page_mut(next)?;
    let state = &mut *ctx.state;
    let rows = page_of(state, from)?.take_tail(n);
    for row in &rows {
        state.dirty_mappings.insert(row.clone(), Some(next.clone()));
    }
    page_of(state, next)?.prepend(rows);
    adjust_count(state, from, -(isize::try_from(n).unwrap_or(isize::MAX)))?;
    adjust_count(state, next, isize::try_from(n).unwrap_or(isize::MAX))?;
    mark_dirty(state, from);
    mark_dirty(state, next);
    Ok(())
}

fn split_into_new_page(ctx: &mut WriteCtx<'_>, from: &PageId, n: usize) -> Result<()> {
    ctx.page_mut(from)?;
    let new_id = new_page_id();
    debug!(from = %from, to = %new_id, rows = n, "rebalance: split into new page");
    let state = &mut *ctx.state;
    let rows = page_of(state, from)?.take_tail(n);
    for row in &rows {
        state.dirty_mappings.insert(row.clone(), Some(new_id.clone()));
    }
    let group = state
        .index
        .group_of(from)
        .map(str::to_owned)
        .ok_or_else(|| StrataError::internal(format!("page {from} has no group")))?;
    let meta = PageMeta {
        id: new_id.clone(),
        group,
        prev: Some(from.clone()),
        next: None,
        count: n,
    };
    let displaced = state.index.insert_after(from, meta).ok_or_else(|| {
        StrataError::internal(format!("page {from} left the index mid-split"))
    })?;
    state.pages.insert(new_id.clone(), Page::from_rows(rows));
    state.dirty_pages.insert(new_id.clone());
    state.dirty_metas.insert(new_id);
    if let Some(successor) = displaced {
        state.dirty_metas.insert(successor);
    }
    adjust_count(state, from, -(isize::try_from(n).unwrap_or(isize::MAX)))?;
    mark_dirty(state, from);
    Ok(())
}

// ---------------------------------------------------------------------------
// Pass B: drop empty pages
// ---------------------------------------------------------------------------

fn drop_empty(ctx: &mut WriteCtx<'_>) -> Result<()> {
    let mut empties: Vec<PageId> = ctx
        .state
        .dirty_metas
        .iter()
        .filter(|pid| !ctx.state.deleted_pages.contains(*pid))
        .filter(|pid| ctx.state.index.meta(pid).is_some_and(|m| m.count == 0))
        .cloned()
        .collect();
    empties.sort_by_key(|pid| {
        (
            ctx.state.index.group_of(pid).map(str::to_owned),
            ctx.state.index.page_offset(pid),
        )
    });

    for pid in empties {
        let Some((removed, relinked)) = ctx.state.index.remove_page(&pid) else {
            continue;
        };
        debug!(page = %pid, group = %removed.group, "rebalance: dropping empty page");
        ctx.store.delete_page(ctx.sql, &pid)?;
        let state = &mut *ctx.state;
        state.deleted_pages.insert(pid.clone());
        state.pages.remove(&pid);
        state.dirty_pages.remove(&pid);
        state.dirty_metas.remove(&pid);
        if let Some(successor) = relinked {
            state.dirty_metas.insert(successor);
        }
        if state.index.remove_group_if_empty(&removed.group) {
            state.log.delete_group(&removed.group);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Small helpers over the raw overlay
// ---------------------------------------------------------------------------

fn page_of<'a>(
    state: &'a mut crate::writer::WriterState,
    id: &PageId,
) -> Result<&'a mut Page> {
    state
        .pages
        .get_mut(id)
        .ok_or_else(|| StrataError::internal(format!("page {id} not resident during rebalance")))
}

fn adjust_count(
    state: &mut crate::writer::WriterState,
    id: &PageId,
    delta: isize,
) -> Result<()> {
    let meta = state
        .index
        .meta_mut(id)
        .ok_or_else(|| StrataError::internal(format!("page {id} has no descriptor")))?;
    meta.count = meta.count.saturating_add_signed(delta);
    Ok(())
}

fn mark_dirty(state: &mut crate::writer::WriterState, id: &PageId) {
    state.dirty_pages.insert(id.clone());
    state.dirty_metas.insert(id.clone());
}
