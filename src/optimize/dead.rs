//! Dead column elimination.
//!
//! An output column nobody reads is dropped, along with the input slot that
//! fed it; the freed input may render an upstream column dead, so the pass
//! cascades until quiet. Only passthrough positions are droppable: TUPLE
//! columns, JOIN non-pivots, and the attached columns of MAP, COMPARE, and
//! NEGATE. Views read wholesale by a MERGE or NEGATE keep their shape, since
//! those consumers match columns positionally.

use tracing::trace;

use crate::query::{Query, ViewId, ViewKind};

pub fn eliminate_dead_columns(query: &mut Query) -> usize {
    let mut total = 0;
    loop {
        let dropped = one_round(query);
        if dropped == 0 {
            return total;
        }
        total += dropped;
    }
}

fn one_round(query: &mut Query) -> usize {
    let mut dropped = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        if has_positional_consumer(query, id) {
            continue;
        }
        let Some(keep) = droppable(query, id) else {
            continue;
        };
        let n = keep.iter().filter(|&&k| !k).count();
        if n == 0 {
            continue;
        }
        trace!(view = query.view(id).uid(), dropped = n, "dead columns");
        query.shrink_view_columns(id, &keep);
        dropped += n;
    }
    dropped
}

/// MERGE inputs and negated sources are consumed positionally; shrinking
/// them would shift what their consumers see.
fn has_positional_consumer(query: &Query, id: ViewId) -> bool {
    query.view(id).uses.iter().any(|u| {
        let kind = query.view(u.user).kind();
        kind.is_merge() || kind.is_negate()
    })
}

/// The keep mask for this view, or `None` when its shape is fixed. At least
/// one output always survives so the view still denotes a tuple set.
fn droppable(query: &Query, id: ViewId) -> Option<Vec<bool>> {
    let view = query.view(id);
    let arity = view.arity();
    let fixed = match view.kind() {
        ViewKind::Tuple { .. } => 0,
        ViewKind::Join { pivots, .. } => pivots.len(),
        ViewKind::Map { attached, .. } => arity - attached.len(),
        ViewKind::Compare { op, .. } => {
            if op.keeps_both() {
                2
            } else {
                1
            }
        }
        ViewKind::Negate { checked, .. } => checked.len(),
        _ => return None,
    };

    let mut keep: Vec<bool> = view
        .columns()
        .iter()
        .enumerate()
        .map(|(i, &col)| i < fixed || !query.column(col).is_unused())
        .collect();

    if keep.iter().all(|&k| !k) && !keep.is_empty() {
        keep[0] = true;
    }
    Some(keep)
}
