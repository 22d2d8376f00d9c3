//! Compare sinking and tuple flattening.
//!
//! A COMPARE whose operands all come from one TUPLE (or one MERGE) commutes
//! with it: selection distributes over projection and union. Sinking moves
//! the compare toward the sources, where CSE and constant propagation see
//! more structure. Identity TUPLEs left behind are flattened away unless a
//! MERGE or INSERT materializes through them.

use tracing::trace;

use crate::query::{ColumnId, Query, ViewId, ViewKind};

/// Sink COMPAREs through TUPLE and MERGE views. Returns the rewrite count.
pub fn sink_compares(query: &mut Query) -> usize {
    let mut rewrites = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        if sink_one(query, id) {
            rewrites += 1;
        }
    }
    rewrites
}

fn sink_one(query: &mut Query, id: ViewId) -> bool {
    let view = query.view(id);
    let ViewKind::Compare {
        op,
        lhs,
        rhs,
        attached,
    } = view.kind()
    else {
        return false;
    };
    if !view.positive_conditions().is_empty() || !view.negative_conditions().is_empty() {
        return false;
    }
    let (op, lhs, rhs, attached) = (*op, *lhs, *rhs, attached.clone());

    // Every operand must come from the same predecessor, and that
    // predecessor must have no other consumer.
    let source = query.column(lhs).defining_view();
    let mut all_inputs = vec![lhs, rhs];
    all_inputs.extend(attached.iter().copied());
    if all_inputs
        .iter()
        .any(|&c| query.column(c).defining_view() != source)
    {
        return false;
    }
    let sv = query.view(source);
    if !sv.uses.is_empty()
        || !sv.positive_conditions().is_empty()
        || !sv.negative_conditions().is_empty()
        || sv.sets_condition().is_some()
    {
        return false;
    }
    let only_consumer = sv
        .columns()
        .iter()
        .all(|&c| query.column(c).uses.iter().all(|u| u.user == id));
    if !only_consumer {
        return false;
    }

    enum SourceShape {
        Tuple(Vec<ColumnId>),
        Merge(Vec<ViewId>),
        Other,
    }
    let shape = match sv.kind() {
        ViewKind::Tuple { inputs } => SourceShape::Tuple(inputs.clone()),
        ViewKind::Merge { inputs } => SourceShape::Merge(inputs.clone()),
        _ => SourceShape::Other,
    };

    match shape {
        SourceShape::Tuple(inputs) => {
            let map_col = |q: &Query, c: ColumnId| inputs[q.column(c).index()];
            let new_lhs = map_col(query, lhs);
            let new_rhs = map_col(query, rhs);
            let new_attached: Vec<ColumnId> =
                attached.iter().map(|&c| map_col(query, c)).collect();
            let compare = query.compare(op, new_lhs, new_rhs, new_attached);
            let ccols = query.view(compare).columns().to_vec();
            let tuple = query.tuple(ccols);
            trace!(compare = query.view(compare).uid(), "compare sunk through tuple");
            query.replace_view(id, tuple);
            query.destroy_view(id);
            true
        }
        SourceShape::Merge(inputs) => {
            if inputs.is_empty() || inputs.contains(&source) || inputs.contains(&id) {
                return false;
            }
            let specs: Vec<(crate::ast::TypeKind, Option<String>)> = query
                .view(id)
                .columns()
                .iter()
                .map(|&c| {
                    (
                        query.column(c).ty(),
                        query.column(c).variable_name().map(str::to_string),
                    )
                })
                .collect();
            let mut new_inputs = Vec::with_capacity(inputs.len());
            for input in inputs {
                let in_cols = query.view(input).columns().to_vec();
                let map_col = |q: &Query, c: ColumnId| in_cols[q.column(c).index()];
                let new_lhs = map_col(query, lhs);
                let new_rhs = map_col(query, rhs);
                let new_attached: Vec<ColumnId> =
                    attached.iter().map(|&c| map_col(query, c)).collect();
                new_inputs.push(query.compare(op, new_lhs, new_rhs, new_attached));
            }
            let merge = query.merge(&specs);
            for input in new_inputs {
                query.add_merge_input(merge, input);
            }
            trace!(merge = query.view(merge).uid(), "compare sunk through merge");
            query.replace_view(id, merge);
            query.destroy_view(id);
            true
        }
        SourceShape::Other => false,
    }
}

/// Remove TUPLEs whose inputs are exactly their source's outputs in order,
/// unless a MERGE reads them wholesale or an INSERT reads their columns.
pub fn flatten_tuples(query: &mut Query) -> usize {
    let mut rewrites = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        if flatten_one(query, id) {
            rewrites += 1;
        }
    }
    rewrites
}

fn flatten_one(query: &mut Query, id: ViewId) -> bool {
    let view = query.view(id);
    let ViewKind::Tuple { inputs } = view.kind() else {
        return false;
    };
    if !view.positive_conditions().is_empty()
        || !view.negative_conditions().is_empty()
        || view.sets_condition().is_some()
    {
        return false;
    }
    if inputs.is_empty() {
        return false;
    }
    let source = query.column(inputs[0]).defining_view();
    if source == id {
        return false;
    }
    let identity = query.view(source).columns() == &inputs[..];
    if !identity {
        return false;
    }

    // Materialization points pin the tuple in place.
    let wholesale_merge = view
        .uses
        .iter()
        .any(|u| query.view(u.user).kind().is_merge());
    let feeds_insert = view.columns().iter().any(|&c| {
        query
            .column(c)
            .uses
            .iter()
            .any(|u| query.view(u.user).kind().is_insert())
    });
    if wholesale_merge || feeds_insert {
        return false;
    }

    trace!(tuple = view.uid(), "identity tuple flattened");
    query.replace_view(id, source);
    query.destroy_view(id);
    true
}
