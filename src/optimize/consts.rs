//! Constant propagation through JOIN pivots.
//!
//! A pivot set whose member is the merged output of an equality against a
//! constant carries no information: every surviving tuple holds the constant
//! in that position. The set is demoted to a plain passthrough, the other
//! members are pinned to the constant upstream, and the join's arity drops
//! by one pivot.

use std::collections::HashMap;

use tracing::trace;

use crate::ast::ComparisonOp;
use crate::query::{ColumnId, Query, ViewId, ViewKind};

pub fn propagate_constants(query: &mut Query) -> usize {
    let mut rewrites = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        if propagate_one(query, id) {
            rewrites += 1;
        }
    }
    rewrites
}

fn propagate_one(query: &mut Query, id: ViewId) -> bool {
    let view = query.view(id);
    let ViewKind::Join {
        joined,
        pivots,
        outputs,
    } = view.kind()
    else {
        return false;
    };
    // Keep the transform simple and safe: at least one pivot must remain, no
    // wholesale consumers (merge inputs are positional), no self-joins, no
    // condition attachments.
    if pivots.len() < 2
        || !view.uses.is_empty()
        || !view.positive_conditions().is_empty()
        || !view.negative_conditions().is_empty()
        || view.sets_condition().is_some()
    {
        return false;
    }
    {
        let mut sorted = joined.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != joined.len() {
            return false;
        }
    }
    let (joined, pivots, outputs) = (joined.clone(), pivots.clone(), outputs.clone());

    // Find a pivot set with a constant-forced member.
    let mut target: Option<(usize, ColumnId)> = None;
    'sets: for (s, set) in pivots.iter().enumerate() {
        for &member in set {
            if let Some(konst) = forced_constant(query, member) {
                target = Some((s, konst));
                break 'sets;
            }
        }
    }
    let Some((s, konst)) = target else {
        return false;
    };

    trace!(join = query.view(id).uid(), pivot = s, "constant pivot demoted");

    // Pin every member of the doomed set that is not already forced, by
    // interposing an equality against the constant between its view and the
    // join. col_map tracks where each referenced column of a pinned view
    // lives afterwards.
    let mut col_map: HashMap<ColumnId, ColumnId> = HashMap::new();
    let mut new_joined = joined.clone();
    for (j, &member) in pivots[s].iter().enumerate() {
        if forced_constant(query, member).is_some() {
            continue;
        }
        let source = joined[j];
        // Everything of this view the join reads, minus the pinned member.
        let mut attached: Vec<ColumnId> = Vec::new();
        for (t, set) in pivots.iter().enumerate() {
            if t != s && set[j] != member && !attached.contains(&set[j]) {
                attached.push(set[j]);
            }
        }
        for &out in &outputs {
            if query.column(out).defining_view() == source
                && out != member
                && !attached.contains(&out)
            {
                attached.push(out);
            }
        }
        let pin = query.compare(ComparisonOp::Eq, member, konst, attached.clone());
        let pin_cols = query.view(pin).columns().to_vec();
        col_map.insert(member, pin_cols[0]);
        for (i, &a) in attached.iter().enumerate() {
            col_map.insert(a, pin_cols[1 + i]);
        }
        new_joined[j] = pin;
    }

    let remap = |col: ColumnId, map: &HashMap<ColumnId, ColumnId>| -> ColumnId {
        map.get(&col).copied().unwrap_or(col)
    };

    // Rebuild the join without set `s`; its value survives as one non-pivot
    // output at the tail.
    let new_pivots: Vec<Vec<ColumnId>> = pivots
        .iter()
        .enumerate()
        .filter(|(t, _)| *t != s)
        .map(|(_, set)| set.iter().map(|&c| remap(c, &col_map)).collect())
        .collect();
    let mut new_outputs: Vec<ColumnId> = outputs.iter().map(|&c| remap(c, &col_map)).collect();
    let representative = remap(pivots[s][0], &col_map);
    new_outputs.push(representative);

    let new_join = query.join(new_joined, new_pivots, new_outputs);
    let new_cols = query.view(new_join).columns().to_vec();
    let old_cols = query.view(id).columns().to_vec();
    let npiv = pivots.len();

    // Old output column -> new output column.
    for (t, &old) in old_cols.iter().enumerate() {
        let new = if t < npiv {
            match t.cmp(&s) {
                std::cmp::Ordering::Less => new_cols[t],
                std::cmp::Ordering::Equal => new_cols[new_cols.len() - 1],
                std::cmp::Ordering::Greater => new_cols[t - 1],
            }
        } else {
            new_cols[t - 1]
        };
        query.replace_all_column_uses(old, new);
    }
    query.destroy_view(id);
    true
}

/// The constant column a compare-equality forces, if `col` is the merged
/// output of `x = constant`.
fn forced_constant(query: &Query, col: ColumnId) -> Option<ColumnId> {
    let column = query.column(col);
    if column.index() != 0 {
        return None;
    }
    let def = query.view(column.defining_view());
    let ViewKind::Compare {
        op: ComparisonOp::Eq,
        lhs,
        rhs,
        ..
    } = def.kind()
    else {
        return None;
    };
    for &side in [lhs, rhs].into_iter() {
        if query
            .view(query.column(side).defining_view())
            .kind()
            .is_constant_select()
        {
            return Some(side);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, TypeKind};

    #[test]
    fn test_constant_pivot_demoted() {
        let mut query = Query::new();
        let left = query.add_relation("l", vec![TypeKind::U64, TypeKind::U64]);
        let right = query.add_relation("r", vec![TypeKind::U64, TypeKind::U64]);
        let out = query.add_relation("o", vec![TypeKind::U64, TypeKind::U64]);

        let sl = query.select_relation(left);
        let sr = query.select_relation(right);
        let lc = query.view(sl).columns().to_vec();
        let rc = query.view(sr).columns().to_vec();

        // Left side is filtered to l.1 = 7, and the join pivots on both
        // (l.0 = r.0) and (l.1 = r.1). The second pivot carries a constant.
        let konst = query.constant_column(&Literal::typed_unsigned(TypeKind::U64, 7));
        let pin = query.compare(ComparisonOp::Eq, lc[1], konst, vec![lc[0]]);
        let pc = query.view(pin).columns().to_vec();
        // pin outputs: [l.1 (pinned), l.0]
        let join = query.join(
            vec![pin, sr],
            vec![vec![pc[1], rc[0]], vec![pc[0], rc[1]]],
            vec![],
        );
        let jc = query.view(join).columns().to_vec();
        let tuple = query.tuple(vec![jc[0], jc[1]]);
        let tcols = query.view(tuple).columns().to_vec();
        let _insert = query.insert_relation(out, tcols);

        let rewrites = propagate_constants(&mut query);
        assert_eq!(rewrites, 1);
        assert!(!query.contains_view(join));
        query.sweep();

        let (_, new_join) = query.views().find(|(_, v)| v.kind().is_join()).unwrap();
        match new_join.kind() {
            ViewKind::Join { pivots, .. } => assert_eq!(pivots.len(), 1),
            _ => unreachable!(),
        }
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_sole_pivot_not_demoted() {
        let mut query = Query::new();
        let left = query.add_relation("l", vec![TypeKind::U64]);
        let right = query.add_relation("r", vec![TypeKind::U64]);
        let out = query.add_relation("o", vec![TypeKind::U64]);

        let sl = query.select_relation(left);
        let sr = query.select_relation(right);
        let lc = query.view(sl).columns().to_vec();
        let rc = query.view(sr).columns().to_vec();
        let konst = query.constant_column(&Literal::typed_unsigned(TypeKind::U64, 7));
        let pin = query.compare(ComparisonOp::Eq, lc[0], konst, vec![]);
        let pc = query.view(pin).columns().to_vec();
        let join = query.join(vec![pin, sr], vec![vec![pc[0], rc[0]]], vec![]);
        let jc = query.view(join).columns().to_vec();
        let tuple = query.tuple(jc);
        let tcols = query.view(tuple).columns().to_vec();
        let _insert = query.insert_relation(out, tcols);

        assert_eq!(propagate_constants(&mut query), 0);
        assert!(query.contains_view(join));
    }
}
