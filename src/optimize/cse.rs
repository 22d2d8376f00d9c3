//! Common subexpression elimination.
//!
//! Views are bucketed by structural hash; equal views collapse into the
//! oldest one via `replace_view`, and the loser is destroyed. Condition
//! setters never participate: merging two setters would change which views a
//! condition observes.

use std::collections::HashMap;

use tracing::trace;

use crate::query::{Query, ViewId, ViewKind};

/// Run CSE to a local fixpoint: merging two views can make their consumers
/// equal, so the pass loops until nothing collapses.
pub fn eliminate_common_subexpressions(query: &mut Query) -> usize {
    let mut total = 0;
    loop {
        let collapsed = one_round(query);
        if collapsed == 0 {
            return total;
        }
        total += collapsed;
    }
}

fn one_round(query: &mut Query) -> usize {
    let hashes = query.view_hashes();
    let mut buckets: HashMap<u64, Vec<ViewId>> = HashMap::new();
    for (id, _) in query.views() {
        buckets.entry(hashes[&id]).or_default().push(id);
    }

    let mut collapsed = 0;
    for bucket in buckets.into_values() {
        if bucket.len() < 2 {
            continue;
        }
        // Keep the oldest view of every structurally-equal cluster.
        let mut ordered = bucket;
        ordered.sort_by_key(|&id| query.view(id).uid());
        for i in 0..ordered.len() {
            let keep = ordered[i];
            if !query.contains_view(keep) {
                continue;
            }
            for j in (i + 1)..ordered.len() {
                let dup = ordered[j];
                if !query.contains_view(dup) || dup == keep {
                    continue;
                }
                if !structurally_equal(query, keep, dup) {
                    continue;
                }
                trace!(
                    keep = query.view(keep).uid(),
                    dup = query.view(dup).uid(),
                    "cse collapse"
                );
                query.replace_view(dup, keep);
                query.destroy_view(dup);
                collapsed += 1;
            }
        }
    }
    collapsed
}

/// Structural equality: same kind, same resolved inputs, same attributes,
/// same condition attachments. Views that set a condition are never equal to
/// anything.
pub fn structurally_equal(query: &Query, a: ViewId, b: ViewId) -> bool {
    let va = query.view(a);
    let vb = query.view(b);
    if va.sets_condition().is_some() || vb.sets_condition().is_some() {
        return false;
    }
    if va.arity() != vb.arity()
        || va.positive_conditions() != vb.positive_conditions()
        || va.negative_conditions() != vb.negative_conditions()
    {
        return false;
    }
    match (va.kind(), vb.kind()) {
        (ViewKind::Select { source: sa }, ViewKind::Select { source: sb }) => sa == sb,
        (ViewKind::Tuple { inputs: ia }, ViewKind::Tuple { inputs: ib }) => ia == ib,
        (
            ViewKind::KvIndex {
                keys: ka,
                values: va_,
                merge_functors: fa,
            },
            ViewKind::KvIndex {
                keys: kb,
                values: vb_,
                merge_functors: fb,
            },
        ) => ka == kb && va_ == vb_ && fa == fb,
        (
            ViewKind::Join {
                joined: ja,
                pivots: pa,
                outputs: oa,
            },
            ViewKind::Join {
                joined: jb,
                pivots: pb,
                outputs: ob,
            },
        ) => ja == jb && pa == pb && oa == ob,
        (
            ViewKind::Map {
                functor: fa,
                range: ra,
                negated: na,
                inputs: ia,
                attached: aa,
            },
            ViewKind::Map {
                functor: fb,
                range: rb,
                negated: nb,
                inputs: ib,
                attached: ab,
            },
        ) => fa == fb && ra == rb && na == nb && ia == ib && aa == ab,
        (
            ViewKind::Aggregate {
                functor: fa,
                group: ga,
                config: ca,
                aggregated: aa,
            },
            ViewKind::Aggregate {
                functor: fb,
                group: gb,
                config: cb,
                aggregated: ab,
            },
        ) => fa == fb && ga == gb && ca == cb && aa == ab,
        (ViewKind::Merge { inputs: ia }, ViewKind::Merge { inputs: ib }) => {
            // Canonicalization sorts merge inputs, so equality is
            // order-insensitive up to that pass having run.
            let mut sa = ia.clone();
            let mut sb = ib.clone();
            sa.sort_unstable();
            sb.sort_unstable();
            sa == sb
        }
        (
            ViewKind::Negate {
                checked: ca,
                attached: aa,
                negated: na,
                never: ha,
            },
            ViewKind::Negate {
                checked: cb,
                attached: ab,
                negated: nb,
                never: hb,
            },
        ) => ca == cb && aa == ab && na == nb && ha == hb,
        (
            ViewKind::Compare {
                op: opa,
                lhs: la,
                rhs: ra,
                attached: aa,
            },
            ViewKind::Compare {
                op: opb,
                lhs: lb,
                rhs: rb,
                attached: ab,
            },
        ) => opa == opb && la == lb && ra == rb && aa == ab,
        (
            ViewKind::Insert {
                target: ta,
                inputs: ia,
            },
            ViewKind::Insert {
                target: tb,
                inputs: ib,
            },
        ) => ta == tb && ia == ib,
        _ => false,
    }
}
