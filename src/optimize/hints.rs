//! Condition hoisting and never-hint propagation.

use std::collections::HashSet;

use tracing::trace;

use crate::error::{CompileError, ErrorLog};
use crate::query::{Query, Source, ViewId, ViewKind};

/// If every incoming view of a MERGE tests the same positive condition and
/// has no other consumer, the test moves onto the merge itself.
pub fn hoist_conditions(query: &mut Query) -> usize {
    let mut rewrites = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        let inputs = match query.view(id).kind() {
            ViewKind::Merge { inputs } if !inputs.is_empty() => inputs.clone(),
            _ => continue,
        };

        // Candidate conditions: positive conditions of the first input.
        let mut candidates = query.view(inputs[0]).positive_conditions().to_vec();
        candidates.retain(|cond| {
            inputs.iter().all(|&input| {
                let v = query.view(input);
                v.positive_conditions().contains(cond)
                    && exclusively_feeds(query, input, id)
            })
        });

        for cond in candidates {
            for &input in &inputs {
                query.remove_positive_condition(input, cond);
            }
            query.add_positive_condition(id, cond);
            trace!(merge = query.view(id).uid(), "condition hoisted over merge");
            rewrites += 1;
        }
    }
    rewrites
}

/// Whether `input`'s only consumer, wholesale and per-column, is `user`.
fn exclusively_feeds(query: &Query, input: ViewId, user: ViewId) -> bool {
    let v = query.view(input);
    v.uses.iter().all(|u| u.user == user)
        && v.columns()
            .iter()
            .all(|&c| query.column(c).uses.iter().all(|u| u.user == user))
}

/// Grant never-hints to NEGATEs whose negated source cannot retract: every
/// transitive source is a non-differential stream or a constant. An explicit
/// hint that contradicts a differential source is a fatal diagnostic.
pub fn propagate_never_hints(query: &mut Query, log: &mut ErrorLog) -> usize {
    let mut rewrites = 0;
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        let (negated, never) = match query.view(id).kind() {
            ViewKind::Negate { negated, never, .. } => (*negated, *never),
            _ => continue,
        };
        let differential = has_differential_source(query, negated);
        if differential && never {
            let name = negated_relation_name(query, id)
                .unwrap_or_else(|| format!("view {}", query.view(negated).uid()));
            log.fatal(CompileError::NeverOverDifferential { name }, "negation");
        } else if !differential && !never {
            query.set_never_hint(id, true);
            trace!(negate = query.view(id).uid(), "never hint granted");
            rewrites += 1;
        }
    }
    rewrites
}

/// Walk the strong predecessors of `start`. Differential streams can
/// retract; relation-backed selects are treated as retractable too, since
/// their writers are invisible to the view graph.
fn has_differential_source(query: &Query, start: ViewId) -> bool {
    let mut visited: HashSet<ViewId> = HashSet::new();
    let mut stack = vec![start];
    while let Some(v) = stack.pop() {
        if !visited.insert(v) {
            continue;
        }
        if let ViewKind::Select { source } = query.view(v).kind() {
            match source {
                Source::Stream(s) => {
                    if query.stream(*s).is_differential() {
                        return true;
                    }
                }
                Source::Relation(_) => return true,
                Source::Literal(_) | Source::Tag(_) => {}
            }
        }
        stack.extend(query.predecessors(v));
    }
    false
}

fn negated_relation_name(query: &Query, negate: ViewId) -> Option<String> {
    for (_, rel) in query.relations() {
        if rel.negations.contains(negate) {
            return Some(rel.name().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeKind;

    fn negate_over_stream(differential: bool) -> (Query, ViewId) {
        let mut query = Query::new();
        let stream = query.add_stream("m", vec![TypeKind::U32], differential);
        let out = query.add_relation("o", vec![TypeKind::U32]);
        let select = query.select_stream(stream);
        let scols = query.view(select).columns().to_vec();
        let merge = query.merge(&[(TypeKind::U32, None)]);
        let t = query.tuple(scols.clone());
        query.add_merge_input(merge, t);
        let negate = query.negate(vec![scols[0]], vec![], merge, false);
        let ncols = query.view(negate).columns().to_vec();
        let _insert = query.insert_relation(out, ncols);
        (query, negate)
    }

    #[test]
    fn test_never_hint_granted_for_non_differential() {
        let (mut query, negate) = negate_over_stream(false);
        let mut log = ErrorLog::new();
        let rewrites = propagate_never_hints(&mut query, &mut log);
        assert_eq!(rewrites, 1);
        assert!(query.view(negate).has_never_hint());
        assert!(!log.has_errors());
    }

    #[test]
    fn test_never_hint_withheld_for_differential() {
        let (mut query, negate) = negate_over_stream(true);
        let mut log = ErrorLog::new();
        let rewrites = propagate_never_hints(&mut query, &mut log);
        assert_eq!(rewrites, 0);
        assert!(!query.view(negate).has_never_hint());
        assert!(!log.has_errors());
    }

    #[test]
    fn test_explicit_never_over_differential_is_fatal() {
        let mut query = Query::new();
        let stream = query.add_stream("m", vec![TypeKind::U32], true);
        let out = query.add_relation("o", vec![TypeKind::U32]);
        let select = query.select_stream(stream);
        let scols = query.view(select).columns().to_vec();
        let merge = query.merge(&[(TypeKind::U32, None)]);
        let t = query.tuple(scols.clone());
        query.add_merge_input(merge, t);
        let negate = query.negate(vec![scols[0]], vec![], merge, true);
        let ncols = query.view(negate).columns().to_vec();
        let _insert = query.insert_relation(out, ncols);

        let mut log = ErrorLog::new();
        let mark = log.mark();
        let _ = propagate_never_hints(&mut query, &mut log);
        assert!(log.fatal_since(mark));
    }

    #[test]
    fn test_condition_hoisted_over_merge() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let out = query.add_relation("o", vec![TypeKind::U32]);
        let s1 = query.select_relation(rel);
        let s2 = query.select_relation(out);
        let c1 = query.view(s1).columns().to_vec();
        let c2 = query.view(s2).columns().to_vec();
        let t1 = query.tuple(c1);
        let t2 = query.tuple(c2);
        let cond = query.add_condition(Some("gate".to_string()));
        query.add_positive_condition(t1, cond);
        query.add_positive_condition(t2, cond);
        let merge = query.merge(&[(TypeKind::U32, None)]);
        query.add_merge_input(merge, t1);
        query.add_merge_input(merge, t2);
        let mcols = query.view(merge).columns().to_vec();
        let _insert = query.insert_relation(out, mcols);

        let rewrites = hoist_conditions(&mut query);
        assert_eq!(rewrites, 1);
        assert!(query.view(merge).positive_conditions().contains(&cond));
        assert!(query.view(t1).positive_conditions().is_empty());
        assert!(query.view(t2).positive_conditions().is_empty());
        query.check_invariants().unwrap();
    }
}
