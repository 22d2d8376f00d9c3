//! # Induction analysis
//!
//! Finds the strongly connected components of the view graph, checks that
//! every cycle is mediated by a MERGE, groups the co-recursive MERGEs into
//! induction groups, and stratifies the groups so the generated control flow
//! knows which fixpoint loops to run and in what order.
//!
//! Strata count group boundaries, not raw graph depth: a view's stratum is
//! the maximum over its predecessors, plus one where the edge leaves an
//! induction group. Two groups that land on the same stratum are independent
//! and may run their fixpoints in parallel.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{CompileError, ErrorLog};
use crate::query::{InductionSets, Query, ViewId};

/// Annotate `query` with induction groups, strata, and inductive
/// predecessor/successor sets. Returns false if recursion is broken in a way
/// the backend cannot schedule; the error log holds the fatal diagnostic.
pub fn analyze(query: &mut Query, log: &mut ErrorLog) -> bool {
    let mark = log.mark();
    query.clear_induction();

    let views = query.view_ids();
    let sccs = strongly_connected_components(query, &views);

    // scc index per view, in the reverse-topological order Tarjan pops.
    let mut scc_of: HashMap<ViewId, usize> = HashMap::new();
    for (i, scc) in sccs.iter().enumerate() {
        for &v in scc {
            scc_of.insert(v, i);
        }
    }

    // Non-trivial SCCs must contain a merge and become induction groups,
    // numbered in topological order.
    let mut group_of_scc: HashMap<usize, u32> = HashMap::new();
    let mut next_group = 0u32;
    for i in (0..sccs.len()).rev() {
        let scc = &sccs[i];
        let non_trivial =
            scc.len() > 1 || scc.iter().any(|&v| query.predecessors(v).contains(&v));
        if !non_trivial {
            continue;
        }
        let merges: Vec<ViewId> = scc
            .iter()
            .copied()
            .filter(|&v| query.view(v).kind().is_merge())
            .collect();
        if merges.is_empty() {
            log.fatal(
                CompileError::CycleWithoutMerge {
                    name: describe(query, scc[0]),
                },
                "induction analysis",
            );
            continue;
        }
        group_of_scc.insert(i, next_group);
        next_group += 1;
    }
    if log.fatal_since(mark) {
        return false;
    }

    // Per-member inductive and non-inductive neighbor sets.
    for (&scc_index, &group) in &group_of_scc {
        let scc = &sccs[scc_index];
        let mut has_entry = false;
        for &v in scc {
            let mut sets = InductionSets::default();
            for pred in query.predecessors(v) {
                if scc_of.get(&pred) == Some(&scc_index) {
                    sets.inductive_predecessors.push(pred);
                } else {
                    sets.noninductive_predecessors.push(pred);
                    has_entry = true;
                }
            }
            for succ in query.successors(v) {
                if scc_of.get(&succ) == Some(&scc_index) {
                    sets.inductive_successors.push(succ);
                } else {
                    sets.noninductive_successors.push(succ);
                }
            }
            if query.view(v).kind().is_merge() {
                sets.own_indirect_successor = reaches_itself(query, v, group, &scc_of, scc_index);
                if !consistent_inductive_inputs(query, v, &sets.inductive_predecessors) {
                    log.fatal(
                        CompileError::InconsistentInductiveInputs {
                            name: describe(query, v),
                        },
                        "induction analysis",
                    );
                }
            }
            query.set_induction_group(v, group, sets);
        }
        if !has_entry {
            log.fatal(CompileError::NoGroupEntry { group }, "induction analysis");
        }
    }
    if log.fatal_since(mark) {
        return false;
    }

    // Stratify in topological order over the condensation.
    let mut scc_stratum: Vec<usize> = vec![0; sccs.len()];
    for i in (0..sccs.len()).rev() {
        let mut stratum = 0;
        for &v in &sccs[i] {
            for pred in query.predecessors(v) {
                let p = scc_of[&pred];
                if p == i {
                    continue;
                }
                let crossing = usize::from(group_of_scc.contains_key(&p));
                stratum = stratum.max(scc_stratum[p] + crossing);
            }
        }
        scc_stratum[i] = stratum;
        for &v in &sccs[i] {
            query.set_stratum(v, stratum);
        }
    }

    debug!(
        groups = next_group,
        strata = scc_stratum.iter().max().map(|s| s + 1).unwrap_or(0),
        "induction analysis finished"
    );
    !log.fatal_since(mark)
}

/// Tarjan's algorithm, iterative. Components pop in reverse topological
/// order of the condensation.
fn strongly_connected_components(query: &Query, views: &[ViewId]) -> Vec<Vec<ViewId>> {
    #[derive(Default, Clone)]
    struct NodeState {
        index: Option<usize>,
        lowlink: usize,
        on_stack: bool,
    }

    let mut state: HashMap<ViewId, NodeState> = views
        .iter()
        .map(|&v| (v, NodeState::default()))
        .collect();
    let mut next_index = 0usize;
    let mut stack: Vec<ViewId> = Vec::new();
    let mut sccs: Vec<Vec<ViewId>> = Vec::new();

    // Explicit DFS frames: (view, successor list, next successor position).
    let mut frames: Vec<(ViewId, Vec<ViewId>, usize)> = Vec::new();

    for &root in views {
        if state[&root].index.is_some() {
            continue;
        }
        push_node(query, root, &mut state, &mut next_index, &mut stack, &mut frames);

        while let Some(frame_top) = frames.last().map(|f| f.0) {
            let (succ_opt, exhausted) = {
                let Some(top) = frames.last_mut() else { break };
                if top.2 < top.1.len() {
                    let s = top.1[top.2];
                    top.2 += 1;
                    (Some(s), false)
                } else {
                    (None, true)
                }
            };

            if exhausted {
                frames.pop();
                // Fold our lowlink into the parent and pop a finished root.
                let node_state = state[&frame_top].clone();
                if let Some(parent) = frames.last().map(|f| f.0) {
                    let low = node_state.lowlink.min(state[&parent].lowlink);
                    if let Some(p) = state.get_mut(&parent) {
                        p.lowlink = low;
                    }
                }
                if node_state.index == Some(node_state.lowlink) {
                    let mut scc = Vec::new();
                    while let Some(v) = stack.pop() {
                        if let Some(s) = state.get_mut(&v) {
                            s.on_stack = false;
                        }
                        scc.push(v);
                        if v == frame_top {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
                continue;
            }

            let Some(succ) = succ_opt else { break };
            match state[&succ].index {
                None => {
                    push_node(query, succ, &mut state, &mut next_index, &mut stack, &mut frames);
                }
                Some(succ_index) => {
                    if state[&succ].on_stack {
                        let low = state[&frame_top].lowlink.min(succ_index);
                        if let Some(s) = state.get_mut(&frame_top) {
                            s.lowlink = low;
                        }
                    }
                }
            }
        }
    }

    fn push_node(
        query: &Query,
        v: ViewId,
        state: &mut HashMap<ViewId, NodeState>,
        next_index: &mut usize,
        stack: &mut Vec<ViewId>,
        frames: &mut Vec<(ViewId, Vec<ViewId>, usize)>,
    ) {
        let s = state.entry(v).or_default();
        s.index = Some(*next_index);
        s.lowlink = *next_index;
        s.on_stack = true;
        *next_index += 1;
        stack.push(v);
        frames.push((v, query.successors(v), 0));
    }

    sccs
}

/// Whether `merge` can reach itself without first crossing another MERGE of
/// the same group.
fn reaches_itself(
    query: &Query,
    merge: ViewId,
    _group: u32,
    scc_of: &HashMap<ViewId, usize>,
    scc_index: usize,
) -> bool {
    let mut visited = std::collections::HashSet::new();
    let mut stack: Vec<ViewId> = query.successors(merge);
    while let Some(v) = stack.pop() {
        if v == merge {
            return true;
        }
        if !visited.insert(v) {
            continue;
        }
        // Stop at other merges of the same group; their fixpoint mediates.
        if query.view(v).kind().is_merge() && scc_of.get(&v) == Some(&scc_index) {
            continue;
        }
        stack.extend(query.successors(v));
    }
    false
}

/// Inductive inputs of a merge must agree with its shape position-wise.
fn consistent_inductive_inputs(query: &Query, merge: ViewId, preds: &[ViewId]) -> bool {
    let mv = query.view(merge);
    preds.iter().all(|&p| {
        let pv = query.view(p);
        pv.arity() == mv.arity()
            && pv
                .columns()
                .iter()
                .zip(mv.columns().iter())
                .all(|(a, b)| query.column(*a).ty() == query.column(*b).ty())
    })
}

fn describe(query: &Query, v: ViewId) -> String {
    let view = query.view(v);
    match view
        .columns()
        .iter()
        .find_map(|&c| query.column(c).variable_name().map(str::to_string))
    {
        Some(var) => format!("{}<{}> ({var})", view.kind().kind_name(), view.uid()),
        None => format!("{}<{}>", view.kind().kind_name(), view.uid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeKind;
    use crate::query::ViewKind;

    /// select -> tuple_base -> merge <-> (join-ish tuple_step) -> insert
    fn recursive_query() -> (Query, ViewId) {
        let mut query = Query::new();
        let rel = query.add_relation("reach", vec![TypeKind::U32, TypeKind::U32]);
        let stream = query.add_stream("edge", vec![TypeKind::U32, TypeKind::U32], false);
        let select = query.select_stream(stream);
        let scols = query.view(select).columns().to_vec();
        let base = query.tuple(scols);

        let merge = query.merge(&[(TypeKind::U32, None), (TypeKind::U32, None)]);
        let mcols = query.view(merge).columns().to_vec();
        let step = query.tuple(mcols);
        query.add_merge_input(merge, base);
        query.add_merge_input(merge, step);

        let mcols = query.view(merge).columns().to_vec();
        let out = query.tuple(mcols);
        let ocols = query.view(out).columns().to_vec();
        let _insert = query.insert_relation(rel, ocols);
        (query, merge)
    }

    #[test]
    fn test_single_group_detected() {
        let (mut query, merge) = recursive_query();
        let mut log = ErrorLog::new();
        assert!(analyze(&mut query, &mut log));
        assert!(!log.has_errors());

        let mv = query.view(merge);
        assert_eq!(mv.induction_group(), Some(0));
        assert_eq!(mv.stratum(), Some(0));
        let sets = mv.induction().unwrap();
        assert_eq!(sets.inductive_predecessors.len(), 1);
        assert_eq!(sets.noninductive_predecessors.len(), 1);
        assert!(sets.own_indirect_successor);
    }

    #[test]
    fn test_views_outside_group_unannotated() {
        let (mut query, merge) = recursive_query();
        let mut log = ErrorLog::new();
        assert!(analyze(&mut query, &mut log));

        for (id, view) in query.views() {
            if view.induction_group().is_some() {
                continue;
            }
            assert!(view.induction().is_none());
            assert!(view.stratum().is_some());
            let _ = id;
        }
        // Downstream of the group sits one stratum above it.
        let (_, insert) = query
            .views()
            .find(|(_, v)| v.kind().is_insert())
            .unwrap();
        assert_eq!(insert.stratum(), Some(1));
        let _ = merge;
    }

    #[test]
    fn test_acyclic_graph_has_no_groups() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(cols);
        let tcols = query.view(tuple).columns().to_vec();
        let _insert = query.insert_relation(rel, tcols);

        let mut log = ErrorLog::new();
        assert!(analyze(&mut query, &mut log));
        assert!(query.views().all(|(_, v)| v.induction_group().is_none()));
        assert!(query.views().all(|(_, v)| v.stratum() == Some(0)));
    }

    #[test]
    fn test_two_groups_stratified() {
        // Group 0 feeds a negate which feeds group 1.
        let mut query = Query::new();
        let stream = query.add_stream("in", vec![TypeKind::U32], false);
        let rel = query.add_relation("out", vec![TypeKind::U32]);

        let select = query.select_stream(stream);
        let scols = query.view(select).columns().to_vec();
        let base0 = query.tuple(scols);

        let m0 = query.merge(&[(TypeKind::U32, None)]);
        let m0c = query.view(m0).columns().to_vec();
        let step0 = query.tuple(m0c.clone());
        query.add_merge_input(m0, base0);
        query.add_merge_input(m0, step0);

        let negate = query.negate(vec![m0c[0]], vec![], m0, false);
        let ncols = query.view(negate).columns().to_vec();
        let base1 = query.tuple(ncols);

        let m1 = query.merge(&[(TypeKind::U32, None)]);
        let m1c = query.view(m1).columns().to_vec();
        let step1 = query.tuple(m1c.clone());
        query.add_merge_input(m1, base1);
        query.add_merge_input(m1, step1);

        let out = query.tuple(m1c);
        let ocols = query.view(out).columns().to_vec();
        let _insert = query.insert_relation(rel, ocols);

        let mut log = ErrorLog::new();
        assert!(analyze(&mut query, &mut log));

        let g0 = query.view(m0).induction_group().unwrap();
        let g1 = query.view(m1).induction_group().unwrap();
        assert_ne!(g0, g1);
        // Group ids are contiguous from zero.
        assert!(g0 < 2 && g1 < 2);
        assert_eq!(query.view(m0).stratum(), Some(0));
        assert_eq!(query.view(m1).stratum(), Some(1));
    }

    #[test]
    fn test_group_numbering_matches_scc_membership() {
        let (mut query, merge) = recursive_query();
        let mut log = ErrorLog::new();
        assert!(analyze(&mut query, &mut log));

        // Every view in the merge's SCC shares its group id.
        let group = query.view(merge).induction_group();
        let step = match query.view(merge).kind() {
            ViewKind::Merge { inputs } => inputs[1],
            _ => unreachable!(),
        };
        assert_eq!(query.view(step).induction_group(), group);
    }
}
