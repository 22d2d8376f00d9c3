//! # Dataflow optimizer
//!
//! A bounded set of rewrites run round-robin to a fixpoint:
//!
//! - Canonicalization: sort JOIN and MERGE inputs by structural hash, dedupe
//!   MERGE inputs, collapse single-input MERGEs.
//! - Constant propagation: a JOIN pivot forced to a constant by an equality
//!   ancestor is demoted and the constant pushed through.
//! - Common subexpression elimination: hash-keyed, `replace_view` based.
//! - Compare sinking through TUPLE and MERGE; identity-TUPLE flattening.
//! - Dead column elimination with cascade.
//! - Condition hoisting over MERGE; never-hint propagation on NEGATEs.
//! - Unused-view sweep.
//!
//! Every rewrite reseats uses through the Query's def-use API; nothing swaps
//! raw ids behind the use lists' back. The fixpoint witness is the global
//! timestamp counter: a full round that draws no timestamp is done.

mod consts;
mod cse;
mod dead;
mod hints;
mod sink;

use tracing::{debug, warn};

use crate::error::ErrorLog;
use crate::query::{Query, ViewKind};

pub use cse::structurally_equal;

/// Fixpoint driver over the rewrite passes.
pub struct Optimizer {
    max_rounds: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer { max_rounds: 64 }
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(max_rounds: usize) -> Self {
        Optimizer { max_rounds }
    }

    /// Optimize to a fixpoint. Returns false if a fatal diagnostic was
    /// appended (never-hint contradiction).
    pub fn run(&self, query: &mut Query, log: &mut ErrorLog) -> bool {
        let mark = log.mark();
        for round in 0..self.max_rounds {
            let before = query.current_timestamp();

            let mut rewrites = 0;
            rewrites += canonicalize(query);
            rewrites += consts::propagate_constants(query);
            rewrites += cse::eliminate_common_subexpressions(query);
            rewrites += sink::sink_compares(query);
            rewrites += sink::flatten_tuples(query);
            rewrites += dead::eliminate_dead_columns(query);
            rewrites += hints::hoist_conditions(query);
            rewrites += hints::propagate_never_hints(query, log);
            rewrites += query.sweep();

            debug_assert!(
                query.check_invariants().is_ok(),
                "invariants broken after round {round}: {:?}",
                query.check_invariants()
            );
            debug!(round, rewrites, "optimizer round");

            if log.fatal_since(mark) {
                break;
            }
            if rewrites == 0 && query.current_timestamp() == before {
                break;
            }
            if round + 1 == self.max_rounds {
                warn!(
                    rounds = self.max_rounds,
                    "optimizer hit its round limit before reaching a fixpoint"
                );
            }
        }
        !log.fatal_since(mark)
    }
}

/// Sort JOIN and MERGE inputs into hash order, dedupe MERGE inputs, and
/// collapse MERGEs left with a single input.
fn canonicalize(query: &mut Query) -> usize {
    let mut rewrites = 0;
    let hashes = query.view_hashes();

    enum Plan {
        MergeInputs(Vec<crate::query::ViewId>),
        JoinOrder(Vec<usize>),
    }

    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        let plan = match query.view(id).kind() {
            ViewKind::Merge { inputs } => {
                let mut new_inputs = inputs.clone();
                new_inputs
                    .sort_by_key(|v| (hashes.get(v).copied().unwrap_or(0), query.view(*v).uid()));
                new_inputs.dedup();
                (new_inputs != *inputs).then_some(Plan::MergeInputs(new_inputs))
            }
            ViewKind::Join { joined, .. } => {
                let mut order: Vec<usize> = (0..joined.len()).collect();
                order.sort_by_key(|&i| {
                    (
                        hashes.get(&joined[i]).copied().unwrap_or(0),
                        query.view(joined[i]).uid(),
                        i,
                    )
                });
                order
                    .iter()
                    .enumerate()
                    .any(|(pos, &i)| pos != i)
                    .then_some(Plan::JoinOrder(order))
            }
            _ => None,
        };
        match plan {
            Some(Plan::MergeInputs(inputs)) => {
                query.set_merge_inputs(id, inputs);
                rewrites += 1;
            }
            Some(Plan::JoinOrder(order)) => {
                query.reorder_join(id, &order);
                rewrites += 1;
            }
            None => {}
        }
    }

    // Collapse single-input merges in a second scan so the dedup above is
    // already visible.
    for id in query.view_ids() {
        if !query.contains_view(id) {
            continue;
        }
        let view = query.view(id);
        if !view.kind().is_merge()
            || !view.positive_conditions().is_empty()
            || !view.negative_conditions().is_empty()
            || view.sets_condition().is_some()
        {
            continue;
        }
        let single = match view.kind() {
            ViewKind::Merge { inputs } if inputs.len() == 1 => Some(inputs[0]),
            _ => None,
        };
        if let Some(input) = single {
            if input == id {
                continue;
            }
            query.replace_view(id, input);
            query.destroy_view(id);
            rewrites += 1;
        }
    }

    rewrites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeKind;

    #[test]
    fn test_single_input_merge_collapsed() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let scols = query.view(select).columns().to_vec();
        let tuple = query.tuple(scols);
        let merge = query.merge(&[(TypeKind::U32, None)]);
        query.add_merge_input(merge, tuple);
        let mcols = query.view(merge).columns().to_vec();
        let insert = query.insert_relation(rel, mcols);

        let rewrites = canonicalize(&mut query);
        assert_eq!(rewrites, 1);
        assert!(!query.contains_view(merge));
        // The insert now reads the tuple directly.
        assert_eq!(query.predecessors(insert), vec![tuple]);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_inputs_deduped() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let scols = query.view(select).columns().to_vec();
        let tuple = query.tuple(scols);
        let merge = query.merge(&[(TypeKind::U32, None)]);
        query.add_merge_input(merge, tuple);
        query.add_merge_input(merge, tuple);
        let mcols = query.view(merge).columns().to_vec();
        let _insert = query.insert_relation(rel, mcols);

        // Dedup leaves one input, then the collapse pass removes the merge.
        let rewrites = canonicalize(&mut query);
        assert!(rewrites >= 1);
        assert!(!query.contains_view(merge));
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_optimizer_idempotent_on_fixed_graph() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32, TypeKind::U32]);
        let select = query.select_relation(rel);
        let scols = query.view(select).columns().to_vec();
        let tuple = query.tuple(scols);
        let tcols = query.view(tuple).columns().to_vec();
        let _insert = query.insert_relation(rel, tcols);

        let mut log = ErrorLog::new();
        let optimizer = Optimizer::new();
        assert!(optimizer.run(&mut query, &mut log));
        let after_first: Vec<u64> = {
            let mut h: Vec<u64> = query.view_hashes().values().copied().collect();
            h.sort_unstable();
            h
        };
        assert!(optimizer.run(&mut query, &mut log));
        let after_second: Vec<u64> = {
            let mut h: Vec<u64> = query.view_hashes().values().copied().collect();
            h.sort_unstable();
            h
        };
        assert_eq!(after_first, after_second);
    }
}
