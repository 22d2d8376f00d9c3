//! End-to-end compilation scenarios: module in, finished dataflow out.

use flowlog::ast::builders::{AtomBuilder, ClauseBuilder, DeclarationBuilder, ModuleBuilder};
use flowlog::ast::{Binding, DeclKind, FunctorRange, TypeKind};
use flowlog::query::ViewKind;
use flowlog::{compile, CompileError, CompileOptions, ErrorLog};

fn edge_decl() -> DeclarationBuilder {
    DeclarationBuilder::new("add_edge", DeclKind::Message)
        .param("A", TypeKind::U32)
        .param("B", TypeKind::U32)
}

fn reach_decl() -> DeclarationBuilder {
    DeclarationBuilder::new("reach", DeclKind::Local)
        .param("A", TypeKind::U32)
        .param("B", TypeKind::U32)
}

fn transitive_closure() -> flowlog::ast::Module {
    ModuleBuilder::new()
        .declare(edge_decl())
        .declare(reach_decl())
        .clause(
            ClauseBuilder::new("reach")
                .head_vars(["A", "B"])
                .body_atom("add_edge", ["A", "B"]),
        )
        .clause(
            ClauseBuilder::new("reach")
                .head_vars(["A", "C"])
                .body_atom("reach", ["A", "B"])
                .body_atom("add_edge", ["B", "C"]),
        )
        .build()
}

#[test]
fn test_transitive_closure() {
    let mut log = ErrorLog::new();
    let query = compile(&[transitive_closure()], &CompileOptions::default(), &mut log)
        .expect("compiles");
    assert!(!log.has_errors(), "{:?}", log.iter().collect::<Vec<_>>());
    query.check_invariants().unwrap();

    // One MERGE over the two clause tuples.
    assert_eq!(query.merges().count(), 1);
    let (merge_id, merge) = query.merges().next().unwrap();
    let inputs = match merge.kind() {
        ViewKind::Merge { inputs } => inputs.clone(),
        _ => unreachable!(),
    };
    assert_eq!(inputs.len(), 2);
    // One incoming tuple reads the edge stream, the other reads the join.
    let mut over_select = 0;
    let mut over_join = 0;
    for input in inputs {
        assert!(query.view(input).kind().is_tuple());
        for pred in query.predecessors(input) {
            match query.view(pred).kind() {
                ViewKind::Select { .. } => over_select += 1,
                ViewKind::Join { .. } => over_join += 1,
                _ => {}
            }
        }
    }
    assert_eq!(over_select, 1);
    assert_eq!(over_join, 1);

    // The join has exactly one two-member pivot set.
    assert_eq!(query.joins().count(), 1);
    let (_, join) = query.joins().next().unwrap();
    match join.kind() {
        ViewKind::Join { pivots, joined, .. } => {
            assert_eq!(pivots.len(), 1);
            assert_eq!(pivots[0].len(), 2);
            assert_eq!(joined.len(), 2);
            assert!(joined.contains(&merge_id));
        }
        _ => unreachable!(),
    }

    // One induction group at stratum zero.
    assert_eq!(merge.induction_group(), Some(0));
    assert_eq!(merge.stratum(), Some(0));

    // Two setter views on the reach relation.
    let (rel, _) = query.relations().find(|(_, r)| r.name() == "reach").unwrap();
    assert_eq!(query.relation_inserts(rel).count(), 2);
}

#[test]
fn test_stratified_negation() {
    let module = ModuleBuilder::new()
        .declare(edge_decl())
        .declare(reach_decl())
        .declare(DeclarationBuilder::new("sink", DeclKind::Local).param("A", TypeKind::U32))
        .clause(
            ClauseBuilder::new("reach")
                .head_vars(["A", "B"])
                .body_atom("add_edge", ["A", "B"]),
        )
        .clause(
            ClauseBuilder::new("reach")
                .head_vars(["A", "C"])
                .body_atom("reach", ["A", "B"])
                .body_atom("add_edge", ["B", "C"]),
        )
        .clause(
            ClauseBuilder::new("sink")
                .head_vars(["A"])
                .body_atom("reach", ["A", "B"])
                .negated_atom("reach", ["B", "A"]),
        )
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors(), "{:?}", log.iter().collect::<Vec<_>>());
    query.check_invariants().unwrap();

    // The negate checks two columns against reach's union.
    assert_eq!(query.negates().count(), 1);
    let (_, negate) = query.negates().next().unwrap();
    match negate.kind() {
        ViewKind::Negate {
            checked, negated, ..
        } => {
            assert_eq!(checked.len(), 2);
            assert!(query.view(*negated).kind().is_merge());
        }
        _ => unreachable!(),
    }

    // reach's union is group 0 at stratum 0; sink's insert runs above it.
    let (_, merge) = query.merges().next().unwrap();
    assert_eq!(merge.induction_group(), Some(0));
    assert_eq!(merge.stratum(), Some(0));

    let (sink_rel, _) = query.relations().find(|(_, r)| r.name() == "sink").unwrap();
    let sink_insert = query.relation_inserts(sink_rel).next().unwrap();
    assert_eq!(query.view(sink_insert).stratum(), Some(1));
}

#[test]
fn test_aggregation() {
    let module = ModuleBuilder::new()
        .declare(edge_decl())
        .declare(
            DeclarationBuilder::new("count_i", DeclKind::Functor)
                .param_with("X", TypeKind::U32, Binding::Aggregate)
                .param_with("N", TypeKind::U32, Binding::Summary)
                .range(FunctorRange::OneToOne)
                .pure(),
        )
        .declare(
            DeclarationBuilder::new("c_edges", DeclKind::Query).param_with(
                "N",
                TypeKind::U32,
                Binding::Free,
            ),
        )
        .clause(ClauseBuilder::new("c_edges").head_vars(["N"]).aggregate(
            "count_i",
            ["B", "N"],
            vec![AtomBuilder::new("add_edge").var("A").var("B").build()],
        ))
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors(), "{:?}", log.iter().collect::<Vec<_>>());
    query.check_invariants().unwrap();

    assert_eq!(query.aggregates().count(), 1);
    let (_, agg) = query.aggregates().next().unwrap();
    match agg.kind() {
        ViewKind::Aggregate {
            group,
            config,
            aggregated,
            functor,
        } => {
            assert_eq!(functor, "count_i");
            assert!(group.is_empty());
            assert!(config.is_empty());
            assert_eq!(aggregated.len(), 1);
        }
        _ => unreachable!(),
    }
    // group ∪ config ∪ summary = one summary column.
    assert_eq!(agg.arity(), 1);

    let (rel, _) = query
        .relations()
        .find(|(_, r)| r.name() == "c_edges")
        .unwrap();
    assert_eq!(query.relation_inserts(rel).count(), 1);
}

#[test]
fn test_cross_product_rejection_and_annotation() {
    let base = |annotated: bool| {
        let clause = ClauseBuilder::new("bad")
            .head_vars(["A", "B"])
            .body_atom("p", ["A"])
            .body_atom("q", ["B"]);
        let clause = if annotated { clause.allows_product() } else { clause };
        ModuleBuilder::new()
            .declare(DeclarationBuilder::new("p", DeclKind::Message).param("A", TypeKind::U32))
            .declare(DeclarationBuilder::new("q", DeclKind::Message).param("B", TypeKind::U32))
            .declare(
                DeclarationBuilder::new("bad", DeclKind::Local)
                    .param("A", TypeKind::U32)
                    .param("B", TypeKind::U32),
            )
            .clause(clause)
            .build()
    };

    // Unannotated: a diagnostic, and no INSERT.
    let mut log = ErrorLog::new();
    let query = compile(&[base(false)], &CompileOptions::default(), &mut log).expect("non-fatal");
    assert!(log
        .iter()
        .any(|d| matches!(d.error, CompileError::UnannotatedCrossProduct { .. })));
    assert_eq!(query.inserts().count(), 0);

    // Annotated: a pivot-free join.
    let mut log = ErrorLog::new();
    let query = compile(&[base(true)], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors());
    assert_eq!(query.joins().count(), 1);
    let (_, join) = query.joins().next().unwrap();
    match join.kind() {
        ViewKind::Join { pivots, .. } => assert!(pivots.is_empty()),
        _ => unreachable!(),
    }
    assert_eq!(query.inserts().count(), 1);
}

#[test]
fn test_cse_across_clauses() {
    let module = ModuleBuilder::new()
        .declare(DeclarationBuilder::new("p", DeclKind::Message).param("A", TypeKind::U32))
        .declare(DeclarationBuilder::new("q", DeclKind::Message).param("A", TypeKind::U32))
        .declare(DeclarationBuilder::new("x", DeclKind::Local).param("A", TypeKind::U32))
        .declare(DeclarationBuilder::new("y", DeclKind::Local).param("A", TypeKind::U32))
        .clause(
            ClauseBuilder::new("x")
                .head_vars(["A"])
                .body_atom("p", ["A"])
                .body_atom("q", ["A"]),
        )
        .clause(
            ClauseBuilder::new("y")
                .head_vars(["A"])
                .body_atom("p", ["A"])
                .body_atom("q", ["A"]),
        )
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors(), "{:?}", log.iter().collect::<Vec<_>>());
    query.check_invariants().unwrap();

    // Exactly one join survives, reachable from both inserts.
    assert_eq!(query.joins().count(), 1);
    let (join_id, _) = query.joins().next().unwrap();
    assert_eq!(query.inserts().count(), 2);
    for (insert, _) in query.inserts() {
        let mut reachable = false;
        let mut stack = query.predecessors(insert);
        let mut seen = std::collections::HashSet::new();
        while let Some(v) = stack.pop() {
            if !seen.insert(v) {
                continue;
            }
            if v == join_id {
                reachable = true;
                break;
            }
            stack.extend(query.predecessors(v));
        }
        assert!(reachable, "insert does not read the shared join");
    }
}

#[test]
fn test_never_hint_granted_over_additive_sources() {
    let module = ModuleBuilder::new()
        .declare(DeclarationBuilder::new("m", DeclKind::Message).param("X", TypeKind::U32))
        .declare(DeclarationBuilder::new("p", DeclKind::Local).param("X", TypeKind::U32))
        .declare(DeclarationBuilder::new("s", DeclKind::Local).param("X", TypeKind::U32))
        .clause(
            ClauseBuilder::new("p")
                .head_vars(["X"])
                .body_atom("m", ["X"]),
        )
        .clause(
            ClauseBuilder::new("s")
                .head_vars(["X"])
                .body_atom("m", ["X"])
                .negated_atom("p", ["X"]),
        )
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors(), "{:?}", log.iter().collect::<Vec<_>>());

    assert_eq!(query.negates().count(), 1);
    let (_, negate) = query.negates().next().unwrap();
    assert!(negate.has_never_hint());
}

#[test]
fn test_never_hint_withheld_over_differential_message() {
    let module = ModuleBuilder::new()
        .declare(
            DeclarationBuilder::new("m", DeclKind::Message)
                .param("X", TypeKind::U32)
                .differential(),
        )
        .declare(DeclarationBuilder::new("p", DeclKind::Local).param("X", TypeKind::U32))
        .declare(DeclarationBuilder::new("s", DeclKind::Local).param("X", TypeKind::U32))
        .clause(
            ClauseBuilder::new("p")
                .head_vars(["X"])
                .body_atom("m", ["X"]),
        )
        .clause(
            ClauseBuilder::new("s")
                .head_vars(["X"])
                .body_atom("m", ["X"])
                .negated_atom("p", ["X"]),
        )
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log).expect("compiles");
    assert!(!log.has_errors());

    let (_, negate) = query.negates().next().unwrap();
    assert!(!negate.has_never_hint());
}

#[test]
fn test_explicit_never_over_differential_is_fatal() {
    let module = ModuleBuilder::new()
        .declare(
            DeclarationBuilder::new("m", DeclKind::Message)
                .param("X", TypeKind::U32)
                .differential(),
        )
        .declare(DeclarationBuilder::new("p", DeclKind::Local).param("X", TypeKind::U32))
        .declare(DeclarationBuilder::new("s", DeclKind::Local).param("X", TypeKind::U32))
        .clause(
            ClauseBuilder::new("p")
                .head_vars(["X"])
                .body_atom("m", ["X"]),
        )
        .clause(
            ClauseBuilder::new("s")
                .head_vars(["X"])
                .body_atom("m", ["X"])
                .negated_never("p", ["X"]),
        )
        .build();

    let mut log = ErrorLog::new();
    let query = compile(&[module], &CompileOptions::default(), &mut log);
    assert!(query.is_none());
    assert!(log
        .iter()
        .any(|d| matches!(d.error, CompileError::NeverOverDifferential { .. })));
}
