//! View variants and their input-slot geometry.
//!
//! A view is one node of the dataflow graph: a computation and the set of
//! tuples it produces. Kind-specific data lives in [`ViewKind`]; the
//! surrounding [`View`](super::View) owns the output columns and bookkeeping
//! shared by all kinds.
//!
//! Input columns are addressed by a *flat slot index* with a fixed per-kind
//! order, so a use edge is just `(view, slot)`:
//!
//! - TUPLE: inputs
//! - KV-INDEX: keys, then values
//! - JOIN: pivot sets in order (each set in joined-view order), then
//!   non-pivot outputs
//! - MAP: functor inputs, then attached
//! - AGGREGATE: group, then config, then aggregated
//! - NEGATE: checked, then attached
//! - COMPARE: lhs, rhs, then attached
//! - INSERT: inputs
//!
//! SELECT and MERGE have no column slots. MERGE, JOIN, and NEGATE
//! additionally hold view-level uses of their incoming/negated views.

use crate::ast::{ComparisonOp, FunctorRange, Literal};

use super::{ColumnId, RelationId, StreamId, ViewId};

/// Where a SELECT draws tuples from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A persistent relation.
    Relation(RelationId),
    /// The receive side of an IO stream.
    Stream(StreamId),
    /// A compile-time literal; produces exactly one tuple.
    Literal(Literal),
    /// A 16-bit constant invented by the compiler.
    Tag(u16),
}

impl Source {
    pub fn is_constant(&self) -> bool {
        matches!(self, Source::Literal(_) | Source::Tag(_))
    }
}

/// Where an INSERT writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkTarget {
    Relation(RelationId),
    Stream(StreamId),
}

/// The role an input column plays in its view, as reported to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputColumnRole {
    Copied,
    Negated,
    JoinPivot,
    JoinNonPivot,
    CompareLhs,
    CompareRhs,
    IndexKey,
    IndexValue,
    FunctorInput,
    AggregateConfig,
    AggregateGroup,
    AggregatedColumn,
    MergedColumn,
    Materialized,
    Published,
}

impl InputColumnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputColumnRole::Copied => "copied",
            InputColumnRole::Negated => "negated",
            InputColumnRole::JoinPivot => "join-pivot",
            InputColumnRole::JoinNonPivot => "join-non-pivot",
            InputColumnRole::CompareLhs => "compare-lhs",
            InputColumnRole::CompareRhs => "compare-rhs",
            InputColumnRole::IndexKey => "index-key",
            InputColumnRole::IndexValue => "index-value",
            InputColumnRole::FunctorInput => "functor-input",
            InputColumnRole::AggregateConfig => "aggregate-config",
            InputColumnRole::AggregateGroup => "aggregate-group",
            InputColumnRole::AggregatedColumn => "aggregated-column",
            InputColumnRole::MergedColumn => "merged-column",
            InputColumnRole::Materialized => "materialized",
            InputColumnRole::Published => "published",
        }
    }
}

/// Kind-specific payload of a view.
#[derive(Debug, Clone)]
pub enum ViewKind {
    /// Reads tuples from a relation, stream, or constant. No input columns.
    Select { source: Source },

    /// Passes inputs through unchanged; glue and forced materialization.
    Tuple { inputs: Vec<ColumnId> },

    /// Stateful key-to-value mapping with one merge functor per value column.
    KvIndex {
        keys: Vec<ColumnId>,
        values: Vec<ColumnId>,
        merge_functors: Vec<String>,
    },

    /// Natural join over `joined` on `pivots`. Pivot set `i` holds one column
    /// per joined view, positionally aligned with `joined`. Outputs are the
    /// pivots followed by the non-pivot passthroughs in `outputs`. A join
    /// with no pivots is a cross-product and is only built for clauses
    /// annotated to permit one.
    Join {
        joined: Vec<ViewId>,
        pivots: Vec<Vec<ColumnId>>,
        outputs: Vec<ColumnId>,
    },

    /// Applies `functor` to the bound `inputs`, producing the functor's free
    /// outputs followed by copies of `attached`. A negated map passes its
    /// attached columns through iff the functor produces nothing.
    Map {
        functor: String,
        range: FunctorRange,
        negated: bool,
        inputs: Vec<ColumnId>,
        attached: Vec<ColumnId>,
    },

    /// Partitions by `group`, conditions on `config`, folds `aggregated`
    /// through `functor`; outputs are group, config, then summaries.
    Aggregate {
        functor: String,
        group: Vec<ColumnId>,
        config: Vec<ColumnId>,
        aggregated: Vec<ColumnId>,
    },

    /// Union of same-shaped inputs; the only view through which recursion
    /// may flow.
    Merge { inputs: Vec<ViewId> },

    /// Passes `checked` and `attached` through iff no tuple matching
    /// `checked` exists in `negated`. `never` asserts that a tuple which
    /// passes is never retracted by a change in the negated source.
    Negate {
        checked: Vec<ColumnId>,
        attached: Vec<ColumnId>,
        negated: ViewId,
        never: bool,
    },

    /// Binary comparison. Equality merges both operands into one output
    /// column; other operators keep both, followed by `attached` copies.
    Compare {
        op: ComparisonOp,
        lhs: ColumnId,
        rhs: ColumnId,
        attached: Vec<ColumnId>,
    },

    /// Terminal sink into a relation or message stream. No output columns.
    Insert {
        target: SinkTarget,
        inputs: Vec<ColumnId>,
    },
}

impl ViewKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ViewKind::Select { .. } => "SELECT",
            ViewKind::Tuple { .. } => "TUPLE",
            ViewKind::KvIndex { .. } => "KVINDEX",
            ViewKind::Join { .. } => "JOIN",
            ViewKind::Map { .. } => "MAP",
            ViewKind::Aggregate { .. } => "AGGREGATE",
            ViewKind::Merge { .. } => "MERGE",
            ViewKind::Negate { .. } => "NEGATE",
            ViewKind::Compare { .. } => "COMPARE",
            ViewKind::Insert { .. } => "INSERT",
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, ViewKind::Select { .. })
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, ViewKind::Tuple { .. })
    }

    pub fn is_join(&self) -> bool {
        matches!(self, ViewKind::Join { .. })
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, ViewKind::Merge { .. })
    }

    pub fn is_negate(&self) -> bool {
        matches!(self, ViewKind::Negate { .. })
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, ViewKind::Insert { .. })
    }

    pub fn is_constant_select(&self) -> bool {
        matches!(self, ViewKind::Select { source } if source.is_constant())
    }

    /// Input columns in flat slot order.
    pub fn column_slots(&self) -> Vec<ColumnId> {
        match self {
            ViewKind::Select { .. } | ViewKind::Merge { .. } => Vec::new(),
            ViewKind::Tuple { inputs } => inputs.clone(),
            ViewKind::KvIndex { keys, values, .. } => {
                keys.iter().chain(values.iter()).copied().collect()
            }
            ViewKind::Join {
                pivots, outputs, ..
            } => pivots
                .iter()
                .flatten()
                .chain(outputs.iter())
                .copied()
                .collect(),
            ViewKind::Map {
                inputs, attached, ..
            } => inputs.iter().chain(attached.iter()).copied().collect(),
            ViewKind::Aggregate {
                group,
                config,
                aggregated,
                ..
            } => group
                .iter()
                .chain(config.iter())
                .chain(aggregated.iter())
                .copied()
                .collect(),
            ViewKind::Negate {
                checked, attached, ..
            } => checked.iter().chain(attached.iter()).copied().collect(),
            ViewKind::Compare {
                lhs, rhs, attached, ..
            } => std::iter::once(*lhs)
                .chain(std::iter::once(*rhs))
                .chain(attached.iter().copied())
                .collect(),
            ViewKind::Insert { inputs, .. } => inputs.clone(),
        }
    }

    /// Rewrite the input column at `slot`.
    pub(crate) fn set_slot(&mut self, slot: usize, col: ColumnId) {
        let mut slots: Vec<&mut ColumnId> = match self {
            ViewKind::Select { .. } | ViewKind::Merge { .. } => Vec::new(),
            ViewKind::Tuple { inputs } => inputs.iter_mut().collect(),
            ViewKind::KvIndex { keys, values, .. } => {
                keys.iter_mut().chain(values.iter_mut()).collect()
            }
            ViewKind::Join {
                pivots, outputs, ..
            } => pivots
                .iter_mut()
                .flat_map(|set| set.iter_mut())
                .chain(outputs.iter_mut())
                .collect(),
            ViewKind::Map {
                inputs, attached, ..
            } => inputs.iter_mut().chain(attached.iter_mut()).collect(),
            ViewKind::Aggregate {
                group,
                config,
                aggregated,
                ..
            } => group
                .iter_mut()
                .chain(config.iter_mut())
                .chain(aggregated.iter_mut())
                .collect(),
            ViewKind::Negate {
                checked, attached, ..
            } => checked.iter_mut().chain(attached.iter_mut()).collect(),
            ViewKind::Compare {
                lhs, rhs, attached, ..
            } => std::iter::once(lhs)
                .chain(std::iter::once(rhs))
                .chain(attached.iter_mut())
                .collect(),
            ViewKind::Insert { inputs, .. } => inputs.iter_mut().collect(),
        };
        *slots[slot] = col;
    }

    /// Views this view holds whole-view strong uses of: MERGE inputs, JOIN
    /// joined views, and a NEGATE's negated source, in slot order.
    pub fn view_targets(&self) -> Vec<ViewId> {
        match self {
            ViewKind::Merge { inputs } => inputs.clone(),
            ViewKind::Join { joined, .. } => joined.clone(),
            ViewKind::Negate { negated, .. } => vec![*negated],
            _ => Vec::new(),
        }
    }
}

/// Per-view annotations produced by induction analysis; present only on
/// views inside an induction group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InductionSets {
    pub inductive_predecessors: Vec<ViewId>,
    pub noninductive_predecessors: Vec<ViewId>,
    pub inductive_successors: Vec<ViewId>,
    pub noninductive_successors: Vec<ViewId>,
    /// MERGEs only: reachable from itself without first crossing another
    /// MERGE of the same group.
    pub own_indirect_successor: bool,
}
