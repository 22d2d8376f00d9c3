//! # Query IR
//!
//! The typed in-memory dataflow graph: views connected by column use-def
//! edges, plus the relations, IO streams, constants, and conditions they talk
//! to. One [`Query`] owns everything reachable from it; destroying the Query
//! destroys every view, column, and use.
//!
//! Structure:
//!
//! - every view owns its output [`Column`]s;
//! - every input-column slot holds a strong use of some other view's output
//!   column, recorded on that column's use list as a `(view, slot)` pair;
//! - MERGE inputs, JOIN inputs, and a NEGATE's negated source are whole-view
//!   strong uses recorded on the target view's use list;
//! - relation/stream/condition user lists are weak: they never keep a view
//!   alive and read as absent once the view is destroyed.
//!
//! All mutation goes through `Query` methods so the use lists, the timestamp
//! counter, and the invariants stay consistent. The graph is single-threaded
//! by construction.

mod view;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::ops::{Index, IndexMut};

use crate::ast::{ComparisonOp, FunctorRange, Literal, TypeKind};
use crate::defuse::{self, Arena, Id, Timeline, UseList, WeakList};

pub use view::{InductionSets, InputColumnRole, SinkTarget, Source, ViewKind};

pub type ViewId = Id<View>;
pub type ColumnId = Id<Column>;
pub type RelationId = Id<Relation>;
pub type StreamId = Id<IoStream>;
pub type ConditionId = Id<Condition>;

/// A column specification: semantic type plus the source variable it carries,
/// kept for diagnostics and debug output.
pub type ColumnSpec = (TypeKind, Option<String>);

// ============================================================================
// Entities
// ============================================================================

/// One output position of a view.
#[derive(Debug)]
pub struct Column {
    pub(crate) uid: u32,
    pub(crate) view: ViewId,
    pub(crate) index: usize,
    pub(crate) ty: TypeKind,
    pub(crate) var: Option<String>,
    pub(crate) color: Option<u16>,
    pub(crate) uses: UseList<ViewId>,
}

impl Column {
    /// Stable 32-bit id, unique within the Query.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn ty(&self) -> TypeKind {
        self.ty
    }

    /// Ordinal within the defining view's outputs.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn defining_view(&self) -> ViewId {
        self.view
    }

    /// The source variable this column carries, if any.
    pub fn variable_name(&self) -> Option<&str> {
        self.var.as_deref()
    }

    /// Debug color inherited from the defining view's `@highlight`.
    pub fn color(&self) -> Option<u16> {
        self.color
    }

    pub fn use_count(&self) -> usize {
        self.uses.len()
    }

    pub fn is_unused(&self) -> bool {
        self.uses.is_empty()
    }
}

/// A node in the dataflow graph.
#[derive(Debug)]
pub struct View {
    pub(crate) uid: u32,
    pub(crate) kind: ViewKind,
    pub(crate) columns: Vec<ColumnId>,
    pub(crate) positive_conditions: Vec<ConditionId>,
    pub(crate) negative_conditions: Vec<ConditionId>,
    pub(crate) sets_condition: Option<ConditionId>,
    pub(crate) color: Option<u16>,
    pub(crate) uses: UseList<ViewId>,
    pub(crate) last_change: u64,
    pub(crate) group: Option<u32>,
    pub(crate) stratum: Option<usize>,
    pub(crate) induction: Option<InductionSets>,
}

impl View {
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn kind(&self) -> &ViewKind {
        &self.kind
    }

    /// Output columns in ordinal order.
    pub fn columns(&self) -> &[ColumnId] {
        &self.columns
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn color(&self) -> Option<u16> {
        self.color
    }

    pub fn positive_conditions(&self) -> &[ConditionId] {
        &self.positive_conditions
    }

    pub fn negative_conditions(&self) -> &[ConditionId] {
        &self.negative_conditions
    }

    pub fn sets_condition(&self) -> Option<ConditionId> {
        self.sets_condition
    }

    /// Timestamp of the last mutation that touched this view.
    pub fn last_change(&self) -> u64 {
        self.last_change
    }

    /// Induction group id, if this view sits inside one.
    pub fn induction_group(&self) -> Option<u32> {
        self.group
    }

    /// Stratum depth assigned by induction analysis.
    pub fn stratum(&self) -> Option<usize> {
        self.stratum
    }

    pub fn induction(&self) -> Option<&InductionSets> {
        self.induction.as_ref()
    }

    /// NEGATEs only: whether the never-hint is set.
    pub fn has_never_hint(&self) -> bool {
        matches!(self.kind, ViewKind::Negate { never: true, .. })
    }

    /// Whether any other view reads this view, via columns or wholesale.
    pub fn is_used(&self) -> bool {
        !self.uses.is_empty()
    }
}

/// A named table backing one relation-backed declaration.
#[derive(Debug)]
pub struct Relation {
    pub(crate) uid: u32,
    pub(crate) name: String,
    pub(crate) column_types: Vec<TypeKind>,
    pub(crate) inserts: WeakList<View>,
    pub(crate) selects: WeakList<View>,
    pub(crate) negations: WeakList<View>,
}

impl Relation {
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_types(&self) -> &[TypeKind] {
        &self.column_types
    }

    pub fn arity(&self) -> usize {
        self.column_types.len()
    }
}

/// Message plumbing: receive behaves like SELECT, publish like INSERT, with
/// no persistent storage behind it.
#[derive(Debug)]
pub struct IoStream {
    pub(crate) uid: u32,
    pub(crate) name: String,
    pub(crate) column_types: Vec<TypeKind>,
    pub(crate) differential: bool,
    pub(crate) transmits: WeakList<View>,
    pub(crate) receives: WeakList<View>,
}

impl IoStream {
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_types(&self) -> &[TypeKind] {
        &self.column_types
    }

    /// Whether published tuples may later be retracted.
    pub fn is_differential(&self) -> bool {
        self.differential
    }
}

/// A zero-argument predicate used as a gate between otherwise unrelated
/// sub-graphs.
#[derive(Debug)]
pub struct Condition {
    pub(crate) uid: u32,
    pub(crate) name: Option<String>,
    pub(crate) setters: WeakList<View>,
    pub(crate) positive_users: WeakList<View>,
    pub(crate) negative_users: WeakList<View>,
}

impl Condition {
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// ============================================================================
// Arena indexing
// ============================================================================

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    fn index(&self, id: Id<T>) -> &T {
        match self.get(id) {
            Some(v) => v,
            None => panic!("dead id {id:?}"),
        }
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        match self.get_mut(id) {
            Some(v) => v,
            None => panic!("dead id {id:?}"),
        }
    }
}

// ============================================================================
// Query
// ============================================================================

/// Owner of one compiled dataflow.
#[derive(Default)]
pub struct Query {
    pub(crate) views: Arena<View>,
    pub(crate) columns: Arena<Column>,
    pub(crate) relations: Arena<Relation>,
    pub(crate) streams: Arena<IoStream>,
    pub(crate) conditions: Arena<Condition>,
    pub(crate) timeline: Timeline,
    next_view_uid: u32,
    next_column_uid: u32,
    next_entity_uid: u32,
    constant_cache: HashMap<Literal, ViewId>,
    next_tag: u16,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Entity accessors
    // ------------------------------------------------------------------

    pub fn view(&self, id: ViewId) -> &View {
        &self.views[id]
    }

    pub fn column(&self, id: ColumnId) -> &Column {
        &self.columns[id]
    }

    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.relations[id]
    }

    pub fn stream(&self, id: StreamId) -> &IoStream {
        &self.streams[id]
    }

    pub fn condition(&self, id: ConditionId) -> &Condition {
        &self.conditions[id]
    }

    pub fn contains_view(&self, id: ViewId) -> bool {
        self.views.contains(id)
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Live views in slot order.
    pub fn views(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views.iter()
    }

    /// Snapshot of live view ids, safe to hold across mutation.
    pub fn view_ids(&self) -> Vec<ViewId> {
        self.views.ids()
    }

    pub fn relations(&self) -> impl Iterator<Item = (RelationId, &Relation)> {
        self.relations.iter()
    }

    pub fn streams(&self) -> impl Iterator<Item = (StreamId, &IoStream)> {
        self.streams.iter()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (ConditionId, &Condition)> {
        self.conditions.iter()
    }

    pub fn current_timestamp(&self) -> u64 {
        self.timeline.now()
    }

    // ------------------------------------------------------------------
    // Entity creation
    // ------------------------------------------------------------------

    fn next_entity_uid(&mut self) -> u32 {
        let uid = self.next_entity_uid;
        self.next_entity_uid += 1;
        uid
    }

    pub fn add_relation(&mut self, name: impl Into<String>, column_types: Vec<TypeKind>) -> RelationId {
        let uid = self.next_entity_uid();
        self.relations.alloc(Relation {
            uid,
            name: name.into(),
            column_types,
            inserts: WeakList::new(),
            selects: WeakList::new(),
            negations: WeakList::new(),
        })
    }

    pub fn add_stream(
        &mut self,
        name: impl Into<String>,
        column_types: Vec<TypeKind>,
        differential: bool,
    ) -> StreamId {
        let uid = self.next_entity_uid();
        self.streams.alloc(IoStream {
            uid,
            name: name.into(),
            column_types,
            differential,
            transmits: WeakList::new(),
            receives: WeakList::new(),
        })
    }

    pub fn add_condition(&mut self, name: Option<String>) -> ConditionId {
        let uid = self.next_entity_uid();
        self.conditions.alloc(Condition {
            uid,
            name,
            setters: WeakList::new(),
            positive_users: WeakList::new(),
            negative_users: WeakList::new(),
        })
    }

    // ------------------------------------------------------------------
    // View creation
    // ------------------------------------------------------------------

    /// Allocate a view plus its output columns and wire up every strong use
    /// its kind implies.
    fn new_view(&mut self, kind: ViewKind, outputs: &[ColumnSpec]) -> ViewId {
        let ts = self.timeline.next();
        let uid = self.next_view_uid;
        self.next_view_uid += 1;
        let id = self.views.alloc(View {
            uid,
            kind,
            columns: Vec::with_capacity(outputs.len()),
            positive_conditions: Vec::new(),
            negative_conditions: Vec::new(),
            sets_condition: None,
            color: None,
            uses: UseList::new(),
            last_change: ts,
            group: None,
            stratum: None,
            induction: None,
        });
        for (index, (ty, var)) in outputs.iter().enumerate() {
            let col_uid = self.next_column_uid;
            self.next_column_uid += 1;
            let col = self.columns.alloc(Column {
                uid: col_uid,
                view: id,
                index,
                ty: *ty,
                var: var.clone(),
                color: None,
                uses: UseList::new(),
            });
            self.views[id].columns.push(col);
        }
        self.link_view(id);
        id
    }

    /// Add this view's outgoing uses to the use lists of what it reads.
    fn link_view(&mut self, id: ViewId) {
        let kind = &self.views[id].kind;
        let col_slots = kind.column_slots();
        let targets = kind.view_targets();
        for (slot, col) in col_slots.into_iter().enumerate() {
            self.columns[col].uses.add(id, slot);
        }
        for (slot, target) in targets.into_iter().enumerate() {
            self.views[target].uses.add(id, slot);
        }
    }

    /// Remove this view's outgoing uses from the use lists of what it reads.
    fn unlink_view(&mut self, id: ViewId) {
        let kind = &self.views[id].kind;
        let col_slots = kind.column_slots();
        let targets = kind.view_targets();
        for (slot, col) in col_slots.into_iter().enumerate() {
            if self.columns.contains(col) {
                self.columns[col].uses.erase(id, slot);
            }
        }
        for (slot, target) in targets.into_iter().enumerate() {
            if self.views.contains(target) {
                self.views[target].uses.erase(id, slot);
            }
        }
    }

    /// SELECT over a persistent relation.
    pub fn select_relation(&mut self, rel: RelationId) -> ViewId {
        let specs: Vec<ColumnSpec> = self.relations[rel]
            .column_types
            .iter()
            .map(|ty| (*ty, None))
            .collect();
        let id = self.new_view(
            ViewKind::Select {
                source: Source::Relation(rel),
            },
            &specs,
        );
        self.relations[rel].selects.add(id);
        id
    }

    /// SELECT over the receive side of a stream.
    pub fn select_stream(&mut self, stream: StreamId) -> ViewId {
        let specs: Vec<ColumnSpec> = self.streams[stream]
            .column_types
            .iter()
            .map(|ty| (*ty, None))
            .collect();
        let id = self.new_view(
            ViewKind::Select {
                source: Source::Stream(stream),
            },
            &specs,
        );
        self.streams[stream].receives.add(id);
        id
    }

    /// The single output column of a SELECT over a literal; cached so equal
    /// literals share one column.
    pub fn constant_column(&mut self, lit: &Literal) -> ColumnId {
        if let Some(&view) = self.constant_cache.get(lit) {
            return self.views[view].columns[0];
        }
        let view = self.new_view(
            ViewKind::Select {
                source: Source::Literal(lit.clone()),
            },
            &[(lit.ty, None)],
        );
        self.constant_cache.insert(lit.clone(), view);
        self.views[view].columns[0]
    }

    /// A fresh 16-bit tag constant. Tags are internal; users never see them.
    pub fn tag_column(&mut self) -> ColumnId {
        let tag = self.next_tag;
        self.next_tag += 1;
        let view = self.new_view(
            ViewKind::Select {
                source: Source::Tag(tag),
            },
            &[(TypeKind::U16, None)],
        );
        self.views[view].columns[0]
    }

    /// TUPLE forwarding `inputs` in order.
    pub fn tuple(&mut self, inputs: Vec<ColumnId>) -> ViewId {
        let specs: Vec<ColumnSpec> = inputs
            .iter()
            .map(|&c| (self.columns[c].ty, self.columns[c].var.clone()))
            .collect();
        self.new_view(ViewKind::Tuple { inputs }, &specs)
    }

    /// KV-INDEX mapping `keys` to `values` with one merge functor per value.
    pub fn kv_index(
        &mut self,
        keys: Vec<ColumnId>,
        values: Vec<ColumnId>,
        merge_functors: Vec<String>,
    ) -> ViewId {
        debug_assert_eq!(values.len(), merge_functors.len());
        let specs: Vec<ColumnSpec> = keys
            .iter()
            .chain(values.iter())
            .map(|&c| (self.columns[c].ty, self.columns[c].var.clone()))
            .collect();
        self.new_view(
            ViewKind::KvIndex {
                keys,
                values,
                merge_functors,
            },
            &specs,
        )
    }

    /// JOIN over `joined`. `pivots[i]` holds one column per joined view,
    /// positionally aligned with `joined`; `outputs` are the non-pivot
    /// passthroughs. Output columns are the pivots then the passthroughs.
    pub fn join(
        &mut self,
        joined: Vec<ViewId>,
        pivots: Vec<Vec<ColumnId>>,
        outputs: Vec<ColumnId>,
    ) -> ViewId {
        debug_assert!(pivots.iter().all(|set| set.len() == joined.len()));
        let mut specs: Vec<ColumnSpec> = pivots
            .iter()
            .map(|set| {
                let first = &self.columns[set[0]];
                (first.ty, first.var.clone())
            })
            .collect();
        specs.extend(
            outputs
                .iter()
                .map(|&c| (self.columns[c].ty, self.columns[c].var.clone())),
        );
        self.new_view(
            ViewKind::Join {
                joined,
                pivots,
                outputs,
            },
            &specs,
        )
    }

    /// MAP applying `functor` to `inputs`. Outputs are the functor's free
    /// parameters (per `free_outputs`) followed by copies of `attached`.
    pub fn map(
        &mut self,
        functor: impl Into<String>,
        range: FunctorRange,
        negated: bool,
        inputs: Vec<ColumnId>,
        free_outputs: &[ColumnSpec],
        attached: Vec<ColumnId>,
    ) -> ViewId {
        debug_assert!(!negated || free_outputs.is_empty());
        let mut specs: Vec<ColumnSpec> = free_outputs.to_vec();
        specs.extend(
            attached
                .iter()
                .map(|&c| (self.columns[c].ty, self.columns[c].var.clone())),
        );
        self.new_view(
            ViewKind::Map {
                functor: functor.into(),
                range,
                negated,
                inputs,
                attached,
            },
            &specs,
        )
    }

    /// AGGREGATE folding `aggregated` through `functor`, partitioned by
    /// `group` and conditioned on `config`. Outputs are group, config, then
    /// the summaries.
    pub fn aggregate(
        &mut self,
        functor: impl Into<String>,
        group: Vec<ColumnId>,
        config: Vec<ColumnId>,
        aggregated: Vec<ColumnId>,
        summaries: &[ColumnSpec],
    ) -> ViewId {
        let mut specs: Vec<ColumnSpec> = group
            .iter()
            .chain(config.iter())
            .map(|&c| (self.columns[c].ty, self.columns[c].var.clone()))
            .collect();
        specs.extend(summaries.iter().cloned());
        self.new_view(
            ViewKind::Aggregate {
                functor: functor.into(),
                group,
                config,
                aggregated,
            },
            &specs,
        )
    }

    /// MERGE with the given output shape and no inputs yet.
    pub fn merge(&mut self, outputs: &[ColumnSpec]) -> ViewId {
        self.new_view(ViewKind::Merge { inputs: Vec::new() }, outputs)
    }

    /// Append an incoming view to a MERGE. The input must match the merge's
    /// arity and per-position types.
    pub fn add_merge_input(&mut self, merge: ViewId, input: ViewId) {
        debug_assert_eq!(self.views[merge].arity(), self.views[input].arity());
        let ts = self.timeline.next();
        let slot = match &mut self.views[merge].kind {
            ViewKind::Merge { inputs } => {
                inputs.push(input);
                inputs.len() - 1
            }
            _ => {
                debug_assert!(false, "add_merge_input on a non-merge");
                return;
            }
        };
        self.views[merge].last_change = ts;
        self.views[input].uses.add(merge, slot);
    }

    /// Replace a MERGE's input list wholesale, rewiring the use lists.
    pub fn set_merge_inputs(&mut self, merge: ViewId, new_inputs: Vec<ViewId>) {
        let ts = self.timeline.next();
        let old_inputs = match &self.views[merge].kind {
            ViewKind::Merge { inputs } => inputs.clone(),
            _ => {
                debug_assert!(false, "set_merge_inputs on a non-merge");
                return;
            }
        };
        for (slot, input) in old_inputs.into_iter().enumerate() {
            self.views[input].uses.erase(merge, slot);
        }
        for (slot, &input) in new_inputs.iter().enumerate() {
            self.views[input].uses.add(merge, slot);
        }
        if let ViewKind::Merge { inputs } = &mut self.views[merge].kind {
            *inputs = new_inputs;
        }
        self.views[merge].last_change = ts;
    }

    /// Reorder a JOIN's input views, carrying each pivot set along.
    pub fn reorder_join(&mut self, join: ViewId, perm: &[usize]) {
        let ts = self.timeline.next();
        let (old_joined, old_pivots) = match &self.views[join].kind {
            ViewKind::Join { joined, pivots, .. } => (joined.clone(), pivots.clone()),
            _ => {
                debug_assert!(false, "reorder_join on a non-join");
                return;
            }
        };
        debug_assert_eq!(perm.len(), old_joined.len());
        self.unlink_view(join);
        let new_joined: Vec<ViewId> = perm.iter().map(|&i| old_joined[i]).collect();
        let new_pivots: Vec<Vec<ColumnId>> = old_pivots
            .iter()
            .map(|set| perm.iter().map(|&i| set[i]).collect())
            .collect();
        if let ViewKind::Join { joined, pivots, .. } = &mut self.views[join].kind {
            *joined = new_joined;
            *pivots = new_pivots;
        }
        self.link_view(join);
        self.views[join].last_change = ts;
    }

    /// NEGATE passing `checked` and `attached` through when `checked` has no
    /// witness in `negated`.
    pub fn negate(
        &mut self,
        checked: Vec<ColumnId>,
        attached: Vec<ColumnId>,
        negated: ViewId,
        never: bool,
    ) -> ViewId {
        debug_assert_eq!(checked.len(), self.views[negated].arity());
        let specs: Vec<ColumnSpec> = checked
            .iter()
            .chain(attached.iter())
            .map(|&c| (self.columns[c].ty, self.columns[c].var.clone()))
            .collect();
        self.new_view(
            ViewKind::Negate {
                checked,
                attached,
                negated,
                never,
            },
            &specs,
        )
    }

    /// Set or clear the never-hint on a NEGATE.
    pub fn set_never_hint(&mut self, view: ViewId, hint: bool) {
        let ts = self.timeline.next();
        if let ViewKind::Negate { never, .. } = &mut self.views[view].kind {
            *never = hint;
            self.views[view].last_change = ts;
        } else {
            debug_assert!(false, "set_never_hint on a non-negate");
        }
    }

    /// COMPARE over `lhs op rhs`. Equality outputs one merged column; the
    /// other operators output both operands. Attached columns follow.
    pub fn compare(
        &mut self,
        op: ComparisonOp,
        lhs: ColumnId,
        rhs: ColumnId,
        attached: Vec<ColumnId>,
    ) -> ViewId {
        let mut specs: Vec<ColumnSpec> = Vec::new();
        {
            let l = &self.columns[lhs];
            specs.push((l.ty, l.var.clone()));
        }
        if op.keeps_both() {
            let r = &self.columns[rhs];
            specs.push((r.ty, r.var.clone()));
        }
        specs.extend(
            attached
                .iter()
                .map(|&c| (self.columns[c].ty, self.columns[c].var.clone())),
        );
        self.new_view(
            ViewKind::Compare {
                op,
                lhs,
                rhs,
                attached,
            },
            &specs,
        )
    }

    /// INSERT into a relation.
    pub fn insert_relation(&mut self, rel: RelationId, inputs: Vec<ColumnId>) -> ViewId {
        debug_assert_eq!(inputs.len(), self.relations[rel].arity());
        let id = self.new_view(
            ViewKind::Insert {
                target: SinkTarget::Relation(rel),
                inputs,
            },
            &[],
        );
        self.relations[rel].inserts.add(id);
        id
    }

    /// INSERT publishing onto a stream.
    pub fn insert_stream(&mut self, stream: StreamId, inputs: Vec<ColumnId>) -> ViewId {
        debug_assert_eq!(inputs.len(), self.streams[stream].column_types.len());
        let id = self.new_view(
            ViewKind::Insert {
                target: SinkTarget::Stream(stream),
                inputs,
            },
            &[],
        );
        self.streams[stream].transmits.add(id);
        id
    }

    /// Record that `view` tests absence against `rel`.
    pub fn register_negation(&mut self, rel: RelationId, view: ViewId) {
        self.relations[rel].negations.add(view);
    }

    /// Set a view's debug color; its columns inherit it.
    pub fn set_view_color(&mut self, view: ViewId, color: u16) {
        self.views[view].color = Some(color);
        let cols = self.views[view].columns.clone();
        for col in cols {
            self.columns[col].color = Some(color);
        }
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    pub fn set_condition(&mut self, view: ViewId, cond: ConditionId) {
        let ts = self.timeline.next();
        self.views[view].sets_condition = Some(cond);
        self.views[view].last_change = ts;
        self.conditions[cond].setters.add(view);
    }

    pub fn add_positive_condition(&mut self, view: ViewId, cond: ConditionId) {
        let ts = self.timeline.next();
        if !self.views[view].positive_conditions.contains(&cond) {
            self.views[view].positive_conditions.push(cond);
            self.conditions[cond].positive_users.add(view);
        }
        self.views[view].last_change = ts;
    }

    pub fn add_negative_condition(&mut self, view: ViewId, cond: ConditionId) {
        let ts = self.timeline.next();
        if !self.views[view].negative_conditions.contains(&cond) {
            self.views[view].negative_conditions.push(cond);
            self.conditions[cond].negative_users.add(view);
        }
        self.views[view].last_change = ts;
    }

    pub fn remove_positive_condition(&mut self, view: ViewId, cond: ConditionId) {
        let ts = self.timeline.next();
        self.views[view].positive_conditions.retain(|&c| c != cond);
        self.conditions[cond].positive_users.remove(view);
        self.views[view].last_change = ts;
    }

    // ------------------------------------------------------------------
    // Slot access and rewrites
    // ------------------------------------------------------------------

    /// The input column occupying `slot` of `view`.
    pub fn input_column(&self, view: ViewId, slot: usize) -> ColumnId {
        self.views[view].kind.column_slots()[slot]
    }

    /// Reseat one input slot onto a different column, maintaining both use
    /// lists.
    pub fn set_input_column(&mut self, view: ViewId, slot: usize, col: ColumnId) {
        let old = self.views[view].kind.column_slots()[slot];
        if old == col {
            return;
        }
        let ts = self.timeline.next();
        self.columns[old].uses.erase(view, slot);
        self.views[view].kind.set_slot(slot, col);
        self.columns[col].uses.add(view, slot);
        self.views[view].last_change = ts;
    }

    /// Reseat every use of `old` onto `new`. Afterwards `old` has no uses and
    /// `new` has gained them in the order they were recorded. Each reseated
    /// user gets a fresh timestamp.
    pub fn replace_all_column_uses(&mut self, old: ColumnId, new: ColumnId) {
        self.replace_column_uses_where(old, new, |_| true);
    }

    /// Like [`Query::replace_all_column_uses`], but only reseats uses whose
    /// user satisfies `pred`.
    pub fn replace_column_uses_where(
        &mut self,
        old: ColumnId,
        new: ColumnId,
        mut pred: impl FnMut(ViewId) -> bool,
    ) {
        if old == new {
            return;
        }
        debug_assert_eq!(self.columns[old].ty, self.columns[new].ty);
        let Query {
            columns,
            views,
            timeline,
            ..
        } = self;
        let Some((old_col, new_col)) = columns.get2_mut(old, new) else {
            debug_assert!(false, "replacing uses of a dead column");
            return;
        };
        defuse::replace_uses_where(
            &mut old_col.uses,
            &mut new_col.uses,
            |user| pred(user),
            |u| {
                let ts = timeline.next();
                let user = &mut views[u.user];
                user.kind.set_slot(u.slot, new);
                user.last_change = ts;
            },
        );
    }

    /// Replace `old` with `new` everywhere: every output column of `old` is
    /// reseated onto the corresponding column of `new`, and whole-view uses
    /// (MERGE inputs, JOIN inputs, negated sources) are redirected. The two
    /// views must have the same shape.
    pub fn replace_view(&mut self, old: ViewId, new: ViewId) {
        if old == new {
            return;
        }
        debug_assert_eq!(self.views[old].arity(), self.views[new].arity());
        let pairs: Vec<(ColumnId, ColumnId)> = self.views[old]
            .columns
            .iter()
            .copied()
            .zip(self.views[new].columns.iter().copied())
            .collect();
        for (old_col, new_col) in pairs {
            self.replace_all_column_uses(old_col, new_col);
        }
        // Whole-view uses: rewrite each user's target slot in place.
        let Query {
            views, timeline, ..
        } = self;
        let Some((old_view, new_view)) = views.get2_mut(old, new) else {
            debug_assert!(false, "replacing a dead view");
            return;
        };
        let mut moved: Vec<(ViewId, usize)> = Vec::new();
        defuse::replace_all_uses_with(&mut old_view.uses, &mut new_view.uses, |u| {
            moved.push((u.user, u.slot));
        });
        for (user, slot) in moved {
            let ts = timeline.next();
            let user_view = &mut views[user];
            match &mut user_view.kind {
                ViewKind::Merge { inputs } => inputs[slot] = new,
                ViewKind::Join { joined, .. } => joined[slot] = new,
                ViewKind::Negate { negated, .. } => *negated = new,
                _ => debug_assert!(false, "unexpected whole-view user"),
            }
            user_view.last_change = ts;
        }
    }

    /// Destroy a view that nothing uses. Its outgoing uses are severed, its
    /// columns freed, and weak references to it go dead.
    pub fn destroy_view(&mut self, id: ViewId) {
        debug_assert!(!self.views[id].is_used(), "destroying a used view");
        debug_assert!(
            self.views[id]
                .columns
                .iter()
                .all(|&c| self.columns[c].uses.is_empty()),
            "destroying a view with used columns"
        );
        self.timeline.next();
        self.unlink_view(id);
        if let ViewKind::Select { source } = &self.views[id].kind {
            if let Source::Literal(lit) = source {
                self.constant_cache.remove(lit);
            }
        }
        let columns = std::mem::take(&mut self.views[id].columns);
        for col in columns {
            self.columns.remove(col);
        }
        self.views.remove(id);
    }

    /// Drop the output columns of `view` where `keep` is false, removing the
    /// corresponding input slots. Only passthrough-shaped positions may be
    /// dropped: TUPLE inputs, JOIN non-pivot outputs, and the attached
    /// columns of MAP, COMPARE, and NEGATE. Dropped columns must be unused.
    pub fn shrink_view_columns(&mut self, view: ViewId, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.views[view].arity());
        if keep.iter().all(|&k| k) {
            return;
        }
        let ts = self.timeline.next();
        self.unlink_view(view);

        {
            let v = &mut self.views[view];
            match &mut v.kind {
                ViewKind::Tuple { inputs } => {
                    let mut idx = 0;
                    inputs.retain(|_| {
                        let k = keep[idx];
                        idx += 1;
                        k
                    });
                }
                ViewKind::Join {
                    pivots, outputs, ..
                } => {
                    let npiv = pivots.len();
                    debug_assert!(keep[..npiv].iter().all(|&k| k), "pivot outputs are fixed");
                    let mut idx = 0;
                    outputs.retain(|_| {
                        let k = keep[npiv + idx];
                        idx += 1;
                        k
                    });
                }
                ViewKind::Map { attached, .. } => {
                    let base = keep.len() - attached.len();
                    debug_assert!(keep[..base].iter().all(|&k| k), "functor outputs are fixed");
                    let mut idx = 0;
                    attached.retain(|_| {
                        let k = keep[base + idx];
                        idx += 1;
                        k
                    });
                }
                ViewKind::Compare { op, attached, .. } => {
                    let base = if op.keeps_both() { 2 } else { 1 };
                    debug_assert!(keep[..base].iter().all(|&k| k), "operand outputs are fixed");
                    let mut idx = 0;
                    attached.retain(|_| {
                        let k = keep[base + idx];
                        idx += 1;
                        k
                    });
                }
                ViewKind::Negate {
                    checked, attached, ..
                } => {
                    let base = checked.len();
                    debug_assert!(keep[..base].iter().all(|&k| k), "checked outputs are fixed");
                    let mut idx = 0;
                    attached.retain(|_| {
                        let k = keep[base + idx];
                        idx += 1;
                        k
                    });
                }
                _ => debug_assert!(false, "shrinking a fixed-shape view"),
            }
        }

        let old_columns = std::mem::take(&mut self.views[view].columns);
        let mut new_columns = Vec::new();
        for (i, col) in old_columns.into_iter().enumerate() {
            if keep[i] {
                new_columns.push(col);
            } else {
                debug_assert!(self.columns[col].uses.is_empty(), "dropping a used column");
                self.columns.remove(col);
            }
        }
        for (index, &col) in new_columns.iter().enumerate() {
            self.columns[col].index = index;
        }
        self.views[view].columns = new_columns;
        self.views[view].last_change = ts;
        self.link_view(view);
    }

    /// Whether a view anchors the graph even when nothing reads it.
    pub fn is_root(&self, id: ViewId) -> bool {
        let view = &self.views[id];
        view.kind.is_insert() || view.sets_condition.is_some()
    }

    /// Destroy unused non-root views until none remain. Returns how many
    /// views were destroyed.
    pub fn sweep(&mut self) -> usize {
        let mut destroyed = 0;
        loop {
            let dead: Vec<ViewId> = self
                .views
                .iter()
                .filter(|(id, v)| {
                    !v.is_used()
                        && !self.is_root(*id)
                        && v.columns.iter().all(|&c| self.columns[c].uses.is_empty())
                })
                .map(|(id, _)| id)
                .collect();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                destroyed += 1;
                self.destroy_view(id);
            }
        }
        if destroyed > 0 {
            let views = &self.views;
            for (_, rel) in self.relations.iter_mut() {
                rel.inserts.compact(views);
                rel.selects.compact(views);
                rel.negations.compact(views);
            }
            for (_, stream) in self.streams.iter_mut() {
                stream.transmits.compact(views);
                stream.receives.compact(views);
            }
            for (_, cond) in self.conditions.iter_mut() {
                cond.setters.compact(views);
                cond.positive_users.compact(views);
                cond.negative_users.compact(views);
            }
        }
        destroyed
    }

    // ------------------------------------------------------------------
    // Induction annotations
    // ------------------------------------------------------------------

    pub(crate) fn clear_induction(&mut self) {
        for (_, view) in self.views.iter_mut() {
            view.group = None;
            view.stratum = None;
            view.induction = None;
        }
    }

    pub(crate) fn set_stratum(&mut self, id: ViewId, stratum: usize) {
        self.views[id].stratum = Some(stratum);
    }

    pub(crate) fn set_induction_group(&mut self, id: ViewId, group: u32, sets: InductionSets) {
        self.views[id].group = Some(group);
        self.views[id].induction = Some(sets);
    }

    // ------------------------------------------------------------------
    // Graph shape
    // ------------------------------------------------------------------

    /// Strong predecessors: defining views of this view's input columns plus
    /// its whole-view targets, deduplicated in slot order.
    pub fn predecessors(&self, id: ViewId) -> Vec<ViewId> {
        let view = &self.views[id];
        let mut out: Vec<ViewId> = Vec::new();
        for col in view.kind.column_slots() {
            let def = self.columns[col].view;
            if !out.contains(&def) {
                out.push(def);
            }
        }
        for target in view.kind.view_targets() {
            if !out.contains(&target) {
                out.push(target);
            }
        }
        out
    }

    /// Strong successors: users of this view's output columns plus whole-view
    /// users, deduplicated in use order.
    pub fn successors(&self, id: ViewId) -> Vec<ViewId> {
        let view = &self.views[id];
        let mut out: Vec<ViewId> = Vec::new();
        for &col in &view.columns {
            for user in self.columns[col].uses.users() {
                if !out.contains(&user) {
                    out.push(user);
                }
            }
        }
        for user in view.uses.users() {
            if !out.contains(&user) {
                out.push(user);
            }
        }
        out
    }

    /// Longest path from any SELECT, zero at sources; a cycle contributes
    /// nothing beyond its entry, so MERGEs on cycles get their non-trivial
    /// depth from induction analysis instead.
    pub fn view_depth(&self, id: ViewId) -> usize {
        let mut memo = HashMap::new();
        let mut on_stack = HashSet::new();
        self.depth_rec(id, &mut memo, &mut on_stack)
    }

    fn depth_rec(
        &self,
        id: ViewId,
        memo: &mut HashMap<ViewId, usize>,
        on_stack: &mut HashSet<ViewId>,
    ) -> usize {
        if let Some(&d) = memo.get(&id) {
            return d;
        }
        if !on_stack.insert(id) {
            return 0;
        }
        let preds = self.predecessors(id);
        let depth = if preds.is_empty() {
            0
        } else {
            1 + preds
                .iter()
                .map(|&p| self.depth_rec(p, memo, on_stack))
                .max()
                .unwrap_or(0)
        };
        on_stack.remove(&id);
        memo.insert(id, depth);
        depth
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    /// Structural hashes for every live view, stable under column
    /// renumbering that preserves connectivity.
    pub fn view_hashes(&self) -> HashMap<ViewId, u64> {
        let mut memo = HashMap::new();
        let mut on_stack = HashSet::new();
        for (id, _) in self.views.iter() {
            self.hash_rec(id, &mut memo, &mut on_stack);
        }
        memo
    }

    pub fn view_hash(&self, id: ViewId) -> u64 {
        let mut memo = HashMap::new();
        let mut on_stack = HashSet::new();
        self.hash_rec(id, &mut memo, &mut on_stack)
    }

    fn hash_rec(
        &self,
        id: ViewId,
        memo: &mut HashMap<ViewId, u64>,
        on_stack: &mut HashSet<ViewId>,
    ) -> u64 {
        if let Some(&h) = memo.get(&id) {
            return h;
        }
        let view = &self.views[id];
        if !on_stack.insert(id) {
            // On a cycle: contribute a shape-only sentinel so the hash stays
            // finite and deterministic.
            let mut hasher = DefaultHasher::new();
            "cycle".hash(&mut hasher);
            view.kind.kind_name().hash(&mut hasher);
            view.arity().hash(&mut hasher);
            return hasher.finish();
        }

        let mut hasher = DefaultHasher::new();
        view.kind.kind_name().hash(&mut hasher);
        view.arity().hash(&mut hasher);

        match &view.kind {
            ViewKind::Select { source } => match source {
                Source::Relation(rel) => ("rel", self.relations[*rel].uid).hash(&mut hasher),
                Source::Stream(s) => ("stream", self.streams[*s].uid).hash(&mut hasher),
                Source::Literal(lit) => ("lit", lit).hash(&mut hasher),
                Source::Tag(t) => ("tag", t).hash(&mut hasher),
            },
            ViewKind::Join { pivots, .. } => {
                pivots.len().hash(&mut hasher);
                for set in pivots {
                    set.len().hash(&mut hasher);
                }
            }
            ViewKind::Map {
                functor, negated, ..
            } => {
                functor.hash(&mut hasher);
                negated.hash(&mut hasher);
            }
            ViewKind::Aggregate {
                functor,
                group,
                config,
                ..
            } => {
                functor.hash(&mut hasher);
                group.len().hash(&mut hasher);
                config.len().hash(&mut hasher);
            }
            ViewKind::Compare { op, .. } => op.hash(&mut hasher),
            ViewKind::Negate { never, .. } => never.hash(&mut hasher),
            ViewKind::Insert { target, .. } => match target {
                SinkTarget::Relation(rel) => ("rel", self.relations[*rel].uid).hash(&mut hasher),
                SinkTarget::Stream(s) => ("stream", self.streams[*s].uid).hash(&mut hasher),
            },
            ViewKind::Tuple { .. } | ViewKind::Merge { .. } | ViewKind::KvIndex { .. } => {}
        }

        for col in view.kind.column_slots() {
            let column = &self.columns[col];
            let def_hash = self.hash_rec(column.view, memo, on_stack);
            def_hash.hash(&mut hasher);
            column.index.hash(&mut hasher);
        }
        // MERGE inputs are unordered; combine commutatively.
        if let ViewKind::Merge { inputs } = &view.kind {
            let mut acc: u64 = 0;
            for &input in inputs {
                acc = acc.wrapping_add(self.hash_rec(input, memo, on_stack));
            }
            acc.hash(&mut hasher);
        }
        if let ViewKind::Negate { negated, .. } = &view.kind {
            self.hash_rec(*negated, memo, on_stack).hash(&mut hasher);
        }
        if let ViewKind::Join { joined, .. } = &view.kind {
            for &j in joined {
                self.hash_rec(j, memo, on_stack).hash(&mut hasher);
            }
        }

        // Condition attachments gate semantics, so they distinguish views.
        let mut conds: Vec<(bool, u32)> = view
            .positive_conditions
            .iter()
            .map(|&c| (true, self.conditions[c].uid))
            .chain(
                view.negative_conditions
                    .iter()
                    .map(|&c| (false, self.conditions[c].uid)),
            )
            .collect();
        conds.sort_unstable();
        conds.hash(&mut hasher);
        view.sets_condition
            .map(|c| self.conditions[c].uid)
            .hash(&mut hasher);

        let h = hasher.finish();
        on_stack.remove(&id);
        memo.insert(id, h);
        h
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Verify the structural invariants of the graph. Intended for tests and
    /// debug assertions after lowering and after each optimizer round.
    pub fn check_invariants(&self) -> Result<(), String> {
        // Use-count cross-check: slots referencing a column vs. its use list.
        let mut slot_counts: HashMap<ColumnId, usize> = HashMap::new();

        for (id, view) in self.views.iter() {
            if view.arity() != view.columns.len() {
                return Err(format!("view {} arity mismatch", view.uid));
            }
            for (index, &col) in view.columns.iter().enumerate() {
                let Some(column) = self.columns.get(col) else {
                    return Err(format!("view {} owns a dead column", view.uid));
                };
                if column.view != id || column.index != index {
                    return Err(format!(
                        "column {} disagrees with its defining view {}",
                        column.uid, view.uid
                    ));
                }
            }
            for (slot, col) in view.kind.column_slots().into_iter().enumerate() {
                let Some(column) = self.columns.get(col) else {
                    return Err(format!("view {} slot {} targets a dead column", view.uid, slot));
                };
                if !self.views.contains(column.view) {
                    return Err(format!(
                        "view {} slot {} targets a column of a dead view",
                        view.uid, slot
                    ));
                }
                if !column.uses.contains(id, slot) {
                    return Err(format!(
                        "use ({}, {}) missing from column {}'s use list",
                        view.uid, slot, column.uid
                    ));
                }
                *slot_counts.entry(col).or_default() += 1;
            }
            for (slot, target) in view.kind.view_targets().into_iter().enumerate() {
                let Some(tv) = self.views.get(target) else {
                    return Err(format!("view {} targets a dead view", view.uid));
                };
                if !tv.uses.contains(id, slot) {
                    return Err(format!(
                        "whole-view use ({}, {}) missing from view {}'s use list",
                        view.uid, slot, tv.uid
                    ));
                }
            }

            match &view.kind {
                ViewKind::Merge { inputs } => {
                    for &input in inputs {
                        let iv = &self.views[input];
                        if iv.arity() != view.arity() {
                            return Err(format!("merge {} input arity mismatch", view.uid));
                        }
                        for (a, b) in iv.columns.iter().zip(view.columns.iter()) {
                            if self.columns[*a].ty != self.columns[*b].ty {
                                return Err(format!("merge {} input type mismatch", view.uid));
                            }
                        }
                    }
                }
                ViewKind::Join { joined, pivots, .. } => {
                    for set in pivots {
                        if set.len() != joined.len() {
                            return Err(format!("join {} pivot set size mismatch", view.uid));
                        }
                        let ty = self.columns[set[0]].ty;
                        for (member, &jv) in set.iter().zip(joined.iter()) {
                            let col = &self.columns[*member];
                            if col.view != jv {
                                return Err(format!(
                                    "join {} pivot member not from its joined view",
                                    view.uid
                                ));
                            }
                            if col.ty != ty {
                                return Err(format!("join {} pivot type mismatch", view.uid));
                            }
                        }
                    }
                }
                ViewKind::Negate {
                    checked, negated, ..
                } => {
                    let nv = &self.views[*negated];
                    if checked.len() != nv.arity() {
                        return Err(format!("negate {} arity mismatch", view.uid));
                    }
                    for (c, n) in checked.iter().zip(nv.columns.iter()) {
                        if self.columns[*c].ty != self.columns[*n].ty {
                            return Err(format!("negate {} type mismatch", view.uid));
                        }
                    }
                }
                _ => {}
            }

            if let Some(cond) = view.sets_condition {
                if view.arity() != 1 {
                    return Err(format!(
                        "condition-setting view {} must have exactly one output",
                        view.uid
                    ));
                }
                if !self.conditions[cond].setters.contains(id) {
                    return Err(format!(
                        "view {} missing from its condition's setter list",
                        view.uid
                    ));
                }
            }
        }

        for (id, column) in self.columns.iter() {
            let counted = slot_counts.get(&id).copied().unwrap_or(0);
            if counted != column.uses.len() {
                return Err(format!(
                    "column {} use list length {} disagrees with {} referencing slots",
                    column.uid,
                    column.uses.len(),
                    counted
                ));
            }
        }

        // Every cycle must pass through a MERGE: with MERGEs deleted the
        // graph must be acyclic.
        self.check_merge_mediated_cycles()?;

        Ok(())
    }

    fn check_merge_mediated_cycles(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color: HashMap<ViewId, Color> = HashMap::new();
        for (id, view) in self.views.iter() {
            if view.kind.is_merge() {
                color.insert(id, Color::Black);
            } else {
                color.insert(id, Color::White);
            }
        }
        for (start, _) in self.views.iter() {
            if color[&start] != Color::White {
                continue;
            }
            // Iterative DFS over non-MERGE views.
            let mut stack: Vec<(ViewId, Vec<ViewId>, usize)> = Vec::new();
            color.insert(start, Color::Grey);
            stack.push((start, self.successors(start), 0));
            while !stack.is_empty() {
                let next_succ = {
                    let Some(top) = stack.last_mut() else { break };
                    if top.2 < top.1.len() {
                        let succ = top.1[top.2];
                        top.2 += 1;
                        Some(succ)
                    } else {
                        None
                    }
                };
                match next_succ {
                    None => {
                        if let Some((node, _, _)) = stack.pop() {
                            color.insert(node, Color::Black);
                        }
                    }
                    Some(succ) => match color[&succ] {
                        Color::White => {
                            color.insert(succ, Color::Grey);
                            stack.push((succ, self.successors(succ), 0));
                        }
                        Color::Grey => {
                            return Err(format!(
                                "cycle through view {} not mediated by a union",
                                self.views[succ].uid
                            ));
                        }
                        Color::Black => {}
                    },
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Literal;

    fn two_column_relation(query: &mut Query, name: &str) -> RelationId {
        query.add_relation(name, vec![TypeKind::U32, TypeKind::U32])
    }

    #[test]
    fn test_select_owns_columns() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);

        let view = query.view(select);
        assert_eq!(view.arity(), 2);
        for (index, &col) in view.columns().iter().enumerate() {
            let column = query.column(col);
            assert_eq!(column.defining_view(), select);
            assert_eq!(column.index(), index);
            assert_eq!(column.ty(), TypeKind::U32);
        }
        assert_eq!(query.relation(rel).selects.len_live(&query.views), 1);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_tuple_records_uses() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(vec![cols[1], cols[0]]);

        assert_eq!(query.column(cols[0]).use_count(), 1);
        assert_eq!(query.column(cols[1]).use_count(), 1);
        assert_eq!(query.input_column(tuple, 0), cols[1]);
        assert_eq!(query.input_column(tuple, 1), cols[0]);
        assert_eq!(query.predecessors(tuple), vec![select]);
        assert_eq!(query.successors(select), vec![tuple]);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_constant_columns_are_shared() {
        let mut query = Query::new();
        let a = query.constant_column(&Literal::unsigned(7));
        let b = query.constant_column(&Literal::unsigned(7));
        let c = query.constant_column(&Literal::unsigned(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tags_are_distinct() {
        let mut query = Query::new();
        let a = query.tag_column();
        let b = query.tag_column();
        assert_ne!(a, b);
        assert_eq!(query.column(a).ty(), TypeKind::U16);
    }

    #[test]
    fn test_replace_all_column_uses() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let s1 = query.select_relation(rel);
        let s2 = query.select_relation(rel);
        let c1 = query.view(s1).columns()[0];
        let c2 = query.view(s2).columns()[0];
        let t1 = query.tuple(vec![c1]);
        let t2 = query.tuple(vec![c1]);

        let before = query.current_timestamp();
        query.replace_all_column_uses(c1, c2);

        assert_eq!(query.column(c1).use_count(), 0);
        assert_eq!(query.column(c2).use_count(), 2);
        assert_eq!(query.input_column(t1, 0), c2);
        assert_eq!(query.input_column(t2, 0), c2);
        assert!(query.view(t1).last_change() > before);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_replace_column_uses_where_filters() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let s1 = query.select_relation(rel);
        let s2 = query.select_relation(rel);
        let c1 = query.view(s1).columns()[0];
        let c2 = query.view(s2).columns()[0];
        let t1 = query.tuple(vec![c1]);
        let t2 = query.tuple(vec![c1]);

        query.replace_column_uses_where(c1, c2, |user| user == t2);

        assert_eq!(query.input_column(t1, 0), c1);
        assert_eq!(query.input_column(t2, 0), c2);
        assert_eq!(query.column(c1).use_count(), 1);
        assert_eq!(query.column(c2).use_count(), 1);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_inputs_and_replace_view() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let t1 = query.tuple(cols.clone());
        let t2 = query.tuple(cols.clone());
        let merge = query.merge(&[(TypeKind::U32, None), (TypeKind::U32, None)]);
        query.add_merge_input(merge, t1);
        query.add_merge_input(merge, t2);
        query.check_invariants().unwrap();

        // Replace t2 by t1 inside the merge.
        query.replace_view(t2, t1);
        match query.view(merge).kind() {
            ViewKind::Merge { inputs } => assert_eq!(inputs, &vec![t1, t1]),
            _ => unreachable!(),
        }
        assert!(!query.view(t2).is_used());
        query.destroy_view(t2);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_destroy_and_sweep() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let _tuple = query.tuple(cols);

        // Nothing reads the tuple and it is not a root, so the sweep takes
        // it, then the now-unused select.
        let destroyed = query.sweep();
        assert_eq!(destroyed, 2);
        assert_eq!(query.num_views(), 0);
        assert_eq!(query.num_columns(), 0);
        assert_eq!(query.relation(rel).selects.len_live(&query.views), 0);
    }

    #[test]
    fn test_insert_is_root() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(cols);
        let tuple_cols = query.view(tuple).columns().to_vec();
        let insert = query.insert_relation(rel, tuple_cols);

        assert!(query.is_root(insert));
        assert_eq!(query.sweep(), 0);
        assert_eq!(query.num_views(), 3);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_depth() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(cols);
        let tuple_cols = query.view(tuple).columns().to_vec();
        let tuple2 = query.tuple(tuple_cols);

        assert_eq!(query.view_depth(select), 0);
        assert_eq!(query.view_depth(tuple), 1);
        assert_eq!(query.view_depth(tuple2), 2);
    }

    #[test]
    fn test_structural_hash_equal_for_equal_views() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let t1 = query.tuple(vec![cols[0], cols[1]]);
        let t2 = query.tuple(vec![cols[0], cols[1]]);
        let t3 = query.tuple(vec![cols[1], cols[0]]);

        let hashes = query.view_hashes();
        assert_eq!(hashes[&t1], hashes[&t2]);
        assert_ne!(hashes[&t1], hashes[&t3]);
    }

    #[test]
    fn test_selects_over_same_relation_hash_equal() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let s1 = query.select_relation(rel);
        let s2 = query.select_relation(rel);
        let hashes = query.view_hashes();
        assert_eq!(hashes[&s1], hashes[&s2]);
    }

    #[test]
    fn test_conditions_distinguish_hashes() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let s = query.select_relation(rel);
        let cols = query.view(s).columns().to_vec();
        let t1 = query.tuple(cols.clone());
        let t2 = query.tuple(cols);
        let cond = query.add_condition(Some("gate".to_string()));
        query.add_positive_condition(t2, cond);

        let hashes = query.view_hashes();
        assert_ne!(hashes[&t1], hashes[&t2]);
    }

    #[test]
    fn test_cycle_through_merge_is_accepted() {
        let mut query = Query::new();
        let rel = two_column_relation(&mut query, "edge");
        let select = query.select_relation(rel);
        let scols = query.view(select).columns().to_vec();

        let merge = query.merge(&[(TypeKind::U32, None), (TypeKind::U32, None)]);
        let mcols = query.view(merge).columns().to_vec();
        let t_base = query.tuple(scols);
        let t_step = query.tuple(mcols);
        query.add_merge_input(merge, t_base);
        query.add_merge_input(merge, t_step);

        query.check_invariants().unwrap();
        // Depth terminates despite the cycle.
        let _ = query.view_depth(merge);
        let _ = query.view_hashes();
    }

    #[test]
    fn test_condition_setter_shape() {
        let mut query = Query::new();
        let tag = query.tag_column();
        let setter = query.tuple(vec![tag]);
        let cond = query.add_condition(None);
        query.set_condition(setter, cond);

        assert!(query.is_root(setter));
        query.check_invariants().unwrap();
    }
}
