//! # Clause-to-IR lowering
//!
//! Turns rule modules into the dataflow graph: every clause becomes a chain
//! of SELECTs, JOINs, COMPAREs, MAPs, AGGREGATEs, and NEGATEs ending in a
//! TUPLE that feeds the head's union and an INSERT into its backing relation
//! or stream.
//!
//! ```text
//! ast::Module -> [Lowering] -> Query -> Optimizer
//! ```
//!
//! Variable identity follows the first-appearance rule: every occurrence of a
//! term allocates a union-find node, occurrences of the same name within one
//! clause are unioned, and literals stay in fresh singleton classes. Pivot
//! sets of the emitted joins are exactly the classes shared across body
//! atoms, ordered by their first appearance so equal bodies lower to equal
//! graphs.
//!
//! Structural errors abort the clause, not the module: partially built views
//! are left for the optimizer's sweep, and lowering moves on so one pass
//! reports as many problems as possible.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::ast::{
    Atom, Binding, Clause, ComparisonOp, DeclKind, Declaration, Literal, Module, Term, TypeKind,
};
use crate::error::{CompileError, ErrorLog};
use crate::query::{ColumnId, ColumnSpec, ConditionId, Query, RelationId, StreamId, ViewId};

/// Lower every clause of the given modules into a fresh [`Query`].
///
/// Returns `None` when a fatal diagnostic was appended; recoverable errors
/// drop their clause and lowering continues.
pub fn build(modules: &[Module], log: &mut ErrorLog) -> Option<Query> {
    let mark = log.mark();
    let mut lowering = Lowering::new(log);
    lowering.collect_declarations(modules);
    lowering.create_backing();

    for module in modules {
        for (index, clause) in module.clauses.iter().enumerate() {
            lowering.lower_clause(clause, index);
        }
    }

    debug!(
        views = lowering.query.num_views(),
        errors = lowering.log.error_count(),
        "lowering finished"
    );
    debug_assert!(lowering.query.check_invariants().is_ok());

    let Lowering { query, log, .. } = lowering;
    if log.fatal_since(mark) {
        None
    } else {
        Some(query)
    }
}

/// Marker for an aborted clause; the diagnostic is already on the log.
struct ClauseAborted;

type Lower<T> = Result<T, ClauseAborted>;

// ============================================================================
// Variable classes
// ============================================================================

/// Union-find over term occurrences. Each occurrence allocates a node;
/// occurrences of the same variable name are unioned, literals stay alone.
/// Roots are minimal node ids, so a class's representative is its first
/// appearance in the clause.
#[derive(Debug, Default)]
struct VarClasses {
    parent: Vec<usize>,
    name_node: HashMap<String, usize>,
}

impl VarClasses {
    fn fresh(&mut self) -> usize {
        let node = self.parent.len();
        self.parent.push(node);
        node
    }

    /// Allocate an occurrence node for `name` and union it with the name's
    /// earlier occurrences.
    fn intern_var(&mut self, name: &str) -> usize {
        let node = self.fresh();
        if let Some(&first) = self.name_node.get(name) {
            self.union(first, node);
        } else {
            self.name_node.insert(name.to_string(), node);
        }
        self.find(node)
    }

    /// The class of a variable, if it has appeared.
    fn class_of(&mut self, name: &str) -> Option<usize> {
        let node = *self.name_node.get(name)?;
        Some(self.find(node))
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = node;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Union keeping the smaller id as root, so roots order by first
    /// appearance.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (keep, drop) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[drop] = keep;
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One variable-connected piece of the body under construction: a view plus
/// the mapping from variable classes to its output columns.
#[derive(Debug, Clone)]
struct Frame {
    view: ViewId,
    cols: Vec<(usize, ColumnId)>,
}

impl Frame {
    fn col(&self, class: usize) -> Option<ColumnId> {
        self.cols
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, col)| *col)
    }

    fn has_class(&self, class: usize) -> bool {
        self.cols.iter().any(|(c, _)| *c == class)
    }

    /// Distinct columns in first-mention order.
    fn unique_cols(&self) -> Vec<ColumnId> {
        let mut out = Vec::new();
        for (_, col) in &self.cols {
            if !out.contains(col) {
                out.push(*col);
            }
        }
        out
    }
}

/// A functor atom waiting for its inputs to become bound.
#[derive(Debug, Clone)]
struct PendingMap {
    decl: usize,
    atom: Atom,
    negated: bool,
    never: bool,
}

/// Scratch state for one clause.
#[derive(Debug, Default)]
struct ClauseState {
    classes: VarClasses,
    class_types: HashMap<usize, TypeKind>,
    class_names: HashMap<usize, String>,
    const_bindings: HashMap<usize, ColumnId>,
    frames: Vec<Frame>,
    pending_maps: Vec<PendingMap>,
    positive_conditions: Vec<ConditionId>,
    negative_conditions: Vec<ConditionId>,
}

impl ClauseState {
    /// The column a class is currently carried by, searching frames then
    /// constant bindings.
    fn class_col(&self, class: usize) -> Option<ColumnId> {
        for frame in &self.frames {
            if let Some(col) = frame.col(class) {
                return Some(col);
            }
        }
        self.const_bindings.get(&class).copied()
    }

    fn display_name(&self, class: usize) -> String {
        self.class_names
            .get(&class)
            .cloned()
            .unwrap_or_else(|| format!("_{class}"))
    }
}

// ============================================================================
// Lowering
// ============================================================================

struct Lowering<'a> {
    log: &'a mut ErrorLog,
    query: Query,
    decls: Vec<Declaration>,
    by_key: HashMap<(String, usize), usize>,
    relations: HashMap<usize, RelationId>,
    streams: HashMap<usize, StreamId>,
    cond_decls: HashMap<usize, ConditionId>,
    merges: HashMap<usize, ViewId>,
}

impl<'a> Lowering<'a> {
    fn new(log: &'a mut ErrorLog) -> Self {
        Lowering {
            log,
            query: Query::new(),
            decls: Vec::new(),
            by_key: HashMap::new(),
            relations: HashMap::new(),
            streams: HashMap::new(),
            cond_decls: HashMap::new(),
            merges: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Declarations and backing storage
    // ------------------------------------------------------------------

    fn collect_declarations(&mut self, modules: &[Module]) {
        for module in modules {
            for decl in &module.declarations {
                let key = (decl.name.clone(), decl.arity());
                match self.by_key.get(&key) {
                    None => {
                        self.by_key.insert(key, self.decls.len());
                        self.decls.push(decl.clone());
                    }
                    Some(&first) => {
                        if !Self::redeclaration_matches(&self.decls[first], decl) {
                            self.log.error(
                                CompileError::RedeclarationDiffers {
                                    name: decl.name.clone(),
                                    arity: decl.arity(),
                                },
                                format!("declaration of '{}'", decl.name),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Redeclarations must agree on everything except parameter names.
    fn redeclaration_matches(first: &Declaration, redecl: &Declaration) -> bool {
        first.kind == redecl.kind
            && first.range == redecl.range
            && first.is_pure == redecl.is_pure
            && first.inline == redecl.inline
            && first.differential == redecl.differential
            && first.params.len() == redecl.params.len()
            && first
                .params
                .iter()
                .zip(redecl.params.iter())
                .all(|(a, b)| {
                    a.ty == b.ty && a.binding == b.binding && a.merge_functor == b.merge_functor
                })
    }

    /// Create relations, streams, and conditions, and pre-materialize one
    /// MERGE per relation-backed declaration so recursive references have a
    /// view to read before their clauses exist. Single-input merges are
    /// canonicalized away later.
    fn create_backing(&mut self) {
        for index in 0..self.decls.len() {
            let decl = self.decls[index].clone();
            match decl.kind {
                DeclKind::Message => {
                    let stream = self.query.add_stream(
                        decl.name.clone(),
                        decl.param_types(),
                        decl.differential,
                    );
                    self.streams.insert(index, stream);
                }
                DeclKind::Query | DeclKind::Export | DeclKind::Local => {
                    if decl.arity() == 0 {
                        let cond = self.query.add_condition(Some(decl.name.clone()));
                        self.cond_decls.insert(index, cond);
                    } else {
                        let rel = self
                            .query
                            .add_relation(decl.name.clone(), decl.param_types());
                        self.relations.insert(index, rel);
                        let specs: Vec<ColumnSpec> = decl
                            .params
                            .iter()
                            .map(|p| (p.ty, Some(p.name.clone())))
                            .collect();
                        let merge = self.query.merge(&specs);
                        self.merges.insert(index, merge);
                    }
                }
                DeclKind::Functor => {}
            }
        }
    }

    fn resolve(&self, name: &str, arity: usize) -> Result<usize, CompileError> {
        if let Some(&index) = self.by_key.get(&(name.to_string(), arity)) {
            return Ok(index);
        }
        // A same-named declaration with another arity gives the better error.
        if let Some((key, _)) = self.by_key.iter().find(|((n, _), _)| n == name) {
            return Err(CompileError::ArityMismatch {
                name: name.to_string(),
                declared: key.1,
                used: arity,
            });
        }
        Err(CompileError::UndeclaredPredicate {
            name: name.to_string(),
            arity,
        })
    }

    // ------------------------------------------------------------------
    // Clause lowering
    // ------------------------------------------------------------------

    fn lower_clause(&mut self, clause: &Clause, clause_index: usize) {
        let context = format!(
            "clause {} of '{}/{}'",
            clause_index + 1,
            clause.head.name,
            clause.head.arity()
        );

        if clause.disabled {
            self.log.note(
                CompileError::DisabledClause {
                    decl: clause.head.name.clone(),
                },
                context,
            );
            return;
        }

        let head_decl = match self.resolve(&clause.head.name, clause.head.arity()) {
            Ok(index) => index,
            Err(err) => {
                self.log.error(err, context);
                return;
            }
        };
        if self.decls[head_decl].kind == DeclKind::Functor {
            self.log.error(
                CompileError::FunctorClauseHead {
                    name: clause.head.name.clone(),
                },
                context,
            );
            return;
        }

        let mut state = ClauseState::default();
        // Swallow the abort marker: the diagnostic is already logged and any
        // partially built views are unreachable from a root, so the sweep
        // reclaims them.
        let _ = self.lower_clause_inner(clause, head_decl, &mut state, &context);
    }

    fn lower_clause_inner(
        &mut self,
        clause: &Clause,
        head_decl: usize,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        self.check_occurrences(clause, context)?;

        // Head classes first, so class ids order head variables before body
        // temporaries.
        let head_classes = self.intern_head(clause, head_decl, state, context)?;

        self.build_atom_frames(clause, state, context)?;
        self.build_aggregate_frames(clause, state, context)?;
        self.collect_pending_maps(clause, state, context)?;
        self.bind_assignments(clause, state, context)?;
        self.apply_constant_equalities(state)?;

        // Joins and maps interleave until neither makes progress: a functor
        // output can create the shared class a later join pivots on.
        loop {
            let joined = self.join_step(state, context)?;
            let mapped = self.map_step(state, context)?;
            if !joined && !mapped {
                break;
            }
        }
        self.finish_maps_or_fail(state, context)?;
        self.merge_product_frames(clause, head_decl, &head_classes, state, context)?;

        self.apply_constant_equalities(state)?;
        self.apply_comparisons(clause, state, context)?;
        self.apply_negations(clause, state, context)?;

        self.terminate(clause, head_decl, &head_classes, state, context)
    }

    // ------------------------------------------------------------------
    // Occurrence and head checks
    // ------------------------------------------------------------------

    /// A named variable appearing exactly once, outside the head and outside
    /// any aggregate sub-body, constrains nothing and is rejected.
    fn check_occurrences(&mut self, clause: &Clause, context: &str) -> Lower<()> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut head_vars: HashSet<&str> = HashSet::new();
        let mut subbody_vars: HashSet<&str> = HashSet::new();

        for term in &clause.head.args {
            if let Some(v) = term.variable_name() {
                head_vars.insert(v);
                *counts.entry(v).or_default() += 1;
            }
        }
        for atom in &clause.positive {
            for v in atom.variables() {
                *counts.entry(v).or_default() += 1;
            }
        }
        for neg in &clause.negated {
            for v in neg.atom.variables() {
                *counts.entry(v).or_default() += 1;
            }
        }
        for assign in &clause.assignments {
            *counts.entry(assign.var.as_str()).or_default() += 1;
        }
        for cmp in &clause.comparisons {
            *counts.entry(cmp.lhs.as_str()).or_default() += 1;
            *counts.entry(cmp.rhs.as_str()).or_default() += 1;
        }
        for agg in &clause.aggregates {
            for v in agg.functor.variables() {
                *counts.entry(v).or_default() += 1;
            }
            for atom in &agg.body {
                for v in atom.variables() {
                    subbody_vars.insert(v);
                    *counts.entry(v).or_default() += 1;
                }
            }
        }

        for (var, count) in counts {
            if count == 1 && !head_vars.contains(var) && !subbody_vars.contains(var) {
                self.log.error(
                    CompileError::UnconstrainedVariable {
                        var: var.to_string(),
                        decl: clause.head.name.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            }
        }
        Ok(())
    }

    /// Intern head argument classes and record their declared types.
    /// Literal head arguments yield `None`; they become constant columns at
    /// the terminal TUPLE.
    fn intern_head(
        &mut self,
        clause: &Clause,
        head_decl: usize,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<Vec<Option<usize>>> {
        let params = self.decls[head_decl].params.clone();
        let mut classes = Vec::with_capacity(clause.head.args.len());
        for (term, param) in clause.head.args.iter().zip(params.iter()) {
            match term {
                Term::Variable(name) => {
                    let class = state.classes.intern_var(name);
                    state.class_names.entry(class).or_insert_with(|| name.clone());
                    self.check_class_type(state, class, param.ty, context)?;
                    classes.push(Some(class));
                }
                Term::Literal(lit) => {
                    self.check_literal_type(lit, param.ty, state, context)?;
                    classes.push(None);
                }
            }
        }
        Ok(classes)
    }

    fn check_class_type(
        &mut self,
        state: &mut ClauseState,
        class: usize,
        ty: TypeKind,
        context: &str,
    ) -> Lower<()> {
        match state.class_types.get(&class) {
            None => {
                state.class_types.insert(class, ty);
                Ok(())
            }
            Some(&prev) if prev == ty => Ok(()),
            Some(&prev) => {
                self.log.error(
                    CompileError::TypeMismatch {
                        var: state.display_name(class),
                        first: prev.as_str().to_string(),
                        second: ty.as_str().to_string(),
                    },
                    context,
                );
                Err(ClauseAborted)
            }
        }
    }

    fn check_literal_type(
        &mut self,
        lit: &Literal,
        ty: TypeKind,
        state: &ClauseState,
        context: &str,
    ) -> Lower<()> {
        let _ = state;
        if lit.ty != ty {
            self.log.error(
                CompileError::TypeMismatch {
                    var: lit.spelling.clone(),
                    first: lit.ty.as_str().to_string(),
                    second: ty.as_str().to_string(),
                },
                context,
            );
            return Err(ClauseAborted);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Atom frames
    // ------------------------------------------------------------------

    /// Lower the positive non-functor atoms to frames. Zero-arity atoms
    /// become condition attachments instead; functor atoms are deferred.
    fn build_atom_frames(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        // Identical atoms collapse to one frame.
        let mut seen: HashMap<(usize, Vec<Term>), usize> = HashMap::new();

        for atom in &clause.positive {
            let decl = match self.resolve(&atom.name, atom.arity()) {
                Ok(d) => d,
                Err(err) => {
                    self.log.error(err, context);
                    return Err(ClauseAborted);
                }
            };
            match self.decls[decl].kind {
                DeclKind::Functor => continue,
                DeclKind::Message if atom.arity() == 0 => {
                    self.log.error(
                        CompileError::MessageCondition {
                            name: atom.name.clone(),
                        },
                        context,
                    );
                    return Err(ClauseAborted);
                }
                _ if atom.arity() == 0 => {
                    let cond = self.cond_decls[&decl];
                    state.positive_conditions.push(cond);
                    continue;
                }
                _ => {}
            }

            let key = (decl, atom.args.clone());
            if seen.contains_key(&key) {
                // Interning still has to happen so occurrence classes exist.
                for term in &atom.args {
                    if let Term::Variable(name) = term {
                        let class = state.classes.intern_var(name);
                        state.class_names.entry(class).or_insert_with(|| name.clone());
                    }
                }
                continue;
            }
            seen.insert(key, state.frames.len());

            let frame = self.atom_frame(decl, atom, state, context)?;
            state.frames.push(frame);
        }
        Ok(())
    }

    /// Build one frame: the declaration's source view filtered by any
    /// literal arguments and repeated-variable equalities.
    fn atom_frame(
        &mut self,
        decl: usize,
        atom: &Atom,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<Frame> {
        let params = self.decls[decl].params.clone();
        let source = match self.decls[decl].kind {
            DeclKind::Message => self.query.select_stream(self.streams[&decl]),
            _ => self.merges[&decl],
        };

        // Current column per argument position, updated as filters stack.
        let mut pos_cols: Vec<ColumnId> = self.query.view(source).columns().to_vec();
        let mut current = source;
        let mut class_of_pos: Vec<Option<usize>> = vec![None; atom.arity()];

        for (i, (term, param)) in atom.args.iter().zip(params.iter()).enumerate() {
            match term {
                Term::Variable(name) => {
                    let class = state.classes.intern_var(name);
                    state.class_names.entry(class).or_insert_with(|| name.clone());
                    self.check_class_type(state, class, param.ty, context)?;
                    class_of_pos[i] = Some(class);
                }
                Term::Literal(lit) => {
                    self.check_literal_type(lit, param.ty, state, context)?;
                    let const_col = self.query.constant_column(lit);
                    let (view, mapping) =
                        self.compare_within(current, &pos_cols, pos_cols[i], const_col);
                    current = view;
                    pos_cols = mapping;
                }
            }
        }

        // Repeated variables inside one atom: edge(X, X) filters col0 = col1.
        for i in 0..atom.arity() {
            let Some(class) = class_of_pos[i] else { continue };
            for j in 0..i {
                if class_of_pos[j] == Some(class) && pos_cols[i] != pos_cols[j] {
                    let (view, mapping) =
                        self.compare_cols(current, &pos_cols, pos_cols[j], pos_cols[i]);
                    current = view;
                    pos_cols = mapping;
                }
            }
        }

        let mut cols = Vec::new();
        for (i, class) in class_of_pos.iter().enumerate() {
            if let Some(class) = class {
                if !cols.iter().any(|(c, _)| c == class) {
                    cols.push((*class, pos_cols[i]));
                }
            }
        }
        Ok(Frame {
            view: current,
            cols,
        })
    }

    /// Emit `lhs = rhs` where `rhs` is not part of the current tuple (a
    /// constant). Returns the compare view and the position remapping.
    fn compare_within(
        &mut self,
        _current: ViewId,
        pos_cols: &[ColumnId],
        lhs: ColumnId,
        rhs: ColumnId,
    ) -> (ViewId, Vec<ColumnId>) {
        let mut attached = Vec::new();
        for &col in pos_cols {
            if col != lhs && !attached.contains(&col) {
                attached.push(col);
            }
        }
        let view = self
            .query
            .compare(ComparisonOp::Eq, lhs, rhs, attached.clone());
        let out = self.query.view(view).columns().to_vec();
        let mapping = pos_cols
            .iter()
            .map(|&col| {
                if col == lhs {
                    out[0]
                } else {
                    let at = attached.iter().position(|&a| a == col);
                    match at {
                        Some(idx) => out[1 + idx],
                        None => out[0],
                    }
                }
            })
            .collect();
        (view, mapping)
    }

    /// Emit `lhs = rhs` where both sides are part of the current tuple.
    fn compare_cols(
        &mut self,
        _current: ViewId,
        pos_cols: &[ColumnId],
        lhs: ColumnId,
        rhs: ColumnId,
    ) -> (ViewId, Vec<ColumnId>) {
        let mut attached = Vec::new();
        for &col in pos_cols {
            if col != lhs && col != rhs && !attached.contains(&col) {
                attached.push(col);
            }
        }
        let view = self
            .query
            .compare(ComparisonOp::Eq, lhs, rhs, attached.clone());
        let out = self.query.view(view).columns().to_vec();
        let mapping = pos_cols
            .iter()
            .map(|&col| {
                if col == lhs || col == rhs {
                    out[0]
                } else {
                    let at = attached.iter().position(|&a| a == col);
                    match at {
                        Some(idx) => out[1 + idx],
                        None => out[0],
                    }
                }
            })
            .collect();
        (view, mapping)
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Each aggregate atom lowers its sub-body to a single frame and wraps
    /// it in an AGGREGATE view; the result joins the body like any frame,
    /// carrying group, config, and summary classes.
    fn build_aggregate_frames(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        for agg in &clause.aggregates {
            let functor = &agg.functor;
            let decl = match self.resolve(&functor.name, functor.arity()) {
                Ok(d) => d,
                Err(err) => {
                    self.log.error(err, context);
                    return Err(ClauseAborted);
                }
            };
            if !self.decls[decl].is_aggregating() {
                self.log.error(
                    CompileError::NotAggregating {
                        name: functor.name.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            }

            // Lower the sub-body into its own frame set, then join it down
            // to one frame. The sub-body is a synthetic inline definition:
            // its classes live in the clause-wide table so config and
            // summary variables connect outward.
            let mut inner_frames: Vec<Frame> = Vec::new();
            for atom in &agg.body {
                let inner_decl = match self.resolve(&atom.name, atom.arity()) {
                    Ok(d) => d,
                    Err(err) => {
                        self.log.error(err, context);
                        return Err(ClauseAborted);
                    }
                };
                let frame = self.atom_frame(inner_decl, atom, state, context)?;
                inner_frames.push(frame);
            }
            let inner = self.join_down_to_one(inner_frames, clause, state, context)?;

            // Partition the functor's parameters over its arguments. Config
            // entries remember their class so the frame mapping below stays
            // positionally aligned even with literal config arguments.
            let params = self.decls[decl].params.clone();
            let mut config_entries: Vec<(ColumnId, Option<usize>)> = Vec::new();
            let mut aggregated: Vec<ColumnId> = Vec::new();
            let mut aggregated_classes: Vec<usize> = Vec::new();
            let mut summaries: Vec<ColumnSpec> = Vec::new();
            let mut summary_classes: Vec<usize> = Vec::new();

            for (term, param) in functor.args.iter().zip(params.iter()) {
                let class = match term {
                    Term::Variable(name) => {
                        let class = state.classes.intern_var(name);
                        state
                            .class_names
                            .entry(class)
                            .or_insert_with(|| name.clone());
                        self.check_class_type(state, class, param.ty, context)?;
                        class
                    }
                    Term::Literal(lit) => {
                        self.check_literal_type(lit, param.ty, state, context)?;
                        if param.binding == Binding::Summary {
                            self.log.error(
                                CompileError::UnboundFunctorInput {
                                    var: lit.spelling.clone(),
                                    name: functor.name.clone(),
                                },
                                context,
                            );
                            return Err(ClauseAborted);
                        }
                        let col = self.query.constant_column(lit);
                        config_entries.push((col, None));
                        continue;
                    }
                };
                match param.binding {
                    Binding::Aggregate => {
                        let Some(col) = inner.col(class) else {
                            self.log.error(
                                CompileError::UnboundFunctorInput {
                                    var: state.display_name(class),
                                    name: functor.name.clone(),
                                },
                                context,
                            );
                            return Err(ClauseAborted);
                        };
                        aggregated.push(col);
                        aggregated_classes.push(class);
                    }
                    Binding::Summary => {
                        summaries.push((param.ty, Some(state.display_name(class))));
                        summary_classes.push(class);
                    }
                    _ => {
                        let Some(col) = inner.col(class) else {
                            self.log.error(
                                CompileError::UnboundFunctorInput {
                                    var: state.display_name(class),
                                    name: functor.name.clone(),
                                },
                                context,
                            );
                            return Err(ClauseAborted);
                        };
                        config_entries.push((col, Some(class)));
                    }
                }
            }
            let config: Vec<ColumnId> = config_entries.iter().map(|(c, _)| *c).collect();
            let config_classes: Vec<Option<usize>> =
                config_entries.iter().map(|(_, c)| *c).collect();

            // Group columns: sub-body classes also used outside this
            // aggregate, minus the config and aggregated ones.
            let outer = self.classes_outside_aggregate(clause, agg, state);
            let mut group: Vec<ColumnId> = Vec::new();
            let mut group_classes: Vec<usize> = Vec::new();
            for (class, col) in &inner.cols {
                if outer.contains(class)
                    && !config_classes.contains(&Some(*class))
                    && !aggregated_classes.contains(class)
                {
                    group.push(*col);
                    group_classes.push(*class);
                }
            }

            let view = self.query.aggregate(
                self.decls[decl].name.clone(),
                group.clone(),
                config.clone(),
                aggregated,
                &summaries,
            );
            let out = self.query.view(view).columns().to_vec();
            let mut cols: Vec<(usize, ColumnId)> = Vec::new();
            for (i, class) in group_classes.iter().enumerate() {
                cols.push((*class, out[i]));
            }
            for (i, class) in config_classes.iter().enumerate() {
                if let Some(class) = class {
                    cols.push((*class, out[group.len() + i]));
                }
            }
            for (i, class) in summary_classes.iter().enumerate() {
                cols.push((*class, out[group.len() + config.len() + i]));
            }
            state.frames.push(Frame { view, cols });
        }
        Ok(())
    }

    /// Variable names mentioned anywhere in the clause except exclusively in
    /// the given aggregate's sub-body, as classes.
    fn classes_outside_aggregate(
        &mut self,
        clause: &Clause,
        agg: &crate::ast::AggregateAtom,
        state: &mut ClauseState,
    ) -> HashSet<usize> {
        let mut names: HashSet<&str> = HashSet::new();
        for term in &clause.head.args {
            if let Some(v) = term.variable_name() {
                names.insert(v);
            }
        }
        for atom in &clause.positive {
            names.extend(atom.variables());
        }
        for neg in &clause.negated {
            names.extend(neg.atom.variables());
        }
        for assign in &clause.assignments {
            names.insert(assign.var.as_str());
        }
        for cmp in &clause.comparisons {
            names.insert(cmp.lhs.as_str());
            names.insert(cmp.rhs.as_str());
        }
        for other in &clause.aggregates {
            if std::ptr::eq(other, agg) {
                // The functor's own arguments count as outside uses; only
                // the sub-body is interior.
                names.extend(other.functor.variables());
                continue;
            }
            names.extend(other.functor.variables());
            for atom in &other.body {
                names.extend(atom.variables());
            }
        }
        names
            .into_iter()
            .filter_map(|n| state.classes.class_of(n))
            .collect()
    }

    // ------------------------------------------------------------------
    // Functor maps
    // ------------------------------------------------------------------

    fn collect_pending_maps(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        for atom in &clause.positive {
            let decl = match self.resolve(&atom.name, atom.arity()) {
                Ok(d) => d,
                Err(_) => continue, // already reported by build_atom_frames
            };
            if self.decls[decl].kind != DeclKind::Functor {
                continue;
            }
            if self.decls[decl].is_aggregating() {
                self.log.error(
                    CompileError::AggregateOutsideSummary {
                        name: atom.name.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            }
            self.intern_atom_classes(decl, atom, state, context)?;
            state.pending_maps.push(PendingMap {
                decl,
                atom: atom.clone(),
                negated: false,
                never: false,
            });
        }
        for neg in &clause.negated {
            let decl = match self.resolve(&neg.atom.name, neg.atom.arity()) {
                Ok(d) => d,
                Err(err) => {
                    self.log.error(err, context);
                    return Err(ClauseAborted);
                }
            };
            if self.decls[decl].kind != DeclKind::Functor {
                continue;
            }
            if let Some(range) = self.decls[decl].range {
                if range.guarantees_output() {
                    self.log.error(
                        CompileError::NegatedTotalFunctor {
                            name: neg.atom.name.clone(),
                        },
                        context,
                    );
                    return Err(ClauseAborted);
                }
            }
            self.intern_atom_classes(decl, &neg.atom, state, context)?;
            state.pending_maps.push(PendingMap {
                decl,
                atom: neg.atom.clone(),
                negated: true,
                never: neg.never,
            });
        }
        Ok(())
    }

    fn intern_atom_classes(
        &mut self,
        decl: usize,
        atom: &Atom,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        let params = self.decls[decl].params.clone();
        for (term, param) in atom.args.iter().zip(params.iter()) {
            match term {
                Term::Variable(name) => {
                    let class = state.classes.intern_var(name);
                    state.class_names.entry(class).or_insert_with(|| name.clone());
                    self.check_class_type(state, class, param.ty, context)?;
                }
                Term::Literal(lit) => {
                    self.check_literal_type(lit, param.ty, state, context)?;
                }
            }
        }
        Ok(())
    }

    /// Apply every pending map whose inputs are available. Returns whether
    /// anything was applied.
    fn map_step(&mut self, state: &mut ClauseState, _context: &str) -> Lower<bool> {
        let mut progressed = false;
        let mut remaining = Vec::new();
        let pending = std::mem::take(&mut state.pending_maps);

        'maps: for map in pending {
            let params = self.decls[map.decl].params.clone();
            let range = self.decls[map.decl]
                .range
                .unwrap_or(crate::ast::FunctorRange::OneToOne);

            // Locate the frame holding every bound input. Constants bind
            // frame-independently.
            let mut bound_cols: Vec<ColumnId> = Vec::new();
            let mut frame_index: Option<usize> = None;
            for (term, param) in map.atom.args.iter().zip(params.iter()) {
                let needs_binding = map.negated || param.binding == Binding::Bound;
                if !needs_binding {
                    continue;
                }
                let col = match term {
                    Term::Literal(lit) => self.query.constant_column(lit),
                    Term::Variable(name) => {
                        let Some(class) = state.classes.class_of(name) else {
                            remaining.push(map);
                            continue 'maps;
                        };
                        if let Some(col) = state.const_bindings.get(&class) {
                            *col
                        } else {
                            let holder = state
                                .frames
                                .iter()
                                .position(|f| f.has_class(class));
                            match holder {
                                Some(fi) => {
                                    if let Some(prev) = frame_index {
                                        if prev != fi {
                                            // Inputs split over frames; wait
                                            // for a join to bring them
                                            // together.
                                            remaining.push(map);
                                            continue 'maps;
                                        }
                                    }
                                    frame_index = Some(fi);
                                    match state.frames[fi].col(class) {
                                        Some(col) => col,
                                        None => {
                                            remaining.push(map);
                                            continue 'maps;
                                        }
                                    }
                                }
                                None => {
                                    remaining.push(map);
                                    continue 'maps;
                                }
                            }
                        }
                    }
                };
                bound_cols.push(col);
            }

            // Free outputs (positive maps only). A literal in a free
            // position pins the functor's output to that constant.
            let mut free_specs: Vec<ColumnSpec> = Vec::new();
            let mut free_classes: Vec<Option<usize>> = Vec::new();
            let mut free_literals: Vec<(usize, Literal)> = Vec::new();
            if !map.negated {
                for (term, param) in map.atom.args.iter().zip(params.iter()) {
                    if param.binding == Binding::Bound {
                        continue;
                    }
                    match term {
                        Term::Variable(name) => {
                            let class = state.classes.intern_var(name);
                            free_specs.push((param.ty, Some(name.clone())));
                            free_classes.push(Some(class));
                        }
                        Term::Literal(lit) => {
                            free_literals.push((free_specs.len(), lit.clone()));
                            free_specs.push((param.ty, None));
                            free_classes.push(None);
                        }
                    }
                }
            }

            let (attached, old_frame) = match frame_index {
                Some(fi) => {
                    let frame = state.frames[fi].clone();
                    (frame.unique_cols(), Some(fi))
                }
                None => (Vec::new(), None),
            };

            let view = self.query.map(
                self.decls[map.decl].name.clone(),
                range,
                map.negated,
                bound_cols,
                &free_specs,
                attached.clone(),
            );
            let n_free = free_specs.len();

            // Track every output position across the fixup compares below.
            let mut positions = self.query.view(view).columns().to_vec();
            let mut current = view;

            // Pin literal free outputs first, while their columns are still
            // part of the tuple.
            for (free_idx, lit) in free_literals {
                let const_col = self.query.constant_column(&lit);
                let (next, mapping) =
                    self.compare_within(current, &positions, positions[free_idx], const_col);
                current = next;
                positions = mapping;
            }

            // Rebuild the frame over the map's outputs.
            let mut cols: Vec<(usize, ColumnId)> = Vec::new();
            for (i, class) in free_classes.iter().enumerate() {
                if let Some(class) = class {
                    cols.push((*class, positions[i]));
                }
            }
            if let Some(fi) = old_frame {
                for (class, col) in &state.frames[fi].cols {
                    if let Some(idx) = attached.iter().position(|&a| a == *col) {
                        cols.push((*class, positions[n_free + idx]));
                    }
                }
            }

            // A free output whose variable is already bound elsewhere in the
            // same frame unifies by an equality compare.
            let frame = self.collapse_duplicate_classes(Frame {
                view: current,
                cols,
            });

            match old_frame {
                Some(fi) => state.frames[fi] = frame,
                None => state.frames.push(frame),
            }
            progressed = true;
        }

        state.pending_maps = remaining;
        Ok(progressed)
    }

    fn finish_maps_or_fail(&mut self, state: &mut ClauseState, context: &str) -> Lower<()> {
        if let Some(map) = state.pending_maps.first() {
            let unbound = map
                .atom
                .variables()
                .next()
                .unwrap_or("_")
                .to_string();
            self.log.error(
                CompileError::UnboundFunctorInput {
                    var: unbound,
                    name: map.atom.name.clone(),
                },
                context,
            );
            return Err(ClauseAborted);
        }
        Ok(())
    }

    /// Collapse every class carried by two distinct columns of one frame
    /// with equality compares, one at a time so the remapping stays fresh.
    fn collapse_duplicate_classes(&mut self, mut frame: Frame) -> Frame {
        loop {
            let mut dup: Option<(ColumnId, ColumnId)> = None;
            let mut seen: Vec<(usize, ColumnId)> = Vec::new();
            for (class, col) in &frame.cols {
                if let Some((_, first)) = seen.iter().find(|(c, _)| c == class) {
                    if first != col {
                        dup = Some((*first, *col));
                        break;
                    }
                } else {
                    seen.push((*class, *col));
                }
            }
            let Some((a, b)) = dup else {
                frame.cols = Self::dedup_frame_cols(frame.cols);
                return frame;
            };
            frame = self.equate_in_frame(frame, a, b);
        }
    }

    /// Collapse duplicate class columns inside one frame with an equality
    /// compare.
    fn equate_in_frame(&mut self, frame: Frame, lhs: ColumnId, rhs: ColumnId) -> Frame {
        let pos_cols: Vec<ColumnId> = frame.cols.iter().map(|(_, c)| *c).collect();
        let (view, mapping) = self.compare_cols(frame.view, &pos_cols, lhs, rhs);
        Frame {
            view,
            cols: frame
                .cols
                .iter()
                .zip(mapping)
                .map(|((class, _), col)| (*class, col))
                .collect(),
        }
    }

    /// Equate a frame column against a column outside the frame (a
    /// constant).
    fn equate_against(&mut self, frame: Frame, lhs: ColumnId, rhs: ColumnId) -> Frame {
        let pos_cols: Vec<ColumnId> = frame.cols.iter().map(|(_, c)| *c).collect();
        let (view, mapping) = self.compare_within(frame.view, &pos_cols, lhs, rhs);
        Frame {
            view,
            cols: frame
                .cols
                .iter()
                .zip(mapping)
                .map(|((class, _), col)| (*class, col))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    /// Bind assignment classes to constant columns. Classes also bound by
    /// atoms get an equality compare once joins have settled.
    fn bind_assignments(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        for assign in &clause.assignments {
            let class = state.classes.intern_var(&assign.var);
            state
                .class_names
                .entry(class)
                .or_insert_with(|| assign.var.clone());
            self.check_class_type(state, class, assign.value.ty, context)?;
            let col = self.query.constant_column(&assign.value);
            state.const_bindings.insert(class, col);
        }
        Ok(())
    }

    /// After joins: any class carried both by a frame and by a constant
    /// binding gets pinned with an equality compare.
    fn apply_constant_equalities(&mut self, state: &mut ClauseState) -> Lower<()> {
        let bindings: Vec<(usize, ColumnId)> =
            state.const_bindings.iter().map(|(c, col)| (*c, *col)).collect();
        for (class, const_col) in bindings {
            for fi in 0..state.frames.len() {
                if let Some(col) = state.frames[fi].col(class) {
                    let frame = state.frames[fi].clone();
                    state.frames[fi] = self.equate_against(frame, col, const_col);
                    // The frame now carries the pinned value; the constant
                    // binding is no longer needed for this class.
                    state.const_bindings.remove(&class);
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    /// One join round: pick the earliest-appearing class shared by several
    /// frames and join every frame carrying it, pivoting on all classes
    /// common to those frames. Returns whether a join was emitted.
    fn join_step(&mut self, state: &mut ClauseState, context: &str) -> Lower<bool> {
        if state.frames.len() < 2 {
            return Ok(false);
        }

        // class -> frame indices carrying it
        let mut carriers: HashMap<usize, Vec<usize>> = HashMap::new();
        for (fi, frame) in state.frames.iter().enumerate() {
            for (class, _) in &frame.cols {
                let entry = carriers.entry(*class).or_default();
                if !entry.contains(&fi) {
                    entry.push(fi);
                }
            }
        }
        let Some(&pivot_class) = carriers
            .iter()
            .filter(|(_, frames)| frames.len() >= 2)
            .map(|(class, _)| class)
            .min()
        else {
            return Ok(false);
        };

        let members = carriers[&pivot_class].clone();
        // Pivot on every class common to all participating frames.
        let mut pivot_classes: Vec<usize> = carriers
            .iter()
            .filter(|(_, frames)| members.iter().all(|fi| frames.contains(fi)))
            .map(|(class, _)| *class)
            .collect();
        pivot_classes.sort_unstable();

        let joined: Vec<ViewId> = members.iter().map(|&fi| state.frames[fi].view).collect();
        let mut pivots: Vec<Vec<ColumnId>> = Vec::new();
        for &class in &pivot_classes {
            let mut set = Vec::new();
            let mut ty: Option<TypeKind> = None;
            for &fi in &members {
                let Some(col) = state.frames[fi].col(class) else {
                    return Err(self.internal(context, "pivot class missing from frame"));
                };
                let col_ty = self.query.column(col).ty();
                if let Some(prev) = ty {
                    if prev != col_ty {
                        self.log.error(
                            CompileError::TypeMismatch {
                                var: state.display_name(class),
                                first: prev.as_str().to_string(),
                                second: col_ty.as_str().to_string(),
                            },
                            context,
                        );
                        return Err(ClauseAborted);
                    }
                } else {
                    ty = Some(col_ty);
                }
                set.push(col);
            }
            pivots.push(set);
        }

        // Non-pivot passthroughs, frame by frame.
        let mut outputs: Vec<ColumnId> = Vec::new();
        let mut output_classes: Vec<Vec<usize>> = Vec::new();
        for &fi in &members {
            for &col in &state.frames[fi].unique_cols() {
                let classes_here: Vec<usize> = state.frames[fi]
                    .cols
                    .iter()
                    .filter(|(_, c)| *c == col)
                    .map(|(class, _)| *class)
                    .filter(|class| !pivot_classes.contains(class))
                    .collect();
                if !classes_here.is_empty() {
                    outputs.push(col);
                    output_classes.push(classes_here);
                }
            }
        }

        let view = self.query.join(joined, pivots, outputs.clone());
        let out = self.query.view(view).columns().to_vec();

        let mut cols: Vec<(usize, ColumnId)> = Vec::new();
        for (i, class) in pivot_classes.iter().enumerate() {
            cols.push((*class, out[i]));
        }
        for (i, classes_here) in output_classes.iter().enumerate() {
            for class in classes_here {
                cols.push((*class, out[pivot_classes.len() + i]));
            }
        }
        // Classes shared by some (not all) joined frames appear twice after
        // the join; collapse them.
        let frame = self.collapse_duplicate_classes(Frame { view, cols });

        // Replace the participating frames with the joint one.
        let mut removed = members;
        removed.sort_unstable();
        for fi in removed.into_iter().rev() {
            state.frames.remove(fi);
        }
        state.frames.push(frame);
        Ok(true)
    }

    fn dedup_frame_cols(cols: Vec<(usize, ColumnId)>) -> Vec<(usize, ColumnId)> {
        let mut out: Vec<(usize, ColumnId)> = Vec::new();
        for (class, col) in cols {
            if !out.iter().any(|(c, _)| *c == class) {
                out.push((class, col));
            }
        }
        out
    }

    /// Join an arbitrary frame list down to one frame, cross-joining only if
    /// the clause permits it.
    fn join_down_to_one(
        &mut self,
        frames: Vec<Frame>,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<Frame> {
        let saved = std::mem::replace(&mut state.frames, frames);
        while self.join_step(state, context)? {}
        let mut frames = std::mem::replace(&mut state.frames, saved);
        match frames.len() {
            0 => Err(self.internal(context, "aggregate over an empty sub-body")),
            1 => Ok(frames.remove(0)),
            _ => {
                if clause.allows_product {
                    Ok(self.cross_join(frames))
                } else {
                    self.log.error(
                        CompileError::UnannotatedCrossProduct {
                            decl: clause.head.name.clone(),
                        },
                        context,
                    );
                    Err(ClauseAborted)
                }
            }
        }
    }

    /// Zero-pivot JOIN over the remaining frames.
    fn cross_join(&mut self, frames: Vec<Frame>) -> Frame {
        let joined: Vec<ViewId> = frames.iter().map(|f| f.view).collect();
        let mut outputs = Vec::new();
        let mut classes: Vec<Vec<usize>> = Vec::new();
        for frame in &frames {
            for &col in &frame.unique_cols() {
                outputs.push(col);
                classes.push(
                    frame
                        .cols
                        .iter()
                        .filter(|(_, c)| *c == col)
                        .map(|(class, _)| *class)
                        .collect(),
                );
            }
        }
        let view = self.query.join(joined, Vec::new(), outputs);
        let out = self.query.view(view).columns().to_vec();
        let mut cols = Vec::new();
        for (i, classes_here) in classes.iter().enumerate() {
            for class in classes_here {
                cols.push((*class, out[i]));
            }
        }
        Frame {
            view,
            cols: Self::dedup_frame_cols(cols),
        }
    }

    /// After joins and maps settle: either a single frame remains, or the
    /// clause needs a cross product (allowed only with `@product`), or some
    /// component is disconnected from the head.
    fn merge_product_frames(
        &mut self,
        clause: &Clause,
        _head_decl: usize,
        head_classes: &[Option<usize>],
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        if state.frames.len() <= 1 {
            return Ok(());
        }
        if clause.allows_product {
            let frames = std::mem::take(&mut state.frames);
            let joint = self.cross_join(frames);
            state.frames.push(joint);
            return Ok(());
        }
        let needed: HashSet<usize> = head_classes.iter().flatten().copied().collect();
        let disconnected = state
            .frames
            .iter()
            .any(|f| !f.cols.iter().any(|(class, _)| needed.contains(class)));
        let err = if disconnected {
            CompileError::DisconnectedBody {
                decl: clause.head.name.clone(),
            }
        } else {
            CompileError::UnannotatedCrossProduct {
                decl: clause.head.name.clone(),
            }
        };
        self.log.error(err, context);
        Err(ClauseAborted)
    }

    // ------------------------------------------------------------------
    // Comparisons
    // ------------------------------------------------------------------

    fn apply_comparisons(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        for cmp in &clause.comparisons {
            let lhs_class = state.classes.class_of(&cmp.lhs);
            let rhs_class = state.classes.class_of(&cmp.rhs);
            let (Some(lhs_class), Some(rhs_class)) = (lhs_class, rhs_class) else {
                let var = if lhs_class.is_none() {
                    cmp.lhs.clone()
                } else {
                    cmp.rhs.clone()
                };
                self.log
                    .error(CompileError::UnboundComparison { var }, context);
                return Err(ClauseAborted);
            };
            if lhs_class == rhs_class {
                self.log.error(
                    CompileError::SelfComparison {
                        var: cmp.lhs.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            }
            let Some(lhs_col) = state.class_col(lhs_class) else {
                self.log.error(
                    CompileError::UnboundComparison {
                        var: cmp.lhs.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            };
            let Some(rhs_col) = state.class_col(rhs_class) else {
                self.log.error(
                    CompileError::UnboundComparison {
                        var: cmp.rhs.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            };

            // The compare runs over the frame that carries at least one
            // operand; a constant operand rides along from outside.
            let fi = state
                .frames
                .iter()
                .position(|f| f.has_class(lhs_class) || f.has_class(rhs_class));
            let Some(fi) = fi else {
                // Both operands constant: still emit the compare so the gate
                // appears in the dataflow; it carries no passthroughs.
                let view = self.query.compare(cmp.op, lhs_col, rhs_col, Vec::new());
                let out = self.query.view(view).columns().to_vec();
                let mut cols = vec![(lhs_class, out[0])];
                if cmp.op.keeps_both() {
                    cols.push((rhs_class, out[1]));
                } else {
                    cols.push((rhs_class, out[0]));
                }
                state.frames.push(Frame { view, cols });
                continue;
            };

            let frame = state.frames[fi].clone();
            let pos_cols: Vec<ColumnId> = frame.cols.iter().map(|(_, c)| *c).collect();
            let mut attached = Vec::new();
            for &col in &pos_cols {
                if col != lhs_col && col != rhs_col && !attached.contains(&col) {
                    attached.push(col);
                }
            }
            let view = self.query.compare(cmp.op, lhs_col, rhs_col, attached.clone());
            let out = self.query.view(view).columns().to_vec();
            let attach_base = if cmp.op.keeps_both() { 2 } else { 1 };
            let mut cols: Vec<(usize, ColumnId)> = Vec::new();
            for (class, col) in &frame.cols {
                let new_col = if *col == lhs_col {
                    out[0]
                } else if *col == rhs_col {
                    if cmp.op.keeps_both() {
                        out[1]
                    } else {
                        out[0]
                    }
                } else {
                    match attached.iter().position(|&a| a == *col) {
                        Some(idx) => out[attach_base + idx],
                        None => out[0],
                    }
                };
                cols.push((*class, new_col));
            }
            // Operands living outside the frame (constants) join it now.
            if !cols.iter().any(|(c, _)| *c == lhs_class) {
                cols.push((lhs_class, out[0]));
            }
            if !cols.iter().any(|(c, _)| *c == rhs_class) {
                cols.push((
                    rhs_class,
                    if cmp.op.keeps_both() { out[1] } else { out[0] },
                ));
            }
            state.frames[fi] = Frame {
                view,
                cols: Self::dedup_frame_cols(cols),
            };
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Negations
    // ------------------------------------------------------------------

    fn apply_negations(
        &mut self,
        clause: &Clause,
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        for neg in &clause.negated {
            let decl = match self.resolve(&neg.atom.name, neg.atom.arity()) {
                Ok(d) => d,
                Err(_) => continue, // reported in collect_pending_maps
            };
            let decl_info = self.decls[decl].clone();
            match decl_info.kind {
                DeclKind::Functor => continue, // lowered as a negated map
                DeclKind::Message => {
                    self.log.error(
                        CompileError::NegatedMessage {
                            name: neg.atom.name.clone(),
                        },
                        context,
                    );
                    return Err(ClauseAborted);
                }
                _ => {}
            }
            if decl_info.inline {
                self.log.error(
                    CompileError::NegatedInline {
                        name: neg.atom.name.clone(),
                    },
                    context,
                );
                return Err(ClauseAborted);
            }
            if neg.atom.arity() == 0 {
                let cond = self.cond_decls[&decl];
                state.negative_conditions.push(cond);
                continue;
            }

            // Resolve the checked columns in argument order.
            let mut checked: Vec<ColumnId> = Vec::new();
            let mut checked_classes: Vec<Option<usize>> = Vec::new();
            for (term, param) in neg.atom.args.iter().zip(decl_info.params.iter()) {
                match term {
                    Term::Literal(lit) => {
                        self.check_literal_type(lit, param.ty, state, context)?;
                        checked.push(self.query.constant_column(lit));
                        checked_classes.push(None);
                    }
                    Term::Variable(name) => {
                        let Some(class) = state.classes.class_of(name) else {
                            self.log.error(
                                CompileError::UnboundNegationArgument {
                                    var: name.clone(),
                                    name: neg.atom.name.clone(),
                                },
                                context,
                            );
                            return Err(ClauseAborted);
                        };
                        self.check_class_type(state, class, param.ty, context)?;
                        let Some(col) = state.class_col(class) else {
                            self.log.error(
                                CompileError::UnboundNegationArgument {
                                    var: name.clone(),
                                    name: neg.atom.name.clone(),
                                },
                                context,
                            );
                            return Err(ClauseAborted);
                        };
                        checked.push(col);
                        checked_classes.push(Some(class));
                    }
                }
            }

            let negated_view = self.merges[&decl];
            let fi = state.frames.iter().position(|f| {
                checked_classes
                    .iter()
                    .flatten()
                    .any(|class| f.has_class(*class))
            });

            let (attached, frame_cols): (Vec<ColumnId>, Vec<(usize, ColumnId)>) = match fi {
                Some(fi) => {
                    let frame = &state.frames[fi];
                    let mut attached = Vec::new();
                    for &col in &frame.unique_cols() {
                        if !checked.contains(&col) {
                            attached.push(col);
                        }
                    }
                    (attached, frame.cols.clone())
                }
                None => (Vec::new(), Vec::new()),
            };

            let view =
                self.query
                    .negate(checked.clone(), attached.clone(), negated_view, neg.never);
            if let Some(&rel) = self.relations.get(&decl) {
                self.query.register_negation(rel, view);
            }
            let out = self.query.view(view).columns().to_vec();

            let mut cols: Vec<(usize, ColumnId)> = Vec::new();
            for (i, class) in checked_classes.iter().enumerate() {
                if let Some(class) = class {
                    cols.push((*class, out[i]));
                }
            }
            for (class, col) in &frame_cols {
                if let Some(idx) = attached.iter().position(|&a| a == *col) {
                    cols.push((*class, out[checked.len() + idx]));
                } else if let Some(idx) = checked.iter().position(|&c| c == *col) {
                    cols.push((*class, out[idx]));
                }
            }
            let frame = Frame {
                view,
                cols: Self::dedup_frame_cols(cols),
            };
            match fi {
                Some(fi) => state.frames[fi] = frame,
                None => state.frames.push(frame),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal
    // ------------------------------------------------------------------

    fn terminate(
        &mut self,
        clause: &Clause,
        head_decl: usize,
        head_classes: &[Option<usize>],
        state: &mut ClauseState,
        context: &str,
    ) -> Lower<()> {
        let decl = self.decls[head_decl].clone();

        // Zero-arity heads set their condition through a one-column tuple
        // driven by the body; a body-free gate falls back to a tag constant.
        if decl.arity() == 0 && decl.kind != DeclKind::Message {
            let input = match state.frames.first() {
                Some(frame) => self.query.view(frame.view).columns()[0],
                None => self.query.tag_column(),
            };
            let tuple = self.query.tuple(vec![input]);
            self.attach_conditions(tuple, state);
            if let Some(color) = clause.highlight {
                self.set_color(tuple, color);
            }
            let cond = self.cond_decls[&head_decl];
            self.query.set_condition(tuple, cond);
            return Ok(());
        }

        // Range restriction: every head variable must be carried by the
        // final frame or pinned to a constant.
        let mut head_cols: Vec<ColumnId> = Vec::new();
        for (term, class) in clause.head.args.iter().zip(head_classes.iter()) {
            match (term, class) {
                (Term::Literal(lit), _) => head_cols.push(self.query.constant_column(lit)),
                (Term::Variable(name), Some(class)) => match state.class_col(*class) {
                    Some(col) => head_cols.push(col),
                    None => {
                        self.log.error(
                            CompileError::NotRangeRestricted {
                                var: name.clone(),
                                decl: decl.name.clone(),
                            },
                            context,
                        );
                        return Err(ClauseAborted);
                    }
                },
                (Term::Variable(name), None) => {
                    self.log.error(
                        CompileError::NotRangeRestricted {
                            var: name.clone(),
                            decl: decl.name.clone(),
                        },
                        context,
                    );
                    return Err(ClauseAborted);
                }
            }
        }

        let tuple = self.query.tuple(head_cols);
        self.attach_conditions(tuple, state);
        if let Some(color) = clause.highlight {
            self.set_color(tuple, color);
        }

        match decl.kind {
            DeclKind::Message => {
                let stream = self.streams[&head_decl];
                let cols = self.query.view(tuple).columns().to_vec();
                self.query.insert_stream(stream, cols);
            }
            _ => {
                let rel = self.relations[&head_decl];
                let producer = if decl.has_mutable_params() {
                    self.interpose_kv_index(&decl, tuple)
                } else {
                    tuple
                };
                let cols = self.query.view(producer).columns().to_vec();
                self.query.insert_relation(rel, cols);
                let merge = self.merges[&head_decl];
                self.query.add_merge_input(merge, producer);
            }
        }
        Ok(())
    }

    /// Declarations with mutable parameters persist through a KV-INDEX keyed
    /// on the immutable parameters; a TUPLE after it restores declaration
    /// order.
    fn interpose_kv_index(&mut self, decl: &Declaration, tuple: ViewId) -> ViewId {
        let cols = self.query.view(tuple).columns().to_vec();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut functors = Vec::new();
        for (i, param) in decl.params.iter().enumerate() {
            match &param.merge_functor {
                Some(f) => {
                    values.push(cols[i]);
                    functors.push(f.clone());
                }
                None => keys.push(cols[i]),
            }
        }
        let n_keys = keys.len();
        let kv = self.query.kv_index(keys, values, functors);
        let kv_cols = self.query.view(kv).columns().to_vec();

        // kv outputs are keys then values; permute back to declaration
        // order.
        let mut restore = Vec::with_capacity(decl.params.len());
        let mut next_key = 0;
        let mut next_value = 0;
        for param in &decl.params {
            if param.merge_functor.is_some() {
                restore.push(kv_cols[n_keys + next_value]);
                next_value += 1;
            } else {
                restore.push(kv_cols[next_key]);
                next_key += 1;
            }
        }
        self.query.tuple(restore)
    }

    fn attach_conditions(&mut self, view: ViewId, state: &ClauseState) {
        for &cond in &state.positive_conditions {
            self.query.add_positive_condition(view, cond);
        }
        for &cond in &state.negative_conditions {
            self.query.add_negative_condition(view, cond);
        }
    }

    fn set_color(&mut self, view: ViewId, color: u16) {
        self.query.set_view_color(view, color);
    }

    fn internal(&mut self, context: &str, message: &str) -> ClauseAborted {
        self.log
            .error(CompileError::Internal(message.to_string()), context);
        ClauseAborted
    }
}
