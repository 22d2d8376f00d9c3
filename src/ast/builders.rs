//! Builder patterns for AST construction.
//!
//! Fluent APIs for assembling declarations, clauses, and modules without a
//! parser. Used heavily in tests and by embedders that generate rules.
//!
//! ## Example
//!
//! ```rust
//! use flowlog::ast::builders::{ClauseBuilder, DeclarationBuilder, ModuleBuilder};
//! use flowlog::ast::{DeclKind, TypeKind};
//!
//! // #message add_edge(u32 A, u32 B).
//! // #local reach(u32 A, u32 B).
//! // reach(A, B) : add_edge(A, B).
//! // reach(A, C) : reach(A, B), add_edge(B, C).
//! let module = ModuleBuilder::new()
//!     .declare(
//!         DeclarationBuilder::new("add_edge", DeclKind::Message)
//!             .param("A", TypeKind::U32)
//!             .param("B", TypeKind::U32),
//!     )
//!     .declare(
//!         DeclarationBuilder::new("reach", DeclKind::Local)
//!             .param("A", TypeKind::U32)
//!             .param("B", TypeKind::U32),
//!     )
//!     .clause(
//!         ClauseBuilder::new("reach").head_vars(["A", "B"])
//!             .body_atom("add_edge", ["A", "B"]),
//!     )
//!     .clause(
//!         ClauseBuilder::new("reach").head_vars(["A", "C"])
//!             .body_atom("reach", ["A", "B"])
//!             .body_atom("add_edge", ["B", "C"]),
//!     )
//!     .build();
//! assert_eq!(module.clauses.len(), 2);
//! ```

use super::{
    AggregateAtom, Assignment, Atom, Binding, Clause, Comparison, ComparisonOp, DeclKind,
    Declaration, FunctorRange, Literal, Module, NegatedAtom, Parameter, Term, TypeKind,
};

// ============================================================================
// AtomBuilder
// ============================================================================

/// Builder for a single predicate application.
#[derive(Debug, Clone)]
pub struct AtomBuilder {
    name: String,
    args: Vec<Term>,
}

impl AtomBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        AtomBuilder {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append a variable argument.
    pub fn var(mut self, name: impl Into<String>) -> Self {
        self.args.push(Term::Variable(name.into()));
        self
    }

    /// Append a literal argument.
    pub fn literal(mut self, lit: Literal) -> Self {
        self.args.push(Term::Literal(lit));
        self
    }

    pub fn build(self) -> Atom {
        Atom {
            name: self.name,
            args: self.args,
        }
    }
}

fn atom_of<I, S>(name: &str, vars: I) -> Atom
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Atom {
        name: name.to_string(),
        args: vars
            .into_iter()
            .map(|v| Term::Variable(v.into()))
            .collect(),
    }
}

// ============================================================================
// DeclarationBuilder
// ============================================================================

/// Builder for a declaration.
#[derive(Debug, Clone)]
pub struct DeclarationBuilder {
    decl: Declaration,
}

impl DeclarationBuilder {
    pub fn new(name: impl Into<String>, kind: DeclKind) -> Self {
        DeclarationBuilder {
            decl: Declaration {
                name: name.into(),
                kind,
                params: Vec::new(),
                range: None,
                is_pure: false,
                inline: false,
                differential: false,
            },
        }
    }

    /// Append an implicitly-bound parameter.
    pub fn param(self, name: impl Into<String>, ty: TypeKind) -> Self {
        self.param_with(name, ty, Binding::Implicit)
    }

    /// Append a parameter with an explicit binding.
    pub fn param_with(mut self, name: impl Into<String>, ty: TypeKind, binding: Binding) -> Self {
        self.decl.params.push(Parameter {
            name: name.into(),
            ty,
            binding,
            merge_functor: None,
        });
        self
    }

    /// Append a mutable parameter merged by the named functor.
    pub fn mutable_param(
        mut self,
        name: impl Into<String>,
        ty: TypeKind,
        merge_functor: impl Into<String>,
    ) -> Self {
        self.decl.params.push(Parameter {
            name: name.into(),
            ty,
            binding: Binding::Implicit,
            merge_functor: Some(merge_functor.into()),
        });
        self
    }

    pub fn range(mut self, range: FunctorRange) -> Self {
        self.decl.range = Some(range);
        self
    }

    pub fn pure(mut self) -> Self {
        self.decl.is_pure = true;
        self
    }

    pub fn inline(mut self) -> Self {
        self.decl.inline = true;
        self
    }

    /// Messages only: published tuples may later be retracted.
    pub fn differential(mut self) -> Self {
        self.decl.differential = true;
        self
    }

    pub fn build(self) -> Declaration {
        self.decl
    }
}

// ============================================================================
// ClauseBuilder
// ============================================================================

/// Builder for a clause.
#[derive(Debug, Clone)]
pub struct ClauseBuilder {
    head_name: String,
    head_args: Vec<Term>,
    clause: Clause,
}

impl ClauseBuilder {
    pub fn new(head_name: impl Into<String>) -> Self {
        ClauseBuilder {
            head_name: head_name.into(),
            head_args: Vec::new(),
            clause: Clause {
                head: Atom {
                    name: String::new(),
                    args: Vec::new(),
                },
                positive: Vec::new(),
                negated: Vec::new(),
                assignments: Vec::new(),
                comparisons: Vec::new(),
                aggregates: Vec::new(),
                disabled: false,
                allows_product: false,
                highlight: None,
            },
        }
    }

    /// Set the head argument list to the given variables.
    pub fn head_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.head_args = vars
            .into_iter()
            .map(|v| Term::Variable(v.into()))
            .collect();
        self
    }

    /// Append a literal head argument.
    pub fn head_literal(mut self, lit: Literal) -> Self {
        self.head_args.push(Term::Literal(lit));
        self
    }

    /// Append a positive body atom over variables.
    pub fn body_atom<I, S>(mut self, name: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clause.positive.push(atom_of(name, vars));
        self
    }

    /// Append an arbitrary positive body atom (e.g. with literal arguments).
    pub fn body(mut self, atom: AtomBuilder) -> Self {
        self.clause.positive.push(atom.build());
        self
    }

    /// Append a negated body atom.
    pub fn negated_atom<I, S>(mut self, name: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clause.negated.push(NegatedAtom {
            atom: atom_of(name, vars),
            never: false,
        });
        self
    }

    /// Append a negated body atom carrying the `@never` hint.
    pub fn negated_never<I, S>(mut self, name: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clause.negated.push(NegatedAtom {
            atom: atom_of(name, vars),
            never: true,
        });
        self
    }

    /// Append `var = literal`.
    pub fn assign(mut self, var: impl Into<String>, value: Literal) -> Self {
        self.clause.assignments.push(Assignment {
            var: var.into(),
            value,
        });
        self
    }

    /// Append `lhs op rhs`.
    pub fn compare(
        mut self,
        lhs: impl Into<String>,
        op: ComparisonOp,
        rhs: impl Into<String>,
    ) -> Self {
        self.clause.comparisons.push(Comparison {
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        self
    }

    /// Append `functor(vars) over (sub-body atoms)`.
    pub fn aggregate<I, S>(mut self, functor: &str, vars: I, body: Vec<Atom>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clause.aggregates.push(AggregateAtom {
            functor: atom_of(functor, vars),
            body,
        });
        self
    }

    /// Mark the clause as disabled by a literal `false`.
    pub fn disabled(mut self) -> Self {
        self.clause.disabled = true;
        self
    }

    /// Permit pivot-free joins (`@product`).
    pub fn allows_product(mut self) -> Self {
        self.clause.allows_product = true;
        self
    }

    /// `@highlight` color for debug output.
    pub fn highlight(mut self, color: u16) -> Self {
        self.clause.highlight = Some(color);
        self
    }

    pub fn build(mut self) -> Clause {
        self.clause.head = Atom {
            name: self.head_name,
            args: self.head_args,
        };
        self.clause
    }
}

// ============================================================================
// ModuleBuilder
// ============================================================================

/// Builder for a whole module.
#[derive(Debug, Clone, Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, decl: DeclarationBuilder) -> Self {
        self.module.declarations.push(decl.build());
        self
    }

    pub fn clause(mut self, clause: ClauseBuilder) -> Self {
        self.module.clauses.push(clause.build());
        self
    }

    pub fn import(mut self, name: impl Into<String>) -> Self {
        self.module.imports.push(name.into());
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

// ============================================================================
// Tests
// ============================================================================
