//! # Rule AST — parser-facing surface
//!
//! The shapes the lowering consumes: modules full of declarations and
//! clauses. Construction is a parser concern and happens elsewhere; tests and
//! embedders assemble these programmatically through the fluent APIs in
//! [`builders`], or deserialize them from JSON.
//!
//! Two textual variables with the same name inside one clause share an
//! identity (the "first appearance" rule); the lowering resolves this with a
//! union-find, so the AST just carries names.

use serde::{Deserialize, Serialize};

pub mod builders;

// ============================================================================
// Types and literals
// ============================================================================

/// Semantic column/parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Utf8,
    Ascii,
    Uuid,
    Bytes,
    /// A named foreign type, identified by its declaration index.
    Foreign(u32),
}

impl TypeKind {
    /// Spelled the way declarations spell it.
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Bool => "bool",
            TypeKind::I8 => "i8",
            TypeKind::I16 => "i16",
            TypeKind::I32 => "i32",
            TypeKind::I64 => "i64",
            TypeKind::U8 => "u8",
            TypeKind::U16 => "u16",
            TypeKind::U32 => "u32",
            TypeKind::U64 => "u64",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Utf8 => "utf8",
            TypeKind::Ascii => "ascii",
            TypeKind::Uuid => "uuid",
            TypeKind::Bytes => "bytes",
            TypeKind::Foreign(_) => "foreign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bool" => Some(TypeKind::Bool),
            "i8" => Some(TypeKind::I8),
            "i16" => Some(TypeKind::I16),
            "i32" => Some(TypeKind::I32),
            "i64" => Some(TypeKind::I64),
            "u8" => Some(TypeKind::U8),
            "u16" => Some(TypeKind::U16),
            "u32" => Some(TypeKind::U32),
            "u64" => Some(TypeKind::U64),
            "f32" => Some(TypeKind::F32),
            "f64" => Some(TypeKind::F64),
            "utf8" => Some(TypeKind::Utf8),
            "ascii" => Some(TypeKind::Ascii),
            "uuid" => Some(TypeKind::Uuid),
            "bytes" => Some(TypeKind::Bytes),
            _ => None,
        }
    }
}

/// A compile-time literal: a type plus its token spelling.
///
/// Keeping the spelling rather than a decoded value gives literals `Eq` and
/// `Hash` regardless of type (float spellings compare textually), which is
/// what constant deduplication keys on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    pub ty: TypeKind,
    pub spelling: String,
}

impl Literal {
    pub fn new(ty: TypeKind, spelling: impl Into<String>) -> Self {
        Literal {
            ty,
            spelling: spelling.into(),
        }
    }

    pub fn unsigned(value: u64) -> Self {
        Literal::new(TypeKind::U64, value.to_string())
    }

    pub fn signed(value: i64) -> Self {
        Literal::new(TypeKind::I64, value.to_string())
    }

    pub fn boolean(value: bool) -> Self {
        Literal::new(TypeKind::Bool, if value { "true" } else { "false" })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Literal::new(TypeKind::Utf8, value)
    }

    pub fn typed_unsigned(ty: TypeKind, value: u64) -> Self {
        Literal::new(ty, value.to_string())
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.spelling, self.ty.as_str())
    }
}

// ============================================================================
// Terms, atoms, clauses
// ============================================================================

/// A variable or a literal in an atom argument position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Variable(String),
    Literal(Literal),
}

impl Term {
    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal(_))
    }

    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            Term::Literal(_) => None,
        }
    }
}

/// One predicate application: `name(arg, arg, ...)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub name: String,
    pub args: Vec<Term>,
}

impl Atom {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Term::variable_name)
    }
}

/// A negated predicate, optionally carrying the `@never` hint asserting that
/// tuples which pass the absence test are never later retracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegatedAtom {
    pub atom: Atom,
    pub never: bool,
}

/// `variable = literal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub var: String,
    pub value: Literal,
}

/// Binary comparison operators over two body terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Gt => ">",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" | "==" => Some(ComparisonOp::Eq),
            "!=" => Some(ComparisonOp::Ne),
            "<" => Some(ComparisonOp::Lt),
            ">" => Some(ComparisonOp::Gt),
            _ => None,
        }
    }

    /// Whether the comparison keeps both operand columns in its output.
    /// Equality merges the operands into one column; the others keep both.
    pub fn keeps_both(&self) -> bool {
        !matches!(self, ComparisonOp::Eq)
    }
}

/// `lhs op rhs` over two variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub op: ComparisonOp,
    pub lhs: String,
    pub rhs: String,
}

/// An aggregating functor applied over a sub-body:
/// `functor(args) over (atom, atom, ...)`.
///
/// The sub-body is restricted to positive predicates; it is lowered as a
/// synthetic single-clause inline declaration referenced by the AGGREGATE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateAtom {
    pub functor: Atom,
    pub body: Vec<Atom>,
}

/// A Horn-style clause: `head : body.`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub head: Atom,
    pub positive: Vec<Atom>,
    pub negated: Vec<NegatedAtom>,
    pub assignments: Vec<Assignment>,
    pub comparisons: Vec<Comparison>,
    pub aggregates: Vec<AggregateAtom>,
    /// Disabled by a literal `false` in the body; dropped before lowering.
    #[serde(default)]
    pub disabled: bool,
    /// `@product` annotation permitting pivot-free joins.
    #[serde(default)]
    pub allows_product: bool,
    /// `@highlight` color carried through to debug output.
    #[serde(default)]
    pub highlight: Option<u16>,
}

impl Clause {
    /// Every variable mentioned anywhere in the clause, in first-appearance
    /// order, without duplicates.
    pub fn variables(&self) -> Vec<&str> {
        fn push<'a>(seen: &mut Vec<&'a str>, name: &'a str) {
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        let mut seen: Vec<&str> = Vec::new();
        for term in &self.head.args {
            if let Some(v) = term.variable_name() {
                push(&mut seen, v);
            }
        }
        for atom in &self.positive {
            for v in atom.variables() {
                push(&mut seen, v);
            }
        }
        for neg in &self.negated {
            for v in neg.atom.variables() {
                push(&mut seen, v);
            }
        }
        for assign in &self.assignments {
            push(&mut seen, assign.var.as_str());
        }
        for cmp in &self.comparisons {
            push(&mut seen, cmp.lhs.as_str());
            push(&mut seen, cmp.rhs.as_str());
        }
        for agg in &self.aggregates {
            for v in agg.functor.variables() {
                push(&mut seen, v);
            }
            for atom in &agg.body {
                for v in atom.variables() {
                    push(&mut seen, v);
                }
            }
        }
        seen
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// What a declaration names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeclKind {
    /// Point/range lookup entry point; backed by a relation.
    Query,
    /// Streaming input (receive) or output (publish); backed by an IO stream.
    Message,
    /// Pure or aggregating function implemented outside the dataflow.
    Functor,
    /// Persisted relation visible to importing modules.
    Export,
    /// Persisted relation private to its module.
    Local,
}

impl DeclKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclKind::Query => "query",
            DeclKind::Message => "message",
            DeclKind::Functor => "functor",
            DeclKind::Export => "export",
            DeclKind::Local => "local",
        }
    }

    /// Whether declarations of this kind are backed by a relation.
    pub fn has_relation(&self) -> bool {
        matches!(self, DeclKind::Query | DeclKind::Export | DeclKind::Local)
    }
}

/// How a parameter binds at a use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Binding {
    /// Must be supplied by the caller / bound before the functor runs.
    Bound,
    /// Produced by the functor or free at the use site.
    Free,
    /// Fed into an aggregating functor, one value per input tuple.
    Aggregate,
    /// Produced once per group by an aggregating functor.
    Summary,
    /// Either bound or free; the lowering decides per use site.
    Implicit,
}

/// How many outputs a functor produces per input tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctorRange {
    OneToOne,
    ZeroOrOne,
    OneOrMore,
    ZeroOrMore,
}

impl FunctorRange {
    /// Ranges that guarantee at least one output; negating such a functor is
    /// statically empty and therefore rejected.
    pub fn guarantees_output(&self) -> bool {
        matches!(self, FunctorRange::OneToOne | FunctorRange::OneOrMore)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeKind,
    pub binding: Binding,
    /// Name of the merge functor for a mutable parameter. Declarations with
    /// any mutable parameter are backed by a KV-INDEX keyed on the immutable
    /// parameters.
    #[serde(default)]
    pub merge_functor: Option<String>,
}

/// A named predicate/functor declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    pub params: Vec<Parameter>,
    /// Functors only.
    #[serde(default)]
    pub range: Option<FunctorRange>,
    #[serde(default)]
    pub is_pure: bool,
    /// `@inline` pragma; inline declarations cannot be negated.
    #[serde(default)]
    pub inline: bool,
    /// Messages only: tuples may be retracted after being published.
    #[serde(default)]
    pub differential: bool,
}

impl Declaration {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_aggregating(&self) -> bool {
        self.kind == DeclKind::Functor
            && self
                .params
                .iter()
                .any(|p| matches!(p.binding, Binding::Aggregate | Binding::Summary))
    }

    pub fn has_mutable_params(&self) -> bool {
        self.params.iter().any(|p| p.merge_functor.is_some())
    }

    pub fn param_types(&self) -> Vec<TypeKind> {
        self.params.iter().map(|p| p.ty).collect()
    }

    /// Parameters with a given binding, in declaration order.
    pub fn params_with(&self, binding: Binding) -> impl Iterator<Item = (usize, &Parameter)> {
        self.params
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.binding == binding)
    }
}

// ============================================================================
// Modules
// ============================================================================

/// Inline code block passed through to a backend verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineCode {
    pub language: String,
    pub code: String,
}

/// A foreign type declaration: an opaque type named by the host language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignType {
    pub name: String,
}

/// A named constant of a foreign type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignConstant {
    pub name: String,
    pub ty: String,
    pub spelling: String,
}

/// One source module: declarations and the clauses defining them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub inlines: Vec<InlineCode>,
    #[serde(default)]
    pub foreign_types: Vec<ForeignType>,
    #[serde(default)]
    pub foreign_constants: Vec<ForeignConstant>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_kind_round_trip() {
        for ty in [
            TypeKind::Bool,
            TypeKind::U32,
            TypeKind::I64,
            TypeKind::F64,
            TypeKind::Utf8,
            TypeKind::Uuid,
            TypeKind::Bytes,
        ] {
            assert_eq!(TypeKind::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TypeKind::parse("varchar"), None);
    }

    #[test]
    fn test_literal_identity_is_textual() {
        assert_eq!(Literal::unsigned(7), Literal::unsigned(7));
        assert_ne!(Literal::unsigned(7), Literal::signed(7));
        assert_ne!(
            Literal::new(TypeKind::F64, "1.0"),
            Literal::new(TypeKind::F64, "1.00")
        );
    }

    #[test]
    fn test_comparison_op_parse() {
        assert_eq!(ComparisonOp::parse("="), Some(ComparisonOp::Eq));
        assert_eq!(ComparisonOp::parse("=="), Some(ComparisonOp::Eq));
        assert_eq!(ComparisonOp::parse("!="), Some(ComparisonOp::Ne));
        assert_eq!(ComparisonOp::parse("<"), Some(ComparisonOp::Lt));
        assert_eq!(ComparisonOp::parse(">"), Some(ComparisonOp::Gt));
        assert_eq!(ComparisonOp::parse("<="), None);
        assert!(!ComparisonOp::Eq.keeps_both());
        assert!(ComparisonOp::Lt.keeps_both());
    }

    #[test]
    fn test_functor_range_guarantees() {
        assert!(FunctorRange::OneToOne.guarantees_output());
        assert!(FunctorRange::OneOrMore.guarantees_output());
        assert!(!FunctorRange::ZeroOrOne.guarantees_output());
        assert!(!FunctorRange::ZeroOrMore.guarantees_output());
    }

    #[test]
    fn test_clause_variables_first_appearance_order() {
        let clause = Clause {
            head: Atom {
                name: "r".to_string(),
                args: vec![
                    Term::Variable("A".to_string()),
                    Term::Variable("C".to_string()),
                ],
            },
            positive: vec![Atom {
                name: "e".to_string(),
                args: vec![
                    Term::Variable("A".to_string()),
                    Term::Variable("B".to_string()),
                ],
            }],
            negated: vec![],
            assignments: vec![],
            comparisons: vec![Comparison {
                op: ComparisonOp::Lt,
                lhs: "B".to_string(),
                rhs: "C".to_string(),
            }],
            aggregates: vec![],
            disabled: false,
            allows_product: false,
            highlight: None,
        };
        assert_eq!(clause.variables(), vec!["A", "C", "B"]);
    }

    #[test]
    fn test_module_json_round_trip() {
        let module = Module {
            declarations: vec![Declaration {
                name: "add_edge".to_string(),
                kind: DeclKind::Message,
                params: vec![
                    Parameter {
                        name: "A".to_string(),
                        ty: TypeKind::U32,
                        binding: Binding::Implicit,
                        merge_functor: None,
                    },
                    Parameter {
                        name: "B".to_string(),
                        ty: TypeKind::U32,
                        binding: Binding::Implicit,
                        merge_functor: None,
                    },
                ],
                range: None,
                is_pure: false,
                inline: false,
                differential: false,
            }],
            ..Module::default()
        };
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(module, back);
    }

    #[test]
    fn test_aggregating_detection() {
        let decl = Declaration {
            name: "count_i".to_string(),
            kind: DeclKind::Functor,
            params: vec![
                Parameter {
                    name: "X".to_string(),
                    ty: TypeKind::U32,
                    binding: Binding::Aggregate,
                    merge_functor: None,
                },
                Parameter {
                    name: "N".to_string(),
                    ty: TypeKind::U32,
                    binding: Binding::Summary,
                    merge_functor: None,
                },
            ],
            range: Some(FunctorRange::OneToOne),
            is_pure: true,
            inline: false,
            differential: false,
        };
        assert!(decl.is_aggregating());
        assert!(!decl.has_mutable_params());
    }
}
