//! # flowlog
//!
//! A compiler front-end for a Datalog-family rule language, producing a
//! differential dataflow intermediate representation: a graph of relational
//! views (SELECT, JOIN, MERGE, MAP, AGGREGATE, NEGATE, COMPARE, TUPLE,
//! KV-INDEX, INSERT) connected by column use-def edges, optimized to a
//! fixpoint and annotated with induction groups so a backend can schedule
//! recursive fixpoint loops.
//!
//! ## Pipeline
//!
//! ```text
//! ast::Module (built programmatically or deserialized)
//!     ↓
//! [lower]      → Query: views + columns + relations + conditions
//!     ↓
//! [optimize]   → CSE, constant propagation, dead columns, sinking, hints
//!     ↓
//! [induction]  → SCCs, induction groups, strata
//!     ↓
//! [export]     → read-only iterators, use-role visitor, DOT
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use flowlog::ast::builders::{ClauseBuilder, DeclarationBuilder, ModuleBuilder};
//! use flowlog::ast::{DeclKind, TypeKind};
//! use flowlog::{compile, CompileOptions, ErrorLog};
//!
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
//!
//! let mut log = ErrorLog::new();
//! let query = compile(&[module], &CompileOptions::default(), &mut log)
//!     .expect("well-formed modules compile");
//! assert_eq!(query.merges().count(), 1);
//! ```
//!
//! ## Module organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ast` | Parser-facing AST plus fluent builders |
//! | `defuse` | Arenas, typed ids, use lists, timestamps |
//! | `query` | The dataflow IR and its structural invariants |
//! | `lower` | Clause-to-IR lowering |
//! | `optimize` | Rewrite passes to a fixpoint |
//! | `induction` | SCCs, induction groups, strata |
//! | `export` | Read-only backend surface and DOT output |
//! | `error` | Diagnostic taxonomy and the append-only log |

pub mod ast;
pub mod config;
pub mod defuse;
pub mod error;
pub mod export;
pub mod induction;
pub mod lower;
pub mod optimize;
pub mod query;

pub use config::CompileOptions;
pub use error::{CompileError, Diagnostic, ErrorLog, Severity};
pub use optimize::Optimizer;
pub use query::{Query, View, ViewKind};

use tracing::debug;

/// Run the whole front-end: lowering, optimization, induction analysis.
///
/// Returns the finished [`Query`] unless a stage appended a fatal
/// diagnostic. Recoverable errors accumulate on `log`; callers that want to
/// gate code generation on a clean compile should also consult
/// [`ErrorLog::has_errors`].
pub fn compile(
    modules: &[ast::Module],
    options: &CompileOptions,
    log: &mut ErrorLog,
) -> Option<Query> {
    let mut query = lower::build(modules, log)?;

    if !options.skip_optimizer {
        let optimizer = Optimizer::with_max_rounds(options.max_optimizer_rounds);
        if !optimizer.run(&mut query, log) {
            return None;
        }
    }

    if !induction::analyze(&mut query, log) {
        return None;
    }

    debug!(
        views = query.num_views(),
        columns = query.num_columns(),
        "compilation finished"
    );
    Some(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{ClauseBuilder, DeclarationBuilder, ModuleBuilder};
    use crate::ast::{DeclKind, TypeKind};

    #[test]
    fn test_compile_smoke() {
        let module = ModuleBuilder::new()
            .declare(
                DeclarationBuilder::new("p", DeclKind::Message).param("X", TypeKind::U64),
            )
            .declare(
                DeclarationBuilder::new("q", DeclKind::Local).param("X", TypeKind::U64),
            )
            .clause(
                ClauseBuilder::new("q")
                    .head_vars(["X"])
                    .body_atom("p", ["X"]),
            )
            .build();
        let mut log = ErrorLog::new();
        let query = compile(&[module], &CompileOptions::default(), &mut log).unwrap();
        assert!(!log.has_errors());
        assert_eq!(query.inserts().count(), 1);
        query.check_invariants().unwrap();
    }

    #[test]
    fn test_compile_skip_optimizer() {
        let module = ModuleBuilder::new()
            .declare(
                DeclarationBuilder::new("p", DeclKind::Message).param("X", TypeKind::U64),
            )
            .declare(
                DeclarationBuilder::new("q", DeclKind::Local).param("X", TypeKind::U64),
            )
            .clause(
                ClauseBuilder::new("q")
                    .head_vars(["X"])
                    .body_atom("p", ["X"]),
            )
            .build();
        let options = CompileOptions {
            skip_optimizer: true,
            ..CompileOptions::default()
        };
        let mut log = ErrorLog::new();
        let query = compile(&[module], &options, &mut log).unwrap();
        // The single-input merge survives when the optimizer is skipped.
        assert_eq!(query.merges().count(), 1);
    }
}
