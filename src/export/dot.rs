//! GraphViz rendering of the dataflow graph.
//!
//! One node per view, labelled with its stable debug form; edges follow
//! strong uses from definer to user. Highlight colors from `@highlight`
//! pragmas survive into fill colors.

use std::fmt::Write;

use crate::query::{Query, SinkTarget, Source, ViewKind};

/// Render `query` as a DOT digraph.
pub fn to_dot(query: &Query) -> String {
    let mut out = String::new();
    let _ = write_dot(query, &mut out);
    out
}

pub fn write_dot(query: &Query, out: &mut impl Write) -> std::fmt::Result {
    writeln!(out, "digraph dataflow {{")?;
    writeln!(out, "  rankdir=BT;")?;
    writeln!(out, "  node [shape=box, fontname=\"monospace\"];")?;

    // Relations and streams as storage nodes.
    for (_, rel) in query.relations() {
        writeln!(
            out,
            "  rel_{} [label=\"relation {}\", shape=cylinder];",
            rel.uid(),
            rel.name()
        )?;
    }
    for (_, stream) in query.streams() {
        let marker = if stream.is_differential() { " (diff)" } else { "" };
        writeln!(
            out,
            "  io_{} [label=\"stream {}{marker}\", shape=parallelogram];",
            stream.uid(),
            stream.name()
        )?;
    }
    for (_, cond) in query.conditions() {
        writeln!(
            out,
            "  cond_{} [label=\"condition {}\", shape=diamond];",
            cond.uid(),
            cond.name().unwrap_or("<anon>")
        )?;
    }

    for (id, view) in query.views() {
        let label = query.debug_view(id).replace('"', "\\\"");
        let style = match view.color() {
            // Twelve-way categorical scheme; highlight colors wrap around.
            Some(color) => format!(
                ", style=filled, colorscheme=set312, fillcolor={}",
                (color % 12) + 1
            ),
            None => String::new(),
        };
        writeln!(out, "  v{} [label=\"{label}\"{style}];", view.uid())?;

        for pred in query.predecessors(id) {
            writeln!(
                out,
                "  v{} -> v{};",
                query.view(pred).uid(),
                view.uid()
            )?;
        }

        match view.kind() {
            ViewKind::Insert { target, .. } => match target {
                SinkTarget::Relation(rel) => {
                    writeln!(out, "  v{} -> rel_{};", view.uid(), query.relation(*rel).uid())?;
                }
                SinkTarget::Stream(s) => {
                    writeln!(out, "  v{} -> io_{};", view.uid(), query.stream(*s).uid())?;
                }
            },
            ViewKind::Select { source } => match source {
                Source::Relation(rel) => {
                    writeln!(out, "  rel_{} -> v{};", query.relation(*rel).uid(), view.uid())?;
                }
                Source::Stream(s) => {
                    writeln!(out, "  io_{} -> v{};", query.stream(*s).uid(), view.uid())?;
                }
                Source::Literal(_) | Source::Tag(_) => {}
            },
            _ => {}
        }

        if let Some(cond) = view.sets_condition() {
            writeln!(
                out,
                "  v{} -> cond_{} [style=dashed];",
                view.uid(),
                query.condition(cond).uid()
            )?;
        }
        for &cond in view.positive_conditions() {
            writeln!(
                out,
                "  cond_{} -> v{} [style=dashed, label=\"+\"];",
                query.condition(cond).uid(),
                view.uid()
            )?;
        }
        for &cond in view.negative_conditions() {
            writeln!(
                out,
                "  cond_{} -> v{} [style=dashed, label=\"-\"];",
                query.condition(cond).uid(),
                view.uid()
            )?;
        }
    }

    writeln!(out, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeKind;

    #[test]
    fn test_dot_structure() {
        let mut query = Query::new();
        let rel = query.add_relation("edge", vec![TypeKind::U32, TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(cols);
        let tcols = query.view(tuple).columns().to_vec();
        let _insert = query.insert_relation(rel, tcols);

        let dot = to_dot(&query);
        assert!(dot.starts_with("digraph dataflow {"));
        assert!(dot.contains("relation edge"));
        assert!(dot.contains("SELECT"));
        assert!(dot.contains("->"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_dot_preserves_highlight_color() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let tuple = query.tuple(cols);
        query.set_view_color(tuple, 3);

        let dot = to_dot(&query);
        assert!(dot.contains("colorscheme=set312"));
        assert!(dot.contains("fillcolor=4"));
    }
}
