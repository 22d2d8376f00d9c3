//! # Backend surface
//!
//! Read-only views over a finished [`Query`] for code generators: per-kind
//! iterators, the `(input column, role, output column)` use visitor, relation
//! and stream user lists, and stable debug rendering. Everything here takes
//! `&Query`; the type system is the guarantee that backends cannot mutate
//! the IR through these handles.

pub mod dot;

use crate::ast::Literal;
use crate::query::{
    ColumnId, ConditionId, InputColumnRole, Query, RelationId, SinkTarget, Source, StreamId,
    View, ViewId, ViewKind,
};

impl Query {
    // ------------------------------------------------------------------
    // Per-kind iterators
    // ------------------------------------------------------------------

    pub fn selects(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| {
            matches!(v.kind(), ViewKind::Select { source } if !source.is_constant())
        })
    }

    pub fn tuples(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| v.kind().is_tuple())
    }

    pub fn joins(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| v.kind().is_join())
    }

    pub fn merges(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| v.kind().is_merge())
    }

    pub fn maps(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views()
            .filter(|(_, v)| matches!(v.kind(), ViewKind::Map { .. }))
    }

    pub fn aggregates(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views()
            .filter(|(_, v)| matches!(v.kind(), ViewKind::Aggregate { .. }))
    }

    pub fn negates(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| v.kind().is_negate())
    }

    pub fn compares(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views()
            .filter(|(_, v)| matches!(v.kind(), ViewKind::Compare { .. }))
    }

    pub fn inserts(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views().filter(|(_, v)| v.kind().is_insert())
    }

    pub fn kv_indices(&self) -> impl Iterator<Item = (ViewId, &View)> {
        self.views()
            .filter(|(_, v)| matches!(v.kind(), ViewKind::KvIndex { .. }))
    }

    /// Literal constants, as `(view, literal)` pairs.
    pub fn constants(&self) -> impl Iterator<Item = (ViewId, &Literal)> {
        self.views().filter_map(|(id, v)| match v.kind() {
            ViewKind::Select {
                source: Source::Literal(lit),
            } => Some((id, lit)),
            _ => None,
        })
    }

    /// Compiler-invented 16-bit tags, as `(view, tag)` pairs.
    pub fn tags(&self) -> impl Iterator<Item = (ViewId, u16)> + use<'_> {
        self.views().filter_map(|(id, v)| match v.kind() {
            ViewKind::Select {
                source: Source::Tag(t),
            } => Some((id, *t)),
            _ => None,
        })
    }

    // ------------------------------------------------------------------
    // Relation / stream user lists
    // ------------------------------------------------------------------

    pub fn relation_inserts(&self, rel: RelationId) -> impl Iterator<Item = ViewId> + '_ {
        self.relation(rel).inserts.iter_live(&self.views)
    }

    pub fn relation_selects(&self, rel: RelationId) -> impl Iterator<Item = ViewId> + '_ {
        self.relation(rel).selects.iter_live(&self.views)
    }

    pub fn relation_negations(&self, rel: RelationId) -> impl Iterator<Item = ViewId> + '_ {
        self.relation(rel).negations.iter_live(&self.views)
    }

    pub fn stream_transmits(&self, stream: StreamId) -> impl Iterator<Item = ViewId> + '_ {
        self.stream(stream).transmits.iter_live(&self.views)
    }

    pub fn stream_receives(&self, stream: StreamId) -> impl Iterator<Item = ViewId> + '_ {
        self.stream(stream).receives.iter_live(&self.views)
    }

    pub fn condition_setters(&self, cond: ConditionId) -> impl Iterator<Item = ViewId> + '_ {
        self.condition(cond).setters.iter_live(&self.views)
    }

    pub fn condition_positive_users(&self, cond: ConditionId) -> impl Iterator<Item = ViewId> + '_ {
        self.condition(cond).positive_users.iter_live(&self.views)
    }

    pub fn condition_negative_users(&self, cond: ConditionId) -> impl Iterator<Item = ViewId> + '_ {
        self.condition(cond).negative_users.iter_live(&self.views)
    }

    // ------------------------------------------------------------------
    // Use visitor
    // ------------------------------------------------------------------

    /// Visit every input use of `view` as `(input column, role, output
    /// column)`. The output column is absent for inputs that are consumed
    /// rather than forwarded (functor inputs, aggregated columns, insert
    /// inputs). Order is unspecified.
    pub fn for_each_use(
        &self,
        view: ViewId,
        mut cb: impl FnMut(ColumnId, InputColumnRole, Option<ColumnId>),
    ) {
        let _guard = self.timeline.freeze();
        let v = self.view(view);
        let out = v.columns();
        match v.kind() {
            ViewKind::Select { .. } => {}
            ViewKind::Tuple { inputs } => {
                for (i, &input) in inputs.iter().enumerate() {
                    cb(input, InputColumnRole::Copied, Some(out[i]));
                }
            }
            ViewKind::KvIndex { keys, values, .. } => {
                for (i, &key) in keys.iter().enumerate() {
                    cb(key, InputColumnRole::IndexKey, Some(out[i]));
                }
                for (i, &value) in values.iter().enumerate() {
                    cb(value, InputColumnRole::IndexValue, Some(out[keys.len() + i]));
                }
            }
            ViewKind::Join {
                pivots, outputs, ..
            } => {
                for (s, set) in pivots.iter().enumerate() {
                    for &member in set {
                        cb(member, InputColumnRole::JoinPivot, Some(out[s]));
                    }
                }
                for (i, &passthrough) in outputs.iter().enumerate() {
                    cb(
                        passthrough,
                        InputColumnRole::JoinNonPivot,
                        Some(out[pivots.len() + i]),
                    );
                }
            }
            ViewKind::Map {
                inputs, attached, ..
            } => {
                for &input in inputs {
                    cb(input, InputColumnRole::FunctorInput, None);
                }
                let base = out.len() - attached.len();
                for (i, &a) in attached.iter().enumerate() {
                    cb(a, InputColumnRole::Copied, Some(out[base + i]));
                }
            }
            ViewKind::Aggregate {
                group,
                config,
                aggregated,
                ..
            } => {
                for (i, &g) in group.iter().enumerate() {
                    cb(g, InputColumnRole::AggregateGroup, Some(out[i]));
                }
                for (i, &c) in config.iter().enumerate() {
                    cb(c, InputColumnRole::AggregateConfig, Some(out[group.len() + i]));
                }
                for &a in aggregated {
                    cb(a, InputColumnRole::AggregatedColumn, None);
                }
            }
            ViewKind::Merge { inputs } => {
                for &input in inputs {
                    let in_cols = self.view(input).columns();
                    for (i, &c) in in_cols.iter().enumerate() {
                        cb(c, InputColumnRole::MergedColumn, Some(out[i]));
                    }
                }
            }
            ViewKind::Negate {
                checked, attached, ..
            } => {
                for (i, &c) in checked.iter().enumerate() {
                    cb(c, InputColumnRole::Negated, Some(out[i]));
                }
                for (i, &a) in attached.iter().enumerate() {
                    cb(a, InputColumnRole::Copied, Some(out[checked.len() + i]));
                }
            }
            ViewKind::Compare {
                op, lhs, rhs, attached,
            } => {
                cb(*lhs, InputColumnRole::CompareLhs, Some(out[0]));
                let rhs_out = if op.keeps_both() { out[1] } else { out[0] };
                cb(*rhs, InputColumnRole::CompareRhs, Some(rhs_out));
                let base = if op.keeps_both() { 2 } else { 1 };
                for (i, &a) in attached.iter().enumerate() {
                    cb(a, InputColumnRole::Copied, Some(out[base + i]));
                }
            }
            ViewKind::Insert { target, inputs } => {
                let role = match target {
                    SinkTarget::Relation(_) => InputColumnRole::Materialized,
                    SinkTarget::Stream(_) => InputColumnRole::Published,
                };
                for &input in inputs {
                    cb(input, role, None);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Debug rendering
    // ------------------------------------------------------------------

    /// Stable, human-readable one-line form: kind, unique id, inputs as
    /// `view:index`, and the attributes that distinguish the view.
    pub fn debug_view(&self, id: ViewId) -> String {
        let view = self.view(id);
        let col_ref = |c: ColumnId| {
            let col = self.column(c);
            format!("{}:{}", self.view(col.defining_view()).uid(), col.index())
        };
        let col_list =
            |cols: &[ColumnId]| cols.iter().map(|&c| col_ref(c)).collect::<Vec<_>>().join(", ");

        let body = match view.kind() {
            ViewKind::Select { source } => match source {
                Source::Relation(rel) => format!("relation {}", self.relation(*rel).name()),
                Source::Stream(s) => format!("stream {}", self.stream(*s).name()),
                Source::Literal(lit) => format!("const {lit}"),
                Source::Tag(t) => format!("tag {t}"),
            },
            ViewKind::Tuple { inputs } => col_list(inputs),
            ViewKind::KvIndex {
                keys,
                values,
                merge_functors,
            } => format!(
                "keys=[{}] values=[{}] via {}",
                col_list(keys),
                col_list(values),
                merge_functors.join(", ")
            ),
            ViewKind::Join { pivots, outputs, .. } => {
                let sets = pivots
                    .iter()
                    .map(|set| format!("{{{}}}", col_list(set)))
                    .collect::<Vec<_>>()
                    .join(" ");
                if outputs.is_empty() {
                    sets
                } else {
                    format!("{sets} pass=[{}]", col_list(outputs))
                }
            }
            ViewKind::Map {
                functor,
                negated,
                inputs,
                attached,
                ..
            } => format!(
                "{}{functor}({}) pass=[{}]",
                if *negated { "!" } else { "" },
                col_list(inputs),
                col_list(attached)
            ),
            ViewKind::Aggregate {
                functor,
                group,
                config,
                aggregated,
            } => format!(
                "{functor} group=[{}] config=[{}] over=[{}]",
                col_list(group),
                col_list(config),
                col_list(aggregated)
            ),
            ViewKind::Merge { inputs } => inputs
                .iter()
                .map(|&v| self.view(v).uid().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            ViewKind::Negate {
                checked,
                negated,
                never,
                ..
            } => format!(
                "!{} [{}]{}",
                self.view(*negated).uid(),
                col_list(checked),
                if *never { " @never" } else { "" }
            ),
            ViewKind::Compare {
                op, lhs, rhs, ..
            } => format!("{} {} {}", col_ref(*lhs), op.as_str(), col_ref(*rhs)),
            ViewKind::Insert { target, inputs } => {
                let dest = match target {
                    SinkTarget::Relation(rel) => self.relation(*rel).name().to_string(),
                    SinkTarget::Stream(s) => self.stream(*s).name().to_string(),
                };
                format!("{dest} [{}]", col_list(inputs))
            }
        };
        format!("{}<{}>[{}]", view.kind().kind_name(), view.uid(), body)
    }

    /// Multi-line listing of every live view in uid order, for the driver's
    /// default output and for snapshot-style assertions.
    pub fn debug_listing(&self) -> String {
        let mut entries: Vec<(u32, String)> = self
            .views()
            .map(|(id, v)| {
                let mut line = self.debug_view(id);
                if let Some(group) = v.induction_group() {
                    line.push_str(&format!(" @group({group})"));
                }
                if let Some(stratum) = v.stratum() {
                    line.push_str(&format!(" @stratum({stratum})"));
                }
                (v.uid(), line)
            })
            .collect();
        entries.sort_by_key(|(uid, _)| *uid);
        let mut out = String::new();
        for (_, line) in entries {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ComparisonOp, TypeKind};

    #[test]
    fn test_for_each_use_roles_on_join() {
        let mut query = Query::new();
        let left = query.add_relation("l", vec![TypeKind::U32, TypeKind::U32]);
        let right = query.add_relation("r", vec![TypeKind::U32, TypeKind::U32]);
        let sl = query.select_relation(left);
        let sr = query.select_relation(right);
        let lc = query.view(sl).columns().to_vec();
        let rc = query.view(sr).columns().to_vec();
        let join = query.join(vec![sl, sr], vec![vec![lc[0], rc[0]]], vec![lc[1], rc[1]]);

        let mut roles = Vec::new();
        query.for_each_use(join, |input, role, output| {
            roles.push((input, role, output));
        });
        assert_eq!(roles.len(), 4);
        assert_eq!(
            roles
                .iter()
                .filter(|(_, r, _)| *r == InputColumnRole::JoinPivot)
                .count(),
            2
        );
        assert_eq!(
            roles
                .iter()
                .filter(|(_, r, _)| *r == InputColumnRole::JoinNonPivot)
                .count(),
            2
        );
        // Every use has an output column on a join.
        assert!(roles.iter().all(|(_, _, out)| out.is_some()));
    }

    #[test]
    fn test_for_each_use_merge_positions() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let t1 = query.tuple(cols.clone());
        let t2 = query.tuple(cols);
        let merge = query.merge(&[(TypeKind::U32, None)]);
        query.add_merge_input(merge, t1);
        query.add_merge_input(merge, t2);

        let mut seen = Vec::new();
        query.for_each_use(merge, |input, role, output| {
            assert_eq!(role, InputColumnRole::MergedColumn);
            seen.push((input, output));
        });
        assert_eq!(seen.len(), 2);
        let mcol = query.view(merge).columns()[0];
        assert!(seen.iter().all(|(_, out)| *out == Some(mcol)));
    }

    #[test]
    fn test_insert_roles_distinguish_targets() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let stream = query.add_stream("m", vec![TypeKind::U32], false);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let i1 = query.insert_relation(rel, cols.clone());
        let i2 = query.insert_stream(stream, cols);

        let mut roles = Vec::new();
        query.for_each_use(i1, |_, role, out| {
            assert!(out.is_none());
            roles.push(role);
        });
        query.for_each_use(i2, |_, role, _| roles.push(role));
        assert_eq!(
            roles,
            vec![InputColumnRole::Materialized, InputColumnRole::Published]
        );
    }

    #[test]
    fn test_debug_view_is_stable() {
        let mut query = Query::new();
        let rel = query.add_relation("edge", vec![TypeKind::U32, TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let compare = query.compare(ComparisonOp::Lt, cols[0], cols[1], vec![]);

        let select_uid = query.view(select).uid();
        let rendered = query.debug_view(compare);
        assert_eq!(
            rendered,
            format!(
                "COMPARE<{}>[{select_uid}:0 < {select_uid}:1]",
                query.view(compare).uid()
            )
        );
        assert!(query.debug_view(select).contains("relation edge"));
    }

    #[test]
    fn test_kind_iterators() {
        let mut query = Query::new();
        let rel = query.add_relation("r", vec![TypeKind::U32]);
        let select = query.select_relation(rel);
        let cols = query.view(select).columns().to_vec();
        let _tuple = query.tuple(cols.clone());
        let _insert = query.insert_relation(rel, cols);
        let _konst = query.constant_column(&crate::ast::Literal::unsigned(1));
        let _tag = query.tag_column();

        assert_eq!(query.selects().count(), 1);
        assert_eq!(query.tuples().count(), 1);
        assert_eq!(query.inserts().count(), 1);
        assert_eq!(query.constants().count(), 1);
        assert_eq!(query.tags().count(), 1);
        assert_eq!(query.relation_inserts(rel).count(), 1);
        assert_eq!(query.relation_selects(rel).count(), 1);
    }
}
