//! Row transforms: filter, group-by, merge, flatten

use super::{
    Field, Fields, FlatRow, FlatRowSource, OnFields, OnFlatRow, OnRow, QueryContext, RowSource,
    Source, SourceBundle, Vals,
};
use crate::encoding::{align_to, ByteMap, Sequence, Timestamp};
use crate::expr::SubMerger;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Keeps only rows matching a predicate
pub struct RowFilter {
    source: Arc<dyn RowSource>,
    label: String,
    include: Box<dyn Fn(&ByteMap, &Vals) -> bool + Send + Sync>,
}

impl RowFilter {
    pub fn new(
        source: Arc<dyn RowSource>,
        label: impl Into<String>,
        include: impl Fn(&ByteMap, &Vals) -> bool + Send + Sync + 'static,
    ) -> RowFilter {
        RowFilter {
            source,
            label: label.into(),
            include: Box::new(include),
        }
    }
}

impl Source for RowFilter {
    fn fields(&self) -> Fields {
        self.source.fields()
    }

    fn resolution(&self) -> i64 {
        self.source.resolution()
    }

    fn as_of(&self) -> Timestamp {
        self.source.as_of()
    }

    fn until(&self) -> Timestamp {
        self.source.until()
    }

    fn describe(&self) -> String {
        format!("filter({}) <- {}", self.label, self.source.describe())
    }
}

impl RowSource for RowFilter {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
        self.source.iterate(ctx, on_fields, &mut |key, vals| {
            ctx.check_deadline()?;
            if (self.include)(key, vals) {
                on_row(key, vals)
            } else {
                Ok(true)
            }
        })
    }
}

/// Re-aggregates rows onto a subset of their grouping dimensions
///
/// With no output fields configured the input fields are merged as-is.
/// With output fields, each output expression's sub-mergers fold the
/// matching input fields' partial states — this is how an average is
/// reassembled from partition-local sums and counts.
pub struct Group {
    bundle: SourceBundle<dyn RowSource>,
    by: Vec<String>,
    out_fields: Option<Fields>,
}

impl Group {
    pub fn new(by: Vec<String>) -> Group {
        Group {
            bundle: SourceBundle::new(),
            by,
            out_fields: None,
        }
    }

    pub fn with_fields(mut self, fields: Fields) -> Group {
        self.out_fields = Some(fields);
        self
    }

    pub fn connect(&mut self, source: Arc<dyn RowSource>) {
        self.bundle.connect(source);
    }
}

impl Source for Group {
    fn fields(&self) -> Fields {
        self.out_fields
            .clone()
            .unwrap_or_else(|| self.bundle.fields())
    }

    fn resolution(&self) -> i64 {
        self.bundle.resolution()
    }

    fn as_of(&self) -> Timestamp {
        self.bundle.as_of()
    }

    fn until(&self) -> Timestamp {
        self.bundle.until()
    }

    fn describe(&self) -> String {
        format!("group by ({})", self.by.join(", "))
    }
}

impl RowSource for Group {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
        let in_fields = self.bundle.fields();
        let out_fields = self.fields();
        let resolution = self.bundle.resolution();
        let same_fields = match &self.out_fields {
            None => true,
            Some(f) => *f == in_fields,
        };

        // Sub-mergers from each output expression onto the input fields
        let mergers: Vec<Vec<Option<SubMerger>>> = if same_fields {
            Vec::new()
        } else {
            let in_exprs: Vec<_> = in_fields.iter().map(|f| f.expr.clone()).collect();
            out_fields
                .iter()
                .map(|f| f.expr.sub_mergers(&in_exprs))
                .collect()
        };

        on_fields(&out_fields)?;

        let mut groups: BTreeMap<Vec<u8>, Vals> = BTreeMap::new();
        self.bundle
            .iterate_parallel(ctx, &mut |_| Ok(()), &mut |key, vals| {
                ctx.check_deadline()?;
                let grouped_key = key.project(&self.by);
                let entry = groups
                    .entry(grouped_key.into_bytes())
                    .or_insert_with(|| vec![Sequence::empty(); out_fields.len()]);

                if same_fields {
                    for (i, field) in out_fields.iter().enumerate() {
                        let existing = std::mem::take(&mut entry[i]);
                        entry[i] = existing.merge(
                            vals[i].clone(),
                            &field.expr,
                            resolution,
                            i64::MIN,
                        );
                    }
                } else {
                    for (o, field) in out_fields.iter().enumerate() {
                        let own_width = field.expr.encoded_width();
                        for (j, in_field) in in_fields.iter().enumerate() {
                            let Some(merger) = &mergers[o][j] else {
                                continue;
                            };
                            let existing = std::mem::take(&mut entry[o]);
                            entry[o] = existing.sub_merge_from(
                                &vals[j],
                                own_width,
                                in_field.expr.encoded_width(),
                                resolution,
                                Some(key),
                                merger,
                            );
                        }
                    }
                }
                Ok(true)
            })?;

        for (key, vals) in &groups {
            ctx.check_deadline()?;
            if !on_row(&ByteMap::from_bytes(key.clone()), vals)? {
                break;
            }
        }
        Ok(())
    }
}

/// Unions several homogeneous sources into one row stream
///
/// Sources iterate in parallel; this is the stage that gathers
/// partition-local results back together during cluster fan-out.
pub struct RowMerge {
    bundle: SourceBundle<dyn RowSource>,
}

impl RowMerge {
    pub fn new() -> RowMerge {
        RowMerge {
            bundle: SourceBundle::new(),
        }
    }

    pub fn connect(&mut self, source: Arc<dyn RowSource>) {
        self.bundle.connect(source);
    }
}

impl Default for RowMerge {
    fn default() -> Self {
        RowMerge::new()
    }
}

impl Source for RowMerge {
    fn fields(&self) -> Fields {
        self.bundle.fields()
    }

    fn resolution(&self) -> i64 {
        self.bundle.resolution()
    }

    fn as_of(&self) -> Timestamp {
        self.bundle.as_of()
    }

    fn until(&self) -> Timestamp {
        self.bundle.until()
    }

    fn describe(&self) -> String {
        format!("merge({})", self.bundle.len())
    }
}

impl RowSource for RowMerge {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
        self.bundle.iterate_parallel(ctx, on_fields, on_row)
    }
}

/// Rebuilds dimensioned sequence rows from flat time slices
///
/// The inverse of [`Flatten`]: each flat row's values re-enter the field
/// expressions as params keyed by field name, so downstream stages can
/// keep merging what a crosstab or a remote partition already
/// materialized.
pub struct Unflatten {
    source: Arc<dyn FlatRowSource>,
}

impl Unflatten {
    pub fn new(source: Arc<dyn FlatRowSource>) -> Unflatten {
        Unflatten { source }
    }
}

impl Source for Unflatten {
    fn fields(&self) -> Fields {
        self.source.fields()
    }

    fn resolution(&self) -> i64 {
        self.source.resolution()
    }

    fn as_of(&self) -> Timestamp {
        self.source.as_of()
    }

    fn until(&self) -> Timestamp {
        self.source.until()
    }

    fn describe(&self) -> String {
        format!("unflatten <- {}", self.source.describe())
    }
}

impl RowSource for Unflatten {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
        let resolution = self.source.resolution();

        let mut fields = Fields::new();
        let mut buffered: Vec<FlatRow> = Vec::new();
        self.source.iterate_flat(
            ctx,
            &mut |announced| {
                fields = announced.clone();
                Ok(())
            },
            &mut |row| {
                ctx.check_deadline()?;
                buffered.push(row.clone());
                Ok(true)
            },
        )?;

        on_fields(&fields)?;

        let mut groups: BTreeMap<Vec<u8>, Vals> = BTreeMap::new();
        for row in &buffered {
            ctx.check_deadline()?;
            let params: std::collections::HashMap<String, f64> = fields
                .iter()
                .zip(row.values.iter())
                .map(|(f, v)| (f.name.clone(), *v))
                .collect();
            let entry = groups
                .entry(row.key.as_bytes().to_vec())
                .or_insert_with(|| vec![Sequence::empty(); fields.len()]);
            for (i, field) in fields.iter().enumerate() {
                let seq = std::mem::take(&mut entry[i]);
                entry[i] = seq.update(
                    row.ts,
                    &params,
                    Some(&row.key),
                    &field.expr,
                    resolution,
                    i64::MIN,
                );
            }
        }

        for (key, vals) in &groups {
            ctx.check_deadline()?;
            if !on_row(&ByteMap::from_bytes(key.clone()), vals)? {
                break;
            }
        }
        Ok(())
    }
}

/// Materializes dimensioned rows into per-bucket flat rows, newest first
pub struct Flatten {
    source: Arc<dyn RowSource>,
}

impl Flatten {
    pub fn new(source: Arc<dyn RowSource>) -> Flatten {
        Flatten { source }
    }
}

impl Source for Flatten {
    fn fields(&self) -> Fields {
        self.source.fields()
    }

    fn resolution(&self) -> i64 {
        self.source.resolution()
    }

    fn as_of(&self) -> Timestamp {
        self.source.as_of()
    }

    fn until(&self) -> Timestamp {
        self.source.until()
    }

    fn describe(&self) -> String {
        format!("flatten <- {}", self.source.describe())
    }
}

impl FlatRowSource for Flatten {
    fn iterate_flat(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnFlatRow,
    ) -> Result<()> {
        let fields = self.source.fields();
        let resolution = self.source.resolution();
        let as_of = self.source.as_of();
        let until = self.source.until();

        self.source.iterate(ctx, on_fields, &mut |key, vals| {
            ctx.check_deadline()?;

            // The time span this row's sequences cover
            let mut max_start = i64::MIN;
            let mut min_end = i64::MAX;
            for (i, field) in fields.iter().enumerate() {
                let seq = &vals[i];
                if seq.is_empty() {
                    continue;
                }
                let width = field.expr.encoded_width();
                let start = seq.start();
                let end = start - (seq.num_periods(width) as i64 - 1) * resolution;
                max_start = max_start.max(start);
                min_end = min_end.min(end);
            }
            if max_start == i64::MIN {
                return Ok(true);
            }

            let hi = if until >= max_start {
                max_start
            } else {
                align_to(until, resolution)
            };
            let lo = if as_of <= min_end {
                min_end
            } else {
                align_to(as_of, resolution)
            };

            let mut ts = hi;
            while ts >= lo {
                let mut any_set = false;
                let values: Vec<f64> = fields
                    .iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let (v, set) = vals[i].value_at_time(ts, &field.expr, resolution);
                        any_set |= set;
                        v
                    })
                    .collect();
                if any_set {
                    let row = FlatRow {
                        ts,
                        key: key.clone(),
                        values,
                        totals: Vec::new(),
                    };
                    if !on_row(&row)? {
                        return Ok(false);
                    }
                }
                ts -= resolution;
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::expr::Expr;

    const RES: i64 = 60;

    fn sum_v() -> Expr {
        Expr::sum(Expr::field("v"))
    }

    fn collect_rows(source: &dyn RowSource) -> Vec<(ByteMap, Vals)> {
        let mut out = Vec::new();
        source
            .iterate(&QueryContext::new(), &mut |_| Ok(()), &mut |key, vals| {
                out.push((key.clone(), vals.clone()));
                Ok(true)
            })
            .unwrap();
        out
    }

    #[test]
    fn test_filter_drops_rows() {
        let e = sum_v();
        let source = Arc::new(VecSource::new(
            vec![Field::new("v", e.clone())],
            RES,
            vec![
                (
                    ByteMap::of_strings([("host", "a")]),
                    vec![seq_of(&e, RES, &[(0, 1.0)])],
                ),
                (
                    ByteMap::of_strings([("host", "b")]),
                    vec![seq_of(&e, RES, &[(0, 2.0)])],
                ),
            ],
        ));

        let filter = RowFilter::new(source, "host=a", |key, _| key.get_str("host") == Some("a"));
        let rows = collect_rows(&filter);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.get_str("host"), Some("a"));
    }

    #[test]
    fn test_group_collapses_dimensions() {
        let e = sum_v();
        let fields = vec![Field::new("v", e.clone())];
        let source = Arc::new(VecSource::new(
            fields.clone(),
            RES,
            vec![
                (
                    ByteMap::of_strings([("client", "acme"), ("host", "h1")]),
                    vec![seq_of(&e, RES, &[(0, 1.0)])],
                ),
                (
                    ByteMap::of_strings([("client", "acme"), ("host", "h2")]),
                    vec![seq_of(&e, RES, &[(0, 2.0)])],
                ),
                (
                    ByteMap::of_strings([("client", "umbrella"), ("host", "h1")]),
                    vec![seq_of(&e, RES, &[(0, 5.0)])],
                ),
            ],
        ));

        let mut group = Group::new(vec!["client".to_string()]);
        group.connect(source);
        let rows = collect_rows(&group);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, ByteMap::of_strings([("client", "acme")]));
        assert_eq!(rows[0].1[0].value_at(0, &e).0, 3.0);
        assert_eq!(rows[1].0, ByteMap::of_strings([("client", "umbrella")]));
        assert_eq!(rows[1].1[0].value_at(0, &e).0, 5.0);
    }

    #[test]
    fn test_group_reassembles_avg_from_sum_and_count() {
        let sum = Expr::sum(Expr::field("v"));
        let count = Expr::count(Expr::field("v"));
        let avg = Expr::avg(Expr::field("v"));

        let in_fields = vec![
            Field::new("v_sum", sum.clone()),
            Field::new("v_count", count.clone()),
        ];
        let source = Arc::new(VecSource::new(
            in_fields,
            RES,
            vec![(
                ByteMap::of_strings([("client", "acme")]),
                vec![
                    seq_of(&sum, RES, &[(0, 6.0), (0, 8.0)]),
                    seq_of(&count, RES, &[(0, 1.0), (0, 1.0), (0, 1.0), (0, 1.0)]),
                ],
            )],
        ));

        let mut group = Group::new(vec!["client".to_string()])
            .with_fields(vec![Field::new("v_avg", avg.clone())]);
        group.connect(source);
        let rows = collect_rows(&group);

        assert_eq!(rows.len(), 1);
        let (value, set) = rows[0].1[0].value_at(0, &avg);
        assert!(set);
        assert_eq!(value, 3.5);
    }

    #[test]
    fn test_merge_unions_sources() {
        let e = sum_v();
        let fields = vec![Field::new("v", e.clone())];
        let mut merge = RowMerge::new();
        for s in 0..3 {
            merge.connect(Arc::new(VecSource::new(
                fields.clone(),
                RES,
                vec![(
                    ByteMap::of_strings([("part", format!("{s}"))]),
                    vec![seq_of(&e, RES, &[(0, 1.0)])],
                )],
            )));
        }

        let rows = collect_rows(&merge);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_unflatten_inverts_flatten() {
        let e = sum_v();
        let fields = vec![Field::new("v", e.clone())];
        let original = vec![(
            ByteMap::of_strings([("k", "a")]),
            vec![seq_of(&e, RES, &[(0, 1.0), (RES, 2.0), (3 * RES, 4.0)])],
        )];
        let source = Arc::new(VecSource::new(fields, RES, original.clone()));
        let unflatten = Unflatten::new(Arc::new(Flatten::new(source as Arc<dyn RowSource>)));

        let rows = collect_rows(&unflatten);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, original[0].0);
        for i in 0..4 {
            assert_eq!(
                rows[0].1[0].value_at(i, &e),
                original[0].1[0].value_at(i, &e),
                "bucket {}",
                i
            );
        }
    }

    #[test]
    fn test_flatten_emits_time_descending() {
        let e = sum_v();
        let source = Arc::new(VecSource::new(
            vec![Field::new("v", e.clone())],
            RES,
            vec![(
                ByteMap::of_strings([("k", "a")]),
                vec![seq_of(&e, RES, &[(0, 1.0), (2 * RES, 3.0)])],
            )],
        ));

        let flatten = Flatten::new(source);
        let mut rows: Vec<FlatRow> = Vec::new();
        flatten
            .iterate_flat(&QueryContext::new(), &mut |_| Ok(()), &mut |row| {
                rows.push(row.clone());
                Ok(true)
            })
            .unwrap();

        // Bucket at 1*RES holds no data and is skipped
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, 2 * RES);
        assert_eq!(rows[0].values, [3.0]);
        assert_eq!(rows[1].ts, 0);
        assert_eq!(rows[1].values, [1.0]);
    }
}
