//! Crosstab pivot
//!
//! Reshapes the values of the distinguished `_crosstab` dimension into
//! field suffixes: with crosstab values `x` and `y` and input field `v`,
//! the output carries fields `x_v`, `y_v` and `total_v`. All input rows
//! are buffered before any output row is produced.

use super::{
    Field, Fields, FlatRow, FlatRowSource, OnFields, OnFlatRow, QueryContext, Source, Timestamp,
};
use crate::encoding::ByteMap;
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The dimension whose values pivot into field suffixes
pub const CROSSTAB_DIM: &str = "_crosstab";

pub struct Crosstab {
    source: Arc<dyn FlatRowSource>,
}

impl Crosstab {
    pub fn new(source: Arc<dyn FlatRowSource>) -> Crosstab {
        Crosstab { source }
    }
}

impl Source for Crosstab {
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
        "crosstab".to_string()
    }
}

struct BufferedRow {
    row: FlatRow,
    ct: String,
    key: ByteMap,
}

impl FlatRowSource for Crosstab {
    fn iterate_flat(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnFlatRow,
    ) -> Result<()> {
        let mut in_fields = Fields::new();
        let mut buffered: Vec<BufferedRow> = Vec::new();
        let mut unique_cts: BTreeSet<String> = BTreeSet::new();

        self.source.iterate_flat(
            ctx,
            &mut |fields| {
                in_fields = fields.clone();
                Ok(())
            },
            &mut |row| {
                let (ct_entry, key) = row.key.split(CROSSTAB_DIM);
                let ct = ct_entry.get_str(CROSSTAB_DIM).unwrap_or_default().to_string();
                unique_cts.insert(ct.clone());
                buffered.push(BufferedRow {
                    row: row.clone(),
                    ct,
                    key,
                });
                Ok(true)
            },
        )?;

        let num_in = in_fields.len();
        let num_cts = unique_cts.len();

        // Pivoted fields: one per (crosstab value, input field), plus
        // per-field totals
        let cts: Vec<String> = unique_cts.into_iter().collect();
        let mut out_fields = Fields::with_capacity((num_cts + 1) * num_in);
        for ct in &cts {
            let ct_name = ct.replace(' ', "_");
            for field in &in_fields {
                out_fields.push(Field::new(
                    format!("{}_{}", ct_name, field.name),
                    field.expr.clone(),
                ));
            }
        }
        for field in &in_fields {
            out_fields.push(Field::new(format!("total_{}", field.name), field.expr.clone()));
        }
        let num_fields = out_fields.len();

        on_fields(&out_fields)?;

        // Sort buffered rows by residual key, then newest first, then
        // crosstab value; a new output row begins when the key changes or
        // the timestamp regresses
        buffered.sort_by(|a, b| {
            a.key
                .as_bytes()
                .cmp(b.key.as_bytes())
                .then(b.row.ts.cmp(&a.row.ts))
                .then(a.ct.cmp(&b.ct))
        });

        let mut current: Option<FlatRow> = None;
        for buf in &buffered {
            ctx.check_deadline()?;

            let new_row = match &current {
                None => true,
                Some(cur) => cur.key != buf.key || cur.ts > buf.row.ts,
            };
            if new_row {
                if let Some(finished) = current.take() {
                    if !on_row(&finished)? {
                        return Ok(());
                    }
                }
                current = Some(FlatRow {
                    ts: buf.row.ts,
                    key: buf.key.clone(),
                    values: vec![0.0; num_fields],
                    totals: vec![0.0; num_in],
                });
            }

            let cti = cts.iter().position(|c| *c == buf.ct).unwrap_or(0);
            if let Some(cur) = current.as_mut() {
                for (i, value) in buf.row.values.iter().enumerate() {
                    let field_idx = cti * num_in + i;
                    let total_idx = num_cts * num_in + i;
                    cur.values[field_idx] = *value;
                    cur.values[total_idx] += *value;
                    cur.totals[i] += *value;
                }
            }
        }

        if let Some(finished) = current.take() {
            on_row(&finished)?;
        }
        Ok(())
    }
}
