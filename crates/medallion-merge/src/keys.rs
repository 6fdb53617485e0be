//! Business-key tuples.
//!
//! Key columns are encoded with Arrow's row format, which gives every tuple a
//! byte representation with `Eq + Hash`, whatever the column types are.

use std::collections::HashMap;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use arrow::util::display::{ArrayFormatter, FormatOptions};

use crate::error::{MergeError, MergeResult, compute_err};
use crate::merge::DuplicatePolicy;

/// Encodes the key columns of a batch into comparable rows.
pub(crate) struct KeyEncoder {
    columns: Vec<String>,
    converter: RowConverter,
}

impl KeyEncoder {
    /// Build an encoder for `key_columns` as typed in `schema`.
    pub fn new(schema: &Schema, key_columns: &[String]) -> MergeResult<Self> {
        let mut fields = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            let field = schema.field_with_name(name).map_err(|_| {
                MergeError::SchemaMismatch(format!("key column '{name}' is missing"))
            })?;
            fields.push(SortField::new(field.data_type().clone()));
        }
        let converter = RowConverter::new(fields).map_err(compute_err!())?;
        Ok(Self {
            columns: key_columns.to_vec(),
            converter,
        })
    }

    fn key_arrays(&self, batch: &RecordBatch) -> MergeResult<Vec<ArrayRef>> {
        self.columns
            .iter()
            .map(|name| {
                batch.column_by_name(name).cloned().ok_or_else(|| {
                    MergeError::SchemaMismatch(format!("key column '{name}' is missing"))
                })
            })
            .collect()
    }

    pub fn encode(&self, batch: &RecordBatch) -> MergeResult<Rows> {
        let arrays = self.key_arrays(batch)?;
        self.converter
            .convert_columns(&arrays)
            .map_err(compute_err!())
    }

    /// Per row: true if any key component is null.
    pub fn null_mask(&self, batch: &RecordBatch) -> MergeResult<Vec<bool>> {
        let arrays = self.key_arrays(batch)?;
        Ok((0..batch.num_rows())
            .map(|row| arrays.iter().any(|a| a.is_null(row)))
            .collect())
    }
}

/// Fail if any key column of the source holds a null.
pub(crate) fn reject_null_keys(batch: &RecordBatch, key_columns: &[String]) -> MergeResult<()> {
    for name in key_columns {
        if let Some(column) = batch.column_by_name(name) {
            if column.null_count() > 0 {
                return Err(MergeError::NullKey(name.clone()));
            }
        }
    }
    Ok(())
}

/// Apply the duplicate policy to the source batch.
///
/// With [`DuplicatePolicy::KeepLast`] the surviving rows stay in batch order.
pub(crate) fn deduplicate(
    batch: RecordBatch,
    encoder: &KeyEncoder,
    policy: DuplicatePolicy,
) -> MergeResult<RecordBatch> {
    let rows = encoder.encode(&batch)?;
    let mut last_seen = HashMap::with_capacity(rows.num_rows());
    for i in 0..rows.num_rows() {
        let repeated = last_seen.insert(rows.row(i), i).is_some();
        if repeated && policy == DuplicatePolicy::Reject {
            return Err(MergeError::DuplicateKey(describe_key(
                &batch,
                &encoder.columns,
                i,
            )));
        }
    }
    if last_seen.len() == batch.num_rows() {
        return Ok(batch);
    }

    let keep: Vec<u32> = (0..rows.num_rows())
        .filter(|&i| last_seen.get(&rows.row(i)) == Some(&i))
        .map(|i| i as u32)
        .collect();
    take_record_batch(&batch, &UInt32Array::from(keep)).map_err(compute_err!())
}

/// Render the key of `row` as `(col=value, ...)` for error messages.
pub(crate) fn describe_key(batch: &RecordBatch, key_columns: &[String], row: usize) -> String {
    let options = FormatOptions::default().with_null("null");
    let parts: Vec<String> = key_columns
        .iter()
        .map(|name| {
            let value = batch
                .column_by_name(name)
                .and_then(|c| ArrayFormatter::try_new(c.as_ref(), &options).ok())
                .map(|f| f.value(row).to_string())
                .unwrap_or_default();
            format!("{name}={value}")
        })
        .collect();
    format!("({})", parts.join(", "))
}
