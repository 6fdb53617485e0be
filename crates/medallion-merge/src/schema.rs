//! Schema reconciliation and tracking columns.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, AsArray, new_null_array};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit, TimestampMicrosecondType};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::error::{MergeError, MergeResult, compute_err};

/// Data type of both tracking columns.
pub fn tracking_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Union of several schemas by column name.
///
/// Columns keep the order in which they are first seen. A column missing
/// from any input becomes nullable; a column whose type differs between
/// inputs is a mismatch.
pub fn unified_schema(schemas: &[SchemaRef]) -> MergeResult<SchemaRef> {
    let mut fields: Vec<Field> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for schema in schemas {
        for field in schema.fields() {
            match index.get(field.name()) {
                Some(&i) => {
                    if fields[i].data_type() != field.data_type() {
                        return Err(MergeError::SchemaMismatch(format!(
                            "column '{}' is {} in one input and {} in another",
                            field.name(),
                            fields[i].data_type(),
                            field.data_type()
                        )));
                    }
                    if field.is_nullable() && !fields[i].is_nullable() {
                        fields[i] = fields[i].clone().with_nullable(true);
                    }
                }
                None => {
                    index.insert(field.name().clone(), fields.len());
                    fields.push(field.as_ref().clone());
                }
            }
        }
    }

    let fields: Vec<Field> = fields
        .into_iter()
        .map(|field| {
            if schemas.iter().any(|s| s.field_with_name(field.name()).is_err()) {
                field.with_nullable(true)
            } else {
                field
            }
        })
        .collect();
    Ok(Arc::new(Schema::new(fields)))
}

/// Project `batch` onto `schema`, filling absent columns with nulls.
pub fn conform(batch: &RecordBatch, schema: &SchemaRef) -> MergeResult<RecordBatch> {
    let rows = batch.num_rows();
    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) => Arc::clone(column),
            None => new_null_array(field.data_type(), rows),
        })
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(Arc::clone(schema), columns, &options).map_err(compute_err!())
}

/// Union batches by column name into a single batch.
pub fn align_batches(batches: &[RecordBatch]) -> MergeResult<RecordBatch> {
    let schemas: Vec<SchemaRef> = batches.iter().map(|b| b.schema()).collect();
    let schema = unified_schema(&schemas)?;
    let conformed = batches
        .iter()
        .map(|b| conform(b, &schema))
        .collect::<MergeResult<Vec<_>>>()?;
    concat_batches(&schema, &conformed).map_err(compute_err!())
}

/// Make sure `column` exists with the tracking type.
///
/// Datasets written before tracking existed get an all-null column; other
/// timestamp encodings (nanoseconds, naive) are cast. Naive values are read
/// as UTC.
pub fn ensure_tracking_column(batch: RecordBatch, column: &str) -> MergeResult<RecordBatch> {
    let target_type = tracking_type();
    let schema = batch.schema();

    let Ok(idx) = schema.index_of(column) else {
        let nulls = new_null_array(&target_type, batch.num_rows());
        return append_column(&batch, Field::new(column, target_type, true), nulls);
    };

    let existing = schema.field(idx);
    if existing.data_type() == &target_type {
        return Ok(batch);
    }
    if !matches!(existing.data_type(), DataType::Timestamp(_, _)) {
        return Err(MergeError::SchemaMismatch(format!(
            "tracking column '{column}' has type {}, expected a timestamp",
            existing.data_type()
        )));
    }

    // Cast the unit only, then relabel; casting into a named zone needs chrono-tz.
    let micros = cast(batch.column(idx), &DataType::Timestamp(TimeUnit::Microsecond, None))
        .map_err(|e| {
            MergeError::SchemaMismatch(format!("tracking column '{column}' cannot be converted: {e}"))
        })?;
    let converted: ArrayRef = Arc::new(
        micros
            .as_primitive::<TimestampMicrosecondType>()
            .clone()
            .with_timezone("UTC"),
    );
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields[idx] = Field::new(column, target_type, true);
    let mut columns = batch.columns().to_vec();
    columns[idx] = converted;
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(compute_err!())
}

/// Remove the named columns, if present.
pub fn drop_columns(batch: &RecordBatch, names: &[&str]) -> MergeResult<RecordBatch> {
    let keep: Vec<usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| !names.contains(&f.name().as_str()))
        .map(|(i, _)| i)
        .collect();
    batch.project(&keep).map_err(compute_err!())
}

pub(crate) fn append_column(
    batch: &RecordBatch,
    field: Field,
    column: ArrayRef,
) -> MergeResult<RecordBatch> {
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.push(field);
    let mut columns = batch.columns().to_vec();
    columns.push(column);
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
        .map_err(compute_err!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, Int64Array, StringArray, TimestampNanosecondArray};

    fn batch(fields: Vec<Field>, columns: Vec<ArrayRef>) -> RecordBatch {
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
    }

    #[test]
    fn union_by_name_fills_missing_columns() {
        let target = batch(
            vec![
                Field::new("id", DataType::Int64, false),
                Field::new("legacy", DataType::Utf8, false),
            ],
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec!["old"])),
            ],
        );
        let source = batch(
            vec![
                Field::new("email", DataType::Utf8, false),
                Field::new("id", DataType::Int64, false),
            ],
            vec![
                Arc::new(StringArray::from(vec!["a@x"])),
                Arc::new(Int64Array::from(vec![2])),
            ],
        );

        let merged = align_batches(&[target, source]).unwrap();
        let names: Vec<&str> = merged
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(names, vec!["id", "legacy", "email"]);
        assert!(!merged.schema().field(0).is_nullable());
        assert!(merged.schema().field(1).is_nullable());
        assert_eq!(merged.column(1).null_count(), 1);
        assert_eq!(merged.column(2).null_count(), 1);
    }

    #[test]
    fn conflicting_types_are_a_mismatch() {
        let a = batch(
            vec![Field::new("id", DataType::Int64, false)],
            vec![Arc::new(Int64Array::from(vec![1]))],
        );
        let b = batch(
            vec![Field::new("id", DataType::Int32, false)],
            vec![Arc::new(Int32Array::from(vec![1]))],
        );
        let err = align_batches(&[a, b]).unwrap_err();
        assert!(matches!(err, MergeError::SchemaMismatch(_)), "{err}");
    }

    #[test]
    fn missing_tracking_column_is_backfilled_with_nulls() {
        let legacy = batch(
            vec![Field::new("id", DataType::Int64, false)],
            vec![Arc::new(Int64Array::from(vec![1, 2]))],
        );
        let out = ensure_tracking_column(legacy, "created_ts").unwrap();
        let field = out.schema().field_with_name("created_ts").unwrap().clone();
        assert_eq!(field.data_type(), &tracking_type());
        assert_eq!(out.column_by_name("created_ts").unwrap().null_count(), 2);
    }

    #[test]
    fn nanosecond_tracking_column_is_cast() {
        let nanos = TimestampNanosecondArray::from(vec![Some(1_500_000_000_123_456_789), None]);
        let spark = batch(
            vec![Field::new("update_ts", nanos.data_type().clone(), true)],
            vec![Arc::new(nanos)],
        );
        let out = ensure_tracking_column(spark, "update_ts").unwrap();
        let column = out.column(0).as_primitive::<TimestampMicrosecondType>();
        assert_eq!(column.value(0), 1_500_000_000_123_456);
        assert!(column.is_null(1));
    }

    #[test]
    fn zoned_tracking_column_keeps_its_instant() {
        let nanos = TimestampNanosecondArray::from(vec![Some(1_000_000_000)]).with_timezone("+02:00");
        let zoned = batch(
            vec![Field::new("created_ts", nanos.data_type().clone(), true)],
            vec![Arc::new(nanos)],
        );
        let out = ensure_tracking_column(zoned, "created_ts").unwrap();
        assert_eq!(out.schema().field(0).data_type(), &tracking_type());
        let column = out.column(0).as_primitive::<TimestampMicrosecondType>();
        assert_eq!(column.value(0), 1_000_000);
    }

    #[test]
    fn nullability_widens_when_any_input_is_nullable() {
        let a = batch(
            vec![Field::new("id", DataType::Int64, false)],
            vec![Arc::new(Int64Array::from(vec![1]))],
        );
        let b = batch(
            vec![Field::new("id", DataType::Int64, true)],
            vec![Arc::new(Int64Array::from(vec![None]))],
        );
        let merged = align_batches(&[a, b]).unwrap();
        assert!(merged.schema().field(0).is_nullable());
        assert_eq!(merged.num_rows(), 2);
    }

    #[test]
    fn non_timestamp_tracking_column_is_rejected() {
        let bad = batch(
            vec![Field::new("created_ts", DataType::Utf8, false)],
            vec![Arc::new(StringArray::from(vec!["yesterday"]))],
        );
        assert!(matches!(
            ensure_tracking_column(bad, "created_ts"),
            Err(MergeError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn drop_columns_ignores_unknown_names() {
        let b = batch(
            vec![
                Field::new("id", DataType::Int64, false),
                Field::new("update_ts", tracking_type(), true),
            ],
            vec![
                Arc::new(Int64Array::from(vec![1])),
                new_null_array(&tracking_type(), 1),
            ],
        );
        let out = drop_columns(&b, &["update_ts", "created_ts"]).unwrap();
        assert_eq!(out.num_columns(), 1);
    }
}
