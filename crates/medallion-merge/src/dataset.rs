//! Parquet dataset I/O.
//!
//! A dataset is a directory of Parquet files. Unpartitioned datasets hold a
//! single `part-00000.parquet`; partitioned datasets use Hive-style
//! `<column>=<value>` subdirectories. Partition columns are also written into
//! the files themselves, so their types survive a round trip. Files written by
//! other tools that only encode a partition column in the path get that column
//! back as `Utf8`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::{MergeError, MergeResult, compute_err, fault_at};
use crate::location::{Probe, probe};
use crate::schema::align_batches;

/// Directory value used for a null partition value.
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// File name of the single data file written per (partition) directory.
pub const PART_FILE: &str = "part-00000.parquet";

/// Read the dataset at `location`, or `None` if there is no data there.
///
/// All data files are combined into one batch under a reconciled schema.
pub fn read_dataset(location: &Path) -> MergeResult<Option<RecordBatch>> {
    match probe(location)? {
        Probe::Absent => Ok(None),
        Probe::Present(files) => read_files(location, &files).map(Some),
    }
}

/// Read a single Parquet file, or a dataset directory.
///
/// Unlike [`read_dataset`], a location without data is a fault here: callers
/// use this for inputs that must exist.
pub fn read_parquet(path: &Path) -> MergeResult<RecordBatch> {
    let meta = fs::metadata(path).map_err(fault_at!(path))?;
    if meta.is_file() {
        return read_file(path, &[]);
    }
    read_dataset(path)?
        .ok_or_else(|| MergeError::storage(path, "no parquet data files found"))
}

pub fn read_files(location: &Path, files: &[PathBuf]) -> MergeResult<RecordBatch> {
    let mut batches = Vec::with_capacity(files.len());
    for file in files {
        let partition_values = partition_values_from_path(location, file);
        batches.push(read_file(file, &partition_values)?);
    }
    let batch = align_batches(&batches)?;
    debug!(
        location = %location.display(),
        files = files.len(),
        rows = batch.num_rows(),
        "dataset read"
    );
    Ok(batch)
}

fn read_file(path: &Path, partition_values: &[(String, Option<String>)]) -> MergeResult<RecordBatch> {
    let file = File::open(path).map_err(fault_at!(path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(fault_at!(path))?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(fault_at!(path))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(fault_at!(path))?);
    }
    let batch = concat_batches(&schema, &batches).map_err(compute_err!())?;
    with_path_partitions(batch, partition_values)
}

/// Re-attach partition columns that only exist in the directory names.
fn with_path_partitions(
    batch: RecordBatch,
    partition_values: &[(String, Option<String>)],
) -> MergeResult<RecordBatch> {
    let missing: Vec<_> = partition_values
        .iter()
        .filter(|(name, _)| batch.schema().field_with_name(name).is_err())
        .collect();
    if missing.is_empty() {
        return Ok(batch);
    }

    let rows = batch.num_rows();
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    for (name, value) in missing {
        fields.push(Field::new(name.as_str(), DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(vec![value.as_deref(); rows])));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(compute_err!())
}

fn partition_values_from_path(location: &Path, file: &Path) -> Vec<(String, Option<String>)> {
    let Ok(relative) = file.strip_prefix(location) else {
        return Vec::new();
    };
    let Some(parent) = relative.parent() else {
        return Vec::new();
    };
    parent
        .components()
        .filter_map(|c| {
            let segment = c.as_os_str().to_str()?;
            let (name, raw) = segment.split_once('=')?;
            let value = (raw != NULL_PARTITION).then(|| unescape(raw));
            Some((unescape(name), value))
        })
        .collect()
}

/// Write `batch` into `dir`, partitioned by `partition_columns` if any.
///
/// `dir` is expected to be new or empty. Returns the number of files written.
pub fn write_dataset(
    dir: &Path,
    batch: &RecordBatch,
    partition_columns: &[String],
) -> MergeResult<usize> {
    fs::create_dir_all(dir).map_err(fault_at!(dir))?;

    if partition_columns.is_empty() {
        write_file(&dir.join(PART_FILE), batch)?;
        return Ok(1);
    }

    let groups = partition_groups(batch, partition_columns)?;
    for (relative, indices) in &groups {
        let part_dir = dir.join(relative);
        fs::create_dir_all(&part_dir).map_err(fault_at!(&part_dir))?;
        let indices = UInt32Array::from(indices.clone());
        let part = take_record_batch(batch, &indices).map_err(compute_err!())?;
        write_file(&part_dir.join(PART_FILE), &part)?;
    }
    debug!(dir = %dir.display(), partitions = groups.len(), "partitioned dataset written");
    Ok(groups.len())
}

fn write_file(path: &Path, batch: &RecordBatch) -> MergeResult<()> {
    let file = File::create(path).map_err(fault_at!(path))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(fault_at!(path))?;
    writer.write(batch).map_err(fault_at!(path))?;
    writer.close().map_err(fault_at!(path))?;
    Ok(())
}

/// Group row indices by their relative partition directory.
fn partition_groups(
    batch: &RecordBatch,
    partition_columns: &[String],
) -> MergeResult<BTreeMap<PathBuf, Vec<u32>>> {
    let options = FormatOptions::default();
    let mut formatters = Vec::with_capacity(partition_columns.len());
    for name in partition_columns {
        let column = batch.column_by_name(name).ok_or_else(|| {
            MergeError::SchemaMismatch(format!("partition column '{name}' is missing"))
        })?;
        let formatter = ArrayFormatter::try_new(column.as_ref(), &options).map_err(compute_err!())?;
        formatters.push((name, column, formatter));
    }

    let mut groups: BTreeMap<PathBuf, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let mut relative = PathBuf::new();
        for (name, column, formatter) in &formatters {
            let value = if column.is_null(row) {
                NULL_PARTITION.to_string()
            } else {
                escape(&formatter.value(row).to_string())
            };
            relative.push(format!("{}={value}", escape(name)));
        }
        groups.entry(relative).or_default().push(row as u32);
    }
    Ok(groups)
}

fn needs_escape(c: char) -> bool {
    matches!(c, '/' | '=' | '%' | '\\') || c.is_control()
}

/// Percent-encode characters that cannot appear in a partition segment.
pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn unescape(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
