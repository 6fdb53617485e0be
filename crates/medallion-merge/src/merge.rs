//! Upsert merge of a source batch into a Parquet dataset.
//!
//! The merged dataset is the union, by column name, of three row sets:
//!
//! - untouched target rows: keys not present in the source batch,
//! - updated rows: source rows whose key already exists in the target,
//!   carrying the target's `created_ts` and a fresh `update_ts`,
//! - new rows: source rows with an unseen key, `created_ts = update_ts = now`.
//!
//! The result is written next to the target and swapped into place, so
//! readers of the location only ever see a complete dataset.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, TimestampMicrosecondArray, UInt32Array};
use arrow::compute::{filter_record_batch, take_record_batch};
use arrow::datatypes::{Field, TimestampMicrosecondType};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::dataset::{read_files, write_dataset};
use crate::error::{MergeError, MergeResult, compute_err};
use crate::keys::{KeyEncoder, deduplicate, reject_null_keys};
use crate::location::{Probe, exists, mark_for_swap, probe, recover, replace_location, staging_path};
use crate::schema::{append_column, conform, drop_columns, ensure_tracking_column, tracking_type, unified_schema};

pub const DEFAULT_CREATED_COLUMN: &str = "created_ts";
pub const DEFAULT_UPDATE_COLUMN: &str = "update_ts";

/// What to do when the source batch holds the same key more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Abort the merge with [`MergeError::DuplicateKey`].
    #[default]
    Reject,
    /// Keep the last occurrence in batch order.
    KeepLast,
}

/// Parameters of a merge.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub key_columns: Vec<String>,
    pub partition_columns: Vec<String>,
    pub created_column: String,
    pub update_column: String,
    pub duplicate_policy: DuplicatePolicy,
}

impl MergeOptions {
    pub fn new<I, S>(key_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_columns: key_columns.into_iter().map(Into::into).collect(),
            partition_columns: Vec::new(),
            created_column: DEFAULT_CREATED_COLUMN.to_string(),
            update_column: DEFAULT_UPDATE_COLUMN.to_string(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    pub fn partition_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_column(mut self, name: impl Into<String>) -> Self {
        self.created_column = name.into();
        self
    }

    pub fn update_column(mut self, name: impl Into<String>) -> Self {
        self.update_column = name.into();
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn validate(&self) -> MergeResult<()> {
        let invalid = |msg: String| Err(MergeError::InvalidOptions(msg));

        if self.key_columns.is_empty() {
            return invalid("at least one key column is required".to_string());
        }
        if self.created_column.is_empty() || self.update_column.is_empty() {
            return invalid("tracking column names must not be empty".to_string());
        }
        if self.created_column == self.update_column {
            return invalid(format!(
                "created and update columns are both '{}'",
                self.created_column
            ));
        }
        let tracking = [self.created_column.as_str(), self.update_column.as_str()];
        for (kind, columns) in [("key", &self.key_columns), ("partition", &self.partition_columns)] {
            let mut seen = HashSet::new();
            for column in columns {
                if column.is_empty() {
                    return invalid(format!("empty {kind} column name"));
                }
                if tracking.contains(&column.as_str()) {
                    return invalid(format!("{kind} column '{column}' is a tracking column"));
                }
                if !seen.insert(column) {
                    return invalid(format!("{kind} column '{column}' listed twice"));
                }
            }
        }
        Ok(())
    }

    fn tracking_columns(&self) -> [&str; 2] {
        [self.created_column.as_str(), self.update_column.as_str()]
    }
}

/// How a merge wrote its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// No dataset existed; the source batch became the dataset.
    FirstWrite,
    /// An existing dataset was merged with the source batch.
    Upsert,
}

/// Summary of a completed merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub mode: MergeMode,
    /// Source rows with a key the target did not have.
    pub inserted: usize,
    /// Source rows that replaced an existing key.
    pub updated: usize,
    /// Target rows carried over untouched.
    pub unchanged: usize,
    pub total_rows: usize,
    pub merged_at: DateTime<Utc>,
    pub files_written: usize,
}

/// Merges source batches into Parquet datasets.
#[derive(Debug, Clone)]
pub struct Merger<C: Clock = SystemClock> {
    options: MergeOptions,
    clock: C,
}

impl Merger<SystemClock> {
    pub fn new(options: MergeOptions) -> Self {
        Self::with_clock(options, SystemClock)
    }
}

impl<C: Clock> Merger<C> {
    pub fn with_clock(options: MergeOptions, clock: C) -> Self {
        Self { options, clock }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Upsert `source` into the dataset at `location`.
    ///
    /// All validation happens before anything is written. On error the
    /// previous dataset is left in place.
    pub fn merge(&self, location: &Path, source: &RecordBatch) -> MergeResult<MergeReport> {
        let opts = &self.options;
        opts.validate()?;
        let source = self.prepare_source(source)?;

        recover(location)?;
        let now = truncate_to_micros(self.clock.now());

        let (merged, mut report) = match probe(location)? {
            Probe::Absent => {
                debug!(location = %location.display(), "no existing dataset, first write");
                let rows = source.num_rows();
                let stamped = stamp(&source, &vec![Some(now_micros(now)); rows], now, opts)?;
                let report = MergeReport {
                    mode: MergeMode::FirstWrite,
                    inserted: rows,
                    updated: 0,
                    unchanged: 0,
                    total_rows: rows,
                    merged_at: now,
                    files_written: 0,
                };
                (stamped, report)
            }
            Probe::Present(files) => {
                let target = read_files(location, &files)?;
                self.upsert(target, &source, now)?
            }
        };

        report.files_written = write_and_swap(location, &merged, &opts.partition_columns)?;
        info!(
            location = %location.display(),
            mode = ?report.mode,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            total = report.total_rows,
            "merge complete"
        );
        Ok(report)
    }

    /// Validate the source and normalize it for stamping.
    fn prepare_source(&self, source: &RecordBatch) -> MergeResult<RecordBatch> {
        let opts = &self.options;
        if source.num_rows() == 0 {
            return Err(MergeError::EmptySource);
        }
        let schema = source.schema();
        for column in opts.key_columns.iter().chain(&opts.partition_columns) {
            if schema.field_with_name(column).is_err() {
                return Err(MergeError::SchemaMismatch(format!(
                    "source batch has no column '{column}'"
                )));
            }
        }
        reject_null_keys(source, &opts.key_columns)?;

        // Stamping owns the tracking columns; incoming values are discarded.
        let source = drop_columns(source, &opts.tracking_columns())?;
        let encoder = KeyEncoder::new(&source.schema(), &opts.key_columns)?;
        deduplicate(source, &encoder, opts.duplicate_policy)
    }

    fn upsert(
        &self,
        target: RecordBatch,
        source: &RecordBatch,
        now: DateTime<Utc>,
    ) -> MergeResult<(RecordBatch, MergeReport)> {
        let opts = &self.options;
        let target = ensure_tracking_column(target, &opts.created_column)?;
        let target = ensure_tracking_column(target, &opts.update_column)?;
        check_key_types(&target, source, &opts.key_columns)?;

        let encoder = KeyEncoder::new(&target.schema(), &opts.key_columns)?;
        let target_rows = encoder.encode(&target)?;
        let target_null_keys = encoder.null_mask(&target)?;
        let source_rows = encoder.encode(source)?;

        // target_keys, with the earliest known created_ts per key.
        let created = target
            .column_by_name(&opts.created_column)
            .ok_or_else(|| MergeError::Compute("created column vanished".to_string()))?
            .as_primitive::<TimestampMicrosecondType>();
        let mut first_seen: HashMap<_, Option<i64>> = HashMap::new();
        for i in 0..target.num_rows() {
            if target_null_keys[i] {
                continue;
            }
            let value = created.is_valid(i).then(|| created.value(i));
            first_seen
                .entry(target_rows.row(i))
                .and_modify(|current: &mut Option<i64>| *current = earliest(*current, value))
                .or_insert(value);
        }

        // Split the source against target_keys.
        let mut existing_idx = Vec::new();
        let mut existing_created = Vec::new();
        let mut new_idx = Vec::new();
        for i in 0..source.num_rows() {
            match first_seen.get(&source_rows.row(i)) {
                Some(original) => {
                    existing_idx.push(i as u32);
                    existing_created.push(*original);
                }
                None => new_idx.push(i as u32),
            }
        }

        // Target rows untouched by this batch, keyed against the batch's own keys.
        let batch_keys: HashSet<_> = (0..source.num_rows()).map(|i| source_rows.row(i)).collect();
        let keep: BooleanArray = (0..target.num_rows())
            .map(|i| Some(target_null_keys[i] || !batch_keys.contains(&target_rows.row(i))))
            .collect();
        let target_without_updates = filter_record_batch(&target, &keep).map_err(compute_err!())?;

        let source_existing =
            take_record_batch(source, &UInt32Array::from(existing_idx)).map_err(compute_err!())?;
        let source_existing = stamp(&source_existing, &existing_created, now, opts)?;

        let new_count = new_idx.len();
        let source_new =
            take_record_batch(source, &UInt32Array::from(new_idx)).map_err(compute_err!())?;
        let source_new = stamp(&source_new, &vec![Some(now_micros(now)); new_count], now, opts)?;

        let parts = [target_without_updates, source_existing, source_new];
        let schemas: Vec<_> = parts.iter().map(|b| b.schema()).collect();
        let schema = unified_schema(&schemas)?;
        let conformed = parts
            .iter()
            .map(|b| conform(b, &schema))
            .collect::<MergeResult<Vec<_>>>()?;
        let merged = arrow::compute::concat_batches(&schema, &conformed).map_err(compute_err!())?;

        let report = MergeReport {
            mode: MergeMode::Upsert,
            inserted: conformed[2].num_rows(),
            updated: conformed[1].num_rows(),
            unchanged: conformed[0].num_rows(),
            total_rows: merged.num_rows(),
            merged_at: now,
            files_written: 0,
        };
        Ok((merged, report))
    }
}

/// Upsert `source` into `location` using the system clock.
pub fn merge(
    location: &Path,
    source: &RecordBatch,
    options: MergeOptions,
) -> MergeResult<MergeReport> {
    Merger::new(options).merge(location, source)
}

fn check_key_types(target: &RecordBatch, source: &RecordBatch, keys: &[String]) -> MergeResult<()> {
    for key in keys {
        let target_field = target
            .schema()
            .field_with_name(key)
            .map(|f| f.data_type().clone())
            .map_err(|_| MergeError::SchemaMismatch(format!("existing dataset has no key column '{key}'")))?;
        let source_field = source
            .schema()
            .field_with_name(key)
            .map(|f| f.data_type().clone())
            .map_err(|_| MergeError::SchemaMismatch(format!("source batch has no column '{key}'")))?;
        if target_field != source_field {
            return Err(MergeError::SchemaMismatch(format!(
                "key column '{key}' is {target_field} in the dataset but {source_field} in the source"
            )));
        }
    }
    Ok(())
}

fn earliest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn now_micros(now: DateTime<Utc>) -> i64 {
    now.timestamp_micros()
}

/// Tracking columns hold microseconds; the report must show the stored value.
fn truncate_to_micros(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Append both tracking columns: the given `created` values and `now` as update.
fn stamp(
    batch: &RecordBatch,
    created: &[Option<i64>],
    now: DateTime<Utc>,
    opts: &MergeOptions,
) -> MergeResult<RecordBatch> {
    let rows = batch.num_rows();
    let created: ArrayRef =
        Arc::new(TimestampMicrosecondArray::from(created.to_vec()).with_timezone("UTC"));
    let updated: ArrayRef = Arc::new(
        TimestampMicrosecondArray::from(vec![now_micros(now); rows]).with_timezone("UTC"),
    );
    let batch = append_column(
        batch,
        Field::new(opts.created_column.as_str(), tracking_type(), true),
        created,
    )?;
    append_column(
        &batch,
        Field::new(opts.update_column.as_str(), tracking_type(), true),
        updated,
    )
}

/// Write to the staging sibling, then swap it into `location`.
fn write_and_swap(
    location: &Path,
    merged: &RecordBatch,
    partition_columns: &[String],
) -> MergeResult<usize> {
    let staging = staging_path(location)?;
    if exists(&staging)? {
        return Err(MergeError::storage(
            &staging,
            "staging path is occupied by a directory this merge did not create",
        ));
    }
    mark_for_swap(&staging)?;
    let files = match write_dataset(&staging, merged, partition_columns) {
        Ok(files) => files,
        Err(e) => {
            // Best effort; `recover` also removes it on the next run.
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };
    replace_location(&staging, location)?;
    Ok(files)
}
