use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Args;
use medallion_merge::merge::{DEFAULT_CREATED_COLUMN, DEFAULT_UPDATE_COLUMN};
use medallion_merge::{DuplicatePolicy, MergeOptions, MergeReport, Merger, read_parquet};

#[derive(Args)]
pub struct MergeArgs {
    /// Parquet file or dataset directory holding the new rows
    #[arg(short, long)]
    pub source: PathBuf,
    /// Dataset directory to upsert into (created if missing)
    #[arg(short, long)]
    pub target: PathBuf,
    /// Key column; repeat for a composite key
    #[arg(short, long = "key", required = true)]
    pub keys: Vec<String>,
    /// Partition column; repeat for nested partitions
    #[arg(short, long = "partition")]
    pub partitions: Vec<String>,
    #[arg(long, default_value = DEFAULT_CREATED_COLUMN)]
    pub created_column: String,
    #[arg(long, default_value = DEFAULT_UPDATE_COLUMN)]
    pub update_column: String,
    /// Keep the last of several source rows sharing a key instead of failing
    #[arg(long)]
    pub keep_last: bool,
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub fn merge(args: MergeArgs) -> anyhow::Result<()> {
    if args.format != "text" && args.format != "json" {
        bail!("Unknown format '{}'. Use: text, json", args.format);
    }

    let policy = if args.keep_last {
        DuplicatePolicy::KeepLast
    } else {
        DuplicatePolicy::Reject
    };
    let options = MergeOptions::new(&args.keys)
        .partition_by(&args.partitions)
        .created_column(&args.created_column)
        .update_column(&args.update_column)
        .duplicate_policy(policy);

    let source = read_parquet(&args.source)
        .with_context(|| format!("Failed to read source {}", args.source.display()))?;
    let report = Merger::new(options)
        .merge(&args.target, &source)
        .with_context(|| format!("Merge into {} failed", args.target.display()))?;

    println!("{}", render_report(&args.target, &report, &args.format)?);
    Ok(())
}

fn render_report(target: &Path, report: &MergeReport, format: &str) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(report)?);
    }
    Ok([
        format!("✓ Merged into {} ({:?})", target.display(), report.mode),
        format!("  Inserted:  {}", report.inserted),
        format!("  Updated:   {}", report.updated),
        format!("  Unchanged: {}", report.unchanged),
        format!("  Total:     {} rows in {} file(s)", report.total_rows, report.files_written),
        format!("  At:        {}", report.merged_at.to_rfc3339()),
    ]
    .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use medallion_merge::{MergeMode, read_dataset, write_dataset};

    fn write_source(dir: &Path, rows: &[(i64, &str)]) -> PathBuf {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("id", DataType::Int64, false),
                Field::new("name", DataType::Utf8, false),
            ])),
            vec![
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
                Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))),
            ],
        )
        .unwrap();
        write_dataset(dir, &batch, &[]).unwrap();
        dir.to_path_buf()
    }

    fn args(source: PathBuf, target: PathBuf, format: &str) -> MergeArgs {
        MergeArgs {
            source,
            target,
            keys: vec!["id".to_string()],
            partitions: Vec::new(),
            created_column: DEFAULT_CREATED_COLUMN.to_string(),
            update_column: DEFAULT_UPDATE_COLUMN.to_string(),
            keep_last: false,
            format: format.to_string(),
        }
    }

    #[test]
    fn merges_with_text_then_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dim_customer");
        let first = write_source(&dir.path().join("batch1"), &[(1, "Ann"), (2, "Bob")]);
        let second = write_source(&dir.path().join("batch2"), &[(2, "Bobby"), (3, "Cat")]);

        merge(args(first, target.clone(), "text")).unwrap();
        merge(args(second, target.clone(), "json")).unwrap();

        let batch = read_dataset(&target).unwrap().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert!(batch.column_by_name("created_ts").is_some());
    }

    #[test]
    fn unknown_format_is_rejected_before_merging() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dim_customer");
        let source = write_source(&dir.path().join("batch"), &[(1, "Ann")]);

        let err = merge(args(source, target.clone(), "yaml")).unwrap_err();

        assert!(err.to_string().contains("Unknown format"), "{err}");
        assert!(!target.exists());
    }

    #[test]
    fn report_rendering() {
        let report = MergeReport {
            mode: MergeMode::Upsert,
            inserted: 1,
            updated: 2,
            unchanged: 3,
            total_rows: 6,
            merged_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            files_written: 1,
        };
        let target = Path::new("lake/dim_customer");

        let text = render_report(target, &report, "text").unwrap();
        assert!(text.starts_with("✓ Merged into lake/dim_customer (Upsert)"), "{text}");
        assert!(text.contains("Updated:   2"), "{text}");

        let json: serde_json::Value =
            serde_json::from_str(&render_report(target, &report, "json").unwrap()).unwrap();
        assert_eq!(json["mode"], "upsert");
        assert_eq!(json["unchanged"], 3);
    }
}
