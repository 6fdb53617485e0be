use std::path::{Path, PathBuf};

use anyhow::bail;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use medallion_merge::{Probe, probe, read_files};
use serde_json::json;

pub fn inspect(path: &str, format: &str, head: usize) -> anyhow::Result<()> {
    if format != "text" && format != "json" {
        bail!("Unknown format '{format}'. Use: text, json");
    }

    let location = Path::new(path);
    let files = match probe(location)? {
        Probe::Absent => bail!("No dataset at {}", location.display()),
        Probe::Present(files) => files,
    };
    let batch = read_files(location, &files)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&describe(location, &files, &batch))?);
    } else {
        println!("{}", render_text(location, &files, &batch, head)?);
    }
    Ok(())
}

fn relative<'a>(location: &Path, file: &'a Path) -> &'a Path {
    file.strip_prefix(location).unwrap_or(file)
}

fn describe(location: &Path, files: &[PathBuf], batch: &RecordBatch) -> serde_json::Value {
    let columns: Vec<_> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| {
            json!({
                "name": f.name(),
                "type": f.data_type().to_string(),
                "nullable": f.is_nullable(),
            })
        })
        .collect();
    let files: Vec<_> = files
        .iter()
        .map(|f| relative(location, f).display().to_string())
        .collect();
    json!({
        "path": location.display().to_string(),
        "rows": batch.num_rows(),
        "columns": columns,
        "files": files,
    })
}

fn render_text(
    location: &Path,
    files: &[PathBuf],
    batch: &RecordBatch,
    head: usize,
) -> anyhow::Result<String> {
    let mut out = vec![
        format!("=== {} ===", location.display()),
        format!("Rows:  {}", batch.num_rows()),
        format!("Files: {}", files.len()),
    ];
    out.extend(files.iter().map(|f| format!("  {}", relative(location, f).display())));
    out.push(String::new());
    out.push("Schema:".to_string());
    for field in batch.schema().fields() {
        let null = if field.is_nullable() { "" } else { " NOT NULL" };
        out.push(format!("  {:<24} {}{null}", field.name(), field.data_type()));
    }

    if head > 0 && batch.num_rows() > 0 {
        let preview = batch.slice(0, head.min(batch.num_rows()));
        out.push(String::new());
        out.push(pretty_format_batches(&[preview])?.to_string());
    }
    Ok(out.join("\n"))
}
