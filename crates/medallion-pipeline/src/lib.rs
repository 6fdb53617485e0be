//! medallion pipeline: run layer jobs in bronze → silver → gold order.
//!
//! Every job gets an output path generated from its layer, its name, and a
//! stamp computed once per run:
//!
//! ```text
//! <output_dir>/<layer>_<job>_<stamp>.<input extension>
//! ```
//!
//! Jobs run one at a time. The first failure stops the run; there is no
//! retry and nothing is skipped.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use medallion_core::{Layer, PipelineConfig};

pub mod runner;

pub use runner::{CommandRunner, JobRunner};

/// A job with its resolved input and generated output path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub layer: Layer,
    pub name: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub run_stamp: String,
    pub completed: Vec<PlannedJob>,
}

/// Format the per-run stamp embedded in output file names.
pub fn run_stamp<Tz>(format: &str, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.format(format).to_string()
}

/// Resolve every job of `config` (optionally a single layer) in execution order.
///
/// Relative paths in the config are resolved against `base_dir`.
pub fn plan(
    config: &PipelineConfig,
    base_dir: &Path,
    stamp: &str,
    only: Option<Layer>,
) -> Vec<PlannedJob> {
    config
        .ordered_layers()
        .into_iter()
        .filter(|layer| only.is_none_or(|l| l == layer.name))
        .flat_map(|layer| {
            let output_dir = base_dir.join(&layer.output_dir);
            layer.jobs.iter().map(move |job| {
                let mut file_name = format!("{}_{}_{stamp}", layer.name, job.name);
                if let Some(ext) = job.input.extension() {
                    file_name.push('.');
                    file_name.push_str(&ext.to_string_lossy());
                }
                PlannedJob {
                    layer: layer.name,
                    name: job.name.clone(),
                    input: base_dir.join(&job.input),
                    output: output_dir.join(file_name),
                }
            })
        })
        .collect()
}

/// Run the pipeline, stopping at the first failing job.
pub fn run_pipeline(
    config: &PipelineConfig,
    base_dir: &Path,
    runner: &dyn JobRunner,
    stamp: &str,
    only: Option<Layer>,
) -> Result<PipelineReport> {
    let jobs = plan(config, base_dir, stamp, only);
    if jobs.is_empty() {
        bail!("Nothing to run: no jobs selected");
    }

    info!(pipeline = %config.pipeline.name, jobs = jobs.len(), %stamp, "pipeline started");

    let mut completed = Vec::with_capacity(jobs.len());
    for job in jobs {
        if !job.input.is_file() {
            bail!(
                "Input for {} job '{}' not found: {}",
                job.layer,
                job.name,
                job.input.display()
            );
        }
        if let Some(parent) = job.output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        info!(layer = %job.layer, job = %job.name, input = %job.input.display(), "RUN");
        runner
            .run(&job)
            .with_context(|| format!("{} job '{}' failed", job.layer, job.name))?;
        info!(layer = %job.layer, job = %job.name, output = %job.output.display(), "OK");

        completed.push(job);
    }

    info!(pipeline = %config.pipeline.name, "pipeline completed");
    Ok(PipelineReport {
        pipeline: config.pipeline.name.clone(),
        run_stamp: stamp.to_string(),
        completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;

    /// Records jobs instead of running them; fails on a named job.
    #[derive(Default)]
    struct RecordingRunner {
        ran: RefCell<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl JobRunner for RecordingRunner {
        fn run(&self, job: &PlannedJob) -> Result<()> {
            self.ran.borrow_mut().push(format!("{}/{}", job.layer, job.name));
            if self.fail_on == Some(job.name.as_str()) {
                bail!("boom");
            }
            fs::write(&job.output, b"{}")?;
            Ok(())
        }
    }

    const CONFIG: &str = r#"
[pipeline]
name = "retail"

[[layer]]
name = "gold"
output_dir = "gold/outputs"
jobs = [{ name = "dim_features", input = "gold/dim_features.ipynb" }]

[[layer]]
name = "bronze"
output_dir = "bronze/outputs"
jobs = [
  { name = "customer", input = "bronze/customer.ipynb" },
  { name = "product", input = "bronze/product.ipynb" },
]

[[layer]]
name = "silver"
output_dir = "silver/outputs"
jobs = [{ name = "dim_customer", input = "silver/dim_customer.ipynb" }]
"#;

    fn workspace() -> (tempfile::TempDir, PipelineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config: PipelineConfig = toml::from_str(CONFIG).unwrap();
        for layer in &config.layers {
            for job in &layer.jobs {
                let input = dir.path().join(&job.input);
                fs::create_dir_all(input.parent().unwrap()).unwrap();
                fs::write(input, b"{}").unwrap();
            }
        }
        (dir, config)
    }

    #[test]
    fn run_stamp_uses_format() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 8, 5, 9).unwrap();
        assert_eq!(run_stamp("%Y%m%d_%H%M%S", now), "20250131_080509");
    }

    #[test]
    fn plan_orders_layers_and_names_outputs() {
        let (dir, config) = workspace();
        let jobs = plan(&config, dir.path(), "20250131_080509", None);

        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["customer", "product", "dim_customer", "dim_features"]);
        assert_eq!(
            jobs[0].output,
            dir.path()
                .join("bronze/outputs/bronze_customer_20250131_080509.ipynb")
        );
        assert_eq!(jobs[0].input, dir.path().join("bronze/customer.ipynb"));
    }

    #[test]
    fn plan_single_layer() {
        let (dir, config) = workspace();
        let jobs = plan(&config, dir.path(), "s", Some(Layer::Silver));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].layer, Layer::Silver);
    }

    #[test]
    fn run_executes_in_order_and_creates_output_dirs() {
        let (dir, config) = workspace();
        let runner = RecordingRunner::default();

        let report = run_pipeline(&config, dir.path(), &runner, "s1", None).unwrap();

        assert_eq!(
            *runner.ran.borrow(),
            vec![
                "bronze/customer",
                "bronze/product",
                "silver/dim_customer",
                "gold/dim_features"
            ]
        );
        assert_eq!(report.completed.len(), 4);
        assert!(dir.path().join("gold/outputs/gold_dim_features_s1.ipynb").is_file());
    }

    #[test]
    fn first_failure_stops_the_run() {
        let (dir, config) = workspace();
        let runner = RecordingRunner {
            fail_on: Some("product"),
            ..Default::default()
        };

        let err = run_pipeline(&config, dir.path(), &runner, "s1", None).unwrap_err();

        assert!(err.to_string().contains("bronze job 'product' failed"), "{err}");
        assert_eq!(runner.ran.borrow().len(), 2);
        assert!(!dir.path().join("silver/outputs").exists());
    }

    #[test]
    fn missing_input_fails_before_running_job() {
        let (dir, config) = workspace();
        fs::remove_file(dir.path().join("silver/dim_customer.ipynb")).unwrap();
        let runner = RecordingRunner::default();

        let err = run_pipeline(&config, dir.path(), &runner, "s1", None).unwrap_err();

        assert!(err.to_string().contains("not found"), "{err}");
        assert_eq!(runner.ran.borrow().len(), 2);
    }
}
