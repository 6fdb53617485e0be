use std::path::Path;

use anyhow::Context;
use chrono::Local;
use medallion_core::{Layer, PipelineConfig};
use medallion_pipeline::{CommandRunner, plan, run_pipeline, run_stamp};

pub fn run(config_path: &str, layer: Option<Layer>, dry_run: bool) -> anyhow::Result<()> {
    let config_path = Path::new(config_path);
    let config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let stamp = run_stamp(config.timestamp_format(), Local::now());

    if dry_run {
        for job in plan(&config, base_dir, &stamp, layer) {
            println!(
                "[{}] {} → {}",
                job.layer,
                job.input.display(),
                job.output.display()
            );
        }
        return Ok(());
    }

    let runner = CommandRunner::from_config(&config);
    println!("=== Running pipeline '{}' (run {stamp}) ===", config.pipeline.name);
    let report = run_pipeline(&config, base_dir, &runner, &stamp, layer)?;
    for job in &report.completed {
        println!("✓ [{}] {}", job.layer, job.output.display());
    }
    println!("=== Pipeline completed: {} jobs ===", report.completed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_does_not_need_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("medallion.toml");
        let config = PipelineConfig::scaffold("retail");
        std::fs::write(&config_path, config.to_toml_string().unwrap()).unwrap();

        run(config_path.to_str().unwrap(), Some(Layer::Silver), true).unwrap();

        assert!(!dir.path().join("scripts/silver/outputs").exists());
    }

    #[test]
    fn missing_config_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("absent.toml");

        let err = run(config_path.to_str().unwrap(), None, false).unwrap_err();

        assert!(err.to_string().contains("absent.toml"), "{err}");
    }
}
