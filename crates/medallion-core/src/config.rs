//! medallion.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{JobSpec, Layer};

pub const DEFAULT_RUNNER: &str = "papermill";
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(rename = "layer", default)]
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,
    /// Executable invoked once per job.
    pub runner: Option<String>,
    /// Runner arguments; `{input}` and `{output}` are substituted per job.
    pub runner_args: Option<Vec<String>>,
    /// chrono format string for the per-run stamp in output file names.
    pub timestamp_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: Layer,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Semantic problems in an otherwise well-formed medallion.toml.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("layer '{0}' is declared more than once")]
    DuplicateLayer(Layer),

    #[error("job '{job}' is declared more than once in layer '{layer}'")]
    DuplicateJob { layer: Layer, job: String },

    #[error("job in layer '{0}' has an empty name")]
    EmptyJobName(Layer),

    #[error("pipeline declares no jobs")]
    NoJobs,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_layers = HashSet::new();
        for layer in &self.layers {
            if !seen_layers.insert(layer.name) {
                return Err(ConfigError::DuplicateLayer(layer.name));
            }
            let mut seen_jobs = HashSet::new();
            for job in &layer.jobs {
                if job.name.trim().is_empty() {
                    return Err(ConfigError::EmptyJobName(layer.name));
                }
                if !seen_jobs.insert(job.name.as_str()) {
                    return Err(ConfigError::DuplicateJob {
                        layer: layer.name,
                        job: job.name.clone(),
                    });
                }
            }
        }
        if self.layers.iter().all(|l| l.jobs.is_empty()) {
            return Err(ConfigError::NoJobs);
        }
        Ok(())
    }

    /// Layers in execution order, regardless of declaration order.
    pub fn ordered_layers(&self) -> Vec<&LayerConfig> {
        let mut layers: Vec<&LayerConfig> = self.layers.iter().collect();
        layers.sort_by_key(|l| l.name);
        layers
    }

    pub fn runner(&self) -> &str {
        self.pipeline.runner.as_deref().unwrap_or(DEFAULT_RUNNER)
    }

    pub fn runner_args(&self) -> Vec<String> {
        self.pipeline
            .runner_args
            .clone()
            .unwrap_or_else(|| vec!["{input}".to_string(), "{output}".to_string()])
    }

    pub fn timestamp_format(&self) -> &str {
        self.pipeline
            .timestamp_format
            .as_deref()
            .unwrap_or(DEFAULT_TIMESTAMP_FORMAT)
    }

    /// Scaffold a medallion.toml with one placeholder job per layer.
    pub fn scaffold(name: &str) -> Self {
        let layers = Layer::ALL
            .iter()
            .map(|layer| LayerConfig {
                name: *layer,
                output_dir: PathBuf::from(format!("scripts/{layer}/outputs")),
                jobs: vec![JobSpec {
                    name: "example".to_string(),
                    input: PathBuf::from(format!("scripts/{layer}/example.ipynb")),
                }],
            })
            .collect();

        PipelineConfig {
            pipeline: PipelineSection {
                name: name.to_string(),
                runner: Some(DEFAULT_RUNNER.to_string()),
                runner_args: None,
                timestamp_format: Some(DEFAULT_TIMESTAMP_FORMAT.to_string()),
            },
            layers,
        }
    }
}
