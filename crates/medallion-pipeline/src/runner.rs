//! Job execution.
//!
//! The default runner shells out to papermill:
//!
//! ```text
//! papermill <input> <output>
//! ```
//!
//! Both the program and its argument template come from `[pipeline]` in
//! medallion.toml. `{input}` and `{output}` are replaced per job.

use anyhow::{Context, Result, bail};
use std::process::Command;
use tracing::debug;

use medallion_core::PipelineConfig;

use crate::PlannedJob;

/// Executes a single planned job. Must block until the job has finished.
pub trait JobRunner {
    fn run(&self, job: &PlannedJob) -> Result<()>;
}

/// Runs each job as an external process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.runner(), config.runner_args())
    }

    /// Argument list for `job`, with placeholders substituted.
    pub fn args_for(&self, job: &PlannedJob) -> Vec<String> {
        let input = job.input.to_string_lossy();
        let output = job.output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl JobRunner for CommandRunner {
    fn run(&self, job: &PlannedJob) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(job));

        debug!("Running: {:?}", cmd);

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute runner '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} failed for {} (exit code: {}).\n\nStderr:\n{}",
                self.program,
                job.input.display(),
                output.status.code().unwrap_or(-1),
                stderr.trim_end()
            );
        }
        Ok(())
    }
}
