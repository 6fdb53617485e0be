pub mod config;
pub mod types;

pub use config::{ConfigError, PipelineConfig};
pub use types::*;
