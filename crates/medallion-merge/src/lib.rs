//! medallion-merge: upsert merge into Parquet datasets.
//!
//! Maintains two tracking columns per record: `created_ts`, the first time a
//! key was seen, and `update_ts`, the last time its row was written. Each
//! merge reads the existing dataset (if any), splits the incoming batch into
//! new and already-known keys, stamps both sets with a single merge
//! timestamp, carries untouched rows over unchanged, and replaces the
//! dataset directory through a staged, rename-based swap.
//!
//! # Layout
//!
//! - [`location`]: tri-state existence probe, swap and crash recovery.
//! - [`dataset`]: Parquet read/write, Hive-style partitioning.
//! - [`schema`]: union by column name, tracking column handling.
//! - [`merge`]: the merge itself.

pub mod clock;
pub mod dataset;
pub mod error;
mod keys;
pub mod location;
pub mod merge;
pub mod schema;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dataset::{read_dataset, read_files, read_parquet, write_dataset};
pub use error::{MergeError, MergeResult};
pub use location::{Probe, probe, recover};
pub use merge::{DuplicatePolicy, MergeMode, MergeOptions, MergeReport, Merger, merge};
