//! Dataset locations: existence probing and crash-safe replacement.
//!
//! A merge never writes into the live location. It writes a complete copy to
//! a hidden staging sibling, then swaps it in with two renames:
//!
//! ```text
//! <location>                      -> .<name>.medallion-old
//! .<name>.medallion-tmp           -> <location>
//! rm -r .<name>.medallion-old
//! ```
//!
//! Both siblings carry a [`SWAP_MARKER`] file. [`recover`] only touches
//! directories that have it, so a neighbouring dataset that merely looks
//! like a sibling is never moved or deleted. A crash at any point leaves a
//! state that [`recover`] can repair without losing the last complete
//! dataset.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{MergeError, MergeResult, fault_at};

const STAGING_SUFFIX: &str = ".medallion-tmp";
const BACKUP_SUFFIX: &str = ".medallion-old";

/// File that marks a directory as owned by an in-flight swap.
pub const SWAP_MARKER: &str = ".medallion-swap";

/// Outcome of probing a dataset location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Nothing there, or a directory without data files.
    Absent,
    /// Data files found, sorted by path.
    Present(Vec<PathBuf>),
}

/// Probe `location` for Parquet data.
///
/// Only "does not exist" and "exists but holds no data files" map to
/// [`Probe::Absent`]. Permission problems, unreadable directories, or a
/// regular file sitting at the location are faults.
pub fn probe(location: &Path) -> MergeResult<Probe> {
    if !exists(location)? {
        return Ok(Probe::Absent);
    }
    let meta = fs::metadata(location).map_err(fault_at!(location))?;
    if !meta.is_dir() {
        return Err(MergeError::storage(location, "location is not a directory"));
    }

    let files = data_files(location)?;
    if files.is_empty() {
        debug!(location = %location.display(), "location has no data files");
        Ok(Probe::Absent)
    } else {
        Ok(Probe::Present(files))
    }
}

fn data_files(dir: &Path) -> MergeResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
    for entry in walker {
        let entry = entry.map_err(|e| MergeError::storage(e.path().unwrap_or(dir), &e))?;
        let is_parquet = entry.path().extension().is_some_and(|ext| ext == "parquet");
        if entry.file_type().is_file() && is_parquet {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Bookkeeping files (`_SUCCESS`, `.crc`, ...) are skipped. A `_` name with
/// `=` in it is a partition directory, not bookkeeping.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(is_hidden_name)
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.') || (name.starts_with('_') && !name.contains('='))
}

pub(crate) fn exists(path: &Path) -> MergeResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MergeError::storage(path, e)),
    }
}

fn sibling(location: &Path, suffix: &str) -> MergeResult<PathBuf> {
    let name = location.file_name().ok_or_else(|| {
        MergeError::InvalidOptions(format!(
            "location {} has no final path component",
            location.display()
        ))
    })?;
    let mut hidden = OsString::from(".");
    hidden.push(name);
    hidden.push(suffix);
    Ok(location.with_file_name(hidden))
}

/// Where a merge stages its output before swapping it in.
pub fn staging_path(location: &Path) -> MergeResult<PathBuf> {
    sibling(location, STAGING_SUFFIX)
}

/// Where the previous dataset is parked while the swap is in flight.
pub fn backup_path(location: &Path) -> MergeResult<PathBuf> {
    sibling(location, BACKUP_SUFFIX)
}

/// Create `dir` (if needed) and mark it as owned by a swap.
pub fn mark_for_swap(dir: &Path) -> MergeResult<()> {
    fs::create_dir_all(dir).map_err(fault_at!(dir))?;
    let marker = dir.join(SWAP_MARKER);
    fs::write(&marker, b"").map_err(fault_at!(&marker))
}

fn is_marked(dir: &Path) -> MergeResult<bool> {
    exists(&dir.join(SWAP_MARKER))
}

/// Replace whatever is at `target` with the fully written `staged` directory.
pub fn replace_location(staged: &Path, target: &Path) -> MergeResult<()> {
    let backup = backup_path(target)?;
    if exists(&backup)? {
        if !is_marked(&backup)? {
            return Err(MergeError::storage(
                &backup,
                "backup path is occupied by a directory this merge did not create",
            ));
        }
        fs::remove_dir_all(&backup).map_err(fault_at!(&backup))?;
    }

    let had_target = exists(target)?;
    if had_target {
        mark_for_swap(target)?;
        fs::rename(target, &backup).map_err(fault_at!(target))?;
    }

    if let Err(e) = fs::rename(staged, target) {
        if had_target {
            if let Err(restore) = fs::rename(&backup, target) {
                warn!(
                    target = %target.display(),
                    backup = %backup.display(),
                    error = %restore,
                    "could not restore previous dataset; run recovery before the next merge"
                );
            }
        }
        return Err(MergeError::storage(target, e));
    }

    if had_target {
        // The new dataset is live; a leftover backup is cleaned up by `recover`.
        if let Err(e) = fs::remove_dir_all(&backup) {
            warn!(backup = %backup.display(), error = %e, "failed to remove previous dataset");
        }
    }
    debug!(target = %target.display(), "dataset swapped into place");
    Ok(())
}

/// Repair the leftovers of an interrupted merge at `location`.
///
/// - `<location>` missing, backup present: the swap stopped half way; the
///   previous dataset is moved back.
/// - both present: the swap finished but cleanup did not; the backup goes.
/// - staging present: a write or swap was interrupted; it is removed.
///
/// Siblings without the swap marker are left alone.
pub fn recover(location: &Path) -> MergeResult<()> {
    let backup = backup_path(location)?;
    let staging = staging_path(location)?;

    if exists(&backup)? && !is_marked(&backup)? {
        warn!(backup = %backup.display(), "unmarked directory at backup path, leaving it alone");
    } else if exists(&backup)? {
        if exists(location)? {
            warn!(backup = %backup.display(), "removing leftover backup of a completed swap");
            fs::remove_dir_all(&backup).map_err(fault_at!(&backup))?;
        } else {
            warn!(location = %location.display(), "restoring dataset from interrupted swap");
            fs::rename(&backup, location).map_err(fault_at!(location))?;
        }
    }

    if exists(&staging)? && !is_marked(&staging)? {
        warn!(staging = %staging.display(), "unmarked directory at staging path, leaving it alone");
    } else if exists(&staging)? {
        warn!(staging = %staging.display(), "removing stale staging directory");
        fs::remove_dir_all(&staging).map_err(fault_at!(&staging))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn probe_missing_and_empty_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("customers");
        assert_eq!(probe(&location).unwrap(), Probe::Absent);

        fs::create_dir(&location).unwrap();
        touch(&location.join("_SUCCESS"));
        touch(&location.join(".part-00000.parquet.crc"));
        assert_eq!(probe(&location).unwrap(), Probe::Absent);
    }

    #[test]
    fn probe_lists_nested_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("orders");
        touch(&location.join("region=us/part-00000.parquet"));
        touch(&location.join("region=eu/part-00000.parquet"));
        touch(&location.join("_temporary/part-00009.parquet"));

        let Probe::Present(files) = probe(&location).unwrap() else {
            panic!("expected data files");
        };
        assert_eq!(
            files,
            vec![
                location.join("region=eu/part-00000.parquet"),
                location.join("region=us/part-00000.parquet"),
            ]
        );
    }

    #[test]
    fn probe_regular_file_is_fault() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("not_a_dir");
        fs::write(&location, b"oops").unwrap();
        assert!(matches!(
            probe(&location),
            Err(MergeError::StorageFault { .. })
        ));
    }

    #[test]
    fn underscore_partition_directories_are_data() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("orders");
        touch(&location.join("_region=eu/part-00000.parquet"));
        touch(&location.join("_committed_123/part-00000.parquet"));

        assert_eq!(
            probe(&location).unwrap(),
            Probe::Present(vec![location.join("_region=eu/part-00000.parquet")])
        );
    }

    #[test]
    fn hidden_names() {
        assert!(is_hidden_name(".orders.medallion-tmp"));
        assert!(is_hidden_name("_SUCCESS"));
        assert!(is_hidden_name("_temporary"));
        assert!(!is_hidden_name("_region=eu"));
        assert!(!is_hidden_name("region=eu"));
        assert!(!is_hidden_name("part-00000.parquet"));
    }

    #[test]
    fn sibling_paths() {
        let location = Path::new("/lake/silver/dim_customer");
        assert_eq!(
            staging_path(location).unwrap(),
            PathBuf::from("/lake/silver/.dim_customer.medallion-tmp")
        );
        assert_eq!(
            backup_path(location).unwrap(),
            PathBuf::from("/lake/silver/.dim_customer.medallion-old")
        );
        assert!(staging_path(Path::new("/")).is_err());
    }

    /// A staged directory as a merge leaves it.
    fn staged_with(path: &Path, file: &str) {
        mark_for_swap(path).unwrap();
        touch(&path.join(file));
    }

    #[test]
    fn replace_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let staged = staging_path(&target).unwrap();
        touch(&target.join("old.parquet"));
        staged_with(&staged, "new.parquet");

        replace_location(&staged, &target).unwrap();

        assert!(target.join("new.parquet").exists());
        assert!(!target.join("old.parquet").exists());
        assert!(!staged.exists());
        assert!(!backup_path(&target).unwrap().exists());
    }

    #[test]
    fn replace_into_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let staged = staging_path(&target).unwrap();
        staged_with(&staged, "new.parquet");

        replace_location(&staged, &target).unwrap();
        assert!(target.join("new.parquet").exists());
    }

    #[test]
    fn replace_refuses_unmarked_backup_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let staged = staging_path(&target).unwrap();
        let squatter = backup_path(&target).unwrap();
        touch(&target.join("old.parquet"));
        touch(&squatter.join("keep.parquet"));
        staged_with(&staged, "new.parquet");

        let err = replace_location(&staged, &target).unwrap_err();

        assert!(matches!(err, MergeError::StorageFault { .. }), "{err}");
        assert!(squatter.join("keep.parquet").exists());
        assert!(target.join("old.parquet").exists());
    }

    #[test]
    fn recover_restores_half_swapped_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let backup = backup_path(&target).unwrap();
        let staging = staging_path(&target).unwrap();
        staged_with(&backup, "part-00000.parquet");
        staged_with(&staging, "part-00000.parquet");

        recover(&target).unwrap();

        assert!(target.join("part-00000.parquet").exists());
        assert!(!backup.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn recover_drops_backup_of_finished_swap() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let backup = backup_path(&target).unwrap();
        touch(&target.join("new.parquet"));
        staged_with(&backup, "old.parquet");

        recover(&target).unwrap();

        assert!(target.join("new.parquet").exists());
        assert!(!backup.exists());
    }

    #[test]
    fn recover_leaves_unmarked_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let backup = backup_path(&target).unwrap();
        let staging = staging_path(&target).unwrap();
        touch(&backup.join("old.parquet"));
        touch(&staging.join("new.parquet"));
        touch(&dir.path().join("t_old/part-00000.parquet"));

        recover(&target).unwrap();

        assert!(!target.exists());
        assert!(backup.join("old.parquet").exists());
        assert!(staging.join("new.parquet").exists());
        assert!(dir.path().join("t_old/part-00000.parquet").exists());
    }

    #[test]
    fn recover_is_noop_on_clean_location() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        recover(&target).unwrap();
        assert!(!target.exists());
    }
}
