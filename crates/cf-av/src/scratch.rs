//! Scratch storage for in-flight artifacts.
//!
//! Every job gets its own [`ScratchArea`], a temporary directory under the
//! configured scratch root. The directory and everything in it is removed when
//! the area is dropped, so a job leaves nothing behind whether it completes,
//! fails or panics. Directories orphaned by a killed process are reclaimed by
//! [`Scratch::sweep`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

/// Root of all per-job scratch areas.
#[derive(Debug, Clone)]
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    /// Use `root` as the scratch root, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> cf_core::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh area whose directory name starts with `label`.
    pub fn area(&self, label: &str) -> cf_core::Result<ScratchArea> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(&self.root)?;
        tracing::debug!(path = %dir.path().display(), "Created scratch area");
        Ok(ScratchArea {
            dir,
            counter: AtomicUsize::new(0),
        })
    }

    /// Remove scratch directories last modified more than `max_age` ago.
    ///
    /// Returns the number of directories removed. Entries that cannot be
    /// inspected or removed are logged and skipped.
    pub fn sweep(&self, max_age: Duration) -> cf_core::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), age_secs = age.as_secs(), "Removed stale scratch area");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to remove stale scratch area: {e}");
                }
            }
        }

        Ok(removed)
    }
}

/// A job-scoped scratch directory, deleted on drop.
#[derive(Debug)]
pub struct ScratchArea {
    dir: TempDir,
    counter: AtomicUsize,
}

impl ScratchArea {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A new, unused file path inside the area.
    ///
    /// Names are prefixed with a sequence number so two artifacts for the
    /// same step never collide.
    pub fn file(&self, stem: &str, ext: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.path().join(format!("{n:03}-{stem}.{ext}"))
    }

    /// Delete an intermediate file early. Missing files are ignored.
    pub fn release(&self, path: &Path) {
        if !path.starts_with(self.dir.path()) {
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::trace!(path = %path.display(), "Released scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!(path = %path.display(), "Failed to release scratch file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(root.path()).unwrap();

        let area = scratch.area("job-1").unwrap();
        let dir = area.path().to_path_buf();
        let file = area.file("source", "mp4");
        std::fs::write(&file, b"data").unwrap();
        assert!(file.exists());

        drop(area);
        assert!(!dir.exists());
    }

    #[test]
    fn file_names_are_unique_and_sanitized() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(root.path()).unwrap();
        let area = scratch.area("job").unwrap();

        let a = area.file("step 1/x", "mp4");
        let b = area.file("step 1/x", "mp4");
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(area.path()));
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "000-step_1_x.mp4");
    }

    #[test]
    fn release_ignores_foreign_and_missing_paths() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(root.path()).unwrap();
        let area = scratch.area("job").unwrap();

        let outside = root.path().join("keep.txt");
        std::fs::write(&outside, b"x").unwrap();
        area.release(&outside);
        assert!(outside.exists());

        area.release(&area.file("never-written", "mp4"));

        let inside = area.file("tmp", "mp4");
        std::fs::write(&inside, b"x").unwrap();
        area.release(&inside);
        assert!(!inside.exists());
    }

    #[test]
    fn sweep_removes_only_old_dirs() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(root.path()).unwrap();

        let stale = root.path().join("stale-job");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(root.path().join("loose-file"), b"x").unwrap();

        // Everything counts as stale with a zero max age.
        assert_eq!(scratch.sweep(Duration::ZERO).unwrap(), 1);
        assert!(!stale.exists());
        assert!(root.path().join("loose-file").exists());

        std::fs::create_dir(&stale).unwrap();
        assert_eq!(scratch.sweep(Duration::from_secs(3600)).unwrap(), 0);
        assert!(stale.exists());
    }
}
