use log::debug;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// Removes a staging path when dropped unless the operation succeeded.
///
/// Staging directories live next to their final location and are published
/// by rename. A fetch or layout write that fails, or whose future is dropped
/// on cancellation, leaves nothing behind.
pub struct StagingGuard<'a, R: Runtime + ?Sized> {
    runtime: &'a R,
    path: Option<PathBuf>,
}

impl<'a, R: Runtime + ?Sized> StagingGuard<'a, R> {
    pub fn new(runtime: &'a R, path: PathBuf) -> Self {
        Self {
            runtime,
            path: Some(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Mark the operation as successful; the path is kept.
    pub fn success(mut self) {
        self.path = None;
    }
}

impl<R: Runtime + ?Sized> Drop for StagingGuard<'_, R> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!("Cleaning up: {:?}", path);
            if self.runtime.is_dir(&path) {
                let _ = self.runtime.remove_dir_all(&path);
            } else if self.runtime.exists(&path) {
                let _ = self.runtime.remove_file(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_guard_removes_dir_on_drop() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join(".staging-1");
        fs::create_dir(&staging).unwrap();
        fs::write(staging.join("file.txt"), "test").unwrap();

        {
            let guard = StagingGuard::new(&RealRuntime, staging.clone());
            assert_eq!(guard.path(), staging.as_path());
        }

        assert!(!staging.exists());
    }

    #[test]
    fn test_guard_removes_file_on_drop() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("partial.tmp");
        fs::write(&file_path, "test").unwrap();

        drop(StagingGuard::new(&RealRuntime, file_path.clone()));

        assert!(!file_path.exists());
    }

    #[test]
    fn test_guard_success_keeps_path() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("published");
        fs::create_dir(&staging).unwrap();

        StagingGuard::new(&RealRuntime, staging.clone()).success();

        assert!(staging.exists());
    }

    #[test]
    fn test_guard_missing_path_is_fine() {
        drop(StagingGuard::new(&RealRuntime, PathBuf::from("/nonexistent/staging")));
    }

    #[test]
    fn test_guard_cleans_up_through_runtime() {
        let staging = PathBuf::from("/store/.staging-1");
        let mut runtime = MockRuntime::new();
        runtime
            .expect_is_dir()
            .with(eq(staging.clone()))
            .returning(|_| true);
        runtime
            .expect_remove_dir_all()
            .with(eq(staging.clone()))
            .times(1)
            .returning(|_| Ok(()));

        drop(StagingGuard::new(&runtime, staging));
    }

    #[test]
    fn test_guard_ignores_cleanup_failure() {
        let mut runtime = MockRuntime::new();
        runtime.expect_is_dir().returning(|_| false);
        runtime.expect_exists().returning(|_| true);
        runtime
            .expect_remove_file()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("permission denied")));

        drop(StagingGuard::new(&runtime, PathBuf::from("/store/layout.tmp")));
    }
}
