use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

/// Per-run working directory under the configured work root.
///
/// Scoped directories are removed when the `WorkDir` drops, on success,
/// failure, or unwinding. Kept directories stay on disk for inspection.
pub struct WorkDir {
    inner: Inner,
}

enum Inner {
    Scoped(TempDir),
    Kept(PathBuf),
}

impl WorkDir {
    /// Create `<root>/<repo>-<random>`; the random suffix keeps concurrent
    /// runs of the same repository apart.
    pub fn create(root: &Path, repo: &str, keep: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize(repo)))
            .tempdir_in(root)?;
        let inner = if keep {
            let path = dir.keep();
            info!("keeping working directory {}", path.display());
            Inner::Kept(path)
        } else {
            Inner::Scoped(dir)
        };
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        match &self.inner {
            Inner::Scoped(dir) => dir.path(),
            Inner::Kept(path) => path,
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Inner::Scoped(dir) = &self.inner {
            debug!("removing working directory {}", dir.path().display());
        }
    }
}

fn sanitize(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if s.is_empty() {
        "repo".to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_dir_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let wd = WorkDir::create(root.path(), "widgets", false).unwrap();
            std::fs::write(wd.path().join("file"), "x").unwrap();
            assert!(wd.path().is_dir());
            wd.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn kept_dir_survives_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let wd = WorkDir::create(root.path(), "widgets", true).unwrap();
            wd.path().to_path_buf()
        };
        assert!(path.is_dir());
    }

    #[test]
    fn concurrent_dirs_for_same_repo_differ() {
        let root = tempfile::tempdir().unwrap();
        let a = WorkDir::create(root.path(), "widgets", false).unwrap();
        let b = WorkDir::create(root.path(), "widgets", false).unwrap();
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("widgets-"));
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("a/b c"), "a_b_c");
        assert_eq!(sanitize(""), "repo");
    }
}
