//! Working-directory policy for new sessions.

use std::path::{Path, PathBuf};
use termhub_core::{TermhubError, TermhubResult};
use tracing::warn;

/// Decides whether a requested working directory may be used.
pub trait PathPolicy: Send + Sync {
    /// Return the canonical directory to use, or why it is refused.
    fn check(&self, requested: &Path) -> TermhubResult<PathBuf>;
}

/// Confines working directories to a set of root directories.
///
/// With no roots configured, any existing directory is allowed.
#[derive(Debug, Clone, Default)]
pub struct RootJail {
    roots: Vec<PathBuf>,
}

impl RootJail {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .filter_map(|root| match root.canonicalize() {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "ignoring unusable jail root");
                    None
                }
            })
            .collect();
        Self { roots }
    }

    pub fn unrestricted() -> Self {
        Self::default()
    }
}

impl PathPolicy for RootJail {
    fn check(&self, requested: &Path) -> TermhubResult<PathBuf> {
        let canonical = requested.canonicalize().map_err(|e| {
            TermhubError::PathRejected(format!("{}: {e}", requested.display()))
        })?;
        if !canonical.is_dir() {
            return Err(TermhubError::PathRejected(format!(
                "{}: not a directory",
                canonical.display()
            )));
        }
        if self.roots.is_empty() || self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(canonical)
        } else {
            Err(TermhubError::PathRejected(format!(
                "{}: outside allowed roots",
                canonical.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_accepts_existing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let jail = RootJail::unrestricted();
        assert_eq!(jail.check(dir.path()).unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_missing_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let jail = RootJail::unrestricted();
        assert!(jail.check(&dir.path().join("missing")).is_err());
        assert!(jail.check(&file).is_err());
    }

    #[test]
    fn confines_to_roots() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let nested = allowed.path().join("project");
        std::fs::create_dir(&nested).unwrap();

        let jail = RootJail::new([allowed.path().to_path_buf()]);
        assert!(jail.check(&nested).is_ok());
        assert!(jail.check(other.path()).is_err());
        // `..` cannot climb out once canonicalized.
        assert!(jail.check(&nested.join("..").join("..")).is_err());
    }
}
