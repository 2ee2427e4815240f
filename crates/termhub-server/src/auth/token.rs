//! Long-lived token and the no-auth override flag.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use termhub_core::TermhubResult;
use tracing::{info, warn};

/// Checks a presented long-lived token.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, presented: &str) -> bool;
}

/// A single shared token, read once from a file.
///
/// Only the SHA-256 digest is kept in memory and compared.
#[derive(Debug, Clone, Default)]
pub struct StaticToken {
    digest: Option<[u8; 32]>,
}

impl StaticToken {
    pub fn new(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() {
            return Self::default();
        }
        Self {
            digest: Some(digest(token)),
        }
    }

    /// Read the token from `path`. A missing file means no token is accepted.
    pub fn from_file(path: &Path) -> TermhubResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let token = Self::new(&content);
                if token.digest.is_none() {
                    warn!(path = %path.display(), "token file is empty, token auth disabled");
                } else {
                    info!(path = %path.display(), "loaded access token");
                }
                Ok(token)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "token file not found, token auth disabled");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl TokenVerifier for StaticToken {
    fn verify(&self, presented: &str) -> bool {
        match &self.digest {
            Some(expected) => !presented.is_empty() && digest(presented) == *expected,
            None => false,
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

/// Process-wide override that disables authentication while a flag file
/// exists. Checked on every connection, so toggling needs no restart.
#[derive(Debug, Clone)]
pub struct NoAuthFlag {
    path: Option<PathBuf>,
}

impl NoAuthFlag {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// A flag that is never set.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_set(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_matches_trimmed_value() {
        let token = StaticToken::new("  s3cret\n");
        assert!(token.digest.is_some());
        assert!(token.verify("s3cret"));
        assert!(!token.verify("s3cret "));
        assert!(!token.verify("other"));
        assert!(!token.verify(""));
    }

    #[test]
    fn missing_token_file_accepts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let token = StaticToken::from_file(&dir.path().join("absent.txt")).unwrap();
        assert!(token.digest.is_none());
        assert!(!token.verify("anything"));
    }

    #[test]
    fn token_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin_token.txt");
        std::fs::write(&path, "abc123\n").unwrap();
        assert!(StaticToken::from_file(&path).unwrap().verify("abc123"));
    }

    #[test]
    fn flag_follows_file_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_auth");
        let flag = NoAuthFlag::new(path.clone());
        assert!(!flag.is_set());
        std::fs::write(&path, "").unwrap();
        assert!(flag.is_set());
        std::fs::remove_file(&path).unwrap();
        assert!(!flag.is_set());
        assert!(!NoAuthFlag::disabled().is_set());
    }
}
