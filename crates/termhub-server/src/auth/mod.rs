//! Connection authentication.
//!
//! Three sources are consulted in a fixed order: the no-auth flag, a
//! short-lived session key, then the long-lived token. The first that
//! accepts wins; a bad credential from one source never blocks a later one.

pub mod session_keys;
pub mod token;

pub use session_keys::{SessionKeyStore, DEFAULT_KEY_TTL};
pub use token::{NoAuthFlag, StaticToken, TokenVerifier};

use std::sync::Arc;
use termhub_core::{TermhubError, TermhubResult};
use tracing::{debug, info};

/// Credentials presented on a connection.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Session key from the query string.
    pub key: Option<String>,
    /// Long-lived token from the header or, failing that, the query string.
    pub token: Option<String>,
}

impl Credentials {
    /// Combine query and header values. The header token wins.
    pub fn new(
        key: Option<String>,
        query_token: Option<String>,
        header_token: Option<String>,
    ) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()),
            token: header_token.or(query_token).filter(|t| !t.is_empty()),
        }
    }
}

/// How a connection was let in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGrant {
    NoAuth,
    SessionKey,
    Token,
}

impl AuthGrant {
    /// Whether this grant may mint session keys.
    pub fn can_issue_keys(self) -> bool {
        !matches!(self, AuthGrant::SessionKey)
    }
}

/// Resolves credentials against the configured sources.
pub struct Authenticator {
    no_auth: NoAuthFlag,
    keys: Arc<SessionKeyStore>,
    token: Arc<dyn TokenVerifier>,
}

impl Authenticator {
    pub fn new(
        no_auth: NoAuthFlag,
        keys: Arc<SessionKeyStore>,
        token: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self { no_auth, keys, token }
    }

    pub fn authenticate(&self, creds: &Credentials) -> TermhubResult<AuthGrant> {
        if self.no_auth.is_set() {
            debug!("no-auth flag set, connection allowed");
            return Ok(AuthGrant::NoAuth);
        }
        if let Some(key) = &creds.key {
            if self.keys.validate(key) {
                return Ok(AuthGrant::SessionKey);
            }
            debug!("session key rejected");
        }
        if let Some(token) = &creds.token {
            if self.token.verify(token) {
                return Ok(AuthGrant::Token);
            }
            debug!("token rejected");
        }
        Err(TermhubError::AuthFailed("no valid credential".into()))
    }

    /// Mint a session key for a connection holding `grant`.
    pub fn issue_key(&self, grant: AuthGrant) -> TermhubResult<String> {
        if !grant.can_issue_keys() {
            return Err(TermhubError::AuthFailed(
                "session keys cannot be used to obtain further keys".into(),
            ));
        }
        let key = self.keys.issue();
        info!(?grant, "session key issued");
        Ok(key)
    }

    pub fn keys(&self) -> &SessionKeyStore {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with(flag: NoAuthFlag) -> Authenticator {
        Authenticator::new(
            flag,
            Arc::new(SessionKeyStore::default()),
            Arc::new(StaticToken::new("tok")),
        )
    }

    #[test]
    fn order_is_flag_then_key_then_token() {
        let auth = auth_with(NoAuthFlag::disabled());
        let key = auth.issue_key(AuthGrant::Token).unwrap();

        let by_key = Credentials::new(Some(key.clone()), None, None);
        assert_eq!(auth.authenticate(&by_key).unwrap(), AuthGrant::SessionKey);

        let by_token = Credentials::new(None, Some("tok".into()), None);
        assert_eq!(auth.authenticate(&by_token).unwrap(), AuthGrant::Token);

        // A bad key falls through to a good token.
        let both = Credentials::new(Some("stale".into()), None, Some("tok".into()));
        assert_eq!(auth.authenticate(&both).unwrap(), AuthGrant::Token);

        assert!(auth.authenticate(&Credentials::default()).is_err());
        let wrong = Credentials::new(Some("x".into()), Some("y".into()), None);
        assert!(matches!(auth.authenticate(&wrong), Err(TermhubError::AuthFailed(_))));
    }

    #[test]
    fn no_auth_flag_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_auth");
        std::fs::write(&path, "").unwrap();
        let auth = auth_with(NoAuthFlag::new(path));
        assert_eq!(auth.authenticate(&Credentials::default()).unwrap(), AuthGrant::NoAuth);
    }

    #[test]
    fn header_token_wins_over_query() {
        let creds = Credentials::new(None, Some("query".into()), Some("header".into()));
        assert_eq!(creds.token.as_deref(), Some("header"));
        let creds = Credentials::new(Some(String::new()), Some("query".into()), None);
        assert_eq!(creds.key, None);
        assert_eq!(creds.token.as_deref(), Some("query"));
    }

    #[test]
    fn session_key_cannot_mint_keys() {
        let auth = auth_with(NoAuthFlag::disabled());
        assert!(auth.issue_key(AuthGrant::SessionKey).is_err());
        assert!(auth.issue_key(AuthGrant::NoAuth).is_ok());
        assert_eq!(auth.keys().len(), 1);
    }
}
