//! Credential lookup
//!
//! The orchestrator only ever stores credential ids. Secrets are resolved
//! at the moment they are needed and never logged.

use std::collections::HashMap;

/// An opaque secret resolved from a credential id
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// External secret store addressed by credential id
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, id: &str) -> Option<Credential>;
}

/// Resolves `<id>` from the `KEEL_CREDENTIAL_<ID>` environment variable
///
/// The id is upper-cased and `-`/`.` become `_`. Values are
/// `username:password`, the form podman accepts for `--creds`.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self
    }

    fn var_name(id: &str) -> String {
        let suffix: String = id
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("KEEL_CREDENTIAL_{suffix}")
    }
}

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, id: &str) -> Option<Credential> {
        std::env::var(Self::var_name(id))
            .ok()
            .filter(|s| !s.is_empty())
            .map(|secret| Credential::new(id, secret))
    }
}

/// Fixed set of credentials
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, secret: &str) -> Self {
        self.credentials
            .insert(id.to_string(), Credential::new(id, secret));
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn resolve(&self, id: &str) -> Option<Credential> {
        self.credentials.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            EnvCredentialStore::var_name("docker-hub.prod"),
            "KEEL_CREDENTIAL_DOCKER_HUB_PROD"
        );
    }

    #[test]
    fn test_static_credentials() {
        let store = StaticCredentials::new().with("dockerhub", "s3cret");
        assert_eq!(store.resolve("dockerhub").unwrap().secret(), "s3cret");
        assert!(store.resolve("quay").is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new("dockerhub", "s3cret");
        let printed = format!("{cred:?}");
        assert!(printed.contains("dockerhub"));
        assert!(!printed.contains("s3cret"));
    }
}
