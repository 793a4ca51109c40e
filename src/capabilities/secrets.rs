//! Secret store capability
//!
//! The live implementation reads process environment variables; the static
//! implementation backs tests and embedded setups.

use std::collections::HashMap;

/// Lookup interface for deployment secrets.
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name. `None` when unset or empty.
    fn get_secret(&self, name: &str) -> Option<String>;
}

/// Environment-variable backed secret store.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, name: &str) -> Option<String> {
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }
}

/// Fixed-map secret store for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get_secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_store() {
        let store = StaticSecretStore::new().with("API_TOKEN", "t0ken");
        assert_eq!(store.get_secret("API_TOKEN").as_deref(), Some("t0ken"));
        assert_eq!(store.get_secret("MISSING"), None);
    }

    #[test]
    fn test_env_store_ignores_empty() {
        std::env::set_var("LATTICE_TEST_EMPTY_SECRET", "   ");
        assert_eq!(EnvSecretStore.get_secret("LATTICE_TEST_EMPTY_SECRET"), None);
        std::env::remove_var("LATTICE_TEST_EMPTY_SECRET");
    }
}
