//! Secret resolution seam.
//!
//! Provider rows hold *references* into a secret store, never credential
//! material. The store shipped here resolves references from the environment
//! or mounted secret files; an encrypted-at-rest store plugs in behind the
//! same trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret store is read-only")]
    ReadOnly,
    #[error("failed to read secret '{name}': {message}")]
    Io { name: String, message: String },
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<String, SecretError>;
    async fn put(&self, name: &str, value: &str) -> Result<(), SecretError>;
}

/// Resolves secret references from `TRAFEGO_SECRET_<NAME>` environment
/// variables, falling back to files under the secrets directory (the Docker
/// secrets convention).
pub struct EnvSecretStore {
    secrets_dir: std::path::PathBuf,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self {
            secrets_dir: std::env::var("SECRETS_DIR")
                .unwrap_or_else(|_| "/run/secrets".to_string())
                .into(),
        }
    }

    fn env_key(name: &str) -> String {
        format!(
            "TRAFEGO_SECRET_{}",
            name.to_uppercase().replace(['-', '.', '/'], "_")
        )
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<String, SecretError> {
        if let Ok(value) = std::env::var(Self::env_key(name)) {
            return Ok(value.trim().to_string());
        }

        let path = self.secrets_dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(e) => Err(SecretError::Io {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn put(&self, _name: &str, _value: &str) -> Result<(), SecretError> {
        // Environment-backed secrets are provisioned outside the process
        Err(SecretError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_env_resolution() {
        // SAFETY: test-local variable, no concurrent env readers in this test
        unsafe { std::env::set_var("TRAFEGO_SECRET_CF_API_TOKEN", " token-value ") };

        let store = EnvSecretStore::new();
        assert_eq!(store.get("cf-api.token").await.unwrap(), "token-value");
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let store = EnvSecretStore::new();
        assert!(matches!(
            store.get("definitely-not-configured").await,
            Err(SecretError::NotFound(_))
        ));
    }
}
