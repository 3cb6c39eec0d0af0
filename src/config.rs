//! Persisted engine configuration and process options.

use crate::storage::{get_json, put_json, Storage};
use crate::{KmsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage path of the configuration record.
pub const CONFIG_PATH: &str = "config";

/// Scope requested when none is configured.
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";

/// Stored configuration.
///
/// Materialized with defaults when nothing is stored; see [`Config::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service account JSON; empty means ambient default credentials
    pub credentials: String,

    /// OAuth scopes, normalized (lowercase, deduplicated, sorted)
    pub scopes: Vec<String>,

    /// Service account to impersonate, if any
    pub service_account_email: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: String::new(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            service_account_email: String::new(),
        }
    }
}

/// Requested configuration changes. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// New credentials JSON (empty string clears)
    pub credentials: Option<String>,
    /// New scope set
    pub scopes: Option<Vec<String>>,
    /// New service account email
    pub service_account_email: Option<String>,
}

impl Config {
    /// Loads the configuration, falling back to defaults when absent.
    pub async fn load(storage: &dyn Storage) -> Result<Self> {
        let stored: Option<Config> = get_json(storage, CONFIG_PATH).await.map_err(|e| match e {
            KmsError::Json(e) => KmsError::Other(anyhow::anyhow!(
                "failed to decode configuration: {}",
                e
            )),
            other => other,
        })?;
        Ok(stored.unwrap_or_default())
    }

    /// Persists the configuration.
    pub async fn save(&self, storage: &dyn Storage) -> Result<()> {
        put_json(storage, CONFIG_PATH, self).await
    }

    /// Removes the stored configuration so the next load yields defaults.
    pub async fn delete(storage: &dyn Storage) -> Result<()> {
        storage.delete(CONFIG_PATH).await
    }

    /// Applies `update` and reports whether anything changed.
    ///
    /// Scopes compare as sets, so reordering, case changes and duplicates
    /// are not changes.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Validation`] if non-empty credentials are not a
    /// JSON object.
    ///
    /// # Example
    ///
    /// ```
    /// use gcpkms::config::{Config, ConfigUpdate};
    ///
    /// let mut config = Config::default();
    /// let changed = config
    ///     .update(&ConfigUpdate {
    ///         scopes: Some(vec!["FOO".into(), "bar".into(), "foo".into()]),
    ///         ..Default::default()
    ///     })
    ///     .unwrap();
    ///
    /// assert!(changed);
    /// assert_eq!(config.scopes, vec!["bar", "foo"]);
    /// ```
    pub fn update(&mut self, update: &ConfigUpdate) -> Result<bool> {
        let mut changed = false;

        if let Some(raw) = &update.credentials {
            let creds = raw.trim();
            if !creds.is_empty() {
                validate_credentials(creds)?;
            }
            if creds != self.credentials {
                self.credentials = creds.to_string();
                changed = true;
            }
        }

        if let Some(scopes) = &update.scopes {
            let scopes = normalize_scopes(scopes);
            if scopes != normalize_scopes(&self.scopes) {
                self.scopes = scopes;
                changed = true;
            }
        }

        if let Some(email) = &update.service_account_email {
            let email = email.trim();
            if email != self.service_account_email {
                self.service_account_email = email.to_string();
                changed = true;
            }
        }

        Ok(changed)
    }
}

/// Lowercases, trims, deduplicates and sorts scopes.
pub fn normalize_scopes<S: AsRef<str>>(scopes: &[S]) -> Vec<String> {
    let mut out: Vec<String> = scopes
        .iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn validate_credentials(creds: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(creds)
        .map_err(|e| KmsError::Validation(format!("invalid credentials JSON file: {}", e)))?;
    if !value.is_object() {
        return Err(KmsError::Validation(
            "invalid credentials JSON file: expected a JSON object".to_string(),
        ));
    }
    Ok(())
}

/// Process-level options for a [`Backend`](crate::Backend).
///
/// ```
/// use gcpkms::BackendOptions;
/// use std::time::Duration;
///
/// let options = BackendOptions::default()
///     .with_client_lifetime(Duration::from_secs(600))
///     .with_trim_concurrency(4);
/// assert_eq!(options.trim_concurrency, 4);
/// ```
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// How long a constructed client handle is reused (default: 30 minutes)
    pub client_lifetime: Duration,

    /// Worker count for parallel version destroys (default: 10)
    pub trim_concurrency: usize,

    /// Attempts per destroy call, including the first (default: 5)
    pub destroy_retries: u32,

    /// First retry delay; doubles per attempt (default: 100ms)
    pub retry_base_delay: Duration,

    /// Versions kept by trim when the request does not say (default: 3)
    pub default_keep: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            client_lifetime: Duration::from_secs(30 * 60),
            trim_concurrency: 10,
            destroy_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            default_keep: 3,
        }
    }
}

impl BackendOptions {
    /// Reads overrides from `GCPKMS_CLIENT_LIFETIME_SECS`,
    /// `GCPKMS_TRIM_CONCURRENCY` and `GCPKMS_DESTROY_RETRIES`.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Some(secs) = env_parse::<u64>("GCPKMS_CLIENT_LIFETIME_SECS") {
            options.client_lifetime = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("GCPKMS_TRIM_CONCURRENCY") {
            options.trim_concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("GCPKMS_DESTROY_RETRIES") {
            options.destroy_retries = n.max(1);
        }

        options
    }

    /// Sets the client handle lifetime.
    pub fn with_client_lifetime(mut self, lifetime: Duration) -> Self {
        self.client_lifetime = lifetime;
        self
    }

    /// Sets the destroy worker count (minimum 1).
    pub fn with_trim_concurrency(mut self, workers: usize) -> Self {
        self.trim_concurrency = workers.max(1);
        self
    }

    /// Sets the attempts per destroy call (minimum 1).
    pub fn with_destroy_retries(mut self, attempts: u32) -> Self {
        self.destroy_retries = attempts.max(1);
        self
    }

    /// Sets the first retry delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Sets the default number of versions kept by trim.
    pub fn with_default_keep(mut self, keep: usize) -> Self {
        self.default_keep = keep;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn scopes(list: &[&str]) -> Option<Vec<String>> {
        Some(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.credentials.is_empty());
        assert_eq!(config.scopes, vec![DEFAULT_SCOPE]);
    }

    #[test]
    fn test_update_empty_is_noop() {
        let mut config = Config {
            credentials: "{}".to_string(),
            ..Default::default()
        };
        let changed = config.update(&ConfigUpdate::default()).unwrap();
        assert!(!changed);
        assert_eq!(config.credentials, "{}");
    }

    #[test]
    fn test_update_overwrites_changes() {
        let mut config = Config {
            credentials: "{\"a\":1}".to_string(),
            scopes: vec![],
            ..Default::default()
        };
        let changed = config
            .update(&ConfigUpdate {
                credentials: Some("{\"b\":2}".to_string()),
                scopes: scopes(&["bar"]),
                ..Default::default()
            })
            .unwrap();
        assert!(changed);
        assert_eq!(config.credentials, "{\"b\":2}");
        assert_eq!(config.scopes, vec!["bar"]);
    }

    #[test]
    fn test_update_scope_set_semantics() {
        let base = Config {
            scopes: vec!["bar".to_string(), "foo".to_string()],
            ..Default::default()
        };

        for input in [
            scopes(&["foo", "bar"]),
            scopes(&["FOO", "baR"]),
            scopes(&["foo", " foo", "foo", "bar"]),
        ] {
            let mut config = base.clone();
            let changed = config
                .update(&ConfigUpdate {
                    scopes: input,
                    ..Default::default()
                })
                .unwrap();
            assert!(!changed);
            assert_eq!(config.scopes, vec!["bar", "foo"]);
        }
    }

    #[test]
    fn test_update_same_credentials_is_not_change() {
        let mut config = Config {
            credentials: "{}".to_string(),
            ..Default::default()
        };
        let changed = config
            .update(&ConfigUpdate {
                credentials: Some("  {}  ".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_update_rejects_invalid_credentials() {
        let mut config = Config::default();
        let err = config
            .update(&ConfigUpdate {
                credentials: Some("not json".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.is_validation());
        assert!(config.credentials.is_empty());
    }

    #[tokio::test]
    async fn test_load_default_when_absent() {
        let storage = InMemoryStorage::new();
        assert_eq!(Config::load(&storage).await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn test_load_saved() {
        let storage = InMemoryStorage::new();
        storage
            .put(CONFIG_PATH, br#"{"credentials":"foo", "scopes":["bar"]}"#)
            .await
            .unwrap();

        let config = Config::load(&storage).await.unwrap();
        assert_eq!(config.credentials, "foo");
        assert_eq!(config.scopes, vec!["bar"]);
        assert!(config.service_account_email.is_empty());
    }

    #[tokio::test]
    async fn test_load_invalid() {
        let storage = InMemoryStorage::new();
        storage.put(CONFIG_PATH, b"{x").await.unwrap();
        assert!(Config::load(&storage).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_reverts_to_default() {
        let storage = InMemoryStorage::new();
        Config {
            scopes: vec!["custom".to_string()],
            ..Default::default()
        }
        .save(&storage)
        .await
        .unwrap();

        Config::delete(&storage).await.unwrap();
        let config = Config::load(&storage).await.unwrap();
        assert!(!config.scopes.is_empty());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_options_builder() {
        let options = BackendOptions::default()
            .with_trim_concurrency(0)
            .with_destroy_retries(0)
            .with_default_keep(5);
        assert_eq!(options.trim_concurrency, 1);
        assert_eq!(options.destroy_retries, 1);
        assert_eq!(options.default_keep, 5);
        assert_eq!(options.client_lifetime, Duration::from_secs(1800));
    }
}
