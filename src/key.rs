//! Key aliases and their permitted version window.

use crate::storage::{get_json, put_json, Storage};
use crate::validation::validate_key_name;
use crate::{KmsError, Result};
use serde::{Deserialize, Serialize};

/// Storage prefix under which aliases live.
pub const KEYS_PREFIX: &str = "keys/";

/// A local alias bound to one remote crypto key.
///
/// `min_version` and `max_version` of `0` leave that side of the window
/// open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Alias name
    pub name: String,

    /// Fully-qualified remote key path
    #[serde(default)]
    pub crypto_key_id: String,

    /// Lowest usable version (0 = unbounded)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub min_version: u64,

    /// Highest usable version (0 = unbounded)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_version: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Key {
    /// Creates an alias with an open window.
    pub fn new(name: impl Into<String>, crypto_key_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            crypto_key_id: crypto_key_id.into(),
            min_version: 0,
            max_version: 0,
        }
    }

    /// Returns true if `requested` may be used with this key.
    ///
    /// A requested version of `0` means "primary" and is always allowed.
    ///
    /// # Example
    ///
    /// ```
    /// use gcpkms::Key;
    ///
    /// let mut key = Key::new("my-key", "projects/p/locations/l/keyRings/r/cryptoKeys/k");
    /// key.min_version = 3;
    /// key.max_version = 5;
    ///
    /// assert!(key.permits(0));
    /// assert!(key.permits(4));
    /// assert!(!key.permits(2));
    /// assert!(!key.permits(6));
    /// ```
    pub fn permits(&self, requested: u64) -> bool {
        if requested == 0 {
            return true;
        }
        if self.min_version != 0 && requested < self.min_version {
            return false;
        }
        if self.max_version != 0 && requested > self.max_version {
            return false;
        }
        true
    }

    /// Like [`Key::permits`], but as a permission-denied error.
    pub fn check_version(&self, requested: u64) -> Result<()> {
        if self.permits(requested) {
            Ok(())
        } else {
            Err(KmsError::PermissionDenied)
        }
    }

    /// Returns true when `version` lies inside a bounded window.
    ///
    /// An unbounded window (both sides 0) contains nothing in this sense.
    pub fn window_contains(&self, version: u64) -> bool {
        self.has_window() && self.permits(version)
    }

    /// Returns true if either side of the window is set.
    pub fn has_window(&self) -> bool {
        self.min_version != 0 || self.max_version != 0
    }

    /// Resource path of one version of the remote key.
    pub fn version_path(&self, version: u64) -> String {
        format!("{}/cryptoKeyVersions/{}", self.crypto_key_id, version)
    }

    /// Updates the window. `None` leaves a side untouched; negatives clear it.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Validation`] if both sides end up set and
    /// `min_version > max_version`.
    pub fn set_window(&mut self, min: Option<i64>, max: Option<i64>) -> Result<()> {
        let min_version = min.map(clamp_version).unwrap_or(self.min_version);
        let max_version = max.map(clamp_version).unwrap_or(self.max_version);

        if min_version != 0 && max_version != 0 && min_version > max_version {
            return Err(KmsError::Validation(format!(
                "min_version ({}) cannot be greater than max_version ({})",
                min_version, max_version
            )));
        }

        self.min_version = min_version;
        self.max_version = max_version;
        Ok(())
    }
}

fn clamp_version(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn key_path(name: &str) -> String {
    format!("{}{}", KEYS_PREFIX, name)
}

/// Persistent alias registry on top of a [`Storage`].
pub struct KeyRegistry<'a> {
    storage: &'a dyn Storage,
}

impl<'a> KeyRegistry<'a> {
    /// Wraps the storage handle for one operation.
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Resolves an alias.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] if the alias is not registered.
    pub async fn get(&self, name: &str) -> Result<Key> {
        validate_key_name(name)?;

        let key: Option<Key> = get_json(self.storage, &key_path(name))
            .await
            .map_err(|e| match e {
                KmsError::Json(e) => {
                    KmsError::Other(anyhow::anyhow!("failed to decode key {}: {}", name, e))
                }
                other => other,
            })?;

        key.ok_or_else(|| KmsError::KeyNotFound(name.to_string()))
    }

    /// Returns true if the alias is registered.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        validate_key_name(name)?;
        Ok(self.storage.get(&key_path(name)).await?.is_some())
    }

    /// Lists all registered aliases, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let names = self.storage.list(KEYS_PREFIX).await?;
        Ok(names.into_iter().filter(|n| !n.ends_with('/')).collect())
    }

    /// Writes the alias record.
    pub async fn put(&self, key: &Key) -> Result<()> {
        validate_key_name(&key.name)?;
        put_json(self.storage, &key_path(&key.name), key).await
    }

    /// Writes a new alias, refusing to replace an existing one.
    pub async fn register(&self, key: &Key) -> Result<()> {
        if self.exists(&key.name).await? {
            return Err(KmsError::AlreadyExists(key.name.clone()));
        }
        self.put(key).await
    }

    /// Unlinks an alias. The remote key is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] if the alias is not registered.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name).await? {
            return Err(KmsError::KeyNotFound(name.to_string()));
        }
        self.storage.delete(&key_path(name)).await
    }
}
