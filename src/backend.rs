//! Operation handlers.
//!
//! [`Backend`] is the entry point the dispatcher talks to. It owns the
//! [`ClientCache`] and the process options; storage is passed in per
//! request. Every request follows the same path: parse and validate the
//! fields, resolve the alias, check the version window, then acquire the
//! client and call the remote service.

use crate::client::ClientCache;
use crate::config::Config;
use crate::error::RemoteCode;
use crate::key::{Key, KeyRegistry};
use crate::kms::{
    version_number, Algorithm, ClientFactory, CryptoKeySpec, CryptoKeyUpdate, ProtectionLevel,
    Purpose,
};
use crate::lifecycle::{self, CancelToken};
use crate::operation::{KeyWrite, Operation, OperationKind};
use crate::storage::Storage;
use crate::validation::{decode_base64, FieldMap};
use crate::{BackendOptions, KmsError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Response data returned to the dispatcher. Empty for operations that
/// return nothing.
pub type Response = serde_json::Map<String, Value>;

/// Name reported by `info/read`.
pub const PLUGIN_NAME: &str = "gcpkms";

fn response(value: Value) -> Response {
    match value {
        Value::Object(map) => map,
        _ => Response::new(),
    }
}

/// The secrets engine.
///
/// One instance serves all requests for the lifetime of the process.
///
/// # Example
///
/// ```
/// use gcpkms::backends::mock::MockClientFactory;
/// use gcpkms::{Backend, InMemoryStorage};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> gcpkms::Result<()> {
///     let factory = Arc::new(MockClientFactory::new());
///     let key_ring = "projects/p/locations/global/keyRings/r";
///     factory.kms().add_key_ring(key_ring);
///
///     let backend = Backend::new(factory);
///     let storage = InMemoryStorage::new();
///
///     let fields = json!({"key": "my-key", "key_ring": key_ring});
///     backend.handle("keys/write", &storage, fields.as_object().unwrap().clone()).await?;
///
///     let fields = json!({"key": "my-key", "plaintext": "hello"});
///     let resp = backend.handle("encrypt", &storage, fields.as_object().unwrap().clone()).await?;
///     assert_eq!(resp["key_version"], "1");
///     Ok(())
/// }
/// ```
pub struct Backend {
    cache: ClientCache,
    options: BackendOptions,
}

impl Backend {
    /// Creates an engine with default options.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_options(factory, BackendOptions::default())
    }

    /// Creates an engine with explicit options.
    pub fn with_options(factory: Arc<dyn ClientFactory>, options: BackendOptions) -> Self {
        Self {
            cache: ClientCache::with_lifetime(factory, options.client_lifetime),
            options,
        }
    }

    /// Process options in effect.
    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// The shared client cache.
    pub fn client_cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Handles one named operation.
    ///
    /// # Errors
    ///
    /// Unknown operation names and fields absent from the operation's schema
    /// fail with a validation error before storage or the remote service is
    /// touched. See [`KmsError::status_code`] for the response class of
    /// every other failure.
    pub async fn handle(
        &self,
        operation: &str,
        storage: &dyn Storage,
        fields: FieldMap,
    ) -> Result<Response> {
        self.handle_with_cancel(operation, storage, fields, &CancelToken::never())
            .await
    }

    /// Like [`handle`](Self::handle), with a cancellation signal for
    /// `keys/trim` and `keys/delete`.
    pub async fn handle_with_cancel(
        &self,
        operation: &str,
        storage: &dyn Storage,
        fields: FieldMap,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let kind: OperationKind = operation.parse()?;
        let operation = Operation::parse(kind, &fields)?;

        debug!(operation = %kind, "handling operation");
        self.execute(operation, storage, cancel).await
    }

    /// Runs an already-parsed operation.
    pub async fn execute(
        &self,
        operation: Operation,
        storage: &dyn Storage,
        cancel: &CancelToken,
    ) -> Result<Response> {
        match operation {
            Operation::ConfigRead => self.config_read(storage).await,
            Operation::ConfigWrite(update) => self.config_write(storage, update).await,
            Operation::ConfigDelete => self.config_delete(storage).await,
            Operation::InfoRead => Ok(info()),
            Operation::KeysList => self.keys_list(storage).await,
            Operation::KeysRead { key } => self.keys_read(storage, &key).await,
            Operation::KeysWrite(write) => self.keys_write(storage, write).await,
            Operation::KeysDelete { key } => self.keys_delete(storage, &key, cancel).await,
            Operation::KeysConfigRead { key } => self.keys_config_read(storage, &key).await,
            Operation::KeysConfigWrite {
                key,
                min_version,
                max_version,
            } => {
                self.keys_config_write(storage, &key, min_version, max_version)
                    .await
            }
            Operation::KeysRegister {
                key,
                crypto_key,
                verify,
            } => self.keys_register(storage, &key, &crypto_key, verify).await,
            Operation::KeysDeregister { key } => self.keys_deregister(storage, &key).await,
            Operation::KeysRotate { key } => self.keys_rotate(storage, &key).await,
            Operation::KeysTrim { key, keep } => self.keys_trim(storage, &key, keep, cancel).await,
            Operation::Encrypt {
                key,
                plaintext,
                aad,
                key_version,
            } => self.encrypt(storage, &key, &plaintext, &aad, key_version).await,
            Operation::Decrypt {
                key,
                ciphertext,
                aad,
                key_version,
            } => self.decrypt(storage, &key, &ciphertext, &aad, key_version).await,
            Operation::Reencrypt {
                key,
                ciphertext,
                aad,
                key_version,
            } => {
                self.reencrypt(storage, &key, &ciphertext, &aad, key_version)
                    .await
            }
            Operation::Sign {
                key,
                digest,
                key_version,
            } => self.sign(storage, &key, &digest, key_version).await,
            Operation::Verify {
                key,
                digest,
                signature,
                key_version,
            } => self.verify(storage, &key, &digest, &signature, key_version).await,
            Operation::Pubkey { key, key_version } => {
                self.pubkey(storage, &key, key_version).await
            }
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    async fn config_read(&self, storage: &dyn Storage) -> Result<Response> {
        let config = Config::load(storage).await?;
        Ok(response(json!({
            "scopes": config.scopes,
            "service_account_email": config.service_account_email,
        })))
    }

    async fn config_write(
        &self,
        storage: &dyn Storage,
        update: crate::config::ConfigUpdate,
    ) -> Result<Response> {
        let mut config = Config::load(storage).await?;
        if config.update(&update)? {
            config.save(storage).await?;
            self.cache.reset().await;
            info!("configuration updated");
        }
        Ok(Response::new())
    }

    async fn config_delete(&self, storage: &dyn Storage) -> Result<Response> {
        Config::delete(storage).await?;
        self.cache.reset().await;
        info!("configuration deleted");
        Ok(Response::new())
    }

    // ========================================================================
    // Key management
    // ========================================================================

    async fn keys_list(&self, storage: &dyn Storage) -> Result<Response> {
        let keys = KeyRegistry::new(storage).list().await?;
        Ok(response(json!({ "keys": keys })))
    }

    async fn keys_read(&self, storage: &dyn Storage, name: &str) -> Result<Response> {
        let key = KeyRegistry::new(storage).get(name).await?;
        let client = self.cache.acquire(storage).await?;

        let crypto_key = client
            .get_crypto_key(&key.crypto_key_id)
            .await
            .map_err(|e| KmsError::upstream("failed to read crypto key", e))?;

        let mut data = response(json!({
            "id": crypto_key.name,
            "purpose": crypto_key.purpose.to_string(),
            "labels": crypto_key.labels,
        }));
        if let Some(primary) = &crypto_key.primary {
            data.insert("primary_version".into(), primary.version().to_string().into());
        }
        if let Some(algorithm) = crypto_key.algorithm {
            data.insert("algorithm".into(), algorithm.to_string().into());
        }
        if let Some(level) = crypto_key.protection_level {
            data.insert("protection_level".into(), level.to_string().into());
        }
        if let Some(period) = crypto_key.rotation_period {
            data.insert(
                "rotation_period".into(),
                format!("{}s", period.as_secs()).into(),
            );
        }
        if let Some(next) = crypto_key.next_rotation_time {
            data.insert("next_rotation_time".into(), next.to_rfc3339().into());
        }
        if let Some(created) = crypto_key.create_time {
            data.insert("create_time".into(), created.to_rfc3339().into());
        }

        Ok(data)
    }

    async fn keys_write(&self, storage: &dyn Storage, write: KeyWrite) -> Result<Response> {
        let registry = KeyRegistry::new(storage);

        match registry.get(&write.key).await {
            Ok(existing) => self.update_crypto_key(storage, &existing, write).await,
            Err(KmsError::KeyNotFound(_)) => self.create_crypto_key(storage, write).await,
            Err(err) => Err(err),
        }
    }

    async fn update_crypto_key(
        &self,
        storage: &dyn Storage,
        key: &Key,
        write: KeyWrite,
    ) -> Result<Response> {
        let update = CryptoKeyUpdate {
            rotation_period: write.rotation_period,
            labels: write.labels,
        };
        if update.is_empty() {
            return Ok(Response::new());
        }

        let client = self.cache.acquire(storage).await?;
        client
            .update_crypto_key(&key.crypto_key_id, &update)
            .await
            .map_err(|e| KmsError::upstream("failed to update crypto key", e))?;

        info!(key = %key.name, "updated crypto key");
        Ok(Response::new())
    }

    async fn create_crypto_key(&self, storage: &dyn Storage, write: KeyWrite) -> Result<Response> {
        let key_ring = write
            .key_ring
            .ok_or_else(|| KmsError::MissingFields(vec!["key_ring".to_string()]))?;
        let crypto_key_id = write.crypto_key.unwrap_or_else(|| write.key.clone());

        let purpose = write.purpose.unwrap_or(Purpose::EncryptDecrypt);
        let algorithm = match (write.algorithm, purpose) {
            (Some(algorithm), _) => algorithm,
            (None, Purpose::EncryptDecrypt) => Algorithm::SymmetricEncryption,
            (None, _) => return Err(KmsError::MissingFields(vec!["algorithm".to_string()])),
        };
        if algorithm.purpose() != purpose {
            return Err(KmsError::Validation(format!(
                "algorithm {} cannot be used with purpose {}",
                algorithm, purpose
            )));
        }

        let spec = CryptoKeySpec {
            purpose,
            algorithm,
            protection_level: write.protection_level.unwrap_or(ProtectionLevel::Software),
            rotation_period: write.rotation_period,
            labels: write.labels.unwrap_or_default(),
        };

        let client = self.cache.acquire(storage).await?;
        client
            .get_key_ring(&key_ring)
            .await
            .map_err(|e| KmsError::upstream("failed to read key ring", e))?;

        let crypto_key = client
            .create_crypto_key(&key_ring, &crypto_key_id, &spec)
            .await
            .map_err(|e| match e.code {
                RemoteCode::AlreadyExists => KmsError::AlreadyExists(e.message),
                _ => KmsError::upstream("failed to create crypto key", e),
            })?;

        KeyRegistry::new(storage)
            .put(&Key::new(&write.key, &crypto_key.name))
            .await?;

        info!(key = %write.key, crypto_key = %crypto_key.name, "created crypto key");
        Ok(Response::new())
    }

    async fn keys_delete(
        &self,
        storage: &dyn Storage,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let registry = KeyRegistry::new(storage);
        let key = registry.get(name).await?;

        let client = self.cache.acquire(storage).await?;
        let destroyed =
            lifecycle::destroy_all(&client.handle(), &key, &self.options, cancel).await?;
        drop(client);

        registry.remove(name).await?;

        info!(key = %name, destroyed = destroyed.len(), "deleted key");
        Ok(Response::new())
    }

    async fn keys_config_read(&self, storage: &dyn Storage, name: &str) -> Result<Response> {
        let key = KeyRegistry::new(storage).get(name).await?;

        let mut data = response(json!({
            "name": key.name,
            "crypto_key": key.crypto_key_id,
        }));
        if key.min_version != 0 {
            data.insert("min_version".into(), key.min_version.into());
        }
        if key.max_version != 0 {
            data.insert("max_version".into(), key.max_version.into());
        }
        Ok(data)
    }

    async fn keys_config_write(
        &self,
        storage: &dyn Storage,
        name: &str,
        min_version: Option<i64>,
        max_version: Option<i64>,
    ) -> Result<Response> {
        let registry = KeyRegistry::new(storage);
        let mut key = registry.get(name).await?;

        key.set_window(min_version, max_version)?;
        registry.put(&key).await?;

        debug!(
            key = %name,
            min_version = key.min_version,
            max_version = key.max_version,
            "updated key configuration"
        );
        Ok(Response::new())
    }

    async fn keys_register(
        &self,
        storage: &dyn Storage,
        name: &str,
        crypto_key: &str,
        verify: bool,
    ) -> Result<Response> {
        let registry = KeyRegistry::new(storage);
        if registry.exists(name).await? {
            return Err(KmsError::AlreadyExists(name.to_string()));
        }

        if verify {
            let client = self.cache.acquire(storage).await?;
            client
                .get_crypto_key(crypto_key)
                .await
                .map_err(|e| KmsError::upstream("failed to read crypto key", e))?;
        }

        registry.register(&Key::new(name, crypto_key)).await?;

        info!(key = %name, crypto_key = %crypto_key, "registered key");
        Ok(Response::new())
    }

    async fn keys_deregister(&self, storage: &dyn Storage, name: &str) -> Result<Response> {
        KeyRegistry::new(storage).remove(name).await?;
        info!(key = %name, "deregistered key");
        Ok(Response::new())
    }

    async fn keys_rotate(&self, storage: &dyn Storage, name: &str) -> Result<Response> {
        let key = KeyRegistry::new(storage).get(name).await?;
        let client = self.cache.acquire(storage).await?;

        let version = lifecycle::rotate(&*client, &key).await?;
        Ok(response(json!({ "key_version": version.to_string() })))
    }

    async fn keys_trim(
        &self,
        storage: &dyn Storage,
        name: &str,
        keep: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let key = KeyRegistry::new(storage).get(name).await?;
        let keep = keep.unwrap_or(self.options.default_keep);

        let client = self.cache.acquire(storage).await?;
        let report = lifecycle::trim(&client.handle(), &key, keep, &self.options, cancel).await?;

        Ok(response(serde_json::to_value(report)?))
    }

    // ========================================================================
    // Cryptographic operations
    // ========================================================================

    /// Resolves the alias and applies the version window.
    async fn permitted_key(&self, storage: &dyn Storage, name: &str, version: u64) -> Result<Key> {
        let key = KeyRegistry::new(storage).get(name).await?;
        key.check_version(version)?;
        Ok(key)
    }

    async fn encrypt(
        &self,
        storage: &dyn Storage,
        name: &str,
        plaintext: &[u8],
        aad: &[u8],
        key_version: u64,
    ) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;
        let target = match key_version {
            0 => key.crypto_key_id.clone(),
            v => key.version_path(v),
        };

        let client = self.cache.acquire(storage).await?;
        let out = client
            .encrypt(&target, plaintext, aad)
            .await
            .map_err(|e| KmsError::upstream("failed to encrypt plaintext", e))?;

        Ok(response(json!({
            "ciphertext": STANDARD.encode(&out.ciphertext),
            "key_version": version_number(&out.version_name).to_string(),
        })))
    }

    async fn decrypt(
        &self,
        storage: &dyn Storage,
        name: &str,
        ciphertext: &str,
        aad: &[u8],
        key_version: u64,
    ) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;
        let ciphertext = decode_base64("ciphertext", ciphertext)?;

        let client = self.cache.acquire(storage).await?;
        let plaintext = match key_version {
            0 => client
                .decrypt(&key.crypto_key_id, &ciphertext, aad)
                .await
                .map_err(|e| KmsError::upstream("failed to decrypt ciphertext", e))?,
            v => client
                .asymmetric_decrypt(&key.version_path(v), &ciphertext)
                .await
                .map_err(|e| KmsError::upstream("failed to decrypt ciphertext", e))?,
        };

        Ok(response(json!({
            "plaintext": String::from_utf8_lossy(&plaintext),
        })))
    }

    async fn reencrypt(
        &self,
        storage: &dyn Storage,
        name: &str,
        ciphertext: &str,
        aad: &[u8],
        key_version: u64,
    ) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;
        let ciphertext = decode_base64("ciphertext", ciphertext)?;
        let target = match key_version {
            0 => key.crypto_key_id.clone(),
            v => key.version_path(v),
        };

        let client = self.cache.acquire(storage).await?;
        let plaintext = client
            .decrypt(&key.crypto_key_id, &ciphertext, aad)
            .await
            .map_err(|e| KmsError::upstream("failed to decrypt ciphertext", e))?;
        let out = client
            .encrypt(&target, &plaintext, aad)
            .await
            .map_err(|e| KmsError::upstream("failed to encrypt plaintext", e))?;

        Ok(response(json!({
            "ciphertext": STANDARD.encode(&out.ciphertext),
            "key_version": version_number(&out.version_name).to_string(),
        })))
    }

    async fn sign(
        &self,
        storage: &dyn Storage,
        name: &str,
        digest: &str,
        key_version: u64,
    ) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;
        let digest = decode_base64("digest", digest)?;

        let client = self.cache.acquire(storage).await?;
        let signature = client
            .asymmetric_sign(&key.version_path(key_version), &digest)
            .await
            .map_err(|e| KmsError::upstream("failed to sign digest", e))?;

        Ok(response(json!({ "signature": STANDARD.encode(signature) })))
    }

    async fn verify(
        &self,
        storage: &dyn Storage,
        name: &str,
        digest: &str,
        signature: &str,
        key_version: u64,
    ) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;
        let digest = decode_base64("digest", digest)?;
        let signature = decode_base64("signature", signature)?;

        let client = self.cache.acquire(storage).await?;
        let valid = client
            .verify(&key.version_path(key_version), &digest, &signature)
            .await
            .map_err(|e| KmsError::upstream("failed to verify signature", e))?;

        Ok(response(json!({ "valid": valid })))
    }

    async fn pubkey(&self, storage: &dyn Storage, name: &str, key_version: u64) -> Result<Response> {
        let key = self.permitted_key(storage, name, key_version).await?;

        let client = self.cache.acquire(storage).await?;
        let public_key = client
            .get_public_key(&key.version_path(key_version))
            .await
            .map_err(|e| KmsError::upstream("failed to get public key", e))?;

        Ok(response(json!({
            "pem": public_key.pem,
            "algorithm": public_key.algorithm.to_string(),
        })))
    }
}

fn info() -> Response {
    response(json!({
        "name": PLUGIN_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("GCPKMS_GIT_COMMIT").unwrap_or("unknown"),
    }))
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backends::mock::MockClientFactory;
    use crate::storage::InMemoryStorage;

    fn fields(value: Value) -> FieldMap {
        response(value)
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let backend = Backend::new(Arc::new(MockClientFactory::new()));
        let storage = InMemoryStorage::new();

        let err = backend
            .handle("keys/explode", &storage, FieldMap::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_info() {
        let backend = Backend::new(Arc::new(MockClientFactory::new()));
        let storage = InMemoryStorage::new();

        let resp = backend
            .handle("info/read", &storage, FieldMap::new())
            .await
            .unwrap();
        assert_eq!(resp["name"], PLUGIN_NAME);
        assert_eq!(resp["version"], env!("CARGO_PKG_VERSION"));
        assert!(resp.contains_key("commit"));
    }

    #[tokio::test]
    async fn test_config_write_resets_client_only_on_change() {
        let factory = Arc::new(MockClientFactory::new());
        let backend = Backend::new(factory.clone());
        let storage = InMemoryStorage::new();

        backend.client_cache().acquire(&storage).await.unwrap();
        assert_eq!(factory.connect_count(), 1);

        // Same scope set, different spelling
        backend
            .handle(
                "config/write",
                &storage,
                fields(json!({"scopes": "HTTPS://www.googleapis.com/auth/cloudkms"})),
            )
            .await
            .unwrap();
        assert!(backend.client_cache().is_cached().await);
        assert!(storage.get("config").await.unwrap().is_none());

        backend
            .handle("config/write", &storage, fields(json!({"scopes": "foo,bar"})))
            .await
            .unwrap();
        assert!(!backend.client_cache().is_cached().await);

        backend.client_cache().acquire(&storage).await.unwrap();
        assert_eq!(factory.last_scopes(), vec!["bar", "foo"]);
    }

    #[tokio::test]
    async fn test_config_read_hides_credentials() {
        let backend = Backend::new(Arc::new(MockClientFactory::new()));
        let storage = InMemoryStorage::new();

        backend
            .handle(
                "config/write",
                &storage,
                fields(json!({"credentials": "{\"private_key\":\"shh\"}"})),
            )
            .await
            .unwrap();

        let resp = backend
            .handle("config/read", &storage, FieldMap::new())
            .await
            .unwrap();
        assert!(!resp.contains_key("credentials"));
        assert_eq!(resp["scopes"], json!([crate::config::DEFAULT_SCOPE]));
    }
}
