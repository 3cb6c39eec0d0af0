//! Mock key-management service for testing.
//!
//! [`MockKms`] is a complete in-memory stand-in for the remote service:
//! key rings, crypto keys, versions with lifecycle states, paginated
//! listing and working encrypt/decrypt/sign/verify. It supports error
//! injection per method and per version to simulate failure conditions.
//!
//! Clients handed out by [`MockClientFactory`] all talk to the same
//! [`MockKms`], the way real handles talk to the same remote project.

use crate::error::{RemoteCode, RemoteError};
use crate::kms::{
    Algorithm, ClientFactory, CryptoKey, CryptoKeySpec, CryptoKeyUpdate, CryptoKeyVersion,
    EncryptOutput, KeyManagementService, KeyRing, ProtectionLevel, PublicKey, Purpose,
    RemoteResult, VersionPage, VersionState,
};
use crate::{Config, KmsError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const NONCE_SIZE: usize = 12;
const DEFAULT_PAGE_SIZE: usize = 25;
const VERSIONS_SEGMENT: &str = "/cryptoKeyVersions/";

/// Remote method selector for error injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockMethod {
    /// `get_key_ring`
    GetKeyRing,
    /// `create_crypto_key`
    CreateCryptoKey,
    /// `get_crypto_key`
    GetCryptoKey,
    /// `update_crypto_key`
    UpdateCryptoKey,
    /// `create_crypto_key_version`
    CreateVersion,
    /// `update_primary_version`
    UpdatePrimary,
    /// `list_crypto_key_versions`
    ListVersions,
    /// `get_crypto_key_version`
    GetVersion,
    /// `destroy_crypto_key_version`
    Destroy,
    /// `encrypt`
    Encrypt,
    /// `decrypt`
    Decrypt,
    /// `asymmetric_decrypt`
    AsymmetricDecrypt,
    /// `asymmetric_sign`
    Sign,
    /// `verify`
    Verify,
    /// `get_public_key`
    GetPublicKey,
}

struct ScriptedFailure {
    error: RemoteError,
    // None fails forever
    remaining: Option<usize>,
}

struct MockVersion {
    info: CryptoKeyVersion,
    secret: [u8; 32],
}

struct MockKey {
    key: CryptoKey,
    primary: Option<u64>,
    versions: Vec<MockVersion>,
}

impl MockKey {
    fn version(&self, n: u64) -> RemoteResult<&MockVersion> {
        self.versions
            .iter()
            .find(|v| v.info.version() == n)
            .ok_or_else(|| not_found(format!("{}{}{}", self.key.name, VERSIONS_SEGMENT, n)))
    }

    fn enabled_version(&self, n: u64) -> RemoteResult<&MockVersion> {
        let version = self.version(n)?;
        if version.info.state != VersionState::Enabled {
            return Err(RemoteError::new(
                RemoteCode::FailedPrecondition,
                format!("{} is not enabled, current state is: {}", version.info.name, version.info.state),
            ));
        }
        Ok(version)
    }

    fn require_purpose(&self, purpose: Purpose) -> RemoteResult<()> {
        if self.key.purpose != purpose {
            return Err(RemoteError::new(
                RemoteCode::FailedPrecondition,
                format!("{} has purpose {}, not {}", self.key.name, self.key.purpose, purpose),
            ));
        }
        Ok(())
    }

    fn snapshot(&self) -> CryptoKey {
        let mut key = self.key.clone();
        key.primary = self
            .primary
            .and_then(|n| self.version(n).ok())
            .map(|v| v.info.clone());
        key
    }

    fn add_version(&mut self) -> CryptoKeyVersion {
        let n = self.versions.len() as u64 + 1;
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);

        let info = CryptoKeyVersion {
            name: format!("{}{}{}", self.key.name, VERSIONS_SEGMENT, n),
            state: VersionState::Enabled,
            create_time: Some(Utc::now()),
            algorithm: self.key.algorithm,
        };
        self.versions.push(MockVersion {
            info: info.clone(),
            secret,
        });
        info
    }
}

struct State {
    key_rings: BTreeSet<String>,
    keys: BTreeMap<String, MockKey>,
    failures: HashMap<MockMethod, RemoteError>,
    destroy_failures: HashMap<String, ScriptedFailure>,
    destroy_calls: Vec<String>,
    page_size: usize,
    destroy_delay: Duration,
}

impl State {
    fn key(&self, name: &str) -> RemoteResult<&MockKey> {
        self.keys.get(name).ok_or_else(|| not_found(name))
    }

    fn key_mut(&mut self, name: &str) -> RemoteResult<&mut MockKey> {
        self.keys.get_mut(name).ok_or_else(|| not_found(name))
    }
}

struct Shared {
    state: Mutex<State>,
    destroys_in_flight: AtomicUsize,
    peak_destroys_in_flight: AtomicUsize,
    closed_clients: AtomicUsize,
}

/// In-memory key-management service.
///
/// Cloning is cheap; clones share state.
///
/// # Example
///
/// ```
/// use gcpkms::backends::mock::{MockKms, MockMethod};
/// use gcpkms::kms::{Algorithm, KeyManagementService};
/// use gcpkms::{RemoteCode, RemoteError};
///
/// #[tokio::main]
/// async fn main() {
///     let kms = MockKms::new();
///     let key = kms.seed_crypto_key(
///         "projects/p/locations/global/keyRings/r",
///         "k",
///         Algorithm::SymmetricEncryption,
///         3,
///     );
///
///     let client = kms.client();
///     let out = client.encrypt(&key, b"hello", b"").await.unwrap();
///     assert!(out.version_name.ends_with("/cryptoKeyVersions/1"));
///
///     // Test error conditions
///     kms.fail(MockMethod::Encrypt, RemoteError::new(RemoteCode::Unavailable, "down"));
///     assert!(client.encrypt(&key, b"hello", b"").await.is_err());
/// }
/// ```
#[derive(Clone)]
pub struct MockKms {
    shared: Arc<Shared>,
}

impl MockKms {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    key_rings: BTreeSet::new(),
                    keys: BTreeMap::new(),
                    failures: HashMap::new(),
                    destroy_failures: HashMap::new(),
                    destroy_calls: Vec::new(),
                    page_size: DEFAULT_PAGE_SIZE,
                    destroy_delay: Duration::ZERO,
                }),
                destroys_in_flight: AtomicUsize::new(0),
                peak_destroys_in_flight: AtomicUsize::new(0),
                closed_clients: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a new client handle onto this service.
    pub fn client(&self) -> MockClient {
        MockClient {
            kms: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a key ring.
    pub fn add_key_ring(&self, name: impl Into<String>) {
        self.state().key_rings.insert(name.into());
    }

    /// Creates a crypto key with `versions` enabled versions and returns
    /// its resource path. The key ring is created if missing.
    ///
    /// Encrypt/decrypt keys get version 1 as primary.
    pub fn seed_crypto_key(
        &self,
        key_ring: &str,
        crypto_key_id: &str,
        algorithm: Algorithm,
        versions: usize,
    ) -> String {
        let name = format!("{}/cryptoKeys/{}", key_ring, crypto_key_id);
        let purpose = algorithm.purpose();

        let mut state = self.state();
        state.key_rings.insert(key_ring.to_string());

        let mut key = MockKey {
            key: CryptoKey {
                name: name.clone(),
                purpose,
                primary: None,
                algorithm: Some(algorithm),
                protection_level: Some(ProtectionLevel::Software),
                rotation_period: None,
                next_rotation_time: None,
                labels: BTreeMap::new(),
                create_time: Some(Utc::now()),
            },
            primary: None,
            versions: Vec::new(),
        };
        for _ in 0..versions {
            key.add_version();
        }
        if purpose == Purpose::EncryptDecrypt && versions > 0 {
            key.primary = Some(1);
        }

        state.keys.insert(name.clone(), key);
        name
    }

    /// Returns all versions of a key in creation order.
    pub fn versions(&self, crypto_key: &str) -> Vec<CryptoKeyVersion> {
        self.state()
            .keys
            .get(crypto_key)
            .map(|k| k.versions.iter().map(|v| v.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the version numbers of a key that are not destroyed or
    /// scheduled for destruction.
    pub fn live_versions(&self, crypto_key: &str) -> Vec<u64> {
        self.versions(crypto_key)
            .iter()
            .filter(|v| !v.state.is_terminal())
            .map(|v| v.version())
            .collect()
    }

    /// Overrides the state of a version.
    pub fn set_version_state(&self, version: &str, state: VersionState) {
        self.with_version(version, |v| v.info.state = state);
    }

    /// Overrides the creation time of a version.
    pub fn set_create_time(&self, version: &str, time: DateTime<Utc>) {
        self.with_version(version, |v| v.info.create_time = Some(time));
    }

    fn with_version(&self, version: &str, f: impl FnOnce(&mut MockVersion)) {
        let Some((key, n)) = split_version(version) else {
            return;
        };
        let mut state = self.state();
        if let Some(v) = state
            .keys
            .get_mut(key)
            .and_then(|k| k.versions.iter_mut().find(|v| v.info.version() == n))
        {
            f(v);
        }
    }

    /// Sets the listing page size (minimum 1).
    pub fn set_page_size(&self, size: usize) {
        self.state().page_size = size.max(1);
    }

    /// Makes every destroy call take at least `delay`.
    pub fn set_destroy_delay(&self, delay: Duration) {
        self.state().destroy_delay = delay;
    }

    /// Makes every call to `method` fail with `error` until cleared.
    pub fn fail(&self, method: MockMethod, error: RemoteError) {
        self.state().failures.insert(method, error);
    }

    /// Makes destroying `version` fail `times` times (`None` for always).
    pub fn fail_destroy(&self, version: impl Into<String>, error: RemoteError, times: Option<usize>) {
        self.state().destroy_failures.insert(
            version.into(),
            ScriptedFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.destroy_failures.clear();
    }

    /// Every destroy call issued so far, in order, including failed ones.
    pub fn destroy_calls(&self) -> Vec<String> {
        self.state().destroy_calls.clone()
    }

    /// Highest number of destroy calls observed running at once.
    pub fn peak_destroy_concurrency(&self) -> usize {
        self.shared.peak_destroys_in_flight.load(Ordering::SeqCst)
    }

    /// Number of client handles closed so far.
    pub fn closed_clients(&self) -> usize {
        self.shared.closed_clients.load(Ordering::SeqCst)
    }

    /// Encrypts for an asymmetric-decrypt version, standing in for a caller
    /// that holds the public key.
    pub fn encrypt_for(&self, version: &str, plaintext: &[u8]) -> RemoteResult<Vec<u8>> {
        let (key, n) = split_version(version).ok_or_else(|| not_found(version))?;
        let state = self.state();
        let mock = state.key(key)?;
        mock.require_purpose(Purpose::AsymmetricDecrypt)?;
        let v = mock.enabled_version(n)?;
        seal(&v.secret, n, plaintext, &[])
    }

    fn check(&self, method: MockMethod) -> RemoteResult<()> {
        match self.state().failures.get(&method) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn get_key_ring(&self, name: &str) -> RemoteResult<KeyRing> {
        self.check(MockMethod::GetKeyRing)?;
        if self.state().key_rings.contains(name) {
            Ok(KeyRing {
                name: name.to_string(),
            })
        } else {
            Err(not_found(name))
        }
    }

    fn create_crypto_key(
        &self,
        key_ring: &str,
        crypto_key_id: &str,
        spec: &CryptoKeySpec,
    ) -> RemoteResult<CryptoKey> {
        self.check(MockMethod::CreateCryptoKey)?;

        if spec.algorithm.purpose() != spec.purpose {
            return Err(RemoteError::new(
                RemoteCode::InvalidArgument,
                format!("algorithm {} does not match purpose {}", spec.algorithm, spec.purpose),
            ));
        }
        if spec.rotation_period.is_some() && spec.purpose != Purpose::EncryptDecrypt {
            return Err(RemoteError::new(
                RemoteCode::InvalidArgument,
                "rotation period is only supported for encrypt/decrypt keys",
            ));
        }

        let mut state = self.state();
        if !state.key_rings.contains(key_ring) {
            return Err(not_found(key_ring));
        }

        let name = format!("{}/cryptoKeys/{}", key_ring, crypto_key_id);
        if state.keys.contains_key(&name) {
            return Err(RemoteError::new(RemoteCode::AlreadyExists, name));
        }

        let now = Utc::now();
        let mut key = MockKey {
            key: CryptoKey {
                name: name.clone(),
                purpose: spec.purpose,
                primary: None,
                algorithm: Some(spec.algorithm),
                protection_level: Some(spec.protection_level),
                rotation_period: spec.rotation_period,
                next_rotation_time: next_rotation(now, spec.rotation_period),
                labels: spec.labels.clone(),
                create_time: Some(now),
            },
            primary: None,
            versions: Vec::new(),
        };
        key.add_version();
        if spec.purpose == Purpose::EncryptDecrypt {
            key.primary = Some(1);
        }

        let snapshot = key.snapshot();
        state.keys.insert(name, key);
        Ok(snapshot)
    }

    fn get_crypto_key(&self, name: &str) -> RemoteResult<CryptoKey> {
        self.check(MockMethod::GetCryptoKey)?;
        Ok(self.state().key(name)?.snapshot())
    }

    fn update_crypto_key(&self, name: &str, update: &CryptoKeyUpdate) -> RemoteResult<CryptoKey> {
        self.check(MockMethod::UpdateCryptoKey)?;
        let mut state = self.state();
        let mock = state.key_mut(name)?;

        if let Some(period) = update.rotation_period {
            if mock.key.purpose != Purpose::EncryptDecrypt {
                return Err(RemoteError::new(
                    RemoteCode::InvalidArgument,
                    "rotation period is only supported for encrypt/decrypt keys",
                ));
            }
            mock.key.rotation_period = Some(period);
            mock.key.next_rotation_time = next_rotation(Utc::now(), Some(period));
        }
        if let Some(labels) = &update.labels {
            mock.key.labels = labels.clone();
        }

        Ok(mock.snapshot())
    }

    fn create_crypto_key_version(&self, crypto_key: &str) -> RemoteResult<CryptoKeyVersion> {
        self.check(MockMethod::CreateVersion)?;
        let mut state = self.state();
        Ok(state.key_mut(crypto_key)?.add_version())
    }

    fn update_primary_version(&self, crypto_key: &str, version_id: &str) -> RemoteResult<CryptoKey> {
        self.check(MockMethod::UpdatePrimary)?;
        let n: u64 = version_id.parse().map_err(|_| {
            RemoteError::new(
                RemoteCode::InvalidArgument,
                format!("invalid version id {:?}", version_id),
            )
        })?;

        let mut state = self.state();
        let mock = state.key_mut(crypto_key)?;
        mock.require_purpose(Purpose::EncryptDecrypt)?;
        mock.enabled_version(n)?;
        mock.primary = Some(n);
        Ok(mock.snapshot())
    }

    fn list_crypto_key_versions(
        &self,
        crypto_key: &str,
        page_token: Option<&str>,
    ) -> RemoteResult<VersionPage> {
        self.check(MockMethod::ListVersions)?;
        let state = self.state();
        let mock = state.key(crypto_key)?;

        let start = match page_token {
            None | Some("") => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                RemoteError::new(RemoteCode::InvalidArgument, "invalid page token")
            })?,
        };
        let end = (start + state.page_size).min(mock.versions.len());

        let versions = mock
            .versions
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|v| v.info.clone())
            .collect();
        let next_page_token = (end < mock.versions.len()).then(|| end.to_string());

        Ok(VersionPage {
            versions,
            next_page_token,
        })
    }

    fn get_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion> {
        self.check(MockMethod::GetVersion)?;
        let (key, n) = split_version(name).ok_or_else(|| not_found(name))?;
        let state = self.state();
        Ok(state.key(key)?.version(n)?.info.clone())
    }

    async fn destroy_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion> {
        let _in_flight = InFlight::enter(&self.shared);

        let delay = {
            let mut state = self.state();
            state.destroy_calls.push(name.to_string());
            state.destroy_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.check(MockMethod::Destroy)?;

        let mut state = self.state();
        if let Some(scripted) = state.destroy_failures.get_mut(name) {
            let error = scripted.error.clone();
            match scripted.remaining {
                None => return Err(error),
                Some(0) => {}
                Some(ref mut n) => {
                    *n -= 1;
                    return Err(error);
                }
            }
        }

        let (key, n) = split_version(name).ok_or_else(|| not_found(name))?;
        let mock = state.key_mut(key)?;
        let version = mock
            .versions
            .iter_mut()
            .find(|v| v.info.version() == n)
            .ok_or_else(|| not_found(name))?;

        if version.info.state.is_terminal() {
            return Err(RemoteError::new(
                RemoteCode::FailedPrecondition,
                format!("{} is already destroyed or scheduled for destruction", name),
            ));
        }

        version.info.state = VersionState::DestroyScheduled;
        Ok(version.info.clone())
    }

    fn encrypt(&self, name: &str, plaintext: &[u8], aad: &[u8]) -> RemoteResult<EncryptOutput> {
        self.check(MockMethod::Encrypt)?;
        let (key, requested) = match split_version(name) {
            Some((key, n)) => (key, Some(n)),
            None => (name, None),
        };

        let state = self.state();
        let mock = state.key(key)?;
        mock.require_purpose(Purpose::EncryptDecrypt)?;

        let n = match requested.or(mock.primary) {
            Some(n) => n,
            None => {
                return Err(RemoteError::new(
                    RemoteCode::FailedPrecondition,
                    format!("{} has no primary version", key),
                ))
            }
        };
        let version = mock.enabled_version(n)?;

        Ok(EncryptOutput {
            ciphertext: seal(&version.secret, n, plaintext, aad)?,
            version_name: version.info.name.clone(),
        })
    }

    fn decrypt(&self, crypto_key: &str, ciphertext: &[u8], aad: &[u8]) -> RemoteResult<Vec<u8>> {
        self.check(MockMethod::Decrypt)?;
        let state = self.state();
        let mock = state.key(crypto_key)?;
        mock.require_purpose(Purpose::EncryptDecrypt)?;

        let n = embedded_version(ciphertext)?;
        let version = mock.enabled_version(n)?;
        open(&version.secret, ciphertext, aad)
    }

    fn asymmetric_decrypt(&self, version: &str, ciphertext: &[u8]) -> RemoteResult<Vec<u8>> {
        self.check(MockMethod::AsymmetricDecrypt)?;
        let (key, n) = split_version(version).ok_or_else(|| not_found(version))?;
        let state = self.state();
        let mock = state.key(key)?;
        mock.require_purpose(Purpose::AsymmetricDecrypt)?;

        let v = mock.enabled_version(n)?;
        if embedded_version(ciphertext)? != n {
            return Err(decryption_failed());
        }
        open(&v.secret, ciphertext, &[])
    }

    fn asymmetric_sign(&self, version: &str, digest: &[u8]) -> RemoteResult<Vec<u8>> {
        self.check(MockMethod::Sign)?;
        let (key, n) = split_version(version).ok_or_else(|| not_found(version))?;
        let state = self.state();
        let mock = state.key(key)?;
        mock.require_purpose(Purpose::AsymmetricSign)?;

        let v = mock.enabled_version(n)?;
        Ok(mac(&v.secret, digest)?.finalize().into_bytes().to_vec())
    }

    fn verify(&self, version: &str, digest: &[u8], signature: &[u8]) -> RemoteResult<bool> {
        self.check(MockMethod::Verify)?;
        let (key, n) = split_version(version).ok_or_else(|| not_found(version))?;
        let state = self.state();
        let mock = state.key(key)?;
        mock.require_purpose(Purpose::AsymmetricSign)?;

        let v = mock.enabled_version(n)?;
        Ok(mac(&v.secret, digest)?.verify_slice(signature).is_ok())
    }

    fn get_public_key(&self, version: &str) -> RemoteResult<PublicKey> {
        self.check(MockMethod::GetPublicKey)?;
        let (key, n) = split_version(version).ok_or_else(|| not_found(version))?;
        let state = self.state();
        let mock = state.key(key)?;
        if mock.key.purpose == Purpose::EncryptDecrypt {
            return Err(RemoteError::new(
                RemoteCode::FailedPrecondition,
                format!("{} is a symmetric key", key),
            ));
        }

        let v = mock.enabled_version(n)?;
        let fingerprint = Sha256::digest(v.secret);
        Ok(PublicKey {
            pem: format!(
                "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
                STANDARD.encode(fingerprint)
            ),
            algorithm: v
                .info
                .algorithm
                .unwrap_or(Algorithm::RsaSignPss2048Sha256),
        })
    }
}

impl Default for MockKms {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.destroys_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_destroys_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.destroys_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_found(resource: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteCode::NotFound, resource)
}

fn decryption_failed() -> RemoteError {
    RemoteError::new(RemoteCode::InvalidArgument, "decryption failed")
}

fn next_rotation(now: DateTime<Utc>, period: Option<Duration>) -> Option<DateTime<Utc>> {
    period
        .and_then(|p| chrono::Duration::from_std(p).ok())
        .map(|p| now + p)
}

fn split_version(name: &str) -> Option<(&str, u64)> {
    let (key, n) = name.split_once(VERSIONS_SEGMENT)?;
    Some((key, n.parse().ok()?))
}

fn mac(secret: &[u8], data: &[u8]) -> RemoteResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| RemoteError::new(RemoteCode::Unknown, e.to_string()))?;
    mac.update(data);
    Ok(mac)
}

// Ciphertext layout: version (u32 BE) || nonce || sealed
fn seal(secret: &[u8], version: u64, plaintext: &[u8], aad: &[u8]) -> RemoteResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(secret)
        .map_err(|e| RemoteError::new(RemoteCode::Unknown, e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| RemoteError::new(RemoteCode::Unknown, e.to_string()))?;

    let prefix = u32::try_from(version)
        .map_err(|_| RemoteError::new(RemoteCode::InvalidArgument, "version out of range"))?;

    let mut out = Vec::with_capacity(4 + NONCE_SIZE + sealed.len());
    out.extend_from_slice(&prefix.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn embedded_version(ciphertext: &[u8]) -> RemoteResult<u64> {
    let prefix: [u8; 4] = ciphertext
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(decryption_failed)?;
    Ok(u32::from_be_bytes(prefix) as u64)
}

fn open(secret: &[u8], ciphertext: &[u8], aad: &[u8]) -> RemoteResult<Vec<u8>> {
    if ciphertext.len() < 4 + NONCE_SIZE {
        return Err(decryption_failed());
    }
    let cipher = Aes256Gcm::new_from_slice(secret)
        .map_err(|e| RemoteError::new(RemoteCode::Unknown, e.to_string()))?;

    let (nonce, sealed) = ciphertext[4..].split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| decryption_failed())
}

/// Client handle onto a [`MockKms`].
///
/// Calls after [`close`](KeyManagementService::close) fail with
/// [`RemoteCode::Unavailable`].
pub struct MockClient {
    kms: MockKms,
    closed: AtomicBool,
}

impl MockClient {
    fn ensure_open(&self) -> RemoteResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::new(RemoteCode::Unavailable, "client is closed"));
        }
        Ok(())
    }

    /// Returns true once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyManagementService for MockClient {
    async fn get_key_ring(&self, name: &str) -> RemoteResult<KeyRing> {
        self.ensure_open()?;
        self.kms.get_key_ring(name)
    }

    async fn create_crypto_key(
        &self,
        key_ring: &str,
        crypto_key_id: &str,
        spec: &CryptoKeySpec,
    ) -> RemoteResult<CryptoKey> {
        self.ensure_open()?;
        self.kms.create_crypto_key(key_ring, crypto_key_id, spec)
    }

    async fn get_crypto_key(&self, name: &str) -> RemoteResult<CryptoKey> {
        self.ensure_open()?;
        self.kms.get_crypto_key(name)
    }

    async fn update_crypto_key(
        &self,
        name: &str,
        update: &CryptoKeyUpdate,
    ) -> RemoteResult<CryptoKey> {
        self.ensure_open()?;
        self.kms.update_crypto_key(name, update)
    }

    async fn create_crypto_key_version(&self, crypto_key: &str) -> RemoteResult<CryptoKeyVersion> {
        self.ensure_open()?;
        self.kms.create_crypto_key_version(crypto_key)
    }

    async fn update_primary_version(
        &self,
        crypto_key: &str,
        version_id: &str,
    ) -> RemoteResult<CryptoKey> {
        self.ensure_open()?;
        self.kms.update_primary_version(crypto_key, version_id)
    }

    async fn list_crypto_key_versions(
        &self,
        crypto_key: &str,
        page_token: Option<&str>,
    ) -> RemoteResult<VersionPage> {
        self.ensure_open()?;
        self.kms.list_crypto_key_versions(crypto_key, page_token)
    }

    async fn get_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion> {
        self.ensure_open()?;
        self.kms.get_crypto_key_version(name)
    }

    async fn destroy_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion> {
        self.ensure_open()?;
        self.kms.destroy_crypto_key_version(name).await
    }

    async fn encrypt(
        &self,
        name: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> RemoteResult<EncryptOutput> {
        self.ensure_open()?;
        self.kms.encrypt(name, plaintext, aad)
    }

    async fn decrypt(
        &self,
        crypto_key: &str,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> RemoteResult<Vec<u8>> {
        self.ensure_open()?;
        self.kms.decrypt(crypto_key, ciphertext, aad)
    }

    async fn asymmetric_decrypt(&self, version: &str, ciphertext: &[u8]) -> RemoteResult<Vec<u8>> {
        self.ensure_open()?;
        self.kms.asymmetric_decrypt(version, ciphertext)
    }

    async fn asymmetric_sign(&self, version: &str, digest: &[u8]) -> RemoteResult<Vec<u8>> {
        self.ensure_open()?;
        self.kms.asymmetric_sign(version, digest)
    }

    async fn verify(&self, version: &str, digest: &[u8], signature: &[u8]) -> RemoteResult<bool> {
        self.ensure_open()?;
        self.kms.verify(version, digest, signature)
    }

    async fn get_public_key(&self, version: &str) -> RemoteResult<PublicKey> {
        self.ensure_open()?;
        self.kms.get_public_key(version)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.kms.shared.closed_clients.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Builds [`MockClient`] handles onto one shared [`MockKms`].
///
/// Records every connect and the configuration it was given.
pub struct MockClientFactory {
    kms: MockKms,
    connects: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    last_config: Mutex<Option<Config>>,
}

impl MockClientFactory {
    /// Creates a factory onto a fresh, empty [`MockKms`].
    pub fn new() -> Self {
        Self::with_kms(MockKms::new())
    }

    /// Creates a factory onto an existing service.
    pub fn with_kms(kms: MockKms) -> Self {
        Self {
            kms,
            connects: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            last_config: Mutex::new(None),
        }
    }

    /// The service every handle talks to.
    pub fn kms(&self) -> &MockKms {
        &self.kms
    }

    /// Number of handles built so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes the next connect fail with a credentials error.
    pub fn fail_next_connect(&self, message: impl Into<String>) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.into());
    }

    /// Scopes passed to the most recent connect.
    pub fn last_scopes(&self) -> Vec<String> {
        self.last_config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|c| c.scopes.clone())
            .unwrap_or_default()
    }
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self, config: &Config) -> Result<Arc<dyn KeyManagementService>> {
        let failure = self
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(message) = failure {
            return Err(KmsError::Credentials(message));
        }

        if !config.credentials.is_empty() {
            serde_json::from_str::<serde_json::Value>(&config.credentials)
                .map_err(|e| KmsError::Credentials(format!("failed to parse credentials: {}", e)))?;
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        *self
            .last_config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(config.clone());

        Ok(Arc::new(self.kms.client()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: &str = "projects/p/locations/global/keyRings/r";

    fn spec(algorithm: Algorithm) -> CryptoKeySpec {
        CryptoKeySpec {
            purpose: algorithm.purpose(),
            algorithm,
            protection_level: ProtectionLevel::Software,
            rotation_period: None,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let kms = MockKms::new();
        kms.add_key_ring(RING);
        let client = kms.client();

        let key = client
            .create_crypto_key(RING, "k", &spec(Algorithm::SymmetricEncryption))
            .await
            .unwrap();
        assert_eq!(key.name, format!("{}/cryptoKeys/k", RING));
        assert_eq!(key.primary.as_ref().map(|v| v.version()), Some(1));

        let err = client
            .create_crypto_key(RING, "k", &spec(Algorithm::SymmetricEncryption))
            .await
            .unwrap_err();
        assert_eq!(err.code, RemoteCode::AlreadyExists);

        let missing = "projects/p/locations/global/keyRings/missing";
        let err = client
            .create_crypto_key(missing, "k", &spec(Algorithm::SymmetricEncryption))
            .await
            .unwrap_err();
        assert_eq!(err.code, RemoteCode::NotFound);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_across_versions() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "k", Algorithm::SymmetricEncryption, 1);
        let client = kms.client();

        let old = client.encrypt(&key, b"secret", b"aad").await.unwrap();

        let v2 = client.create_crypto_key_version(&key).await.unwrap();
        client.update_primary_version(&key, "2").await.unwrap();
        let new = client.encrypt(&key, b"secret", b"aad").await.unwrap();
        assert_eq!(new.version_name, v2.name);

        assert_eq!(client.decrypt(&key, &old.ciphertext, b"aad").await.unwrap(), b"secret");
        assert_eq!(client.decrypt(&key, &new.ciphertext, b"aad").await.unwrap(), b"secret");

        let err = client.decrypt(&key, &old.ciphertext, b"other").await.unwrap_err();
        assert_eq!(err.code, RemoteCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_sign_verify() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "s", Algorithm::EcSignP256Sha256, 2);
        let client = kms.client();
        let v1 = format!("{}/cryptoKeyVersions/1", key);
        let v2 = format!("{}/cryptoKeyVersions/2", key);

        let sig = client.asymmetric_sign(&v1, b"digest").await.unwrap();
        assert!(client.verify(&v1, b"digest", &sig).await.unwrap());
        assert!(!client.verify(&v2, b"digest", &sig).await.unwrap());
        assert!(!client.verify(&v1, b"tampered", &sig).await.unwrap());

        let pem = client.get_public_key(&v1).await.unwrap().pem;
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn test_asymmetric_decrypt() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "d", Algorithm::RsaDecryptOaep2048Sha256, 1);
        let version = format!("{}/cryptoKeyVersions/1", key);

        let ciphertext = kms.encrypt_for(&version, b"hello").unwrap();
        let plaintext = kms.client().asymmetric_decrypt(&version, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "k", Algorithm::SymmetricEncryption, 5);
        kms.set_page_size(2);
        let client = kms.client();

        let first = client.list_crypto_key_versions(&key, None).await.unwrap();
        assert_eq!(first.versions.len(), 2);
        let token = first.next_page_token.unwrap();

        let second = client.list_crypto_key_versions(&key, Some(&token)).await.unwrap();
        assert_eq!(second.versions[0].version(), 3);

        let last = client
            .list_crypto_key_versions(&key, second.next_page_token.as_deref())
            .await
            .unwrap();
        assert_eq!(last.versions.len(), 1);
        assert!(last.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_destroy() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "k", Algorithm::SymmetricEncryption, 2);
        let client = kms.client();
        let v1 = format!("{}/cryptoKeyVersions/1", key);

        let destroyed = client.destroy_crypto_key_version(&v1).await.unwrap();
        assert_eq!(destroyed.state, VersionState::DestroyScheduled);
        assert_eq!(kms.live_versions(&key), vec![2]);

        let err = client.destroy_crypto_key_version(&v1).await.unwrap_err();
        assert_eq!(err.code, RemoteCode::FailedPrecondition);

        let err = client
            .destroy_crypto_key_version(&format!("{}/cryptoKeyVersions/9", key))
            .await
            .unwrap_err();
        assert_eq!(err.code, RemoteCode::NotFound);
        assert_eq!(kms.destroy_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_error_injection() {
        let kms = MockKms::new();
        let key = kms.seed_crypto_key(RING, "k", Algorithm::SymmetricEncryption, 2);
        let client = kms.client();
        let v1 = format!("{}/cryptoKeyVersions/1", key);

        kms.fail(MockMethod::GetCryptoKey, RemoteError::new(RemoteCode::PermissionDenied, "nope"));
        let err = client.get_crypto_key(&key).await.unwrap_err();
        assert_eq!(err.code, RemoteCode::PermissionDenied);

        kms.fail_destroy(&v1, RemoteError::new(RemoteCode::Unavailable, "busy"), Some(1));
        assert!(client.destroy_crypto_key_version(&v1).await.is_err());
        assert!(client.destroy_crypto_key_version(&v1).await.is_ok());

        kms.clear_failures();
        assert!(client.get_crypto_key(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client() {
        let factory = MockClientFactory::new();
        let client = factory.connect(&Config::default()).await.unwrap();
        client.close().await;

        let err = client.get_key_ring(RING).await.unwrap_err();
        assert_eq!(err.code, RemoteCode::Unavailable);
        assert_eq!(factory.kms().closed_clients(), 1);
    }

    #[tokio::test]
    async fn test_factory_rejects_bad_credentials() {
        let factory = MockClientFactory::new();
        let config = Config {
            credentials: "{not json".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            factory.connect(&config).await,
            Err(KmsError::Credentials(_))
        ));
        assert_eq!(factory.connect_count(), 0);
    }
}
