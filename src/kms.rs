//! Remote key-management service contract.
//!
//! This module defines the [`KeyManagementService`] trait the engine drives
//! and the [`ClientFactory`] that builds authenticated handles from the
//! stored [`Config`]. Implementations live under [`crate::backends`].

use crate::error::RemoteError;
use crate::{Config, KmsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// Result of a single remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

macro_rules! remote_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Upper-case remote name, e.g. `ENCRYPT_DECRYPT`.
            pub fn as_remote(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }

            /// Parses the upper-case remote name.
            pub fn from_remote(s: &str) -> Option<Self> {
                match s {
                    $($wire => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_remote().to_lowercase())
            }
        }

        impl FromStr for $name {
            type Err = KmsError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_remote(&s.trim().to_uppercase()).ok_or_else(|| {
                    KmsError::Validation(format!(
                        "unknown {}: {:?}",
                        stringify!($name).to_lowercase(),
                        s
                    ))
                })
            }
        }
    };
}

remote_enum! {
    /// What a crypto key is used for.
    pub enum Purpose {
        /// Symmetric encrypt/decrypt
        EncryptDecrypt => "ENCRYPT_DECRYPT",
        /// Asymmetric signing
        AsymmetricSign => "ASYMMETRIC_SIGN",
        /// Asymmetric decryption
        AsymmetricDecrypt => "ASYMMETRIC_DECRYPT",
    }
}

remote_enum! {
    /// Algorithm of a crypto key version.
    pub enum Algorithm {
        /// AES-256-GCM managed by the remote service
        SymmetricEncryption => "GOOGLE_SYMMETRIC_ENCRYPTION",
        /// RSASSA-PSS 2048 bit, SHA-256
        RsaSignPss2048Sha256 => "RSA_SIGN_PSS_2048_SHA256",
        /// RSASSA-PSS 3072 bit, SHA-256
        RsaSignPss3072Sha256 => "RSA_SIGN_PSS_3072_SHA256",
        /// RSASSA-PSS 4096 bit, SHA-256
        RsaSignPss4096Sha256 => "RSA_SIGN_PSS_4096_SHA256",
        /// RSASSA-PKCS1-v1_5 2048 bit, SHA-256
        RsaSignPkcs12048Sha256 => "RSA_SIGN_PKCS1_2048_SHA256",
        /// RSASSA-PKCS1-v1_5 3072 bit, SHA-256
        RsaSignPkcs13072Sha256 => "RSA_SIGN_PKCS1_3072_SHA256",
        /// RSASSA-PKCS1-v1_5 4096 bit, SHA-256
        RsaSignPkcs14096Sha256 => "RSA_SIGN_PKCS1_4096_SHA256",
        /// RSAES-OAEP 2048 bit, SHA-256
        RsaDecryptOaep2048Sha256 => "RSA_DECRYPT_OAEP_2048_SHA256",
        /// RSAES-OAEP 3072 bit, SHA-256
        RsaDecryptOaep3072Sha256 => "RSA_DECRYPT_OAEP_3072_SHA256",
        /// RSAES-OAEP 4096 bit, SHA-256
        RsaDecryptOaep4096Sha256 => "RSA_DECRYPT_OAEP_4096_SHA256",
        /// ECDSA P-256, SHA-256
        EcSignP256Sha256 => "EC_SIGN_P256_SHA256",
        /// ECDSA P-384, SHA-384
        EcSignP384Sha384 => "EC_SIGN_P384_SHA384",
    }
}

remote_enum! {
    /// Where key material lives.
    pub enum ProtectionLevel {
        /// Software keys
        Software => "SOFTWARE",
        /// Hardware security module
        Hsm => "HSM",
    }
}

remote_enum! {
    /// Lifecycle state of a crypto key version.
    pub enum VersionState {
        /// State not reported
        Unspecified => "CRYPTO_KEY_VERSION_STATE_UNSPECIFIED",
        /// Key material still being generated
        PendingGeneration => "PENDING_GENERATION",
        /// Usable
        Enabled => "ENABLED",
        /// Not usable, can be re-enabled
        Disabled => "DISABLED",
        /// Material is gone
        Destroyed => "DESTROYED",
        /// Destroy pending
        DestroyScheduled => "DESTROY_SCHEDULED",
        /// Import in progress
        PendingImport => "PENDING_IMPORT",
    }
}

impl Algorithm {
    /// Purpose this algorithm belongs to.
    pub fn purpose(&self) -> Purpose {
        match self {
            Self::SymmetricEncryption => Purpose::EncryptDecrypt,
            Self::RsaDecryptOaep2048Sha256
            | Self::RsaDecryptOaep3072Sha256
            | Self::RsaDecryptOaep4096Sha256 => Purpose::AsymmetricDecrypt,
            _ => Purpose::AsymmetricSign,
        }
    }

    /// Parses the lower-case short form used by operation fields
    /// (`symmetric_encryption`, `rsa_sign_pss_2048_sha256`, ...).
    pub fn from_field(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        if upper == "SYMMETRIC_ENCRYPTION" {
            return Ok(Self::SymmetricEncryption);
        }
        upper.parse()
    }
}

impl VersionState {
    /// Destroyed or scheduled for destruction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::DestroyScheduled)
    }
}

/// A remote crypto key.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoKey {
    /// Full resource path
    pub name: String,
    /// Key purpose
    pub purpose: Purpose,
    /// Current primary version, for encrypt/decrypt keys
    pub primary: Option<CryptoKeyVersion>,
    /// Algorithm of new versions
    pub algorithm: Option<Algorithm>,
    /// Protection level of new versions
    pub protection_level: Option<ProtectionLevel>,
    /// Automatic rotation period
    pub rotation_period: Option<std::time::Duration>,
    /// Next automatic rotation
    pub next_rotation_time: Option<DateTime<Utc>>,
    /// User labels
    pub labels: BTreeMap<String, String>,
    /// Creation time
    pub create_time: Option<DateTime<Utc>>,
}

/// Parameters for creating a remote crypto key.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoKeySpec {
    /// Key purpose
    pub purpose: Purpose,
    /// Version algorithm
    pub algorithm: Algorithm,
    /// Protection level
    pub protection_level: ProtectionLevel,
    /// Automatic rotation period (encrypt/decrypt keys only)
    pub rotation_period: Option<std::time::Duration>,
    /// User labels
    pub labels: BTreeMap<String, String>,
}

/// Mutable properties of an existing crypto key. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptoKeyUpdate {
    /// New rotation period
    pub rotation_period: Option<std::time::Duration>,
    /// New label set (replaces existing labels)
    pub labels: Option<BTreeMap<String, String>>,
}

impl CryptoKeyUpdate {
    /// Returns true if nothing would change.
    pub fn is_empty(&self) -> bool {
        self.rotation_period.is_none() && self.labels.is_none()
    }
}

/// One version of a remote crypto key.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoKeyVersion {
    /// Full resource path, ending in `/cryptoKeyVersions/{n}`
    pub name: String,
    /// Lifecycle state
    pub state: VersionState,
    /// Creation time, if reported
    pub create_time: Option<DateTime<Utc>>,
    /// Algorithm, if reported
    pub algorithm: Option<Algorithm>,
}

impl CryptoKeyVersion {
    /// Sequence number parsed from the resource path (0 if unparsable).
    pub fn version(&self) -> u64 {
        version_number(&self.name)
    }
}

/// One page of a version listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionPage {
    /// Versions on this page
    pub versions: Vec<CryptoKeyVersion>,
    /// Token for the next page, if any
    pub next_page_token: Option<String>,
}

/// Result of an encrypt call.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptOutput {
    /// Ciphertext bytes
    pub ciphertext: Vec<u8>,
    /// Version that produced the ciphertext
    pub version_name: String,
}

/// Public half of an asymmetric key version.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    /// PEM-encoded SubjectPublicKeyInfo
    pub pem: String,
    /// Version algorithm
    pub algorithm: Algorithm,
}

/// A remote key-ring.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRing {
    /// Full resource path
    pub name: String,
}

/// Parses the trailing version number out of a resource path.
///
/// ```
/// use gcpkms::kms::version_number;
///
/// assert_eq!(version_number("projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/7"), 7);
/// assert_eq!(version_number("garbage"), 0);
/// ```
pub fn version_number(name: &str) -> u64 {
    name.rsplit('/')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Authenticated handle to the remote key-management service.
///
/// Every method is one remote call. Handles are shared between concurrent
/// operations through [`ClientCache`](crate::ClientCache), so implementations
/// must be `Send + Sync`.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Fetches a key ring.
    async fn get_key_ring(&self, name: &str) -> RemoteResult<KeyRing>;

    /// Creates a crypto key under `key_ring` with the given id.
    async fn create_crypto_key(
        &self,
        key_ring: &str,
        crypto_key_id: &str,
        spec: &CryptoKeySpec,
    ) -> RemoteResult<CryptoKey>;

    /// Fetches a crypto key.
    async fn get_crypto_key(&self, name: &str) -> RemoteResult<CryptoKey>;

    /// Updates rotation period and/or labels of a crypto key.
    async fn update_crypto_key(&self, name: &str, update: &CryptoKeyUpdate)
        -> RemoteResult<CryptoKey>;

    /// Adds a new version to a crypto key.
    async fn create_crypto_key_version(&self, crypto_key: &str) -> RemoteResult<CryptoKeyVersion>;

    /// Makes version `version_id` the primary of an encrypt/decrypt key.
    async fn update_primary_version(&self, crypto_key: &str, version_id: &str)
        -> RemoteResult<CryptoKey>;

    /// Returns one page of a crypto key's versions.
    async fn list_crypto_key_versions(
        &self,
        crypto_key: &str,
        page_token: Option<&str>,
    ) -> RemoteResult<VersionPage>;

    /// Fetches one version.
    async fn get_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion>;

    /// Schedules a version for destruction.
    async fn destroy_crypto_key_version(&self, name: &str) -> RemoteResult<CryptoKeyVersion>;

    /// Symmetric encryption with a key (primary) or a specific version.
    async fn encrypt(&self, name: &str, plaintext: &[u8], aad: &[u8])
        -> RemoteResult<EncryptOutput>;

    /// Symmetric decryption.
    async fn decrypt(&self, crypto_key: &str, ciphertext: &[u8], aad: &[u8])
        -> RemoteResult<Vec<u8>>;

    /// Asymmetric decryption with a specific version.
    async fn asymmetric_decrypt(&self, version: &str, ciphertext: &[u8]) -> RemoteResult<Vec<u8>>;

    /// Signs a precomputed digest with a specific version.
    async fn asymmetric_sign(&self, version: &str, digest: &[u8]) -> RemoteResult<Vec<u8>>;

    /// Checks a signature over a digest made with a specific version.
    async fn verify(&self, version: &str, digest: &[u8], signature: &[u8]) -> RemoteResult<bool>;

    /// Fetches the public key of an asymmetric version.
    async fn get_public_key(&self, version: &str) -> RemoteResult<PublicKey>;

    /// Releases connections. Called before the handle is discarded.
    async fn close(&self) {}
}

/// Builds authenticated handles from configuration.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Resolves credentials (explicit JSON in `config`, else ambient
    /// defaults) and constructs a handle bound to `config.scopes`.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Credentials`] if credentials cannot be parsed or
    /// discovered, or another error if the handle cannot be built.
    async fn connect(&self, config: &Config) -> Result<Arc<dyn KeyManagementService>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_parse() {
        assert_eq!(
            "encrypt_decrypt".parse::<Purpose>().unwrap(),
            Purpose::EncryptDecrypt
        );
        assert_eq!(
            "ASYMMETRIC_SIGN".parse::<Purpose>().unwrap(),
            Purpose::AsymmetricSign
        );
        assert!("sign".parse::<Purpose>().unwrap_err().is_validation());
        assert_eq!(Purpose::AsymmetricDecrypt.to_string(), "asymmetric_decrypt");
    }

    #[test]
    fn test_algorithm_field_names() {
        assert_eq!(
            Algorithm::from_field("symmetric_encryption").unwrap(),
            Algorithm::SymmetricEncryption
        );
        assert_eq!(
            Algorithm::from_field("ec_sign_p384_sha384").unwrap(),
            Algorithm::EcSignP384Sha384
        );
        assert_eq!(
            Algorithm::RsaDecryptOaep3072Sha256.purpose(),
            Purpose::AsymmetricDecrypt
        );
        assert_eq!(
            Algorithm::RsaSignPkcs12048Sha256.purpose(),
            Purpose::AsymmetricSign
        );
        assert!(Algorithm::from_field("rot13").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(VersionState::Destroyed.is_terminal());
        assert!(VersionState::DestroyScheduled.is_terminal());
        assert!(!VersionState::Enabled.is_terminal());
        assert!(!VersionState::PendingGeneration.is_terminal());
        assert_eq!(
            VersionState::from_remote("DESTROY_SCHEDULED"),
            Some(VersionState::DestroyScheduled)
        );
    }

    #[test]
    fn test_version_number() {
        let v = CryptoKeyVersion {
            name: "k/cryptoKeyVersions/12".to_string(),
            state: VersionState::Enabled,
            create_time: None,
            algorithm: None,
        };
        assert_eq!(v.version(), 12);
    }
}
