//! Named operations and their typed parameters.
//!
//! The dispatcher hands over an operation name and an untyped field map.
//! [`Operation::parse`] checks the map against the operation's schema and
//! converts it into one strongly-typed [`Operation`] variant. Nothing
//! downstream sees the raw map.

use crate::config::ConfigUpdate;
use crate::kms::{Algorithm, ProtectionLevel, Purpose};
use crate::validation::{validate_fields, validate_key_name, FieldMap, Fields};
use crate::{KmsError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const KEY: &str = "key";
const KEY_VERSION: &str = "key_version";
const AAD: &str = "additional_authenticated_data";

/// Every operation the engine serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `config/read`
    ConfigRead,
    /// `config/write`
    ConfigWrite,
    /// `config/delete`
    ConfigDelete,
    /// `info/read`
    InfoRead,
    /// `keys/list`
    KeysList,
    /// `keys/read`
    KeysRead,
    /// `keys/write`
    KeysWrite,
    /// `keys/delete`
    KeysDelete,
    /// `keys/config/read`
    KeysConfigRead,
    /// `keys/config/write`
    KeysConfigWrite,
    /// `keys/register`
    KeysRegister,
    /// `keys/deregister`
    KeysDeregister,
    /// `keys/rotate`
    KeysRotate,
    /// `keys/trim`
    KeysTrim,
    /// `encrypt`
    Encrypt,
    /// `decrypt`
    Decrypt,
    /// `reencrypt`
    Reencrypt,
    /// `sign`
    Sign,
    /// `verify`
    Verify,
    /// `pubkey`
    Pubkey,
}

impl OperationKind {
    /// All kinds, in dispatch-table order.
    pub const ALL: [OperationKind; 20] = [
        Self::ConfigRead,
        Self::ConfigWrite,
        Self::ConfigDelete,
        Self::InfoRead,
        Self::KeysList,
        Self::KeysRead,
        Self::KeysWrite,
        Self::KeysDelete,
        Self::KeysConfigRead,
        Self::KeysConfigWrite,
        Self::KeysRegister,
        Self::KeysDeregister,
        Self::KeysRotate,
        Self::KeysTrim,
        Self::Encrypt,
        Self::Decrypt,
        Self::Reencrypt,
        Self::Sign,
        Self::Verify,
        Self::Pubkey,
    ];

    /// Stable operation name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigRead => "config/read",
            Self::ConfigWrite => "config/write",
            Self::ConfigDelete => "config/delete",
            Self::InfoRead => "info/read",
            Self::KeysList => "keys/list",
            Self::KeysRead => "keys/read",
            Self::KeysWrite => "keys/write",
            Self::KeysDelete => "keys/delete",
            Self::KeysConfigRead => "keys/config/read",
            Self::KeysConfigWrite => "keys/config/write",
            Self::KeysRegister => "keys/register",
            Self::KeysDeregister => "keys/deregister",
            Self::KeysRotate => "keys/rotate",
            Self::KeysTrim => "keys/trim",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Reencrypt => "reencrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::Pubkey => "pubkey",
        }
    }

    /// Field names the operation accepts.
    pub fn schema(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigRead
            | Self::ConfigDelete
            | Self::InfoRead
            | Self::KeysList => &[],
            Self::ConfigWrite => &["credentials", "scopes", "service_account_email"],
            Self::KeysRead
            | Self::KeysDelete
            | Self::KeysConfigRead
            | Self::KeysDeregister
            | Self::KeysRotate => &[KEY],
            Self::KeysWrite => &[
                KEY,
                "key_ring",
                "crypto_key",
                "purpose",
                "algorithm",
                "protection_level",
                "rotation_period",
                "labels",
            ],
            Self::KeysConfigWrite => &[KEY, "min_version", "max_version"],
            Self::KeysRegister => &[KEY, "crypto_key", "verify"],
            Self::KeysTrim => &[KEY, "keep"],
            Self::Encrypt => &[KEY, "plaintext", AAD, KEY_VERSION],
            Self::Decrypt | Self::Reencrypt => &[KEY, "ciphertext", AAD, KEY_VERSION],
            Self::Sign => &[KEY, "digest", KEY_VERSION],
            Self::Verify => &[KEY, "digest", "signature", KEY_VERSION],
            Self::Pubkey => &[KEY, KEY_VERSION],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OperationKind {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| KmsError::Validation(format!("unsupported operation: {}", s)))
    }
}

/// Parameters of `keys/write`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWrite {
    /// Alias
    pub key: String,
    /// Parent key ring, required when the alias is new
    pub key_ring: Option<String>,
    /// Remote key id under the ring (defaults to the alias)
    pub crypto_key: Option<String>,
    /// Key purpose (defaults to encrypt/decrypt)
    pub purpose: Option<Purpose>,
    /// Version algorithm
    pub algorithm: Option<Algorithm>,
    /// Protection level (defaults to software)
    pub protection_level: Option<ProtectionLevel>,
    /// Automatic rotation period
    pub rotation_period: Option<Duration>,
    /// User labels
    pub labels: Option<BTreeMap<String, String>>,
}

/// A validated, typed operation.
///
/// Base64 payloads are kept as received and decoded only after the version
/// window has been checked.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read configuration
    ConfigRead,
    /// Update configuration
    ConfigWrite(ConfigUpdate),
    /// Reset configuration to defaults
    ConfigDelete,
    /// Plugin build information
    InfoRead,
    /// List aliases
    KeysList,
    /// Read remote key details
    KeysRead { key: String },
    /// Create a remote key, or update an existing one
    KeysWrite(KeyWrite),
    /// Destroy all remote versions and unlink the alias
    KeysDelete { key: String },
    /// Read the alias record
    KeysConfigRead { key: String },
    /// Update the version window
    KeysConfigWrite {
        key: String,
        min_version: Option<i64>,
        max_version: Option<i64>,
    },
    /// Attach an existing remote key
    KeysRegister {
        key: String,
        crypto_key: String,
        verify: bool,
    },
    /// Unlink the alias, leaving the remote key alone
    KeysDeregister { key: String },
    /// Add a version
    KeysRotate { key: String },
    /// Destroy all but the newest versions
    KeysTrim { key: String, keep: Option<usize> },
    /// Symmetric encrypt
    Encrypt {
        key: String,
        plaintext: Vec<u8>,
        aad: Vec<u8>,
        key_version: u64,
    },
    /// Symmetric decrypt, or asymmetric decrypt when `key_version` is set
    Decrypt {
        key: String,
        ciphertext: String,
        aad: Vec<u8>,
        key_version: u64,
    },
    /// Decrypt and encrypt again with the primary or given version
    Reencrypt {
        key: String,
        ciphertext: String,
        aad: Vec<u8>,
        key_version: u64,
    },
    /// Asymmetric sign of a digest
    Sign {
        key: String,
        digest: String,
        key_version: u64,
    },
    /// Signature check
    Verify {
        key: String,
        digest: String,
        signature: String,
        key_version: u64,
    },
    /// Public key of an asymmetric version
    Pubkey { key: String, key_version: u64 },
}

impl Operation {
    /// Validates `fields` against the schema of `kind` and converts them.
    ///
    /// Unknown fields are rejected before anything else is looked at.
    ///
    /// # Example
    ///
    /// ```
    /// use gcpkms::operation::{Operation, OperationKind};
    /// use serde_json::json;
    ///
    /// let fields = json!({"key": "my-key", "keep": "5"});
    /// let op = Operation::parse(OperationKind::KeysTrim, fields.as_object().unwrap()).unwrap();
    /// assert_eq!(op, Operation::KeysTrim { key: "my-key".into(), keep: Some(5) });
    ///
    /// let bad = json!({"key": "my-key", "literally-never-a-key": true});
    /// let err = Operation::parse(OperationKind::KeysTrim, bad.as_object().unwrap()).unwrap_err();
    /// assert_eq!(err.to_string(), "unknown field: literally-never-a-key");
    /// ```
    pub fn parse(kind: OperationKind, raw: &FieldMap) -> Result<Self> {
        validate_fields(kind.schema(), raw)?;
        let fields = Fields::new(raw);

        let op = match kind {
            OperationKind::ConfigRead => Self::ConfigRead,
            OperationKind::ConfigDelete => Self::ConfigDelete,
            OperationKind::InfoRead => Self::InfoRead,
            OperationKind::KeysList => Self::KeysList,
            OperationKind::ConfigWrite => Self::ConfigWrite(ConfigUpdate {
                credentials: fields.string("credentials")?,
                scopes: fields.comma_list("scopes")?,
                service_account_email: fields.string("service_account_email")?,
            }),
            OperationKind::KeysRead => Self::KeysRead {
                key: key_name(&fields)?,
            },
            OperationKind::KeysWrite => Self::KeysWrite(KeyWrite {
                key: key_name(&fields)?,
                key_ring: fields.string("key_ring")?.filter(|s| !s.is_empty()),
                crypto_key: fields.string("crypto_key")?.filter(|s| !s.is_empty()),
                purpose: fields.string("purpose")?.map(|s| s.parse()).transpose()?,
                algorithm: fields
                    .string("algorithm")?
                    .map(|s| Algorithm::from_field(&s))
                    .transpose()?,
                protection_level: fields
                    .string("protection_level")?
                    .map(|s| s.parse())
                    .transpose()?,
                rotation_period: fields.duration("rotation_period")?,
                labels: fields.key_values("labels")?,
            }),
            OperationKind::KeysDelete => Self::KeysDelete {
                key: key_name(&fields)?,
            },
            OperationKind::KeysConfigRead => Self::KeysConfigRead {
                key: key_name(&fields)?,
            },
            OperationKind::KeysConfigWrite => Self::KeysConfigWrite {
                key: key_name(&fields)?,
                min_version: fields.int("min_version")?,
                max_version: fields.int("max_version")?,
            },
            OperationKind::KeysRegister => Self::KeysRegister {
                key: key_name(&fields)?,
                crypto_key: fields.required_string("crypto_key")?,
                verify: fields.bool("verify")?.unwrap_or(true),
            },
            OperationKind::KeysDeregister => Self::KeysDeregister {
                key: key_name(&fields)?,
            },
            OperationKind::KeysRotate => Self::KeysRotate {
                key: key_name(&fields)?,
            },
            OperationKind::KeysTrim => Self::KeysTrim {
                key: key_name(&fields)?,
                keep: match fields.int("keep")? {
                    None => None,
                    Some(n) if n >= 1 => Some(n as usize),
                    Some(_) => {
                        return Err(KmsError::Validation(
                            "keep must be at least 1".to_string(),
                        ))
                    }
                },
            },
            OperationKind::Encrypt => Self::Encrypt {
                key: key_name(&fields)?,
                plaintext: fields.required_string("plaintext")?.into_bytes(),
                aad: aad(&fields)?,
                key_version: fields.version(KEY_VERSION)?,
            },
            OperationKind::Decrypt => Self::Decrypt {
                key: key_name(&fields)?,
                ciphertext: fields.required_string("ciphertext")?,
                aad: aad(&fields)?,
                key_version: fields.version(KEY_VERSION)?,
            },
            OperationKind::Reencrypt => Self::Reencrypt {
                key: key_name(&fields)?,
                ciphertext: fields.required_string("ciphertext")?,
                aad: aad(&fields)?,
                key_version: fields.version(KEY_VERSION)?,
            },
            OperationKind::Sign => Self::Sign {
                key: key_name(&fields)?,
                digest: fields.required_string("digest")?,
                key_version: required_version(&fields)?,
            },
            OperationKind::Verify => Self::Verify {
                key: key_name(&fields)?,
                digest: fields.required_string("digest")?,
                signature: fields.required_string("signature")?,
                key_version: required_version(&fields)?,
            },
            OperationKind::Pubkey => Self::Pubkey {
                key: key_name(&fields)?,
                key_version: required_version(&fields)?,
            },
        };

        Ok(op)
    }

    /// Kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::ConfigRead => OperationKind::ConfigRead,
            Self::ConfigWrite(_) => OperationKind::ConfigWrite,
            Self::ConfigDelete => OperationKind::ConfigDelete,
            Self::InfoRead => OperationKind::InfoRead,
            Self::KeysList => OperationKind::KeysList,
            Self::KeysRead { .. } => OperationKind::KeysRead,
            Self::KeysWrite(_) => OperationKind::KeysWrite,
            Self::KeysDelete { .. } => OperationKind::KeysDelete,
            Self::KeysConfigRead { .. } => OperationKind::KeysConfigRead,
            Self::KeysConfigWrite { .. } => OperationKind::KeysConfigWrite,
            Self::KeysRegister { .. } => OperationKind::KeysRegister,
            Self::KeysDeregister { .. } => OperationKind::KeysDeregister,
            Self::KeysRotate { .. } => OperationKind::KeysRotate,
            Self::KeysTrim { .. } => OperationKind::KeysTrim,
            Self::Encrypt { .. } => OperationKind::Encrypt,
            Self::Decrypt { .. } => OperationKind::Decrypt,
            Self::Reencrypt { .. } => OperationKind::Reencrypt,
            Self::Sign { .. } => OperationKind::Sign,
            Self::Verify { .. } => OperationKind::Verify,
            Self::Pubkey { .. } => OperationKind::Pubkey,
        }
    }
}

fn key_name(fields: &Fields<'_>) -> Result<String> {
    let key = fields.required_string(KEY)?;
    validate_key_name(&key)?;
    Ok(key)
}

fn aad(fields: &Fields<'_>) -> Result<Vec<u8>> {
    Ok(fields.string(AAD)?.unwrap_or_default().into_bytes())
}

fn required_version(fields: &Fields<'_>) -> Result<u64> {
    match fields.version(KEY_VERSION)? {
        0 => Err(KmsError::MissingFields(vec![KEY_VERSION.to_string()])),
        v => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_names_roundtrip() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.name().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("keys/explode".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_unknown_field_rejected_for_every_kind() {
        for kind in OperationKind::ALL {
            let err = Operation::parse(kind, &map(json!({"literally-never-a-key": true})))
                .unwrap_err();
            assert!(
                matches!(err, KmsError::UnknownFields(_)),
                "{} accepted an unknown field",
                kind
            );
        }
    }

    #[test]
    fn test_unknown_fields_sorted() {
        let err = Operation::parse(
            OperationKind::Encrypt,
            &map(json!({"key": "k", "plaintext": "x", "zeta": 1, "alpha": 2})),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown fields: alpha,zeta");
    }

    #[test]
    fn test_encrypt_fields() {
        let op = Operation::parse(
            OperationKind::Encrypt,
            &map(json!({"key": "my-key", "plaintext": "hello", "key_version": "2"})),
        )
        .unwrap();
        assert_eq!(
            op,
            Operation::Encrypt {
                key: "my-key".to_string(),
                plaintext: b"hello".to_vec(),
                aad: Vec::new(),
                key_version: 2,
            }
        );
    }

    #[test]
    fn test_key_is_required_and_validated() {
        let err = Operation::parse(OperationKind::KeysRotate, &FieldMap::new()).unwrap_err();
        assert!(matches!(err, KmsError::MissingFields(_)));

        let err = Operation::parse(OperationKind::KeysRotate, &map(json!({"key": "a/b"})))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_sign_requires_version() {
        let err = Operation::parse(
            OperationKind::Sign,
            &map(json!({"key": "k", "digest": "ZGlnZXN0"})),
        )
        .unwrap_err();
        assert!(matches!(err, KmsError::MissingFields(f) if f == vec!["key_version"]));
    }

    #[test]
    fn test_ciphertext_decoded_later() {
        // Not base64, but parsing must still succeed so the version window
        // gets checked first
        let op = Operation::parse(
            OperationKind::Reencrypt,
            &map(json!({"key": "k", "ciphertext": "hello world", "key_version": 7})),
        )
        .unwrap();
        assert_eq!(op.kind(), OperationKind::Reencrypt);
    }

    #[test]
    fn test_keys_write_fields() {
        let op = Operation::parse(
            OperationKind::KeysWrite,
            &map(json!({
                "key": "my-key",
                "key_ring": "projects/p/locations/global/keyRings/r",
                "purpose": "asymmetric_sign",
                "algorithm": "ec_sign_p256_sha256",
                "protection_level": "hsm",
                "labels": "env=prod",
            })),
        )
        .unwrap();

        let Operation::KeysWrite(write) = op else {
            panic!("expected keys/write");
        };
        assert_eq!(write.purpose, Some(Purpose::AsymmetricSign));
        assert_eq!(write.algorithm, Some(Algorithm::EcSignP256Sha256));
        assert_eq!(write.protection_level, Some(ProtectionLevel::Hsm));
        assert_eq!(write.crypto_key, None);
        assert_eq!(write.labels.unwrap().get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_trim_keep_must_be_positive() {
        let err = Operation::parse(OperationKind::KeysTrim, &map(json!({"key": "k", "keep": 0})))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_config_write_scopes() {
        let op = Operation::parse(
            OperationKind::ConfigWrite,
            &map(json!({"scopes": "foo,bar"})),
        )
        .unwrap();
        assert_eq!(
            op,
            Operation::ConfigWrite(ConfigUpdate {
                scopes: Some(vec!["foo".to_string(), "bar".to_string()]),
                ..Default::default()
            })
        );
    }
}
