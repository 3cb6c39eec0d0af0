//! Cloud KMS handle.

use super::verify::verify_signature;
use super::Hub;
use crate::error::{RemoteCode, RemoteError};
use crate::kms::{
    self, Algorithm, CryptoKeySpec, CryptoKeyUpdate, EncryptOutput, KeyManagementService,
    ProtectionLevel, Purpose, RemoteResult, VersionPage, VersionState,
};
use async_trait::async_trait;
use google_cloudkms1::api;
use google_cloudkms1::FieldMask;
use tracing::debug;

/// Authenticated Cloud KMS handle.
pub struct GcpKms {
    hub: Hub,
    scopes: Vec<String>,
}

impl GcpKms {
    pub(super) fn new(hub: Hub, scopes: Vec<String>) -> Self {
        Self { hub, scopes }
    }
}

/// Maps a client error onto the remote error taxonomy.
///
/// Non-2xx responses with a JSON body carry a canonical status string;
/// transport failures count as unavailable.
fn remote_error(err: google_cloudkms1::Error) -> RemoteError {
    use google_cloudkms1::Error;

    match err {
        Error::BadRequest(body) => {
            let status = body["error"]["status"].as_str().unwrap_or_default();
            let message = body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            RemoteError::new(code_from_status(status), message)
        }
        Error::Failure(response) => {
            let status = response.status();
            RemoteError::new(code_from_http(status.as_u16()), format!("HTTP {}", status))
        }
        Error::HttpError(e) => RemoteError::new(RemoteCode::Unavailable, e.to_string()),
        Error::Io(e) => RemoteError::new(RemoteCode::Unavailable, e.to_string()),
        Error::MissingToken(e) => RemoteError::new(RemoteCode::PermissionDenied, e.to_string()),
        other => RemoteError::new(RemoteCode::Unknown, other.to_string()),
    }
}

fn code_from_status(status: &str) -> RemoteCode {
    match status {
        "NOT_FOUND" => RemoteCode::NotFound,
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => RemoteCode::PermissionDenied,
        "INVALID_ARGUMENT" | "OUT_OF_RANGE" => RemoteCode::InvalidArgument,
        "ALREADY_EXISTS" => RemoteCode::AlreadyExists,
        "FAILED_PRECONDITION" => RemoteCode::FailedPrecondition,
        "UNAVAILABLE" => RemoteCode::Unavailable,
        "DEADLINE_EXCEEDED" => RemoteCode::DeadlineExceeded,
        "RESOURCE_EXHAUSTED" => RemoteCode::ResourceExhausted,
        _ => RemoteCode::Unknown,
    }
}

fn code_from_http(status: u16) -> RemoteCode {
    match status {
        400 => RemoteCode::InvalidArgument,
        401 | 403 => RemoteCode::PermissionDenied,
        404 => RemoteCode::NotFound,
        409 => RemoteCode::AlreadyExists,
        429 => RemoteCode::ResourceExhausted,
        503 => RemoteCode::Unavailable,
        504 => RemoteCode::DeadlineExceeded,
        _ => RemoteCode::Unknown,
    }
}

fn missing(field: &str) -> RemoteError {
    RemoteError::new(
        RemoteCode::Unknown,
        format!("response is missing {}", field),
    )
}

fn to_version(version: api::CryptoKeyVersion) -> RemoteResult<kms::CryptoKeyVersion> {
    Ok(kms::CryptoKeyVersion {
        name: version.name.ok_or_else(|| missing("crypto key version name"))?,
        state: version
            .state
            .as_deref()
            .and_then(VersionState::from_remote)
            .unwrap_or(VersionState::Unspecified),
        create_time: version.create_time,
        algorithm: version.algorithm.as_deref().and_then(Algorithm::from_remote),
    })
}

fn to_crypto_key(key: api::CryptoKey) -> RemoteResult<kms::CryptoKey> {
    let purpose = key
        .purpose
        .as_deref()
        .and_then(Purpose::from_remote)
        .ok_or_else(|| missing("crypto key purpose"))?;
    let template = key.version_template.unwrap_or_default();

    Ok(kms::CryptoKey {
        name: key.name.ok_or_else(|| missing("crypto key name"))?,
        purpose,
        primary: key.primary.map(to_version).transpose()?,
        algorithm: template.algorithm.as_deref().and_then(Algorithm::from_remote),
        protection_level: template
            .protection_level
            .as_deref()
            .and_then(ProtectionLevel::from_remote),
        rotation_period: key.rotation_period.and_then(|d| d.to_std().ok()),
        next_rotation_time: key.next_rotation_time,
        labels: key.labels.unwrap_or_default().into_iter().collect(),
        create_time: key.create_time,
    })
}

fn to_duration(period: std::time::Duration) -> RemoteResult<chrono::Duration> {
    chrono::Duration::from_std(period)
        .map_err(|e| RemoteError::new(RemoteCode::InvalidArgument, e.to_string()))
}

/// Picks the digest field by length.
fn digest(bytes: &[u8]) -> RemoteResult<api::Digest> {
    let value = Some(bytes.to_vec());
    match bytes.len() {
        32 => Ok(api::Digest {
            sha256: value,
            ..Default::default()
        }),
        48 => Ok(api::Digest {
            sha384: value,
            ..Default::default()
        }),
        64 => Ok(api::Digest {
            sha512: value,
            ..Default::default()
        }),
        n => Err(RemoteError::new(
            RemoteCode::InvalidArgument,
            format!("digest of {} bytes is not a SHA-256, SHA-384 or SHA-512 hash", n),
        )),
    }
}

#[async_trait]
impl KeyManagementService for GcpKms {
    async fn get_key_ring(&self, name: &str) -> RemoteResult<kms::KeyRing> {
        debug!(key_ring = %name, "get key ring");
        let (_, ring) = self
            .hub
            .projects()
            .locations_key_rings_get(name)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        Ok(kms::KeyRing {
            name: ring.name.unwrap_or_else(|| name.to_string()),
        })
    }

    async fn create_crypto_key(
        &self,
        key_ring: &str,
        crypto_key_id: &str,
        spec: &CryptoKeySpec,
    ) -> RemoteResult<kms::CryptoKey> {
        debug!(key_ring = %key_ring, crypto_key = %crypto_key_id, "create crypto key");
        let request = api::CryptoKey {
            purpose: Some(spec.purpose.as_remote().to_string()),
            version_template: Some(api::CryptoKeyVersionTemplate {
                algorithm: Some(spec.algorithm.as_remote().to_string()),
                protection_level: Some(spec.protection_level.as_remote().to_string()),
                ..Default::default()
            }),
            rotation_period: spec.rotation_period.map(to_duration).transpose()?,
            next_rotation_time: spec
                .rotation_period
                .map(to_duration)
                .transpose()?
                .map(|period| chrono::Utc::now() + period),
            labels: Some(spec.labels.clone().into_iter().collect()),
            ..Default::default()
        };

        let (_, key) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_create(request, key_ring)
            .crypto_key_id(crypto_key_id)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_crypto_key(key)
    }

    async fn get_crypto_key(&self, name: &str) -> RemoteResult<kms::CryptoKey> {
        debug!(crypto_key = %name, "get crypto key");
        let (_, key) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_get(name)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_crypto_key(key)
    }

    async fn update_crypto_key(
        &self,
        name: &str,
        update: &CryptoKeyUpdate,
    ) -> RemoteResult<kms::CryptoKey> {
        debug!(crypto_key = %name, "update crypto key");
        let mut paths = Vec::new();
        let mut request = api::CryptoKey::default();

        if let Some(period) = update.rotation_period {
            let period = to_duration(period)?;
            request.rotation_period = Some(period);
            request.next_rotation_time = Some(chrono::Utc::now() + period);
            paths.push("rotation_period");
            paths.push("next_rotation_time");
        }
        if let Some(labels) = &update.labels {
            request.labels = Some(labels.clone().into_iter().collect());
            paths.push("labels");
        }

        let mask: FieldMask = paths
            .join(",")
            .parse()
            .map_err(|_| RemoteError::new(RemoteCode::InvalidArgument, "invalid update mask"))?;

        let (_, key) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_patch(request, name)
            .update_mask(mask)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_crypto_key(key)
    }

    async fn create_crypto_key_version(
        &self,
        crypto_key: &str,
    ) -> RemoteResult<kms::CryptoKeyVersion> {
        debug!(crypto_key = %crypto_key, "create crypto key version");
        let (_, version) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_create(
                api::CryptoKeyVersion::default(),
                crypto_key,
            )
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_version(version)
    }

    async fn update_primary_version(
        &self,
        crypto_key: &str,
        version_id: &str,
    ) -> RemoteResult<kms::CryptoKey> {
        debug!(crypto_key = %crypto_key, version = %version_id, "update primary version");
        let request = api::UpdateCryptoKeyPrimaryVersionRequest {
            crypto_key_version_id: Some(version_id.to_string()),
            ..Default::default()
        };

        let (_, key) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_update_primary_version(request, crypto_key)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_crypto_key(key)
    }

    async fn list_crypto_key_versions(
        &self,
        crypto_key: &str,
        page_token: Option<&str>,
    ) -> RemoteResult<VersionPage> {
        debug!(crypto_key = %crypto_key, "list crypto key versions");
        let mut request = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_list(crypto_key);
        if let Some(token) = page_token {
            request = request.page_token(token);
        }

        let (_, response) = request
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        Ok(VersionPage {
            versions: response
                .crypto_key_versions
                .unwrap_or_default()
                .into_iter()
                .map(to_version)
                .collect::<RemoteResult<_>>()?,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_crypto_key_version(&self, name: &str) -> RemoteResult<kms::CryptoKeyVersion> {
        debug!(version = %name, "get crypto key version");
        let (_, version) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_get(name)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_version(version)
    }

    async fn destroy_crypto_key_version(&self, name: &str) -> RemoteResult<kms::CryptoKeyVersion> {
        debug!(version = %name, "destroy crypto key version");
        let (_, version) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_destroy(
                api::DestroyCryptoKeyVersionRequest::default(),
                name,
            )
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        to_version(version)
    }

    async fn encrypt(&self, name: &str, plaintext: &[u8], aad: &[u8]) -> RemoteResult<EncryptOutput> {
        let request = api::EncryptRequest {
            plaintext: Some(plaintext.to_vec()),
            additional_authenticated_data: (!aad.is_empty()).then(|| aad.to_vec()),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_encrypt(request, name)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        Ok(EncryptOutput {
            ciphertext: response.ciphertext.ok_or_else(|| missing("ciphertext"))?,
            version_name: response.name.ok_or_else(|| missing("crypto key version name"))?,
        })
    }

    async fn decrypt(&self, crypto_key: &str, ciphertext: &[u8], aad: &[u8]) -> RemoteResult<Vec<u8>> {
        let request = api::DecryptRequest {
            ciphertext: Some(ciphertext.to_vec()),
            additional_authenticated_data: (!aad.is_empty()).then(|| aad.to_vec()),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_decrypt(request, crypto_key)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        // Empty plaintexts are omitted from the response body
        Ok(response.plaintext.unwrap_or_default())
    }

    async fn asymmetric_decrypt(&self, version: &str, ciphertext: &[u8]) -> RemoteResult<Vec<u8>> {
        let request = api::AsymmetricDecryptRequest {
            ciphertext: Some(ciphertext.to_vec()),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_asymmetric_decrypt(
                request, version,
            )
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        Ok(response.plaintext.unwrap_or_default())
    }

    async fn asymmetric_sign(&self, version: &str, digest_bytes: &[u8]) -> RemoteResult<Vec<u8>> {
        let request = api::AsymmetricSignRequest {
            digest: Some(digest(digest_bytes)?),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_asymmetric_sign(request, version)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        response.signature.ok_or_else(|| missing("signature"))
    }

    async fn verify(&self, version: &str, digest: &[u8], signature: &[u8]) -> RemoteResult<bool> {
        let public_key = self.get_public_key(version).await?;
        verify_signature(&public_key, digest, signature)
    }

    async fn get_public_key(&self, version: &str) -> RemoteResult<kms::PublicKey> {
        debug!(version = %version, "get public key");
        let (_, key) = self
            .hub
            .projects()
            .locations_key_rings_crypto_keys_crypto_key_versions_get_public_key(version)
            .add_scopes(&self.scopes)
            .doit()
            .await
            .map_err(remote_error)?;

        Ok(kms::PublicKey {
            pem: key.pem.ok_or_else(|| missing("public key"))?,
            algorithm: key
                .algorithm
                .as_deref()
                .and_then(Algorithm::from_remote)
                .ok_or_else(|| missing("public key algorithm"))?,
        })
    }

    async fn close(&self) {
        debug!("closing Cloud KMS client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bad_request_uses_canonical_status() {
        let err = remote_error(google_cloudkms1::Error::BadRequest(json!({
            "error": {
                "code": 404,
                "message": "CryptoKey projects/p/locations/l/keyRings/r/cryptoKeys/k not found.",
                "status": "NOT_FOUND",
            }
        })));

        assert_eq!(err.code, RemoteCode::NotFound);
        assert!(err.message.contains("cryptoKeys/k"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(code_from_status("FAILED_PRECONDITION"), RemoteCode::FailedPrecondition);
        assert_eq!(code_from_status("UNAVAILABLE"), RemoteCode::Unavailable);
        assert_eq!(code_from_status("UNAUTHENTICATED"), RemoteCode::PermissionDenied);
        assert_eq!(code_from_status("SOMETHING_NEW"), RemoteCode::Unknown);

        assert_eq!(code_from_http(429), RemoteCode::ResourceExhausted);
        assert_eq!(code_from_http(500), RemoteCode::Unknown);
    }

    #[test]
    fn test_digest_by_length() {
        assert!(digest(&[0u8; 32]).unwrap().sha256.is_some());
        assert!(digest(&[0u8; 48]).unwrap().sha384.is_some());
        assert!(digest(&[0u8; 64]).unwrap().sha512.is_some());

        let err = digest(b"hello world").unwrap_err();
        assert_eq!(err.code, RemoteCode::InvalidArgument);
    }

    #[test]
    fn test_crypto_key_conversion() {
        let key = api::CryptoKey {
            name: Some("projects/p/locations/l/keyRings/r/cryptoKeys/k".to_string()),
            purpose: Some("ENCRYPT_DECRYPT".to_string()),
            primary: Some(api::CryptoKeyVersion {
                name: Some("projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/3".to_string()),
                state: Some("ENABLED".to_string()),
                ..Default::default()
            }),
            version_template: Some(api::CryptoKeyVersionTemplate {
                algorithm: Some("GOOGLE_SYMMETRIC_ENCRYPTION".to_string()),
                protection_level: Some("HSM".to_string()),
                ..Default::default()
            }),
            rotation_period: Some(chrono::Duration::hours(24)),
            ..Default::default()
        };

        let key = to_crypto_key(key).unwrap();
        assert_eq!(key.purpose, Purpose::EncryptDecrypt);
        assert_eq!(key.primary.as_ref().map(|v| v.version()), Some(3));
        assert_eq!(key.algorithm, Some(Algorithm::SymmetricEncryption));
        assert_eq!(key.protection_level, Some(ProtectionLevel::Hsm));
        assert_eq!(key.rotation_period, Some(std::time::Duration::from_secs(86400)));
        assert!(key.labels.is_empty());
    }

    #[test]
    fn test_unknown_version_state() {
        let version = to_version(api::CryptoKeyVersion {
            name: Some("projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1".to_string()),
            state: Some("GENERATION_FAILED".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(version.state, VersionState::Unspecified);
    }
}
