//! Local signature verification against a version's public key.

use crate::error::{RemoteCode, RemoteError};
use crate::kms::{Algorithm, PublicKey, RemoteResult};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::Sha256;

fn invalid_key(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(
        RemoteCode::InvalidArgument,
        format!("failed to parse public key: {}", err),
    )
}

/// Checks `signature` over `digest`. A malformed signature is a mismatch,
/// not an error.
pub(super) fn verify_signature(
    public_key: &PublicKey,
    digest: &[u8],
    signature: &[u8],
) -> RemoteResult<bool> {
    match public_key.algorithm {
        Algorithm::RsaSignPss2048Sha256
        | Algorithm::RsaSignPss3072Sha256
        | Algorithm::RsaSignPss4096Sha256 => {
            let key = RsaPublicKey::from_public_key_pem(&public_key.pem).map_err(invalid_key)?;
            Ok(key.verify(Pss::new::<Sha256>(), digest, signature).is_ok())
        }
        Algorithm::RsaSignPkcs12048Sha256
        | Algorithm::RsaSignPkcs13072Sha256
        | Algorithm::RsaSignPkcs14096Sha256 => {
            let key = RsaPublicKey::from_public_key_pem(&public_key.pem).map_err(invalid_key)?;
            Ok(key
                .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
                .is_ok())
        }
        Algorithm::EcSignP256Sha256 => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_pem(&public_key.pem)
                .map_err(invalid_key)?;
            Ok(match p256::ecdsa::Signature::from_der(signature) {
                Ok(sig) => key.verify_prehash(digest, &sig).is_ok(),
                Err(_) => false,
            })
        }
        Algorithm::EcSignP384Sha384 => {
            let key = p384::ecdsa::VerifyingKey::from_public_key_pem(&public_key.pem)
                .map_err(invalid_key)?;
            Ok(match p384::ecdsa::Signature::from_der(signature) {
                Ok(sig) => key.verify_prehash(digest, &sig).is_ok(),
                Err(_) => false,
            })
        }
        other => Err(RemoteError::new(
            RemoteCode::FailedPrecondition,
            format!("{} keys cannot verify signatures", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::pkcs8::{EncodePublicKey, LineEnding};
    use sha2::Digest;

    fn p256_fixture() -> (p256::ecdsa::SigningKey, PublicKey) {
        let signing = p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap();
        let pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (
            signing,
            PublicKey {
                pem,
                algorithm: Algorithm::EcSignP256Sha256,
            },
        )
    }

    #[test]
    fn test_p256_roundtrip() {
        let (signing, public_key) = p256_fixture();
        let digest = Sha256::digest(b"hello world");

        let sig: p256::ecdsa::Signature = signing.sign_prehash(&digest).unwrap();
        let der = sig.to_der();

        assert!(verify_signature(&public_key, &digest, der.as_bytes()).unwrap());

        let other = Sha256::digest(b"goodbye");
        assert!(!verify_signature(&public_key, &other, der.as_bytes()).unwrap());
    }

    #[test]
    fn test_garbage_signature_is_mismatch() {
        let (_, public_key) = p256_fixture();
        let digest = Sha256::digest(b"hello world");

        assert!(!verify_signature(&public_key, &digest, b"not a signature").unwrap());
    }

    #[test]
    fn test_symmetric_key_cannot_verify() {
        let public_key = PublicKey {
            pem: String::new(),
            algorithm: Algorithm::SymmetricEncryption,
        };
        let err = verify_signature(&public_key, &[0u8; 32], b"sig").unwrap_err();
        assert_eq!(err.code, RemoteCode::FailedPrecondition);
    }

    #[test]
    fn test_bad_pem() {
        let public_key = PublicKey {
            pem: "-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----\n".to_string(),
            algorithm: Algorithm::EcSignP384Sha384,
        };
        let err = verify_signature(&public_key, &[0u8; 48], b"sig").unwrap_err();
        assert_eq!(err.code, RemoteCode::InvalidArgument);
    }
}
