//! Google Cloud KMS integration tests.
//!
//! These tests need a real project with an existing key ring and
//! Application Default Credentials allowed to manage keys in it.
//!
//! Run with:
//!   export GOOGLE_CLOUD_PROJECT=my-project
//!   export GCPKMS_TEST_KEY_RING=projects/my-project/locations/global/keyRings/test
//!   cargo test --test integration_gcp --features gcp -- --ignored
//!
//! Every test creates a uniquely named crypto key and destroys its versions
//! at the end. Crypto keys themselves cannot be deleted from Cloud KMS.

#![cfg(feature = "gcp")]

use gcpkms::backends::gcp::GcpClientFactory;
use gcpkms::{Backend, FieldMap, InMemoryStorage, Response};
use serde_json::{json, Value};
use std::sync::Arc;

fn key_ring() -> String {
    std::env::var("GCPKMS_TEST_KEY_RING").unwrap_or_else(|_| {
        let project = std::env::var("GOOGLE_CLOUD_PROJECT").expect("GOOGLE_CLOUD_PROJECT not set");
        format!("projects/{}/locations/global/keyRings/gcpkms-test", project)
    })
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp_millis())
}

async fn call(
    backend: &Backend,
    storage: &InMemoryStorage,
    operation: &str,
    fields: Value,
) -> gcpkms::Result<Response> {
    let fields: FieldMap = fields.as_object().cloned().unwrap_or_default();
    backend.handle(operation, storage, fields).await
}

#[tokio::test]
#[ignore] // Run only against a real project
async fn test_gcp_encrypt_rotate_trim() {
    let backend = Backend::new(Arc::new(GcpClientFactory::new()));
    let storage = InMemoryStorage::new();
    let name = unique("gcpkms-it");

    call(&backend, &storage, "keys/write", json!({"key": name, "key_ring": key_ring()}))
        .await
        .expect("Failed to create key");

    let resp = call(&backend, &storage, "encrypt", json!({"key": name, "plaintext": "hello world"}))
        .await
        .expect("Failed to encrypt");
    let ciphertext = resp["ciphertext"].clone();

    let resp = call(&backend, &storage, "keys/rotate", json!({"key": name}))
        .await
        .expect("Failed to rotate");
    assert_eq!(resp["key_version"], "2");

    let resp = call(&backend, &storage, "decrypt", json!({"key": name, "ciphertext": ciphertext}))
        .await
        .expect("Failed to decrypt");
    assert_eq!(resp["plaintext"], "hello world");

    let resp = call(&backend, &storage, "keys/trim", json!({"key": name, "keep": 1}))
        .await
        .expect("Failed to trim");
    assert_eq!(resp["destroyed"], json!([1]));

    call(&backend, &storage, "keys/delete", json!({"key": name}))
        .await
        .expect("Failed to delete");
}

#[tokio::test]
#[ignore] // Run only against a real project
async fn test_gcp_sign_verify() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let backend = Backend::new(Arc::new(GcpClientFactory::new()));
    let storage = InMemoryStorage::new();
    let name = unique("gcpkms-it-sign");

    call(
        &backend,
        &storage,
        "keys/write",
        json!({
            "key": name,
            "key_ring": key_ring(),
            "purpose": "asymmetric_sign",
            "algorithm": "ec_sign_p256_sha256",
        }),
    )
    .await
    .expect("Failed to create key");

    // Asymmetric versions are generated asynchronously
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    let digest = STANDARD.encode([42u8; 32]);
    let resp = call(
        &backend,
        &storage,
        "sign",
        json!({"key": name, "digest": digest, "key_version": 1}),
    )
    .await
    .expect("Failed to sign");

    let resp = call(
        &backend,
        &storage,
        "verify",
        json!({"key": name, "digest": digest, "signature": resp["signature"], "key_version": 1}),
    )
    .await
    .expect("Failed to verify");
    assert_eq!(resp["valid"], true);

    call(&backend, &storage, "keys/delete", json!({"key": name}))
        .await
        .expect("Failed to delete");
}

#[tokio::test]
#[ignore] // Run only against a real project
async fn test_gcp_missing_key_ring() {
    let backend = Backend::new(Arc::new(GcpClientFactory::new()));
    let storage = InMemoryStorage::new();

    let err = call(
        &backend,
        &storage,
        "keys/write",
        json!({"key": "k", "key_ring": format!("{}-does-not-exist", key_ring())}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status_code(), 404);
}
