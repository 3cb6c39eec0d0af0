//! gcpkms - a secrets engine backed by Google Cloud KMS.
//!
//! The engine maps local key aliases onto remote crypto keys and exposes a
//! small set of named operations (`keys/rotate`, `encrypt`, `sign`, ...)
//! to a host dispatcher. Keys never leave the remote service: the engine
//! only brokers calls, enforces a per-alias version window and manages the
//! lifecycle of key versions.
//!
//! # Features
//!
//! - **Key registry**: aliases persisted in pluggable [`Storage`]
//! - **Client cache**: one authenticated handle shared by all requests and
//!   rebuilt after a configurable lifetime
//! - **Version window**: optional min/max bounds on the versions a caller
//!   may name
//! - **Rotation and trim**: new primary versions and bounded-concurrency
//!   destruction of old ones
//! - **Strict input**: unknown fields are rejected before any work happens
//!
//! # Quick Start
//!
//! ```no_run
//! use gcpkms::{Backend, BackendOptions, FileStorage};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gcpkms::Result<()> {
//!     # #[cfg(feature = "gcp")]
//!     # {
//!     let factory = Arc::new(gcpkms::backends::gcp::GcpClientFactory::new());
//!     let backend = Backend::with_options(factory, BackendOptions::from_env());
//!     let storage = FileStorage::new("/var/lib/gcpkms").await?;
//!
//!     let fields = json!({
//!         "key": "payments",
//!         "crypto_key": "projects/p/locations/global/keyRings/r/cryptoKeys/payments",
//!     });
//!     backend
//!         .handle("keys/register", &storage, fields.as_object().cloned().unwrap_or_default())
//!         .await?;
//!
//!     let fields = json!({"key": "payments", "plaintext": "4111-1111"});
//!     let resp = backend
//!         .handle("encrypt", &storage, fields.as_object().cloned().unwrap_or_default())
//!         .await?;
//!     println!("{}", resp["ciphertext"]);
//!     # }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! | Feature | Default | Provides |
//! |---------|---------|----------|
//! | `mock` | yes | In-memory KMS for tests and local runs |
//! | `gcp` | no | Google Cloud KMS client |
//! | `full` | no | Both |

pub mod backend;
pub mod backends;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod kms;
pub mod lifecycle;
pub mod operation;
pub mod storage;
pub mod validation;

pub use backend::{Backend, Response};
pub use client::{ClientCache, ClientGuard};
pub use config::{BackendOptions, Config};
pub use error::{KmsError, RemoteCode, RemoteError, Result, TrimFailure};
pub use key::{Key, KeyRegistry};
pub use kms::{ClientFactory, KeyManagementService};
pub use lifecycle::{cancellation, CancelHandle, CancelToken, TrimReport};
pub use operation::{Operation, OperationKind};
pub use storage::{FileStorage, InMemoryStorage, Storage};
pub use validation::FieldMap;

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backends::mock::MockClientFactory;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_and_encrypt_roundtrip() {
        let factory = Arc::new(MockClientFactory::new());
        let kms = factory.kms();
        kms.add_key_ring("projects/p/locations/global/keyRings/r");
        let crypto_key = kms.seed_crypto_key(
            "projects/p/locations/global/keyRings/r",
            "k",
            kms::Algorithm::SymmetricEncryption,
            1,
        );

        let backend = Backend::new(factory);
        let storage = InMemoryStorage::new();

        let fields = json!({"key": "k", "crypto_key": crypto_key});
        backend
            .handle("keys/register", &storage, fields.as_object().unwrap().clone())
            .await
            .unwrap();

        let fields = json!({"key": "k", "plaintext": "hello world"});
        let resp = backend
            .handle("encrypt", &storage, fields.as_object().unwrap().clone())
            .await
            .unwrap();

        let fields = json!({"key": "k", "ciphertext": resp["ciphertext"]});
        let resp = backend
            .handle("decrypt", &storage, fields.as_object().unwrap().clone())
            .await
            .unwrap();
        assert_eq!(resp["plaintext"], "hello world");
    }
}
