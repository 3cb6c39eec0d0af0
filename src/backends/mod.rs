//! KMS client implementations.

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "gcp")]
pub mod gcp;
