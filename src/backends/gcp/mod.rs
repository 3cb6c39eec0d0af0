//! Google Cloud KMS client.
//!
//! Talks to the Cloud KMS REST API through the generated `google-cloudkms1`
//! client.
//!
//! # Authentication
//!
//! Explicit service-account JSON from [`Config::credentials`] is used when
//! set. Otherwise Application Default Credentials apply:
//! - Service account key file (GOOGLE_APPLICATION_CREDENTIALS)
//! - gcloud auth application-default login
//! - GCE/GKE metadata server (when running in Google Cloud)
//!
//! Every request carries the configured scopes.
//!
//! # Example
//!
//! ```no_run
//! use gcpkms::backends::gcp::GcpClientFactory;
//! use gcpkms::{Backend, BackendOptions};
//! use std::sync::Arc;
//!
//! let backend = Backend::with_options(
//!     Arc::new(GcpClientFactory::new()),
//!     BackendOptions::from_env(),
//! );
//! ```

mod client;
mod verify;

pub use client::GcpKms;

use crate::kms::{ClientFactory, KeyManagementService};
use crate::{Config, KmsError, Result};
use async_trait::async_trait;
use google_cloudkms1::{hyper, hyper_rustls, oauth2, CloudKMS};
use std::sync::Arc;
use tracing::debug;

type Connector = hyper_rustls::HttpsConnector<hyper::client::HttpConnector>;
type Hub = CloudKMS<Connector>;

/// Builds [`GcpKms`] handles.
#[derive(Debug, Default, Clone)]
pub struct GcpClientFactory;

impl GcpClientFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for GcpClientFactory {
    async fn connect(&self, config: &Config) -> Result<Arc<dyn KeyManagementService>> {
        let client = hyper::Client::builder().build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_or_http()
                .enable_http1()
                .build(),
        );

        let auth = if !config.credentials.is_empty() {
            debug!("using explicit service account credentials");
            let key = oauth2::parse_service_account_key(&config.credentials)
                .map_err(|e| KmsError::Credentials(format!("failed to parse credentials: {}", e)))?;
            oauth2::ServiceAccountAuthenticator::builder(key)
                .build()
                .await
                .map_err(|e| KmsError::Credentials(format!("failed to build authenticator: {}", e)))?
        } else {
            debug!("using application default credentials");
            let opts = oauth2::ApplicationDefaultCredentialsFlowOpts::default();
            match oauth2::ApplicationDefaultCredentialsAuthenticator::builder(opts).await {
                oauth2::authenticator::ApplicationDefaultCredentialsTypes::InstanceMetadata(auth) => {
                    auth.build().await
                }
                oauth2::authenticator::ApplicationDefaultCredentialsTypes::ServiceAccount(auth) => {
                    auth.build().await
                }
            }
            .map_err(|e| {
                KmsError::Credentials(format!("failed to find default credentials: {}", e))
            })?
        };

        Ok(Arc::new(GcpKms::new(
            CloudKMS::new(client, auth),
            config.scopes.clone(),
        )))
    }
}
