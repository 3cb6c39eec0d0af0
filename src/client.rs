//! Time-bounded cache for the authenticated KMS client handle.
//!
//! Building a handle means loading configuration, resolving credentials and
//! setting up a connection, which is too slow to repeat on every request.
//! [`ClientCache`] keeps one handle for a fixed lifetime and hands it out to
//! any number of concurrent callers.
//!
//! # Locking
//!
//! A caller holds a shared lock for as long as it keeps the returned
//! [`ClientGuard`]. Replacing or closing the handle needs the exclusive
//! lock, so a handle is never closed while someone is using it. Exactly one
//! caller constructs a new handle; others wait and then reuse it.

use crate::kms::{ClientFactory, KeyManagementService};
use crate::storage::Storage;
use crate::{Config, KmsError, Result};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of a cached handle.
///
/// Shorter than upstream OAuth token lifetimes (60 minutes) so a handle is
/// never used with an expired token.
pub const DEFAULT_CLIENT_LIFETIME: Duration = Duration::from_secs(30 * 60);

struct CachedClient {
    handle: Arc<dyn KeyManagementService>,
    created_at: Instant,
}

/// Process-wide cache of one client handle.
///
/// # Example
///
/// ```no_run
/// use gcpkms::{ClientCache, InMemoryStorage};
/// use gcpkms::backends::mock::MockClientFactory;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> gcpkms::Result<()> {
///     let cache = ClientCache::new(Arc::new(MockClientFactory::new()));
///     let storage = InMemoryStorage::new();
///
///     let client = cache.acquire(&storage).await?;
///     let key = client.get_crypto_key("projects/p/locations/global/keyRings/r/cryptoKeys/k").await;
///     drop(client);
///
///     // After a configuration change
///     cache.reset().await;
///     # let _ = key;
///     Ok(())
/// }
/// ```
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    lifetime: Duration,
    slot: Arc<RwLock<Option<CachedClient>>>,
}

impl ClientCache {
    /// Creates an empty cache with [`DEFAULT_CLIENT_LIFETIME`].
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_lifetime(factory, DEFAULT_CLIENT_LIFETIME)
    }

    /// Creates an empty cache with a custom handle lifetime.
    pub fn with_lifetime(factory: Arc<dyn ClientFactory>, lifetime: Duration) -> Self {
        Self {
            factory,
            lifetime,
            slot: Arc::new(RwLock::new(None)),
        }
    }

    fn is_fresh(&self, cached: &CachedClient) -> bool {
        cached.created_at.elapsed() < self.lifetime
    }

    /// Returns the cached handle, constructing a new one if none is live.
    ///
    /// The handle stays valid until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Fails if configuration cannot be loaded from `storage` or the factory
    /// cannot build a handle. Nothing is cached in that case.
    pub async fn acquire(&self, storage: &dyn Storage) -> Result<ClientGuard> {
        let read = self.slot.clone().read_owned().await;
        match OwnedRwLockReadGuard::try_map(read, |slot| {
            slot.as_ref().filter(|cached| self.is_fresh(cached))
        }) {
            Ok(guard) => return Ok(ClientGuard { guard }),
            Err(read) => drop(read),
        }

        // Granted only once every reader has released its guard, so nobody
        // is mid-call on the handle we are about to close.
        let mut write = self.slot.clone().write_owned().await;

        // Another caller may have rebuilt the handle while we waited.
        let fresh = write.as_ref().is_some_and(|cached| self.is_fresh(cached));
        if !fresh {
            if let Some(stale) = write.take() {
                debug!("closing expired KMS client");
                stale.handle.close().await;
            }

            debug!("creating new KMS client");
            let config = Config::load(storage).await?;
            let handle = self.factory.connect(&config).await?;

            *write = Some(CachedClient {
                handle,
                created_at: Instant::now(),
            });
        }

        let read = write.downgrade();
        let guard = OwnedRwLockReadGuard::try_map(read, |slot| slot.as_ref()).map_err(|_| {
            KmsError::Other(anyhow::anyhow!("client cache emptied while downgrading"))
        })?;

        Ok(ClientGuard { guard })
    }

    /// Closes and drops the cached handle.
    ///
    /// Waits for in-flight users to release their guards. The next
    /// [`acquire`](Self::acquire) builds a fresh handle from the current
    /// configuration.
    pub async fn reset(&self) {
        let mut slot = self.slot.write().await;
        if let Some(cached) = slot.take() {
            debug!("resetting KMS client");
            cached.handle.close().await;
        }
    }

    /// Returns true if a handle is cached, live or expired.
    pub async fn is_cached(&self) -> bool {
        self.slot.read().await.is_some()
    }
}

/// Shared access to the cached handle.
///
/// Dropping the guard releases the shared lock.
pub struct ClientGuard {
    guard: OwnedRwLockReadGuard<Option<CachedClient>, CachedClient>,
}

impl ClientGuard {
    /// A clone of the handle, for handing to spawned tasks.
    ///
    /// Keep the guard alive until those tasks finish.
    pub fn handle(&self) -> Arc<dyn KeyManagementService> {
        self.guard.handle.clone()
    }
}

impl Deref for ClientGuard {
    type Target = dyn KeyManagementService;

    fn deref(&self) -> &Self::Target {
        &*self.guard.handle
    }
}
