//! Version lifecycle: rotate, trim and bulk destroy.
//!
//! Destroys run on a fixed pool of workers pulling from one queue, so a key
//! with hundreds of versions never fans out into hundreds of concurrent
//! calls against a rate-limited service. Each destroy is retried with
//! exponential backoff on transient errors only. Failures are collected and
//! reported together once every worker has finished.

use crate::error::{RemoteCode, TrimFailure};
use crate::kms::{CryptoKeyVersion, KeyManagementService, Purpose};
use crate::{BackendOptions, Key, KmsError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Cancellation signal for long-running listing and destroy loops.
///
/// Cancelling stops new work from being issued. Calls already in flight
/// run to completion.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sending half of a [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Creates a linked cancel handle and token.
///
/// ```
/// use gcpkms::lifecycle::cancellation;
///
/// let (handle, token) = cancellation();
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signals every linked token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancellation().1
    }

    /// Returns true once the linked handle has cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Outcome of a successful trim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrimReport {
    /// Versions scheduled for destruction, newest first
    pub destroyed: Vec<u64>,
    /// Live versions kept, newest first
    pub retained: Vec<u64>,
    /// True if the key's version window had live versions before the trim
    /// and has none after it
    pub window_conflict: bool,
}

/// Adds a version to the key and returns its number.
///
/// The new version becomes primary for encrypt/decrypt keys. Asymmetric
/// keys have no primary; the caller addresses versions explicitly.
///
/// # Errors
///
/// Returns [`KmsError::RemoteNotFound`] if the remote key is gone, or
/// [`KmsError::Upstream`] naming the failed step. Nothing is retried.
pub async fn rotate(client: &dyn KeyManagementService, key: &Key) -> Result<u64> {
    let crypto_key = client
        .get_crypto_key(&key.crypto_key_id)
        .await
        .map_err(|e| KmsError::upstream("failed to get crypto key", e))?;

    let version = client
        .create_crypto_key_version(&key.crypto_key_id)
        .await
        .map_err(|e| KmsError::upstream("failed to create new crypto key version", e))?;
    let number = version.version();

    if crypto_key.purpose == Purpose::EncryptDecrypt {
        client
            .update_primary_version(&key.crypto_key_id, &number.to_string())
            .await
            .map_err(|e| KmsError::upstream("failed to update primary crypto key version", e))?;
    }

    info!(key = %key.name, version = number, "rotated crypto key");
    Ok(number)
}

/// Lists every version of a remote key, following pagination to the end.
///
/// A version reported on more than one page is returned once, with the
/// state from the last page it appeared on.
pub async fn list_all_versions(
    client: &dyn KeyManagementService,
    crypto_key: &str,
    cancel: &CancelToken,
) -> Result<Vec<CryptoKeyVersion>> {
    let mut seen: BTreeMap<String, CryptoKeyVersion> = BTreeMap::new();
    let mut page_token: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }

        let page = client
            .list_crypto_key_versions(crypto_key, page_token.as_deref())
            .await
            .map_err(|e| KmsError::upstream("failed to list crypto key versions", e))?;

        for version in page.versions {
            seen.insert(version.name.clone(), version);
        }

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    debug!(crypto_key = %crypto_key, versions = seen.len(), "listed crypto key versions");
    Ok(seen.into_values().collect())
}

/// Versions not yet destroyed or scheduled for destruction, newest first.
fn live_newest_first(versions: Vec<CryptoKeyVersion>) -> Vec<CryptoKeyVersion> {
    let mut live: Vec<_> = versions
        .into_iter()
        .filter(|v| !v.state.is_terminal())
        .collect();
    live.sort_by(|a, b| {
        b.create_time
            .cmp(&a.create_time)
            .then_with(|| b.version().cmp(&a.version()))
    });
    live
}

/// Destroys all but the `keep` newest live versions of the key.
///
/// Retention is by recency alone. If that destroys every live version inside
/// the key's version window, the trim still goes ahead but is logged and
/// reported through [`TrimReport::window_conflict`].
///
/// # Errors
///
/// - [`KmsError::Trim`] if any version could not be destroyed; the others
///   are still attempted
/// - [`KmsError::Cancelled`] if cancelled before every destroy was issued
pub async fn trim(
    client: &Arc<dyn KeyManagementService>,
    key: &Key,
    keep: usize,
    options: &BackendOptions,
    cancel: &CancelToken,
) -> Result<TrimReport> {
    let versions = list_all_versions(client.as_ref(), &key.crypto_key_id, cancel).await?;

    let mut retained = live_newest_first(versions);
    let doomed = if retained.len() > keep {
        retained.split_off(keep)
    } else {
        Vec::new()
    };

    let report = TrimReport {
        destroyed: doomed.iter().map(CryptoKeyVersion::version).collect(),
        retained: retained.iter().map(CryptoKeyVersion::version).collect(),
        window_conflict: doomed.iter().any(|v| key.window_contains(v.version()))
            && !retained.iter().any(|v| key.window_contains(v.version())),
    };

    if report.window_conflict {
        warn!(
            key = %key.name,
            min_version = key.min_version,
            max_version = key.max_version,
            "trim destroys every live version inside the configured window"
        );
    }

    if doomed.is_empty() {
        debug!(key = %key.name, keep, "nothing to trim");
        return Ok(report);
    }

    destroy_versions(client.clone(), doomed, options, cancel).await?;

    info!(
        key = %key.name,
        destroyed = report.destroyed.len(),
        retained = report.retained.len(),
        "trimmed crypto key versions"
    );
    Ok(report)
}

/// Destroys every live version of the key. Returns the destroyed version
/// numbers, newest first.
pub async fn destroy_all(
    client: &Arc<dyn KeyManagementService>,
    key: &Key,
    options: &BackendOptions,
    cancel: &CancelToken,
) -> Result<Vec<u64>> {
    let versions = list_all_versions(client.as_ref(), &key.crypto_key_id, cancel).await?;
    let live = live_newest_first(versions);
    let numbers = live.iter().map(CryptoKeyVersion::version).collect();

    destroy_versions(client.clone(), live, options, cancel).await?;
    Ok(numbers)
}

/// Schedules each version for destruction on a bounded worker pool.
///
/// # Errors
///
/// - [`KmsError::Cancelled`] if any version was never attempted
/// - [`KmsError::Trim`] with every per-version failure otherwise
pub async fn destroy_versions(
    client: Arc<dyn KeyManagementService>,
    versions: Vec<CryptoKeyVersion>,
    options: &BackendOptions,
    cancel: &CancelToken,
) -> Result<()> {
    if versions.is_empty() {
        return Ok(());
    }

    let workers = options.trim_concurrency.clamp(1, versions.len());
    let queue: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(versions.into_iter().map(|v| v.name).collect()));
    let failures: Arc<Mutex<Vec<(String, KmsError)>>> = Arc::new(Mutex::new(Vec::new()));
    let destroyed = Arc::new(AtomicUsize::new(0));
    let retry = Retry {
        attempts: options.destroy_retries.max(1),
        base_delay: options.retry_base_delay,
    };

    let mut tasks = Vec::with_capacity(workers);
    for _ in 0..workers {
        let client = client.clone();
        let queue = queue.clone();
        let failures = failures.clone();
        let destroyed = destroyed.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(name) = queue.lock().await.pop_front() else {
                    break;
                };

                match destroy_one(client.as_ref(), &name, retry).await {
                    Ok(()) => {
                        destroyed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        error!(version = %name, error = %err, "failed to destroy crypto key version");
                        failures.lock().await.push((name, err));
                    }
                }
            }
        }));
    }

    for joined in futures::future::join_all(tasks).await {
        joined.map_err(|e| KmsError::Other(anyhow::anyhow!("destroy worker failed: {}", e)))?;
    }

    let skipped = queue.lock().await.len();
    let mut failures = std::mem::take(&mut *failures.lock().await);

    if skipped > 0 {
        warn!(
            destroyed = destroyed.load(Ordering::SeqCst),
            failed = failures.len(),
            skipped,
            "destroy cancelled before all versions were attempted"
        );
        return Err(KmsError::Cancelled);
    }

    if !failures.is_empty() {
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        return Err(TrimFailure { failures }.into());
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    attempts: u32,
    base_delay: Duration,
}

impl Retry {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

async fn destroy_one(client: &dyn KeyManagementService, name: &str, retry: Retry) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let err = match client.destroy_crypto_key_version(name).await {
            Ok(_) => {
                debug!(version = %name, "scheduled crypto key version for destruction");
                return Ok(());
            }
            Err(err) => err,
        };

        if err.code == RemoteCode::NotFound {
            debug!(version = %name, "crypto key version already gone");
            return Ok(());
        }

        if err.code == RemoteCode::FailedPrecondition && already_terminal(client, name).await {
            debug!(version = %name, "crypto key version already destroyed");
            return Ok(());
        }

        if err.is_transient() && attempt < retry.attempts {
            let delay = retry.delay(attempt);
            warn!(
                attempt = attempt,
                version = %name,
                delay_ms = delay.as_millis() as u64,
                "destroy failed, retrying: {}",
                err
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Err(KmsError::upstream("failed to destroy crypto key version", err));
    }
}

async fn already_terminal(client: &dyn KeyManagementService, name: &str) -> bool {
    match client.get_crypto_key_version(name).await {
        Ok(version) => version.state.is_terminal(),
        Err(err) => err.code == RemoteCode::NotFound,
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backends::mock::{MockKms, MockMethod};
    use crate::error::RemoteError;
    use crate::kms::{Algorithm, VersionState};
    use chrono::{TimeZone, Utc};

    const RING: &str = "projects/p/locations/global/keyRings/r";

    fn setup(algorithm: Algorithm, versions: usize) -> (MockKms, Arc<dyn KeyManagementService>, Key) {
        let kms = MockKms::new();
        let crypto_key = kms.seed_crypto_key(RING, "k", algorithm, versions);
        let client: Arc<dyn KeyManagementService> = Arc::new(kms.client());
        (kms, client, Key::new("my-key", crypto_key))
    }

    fn options() -> BackendOptions {
        BackendOptions::default().with_retry_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_rotate_increments_primary() {
        let (_kms, client, key) = setup(Algorithm::SymmetricEncryption, 1);

        let before = client.get_crypto_key(&key.crypto_key_id).await.unwrap();
        let before = before.primary.unwrap().version();

        let rotated = rotate(client.as_ref(), &key).await.unwrap();
        assert_eq!(rotated, before + 1);

        let after = client.get_crypto_key(&key.crypto_key_id).await.unwrap();
        assert_eq!(after.primary.unwrap().version(), before + 1);
    }

    #[tokio::test]
    async fn test_rotate_asymmetric_has_no_primary() {
        let (kms, client, key) = setup(Algorithm::EcSignP256Sha256, 1);

        assert_eq!(rotate(client.as_ref(), &key).await.unwrap(), 2);
        assert_eq!(kms.live_versions(&key.crypto_key_id), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rotate_missing_key() {
        let (_kms, client, _) = setup(Algorithm::SymmetricEncryption, 1);
        let gone = Key::new("gone", format!("{}/cryptoKeys/nope", RING));

        let err = rotate(client.as_ref(), &gone).await.unwrap_err();
        assert!(matches!(err, KmsError::RemoteNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rotate_surfaces_upstream_step() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 1);
        kms.fail(
            MockMethod::CreateVersion,
            RemoteError::new(RemoteCode::Unavailable, "try later"),
        );

        let err = rotate(client.as_ref(), &key).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to create new crypto key version"));
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 7);
        kms.set_page_size(2);

        let versions = list_all_versions(client.as_ref(), &key.crypto_key_id, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(versions.len(), 7);
    }

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 5);

        let report = trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(report.destroyed, vec![2, 1]);
        assert_eq!(report.retained, vec![5, 4, 3]);
        assert!(!report.window_conflict);
        assert_eq!(kms.live_versions(&key.crypto_key_id), vec![3, 4, 5]);

        // Second run is a no-op
        let calls = kms.destroy_calls().len();
        let again = trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert!(again.destroyed.is_empty());
        assert_eq!(kms.destroy_calls().len(), calls);
    }

    #[tokio::test]
    async fn test_trim_ignores_terminal_versions() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 5);
        kms.set_version_state(&key.version_path(5), VersionState::Destroyed);
        kms.set_version_state(&key.version_path(4), VersionState::DestroyScheduled);

        let report = trim(&client, &key, 2, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(report.retained, vec![3, 2]);
        assert_eq!(report.destroyed, vec![1]);
    }

    #[tokio::test]
    async fn test_trim_orders_by_create_time() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 3);
        let t = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        kms.set_create_time(&key.version_path(1), t(30));
        kms.set_create_time(&key.version_path(2), t(10));
        kms.set_create_time(&key.version_path(3), t(20));

        let report = trim(&client, &key, 2, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(report.retained, vec![1, 3]);
        assert_eq!(report.destroyed, vec![2]);
    }

    #[tokio::test]
    async fn test_trim_window_conflict_is_flagged() {
        let (kms, client, mut key) = setup(Algorithm::SymmetricEncryption, 5);
        key.set_window(Some(1), Some(2)).unwrap();

        let report = trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap();

        // Recency wins: the only in-window versions are gone
        assert!(report.window_conflict);
        assert_eq!(report.destroyed, vec![2, 1]);
        assert!(kms
            .live_versions(&key.crypto_key_id)
            .iter()
            .all(|v| !key.window_contains(*v)));
    }

    #[tokio::test]
    async fn test_trim_window_overlap_without_conflict() {
        let (_kms, client, mut key) = setup(Algorithm::SymmetricEncryption, 5);
        key.set_window(Some(2), Some(3)).unwrap();

        let report = trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert!(!report.window_conflict);
        assert_eq!(report.retained, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_trim_retries_transient_failures() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 4);
        kms.fail_destroy(
            key.version_path(1),
            RemoteError::new(RemoteCode::Unavailable, "busy"),
            Some(2),
        );

        trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap();

        let attempts = kms
            .destroy_calls()
            .iter()
            .filter(|c| **c == key.version_path(1))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_trim_does_not_retry_permanent_failures() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 5);
        kms.fail_destroy(
            key.version_path(1),
            RemoteError::new(RemoteCode::PermissionDenied, "denied"),
            None,
        );

        let err = trim(&client, &key, 3, &options(), &CancelToken::never())
            .await
            .unwrap_err();

        let KmsError::Trim(failure) = err else {
            panic!("expected trim failure, got {:?}", err);
        };
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].0, key.version_path(1));

        // The other candidate still went through
        assert_eq!(kms.live_versions(&key.crypto_key_id), vec![1, 3, 4, 5]);
        assert_eq!(kms.destroy_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_trim_gives_up_after_retries() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 4);
        kms.fail_destroy(
            key.version_path(1),
            RemoteError::new(RemoteCode::DeadlineExceeded, "slow"),
            None,
        );
        let options = options().with_destroy_retries(3);

        let err = trim(&client, &key, 3, &options, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, KmsError::Trim(_)));
        assert_eq!(kms.destroy_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_already_destroyed_counts_as_success() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 3);
        let versions = list_all_versions(client.as_ref(), &key.crypto_key_id, &CancelToken::never())
            .await
            .unwrap();

        // Destroyed behind our back between listing and destroying
        kms.set_version_state(&key.version_path(1), VersionState::Destroyed);
        let mut doomed = versions;
        doomed.push(CryptoKeyVersion {
            name: key.version_path(42),
            state: VersionState::Enabled,
            create_time: None,
            algorithm: None,
        });

        destroy_versions(client, doomed, &options(), &CancelToken::never())
            .await
            .unwrap();
        assert!(kms.live_versions(&key.crypto_key_id).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_concurrency_is_bounded() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 20);
        kms.set_destroy_delay(Duration::from_millis(20));
        let options = options().with_trim_concurrency(4);

        let destroyed = destroy_all(&client, &key, &options, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(destroyed.len(), 20);
        assert!(kms.peak_destroy_concurrency() <= 4);
        assert!(kms.peak_destroy_concurrency() > 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() {
        let (kms, client, key) = setup(Algorithm::SymmetricEncryption, 10);
        kms.set_destroy_delay(Duration::from_millis(50));
        let options = options().with_trim_concurrency(2);
        let (handle, token) = cancellation();

        let task = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move { destroy_all(&client, &key, &options, &token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, KmsError::Cancelled));

        // In-flight calls finished, nothing new was issued
        let issued = kms.destroy_calls().len();
        assert!(issued >= 2 && issued < 10);
        assert_eq!(kms.live_versions(&key.crypto_key_id).len(), 10 - issued);
    }

    #[tokio::test]
    async fn test_cancelled_before_listing() {
        let (_kms, client, key) = setup(Algorithm::SymmetricEncryption, 3);
        let (handle, token) = cancellation();
        handle.cancel();

        let err = trim(&client, &key, 1, &options(), &token).await.unwrap_err();
        assert!(matches!(err, KmsError::Cancelled));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let retry = Retry {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
    }
}
