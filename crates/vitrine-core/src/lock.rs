//! Distributed lock for per-model ordering operations.
//!
//! This module provides a distributed lock using the object store as the
//! coordination point. It uses:
//! - **CAS (Compare-and-Swap)**: Atomic acquisition via preconditioned writes
//! - **TTL (Time-to-Live)**: Automatic expiry to prevent deadlocks
//! - **Bounded wait**: Acquisition retries with backoff until a deadline,
//!   then fails with [`Error::LockTimeout`]
//!
//! # How It Works
//!
//! 1. Lock acquisition writes a lock file with the holder's ID and expiry time
//! 2. The write uses `DoesNotExist` precondition - only one writer can succeed
//! 3. If the lock exists, check if expired - if so, take it over via CAS
//! 4. Release writes an expired record via CAS (never an unconditional delete)
//!
//! The pipeline takes this lock per model around "read max sort order, insert
//! max + 1": the transaction alone cannot stop two concurrent uploads from
//! reading the same max before either commits.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(storage.clone(), MediaPaths::model_lock(&model_id));
//!
//! // Wait up to 10s for a lock held for at most 30s
//! let guard = lock.acquire(Duration::from_secs(30), Duration::from_secs(10)).await?;
//!
//! // Critical section - assign the next sort order slot
//!
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default bounded wait for acquisition (10 seconds).
pub const DEFAULT_ACQUIRE_WAIT: Duration = Duration::from_secs(10);

/// Base backoff duration between acquisition attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Maximum backoff duration between acquisition attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Optional description of the operation holding the lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lock info with the given holder ID and TTL.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
            operation: None,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.expires_at - Utc::now();
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

/// A distributed lock backed by object storage.
///
/// Uses CAS operations to ensure only one holder at a time. Each instance
/// gets a unique holder ID for identification.
pub struct DistributedLock<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
}

// Manual Clone implementation to avoid requiring S: Clone
// (Arc<S> can be cloned regardless of whether S is Clone)
impl<S: StorageBackend + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> DistributedLock<S> {
    /// Creates a new distributed lock on the given path.
    #[must_use]
    pub fn new(storage: Arc<S>, lock_path: impl Into<String>) -> Self {
        Self {
            storage,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempts to acquire the lock, waiting up to `wait` for contention to clear.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock is still held when the wait
    /// budget runs out, or a storage error if the backend fails.
    pub async fn acquire(&self, ttl: Duration, wait: Duration) -> Result<LockGuard<S>> {
        self.acquire_with_operation(ttl, wait, None).await
    }

    /// Attempts to acquire the lock with an operation description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock is still held when the wait
    /// budget runs out, or a storage error if the backend fails.
    pub async fn acquire_with_operation(
        &self,
        ttl: Duration,
        wait: Duration,
        operation: Option<String>,
    ) -> Result<LockGuard<S>> {
        let deadline = Instant::now() + wait;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(ttl, operation.clone()).await {
                Ok(guard) => return Ok(guard),
                Err(LockError::AlreadyHeld(_holder)) => {
                    let jitter = Duration::from_millis(rand_jitter());
                    let delay = backoff.min(BACKOFF_MAX) + jitter;

                    if Instant::now() + delay >= deadline {
                        return Err(Error::lock_timeout(&self.lock_path, wait));
                    }
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(LockError::Storage(e)) => return Err(e),
            }
        }
    }

    /// Attempts to acquire the lock once (no retries).
    async fn try_acquire(
        &self,
        ttl: Duration,
        operation: Option<String>,
    ) -> std::result::Result<LockGuard<S>, LockError> {
        // First, try to create the lock with DoesNotExist precondition
        let mut lock_info = LockInfo::new(&self.holder_id, ttl);
        lock_info.operation.clone_from(&operation);

        let lock_bytes = encode_lock(&lock_info).map_err(LockError::Storage)?;

        match self
            .storage
            .put(
                &self.lock_path,
                lock_bytes,
                "application/json",
                WritePrecondition::DoesNotExist,
            )
            .await
            .map_err(LockError::Storage)?
        {
            WriteResult::Success { version } => {
                return Ok(LockGuard {
                    storage: self.storage.clone(),
                    lock_path: self.lock_path.clone(),
                    holder_id: self.holder_id.clone(),
                    version,
                    released: false,
                });
            }
            WriteResult::PreconditionFailed { .. } => {
                // Lock exists - check if expired
            }
        }

        // Lock exists, check if we can take it over.
        // Get the version FIRST, then read contents: the expiry decision must
        // be bound to the same version used for the CAS takeover. If another
        // writer takes over between HEAD and GET we either see their
        // non-expired lock (retry) or the CAS fails (retry).
        let meta = self
            .storage
            .head(&self.lock_path)
            .await
            .map_err(LockError::Storage)?;

        let Some(meta) = meta else {
            // Lock disappeared between our DoesNotExist check and now - retry
            return Err(LockError::AlreadyHeld("race".into()));
        };

        let existing = read_lock(self.storage.as_ref(), &self.lock_path)
            .await
            .map_err(LockError::Storage)?;

        match existing {
            Some(info) if info.is_expired() => {
                // Expired lock - take it over using the version from HEAD above.
                let mut new_lock_info = LockInfo::new(&self.holder_id, ttl);
                new_lock_info.operation = operation;

                let new_lock_bytes = encode_lock(&new_lock_info).map_err(LockError::Storage)?;

                match self
                    .storage
                    .put(
                        &self.lock_path,
                        new_lock_bytes,
                        "application/json",
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await
                    .map_err(LockError::Storage)?
                {
                    WriteResult::Success { version } => Ok(LockGuard {
                        storage: self.storage.clone(),
                        lock_path: self.lock_path.clone(),
                        holder_id: self.holder_id.clone(),
                        version,
                        released: false,
                    }),
                    WriteResult::PreconditionFailed { .. } => {
                        // Someone else took it or the lock changed - retry
                        Err(LockError::AlreadyHeld("unknown".into()))
                    }
                }
            }
            Some(info) => Err(LockError::AlreadyHeld(info.holder_id)),
            None => {
                // Lock disappeared after HEAD - retry from start
                Err(LockError::AlreadyHeld("race".into()))
            }
        }
    }

    /// Checks if the lock is currently held (regardless of holder).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(read_lock(self.storage.as_ref(), &self.lock_path)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock info without acquiring the lock.
    ///
    /// Intended for operator tooling.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn read_lock_info(&self) -> Result<Option<LockInfo>> {
        read_lock(self.storage.as_ref(), &self.lock_path).await
    }

    /// Forcefully breaks an existing lock (admin operation).
    ///
    /// # Warning
    ///
    /// Only for recovery when a lock is known to be stale but hasn't expired
    /// (e.g., crashed holder with a long TTL).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be broken.
    pub async fn force_break(&self) -> Result<()> {
        self.storage.delete(&self.lock_path).await
    }
}

fn encode_lock(info: &LockInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization {
            message: format!("serialize lock: {e}"),
        })
}

async fn read_lock<S: StorageBackend + ?Sized>(storage: &S, path: &str) -> Result<Option<LockInfo>> {
    match storage.get(path).await {
        Ok(data) => {
            let info: LockInfo = serde_json::from_slice(&data).map_err(|e| Error::Serialization {
                message: format!("parse lock: {e}"),
            })?;
            Ok(Some(info))
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// RAII guard for a held lock.
///
/// The lock is automatically released when the guard is dropped, but callers
/// should prefer [`LockGuard::release`] to observe release errors.
#[derive(Debug)]
pub struct LockGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
    /// Opaque version token for CAS operations.
    version: String,
    released: bool,
}

impl<S: StorageBackend + ?Sized> LockGuard<S> {
    /// Returns the holder ID for this lock.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Explicitly releases the lock.
    ///
    /// This is called automatically on drop, but calling explicitly allows
    /// handling release errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be released.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    /// Internal release implementation.
    ///
    /// Uses CAS to write an expired lock record instead of an unconditional
    /// delete. This prevents deleting a new holder's lock if takeover
    /// happened between our ownership check and the release operation.
    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        // Read current lock to verify ownership
        if let Some(info) = read_lock(self.storage.as_ref(), &self.lock_path).await? {
            if info.holder_id == self.holder_id {
                // Write an expired record (releases the lock).
                //
                // On Success: leave the expired record in place - the next
                // acquire overwrites it. Deleting here would race: a new
                // holder could acquire between our CAS and the delete.
                //
                // On PreconditionFailed: another holder took over - don't
                // touch their lock. Expected in takeover scenarios.
                let expired_info = LockInfo {
                    holder_id: self.holder_id.clone(),
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                    acquired_at: info.acquired_at,
                    operation: None,
                };

                let expired_bytes = encode_lock(&expired_info)?;

                let _ = self
                    .storage
                    .put(
                        &self.lock_path,
                        expired_bytes,
                        "application/json",
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?;
            }
        }

        self.released = true;
        Ok(())
    }
}

impl<S: StorageBackend + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort async release in destructor.
            // In practice, prefer calling release() explicitly.
            //
            // Guard against panic when dropped outside a Tokio runtime
            // (e.g., during shutdown). If no runtime, TTL handles cleanup.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };

            let storage = self.storage.clone();
            let path = self.lock_path.clone();
            let holder = self.holder_id.clone();
            let version = self.version.clone();

            handle.spawn(async move {
                // Write an expired record via CAS - same approach as
                // do_release(). Avoids the delete-new-holder race.
                if let Ok(Some(meta)) = storage.head(&path).await {
                    if meta.version == version {
                        if let Ok(Some(info)) = read_lock(storage.as_ref(), &path).await {
                            if info.holder_id == holder {
                                let expired = LockInfo {
                                    holder_id: holder,
                                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                                    acquired_at: info.acquired_at,
                                    operation: None,
                                };
                                if let Ok(bytes) = encode_lock(&expired) {
                                    let _ = storage
                                        .put(
                                            &path,
                                            bytes,
                                            "application/json",
                                            WritePrecondition::MatchesVersion(version),
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Internal lock acquisition errors.
enum LockError {
    AlreadyHeld(String),
    Storage(Error),
}

/// Generates random jitter for backoff (0-25ms).
fn rand_jitter() -> u64 {
    // Simple time-derived jitter (avoids a rand dependency for this case)
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 25
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[tokio::test]
    async fn acquire_and_release() {
        let backend = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let guard = lock
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire");
        assert!(!guard.holder_id().is_empty());

        guard.release().await.expect("release");
        assert!(!lock.is_locked().await.expect("check"));
    }

    #[tokio::test]
    async fn held_lock_times_out_second_acquirer() {
        let backend = Arc::new(MemoryBackend::new());
        let lock1 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");
        let lock2 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let _guard1 = lock1
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire1");

        let err = lock2
            .acquire(Duration::from_secs(30), Duration::from_millis(150))
            .await
            .expect_err("second acquire should time out");
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn locks_on_different_models_are_independent() {
        let backend = Arc::new(MemoryBackend::new());
        let lock1 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");
        let lock2 = DistributedLock::new(backend.clone(), "locks/models/m2.lock.json");

        let _guard1 = lock1
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire m1");
        let guard2 = lock2
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire m2");
        guard2.release().await.expect("release m2");
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let backend = Arc::new(MemoryBackend::new());
        let lock1 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");
        let lock2 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let guard1 = lock1
            .acquire(Duration::from_millis(1), Duration::from_secs(1))
            .await
            .expect("acquire1");

        tokio::time::sleep(Duration::from_millis(10)).await;

        let guard2 = lock2
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire2");

        assert_ne!(guard1.holder_id(), guard2.holder_id());
        guard2.release().await.expect("release2");
    }

    #[tokio::test]
    async fn release_after_wait_allows_reacquisition() {
        let backend = Arc::new(MemoryBackend::new());
        let lock1 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");
        let lock2 = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let guard1 = lock1
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire1");

        let waiter = tokio::spawn(async move {
            lock2
                .acquire(Duration::from_secs(30), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard1.release().await.expect("release1");

        let guard2 = waiter.await.expect("join").expect("acquire2 after release");
        guard2.release().await.expect("release2");
    }

    #[tokio::test]
    async fn lock_info_expiry() {
        let info = LockInfo::new("holder-1", Duration::from_secs(1));
        assert!(!info.is_expired());
        assert!(info.remaining_ttl() > Duration::ZERO);

        let expired = LockInfo {
            holder_id: "holder-2".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(10),
            acquired_at: Utc::now() - chrono::Duration::seconds(20),
            operation: None,
        };
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_ttl(), Duration::ZERO);
    }

    #[tokio::test]
    async fn lock_with_operation() {
        let backend = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let guard = lock
            .acquire_with_operation(
                Duration::from_secs(30),
                Duration::from_secs(1),
                Some("uploadImage".into()),
            )
            .await
            .expect("acquire");

        let info = lock.read_lock_info().await.expect("read").expect("info");
        assert_eq!(info.operation, Some("uploadImage".into()));

        guard.release().await.expect("release");
    }

    #[tokio::test]
    async fn force_break() {
        let backend = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(backend.clone(), "locks/models/m1.lock.json");

        let _guard = lock
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire");
        assert!(lock.is_locked().await.expect("check"));

        lock.force_break().await.expect("break");
        assert!(!lock.is_locked().await.expect("check2"));
    }
}
