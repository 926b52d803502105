//! State store contract.

use crate::error::StorageResult;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque version token returned by every write to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasToken(pub u64);

/// Proof of holding a pessimistic lock on one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Creates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A value with the CAS token it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Stored value.
    pub value: String,
    /// Token of the write that produced `value`.
    pub cas: CasToken,
}

/// Key-value storage with optimistic and pessimistic concurrency control.
///
/// Every mutation except [`StateStore::replace`] and
/// [`StateStore::unlock`] fails with `Locked` while another holder has the
/// key locked. Locks expire after their TTL.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a key.
    async fn get(&self, key: &str) -> StorageResult<Option<Versioned>>;

    /// Writes a key unconditionally.
    async fn set(&self, key: &str, value: String) -> StorageResult<CasToken>;

    /// Appends to a key's value, creating the key if absent.
    async fn append(&self, key: &str, suffix: &str) -> StorageResult<CasToken>;

    /// Adds `delta` to a counter key.
    ///
    /// Returns `None` when the key does not exist; the key is not created.
    async fn counter(&self, key: &str, delta: i64) -> StorageResult<Option<i64>>;

    /// Writes a key if its CAS token is still `expected`.
    ///
    /// `expected = None` means the key must not exist yet.
    async fn check_and_set(
        &self,
        key: &str,
        value: String,
        expected: Option<CasToken>,
    ) -> StorageResult<CasToken>;

    /// Reads a key and locks it for at most `ttl`.
    ///
    /// Fails with `NotFound` for a missing key and `Locked` if another
    /// holder has it.
    async fn get_and_lock(&self, key: &str, ttl: Duration) -> StorageResult<(String, LockToken)>;

    /// Writes a locked key and releases the lock.
    async fn replace(&self, key: &str, value: String, lock: &LockToken) -> StorageResult<CasToken>;

    /// Releases a lock without writing.
    async fn unlock(&self, key: &str, lock: &LockToken) -> StorageResult<()>;

    /// Removes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;
}
