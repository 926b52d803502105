//! In-memory state store.

use crate::error::{StorageError, StorageResult};
use crate::state::{CasToken, LockToken, StateStore, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entry {
    value: String,
    cas: u64,
    lock: Option<HeldLock>,
}

impl Entry {
    fn locked(&self, now: Instant) -> Option<&LockToken> {
        self.lock
            .as_ref()
            .filter(|held| held.expires_at > now)
            .map(|held| &held.token)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_cas: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    fn ensure_unlocked(&self, key: &str) -> StorageResult<()> {
        match self.entries.get(key) {
            Some(entry) if entry.locked(Instant::now()).is_some() => {
                Err(StorageError::Locked(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn write(&mut self, key: &str, value: String) -> CasToken {
        let cas = self.bump();
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                cas,
                lock: None,
            },
        );
        CasToken(cas)
    }

    fn holder(&self, key: &str, lock: &LockToken) -> StorageResult<()> {
        let held = self
            .entries
            .get(key)
            .and_then(|entry| entry.locked(Instant::now()));
        if held == Some(lock) {
            Ok(())
        } else {
            Err(StorageError::LockMismatch(key.to_string()))
        }
    }
}

/// An in-memory [`StateStore`].
///
/// Thread-safe; all operations on one key are linearizable.
#[derive(Debug)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns all keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Returns true if `key` is currently locked.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.locked(Instant::now()).is_some())
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("state store is down".into()))
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Versioned>> {
        self.check_available()?;
        Ok(self.inner.lock().entries.get(key).map(|entry| Versioned {
            value: entry.value.clone(),
            cas: CasToken(entry.cas),
        }))
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<CasToken> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.ensure_unlocked(key)?;
        Ok(inner.write(key, value))
    }

    async fn append(&self, key: &str, suffix: &str) -> StorageResult<CasToken> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.ensure_unlocked(key)?;
        let value = match inner.entries.get(key) {
            Some(entry) => format!("{}{suffix}", entry.value),
            None => suffix.to_string(),
        };
        Ok(inner.write(key, value))
    }

    async fn counter(&self, key: &str, delta: i64) -> StorageResult<Option<i64>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.ensure_unlocked(key)?;
        let Some(entry) = inner.entries.get(key) else {
            return Ok(None);
        };
        let current: i64 = entry
            .value
            .trim()
            .parse()
            .map_err(|_| StorageError::NotACounter(key.to_string()))?;
        let next = current.saturating_add(delta);
        inner.write(key, next.to_string());
        Ok(Some(next))
    }

    async fn check_and_set(
        &self,
        key: &str,
        value: String,
        expected: Option<CasToken>,
    ) -> StorageResult<CasToken> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.ensure_unlocked(key)?;
        let current = inner.entries.get(key).map(|entry| CasToken(entry.cas));
        if current != expected {
            trace!(key, ?expected, ?current, "cas mismatch");
            return Err(StorageError::CasMismatch(key.to_string()));
        }
        Ok(inner.write(key, value))
    }

    async fn get_and_lock(&self, key: &str, ttl: Duration) -> StorageResult<(String, LockToken)> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if entry.locked(now).is_some() {
            return Err(StorageError::Locked(key.to_string()));
        }
        let token = LockToken::generate();
        entry.lock = Some(HeldLock {
            token: token.clone(),
            expires_at: now + ttl,
        });
        Ok((entry.value.clone(), token))
    }

    async fn replace(&self, key: &str, value: String, lock: &LockToken) -> StorageResult<CasToken> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.holder(key, lock)?;
        Ok(inner.write(key, value))
    }

    async fn unlock(&self, key: &str, lock: &LockToken) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.holder(key, lock)?;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.lock = None;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.ensure_unlocked(key)?;
        Ok(inner.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryStateStore::new();
        let cas = store.set("k", "v".into()).await.unwrap();
        let got = store.get("k").await.unwrap().unwrap();
        assert_eq!(got.value, "v");
        assert_eq!(got.cas, cas);
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_and_set_requires_matching_token() {
        let store = InMemoryStateStore::new();
        let first = store.check_and_set("k", "1".into(), None).await.unwrap();
        assert!(matches!(
            store.check_and_set("k", "x".into(), None).await,
            Err(StorageError::CasMismatch(_))
        ));
        let second = store
            .check_and_set("k", "2".into(), Some(first))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            store.check_and_set("k", "3".into(), Some(first)).await,
            Err(StorageError::CasMismatch(_))
        ));
    }

    #[tokio::test]
    async fn counters() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.counter("n", 1).await.unwrap(), None);
        assert!(store.get("n").await.unwrap().is_none());

        store.set("n", "10".into()).await.unwrap();
        assert_eq!(store.counter("n", -3).await.unwrap(), Some(7));
        assert_eq!(store.get("n").await.unwrap().unwrap().value, "7");

        store.set("s", "abc".into()).await.unwrap();
        assert!(matches!(
            store.counter("s", 1).await,
            Err(StorageError::NotACounter(_))
        ));
    }

    #[tokio::test]
    async fn append_creates_and_extends() {
        let store = InMemoryStateStore::new();
        store.append("k", "a").await.unwrap();
        store.append("k", ",b").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "a,b");
    }

    #[tokio::test]
    async fn lock_excludes_other_writers() {
        let store = InMemoryStateStore::new();
        store.set("k", "old".into()).await.unwrap();

        let (value, token) = store.get_and_lock("k", TTL).await.unwrap();
        assert_eq!(value, "old");
        assert!(store.is_locked("k"));
        assert!(matches!(
            store.get_and_lock("k", TTL).await,
            Err(StorageError::Locked(_))
        ));
        assert!(matches!(
            store.set("k", "x".into()).await,
            Err(StorageError::Locked(_))
        ));

        let stranger = LockToken::generate();
        assert!(matches!(
            store.replace("k", "x".into(), &stranger).await,
            Err(StorageError::LockMismatch(_))
        ));

        store.replace("k", "new".into(), &token).await.unwrap();
        assert!(!store.is_locked("k"));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "new");
    }

    #[tokio::test]
    async fn unlock_releases_without_writing() {
        let store = InMemoryStateStore::new();
        store.set("k", "v".into()).await.unwrap();
        let (_, token) = store.get_and_lock("k", TTL).await.unwrap();
        store.unlock("k", &token).await.unwrap();
        assert!(!store.is_locked("k"));
        assert!(matches!(
            store.unlock("k", &token).await,
            Err(StorageError::LockMismatch(_))
        ));
    }

    #[tokio::test]
    async fn locks_expire() {
        let store = InMemoryStateStore::new();
        store.set("k", "v".into()).await.unwrap();
        let (_, stale) = store
            .get_and_lock("k", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!store.is_locked("k"));
        let (_, fresh) = store.get_and_lock("k", TTL).await.unwrap();
        assert!(matches!(
            store.replace("k", "x".into(), &stale).await,
            Err(StorageError::LockMismatch(_))
        ));
        store.replace("k", "y".into(), &fresh).await.unwrap();
    }

    #[tokio::test]
    async fn missing_key_cannot_be_locked() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.get_and_lock("nope", TTL).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
