//! Channel subscriptions and cached channel counts.
//!
//! All state lives in the [`StateStore`]:
//!
//! | key | value |
//! |---|---|
//! | `subs:<channel>` | JSON array of device ids, in subscribe order |
//! | `device:<id>` | JSON [`Device`] record |
//! | `variants:<base channel>` | JSON array of suffixed channel keys with subscribers |
//! | `count:<channel>` | integer counter |
//!
//! Channel sets and device records are changed with optimistic CAS loops;
//! unsubscribing takes a pessimistic lock on the channel set.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use relaybase_protocol::ChannelKey;
use relaybase_storage::{CasToken, LockToken, StateStore, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

const SUBS_PREFIX: &str = "subs:";
const DEVICE_PREFIX: &str = "device:";
const VARIANTS_PREFIX: &str = "variants:";
const COUNT_PREFIX: &str = "count:";

/// A subscribing device and the channels it listens to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Device {
    /// Device id.
    pub id: String,
    /// Channel keys, in subscribe order.
    pub subscriptions: Vec<ChannelKey>,
}

/// Subscription bookkeeping over a [`StateStore`].
pub struct SubscriptionRegistry {
    state: Arc<dyn StateStore>,
    config: Arc<CoreConfig>,
}

impl SubscriptionRegistry {
    /// Creates a registry.
    pub fn new(state: Arc<dyn StateStore>, config: Arc<CoreConfig>) -> Self {
        Self { state, config }
    }

    /// Adds `device_id` to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadySubscribed`] if the device is already in
    /// the channel set.
    pub async fn subscribe(&self, channel: &ChannelKey, device_id: &str) -> CoreResult<()> {
        check_args(channel, device_id)?;

        self.update_json(&subs_key(channel), |devices: &mut Vec<String>| {
            if devices.iter().any(|d| d == device_id) {
                return Err(CoreError::AlreadySubscribed {
                    channel: channel.to_string(),
                    device: device_id.to_string(),
                });
            }
            devices.push(device_id.to_string());
            Ok(true)
        })
        .await?;

        if let Err(e) = self.link_subscription(channel, device_id).await {
            warn!(channel = %channel, device = device_id, error = %e, "subscribe failed, rolling back");
            self.unlink_subscription(channel, device_id).await;
            return Err(e);
        }

        debug!(channel = %channel, device = device_id, "subscribed");
        Ok(())
    }

    /// Records a fresh channel-set entry on the device and variant index.
    async fn link_subscription(&self, channel: &ChannelKey, device_id: &str) -> CoreResult<()> {
        self.update_json(&device_key(device_id), |device: &mut Device| {
            device.id = device_id.to_string();
            if device.subscriptions.contains(channel) {
                return Ok(false);
            }
            device.subscriptions.push(channel.clone());
            Ok(true)
        })
        .await?;

        if channel.is_variant() {
            self.update_json(
                &variants_key(&channel.base()),
                |variants: &mut Vec<ChannelKey>| {
                    if variants.contains(channel) {
                        return Ok(false);
                    }
                    variants.push(channel.clone());
                    Ok(true)
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Undoes a partially applied subscribe. Failures are logged only.
    async fn unlink_subscription(&self, channel: &ChannelKey, device_id: &str) {
        let device = self
            .update_json(&device_key(device_id), |device: &mut Device| {
                let before = device.subscriptions.len();
                device.subscriptions.retain(|c| c != channel);
                Ok(device.subscriptions.len() != before)
            })
            .await;
        let channel_set = self
            .update_json(&subs_key(channel), |devices: &mut Vec<String>| {
                let before = devices.len();
                devices.retain(|d| d != device_id);
                Ok(devices.len() != before)
            })
            .await;
        for e in [device.err(), channel_set.err()].into_iter().flatten() {
            error!(channel = %channel, device = device_id, error = %e, "subscribe rollback incomplete");
        }
    }

    /// Removes `device_id` from a channel.
    ///
    /// The channel set is locked for the read-modify-write and the lock is
    /// released on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SubscriptionNotFound`] if the device is not in
    /// the channel set, and [`CoreError::ConcurrencyExhausted`] if the lock
    /// could not be acquired.
    pub async fn unsubscribe(&self, channel: &ChannelKey, device_id: &str) -> CoreResult<()> {
        check_args(channel, device_id)?;
        let key = subs_key(channel);
        let not_found = || CoreError::SubscriptionNotFound {
            channel: channel.to_string(),
            device: device_id.to_string(),
        };

        let (raw, token) = match self.lock(&key).await {
            Err(CoreError::Storage(StorageError::NotFound(_))) => return Err(not_found()),
            other => other?,
        };

        let remaining = match self.remove_locked(&key, &raw, &token, device_id).await {
            Ok(Some(remaining)) => remaining,
            Ok(None) => {
                self.release(&key, &token).await;
                return Err(not_found());
            }
            Err(e) => {
                self.release(&key, &token).await;
                return Err(e);
            }
        };

        self.update_json(&device_key(device_id), |device: &mut Device| {
            let before = device.subscriptions.len();
            device.subscriptions.retain(|c| c != channel);
            Ok(device.subscriptions.len() != before)
        })
        .await?;

        if remaining == 0 && channel.is_variant() {
            self.update_json(
                &variants_key(&channel.base()),
                |variants: &mut Vec<ChannelKey>| {
                    let before = variants.len();
                    variants.retain(|c| c != channel);
                    Ok(variants.len() != before)
                },
            )
            .await?;
        }

        debug!(channel = %channel, device = device_id, remaining, "unsubscribed");
        Ok(())
    }

    /// Returns the devices subscribed to a channel, without locking.
    pub async fn get_devices(&self, channel: &ChannelKey) -> CoreResult<Vec<String>> {
        Ok(self
            .read_json::<Vec<String>>(&subs_key(channel))
            .await?
            .map(|(devices, _)| devices)
            .unwrap_or_default())
    }

    /// Returns a device record.
    pub async fn get_device(&self, device_id: &str) -> CoreResult<Option<Device>> {
        Ok(self
            .read_json::<Device>(&device_key(device_id))
            .await?
            .map(|(device, _)| device))
    }

    /// Returns the suffixed variants of a base channel that have subscribers.
    pub async fn channel_variants(&self, base: &ChannelKey) -> CoreResult<Vec<ChannelKey>> {
        Ok(self
            .read_json::<Vec<ChannelKey>>(&variants_key(base))
            .await?
            .map(|(variants, _)| variants)
            .unwrap_or_default())
    }

    /// Unsubscribes a device from everything and deletes its record.
    ///
    /// Returns the channels the device was removed from.
    pub async fn remove_device(&self, device_id: &str) -> CoreResult<Vec<ChannelKey>> {
        let Some(device) = self.get_device(device_id).await? else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::with_capacity(device.subscriptions.len());
        for channel in device.subscriptions {
            match self.unsubscribe(&channel, device_id).await {
                Ok(()) => removed.push(channel),
                Err(CoreError::SubscriptionNotFound { .. }) => {
                    debug!(channel = %channel, device = device_id, "stale device subscription");
                }
                Err(e) => return Err(e),
            }
        }
        self.state.delete(&device_key(device_id)).await?;
        debug!(device = device_id, channels = removed.len(), "device removed");
        Ok(removed)
    }

    /// Returns the cached object count of a channel.
    ///
    /// On a miss, `recount` is awaited and its result cached.
    pub async fn get_object_count<F, Fut>(&self, channel: &ChannelKey, recount: F) -> CoreResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<u64>>,
    {
        let key = count_key(channel);
        if let Some(cached) = self.state.get(&key).await? {
            if let Ok(count) = cached.value.trim().parse::<i64>() {
                return Ok(count.max(0) as u64);
            }
            warn!(channel = %channel, "discarding unreadable cached count");
        }

        let count = recount().await?;
        if let Err(e) = self.state.set(&key, count.to_string()).await {
            warn!(channel = %channel, error = %e, "failed to cache count");
        }
        Ok(count)
    }

    /// Overwrites the cached object count of a channel.
    pub async fn set_object_count(&self, channel: &ChannelKey, count: u64) -> CoreResult<()> {
        self.state.set(&count_key(channel), count.to_string()).await?;
        Ok(())
    }

    /// Adjusts a cached count that is already present.
    ///
    /// Returns `None` without creating the counter when nothing is cached.
    pub async fn increment_object_count(
        &self,
        channel: &ChannelKey,
        delta: i64,
    ) -> CoreResult<Option<i64>> {
        Ok(self.state.counter(&count_key(channel), delta).await?)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> CoreResult<Option<(T, CasToken)>> {
        match self.state.get(key).await? {
            Some(versioned) => {
                let value = serde_json::from_str(&versioned.value)?;
                Ok(Some((value, versioned.cas)))
            }
            None => Ok(None),
        }
    }

    /// Optimistic read-modify-write of a JSON value.
    ///
    /// `change` returns whether it modified the value; unchanged values are
    /// not written back.
    async fn update_json<T, F>(&self, key: &str, mut change: F) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> CoreResult<bool>,
    {
        let attempts = self.config.max_conflict_retries;
        for attempt in 0..attempts {
            let (mut value, cas) = match self.read_json::<T>(key).await? {
                Some((value, cas)) => (value, Some(cas)),
                None => (T::default(), None),
            };
            if !change(&mut value)? {
                return Ok(value);
            }
            let encoded = serde_json::to_string(&value)?;
            match self.state.check_and_set(key, encoded, cas).await {
                Ok(_) => return Ok(value),
                Err(StorageError::CasMismatch(_) | StorageError::Locked(_)) => {
                    debug!(key, attempt, "cas retry");
                    self.config.retry.backoff(attempt + 1).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(key, attempts, "cas retries exhausted");
        Err(CoreError::ConcurrencyExhausted {
            target: key.to_string(),
            attempts,
        })
    }

    async fn lock(&self, key: &str) -> CoreResult<(String, LockToken)> {
        let attempts = self.config.max_lock_attempts;
        for attempt in 0..attempts {
            match self.state.get_and_lock(key, self.config.lock_ttl).await {
                Ok(locked) => return Ok(locked),
                Err(StorageError::Locked(_)) => {
                    debug!(key, attempt, "channel locked, retrying");
                    self.config.retry.backoff(attempt + 1).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(key, attempts, "lock attempts exhausted");
        Err(CoreError::ConcurrencyExhausted {
            target: key.to_string(),
            attempts,
        })
    }

    /// Writes the channel set without `device_id` under the lock.
    ///
    /// Returns the remaining set size, or `None` if the device was absent
    /// (in which case nothing is written and the lock is still held).
    async fn remove_locked(
        &self,
        key: &str,
        raw: &str,
        token: &LockToken,
        device_id: &str,
    ) -> CoreResult<Option<usize>> {
        let mut devices: Vec<String> = serde_json::from_str(raw)?;
        let Some(pos) = devices.iter().position(|d| d == device_id) else {
            return Ok(None);
        };
        devices.remove(pos);
        let encoded = serde_json::to_string(&devices)?;
        self.state.replace(key, encoded, token).await?;
        Ok(Some(devices.len()))
    }

    async fn release(&self, key: &str, token: &LockToken) {
        if let Err(e) = self.state.unlock(key, token).await {
            warn!(key, error = %e, "failed to release channel lock");
        }
    }
}

fn check_args(channel: &ChannelKey, device_id: &str) -> CoreResult<()> {
    if channel.as_str().is_empty() {
        return Err(CoreError::InvalidChannel("empty channel key".into()));
    }
    if device_id.is_empty() {
        return Err(CoreError::InvalidFieldValue("empty device id".into()));
    }
    Ok(())
}

fn subs_key(channel: &ChannelKey) -> String {
    format!("{SUBS_PREFIX}{channel}")
}

fn device_key(device_id: &str) -> String {
    format!("{DEVICE_PREFIX}{device_id}")
}

fn variants_key(base: &ChannelKey) -> String {
    format!("{VARIANTS_PREFIX}{base}")
}

fn count_key(channel: &ChannelKey) -> String {
    format!("{COUNT_PREFIX}{channel}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use relaybase_storage::{InMemoryStateStore, StorageResult, Versioned};
    use std::time::Duration;

    fn registry() -> (SubscriptionRegistry, Arc<InMemoryStateStore>) {
        let state = Arc::new(InMemoryStateStore::new());
        let config = CoreConfig::new()
            .with_retry(RetryConfig::immediate())
            .with_max_lock_attempts(3);
        (
            SubscriptionRegistry::new(state.clone(), Arc::new(config)),
            state,
        )
    }

    fn key(raw: &str) -> ChannelKey {
        ChannelKey::from_raw(raw)
    }

    /// Fails every CAS write to keys under `prefix`.
    struct FailingWrites {
        inner: InMemoryStateStore,
        prefix: &'static str,
    }

    #[async_trait::async_trait]
    impl StateStore for FailingWrites {
        async fn get(&self, key: &str) -> StorageResult<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> StorageResult<CasToken> {
            self.inner.set(key, value).await
        }

        async fn append(&self, key: &str, suffix: &str) -> StorageResult<CasToken> {
            self.inner.append(key, suffix).await
        }

        async fn counter(&self, key: &str, delta: i64) -> StorageResult<Option<i64>> {
            self.inner.counter(key, delta).await
        }

        async fn check_and_set(
            &self,
            key: &str,
            value: String,
            expected: Option<CasToken>,
        ) -> StorageResult<CasToken> {
            if key.starts_with(self.prefix) {
                return Err(StorageError::Unavailable("write refused".into()));
            }
            self.inner.check_and_set(key, value, expected).await
        }

        async fn get_and_lock(
            &self,
            key: &str,
            ttl: Duration,
        ) -> StorageResult<(String, LockToken)> {
            self.inner.get_and_lock(key, ttl).await
        }

        async fn replace(
            &self,
            key: &str,
            value: String,
            lock: &LockToken,
        ) -> StorageResult<CasToken> {
            self.inner.replace(key, value, lock).await
        }

        async fn unlock(&self, key: &str, lock: &LockToken) -> StorageResult<()> {
            self.inner.unlock(key, lock).await
        }

        async fn delete(&self, key: &str) -> StorageResult<bool> {
            self.inner.delete(key).await
        }
    }

    fn failing_registry(prefix: &'static str) -> SubscriptionRegistry {
        let state = FailingWrites {
            inner: InMemoryStateStore::new(),
            prefix,
        };
        let config = CoreConfig::new().with_retry(RetryConfig::immediate());
        SubscriptionRegistry::new(Arc::new(state), Arc::new(config))
    }

    #[tokio::test]
    async fn failed_device_record_rolls_back_channel_set() {
        let reg = failing_registry(DEVICE_PREFIX);
        let channel = key("blg:app:context:c1:post");

        let err = reg.subscribe(&channel, "d1").await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::Unavailable(_))));
        assert!(reg.get_devices(&channel).await.unwrap().is_empty());
        assert!(reg.get_device("d1").await.unwrap().is_none());

        // A retry reports the store failure again, not a phantom subscription.
        let err = reg.subscribe(&channel, "d1").await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[tokio::test]
    async fn failed_variant_index_rolls_back_both_sides() {
        let reg = failing_registry(VARIANTS_PREFIX);
        let deltas = key("blg:app:post:7:deltas");

        assert!(reg.subscribe(&deltas, "d1").await.is_err());
        assert!(reg.get_devices(&deltas).await.unwrap().is_empty());
        let device = reg.get_device("d1").await.unwrap().unwrap();
        assert!(device.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn subscribe_keeps_order_and_device_record() {
        let (reg, _) = registry();
        let posts = key("blg:app:context:c1:post");
        reg.subscribe(&posts, "d1").await.unwrap();
        reg.subscribe(&posts, "d2").await.unwrap();
        reg.subscribe(&key("blg:app:post:7"), "d1").await.unwrap();

        assert_eq!(reg.get_devices(&posts).await.unwrap(), vec!["d1", "d2"]);
        let device = reg.get_device("d1").await.unwrap().unwrap();
        assert_eq!(device.id, "d1");
        assert_eq!(
            device.subscriptions,
            vec![posts.clone(), key("blg:app:post:7")]
        );
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let (reg, _) = registry();
        let channel = key("blg:app:user");
        reg.subscribe(&channel, "d1").await.unwrap();
        let err = reg.subscribe(&channel, "d1").await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadySubscribed { .. }));
        assert_eq!(reg.get_devices(&channel).await.unwrap(), vec!["d1"]);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_device_releases_lock() {
        let (reg, state) = registry();
        let channel = key("blg:app:user");
        reg.subscribe(&channel, "d1").await.unwrap();

        let err = reg.unsubscribe(&channel, "d9").await.unwrap_err();
        assert!(matches!(err, CoreError::SubscriptionNotFound { .. }));
        assert!(!state.is_locked("subs:blg:app:user"));
        assert_eq!(reg.get_devices(&channel).await.unwrap(), vec!["d1"]);
    }

    #[tokio::test]
    async fn unsubscribe_from_unknown_channel() {
        let (reg, _) = registry();
        let err = reg.unsubscribe(&key("blg:app:nothing"), "d1").await.unwrap_err();
        assert!(matches!(err, CoreError::SubscriptionNotFound { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_updates_both_sides() {
        let (reg, state) = registry();
        let channel = key("blg:app:user");
        reg.subscribe(&channel, "d1").await.unwrap();
        reg.subscribe(&channel, "d2").await.unwrap();
        reg.unsubscribe(&channel, "d1").await.unwrap();

        assert_eq!(reg.get_devices(&channel).await.unwrap(), vec!["d2"]);
        assert!(reg
            .get_device("d1")
            .await
            .unwrap()
            .unwrap()
            .subscriptions
            .is_empty());
        assert!(!state.is_locked("subs:blg:app:user"));
    }

    #[tokio::test]
    async fn held_lock_exhausts_attempts() {
        let (reg, state) = registry();
        let channel = key("blg:app:user");
        reg.subscribe(&channel, "d1").await.unwrap();
        let (_, _held) = state
            .get_and_lock("subs:blg:app:user", std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let err = reg.unsubscribe(&channel, "d1").await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn variants_follow_their_subscribers() {
        let (reg, _) = registry();
        let base = key("blg:app:post");
        let deltas = key("blg:app:post:deltas");
        reg.subscribe(&deltas, "d1").await.unwrap();
        reg.subscribe(&deltas, "d2").await.unwrap();
        reg.subscribe(&base, "d3").await.unwrap();
        assert_eq!(reg.channel_variants(&base).await.unwrap(), vec![deltas.clone()]);

        reg.unsubscribe(&deltas, "d1").await.unwrap();
        assert_eq!(reg.channel_variants(&base).await.unwrap(), vec![deltas.clone()]);
        reg.unsubscribe(&deltas, "d2").await.unwrap();
        assert!(reg.channel_variants(&base).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_device_cascades() {
        let (reg, _) = registry();
        let a = key("blg:app:user");
        let b = key("blg:app:post:1");
        reg.subscribe(&a, "d1").await.unwrap();
        reg.subscribe(&b, "d1").await.unwrap();
        reg.subscribe(&b, "d2").await.unwrap();

        let removed = reg.remove_device("d1").await.unwrap();
        assert_eq!(removed, vec![a.clone(), b.clone()]);
        assert!(reg.get_devices(&a).await.unwrap().is_empty());
        assert_eq!(reg.get_devices(&b).await.unwrap(), vec!["d2"]);
        assert!(reg.get_device("d1").await.unwrap().is_none());
        assert!(reg.remove_device("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_are_lazy_and_best_effort() {
        let (reg, _) = registry();
        let channel = key("blg:app:post");

        assert_eq!(reg.increment_object_count(&channel, 1).await.unwrap(), None);
        let n = reg
            .get_object_count(&channel, || async { Ok(4) })
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(reg.increment_object_count(&channel, 1).await.unwrap(), Some(5));
        let n = reg
            .get_object_count(&channel, || async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(n, 5);

        reg.set_object_count(&channel, 2).await.unwrap();
        let n = reg
            .get_object_count(&channel, || async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn empty_arguments_are_rejected() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.subscribe(&key(""), "d1").await,
            Err(CoreError::InvalidChannel(_))
        ));
        assert!(matches!(
            reg.subscribe(&key("blg:app:user"), "").await,
            Err(CoreError::InvalidFieldValue(_))
        ));
    }
}
