//! Routing of committed mutations to subscribed channels.

use crate::adapter::{ItemError, ObjectRef};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::registry::SubscriptionRegistry;
use crate::schema::SchemaCache;
use crate::transport::MessageTransport;
use bytes::Bytes;
use futures::future::join_all;
use relaybase_protocol::{
    now_millis, ChannelAddress, ChannelKey, Delta, DeltaOp, Filter, Object, Patch,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A committed change to one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Kind of change.
    pub op: DeltaOp,
    /// Object after the change, or before it for deletes.
    pub object: Object,
    /// Patches applied, for updates.
    pub patch: Option<Vec<Patch>>,
}

impl Mutation {
    /// An object was created.
    pub fn added(object: Object) -> Self {
        Self {
            op: DeltaOp::Add,
            object,
            patch: None,
        }
    }

    /// An object was patched.
    pub fn updated(object: Object, patch: Vec<Patch>) -> Self {
        Self {
            op: DeltaOp::Update,
            object,
            patch: Some(patch),
        }
    }

    /// An object was deleted.
    pub fn deleted(object: Object) -> Self {
        Self {
            op: DeltaOp::Delete,
            object,
            patch: None,
        }
    }

    fn target(&self) -> ObjectRef {
        ObjectRef::new(
            self.object.model().unwrap_or_default(),
            self.object.id().unwrap_or_default(),
        )
    }
}

/// Devices reached on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDelivery {
    /// Channel key.
    pub channel: ChannelKey,
    /// Subscribed devices.
    pub devices: Vec<String>,
}

/// Routing of one delta.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRoute {
    /// Kind of change.
    pub op: DeltaOp,
    /// Changed object.
    pub target: ObjectRef,
    /// Channels with at least one subscriber.
    pub deliveries: Vec<ChannelDelivery>,
    /// Whether the delta was handed to the transport.
    pub published: bool,
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchReport {
    /// One route per mutation, in input order.
    pub routes: Vec<DeltaRoute>,
    /// Deltas that could not be routed or published.
    pub errors: Vec<ItemError>,
}

impl DispatchReport {
    /// Returns the devices reached on `channel` across all deltas.
    pub fn devices_on(&self, channel: &ChannelKey) -> Vec<&str> {
        let mut devices: Vec<&str> = self
            .routes
            .iter()
            .flat_map(|r| &r.deliveries)
            .filter(|d| &d.channel == channel)
            .flat_map(|d| d.devices.iter().map(String::as_str))
            .collect();
        devices.dedup();
        devices
    }

    /// Returns true if any delta reached `device_id`.
    pub fn reached(&self, device_id: &str) -> bool {
        self.routes
            .iter()
            .flat_map(|r| &r.deliveries)
            .any(|d| d.devices.iter().any(|x| x == device_id))
    }

    /// Number of deltas handed to the transport.
    pub fn published(&self) -> usize {
        self.routes.iter().filter(|r| r.published).count()
    }
}

/// Turns committed mutations into deltas addressed to channels.
///
/// For every object the dispatcher enumerates the channels it belongs to,
/// keeps their cached counts in step with adds and deletes, looks up
/// subscribers on each channel and its filtered or deltas-only variants,
/// and publishes one CBOR-encoded [`Delta`] per object that reached anyone.
pub struct DeltaDispatcher {
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn MessageTransport>,
    schemas: Arc<SchemaCache>,
    config: Arc<CoreConfig>,
}

impl DeltaDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn MessageTransport>,
        schemas: Arc<SchemaCache>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            registry,
            transport,
            schemas,
            config,
        }
    }

    /// Routes and publishes a batch of mutations.
    pub async fn dispatch(
        &self,
        application_id: &str,
        mutations: Vec<Mutation>,
    ) -> DispatchReport {
        let routed =
            join_all(mutations.into_iter().map(|m| self.route(application_id, m))).await;

        let mut report = DispatchReport::default();
        for result in routed {
            match result {
                Ok(route) => report.routes.push(route),
                Err((target, e)) => {
                    warn!(
                        app = application_id,
                        target = %target,
                        error = %e,
                        "delta not dispatched"
                    );
                    report.errors.push(ItemError::new(target.to_string(), e));
                }
            }
        }
        info!(
            app = application_id,
            deltas = report.routes.len(),
            published = report.published(),
            failed = report.errors.len(),
            "dispatched"
        );
        report
    }

    /// Returns the canonical keys of every channel `object` belongs to.
    pub fn channels_for(&self, application_id: &str, object: &Object) -> Vec<ChannelKey> {
        let parent_model = object
            .model()
            .and_then(|m| self.schemas.model(application_id, m))
            .and_then(|m| m.parent);
        ChannelAddress::for_object(application_id, object, parent_model.as_deref())
            .iter()
            .filter_map(|address| match address.to_key(self.schemas.as_ref()) {
                Ok(key) => Some(key),
                Err(e) => {
                    debug!(app = application_id, error = %e, "skipping unroutable channel");
                    None
                }
            })
            .collect()
    }

    async fn route(
        &self,
        application_id: &str,
        mutation: Mutation,
    ) -> Result<DeltaRoute, (ObjectRef, CoreError)> {
        let target = mutation.target();
        let channels = self.channels_for(application_id, &mutation.object);

        let count_delta = mutation.op.count_delta();
        if count_delta != 0 {
            for channel in &channels {
                if let Err(e) = self.registry.increment_object_count(channel, count_delta).await {
                    warn!(channel = %channel, error = %e, "count not adjusted");
                }
            }
        }

        let mut deliveries = Vec::new();
        for base in &channels {
            deliveries.extend(
                self.deliveries(base, &mutation.object)
                    .await
                    .map_err(|e| (target.clone(), e))?,
            );
        }

        let mut route = DeltaRoute {
            op: mutation.op,
            target: target.clone(),
            deliveries,
            published: false,
        };
        if route.deliveries.is_empty() {
            return Ok(route);
        }

        let keys = route.deliveries.iter().map(|d| d.channel.clone()).collect();
        let delta = match mutation.op {
            DeltaOp::Add => Delta::add(application_id, mutation.object, now_millis()),
            DeltaOp::Update => Delta::update(
                application_id,
                mutation.object,
                mutation.patch.unwrap_or_default(),
                now_millis(),
            ),
            DeltaOp::Delete => Delta::delete(application_id, mutation.object, now_millis()),
        }
        .with_channels(keys);

        let payload = delta
            .encode()
            .map_err(|e| (target.clone(), CoreError::from(e)))?;
        self.transport
            .publish(&self.config.delta_topic, Bytes::from(payload))
            .await
            .map_err(|e| (target.clone(), e))?;
        route.published = true;
        debug!(
            app = application_id,
            target = %target,
            channels = route.deliveries.len(),
            "delta published"
        );
        Ok(route)
    }

    /// Collects subscribers of a base channel and of its matching variants.
    async fn deliveries(
        &self,
        base: &ChannelKey,
        object: &Object,
    ) -> CoreResult<Vec<ChannelDelivery>> {
        let mut candidates = vec![base.clone()];
        for variant in self.registry.channel_variants(base).await? {
            if variant_accepts(&variant, object) {
                candidates.push(variant);
            }
        }

        let mut deliveries = Vec::new();
        for channel in candidates {
            let devices = self.registry.get_devices(&channel).await?;
            if !devices.is_empty() {
                deliveries.push(ChannelDelivery { channel, devices });
            }
        }
        Ok(deliveries)
    }
}

fn variant_accepts(variant: &ChannelKey, object: &Object) -> bool {
    match variant.filter() {
        Ok(None) => true,
        Ok(Some(raw)) => match Filter::from_json(&raw) {
            Ok(filter) => filter.matches(object),
            Err(e) => {
                warn!(channel = %variant, error = %e, "unreadable channel filter");
                false
            }
        },
        Err(e) => {
            warn!(channel = %variant, error = %e, "undecodable channel filter");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::InMemoryTransport;
    use relaybase_protocol::{
        ApplicationSchema, ModelDefinition, FIELD_APPLICATION_ID, FIELD_CONTEXT_ID,
        FIELD_USER_ID,
    };
    use relaybase_storage::InMemoryStateStore;
    use serde_json::json;

    struct Fixture {
        dispatcher: DeltaDispatcher,
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<InMemoryTransport>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(CoreConfig::new().with_retry(RetryConfig::immediate()));
        let schemas = Arc::new(SchemaCache::new());
        schemas.put(
            ApplicationSchema::new("app")
                .with_model(ModelDefinition::new("post"))
                .with_model(
                    ModelDefinition::new("comment")
                        .with_namespace("comments")
                        .with_parent("post"),
                ),
        );
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(InMemoryStateStore::new()),
            config.clone(),
        ));
        let transport = Arc::new(InMemoryTransport::new());
        Fixture {
            dispatcher: DeltaDispatcher::new(
                registry.clone(),
                transport.clone(),
                schemas,
                config,
            ),
            registry,
            transport,
        }
    }

    fn comment(id: &str, parent: &str) -> Object {
        Object::new("comment", id)
            .with(FIELD_APPLICATION_ID, "app")
            .with(FIELD_CONTEXT_ID, "c1")
            .with(FIELD_USER_ID, "u1")
            .with("post_id", parent)
            .with("score", 3)
    }

    fn key(raw: &str) -> ChannelKey {
        ChannelKey::from_raw(raw)
    }

    #[test]
    fn enumerates_object_channels() {
        let f = fixture();
        let keys: Vec<String> = f
            .dispatcher
            .channels_for("app", &comment("k1", "7"))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            keys,
            vec![
                "blg:app:context:c1:comments",
                "blg:app:context:c1:users:u1:comments",
                "blg:app:post:7:comments",
                "blg:app:users:u1:post:7:comments",
                "blg:app:comments:k1",
            ]
        );
    }

    #[tokio::test]
    async fn delivers_to_subscribed_channels_only() {
        let f = fixture();
        let parent_channel = key("blg:app:post:7:comments");
        f.registry.subscribe(&parent_channel, "d1").await.unwrap();
        f.registry
            .subscribe(&key("blg:app:post:8:comments"), "d2")
            .await
            .unwrap();

        let report = f
            .dispatcher
            .dispatch("app", vec![Mutation::added(comment("k1", "7"))])
            .await;
        assert!(report.errors.is_empty());
        assert_eq!(report.devices_on(&parent_channel), vec!["d1"]);
        assert!(!report.reached("d2"));
        assert_eq!(report.published(), 1);

        let published = f.transport.published("deltas");
        let delta = Delta::decode(&published[0]).unwrap();
        assert_eq!(delta.op, DeltaOp::Add);
        assert_eq!(delta.channels, vec![parent_channel]);
    }

    #[tokio::test]
    async fn nothing_published_without_subscribers() {
        let f = fixture();
        let report = f
            .dispatcher
            .dispatch("app", vec![Mutation::added(comment("k1", "7"))])
            .await;
        assert_eq!(report.routes.len(), 1);
        assert_eq!(report.published(), 0);
        assert!(f.transport.published("deltas").is_empty());
    }

    #[tokio::test]
    async fn filtered_variants_see_matching_objects() {
        let f = fixture();
        let base = key("blg:app:post:7:comments");
        let high = ChannelAddress::new("app")
            .parent(relaybase_protocol::ParentRef::new("post", "7"))
            .model("comment", None)
            .filter(json!({"range": {"score": {"gte": 5}}}))
            .to_key(f.dispatcher.schemas.as_ref())
            .unwrap();
        let deltas = key("blg:app:post:7:comments:deltas");
        f.registry.subscribe(&high, "hi").await.unwrap();
        f.registry.subscribe(&deltas, "dx").await.unwrap();

        let report = f
            .dispatcher
            .dispatch("app", vec![Mutation::added(comment("k1", "7"))])
            .await;
        assert!(!report.reached("hi"));
        assert!(report.reached("dx"));

        let mut loud = comment("k2", "7");
        loud.insert("score", 9);
        let report = f
            .dispatcher
            .dispatch(
                "app",
                vec![Mutation::updated(loud, vec![Patch::replace("comment/k2/score", 9)])],
            )
            .await;
        assert_eq!(report.devices_on(&high), vec!["hi"]);
        assert!(report.devices_on(&base).is_empty());
    }

    #[tokio::test]
    async fn counts_follow_adds_and_deletes() {
        let f = fixture();
        let channel = key("blg:app:context:c1:comments");
        f.registry.set_object_count(&channel, 1).await.unwrap();

        f.dispatcher
            .dispatch(
                "app",
                vec![
                    Mutation::added(comment("k1", "7")),
                    Mutation::added(comment("k2", "7")),
                ],
            )
            .await;
        f.dispatcher
            .dispatch("app", vec![Mutation::deleted(comment("k1", "7"))])
            .await;

        let n = f
            .registry
            .get_object_count(&channel, || async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_per_delta() {
        let f = fixture();
        f.registry
            .subscribe(&key("blg:app:comments:k1"), "d1")
            .await
            .unwrap();
        f.transport.set_connected(false);

        let report = f
            .dispatcher
            .dispatch("app", vec![Mutation::added(comment("k1", "7"))])
            .await;
        assert!(report.routes.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0].error, CoreError::Transport(_)));
    }
}
