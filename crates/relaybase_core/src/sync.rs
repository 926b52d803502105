//! The sync core: writes, reads and subscriptions behind one handle.

use crate::adapter::{
    BatchResult, CountOptions, DocumentObjectStore, ItemError, ObjectRef, ObjectStoreAdapter,
    SearchOptions, UpdatedObjects,
};
use crate::config::CoreConfig;
use crate::dispatcher::{DeltaDispatcher, DispatchReport, Mutation};
use crate::error::{CoreError, CoreResult};
use crate::registry::SubscriptionRegistry;
use crate::schema::SchemaCache;
use crate::transport::{MessageHandler, MessageTransport};
use bytes::Bytes;
use relaybase_protocol::{ApplicationSchema, ChannelAddress, ChannelKey, Object, Patch};
use relaybase_storage::{CountResponse, DocumentStore, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Control messages received on the system queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemMessage {
    /// An application's schema changed.
    ///
    /// With a schema, the cache is refreshed in place; without one the
    /// cached schema is dropped.
    SchemaChanged {
        /// Affected application.
        application_id: String,
        /// New schema, if the sender included it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<ApplicationSchema>,
    },
}

impl SystemMessage {
    /// Encodes to JSON bytes.
    pub fn encode(&self) -> CoreResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn apply(self, schemas: &SchemaCache) {
        match self {
            SystemMessage::SchemaChanged {
                application_id,
                schema: Some(schema),
            } if schema.application_id == application_id => schemas.put(schema),
            SystemMessage::SchemaChanged { application_id, .. } => {
                schemas.invalidate(&application_id);
            }
        }
    }
}

/// Result of a write: the stored objects plus where their deltas went.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome<T> {
    /// Adapter result.
    pub result: BatchResult<T>,
    /// Delta routing.
    pub dispatch: DispatchReport,
}

/// Composition root wiring the adapter, registry, dispatcher and transport.
///
/// Every write runs the adapter first and then dispatches deltas for the
/// objects that were committed. Dispatch failures never undo a write; they
/// are reported in [`WriteOutcome::dispatch`].
///
/// # Example
///
/// ```rust
/// use relaybase_core::{CoreConfig, InMemoryTransport, SchemaCache, SyncCore};
/// use relaybase_protocol::{ApplicationSchema, ChannelAddress, ModelDefinition, Object};
/// use relaybase_storage::{InMemoryDocumentStore, InMemoryStateStore};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let schemas = Arc::new(SchemaCache::new());
/// schemas.put(ApplicationSchema::new("app").with_model(ModelDefinition::new("post")));
/// let core = SyncCore::new(
///     CoreConfig::default(),
///     Arc::new(InMemoryDocumentStore::new()),
///     Arc::new(InMemoryStateStore::new()),
///     Arc::new(InMemoryTransport::new()),
///     schemas,
/// )
/// .unwrap();
///
/// let channel = ChannelAddress::new("app").context("c1").model("post", None);
/// core.subscribe(&channel, "device-1").await.unwrap();
///
/// let post = Object::new("post", "p1").with("context_id", "c1");
/// let outcome = core.create("app", vec![post]).await.unwrap();
/// assert!(outcome.dispatch.reached("device-1"));
/// # }
/// ```
pub struct SyncCore {
    adapter: Arc<dyn ObjectStoreAdapter>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: DeltaDispatcher,
    transport: Arc<dyn MessageTransport>,
    schemas: Arc<SchemaCache>,
    config: Arc<CoreConfig>,
}

impl SyncCore {
    /// Builds a core over a document store.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ServerConfigurationFailure`] if `config` is
    /// invalid.
    pub fn new(
        config: CoreConfig,
        documents: Arc<dyn DocumentStore>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn MessageTransport>,
        schemas: Arc<SchemaCache>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let adapter = Arc::new(DocumentObjectStore::new(
            documents,
            schemas.clone(),
            config.clone(),
        ));
        Ok(Self::assemble(config, adapter, state, transport, schemas))
    }

    /// Builds a core over any adapter.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ServerConfigurationFailure`] if `config` is
    /// invalid.
    pub fn with_adapter(
        config: CoreConfig,
        adapter: Arc<dyn ObjectStoreAdapter>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn MessageTransport>,
        schemas: Arc<SchemaCache>,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self::assemble(
            Arc::new(config),
            adapter,
            state,
            transport,
            schemas,
        ))
    }

    fn assemble(
        config: Arc<CoreConfig>,
        adapter: Arc<dyn ObjectStoreAdapter>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn MessageTransport>,
        schemas: Arc<SchemaCache>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(state, config.clone()));
        let dispatcher = DeltaDispatcher::new(
            registry.clone(),
            transport.clone(),
            schemas.clone(),
            config.clone(),
        );
        Self {
            adapter,
            registry,
            dispatcher,
            transport,
            schemas,
            config,
        }
    }

    /// The schema cache.
    pub fn schemas(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    /// The subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The configuration in use.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Creates objects and dispatches `add` deltas.
    pub async fn create(
        &self,
        application_id: &str,
        objects: Vec<Object>,
    ) -> CoreResult<WriteOutcome<Vec<Object>>> {
        let result = self.adapter.create_objects(application_id, objects).await?;
        let mutations = result.value.iter().cloned().map(Mutation::added).collect();
        let dispatch = self.dispatcher.dispatch(application_id, mutations).await;
        Ok(WriteOutcome { result, dispatch })
    }

    /// Applies patches and dispatches `update` deltas.
    pub async fn update(
        &self,
        application_id: &str,
        patches: Vec<Patch>,
    ) -> CoreResult<WriteOutcome<UpdatedObjects>> {
        let result = self.adapter.update_objects(application_id, patches).await?;
        let mutations = result
            .value
            .values()
            .map(|u| Mutation::updated(u.object.clone(), u.patches.clone()))
            .collect();
        let dispatch = self.dispatcher.dispatch(application_id, mutations).await;
        Ok(WriteOutcome { result, dispatch })
    }

    /// Decodes client-submitted JSON patches and applies the valid ones.
    ///
    /// Patches that fail to decode are reported as
    /// [`CoreError::InvalidPatch`] items targeted `#<position>`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPatch`] if `raw` is not an array.
    pub async fn update_json(
        &self,
        application_id: &str,
        raw: &Value,
    ) -> CoreResult<WriteOutcome<UpdatedObjects>> {
        let items = raw
            .as_array()
            .ok_or_else(|| CoreError::InvalidPatch("patches must be a JSON array".into()))?;

        let mut patches = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();
        for (pos, item) in items.iter().enumerate() {
            match Patch::from_json(item) {
                Ok(patch) => patches.push(patch),
                Err(e) => rejected.push(ItemError::new(format!("#{pos}"), e.into())),
            }
        }

        if patches.is_empty() && !rejected.is_empty() {
            return Ok(WriteOutcome {
                result: BatchResult::new(UpdatedObjects::new(), rejected),
                dispatch: DispatchReport::default(),
            });
        }

        let mut outcome = self.update(application_id, patches).await?;
        rejected.append(&mut outcome.result.errors);
        outcome.result.errors = rejected;
        Ok(outcome)
    }

    /// Deletes objects and dispatches `delete` deltas.
    pub async fn delete(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<WriteOutcome<Vec<Object>>> {
        let result = self.adapter.delete_objects(application_id, ids).await?;
        let mutations = result.value.iter().cloned().map(Mutation::deleted).collect();
        let dispatch = self.dispatcher.dispatch(application_id, mutations).await;
        Ok(WriteOutcome { result, dispatch })
    }

    /// Reads objects by address.
    pub async fn get(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<BatchResult<Vec<Object>>> {
        self.adapter.get_objects(application_id, ids).await
    }

    /// Searches one model.
    pub async fn search(
        &self,
        application_id: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<Object>> {
        self.adapter.search_objects(application_id, options).await
    }

    /// Counts objects of one model.
    pub async fn count(
        &self,
        application_id: &str,
        options: &CountOptions,
    ) -> CoreResult<CountResponse> {
        self.adapter.count_objects(application_id, options).await
    }

    /// Returns the objects a channel currently names.
    pub async fn search_channel(&self, address: &ChannelAddress) -> CoreResult<Vec<Object>> {
        let (_, options) = self.channel_scope(address)?;
        let mut search = SearchOptions::new(options.model);
        search.filter = options.filter;
        self.adapter
            .search_objects(address.application_id(), &search)
            .await
    }

    /// Returns the number of objects a channel names.
    ///
    /// Unsuffixed channels use the cached count, recomputing it on a miss;
    /// filtered channels are always counted directly.
    pub async fn count_channel(&self, address: &ChannelAddress) -> CoreResult<u64> {
        let (key, options) = self.channel_scope(address)?;
        let application_id = address.application_id();
        let adapter = &self.adapter;
        let options = &options;
        let recount = move || async move {
            let counted = adapter.count_objects(application_id, options).await?;
            Ok(counted.count)
        };
        if key.is_variant() {
            return recount().await;
        }
        self.registry.get_object_count(&key, recount).await
    }

    /// Subscribes a device to a channel, returning its canonical key.
    pub async fn subscribe(
        &self,
        address: &ChannelAddress,
        device_id: &str,
    ) -> CoreResult<ChannelKey> {
        let key = address.to_key(self.schemas.as_ref())?;
        self.registry.subscribe(&key, device_id).await?;
        Ok(key)
    }

    /// Unsubscribes a device from a channel, returning its canonical key.
    pub async fn unsubscribe(
        &self,
        address: &ChannelAddress,
        device_id: &str,
    ) -> CoreResult<ChannelKey> {
        let key = address.to_key(self.schemas.as_ref())?;
        self.registry.unsubscribe(&key, device_id).await?;
        Ok(key)
    }

    /// Drops every subscription of a device and its record.
    pub async fn remove_device(&self, device_id: &str) -> CoreResult<Vec<ChannelKey>> {
        self.registry.remove_device(device_id).await
    }

    /// Applies one system message.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the payload is not a system message.
    pub fn handle_system_message(&self, payload: &[u8]) -> CoreResult<SystemMessage> {
        let message = SystemMessage::decode(payload)?;
        info!(?message, "system message");
        message.clone().apply(&self.schemas);
        Ok(message)
    }

    /// Starts consuming the system queue.
    pub fn listen_for_system_messages(&self) {
        let schemas = self.schemas.clone();
        let handler: MessageHandler = Arc::new(move |queue: &str, payload: Bytes| {
            match SystemMessage::decode(&payload) {
                Ok(message) => {
                    debug!(queue, ?message, "system message");
                    message.apply(&schemas);
                }
                Err(e) => error!(queue, error = %e, "unreadable system message"),
            }
        });
        self.transport.on_message(&self.config.system_queue, handler);
    }

    fn channel_scope(&self, address: &ChannelAddress) -> CoreResult<(ChannelKey, CountOptions)> {
        let key = address.to_key(self.schemas.as_ref())?;
        let model = address
            .model_name()
            .ok_or_else(|| CoreError::InvalidChannel("channel names no model".into()))?;
        let mut options = CountOptions::new(model);
        options.filter = Some(address.to_filter()?);
        Ok((key, options))
    }
}
