//! [`ObjectStoreAdapter`] over a [`DocumentStore`].

use super::query::scoped_query;
use super::{
    BatchResult, CountOptions, ItemError, ObjectRef, ObjectStoreAdapter, SearchOptions,
    UpdatedObject, UpdatedObjects,
};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::schema::{index_name, SchemaCache};
use async_trait::async_trait;
use futures::future::join_all;
use relaybase_protocol::{
    apply_patches, is_system_field, now_millis, parent_field, ApplicationSchema,
    ModelDefinition, Object, Patch, Timestamp, FIELD_APPLICATION_ID, FIELD_PARENT,
};
use relaybase_storage::{
    CountResponse, Document, DocumentStore, Refresh, SearchRequest, StorageError,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One object with the patches still to apply to it.
struct PendingUpdate {
    target: ObjectRef,
    model: ModelDefinition,
    patches: Vec<Patch>,
}

enum Attempt {
    Written(Object),
    Conflict,
    Failed(CoreError),
}

/// Stores objects in a [`DocumentStore`], one index per model namespace.
///
/// Index names are `<application_id>.<namespace>`. Writes to built-in
/// models are refreshed immediately so that lookups by user or context see
/// them at once.
pub struct DocumentObjectStore {
    documents: Arc<dyn DocumentStore>,
    schemas: Arc<SchemaCache>,
    config: Arc<CoreConfig>,
}

impl DocumentObjectStore {
    /// Creates an adapter.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        schemas: Arc<SchemaCache>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            documents,
            schemas,
            config,
        }
    }

    fn check_batch(&self, application_id: &str, len: usize) -> CoreResult<Arc<ApplicationSchema>> {
        if application_id.is_empty() {
            return Err(CoreError::InvalidFieldValue("application id is empty".into()));
        }
        if len == 0 {
            return Err(CoreError::InvalidFieldValue("batch is empty".into()));
        }
        if len > self.config.max_batch_size {
            return Err(CoreError::InvalidFieldValue(format!(
                "batch of {len} exceeds the limit of {}",
                self.config.max_batch_size
            )));
        }
        self.schemas.require(application_id)
    }

    /// Validates and stamps one object for creation.
    fn prepare(
        &self,
        schema: &ApplicationSchema,
        mut object: Object,
        now: Timestamp,
    ) -> Result<(ModelDefinition, Object), CoreError> {
        let invalid = |msg: String| CoreError::InvalidFieldValue(msg);

        match object.id() {
            Some(id) if !id.is_empty() => {}
            _ => return Err(invalid("object has no id".into())),
        }
        let model_name = match object.model() {
            Some(model) if !model.is_empty() => model.to_string(),
            _ => return Err(invalid("object has no type".into())),
        };
        let model = schema
            .model(&model_name)
            .cloned()
            .ok_or_else(|| invalid(format!("unknown model {model_name}")))?;

        if let Some(parent) = object.remove(FIELD_PARENT) {
            let declared = model
                .parent
                .as_deref()
                .ok_or_else(|| invalid(format!("model {model_name} has no parent")))?;
            let (parent_model, parent_id) = match &parent {
                Value::Object(p) => (
                    p.get("model").and_then(Value::as_str),
                    p.get("id").and_then(Value::as_str),
                ),
                _ => (None, None),
            };
            match (parent_model, parent_id) {
                (Some(m), Some(id)) if m == declared && !id.is_empty() => {
                    object.insert(parent_field(declared), id);
                }
                _ => {
                    return Err(invalid(format!(
                        "parent must be {{\"model\": \"{declared}\", \"id\": ...}}"
                    )))
                }
            }
        }

        if !model.is_builtin() && object.context_id().map_or(true, str::is_empty) {
            return Err(invalid(format!("{model_name} objects need a context_id")));
        }
        if let Some(field) = object
            .fields()
            .keys()
            .find(|f| !is_system_field(f) && !model.declares(f))
        {
            return Err(invalid(format!("{model_name} does not declare field {field}")));
        }

        object.insert(FIELD_APPLICATION_ID, schema.application_id.as_str());
        object.stamp_created(now);
        Ok((model, object))
    }

    fn refresh_for(model: &ModelDefinition) -> Refresh {
        if model.is_builtin() {
            Refresh::Immediate
        } else {
            Refresh::Deferred
        }
    }

    /// Reads objects, grouping lookups per index.
    async fn read(
        &self,
        schema: &ApplicationSchema,
        ids: &[ObjectRef],
    ) -> CoreResult<(Vec<Option<Document>>, Vec<ItemError>)> {
        let application_id = schema.application_id.as_str();
        let mut found: Vec<Option<Document>> = vec![None; ids.len()];
        let mut errors = Vec::new();
        let mut by_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (pos, target) in ids.iter().enumerate() {
            match schema.model(&target.model) {
                Some(model) => by_index
                    .entry(index_name(application_id, &model.namespace))
                    .or_default()
                    .push(pos),
                None => errors.push(ItemError::new(
                    target.to_string(),
                    CoreError::InvalidFieldValue(format!("unknown model {}", target.model)),
                )),
            }
        }

        let lookups = by_index.iter().map(|(index, positions)| {
            let keys: Vec<String> = positions.iter().map(|&p| ids[p].id.clone()).collect();
            async move { self.documents.bulk_get(index, &keys).await }
        });
        for (positions, result) in by_index.values().zip(join_all(lookups).await) {
            for (&pos, (_, doc)) in positions.iter().zip(result?) {
                let target = &ids[pos];
                match doc {
                    Some(doc) if doc.source.model() == Some(target.model.as_str()) => {
                        found[pos] = Some(doc);
                    }
                    _ => errors.push(ItemError::new(
                        target.to_string(),
                        CoreError::ObjectNotFound(target.to_string()),
                    )),
                }
            }
        }
        Ok((found, errors))
    }

    /// Reads, patches and conditionally writes one object.
    async fn attempt_update(
        &self,
        application_id: &str,
        pending: &PendingUpdate,
    ) -> CoreResult<Attempt> {
        let index = index_name(application_id, &pending.model.namespace);
        let Some(current) = self.documents.get(&index, &pending.target.id).await? else {
            return Ok(Attempt::Failed(CoreError::ObjectNotFound(
                pending.target.to_string(),
            )));
        };
        let next = match apply_patches(
            &current.source,
            &pending.patches,
            Some(&pending.model),
            now_millis(),
        ) {
            Ok(next) => next,
            Err(e) => return Ok(Attempt::Failed(e.into())),
        };

        match self
            .documents
            .conditional_update(
                &index,
                &pending.target.id,
                next.clone(),
                current.version,
                Self::refresh_for(&pending.model),
            )
            .await
        {
            Ok(_) => Ok(Attempt::Written(next)),
            Err(StorageError::VersionConflict { .. }) => Ok(Attempt::Conflict),
            Err(StorageError::NotFound(_)) => Ok(Attempt::Failed(CoreError::ObjectNotFound(
                pending.target.to_string(),
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Groups patches by target in first-seen order, rejecting bad ones.
    fn group_patches(
        schema: &ApplicationSchema,
        patches: Vec<Patch>,
        errors: &mut Vec<ItemError>,
    ) -> Vec<PendingUpdate> {
        let mut groups: Vec<PendingUpdate> = Vec::new();
        let mut positions: HashMap<ObjectRef, usize> = HashMap::new();

        for patch in patches {
            let path = match patch.target() {
                Ok(path) => path,
                Err(e) => {
                    errors.push(ItemError::new(patch.path.clone(), e.into()));
                    continue;
                }
            };
            let Some(model) = schema.model(&path.model) else {
                errors.push(ItemError::new(
                    patch.path.clone(),
                    CoreError::InvalidPatch(format!("unknown model {}", path.model)),
                ));
                continue;
            };
            if !model.declares(&path.field) {
                errors.push(ItemError::new(
                    patch.path.clone(),
                    CoreError::InvalidPatch(format!(
                        "{} does not declare field {}",
                        path.model, path.field
                    )),
                ));
                continue;
            }

            let target = ObjectRef::new(path.model, path.id);
            match positions.get(&target) {
                Some(&pos) => groups[pos].patches.push(patch),
                None => {
                    positions.insert(target.clone(), groups.len());
                    groups.push(PendingUpdate {
                        target,
                        model: model.clone(),
                        patches: vec![patch],
                    });
                }
            }
        }
        groups
    }
}

#[async_trait]
impl ObjectStoreAdapter for DocumentObjectStore {
    async fn get_objects(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<BatchResult<Vec<Object>>> {
        let schema = self.check_batch(application_id, ids.len())?;
        let (found, errors) = self.read(&schema, ids).await?;
        let objects = found.into_iter().flatten().map(|doc| doc.source).collect();
        Ok(BatchResult::new(objects, errors))
    }

    async fn create_objects(
        &self,
        application_id: &str,
        objects: Vec<Object>,
    ) -> CoreResult<BatchResult<Vec<Object>>> {
        let schema = self.check_batch(application_id, objects.len())?;
        let now = now_millis();
        let mut errors = Vec::new();
        let mut groups: BTreeMap<String, (Refresh, Vec<Object>)> = BTreeMap::new();

        for (pos, object) in objects.into_iter().enumerate() {
            let label = object
                .id()
                .map_or_else(|| format!("#{pos}"), str::to_string);
            match self.prepare(&schema, object, now) {
                Ok((model, object)) => {
                    let group = groups
                        .entry(index_name(application_id, &model.namespace))
                        .or_insert_with(|| (Refresh::Deferred, Vec::new()));
                    if model.is_builtin() {
                        group.0 = Refresh::Immediate;
                    }
                    group.1.push(object);
                }
                Err(e) => {
                    warn!(app = application_id, object = %label, error = %e, "skipping object");
                    errors.push(ItemError::new(label, e));
                }
            }
        }

        let writes = groups.into_iter().map(|(index, (refresh, batch))| async move {
            let result = self
                .documents
                .bulk_write(&index, batch.clone(), refresh)
                .await;
            (index, batch, result)
        });

        let mut created = Vec::new();
        for (index, batch, result) in join_all(writes).await {
            let items = match result {
                Ok(items) => items,
                Err(e) => {
                    error!(index = %index, error = %e, "bulk write failed");
                    let e = CoreError::from(e);
                    for object in batch {
                        let label = object.id().unwrap_or_default().to_string();
                        errors.push(ItemError::new(label, e.clone()));
                    }
                    continue;
                }
            };
            for (object, item) in batch.into_iter().zip(items) {
                match item.result {
                    Ok(_) => created.push(object),
                    Err(reason) => errors.push(ItemError::new(
                        item.id,
                        CoreError::InvalidFieldValue(reason),
                    )),
                }
            }
        }

        info!(
            app = application_id,
            created = created.len(),
            failed = errors.len(),
            "objects created"
        );
        Ok(BatchResult::new(created, errors))
    }

    async fn update_objects(
        &self,
        application_id: &str,
        patches: Vec<Patch>,
    ) -> CoreResult<BatchResult<UpdatedObjects>> {
        let schema = self.check_batch(application_id, patches.len())?;
        let mut errors = Vec::new();
        let mut pending = Self::group_patches(&schema, patches, &mut errors);
        let mut updated = UpdatedObjects::new();
        let attempts = self.config.max_conflict_retries;
        let mut fatal: Option<CoreError> = None;

        for attempt in 0..attempts {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                warn!(
                    app = application_id,
                    attempt,
                    conflicts = pending.len(),
                    "retrying conflicting updates"
                );
                self.config.retry.backoff(attempt).await;
            }

            let results =
                join_all(pending.iter().map(|p| self.attempt_update(application_id, p))).await;

            let mut conflicts = Vec::new();
            for (update, result) in pending.into_iter().zip(results) {
                let result = match result {
                    Ok(result) => result,
                    Err(e) => {
                        error!(app = application_id, target = %update.target, error = %e, "update failed");
                        errors.push(ItemError::new(update.target.to_string(), e.clone()));
                        fatal = Some(e);
                        continue;
                    }
                };
                match result {
                    Attempt::Written(object) => {
                        debug!(app = application_id, target = %update.target, "object updated");
                        updated.insert(
                            update.target,
                            UpdatedObject {
                                object,
                                patches: update.patches,
                            },
                        );
                    }
                    Attempt::Conflict => conflicts.push(update),
                    Attempt::Failed(e) => {
                        debug!(app = application_id, target = %update.target, error = %e, "update rejected");
                        errors.push(ItemError::new(update.target.to_string(), e));
                    }
                }
            }
            pending = conflicts;
            if fatal.is_some() {
                break;
            }
        }

        // Targets still pending share the store failure.
        if let Some(e) = fatal {
            for update in pending.drain(..) {
                errors.push(ItemError::new(update.target.to_string(), e.clone()));
            }
        }

        for update in pending {
            warn!(app = application_id, target = %update.target, attempts, "giving up on update");
            errors.push(ItemError::new(
                update.target.to_string(),
                CoreError::ConcurrencyExhausted {
                    target: update.target.to_string(),
                    attempts,
                },
            ));
        }

        info!(
            app = application_id,
            updated = updated.len(),
            failed = errors.len(),
            "objects updated"
        );
        Ok(BatchResult::new(updated, errors))
    }

    async fn delete_objects(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<BatchResult<Vec<Object>>> {
        let schema = self.check_batch(application_id, ids.len())?;
        let (found, mut errors) = self.read(&schema, ids).await?;

        let mut by_index: BTreeMap<String, (Refresh, Vec<String>)> = BTreeMap::new();
        for (target, doc) in ids.iter().zip(&found) {
            if doc.is_none() {
                continue;
            }
            let Some(model) = schema.model(&target.model) else {
                continue;
            };
            let group = by_index
                .entry(index_name(application_id, &model.namespace))
                .or_insert_with(|| (Refresh::Deferred, Vec::new()));
            if model.is_builtin() {
                group.0 = Refresh::Immediate;
            }
            group.1.push(target.id.clone());
        }

        let deletes = by_index.iter().map(|(index, (refresh, keys))| async move {
            self.documents.bulk_delete(index, keys, *refresh).await
        });
        let mut deleted: Vec<Object> = Vec::new();
        for result in join_all(deletes).await {
            deleted.extend(result?.into_iter().map(|doc| doc.source));
        }

        for (target, doc) in ids.iter().zip(found) {
            let Some(doc) = doc else { continue };
            let gone = deleted
                .iter()
                .any(|o| o.id() == doc.source.id() && o.model() == doc.source.model());
            if !gone {
                errors.push(ItemError::new(
                    target.to_string(),
                    CoreError::ObjectNotFound(target.to_string()),
                ));
            }
        }

        info!(
            app = application_id,
            deleted = deleted.len(),
            failed = errors.len(),
            "objects deleted"
        );
        Ok(BatchResult::new(deleted, errors))
    }

    async fn search_objects(
        &self,
        application_id: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<Object>> {
        let schema = self.schemas.require(application_id)?;
        let model = schema
            .model(&options.model)
            .ok_or_else(|| CoreError::QueryError(format!("unknown model {}", options.model)))?;
        let request = SearchRequest {
            query: scoped_query(application_id, &model.name, options.filter.as_ref())?,
            sort: options.sort.clone(),
            from: options.offset,
            size: options.limit,
        };
        let hits = self
            .documents
            .search(&index_name(application_id, &model.namespace), &request)
            .await?;
        debug!(app = application_id, model = %model.name, hits = hits.len(), "search");
        Ok(hits.into_iter().map(|doc| doc.source).collect())
    }

    async fn count_objects(
        &self,
        application_id: &str,
        options: &CountOptions,
    ) -> CoreResult<CountResponse> {
        let schema = self.schemas.require(application_id)?;
        let model = schema
            .model(&options.model)
            .ok_or_else(|| CoreError::QueryError(format!("unknown model {}", options.model)))?;
        let query = scoped_query(application_id, &model.name, options.filter.as_ref())?;
        Ok(self
            .documents
            .count(
                &index_name(application_id, &model.namespace),
                &query,
                options.aggregation.as_ref(),
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use relaybase_protocol::{FieldType, Filter, ParentRef, FIELD_CONTEXT_ID};
    use relaybase_storage::InMemoryDocumentStore;
    use serde_json::json;

    struct Fixture {
        adapter: DocumentObjectStore,
        documents: Arc<InMemoryDocumentStore>,
    }

    fn fixture_with(documents: InMemoryDocumentStore) -> Fixture {
        let documents = Arc::new(documents);
        let schemas = Arc::new(SchemaCache::new());
        schemas.put(
            ApplicationSchema::new("app")
                .with_model(ModelDefinition::new("post").with_namespace("posts"))
                .with_model(
                    ModelDefinition::new("comment")
                        .with_namespace("comments")
                        .with_parent("post")
                        .with_field("body", FieldType::String)
                        .with_field("tags", FieldType::Set),
                ),
        );
        let config = CoreConfig::new().with_retry(RetryConfig::immediate());
        Fixture {
            adapter: DocumentObjectStore::new(documents.clone(), schemas, Arc::new(config)),
            documents,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(InMemoryDocumentStore::new())
    }

    fn post(id: &str) -> Object {
        Object::new("post", id).with(FIELD_CONTEXT_ID, "c1")
    }

    #[tokio::test]
    async fn create_stamps_and_links() {
        let f = fixture();
        let comment = Object::new("comment", "k1")
            .with(FIELD_CONTEXT_ID, "c1")
            .with("body", "hi")
            .with(FIELD_PARENT, json!(ParentRef::new("post", "7")));

        let result = f.adapter.create_objects("app", vec![comment]).await.unwrap();
        assert!(result.is_complete());
        let stored = &result.value[0];
        assert_eq!(stored.application_id(), Some("app"));
        assert_eq!(stored.parent_id("post"), Some("7"));
        assert!(!stored.contains(FIELD_PARENT));
        assert!(stored.created().is_some());
        assert_eq!(stored.created(), stored.modified());
        assert_eq!(f.documents.len("app.comments"), 1);
    }

    #[tokio::test]
    async fn create_skips_bad_objects() {
        let f = fixture();
        let mut no_id = post("x");
        no_id.remove("id");
        let result = f
            .adapter
            .create_objects(
                "app",
                vec![
                    no_id,
                    Object::new("ghost", "g").with(FIELD_CONTEXT_ID, "c1"),
                    Object::new("post", "no-context"),
                    Object::new("comment", "k").with(FIELD_CONTEXT_ID, "c1").with("rating", 3),
                    post("ok"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result.value.len(), 1);
        assert_eq!(result.errors.len(), 4);
        assert_eq!(result.errors[0].target, "#0");
        assert!(result
            .errors
            .iter()
            .all(|e| matches!(e.error, CoreError::InvalidFieldValue(_))));
    }

    #[tokio::test]
    async fn builtin_models_force_refresh() {
        let f = fixture();
        f.adapter
            .create_objects("app", vec![post("1")])
            .await
            .unwrap();
        assert_eq!(f.documents.forced_refreshes(), 0);
        f.adapter
            .create_objects("app", vec![Object::new("user", "u1")])
            .await
            .unwrap();
        assert_eq!(f.documents.forced_refreshes(), 1);
    }

    #[tokio::test]
    async fn empty_batches_and_unknown_apps() {
        let f = fixture();
        assert!(matches!(
            f.adapter.create_objects("app", vec![]).await,
            Err(CoreError::InvalidFieldValue(_))
        ));
        assert!(matches!(
            f.adapter.get_objects("app", &[]).await,
            Err(CoreError::InvalidFieldValue(_))
        ));
        assert!(matches!(
            f.adapter.create_objects("nope", vec![post("1")]).await,
            Err(CoreError::ServerConfigurationFailure(_))
        ));
    }

    #[tokio::test]
    async fn get_reports_missing() {
        let f = fixture();
        f.adapter.create_objects("app", vec![post("1")]).await.unwrap();
        let result = f
            .adapter
            .get_objects("app", &[ObjectRef::new("post", "1"), ObjectRef::new("post", "2")])
            .await
            .unwrap();
        assert_eq!(result.value.len(), 1);
        assert_eq!(
            result.errors,
            vec![ItemError::new(
                "post/2",
                CoreError::ObjectNotFound("post/2".into())
            )]
        );
    }

    #[tokio::test]
    async fn update_folds_patches_per_object() {
        let f = fixture();
        f.adapter
            .create_objects("app", vec![post("1").with("views", 0), post("2")])
            .await
            .unwrap();

        let result = f
            .adapter
            .update_objects(
                "app",
                vec![
                    Patch::increment("post/1/views", 3),
                    Patch::replace("post/2/title", "x"),
                    Patch::increment("post/1/views", 3),
                    Patch::replace("post/1/id", "hijack"),
                ],
            )
            .await
            .unwrap();
        assert!(result.is_complete());
        let one = &result.value[&ObjectRef::new("post", "1")];
        assert_eq!(one.object.get("views"), Some(&json!(6)));
        assert_eq!(one.object.id(), Some("1"));
        assert_eq!(one.patches.len(), 3);

        let stored = f.documents.get("app.posts", "1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.source.get("views"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn update_reports_per_item_failures() {
        let f = fixture();
        f.adapter
            .create_objects(
                "app",
                vec![post("1").with("title", "t"), Object::new("comment", "k").with(FIELD_CONTEXT_ID, "c1")],
            )
            .await
            .unwrap();

        let result = f
            .adapter
            .update_objects(
                "app",
                vec![
                    Patch::replace("post/1", "x"),
                    Patch::replace("post/404/title", "x"),
                    Patch::increment("post/1/title", 1),
                    Patch::replace("comment/k/rating", 5),
                    Patch::append("comment/k/tags", "a"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(result.value.len(), 1);
        assert!(result.value.contains_key(&ObjectRef::new("comment", "k")));
        let kinds: Vec<_> = result.errors.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(kinds, vec!["post/1", "comment/k/rating", "post/404", "post/1"]);
        assert!(matches!(result.errors[0].error, CoreError::InvalidPatch(_)));
        assert!(matches!(result.errors[2].error, CoreError::ObjectNotFound(_)));
        assert!(matches!(result.errors[3].error, CoreError::InvalidPatch(_)));
    }

    #[tokio::test]
    async fn delete_returns_last_state() {
        let f = fixture();
        f.adapter.create_objects("app", vec![post("1")]).await.unwrap();
        let ids = [ObjectRef::new("post", "1")];

        let result = f.adapter.delete_objects("app", &ids).await.unwrap();
        assert_eq!(result.value.len(), 1);
        assert!(result.is_complete());

        let replay = f.adapter.delete_objects("app", &ids).await.unwrap();
        assert!(replay.value.is_empty());
        assert!(matches!(
            replay.errors[0].error,
            CoreError::ObjectNotFound(_)
        ));
    }

    #[tokio::test]
    async fn search_and_count_are_scoped() {
        let f = fixture();
        f.adapter
            .create_objects(
                "app",
                vec![
                    post("1").with("score", 3),
                    post("2").with("score", 9),
                    post("3").with("score", 5),
                ],
            )
            .await
            .unwrap();

        let hits = f
            .adapter
            .search_objects(
                "app",
                &SearchOptions::new("post")
                    .with_filter(Filter::Range {
                        field: "score".into(),
                        bounds: relaybase_protocol::RangeBounds {
                            gte: Some(json!(4)),
                            ..Default::default()
                        },
                    })
                    .sort_by(relaybase_storage::SortField::asc("score")),
            )
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().filter_map(Object::id).collect();
        assert_eq!(ids, vec!["3", "2"]);

        let count = f
            .adapter
            .count_objects("app", &CountOptions::new("post"))
            .await
            .unwrap();
        assert_eq!(count.count, 3);

        assert!(matches!(
            f.adapter
                .search_objects("app", &SearchOptions::new("post").with_filter(Filter::Or(vec![])))
                .await,
            Err(CoreError::QueryError(_))
        ));
    }

    #[tokio::test]
    async fn store_outage_is_fatal() {
        let f = fixture();
        f.adapter.create_objects("app", vec![post("1")]).await.unwrap();
        f.documents.set_available(false);
        let err = f
            .adapter
            .update_objects("app", vec![Patch::replace("post/1/title", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::Unavailable(_))));
    }
}
