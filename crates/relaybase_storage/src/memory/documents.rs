//! In-memory document store.

use crate::document::{
    Aggregation, AggregationKind, BulkItem, CountResponse, Document, DocumentStore, Refresh,
    SearchRequest,
};
use crate::error::{StorageError, StorageResult};
use crate::query;
use async_trait::async_trait;
use parking_lot::RwLock;
use relaybase_protocol::{compare_values, Object};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Index {
    /// Latest write of every document.
    latest: BTreeMap<String, Document>,
    /// What searches and counts see.
    visible: BTreeMap<String, Document>,
}

impl Index {
    fn publish(&mut self, id: &str) {
        match self.latest.get(id) {
            Some(doc) => {
                self.visible.insert(id.to_string(), doc.clone());
            }
            None => {
                self.visible.remove(id);
            }
        }
    }
}

/// An in-memory [`DocumentStore`].
///
/// By default every write is searchable immediately. A store built with
/// [`InMemoryDocumentStore::near_real_time`] instead hides
/// [`Refresh::Deferred`] writes from searches until the index is refreshed,
/// the way a search cluster does.
///
/// # Example
///
/// ```rust
/// use relaybase_protocol::Object;
/// use relaybase_storage::{DocumentStore, InMemoryDocumentStore, Refresh};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryDocumentStore::new();
/// store
///     .bulk_write("app.posts", vec![Object::new("post", "1")], Refresh::Deferred)
///     .await
///     .unwrap();
/// let doc = store.get("app.posts", "1").await.unwrap().unwrap();
/// assert_eq!(doc.version, 1);
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    indexes: RwLock<HashMap<String, Index>>,
    auto_refresh: bool,
    available: AtomicBool,
    forced_refreshes: AtomicU64,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            auto_refresh: true,
            available: AtomicBool::new(true),
            forced_refreshes: AtomicU64::new(0),
        }
    }
}

impl InMemoryDocumentStore {
    /// Creates an empty store where writes are searchable immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that only publishes deferred writes on refresh.
    #[must_use]
    pub fn near_real_time() -> Self {
        Self {
            auto_refresh: false,
            ..Self::default()
        }
    }

    /// Simulates the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    /// Number of writes that demanded [`Refresh::Immediate`].
    pub fn forced_refreshes(&self) -> u64 {
        self.forced_refreshes.load(AtomicOrdering::SeqCst)
    }

    /// Number of documents in `index`, including unrefreshed ones.
    pub fn len(&self, index: &str) -> usize {
        self.indexes
            .read()
            .get(index)
            .map_or(0, |idx| idx.latest.len())
    }

    /// Returns true if `index` holds no documents.
    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("document store is down".into()))
        }
    }

    fn publishes(&self, refresh: Refresh) -> bool {
        if refresh == Refresh::Immediate {
            self.forced_refreshes.fetch_add(1, AtomicOrdering::SeqCst);
            return true;
        }
        self.auto_refresh
    }

    fn matching(&self, index: &str, native: &Value) -> StorageResult<Vec<Document>> {
        let indexes = self.indexes.read();
        let Some(idx) = indexes.get(index) else {
            return Ok(Vec::new());
        };
        let mut hits = Vec::new();
        for doc in idx.visible.values() {
            if query::matches(native, &doc.source)? {
                hits.push(doc.clone());
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, index: &str, id: &str) -> StorageResult<Option<Document>> {
        self.check_available()?;
        Ok(self
            .indexes
            .read()
            .get(index)
            .and_then(|idx| idx.latest.get(id))
            .cloned())
    }

    async fn bulk_get(
        &self,
        index: &str,
        ids: &[String],
    ) -> StorageResult<Vec<(String, Option<Document>)>> {
        self.check_available()?;
        let indexes = self.indexes.read();
        let idx = indexes.get(index);
        Ok(ids
            .iter()
            .map(|id| {
                let doc = idx.and_then(|idx| idx.latest.get(id)).cloned();
                (id.clone(), doc)
            })
            .collect())
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: Vec<Object>,
        refresh: Refresh,
    ) -> StorageResult<Vec<BulkItem>> {
        self.check_available()?;
        let publish = self.publishes(refresh);
        let mut indexes = self.indexes.write();
        let idx = indexes.entry(index.to_string()).or_default();

        let mut items = Vec::with_capacity(documents.len());
        for source in documents {
            let Some(id) = source.id().map(str::to_string) else {
                items.push(BulkItem {
                    id: String::new(),
                    result: Err("document has no id".into()),
                });
                continue;
            };
            let version = idx.latest.get(&id).map_or(1, |doc| doc.version + 1);
            idx.latest.insert(id.clone(), Document { source, version });
            if publish {
                idx.publish(&id);
            }
            items.push(BulkItem {
                id,
                result: Ok(version),
            });
        }
        trace!(index, count = items.len(), "bulk write");
        Ok(items)
    }

    async fn conditional_update(
        &self,
        index: &str,
        id: &str,
        document: Object,
        expected_version: u64,
        refresh: Refresh,
    ) -> StorageResult<u64> {
        self.check_available()?;
        let mut indexes = self.indexes.write();
        let current = indexes
            .get(index)
            .and_then(|idx| idx.latest.get(id))
            .map(|doc| doc.version)
            .ok_or_else(|| StorageError::NotFound(format!("{index}/{id}")))?;
        if current != expected_version {
            debug!(index, id, expected_version, current, "version conflict");
            return Err(StorageError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        let publish = self.publishes(refresh);
        let idx = indexes.entry(index.to_string()).or_default();
        let version = current + 1;
        idx.latest.insert(
            id.to_string(),
            Document {
                source: document,
                version,
            },
        );
        if publish {
            idx.publish(id);
        }
        Ok(version)
    }

    async fn bulk_delete(
        &self,
        index: &str,
        ids: &[String],
        refresh: Refresh,
    ) -> StorageResult<Vec<Document>> {
        self.check_available()?;
        let publish = self.publishes(refresh);
        let mut indexes = self.indexes.write();
        let Some(idx) = indexes.get_mut(index) else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for id in ids {
            if let Some(doc) = idx.latest.remove(id) {
                removed.push(doc);
            }
            if publish {
                idx.publish(id);
            }
        }
        Ok(removed)
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<Vec<Document>> {
        self.check_available()?;
        let mut hits = self.matching(index, &request.query)?;
        if !request.sort.is_empty() {
            hits.sort_by(|a, b| {
                request
                    .sort
                    .iter()
                    .map(|key| {
                        let ord = query::compare_field(&a.source, &b.source, &key.field);
                        if key.descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        let size = request.size.unwrap_or(usize::MAX);
        Ok(hits.into_iter().skip(request.from).take(size).collect())
    }

    async fn count(
        &self,
        index: &str,
        query: &Value,
        aggregation: Option<&Aggregation>,
    ) -> StorageResult<CountResponse> {
        self.check_available()?;
        let hits = self.matching(index, query)?;
        let aggregation = aggregation.map(|agg| aggregate(&hits, agg));
        Ok(CountResponse {
            count: hits.len() as u64,
            aggregation,
        })
    }

    async fn refresh(&self, index: &str) -> StorageResult<()> {
        self.check_available()?;
        if let Some(idx) = self.indexes.write().get_mut(index) {
            idx.visible = idx.latest.clone();
        }
        Ok(())
    }
}

fn aggregate(hits: &[Document], aggregation: &Aggregation) -> Value {
    let values: Vec<&Value> = hits
        .iter()
        .filter_map(|doc| doc.source.get(&aggregation.field))
        .filter(|v| !v.is_null())
        .collect();

    match aggregation.kind {
        AggregationKind::Sum => Value::from(values.iter().filter_map(|v| v.as_f64()).sum::<f64>()),
        AggregationKind::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregationKind::Min => extreme(&values, Ordering::Less),
        AggregationKind::Max => extreme(&values, Ordering::Greater),
        AggregationKind::Cardinality => {
            let distinct: BTreeSet<String> = values.iter().map(|v| v.to_string()).collect();
            Value::from(distinct.len() as u64)
        }
    }
}

fn extreme(values: &[&Value], wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for value in values {
        best = match best {
            Some(current) if compare_values(value, current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    best.cloned().unwrap_or(Value::Null)
}
