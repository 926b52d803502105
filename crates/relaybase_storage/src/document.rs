//! Document store contract.

use crate::error::StorageResult;
use async_trait::async_trait;
use relaybase_protocol::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document body.
    pub source: Object,
    /// Monotonic per-document version, starting at 1.
    pub version: u64,
}

/// Visibility requirement for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Refresh {
    /// The write becomes searchable on the store's own schedule.
    #[default]
    Deferred,
    /// The write is searchable as soon as the call returns.
    Immediate,
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// Document id.
    pub id: String,
    /// New version, or the reason the document was rejected.
    pub result: Result<u64, String>,
}

/// A sort key for searches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// Field to sort on.
    pub field: String,
    /// Sort descending.
    #[serde(default)]
    pub descending: bool,
}

impl SortField {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// A search against one index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRequest {
    /// Native query; see [`crate::query`].
    pub query: Value,
    /// Sort keys, applied in order.
    pub sort: Vec<SortField>,
    /// Number of hits to skip.
    pub from: usize,
    /// Maximum number of hits to return.
    pub size: Option<usize>,
}

impl SearchRequest {
    /// Creates a request for `query` with no sort or paging.
    pub fn new(query: Value) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }
}

/// Aggregation function computed alongside a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Number of distinct values.
    Cardinality,
}

/// An aggregation over one field of the matching documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Function to compute.
    pub kind: AggregationKind,
    /// Field to aggregate.
    pub field: String,
}

/// Result of a count.
#[derive(Debug, Clone, PartialEq)]
pub struct CountResponse {
    /// Number of matching documents.
    pub count: u64,
    /// Aggregation value, when one was requested.
    pub aggregation: Option<Value>,
}

/// Indexed, versioned JSON document storage.
///
/// Indexes are created implicitly on first write. Searches only see
/// documents that have been refreshed; `get` always sees the latest write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads one document.
    async fn get(&self, index: &str, id: &str) -> StorageResult<Option<Document>>;

    /// Reads several documents, preserving request order.
    async fn bulk_get(
        &self,
        index: &str,
        ids: &[String],
    ) -> StorageResult<Vec<(String, Option<Document>)>>;

    /// Writes documents unconditionally, keyed by their `id` field.
    async fn bulk_write(
        &self,
        index: &str,
        documents: Vec<Object>,
        refresh: Refresh,
    ) -> StorageResult<Vec<BulkItem>>;

    /// Replaces a document only if its stored version is `expected_version`.
    ///
    /// Returns the new version. Fails with `VersionConflict` if another
    /// writer got there first and `NotFound` if the document is gone.
    async fn conditional_update(
        &self,
        index: &str,
        id: &str,
        document: Object,
        expected_version: u64,
        refresh: Refresh,
    ) -> StorageResult<u64>;

    /// Deletes documents, returning the ones that existed.
    async fn bulk_delete(
        &self,
        index: &str,
        ids: &[String],
        refresh: Refresh,
    ) -> StorageResult<Vec<Document>>;

    /// Runs a native query.
    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<Vec<Document>>;

    /// Counts documents matching a native query.
    async fn count(
        &self,
        index: &str,
        query: &Value,
        aggregation: Option<&Aggregation>,
    ) -> StorageResult<CountResponse>;

    /// Makes all pending writes in `index` searchable.
    async fn refresh(&self, index: &str) -> StorageResult<()>;
}
