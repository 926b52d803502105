//! Object persistence.
//!
//! [`ObjectStoreAdapter`] is the seam between the sync core and a concrete
//! document backend. Batch operations report per-item failures next to the
//! items that succeeded; only whole-request failures are returned as `Err`.

mod document;
mod query;

pub use document::DocumentObjectStore;
pub use query::{scoped_query, to_native};

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use relaybase_protocol::{Filter, Object, Patch};
use relaybase_storage::{Aggregation, CountResponse, SortField};
use std::collections::BTreeMap;
use std::fmt;

/// Address of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Model name.
    pub model: String,
    /// Object id.
    pub id: String,
}

impl ObjectRef {
    /// Creates an object reference.
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.id)
    }
}

/// A failure of one item in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemError {
    /// The object, patch path or position the error belongs to.
    pub target: String,
    /// What went wrong.
    pub error: CoreError,
}

impl ItemError {
    /// Creates an item error.
    pub fn new(target: impl Into<String>, error: CoreError) -> Self {
        Self {
            target: target.into(),
            error,
        }
    }
}

/// Outcome of a batch operation: what succeeded plus what failed.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    /// Successful items.
    pub value: T,
    /// Failed items.
    pub errors: Vec<ItemError>,
}

impl<T> BatchResult<T> {
    /// Creates a result.
    pub fn new(value: T, errors: Vec<ItemError>) -> Self {
        Self { value, errors }
    }

    /// Returns true if no item failed.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// An object after an update, with the patches that were applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedObject {
    /// Object as written.
    pub object: Object,
    /// Patches applied, in submission order.
    pub patches: Vec<Patch>,
}

/// Updated objects keyed by address.
pub type UpdatedObjects = BTreeMap<ObjectRef, UpdatedObject>;

/// Parameters of a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Model to search.
    pub model: String,
    /// Filter tree; `None` matches every object of the model.
    pub filter: Option<Filter>,
    /// Sort keys.
    pub sort: Vec<SortField>,
    /// Hits to skip.
    pub offset: usize,
    /// Maximum hits.
    pub limit: Option<usize>,
}

impl SearchOptions {
    /// Searches every object of `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filter: None,
            sort: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort_by(mut self, sort: SortField) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets paging.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Parameters of a count.
#[derive(Debug, Clone, PartialEq)]
pub struct CountOptions {
    /// Model to count.
    pub model: String,
    /// Filter tree; `None` counts every object of the model.
    pub filter: Option<Filter>,
    /// Aggregation to compute over the matching objects.
    pub aggregation: Option<Aggregation>,
}

impl CountOptions {
    /// Counts every object of `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filter: None,
            aggregation: None,
        }
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the aggregation.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }
}

/// Persistence of application objects.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    /// Reads objects. Missing ones are reported as
    /// [`CoreError::ObjectNotFound`].
    async fn get_objects(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<BatchResult<Vec<Object>>>;

    /// Stores new objects, stamping timestamps and tenant linkage.
    ///
    /// A failed write to one index is reported per object; objects stored
    /// in other indexes are still returned.
    async fn create_objects(
        &self,
        application_id: &str,
        objects: Vec<Object>,
    ) -> CoreResult<BatchResult<Vec<Object>>>;

    /// Applies patches, retrying objects that a concurrent writer changed.
    ///
    /// A store failure stops further retries. The failing target and every
    /// target still pending carry that error, while objects already
    /// committed are returned as updated.
    async fn update_objects(
        &self,
        application_id: &str,
        patches: Vec<Patch>,
    ) -> CoreResult<BatchResult<UpdatedObjects>>;

    /// Deletes objects, returning their last state.
    async fn delete_objects(
        &self,
        application_id: &str,
        ids: &[ObjectRef],
    ) -> CoreResult<BatchResult<Vec<Object>>>;

    /// Searches one model.
    async fn search_objects(
        &self,
        application_id: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<Object>>;

    /// Counts objects of one model.
    async fn count_objects(
        &self,
        application_id: &str,
        options: &CountOptions,
    ) -> CoreResult<CountResponse>;
}
