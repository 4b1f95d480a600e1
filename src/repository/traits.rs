//! Repository Layer - Core Traits
//!
//! Defines the abstract interfaces of the remote store.
//! Implementations can be a hosted database, in-memory, etc.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{ChangeEvent, DomainResult, Entity, Group, GroupId, Item};

/// Selection passed to `Repository::fetch`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Groups: rows of this project only
    pub project_id: Option<String>,
    /// Groups: rows with these ids. Items: rows owned by these groups.
    pub group_ids: Option<Vec<GroupId>>,
}

impl RecordFilter {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            group_ids: None,
        }
    }

    pub fn groups(group_ids: impl IntoIterator<Item = GroupId>) -> Self {
        Self {
            project_id: None,
            group_ids: Some(group_ids.into_iter().collect()),
        }
    }
}

/// Core repository trait for one record collection
///
/// Generic over any Entity type.
/// All operations are async request/response calls.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Fetch rows matching a filter
    async fn fetch(&self, filter: &RecordFilter) -> DomainResult<Vec<T>>;

    /// Insert one or more rows; returns the stored rows (ids may be regenerated)
    async fn insert(&self, records: &[T]) -> DomainResult<Vec<T>>;

    /// Update an existing row by id
    async fn update(&self, record: &T) -> DomainResult<T>;

    /// Delete rows by id
    async fn delete(&self, ids: &[T::Id]) -> DomainResult<()>;
}

/// Push subscription to the store's change notifications
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, project_id: &str) -> DomainResult<broadcast::Receiver<ChangeEvent>>;
}

/// Everything the engine needs from the remote side
pub trait RemoteStore: Repository<Group> + Repository<Item> + ChangeFeed {}

impl<T> RemoteStore for T where T: Repository<Group> + Repository<Item> + ChangeFeed {}
