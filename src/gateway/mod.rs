//! Mutation Gateway
//!
//! `Organizer` is the one entry point for changing the hierarchy. Every
//! mutation follows the same sequence:
//! - validate preconditions (locks, permissions, uniqueness, depth)
//! - apply optimistically to the Entity Store
//! - write to the remote store in chunks, tagging echoes first
//! - roll back whatever the remote did not confirm
//! - record the inverse on the undo stack
//!
//! The operations are split by concern:
//! - item_ops: add / remove / move items
//! - group_ops: create / update / clone / delete / lock groups
//! - group_hierarchy: moving a group under a new parent
//! - field_ops: custom field values
//! - inverse: undo dispatch

mod field_ops;
mod group_hierarchy;
mod group_ops;
mod inverse;
mod item_ops;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::EngineConfig;
use crate::domain::{resolve_permissions, Action, ChangeEvent, DomainError, Entity, Group, GroupId, Item, ItemId};
use crate::echo::{EchoKey, EchoSet, EchoSource};
use crate::error::{OrganizerError, OrganizerResult, ValidationError};
use crate::realtime::Reconciler;
use crate::repository::{RecordFilter, RemoteStore, Repository};
use crate::store::{EntityStore, Forest};
use crate::undo::{UndoEntry, UndoStack};

pub use item_ops::AddOutcome;

/// Transient user-facing messages
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Another collaborator changed the hierarchy and the view was refreshed
    RemoteChange { actor: Option<String> },
    /// A multi-chunk write advanced
    Progress {
        operation: &'static str,
        done: usize,
        total: usize,
    },
    /// A remote write failed and the local change was undone
    RolledBack { operation: &'static str, message: String },
    /// The change feed is gone; the view will no longer follow remote edits
    RealtimeStopped { reason: String },
}

/// Whether a mutation pushes its inverse onto the undo stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum History {
    Record,
    /// Used while undoing, so inverses never stack up
    Skip,
}

/// Outcome of a chunked remote write
pub(crate) struct Batch<T: Entity> {
    /// Rows as the remote store holds them
    pub confirmed: Vec<T>,
    /// Local rows the remote never accepted
    pub unconfirmed: Vec<T>,
    /// (local id, stored id) for inserted rows
    pub renames: Vec<(T::Id, T::Id)>,
    pub error: Option<DomainError>,
}

impl<T: Entity> Batch<T> {
    fn new() -> Self {
        Self {
            confirmed: Vec::new(),
            unconfirmed: Vec::new(),
            renames: Vec::new(),
            error: None,
        }
    }
}

pub struct Organizer<S: RemoteStore> {
    pub(crate) remote: Arc<S>,
    pub(crate) config: EngineConfig,
    pub(crate) store: EntityStore,
    pub(crate) undo: UndoStack,
    pub(crate) echoes: EchoSet,
    pub(crate) reconciler: Reconciler,
    pub(crate) feed: Option<broadcast::Receiver<ChangeEvent>>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<S: RemoteStore> Organizer<S> {
    /// Build an engine and the receiving end of its notices
    pub fn new(remote: Arc<S>, config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let organizer = Self {
            store: EntityStore::new(),
            undo: UndoStack::new(config.undo_capacity),
            echoes: EchoSet::new(config.echo_ttl()),
            reconciler: Reconciler::new(config.refresh_debounce()),
            feed: None,
            remote,
            config,
            notices,
        };
        (organizer, rx)
    }

    // ========================
    // Accessors
    // ========================

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn principal(&self) -> &str {
        &self.config.principal
    }

    pub fn forest(&self) -> Forest {
        self.store.forest()
    }

    /// Receive a rebuilt forest after every Entity Store change
    pub fn watch_forest(&self) -> watch::Receiver<Forest> {
        self.store.subscribe()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// What `undo` would revert next
    pub fn next_undo(&self) -> Option<&'static str> {
        self.undo.peek().map(UndoEntry::label)
    }

    pub fn clear_undo(&mut self) {
        self.undo.clear();
    }

    pub fn pending_echoes(&self) -> usize {
        self.echoes.len()
    }

    pub fn is_live(&self) -> bool {
        self.feed.is_some()
    }

    // ========================
    // Loading
    // ========================

    /// Initial load: fetch the visible hierarchy and start following changes.
    ///
    /// A failing subscription does not fail the load; the engine keeps
    /// working on the fetched state.
    pub async fn load(&mut self) -> OrganizerResult<()> {
        self.refresh().await?;
        if let Err(e) = self.subscribe_feed() {
            warn!("Realtime unavailable for project {}: {}", self.config.project_id, e);
            self.notify(Notice::RealtimeStopped { reason: e.to_string() });
        }
        Ok(())
    }

    /// Re-fetch groups and items and swap them in
    pub async fn refresh(&mut self) -> OrganizerResult<()> {
        let filter = RecordFilter::project(self.config.project_id.clone());
        let groups = Repository::<Group>::fetch(self.remote.as_ref(), &filter)
            .await
            .map_err(OrganizerError::RemoteRead)?;
        let groups = visible_to(groups, &self.config.principal);

        let items = if groups.is_empty() {
            Vec::new()
        } else {
            let filter = RecordFilter::groups(groups.iter().map(|g| g.id));
            Repository::<Item>::fetch(self.remote.as_ref(), &filter)
                .await
                .map_err(OrganizerError::RemoteRead)?
        };

        debug!("Loaded {} groups and {} items", groups.len(), items.len());
        self.store.replace_all(groups, items);
        Ok(())
    }

    /// Open the change feed
    pub fn subscribe_feed(&mut self) -> OrganizerResult<()> {
        let rx = self
            .remote
            .subscribe(&self.config.project_id)
            .map_err(OrganizerError::Realtime)?;
        self.feed = Some(rx);
        info!("Following changes for project {}", self.config.project_id);
        Ok(())
    }

    // ========================
    // Preconditions
    // ========================

    pub(crate) fn require_group(&self, id: GroupId) -> Result<&Group, ValidationError> {
        self.store
            .group(id)
            .ok_or_else(|| ValidationError::NotFound(format!("Group {} not found", id)))
    }

    pub(crate) fn require_item(&self, id: ItemId) -> Result<&Item, ValidationError> {
        self.store
            .item(id)
            .ok_or_else(|| ValidationError::NotFound(format!("Item {} not found", id)))
    }

    /// The group and all of its ancestors must be free of foreign locks
    pub(crate) fn check_unlocked(&self, id: GroupId) -> Result<(), ValidationError> {
        let group = self.require_group(id)?;
        for g in std::iter::once(group).chain(self.store.ancestors(id)) {
            if let Some(by) = g.locked_against(&self.config.principal) {
                return Err(ValidationError::Locked {
                    group: g.id,
                    by: by.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Like `check_unlocked`, plus every descendant
    pub(crate) fn check_subtree_unlocked(&self, id: GroupId) -> Result<(), ValidationError> {
        self.check_unlocked(id)?;
        for gid in self.store.descendants(id) {
            if let Some(by) = self.store.group(gid).and_then(|g| g.locked_against(&self.config.principal)) {
                return Err(ValidationError::Locked {
                    group: gid,
                    by: by.to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_permission(&self, id: GroupId, action: Action) -> Result<(), ValidationError> {
        let group = self.require_group(id)?;
        if resolve_permissions(group, &self.config.principal).allows(action) {
            Ok(())
        } else {
            Err(ValidationError::PermissionDenied {
                principal: self.config.principal.clone(),
                action,
            })
        }
    }

    /// Lock and permission check for acting on one group
    pub(crate) fn guard(&self, id: GroupId, action: Action) -> Result<(), ValidationError> {
        self.check_unlocked(id)?;
        self.check_permission(id, action)
    }

    // ========================
    // Remote writes
    // ========================

    pub(crate) fn notify(&self, notice: Notice) {
        // Nobody listening is fine
        let _ = self.notices.send(notice);
    }

    pub(crate) fn record(&mut self, history: History, entry: UndoEntry) {
        if history == History::Record {
            debug!("Recorded undo entry: {}", entry.label());
            self.undo.push(entry);
        }
    }

    /// Report a fully rolled-back write
    pub(crate) fn rolled_back(&self, operation: &'static str, error: DomainError) -> OrganizerError {
        warn!("{} failed, local change rolled back: {}", operation, error);
        self.notify(Notice::RolledBack {
            operation,
            message: error.to_string(),
        });
        OrganizerError::RemoteWrite(error)
    }

    /// Report a write that stopped part way
    pub(crate) fn partially_saved(
        &self,
        operation: &'static str,
        confirmed: usize,
        failed: usize,
        error: DomainError,
    ) -> OrganizerError {
        warn!("{} stopped after {} rows, {} rolled back: {}", operation, confirmed, failed, error);
        self.notify(Notice::RolledBack {
            operation,
            message: format!("{} of {} rows were not saved: {}", failed, confirmed + failed, error),
        });
        OrganizerError::PartialBatch {
            confirmed,
            failed,
            source: error,
        }
    }

    fn progress(&self, operation: &'static str, done: usize, total: usize) {
        if total > self.config.batch_size {
            self.notify(Notice::Progress { operation, done, total });
        }
    }

    fn chunked<T: Clone>(&self, rows: &[T]) -> std::vec::IntoIter<Vec<T>> {
        rows.chunks(self.config.batch_size.max(1))
            .map(<[T]>::to_vec)
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Insert rows chunk by chunk, stopping at the first rejected chunk
    pub(crate) async fn insert_rows<T>(&mut self, operation: &'static str, rows: Vec<T>) -> Batch<T>
    where
        T: Entity + EchoSource,
        S: Repository<T>,
    {
        let total = rows.len();
        let mut batch = Batch::new();
        let mut chunks = self.chunked(&rows);

        while let Some(chunk) = chunks.next() {
            let keys: Vec<EchoKey> = chunk.iter().map(EchoSource::echo_key).collect();
            self.echoes.tag_all(keys.iter().cloned());

            match Repository::<T>::insert(self.remote.as_ref(), &chunk).await {
                Ok(stored) => {
                    for (local, saved) in chunk.iter().zip(stored.iter()) {
                        // A regenerated id echoes back under its new key
                        let (old_key, new_key) = (local.echo_key(), saved.echo_key());
                        if old_key != new_key {
                            self.echoes.untag_all([old_key]);
                            self.echoes.tag(new_key);
                        }
                        batch.renames.push((local.id(), saved.id()));
                    }
                    batch.confirmed.extend(stored);
                    self.progress(operation, batch.confirmed.len(), total);
                }
                Err(e) => {
                    self.echoes.untag_all(keys);
                    batch.unconfirmed.extend(chunk);
                    batch.unconfirmed.extend(chunks.by_ref().flatten());
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }

    /// Update rows one request each, reporting progress per chunk
    pub(crate) async fn update_rows<T>(&mut self, operation: &'static str, rows: Vec<T>) -> Batch<T>
    where
        T: Entity + EchoSource,
        S: Repository<T>,
    {
        let total = rows.len();
        let mut batch = Batch::new();
        let mut chunks = self.chunked(&rows);

        while let Some(chunk) = chunks.next() {
            self.echoes.tag_all(chunk.iter().map(EchoSource::echo_key));

            let mut pending = chunk.into_iter();
            while let Some(row) = pending.next() {
                match Repository::<T>::update(self.remote.as_ref(), &row).await {
                    Ok(saved) => batch.confirmed.push(saved),
                    Err(e) => {
                        let rest: Vec<T> = std::iter::once(row).chain(pending.by_ref()).collect();
                        self.echoes.untag_all(rest.iter().map(EchoSource::echo_key));
                        batch.unconfirmed.extend(rest);
                        batch.unconfirmed.extend(chunks.by_ref().flatten());
                        batch.error = Some(e);
                        return batch;
                    }
                }
            }
            self.progress(operation, batch.confirmed.len(), total);
        }
        batch
    }

    /// Delete rows by id, chunk by chunk
    pub(crate) async fn delete_rows<T>(&mut self, operation: &'static str, rows: Vec<T>) -> Batch<T>
    where
        T: Entity + EchoSource,
        S: Repository<T>,
    {
        let total = rows.len();
        let mut batch = Batch::new();
        let mut chunks = self.chunked(&rows);

        while let Some(chunk) = chunks.next() {
            let keys: Vec<EchoKey> = chunk.iter().map(EchoSource::echo_key).collect();
            let ids: Vec<T::Id> = chunk.iter().map(Entity::id).collect();
            self.echoes.tag_all(keys.iter().cloned());

            match Repository::<T>::delete(self.remote.as_ref(), &ids).await {
                Ok(()) => {
                    batch.confirmed.extend(chunk);
                    self.progress(operation, batch.confirmed.len(), total);
                }
                Err(e) => {
                    self.echoes.untag_all(keys);
                    batch.unconfirmed.extend(chunk);
                    batch.unconfirmed.extend(chunks.by_ref().flatten());
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }

    /// Remove a confirmed change again after a later step failed.
    ///
    /// Best effort: a failure here is logged, the caller is already
    /// reporting the original error.
    pub(crate) async fn compensate_groups(&mut self, rows: Vec<Group>) {
        if rows.is_empty() {
            return;
        }
        let batch = self.update_rows("compensate", rows).await;
        if let Some(e) = batch.error {
            warn!("Compensating write left {} groups diverged: {}", batch.unconfirmed.len(), e);
        }
    }

    pub(crate) async fn compensate_inserted_groups(&mut self, ids: Vec<GroupId>) {
        if ids.is_empty() {
            return;
        }
        self.echoes.tag_all(ids.iter().map(|id| EchoKey::Group(*id)));
        if let Err(e) = Repository::<Group>::delete(self.remote.as_ref(), &ids).await {
            warn!("Could not remove {} partially restored groups: {}", ids.len(), e);
        }
    }
}

/// Groups whose tree root the principal may see
fn visible_to(groups: Vec<Group>, principal: &str) -> Vec<Group> {
    let by_id: HashMap<GroupId, &Group> = groups.iter().map(|g| (g.id, g)).collect();
    let admitted: HashSet<GroupId> = groups
        .iter()
        .filter(|g| {
            let root = root_within(&by_id, g);
            root.visibility.admits(principal, &root.created_by)
        })
        .map(|g| g.id)
        .collect();
    groups.into_iter().filter(|g| admitted.contains(&g.id)).collect()
}

fn root_within<'a>(by_id: &HashMap<GroupId, &'a Group>, group: &'a Group) -> &'a Group {
    let mut current = group;
    let mut hops = 0;
    while let Some(parent) = current.parent_id.and_then(|p| by_id.get(&p).copied()) {
        current = parent;
        hops += 1;
        if hops > by_id.len() {
            break;
        }
    }
    current
}

/// First value that appears twice
pub(crate) fn first_duplicate<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = HashSet::new();
    values.into_iter().find(|v| !seen.insert(*v))
}
