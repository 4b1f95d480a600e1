//! In-Memory Remote Store
//!
//! A last-writer-wins store with the same shape as the hosted database:
//! project-scoped groups, items keyed by owning group, cascade deletes and
//! a broadcast change feed. Used by tests and by hosts running offline
//! demos. Faults can be injected per operation kind.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Semaphore};

use super::traits::{ChangeFeed, RecordFilter, Repository};
use crate::domain::{ChangeEvent, ChangeOp, DomainError, DomainResult, Group, GroupId, Item, ItemId};

const FEED_CAPACITY: usize = 1024;

/// Request kinds, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Fetch,
    Insert,
    Update,
    Delete,
}

impl RemoteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteOp::Fetch => "fetch",
            RemoteOp::Insert => "insert",
            RemoteOp::Update => "update",
            RemoteOp::Delete => "delete",
        }
    }
}

#[derive(Default)]
struct RemoteState {
    groups: HashMap<GroupId, Group>,
    items: HashMap<ItemId, Item>,
    regenerate_ids: bool,
    /// Remaining successful calls before the next injected failure
    faults: HashMap<RemoteOp, usize>,
    calls: HashMap<RemoteOp, usize>,
    gate: Option<Arc<Semaphore>>,
}

impl RemoteState {
    fn begin(&mut self, op: RemoteOp) -> DomainResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op) {
            Some(0) => {
                self.faults.remove(&op);
                Err(DomainError::Internal(format!("{} rejected by remote store", op.as_str())))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Ids of `roots` and every group below them
    fn subtree(&self, roots: &[GroupId]) -> HashSet<GroupId> {
        let mut found: HashSet<GroupId> = roots.iter().copied().filter(|id| self.groups.contains_key(id)).collect();
        let mut frontier: Vec<GroupId> = found.iter().copied().collect();
        while let Some(current) = frontier.pop() {
            for group in self.groups.values() {
                if group.parent_id == Some(current) && found.insert(group.id) {
                    frontier.push(group.id);
                }
            }
        }
        found
    }
}

/// Shared in-process remote store
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    feed: StdMutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_feed_capacity(FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(RemoteState::default()),
            feed: StdMutex::new(Some(tx)),
        }
    }

    /// Load rows without emitting change events
    pub async fn seed(&self, groups: Vec<Group>, items: Vec<Item>) {
        let mut state = self.state.lock().await;
        for group in groups {
            state.groups.insert(group.id, group);
        }
        for item in items {
            state.items.insert(item.id, item);
        }
    }

    /// Let `successes` more calls of `op` through, then reject the next one
    pub async fn fail_after(&self, op: RemoteOp, successes: usize) {
        self.state.lock().await.faults.insert(op, successes);
    }

    pub async fn fail_next(&self, op: RemoteOp) {
        self.fail_after(op, 0).await;
    }

    /// Ignore client-supplied ids on insert
    pub async fn set_regenerate_ids(&self, regenerate: bool) {
        self.state.lock().await.regenerate_ids = regenerate;
    }

    /// Block every write until a permit is added to the returned semaphore
    pub async fn hold_writes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().await.gate = Some(gate.clone());
        gate
    }

    pub async fn release_writes(&self) {
        if let Some(gate) = self.state.lock().await.gate.take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub async fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.state.lock().await.groups.values().cloned().collect()
    }

    pub async fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.state.lock().await.items.values().cloned().collect();
        items.sort_by_key(|i| (i.group_id, i.position));
        items
    }

    /// Drop the feed sender; subscribers see the channel close
    pub fn close_feed(&self) {
        if let Ok(mut feed) = self.feed.lock() {
            feed.take();
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        let Ok(feed) = self.feed.lock() else {
            return;
        };
        if let Some(tx) = feed.as_ref() {
            for event in events {
                // No subscribers is fine
                let _ = tx.send(event);
            }
        }
    }

    async fn pass_gate(&self) {
        let gate = self.state.lock().await.gate.clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl Repository<Group> for MemoryRemote {
    async fn fetch(&self, filter: &RecordFilter) -> DomainResult<Vec<Group>> {
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Fetch)?;

        let mut groups: Vec<Group> = state
            .groups
            .values()
            .filter(|g| filter.project_id.as_ref().map_or(true, |p| &g.project_id == p))
            .filter(|g| filter.group_ids.as_ref().map_or(true, |ids| ids.contains(&g.id)))
            .cloned()
            .collect();
        groups.sort_by_key(|g| (g.level, g.position));
        Ok(groups)
    }

    async fn insert(&self, records: &[Group]) -> DomainResult<Vec<Group>> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Insert)?;

        let mut stored = Vec::with_capacity(records.len());
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let mut group = record.clone();
            if state.regenerate_ids || state.groups.contains_key(&group.id) {
                group.id = GroupId::new();
            }
            state.groups.insert(group.id, group.clone());
            events.push(ChangeEvent::group(ChangeOp::Insert, None, Some(group.clone()), Some(group.updated_by.clone())));
            stored.push(group);
        }
        drop(state);

        self.publish(events);
        Ok(stored)
    }

    async fn update(&self, record: &Group) -> DomainResult<Group> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Update)?;

        let before = state
            .groups
            .get(&record.id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("Group {} not found", record.id)))?;
        state.groups.insert(record.id, record.clone());
        drop(state);

        self.publish(vec![ChangeEvent::group(
            ChangeOp::Update,
            Some(before),
            Some(record.clone()),
            Some(record.updated_by.clone()),
        )]);
        Ok(record.clone())
    }

    async fn delete(&self, ids: &[GroupId]) -> DomainResult<()> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Delete)?;

        // Cascade to descendant groups and their items
        let doomed = state.subtree(ids);
        let doomed_items: Vec<ItemId> = state
            .items
            .values()
            .filter(|i| doomed.contains(&i.group_id))
            .map(|i| i.id)
            .collect();

        let mut events = Vec::new();
        for id in doomed_items {
            if let Some(item) = state.items.remove(&id) {
                events.push(ChangeEvent::item(ChangeOp::Delete, Some(item), None, None));
            }
        }
        for id in doomed {
            if let Some(group) = state.groups.remove(&id) {
                events.push(ChangeEvent::group(ChangeOp::Delete, Some(group), None, None));
            }
        }
        drop(state);

        self.publish(events);
        Ok(())
    }
}

#[async_trait]
impl Repository<Item> for MemoryRemote {
    async fn fetch(&self, filter: &RecordFilter) -> DomainResult<Vec<Item>> {
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Fetch)?;

        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|i| filter.group_ids.as_ref().map_or(true, |ids| ids.contains(&i.group_id)))
            .filter(|i| {
                filter.project_id.as_ref().map_or(true, |p| {
                    state.groups.get(&i.group_id).map_or(false, |g| &g.project_id == p)
                })
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.group_id, i.position));
        Ok(items)
    }

    async fn insert(&self, records: &[Item]) -> DomainResult<Vec<Item>> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Insert)?;

        // Reject the whole batch if any owner is missing
        if let Some(orphan) = records.iter().find(|i| !state.groups.contains_key(&i.group_id)) {
            return Err(DomainError::Conflict(format!("Group {} does not exist", orphan.group_id)));
        }

        let mut stored = Vec::with_capacity(records.len());
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let mut item = record.clone();
            if state.regenerate_ids || state.items.contains_key(&item.id) {
                item.id = ItemId::new();
            }
            state.items.insert(item.id, item.clone());
            events.push(ChangeEvent::item(ChangeOp::Insert, None, Some(item.clone()), Some(item.updated_by.clone())));
            stored.push(item);
        }
        drop(state);

        self.publish(events);
        Ok(stored)
    }

    async fn update(&self, record: &Item) -> DomainResult<Item> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Update)?;

        if !state.groups.contains_key(&record.group_id) {
            return Err(DomainError::Conflict(format!("Group {} does not exist", record.group_id)));
        }
        let before = state
            .items
            .get(&record.id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("Item {} not found", record.id)))?;
        state.items.insert(record.id, record.clone());
        drop(state);

        self.publish(vec![ChangeEvent::item(
            ChangeOp::Update,
            Some(before),
            Some(record.clone()),
            Some(record.updated_by.clone()),
        )]);
        Ok(record.clone())
    }

    async fn delete(&self, ids: &[ItemId]) -> DomainResult<()> {
        self.pass_gate().await;
        let mut state = self.state.lock().await;
        state.begin(RemoteOp::Delete)?;

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = state.items.remove(id) {
                events.push(ChangeEvent::item(ChangeOp::Delete, Some(item), None, None));
            }
        }
        drop(state);

        self.publish(events);
        Ok(())
    }
}

impl ChangeFeed for MemoryRemote {
    /// The feed is store-wide; subscribers filter by project themselves
    fn subscribe(&self, _project_id: &str) -> DomainResult<broadcast::Receiver<ChangeEvent>> {
        let feed = self
            .feed
            .lock()
            .map_err(|_| DomainError::Internal("change feed poisoned".to_string()))?;
        feed.as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| DomainError::Internal("change feed closed".to_string()))
    }
}
