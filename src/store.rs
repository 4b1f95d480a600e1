//! Entity Store
//!
//! Single owned container for the loaded groups and items. Only the
//! mutation gateway and the realtime reconciler write to it (the writers
//! are `pub(crate)`); every write rebuilds the forest and publishes it on a
//! watch channel for renderers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::{FieldDef, Group, GroupId, Item, ItemId};
use crate::tree::{build_forest, GroupNode};

/// The published view: a rebuilt forest
pub type Forest = Arc<Vec<GroupNode>>;

/// Saved rows of the groups touched by a mutation
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    groups: Vec<(GroupId, Option<Group>)>,
    item_lists: Vec<(GroupId, Option<Vec<Item>>)>,
}

pub struct EntityStore {
    groups: HashMap<GroupId, Group>,
    /// Per group, ordered by position
    items: HashMap<GroupId, Vec<Item>>,
    revision: u64,
    forest_tx: watch::Sender<Forest>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (forest_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            groups: HashMap::new(),
            items: HashMap::new(),
            revision: 0,
            forest_tx,
        }
    }

    /// Receive a fresh forest after every change
    pub fn subscribe(&self) -> watch::Receiver<Forest> {
        self.forest_tx.subscribe()
    }

    /// Bumped on every write
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The most recently published forest
    pub fn forest(&self) -> Forest {
        self.forest_tx.borrow().clone()
    }

    // ========================
    // Reads
    // ========================

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn items_of(&self, group_id: GroupId) -> &[Item] {
        self.items.get(&group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_items(&self) -> impl Iterator<Item = &Item> {
        self.items.values().flatten()
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.all_items().find(|i| i.id == id)
    }

    /// Children of `parent` (None = roots), ordered by position
    pub fn children_of(&self, parent: Option<GroupId>) -> Vec<&Group> {
        let mut children: Vec<&Group> = self.groups.values().filter(|g| g.parent_id == parent).collect();
        children.sort_by_key(|g| (g.position, g.name.clone()));
        children
    }

    /// Parent chain from the direct parent up to the root
    pub fn ancestors(&self, id: GroupId) -> Vec<&Group> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.groups.get(&id).and_then(|g| g.parent_id);
        while let Some(parent_id) = current {
            if !seen.insert(parent_id) {
                break;
            }
            match self.groups.get(&parent_id) {
                Some(parent) => {
                    chain.push(parent);
                    current = parent.parent_id;
                }
                None => break,
            }
        }
        chain
    }

    pub fn root_of(&self, id: GroupId) -> Option<&Group> {
        self.ancestors(id).last().copied().or_else(|| self.groups.get(&id))
    }

    /// Every group below `id`, parents before children
    pub fn descendants(&self, id: GroupId) -> Vec<GroupId> {
        let mut result = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for child in self.children_of(Some(current)) {
                if seen.insert(child.id) {
                    result.push(child.id);
                    queue.push_back(child.id);
                }
            }
        }
        result
    }

    /// `id` followed by its descendants
    pub fn subtree(&self, id: GroupId) -> Vec<GroupId> {
        let mut ids = vec![id];
        ids.extend(self.descendants(id));
        ids
    }

    /// Depth of the deepest descendant below `id` (0 for a leaf)
    pub fn subtree_height(&self, id: GroupId) -> u8 {
        let Some(group) = self.groups.get(&id) else {
            return 0;
        };
        self.descendants(id)
            .iter()
            .filter_map(|d| self.groups.get(d))
            .map(|d| d.level.saturating_sub(group.level))
            .max()
            .unwrap_or(0)
    }

    pub fn next_group_position(&self, parent: Option<GroupId>) -> i32 {
        self.groups
            .values()
            .filter(|g| g.parent_id == parent)
            .map(|g| g.position + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn next_item_position(&self, group_id: GroupId) -> i32 {
        self.items_of(group_id).iter().map(|i| i.position + 1).max().unwrap_or(0)
    }

    /// Schema inherited from the tree root
    pub fn effective_schema(&self, id: GroupId) -> &[FieldDef] {
        self.root_of(id).map(|root| root.custom_fields.as_slice()).unwrap_or(&[])
    }

    /// Topmost group at or above `id` that disallows duplicate elements
    pub fn uniqueness_scope(&self, id: GroupId) -> Option<GroupId> {
        let own = self.groups.get(&id).filter(|g| g.unique_elements).map(|g| g.id);
        self.ancestors(id)
            .into_iter()
            .rev()
            .find(|g| g.unique_elements)
            .map(|g| g.id)
            .or(own)
    }

    /// Element references of every item in the subtree rooted at `id`
    pub fn subtree_element_refs(&self, id: GroupId) -> Vec<String> {
        self.subtree(id)
            .into_iter()
            .flat_map(|gid| self.items_of(gid).iter().map(|i| i.element_ref.clone()))
            .collect()
    }

    /// Viewer selection minus elements already placed.
    ///
    /// "Placed" means in the group itself, or anywhere in its uniqueness
    /// scope when one applies.
    pub fn new_elements_for(&self, group_id: GroupId, selection: &[String]) -> Vec<String> {
        let present: HashSet<String> = match self.uniqueness_scope(group_id) {
            Some(scope) => self.subtree_element_refs(scope).into_iter().collect(),
            None => self.items_of(group_id).iter().map(|i| i.element_ref.clone()).collect(),
        };
        let mut seen = HashSet::new();
        selection
            .iter()
            .filter(|e| !present.contains(*e) && seen.insert(e.as_str()))
            .cloned()
            .collect()
    }

    // ========================
    // Writes
    // ========================

    pub(crate) fn upsert_group(&mut self, group: Group) {
        self.groups.insert(group.id, group);
        self.changed();
    }

    pub(crate) fn upsert_groups(&mut self, groups: Vec<Group>) {
        for group in groups {
            self.groups.insert(group.id, group);
        }
        self.changed();
    }

    /// Remove groups together with their item lists
    pub(crate) fn remove_groups(&mut self, ids: &[GroupId]) {
        for id in ids {
            self.groups.remove(id);
            self.items.remove(id);
        }
        self.changed();
    }

    /// Insert items into their owning groups' lists
    pub(crate) fn insert_items(&mut self, items: Vec<Item>) {
        for item in items {
            self.place(item);
        }
        self.changed();
    }

    /// Replace items by id, moving them between lists when the owner changed
    pub(crate) fn update_items(&mut self, items: Vec<Item>) {
        for item in items {
            self.detach(item.id);
            self.place(item);
        }
        self.changed();
    }

    /// Remove items by id, returning the removed rows
    pub(crate) fn remove_items(&mut self, ids: &[ItemId]) -> Vec<Item> {
        let removed: Vec<Item> = ids.iter().filter_map(|id| self.detach(*id)).collect();
        self.changed();
        removed
    }

    /// Rename a group id, carrying its items and children along
    pub(crate) fn adopt_group_id(&mut self, old: GroupId, new: GroupId) {
        if old == new {
            return;
        }
        if let Some(mut group) = self.groups.remove(&old) {
            group.id = new;
            self.groups.insert(new, group);
        }
        for group in self.groups.values_mut() {
            if group.parent_id == Some(old) {
                group.parent_id = Some(new);
            }
        }
        if let Some(mut items) = self.items.remove(&old) {
            for item in &mut items {
                item.group_id = new;
            }
            self.items.insert(new, items);
        }
        self.changed();
    }

    pub(crate) fn adopt_item_ids(&mut self, pairs: &[(ItemId, ItemId)]) {
        let renames: HashMap<ItemId, ItemId> = pairs.iter().filter(|(a, b)| a != b).copied().collect();
        if renames.is_empty() {
            return;
        }
        for item in self.items.values_mut().flatten() {
            if let Some(new) = renames.get(&item.id) {
                item.id = *new;
            }
        }
        self.changed();
    }

    /// Swap in a freshly fetched state
    pub(crate) fn replace_all(&mut self, groups: Vec<Group>, items: Vec<Item>) {
        self.groups = groups.into_iter().map(|g| (g.id, g)).collect();
        self.items.clear();
        for item in items {
            self.place(item);
        }
        self.changed();
    }

    /// Save the rows of `group_ids` and their item lists
    pub(crate) fn checkpoint(&self, group_ids: &[GroupId]) -> Checkpoint {
        let mut cp = Checkpoint::default();
        let mut seen = HashSet::new();
        for id in group_ids {
            if seen.insert(*id) {
                cp.groups.push((*id, self.groups.get(id).cloned()));
                cp.item_lists.push((*id, self.items.get(id).cloned()));
            }
        }
        cp
    }

    /// Put back exactly what a checkpoint saved
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        for (id, group) in checkpoint.groups {
            match group {
                Some(group) => {
                    self.groups.insert(id, group);
                }
                None => {
                    self.groups.remove(&id);
                }
            }
        }
        for (id, list) in checkpoint.item_lists {
            match list {
                Some(list) => {
                    self.items.insert(id, list);
                }
                None => {
                    self.items.remove(&id);
                }
            }
        }
        self.changed();
    }

    fn place(&mut self, item: Item) {
        let list = self.items.entry(item.group_id).or_default();
        let at = list.partition_point(|i| i.position <= item.position);
        list.insert(at, item);
    }

    fn detach(&mut self, id: ItemId) -> Option<Item> {
        for list in self.items.values_mut() {
            if let Some(pos) = list.iter().position(|i| i.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    fn changed(&mut self) {
        self.revision += 1;
        let forest = build_forest(self.groups.values(), &self.items);
        self.forest_tx.send_replace(Arc::new(forest));
    }
}
