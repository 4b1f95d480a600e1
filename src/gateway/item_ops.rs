//! Item Operations
//!
//! Adding viewer elements to a group, removing them, and moving them
//! between groups.

use std::collections::HashSet;

use log::info;

use super::{History, Organizer};
use crate::domain::{Action, DomainResult, GroupId, Item, ItemCandidate, ItemId};
use crate::error::{OrganizerError, OrganizerResult, ValidationError};
use crate::repository::{RecordFilter, RemoteStore, Repository};
use crate::undo::{ItemMove, UndoEntry};

/// Result of `add_items`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOutcome {
    /// Ids of the stored items
    pub added: Vec<ItemId>,
    /// Candidates already placed in the group's uniqueness scope (locally
    /// or remotely) or repeated within the call. Without a scope nothing is
    /// skipped: an element may sit in the same group twice.
    pub skipped: usize,
}

impl<S: RemoteStore> Organizer<S> {
    /// Add elements to a group.
    ///
    /// When the group lies in a uniqueness scope, elements already placed
    /// anywhere in it are skipped rather than rejected, and the remote store
    /// is consulted too, so an element another client placed a moment ago is
    /// skipped even before its notification arrives. Outside a scope every
    /// candidate is added.
    pub async fn add_items(&mut self, group_id: GroupId, candidates: Vec<ItemCandidate>) -> OrganizerResult<AddOutcome> {
        self.guard(group_id, Action::AddItems)?;

        let offered = candidates.len();
        let scope = self.store.uniqueness_scope(group_id);
        let fresh: Vec<ItemCandidate> = match scope {
            Some(scope) => {
                let mut present: HashSet<String> = self.store.subtree_element_refs(scope).into_iter().collect();
                candidates
                    .into_iter()
                    .filter(|c| present.insert(c.element_ref.clone()))
                    .collect()
            }
            None => candidates,
        };
        let mut skipped = offered - fresh.len();
        if fresh.is_empty() {
            return Ok(AddOutcome { added: Vec::new(), skipped });
        }

        let start = self.store.next_item_position(group_id);
        let principal = self.config.principal.clone();
        let rows: Vec<Item> = fresh
            .into_iter()
            .enumerate()
            .map(|(i, candidate)| Item::from_candidate(candidate, group_id, start + i as i32, &principal))
            .collect();

        let checkpoint = self.store.checkpoint(&[group_id]);
        self.store.insert_items(rows.clone());

        let rows = match scope {
            Some(scope) => match self.remote_items_in(scope).await {
                Ok(remote) => {
                    let remote: HashSet<String> = remote.into_iter().map(|i| i.element_ref).collect();
                    let (taken, kept): (Vec<Item>, Vec<Item>) =
                        rows.into_iter().partition(|i| remote.contains(&i.element_ref));
                    if !taken.is_empty() {
                        info!("{} element(s) were placed in group {} elsewhere, skipping", taken.len(), scope);
                        skipped += taken.len();
                        let ids: Vec<ItemId> = taken.iter().map(|i| i.id).collect();
                        self.store.remove_items(&ids);
                    }
                    kept
                }
                Err(e) => {
                    self.store.restore(checkpoint);
                    return Err(OrganizerError::RemoteRead(e));
                }
            },
            None => rows,
        };
        if rows.is_empty() {
            return Ok(AddOutcome { added: Vec::new(), skipped });
        }

        let batch = self.insert_rows("add items", rows).await;
        self.store.adopt_item_ids(&batch.renames);
        let added: Vec<ItemId> = batch.confirmed.iter().map(|i| i.id).collect();

        if let Some(error) = batch.error {
            if added.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back("add items", error));
            }
            let failed: Vec<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            self.store.remove_items(&failed);
            let confirmed = added.len();
            self.record(History::Record, UndoEntry::AddItems { group_id, item_ids: added });
            return Err(self.partially_saved("add items", confirmed, failed.len(), error));
        }

        info!("Added {} item(s) to group {} ({} skipped)", added.len(), group_id, skipped);
        self.record(
            History::Record,
            UndoEntry::AddItems {
                group_id,
                item_ids: added.clone(),
            },
        );
        Ok(AddOutcome { added, skipped })
    }

    /// Remove items; returns how many were removed
    pub async fn remove_items(&mut self, ids: &[ItemId]) -> OrganizerResult<usize> {
        self.remove_items_with(ids, History::Record).await
    }

    pub(crate) async fn remove_items_with(&mut self, ids: &[ItemId], history: History) -> OrganizerResult<usize> {
        let mut owners: Vec<GroupId> = Vec::new();
        for id in ids {
            let owner = self.require_item(*id)?.group_id;
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        for owner in &owners {
            self.guard(*owner, Action::RemoveItems)?;
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let checkpoint = self.store.checkpoint(&owners);
        let removed = self.store.remove_items(ids);
        let batch = self.delete_rows("remove items", removed).await;
        let confirmed = batch.confirmed.len();

        if let Some(error) = batch.error {
            if confirmed == 0 {
                self.store.restore(checkpoint);
                return Err(self.rolled_back("remove items", error));
            }
            let failed = batch.unconfirmed.len();
            self.store.insert_items(batch.unconfirmed);
            self.record(history, UndoEntry::RemoveItems { items: batch.confirmed });
            return Err(self.partially_saved("remove items", confirmed, failed, error));
        }

        info!("Removed {} item(s)", confirmed);
        self.record(history, UndoEntry::RemoveItems { items: batch.confirmed });
        Ok(confirmed)
    }

    /// Move items to the end of `target`; returns how many moved.
    ///
    /// Items already in `target` are left alone. A move that would place
    /// an element twice in the target's uniqueness scope is rejected.
    pub async fn move_items(&mut self, ids: &[ItemId], target: GroupId) -> OrganizerResult<usize> {
        self.guard(target, Action::AddItems)?;

        let mut moving: Vec<Item> = Vec::new();
        for id in ids {
            let item = self.require_item(*id)?;
            if item.group_id != target && !moving.iter().any(|m| m.id == item.id) {
                moving.push(item.clone());
            }
        }
        let mut sources: Vec<GroupId> = Vec::new();
        for item in &moving {
            if !sources.contains(&item.group_id) {
                sources.push(item.group_id);
            }
        }
        for source in &sources {
            self.guard(*source, Action::RemoveItems)?;
        }
        if moving.is_empty() {
            return Ok(0);
        }

        if let Some(scope) = self.store.uniqueness_scope(target) {
            let leaving: HashSet<ItemId> = moving.iter().map(|i| i.id).collect();
            let mut present: HashSet<&str> = self
                .store
                .subtree(scope)
                .into_iter()
                .flat_map(|gid| self.store.items_of(gid))
                .filter(|i| !leaving.contains(&i.id))
                .map(|i| i.element_ref.as_str())
                .collect();
            if let Some(clash) = moving.iter().find(|i| !present.insert(i.element_ref.as_str())) {
                return Err(ValidationError::UniquenessConflict {
                    element: clash.element_ref.clone(),
                }
                .into());
            }
        }

        let mut touched = sources.clone();
        touched.push(target);
        let checkpoint = self.store.checkpoint(&touched);

        let start = self.store.next_item_position(target);
        let principal = self.config.principal.clone();
        let mut moves = Vec::with_capacity(moving.len());
        let mut rows = Vec::with_capacity(moving.len());
        for (i, item) in moving.iter().enumerate() {
            moves.push(ItemMove {
                item_id: item.id,
                from_group: item.group_id,
                from_position: item.position,
            });
            let mut row = item.clone();
            row.group_id = target;
            row.position = start + i as i32;
            row.touch(&principal);
            rows.push(row);
        }

        self.store.update_items(rows.clone());
        let batch = self.update_rows("move items", rows).await;

        if let Some(error) = batch.error {
            if batch.confirmed.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back("move items", error));
            }
            let unconfirmed: HashSet<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            let originals: Vec<Item> = moving.into_iter().filter(|i| unconfirmed.contains(&i.id)).collect();
            let failed = originals.len();
            self.store.update_items(originals);
            moves.retain(|m| !unconfirmed.contains(&m.item_id));
            self.record(History::Record, UndoEntry::MoveItems { moves });
            return Err(self.partially_saved("move items", batch.confirmed.len(), failed, error));
        }

        let moved = moves.len();
        info!("Moved {} item(s) to group {}", moved, target);
        self.record(History::Record, UndoEntry::MoveItems { moves });
        Ok(moved)
    }

    /// Item rows the remote store holds anywhere in `scope`
    pub(super) async fn remote_items_in(&self, scope: GroupId) -> DomainResult<Vec<Item>> {
        let filter = RecordFilter::groups(self.store.subtree(scope));
        Repository::<Item>::fetch(self.remote.as_ref(), &filter).await
    }
}
