//! Undo Dispatch
//!
//! One inverse per `UndoEntry` variant. Inverses go through the same
//! optimistic write path as forward mutations but never record history.
//! Each inverse skips what is already undone, so an entry pushed back
//! after a remote failure can be retried safely.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{info, warn};

use super::{History, Organizer};
use crate::domain::{Action, Group, GroupId, Item, ItemId};
use crate::error::{OrganizerError, OrganizerResult};
use crate::repository::RemoteStore;
use crate::undo::{FieldChange, ItemMove, UndoEntry};

impl<S: RemoteStore> Organizer<S> {
    /// Revert the most recent mutation; returns its label.
    ///
    /// When the inverse fails remotely the entry goes back on the stack so
    /// the user can retry. An entry that no longer applies (its groups are
    /// gone, or it is now locked or forbidden) is discarded.
    pub async fn undo(&mut self) -> OrganizerResult<&'static str> {
        let entry = self.undo.pop().ok_or(OrganizerError::NothingToUndo)?;
        let label = entry.label();

        match self.invert(entry.clone()).await {
            Ok(()) => {
                info!("Undid {}", label);
                Ok(label)
            }
            Err(e) => {
                match e {
                    OrganizerError::RemoteWrite(_)
                    | OrganizerError::RemoteRead(_)
                    | OrganizerError::PartialBatch { .. } => self.undo.push(entry),
                    _ => warn!("Discarding undo of {}: {}", label, e),
                }
                Err(e)
            }
        }
    }

    async fn invert(&mut self, entry: UndoEntry) -> OrganizerResult<()> {
        match entry {
            UndoEntry::AddItems { item_ids, .. } => {
                let present: Vec<ItemId> = item_ids.into_iter().filter(|id| self.store.item(*id).is_some()).collect();
                self.remove_items_with(&present, History::Skip).await.map(|_| ())
            }
            UndoEntry::RemoveItems { items } => self.reinsert_items("restore items", items).await,
            UndoEntry::MoveItems { moves } => self.restore_moves(moves).await,
            UndoEntry::CreateGroup { group_id } | UndoEntry::CloneGroup { group_id } => {
                if self.store.group(group_id).is_none() {
                    return Ok(());
                }
                self.delete_group_with(group_id, History::Skip).await
            }
            UndoEntry::DeleteGroup { groups, items } => self.reinsert_groups(groups, items).await,
            UndoEntry::UpdateGroup {
                group_id,
                previous,
                placement,
            } => {
                if self.store.group(group_id).is_none() {
                    return Ok(());
                }
                // Re-validated like a fresh move: depth, cycles, locks
                if let Some(placement) = placement {
                    self.move_group_with(group_id, placement.parent_id, Some(placement.position), History::Skip)
                        .await?;
                }
                self.update_group_with(group_id, previous, History::Skip).await
            }
            UndoEntry::UpdateItemField { changes } => self.restore_fields(changes).await,
        }
    }

    /// Put removed item rows back, keeping ids and positions where possible
    async fn reinsert_items(&mut self, operation: &'static str, rows: Vec<Item>) -> OrganizerResult<()> {
        let rows: Vec<Item> = rows.into_iter().filter(|i| self.store.item(i.id).is_none()).collect();
        let rows = self.without_scope_duplicates(rows).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut owners: Vec<GroupId> = Vec::new();
        for row in &rows {
            if !owners.contains(&row.group_id) {
                owners.push(row.group_id);
            }
        }
        for owner in &owners {
            self.guard(*owner, Action::AddItems)?;
        }

        let rows = self.free_item_positions(rows);
        let checkpoint = self.store.checkpoint(&owners);
        self.store.insert_items(rows.clone());

        let batch = self.insert_rows(operation, rows).await;
        self.store.adopt_item_ids(&batch.renames);
        if let Some(error) = batch.error {
            if batch.confirmed.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back(operation, error));
            }
            let failed: Vec<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            self.store.remove_items(&failed);
            return Err(self.partially_saved(operation, batch.confirmed.len(), failed.len(), error));
        }
        Ok(())
    }

    async fn restore_moves(&mut self, moves: Vec<ItemMove>) -> OrganizerResult<()> {
        let principal = self.config.principal.clone();
        let mut originals = Vec::new();
        let mut rows = Vec::new();
        let mut touched: Vec<GroupId> = Vec::new();

        for m in &moves {
            // Removed since, or already back
            let Some(item) = self.store.item(m.item_id) else {
                continue;
            };
            if item.group_id == m.from_group {
                continue;
            }
            self.guard(item.group_id, Action::RemoveItems)?;
            self.guard(m.from_group, Action::AddItems)?;
            for gid in [item.group_id, m.from_group] {
                if !touched.contains(&gid) {
                    touched.push(gid);
                }
            }

            let mut row = item.clone();
            row.group_id = m.from_group;
            row.position = m.from_position;
            row.touch(&principal);
            originals.push(item.clone());
            rows.push(row);
        }
        let rows = self.without_scope_duplicates(rows).await?;
        if rows.is_empty() {
            return Ok(());
        }
        originals.retain(|o: &Item| rows.iter().any(|r| r.id == o.id));

        let rows = self.free_item_positions(rows);
        let checkpoint = self.store.checkpoint(&touched);
        self.store.update_items(rows.clone());

        let batch = self.update_rows("restore moves", rows).await;
        if let Some(error) = batch.error {
            if batch.confirmed.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back("restore moves", error));
            }
            let unconfirmed: HashSet<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            let back: Vec<Item> = originals.into_iter().filter(|i| unconfirmed.contains(&i.id)).collect();
            let failed = back.len();
            self.store.update_items(back);
            return Err(self.partially_saved("restore moves", batch.confirmed.len(), failed, error));
        }
        Ok(())
    }

    /// Re-create a deleted subtree level by level, then its items.
    ///
    /// Parents are inserted before children so regenerated parent ids can
    /// be substituted into the children before they are written.
    async fn reinsert_groups(&mut self, groups: Vec<Group>, items: Vec<Item>) -> OrganizerResult<()> {
        let Some(top) = groups.first() else {
            return Ok(());
        };
        if self.store.group(top.id).is_some() {
            return Ok(());
        }
        let top_id = top.id;
        let top_parent = top.parent_id;
        if let Some(parent) = top_parent {
            self.guard(parent, Action::ManageGroup)?;
        }
        let top_position_taken = self
            .store
            .children_of(top_parent)
            .iter()
            .any(|g| g.position == top.position);
        let appended_position = self.store.next_group_position(top_parent);

        let mut tiers: BTreeMap<u8, Vec<Group>> = BTreeMap::new();
        for group in groups {
            tiers.entry(group.level).or_default().push(group);
        }

        let mut renames: HashMap<GroupId, GroupId> = HashMap::new();
        let mut inserted: Vec<GroupId> = Vec::new();
        for (_, mut tier) in tiers {
            for row in &mut tier {
                if let Some(parent) = row.parent_id.and_then(|p| renames.get(&p)) {
                    row.parent_id = Some(*parent);
                }
                if row.id == top_id && top_position_taken {
                    row.position = appended_position;
                }
            }

            self.store.upsert_groups(tier.clone());
            let batch = self.insert_rows("restore group", tier).await;
            for (old, new) in &batch.renames {
                self.store.adopt_group_id(*old, *new);
                renames.insert(*old, *new);
            }
            inserted.extend(batch.confirmed.iter().map(|g| g.id));

            if let Some(error) = batch.error {
                let unconfirmed: Vec<GroupId> = batch.unconfirmed.iter().map(|g| g.id).collect();
                self.compensate_inserted_groups(inserted.clone()).await;
                self.store.remove_groups(&[inserted, unconfirmed].concat());
                return Err(self.rolled_back("restore group", error));
            }
        }

        let items: Vec<Item> = items
            .into_iter()
            .map(|mut item| {
                if let Some(new) = renames.get(&item.group_id) {
                    item.group_id = *new;
                }
                item
            })
            .collect();
        if let Err(e) = self.reinsert_items("restore group", items).await {
            // Groups without their items are not a faithful undo
            self.compensate_inserted_groups(inserted.clone()).await;
            self.store.remove_groups(&inserted);
            return Err(match e {
                OrganizerError::PartialBatch { source, .. } => OrganizerError::RemoteWrite(source),
                other => other,
            });
        }
        Ok(())
    }

    async fn restore_fields(&mut self, changes: Vec<FieldChange>) -> OrganizerResult<()> {
        let mut originals: Vec<Item> = Vec::new();
        let mut rows: Vec<Item> = Vec::new();
        for change in changes {
            let Some(item) = self.store.item(change.item_id) else {
                continue;
            };
            let at = match rows.iter().position(|r| r.id == change.item_id) {
                Some(at) => at,
                None => {
                    originals.push(item.clone());
                    rows.push(item.clone());
                    rows.len() - 1
                }
            };
            match change.previous {
                Some(value) => {
                    rows[at].properties.insert(change.field_id, value);
                }
                None => {
                    rows[at].properties.remove(&change.field_id);
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        let mut owners: Vec<GroupId> = Vec::new();
        for row in &rows {
            if !owners.contains(&row.group_id) {
                owners.push(row.group_id);
            }
        }
        for owner in &owners {
            self.guard(*owner, Action::EditItems)?;
        }
        let principal = self.config.principal.clone();
        for row in &mut rows {
            row.touch(&principal);
        }

        let checkpoint = self.store.checkpoint(&owners);
        self.store.update_items(rows.clone());
        let batch = self.update_rows("restore field", rows).await;
        if let Some(error) = batch.error {
            if batch.confirmed.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back("restore field", error));
            }
            let unconfirmed: HashSet<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            let back: Vec<Item> = originals.into_iter().filter(|i| unconfirmed.contains(&i.id)).collect();
            let failed = back.len();
            self.store.update_items(back);
            return Err(self.partially_saved("restore field", batch.confirmed.len(), failed, error));
        }
        Ok(())
    }

    /// Drop rows whose element is already placed in their group's
    /// uniqueness scope, locally or in the remote store. Such a row stays
    /// where it is (moves) or is not re-created (re-inserts).
    async fn without_scope_duplicates(&self, rows: Vec<Item>) -> OrganizerResult<Vec<Item>> {
        let arriving: HashSet<ItemId> = rows.iter().map(|i| i.id).collect();
        let mut placed: HashMap<GroupId, HashSet<String>> = HashMap::new();
        let mut kept = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(scope) = self.store.uniqueness_scope(row.group_id) else {
                kept.push(row);
                continue;
            };
            if !placed.contains_key(&scope) {
                let mut refs: HashSet<String> = self
                    .store
                    .subtree(scope)
                    .into_iter()
                    .flat_map(|gid| self.store.items_of(gid))
                    .filter(|i| !arriving.contains(&i.id))
                    .map(|i| i.element_ref.clone())
                    .collect();
                let remote = self.remote_items_in(scope).await.map_err(OrganizerError::RemoteRead)?;
                refs.extend(
                    remote
                        .into_iter()
                        .filter(|i| !arriving.contains(&i.id))
                        .map(|i| i.element_ref),
                );
                placed.insert(scope, refs);
            }

            let refs = placed.entry(scope).or_default();
            if refs.insert(row.element_ref.clone()) {
                kept.push(row);
            } else {
                warn!("Not restoring {}: already placed in group {}", row.element_ref, scope);
            }
        }
        Ok(kept)
    }

    /// Keep each row's recorded position unless its group already uses it
    fn free_item_positions(&self, mut rows: Vec<Item>) -> Vec<Item> {
        rows.sort_by_key(|i| i.position);

        let mut used: HashMap<GroupId, HashSet<i32>> = HashMap::new();
        let mut next: HashMap<GroupId, i32> = HashMap::new();
        for row in &rows {
            let ceiling = next
                .entry(row.group_id)
                .or_insert_with(|| self.store.next_item_position(row.group_id));
            *ceiling = (*ceiling).max(row.position + 1);
        }

        for row in &mut rows {
            let taken = used.entry(row.group_id).or_insert_with(|| {
                self.store
                    .items_of(row.group_id)
                    .iter()
                    .filter(|i| i.id != row.id)
                    .map(|i| i.position)
                    .collect()
            });
            if !taken.insert(row.position) {
                let ceiling = next.entry(row.group_id).or_insert(0);
                row.position = *ceiling;
                *ceiling += 1;
                taken.insert(row.position);
            }
        }
        rows
    }
}
