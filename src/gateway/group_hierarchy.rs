//! Group Hierarchy Operations
//!
//! Moving a group (with its subtree) under a different parent.

use std::collections::{HashMap, HashSet};

use log::info;

use super::{History, Organizer};
use crate::domain::{Action, Group, GroupId, GroupPatch};
use crate::error::{OrganizerResult, ValidationError};
use crate::repository::RemoteStore;
use crate::undo::{Placement, UndoEntry};

impl<S: RemoteStore> Organizer<S> {
    /// Move a group under `new_parent` (None = make it a root).
    ///
    /// The group is appended after its new siblings and every descendant's
    /// level is recomputed top-down. If the remote store rejects part of the
    /// write, the confirmed rows are written back so the hierarchy never
    /// stays half-moved.
    pub async fn move_group(&mut self, id: GroupId, new_parent: Option<GroupId>) -> OrganizerResult<()> {
        self.move_group_with(id, new_parent, None, History::Record).await
    }

    /// Move with an optional preferred position among the new siblings.
    ///
    /// A preferred position already used by a sibling falls back to the end.
    pub(crate) async fn move_group_with(
        &mut self,
        id: GroupId,
        new_parent: Option<GroupId>,
        position: Option<i32>,
        history: History,
    ) -> OrganizerResult<()> {
        let group = self.require_group(id)?;
        if group.parent_id == new_parent {
            return Ok(());
        }
        let placement = Placement {
            parent_id: group.parent_id,
            position: group.position,
        };

        let new_level = match new_parent {
            Some(target) => {
                let target_group = self.require_group(target)?;
                if target == id || self.store.descendants(id).contains(&target) {
                    return Err(ValidationError::CyclicMove.into());
                }
                target_group.level.saturating_add(1)
            }
            None => 0,
        };

        let deepest = new_level.saturating_add(self.store.subtree_height(id));
        if deepest > self.config.max_depth {
            return Err(ValidationError::DepthExceeded {
                depth: deepest,
                max: self.config.max_depth,
            }
            .into());
        }

        self.check_subtree_unlocked(id)?;
        self.check_permission(id, Action::ManageGroup)?;
        if let Some(target) = new_parent {
            self.guard(target, Action::ManageGroup)?;
            self.check_scope_accepts(id, target)?;
        }

        // Recompute levels top-down; only rows that change are written
        let principal = self.config.principal.clone();
        let position = match position {
            Some(p) if !self.store.children_of(new_parent).iter().any(|g| g.position == p) => p,
            _ => self.store.next_group_position(new_parent),
        };
        let mut levels: HashMap<GroupId, u8> = HashMap::new();
        let mut changed = Vec::new();
        let mut originals = Vec::new();
        for gid in self.store.subtree(id) {
            let Some(row) = self.store.group(gid) else {
                continue;
            };
            let mut after = row.clone();
            if gid == id {
                after.parent_id = new_parent;
                after.position = position;
                after.level = new_level;
            } else if let Some(parent_level) = row.parent_id.and_then(|p| levels.get(&p)) {
                after.level = parent_level + 1;
            }
            levels.insert(gid, after.level);

            if gid == id || after.level != row.level {
                after.touch(&principal);
                originals.push(row.clone());
                changed.push(after);
            }
        }

        self.store.upsert_groups(changed.clone());
        let batch = self.update_rows("move group", changed).await;
        if let Some(error) = batch.error {
            let confirmed: HashSet<GroupId> = batch.confirmed.iter().map(|g| g.id).collect();
            let written_back: Vec<Group> = originals.iter().filter(|g| confirmed.contains(&g.id)).cloned().collect();
            self.compensate_groups(written_back).await;
            self.store.upsert_groups(originals);
            return Err(self.rolled_back("move group", error));
        }

        info!("Moved group {} under {:?}", id, new_parent);
        self.record(
            history,
            UndoEntry::UpdateGroup {
                group_id: id,
                previous: GroupPatch::default(),
                placement: Some(placement),
            },
        );
        Ok(())
    }

    /// Reject a move that would place an element twice in the target's scope
    fn check_scope_accepts(&self, id: GroupId, target: GroupId) -> Result<(), ValidationError> {
        let Some(scope) = self.store.uniqueness_scope(target) else {
            return Ok(());
        };
        let moving: Vec<GroupId> = self.store.subtree(id);
        let moving_set: HashSet<GroupId> = moving.iter().copied().collect();

        let mut present: HashSet<&str> = self
            .store
            .subtree(scope)
            .into_iter()
            .filter(|gid| !moving_set.contains(gid))
            .flat_map(|gid| self.store.items_of(gid))
            .map(|i| i.element_ref.as_str())
            .collect();

        for gid in moving {
            for item in self.store.items_of(gid) {
                if !present.insert(item.element_ref.as_str()) {
                    return Err(ValidationError::UniquenessConflict {
                        element: item.element_ref.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
