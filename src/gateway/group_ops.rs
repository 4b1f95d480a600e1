//! Group Operations
//!
//! Create, update, clone, delete and lock groups.

use chrono::Utc;
use log::info;

use super::{first_duplicate, History, Organizer};
use crate::domain::{clone_name, Action, Group, GroupDraft, GroupId, GroupPatch, Item, LockState};
use crate::echo::{EchoKey, EchoSource};
use crate::error::{OrganizerResult, ValidationError};
use crate::repository::{RemoteStore, Repository};
use crate::undo::UndoEntry;

impl<S: RemoteStore> Organizer<S> {
    /// Create a group at the end of its sibling list
    pub async fn create_group(&mut self, draft: GroupDraft) -> OrganizerResult<GroupId> {
        let GroupDraft {
            parent_id,
            name,
            description,
            color,
            visibility,
            custom_fields,
            default_permissions,
            unique_elements,
        } = draft;

        if name.trim().is_empty() {
            return Err(ValidationError::InvalidInput("group name must not be empty".to_string()).into());
        }

        let principal = self.config.principal.clone();
        let position = self.store.next_group_position(parent_id);
        let mut group = match parent_id {
            Some(parent_id) => {
                self.guard(parent_id, Action::ManageGroup)?;
                if !custom_fields.is_empty() {
                    return Err(ValidationError::SchemaNotInheritable.into());
                }
                let parent = self.require_group(parent_id)?;
                let level = parent.level.saturating_add(1);
                if level > self.config.max_depth {
                    return Err(ValidationError::DepthExceeded {
                        depth: level,
                        max: self.config.max_depth,
                    }
                    .into());
                }
                Group::new_child(parent, name, principal.as_str(), position)
            }
            None => {
                let mut root = Group::new_root(self.config.project_id.clone(), name, principal.as_str());
                root.position = position;
                root
            }
        };
        group.description = description;
        group.color = color;
        group.visibility = visibility;
        group.custom_fields = custom_fields;
        group.default_permissions = default_permissions;
        group.unique_elements = unique_elements;

        let id = self.insert_group("create group", group).await?;
        self.record(History::Record, UndoEntry::CreateGroup { group_id: id });
        Ok(id)
    }

    /// Apply a patch to a group's attributes.
    ///
    /// The undo entry keeps only the previous values of the patched
    /// attributes, so undoing never overwrites anything changed since.
    pub async fn update_group(&mut self, id: GroupId, patch: GroupPatch) -> OrganizerResult<()> {
        self.update_group_with(id, patch, History::Record).await
    }

    pub(crate) async fn update_group_with(&mut self, id: GroupId, patch: GroupPatch, history: History) -> OrganizerResult<()> {
        self.guard(id, Action::ManageGroup)?;
        let before = self.require_group(id)?.clone();
        if patch.is_empty() {
            return Ok(());
        }

        if patch.custom_fields.is_some() && !before.is_root() {
            return Err(ValidationError::SchemaNotInheritable.into());
        }
        if patch.name.as_deref().map_or(false, |n| n.trim().is_empty()) {
            return Err(ValidationError::InvalidInput("group name must not be empty".to_string()).into());
        }
        if patch.unique_elements == Some(true) && !before.unique_elements {
            let refs = self.store.subtree_element_refs(id);
            if let Some(element) = first_duplicate(refs.iter().map(String::as_str)) {
                return Err(ValidationError::UniquenessConflict {
                    element: element.to_string(),
                }
                .into());
            }
        }

        let previous = patch.inverse_on(&before);
        let mut after = before.clone();
        patch.apply(&mut after);
        after.touch(&self.config.principal);

        self.store.upsert_group(after.clone());
        let batch = self.update_rows("update group", vec![after]).await;
        if let Some(error) = batch.error {
            self.store.upsert_group(before);
            return Err(self.rolled_back("update group", error));
        }

        self.record(
            history,
            UndoEntry::UpdateGroup {
                group_id: id,
                previous,
                placement: None,
            },
        );
        Ok(())
    }

    /// Copy a group's attributes into a new sibling named "Name (n)".
    ///
    /// Items and child groups are not copied.
    pub async fn clone_group(&mut self, id: GroupId) -> OrganizerResult<GroupId> {
        self.check_permission(id, Action::ManageGroup)?;
        let source = self.require_group(id)?.clone();
        if let Some(parent) = source.parent_id {
            self.guard(parent, Action::ManageGroup)?;
        }

        let siblings = self.store.children_of(source.parent_id);
        let name = clone_name(&source.name, siblings.iter().map(|g| g.name.as_str()));
        let position = self.store.next_group_position(source.parent_id);
        let principal = self.config.principal.clone();
        let now = Utc::now();

        let copy = Group {
            id: GroupId::new(),
            name,
            position,
            lock: None,
            created_by: principal.clone(),
            created_at: now,
            updated_by: principal,
            updated_at: now,
            ..source
        };

        let clone_id = self.insert_group("clone group", copy).await?;
        self.record(History::Record, UndoEntry::CloneGroup { group_id: clone_id });
        Ok(clone_id)
    }

    /// Delete a group with its whole subtree and all items in it
    pub async fn delete_group(&mut self, id: GroupId) -> OrganizerResult<()> {
        self.delete_group_with(id, History::Record).await
    }

    pub(crate) async fn delete_group_with(&mut self, id: GroupId, history: History) -> OrganizerResult<()> {
        self.check_subtree_unlocked(id)?;
        self.check_permission(id, Action::ManageGroup)?;

        // Parents first, so the rows can be re-inserted in order
        let subtree = self.store.subtree(id);
        let groups: Vec<Group> = subtree.iter().filter_map(|gid| self.store.group(*gid).cloned()).collect();
        let items: Vec<Item> = subtree
            .iter()
            .flat_map(|gid| self.store.items_of(*gid).iter().cloned())
            .collect();

        let checkpoint = self.store.checkpoint(&subtree);
        self.store.remove_groups(&subtree);

        // The remote store cascades, so every row below echoes back too
        let keys: Vec<EchoKey> = groups
            .iter()
            .map(EchoSource::echo_key)
            .chain(items.iter().map(EchoSource::echo_key))
            .collect();
        self.echoes.tag_all(keys.iter().cloned());

        if let Err(error) = Repository::<Group>::delete(self.remote.as_ref(), &[id]).await {
            self.echoes.untag_all(keys);
            self.store.restore(checkpoint);
            return Err(self.rolled_back("delete group", error));
        }

        info!("Deleted group {} with {} subgroup(s) and {} item(s)", id, groups.len() - 1, items.len());
        self.record(history, UndoEntry::DeleteGroup { groups, items });
        Ok(())
    }

    /// Lock or unlock a group.
    ///
    /// Only the principal holding a lock, or one allowed to manage the
    /// group, may release it. Not recorded for undo.
    pub async fn set_lock(&mut self, id: GroupId, locked: bool) -> OrganizerResult<()> {
        let before = self.require_group(id)?.clone();
        let principal = self.config.principal.clone();

        match (&before.lock, locked) {
            (None, false) => return Ok(()),
            (Some(lock), true) if lock.locked_by == principal => return Ok(()),
            (Some(lock), true) => {
                return Err(ValidationError::Locked {
                    group: id,
                    by: lock.locked_by.clone(),
                }
                .into())
            }
            (None, true) => self.guard(id, Action::ManageGroup)?,
            (Some(lock), false) => {
                if lock.locked_by != principal {
                    self.check_permission(id, Action::ManageGroup)?;
                }
            }
        }

        let mut after = before.clone();
        after.lock = locked.then(|| LockState {
            locked_by: principal.clone(),
            locked_at: Utc::now(),
        });
        after.touch(&principal);

        let operation = if locked { "lock group" } else { "unlock group" };
        self.store.upsert_group(after.clone());
        let batch = self.update_rows(operation, vec![after]).await;
        if let Some(error) = batch.error {
            self.store.upsert_group(before);
            return Err(self.rolled_back(operation, error));
        }

        info!("{} {}", if locked { "Locked" } else { "Unlocked" }, id);
        Ok(())
    }

    /// Optimistically insert one group row, adopting the stored id
    async fn insert_group(&mut self, operation: &'static str, group: Group) -> OrganizerResult<GroupId> {
        let local_id = group.id;
        self.store.upsert_group(group.clone());

        let batch = self.insert_rows(operation, vec![group]).await;
        if let Some(error) = batch.error {
            self.store.remove_groups(&[local_id]);
            return Err(self.rolled_back(operation, error));
        }

        let stored_id = batch.confirmed.first().map(|g| g.id).unwrap_or(local_id);
        self.store.adopt_group_id(local_id, stored_id);
        info!("{}: {}", operation, stored_id);
        Ok(stored_id)
    }
}
