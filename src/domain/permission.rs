//! Permissions and Sharing
//!
//! Resolution order: owner > explicit per-principal override > group default.

use serde::{Deserialize, Serialize};

use super::group::Group;

/// Operation kinds a permission set can allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    AddItems,
    RemoveItems,
    EditItems,
    /// Create/update/delete/clone/move/lock groups
    ManageGroup,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::AddItems => "add items",
            Action::RemoveItems => "remove items",
            Action::EditItems => "edit items",
            Action::ManageGroup => "manage group",
        }
    }
}

/// Per-group permission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub view: bool,
    pub add_items: bool,
    pub remove_items: bool,
    pub edit_items: bool,
    pub manage: bool,
}

impl Default for PermissionSet {
    /// Project collaborators may do everything by default
    fn default() -> Self {
        Self::full()
    }
}

impl PermissionSet {
    pub fn full() -> Self {
        Self {
            view: true,
            add_items: true,
            remove_items: true,
            edit_items: true,
            manage: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            view: true,
            add_items: false,
            remove_items: false,
            edit_items: false,
            manage: false,
        }
    }

    pub fn none() -> Self {
        Self {
            view: false,
            ..Self::read_only()
        }
    }

    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.view,
            Action::AddItems => self.add_items,
            Action::RemoveItems => self.remove_items,
            Action::EditItems => self.edit_items,
            Action::ManageGroup => self.manage,
        }
    }
}

/// Who can see a group tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Visibility {
    /// Everyone in the project
    #[default]
    Project,
    /// The creator plus an explicit allow-list of principals
    Shared { with: Vec<String> },
    /// The creator only
    Private,
}

impl Visibility {
    pub fn admits(&self, principal: &str, creator: &str) -> bool {
        if principal == creator {
            return true;
        }
        match self {
            Visibility::Project => true,
            Visibility::Shared { with } => with.iter().any(|p| p == principal),
            Visibility::Private => false,
        }
    }
}

/// Effective permissions of `principal` on `group`
pub fn resolve(group: &Group, principal: &str) -> PermissionSet {
    if group.created_by == principal {
        return PermissionSet::full();
    }
    if !group.visibility.admits(principal, &group.created_by) {
        return PermissionSet::none();
    }
    group
        .permission_overrides
        .get(principal)
        .copied()
        .unwrap_or(group.default_permissions)
}
