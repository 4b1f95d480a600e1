//! Group Entity
//!
//! A named node of the organizing hierarchy (single parent, at most three
//! levels deep). Groups own Items and child Groups.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::entity::Entity;
use super::field::FieldDef;
use super::ids::GroupId;
use super::permission::{PermissionSet, Visibility};

/// RGB display color
pub type Rgb = [u8; 3];

/// Who holds a group lock and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// A group row as stored remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Unique identifier
    pub id: GroupId,
    /// Project scope
    pub project_id: String,
    /// Parent group (None = root)
    pub parent_id: Option<GroupId>,
    /// Display name
    pub name: String,
    pub description: Option<String>,
    /// Nesting level: 0 for roots, parent level + 1 otherwise
    pub level: u8,
    /// Position within siblings (for ordering)
    pub position: i32,
    pub color: Option<Rgb>,
    pub visibility: Visibility,
    pub lock: Option<LockState>,
    /// Only meaningful on roots; descendants inherit the root's schema
    #[serde(default)]
    pub custom_fields: Vec<FieldDef>,
    #[serde(default)]
    pub default_permissions: PermissionSet,
    #[serde(default)]
    pub permission_overrides: BTreeMap<String, PermissionSet>,
    /// Disallow the same element anywhere in this group's subtree
    #[serde(default)]
    pub unique_elements: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    /// Create a new root group with default values
    pub fn new_root(project_id: impl Into<String>, name: impl Into<String>, creator: impl Into<String>) -> Self {
        let creator = creator.into();
        let now = Utc::now();
        Self {
            id: GroupId::new(),
            project_id: project_id.into(),
            parent_id: None,
            name: name.into(),
            description: None,
            level: 0,
            position: 0,
            color: None,
            visibility: Visibility::Project,
            lock: None,
            custom_fields: Vec::new(),
            default_permissions: PermissionSet::default(),
            permission_overrides: BTreeMap::new(),
            unique_elements: false,
            updated_by: creator.clone(),
            created_by: creator,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new child group under a parent
    pub fn new_child(parent: &Group, name: impl Into<String>, creator: impl Into<String>, position: i32) -> Self {
        let mut group = Self::new_root(parent.project_id.clone(), name, creator);
        group.parent_id = Some(parent.id);
        group.level = parent.level + 1;
        group.position = position;
        group
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// The principal holding the lock, if it is someone other than `principal`
    pub fn locked_against(&self, principal: &str) -> Option<&str> {
        self.lock
            .as_ref()
            .filter(|lock| lock.locked_by != principal)
            .map(|lock| lock.locked_by.as_str())
    }

    pub(crate) fn touch(&mut self, principal: &str) {
        self.updated_by = principal.to_string();
        self.updated_at = Utc::now();
    }
}

impl Entity for Group {
    type Id = GroupId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Attributes for a group about to be created
#[derive(Debug, Clone, Default)]
pub struct GroupDraft {
    pub parent_id: Option<GroupId>,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<Rgb>,
    pub visibility: Visibility,
    pub custom_fields: Vec<FieldDef>,
    pub default_permissions: PermissionSet,
    pub unique_elements: bool,
}

impl GroupDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn under(mut self, parent_id: GroupId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique_elements = true;
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.custom_fields = fields;
        self
    }
}

/// Partial update of a group's editable attributes.
///
/// The lock and the group's place in the hierarchy are not part of a patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Some(None) clears the description
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub color: Option<Option<Rgb>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<Vec<FieldDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_permissions: Option<PermissionSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_overrides: Option<BTreeMap<String, PermissionSet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_elements: Option<bool>,
}

/// A key that is present (even as null) means "set"
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl GroupPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The patch that puts back `group`'s current values for exactly the
    /// attributes this patch sets
    pub fn inverse_on(&self, group: &Group) -> GroupPatch {
        GroupPatch {
            name: self.name.as_ref().map(|_| group.name.clone()),
            description: self.description.as_ref().map(|_| group.description.clone()),
            color: self.color.map(|_| group.color),
            visibility: self.visibility.as_ref().map(|_| group.visibility.clone()),
            custom_fields: self.custom_fields.as_ref().map(|_| group.custom_fields.clone()),
            default_permissions: self.default_permissions.map(|_| group.default_permissions),
            permission_overrides: self.permission_overrides.as_ref().map(|_| group.permission_overrides.clone()),
            unique_elements: self.unique_elements.map(|_| group.unique_elements),
        }
    }

    pub fn apply(&self, group: &mut Group) {
        if let Some(name) = &self.name {
            group.name = name.clone();
        }
        if let Some(description) = &self.description {
            group.description = description.clone();
        }
        if let Some(color) = self.color {
            group.color = color;
        }
        if let Some(visibility) = &self.visibility {
            group.visibility = visibility.clone();
        }
        if let Some(fields) = &self.custom_fields {
            group.custom_fields = fields.clone();
        }
        if let Some(permissions) = self.default_permissions {
            group.default_permissions = permissions;
        }
        if let Some(overrides) = &self.permission_overrides {
            group.permission_overrides = overrides.clone();
        }
        if let Some(unique) = self.unique_elements {
            group.unique_elements = unique;
        }
    }
}

/// Next free "Name (n)" among `siblings`.
///
/// A trailing " (k)" on `name` is stripped first, so cloning "Bay (1)"
/// yields "Bay (2)" rather than "Bay (1) (1)".
pub fn clone_name<'a>(name: &str, siblings: impl IntoIterator<Item = &'a str>) -> String {
    let base = strip_copy_suffix(name);
    let taken: Vec<&str> = siblings.into_iter().collect();
    let mut n = 1;
    loop {
        let candidate = format!("{} ({})", base, n);
        if !taken.iter().any(|s| *s == candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn strip_copy_suffix(name: &str) -> &str {
    let trimmed = name.trim_end();
    if let Some(open) = trimmed.rfind(" (") {
        let inner = &trimmed[open + 2..];
        if let Some(digits) = inner.strip_suffix(')') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return &trimmed[..open];
            }
        }
    }
    trimmed
}
