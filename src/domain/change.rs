//! Change Notifications
//!
//! Events pushed by the remote store's change feed.

use serde::{Deserialize, Serialize};

use super::group::Group;
use super::ids::GroupId;
use super::item::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Logical record collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Groups,
    Items,
}

/// Before/after images of the changed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "lowercase")]
pub enum ChangePayload {
    Groups {
        before: Option<Group>,
        after: Option<Group>,
    },
    Items {
        before: Option<Item>,
        after: Option<Item>,
    },
}

/// One inbound change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub payload: ChangePayload,
    /// Principal that made the change, when the store knows it
    pub actor: Option<String>,
}

impl ChangeEvent {
    pub fn group(op: ChangeOp, before: Option<Group>, after: Option<Group>, actor: Option<String>) -> Self {
        Self {
            op,
            payload: ChangePayload::Groups { before, after },
            actor,
        }
    }

    pub fn item(op: ChangeOp, before: Option<Item>, after: Option<Item>, actor: Option<String>) -> Self {
        Self {
            op,
            payload: ChangePayload::Items { before, after },
            actor,
        }
    }

    pub fn table(&self) -> Table {
        match self.payload {
            ChangePayload::Groups { .. } => Table::Groups,
            ChangePayload::Items { .. } => Table::Items,
        }
    }

    /// Project of a group event (after image preferred)
    pub fn project_id(&self) -> Option<&str> {
        match &self.payload {
            ChangePayload::Groups { before, after } => after
                .as_ref()
                .or(before.as_ref())
                .map(|g| g.project_id.as_str()),
            ChangePayload::Items { .. } => None,
        }
    }

    /// Owning groups named by an item event (both images)
    pub fn item_groups(&self) -> Vec<GroupId> {
        match &self.payload {
            ChangePayload::Items { before, after } => {
                let mut ids: Vec<GroupId> = before.iter().chain(after.iter()).map(|i| i.group_id).collect();
                ids.dedup();
                ids
            }
            ChangePayload::Groups { .. } => Vec::new(),
        }
    }
}
