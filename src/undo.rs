//! Undo Stack
//!
//! Bounded LIFO of inverse actions. Each variant carries exactly what its
//! inverse needs; the gateway's dispatch matches exhaustively, so a new
//! mutation kind cannot be added without an inverse.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Group, GroupId, GroupPatch, Item, ItemId};

/// Where a moved item came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMove {
    pub item_id: ItemId,
    pub from_group: GroupId,
    pub from_position: i32,
}

/// Where a moved group sat before the move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub parent_id: Option<GroupId>,
    pub position: i32,
}

/// Previous value of one custom field on one item (None = unset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub item_id: ItemId,
    pub field_id: String,
    pub previous: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoEntry {
    /// Inverse: delete these ids
    AddItems { group_id: GroupId, item_ids: Vec<ItemId> },
    /// Inverse: re-insert the preserved rows
    RemoveItems { items: Vec<Item> },
    /// Inverse: move each item back to its source group and position
    MoveItems { moves: Vec<ItemMove> },
    /// Inverse: delete the group
    CreateGroup { group_id: GroupId },
    /// Inverse: re-insert the subtree's group rows (parents first) and items
    DeleteGroup { groups: Vec<Group>, items: Vec<Item> },
    /// Inverse: move the group back to `placement` (if any), then apply
    /// `previous` to its current row. Attributes the update did not touch,
    /// the lock among them, are left as they are now.
    UpdateGroup {
        group_id: GroupId,
        previous: GroupPatch,
        placement: Option<Placement>,
    },
    /// Inverse: delete the clone
    CloneGroup { group_id: GroupId },
    /// Inverse: restore the previous values
    UpdateItemField { changes: Vec<FieldChange> },
}

impl UndoEntry {
    pub fn label(&self) -> &'static str {
        match self {
            UndoEntry::AddItems { .. } => "add items",
            UndoEntry::RemoveItems { .. } => "remove items",
            UndoEntry::MoveItems { .. } => "move items",
            UndoEntry::CreateGroup { .. } => "create group",
            UndoEntry::DeleteGroup { .. } => "delete group",
            UndoEntry::UpdateGroup { .. } => "update group",
            UndoEntry::CloneGroup { .. } => "clone group",
            UndoEntry::UpdateItemField { .. } => "edit field",
        }
    }
}

#[derive(Debug)]
pub struct UndoStack {
    entries: VecDeque<UndoEntry>,
    capacity: usize,
}

impl UndoStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an entry, evicting the oldest once over capacity
    pub fn push(&mut self, entry: UndoEntry) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Most recent entry, or None when there is nothing to undo
    pub fn pop(&mut self) -> Option<UndoEntry> {
        self.entries.pop_back()
    }

    pub fn peek(&self) -> Option<&UndoEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
