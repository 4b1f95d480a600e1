//! Domain Layer
//!
//! Contains all domain entities and core abstractions.
//! This layer has NO dependencies on the engine (only serde, chrono, uuid).

mod change;
mod entity;
mod field;
mod group;
mod ids;
mod item;
mod permission;

pub use change::{ChangeEvent, ChangeOp, ChangePayload, Table};
pub use entity::{DomainError, DomainResult, Entity};
pub use field::{is_empty_value, FieldDef, FieldType};
pub use group::{clone_name, Group, GroupDraft, GroupPatch, LockState, Rgb};
pub use ids::{GroupId, ItemId};
pub use item::{Item, ItemCandidate};
pub use permission::{resolve as resolve_permissions, Action, PermissionSet, Visibility};
