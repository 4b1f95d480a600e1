//! BIM Organizer Engine
//!
//! Keeps a shared hierarchy of element groups in sync between clients and
//! offers a bounded undo history for local edits.
//!
//! Layered architecture:
//! - domain: Core entities and business rules
//! - repository: Remote store abstractions and an in-memory implementation
//! - store / tree: Local Entity Store and the derived forest
//! - gateway: Every mutation, with optimistic apply and rollback
//! - realtime: Change feed reconciliation
//! - undo / echo: Undo history and local-origin tracking

pub mod config;
pub mod domain;
pub mod echo;
pub mod error;
pub mod gateway;
pub mod realtime;
pub mod repository;
pub mod store;
pub mod tree;
pub mod undo;

pub use config::{ConfigError, EngineConfig};
pub use error::{OrganizerError, OrganizerResult, ValidationError};
pub use gateway::{AddOutcome, Notice, Organizer};
pub use realtime::{ReconcileOutcome, Reconciler};
pub use repository::{ChangeFeed, MemoryRemote, RecordFilter, RemoteStore, Repository};
pub use store::{EntityStore, Forest};
pub use tree::GroupNode;
pub use undo::{UndoEntry, UndoStack};
