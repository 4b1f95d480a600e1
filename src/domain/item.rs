//! Item Entity
//!
//! A reference to one model element placed inside a group.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::Entity;
use super::ids::{GroupId, ItemId};

/// An item row as stored remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier
    pub id: ItemId,
    /// Owning group
    pub group_id: GroupId,
    /// Stable external identifier of the model element
    pub element_ref: String,
    pub mark: Option<String>,
    pub product: Option<String>,
    /// Weight in kg, summed into group aggregates
    pub weight: f64,
    pub position_code: Option<String>,
    /// Custom field values keyed by field id
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Position within the owning group (for ordering)
    pub position: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn from_candidate(candidate: ItemCandidate, group_id: GroupId, position: i32, creator: &str) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new(),
            group_id,
            element_ref: candidate.element_ref,
            mark: candidate.mark,
            product: candidate.product,
            weight: candidate.weight,
            position_code: candidate.position_code,
            properties: BTreeMap::new(),
            position,
            created_by: creator.to_string(),
            created_at: now,
            updated_by: creator.to_string(),
            updated_at: now,
        }
    }

    pub fn property(&self, field_id: &str) -> Option<&Value> {
        self.properties.get(field_id)
    }

    pub(crate) fn touch(&mut self, principal: &str) {
        self.updated_by = principal.to_string();
        self.updated_at = Utc::now();
    }
}

impl Entity for Item {
    type Id = ItemId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// A viewer element offered for adding to a group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemCandidate {
    pub element_ref: String,
    pub mark: Option<String>,
    pub product: Option<String>,
    pub weight: f64,
    pub position_code: Option<String>,
}

impl ItemCandidate {
    pub fn new(element_ref: impl Into<String>) -> Self {
        Self {
            element_ref: element_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.mark = Some(mark.into());
        self
    }
}
