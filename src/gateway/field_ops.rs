//! Custom Field Values
//!
//! Values are checked against the schema of the item's tree root. An
//! empty value clears the field.

use std::collections::{BTreeMap, HashSet};

use log::info;
use serde_json::Value;

use super::{History, Organizer};
use crate::domain::{is_empty_value, Action, GroupId, Item, ItemId};
use crate::error::{OrganizerResult, ValidationError};
use crate::repository::RemoteStore;
use crate::undo::{FieldChange, UndoEntry};

impl<S: RemoteStore> Organizer<S> {
    /// Set one field on one item
    pub async fn update_item_field(&mut self, item_id: ItemId, field_id: &str, value: Value) -> OrganizerResult<()> {
        let fields = BTreeMap::from([(field_id.to_string(), value)]);
        self.edit_fields(&[item_id], fields, true, "edit field").await.map(|_| ())
    }

    /// Set fields across many items.
    ///
    /// Without `confirm_overwrite`, any target that already holds a
    /// non-empty value for one of the fields fails the whole call with
    /// `ConfirmationRequired`, listing those items.
    pub async fn bulk_edit_fields(
        &mut self,
        ids: &[ItemId],
        fields: BTreeMap<String, Value>,
        confirm_overwrite: bool,
    ) -> OrganizerResult<usize> {
        self.edit_fields(ids, fields, confirm_overwrite, "bulk edit").await
    }

    async fn edit_fields(
        &mut self,
        ids: &[ItemId],
        fields: BTreeMap<String, Value>,
        confirm_overwrite: bool,
        operation: &'static str,
    ) -> OrganizerResult<usize> {
        let mut targets: Vec<Item> = Vec::new();
        for id in ids {
            let item = self.require_item(*id)?;
            if !targets.iter().any(|t| t.id == item.id) {
                targets.push(item.clone());
            }
        }
        let mut owners: Vec<GroupId> = Vec::new();
        for item in &targets {
            if !owners.contains(&item.group_id) {
                owners.push(item.group_id);
            }
        }

        for owner in &owners {
            self.guard(*owner, Action::EditItems)?;
            let schema = self.store.effective_schema(*owner);
            for (field_id, value) in &fields {
                let def = schema
                    .iter()
                    .find(|f| &f.id == field_id)
                    .ok_or_else(|| ValidationError::InvalidInput(format!("unknown field '{}'", field_id)))?;
                def.check(value).map_err(ValidationError::InvalidInput)?;
            }
        }
        if targets.is_empty() || fields.is_empty() {
            return Ok(0);
        }

        if !confirm_overwrite {
            let conflicts: Vec<ItemId> = targets
                .iter()
                .filter(|item| {
                    fields
                        .keys()
                        .any(|f| item.property(f).map_or(false, |v| !is_empty_value(v)))
                })
                .map(|item| item.id)
                .collect();
            if !conflicts.is_empty() {
                return Err(ValidationError::ConfirmationRequired { conflicts }.into());
            }
        }

        let principal = self.config.principal.clone();
        let mut changes = Vec::new();
        let mut rows = Vec::with_capacity(targets.len());
        for item in &targets {
            let mut row = item.clone();
            for (field_id, value) in &fields {
                changes.push(FieldChange {
                    item_id: item.id,
                    field_id: field_id.clone(),
                    previous: item.property(field_id).cloned(),
                });
                if is_empty_value(value) {
                    row.properties.remove(field_id);
                } else {
                    row.properties.insert(field_id.clone(), value.clone());
                }
            }
            row.touch(&principal);
            rows.push(row);
        }

        let checkpoint = self.store.checkpoint(&owners);
        self.store.update_items(rows.clone());
        let batch = self.update_rows(operation, rows).await;

        if let Some(error) = batch.error {
            if batch.confirmed.is_empty() {
                self.store.restore(checkpoint);
                return Err(self.rolled_back(operation, error));
            }
            let unconfirmed: HashSet<ItemId> = batch.unconfirmed.iter().map(|i| i.id).collect();
            let originals: Vec<Item> = targets.into_iter().filter(|i| unconfirmed.contains(&i.id)).collect();
            let failed = originals.len();
            self.store.update_items(originals);
            changes.retain(|c| !unconfirmed.contains(&c.item_id));
            self.record(History::Record, UndoEntry::UpdateItemField { changes });
            return Err(self.partially_saved(operation, batch.confirmed.len(), failed, error));
        }

        let edited = batch.confirmed.len();
        info!("{}: {} field(s) on {} item(s)", operation, fields.len(), edited);
        self.record(History::Record, UndoEntry::UpdateItemField { changes });
        Ok(edited)
    }
}
