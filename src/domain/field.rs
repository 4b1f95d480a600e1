//! Custom Field Schema
//!
//! Root groups define an ordered list of custom fields; every descendant
//! group and its items use the root's schema.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value type accepted by a custom field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    /// Calendar date as `YYYY-MM-DD`
    Date,
    /// One of the field's `options`
    Select,
    Checkbox,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Select => "select",
            FieldType::Checkbox => "checkbox",
        }
    }
}

/// One entry of a group's custom field schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type,
            required: false,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Check a candidate value against this field's type.
    ///
    /// Empty values are accepted unless the field is required.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if is_empty_value(value) {
            if self.required {
                return Err(format!("field '{}' is required", self.name));
            }
            return Ok(());
        }

        let ok = match self.field_type {
            FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Checkbox => value.is_boolean(),
            FieldType::Date => value
                .as_str()
                .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
                .unwrap_or(false),
            FieldType::Select => value
                .as_str()
                .map(|s| self.options.iter().any(|o| o == s))
                .unwrap_or(false),
        };

        if ok {
            Ok(())
        } else {
            Err(format!(
                "value {} is not a valid {} for field '{}'",
                value,
                self.field_type.as_str(),
                self.name
            ))
        }
    }
}

/// `null` and blank strings count as "no value"
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
