//! Per-index field registry with type inference and validation.
//!
//! A field's [`FieldKind`] is fixed the first time the field is seen. Later
//! values are coerced to that kind, and a value that cannot be coerced rejects
//! the whole document. Only flags and sub-fields may be added afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{self, DataValue, Source};
use crate::error::{Result, TesseraError};

/// Document time field, pre-registered as `date` on every index.
pub const TIMESTAMP_FIELD: &str = "@timestamp";
/// Document id field.
pub const ID_FIELD: &str = "_id";
/// Original document body.
pub const SOURCE_FIELD: &str = "_source";
/// Sub-field name registered for text fields in auto-keyword mode.
pub const KEYWORD_SUB_FIELD: &str = "keyword";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Keyword,
    Numeric,
    Bool,
    Date,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Keyword => "keyword",
            FieldKind::Numeric => "numeric",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(FieldKind::Text),
            "keyword" => Ok(FieldKind::Keyword),
            "numeric" => Ok(FieldKind::Numeric),
            "bool" | "boolean" => Ok(FieldKind::Bool),
            "date" | "time" => Ok(FieldKind::Date),
            other => Err(TesseraError::validation(format!(
                "unknown field kind [{other}]"
            ))),
        }
    }
}

/// One mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    pub index: bool,
    pub store: bool,
    pub sortable: bool,
    pub aggregatable: bool,
    pub highlightable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Property>,
}

impl Property {
    /// Default flags for `kind`. Text is stored and highlightable but neither
    /// sortable nor aggregatable; every other kind is the reverse.
    pub fn new(kind: FieldKind) -> Self {
        let text = kind == FieldKind::Text;
        Property {
            kind,
            format: None,
            time_zone: None,
            index: true,
            store: text,
            sortable: !text,
            aggregatable: !text,
            highlightable: text,
            fields: BTreeMap::new(),
        }
    }

    pub fn date(format: impl Into<String>) -> Self {
        Property {
            format: Some(format.into()),
            ..Property::new(FieldKind::Date)
        }
    }

    pub fn with_sub_field(mut self, name: impl Into<String>, prop: Property) -> Self {
        self.fields.insert(name.into(), prop);
        self
    }
}

/// Field name to [`Property`] registry of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    properties: BTreeMap<String, Property>,
}

impl Default for Mapping {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapping {
    /// A mapping with only `@timestamp` registered.
    pub fn new() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            TIMESTAMP_FIELD.to_string(),
            Property::new(FieldKind::Date),
        );
        Mapping { properties }
    }

    pub fn get(&self, field: &str) -> Option<&Property> {
        self.properties.get(field)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Property)> {
        self.properties.iter()
    }

    /// Register a property for a field seen for the first time.
    ///
    /// Returns whether the mapping changed. An existing field keeps its kind;
    /// in auto-keyword mode a text field may still gain its `.keyword`
    /// sub-field.
    pub fn infer(&mut self, field: &str, value: &Value, auto_keyword: bool) -> bool {
        if let Some(prop) = self.properties.get_mut(field) {
            if auto_keyword
                && prop.kind == FieldKind::Text
                && !prop.fields.contains_key(KEYWORD_SUB_FIELD)
            {
                let keyword = Property::new(FieldKind::Keyword);
                prop.fields
                    .insert(KEYWORD_SUB_FIELD.to_string(), keyword.clone());
                self.properties
                    .insert(format!("{field}.{KEYWORD_SUB_FIELD}"), keyword);
                return true;
            }
            return false;
        }

        let sample = match value {
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => return false,
            },
            other => other,
        };

        let prop = match sample {
            Value::String(s) => match data::detect_date_layout(s) {
                Some(layout) => Property::date(layout),
                None => {
                    let mut text = Property::new(FieldKind::Text);
                    if auto_keyword {
                        let keyword = Property::new(FieldKind::Keyword);
                        text.fields
                            .insert(KEYWORD_SUB_FIELD.to_string(), keyword.clone());
                        self.properties
                            .insert(format!("{field}.{KEYWORD_SUB_FIELD}"), keyword);
                    }
                    text
                }
            },
            Value::Number(_) => Property::new(FieldKind::Numeric),
            Value::Bool(_) => Property::new(FieldKind::Bool),
            _ => return false,
        };
        self.properties.insert(field.to_string(), prop);
        true
    }

    /// Coerce `value` to the mapped kind of `field`. Arrays are coerced
    /// element-wise. Unmapped or unindexed fields pass through unchanged.
    pub fn coerce(&self, field: &str, value: &Value) -> Result<Value> {
        let Some(prop) = self.properties.get(field) else {
            return Ok(value.clone());
        };
        if !prop.index {
            return Ok(value.clone());
        }
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| coerce_one(field, prop, v))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => coerce_one(field, prop, other),
        }
    }

    /// Infer and coerce every field of a flattened document in place.
    ///
    /// Reserved `_id` and `_source` keys are dropped. Returns whether the
    /// mapping changed. On error the mapping may hold partial inferences, so
    /// callers run this on a copy.
    pub fn check_document(&mut self, flat: &mut Source, auto_keyword: bool) -> Result<bool> {
        flat.remove(ID_FIELD);
        flat.remove(SOURCE_FIELD);

        let mut changed = false;
        for (field, value) in flat.iter_mut() {
            if value.is_null() {
                continue;
            }
            changed |= self.infer(field, value, auto_keyword);
            *value = self.coerce(field, value)?;
        }
        Ok(changed)
    }

    /// Apply an explicit schema. Adding fields, flags or sub-fields is
    /// allowed; changing the kind of an existing field is not.
    pub fn merge(&mut self, other: &Mapping) -> Result<bool> {
        for (field, incoming) in &other.properties {
            if let Some(existing) = self.properties.get(field) {
                check_same_kind(field, existing, incoming)?;
            }
        }

        let mut changed = false;
        for (field, incoming) in &other.properties {
            match self.properties.get_mut(field) {
                Some(existing) if existing == incoming => {}
                Some(existing) => {
                    let mut fields = std::mem::take(&mut existing.fields);
                    for (name, sub) in &incoming.fields {
                        fields.insert(name.clone(), sub.clone());
                    }
                    *existing = Property {
                        fields,
                        ..incoming.clone()
                    };
                    changed = true;
                }
                None => {
                    self.properties.insert(field.clone(), incoming.clone());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Build typed segment fields from a checked, flattened document.
    pub fn build_fields(&self, flat: &Source) -> Result<Vec<(String, DataValue)>> {
        let mut out = Vec::new();
        for (field, value) in flat {
            if field == TIMESTAMP_FIELD || value.is_null() {
                continue;
            }
            let Some(prop) = self.properties.get(field) else {
                continue;
            };
            if !prop.index {
                continue;
            }
            match value {
                Value::Array(items) => {
                    for v in items {
                        build_field(field, prop, v, &mut out)?;
                    }
                }
                other => build_field(field, prop, other, &mut out)?,
            }
        }
        Ok(out)
    }

    /// Legacy flat form: `field -> kind`.
    pub fn to_flat(&self) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .map(|(k, p)| (k.clone(), p.kind.as_str().to_string()))
            .collect()
    }

    /// Rebuild a mapping from the legacy flat form with default flags.
    pub fn from_flat(flat: &BTreeMap<String, String>) -> Result<Self> {
        let mut mapping = Mapping::new();
        for (field, kind) in flat {
            mapping
                .properties
                .insert(field.clone(), Property::new(kind.parse()?));
        }
        Ok(mapping)
    }
}

fn check_same_kind(field: &str, existing: &Property, incoming: &Property) -> Result<()> {
    if existing.kind != incoming.kind {
        return Err(TesseraError::validation(format!(
            "field [{field}] is already mapped as [{}], cannot change to [{}]",
            existing.kind, incoming.kind
        )));
    }
    for (name, sub) in &incoming.fields {
        if let Some(current) = existing.fields.get(name) {
            check_same_kind(&format!("{field}.{name}"), current, sub)?;
        }
    }
    Ok(())
}

fn coerce_one(field: &str, prop: &Property, value: &Value) -> Result<Value> {
    let rejected = || {
        TesseraError::validation(format!(
            "field [{field}] was set type to [{}] but the value [{value}] can't convert to {}",
            prop.kind, prop.kind
        ))
    };
    match prop.kind {
        FieldKind::Text | FieldKind::Keyword => {
            data::to_text(value).map(Value::String).ok_or_else(rejected)
        }
        FieldKind::Numeric => data::to_numeric(value)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(rejected),
        FieldKind::Bool => data::to_bool(value).map(Value::Bool).ok_or_else(rejected),
        FieldKind::Date => {
            data::parse_time(value, prop.format.as_deref(), prop.time_zone.as_deref()).map_err(
                |e| TesseraError::validation(format!("field [{field}] value [{value}] {e}")),
            )?;
            Ok(value.clone())
        }
    }
}

fn build_field(
    field: &str,
    prop: &Property,
    value: &Value,
    out: &mut Vec<(String, DataValue)>,
) -> Result<()> {
    let typed = match prop.kind {
        FieldKind::Text | FieldKind::Keyword => {
            let text = data::to_text(value).unwrap_or_default();
            if text.is_empty() {
                return Ok(());
            }
            if prop.kind == FieldKind::Text {
                DataValue::Text(text)
            } else {
                DataValue::Keyword(text)
            }
        }
        FieldKind::Numeric => DataValue::Numeric(data::to_numeric(value).unwrap_or_default()),
        FieldKind::Bool => DataValue::Bool(data::to_bool(value).unwrap_or_default()),
        FieldKind::Date => DataValue::DateTime(data::parse_time(
            value,
            prop.format.as_deref(),
            prop.time_zone.as_deref(),
        )?),
    };
    out.push((field.to_string(), typed));

    for (name, sub) in &prop.fields {
        build_field(&format!("{field}.{name}"), sub, value, out)?;
    }
    Ok(())
}
