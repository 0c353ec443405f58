//! Property schemas and the property validator.
//!
//! A schema is an *ordered* mapping of property name to [`PropertySpec`];
//! validation walks it in declaration order, materializing defaults into
//! the candidate map and failing on the first required property that has
//! no default, fixed value, read-only marker, or caller-supplied value.

use crate::SchemaError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Concrete property values of a request or instance.
pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, rename = "read-only")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl PropertySpec {
    pub fn required_string() -> Self {
        Self {
            kind: Some("string".to_owned()),
            required: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySchema {
    entries: Vec<(String, PropertySpec)>,
}

impl PropertySchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property; a repeated name replaces the earlier spec in place.
    pub fn insert(&mut self, name: impl Into<String>, spec: PropertySpec) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = spec;
        } else {
            self.entries.push((name, spec));
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, spec: PropertySpec) -> Self {
        self.insert(name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertySpec)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PropertySchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, spec) in &self.entries {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

struct SchemaVisitor;

impl<'de> Visitor<'de> for SchemaVisitor {
    type Value = PropertySchema;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping of property name to property spec")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<PropertySchema, E> {
        Ok(PropertySchema::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PropertySchema, A::Error> {
        let mut schema = PropertySchema::new();
        while let Some((name, spec)) = access.next_entry::<String, Option<PropertySpec>>()? {
            schema.insert(name, spec.unwrap_or_default());
        }
        Ok(schema)
    }
}

impl<'de> Deserialize<'de> for PropertySchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SchemaVisitor)
    }
}

/// Validate `properties` against `schema`, materializing defaults in place.
///
/// Unknown extra keys are accepted untouched.
pub fn validate_properties(
    schema: &PropertySchema,
    properties: &mut Properties,
) -> Result<(), SchemaError> {
    for (name, spec) in schema.iter() {
        if let Some(default) = &spec.default {
            if !properties.contains_key(name) {
                debug!("property {name} not supplied, using default {default}");
                properties.insert(name.to_owned(), default.clone());
            }
            continue;
        }
        if spec.value.is_some() || spec.read_only || properties.contains_key(name) {
            continue;
        }
        if spec.required != Some(true) {
            debug!("optional property {name} omitted");
            continue;
        }
        return Err(SchemaError::MissingProperty(name.to_owned()));
    }
    Ok(())
}

/// Initial property map for a new instance: every declared key, holding its
/// default (or fixed value) when one exists and an empty string otherwise.
pub fn seed_properties(schema: &PropertySchema) -> Properties {
    schema
        .iter()
        .map(|(name, spec)| {
            let value = spec
                .default
                .clone()
                .or_else(|| spec.value.clone())
                .unwrap_or_else(|| Value::String(String::new()));
            (name.to_owned(), value)
        })
        .collect()
}

/// Schema shared by the built-in `addNetwork` / `removeNetwork` operations.
pub fn network_operation_schema() -> PropertySchema {
    PropertySchema::new().with("networkid", PropertySpec::required_string())
}

/// Render a property value the way workloads expect to see it in their
/// environment: strings verbatim, everything else as JSON text.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
