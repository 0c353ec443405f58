use crate::properties::PropertySchema;
use crate::transition::StandardTransition;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Structural descriptor of a resource type (`resource.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: PropertySchema,
    #[serde(default)]
    pub lifecycle: LifecycleDecl,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationDecl>,
}

/// Supported standard transitions, either as a bare list of names or as a
/// map of name to an optional in-workload command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleDecl {
    Names(Vec<String>),
    Commands(BTreeMap<String, Option<String>>),
}

impl Default for LifecycleDecl {
    fn default() -> Self {
        LifecycleDecl::Names(Vec::new())
    }
}

impl LifecycleDecl {
    pub fn supports(&self, transition: StandardTransition) -> bool {
        match self {
            LifecycleDecl::Names(names) => names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(transition.as_str())),
            LifecycleDecl::Commands(map) => map
                .keys()
                .any(|n| n.eq_ignore_ascii_case(transition.as_str())),
        }
    }

    /// Inline command declared for `transition`, if any.
    pub fn command(&self, transition: StandardTransition) -> Option<&str> {
        match self {
            LifecycleDecl::Names(_) => None,
            LifecycleDecl::Commands(map) => map
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(transition.as_str()))
                .and_then(|(_, cmd)| cmd.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: PropertySchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// `lifecycle/lifecycle.yaml`: transition name to in-workload command.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct LifecycleFile {
    #[serde(default)]
    pub lifecycle: BTreeMap<String, String>,
}

/// `operations/operations.yaml`: operation name to in-workload command.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct OperationsFile {
    #[serde(default)]
    pub operations: BTreeMap<String, String>,
}

pub fn parse_descriptor_str(input: &str) -> Result<ResourceDescriptor, SchemaError> {
    if input.trim().is_empty() {
        return Ok(ResourceDescriptor::default());
    }
    Ok(serde_yaml::from_str(input)?)
}

pub fn parse_descriptor_file(path: impl AsRef<Path>) -> Result<ResourceDescriptor, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_descriptor_str(&content)
}

pub(crate) fn read_lifecycle_file(path: &Path) -> Result<BTreeMap<String, String>, SchemaError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: LifecycleFile = serde_yaml::from_str(&content)?;
    Ok(file
        .lifecycle
        .into_iter()
        .map(|(name, cmd)| (name.to_ascii_lowercase(), cmd))
        .collect())
}

pub(crate) fn read_operations_file(path: &Path) -> Result<BTreeMap<String, String>, SchemaError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: OperationsFile = serde_yaml::from_str(&content)?;
    Ok(file.operations)
}
