//! Backend-neutral description of what a connector exposes.

use serde::{Deserialize, Serialize};

/// Operation families a connector supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Search,
    Aggregate,
    Transaction,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    /// Backend type name as reported (`"integer"`, `"varchar"`, `"string"`, ...).
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
        }
    }
}

/// Foreign-key style link from one resource to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub field: String,
    pub target_resource: String,
    pub target_field: String,
}

/// A table (database) or endpoint collection (API).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub resources: Vec<ResourceSchema>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Schema {
    /// Schema with no known resources.
    pub fn empty(capabilities: &[Capability]) -> Self {
        Self {
            resources: Vec::new(),
            capabilities: capabilities.to_vec(),
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
