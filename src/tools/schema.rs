//! Tool schema types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Schema for a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
            annotations: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Whether the server marked the tool as safe to call again with the
    /// same arguments.
    pub fn is_idempotent(&self) -> bool {
        self.annotations
            .as_ref()
            .map(|a| a.idempotent_hint.unwrap_or(false) || a.read_only_hint.unwrap_or(false))
            .unwrap_or(false)
    }

    /// Copy of this schema published under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// Behavioural hints. Servers are untrusted, so these are advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// Tools learned from one server during discovery, in advertised order.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    order: Vec<ToolSchema>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Build a catalog, dropping later duplicates of a name. Returns the
    /// catalog and the names that were dropped.
    pub fn from_schemas(schemas: impl IntoIterator<Item = ToolSchema>) -> (Self, Vec<String>) {
        let mut catalog = Self::default();
        let mut duplicates = Vec::new();
        for schema in schemas {
            if catalog.index.contains_key(&schema.name) {
                duplicates.push(schema.name);
                continue;
            }
            catalog.index.insert(schema.name.clone(), catalog.order.len());
            catalog.order.push(schema);
        }
        (catalog, duplicates)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.index.get(name).map(|&i| &self.order[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSchema> {
        self.order.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builder for constructing MCP-compatible JSON schemas.
pub struct SchemaBuilder {
    properties: serde_json::Map<String, serde_json::Value>,
    required: Vec<String>,
    description: Option<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            properties: serde_json::Map::new(),
            required: Vec::new(),
            description: None,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        schema: serde_json::Value,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn number(self, name: impl Into<String>, required: bool) -> Self {
        self.property(name, serde_json::json!({ "type": "number" }), required)
    }

    pub fn string(self, name: impl Into<String>, required: bool) -> Self {
        self.property(name, serde_json::json!({ "type": "string" }), required)
    }

    pub fn build(self) -> serde_json::Value {
        let mut schema = serde_json::json!({
            "type": "object",
            "properties": self.properties,
        });
        if !self.required.is_empty() {
            schema["required"] = serde_json::json!(self.required);
        }
        if let Some(desc) = self.description {
            schema["description"] = serde_json::Value::String(desc);
        }
        schema
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}
