//! Resource schema from an OpenAPI (3.x or Swagger 2) document.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::schema::{Capability, FieldSchema, ResourceSchema, Schema};

/// Capabilities reported when nothing better is known.
pub const DEFAULT_CAPABILITIES: &[Capability] = &[Capability::Read, Capability::Write];

/// Builds a schema from the `paths` of an OpenAPI document.
///
/// Each path maps to the resource named by its non-parameter segments
/// (`/contacts/{id}` → `contacts`). Fields come from the GET 200 response.
pub fn parse_openapi(doc: &Value) -> Schema {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Schema::empty(DEFAULT_CAPABILITIES);
    };

    let mut resources: Vec<ResourceSchema> = Vec::new();
    let mut capabilities: BTreeSet<Capability> = BTreeSet::new();

    for (path, item) in paths {
        let name = resource_name(path);
        if name.is_empty() {
            continue;
        }
        let Some(ops) = item.as_object() else {
            continue;
        };

        let idx = match resources.iter().position(|r| r.name == name) {
            Some(idx) => idx,
            None => {
                resources.push(ResourceSchema {
                    name: name.clone(),
                    ..ResourceSchema::default()
                });
                resources.len() - 1
            }
        };
        let resource = &mut resources[idx];

        for (method, op) in ops {
            match method.as_str() {
                "get" => {
                    capabilities.insert(Capability::Read);
                    if resource.description.is_none() {
                        resource.description = op
                            .get("summary")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    if resource.fields.is_empty() {
                        if let Some(schema) = response_schema(doc, op) {
                            resource.fields = fields_of(doc, schema);
                        }
                    }
                }
                "post" | "put" | "patch" | "delete" => {
                    capabilities.insert(Capability::Write);
                }
                _ => {}
            }
        }
    }

    if capabilities.is_empty() {
        capabilities.extend(DEFAULT_CAPABILITIES.iter().copied());
    }
    Schema {
        resources,
        capabilities: capabilities.into_iter().collect(),
    }
}

/// Manually supplied schema from connector options.
pub fn parse_manual(value: &Value) -> Option<Schema> {
    let mut schema: Schema = serde_json::from_value(value.clone()).ok()?;
    if schema.capabilities.is_empty() {
        schema.capabilities = DEFAULT_CAPABILITIES.to_vec();
    }
    Some(schema)
}

fn resource_name(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && !seg.starts_with('{'))
        .collect::<Vec<_>>()
        .join("/")
}

fn response_schema<'a>(doc: &'a Value, op: &'a Value) -> Option<&'a Value> {
    let ok = op.get("responses")?.get("200").or_else(|| op.get("responses")?.get("default"))?;
    let ok = resolve(doc, ok);
    // OpenAPI 3 nests under content; Swagger 2 puts the schema directly on the response
    let schema = ok
        .get("content")
        .and_then(|c| c.get("application/json"))
        .and_then(|m| m.get("schema"))
        .or_else(|| ok.get("schema"))?;
    Some(resolve(doc, schema))
}

fn fields_of(doc: &Value, schema: &Value) -> Vec<FieldSchema> {
    let mut schema = resolve(doc, schema);
    if schema.get("type").and_then(Value::as_str) == Some("array") {
        match schema.get("items") {
            Some(items) => schema = resolve(doc, items),
            None => return Vec::new(),
        }
    } else if let Some(inner) = envelope_items(doc, schema) {
        schema = inner;
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    properties
        .iter()
        .map(|(name, prop)| {
            let prop = resolve(doc, prop);
            FieldSchema {
                name: name.clone(),
                data_type: prop
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("object")
                    .to_string(),
                nullable: !required.contains(&name.as_str()),
                primary_key: name == "id",
            }
        })
        .collect()
}

/// Item schema of a `{ data: [..] }` style envelope.
fn envelope_items<'a>(doc: &'a Value, schema: &'a Value) -> Option<&'a Value> {
    let props: &Map<String, Value> = schema.get("properties")?.as_object()?;
    ["data", "items", "results", "records"].iter().find_map(|key| {
        let prop = resolve(doc, props.get(*key)?);
        if prop.get("type").and_then(Value::as_str) == Some("array") {
            prop.get("items").map(|items| resolve(doc, items))
        } else {
            None
        }
    })
}

/// Follows a local `$ref` (`#/components/schemas/X`, `#/definitions/X`).
fn resolve<'a>(doc: &'a Value, value: &'a Value) -> &'a Value {
    let mut current = value;
    // Bounded to break reference cycles
    for _ in 0..8 {
        let Some(reference) = current.get("$ref").and_then(Value::as_str) else {
            return current;
        };
        let Some(pointer) = reference.strip_prefix('#') else {
            return current;
        };
        match doc.pointer(pointer) {
            Some(target) => current = target,
            None => return current,
        }
    }
    current
}
