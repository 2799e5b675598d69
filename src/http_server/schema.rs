//! Strict JSON-Schema (Draft-07 subset) validator for registry manifests.
//!
//! Two layers. The subset walker enforces the registry contract: only the
//! keyword subset extension blocks are allowed to use, with a recursion
//! depth cap to bound stack use on hostile input. Documents that pass it
//! must then compile as Draft-07 through the `jsonschema` crate, which
//! owns full keyword-shape conformance (including keywords outside the
//! subset that the walker deliberately ignores).

use serde_json::Value;

pub const MAX_DEPTH: usize = 64;

const ALLOWED_TYPES: &[&str] = &[
    "object", "array", "string", "number", "integer", "boolean", "null",
];

fn is_valid_type_name(name: &str) -> bool {
    ALLOWED_TYPES.contains(&name)
}

fn validate_type(value: &Value) -> bool {
    match value {
        Value::String(s) => is_valid_type_name(s),
        Value::Array(items) => {
            !items.is_empty()
                && items
                    .iter()
                    .all(|v| v.as_str().map(is_valid_type_name).unwrap_or(false))
        }
        _ => false,
    }
}

fn validate_string_array(value: &Value) -> bool {
    value
        .as_array()
        .map(|items| items.iter().all(Value::is_string))
        .unwrap_or(false)
}

fn validate_properties(value: &Value, depth: usize) -> bool {
    match value.as_object() {
        Some(map) => map.values().all(|v| v.is_object() && validate_node(v, depth + 1)),
        None => false,
    }
}

fn validate_composition(value: &Value, depth: usize) -> bool {
    match value.as_array() {
        Some(items) => {
            !items.is_empty()
                && items.iter().all(|v| v.is_object() && validate_node(v, depth + 1))
        }
        None => false,
    }
}

fn validate_node(node: &Value, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    let map = match node.as_object() {
        Some(map) => map,
        None => return false,
    };

    if let Some(schema) = map.get("$schema") {
        match schema.as_str() {
            Some(s) if s.contains("draft-07") => {}
            _ => return false,
        }
    }
    if let Some(ty) = map.get("type") {
        if !validate_type(ty) {
            return false;
        }
    }
    if let Some(props) = map.get("properties") {
        if !validate_properties(props, depth) {
            return false;
        }
    }
    if let Some(required) = map.get("required") {
        if !validate_string_array(required) {
            return false;
        }
    }
    if let Some(items) = map.get("items") {
        if !items.is_object() || !validate_node(items, depth + 1) {
            return false;
        }
    }
    if let Some(additional) = map.get("additionalProperties") {
        let ok = additional.is_boolean()
            || (additional.is_object() && validate_node(additional, depth + 1));
        if !ok {
            return false;
        }
    }
    if let Some(enumeration) = map.get("enum") {
        if !enumeration.is_array() {
            return false;
        }
    }
    for keyword in ["oneOf", "anyOf", "allOf"] {
        if let Some(composition) = map.get(keyword) {
            if !validate_composition(composition, depth) {
                return false;
            }
        }
    }
    for keyword in ["minimum", "maximum"] {
        if let Some(bound) = map.get(keyword) {
            if !bound.is_number() {
                return false;
            }
        }
    }
    for keyword in ["minLength", "maxLength"] {
        if let Some(bound) = map.get(keyword) {
            if !bound.is_u64() && !bound.is_i64() {
                return false;
            }
        }
    }
    if let Some(format) = map.get("format") {
        if !format.is_string() {
            return false;
        }
    }
    if let Some(reference) = map.get("$ref") {
        if !reference.is_string() {
            return false;
        }
    }
    for keyword in ["definitions", "$defs"] {
        if let Some(defs) = map.get(keyword) {
            if !defs.is_object() {
                return false;
            }
        }
    }

    true
}

fn compiles_as_draft7(schema: &Value) -> bool {
    jsonschema::draft7::new(schema).is_ok()
}

/// Validates a manifest's `schema.input`/`schema.output` pair.
pub fn validate_schemas(input: Option<&Value>, output: Option<&Value>) -> bool {
    match (input, output) {
        (Some(input), Some(output)) => validate_schema(input) && validate_schema(output),
        _ => false,
    }
}

/// Validates a single schema document: subset gate first, then Draft-07
/// compilation.
pub fn validate_schema(schema: &Value) -> bool {
    schema.is_object() && validate_node(schema, 0) && compiles_as_draft7(schema)
}
