// Tool Argument Schemas
//
// Deterministic JSON-Schema subset used to validate tool-call arguments
// before forwarding: type unions, required, properties, enum, string
// length, numeric bounds, pattern, items and item counts. Errors carry a
// JSON-pointer-like path; output is capped at 20 errors. Tools without a
// registered schema pass unchecked.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

const MAX_ERRORS: usize = 20;

// Compiled patterns are shared across validator instances; invalid
// patterns are cached as None and never match.
static PATTERN_CACHE: Lazy<RwLock<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

pub struct ToolSchemaValidator {
    schemas: RwLock<HashMap<String, Value>>,
}

impl ToolSchemaValidator {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_schema(&self, tool: &str, schema: Value) {
        self.schemas.write().insert(tool.to_string(), schema);
    }

    pub fn remove_schema(&self, tool: &str) -> bool {
        self.schemas.write().remove(tool).is_some()
    }

    pub fn has_schema(&self, tool: &str) -> bool {
        self.schemas.read().contains_key(tool)
    }

    /// Validate tool arguments. An empty result means the arguments pass.
    pub fn validate(&self, tool: &str, args: &Value) -> Vec<SchemaError> {
        let schemas = self.schemas.read();
        let schema = match schemas.get(tool) {
            Some(schema) => schema,
            None => return Vec::new(),
        };
        let mut errors = Vec::new();
        check_value(schema, args, "", &mut errors);
        errors
    }
}

impl Default for ToolSchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn push(errors: &mut Vec<SchemaError>, path: &str, message: String) {
    if errors.len() < MAX_ERRORS {
        errors.push(SchemaError {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            message,
        });
    }
}

fn check_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<SchemaError>) {
    if errors.len() >= MAX_ERRORS {
        return;
    }
    let schema = match schema.as_object() {
        Some(s) => s,
        None => return,
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            push(
                errors,
                path,
                format!("expected type {}, got {}", render_type(expected), type_name(value)),
            );
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.iter().any(|opt| opt == value) {
            push(errors, path, "value not in enum".to_string());
        }
    }

    match value {
        Value::String(s) => check_string(schema, s, path, errors),
        Value::Number(_) => check_number(schema, value, path, errors),
        Value::Array(items) => check_array(schema, items, path, errors),
        Value::Object(map) => check_object(schema, map, path, errors),
        _ => {}
    }
}

fn check_string(
    schema: &serde_json::Map<String, Value>,
    s: &str,
    path: &str,
    errors: &mut Vec<SchemaError>,
) {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(|v| v.as_u64()) {
        if len < min {
            push(errors, path, format!("length {} below minLength {}", len, min));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(|v| v.as_u64()) {
        if len > max {
            push(errors, path, format!("length {} above maxLength {}", len, max));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(|v| v.as_str()) {
        if let Some(re) = compiled(pattern) {
            if !re.is_match(s) {
                push(errors, path, format!("does not match pattern {}", pattern));
            }
        }
    }
}

fn check_number(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<SchemaError>,
) {
    let n = value.as_f64().unwrap_or(0.0);
    if let Some(min) = schema.get("minimum").and_then(|v| v.as_f64()) {
        if n < min {
            push(errors, path, format!("{} below minimum {}", n, min));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(|v| v.as_f64()) {
        if n > max {
            push(errors, path, format!("{} above maximum {}", n, max));
        }
    }
}

fn check_array(
    schema: &serde_json::Map<String, Value>,
    items: &[Value],
    path: &str,
    errors: &mut Vec<SchemaError>,
) {
    if let Some(min) = schema.get("minItems").and_then(|v| v.as_u64()) {
        if (items.len() as u64) < min {
            push(errors, path, format!("{} items below minItems {}", items.len(), min));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(|v| v.as_u64()) {
        if (items.len() as u64) > max {
            push(errors, path, format!("{} items above maxItems {}", items.len(), max));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check_value(item_schema, item, &format!("{}/{}", path, i), errors);
            if errors.len() >= MAX_ERRORS {
                return;
            }
        }
    }
}

fn check_object(
    schema: &serde_json::Map<String, Value>,
    map: &serde_json::Map<String, Value>,
    path: &str,
    errors: &mut Vec<SchemaError>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !map.contains_key(field) {
                push(errors, &format!("{}/{}", path, field), "required field missing".to_string());
            }
        }
    }
    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, prop_schema) in properties {
            if let Some(prop_value) = map.get(name) {
                check_value(prop_schema, prop_value, &format!("{}/{}", path, name), errors);
                if errors.len() >= MAX_ERRORS {
                    return;
                }
            }
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| single_type_matches(t, value)),
        _ => true,
    }
}

fn single_type_matches(t: &str, value: &Value) -> bool {
    match t {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn render_type(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join("|"),
        _ => "any".to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compiled(pattern: &str) -> Option<Regex> {
    if let Some(cached) = PATTERN_CACHE.read().get(pattern) {
        return cached.clone();
    }
    let compiled = Regex::new(pattern).ok();
    PATTERN_CACHE
        .write()
        .insert(pattern.to_string(), compiled.clone());
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator_with(schema: Value) -> ToolSchemaValidator {
        let v = ToolSchemaValidator::new();
        v.register_schema("search", schema);
        v
    }

    #[test]
    fn test_unknown_tool_passes() {
        let v = ToolSchemaValidator::new();
        assert!(v.validate("anything", &json!({"x": 1})).is_empty());
    }

    #[test]
    fn test_required_and_properties() {
        let v = validator_with(json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "minLength": 1, "maxLength": 10},
                "limit": {"type": "integer", "minimum": 1, "maximum": 100}
            }
        }));

        assert!(v.validate("search", &json!({"query": "rust"})).is_empty());

        let errors = v.validate("search", &json!({}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/query");

        let errors = v.validate("search", &json!({"query": "", "limit": 500}));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("minLength"));
        assert!(errors[1].message.contains("maximum"));
    }

    #[test]
    fn test_type_union_and_null() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {"cursor": {"type": ["string", "null"]}}
        }));
        assert!(v.validate("search", &json!({"cursor": null})).is_empty());
        assert!(v.validate("search", &json!({"cursor": "abc"})).is_empty());
        let errors = v.validate("search", &json!({"cursor": 5}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("string|null"));
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}}
        }));
        assert!(v.validate("search", &json!({"n": 3.0})).is_empty());
        assert_eq!(v.validate("search", &json!({"n": 3.5})).len(), 1);
    }

    #[test]
    fn test_enum_deep_equal() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {"mode": {"enum": ["fast", "slow", {"custom": true}]}}
        }));
        assert!(v.validate("search", &json!({"mode": "fast"})).is_empty());
        assert!(v.validate("search", &json!({"mode": {"custom": true}})).is_empty());
        assert_eq!(v.validate("search", &json!({"mode": "other"})).len(), 1);
    }

    #[test]
    fn test_pattern() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {"tag": {"type": "string", "pattern": "^[a-z]+$"}}
        }));
        assert!(v.validate("search", &json!({"tag": "abc"})).is_empty());
        assert_eq!(v.validate("search", &json!({"tag": "ABC"})).len(), 1);
    }

    #[test]
    fn test_items_and_counts_with_paths() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {
                "ids": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 3,
                    "items": {"type": "integer"}
                }
            }
        }));
        assert!(v.validate("search", &json!({"ids": [1, 2]})).is_empty());
        assert_eq!(v.validate("search", &json!({"ids": []})).len(), 1);
        assert_eq!(v.validate("search", &json!({"ids": [1, 2, 3, 4]})).len(), 1);

        let errors = v.validate("search", &json!({"ids": [1, "two"]}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/ids/1");
    }

    #[test]
    fn test_error_cap() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {
                "ids": {"type": "array", "items": {"type": "integer"}}
            }
        }));
        let bad: Vec<Value> = (0..50).map(|_| json!("x")).collect();
        let errors = v.validate("search", &json!({"ids": bad}));
        assert_eq!(errors.len(), 20);
    }

    #[test]
    fn test_nested_objects_recurse() {
        let v = validator_with(json!({
            "type": "object",
            "properties": {
                "filter": {
                    "type": "object",
                    "required": ["field"],
                    "properties": {"field": {"type": "string"}}
                }
            }
        }));
        let errors = v.validate("search", &json!({"filter": {}}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/filter/field");
    }
}
