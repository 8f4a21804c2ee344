//! Validate tool call arguments against the tool's JSON Schema before dispatch.
//!
//! Covers the subset servers actually publish: `type` (single or union),
//! `required`, `properties`, `additionalProperties: false`, `enum` and array
//! `items`, applied recursively. Unknown keywords are ignored.

use serde_json::Value;

/// Validate tool arguments against a JSON Schema.
///
/// Returns `Ok(())` when valid, `Err(message)` describing the first violation
/// found. Messages name the offending location, e.g. `field 'items[1].id'`.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    validate_at(args, schema, None)
}

fn validate_at(value: &Value, schema: &Value, path: Option<&str>) -> Result<(), String> {
    if let Some(expected) = schema.get("type") {
        if !type_matches(value, expected) {
            return Err(match path {
                None => format!(
                    "expected {} arguments, got {}",
                    describe_type(expected),
                    json_type_name(value)
                ),
                Some(path) => format!(
                    "field '{path}' expected type '{}', got {}",
                    describe_type(expected),
                    json_type_name(value)
                ),
            });
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let location = path.unwrap_or("arguments");
            return Err(format!("field '{location}' must be one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!(
                        "missing required field '{}'",
                        join_path(path, name)
                    ));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        for (key, field) in obj {
            match properties.and_then(|p| p.get(key)) {
                Some(field_schema) => {
                    validate_at(field, field_schema, Some(&join_path(path, key)))?
                }
                None if closed => {
                    return Err(format!("unexpected field '{}'", join_path(path, key)));
                }
                None => {}
            }
        }
    }

    if let (Some(items), Some(elements)) = (schema.get("items"), value.as_array()) {
        let base = path.unwrap_or("arguments");
        for (i, element) in elements.iter().enumerate() {
            validate_at(element, items, Some(&format!("{base}[{i}]")))?;
        }
    }

    Ok(())
}

fn join_path(parent: Option<&str>, key: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}.{key}"),
        None => key.to_string(),
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => value_matches_type(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| value_matches_type(value, name)),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.is_finite() && n.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sum_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" },
            },
            "required": ["a", "b"],
        })
    }

    #[test]
    fn rejects_non_object_args_when_schema_expects_object() {
        let err = validate_arguments(&json!("5 and 7"), &sum_schema()).unwrap_err();
        assert!(err.contains("expected object arguments"), "{err}");
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = validate_arguments(&json!({ "a": 5 }), &sum_schema()).unwrap_err();
        assert_eq!(err, "missing required field 'b'");
    }

    #[test]
    fn accepts_valid_args_and_extra_fields_by_default() {
        assert!(validate_arguments(&json!({ "a": 5, "b": 7 }), &sum_schema()).is_ok());
        assert!(validate_arguments(&json!({ "a": 5, "b": 7, "c": 1 }), &sum_schema()).is_ok());
    }

    #[test]
    fn rejects_field_with_wrong_type() {
        let err = validate_arguments(&json!({ "a": "5", "b": 7 }), &sum_schema()).unwrap_err();
        assert!(err.contains("field 'a'"));
        assert!(err.contains("expected type 'number'"));
    }

    #[test]
    fn integer_rejects_fractional_numbers() {
        let schema = json!({ "type": "object", "properties": { "n": { "type": "integer" } } });
        assert!(validate_arguments(&json!({ "n": 3 }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "n": 3.5 }), &schema).is_err());
    }

    #[test]
    fn integer_accepts_whole_floats() {
        let schema = json!({ "type": "object", "properties": { "n": { "type": "integer" } } });
        assert!(validate_arguments(&json!({ "n": 5.0 }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "n": -2.0 }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "n": 5.25 }), &schema).is_err());
    }

    #[test]
    fn closed_objects_reject_unknown_fields() {
        let schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "additionalProperties": false,
        });
        let err = validate_arguments(&json!({ "path": "a", "mode": "x" }), &schema).unwrap_err();
        assert_eq!(err, "unexpected field 'mode'");
    }

    #[test]
    fn enum_constrains_values() {
        let schema = json!({
            "type": "object",
            "properties": { "unit": { "type": "string", "enum": ["c", "f"] } },
        });
        assert!(validate_arguments(&json!({ "unit": "c" }), &schema).is_ok());
        let err = validate_arguments(&json!({ "unit": "k" }), &schema).unwrap_err();
        assert!(err.contains("field 'unit' must be one of"));
    }

    #[test]
    fn type_unions_accept_any_member() {
        let schema = json!({
            "type": "object",
            "properties": { "limit": { "type": ["integer", "null"] } },
        });
        assert!(validate_arguments(&json!({ "limit": null }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "limit": 10 }), &schema).is_ok());
        let err = validate_arguments(&json!({ "limit": "ten" }), &schema).unwrap_err();
        assert!(err.contains("'integer | null'"));
    }

    #[test]
    fn nested_objects_and_arrays_report_paths() {
        let schema = json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "id": { "type": "integer" } },
                        "required": ["id"],
                    },
                },
            },
        });

        let err = validate_arguments(&json!({ "items": [{ "id": 1 }, { "id": "x" }] }), &schema)
            .unwrap_err();
        assert!(err.contains("field 'items[1].id'"), "{err}");

        let err = validate_arguments(&json!({ "items": [{}] }), &schema).unwrap_err();
        assert_eq!(err, "missing required field 'items[0].id'");
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_arguments(&json!({ "anything": 42 }), &json!({})).is_ok());
        assert!(validate_arguments(&Value::Null, &json!({})).is_ok());
    }
}
