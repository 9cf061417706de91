//! Minimal JSON-schema checks for tool descriptors and structured outputs.
//!
//! Covers the subset tool schemas actually use: `type`, `properties`,
//! `required`, `items` and `enum`. Unknown keywords are ignored.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema must be a JSON object")]
    NotAnObject,
    #[error("top-level schema type must be \"object\", found {0}")]
    NotObjectType(String),
    #[error("\"properties\" must be an object")]
    InvalidProperties,
    #[error("\"required\" must be an array of property names")]
    InvalidRequired,
    #[error("required property {0:?} is not declared in \"properties\"")]
    UndeclaredRequired(String),
    #[error("unknown type {0:?}")]
    UnknownType(String),
}

/// Check that `schema` is a well-formed object schema for tool parameters.
pub fn check_object_schema(schema: &Value) -> Result<(), SchemaError> {
    let obj = schema.as_object().ok_or(SchemaError::NotAnObject)?;
    match obj.get("type") {
        Some(Value::String(t)) if t == "object" => {}
        Some(other) => return Err(SchemaError::NotObjectType(other.to_string())),
        None => return Err(SchemaError::NotObjectType("nothing".into())),
    }
    check_nested(schema)?;

    let properties = match obj.get("properties") {
        None => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => return Err(SchemaError::InvalidProperties),
    };
    if let Some(required) = obj.get("required") {
        let names = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        for name in names {
            let name = name.as_str().ok_or(SchemaError::InvalidRequired)?;
            if !properties.is_some_and(|p| p.contains_key(name)) {
                return Err(SchemaError::UndeclaredRequired(name.to_string()));
            }
        }
    }
    Ok(())
}

/// Check that every `type` keyword in the schema tree names a known type.
fn check_nested(schema: &Value) -> Result<(), SchemaError> {
    let Some(obj) = schema.as_object() else {
        return Err(SchemaError::NotAnObject);
    };
    if let Some(Value::String(t)) = obj.get("type") {
        if !KNOWN_TYPES.contains(&t.as_str()) {
            return Err(SchemaError::UnknownType(t.clone()));
        }
    }
    if let Some(props) = obj.get("properties") {
        let props = props.as_object().ok_or(SchemaError::InvalidProperties)?;
        for sub in props.values() {
            check_nested(sub)?;
        }
    }
    if let Some(items) = obj.get("items") {
        check_nested(items)?;
    }
    Ok(())
}

const KNOWN_TYPES: &[&str] = &[
    "object", "array", "string", "number", "integer", "boolean", "null",
];

/// Validate `value` against `schema`. Returns the first violation as a path-prefixed message.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(Value::String(expected)) = obj.get("type") {
        if !type_matches(expected, value) {
            return Err(format!("{path}: expected {expected}, found {}", type_name(value)));
        }
    }

    if let Some(Value::Array(allowed)) = obj.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Value::Object(map) = value {
        if let Some(Value::Array(required)) = obj.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    return Err(format!("{path}: missing required property {name:?}"));
                }
            }
        }
        if let Some(Value::Object(props)) = obj.get("properties") {
            for (name, sub) in props {
                if let Some(v) = map.get(name) {
                    validate_at(sub, v, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, obj.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
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
