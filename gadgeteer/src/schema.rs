//! Schema-directed parameter validation and coercion.
//!
//! Marker-block argument values are always strings. Before a gadget runs,
//! its raw arguments are revalidated against the gadget's parameter schema
//! with a coercing pass: a numeric-looking string becomes a number only when
//! the schema expects a number, `"true"`/`"false"` become booleans only when
//! the schema expects a boolean. Failures pinpoint the offending path along
//! with the expected and actual shape.
//!
//! The supported schema subset is the JSON-Schema core that gadget parameter
//! declarations actually use: `type`, `properties`, `required`, `items`,
//! `enum`.

use serde_json::{Map, Value};

/// A validation failure at one path in the argument structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("at '{path}': expected {expected}, got {actual}")]
pub struct SchemaViolation {
    /// JSON-pointer-ish path to the offending value.
    pub path: String,
    /// What the schema wanted.
    pub expected: String,
    /// What was found.
    pub actual: String,
}

impl SchemaViolation {
    fn new(path: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            path: path.to_owned(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Validate `value` against `schema`, coercing string leaves to the
/// schema's expected scalar types.
///
/// # Errors
///
/// Returns the first [`SchemaViolation`] encountered, in document order.
pub fn validate_and_coerce(value: &Value, schema: &Value) -> Result<Value, SchemaViolation> {
    coerce_at("", value, schema)
}

fn coerce_at(path: &str, value: &Value, schema: &Value) -> Result<Value, SchemaViolation> {
    let Some(schema_obj) = schema.as_object() else {
        // An absent or non-object schema constrains nothing.
        return Ok(value.clone());
    };

    let expected_type = schema_obj.get("type").and_then(Value::as_str);
    let coerced = match expected_type {
        Some("object") => coerce_object(path, value, schema_obj)?,
        Some("array") => coerce_array(path, value, schema_obj)?,
        Some("string") => coerce_string(path, value)?,
        Some("number") => coerce_number(path, value)?,
        Some("integer") => coerce_integer(path, value)?,
        Some("boolean") => coerce_boolean(path, value)?,
        Some("null") => {
            if value.is_null() {
                Value::Null
            } else {
                return Err(SchemaViolation::new(path, "null", type_name(value)));
            }
        }
        _ => value.clone(),
    };

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array)
        && !allowed.contains(&coerced)
    {
        return Err(SchemaViolation::new(
            path,
            format!("one of {}", Value::Array(allowed.clone())),
            coerced.to_string(),
        ));
    }

    Ok(coerced)
}

fn coerce_object(
    path: &str,
    value: &Value,
    schema: &Map<String, Value>,
) -> Result<Value, SchemaViolation> {
    let Some(fields) = value.as_object() else {
        return Err(SchemaViolation::new(path, "object", type_name(value)));
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                let expected = properties
                    .get(name)
                    .and_then(|s| s.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("value");
                return Err(SchemaViolation::new(
                    &join(path, name),
                    expected.to_owned(),
                    "missing",
                ));
            }
        }
    }

    let mut out = Map::new();
    for (name, field) in fields {
        let child_path = join(path, name);
        match properties.get(name) {
            Some(field_schema) => {
                out.insert(name.clone(), coerce_at(&child_path, field, field_schema)?);
            }
            // Undeclared fields pass through untouched.
            None => {
                out.insert(name.clone(), field.clone());
            }
        }
    }
    Ok(Value::Object(out))
}

fn coerce_array(
    path: &str,
    value: &Value,
    schema: &Map<String, Value>,
) -> Result<Value, SchemaViolation> {
    let Some(elements) = value.as_array() else {
        return Err(SchemaViolation::new(path, "array", type_name(value)));
    };
    let item_schema = schema.get("items").cloned().unwrap_or(Value::Null);
    let mut out = Vec::with_capacity(elements.len());
    for (index, element) in elements.iter().enumerate() {
        out.push(coerce_at(
            &join(path, &index.to_string()),
            element,
            &item_schema,
        )?);
    }
    Ok(Value::Array(out))
}

fn coerce_string(path: &str, value: &Value) -> Result<Value, SchemaViolation> {
    match value {
        Value::String(_) => Ok(value.clone()),
        other => Err(SchemaViolation::new(path, "string", type_name(other))),
    }
}

fn coerce_number(path: &str, value: &Value) -> Result<Value, SchemaViolation> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| SchemaViolation::new(path, "number", format!("'{s}'"))),
        other => Err(SchemaViolation::new(path, "number", type_name(other))),
    }
}

fn coerce_integer(path: &str, value: &Value) -> Result<Value, SchemaViolation> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| SchemaViolation::new(path, "integer", format!("'{s}'"))),
        other => Err(SchemaViolation::new(path, "integer", type_name(other))),
    }
}

fn coerce_boolean(path: &str, value: &Value) -> Result<Value, SchemaViolation> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::String(s) => match s.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(SchemaViolation::new(path, "boolean", format!("'{other}'"))),
        },
        other => Err(SchemaViolation::new(path, "boolean", type_name(other))),
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

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_owned()
    } else {
        format!("{path}/{segment}")
    }
}
