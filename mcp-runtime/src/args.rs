use metabase_core::error::codes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::ToolError;

fn present<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    args.get(key).filter(|value| !value.is_null())
}

fn invalid(key: &str, message: String) -> ToolError {
    ToolError::new(codes::VALIDATION_FAILED, message).with_field(key)
}

pub(crate) fn arg_bool(
    args: &Map<String, Value>,
    key: &str,
    default: bool,
) -> Result<bool, ToolError> {
    match present(args, key) {
        None => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(invalid(key, format!("'{key}' must be a boolean"))),
    }
}

pub(crate) fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    match present(args, key) {
        None => Err(invalid(key, format!("Missing required field '{key}'"))),
        Some(Value::String(v)) if !v.trim().is_empty() => Ok(v.clone()),
        Some(Value::String(_)) => Err(invalid(key, format!("'{key}' must not be empty"))),
        Some(_) => Err(invalid(key, format!("'{key}' must be a string"))),
    }
}

pub(crate) fn arg_optional_string(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ToolError> {
    match present(args, key) {
        None => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(invalid(key, format!("'{key}' must be a string"))),
    }
}

/// Positive integer id. Numeric strings are accepted since some clients
/// stringify every argument.
pub(crate) fn required_id(args: &Map<String, Value>, key: &str) -> Result<i64, ToolError> {
    arg_optional_id(args, key)?
        .ok_or_else(|| invalid(key, format!("Missing required field '{key}'")))
}

pub(crate) fn arg_optional_id(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<i64>, ToolError> {
    let parsed = match present(args, key) {
        None => return Ok(None),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(id) if id > 0 => Ok(Some(id)),
        _ => Err(invalid(key, format!("'{key}' must be a positive integer"))),
    }
}

pub(crate) fn arg_optional_u64(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<u64>, ToolError> {
    match present(args, key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(key, format!("'{key}' must be a non-negative integer"))),
        Some(_) => Err(invalid(key, format!("'{key}' must be a non-negative integer"))),
    }
}

pub(crate) fn arg_optional_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<Value>>, ToolError> {
    match present(args, key) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(_) => Err(invalid(key, format!("'{key}' must be an array"))),
    }
}

pub(crate) fn required_object(args: &Map<String, Value>, key: &str) -> Result<Value, ToolError> {
    match present(args, key) {
        None => Err(invalid(key, format!("Missing required field '{key}'"))),
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        Some(_) => Err(invalid(key, format!("'{key}' must be an object"))),
    }
}

/// Collection ids are integers, or the literal `root`.
pub(crate) fn required_collection_id(
    args: &Map<String, Value>,
    key: &str,
) -> Result<String, ToolError> {
    match present(args, key) {
        Some(Value::String(s)) if s.trim() == "root" => Ok("root".to_string()),
        _ => required_id(args, key).map(|id| id.to_string()),
    }
}

/// Deserialize the whole argument object into a typed request.
pub(crate) fn parse_args<T: DeserializeOwned>(args: &Map<String, Value>) -> Result<T, ToolError> {
    let cleaned: Map<String, Value> = args
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    serde_json::from_value(Value::Object(cleaned))
        .map_err(|e| ToolError::validation(format!("invalid arguments: {e}")))
}

/// Deserialize one argument into a typed value.
pub(crate) fn parse_arg<T: DeserializeOwned>(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, ToolError> {
    match present(args, key) {
        None => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| invalid(key, format!("invalid '{key}': {e}"))),
    }
}
