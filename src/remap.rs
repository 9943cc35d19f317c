//! Lenient field-by-field remapping from a generic JSON value.
//!
//! Upstream APIs are loose about types: ids arrive as numbers or numeric
//! strings, flags as `true`, `1` or `"true"`, and optional fields are either
//! absent or `null`. [`Fields`] reads an object with those coercions so a
//! [`crate::Decode::remap`] implementation stays a short list of accessors.

use serde_json::{Map, Value};

/// A required field was missing or could not be coerced.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RemapError {
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("missing field '{0}'")]
    Missing(String),
    #[error("field '{field}' cannot be read as {expected}")]
    Type {
        field: String,
        expected: &'static str,
    },
}

/// Read-only view over a JSON object with coercing accessors.
#[derive(Clone, Copy, Debug)]
pub struct Fields<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    pub fn new(value: &'a Value) -> Result<Self, RemapError> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            other => Err(RemapError::NotAnObject(kind_name(other))),
        }
    }

    /// Raw value of a present, non-null field.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|value| !value.is_null())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn required(&self, name: &str) -> Result<&'a Value, RemapError> {
        self.get(name)
            .ok_or_else(|| RemapError::Missing(name.to_owned()))
    }

    pub fn str(&self, name: &str) -> Result<String, RemapError> {
        coerce_string(self.required(name)?).ok_or_else(|| type_error(name, "string"))
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<String>, RemapError> {
        self.optional(name, "string", coerce_string)
    }

    pub fn str_or(&self, name: &str, default: &str) -> Result<String, RemapError> {
        Ok(self.opt_str(name)?.unwrap_or_else(|| default.to_owned()))
    }

    pub fn i64(&self, name: &str) -> Result<i64, RemapError> {
        coerce_i64(self.required(name)?).ok_or_else(|| type_error(name, "integer"))
    }

    pub fn opt_i64(&self, name: &str) -> Result<Option<i64>, RemapError> {
        self.optional(name, "integer", coerce_i64)
    }

    pub fn i64_or(&self, name: &str, default: i64) -> Result<i64, RemapError> {
        Ok(self.opt_i64(name)?.unwrap_or(default))
    }

    pub fn u64(&self, name: &str) -> Result<u64, RemapError> {
        coerce_u64(self.required(name)?).ok_or_else(|| type_error(name, "unsigned integer"))
    }

    pub fn opt_u64(&self, name: &str) -> Result<Option<u64>, RemapError> {
        self.optional(name, "unsigned integer", coerce_u64)
    }

    pub fn u64_or(&self, name: &str, default: u64) -> Result<u64, RemapError> {
        Ok(self.opt_u64(name)?.unwrap_or(default))
    }

    pub fn f64(&self, name: &str) -> Result<f64, RemapError> {
        coerce_f64(self.required(name)?).ok_or_else(|| type_error(name, "number"))
    }

    pub fn opt_f64(&self, name: &str) -> Result<Option<f64>, RemapError> {
        self.optional(name, "number", coerce_f64)
    }

    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64, RemapError> {
        Ok(self.opt_f64(name)?.unwrap_or(default))
    }

    pub fn bool(&self, name: &str) -> Result<bool, RemapError> {
        coerce_bool(self.required(name)?).ok_or_else(|| type_error(name, "boolean"))
    }

    pub fn opt_bool(&self, name: &str) -> Result<Option<bool>, RemapError> {
        self.optional(name, "boolean", coerce_bool)
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, RemapError> {
        Ok(self.opt_bool(name)?.unwrap_or(default))
    }

    /// Nested object view. Missing or null yields `None`.
    pub fn object(&self, name: &str) -> Result<Option<Fields<'a>>, RemapError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(Fields { map })),
            Some(_) => Err(type_error(name, "object")),
        }
    }

    /// Array elements. Missing or null yields an empty slice.
    pub fn array(&self, name: &str) -> Result<&'a [Value], RemapError> {
        match self.get(name) {
            None => Ok(&[]),
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(_) => Err(type_error(name, "array")),
        }
    }

    /// Remaps each array element with `f`, failing on the first bad element.
    pub fn list<T, F>(&self, name: &str, f: F) -> Result<Vec<T>, RemapError>
    where
        F: Fn(&'a Value) -> Result<T, RemapError>,
    {
        self.array(name)?.iter().map(f).collect()
    }

    fn optional<T>(
        &self,
        name: &str,
        expected: &'static str,
        coerce: fn(&Value) -> Option<T>,
    ) -> Result<Option<T>, RemapError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => coerce(value)
                .map(Some)
                .ok_or_else(|| type_error(name, expected)),
        }
    }
}

fn type_error(field: &str, expected: &'static str) -> RemapError {
    RemapError::Type {
        field: field.to_owned(),
        expected,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

pub fn coerce_u64(value: &Value) -> Option<u64> {
    coerce_i64(value)
        .and_then(|signed| u64::try_from(signed).ok())
        .or_else(|| match value {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
}

pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok().filter(|float: &f64| float.is_finite()),
        _ => None,
    }
}

pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
