use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// The validated application message extracted from a record payload.
///
/// On the wire this is a tagged JSON object:
///
/// ```json
/// {"type": "user.renamed", "payload": {"id": 1, "name": "ada"}, "meta": {"trace": "x"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl<T> Operation<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload,
            meta: None,
        }
    }
}

/// Structural predicate for the tagged operation shape.
pub fn is_operation(value: &Value) -> bool {
    shape_error(value).is_none()
}

fn shape_error(value: &Value) -> Option<&'static str> {
    let Some(object) = value.as_object() else {
        return Some("not an object");
    };

    match object.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => {}
        Some(Value::String(_)) => return Some("empty `type` discriminant"),
        Some(_) => return Some("`type` discriminant is not a string"),
        None => return Some("missing `type` discriminant"),
    }

    if !object.contains_key("payload") {
        return Some("missing `payload`");
    }

    match object.get("meta") {
        None | Some(Value::Null) | Some(Value::Object(_)) => None,
        Some(_) => Some("`meta` is not an object"),
    }
}

/// Turns decoded values into typed operations, all or nothing.
#[derive(Debug)]
pub struct MessageValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for MessageValidator<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for MessageValidator<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T: DeserializeOwned> MessageValidator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, value: Value, offset: Option<i64>) -> Result<Operation<T>, ValidationError> {
        if let Some(reason) = shape_error(&value) {
            return Err(ValidationError {
                value: value.to_string(),
                offset,
                reason: reason.to_string(),
            });
        }

        let rendered = value.to_string();
        serde_json::from_value::<Operation<T>>(value).map_err(|e| ValidationError {
            value: rendered,
            offset,
            reason: e.to_string(),
        })
    }
}
